//! cdb Driver Core
//!
//! An async library that automates a native console debugger (cdb.exe) and
//! exposes it as synchronous, typed operations: attach, launch, step,
//! breakpoints, stack/variable inspection, crash analysis. The debugger is an
//! unframed text stream; a background monitor task classifies its output,
//! drives the session state machine, and gates command dispatch on prompt
//! detection.

pub mod config;
pub mod debugger;
pub mod driver;
pub mod error;
pub mod events;
pub mod factory;
pub mod monitor;
pub mod parse;
pub mod process;
pub mod session;
pub mod types;

pub use config::DriverConfig;
pub use debugger::Debugger;
pub use driver::CdbDriver;
pub use error::DriverError;
pub use events::{EventCallback, EventHub, SubscriberId};
pub use factory::new_debugger;
pub use types::{
    BreakpointInfo, BreakpointLocation, CrashInfo, DebuggerEvent, DebuggerEventKind,
    DebuggerState, StackFrame,
};

/// Result type alias using DriverError
pub type Result<T> = std::result::Result<T, DriverError>;
