use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;

use crate::events::{EventCallback, SubscriberId};
use crate::types::{
    BreakpointInfo, CrashInfo, DebuggerEvent, DebuggerEventKind, DebuggerState, StackFrame,
};
use crate::Result;

/// The operation table every debugger backend implements.
///
/// A backend wraps one interactive console debugger and manages exactly one
/// debug target. Swapping the wrapped debugger means reimplementing the
/// output-classification patterns and command strings, never the state
/// machine or the concurrency model the caller sees.
#[async_trait]
pub trait Debugger: Send + Sync {
    /// Attach to a running process. The session starts paused: the debugger
    /// breaks in immediately on attach.
    async fn attach(&self, pid: u32) -> Result<()>;

    /// Launch an executable and attach to it; returns the target pid. The
    /// session starts running.
    async fn launch(&self, executable: &Path, args: &[String]) -> Result<u32>;

    /// Quit-and-detach from the target and reset the session to idle.
    async fn detach(&self) -> Result<()>;

    async fn continue_execution(&self) -> Result<()>;
    async fn step_over(&self) -> Result<()>;
    async fn step_into(&self) -> Result<()>;
    async fn step_out(&self) -> Result<()>;

    /// Force a running target to pause via the out-of-band break signal.
    async fn break_into(&self) -> Result<()>;

    /// Set a source-location breakpoint; returns its id.
    async fn set_breakpoint(&self, file: &str, line: u32, condition: Option<&str>)
        -> Result<u32>;

    /// Resolve a function symbol and set a breakpoint on it; returns its id.
    async fn set_function_breakpoint(
        &self,
        function: &str,
        condition: Option<&str>,
    ) -> Result<u32>;

    /// Remove a breakpoint. Returns false (not an error) for an unknown id.
    async fn remove_breakpoint(&self, id: u32) -> Result<bool>;

    async fn get_stack_trace(&self) -> Result<Vec<StackFrame>>;
    async fn get_current_frame(&self) -> Result<Option<StackFrame>>;
    async fn get_local_variables(&self, frame_index: u32) -> Result<HashMap<String, String>>;
    async fn evaluate_expression(&self, expression: &str, frame_index: u32) -> Result<String>;

    /// Block until a breakpoint-hit, exception, or termination event is
    /// published, or the timeout elapses.
    async fn wait_for_event(&self, timeout: Duration) -> Result<Option<DebuggerEvent>>;

    /// Assemble a structured crash report. Requires the crashed state.
    async fn analyze_crash(&self) -> Result<CrashInfo>;

    fn get_state(&self) -> DebuggerState;
    fn is_attached(&self) -> bool;
    fn list_breakpoints(&self) -> Vec<BreakpointInfo>;

    fn register_event_callback(
        &self,
        kind: DebuggerEventKind,
        callback: EventCallback,
    ) -> SubscriberId;
    fn unregister_event_callback(&self, kind: DebuggerEventKind, id: SubscriberId);
}
