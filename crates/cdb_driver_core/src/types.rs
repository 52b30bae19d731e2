use std::collections::HashMap;
use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Debugger session states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DebuggerState {
    Idle,
    Running,
    Paused,
    Crashed,
    Terminated,
}

impl fmt::Display for DebuggerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Idle => write!(f, "idle"),
            Self::Running => write!(f, "running"),
            Self::Paused => write!(f, "paused"),
            Self::Crashed => write!(f, "crashed"),
            Self::Terminated => write!(f, "terminated"),
        }
    }
}

/// Kinds of events published by a debug session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DebuggerEventKind {
    /// Command sent to the debugger
    Input,
    /// Raw line of debugger output
    Output,
    /// Error message
    Error,
    /// Lifecycle milestone
    System,
    /// Session state changed
    StateChange,
    /// A breakpoint was hit
    BreakpointHit,
    /// An exception was recognized in the output
    Exception,
    /// The target process terminated
    ProcessTerminated,
}

impl DebuggerEventKind {
    pub const ALL: [DebuggerEventKind; 8] = [
        Self::Input,
        Self::Output,
        Self::Error,
        Self::System,
        Self::StateChange,
        Self::BreakpointHit,
        Self::Exception,
        Self::ProcessTerminated,
    ];
}

impl fmt::Display for DebuggerEventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Input => write!(f, "input"),
            Self::Output => write!(f, "output"),
            Self::Error => write!(f, "error"),
            Self::System => write!(f, "system"),
            Self::StateChange => write!(f, "state_change"),
            Self::BreakpointHit => write!(f, "breakpoint_hit"),
            Self::Exception => write!(f, "exception"),
            Self::ProcessTerminated => write!(f, "process_terminated"),
        }
    }
}

/// An event delivered to registered subscribers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DebuggerEvent {
    pub kind: DebuggerEventKind,
    pub content: String,
    pub timestamp_ms: u64,
    #[serde(default)]
    pub data: Option<Value>,
}

impl DebuggerEvent {
    pub fn new(kind: DebuggerEventKind, content: impl Into<String>) -> Self {
        Self {
            kind,
            content: content.into(),
            timestamp_ms: timestamp_millis(),
            data: None,
        }
    }

    pub fn with_data(kind: DebuggerEventKind, content: impl Into<String>, data: Value) -> Self {
        Self {
            kind,
            content: content.into(),
            timestamp_ms: timestamp_millis(),
            data: Some(data),
        }
    }
}

pub fn timestamp_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Where a breakpoint lives: a source location or a resolved symbol.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BreakpointLocation {
    File { path: String, line: u32 },
    Function { name: String },
}

impl fmt::Display for BreakpointLocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::File { path, line } => write!(f, "{path}:{line}"),
            Self::Function { name } => write!(f, "{name}"),
        }
    }
}

/// A registered breakpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BreakpointInfo {
    pub id: u32,
    pub location: BreakpointLocation,
    #[serde(default)]
    pub condition: Option<String>,
    pub enabled: bool,
    pub hit_count: u32,
}

/// A single stack frame parsed from debugger output.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StackFrame {
    pub function_name: String,
    #[serde(default)]
    pub file_path: Option<String>,
    #[serde(default)]
    pub line_number: Option<u32>,
    #[serde(default)]
    pub module_name: Option<String>,
    #[serde(default)]
    pub address: Option<String>,
}

/// Structured crash report assembled after the target crashed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CrashInfo {
    pub exception_type: String,
    pub exception_message: String,
    pub crash_address: String,
    pub stack_trace: Vec<StackFrame>,
    pub registers: HashMap<String, String>,
    pub modules: Vec<String>,
}
