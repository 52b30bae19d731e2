use std::time::Duration;
use thiserror::Error;

use crate::types::DebuggerState;

#[derive(Error, Debug)]
pub enum DriverError {
    #[error("Attach failed: {0}")]
    AttachFailure(String),

    #[error("Launch failed: {0}")]
    LaunchFailure(String),

    #[error("Breakpoint operation failed: {0}")]
    BreakpointFailure(String),

    #[error("Operation '{operation}' not allowed in state '{state}'")]
    NotReady {
        operation: &'static str,
        state: DebuggerState,
    },

    #[error("Timed out after {0:?} waiting for {1}")]
    Timeout(Duration, &'static str),

    #[error("Debugger binary not found: {0}")]
    DebuggerNotFound(String),

    #[error("Unsupported platform: {0}")]
    UnsupportedPlatform(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl DriverError {
    pub fn not_ready(operation: &'static str, state: DebuggerState) -> Self {
        Self::NotReady { operation, state }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn not_ready_display_names_operation_and_state() {
        let err = DriverError::not_ready("continue_execution", DebuggerState::Idle);
        assert_eq!(
            err.to_string(),
            "Operation 'continue_execution' not allowed in state 'idle'"
        );
    }

    #[test]
    fn io_error_conversion() {
        let io_err = std::io::Error::new(std::io::ErrorKind::BrokenPipe, "pipe closed");
        let err: DriverError = io_err.into();
        assert!(matches!(err, DriverError::Io(_)));
    }

    #[test]
    fn timeout_display_includes_bound() {
        let err = DriverError::Timeout(Duration::from_secs(5), "debugger exit");
        assert_eq!(err.to_string(), "Timed out after 5s waiting for debugger exit");
    }
}
