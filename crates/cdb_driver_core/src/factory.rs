//! Platform-aware construction of [`Debugger`] backends.

use crate::config::DriverConfig;
use crate::debugger::Debugger;
use crate::driver::CdbDriver;
use crate::error::DriverError;
use crate::Result;

/// Build the debugger backend for this platform.
///
/// Windows always gets the console-debugger driver. On other platforms an
/// explicitly configured debugger path is honored (used with stand-in
/// backends under test); without one there is nothing to drive.
pub fn new_debugger(config: DriverConfig) -> Result<Box<dyn Debugger>> {
    if cfg!(windows) || config.debugger_path.is_some() {
        return Ok(Box::new(CdbDriver::new(config)?));
    }
    Err(DriverError::UnsupportedPlatform(format!(
        "no debugger backend for {}",
        std::env::consts::OS
    )))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[cfg(unix)]
    #[test]
    fn unconfigured_non_windows_platform_is_unsupported() {
        let result = new_debugger(DriverConfig::default());
        assert!(matches!(
            result.err(),
            Some(DriverError::UnsupportedPlatform(_))
        ));
    }

    #[cfg(unix)]
    #[test]
    fn explicit_debugger_path_selects_console_driver() {
        let config = DriverConfig {
            debugger_path: Some("/bin/sh".into()),
            ..DriverConfig::default()
        };
        let debugger = new_debugger(config).expect("driver for explicit path");
        assert_eq!(
            debugger.get_state(),
            crate::types::DebuggerState::Idle
        );
    }
}
