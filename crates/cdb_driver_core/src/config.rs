use std::path::PathBuf;
use std::time::Duration;

/// Driver configuration. Passed explicitly into the factory/constructor;
/// there is no process-wide singleton.
#[derive(Debug, Clone)]
pub struct DriverConfig {
    /// Explicit path to the console debugger binary. When unset, the driver
    /// searches the well-known installation locations at construction time.
    pub debugger_path: Option<PathBuf>,
    /// Helper executable used to force a break-in on a running target.
    pub break_helper_path: PathBuf,
    /// Delay between launching a target process and attaching the debugger,
    /// so the target can finish initializing.
    pub launch_grace_delay: Duration,
    /// Settle delay after invoking the break-in helper.
    pub break_settle_delay: Duration,
    /// How long to wait for the debugger's first prompt after spawn.
    pub ready_timeout: Duration,
    /// Default output-collection window for short commands.
    pub command_timeout: Duration,
    /// Output-collection window for stack traces, which can be slow under load.
    pub stack_trace_timeout: Duration,
    /// How long detach waits for the debugger process to exit.
    pub detach_timeout: Duration,
    /// Bound on waiting for the command queue to drain.
    pub queue_drain_timeout: Duration,
}

impl Default for DriverConfig {
    fn default() -> Self {
        Self {
            debugger_path: None,
            break_helper_path: PathBuf::from("inject_break.exe"),
            launch_grace_delay: Duration::from_secs(3),
            break_settle_delay: Duration::from_secs(1),
            ready_timeout: Duration::from_secs(60),
            command_timeout: Duration::from_secs(2),
            stack_trace_timeout: Duration::from_secs(60),
            detach_timeout: Duration::from_secs(5),
            queue_drain_timeout: Duration::from_secs(10),
        }
    }
}

impl DriverConfig {
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Ok(path) = std::env::var("CDB_PATH") {
            config.debugger_path = Some(PathBuf::from(path));
        }
        if let Ok(path) = std::env::var("CDB_BREAK_HELPER") {
            config.break_helper_path = PathBuf::from(path);
        }
        if let Some(delay) = duration_from_env("CDB_LAUNCH_GRACE_MS") {
            config.launch_grace_delay = delay;
        }
        if let Some(delay) = duration_from_env("CDB_READY_TIMEOUT_MS") {
            config.ready_timeout = delay;
        }
        if let Some(delay) = duration_from_env("CDB_COMMAND_TIMEOUT_MS") {
            config.command_timeout = delay;
        }

        config
    }
}

fn duration_from_env(name: &str) -> Option<Duration> {
    std::env::var(name)
        .ok()
        .and_then(|v| v.parse::<u64>().ok())
        .map(Duration::from_millis)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_tunables() {
        let config = DriverConfig::default();
        assert!(config.debugger_path.is_none());
        assert_eq!(config.launch_grace_delay, Duration::from_secs(3));
        assert_eq!(config.command_timeout, Duration::from_secs(2));
        assert_eq!(config.stack_trace_timeout, Duration::from_secs(60));
        assert_eq!(config.detach_timeout, Duration::from_secs(5));
    }

    #[test]
    fn duration_from_env_parses_milliseconds() {
        // Unique name so no parallel test observes or clobbers it.
        let var = "CDB_DRIVER_TEST_GRACE_MS_8231";
        std::env::set_var(var, "250");
        assert_eq!(duration_from_env(var), Some(Duration::from_millis(250)));

        std::env::set_var(var, "not a number");
        assert_eq!(duration_from_env(var), None);

        std::env::remove_var(var);
        assert_eq!(duration_from_env(var), None);
    }
}
