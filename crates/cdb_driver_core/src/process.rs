//! Process lifecycle helpers: debugger discovery, target inspection and
//! spawning, and the out-of-band break-in capability.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use serde::Serialize;
use sysinfo::{Pid, ProcessesToUpdate, System};
use tokio::process::{Child, Command};
use tokio::time::sleep;

use crate::error::DriverError;
use crate::Result;

#[cfg(windows)]
const CREATE_NEW_CONSOLE: u32 = 0x0000_0010;
#[cfg(windows)]
const CREATE_NEW_PROCESS_GROUP: u32 = 0x0000_0200;

const WELL_KNOWN_CDB_PATHS: &[&str] = &[
    r"C:\Program Files (x86)\Windows Kits\10\Debuggers\x64\cdb.exe",
    r"C:\Program Files (x86)\Windows Kits\10\Debuggers\x86\cdb.exe",
    r"C:\Program Files\Windows Kits\10\Debuggers\x64\cdb.exe",
    r"C:\Program Files\Windows Kits\10\Debuggers\x86\cdb.exe",
    r"C:\Program Files (x86)\Windows Kits\8.1\Debuggers\x64\cdb.exe",
    r"C:\Program Files (x86)\Windows Kits\8.1\Debuggers\x86\cdb.exe",
];

/// Locate the console debugger binary. An explicit configured path wins;
/// otherwise `PATH` and the well-known SDK install locations are probed.
/// Failing here happens at driver construction, never at use time.
pub fn find_debugger(explicit: Option<&Path>) -> Result<PathBuf> {
    if let Some(path) = explicit {
        if path.exists() {
            return Ok(path.to_path_buf());
        }
        return Err(DriverError::DebuggerNotFound(
            path.to_string_lossy().into_owned(),
        ));
    }

    if let Some(path) = search_path_env("cdb.exe") {
        return Ok(path);
    }

    for candidate in WELL_KNOWN_CDB_PATHS {
        let path = Path::new(candidate);
        if path.exists() {
            return Ok(path.to_path_buf());
        }
    }

    Err(DriverError::DebuggerNotFound(
        "cdb.exe not found; install the Windows SDK debugging tools or set an explicit path"
            .to_string(),
    ))
}

fn search_path_env(binary: &str) -> Option<PathBuf> {
    let path_var = std::env::var_os("PATH")?;
    std::env::split_paths(&path_var)
        .map(|dir| dir.join(binary))
        .find(|candidate| candidate.is_file())
}

/// Summary of a running process, for the listing helper.
#[derive(Debug, Clone, Serialize)]
pub struct ProcessInfo {
    pub pid: u32,
    pub name: String,
    pub exe_path: Option<String>,
    pub cmd: Vec<String>,
}

pub fn pid_exists(pid: u32) -> bool {
    let mut system = System::new();
    system.refresh_processes(ProcessesToUpdate::Some(&[Pid::from_u32(pid)]));
    system.process(Pid::from_u32(pid)).is_some()
}

pub fn list_processes() -> Vec<ProcessInfo> {
    let mut system = System::new();
    system.refresh_processes(ProcessesToUpdate::All);
    system
        .processes()
        .iter()
        .map(|(pid, process)| ProcessInfo {
            pid: pid.as_u32(),
            name: process.name().to_string_lossy().into_owned(),
            exe_path: process.exe().map(|p| p.to_string_lossy().into_owned()),
            cmd: process
                .cmd()
                .iter()
                .map(|arg| arg.to_string_lossy().into_owned())
                .collect(),
        })
        .collect()
}

/// Spawn the target process detached from the debugger (a separate console
/// on Windows). The debugger attaches to it afterwards.
pub fn spawn_target(executable: &Path, args: &[String]) -> Result<Child> {
    let mut command = Command::new(executable);
    command.args(args);
    #[cfg(windows)]
    command.creation_flags(CREATE_NEW_CONSOLE);
    #[cfg(not(windows))]
    {
        command.stdout(Stdio::null());
        command.stderr(Stdio::null());
    }
    command
        .spawn()
        .map_err(|e| DriverError::LaunchFailure(format!("{}: {e}", executable.display())))
}

/// Spawn the console debugger bound to `pid` with piped stdio.
/// `continue_on_attach` adds the initial `g`, used by the attach path so the
/// target keeps running after the debugger breaks in.
pub fn spawn_debugger(debugger: &Path, pid: u32, continue_on_attach: bool) -> Result<Child> {
    let mut command = Command::new(debugger);
    command.arg("-p").arg(pid.to_string());
    if continue_on_attach {
        command.arg("-c").arg("g");
    }
    command.arg("-lines");
    command
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::inherit())
        .kill_on_drop(true);
    #[cfg(windows)]
    command.creation_flags(CREATE_NEW_PROCESS_GROUP);
    command
        .spawn()
        .map_err(|e| DriverError::AttachFailure(format!("failed to spawn debugger: {e}")))
}

/// Force a running target into a paused state without a queued command: run
/// the external break helper against the pid and give the debugger a moment
/// to settle at its prompt.
pub async fn break_into(helper: &Path, pid: u32, settle_delay: Duration) -> Result<()> {
    Command::new(helper)
        .arg(pid.to_string())
        .spawn()
        .map_err(|e| {
            DriverError::AttachFailure(format!(
                "break-in helper '{}' failed to start: {e}",
                helper.display()
            ))
        })?;
    sleep(settle_delay).await;
    Ok(())
}
