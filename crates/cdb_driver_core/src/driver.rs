//! The cdb-backed debugger driver.
//!
//! Owns the debugger and target child processes, the command queue feeding
//! the monitor task, and the synchronous bridge that lets a caller block for
//! the output of a specific command.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::process::Child;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout, Instant};

use crate::config::DriverConfig;
use crate::debugger::Debugger;
use crate::error::DriverError;
use crate::events::{EventCallback, SubscriberId};
use crate::monitor::Monitor;
use crate::parse;
use crate::process;
use crate::session::SessionShared;
use crate::types::{
    BreakpointInfo, BreakpointLocation, CrashInfo, DebuggerEvent, DebuggerEventKind,
    DebuggerState, StackFrame,
};
use crate::Result;

const CURRENT_FRAME_TIMEOUT: Duration = Duration::from_secs(10);
const FUNCTION_BREAKPOINT_TIMEOUT: Duration = Duration::from_secs(10);

/// Per-attachment resources, torn down on detach.
struct ActiveSession {
    debugger: Child,
    target: Option<Child>,
    cmd_tx: mpsc::UnboundedSender<String>,
    output_rx: mpsc::UnboundedReceiver<String>,
    monitor: JoinHandle<()>,
}

pub struct CdbDriver {
    config: DriverConfig,
    debugger_path: PathBuf,
    shared: Arc<SessionShared>,
    active: Mutex<Option<ActiveSession>>,
}

impl CdbDriver {
    /// Fails at construction when no console debugger binary can be found;
    /// a driver that exists can always spawn its backend.
    pub fn new(config: DriverConfig) -> Result<Self> {
        let debugger_path = process::find_debugger(config.debugger_path.as_deref())?;
        tracing::info!("using console debugger at {}", debugger_path.display());
        Ok(Self {
            config,
            debugger_path,
            shared: SessionShared::new(),
            active: Mutex::new(None),
        })
    }

    fn start_session(&self, mut debugger: Child, target: Option<Child>) -> Result<ActiveSession> {
        let stdin = debugger.stdin.take().ok_or_else(|| {
            DriverError::AttachFailure("debugger spawned without stdin pipe".into())
        })?;
        let stdout = debugger.stdout.take().ok_or_else(|| {
            DriverError::AttachFailure("debugger spawned without stdout pipe".into())
        })?;

        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let (output_tx, output_rx) = mpsc::unbounded_channel();
        let monitor = tokio::spawn(
            Monitor::new(self.shared.clone(), stdout, stdin, cmd_rx, output_tx).run(),
        );

        Ok(ActiveSession {
            debugger,
            target,
            cmd_tx,
            output_rx,
            monitor,
        })
    }

    async fn wait_until_ready(&self, bound: Duration) -> Result<()> {
        let deadline = Instant::now() + bound;
        loop {
            let notified = self.shared.ready_notify.notified();
            if self.shared.is_ready() {
                return Ok(());
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(DriverError::Timeout(bound, "debugger ready prompt"));
            }
            let _ = timeout(remaining, notified).await;
        }
    }

    async fn wait_for_queue_drain(&self, bound: Duration) -> bool {
        let deadline = Instant::now() + bound;
        loop {
            let notified = self.shared.queue_drained.notified();
            if self.shared.queue_is_empty() {
                return true;
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return false;
            }
            let _ = timeout(remaining, notified).await;
        }
    }

    /// Enqueue a command for the monitor to release on the next prompt.
    fn submit(&self, active: &ActiveSession, command: impl Into<String>) -> Result<()> {
        let command = command.into();
        self.shared.events.publish(DebuggerEvent::new(
            DebuggerEventKind::Input,
            format!("Command queued: {command}"),
        ));
        self.shared.command_queued();
        active.cmd_tx.send(command).map_err(|_| {
            self.shared.command_dispatched();
            DriverError::Io(std::io::Error::new(
                std::io::ErrorKind::BrokenPipe,
                "monitor task is not running",
            ))
        })
    }

    /// Synchronous bridge: drain stale output, submit, then collect every
    /// forwarded line until a prompt-terminated line or the deadline. A
    /// timeout is soft; whatever was collected is returned.
    async fn command_with_output(
        &self,
        active: &mut ActiveSession,
        command: &str,
        wait: Duration,
    ) -> Result<String> {
        while active.output_rx.try_recv().is_ok() {}

        self.submit(active, command)?;

        let deadline = Instant::now() + wait;
        let mut lines = Vec::new();
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                break;
            }
            match timeout(remaining, active.output_rx.recv()).await {
                Ok(Some(line)) => {
                    let complete = line.trim_end().ends_with('>');
                    lines.push(line);
                    if complete {
                        break;
                    }
                }
                Ok(None) | Err(_) => break,
            }
        }
        Ok(lines.join("\n"))
    }

    fn require_state(&self, operation: &'static str, allowed: &[DebuggerState]) -> Result<()> {
        let state = self.shared.state();
        if allowed.contains(&state) {
            Ok(())
        } else {
            Err(DriverError::not_ready(operation, state))
        }
    }

    async fn break_into_target(&self) -> Result<()> {
        if self.shared.state() == DebuggerState::Paused {
            return Ok(());
        }
        let pid = self
            .shared
            .session()
            .target_pid
            .ok_or_else(|| DriverError::AttachFailure("no target process".into()))?;
        process::break_into(
            &self.config.break_helper_path,
            pid,
            self.config.break_settle_delay,
        )
        .await
    }

    async fn cleanup_failed_spawn(&self, mut active: ActiveSession) {
        active.monitor.abort();
        let _ = active.debugger.kill().await;
        if let Some(mut target) = active.target.take() {
            let _ = target.kill().await;
        }
        self.shared.reset_for_detach();
    }

    fn system_event(&self, content: impl Into<String>) {
        self.shared
            .events
            .publish(DebuggerEvent::new(DebuggerEventKind::System, content));
    }
}

#[async_trait]
impl Debugger for CdbDriver {
    async fn attach(&self, pid: u32) -> Result<()> {
        let mut guard = self.active.lock().await;
        if guard.is_some() {
            return Err(DriverError::AttachFailure(
                "a debug session is already active; detach first".into(),
            ));
        }
        if !process::pid_exists(pid) {
            return Err(DriverError::AttachFailure(format!(
                "process {pid} is not running"
            )));
        }

        self.system_event(format!("Attaching to process {pid}"));
        let debugger = process::spawn_debugger(&self.debugger_path, pid, true)?;
        let active = self.start_session(debugger, None)?;

        {
            let mut session = self.shared.session();
            session.target_pid = Some(pid);
        }
        // The debugger breaks in immediately on attach.
        self.shared.set_state(DebuggerState::Paused);

        if let Err(e) = self.wait_until_ready(self.config.ready_timeout).await {
            self.cleanup_failed_spawn(active).await;
            return Err(DriverError::AttachFailure(format!(
                "debugger did not become ready: {e}"
            )));
        }

        *guard = Some(active);
        Ok(())
    }

    async fn launch(&self, executable: &Path, args: &[String]) -> Result<u32> {
        let mut guard = self.active.lock().await;
        if guard.is_some() {
            return Err(DriverError::LaunchFailure(
                "a debug session is already active; detach first".into(),
            ));
        }
        if !executable.exists() {
            return Err(DriverError::LaunchFailure(format!(
                "executable not found: {}",
                executable.display()
            )));
        }

        self.system_event(format!("Launching process: {}", executable.display()));
        let target = process::spawn_target(executable, args)?;
        let pid = target
            .id()
            .ok_or_else(|| DriverError::LaunchFailure("target exited during spawn".into()))?;

        // Give the target a moment to initialize before the debugger binds.
        sleep(self.config.launch_grace_delay).await;

        let debugger = process::spawn_debugger(&self.debugger_path, pid, false)?;
        let active = self.start_session(debugger, Some(target))?;

        {
            let mut session = self.shared.session();
            session.target_pid = Some(pid);
            session.module_name = executable
                .file_stem()
                .map(|stem| stem.to_string_lossy().into_owned());
        }
        self.shared.set_state(DebuggerState::Running);

        if let Err(e) = self.wait_until_ready(self.config.ready_timeout).await {
            self.cleanup_failed_spawn(active).await;
            return Err(DriverError::LaunchFailure(format!(
                "debugger did not become ready: {e}"
            )));
        }

        // Augment the symbol path with the executable's directory, reload
        // symbols, switch to source mode, and resume the target.
        let symbol_dir = executable
            .parent()
            .map(|dir| dir.to_string_lossy().into_owned())
            .unwrap_or_else(|| ".".to_string());
        self.submit(&active, ".sympath")?;
        self.submit(&active, format!(".sympath+ {symbol_dir}"))?;
        self.submit(&active, ".reload")?;
        self.submit(&active, "l+t")?;
        self.submit(&active, "g")?;
        if !self
            .wait_for_queue_drain(self.config.queue_drain_timeout)
            .await
        {
            tracing::warn!("startup command queue did not drain in time");
        }

        *guard = Some(active);
        Ok(pid)
    }

    async fn detach(&self) -> Result<()> {
        let mut guard = self.active.lock().await;
        let Some(mut active) = guard.take() else {
            self.shared.reset_for_detach();
            return Ok(());
        };

        let state = self.shared.state();
        if state != DebuggerState::Paused && state != DebuggerState::Terminated {
            if let Err(e) = self.break_into_target().await {
                tracing::warn!("break-in before detach failed: {e}");
            }
        }

        self.shared.begin_detach();
        // Once the session terminated the monitor has exited and there is
        // nothing left to quit; just reap the child below. A failed submit
        // must not leave the session stuck in its old state either.
        if self.shared.state() != DebuggerState::Terminated {
            if let Err(e) = self.submit(&active, "qd") {
                tracing::warn!("quit command could not be queued: {e}");
            }
        }

        let exited = timeout(self.config.detach_timeout, active.debugger.wait()).await;
        // A launched target keeps running after detach; dropping the handle
        // does not kill it.
        drop(active.target.take());

        match exited {
            Ok(_) => {
                self.shared.reset_for_detach();
                self.system_event("Detached from target");
                Ok(())
            }
            Err(_) => {
                let _ = active.debugger.kill().await;
                active.monitor.abort();
                self.shared.reset_for_detach();
                Err(DriverError::Timeout(
                    self.config.detach_timeout,
                    "debugger exit on detach",
                ))
            }
        }
    }

    async fn continue_execution(&self) -> Result<()> {
        self.require_state("continue_execution", &[DebuggerState::Paused])?;
        let guard = self.active.lock().await;
        let active = guard
            .as_ref()
            .ok_or(DriverError::not_ready("continue_execution", DebuggerState::Idle))?;
        self.submit(active, "g")
    }

    async fn step_over(&self) -> Result<()> {
        self.require_state("step_over", &[DebuggerState::Paused])?;
        let mut guard = self.active.lock().await;
        let active = guard
            .as_mut()
            .ok_or(DriverError::not_ready("step_over", DebuggerState::Idle))?;
        self.command_with_output(active, "p", self.config.command_timeout)
            .await?;
        Ok(())
    }

    async fn step_into(&self) -> Result<()> {
        self.require_state("step_into", &[DebuggerState::Paused])?;
        let mut guard = self.active.lock().await;
        let active = guard
            .as_mut()
            .ok_or(DriverError::not_ready("step_into", DebuggerState::Idle))?;
        self.command_with_output(active, "t", self.config.command_timeout)
            .await?;
        Ok(())
    }

    async fn step_out(&self) -> Result<()> {
        self.require_state("step_out", &[DebuggerState::Paused])?;
        let guard = self.active.lock().await;
        let active = guard
            .as_ref()
            .ok_or(DriverError::not_ready("step_out", DebuggerState::Idle))?;
        self.submit(active, "gu")
    }

    async fn break_into(&self) -> Result<()> {
        self.break_into_target().await
    }

    async fn set_breakpoint(
        &self,
        file: &str,
        line: u32,
        condition: Option<&str>,
    ) -> Result<u32> {
        let guard = self.active.lock().await;
        let active = guard.as_ref().ok_or_else(|| {
            DriverError::BreakpointFailure("debugger not attached".into())
        })?;

        let mut command = format!("bp `{file}:{line}`");
        if let Some(condition) = condition {
            command.push_str(&format!(" \"{condition}\""));
        }
        self.submit(active, command)?;

        let mut session = self.shared.session();
        let id = session.next_breakpoint_id();
        session.breakpoints.insert(
            id,
            BreakpointInfo {
                id,
                location: BreakpointLocation::File {
                    path: file.to_string(),
                    line,
                },
                condition: condition.map(str::to_string),
                enabled: true,
                hit_count: 0,
            },
        );
        Ok(id)
    }

    async fn set_function_breakpoint(
        &self,
        function: &str,
        condition: Option<&str>,
    ) -> Result<u32> {
        let mut guard = self.active.lock().await;
        if guard.is_none() {
            return Err(DriverError::BreakpointFailure(
                "debugger not attached".into(),
            ));
        }

        // Symbol lookup needs the debugger at its prompt; pause a running
        // target first and restore it afterwards.
        let prior_state = self.shared.state();
        if prior_state == DebuggerState::Running {
            self.break_into_target().await?;
        }

        let active = guard.as_mut().ok_or_else(|| {
            DriverError::BreakpointFailure("debugger not attached".into())
        })?;

        let module = self.shared.session().module_name.clone();
        let mut output = match &module {
            Some(module) => {
                self.command_with_output(
                    active,
                    &format!("x {module}!{function}"),
                    self.config.command_timeout,
                )
                .await?
            }
            None => String::new(),
        };
        if output.trim().is_empty() || output.contains("Couldn't resolve") {
            output = self
                .command_with_output(
                    active,
                    &format!("x *!{function}"),
                    self.config.command_timeout,
                )
                .await?;
        }

        let symbol = output
            .lines()
            .filter(|line| !line.contains("WARNING"))
            .find_map(parse::parse_symbol)
            .ok_or_else(|| {
                DriverError::BreakpointFailure(format!(
                    "could not resolve function symbol: {function}"
                ))
            })?;

        let resolved = format!("{}!{function}", symbol.module);
        let mut command = format!("bp {resolved}");
        if let Some(condition) = condition {
            command.push_str(&format!(" \"{condition}\""));
        }
        self.command_with_output(active, &command, FUNCTION_BREAKPOINT_TIMEOUT)
            .await?;

        let id = {
            let mut session = self.shared.session();
            let id = session.next_breakpoint_id();
            session.breakpoints.insert(
                id,
                BreakpointInfo {
                    id,
                    location: BreakpointLocation::Function { name: resolved },
                    condition: condition.map(str::to_string),
                    enabled: true,
                    hit_count: 0,
                },
            );
            id
        };

        if prior_state == DebuggerState::Running {
            self.submit(active, "g")?;
            if !self
                .wait_for_queue_drain(self.config.queue_drain_timeout)
                .await
            {
                tracing::warn!("resume after symbol lookup was not dispatched in time");
            }
        }
        Ok(id)
    }

    async fn remove_breakpoint(&self, id: u32) -> Result<bool> {
        let location = match self.shared.session().breakpoints.get(&id) {
            Some(info) => info.location.clone(),
            None => return Ok(false),
        };

        let guard = self.active.lock().await;
        let active = guard.as_ref().ok_or_else(|| {
            DriverError::BreakpointFailure("debugger not attached".into())
        })?;

        let command = match &location {
            BreakpointLocation::File { path, line } => format!("bc `{path}:{line}`"),
            BreakpointLocation::Function { name } => format!("bc {name}"),
        };
        self.submit(active, command)?;
        self.shared.session().breakpoints.remove(&id);
        Ok(true)
    }

    async fn get_stack_trace(&self) -> Result<Vec<StackFrame>> {
        self.require_state(
            "get_stack_trace",
            &[DebuggerState::Paused, DebuggerState::Crashed],
        )?;
        let mut guard = self.active.lock().await;
        let active = guard
            .as_mut()
            .ok_or(DriverError::not_ready("get_stack_trace", DebuggerState::Idle))?;

        let output = self
            .command_with_output(active, "k", self.config.stack_trace_timeout)
            .await?;
        Ok(output.lines().filter_map(parse::parse_frame).collect())
    }

    async fn get_current_frame(&self) -> Result<Option<StackFrame>> {
        self.require_state(
            "get_current_frame",
            &[DebuggerState::Paused, DebuggerState::Crashed],
        )?;
        let mut guard = self.active.lock().await;
        let active = guard
            .as_mut()
            .ok_or(DriverError::not_ready("get_current_frame", DebuggerState::Idle))?;

        let output = self
            .command_with_output(active, "k1", CURRENT_FRAME_TIMEOUT)
            .await?;
        Ok(output.lines().find_map(parse::parse_frame))
    }

    async fn get_local_variables(&self, frame_index: u32) -> Result<HashMap<String, String>> {
        self.require_state(
            "get_local_variables",
            &[DebuggerState::Paused, DebuggerState::Crashed],
        )?;
        let mut guard = self.active.lock().await;
        let active = guard
            .as_mut()
            .ok_or(DriverError::not_ready("get_local_variables", DebuggerState::Idle))?;

        if frame_index > 0 {
            self.command_with_output(
                active,
                &format!(".frame {frame_index}"),
                self.config.command_timeout,
            )
            .await?;
        }
        let output = self
            .command_with_output(active, "dv", self.config.command_timeout)
            .await?;
        Ok(parse::parse_variables(&output))
    }

    async fn evaluate_expression(&self, expression: &str, frame_index: u32) -> Result<String> {
        self.require_state(
            "evaluate_expression",
            &[DebuggerState::Paused, DebuggerState::Crashed],
        )?;
        let mut guard = self.active.lock().await;
        let active = guard
            .as_mut()
            .ok_or(DriverError::not_ready("evaluate_expression", DebuggerState::Idle))?;

        if frame_index > 0 {
            self.command_with_output(
                active,
                &format!(".frame {frame_index}"),
                self.config.command_timeout,
            )
            .await?;
        }
        let output = self
            .command_with_output(
                active,
                &format!("? {expression}"),
                self.config.command_timeout,
            )
            .await?;
        Ok(extract_evaluation(&output))
    }

    async fn wait_for_event(&self, bound: Duration) -> Result<Option<DebuggerEvent>> {
        let (tx, mut rx) = mpsc::unbounded_channel();

        // STATE_CHANGE is deliberately excluded: it fires during normal
        // command-queue processing and would satisfy the wait spuriously.
        let kinds = [
            DebuggerEventKind::BreakpointHit,
            DebuggerEventKind::Exception,
            DebuggerEventKind::ProcessTerminated,
        ];
        let subscriptions: Vec<_> = kinds
            .iter()
            .map(|&kind| {
                let tx = tx.clone();
                let id = self.shared.events.register(kind, move |event| {
                    let _ = tx.send(event);
                });
                (kind, id)
            })
            .collect();

        let received = timeout(bound, rx.recv()).await.ok().flatten();

        for (kind, id) in subscriptions {
            self.shared.events.unregister(kind, id);
        }
        Ok(received)
    }

    async fn analyze_crash(&self) -> Result<CrashInfo> {
        self.require_state("analyze_crash", &[DebuggerState::Crashed])?;
        let mut guard = self.active.lock().await;
        let active = guard
            .as_mut()
            .ok_or(DriverError::not_ready("analyze_crash", DebuggerState::Idle))?;

        let exception_record = self
            .command_with_output(active, ".exr -1", self.config.command_timeout)
            .await?;
        let stack_output = self
            .command_with_output(active, "k", self.config.stack_trace_timeout)
            .await?;
        let register_output = self
            .command_with_output(active, "r", self.config.command_timeout)
            .await?;

        // Unparseable fields degrade to placeholders, never abort.
        let exception_type = self
            .shared
            .session()
            .last_exception
            .as_ref()
            .map(|exc| exc.description.clone())
            .unwrap_or_else(|| "Unknown".to_string());

        Ok(CrashInfo {
            exception_type,
            exception_message: exception_record,
            crash_address: "Unknown".to_string(),
            stack_trace: stack_output.lines().filter_map(parse::parse_frame).collect(),
            registers: parse::parse_registers(&register_output),
            modules: Vec::new(),
        })
    }

    fn get_state(&self) -> DebuggerState {
        self.shared.state()
    }

    fn is_attached(&self) -> bool {
        matches!(
            self.shared.state(),
            DebuggerState::Running | DebuggerState::Paused
        )
    }

    fn list_breakpoints(&self) -> Vec<BreakpointInfo> {
        let mut breakpoints: Vec<BreakpointInfo> =
            self.shared.session().breakpoints.values().cloned().collect();
        breakpoints.sort_by_key(|bp| bp.id);
        breakpoints
    }

    fn register_event_callback(
        &self,
        kind: DebuggerEventKind,
        callback: EventCallback,
    ) -> SubscriberId {
        self.shared.events.register_callback(kind, callback)
    }

    fn unregister_event_callback(&self, kind: DebuggerEventKind, id: SubscriberId) {
        self.shared.events.unregister(kind, id);
    }
}

/// `? expr` replies with a line like ``Evaluate expression: 4 = 00000000`00000004``;
/// fall back to the last non-prompt line when the marker is absent.
fn extract_evaluation(output: &str) -> String {
    for line in output.lines().rev() {
        let line = line.trim();
        if line.is_empty() || parse::ends_with_prompt(line) {
            continue;
        }
        if let Some(idx) = line.find("Evaluate expression:") {
            return line[idx + "Evaluate expression:".len()..].trim().to_string();
        }
        return line.to_string();
    }
    output.trim().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extract_evaluation_prefers_marker_line() {
        let output = "? 2+2\nEvaluate expression: 4 = 00000000`00000004\n0:000>";
        assert_eq!(extract_evaluation(output), "4 = 00000000`00000004");
    }

    #[test]
    fn extract_evaluation_falls_back_to_last_line() {
        let output = "int 4\n0:000> ";
        assert_eq!(extract_evaluation(output), "int 4");
        assert_eq!(extract_evaluation(""), "");
    }

    #[cfg(unix)]
    mod stub {
        use super::*;
        use std::sync::atomic::{AtomicU32, Ordering};

        static STUB_COUNTER: AtomicU32 = AtomicU32::new(0);

        /// Write an executable stub shell script playing the debugger role.
        fn write_stub(body: &str) -> PathBuf {
            use std::os::unix::fs::PermissionsExt;

            let dir = std::env::temp_dir().join(format!(
                "cdb_driver_stub_{}_{}",
                std::process::id(),
                STUB_COUNTER.fetch_add(1, Ordering::SeqCst)
            ));
            std::fs::create_dir_all(&dir).expect("stub dir");
            let path = dir.join("stub_debugger.sh");
            std::fs::write(&path, body).expect("stub script");
            let mut perms = std::fs::metadata(&path).expect("stub metadata").permissions();
            perms.set_mode(0o755);
            std::fs::set_permissions(&path, perms).expect("stub permissions");
            path
        }

        fn test_config(stub: PathBuf) -> DriverConfig {
            DriverConfig {
                debugger_path: Some(stub),
                launch_grace_delay: Duration::from_millis(10),
                ready_timeout: Duration::from_secs(5),
                command_timeout: Duration::from_millis(500),
                detach_timeout: Duration::from_secs(2),
                queue_drain_timeout: Duration::from_secs(5),
                ..DriverConfig::default()
            }
        }

        /// Interactive stub: prompt after every command, no prompt after `g`
        /// (the target is "running"), scripted replies for `k`/`k1`/`qd`,
        /// and a capture file recording every received command in order.
        fn echo_stub(capture: &Path) -> PathBuf {
            let body = format!(
                r##"#!/bin/sh
printf '%s\n' 'stub debugger attached'
printf '0:000> '
while IFS= read -r cmd; do
  printf '%s\n' "$cmd" >> '{capture}'
  case "$cmd" in
    g) : ;;
    k|k1)
      printf '%s\n' ' # Child-SP          RetAddr           Call Site'
      printf '%s\n' '000000d2`a29ff4a0 00007ff7`78522a5f     app!doWork+0x80 [C:\src\app.cpp @ 42]'
      printf '0:000> '
      ;;
    qd)
      printf '%s\n' 'quit:'
      exit 0
      ;;
    *)
      printf '%s\n' "ok: $cmd"
      printf '0:000> '
      ;;
  esac
done
"##,
                capture = capture.display()
            );
            write_stub(&body)
        }

        /// Stub that prints one prompt and then goes silent.
        fn silent_stub() -> PathBuf {
            write_stub(
                r##"#!/bin/sh
printf '0:000> '
sleep 30
"##,
            )
        }

        /// Stub whose debuggee dies shortly after attach: a termination
        /// marker and then stream close.
        fn terminating_stub() -> PathBuf {
            write_stub(
                r##"#!/bin/sh
printf '0:000> '
sleep 0.2
printf '%s\n' 'Process terminated'
exit 0
"##,
            )
        }

        /// Stub that raises a first-chance and then a second-chance
        /// exception, with scripted `k`/`r` replies for crash analysis.
        fn crash_stub() -> PathBuf {
            write_stub(
                r##"#!/bin/sh
printf '0:000> '
sleep 0.2
printf '%s\n' '(1a2c.3f04): Integer divide-by-zero - code c0000094 (first chance)'
printf '0:000> '
sleep 0.2
printf '%s\n' '(1a2c.3f04): Integer divide-by-zero - code c0000094 (!!! second chance !!!)'
printf '0:000> '
while IFS= read -r cmd; do
  case "$cmd" in
    k)
      printf '%s\n' ' # Child-SP          RetAddr           Call Site'
      printf '%s\n' '000000d2`a29ff4a0 00007ff7`78522a5f     app!doWork+0x80 [C:\src\app.cpp @ 42]'
      printf '0:000> '
      ;;
    r)
      printf '%s\n' 'rax=0000000000000000 rbx=0000019a5a4f3010'
      printf '0:000> '
      ;;
    *)
      printf '%s\n' "ok: $cmd"
      printf '0:000> '
      ;;
  esac
done
"##,
            )
        }

        /// Stub that reports a breakpoint hit shortly after readiness, with
        /// the fixed symbol + disassembly follow-up and a `k1` reply.
        fn breakpoint_stub() -> PathBuf {
            write_stub(
                r##"#!/bin/sh
printf '0:000> '
sleep 0.2
printf '%s\n' 'Breakpoint 0 hit'
printf '%s\n' 'app!doWork:'
printf '%s\n' '00007ff7`78522a5f 488b03 mov rax,qword ptr [rbx]'
printf '0:000> '
while IFS= read -r cmd; do
  case "$cmd" in
    k1)
      printf '%s\n' ' # Child-SP          RetAddr           Call Site'
      printf '%s\n' '000000d2`a29ff4a0 00007ff7`78522a5f     app!doWork+0x80 [C:\src\app.cpp @ 42]'
      printf '0:000> '
      ;;
    *)
      printf '%s\n' "ok: $cmd"
      printf '0:000> '
      ;;
  esac
done
"##,
            )
        }

        fn spawn_sleep_target() -> std::process::Child {
            std::process::Command::new("sleep")
                .arg("30")
                .spawn()
                .expect("spawn sleep target")
        }

        fn capture_path() -> PathBuf {
            std::env::temp_dir().join(format!(
                "cdb_driver_capture_{}_{}",
                std::process::id(),
                STUB_COUNTER.fetch_add(1, Ordering::SeqCst)
            ))
        }

        #[tokio::test]
        async fn operations_outside_required_state_fail_with_not_ready() {
            let stub = echo_stub(&capture_path());
            let driver = CdbDriver::new(test_config(stub)).expect("driver");

            assert_eq!(driver.get_state(), DebuggerState::Idle);
            assert!(!driver.is_attached());

            let err = driver.continue_execution().await.expect_err("idle continue");
            assert!(matches!(err, DriverError::NotReady { .. }));
            let err = driver.step_over().await.expect_err("idle step");
            assert!(matches!(err, DriverError::NotReady { .. }));
            let err = driver.get_stack_trace().await.expect_err("idle stack");
            assert!(matches!(err, DriverError::NotReady { .. }));
            let err = driver.analyze_crash().await.expect_err("idle crash");
            assert!(matches!(err, DriverError::NotReady { .. }));

            // No state change happened.
            assert_eq!(driver.get_state(), DebuggerState::Idle);
        }

        #[tokio::test]
        async fn attach_fails_closed_for_missing_pid() {
            let stub = echo_stub(&capture_path());
            let driver = CdbDriver::new(test_config(stub)).expect("driver");

            let err = driver.attach(u32::MAX - 1).await.expect_err("bogus pid");
            assert!(matches!(err, DriverError::AttachFailure(_)));
            assert_eq!(driver.get_state(), DebuggerState::Idle);
        }

        #[tokio::test]
        async fn launch_fails_closed_for_missing_executable() {
            let stub = echo_stub(&capture_path());
            let driver = CdbDriver::new(test_config(stub)).expect("driver");

            let err = driver
                .launch(Path::new("/no/such/app.exe"), &[])
                .await
                .expect_err("missing executable");
            assert!(matches!(err, DriverError::LaunchFailure(_)));
        }

        #[tokio::test]
        async fn attach_reaches_paused_and_detach_resets_to_idle() {
            let mut target = spawn_sleep_target();
            let stub = echo_stub(&capture_path());
            let driver = CdbDriver::new(test_config(stub)).expect("driver");

            driver.attach(target.id()).await.expect("attach");
            assert_eq!(driver.get_state(), DebuggerState::Paused);
            assert!(driver.is_attached());

            driver.detach().await.expect("detach");
            assert_eq!(driver.get_state(), DebuggerState::Idle);
            assert!(!driver.is_attached());

            let _ = target.kill();
        }

        #[tokio::test]
        async fn launch_issues_setup_commands_in_fifo_order() {
            let capture = capture_path();
            let stub = echo_stub(&capture);
            let driver = CdbDriver::new(test_config(stub)).expect("driver");

            let pid = driver
                .launch(Path::new("/bin/sleep"), &["30".to_string()])
                .await
                .expect("launch");
            assert!(pid > 0);
            assert_eq!(driver.get_state(), DebuggerState::Running);

            // The monitor releases one command per prompt, strictly FIFO.
            // The final `g` is flushed to the stub before the drain completes
            // but the stub needs a moment to record it.
            let mut received = String::new();
            for _ in 0..50 {
                received = std::fs::read_to_string(&capture).unwrap_or_default();
                if received.lines().count() >= 5 {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
            let commands: Vec<&str> = received.lines().collect();
            assert_eq!(commands.len(), 5, "captured: {received:?}");
            assert_eq!(commands[0], ".sympath");
            assert!(commands[1].starts_with(".sympath+ "));
            assert_eq!(commands[2], ".reload");
            assert_eq!(commands[3], "l+t");
            assert_eq!(commands[4], "g");

            // Resuming an already-running target is rejected without a
            // state change.
            let err = driver.continue_execution().await.expect_err("running continue");
            assert!(matches!(err, DriverError::NotReady { .. }));
            assert_eq!(driver.get_state(), DebuggerState::Running);

            let _ = driver.detach().await;
        }

        #[tokio::test]
        async fn breakpoint_registry_round_trip() {
            let mut target = spawn_sleep_target();
            let stub = echo_stub(&capture_path());
            let driver = CdbDriver::new(test_config(stub)).expect("driver");
            driver.attach(target.id()).await.expect("attach");

            let first = driver
                .set_breakpoint("app.cpp", 42, None)
                .await
                .expect("first breakpoint");
            let second = driver
                .set_breakpoint("app.cpp", 57, Some("x > 3"))
                .await
                .expect("second breakpoint");
            assert_eq!(first, 1);
            assert_eq!(second, 2);
            assert_eq!(driver.list_breakpoints().len(), 2);

            assert!(driver.remove_breakpoint(first).await.expect("remove"));
            assert!(driver.remove_breakpoint(second).await.expect("remove"));
            assert!(!driver.remove_breakpoint(99).await.expect("unknown id"));
            assert!(driver.list_breakpoints().is_empty());

            let _ = driver.detach().await;
            let _ = target.kill();
        }

        #[tokio::test]
        async fn stack_trace_parses_frames_from_bridge_output() {
            let mut target = spawn_sleep_target();
            let stub = echo_stub(&capture_path());
            let driver = CdbDriver::new(test_config(stub)).expect("driver");
            driver.attach(target.id()).await.expect("attach");

            let frames = driver.get_stack_trace().await.expect("stack trace");
            assert_eq!(frames.len(), 1);
            assert_eq!(frames[0].function_name, "doWork");
            assert_eq!(frames[0].line_number, Some(42));

            let current = driver.get_current_frame().await.expect("current frame");
            assert_eq!(current.unwrap().module_name.as_deref(), Some("app"));

            let _ = driver.detach().await;
            let _ = target.kill();
        }

        #[tokio::test]
        async fn bridge_timeout_is_soft_and_bounded() {
            let mut target = spawn_sleep_target();
            let stub = silent_stub();
            let mut config = test_config(stub);
            config.command_timeout = Duration::from_millis(200);
            let driver = CdbDriver::new(config).expect("driver");
            driver.attach(target.id()).await.expect("attach");

            let started = std::time::Instant::now();
            let result = driver
                .evaluate_expression("1+1", 0)
                .await
                .expect("soft timeout returns collected output");
            let elapsed = started.elapsed();

            assert_eq!(result, "");
            assert!(
                elapsed < Duration::from_secs(1),
                "bridge blocked too long: {elapsed:?}"
            );

            let _ = driver.detach().await;
            let _ = target.kill();
        }

        #[tokio::test]
        async fn wait_for_event_times_out_on_idle_session() {
            let mut target = spawn_sleep_target();
            let stub = echo_stub(&capture_path());
            let driver = CdbDriver::new(test_config(stub)).expect("driver");
            driver.attach(target.id()).await.expect("attach");

            let started = std::time::Instant::now();
            let event = driver
                .wait_for_event(Duration::from_millis(300))
                .await
                .expect("wait_for_event");
            assert!(event.is_none());
            assert!(started.elapsed() < Duration::from_secs(1));

            let _ = driver.detach().await;
            let _ = target.kill();
        }

        #[tokio::test]
        async fn detach_after_target_termination_resets_to_idle() {
            let mut target = spawn_sleep_target();
            let driver = CdbDriver::new(test_config(terminating_stub())).expect("driver");
            driver.attach(target.id()).await.expect("attach");

            let event = driver
                .wait_for_event(Duration::from_secs(5))
                .await
                .expect("wait_for_event")
                .expect("termination event should arrive");
            assert_eq!(event.kind, DebuggerEventKind::ProcessTerminated);
            assert_eq!(driver.get_state(), DebuggerState::Terminated);

            // The monitor is gone; detach must still succeed and reset.
            driver.detach().await.expect("detach after termination");
            assert_eq!(driver.get_state(), DebuggerState::Idle);
            assert!(!driver.is_attached());

            let _ = target.kill();
        }

        #[tokio::test]
        async fn second_chance_exception_crashes_session_and_feeds_crash_report() {
            let mut target = spawn_sleep_target();
            let driver = CdbDriver::new(test_config(crash_stub())).expect("driver");
            driver.attach(target.id()).await.expect("attach");

            let first = driver
                .wait_for_event(Duration::from_secs(5))
                .await
                .expect("wait_for_event")
                .expect("first-chance event should arrive");
            assert_eq!(first.kind, DebuggerEventKind::Exception);
            assert_eq!(
                first.data.as_ref().expect("exception data")["second_chance"],
                false
            );
            // A first-chance exception never changes state on its own.
            assert_eq!(driver.get_state(), DebuggerState::Paused);

            let second = driver
                .wait_for_event(Duration::from_secs(5))
                .await
                .expect("wait_for_event")
                .expect("second-chance event should arrive");
            assert_eq!(second.kind, DebuggerEventKind::Exception);
            assert_eq!(
                second.data.as_ref().expect("exception data")["second_chance"],
                true
            );
            assert_eq!(driver.get_state(), DebuggerState::Crashed);

            let crash = driver.analyze_crash().await.expect("crash report");
            assert_eq!(crash.exception_type, "Integer divide-by-zero");
            assert_eq!(crash.stack_trace.len(), 1);
            assert_eq!(crash.stack_trace[0].function_name, "doWork");
            assert_eq!(crash.stack_trace[0].line_number, Some(42));
            assert_eq!(
                crash.registers.get("rax").map(String::as_str),
                Some("0000000000000000")
            );

            let _ = driver.detach().await;
            let _ = target.kill();
        }

        #[tokio::test]
        async fn breakpoint_hit_fires_event_with_parsed_frame() {
            let mut target = spawn_sleep_target();
            let stub = breakpoint_stub();
            let driver = CdbDriver::new(test_config(stub)).expect("driver");
            driver.attach(target.id()).await.expect("attach");

            let event = driver
                .wait_for_event(Duration::from_secs(5))
                .await
                .expect("wait_for_event")
                .expect("breakpoint event should arrive");

            assert_eq!(event.kind, DebuggerEventKind::BreakpointHit);
            assert!(event.content.contains("app.cpp:42"), "{}", event.content);
            let frame = &event.data.expect("frame data")["frame"];
            assert_eq!(frame["function_name"], "doWork");
            assert_eq!(driver.get_state(), DebuggerState::Paused);

            let _ = driver.detach().await;
            let _ = target.kill();
        }
    }
}
