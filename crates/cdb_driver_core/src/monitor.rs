//! Output monitor and command dispatcher.
//!
//! One monitor task runs per session for the session's lifetime. It is the
//! single reader of the debugger's stdout and the single writer of its stdin
//! and of session-state transitions: commands submitted from any caller are
//! routed through an mpsc queue and released here, one at a time, only after
//! the debugger's prompt has been observed.

use std::io;
use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::process::{ChildStdin, ChildStdout};
use tokio::sync::mpsc;
use tokio::time::{timeout, Instant};

use crate::parse::{self, ExceptionChance};
use crate::session::SessionShared;
use crate::types::{BreakpointLocation, DebuggerEvent, DebuggerEventKind, DebuggerState};

const FOLLOW_UP_LINE_TIMEOUT: Duration = Duration::from_secs(2);
const PROMPT_WAIT_TIMEOUT: Duration = Duration::from_secs(10);
const STACK_HEADER_SKIP_LINES: usize = 10;
const READ_CHUNK: usize = 4096;

/// Accumulates raw debugger output and yields completed units: either a
/// newline-terminated line or a trailing fragment that is the interactive
/// prompt (the prompt is never newline-terminated).
#[derive(Default)]
pub struct LineBuffer {
    pending: String,
}

impl LineBuffer {
    pub fn push_chunk(&mut self, chunk: &str) {
        self.pending.push_str(chunk);
    }

    pub fn pop_line(&mut self) -> Option<String> {
        if let Some(idx) = self.pending.find('\n') {
            let mut line: String = self.pending.drain(..=idx).collect();
            while line.ends_with('\n') || line.ends_with('\r') {
                line.pop();
            }
            return Some(line);
        }
        if !self.pending.is_empty() && parse::ends_with_prompt(&self.pending) {
            let fragment = std::mem::take(&mut self.pending);
            return Some(fragment.trim_end().to_string());
        }
        None
    }
}

enum LoopAction {
    Continue,
    Stop,
}

pub struct Monitor {
    shared: Arc<SessionShared>,
    stdout: ChildStdout,
    stdin: ChildStdin,
    cmd_rx: mpsc::UnboundedReceiver<String>,
    output_tx: mpsc::UnboundedSender<String>,
    buffer: LineBuffer,
    ready_to_send: bool,
}

impl Monitor {
    pub fn new(
        shared: Arc<SessionShared>,
        stdout: ChildStdout,
        stdin: ChildStdin,
        cmd_rx: mpsc::UnboundedReceiver<String>,
        output_tx: mpsc::UnboundedSender<String>,
    ) -> Self {
        Self {
            shared,
            stdout,
            stdin,
            cmd_rx,
            output_tx,
            buffer: LineBuffer::default(),
            ready_to_send: false,
        }
    }

    pub async fn run(mut self) {
        let result = self.run_inner().await;
        match result {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => {
                if !self.shared.is_detaching() {
                    self.shared.set_state(DebuggerState::Terminated);
                    self.shared.events.publish(DebuggerEvent::new(
                        DebuggerEventKind::ProcessTerminated,
                        "Debugger output stream closed",
                    ));
                }
            }
            Err(e) => {
                self.shared.events.publish(DebuggerEvent::new(
                    DebuggerEventKind::Error,
                    format!("Monitor loop error: {e}"),
                ));
                if !self.shared.is_detaching() {
                    self.shared.set_state(DebuggerState::Terminated);
                    self.shared.events.publish(DebuggerEvent::new(
                        DebuggerEventKind::ProcessTerminated,
                        "Process terminated",
                    ));
                }
            }
        }
        tracing::debug!("monitor loop exited");
    }

    async fn run_inner(&mut self) -> io::Result<()> {
        loop {
            while let Some(line) = self.buffer.pop_line() {
                match self.handle_line(line).await? {
                    LoopAction::Continue => {}
                    LoopAction::Stop => return Ok(()),
                }
            }

            if self.ready_to_send {
                tokio::select! {
                    biased;
                    command = self.cmd_rx.recv() => match command {
                        Some(command) => self.dispatch(command).await?,
                        // Driver dropped; nothing can submit anymore.
                        None => return Ok(()),
                    },
                    read = fill(&mut self.stdout, &mut self.buffer) => read?,
                }
            } else {
                fill(&mut self.stdout, &mut self.buffer).await?;
            }
        }
    }

    /// Release exactly one queued command now that a prompt was seen.
    async fn dispatch(&mut self, command: String) -> io::Result<()> {
        let result = self.send_direct(&command).await;
        self.shared.command_dispatched();
        self.ready_to_send = false;
        result
    }

    /// Write a command to the debugger's stdin, bypassing the queue gate.
    /// Only the monitor itself may call this.
    async fn send_direct(&mut self, command: &str) -> io::Result<()> {
        self.shared.events.publish(DebuggerEvent::new(
            DebuggerEventKind::Input,
            format!("Command sent: {command}"),
        ));
        self.stdin.write_all(command.as_bytes()).await?;
        self.stdin.write_all(b"\n").await?;
        self.stdin.flush().await?;

        // `g` resumes the target; the state flips back to paused when the
        // next prompt arrives.
        if command == "g" {
            self.shared.set_state(DebuggerState::Running);
        }
        Ok(())
    }

    async fn handle_line(&mut self, line: String) -> io::Result<LoopAction> {
        if line.is_empty() {
            return Ok(LoopAction::Continue);
        }

        self.shared
            .events
            .publish(DebuggerEvent::new(DebuggerEventKind::Output, line.clone()));
        let _ = self.output_tx.send(line.clone());

        if parse::is_prompt(&line) {
            if !self.shared.is_ready() {
                self.shared.mark_ready();
                self.shared.events.publish(DebuggerEvent::new(
                    DebuggerEventKind::System,
                    "Debugger ready",
                ));
            } else {
                self.shared.ready_notify.notify_waiters();
            }
            if self.shared.state() == DebuggerState::Running {
                self.shared.set_state(DebuggerState::Paused);
            }
            self.ready_to_send = true;
        }

        let lower = line.to_lowercase();
        if lower.contains("quit:") || lower.contains("terminated") {
            self.shared.set_state(DebuggerState::Terminated);
            self.shared.events.publish(DebuggerEvent::new(
                DebuggerEventKind::ProcessTerminated,
                "Process terminated",
            ));
            return Ok(LoopAction::Stop);
        }

        if line.contains("Breakpoint") && line.contains("hit") {
            self.handle_breakpoint_hit().await?;
        }

        if let Some(exception) = parse::parse_exception(&line) {
            self.shared.events.publish(DebuggerEvent::with_data(
                DebuggerEventKind::Exception,
                format!(
                    "Exception: {} - Code: {}",
                    exception.description, exception.code
                ),
                json!({
                    "type": exception.description,
                    "code": exception.code,
                    "pid": exception.pid,
                    "tid": exception.tid,
                    "second_chance": exception.chance == ExceptionChance::Second,
                }),
            ));
            // First-chance exceptions are not necessarily fatal; only a
            // second-chance notification moves the session to crashed.
            if exception.chance == ExceptionChance::Second {
                self.shared.set_state(DebuggerState::Crashed);
            }
            self.shared.session().last_exception = Some(exception);
        }

        Ok(LoopAction::Continue)
    }

    /// The debugger emits a fixed follow-up sequence after a hit: the symbol
    /// name and one disassembly line. Consume those, probe the top frame with
    /// `k1`, and publish a `BreakpointHit` with the parsed location.
    async fn handle_breakpoint_hit(&mut self) -> io::Result<()> {
        self.shared.set_state(DebuggerState::Paused);

        let symbol_line = self.next_nonempty_line().await?;
        self.publish_output(&symbol_line);
        let disassembly = self.next_nonempty_line().await?;
        self.publish_output(&disassembly);

        self.wait_for_prompt().await?;
        self.send_direct("k1").await?;

        // Skip blanks and echo up to the stack header.
        for _ in 0..STACK_HEADER_SKIP_LINES {
            let header = self.next_nonempty_line().await?;
            self.publish_output(&header);
            if header.contains("Child-SP") {
                break;
            }
        }

        let source_line = self.next_nonempty_line().await?;
        self.publish_output(&source_line);

        self.wait_for_prompt().await?;
        self.ready_to_send = true;

        match parse::parse_frame(&source_line) {
            Some(frame) => {
                self.record_hit(&symbol_line, &frame.file_path, frame.line_number);
                let location = format!(
                    "{}:{}",
                    frame.file_path.as_deref().unwrap_or("?"),
                    frame.line_number.unwrap_or(0)
                );
                self.shared.events.publish(DebuggerEvent::with_data(
                    DebuggerEventKind::BreakpointHit,
                    format!("{symbol_line} hit at {location}"),
                    json!({ "frame": frame }),
                ));
            }
            None => {
                self.record_hit(&symbol_line, &None, None);
                self.shared.events.publish(DebuggerEvent::new(
                    DebuggerEventKind::BreakpointHit,
                    format!("{symbol_line} hit at unknown location"),
                ));
            }
        }
        Ok(())
    }

    fn record_hit(&self, symbol_line: &str, file_path: &Option<String>, line: Option<u32>) {
        let mut session = self.shared.session();
        for breakpoint in session.breakpoints.values_mut() {
            let matched = match &breakpoint.location {
                BreakpointLocation::File { path, line: bp_line } => {
                    file_path.as_deref() == Some(path.as_str()) && line == Some(*bp_line)
                }
                BreakpointLocation::Function { name } => symbol_line.contains(name.as_str()),
            };
            if matched {
                breakpoint.hit_count += 1;
            }
        }
    }

    fn publish_output(&self, line: &str) {
        if !line.is_empty() {
            self.shared.events.publish(DebuggerEvent::new(
                DebuggerEventKind::Output,
                line.to_string(),
            ));
        }
    }

    async fn wait_for_prompt(&mut self) -> io::Result<()> {
        let deadline = Instant::now() + PROMPT_WAIT_TIMEOUT;
        loop {
            if Instant::now() >= deadline {
                return Err(io::Error::new(
                    io::ErrorKind::TimedOut,
                    "no prompt after breakpoint follow-up",
                ));
            }
            let line = self.next_line().await?;
            self.publish_output(&line);
            if parse::is_prompt(&line) {
                return Ok(());
            }
        }
    }

    async fn next_nonempty_line(&mut self) -> io::Result<String> {
        loop {
            let line = self.next_line().await?;
            if !line.is_empty() {
                return Ok(line);
            }
        }
    }

    async fn next_line(&mut self) -> io::Result<String> {
        loop {
            if let Some(line) = self.buffer.pop_line() {
                return Ok(line);
            }
            match timeout(FOLLOW_UP_LINE_TIMEOUT, fill(&mut self.stdout, &mut self.buffer)).await
            {
                Ok(result) => result?,
                Err(_) => {
                    return Err(io::Error::new(
                        io::ErrorKind::TimedOut,
                        "timed out reading debugger output",
                    ))
                }
            }
        }
    }
}

async fn fill(stdout: &mut ChildStdout, buffer: &mut LineBuffer) -> io::Result<()> {
    let mut chunk = [0u8; READ_CHUNK];
    let n = stdout.read(&mut chunk).await?;
    if n == 0 {
        return Err(io::Error::new(
            io::ErrorKind::UnexpectedEof,
            "debugger stdout closed",
        ));
    }
    buffer.push_chunk(&String::from_utf8_lossy(&chunk[..n]));
    Ok(())
}
