use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use serde_json::json;
use tokio::sync::Notify;

use crate::events::EventHub;
use crate::parse::ExceptionInfo;
use crate::types::{BreakpointInfo, DebuggerEvent, DebuggerEventKind, DebuggerState};

/// Mutable per-session data, protected by the shared handle's mutex.
#[derive(Debug)]
pub struct Session {
    pub state: DebuggerState,
    pub target_pid: Option<u32>,
    pub module_name: Option<String>,
    pub breakpoints: HashMap<u32, BreakpointInfo>,
    pub last_exception: Option<ExceptionInfo>,
    next_breakpoint_id: u32,
}

impl Default for Session {
    fn default() -> Self {
        Self {
            state: DebuggerState::Idle,
            target_pid: None,
            module_name: None,
            breakpoints: HashMap::new(),
            last_exception: None,
            next_breakpoint_id: 1,
        }
    }
}

impl Session {
    /// Breakpoint ids are unique, strictly increasing from 1, never reused.
    pub fn next_breakpoint_id(&mut self) -> u32 {
        let id = self.next_breakpoint_id;
        self.next_breakpoint_id += 1;
        id
    }
}

/// State shared between the driver, the output monitor, and subscribers.
///
/// The monitor task is the sole writer of `state` transitions; everything
/// else mutates the session only under the mutex with short critical
/// sections.
pub struct SessionShared {
    session: Mutex<Session>,
    pub events: EventHub,
    ready: AtomicBool,
    pub ready_notify: Notify,
    queued_commands: AtomicUsize,
    pub queue_drained: Notify,
    detaching: AtomicBool,
}

impl SessionShared {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            session: Mutex::new(Session::default()),
            events: EventHub::new(),
            ready: AtomicBool::new(false),
            ready_notify: Notify::new(),
            queued_commands: AtomicUsize::new(0),
            queue_drained: Notify::new(),
            detaching: AtomicBool::new(false),
        })
    }

    /// Marks an intentional teardown so the monitor exits quietly on EOF
    /// instead of reporting an unexpected termination.
    pub fn begin_detach(&self) {
        self.detaching.store(true, Ordering::SeqCst);
    }

    pub fn is_detaching(&self) -> bool {
        self.detaching.load(Ordering::SeqCst)
    }

    pub fn session(&self) -> MutexGuard<'_, Session> {
        self.session.lock().expect("session mutex poisoned")
    }

    pub fn state(&self) -> DebuggerState {
        self.session().state
    }

    /// Transition the state machine and fire a `StateChange` event carrying
    /// the old and new state names. No-op when the state is unchanged.
    pub fn set_state(&self, new_state: DebuggerState) {
        let old_state = {
            let mut session = self.session();
            let old = session.state;
            if old == new_state {
                return;
            }
            session.state = new_state;
            old
        };
        tracing::debug!("debugger state: {old_state} -> {new_state}");
        self.events.publish(DebuggerEvent::with_data(
            DebuggerEventKind::StateChange,
            format!("Debugger state changed from {old_state} to {new_state}"),
            json!({
                "old_state": old_state,
                "new_state": new_state,
            }),
        ));
    }

    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::SeqCst)
    }

    pub fn mark_ready(&self) {
        self.ready.store(true, Ordering::SeqCst);
        self.ready_notify.notify_waiters();
    }

    pub fn clear_ready(&self) {
        self.ready.store(false, Ordering::SeqCst);
    }

    pub fn command_queued(&self) {
        self.queued_commands.fetch_add(1, Ordering::SeqCst);
    }

    pub fn command_dispatched(&self) {
        if self.queued_commands.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.queue_drained.notify_waiters();
        }
    }

    pub fn queue_is_empty(&self) -> bool {
        self.queued_commands.load(Ordering::SeqCst) == 0
    }

    /// Reset per-attachment state while keeping the subscriber registry and
    /// breakpoint id counter (ids are never reused across attachments).
    pub fn reset_for_detach(&self) {
        {
            let mut session = self.session();
            session.state = DebuggerState::Idle;
            session.target_pid = None;
            session.module_name = None;
            session.last_exception = None;
        }
        self.clear_ready();
        self.detaching.store(false, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex as StdMutex;

    #[test]
    fn breakpoint_ids_strictly_increase_from_one() {
        let mut session = Session::default();
        let ids: Vec<u32> = (0..5).map(|_| session.next_breakpoint_id()).collect();
        assert_eq!(ids, vec![1, 2, 3, 4, 5]);
    }

    #[test]
    fn set_state_fires_state_change_with_old_and_new() {
        let shared = SessionShared::new();
        let seen = Arc::new(StdMutex::new(Vec::new()));

        let log = seen.clone();
        shared
            .events
            .register(DebuggerEventKind::StateChange, move |event| {
                log.lock().unwrap().push(event.data.unwrap());
            });

        shared.set_state(DebuggerState::Running);
        shared.set_state(DebuggerState::Paused);

        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 2);
        assert_eq!(seen[0]["old_state"], "idle");
        assert_eq!(seen[0]["new_state"], "running");
        assert_eq!(seen[1]["old_state"], "running");
        assert_eq!(seen[1]["new_state"], "paused");
    }

    #[test]
    fn set_state_is_a_noop_for_same_state() {
        let shared = SessionShared::new();
        let count = Arc::new(std::sync::atomic::AtomicUsize::new(0));

        let counter = count.clone();
        shared
            .events
            .register(DebuggerEventKind::StateChange, move |_| {
                counter.fetch_add(1, Ordering::SeqCst);
            });

        shared.set_state(DebuggerState::Idle);
        assert_eq!(count.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn queue_counter_reports_empty_after_dispatch() {
        let shared = SessionShared::new();
        assert!(shared.queue_is_empty());
        shared.command_queued();
        shared.command_queued();
        assert!(!shared.queue_is_empty());
        shared.command_dispatched();
        shared.command_dispatched();
        assert!(shared.queue_is_empty());
    }

    #[test]
    fn reset_for_detach_clears_attachment_state() {
        let shared = SessionShared::new();
        {
            let mut session = shared.session();
            session.state = DebuggerState::Paused;
            session.target_pid = Some(1234);
            session.module_name = Some("app".into());
        }
        shared.mark_ready();

        shared.reset_for_detach();

        assert_eq!(shared.state(), DebuggerState::Idle);
        assert!(shared.session().target_pid.is_none());
        assert!(!shared.is_ready());
    }
}
