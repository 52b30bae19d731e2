use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use crate::types::{DebuggerEvent, DebuggerEventKind};

/// Handle returned by [`EventHub::register`], used to unregister later.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriberId(u64);

pub type EventCallback = Arc<dyn Fn(DebuggerEvent) + Send + Sync>;

/// Observer registry for debugger events.
///
/// Publication snapshots the subscriber list under a short-lived lock and
/// invokes callbacks outside it, so a slow or panicking subscriber cannot
/// block registration or stall the monitor. A panicking callback is isolated
/// and reported as an `Error` event.
#[derive(Default)]
pub struct EventHub {
    subscribers: Mutex<HashMap<DebuggerEventKind, Vec<(SubscriberId, EventCallback)>>>,
    next_id: AtomicU64,
}

impl EventHub {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(
        &self,
        kind: DebuggerEventKind,
        callback: impl Fn(DebuggerEvent) + Send + Sync + 'static,
    ) -> SubscriberId {
        self.register_callback(kind, Arc::new(callback))
    }

    pub fn register_callback(&self, kind: DebuggerEventKind, callback: EventCallback) -> SubscriberId {
        let id = SubscriberId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let mut subscribers = self.subscribers.lock().expect("event registry poisoned");
        subscribers.entry(kind).or_default().push((id, callback));
        id
    }

    /// Idempotent: unregistering an unknown or already-removed id is a no-op.
    pub fn unregister(&self, kind: DebuggerEventKind, id: SubscriberId) {
        let mut subscribers = self.subscribers.lock().expect("event registry poisoned");
        if let Some(list) = subscribers.get_mut(&kind) {
            list.retain(|(existing, _)| *existing != id);
        }
    }

    pub fn publish(&self, event: DebuggerEvent) {
        let snapshot: Vec<EventCallback> = {
            let subscribers = self.subscribers.lock().expect("event registry poisoned");
            subscribers
                .get(&event.kind)
                .map(|list| list.iter().map(|(_, cb)| cb.clone()).collect())
                .unwrap_or_default()
        };

        for callback in snapshot {
            let delivered = event.clone();
            if let Err(panic) = catch_unwind(AssertUnwindSafe(|| callback(delivered))) {
                let message = panic
                    .downcast_ref::<&str>()
                    .map(|s| s.to_string())
                    .or_else(|| panic.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "unknown panic".to_string());
                tracing::warn!("event callback panicked: {message}");
                // Report via the Error channel, but never recurse from a
                // panicking Error subscriber.
                if event.kind != DebuggerEventKind::Error {
                    self.publish(DebuggerEvent::new(
                        DebuggerEventKind::Error,
                        format!("Error in event callback: {message}"),
                    ));
                }
            }
        }
    }
}
