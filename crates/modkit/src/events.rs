//! Lifecycle event bus for mod management observers
//!
//! The executor is the only emitter, so delivery is naturally ordered per
//! mod. Subscribers are isolated from each other: a panicking callback is
//! evicted and the remaining subscribers still receive the event.

use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tracing::warn;

use crate::error::FailureKind;
use crate::registry::ModId;

/// Callback invoked for every lifecycle event
pub type EventCallback = Arc<dyn Fn(&Event) + Send + Sync>;

/// Handle returned by [`EventBus::subscribe`], used to unsubscribe
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriberId(u64);

/// The operation a progress or lifecycle event refers to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperationKind {
    Download,
    Install,
    Update,
    Uninstall,
}

impl std::fmt::Display for OperationKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            OperationKind::Download => write!(f, "download"),
            OperationKind::Install => write!(f, "install"),
            OperationKind::Update => write!(f, "update"),
            OperationKind::Uninstall => write!(f, "uninstall"),
        }
    }
}

/// A discrete lifecycle event, keyed by (kind, mod id)
///
/// Management-level events carry no mod id.
#[derive(Debug, Clone, PartialEq)]
pub struct Event {
    pub mod_id: Option<ModId>,
    pub kind: EventKind,
}

/// Everything a host can observe about the lifecycle of a mod
#[derive(Debug, Clone, PartialEq)]
pub enum EventKind {
    ManagementEnabled,
    ManagementDisabled,
    Started {
        operation: OperationKind,
    },
    Progressing {
        operation: OperationKind,
        bytes_transferred: u64,
        bytes_total: Option<u64>,
    },
    Downloaded,
    Installed,
    Updated,
    Uninstalled,
    UpdateAvailable {
        version: String,
    },
    DownloadFailed {
        kind: FailureKind,
        message: String,
    },
    InstallFailed {
        kind: FailureKind,
        message: String,
    },
    UninstallFailed {
        kind: FailureKind,
        message: String,
    },
    InsufficientSpace {
        required: u64,
        available: u64,
    },
    Cancelled {
        operation: OperationKind,
    },
}

struct Subscriber {
    id: SubscriberId,
    callback: EventCallback,
}

/// Fan-out bus with explicit subscribe/unsubscribe and per-subscriber
/// isolation
#[derive(Clone)]
pub struct EventBus {
    inner: Arc<Mutex<Vec<Subscriber>>>,
    next_id: Arc<AtomicU64>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl EventBus {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(Vec::new())),
            next_id: Arc::new(AtomicU64::new(1)),
        }
    }

    pub fn subscribe(&self, callback: EventCallback) -> SubscriberId {
        let id = SubscriberId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.inner
            .lock()
            .unwrap()
            .push(Subscriber { id, callback });
        id
    }

    pub fn unsubscribe(&self, id: SubscriberId) {
        self.inner.lock().unwrap().retain(|s| s.id != id);
    }

    pub fn subscriber_count(&self) -> usize {
        self.inner.lock().unwrap().len()
    }

    /// Deliver an event to every subscriber, evicting any that panic
    pub fn emit(&self, event: Event) {
        // Snapshot under the lock, deliver outside it so a subscriber may
        // re-enter subscribe/unsubscribe.
        let subscribers: Vec<(SubscriberId, EventCallback)> = {
            let guard = self.inner.lock().unwrap();
            guard.iter().map(|s| (s.id, s.callback.clone())).collect()
        };

        let mut evict = Vec::new();
        for (id, callback) in subscribers {
            let outcome = catch_unwind(AssertUnwindSafe(|| callback(&event)));
            if outcome.is_err() {
                warn!("event subscriber panicked, evicting it; event = {:?}", event.kind);
                evict.push(id);
            }
        }
        if !evict.is_empty() {
            let mut guard = self.inner.lock().unwrap();
            guard.retain(|s| !evict.contains(&s.id));
        }
    }

    pub fn emit_for(&self, mod_id: &ModId, kind: EventKind) {
        self.emit(Event {
            mod_id: Some(mod_id.clone()),
            kind,
        });
    }

    /// Emit a management-level event not tied to any mod
    pub fn emit_global(&self, kind: EventKind) {
        self.emit(Event { mod_id: None, kind });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn counting_callback(counter: Arc<AtomicUsize>) -> EventCallback {
        Arc::new(move |_event| {
            counter.fetch_add(1, Ordering::SeqCst);
        })
    }

    #[test]
    fn subscribers_receive_events_until_unsubscribed() {
        let bus = EventBus::new();
        let counter = Arc::new(AtomicUsize::new(0));
        let id = bus.subscribe(counting_callback(counter.clone()));

        bus.emit_for(&ModId::from("mod-42"), EventKind::Downloaded);
        assert_eq!(counter.load(Ordering::SeqCst), 1);

        bus.unsubscribe(id);
        bus.emit_for(&ModId::from("mod-42"), EventKind::Installed);
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn panicking_subscriber_does_not_break_delivery_to_others() {
        let bus = EventBus::new();
        let counter = Arc::new(AtomicUsize::new(0));

        bus.subscribe(Arc::new(|_event| panic!("misbehaving observer")));
        bus.subscribe(counting_callback(counter.clone()));

        bus.emit_for(&ModId::from("mod-1"), EventKind::Downloaded);
        assert_eq!(counter.load(Ordering::SeqCst), 1);

        // The panicking subscriber was evicted, the healthy one remains.
        assert_eq!(bus.subscriber_count(), 1);
        bus.emit_for(&ModId::from("mod-1"), EventKind::Installed);
        assert_eq!(counter.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn events_carry_failure_classification() {
        let bus = EventBus::new();
        let seen: Arc<Mutex<Vec<Event>>> = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        bus.subscribe(Arc::new(move |event| {
            sink.lock().unwrap().push(event.clone());
        }));

        bus.emit_for(
            &ModId::from("mod-7"),
            EventKind::DownloadFailed {
                kind: FailureKind::Network,
                message: "connection reset".into(),
            },
        );

        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 1);
        assert!(matches!(
            seen[0].kind,
            EventKind::DownloadFailed {
                kind: FailureKind::Network,
                ..
            }
        ));
    }
}
