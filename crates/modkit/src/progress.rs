//! Single-slot progress tracking for the in-flight job
//!
//! At most one job runs at a time, so progress is a single shared slot
//! guarded by the executor. Observers read immutable snapshots.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use crate::events::OperationKind;
use crate::registry::ModId;

/// Live progress state for the currently running job
pub struct ProgressHandle {
    mod_id: ModId,
    operation: OperationKind,
    bytes_total: AtomicU64,
    bytes_transferred: AtomicU64,
    completed: AtomicBool,
}

/// Read-only view of a [`ProgressHandle`] at a point in time
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProgressSnapshot {
    pub mod_id: ModId,
    pub operation: OperationKind,
    pub bytes_total: Option<u64>,
    pub bytes_transferred: u64,
    pub completed: bool,
}

impl ProgressHandle {
    pub fn new(mod_id: ModId, operation: OperationKind) -> Arc<Self> {
        Arc::new(Self {
            mod_id,
            operation,
            bytes_total: AtomicU64::new(0),
            bytes_transferred: AtomicU64::new(0),
            completed: AtomicBool::new(false),
        })
    }

    pub fn set_total(&self, total: u64) {
        self.bytes_total.store(total, Ordering::Relaxed);
    }

    pub fn record_transferred(&self, bytes: u64) {
        self.bytes_transferred.store(bytes, Ordering::Relaxed);
    }

    pub fn mark_completed(&self) {
        self.completed.store(true, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> ProgressSnapshot {
        let total = self.bytes_total.load(Ordering::Relaxed);
        ProgressSnapshot {
            mod_id: self.mod_id.clone(),
            operation: self.operation,
            bytes_total: (total > 0).then_some(total),
            bytes_transferred: self.bytes_transferred.load(Ordering::Relaxed),
            completed: self.completed.load(Ordering::Relaxed),
        }
    }
}

/// The executor-owned slot holding the current [`ProgressHandle`], if any
#[derive(Clone, Default)]
pub struct ProgressSlot {
    current: Arc<Mutex<Option<Arc<ProgressHandle>>>>,
}

impl ProgressSlot {
    pub fn new() -> Self {
        Self::default()
    }

    /// Install a fresh handle for a starting job
    pub fn begin(&self, mod_id: ModId, operation: OperationKind) -> Arc<ProgressHandle> {
        let handle = ProgressHandle::new(mod_id, operation);
        *self.current.lock().unwrap() = Some(handle.clone());
        handle
    }

    /// Destroy the handle when the current job completes
    pub fn clear(&self) {
        *self.current.lock().unwrap() = None;
    }

    pub fn snapshot(&self) -> Option<ProgressSnapshot> {
        self.current
            .lock()
            .unwrap()
            .as_ref()
            .map(|handle| handle.snapshot())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn slot_holds_at_most_one_handle() {
        let slot = ProgressSlot::new();
        assert!(slot.snapshot().is_none());

        let handle = slot.begin(ModId::from("mod-1"), OperationKind::Download);
        handle.set_total(1000);
        handle.record_transferred(250);

        let snap = slot.snapshot().unwrap();
        assert_eq!(snap.mod_id, ModId::from("mod-1"));
        assert_eq!(snap.bytes_total, Some(1000));
        assert_eq!(snap.bytes_transferred, 250);
        assert!(!snap.completed);

        // A second begin replaces the slot, never adds a second handle.
        let _other = slot.begin(ModId::from("mod-2"), OperationKind::Install);
        assert_eq!(slot.snapshot().unwrap().mod_id, ModId::from("mod-2"));

        slot.clear();
        assert!(slot.snapshot().is_none());
    }

    #[test]
    fn unknown_total_reads_as_none() {
        let handle = ProgressHandle::new(ModId::from("mod-9"), OperationKind::Download);
        handle.record_transferred(10);
        let snap = handle.snapshot();
        assert_eq!(snap.bytes_total, None);
        assert_eq!(snap.bytes_transferred, 10);
    }
}
