//! Per-slot lock registry
//!
//! Slot locks exist purely to let independent bids proceed in parallel; the
//! document lock still guards every read-modify-write. Two rules keep this
//! deadlock free:
//!
//! 1. Paths holding multiple slot locks acquire them in ascending
//!    [`SlotKey`] order.
//! 2. No path acquires a slot lock while holding the document lock.

use std::collections::HashMap;
use std::sync::Mutex as StdMutex;
use std::sync::Arc;

use tokio::sync::{Mutex, OwnedMutexGuard};

use gpubid_core::SlotKey;

/// A held slot lock; the slot stays locked until this guard drops
pub type SlotGuard = OwnedMutexGuard<()>;

/// Registry of per-slot mutexes, created on first use and retained for the
/// life of the day
#[derive(Default)]
pub struct SlotLockRegistry {
    locks: StdMutex<HashMap<SlotKey, Arc<Mutex<()>>>>,
}

impl SlotLockRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    fn handle(&self, key: &SlotKey) -> Arc<Mutex<()>> {
        let mut locks = self.locks.lock().unwrap();
        locks.entry(key.clone()).or_default().clone()
    }

    /// Lock a single slot
    pub async fn acquire(&self, key: &SlotKey) -> SlotGuard {
        self.handle(key).lock_owned().await
    }

    /// Lock a batch of slots in canonical order.
    ///
    /// `keys` must already be sorted and deduplicated; guards are returned in
    /// the same order and release in reverse when dropped.
    pub async fn acquire_sorted(&self, keys: &[SlotKey]) -> Vec<SlotGuard> {
        debug_assert!(keys.windows(2).all(|w| w[0] < w[1]), "keys must be sorted and unique");
        let mut guards = Vec::with_capacity(keys.len());
        for key in keys {
            guards.push(self.handle(key).lock_owned().await);
        }
        guards
    }

    /// Drop the lock entries of a finished day
    pub fn purge_day(&self, day: &str) {
        self.locks.lock().unwrap().retain(|key, _| key.day != day);
    }

    /// Drop every lock entry (calendar reset)
    pub fn clear(&self) {
        self.locks.lock().unwrap().clear();
    }

    /// Number of live lock entries
    pub fn len(&self) -> usize {
        self.locks.lock().unwrap().len()
    }

    /// Whether the registry is empty
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
