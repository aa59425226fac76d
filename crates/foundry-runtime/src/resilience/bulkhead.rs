//! Per-dependency concurrency caps.
//!
//! Acquisition never waits: a dependency at capacity rejects immediately so
//! the caller fails fast instead of queueing behind a slow dependency.

use parking_lot::RwLock;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

struct Slot {
    limit: usize,
    in_use: AtomicUsize,
}

impl Slot {
    fn try_acquire(&self) -> bool {
        self.in_use
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |current| {
                (current < self.limit).then_some(current + 1)
            })
            .is_ok()
    }

    fn release(&self) {
        let _ = self
            .in_use
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |current| {
                current.checked_sub(1)
            });
    }
}

/// Non-blocking counting semaphores keyed by dependency name.
pub struct Bulkhead {
    default_limit: usize,
    limits: BTreeMap<String, usize>,
    slots: RwLock<HashMap<String, Arc<Slot>>>,
}

impl Bulkhead {
    pub fn new(default_limit: usize, limits: BTreeMap<String, usize>) -> Self {
        Self {
            default_limit,
            limits,
            slots: RwLock::new(HashMap::new()),
        }
    }

    /// Take one slot. Returns false when the dependency is at capacity.
    pub fn acquire(&self, dependency: &str) -> bool {
        let acquired = self.slot(dependency).try_acquire();
        if !acquired {
            tracing::debug!(dependency, limit = self.limit(dependency), "Bulkhead rejected call");
        }
        acquired
    }

    /// Give a slot back. Extra releases are ignored.
    pub fn release(&self, dependency: &str) {
        if let Some(slot) = self.slots.read().get(dependency) {
            slot.release();
        }
    }

    /// Take a slot that is released when the permit drops.
    pub fn try_permit(&self, dependency: &str) -> Option<DependencyPermit> {
        let slot = self.slot(dependency);
        if slot.try_acquire() {
            Some(DependencyPermit { slot })
        } else {
            tracing::debug!(dependency, limit = slot.limit, "Bulkhead rejected call");
            None
        }
    }

    /// Configured cap for a dependency.
    pub fn limit(&self, dependency: &str) -> usize {
        self.limits
            .get(dependency)
            .copied()
            .unwrap_or(self.default_limit)
    }

    /// Slots currently held for a dependency.
    pub fn in_use(&self, dependency: &str) -> usize {
        self.slots
            .read()
            .get(dependency)
            .map(|s| s.in_use.load(Ordering::Acquire))
            .unwrap_or(0)
    }

    fn slot(&self, dependency: &str) -> Arc<Slot> {
        if let Some(slot) = self.slots.read().get(dependency) {
            return Arc::clone(slot);
        }
        let limit = self.limit(dependency);
        Arc::clone(
            self.slots
                .write()
                .entry(dependency.to_string())
                .or_insert_with(|| {
                    Arc::new(Slot {
                        limit,
                        in_use: AtomicUsize::new(0),
                    })
                }),
        )
    }
}

impl Default for Bulkhead {
    fn default() -> Self {
        Self::new(10, BTreeMap::new())
    }
}

/// RAII slot in a bulkhead.
pub struct DependencyPermit {
    slot: Arc<Slot>,
}

impl Drop for DependencyPermit {
    fn drop(&mut self) {
        self.slot.release();
    }
}
