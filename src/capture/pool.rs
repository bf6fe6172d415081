//! Accounting for the sensor's fixed set of DMA frame buffers

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use crossbeam::utils::CachePadded;
use serde::Serialize;

/// Fixed-size pool of hardware frame slots.
///
/// A slot is taken with [`HardwarePool::lease`] and handed back when the
/// returned [`PoolLease`] is dropped. Leases cannot be cloned, so a slot
/// can only ever be returned once.
pub struct HardwarePool {
    capacity: usize,
    outstanding: AtomicUsize,
    stats: CachePadded<Counters>,
}

#[derive(Default)]
struct Counters {
    acquired: AtomicU64,
    released: AtomicU64,
}

/// Snapshot of pool counters
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PoolStats {
    pub capacity: usize,
    pub outstanding: usize,
    pub acquired: u64,
    pub released: u64,
}

impl HardwarePool {
    pub fn new(capacity: usize) -> Arc<Self> {
        Arc::new(Self {
            capacity: capacity.max(1),
            outstanding: AtomicUsize::new(0),
            stats: CachePadded::new(Counters::default()),
        })
    }

    /// Take a free slot, or `None` if every slot is in flight.
    pub fn lease(self: &Arc<Self>) -> Option<PoolLease> {
        self.outstanding
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| {
                (n < self.capacity).then_some(n + 1)
            })
            .ok()?;
        self.stats.acquired.fetch_add(1, Ordering::Relaxed);
        Some(PoolLease {
            pool: Arc::clone(self),
        })
    }

    /// True if a `lease` would currently succeed.
    pub fn has_free_slot(&self) -> bool {
        self.outstanding() < self.capacity
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn outstanding(&self) -> usize {
        self.outstanding.load(Ordering::Acquire)
    }

    pub fn stats(&self) -> PoolStats {
        PoolStats {
            capacity: self.capacity,
            outstanding: self.outstanding(),
            acquired: self.stats.acquired.load(Ordering::Relaxed),
            released: self.stats.released.load(Ordering::Relaxed),
        }
    }
}

/// Ownership of one hardware slot.
pub struct PoolLease {
    pool: Arc<HardwarePool>,
}

impl Drop for PoolLease {
    fn drop(&mut self) {
        self.pool.outstanding.fetch_sub(1, Ordering::AcqRel);
        self.pool.stats.released.fetch_add(1, Ordering::Relaxed);
    }
}
