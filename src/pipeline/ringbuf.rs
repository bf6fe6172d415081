//! Bounded latest-wins frame queue

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use crossbeam::utils::CachePadded;
use ringbuf::traits::{Consumer, Observer, RingBuffer};
use ringbuf::HeapRb;
use serde::Serialize;

use crate::capture::FrameBuffer;

/// Ring of frame handles shared by the capture thread and one consumer.
///
/// When full, `push` evicts the oldest frame, which returns its buffer to
/// the hardware pool on drop. Pops always hand out the newest frame and
/// discard anything older.
pub struct FrameQueue {
    ring: Mutex<HeapRb<FrameBuffer>>,
    ready: Condvar,
    capacity: usize,

    /// Statistics
    stats: CachePadded<Stats>,
}

#[derive(Default)]
struct Stats {
    frames_written: AtomicU64,
    frames_read: AtomicU64,
    frames_dropped: AtomicU64,
}

/// Snapshot of queue counters
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct QueueStats {
    pub capacity: usize,
    pub len: usize,
    pub written: u64,
    pub read: u64,
    pub dropped: u64,
}

impl FrameQueue {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            ring: Mutex::new(HeapRb::new(capacity)),
            ready: Condvar::new(),
            capacity,
            stats: CachePadded::new(Stats::default()),
        }
    }

    fn ring(&self) -> MutexGuard<'_, HeapRb<FrameBuffer>> {
        self.ring.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Producer: enqueue a frame. Returns false if the oldest frame had to
    /// be evicted to make room.
    pub fn push(&self, frame: FrameBuffer) -> bool {
        let evicted = self.ring().push_overwrite(frame);
        self.stats.frames_written.fetch_add(1, Ordering::Relaxed);
        self.ready.notify_one();

        match evicted {
            Some(old) => {
                self.stats.frames_dropped.fetch_add(1, Ordering::Relaxed);
                metrics::counter!("campipe_frames_evicted_total").increment(1);
                old.release();
                false
            }
            None => true,
        }
    }

    fn take_latest(&self, ring: &mut HeapRb<FrameBuffer>) -> Option<FrameBuffer> {
        let mut latest = None;
        while let Some(frame) = ring.try_pop() {
            if let Some(stale) = latest.replace(frame) {
                self.stats.frames_dropped.fetch_add(1, Ordering::Relaxed);
                FrameBuffer::release(stale);
            }
        }
        if latest.is_some() {
            self.stats.frames_read.fetch_add(1, Ordering::Relaxed);
        }
        latest
    }

    /// Consumer: newest frame, discarding anything older. Never blocks.
    pub fn pop_latest(&self) -> Option<FrameBuffer> {
        let mut ring = self.ring();
        self.take_latest(&mut ring)
    }

    /// Consumer: like `pop_latest`, but waits up to `timeout` for a frame.
    pub fn pop_blocking(&self, timeout: Duration) -> Option<FrameBuffer> {
        let deadline = Instant::now() + timeout;
        let mut ring = self.ring();
        loop {
            if let Some(frame) = self.take_latest(&mut ring) {
                return Some(frame);
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return None;
            }
            ring = self
                .ready
                .wait_timeout(ring, remaining)
                .unwrap_or_else(PoisonError::into_inner)
                .0;
        }
    }

    /// Release every queued frame. Returns how many were dropped.
    pub fn drain(&self) -> usize {
        let mut ring = self.ring();
        let mut drained = 0;
        while let Some(frame) = ring.try_pop() {
            frame.release();
            drained += 1;
        }
        self.stats
            .frames_dropped
            .fetch_add(drained as u64, Ordering::Relaxed);
        drained
    }

    pub fn len(&self) -> usize {
        self.ring().occupied_len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn stats(&self) -> QueueStats {
        QueueStats {
            capacity: self.capacity,
            len: self.len(),
            written: self.stats.frames_written.load(Ordering::Relaxed),
            read: self.stats.frames_read.load(Ordering::Relaxed),
            dropped: self.stats.frames_dropped.load(Ordering::Relaxed),
        }
    }
}
