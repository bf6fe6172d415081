pub mod consumer;
pub mod controller;
pub mod producer;
pub mod ringbuf;

use std::sync::{Mutex, MutexGuard, PoisonError};

pub use consumer::{snapshot, FrameSink, StreamConsumer, StreamEnd, StreamSummary};
pub use controller::{PipelineController, PipelineState, PipelineStatus};
pub use ringbuf::FrameQueue;

/// Lock, recovering the data if a holder panicked.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
