//! Background capture thread

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use tracing::{debug, info};

use super::lock;
use super::ringbuf::FrameQueue;
use crate::capture::CaptureDevice;

/// Owns the thread that moves frames from the sensor into the queue.
///
/// Dropping the producer stops the thread and waits for it.
pub struct CaptureProducer {
    stop: Arc<AtomicBool>,
    handle: Option<JoinHandle<u64>>,
}

impl CaptureProducer {
    pub fn spawn(
        device: Arc<Mutex<CaptureDevice>>,
        queue: Arc<FrameQueue>,
        idle: Duration,
    ) -> std::io::Result<Self> {
        let stop = Arc::new(AtomicBool::new(false));
        let handle = {
            let stop = Arc::clone(&stop);
            thread::Builder::new()
                .name("capture".into())
                .spawn(move || capture_loop(&device, &queue, &stop, idle))?
        };
        info!("Capture producer started");
        Ok(Self {
            stop,
            handle: Some(handle),
        })
    }

    pub fn is_running(&self) -> bool {
        self.handle.as_ref().is_some_and(|h| !h.is_finished())
    }

    /// Signal the thread and wait for it. Errors if the thread panicked.
    pub fn stop(mut self) -> Result<u64, String> {
        self.shutdown()
    }

    fn shutdown(&mut self) -> Result<u64, String> {
        self.stop.store(true, Ordering::Release);
        let Some(handle) = self.handle.take() else {
            return Ok(0);
        };
        match handle.join() {
            Ok(produced) => {
                info!(produced, "Capture producer stopped");
                Ok(produced)
            }
            Err(_) => Err("capture thread panicked".into()),
        }
    }
}

impl Drop for CaptureProducer {
    fn drop(&mut self) {
        let _ = self.shutdown();
    }
}

fn capture_loop(
    device: &Mutex<CaptureDevice>,
    queue: &FrameQueue,
    stop: &AtomicBool,
    idle: Duration,
) -> u64 {
    let mut produced = 0u64;
    while !stop.load(Ordering::Acquire) {
        let frame = lock(device).acquire();
        match frame {
            Some(frame) => {
                produced += 1;
                if !queue.push(frame) {
                    debug!("Queue full, oldest frame evicted");
                }
                metrics::counter!("campipe_frames_captured_total").increment(1);
            }
            // Sensor not ready or every buffer in flight
            None => thread::sleep(idle),
        }
    }
    produced
}
