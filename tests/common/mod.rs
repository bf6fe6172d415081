#![allow(dead_code)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use campipe::capture::decoder::{ConversionError, JpegTranscoder, Transcoder};
use campipe::capture::frame::{FrameSize, PixelFormat};
use campipe::capture::synthetic::{SyntheticControls, SyntheticMode, SyntheticSensor};
use campipe::settings::{CameraSettings, MemoryStore};
use campipe::{FrameBuffer, PipelineConfig, PipelineController};

pub fn fast_config() -> PipelineConfig {
    PipelineConfig {
        queue_capacity: 2,
        snapshot_wait_ms: 2000,
        stream_poll_ms: 1,
        stream_frame_interval_ms: 1,
        producer_idle_ms: 1,
        settle_delay_ms: 1,
        flush_frames: 3,
        jpeg_quality: 80,
    }
}

pub struct Harness {
    pub pipeline: Arc<PipelineController>,
    pub controls: Arc<SyntheticControls>,
    pub store: Arc<MemoryStore>,
}

pub fn harness(mode: SyntheticMode, framesize: FrameSize) -> Harness {
    harness_with(mode, framesize, Arc::new(JpegTranscoder::new(80)))
}

pub fn harness_with(
    mode: SyntheticMode,
    framesize: FrameSize,
    transcoder: Arc<dyn Transcoder>,
) -> Harness {
    let sensor = SyntheticSensor::new(mode, 1000);
    let controls = sensor.controls();
    let store = Arc::new(MemoryStore::new());
    let defaults = CameraSettings {
        framesize,
        ..CameraSettings::default()
    };
    let pipeline = Arc::new(PipelineController::with_transcoder(
        fast_config(),
        Box::new(sensor),
        4,
        defaults,
        store.clone(),
        transcoder,
    ));
    Harness {
        pipeline,
        controls,
        store,
    }
}

/// A baseline JPEG: SOI, APP0 marker, filler, EOI
pub fn jpeg_bytes() -> Bytes {
    let mut data = vec![0xFF, 0xD8, 0xFF, 0xE0];
    data.extend((0..200).map(|i| i as u8));
    data.extend_from_slice(&[0xFF, 0xD9]);
    Bytes::from(data)
}

/// A raw RGB565 frame sized for `framesize`
pub fn rgb565_bytes(framesize: FrameSize) -> Bytes {
    let (w, h) = framesize.dimensions();
    Bytes::from(
        (0..(w * h * 2) as usize)
            .map(|i| (i % 251) as u8 | 0x01)
            .collect::<Vec<u8>>(),
    )
}

pub fn raw_mode() -> SyntheticMode {
    SyntheticMode::Raw(PixelFormat::Rgb565)
}

/// Transcoder that rejects every other frame
#[derive(Default)]
pub struct FlakyTranscoder {
    calls: AtomicUsize,
}

impl Transcoder for FlakyTranscoder {
    fn transcode(&self, frame: &FrameBuffer) -> Result<Vec<u8>, ConversionError> {
        if self.calls.fetch_add(1, Ordering::SeqCst) % 2 == 0 {
            return Err(ConversionError::EmptyOutput);
        }
        JpegTranscoder::new(50).transcode(frame)
    }
}

pub fn wait_until(timeout: Duration, mut cond: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if cond() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(2));
    }
    cond()
}

pub fn count(counter: &AtomicUsize) -> usize {
    counter.load(Ordering::SeqCst)
}
