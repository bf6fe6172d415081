//! Test-pattern sensor, for running without camera hardware

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use image::codecs::jpeg::JpegEncoder;
use image::ExtendedColorType;

use super::frame::{FrameSize, PixelFormat};
use super::sensor::{RawCapture, Sensor, SensorError};
use crate::settings::CameraSettings;

/// What the synthetic sensor emits
#[derive(Debug, Clone)]
pub enum SyntheticMode {
    /// A JPEG-encoded gradient, as a JPEG-native sensor would produce
    Jpeg,
    /// Uncompressed frames in the given format
    Raw(PixelFormat),
    /// The same bytes every time, reported with the given format tag
    Fixed(Bytes, PixelFormat),
}

/// Call counters and failure switches, shared with whoever built the sensor.
#[derive(Debug, Default)]
pub struct SyntheticControls {
    pub init_calls: AtomicUsize,
    pub deinit_calls: AtomicUsize,
    pub probe_calls: AtomicUsize,
    pub grab_calls: AtomicUsize,
    pub apply_calls: AtomicUsize,
    pub frames_emitted: AtomicUsize,
    /// Make the next `init` calls fail
    pub fail_init: AtomicBool,
    /// Make `probe` fail
    pub fail_probe: AtomicBool,
    /// Report "no frame ready" on every grab
    pub starve: AtomicBool,
}

impl SyntheticControls {
    pub fn count(counter: &AtomicUsize) -> usize {
        counter.load(Ordering::SeqCst)
    }

    /// Total driver calls of any kind
    pub fn hardware_calls(&self) -> usize {
        [
            &self.init_calls,
            &self.deinit_calls,
            &self.probe_calls,
            &self.grab_calls,
            &self.apply_calls,
        ]
        .iter()
        .map(|c| c.load(Ordering::SeqCst))
        .sum()
    }
}

pub struct SyntheticSensor {
    mode: SyntheticMode,
    frame_interval: Duration,
    controls: Arc<SyntheticControls>,
    size: Option<(u32, u32)>,
    jpeg: Option<Bytes>,
    last_frame: Option<Instant>,
    tick: u8,
}

impl SyntheticSensor {
    pub fn new(mode: SyntheticMode, fps: u32) -> Self {
        Self {
            mode,
            frame_interval: Duration::from_secs(1) / fps.max(1),
            controls: Arc::new(SyntheticControls::default()),
            size: None,
            jpeg: None,
            last_frame: None,
            tick: 0,
        }
    }

    pub fn controls(&self) -> Arc<SyntheticControls> {
        Arc::clone(&self.controls)
    }

    fn pattern(&self, width: u32, height: u32, format: PixelFormat) -> Option<Vec<u8>> {
        let bpp = format.bytes_per_pixel()?;
        let mut data = Vec::with_capacity(width as usize * height as usize * bpp);
        for y in 0..height {
            for x in 0..width {
                let v = ((x + y) as u8).wrapping_add(self.tick);
                match format {
                    PixelFormat::Grayscale => data.push(v),
                    PixelFormat::Rgb888 => data.extend_from_slice(&[v, (y as u8), (x as u8)]),
                    PixelFormat::Rgb565 => {
                        let px = ((v as u16 >> 3) << 11) | ((y as u16 & 0x3f) << 5) | (x as u16 & 0x1f);
                        data.extend_from_slice(&px.to_be_bytes());
                    }
                    // YUYV: luma per pixel, alternating U/V chroma
                    PixelFormat::Yuv422 => {
                        data.push(v);
                        data.push(if x % 2 == 0 { 96 } else { 160 });
                    }
                    PixelFormat::Jpeg => return None,
                }
            }
        }
        Some(data)
    }

    fn encode_jpeg(&self, width: u32, height: u32) -> Result<Bytes, SensorError> {
        let rgb = self
            .pattern(width, height, PixelFormat::Rgb888)
            .ok_or(SensorError::UnsupportedFormat(PixelFormat::Rgb888))?;
        let mut out = Vec::new();
        JpegEncoder::new_with_quality(&mut out, 85)
            .encode(&rgb, width, height, ExtendedColorType::Rgb8)
            .map_err(|e| SensorError::Init(e.to_string()))?;
        Ok(Bytes::from(out))
    }
}

impl Sensor for SyntheticSensor {
    fn name(&self) -> &str {
        "synthetic"
    }

    fn init(&mut self, size: FrameSize) -> Result<(), SensorError> {
        self.controls.init_calls.fetch_add(1, Ordering::SeqCst);
        if self.controls.fail_init.load(Ordering::SeqCst) {
            return Err(SensorError::Init("injected init failure".into()));
        }
        let (width, height) = size.dimensions();
        self.jpeg = match self.mode {
            SyntheticMode::Jpeg => Some(self.encode_jpeg(width, height)?),
            _ => None,
        };
        self.size = Some((width, height));
        self.last_frame = None;
        Ok(())
    }

    fn deinit(&mut self) -> Result<(), SensorError> {
        self.controls.deinit_calls.fetch_add(1, Ordering::SeqCst);
        self.size = None;
        self.jpeg = None;
        Ok(())
    }

    fn probe(&mut self) -> Result<(), SensorError> {
        self.controls.probe_calls.fetch_add(1, Ordering::SeqCst);
        if self.controls.fail_probe.load(Ordering::SeqCst) {
            return Err(SensorError::Probe("injected probe failure".into()));
        }
        self.size.map(|_| ()).ok_or(SensorError::NotInitialized)
    }

    fn grab(&mut self) -> Result<Option<RawCapture>, SensorError> {
        self.controls.grab_calls.fetch_add(1, Ordering::SeqCst);
        let (width, height) = self.size.ok_or(SensorError::NotInitialized)?;
        if self.controls.starve.load(Ordering::SeqCst) {
            return Ok(None);
        }
        if let Some(last) = self.last_frame {
            if last.elapsed() < self.frame_interval {
                return Ok(None);
            }
        }
        self.last_frame = Some(Instant::now());
        self.tick = self.tick.wrapping_add(1);

        let (data, format) = match &self.mode {
            SyntheticMode::Jpeg => (self.jpeg.clone().unwrap_or_default(), PixelFormat::Jpeg),
            SyntheticMode::Raw(format) => {
                let data = self
                    .pattern(width, height, *format)
                    .ok_or(SensorError::UnsupportedFormat(*format))?;
                (Bytes::from(data), *format)
            }
            SyntheticMode::Fixed(data, format) => (data.clone(), *format),
        };

        self.controls.frames_emitted.fetch_add(1, Ordering::SeqCst);
        Ok(Some(RawCapture {
            data,
            width,
            height,
            format,
        }))
    }

    fn apply(&mut self, _settings: &CameraSettings) -> Result<(), SensorError> {
        self.controls.apply_calls.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}
