//! V4L2 sensor backend with memory-mapped buffers

use std::io;

use bytes::Bytes;
use tracing::{debug, info, instrument, warn};
use v4l::buffer::Type;
use v4l::capability::Flags as CapFlags;
use v4l::control::{Control, Description, Value};
use v4l::io::traits::CaptureStream;
use v4l::prelude::MmapStream;
use v4l::video::Capture;
use v4l::{Device, FourCC};

use super::frame::{FrameSize, PixelFormat};
use super::sensor::{RawCapture, Sensor, SensorError};
use crate::settings::{CameraSettings, LEVEL_RANGE, QUALITY_RANGE};
use crate::CaptureConfig;

const CID_BRIGHTNESS: u32 = 0x0098_0900;
const CID_CONTRAST: u32 = 0x0098_0901;
const CID_SATURATION: u32 = 0x0098_0902;
const CID_JPEG_COMPRESSION_QUALITY: u32 = 0x009d_0903;

fn fourcc_for(format: PixelFormat) -> FourCC {
    match format {
        PixelFormat::Jpeg => FourCC::new(b"MJPG"),
        PixelFormat::Yuv422 => FourCC::new(b"YUYV"),
        PixelFormat::Grayscale => FourCC::new(b"GREY"),
        PixelFormat::Rgb565 => FourCC::new(b"RGBP"),
        PixelFormat::Rgb888 => FourCC::new(b"RGB3"),
    }
}

fn format_for(fourcc: FourCC) -> Option<PixelFormat> {
    [
        PixelFormat::Jpeg,
        PixelFormat::Yuv422,
        PixelFormat::Grayscale,
        PixelFormat::Rgb565,
        PixelFormat::Rgb888,
    ]
    .into_iter()
    .find(|f| fourcc_for(*f) == fourcc)
}

/// Map `value` from its settings range onto the control's own range.
fn scale(value: i64, (lo, hi): (i64, i64), desc: &Description) -> i64 {
    let span = desc.maximum - desc.minimum;
    desc.minimum + (value - lo) * span / (hi - lo)
}

/// V4L2 capture device
pub struct V4l2Sensor {
    config: CaptureConfig,
    device: Option<Box<Device>>,
    stream: Option<MmapStream<'static>>,
    width: u32,
    height: u32,
    format: PixelFormat,
}

impl V4l2Sensor {
    pub fn new(config: CaptureConfig) -> Self {
        let format = config.format;
        Self {
            config,
            device: None,
            stream: None,
            width: 0,
            height: 0,
            format,
        }
    }

    fn set_control(device: &Device, controls: &[Description], id: u32, value: i64, range: (i64, i64)) {
        let Some(desc) = controls.iter().find(|d| d.id == id) else {
            debug!("Control {:#x} not supported by device", id);
            return;
        };
        let value = scale(value, range, desc);
        if let Err(e) = device.set_control(Control {
            id,
            value: Value::Integer(value),
        }) {
            warn!("Failed to set {}: {}", desc.name, e);
        }
    }
}

impl Sensor for V4l2Sensor {
    fn name(&self) -> &str {
        "v4l2"
    }

    #[instrument(skip(self), fields(device = %self.config.device))]
    fn init(&mut self, size: FrameSize) -> Result<(), SensorError> {
        let device = Device::with_path(&self.config.device)?;

        let caps = device.query_caps()?;
        info!("Device: {} ({})", caps.card, caps.driver);

        if !caps.capabilities.contains(CapFlags::VIDEO_CAPTURE) {
            return Err(SensorError::Init("device doesn't support video capture".into()));
        }

        let (width, height) = size.dimensions();
        let mut fmt = device.format()?;
        fmt.width = width;
        fmt.height = height;
        fmt.fourcc = fourcc_for(self.config.format);

        // Drivers may substitute the nearest supported mode
        let actual = device.set_format(&fmt)?;
        let format = format_for(actual.fourcc).ok_or_else(|| {
            SensorError::Init(format!("driver selected unsupported format {}", actual.fourcc))
        })?;
        if (actual.width, actual.height) != (width, height) {
            warn!(
                "Requested {}x{}, driver chose {}x{}",
                width, height, actual.width, actual.height
            );
        }

        let mut stream =
            MmapStream::with_buffers(&device, Type::VideoCapture, self.config.buffer_count)?;
        // Bound DQBUF so a stalled camera cannot pin the device lock
        stream.set_timeout(self.config.grab_timeout());
        info!(
            "Capture stream started with {} buffers",
            self.config.buffer_count
        );

        self.width = actual.width;
        self.height = actual.height;
        self.format = format;
        self.stream = Some(stream);
        self.device = Some(Box::new(device));
        Ok(())
    }

    fn deinit(&mut self) -> Result<(), SensorError> {
        // Stream first: its buffers are mapped from the device
        self.stream = None;
        self.device = None;
        Ok(())
    }

    fn probe(&mut self) -> Result<(), SensorError> {
        let device = self.device.as_ref().ok_or(SensorError::NotInitialized)?;
        device
            .query_caps()
            .map_err(|e| SensorError::Probe(e.to_string()))?;
        if self.stream.is_none() {
            return Err(SensorError::Probe("stream not started".into()));
        }
        Ok(())
    }

    fn grab(&mut self) -> Result<Option<RawCapture>, SensorError> {
        let stream = self.stream.as_mut().ok_or(SensorError::NotInitialized)?;

        let (buf, meta) = match stream.next() {
            Ok(next) => next,
            Err(e) => return dequeue_failure(e),
        };
        let used = (meta.bytesused as usize).min(buf.len());
        if used == 0 {
            return Ok(None);
        }

        Ok(Some(RawCapture {
            data: Bytes::copy_from_slice(&buf[..used]),
            width: self.width,
            height: self.height,
            format: self.format,
        }))
    }

    fn apply(&mut self, settings: &CameraSettings) -> Result<(), SensorError> {
        let device = self.device.as_ref().ok_or(SensorError::NotInitialized)?;
        let controls = device.query_controls()?;

        Self::set_control(device, &controls, CID_BRIGHTNESS, settings.brightness as i64, LEVEL_RANGE);
        Self::set_control(device, &controls, CID_CONTRAST, settings.contrast as i64, LEVEL_RANGE);
        Self::set_control(device, &controls, CID_SATURATION, settings.saturation as i64, LEVEL_RANGE);
        // Sensor quality runs 0 (best) to 63; the V4L2 control runs the other way
        let (lo, hi) = QUALITY_RANGE;
        Self::set_control(
            device,
            &controls,
            CID_JPEG_COMPRESSION_QUALITY,
            hi - settings.quality as i64 + lo,
            QUALITY_RANGE,
        );
        Ok(())
    }
}

/// A dequeue that timed out or was interrupted just means no frame yet.
fn dequeue_failure(e: io::Error) -> Result<Option<RawCapture>, SensorError> {
    match e.kind() {
        io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted => {
            debug!("No frame dequeued: {}", e);
            Ok(None)
        }
        _ => Err(SensorError::Io(e)),
    }
}
