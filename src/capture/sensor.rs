//! Sensor backends and the hardware pool they fill

use std::io;
use std::sync::Arc;

use bytes::Bytes;
use tracing::{debug, info, instrument, warn};

use super::frame::{FrameBuffer, FrameMetadata, FrameSize, PixelFormat};
use super::pool::{HardwarePool, PoolStats};
use crate::settings::CameraSettings;

#[derive(Debug, thiserror::Error)]
pub enum SensorError {
    #[error("sensor is not initialized")]
    NotInitialized,

    #[error("sensor initialization failed: {0}")]
    Init(String),

    #[error("sensor probe failed: {0}")]
    Probe(String),

    #[error("unsupported pixel format {0:?}")]
    UnsupportedFormat(PixelFormat),

    #[error("device I/O: {0}")]
    Io(#[from] io::Error),
}

/// Bytes pulled off the sensor, before they are bound to a pool slot
#[derive(Debug, Clone)]
pub struct RawCapture {
    pub data: Bytes,
    pub width: u32,
    pub height: u32,
    pub format: PixelFormat,
}

/// Driver-level camera operations.
///
/// Implementations are owned by a [`CaptureDevice`] and only ever called
/// from one thread at a time.
pub trait Sensor: Send {
    fn name(&self) -> &str;

    /// Power up and allocate buffers for `size`.
    fn init(&mut self, size: FrameSize) -> Result<(), SensorError>;

    /// Release buffers and power down.
    fn deinit(&mut self) -> Result<(), SensorError>;

    /// Check that the initialized handle answers.
    fn probe(&mut self) -> Result<(), SensorError>;

    /// Non-blocking pull. `Ok(None)` means no frame is ready yet.
    fn grab(&mut self) -> Result<Option<RawCapture>, SensorError>;

    /// Push image-quality settings to the sensor. Resolution is not changed
    /// here; that goes through `init`.
    fn apply(&mut self, settings: &CameraSettings) -> Result<(), SensorError>;
}

/// A sensor together with the buffer pool its frames are drawn from.
pub struct CaptureDevice {
    sensor: Box<dyn Sensor>,
    pool: Arc<HardwarePool>,
    framesize: Option<FrameSize>,
    sequence: u64,
}

impl CaptureDevice {
    pub fn new(sensor: Box<dyn Sensor>, buffer_count: usize) -> Self {
        Self {
            sensor,
            pool: HardwarePool::new(buffer_count),
            framesize: None,
            sequence: 0,
        }
    }

    pub fn sensor_name(&self) -> &str {
        self.sensor.name()
    }

    /// Resolution the hardware is currently set up for, if initialized.
    pub fn framesize(&self) -> Option<FrameSize> {
        self.framesize
    }

    pub fn is_initialized(&self) -> bool {
        self.framesize.is_some()
    }

    #[instrument(skip(self), fields(sensor = self.sensor.name()))]
    pub fn init(&mut self, size: FrameSize) -> Result<(), SensorError> {
        self.sensor.init(size)?;
        self.framesize = Some(size);
        info!("Sensor initialized at {}", size);
        Ok(())
    }

    #[instrument(skip(self), fields(sensor = self.sensor.name()))]
    pub fn deinit(&mut self) -> Result<(), SensorError> {
        if self.framesize.take().is_none() {
            return Ok(());
        }
        if self.pool.outstanding() > 0 {
            warn!(
                outstanding = self.pool.outstanding(),
                "Deinitializing with frame buffers still in flight"
            );
        }
        self.sensor.deinit()?;
        info!("Sensor deinitialized");
        Ok(())
    }

    pub fn probe(&mut self) -> Result<(), SensorError> {
        if self.framesize.is_none() {
            return Err(SensorError::NotInitialized);
        }
        self.sensor.probe()
    }

    pub fn apply(&mut self, settings: &CameraSettings) -> Result<(), SensorError> {
        if self.framesize.is_none() {
            return Err(SensorError::NotInitialized);
        }
        self.sensor.apply(settings)
    }

    /// Pull one frame into a free pool slot.
    ///
    /// Returns `None` if the sensor has nothing ready, every slot is in
    /// flight, or the driver reported an error.
    pub fn acquire(&mut self) -> Option<FrameBuffer> {
        self.framesize?;
        if !self.pool.has_free_slot() {
            return None;
        }

        let raw = match self.sensor.grab() {
            Ok(Some(raw)) => raw,
            Ok(None) => return None,
            Err(e) => {
                debug!("Sensor grab failed: {}", e);
                return None;
            }
        };
        // Only this device leases from the pool, so the slot seen above is still free
        let lease = self.pool.lease()?;

        self.sequence += 1;
        let meta = FrameMetadata {
            sequence: self.sequence,
            width: raw.width,
            height: raw.height,
            format: raw.format,
        };
        Some(FrameBuffer::new(raw.data, meta, lease))
    }

    pub fn pool_stats(&self) -> PoolStats {
        self.pool.stats()
    }

    pub fn pool(&self) -> &Arc<HardwarePool> {
        &self.pool
    }
}
