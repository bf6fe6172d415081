//! Pipeline lifecycle and the resolution-change protocol

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use arc_swap::ArcSwap;
use crossbeam::atomic::AtomicCell;
use serde::Serialize;
use tracing::{debug, error, info, instrument, warn};

use super::lock;
use super::producer::CaptureProducer;
use super::ringbuf::{FrameQueue, QueueStats};
use crate::capture::decoder::{FormatNormalizer, JpegTranscoder, Transcoder};
use crate::capture::frame::FrameSize;
use crate::capture::pool::{HardwarePool, PoolStats};
use crate::capture::sensor::{CaptureDevice, Sensor};
use crate::error::{PipelineError, Result};
use crate::settings::{CameraSettings, SettingsPatch, SettingsStore};
use crate::PipelineConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PipelineState {
    Uninitialized,
    Initialized,
    InitFailed,
    Started,
    StartFailed,
    Stopped,
    StopFailed,
}

impl PipelineState {
    /// Hardware has been brought up and not lost since.
    pub fn hardware_ready(self) -> bool {
        !matches!(self, PipelineState::Uninitialized | PipelineState::InitFailed)
    }
}

/// Counters reported alongside the status
#[derive(Debug, Clone, Copy, Serialize)]
pub struct PipelineStats {
    pub queue: QueueStats,
    pub buffers: PoolStats,
    pub transcoded: u64,
}

/// Body of the status endpoint
#[derive(Debug, Clone, Serialize)]
pub struct PipelineStatus {
    pub initialized: bool,
    pub status: PipelineState,
    pub streaming: bool,
    /// Resolution the hardware is running; differs from `settings.framesize`
    /// while a framesize change waits for the next start
    pub active_framesize: Option<FrameSize>,
    pub settings: CameraSettings,
    pub stats: PipelineStats,
}

struct Lifecycle {
    device: Arc<Mutex<CaptureDevice>>,
    producer: Option<CaptureProducer>,
}

/// Owns the capture hardware, the producer thread and the frame queue.
///
/// Lifecycle operations (`init`, `start`, `stop`, `reinitialize`) block and
/// are serialized against each other. Consumers only touch the queue and the
/// streaming flag, so they never wait on a lifecycle operation.
pub struct PipelineController {
    config: PipelineConfig,
    defaults: CameraSettings,
    queue: Arc<FrameQueue>,
    pool: Arc<HardwarePool>,
    normalizer: FormatNormalizer,
    store: Arc<dyn SettingsStore>,
    state: AtomicCell<PipelineState>,
    streaming: AtomicBool,
    settings: ArcSwap<CameraSettings>,
    active_framesize: AtomicCell<Option<FrameSize>>,
    lifecycle: Mutex<Lifecycle>,
}

impl PipelineController {
    pub fn new(
        config: PipelineConfig,
        sensor: Box<dyn Sensor>,
        buffer_count: usize,
        defaults: CameraSettings,
        store: Arc<dyn SettingsStore>,
    ) -> Self {
        let transcoder: Arc<dyn Transcoder> = Arc::new(JpegTranscoder::new(config.jpeg_quality));
        Self::with_transcoder(config, sensor, buffer_count, defaults, store, transcoder)
    }

    pub fn with_transcoder(
        config: PipelineConfig,
        sensor: Box<dyn Sensor>,
        buffer_count: usize,
        defaults: CameraSettings,
        store: Arc<dyn SettingsStore>,
        transcoder: Arc<dyn Transcoder>,
    ) -> Self {
        let device = CaptureDevice::new(sensor, buffer_count);
        let pool = Arc::clone(device.pool());
        Self {
            queue: Arc::new(FrameQueue::new(config.queue_capacity)),
            pool,
            normalizer: FormatNormalizer::new(transcoder),
            store,
            state: AtomicCell::new(PipelineState::Uninitialized),
            streaming: AtomicBool::new(false),
            settings: ArcSwap::from_pointee(defaults),
            active_framesize: AtomicCell::new(None),
            lifecycle: Mutex::new(Lifecycle {
                device: Arc::new(Mutex::new(device)),
                producer: None,
            }),
            defaults,
            config,
        }
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn state(&self) -> PipelineState {
        self.state.load()
    }

    pub fn is_started(&self) -> bool {
        self.state() == PipelineState::Started
    }

    fn set_state(&self, next: PipelineState) {
        let prev = self.state.swap(next);
        if prev != next {
            info!("Pipeline {:?} -> {:?}", prev, next);
        }
    }

    pub fn queue(&self) -> &FrameQueue {
        &self.queue
    }

    pub fn normalizer(&self) -> &FormatNormalizer {
        &self.normalizer
    }

    pub fn settings(&self) -> CameraSettings {
        **self.settings.load()
    }

    pub fn is_streaming(&self) -> bool {
        self.streaming.load(Ordering::Acquire)
    }

    /// Claim the streaming flag. Fails if a stream already holds it.
    pub(crate) fn try_begin_stream(&self) -> bool {
        self.streaming
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    pub(crate) fn end_stream(&self) {
        self.streaming.store(false, Ordering::Release);
    }

    pub fn active_framesize(&self) -> Option<FrameSize> {
        self.active_framesize.load()
    }

    fn track_device(&self, device: &CaptureDevice) {
        self.active_framesize.store(device.framesize());
    }

    pub fn status(&self) -> PipelineStatus {
        let state = self.state();
        PipelineStatus {
            initialized: state.hardware_ready(),
            status: state,
            streaming: self.is_streaming(),
            active_framesize: state
                .hardware_ready()
                .then(|| self.active_framesize())
                .flatten(),
            settings: self.settings(),
            stats: PipelineStats {
                queue: self.queue.stats(),
                buffers: self.pool.stats(),
                transcoded: self.normalizer.transcoded_count(),
            },
        }
    }

    fn persisted_settings(&self) -> CameraSettings {
        CameraSettings::load(self.store.as_ref(), self.defaults).unwrap_or_else(|e| {
            warn!("Could not read persisted settings, using current: {}", e);
            self.settings()
        })
    }

    /// Bring the hardware up from scratch. This is the only way out of
    /// `InitFailed`.
    #[instrument(skip(self))]
    pub fn init(&self) -> Result<()> {
        let mut lc = lock(&self.lifecycle);
        if let Some(producer) = lc.producer.take() {
            if let Err(e) = producer.stop() {
                warn!("Producer did not stop cleanly before init: {}", e);
            }
        }
        self.queue.drain();

        let settings = self.persisted_settings();
        let mut device = lock(&lc.device);
        if let Err(e) = device.deinit() {
            warn!("Deinit before init failed: {}", e);
        }

        let brought_up = device.init(settings.framesize).and_then(|_| device.probe());
        self.track_device(&device);
        if let Err(e) = brought_up {
            error!("Camera init failed: {}", e);
            self.set_state(PipelineState::InitFailed);
            return Err(e.into());
        }
        if let Err(e) = device.apply(&settings) {
            warn!("Could not apply settings after init: {}", e);
        }

        self.settings.store(Arc::new(settings));
        self.set_state(PipelineState::Initialized);
        Ok(())
    }

    /// Start capturing. Persisted settings are reloaded first; a persisted
    /// framesize that differs from the active one triggers a rebuild.
    #[instrument(skip(self))]
    pub fn start(&self) -> Result<()> {
        let mut lc = lock(&self.lifecycle);
        match self.state() {
            PipelineState::Started => return Ok(()),
            PipelineState::Uninitialized | PipelineState::InitFailed => {
                return Err(PipelineError::NotInitialized)
            }
            PipelineState::Initialized
            | PipelineState::Stopped
            | PipelineState::StartFailed
            | PipelineState::StopFailed => {}
        }

        let settings = self.persisted_settings();
        let active = lock(&lc.device).framesize();
        if active != Some(settings.framesize) {
            info!(
                "Persisted framesize {} differs from active {:?}, rebuilding",
                settings.framesize, active
            );
            self.rebuild(&lc.device, settings.framesize)?;
        } else if let Err(e) = lock(&lc.device).apply(&settings) {
            warn!("Could not apply settings on start: {}", e);
        }
        self.settings.store(Arc::new(settings));

        self.spawn_producer(&mut lc)
    }

    fn spawn_producer(&self, lc: &mut Lifecycle) -> Result<()> {
        match CaptureProducer::spawn(
            Arc::clone(&lc.device),
            Arc::clone(&self.queue),
            self.config.producer_idle(),
        ) {
            Ok(producer) => {
                lc.producer = Some(producer);
                self.set_state(PipelineState::Started);
                Ok(())
            }
            Err(e) => {
                error!("Could not spawn capture thread: {}", e);
                self.set_state(PipelineState::StartFailed);
                Err(PipelineError::StartFailed(e.to_string()))
            }
        }
    }

    /// Stop capturing and release every queued frame. Hardware stays
    /// initialized.
    #[instrument(skip(self))]
    pub fn stop(&self) -> Result<()> {
        let mut lc = lock(&self.lifecycle);
        match self.state() {
            PipelineState::Started | PipelineState::StopFailed => {}
            PipelineState::Stopped => return Ok(()),
            _ => return Err(PipelineError::NotStarted),
        }

        if let Some(producer) = lc.producer.take() {
            if let Err(e) = producer.stop() {
                error!("Capture producer failed: {}", e);
                self.queue.drain();
                self.set_state(PipelineState::StopFailed);
                return Err(PipelineError::StopFailed(e));
            }
        }

        let drained = self.queue.drain();
        debug!(drained, "Queue drained on stop");
        self.set_state(PipelineState::Stopped);
        Ok(())
    }

    /// Change resolution with the hardware torn down and rebuilt. Succeeds
    /// immediately if `framesize` is already active. On failure the pipeline
    /// is left in `InitFailed`.
    #[instrument(skip(self))]
    pub fn reinitialize(&self, framesize: FrameSize) -> Result<()> {
        let mut lc = lock(&self.lifecycle);
        if !self.state().hardware_ready() {
            return Err(PipelineError::NotInitialized);
        }
        if lock(&lc.device).framesize() == Some(framesize) {
            debug!("Framesize {} already active", framesize);
            return Ok(());
        }

        let resume = lc.producer.is_some();
        if let Some(producer) = lc.producer.take() {
            if let Err(e) = producer.stop() {
                warn!("Producer did not stop cleanly: {}", e);
            }
        }

        self.rebuild(&lc.device, framesize)?;

        let mut settings = self.settings();
        settings.framesize = framesize;
        if let Err(e) = settings.save(self.store.as_ref()) {
            warn!("Could not persist framesize: {}", e);
        }
        self.settings.store(Arc::new(settings));

        if resume {
            self.spawn_producer(&mut lc)?;
        }
        Ok(())
    }

    /// Drain, tear down, settle, bring up at `framesize`, verify, reapply
    /// settings and flush the first frames. The producer must not be running.
    fn rebuild(&self, device: &Mutex<CaptureDevice>, framesize: FrameSize) -> Result<()> {
        let drained = self.queue.drain();
        let mut device = lock(device);
        info!(drained, from = ?device.framesize(), to = %framesize, "Reinitializing camera");

        if let Err(e) = device.deinit() {
            warn!("Deinit failed, continuing with rebuild: {}", e);
        }
        thread::sleep(self.config.settle_delay());

        let brought_up = device.init(framesize).and_then(|_| device.probe());
        self.track_device(&device);
        if let Err(e) = brought_up {
            error!("Camera rebuild at {} failed: {}", framesize, e);
            self.set_state(PipelineState::InitFailed);
            return Err(PipelineError::ReinitFailed(e.to_string()));
        }

        let mut settings = self.persisted_settings();
        settings.framesize = framesize;
        if let Err(e) = device.apply(&settings) {
            warn!("Could not reapply settings after rebuild: {}", e);
        }

        // Let exposure and white balance settle
        let wait = self.config.snapshot_wait();
        for n in 0..self.config.flush_frames {
            match wait_for_frame(&mut device, wait, self.config.producer_idle()) {
                Some(frame) => frame.release(),
                None => {
                    warn!("Sensor produced only {} frames while settling", n);
                    break;
                }
            }
        }
        Ok(())
    }

    /// Apply a settings update. Image parameters take effect immediately when
    /// the hardware is up; a framesize change is only persisted and picked up
    /// by the next `start`.
    pub fn update_settings(&self, patch: SettingsPatch) -> Result<CameraSettings> {
        let lc = lock(&self.lifecycle);
        let next = self.settings().merged(patch)?;
        next.save(self.store.as_ref())?;

        if self.state().hardware_ready() {
            if let Err(e) = lock(&lc.device).apply(&next) {
                warn!("Could not apply settings live: {}", e);
            }
        }
        self.settings.store(Arc::new(next));
        info!(settings = ?next, "Camera settings updated");
        Ok(next)
    }

    /// Stop everything and power the sensor down.
    pub fn shutdown(&self) {
        if self.is_started() {
            if let Err(e) = self.stop() {
                warn!("Stop during shutdown failed: {}", e);
            }
        }
        let lc = lock(&self.lifecycle);
        self.queue.drain();
        let mut device = lock(&lc.device);
        if let Err(e) = device.deinit() {
            warn!("Deinit during shutdown failed: {}", e);
        }
        self.track_device(&device);
        info!("Pipeline shut down");
    }
}

fn wait_for_frame(
    device: &mut CaptureDevice,
    timeout: Duration,
    poll: Duration,
) -> Option<crate::capture::FrameBuffer> {
    let deadline = Instant::now() + timeout;
    loop {
        if let Some(frame) = device.acquire() {
            return Some(frame);
        }
        if Instant::now() >= deadline {
            return None;
        }
        thread::sleep(poll);
    }
}
