pub mod capture;
pub mod error;
pub mod http;
pub mod pipeline;
pub mod settings;

use std::path::{Path, PathBuf};
use std::time::Duration;

use capture::frame::{FrameSize, PixelFormat};
use serde::{Deserialize, Serialize};

pub use capture::{FrameBuffer, Sensor};
pub use error::{PipelineError, Result};
pub use pipeline::{PipelineController, PipelineState};

/// System configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub capture: CaptureConfig,
    pub pipeline: PipelineConfig,
    pub http: HttpConfig,
    pub storage: StorageConfig,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SensorBackend {
    V4l2,
    Synthetic,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CaptureConfig {
    pub backend: SensorBackend,
    pub device: String,
    pub format: PixelFormat,
    /// Framesize used until one has been persisted
    pub framesize: FrameSize,
    /// Hardware frame buffers (DMA slots)
    pub buffer_count: u32,
    /// Longest a single dequeue may wait on the driver
    pub grab_timeout_ms: u64,
}

impl CaptureConfig {
    pub fn grab_timeout(&self) -> Duration {
        Duration::from_millis(self.grab_timeout_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineConfig {
    pub queue_capacity: usize,
    pub snapshot_wait_ms: u64,
    pub stream_poll_ms: u64,
    pub stream_frame_interval_ms: u64,
    pub producer_idle_ms: u64,
    pub settle_delay_ms: u64,
    /// Frames discarded after a rebuild while exposure settles
    pub flush_frames: u32,
    /// Quality (1-100) used when transcoding raw frames
    pub jpeg_quality: u8,
}

impl PipelineConfig {
    pub fn snapshot_wait(&self) -> Duration {
        Duration::from_millis(self.snapshot_wait_ms)
    }

    pub fn stream_poll(&self) -> Duration {
        Duration::from_millis(self.stream_poll_ms)
    }

    pub fn stream_frame_interval(&self) -> Duration {
        Duration::from_millis(self.stream_frame_interval_ms)
    }

    pub fn producer_idle(&self) -> Duration {
        Duration::from_millis(self.producer_idle_ms)
    }

    pub fn settle_delay(&self) -> Duration {
        Duration::from_millis(self.settle_delay_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HttpConfig {
    pub bind: String,
    pub base_path: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// JSON file holding persisted settings; none keeps them in memory
    pub settings_path: Option<PathBuf>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            capture: CaptureConfig {
                backend: SensorBackend::V4l2,
                device: "/dev/video0".into(),
                format: PixelFormat::Jpeg,
                framesize: FrameSize::Vga,
                buffer_count: 4,
                grab_timeout_ms: 200,
            },
            pipeline: PipelineConfig {
                queue_capacity: 2,
                snapshot_wait_ms: 1000,
                stream_poll_ms: 10,
                stream_frame_interval_ms: 30,
                producer_idle_ms: 5,
                settle_delay_ms: 100,
                flush_frames: 3,
                jpeg_quality: 80,
            },
            http: HttpConfig {
                bind: "0.0.0.0:8080".into(),
                base_path: "/api/camera".into(),
            },
            storage: StorageConfig {
                settings_path: Some(PathBuf::from("campipe-settings.json")),
            },
        }
    }
}

impl Config {
    /// Defaults, overlaid by an optional TOML file, overlaid by
    /// `CAMPIPE__SECTION__KEY` environment variables.
    pub fn load(path: Option<&Path>) -> std::result::Result<Self, config::ConfigError> {
        let mut builder =
            config::Config::builder().add_source(config::Config::try_from(&Config::default())?);
        if let Some(path) = path {
            builder = builder.add_source(config::File::from(path).required(true));
        }
        builder
            .add_source(
                config::Environment::with_prefix("CAMPIPE")
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?
            .try_deserialize()
    }
}
