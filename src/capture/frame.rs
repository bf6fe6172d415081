use std::fmt;
use std::sync::Arc;
use std::time::Instant;

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use super::pool::PoolLease;

/// One captured frame, backed by a slot of the hardware buffer pool.
///
/// The slot goes back to the pool when the frame is dropped, so every exit
/// path (served, evicted, abandoned during reinitialization) returns it
/// exactly once. There is no way to release a frame twice: `release`
/// consumes it.
pub struct FrameBuffer {
    /// Frame bytes - can be shared across threads without copying
    pub data: Bytes,

    /// Frame metadata
    pub meta: Arc<FrameMetadata>,

    /// Capture timestamp for latency tracking
    pub timestamp: Instant,

    _lease: PoolLease,
}

impl FrameBuffer {
    pub(crate) fn new(data: Bytes, meta: FrameMetadata, lease: PoolLease) -> Self {
        Self {
            data,
            meta: Arc::new(meta),
            timestamp: Instant::now(),
            _lease: lease,
        }
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Return the buffer to the hardware pool.
    pub fn release(self) {
        drop(self);
    }
}

impl fmt::Debug for FrameBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FrameBuffer")
            .field("len", &self.data.len())
            .field("meta", &self.meta)
            .finish()
    }
}

/// Frame metadata
#[derive(Debug, Clone)]
pub struct FrameMetadata {
    pub sequence: u64,
    pub width: u32,
    pub height: u32,
    /// Encoding reported by the driver. Not trusted for JPEG detection,
    /// see [`crate::capture::decoder::is_jpeg`].
    pub format: PixelFormat,
}

/// Pixel formats a sensor may hand us
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PixelFormat {
    Jpeg,
    Rgb565,
    Yuv422,
    Grayscale,
    Rgb888,
}

impl PixelFormat {
    /// Bytes per pixel for uncompressed formats.
    pub fn bytes_per_pixel(self) -> Option<usize> {
        match self {
            PixelFormat::Jpeg => None,
            PixelFormat::Grayscale => Some(1),
            PixelFormat::Rgb565 | PixelFormat::Yuv422 => Some(2),
            PixelFormat::Rgb888 => Some(3),
        }
    }
}

/// Capture resolutions, indexed the way sensor firmware numbers them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "FrameSizeRepr", into = "u8")]
pub enum FrameSize {
    P96x96,
    Qqvga,
    Qcif,
    Hqvga,
    P240x240,
    Qvga,
    Cif,
    Hvga,
    Vga,
    Svga,
    Xga,
    Hd,
    Sxga,
    Uxga,
}

const FRAME_SIZES: [(FrameSize, &str, u32, u32); 14] = [
    (FrameSize::P96x96, "96X96", 96, 96),
    (FrameSize::Qqvga, "QQVGA", 160, 120),
    (FrameSize::Qcif, "QCIF", 176, 144),
    (FrameSize::Hqvga, "HQVGA", 240, 176),
    (FrameSize::P240x240, "240X240", 240, 240),
    (FrameSize::Qvga, "QVGA", 320, 240),
    (FrameSize::Cif, "CIF", 400, 296),
    (FrameSize::Hvga, "HVGA", 480, 320),
    (FrameSize::Vga, "VGA", 640, 480),
    (FrameSize::Svga, "SVGA", 800, 600),
    (FrameSize::Xga, "XGA", 1024, 768),
    (FrameSize::Hd, "HD", 1280, 720),
    (FrameSize::Sxga, "SXGA", 1280, 1024),
    (FrameSize::Uxga, "UXGA", 1600, 1200),
];

impl FrameSize {
    pub const MAX_INDEX: u8 = 13;

    pub fn from_index(index: u8) -> Option<Self> {
        FRAME_SIZES.get(index as usize).map(|entry| entry.0)
    }

    pub fn from_name(name: &str) -> Option<Self> {
        FRAME_SIZES
            .iter()
            .find(|entry| entry.1.eq_ignore_ascii_case(name.trim()))
            .map(|entry| entry.0)
    }

    pub fn index(self) -> u8 {
        self as u8
    }

    pub fn name(self) -> &'static str {
        FRAME_SIZES[self as usize].1
    }

    /// Width and height in pixels.
    pub fn dimensions(self) -> (u32, u32) {
        let entry = &FRAME_SIZES[self as usize];
        (entry.2, entry.3)
    }
}

impl fmt::Display for FrameSize {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let (w, h) = self.dimensions();
        write!(f, "{} ({}x{})", self.name(), w, h)
    }
}

impl From<FrameSize> for u8 {
    fn from(size: FrameSize) -> u8 {
        size.index()
    }
}

/// Wire form of a frame size: either the numeric index or the name.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FrameSizeRepr {
    Index(i64),
    Name(String),
}

impl fmt::Display for FrameSizeRepr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FrameSizeRepr::Index(i) => write!(f, "{i}"),
            FrameSizeRepr::Name(n) => write!(f, "{n:?}"),
        }
    }
}

impl TryFrom<FrameSizeRepr> for FrameSize {
    type Error = String;

    fn try_from(repr: FrameSizeRepr) -> Result<Self, Self::Error> {
        let size = match &repr {
            FrameSizeRepr::Index(i) => u8::try_from(*i).ok().and_then(FrameSize::from_index),
            FrameSizeRepr::Name(n) => FrameSize::from_name(n),
        };
        size.ok_or_else(|| {
            format!(
                "framesize {repr} is not a known size (0-{} or a name like \"VGA\")",
                FrameSize::MAX_INDEX
            )
        })
    }
}
