//! JPEG normalization for captured frames
//!
//! Whether a frame is already JPEG is decided by its start-of-image marker
//! alone. The driver's format tag is unreliable and is only used to pick a
//! conversion once the marker test has failed.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use image::codecs::jpeg::JpegEncoder;
use image::ExtendedColorType;
use tracing::debug;

use super::frame::{FrameBuffer, PixelFormat};

/// JPEG start-of-image marker
pub const JPEG_SOI: [u8; 2] = [0xFF, 0xD8];

pub fn is_jpeg(data: &[u8]) -> bool {
    data.starts_with(&JPEG_SOI)
}

#[derive(Debug, thiserror::Error)]
pub enum ConversionError {
    #[error("frame buffer is empty")]
    Empty,

    #[error("cannot transcode {0:?} frames")]
    UnsupportedFormat(PixelFormat),

    #[error("frame is {actual} bytes, expected {expected} for {width}x{height} {format:?}")]
    LengthMismatch {
        expected: usize,
        actual: usize,
        width: u32,
        height: u32,
        format: PixelFormat,
    },

    #[error("encoder rejected frame: {0}")]
    Encoder(#[from] image::ImageError),

    #[error("encoder produced no output")]
    EmptyOutput,
}

/// A frame guaranteed to hold JPEG bytes.
#[derive(Debug, Clone)]
pub enum JpegView {
    /// Shares the captured buffer; nothing extra was allocated
    Passthrough(Bytes),
    /// Separately allocated by the transcoder
    Transcoded(Bytes),
}

impl JpegView {
    pub fn as_bytes(&self) -> &[u8] {
        match self {
            JpegView::Passthrough(b) | JpegView::Transcoded(b) => b,
        }
    }

    pub fn into_bytes(self) -> Bytes {
        match self {
            JpegView::Passthrough(b) | JpegView::Transcoded(b) => b,
        }
    }

    /// True when the bytes are a separate allocation from the frame.
    pub fn is_transcoded(&self) -> bool {
        matches!(self, JpegView::Transcoded(_))
    }

    pub fn len(&self) -> usize {
        self.as_bytes().len()
    }

    pub fn is_empty(&self) -> bool {
        self.as_bytes().is_empty()
    }
}

/// Encodes a non-JPEG frame to JPEG.
pub trait Transcoder: Send + Sync {
    fn transcode(&self, frame: &FrameBuffer) -> Result<Vec<u8>, ConversionError>;
}

/// Software transcoder built on the `image` JPEG encoder
pub struct JpegTranscoder {
    quality: u8,
}

impl JpegTranscoder {
    pub fn new(quality: u8) -> Self {
        Self {
            quality: quality.clamp(1, 100),
        }
    }
}

impl Transcoder for JpegTranscoder {
    fn transcode(&self, frame: &FrameBuffer) -> Result<Vec<u8>, ConversionError> {
        let (width, height, format) = (frame.meta.width, frame.meta.height, frame.meta.format);
        let bpp = format
            .bytes_per_pixel()
            .ok_or(ConversionError::UnsupportedFormat(format))?;
        let expected = width as usize * height as usize * bpp;
        if expected == 0 || frame.len() != expected || (format == PixelFormat::Yuv422 && width % 2 != 0) {
            return Err(ConversionError::LengthMismatch {
                expected,
                actual: frame.len(),
                width,
                height,
                format,
            });
        }

        let converted;
        let (pixels, color) = match format {
            PixelFormat::Grayscale => (&frame.data[..], ExtendedColorType::L8),
            PixelFormat::Rgb888 => (&frame.data[..], ExtendedColorType::Rgb8),
            PixelFormat::Rgb565 => {
                converted = rgb565_to_rgb(&frame.data);
                (&converted[..], ExtendedColorType::Rgb8)
            }
            PixelFormat::Yuv422 => {
                converted = yuyv_to_rgb(&frame.data);
                (&converted[..], ExtendedColorType::Rgb8)
            }
            PixelFormat::Jpeg => return Err(ConversionError::UnsupportedFormat(format)),
        };

        let mut out = Vec::with_capacity(expected / 8);
        JpegEncoder::new_with_quality(&mut out, self.quality).encode(pixels, width, height, color)?;

        if out.is_empty() {
            return Err(ConversionError::EmptyOutput);
        }
        Ok(out)
    }
}

/// Big-endian RGB565, as small camera sensors emit it
fn rgb565_to_rgb(data: &[u8]) -> Vec<u8> {
    let mut rgb = Vec::with_capacity(data.len() / 2 * 3);
    for px in data.chunks_exact(2) {
        let v = u16::from_be_bytes([px[0], px[1]]);
        let r = ((v >> 11) & 0x1f) as u8;
        let g = ((v >> 5) & 0x3f) as u8;
        let b = (v & 0x1f) as u8;
        rgb.extend_from_slice(&[(r << 3) | (r >> 2), (g << 2) | (g >> 4), (b << 3) | (b >> 2)]);
    }
    rgb
}

fn yuyv_to_rgb(data: &[u8]) -> Vec<u8> {
    // Full-range BT.601, fixed point with 8 fractional bits
    fn pixel(y: i32, u: i32, v: i32) -> [u8; 3] {
        let r = y + ((359 * v) >> 8);
        let g = y - ((88 * u + 183 * v) >> 8);
        let b = y + ((454 * u) >> 8);
        [r.clamp(0, 255) as u8, g.clamp(0, 255) as u8, b.clamp(0, 255) as u8]
    }

    let mut rgb = Vec::with_capacity(data.len() / 2 * 3);
    for quad in data.chunks_exact(4) {
        let (y0, u, y1, v) = (
            quad[0] as i32,
            quad[1] as i32 - 128,
            quad[2] as i32,
            quad[3] as i32 - 128,
        );
        rgb.extend_from_slice(&pixel(y0, u, v));
        rgb.extend_from_slice(&pixel(y1, u, v));
    }
    rgb
}

/// Turns any captured frame into JPEG bytes.
pub struct FormatNormalizer {
    transcoder: Arc<dyn Transcoder>,
    transcoded: AtomicU64,
}

impl FormatNormalizer {
    pub fn new(transcoder: Arc<dyn Transcoder>) -> Self {
        Self {
            transcoder,
            transcoded: AtomicU64::new(0),
        }
    }

    /// Pass JPEG frames through untouched, transcode everything else.
    pub fn normalize(&self, frame: &FrameBuffer) -> Result<JpegView, ConversionError> {
        if frame.is_empty() {
            return Err(ConversionError::Empty);
        }
        if is_jpeg(&frame.data) {
            return Ok(JpegView::Passthrough(frame.data.clone()));
        }

        let jpeg = self.transcoder.transcode(frame)?;
        if jpeg.is_empty() {
            return Err(ConversionError::EmptyOutput);
        }
        self.transcoded.fetch_add(1, Ordering::Relaxed);
        debug!(
            sequence = frame.meta.sequence,
            from = ?frame.meta.format,
            raw_len = frame.len(),
            jpeg_len = jpeg.len(),
            "Transcoded frame"
        );
        Ok(JpegView::Transcoded(Bytes::from(jpeg)))
    }

    /// Number of frames that needed transcoding
    pub fn transcoded_count(&self) -> u64 {
        self.transcoded.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::frame::FrameMetadata;
    use crate::capture::pool::HardwarePool;

    fn frame(data: Vec<u8>, width: u32, height: u32, format: PixelFormat) -> FrameBuffer {
        let pool = HardwarePool::new(1);
        let meta = FrameMetadata {
            sequence: 1,
            width,
            height,
            format,
        };
        FrameBuffer::new(Bytes::from(data), meta, pool.lease().unwrap())
    }

    fn normalizer() -> FormatNormalizer {
        FormatNormalizer::new(Arc::new(JpegTranscoder::new(80)))
    }

    #[test]
    fn magic_bytes_decide_not_the_tag() {
        let n = normalizer();

        // Tagged raw but starts with SOI: passed through as-is
        let f = frame(vec![0xFF, 0xD8, 0xFF, 0xE0, 1, 2, 3], 2, 2, PixelFormat::Rgb888);
        let view = n.normalize(&f).unwrap();
        assert!(!view.is_transcoded());
        assert_eq!(view.as_bytes(), &f.data[..]);

        // Tagged JPEG without SOI: corrupt, cannot be converted
        let f = frame(vec![0x00, 0x11, 0x22], 1, 1, PixelFormat::Jpeg);
        assert!(matches!(
            n.normalize(&f),
            Err(ConversionError::UnsupportedFormat(PixelFormat::Jpeg))
        ));
        assert_eq!(n.transcoded_count(), 0);
    }

    #[test]
    fn raw_frames_are_transcoded_to_decodable_jpeg() {
        let n = normalizer();
        for format in [
            PixelFormat::Grayscale,
            PixelFormat::Rgb565,
            PixelFormat::Yuv422,
            PixelFormat::Rgb888,
        ] {
            let bpp = format.bytes_per_pixel().unwrap();
            let data: Vec<u8> = (0..16 * 8 * bpp).map(|i| (i * 7) as u8).collect();
            let f = frame(data, 16, 8, format);
            let view = n.normalize(&f).unwrap();
            assert!(view.is_transcoded());
            assert!(is_jpeg(view.as_bytes()));

            let decoded = image::load_from_memory(view.as_bytes()).unwrap();
            assert_eq!((decoded.width(), decoded.height()), (16, 8));
        }
        assert_eq!(n.transcoded_count(), 4);
    }

    #[test]
    fn empty_and_short_frames_fail() {
        let n = normalizer();
        let f = frame(Vec::new(), 4, 4, PixelFormat::Rgb565);
        assert!(matches!(n.normalize(&f), Err(ConversionError::Empty)));

        let f = frame(vec![1; 10], 4, 4, PixelFormat::Rgb565);
        assert!(matches!(
            n.normalize(&f),
            Err(ConversionError::LengthMismatch { expected: 32, actual: 10, .. })
        ));
    }

    #[test]
    fn rgb565_expands_full_scale() {
        assert_eq!(rgb565_to_rgb(&[0xFF, 0xFF]), vec![255, 255, 255]);
        assert_eq!(rgb565_to_rgb(&[0xF8, 0x00]), vec![255, 0, 0]);
        assert_eq!(rgb565_to_rgb(&[0x00, 0x00]), vec![0, 0, 0]);
    }

    #[test]
    fn yuyv_neutral_chroma_is_gray() {
        assert_eq!(yuyv_to_rgb(&[100, 128, 200, 128]), vec![100, 100, 100, 200, 200, 200]);
    }
}
