pub mod decoder;
pub mod frame;
pub mod pool;
pub mod sensor;
pub mod synthetic;
pub mod v4l2;

pub use decoder::{FormatNormalizer, JpegView};
pub use frame::{FrameBuffer, FrameSize, PixelFormat};
pub use sensor::{CaptureDevice, Sensor};
pub use synthetic::{SyntheticMode, SyntheticSensor};
pub use v4l2::V4l2Sensor;
