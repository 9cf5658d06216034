pub mod decoder;
pub mod device;
pub mod frame;
pub mod source;
pub mod synthetic;
#[cfg(feature = "v4l2")]
pub mod v4l2;

pub use device::{CaptureBackend, CaptureDevice, DeviceId, StreamConfig};
pub use frame::{Frame, FrameMetadata, PixelFormat};
pub use source::{FrameSource, SourceState, SourceStatus};
pub use synthetic::{SyntheticBackend, SyntheticOptions};
#[cfg(feature = "v4l2")]
pub use v4l2::V4l2Backend;
