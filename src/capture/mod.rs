pub mod decoder;
pub mod device;
pub mod frame;
pub mod session;
#[cfg(feature = "v4l2")]
pub mod v4l2;
pub mod virtual_device;

pub use device::{CaptureDevice, FrameCallback, StreamRequest, SupportedSizes};
pub use frame::{DeviceFrame, FrameBuffer, FrameSize, PixelFormat, StreamMode};
pub use session::{CaptureSession, Negotiated, PreviewRequest};
#[cfg(feature = "v4l2")]
pub use v4l2::V4l2Device;
pub use virtual_device::{VirtualDevice, VirtualInjector};
