//! Capture device capability consumed by the capture session

use crate::capture::frame::{DeviceFrame, FrameSize, PixelFormat};
use crate::error::DeviceError;

/// Per-frame callback invoked on a thread owned by the device.
///
/// The frame borrow ends when the callback returns.
pub type FrameCallback = Box<dyn FnMut(&DeviceFrame<'_>) + Send + 'static>;

/// Stream format request handed to [`CaptureDevice::negotiate`]
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StreamRequest {
    pub format: PixelFormat,
    pub width: u32,
    pub height: u32,
    pub min_fps: u32,
    pub max_fps: u32,
}

/// Frame sizes a device offers for one wire format
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SupportedSizes {
    pub format: PixelFormat,
    pub sizes: Vec<FrameSize>,
}

pub trait CaptureDevice: Send {
    /// Commit to a stream format. Returns the size the device actually chose.
    fn negotiate(&mut self, request: &StreamRequest) -> Result<FrameSize, DeviceError>;

    /// Start asynchronous delivery of frames to `callback`.
    fn start_streaming(
        &mut self,
        callback: FrameCallback,
        bandwidth: f32,
    ) -> Result<(), DeviceError>;

    /// Stop delivery. Once this returns the callback is no longer invoked.
    fn stop_streaming(&mut self);

    fn supported_sizes(&self) -> Vec<SupportedSizes> {
        Vec::new()
    }
}
