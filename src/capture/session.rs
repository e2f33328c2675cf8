//! Stream negotiation and the device-facing frame callback

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument, trace, warn};

use crate::capture::device::{CaptureDevice, FrameCallback, StreamRequest, SupportedSizes};
use crate::capture::frame::{DeviceFrame, FrameSize, PixelFormat, StreamMode};
use crate::error::DeviceError;
use crate::pipeline::{FramePool, FrameQueue, PipelineCounters};

pub const DEFAULT_PREVIEW_WIDTH: u32 = 640;
pub const DEFAULT_PREVIEW_HEIGHT: u32 = 480;
pub const DEFAULT_PREVIEW_FPS_MIN: u32 = 1;
pub const DEFAULT_PREVIEW_FPS_MAX: u32 = 30;
pub const DEFAULT_BANDWIDTH: f32 = 1.0;

/// Requested preview parameters
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PreviewRequest {
    pub width: u32,
    pub height: u32,
    pub min_fps: u32,
    pub max_fps: u32,
    pub mode: StreamMode,
    /// Fraction of the USB bandwidth the stream may claim
    pub bandwidth: f32,
}

impl Default for PreviewRequest {
    fn default() -> Self {
        Self {
            width: DEFAULT_PREVIEW_WIDTH,
            height: DEFAULT_PREVIEW_HEIGHT,
            min_fps: DEFAULT_PREVIEW_FPS_MIN,
            max_fps: DEFAULT_PREVIEW_FPS_MAX,
            mode: StreamMode::Raw,
            bandwidth: DEFAULT_BANDWIDTH,
        }
    }
}

impl PreviewRequest {
    fn stream_request(&self) -> StreamRequest {
        StreamRequest {
            format: self.mode.pixel_format(),
            width: self.width,
            height: self.height,
            min_fps: self.min_fps,
            max_fps: self.max_fps,
        }
    }
}

/// Parameters the device committed to. Read-only while streaming.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Negotiated {
    pub size: FrameSize,
    pub mode: StreamMode,
    /// Minimum byte count of a raw frame; upper bound for compressed ones
    pub frame_bytes: usize,
}

impl Negotiated {
    fn new(size: FrameSize, mode: StreamMode) -> Self {
        Self {
            size,
            mode,
            frame_bytes: size.pixels() * mode.bytes_per_pixel(),
        }
    }

    /// Whether a device frame matches what was negotiated.
    pub fn accepts(&self, frame: &DeviceFrame<'_>) -> bool {
        if frame.data.is_empty()
            || frame.actual_length == 0
            || frame.actual_length > frame.data.len()
        {
            return false;
        }
        if frame.format != self.mode.pixel_format()
            || frame.width != self.size.width
            || frame.height != self.size.height
        {
            return false;
        }
        // compressed frames have no fixed length
        frame.format == PixelFormat::Mjpeg || frame.actual_length >= self.frame_bytes
    }

    /// Bytes of an accepted frame that belong to the image. Raw frames are
    /// cut to the negotiated geometry; trailing padding is discarded.
    pub fn payload_len(&self, frame: &DeviceFrame<'_>) -> usize {
        match self.mode {
            StreamMode::Raw => self.frame_bytes.min(frame.actual_length),
            StreamMode::Compressed => frame.actual_length,
        }
    }
}

/// Owns the device context for the lifetime of a preview engine.
pub struct CaptureSession {
    device: Box<dyn CaptureDevice>,
    request: PreviewRequest,
    negotiated: Option<Negotiated>,
    streaming: bool,
}

impl CaptureSession {
    pub fn new(device: Box<dyn CaptureDevice>) -> Self {
        Self {
            device,
            request: PreviewRequest::default(),
            negotiated: None,
            streaming: false,
        }
    }

    /// Ask the device to commit to `request`.
    ///
    /// The returned size may differ from the requested one when the device
    /// picks its nearest frame description.
    #[instrument(skip(self))]
    pub fn negotiate(&mut self, request: PreviewRequest) -> Result<Negotiated, DeviceError> {
        if self.streaming {
            return Err(DeviceError::Busy);
        }
        self.request = request;
        let size = match self.device.negotiate(&request.stream_request()) {
            Ok(size) => size,
            Err(e) => {
                warn!("could not negotiate with camera: {}", e);
                self.negotiated = None;
                return Err(e);
            }
        };
        if size.pixels() == 0 {
            warn!(?size, "device negotiated an empty frame");
            self.negotiated = None;
            return Err(DeviceError::Unsupported {
                format: request.mode.pixel_format(),
                width: size.width,
                height: size.height,
            });
        }
        let negotiated = Negotiated::new(size, request.mode);
        if size != FrameSize::new(request.width, request.height) {
            debug!(
                requested = ?(request.width, request.height),
                actual = ?size,
                "device chose a different frame size"
            );
        }
        info!(
            "frameSize=({},{})@{:?}",
            size.width,
            size.height,
            request.mode.pixel_format()
        );
        self.negotiated = Some(negotiated);
        Ok(negotiated)
    }

    pub fn negotiated(&self) -> Option<Negotiated> {
        self.negotiated
    }

    pub fn request(&self) -> PreviewRequest {
        self.request
    }

    /// Start device delivery to `callback`.
    pub fn begin_streaming(&mut self, callback: FrameCallback) -> Result<(), DeviceError> {
        if self.negotiated.is_none() {
            return Err(DeviceError::NotNegotiated);
        }
        if self.streaming {
            return Err(DeviceError::Busy);
        }
        self.device.start_streaming(callback, self.request.bandwidth)?;
        self.streaming = true;
        info!("streaming started");
        Ok(())
    }

    /// Stop device delivery. Safe to call when not streaming.
    pub fn end_streaming(&mut self) {
        if self.streaming {
            self.device.stop_streaming();
            self.streaming = false;
            info!("streaming stopped");
        }
    }

    pub fn is_streaming(&self) -> bool {
        self.streaming
    }

    pub fn supported_sizes(&self) -> Vec<SupportedSizes> {
        self.device.supported_sizes()
    }
}

impl Drop for CaptureSession {
    fn drop(&mut self) {
        self.end_streaming();
    }
}

/// Build the per-frame callback handed to the device.
///
/// Validated frames are duplicated into a pooled buffer before returning;
/// anything else is discarded and counted.
pub fn frame_callback(
    negotiated: Negotiated,
    pool: Arc<FramePool>,
    queue: Arc<FrameQueue>,
    counters: Arc<PipelineCounters>,
) -> FrameCallback {
    Box::new(move |frame: &DeviceFrame<'_>| {
        if !queue.is_running() {
            return;
        }
        if !negotiated.accepts(frame) {
            trace!(
                "broken frame!:format={:?},actual_bytes={}/{}({},{}/{},{})",
                frame.format,
                frame.actual_length,
                negotiated.frame_bytes,
                frame.width,
                frame.height,
                negotiated.size.width,
                negotiated.size.height
            );
            counters.malformed();
            return;
        }

        let frame = DeviceFrame {
            actual_length: negotiated.payload_len(frame),
            ..*frame
        };
        let mut copy = pool.acquire(frame.actual_length);
        copy.copy_from(&frame);
        match queue.push(copy) {
            Ok(()) => counters.captured(),
            Err(rejected) => {
                pool.release(rejected);
                counters.dropped();
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::virtual_device::VirtualDevice;

    fn raw_frame(data: &[u8], width: u32, height: u32) -> DeviceFrame<'_> {
        DeviceFrame {
            sequence: 0,
            width,
            height,
            format: PixelFormat::Yuyv,
            data,
            actual_length: data.len(),
        }
    }

    #[test]
    fn test_accepts_valid_raw_frame() {
        let negotiated = Negotiated::new(FrameSize::new(4, 2), StreamMode::Raw);
        assert_eq!(negotiated.frame_bytes, 16);
        assert!(negotiated.accepts(&raw_frame(&[0; 16], 4, 2)));
    }

    #[test]
    fn test_rejects_short_and_mismatched_frames() {
        let negotiated = Negotiated::new(FrameSize::new(4, 2), StreamMode::Raw);
        let data = [0u8; 16];

        let mut short = raw_frame(&data, 4, 2);
        short.actual_length = 15;
        assert!(!negotiated.accepts(&short));

        let mut overlong = raw_frame(&data, 4, 2);
        overlong.actual_length = 17;
        assert!(!negotiated.accepts(&overlong));

        assert!(!negotiated.accepts(&raw_frame(&data, 2, 4)));
        assert!(!negotiated.accepts(&raw_frame(&[], 4, 2)));

        let mut mjpeg = raw_frame(&data, 4, 2);
        mjpeg.format = PixelFormat::Mjpeg;
        assert!(!negotiated.accepts(&mjpeg));
    }

    #[test]
    fn test_compressed_frames_skip_length_check() {
        let negotiated = Negotiated::new(FrameSize::new(4, 2), StreamMode::Compressed);
        let mut frame = raw_frame(&[0xff; 5], 4, 2);
        frame.format = PixelFormat::Mjpeg;
        assert!(negotiated.accepts(&frame));
    }

    #[test]
    fn test_negotiate_records_actual_size() {
        let (device, _injector) = VirtualDevice::new(vec![FrameSize::new(320, 240)]);
        let mut session = CaptureSession::new(Box::new(device));

        let request = PreviewRequest {
            width: 320,
            height: 240,
            ..Default::default()
        };
        let negotiated = session.negotiate(request).unwrap();
        assert_eq!(negotiated.size, FrameSize::new(320, 240));
        assert_eq!(negotiated.frame_bytes, 320 * 240 * 2);
        assert_eq!(session.negotiated(), Some(negotiated));
    }

    #[test]
    fn test_negotiate_failure_clears_previous() {
        let (device, _injector) = VirtualDevice::new(vec![FrameSize::new(320, 240)]);
        let mut session = CaptureSession::new(Box::new(device));
        session
            .negotiate(PreviewRequest {
                width: 320,
                height: 240,
                ..Default::default()
            })
            .unwrap();

        assert!(session.negotiate(PreviewRequest::default()).is_err());
        assert!(session.negotiated().is_none());
    }

    #[test]
    fn test_begin_streaming_requires_negotiation() {
        let (device, _injector) = VirtualDevice::new(vec![FrameSize::new(320, 240)]);
        let mut session = CaptureSession::new(Box::new(device));
        assert!(matches!(
            session.begin_streaming(Box::new(|_| {})),
            Err(DeviceError::NotNegotiated)
        ));
    }

    #[test]
    fn test_end_streaming_is_idempotent() {
        let (device, _injector) = VirtualDevice::new(vec![FrameSize::new(320, 240)]);
        let mut session = CaptureSession::new(Box::new(device));
        session.end_streaming();

        session
            .negotiate(PreviewRequest {
                width: 320,
                height: 240,
                ..Default::default()
            })
            .unwrap();
        session.begin_streaming(Box::new(|_| {})).unwrap();
        assert!(matches!(
            session.begin_streaming(Box::new(|_| {})),
            Err(DeviceError::Busy)
        ));
        session.end_streaming();
        session.end_streaming();
        assert!(!session.is_streaming());
    }

    #[test]
    fn test_callback_queues_valid_and_counts_malformed() {
        let pool = Arc::new(FramePool::new(4));
        let queue = Arc::new(FrameQueue::new(4));
        let counters = Arc::new(PipelineCounters::new());
        queue.set_running(true);

        let negotiated = Negotiated::new(FrameSize::new(2, 1), StreamMode::Raw);
        let mut callback = frame_callback(negotiated, pool.clone(), queue.clone(), counters.clone());

        callback(&raw_frame(&[1, 2, 3, 4], 2, 1));
        callback(&raw_frame(&[1, 2, 3], 2, 1));

        let stats = counters.snapshot();
        assert_eq!(stats.frames_captured, 1);
        assert_eq!(stats.frames_malformed, 1);
        assert_eq!(queue.pop().unwrap().as_slice(), &[1, 2, 3, 4]);
    }

    #[test]
    fn test_callback_trims_padded_raw_frame() {
        let pool = Arc::new(FramePool::new(4));
        let queue = Arc::new(FrameQueue::new(4));
        let counters = Arc::new(PipelineCounters::new());
        queue.set_running(true);

        let negotiated = Negotiated::new(FrameSize::new(2, 1), StreamMode::Raw);
        let mut callback = frame_callback(negotiated, pool, queue.clone(), counters);
        callback(&raw_frame(&[1, 2, 3, 4, 0xee, 0xee], 2, 1));

        assert_eq!(queue.pop().unwrap().as_slice(), &[1, 2, 3, 4]);
    }

    #[test]
    fn test_payload_len_keeps_compressed_length() {
        let negotiated = Negotiated::new(FrameSize::new(2, 1), StreamMode::Compressed);
        let mut frame = raw_frame(&[0xff; 32], 2, 1);
        frame.format = PixelFormat::Mjpeg;
        frame.actual_length = 20;
        assert_eq!(negotiated.payload_len(&frame), 20);
    }

    #[test]
    fn test_negotiate_rejects_empty_frame() {
        let (device, _injector) = VirtualDevice::new(vec![FrameSize::new(0, 480)]);
        let mut session = CaptureSession::new(Box::new(device));

        let result = session.negotiate(PreviewRequest {
            width: 0,
            height: 480,
            ..Default::default()
        });
        assert!(matches!(result, Err(DeviceError::Unsupported { .. })));
        assert!(session.negotiated().is_none());
        assert!(matches!(
            session.begin_streaming(Box::new(|_| {})),
            Err(DeviceError::NotNegotiated)
        ));
    }

    #[test]
    fn test_callback_recycles_when_queue_full() {
        let pool = Arc::new(FramePool::new(4));
        let queue = Arc::new(FrameQueue::new(1));
        let counters = Arc::new(PipelineCounters::new());
        queue.set_running(true);

        let negotiated = Negotiated::new(FrameSize::new(2, 1), StreamMode::Raw);
        let mut callback = frame_callback(negotiated, pool.clone(), queue.clone(), counters.clone());
        callback(&raw_frame(&[0; 4], 2, 1));
        callback(&raw_frame(&[0; 4], 2, 1));

        assert_eq!(queue.len(), 1);
        assert_eq!(pool.idle_len(), 1);
        assert_eq!(counters.snapshot().frames_dropped, 1);
    }
}
