//! Display sink capability and a channel-backed implementation

use bytes::Bytes;
use flume::{Receiver, Sender, TrySendError};
use tracing::debug;

use crate::capture::{FrameBuffer, FrameSize};
use crate::error::SinkError;
use crate::pipeline::OutputFormat;

/// Target that renders pixel buffers of a negotiated geometry.
///
/// Called from the consumer thread for `submit` and from the controlling
/// thread for `set_geometry`/`clear`; the engine serialises the calls.
pub trait DisplaySink: Send {
    fn set_geometry(
        &mut self,
        width: u32,
        height: u32,
        format: OutputFormat,
    ) -> Result<(), SinkError>;

    /// Render one buffer. The buffer goes back to the pool afterwards,
    /// so anything kept must be copied.
    fn submit(&mut self, frame: &FrameBuffer) -> Result<(), SinkError>;

    /// Blank the surface
    fn clear(&mut self) {}
}

/// Owned copy of a submitted frame
#[derive(Debug, Clone)]
pub struct DisplayFrame {
    pub sequence: u64,
    pub width: u32,
    pub height: u32,
    pub format: OutputFormat,
    pub data: Bytes,
}

#[derive(Debug, Clone)]
pub enum DisplayEvent {
    Geometry {
        width: u32,
        height: u32,
        format: OutputFormat,
    },
    Frame(DisplayFrame),
    Clear,
}

/// Sink that forwards frames to another thread (e.g. a window's event loop)
/// without ever blocking the consumer.
pub struct ChannelSink {
    tx: Sender<DisplayEvent>,
    geometry: Option<(FrameSize, OutputFormat)>,
}

impl ChannelSink {
    pub fn new(tx: Sender<DisplayEvent>) -> Self {
        Self { tx, geometry: None }
    }

    /// Sink plus the receiving end of a channel holding `capacity` events.
    pub fn bounded(capacity: usize) -> (Self, Receiver<DisplayEvent>) {
        let (tx, rx) = flume::bounded(capacity);
        (Self::new(tx), rx)
    }

    fn send(&self, event: DisplayEvent) -> Result<(), SinkError> {
        self.tx.try_send(event).map_err(|e| match e {
            TrySendError::Full(_) => SinkError::Full,
            TrySendError::Disconnected(_) => SinkError::Disconnected,
        })
    }
}

impl DisplaySink for ChannelSink {
    fn set_geometry(
        &mut self,
        width: u32,
        height: u32,
        format: OutputFormat,
    ) -> Result<(), SinkError> {
        debug!(width, height, ?format, "sink geometry");
        self.geometry = Some((FrameSize::new(width, height), format));
        self.send(DisplayEvent::Geometry {
            width,
            height,
            format,
        })
    }

    fn submit(&mut self, frame: &FrameBuffer) -> Result<(), SinkError> {
        let (size, format) = self.geometry.ok_or(SinkError::Unbound)?;
        let expected = format.frame_bytes(size);
        // raw pass-through carries whatever the device delivered
        if format != OutputFormat::Raw && frame.len() != expected {
            return Err(SinkError::SizeMismatch {
                expected,
                actual: frame.len(),
            });
        }
        self.send(DisplayEvent::Frame(DisplayFrame {
            sequence: frame.sequence,
            width: frame.width,
            height: frame.height,
            format,
            data: Bytes::copy_from_slice(frame.as_slice()),
        }))
    }

    fn clear(&mut self) {
        let _ = self.send(DisplayEvent::Clear);
    }
}
