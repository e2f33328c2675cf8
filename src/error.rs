//! Error types for the preview pipeline

use thiserror::Error;

use crate::capture::{FrameSize, PixelFormat};
use crate::pipeline::OutputFormat;

/// Result type alias using PreviewError
pub type Result<T> = std::result::Result<T, PreviewError>;

/// Failures surfaced by the public preview surface.
///
/// Steady-state per-frame failures never show up here; they are absorbed
/// by the consumer loop and only counted in the pipeline stats.
#[derive(Debug, Error)]
pub enum PreviewError {
    /// Device could not satisfy the requested format or rate
    #[error("negotiation failed: {0}")]
    Negotiation(#[source] DeviceError),

    /// Device refused to start delivering frames
    #[error("failed to start streaming: {0}")]
    Streaming(#[source] DeviceError),

    /// Consumer thread could not be launched
    #[error("failed to spawn consumer thread: {0}")]
    Spawn(#[source] std::io::Error),

    /// `start_preview` while already starting or running
    #[error("preview already running")]
    AlreadyRunning,

    /// Parameters are read-only while a preview runs
    #[error("preview is running; stop it before changing parameters")]
    Busy,
}

impl PreviewError {
    /// Stable status code for callers that speak integer statuses.
    pub fn code(&self) -> i32 {
        match self {
            PreviewError::Negotiation(e) | PreviewError::Streaming(e) => e.code(),
            PreviewError::Spawn(_) => -11,
            PreviewError::AlreadyRunning => -6,
            PreviewError::Busy => -6,
        }
    }
}

/// Failures reported by a capture device.
#[derive(Debug, Error)]
pub enum DeviceError {
    #[error("unsupported stream format {format:?} at {width}x{height}")]
    Unsupported {
        format: PixelFormat,
        width: u32,
        height: u32,
    },

    #[error("unsupported frame rate {min_fps}..={max_fps} for {size:?}")]
    UnsupportedRate {
        size: FrameSize,
        min_fps: u32,
        max_fps: u32,
    },

    #[error("stream was not negotiated")]
    NotNegotiated,

    #[error("device busy")]
    Busy,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl DeviceError {
    /// Status code in the usual UVC library numbering.
    pub fn code(&self) -> i32 {
        match self {
            DeviceError::Unsupported { .. } | DeviceError::UnsupportedRate { .. } => -51,
            DeviceError::NotNegotiated => -2,
            DeviceError::Busy => -6,
            DeviceError::Io(_) => -1,
        }
    }
}

/// Per-frame conversion failures.
#[derive(Debug, Error)]
pub enum ConvertError {
    #[error("cannot convert {from:?} to {to:?}")]
    Unsupported { from: PixelFormat, to: OutputFormat },

    #[error("source holds {actual} bytes, need {expected}")]
    ShortSource { expected: usize, actual: usize },

    #[error("decoded image is {actual:?}, negotiated {expected:?}")]
    GeometryMismatch { expected: FrameSize, actual: FrameSize },

    #[error("unsupported JPEG pixel layout: {0}")]
    JpegLayout(String),

    #[error("JPEG decode error: {0}")]
    Jpeg(#[from] jpeg_decoder::Error),
}

/// Failures reported by a display sink.
#[derive(Debug, Error)]
pub enum SinkError {
    #[error("no display sink bound")]
    Unbound,

    #[error("buffer is {actual} bytes, sink expects {expected}")]
    SizeMismatch { expected: usize, actual: usize },

    #[error("sink disconnected")]
    Disconnected,

    #[error("sink is full")]
    Full,
}
