use std::time::Instant;

use bytes::BytesMut;
use serde::{Deserialize, Serialize};

/// Pixel layouts a frame payload can carry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PixelFormat {
    Yuyv,
    Mjpeg,
    Rgbx,
    Rgb565,
    Nv12,
    Nv21,
    I420,
}

/// Stream mode requested from the device
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StreamMode {
    /// Uncompressed YUYV
    #[default]
    Raw,
    /// Motion JPEG
    Compressed,
}

impl StreamMode {
    /// Wire format the device delivers in this mode.
    pub fn pixel_format(self) -> PixelFormat {
        match self {
            StreamMode::Raw => PixelFormat::Yuyv,
            StreamMode::Compressed => PixelFormat::Mjpeg,
        }
    }

    /// Bytes per pixel used to size incoming frames. MJPEG is an upper bound.
    pub fn bytes_per_pixel(self) -> usize {
        match self {
            StreamMode::Raw => 2,
            StreamMode::Compressed => 4,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FrameSize {
    pub width: u32,
    pub height: u32,
}

impl FrameSize {
    pub const fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }

    pub fn pixels(&self) -> usize {
        self.width as usize * self.height as usize
    }
}

/// Frame as handed over by a device, borrowed for the duration of the callback
#[derive(Debug, Clone, Copy)]
pub struct DeviceFrame<'a> {
    pub sequence: u64,
    pub width: u32,
    pub height: u32,
    pub format: PixelFormat,
    /// Backing storage; its length is the descriptor's data length
    pub data: &'a [u8],
    /// Bytes the device actually wrote into `data`
    pub actual_length: usize,
}

impl DeviceFrame<'_> {
    pub fn payload(&self) -> &[u8] {
        &self.data[..self.actual_length.min(self.data.len())]
    }
}

/// Reusable frame buffer. Owned by exactly one of pool, queue or consumer.
#[derive(Debug)]
pub struct FrameBuffer {
    data: BytesMut,
    pub sequence: u64,
    pub width: u32,
    pub height: u32,
    pub format: PixelFormat,
    /// When the device delivered the frame, for latency tracking
    pub captured_at: Instant,
}

impl FrameBuffer {
    pub(crate) fn with_capacity(capacity: usize) -> Self {
        Self {
            data: BytesMut::with_capacity(capacity),
            sequence: 0,
            width: 0,
            height: 0,
            format: PixelFormat::Yuyv,
            captured_at: Instant::now(),
        }
    }

    pub fn capacity(&self) -> usize {
        self.data.capacity()
    }

    /// Actual byte count of the payload
    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.data
    }

    /// Duplicate a device frame into this buffer.
    pub fn copy_from(&mut self, frame: &DeviceFrame<'_>) {
        self.data.clear();
        self.data.extend_from_slice(frame.payload());
        self.sequence = frame.sequence;
        self.width = frame.width;
        self.height = frame.height;
        self.format = frame.format;
        self.captured_at = Instant::now();
    }

    /// Set up the buffer as a conversion target derived from `source` and
    /// return its zeroed payload.
    pub fn prepare_output(
        &mut self,
        source: &FrameBuffer,
        format: PixelFormat,
        len: usize,
    ) -> &mut [u8] {
        self.sequence = source.sequence;
        self.width = source.width;
        self.height = source.height;
        self.format = format;
        self.captured_at = source.captured_at;
        self.data.clear();
        self.data.resize(len, 0);
        &mut self.data
    }

    pub(crate) fn reserve(&mut self, size: usize) {
        if self.data.capacity() < size {
            self.data.reserve(size - self.data.len());
        }
    }

    pub(crate) fn reset(&mut self) {
        self.data.clear();
        self.sequence = 0;
    }
}
