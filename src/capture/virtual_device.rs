//! In-process capture device emitting injected or generated frames

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use tracing::{debug, info};

use crate::capture::device::{CaptureDevice, FrameCallback, StreamRequest, SupportedSizes};
use crate::capture::frame::{DeviceFrame, FrameSize, PixelFormat};
use crate::error::DeviceError;

const MAX_FPS: u32 = 60;

type SharedCallback = Arc<Mutex<Option<FrameCallback>>>;

/// Virtual capture device.
///
/// Negotiation only succeeds for the exact sizes it was created with. Frames
/// are either pushed through a [`VirtualInjector`] or, for a device built with
/// [`VirtualDevice::generating`], produced by a pattern thread at `max_fps`.
pub struct VirtualDevice {
    sizes: Vec<FrameSize>,
    formats: Vec<PixelFormat>,
    negotiated: Option<StreamRequest>,
    callback: SharedCallback,
    generate: bool,
    generator: Option<Generator>,
    refuse_start: bool,
}

struct Generator {
    stop: Arc<AtomicBool>,
    handle: JoinHandle<()>,
}

/// Delivers frames to whatever callback the device is streaming to.
#[derive(Clone)]
pub struct VirtualInjector {
    callback: SharedCallback,
    sequence: Arc<AtomicU64>,
}

impl VirtualDevice {
    /// Device driven by the returned injector. Offers YUYV and MJPEG.
    pub fn new(sizes: Vec<FrameSize>) -> (Self, VirtualInjector) {
        let callback: SharedCallback = Arc::new(Mutex::new(None));
        let device = Self {
            sizes,
            formats: vec![PixelFormat::Yuyv, PixelFormat::Mjpeg],
            negotiated: None,
            callback: callback.clone(),
            generate: false,
            generator: None,
            refuse_start: false,
        };
        let injector = VirtualInjector {
            callback,
            sequence: Arc::new(AtomicU64::new(0)),
        };
        (device, injector)
    }

    /// Device that generates a moving YUYV test pattern.
    pub fn generating(sizes: Vec<FrameSize>) -> Self {
        let (mut device, _) = Self::new(sizes);
        device.formats = vec![PixelFormat::Yuyv];
        device.generate = true;
        device
    }

    /// Make every `start_streaming` fail with [`DeviceError::Busy`].
    pub fn refuse_streaming(mut self) -> Self {
        self.refuse_start = true;
        self
    }
}

impl CaptureDevice for VirtualDevice {
    fn negotiate(&mut self, request: &StreamRequest) -> Result<FrameSize, DeviceError> {
        let size = FrameSize::new(request.width, request.height);
        if !self.formats.contains(&request.format) || !self.sizes.contains(&size) {
            return Err(DeviceError::Unsupported {
                format: request.format,
                width: request.width,
                height: request.height,
            });
        }
        if request.max_fps == 0 || request.min_fps > request.max_fps || request.min_fps > MAX_FPS {
            return Err(DeviceError::UnsupportedRate {
                size,
                min_fps: request.min_fps,
                max_fps: request.max_fps,
            });
        }
        debug!(?request, "virtual device negotiated");
        self.negotiated = Some(*request);
        Ok(size)
    }

    fn start_streaming(
        &mut self,
        callback: FrameCallback,
        bandwidth: f32,
    ) -> Result<(), DeviceError> {
        let request = self.negotiated.ok_or(DeviceError::NotNegotiated)?;
        if self.refuse_start {
            return Err(DeviceError::Busy);
        }
        let mut slot = self.callback.lock().unwrap_or_else(PoisonError::into_inner);
        if slot.is_some() {
            return Err(DeviceError::Busy);
        }
        *slot = Some(callback);
        drop(slot);

        if self.generate {
            let stop = Arc::new(AtomicBool::new(false));
            let spawned = thread::Builder::new()
                .name("virtual-camera".into())
                .spawn({
                    let stop = stop.clone();
                    let callback = self.callback.clone();
                    move || generate_frames(request, callback, stop)
                });
            match spawned {
                Ok(handle) => self.generator = Some(Generator { stop, handle }),
                Err(e) => {
                    self.callback
                        .lock()
                        .unwrap_or_else(PoisonError::into_inner)
                        .take();
                    return Err(e.into());
                }
            }
        }
        info!(bandwidth, "virtual device streaming");
        Ok(())
    }

    fn stop_streaming(&mut self) {
        if let Some(generator) = self.generator.take() {
            generator.stop.store(true, Ordering::Release);
            let _ = generator.handle.join();
        }
        // waits out a callback in progress
        self.callback
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
    }

    fn supported_sizes(&self) -> Vec<SupportedSizes> {
        self.formats
            .iter()
            .map(|&format| SupportedSizes {
                format,
                sizes: self.sizes.clone(),
            })
            .collect()
    }
}

impl Drop for VirtualDevice {
    fn drop(&mut self) {
        self.stop_streaming();
    }
}

impl VirtualInjector {
    /// Deliver `frame` on the calling thread. Returns false when not streaming.
    pub fn inject(&self, frame: &DeviceFrame<'_>) -> bool {
        let mut slot = self.callback.lock().unwrap_or_else(PoisonError::into_inner);
        match slot.as_mut() {
            Some(callback) => {
                callback(frame);
                true
            }
            None => false,
        }
    }

    /// Deliver a well-formed YUYV frame carrying `data`.
    pub fn inject_yuyv(&self, size: FrameSize, data: &[u8]) -> bool {
        let frame = DeviceFrame {
            sequence: self.sequence.fetch_add(1, Ordering::Relaxed),
            width: size.width,
            height: size.height,
            format: PixelFormat::Yuyv,
            data,
            actual_length: data.len(),
        };
        self.inject(&frame)
    }

    pub fn is_streaming(&self) -> bool {
        self.callback
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some()
    }
}

fn generate_frames(request: StreamRequest, callback: SharedCallback, stop: Arc<AtomicBool>) {
    let size = FrameSize::new(request.width, request.height);
    let interval = Duration::from_secs(1) / request.max_fps.max(1);
    let mut data = vec![0u8; size.pixels() * 2];
    let mut sequence = 0u64;

    while !stop.load(Ordering::Acquire) {
        fill_pattern(&mut data, size, sequence);
        let frame = DeviceFrame {
            sequence,
            width: size.width,
            height: size.height,
            format: PixelFormat::Yuyv,
            data: &data,
            actual_length: data.len(),
        };
        if let Some(cb) = callback
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_mut()
        {
            cb(&frame);
        }
        sequence += 1;
        thread::sleep(interval);
    }
}

/// Vertical luma ramp scrolling one column per frame, neutral chroma.
fn fill_pattern(data: &mut [u8], size: FrameSize, sequence: u64) {
    let width = size.width as usize;
    for line in data.chunks_exact_mut(width * 2) {
        for (x, px) in line.chunks_exact_mut(2).enumerate() {
            let luma = ((x as u64 + sequence) * 219 / width.max(1) as u64 % 220) as u8 + 16;
            px[0] = luma;
            px[1] = 128;
        }
    }
}
