//! V4L2 capture device with memory-mapped streaming

use std::io::ErrorKind;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use tracing::{debug, info, warn};
use v4l::buffer::Type;
use v4l::capability::Flags as CapFlags;
use v4l::framesize::FrameSizeEnum;
use v4l::io::traits::{CaptureStream, Stream};
use v4l::prelude::MmapStream;
use v4l::video::capture::Parameters;
use v4l::video::Capture;
use v4l::{Device, FourCC};

use crate::capture::device::{CaptureDevice, FrameCallback, StreamRequest, SupportedSizes};
use crate::capture::frame::{DeviceFrame, FrameSize, PixelFormat};
use crate::error::DeviceError;

fn fourcc(format: PixelFormat) -> Option<FourCC> {
    match format {
        PixelFormat::Yuyv => Some(FourCC::new(b"YUYV")),
        PixelFormat::Mjpeg => Some(FourCC::new(b"MJPG")),
        _ => None,
    }
}

/// Shortest wait for a buffer before the capture thread re-checks its stop flag
const MIN_DEQUEUE_TIMEOUT: Duration = Duration::from_millis(200);

/// Two frame intervals at `fps`, and never below [`MIN_DEQUEUE_TIMEOUT`].
fn dequeue_timeout(fps: u32) -> Duration {
    (Duration::from_secs(2) / fps.max(1)).max(MIN_DEQUEUE_TIMEOUT)
}

/// Linux video device
pub struct V4l2Device {
    device: Device,
    path: String,
    buffer_count: u32,
    negotiated: Option<(FrameSize, PixelFormat, u32)>,
    worker: Option<Worker>,
}

struct Worker {
    stop: Arc<AtomicBool>,
    handle: JoinHandle<()>,
}

impl V4l2Device {
    pub fn open(path: &str, buffer_count: u32) -> Result<Self, DeviceError> {
        info!("Initializing V4L2 capture: {}", path);
        let device = Device::with_path(path)?;

        let caps = device.query_caps()?;
        info!("Device: {} ({})", caps.card, caps.driver);
        if !caps.capabilities.contains(CapFlags::VIDEO_CAPTURE) {
            return Err(DeviceError::Io(std::io::Error::new(
                std::io::ErrorKind::Unsupported,
                "device doesn't support video capture",
            )));
        }

        Ok(Self {
            device,
            path: path.to_string(),
            buffer_count,
            negotiated: None,
            worker: None,
        })
    }
}

impl CaptureDevice for V4l2Device {
    fn negotiate(&mut self, request: &StreamRequest) -> Result<FrameSize, DeviceError> {
        let unsupported = || DeviceError::Unsupported {
            format: request.format,
            width: request.width,
            height: request.height,
        };
        let wanted = fourcc(request.format).ok_or_else(unsupported)?;

        let mut fmt = self.device.format()?;
        fmt.width = request.width;
        fmt.height = request.height;
        fmt.fourcc = wanted;
        let fmt = self.device.set_format(&fmt)?;
        // the driver picks the nearest size but never silently switches format
        if fmt.fourcc != wanted {
            self.negotiated = None;
            return Err(unsupported());
        }

        let params = self
            .device
            .set_params(&Parameters::with_fps(request.max_fps))?;
        let interval = params.interval;
        let mut fps = request.max_fps;
        if interval.numerator != 0 {
            fps = interval.denominator / interval.numerator;
            if fps < request.min_fps {
                self.negotiated = None;
                return Err(DeviceError::UnsupportedRate {
                    size: FrameSize::new(fmt.width, fmt.height),
                    min_fps: request.min_fps,
                    max_fps: request.max_fps,
                });
            }
        }

        let size = FrameSize::new(fmt.width, fmt.height);
        debug!(path = %self.path, ?size, fourcc = %fmt.fourcc, "format set");
        self.negotiated = Some((size, request.format, fps));
        Ok(size)
    }

    fn start_streaming(
        &mut self,
        mut callback: FrameCallback,
        bandwidth: f32,
    ) -> Result<(), DeviceError> {
        let (size, format, fps) = self.negotiated.ok_or(DeviceError::NotNegotiated)?;
        if self.worker.is_some() {
            return Err(DeviceError::Busy);
        }
        // USB bandwidth is managed by the kernel driver
        debug!(bandwidth, "ignoring bandwidth factor");

        let mut stream = MmapStream::with_buffers(&self.device, Type::VideoCapture, self.buffer_count)?;
        let timeout = dequeue_timeout(fps);
        stream.set_timeout(timeout);
        let stop = Arc::new(AtomicBool::new(false));
        let handle = thread::Builder::new().name("v4l2-capture".into()).spawn({
            let stop = stop.clone();
            move || {
                while !stop.load(Ordering::Acquire) {
                    let (buf, meta) = match stream.next() {
                        Ok(next) => next,
                        Err(e) if e.kind() == ErrorKind::TimedOut => {
                            if stop.load(Ordering::Acquire) {
                                break;
                            }
                            // a timed-out dequeue leaves the buffer ring
                            // inconsistent; STREAMOFF and let next() requeue
                            debug!(?timeout, "no frame from device, restarting stream");
                            if let Err(e) = stream.stop() {
                                warn!("Capture error: {}", e);
                                break;
                            }
                            continue;
                        }
                        Err(e) => {
                            warn!("Capture error: {}", e);
                            break;
                        }
                    };
                    let frame = DeviceFrame {
                        sequence: meta.sequence as u64,
                        width: size.width,
                        height: size.height,
                        format,
                        data: buf,
                        actual_length: (meta.bytesused as usize).min(buf.len()),
                    };
                    callback(&frame);
                }
            }
        })?;

        info!("Capture stream started with {} buffers", self.buffer_count);
        self.worker = Some(Worker { stop, handle });
        Ok(())
    }

    fn stop_streaming(&mut self) {
        if let Some(worker) = self.worker.take() {
            worker.stop.store(true, Ordering::Release);
            // a blocked dequeue gives up after the stream timeout
            if worker.handle.join().is_err() {
                warn!("capture thread panicked");
            }
        }
    }

    fn supported_sizes(&self) -> Vec<SupportedSizes> {
        [PixelFormat::Yuyv, PixelFormat::Mjpeg]
            .into_iter()
            .filter_map(|format| {
                let sizes = self.device.enum_framesizes(fourcc(format)?).ok()?;
                let sizes = sizes
                    .into_iter()
                    .flat_map(|fs| match fs.size {
                        FrameSizeEnum::Discrete(d) => vec![FrameSize::new(d.width, d.height)],
                        FrameSizeEnum::Stepwise(s) => vec![
                            FrameSize::new(s.min_width, s.min_height),
                            FrameSize::new(s.max_width, s.max_height),
                        ],
                    })
                    .collect::<Vec<_>>();
                (!sizes.is_empty()).then_some(SupportedSizes { format, sizes })
            })
            .collect()
    }
}

impl Drop for V4l2Device {
    fn drop(&mut self) {
        self.stop_streaming();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dequeue_timeout_covers_frame_interval() {
        assert_eq!(dequeue_timeout(30), MIN_DEQUEUE_TIMEOUT);
        assert_eq!(dequeue_timeout(1), Duration::from_secs(2));
        assert_eq!(dequeue_timeout(0), Duration::from_secs(2));
        assert!(dequeue_timeout(5) >= Duration::from_millis(400));
    }
}
