//! Preview engine: lifecycle state machine and the consumer thread

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::Instant;

use tracing::{debug, info, instrument, warn};

use crate::capture::decoder::{decoded_bytes, mjpeg_to_yuyv};
use crate::capture::device::{CaptureDevice, SupportedSizes};
use crate::capture::session::{frame_callback, CaptureSession, Negotiated, PreviewRequest};
use crate::capture::{FrameBuffer, FrameSize, StreamMode};
use crate::display::DisplaySink;
use crate::error::{PreviewError, Result, SinkError};
use crate::pipeline::convert::{convert, OutputFormat};
use crate::pipeline::pool::FramePool;
use crate::pipeline::queue::FrameQueue;
use crate::pipeline::stats::{PipelineCounters, PipelineStats};
use crate::PipelineConfig;

type SharedSink = Arc<Mutex<Option<Box<dyn DisplaySink>>>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PreviewState {
    Stopped,
    Starting,
    Running,
    Stopping,
}

struct Control {
    session: CaptureSession,
    output: OutputFormat,
    consumer: Option<JoinHandle<()>>,
}

/// Drives a capture device into a display sink.
///
/// Lifecycle calls are serialised on an internal lock and may come from any
/// thread. Frames flow device callback -> queue -> consumer thread -> sink,
/// with every buffer drawn from and returned to one pool.
pub struct PreviewEngine {
    control: Mutex<Control>,
    state: Mutex<PreviewState>,
    pool: Arc<FramePool>,
    queue: Arc<FrameQueue>,
    sink: SharedSink,
    counters: Arc<PipelineCounters>,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

impl PreviewEngine {
    pub fn new(device: Box<dyn CaptureDevice>, config: &PipelineConfig) -> Self {
        Self {
            control: Mutex::new(Control {
                session: CaptureSession::new(device),
                output: config.output_format,
                consumer: None,
            }),
            state: Mutex::new(PreviewState::Stopped),
            pool: Arc::new(FramePool::new(config.frame_pool_size)),
            queue: Arc::new(FrameQueue::new(config.max_queued_frames)),
            sink: Arc::new(Mutex::new(None)),
            counters: Arc::new(PipelineCounters::new()),
        }
    }

    /// Negotiate a new stream format. Only allowed while stopped.
    #[instrument(skip(self))]
    pub fn set_preview_size(&self, request: PreviewRequest) -> Result<Negotiated> {
        let mut control = lock(&self.control);
        if self.state() != PreviewState::Stopped {
            return Err(PreviewError::Busy);
        }
        let negotiated = control
            .session
            .negotiate(request)
            .map_err(PreviewError::Negotiation)?;
        self.update_sink_geometry(negotiated.size, control.output);
        Ok(negotiated)
    }

    /// Select the pixel format handed to the sink. Only allowed while stopped.
    pub fn set_output_format(&self, format: OutputFormat) -> Result<()> {
        let mut control = lock(&self.control);
        if self.state() != PreviewState::Stopped {
            return Err(PreviewError::Busy);
        }
        control.output = format;
        if let Some(negotiated) = control.session.negotiated() {
            self.update_sink_geometry(negotiated.size, format);
        }
        Ok(())
    }

    #[instrument(skip(self))]
    pub fn start_preview(&self) -> Result<()> {
        let mut control = lock(&self.control);
        {
            let mut state = lock(&self.state);
            if *state != PreviewState::Stopped {
                warn!("preview already running");
                return Err(PreviewError::AlreadyRunning);
            }
            *state = PreviewState::Starting;
        }

        let result = self.launch(&mut control);
        *lock(&self.state) = match result {
            Ok(()) => PreviewState::Running,
            Err(_) => PreviewState::Stopped,
        };
        if result.is_ok() {
            info!("preview started");
        }
        result
    }

    fn launch(&self, control: &mut Control) -> Result<()> {
        let request = control.session.request();
        let negotiated = control
            .session
            .negotiate(request)
            .map_err(PreviewError::Negotiation)?;
        self.update_sink_geometry(negotiated.size, control.output);

        self.queue.set_running(true);
        let consumer = Consumer {
            pool: self.pool.clone(),
            queue: self.queue.clone(),
            sink: self.sink.clone(),
            counters: self.counters.clone(),
            negotiated,
            output: control.output,
        };
        let spawned = thread::Builder::new()
            .name("uvc-preview".into())
            .spawn(move || consumer.run());
        match spawned {
            Ok(handle) => control.consumer = Some(handle),
            Err(e) => {
                warn!("could not create preview thread: {}", e);
                // wakes anything already parked on the queue
                self.queue.set_running(false);
                return Err(PreviewError::Spawn(e));
            }
        }

        let callback = frame_callback(
            negotiated,
            self.pool.clone(),
            self.queue.clone(),
            self.counters.clone(),
        );
        if let Err(e) = control.session.begin_streaming(callback) {
            warn!("failed start_streaming: {}", e);
            self.halt(control);
            return Err(PreviewError::Streaming(e));
        }
        Ok(())
    }

    /// Stop the preview. A no-op when already stopped.
    #[instrument(skip(self))]
    pub fn stop_preview(&self) -> Result<()> {
        let mut control = lock(&self.control);
        {
            let mut state = lock(&self.state);
            if *state == PreviewState::Stopped {
                return Ok(());
            }
            *state = PreviewState::Stopping;
        }

        self.halt(&mut control);
        if let Some(mut sink) = lock(&self.sink).take() {
            sink.clear();
        }
        *lock(&self.state) = PreviewState::Stopped;
        info!("preview stopped");
        Ok(())
    }

    /// Clear the run flag, join the consumer, stop the device, then drain.
    /// Nothing is drained before the join.
    fn halt(&self, control: &mut Control) {
        self.queue.set_running(false);
        if let Some(handle) = control.consumer.take() {
            if handle.join().is_err() {
                warn!("preview thread panicked");
            }
        }
        control.session.end_streaming();
        let drained = self.queue.drain(&self.pool);
        if drained > 0 {
            debug!(drained, "released queued frames");
        }
    }

    pub fn is_running(&self) -> bool {
        self.state() == PreviewState::Running
    }

    pub fn state(&self) -> PreviewState {
        *lock(&self.state)
    }

    /// Bind a display sink, replacing any previous one. The sink learns the
    /// current geometry before it sees a frame.
    pub fn bind_sink(&self, mut sink: Box<dyn DisplaySink>) {
        let control = lock(&self.control);
        if let Some(negotiated) = control.session.negotiated() {
            let size = negotiated.size;
            if let Err(e) = sink.set_geometry(size.width, size.height, control.output) {
                warn!("failed to set sink geometry: {}", e);
            }
        }
        *lock(&self.sink) = Some(sink);
    }

    pub fn unbind_sink(&self) -> Option<Box<dyn DisplaySink>> {
        lock(&self.sink).take()
    }

    pub fn supported_sizes(&self) -> Vec<SupportedSizes> {
        lock(&self.control).session.supported_sizes()
    }

    pub fn negotiated(&self) -> Option<Negotiated> {
        lock(&self.control).session.negotiated()
    }

    pub fn stats(&self) -> PipelineStats {
        self.counters.snapshot()
    }

    /// Frames waiting for the consumer
    pub fn queued_frames(&self) -> usize {
        self.queue.len()
    }

    pub fn pool(&self) -> &FramePool {
        &self.pool
    }

    fn update_sink_geometry(&self, size: FrameSize, output: OutputFormat) {
        if let Some(sink) = lock(&self.sink).as_mut() {
            if let Err(e) = sink.set_geometry(size.width, size.height, output) {
                warn!("failed to set sink geometry: {}", e);
            }
        }
    }
}

impl Drop for PreviewEngine {
    fn drop(&mut self) {
        let _ = self.stop_preview();
        self.pool.drain();
    }
}

/// State moved onto the consumer thread
struct Consumer {
    pool: Arc<FramePool>,
    queue: Arc<FrameQueue>,
    sink: SharedSink,
    counters: Arc<PipelineCounters>,
    negotiated: Negotiated,
    output: OutputFormat,
}

impl Consumer {
    fn run(self) {
        debug!(negotiated = ?self.negotiated, output = ?self.output, "preview thread started");
        loop {
            match self.queue.pop() {
                Some(frame) => self.handle_frame(frame),
                None if !self.queue.is_running() => break,
                None => continue,
            }
        }
        debug!("preview thread finished");
    }

    fn handle_frame(&self, frame: FrameBuffer) {
        let frame = match self.negotiated.mode {
            StreamMode::Raw => frame,
            StreamMode::Compressed => {
                let size = self.negotiated.size;
                let mut decoded = self.pool.acquire(decoded_bytes(size));
                let result = mjpeg_to_yuyv(&frame, size, &mut decoded);
                self.pool.release(frame);
                if let Err(e) = result {
                    warn!("failed decoding MJPEG frame: {}", e);
                    self.counters.conversion_failed();
                    self.pool.release(decoded);
                    return;
                }
                decoded
            }
        };
        self.present(&frame);
        self.pool.release(frame);
    }

    fn present(&self, frame: &FrameBuffer) {
        if self.output.converter().is_none() {
            self.submit(frame);
            return;
        }
        if lock(&self.sink).is_none() {
            // nothing to draw on, skip the conversion
            self.counters.sink_failed();
            return;
        }

        let started = Instant::now();
        let mut converted = self
            .pool
            .acquire(self.output.frame_bytes(FrameSize::new(frame.width, frame.height)));
        match convert(frame, self.output, &mut converted) {
            Ok(()) => {
                metrics::histogram!("convert_time_us").record(started.elapsed().as_micros() as f64);
                self.submit(&converted);
            }
            Err(e) => {
                warn!("failed converting: {}", e);
                self.counters.conversion_failed();
            }
        }
        self.pool.release(converted);
    }

    fn submit(&self, frame: &FrameBuffer) {
        let mut sink = lock(&self.sink);
        let result = match sink.as_mut() {
            Some(sink) => sink.submit(frame),
            None => Err(SinkError::Unbound),
        };
        drop(sink);

        match result {
            Ok(()) => {
                self.counters.displayed();
                metrics::histogram!("frame_latency_ms")
                    .record(frame.captured_at.elapsed().as_secs_f64() * 1000.0);
            }
            Err(e) => {
                debug!(sequence = frame.sequence, "sink refused frame: {}", e);
                self.counters.sink_failed();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::virtual_device::VirtualDevice;
    use crate::capture::{DeviceFrame, PixelFormat};

    #[derive(Default, Clone)]
    struct Recorder(Arc<Mutex<Vec<Vec<u8>>>>);

    impl DisplaySink for Recorder {
        fn set_geometry(
            &mut self,
            _: u32,
            _: u32,
            _: OutputFormat,
        ) -> std::result::Result<(), SinkError> {
            Ok(())
        }

        fn submit(&mut self, frame: &FrameBuffer) -> std::result::Result<(), SinkError> {
            lock(&self.0).push(frame.as_slice().to_vec());
            Ok(())
        }
    }

    /// Pattern acquired, pushed, popped and passed through untouched
    #[test]
    fn test_passthrough_round_trip() {
        let pool = Arc::new(FramePool::new(4));
        let queue = Arc::new(FrameQueue::new(4));
        let recorder = Recorder::default();
        let consumer = Consumer {
            pool: pool.clone(),
            queue: queue.clone(),
            sink: Arc::new(Mutex::new(Some(Box::new(recorder.clone())))),
            counters: Arc::new(PipelineCounters::new()),
            negotiated: Negotiated {
                size: FrameSize::new(4, 2),
                mode: StreamMode::Raw,
                frame_bytes: 16,
            },
            output: OutputFormat::Raw,
        };

        let pattern: Vec<u8> = (0..16).collect();
        let mut buf = pool.acquire(pattern.len());
        buf.copy_from(&DeviceFrame {
            sequence: 1,
            width: 4,
            height: 2,
            format: PixelFormat::Yuyv,
            data: &pattern,
            actual_length: pattern.len(),
        });
        queue.set_running(true);
        queue.push(buf).unwrap();

        let frame = queue.pop().unwrap();
        consumer.handle_frame(frame);

        assert_eq!(*lock(&recorder.0), vec![pattern]);
        assert_eq!(pool.idle_len(), 1);
    }

    #[test]
    fn test_stop_when_stopped_is_noop() {
        let (device, _) = VirtualDevice::new(vec![FrameSize::new(640, 480)]);
        let engine = PreviewEngine::new(Box::new(device), &PipelineConfig::default());
        assert!(engine.stop_preview().is_ok());
        assert_eq!(engine.state(), PreviewState::Stopped);
    }

    #[test]
    fn test_streaming_refusal_unwinds() {
        let (device, _) = VirtualDevice::new(vec![FrameSize::new(640, 480)]);
        let engine = PreviewEngine::new(
            Box::new(device.refuse_streaming()),
            &PipelineConfig::default(),
        );
        assert!(matches!(
            engine.start_preview(),
            Err(PreviewError::Streaming(_))
        ));
        assert_eq!(engine.state(), PreviewState::Stopped);
        assert!(!engine.queue.is_running());
        assert!(engine.start_preview().is_err());
    }
}
