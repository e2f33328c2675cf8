//! Per-frame diagnostics for the preview pipeline

use std::sync::atomic::{AtomicU64, Ordering};

use crossbeam::utils::CachePadded;

/// Counters shared by the device callback and the consumer thread
#[derive(Default)]
pub struct PipelineCounters {
    inner: CachePadded<Counters>,
}

#[derive(Default)]
struct Counters {
    frames_captured: AtomicU64,
    frames_malformed: AtomicU64,
    frames_dropped: AtomicU64,
    frames_displayed: AtomicU64,
    conversion_failures: AtomicU64,
    sink_failures: AtomicU64,
}

/// Point-in-time copy of the pipeline counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PipelineStats {
    /// Frames accepted by the callback and queued
    pub frames_captured: u64,
    /// Frames discarded by callback validation
    pub frames_malformed: u64,
    /// Valid frames dropped because the queue was full or stopping
    pub frames_dropped: u64,
    pub frames_displayed: u64,
    pub conversion_failures: u64,
    /// Submissions refused by the sink, including no sink bound
    pub sink_failures: u64,
}

impl PipelineCounters {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn captured(&self) {
        self.inner.frames_captured.fetch_add(1, Ordering::Relaxed);
        metrics::counter!("frames_captured").increment(1);
    }

    pub(crate) fn malformed(&self) {
        self.inner.frames_malformed.fetch_add(1, Ordering::Relaxed);
        metrics::counter!("frames_dropped", "reason" => "malformed").increment(1);
    }

    pub(crate) fn dropped(&self) {
        self.inner.frames_dropped.fetch_add(1, Ordering::Relaxed);
        metrics::counter!("frames_dropped", "reason" => "queue_full").increment(1);
    }

    pub(crate) fn displayed(&self) {
        self.inner.frames_displayed.fetch_add(1, Ordering::Relaxed);
        metrics::counter!("frames_displayed").increment(1);
    }

    pub(crate) fn conversion_failed(&self) {
        self.inner.conversion_failures.fetch_add(1, Ordering::Relaxed);
        metrics::counter!("frames_dropped", "reason" => "conversion").increment(1);
    }

    pub(crate) fn sink_failed(&self) {
        self.inner.sink_failures.fetch_add(1, Ordering::Relaxed);
        metrics::counter!("frames_dropped", "reason" => "sink").increment(1);
    }

    pub fn snapshot(&self) -> PipelineStats {
        let c = &self.inner;
        PipelineStats {
            frames_captured: c.frames_captured.load(Ordering::Relaxed),
            frames_malformed: c.frames_malformed.load(Ordering::Relaxed),
            frames_dropped: c.frames_dropped.load(Ordering::Relaxed),
            frames_displayed: c.frames_displayed.load(Ordering::Relaxed),
            conversion_failures: c.conversion_failures.load(Ordering::Relaxed),
            sink_failures: c.sink_failures.load(Ordering::Relaxed),
        }
    }
}
