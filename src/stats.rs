//! Pipeline counters
//!
//! Lock-free counters bumped by the pumps, snapshotted by the host and
//! logged once at shutdown alongside the queue and cache numbers.

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

use log::info;

use crate::buffer::QueueCounters;
use crate::cache::CacheStats;

#[derive(Debug, Default)]
pub struct PipelineStats {
    pub frames_decoded: AtomicU64,
    pub frames_displayed: AtomicU64,
    pub frames_dropped: AtomicU64,
    pub decode_errors: AtomicU64,
    pub cache_bypass_decodes: AtomicU64,
    pub accel_transfer_failures: AtomicU32,
    pub audio_batches: AtomicU64,
}

/// Plain-value snapshot for hosts and tests.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub frames_decoded: u64,
    pub frames_displayed: u64,
    pub frames_dropped: u64,
    pub decode_errors: u64,
    /// Frames served from cache instead of the codec.
    pub cache_bypass_decodes: u64,
    pub accel_transfer_failures: u32,
    pub audio_batches: u64,
}

impl PipelineStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            frames_decoded: self.frames_decoded.load(Ordering::Relaxed),
            frames_displayed: self.frames_displayed.load(Ordering::Relaxed),
            frames_dropped: self.frames_dropped.load(Ordering::Relaxed),
            decode_errors: self.decode_errors.load(Ordering::Relaxed),
            cache_bypass_decodes: self.cache_bypass_decodes.load(Ordering::Relaxed),
            accel_transfer_failures: self.accel_transfer_failures.load(Ordering::Relaxed),
            audio_batches: self.audio_batches.load(Ordering::Relaxed),
        }
    }

    /// Shutdown summary line, in one place so every teardown path logs
    /// the same shape.
    pub fn log_summary(&self, queue: QueueCounters, cache: Option<CacheStats>) {
        let s = self.snapshot();
        info!(
            "pipeline stats: {} decoded ({} from cache), {} displayed, {} dropped, {} decode errors, {} audio batches",
            s.frames_decoded,
            s.cache_bypass_decodes,
            s.frames_displayed,
            s.frames_dropped,
            s.decode_errors,
            s.audio_batches,
        );
        info!(
            "queue stats: {} in / {} out, {} backpressure waits, {} flushes",
            queue.enqueued, queue.dequeued, queue.enqueue_failures, queue.flushes
        );
        if let Some(c) = cache {
            info!(
                "cache stats: {} hits / {} misses, {} evictions, {}/{} slots",
                c.hits, c.misses, c.evictions, c.occupied, c.capacity
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_snapshot_reflects_counters() {
        let stats = PipelineStats::new();
        stats.frames_decoded.fetch_add(10, Ordering::Relaxed);
        stats.frames_displayed.fetch_add(9, Ordering::Relaxed);
        stats.frames_dropped.fetch_add(1, Ordering::Relaxed);
        let s = stats.snapshot();
        assert_eq!(s.frames_decoded, 10);
        assert_eq!(s.frames_displayed, 9);
        assert_eq!(s.frames_dropped, 1);
        assert_eq!(s.decode_errors, 0);
    }
}
