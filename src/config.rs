//! Pipeline configuration
//!
//! All tuning knobs live here with defaults matching long-proven values:
//! a 4-slot queue (enough to absorb decode jitter without adding latency),
//! ~1 second of frame cache, a 500ms late-drop threshold, 3ms emit
//! tolerance, and a 10s pause-ready resume window.
//!
//! Serde-backed so hosts can load overrides from JSON.

use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use log::info;
use serde::{Deserialize, Serialize};

use crate::buffer::QueueBacking;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Frame queue slots between the pumps.
    pub queue_capacity: usize,
    pub queue_backing: QueueBacking,

    pub cache_enabled: bool,
    /// Cache slots; 30 is about one second at typical frame rates.
    pub cache_capacity: usize,
    /// Also cache pixel-conversion output alongside the decoded frame.
    pub cache_converted: bool,

    /// Frames later than this are dropped, not delivered.
    pub late_drop_threshold_ms: u64,
    /// Frames within this of their deadline are emitted immediately.
    pub emit_tolerance_ms: u64,
    /// Coarse pacing sleep while far from the deadline.
    pub coarse_sleep_ms: u64,
    /// Finer sleep once inside `fine_sleep_window_ms`.
    pub fine_sleep_ms: u64,
    /// Remaining-time boundary between coarse and fine sleeps.
    pub fine_sleep_window_ms: u64,
    /// Poll interval while a pump idles (paused, or EOF without looping).
    pub idle_poll_ms: u64,

    /// How long a pause_ready snapshot stays resumable.
    pub resume_window_ms: u64,
    /// Deferred-stop grace period after release().
    pub stop_grace_ms: u64,
    /// Per-thread join budget during shutdown before a warning is logged.
    pub join_timeout_ms: u64,

    /// Consecutive accelerated-transfer failures before the accelerated
    /// path is disabled for the rest of the session.
    pub accel_failure_limit: u32,
    /// Consecutive decode failures before playback pauses itself.
    /// `None` keeps the skip-and-continue behavior indefinitely.
    pub stall_pause_limit: Option<u32>,

    /// Playback rate, 1.0 = realtime.
    pub playback_rate: f64,
    /// Restart from the beginning at end of stream.
    pub looping: bool,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            queue_capacity: 4,
            queue_backing: QueueBacking::LockFree,
            cache_enabled: true,
            cache_capacity: 30,
            cache_converted: true,
            late_drop_threshold_ms: 500,
            emit_tolerance_ms: 3,
            coarse_sleep_ms: 10,
            fine_sleep_ms: 4,
            fine_sleep_window_ms: 15,
            idle_poll_ms: 20,
            resume_window_ms: 10_000,
            stop_grace_ms: 2_000,
            join_timeout_ms: 1_000,
            accel_failure_limit: 5,
            stall_pause_limit: None,
            playback_rate: 1.0,
            looping: false,
        }
    }
}

impl PipelineConfig {
    /// Load a config from a JSON file. Missing fields fall back to
    /// defaults (`serde(default)`).
    pub fn from_json_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("reading pipeline config {}", path.display()))?;
        let config: Self = serde_json::from_str(&raw)
            .with_context(|| format!("parsing pipeline config {}", path.display()))?;
        config.validate()?;
        info!("pipeline config loaded from {}", path.display());
        Ok(config)
    }

    /// Reject values the pumps cannot operate with.
    pub fn validate(&self) -> Result<()> {
        anyhow::ensure!(self.queue_capacity >= 1, "queue_capacity must be >= 1");
        anyhow::ensure!(self.cache_capacity >= 1, "cache_capacity must be >= 1");
        anyhow::ensure!(self.playback_rate > 0.0, "playback_rate must be > 0");
        anyhow::ensure!(
            self.emit_tolerance_ms < self.late_drop_threshold_ms,
            "emit_tolerance_ms must be below late_drop_threshold_ms"
        );
        Ok(())
    }

    pub fn late_drop_threshold(&self) -> Duration {
        Duration::from_millis(self.late_drop_threshold_ms)
    }

    pub fn emit_tolerance(&self) -> Duration {
        Duration::from_millis(self.emit_tolerance_ms)
    }

    pub fn idle_poll(&self) -> Duration {
        Duration::from_millis(self.idle_poll_ms)
    }

    pub fn resume_window(&self) -> Duration {
        Duration::from_millis(self.resume_window_ms)
    }

    pub fn stop_grace(&self) -> Duration {
        Duration::from_millis(self.stop_grace_ms)
    }

    pub fn join_timeout(&self) -> Duration {
        Duration::from_millis(self.join_timeout_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let c = PipelineConfig::default();
        assert_eq!(c.queue_capacity, 4);
        assert_eq!(c.queue_backing, QueueBacking::LockFree);
        assert_eq!(c.cache_capacity, 30);
        assert_eq!(c.late_drop_threshold_ms, 500);
        assert_eq!(c.emit_tolerance_ms, 3);
        assert_eq!(c.resume_window_ms, 10_000);
        assert_eq!(c.stop_grace_ms, 2_000);
        assert_eq!(c.accel_failure_limit, 5);
        assert_eq!(c.stall_pause_limit, None);
        assert!(c.validate().is_ok());
    }

    #[test]
    fn test_partial_json_uses_defaults() {
        let c: PipelineConfig =
            serde_json::from_str(r#"{"queue_capacity": 8, "looping": true}"#).unwrap();
        assert_eq!(c.queue_capacity, 8);
        assert!(c.looping);
        assert_eq!(c.cache_capacity, 30);
        assert_eq!(c.playback_rate, 1.0);
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let mut c = PipelineConfig::default();
        c.queue_capacity = 0;
        assert!(c.validate().is_err());

        let mut c = PipelineConfig::default();
        c.playback_rate = 0.0;
        assert!(c.validate().is_err());

        let mut c = PipelineConfig::default();
        c.emit_tolerance_ms = 600;
        assert!(c.validate().is_err());
    }

    #[test]
    fn test_roundtrip_json() {
        let c = PipelineConfig { looping: true, ..Default::default() };
        let raw = serde_json::to_string(&c).unwrap();
        let back: PipelineConfig = serde_json::from_str(&raw).unwrap();
        assert!(back.looping);
        assert_eq!(back.queue_capacity, c.queue_capacity);
    }
}
