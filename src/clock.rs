//! Playback clock: maps media timestamps to wall-clock deadlines
//!
//! The clock anchors a media timeline to a system instant once per
//! discontinuity (initial play, accepted seek, loop wrap) and then derives
//! every frame deadline arithmetically from that epoch. Deadlines are never
//! smoothed or re-anchored mid-stream, so pacing error does not accumulate.
//!
//! `deadline_for(pts) = system_start + (pts - media_start_pts) / rate`
//!
//! **Used by**: decode pump (deadline stamping, epoch resets), display pump
//! (position updates after emit), controller (position queries).

use std::sync::Mutex;
use std::time::{Duration, Instant};

use log::trace;
use once_cell::sync::OnceCell;

use crate::frame::MediaPts;

#[derive(Debug, Clone)]
struct ClockState {
    /// Wall-clock anchor of the current epoch.
    system_start: Instant,
    /// Media timestamp that maps onto `system_start`.
    media_start_pts: MediaPts,
    /// Playback rate; 1.0 = realtime. Must stay > 0.
    rate: f64,
    /// Last observed media position (updated on emit).
    last_pts: MediaPts,
    /// When `last_pts` was observed.
    last_system: Option<Instant>,
}

/// Thread-safe playback clock. The inner mutex is held only for the few
/// loads/stores of a query; no pump ever sleeps while holding it.
#[derive(Debug)]
pub struct PlaybackClock {
    state: Mutex<ClockState>,
}

impl PlaybackClock {
    pub fn new(rate: f64) -> Self {
        Self {
            state: Mutex::new(ClockState {
                system_start: Instant::now(),
                media_start_pts: 0,
                rate: if rate > 0.0 { rate } else { 1.0 },
                last_pts: 0,
                last_system: None,
            }),
        }
    }

    /// Start a new epoch anchored at `origin`: `start_pts` maps onto
    /// `origin`, and all later deadlines derive from that pair.
    pub fn reset_at(&self, origin: Instant, start_pts: MediaPts) {
        let mut st = self.state.lock().unwrap();
        st.system_start = origin;
        st.media_start_pts = start_pts;
        st.last_pts = start_pts;
        st.last_system = None;
        trace!("clock epoch reset: media_start_pts={}us rate={}", start_pts, st.rate);
    }

    /// Start a new epoch anchored at the current instant.
    pub fn reset(&self, start_pts: MediaPts) {
        self.reset_at(Instant::now(), start_pts);
    }

    /// Wall-clock deadline for a frame at `pts` within the current epoch.
    /// Timestamps before the epoch start map onto the epoch anchor itself.
    pub fn deadline_for(&self, pts: MediaPts) -> Instant {
        let st = self.state.lock().unwrap();
        let offset_us = pts.saturating_sub(st.media_start_pts);
        if offset_us <= 0 {
            return st.system_start;
        }
        let scaled = offset_us as f64 / st.rate;
        st.system_start + Duration::from_micros(scaled as u64)
    }

    /// Record that playback has reached `pts` (called after each emit).
    pub fn update(&self, pts: MediaPts) {
        let mut st = self.state.lock().unwrap();
        st.last_pts = pts;
        st.last_system = Some(Instant::now());
    }

    /// Last media position reached, in microseconds.
    pub fn position(&self) -> MediaPts {
        self.state.lock().unwrap().last_pts
    }

    /// Change the playback rate. Takes effect from the next epoch reset;
    /// mid-epoch the already-anchored mapping keeps its original rate for
    /// frames whose deadlines were already stamped.
    pub fn set_rate(&self, rate: f64) {
        if rate <= 0.0 {
            log::warn!("ignoring non-positive playback rate {}", rate);
            return;
        }
        self.state.lock().unwrap().rate = rate;
    }

    pub fn rate(&self) -> f64 {
        self.state.lock().unwrap().rate
    }
}

/// Shared timing origin for pipelines that must agree on one epoch
/// (e.g. separate video and audio delivery anchored to the same start).
///
/// The first claimer sets the origin; everyone after that observes the
/// same instant. Explicitly scoped and injected, not process-global.
#[derive(Debug, Default)]
pub struct SharedEpoch {
    origin: OnceCell<Instant>,
}

impl SharedEpoch {
    pub fn new() -> Self {
        Self { origin: OnceCell::new() }
    }

    /// Return the shared origin, claiming it at the current instant if no
    /// one has yet.
    pub fn claim(&self) -> Instant {
        *self.origin.get_or_init(Instant::now)
    }

    /// The origin, if some participant already claimed it.
    pub fn get(&self) -> Option<Instant> {
        self.origin.get().copied()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_deadline_schedule() {
        // Frames at 0 / 33 / 66 ms map to epoch + 0 / 33 / 66 ms.
        let clock = PlaybackClock::new(1.0);
        let origin = Instant::now();
        clock.reset_at(origin, 0);

        assert_eq!(clock.deadline_for(0), origin);
        assert_eq!(clock.deadline_for(33_000), origin + Duration::from_millis(33));
        assert_eq!(clock.deadline_for(66_000), origin + Duration::from_millis(66));
    }

    #[test]
    fn test_deadline_monotonic_within_epoch() {
        let clock = PlaybackClock::new(1.0);
        clock.reset(10_000);
        let mut prev = clock.deadline_for(10_000);
        for pts in (20_000..200_000).step_by(33_000) {
            let d = clock.deadline_for(pts);
            assert!(d >= prev, "deadline regressed at pts={}", pts);
            prev = d;
        }
    }

    #[test]
    fn test_pts_before_epoch_clamps_to_anchor() {
        let clock = PlaybackClock::new(1.0);
        let origin = Instant::now();
        clock.reset_at(origin, 50_000);
        assert_eq!(clock.deadline_for(10_000), origin);
    }

    #[test]
    fn test_rate_scales_deadlines() {
        let clock = PlaybackClock::new(2.0);
        let origin = Instant::now();
        clock.reset_at(origin, 0);
        // 2x rate halves the wall-clock spacing
        assert_eq!(clock.deadline_for(100_000), origin + Duration::from_millis(50));
    }

    #[test]
    fn test_seek_starts_new_epoch() {
        let clock = PlaybackClock::new(1.0);
        let origin = Instant::now();
        clock.reset_at(origin, 0);
        let before = clock.deadline_for(500_000);

        // Seek forward: same pts now lands near the new anchor, not 500ms out
        let seek_origin = origin + Duration::from_millis(5);
        clock.reset_at(seek_origin, 500_000);
        assert_eq!(clock.deadline_for(500_000), seek_origin);
        assert!(clock.deadline_for(533_000) < before);
    }

    #[test]
    fn test_position_tracks_updates() {
        let clock = PlaybackClock::new(1.0);
        clock.reset(0);
        clock.update(33_000);
        assert_eq!(clock.position(), 33_000);
        clock.update(66_000);
        assert_eq!(clock.position(), 66_000);
    }

    #[test]
    fn test_shared_epoch_single_claim() {
        let epoch = Arc::new(SharedEpoch::new());
        assert!(epoch.get().is_none());

        let mut handles = Vec::new();
        for _ in 0..4 {
            let e = Arc::clone(&epoch);
            handles.push(thread::spawn(move || e.claim()));
        }
        let claims: Vec<Instant> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        for c in &claims {
            assert_eq!(*c, claims[0]);
        }
        assert_eq!(epoch.get(), Some(claims[0]));
    }
}
