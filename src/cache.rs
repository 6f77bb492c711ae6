//! Fixed-capacity frame cache keyed by media timestamp
//!
//! **Why**: looped and revisited content decodes the same frames over and
//! over. Caching roughly one second of decoded output (default 30 slots)
//! lets the decode pump skip the codec entirely on a pts hit.
//!
//! Entries are pinned while a consumer holds a [`CacheHandle`]; pinned
//! entries are never evicted. Eviction picks the least-recently-accessed
//! unpinned slot. Insertion clones the frame (reference-counted pixels),
//! so the cached entry never aliases the caller's copy lifecycle.
//!
//! Lookup is a linear scan — at 30 slots that is cheaper and simpler than
//! any index structure, and the hot path is bounded by decode anyway.

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use log::{debug, info, trace};

use crate::frame::{DecodedFrame, MediaPts, PixelBuffer};

/// Pinned view of a cache entry. Holding the handle keeps the slot safe
/// from eviction; drop releases the pin (exactly one release per hit).
#[derive(Debug)]
pub struct CacheHandle {
    pub frame: DecodedFrame,
    /// Conversion output cached alongside the frame, when present.
    pub converted: Option<Arc<PixelBuffer>>,
    pins: Arc<AtomicU32>,
}

impl Drop for CacheHandle {
    fn drop(&mut self) {
        self.pins.fetch_sub(1, Ordering::Release);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SlotState {
    Empty,
    Ready,
}

struct CacheSlot {
    state: SlotState,
    pts: MediaPts,
    frame: Option<DecodedFrame>,
    converted: Option<Arc<PixelBuffer>>,
    /// Logical access tick, not wall time; eviction compares ticks.
    last_access: u64,
    access_count: u64,
    /// Shared with outstanding handles; release never takes the slot lock.
    pins: Arc<AtomicU32>,
}

impl CacheSlot {
    fn empty() -> Self {
        Self {
            state: SlotState::Empty,
            pts: 0,
            frame: None,
            converted: None,
            last_access: 0,
            access_count: 0,
            pins: Arc::new(AtomicU32::new(0)),
        }
    }

    fn clear(&mut self) {
        self.state = SlotState::Empty;
        self.frame = None;
        self.converted = None;
        self.access_count = 0;
        // Outstanding handles keep their own Arc; a fresh pin cell means
        // stale releases cannot touch the slot's next occupant.
        self.pins = Arc::new(AtomicU32::new(0));
    }
}

/// Counter snapshot for logging and tests.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    pub insertions: u64,
    pub rejected: u64,
    pub occupied: usize,
    pub capacity: usize,
}

pub struct FrameCache {
    slots: Mutex<Vec<CacheSlot>>,
    capacity: usize,
    tick: AtomicU64,
    /// Bumped by invalidate; identifies the current content generation.
    generation: AtomicU64,
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
    insertions: AtomicU64,
    rejected: AtomicU64,
}

impl FrameCache {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        debug!("frame cache created: {} slots", capacity);
        let mut slots = Vec::with_capacity(capacity);
        slots.resize_with(capacity, CacheSlot::empty);
        Self {
            slots: Mutex::new(slots),
            capacity,
            tick: AtomicU64::new(1),
            generation: AtomicU64::new(0),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
            insertions: AtomicU64::new(0),
            rejected: AtomicU64::new(0),
        }
    }

    fn next_tick(&self) -> u64 {
        self.tick.fetch_add(1, Ordering::Relaxed)
    }

    /// Look up a frame by exact pts. A hit pins the entry until the
    /// returned handle is dropped.
    pub fn get(&self, pts: MediaPts) -> Option<CacheHandle> {
        let mut slots = self.slots.lock().unwrap();
        let tick = self.next_tick();
        for slot in slots.iter_mut() {
            if slot.state == SlotState::Ready && slot.pts == pts {
                slot.last_access = tick;
                slot.access_count += 1;
                slot.pins.fetch_add(1, Ordering::Acquire);
                let frame = match &slot.frame {
                    Some(f) => f.clone(),
                    None => {
                        // Ready slot without a frame is a protocol bug;
                        // heal it and report a miss.
                        log::error!("cache slot for pts={} lost its frame", pts);
                        slot.pins.fetch_sub(1, Ordering::Release);
                        slot.clear();
                        self.misses.fetch_add(1, Ordering::Relaxed);
                        return None;
                    }
                };
                self.hits.fetch_add(1, Ordering::Relaxed);
                trace!("cache hit pts={}us (access #{})", pts, slot.access_count);
                return Some(CacheHandle {
                    frame,
                    converted: slot.converted.clone(),
                    pins: Arc::clone(&slot.pins),
                });
            }
        }
        self.misses.fetch_add(1, Ordering::Relaxed);
        None
    }

    /// Insert a frame (and optionally its conversion output). Returns
    /// false when every slot is pinned — the put is refused rather than
    /// evicting anything a consumer still holds.
    pub fn put(
        &self,
        frame: &DecodedFrame,
        converted: Option<Arc<PixelBuffer>>,
    ) -> bool {
        let mut slots = self.slots.lock().unwrap();
        let tick = self.next_tick();

        // Same pts already cached: refresh it in place.
        if let Some(slot) = slots
            .iter_mut()
            .find(|s| s.state == SlotState::Ready && s.pts == frame.pts)
        {
            slot.frame = Some(frame.clone());
            slot.converted = converted;
            slot.last_access = tick;
            return true;
        }

        let victim = match Self::pick_victim(&mut slots) {
            Some(idx) => idx,
            None => {
                self.rejected.fetch_add(1, Ordering::Relaxed);
                trace!("cache put refused: all {} slots pinned", self.capacity);
                return false;
            }
        };

        let slot = &mut slots[victim];
        if slot.state == SlotState::Ready {
            trace!(
                "cache evict pts={}us (last_access={})",
                slot.pts, slot.last_access
            );
            slot.clear();
            self.evictions.fetch_add(1, Ordering::Relaxed);
        }

        slot.state = SlotState::Ready;
        slot.pts = frame.pts;
        slot.frame = Some(frame.clone());
        slot.converted = converted;
        slot.last_access = tick;
        slot.access_count = 0;
        self.insertions.fetch_add(1, Ordering::Relaxed);
        trace!("cache put pts={}us -> slot {}", frame.pts, victim);
        true
    }

    /// First empty slot, else the least-recently-accessed unpinned one.
    fn pick_victim(slots: &mut [CacheSlot]) -> Option<usize> {
        if let Some(idx) = slots.iter().position(|s| s.state == SlotState::Empty) {
            return Some(idx);
        }
        slots
            .iter()
            .enumerate()
            .filter(|(_, s)| s.pins.load(Ordering::Acquire) == 0)
            .min_by_key(|(_, s)| s.last_access)
            .map(|(idx, _)| idx)
    }

    /// Drop every entry and start a new content generation. Outstanding
    /// handles stay valid (they own their pixels); their releases hit
    /// detached pin cells.
    pub fn invalidate(&self) {
        let mut slots = self.slots.lock().unwrap();
        let mut dropped = 0usize;
        for slot in slots.iter_mut() {
            if slot.state == SlotState::Ready {
                dropped += 1;
            }
            slot.clear();
        }
        let generation = self.generation.fetch_add(1, Ordering::AcqRel) + 1;
        debug!("cache invalidated: {} entries dropped, generation {}", dropped, generation);
    }

    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::Acquire)
    }

    pub fn stats(&self) -> CacheStats {
        let occupied = {
            let slots = self.slots.lock().unwrap();
            slots.iter().filter(|s| s.state == SlotState::Ready).count()
        };
        CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
            insertions: self.insertions.load(Ordering::Relaxed),
            rejected: self.rejected.load(Ordering::Relaxed),
            occupied,
            capacity: self.capacity,
        }
    }

    /// Shutdown-time summary, mirrored on the queue side by its counters.
    pub fn log_stats(&self) {
        let s = self.stats();
        let total = s.hits + s.misses;
        let rate = if total > 0 {
            s.hits as f64 / total as f64 * 100.0
        } else {
            0.0
        };
        info!(
            "cache stats: {}/{} slots, {} hits / {} misses ({:.1}% hit rate), {} evictions, {} insertions, {} refused",
            s.occupied, s.capacity, s.hits, s.misses, rate, s.evictions, s.insertions, s.rejected
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::test_frame;

    #[test]
    fn test_hit_and_miss_accounting() {
        let cache = FrameCache::new(4);
        assert!(cache.get(0).is_none());
        cache.put(&test_frame(0), None);

        let handle = cache.get(0).unwrap();
        assert_eq!(handle.frame.pts, 0);
        assert!(cache.get(33_000).is_none());

        let s = cache.stats();
        assert_eq!(s.hits, 1);
        assert_eq!(s.misses, 2);
        assert_eq!(s.insertions, 1);
    }

    #[test]
    fn test_lru_eviction_order() {
        let cache = FrameCache::new(3);
        cache.put(&test_frame(0), None);
        cache.put(&test_frame(1), None);
        cache.put(&test_frame(2), None);

        // Touch 0 and 2 so 1 is the oldest
        drop(cache.get(0).unwrap());
        drop(cache.get(2).unwrap());

        cache.put(&test_frame(3), None);
        assert!(cache.get(1).is_none(), "oldest unpinned entry must go");
        assert!(cache.get(0).is_some());
        assert!(cache.get(2).is_some());
        assert!(cache.get(3).is_some());
        assert_eq!(cache.stats().evictions, 1);
    }

    #[test]
    fn test_pinned_entries_survive_eviction() {
        let cache = FrameCache::new(2);
        cache.put(&test_frame(0), None);
        cache.put(&test_frame(1), None);

        // Pin pts=0 (oldest); eviction must pick pts=1 instead
        let pinned = cache.get(0).unwrap();
        drop(cache.get(1).unwrap());
        cache.put(&test_frame(2), None);

        assert!(cache.get(0).is_some());
        assert!(cache.get(2).is_some());
        assert!(cache.get(1).is_none());
        drop(pinned);
    }

    #[test]
    fn test_put_fails_when_all_pinned() {
        let cache = FrameCache::new(2);
        cache.put(&test_frame(0), None);
        cache.put(&test_frame(1), None);

        let h0 = cache.get(0).unwrap();
        let h1 = cache.get(1).unwrap();
        assert!(!cache.put(&test_frame(2), None));
        assert_eq!(cache.stats().rejected, 1);

        // Releasing a pin makes room again
        drop(h0);
        assert!(cache.put(&test_frame(2), None));
        drop(h1);
    }

    #[test]
    fn test_handle_drop_releases_pin() {
        let cache = FrameCache::new(1);
        cache.put(&test_frame(0), None);
        {
            let _h = cache.get(0).unwrap();
            assert!(!cache.put(&test_frame(1), None));
        }
        assert!(cache.put(&test_frame(1), None));
    }

    #[test]
    fn test_invalidate_empties_and_bumps_generation() {
        let cache = FrameCache::new(4);
        cache.put(&test_frame(0), None);
        cache.put(&test_frame(1), None);
        assert_eq!(cache.generation(), 0);

        // An outstanding handle must stay usable across invalidate
        let held = cache.get(0).unwrap();
        cache.invalidate();
        assert_eq!(cache.generation(), 1);
        assert!(cache.get(0).is_none());
        assert!(cache.get(1).is_none());
        assert_eq!(held.frame.pts, 0);
        drop(held);

        // Fresh inserts land in the new generation
        assert!(cache.put(&test_frame(2), None));
        assert!(cache.get(2).is_some());
    }

    #[test]
    fn test_put_same_pts_refreshes() {
        let cache = FrameCache::new(2);
        cache.put(&test_frame(0), None);
        cache.put(&test_frame(0), None);
        let s = cache.stats();
        assert_eq!(s.occupied, 1);
        assert_eq!(s.evictions, 0);
    }

    #[test]
    fn test_cached_frame_is_independent_clone() {
        let cache = FrameCache::new(2);
        let original = test_frame(5);
        cache.put(&original, None);
        drop(original);
        let h = cache.get(5).unwrap();
        assert!(h.frame.is_valid());
    }
}
