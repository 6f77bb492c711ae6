//! Decoded frame model: pixel layouts, payload variants, pacing wrapper
//!
//! **Why**: the decode and display pumps exchange frames through a bounded
//! queue and a pts-keyed cache. Cloning must be cheap (reference-counted
//! pixel storage, the `av_frame_clone` model) so a cached frame and an
//! in-flight frame can share planes without copying.
//!
//! **Used by**: buffer (queue payload), cache (stored entries), decode pump
//! (producer), display pump (consumer), sink descriptors.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Instant;

use serde::{Deserialize, Serialize};

/// Media timestamp in microseconds.
pub type MediaPts = i64;

/// Pixel layout tag. Display logic and converters branch on this,
/// never on plane counts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PixelLayout {
    /// Packed 8-bit BGRA, single plane.
    Bgra,
    /// 8-bit luma plane + interleaved half-res chroma plane.
    Nv12,
    /// 10-bit (in 16-bit containers) luma + interleaved chroma.
    P010,
    /// Planar 8-bit Y, U, V with half-res chroma.
    Yuv420,
}

impl PixelLayout {
    /// Number of planes this layout carries.
    pub fn plane_count(&self) -> usize {
        match self {
            PixelLayout::Bgra => 1,
            PixelLayout::Nv12 | PixelLayout::P010 => 2,
            PixelLayout::Yuv420 => 3,
        }
    }

    /// Total payload size in bytes for a frame of the given dimensions.
    pub fn frame_bytes(&self, width: u32, height: u32) -> usize {
        let px = width as usize * height as usize;
        match self {
            PixelLayout::Bgra => px * 4,
            PixelLayout::Nv12 | PixelLayout::Yuv420 => px * 3 / 2,
            PixelLayout::P010 => px * 3,
        }
    }
}

/// Where the frame was produced.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameOrigin {
    /// CPU decoder output, planes live in host memory.
    Software,
    /// Hardware decoder output; must pass through `transfer_to_host`
    /// before the pixels are readable.
    Accelerated,
}

/// Token tying a pixel allocation to its allocator's outstanding count.
///
/// Dropping the token decrements the count, so allocator balance is
/// observable after flushes and cache evictions.
#[derive(Debug)]
pub struct AllocToken {
    counter: Arc<AtomicUsize>,
}

impl AllocToken {
    pub fn new(counter: Arc<AtomicUsize>) -> Self {
        counter.fetch_add(1, Ordering::Relaxed);
        Self { counter }
    }
}

impl Drop for AllocToken {
    fn drop(&mut self) {
        self.counter.fetch_sub(1, Ordering::Relaxed);
    }
}

/// Contiguous pixel storage, optionally tracked by an allocator.
#[derive(Debug)]
pub struct PixelBuffer {
    pub data: Vec<u8>,
    token: Option<AllocToken>,
}

impl PixelBuffer {
    pub fn untracked(data: Vec<u8>) -> Self {
        Self { data, token: None }
    }

    pub fn tracked(data: Vec<u8>, token: AllocToken) -> Self {
        Self { data, token: Some(token) }
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn is_tracked(&self) -> bool {
        self.token.is_some()
    }
}

/// One image plane: pixel rows at a fixed stride.
#[derive(Debug)]
pub struct Plane {
    pub buf: PixelBuffer,
    /// Bytes per row. May exceed `width * bytes_per_px` (decoder padding).
    pub stride: usize,
}

/// The full plane set of a decoded frame.
#[derive(Debug)]
pub struct Planes {
    pub layout: PixelLayout,
    pub width: u32,
    pub height: u32,
    pub planes: Vec<Plane>,
}

impl Planes {
    /// A plane set is usable when it carries the layout's plane count and
    /// no plane is empty.
    pub fn is_valid(&self) -> bool {
        self.planes.len() == self.layout.plane_count()
            && self.planes.iter().all(|p| !p.buf.is_empty())
    }
}

/// Pixel payload of a decoded frame. The display pump selects the delivery
/// path by matching on this tag only.
#[derive(Debug, Clone)]
pub enum FramePayload {
    /// Planes borrowed from decoder-owned storage; eligible for zero-copy
    /// delivery when the sink accepts the native layout.
    ZeroCopyRef(Arc<Planes>),
    /// Planes owned by the pipeline (e.g. after an accelerated-to-host
    /// transfer).
    OwnedPlanes(Arc<Planes>),
    /// Packed output of a pixel conversion, single buffer.
    ConvertedPixels(Arc<PixelBuffer>),
}

impl FramePayload {
    /// Malformed payloads (empty planes, plane count mismatch) are warned
    /// about and discarded by the consumer instead of reaching the sink.
    pub fn is_valid(&self) -> bool {
        match self {
            FramePayload::ZeroCopyRef(p) | FramePayload::OwnedPlanes(p) => p.is_valid(),
            FramePayload::ConvertedPixels(b) => !b.is_empty(),
        }
    }

    /// Approximate payload size in bytes (for stats logging).
    pub fn byte_size(&self) -> usize {
        match self {
            FramePayload::ZeroCopyRef(p) | FramePayload::OwnedPlanes(p) => {
                p.planes.iter().map(|pl| pl.buf.len()).sum()
            }
            FramePayload::ConvertedPixels(b) => b.len(),
        }
    }
}

/// A decoded frame. `Clone` creates a new reference to the same pixel
/// storage; pixel bytes are never duplicated by cloning.
#[derive(Debug, Clone)]
pub struct DecodedFrame {
    pub pts: MediaPts,
    pub width: u32,
    pub height: u32,
    pub layout: PixelLayout,
    pub origin: FrameOrigin,
    pub payload: FramePayload,
}

impl DecodedFrame {
    pub fn is_valid(&self) -> bool {
        self.payload.is_valid()
    }
}

/// What actually travels through the frame queue: a frame plus the
/// wall-clock instant it should reach the sink.
#[derive(Debug, Clone)]
pub struct PacedFrame {
    pub frame: DecodedFrame,
    pub deadline: Instant,
}

#[cfg(test)]
pub(crate) fn test_frame(pts: MediaPts) -> DecodedFrame {
    let planes = Planes {
        layout: PixelLayout::Bgra,
        width: 4,
        height: 4,
        planes: vec![Plane { buf: PixelBuffer::untracked(vec![0u8; 64]), stride: 16 }],
    };
    DecodedFrame {
        pts,
        width: 4,
        height: 4,
        layout: PixelLayout::Bgra,
        origin: FrameOrigin::Software,
        payload: FramePayload::OwnedPlanes(Arc::new(planes)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn untracked_plane(len: usize, stride: usize) -> Plane {
        Plane { buf: PixelBuffer::untracked(vec![0u8; len]), stride }
    }

    #[test]
    fn test_layout_plane_counts() {
        assert_eq!(PixelLayout::Bgra.plane_count(), 1);
        assert_eq!(PixelLayout::Nv12.plane_count(), 2);
        assert_eq!(PixelLayout::P010.plane_count(), 2);
        assert_eq!(PixelLayout::Yuv420.plane_count(), 3);
    }

    #[test]
    fn test_frame_bytes() {
        assert_eq!(PixelLayout::Bgra.frame_bytes(100, 50), 100 * 50 * 4);
        assert_eq!(PixelLayout::Nv12.frame_bytes(100, 50), 100 * 50 * 3 / 2);
    }

    #[test]
    fn test_clone_shares_pixels() {
        let frame = test_frame(0);
        let copy = frame.clone();
        let (a, b) = match (&frame.payload, &copy.payload) {
            (FramePayload::OwnedPlanes(a), FramePayload::OwnedPlanes(b)) => (a, b),
            _ => panic!("unexpected payload variant"),
        };
        assert!(Arc::ptr_eq(a, b));
    }

    #[test]
    fn test_payload_validity() {
        let frame = test_frame(0);
        assert!(frame.is_valid());

        // Plane count mismatch for the layout
        let bad = Planes {
            layout: PixelLayout::Yuv420,
            width: 4,
            height: 4,
            planes: vec![untracked_plane(16, 4)],
        };
        assert!(!FramePayload::OwnedPlanes(Arc::new(bad)).is_valid());

        let empty = FramePayload::ConvertedPixels(Arc::new(PixelBuffer::untracked(vec![])));
        assert!(!empty.is_valid());
    }

    #[test]
    fn test_alloc_token_balance() {
        let counter = Arc::new(AtomicUsize::new(0));
        {
            let buf = PixelBuffer::tracked(vec![0u8; 8], AllocToken::new(Arc::clone(&counter)));
            assert_eq!(counter.load(Ordering::Relaxed), 1);
            assert!(buf.is_tracked());
        }
        assert_eq!(counter.load(Ordering::Relaxed), 0);
    }
}
