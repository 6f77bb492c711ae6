//! External collaborator interfaces
//!
//! The pipeline drives codecs, pixel converters, sinks and allocators but
//! implements none of them. Each is a trait seam; hosts plug in real
//! backends, tests plug in stubs.
//!
//! Blocking decoder calls must poll the interrupt flag handed over via
//! `set_interrupt` so shutdown can cut through a stalled read.

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Instant;

use crate::frame::{DecodedFrame, MediaPts, PixelBuffer, PixelLayout};

/// Stream-level metadata reported by `Decoder::open`.
#[derive(Debug, Clone, Copy)]
pub struct StreamInfo {
    pub duration_us: i64,
    pub width: u32,
    pub height: u32,
    pub layout: PixelLayout,
    pub fps: f64,
}

/// One compressed unit as read from the container, before decoding.
/// The pts (when the container provides one) drives cache lookups.
#[derive(Debug, Clone)]
pub struct CodedUnit {
    pub pts: Option<MediaPts>,
    pub data: Vec<u8>,
    pub keyframe: bool,
}

/// Outcome of reading the next unit from the container.
#[derive(Debug)]
pub enum ReadOutcome {
    Unit(CodedUnit),
    EndOfStream,
}

/// Decoded audio handed straight to the sink; audio never enters the
/// video pacing path. `host_time` is stamped by the decode pump against
/// the shared epoch.
#[derive(Debug, Clone)]
pub struct AudioBatch {
    pub pts: MediaPts,
    pub sample_rate: u32,
    pub channels: u16,
    pub samples: Arc<Vec<f32>>,
    pub host_time: Option<Instant>,
}

/// What a decode call produced.
#[derive(Debug)]
pub enum DecodeOutcome {
    Video(DecodedFrame),
    Audio(AudioBatch),
    /// The codec buffered the unit and needs more input.
    NeedsMore,
}

/// Typed decoder failure. Transient errors are skipped by the decode
/// pump; `Fatal` ends the run.
#[derive(Debug)]
pub enum DecodeError {
    /// Recoverable: corrupt unit, mid-stream hiccup. The pump skips it.
    Transient(String),
    /// The accelerated-to-host transfer failed (counts toward the
    /// circuit breaker).
    TransferFailed(String),
    /// The decoder cannot continue.
    Fatal(String),
    /// A blocking call observed the interrupt flag.
    Interrupted,
}

impl fmt::Display for DecodeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DecodeError::Transient(msg) => write!(f, "transient decode error: {}", msg),
            DecodeError::TransferFailed(msg) => write!(f, "host transfer failed: {}", msg),
            DecodeError::Fatal(msg) => write!(f, "fatal decode error: {}", msg),
            DecodeError::Interrupted => write!(f, "decoder interrupted"),
        }
    }
}

impl std::error::Error for DecodeError {}

/// Codec/container backend. One decoder instance belongs to one pipeline
/// and is driven from the decode thread only.
pub trait Decoder: Send {
    /// Open a media source and report its stream info.
    fn open(&mut self, path: &str) -> anyhow::Result<StreamInfo>;

    /// Read the next compressed unit (may block on IO).
    fn read_next_unit(&mut self) -> Result<ReadOutcome, DecodeError>;

    /// Feed one unit to the codec.
    fn decode(&mut self, unit: CodedUnit) -> Result<DecodeOutcome, DecodeError>;

    /// Move an accelerated frame's pixels into host memory. Only called
    /// for frames with `FrameOrigin::Accelerated`.
    fn transfer_to_host(&mut self, frame: DecodedFrame) -> Result<DecodedFrame, DecodeError>;

    /// Reposition the stream; the next decoded frame starts a new clock
    /// epoch.
    fn seek(&mut self, pts: MediaPts) -> Result<(), DecodeError>;

    /// Drop all buffered codec state.
    fn flush(&mut self);

    /// Install the interrupt flag polled by blocking calls.
    fn set_interrupt(&mut self, flag: Arc<AtomicBool>);
}

/// Pixel-format conversion backend.
pub trait PixelConverter: Send {
    /// Convert a frame's pixels into `target` layout, allocating through
    /// the pipeline's allocator.
    fn convert(
        &mut self,
        frame: &DecodedFrame,
        target: PixelLayout,
        allocator: &dyn FrameAllocator,
    ) -> Result<Arc<PixelBuffer>, DecodeError>;
}

/// Frame delivered to the host at its deadline.
#[derive(Debug)]
pub struct VideoDescriptor<'a> {
    pub frame: &'a DecodedFrame,
    /// The deadline this delivery was paced against.
    pub deadline: Instant,
    /// True when the payload is the decoder's own storage in the sink's
    /// requested layout (no copy happened on the way here).
    pub zero_copy: bool,
}

/// Receives decoded output. Fire-and-forget from the pipeline's side:
/// delivery never reports errors back.
pub trait FrameSink: Send + Sync {
    fn deliver_video(&self, video: &VideoDescriptor<'_>);
    fn deliver_audio(&self, audio: &AudioBatch);
}

/// Pixel memory provider with observable balance.
pub trait FrameAllocator: Send + Sync {
    fn allocate(&self, len: usize) -> anyhow::Result<PixelBuffer>;

    /// Allocations currently alive. Flush/eviction tests assert this
    /// returns to its pre-run value.
    fn outstanding(&self) -> usize;
}

/// Default allocator: plain heap buffers with an outstanding count.
#[derive(Debug, Default)]
pub struct HeapAllocator {
    outstanding: Arc<AtomicUsize>,
}

impl HeapAllocator {
    pub fn new() -> Self {
        Self::default()
    }
}

impl FrameAllocator for HeapAllocator {
    fn allocate(&self, len: usize) -> anyhow::Result<PixelBuffer> {
        anyhow::ensure!(len > 0, "zero-length pixel allocation");
        let token = crate::frame::AllocToken::new(Arc::clone(&self.outstanding));
        Ok(PixelBuffer::tracked(vec![0u8; len], token))
    }

    fn outstanding(&self) -> usize {
        self.outstanding.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_heap_allocator_balance() {
        let alloc = HeapAllocator::new();
        assert_eq!(alloc.outstanding(), 0);
        let a = alloc.allocate(16).unwrap();
        let b = alloc.allocate(32).unwrap();
        assert_eq!(alloc.outstanding(), 2);
        drop(a);
        assert_eq!(alloc.outstanding(), 1);
        drop(b);
        assert_eq!(alloc.outstanding(), 0);
    }

    #[test]
    fn test_heap_allocator_rejects_empty() {
        let alloc = HeapAllocator::new();
        assert!(alloc.allocate(0).is_err());
        assert_eq!(alloc.outstanding(), 0);
    }

    #[test]
    fn test_decode_error_display() {
        let e = DecodeError::Transient("bad unit".into());
        assert_eq!(e.to_string(), "transient decode error: bad unit");
        assert_eq!(DecodeError::Interrupted.to_string(), "decoder interrupted");
    }
}
