//! framepump — clock-paced media playback pipeline
//!
//! A decode pump thread turns compressed media into decoded frames,
//! stamps each with a wall-clock deadline, and pushes it through a
//! bounded queue. A display pump thread paces every frame to its
//! deadline and hands it to the host's sink. A pts-keyed cache lets
//! looped or revisited content skip the codec. Codecs, pixel
//! converters, sinks and allocators are all trait seams supplied by
//! the host.
//!
//! ```no_run
//! use std::sync::Arc;
//! use framepump::{Pipeline, PipelineConfig};
//! # fn sink() -> Arc<dyn framepump::FrameSink> { unimplemented!() }
//! # fn decoder() -> Box<dyn framepump::Decoder> { unimplemented!() }
//!
//! let pipeline = Pipeline::new(PipelineConfig::default())?;
//! pipeline.set_sink(sink());
//! if pipeline.initialize(decoder(), "clip.mp4") {
//!     pipeline.play();
//! }
//! # Ok::<(), anyhow::Error>(())
//! ```

pub mod buffer;
pub mod cache;
pub mod clock;
pub mod config;
pub mod events;
pub mod frame;
pub mod media;
pub mod pipeline;
pub mod stats;

mod decode;
mod display;

pub use buffer::{BoundedQueue, QueueBacking, QueueCounters, build_queue};
pub use cache::{CacheHandle, CacheStats, FrameCache};
pub use clock::{PlaybackClock, SharedEpoch};
pub use config::PipelineConfig;
pub use events::PipelineEvent;
pub use frame::{
    DecodedFrame, FrameOrigin, FramePayload, MediaPts, PacedFrame, PixelBuffer, PixelLayout,
    Plane, Planes,
};
pub use media::{
    AudioBatch, CodedUnit, DecodeError, DecodeOutcome, Decoder, FrameAllocator, FrameSink,
    HeapAllocator, PixelConverter, ReadOutcome, StreamInfo, VideoDescriptor,
};
pub use pipeline::Pipeline;
pub use stats::{PipelineStats, StatsSnapshot};
