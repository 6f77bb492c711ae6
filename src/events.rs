//! Pipeline diagnostics channel
//!
//! Pumps publish lifecycle and anomaly events; the host can subscribe or
//! ignore them. The channel is bounded and lossy on overflow — an
//! unobserved event stream must never stall a pump.

use crossbeam_channel::{Receiver, Sender, bounded};
use log::trace;

use crate::frame::MediaPts;

/// Capacity of the event channel; overflow drops the newest event.
const EVENT_CHANNEL_CAPACITY: usize = 256;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PipelineEvent {
    Started,
    Stopped,
    /// End of stream reached with looping enabled; playback wrapped.
    Looped,
    SeekApplied { pts: MediaPts },
    /// End of stream without looping; the decode pump parked.
    EndOfStream,
    /// A frame missed its deadline beyond the late threshold.
    FrameDropped { pts: MediaPts, late_ms: u64 },
    /// The accelerated transfer path hit its failure limit and is off
    /// for the rest of the session.
    AcceleratedPathDisabled,
    /// Consecutive decode failures crossed the configured stall limit.
    DecodeStalled { consecutive: u32 },
}

/// Sender half handed to the pumps. Cheap to clone.
#[derive(Debug, Clone)]
pub struct EventHub {
    tx: Sender<PipelineEvent>,
    rx: Receiver<PipelineEvent>,
}

impl EventHub {
    pub fn new() -> Self {
        let (tx, rx) = bounded(EVENT_CHANNEL_CAPACITY);
        Self { tx, rx }
    }

    /// Publish without blocking; dropped on overflow.
    pub fn emit(&self, event: PipelineEvent) {
        if self.tx.try_send(event.clone()).is_err() {
            trace!("event channel full, dropped {:?}", event);
        }
    }

    /// Subscribe to the event stream. Receivers share one stream (each
    /// event goes to exactly one receiver); hold a single receiver per
    /// pipeline.
    pub fn receiver(&self) -> Receiver<PipelineEvent> {
        self.rx.clone()
    }
}

impl Default for EventHub {
    fn default() -> Self {
        Self::new()
    }
}
