//! Display pump: consumer side of the pipeline
//!
//! Runs on its own thread. Takes each paced frame from the queue, waits
//! for its wall-clock deadline (coarse sleeps far out, a yield-spin for
//! the last few milliseconds) and hands it to the sink. Frames that are
//! already late beyond the drop threshold are discarded, never delivered.
//!
//! Nothing here sleeps while holding a lock, and a flush request is
//! honored mid-pace: the frame in hand is discarded so no pre-flush frame
//! crosses a discontinuity.

use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::thread;
use std::time::{Duration, Instant};

use log::{debug, info, trace, warn};

use crate::events::PipelineEvent;
use crate::frame::{FramePayload, PacedFrame};
use crate::media::VideoDescriptor;
use crate::pipeline::PipelineShared;

/// Poll interval while the queue is empty.
const EMPTY_POLL: Duration = Duration::from_millis(2);
/// Poll interval while parked in the flush handshake.
const QUIESCE_POLL: Duration = Duration::from_millis(1);

enum PaceOutcome {
    Emit,
    Dropped,
    Discarded,
}

pub(crate) fn run(shared: Arc<PipelineShared>) {
    info!("display pump started");
    loop {
        if shared.stop.load(Ordering::Acquire) {
            break;
        }
        if shared.flush_pending.load(Ordering::Acquire) {
            quiesce(&shared);
            continue;
        }
        if shared.paused.load(Ordering::Acquire) {
            thread::sleep(shared.config.idle_poll());
            continue;
        }
        let Some(paced) = shared.queue.try_dequeue() else {
            thread::sleep(EMPTY_POLL);
            continue;
        };
        match pace(&shared, &paced) {
            PaceOutcome::Emit => emit(&shared, paced),
            PaceOutcome::Dropped | PaceOutcome::Discarded => {}
        }
    }
    info!("display pump stopped");
}

/// Park until the producer finishes its flush. The producer waits for
/// `consumer_idle` before touching the queue, so an in-hand frame has
/// already been discarded by the time we get here.
fn quiesce(shared: &PipelineShared) {
    trace!("display pump quiescing for flush");
    shared.consumer_idle.store(true, Ordering::Release);
    while shared.flush_pending.load(Ordering::Acquire)
        && !shared.stop.load(Ordering::Acquire)
    {
        thread::sleep(QUIESCE_POLL);
    }
    shared.consumer_idle.store(false, Ordering::Release);
}

/// Wait out the frame's deadline. Sleep granularity degrades as the
/// deadline nears: coarse steps far out, finer steps inside the fine
/// window, then a yield-spin for the last moments. Returns what to do
/// with the frame.
fn pace(shared: &PipelineShared, paced: &PacedFrame) -> PaceOutcome {
    let emit_tolerance = shared.config.emit_tolerance();
    let fine_window = Duration::from_millis(shared.config.fine_sleep_window_ms);
    let coarse_sleep = Duration::from_millis(shared.config.coarse_sleep_ms);
    let fine_sleep = Duration::from_millis(shared.config.fine_sleep_ms);

    loop {
        if shared.stop.load(Ordering::Acquire) {
            return PaceOutcome::Discarded;
        }
        if shared.flush_pending.load(Ordering::Acquire) {
            // Discard the in-hand frame before acking the flush.
            trace!("flush during pacing, frame pts={}us discarded", paced.frame.pts);
            quiesce(shared);
            return PaceOutcome::Discarded;
        }

        let now = Instant::now();
        if now >= paced.deadline {
            let late = now - paced.deadline;
            if late > shared.config.late_drop_threshold() {
                let late_ms = late.as_millis() as u64;
                debug!("frame pts={}us late by {}ms, dropped", paced.frame.pts, late_ms);
                shared.stats.frames_dropped.fetch_add(1, Ordering::Relaxed);
                shared.events.emit(PipelineEvent::FrameDropped {
                    pts: paced.frame.pts,
                    late_ms,
                });
                return PaceOutcome::Dropped;
            }
            // Late but within threshold: emit immediately.
            return PaceOutcome::Emit;
        }

        let remaining = paced.deadline - now;
        if remaining <= emit_tolerance {
            return PaceOutcome::Emit;
        }
        if remaining > fine_window {
            thread::sleep(coarse_sleep);
        } else if remaining > fine_sleep * 2 {
            thread::sleep(fine_sleep);
        } else {
            // Final approach: burn the last moments yielding, not sleeping.
            thread::yield_now();
        }
    }
}

fn emit(shared: &PipelineShared, paced: PacedFrame) {
    if !paced.frame.is_valid() {
        warn!("malformed payload at pts={}us, discarded", paced.frame.pts);
        return;
    }

    let sink = shared.sink.lock().unwrap().clone();
    if let Some(sink) = sink {
        let native_layout_ok = match *shared.output_layout.lock().unwrap() {
            Some(wanted) => wanted == paced.frame.layout,
            None => true,
        };
        let zero_copy =
            native_layout_ok && matches!(paced.frame.payload, FramePayload::ZeroCopyRef(_));
        sink.deliver_video(&VideoDescriptor {
            frame: &paced.frame,
            deadline: paced.deadline,
            zero_copy,
        });
    } else {
        trace!("no sink installed, frame pts={}us discarded", paced.frame.pts);
    }

    // Position advances whether or not a sink consumed the frame.
    shared.clock.update(paced.frame.pts);
    shared
        .position_us
        .store(paced.frame.pts, Ordering::Release);
    shared.stats.frames_displayed.fetch_add(1, Ordering::Relaxed);
}
