//! Decode pump: producer side of the pipeline
//!
//! Runs on its own thread. Reads compressed units, probes the frame cache
//! by pts, decodes on a miss, moves accelerated frames into host memory,
//! stamps every frame with a wall-clock deadline and pushes it into the
//! bounded queue. Backpressure from a full queue holds the producer;
//! frames are never dropped on this side.
//!
//! Discontinuities (first frame, seek, loop wrap) reset the playback
//! clock epoch. Seeks quiesce the display pump first so no pre-seek frame
//! can be delivered after the flush.

use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::thread;
use std::time::{Duration, Instant};

use log::{debug, error, info, trace, warn};

use crate::frame::{DecodedFrame, FrameOrigin, FramePayload, MediaPts, PacedFrame, PixelBuffer};
use crate::media::{AudioBatch, CodedUnit, DecodeError, DecodeOutcome, Decoder, FrameAllocator, PixelConverter, ReadOutcome};
use crate::pipeline::PipelineShared;
use crate::events::PipelineEvent;

/// Back-off after a failed read/decode before trying the next unit.
const ERROR_RETRY_SLEEP: Duration = Duration::from_millis(10);
/// Settle time after a loop wrap before decoding resumes.
const LOOP_SETTLE_SLEEP: Duration = Duration::from_millis(30);
/// How long the producer waits for the display pump to acknowledge a
/// flush before proceeding anyway.
const QUIESCE_TIMEOUT: Duration = Duration::from_millis(500);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PumpState {
    /// Parked: end of stream without looping, waiting for a seek or stop.
    Idle,
    /// Normal production.
    Playing,
    /// A seek was observed and is being applied.
    SeekRequested,
    /// Stop observed; final cleanup.
    Draining,
}

pub(crate) struct DecodePump {
    shared: Arc<PipelineShared>,
    decoder: Box<dyn Decoder>,
    converter: Option<Box<dyn PixelConverter>>,
    allocator: Arc<dyn FrameAllocator>,
    state: PumpState,
    /// Next accepted frame starts a new clock epoch.
    awaiting_first_frame: bool,
    consecutive_errors: u32,
    accel_failures: u32,
    /// First audio pts mapped onto a host instant; later batches are
    /// stamped relative to it.
    audio_baseline: Option<(MediaPts, Instant)>,
}

impl DecodePump {
    pub fn new(
        shared: Arc<PipelineShared>,
        decoder: Box<dyn Decoder>,
        converter: Option<Box<dyn PixelConverter>>,
        allocator: Arc<dyn FrameAllocator>,
    ) -> Self {
        Self {
            shared,
            decoder,
            converter,
            allocator,
            state: PumpState::Playing,
            awaiting_first_frame: true,
            consecutive_errors: 0,
            accel_failures: 0,
            audio_baseline: None,
        }
    }

    fn set_state(&mut self, state: PumpState) {
        if self.state != state {
            trace!("decode pump: {:?} -> {:?}", self.state, state);
            self.state = state;
        }
    }

    pub fn run(mut self) {
        info!("decode pump started");
        loop {
            if self.shared.stop.load(Ordering::Acquire) {
                self.set_state(PumpState::Draining);
                break;
            }
            if self.shared.paused.load(Ordering::Acquire) {
                thread::sleep(self.shared.config.idle_poll());
                continue;
            }
            if self.shared.seek_pending.load(Ordering::Acquire) {
                self.apply_seek();
                continue;
            }
            if self.state == PumpState::Idle {
                thread::sleep(self.shared.config.idle_poll());
                continue;
            }

            match self.decoder.read_next_unit() {
                Ok(ReadOutcome::Unit(unit)) => self.process_unit(unit),
                Ok(ReadOutcome::EndOfStream) => self.handle_eof(),
                Err(DecodeError::Interrupted) => {
                    // Stop or seek will be observed at the loop top.
                    trace!("read interrupted");
                }
                Err(e) => {
                    warn!("read failed: {}", e);
                    self.note_error();
                    thread::sleep(ERROR_RETRY_SLEEP);
                }
            }
        }
        self.decoder.flush();
        info!("decode pump stopped");
    }

    fn process_unit(&mut self, unit: CodedUnit) {
        // Cache probe first: a hit skips the codec entirely.
        if let (Some(pts), Some(cache)) = (unit.pts, self.shared.cache.as_ref()) {
            if let Some(hit) = cache.get(pts) {
                self.shared.stats.cache_bypass_decodes.fetch_add(1, Ordering::Relaxed);
                let frame = hit.frame.clone();
                let converted = hit.converted.clone();
                drop(hit); // release the pin; we hold our own references
                self.deliver(frame, converted, true);
                return;
            }
        }

        match self.decoder.decode(unit) {
            Ok(DecodeOutcome::Video(frame)) => {
                self.consecutive_errors = 0;
                if let Some(frame) = self.resolve_origin(frame) {
                    self.deliver(frame, None, false);
                }
            }
            Ok(DecodeOutcome::Audio(batch)) => self.deliver_audio(batch),
            Ok(DecodeOutcome::NeedsMore) => {}
            Err(DecodeError::Interrupted) => {}
            Err(DecodeError::Fatal(msg)) => {
                error!("fatal decode error: {}", msg);
                self.note_error();
                thread::sleep(ERROR_RETRY_SLEEP);
            }
            Err(e) => {
                warn!("decode failed, skipping unit: {}", e);
                self.note_error();
                thread::sleep(ERROR_RETRY_SLEEP);
            }
        }
    }

    /// Accelerated frames must be moved into host memory before anything
    /// downstream can touch their pixels. Repeated transfer failures trip
    /// a circuit breaker that disables the accelerated path for the rest
    /// of the session.
    fn resolve_origin(&mut self, frame: DecodedFrame) -> Option<DecodedFrame> {
        if frame.origin != FrameOrigin::Accelerated {
            return Some(frame);
        }
        if self.shared.accel_disabled.load(Ordering::Acquire) {
            // The decoder should have fallen back to software by now;
            // a stray accelerated frame is unreadable here.
            warn!("accelerated frame after path disable, dropped");
            return None;
        }
        match self.decoder.transfer_to_host(frame) {
            Ok(host_frame) => {
                self.accel_failures = 0;
                Some(host_frame)
            }
            Err(e) => {
                self.accel_failures += 1;
                self.shared
                    .stats
                    .accel_transfer_failures
                    .fetch_add(1, Ordering::Relaxed);
                warn!(
                    "host transfer failed ({}/{}): {}",
                    self.accel_failures, self.shared.config.accel_failure_limit, e
                );
                if self.accel_failures >= self.shared.config.accel_failure_limit {
                    self.shared.accel_disabled.store(true, Ordering::Release);
                    self.shared.events.emit(PipelineEvent::AcceleratedPathDisabled);
                    warn!("accelerated path disabled for this session");
                }
                None
            }
        }
    }

    /// Deadline-stamp, convert if the sink's layout requires it, feed the
    /// cache, and push into the queue (blocking on backpressure).
    fn deliver(
        &mut self,
        frame: DecodedFrame,
        cached_converted: Option<Arc<PixelBuffer>>,
        from_cache: bool,
    ) {
        if self.awaiting_first_frame {
            let origin = self
                .shared
                .take_epoch_origin()
                .unwrap_or_else(Instant::now);
            self.shared.clock.reset_at(origin, frame.pts);
            self.awaiting_first_frame = false;
            debug!("clock anchored at pts={}us", frame.pts);
        }
        let deadline = self.shared.clock.deadline_for(frame.pts);

        let target = *self.shared.output_layout.lock().unwrap();
        let mut converted = cached_converted;
        if converted.is_none()
            && let Some(target) = target
            && target != frame.layout
        {
            let Some(converter) = self.converter.as_mut() else {
                warn!(
                    "sink wants {:?} but no converter installed, frame dropped",
                    target
                );
                return;
            };
            match converter.convert(&frame, target, self.allocator.as_ref()) {
                Ok(buf) => converted = Some(buf),
                Err(e) => {
                    warn!("pixel conversion failed, frame dropped: {}", e);
                    self.note_error();
                    return;
                }
            }
        }

        if !from_cache {
            if let Some(cache) = self.shared.cache.as_ref() {
                let cached = if self.shared.config.cache_converted {
                    converted.clone()
                } else {
                    None
                };
                cache.put(&frame, cached);
            }
            self.shared.stats.frames_decoded.fetch_add(1, Ordering::Relaxed);
        }

        let out = match converted {
            Some(buf) => DecodedFrame {
                pts: frame.pts,
                width: frame.width,
                height: frame.height,
                layout: target.unwrap_or(frame.layout),
                origin: frame.origin,
                payload: FramePayload::ConvertedPixels(buf),
            },
            None => frame,
        };

        let paced = PacedFrame { frame: out, deadline };
        if self
            .shared
            .queue
            .enqueue_blocking(paced, &self.shared.stop)
            .is_err()
        {
            trace!("enqueue abandoned, stop raised");
        }
    }

    /// Audio bypasses pacing: stamp a host time against the first-audio
    /// baseline and hand it straight to the sink.
    fn deliver_audio(&mut self, mut batch: AudioBatch) {
        let (base_pts, base_instant) = *self
            .audio_baseline
            .get_or_insert_with(|| (batch.pts, Instant::now()));
        let offset_us = batch.pts.saturating_sub(base_pts);
        let rate = self.shared.clock.rate();
        let host_time = if offset_us > 0 {
            base_instant + Duration::from_micros((offset_us as f64 / rate) as u64)
        } else {
            base_instant
        };
        batch.host_time = Some(host_time);

        let sink = self.shared.sink.lock().unwrap().clone();
        if let Some(sink) = sink {
            sink.deliver_audio(&batch);
            self.shared.stats.audio_batches.fetch_add(1, Ordering::Relaxed);
        }
    }

    fn handle_eof(&mut self) {
        if self.shared.looping.load(Ordering::Acquire) {
            debug!("end of stream, looping");
            self.discontinuity(0);
            self.shared.events.emit(PipelineEvent::Looped);
            thread::sleep(LOOP_SETTLE_SLEEP);
        } else {
            info!("end of stream");
            self.shared.events.emit(PipelineEvent::EndOfStream);
            self.set_state(PumpState::Idle);
        }
    }

    fn apply_seek(&mut self) {
        self.set_state(PumpState::SeekRequested);
        let target = self.shared.seek_target.lock().unwrap().take();
        self.shared.seek_pending.store(false, Ordering::Release);
        let Some(target) = target else {
            self.set_state(PumpState::Playing);
            return;
        };
        debug!("applying seek to {}us", target);
        self.discontinuity(target);
        self.shared.events.emit(PipelineEvent::SeekApplied { pts: target });
        self.set_state(PumpState::Playing);
    }

    /// Shared seek/loop sequence: quiesce the consumer, flush queue and
    /// decoder, reposition, and arm a fresh clock epoch. Ordering matters:
    /// the consumer must be parked before the queue flush so no pre-flush
    /// frame is emitted afterwards.
    fn discontinuity(&mut self, target: MediaPts) {
        self.shared.flush_pending.store(true, Ordering::Release);
        self.shared.queue.wake_all();
        let deadline = Instant::now() + QUIESCE_TIMEOUT;
        while !self.shared.consumer_idle.load(Ordering::Acquire)
            && !self.shared.stop.load(Ordering::Acquire)
        {
            if Instant::now() >= deadline {
                warn!("display pump did not quiesce in time");
                break;
            }
            thread::sleep(Duration::from_millis(1));
        }

        self.shared.queue.flush();
        self.decoder.flush();
        if let Err(e) = self.decoder.seek(target) {
            warn!("seek to {}us failed: {}", target, e);
        }
        self.awaiting_first_frame = true;
        self.audio_baseline = None;
        self.shared.flush_pending.store(false, Ordering::Release);
    }

    fn note_error(&mut self) {
        self.shared.stats.decode_errors.fetch_add(1, Ordering::Relaxed);
        self.consecutive_errors += 1;
        if let Some(limit) = self.shared.config.stall_pause_limit
            && self.consecutive_errors >= limit
        {
            warn!(
                "{} consecutive decode failures, pausing playback",
                self.consecutive_errors
            );
            self.shared.paused.store(true, Ordering::Release);
            self.shared.events.emit(PipelineEvent::DecodeStalled {
                consecutive: self.consecutive_errors,
            });
            self.consecutive_errors = 0;
        }
    }
}
