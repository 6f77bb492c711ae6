//! Pipeline controller: lifecycle, thread ownership, host-facing API
//!
//! Owns the two pump threads and the state they share. The controller
//! never touches frames itself; it signals intent (play, pause, seek,
//! stop) through shared flags and lets the pumps act on them at safe
//! points in their loops.
//!
//! Shutdown discipline: raise the stop flag, raise the decoder interrupt,
//! wake every blocked wait, then join with an escalating poll — and join
//! unconditionally at the end. A pump thread is never abandoned.

use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use crossbeam_channel::Receiver;
use log::{debug, error, info, trace, warn};

use crate::buffer::{BoundedQueue, build_queue};
use crate::cache::FrameCache;
use crate::clock::{PlaybackClock, SharedEpoch};
use crate::config::PipelineConfig;
use crate::decode::DecodePump;
use crate::display;
use crate::events::{EventHub, PipelineEvent};
use crate::frame::{MediaPts, PacedFrame, PixelLayout};
use crate::media::{Decoder, FrameAllocator, FrameSink, HeapAllocator, PixelConverter, StreamInfo};
use crate::stats::{PipelineStats, StatsSnapshot};

/// State shared between the controller and both pump threads.
pub(crate) struct PipelineShared {
    pub(crate) config: PipelineConfig,
    pub(crate) queue: Arc<dyn BoundedQueue<PacedFrame>>,
    pub(crate) cache: Option<Arc<FrameCache>>,
    pub(crate) clock: Arc<PlaybackClock>,
    pub(crate) stats: Arc<PipelineStats>,
    pub(crate) events: EventHub,
    pub(crate) sink: Mutex<Option<Arc<dyn FrameSink>>>,

    /// Single stop flag observed by both pumps and every blocking wait.
    pub(crate) stop: AtomicBool,
    pub(crate) paused: AtomicBool,
    /// Raised together with stop; polled by blocking decoder calls.
    pub(crate) interrupt: Arc<AtomicBool>,

    pub(crate) seek_target: Mutex<Option<MediaPts>>,
    pub(crate) seek_pending: AtomicBool,

    /// Producer-driven flush handshake: producer raises, consumer acks
    /// via `consumer_idle`, producer clears after flushing.
    pub(crate) flush_pending: AtomicBool,
    pub(crate) consumer_idle: AtomicBool,

    pub(crate) output_layout: Mutex<Option<PixelLayout>>,
    pub(crate) accel_disabled: AtomicBool,
    pub(crate) looping: AtomicBool,

    pub(crate) position_us: AtomicI64,
    pub(crate) duration_us: AtomicI64,

    /// Claimed shared-epoch origin for the first clock anchor, if the
    /// host started playback with `play_with_epoch`.
    epoch_origin: Mutex<Option<Instant>>,
}

impl PipelineShared {
    fn new(config: PipelineConfig) -> Self {
        let queue = build_queue(config.queue_backing, config.queue_capacity);
        let cache = if config.cache_enabled {
            Some(Arc::new(FrameCache::new(config.cache_capacity)))
        } else {
            None
        };
        let clock = Arc::new(PlaybackClock::new(config.playback_rate));
        let looping = config.looping;
        Self {
            config,
            queue,
            cache,
            clock,
            stats: Arc::new(PipelineStats::new()),
            events: EventHub::new(),
            sink: Mutex::new(None),
            stop: AtomicBool::new(false),
            paused: AtomicBool::new(false),
            interrupt: Arc::new(AtomicBool::new(false)),
            seek_target: Mutex::new(None),
            seek_pending: AtomicBool::new(false),
            flush_pending: AtomicBool::new(false),
            consumer_idle: AtomicBool::new(false),
            output_layout: Mutex::new(None),
            accel_disabled: AtomicBool::new(false),
            looping: AtomicBool::new(looping),
            position_us: AtomicI64::new(0),
            duration_us: AtomicI64::new(0),
            epoch_origin: Mutex::new(None),
        }
    }

    pub(crate) fn take_epoch_origin(&self) -> Option<Instant> {
        self.epoch_origin.lock().unwrap().take()
    }
}

#[derive(Default)]
struct PumpHandles {
    decode: Option<thread::JoinHandle<()>>,
    display: Option<thread::JoinHandle<()>>,
}

#[derive(Debug, Clone, Copy)]
struct PauseSnapshot {
    at: Instant,
    position: MediaPts,
}

/// The playback pipeline. One media source, two pump threads, one sink.
///
/// Lifecycle: `new` -> `set_sink` -> `initialize` -> `play` ... `stop`.
/// After `stop` the decoder is gone; `initialize` again before replaying.
pub struct Pipeline {
    shared: Arc<PipelineShared>,
    allocator: Arc<dyn FrameAllocator>,
    decoder_slot: Mutex<Option<Box<dyn Decoder>>>,
    converter_slot: Mutex<Option<Box<dyn PixelConverter>>>,
    handles: Arc<Mutex<PumpHandles>>,
    stream_info: Mutex<Option<StreamInfo>>,
    pause_snapshot: Mutex<Option<PauseSnapshot>>,
    release_cancel: Arc<AtomicBool>,
    release_timer: Mutex<Option<thread::JoinHandle<()>>>,
}

impl Pipeline {
    pub fn new(config: PipelineConfig) -> anyhow::Result<Self> {
        config.validate()?;
        Ok(Self {
            shared: Arc::new(PipelineShared::new(config)),
            allocator: Arc::new(HeapAllocator::new()),
            decoder_slot: Mutex::new(None),
            converter_slot: Mutex::new(None),
            handles: Arc::new(Mutex::new(PumpHandles::default())),
            stream_info: Mutex::new(None),
            pause_snapshot: Mutex::new(None),
            release_cancel: Arc::new(AtomicBool::new(false)),
            release_timer: Mutex::new(None),
        })
    }

    /// Replace the default heap allocator (e.g. with a pooled one).
    pub fn set_allocator(&mut self, allocator: Arc<dyn FrameAllocator>) {
        self.allocator = allocator;
    }

    pub fn set_sink(&self, sink: Arc<dyn FrameSink>) {
        *self.shared.sink.lock().unwrap() = Some(sink);
    }

    pub fn set_converter(&self, converter: Box<dyn PixelConverter>) {
        *self.converter_slot.lock().unwrap() = Some(converter);
    }

    /// Hint the layout the sink wants delivered. Frames already in that
    /// layout stay zero-copy eligible; others go through the converter.
    pub fn set_output_format(&self, layout: PixelLayout) {
        *self.shared.output_layout.lock().unwrap() = Some(layout);
    }

    pub fn set_looping(&self, looping: bool) {
        self.shared.looping.store(looping, Ordering::Release);
    }

    /// Open the media source. Returns false on failure and leaves the
    /// pipeline exactly as it was — only a fully opened stream
    /// initializes anything.
    pub fn initialize(&self, mut decoder: Box<dyn Decoder>, path: &str) -> bool {
        decoder.set_interrupt(Arc::clone(&self.shared.interrupt));
        match decoder.open(path) {
            Ok(stream) => {
                info!(
                    "initialized {}: {}x{} {:?} {:.2}fps, {}us",
                    path, stream.width, stream.height, stream.layout, stream.fps, stream.duration_us
                );
                self.shared.duration_us.store(stream.duration_us, Ordering::Release);
                *self.stream_info.lock().unwrap() = Some(stream);
                *self.decoder_slot.lock().unwrap() = Some(decoder);
                true
            }
            Err(e) => {
                error!("failed to open {}: {:#}", path, e);
                false
            }
        }
    }

    /// Start (or unpause) playback.
    pub fn play(&self) {
        self.start(None);
    }

    /// Start playback anchored to a shared timing origin, claiming it if
    /// this pipeline is first.
    pub fn play_with_epoch(&self, epoch: &SharedEpoch) {
        self.start(Some(epoch.claim()));
    }

    fn start(&self, origin: Option<Instant>) {
        self.cancel_release();
        self.pause_snapshot.lock().unwrap().take();

        if self.threads_running() {
            trace!("play: pumps already running, unpausing");
            self.shared.paused.store(false, Ordering::Release);
            return;
        }

        let decoder = self.decoder_slot.lock().unwrap().take();
        let Some(decoder) = decoder else {
            warn!("play() without an initialized decoder");
            return;
        };
        // A previous run may have left finished handles behind; reap them
        // quietly before reusing the slots.
        {
            let mut handles = self.handles.lock().unwrap();
            if let Some(h) = handles.decode.take() {
                let _ = h.join();
            }
            if let Some(h) = handles.display.take() {
                let _ = h.join();
            }
        }

        self.shared.stop.store(false, Ordering::Release);
        self.shared.interrupt.store(false, Ordering::Release);
        self.shared.paused.store(false, Ordering::Release);
        self.shared.seek_pending.store(false, Ordering::Release);
        self.shared.flush_pending.store(false, Ordering::Release);
        self.shared.consumer_idle.store(false, Ordering::Release);
        *self.shared.epoch_origin.lock().unwrap() = origin;

        let converter = self.converter_slot.lock().unwrap().take();
        let pump = DecodePump::new(
            Arc::clone(&self.shared),
            decoder,
            converter,
            Arc::clone(&self.allocator),
        );
        let decode_handle = thread::Builder::new()
            .name("framepump-decode".into())
            .spawn(move || pump.run())
            .expect("failed to spawn decode pump");
        let display_shared = Arc::clone(&self.shared);
        let display_handle = thread::Builder::new()
            .name("framepump-display".into())
            .spawn(move || display::run(display_shared))
            .expect("failed to spawn display pump");

        let mut handles = self.handles.lock().unwrap();
        handles.decode = Some(decode_handle);
        handles.display = Some(display_handle);
        drop(handles);

        self.shared.events.emit(PipelineEvent::Started);
        info!("pipeline started");
    }

    /// Park both pumps in place. Queue contents and position survive.
    pub fn pause(&self) {
        self.shared.paused.store(true, Ordering::Release);
        debug!("pipeline paused");
    }

    /// Pause and snapshot for a quick resume. A seek pending at this
    /// moment stays armed and is applied on resume.
    pub fn pause_ready(&self) {
        self.shared.paused.store(true, Ordering::Release);
        let snapshot = PauseSnapshot {
            at: Instant::now(),
            position: self.shared.position_us.load(Ordering::Acquire),
        };
        *self.pause_snapshot.lock().unwrap() = Some(snapshot);
        debug!("pause_ready at {}us", snapshot.position);
    }

    /// Resume from a pause_ready snapshot. Refused when the snapshot is
    /// older than the resume window (position may be arbitrarily stale by
    /// then — the host should restart instead).
    pub fn resume(&self) -> bool {
        let snapshot = self.pause_snapshot.lock().unwrap().take();
        let Some(snapshot) = snapshot else {
            return false;
        };
        if snapshot.at.elapsed() > self.shared.config.resume_window() {
            debug!("resume refused: snapshot outside window");
            return false;
        }
        if !self.threads_running() {
            return false;
        }
        self.cancel_release();
        self.shared.paused.store(false, Ordering::Release);
        debug!("resumed from {}us", snapshot.position);
        true
    }

    pub fn is_paused_ready(&self) -> bool {
        self.pause_snapshot
            .lock()
            .unwrap()
            .map(|s| s.at.elapsed() <= self.shared.config.resume_window())
            .unwrap_or(false)
    }

    /// Request an asynchronous seek. Accepted while playing or in
    /// pause_ready; the decode pump applies it at its next safe point.
    pub fn seek(&self, pts: MediaPts) -> bool {
        if !self.threads_running() {
            return false;
        }
        if self.shared.paused.load(Ordering::Acquire) && !self.is_paused_ready() {
            return false;
        }
        *self.shared.seek_target.lock().unwrap() = Some(pts);
        self.shared.seek_pending.store(true, Ordering::Release);
        trace!("seek requested to {}us", pts);
        true
    }

    /// Deferred stop: pause immediately, then stop the pumps after a
    /// grace period unless playback restarts first. Covers the rapid
    /// deactivate/reactivate pattern without paying a full teardown.
    pub fn release(&self) {
        self.pause_ready();
        self.cancel_release();
        self.release_cancel.store(false, Ordering::Release);

        let cancel = Arc::clone(&self.release_cancel);
        let shared = Arc::clone(&self.shared);
        let handles = Arc::clone(&self.handles);
        let grace = self.shared.config.stop_grace();
        let timer = thread::Builder::new()
            .name("framepump-release".into())
            .spawn(move || {
                let deadline = Instant::now() + grace;
                while Instant::now() < deadline {
                    if cancel.load(Ordering::Acquire) {
                        trace!("deferred stop cancelled");
                        return;
                    }
                    thread::sleep(Duration::from_millis(100));
                }
                if cancel.load(Ordering::Acquire) {
                    return;
                }
                debug!("grace period expired, stopping pumps");
                stop_pumps(&shared, &handles);
            })
            .expect("failed to spawn release timer");
        *self.release_timer.lock().unwrap() = Some(timer);
        debug!("release: deferred stop armed ({}ms grace)", grace.as_millis());
    }

    fn cancel_release(&self) {
        self.release_cancel.store(true, Ordering::Release);
        if let Some(timer) = self.release_timer.lock().unwrap().take() {
            let _ = timer.join();
        }
    }

    /// Stop both pumps and release everything in flight. Idempotent.
    pub fn stop(&self) {
        self.cancel_release();
        self.pause_snapshot.lock().unwrap().take();
        stop_pumps(&self.shared, &self.handles);
    }

    fn threads_running(&self) -> bool {
        let handles = self.handles.lock().unwrap();
        handles.decode.is_some() && !self.shared.stop.load(Ordering::Acquire)
    }

    pub fn is_playing(&self) -> bool {
        self.threads_running() && !self.shared.paused.load(Ordering::Acquire)
    }

    /// Last media position delivered, in microseconds.
    pub fn get_position(&self) -> MediaPts {
        self.shared.position_us.load(Ordering::Acquire)
    }

    /// Stream duration in microseconds (0 before initialize).
    pub fn get_duration(&self) -> MediaPts {
        self.shared.duration_us.load(Ordering::Acquire)
    }

    /// Subscribe to pipeline events.
    pub fn events(&self) -> Receiver<PipelineEvent> {
        self.shared.events.receiver()
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.shared.stats.snapshot()
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.shared.config
    }

    /// Drop every cached frame (e.g. the media content changed under the
    /// same path).
    pub fn invalidate_cache(&self) {
        if let Some(cache) = self.shared.cache.as_ref() {
            cache.invalidate();
        }
    }
}

impl Drop for Pipeline {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Signal, wake, join. Shared by `stop()` and the deferred-stop timer.
fn stop_pumps(shared: &Arc<PipelineShared>, handles: &Mutex<PumpHandles>) {
    let (decode, display) = {
        let mut handles = handles.lock().unwrap();
        (handles.decode.take(), handles.display.take())
    };
    if decode.is_none() && display.is_none() {
        return;
    }
    info!("stopping pipeline");

    shared.stop.store(true, Ordering::Release);
    shared.interrupt.store(true, Ordering::Release);
    shared.queue.wake_all();

    let budget = shared.config.join_timeout();
    if let Some(handle) = decode {
        join_escalating(handle, budget, "decode");
    }
    if let Some(handle) = display {
        join_escalating(handle, budget, "display");
    }

    // Pumps are gone; release everything still queued.
    shared.queue.flush();
    shared
        .stats
        .log_summary(shared.queue.counters(), shared.cache.as_ref().map(|c| c.stats()));
    if let Some(cache) = shared.cache.as_ref() {
        cache.log_stats();
    }
    shared.events.emit(PipelineEvent::Stopped);
    info!("pipeline stopped at {}us", shared.position_us.load(Ordering::Acquire));
}

/// Poll `is_finished` with escalating intervals inside the budget, then
/// join unconditionally — a stuck pump gets logged, never leaked.
fn join_escalating(handle: thread::JoinHandle<()>, budget: Duration, name: &str) {
    let start = Instant::now();
    while !handle.is_finished() {
        let elapsed = start.elapsed();
        if elapsed >= budget {
            warn!("{} pump exceeded its join budget, waiting for it", name);
            break;
        }
        let poll = if elapsed < Duration::from_millis(200) {
            Duration::from_millis(5)
        } else if elapsed < budget / 2 {
            Duration::from_millis(50)
        } else {
            Duration::from_millis(100)
        };
        thread::sleep(poll);
    }
    if handle.join().is_err() {
        error!("{} pump panicked", name);
    }
}
