//! Lock-free slot-ring backing
//!
//! Each slot carries an atomic state machine:
//!
//! ```text
//! Empty --write_begin--> Writing --write_commit--> Ready
//!   ^                       |                        |
//!   |                   write_abort             read_begin
//!   |                       v                        v
//!   +------- read_complete <--------------------- Reading
//! ```
//!
//! Cursors advance on commit/complete, not on begin, so a begun-but-not-
//! committed slot blocks re-claim (the double-claim CAS fails) until it is
//! aborted or finished. Payload publication is release/acquire: the value
//! write happens-before the `Ready` store, the `Ready` load happens-before
//! the value read.
//!
//! One producer thread and one consumer thread per queue (the decode and
//! display pumps). Slots and cursors are cache-line padded to keep the two
//! sides off each other's lines.
//!
//! Blocking helpers are layered on an external mutex/condvar notifier; the
//! ring itself never blocks.

use std::cell::UnsafeCell;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Condvar, Mutex};
use std::time::Duration;

use crossbeam::utils::CachePadded;
use log::{error, trace};

use super::{BoundedQueue, CounterCells, QueueCounters};

const EMPTY: u32 = 0;
const WRITING: u32 = 1;
const READY: u32 = 2;
const READING: u32 = 3;

/// Timed-wait quantum for the layered blocking helpers. The notifier wakes
/// waiters on commit/complete; the timeout only bounds lost-wakeup races.
const WAIT_QUANTUM: Duration = Duration::from_millis(2);

struct Slot<T> {
    state: AtomicU32,
    value: UnsafeCell<Option<T>>,
}

/// Claim on a slot in `Writing` state. Must be resolved with
/// [`LockFreeQueue::write_commit`] or [`LockFreeQueue::write_abort`].
#[derive(Debug)]
#[must_use]
pub struct WriteTicket {
    index: usize,
}

/// Claim on a slot in `Reading` state. Must be resolved with
/// [`LockFreeQueue::read_complete`].
#[derive(Debug)]
#[must_use]
pub struct ReadTicket {
    index: usize,
}

/// External condvar the blocking helpers park on. Separate from the ring:
/// the lock is only ever taken by waiters and wakers, never by the
/// non-blocking enqueue/dequeue path.
struct Notifier {
    lock: Mutex<()>,
    cond: Condvar,
}

impl Notifier {
    fn new() -> Self {
        Self { lock: Mutex::new(()), cond: Condvar::new() }
    }

    fn notify(&self) {
        let _guard = self.lock.lock().unwrap();
        self.cond.notify_all();
    }

    fn wait(&self) {
        let guard = self.lock.lock().unwrap();
        let _ = self.cond.wait_timeout(guard, WAIT_QUANTUM).unwrap();
    }
}

pub struct LockFreeQueue<T> {
    slots: Box<[CachePadded<Slot<T>>]>,
    /// Producer cursor: index of the next slot to claim for writing.
    /// Advances on commit.
    head: CachePadded<AtomicUsize>,
    /// Consumer cursor: index of the next slot to claim for reading.
    /// Advances on complete.
    tail: CachePadded<AtomicUsize>,
    /// Ordering epoch, bumped by flush.
    epoch: AtomicU64,
    capacity: usize,
    counters: CounterCells,
    space: Notifier,
    items: Notifier,
}

// Values move producer -> consumer through the slot state machine; the
// UnsafeCell is only touched by whoever holds the Writing/Reading claim.
unsafe impl<T: Send> Send for LockFreeQueue<T> {}
unsafe impl<T: Send> Sync for LockFreeQueue<T> {}

impl<T> LockFreeQueue<T> {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        let slots: Vec<CachePadded<Slot<T>>> = (0..capacity)
            .map(|_| {
                CachePadded::new(Slot {
                    state: AtomicU32::new(EMPTY),
                    value: UnsafeCell::new(None),
                })
            })
            .collect();
        Self {
            slots: slots.into_boxed_slice(),
            head: CachePadded::new(AtomicUsize::new(0)),
            tail: CachePadded::new(AtomicUsize::new(0)),
            epoch: AtomicU64::new(0),
            capacity,
            counters: CounterCells::default(),
            space: Notifier::new(),
            items: Notifier::new(),
        }
    }

    /// Claim the slot under the producer cursor. Fails (backpressure) when
    /// the slot is not `Empty`: the ring is full, or a previous claim is
    /// still unresolved.
    pub fn write_begin(&self) -> Option<WriteTicket> {
        let index = self.head.load(Ordering::Relaxed) % self.capacity;
        match self.slots[index].state.compare_exchange(
            EMPTY,
            WRITING,
            Ordering::Acquire,
            Ordering::Relaxed,
        ) {
            Ok(_) => Some(WriteTicket { index }),
            Err(_) => {
                self.counters.enqueue_failures.fetch_add(1, Ordering::Relaxed);
                None
            }
        }
    }

    /// Publish a value into a claimed slot and advance the producer cursor.
    pub fn write_commit(&self, ticket: WriteTicket, value: T) {
        let slot = &self.slots[ticket.index];
        unsafe {
            *slot.value.get() = Some(value);
        }
        slot.state.store(READY, Ordering::Release);
        self.head.fetch_add(1, Ordering::Release);
        self.counters.enqueued.fetch_add(1, Ordering::Relaxed);
        self.items.notify();
    }

    /// Release a claimed slot without publishing. The cursor did not move,
    /// so the next `write_begin` re-claims the same slot.
    pub fn write_abort(&self, ticket: WriteTicket) {
        self.slots[ticket.index].state.store(EMPTY, Ordering::Release);
    }

    /// Claim the slot under the consumer cursor and take its value.
    /// `None` when the slot holds nothing ready.
    pub fn read_begin(&self) -> Option<(ReadTicket, T)> {
        let index = self.tail.load(Ordering::Relaxed) % self.capacity;
        let slot = &self.slots[index];
        match slot
            .state
            .compare_exchange(READY, READING, Ordering::Acquire, Ordering::Relaxed)
        {
            Ok(_) => {
                let value = unsafe { (*slot.value.get()).take() };
                match value {
                    Some(v) => Some((ReadTicket { index }, v)),
                    None => {
                        // Protocol violation; recover the slot and count it.
                        error!("ready slot {} held no value", index);
                        slot.state.store(EMPTY, Ordering::Release);
                        self.tail.fetch_add(1, Ordering::Release);
                        self.counters.dequeue_failures.fetch_add(1, Ordering::Relaxed);
                        None
                    }
                }
            }
            Err(_) => {
                self.counters.dequeue_failures.fetch_add(1, Ordering::Relaxed);
                None
            }
        }
    }

    /// Free a read slot and advance the consumer cursor.
    pub fn read_complete(&self, ticket: ReadTicket) {
        self.slots[ticket.index].state.store(EMPTY, Ordering::Release);
        self.tail.fetch_add(1, Ordering::Release);
        self.counters.dequeued.fetch_add(1, Ordering::Relaxed);
        self.space.notify();
    }

    /// Current ordering epoch. Bumped once per flush.
    pub fn epoch(&self) -> u64 {
        self.epoch.load(Ordering::Acquire)
    }
}

impl<T: Send> BoundedQueue<T> for LockFreeQueue<T> {
    fn try_enqueue(&self, item: T) -> Result<(), T> {
        match self.write_begin() {
            Some(ticket) => {
                self.write_commit(ticket, item);
                Ok(())
            }
            None => Err(item),
        }
    }

    fn try_dequeue(&self) -> Option<T> {
        let (ticket, value) = self.read_begin()?;
        self.read_complete(ticket);
        Some(value)
    }

    fn enqueue_blocking(&self, mut item: T, stop: &AtomicBool) -> Result<(), T> {
        loop {
            match self.try_enqueue(item) {
                Ok(()) => return Ok(()),
                Err(back) => item = back,
            }
            if stop.load(Ordering::Acquire) {
                return Err(item);
            }
            self.space.wait();
        }
    }

    fn dequeue_blocking(&self, stop: &AtomicBool) -> Option<T> {
        loop {
            if let Some(item) = self.try_dequeue() {
                return Some(item);
            }
            if stop.load(Ordering::Acquire) {
                return None;
            }
            self.items.wait();
        }
    }

    /// Quiesced-only: the controller parks both pumps before flushing, so
    /// no slot is in `Writing`/`Reading` while this runs.
    fn flush(&self) {
        let mut dropped = 0usize;
        for slot in self.slots.iter() {
            if slot
                .state
                .compare_exchange(READY, READING, Ordering::Acquire, Ordering::Relaxed)
                .is_ok()
            {
                unsafe {
                    if (*slot.value.get()).take().is_some() {
                        dropped += 1;
                    }
                }
                slot.state.store(EMPTY, Ordering::Release);
            }
        }
        self.head.store(0, Ordering::Release);
        self.tail.store(0, Ordering::Release);
        self.epoch.fetch_add(1, Ordering::AcqRel);
        self.counters.flushes.fetch_add(1, Ordering::Relaxed);
        self.space.notify();
        trace!("lockfree queue flushed, {} item(s) dropped", dropped);
    }

    fn wake_all(&self) {
        self.space.notify();
        self.items.notify();
    }

    fn len(&self) -> usize {
        let head = self.head.load(Ordering::Acquire);
        let tail = self.tail.load(Ordering::Acquire);
        head.saturating_sub(tail)
    }

    fn capacity(&self) -> usize {
        self.capacity
    }

    fn counters(&self) -> QueueCounters {
        self.counters.snapshot()
    }
}

impl<T> Drop for LockFreeQueue<T> {
    fn drop(&mut self) {
        // Owned exclusively here; drop any values still published.
        for slot in self.slots.iter() {
            unsafe {
                let _ = (*slot.value.get()).take();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_double_claim_rejected_until_resolved() {
        let q: LockFreeQueue<u32> = LockFreeQueue::new(4);

        let t1 = q.write_begin().unwrap();
        // Same slot is Writing: second claim must fail
        assert!(q.write_begin().is_none());

        q.write_abort(t1);
        // Abort frees the same slot for re-claim
        let t2 = q.write_begin().unwrap();
        q.write_commit(t2, 5);
        assert_eq!(q.try_dequeue(), Some(5));
    }

    #[test]
    fn test_read_claim_exclusive() {
        let q: LockFreeQueue<u32> = LockFreeQueue::new(4);
        q.try_enqueue(1).unwrap();

        let (ticket, v) = q.read_begin().unwrap();
        assert_eq!(v, 1);
        // Slot is Reading: the cursor still points at it, no second claim
        assert!(q.read_begin().is_none());
        q.read_complete(ticket);
        assert!(q.read_begin().is_none()); // now simply empty
    }

    #[test]
    fn test_commit_before_ready_visibility() {
        // A committed value is immediately dequeueable; an uncommitted
        // claim publishes nothing.
        let q: LockFreeQueue<u32> = LockFreeQueue::new(2);
        let ticket = q.write_begin().unwrap();
        assert_eq!(q.try_dequeue(), None);
        q.write_commit(ticket, 42);
        assert_eq!(q.try_dequeue(), Some(42));
    }

    #[test]
    fn test_full_ring_backpressure() {
        let q: LockFreeQueue<u32> = LockFreeQueue::new(2);
        q.try_enqueue(0).unwrap();
        q.try_enqueue(1).unwrap();
        assert!(q.write_begin().is_none());
        assert_eq!(q.counters().enqueue_failures, 1);

        // Draining one slot reopens exactly one
        assert_eq!(q.try_dequeue(), Some(0));
        q.try_enqueue(2).unwrap();
        assert!(q.write_begin().is_none());
    }

    #[test]
    fn test_flush_bumps_epoch() {
        let q: LockFreeQueue<u32> = LockFreeQueue::new(4);
        q.try_enqueue(1).unwrap();
        q.try_enqueue(2).unwrap();
        assert_eq!(q.epoch(), 0);
        q.flush();
        assert_eq!(q.epoch(), 1);
        assert!(q.is_empty());
        assert_eq!(q.try_dequeue(), None);
    }

    #[test]
    fn test_spsc_stress() {
        use std::sync::Arc;
        use std::sync::atomic::AtomicBool;
        use std::thread;

        let q: Arc<LockFreeQueue<u64>> = Arc::new(LockFreeQueue::new(4));
        let stop = Arc::new(AtomicBool::new(false));
        const N: u64 = 10_000;

        let producer = {
            let q = Arc::clone(&q);
            let stop = Arc::clone(&stop);
            thread::spawn(move || {
                for v in 0..N {
                    q.enqueue_blocking(v, &stop).unwrap();
                }
            })
        };
        let consumer = {
            let q = Arc::clone(&q);
            let stop = Arc::clone(&stop);
            thread::spawn(move || {
                let mut expect = 0u64;
                while expect < N {
                    if let Some(v) = q.dequeue_blocking(&stop) {
                        assert_eq!(v, expect);
                        expect += 1;
                    }
                }
            })
        };
        producer.join().unwrap();
        consumer.join().unwrap();
        let c = q.counters();
        assert_eq!(c.enqueued, N);
        assert_eq!(c.dequeued, N);
    }
}
