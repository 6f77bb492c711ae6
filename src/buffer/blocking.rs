//! Mutex/condvar queue backing
//!
//! Slot array + wrapping cursors + count under one mutex, with separate
//! not-full / not-empty condvars. Waits are timed so a raised stop flag is
//! observed within one wait quantum even if a wakeup is lost.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Condvar, Mutex};
use std::time::Duration;

use log::trace;

use super::{BoundedQueue, CounterCells, QueueCounters};

/// Upper bound on one condvar wait; stop responsiveness floor.
const WAIT_QUANTUM: Duration = Duration::from_millis(50);

struct Inner<T> {
    slots: Vec<Option<T>>,
    /// Next write index.
    head: usize,
    /// Next read index.
    tail: usize,
    count: usize,
}

pub struct BlockingQueue<T> {
    inner: Mutex<Inner<T>>,
    not_full: Condvar,
    not_empty: Condvar,
    capacity: usize,
    counters: CounterCells,
}

impl<T> BlockingQueue<T> {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        let mut slots = Vec::with_capacity(capacity);
        slots.resize_with(capacity, || None);
        Self {
            inner: Mutex::new(Inner { slots, head: 0, tail: 0, count: 0 }),
            not_full: Condvar::new(),
            not_empty: Condvar::new(),
            capacity,
            counters: CounterCells::default(),
        }
    }

    fn push_locked(&self, inner: &mut Inner<T>, item: T) {
        let idx = inner.head;
        inner.slots[idx] = Some(item);
        inner.head = (inner.head + 1) % self.capacity;
        inner.count += 1;
        self.counters.enqueued.fetch_add(1, Ordering::Relaxed);
    }

    fn pop_locked(&self, inner: &mut Inner<T>) -> Option<T> {
        let idx = inner.tail;
        let item = inner.slots[idx].take();
        if item.is_some() {
            inner.tail = (inner.tail + 1) % self.capacity;
            inner.count -= 1;
            self.counters.dequeued.fetch_add(1, Ordering::Relaxed);
        }
        item
    }
}

impl<T: Send> BoundedQueue<T> for BlockingQueue<T> {
    fn try_enqueue(&self, item: T) -> Result<(), T> {
        let mut inner = self.inner.lock().unwrap();
        if inner.count == self.capacity {
            self.counters.enqueue_failures.fetch_add(1, Ordering::Relaxed);
            return Err(item);
        }
        self.push_locked(&mut inner, item);
        drop(inner);
        self.not_empty.notify_one();
        Ok(())
    }

    fn try_dequeue(&self) -> Option<T> {
        let mut inner = self.inner.lock().unwrap();
        let item = self.pop_locked(&mut inner);
        if item.is_none() {
            self.counters.dequeue_failures.fetch_add(1, Ordering::Relaxed);
            return None;
        }
        drop(inner);
        self.not_full.notify_one();
        item
    }

    fn enqueue_blocking(&self, item: T, stop: &AtomicBool) -> Result<(), T> {
        let mut inner = self.inner.lock().unwrap();
        while inner.count == self.capacity {
            if stop.load(Ordering::Acquire) {
                return Err(item);
            }
            let (guard, _timeout) = self.not_full.wait_timeout(inner, WAIT_QUANTUM).unwrap();
            inner = guard;
        }
        self.push_locked(&mut inner, item);
        drop(inner);
        self.not_empty.notify_one();
        Ok(())
    }

    fn dequeue_blocking(&self, stop: &AtomicBool) -> Option<T> {
        let mut inner = self.inner.lock().unwrap();
        loop {
            if let Some(item) = self.pop_locked(&mut inner) {
                drop(inner);
                self.not_full.notify_one();
                return Some(item);
            }
            if stop.load(Ordering::Acquire) {
                return None;
            }
            let (guard, _timeout) = self.not_empty.wait_timeout(inner, WAIT_QUANTUM).unwrap();
            inner = guard;
        }
    }

    fn flush(&self) {
        let mut inner = self.inner.lock().unwrap();
        let dropped = inner.count;
        for slot in inner.slots.iter_mut() {
            *slot = None;
        }
        inner.head = 0;
        inner.tail = 0;
        inner.count = 0;
        self.counters.flushes.fetch_add(1, Ordering::Relaxed);
        drop(inner);
        self.not_full.notify_all();
        trace!("blocking queue flushed, {} item(s) dropped", dropped);
    }

    fn wake_all(&self) {
        // Take the lock so wakes cannot slip between a waiter's check and
        // its wait.
        let _inner = self.inner.lock().unwrap();
        self.not_full.notify_all();
        self.not_empty.notify_all();
    }

    fn len(&self) -> usize {
        self.inner.lock().unwrap().count
    }

    fn capacity(&self) -> usize {
        self.capacity
    }

    fn counters(&self) -> QueueCounters {
        self.counters.snapshot()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wraparound_preserves_fifo() {
        let q = BlockingQueue::new(3);
        // Cycle more items than capacity to exercise cursor wrap
        for round in 0..5u32 {
            for i in 0..3 {
                q.try_enqueue(round * 10 + i).unwrap();
            }
            for i in 0..3 {
                assert_eq!(q.try_dequeue(), Some(round * 10 + i));
            }
        }
        let c = q.counters();
        assert_eq!(c.enqueued, 15);
        assert_eq!(c.dequeued, 15);
    }

    #[test]
    fn test_flush_drops_items() {
        // Drop side effects must run for flushed items
        use std::sync::Arc;
        use std::sync::atomic::AtomicUsize;

        struct Tracked(Arc<AtomicUsize>);
        impl Drop for Tracked {
            fn drop(&mut self) {
                self.0.fetch_add(1, Ordering::SeqCst);
            }
        }

        let drops = Arc::new(AtomicUsize::new(0));
        let q = BlockingQueue::new(4);
        q.try_enqueue(Tracked(Arc::clone(&drops))).ok();
        q.try_enqueue(Tracked(Arc::clone(&drops))).ok();
        q.flush();
        assert_eq!(drops.load(Ordering::SeqCst), 2);
        assert!(q.is_empty());
    }

    #[test]
    fn test_zero_capacity_clamped() {
        let q: BlockingQueue<u8> = BlockingQueue::new(0);
        assert_eq!(q.capacity(), 1);
    }
}
