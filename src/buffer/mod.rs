//! Bounded frame queue between the decode and display pumps
//!
//! One contract, two interchangeable backings selected at construction:
//! a mutex/condvar queue ([`blocking::BlockingQueue`]) and a lock-free
//! slot ring ([`lockfree::LockFreeQueue`]). Exactly one backing exists
//! per pipeline; both present the same trait so the pumps never know
//! which one they talk to.
//!
//! Semantics shared by both backings:
//! - strict FIFO, fixed capacity, enqueue into a full queue is
//!   backpressure (a counted signal), never an error
//! - blocking helpers observe an external stop flag and give up promptly
//!   when it is raised
//! - `flush` discards everything in flight and starts a new ordering
//!   epoch; no pre-flush item may be dequeued after the flush

pub mod blocking;
pub mod lockfree;

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use serde::{Deserialize, Serialize};

/// Which queue implementation a pipeline runs on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum QueueBacking {
    /// Mutex + two condvars. Simple, fair, fine for frame-rate traffic.
    Blocking,
    /// Per-slot atomic state machine, padded cursors. No locks on the
    /// hot enqueue/dequeue path.
    LockFree,
}

/// Snapshot of a queue's activity counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueueCounters {
    pub enqueued: u64,
    pub dequeued: u64,
    /// Full-queue enqueue attempts (backpressure events).
    pub enqueue_failures: u64,
    /// Empty-queue dequeue attempts.
    pub dequeue_failures: u64,
    pub flushes: u64,
}

/// Internal counter cells shared by both backings.
#[derive(Debug, Default)]
pub(crate) struct CounterCells {
    pub enqueued: AtomicU64,
    pub dequeued: AtomicU64,
    pub enqueue_failures: AtomicU64,
    pub dequeue_failures: AtomicU64,
    pub flushes: AtomicU64,
}

impl CounterCells {
    pub fn snapshot(&self) -> QueueCounters {
        QueueCounters {
            enqueued: self.enqueued.load(Ordering::Relaxed),
            dequeued: self.dequeued.load(Ordering::Relaxed),
            enqueue_failures: self.enqueue_failures.load(Ordering::Relaxed),
            dequeue_failures: self.dequeue_failures.load(Ordering::Relaxed),
            flushes: self.flushes.load(Ordering::Relaxed),
        }
    }
}

/// The queue contract both backings implement.
pub trait BoundedQueue<T>: Send + Sync {
    /// Enqueue without waiting. Full queue returns the item back.
    fn try_enqueue(&self, item: T) -> Result<(), T>;

    /// Dequeue without waiting.
    fn try_dequeue(&self) -> Option<T>;

    /// Enqueue, waiting for space. Returns the item back if `stop` is
    /// raised before space appears.
    fn enqueue_blocking(&self, item: T, stop: &AtomicBool) -> Result<(), T>;

    /// Dequeue, waiting for an item. Returns `None` once `stop` is raised.
    fn dequeue_blocking(&self, stop: &AtomicBool) -> Option<T>;

    /// Discard all queued items and start a new ordering epoch.
    ///
    /// Both pumps must be parked (not mid-enqueue/mid-dequeue) when this
    /// is called; the controller's quiesce handshake guarantees it.
    fn flush(&self);

    /// Wake every blocked waiter so it can re-check its stop flag.
    fn wake_all(&self);

    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn capacity(&self) -> usize;

    fn counters(&self) -> QueueCounters;
}

/// Construct the configured backing behind the shared trait.
pub fn build_queue<T: Send + 'static>(
    backing: QueueBacking,
    capacity: usize,
) -> Arc<dyn BoundedQueue<T>> {
    match backing {
        QueueBacking::Blocking => Arc::new(blocking::BlockingQueue::new(capacity)),
        QueueBacking::LockFree => Arc::new(lockfree::LockFreeQueue::new(capacity)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::AtomicBool;
    use std::thread;
    use std::time::Duration;

    fn backings() -> Vec<(&'static str, Arc<dyn BoundedQueue<u32>>)> {
        vec![
            ("blocking", build_queue(QueueBacking::Blocking, 4)),
            ("lockfree", build_queue(QueueBacking::LockFree, 4)),
        ]
    }

    #[test]
    fn test_fifo_order_both_backings() {
        for (name, q) in backings() {
            for v in 0..4u32 {
                assert!(q.try_enqueue(v).is_ok(), "{}: enqueue {}", name, v);
            }
            for v in 0..4u32 {
                assert_eq!(q.try_dequeue(), Some(v), "{}: dequeue {}", name, v);
            }
            assert_eq!(q.try_dequeue(), None, "{}", name);
        }
    }

    #[test]
    fn test_capacity_plus_one_fails() {
        for (name, q) in backings() {
            for v in 0..4u32 {
                assert!(q.try_enqueue(v).is_ok(), "{}", name);
            }
            assert_eq!(q.try_enqueue(99), Err(99), "{}: overfull accepted", name);
            assert_eq!(q.counters().enqueue_failures, 1, "{}", name);
            assert_eq!(q.len(), 4, "{}", name);
        }
    }

    #[test]
    fn test_flush_empties_and_counts() {
        for (name, q) in backings() {
            q.try_enqueue(1).unwrap();
            q.try_enqueue(2).unwrap();
            q.flush();
            assert!(q.is_empty(), "{}", name);
            assert_eq!(q.try_dequeue(), None, "{}", name);
            assert_eq!(q.counters().flushes, 1, "{}", name);

            // Post-flush epoch: queue is fully usable again
            q.try_enqueue(7).unwrap();
            assert_eq!(q.try_dequeue(), Some(7), "{}", name);
        }
    }

    #[test]
    fn test_blocking_handoff_across_threads() {
        for (name, q) in backings() {
            let stop = Arc::new(AtomicBool::new(false));
            let producer = {
                let q = Arc::clone(&q);
                let stop = Arc::clone(&stop);
                thread::spawn(move || {
                    // 16 items through a capacity-4 queue forces waiting
                    for v in 0..16u32 {
                        q.enqueue_blocking(v, &stop).unwrap();
                    }
                })
            };
            let consumer = {
                let q = Arc::clone(&q);
                let stop = Arc::clone(&stop);
                thread::spawn(move || {
                    let mut got = Vec::new();
                    while got.len() < 16 {
                        match q.dequeue_blocking(&stop) {
                            Some(v) => got.push(v),
                            None => break,
                        }
                    }
                    got
                })
            };
            producer.join().unwrap();
            let got = consumer.join().unwrap();
            assert_eq!(got, (0..16u32).collect::<Vec<_>>(), "{}", name);
        }
    }

    #[test]
    fn test_stop_unblocks_waiters() {
        for (name, q) in backings() {
            let stop = Arc::new(AtomicBool::new(false));
            let waiter = {
                let q = Arc::clone(&q);
                let stop = Arc::clone(&stop);
                thread::spawn(move || q.dequeue_blocking(&stop))
            };
            thread::sleep(Duration::from_millis(30));
            stop.store(true, std::sync::atomic::Ordering::SeqCst);
            q.wake_all();
            assert_eq!(waiter.join().unwrap(), None, "{}", name);
        }
    }
}
