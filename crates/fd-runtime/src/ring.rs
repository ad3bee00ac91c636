//! Fixed-capacity ring buffer between the FIFO drain and the consumer.
//!
//! The producer (drain step, possibly on the interrupt path) and the consumer
//! (delivery worker) share one short critical section around slot and pointer
//! updates. `head` and `tail` are free-running counters; the slot index is the
//! counter masked by `capacity - 1`.
//!
//! # Overflow
//!
//! When a push leaves `head - tail >= capacity`, the oldest half of the buffer
//! is discarded by advancing `tail` by `capacity / 2`. The push still succeeds
//! and reports how many samples were lost.
//!
//! ```text
//!   tail                     head
//!    │                        │
//!  ┌─▼──┬────┬────┬────┬────┬─▼──┬────┬────┐
//!  │ s4 │ s5 │ s6 │ s7 │ s8 │    │    │    │   slot = counter & mask
//!  └────┴────┴────┴────┴────┴────┴────┴────┘
//! ```

use crossbeam_utils::CachePadded;
use fd_common::{FdError, FdResult};
use static_assertions::const_assert;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

/// Ring size used when none is configured.
pub const DEFAULT_RING_CAPACITY: usize = 256;

const_assert!(DEFAULT_RING_CAPACITY.is_power_of_two());
const_assert!(DEFAULT_RING_CAPACITY >= 2);

/// Outcome of a push.
#[must_use]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushStatus {
    /// The sample was stored without loss.
    Stored,
    /// The sample was stored after discarding the oldest `dropped` samples.
    Overflowed {
        /// Samples discarded.
        dropped: usize,
    },
}

impl PushStatus {
    /// Number of samples lost by this push.
    #[must_use]
    pub fn dropped(self) -> usize {
        match self {
            Self::Stored => 0,
            Self::Overflowed { dropped } => dropped,
        }
    }
}

/// Power-of-two circular buffer with overflow-by-half policy.
#[derive(Debug)]
pub struct RingBuffer<T> {
    slots: Mutex<Box<[T]>>,
    /// Producer counter.
    head: CachePadded<AtomicU64>,
    /// Consumer counter.
    tail: CachePadded<AtomicU64>,
    mask: u64,
    ready: Condvar,
    closed: AtomicBool,
}

impl<T: Copy + Default> RingBuffer<T> {
    /// Allocate a ring of `capacity` slots.
    ///
    /// # Errors
    ///
    /// Returns [`FdError::Config`] unless `capacity` is a power of two of at
    /// least 2.
    pub fn new(capacity: usize) -> FdResult<Self> {
        if capacity < 2 || !capacity.is_power_of_two() {
            return Err(FdError::Config(format!(
                "ring capacity {capacity} is not a power of two"
            )));
        }
        Ok(Self {
            slots: Mutex::new(vec![T::default(); capacity].into_boxed_slice()),
            head: CachePadded::new(AtomicU64::new(0)),
            tail: CachePadded::new(AtomicU64::new(0)),
            mask: capacity as u64 - 1,
            ready: Condvar::new(),
            closed: AtomicBool::new(false),
        })
    }

    fn slots(&self) -> MutexGuard<'_, Box<[T]>> {
        self.slots.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Store `value` at the head.
    pub fn push(&self, value: T) -> PushStatus {
        let status = {
            let mut slots = self.slots();
            let head = self.head.load(Ordering::Relaxed);
            slots[(head & self.mask) as usize] = value;
            let head = head + 1;
            self.head.store(head, Ordering::Release);

            let tail = self.tail.load(Ordering::Relaxed);
            if head - tail > self.mask {
                let half = (self.mask + 1) / 2;
                self.tail.store(tail + half, Ordering::Release);
                PushStatus::Overflowed {
                    dropped: half as usize,
                }
            } else {
                PushStatus::Stored
            }
        };
        self.ready.notify_one();
        status
    }

    /// Take the oldest sample, or `None` when empty.
    pub fn pop(&self) -> Option<T> {
        let slots = self.slots();
        self.take(&slots)
    }

    fn take(&self, slots: &[T]) -> Option<T> {
        let tail = self.tail.load(Ordering::Relaxed);
        if tail == self.head.load(Ordering::Acquire) {
            return None;
        }
        let value = slots[(tail & self.mask) as usize];
        self.tail.store(tail + 1, Ordering::Release);
        Some(value)
    }

    /// Take the oldest sample, waiting up to `timeout` for one to arrive.
    ///
    /// Returns `None` on timeout or once the ring is closed and empty.
    pub fn pop_timeout(&self, timeout: Duration) -> Option<T> {
        let slots = self.slots();
        let (slots, _) = self
            .ready
            .wait_timeout_while(slots, timeout, |_| {
                self.is_empty() && !self.closed.load(Ordering::Acquire)
            })
            .unwrap_or_else(PoisonError::into_inner);
        self.take(&slots)
    }

    /// Wake every waiting consumer; later waits return immediately when empty.
    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
        // pair with the predicate check under the lock
        drop(self.slots());
        self.ready.notify_all();
    }

    /// Whether [`close`](Self::close) was called.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Discard every buffered sample.
    pub fn clear(&self) {
        let _slots = self.slots();
        self.tail
            .store(self.head.load(Ordering::Acquire), Ordering::Release);
    }

    /// Samples waiting.
    pub fn len(&self) -> usize {
        let tail = self.tail.load(Ordering::Acquire);
        let head = self.head.load(Ordering::Acquire);
        head.saturating_sub(tail) as usize
    }

    /// True when no sample is waiting.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of slots.
    pub fn capacity(&self) -> usize {
        (self.mask + 1) as usize
    }

    /// Producer counter.
    pub fn head(&self) -> u64 {
        self.head.load(Ordering::Acquire)
    }

    /// Consumer counter.
    pub fn tail(&self) -> u64 {
        self.tail.load(Ordering::Acquire)
    }
}
