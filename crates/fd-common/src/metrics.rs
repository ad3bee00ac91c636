//! Capture counters and measurement statistics.
//!
//! [`CaptureMetrics`] is shared between the drain path (possibly interrupt
//! context) and readers, so every counter is a relaxed atomic and updates never
//! block.

use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};

/// Counters maintained by the capture pipeline.
#[derive(Debug, Default)]
pub struct CaptureMetrics {
    drained: AtomicU64,
    delivered: AtomicU64,
    dropped: AtomicU64,
    overflow_events: AtomicU64,
    sequence_gaps: AtomicU64,
    lost_samples: AtomicU64,
}

impl CaptureMetrics {
    /// Create zeroed counters.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Samples moved from the hardware FIFO into the ring.
    pub fn record_drained(&self, n: u64) {
        self.drained.fetch_add(n, Ordering::Relaxed);
    }

    /// One sample handed to the consumer.
    pub fn record_delivered(&self) {
        self.delivered.fetch_add(1, Ordering::Relaxed);
    }

    /// A ring overflow that discarded `dropped` samples.
    pub fn record_overflow(&self, dropped: usize) {
        self.overflow_events.fetch_add(1, Ordering::Relaxed);
        self.dropped.fetch_add(dropped as u64, Ordering::Relaxed);
    }

    /// A discontinuity of `lost` sequence ids seen by the consumer.
    pub fn record_gap(&self, lost: u64) {
        self.sequence_gaps.fetch_add(1, Ordering::Relaxed);
        self.lost_samples.fetch_add(lost, Ordering::Relaxed);
    }

    /// Total samples dropped by ring overflow.
    #[must_use]
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Point-in-time copy of all counters.
    #[must_use]
    pub fn snapshot(&self) -> CaptureSnapshot {
        CaptureSnapshot {
            drained: self.drained.load(Ordering::Relaxed),
            delivered: self.delivered.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
            overflow_events: self.overflow_events.load(Ordering::Relaxed),
            sequence_gaps: self.sequence_gaps.load(Ordering::Relaxed),
            lost_samples: self.lost_samples.load(Ordering::Relaxed),
        }
    }
}

/// Serializable capture counter snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct CaptureSnapshot {
    /// Samples read from the hardware FIFO.
    pub drained: u64,
    /// Samples delivered to the consumer.
    pub delivered: u64,
    /// Samples discarded by ring overflow.
    pub dropped: u64,
    /// Number of overflow events.
    pub overflow_events: u64,
    /// Number of sequence discontinuities.
    pub sequence_gaps: u64,
    /// Sequence ids missing across all discontinuities.
    pub lost_samples: u64,
}

/// Running statistics over repeated delay measurements.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DelayStats {
    count: u64,
    sum: u64,
    min: u64,
    max: u64,
}

impl Default for DelayStats {
    fn default() -> Self {
        Self::new()
    }
}

impl DelayStats {
    /// Empty statistics.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            count: 0,
            sum: 0,
            min: u64::MAX,
            max: 0,
        }
    }

    /// Add one measurement.
    pub fn record(&mut self, value: u64) {
        self.count += 1;
        self.sum = self.sum.saturating_add(value);
        self.min = self.min.min(value);
        self.max = self.max.max(value);
    }

    /// Number of measurements.
    #[must_use]
    pub const fn count(&self) -> u64 {
        self.count
    }

    /// Rounded mean, or `None` before the first measurement.
    #[must_use]
    pub fn avg(&self) -> Option<u64> {
        if self.count == 0 {
            None
        } else {
            Some((self.sum + self.count / 2) / self.count)
        }
    }

    /// Smallest measurement.
    #[must_use]
    pub fn min(&self) -> Option<u64> {
        (self.count > 0).then_some(self.min)
    }

    /// Largest measurement.
    #[must_use]
    pub fn max(&self) -> Option<u64> {
        (self.count > 0).then_some(self.max)
    }

    /// Spread between the extremes.
    #[must_use]
    pub fn spread(&self) -> u64 {
        if self.count == 0 {
            0
        } else {
            self.max - self.min
        }
    }
}
