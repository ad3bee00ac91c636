//! Common utilities for acceptance tests.
//!
//! Provides helpers for:
//! - Opening boards on a simulated card with fast bring-up timing
//! - Collecting delivered timestamps with a deadline
//! - Summarizing capture runs

#![allow(dead_code)] // not every suite uses every helper

use anyhow::Context;
use fd_common::{BoardConfig, CaptureSnapshot};
use fd_hw::SimulatedCard;
use fd_runtime::{Board, Delivery, TimestampStream};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Install a test-writer subscriber honoring `RUST_LOG`.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Default configuration with every settle and lock wait shortened.
pub fn fast_config() -> BoardConfig {
    let mut config = BoardConfig::default();
    config.calibration.repeats = 16;
    config.calibration.arm_settle = Duration::ZERO;
    config.calibration.pulse_settle = Duration::ZERO;
    config.tdc.reset_settle = Duration::ZERO;
    config.tdc.lock_timeout = Duration::from_millis(50);
    config.tdc.lock_poll = Duration::from_millis(1);
    config.hardware.reset_settle = Duration::ZERO;
    config.hardware.lock_timeout = Duration::from_millis(50);
    config.hardware.lock_poll = Duration::from_millis(1);
    config.capture.poll_interval = Duration::from_millis(1);
    config
}

/// Open a board on `card`.
pub fn open_board(card: &SimulatedCard, config: BoardConfig) -> anyhow::Result<Board> {
    init_tracing();
    Board::open(config, Arc::new(card.clone()), Arc::new(card.clone()))
        .context("board bring-up failed")
}

/// Pull `n` deliveries, failing if they do not arrive within `timeout`.
pub fn collect(
    stream: &mut TimestampStream,
    n: usize,
    timeout: Duration,
) -> anyhow::Result<Vec<Delivery>> {
    let deadline = Instant::now() + timeout;
    let mut out = Vec::with_capacity(n);
    while out.len() < n {
        let left = deadline.saturating_duration_since(Instant::now());
        if left.is_zero() {
            anyhow::bail!("only {} of {n} timestamps delivered", out.len());
        }
        if let Some(d) = stream.next_timeout(left) {
            out.push(d);
        }
    }
    Ok(out)
}

/// Summary of one capture run.
#[derive(Debug, Clone)]
pub struct CaptureReport {
    /// Edges injected into the card.
    pub injected: u64,
    /// Timestamps received by the consumer.
    pub received: u64,
    /// Wall time of the run.
    pub elapsed: Duration,
    /// Pipeline counters at the end of the run.
    pub metrics: CaptureSnapshot,
}

impl CaptureReport {
    /// Every injected edge is either received or accounted for as lost.
    pub fn is_consistent(&self) -> bool {
        self.received + self.metrics.dropped == self.injected
            && self.metrics.drained == self.injected
    }

    /// Received timestamps per second.
    pub fn rate(&self) -> f64 {
        self.received as f64 / self.elapsed.as_secs_f64().max(f64::EPSILON)
    }

    /// One-line summary for test output.
    pub fn summary(&self) -> String {
        format!(
            "injected={} received={} dropped={} gaps={} rate={:.0}/s",
            self.injected,
            self.received,
            self.metrics.dropped,
            self.metrics.sequence_gaps,
            self.rate()
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fast_config_validates() {
        assert!(fast_config().validate().is_ok());
    }

    #[test]
    fn test_report_consistency() {
        let report = CaptureReport {
            injected: 10,
            received: 6,
            elapsed: Duration::from_secs(2),
            metrics: CaptureSnapshot {
                drained: 10,
                delivered: 6,
                dropped: 4,
                overflow_events: 1,
                ..CaptureSnapshot::default()
            },
        };
        assert!(report.is_consistent());
        assert!((report.rate() - 3.0).abs() < 1e-9);
        assert!(report.summary().contains("dropped=4"));
    }
}
