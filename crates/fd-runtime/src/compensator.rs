//! Periodic temperature compensation of the output delay taps.
//!
//! Every period the board temperature is read, the tap polynomial evaluated,
//! and each calibrated channel's `offset_from_fit` added back before the tap
//! is written to the channel's FRR register.

use crate::calibrator::CalibrationLock;
use crate::periodic::PeriodicWorker;
use fd_common::{
    clamp_tap, CalibrationPolynomial, Channel, FdResult, Temperature, NUM_CHANNELS,
};
use fd_hw::regs;
use fd_hw::{BoardPeripherals, RegisterAccess};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, trace, warn};

/// Why a compensation tick did nothing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    /// A calibration pass holds the lock.
    CalibrationInProgress,
    /// Compensation is paused.
    Paused,
}

/// Result of one compensation tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompensationOutcome {
    /// Taps were rewritten; uncalibrated channels stay `None`.
    Applied {
        /// Temperature used.
        temperature: Temperature,
        /// Tap written per channel.
        taps: [Option<u16>; NUM_CHANNELS],
    },
    /// Nothing was written.
    Skipped(SkipReason),
}

struct CompensatorCore {
    regs: Arc<dyn RegisterAccess>,
    peripherals: Arc<dyn BoardPeripherals>,
    lock: Arc<CalibrationLock>,
    polynomial: CalibrationPolynomial,
    paused: AtomicBool,
}

impl CompensatorCore {
    fn compensate_once(&self) -> FdResult<CompensationOutcome> {
        if self.paused.load(Ordering::Acquire) {
            return Ok(CompensationOutcome::Skipped(SkipReason::Paused));
        }
        let Some(mut table) = self.lock.try_lock() else {
            return Ok(CompensationOutcome::Skipped(SkipReason::CalibrationInProgress));
        };

        let temperature = self.peripherals.read_temperature()?;
        let fitted = self.polynomial.eval(temperature);

        let mut taps = [None; NUM_CHANNELS];
        for ch in Channel::ALL {
            let state = table.get_mut(ch);
            let Some(result) = state.result else {
                continue;
            };
            let tap = clamp_tap(fitted + i64::from(result.offset_from_fit));
            self.regs
                .write32(regs::ch_reg(ch, regs::FRR), u32::from(tap));
            state.current_tap = Some(tap);
            taps[ch.index()] = Some(tap);
            trace!(channel = %ch, tap, "compensated tap");
        }
        Ok(CompensationOutcome::Applied { temperature, taps })
    }
}

/// Keeps the delay taps tracking the board temperature.
pub struct TemperatureCompensator {
    core: Arc<CompensatorCore>,
    worker: PeriodicWorker,
}

impl std::fmt::Debug for TemperatureCompensator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TemperatureCompensator")
            .field("period", &self.worker.period())
            .field("running", &self.worker.is_running())
            .field("paused", &self.is_paused())
            .finish_non_exhaustive()
    }
}

impl TemperatureCompensator {
    /// Create a stopped compensator ticking every `period`.
    pub fn new(
        regs: Arc<dyn RegisterAccess>,
        peripherals: Arc<dyn BoardPeripherals>,
        lock: Arc<CalibrationLock>,
        polynomial: CalibrationPolynomial,
        period: Duration,
    ) -> Self {
        Self {
            core: Arc::new(CompensatorCore {
                regs,
                peripherals,
                lock,
                polynomial,
                paused: AtomicBool::new(false),
            }),
            worker: PeriodicWorker::new("fd-compensate", period),
        }
    }

    /// Run one tick now.
    ///
    /// # Errors
    ///
    /// Returns the thermometer error; no tap is written in that case.
    pub fn compensate_once(&self) -> FdResult<CompensationOutcome> {
        self.core.compensate_once()
    }

    /// Start the periodic thread.
    ///
    /// # Errors
    ///
    /// Returns [`fd_common::FdError::Config`] if the thread cannot start.
    pub fn start(&mut self) -> FdResult<()> {
        let core = Arc::clone(&self.core);
        self.worker.start(move || match core.compensate_once() {
            Ok(CompensationOutcome::Applied { temperature, .. }) => {
                debug!(%temperature, "delay taps compensated");
            }
            Ok(CompensationOutcome::Skipped(reason)) => {
                debug!(?reason, "compensation tick skipped");
            }
            Err(e) => warn!(error = %e, "temperature compensation failed"),
        })
    }

    /// Stop the periodic thread. Idempotent.
    pub fn stop(&mut self) {
        self.worker.stop();
    }

    /// Suspend tap updates without stopping the thread.
    pub fn pause(&self) {
        self.core.paused.store(true, Ordering::Release);
    }

    /// Resume tap updates.
    pub fn resume(&self) {
        self.core.paused.store(false, Ordering::Release);
    }

    /// Whether tap updates are suspended.
    pub fn is_paused(&self) -> bool {
        self.core.paused.load(Ordering::Acquire)
    }

    /// Whether the periodic thread is alive.
    pub fn is_running(&self) -> bool {
        self.worker.is_running()
    }
}
