//! Board time-of-day.
//!
//! The core counts seconds (40 bits) and 8 ns cycles. Setting the time loads
//! the TM registers and pulses `TCR_SET_TIME`; reading pulses `TCR_CAP_TIME`
//! to latch the running counters first.

use fd_common::{FdError, FdResult, TimeValue};
use fd_hw::regs;
use fd_hw::RegisterAccess;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::{debug, info};

/// Seconds representable by the SECH/SECL pair.
const MAX_UTC: i64 = (1 << 40) - 1;

/// Access to the board time base.
pub struct TimeBase {
    regs: Arc<dyn RegisterAccess>,
    /// Serializes the multi-register set and capture sequences.
    guard: Mutex<()>,
}

impl std::fmt::Debug for TimeBase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TimeBase").finish_non_exhaustive()
    }
}

impl TimeBase {
    /// Wrap the core's register window.
    pub fn new(regs: Arc<dyn RegisterAccess>) -> Self {
        Self {
            regs,
            guard: Mutex::new(()),
        }
    }

    /// Load `t` into the running time. The fraction is ignored.
    ///
    /// # Errors
    ///
    /// Returns [`FdError::Config`] if the seconds do not fit 40 bits.
    pub fn set(&self, t: TimeValue) -> FdResult<()> {
        if !(0..=MAX_UTC).contains(&t.utc()) {
            return Err(FdError::Config(format!(
                "time {} outside the 40-bit seconds counter",
                t.utc()
            )));
        }
        let _g = self.guard.lock().unwrap_or_else(PoisonError::into_inner);

        // GCR must be zero while the counters are loaded
        let gcr = self.regs.read32(regs::GCR);
        self.regs.write32(regs::GCR, 0);
        self.regs
            .write32(regs::TM_SECH, ((t.utc() >> 32) & 0xff) as u32);
        self.regs.write32(regs::TM_SECL, t.utc() as u32);
        self.regs.write32(regs::TM_CYCLES, t.coarse());
        let tcr = self.regs.read32(regs::TCR);
        self.regs.write32(regs::TCR, tcr | regs::TCR_SET_TIME);
        self.regs.write32(regs::GCR, gcr);

        debug!(time = %t, "board time set");
        Ok(())
    }

    /// Latch and read the running time.
    ///
    /// # Errors
    ///
    /// Returns [`FdError::HardwareFault`] if the cycle counter reads out of
    /// range.
    pub fn get(&self) -> FdResult<TimeValue> {
        let (h, l, c) = {
            let _g = self.guard.lock().unwrap_or_else(PoisonError::into_inner);
            let tcr = self.regs.read32(regs::TCR);
            self.regs.write32(regs::TCR, tcr | regs::TCR_CAP_TIME);
            (
                self.regs.read32(regs::TM_SECH),
                self.regs.read32(regs::TM_SECL),
                self.regs.read32(regs::TM_CYCLES),
            )
        };
        let utc = (i64::from(h & 0xff) << 32) | i64::from(l);
        TimeValue::new(utc, c, 0)
            .map_err(|_| FdError::HardwareFault(format!("time base cycle counter reads {c}")))
    }

    /// Load the host's wall clock.
    ///
    /// # Errors
    ///
    /// Returns [`FdError::Config`] if the host clock is before the epoch.
    pub fn set_host(&self) -> FdResult<TimeValue> {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map_err(|e| FdError::Config(format!("host clock before epoch: {e}")))?;
        let secs = i64::try_from(now.as_secs())
            .map_err(|_| FdError::Config("host clock out of range".into()))?;
        let t = TimeValue::new(secs, now.subsec_nanos() >> 3, 0)?;
        self.set(t)?;
        info!(time = %t, "board time set from host clock");
        Ok(t)
    }

    /// Zero the time base so the core resynchronizes.
    ///
    /// # Errors
    ///
    /// Never fails for the zero time; the signature matches [`Self::set`].
    pub fn init(&self) -> FdResult<()> {
        self.set(TimeValue::ZERO)
    }
}
