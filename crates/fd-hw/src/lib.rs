//! Hardware plane of the fine-delay card.
//!
//! This crate provides:
//! - [`RegisterAccess`] and [`BoardPeripherals`] traits, the only boundary to
//!   the physical card
//! - [`regs`] module with the core and TDC register map
//! - [`pll`] module with the TDC PLL divisor solver
//! - [`tdc`] module with indirect TDC access, bus self-test and mode setup
//! - [`simulated`] module with a behavioral card model (feature `simulated`)

pub mod pll;
pub mod regs;
#[cfg(feature = "simulated")]
pub mod simulated;
pub mod tdc;

pub use pll::*;
#[cfg(feature = "simulated")]
pub use simulated::*;
pub use tdc::*;

use fd_common::{Channel, FdError, FdResult, Temperature};
use std::thread;
use std::time::{Duration, Instant};

/// 32-bit register window of the fine-delay core.
///
/// Implementations must tolerate concurrent calls from the capture drain path,
/// the compensation timer and the control thread.
pub trait RegisterAccess: Send + Sync {
    /// Read the register at byte offset `addr`.
    fn read32(&self, addr: u32) -> u32;

    /// Write `value` to the register at byte offset `addr`.
    fn write32(&self, addr: u32, value: u32);

    /// Read-modify-write setting `mask`.
    fn set_bits(&self, addr: u32, mask: u32) {
        let v = self.read32(addr);
        self.write32(addr, v | mask);
    }

    /// Read-modify-write clearing `mask`.
    fn clear_bits(&self, addr: u32, mask: u32) {
        let v = self.read32(addr);
        self.write32(addr, v & !mask);
    }
}

/// Card functions that sit behind the GPIO expander and the one-wire bus.
pub trait BoardPeripherals: Send + Sync {
    /// Drive or release the output buffer of `ch`.
    fn set_output_enabled(&self, ch: Channel, enabled: bool);

    /// Put `addr` on the TDC address lines.
    fn select_tdc_address(&self, addr: u8);

    /// Read the board thermometer.
    ///
    /// # Errors
    ///
    /// Returns [`FdError::HardwareFault`] if the sensor does not answer.
    fn read_temperature(&self) -> FdResult<Temperature>;
}

/// Poll `done` every `interval` until it returns true or `timeout` expires.
///
/// # Errors
///
/// Returns [`FdError::Timeout`] naming `what` if the condition never held.
pub fn poll_until<F>(what: &str, timeout: Duration, interval: Duration, mut done: F) -> FdResult<()>
where
    F: FnMut() -> bool,
{
    let start = Instant::now();
    loop {
        if done() {
            return Ok(());
        }
        let waited = start.elapsed();
        if waited >= timeout {
            return Err(FdError::Timeout {
                what: what.to_string(),
                waited_ms: u64::try_from(waited.as_millis()).unwrap_or(u64::MAX),
            });
        }
        thread::sleep(interval.min(timeout - waited));
    }
}

/// Sleep for a hardware settle time; zero returns immediately.
pub fn settle(d: Duration) {
    if !d.is_zero() {
        thread::sleep(d);
    }
}
