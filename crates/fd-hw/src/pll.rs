//! TDC PLL divisor solver.
//!
//! In I-mode the TDC bin is `Tbin = (Tref << refdiv) / (216 * hsdiv)`. Given a
//! reference period and a desired bin, the solver starts from the largest
//! refdiv for resolution, rounds hsdiv, then shifts common factors of two out
//! of the pair so the PLL runs at the lowest quotient.
//!
//! All quantities are picoseconds with 16 fractional bits.

use fd_common::{FdError, FdResult};
use serde::Serialize;

/// Fixed divider between the PLL output and the delay-line bin.
const BIN_DIVIDER: u64 = 216;

/// Largest value of the 8-bit HSDIV field.
const HSDIV_MAX: u64 = 0xff;

/// Divisor pair and the bin it produces.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PllSolution {
    /// High-speed divider.
    pub hsdiv: u32,
    /// Reference divider exponent.
    pub refdiv: u32,
    /// Achieved I-mode bin, ps with 16 fractional bits.
    pub bin_fp: u64,
}

impl PllSolution {
    /// Achieved bin in picoseconds.
    #[must_use]
    pub fn bin_ps(&self) -> f64 {
        self.bin_fp as f64 / 65536.0
    }

    /// Value of TDC register 7's divider fields.
    #[must_use]
    pub fn register_bits(&self) -> u32 {
        crate::regs::tdc::ar7_hsdiv(self.hsdiv) | crate::regs::tdc::ar7_refclkdiv(self.refdiv)
    }
}

/// Solve the divisor pair for `reference_period_fp` and `desired_bin_fp`.
///
/// # Errors
///
/// Returns [`FdError::Config`] for zero inputs, a refdiv above 7, or a pair
/// that does not fit the 8-bit HSDIV field.
pub fn solve(
    reference_period_fp: u64,
    desired_bin_fp: u64,
    max_refdiv: u8,
) -> FdResult<PllSolution> {
    if reference_period_fp == 0 || desired_bin_fp == 0 {
        return Err(FdError::Config(
            "PLL reference period and bin must be non-zero".into(),
        ));
    }
    if max_refdiv > 7 {
        return Err(FdError::Config(format!("refdiv {max_refdiv} exceeds 7")));
    }

    let scaled = reference_period_fp
        .checked_mul(1 << 16)
        .ok_or_else(|| FdError::Config("PLL reference period too large".into()))?;
    let x = scaled / BIN_DIVIDER / desired_bin_fp;

    let mut refdiv = u32::from(max_refdiv);
    let shifted = x << refdiv;
    let mut hsdiv = shifted >> 16;
    if shifted & (1 << 15) != 0 {
        hsdiv += 1;
    }
    if hsdiv == 0 {
        return Err(FdError::Config(format!(
            "desired bin {desired_bin_fp:#x} too wide for reference {reference_period_fp:#x}"
        )));
    }

    while refdiv > 0 && hsdiv & 1 == 0 {
        refdiv -= 1;
        hsdiv >>= 1;
    }
    if hsdiv > HSDIV_MAX {
        return Err(FdError::Config(format!(
            "hsdiv {hsdiv} does not fit the 8-bit field"
        )));
    }

    Ok(PllSolution {
        hsdiv: hsdiv as u32,
        refdiv,
        bin_fp: bin_for(reference_period_fp, hsdiv as u32, refdiv),
    })
}

/// Bin produced by a given divisor pair, rounded up by one LSB.
#[must_use]
pub fn bin_for(reference_period_fp: u64, hsdiv: u32, refdiv: u32) -> u64 {
    (reference_period_fp << refdiv) / BIN_DIVIDER / u64::from(hsdiv.max(1)) + 1
}
