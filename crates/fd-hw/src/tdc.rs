//! Time-to-digital converter access.
//!
//! The TDC sits on a private bus. While [`regs::GCR_BYPASS`] is set the host
//! drives it: the register address goes out through the peripherals
//! collaborator, data moves through [`regs::TDR`], and [`regs::TDCSR`] strobes
//! the transfer.

use crate::pll::{self, PllSolution};
use crate::regs::{self, tdc};
use crate::{poll_until, settle, BoardPeripherals, RegisterAccess};
use fd_common::{FdError, FdResult, TdcConfig};
use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};
use tracing::{debug, error, info};

/// TDC operating mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TdcMode {
    /// Interval mode, used to measure output delays during calibration.
    I,
    /// Resolution mode.
    R,
    /// Timestamping mode used in normal operation.
    G,
}

impl fmt::Display for TdcMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::I => write!(f, "I"),
            Self::R => write!(f, "R"),
            Self::G => write!(f, "G"),
        }
    }
}

/// Static register setup per mode. Register 7 gets the PLL divisors merged in
/// and registers 5/6 the start offsets.
const IMODE_TABLE: &[(u8, u32)] = &[
    (0, tdc::ar0_trise_en(0) | tdc::AR0_HQSEL | tdc::AR0_ROSC),
    (2, tdc::AR2_IMODE),
    (5, tdc::ar5_start_off1(3000) | tdc::AR5_MASTER_ALU_TRIG),
    (6, 0),
    (7, tdc::AR7_RES_ADJ | tdc::AR7_NEG_PHASE),
    (11, 0x7ff_0000),
    (12, 0),
    (14, 0),
    (4, tdc::AR4_EFLAG_HIZN | tdc::AR4_MASTER_RESET | tdc::ar4_start_timer(0)),
];

const RMODE_TABLE: &[(u8, u32)] = &[
    (0, tdc::AR0_ROSC | tdc::AR0_RISE_EN0 | tdc::AR0_RISE_EN1 | tdc::AR0_HQSEL),
    (
        1,
        tdc::ar1_adj(0, 0)
            | tdc::ar1_adj(1, 2)
            | tdc::ar1_adj(2, 6)
            | tdc::ar1_adj(3, 0)
            | tdc::ar1_adj(4, 2)
            | tdc::ar1_adj(5, 6)
            | tdc::ar1_adj(6, 0),
    ),
    (2, tdc::AR2_RMODE | tdc::ar2_adj(7, 2) | tdc::ar2_adj(8, 6)),
    (3, 0),
    (4, tdc::AR4_EFLAG_HIZN),
    (5, tdc::AR5_START_RETRIG | tdc::AR5_MASTER_ALU_TRIG),
    (6, tdc::ar6_fill(200) | tdc::AR6_POWER_ON_ECL),
    (7, tdc::AR7_RES_ADJ | tdc::AR7_NEG_PHASE),
    (11, 0x7ff_0000),
    (12, 0),
    (14, 0),
    (4, tdc::AR4_EFLAG_HIZN | tdc::AR4_MASTER_RESET | tdc::ar4_start_timer(0)),
];

const GMODE_TABLE: &[(u8, u32)] = &[
    (0, tdc::AR0_ROSC | tdc::AR0_RISE_EN0 | tdc::AR0_RISE_EN1 | tdc::AR0_HQSEL),
    (
        1,
        tdc::ar1_adj(0, 0)
            | tdc::ar1_adj(1, 0)
            | tdc::ar1_adj(2, 5)
            | tdc::ar1_adj(3, 0)
            | tdc::ar1_adj(4, 5)
            | tdc::ar1_adj(5, 0)
            | tdc::ar1_adj(6, 5),
    ),
    (2, tdc::AR2_GMODE | tdc::ar2_adj(7, 0) | tdc::ar2_adj(8, 5)),
    (
        3,
        tdc::ar3_del_tx(1, 3)
            | tdc::ar3_del_tx(2, 3)
            | tdc::ar3_del_tx(3, 3)
            | tdc::ar3_del_tx(4, 3)
            | tdc::ar3_del_tx(5, 3)
            | tdc::ar3_del_tx(6, 3)
            | tdc::ar3_del_tx(7, 3)
            | tdc::ar3_del_tx(8, 3)
            | tdc::ar3_ra_speed(0, 3)
            | tdc::ar3_ra_speed(1, 3)
            | tdc::ar3_ra_speed(2, 3),
    ),
    (
        4,
        tdc::AR4_EFLAG_HIZN
            | tdc::ar4_ra_speed(3, 3)
            | tdc::ar4_ra_speed(4, 3)
            | tdc::ar4_ra_speed(5, 3)
            | tdc::ar4_ra_speed(6, 3)
            | tdc::ar4_ra_speed(7, 3)
            | tdc::ar4_ra_speed(8, 3),
    ),
    (5, tdc::AR5_START_RETRIG | tdc::AR5_MASTER_ALU_TRIG),
    (6, tdc::ar6_fill(200) | tdc::AR6_POWER_ON_ECL),
    (7, tdc::AR7_RES_ADJ | tdc::AR7_NEG_PHASE),
    (11, 0x7ff_0000),
    (12, 0),
    (14, 0),
    (4, tdc::AR4_EFLAG_HIZN | tdc::AR4_MASTER_RESET | tdc::ar4_start_timer(0)),
];

impl TdcMode {
    fn table(self) -> &'static [(u8, u32)] {
        match self {
            Self::I => IMODE_TABLE,
            Self::R => RMODE_TABLE,
            Self::G => GMODE_TABLE,
        }
    }

    /// Runtime bits merged into a table entry.
    fn runtime_bits(self, addr: u8, pll: &PllSolution, start_offset: u32) -> u32 {
        match (addr, self) {
            (7, _) => pll.register_bits(),
            (5, Self::R | Self::G) => tdc::ar5_start_off1(start_offset),
            (6, Self::G) => tdc::ar6_start_off2(start_offset),
            _ => 0,
        }
    }
}

/// Address pairs and data bit used to detect shorted or open address lines.
const ADDRESS_LINE_TESTS: [(u8, u8, u32); 4] = [
    (0, 0, 0x00_0001),
    (1, 1, 0x00_0008),
    (0, 2, 0x00_0001),
    (3, 3, 0x01_0000),
];

/// Register used for the data-line walk.
const DATA_TEST_ADDR: u8 = 5;

/// Host-side driver for the TDC chip.
pub struct Tdc {
    regs: Arc<dyn RegisterAccess>,
    peripherals: Arc<dyn BoardPeripherals>,
    /// Last address put on the bus, to skip redundant selects.
    address: Mutex<Option<u8>>,
}

impl fmt::Debug for Tdc {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Tdc")
            .field("address", &self.current_address())
            .finish_non_exhaustive()
    }
}

impl Tdc {
    /// Create a driver over the card's register window and peripherals.
    pub fn new(regs: Arc<dyn RegisterAccess>, peripherals: Arc<dyn BoardPeripherals>) -> Self {
        Self {
            regs,
            peripherals,
            address: Mutex::new(None),
        }
    }

    fn current_address(&self) -> Option<u8> {
        *self.address.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn select(&self, addr: u8) {
        let mut cur = self.address.lock().unwrap_or_else(PoisonError::into_inner);
        if *cur != Some(addr) {
            self.peripherals.select_tdc_address(addr);
            *cur = Some(addr);
        }
    }

    /// Hand the TDC bus to the host (`true`) or to the core (`false`).
    ///
    /// Overwrites GCR, so the trigger input is disabled as a side effect.
    pub fn set_bypass(&self, on: bool) {
        self.regs
            .write32(regs::GCR, if on { regs::GCR_BYPASS } else { 0 });
    }

    /// Read TDC register `reg`. Only valid in bypass mode.
    pub fn read(&self, reg: u8) -> u32 {
        self.select(reg);
        self.regs.write32(regs::TDCSR, regs::TDCSR_READ);
        self.regs.read32(regs::TDR) & tdc::MASK
    }

    /// Write TDC register `reg`. Only valid in bypass mode.
    pub fn write(&self, reg: u8, value: u32) {
        self.select(reg);
        self.regs.write32(regs::TDR, value & tdc::MASK);
        self.regs.write32(regs::TDCSR, regs::TDCSR_WRITE);
    }

    /// True once the TDC PLL reports lock.
    pub fn is_pll_locked(&self) -> bool {
        self.read(tdc::STATUS_ADDR) & tdc::AR12_NOT_LOCKED == 0
    }

    /// Select the FIFO register for subsequent measurement reads.
    pub fn select_fifo(&self) {
        self.select(tdc::FIFO_ADDR);
    }

    /// Verify the data and address lines of the TDC bus.
    ///
    /// # Errors
    ///
    /// Returns [`FdError::HardwareFault`] naming the first failing line.
    pub fn test_bus(&self) -> FdResult<()> {
        for bit in 0..28 {
            let ones = 1u32 << bit;
            let zeros = !ones & tdc::MASK;
            for pattern in [ones, zeros] {
                self.write(DATA_TEST_ADDR, pattern);
                // touch another register so a floating bus cannot echo the value
                self.read(0);
                let got = self.read(DATA_TEST_ADDR);
                if got != pattern {
                    error!(pattern, got, "TDC data line failure");
                    return Err(FdError::HardwareFault(format!(
                        "TDC data bit {ones:#08x} failure"
                    )));
                }
            }
        }

        for (base, bit, data) in ADDRESS_LINE_TESTS {
            if !self.address_line_ok(base, bit, data) {
                error!(bit, "TDC address line failure");
                return Err(FdError::HardwareFault(format!(
                    "TDC address bit {bit} failure"
                )));
            }
        }
        debug!("TDC bus self-test passed");
        Ok(())
    }

    /// Check that `base` and `base + (1 << bit)` are distinct registers.
    fn address_line_ok(&self, base: u8, bit: u8, data: u32) -> bool {
        let a = base;
        let b = base + (1 << bit);
        for (lo, hi) in [(a, b), (b, a)] {
            let v = self.read(lo) & !data;
            self.write(lo, v);
            let v = self.read(hi) | data;
            self.write(hi, v);
            if self.read(lo) & data != 0 || self.read(hi) & data != data {
                return false;
            }
        }
        true
    }

    /// Program the TDC for `mode` and wait for its PLL to lock.
    ///
    /// # Errors
    ///
    /// Returns [`FdError::Config`] if the PLL parameters cannot be solved and
    /// [`FdError::HardwareFault`] if lock is not reached in time.
    pub fn configure(&self, mode: TdcMode, config: &TdcConfig) -> FdResult<PllSolution> {
        let pll = pll::solve(
            config.reference_period_fp(),
            config.desired_bin_fp(),
            config.max_refdiv,
        )?;
        debug!(
            %mode,
            hsdiv = pll.hsdiv,
            refdiv = pll.refdiv,
            bin_fp = pll.bin_fp,
            "configuring TDC"
        );

        self.regs
            .write32(regs::TDCSR, regs::TDCSR_STOP_DIS | regs::TDCSR_START_DIS);

        // cycle the PLL off and on
        self.write(0, 0);
        self.write(0, 7);
        settle(config.reset_settle);

        for &(addr, value) in mode.table() {
            let value = value | mode.runtime_bits(addr, &pll, config.start_offset);
            self.write(addr, value);
        }

        poll_until(
            "TDC PLL lock",
            config.lock_timeout,
            config.lock_poll,
            || self.is_pll_locked(),
        )
        .map_err(|e| {
            error!(%mode, "TDC PLL does not lock");
            e.into_hardware_fault()
        })?;

        self.select_fifo();
        info!(%mode, bin_ps = pll.bin_ps(), "TDC configured");
        Ok(pll)
    }
}
