//! Register map of the fine-delay core and the TDC chip.
//!
//! Addresses are byte offsets from the core base. Per-channel registers repeat
//! every [`CH_STRIDE`] bytes starting at [`CH_BASE`]; use [`ch_reg`] to address
//! them.

use fd_common::Channel;

/// Gateware identification value read from [`IDR`].
pub const IDR_MAGIC: u32 = 0xf19e_de1a;

/// Reset register.
pub const RSTR: u32 = 0x00;
/// Identification register.
pub const IDR: u32 = 0x04;
/// Global control register.
pub const GCR: u32 = 0x08;
/// Timing control register.
pub const TCR: u32 = 0x0C;
/// Time base seconds, high byte.
pub const TM_SECH: u32 = 0x10;
/// Time base seconds, low word.
pub const TM_SECL: u32 = 0x14;
/// Time base cycles.
pub const TM_CYCLES: u32 = 0x18;
/// TDC data register (host-driven bus).
pub const TDR: u32 = 0x1C;
/// TDC control/status register.
pub const TDCSR: u32 = 0x20;
/// Calibration register.
pub const CALR: u32 = 0x24;
/// TDC bin to internal timebase scale factor.
pub const ADSFR: u32 = 0x30;
/// TDC timestamp merging control.
pub const ATMCR: u32 = 0x34;
/// TDC start offset.
pub const ASOR: u32 = 0x38;
/// Timestamp buffer control.
pub const TSBCR: u32 = 0x50;
/// Timestamp buffer advance (pops the next entry into the TSBR registers).
pub const TSBR_ADVANCE: u32 = 0x54;
/// Buffered timestamp seconds, high byte.
pub const TSBR_SECH: u32 = 0x58;
/// Buffered timestamp seconds, low word.
pub const TSBR_SECL: u32 = 0x5C;
/// Buffered timestamp cycles (28 bits).
pub const TSBR_CYCLES: u32 = 0x60;
/// Buffered timestamp fine/channel/sequence word.
pub const TSBR_FID: u32 = 0x64;
/// Interrupt disable.
pub const EIC_IDR: u32 = 0x80;
/// Interrupt enable.
pub const EIC_IER: u32 = 0x84;
/// Interrupt mask.
pub const EIC_IMR: u32 = 0x88;
/// Interrupt status (write one to clear).
pub const EIC_ISR: u32 = 0x8C;

/// RSTR: write-unlock key, required in the upper half of every write.
pub const RSTR_UNLOCK: u32 = 0xdead << 16;
/// RSTR: FMC logic out of reset.
pub const RSTR_RST_FMC: u32 = 1 << 0;
/// RSTR: core logic out of reset.
pub const RSTR_RST_CORE: u32 = 1 << 1;

/// GCR: TDC bus driven by the host instead of the core.
pub const GCR_BYPASS: u32 = 1 << 0;
/// GCR: trigger input enabled.
pub const GCR_INPUT_EN: u32 = 1 << 1;
/// GCR: DDR PLL locked (read only).
pub const GCR_DDR_LOCKED: u32 = 1 << 2;
/// GCR: mezzanine present (read only).
pub const GCR_FMC_PRESENT: u32 = 1 << 3;

/// TCR: latch the running time into the TM registers.
pub const TCR_CAP_TIME: u32 = 1 << 6;
/// TCR: load the TM registers into the running time.
pub const TCR_SET_TIME: u32 = 1 << 7;

/// TDCSR: write TDR into the selected TDC register.
pub const TDCSR_WRITE: u32 = 1 << 0;
/// TDCSR: read the selected TDC register into TDR.
pub const TDCSR_READ: u32 = 1 << 1;
/// TDCSR: TDC FIFO empty.
pub const TDCSR_EMPTY: u32 = 1 << 2;
/// TDCSR: enable stop input.
pub const TDCSR_STOP_EN: u32 = 1 << 3;
/// TDCSR: disable start input.
pub const TDCSR_START_DIS: u32 = 1 << 4;
/// TDCSR: enable start input.
pub const TDCSR_START_EN: u32 = 1 << 5;
/// TDCSR: disable stop input.
pub const TDCSR_STOP_DIS: u32 = 1 << 6;
/// TDCSR: trigger an ALU conversion.
pub const TDCSR_ALUTRIG: u32 = 1 << 7;

/// CALR: emit one calibration pulse.
pub const CALR_CAL_PULSE: u32 = 1 << 0;

/// CALR: route the calibration pulse to the channels in `mask`.
#[must_use]
pub const fn calr_psel(mask: u32) -> u32 {
    (mask & 0xf) << 3
}

/// ADSFR value for G-mode: TDC bin to internal timebase scale.
pub const GMODE_ADSFR: u32 = 84_977;
/// ASOR value for G-mode, consistent with the TDC start offset.
pub const GMODE_ASOR: u32 = 17_000;
/// ATMCR value for G-mode: merge threshold and offset.
pub const GMODE_ATMCR: u32 = 26 | (1500 << 8);

/// TSBCR: buffer enabled.
pub const TSBCR_ENABLE: u32 = 1 << 5;
/// TSBCR: discard buffered timestamps.
pub const TSBCR_PURGE: u32 = 1 << 6;
/// TSBCR: restart sequence numbering.
pub const TSBCR_RST_SEQ: u32 = 1 << 7;
/// TSBCR: buffer empty (read only).
pub const TSBCR_EMPTY: u32 = 1 << 8;

/// TSBR_ADVANCE: pop the next entry.
pub const TSBR_ADVANCE_ADV: u32 = 1 << 0;

/// TSBR_FID: input channel field.
#[must_use]
pub const fn fid_channel(reg: u32) -> u8 {
    (reg & 0xf) as u8
}

/// TSBR_FID: fine (frac) field.
#[must_use]
pub const fn fid_fine(reg: u32) -> u16 {
    ((reg >> 4) & 0xfff) as u16
}

/// TSBR_FID: sequence id field.
#[must_use]
pub const fn fid_seq(reg: u32) -> u16 {
    (reg >> 16) as u16
}

/// Pack a TSBR_FID word.
#[must_use]
pub const fn fid_pack(channel: u8, fine: u16, seq: u16) -> u32 {
    (channel as u32 & 0xf) | ((fine as u32 & 0xfff) << 4) | ((seq as u32) << 16)
}

/// EIC: timestamp buffer not empty.
pub const EIC_TS_BUF_NOTEMPTY: u32 = 1 << 0;

/// First channel register block.
pub const CH_BASE: u32 = 0x100;
/// Distance between channel register blocks.
pub const CH_STRIDE: u32 = 0x100;

/// Delay control register.
pub const DCR: u32 = 0x00;
/// Fine range (delay-line tap) register.
pub const FRR: u32 = 0x04;
/// Pulse start, seconds high.
pub const U_STARTH: u32 = 0x08;
/// Pulse start, seconds low.
pub const U_STARTL: u32 = 0x0C;
/// Pulse start, cycles.
pub const C_START: u32 = 0x10;
/// Pulse start, fine.
pub const F_START: u32 = 0x14;
/// Pulse end, seconds high.
pub const U_ENDH: u32 = 0x18;
/// Pulse end, seconds low.
pub const U_ENDL: u32 = 0x1C;
/// Pulse end, cycles.
pub const C_END: u32 = 0x20;
/// Pulse end, fine.
pub const F_END: u32 = 0x24;
/// Pulse period, seconds.
pub const U_DELTA: u32 = 0x28;
/// Pulse period, cycles.
pub const C_DELTA: u32 = 0x2C;
/// Pulse period, fine.
pub const F_DELTA: u32 = 0x30;
/// Repeat count register.
pub const RCR: u32 = 0x34;

/// DCR: channel enabled.
pub const DCR_ENABLE: u32 = 1 << 0;
/// DCR: pulse generator mode (clear for delay mode).
pub const DCR_MODE: u32 = 1 << 1;
/// DCR: arm the pulse generator.
pub const DCR_PG_ARM: u32 = 1 << 2;
/// DCR: software trigger of the pulse generator.
pub const DCR_PG_TRIG: u32 = 1 << 3;
/// DCR: commit start/end/delta/FRR into the active set.
pub const DCR_UPDATE: u32 = 1 << 4;
/// DCR: update done (read only).
pub const DCR_UPD_DONE: u32 = 1 << 5;
/// DCR: force a delayed pulse for calibration.
pub const DCR_FORCE_DLY: u32 = 1 << 6;
/// DCR: bypass the fine delay line.
pub const DCR_NO_FINE: u32 = 1 << 7;
/// DCR: force the output high.
pub const DCR_FORCE_HI: u32 = 1 << 8;

/// RCR: continuous repetition.
pub const RCR_CONT: u32 = 1 << 16;

/// RCR: repeat count field (pulses minus one).
#[must_use]
pub const fn rcr_rep_cnt(v: u32) -> u32 {
    v & 0xffff
}

/// Address of a per-channel register.
#[must_use]
pub const fn ch_reg(ch: Channel, offset: u32) -> u32 {
    CH_BASE + ch.index() as u32 * CH_STRIDE + offset
}

/// Register fields of the TDC chip, reached indirectly through [`TDR`]/[`TDCSR`].
pub mod tdc {
    /// Data bus width mask.
    pub const MASK: u32 = (1 << 28) - 1;

    /// Register holding the FIFO head in I/G modes.
    pub const FIFO_ADDR: u8 = 8;
    /// Status register with the PLL lock bit.
    pub const STATUS_ADDR: u8 = 12;

    /// AR0: ring oscillator on.
    pub const AR0_ROSC: u32 = 1 << 0;
    /// AR0: rising edge enable, stop input 0.
    pub const AR0_RISE_EN0: u32 = 1 << 1;
    /// AR0: rising edge enable, stop input 1.
    pub const AR0_RISE_EN1: u32 = 1 << 3;
    /// AR0: high-quality mode select.
    pub const AR0_HQSEL: u32 = 1 << 7;

    /// AR0: rising edge enable for a TDC stop port.
    #[must_use]
    pub const fn ar0_trise_en(port: u32) -> u32 {
        1 << (10 + port)
    }

    /// AR1: per-channel adjust.
    #[must_use]
    pub const fn ar1_adj(chan: u32, value: u32) -> u32 {
        (value & 0xf) << (chan * 4)
    }

    /// AR2: G mode.
    pub const AR2_GMODE: u32 = 1 << 0;
    /// AR2: I mode.
    pub const AR2_IMODE: u32 = 1 << 1;
    /// AR2: R mode.
    pub const AR2_RMODE: u32 = 1 << 2;

    /// AR2: adjust for channels 7 and 8.
    #[must_use]
    pub const fn ar2_adj(chan: u32, value: u32) -> u32 {
        (value & 0xf) << (12 + 4 * (chan - 7))
    }

    /// AR3: transmission delay.
    #[must_use]
    pub const fn ar3_del_tx(chan: u32, value: u32) -> u32 {
        (value & 0x3) << (5 + (chan - 1) * 2)
    }

    /// AR3: ramp speed, channels 0..2.
    #[must_use]
    pub const fn ar3_ra_speed(chan: u32, value: u32) -> u32 {
        (value & 0x3) << (21 + chan * 2)
    }

    /// AR4: ramp speed, channels 3..8.
    #[must_use]
    pub const fn ar4_ra_speed(chan: u32, value: u32) -> u32 {
        (value & 0x3) << (10 + (chan - 3) * 2)
    }

    /// AR4: start timer.
    #[must_use]
    pub const fn ar4_start_timer(value: u32) -> u32 {
        value & 0xff
    }

    /// AR4: master reset.
    pub const AR4_MASTER_RESET: u32 = 1 << 22;
    /// AR4: error flag output not tri-stated.
    pub const AR4_EFLAG_HIZN: u32 = 1 << 25;

    /// AR5: start offset 1.
    #[must_use]
    pub const fn ar5_start_off1(value: u32) -> u32 {
        value & 0x3ffff
    }

    /// AR5: ALU trigger on master reset.
    pub const AR5_MASTER_ALU_TRIG: u32 = 1 << 23;
    /// AR5: start retrigger.
    pub const AR5_START_RETRIG: u32 = 1 << 27;

    /// AR6: FIFO fill level.
    #[must_use]
    pub const fn ar6_fill(value: u32) -> u32 {
        value & 0xff
    }

    /// AR6: start offset 2.
    #[must_use]
    pub const fn ar6_start_off2(value: u32) -> u32 {
        (value & 0x3ffff) << 8
    }

    /// AR6: ECL power on.
    pub const AR6_POWER_ON_ECL: u32 = 1 << 27;

    /// AR7: PLL high-speed divider.
    #[must_use]
    pub const fn ar7_hsdiv(value: u32) -> u32 {
        value & 0xff
    }

    /// AR7: PLL reference clock divider exponent.
    #[must_use]
    pub const fn ar7_refclkdiv(value: u32) -> u32 {
        (value & 0x7) << 8
    }

    /// AR7: resolution adjust.
    pub const AR7_RES_ADJ: u32 = 1 << 11;
    /// AR7: PLL negative phase.
    pub const AR7_NEG_PHASE: u32 = 1 << 12;

    /// AR8 in I mode: FIFO measurement field.
    #[must_use]
    pub const fn ar8i_ififo1(reg: u32) -> u32 {
        reg & 0x1ffff
    }

    /// AR12: PLL not locked.
    pub const AR12_NOT_LOCKED: u32 = 1 << 10;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_channel_register_addresses() {
        let ch3 = Channel::new(3).unwrap();
        assert_eq!(ch_reg(Channel::ALL[0], DCR), 0x100);
        assert_eq!(ch_reg(ch3, RCR), 0x434);
    }

    #[test]
    fn test_fid_fields() {
        let reg = fid_pack(2, 0xabc, 0x1234);
        assert_eq!(fid_channel(reg), 2);
        assert_eq!(fid_fine(reg), 0xabc);
        assert_eq!(fid_seq(reg), 0x1234);
    }

    #[test]
    fn test_tdc_fields() {
        assert_eq!(tdc::ar7_hsdiv(117) | tdc::ar7_refclkdiv(6), 0x675);
        assert_eq!(tdc::ar6_start_off2(10_000), 10_000 << 8);
        assert_eq!(tdc::ar8i_ififo1(0xfff_ffff), 0x1ffff);
    }
}
