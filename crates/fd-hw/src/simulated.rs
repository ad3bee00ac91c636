//! Behavioral model of the fine-delay card.
//!
//! [`SimulatedCard`] implements both [`RegisterAccess`] and
//! [`BoardPeripherals`], so the whole driver stack can run without hardware.
//! It models the register file, the TDC bus in bypass mode, the timestamp
//! FIFO, the time base, and per-channel delay lines measured through the TDC
//! calibration path. Fault switches let tests exercise the error paths.

use crate::regs::{self, tdc};
use crate::{pll, BoardPeripherals, RegisterAccess};
use fd_common::{
    pico_to_time, Channel, FdError, FdResult, RawSample, Temperature, TimeValue, CYCLES_PER_SECOND,
    NUM_CHANNELS,
};
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Instant;
use tracing::{debug, trace};

/// Number of dither steps applied to successive TDC measurements.
const DITHER_STEPS: u64 = 16;

/// Linear model of one output delay line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DelayLine {
    /// Delay at tap 0, picoseconds.
    pub bias_ps: u64,
    /// Added delay per tap, femtoseconds.
    pub step_fs: u64,
}

impl DelayLine {
    /// Delay at `tap`, picoseconds with 16 fractional bits.
    #[must_use]
    pub fn delay_fp(&self, tap: u16) -> u64 {
        let fs = self.bias_ps * 1000 + u64::from(tap) * self.step_fs;
        (fs << 16) / 1000
    }

    /// Largest tap whose added delay stays below one 8 ns cycle.
    #[must_use]
    pub fn quantum_tap(&self) -> u16 {
        let first_at_or_above = 8_000_000u64.div_ceil(self.step_fs.max(1));
        first_at_or_above.saturating_sub(1).min(u64::from(fd_common::MAX_TAP)) as u16
    }
}

#[derive(Debug)]
struct CardModel {
    regs: HashMap<u32, u32>,
    tdc_regs: [u32; 16],
    tdc_address: Option<u8>,
    fifo: VecDeque<RawSample>,
    next_seq: u16,
    outputs: [bool; NUM_CHANNELS],
    temperature: Temperature,
    thermometer_ok: bool,
    stuck_data_bits: u32,
    ignored_address_bit: Option<u8>,
    tdc_lockable: bool,
    ddr_lockable: bool,
    gateware_id: u32,
    delay_lines: [DelayLine; NUM_CHANNELS],
    mode_scale: u64,
    reference_period_fp: u64,
    conversions: u64,
    time_origin: (TimeValue, Instant),
}

impl CardModel {
    fn new() -> Self {
        Self {
            regs: HashMap::new(),
            tdc_regs: [0; 16],
            tdc_address: None,
            fifo: VecDeque::new(),
            next_seq: 0,
            outputs: [false; NUM_CHANNELS],
            temperature: Temperature::from_celsius(45),
            thermometer_ok: true,
            stuck_data_bits: 0,
            ignored_address_bit: None,
            tdc_lockable: true,
            ddr_lockable: true,
            gateware_id: regs::IDR_MAGIC,
            delay_lines: [
                DelayLine { bias_ps: 32_000, step_fs: 9_800 },
                DelayLine { bias_ps: 32_500, step_fs: 10_000 },
                DelayLine { bias_ps: 33_000, step_fs: 10_200 },
                DelayLine { bias_ps: 33_500, step_fs: 10_400 },
            ],
            mode_scale: 3,
            reference_period_fp: 32_000 << 16,
            conversions: 0,
            time_origin: (TimeValue::ZERO, Instant::now()),
        }
    }

    fn reg(&self, addr: u32) -> u32 {
        self.regs.get(&addr).copied().unwrap_or(0)
    }

    fn effective_tdc_address(&self) -> usize {
        let addr = self.tdc_address.unwrap_or(0);
        let addr = match self.ignored_address_bit {
            Some(bit) => addr & !(1 << bit),
            None => addr,
        };
        usize::from(addr & 0xf)
    }

    fn tdc_read(&self) -> u32 {
        let addr = self.effective_tdc_address();
        if addr == usize::from(tdc::STATUS_ADDR) {
            if self.tdc_lockable {
                0
            } else {
                tdc::AR12_NOT_LOCKED
            }
        } else {
            self.tdc_regs[addr]
        }
    }

    fn tdc_write(&mut self, value: u32) {
        let addr = self.effective_tdc_address();
        self.tdc_regs[addr] = value & tdc::MASK & !self.stuck_data_bits;
    }

    fn now(&self) -> TimeValue {
        let (base, at) = self.time_origin;
        let elapsed_ps = u64::try_from(at.elapsed().as_nanos())
            .unwrap_or(u64::MAX / 1000)
            .saturating_mul(1000);
        base.add(pico_to_time(elapsed_ps))
    }

    /// One calibration pulse through the delay line selected by CALR.
    fn measure(&mut self, psel: u32) {
        let Some(ch) = (0..NUM_CHANNELS).find(|i| psel & (1 << i) != 0) else {
            return;
        };
        let Ok(channel) = Channel::new(ch as u8) else {
            return;
        };
        let tap = (self.reg(regs::ch_reg(channel, regs::FRR)) & 0x3ff) as u16;
        let delay_fp = self.delay_lines[ch].delay_fp(tap);

        let r7 = self.tdc_regs[7];
        let hsdiv = r7 & 0xff;
        let refdiv = (r7 >> 8) & 0x7;
        if hsdiv == 0 {
            self.tdc_regs[usize::from(tdc::FIFO_ADDR)] = 0;
            return;
        }
        let bin_fp = pll::bin_for(self.reference_period_fp, hsdiv, refdiv);

        // counts with 16 fractional bits, then a stratified dither before truncation
        let counts_fp = (u128::from(delay_fp) << 16) / u128::from(bin_fp * self.mode_scale);
        let k = self.conversions % DITHER_STEPS;
        let dither = u128::from((2 * k + 1) << 16) / u128::from(2 * DITHER_STEPS);
        let raw = ((counts_fp + dither) >> 16) as u32;

        trace!(channel = ch, tap, raw, "simulated calibration pulse");
        self.tdc_regs[usize::from(tdc::FIFO_ADDR)] = tdc::ar8i_ififo1(raw);
    }

    fn write(&mut self, addr: u32, value: u32) {
        match addr {
            regs::TDCSR => {
                if value & regs::TDCSR_WRITE != 0 {
                    let data = self.reg(regs::TDR);
                    self.tdc_write(data);
                }
                if value & regs::TDCSR_READ != 0 {
                    let data = self.tdc_read();
                    self.regs.insert(regs::TDR, data);
                }
                if value & regs::TDCSR_ALUTRIG != 0 {
                    self.conversions += 1;
                }
                self.regs.insert(addr, value);
            }
            regs::TCR => {
                if value & regs::TCR_SET_TIME != 0 {
                    let utc = (i64::from(self.reg(regs::TM_SECH) & 0xff) << 32)
                        | i64::from(self.reg(regs::TM_SECL));
                    let cycles = self.reg(regs::TM_CYCLES) % CYCLES_PER_SECOND;
                    if let Ok(base) = TimeValue::new(utc, cycles, 0) {
                        self.time_origin = (base, Instant::now());
                    }
                }
                if value & regs::TCR_CAP_TIME != 0 {
                    let now = self.now();
                    self.regs
                        .insert(regs::TM_SECH, ((now.utc() >> 32) & 0xff) as u32);
                    self.regs.insert(regs::TM_SECL, now.utc() as u32);
                    self.regs.insert(regs::TM_CYCLES, now.coarse());
                }
                self.regs
                    .insert(addr, value & !(regs::TCR_SET_TIME | regs::TCR_CAP_TIME));
            }
            regs::TSBCR => {
                if value & regs::TSBCR_PURGE != 0 {
                    self.fifo.clear();
                }
                if value & regs::TSBCR_RST_SEQ != 0 {
                    self.next_seq = 0;
                }
                self.regs
                    .insert(addr, value & !(regs::TSBCR_PURGE | regs::TSBCR_RST_SEQ));
            }
            regs::TSBR_ADVANCE => {
                if value & regs::TSBR_ADVANCE_ADV != 0 {
                    if let Some(s) = self.fifo.pop_front() {
                        self.regs
                            .insert(regs::TSBR_SECH, ((s.utc >> 32) & 0xff) as u32);
                        self.regs.insert(regs::TSBR_SECL, s.utc as u32);
                        self.regs.insert(regs::TSBR_CYCLES, s.coarse & 0x0fff_ffff);
                        self.regs
                            .insert(regs::TSBR_FID, regs::fid_pack(s.channel, s.frac, s.seq));
                    }
                }
            }
            regs::CALR => {
                if value & regs::CALR_CAL_PULSE != 0 {
                    self.measure((value >> 3) & 0xf);
                }
                self.regs.insert(addr, value & !regs::CALR_CAL_PULSE);
            }
            regs::EIC_IER => {
                let imr = self.reg(regs::EIC_IMR) | value;
                self.regs.insert(regs::EIC_IMR, imr);
            }
            regs::EIC_IDR => {
                let imr = self.reg(regs::EIC_IMR) & !value;
                self.regs.insert(regs::EIC_IMR, imr);
            }
            regs::EIC_ISR => {}
            regs::GCR => {
                self.regs
                    .insert(addr, value & !(regs::GCR_DDR_LOCKED | regs::GCR_FMC_PRESENT));
            }
            _ => {
                self.regs.insert(addr, value);
            }
        }
    }

    fn read(&self, addr: u32) -> u32 {
        match addr {
            regs::IDR => self.gateware_id,
            regs::GCR => {
                let mut v = self.reg(addr) | regs::GCR_FMC_PRESENT;
                if self.ddr_lockable {
                    v |= regs::GCR_DDR_LOCKED;
                }
                v
            }
            regs::TSBCR => {
                let mut v = self.reg(addr);
                if self.fifo.is_empty() {
                    v |= regs::TSBCR_EMPTY;
                }
                v
            }
            regs::EIC_ISR => {
                if self.fifo.is_empty() {
                    0
                } else {
                    regs::EIC_TS_BUF_NOTEMPTY
                }
            }
            _ => self.reg(addr),
        }
    }
}

/// Simulated fine-delay card for testing.
///
/// Cloning yields another handle to the same card.
#[derive(Debug, Clone)]
pub struct SimulatedCard {
    inner: Arc<Mutex<CardModel>>,
}

impl Default for SimulatedCard {
    fn default() -> Self {
        Self::new()
    }
}

impl SimulatedCard {
    /// A healthy card at 45 C with four distinct delay lines.
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(CardModel::new())),
        }
    }

    fn model(&self) -> MutexGuard<'_, CardModel> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Stored value of a core register, without read side effects.
    #[must_use]
    pub fn register(&self, addr: u32) -> u32 {
        self.model().reg(addr)
    }

    /// Contents of a TDC register.
    #[must_use]
    pub fn tdc_register(&self, reg: u8) -> u32 {
        self.model().tdc_regs[usize::from(reg & 0xf)]
    }

    /// Address currently driven on the TDC bus.
    #[must_use]
    pub fn tdc_address(&self) -> Option<u8> {
        self.model().tdc_address
    }

    /// Queue a raw sample in the hardware FIFO.
    pub fn push_raw(&self, sample: RawSample) {
        self.model().fifo.push_back(sample);
    }

    /// Timestamp an input edge at `t`, assigning the next sequence id.
    pub fn inject_edge(&self, channel: u8, t: TimeValue) -> u16 {
        let mut m = self.model();
        let seq = m.next_seq;
        m.next_seq = m.next_seq.wrapping_add(1);
        m.fifo.push_back(RawSample {
            utc: t.utc(),
            coarse: t.coarse(),
            frac: t.frac(),
            channel,
            seq,
        });
        seq
    }

    /// Burn `n` sequence ids, as if the hardware lost those edges.
    pub fn skip_sequence(&self, n: u16) {
        let mut m = self.model();
        m.next_seq = m.next_seq.wrapping_add(n);
    }

    /// Samples waiting in the hardware FIFO.
    #[must_use]
    pub fn fifo_len(&self) -> usize {
        self.model().fifo.len()
    }

    /// Set the thermometer reading.
    pub fn set_temperature(&self, t: Temperature) {
        self.model().temperature = t;
    }

    /// Make the thermometer stop answering.
    pub fn set_thermometer_ok(&self, ok: bool) {
        self.model().thermometer_ok = ok;
    }

    /// Force TDC data lines low.
    pub fn set_stuck_data_bits(&self, mask: u32) {
        self.model().stuck_data_bits = mask;
    }

    /// Disconnect one TDC address line.
    pub fn set_ignored_address_bit(&self, bit: Option<u8>) {
        self.model().ignored_address_bit = bit;
    }

    /// Whether the TDC PLL can reach lock.
    pub fn set_tdc_lockable(&self, lockable: bool) {
        self.model().tdc_lockable = lockable;
    }

    /// Whether the DDR PLL can reach lock.
    pub fn set_ddr_lockable(&self, lockable: bool) {
        self.model().ddr_lockable = lockable;
    }

    /// Value returned by the identification register.
    pub fn set_gateware_id(&self, id: u32) {
        self.model().gateware_id = id;
    }

    /// Replace the delay line model of `ch`.
    pub fn set_delay_line(&self, ch: Channel, line: DelayLine) {
        self.model().delay_lines[ch.index()] = line;
    }

    /// Delay line model of `ch`.
    #[must_use]
    pub fn delay_line(&self, ch: Channel) -> DelayLine {
        self.model().delay_lines[ch.index()]
    }

    /// Whether the output buffer of `ch` is driven.
    #[must_use]
    pub fn output_enabled(&self, ch: Channel) -> bool {
        self.model().outputs[ch.index()]
    }

    /// Level of the timestamp-buffer interrupt line.
    #[must_use]
    pub fn interrupt_pending(&self) -> bool {
        let m = self.model();
        m.reg(regs::EIC_IMR) & regs::EIC_TS_BUF_NOTEMPTY != 0 && !m.fifo.is_empty()
    }

    /// TDC conversions triggered so far.
    #[must_use]
    pub fn conversions(&self) -> u64 {
        self.model().conversions
    }
}

impl RegisterAccess for SimulatedCard {
    fn read32(&self, addr: u32) -> u32 {
        self.model().read(addr)
    }

    fn write32(&self, addr: u32, value: u32) {
        self.model().write(addr, value);
    }
}

impl BoardPeripherals for SimulatedCard {
    fn set_output_enabled(&self, ch: Channel, enabled: bool) {
        debug!(channel = %ch, enabled, "simulated output driver");
        self.model().outputs[ch.index()] = enabled;
    }

    fn select_tdc_address(&self, addr: u8) {
        self.model().tdc_address = Some(addr);
    }

    fn read_temperature(&self) -> FdResult<Temperature> {
        let m = self.model();
        if m.thermometer_ok {
            Ok(m.temperature)
        } else {
            Err(FdError::HardwareFault("thermometer not responding".into()))
        }
    }
}
