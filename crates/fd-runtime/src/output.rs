//! Output pulse programming.
//!
//! A [`PulseConfig`] describes one channel's output: a single delayed pulse
//! relative to a trigger (delay mode) or a train of pulses at absolute board
//! time (pulse mode). Programming it applies the board offsets and writes the
//! channel's start, end, period, repeat and control registers.

use crate::calibrator::CalibrationLock;
use fd_common::{pico_to_time, Channel, FdError, FdResult, OffsetConfig, TimeValue, NUM_CHANNELS};
use fd_hw::regs;
use fd_hw::{BoardPeripherals, RegisterAccess};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use tracing::{debug, info};

/// Pulses narrower than this, or closer together, bypass the fine delay.
pub const NO_FINE_THRESHOLD_PS: i128 = 200_000;

/// Largest finite repeat count.
pub const MAX_REPEAT: i32 = 65_536;

/// What a channel does.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputMode {
    /// Output driver off.
    #[default]
    Disabled,
    /// Pulse(s) delayed from each input trigger.
    Delay,
    /// Pulse train at absolute board time.
    Pulse,
}

/// Output configuration of one channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PulseConfig {
    /// Operating mode.
    pub mode: OutputMode,
    /// Number of pulses, or -1 for a continuous train.
    pub repeat: i32,
    /// Rising edge (delay from trigger, or absolute time).
    pub start: TimeValue,
    /// Falling edge.
    pub end: TimeValue,
    /// Rising edge to rising edge.
    pub period: TimeValue,
}

impl PulseConfig {
    /// Configuration that switches the output off.
    #[must_use]
    pub const fn disabled() -> Self {
        Self {
            mode: OutputMode::Disabled,
            repeat: 1,
            start: TimeValue::ZERO,
            end: TimeValue::ZERO,
            period: TimeValue::ZERO,
        }
    }

    /// Build a configuration from a start time, a width and a period in
    /// picoseconds.
    ///
    /// # Errors
    ///
    /// Returns [`FdError::Config`] if the result does not validate.
    pub fn from_width_and_period(
        mode: OutputMode,
        start: TimeValue,
        width_ps: u64,
        period_ps: u64,
        repeat: i32,
    ) -> FdResult<Self> {
        let cfg = Self {
            mode,
            repeat,
            start,
            end: start.add(pico_to_time(width_ps)),
            period: pico_to_time(period_ps),
        };
        cfg.validate()?;
        Ok(cfg)
    }

    /// Check edge ordering and repeat range.
    ///
    /// # Errors
    ///
    /// Returns [`FdError::Config`] describing the first problem.
    pub fn validate(&self) -> FdResult<()> {
        if self.mode == OutputMode::Disabled {
            return Ok(());
        }
        if self.end.to_picos() < self.start.to_picos() {
            return Err(FdError::Config(format!(
                "pulse end {} before start {}",
                self.end, self.start
            )));
        }
        if self.repeat != -1 && !(1..=MAX_REPEAT).contains(&self.repeat) {
            return Err(FdError::Config(format!(
                "repeat {} not -1 or in 1..={MAX_REPEAT}",
                self.repeat
            )));
        }
        Ok(())
    }

    /// Pulse width in picoseconds.
    #[must_use]
    pub fn width_ps(&self) -> i128 {
        self.end.to_picos() - self.start.to_picos()
    }

    /// Whether the pulses are too narrow or too dense for the fine delay.
    #[must_use]
    pub fn needs_no_fine(&self) -> bool {
        let width = self.width_ps();
        let gap = self.period.to_picos() - width;
        width < NO_FINE_THRESHOLD_PS || gap < NO_FINE_THRESHOLD_PS
    }
}

/// Writes pulse configurations into the channel registers.
pub struct OutputProgrammer {
    regs: Arc<dyn RegisterAccess>,
    peripherals: Arc<dyn BoardPeripherals>,
    lock: Arc<CalibrationLock>,
    tdc_zero_ps: i64,
    channel_zero_ps: [i64; NUM_CHANNELS],
    channel_user_ps: [AtomicI64; NUM_CHANNELS],
}

impl std::fmt::Debug for OutputProgrammer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OutputProgrammer")
            .field("tdc_zero_ps", &self.tdc_zero_ps)
            .field("channel_zero_ps", &self.channel_zero_ps)
            .finish_non_exhaustive()
    }
}

impl OutputProgrammer {
    /// Create a programmer reading the compensated taps from `lock`.
    pub fn new(
        regs: Arc<dyn RegisterAccess>,
        peripherals: Arc<dyn BoardPeripherals>,
        lock: Arc<CalibrationLock>,
        offsets: &OffsetConfig,
    ) -> Self {
        Self {
            regs,
            peripherals,
            lock,
            tdc_zero_ps: offsets.tdc_zero_ps,
            channel_zero_ps: offsets.channel_zero_ps,
            channel_user_ps: offsets.channel_user_ps.map(AtomicI64::new),
        }
    }

    /// Set the user offset of `ch`, applied from the next `configure`.
    pub fn set_user_offset(&self, ch: Channel, ps: i64) {
        self.channel_user_ps[ch.index()].store(ps, Ordering::Relaxed);
    }

    /// User offset of `ch`.
    pub fn user_offset(&self, ch: Channel) -> i64 {
        self.channel_user_ps[ch.index()].load(Ordering::Relaxed)
    }

    fn write(&self, ch: Channel, offset: u32, value: u32) {
        self.regs.write32(regs::ch_reg(ch, offset), value);
    }

    fn write_time(&self, ch: Channel, base: u32, t: TimeValue) {
        // U_xH, U_xL, C_x and F_x are consecutive
        self.write(ch, base, ((t.utc() >> 32) & 0xff) as u32);
        self.write(ch, base + 0x4, t.utc() as u32);
        self.write(ch, base + 0x8, t.coarse());
        self.write(ch, base + 0xC, u32::from(t.frac()));
    }

    /// Program `ch` according to `cfg`.
    ///
    /// # Errors
    ///
    /// Returns [`FdError::Config`] if `cfg` does not validate; nothing is
    /// written in that case.
    pub fn configure(&self, ch: Channel, cfg: &PulseConfig) -> FdResult<()> {
        cfg.validate()?;

        if cfg.mode == OutputMode::Disabled {
            self.peripherals.set_output_enabled(ch, false);
            info!(channel = %ch, "output disabled");
            return Ok(());
        }

        let mut start = cfg.start;
        let mut end = cfg.end;
        if cfg.mode == OutputMode::Delay {
            start = start.apply_offset(self.tdc_zero_ps);
            end = end.apply_offset(self.tdc_zero_ps);
        }
        let channel_offset = [self.channel_zero_ps[ch.index()], self.user_offset(ch)];
        for ps in channel_offset {
            start = start.apply_offset(ps);
            end = end.apply_offset(ps);
        }

        // FRR belongs to whoever holds the calibration lock
        let table = self.lock.lock();
        let tap = table.get(ch).current_tap.unwrap_or(0);
        self.write(ch, regs::FRR, u32::from(tap));
        drop(table);
        self.write_time(ch, regs::U_STARTH, start);
        self.write_time(ch, regs::U_ENDH, end);
        self.write(ch, regs::U_DELTA, cfg.period.utc() as u32);
        self.write(ch, regs::C_DELTA, cfg.period.coarse());
        self.write(ch, regs::F_DELTA, u32::from(cfg.period.frac()));

        let continuous = cfg.repeat < 0;
        let count = if continuous { 0 } else { (cfg.repeat - 1) as u32 };
        let rcr = regs::rcr_rep_cnt(count) | if continuous { regs::RCR_CONT } else { 0 };
        self.write(ch, regs::RCR, rcr);

        let mut dcr = if cfg.mode == OutputMode::Pulse {
            regs::DCR_MODE
        } else {
            0
        };
        if cfg.needs_no_fine() {
            dcr |= regs::DCR_NO_FINE;
        }
        self.write(ch, regs::DCR, dcr);
        self.write(ch, regs::DCR, dcr | regs::DCR_UPDATE);
        self.write(ch, regs::DCR, dcr | regs::DCR_ENABLE);
        if cfg.mode == OutputMode::Pulse {
            self.write(ch, regs::DCR, dcr | regs::DCR_ENABLE | regs::DCR_PG_ARM);
        }
        self.peripherals.set_output_enabled(ch, true);

        debug!(channel = %ch, %start, %end, tap, rcr, dcr, "output registers written");
        info!(channel = %ch, mode = ?cfg.mode, repeat = cfg.repeat, "output configured");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::calibrator::CalibrationResult;
    use crate::compensator::{CompensationOutcome, SkipReason, TemperatureCompensator};
    use fd_common::{CalibrationPolynomial, Temperature};
    use fd_hw::SimulatedCard;
    use std::sync::Mutex;
    use std::time::Duration;

    fn programmer(card: &SimulatedCard, offsets: &OffsetConfig) -> OutputProgrammer {
        OutputProgrammer::new(
            Arc::new(card.clone()),
            Arc::new(card.clone()),
            Arc::new(CalibrationLock::new()),
            offsets,
        )
    }

    fn reg(card: &SimulatedCard, ch: Channel, offset: u32) -> u32 {
        card.register(regs::ch_reg(ch, offset))
    }

    fn pulse(start: TimeValue, width_ps: u64, period_ps: u64, repeat: i32) -> PulseConfig {
        PulseConfig::from_width_and_period(OutputMode::Pulse, start, width_ps, period_ps, repeat)
            .unwrap()
    }

    #[test]
    fn test_validate() {
        let start = TimeValue::from_secs(10);
        let ok = pulse(start, 1_000_000, 2_000_000, 5);

        let mut bad = ok;
        bad.end = TimeValue::from_secs(9);
        assert!(matches!(bad.validate(), Err(FdError::Config(_))));

        for repeat in [0, -2, MAX_REPEAT + 1] {
            let cfg = PulseConfig { repeat, ..ok };
            assert!(cfg.validate().is_err(), "repeat {repeat}");
        }
        for repeat in [-1, 1, MAX_REPEAT] {
            let cfg = PulseConfig { repeat, ..ok };
            assert!(cfg.validate().is_ok(), "repeat {repeat}");
        }
        // disabled ignores the other fields
        assert!(PulseConfig { repeat: 0, ..PulseConfig::disabled() }.validate().is_ok());
    }

    #[test]
    fn test_no_fine_threshold() {
        let start = TimeValue::ZERO;
        let wide = pulse(start, 400_000, 1_000_000, 1);
        assert!(!wide.needs_no_fine());
        let narrow = pulse(start, 100_000, 1_000_000, 1);
        assert!(narrow.needs_no_fine());
        let dense = pulse(start, 900_000, 1_000_000, 1);
        assert!(dense.needs_no_fine());
    }

    #[test]
    fn test_pulse_mode_registers() {
        let card = SimulatedCard::new();
        let out = programmer(&card, &OffsetConfig::default());
        let ch = Channel::ALL[2];
        let start = TimeValue::new(0x1_0000_0002, 1000, 7).unwrap();
        let cfg = pulse(start, 800_000, 2_000_000, 10);

        out.configure(ch, &cfg).unwrap();

        assert_eq!(reg(&card, ch, regs::U_STARTH), 1);
        assert_eq!(reg(&card, ch, regs::U_STARTL), 2);
        assert_eq!(reg(&card, ch, regs::C_START), 1000);
        assert_eq!(reg(&card, ch, regs::F_START), 7);
        assert_eq!(reg(&card, ch, regs::C_END), 1100);
        assert_eq!(reg(&card, ch, regs::C_DELTA), 250);
        assert_eq!(reg(&card, ch, regs::RCR), 9);
        assert_eq!(
            reg(&card, ch, regs::DCR),
            regs::DCR_MODE | regs::DCR_ENABLE | regs::DCR_PG_ARM
        );
        assert!(card.output_enabled(ch));
    }

    #[test]
    fn test_delay_mode_applies_all_offsets() {
        let card = SimulatedCard::new();
        let mut offsets = OffsetConfig::default();
        offsets.tdc_zero_ps = 8_000;
        offsets.channel_zero_ps[0] = 16_000;
        let out = programmer(&card, &offsets);
        let ch = Channel::ALL[0];
        out.set_user_offset(ch, 24_000);

        let cfg = PulseConfig::from_width_and_period(
            OutputMode::Delay,
            TimeValue::new(0, 100, 0).unwrap(),
            1_000_000,
            0,
            -1,
        )
        .unwrap();
        out.configure(ch, &cfg).unwrap();

        // 1 + 2 + 3 cycles of offset
        assert_eq!(reg(&card, ch, regs::C_START), 106);
        assert_eq!(reg(&card, ch, regs::RCR), regs::RCR_CONT);
        let dcr = reg(&card, ch, regs::DCR);
        assert_eq!(dcr & regs::DCR_MODE, 0);
        assert_ne!(dcr & regs::DCR_ENABLE, 0);
        // zero period leaves no gap between pulses
        assert_ne!(dcr & regs::DCR_NO_FINE, 0);
    }

    #[test]
    fn test_pulse_mode_skips_tdc_offset() {
        let card = SimulatedCard::new();
        let mut offsets = OffsetConfig::default();
        offsets.tdc_zero_ps = 8_000;
        let out = programmer(&card, &offsets);
        let ch = Channel::ALL[1];
        let cfg = PulseConfig::from_width_and_period(
            OutputMode::Pulse,
            TimeValue::new(5, 100, 0).unwrap(),
            1_000_000,
            10_000_000,
            1,
        )
        .unwrap();
        out.configure(ch, &cfg).unwrap();
        assert_eq!(reg(&card, ch, regs::C_START), 100);
    }

    #[test]
    fn test_uses_compensated_tap() {
        let card = SimulatedCard::new();
        let lock = Arc::new(CalibrationLock::new());
        let ch = Channel::ALL[3];
        lock.lock().get_mut(ch).current_tap = Some(777);
        let out = OutputProgrammer::new(
            Arc::new(card.clone()),
            Arc::new(card.clone()),
            Arc::clone(&lock),
            &OffsetConfig::default(),
        );
        let cfg = pulse(TimeValue::ZERO, 1_000_000, 5_000_000, 1);
        out.configure(ch, &cfg).unwrap();
        assert_eq!(reg(&card, ch, regs::FRR), 777);
    }

    /// Runs `hook` once, just before the first FRR write of `ch` lands.
    struct BeforeFrrWrite {
        card: SimulatedCard,
        ch: Channel,
        hook: Mutex<Option<Box<dyn FnOnce() + Send>>>,
    }

    impl RegisterAccess for BeforeFrrWrite {
        fn read32(&self, addr: u32) -> u32 {
            self.card.read32(addr)
        }

        fn write32(&self, addr: u32, value: u32) {
            if addr == regs::ch_reg(self.ch, regs::FRR) {
                let hook = self.hook.lock().unwrap().take();
                if let Some(hook) = hook {
                    hook();
                }
            }
            self.card.write32(addr, value);
        }
    }

    #[test]
    fn test_compensation_cannot_interleave_tap_write() {
        let card = SimulatedCard::new();
        let lock = Arc::new(CalibrationLock::new());
        let ch = Channel::ALL[1];
        {
            let mut table = lock.lock();
            let state = table.get_mut(ch);
            state.result = Some(CalibrationResult {
                channel: ch,
                tap: 800,
                measured_delay_ps: 7_990,
                offset_from_fit: 755,
                temperature: Temperature::from_celsius(45),
            });
            state.current_tap = Some(800);
        }
        card.set_temperature(Temperature::from_celsius(60));

        let comp = TemperatureCompensator::new(
            Arc::new(card.clone()),
            Arc::new(card.clone()),
            Arc::clone(&lock),
            // one tap per degree
            CalibrationPolynomial { c0: 0, c1: 1 << 28, c2: 0 },
            Duration::from_secs(30),
        );
        let outcome = Arc::new(Mutex::new(None));
        let hook: Box<dyn FnOnce() + Send> = {
            let outcome = Arc::clone(&outcome);
            Box::new(move || {
                *outcome.lock().unwrap() = Some(comp.compensate_once().unwrap());
            })
        };
        let out = OutputProgrammer::new(
            Arc::new(BeforeFrrWrite {
                card: card.clone(),
                ch,
                hook: Mutex::new(Some(hook)),
            }),
            Arc::new(card.clone()),
            Arc::clone(&lock),
            &OffsetConfig::default(),
        );

        out.configure(ch, &pulse(TimeValue::ZERO, 1_000_000, 5_000_000, 1)).unwrap();

        assert_eq!(
            *outcome.lock().unwrap(),
            Some(CompensationOutcome::Skipped(SkipReason::CalibrationInProgress))
        );
        let current = lock.lock().get(ch).current_tap;
        assert_eq!(current, Some(800));
        assert_eq!(Some(reg(&card, ch, regs::FRR) as u16), current);
    }

    #[test]
    fn test_disable_turns_driver_off() {
        let card = SimulatedCard::new();
        let out = programmer(&card, &OffsetConfig::default());
        let ch = Channel::ALL[0];
        let cfg = pulse(TimeValue::ZERO, 1_000_000, 5_000_000, 1);
        out.configure(ch, &cfg).unwrap();
        assert!(card.output_enabled(ch));

        out.configure(ch, &PulseConfig::disabled()).unwrap();
        assert!(!card.output_enabled(ch));
    }

    #[test]
    fn test_invalid_config_writes_nothing() {
        let card = SimulatedCard::new();
        let out = programmer(&card, &OffsetConfig::default());
        let ch = Channel::ALL[0];
        let cfg = PulseConfig {
            mode: OutputMode::Pulse,
            repeat: 0,
            start: TimeValue::ZERO,
            end: TimeValue::ZERO,
            period: TimeValue::ZERO,
        };
        assert!(out.configure(ch, &cfg).is_err());
        assert_eq!(reg(&card, ch, regs::DCR), 0);
        assert!(!card.output_enabled(ch));
    }
}
