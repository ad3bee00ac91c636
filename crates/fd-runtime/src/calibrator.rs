//! Output delay-line calibration.
//!
//! Each output channel has a 1024-tap fine delay line. Calibration finds, per
//! channel, the largest tap whose added delay stays below one 8 ns cycle of
//! the coarse counter. The delay at a tap is measured with the TDC in I-mode:
//! a calibration pulse is routed through the channel and the TDC reports the
//! interval in bins.
//!
//! Per channel the run walks `Idle -> MeasuringBias -> BinarySearching ->
//! Converged`. Results are committed only when every channel converged, so
//! a failed run leaves the previous calibration in effect.

use fd_common::{
    CalibrationConfig, CalibrationPhase, CalibrationPolynomial, Channel, DelayStats, FdError,
    FdResult, ModeScale, Temperature, MAX_TAP, NUM_CHANNELS,
};
use fd_hw::regs::{self, tdc};
use fd_hw::{settle, BoardPeripherals, PllSolution, RegisterAccess, Tdc};
use serde::Serialize;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, TryLockError};
use std::time::Duration;
use tracing::{debug, info, warn};

/// One coarse cycle, ps with 16 fractional bits.
pub const QUANTUM_FP: u64 = 8000 << 16;

/// Source of averaged delay measurements for one channel and tap.
pub trait DelayProbe: Send + Sync {
    /// Measure the delay of `ch` at `tap`, `repeats` times.
    ///
    /// Values are picoseconds with 16 fractional bits.
    ///
    /// # Errors
    ///
    /// Returns [`FdError::Calibration`] if the measurement cannot be taken.
    fn measure(&self, ch: Channel, tap: u16, repeats: u32) -> FdResult<DelayStats>;
}

/// [`DelayProbe`] driving the card's calibration pulse through the TDC.
///
/// The TDC must be in I-mode with the bus in bypass.
pub struct TdcDelayProbe {
    regs: Arc<dyn RegisterAccess>,
    peripherals: Arc<dyn BoardPeripherals>,
    tdc: Arc<Tdc>,
    bin_fp: u64,
    mode_scale: ModeScale,
    arm_settle: Duration,
    pulse_settle: Duration,
}

impl TdcDelayProbe {
    /// Build a probe using the bin width achieved by `pll`.
    pub fn new(
        regs: Arc<dyn RegisterAccess>,
        peripherals: Arc<dyn BoardPeripherals>,
        tdc: Arc<Tdc>,
        pll: &PllSolution,
        config: &CalibrationConfig,
    ) -> Self {
        Self {
            regs,
            peripherals,
            tdc,
            bin_fp: pll.bin_fp,
            mode_scale: config.mode_scale,
            arm_settle: config.arm_settle,
            pulse_settle: config.pulse_settle,
        }
    }
}

impl DelayProbe for TdcDelayProbe {
    fn measure(&self, ch: Channel, tap: u16, repeats: u32) -> FdResult<DelayStats> {
        let n = repeats as usize;
        let mut scratch: Vec<u64> = Vec::new();
        scratch
            .try_reserve_exact(n)
            .map_err(|e| FdError::Calibration {
                channel: ch.external(),
                reason: format!("cannot allocate {n} measurement slots: {e}"),
            })?;

        let psel = regs::calr_psel(1 << ch.index());
        let stop_port = ch.index() as u32 + 1;

        self.peripherals.set_output_enabled(ch, false);
        // arm the TDC for the start input and this channel's stop only
        self.tdc.write(
            0,
            tdc::ar0_trise_en(0) | tdc::ar0_trise_en(stop_port) | tdc::AR0_HQSEL | tdc::AR0_ROSC,
        );

        self.regs.write32(regs::ch_reg(ch, regs::FRR), u32::from(tap));
        self.regs.write32(
            regs::ch_reg(ch, regs::DCR),
            regs::DCR_ENABLE | regs::DCR_MODE | regs::DCR_UPDATE,
        );
        self.regs
            .write32(regs::ch_reg(ch, regs::DCR), regs::DCR_FORCE_DLY | regs::DCR_ENABLE);
        self.regs.write32(regs::CALR, psel);
        settle(self.arm_settle);

        let mut stats = DelayStats::new();
        for _ in 0..repeats {
            self.regs.write32(regs::TDCSR, regs::TDCSR_ALUTRIG);
            settle(self.arm_settle);
            self.regs.write32(regs::CALR, regs::CALR_CAL_PULSE | psel);
            settle(self.pulse_settle);

            let raw = tdc::ar8i_ififo1(self.tdc.read(tdc::FIFO_ADDR));
            let delay = self.mode_scale.apply(u64::from(raw) * self.bin_fp);
            scratch.push(delay);
            stats.record(delay);
        }
        self.regs.write32(regs::ch_reg(ch, regs::DCR), 0);

        debug!(
            channel = %ch,
            tap,
            avg_ps = stats.avg().unwrap_or(0) >> 16,
            spread_ps = stats.spread() >> 16,
            "measured output delay"
        );
        Ok(stats)
    }
}

/// Outcome of one binary search.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct TapSearch {
    /// Averaged delay at tap 0.
    pub bias_fp: u64,
    /// Largest tap measured below one quantum above the bias; the calibrated tap.
    pub low: u16,
    /// Smallest tap measured at or above one quantum.
    pub high: u16,
    /// Midpoints measured.
    pub iterations: u32,
    /// Delay above the bias at `low`.
    pub low_delay_fp: u64,
}

fn averaged(probe: &dyn DelayProbe, ch: Channel, tap: u16, repeats: u32) -> FdResult<u64> {
    probe
        .measure(ch, tap, repeats)?
        .avg()
        .ok_or_else(|| FdError::Calibration {
            channel: ch.external(),
            reason: "no measurements taken".into(),
        })
}

/// Binary-search the tap adding one 8 ns quantum of delay on `ch`.
///
/// `phase` is advanced from `Idle` (or a previous `Converged`) through
/// `MeasuringBias` and `BinarySearching` to `Converged`.
///
/// # Errors
///
/// Propagates probe failures and rejects a zero repeat count.
pub fn find_quantum_tap(
    probe: &dyn DelayProbe,
    ch: Channel,
    repeats: u32,
    phase: &mut CalibrationPhase,
) -> FdResult<TapSearch> {
    if repeats == 0 {
        return Err(FdError::Calibration {
            channel: ch.external(),
            reason: "repeat count must be non-zero".into(),
        });
    }

    phase.transition_to(CalibrationPhase::MeasuringBias)?;
    let bias_fp = averaged(probe, ch, 0, repeats)?;
    debug!(channel = %ch, bias_ps = bias_fp >> 16, "delay bias measured");

    phase.transition_to(CalibrationPhase::BinarySearching)?;
    let (mut low, mut high) = (0u16, MAX_TAP);
    let mut low_delay_fp = 0;
    let mut iterations = 0;
    while high - low > 1 {
        let mid = (low + high) / 2;
        let delay = averaged(probe, ch, mid, repeats)?.saturating_sub(bias_fp);
        if delay < QUANTUM_FP {
            low = mid;
            low_delay_fp = delay;
        } else {
            high = mid;
        }
        iterations += 1;
    }

    phase.transition_to(CalibrationPhase::Converged)?;
    Ok(TapSearch {
        bias_fp,
        low,
        high,
        iterations,
        low_delay_fp,
    })
}

/// Calibration outcome for one channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct CalibrationResult {
    /// Output channel.
    pub channel: Channel,
    /// Tap giving one quantum of added delay.
    pub tap: u16,
    /// Delay added by `tap` over tap 0, picoseconds.
    pub measured_delay_ps: u64,
    /// `tap` minus the polynomial fit at `temperature`.
    pub offset_from_fit: i32,
    /// Board temperature during the measurement.
    pub temperature: Temperature,
}

/// Calibration state of one channel.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ChannelState {
    /// Last committed calibration.
    pub result: Option<CalibrationResult>,
    /// Progress of the current run.
    pub phase: CalibrationPhase,
    /// Tap currently programmed, after temperature compensation.
    pub current_tap: Option<u16>,
}

/// Per-channel calibration table.
#[derive(Debug, Clone, Default)]
pub struct ChannelTable {
    channels: [ChannelState; NUM_CHANNELS],
}

impl ChannelTable {
    /// State of `ch`.
    #[must_use]
    pub fn get(&self, ch: Channel) -> &ChannelState {
        &self.channels[ch.index()]
    }

    /// Mutable state of `ch`.
    pub fn get_mut(&mut self, ch: Channel) -> &mut ChannelState {
        &mut self.channels[ch.index()]
    }

    /// Committed results, in channel order.
    #[must_use]
    pub fn results(&self) -> [Option<CalibrationResult>; NUM_CHANNELS] {
        self.channels.map(|c| c.result)
    }
}

/// Serializes calibration against temperature compensation.
///
/// The calibrator holds the lock for a whole pass; the compensator only
/// tries it and skips its tick when it is taken.
#[derive(Debug, Default)]
pub struct CalibrationLock {
    table: Mutex<ChannelTable>,
}

impl CalibrationLock {
    /// Empty table.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Block until the table is available.
    pub fn lock(&self) -> MutexGuard<'_, ChannelTable> {
        self.table.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Take the table only if nobody holds it.
    pub fn try_lock(&self) -> Option<MutexGuard<'_, ChannelTable>> {
        match self.table.try_lock() {
            Ok(guard) => Some(guard),
            Err(TryLockError::Poisoned(p)) => Some(p.into_inner()),
            Err(TryLockError::WouldBlock) => None,
        }
    }
}

/// Runs calibration passes over all output channels.
pub struct DelayCalibrator {
    regs: Arc<dyn RegisterAccess>,
    peripherals: Arc<dyn BoardPeripherals>,
    tdc: Arc<Tdc>,
    lock: Arc<CalibrationLock>,
    repeats: u32,
    polynomial: CalibrationPolynomial,
    config: CalibrationConfig,
}

impl std::fmt::Debug for DelayCalibrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DelayCalibrator")
            .field("repeats", &self.repeats)
            .field("polynomial", &self.polynomial)
            .finish_non_exhaustive()
    }
}

impl DelayCalibrator {
    /// Create a calibrator sharing `lock` with the compensator.
    pub fn new(
        regs: Arc<dyn RegisterAccess>,
        peripherals: Arc<dyn BoardPeripherals>,
        tdc: Arc<Tdc>,
        lock: Arc<CalibrationLock>,
        config: &CalibrationConfig,
    ) -> Self {
        Self {
            regs,
            peripherals,
            tdc,
            lock,
            repeats: config.repeats,
            polynomial: config.polynomial,
            config: config.clone(),
        }
    }

    /// Calibrate every channel through the TDC, which must already be in
    /// I-mode as described by `pll`.
    ///
    /// # Errors
    ///
    /// Returns the first channel failure; previous results stay in effect.
    pub fn calibrate_outputs(&self, pll: &PllSolution) -> FdResult<Vec<CalibrationResult>> {
        self.tdc.set_bypass(true);
        self.regs
            .write32(regs::TDCSR, regs::TDCSR_START_EN | regs::TDCSR_STOP_EN);

        let probe = TdcDelayProbe::new(
            Arc::clone(&self.regs),
            Arc::clone(&self.peripherals),
            Arc::clone(&self.tdc),
            pll,
            &self.config,
        );
        self.calibrate_with(&probe)
    }

    /// Calibrate every channel with an arbitrary probe.
    ///
    /// # Errors
    ///
    /// Returns the first channel failure; previous results stay in effect.
    pub fn calibrate_with(&self, probe: &dyn DelayProbe) -> FdResult<Vec<CalibrationResult>> {
        let mut table = self.lock.lock();
        info!(repeats = self.repeats, "Calibrating output delay lines");

        let mut results = Vec::with_capacity(NUM_CHANNELS);
        for ch in Channel::ALL {
            match self.calibrate_channel(probe, ch, &mut table) {
                Ok(r) => results.push(r),
                Err(e) => {
                    warn!(channel = %ch, error = %e, "calibration run aborted");
                    for c in Channel::ALL {
                        table.get_mut(c).phase = CalibrationPhase::Idle;
                    }
                    return Err(e);
                }
            }
        }

        for r in &results {
            self.regs
                .write32(regs::ch_reg(r.channel, regs::FRR), u32::from(r.tap));
            let state = table.get_mut(r.channel);
            state.result = Some(*r);
            state.current_tap = Some(r.tap);
        }
        info!("Output delay lines calibrated");
        Ok(results)
    }

    fn calibrate_channel(
        &self,
        probe: &dyn DelayProbe,
        ch: Channel,
        table: &mut ChannelTable,
    ) -> FdResult<CalibrationResult> {
        let temperature = self.peripherals.read_temperature()?;
        let search = find_quantum_tap(probe, ch, self.repeats, &mut table.get_mut(ch).phase)?;

        let fitted = self.polynomial.eval(temperature);
        let offset_from_fit = i32::try_from(i64::from(search.low) - fitted).map_err(|_| {
            FdError::Calibration {
                channel: ch.external(),
                reason: format!("polynomial fit {fitted} far outside the tap range"),
            }
        })?;

        info!(
            channel = %ch,
            tap = search.low,
            bias_ps = search.bias_fp >> 16,
            offset_from_fit,
            %temperature,
            "channel calibrated"
        );
        Ok(CalibrationResult {
            channel: ch,
            tap: search.low,
            measured_delay_ps: search.low_delay_fp >> 16,
            offset_from_fit,
            temperature,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fd_hw::SimulatedCard;
    use std::sync::atomic::{AtomicU32, Ordering};

    /// Synthetic monotonic delay table: `bias + tap * step`, in ps.
    struct TableProbe {
        bias_ps: u64,
        step_fs: u64,
        calls: AtomicU32,
        fail_on: Option<Channel>,
    }

    impl TableProbe {
        fn new(bias_ps: u64, step_fs: u64) -> Self {
            Self {
                bias_ps,
                step_fs,
                calls: AtomicU32::new(0),
                fail_on: None,
            }
        }

        fn delay_fp(&self, tap: u16) -> u64 {
            ((self.bias_ps * 1000 + u64::from(tap) * self.step_fs) << 16) / 1000
        }
    }

    impl DelayProbe for TableProbe {
        fn measure(&self, ch: Channel, tap: u16, repeats: u32) -> FdResult<DelayStats> {
            if self.fail_on == Some(ch) {
                return Err(FdError::Calibration {
                    channel: ch.external(),
                    reason: "probe failure".into(),
                });
            }
            self.calls.fetch_add(1, Ordering::Relaxed);
            let mut s = DelayStats::new();
            for _ in 0..repeats {
                s.record(self.delay_fp(tap));
            }
            Ok(s)
        }
    }

    fn calibrator(card: &SimulatedCard, lock: Arc<CalibrationLock>) -> DelayCalibrator {
        let regs: Arc<dyn RegisterAccess> = Arc::new(card.clone());
        let per: Arc<dyn BoardPeripherals> = Arc::new(card.clone());
        let tdc = Arc::new(Tdc::new(Arc::clone(&regs), Arc::clone(&per)));
        let config = CalibrationConfig {
            repeats: 4,
            ..CalibrationConfig::default()
        };
        DelayCalibrator::new(regs, per, tdc, lock, &config)
    }

    #[test]
    fn test_search_finds_boundary_tap() {
        for step_fs in [8_500, 9_800, 10_000, 11_300, 15_000] {
            let probe = TableProbe::new(30_000, step_fs);
            let mut phase = CalibrationPhase::Idle;
            let s = find_quantum_tap(&probe, Channel::ALL[0], 1, &mut phase).unwrap();

            let above = |tap: u16| probe.delay_fp(tap) - probe.delay_fp(0) >= QUANTUM_FP;
            assert!(above(s.high), "step {step_fs}: {s:?}");
            assert!(!above(s.high - 1), "step {step_fs}: {s:?}");
            assert_eq!(s.low, s.high - 1);
            assert!(s.iterations <= 10);
            assert!(s.low_delay_fp < QUANTUM_FP);
            assert_eq!(phase, CalibrationPhase::Converged);
        }
    }

    #[test]
    fn test_search_measures_bias_plus_ten_midpoints() {
        let probe = TableProbe::new(30_000, 10_000);
        let mut phase = CalibrationPhase::Idle;
        let s = find_quantum_tap(&probe, Channel::ALL[1], 8, &mut phase).unwrap();
        assert_eq!(s.low, 799);
        assert_eq!(s.iterations, 10);
        assert_eq!(probe.calls.load(Ordering::Relaxed), 11);
        assert_eq!(s.bias_fp, 30_000 << 16);
    }

    #[test]
    fn test_search_rejects_zero_repeats() {
        let probe = TableProbe::new(30_000, 10_000);
        let mut phase = CalibrationPhase::Idle;
        assert!(matches!(
            find_quantum_tap(&probe, Channel::ALL[0], 0, &mut phase),
            Err(FdError::Calibration { channel: 1, .. })
        ));
        assert_eq!(phase, CalibrationPhase::Idle);
    }

    #[test]
    fn test_search_from_converged_restarts() {
        let probe = TableProbe::new(30_000, 10_000);
        let mut phase = CalibrationPhase::Converged;
        assert!(find_quantum_tap(&probe, Channel::ALL[0], 1, &mut phase).is_ok());

        let mut busy = CalibrationPhase::BinarySearching;
        assert!(matches!(
            find_quantum_tap(&probe, Channel::ALL[0], 1, &mut busy),
            Err(FdError::InvalidStateTransition { .. })
        ));
    }

    #[test]
    fn test_calibrate_with_commits_all_channels() {
        let card = SimulatedCard::new();
        let lock = Arc::new(CalibrationLock::new());
        let cal = calibrator(&card, Arc::clone(&lock));

        let results = cal.calibrate_with(&TableProbe::new(30_000, 10_000)).unwrap();
        assert_eq!(results.len(), NUM_CHANNELS);
        for r in &results {
            assert_eq!(r.tap, 799);
            // zero polynomial: the whole tap is the offset
            assert_eq!(r.offset_from_fit, 799);
            assert_eq!(r.temperature, Temperature::from_celsius(45));
            assert_eq!(card.register(regs::ch_reg(r.channel, regs::FRR)), 799);
        }

        let table = lock.lock();
        assert!(table.results().iter().all(Option::is_some));
        assert_eq!(table.get(Channel::ALL[2]).current_tap, Some(799));
        assert_eq!(table.get(Channel::ALL[2]).phase, CalibrationPhase::Converged);
    }

    #[test]
    fn test_failed_run_keeps_previous_results() {
        let card = SimulatedCard::new();
        let lock = Arc::new(CalibrationLock::new());
        let cal = calibrator(&card, Arc::clone(&lock));
        cal.calibrate_with(&TableProbe::new(30_000, 10_000)).unwrap();

        let mut failing = TableProbe::new(30_000, 20_000);
        failing.fail_on = Some(Channel::ALL[3]);
        assert!(matches!(
            cal.calibrate_with(&failing),
            Err(FdError::Calibration { channel: 4, .. })
        ));

        let table = lock.lock();
        for ch in Channel::ALL {
            assert_eq!(table.get(ch).result.map(|r| r.tap), Some(799));
            assert_eq!(table.get(ch).phase, CalibrationPhase::Idle);
        }
    }

    #[test]
    fn test_offset_from_fit_uses_polynomial() {
        let card = SimulatedCard::new();
        let lock = Arc::new(CalibrationLock::new());
        let regs: Arc<dyn RegisterAccess> = Arc::new(card.clone());
        let per: Arc<dyn BoardPeripherals> = Arc::new(card.clone());
        let tdc = Arc::new(Tdc::new(Arc::clone(&regs), Arc::clone(&per)));
        let config = CalibrationConfig {
            repeats: 1,
            // constant fit of 700 taps
            polynomial: CalibrationPolynomial { c0: 0, c1: 0, c2: 700 << 32 },
            ..CalibrationConfig::default()
        };
        let cal = DelayCalibrator::new(regs, per, tdc, lock, &config);

        let results = cal.calibrate_with(&TableProbe::new(30_000, 10_000)).unwrap();
        assert!(results.iter().all(|r| r.offset_from_fit == 99));
    }

    #[test]
    fn test_thermometer_failure_aborts_run() {
        let card = SimulatedCard::new();
        card.set_thermometer_ok(false);
        let cal = calibrator(&card, Arc::new(CalibrationLock::new()));
        assert!(matches!(
            cal.calibrate_with(&TableProbe::new(30_000, 10_000)),
            Err(FdError::HardwareFault(_))
        ));
    }

    #[test]
    fn test_try_lock_fails_while_calibrating() {
        let lock = CalibrationLock::new();
        let held = lock.lock();
        assert!(lock.try_lock().is_none());
        drop(held);
        assert!(lock.try_lock().is_some());
    }
}
