//! Per-device board handle.
//!
//! [`Board::open`] runs the bring-up as an ordered list of [`InitStep`]s.
//! Every completed step is pushed on a rollback stack; if a later step
//! fails, the completed ones are undone in reverse and the board ends up
//! closed. [`Board::close`] unwinds the same stack and is idempotent.
//!
//! # Lifecycle
//!
//! ```text
//! CLOSED ──open──▶ INITIALIZING ──▶ RUNNING ◀──▶ CALIBRATING
//!                       │              │              │
//!                       └──────────▶ FAULT ◀──────────┘
//!                                      │
//!                      CLOSED ◀────────┘  (RUNNING ──close──▶ CLOSED)
//! ```

use crate::calibrator::{CalibrationLock, CalibrationResult, DelayCalibrator};
use crate::capture::{CaptureScheduler, InterruptLine, TimestampStream};
use crate::compensator::TemperatureCompensator;
use crate::output::{OutputProgrammer, PulseConfig};
use crate::timebase::TimeBase;
use fd_common::{
    BoardConfig, BoardState, CaptureSnapshot, Channel, FdError, FdResult, StateMachine,
    Temperature, TimeValue, NUM_CHANNELS,
};
use fd_hw::regs;
use fd_hw::{poll_until, settle, BoardPeripherals, PllSolution, RegisterAccess, Tdc, TdcMode};
use std::fmt;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// Bring-up steps, in execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum InitStep {
    /// Check the gateware identification and mezzanine presence.
    Probe,
    /// Pulse the FMC and core resets.
    Reset,
    /// Wait for the DDR PLL and reset the core again.
    ClockLock,
    /// Take the TDC bus and verify its data and address lines.
    TdcSelfTest,
    /// Put the TDC in I-mode for delay measurements.
    TdcCalibrationMode,
    /// Calibrate the output delay lines.
    Calibrate,
    /// Put the TDC in G-mode and hand the bus back to the core.
    TdcTimestampMode,
    /// Zero the time base.
    TimeBase,
    /// Enable the input and start draining timestamps.
    Capture,
    /// Start periodic temperature compensation.
    Compensation,
}

impl InitStep {
    /// All steps in execution order.
    pub const ALL: [InitStep; 10] = [
        Self::Probe,
        Self::Reset,
        Self::ClockLock,
        Self::TdcSelfTest,
        Self::TdcCalibrationMode,
        Self::Calibrate,
        Self::TdcTimestampMode,
        Self::TimeBase,
        Self::Capture,
        Self::Compensation,
    ];
}

impl fmt::Display for InitStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Probe => "probe",
            Self::Reset => "reset",
            Self::ClockLock => "clock-lock",
            Self::TdcSelfTest => "tdc-self-test",
            Self::TdcCalibrationMode => "tdc-calibration-mode",
            Self::Calibrate => "calibrate",
            Self::TdcTimestampMode => "tdc-timestamp-mode",
            Self::TimeBase => "time-base",
            Self::Capture => "capture",
            Self::Compensation => "compensation",
        };
        f.write_str(name)
    }
}

/// One fine-delay card.
pub struct Board {
    config: BoardConfig,
    regs: Arc<dyn RegisterAccess>,
    peripherals: Arc<dyn BoardPeripherals>,
    tdc: Arc<Tdc>,
    lock: Arc<CalibrationLock>,
    calibrator: DelayCalibrator,
    compensator: TemperatureCompensator,
    capture: CaptureScheduler,
    output: OutputProgrammer,
    timebase: TimeBase,
    state: StateMachine,
    /// Rollback stack of completed init steps.
    completed: Vec<InitStep>,
    pll: Option<PllSolution>,
}

impl fmt::Debug for Board {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Board")
            .field("state", &self.state.state())
            .field("completed", &self.completed)
            .field("pll", &self.pll)
            .finish_non_exhaustive()
    }
}

impl Board {
    /// Bring up the card behind `regs` and `peripherals`.
    ///
    /// # Errors
    ///
    /// Returns [`FdError::Config`] for an invalid configuration, or the
    /// error of the first failing step after rolling back the completed ones.
    pub fn open(
        config: BoardConfig,
        regs: Arc<dyn RegisterAccess>,
        peripherals: Arc<dyn BoardPeripherals>,
    ) -> FdResult<Self> {
        config.validate()?;

        let tdc = Arc::new(Tdc::new(Arc::clone(&regs), Arc::clone(&peripherals)));
        let lock = Arc::new(CalibrationLock::new());
        let mut board = Self {
            calibrator: DelayCalibrator::new(
                Arc::clone(&regs),
                Arc::clone(&peripherals),
                Arc::clone(&tdc),
                Arc::clone(&lock),
                &config.calibration,
            ),
            compensator: TemperatureCompensator::new(
                Arc::clone(&regs),
                Arc::clone(&peripherals),
                Arc::clone(&lock),
                config.calibration.polynomial,
                config.calibration.recalibration_period,
            ),
            capture: CaptureScheduler::new(Arc::clone(&regs), &config)?,
            output: OutputProgrammer::new(
                Arc::clone(&regs),
                Arc::clone(&peripherals),
                Arc::clone(&lock),
                &config.offsets,
            ),
            timebase: TimeBase::new(Arc::clone(&regs)),
            state: StateMachine::new(),
            completed: Vec::with_capacity(InitStep::ALL.len()),
            pll: None,
            config,
            regs,
            peripherals,
            tdc,
            lock,
        };

        board.state.transition(BoardState::Initializing)?;
        info!("Opening fine-delay board");

        for step in InitStep::ALL {
            debug!(%step, "init step");
            if let Err(e) = board.run_step(step) {
                error!(%step, error = %e, "board initialization failed");
                board.state.enter_fault();
                board.rollback();
                board.state.transition(BoardState::Closed)?;
                return Err(e);
            }
            board.completed.push(step);
        }

        board.state.transition(BoardState::Running)?;
        info!(
            bin_ps = board.pll.map_or(0.0, |p| p.bin_ps()),
            "Board running"
        );
        Ok(board)
    }

    fn run_step(&mut self, step: InitStep) -> FdResult<()> {
        match step {
            InitStep::Probe => self.probe(),
            InitStep::Reset => {
                self.reset_core();
                Ok(())
            }
            InitStep::ClockLock => {
                let hw = &self.config.hardware;
                poll_until("DDR PLL lock", hw.lock_timeout, hw.lock_poll, || {
                    self.regs.read32(regs::GCR) & regs::GCR_DDR_LOCKED != 0
                })
                .map_err(FdError::into_hardware_fault)?;
                self.reset_core();
                Ok(())
            }
            InitStep::TdcSelfTest => {
                self.tdc.set_bypass(true);
                self.tdc
                    .test_bus()
                    .inspect_err(|_| self.tdc.set_bypass(false))
            }
            InitStep::TdcCalibrationMode => {
                self.pll = Some(self.tdc.configure(TdcMode::I, &self.config.tdc)?);
                Ok(())
            }
            InitStep::Calibrate => {
                if !self.config.calibration.enabled {
                    warn!("output calibration disabled, taps left at zero");
                    return Ok(());
                }
                let pll = self.pll.ok_or_else(|| {
                    FdError::Config("TDC not configured before calibration".into())
                })?;
                self.calibrator.calibrate_outputs(&pll).map(|_| ())
            }
            InitStep::TdcTimestampMode => self.enter_timestamp_mode(),
            InitStep::TimeBase => self.timebase.init(),
            InitStep::Capture => self.capture.start(),
            InitStep::Compensation => self.compensator.start(),
        }
    }

    fn undo_step(&mut self, step: InitStep) {
        debug!(%step, "undo init step");
        match step {
            InitStep::Compensation => self.compensator.stop(),
            InitStep::Capture => self.capture.stop(),
            InitStep::TdcTimestampMode => {
                self.regs.write32(regs::TSBCR, regs::TSBCR_PURGE);
            }
            InitStep::TdcCalibrationMode => self.pll = None,
            InitStep::TdcSelfTest => self.tdc.set_bypass(false),
            InitStep::Reset => {
                // hold FMC and core in reset
                self.regs.write32(regs::RSTR, regs::RSTR_UNLOCK);
            }
            InitStep::Probe | InitStep::ClockLock | InitStep::Calibrate | InitStep::TimeBase => {}
        }
    }

    fn rollback(&mut self) {
        while let Some(step) = self.completed.pop() {
            self.undo_step(step);
        }
    }

    fn probe(&self) -> FdResult<()> {
        let id = self.regs.read32(regs::IDR);
        if id != regs::IDR_MAGIC {
            return Err(FdError::HardwareFault(format!(
                "wrong gateware: id {id:#010x}, expected {:#010x}",
                regs::IDR_MAGIC
            )));
        }
        if self.regs.read32(regs::GCR) & regs::GCR_FMC_PRESENT == 0 {
            return Err(FdError::HardwareFault("mezzanine not present".into()));
        }
        Ok(())
    }

    fn reset_core(&self) {
        let hw = &self.config.hardware;
        self.regs
            .write32(regs::RSTR, regs::RSTR_UNLOCK | regs::RSTR_RST_FMC);
        settle(hw.reset_settle);
        self.regs.write32(
            regs::RSTR,
            regs::RSTR_UNLOCK | regs::RSTR_RST_FMC | regs::RSTR_RST_CORE,
        );
        settle(hw.reset_settle);
    }

    fn enter_timestamp_mode(&mut self) -> FdResult<()> {
        self.pll = Some(self.tdc.configure(TdcMode::G, &self.config.tdc)?);
        self.tdc.set_bypass(false);
        self.regs
            .write32(regs::TSBCR, regs::TSBCR_PURGE | regs::TSBCR_RST_SEQ);
        self.regs.write32(regs::ADSFR, regs::GMODE_ADSFR);
        self.regs.write32(regs::ASOR, regs::GMODE_ASOR);
        self.regs.write32(regs::ATMCR, regs::GMODE_ATMCR);
        Ok(())
    }

    fn ensure_active(&self) -> FdResult<()> {
        let state = self.state.state();
        if state.is_active() {
            Ok(())
        } else {
            Err(FdError::Config(format!("board is {state}")))
        }
    }

    /// Stop capture, then compensation, release the ring and undo the
    /// bring-up. Idempotent.
    pub fn close(&mut self) {
        if self.state.state() == BoardState::Closed {
            return;
        }
        info!(state = %self.state.state(), "Closing board");
        self.capture.stop();
        self.compensator.stop();
        self.capture.release();
        self.rollback();

        if self.state.transition(BoardState::Closed).is_err() {
            self.state.enter_fault();
            if let Err(e) = self.state.transition(BoardState::Closed) {
                warn!(error = %e, "board state not closed cleanly");
            }
        }
        info!("Board closed");
    }

    /// Re-run the delay-line calibration while running.
    ///
    /// Capture is paused for the duration. A non-fatal failure keeps the
    /// previous calibration; a fatal one faults and closes the board.
    ///
    /// # Errors
    ///
    /// Returns the calibration error, or [`FdError::InvalidStateTransition`]
    /// if the board is not running.
    pub fn recalibrate(&mut self) -> FdResult<Vec<CalibrationResult>> {
        self.state.transition(BoardState::Calibrating)?;
        info!("Recalibrating output delay lines");
        self.capture.stop();

        let outcome = self.calibration_pass();
        match outcome {
            Err(e) if e.is_fatal() => {
                error!(error = %e, "recalibration hit a hardware fault");
                self.state.enter_fault();
                self.close();
                Err(e)
            }
            other => {
                self.state.transition(BoardState::Running)?;
                self.capture.start()?;
                if let Err(e) = &other {
                    warn!(error = %e, "recalibration failed, previous calibration kept");
                }
                other
            }
        }
    }

    fn calibration_pass(&mut self) -> FdResult<Vec<CalibrationResult>> {
        self.tdc.set_bypass(true);
        self.tdc.test_bus()?;
        let pll = self.tdc.configure(TdcMode::I, &self.config.tdc)?;
        self.pll = Some(pll);
        let outcome = self.calibrator.calibrate_outputs(&pll);
        // the TDC goes back to timestamping even if calibration failed
        self.enter_timestamp_mode()?;
        outcome
    }

    /// Program output `ch`.
    ///
    /// # Errors
    ///
    /// Returns [`FdError::Config`] if the board is not running or `cfg` is
    /// invalid.
    pub fn configure_output(&self, ch: Channel, cfg: &PulseConfig) -> FdResult<()> {
        self.ensure_active()?;
        self.output.configure(ch, cfg)
    }

    /// Stream of input timestamps.
    pub fn timestamps(&self) -> TimestampStream {
        self.capture.stream()
    }

    /// Interrupt entry for the "timestamp buffer not empty" source.
    pub fn interrupt_line(&self) -> InterruptLine {
        self.capture.interrupt_line()
    }

    /// Set the board time.
    ///
    /// # Errors
    ///
    /// Returns [`FdError::Config`] if the board is not running or `t` is out
    /// of range.
    pub fn set_time(&self, t: TimeValue) -> FdResult<()> {
        self.ensure_active()?;
        self.timebase.set(t)
    }

    /// Read the board time.
    ///
    /// # Errors
    ///
    /// Returns [`FdError::Config`] if the board is not running.
    pub fn time(&self) -> FdResult<TimeValue> {
        self.ensure_active()?;
        self.timebase.get()
    }

    /// Set the board time from the host clock.
    ///
    /// # Errors
    ///
    /// Returns [`FdError::Config`] if the board is not running.
    pub fn set_host_time(&self) -> FdResult<TimeValue> {
        self.ensure_active()?;
        self.timebase.set_host()
    }

    /// Committed calibration per channel.
    pub fn calibration(&self) -> [Option<CalibrationResult>; NUM_CHANNELS] {
        self.lock.lock().results()
    }

    /// Tap currently programmed on `ch`.
    pub fn current_tap(&self, ch: Channel) -> Option<u16> {
        self.lock.lock().get(ch).current_tap
    }

    /// Capture counters.
    pub fn capture_metrics(&self) -> CaptureSnapshot {
        self.capture.metrics()
    }

    /// Board thermometer reading.
    ///
    /// # Errors
    ///
    /// Returns [`FdError::HardwareFault`] if the sensor does not answer.
    pub fn temperature(&self) -> FdResult<Temperature> {
        self.peripherals.read_temperature()
    }

    /// Input user offset, picoseconds.
    pub fn set_input_offset(&self, ps: i64) {
        self.capture.set_user_offset(ps);
    }

    /// Output user offset of `ch`, picoseconds.
    pub fn set_output_offset(&self, ch: Channel, ps: i64) {
        self.output.set_user_offset(ch, ps);
    }

    /// Temperature compensation control.
    pub fn compensator(&self) -> &TemperatureCompensator {
        &self.compensator
    }

    /// Current lifecycle state.
    pub fn state(&self) -> BoardState {
        self.state.state()
    }

    /// PLL setup of the TDC's current mode.
    pub fn pll(&self) -> Option<PllSolution> {
        self.pll
    }

    /// Completed init steps, oldest first.
    pub fn completed_steps(&self) -> &[InitStep] {
        &self.completed
    }

    /// Configuration the board was opened with.
    pub fn config(&self) -> &BoardConfig {
        &self.config
    }
}

impl Drop for Board {
    fn drop(&mut self) {
        self.close();
    }
}
