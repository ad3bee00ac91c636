//! Delay-line calibration acceptance tests.
//!
//! # Acceptance Criteria
//!
//! - The calibrated tap is within 2 taps of the largest tap adding less
//!   than one 8 ns cycle, for any delay-line slope
//! - Compensation follows temperature through the tap polynomial
//! - A failed recalibration leaves the committed calibration untouched

use super::common::{fast_config, open_board};
use fd_common::{BoardState, CalibrationPolynomial, Channel, FdError, Temperature};
use fd_hw::regs;
use fd_hw::{DelayLine, SimulatedCard};
use std::time::{Duration, Instant};

fn assert_near_quantum(card: &SimulatedCard, ch: Channel, tap: u16) {
    let expected = i32::from(card.delay_line(ch).quantum_tap());
    assert!(
        (i32::from(tap) - expected).abs() <= 2,
        "channel {ch}: tap {tap}, expected about {expected}"
    );
}

#[test]
fn test_calibration_tracks_delay_line_slope() -> anyhow::Result<()> {
    let card = SimulatedCard::new();
    let lines = [
        DelayLine { bias_ps: 30_000, step_fs: 9_000 },
        DelayLine { bias_ps: 31_000, step_fs: 11_000 },
        DelayLine { bias_ps: 32_000, step_fs: 9_500 },
        DelayLine { bias_ps: 34_000, step_fs: 10_600 },
    ];
    for (ch, line) in Channel::ALL.into_iter().zip(lines) {
        card.set_delay_line(ch, line);
    }

    let board = open_board(&card, fast_config())?;
    for ch in Channel::ALL {
        let result = board.calibration()[ch.index()]
            .ok_or_else(|| anyhow::anyhow!("channel {ch} not calibrated"))?;
        println!(
            "channel {ch}: tap {} delay {} ps",
            result.tap, result.measured_delay_ps
        );
        assert_near_quantum(&card, ch, result.tap);
        assert_eq!(board.current_tap(ch), Some(result.tap));
    }
    Ok(())
}

#[test]
fn test_recalibration_follows_aged_delay_line() -> anyhow::Result<()> {
    let card = SimulatedCard::new();
    let mut board = open_board(&card, fast_config())?;
    let ch = Channel::ALL[1];
    let before = board.calibration()[ch.index()].map(|r| r.tap);

    card.set_delay_line(ch, DelayLine { bias_ps: 32_500, step_fs: 12_000 });
    card.set_temperature(Temperature::from_celsius(50));
    let results = board.recalibrate()?;
    let result = results
        .iter()
        .find(|r| r.channel == ch)
        .ok_or_else(|| anyhow::anyhow!("channel {ch} missing"))?;

    assert_ne!(Some(result.tap), before);
    assert_near_quantum(&card, ch, result.tap);
    assert_eq!(result.temperature, Temperature::from_celsius(50));
    assert_eq!(board.state(), BoardState::Running);
    Ok(())
}

#[test]
fn test_failed_recalibration_keeps_previous_result() -> anyhow::Result<()> {
    let card = SimulatedCard::new();
    let mut board = open_board(&card, fast_config())?;
    let before = board.calibration();

    card.set_thermometer_ok(false);
    let err = board.recalibrate().unwrap_err();
    assert!(matches!(err, FdError::HardwareFault(_)));
    assert_eq!(board.calibration(), before);
    assert_eq!(board.state(), BoardState::Closed);
    Ok(())
}

#[test]
fn test_compensation_follows_temperature_sweep() -> anyhow::Result<()> {
    let card = SimulatedCard::new();
    let mut config = fast_config();
    // -2 taps per degree
    config.calibration.polynomial = CalibrationPolynomial { c0: 0, c1: -(1 << 29), c2: 0 };
    config.calibration.recalibration_period = Duration::from_millis(5);
    let board = open_board(&card, config)?;

    let ch = Channel::ALL[0];
    let calibrated = board.calibration()[ch.index()]
        .ok_or_else(|| anyhow::anyhow!("channel {ch} not calibrated"))?;

    for celsius in [40, 48, 35] {
        card.set_temperature(Temperature::from_celsius(celsius));
        let want = i32::from(calibrated.tap) - 2 * (i32::from(celsius) - 45);
        let want = u16::try_from(want)?;
        let deadline = Instant::now() + Duration::from_secs(5);
        while board.current_tap(ch) != Some(want) {
            anyhow::ensure!(Instant::now() < deadline, "tap never reached {want} at {celsius} C");
            std::thread::sleep(Duration::from_millis(2));
        }
        assert_eq!(card.register(regs::ch_reg(ch, regs::FRR)), u32::from(want));
    }
    Ok(())
}
