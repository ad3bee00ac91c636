//! Configuration file acceptance tests.

use super::common::open_board;
use fd_common::{BoardConfig, BoardState, CaptureMode};
use fd_hw::SimulatedCard;
use std::io::Write;
use std::time::Duration;
use tempfile::NamedTempFile;

const FAST_BOARD: &str = r#"
ring_capacity = 64

[capture]
mode = "interrupt"

[calibration]
repeats = 16
arm_settle = "0s"
pulse_settle = "0s"
recalibration_period = "1m"

[tdc]
lock_timeout = "50ms"
lock_poll = "1ms"
reset_settle = "0s"

[hardware]
lock_timeout = "50ms"
lock_poll = "1ms"
reset_settle = "0s"

[offsets]
tdc_user_ps = 16000
"#;

#[test]
fn test_board_opens_from_config_file() -> anyhow::Result<()> {
    let mut file = NamedTempFile::new()?;
    file.write_all(FAST_BOARD.as_bytes())?;

    let config = BoardConfig::from_file(file.path())?;
    assert_eq!(config.ring_capacity, 64);
    assert_eq!(config.capture.mode, CaptureMode::Interrupt);
    assert_eq!(config.calibration.recalibration_period, Duration::from_secs(60));
    assert_eq!(config.offsets.tdc_user_ps, 16_000);
    // untouched sections keep their defaults
    assert_eq!(config.tdc.reference_clock_khz, BoardConfig::default().tdc.reference_clock_khz);

    let board = open_board(&SimulatedCard::new(), config)?;
    assert_eq!(board.state(), BoardState::Running);
    assert_eq!(board.config().ring_capacity, 64);
    Ok(())
}

#[test]
fn test_written_config_reloads_identically() -> anyhow::Result<()> {
    let config = BoardConfig::from_toml(FAST_BOARD)?;
    let mut file = NamedTempFile::new()?;
    file.write_all(config.to_toml()?.as_bytes())?;
    assert_eq!(BoardConfig::from_file(file.path())?, config);
    Ok(())
}

#[test]
fn test_invalid_config_rejected_at_open() {
    let config = BoardConfig::from_toml("ring_capacity = 100").unwrap();
    let err = open_board(&SimulatedCard::new(), config).unwrap_err();
    assert!(format!("{err:#}").contains("ring_capacity 100"));
}
