//! Board configuration.
//!
//! Loaded from TOML with defaults matching the production card, so an empty
//! file describes a working board.

use crate::error::{FdError, FdResult};
use crate::units::{CalibrationPolynomial, NUM_CHANNELS};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Top-level per-board configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BoardConfig {
    /// Software timestamp ring size (power of two).
    pub ring_capacity: usize,

    /// Timestamp capture pipeline.
    pub capture: CaptureConfig,

    /// Output delay-line calibration.
    pub calibration: CalibrationConfig,

    /// TDC chip parameters.
    pub tdc: TdcConfig,

    /// Board-level bring-up timing.
    pub hardware: HardwareConfig,

    /// Input and output offsets.
    pub offsets: OffsetConfig,
}

impl Default for BoardConfig {
    fn default() -> Self {
        Self {
            ring_capacity: 256,
            capture: CaptureConfig::default(),
            calibration: CalibrationConfig::default(),
            tdc: TdcConfig::default(),
            hardware: HardwareConfig::default(),
            offsets: OffsetConfig::default(),
        }
    }
}

/// How the timestamp FIFO is drained.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum CaptureMode {
    /// A timer thread drains the FIFO every `poll_interval`.
    #[default]
    Polled,
    /// The host invokes the interrupt line when the FIFO is not empty.
    Interrupt,
}

/// Capture pipeline configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CaptureConfig {
    /// Drain trigger.
    pub mode: CaptureMode,

    /// Tick period in polled mode.
    #[serde(with = "humantime_serde")]
    pub poll_interval: Duration,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            mode: CaptureMode::Polled,
            poll_interval: Duration::from_millis(10),
        }
    }
}

/// Scale from the TDC's I-mode FIFO result to R-mode bins.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ModeScale {
    /// Numerator.
    pub multiply: u32,
    /// Denominator, non-zero.
    pub divide: u32,
}

impl Default for ModeScale {
    fn default() -> Self {
        Self {
            multiply: 3,
            divide: 1,
        }
    }
}

impl ModeScale {
    /// Scale a fixed-point value.
    #[must_use]
    pub fn apply(&self, value: u64) -> u64 {
        value * u64::from(self.multiply) / u64::from(self.divide.max(1))
    }
}

/// Delay-line calibration configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CalibrationConfig {
    /// Run the calibration pass at open.
    pub enabled: bool,

    /// Measurements averaged per tap (power of two).
    pub repeats: u32,

    /// Temperature compensation period.
    #[serde(with = "humantime_serde")]
    pub recalibration_period: Duration,

    /// I-mode to R-mode scale of the raw measurement.
    pub mode_scale: ModeScale,

    /// Tap versus temperature fit.
    pub polynomial: CalibrationPolynomial,

    /// Settle time after arming a conversion.
    #[serde(with = "humantime_serde")]
    pub arm_settle: Duration,

    /// Settle time after the calibration pulse.
    #[serde(with = "humantime_serde")]
    pub pulse_settle: Duration,
}

impl Default for CalibrationConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            repeats: 1024,
            recalibration_period: Duration::from_secs(30),
            mode_scale: ModeScale::default(),
            polynomial: CalibrationPolynomial::default(),
            arm_settle: Duration::from_micros(100),
            pulse_settle: Duration::from_millis(10),
        }
    }
}

/// TDC chip configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TdcConfig {
    /// Reference clock feeding the TDC PLL.
    pub reference_clock_khz: u32,

    /// Target quantization step.
    pub desired_bin_ps: f64,

    /// Largest reference divider exponent tried by the PLL solver.
    pub max_refdiv: u8,

    /// Start offset programmed into the R and G mode tables.
    pub start_offset: u32,

    /// Upper bound on the PLL lock wait.
    #[serde(with = "humantime_serde")]
    pub lock_timeout: Duration,

    /// Lock bit polling interval.
    #[serde(with = "humantime_serde")]
    pub lock_poll: Duration,

    /// Settle time after the PLL reset sequence.
    #[serde(with = "humantime_serde")]
    pub reset_settle: Duration,
}

impl Default for TdcConfig {
    fn default() -> Self {
        Self {
            reference_clock_khz: 31_250,
            desired_bin_ps: 80.9553,
            max_refdiv: 7,
            start_offset: 10_000,
            lock_timeout: Duration::from_secs(2),
            lock_poll: Duration::from_millis(10),
            reset_settle: Duration::from_millis(100),
        }
    }
}

impl TdcConfig {
    /// Reference period in picoseconds with 16 fractional bits.
    #[must_use]
    pub fn reference_period_fp(&self) -> u64 {
        (1_000_000_000u64 << 16) / u64::from(self.reference_clock_khz.max(1))
    }

    /// Desired bin in picoseconds with 16 fractional bits.
    #[must_use]
    pub fn desired_bin_fp(&self) -> u64 {
        // truncation matches the fixed-point constant used by the gateware tools
        (self.desired_bin_ps * 65536.0) as u64
    }
}

/// Board bring-up timing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HardwareConfig {
    /// Upper bound on the DDR PLL lock wait.
    #[serde(with = "humantime_serde")]
    pub lock_timeout: Duration,

    /// Lock bit polling interval.
    #[serde(with = "humantime_serde")]
    pub lock_poll: Duration,

    /// Settle time after a core reset.
    #[serde(with = "humantime_serde")]
    pub reset_settle: Duration,
}

impl Default for HardwareConfig {
    fn default() -> Self {
        Self {
            lock_timeout: Duration::from_secs(2),
            lock_poll: Duration::from_millis(10),
            reset_settle: Duration::from_millis(10),
        }
    }
}

/// Picosecond offsets applied to input timestamps and output pulses.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct OffsetConfig {
    /// Calibrated input path delay, subtracted from every timestamp.
    pub tdc_zero_ps: i64,

    /// User input offset, added to every timestamp.
    pub tdc_user_ps: i64,

    /// Calibrated output path delay per channel.
    pub channel_zero_ps: [i64; NUM_CHANNELS],

    /// User output offset per channel.
    pub channel_user_ps: [i64; NUM_CHANNELS],
}

impl BoardConfig {
    /// Load configuration from a TOML file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn from_file(path: &std::path::Path) -> Result<Self, ConfigFileError> {
        let content = std::fs::read_to_string(path).map_err(|e| ConfigFileError::Io {
            path: path.to_path_buf(),
            source: e,
        })?;
        Self::from_toml(&content)
    }

    /// Parse configuration from a TOML string.
    ///
    /// # Errors
    ///
    /// Returns an error if the TOML is invalid.
    pub fn from_toml(content: &str) -> Result<Self, ConfigFileError> {
        toml::from_str(content).map_err(ConfigFileError::Parse)
    }

    /// Serialize configuration to TOML string.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization fails.
    pub fn to_toml(&self) -> Result<String, ConfigFileError> {
        toml::to_string_pretty(self).map_err(ConfigFileError::Serialize)
    }

    /// Check the values a board cannot be opened with.
    ///
    /// # Errors
    ///
    /// Returns [`FdError::Config`] describing the first invalid field.
    pub fn validate(&self) -> FdResult<()> {
        if !self.ring_capacity.is_power_of_two() {
            return Err(FdError::Config(format!(
                "ring_capacity {} is not a power of two",
                self.ring_capacity
            )));
        }
        if self.capture.mode == CaptureMode::Polled && self.capture.poll_interval.is_zero() {
            return Err(FdError::Config("capture.poll_interval must be non-zero".into()));
        }
        if !self.calibration.repeats.is_power_of_two() {
            return Err(FdError::Config(format!(
                "calibration.repeats {} is not a power of two",
                self.calibration.repeats
            )));
        }
        if self.calibration.mode_scale.divide == 0 || self.calibration.mode_scale.multiply == 0 {
            return Err(FdError::Config("calibration.mode_scale terms must be non-zero".into()));
        }
        if self.calibration.recalibration_period.is_zero() {
            return Err(FdError::Config(
                "calibration.recalibration_period must be non-zero".into(),
            ));
        }
        if self.tdc.reference_clock_khz == 0 || self.tdc.desired_bin_fp() == 0 {
            return Err(FdError::Config(
                "tdc.reference_clock_khz and tdc.desired_bin_ps must be positive".into(),
            ));
        }
        if self.tdc.max_refdiv > 7 {
            return Err(FdError::Config(format!(
                "tdc.max_refdiv {} exceeds the 3-bit field",
                self.tdc.max_refdiv
            )));
        }
        if self.tdc.lock_poll.is_zero() || self.hardware.lock_poll.is_zero() {
            return Err(FdError::Config("lock poll intervals must be non-zero".into()));
        }
        Ok(())
    }
}

/// Configuration file errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigFileError {
    /// File I/O error.
    #[error("failed to read config file {path}: {source}")]
    Io {
        /// Path to the configuration file.
        path: PathBuf,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// TOML parsing error.
    #[error("failed to parse TOML: {0}")]
    Parse(#[from] toml::de::Error),

    /// TOML serialization error.
    #[error("failed to serialize TOML: {0}")]
    Serialize(#[from] toml::ser::Error),
}

/// Serde helper module for `Duration` using humantime format.
mod humantime_serde {
    use serde::{self, Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let s = humantime::format_duration(*duration).to_string();
        serializer.serialize_str(&s)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        humantime::parse_duration(&s).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_default_config() {
        let config = BoardConfig::default();
        assert_eq!(config.ring_capacity, 256);
        assert_eq!(config.capture.poll_interval, Duration::from_millis(10));
        assert_eq!(config.calibration.recalibration_period, Duration::from_secs(30));
        assert_eq!(config.calibration.mode_scale.apply(100), 300);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_fixed_point_tdc_parameters() {
        let tdc = TdcConfig::default();
        assert_eq!(tdc.reference_period_fp(), 32_000 << 16);
        assert_eq!(tdc.desired_bin_fp(), 5_305_486);
    }

    #[test]
    fn test_parse_toml() {
        let toml = r#"
            ring_capacity = 1024

            [capture]
            mode = "interrupt"

            [calibration]
            repeats = 16
            recalibration_period = "1m"
            arm_settle = "0s"

            [calibration.polynomial]
            c2 = 4294967296

            [offsets]
            tdc_zero_ps = 51000
            channel_user_ps = [0, -1000, 0, 2000]
        "#;

        let config = BoardConfig::from_toml(toml).unwrap();
        assert_eq!(config.ring_capacity, 1024);
        assert_eq!(config.capture.mode, CaptureMode::Interrupt);
        assert_eq!(config.calibration.repeats, 16);
        assert_eq!(config.calibration.recalibration_period, Duration::from_secs(60));
        assert_eq!(config.calibration.arm_settle, Duration::ZERO);
        assert_eq!(config.calibration.polynomial.c2, 1 << 32);
        assert_eq!(config.offsets.tdc_zero_ps, 51_000);
        assert_eq!(config.offsets.channel_user_ps[1], -1000);
        // untouched sections keep defaults
        assert_eq!(config.tdc.lock_timeout, Duration::from_secs(2));
    }

    #[test]
    fn test_roundtrip_toml() {
        let config = BoardConfig::default();
        let toml = config.to_toml().unwrap();
        let parsed = BoardConfig::from_toml(&toml).unwrap();
        assert_eq!(config, parsed);
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let mut config = BoardConfig {
            ring_capacity: 7,
            ..BoardConfig::default()
        };
        assert!(matches!(config.validate(), Err(FdError::Config(_))));

        config.ring_capacity = 8;
        config.calibration.repeats = 12;
        assert!(config.validate().is_err());

        config.calibration.repeats = 8;
        config.capture.poll_interval = Duration::ZERO;
        assert!(config.validate().is_err());

        config.capture.mode = CaptureMode::Interrupt;
        assert!(config.validate().is_ok());

        config.tdc.max_refdiv = 8;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "ring_capacity = 64").unwrap();
        let config = BoardConfig::from_file(file.path()).unwrap();
        assert_eq!(config.ring_capacity, 64);

        let missing = BoardConfig::from_file(std::path::Path::new("/nonexistent/fd.toml"));
        assert!(matches!(missing, Err(ConfigFileError::Io { .. })));
    }
}
