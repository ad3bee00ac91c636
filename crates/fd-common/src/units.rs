//! Small validated value types: output channels, temperatures and the
//! delay-line temperature polynomial.

use crate::error::{FdError, FdResult};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Number of fine-delay taps in each output delay line.
pub const NUM_TAPS: u16 = 1024;
/// Highest programmable tap.
pub const MAX_TAP: u16 = NUM_TAPS - 1;
/// Number of output channels on the card.
pub const NUM_CHANNELS: usize = 4;

/// Output channel, stored as the internal index 0..3 and displayed as 1..4.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub struct Channel(u8);

impl Channel {
    /// All output channels in index order.
    pub const ALL: [Channel; NUM_CHANNELS] = [Channel(0), Channel(1), Channel(2), Channel(3)];

    /// Create a channel from its internal index.
    ///
    /// # Errors
    ///
    /// Returns [`FdError::Config`] for indices above 3.
    pub fn new(index: u8) -> FdResult<Self> {
        if usize::from(index) < NUM_CHANNELS {
            Ok(Self(index))
        } else {
            Err(FdError::Config(format!(
                "channel index {index} out of range [0, {NUM_CHANNELS})"
            )))
        }
    }

    /// Internal index, 0..3.
    #[must_use]
    pub const fn index(self) -> usize {
        self.0 as usize
    }

    /// Number printed on the front panel, 1..4.
    #[must_use]
    pub const fn external(self) -> u8 {
        self.0 + 1
    }
}

impl TryFrom<u8> for Channel {
    type Error = FdError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<Channel> for u8 {
    fn from(ch: Channel) -> u8 {
        ch.0
    }
}

impl fmt::Display for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.external())
    }
}

/// Board temperature in 1/16 degree Celsius.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
pub struct Temperature(pub i16);

impl Temperature {
    /// Temperature from whole degrees.
    #[must_use]
    pub const fn from_celsius(deg: i16) -> Self {
        Self(deg * 16)
    }

    /// Decode the thermometer's 16-bit scratchpad word.
    ///
    /// Only 13 bits are significant; bit 12 is the sign.
    #[must_use]
    pub fn from_sensor_word(raw: u16) -> Self {
        let v = i32::from(raw & 0x1fff);
        let v = if v & 0x1000 != 0 { v - 0x2000 } else { v };
        // 13-bit range always fits
        Self(v as i16)
    }

    /// Raw value in sixteenths of a degree.
    #[must_use]
    pub const fn sixteenths(self) -> i16 {
        self.0
    }

    /// Degrees Celsius as a float, for display.
    #[must_use]
    pub fn celsius(self) -> f64 {
        f64::from(self.0) / 16.0
    }
}

impl fmt::Display for Temperature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:.2}C", self.celsius())
    }
}

/// Second-order delay-line tap polynomial over temperature.
///
/// `tap(t) = (c0 * t^2 + c1 * t + c2) >> 32`, where `t` is in 1/16 degree
/// and the coefficients carry 32 fractional bits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct CalibrationPolynomial {
    /// Quadratic coefficient.
    pub c0: i64,
    /// Linear coefficient.
    pub c1: i64,
    /// Constant term.
    pub c2: i64,
}

impl CalibrationPolynomial {
    /// Evaluate the polynomial at `temp`.
    #[must_use]
    pub fn eval(&self, temp: Temperature) -> i64 {
        let x = i128::from(temp.sixteenths());
        let acc = i128::from(self.c0) * x * x + i128::from(self.c1) * x + i128::from(self.c2);
        // |acc| < 2^96, so the shifted value fits in i64
        (acc >> 32) as i64
    }
}

/// Clamp a signed tap value into the programmable range.
#[must_use]
pub fn clamp_tap(tap: i64) -> u16 {
    tap.clamp(0, i64::from(MAX_TAP)) as u16
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_channel_range() {
        assert!(Channel::new(3).is_ok());
        assert!(matches!(Channel::new(4), Err(FdError::Config(_))));
        assert_eq!(Channel::ALL[2].external(), 3);
        assert_eq!(Channel::ALL[0].to_string(), "1");
    }

    #[test]
    fn test_channel_serde_validates() {
        let ch: Channel = serde_json::from_str("1").unwrap();
        assert_eq!(ch.index(), 1);
        assert!(serde_json::from_str::<Channel>("9").is_err());
    }

    #[test]
    fn test_temperature_sign_extension() {
        assert_eq!(Temperature::from_sensor_word(0x0191), Temperature(401)); // +25.0625 C
        assert_eq!(Temperature::from_sensor_word(0xff5e), Temperature(-162)); // -10.125 C
        assert_eq!(Temperature::from_celsius(45).sixteenths(), 720);
    }

    #[test]
    fn test_polynomial_eval() {
        // tap = 2 * t + 100
        let poly = CalibrationPolynomial {
            c0: 0,
            c1: 2 << 32,
            c2: 100 << 32,
        };
        assert_eq!(poly.eval(Temperature(10)), 120);

        let quad = CalibrationPolynomial {
            c0: 1 << 30, // 0.25
            c1: 0,
            c2: 0,
        };
        assert_eq!(quad.eval(Temperature(-8)), 16);
    }

    #[test]
    fn test_polynomial_large_coefficients_do_not_overflow() {
        let poly = CalibrationPolynomial {
            c0: i64::MAX,
            c1: 0,
            c2: 0,
        };
        assert!(poly.eval(Temperature(2000)) > 0);
    }

    #[test]
    fn test_clamp_tap() {
        assert_eq!(clamp_tap(-5), 0);
        assert_eq!(clamp_tap(500), 500);
        assert_eq!(clamp_tap(4000), MAX_TAP);
    }
}
