//! Fixed-point board time.
//!
//! A [`TimeValue`] splits time into three fields:
//!
//! - `utc`: whole seconds;
//! - `coarse`: 8 ns reference-clock cycles within the second, `[0, 125_000_000)`;
//! - `frac`: 1/4096 of a cycle (about 1.95 ps), `[0, 4096)`.
//!
//! Every public constructor and operator returns a normalized value. Values read
//! straight from the timestamp FIFO are not normalized; they arrive as
//! [`RawSample`] and must go through [`normalize`] first.

use crate::error::{FdError, FdResult};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::ops::{Add, Sub};

/// Reference-clock cycles per second (125 MHz).
pub const CYCLES_PER_SECOND: u32 = 125_000_000;
/// Fractional steps per cycle.
pub const FRAC_PER_CYCLE: u16 = 4096;
/// Picoseconds per reference-clock cycle.
pub const PS_PER_CYCLE: u64 = 8000;
/// Picoseconds per second.
pub const PS_PER_SECOND: u64 = 1_000_000_000_000;

/// Width of the hardware coarse counter.
const COARSE_BITS: u32 = 28;
const COARSE_MASK: u32 = (1 << COARSE_BITS) - 1;
const COARSE_SIGN: u32 = 1 << (COARSE_BITS - 1);
const FRAC_MASK: u16 = FRAC_PER_CYCLE - 1;

/// Normalized three-field timestamp, tagged with the input channel and sequence id.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
#[serde(try_from = "TimeFields")]
pub struct TimeValue {
    utc: i64,
    coarse: u32,
    frac: u16,
    channel: u8,
    seq: u16,
}

/// Unchecked field bundle used to validate deserialized values.
#[derive(Deserialize)]
struct TimeFields {
    utc: i64,
    coarse: u32,
    frac: u16,
    #[serde(default)]
    channel: u8,
    #[serde(default)]
    seq: u16,
}

impl TryFrom<TimeFields> for TimeValue {
    type Error = FdError;

    fn try_from(f: TimeFields) -> Result<Self, Self::Error> {
        Ok(Self::new(f.utc, f.coarse, f.frac)?.with_tag(f.channel, f.seq))
    }
}

impl TimeValue {
    /// The zero time (also the zero-length interval).
    pub const ZERO: Self = Self {
        utc: 0,
        coarse: 0,
        frac: 0,
        channel: 0,
        seq: 0,
    };

    /// Create a time value from already-normalized fields.
    ///
    /// # Errors
    ///
    /// Returns [`FdError::Config`] if `coarse` or `frac` is out of range.
    pub fn new(utc: i64, coarse: u32, frac: u16) -> FdResult<Self> {
        if coarse >= CYCLES_PER_SECOND {
            return Err(FdError::Config(format!(
                "coarse {coarse} out of range [0, {CYCLES_PER_SECOND})"
            )));
        }
        if frac >= FRAC_PER_CYCLE {
            return Err(FdError::Config(format!(
                "frac {frac} out of range [0, {FRAC_PER_CYCLE})"
            )));
        }
        Ok(Self {
            utc,
            coarse,
            frac,
            channel: 0,
            seq: 0,
        })
    }

    /// Whole seconds only.
    #[must_use]
    pub const fn from_secs(utc: i64) -> Self {
        Self {
            utc,
            coarse: 0,
            frac: 0,
            channel: 0,
            seq: 0,
        }
    }

    /// Attach the input channel and sequence id.
    #[must_use]
    pub const fn with_tag(mut self, channel: u8, seq: u16) -> Self {
        self.channel = channel;
        self.seq = seq;
        self
    }

    /// Seconds field.
    #[must_use]
    pub const fn utc(&self) -> i64 {
        self.utc
    }

    /// Cycle field, `[0, 125_000_000)`.
    #[must_use]
    pub const fn coarse(&self) -> u32 {
        self.coarse
    }

    /// Fraction field, `[0, 4096)`.
    #[must_use]
    pub const fn frac(&self) -> u16 {
        self.frac
    }

    /// Input channel the timestamp was taken on.
    #[must_use]
    pub const fn channel(&self) -> u8 {
        self.channel
    }

    /// Hardware sequence id.
    #[must_use]
    pub const fn seq(&self) -> u16 {
        self.seq
    }

    /// Sum of two times, carrying frac into coarse and coarse into utc.
    ///
    /// The channel and sequence tag of `self` are kept.
    #[must_use]
    pub fn add(self, other: Self) -> Self {
        let mut frac = u32::from(self.frac) + u32::from(other.frac);
        let mut coarse = self.coarse + other.coarse;
        let mut utc = self.utc + other.utc;

        if frac >= u32::from(FRAC_PER_CYCLE) {
            frac -= u32::from(FRAC_PER_CYCLE);
            coarse += 1;
        }
        if coarse >= CYCLES_PER_SECOND {
            coarse -= CYCLES_PER_SECOND;
            utc += 1;
        }

        Self {
            utc,
            coarse,
            // frac < 4096 after the carry
            frac: frac as u16,
            channel: self.channel,
            seq: self.seq,
        }
    }

    /// Difference `self - other`, borrowing from coarse into frac and from utc into coarse.
    ///
    /// The result may have a negative `utc` when `other > self`.
    #[must_use]
    pub fn subtract(self, other: Self) -> Self {
        let mut frac = i32::from(self.frac) - i32::from(other.frac);
        let mut coarse = i64::from(self.coarse) - i64::from(other.coarse);
        let mut utc = self.utc - other.utc;

        if frac < 0 {
            frac += i32::from(FRAC_PER_CYCLE);
            coarse -= 1;
        }
        if coarse < 0 {
            coarse += i64::from(CYCLES_PER_SECOND);
            utc -= 1;
        }

        Self {
            utc,
            coarse: coarse as u32,
            frac: frac as u16,
            channel: self.channel,
            seq: self.seq,
        }
    }

    /// Shift by a signed picosecond offset.
    ///
    /// Positive offsets are added, negative ones subtracted.
    #[must_use]
    pub fn apply_offset(self, offset_ps: i64) -> Self {
        if offset_ps >= 0 {
            self.add(pico_to_time(offset_ps.unsigned_abs()))
        } else {
            self.subtract(pico_to_time(offset_ps.unsigned_abs()))
        }
    }

    /// Total picoseconds represented by this value.
    #[must_use]
    pub fn to_picos(&self) -> i128 {
        time_to_pico(self)
    }

    /// Returns true for values strictly before zero.
    #[must_use]
    pub const fn is_negative(&self) -> bool {
        self.utc < 0
    }
}

impl Add for TimeValue {
    type Output = TimeValue;

    fn add(self, rhs: TimeValue) -> TimeValue {
        TimeValue::add(self, rhs)
    }
}

impl Sub for TimeValue {
    type Output = TimeValue;

    fn sub(self, rhs: TimeValue) -> TimeValue {
        TimeValue::subtract(self, rhs)
    }
}

impl fmt::Display for TimeValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let ps = u64::from(self.coarse) * PS_PER_CYCLE + frac_to_picos(self.frac);
        write!(f, "{}.{:012}", self.utc, ps)
    }
}

/// Timestamp exactly as read from the FIFO registers, before normalization.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RawSample {
    /// Seconds register.
    pub utc: i64,
    /// 28-bit coarse counter, possibly a small negative excursion.
    pub coarse: u32,
    /// Fine field (only the low 12 bits are meaningful).
    pub frac: u16,
    /// Input channel.
    pub channel: u8,
    /// Hardware sequence id.
    pub seq: u16,
}

/// Decode the 28-bit coarse counter.
///
/// Bit 27 marks a negative excursion below the second boundary. Returns the
/// seconds adjustment and the cycle count in `[0, 125_000_000)`.
#[must_use]
pub fn decode_coarse(raw: u32) -> (i64, u32) {
    let raw = raw & COARSE_MASK;
    let signed = if raw & COARSE_SIGN != 0 {
        i64::from(raw) - i64::from(COARSE_MASK) - 1
    } else {
        i64::from(raw)
    };
    let cycles = i64::from(CYCLES_PER_SECOND);
    (signed.div_euclid(cycles), signed.rem_euclid(cycles) as u32)
}

/// Bring a freshly captured sample into range.
#[must_use]
pub fn normalize(raw: RawSample) -> TimeValue {
    let (carry, coarse) = decode_coarse(raw.coarse);
    TimeValue {
        utc: raw.utc + carry,
        coarse,
        frac: raw.frac & FRAC_MASK,
        channel: raw.channel,
        seq: raw.seq,
    }
}

/// Convert a picosecond count into board time.
///
/// The fraction is truncated to whole 1/4096 cycles, matching what the
/// hardware is programmed with. Whole-cycle values convert exactly.
#[must_use]
pub fn pico_to_time(ps: u64) -> TimeValue {
    let utc = ps / PS_PER_SECOND;
    let rem = ps % PS_PER_SECOND;
    let coarse = rem / PS_PER_CYCLE;
    let sub = rem % PS_PER_CYCLE;
    let frac = sub * u64::from(FRAC_PER_CYCLE) / PS_PER_CYCLE;

    TimeValue {
        utc: utc as i64,
        coarse: coarse as u32,
        // sub < 8000 keeps frac below 4096
        frac: frac as u16,
        channel: 0,
        seq: 0,
    }
}

/// Convert board time into picoseconds, rounding the fraction to the nearest picosecond.
#[must_use]
pub fn time_to_pico(t: &TimeValue) -> i128 {
    i128::from(t.utc) * i128::from(PS_PER_SECOND)
        + i128::from(t.coarse) * i128::from(PS_PER_CYCLE)
        + i128::from(frac_to_picos(t.frac))
}

fn frac_to_picos(frac: u16) -> u64 {
    (u64::from(frac) * PS_PER_CYCLE + u64::from(FRAC_PER_CYCLE) / 2) / u64::from(FRAC_PER_CYCLE)
}
