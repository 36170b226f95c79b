//! Fixed-point dose amounts in the device's 25.6 mL / 0.1 mL scheme.
//!
//! On the wire a dose is a `(hi, lo)` byte pair: `hi` counts whole 25.6 mL
//! buckets and `lo` the remainder in tenths of a millilitre. Since 25.6 mL is
//! exactly 256 tenths, the pair is the big-endian split of the amount in
//! tenths, which lets everything here stay in integer arithmetic.

use crate::error::{ChihirosError, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Tenths of a millilitre per `hi` bucket
const TENTHS_PER_BUCKET: u16 = 256;

/// Smallest accepted dose, 0.2 mL
pub const MIN_DOSE_TENTHS: u16 = 2;

/// Largest accepted dose, 999.9 mL
pub const MAX_DOSE_TENTHS: u16 = 9999;

/// A validated dose amount in `[0.2, 999.9]` mL at 0.1 mL resolution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "f64", into = "f64")]
pub struct DoseQuantity {
    tenths: u16,
}

impl DoseQuantity {
    pub fn from_tenths(tenths: u16) -> Result<Self> {
        if !(MIN_DOSE_TENTHS..=MAX_DOSE_TENTHS).contains(&tenths) {
            return Err(ChihirosError::DoseOutOfRange {
                ml: format!("{}.{}", tenths / 10, tenths % 10),
            });
        }
        Ok(Self { tenths })
    }

    /// Round `ml` half-up to one decimal and validate the range.
    ///
    /// Rounding works on the shortest decimal rendering of the float, so
    /// `2.25` rounds to `2.3` even though its binary value is slightly below.
    pub fn from_ml(ml: f64) -> Result<Self> {
        if !ml.is_finite() {
            return Err(ChihirosError::DoseOutOfRange { ml: ml.to_string() });
        }
        ml.to_string().parse()
    }

    pub fn tenths(self) -> u16 {
        self.tenths
    }

    pub fn ml(self) -> f64 {
        f64::from(self.tenths) / 10.0
    }

    /// Split into the wire `(hi, lo)` pair.
    ///
    /// Exact multiples of 25.6 mL land in the next bucket with `lo == 0`
    /// (25.6 mL is `(1, 0)`, never `(0, 256)`).
    pub fn encode(self) -> (u8, u8) {
        let hi = self.tenths / TENTHS_PER_BUCKET;
        let lo = self.tenths % TENTHS_PER_BUCKET;
        (hi as u8, lo as u8)
    }

    /// Build from a wire pair, enforcing the dose range.
    pub fn from_pair(hi: u8, lo: u8) -> Result<Self> {
        Self::from_tenths(pair_tenths(hi, lo))
    }
}

/// Amount in mL carried by a `(hi, lo)` pair; total over every byte pair.
pub fn decode(hi: u8, lo: u8) -> f64 {
    f64::from(pair_tenths(hi, lo)) / 10.0
}

/// Shorthand for `DoseQuantity::from_ml(ml)?.encode()`.
pub fn encode(ml: f64) -> Result<(u8, u8)> {
    Ok(DoseQuantity::from_ml(ml)?.encode())
}

fn pair_tenths(hi: u8, lo: u8) -> u16 {
    u16::from(hi) * TENTHS_PER_BUCKET + u16::from(lo)
}

impl FromStr for DoseQuantity {
    type Err = ChihirosError;

    /// Parse a decimal string such as `"12.5"` or `"12,5"`.
    fn from_str(s: &str) -> Result<Self> {
        let trimmed = s.trim();
        let out_of_range = || ChihirosError::DoseOutOfRange {
            ml: trimmed.to_string(),
        };
        let invalid = || ChihirosError::InvalidParameter(format!("not a decimal amount: {trimmed:?}"));

        let normalized = trimmed.replace(',', ".");
        let (negative, unsigned) = match normalized.strip_prefix('-') {
            Some(rest) => (true, rest),
            None => (false, normalized.strip_prefix('+').unwrap_or(&normalized)),
        };
        let (int_part, frac_part) = unsigned.split_once('.').unwrap_or((unsigned, ""));
        if (int_part.is_empty() && frac_part.is_empty())
            || !int_part.bytes().all(|b| b.is_ascii_digit())
            || !frac_part.bytes().all(|b| b.is_ascii_digit())
        {
            return Err(invalid());
        }

        let whole: u64 = if int_part.is_empty() {
            0
        } else {
            int_part.parse().map_err(|_| out_of_range())?
        };
        let mut frac = frac_part.bytes().map(|b| u64::from(b - b'0'));
        let first = frac.next().unwrap_or(0);
        let round_up = frac.next().is_some_and(|d| d >= 5);

        let tenths = whole
            .checked_mul(10)
            .and_then(|t| t.checked_add(first + u64::from(round_up)))
            .ok_or_else(out_of_range)?;
        if negative && tenths != 0 {
            return Err(out_of_range());
        }
        let tenths = u16::try_from(tenths).map_err(|_| out_of_range())?;
        Self::from_tenths(tenths)
    }
}

impl TryFrom<f64> for DoseQuantity {
    type Error = ChihirosError;

    fn try_from(ml: f64) -> Result<Self> {
        Self::from_ml(ml)
    }
}

impl From<DoseQuantity> for f64 {
    fn from(dose: DoseQuantity) -> Self {
        dose.ml()
    }
}

impl fmt::Display for DoseQuantity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{} mL", self.tenths / 10, self.tenths % 10)
    }
}
