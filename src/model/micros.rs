//! Fixed-point micros arithmetic.
//!
//! Prices, spreads and bps are ordinary `i64`. Shares and notional are
//! arbitrary-precision (`Amount`) since accumulated leader trades over a long
//! window can in principle exceed 64 bits of micros.

use num_bigint::BigInt;
use num_traits::{ToPrimitive, Zero};
use serde::{de, Deserialize, Deserializer, Serialize, Serializer};
use std::cmp::Ordering;
use std::fmt;
use std::ops::{Add, Neg, Sub};

/// One micro = 1e-6 of a dollar, a share, or a unit price in [0, 1].
pub const MICRO: i64 = 1_000_000;

/// Price of one share of an outcome token, in micros. `[0, 1_000_000]` in a
/// well-formed book, but callers should not assume that range holds for
/// config-derived bounds.
pub type PriceMicros = i64;

/// Basis points, 1/10_000.
pub type Bps = i64;

/// Arbitrary-precision quantity of shares or notional dollars, in micros.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Amount(BigInt);

impl Amount {
    pub fn zero() -> Self {
        Amount(BigInt::zero())
    }

    pub fn from_i64(v: i64) -> Self {
        Amount(BigInt::from(v))
    }

    pub fn from_micros_str(s: &str) -> Option<Self> {
        s.parse::<BigInt>().ok().map(Amount)
    }

    pub fn is_zero(&self) -> bool {
        self.0 == BigInt::zero()
    }

    pub fn is_positive(&self) -> bool {
        self.0 > BigInt::zero()
    }

    pub fn is_negative(&self) -> bool {
        self.0 < BigInt::zero()
    }

    pub fn abs(&self) -> Self {
        Amount(if self.0 < BigInt::zero() {
            -&self.0
        } else {
            self.0.clone()
        })
    }

    pub fn min(&self, other: &Self) -> Self {
        if self.0 <= other.0 {
            self.clone()
        } else {
            other.clone()
        }
    }

    pub fn max(&self, other: &Self) -> Self {
        if self.0 >= other.0 {
            self.clone()
        } else {
            other.clone()
        }
    }

    /// Truncating conversion to i64, saturating at the bounds. Used only at
    /// API/persistence edges where a field is documented as fitting in i64.
    pub fn to_i64_saturating(&self) -> i64 {
        self.0
            .to_i64()
            .unwrap_or(if self.0.is_negative() { i64::MIN } else { i64::MAX })
    }

    pub fn as_bigint(&self) -> &BigInt {
        &self.0
    }

    /// `self * numerator / denominator`, truncating toward zero like the
    /// integer division used throughout the spec's micros arithmetic.
    pub fn mul_div(&self, numerator: i64, denominator: i64) -> Self {
        assert!(denominator != 0, "mul_div by zero denominator");
        Amount((&self.0 * BigInt::from(numerator)) / BigInt::from(denominator))
    }
}

impl Default for Amount {
    fn default() -> Self {
        Amount::zero()
    }
}

impl From<i64> for Amount {
    fn from(v: i64) -> Self {
        Amount::from_i64(v)
    }
}

impl Add for &Amount {
    type Output = Amount;
    fn add(self, rhs: &Amount) -> Amount {
        Amount(&self.0 + &rhs.0)
    }
}

impl Sub for &Amount {
    type Output = Amount;
    fn sub(self, rhs: &Amount) -> Amount {
        Amount(&self.0 - &rhs.0)
    }
}

impl Neg for &Amount {
    type Output = Amount;
    fn neg(self) -> Amount {
        Amount(-&self.0)
    }
}

impl PartialOrd for Amount {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.0.cmp(&other.0))
    }
}

impl Ord for Amount {
    fn cmp(&self, other: &Self) -> Ordering {
        self.0.cmp(&other.0)
    }
}

impl fmt::Display for Amount {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl Serialize for Amount {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.0.to_string())
    }
}

impl<'de> Deserialize<'de> for Amount {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse::<BigInt>()
            .map(Amount)
            .map_err(|_| de::Error::custom(format!("invalid micros amount: {s}")))
    }
}

/// `notional = shares * price / 1_000_000`.
pub fn notional_from_shares(shares: &Amount, price: PriceMicros) -> Amount {
    shares.mul_div(price, MICRO)
}

/// `shares = notional * 1_000_000 / price`. `price` is floored at 1 micro to
/// avoid division by zero; callers are expected to have already rejected
/// non-positive prices upstream.
pub fn shares_from_notional(notional: &Amount, price: PriceMicros) -> Amount {
    notional.mul_div(MICRO, price.max(1))
}

/// `vwap = notional * 1_000_000 / shares`, rounded to the nearest micro. `0`
/// when there are no shares.
pub fn vwap_price(notional: &Amount, shares: &Amount) -> PriceMicros {
    if shares.is_zero() {
        return 0;
    }
    round_div_bigint(&(notional.as_bigint() * BigInt::from(MICRO)), shares.as_bigint())
}

/// `amount * bps / 10_000`.
pub fn bps_of_amount(amount: &Amount, bps: Bps) -> Amount {
    amount.mul_div(bps, 10_000)
}

/// `value * bps / 10_000`, for plain i64 values (equity, exposure caps).
pub fn bps_of_i64(value: i64, bps: Bps) -> i64 {
    // i128 intermediate: equity/exposure in micros times a few-thousand bps
    // fits comfortably and avoids silent truncation on overflow-prone inputs.
    ((value as i128) * (bps as i128) / 10_000) as i64
}

/// Ratio in bps: `round(numerator * 10_000 / denominator)`, `0` if denominator is zero.
pub fn ratio_bps(numerator: &Amount, denominator: &Amount) -> i64 {
    if denominator.is_zero() {
        return 0;
    }
    round_div_bigint(&(numerator.as_bigint() * BigInt::from(10_000)), denominator.as_bigint())
}

fn round_div_bigint(numerator: &BigInt, denominator: &BigInt) -> i64 {
    if denominator.is_zero() {
        return 0;
    }
    let q = numerator / denominator;
    let r = numerator - &q * denominator;
    // Round-half-away-from-zero on the remainder.
    let rounded = if (&r * BigInt::from(2)).abs() >= denominator.abs() {
        if (numerator.is_negative()) != (denominator.is_negative()) {
            q - 1
        } else {
            q + 1
        }
    } else {
        q
    };
    rounded.to_i64().unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn vwap_identity_matches_spec_example() {
        let notional = Amount::from_i64(5_000_000);
        let shares = Amount::from_i64(10_000_000);
        assert_eq!(vwap_price(&notional, &shares), 500_000);
    }

    #[test]
    fn mul_div_truncates_toward_zero() {
        let a = Amount::from_i64(7);
        assert_eq!(a.mul_div(1, 2).to_i64_saturating(), 3);
    }

    #[test]
    fn bps_of_i64_matches_manual_fraction() {
        assert_eq!(bps_of_i64(10_000_000, 7_000), 7_000_000);
    }

    #[test]
    fn ratio_bps_rounds_to_nearest() {
        let filled = Amount::from_i64(98_039);
        let target = Amount::from_i64(100_000);
        // 98039 * 10000 / 100000 = 9803.9 -> rounds to 9804
        assert_eq!(ratio_bps(&filled, &target), 9804);
    }
}
