use std::{
    fmt::Display,
    iter::Sum,
    ops::{Add, Mul, Neg, Sub, SubAssign},
};

use serde::{Deserialize, Serialize};
use sqlx::Type;
use thiserror::Error;

use crate::op;

pub const KES_CURRENCY_CODE: &str = "KES";
pub const USD_CURRENCY_CODE: &str = "USD";

/// One whole unit expressed in micro-units (6 decimal places).
const MICRO: i64 = 1_000_000;
/// Rounding quantum for 2-decimal display values, in micro-units.
const CENT: i64 = 10_000;

#[derive(Debug, Clone, Error)]
#[error("Value cannot be represented as fixed-point money: {0}")]
pub struct MoneyConversionError(String);

fn round_to_cent(micro: i64) -> i64 {
    // Round half away from zero to the nearest 0.01.
    if micro >= 0 {
        (micro + CENT / 2) / CENT * CENT
    } else {
        -((-micro + CENT / 2) / CENT * CENT)
    }
}

fn f64_to_micro(value: f64) -> Result<i64, MoneyConversionError> {
    if !value.is_finite() {
        return Err(MoneyConversionError(format!("{value} is not a finite number")));
    }
    let scaled = (value * MICRO as f64).round();
    if scaled > i64::MAX as f64 || scaled < i64::MIN as f64 {
        return Err(MoneyConversionError(format!("{value} is out of range")));
    }
    Ok(scaled as i64)
}

fn format_fixed(micro: i64, decimals: u32) -> String {
    let sign = if micro < 0 { "-" } else { "" };
    let abs = micro.unsigned_abs();
    let scale = 10u64.pow(6 - decimals);
    // Truncation here is fine: callers round first.
    let quantised = abs / scale;
    let unit = 10u64.pow(decimals);
    format!("{sign}{}.{:0width$}", quantised / unit, quantised % unit, width = decimals as usize)
}

//--------------------------------------     MicroKes       ---------------------------------------------------------

/// A Kenyan Shilling amount in millionths of a shilling.
///
/// All KES arithmetic in the gateway is integer arithmetic over this type. Display values
/// are rounded to 2 decimal places; the raw micro value is what gets persisted and signed over.
#[derive(Debug, Clone, Copy, Default, Type, Ord, PartialOrd, Serialize, Deserialize)]
#[sqlx(transparent)]
pub struct MicroKes(i64);

op!(binary MicroKes, Add, add);
op!(binary MicroKes, Sub, sub);
op!(inplace MicroKes, SubAssign, sub_assign);
op!(unary MicroKes, Neg, neg);

impl Mul<i64> for MicroKes {
    type Output = Self;

    fn mul(self, rhs: i64) -> Self::Output {
        Self(self.0 * rhs)
    }
}

impl Sum for MicroKes {
    fn sum<I: Iterator<Item = Self>>(iter: I) -> Self {
        iter.fold(Self::default(), Add::add)
    }
}

impl From<i64> for MicroKes {
    fn from(value: i64) -> Self {
        Self(value)
    }
}

impl PartialEq for MicroKes {
    fn eq(&self, other: &Self) -> bool {
        self.0 == other.0
    }
}

impl Eq for MicroKes {}

impl Display for MicroKes {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} KES", self.format_2dp())
    }
}

impl MicroKes {
    pub fn value(&self) -> i64 {
        self.0
    }

    pub fn from_kes(kes: i64) -> Self {
        Self(kes * MICRO)
    }

    pub const fn from_kes_const(kes: i64) -> Self {
        Self(kes * MICRO)
    }

    pub fn try_from_f64(kes: f64) -> Result<Self, MoneyConversionError> {
        f64_to_micro(kes).map(Self)
    }

    pub fn to_f64(&self) -> f64 {
        self.0 as f64 / MICRO as f64
    }

    pub fn is_positive(&self) -> bool {
        self.0 > 0
    }

    /// Round to the nearest 0.01 KES, half away from zero.
    pub fn round2(&self) -> Self {
        Self(round_to_cent(self.0))
    }

    /// The amount as a string with exactly two decimal places, e.g. `1013.00`.
    pub fn format_2dp(&self) -> String {
        format_fixed(self.round2().0, 2)
    }

    /// The smallest whole-shilling amount covering this value. Mobile-money amounts are whole
    /// shillings.
    pub fn ceil_whole(&self) -> u64 {
        if self.0 <= 0 {
            return 0;
        }
        (self.0 as u64).div_ceil(MICRO as u64)
    }

    /// Apply a basis-points rate and round the result to 2 decimal places.
    pub fn bps(&self, basis_points: i64) -> Self {
        let fee = (self.0 as i128 * basis_points as i128) / 10_000;
        Self(round_to_cent(fee as i64))
    }

    /// Convert to USD at `rate` KES per USD, rounding to 2 decimal places.
    pub fn to_usd(&self, rate: MicroKes) -> Result<MicroUsd, MoneyConversionError> {
        if rate.0 <= 0 {
            return Err(MoneyConversionError(format!("Invalid exchange rate {}", rate.0)));
        }
        let n = self.0 as i128 * MICRO as i128;
        let d = rate.0 as i128;
        // Round-half-up division, then display rounding.
        let usd_micro = (n + d / 2) / d;
        Ok(MicroUsd(round_to_cent(usd_micro as i64)))
    }
}

//--------------------------------------     MicroUsd       ---------------------------------------------------------

/// A US Dollar (stablecoin) amount in millionths of a dollar.
#[derive(Debug, Clone, Copy, Default, Type, Ord, PartialOrd, Serialize, Deserialize)]
#[sqlx(transparent)]
pub struct MicroUsd(i64);

op!(binary MicroUsd, Add, add);
op!(binary MicroUsd, Sub, sub);
op!(inplace MicroUsd, SubAssign, sub_assign);
op!(unary MicroUsd, Neg, neg);

impl Sum for MicroUsd {
    fn sum<I: Iterator<Item = Self>>(iter: I) -> Self {
        iter.fold(Self::default(), Add::add)
    }
}

impl From<i64> for MicroUsd {
    fn from(value: i64) -> Self {
        Self(value)
    }
}

impl PartialEq for MicroUsd {
    fn eq(&self, other: &Self) -> bool {
        self.0 == other.0
    }
}

impl Eq for MicroUsd {}

impl Display for MicroUsd {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} USD", self.format_6dp())
    }
}

impl MicroUsd {
    pub fn value(&self) -> i64 {
        self.0
    }

    pub fn from_usd(usd: i64) -> Self {
        Self(usd * MICRO)
    }

    pub fn try_from_f64(usd: f64) -> Result<Self, MoneyConversionError> {
        f64_to_micro(usd).map(Self)
    }

    pub fn to_f64(&self) -> f64 {
        self.0 as f64 / MICRO as f64
    }

    pub fn is_positive(&self) -> bool {
        self.0 > 0
    }

    /// The amount as a string with exactly six decimal places, e.g. `10.000000`.
    ///
    /// This is the precision the authorization message is signed over.
    pub fn format_6dp(&self) -> String {
        format_fixed(self.0, 6)
    }

    /// Convert to KES at `rate` KES per USD, rounding to 2 decimal places.
    pub fn to_kes(&self, rate: MicroKes) -> Result<MicroKes, MoneyConversionError> {
        let kes_micro = self.0 as i128 * rate.value() as i128 / MICRO as i128;
        if kes_micro > i64::MAX as i128 || kes_micro < i64::MIN as i128 {
            return Err(MoneyConversionError(format!("{self} at rate {rate} overflows")));
        }
        Ok(MicroKes(round_to_cent(kes_micro as i64)))
    }

    /// Convert to integer token units for a token with the given number of decimals.
    ///
    /// Rounding is toward +∞ so the treasury never transfers less than the USD amount.
    pub fn to_token_units(&self, decimals: u8) -> u128 {
        if self.0 <= 0 {
            return 0;
        }
        let decimals = decimals.min(18) as u32;
        let n = self.0 as u128 * 10u128.pow(decimals);
        n.div_ceil(MICRO as u128)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn rounding_to_two_decimals() {
        assert_eq!(MicroKes::from(1_005_000).round2().value(), 1_010_000);
        assert_eq!(MicroKes::from(1_004_999).round2().value(), 1_000_000);
        assert_eq!(MicroKes::from(-1_005_000).round2().value(), -1_010_000);
        assert_eq!(MicroKes::from_kes(1000).format_2dp(), "1000.00");
    }

    #[test]
    fn whole_shilling_ceiling() {
        assert_eq!(MicroKes::from_kes(1013).ceil_whole(), 1013);
        assert_eq!(MicroKes::from(1_013_000_001).ceil_whole(), 1014);
        assert_eq!(MicroKes::from(-5).ceil_whole(), 0);
    }

    #[test]
    fn basis_point_fees() {
        // 1000 KES at 130 bps = 13 KES
        assert_eq!(MicroKes::from_kes(1000).bps(130), MicroKes::from_kes(13));
        // 1550 KES at 180 bps = 27.90 KES
        assert_eq!(MicroKes::from_kes(1550).bps(180), MicroKes::from(27_900_000));
    }

    #[test]
    fn kes_usd_conversions() {
        let rate = MicroKes::from_kes(130);
        let usd = MicroKes::from_kes(1000).to_usd(rate).unwrap();
        assert_eq!(usd, MicroUsd::from(7_690_000)); // 7.69
        let kes = MicroUsd::from_usd(10).to_kes(MicroKes::from_kes(155)).unwrap();
        assert_eq!(kes, MicroKes::from_kes(1550));
    }

    #[test]
    fn conversion_rejects_non_finite() {
        assert!(MicroKes::try_from_f64(f64::NAN).is_err());
        assert!(MicroKes::try_from_f64(f64::INFINITY).is_err());
        assert!(MicroUsd::try_from_f64(f64::NEG_INFINITY).is_err());
    }

    #[test]
    fn token_unit_conversion_rounds_up() {
        assert_eq!(MicroUsd::from_usd(10).to_token_units(6), 10_000_000);
        // 6.451801 USD at 6 decimals is exact
        assert_eq!(MicroUsd::from(6_451_801).to_token_units(6), 6_451_801);
        // 1 micro-dollar at 2 decimals rounds up to one smallest unit
        assert_eq!(MicroUsd::from(1).to_token_units(2), 1);
        assert_eq!(MicroUsd::from(-5).to_token_units(6), 0);
    }

    #[test]
    fn six_decimal_formatting() {
        assert_eq!(MicroUsd::from(7_690_000).format_6dp(), "7.690000");
        assert_eq!(MicroUsd::from(10_000_001).format_6dp(), "10.000001");
    }
}
