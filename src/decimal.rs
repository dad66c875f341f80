use rust_decimal::prelude::ToPrimitive;
use rust_decimal::{Decimal, RoundingStrategy};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::iter::Sum;
use std::ops::{Add, AddAssign, Div, Mul, Sub, SubAssign};
use std::str::FromStr;

/// decimal places of the program currency
pub const MINOR_UNIT_SCALE: u32 = 2;

fn round_minor(d: Decimal) -> Decimal {
    d.round_dp_with_strategy(MINOR_UNIT_SCALE, RoundingStrategy::MidpointAwayFromZero)
}

/// Money type fixed at cent precision
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default)]
pub struct Money(Decimal);

impl Money {
    pub const ZERO: Money = Money(Decimal::ZERO);
    pub const CENT: Money = Money(Decimal::from_parts(1, 0, 0, false, MINOR_UNIT_SCALE));

    /// create from decimal
    pub fn from_decimal(d: Decimal) -> Self {
        Money(round_minor(d))
    }

    /// create from string with exact parsing
    pub fn from_str_exact(s: &str) -> Result<Self, rust_decimal::Error> {
        Ok(Money(round_minor(Decimal::from_str(s)?)))
    }

    /// create from whole currency units (dollars)
    pub fn from_major(amount: i64) -> Self {
        Money(Decimal::from(amount))
    }

    /// create from minor units (cents)
    pub fn from_minor(amount: i64) -> Self {
        Money(Decimal::new(amount, MINOR_UNIT_SCALE))
    }

    /// integer minor units, used by reporting views
    pub fn to_minor(&self) -> i64 {
        (round_minor(self.0) * Decimal::from(100))
            .trunc()
            .to_i64()
            .unwrap_or(i64::MAX)
    }

    pub fn as_decimal(&self) -> Decimal {
        self.0
    }

    pub fn is_zero(&self) -> bool {
        self.0.is_zero()
    }

    /// strictly greater than zero
    pub fn is_positive(&self) -> bool {
        self.0 > Decimal::ZERO
    }

    pub fn is_negative(&self) -> bool {
        self.0 < Decimal::ZERO
    }

    pub fn abs(&self) -> Self {
        Money(self.0.abs())
    }

    pub fn min(self, other: Self) -> Self {
        Money(self.0.min(other.0))
    }

    pub fn max(self, other: Self) -> Self {
        Money(self.0.max(other.0))
    }

    /// subtraction clamped at zero
    pub fn saturating_sub(self, other: Self) -> Self {
        (self - other).max(Money::ZERO)
    }

    /// split into `parts` cent-exact shares, remainder absorbed by the last share
    pub fn split_even(&self, parts: u32) -> Vec<Money> {
        if parts == 0 {
            return Vec::new();
        }
        let share = Money(
            (self.0 / Decimal::from(parts))
                .round_dp_with_strategy(MINOR_UNIT_SCALE, RoundingStrategy::ToZero),
        );
        let mut shares = vec![share; parts as usize];
        let allocated = share * Decimal::from(parts - 1);
        if let Some(last) = shares.last_mut() {
            *last = *self - allocated;
        }
        shares
    }
}

impl fmt::Display for Money {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for Money {
    type Err = rust_decimal::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Money::from_str_exact(s)
    }
}

impl From<Decimal> for Money {
    fn from(d: Decimal) -> Self {
        Money::from_decimal(d)
    }
}

impl From<i32> for Money {
    fn from(i: i32) -> Self {
        Money::from_major(i as i64)
    }
}

impl Add for Money {
    type Output = Money;

    fn add(self, other: Money) -> Money {
        Money(round_minor(self.0 + other.0))
    }
}

impl AddAssign for Money {
    fn add_assign(&mut self, other: Money) {
        self.0 = round_minor(self.0 + other.0);
    }
}

impl Sub for Money {
    type Output = Money;

    fn sub(self, other: Money) -> Money {
        Money(round_minor(self.0 - other.0))
    }
}

impl SubAssign for Money {
    fn sub_assign(&mut self, other: Money) {
        self.0 = round_minor(self.0 - other.0);
    }
}

impl Mul<Decimal> for Money {
    type Output = Money;

    fn mul(self, other: Decimal) -> Money {
        Money(round_minor(self.0 * other))
    }
}

impl Div<Decimal> for Money {
    type Output = Money;

    fn div(self, other: Decimal) -> Money {
        Money(round_minor(self.0 / other))
    }
}

impl Sum for Money {
    fn sum<I: Iterator<Item = Money>>(iter: I) -> Money {
        iter.fold(Money::ZERO, |acc, x| acc + x)
    }
}

impl<'a> Sum<&'a Money> for Money {
    fn sum<I: Iterator<Item = &'a Money>>(iter: I) -> Money {
        iter.fold(Money::ZERO, |acc, x| acc + *x)
    }
}

/// ratio type for rates and percentages
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize, Default)]
pub struct Rate(Decimal);

impl Rate {
    pub const ZERO: Rate = Rate(Decimal::ZERO);
    pub const ONE: Rate = Rate(Decimal::ONE);

    /// create from decimal (e.g., 0.05 for 5%)
    pub fn from_decimal(d: Decimal) -> Self {
        Rate(d)
    }

    /// ratio of two counts, zero when the denominator is zero
    pub fn from_ratio(numerator: u64, denominator: u64) -> Self {
        if denominator == 0 {
            return Rate::ZERO;
        }
        Rate(Decimal::from(numerator) / Decimal::from(denominator))
    }

    pub fn as_decimal(&self) -> Decimal {
        self.0
    }

    /// get as percentage
    pub fn as_percentage(&self) -> Decimal {
        (self.0 * Decimal::from(100)).round_dp(2)
    }
}

impl fmt::Display for Rate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}%", self.as_percentage())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_money_precision() {
        let m = Money::from_str_exact("100.125").unwrap();
        assert_eq!(m.to_string(), "100.13"); // half away from zero

        let m = Money::from_str_exact("100.124").unwrap();
        assert_eq!(m.to_string(), "100.12");
    }

    #[test]
    fn test_minor_units() {
        assert_eq!(Money::from_minor(12_345), Money::from_str_exact("123.45").unwrap());
        assert_eq!(Money::from_major(1200).to_minor(), 120_000);
        assert_eq!(Money::from_minor(-250).to_minor(), -250);
        assert_eq!(Money::CENT.to_minor(), 1);
    }

    #[test]
    fn test_split_even_absorbs_remainder() {
        let shares = Money::from_major(100).split_even(3);
        assert_eq!(shares.len(), 3);
        assert_eq!(shares[0], Money::from_str_exact("33.33").unwrap());
        assert_eq!(shares[2], Money::from_str_exact("33.34").unwrap());
        assert_eq!(shares.iter().sum::<Money>(), Money::from_major(100));

        assert!(Money::from_major(10).split_even(0).is_empty());
    }

    #[test]
    fn test_saturating_sub() {
        let a = Money::from_major(100);
        let b = Money::from_major(150);
        assert_eq!(a.saturating_sub(b), Money::ZERO);
        assert_eq!(b.saturating_sub(a), Money::from_major(50));
    }

    #[test]
    fn test_rate_from_ratio() {
        assert_eq!(Rate::from_ratio(3, 4).as_percentage(), dec!(75.00));
        assert_eq!(Rate::from_ratio(5, 0), Rate::ZERO);
        assert_eq!(Rate::from_ratio(1, 3).as_percentage(), dec!(33.33));
    }
}
