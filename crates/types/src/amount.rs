//! Monetary amounts in satoshi.
//!
//! Balances, fees and rewards are 64-bit signed satoshi. All arithmetic the
//! round engine performs on them is checked; an overflow is surfaced to the
//! caller instead of wrapping, and amounts never pass through floating point.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Number of satoshi in one KST.
pub const SATOSHI_PER_KST: i64 = 100_000_000;

/// A signed satoshi amount.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct Satoshi(pub i64);

impl Satoshi {
    pub const ZERO: Self = Satoshi(0);

    /// Whole-KST constructor, mainly for fixtures and schedules.
    pub fn from_kst(kst: i64) -> Option<Self> {
        kst.checked_mul(SATOSHI_PER_KST).map(Satoshi)
    }

    pub fn raw(self) -> i64 {
        self.0
    }

    pub fn is_zero(self) -> bool {
        self.0 == 0
    }

    pub fn is_negative(self) -> bool {
        self.0 < 0
    }

    pub fn checked_add(self, other: Self) -> Option<Self> {
        self.0.checked_add(other.0).map(Satoshi)
    }

    pub fn checked_sub(self, other: Self) -> Option<Self> {
        self.0.checked_sub(other.0).map(Satoshi)
    }

    pub fn checked_mul(self, factor: i64) -> Option<Self> {
        self.0.checked_mul(factor).map(Satoshi)
    }

    pub fn checked_neg(self) -> Option<Self> {
        self.0.checked_neg().map(Satoshi)
    }

    /// Split this amount into `parts` equal shares plus a remainder.
    ///
    /// Uses euclidean division so `per * parts + remainder == self` holds
    /// exactly and the remainder is never negative. Returns `None` when
    /// `parts` is zero or does not fit an `i64`.
    pub fn split(self, parts: u64) -> Option<(Self, Self)> {
        if parts == 0 {
            return None;
        }
        let parts = i64::try_from(parts).ok()?;
        let per = self.0.div_euclid(parts);
        let remainder = self.0.rem_euclid(parts);
        Some((Satoshi(per), Satoshi(remainder)))
    }
}

impl fmt::Display for Satoshi {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn split_is_exact() {
        let total = Satoshi(10_000_000);
        let (per, rem) = total.split(101).unwrap();
        assert_eq!(per, Satoshi(99_009));
        assert_eq!(rem, Satoshi(91));
        assert_eq!(per.checked_mul(101).unwrap().checked_add(rem).unwrap(), total);
    }

    #[test]
    fn split_zero_and_small_totals() {
        assert_eq!(Satoshi::ZERO.split(101).unwrap(), (Satoshi::ZERO, Satoshi::ZERO));
        assert_eq!(Satoshi(5).split(101).unwrap(), (Satoshi::ZERO, Satoshi(5)));
        assert!(Satoshi(1).split(0).is_none());
    }

    #[test]
    fn checked_arithmetic_detects_overflow() {
        assert!(Satoshi(i64::MAX).checked_add(Satoshi(1)).is_none());
        assert!(Satoshi(i64::MIN).checked_neg().is_none());
        assert_eq!(Satoshi(3).checked_mul(4).unwrap(), Satoshi(12));
    }

    #[test]
    fn serde_is_transparent() {
        let json = serde_json::to_string(&Satoshi(42)).unwrap();
        assert_eq!(json, "42");
        let back: Satoshi = serde_json::from_str(&json).unwrap();
        assert_eq!(back, Satoshi(42));
    }
}
