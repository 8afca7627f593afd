use serde::{Deserialize, Serialize};
use std::fmt;

/// Amount in minor currency units (cents).
#[derive(Clone, Copy, Debug, Default, Hash, Eq, PartialEq, Ord, PartialOrd, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Money(i64);

impl Money {
    pub const ZERO: Money = Money(0);

    pub const fn from_minor(minor: i64) -> Self {
        Self(minor)
    }

    pub const fn minor(self) -> i64 {
        self.0
    }

    pub fn checked_add(self, other: Money) -> Option<Money> {
        self.0.checked_add(other.0).map(Money)
    }

    pub fn checked_mul(self, quantity: u32) -> Option<Money> {
        self.0.checked_mul(i64::from(quantity)).map(Money)
    }

    pub fn saturating_add(self, other: Money) -> Money {
        Money(self.0.saturating_add(other.0))
    }
}

impl fmt::Display for Money {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let sign = if self.0 < 0 { "-" } else { "" };
        let abs = self.0.unsigned_abs();
        write!(f, "{sign}{}.{:02}", abs / 100, abs % 100)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_formats_two_decimals() {
        assert_eq!(Money::from_minor(1250).to_string(), "12.50");
        assert_eq!(Money::from_minor(5).to_string(), "0.05");
        assert_eq!(Money::from_minor(-75).to_string(), "-0.75");
    }

    #[test]
    fn checked_ops_detect_overflow() {
        assert_eq!(
            Money::from_minor(250).checked_mul(3),
            Some(Money::from_minor(750))
        );
        assert!(Money::from_minor(i64::MAX).checked_mul(2).is_none());
        assert!(Money::from_minor(i64::MAX)
            .checked_add(Money::from_minor(1))
            .is_none());
    }

    #[test]
    fn serializes_as_integer() {
        let json = serde_json::to_string(&Money::from_minor(899)).unwrap();
        assert_eq!(json, "899");
    }
}
