//! Fixed-point money and the platform fee calculator.
//!
//! All amounts are integer cents (two decimal places). No floating point is
//! ever involved in fee or ledger arithmetic.

use std::fmt;

/// An amount of money in cents.
#[derive(
    minicbor::Encode, minicbor::Decode, Debug, Default, Clone, Copy, PartialEq, Eq, PartialOrd, Ord,
)]
#[cbor(array)]
pub struct Money(#[n(0)] u64);

impl Money {
    pub const ZERO: Money = Money(0);

    pub const fn from_cents(cents: u64) -> Self {
        Money(cents)
    }
    pub const fn from_dollars(dollars: u64) -> Self {
        Money(dollars * 100)
    }
    pub const fn cents(self) -> u64 {
        self.0
    }
    pub fn checked_add(self, other: Money) -> Option<Money> {
        self.0.checked_add(other.0).map(Money)
    }
    pub fn checked_sub(self, other: Money) -> Option<Money> {
        self.0.checked_sub(other.0).map(Money)
    }
    /// Signed cents, the form ledger entry deltas are recorded in.
    pub fn as_delta(self) -> i64 {
        self.0 as i64
    }
}

impl fmt::Display for Money {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "${}.{:02}", self.0 / 100, self.0 % 100)
    }
}

/// The platform's cut of a card's face value, in basis points.
///
/// Pure function: each trade side is charged against its own card's value,
/// so a $100-for-$40 swap yields $5.00 and $2.00 fees at 500 bps. Truncates
/// toward zero on sub-cent remainders.
pub fn platform_fee(value: Money, fee_bps: u64) -> Money {
    // widened so no listable face value can overflow the multiply
    let fee = value.0 as u128 * fee_bps as u128 / 10_000;
    Money(fee.min(u64::MAX as u128) as u64)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fee_is_five_percent_of_each_side() {
        assert_eq!(platform_fee(Money::from_dollars(100), 500), Money::from_cents(500));
        assert_eq!(platform_fee(Money::from_dollars(40), 500), Money::from_cents(200));
    }

    #[test]
    fn fee_truncates_sub_cent_remainders() {
        // 5% of $0.33 is 1.65 cents, recorded as 1 cent
        assert_eq!(platform_fee(Money::from_cents(33), 500), Money::from_cents(1));
        assert_eq!(platform_fee(Money::ZERO, 500), Money::ZERO);
    }

    #[test]
    fn fee_handles_the_largest_face_value() {
        assert_eq!(
            platform_fee(Money::from_cents(u64::MAX), 500),
            Money::from_cents(u64::MAX / 20)
        );
        assert_eq!(platform_fee(Money::from_cents(u64::MAX), 10_000), Money::from_cents(u64::MAX));
    }

    #[test]
    fn display_uses_two_decimals() {
        assert_eq!(Money::from_cents(500).to_string(), "$5.00");
        assert_eq!(Money::from_cents(7).to_string(), "$0.07");
        assert_eq!(Money::from_dollars(1234).to_string(), "$1234.00");
    }

    #[test]
    fn checked_sub_refuses_to_go_negative() {
        assert_eq!(Money::from_cents(5).checked_sub(Money::from_cents(10)), None);
        assert_eq!(
            Money::from_cents(10).checked_sub(Money::from_cents(5)),
            Some(Money::from_cents(5))
        );
    }
}
