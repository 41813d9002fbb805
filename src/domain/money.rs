use crate::error::PaymentError;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};

/// A strictly positive monetary amount.
///
/// Wraps `rust_decimal::Decimal` so that charge and refund amounts can never be
/// zero or negative once they enter the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "Decimal", into = "Decimal")]
pub struct Amount(Decimal);

impl Amount {
    pub fn new(value: Decimal) -> Result<Self, PaymentError> {
        if value > Decimal::ZERO {
            Ok(Self(value))
        } else {
            Err(PaymentError::InvalidAmount {
                amount: value,
                reason: "amount must be positive".to_string(),
            })
        }
    }

    pub fn value(&self) -> Decimal {
        self.0
    }
}

impl TryFrom<Decimal> for Amount {
    type Error = PaymentError;

    fn try_from(value: Decimal) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<Amount> for Decimal {
    fn from(amount: Amount) -> Self {
        amount.0
    }
}

/// Inclusive per-provider limits on a single charge.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AmountBounds {
    pub min: Decimal,
    pub max: Decimal,
}

impl AmountBounds {
    pub fn new(min: Decimal, max: Decimal) -> Self {
        Self { min, max }
    }

    pub fn contains(&self, amount: Decimal) -> bool {
        amount >= self.min && amount <= self.max
    }

    pub fn check(&self, amount: Amount) -> Result<(), PaymentError> {
        if self.contains(amount.value()) {
            Ok(())
        } else {
            Err(PaymentError::InvalidAmount {
                amount: amount.value(),
                reason: format!("must be between {} and {}", self.min, self.max),
            })
        }
    }
}

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display, EnumString,
)]
#[serde(rename_all = "UPPERCASE")]
#[strum(serialize_all = "UPPERCASE", ascii_case_insensitive)]
pub enum Currency {
    Bdt,
    Usd,
    Eur,
}

/// Converts a major-unit amount into the provider's minor units (e.g. paisa).
pub fn to_minor_units(amount: Decimal) -> Option<i64> {
    use rust_decimal::prelude::ToPrimitive;
    (amount * Decimal::ONE_HUNDRED).round().to_i64()
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;
    use std::str::FromStr;

    #[test]
    fn test_amount_validation() {
        assert!(Amount::new(dec!(1.0)).is_ok());
        assert!(matches!(
            Amount::new(dec!(0.0)),
            Err(PaymentError::InvalidAmount { .. })
        ));
        assert!(matches!(
            Amount::new(dec!(-5)),
            Err(PaymentError::InvalidAmount { .. })
        ));
    }

    #[test]
    fn test_bounds_are_inclusive() {
        let bounds = AmountBounds::new(dec!(10), dec!(500));
        assert!(bounds.contains(dec!(10)));
        assert!(bounds.contains(dec!(500)));
        assert!(!bounds.contains(dec!(500.01)));
        assert!(bounds.check(Amount::new(dec!(9.99)).unwrap()).is_err());
    }

    #[test]
    fn test_currency_parsing() {
        assert_eq!(Currency::from_str("bdt").unwrap(), Currency::Bdt);
        assert_eq!(Currency::from_str("USD").unwrap(), Currency::Usd);
        assert_eq!(Currency::Bdt.to_string(), "BDT");
    }

    #[test]
    fn test_minor_units() {
        assert_eq!(to_minor_units(dec!(12.34)), Some(1234));
        assert_eq!(to_minor_units(dec!(500)), Some(50000));
    }
}
