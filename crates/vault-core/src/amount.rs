//! Currency amounts in minor units.
//!
//! Balances are arbitrary-precision integers. They are persisted and
//! serialised as decimal strings so no layer ever routes them through `f64`.

use std::str::FromStr;

pub use num_bigint::BigInt as Amount;

use crate::error::{CoreError, Result};

/// Parse a decimal string (optionally signed) into an [`Amount`].
pub fn parse(s: &str) -> Result<Amount> {
    Amount::from_str(s.trim()).map_err(|_| CoreError::InvalidAmount(s.to_string()))
}

/// Scale `amount` by `basis_points` / 10 000, rounding toward zero.
///
/// 10 000 bp leaves the amount unchanged; 15 000 bp is a 1.5x boost.
pub fn apply_basis_points(amount: &Amount, basis_points: u32) -> Amount {
    amount * Amount::from(basis_points) / Amount::from(10_000u32)
}

/// `serde(with = ...)` adapter storing an [`Amount`] as a decimal string.
pub mod amount_str {
    use serde::{Deserialize, Deserializer, Serializer};

    use super::Amount;

    pub fn serialize<S: Serializer>(value: &Amount, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&value.to_string())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Amount, D::Error> {
        let raw = String::deserialize(d)?;
        super::parse(&raw).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_values_beyond_i128() {
        let big = "340282366920938463463374607431768211456000";
        assert_eq!(parse(big).unwrap().to_string(), big);
    }

    #[test]
    fn rejects_garbage() {
        assert!(parse("12a").is_err());
        assert!(parse("1.5").is_err());
    }

    #[test]
    fn basis_points_truncate_toward_zero() {
        assert_eq!(apply_basis_points(&Amount::from(1000), 15_000), Amount::from(1500));
        assert_eq!(apply_basis_points(&Amount::from(7), 15_000), Amount::from(10));
        assert_eq!(apply_basis_points(&Amount::from(-7), 15_000), Amount::from(-10));
    }
}
