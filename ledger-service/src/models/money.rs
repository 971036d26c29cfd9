//! Money codec.
//!
//! Every stored or compared monetary value is an `i64` count of minor currency
//! units (satang, cents). Major-unit `Decimal`s exist only at the edges: when
//! a caller hands over a display amount, or when one is rendered back.

use crate::error::{LedgerError, Result};
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::{Decimal, RoundingStrategy};
use std::str::FromStr;

/// Amount in minor currency units.
pub type MinorUnits = i64;

/// Number of decimal places between major and minor units.
pub const MINOR_UNIT_SCALE: u32 = 2;

const MINOR_UNITS_PER_MAJOR: i64 = 100;

/// Convert a major-unit amount (e.g. `150.25`) to minor units (`15025`).
///
/// Sub-minor precision is rounded to the nearest minor unit, midpoint away
/// from zero.
pub fn to_minor_units(major: Decimal) -> Result<MinorUnits> {
    major
        .checked_mul(Decimal::from(MINOR_UNITS_PER_MAJOR))
        .map(|scaled| scaled.round_dp_with_strategy(0, RoundingStrategy::MidpointAwayFromZero))
        .and_then(|rounded| rounded.to_i64())
        .ok_or(LedgerError::AmountOverflow("minor units"))
}

/// Parse a decimal string in major units into minor units.
pub fn parse_major(input: &str) -> Result<MinorUnits> {
    let major = Decimal::from_str(input.trim())
        .map_err(|e| LedgerError::Validation(format!("Invalid amount '{}': {}", input, e)))?;
    to_minor_units(major)
}

/// Exact major-unit value for display.
pub fn to_major_units(minor: MinorUnits) -> Decimal {
    Decimal::new(minor, MINOR_UNIT_SCALE)
}

/// Checked sum of minor-unit amounts.
pub fn sum<I>(amounts: I) -> Result<MinorUnits>
where
    I: IntoIterator<Item = MinorUnits>,
{
    amounts
        .into_iter()
        .try_fold(0i64, |acc, amount| acc.checked_add(amount))
        .ok_or(LedgerError::AmountOverflow("sum"))
}

/// Checked addition for aggregate updates.
pub fn add(left: MinorUnits, right: MinorUnits, what: &'static str) -> Result<MinorUnits> {
    left.checked_add(right).ok_or(LedgerError::AmountOverflow(what))
}

/// Reject zero and negative amounts where a new monetary value is created.
pub fn ensure_positive(amount: MinorUnits, field: &'static str) -> Result<()> {
    if amount <= 0 {
        return Err(LedgerError::InvalidAmount { field, amount });
    }
    Ok(())
}

/// Reject negative amounts on caller-supplied totals.
pub fn ensure_non_negative(amount: MinorUnits, field: &'static str) -> Result<()> {
    if amount < 0 {
        return Err(LedgerError::InvalidAmount { field, amount });
    }
    Ok(())
}

/// Clamp a difference to zero before it is used as an aggregate.
pub fn clamp_non_negative(amount: MinorUnits) -> MinorUnits {
    amount.max(0)
}
