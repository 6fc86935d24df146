use crate::error::{GatewayError, Result};
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::{Decimal, RoundingStrategy};

/// Minor units per major currency unit.
pub const CENTS_FACTOR: i64 = 100;

/// Converts a major-unit amount into integer cents, rounding half away from
/// zero.
pub fn amount_to_cents(amount: Decimal) -> Result<i64> {
    amount
        .checked_mul(Decimal::from(CENTS_FACTOR))
        .and_then(|cents| {
            cents
                .round_dp_with_strategy(0, RoundingStrategy::MidpointAwayFromZero)
                .to_i64()
        })
        .ok_or_else(|| GatewayError::ValidationError("Amount is out of range".to_string()))
}

pub fn cents_to_amount(cents: i64) -> Decimal {
    Decimal::new(cents, 2)
}
