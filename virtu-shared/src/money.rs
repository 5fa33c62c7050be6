use rust_decimal::{Decimal, RoundingStrategy};

/// Round a monetary amount to 2 decimal places, half away from zero.
pub fn round(amount: Decimal) -> Decimal {
    amount.round_dp_with_strategy(2, RoundingStrategy::MidpointAwayFromZero)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rounding_half_away_from_zero() {
        let amount = Decimal::new(12345, 3); // 12.345
        assert_eq!(round(amount), Decimal::new(1235, 2)); // 12.35

        let amount = Decimal::new(-12345, 3);
        assert_eq!(round(amount), Decimal::new(-1235, 2));
    }
}
