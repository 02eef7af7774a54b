//! Order intents from a current and target quantity.

use rust_decimal::Decimal;

use crate::models::{OrderIntent, Side};

/// Intent that moves `current_qty` to `target_qty`, or `None` if they match.
///
/// Pure: no risk-mode check happens here; callers gate entries.
pub fn build_order_intent(
    symbol: &str,
    target_qty: Decimal,
    current_qty: Decimal,
    price: Decimal,
    strategy_id: &str,
    reason: &str,
) -> Option<OrderIntent> {
    let delta = target_qty - current_qty;
    let side = Side::from_signed_qty(delta)?;

    Some(OrderIntent {
        symbol: symbol.to_string(),
        side,
        qty: delta.abs(),
        price,
        strategy_id: strategy_id.to_string(),
        reason: reason.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_no_intent_when_at_target() {
        assert_eq!(
            build_order_intent("AAPL", dec!(10), dec!(10), dec!(100), "baseline", "REBALANCE"),
            None
        );
    }

    #[test]
    fn test_intent_direction() {
        let buy = build_order_intent("AAPL", dec!(10), dec!(4), dec!(100), "baseline", "ENTRY_SIGNAL")
            .unwrap();
        assert_eq!(buy.side, Side::Buy);
        assert_eq!(buy.qty, dec!(6));
        assert_eq!(buy.reason, "ENTRY_SIGNAL");

        let flip = build_order_intent("AAPL", dec!(-5), dec!(5), dec!(100), "baseline", "FLIP").unwrap();
        assert_eq!(flip.side, Side::Sell);
        assert_eq!(flip.qty, dec!(10));
        assert_eq!(flip.signed_qty(), dec!(-10));
    }
}
