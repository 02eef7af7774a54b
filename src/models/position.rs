//! Paper position book entry, updated by applying order intents.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use super::{OrderIntent, Side};

/// Simulated holding for one (symbol, strategy) pair.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PaperPosition {
    pub symbol: String,

    pub strategy_id: String,

    /// Signed quantity: positive long, negative short
    pub qty: Decimal,

    /// Average entry price of the open quantity
    pub avg_price: Decimal,

    /// Cumulative realized P&L
    pub realized_pnl: Decimal,

    /// Last time this position was updated
    pub updated_at: DateTime<Utc>,
}

impl PaperPosition {
    /// An empty position.
    pub fn flat(symbol: &str, strategy_id: &str, updated_at: DateTime<Utc>) -> Self {
        Self {
            symbol: symbol.to_string(),
            strategy_id: strategy_id.to_string(),
            qty: Decimal::ZERO,
            avg_price: Decimal::ZERO,
            realized_pnl: Decimal::ZERO,
            updated_at,
        }
    }

    /// Fill an intent at its reference price. Returns the P&L realized by it.
    pub fn apply(&mut self, intent: &OrderIntent, ts: DateTime<Utc>) -> Decimal {
        let delta = intent.signed_qty();
        let adding = self.qty.is_zero()
            || Side::from_signed_qty(self.qty) == Side::from_signed_qty(delta);
        let realized = if adding {
            self.add(delta, intent.price);
            Decimal::ZERO
        } else {
            self.reduce(delta, intent.price)
        };
        self.updated_at = ts;
        realized
    }

    /// Add to position (averaging in).
    fn add(&mut self, delta: Decimal, price: Decimal) {
        let total_cost = self.qty.abs() * self.avg_price + delta.abs() * price;
        let new_qty = self.qty + delta;

        if !new_qty.is_zero() {
            self.avg_price = total_cost / new_qty.abs();
        }
        self.qty = new_qty;
    }

    /// Reduce, close or flip the position.
    fn reduce(&mut self, delta: Decimal, price: Decimal) -> Decimal {
        let closing = delta.abs().min(self.qty.abs());
        let held = Side::from_signed_qty(self.qty).unwrap_or(Side::Buy);
        let realized = closing * (price - self.avg_price) * held.sign();
        let new_qty = self.qty + delta;

        if new_qty.is_zero() {
            self.avg_price = Decimal::ZERO;
        } else if Side::from_signed_qty(new_qty) != Some(held) {
            // Flipped through zero: the remainder opened at this price.
            self.avg_price = price;
        }
        self.qty = new_qty;
        self.realized_pnl += realized;
        realized
    }

    pub fn is_flat(&self) -> bool {
        self.qty.is_zero()
    }

    pub fn unrealized_pnl(&self, mark: Decimal) -> Decimal {
        (mark - self.avg_price) * self.qty
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use rust_decimal_macros::dec;

    fn intent(side: Side, qty: Decimal, price: Decimal) -> OrderIntent {
        OrderIntent {
            symbol: "AAPL".to_string(),
            side,
            qty,
            price,
            strategy_id: "baseline".to_string(),
            reason: "TEST".to_string(),
        }
    }

    fn ts() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 1, 0, 0, 0).unwrap()
    }

    #[test]
    fn test_position_averaging() {
        let mut pos = PaperPosition::flat("AAPL", "baseline", ts());
        pos.apply(&intent(Side::Buy, dec!(100), dec!(0.50)), ts());
        pos.apply(&intent(Side::Buy, dec!(100), dec!(0.60)), ts());

        assert_eq!(pos.qty, dec!(200));
        // Average: (50 + 60) / 200 = 0.55
        assert_eq!(pos.avg_price, dec!(0.55));
    }

    #[test]
    fn test_partial_close_and_flip() {
        let mut pos = PaperPosition::flat("AAPL", "baseline", ts());
        pos.apply(&intent(Side::Buy, dec!(10), dec!(100)), ts());

        let realized = pos.apply(&intent(Side::Sell, dec!(5), dec!(110)), ts());
        assert_eq!(realized, dec!(50));
        assert_eq!(pos.qty, dec!(5));
        assert_eq!(pos.avg_price, dec!(100));

        let realized = pos.apply(&intent(Side::Sell, dec!(8), dec!(90)), ts());
        assert_eq!(realized, dec!(-50));
        assert_eq!(pos.qty, dec!(-3));
        assert_eq!(pos.avg_price, dec!(90));
        assert_eq!(pos.realized_pnl, Decimal::ZERO);
    }

    #[test]
    fn test_short_profit() {
        let mut pos = PaperPosition::flat("AAPL", "baseline", ts());
        pos.apply(&intent(Side::Sell, dec!(10), dec!(100)), ts());
        assert_eq!(pos.unrealized_pnl(dec!(95)), dec!(50));

        let realized = pos.apply(&intent(Side::Buy, dec!(10), dec!(95)), ts());
        assert_eq!(realized, dec!(50));
        assert!(pos.is_flat());
    }
}
