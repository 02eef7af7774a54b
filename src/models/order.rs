//! Declarative order intent handed to an external executor.

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use super::Side;

/// An order the desk wants executed. Never sent to a broker by this crate.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderIntent {
    pub symbol: String,
    pub side: Side,
    /// Always positive; direction lives in `side`.
    pub qty: Decimal,
    /// Reference price at the time of the decision.
    pub price: Decimal,
    pub strategy_id: String,
    /// Why the intent was raised, e.g. `ENTRY_SIGNAL` or an exit reason.
    pub reason: String,
}

impl OrderIntent {
    /// Signed quantity change this intent applies to a position.
    pub fn signed_qty(&self) -> Decimal {
        self.qty * self.side.sign()
    }

    pub fn notional(&self) -> Decimal {
        self.qty * self.price
    }
}
