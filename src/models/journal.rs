//! Closed-trade journal and the append-only event logs.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::TradeStatus;

/// Identity of a closed trade. At most one journal entry exists per key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct JournalKey {
    pub symbol: String,
    pub strategy_id: String,
    pub entry_ts: DateTime<Utc>,
    pub exit_ts: DateTime<Utc>,
}

/// Summary of a closed trade in R terms.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TradeJournalEntry {
    pub symbol: String,
    pub strategy_id: String,
    pub entry_ts: DateTime<Utc>,
    pub exit_ts: DateTime<Utc>,
    pub entry_price: Decimal,
    pub exit_price: Decimal,
    /// Absolute quantity closed.
    pub qty: Decimal,
    /// R multiple of the trade.
    pub r: Decimal,
    /// Realized PnL in account currency.
    pub pnl_r: Decimal,
    /// Maximum adverse excursion in R (<= 0).
    pub mae: Decimal,
    /// Maximum favorable excursion in R (>= 0).
    pub mfe: Decimal,
}

impl TradeJournalEntry {
    pub fn key(&self) -> JournalKey {
        JournalKey {
            symbol: self.symbol.clone(),
            strategy_id: self.strategy_id.clone(),
            entry_ts: self.entry_ts,
            exit_ts: self.exit_ts,
        }
    }

    pub fn is_win(&self) -> bool {
        self.pnl_r > Decimal::ZERO
    }
}

/// Append-only record of a lifecycle transition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LifecycleEvent {
    pub symbol: String,
    pub strategy_id: String,
    pub state: TradeStatus,
    pub ts: DateTime<Utc>,
    /// Free-form JSON. EXITED events carry `cooldown_until`.
    pub metadata: Value,
}

/// Audit record written by the exit engine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TradeEvent {
    pub symbol: String,
    pub strategy_id: String,
    pub event_type: String,
    pub description: String,
    pub ts: DateTime<Utc>,
}
