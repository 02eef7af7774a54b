//! Persistence for desk state.
//!
//! Everything the control core reads or writes goes through [`Store`]:
//! - Trade state rows and the lifecycle event log
//! - Exit-engine trade events and the trade journal
//! - Risk state, risk events and exposure snapshots
//! - Market data (bars, ATR cache), balances and signals
//! - The paper position book
//!
//! A single writer is assumed. Implementations only lock what they need for
//! memory safety.

mod memory;
mod sqlite;

use std::collections::BTreeMap;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;

use crate::models::{
    BalancePoint, Bar, ExposureSnapshot, JournalKey, LifecycleEvent, PaperPosition, RiskEvent,
    RiskStateRecord, Signal, TradeEvent, TradeJournalEntry, TradeState, TradeStatus,
};

pub use memory::MemoryStore;
pub use sqlite::Database;

/// Sector label used for snapshots without a sector.
pub const UNKNOWN_SECTOR: &str = "UNKNOWN";

/// Narrow persistence contract used by the engines and the cycle.
#[async_trait]
pub trait Store: Send + Sync {
    // ==================== Trade State ====================

    async fn get_trade_state(&self, symbol: &str, strategy_id: &str) -> Result<Option<TradeState>>;

    /// Insert or fully replace the row for (symbol, strategy_id).
    async fn upsert_trade_state(&self, state: &TradeState) -> Result<()>;

    /// Rows in any of the given statuses, ordered by (symbol, strategy_id).
    async fn list_trade_states(&self, statuses: &[TradeStatus]) -> Result<Vec<TradeState>>;

    // ==================== Lifecycle Events ====================

    async fn append_lifecycle_event(&self, event: &LifecycleEvent) -> Result<()>;

    /// Most recent event in `state` for (symbol, strategy_id).
    async fn latest_lifecycle_event(
        &self,
        symbol: &str,
        strategy_id: &str,
        state: TradeStatus,
    ) -> Result<Option<LifecycleEvent>>;

    // ==================== Trade Events ====================

    async fn append_trade_event(&self, event: &TradeEvent) -> Result<()>;

    /// Events for (symbol, strategy_id) in insertion order.
    async fn list_trade_events(&self, symbol: &str, strategy_id: &str) -> Result<Vec<TradeEvent>>;

    // ==================== Trade Journal ====================

    async fn journal_exists(&self, key: &JournalKey) -> Result<bool>;

    async fn append_journal_entry(&self, entry: &TradeJournalEntry) -> Result<()>;

    /// Journal ordered by exit time, optionally for one strategy.
    async fn list_journal(&self, strategy_id: Option<&str>) -> Result<Vec<TradeJournalEntry>>;

    // ==================== Risk ====================

    async fn append_risk_state(&self, record: &RiskStateRecord) -> Result<()>;

    async fn latest_risk_state(&self) -> Result<Option<RiskStateRecord>>;

    async fn append_risk_event(&self, event: &RiskEvent) -> Result<()>;

    /// Most recent risk events, newest first.
    async fn recent_risk_events(&self, limit: usize) -> Result<Vec<RiskEvent>>;

    // ==================== Exposure ====================

    async fn append_exposure_snapshot(&self, snapshot: &ExposureSnapshot) -> Result<()>;

    /// Net exposure per sector, summing the latest snapshot of each
    /// (symbol, strategy) taken at or after `since`.
    async fn sector_net_exposure_since(
        &self,
        since: DateTime<Utc>,
    ) -> Result<BTreeMap<String, Decimal>>;

    // ==================== Market Data ====================

    /// Insert bars, replacing any existing bar with the same (symbol, timestamp).
    async fn insert_bars(&self, bars: &[Bar]) -> Result<usize>;

    /// Close and timestamp of the newest bar.
    async fn latest_close(&self, symbol: &str) -> Result<Option<(DateTime<Utc>, Decimal)>>;

    /// Closes with `start <= ts <= end`, oldest first.
    async fn close_path(
        &self,
        symbol: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<Decimal>>;

    /// The last `limit` bars, oldest first.
    async fn recent_bars(&self, symbol: &str, limit: usize) -> Result<Vec<Bar>>;

    /// The last `limit` closes, oldest first.
    async fn recent_closes(&self, symbol: &str, limit: usize) -> Result<Vec<Decimal>> {
        Ok(self
            .recent_bars(symbol, limit)
            .await?
            .into_iter()
            .map(|b| b.close)
            .collect())
    }

    async fn record_atr(&self, symbol: &str, ts: DateTime<Utc>, atr: Decimal) -> Result<()>;

    async fn latest_atr(&self, symbol: &str) -> Result<Option<Decimal>>;

    // ==================== Balances ====================

    async fn record_balance(&self, point: &BalancePoint) -> Result<()>;

    async fn latest_balance(&self) -> Result<Option<BalancePoint>>;

    async fn balance_at_or_before(&self, ts: DateTime<Utc>) -> Result<Option<BalancePoint>>;

    async fn peak_balance(&self) -> Result<Option<Decimal>>;

    /// Full equity history, oldest first.
    async fn balance_history(&self) -> Result<Vec<BalancePoint>>;

    // ==================== Signals ====================

    async fn record_signal(&self, signal: &Signal) -> Result<()>;

    /// Newest signal per symbol, ordered by symbol.
    async fn latest_signals(&self) -> Result<Vec<Signal>>;

    // ==================== Paper Positions ====================

    async fn get_paper_position(
        &self,
        symbol: &str,
        strategy_id: &str,
    ) -> Result<Option<PaperPosition>>;

    async fn upsert_paper_position(&self, position: &PaperPosition) -> Result<()>;

    async fn list_paper_positions(&self) -> Result<Vec<PaperPosition>>;
}
