//! In-memory store used by tests and dry runs.

use std::collections::BTreeMap;

use anyhow::{bail, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use tokio::sync::RwLock;

use super::{Store, UNKNOWN_SECTOR};
use crate::models::{
    BalancePoint, Bar, ExposureSnapshot, JournalKey, LifecycleEvent, PaperPosition, RiskEvent,
    RiskStateRecord, Signal, TradeEvent, TradeJournalEntry, TradeState, TradeStatus,
};

type PairKey = (String, String);

#[derive(Default)]
struct Tables {
    trade_states: BTreeMap<PairKey, TradeState>,
    lifecycle: Vec<LifecycleEvent>,
    trade_events: Vec<TradeEvent>,
    journal: Vec<TradeJournalEntry>,
    risk_states: Vec<RiskStateRecord>,
    risk_events: Vec<RiskEvent>,
    exposures: Vec<ExposureSnapshot>,
    bars: BTreeMap<(String, DateTime<Utc>), Bar>,
    atr: Vec<(String, DateTime<Utc>, Decimal)>,
    balances: BTreeMap<DateTime<Utc>, Decimal>,
    signals: Vec<Signal>,
    paper: BTreeMap<PairKey, PaperPosition>,
}

/// Store backed by plain collections behind one lock.
#[derive(Default)]
pub struct MemoryStore {
    tables: RwLock<Tables>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of lifecycle events recorded.
    #[cfg(test)]
    pub(crate) async fn lifecycle_event_count(&self) -> usize {
        self.tables.read().await.lifecycle.len()
    }
}

fn pair(symbol: &str, strategy_id: &str) -> PairKey {
    (symbol.to_string(), strategy_id.to_string())
}

#[async_trait]
impl Store for MemoryStore {
    async fn get_trade_state(&self, symbol: &str, strategy_id: &str) -> Result<Option<TradeState>> {
        Ok(self
            .tables
            .read()
            .await
            .trade_states
            .get(&pair(symbol, strategy_id))
            .cloned())
    }

    async fn upsert_trade_state(&self, state: &TradeState) -> Result<()> {
        self.tables
            .write()
            .await
            .trade_states
            .insert(pair(&state.symbol, &state.strategy_id), state.clone());
        Ok(())
    }

    async fn list_trade_states(&self, statuses: &[TradeStatus]) -> Result<Vec<TradeState>> {
        Ok(self
            .tables
            .read()
            .await
            .trade_states
            .values()
            .filter(|s| statuses.contains(&s.status))
            .cloned()
            .collect())
    }

    async fn append_lifecycle_event(&self, event: &LifecycleEvent) -> Result<()> {
        self.tables.write().await.lifecycle.push(event.clone());
        Ok(())
    }

    async fn latest_lifecycle_event(
        &self,
        symbol: &str,
        strategy_id: &str,
        state: TradeStatus,
    ) -> Result<Option<LifecycleEvent>> {
        Ok(self
            .tables
            .read()
            .await
            .lifecycle
            .iter()
            .filter(|e| e.symbol == symbol && e.strategy_id == strategy_id && e.state == state)
            .max_by_key(|e| e.ts)
            .cloned())
    }

    async fn append_trade_event(&self, event: &TradeEvent) -> Result<()> {
        self.tables.write().await.trade_events.push(event.clone());
        Ok(())
    }

    async fn list_trade_events(&self, symbol: &str, strategy_id: &str) -> Result<Vec<TradeEvent>> {
        Ok(self
            .tables
            .read()
            .await
            .trade_events
            .iter()
            .filter(|e| e.symbol == symbol && e.strategy_id == strategy_id)
            .cloned()
            .collect())
    }

    async fn journal_exists(&self, key: &JournalKey) -> Result<bool> {
        Ok(self.tables.read().await.journal.iter().any(|e| e.key() == *key))
    }

    async fn append_journal_entry(&self, entry: &TradeJournalEntry) -> Result<()> {
        let mut tables = self.tables.write().await;
        let key = entry.key();
        if tables.journal.iter().any(|e| e.key() == key) {
            bail!(
                "journal entry already exists for {}/{} entry_ts={} exit_ts={}",
                key.symbol,
                key.strategy_id,
                key.entry_ts,
                key.exit_ts
            );
        }
        tables.journal.push(entry.clone());
        Ok(())
    }

    async fn list_journal(&self, strategy_id: Option<&str>) -> Result<Vec<TradeJournalEntry>> {
        let mut entries: Vec<TradeJournalEntry> = self
            .tables
            .read()
            .await
            .journal
            .iter()
            .filter(|e| strategy_id.map_or(true, |s| e.strategy_id == s))
            .cloned()
            .collect();
        entries.sort_by(|a, b| a.exit_ts.cmp(&b.exit_ts));
        Ok(entries)
    }

    async fn append_risk_state(&self, record: &RiskStateRecord) -> Result<()> {
        self.tables.write().await.risk_states.push(record.clone());
        Ok(())
    }

    async fn latest_risk_state(&self) -> Result<Option<RiskStateRecord>> {
        Ok(self
            .tables
            .read()
            .await
            .risk_states
            .iter()
            .max_by_key(|r| r.ts)
            .cloned())
    }

    async fn append_risk_event(&self, event: &RiskEvent) -> Result<()> {
        self.tables.write().await.risk_events.push(event.clone());
        Ok(())
    }

    async fn recent_risk_events(&self, limit: usize) -> Result<Vec<RiskEvent>> {
        Ok(self
            .tables
            .read()
            .await
            .risk_events
            .iter()
            .rev()
            .take(limit)
            .cloned()
            .collect())
    }

    async fn append_exposure_snapshot(&self, snapshot: &ExposureSnapshot) -> Result<()> {
        self.tables.write().await.exposures.push(snapshot.clone());
        Ok(())
    }

    async fn sector_net_exposure_since(
        &self,
        since: DateTime<Utc>,
    ) -> Result<BTreeMap<String, Decimal>> {
        let tables = self.tables.read().await;

        let mut latest: BTreeMap<PairKey, &ExposureSnapshot> = BTreeMap::new();
        for snap in tables.exposures.iter().filter(|s| s.ts >= since) {
            let key = pair(&snap.symbol, &snap.strategy_id);
            match latest.get(&key) {
                Some(prev) if prev.ts > snap.ts => {}
                _ => {
                    latest.insert(key, snap);
                }
            }
        }

        let mut by_sector = BTreeMap::new();
        for snap in latest.values() {
            let sector = snap.sector.clone().unwrap_or_else(|| UNKNOWN_SECTOR.to_string());
            *by_sector.entry(sector).or_insert(Decimal::ZERO) += snap.net_exposure;
        }
        Ok(by_sector)
    }

    async fn insert_bars(&self, bars: &[Bar]) -> Result<usize> {
        let mut tables = self.tables.write().await;
        for bar in bars {
            tables
                .bars
                .insert((bar.symbol.clone(), bar.timestamp), bar.clone());
        }
        Ok(bars.len())
    }

    async fn latest_close(&self, symbol: &str) -> Result<Option<(DateTime<Utc>, Decimal)>> {
        Ok(self
            .tables
            .read()
            .await
            .bars
            .values()
            .filter(|b| b.symbol == symbol)
            .last()
            .map(|b| (b.timestamp, b.close)))
    }

    async fn close_path(
        &self,
        symbol: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<Decimal>> {
        Ok(self
            .tables
            .read()
            .await
            .bars
            .values()
            .filter(|b| b.symbol == symbol && b.timestamp >= start && b.timestamp <= end)
            .map(|b| b.close)
            .collect())
    }

    async fn recent_bars(&self, symbol: &str, limit: usize) -> Result<Vec<Bar>> {
        let tables = self.tables.read().await;
        let mut bars: Vec<Bar> = tables
            .bars
            .values()
            .filter(|b| b.symbol == symbol)
            .rev()
            .take(limit)
            .cloned()
            .collect();
        bars.reverse();
        Ok(bars)
    }

    async fn record_atr(&self, symbol: &str, ts: DateTime<Utc>, atr: Decimal) -> Result<()> {
        self.tables
            .write()
            .await
            .atr
            .push((symbol.to_string(), ts, atr));
        Ok(())
    }

    async fn latest_atr(&self, symbol: &str) -> Result<Option<Decimal>> {
        Ok(self
            .tables
            .read()
            .await
            .atr
            .iter()
            .filter(|(s, _, _)| s == symbol)
            .max_by_key(|(_, ts, _)| *ts)
            .map(|(_, _, atr)| *atr))
    }

    async fn record_balance(&self, point: &BalancePoint) -> Result<()> {
        self.tables
            .write()
            .await
            .balances
            .insert(point.ts, point.balance);
        Ok(())
    }

    async fn latest_balance(&self) -> Result<Option<BalancePoint>> {
        Ok(self
            .tables
            .read()
            .await
            .balances
            .iter()
            .next_back()
            .map(|(ts, balance)| BalancePoint { ts: *ts, balance: *balance }))
    }

    async fn balance_at_or_before(&self, ts: DateTime<Utc>) -> Result<Option<BalancePoint>> {
        Ok(self
            .tables
            .read()
            .await
            .balances
            .range(..=ts)
            .next_back()
            .map(|(ts, balance)| BalancePoint { ts: *ts, balance: *balance }))
    }

    async fn peak_balance(&self) -> Result<Option<Decimal>> {
        Ok(self.tables.read().await.balances.values().copied().max())
    }

    async fn balance_history(&self) -> Result<Vec<BalancePoint>> {
        Ok(self
            .tables
            .read()
            .await
            .balances
            .iter()
            .map(|(ts, balance)| BalancePoint { ts: *ts, balance: *balance })
            .collect())
    }

    async fn record_signal(&self, signal: &Signal) -> Result<()> {
        self.tables.write().await.signals.push(signal.clone());
        Ok(())
    }

    async fn latest_signals(&self) -> Result<Vec<Signal>> {
        let tables = self.tables.read().await;
        let mut latest: BTreeMap<&str, &Signal> = BTreeMap::new();
        for signal in &tables.signals {
            match latest.get(signal.symbol.as_str()) {
                Some(prev) if prev.ts > signal.ts => {}
                _ => {
                    latest.insert(signal.symbol.as_str(), signal);
                }
            }
        }
        Ok(latest.into_values().cloned().collect())
    }

    async fn get_paper_position(
        &self,
        symbol: &str,
        strategy_id: &str,
    ) -> Result<Option<PaperPosition>> {
        Ok(self
            .tables
            .read()
            .await
            .paper
            .get(&pair(symbol, strategy_id))
            .cloned())
    }

    async fn upsert_paper_position(&self, position: &PaperPosition) -> Result<()> {
        self.tables
            .write()
            .await
            .paper
            .insert(pair(&position.symbol, &position.strategy_id), position.clone());
        Ok(())
    }

    async fn list_paper_positions(&self) -> Result<Vec<PaperPosition>> {
        Ok(self.tables.read().await.paper.values().cloned().collect())
    }
}
