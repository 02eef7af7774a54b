//! Trade lifecycle state machine: FLAT → ENTERED → MANAGED → EXITED → FLAT.
//!
//! Every transition is persisted through the [`Store`]. Exited trades are
//! journaled once, put on cooldown and reset to FLAT.

use std::sync::Arc;

use anyhow::Result;
use chrono::{DateTime, Duration, Utc};
use rust_decimal::Decimal;
use serde_json::json;
use tracing::{debug, info, warn};

use crate::config::MAX_COOLDOWN_MINUTES;
use crate::db::Store;
use crate::error::DeskError;
use crate::metrics::{mae_mfe_r, r_multiple, realized_pnl};
use crate::models::{
    ExitLevels, LifecycleEvent, Side, TradeJournalEntry, TradeState, TradeStatus,
};

/// Metadata key on EXITED lifecycle events.
pub const COOLDOWN_UNTIL: &str = "cooldown_until";

/// Everything needed to open a trade.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewEntry {
    pub symbol: String,
    pub strategy_id: String,
    /// Signed quantity: positive long, negative short.
    pub qty: Decimal,
    pub entry_price: Decimal,
    pub entry_ts: DateTime<Utc>,
    pub levels: ExitLevels,
}

/// Lifecycle transitions backed by a store.
pub struct LifecycleEngine {
    store: Arc<dyn Store>,
    cooldown: Duration,
}

impl LifecycleEngine {
    /// `cooldown_minutes` is clamped to `[0, MAX_COOLDOWN_MINUTES]`.
    pub fn new(store: Arc<dyn Store>, cooldown_minutes: i64) -> Self {
        Self {
            store,
            cooldown: Duration::minutes(cooldown_minutes.clamp(0, MAX_COOLDOWN_MINUTES)),
        }
    }

    /// Open (or fully overwrite) a trade in ENTERED.
    ///
    /// Calling twice with the same entry leaves the row unchanged.
    pub async fn register_entry(&self, entry: &NewEntry) -> Result<TradeState> {
        let invalid = |reason: &str| DeskError::InvalidTradeState {
            symbol: entry.symbol.clone(),
            strategy_id: entry.strategy_id.clone(),
            reason: reason.to_string(),
        };

        let side = Side::from_signed_qty(entry.qty).ok_or_else(|| invalid("qty must be non-zero"))?;
        if entry.entry_price <= Decimal::ZERO {
            return Err(invalid("entry_price must be positive").into());
        }
        if !entry.levels.is_ordered(side, entry.entry_price) {
            return Err(invalid("levels are not ordered for the trade side").into());
        }

        let mut state = TradeState {
            status: TradeStatus::Entered,
            qty: entry.qty,
            entry_price: Some(entry.entry_price),
            entry_ts: Some(entry.entry_ts),
            initial_stop: Some(entry.levels.stop),
            ..TradeState::flat(&entry.symbol, &entry.strategy_id, entry.entry_ts)
        };
        state.set_levels(Some(&entry.levels));
        state.validate()?;

        self.store.upsert_trade_state(&state).await?;
        self.record_event(
            &state,
            TradeStatus::Entered,
            entry.entry_ts,
            json!({
                "qty": entry.qty.to_string(),
                "entry_price": entry.entry_price.to_string(),
                "stop": entry.levels.stop.to_string(),
            }),
        )
        .await?;

        info!(
            symbol = %entry.symbol,
            strategy = %entry.strategy_id,
            side = %side,
            qty = %entry.qty,
            entry_price = %entry.entry_price,
            stop = %entry.levels.stop,
            "Trade entered"
        );

        Ok(state)
    }

    /// Record a partial exit: the trade moves to MANAGED with `remaining_qty`.
    pub async fn mark_managed(
        &self,
        symbol: &str,
        strategy_id: &str,
        remaining_qty: Decimal,
        levels: &ExitLevels,
        ts: DateTime<Utc>,
    ) -> Result<TradeState> {
        let mut state = self.active_trade(symbol, strategy_id).await?;
        if remaining_qty.is_zero()
            || Side::from_signed_qty(remaining_qty) != state.side()
            || remaining_qty.abs() >= state.qty.abs()
        {
            return Err(DeskError::InvalidTradeState {
                symbol: symbol.to_string(),
                strategy_id: strategy_id.to_string(),
                reason: format!("remaining qty {} does not reduce {}", remaining_qty, state.qty),
            }
            .into());
        }

        state.status = TradeStatus::Managed;
        state.qty = remaining_qty;
        state.set_levels(Some(levels));
        state.updated_at = ts;

        self.store.upsert_trade_state(&state).await?;
        self.record_event(
            &state,
            TradeStatus::Managed,
            ts,
            json!({ "remaining_qty": remaining_qty.to_string() }),
        )
        .await?;

        info!(symbol, strategy = strategy_id, remaining = %remaining_qty, "Trade managed");
        Ok(state)
    }

    /// Persist ratcheted levels on an open trade.
    pub async fn update_levels(
        &self,
        symbol: &str,
        strategy_id: &str,
        levels: &ExitLevels,
        ts: DateTime<Utc>,
    ) -> Result<TradeState> {
        let mut state = self.active_trade(symbol, strategy_id).await?;
        if state.levels().as_ref() == Some(levels) {
            return Ok(state);
        }

        state.set_levels(Some(levels));
        state.updated_at = ts;
        self.store.upsert_trade_state(&state).await?;

        debug!(symbol, strategy = strategy_id, trailing = ?levels.trailing_stop, "Levels updated");
        Ok(state)
    }

    /// Close the position: qty 0, levels cleared, fill recorded for the journal.
    pub async fn mark_exited(
        &self,
        symbol: &str,
        strategy_id: &str,
        exit_price: Decimal,
        exit_ts: DateTime<Utc>,
    ) -> Result<TradeState> {
        let mut state = self.active_trade(symbol, strategy_id).await?;

        state.status = TradeStatus::Exited;
        state.closed_qty = Some(state.qty.abs());
        state.qty = Decimal::ZERO;
        state.set_levels(None);
        state.exit_price = Some(exit_price);
        state.updated_at = exit_ts;

        self.store.upsert_trade_state(&state).await?;

        info!(symbol, strategy = strategy_id, exit_price = %exit_price, "Trade exited");
        Ok(state)
    }

    /// Log the EXITED event that starts the re-entry cooldown.
    pub async fn apply_cooldown(
        &self,
        symbol: &str,
        strategy_id: &str,
        exit_ts: DateTime<Utc>,
    ) -> Result<DateTime<Utc>> {
        let until = exit_ts
            .checked_add_signed(self.cooldown)
            .unwrap_or(DateTime::<Utc>::MAX_UTC);
        self.store
            .append_lifecycle_event(&LifecycleEvent {
                symbol: symbol.to_string(),
                strategy_id: strategy_id.to_string(),
                state: TradeStatus::Exited,
                ts: exit_ts,
                metadata: json!({ COOLDOWN_UNTIL: until.to_rfc3339() }),
            })
            .await?;

        debug!(symbol, strategy = strategy_id, until = %until, "Cooldown applied");
        Ok(until)
    }

    /// Whether re-entry is still blocked at `now` (default: the wall clock).
    ///
    /// Missing or unreadable cooldown metadata counts as not in cooldown.
    pub async fn is_in_cooldown(
        &self,
        symbol: &str,
        strategy_id: &str,
        now: Option<DateTime<Utc>>,
    ) -> Result<bool> {
        let now = now.unwrap_or_else(Utc::now);
        let Some(event) = self
            .store
            .latest_lifecycle_event(symbol, strategy_id, TradeStatus::Exited)
            .await?
        else {
            return Ok(false);
        };

        let until = event
            .metadata
            .get(COOLDOWN_UNTIL)
            .and_then(|v| v.as_str())
            .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
            .map(|dt| dt.with_timezone(&Utc));

        match until {
            Some(until) => Ok(now < until),
            None => {
                warn!(
                    symbol,
                    strategy = strategy_id,
                    metadata = %event.metadata,
                    "Unreadable cooldown metadata, allowing re-entry"
                );
                Ok(false)
            }
        }
    }

    /// Journal every EXITED trade, apply its cooldown and reset it to FLAT.
    ///
    /// Returns the journal entries written by this call.
    pub async fn process_exited_trades(&self, now: DateTime<Utc>) -> Result<Vec<TradeJournalEntry>> {
        let exited = self.store.list_trade_states(&[TradeStatus::Exited]).await?;
        let mut written = Vec::new();

        for state in exited.into_iter().filter(|s| s.qty.is_zero()) {
            let (Some(entry_price), Some(entry_ts)) = (state.entry_price, state.entry_ts) else {
                warn!(
                    symbol = %state.symbol,
                    strategy = %state.strategy_id,
                    "Exited trade without entry data, resetting"
                );
                self.reset_flat(&state, now).await?;
                continue;
            };

            let exit_ts = state.updated_at;
            let mut entry = TradeJournalEntry {
                symbol: state.symbol.clone(),
                strategy_id: state.strategy_id.clone(),
                entry_ts,
                exit_ts,
                entry_price,
                exit_price: entry_price,
                qty: Decimal::ZERO,
                r: Decimal::ZERO,
                pnl_r: Decimal::ZERO,
                mae: Decimal::ZERO,
                mfe: Decimal::ZERO,
            };

            if self.store.journal_exists(&entry.key()).await? {
                warn!(
                    symbol = %state.symbol,
                    strategy = %state.strategy_id,
                    entry_ts = %entry_ts,
                    exit_ts = %exit_ts,
                    "Trade already journaled, resetting"
                );
                self.ensure_cooldown(&state.symbol, &state.strategy_id, exit_ts)
                    .await?;
                self.reset_flat(&state, now).await?;
                continue;
            }

            let mut path = self
                .store
                .close_path(&state.symbol, entry_ts, exit_ts)
                .await?;
            let exit_price = state
                .exit_price
                .or_else(|| path.last().copied())
                .unwrap_or(entry_price);
            if path.is_empty() {
                path = vec![entry_price, exit_price];
            }

            let side = state.side().unwrap_or(Side::Buy);
            let stop = state.initial_stop.unwrap_or(entry_price);
            let qty = state
                .closed_qty
                .filter(|q| *q > Decimal::ZERO)
                .unwrap_or(Decimal::ONE);
            let (mae, mfe) = mae_mfe_r(side, entry_price, stop, &path);

            entry.exit_price = exit_price;
            entry.qty = qty;
            entry.r = r_multiple(side, entry_price, stop, exit_price);
            entry.pnl_r = realized_pnl(side, entry_price, exit_price, qty);
            entry.mae = mae;
            entry.mfe = mfe;

            self.store.append_journal_entry(&entry).await?;
            self.apply_cooldown(&state.symbol, &state.strategy_id, exit_ts)
                .await?;
            self.reset_flat(&state, now).await?;

            info!(
                symbol = %entry.symbol,
                strategy = %entry.strategy_id,
                r = %entry.r,
                pnl = %entry.pnl_r,
                mae = %entry.mae,
                mfe = %entry.mfe,
                "Trade journaled"
            );
            written.push(entry);
        }

        Ok(written)
    }

    /// Apply the cooldown for `exit_ts` unless it is already logged.
    async fn ensure_cooldown(
        &self,
        symbol: &str,
        strategy_id: &str,
        exit_ts: DateTime<Utc>,
    ) -> Result<()> {
        let logged = self
            .store
            .latest_lifecycle_event(symbol, strategy_id, TradeStatus::Exited)
            .await?
            .is_some_and(|event| event.ts == exit_ts);
        if !logged {
            self.apply_cooldown(symbol, strategy_id, exit_ts).await?;
        }
        Ok(())
    }

    async fn active_trade(&self, symbol: &str, strategy_id: &str) -> Result<TradeState> {
        match self.store.get_trade_state(symbol, strategy_id).await? {
            Some(state) if state.status.is_active() => Ok(state),
            _ => Err(DeskError::NoActiveTrade {
                symbol: symbol.to_string(),
                strategy_id: strategy_id.to_string(),
            }
            .into()),
        }
    }

    async fn reset_flat(&self, state: &TradeState, now: DateTime<Utc>) -> Result<()> {
        self.store
            .upsert_trade_state(&TradeState::flat(&state.symbol, &state.strategy_id, now))
            .await
    }

    async fn record_event(
        &self,
        state: &TradeState,
        status: TradeStatus,
        ts: DateTime<Utc>,
        metadata: serde_json::Value,
    ) -> Result<()> {
        self.store
            .append_lifecycle_event(&LifecycleEvent {
                symbol: state.symbol.clone(),
                strategy_id: state.strategy_id.clone(),
                state: status,
                ts,
                metadata,
            })
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::MemoryStore;
    use crate::models::Bar;
    use chrono::TimeZone;
    use rust_decimal_macros::dec;

    fn ts() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 1, 14, 30, 0).unwrap()
    }

    fn long_entry() -> NewEntry {
        NewEntry {
            symbol: "AAPL".to_string(),
            strategy_id: "baseline".to_string(),
            qty: dec!(10),
            entry_price: dec!(100),
            entry_ts: ts(),
            levels: ExitLevels {
                stop: dec!(95),
                tp1: dec!(105),
                tp2: dec!(110),
                trailing_stop: None,
            },
        }
    }

    fn bar(minutes: i64, close: Decimal) -> Bar {
        Bar {
            timestamp: ts() + Duration::minutes(minutes),
            symbol: "AAPL".to_string(),
            open: close,
            high: close,
            low: close,
            close,
            volume: dec!(1),
        }
    }

    fn engine() -> (Arc<MemoryStore>, LifecycleEngine) {
        let store = Arc::new(MemoryStore::new());
        let engine = LifecycleEngine::new(store.clone(), 5);
        (store, engine)
    }

    #[tokio::test]
    async fn test_register_entry_is_idempotent() {
        let (store, engine) = engine();

        let first = engine.register_entry(&long_entry()).await.unwrap();
        let second = engine.register_entry(&long_entry()).await.unwrap();
        assert_eq!(first, second);

        let stored = store.get_trade_state("AAPL", "baseline").await.unwrap().unwrap();
        assert_eq!(stored, first);
        assert_eq!(stored.status, TradeStatus::Entered);
        assert_eq!(stored.initial_stop, Some(dec!(95)));
        assert_eq!(stored.updated_at, ts());
    }

    #[tokio::test]
    async fn test_register_entry_rejects_bad_input() {
        let (_, engine) = engine();

        let mut short_with_long_levels = long_entry();
        short_with_long_levels.qty = dec!(-10);
        let err = engine.register_entry(&short_with_long_levels).await.unwrap_err();
        assert!(matches!(
            err.downcast_ref::<DeskError>(),
            Some(DeskError::InvalidTradeState { .. })
        ));

        let mut zero = long_entry();
        zero.qty = Decimal::ZERO;
        assert!(engine.register_entry(&zero).await.is_err());
    }

    #[tokio::test]
    async fn test_transitions_require_active_trade() {
        let (_, engine) = engine();
        let levels = long_entry().levels;

        let err = engine
            .mark_managed("AAPL", "baseline", dec!(5), &levels, ts())
            .await
            .unwrap_err();
        assert_eq!(
            err.downcast_ref::<DeskError>(),
            Some(&DeskError::NoActiveTrade {
                symbol: "AAPL".to_string(),
                strategy_id: "baseline".to_string(),
            })
        );
        assert!(engine.mark_exited("AAPL", "baseline", dec!(100), ts()).await.is_err());
    }

    #[tokio::test]
    async fn test_mark_managed_must_reduce() {
        let (store, engine) = engine();
        let levels = long_entry().levels;
        engine.register_entry(&long_entry()).await.unwrap();

        for remaining in [dec!(10), dec!(12), dec!(-5), Decimal::ZERO] {
            let err = engine
                .mark_managed("AAPL", "baseline", remaining, &levels, ts())
                .await
                .unwrap_err();
            assert!(matches!(
                err.downcast_ref::<DeskError>(),
                Some(DeskError::InvalidTradeState { .. })
            ));
        }

        let state = store.get_trade_state("AAPL", "baseline").await.unwrap().unwrap();
        assert_eq!(state.status, TradeStatus::Entered);
        assert_eq!(state.qty, dec!(10));
    }

    #[tokio::test]
    async fn test_exit_is_journaled_once() {
        let (store, engine) = engine();
        store
            .insert_bars(&[bar(0, dec!(100)), bar(1, dec!(98)), bar(2, dec!(102)), bar(3, dec!(99)), bar(4, dec!(103))])
            .await
            .unwrap();

        engine.register_entry(&long_entry()).await.unwrap();
        let managed = engine
            .mark_managed("AAPL", "baseline", dec!(5), &long_entry().levels, ts() + Duration::minutes(2))
            .await
            .unwrap();
        assert_eq!(managed.status, TradeStatus::Managed);

        let exit_ts = ts() + Duration::minutes(4);
        let exited = engine.mark_exited("AAPL", "baseline", dec!(103), exit_ts).await.unwrap();
        assert!(exited.validate().is_ok());
        assert_eq!(exited.closed_qty, Some(dec!(5)));

        let now = exit_ts + Duration::minutes(1);
        let journal = engine.process_exited_trades(now).await.unwrap();
        assert_eq!(journal.len(), 1);
        let entry = &journal[0];
        assert_eq!(entry.r, dec!(0.6));
        assert_eq!(entry.pnl_r, dec!(15));
        assert_eq!(entry.mae, dec!(-0.4));
        assert_eq!(entry.mfe, dec!(0.6));

        let flat = store.get_trade_state("AAPL", "baseline").await.unwrap().unwrap();
        assert_eq!(flat.status, TradeStatus::Flat);

        // Second pass finds nothing left to journal
        assert!(engine.process_exited_trades(now).await.unwrap().is_empty());
        assert_eq!(store.list_journal(None).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_stuck_exited_row_is_reset_without_duplicate() {
        let (store, engine) = engine();
        engine.register_entry(&long_entry()).await.unwrap();
        let exit_ts = ts() + Duration::minutes(10);
        let exited = engine.mark_exited("AAPL", "baseline", dec!(90), exit_ts).await.unwrap();
        engine.process_exited_trades(exit_ts).await.unwrap();

        // A crash before the FLAT reset leaves the EXITED row behind
        store.upsert_trade_state(&exited).await.unwrap();
        assert!(engine.process_exited_trades(exit_ts).await.unwrap().is_empty());

        let journal = store.list_journal(None).await.unwrap();
        assert_eq!(journal.len(), 1);
        // No bars: the path falls back to entry and exit
        assert_eq!(journal[0].r, dec!(-2));
        assert_eq!(journal[0].mae, dec!(-2));
        assert_eq!(journal[0].mfe, Decimal::ZERO);
        let state = store.get_trade_state("AAPL", "baseline").await.unwrap().unwrap();
        assert_eq!(state.status, TradeStatus::Flat);
        assert!(engine
            .is_in_cooldown("AAPL", "baseline", Some(exit_ts + Duration::minutes(1)))
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn test_journaled_trade_without_cooldown_gets_one() {
        let (store, engine) = engine();
        let exit_ts = ts() + Duration::minutes(10);

        // Journal row written, cooldown never logged
        engine.register_entry(&long_entry()).await.unwrap();
        let exited = engine.mark_exited("AAPL", "baseline", dec!(90), exit_ts).await.unwrap();
        store
            .append_journal_entry(&TradeJournalEntry {
                symbol: "AAPL".to_string(),
                strategy_id: "baseline".to_string(),
                entry_ts: ts(),
                exit_ts,
                entry_price: dec!(100),
                exit_price: dec!(90),
                qty: dec!(10),
                r: dec!(-2),
                pnl_r: dec!(-100),
                mae: dec!(-2),
                mfe: Decimal::ZERO,
            })
            .await
            .unwrap();
        assert!(!engine.is_in_cooldown("AAPL", "baseline", Some(exit_ts)).await.unwrap());

        assert!(engine.process_exited_trades(exit_ts).await.unwrap().is_empty());
        assert!(engine.is_in_cooldown("AAPL", "baseline", Some(exit_ts)).await.unwrap());
        let cooldown = store
            .latest_lifecycle_event("AAPL", "baseline", TradeStatus::Exited)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(cooldown.ts, exit_ts);

        // ENTERED plus one EXITED
        assert_eq!(store.lifecycle_event_count().await, 2);

        // Replaying the stuck row does not log a second cooldown
        store.upsert_trade_state(&exited).await.unwrap();
        engine.process_exited_trades(exit_ts + Duration::minutes(1)).await.unwrap();
        assert_eq!(store.lifecycle_event_count().await, 2);
        let state = store.get_trade_state("AAPL", "baseline").await.unwrap().unwrap();
        assert_eq!(state.status, TradeStatus::Flat);
    }

    #[tokio::test]
    async fn test_cooldown_window() {
        let (_, engine) = engine();
        let exit_ts = ts();
        engine.apply_cooldown("AAPL", "baseline", exit_ts).await.unwrap();

        assert!(engine
            .is_in_cooldown("AAPL", "baseline", Some(exit_ts + Duration::minutes(4)))
            .await
            .unwrap());
        assert!(!engine
            .is_in_cooldown("AAPL", "baseline", Some(exit_ts + Duration::minutes(5)))
            .await
            .unwrap());
        assert!(!engine.is_in_cooldown("MSFT", "baseline", Some(exit_ts)).await.unwrap());
    }

    #[tokio::test]
    async fn test_cooldown_defaults_to_wall_clock() {
        let (_, engine) = engine();
        engine.apply_cooldown("AAPL", "baseline", Utc::now()).await.unwrap();
        assert!(engine.is_in_cooldown("AAPL", "baseline", None).await.unwrap());

        engine
            .apply_cooldown("MSFT", "baseline", Utc::now() - Duration::hours(1))
            .await
            .unwrap();
        assert!(!engine.is_in_cooldown("MSFT", "baseline", None).await.unwrap());
    }

    #[tokio::test]
    async fn test_oversized_cooldown_is_clamped() {
        let store = Arc::new(MemoryStore::new());
        let engine = LifecycleEngine::new(store, i64::MAX);

        let until = engine.apply_cooldown("AAPL", "baseline", ts()).await.unwrap();
        assert_eq!(until, ts() + Duration::minutes(MAX_COOLDOWN_MINUTES));
        assert!(engine
            .is_in_cooldown("AAPL", "baseline", Some(ts() + Duration::days(300)))
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn test_cooldown_fails_open_on_bad_metadata() {
        let (store, engine) = engine();
        for metadata in [json!({}), json!({ COOLDOWN_UNTIL: "not-a-time" }), json!("raw")] {
            store
                .append_lifecycle_event(&LifecycleEvent {
                    symbol: "AAPL".to_string(),
                    strategy_id: "baseline".to_string(),
                    state: TradeStatus::Exited,
                    ts: ts(),
                    metadata,
                })
                .await
                .unwrap();
            assert!(!engine.is_in_cooldown("AAPL", "baseline", Some(ts())).await.unwrap());
        }
    }
}
