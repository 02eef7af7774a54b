//! Exit engine: checks open trades against their levels and drives the
//! lifecycle transitions that follow.

use std::sync::Arc;

use anyhow::Result;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use tracing::{debug, info, warn};

use super::exits::{compute_atr_levels, evaluate_exit_decision, update_trailing_stop};
use super::lifecycle::LifecycleEngine;
use super::order_builder::build_order_intent;
use crate::db::Store;
use crate::models::{
    ExitAction, ExitDecision, OrderIntent, Side, TradeEvent, TradeState, TradeStatus,
};

/// What happened to one trade in one pass.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExitOutcome {
    pub decision: ExitDecision,
    /// Order that brings the position to its new size, if it changed.
    pub intent: Option<OrderIntent>,
}

/// Evaluates exits for open trades.
pub struct ExitEngine {
    store: Arc<dyn Store>,
    lifecycle: Arc<LifecycleEngine>,
    /// Stop distance in ATRs for trades that have no levels yet.
    atr_multiple: Decimal,
}

impl ExitEngine {
    pub fn new(store: Arc<dyn Store>, lifecycle: Arc<LifecycleEngine>, atr_multiple: Decimal) -> Self {
        Self {
            store,
            lifecycle,
            atr_multiple,
        }
    }

    /// Evaluate one trade at `current_price`.
    ///
    /// Returns `None` when the trade was not evaluated: it is not open, or it
    /// has no levels and no ATR to build them from.
    pub async fn process_trade_exit(
        &self,
        state: &TradeState,
        current_price: Decimal,
        atr: Option<Decimal>,
        now: DateTime<Utc>,
    ) -> Result<Option<ExitOutcome>> {
        if !state.status.is_active() {
            return Ok(None);
        }
        let (Some(side), Some(entry)) = (Side::from_signed_qty(state.qty), state.entry_price) else {
            warn!(
                symbol = %state.symbol,
                strategy = %state.strategy_id,
                "Open trade without quantity or entry price, skipping"
            );
            return Ok(None);
        };

        let levels = match (state.levels(), atr.filter(|a| *a > Decimal::ZERO)) {
            (Some(levels), _) => levels,
            (None, Some(atr)) => compute_atr_levels(side, entry, atr, self.atr_multiple)?,
            (None, None) => {
                debug!(symbol = %state.symbol, "No levels and no ATR, skipping exit check");
                return Ok(None);
            }
        };

        let risk_per_unit = (entry - levels.stop).abs();
        let trailing = update_trailing_stop(side, current_price, risk_per_unit, levels.trailing_stop);
        let levels = levels.with_trailing(side, trailing);

        let tp1_taken = state.status == TradeStatus::Managed;
        let decision = evaluate_exit_decision(side, &levels, current_price, tp1_taken);

        let target_qty = match decision.action {
            ExitAction::None => {
                self.lifecycle
                    .update_levels(&state.symbol, &state.strategy_id, &levels, now)
                    .await?;
                return Ok(Some(ExitOutcome {
                    decision,
                    intent: None,
                }));
            }
            ExitAction::Tp1Partial => {
                let remaining = state.qty / Decimal::TWO;
                self.lifecycle
                    .mark_managed(&state.symbol, &state.strategy_id, remaining, &levels, now)
                    .await?;
                remaining
            }
            ExitAction::Stop | ExitAction::Tp2Full | ExitAction::TrailStop => {
                self.lifecycle
                    .mark_exited(&state.symbol, &state.strategy_id, current_price, now)
                    .await?;
                Decimal::ZERO
            }
        };

        self.store
            .append_trade_event(&TradeEvent {
                symbol: state.symbol.clone(),
                strategy_id: state.strategy_id.clone(),
                event_type: decision.action.as_str().to_string(),
                description: format!("{} price={}", decision.reason, current_price),
                ts: now,
            })
            .await?;

        info!(
            symbol = %state.symbol,
            strategy = %state.strategy_id,
            action = %decision.action,
            reason = decision.reason,
            price = %current_price,
            "Exit triggered"
        );

        let intent = build_order_intent(
            &state.symbol,
            target_qty,
            state.qty,
            current_price,
            &state.strategy_id,
            decision.reason,
        );
        Ok(Some(ExitOutcome { decision, intent }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::MemoryStore;
    use crate::models::ExitLevels;
    use crate::trading::NewEntry;
    use chrono::{Duration, TimeZone};
    use rust_decimal_macros::dec;

    fn ts() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 1, 14, 30, 0).unwrap()
    }

    async fn setup(qty: Decimal) -> (Arc<MemoryStore>, ExitEngine, TradeState) {
        let store = Arc::new(MemoryStore::new());
        let lifecycle = Arc::new(LifecycleEngine::new(store.clone(), 5));
        let engine = ExitEngine::new(store.clone(), lifecycle.clone(), dec!(2));
        let levels = if qty > Decimal::ZERO {
            ExitLevels { stop: dec!(95), tp1: dec!(105), tp2: dec!(110), trailing_stop: None }
        } else {
            ExitLevels { stop: dec!(105), tp1: dec!(95), tp2: dec!(90), trailing_stop: None }
        };
        let state = lifecycle
            .register_entry(&NewEntry {
                symbol: "AAPL".to_string(),
                strategy_id: "baseline".to_string(),
                qty,
                entry_price: dec!(100),
                entry_ts: ts(),
                levels,
            })
            .await
            .unwrap();
        (store, engine, state)
    }

    #[tokio::test]
    async fn test_no_exit_ratchets_trailing_stop() {
        let (store, engine, state) = setup(dec!(10)).await;

        let outcome = engine
            .process_trade_exit(&state, dec!(103), None, ts() + Duration::minutes(1))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(outcome.decision.action, ExitAction::None);
        assert!(outcome.intent.is_none());

        let stored = store.get_trade_state("AAPL", "baseline").await.unwrap().unwrap();
        assert_eq!(stored.trailing_price, Some(dec!(98)));
        assert_eq!(stored.status, TradeStatus::Entered);
    }

    #[tokio::test]
    async fn test_stop_closes_position() {
        let (store, engine, state) = setup(dec!(10)).await;

        let outcome = engine
            .process_trade_exit(&state, dec!(94), None, ts() + Duration::minutes(1))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(outcome.decision.action, ExitAction::Stop);
        let intent = outcome.intent.unwrap();
        assert_eq!(intent.side, Side::Sell);
        assert_eq!(intent.qty, dec!(10));
        assert_eq!(intent.reason, "HARD_STOP_ATR");

        let stored = store.get_trade_state("AAPL", "baseline").await.unwrap().unwrap();
        assert_eq!(stored.status, TradeStatus::Exited);
        assert_eq!(stored.exit_price, Some(dec!(94)));

        let events = store.list_trade_events("AAPL", "baseline").await.unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].event_type, "STOP");
        assert_eq!(events[0].description, "HARD_STOP_ATR price=94");
    }

    #[tokio::test]
    async fn test_partial_then_full_take_profit_short() {
        let (store, engine, state) = setup(dec!(-10)).await;

        let first = engine
            .process_trade_exit(&state, dec!(95), None, ts() + Duration::minutes(1))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(first.decision.action, ExitAction::Tp1Partial);
        let cover = first.intent.unwrap();
        assert_eq!(cover.side, Side::Buy);
        assert_eq!(cover.qty, dec!(5));

        let managed = store.get_trade_state("AAPL", "baseline").await.unwrap().unwrap();
        assert_eq!(managed.status, TradeStatus::Managed);
        assert_eq!(managed.qty, dec!(-5));

        // TP1 does not fire twice
        let second = engine
            .process_trade_exit(&managed, dec!(94), None, ts() + Duration::minutes(2))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(second.decision.action, ExitAction::None);

        let managed = store.get_trade_state("AAPL", "baseline").await.unwrap().unwrap();
        let last = engine
            .process_trade_exit(&managed, dec!(90), None, ts() + Duration::minutes(3))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(last.decision.action, ExitAction::Tp2Full);
        assert_eq!(last.intent.unwrap().qty, dec!(5));
        let stored = store.get_trade_state("AAPL", "baseline").await.unwrap().unwrap();
        assert_eq!(stored.closed_qty, Some(dec!(5)));
    }

    #[tokio::test]
    async fn test_missing_levels_use_atr_or_skip() {
        let (_, engine, mut state) = setup(dec!(10)).await;
        state.set_levels(None);

        assert!(engine
            .process_trade_exit(&state, dec!(90), None, ts())
            .await
            .unwrap()
            .is_none());

        // ATR 1 with multiple 2 puts the stop at 98
        let outcome = engine
            .process_trade_exit(&state, dec!(97), Some(dec!(1)), ts())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(outcome.decision.action, ExitAction::Stop);
    }

    #[tokio::test]
    async fn test_flat_trade_is_ignored() {
        let store = Arc::new(MemoryStore::new());
        let lifecycle = Arc::new(LifecycleEngine::new(store.clone(), 5));
        let engine = ExitEngine::new(store, lifecycle, dec!(2));
        let flat = TradeState::flat("AAPL", "baseline", ts());
        assert!(engine
            .process_trade_exit(&flat, dec!(100), Some(dec!(1)), ts())
            .await
            .unwrap()
            .is_none());
    }
}
