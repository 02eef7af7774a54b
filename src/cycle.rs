//! Cycle runner: one pass of exits, journal, risk gates, entries and exposure
//! snapshots, plus the periodic loop around it.
//!
//! Each cycle reads everything it needs from the store, so a failed cycle
//! leaves nothing behind in memory and the next tick starts fresh. Paper
//! fills are written next to the lifecycle transition they belong to, so an
//! aborted cycle cannot leave the paper book out of step with trade state.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Duration as StdDuration;

use anyhow::Result;
use chrono::{DateTime, Duration, Utc};
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use tracing::{debug, error, info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::config::DeskConfig;
use crate::db::Store;
use crate::metrics::annualized_volatility;
use crate::models::{
    OrderIntent, PaperPosition, RiskEvent, RiskGateResult, RiskMode, RiskStateRecord, Severity,
    Side, Signal, TradeJournalEntry, TradeStatus,
};
use crate::trading::{
    build_order_intent, compute_atr_levels, drawdown_pct, ExitEngine, GateInputs, LifecycleEngine,
    NewEntry, PositionSizer, RiskEngine,
};

/// Reason attached to entry intents raised by the cycle.
pub const ENTRY_REASON: &str = "RISK_CYCLE_ENTRY";

/// External inputs for one cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CycleInputs {
    pub now: DateTime<Utc>,
    pub correlation_flag: bool,
    pub reconciliation_flag: bool,
}

impl CycleInputs {
    /// Inputs with both flags cleared.
    pub fn at(now: DateTime<Utc>) -> Self {
        Self {
            now,
            correlation_flag: false,
            reconciliation_flag: false,
        }
    }
}

/// Why a symbol was passed over.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SkipReason {
    NoPrice,
    ActiveTrade,
    Cooldown,
    ZeroSize,
}

impl SkipReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            SkipReason::NoPrice => "NO_PRICE",
            SkipReason::ActiveTrade => "ACTIVE_TRADE",
            SkipReason::Cooldown => "COOLDOWN",
            SkipReason::ZeroSize => "ZERO_SIZE",
        }
    }
}

/// Account figures the gates were evaluated on.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct EquityView {
    pub equity: Decimal,
    pub peak_equity: Decimal,
    pub daily_pnl: Decimal,
    pub weekly_pnl: Decimal,
}

/// Everything one cycle did.
#[derive(Debug, Clone, PartialEq)]
pub struct CycleReport {
    pub cycle_id: Uuid,
    pub ts: DateTime<Utc>,
    pub gate: RiskGateResult,
    pub equity: EquityView,
    pub exit_intents: Vec<OrderIntent>,
    pub entry_intents: Vec<OrderIntent>,
    pub journaled: Vec<TradeJournalEntry>,
    pub skipped: Vec<(String, SkipReason)>,
    pub snapshots: usize,
    /// Realized PnL booked on the paper book this cycle.
    pub paper_realized: Decimal,
}

impl CycleReport {
    fn new(cycle_id: Uuid, ts: DateTime<Utc>) -> Self {
        Self {
            cycle_id,
            ts,
            gate: RiskGateResult {
                mode: RiskMode::Normal,
                reasons: Vec::new(),
            },
            equity: EquityView::default(),
            exit_intents: Vec::new(),
            entry_intents: Vec::new(),
            journaled: Vec::new(),
            skipped: Vec::new(),
            snapshots: 0,
            paper_realized: Decimal::ZERO,
        }
    }

    /// Exit intents first, then entries.
    pub fn intents(&self) -> impl Iterator<Item = &OrderIntent> {
        self.exit_intents.iter().chain(self.entry_intents.iter())
    }
}

/// Orchestrates the engines against one store.
pub struct CycleRunner {
    config: DeskConfig,
    store: Arc<dyn Store>,
    risk: RiskEngine,
    sizer: PositionSizer,
    lifecycle: Arc<LifecycleEngine>,
    exits: ExitEngine,
}

impl CycleRunner {
    pub fn new(config: DeskConfig, store: Arc<dyn Store>) -> Self {
        let lifecycle = Arc::new(LifecycleEngine::new(store.clone(), config.cooldown_minutes));
        let exits = ExitEngine::new(store.clone(), lifecycle.clone(), config.exit_atr_multiple);

        Self {
            risk: RiskEngine::new(config.risk.clone()),
            sizer: PositionSizer::new(config.risk.clone()),
            lifecycle,
            exits,
            store,
            config,
        }
    }

    /// Run cycles on a fixed interval until Ctrl-C.
    ///
    /// A failed cycle is logged and the next tick starts over.
    pub async fn run(&self) -> Result<()> {
        info!(
            interval_secs = self.config.cycle_interval_secs,
            paper_trading = self.config.paper_trading,
            strategy = %self.config.strategy_id,
            "Starting cycle loop"
        );

        let mut ticker = tokio::time::interval(StdDuration::from_secs(self.config.cycle_interval_secs));
        let shutdown = tokio::signal::ctrl_c();
        tokio::pin!(shutdown);

        loop {
            tokio::select! {
                _ = &mut shutdown => {
                    info!("Shutdown signal received");
                    break;
                }
                _ = ticker.tick() => {
                    if let Err(e) = self.run_cycle(&CycleInputs::at(Utc::now())).await {
                        error!(error = %e, "Cycle failed");
                    }
                }
            }
        }

        Ok(())
    }

    /// Run one complete cycle. A store error aborts the remaining steps.
    pub async fn run_cycle(&self, inputs: &CycleInputs) -> Result<CycleReport> {
        let cycle_id = Uuid::new_v4();
        let span = info_span!("cycle", cycle_id = %cycle_id);
        self.run_steps(cycle_id, inputs).instrument(span).await
    }

    async fn run_steps(&self, cycle_id: Uuid, inputs: &CycleInputs) -> Result<CycleReport> {
        let now = inputs.now;
        let mut report = CycleReport::new(cycle_id, now);
        info!(ts = %now, "Cycle start");

        // 1. Exits
        let closed = self.exits_step(now, &mut report).await?;

        // 2. Journal
        report.journaled = self.lifecycle.process_exited_trades(now).await?;

        // 3. Risk gates
        report.equity = self.equity_view().await?;
        report.gate = self.gates_step(inputs, &report.equity).await?;

        // 4. Entries
        let signals = self.store.latest_signals().await?;
        let sectors: BTreeMap<String, Option<String>> = signals
            .iter()
            .map(|s| (s.symbol.clone(), s.sector.clone()))
            .collect();
        if report.gate.allow_new_risk() && report.equity.equity > Decimal::ZERO {
            self.entries_step(now, &signals, &mut report).await?;
        } else {
            info!(mode = %report.gate.mode, "Reduce-only cycle, no new entries");
        }

        // 5. Exposure snapshots
        report.snapshots = self
            .snapshot_step(now, report.equity.equity, &sectors, &closed)
            .await?;

        info!(
            mode = %report.gate.mode,
            exits = report.exit_intents.len(),
            entries = report.entry_intents.len(),
            journaled = report.journaled.len(),
            skipped = report.skipped.len(),
            "Cycle complete"
        );
        Ok(report)
    }

    /// Evaluate exits on every open trade. Returns the (symbol, strategy)
    /// pairs that were fully closed.
    async fn exits_step(
        &self,
        now: DateTime<Utc>,
        report: &mut CycleReport,
    ) -> Result<BTreeSet<(String, String)>> {
        let open = self
            .store
            .list_trade_states(&[TradeStatus::Entered, TradeStatus::Managed])
            .await?;
        let mut closed = BTreeSet::new();

        for state in open {
            let Some((_, price)) = self.store.latest_close(&state.symbol).await? else {
                warn!(symbol = %state.symbol, "No price for open trade, skipping exit check");
                report.skipped.push((state.symbol.clone(), SkipReason::NoPrice));
                continue;
            };
            let atr = self.store.latest_atr(&state.symbol).await?;

            let Some(outcome) = self.exits.process_trade_exit(&state, price, atr, now).await? else {
                continue;
            };
            if outcome.decision.action.is_full_exit() {
                closed.insert((state.symbol.clone(), state.strategy_id.clone()));
            }
            if let Some(intent) = outcome.intent {
                if self.config.paper_trading {
                    report.paper_realized += self.paper_fill_exit(&intent, now).await?;
                }
                report.exit_intents.push(intent);
            }
        }

        Ok(closed)
    }

    async fn equity_view(&self) -> Result<EquityView> {
        let Some(latest) = self.store.latest_balance().await? else {
            warn!("No balance recorded, equity treated as zero");
            return Ok(EquityView::default());
        };

        let equity = latest.balance;
        let pnl_since = |reference: Option<Decimal>| reference.map_or(Decimal::ZERO, |b| equity - b);
        let daily = self
            .store
            .balance_at_or_before(latest.ts - Duration::days(1))
            .await?
            .map(|p| p.balance);
        let weekly = self
            .store
            .balance_at_or_before(latest.ts - Duration::days(7))
            .await?
            .map(|p| p.balance);
        let peak = self.store.peak_balance().await?.unwrap_or(equity);

        Ok(EquityView {
            equity,
            peak_equity: peak,
            daily_pnl: pnl_since(daily),
            weekly_pnl: pnl_since(weekly),
        })
    }

    /// Evaluate and persist the gates.
    async fn gates_step(&self, inputs: &CycleInputs, view: &EquityView) -> Result<RiskGateResult> {
        let sector_exposure_pct = if view.equity > Decimal::ZERO {
            let net = self
                .store
                .sector_net_exposure_since(inputs.now - Duration::days(1))
                .await?;
            Some(
                net.into_iter()
                    .map(|(sector, exposure)| (sector, exposure / view.equity))
                    .collect(),
            )
        } else {
            None
        };

        let gate_inputs = GateInputs {
            equity: view.equity,
            peak_equity: view.peak_equity,
            daily_pnl: view.daily_pnl,
            weekly_pnl: view.weekly_pnl,
            sector_exposure_pct,
            correlation_flag: inputs.correlation_flag,
            reconciliation_flag: inputs.reconciliation_flag,
        };
        let result = self.risk.evaluate_gates(&gate_inputs);

        self.store
            .append_risk_state(&RiskStateRecord {
                ts: inputs.now,
                mode: result.mode,
                reasons: result.reasons.clone(),
                drawdown_pct: drawdown_pct(view.equity, view.peak_equity)
                    .to_f64()
                    .unwrap_or(0.0),
                daily_pnl: view.daily_pnl,
                weekly_pnl: view.weekly_pnl,
                correlation_flag: inputs.correlation_flag,
                reconciliation_flag: inputs.reconciliation_flag,
            })
            .await?;

        let severity = if result.mode == RiskMode::Normal {
            Severity::Info
        } else {
            Severity::Warn
        };
        self.store
            .append_risk_event(&RiskEvent {
                ts: inputs.now,
                event_type: "RISK_GATES_EVALUATED".to_string(),
                severity,
                description: format!("mode={} reasons={}", result.mode, result.reasons.join(",")),
            })
            .await?;

        match result.mode {
            RiskMode::Normal => info!(mode = %result.mode, reasons = ?result.reasons, "Risk gates evaluated"),
            _ => warn!(mode = %result.mode, reasons = ?result.reasons, "Risk gates restrict trading"),
        }
        Ok(result)
    }

    async fn entries_step(
        &self,
        now: DateTime<Utc>,
        signals: &[Signal],
        report: &mut CycleReport,
    ) -> Result<()> {
        let strategy_id = self.config.strategy_id.as_str();
        let equity = report.equity.equity;

        for signal in signals {
            let symbol = signal.symbol.as_str();

            let active = self
                .store
                .get_trade_state(symbol, strategy_id)
                .await?
                .is_some_and(|s| s.status.is_active());
            if active {
                debug!(symbol, "Trade already open, skipping entry");
                report.skipped.push((symbol.to_string(), SkipReason::ActiveTrade));
                continue;
            }

            if self.lifecycle.is_in_cooldown(symbol, strategy_id, Some(now)).await? {
                info!(symbol, "Symbol in cooldown, skipping entry");
                report.skipped.push((symbol.to_string(), SkipReason::Cooldown));
                continue;
            }

            let Some(price) = self
                .store
                .latest_close(symbol)
                .await?
                .map(|(_, close)| close)
                .filter(|p| *p > Decimal::ZERO)
            else {
                report.skipped.push((symbol.to_string(), SkipReason::NoPrice));
                continue;
            };

            let atr = self.store.latest_atr(symbol).await?;
            let base_size = self.sizer.compute_position_size(price, equity, atr);
            let closes = self
                .store
                .recent_closes(symbol, self.config.vol_lookback)
                .await?;
            let asset_vol = annualized_volatility(&closes, self.config.periods_per_year);
            let size = self.sizer.apply_vol_targeting(base_size, asset_vol);
            if size <= Decimal::ZERO {
                debug!(symbol, base = %base_size, vol = ?asset_vol, "Zero size, skipping entry");
                report.skipped.push((symbol.to_string(), SkipReason::ZeroSize));
                continue;
            }

            let target_qty = size * signal.side.sign();
            let position = self.store.get_paper_position(symbol, strategy_id).await?;
            let current_qty = position.as_ref().map_or(Decimal::ZERO, |p| p.qty);
            let intent =
                build_order_intent(symbol, target_qty, current_qty, price, strategy_id, ENTRY_REASON);

            let atr_for_levels = atr
                .filter(|a| *a > Decimal::ZERO)
                .unwrap_or(price * self.config.exit_atr_fallback_pct);
            let levels =
                compute_atr_levels(signal.side, price, atr_for_levels, self.config.exit_atr_multiple)?;

            // The paper book moves before the lifecycle row does
            if self.config.paper_trading {
                if let Some(intent) = &intent {
                    let mut position =
                        position.unwrap_or_else(|| PaperPosition::flat(symbol, strategy_id, now));
                    report.paper_realized += self.paper_fill(&mut position, intent, now).await?;
                }
            }

            self.lifecycle
                .register_entry(&NewEntry {
                    symbol: symbol.to_string(),
                    strategy_id: strategy_id.to_string(),
                    qty: target_qty,
                    entry_price: price,
                    entry_ts: now,
                    levels,
                })
                .await?;

            let Some(intent) = intent else {
                info!(symbol, qty = %target_qty, "Paper book already at target, trade registered");
                continue;
            };
            info!(
                symbol,
                side = %intent.side,
                qty = %intent.qty,
                price = %intent.price,
                "New entry"
            );
            report.entry_intents.push(intent);
        }

        Ok(())
    }

    /// Snapshot every open trade, plus a zero snapshot for trades closed
    /// this cycle so sector exposure stops counting them.
    async fn snapshot_step(
        &self,
        now: DateTime<Utc>,
        equity: Decimal,
        sectors: &BTreeMap<String, Option<String>>,
        closed: &BTreeSet<(String, String)>,
    ) -> Result<usize> {
        let equity = Some(equity).filter(|e| *e > Decimal::ZERO);
        let sector_of = |symbol: &str| sectors.get(symbol).and_then(|s| s.as_deref());

        let open = self
            .store
            .list_trade_states(&[TradeStatus::Entered, TradeStatus::Managed])
            .await?;
        let mut count = 0;

        for state in &open {
            let price = match self.store.latest_close(&state.symbol).await? {
                Some((_, close)) => close,
                None => state.entry_price.unwrap_or(Decimal::ZERO),
            };
            let snapshot = self.risk.build_exposure_snapshot(
                &state.symbol,
                sector_of(&state.symbol),
                &state.strategy_id,
                state.qty,
                price,
                equity,
                now,
            );
            self.store.append_exposure_snapshot(&snapshot).await?;
            count += 1;
        }

        for (symbol, strategy_id) in closed {
            let snapshot = self.risk.build_exposure_snapshot(
                symbol,
                sector_of(symbol),
                strategy_id,
                Decimal::ZERO,
                Decimal::ZERO,
                equity,
                now,
            );
            self.store.append_exposure_snapshot(&snapshot).await?;
            count += 1;
        }

        debug!(count, "Exposure snapshots recorded");
        Ok(count)
    }

    /// Reduce the paper position by an exit intent, never past flat.
    ///
    /// Skipped when the book does not hold the side being exited.
    async fn paper_fill_exit(&self, intent: &OrderIntent, now: DateTime<Utc>) -> Result<Decimal> {
        let held = self
            .store
            .get_paper_position(&intent.symbol, &intent.strategy_id)
            .await?
            .filter(|p| Side::from_signed_qty(p.qty) == Some(intent.side.opposite()));
        let Some(mut position) = held else {
            warn!(
                symbol = %intent.symbol,
                strategy = %intent.strategy_id,
                side = %intent.side,
                "Paper book does not hold the exited side, no fill"
            );
            return Ok(Decimal::ZERO);
        };

        let fill = OrderIntent {
            qty: intent.qty.min(position.qty.abs()),
            ..intent.clone()
        };
        self.paper_fill(&mut position, &fill, now).await
    }

    /// Apply one intent to the paper book at its price.
    async fn paper_fill(
        &self,
        position: &mut PaperPosition,
        intent: &OrderIntent,
        now: DateTime<Utc>,
    ) -> Result<Decimal> {
        let pnl = position.apply(intent, now);
        self.store.upsert_paper_position(position).await?;

        info!(
            symbol = %intent.symbol,
            side = %intent.side,
            qty = %intent.qty,
            price = %intent.price,
            position = %position.qty,
            realized = %pnl,
            "[PAPER] Filled"
        );
        Ok(pnl)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};

    use crate::db::MemoryStore;
    use crate::models::{
        BalancePoint, Bar, ExposureSnapshot, JournalKey, LifecycleEvent, TradeEvent, TradeState,
    };
    use anyhow::bail;
    use async_trait::async_trait;
    use chrono::TimeZone;
    use rust_decimal_macros::dec;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 1, 14, 30, 0).unwrap()
    }

    fn bar(at: DateTime<Utc>, close: Decimal) -> Bar {
        Bar {
            timestamp: at,
            symbol: "AAPL".to_string(),
            open: close,
            high: close,
            low: close,
            close,
            volume: dec!(100),
        }
    }

    async fn seeded_store() -> Arc<MemoryStore> {
        let store = Arc::new(MemoryStore::new());
        seed(store.as_ref()).await;
        store
    }

    async fn seed(store: &dyn Store) {
        store.insert_bars(&[bar(t0(), dec!(100))]).await.unwrap();
        store.record_atr("AAPL", t0(), dec!(2)).await.unwrap();
        store
            .record_signal(&Signal {
                symbol: "AAPL".to_string(),
                side: Side::Buy,
                ts: t0(),
                sector: Some("tech".to_string()),
            })
            .await
            .unwrap();
    }

    /// Memory store whose exposure snapshot writes can be switched to fail.
    #[derive(Default)]
    struct FlakyStore {
        inner: MemoryStore,
        fail_snapshots: AtomicBool,
    }

    #[async_trait]
    impl Store for FlakyStore {
        async fn get_trade_state(&self, symbol: &str, strategy_id: &str) -> Result<Option<TradeState>> {
            self.inner.get_trade_state(symbol, strategy_id).await
        }
        async fn upsert_trade_state(&self, state: &TradeState) -> Result<()> {
            self.inner.upsert_trade_state(state).await
        }
        async fn list_trade_states(&self, statuses: &[TradeStatus]) -> Result<Vec<TradeState>> {
            self.inner.list_trade_states(statuses).await
        }
        async fn append_lifecycle_event(&self, event: &LifecycleEvent) -> Result<()> {
            self.inner.append_lifecycle_event(event).await
        }
        async fn latest_lifecycle_event(
            &self,
            symbol: &str,
            strategy_id: &str,
            state: TradeStatus,
        ) -> Result<Option<LifecycleEvent>> {
            self.inner.latest_lifecycle_event(symbol, strategy_id, state).await
        }
        async fn append_trade_event(&self, event: &TradeEvent) -> Result<()> {
            self.inner.append_trade_event(event).await
        }
        async fn list_trade_events(&self, symbol: &str, strategy_id: &str) -> Result<Vec<TradeEvent>> {
            self.inner.list_trade_events(symbol, strategy_id).await
        }
        async fn journal_exists(&self, key: &JournalKey) -> Result<bool> {
            self.inner.journal_exists(key).await
        }
        async fn append_journal_entry(&self, entry: &TradeJournalEntry) -> Result<()> {
            self.inner.append_journal_entry(entry).await
        }
        async fn list_journal(&self, strategy_id: Option<&str>) -> Result<Vec<TradeJournalEntry>> {
            self.inner.list_journal(strategy_id).await
        }
        async fn append_risk_state(&self, record: &RiskStateRecord) -> Result<()> {
            self.inner.append_risk_state(record).await
        }
        async fn latest_risk_state(&self) -> Result<Option<RiskStateRecord>> {
            self.inner.latest_risk_state().await
        }
        async fn append_risk_event(&self, event: &RiskEvent) -> Result<()> {
            self.inner.append_risk_event(event).await
        }
        async fn recent_risk_events(&self, limit: usize) -> Result<Vec<RiskEvent>> {
            self.inner.recent_risk_events(limit).await
        }
        async fn append_exposure_snapshot(&self, snapshot: &ExposureSnapshot) -> Result<()> {
            if self.fail_snapshots.load(Ordering::SeqCst) {
                bail!("snapshot store down");
            }
            self.inner.append_exposure_snapshot(snapshot).await
        }
        async fn sector_net_exposure_since(
            &self,
            since: DateTime<Utc>,
        ) -> Result<BTreeMap<String, Decimal>> {
            self.inner.sector_net_exposure_since(since).await
        }
        async fn insert_bars(&self, bars: &[Bar]) -> Result<usize> {
            self.inner.insert_bars(bars).await
        }
        async fn latest_close(&self, symbol: &str) -> Result<Option<(DateTime<Utc>, Decimal)>> {
            self.inner.latest_close(symbol).await
        }
        async fn close_path(
            &self,
            symbol: &str,
            start: DateTime<Utc>,
            end: DateTime<Utc>,
        ) -> Result<Vec<Decimal>> {
            self.inner.close_path(symbol, start, end).await
        }
        async fn recent_bars(&self, symbol: &str, limit: usize) -> Result<Vec<Bar>> {
            self.inner.recent_bars(symbol, limit).await
        }
        async fn record_atr(&self, symbol: &str, ts: DateTime<Utc>, atr: Decimal) -> Result<()> {
            self.inner.record_atr(symbol, ts, atr).await
        }
        async fn latest_atr(&self, symbol: &str) -> Result<Option<Decimal>> {
            self.inner.latest_atr(symbol).await
        }
        async fn record_balance(&self, point: &BalancePoint) -> Result<()> {
            self.inner.record_balance(point).await
        }
        async fn latest_balance(&self) -> Result<Option<BalancePoint>> {
            self.inner.latest_balance().await
        }
        async fn balance_at_or_before(&self, ts: DateTime<Utc>) -> Result<Option<BalancePoint>> {
            self.inner.balance_at_or_before(ts).await
        }
        async fn peak_balance(&self) -> Result<Option<Decimal>> {
            self.inner.peak_balance().await
        }
        async fn balance_history(&self) -> Result<Vec<BalancePoint>> {
            self.inner.balance_history().await
        }
        async fn record_signal(&self, signal: &Signal) -> Result<()> {
            self.inner.record_signal(signal).await
        }
        async fn latest_signals(&self) -> Result<Vec<Signal>> {
            self.inner.latest_signals().await
        }
        async fn get_paper_position(
            &self,
            symbol: &str,
            strategy_id: &str,
        ) -> Result<Option<PaperPosition>> {
            self.inner.get_paper_position(symbol, strategy_id).await
        }
        async fn upsert_paper_position(&self, position: &PaperPosition) -> Result<()> {
            self.inner.upsert_paper_position(position).await
        }
        async fn list_paper_positions(&self) -> Result<Vec<PaperPosition>> {
            self.inner.list_paper_positions().await
        }
    }

    #[tokio::test]
    async fn test_halt_blocks_entries() {
        let store = seeded_store().await;
        store
            .record_balance(&BalancePoint { ts: t0() - Duration::days(2), balance: dec!(10000) })
            .await
            .unwrap();
        store
            .record_balance(&BalancePoint { ts: t0(), balance: dec!(7000) })
            .await
            .unwrap();

        let runner = CycleRunner::new(DeskConfig::default(), store.clone());
        let report = runner.run_cycle(&CycleInputs::at(t0())).await.unwrap();

        assert_eq!(report.gate.mode, RiskMode::Halt);
        assert!(report.gate.reasons.iter().any(|r| r.contains("MAX_DRAWDOWN")));
        assert!(report.entry_intents.is_empty());
        assert!(store.get_trade_state("AAPL", "baseline").await.unwrap().is_none());

        let persisted = store.latest_risk_state().await.unwrap().unwrap();
        assert_eq!(persisted.mode, RiskMode::Halt);
        assert!((persisted.drawdown_pct - 0.3).abs() < 1e-9);
        let events = store.recent_risk_events(1).await.unwrap();
        assert_eq!(events[0].event_type, "RISK_GATES_EVALUATED");
        assert_eq!(events[0].severity, Severity::Warn);
    }

    #[tokio::test]
    async fn test_reconciliation_flag_halts() {
        let store = seeded_store().await;
        store
            .record_balance(&BalancePoint { ts: t0(), balance: dec!(10000) })
            .await
            .unwrap();

        let runner = CycleRunner::new(DeskConfig::default(), store.clone());
        let inputs = CycleInputs {
            reconciliation_flag: true,
            ..CycleInputs::at(t0())
        };
        let report = runner.run_cycle(&inputs).await.unwrap();
        assert_eq!(report.gate.reasons, vec!["RECONCILIATION_FLAG_ACTIVE".to_string()]);
        assert!(report.entry_intents.is_empty());
    }

    #[tokio::test]
    async fn test_degraded_blocks_entries_but_runs_exits() {
        let store = seeded_store().await;
        store
            .record_balance(&BalancePoint { ts: t0(), balance: dec!(10000) })
            .await
            .unwrap();
        let runner = CycleRunner::new(DeskConfig::default(), store.clone());
        let first = runner.run_cycle(&CycleInputs::at(t0())).await.unwrap();
        assert_eq!(first.entry_intents.len(), 1);

        // AAPL breaks its stop while a fresh MSFT signal arrives
        let t1 = t0() + Duration::minutes(1);
        store
            .insert_bars(&[
                bar(t1, dec!(95)),
                Bar { symbol: "MSFT".to_string(), ..bar(t1, dec!(50)) },
            ])
            .await
            .unwrap();
        store
            .record_signal(&Signal {
                symbol: "MSFT".to_string(),
                side: Side::Buy,
                ts: t1,
                sector: Some("tech".to_string()),
            })
            .await
            .unwrap();

        let inputs = CycleInputs {
            correlation_flag: true,
            ..CycleInputs::at(t1)
        };
        let report = runner.run_cycle(&inputs).await.unwrap();

        assert_eq!(report.gate.mode, RiskMode::Degraded);
        assert_eq!(report.gate.reasons, vec!["CORRELATION_FLAG_ACTIVE".to_string()]);
        assert_eq!(report.exit_intents.len(), 1);
        assert_eq!(report.exit_intents[0].symbol, "AAPL");
        assert_eq!(report.journaled.len(), 1);
        assert!(report.entry_intents.is_empty());
        assert!(report.skipped.is_empty());

        assert!(store.get_trade_state("MSFT", "baseline").await.unwrap().is_none());
        assert!(store.get_paper_position("MSFT", "baseline").await.unwrap().is_none());
        let aapl = store.get_paper_position("AAPL", "baseline").await.unwrap().unwrap();
        assert!(aapl.is_flat());
    }

    #[tokio::test]
    async fn test_aborted_cycle_keeps_paper_book_with_trade() {
        let store = Arc::new(FlakyStore::default());
        seed(store.as_ref()).await;
        store
            .record_balance(&BalancePoint { ts: t0(), balance: dec!(10000) })
            .await
            .unwrap();
        let runner = CycleRunner::new(DeskConfig::default(), store.clone());

        // Entry goes through, then the snapshot write fails
        store.fail_snapshots.store(true, Ordering::SeqCst);
        let err = runner.run_cycle(&CycleInputs::at(t0())).await.unwrap_err();
        assert!(err.to_string().contains("snapshot store down"));

        let state = store.get_trade_state("AAPL", "baseline").await.unwrap().unwrap();
        assert_eq!(state.status, TradeStatus::Entered);
        assert_eq!(state.qty, dec!(1));
        let position = store.get_paper_position("AAPL", "baseline").await.unwrap().unwrap();
        assert_eq!(position.qty, dec!(1));

        // Next cycle stops the trade out and the book follows it to flat
        store.fail_snapshots.store(false, Ordering::SeqCst);
        let t1 = t0() + Duration::minutes(1);
        store.insert_bars(&[bar(t1, dec!(95))]).await.unwrap();
        let report = runner.run_cycle(&CycleInputs::at(t1)).await.unwrap();

        assert_eq!(report.exit_intents.len(), 1);
        assert_eq!(report.journaled.len(), 1);
        assert_eq!(report.paper_realized, dec!(-5));
        let state = store.get_trade_state("AAPL", "baseline").await.unwrap().unwrap();
        assert_eq!(state.status, TradeStatus::Flat);
        let position = store.get_paper_position("AAPL", "baseline").await.unwrap().unwrap();
        assert!(position.is_flat());
    }

    #[tokio::test]
    async fn test_exit_without_paper_position_is_not_filled() {
        let store = seeded_store().await;
        store
            .record_balance(&BalancePoint { ts: t0(), balance: dec!(10000) })
            .await
            .unwrap();
        let runner = CycleRunner::new(DeskConfig::default(), store.clone());
        runner.run_cycle(&CycleInputs::at(t0())).await.unwrap();

        // Book lost its position while the trade stayed open
        let mut position = store.get_paper_position("AAPL", "baseline").await.unwrap().unwrap();
        position.qty = Decimal::ZERO;
        store.upsert_paper_position(&position).await.unwrap();

        let t1 = t0() + Duration::minutes(1);
        store.insert_bars(&[bar(t1, dec!(95))]).await.unwrap();
        let report = runner.run_cycle(&CycleInputs::at(t1)).await.unwrap();

        assert_eq!(report.exit_intents.len(), 1);
        assert_eq!(report.paper_realized, Decimal::ZERO);
        let position = store.get_paper_position("AAPL", "baseline").await.unwrap().unwrap();
        assert!(position.is_flat());
    }

    #[tokio::test]
    async fn test_entry_exit_and_journal_flow() {
        let store = seeded_store().await;
        store
            .record_balance(&BalancePoint { ts: t0(), balance: dec!(10000) })
            .await
            .unwrap();
        let runner = CycleRunner::new(DeskConfig::default(), store.clone());

        // Cycle 1: 10000 * 0.01 / 100 = 1 share, stop 2 ATRs below
        let first = runner.run_cycle(&CycleInputs::at(t0())).await.unwrap();
        assert_eq!(first.gate.mode, RiskMode::Normal);
        assert_eq!(first.entry_intents.len(), 1);
        let entry = &first.entry_intents[0];
        assert_eq!(entry.side, Side::Buy);
        assert_eq!(entry.qty, dec!(1));
        assert_eq!(entry.reason, ENTRY_REASON);

        let state = store.get_trade_state("AAPL", "baseline").await.unwrap().unwrap();
        assert_eq!(state.status, TradeStatus::Entered);
        assert_eq!(state.stop_price, Some(dec!(96)));
        let position = store.get_paper_position("AAPL", "baseline").await.unwrap().unwrap();
        assert_eq!(position.qty, dec!(1));
        assert_eq!(first.snapshots, 1);

        // Cycle 2: price breaks the stop
        let t1 = t0() + Duration::minutes(1);
        store.insert_bars(&[bar(t1, dec!(95))]).await.unwrap();
        let second = runner.run_cycle(&CycleInputs::at(t1)).await.unwrap();

        assert_eq!(second.exit_intents.len(), 1);
        assert_eq!(second.exit_intents[0].side, Side::Sell);
        assert_eq!(second.journaled.len(), 1);
        assert_eq!(second.journaled[0].r, dec!(-1.25));
        assert_eq!(second.journaled[0].mae, dec!(-1.25));
        assert!(second.entry_intents.is_empty());
        assert_eq!(
            second.skipped,
            vec![("AAPL".to_string(), SkipReason::Cooldown)]
        );
        assert_eq!(second.paper_realized, dec!(-5));

        let state = store.get_trade_state("AAPL", "baseline").await.unwrap().unwrap();
        assert_eq!(state.status, TradeStatus::Flat);
        let position = store.get_paper_position("AAPL", "baseline").await.unwrap().unwrap();
        assert!(position.is_flat());

        // The closed trade no longer counts toward sector exposure
        let exposure = store.sector_net_exposure_since(t0()).await.unwrap();
        assert_eq!(exposure.get("tech"), Some(&Decimal::ZERO));

        // Cycle 3 after the cooldown re-enters
        let t2 = t1 + Duration::minutes(10);
        let third = runner.run_cycle(&CycleInputs::at(t2)).await.unwrap();
        assert_eq!(third.entry_intents.len(), 1);
    }

    #[tokio::test]
    async fn test_missing_price_is_skipped() {
        let store = Arc::new(MemoryStore::new());
        store
            .record_balance(&BalancePoint { ts: t0(), balance: dec!(10000) })
            .await
            .unwrap();
        store
            .record_signal(&Signal {
                symbol: "NOBARS".to_string(),
                side: Side::Sell,
                ts: t0(),
                sector: None,
            })
            .await
            .unwrap();

        let runner = CycleRunner::new(DeskConfig::default(), store.clone());
        let report = runner.run_cycle(&CycleInputs::at(t0())).await.unwrap();
        assert_eq!(report.skipped, vec![("NOBARS".to_string(), SkipReason::NoPrice)]);
        assert!(report.entry_intents.is_empty());
    }
}
