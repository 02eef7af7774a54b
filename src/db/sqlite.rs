//! SQLite implementation of [`Store`].
//!
//! Decimals are stored as TEXT to keep them exact. Timestamps are stored as
//! fixed-width RFC 3339 TEXT in UTC so string order matches time order.

use std::collections::BTreeMap;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use rust_decimal::Decimal;
use sqlx::{sqlite::SqlitePoolOptions, SqlitePool};

use super::{Store, UNKNOWN_SECTOR};
use crate::models::{
    BalancePoint, Bar, ExposureSnapshot, JournalKey, LifecycleEvent, PaperPosition, RiskEvent,
    RiskMode, RiskStateRecord, Severity, Side, Signal, TradeEvent, TradeJournalEntry, TradeState,
    TradeStatus,
};

/// Database connection pool.
pub struct Database {
    pool: SqlitePool,
}

/// Stored trade state row.
#[derive(Debug, Clone, sqlx::FromRow)]
struct TradeStateRow {
    symbol: String,
    strategy_id: String,
    status: String,
    qty: String,
    entry_price: Option<String>,
    entry_ts: Option<String>,
    stop_price: Option<String>,
    tp1_price: Option<String>,
    tp2_price: Option<String>,
    trailing_price: Option<String>,
    initial_stop: Option<String>,
    closed_qty: Option<String>,
    exit_price: Option<String>,
    updated_at: String,
}

/// Stored lifecycle event.
#[derive(Debug, Clone, sqlx::FromRow)]
struct LifecycleRow {
    symbol: String,
    strategy_id: String,
    lifecycle_state: String,
    ts: String,
    meta: String,
}

#[derive(Debug, Clone, sqlx::FromRow)]
struct TradeEventRow {
    symbol: String,
    strategy_id: String,
    event_type: String,
    description: String,
    ts: String,
}

/// Stored journal row.
#[derive(Debug, Clone, sqlx::FromRow)]
struct JournalRow {
    symbol: String,
    strategy_id: String,
    entry_ts: String,
    exit_ts: String,
    entry_price: String,
    exit_price: String,
    qty: String,
    r: String,
    pnl_r: String,
    mae: String,
    mfe: String,
}

#[derive(Debug, Clone, sqlx::FromRow)]
struct RiskStateRow {
    ts: String,
    mode: String,
    reasons: String,
    dd_pct: f64,
    daily_pnl: String,
    weekly_pnl: String,
    correlation_flag: bool,
    reconciliation_flag: bool,
}

#[derive(Debug, Clone, sqlx::FromRow)]
struct RiskEventRow {
    ts: String,
    event_type: String,
    severity: String,
    description: String,
}

#[derive(Debug, Clone, sqlx::FromRow)]
struct BarRow {
    symbol: String,
    ts: String,
    open: String,
    high: String,
    low: String,
    close: String,
    volume: String,
}

#[derive(Debug, Clone, sqlx::FromRow)]
struct SignalRow {
    symbol: String,
    side: String,
    ts: String,
    sector: Option<String>,
}

/// Stored paper position.
#[derive(Debug, Clone, sqlx::FromRow)]
struct PositionRow {
    symbol: String,
    strategy_id: String,
    qty: String,
    avg_price: String,
    realized_pnl: String,
    updated_at: String,
}

fn ts_text(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_ts(value: &str) -> Result<DateTime<Utc>> {
    Ok(DateTime::parse_from_rfc3339(value)
        .with_context(|| format!("Invalid stored timestamp {:?}", value))?
        .with_timezone(&Utc))
}

fn parse_dec(value: &str) -> Result<Decimal> {
    value
        .parse::<Decimal>()
        .with_context(|| format!("Invalid stored decimal {:?}", value))
}

fn parse_opt_dec(value: Option<&str>) -> Result<Option<Decimal>> {
    value.map(parse_dec).transpose()
}

fn dec_text(value: Option<Decimal>) -> Option<String> {
    value.map(|d| d.to_string())
}

impl TryFrom<TradeStateRow> for TradeState {
    type Error = anyhow::Error;

    fn try_from(row: TradeStateRow) -> Result<Self> {
        Ok(TradeState {
            status: row.status.parse::<TradeStatus>()?,
            qty: parse_dec(&row.qty)?,
            entry_price: parse_opt_dec(row.entry_price.as_deref())?,
            entry_ts: row.entry_ts.as_deref().map(parse_ts).transpose()?,
            stop_price: parse_opt_dec(row.stop_price.as_deref())?,
            tp1_price: parse_opt_dec(row.tp1_price.as_deref())?,
            tp2_price: parse_opt_dec(row.tp2_price.as_deref())?,
            trailing_price: parse_opt_dec(row.trailing_price.as_deref())?,
            initial_stop: parse_opt_dec(row.initial_stop.as_deref())?,
            closed_qty: parse_opt_dec(row.closed_qty.as_deref())?,
            exit_price: parse_opt_dec(row.exit_price.as_deref())?,
            updated_at: parse_ts(&row.updated_at)?,
            symbol: row.symbol,
            strategy_id: row.strategy_id,
        })
    }
}

impl TryFrom<LifecycleRow> for LifecycleEvent {
    type Error = anyhow::Error;

    fn try_from(row: LifecycleRow) -> Result<Self> {
        // Unparseable metadata is kept as a raw string so cooldown checks can fail open.
        let metadata = serde_json::from_str(&row.meta)
            .unwrap_or_else(|_| serde_json::Value::String(row.meta.clone()));
        Ok(LifecycleEvent {
            state: row.lifecycle_state.parse::<TradeStatus>()?,
            ts: parse_ts(&row.ts)?,
            metadata,
            symbol: row.symbol,
            strategy_id: row.strategy_id,
        })
    }
}

impl TryFrom<TradeEventRow> for TradeEvent {
    type Error = anyhow::Error;

    fn try_from(row: TradeEventRow) -> Result<Self> {
        Ok(TradeEvent {
            ts: parse_ts(&row.ts)?,
            symbol: row.symbol,
            strategy_id: row.strategy_id,
            event_type: row.event_type,
            description: row.description,
        })
    }
}

impl TryFrom<JournalRow> for TradeJournalEntry {
    type Error = anyhow::Error;

    fn try_from(row: JournalRow) -> Result<Self> {
        Ok(TradeJournalEntry {
            entry_ts: parse_ts(&row.entry_ts)?,
            exit_ts: parse_ts(&row.exit_ts)?,
            entry_price: parse_dec(&row.entry_price)?,
            exit_price: parse_dec(&row.exit_price)?,
            qty: parse_dec(&row.qty)?,
            r: parse_dec(&row.r)?,
            pnl_r: parse_dec(&row.pnl_r)?,
            mae: parse_dec(&row.mae)?,
            mfe: parse_dec(&row.mfe)?,
            symbol: row.symbol,
            strategy_id: row.strategy_id,
        })
    }
}

impl TryFrom<RiskStateRow> for RiskStateRecord {
    type Error = anyhow::Error;

    fn try_from(row: RiskStateRow) -> Result<Self> {
        Ok(RiskStateRecord {
            ts: parse_ts(&row.ts)?,
            mode: row
                .mode
                .parse::<RiskMode>()
                .map_err(anyhow::Error::msg)?,
            reasons: serde_json::from_str(&row.reasons).context("Invalid stored risk reasons")?,
            drawdown_pct: row.dd_pct,
            daily_pnl: parse_dec(&row.daily_pnl)?,
            weekly_pnl: parse_dec(&row.weekly_pnl)?,
            correlation_flag: row.correlation_flag,
            reconciliation_flag: row.reconciliation_flag,
        })
    }
}

impl TryFrom<RiskEventRow> for RiskEvent {
    type Error = anyhow::Error;

    fn try_from(row: RiskEventRow) -> Result<Self> {
        let severity = match row.severity.as_str() {
            "WARN" => Severity::Warn,
            _ => Severity::Info,
        };
        Ok(RiskEvent {
            ts: parse_ts(&row.ts)?,
            event_type: row.event_type,
            severity,
            description: row.description,
        })
    }
}

impl TryFrom<BarRow> for Bar {
    type Error = anyhow::Error;

    fn try_from(row: BarRow) -> Result<Self> {
        Ok(Bar {
            timestamp: parse_ts(&row.ts)?,
            open: parse_dec(&row.open)?,
            high: parse_dec(&row.high)?,
            low: parse_dec(&row.low)?,
            close: parse_dec(&row.close)?,
            volume: parse_dec(&row.volume)?,
            symbol: row.symbol,
        })
    }
}

impl TryFrom<SignalRow> for Signal {
    type Error = anyhow::Error;

    fn try_from(row: SignalRow) -> Result<Self> {
        Ok(Signal {
            side: row.side.parse::<Side>()?,
            ts: parse_ts(&row.ts)?,
            symbol: row.symbol,
            sector: row.sector,
        })
    }
}

impl TryFrom<PositionRow> for PaperPosition {
    type Error = anyhow::Error;

    fn try_from(row: PositionRow) -> Result<Self> {
        Ok(PaperPosition {
            qty: parse_dec(&row.qty)?,
            avg_price: parse_dec(&row.avg_price)?,
            realized_pnl: parse_dec(&row.realized_pnl)?,
            updated_at: parse_ts(&row.updated_at)?,
            symbol: row.symbol,
            strategy_id: row.strategy_id,
        })
    }
}

fn convert_all<R, T>(rows: Vec<R>) -> Result<Vec<T>>
where
    T: TryFrom<R, Error = anyhow::Error>,
{
    rows.into_iter().map(T::try_from).collect()
}

impl Database {
    /// Create a new database connection and run migrations.
    pub async fn new(database_url: &str) -> Result<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect(database_url)
            .await
            .context("Failed to connect to database")?;

        let db = Self { pool };
        db.run_migrations().await?;

        Ok(db)
    }

    /// Private in-memory database. One connection that never expires, so the
    /// schema lives as long as the pool.
    pub async fn in_memory() -> Result<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect("sqlite::memory:")
            .await
            .context("Failed to open in-memory database")?;

        let db = Self { pool };
        db.run_migrations().await?;

        Ok(db)
    }

    /// Run all database migrations.
    async fn run_migrations(&self) -> Result<()> {
        let statements = [
            // Trade state, one row per (symbol, strategy)
            r#"
            CREATE TABLE IF NOT EXISTS trade_state (
                symbol TEXT NOT NULL,
                strategy_id TEXT NOT NULL,
                status TEXT NOT NULL,
                qty TEXT NOT NULL DEFAULT '0',
                entry_price TEXT,
                entry_ts TEXT,
                stop_price TEXT,
                tp1_price TEXT,
                tp2_price TEXT,
                trailing_price TEXT,
                initial_stop TEXT,
                closed_qty TEXT,
                exit_price TEXT,
                updated_at TEXT NOT NULL,
                PRIMARY KEY (symbol, strategy_id)
            )
            "#,
            // Lifecycle event log
            r#"
            CREATE TABLE IF NOT EXISTS position_lifecycle (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                symbol TEXT NOT NULL,
                strategy_id TEXT NOT NULL,
                lifecycle_state TEXT NOT NULL,
                ts TEXT NOT NULL,
                meta TEXT NOT NULL DEFAULT '{}'
            )
            "#,
            r#"
            CREATE INDEX IF NOT EXISTS idx_lifecycle_lookup
                ON position_lifecycle (symbol, strategy_id, lifecycle_state, ts)
            "#,
            // Exit engine audit log
            r#"
            CREATE TABLE IF NOT EXISTS trade_events (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                symbol TEXT NOT NULL,
                strategy_id TEXT NOT NULL,
                event_type TEXT NOT NULL,
                description TEXT NOT NULL,
                ts TEXT NOT NULL
            )
            "#,
            // Closed trades
            r#"
            CREATE TABLE IF NOT EXISTS trade_journal (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                symbol TEXT NOT NULL,
                strategy_id TEXT NOT NULL,
                entry_ts TEXT NOT NULL,
                exit_ts TEXT NOT NULL,
                entry_price TEXT NOT NULL,
                exit_price TEXT NOT NULL,
                qty TEXT NOT NULL,
                r TEXT NOT NULL,
                pnl_r TEXT NOT NULL,
                mae TEXT NOT NULL,
                mfe TEXT NOT NULL,
                UNIQUE (symbol, strategy_id, entry_ts, exit_ts)
            )
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS risk_state (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                ts TEXT NOT NULL,
                mode TEXT NOT NULL,
                reasons TEXT NOT NULL,
                dd_pct REAL NOT NULL,
                daily_pnl TEXT NOT NULL,
                weekly_pnl TEXT NOT NULL,
                correlation_flag INTEGER NOT NULL DEFAULT 0,
                reconciliation_flag INTEGER NOT NULL DEFAULT 0
            )
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS risk_events (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                ts TEXT NOT NULL,
                event_type TEXT NOT NULL,
                severity TEXT NOT NULL,
                description TEXT NOT NULL
            )
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS exposure_snapshots (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                ts TEXT NOT NULL,
                symbol TEXT NOT NULL,
                sector TEXT,
                strategy_id TEXT NOT NULL,
                gross_exposure TEXT NOT NULL,
                net_exposure TEXT NOT NULL,
                leverage TEXT
            )
            "#,
            r#"
            CREATE INDEX IF NOT EXISTS idx_exposure_ts ON exposure_snapshots (ts)
            "#,
            // Market data
            r#"
            CREATE TABLE IF NOT EXISTS ohlcv (
                symbol TEXT NOT NULL,
                ts TEXT NOT NULL,
                open TEXT NOT NULL,
                high TEXT NOT NULL,
                low TEXT NOT NULL,
                close TEXT NOT NULL,
                volume TEXT NOT NULL,
                PRIMARY KEY (symbol, ts)
            )
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS atr_cache (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                symbol TEXT NOT NULL,
                ts TEXT NOT NULL,
                atr TEXT NOT NULL
            )
            "#,
            // Account equity history
            r#"
            CREATE TABLE IF NOT EXISTS cash_balances (
                ts TEXT PRIMARY KEY,
                balance TEXT NOT NULL
            )
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS signals (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                symbol TEXT NOT NULL,
                side TEXT NOT NULL,
                ts TEXT NOT NULL,
                sector TEXT
            )
            "#,
            // Paper position book
            r#"
            CREATE TABLE IF NOT EXISTS positions (
                symbol TEXT NOT NULL,
                strategy_id TEXT NOT NULL,
                qty TEXT NOT NULL,
                avg_price TEXT NOT NULL,
                realized_pnl TEXT NOT NULL,
                updated_at TEXT NOT NULL,
                PRIMARY KEY (symbol, strategy_id)
            )
            "#,
        ];

        for statement in statements {
            sqlx::query(statement)
                .execute(&self.pool)
                .await
                .context("Failed to run migration")?;
        }

        Ok(())
    }
}

#[async_trait]
impl Store for Database {
    // ==================== Trade State ====================

    async fn get_trade_state(&self, symbol: &str, strategy_id: &str) -> Result<Option<TradeState>> {
        sqlx::query_as::<_, TradeStateRow>(
            "SELECT * FROM trade_state WHERE symbol = ? AND strategy_id = ?",
        )
        .bind(symbol)
        .bind(strategy_id)
        .fetch_optional(&self.pool)
        .await
        .context("Failed to fetch trade state")?
        .map(TradeState::try_from)
        .transpose()
    }

    async fn upsert_trade_state(&self, state: &TradeState) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO trade_state (
                symbol, strategy_id, status, qty, entry_price, entry_ts,
                stop_price, tp1_price, tp2_price, trailing_price,
                initial_stop, closed_qty, exit_price, updated_at
            )
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT (symbol, strategy_id) DO UPDATE SET
                status = excluded.status,
                qty = excluded.qty,
                entry_price = excluded.entry_price,
                entry_ts = excluded.entry_ts,
                stop_price = excluded.stop_price,
                tp1_price = excluded.tp1_price,
                tp2_price = excluded.tp2_price,
                trailing_price = excluded.trailing_price,
                initial_stop = excluded.initial_stop,
                closed_qty = excluded.closed_qty,
                exit_price = excluded.exit_price,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(&state.symbol)
        .bind(&state.strategy_id)
        .bind(state.status.as_str())
        .bind(state.qty.to_string())
        .bind(dec_text(state.entry_price))
        .bind(state.entry_ts.map(ts_text))
        .bind(dec_text(state.stop_price))
        .bind(dec_text(state.tp1_price))
        .bind(dec_text(state.tp2_price))
        .bind(dec_text(state.trailing_price))
        .bind(dec_text(state.initial_stop))
        .bind(dec_text(state.closed_qty))
        .bind(dec_text(state.exit_price))
        .bind(ts_text(state.updated_at))
        .execute(&self.pool)
        .await
        .context("Failed to upsert trade state")?;

        Ok(())
    }

    async fn list_trade_states(&self, statuses: &[TradeStatus]) -> Result<Vec<TradeState>> {
        if statuses.is_empty() {
            return Ok(Vec::new());
        }

        let placeholders = vec!["?"; statuses.len()].join(", ");
        let sql = format!(
            "SELECT * FROM trade_state WHERE status IN ({}) ORDER BY symbol, strategy_id",
            placeholders
        );
        let mut query = sqlx::query_as::<_, TradeStateRow>(&sql);
        for status in statuses {
            query = query.bind(status.as_str());
        }

        let rows = query
            .fetch_all(&self.pool)
            .await
            .context("Failed to list trade states")?;
        convert_all(rows)
    }

    // ==================== Lifecycle Events ====================

    async fn append_lifecycle_event(&self, event: &LifecycleEvent) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO position_lifecycle (symbol, strategy_id, lifecycle_state, ts, meta)
            VALUES (?, ?, ?, ?, ?)
            "#,
        )
        .bind(&event.symbol)
        .bind(&event.strategy_id)
        .bind(event.state.as_str())
        .bind(ts_text(event.ts))
        .bind(event.metadata.to_string())
        .execute(&self.pool)
        .await
        .context("Failed to append lifecycle event")?;

        Ok(())
    }

    async fn latest_lifecycle_event(
        &self,
        symbol: &str,
        strategy_id: &str,
        state: TradeStatus,
    ) -> Result<Option<LifecycleEvent>> {
        sqlx::query_as::<_, LifecycleRow>(
            r#"
            SELECT symbol, strategy_id, lifecycle_state, ts, meta
            FROM position_lifecycle
            WHERE symbol = ? AND strategy_id = ? AND lifecycle_state = ?
            ORDER BY ts DESC, id DESC
            LIMIT 1
            "#,
        )
        .bind(symbol)
        .bind(strategy_id)
        .bind(state.as_str())
        .fetch_optional(&self.pool)
        .await
        .context("Failed to fetch lifecycle event")?
        .map(LifecycleEvent::try_from)
        .transpose()
    }

    // ==================== Trade Events ====================

    async fn append_trade_event(&self, event: &TradeEvent) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO trade_events (symbol, strategy_id, event_type, description, ts)
            VALUES (?, ?, ?, ?, ?)
            "#,
        )
        .bind(&event.symbol)
        .bind(&event.strategy_id)
        .bind(&event.event_type)
        .bind(&event.description)
        .bind(ts_text(event.ts))
        .execute(&self.pool)
        .await
        .context("Failed to append trade event")?;

        Ok(())
    }

    async fn list_trade_events(&self, symbol: &str, strategy_id: &str) -> Result<Vec<TradeEvent>> {
        let rows = sqlx::query_as::<_, TradeEventRow>(
            r#"
            SELECT symbol, strategy_id, event_type, description, ts
            FROM trade_events
            WHERE symbol = ? AND strategy_id = ?
            ORDER BY id
            "#,
        )
        .bind(symbol)
        .bind(strategy_id)
        .fetch_all(&self.pool)
        .await
        .context("Failed to list trade events")?;
        convert_all(rows)
    }

    // ==================== Trade Journal ====================

    async fn journal_exists(&self, key: &JournalKey) -> Result<bool> {
        let (count,): (i64,) = sqlx::query_as(
            r#"
            SELECT COUNT(*) FROM trade_journal
            WHERE symbol = ? AND strategy_id = ? AND entry_ts = ? AND exit_ts = ?
            "#,
        )
        .bind(&key.symbol)
        .bind(&key.strategy_id)
        .bind(ts_text(key.entry_ts))
        .bind(ts_text(key.exit_ts))
        .fetch_one(&self.pool)
        .await
        .context("Failed to check journal")?;

        Ok(count > 0)
    }

    async fn append_journal_entry(&self, entry: &TradeJournalEntry) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO trade_journal (
                symbol, strategy_id, entry_ts, exit_ts,
                entry_price, exit_price, qty, r, pnl_r, mae, mfe
            )
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&entry.symbol)
        .bind(&entry.strategy_id)
        .bind(ts_text(entry.entry_ts))
        .bind(ts_text(entry.exit_ts))
        .bind(entry.entry_price.to_string())
        .bind(entry.exit_price.to_string())
        .bind(entry.qty.to_string())
        .bind(entry.r.to_string())
        .bind(entry.pnl_r.to_string())
        .bind(entry.mae.to_string())
        .bind(entry.mfe.to_string())
        .execute(&self.pool)
        .await
        .context("Failed to append journal entry")?;

        Ok(())
    }

    async fn list_journal(&self, strategy_id: Option<&str>) -> Result<Vec<TradeJournalEntry>> {
        let rows = sqlx::query_as::<_, JournalRow>(
            r#"
            SELECT symbol, strategy_id, entry_ts, exit_ts, entry_price, exit_price,
                   qty, r, pnl_r, mae, mfe
            FROM trade_journal
            WHERE ? IS NULL OR strategy_id = ?
            ORDER BY exit_ts, id
            "#,
        )
        .bind(strategy_id)
        .bind(strategy_id)
        .fetch_all(&self.pool)
        .await
        .context("Failed to list journal")?;
        convert_all(rows)
    }

    // ==================== Risk ====================

    async fn append_risk_state(&self, record: &RiskStateRecord) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO risk_state (
                ts, mode, reasons, dd_pct, daily_pnl, weekly_pnl,
                correlation_flag, reconciliation_flag
            )
            VALUES (?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(ts_text(record.ts))
        .bind(record.mode.as_str())
        .bind(serde_json::to_string(&record.reasons)?)
        .bind(record.drawdown_pct)
        .bind(record.daily_pnl.to_string())
        .bind(record.weekly_pnl.to_string())
        .bind(record.correlation_flag)
        .bind(record.reconciliation_flag)
        .execute(&self.pool)
        .await
        .context("Failed to append risk state")?;

        Ok(())
    }

    async fn latest_risk_state(&self) -> Result<Option<RiskStateRecord>> {
        sqlx::query_as::<_, RiskStateRow>(
            r#"
            SELECT ts, mode, reasons, dd_pct, daily_pnl, weekly_pnl,
                   correlation_flag, reconciliation_flag
            FROM risk_state
            ORDER BY ts DESC, id DESC
            LIMIT 1
            "#,
        )
        .fetch_optional(&self.pool)
        .await
        .context("Failed to fetch risk state")?
        .map(RiskStateRecord::try_from)
        .transpose()
    }

    async fn append_risk_event(&self, event: &RiskEvent) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO risk_events (ts, event_type, severity, description)
            VALUES (?, ?, ?, ?)
            "#,
        )
        .bind(ts_text(event.ts))
        .bind(&event.event_type)
        .bind(event.severity.as_str())
        .bind(&event.description)
        .execute(&self.pool)
        .await
        .context("Failed to append risk event")?;

        Ok(())
    }

    async fn recent_risk_events(&self, limit: usize) -> Result<Vec<RiskEvent>> {
        let rows = sqlx::query_as::<_, RiskEventRow>(
            r#"
            SELECT ts, event_type, severity, description
            FROM risk_events
            ORDER BY ts DESC, id DESC
            LIMIT ?
            "#,
        )
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await
        .context("Failed to fetch risk events")?;
        convert_all(rows)
    }

    // ==================== Exposure ====================

    async fn append_exposure_snapshot(&self, snapshot: &ExposureSnapshot) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO exposure_snapshots (
                ts, symbol, sector, strategy_id, gross_exposure, net_exposure, leverage
            )
            VALUES (?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(ts_text(snapshot.ts))
        .bind(&snapshot.symbol)
        .bind(&snapshot.sector)
        .bind(&snapshot.strategy_id)
        .bind(snapshot.gross_exposure.to_string())
        .bind(snapshot.net_exposure.to_string())
        .bind(dec_text(snapshot.leverage))
        .execute(&self.pool)
        .await
        .context("Failed to append exposure snapshot")?;

        Ok(())
    }

    async fn sector_net_exposure_since(
        &self,
        since: DateTime<Utc>,
    ) -> Result<BTreeMap<String, Decimal>> {
        let rows: Vec<(Option<String>, String)> = sqlx::query_as(
            r#"
            SELECT e.sector, e.net_exposure
            FROM exposure_snapshots e
            WHERE e.ts >= ?
              AND e.id = (
                SELECT i.id FROM exposure_snapshots i
                WHERE i.symbol = e.symbol AND i.strategy_id = e.strategy_id AND i.ts >= ?
                ORDER BY i.ts DESC, i.id DESC
                LIMIT 1
              )
            "#,
        )
        .bind(ts_text(since))
        .bind(ts_text(since))
        .fetch_all(&self.pool)
        .await
        .context("Failed to aggregate sector exposure")?;

        let mut by_sector = BTreeMap::new();
        for (sector, net) in rows {
            let sector = sector.unwrap_or_else(|| UNKNOWN_SECTOR.to_string());
            *by_sector.entry(sector).or_insert(Decimal::ZERO) += parse_dec(&net)?;
        }
        Ok(by_sector)
    }

    // ==================== Market Data ====================

    async fn insert_bars(&self, bars: &[Bar]) -> Result<usize> {
        let mut tx = self.pool.begin().await?;
        for bar in bars {
            sqlx::query(
                r#"
                INSERT INTO ohlcv (symbol, ts, open, high, low, close, volume)
                VALUES (?, ?, ?, ?, ?, ?, ?)
                ON CONFLICT (symbol, ts) DO UPDATE SET
                    open = excluded.open,
                    high = excluded.high,
                    low = excluded.low,
                    close = excluded.close,
                    volume = excluded.volume
                "#,
            )
            .bind(&bar.symbol)
            .bind(ts_text(bar.timestamp))
            .bind(bar.open.to_string())
            .bind(bar.high.to_string())
            .bind(bar.low.to_string())
            .bind(bar.close.to_string())
            .bind(bar.volume.to_string())
            .execute(&mut *tx)
            .await
            .context("Failed to insert bar")?;
        }
        tx.commit().await?;

        Ok(bars.len())
    }

    async fn latest_close(&self, symbol: &str) -> Result<Option<(DateTime<Utc>, Decimal)>> {
        let row: Option<(String, String)> = sqlx::query_as(
            "SELECT ts, close FROM ohlcv WHERE symbol = ? ORDER BY ts DESC LIMIT 1",
        )
        .bind(symbol)
        .fetch_optional(&self.pool)
        .await
        .context("Failed to fetch latest close")?;

        row.map(|(ts, close)| Ok((parse_ts(&ts)?, parse_dec(&close)?)))
            .transpose()
    }

    async fn close_path(
        &self,
        symbol: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<Decimal>> {
        let rows: Vec<(String,)> = sqlx::query_as(
            r#"
            SELECT close FROM ohlcv
            WHERE symbol = ? AND ts >= ? AND ts <= ?
            ORDER BY ts ASC
            "#,
        )
        .bind(symbol)
        .bind(ts_text(start))
        .bind(ts_text(end))
        .fetch_all(&self.pool)
        .await
        .context("Failed to fetch close path")?;

        rows.iter().map(|(close,)| parse_dec(close)).collect()
    }

    async fn recent_bars(&self, symbol: &str, limit: usize) -> Result<Vec<Bar>> {
        let rows = sqlx::query_as::<_, BarRow>(
            r#"
            SELECT symbol, ts, open, high, low, close, volume
            FROM ohlcv
            WHERE symbol = ?
            ORDER BY ts DESC
            LIMIT ?
            "#,
        )
        .bind(symbol)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await
        .context("Failed to fetch recent bars")?;

        let mut bars: Vec<Bar> = convert_all(rows)?;
        bars.reverse();
        Ok(bars)
    }

    async fn record_atr(&self, symbol: &str, ts: DateTime<Utc>, atr: Decimal) -> Result<()> {
        sqlx::query("INSERT INTO atr_cache (symbol, ts, atr) VALUES (?, ?, ?)")
            .bind(symbol)
            .bind(ts_text(ts))
            .bind(atr.to_string())
            .execute(&self.pool)
            .await
            .context("Failed to record ATR")?;

        Ok(())
    }

    async fn latest_atr(&self, symbol: &str) -> Result<Option<Decimal>> {
        let row: Option<(String,)> = sqlx::query_as(
            "SELECT atr FROM atr_cache WHERE symbol = ? ORDER BY ts DESC, id DESC LIMIT 1",
        )
        .bind(symbol)
        .fetch_optional(&self.pool)
        .await
        .context("Failed to fetch ATR")?;

        row.map(|(atr,)| parse_dec(&atr)).transpose()
    }

    // ==================== Balances ====================

    async fn record_balance(&self, point: &BalancePoint) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO cash_balances (ts, balance) VALUES (?, ?)
            ON CONFLICT (ts) DO UPDATE SET balance = excluded.balance
            "#,
        )
        .bind(ts_text(point.ts))
        .bind(point.balance.to_string())
        .execute(&self.pool)
        .await
        .context("Failed to record balance")?;

        Ok(())
    }

    async fn latest_balance(&self) -> Result<Option<BalancePoint>> {
        let row: Option<(String, String)> =
            sqlx::query_as("SELECT ts, balance FROM cash_balances ORDER BY ts DESC LIMIT 1")
                .fetch_optional(&self.pool)
                .await
                .context("Failed to fetch latest balance")?;

        row.map(|(ts, balance)| balance_point(&ts, &balance)).transpose()
    }

    async fn balance_at_or_before(&self, ts: DateTime<Utc>) -> Result<Option<BalancePoint>> {
        let row: Option<(String, String)> = sqlx::query_as(
            "SELECT ts, balance FROM cash_balances WHERE ts <= ? ORDER BY ts DESC LIMIT 1",
        )
        .bind(ts_text(ts))
        .fetch_optional(&self.pool)
        .await
        .context("Failed to fetch balance")?;

        row.map(|(ts, balance)| balance_point(&ts, &balance)).transpose()
    }

    async fn peak_balance(&self) -> Result<Option<Decimal>> {
        // TEXT ordering is not numeric, so the max is taken after parsing.
        Ok(self
            .balance_history()
            .await?
            .into_iter()
            .map(|p| p.balance)
            .max())
    }

    async fn balance_history(&self) -> Result<Vec<BalancePoint>> {
        let rows: Vec<(String, String)> =
            sqlx::query_as("SELECT ts, balance FROM cash_balances ORDER BY ts ASC")
                .fetch_all(&self.pool)
                .await
                .context("Failed to fetch balance history")?;

        rows.iter()
            .map(|(ts, balance)| balance_point(ts, balance))
            .collect()
    }

    // ==================== Signals ====================

    async fn record_signal(&self, signal: &Signal) -> Result<()> {
        sqlx::query("INSERT INTO signals (symbol, side, ts, sector) VALUES (?, ?, ?, ?)")
            .bind(&signal.symbol)
            .bind(signal.side.as_str())
            .bind(ts_text(signal.ts))
            .bind(&signal.sector)
            .execute(&self.pool)
            .await
            .context("Failed to record signal")?;

        Ok(())
    }

    async fn latest_signals(&self) -> Result<Vec<Signal>> {
        let rows = sqlx::query_as::<_, SignalRow>(
            r#"
            SELECT s.symbol, s.side, s.ts, s.sector
            FROM signals s
            WHERE s.id = (
                SELECT i.id FROM signals i
                WHERE i.symbol = s.symbol
                ORDER BY i.ts DESC, i.id DESC
                LIMIT 1
            )
            ORDER BY s.symbol
            "#,
        )
        .fetch_all(&self.pool)
        .await
        .context("Failed to fetch latest signals")?;
        convert_all(rows)
    }

    // ==================== Paper Positions ====================

    async fn get_paper_position(
        &self,
        symbol: &str,
        strategy_id: &str,
    ) -> Result<Option<PaperPosition>> {
        sqlx::query_as::<_, PositionRow>(
            "SELECT * FROM positions WHERE symbol = ? AND strategy_id = ?",
        )
        .bind(symbol)
        .bind(strategy_id)
        .fetch_optional(&self.pool)
        .await
        .context("Failed to fetch paper position")?
        .map(PaperPosition::try_from)
        .transpose()
    }

    async fn upsert_paper_position(&self, position: &PaperPosition) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO positions (symbol, strategy_id, qty, avg_price, realized_pnl, updated_at)
            VALUES (?, ?, ?, ?, ?, ?)
            ON CONFLICT (symbol, strategy_id) DO UPDATE SET
                qty = excluded.qty,
                avg_price = excluded.avg_price,
                realized_pnl = excluded.realized_pnl,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(&position.symbol)
        .bind(&position.strategy_id)
        .bind(position.qty.to_string())
        .bind(position.avg_price.to_string())
        .bind(position.realized_pnl.to_string())
        .bind(ts_text(position.updated_at))
        .execute(&self.pool)
        .await
        .context("Failed to upsert paper position")?;

        Ok(())
    }

    async fn list_paper_positions(&self) -> Result<Vec<PaperPosition>> {
        let rows = sqlx::query_as::<_, PositionRow>(
            "SELECT * FROM positions ORDER BY symbol, strategy_id",
        )
        .fetch_all(&self.pool)
        .await
        .context("Failed to list paper positions")?;
        convert_all(rows)
    }
}

fn balance_point(ts: &str, balance: &str) -> Result<BalancePoint> {
    Ok(BalancePoint {
        ts: parse_ts(ts)?,
        balance: parse_dec(balance)?,
    })
}
