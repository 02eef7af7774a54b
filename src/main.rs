//! deskctl: run and inspect the desk control core.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand};
use rust_decimal::Decimal;
use tracing::info;
use tracing_subscriber::EnvFilter;

use deskcore::cycle::{CycleInputs, CycleReport, CycleRunner};
use deskcore::db::{Database, Store};
use deskcore::ingest::{ingest_bars, load_bars_csv};
use deskcore::metrics::PerformanceCalculator;
use deskcore::models::{BalancePoint, Side, Signal, TradeStatus};
use deskcore::DeskConfig;

/// Trading desk control core CLI.
#[derive(Parser)]
#[command(name = "deskctl")]
#[command(about = "Risk gates, trade lifecycle and journal for a trading desk", long_about = None)]
struct Cli {
    /// Database URL
    #[arg(short, long, env = "DATABASE_URL")]
    database_url: Option<String>,

    /// Log filter (trace, debug, info, warn, error or an EnvFilter directive)
    #[arg(short, long, env = "LOG_LEVEL")]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a single cycle and print what it did
    Cycle {
        /// Treat the book as over-correlated
        #[arg(long)]
        correlation_flag: bool,

        /// Positions disagree with the broker
        #[arg(long)]
        reconciliation_flag: bool,
    },

    /// Run cycles periodically until Ctrl-C
    Run {
        /// Seconds between cycles
        #[arg(short, long)]
        interval: Option<u64>,
    },

    /// Show open trades, risk state and the paper book
    Status,

    /// Load OHLCV bars from CSV and refresh the ATR cache
    Ingest {
        /// CSV with header timestamp,symbol,open,high,low,close,volume
        path: PathBuf,
    },

    /// Record an account balance
    Balance {
        amount: Decimal,

        /// Timestamp (RFC 3339), defaults to now
        #[arg(long)]
        ts: Option<DateTime<Utc>>,
    },

    /// Record a directional signal
    Signal {
        symbol: String,

        /// BUY or SELL
        side: Side,

        #[arg(long)]
        sector: Option<String>,
    },

    /// Show the trade journal and performance summary
    Report {
        /// Only this strategy
        #[arg(short, long)]
        strategy: Option<String>,
    },

    /// Show the effective configuration
    Config,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    let interval = match &cli.command {
        Commands::Run { interval } => *interval,
        _ => None,
    };
    let mut config = DeskConfig::from_env()?;
    config.apply_cli_overrides(cli.database_url, cli.log_level, interval);
    config.validate()?;

    // Setup logging
    let filter = EnvFilter::try_new(&config.log_level).unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    match cli.command {
        Commands::Cycle {
            correlation_flag,
            reconciliation_flag,
        } => {
            let store = open_store(&config).await?;
            let runner = CycleRunner::new(config, store);
            let inputs = CycleInputs {
                now: Utc::now(),
                correlation_flag,
                reconciliation_flag,
            };
            let report = runner.run_cycle(&inputs).await?;
            print_report(&report);
        }

        Commands::Run { .. } => {
            println!("\n=== Desk Cycle Loop ===");
            println!("Strategy:  {}", config.strategy_id);
            println!("Interval:  {}s", config.cycle_interval_secs);
            println!(
                "Mode:      {}",
                if config.paper_trading { "PAPER" } else { "INTENTS ONLY" }
            );
            println!("\nPress Ctrl+C to stop.\n");

            let store = open_store(&config).await?;
            let runner = CycleRunner::new(config, store);
            runner.run().await?;
        }

        Commands::Status => {
            let store = open_store(&config).await?;
            show_status(store.as_ref()).await?;
        }

        Commands::Ingest { path } => {
            let bars = load_bars_csv(&path)?;
            let store = open_store(&config).await?;
            let report = ingest_bars(store.as_ref(), &bars, config.atr_period).await?;
            println!(
                "Ingested {} bars for {} symbols ({} ATR updates)",
                report.bars, report.symbols, report.atr_updates
            );
        }

        Commands::Balance { amount, ts } => {
            let store = open_store(&config).await?;
            let point = BalancePoint {
                ts: ts.unwrap_or_else(Utc::now),
                balance: amount,
            };
            store.record_balance(&point).await?;
            info!(balance = %point.balance, ts = %point.ts, "Balance recorded");
            println!("Balance {} recorded at {}", point.balance, point.ts);
        }

        Commands::Signal {
            symbol,
            side,
            sector,
        } => {
            let store = open_store(&config).await?;
            let signal = Signal {
                symbol: symbol.to_uppercase(),
                side,
                ts: Utc::now(),
                sector,
            };
            store.record_signal(&signal).await?;
            println!("Signal {} {} recorded", signal.side, signal.symbol);
        }

        Commands::Report { strategy } => {
            let store = open_store(&config).await?;
            let journal = store.list_journal(strategy.as_deref()).await?;
            let balances = store.balance_history().await?;
            let summary = PerformanceCalculator::summarize(&journal, &balances, config.periods_per_year);

            println!(
                "\n{:<10} {:<12} {:<20} {:>10} {:>10} {:>8} {:>10} {:>7} {:>7}",
                "SYMBOL", "STRATEGY", "EXIT", "ENTRY", "EXIT PX", "R", "PNL", "MAE", "MFE"
            );
            println!("{}", "-".repeat(104));
            for e in &journal {
                println!(
                    "{:<10} {:<12} {:<20} {:>10} {:>10} {:>8.2} {:>10.2} {:>7.2} {:>7.2}",
                    truncate(&e.symbol, 10),
                    truncate(&e.strategy_id, 12),
                    e.exit_ts.format("%Y-%m-%d %H:%M"),
                    e.entry_price,
                    e.exit_price,
                    e.r,
                    e.pnl_r,
                    e.mae,
                    e.mfe
                );
            }

            println!("\n=== Performance ===");
            println!("Trades:         {}", summary.trades);
            println!("Win Rate:       {:.1}%", summary.win_rate * 100.0);
            println!("Winning/Losing: {}/{}", summary.winning_trades, summary.losing_trades);
            println!("Expectancy:     {:.2}R", summary.expectancy);
            println!("Total P&L:      {:.2}", summary.total_pnl);
            println!("Avg MAE/MFE:    {:.2}R / {:.2}R", summary.avg_mae, summary.avg_mfe);
            println!("Sharpe Ratio:   {:.2}", summary.sharpe_ratio);
            println!("Max Drawdown:   {:.1}%", summary.max_drawdown * 100.0);
        }

        Commands::Config => print_config(&config),
    }

    Ok(())
}

async fn open_store(config: &DeskConfig) -> Result<Arc<dyn Store>> {
    let db = Database::new(&config.database_url).await?;
    Ok(Arc::new(db))
}

async fn show_status(store: &dyn Store) -> Result<()> {
    println!("\n=== Risk ===");
    match store.latest_risk_state().await? {
        Some(risk) => {
            println!("Mode:         {}", risk.mode);
            println!("Reasons:      {}", risk.reasons.join(", "));
            println!("Drawdown:     {:.2}%", risk.drawdown_pct * 100.0);
            println!("Daily P&L:    {:.2}", risk.daily_pnl);
            println!("Weekly P&L:   {:.2}", risk.weekly_pnl);
            println!("Evaluated at: {}", risk.ts.format("%Y-%m-%d %H:%M:%S UTC"));
        }
        None => println!("No cycle has run yet. Use 'deskctl cycle' to run one."),
    }
    if let Some(balance) = store.latest_balance().await? {
        println!("Equity:       {:.2}", balance.balance);
    }

    let open = store
        .list_trade_states(&[TradeStatus::Entered, TradeStatus::Managed])
        .await?;
    println!("\n--- Open Trades ({}) ---", open.len());
    if !open.is_empty() {
        println!(
            "{:<10} {:<12} {:<8} {:>10} {:>10} {:>10} {:>10} {:>10}",
            "SYMBOL", "STRATEGY", "STATUS", "QTY", "ENTRY", "STOP", "TP2", "TRAIL"
        );
        for t in &open {
            let fmt = |v: Option<Decimal>| v.map_or_else(|| "-".to_string(), |d| d.to_string());
            println!(
                "{:<10} {:<12} {:<8} {:>10} {:>10} {:>10} {:>10} {:>10}",
                truncate(&t.symbol, 10),
                truncate(&t.strategy_id, 12),
                t.status.as_str(),
                t.qty,
                fmt(t.entry_price),
                fmt(t.stop_price),
                fmt(t.tp2_price),
                fmt(t.trailing_price)
            );
        }
    }

    let positions = store.list_paper_positions().await?;
    println!("\n--- Paper Positions ({}) ---", positions.len());
    for p in positions.iter().filter(|p| !p.is_flat()) {
        println!(
            "  {} [{}] {} @ {:.4} (realized: {:.2})",
            p.symbol, p.strategy_id, p.qty, p.avg_price, p.realized_pnl
        );
    }

    let events = store.recent_risk_events(5).await?;
    if !events.is_empty() {
        println!("\n--- Recent Risk Events ---");
        for e in events {
            println!(
                "  {} [{}] {}: {}",
                e.ts.format("%m-%d %H:%M"),
                e.severity,
                e.event_type,
                truncate(&e.description, 60)
            );
        }
    }

    Ok(())
}

fn print_report(report: &CycleReport) {
    println!("\n=== Cycle {} ===", report.cycle_id);
    println!("Mode:       {}", report.gate.mode);
    println!("Reasons:    {}", report.gate.reasons.join(", "));
    println!("Equity:     {:.2}", report.equity.equity);
    println!("Journaled:  {}", report.journaled.len());
    println!("Snapshots:  {}", report.snapshots);

    println!("\n--- Intents ---");
    if report.exit_intents.is_empty() && report.entry_intents.is_empty() {
        println!("  (none)");
    }
    for intent in report.intents() {
        println!(
            "  {:<4} {:<10} {:>10} @ {:<10} {}",
            intent.side.as_str(),
            truncate(&intent.symbol, 10),
            intent.qty,
            intent.price,
            intent.reason
        );
    }

    if !report.skipped.is_empty() {
        println!("\n--- Skipped ---");
        for (symbol, reason) in &report.skipped {
            println!("  {:<10} {}", symbol, reason.as_str());
        }
    }
}

fn print_config(config: &DeskConfig) {
    let risk = &config.risk;
    let pct = |d: Decimal| d * Decimal::ONE_HUNDRED;

    println!("\n=== Risk Limits ===\n");
    println!("  Max Drawdown:         {}%", pct(risk.max_drawdown_pct));
    println!("  Daily Loss Limit:     {}%", pct(risk.daily_loss_limit_pct));
    println!("  Weekly Loss Limit:    {}%", pct(risk.weekly_loss_limit_pct));
    println!(
        "  Vol Target:           {}",
        risk.vol_target.map_or_else(|| "none".to_string(), |v| v.to_string())
    );
    println!(
        "  Sector Cap:           {}",
        risk.sector_cap_pct.map_or_else(|| "none".to_string(), |v| format!("{}%", pct(v)))
    );

    println!("\nPosition Sizing:");
    println!("  Mode:                 {}", risk.sizing_mode);
    println!("  Fixed Fractional:     {}%", pct(risk.fixed_fractional));
    println!("  ATR Multiplier:       {}", risk.atr_multiplier);

    println!("\nExits & Lifecycle:");
    println!("  Exit ATR Multiple:    {}", config.exit_atr_multiple);
    println!("  ATR Fallback:         {}% of price", pct(config.exit_atr_fallback_pct));
    println!("  ATR Period:           {}", config.atr_period);
    println!("  Cooldown:             {}m", config.cooldown_minutes);

    println!("\nCycle:");
    println!("  Strategy:             {}", config.strategy_id);
    println!("  Paper Trading:        {}", config.paper_trading);
    println!("  Interval:             {}s", config.cycle_interval_secs);
    println!("  Vol Lookback:         {} closes", config.vol_lookback);
    println!("  Periods / Year:       {}", config.periods_per_year);
    println!("  Database:             {}", config.database_url);
}

fn truncate(s: &str, max_len: usize) -> String {
    if s.chars().count() <= max_len {
        s.to_string()
    } else {
        format!("{}...", s.chars().take(max_len.saturating_sub(3)).collect::<String>())
    }
}
