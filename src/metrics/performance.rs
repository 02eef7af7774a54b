//! Portfolio performance: Sharpe, drawdown, expectancy and the journal summary.

use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use serde::Serialize;
use statrs::statistics::Statistics;

use crate::models::{BalancePoint, TradeJournalEntry};

/// Annualized Sharpe ratio of periodic returns.
///
/// Uses the sample standard deviation. Returns 0 with fewer than two
/// observations or zero variance.
pub fn sharpe_ratio(returns: &[f64], risk_free_rate: f64, periods_per_year: u32) -> f64 {
    if returns.len() < 2 {
        return 0.0;
    }

    let mean = returns.iter().mean();
    let std_dev = returns.iter().std_dev();
    if !std_dev.is_finite() || std_dev <= 0.0 {
        return 0.0;
    }

    let ppy = f64::from(periods_per_year.max(1));
    let excess = mean - risk_free_rate / ppy;
    (excess / std_dev) * ppy.sqrt()
}

/// Largest proportional decline from a running peak.
pub fn max_drawdown(equity_curve: &[Decimal]) -> f64 {
    let Some(first) = equity_curve.first() else {
        return 0.0;
    };

    let mut peak = *first;
    let mut max_dd = 0.0f64;

    for value in equity_curve {
        if *value > peak {
            peak = *value;
        }
        if peak > Decimal::ZERO {
            let dd = ((peak - *value) / peak).to_f64().unwrap_or(0.0);
            max_dd = max_dd.max(dd);
        }
    }

    max_dd
}

/// Mean R per trade. Zero for no trades.
pub fn expectancy(r_values: &[Decimal]) -> Decimal {
    if r_values.is_empty() {
        return Decimal::ZERO;
    }
    r_values.iter().copied().sum::<Decimal>() / Decimal::from(r_values.len() as u64)
}

/// Aggregate performance over the journal and the balance history.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct PerformanceSummary {
    pub trades: usize,
    pub winning_trades: usize,
    pub losing_trades: usize,
    pub win_rate: f64,
    /// Mean R per trade
    pub expectancy: Decimal,
    pub total_pnl: Decimal,
    pub avg_mae: Decimal,
    pub avg_mfe: Decimal,
    /// Sharpe of period-over-period balance returns
    pub sharpe_ratio: f64,
    pub max_drawdown: f64,
}

/// Calculator for the desk performance summary.
pub struct PerformanceCalculator;

impl PerformanceCalculator {
    /// Summarize closed trades and the equity curve.
    pub fn summarize(
        journal: &[TradeJournalEntry],
        balances: &[BalancePoint],
        periods_per_year: u32,
    ) -> PerformanceSummary {
        let mut summary = PerformanceSummary::default();

        if !journal.is_empty() {
            Self::trade_metrics(&mut summary, journal);
        }

        if !balances.is_empty() {
            let curve: Vec<Decimal> = balances.iter().map(|b| b.balance).collect();
            summary.max_drawdown = max_drawdown(&curve);
            summary.sharpe_ratio = sharpe_ratio(&Self::period_returns(&curve), 0.0, periods_per_year);
        }

        summary
    }

    fn trade_metrics(summary: &mut PerformanceSummary, journal: &[TradeJournalEntry]) {
        let count = Decimal::from(journal.len() as u64);

        summary.trades = journal.len();
        summary.winning_trades = journal.iter().filter(|e| e.is_win()).count();
        summary.losing_trades = journal.iter().filter(|e| e.pnl_r < Decimal::ZERO).count();
        summary.win_rate = summary.winning_trades as f64 / journal.len() as f64;

        let rs: Vec<Decimal> = journal.iter().map(|e| e.r).collect();
        summary.expectancy = expectancy(&rs);
        summary.total_pnl = journal.iter().map(|e| e.pnl_r).sum();
        summary.avg_mae = journal.iter().map(|e| e.mae).sum::<Decimal>() / count;
        summary.avg_mfe = journal.iter().map(|e| e.mfe).sum::<Decimal>() / count;
    }

    /// Simple returns between consecutive positive balances.
    fn period_returns(curve: &[Decimal]) -> Vec<f64> {
        curve
            .windows(2)
            .filter(|w| w[0] > Decimal::ZERO)
            .filter_map(|w| ((w[1] - w[0]) / w[0]).to_f64())
            .collect()
    }
}
