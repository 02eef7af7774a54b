//! Trade and portfolio metrics: R-multiples, excursions, performance and indicators.

mod calculator;
mod indicators;
mod performance;

pub use calculator::{mae_mfe_r, r_multiple, realized_pnl, risk_per_unit};
pub use indicators::{annualized_volatility, average_true_range};
pub use performance::{
    expectancy, max_drawdown, sharpe_ratio, PerformanceCalculator, PerformanceSummary,
};
