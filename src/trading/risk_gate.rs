//! Account-level risk gates and exposure snapshots.
//!
//! Evaluation is deterministic and free of I/O. Severity only escalates
//! within one evaluation: a HALT is never downgraded by a later check.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use tracing::debug;

use crate::config::RiskLimits;
use crate::models::{ExposureSnapshot, RiskGateResult, RiskMode};

/// Account state fed to the gates.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct GateInputs {
    pub equity: Decimal,
    pub peak_equity: Decimal,
    pub daily_pnl: Decimal,
    pub weekly_pnl: Decimal,
    /// Net exposure per sector as a fraction of equity
    pub sector_exposure_pct: Option<BTreeMap<String, Decimal>>,
    pub correlation_flag: bool,
    pub reconciliation_flag: bool,
}

/// Evaluates risk gates against fixed limits.
#[derive(Debug, Clone)]
pub struct RiskEngine {
    limits: RiskLimits,
}

impl RiskEngine {
    pub fn new(limits: RiskLimits) -> Self {
        Self { limits }
    }

    /// Evaluate every gate and return the operating mode with its reasons.
    pub fn evaluate_gates(&self, inputs: &GateInputs) -> RiskGateResult {
        let mut mode = RiskMode::Normal;
        let mut reasons = Vec::new();
        let limits = &self.limits;

        if inputs.peak_equity > Decimal::ZERO {
            let dd = drawdown_pct(inputs.equity, inputs.peak_equity);
            if dd >= limits.max_drawdown_pct {
                mode = RiskMode::Halt;
                reasons.push(format!(
                    "MAX_DRAWDOWN_BREACHED dd={:.4} limit={:.4}",
                    dd, limits.max_drawdown_pct
                ));
            }
        }

        let daily_limit = -limits.daily_loss_limit_pct * inputs.equity;
        if inputs.daily_pnl <= daily_limit {
            mode = RiskMode::Halt;
            reasons.push(format!(
                "DAILY_LOSS_LIMIT_BREACHED pnl={:.2} limit={:.2}",
                inputs.daily_pnl, daily_limit
            ));
        }

        let weekly_limit = -limits.weekly_loss_limit_pct * inputs.equity;
        if inputs.weekly_pnl <= weekly_limit {
            mode = RiskMode::Halt;
            reasons.push(format!(
                "WEEKLY_LOSS_LIMIT_BREACHED pnl={:.2} limit={:.2}",
                inputs.weekly_pnl, weekly_limit
            ));
        }

        if inputs.reconciliation_flag {
            mode = RiskMode::Halt;
            reasons.push("RECONCILIATION_FLAG_ACTIVE".to_string());
        }

        if inputs.correlation_flag && mode != RiskMode::Halt {
            mode = mode.max(RiskMode::Degraded);
            reasons.push("CORRELATION_FLAG_ACTIVE".to_string());
        }

        if let (Some(exposures), Some(cap)) = (&inputs.sector_exposure_pct, limits.sector_cap_pct) {
            for (sector, pct) in exposures {
                if pct.abs() > cap {
                    mode = mode.max(RiskMode::Degraded);
                    reasons.push(format!(
                        "SECTOR_CAP_BREACHED sector={} exp_pct={:.4} limit={:.4}",
                        sector, pct, cap
                    ));
                }
            }
        }

        if reasons.is_empty() {
            reasons.push("RISK_OK".to_string());
        }

        debug!(mode = %mode, reasons = ?reasons, "Risk gates evaluated");
        RiskGateResult { mode, reasons }
    }

    /// Exposure of one position. Leverage is set only for positive equity.
    #[allow(clippy::too_many_arguments)]
    pub fn build_exposure_snapshot(
        &self,
        symbol: &str,
        sector: Option<&str>,
        strategy_id: &str,
        qty: Decimal,
        price: Decimal,
        equity: Option<Decimal>,
        ts: DateTime<Utc>,
    ) -> ExposureSnapshot {
        let net_exposure = qty * price;
        let gross_exposure = net_exposure.abs();
        let leverage = equity
            .filter(|e| *e > Decimal::ZERO)
            .map(|e| gross_exposure / e);

        ExposureSnapshot {
            ts,
            symbol: symbol.to_string(),
            sector: sector.map(str::to_string),
            strategy_id: strategy_id.to_string(),
            gross_exposure,
            net_exposure,
            leverage,
        }
    }
}

/// (peak - equity) / peak, or 0 without a positive peak.
pub fn drawdown_pct(equity: Decimal, peak_equity: Decimal) -> Decimal {
    if peak_equity <= Decimal::ZERO {
        return Decimal::ZERO;
    }
    (peak_equity - equity) / peak_equity
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use rust_decimal_macros::dec;

    fn healthy() -> GateInputs {
        GateInputs {
            equity: dec!(10000),
            peak_equity: dec!(10000),
            ..Default::default()
        }
    }

    #[test]
    fn test_normal_when_healthy() {
        let engine = RiskEngine::new(RiskLimits::default());
        let result = engine.evaluate_gates(&healthy());
        assert_eq!(result.mode, RiskMode::Normal);
        assert_eq!(result.reasons, vec!["RISK_OK".to_string()]);
        assert!(result.allow_new_risk());
    }

    #[test]
    fn test_drawdown_halts() {
        let engine = RiskEngine::new(RiskLimits::default());
        let result = engine.evaluate_gates(&GateInputs {
            equity: dec!(7500),
            peak_equity: dec!(10000),
            ..Default::default()
        });
        assert_eq!(result.mode, RiskMode::Halt);
        assert!(result.reasons.iter().any(|r| r.contains("MAX_DRAWDOWN")));
        assert!(result.reduce_only());
    }

    #[test]
    fn test_loss_limits_halt() {
        let engine = RiskEngine::new(RiskLimits::default());

        let daily = engine.evaluate_gates(&GateInputs {
            daily_pnl: dec!(-500),
            ..healthy()
        });
        assert_eq!(daily.mode, RiskMode::Halt);
        assert!(daily.reasons[0].starts_with("DAILY_LOSS_LIMIT_BREACHED"));

        let weekly = engine.evaluate_gates(&GateInputs {
            daily_pnl: dec!(-100),
            weekly_pnl: dec!(-1000),
            ..healthy()
        });
        assert_eq!(weekly.mode, RiskMode::Halt);
        assert_eq!(weekly.reasons.len(), 1);
        assert!(weekly.reasons[0].starts_with("WEEKLY_LOSS_LIMIT_BREACHED"));
    }

    #[test]
    fn test_correlation_never_downgrades_halt() {
        let engine = RiskEngine::new(RiskLimits::default());

        let degraded = engine.evaluate_gates(&GateInputs {
            correlation_flag: true,
            ..healthy()
        });
        assert_eq!(degraded.mode, RiskMode::Degraded);
        assert_eq!(degraded.reasons, vec!["CORRELATION_FLAG_ACTIVE".to_string()]);

        let halted = engine.evaluate_gates(&GateInputs {
            correlation_flag: true,
            reconciliation_flag: true,
            ..healthy()
        });
        assert_eq!(halted.mode, RiskMode::Halt);
        assert_eq!(halted.reasons, vec!["RECONCILIATION_FLAG_ACTIVE".to_string()]);
    }

    #[test]
    fn test_sector_caps_sorted() {
        let engine = RiskEngine::new(RiskLimits {
            sector_cap_pct: Some(dec!(0.25)),
            ..Default::default()
        });

        let mut exposures = BTreeMap::new();
        exposures.insert("tech".to_string(), dec!(0.4));
        exposures.insert("energy".to_string(), dec!(-0.3));
        exposures.insert("utilities".to_string(), dec!(0.1));

        let result = engine.evaluate_gates(&GateInputs {
            sector_exposure_pct: Some(exposures),
            ..healthy()
        });
        assert_eq!(result.mode, RiskMode::Degraded);
        assert_eq!(result.reasons.len(), 2);
        assert!(result.reasons[0].starts_with("SECTOR_CAP_BREACHED sector=energy"));
        assert!(result.reasons[1].starts_with("SECTOR_CAP_BREACHED sector=tech"));
    }

    #[test]
    fn test_sector_caps_ignored_without_limit() {
        let engine = RiskEngine::new(RiskLimits::default());
        let mut exposures = BTreeMap::new();
        exposures.insert("tech".to_string(), dec!(0.9));

        let result = engine.evaluate_gates(&GateInputs {
            sector_exposure_pct: Some(exposures),
            ..healthy()
        });
        assert_eq!(result.mode, RiskMode::Normal);
    }

    #[test]
    fn test_exposure_snapshot() {
        let engine = RiskEngine::new(RiskLimits::default());
        let ts = Utc.with_ymd_and_hms(2024, 3, 1, 0, 0, 0).unwrap();

        let short = engine.build_exposure_snapshot(
            "XOM", Some("energy"), "baseline", dec!(-10), dec!(50), Some(dec!(1000)), ts,
        );
        assert_eq!(short.gross_exposure, dec!(500));
        assert_eq!(short.net_exposure, dec!(-500));
        assert_eq!(short.leverage, Some(dec!(0.5)));

        let no_equity =
            engine.build_exposure_snapshot("XOM", None, "baseline", dec!(10), dec!(50), Some(dec!(0)), ts);
        assert_eq!(no_equity.leverage, None);
    }
}
