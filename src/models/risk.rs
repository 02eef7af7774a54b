//! Risk gate outcome, exposure snapshots and the persisted risk audit rows.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// Operating mode decided by the risk gates.
///
/// Ordered by severity so escalation is a `max`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum RiskMode {
    Normal,
    Degraded,
    Halt,
}

impl RiskMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            RiskMode::Normal => "NORMAL",
            RiskMode::Degraded => "DEGRADED",
            RiskMode::Halt => "HALT",
        }
    }
}

impl fmt::Display for RiskMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RiskMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_uppercase().as_str() {
            "NORMAL" => Ok(RiskMode::Normal),
            "DEGRADED" => Ok(RiskMode::Degraded),
            "HALT" => Ok(RiskMode::Halt),
            other => Err(format!("invalid risk mode: {}", other)),
        }
    }
}

/// Mode plus the reasons that produced it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RiskGateResult {
    pub mode: RiskMode,
    pub reasons: Vec<String>,
}

impl RiskGateResult {
    /// New positions may only be opened in NORMAL mode.
    pub fn allow_new_risk(&self) -> bool {
        self.mode == RiskMode::Normal
    }

    /// DEGRADED and HALT only allow reducing exposure.
    pub fn reduce_only(&self) -> bool {
        matches!(self.mode, RiskMode::Degraded | RiskMode::Halt)
    }
}

/// Point-in-time exposure of one position. Append-only.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExposureSnapshot {
    pub ts: DateTime<Utc>,
    pub symbol: String,
    pub sector: Option<String>,
    pub strategy_id: String,
    /// |qty * price|
    pub gross_exposure: Decimal,
    /// qty * price
    pub net_exposure: Decimal,
    /// gross / equity, when equity is known and positive.
    pub leverage: Option<Decimal>,
}

/// One evaluated gate result with the inputs that fed it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RiskStateRecord {
    pub ts: DateTime<Utc>,
    pub mode: RiskMode,
    pub reasons: Vec<String>,
    pub drawdown_pct: f64,
    pub daily_pnl: Decimal,
    pub weekly_pnl: Decimal,
    pub correlation_flag: bool,
    pub reconciliation_flag: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Severity {
    Info,
    Warn,
}

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::Info => "INFO",
            Severity::Warn => "WARN",
        }
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Audit record for risk decisions.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RiskEvent {
    pub ts: DateTime<Utc>,
    pub event_type: String,
    pub severity: Severity,
    pub description: String,
}
