//! Persisted lifecycle state for one (symbol, strategy) pair.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use super::{ExitLevels, Side};
use crate::error::DeskError;

/// Lifecycle stage of a trade.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum TradeStatus {
    Flat,
    Entered,
    Managed,
    Exited,
}

impl TradeStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TradeStatus::Flat => "FLAT",
            TradeStatus::Entered => "ENTERED",
            TradeStatus::Managed => "MANAGED",
            TradeStatus::Exited => "EXITED",
        }
    }

    /// ENTERED or MANAGED: a position is open and exits are evaluated.
    pub fn is_active(&self) -> bool {
        matches!(self, TradeStatus::Entered | TradeStatus::Managed)
    }
}

impl fmt::Display for TradeStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TradeStatus {
    type Err = DeskError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_uppercase().as_str() {
            "FLAT" => Ok(TradeStatus::Flat),
            "ENTERED" => Ok(TradeStatus::Entered),
            "MANAGED" => Ok(TradeStatus::Managed),
            "EXITED" => Ok(TradeStatus::Exited),
            other => Err(DeskError::InvalidStatus(other.to_string())),
        }
    }
}

/// One row of trade state.
///
/// `qty` is signed: positive is long, negative is short. After an exit the
/// live fields are cleared but `initial_stop`, `closed_qty` and `exit_price`
/// keep what the journal needs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TradeState {
    pub symbol: String,
    pub strategy_id: String,
    pub status: TradeStatus,
    pub qty: Decimal,
    pub entry_price: Option<Decimal>,
    pub entry_ts: Option<DateTime<Utc>>,
    pub stop_price: Option<Decimal>,
    pub tp1_price: Option<Decimal>,
    pub tp2_price: Option<Decimal>,
    pub trailing_price: Option<Decimal>,
    /// Stop at entry time; defines 1R for the journal.
    pub initial_stop: Option<Decimal>,
    /// Absolute quantity closed by the final exit.
    pub closed_qty: Option<Decimal>,
    pub exit_price: Option<Decimal>,
    /// Time of the last transition. For EXITED rows this is the exit time.
    pub updated_at: DateTime<Utc>,
}

impl TradeState {
    /// A fresh FLAT row.
    pub fn flat(symbol: &str, strategy_id: &str, updated_at: DateTime<Utc>) -> Self {
        Self {
            symbol: symbol.to_string(),
            strategy_id: strategy_id.to_string(),
            status: TradeStatus::Flat,
            qty: Decimal::ZERO,
            entry_price: None,
            entry_ts: None,
            stop_price: None,
            tp1_price: None,
            tp2_price: None,
            trailing_price: None,
            initial_stop: None,
            closed_qty: None,
            exit_price: None,
            updated_at,
        }
    }

    /// Current levels, if all three are set.
    pub fn levels(&self) -> Option<ExitLevels> {
        Some(ExitLevels {
            stop: self.stop_price?,
            tp1: self.tp1_price?,
            tp2: self.tp2_price?,
            trailing_stop: self.trailing_price,
        })
    }

    pub fn set_levels(&mut self, levels: Option<&ExitLevels>) {
        self.stop_price = levels.map(|l| l.stop);
        self.tp1_price = levels.map(|l| l.tp1);
        self.tp2_price = levels.map(|l| l.tp2);
        self.trailing_price = levels.and_then(|l| l.trailing_stop);
    }

    /// Side of the open position, falling back to the stop placement once
    /// the quantity has been zeroed.
    pub fn side(&self) -> Option<Side> {
        Side::from_signed_qty(self.qty).or_else(|| {
            let entry = self.entry_price?;
            let stop = self.initial_stop.or(self.stop_price)?;
            Some(if entry >= stop { Side::Buy } else { Side::Sell })
        })
    }

    /// Check the per-status invariants.
    pub fn validate(&self) -> Result<(), DeskError> {
        let fail = |reason: &str| {
            Err(DeskError::InvalidTradeState {
                symbol: self.symbol.clone(),
                strategy_id: self.strategy_id.clone(),
                reason: reason.to_string(),
            })
        };
        let has_levels = self.stop_price.is_some()
            || self.tp1_price.is_some()
            || self.tp2_price.is_some()
            || self.trailing_price.is_some();

        match self.status {
            TradeStatus::Flat => {
                if !self.qty.is_zero() {
                    return fail("FLAT requires qty = 0");
                }
                if has_levels || self.entry_price.is_some() || self.entry_ts.is_some() {
                    return fail("FLAT requires entry and level fields to be empty");
                }
            }
            TradeStatus::Entered | TradeStatus::Managed => {
                if self.qty.is_zero() {
                    return fail("open trade requires qty != 0");
                }
                let Some(entry) = self.entry_price else {
                    return fail("open trade requires entry_price");
                };
                if entry <= Decimal::ZERO {
                    return fail("entry_price must be positive");
                }
                if self.entry_ts.is_none() {
                    return fail("open trade requires entry_ts");
                }
                let (Some(levels), Some(side)) = (self.levels(), Side::from_signed_qty(self.qty))
                else {
                    return fail("open trade requires stop, tp1 and tp2");
                };
                if !levels.is_ordered(side, entry) {
                    return fail("levels are not ordered for the trade side");
                }
            }
            TradeStatus::Exited => {
                if !self.qty.is_zero() {
                    return fail("EXITED requires qty = 0");
                }
                if has_levels {
                    return fail("EXITED requires level fields to be cleared");
                }
                if self.entry_price.is_none() || self.entry_ts.is_none() {
                    return fail("EXITED keeps entry_price and entry_ts for the journal");
                }
            }
        }
        Ok(())
    }
}
