//! Exit levels and the decision produced when price is checked against them.

use std::fmt;

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use super::Side;

/// Stop and take-profit levels attached to an open trade.
///
/// For a long: `stop < entry < tp1 < tp2` and `trailing_stop >= stop`.
/// A short mirrors every inequality.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExitLevels {
    pub stop: Decimal,
    pub tp1: Decimal,
    pub tp2: Decimal,
    pub trailing_stop: Option<Decimal>,
}

impl ExitLevels {
    /// Check the level ordering for a trade entered at `entry` on `side`.
    pub fn is_ordered(&self, side: Side, entry: Decimal) -> bool {
        let levels_ok = match side {
            Side::Buy => self.stop < entry && entry < self.tp1 && self.tp1 < self.tp2,
            Side::Sell => self.stop > entry && entry > self.tp1 && self.tp1 > self.tp2,
        };
        let trailing_ok = match (side, self.trailing_stop) {
            (_, None) => true,
            (Side::Buy, Some(t)) => t >= self.stop,
            (Side::Sell, Some(t)) => t <= self.stop,
        };
        levels_ok && trailing_ok
    }

    /// Replace the trailing stop, never letting it sit beyond the hard stop.
    pub fn with_trailing(mut self, side: Side, trailing: Option<Decimal>) -> Self {
        self.trailing_stop = trailing.map(|t| match side {
            Side::Buy => t.max(self.stop),
            Side::Sell => t.min(self.stop),
        });
        self
    }
}

/// Exit action triggered by the current price.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ExitAction {
    None,
    Stop,
    Tp1Partial,
    Tp2Full,
    TrailStop,
}

impl ExitAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExitAction::None => "NONE",
            ExitAction::Stop => "STOP",
            ExitAction::Tp1Partial => "TP1_PARTIAL",
            ExitAction::Tp2Full => "TP2_FULL",
            ExitAction::TrailStop => "TRAIL_STOP",
        }
    }

    /// Whether the action closes the whole position.
    pub fn is_full_exit(&self) -> bool {
        matches!(
            self,
            ExitAction::Stop | ExitAction::Tp2Full | ExitAction::TrailStop
        )
    }
}

impl fmt::Display for ExitAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Result of one exit evaluation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExitDecision {
    pub action: ExitAction,
    pub reason: &'static str,
}

impl ExitDecision {
    pub fn none() -> Self {
        Self {
            action: ExitAction::None,
            reason: "NO_EXIT_TRIGGERED",
        }
    }
}
