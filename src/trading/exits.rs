//! Stop and take-profit levels from ATR, trailing stop ratchet, exit decisions.

use rust_decimal::Decimal;

use crate::error::DeskError;
use crate::models::{ExitAction, ExitDecision, ExitLevels, Side};

/// Levels at 1R and 2R where R = `atr * atr_multiple_stop`.
pub fn compute_atr_levels(
    side: Side,
    entry_price: Decimal,
    atr: Decimal,
    atr_multiple_stop: Decimal,
) -> Result<ExitLevels, DeskError> {
    if atr <= Decimal::ZERO || atr_multiple_stop <= Decimal::ZERO {
        return Err(DeskError::NonPositiveAtr {
            atr,
            multiple: atr_multiple_stop,
        });
    }

    let r = atr * atr_multiple_stop * side.sign();
    Ok(ExitLevels {
        stop: entry_price - r,
        tp1: entry_price + r,
        tp2: entry_price + r * Decimal::TWO,
        trailing_stop: None,
    })
}

/// Ratchet a trailing stop one R behind price.
///
/// A long keeps the higher of the candidate and the existing stop, a short
/// the lower. Non-positive risk leaves the existing value untouched.
pub fn update_trailing_stop(
    side: Side,
    current_price: Decimal,
    risk_per_unit: Decimal,
    existing: Option<Decimal>,
) -> Option<Decimal> {
    if risk_per_unit <= Decimal::ZERO {
        return existing;
    }

    let candidate = current_price - risk_per_unit * side.sign();
    Some(match (side, existing) {
        (_, None) => candidate,
        (Side::Buy, Some(prev)) => prev.max(candidate),
        (Side::Sell, Some(prev)) => prev.min(candidate),
    })
}

/// Decide the exit action for the current price.
///
/// Precedence: STOP, TRAIL_STOP, TP2_FULL, TP1_PARTIAL. TP1 fires only once.
pub fn evaluate_exit_decision(
    side: Side,
    levels: &ExitLevels,
    current_price: Decimal,
    tp1_already_taken: bool,
) -> ExitDecision {
    // "at or beyond" in the adverse / favorable direction for the side
    let adverse = |level: Decimal| match side {
        Side::Buy => current_price <= level,
        Side::Sell => current_price >= level,
    };
    let favorable = |level: Decimal| match side {
        Side::Buy => current_price >= level,
        Side::Sell => current_price <= level,
    };

    if adverse(levels.stop) {
        return ExitDecision {
            action: ExitAction::Stop,
            reason: "HARD_STOP_ATR",
        };
    }
    if levels.trailing_stop.is_some_and(adverse) {
        return ExitDecision {
            action: ExitAction::TrailStop,
            reason: match side {
                Side::Buy => "TRAILING_STOP_LONG",
                Side::Sell => "TRAILING_STOP_SHORT",
            },
        };
    }
    if favorable(levels.tp2) {
        return ExitDecision {
            action: ExitAction::Tp2Full,
            reason: match side {
                Side::Buy => "TAKE_PROFIT_2R_LONG",
                Side::Sell => "TAKE_PROFIT_2R_SHORT",
            },
        };
    }
    if !tp1_already_taken && favorable(levels.tp1) {
        return ExitDecision {
            action: ExitAction::Tp1Partial,
            reason: match side {
                Side::Buy => "TAKE_PROFIT_1R_LONG",
                Side::Sell => "TAKE_PROFIT_1R_SHORT",
            },
        };
    }

    ExitDecision::none()
}
