//! Per-trade bookkeeping in R terms.
//!
//! One R is the distance between entry and the initial stop. All results are
//! exact decimals so journal rows are reproducible.

use rust_decimal::Decimal;

use crate::models::Side;

/// Price distance risked per unit. A stop on the wrong side risks nothing.
pub fn risk_per_unit(side: Side, entry: Decimal, stop: Decimal) -> Decimal {
    ((entry - stop) * side.sign()).max(Decimal::ZERO)
}

/// PnL per unit divided by risk per unit. Zero when there is no risk.
pub fn r_multiple(side: Side, entry: Decimal, stop: Decimal, exit: Decimal) -> Decimal {
    let risk = risk_per_unit(side, entry, stop);
    if risk <= Decimal::ZERO {
        return Decimal::ZERO;
    }
    (exit - entry) * side.sign() / risk
}

/// Realized PnL in account currency for `qty` units.
pub fn realized_pnl(side: Side, entry: Decimal, exit: Decimal, qty: Decimal) -> Decimal {
    (exit - entry) * side.sign() * qty.abs()
}

/// Maximum adverse and favorable excursion over a price path, in R.
///
/// MAE is clamped at or below zero and MFE at or above zero, so a path that
/// never moves against the trade has MAE 0.
pub fn mae_mfe_r(side: Side, entry: Decimal, stop: Decimal, path: &[Decimal]) -> (Decimal, Decimal) {
    let risk = risk_per_unit(side, entry, stop);
    if risk <= Decimal::ZERO {
        return (Decimal::ZERO, Decimal::ZERO);
    }

    path.iter()
        .map(|price| (*price - entry) * side.sign() / risk)
        .fold((Decimal::ZERO, Decimal::ZERO), |(mae, mfe), r| {
            (mae.min(r), mfe.max(r))
        })
}
