//! Position sizing: fixed fractional or ATR risk budget, then vol targeting.

use std::fmt;
use std::str::FromStr;

use rust_decimal::Decimal;
use tracing::warn;

use crate::config::RiskLimits;
use crate::error::DeskError;

/// Position sizing method.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SizingMode {
    /// Fixed percentage of equity over price
    FixedFractional,
    /// Fixed percentage of equity over ATR-based per-unit risk
    Atr,
}

impl SizingMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            SizingMode::FixedFractional => "FIXED_FRACTIONAL",
            SizingMode::Atr => "ATR",
        }
    }
}

impl fmt::Display for SizingMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SizingMode {
    type Err = DeskError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_uppercase().as_str() {
            "FIXED_FRACTIONAL" => Ok(Self::FixedFractional),
            "ATR" => Ok(Self::Atr),
            other => Err(DeskError::InvalidSizingMode(other.to_string())),
        }
    }
}

/// Calculator for recommended position sizes in whole units.
#[derive(Debug, Clone)]
pub struct PositionSizer {
    limits: RiskLimits,
}

impl PositionSizer {
    /// Create a new position sizer with the given limits.
    pub fn new(limits: RiskLimits) -> Self {
        Self { limits }
    }

    /// Recommended size before vol targeting.
    ///
    /// ATR mode returns 0 when no positive ATR is known.
    pub fn compute_position_size(
        &self,
        price: Decimal,
        equity: Decimal,
        atr: Option<Decimal>,
    ) -> Decimal {
        if price <= Decimal::ZERO || equity <= Decimal::ZERO {
            return Decimal::ZERO;
        }

        match self.limits.sizing_mode {
            SizingMode::FixedFractional => self.fixed_fractional_size(price, equity),
            SizingMode::Atr => self.atr_size(equity, atr),
        }
    }

    /// size = floor(equity * fraction / price)
    fn fixed_fractional_size(&self, price: Decimal, equity: Decimal) -> Decimal {
        let risk_budget = equity * self.limits.fixed_fractional;
        whole_units(risk_budget.checked_div(price))
    }

    /// size = floor(equity * fraction / (atr * multiplier))
    fn atr_size(&self, equity: Decimal, atr: Option<Decimal>) -> Decimal {
        let Some(atr) = atr.filter(|a| *a > Decimal::ZERO) else {
            return Decimal::ZERO;
        };

        let per_unit_risk = atr * self.limits.atr_multiplier;
        if per_unit_risk <= Decimal::ZERO {
            return Decimal::ZERO;
        }

        let risk_budget = equity * self.limits.fixed_fractional;
        whole_units(risk_budget.checked_div(per_unit_risk))
    }

    /// Scale a base size by `vol_target / asset_annual_vol`.
    ///
    /// Without a target or a positive asset vol the base size is returned.
    pub fn apply_vol_targeting(&self, base_size: Decimal, asset_annual_vol: Option<f64>) -> Decimal {
        if base_size <= Decimal::ZERO {
            return Decimal::ZERO;
        }

        let Some(target) = self.limits.vol_target else {
            return base_size;
        };
        let Some(asset_vol) = asset_annual_vol
            .filter(|v| v.is_finite() && *v > 0.0)
            .and_then(|v| Decimal::try_from(v).ok())
            .filter(|v| *v > Decimal::ZERO)
        else {
            return base_size;
        };

        whole_units(
            base_size
                .checked_mul(target)
                .and_then(|scaled| scaled.checked_div(asset_vol)),
        )
    }
}

/// Floor to whole units. An overflowed size sizes to zero.
fn whole_units(size: Option<Decimal>) -> Decimal {
    match size {
        Some(size) => size.floor().max(Decimal::ZERO),
        None => {
            warn!("Position size overflowed, sizing to zero");
            Decimal::ZERO
        }
    }
}
