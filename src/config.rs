//! Desk configuration.
//!
//! Loaded once from flat environment keys (after `.env`) and passed by
//! reference into every engine constructor.

use std::str::FromStr;

use anyhow::{bail, Context, Result};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;

use crate::trading::SizingMode;

/// Longest accepted re-entry cooldown: one year.
pub const MAX_COOLDOWN_MINUTES: i64 = 60 * 24 * 365;

/// Account-level risk limits. Immutable for the lifetime of an engine.
#[derive(Debug, Clone, PartialEq)]
pub struct RiskLimits {
    /// Drawdown from peak equity that halts new risk (0.0 to 1.0)
    pub max_drawdown_pct: Decimal,

    /// Loss over the last day, as a fraction of equity, that halts new risk
    pub daily_loss_limit_pct: Decimal,

    /// Loss over the last week, as a fraction of equity, that halts new risk
    pub weekly_loss_limit_pct: Decimal,

    /// Annualized volatility target for size scaling
    pub vol_target: Option<Decimal>,

    /// Maximum |net exposure| per sector as a fraction of equity
    pub sector_cap_pct: Option<Decimal>,

    pub sizing_mode: SizingMode,

    /// Fraction of equity risked per trade
    pub fixed_fractional: Decimal,

    /// ATR multiple defining per-unit risk under ATR sizing
    pub atr_multiplier: Decimal,
}

impl Default for RiskLimits {
    fn default() -> Self {
        Self {
            max_drawdown_pct: dec!(0.2),       // Halt at 20% drawdown
            daily_loss_limit_pct: dec!(0.05),  // 5% daily loss
            weekly_loss_limit_pct: dec!(0.10), // 10% weekly loss
            vol_target: None,
            sector_cap_pct: None,
            sizing_mode: SizingMode::FixedFractional,
            fixed_fractional: dec!(0.01), // Risk 1% per trade
            atr_multiplier: dec!(2.0),
        }
    }
}

/// Full desk configuration.
#[derive(Debug, Clone, PartialEq)]
pub struct DeskConfig {
    pub risk: RiskLimits,

    /// Minutes a (symbol, strategy) stays blocked after an exit
    pub cooldown_minutes: i64,

    /// ATR multiple for the hard stop when levels are computed
    pub exit_atr_multiple: Decimal,

    /// ATR stand-in as a fraction of price when no ATR is cached
    pub exit_atr_fallback_pct: Decimal,

    /// Bars used for ATR smoothing
    pub atr_period: usize,

    /// Closes used for the annualized volatility estimate
    pub vol_lookback: usize,

    pub periods_per_year: u32,

    /// Strategy id used for entries raised by the cycle
    pub strategy_id: String,

    /// Apply emitted intents to the local paper book
    pub paper_trading: bool,

    pub cycle_interval_secs: u64,

    pub database_url: String,

    pub log_level: String,
}

impl Default for DeskConfig {
    fn default() -> Self {
        Self {
            risk: RiskLimits::default(),
            cooldown_minutes: 5,
            exit_atr_multiple: dec!(2.0),
            exit_atr_fallback_pct: dec!(0.01), // 1% of price
            atr_period: 14,
            vol_lookback: 60,
            periods_per_year: 252,
            strategy_id: "baseline".to_string(),
            paper_trading: true,
            cycle_interval_secs: 60,
            database_url: "sqlite:./deskcore.db?mode=rwc".to_string(),
            log_level: "info".to_string(),
        }
    }
}

impl DeskConfig {
    /// Read configuration from the process environment.
    pub fn from_env() -> Result<Self> {
        Self::from_vars(|key| std::env::var(key).ok())
    }

    /// Build configuration from a key lookup. Missing keys keep defaults.
    pub fn from_vars<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        if let Some(v) = get("RISK_MAX_DRAWDOWN_PCT") {
            config.risk.max_drawdown_pct = parse_key("RISK_MAX_DRAWDOWN_PCT", &v)?;
        }
        if let Some(v) = get("RISK_DAILY_LOSS_PCT") {
            config.risk.daily_loss_limit_pct = parse_key("RISK_DAILY_LOSS_PCT", &v)?;
        }
        if let Some(v) = get("RISK_WEEKLY_LOSS_PCT") {
            config.risk.weekly_loss_limit_pct = parse_key("RISK_WEEKLY_LOSS_PCT", &v)?;
        }
        if let Some(v) = get("RISK_VOL_TARGET") {
            config.risk.vol_target = optional_positive(parse_key("RISK_VOL_TARGET", &v)?);
        }
        if let Some(v) = get("RISK_SECTOR_CAP_PCT") {
            config.risk.sector_cap_pct = optional_positive(parse_key("RISK_SECTOR_CAP_PCT", &v)?);
        }
        if let Some(v) = get("RISK_POSITION_SIZING_MODE") {
            config.risk.sizing_mode = v
                .parse::<SizingMode>()
                .context("RISK_POSITION_SIZING_MODE")?;
        }
        if let Some(v) = get("RISK_FIXED_FRACTIONAL") {
            config.risk.fixed_fractional = parse_key("RISK_FIXED_FRACTIONAL", &v)?;
        }
        if let Some(v) = get("RISK_ATR_MULTIPLIER") {
            config.risk.atr_multiplier = parse_key("RISK_ATR_MULTIPLIER", &v)?;
        }

        if let Some(v) = get("LIFECYCLE_COOLDOWN_MINUTES") {
            config.cooldown_minutes = parse_key("LIFECYCLE_COOLDOWN_MINUTES", &v)?;
        }
        if let Some(v) = get("EXIT_ATR_MULTIPLE") {
            config.exit_atr_multiple = parse_key("EXIT_ATR_MULTIPLE", &v)?;
        }
        if let Some(v) = get("EXIT_ATR_FALLBACK_PCT") {
            config.exit_atr_fallback_pct = parse_key("EXIT_ATR_FALLBACK_PCT", &v)?;
        }
        if let Some(v) = get("ATR_PERIOD") {
            config.atr_period = parse_key("ATR_PERIOD", &v)?;
        }
        if let Some(v) = get("VOL_LOOKBACK") {
            config.vol_lookback = parse_key("VOL_LOOKBACK", &v)?;
        }
        if let Some(v) = get("PERIODS_PER_YEAR") {
            config.periods_per_year = parse_key("PERIODS_PER_YEAR", &v)?;
        }
        if let Some(v) = get("STRATEGY_ID") {
            config.strategy_id = v.trim().to_string();
        }
        if let Some(v) = get("PAPER_TRADING") {
            config.paper_trading = parse_bool("PAPER_TRADING", &v)?;
        }
        if let Some(v) = get("CYCLE_INTERVAL_SECS") {
            config.cycle_interval_secs = parse_key("CYCLE_INTERVAL_SECS", &v)?;
        }
        if let Some(v) = get("DATABASE_URL") {
            config.database_url = v;
        }
        if let Some(v) = get("LOG_LEVEL") {
            config.log_level = v;
        }

        config.validate()?;
        Ok(config)
    }

    /// Apply CLI argument overrides.
    pub fn apply_cli_overrides(
        &mut self,
        database_url: Option<String>,
        log_level: Option<String>,
        interval_secs: Option<u64>,
    ) {
        if let Some(url) = database_url {
            self.database_url = url;
        }
        if let Some(level) = log_level {
            self.log_level = level;
        }
        if let Some(secs) = interval_secs {
            self.cycle_interval_secs = secs;
        }
    }

    /// Validate configuration and return errors for invalid values.
    pub fn validate(&self) -> Result<()> {
        let fractions = [
            ("RISK_MAX_DRAWDOWN_PCT", Some(self.risk.max_drawdown_pct)),
            ("RISK_DAILY_LOSS_PCT", Some(self.risk.daily_loss_limit_pct)),
            ("RISK_WEEKLY_LOSS_PCT", Some(self.risk.weekly_loss_limit_pct)),
            ("RISK_SECTOR_CAP_PCT", self.risk.sector_cap_pct),
            ("RISK_FIXED_FRACTIONAL", Some(self.risk.fixed_fractional)),
            ("EXIT_ATR_FALLBACK_PCT", Some(self.exit_atr_fallback_pct)),
        ];
        for (key, value) in fractions {
            if let Some(v) = value {
                if v <= Decimal::ZERO || v > Decimal::ONE {
                    bail!("{} must be in (0, 1], got {}", key, v);
                }
            }
        }

        if let Some(v) = self.risk.vol_target {
            if v <= Decimal::ZERO {
                bail!("RISK_VOL_TARGET must be positive, got {}", v);
            }
        }
        if self.risk.atr_multiplier <= Decimal::ZERO {
            bail!("RISK_ATR_MULTIPLIER must be positive");
        }
        if self.exit_atr_multiple <= Decimal::ZERO {
            bail!("EXIT_ATR_MULTIPLE must be positive");
        }
        if !(0..=MAX_COOLDOWN_MINUTES).contains(&self.cooldown_minutes) {
            bail!(
                "LIFECYCLE_COOLDOWN_MINUTES must be in [0, {}], got {}",
                MAX_COOLDOWN_MINUTES,
                self.cooldown_minutes
            );
        }
        if self.atr_period == 0 {
            bail!("ATR_PERIOD must be at least 1");
        }
        if self.vol_lookback < 2 {
            bail!("VOL_LOOKBACK must be at least 2");
        }
        if self.periods_per_year == 0 {
            bail!("PERIODS_PER_YEAR must be at least 1");
        }
        if self.cycle_interval_secs == 0 {
            bail!("CYCLE_INTERVAL_SECS must be at least 1");
        }
        if self.strategy_id.is_empty() {
            bail!("STRATEGY_ID cannot be empty");
        }
        Ok(())
    }
}

fn parse_key<T>(key: &str, value: &str) -> Result<T>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    value
        .trim()
        .parse::<T>()
        .map_err(|e| anyhow::anyhow!("{}: cannot parse {:?}: {}", key, value, e))
}

fn parse_bool(key: &str, value: &str) -> Result<bool> {
    match value.trim().to_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        other => bail!("{}: expected a boolean, got {:?}", key, other),
    }
}

/// Zero disables an optional limit.
fn optional_positive(value: Decimal) -> Option<Decimal> {
    if value.is_zero() {
        None
    } else {
        Some(value)
    }
}
