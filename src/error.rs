//! Error kinds for invariant and input violations.
//!
//! Store and I/O failures travel as `anyhow::Error`; the variants here are
//! programmer or configuration errors that must fail at the call site.

use rust_decimal::Decimal;
use thiserror::Error;

/// Fatal input or invariant violation inside the control core.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DeskError {
    /// A side token other than BUY/SELL.
    #[error("invalid side: {0}")]
    InvalidSide(String),

    /// A sizing mode token other than FIXED_FRACTIONAL/ATR.
    #[error("invalid sizing mode: {0}")]
    InvalidSizingMode(String),

    /// A trade status token that is not part of the lifecycle.
    #[error("invalid trade status: {0}")]
    InvalidStatus(String),

    /// ATR or its multiple must be strictly positive.
    #[error("ATR and ATR multiple must be positive (atr={atr}, multiple={multiple})")]
    NonPositiveAtr { atr: Decimal, multiple: Decimal },

    /// An entry or transition would break a trade state invariant.
    #[error("invalid trade state for {symbol}/{strategy_id}: {reason}")]
    InvalidTradeState {
        symbol: String,
        strategy_id: String,
        reason: String,
    },

    /// A transition was requested on a trade that is not open.
    #[error("no active trade for {symbol}/{strategy_id}")]
    NoActiveTrade { symbol: String, strategy_id: String },
}
