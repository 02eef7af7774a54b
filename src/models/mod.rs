//! Data models for trades, exits, risk state, market data and the journal.

mod exit;
mod journal;
mod market;
mod order;
mod position;
mod risk;
mod side;
mod trade_state;

pub use exit::{ExitAction, ExitDecision, ExitLevels};
pub use journal::{JournalKey, LifecycleEvent, TradeEvent, TradeJournalEntry};
pub use market::{BalancePoint, Bar, Signal};
pub use order::OrderIntent;
pub use position::PaperPosition;
pub use risk::{ExposureSnapshot, RiskEvent, RiskGateResult, RiskMode, RiskStateRecord, Severity};
pub use side::Side;
pub use trade_state::{TradeState, TradeStatus};
