//! Trading logic: risk gates, position sizing, exits and the trade lifecycle.

mod exit_engine;
mod exits;
mod lifecycle;
mod order_builder;
mod position_sizer;
mod risk_gate;

pub use exit_engine::{ExitEngine, ExitOutcome};
pub use exits::{compute_atr_levels, evaluate_exit_decision, update_trailing_stop};
pub use lifecycle::{LifecycleEngine, NewEntry, COOLDOWN_UNTIL};
pub use order_builder::build_order_intent;
pub use position_sizer::{PositionSizer, SizingMode};
pub use risk_gate::{drawdown_pct, GateInputs, RiskEngine};
