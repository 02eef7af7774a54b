//! Portfolio control core for an automated trading desk.
//!
//! Decides whether new risk may be taken, how large positions are, when
//! they exit, and records every closed trade in R terms:
//! - Risk gates over drawdown, daily/weekly loss, reconciliation, correlation and sector caps
//! - Fixed-fractional and ATR position sizing with volatility targeting
//! - ATR exit levels, trailing stops and exit decisions
//! - A persisted trade lifecycle with cooldown and an idempotent trade journal
//! - A cycle runner tying it together against a SQLite store

pub mod config;
pub mod cycle;
pub mod db;
pub mod error;
pub mod ingest;
pub mod metrics;
pub mod models;
pub mod trading;

pub use config::{DeskConfig, RiskLimits};
pub use cycle::{CycleInputs, CycleReport, CycleRunner};
pub use error::DeskError;
