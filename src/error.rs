//! Typed failures surfaced by the market engine.
//!
//! Every variant is detected before any ledger or market mutation, so a
//! returned error always means "nothing changed".

use chrono::{DateTime, Utc};
use thiserror::Error;

use crate::market::MarketStatus;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum EngineError {
    #[error("insufficient funds: need {needed} micro-points, have {available}")]
    InsufficientFunds { needed: i64, available: i64 },

    #[error("insufficient shares: tried to release {requested}, holding {held}")]
    InsufficientShares { requested: f64, held: f64 },

    #[error("market {0} not found")]
    MarketNotFound(u64),

    #[error("market {id} is not tradable: {reason}")]
    MarketNotTradable { id: u64, reason: &'static str },

    #[error("invalid quantity: {0}")]
    InvalidQuantity(f64),

    #[error("market {id}: cannot {action} while {status}")]
    InvalidState {
        id: u64,
        action: &'static str,
        status: MarketStatus,
    },

    #[error("daily reward not ready, next claim at {0}")]
    DailyNotReady(DateTime<Utc>),
}

pub type Result<T> = std::result::Result<T, EngineError>;
