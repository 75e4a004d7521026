//! LMSR market-maker core for binary YES/NO prediction markets.
//!
//! The engine quotes prices from the logarithmic market scoring rule, tracks
//! user balances and positions in a fixed-point ledger, runs each market
//! through an explicit lifecycle, and reconciles stale markets from a
//! background scheduler. The chat frontend talks to it through the JSON
//! surface in [`api`].

pub mod api;
pub mod config;
pub mod engine;
pub mod error;
pub mod ledger;
pub mod lmsr;
pub mod market;
pub mod scheduler;
pub mod snapshot;

pub use config::EngineConfig;
pub use engine::{Engine, PortfolioEntry, Resolution, TradeReceipt};
pub use error::{EngineError, Result};
pub use lmsr::{Direction, Side};
pub use market::{Market, MarketStatus};
pub use scheduler::ResolutionScheduler;
pub use snapshot::{EngineSnapshot, JsonFileStore};
