//! Per-market state: outstanding shares, lifecycle status, price history.
//!
//! The quantities here change only through the trade path in `engine` or the
//! payout/refund path during resolution; callers hold the market's lock.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{EngineError, Result};
use crate::lmsr::{self, Side};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MarketStatus {
    /// Created by a user, waiting for admin approval.
    Proposed,
    /// Open for trading until `close_at`.
    Active,
    /// Past close; betting disabled, waiting for resolution.
    Closed,
    /// Terminal: outcome set, winners paid.
    Resolved,
    /// Terminal: rejected proposal or safety-net cancellation.
    Cancelled,
}

impl fmt::Display for MarketStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            MarketStatus::Proposed => "proposed",
            MarketStatus::Active => "active",
            MarketStatus::Closed => "closed",
            MarketStatus::Resolved => "resolved",
            MarketStatus::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct PricePoint {
    pub at: DateTime<Utc>,
    pub p_yes: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Market {
    pub id: u64,
    pub question: String,
    pub creator: u64,
    pub q_yes: f64,
    pub q_no: f64,
    /// Liquidity parameter, fixed at creation.
    pub b: f64,
    pub status: MarketStatus,
    pub close_at: DateTime<Utc>,
    pub resolved_outcome: Option<Side>,
    pub created_at: DateTime<Utc>,
    pub closed_at: Option<DateTime<Utc>>,
    pub resolved_at: Option<DateTime<Utc>>,
    /// One-way fee sink, in ledger units.
    pub fees_collected: i64,
    /// Append-only; samples are taken after every trade.
    pub price_history: Vec<PricePoint>,
}

impl Market {
    pub fn new(
        id: u64,
        creator: u64,
        question: String,
        close_at: DateTime<Utc>,
        b: f64,
        now: DateTime<Utc>,
    ) -> Self {
        assert!(b.is_finite() && b > 0.0, "b must be positive and finite");
        Market {
            id,
            question,
            creator,
            q_yes: 0.0,
            q_no: 0.0,
            b,
            status: MarketStatus::Proposed,
            close_at,
            resolved_outcome: None,
            created_at: now,
            closed_at: None,
            resolved_at: None,
            fees_collected: 0,
            // a fresh book prices both sides at even money
            price_history: vec![PricePoint { at: now, p_yes: 0.5 }],
        }
    }

    pub fn p_yes(&self) -> f64 {
        lmsr::prob_yes(self.q_yes, self.q_no, self.b)
    }

    /// Trades are admitted only while Active and strictly before close.
    pub fn ensure_tradable(&self, now: DateTime<Utc>) -> Result<()> {
        if self.status != MarketStatus::Active {
            return Err(EngineError::MarketNotTradable {
                id: self.id,
                reason: "market is not active",
            });
        }
        if now >= self.close_at {
            return Err(EngineError::MarketNotTradable {
                id: self.id,
                reason: "market is past its close time",
            });
        }
        Ok(())
    }

    pub fn record_price(&mut self, now: DateTime<Utc>) {
        let p_yes = self.p_yes();
        self.price_history.push(PricePoint { at: now, p_yes });
    }

    fn expect_status(&self, wanted: MarketStatus, action: &'static str) -> Result<()> {
        if self.status != wanted {
            return Err(EngineError::InvalidState {
                id: self.id,
                action,
                status: self.status,
            });
        }
        Ok(())
    }

    /// Proposed -> Active (admin approval).
    pub fn approve(&mut self) -> Result<()> {
        self.expect_status(MarketStatus::Proposed, "approve")?;
        self.status = MarketStatus::Active;
        Ok(())
    }

    /// Proposed -> Cancelled (admin rejection; no trades have happened yet).
    pub fn reject(&mut self) -> Result<()> {
        self.expect_status(MarketStatus::Proposed, "reject")?;
        self.status = MarketStatus::Cancelled;
        Ok(())
    }

    /// Active -> Closed once the clock reaches `close_at`.
    pub fn close(&mut self, now: DateTime<Utc>) -> Result<()> {
        self.expect_status(MarketStatus::Active, "close")?;
        self.status = MarketStatus::Closed;
        self.closed_at = Some(now);
        Ok(())
    }

    /// Closed -> Resolved. Returns false (a no-op) when already resolved, so
    /// repeated resolution can never corrupt balances.
    pub fn mark_resolved(&mut self, outcome: Side, now: DateTime<Utc>) -> Result<bool> {
        if self.status == MarketStatus::Resolved {
            return Ok(false);
        }
        self.expect_status(MarketStatus::Closed, "resolve")?;
        self.status = MarketStatus::Resolved;
        self.resolved_outcome = Some(outcome);
        self.resolved_at = Some(now);
        Ok(true)
    }

    /// Closed -> Cancelled (safety net: resolution never arrived).
    pub fn cancel(&mut self, now: DateTime<Utc>) -> Result<()> {
        self.expect_status(MarketStatus::Closed, "cancel")?;
        self.status = MarketStatus::Cancelled;
        self.resolved_at = Some(now);
        Ok(())
    }
}
