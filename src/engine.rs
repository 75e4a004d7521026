//! The market engine: trade settlement, lifecycle operations, portfolio reads.
//!
//! One mutex per market guards `(q_yes, q_no, status, price_history)`; the
//! ledger adds one mutex per user. A trade takes the market lock first and the
//! user lock second, and every path that touches both follows that order, so
//! two simultaneous trades on one market are quoted strictly one after the
//! other and can never both see the same pre-trade price.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::{Mutex, RwLock};
use tracing::info;

use crate::config::EngineConfig;
use crate::error::{EngineError, Result};
use crate::ledger::{Ledger, SHARE_EPS};
use crate::lmsr::{self, Direction, Quote, Side};
use crate::market::{Market, MarketStatus, PricePoint};
use crate::snapshot::EngineSnapshot;

pub struct Engine {
    cfg: EngineConfig,
    ledger: Ledger,
    markets: RwLock<HashMap<u64, Arc<Mutex<Market>>>>,
    next_id: AtomicU64,
}

/// What a settled trade did, in ledger units.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct TradeReceipt {
    pub market_id: u64,
    pub side: Side,
    pub direction: Direction,
    pub shares: f64,
    /// Debited from the trader on a buy, credited on a sell.
    pub amount: i64,
    pub fee: i64,
    pub new_q_yes: f64,
    pub new_q_no: f64,
    pub new_p_yes: f64,
}

/// Outcome of a resolve or cancel pass over a market.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct Resolution {
    pub market_id: u64,
    pub outcome: Option<Side>,
    /// False when the market was already resolved and nothing moved.
    pub applied: bool,
    pub accounts: usize,
    pub total: i64,
}

#[derive(Debug, Clone, Serialize)]
pub struct PortfolioEntry {
    pub market_id: u64,
    pub question: String,
    pub side: Side,
    pub shares: f64,
    pub cost_basis: i64,
    /// Net proceeds of selling the whole holding at the current book.
    pub current_value: i64,
}

impl Engine {
    pub fn new(cfg: EngineConfig) -> Self {
        let ledger = Ledger::new(
            cfg.starting_balance_units(),
            cfg.daily_reward_units(),
            cfg.daily_cooldown(),
        );
        Engine {
            cfg,
            ledger,
            markets: RwLock::new(HashMap::new()),
            next_id: AtomicU64::new(1),
        }
    }

    /// Rebuild an engine from the last committed snapshot.
    pub fn from_snapshot(cfg: EngineConfig, snap: EngineSnapshot) -> Self {
        let mut engine = Engine::new(cfg);
        engine.next_id = AtomicU64::new(snap.next_id);
        let map = engine.markets.get_mut();
        for market in snap.markets {
            map.insert(market.id, Arc::new(Mutex::new(market)));
        }
        engine.ledger.import(snap.accounts);
        engine
    }

    pub fn config(&self) -> &EngineConfig {
        &self.cfg
    }

    async fn market_handle(&self, id: u64) -> Result<Arc<Mutex<Market>>> {
        self.markets
            .read()
            .await
            .get(&id)
            .cloned()
            .ok_or(EngineError::MarketNotFound(id))
    }

    // ---- lifecycle ----

    /// Create a market in `Proposed`, charging the proposal cost up front.
    pub async fn propose_market(
        &self,
        creator: u64,
        question: String,
        close_at: DateTime<Utc>,
        liquidity: Option<f64>,
    ) -> Result<Market> {
        let b = liquidity.unwrap_or(self.cfg.default_liquidity);
        if !b.is_finite() || b <= 0.0 {
            return Err(EngineError::InvalidQuantity(b));
        }
        let cost = self.cfg.proposal_cost_units();
        if cost > 0 {
            self.ledger.debit(creator, cost).await?;
        }

        let now = Utc::now();
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let market = Market::new(id, creator, question, close_at, b, now);
        self.markets
            .write()
            .await
            .insert(id, Arc::new(Mutex::new(market.clone())));
        info!(id, creator, b, %close_at, "market proposed");
        Ok(market)
    }

    /// Admin approval: Proposed -> Active.
    pub async fn approve(&self, id: u64) -> Result<Market> {
        let handle = self.market_handle(id).await?;
        let mut market = handle.lock().await;
        market.approve()?;
        info!(id, "market approved");
        Ok(market.clone())
    }

    /// Admin rejection: Proposed -> Cancelled, proposal cost returned.
    pub async fn reject(&self, id: u64) -> Result<Market> {
        let handle = self.market_handle(id).await?;
        let mut market = handle.lock().await;
        market.reject()?;
        let cost = self.cfg.proposal_cost_units();
        if cost > 0 {
            self.ledger.credit(market.creator, cost).await;
        }
        info!(id, "market rejected");
        Ok(market.clone())
    }

    /// Active -> Closed once `close_at` has passed. Taken under the market
    /// lock, so a close can never land in the middle of a trade.
    pub async fn close_market(&self, id: u64, now: DateTime<Utc>) -> Result<()> {
        let handle = self.market_handle(id).await?;
        let mut market = handle.lock().await;
        market.close(now)?;
        info!(id, "market closed for trading");
        Ok(())
    }

    // ---- trading ----

    /// Read-only price preview; identical math to `execute_trade`, zero
    /// mutation.
    pub async fn quote_trade(
        &self,
        id: u64,
        side: Side,
        direction: Direction,
        shares: f64,
    ) -> Result<Quote> {
        let handle = self.market_handle(id).await?;
        let market = handle.lock().await;
        market.ensure_tradable(Utc::now())?;
        lmsr::quote(
            market.q_yes,
            market.q_no,
            market.b,
            side,
            direction,
            shares,
            self.cfg.fee_rate,
        )
    }

    /// Settle one trade atomically: quote against the current book, move the
    /// money and the position, then shift the outstanding quantities and
    /// append a price sample, all inside the market's critical section.
    pub async fn execute_trade(
        &self,
        user: u64,
        id: u64,
        side: Side,
        direction: Direction,
        shares: f64,
    ) -> Result<TradeReceipt> {
        let handle = self.market_handle(id).await?;
        let mut market = handle.lock().await;
        let now = Utc::now();
        market.ensure_tradable(now)?;

        let quote = lmsr::quote(
            market.q_yes,
            market.q_no,
            market.b,
            side,
            direction,
            shares,
            self.cfg.fee_rate,
        )?;

        // Market lock is held; the ledger call below takes the user lock,
        // never the other way around.
        match direction {
            Direction::Buy => {
                self.ledger
                    .debit_and_take_position(user, quote.total, id, side, shares)
                    .await?;
            }
            Direction::Sell => {
                self.ledger
                    .credit_and_release_position(user, quote.total, id, side, shares)
                    .await?;
            }
        }

        market.q_yes = quote.new_q_yes;
        market.q_no = quote.new_q_no;
        market.fees_collected += quote.fee;
        market.record_price(now);

        info!(
            user,
            market = id,
            side = %side,
            ?direction,
            shares,
            amount = quote.total,
            fee = quote.fee,
            p_yes = quote.new_p_yes,
            "trade settled"
        );

        Ok(TradeReceipt {
            market_id: id,
            side,
            direction,
            shares,
            amount: quote.total,
            fee: quote.fee,
            new_q_yes: quote.new_q_yes,
            new_q_no: quote.new_q_no,
            new_p_yes: quote.new_p_yes,
        })
    }

    // ---- resolution ----

    /// Resolve a closed market: winning shares redeem at one point each and
    /// every position on the market is cleared. Calling this on an
    /// already-resolved market is a no-op, never an error.
    pub async fn resolve(&self, id: u64, winning: Side) -> Result<Resolution> {
        let handle = self.market_handle(id).await?;
        let mut market = handle.lock().await;

        if market.status == MarketStatus::Resolved {
            return Ok(Resolution {
                market_id: id,
                outcome: market.resolved_outcome,
                applied: false,
                accounts: 0,
                total: 0,
            });
        }
        if market.status != MarketStatus::Closed {
            return Err(EngineError::InvalidState {
                id,
                action: "resolve",
                status: market.status,
            });
        }

        let now = Utc::now();
        let settled = self.ledger.payout(id, winning).await;
        market.mark_resolved(winning, now)?;
        info!(
            id,
            winning = %winning,
            accounts = settled.accounts,
            total_paid = settled.total,
            "market resolved"
        );
        Ok(Resolution {
            market_id: id,
            outcome: Some(winning),
            applied: true,
            accounts: settled.accounts,
            total: settled.total,
        })
    }

    /// Safety-net cancellation of a closed market: every open position is
    /// refunded its remaining cost basis, then the market terminates.
    pub async fn cancel(&self, id: u64) -> Result<Resolution> {
        let handle = self.market_handle(id).await?;
        let mut market = handle.lock().await;

        if market.status != MarketStatus::Closed {
            return Err(EngineError::InvalidState {
                id,
                action: "cancel",
                status: market.status,
            });
        }

        let now = Utc::now();
        let settled = self.ledger.refund(id).await;
        market.cancel(now)?;
        info!(
            id,
            accounts = settled.accounts,
            total_refunded = settled.total,
            "market cancelled, positions refunded"
        );
        Ok(Resolution {
            market_id: id,
            outcome: None,
            applied: true,
            accounts: settled.accounts,
            total: settled.total,
        })
    }

    // ---- reads ----

    pub async fn get_market(&self, id: u64) -> Result<Market> {
        let handle = self.market_handle(id).await?;
        let market = handle.lock().await;
        Ok(market.clone())
    }

    pub async fn list_markets(&self, status: Option<MarketStatus>) -> Vec<Market> {
        let handles: Vec<Arc<Mutex<Market>>> =
            self.markets.read().await.values().cloned().collect();
        let mut out = Vec::with_capacity(handles.len());
        for handle in handles {
            let market = handle.lock().await;
            if status.is_none() || status == Some(market.status) {
                out.push(market.clone());
            }
        }
        out.sort_by_key(|m| m.id);
        out
    }

    pub async fn get_price_history(&self, id: u64) -> Result<Vec<PricePoint>> {
        let handle = self.market_handle(id).await?;
        let market = handle.lock().await;
        Ok(market.price_history.clone())
    }

    /// Every open holding with what it would fetch if sold right now. The
    /// user lock is released before any market lock is taken.
    pub async fn get_portfolio(&self, user: u64) -> Vec<PortfolioEntry> {
        let positions = self.ledger.positions_of(user).await;
        let mut out = Vec::new();
        for (market_id, pos) in positions {
            let handle = match self.market_handle(market_id).await {
                Ok(h) => h,
                Err(_) => continue,
            };
            let market = handle.lock().await;
            for side in [Side::Yes, Side::No] {
                let shares = pos.shares(side);
                if shares <= SHARE_EPS {
                    continue;
                }
                let current_value = lmsr::quote_sell(
                    market.q_yes,
                    market.q_no,
                    market.b,
                    side,
                    shares,
                    self.cfg.fee_rate,
                )
                .map(|q| q.total)
                .unwrap_or(0);
                out.push(PortfolioEntry {
                    market_id,
                    question: market.question.clone(),
                    side,
                    shares,
                    cost_basis: pos.basis(side),
                    current_value,
                });
            }
        }
        out
    }

    pub async fn balance_of(&self, user: u64) -> i64 {
        self.ledger.balance_of(user).await
    }

    pub async fn claim_daily(&self, user: u64) -> Result<i64> {
        self.ledger.claim_daily(user, Utc::now()).await
    }

    pub async fn leaderboard(&self, n: usize) -> Vec<(u64, i64)> {
        self.ledger.leaderboard(n).await
    }

    /// Consistent snapshot for the persistence collaborator.
    ///
    /// Every market lock is held (in id order) across the account export, so
    /// no trade can settle between the two halves of the document; the trade
    /// path takes market before user, never the reverse, so this cannot
    /// deadlock.
    pub async fn snapshot(&self) -> EngineSnapshot {
        let mut entries: Vec<(u64, Arc<Mutex<Market>>)> = {
            let map = self.markets.read().await;
            map.iter().map(|(id, h)| (*id, h.clone())).collect()
        };
        entries.sort_by_key(|(id, _)| *id);

        let mut guards = Vec::with_capacity(entries.len());
        for (_, handle) in &entries {
            guards.push(handle.lock().await);
        }
        let markets: Vec<Market> = guards.iter().map(|g| Market::clone(g)).collect();
        let accounts = self.ledger.export().await;
        drop(guards);

        EngineSnapshot {
            taken_at: Utc::now(),
            next_id: self.next_id.load(Ordering::Relaxed),
            markets,
            accounts,
        }
    }
}
