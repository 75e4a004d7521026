//! Background reconciliation: closes expired markets, fires auto-resolution,
//! and force-cancels markets stuck past the safety-net deadline.
//!
//! Every action goes through the same `Engine` operations an admin would use,
//! re-checked under the market lock, so a stale view taken at the start of a
//! tick can never double-apply anything. A failed action is logged and simply
//! retried on the next tick because the market stays in its current state.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::engine::Engine;
use crate::lmsr::Side;
use crate::market::MarketStatus;

pub struct ResolutionScheduler {
    engine: Arc<Engine>,
}

#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct TickSummary {
    pub closed: usize,
    pub auto_resolved: usize,
    pub cancelled: usize,
    pub failures: usize,
}

impl TickSummary {
    pub fn is_quiet(&self) -> bool {
        self.closed == 0 && self.auto_resolved == 0 && self.cancelled == 0 && self.failures == 0
    }
}

impl ResolutionScheduler {
    pub fn new(engine: Arc<Engine>) -> Self {
        ResolutionScheduler { engine }
    }

    /// Run forever on the configured interval.
    pub fn spawn(self) -> JoinHandle<()> {
        let period = Duration::from_secs(self.engine.config().tick_interval_secs);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let summary = self.tick(Utc::now()).await;
                if !summary.is_quiet() {
                    info!(?summary, "scheduler tick");
                }
            }
        })
    }

    /// One reconciliation pass. Active markets past close are closed first,
    /// then every closed market is checked for auto-resolve before the
    /// safety-net deadline, so a market is never cancelled in a tick where it
    /// qualifies for resolution.
    pub async fn tick(&self, now: DateTime<Utc>) -> TickSummary {
        let mut summary = TickSummary::default();

        for market in self.engine.list_markets(Some(MarketStatus::Active)).await {
            if market.close_at <= now {
                match self.engine.close_market(market.id, now).await {
                    Ok(()) => summary.closed += 1,
                    // lost the race to a concurrent close; nothing to retry
                    Err(e) => warn!(id = market.id, error = %e, "close failed"),
                }
            }
        }

        let threshold = self.engine.config().auto_resolve_threshold;
        let grace = self.engine.config().grace_period();

        for market in self.engine.list_markets(Some(MarketStatus::Closed)).await {
            let p_yes = market.p_yes();
            let confidence = p_yes.max(1.0 - p_yes);

            if confidence > threshold {
                let winning = if p_yes >= 0.5 { Side::Yes } else { Side::No };
                match self.engine.resolve(market.id, winning).await {
                    Ok(res) if res.applied => {
                        info!(
                            id = market.id,
                            winning = %winning,
                            confidence,
                            paid = res.total,
                            "auto-resolved"
                        );
                        summary.auto_resolved += 1;
                    }
                    Ok(_) => {}
                    Err(e) => {
                        warn!(id = market.id, error = %e, "auto-resolve failed, will retry");
                        summary.failures += 1;
                    }
                }
                continue;
            }

            let deadline = market.closed_at.map(|t| t + grace);
            if deadline.is_some_and(|t| t <= now) {
                match self.engine.cancel(market.id).await {
                    Ok(res) => {
                        info!(
                            id = market.id,
                            refunded = res.total,
                            accounts = res.accounts,
                            "safety-net cancelled"
                        );
                        summary.cancelled += 1;
                    }
                    Err(e) => {
                        warn!(id = market.id, error = %e, "safety-net cancel failed, will retry");
                        summary.failures += 1;
                    }
                }
            }
        }

        summary
    }
}
