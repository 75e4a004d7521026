//! Engine configuration from environment variables with validated defaults.
//!
//! Defaults mirror the long-running deployment: 5% fee, b = 300, 70%
//! auto-resolve threshold, 1000-point starting balance, 100-point daily
//! reward, 100-point proposal cost, 6-hour close-to-cancel grace period.

use std::env;

use chrono::Duration;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::lmsr::to_ledger_units;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Fee rate charged on both buys and sells (fraction of the raw amount).
    pub fee_rate: f64,

    /// Default liquidity parameter b for new markets.
    pub default_liquidity: f64,

    /// Auto-resolve fires when max(p_yes, p_no) exceeds this, for closed
    /// markets only. Deployments have run anywhere between 0.51 and 0.75.
    pub auto_resolve_threshold: f64,

    /// How long a market may sit closed-but-unresolved before the safety net
    /// cancels it and refunds every position's cost basis.
    pub grace_period_hours: f64,

    /// Scheduler tick interval, in seconds.
    pub tick_interval_secs: u64,

    /// Balance granted to accounts on first contact, in points.
    pub starting_balance: f64,

    /// Daily reward claim amount, in points.
    pub daily_reward: f64,

    /// Cooldown between daily claims, in hours.
    pub daily_cooldown_hours: f64,

    /// Cost of proposing a market, in points. Refunded if the proposal is
    /// rejected.
    pub proposal_cost: f64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        EngineConfig {
            fee_rate: 0.05,
            default_liquidity: 300.0,
            auto_resolve_threshold: 0.70,
            grace_period_hours: 6.0,
            tick_interval_secs: 60,
            starting_balance: 1_000.0,
            daily_reward: 100.0,
            daily_cooldown_hours: 24.0,
            proposal_cost: 100.0,
        }
    }
}

fn env_parse<T: std::str::FromStr>(key: &str, fallback: T) -> T {
    match env::var(key) {
        Ok(raw) => raw.parse().unwrap_or(fallback),
        Err(_) => fallback,
    }
}

impl EngineConfig {
    /// Load configuration from environment variables, falling back to
    /// defaults for anything unset or unparseable.
    pub fn from_env() -> Self {
        let d = EngineConfig::default();
        let mut cfg = EngineConfig {
            fee_rate: env_parse("MARKET_FEE_RATE", d.fee_rate),
            default_liquidity: env_parse("MARKET_DEFAULT_LIQUIDITY", d.default_liquidity),
            auto_resolve_threshold: env_parse(
                "MARKET_AUTO_RESOLVE_THRESHOLD",
                d.auto_resolve_threshold,
            ),
            grace_period_hours: env_parse("MARKET_GRACE_PERIOD_HOURS", d.grace_period_hours),
            tick_interval_secs: env_parse("MARKET_TICK_INTERVAL_SECS", d.tick_interval_secs),
            starting_balance: env_parse("MARKET_STARTING_BALANCE", d.starting_balance),
            daily_reward: env_parse("MARKET_DAILY_REWARD", d.daily_reward),
            daily_cooldown_hours: env_parse("MARKET_DAILY_COOLDOWN_HOURS", d.daily_cooldown_hours),
            proposal_cost: env_parse("MARKET_PROPOSAL_COST", d.proposal_cost),
        };
        cfg.validate();
        cfg
    }

    /// Clamp out-of-range values back to defaults rather than refusing to
    /// start.
    fn validate(&mut self) {
        let d = EngineConfig::default();
        if !(0.0..1.0).contains(&self.fee_rate) {
            warn!(fee_rate = self.fee_rate, "invalid fee rate, using default");
            self.fee_rate = d.fee_rate;
        }
        if !self.default_liquidity.is_finite() || self.default_liquidity <= 0.0 {
            warn!(b = self.default_liquidity, "invalid liquidity parameter, using default");
            self.default_liquidity = d.default_liquidity;
        }
        if !(0.5..1.0).contains(&self.auto_resolve_threshold) {
            warn!(
                threshold = self.auto_resolve_threshold,
                "invalid auto-resolve threshold, using default"
            );
            self.auto_resolve_threshold = d.auto_resolve_threshold;
        }
        if !self.grace_period_hours.is_finite() || self.grace_period_hours <= 0.0 {
            warn!(
                hours = self.grace_period_hours,
                "invalid grace period, using default"
            );
            self.grace_period_hours = d.grace_period_hours;
        }
        if self.tick_interval_secs == 0 {
            warn!("tick interval must be positive, using default");
            self.tick_interval_secs = d.tick_interval_secs;
        }
        for (value, fallback, name) in [
            (&mut self.starting_balance, d.starting_balance, "starting balance"),
            (&mut self.daily_reward, d.daily_reward, "daily reward"),
            (&mut self.proposal_cost, d.proposal_cost, "proposal cost"),
        ] {
            if !value.is_finite() || *value < 0.0 {
                warn!(value = *value, "invalid {}, using default", name);
                *value = fallback;
            }
        }
        if !self.daily_cooldown_hours.is_finite() || self.daily_cooldown_hours < 0.0 {
            warn!(
                hours = self.daily_cooldown_hours,
                "invalid daily cooldown, using default"
            );
            self.daily_cooldown_hours = d.daily_cooldown_hours;
        }
    }

    pub fn grace_period(&self) -> Duration {
        Duration::seconds((self.grace_period_hours * 3_600.0) as i64)
    }

    pub fn daily_cooldown(&self) -> Duration {
        Duration::seconds((self.daily_cooldown_hours * 3_600.0) as i64)
    }

    pub fn starting_balance_units(&self) -> i64 {
        to_ledger_units(self.starting_balance)
    }

    pub fn daily_reward_units(&self) -> i64 {
        to_ledger_units(self.daily_reward)
    }

    pub fn proposal_cost_units(&self) -> i64 {
        to_ledger_units(self.proposal_cost)
    }
}
