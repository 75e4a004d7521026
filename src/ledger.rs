//! Authoritative store of user balances and per-market share positions.
//!
//! All mutation goes through all-or-nothing operations: every check happens
//! before the first write, under the owning account's lock. Accounts are
//! created lazily with the configured starting balance.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, RwLock};
use tracing::debug;

use crate::error::{EngineError, Result};
use crate::lmsr::{to_ledger_units, Side};

/// Share quantities below this are treated as zero (f64 dust from sells).
pub const SHARE_EPS: f64 = 1e-9;

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct Position {
    pub shares_yes: f64,
    pub shares_no: f64,
    /// What the holder actually paid for the shares still held, in ledger
    /// units (fees included). This is what a safety-net refund returns.
    pub basis_yes: i64,
    pub basis_no: i64,
}

impl Position {
    pub fn shares(&self, side: Side) -> f64 {
        match side {
            Side::Yes => self.shares_yes,
            Side::No => self.shares_no,
        }
    }

    pub fn basis(&self, side: Side) -> i64 {
        match side {
            Side::Yes => self.basis_yes,
            Side::No => self.basis_no,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.shares_yes <= SHARE_EPS && self.shares_no <= SHARE_EPS
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Account {
    pub balance: i64,
    pub last_claim: Option<DateTime<Utc>>,
    /// Keyed by market id.
    pub positions: HashMap<u64, Position>,
}

impl Account {
    fn new(balance: i64) -> Self {
        Account {
            balance,
            last_claim: None,
            positions: HashMap::new(),
        }
    }
}

/// Flat per-user record used by snapshots.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AccountRecord {
    pub user: u64,
    #[serde(flatten)]
    pub account: Account,
}

/// Totals from a bulk payout or refund pass.
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct Settlement {
    pub accounts: usize,
    pub total: i64,
}

pub struct Ledger {
    accounts: RwLock<HashMap<u64, Arc<Mutex<Account>>>>,
    starting_balance: i64,
    daily_reward: i64,
    daily_cooldown: Duration,
}

impl Ledger {
    pub fn new(starting_balance: i64, daily_reward: i64, daily_cooldown: Duration) -> Self {
        Ledger {
            accounts: RwLock::new(HashMap::new()),
            starting_balance,
            daily_reward,
            daily_cooldown,
        }
    }

    async fn account(&self, user: u64) -> Arc<Mutex<Account>> {
        if let Some(acct) = self.accounts.read().await.get(&user) {
            return acct.clone();
        }
        let mut map = self.accounts.write().await;
        map.entry(user)
            .or_insert_with(|| Arc::new(Mutex::new(Account::new(self.starting_balance))))
            .clone()
    }

    /// Debit `amount` and grow the user's position on `side` by `shares`,
    /// as one indivisible step. Fails with `InsufficientFunds` untouched.
    pub async fn debit_and_take_position(
        &self,
        user: u64,
        amount: i64,
        market: u64,
        side: Side,
        shares: f64,
    ) -> Result<i64> {
        let acct = self.account(user).await;
        let mut acct = acct.lock().await;
        if acct.balance < amount {
            return Err(EngineError::InsufficientFunds {
                needed: amount,
                available: acct.balance,
            });
        }
        acct.balance -= amount;
        let pos = acct.positions.entry(market).or_default();
        match side {
            Side::Yes => {
                pos.shares_yes += shares;
                pos.basis_yes += amount;
            }
            Side::No => {
                pos.shares_no += shares;
                pos.basis_no += amount;
            }
        }
        Ok(acct.balance)
    }

    /// Shrink the user's position on `side` by `shares` and credit `amount`,
    /// indivisibly. The released cost basis is proportional to the shares
    /// sold, so a later refund only covers what is still held.
    pub async fn credit_and_release_position(
        &self,
        user: u64,
        amount: i64,
        market: u64,
        side: Side,
        shares: f64,
    ) -> Result<i64> {
        let acct = self.account(user).await;
        let mut acct = acct.lock().await;
        let pos = acct.positions.get(&market).copied().unwrap_or_default();
        let held = pos.shares(side);
        // dust quantities never pass: they credit 0 micro-points but would
        // still shift the market book
        if shares <= SHARE_EPS || held + SHARE_EPS < shares {
            return Err(EngineError::InsufficientShares {
                requested: shares,
                held,
            });
        }

        let selling_all = held - shares <= SHARE_EPS;
        let released = if selling_all {
            pos.basis(side)
        } else {
            (pos.basis(side) as f64 * (shares / held)).round() as i64
        };

        let entry = acct.positions.entry(market).or_default();
        match side {
            Side::Yes => {
                entry.shares_yes = if selling_all { 0.0 } else { held - shares };
                entry.basis_yes -= released;
            }
            Side::No => {
                entry.shares_no = if selling_all { 0.0 } else { held - shares };
                entry.basis_no -= released;
            }
        }
        if entry.is_empty() {
            acct.positions.remove(&market);
        }
        acct.balance += amount;
        Ok(acct.balance)
    }

    /// Plain balance credit (daily reward, proposal refunds).
    pub async fn credit(&self, user: u64, amount: i64) -> i64 {
        let acct = self.account(user).await;
        let mut acct = acct.lock().await;
        acct.balance += amount;
        acct.balance
    }

    /// Plain balance debit (proposal cost). Fails untouched when short.
    pub async fn debit(&self, user: u64, amount: i64) -> Result<i64> {
        let acct = self.account(user).await;
        let mut acct = acct.lock().await;
        if acct.balance < amount {
            return Err(EngineError::InsufficientFunds {
                needed: amount,
                available: acct.balance,
            });
        }
        acct.balance -= amount;
        Ok(acct.balance)
    }

    /// Resolution payout: every share on the winning side redeems at 1 point,
    /// losing shares at 0, and all positions of the market are cleared.
    ///
    /// The caller holds the market lock, so no trade can interleave; per-user
    /// locks still serialize against unrelated ledger traffic.
    pub async fn payout(&self, market: u64, winning: Side) -> Settlement {
        let handles: Vec<(u64, Arc<Mutex<Account>>)> = {
            let map = self.accounts.read().await;
            map.iter().map(|(u, a)| (*u, a.clone())).collect()
        };

        let mut settled = Settlement::default();
        for (user, acct) in handles {
            let mut acct = acct.lock().await;
            if let Some(pos) = acct.positions.remove(&market) {
                let winning_shares = pos.shares(winning);
                if winning_shares > SHARE_EPS {
                    let credit = to_ledger_units(winning_shares);
                    acct.balance += credit;
                    settled.total += credit;
                    debug!(user, market, winning = %winning, credit, "paid out position");
                }
                settled.accounts += 1;
            }
        }
        settled
    }

    /// Safety-net refund: every open position gets its remaining cost basis
    /// back, regardless of where the price ended up.
    pub async fn refund(&self, market: u64) -> Settlement {
        let handles: Vec<(u64, Arc<Mutex<Account>>)> = {
            let map = self.accounts.read().await;
            map.iter().map(|(u, a)| (*u, a.clone())).collect()
        };

        let mut settled = Settlement::default();
        for (user, acct) in handles {
            let mut acct = acct.lock().await;
            if let Some(pos) = acct.positions.remove(&market) {
                let credit = pos.basis_yes + pos.basis_no;
                acct.balance += credit;
                settled.total += credit;
                settled.accounts += 1;
                debug!(user, market, credit, "refunded position cost basis");
            }
        }
        settled
    }

    /// Daily reward claim with a cooldown; shares the same account lock as
    /// every other balance mutation.
    pub async fn claim_daily(&self, user: u64, now: DateTime<Utc>) -> Result<i64> {
        let acct = self.account(user).await;
        let mut acct = acct.lock().await;
        if let Some(last) = acct.last_claim {
            let next = last + self.daily_cooldown;
            if now < next {
                return Err(EngineError::DailyNotReady(next));
            }
        }
        acct.last_claim = Some(now);
        acct.balance += self.daily_reward;
        Ok(acct.balance)
    }

    pub async fn balance_of(&self, user: u64) -> i64 {
        let acct = self.account(user).await;
        let acct = acct.lock().await;
        acct.balance
    }

    /// Snapshot of a user's open positions, sorted by market id.
    pub async fn positions_of(&self, user: u64) -> Vec<(u64, Position)> {
        let acct = self.account(user).await;
        let acct = acct.lock().await;
        let mut out: Vec<(u64, Position)> =
            acct.positions.iter().map(|(m, p)| (*m, *p)).collect();
        out.sort_by_key(|(m, _)| *m);
        out
    }

    /// Top `n` balances, richest first.
    pub async fn leaderboard(&self, n: usize) -> Vec<(u64, i64)> {
        let handles: Vec<(u64, Arc<Mutex<Account>>)> = {
            let map = self.accounts.read().await;
            map.iter().map(|(u, a)| (*u, a.clone())).collect()
        };
        let mut rows = Vec::with_capacity(handles.len());
        for (user, acct) in handles {
            let acct = acct.lock().await;
            rows.push((user, acct.balance));
        }
        rows.sort_by(|a, b| b.1.cmp(&a.1).then(a.0.cmp(&b.0)));
        rows.truncate(n);
        rows
    }

    pub async fn export(&self) -> Vec<AccountRecord> {
        let handles: Vec<(u64, Arc<Mutex<Account>>)> = {
            let map = self.accounts.read().await;
            map.iter().map(|(u, a)| (*u, a.clone())).collect()
        };
        let mut out = Vec::with_capacity(handles.len());
        for (user, acct) in handles {
            let acct = acct.lock().await;
            out.push(AccountRecord {
                user,
                account: acct.clone(),
            });
        }
        out.sort_by_key(|r| r.user);
        out
    }

    pub fn import(&mut self, records: Vec<AccountRecord>) {
        let map = self.accounts.get_mut();
        map.clear();
        for rec in records {
            map.insert(rec.user, Arc::new(Mutex::new(rec.account)));
        }
    }
}
