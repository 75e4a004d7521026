//! Numerically stable LMSR pricing with f64 share math + fixed-point money (i64).
//!
//! Pure functions only: callers own the market state and the locking around it.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{EngineError, Result};

/// Monetary amounts are carried as integer micro-points.
pub const LEDGER_SCALE: i64 = 1_000_000;

#[inline]
pub fn to_ledger_units(x: f64) -> i64 {
    // round half-away-from-zero
    if x.is_nan() || !x.is_finite() {
        panic!("non-finite value passed to to_ledger_units: {x}");
    }
    let scaled = x * (LEDGER_SCALE as f64);
    if scaled >= 0.0 {
        (scaled + 0.5).floor() as i64
    } else {
        (scaled - 0.5).ceil() as i64
    }
}

#[inline]
pub fn from_ledger_units(x: i64) -> f64 {
    x as f64 / LEDGER_SCALE as f64
}

/// Which side of a binary market a trade touches.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Side {
    Yes,
    No,
}

impl Side {
    pub fn other(self) -> Side {
        match self {
            Side::Yes => Side::No,
            Side::No => Side::Yes,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Side::Yes => "yes",
            Side::No => "no",
        }
    }
}

impl fmt::Display for Side {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Side {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, String> {
        match s.to_lowercase().as_str() {
            "yes" => Ok(Side::Yes),
            "no" => Ok(Side::No),
            _ => Err(format!("invalid side: '{s}', expected 'yes' or 'no'")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Buy,
    Sell,
}

// -----------------------
// Numerically stable math
// -----------------------

#[inline]
pub fn log_sum_exp(a: f64, b: f64) -> f64 {
    let m = a.max(b);
    // if m is -inf (when both a,b are -inf), this still returns -inf
    m + ((a - m).exp() + (b - m).exp()).ln()
}

/// LMSR cost function C(q_yes, q_no) = b * ln(exp(q_yes/b) + exp(q_no/b)).
#[inline]
pub fn cost(q_yes: f64, q_no: f64, b: f64) -> f64 {
    assert!(b > 0.0 && b.is_finite(), "b invalid");
    b * log_sum_exp(q_yes / b, q_no / b)
}

/// Instantaneous YES probability, strictly inside (0,1).
///
/// Past |q_yes - q_no| / b ~ 745 the losing side's exp underflows to zero, so
/// the quotient is clamped back into the open interval.
#[inline]
pub fn prob_yes(q_yes: f64, q_no: f64, b: f64) -> f64 {
    let a = q_yes / b;
    let c = q_no / b;
    let m = a.max(c);
    let ey = (a - m).exp();
    let en = (c - m).exp();
    (ey / (ey + en)).clamp(f64::EPSILON, 1.0 - f64::EPSILON)
}

#[inline]
pub fn prob(side: Side, q_yes: f64, q_no: f64, b: f64) -> f64 {
    match side {
        Side::Yes => prob_yes(q_yes, q_no, b),
        Side::No => 1.0 - prob_yes(q_yes, q_no, b),
    }
}

/// A priced trade, before it is applied to anything.
///
/// `total` is the amount that actually moves on the ledger: for a buy it is
/// `raw + fee` (debited from the trader), for a sell `raw - fee` (credited).
/// The fee never flows back into the cost function; it is a one-way transfer
/// into the market's fee sink.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct Quote {
    pub raw: i64,
    pub fee: i64,
    pub total: i64,
    pub new_q_yes: f64,
    pub new_q_no: f64,
    pub new_p_yes: f64,
}

fn check_shares(shares: f64) -> Result<()> {
    if !shares.is_finite() || shares <= 0.0 {
        return Err(EngineError::InvalidQuantity(shares));
    }
    Ok(())
}

/// Quote buying `shares` of `side`: raw cost is the cost-function increase.
pub fn quote_buy(
    q_yes: f64,
    q_no: f64,
    b: f64,
    side: Side,
    shares: f64,
    fee_rate: f64,
) -> Result<Quote> {
    check_shares(shares)?;
    let (new_q_yes, new_q_no) = match side {
        Side::Yes => (q_yes + shares, q_no),
        Side::No => (q_yes, q_no + shares),
    };
    let raw_f = cost(new_q_yes, new_q_no, b) - cost(q_yes, q_no, b);
    let raw = to_ledger_units(raw_f);
    let fee = to_ledger_units(raw_f * fee_rate);
    Ok(Quote {
        raw,
        fee,
        total: raw + fee,
        new_q_yes,
        new_q_no,
        new_p_yes: prob_yes(new_q_yes, new_q_no, b),
    })
}

/// Quote selling `shares` of `side`: raw refund is the cost-function decrease,
/// non-negative because removing shares can only lower C.
pub fn quote_sell(
    q_yes: f64,
    q_no: f64,
    b: f64,
    side: Side,
    shares: f64,
    fee_rate: f64,
) -> Result<Quote> {
    check_shares(shares)?;
    let (new_q_yes, new_q_no) = match side {
        Side::Yes => (q_yes - shares, q_no),
        Side::No => (q_yes, q_no - shares),
    };
    let raw_f = cost(q_yes, q_no, b) - cost(new_q_yes, new_q_no, b);
    let raw = to_ledger_units(raw_f);
    let fee = to_ledger_units(raw_f * fee_rate);
    Ok(Quote {
        raw,
        fee,
        total: raw - fee,
        new_q_yes,
        new_q_no,
        new_p_yes: prob_yes(new_q_yes, new_q_no, b),
    })
}

pub fn quote(
    q_yes: f64,
    q_no: f64,
    b: f64,
    side: Side,
    direction: Direction,
    shares: f64,
    fee_rate: f64,
) -> Result<Quote> {
    match direction {
        Direction::Buy => quote_buy(q_yes, q_no, b, side, shares, fee_rate),
        Direction::Sell => quote_sell(q_yes, q_no, b, side, shares, fee_rate),
    }
}

// -----------------------
// Tests
// -----------------------
