//! End-to-end tests over the public engine surface: lifecycle, settlement
//! atomicity, conservation, scheduler reconciliation, snapshot reload.

use std::sync::Arc;

use chrono::{Duration, Utc};
use rand::{Rng, SeedableRng};

use market_engine::lmsr::{self, LEDGER_SCALE};
use market_engine::{
    Direction, Engine, EngineConfig, EngineError, MarketStatus, ResolutionScheduler, Side,
};

const PT: i64 = LEDGER_SCALE;

fn config() -> EngineConfig {
    EngineConfig {
        proposal_cost: 0.0,
        ..EngineConfig::default()
    }
}

/// Propose + approve an open market, returning its id.
async fn open_market(engine: &Engine, b: f64, hours: i64) -> u64 {
    let market = engine
        .propose_market(999, "test market".into(), Utc::now() + Duration::hours(hours), Some(b))
        .await
        .unwrap();
    engine.approve(market.id).await.unwrap();
    market.id
}

#[tokio::test]
async fn full_lifecycle_with_manual_resolution() {
    let engine = Engine::new(config());
    let id = open_market(&engine, 300.0, 24).await;

    let buy = engine
        .execute_trade(1, id, Side::Yes, Direction::Buy, 50.0)
        .await
        .unwrap();
    assert!(buy.amount > 0);
    assert_eq!(engine.balance_of(1).await, 1_000 * PT - buy.amount);

    engine
        .execute_trade(2, id, Side::No, Direction::Buy, 30.0)
        .await
        .unwrap();

    // resolve is only legal once the market is closed
    let err = engine.resolve(id, Side::Yes).await.unwrap_err();
    assert!(matches!(err, EngineError::InvalidState { .. }));

    engine.close_market(id, Utc::now()).await.unwrap();
    let res = engine.resolve(id, Side::Yes).await.unwrap();
    assert!(res.applied);
    assert_eq!(res.total, 50 * PT);

    // winner holds 50 shares redeeming at 1 point each
    assert_eq!(engine.balance_of(1).await, 1_000 * PT - buy.amount + 50 * PT);
    // loser's shares are worthless, position gone
    assert!(engine.get_portfolio(1).await.is_empty());
    assert!(engine.get_portfolio(2).await.is_empty());

    let market = engine.get_market(id).await.unwrap();
    assert_eq!(market.status, MarketStatus::Resolved);
    assert_eq!(market.resolved_outcome, Some(Side::Yes));
}

#[tokio::test]
async fn resolve_twice_changes_nothing() {
    let engine = Engine::new(config());
    let id = open_market(&engine, 300.0, 24).await;
    engine
        .execute_trade(1, id, Side::Yes, Direction::Buy, 40.0)
        .await
        .unwrap();
    engine.close_market(id, Utc::now()).await.unwrap();

    engine.resolve(id, Side::Yes).await.unwrap();
    let after_first = engine.balance_of(1).await;

    let second = engine.resolve(id, Side::Yes).await.unwrap();
    assert!(!second.applied);
    assert_eq!(second.total, 0);
    assert_eq!(engine.balance_of(1).await, after_first);

    // even with the opposite winner, the recorded outcome stands
    let third = engine.resolve(id, Side::No).await.unwrap();
    assert!(!third.applied);
    assert_eq!(
        engine.get_market(id).await.unwrap().resolved_outcome,
        Some(Side::Yes)
    );
}

#[tokio::test]
async fn trades_rejected_after_close_time() {
    let engine = Engine::new(config());
    // approved, but the close time is already behind us
    let market = engine
        .propose_market(1, "late".into(), Utc::now() - Duration::seconds(1), None)
        .await
        .unwrap();
    engine.approve(market.id).await.unwrap();

    let err = engine
        .execute_trade(1, market.id, Side::Yes, Direction::Buy, 10.0)
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::MarketNotTradable { .. }));
    assert_eq!(engine.balance_of(1).await, 1_000 * PT);

    // the scheduler sweeps it into Closed on the next tick
    let scheduler = ResolutionScheduler::new(Arc::new(engine));
    let summary = scheduler.tick(Utc::now()).await;
    assert_eq!(summary.closed, 1);
}

#[tokio::test]
async fn unknown_market_and_bad_quantities() {
    let engine = Engine::new(config());
    assert!(matches!(
        engine.quote_trade(404, Side::Yes, Direction::Buy, 1.0).await,
        Err(EngineError::MarketNotFound(404))
    ));

    let id = open_market(&engine, 300.0, 24).await;
    assert!(matches!(
        engine.execute_trade(1, id, Side::Yes, Direction::Buy, 0.0).await,
        Err(EngineError::InvalidQuantity(_))
    ));
    assert!(matches!(
        engine.execute_trade(1, id, Side::Yes, Direction::Sell, 5.0).await,
        Err(EngineError::InsufficientShares { .. })
    ));
}

#[tokio::test]
async fn conservation_holds_over_random_trading() {
    let engine = Engine::new(config());
    let b = 500.0;
    let id = open_market(&engine, b, 24).await;

    let mut rng = rand::rngs::StdRng::seed_from_u64(42);
    let mut collected_raw: i64 = 0;
    let mut refunded_raw: i64 = 0;
    let mut fees: i64 = 0;
    let mut trades = 0usize;

    for i in 0..200 {
        let user = 1 + (i % 5) as u64;
        let side = if rng.gen_bool(0.5) { Side::Yes } else { Side::No };
        let sell = rng.gen_bool(0.3);
        let shares = rng.gen_range(0.5..40.0);
        let direction = if sell { Direction::Sell } else { Direction::Buy };
        match engine.execute_trade(user, id, side, direction, shares).await {
            Ok(receipt) => {
                match direction {
                    Direction::Buy => collected_raw += receipt.amount - receipt.fee,
                    Direction::Sell => refunded_raw += receipt.amount + receipt.fee,
                }
                fees += receipt.fee;
                trades += 1;
            }
            // a rejected trade moves nothing, so it cannot affect the books
            Err(EngineError::InsufficientShares { .. })
            | Err(EngineError::InsufficientFunds { .. }) => {}
            Err(e) => panic!("unexpected trade failure: {e}"),
        }
    }
    assert!(trades > 50);

    let market = engine.get_market(id).await.unwrap();
    let liability = lmsr::cost(market.q_yes, market.q_no, b) - lmsr::cost(0.0, 0.0, b);
    let net = lmsr::from_ledger_units(collected_raw - refunded_raw);
    assert!(
        (net - liability).abs() < 0.01,
        "conservation broken: net paid in {net}, liability {liability}"
    );
    assert_eq!(market.fees_collected, fees);

    // nobody went negative
    for user in 1..=5 {
        assert!(engine.balance_of(user).await >= 0);
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn simultaneous_buys_are_serialized() {
    let engine = Arc::new(Engine::new(config()));
    let id = open_market(&engine, 300.0, 24).await;

    let mut handles = Vec::new();
    for user in 1..=2u64 {
        let engine = engine.clone();
        handles.push(tokio::spawn(async move {
            engine
                .execute_trade(user, id, Side::Yes, Direction::Buy, 100.0)
                .await
                .unwrap()
        }));
    }
    let mut receipts = Vec::new();
    for h in handles {
        receipts.push(h.await.unwrap());
    }

    // one trade saw 100 outstanding, the other 200: never the same stale book
    let mut seen: Vec<f64> = receipts.iter().map(|r| r.new_q_yes).collect();
    seen.sort_by(|a, b| a.partial_cmp(b).unwrap());
    assert!((seen[0] - 100.0).abs() < 1e-9);
    assert!((seen[1] - 200.0).abs() < 1e-9);

    // and the second buyer paid more for the same shares
    let mut amounts: Vec<i64> = receipts.iter().map(|r| r.amount).collect();
    amounts.sort();
    assert!(amounts[1] > amounts[0]);

    let market = engine.get_market(id).await.unwrap();
    assert!((market.q_yes - 200.0).abs() < 1e-9);
    assert_eq!(market.price_history.len(), 3); // creation sample + 2 trades
}

#[tokio::test]
async fn scheduler_auto_resolves_confident_markets() {
    let engine = Arc::new(Engine::new(config()));
    let id = open_market(&engine, 300.0, 24).await;

    // push p_yes to ~0.73, above the 0.70 threshold
    let buy = engine
        .execute_trade(1, id, Side::Yes, Direction::Buy, 300.0)
        .await
        .unwrap();
    assert!(buy.new_p_yes > 0.70);

    engine.close_market(id, Utc::now()).await.unwrap();

    let scheduler = ResolutionScheduler::new(engine.clone());
    let summary = scheduler.tick(Utc::now()).await;
    assert_eq!(summary.auto_resolved, 1);
    assert_eq!(summary.cancelled, 0);

    let market = engine.get_market(id).await.unwrap();
    assert_eq!(market.status, MarketStatus::Resolved);
    assert_eq!(market.resolved_outcome, Some(Side::Yes));
    // 300 winning shares redeem at a point each
    assert_eq!(
        engine.balance_of(1).await,
        1_000 * PT - buy.amount + 300 * PT
    );
}

#[tokio::test]
async fn scheduler_leaves_uncertain_markets_until_the_safety_net() {
    let engine = Arc::new(Engine::new(config()));
    let id = open_market(&engine, 300.0, 24).await;

    // balanced book, p stays near 0.5
    engine
        .execute_trade(1, id, Side::Yes, Direction::Buy, 20.0)
        .await
        .unwrap();
    engine
        .execute_trade(2, id, Side::No, Direction::Buy, 25.0)
        .await
        .unwrap();

    let closed_at = Utc::now();
    engine.close_market(id, closed_at).await.unwrap();
    let scheduler = ResolutionScheduler::new(engine.clone());

    // within the grace period: nothing happens
    let summary = scheduler.tick(closed_at + Duration::hours(1)).await;
    assert_eq!(summary.auto_resolved, 0);
    assert_eq!(summary.cancelled, 0);
    assert_eq!(
        engine.get_market(id).await.unwrap().status,
        MarketStatus::Closed
    );

    // past the grace period: force-cancel and refund every cost basis
    let summary = scheduler.tick(closed_at + Duration::hours(7)).await;
    assert_eq!(summary.cancelled, 1);

    let market = engine.get_market(id).await.unwrap();
    assert_eq!(market.status, MarketStatus::Cancelled);
    // refund is the exact cost basis: both traders are made whole
    assert_eq!(engine.balance_of(1).await, 1_000 * PT);
    assert_eq!(engine.balance_of(2).await, 1_000 * PT);
    assert!(engine.get_portfolio(1).await.is_empty());
    assert!(engine.get_portfolio(2).await.is_empty());
}

#[tokio::test]
async fn proposal_cost_is_charged_and_returned_on_rejection() {
    let engine = Engine::new(EngineConfig::default()); // 100-point proposal cost
    let market = engine
        .propose_market(7, "speculative".into(), Utc::now() + Duration::hours(24), None)
        .await
        .unwrap();
    assert_eq!(engine.balance_of(7).await, 900 * PT);

    engine.reject(market.id).await.unwrap();
    assert_eq!(engine.balance_of(7).await, 1_000 * PT);
    assert_eq!(
        engine.get_market(market.id).await.unwrap().status,
        MarketStatus::Cancelled
    );

    // a rejected market accepts nothing further
    assert!(matches!(
        engine.approve(market.id).await,
        Err(EngineError::InvalidState { .. })
    ));
}

#[tokio::test]
async fn portfolio_reports_holdings_and_liquidation_value() {
    let engine = Engine::new(config());
    let id = open_market(&engine, 300.0, 24).await;
    let buy = engine
        .execute_trade(1, id, Side::Yes, Direction::Buy, 60.0)
        .await
        .unwrap();

    let portfolio = engine.get_portfolio(1).await;
    assert_eq!(portfolio.len(), 1);
    let entry = &portfolio[0];
    assert_eq!(entry.market_id, id);
    assert_eq!(entry.side, Side::Yes);
    assert!((entry.shares - 60.0).abs() < 1e-9);
    assert_eq!(entry.cost_basis, buy.amount);
    // liquidation value is the buy cost minus both fee legs
    assert_eq!(entry.current_value, buy.amount - 2 * buy.fee);
}

#[tokio::test]
async fn snapshot_reload_preserves_the_economy() {
    let engine = Engine::new(config());
    let id = open_market(&engine, 300.0, 24).await;
    engine
        .execute_trade(1, id, Side::Yes, Direction::Buy, 80.0)
        .await
        .unwrap();
    engine
        .execute_trade(2, id, Side::No, Direction::Buy, 15.0)
        .await
        .unwrap();

    let snap = engine.snapshot().await;
    let restored = Engine::from_snapshot(config(), snap);

    assert_eq!(restored.balance_of(1).await, engine.balance_of(1).await);
    assert_eq!(restored.balance_of(2).await, engine.balance_of(2).await);

    let before = engine.get_market(id).await.unwrap();
    let after = restored.get_market(id).await.unwrap();
    assert_eq!(after.status, before.status);
    assert!((after.q_yes - before.q_yes).abs() < 1e-12);
    assert!((after.q_no - before.q_no).abs() < 1e-12);
    assert_eq!(after.price_history.len(), before.price_history.len());
    assert_eq!(after.fees_collected, before.fees_collected);

    // new ids keep counting from where the old process stopped
    let next = restored
        .propose_market(3, "fresh".into(), Utc::now() + Duration::hours(1), None)
        .await
        .unwrap();
    assert!(next.id > id);

    // and the restored market still trades
    restored
        .execute_trade(1, id, Side::Yes, Direction::Buy, 5.0)
        .await
        .unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn snapshot_is_a_consistent_cut_under_concurrent_trading() {
    let engine = Arc::new(Engine::new(config()));
    let b = 300.0;
    let id = open_market(&engine, b, 24).await;

    let trader = {
        let engine = engine.clone();
        tokio::spawn(async move {
            for _ in 0..300 {
                engine
                    .execute_trade(1, id, Side::Yes, Direction::Buy, 3.0)
                    .await
                    .unwrap();
                engine
                    .execute_trade(1, id, Side::Yes, Direction::Sell, 3.0)
                    .await
                    .unwrap();
            }
        })
    };

    // Every snapshot taken mid-stream must balance on its own: the money in
    // the accounts plus the market's liability plus the fee sink is exactly
    // the money ever minted. A document capturing half a trade misses that
    // trade's cost on one side and blows the equation by whole points.
    for _ in 0..50 {
        let snap = engine.snapshot().await;
        let market = snap.markets.iter().find(|m| m.id == id).unwrap();
        let liability = lmsr::cost(market.q_yes, market.q_no, b) - lmsr::cost(0.0, 0.0, b);
        let balances: i64 = snap.accounts.iter().map(|a| a.account.balance).sum();
        let minted = snap.accounts.len() as i64 * 1_000 * PT;
        let drift =
            (lmsr::from_ledger_units(balances + market.fees_collected - minted) + liability).abs();
        assert!(drift < 0.01, "snapshot is not a consistent cut: drift {drift}");
        tokio::task::yield_now().await;
    }

    trader.await.unwrap();
}

#[tokio::test]
async fn buy_then_sell_round_trip_costs_exactly_the_fees() {
    let engine = Engine::new(config());
    let id = open_market(&engine, 1_000.0, 24).await;

    let buy = engine
        .execute_trade(1, id, Side::Yes, Direction::Buy, 100.0)
        .await
        .unwrap();
    let sell = engine
        .execute_trade(1, id, Side::Yes, Direction::Sell, 100.0)
        .await
        .unwrap();

    let final_balance = engine.balance_of(1).await;
    assert_eq!(final_balance, 1_000 * PT - buy.fee - sell.fee);
    // both legs priced the same raw amount, so the fees match too
    assert_eq!(buy.fee, sell.fee);

    let market = engine.get_market(id).await.unwrap();
    assert!(market.q_yes.abs() < 1e-9);
    assert!(engine.get_portfolio(1).await.is_empty());
}
