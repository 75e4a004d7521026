//! Thin JSON surface over the engine for the surrounding bot process.
//!
//! No logic lives here: each handler parses, calls one engine operation, and
//! maps the typed error to a status code.

use std::sync::Arc;

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::Json,
    routing::{get, post},
    Router,
};
use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::{json, Value};
use tower_http::cors::CorsLayer;

use crate::engine::Engine;
use crate::error::EngineError;
use crate::lmsr::{from_ledger_units, Direction, Side};
use crate::market::MarketStatus;

type ApiResult = Result<Json<Value>, (StatusCode, Json<Value>)>;

fn fail(e: EngineError) -> (StatusCode, Json<Value>) {
    let status = match &e {
        EngineError::MarketNotFound(_) => StatusCode::NOT_FOUND,
        EngineError::InvalidQuantity(_) => StatusCode::BAD_REQUEST,
        EngineError::InsufficientFunds { .. }
        | EngineError::InsufficientShares { .. }
        | EngineError::MarketNotTradable { .. }
        | EngineError::InvalidState { .. }
        | EngineError::DailyNotReady(_) => StatusCode::CONFLICT,
    };
    (status, Json(json!({ "error": e.to_string() })))
}

pub fn router(engine: Arc<Engine>) -> Router {
    Router::new()
        .route("/", get(health))
        .route("/health", get(health))
        .route("/markets", post(propose_market).get(list_markets))
        .route("/markets/:id", get(get_market))
        .route("/markets/:id/history", get(get_history))
        .route("/markets/:id/approve", post(approve_market))
        .route("/markets/:id/reject", post(reject_market))
        .route("/markets/:id/resolve", post(resolve_market))
        .route("/markets/:id/quote", post(quote_trade))
        .route("/markets/:id/trades", post(execute_trade))
        .route("/users/:id/portfolio", get(get_portfolio))
        .route("/users/:id/balance", get(get_balance))
        .route("/users/:id/daily", post(claim_daily))
        .route("/leaderboard", get(leaderboard))
        .layer(CorsLayer::permissive())
        .with_state(engine)
}

async fn health() -> Json<Value> {
    Json(json!({ "status": "healthy", "service": "market-engine" }))
}

#[derive(Deserialize)]
struct ProposeBody {
    creator: u64,
    question: String,
    close_at: DateTime<Utc>,
    liquidity: Option<f64>,
}

async fn propose_market(
    State(engine): State<Arc<Engine>>,
    Json(body): Json<ProposeBody>,
) -> ApiResult {
    let market = engine
        .propose_market(body.creator, body.question, body.close_at, body.liquidity)
        .await
        .map_err(fail)?;
    Ok(Json(json!({ "market": market })))
}

#[derive(Deserialize)]
struct ListParams {
    status: Option<MarketStatus>,
}

async fn list_markets(
    State(engine): State<Arc<Engine>>,
    Query(params): Query<ListParams>,
) -> Json<Value> {
    let markets = engine.list_markets(params.status).await;
    Json(json!({ "markets": markets }))
}

async fn get_market(State(engine): State<Arc<Engine>>, Path(id): Path<u64>) -> ApiResult {
    let market = engine.get_market(id).await.map_err(fail)?;
    Ok(Json(json!({ "market": market })))
}

async fn get_history(State(engine): State<Arc<Engine>>, Path(id): Path<u64>) -> ApiResult {
    let history = engine.get_price_history(id).await.map_err(fail)?;
    Ok(Json(json!({ "history": history })))
}

async fn approve_market(State(engine): State<Arc<Engine>>, Path(id): Path<u64>) -> ApiResult {
    let market = engine.approve(id).await.map_err(fail)?;
    Ok(Json(json!({ "market": market })))
}

async fn reject_market(State(engine): State<Arc<Engine>>, Path(id): Path<u64>) -> ApiResult {
    let market = engine.reject(id).await.map_err(fail)?;
    Ok(Json(json!({ "market": market })))
}

#[derive(Deserialize)]
struct ResolveBody {
    winner: Side,
}

async fn resolve_market(
    State(engine): State<Arc<Engine>>,
    Path(id): Path<u64>,
    Json(body): Json<ResolveBody>,
) -> ApiResult {
    let resolution = engine.resolve(id, body.winner).await.map_err(fail)?;
    Ok(Json(json!({ "resolution": resolution })))
}

#[derive(Deserialize)]
struct QuoteBody {
    side: Side,
    direction: Direction,
    shares: f64,
}

async fn quote_trade(
    State(engine): State<Arc<Engine>>,
    Path(id): Path<u64>,
    Json(body): Json<QuoteBody>,
) -> ApiResult {
    let quote = engine
        .quote_trade(id, body.side, body.direction, body.shares)
        .await
        .map_err(fail)?;
    Ok(Json(json!({
        "quote": quote,
        "amount_points": from_ledger_units(quote.total),
    })))
}

#[derive(Deserialize)]
struct TradeBody {
    user: u64,
    side: Side,
    direction: Direction,
    shares: f64,
}

async fn execute_trade(
    State(engine): State<Arc<Engine>>,
    Path(id): Path<u64>,
    Json(body): Json<TradeBody>,
) -> ApiResult {
    let receipt = engine
        .execute_trade(body.user, id, body.side, body.direction, body.shares)
        .await
        .map_err(fail)?;
    Ok(Json(json!({
        "receipt": receipt,
        "amount_points": from_ledger_units(receipt.amount),
    })))
}

async fn get_portfolio(State(engine): State<Arc<Engine>>, Path(id): Path<u64>) -> Json<Value> {
    let entries = engine.get_portfolio(id).await;
    Json(json!({ "portfolio": entries }))
}

async fn get_balance(State(engine): State<Arc<Engine>>, Path(id): Path<u64>) -> Json<Value> {
    let balance = engine.balance_of(id).await;
    Json(json!({
        "balance": balance,
        "balance_points": from_ledger_units(balance),
    }))
}

async fn claim_daily(State(engine): State<Arc<Engine>>, Path(id): Path<u64>) -> ApiResult {
    let balance = engine.claim_daily(id).await.map_err(fail)?;
    Ok(Json(json!({
        "balance": balance,
        "balance_points": from_ledger_units(balance),
    })))
}

#[derive(Deserialize)]
struct LeaderboardParams {
    limit: Option<usize>,
}

async fn leaderboard(
    State(engine): State<Arc<Engine>>,
    Query(params): Query<LeaderboardParams>,
) -> Json<Value> {
    let rows = engine.leaderboard(params.limit.unwrap_or(10)).await;
    let rows: Vec<Value> = rows
        .into_iter()
        .map(|(user, balance)| {
            json!({
                "user": user,
                "balance": balance,
                "balance_points": from_ledger_units(balance),
            })
        })
        .collect();
    Json(json!({ "leaderboard": rows }))
}
