use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use market_engine::{api, Engine, EngineConfig, JsonFileStore, ResolutionScheduler};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenv::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cfg = EngineConfig::from_env();
    info!(?cfg, "starting market engine");

    let snapshot_path =
        std::env::var("SNAPSHOT_PATH").unwrap_or_else(|_| "market_engine.json".to_string());
    let store = JsonFileStore::new(&snapshot_path);

    let engine = match store.load().await? {
        Some(snap) => Arc::new(Engine::from_snapshot(cfg.clone(), snap)),
        None => Arc::new(Engine::new(cfg.clone())),
    };

    ResolutionScheduler::new(engine.clone()).spawn();

    // Persist the committed state on the same cadence as the scheduler.
    {
        let engine = engine.clone();
        let period = Duration::from_secs(cfg.tick_interval_secs);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let snap = engine.snapshot().await;
                if let Err(e) = store.save(&snap).await {
                    error!(error = %e, "snapshot save failed");
                }
            }
        });
    }

    let port: u16 = std::env::var("PORT")
        .ok()
        .and_then(|p| p.parse().ok())
        .unwrap_or(3001);
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    info!(%addr, "listening");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, api::router(engine)).await?;

    Ok(())
}
