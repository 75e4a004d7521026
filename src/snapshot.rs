//! Snapshot persistence: the whole engine state as one serde document.
//!
//! The engine itself is in-memory; the surrounding application decides where
//! snapshots live. `JsonFileStore` is the bundled implementation: write to a
//! temp file, then rename, so a crash mid-write leaves the previous committed
//! snapshot intact.

use std::io::ErrorKind;
use std::path::PathBuf;

use anyhow::Context;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::ledger::AccountRecord;
use crate::market::Market;

#[derive(Debug, Serialize, Deserialize)]
pub struct EngineSnapshot {
    pub taken_at: DateTime<Utc>,
    pub next_id: u64,
    pub markets: Vec<Market>,
    pub accounts: Vec<AccountRecord>,
}

pub struct JsonFileStore {
    path: PathBuf,
}

impl JsonFileStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        JsonFileStore { path: path.into() }
    }

    /// Load the last committed snapshot, or `None` on first boot.
    pub async fn load(&self) -> anyhow::Result<Option<EngineSnapshot>> {
        match tokio::fs::read(&self.path).await {
            Ok(bytes) => {
                let snap: EngineSnapshot = serde_json::from_slice(&bytes)
                    .with_context(|| format!("corrupt snapshot at {}", self.path.display()))?;
                info!(
                    path = %self.path.display(),
                    markets = snap.markets.len(),
                    accounts = snap.accounts.len(),
                    "snapshot loaded"
                );
                Ok(Some(snap))
            }
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e).with_context(|| format!("reading {}", self.path.display())),
        }
    }

    pub async fn save(&self, snap: &EngineSnapshot) -> anyhow::Result<()> {
        let tmp = self.path.with_extension("tmp");
        let bytes = serde_json::to_vec_pretty(snap)?;
        tokio::fs::write(&tmp, &bytes)
            .await
            .with_context(|| format!("writing {}", tmp.display()))?;
        tokio::fs::rename(&tmp, &self.path)
            .await
            .with_context(|| format!("committing {}", self.path.display()))?;
        Ok(())
    }
}
