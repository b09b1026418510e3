//! Built-in task handlers and the default task table seeded at first boot.

use anyhow::Result;
use async_trait::async_trait;
use chrono::Utc;
use serde_json::json;
use std::sync::Arc;
use std::time::Instant;
use tracing::info;

use crate::marketdata::exchange::ExchangeAdapter;
use crate::marketdata::store::PriceStore;
use crate::marketdata::sync::SyncOrchestrator;
use crate::spooler::scheduler::{ProgressFn, TaskHandler};
use crate::spooler::task_store::TaskSeed;

pub const TASK_MARKET_REFRESH: &str = "market-refresh";
pub const TASK_PRICE_SYNC: &str = "price-sync";
pub const TASK_HEALTH_CHECK: &str = "health-check";

/// The rows created when the task table is empty at boot.
pub fn default_task_seeds() -> Vec<TaskSeed> {
    vec![
        TaskSeed {
            name: TASK_MARKET_REFRESH,
            frequency_seconds: 6 * 3600,
        },
        TaskSeed {
            name: TASK_PRICE_SYNC,
            frequency_seconds: 60,
        },
        TaskSeed {
            name: TASK_HEALTH_CHECK,
            frequency_seconds: 30,
        },
    ]
}

/// Runs one bounded price-sync pass and persists the pass metrics as the
/// task state.
pub struct PriceSyncHandler {
    orchestrator: Arc<SyncOrchestrator>,
}

impl PriceSyncHandler {
    pub fn new(orchestrator: Arc<SyncOrchestrator>) -> Self {
        Self { orchestrator }
    }
}

#[async_trait]
impl TaskHandler for PriceSyncHandler {
    async fn run(
        &self,
        _state: serde_json::Value,
        progress: ProgressFn,
    ) -> Result<serde_json::Value> {
        progress("computing missing ranges");
        let summary = self
            .orchestrator
            .run_once(Utc::now().timestamp_millis())
            .await?;
        progress(&format!(
            "synced {} chunks ({} bars)",
            summary.chunks_synced, summary.bars_inserted
        ));
        Ok(serde_json::to_value(summary)?)
    }
}

/// Refreshes the locally cached market definitions from the venue.
pub struct MarketRefreshHandler {
    store: Arc<PriceStore>,
    adapter: Arc<dyn ExchangeAdapter>,
}

impl MarketRefreshHandler {
    pub fn new(store: Arc<PriceStore>, adapter: Arc<dyn ExchangeAdapter>) -> Self {
        Self { store, adapter }
    }
}

#[async_trait]
impl TaskHandler for MarketRefreshHandler {
    async fn run(
        &self,
        _state: serde_json::Value,
        progress: ProgressFn,
    ) -> Result<serde_json::Value> {
        progress("fetching market definitions");
        let markets = self.adapter.list_markets().await?;
        let now_ms = Utc::now().timestamp_millis();
        let upserted = self.store.upsert_markets(&markets, now_ms)?;
        info!(markets = upserted, exchange = self.adapter.exchange_id(), "market definitions refreshed");
        Ok(json!({ "markets": upserted, "refreshed_at": now_ms }))
    }
}

/// Cheap liveness signal in the task table itself: row counts and uptime.
pub struct HealthCheckHandler {
    store: Arc<PriceStore>,
    started_at: Instant,
}

impl HealthCheckHandler {
    pub fn new(store: Arc<PriceStore>) -> Self {
        Self {
            store,
            started_at: Instant::now(),
        }
    }
}

#[async_trait]
impl TaskHandler for HealthCheckHandler {
    async fn run(
        &self,
        _state: serde_json::Value,
        _progress: ProgressFn,
    ) -> Result<serde_json::Value> {
        Ok(json!({
            "bars": self.store.bar_count()?,
            "symbols": self.store.symbol_count()?,
            "markets": self.store.market_count()?,
            "uptime_secs": self.started_at.elapsed().as_secs(),
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_seeds_cover_the_three_boot_tasks() {
        let seeds = default_task_seeds();
        let names: Vec<_> = seeds.iter().map(|s| s.name).collect();
        assert_eq!(names, vec![TASK_MARKET_REFRESH, TASK_PRICE_SYNC, TASK_HEALTH_CHECK]);
        // Coarse / fine / seconds-scale cadences, none one-shot.
        assert!(seeds.iter().all(|s| s.frequency_seconds > 0));
    }
}
