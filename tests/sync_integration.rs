//! End-to-end: spooler drives a price-sync pass against a mock venue and
//! the filled series plus pass metrics land durably in SQLite.

use anyhow::Result;
use async_trait::async_trait;
use parking_lot::Mutex;
use rust_decimal::Decimal;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

use tradeloom_backend::marketdata::events::PriceEventBus;
use tradeloom_backend::marketdata::exchange::ExchangeAdapter;
use tradeloom_backend::marketdata::gaps::missing_ranges;
use tradeloom_backend::marketdata::range::PriceDataRange;
use tradeloom_backend::marketdata::resolution::TimeResolution;
use tradeloom_backend::marketdata::store::{PriceBar, PriceStore};
use tradeloom_backend::marketdata::sync::{SyncConfig, SyncOrchestrator};
use tradeloom_backend::models::{MarketDefinition, SymbolPair};
use tradeloom_backend::spooler::handlers::{PriceSyncHandler, TASK_PRICE_SYNC};
use tradeloom_backend::spooler::scheduler::Spooler;
use tradeloom_backend::spooler::task_store::{TaskSeed, TaskStore};

const MIN: i64 = 60_000;

struct MockVenue {
    calls: Mutex<usize>,
}

#[async_trait]
impl ExchangeAdapter for MockVenue {
    fn exchange_id(&self) -> &str {
        "mock"
    }

    fn max_candles_per_call(&self) -> i64 {
        500
    }

    async fn fetch_candles(
        &self,
        pair: &SymbolPair,
        res: TimeResolution,
        range: &PriceDataRange,
    ) -> Result<Vec<PriceBar>> {
        *self.calls.lock() += 1;
        let step = res.duration_ms()?;
        let mut bars = Vec::new();
        let mut ts = range.start;
        while ts <= range.end {
            bars.push(PriceBar {
                exchange: "mock".to_string(),
                base: pair.base.clone(),
                quote: pair.quote.clone(),
                resolution: res,
                bucket_start: ts,
                open: Decimal::ONE,
                high: Decimal::TWO,
                low: Decimal::ONE,
                close: Decimal::TWO,
                volume: Decimal::TEN,
            });
            ts += step;
        }
        Ok(bars)
    }

    async fn list_markets(&self) -> Result<Vec<MarketDefinition>> {
        Ok(Vec::new())
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn spooler_driven_sync_fills_the_series_durably() {
    let dir = TempDir::new().unwrap();
    let db_path = dir.path().join("tradeloom.db");
    let db_path = db_path.to_str().unwrap();

    let price_store = Arc::new(PriceStore::new(db_path).unwrap());
    let task_store = Arc::new(TaskStore::new(db_path).unwrap());
    task_store
        .seed_if_empty(&[TaskSeed {
            name: TASK_PRICE_SYNC,
            frequency_seconds: 3600,
        }])
        .unwrap();

    let venue = Arc::new(MockVenue {
        calls: Mutex::new(0),
    });
    let pair = SymbolPair::new("BTC", "USDT");
    let boot_ms = chrono::Utc::now().timestamp_millis();

    let orchestrator = Arc::new(SyncOrchestrator::new(
        price_store.clone(),
        venue.clone(),
        PriceEventBus::default(),
        SyncConfig {
            watchlist: vec![pair.clone()],
            resolution: TimeResolution::M1,
            // Keep the backlog bounded: sync the last ~30 buckets only.
            start_ms: TimeResolution::M1.bucket_start(boot_ms) - 30 * MIN,
            max_fetches_per_run: 10,
            excluded_buckets: Vec::new(),
        },
    ));

    let mut spooler = Spooler::new(task_store.clone(), Duration::from_millis(50));
    spooler
        .register_handler(TASK_PRICE_SYNC, Arc::new(PriceSyncHandler::new(orchestrator)))
        .unwrap();
    let spooler = Arc::new(spooler);
    spooler.clone().start();

    // First run is immediate; give it time to fetch and persist.
    tokio::time::sleep(Duration::from_millis(600)).await;
    spooler.stop();

    assert!(*venue.calls.lock() >= 1, "sync pass never reached the venue");
    assert!(price_store.bar_count().unwrap() >= 29);

    // The series is now consistent over a window that was certainly closed
    // before the pass ran (two buckets behind boot time avoids racing a
    // minute boundary during the sleep above).
    let window_end = TimeResolution::M1.bucket_start(boot_ms) - 2 * MIN;
    let window_start = window_end - 15 * MIN;
    let gaps = missing_ranges(
        &price_store,
        "mock",
        &pair,
        TimeResolution::M1,
        window_start,
        window_end,
        |_| false,
    )
    .unwrap();
    assert!(gaps.is_empty(), "gaps remain after sync: {gaps:?}");

    // Pass metrics were persisted as the task's opaque state.
    let task = task_store.get_by_name(TASK_PRICE_SYNC).unwrap().unwrap();
    assert_eq!(task.run_count, 1);
    assert!(task.state.get("chunks_synced").and_then(|v| v.as_u64()).unwrap() >= 1);
    assert!(!task.is_running);
}
