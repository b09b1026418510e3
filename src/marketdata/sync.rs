//! The price-sync pass: keep the watch-list's persisted series consistent
//! with upstream, one bounded slice of work per invocation.
//!
//! Each chunk is its own unit of work (fetch, normalize, publish, persist),
//! so a crash mid-pass loses nothing already written and a failed chunk
//! never takes the rest of the worklist down with it. The pass never
//! requests the currently open bucket; it is still forming upstream.

use anyhow::Result;
use futures_util::{stream, StreamExt};
use std::collections::BTreeSet;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::marketdata::events::PriceEventBus;
use crate::marketdata::exchange::ExchangeAdapter;
use crate::marketdata::gaps::missing_ranges;
use crate::marketdata::range::{split, PriceDataRange};
use crate::marketdata::resolution::TimeResolution;
use crate::marketdata::store::PriceStore;
use crate::models::{SymbolDefinition, SymbolPair, SyncSummary};

/// How many upstream fetches may be in flight at once within one pass.
/// Small on purpose: upstream rate limits are shared with every other role.
const FETCH_PARALLELISM: usize = 2;

#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub watchlist: Vec<SymbolPair>,
    pub resolution: TimeResolution,
    /// Earliest bucket the series is kept consistent from.
    pub start_ms: i64,
    /// Upstream-call budget per pass.
    pub max_fetches_per_run: usize,
    /// Known-bad upstream ranges (documented venue outages) as inclusive
    /// bucket-start intervals; never treated as missing, never re-fetched.
    pub excluded_buckets: Vec<(i64, i64)>,
}

pub struct SyncOrchestrator {
    store: Arc<PriceStore>,
    adapter: Arc<dyn ExchangeAdapter>,
    events: PriceEventBus,
    config: SyncConfig,
}

impl SyncOrchestrator {
    pub fn new(
        store: Arc<PriceStore>,
        adapter: Arc<dyn ExchangeAdapter>,
        events: PriceEventBus,
        config: SyncConfig,
    ) -> Self {
        Self {
            store,
            adapter,
            events,
            config,
        }
    }

    /// One bounded sync pass as of `now_ms`. Returns the pass metrics.
    pub async fn run_once(&self, now_ms: i64) -> Result<SyncSummary> {
        let mut summary = SyncSummary {
            exchanges: 1,
            pairs_considered: self.config.watchlist.len(),
            ..Default::default()
        };

        self.register_unknown_symbols(now_ms, &mut summary)?;

        let worklist = self.build_worklist(now_ms)?;
        if worklist.is_empty() {
            debug!("price sync: nothing missing, no upstream calls");
            return Ok(summary);
        }

        self.drain_worklist(worklist, &mut summary).await;

        info!(
            chunks = summary.chunks_synced,
            failed = summary.chunks_failed,
            bars = summary.bars_inserted,
            "📈 price sync pass complete"
        );
        Ok(summary)
    }

    /// Register any base/quote symbol of the watch-list not yet known
    /// locally. Registration is idempotent; a failure for one symbol is
    /// logged and does not abort the pass.
    fn register_unknown_symbols(&self, now_ms: i64, summary: &mut SyncSummary) -> Result<()> {
        let mut codes = BTreeSet::new();
        for pair in &self.config.watchlist {
            codes.insert(pair.base.clone());
            codes.insert(pair.quote.clone());
        }
        summary.symbols_considered = codes.len();

        for code in codes {
            let def = SymbolDefinition {
                name: code.clone(),
                code,
            };
            match self.store.register_symbol(&def, now_ms) {
                Ok(true) => {
                    info!(symbol = %def.code, "registered new symbol");
                    summary.symbols_registered += 1;
                }
                Ok(false) => {}
                Err(e) => warn!(symbol = %def.code, error = %e, "symbol registration failed"),
            }
        }
        Ok(())
    }

    /// Missing ranges for every pair, split to the adapter's batch bound,
    /// flattened in watch-list order (oldest gap first within a pair) and
    /// truncated to the per-pass budget.
    fn build_worklist(&self, now_ms: i64) -> Result<Vec<PriceDataRange>> {
        let res = self.config.resolution;

        // Last *closed* bucket: one step below the bucket containing now.
        let open_bucket = res.bucket_start(now_ms);
        if open_bucket <= self.config.start_ms {
            return Ok(Vec::new());
        }
        let sync_end = res.bucket_start(open_bucket - 1);

        let excluded = self.config.excluded_buckets.clone();
        let exclude = move |bucket: i64| {
            excluded
                .iter()
                .any(|&(lo, hi)| (lo..=hi).contains(&bucket))
        };

        let mut worklist = Vec::new();
        'pairs: for pair in &self.config.watchlist {
            let gaps = missing_ranges(
                &self.store,
                self.adapter.exchange_id(),
                pair,
                res,
                self.config.start_ms,
                sync_end,
                &exclude,
            )?;

            if gaps.is_empty() {
                debug!(pair = %pair, "series already consistent, skipping");
                continue;
            }

            for gap in gaps {
                for chunk in split(res, gap, self.adapter.max_candles_per_call())? {
                    worklist.push(chunk);
                    if worklist.len() >= self.config.max_fetches_per_run {
                        break 'pairs;
                    }
                }
            }
        }
        Ok(worklist)
    }

    /// Fetch chunks with bounded parallelism (results arrive in worklist
    /// order), then normalize, publish and persist each chunk as its own
    /// unit of work.
    async fn drain_worklist(&self, worklist: Vec<PriceDataRange>, summary: &mut SyncSummary) {
        let res = self.config.resolution;
        let adapter = self.adapter.clone();

        let mut fetches = stream::iter(worklist)
            .map(|chunk| {
                let adapter = adapter.clone();
                async move {
                    let pair = chunk.pair.clone();
                    let result = adapter.fetch_candles(&pair, res, &chunk).await;
                    (chunk, result)
                }
            })
            .buffered(FETCH_PARALLELISM);

        while let Some((chunk, result)) = fetches.next().await {
            let bars = match result {
                Ok(bars) => bars,
                Err(e) => {
                    warn!(chunk = %chunk, error = %e, "chunk fetch failed, continuing");
                    summary.chunks_failed += 1;
                    continue;
                }
            };

            let mut normalized = bars;
            for bar in &mut normalized {
                bar.bucket_start = res.bucket_start(bar.bucket_start);
                self.events.publish(bar);
            }

            match self.store.insert_bars(&normalized) {
                Ok(inserted) => {
                    summary.chunks_synced += 1;
                    summary.bars_inserted += inserted;
                    debug!(chunk = %chunk, inserted, "chunk persisted");
                }
                Err(e) => {
                    warn!(chunk = %chunk, error = %e, "chunk persist failed, continuing");
                    summary.chunks_failed += 1;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::marketdata::resolution::parse_utc_ms;
    use crate::marketdata::store::PriceBar;
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use rust_decimal::Decimal;
    use tempfile::TempDir;

    const MIN: i64 = 60_000;

    /// Serves one synthetic bar per bucket of any requested range; records
    /// every call and can be told to fail specific calls.
    struct MockExchange {
        max_per_call: i64,
        calls: Mutex<Vec<PriceDataRange>>,
        fail_calls: Mutex<Vec<usize>>,
    }

    impl MockExchange {
        fn new(max_per_call: i64) -> Arc<Self> {
            Arc::new(Self {
                max_per_call,
                calls: Mutex::new(Vec::new()),
                fail_calls: Mutex::new(Vec::new()),
            })
        }

        fn fail_call(&self, index: usize) {
            self.fail_calls.lock().push(index);
        }

        fn call_count(&self) -> usize {
            self.calls.lock().len()
        }
    }

    #[async_trait]
    impl ExchangeAdapter for MockExchange {
        fn exchange_id(&self) -> &str {
            "mock"
        }

        fn max_candles_per_call(&self) -> i64 {
            self.max_per_call
        }

        async fn fetch_candles(
            &self,
            pair: &SymbolPair,
            res: TimeResolution,
            range: &PriceDataRange,
        ) -> Result<Vec<PriceBar>> {
            let index = {
                let mut calls = self.calls.lock();
                calls.push(range.clone());
                calls.len() - 1
            };
            if self.fail_calls.lock().contains(&index) {
                return Err(anyhow::anyhow!("injected upstream failure"));
            }

            let step = res.duration_ms()?;
            let mut bars = Vec::new();
            let mut ts = range.start;
            while ts <= range.end {
                bars.push(PriceBar {
                    exchange: "mock".to_string(),
                    base: pair.base.clone(),
                    quote: pair.quote.clone(),
                    resolution: res,
                    // Offset to prove the orchestrator normalizes timestamps.
                    bucket_start: ts + 250,
                    open: Decimal::ONE,
                    high: Decimal::ONE,
                    low: Decimal::ONE,
                    close: Decimal::ONE,
                    volume: Decimal::ZERO,
                });
                ts += step;
            }
            Ok(bars)
        }

        async fn list_markets(&self) -> Result<Vec<crate::models::MarketDefinition>> {
            Ok(Vec::new())
        }
    }

    struct Fixture {
        _dir: TempDir,
        store: Arc<PriceStore>,
        adapter: Arc<MockExchange>,
        orchestrator: SyncOrchestrator,
        base: i64,
    }

    fn fixture(watchlist: Vec<SymbolPair>, max_per_call: i64, max_fetches: usize) -> Fixture {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(PriceStore::new(dir.path().join("sync.db").to_str().unwrap()).unwrap());
        let adapter = MockExchange::new(max_per_call);
        let base = parse_utc_ms("2024-01-01T00:00:00Z").unwrap();
        let orchestrator = SyncOrchestrator::new(
            store.clone(),
            adapter.clone(),
            PriceEventBus::new(4096),
            SyncConfig {
                watchlist,
                resolution: TimeResolution::M1,
                start_ms: base,
                max_fetches_per_run: max_fetches,
                excluded_buckets: Vec::new(),
            },
        );
        Fixture {
            _dir: dir,
            store,
            adapter,
            orchestrator,
            base,
        }
    }

    fn btc() -> SymbolPair {
        SymbolPair::new("BTC", "USDT")
    }

    #[tokio::test]
    async fn fills_the_backlog_then_goes_quiet() {
        let f = fixture(vec![btc()], 500, 60);
        // now inside bucket :30 -> last closed bucket is :29 -> 30 buckets.
        let now = f.base + 30 * MIN + 12_345;

        let summary = f.orchestrator.run_once(now).await.unwrap();
        assert_eq!(summary.chunks_synced, 1);
        assert_eq!(summary.bars_inserted, 30);
        assert_eq!(f.adapter.call_count(), 1);

        // Second pass: fully covered, zero upstream calls.
        let summary = f.orchestrator.run_once(now).await.unwrap();
        assert_eq!(summary.chunks_synced, 0);
        assert_eq!(f.adapter.call_count(), 1);
    }

    #[tokio::test]
    async fn never_requests_the_open_bucket() {
        let f = fixture(vec![btc()], 500, 60);
        let now = f.base + 5 * MIN + 1; // bucket :05 just opened

        f.orchestrator.run_once(now).await.unwrap();
        let calls = f.adapter.calls.lock();
        let last_requested = calls.iter().map(|r| r.end).max().unwrap();
        assert_eq!(last_requested, f.base + 4 * MIN);
    }

    #[tokio::test]
    async fn respects_the_per_pass_fetch_budget() {
        let f = fixture(vec![btc()], 10, 2);
        let now = f.base + 100 * MIN; // 100-bucket backlog = 10 chunks of 10

        let summary = f.orchestrator.run_once(now).await.unwrap();
        assert_eq!(f.adapter.call_count(), 2);
        assert_eq!(summary.chunks_synced, 2);
        assert_eq!(summary.bars_inserted, 20);

        // Partial progress is durable: the next pass picks up where this
        // one stopped instead of refetching.
        f.orchestrator.run_once(now).await.unwrap();
        assert_eq!(f.adapter.call_count(), 4);
        assert_eq!(f.store.bar_count().unwrap(), 40);
    }

    #[tokio::test]
    async fn one_failed_chunk_does_not_abort_the_rest() {
        let f = fixture(vec![btc()], 10, 60);
        f.adapter.fail_call(0);
        let now = f.base + 30 * MIN; // 3 chunks

        let summary = f.orchestrator.run_once(now).await.unwrap();
        assert_eq!(summary.chunks_failed, 1);
        assert_eq!(summary.chunks_synced, 2);
        assert_eq!(summary.bars_inserted, 20);

        // The failed chunk is still missing and is retried next pass.
        let summary = f.orchestrator.run_once(now).await.unwrap();
        assert_eq!(summary.chunks_synced, 1);
        assert_eq!(f.store.bar_count().unwrap(), 30);
    }

    #[tokio::test]
    async fn registers_watchlist_symbols_once() {
        let f = fixture(vec![btc(), SymbolPair::new("ETH", "USDT")], 500, 60);
        let now = f.base + MIN;

        let summary = f.orchestrator.run_once(now).await.unwrap();
        assert_eq!(summary.symbols_considered, 3); // BTC, ETH, USDT
        assert_eq!(summary.symbols_registered, 3);

        let summary = f.orchestrator.run_once(now).await.unwrap();
        assert_eq!(summary.symbols_registered, 0);
    }

    #[tokio::test]
    async fn normalizes_timestamps_onto_the_bucket_grid() {
        // The mock reports timestamps 250ms off-grid.
        let f = fixture(vec![btc()], 500, 60);
        let now = f.base + 3 * MIN;

        f.orchestrator.run_once(now).await.unwrap();
        let buckets = f
            .store
            .bucket_starts_in_range("mock", &btc(), TimeResolution::M1, f.base, now)
            .unwrap();
        // Buckets :00..:02 are closed as of now = :03; all on-grid.
        assert_eq!(buckets, vec![f.base, f.base + MIN, f.base + 2 * MIN]);
    }

    #[tokio::test]
    async fn publishes_an_event_per_normalized_bar() {
        let f = fixture(vec![btc()], 500, 60);
        let mut rx = f.orchestrator.events.subscribe();
        let now = f.base + 3 * MIN;

        f.orchestrator.run_once(now).await.unwrap();
        let mut seen = 0;
        while let Ok(event) = rx.try_recv() {
            assert_eq!(event.exchange, "mock");
            assert_eq!(event.bar.bucket_start % MIN, 0);
            seen += 1;
        }
        assert_eq!(seen, 3);
    }

    #[tokio::test]
    async fn excluded_ranges_are_never_fetched() {
        let dir = TempDir::new().unwrap();
        let store =
            Arc::new(PriceStore::new(dir.path().join("sync.db").to_str().unwrap()).unwrap());
        let adapter = MockExchange::new(500);
        let base = parse_utc_ms("2024-01-01T00:00:00Z").unwrap();
        let orchestrator = SyncOrchestrator::new(
            store,
            adapter.clone(),
            PriceEventBus::default(),
            SyncConfig {
                watchlist: vec![btc()],
                resolution: TimeResolution::M1,
                start_ms: base,
                max_fetches_per_run: 60,
                // Buckets :00..=:04 are a documented outage.
                excluded_buckets: vec![(base, base + 4 * MIN)],
            },
        );

        orchestrator.run_once(base + 10 * MIN).await.unwrap();
        let calls = adapter.calls.lock();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].start, base + 5 * MIN);
        assert_eq!(calls[0].end, base + 9 * MIN);
    }
}
