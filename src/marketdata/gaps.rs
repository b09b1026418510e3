//! Missing-range detection over the persisted series.
//!
//! Walks the expected bucket grid of a query window against the bucket
//! starts actually in the store and emits one range per contiguous run of
//! absent buckets. A bucket the exclusion predicate claims (a documented
//! venue outage, say) counts as present: it is never reported missing and
//! therefore never re-fetched.
//!
//! The walk is over the grid itself, so no trailing range can appear when
//! the last stored bucket equals the query end: the grid simply runs out.

use anyhow::Result;
use std::collections::HashSet;

use crate::marketdata::range::PriceDataRange;
use crate::marketdata::resolution::TimeResolution;
use crate::marketdata::store::PriceStore;
use crate::models::SymbolPair;

/// Missing sub-ranges of `[query_start, query_end]` for the key, ascending
/// by start. Both bounds are floored to the resolution's grid first; an
/// empty store yields exactly the full window, a fully covered one yields
/// nothing.
pub fn missing_ranges(
    store: &PriceStore,
    exchange: &str,
    pair: &SymbolPair,
    res: TimeResolution,
    query_start: i64,
    query_end: i64,
    exclude: impl Fn(i64) -> bool,
) -> Result<Vec<PriceDataRange>> {
    assert!(
        query_start <= query_end,
        "query start {query_start} must not exceed end {query_end}"
    );

    let grid_start = res.bucket_start(query_start);
    let grid_end = res.bucket_start(query_end);

    let existing: HashSet<i64> = store
        .bucket_starts_in_range(exchange, pair, res, grid_start, grid_end)?
        .into_iter()
        .collect();

    let mut gaps = Vec::new();
    let mut open_gap: Option<(i64, i64)> = None;

    let mut bucket = grid_start;
    loop {
        let present = existing.contains(&bucket) || exclude(bucket);
        if present {
            if let Some((gap_start, gap_end)) = open_gap.take() {
                gaps.push(PriceDataRange::new(exchange, pair.clone(), gap_start, gap_end));
            }
        } else {
            match &mut open_gap {
                Some((_, gap_end)) => *gap_end = bucket,
                None => open_gap = Some((bucket, bucket)),
            }
        }

        if bucket >= grid_end {
            break;
        }
        bucket = res.next_bucket(bucket);
    }

    if let Some((gap_start, gap_end)) = open_gap {
        gaps.push(PriceDataRange::new(exchange, pair.clone(), gap_start, gap_end));
    }

    Ok(gaps)
}
