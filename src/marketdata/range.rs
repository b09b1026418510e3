//! Price-data ranges and upstream-sized chunking.
//!
//! A range is inclusive on both sides and speaks in bucket-start timestamps:
//! `end` is the start of the *last* bucket in the range, not a raw boundary.
//! Splitting therefore computes a successor chunk as `previous.end + one
//! bucket`, and a one-bucket range has `start == end`.

use anyhow::Result;

use crate::marketdata::resolution::TimeResolution;
use crate::models::SymbolPair;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PriceDataRange {
    pub exchange: String,
    pub pair: SymbolPair,
    /// First bucket start, inclusive.
    pub start: i64,
    /// Last bucket start, inclusive.
    pub end: i64,
}

impl PriceDataRange {
    /// A zero- or negative-length range reaching this constructor is a
    /// programmer error, not a recoverable condition.
    pub fn new(exchange: impl Into<String>, pair: SymbolPair, start: i64, end: i64) -> Self {
        assert!(
            start <= end,
            "range start {start} must not exceed end {end}"
        );
        Self {
            exchange: exchange.into(),
            pair,
            start,
            end,
        }
    }

    /// Number of buckets covered at a fixed-width resolution.
    pub fn bucket_count(&self, res: TimeResolution) -> Result<i64> {
        Ok((self.end - self.start) / res.duration_ms()? + 1)
    }
}

impl std::fmt::Display for PriceDataRange {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{} [{}..={}]", self.exchange, self.pair, self.start, self.end)
    }
}

/// Partition `range` into consecutive chunks of at most `max_buckets`
/// buckets each. Chunks tile the input exactly: no gaps, no overlap, the
/// final chunk may be shorter. Pure and lazy; errors only for
/// calendar-length resolutions, which have no fixed bucket width to chunk by.
pub fn split(
    res: TimeResolution,
    range: PriceDataRange,
    max_buckets: i64,
) -> Result<SplitRanges> {
    assert!(max_buckets > 0, "max_buckets must be positive, got {max_buckets}");
    let step_ms = res.duration_ms()?;
    Ok(SplitRanges {
        remaining: Some(range),
        step_ms,
        chunk_span_ms: (max_buckets - 1) * step_ms,
    })
}

pub struct SplitRanges {
    remaining: Option<PriceDataRange>,
    step_ms: i64,
    /// Distance from a chunk's first to its last bucket start.
    chunk_span_ms: i64,
}

impl Iterator for SplitRanges {
    type Item = PriceDataRange;

    fn next(&mut self) -> Option<PriceDataRange> {
        let rest = self.remaining.take()?;
        let chunk_end = rest.start.saturating_add(self.chunk_span_ms);
        if chunk_end >= rest.end {
            return Some(rest);
        }
        let chunk = PriceDataRange::new(rest.exchange.clone(), rest.pair.clone(), rest.start, chunk_end);
        self.remaining = Some(PriceDataRange::new(
            rest.exchange,
            rest.pair,
            chunk_end + self.step_ms,
            rest.end,
        ));
        Some(chunk)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::marketdata::resolution::parse_utc_ms;

    const MIN: i64 = 60_000;

    fn pair() -> SymbolPair {
        SymbolPair::new("BTC", "USDT")
    }

    fn minute_range(start_min: i64, end_min: i64) -> PriceDataRange {
        let base = parse_utc_ms("2024-01-01T00:00:00Z").unwrap();
        PriceDataRange::new("binance", pair(), base + start_min * MIN, base + end_min * MIN)
    }

    #[test]
    fn range_that_fits_is_returned_unchanged() {
        let range = minute_range(0, 9);
        let chunks: Vec<_> = split(TimeResolution::M1, range.clone(), 10).unwrap().collect();
        assert_eq!(chunks, vec![range]);
    }

    #[test]
    fn thirty_buckets_cap_ten_yields_three_exact_chunks() {
        let chunks: Vec<_> = split(TimeResolution::M1, minute_range(0, 29), 10)
            .unwrap()
            .collect();
        assert_eq!(
            chunks,
            vec![minute_range(0, 9), minute_range(10, 19), minute_range(20, 29)]
        );
    }

    #[test]
    fn final_chunk_may_be_shorter() {
        let chunks: Vec<_> = split(TimeResolution::M1, minute_range(0, 24), 10)
            .unwrap()
            .collect();
        assert_eq!(
            chunks,
            vec![minute_range(0, 9), minute_range(10, 19), minute_range(20, 24)]
        );
    }

    #[test]
    fn chunks_tile_the_input_exactly() {
        for (buckets, cap) in [(1, 1), (7, 3), (100, 7), (500, 500), (501, 500)] {
            let range = minute_range(0, buckets - 1);
            let chunks: Vec<_> = split(TimeResolution::M1, range.clone(), cap).unwrap().collect();

            let expected_chunks = (buckets + cap - 1) / cap;
            assert_eq!(chunks.len() as i64, expected_chunks, "buckets={buckets} cap={cap}");

            let mut expected_start = range.start;
            let mut total = 0;
            for chunk in &chunks {
                assert_eq!(chunk.start, expected_start, "gap or overlap at {chunk}");
                let count = chunk.bucket_count(TimeResolution::M1).unwrap();
                assert!(count <= cap);
                total += count;
                expected_start = chunk.end + MIN;
            }
            assert_eq!(total, buckets);
            assert_eq!(chunks.last().unwrap().end, range.end);
        }
    }

    #[test]
    fn calendar_resolutions_refuse_to_split() {
        assert!(split(TimeResolution::Mn1, minute_range(0, 9), 10).is_err());
        assert!(split(TimeResolution::W1, minute_range(0, 9), 10).is_err());
    }

    #[test]
    #[should_panic(expected = "must not exceed")]
    fn inverted_range_fails_loudly() {
        minute_range(10, 9);
    }
}
