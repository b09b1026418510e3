//! Upstream venue adapters.
//!
//! The orchestrator only ever sees [`ExchangeAdapter`]; ranges handed to
//! `fetch_candles` must already be pre-split to `max_candles_per_call`.

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use reqwest::Client;
use rust_decimal::Decimal;
use std::str::FromStr;
use std::time::Duration;

use crate::marketdata::range::PriceDataRange;
use crate::marketdata::resolution::TimeResolution;
use crate::marketdata::store::PriceBar;
use crate::models::{MarketDefinition, SymbolPair};

/// System-wide upstream batch bound. Binance allows up to 1000 klines per
/// call; we stay comfortably under it.
pub const MAX_CANDLES_PER_FETCH: i64 = 500;

#[async_trait]
pub trait ExchangeAdapter: Send + Sync {
    fn exchange_id(&self) -> &str;

    /// Upper bound on bars returned by one `fetch_candles` call.
    fn max_candles_per_call(&self) -> i64;

    /// Fetch the bars whose bucket starts lie in `range` (inclusive both
    /// sides). Returned bars are ascending by timestamp; timestamps are as
    /// reported by the venue and still need normalizing onto the bucket grid.
    async fn fetch_candles(
        &self,
        pair: &SymbolPair,
        res: TimeResolution,
        range: &PriceDataRange,
    ) -> Result<Vec<PriceBar>>;

    /// Current tradeable markets on the venue.
    async fn list_markets(&self) -> Result<Vec<MarketDefinition>>;
}

/// Binance spot REST adapter (public endpoints only).
pub struct BinanceRest {
    client: Client,
    base_url: String,
}

impl BinanceRest {
    pub fn new(base_url: String) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(30))
            .pool_max_idle_per_host(10)
            .pool_idle_timeout(Duration::from_secs(90))
            .build()
            .context("Failed to build Binance HTTP client")?;

        Ok(Self { client, base_url })
    }

    #[inline]
    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    fn interval(res: TimeResolution) -> Result<&'static str> {
        // Binance interval names happen to match our wire names except that
        // it has no 2s interval.
        match res {
            TimeResolution::S2 => Err(anyhow!("binance has no 2s kline interval")),
            other => Ok(other.as_str()),
        }
    }
}

#[async_trait]
impl ExchangeAdapter for BinanceRest {
    fn exchange_id(&self) -> &str {
        "binance"
    }

    fn max_candles_per_call(&self) -> i64 {
        MAX_CANDLES_PER_FETCH
    }

    async fn fetch_candles(
        &self,
        pair: &SymbolPair,
        res: TimeResolution,
        range: &PriceDataRange,
    ) -> Result<Vec<PriceBar>> {
        let url = self.url("/api/v3/klines");
        let symbol = format!("{}{}", pair.base, pair.quote);
        let qp = [
            ("symbol", symbol.clone()),
            ("interval", Self::interval(res)?.to_string()),
            ("startTime", range.start.to_string()),
            // Binance's endTime is inclusive of the last open time.
            ("endTime", range.end.to_string()),
            ("limit", MAX_CANDLES_PER_FETCH.to_string()),
        ];

        let resp = self
            .client
            .get(url)
            .query(&qp)
            .send()
            .await
            .with_context(|| format!("GET /api/v3/klines failed for {symbol}"))?;

        if !resp.status().is_success() {
            let status = resp.status();
            let text = resp.text().await.unwrap_or_default();
            return Err(anyhow!("GET /api/v3/klines {} {}: {}", symbol, status, text));
        }

        let rows: Vec<serde_json::Value> = resp
            .json()
            .await
            .context("Failed to parse klines response")?;

        let mut bars = Vec::with_capacity(rows.len());
        for row in rows {
            bars.push(parse_kline_row(self.exchange_id(), pair, res, &row)?);
        }
        Ok(bars)
    }

    async fn list_markets(&self) -> Result<Vec<MarketDefinition>> {
        #[derive(serde::Deserialize)]
        struct ExchangeInfo {
            symbols: Vec<ExchangeSymbol>,
        }
        #[derive(serde::Deserialize)]
        #[serde(rename_all = "camelCase")]
        struct ExchangeSymbol {
            base_asset: String,
            quote_asset: String,
            status: String,
        }

        let url = self.url("/api/v3/exchangeInfo");
        let resp = self
            .client
            .get(url)
            .send()
            .await
            .context("GET /api/v3/exchangeInfo failed")?;

        if !resp.status().is_success() {
            let status = resp.status();
            let text = resp.text().await.unwrap_or_default();
            return Err(anyhow!("GET /api/v3/exchangeInfo {}: {}", status, text));
        }

        let info: ExchangeInfo = resp
            .json()
            .await
            .context("Failed to parse exchangeInfo response")?;

        Ok(info
            .symbols
            .into_iter()
            .map(|s| MarketDefinition {
                exchange: self.exchange_id().to_string(),
                base: s.base_asset,
                quote: s.quote_asset,
                status: s.status,
            })
            .collect())
    }
}

/// A kline row is a heterogeneous array:
/// `[openTime, open, high, low, close, volume, closeTime, ...]`.
fn parse_kline_row(
    exchange: &str,
    pair: &SymbolPair,
    res: TimeResolution,
    row: &serde_json::Value,
) -> Result<PriceBar> {
    let arr = row
        .as_array()
        .ok_or_else(|| anyhow!("kline row is not an array: {row}"))?;
    if arr.len() < 6 {
        return Err(anyhow!("kline row too short: {row}"));
    }

    let open_time = arr[0]
        .as_i64()
        .ok_or_else(|| anyhow!("kline open time is not an integer: {}", arr[0]))?;

    let price = |idx: usize| -> Result<Decimal> {
        let s = arr[idx]
            .as_str()
            .ok_or_else(|| anyhow!("kline field {idx} is not a string: {}", arr[idx]))?;
        Decimal::from_str(s).with_context(|| format!("invalid kline decimal: {s:?}"))
    };

    Ok(PriceBar {
        exchange: exchange.to_string(),
        base: pair.base.clone(),
        quote: pair.quote.clone(),
        resolution: res,
        bucket_start: open_time,
        open: price(1)?,
        high: price(2)?,
        low: price(3)?,
        close: price(4)?,
        volume: price(5)?,
    })
}
