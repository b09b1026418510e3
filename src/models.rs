use anyhow::{anyhow, Context, Result};
use chrono::Utc;
use serde::{Deserialize, Serialize};

use crate::marketdata::resolution::TimeResolution;

/// A traded pair, e.g. `BTC-USDT`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SymbolPair {
    pub base: String,
    pub quote: String,
}

impl SymbolPair {
    pub fn new(base: impl Into<String>, quote: impl Into<String>) -> Self {
        Self {
            base: base.into().to_ascii_uppercase(),
            quote: quote.into().to_ascii_uppercase(),
        }
    }

    /// Parse `"BTC-USDT"`.
    pub fn parse(s: &str) -> Result<Self> {
        let (base, quote) = s
            .split_once('-')
            .ok_or_else(|| anyhow!("symbol pair must be BASE-QUOTE, got {s:?}"))?;
        if base.trim().is_empty() || quote.trim().is_empty() {
            return Err(anyhow!("symbol pair must be BASE-QUOTE, got {s:?}"));
        }
        Ok(Self::new(base.trim(), quote.trim()))
    }
}

impl std::fmt::Display for SymbolPair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}-{}", self.base, self.quote)
    }
}

/// A locally registered symbol (one leg of a pair).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SymbolDefinition {
    pub code: String,
    pub name: String,
}

/// A tradeable market as reported by the upstream venue.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MarketDefinition {
    pub exchange: String,
    pub base: String,
    pub quote: String,
    pub status: String,
}

/// Metrics returned by one sync-orchestrator pass; persisted as the
/// price-sync task's opaque state so the last pass is inspectable in the DB.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SyncSummary {
    pub exchanges: usize,
    pub pairs_considered: usize,
    pub symbols_considered: usize,
    pub symbols_registered: usize,
    pub chunks_synced: usize,
    pub chunks_failed: usize,
    pub bars_inserted: usize,
}

/// Application configuration
#[derive(Debug, Clone)]
pub struct Config {
    /// Explicit DB location; `None` falls back to the crate-directory
    /// default chosen by the binary.
    pub database_path: Option<String>,
    pub port: u16,
    pub watchlist: Vec<SymbolPair>,
    pub sync_resolution: TimeResolution,
    pub sync_start_ms: i64,
    pub max_fetches_per_run: usize,
    pub spooler_refresh_secs: u64,
    pub binance_base_url: String,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        dotenv::dotenv().ok();

        let database_path = std::env::var("DATABASE_PATH")
            .ok()
            .filter(|v| !v.trim().is_empty());

        let port = std::env::var("PORT")
            .unwrap_or_else(|_| "8080".to_string())
            .parse()
            .unwrap_or(8080);

        let watchlist = std::env::var("WATCHLIST")
            .unwrap_or_else(|_| "BTC-USDT,ETH-USDT".to_string())
            .split(',')
            .filter(|s| !s.trim().is_empty())
            .map(SymbolPair::parse)
            .collect::<Result<Vec<_>>>()
            .context("invalid WATCHLIST")?;

        let sync_resolution = TimeResolution::parse(
            std::env::var("SYNC_RESOLUTION")
                .unwrap_or_else(|_| "1m".to_string())
                .trim(),
        )
        .context("invalid SYNC_RESOLUTION")?;

        // How far back the series is kept consistent. Absolute start wins
        // over the relative backfill window when both are set.
        let sync_start_ms = match std::env::var("SYNC_START").ok().filter(|v| !v.is_empty()) {
            Some(raw) => crate::marketdata::resolution::parse_utc_ms(&raw)
                .context("invalid SYNC_START (want RFC3339)")?,
            None => {
                let days = std::env::var("SYNC_BACKFILL_DAYS")
                    .ok()
                    .and_then(|v| v.parse::<i64>().ok())
                    .filter(|&d| d > 0)
                    .unwrap_or(7);
                Utc::now().timestamp_millis() - days * 86_400_000
            }
        };

        let max_fetches_per_run = std::env::var("SYNC_MAX_FETCHES")
            .ok()
            .and_then(|v| v.parse::<usize>().ok())
            .filter(|&v| v > 0)
            .unwrap_or(60);

        let spooler_refresh_secs = std::env::var("SPOOLER_REFRESH_SECS")
            .ok()
            .and_then(|v| v.parse::<u64>().ok())
            .filter(|&v| v > 0)
            .unwrap_or(5);

        let binance_base_url = std::env::var("BINANCE_BASE_URL")
            .unwrap_or_else(|_| "https://api.binance.com".to_string());

        Ok(Self {
            database_path,
            port,
            watchlist,
            sync_resolution,
            sync_start_ms,
            max_fetches_per_run,
            spooler_refresh_secs,
            binance_base_url,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_symbol_pairs() {
        let pair = SymbolPair::parse("btc-usdt").unwrap();
        assert_eq!(pair, SymbolPair::new("BTC", "USDT"));
        assert_eq!(pair.to_string(), "BTC-USDT");
        assert!(SymbolPair::parse("BTCUSDT").is_err());
        assert!(SymbolPair::parse("-USDT").is_err());
    }
}
