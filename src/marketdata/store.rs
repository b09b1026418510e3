//! SQLite-backed OHLCV price store and symbol registry.
//!
//! Bars are immutable once written: the primary key is the full
//! `(exchange, base, quote, resolution, bucket_start)` identity and inserts
//! are `INSERT OR IGNORE`, so re-syncing an already-filled range is a no-op
//! rather than an error. Prices are stored as decimal TEXT, never floats.

use anyhow::{Context, Result};
use parking_lot::Mutex;
use rusqlite::{params, Connection, OpenFlags};
use rust_decimal::Decimal;
use std::str::FromStr;
use std::sync::Arc;
use tracing::{info, warn};

use crate::marketdata::resolution::TimeResolution;
use crate::models::{MarketDefinition, SymbolDefinition, SymbolPair};

const SCHEMA_SQL: &str = r#"
PRAGMA journal_mode = WAL;
PRAGMA synchronous = NORMAL;
PRAGMA cache_size = -64000;  -- 64MB cache
PRAGMA temp_store = MEMORY;

CREATE TABLE IF NOT EXISTS symbols (
    code TEXT PRIMARY KEY,
    name TEXT NOT NULL,
    registered_at INTEGER NOT NULL
) WITHOUT ROWID;

CREATE TABLE IF NOT EXISTS markets (
    exchange TEXT NOT NULL,
    base TEXT NOT NULL,
    quote TEXT NOT NULL,
    status TEXT NOT NULL,
    refreshed_at INTEGER NOT NULL,
    PRIMARY KEY (exchange, base, quote)
) WITHOUT ROWID;

CREATE TABLE IF NOT EXISTS price_bars (
    exchange TEXT NOT NULL,
    base TEXT NOT NULL,
    quote TEXT NOT NULL,
    resolution TEXT NOT NULL,
    bucket_start INTEGER NOT NULL,
    open TEXT NOT NULL,
    high TEXT NOT NULL,
    low TEXT NOT NULL,
    close TEXT NOT NULL,
    volume TEXT NOT NULL,
    PRIMARY KEY (exchange, base, quote, resolution, bucket_start)
) WITHOUT ROWID;
"#;

/// One OHLCV bar, keyed by its bucket-start timestamp.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PriceBar {
    pub exchange: String,
    pub base: String,
    pub quote: String,
    pub resolution: TimeResolution,
    pub bucket_start: i64,
    pub open: Decimal,
    pub high: Decimal,
    pub low: Decimal,
    pub close: Decimal,
    pub volume: Decimal,
}

pub struct PriceStore {
    conn: Arc<Mutex<Connection>>,
}

impl PriceStore {
    pub fn new(db_path: &str) -> Result<Self> {
        let flags = OpenFlags::SQLITE_OPEN_READ_WRITE
            | OpenFlags::SQLITE_OPEN_CREATE
            | OpenFlags::SQLITE_OPEN_NO_MUTEX; // We handle our own locking

        let conn = Connection::open_with_flags(db_path, flags)
            .with_context(|| format!("Failed to open database at {}", db_path))?;

        conn.execute_batch(SCHEMA_SQL)
            .context("Failed to initialize price store schema")?;

        let journal_mode: String = conn
            .query_row("PRAGMA journal_mode", [], |row| row.get(0))
            .unwrap_or_default();
        if journal_mode.to_lowercase() != "wal" {
            warn!("WAL mode not active, journal_mode = {}", journal_mode);
        }

        let bars: i64 = conn
            .query_row("SELECT COUNT(*) FROM price_bars", [], |row| row.get(0))
            .unwrap_or(0);
        info!("📊 Price store initialized at: {} ({} bars)", db_path, bars);

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Idempotent batch insert; returns how many rows were actually new.
    pub fn insert_bars(&self, bars: &[PriceBar]) -> Result<usize> {
        if bars.is_empty() {
            return Ok(0);
        }

        let mut conn = self.conn.lock();
        let tx = conn.transaction().context("begin insert_bars tx")?;
        let mut inserted = 0usize;
        {
            let mut stmt = tx.prepare_cached(
                "INSERT OR IGNORE INTO price_bars
                 (exchange, base, quote, resolution, bucket_start, open, high, low, close, volume)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
            )?;
            for bar in bars {
                inserted += stmt.execute(params![
                    bar.exchange,
                    bar.base,
                    bar.quote,
                    bar.resolution.as_str(),
                    bar.bucket_start,
                    bar.open.to_string(),
                    bar.high.to_string(),
                    bar.low.to_string(),
                    bar.close.to_string(),
                    bar.volume.to_string(),
                ])?;
            }
        }
        tx.commit().context("commit insert_bars tx")?;
        Ok(inserted)
    }

    /// All bars for a key with bucket_start in `[start, end]`, ascending.
    pub fn query_range(
        &self,
        exchange: &str,
        pair: &SymbolPair,
        res: TimeResolution,
        start: i64,
        end: i64,
    ) -> Result<Vec<PriceBar>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare_cached(
            "SELECT bucket_start, open, high, low, close, volume FROM price_bars
             WHERE exchange = ?1 AND base = ?2 AND quote = ?3 AND resolution = ?4
               AND bucket_start BETWEEN ?5 AND ?6
             ORDER BY bucket_start ASC",
        )?;

        let rows = stmt.query_map(
            params![exchange, pair.base, pair.quote, res.as_str(), start, end],
            |row| {
                Ok((
                    row.get::<_, i64>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, String>(3)?,
                    row.get::<_, String>(4)?,
                    row.get::<_, String>(5)?,
                ))
            },
        )?;

        let mut bars = Vec::new();
        for row in rows {
            let (bucket_start, open, high, low, close, volume) = row?;
            bars.push(PriceBar {
                exchange: exchange.to_string(),
                base: pair.base.clone(),
                quote: pair.quote.clone(),
                resolution: res,
                bucket_start,
                open: parse_price(&open)?,
                high: parse_price(&high)?,
                low: parse_price(&low)?,
                close: parse_price(&close)?,
                volume: parse_price(&volume)?,
            });
        }
        Ok(bars)
    }

    /// Only the bucket-start timestamps in `[start, end]`, ascending.
    /// The gap walker needs nothing more, so skip decoding the prices.
    pub fn bucket_starts_in_range(
        &self,
        exchange: &str,
        pair: &SymbolPair,
        res: TimeResolution,
        start: i64,
        end: i64,
    ) -> Result<Vec<i64>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare_cached(
            "SELECT bucket_start FROM price_bars
             WHERE exchange = ?1 AND base = ?2 AND quote = ?3 AND resolution = ?4
               AND bucket_start BETWEEN ?5 AND ?6
             ORDER BY bucket_start ASC",
        )?;
        let rows = stmt.query_map(
            params![exchange, pair.base, pair.quote, res.as_str(), start, end],
            |row| row.get::<_, i64>(0),
        )?;
        let mut out = Vec::new();
        for ts in rows {
            out.push(ts?);
        }
        Ok(out)
    }

    pub fn bar_count(&self) -> Result<i64> {
        let conn = self.conn.lock();
        conn.query_row("SELECT COUNT(*) FROM price_bars", [], |row| row.get(0))
            .context("count price_bars")
    }

    // ---- symbol registry ----

    pub fn is_known_symbol(&self, code: &str) -> Result<bool> {
        let conn = self.conn.lock();
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM symbols WHERE code = ?1",
            params![code],
            |row| row.get(0),
        )?;
        Ok(count > 0)
    }

    /// Idempotent: registering an already-known symbol is skipped, never an
    /// error. Returns true when the symbol was actually new.
    pub fn register_symbol(&self, def: &SymbolDefinition, now_ms: i64) -> Result<bool> {
        let conn = self.conn.lock();
        let changed = conn.execute(
            "INSERT OR IGNORE INTO symbols (code, name, registered_at) VALUES (?1, ?2, ?3)",
            params![def.code, def.name, now_ms],
        )?;
        Ok(changed > 0)
    }

    pub fn symbol_count(&self) -> Result<i64> {
        let conn = self.conn.lock();
        conn.query_row("SELECT COUNT(*) FROM symbols", [], |row| row.get(0))
            .context("count symbols")
    }

    // ---- market definitions ----

    pub fn upsert_markets(&self, markets: &[MarketDefinition], now_ms: i64) -> Result<usize> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction().context("begin upsert_markets tx")?;
        {
            let mut stmt = tx.prepare_cached(
                "INSERT OR REPLACE INTO markets (exchange, base, quote, status, refreshed_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
            )?;
            for m in markets {
                stmt.execute(params![m.exchange, m.base, m.quote, m.status, now_ms])?;
            }
        }
        tx.commit().context("commit upsert_markets tx")?;
        Ok(markets.len())
    }

    pub fn market_count(&self) -> Result<i64> {
        let conn = self.conn.lock();
        conn.query_row("SELECT COUNT(*) FROM markets", [], |row| row.get(0))
            .context("count markets")
    }
}

fn parse_price(s: &str) -> Result<Decimal> {
    Decimal::from_str(s).with_context(|| format!("invalid stored decimal: {s:?}"))
}
