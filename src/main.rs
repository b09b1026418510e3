//! Tradeloom scheduler tier: keeps the local OHLCV series consistent with
//! upstream and drives the recurring-task spooler. Exposes only a liveness
//! endpoint; everything interesting happens in background tasks.

use anyhow::{Context, Result};
use axum::{routing::get, Router};
use dotenv::dotenv;
use std::path::{Path, PathBuf};
use std::{sync::Arc, time::Duration};
use tokio::net::TcpListener;
use tower_http::cors::CorsLayer;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use tradeloom_backend::{
    marketdata::{
        events::PriceEventBus,
        exchange::{BinanceRest, ExchangeAdapter},
        store::PriceStore,
        sync::{SyncConfig, SyncOrchestrator},
    },
    models::Config,
    spooler::{
        handlers::{
            default_task_seeds, HealthCheckHandler, MarketRefreshHandler, PriceSyncHandler,
            TASK_HEALTH_CHECK, TASK_MARKET_REFRESH, TASK_PRICE_SYNC,
        },
        scheduler::Spooler,
        task_store::TaskStore,
    },
};

#[tokio::main]
async fn main() -> Result<()> {
    load_env();
    init_tracing();

    info!("🚀 Tradeloom scheduler tier starting");

    let config = Config::from_env().context("invalid configuration")?;
    let db_path = resolve_data_path(config.database_path.clone(), "tradeloom.db");

    let price_store = Arc::new(PriceStore::new(&db_path)?);
    let task_store = Arc::new(TaskStore::new(&db_path)?);
    task_store.seed_if_empty(&default_task_seeds())?;
    // A crash mid-run leaves the task's run latch set on disk; we are the
    // only writer, so anything still latched at boot is stale.
    task_store.recover_stale_latches()?;

    let adapter: Arc<dyn ExchangeAdapter> =
        Arc::new(BinanceRest::new(config.binance_base_url.clone())?);
    let events = PriceEventBus::default();

    let orchestrator = Arc::new(SyncOrchestrator::new(
        price_store.clone(),
        adapter.clone(),
        events.clone(),
        SyncConfig {
            watchlist: config.watchlist.clone(),
            resolution: config.sync_resolution,
            start_ms: config.sync_start_ms,
            max_fetches_per_run: config.max_fetches_per_run,
            excluded_buckets: Vec::new(),
        },
    ));

    info!(
        pairs = config.watchlist.len(),
        resolution = %config.sync_resolution,
        "📈 Sync engine configured"
    );

    // All handlers are registered before the spooler starts; a duplicate
    // name here aborts boot rather than surfacing at first fire.
    let mut spooler = Spooler::new(
        task_store.clone(),
        Duration::from_secs(config.spooler_refresh_secs),
    );
    spooler.register_handler(TASK_PRICE_SYNC, Arc::new(PriceSyncHandler::new(orchestrator)))?;
    spooler.register_handler(
        TASK_MARKET_REFRESH,
        Arc::new(MarketRefreshHandler::new(price_store.clone(), adapter)),
    )?;
    spooler.register_handler(
        TASK_HEALTH_CHECK,
        Arc::new(HealthCheckHandler::new(price_store.clone())),
    )?;
    let spooler = Arc::new(spooler);
    spooler.clone().start();

    // Liveness probe for the deployment platform; deliberately knows
    // nothing about task health.
    let app = Router::new()
        .route("/health", get(health_check))
        .layer(CorsLayer::permissive());

    let addr = format!("0.0.0.0:{}", config.port);
    let listener = TcpListener::bind(&addr).await?;
    info!("🎯 Liveness endpoint listening on {}", addr);

    let server = axum::serve(listener, app);
    tokio::select! {
        result = server => {
            result.context("Server error")?;
        }
        _ = tokio::signal::ctrl_c() => {
            info!("shutdown signal received");
        }
    }

    // Clear armed timers before exiting; in-flight handlers finish on
    // their own detached tasks.
    spooler.stop();
    Ok(())
}

async fn health_check() -> &'static str {
    "🚀 Tradeloom Operational"
}

/// Initialize tracing with enhanced observability
fn init_tracing() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "tradeloom_backend=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();
}

fn resolve_data_path(env_value: Option<String>, default_filename: &str) -> String {
    let base = PathBuf::from(env!("CARGO_MANIFEST_DIR"));
    let Some(raw) = env_value.filter(|v| !v.trim().is_empty()) else {
        return base.join(default_filename).to_string_lossy().to_string();
    };

    let p = PathBuf::from(raw);
    if p.is_absolute() {
        return p.to_string_lossy().to_string();
    }

    // Treat relative paths as relative to the crate directory, not the
    // caller's cwd, so running from elsewhere never creates a stray DB.
    base.join(p).to_string_lossy().to_string()
}

fn load_env() {
    // Standard dotenv search (cwd + parents), then the crate directory
    // (common when running with --manifest-path from elsewhere).
    let _ = dotenv();

    let manifest_dir = Path::new(env!("CARGO_MANIFEST_DIR"));
    let candidates = [manifest_dir.join(".env"), manifest_dir.join("../.env")];
    for p in candidates {
        if p.exists() {
            let _ = dotenv::from_path(&p);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn data_path_defaults_into_the_crate_directory() {
        let path = resolve_data_path(None, "tradeloom.db");
        assert!(Path::new(&path).is_absolute());
        assert!(path.ends_with("tradeloom.db"));
    }

    #[test]
    fn relative_data_path_is_anchored_to_the_crate_directory() {
        let path = resolve_data_path(Some("data/series.db".to_string()), "tradeloom.db");
        assert!(Path::new(&path).is_absolute());
        assert!(path.ends_with("data/series.db"));
    }

    #[test]
    fn absolute_data_path_is_used_verbatim() {
        let path = resolve_data_path(Some("/var/lib/tradeloom.db".to_string()), "tradeloom.db");
        assert_eq!(path, "/var/lib/tradeloom.db");
    }
}
