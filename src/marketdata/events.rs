//! Fire-and-forget price-update publication.
//!
//! Every bar the sync pass normalizes is announced here, whether or not the
//! subsequent insert turned out to be a duplicate. Other roles (live
//! strategies, dashboards) subscribe best-effort; nobody listening is not an
//! error.

use tokio::sync::broadcast;
use tracing::trace;

use crate::marketdata::resolution::TimeResolution;
use crate::marketdata::store::PriceBar;

#[derive(Debug, Clone)]
pub struct PriceUpdateEvent {
    pub exchange: String,
    pub base: String,
    pub quote: String,
    pub resolution: TimeResolution,
    pub bar: PriceBar,
}

#[derive(Debug, Clone)]
pub struct PriceEventBus {
    tx: broadcast::Sender<PriceUpdateEvent>,
}

impl PriceEventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<PriceUpdateEvent> {
        self.tx.subscribe()
    }

    /// Non-blocking send; if no receivers or lagged, just drop.
    pub fn publish(&self, bar: &PriceBar) {
        let event = PriceUpdateEvent {
            exchange: bar.exchange.clone(),
            base: bar.base.clone(),
            quote: bar.quote.clone(),
            resolution: bar.resolution,
            bar: bar.clone(),
        };
        if let Err(e) = self.tx.send(event) {
            trace!("no active price update receivers: {}", e);
        }
    }
}

impl Default for PriceEventBus {
    fn default() -> Self {
        Self::new(1024)
    }
}
