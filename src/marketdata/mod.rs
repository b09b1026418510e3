//! Market-data synchronization: bucket calendar, gap detection, range
//! chunking, the OHLCV store and the sync orchestrator that ties them to an
//! upstream exchange.

pub mod events;
pub mod exchange;
pub mod gaps;
pub mod range;
pub mod resolution;
pub mod store;
pub mod sync;
