//! Crest Market: price estimation pipeline over the CREST client.
//!
//! This crate builds on `crest-core` to provide:
//! - Market order and history record parsing
//! - Trailing-week history averages and the history provider seam
//! - Realistic price estimation behind a pluggable price model
//! - Buffered, transactional persistence (JSONL commit log, in-memory store)
//! - Lazily loaded region and item names
//! - The market processor driving per-region history and price batches
//! - TOML configuration and CSV report export

pub mod config;
pub mod estimator;
pub mod history;
pub mod names;
pub mod orders;
pub mod persistence;
pub mod processor;
pub mod report;

pub use config::{AppConfig, AuthKind, CacheBackend, ConfigError, MarketConfig};
pub use estimator::{estimate, estimate_side, PriceEstimate, PriceModel, RealisticPrice, SideEstimate};
pub use history::{weekly_averages, HistoryProvider, HistoryRow, WeeklyAverages};
pub use names::{NameKind, NameLookup};
pub use orders::{OrderBook, OrderRecord, Side};
pub use persistence::{
    JsonlStore, MemoryStore, OperationBuffer, PersistenceOperation, PersistenceSink, Row,
    StoreError, Tables,
};
pub use processor::{MarketProcessor, ProcessError, RegionOutcome, RegionStatus, RunKind, RunSummary};
pub use report::{export_estimates_csv, latest_estimates, save_estimates_csv};
