// src/lib.rs
// Public library surface for the binary and integration tests.

pub mod config;
pub mod metrics;

// Storage
pub mod atomic;
pub mod hourly_log;
pub mod ledger;
pub mod timefmt;
pub mod trend_store;

// Pipeline
pub mod aggregate;
pub mod extract;
pub mod ingest;
pub mod report;
pub mod trends;

// Delivery
pub mod notify;

// ---- Re-exports for stable public API ----
pub use crate::aggregate::{aggregate, AggregationResult, WindowDefinition, TOTAL_SOURCE};
pub use crate::hourly_log::{HourlyCountLog, HourlyLogEntry};
pub use crate::ledger::DedupLedger;
pub use crate::trend_store::{SqliteTrendStore, StoreError, TrendStore};
