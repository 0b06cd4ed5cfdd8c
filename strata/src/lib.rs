//! # strata
//!
//! File-backed time-series rollup engine.
//!
//! strata ingests raw timestamped samples into append-only JSON line logs,
//! periodically downsamples them into coarser, longer-retained tiers, rotates
//! storage to bound disk growth, and serves time-range queries. Everything
//! lives in plain files shared between independent processes: collectors
//! append, a rollup driver aggregates, HTTP handlers read.
//!
//! ## Key Properties
//!
//! - Each time bucket is aggregated at most once, however often and from
//!   however many processes the rollup is invoked
//! - Readers never observe a partially rewritten file
//! - Storage is bounded by retention, and recent high-resolution data is
//!   never dropped by rotation
//! - No background threads: the caller owns the clock and the cadence
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use strata::{FieldSummary, MetricStream, Record, StreamConfig};
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let stream = MetricStream::open(StreamConfig::new("ping", "./metrics"))?;
//!
//! stream.append(&[
//!     Record::new(1_700_000_000).with("latency", 10.0).with("hostname", "gw"),
//!     Record::new(1_700_000_030).with("latency", 12.0).with("hostname", "gw"),
//! ]);
//!
//! let summary = FieldSummary::new(["latency"]).grouped_by("hostname");
//! stream.process_all(&summary);
//!
//! let last_day = stream.read_range("5min", None, None);
//! for record in &last_day.data {
//!     println!("{}: {:?}", record.timestamp, record.get_f64("avg_latency"));
//! }
//! # Ok(())
//! # }
//! ```
//!
//! ## Architecture
//!
//! - [`MetricStream`] - A configured stream bound to its files
//! - [`RawLog`] - Append-only raw sample log with retention rotation
//! - [`RollupProcessor`] - Buckets raw samples per tier, exactly once
//! - [`RollupLog`] - Per-tier aggregate log with range queries, optionally gzip-compressed
//! - [`StateStore`] - Durable per-tier cursors
//! - [`TierCatalog`] - Tier definitions and query tier selection
//!
//! ## Modules
//!
//! - [`lock`] - Advisory file locks and atomic replacement
//! - [`record`] - Log line envelope
//! - [`aggregate`] - Aggregator trait and stock field summaries
//! - [`stats`] - Latency, jitter and quality helpers
//! - [`config`] - Stream and engine configuration
//! - [`error`] - Error types

pub mod aggregate;
pub mod config;
pub mod error;
pub mod lock;
pub mod processor;
pub mod raw_log;
pub mod record;
pub mod rollup_log;
pub mod state;
pub mod stats;
pub mod stream;
pub mod tier;

// Re-export primary API types at crate root for convenience.
pub use aggregate::{Aggregate, Aggregator, ConsolidationFn, FieldSummary};
pub use config::{EngineConfig, StreamConfig};
pub use error::{Result, StrataError};
pub use processor::{RollupProcessor, TierOutcome, TierRun};
pub use raw_log::{RawLog, RotationStats};
pub use record::{Record, RollupRecord, Sample};
pub use rollup_log::{Period, RangeQuery, RangeResult, RollupLog};
pub use state::{RollupCursor, RollupState, StateStore};
pub use stream::{MetricStream, StreamInfo};
pub use tier::{Tier, TierCatalog, TierInfo};

/// Current wall-clock time in epoch seconds.
pub fn unix_now() -> i64 {
    chrono::Utc::now().timestamp()
}
