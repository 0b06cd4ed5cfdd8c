//! A configured metric stream: its raw log, state, tiers and rollup logs.
//!
//! [`MetricStream`] is the entry point collectors, rollup drivers and query
//! handlers use. It derives every file path from a [`StreamConfig`] and
//! forwards to the lower-level types, so callers never assemble paths or
//! processors by hand.
//!
//! # Example
//!
//! ```rust,no_run
//! use strata::aggregate::FieldSummary;
//! use strata::config::StreamConfig;
//! use strata::record::Record;
//! use strata::stream::MetricStream;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let stream = MetricStream::open(StreamConfig::new("ping", "/var/lib/strata"))?;
//!
//! // Collector side
//! stream.append(&[Record::new(1_700_000_000).with("latency", 12.4)]);
//!
//! // Rollup driver, invoked on a cadence
//! let summary = FieldSummary::new(["latency"]).with_precision(3);
//! for run in stream.process_all(&summary) {
//!     println!("{}: {:?}", run.tier, run.outcome);
//! }
//!
//! // Query side: last 24 hours from whichever tier fits
//! let result = stream.read_best(24.0);
//! println!("{} records from {}", result.count, result.tier);
//! # Ok(())
//! # }
//! ```

use std::fs;
use std::path::PathBuf;

use serde::Serialize;

use crate::aggregate::{Aggregator, FieldSummary};
use crate::config::StreamConfig;
use crate::error::{LogError, Result};
use crate::processor::{RollupProcessor, TierOutcome, TierRun};
use crate::raw_log::{RawLog, RotationStats};
use crate::record::Sample;
use crate::rollup_log::{Period, RangeQuery, RangeResult, RollupLog};
use crate::state::{RollupState, StateStore};
use crate::tier::{TierCatalog, TierInfo};

/// Diagnostic snapshot of a stream.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StreamInfo {
    /// Stream name.
    pub name: String,
    /// Raw log path.
    pub raw_path: PathBuf,
    /// Raw log size in bytes.
    pub raw_size: u64,
    /// Raw retention in seconds.
    pub raw_retention: u64,
    /// Per-tier metadata and rollup file state.
    pub tiers: Vec<TierInfo>,
    /// Stored cursors, if the state file is readable.
    pub cursors: Option<RollupState>,
}

/// One metric stream bound to its files.
#[derive(Debug)]
pub struct MetricStream {
    config: StreamConfig,
    raw: RawLog,
    state: StateStore,
    rollups: Vec<RollupLog>,
}

impl MetricStream {
    /// Validates `config` and creates its data directory if needed.
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration is invalid or the directory
    /// cannot be created.
    pub fn open(config: StreamConfig) -> Result<Self> {
        config.validate()?;
        fs::create_dir_all(&config.data_dir).map_err(|source| LogError::Write {
            path: config.data_dir.clone(),
            source,
        })?;

        let raw = RawLog::with_file_mode(config.raw_path(), config.file_mode);
        let state = StateStore::new(config.state_path());
        let rollups = config
            .tiers
            .iter()
            .map(|tier| {
                RollupLog::new(tier.clone(), config.rollup_path(tier))
                    .with_rotate_bytes(config.rotate_bytes(tier))
                    .with_file_mode(config.file_mode)
            })
            .collect();

        Ok(Self {
            config,
            raw,
            state,
            rollups,
        })
    }

    /// Stream name.
    pub fn name(&self) -> &str {
        &self.config.name
    }

    /// The configuration the stream was opened with.
    pub fn config(&self) -> &StreamConfig {
        &self.config
    }

    /// The stream's tiers.
    pub fn catalog(&self) -> &TierCatalog {
        &self.config.tiers
    }

    /// The configured aggregator, if any.
    pub fn aggregator(&self) -> Option<&FieldSummary> {
        self.config.aggregate.as_ref()
    }

    /// The raw log.
    pub fn raw(&self) -> &RawLog {
        &self.raw
    }

    /// The state file.
    pub fn state(&self) -> &StateStore {
        &self.state
    }

    /// The rollup log of `tier`.
    pub fn rollup(&self, tier: &str) -> Option<&RollupLog> {
        self.rollups.iter().find(|log| log.tier().name == tier)
    }

    /// Appends samples to the raw log.
    pub fn append(&self, samples: &[Sample]) -> bool {
        self.raw.append(samples)
    }

    /// Reads raw samples after `since`.
    pub fn read_raw(&self, since: i64) -> Vec<Sample> {
        self.raw.read(since)
    }

    /// Applies the raw retention as of now.
    pub fn rotate_raw(&self) -> RotationStats {
        self.raw.rotate(self.config.raw_retention)
    }

    /// Applies the raw retention as of `now`.
    pub fn rotate_raw_at(&self, now: i64) -> RotationStats {
        self.raw.rotate_at(self.config.raw_retention, now)
    }

    /// A processor over this stream's files.
    pub fn processor(&self) -> RollupProcessor<'_> {
        RollupProcessor::new(&self.raw, &self.state, &self.config.tiers, &self.rollups)
    }

    /// Processes one tier now.
    ///
    /// # Errors
    ///
    /// See [`RollupProcessor::process_tier_at`].
    pub fn process_tier<A>(&self, tier: &str, aggregator: &A) -> Result<TierOutcome>
    where
        A: Aggregator + ?Sized,
    {
        self.processor().process_tier(tier, aggregator)
    }

    /// Processes one tier as of `now`.
    ///
    /// # Errors
    ///
    /// See [`RollupProcessor::process_tier_at`].
    pub fn process_tier_at<A>(&self, tier: &str, aggregator: &A, now: i64) -> Result<TierOutcome>
    where
        A: Aggregator + ?Sized,
    {
        self.processor().process_tier_at(tier, aggregator, now)
    }

    /// Processes every tier now.
    pub fn process_all<A>(&self, aggregator: &A) -> Vec<TierRun>
    where
        A: Aggregator + ?Sized,
    {
        self.processor().process_all(aggregator)
    }

    /// Processes every tier as of `now`.
    pub fn process_all_at<A>(&self, aggregator: &A, now: i64) -> Vec<TierRun>
    where
        A: Aggregator + ?Sized,
    {
        self.processor().process_all_at(aggregator, now)
    }

    /// Reads `tier` over `[start, end]`, defaulting to its retention window.
    pub fn read_range(&self, tier: &str, start: Option<i64>, end: Option<i64>) -> RangeResult {
        self.query_at(tier, &RangeQuery::between(start, end), crate::unix_now())
    }

    /// Runs a range query against `tier` with `now` as the default end.
    ///
    /// An unknown tier yields a failed result.
    pub fn query_at(&self, tier: &str, query: &RangeQuery<'_>, now: i64) -> RangeResult {
        match self.rollup(tier) {
            Some(log) => log.query_at(query, now),
            None => {
                let end = query.end.unwrap_or(now);
                let period = Period {
                    start: query.start.unwrap_or(end),
                    end,
                };
                RangeResult::failed(tier, period, format!("unknown tier '{tier}'"))
            }
        }
    }

    /// Reads the last `hours` from the tier best suited to that span.
    pub fn read_best(&self, hours: f64) -> RangeResult {
        self.read_best_at(hours, crate::unix_now())
    }

    /// Reads `[now - hours, now]` from the tier best suited to that span.
    #[allow(clippy::cast_possible_truncation)]
    pub fn read_best_at(&self, hours: f64, now: i64) -> RangeResult {
        let span = if hours.is_finite() && hours > 0.0 {
            (hours * 3600.0).round() as i64
        } else {
            0
        };
        let query = RangeQuery::between(Some(now.saturating_sub(span)), Some(now));
        match self.config.tiers.best_tier_for_range(hours) {
            Some(tier) => self.query_at(&tier.name, &query, now),
            None => RangeResult::failed("", Period { start: now, end: now }, "no tiers"),
        }
    }

    /// Reports the stream's files and cursors without modifying anything.
    pub fn describe(&self) -> StreamInfo {
        StreamInfo {
            name: self.config.name.clone(),
            raw_path: self.raw.path().to_path_buf(),
            raw_size: self.raw.size(),
            raw_retention: self.config.raw_retention.as_secs(),
            tiers: self
                .config
                .tiers
                .describe(|tier| self.config.rollup_path(tier)),
            cursors: self.state.peek(),
        }
    }
}
