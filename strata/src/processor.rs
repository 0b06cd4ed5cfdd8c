//! Rollup processor: turns raw samples into per-tier bucket aggregates.
//!
//! Each tier is processed independently from the raw log. A run for one
//! tier:
//!
//! 1. Skips entirely if the tier ran less than one interval ago.
//! 2. Reads raw samples after the tier's `last_processed` watermark.
//! 3. Groups them into aligned buckets `[start, start + interval)` with
//!    `start = floor(ts / interval) * interval`.
//! 4. Aggregates every bucket that has closed (`end <= now - 1`) and lies
//!    after `last_bucket_end`. Open buckets wait for a later run.
//! 5. Appends the resulting records, advances the cursor, saves the state,
//!    and lets the rollup log rotate itself.
//!
//! # Design
//!
//! The current second is never treated as closed, because collectors may
//! still append samples stamped with it. After emitting, `last_processed`
//! is set to the newest emitted bucket end minus one. Raw reads exclude the
//! watermark itself, so a sample stamped exactly at that bucket end is read
//! by the next run and lands in the next bucket.
//!
//! Processors in different processes serialize on a lock file next to the
//! state file. A processor that finds the lock taken reports
//! [`TierOutcome::Busy`] and leaves the work to the holder. Together with
//! the watermark comparison this makes every run idempotent: a bucket is
//! emitted at most once no matter how often or from where the processor is
//! invoked.

use std::collections::BTreeMap;
use std::path::PathBuf;

use crate::aggregate::Aggregator;
use crate::error::{Result, TierError};
use crate::lock::{LockedFile, sibling_path};
use crate::raw_log::RawLog;
use crate::record::Sample;
use crate::rollup_log::RollupLog;
use crate::state::StateStore;
use crate::tier::{Tier, TierCatalog};

/// Suffix of the lock file serializing processing runs.
pub(crate) const RUN_LOCK_SUFFIX: &str = ".lock";

/// What a processing run did for one tier.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TierOutcome {
    /// The tier ran less than one interval ago; nothing was done.
    Throttled,
    /// Another processor holds the run lock; try again next cycle.
    Busy,
    /// No raw samples past the watermark.
    Idle,
    /// Samples were bucketed.
    Processed {
        /// Closed buckets that produced records.
        emitted_buckets: usize,
        /// Closed buckets the aggregator skipped.
        skipped_buckets: usize,
        /// Buckets still open, left for a later run.
        pending_buckets: usize,
        /// Rollup records appended.
        records: usize,
    },
}

impl TierOutcome {
    /// Number of rollup records appended by the run.
    pub fn records(&self) -> usize {
        match self {
            Self::Processed { records, .. } => *records,
            _ => 0,
        }
    }
}

/// Result of processing one tier within [`RollupProcessor::process_all_at`].
#[derive(Debug)]
pub struct TierRun {
    /// Tier name.
    pub tier: String,
    /// What happened, or why it failed.
    pub outcome: Result<TierOutcome>,
}

/// Drives rollups for every tier of one stream.
#[derive(Debug)]
pub struct RollupProcessor<'a> {
    raw: &'a RawLog,
    state: &'a StateStore,
    catalog: &'a TierCatalog,
    rollups: &'a [RollupLog],
    run_lock: PathBuf,
}

impl<'a> RollupProcessor<'a> {
    /// Creates a processor over a stream's files.
    ///
    /// # Arguments
    ///
    /// * `raw` - The stream's raw log
    /// * `state` - Where tier cursors are persisted
    /// * `catalog` - The stream's tiers
    /// * `rollups` - One rollup log per tier in `catalog`
    pub fn new(
        raw: &'a RawLog,
        state: &'a StateStore,
        catalog: &'a TierCatalog,
        rollups: &'a [RollupLog],
    ) -> Self {
        Self {
            raw,
            state,
            catalog,
            rollups,
            run_lock: sibling_path(state.path(), RUN_LOCK_SUFFIX),
        }
    }

    /// Processes one tier at the current time.
    ///
    /// # Errors
    ///
    /// See [`RollupProcessor::process_tier_at`].
    pub fn process_tier<A>(&self, tier: &str, aggregator: &A) -> Result<TierOutcome>
    where
        A: Aggregator + ?Sized,
    {
        self.process_tier_at(tier, aggregator, crate::unix_now())
    }

    /// Processes one tier as of `now` (epoch seconds).
    ///
    /// # Errors
    ///
    /// Returns [`TierError::UnknownTier`] if the tier is not in the catalog
    /// or has no rollup log, and an I/O error if the state, the raw log or
    /// the rollup log cannot be accessed. A failed rollup append leaves the
    /// cursor untouched, so the same buckets are retried next run.
    pub fn process_tier_at<A>(&self, tier: &str, aggregator: &A, now: i64) -> Result<TierOutcome>
    where
        A: Aggregator + ?Sized,
    {
        let tier = self.catalog.require(tier)?;
        let rollup = self.rollup_for(tier)?;

        let Some(_run) = LockedFile::try_exclusive(&self.run_lock)? else {
            tracing::debug!(tier = %tier.name, "another processor is running, skipping");
            return Ok(TierOutcome::Busy);
        };

        let mut state = self.state.try_load(self.catalog)?;
        let mut cursor = state.cursor(&tier.name);
        let interval = tier.interval_secs();

        if now.saturating_sub(cursor.last_rollup) < interval {
            return Ok(TierOutcome::Throttled);
        }

        let samples = self.raw.try_read(cursor.last_processed, |_| true)?;
        if samples.is_empty() {
            cursor.last_rollup = now;
            state.set_cursor(&tier.name, cursor);
            self.state.try_save(&state)?;
            return Ok(TierOutcome::Idle);
        }

        let cutoff = now.saturating_sub(1);
        let mut emitted_buckets = 0;
        let mut skipped_buckets = 0;
        let mut pending_buckets = 0;
        let mut latest_end = None;
        let mut records = Vec::new();

        for (start, bucket) in bucketize(samples, interval) {
            // A bucket whose end does not fit in an i64 can never close.
            let Some(end) = start.checked_add(interval) else {
                pending_buckets += 1;
                continue;
            };
            if end <= cursor.last_bucket_end {
                continue;
            }
            if end > cutoff {
                pending_buckets += 1;
                continue;
            }

            let produced = aggregator.aggregate(&bucket, start, interval).into_records();
            if produced.is_empty() {
                skipped_buckets += 1;
                continue;
            }
            emitted_buckets += 1;
            latest_end = latest_end.max(Some(end));
            records.extend(produced);
        }

        if let Some(end) = latest_end {
            rollup.try_append(&records)?;
            cursor.last_processed = end.saturating_sub(1);
            cursor.last_bucket_end = end;
        }
        cursor.last_rollup = now;
        state.set_cursor(&tier.name, cursor);
        self.state.try_save(&state)?;

        rollup.rotate_at(tier.retention, now);

        tracing::debug!(
            tier = %tier.name,
            emitted = emitted_buckets,
            skipped = skipped_buckets,
            pending = pending_buckets,
            records = records.len(),
            last_bucket_end = cursor.last_bucket_end,
            "rollup run complete"
        );

        Ok(TierOutcome::Processed {
            emitted_buckets,
            skipped_buckets,
            pending_buckets,
            records: records.len(),
        })
    }

    /// Processes every tier at the current time.
    pub fn process_all<A>(&self, aggregator: &A) -> Vec<TierRun>
    where
        A: Aggregator + ?Sized,
    {
        self.process_all_at(aggregator, crate::unix_now())
    }

    /// Processes every tier in catalog order as of `now`.
    ///
    /// A failing tier is logged and does not stop the others.
    pub fn process_all_at<A>(&self, aggregator: &A, now: i64) -> Vec<TierRun>
    where
        A: Aggregator + ?Sized,
    {
        self.catalog
            .iter()
            .map(|tier| {
                let outcome = self.process_tier_at(&tier.name, aggregator, now);
                if let Err(e) = &outcome {
                    tracing::warn!(tier = %tier.name, error = %e, "rollup run failed");
                }
                TierRun {
                    tier: tier.name.clone(),
                    outcome,
                }
            })
            .collect()
    }

    fn rollup_for(&self, tier: &Tier) -> Result<&'a RollupLog> {
        self.rollups
            .iter()
            .find(|log| log.tier().name == tier.name)
            .ok_or_else(|| {
                TierError::UnknownTier {
                    name: tier.name.clone(),
                }
                .into()
            })
    }
}

/// Groups samples by aligned bucket start, preserving their order.
///
/// Samples so close to `i64::MIN` that their bucket start underflows are
/// dropped.
fn bucketize(samples: Vec<Sample>, interval: i64) -> BTreeMap<i64, Vec<Sample>> {
    let mut buckets: BTreeMap<i64, Vec<Sample>> = BTreeMap::new();
    for sample in samples {
        let ts = sample.timestamp;
        let Some(start) = ts.checked_sub(ts.rem_euclid(interval)) else {
            tracing::debug!(timestamp = ts, "sample outside the bucketable range, dropping");
            continue;
        };
        buckets.entry(start).or_default().push(sample);
    }
    buckets
}
