//! Per-tier log of aggregated records.
//!
//! Rollup logs share the raw log's line format and locking rules. Two things
//! differ:
//!
//! - Rotation is gated on file size. Rollup files grow by one line per
//!   bucket (or per entity per bucket), so scanning them for expired lines on
//!   every processing run would be wasted work.
//! - Reads are range queries that default to the tier's full retention
//!   window and report whether the log exists at all.
//!
//! # Compressed tiers
//!
//! A tier flagged `compressed` is stored as `<file>.log.gz`. Every append
//! batch is written as its own gzip member under the exclusive lock, so an
//! append never rewrites earlier data; readers decode the concatenated
//! members with [`MultiGzDecoder`]. Rotation decompresses the whole file,
//! drops expired lines and writes the survivors back as a single member.
//! Because the file is already compressed, its size gate is smaller.
//!
//! A plain `<file>.log` left behind from before a tier was compressed is
//! still read, and is folded into the `.gz` file on the next append or
//! rotation.

use std::cmp::Ordering;
use std::fs::{self, OpenOptions};
use std::io::{self, BufRead, BufReader, Read, Write};
use std::path::{Path, PathBuf};

use flate2::Compression;
use flate2::read::MultiGzDecoder;
use flate2::write::GzEncoder;
use serde::Serialize;
use serde_json::Value;

use crate::error::{LogError, Result};
use crate::lock::{FileModeCache, LockMode, LockedFile, atomic_replace};
use crate::raw_log::{RotationStats, append_batch, append_bytes, format_batch, retain_since};
use crate::record::{RollupRecord, parse_line};
use crate::tier::Tier;

/// Size above which a rollup log is scanned for expired lines.
pub const DEFAULT_ROTATE_BYTES: u64 = 1024 * 1024;

/// Size above which a gzip-compressed rollup log is scanned.
pub const DEFAULT_COMPRESSED_ROTATE_BYTES: u64 = 100 * 1024;

/// Extension of compressed rollup logs.
pub const GZIP_EXTENSION: &str = "gz";

const GZIP_LEVEL: u32 = 6;

/// Inclusive time window of a range query.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Period {
    /// Earliest timestamp included.
    pub start: i64,
    /// Latest timestamp included.
    pub end: i64,
}

/// Result of a range query, serializable for HTTP consumers.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RangeResult {
    /// `false` when the log does not exist or could not be read.
    pub success: bool,
    /// Number of records in `data`.
    pub count: usize,
    /// Matching records, ascending by timestamp.
    pub data: Vec<RollupRecord>,
    /// Tier the records come from.
    pub tier: String,
    /// Window that was queried.
    pub period: Period,
    /// Why the query failed.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl RangeResult {
    pub(crate) fn failed(tier: &str, period: Period, error: impl Into<String>) -> Self {
        Self {
            success: false,
            count: 0,
            data: Vec::new(),
            tier: tier.to_string(),
            period,
            error: Some(error.into()),
        }
    }
}

/// Optional parameters of a range query.
#[derive(Default)]
pub struct RangeQuery<'a> {
    /// Window start; defaults to `end - retention`.
    pub start: Option<i64>,
    /// Window end; defaults to now.
    pub end: Option<i64>,
    /// Keeps only records for which this returns `true`.
    pub filter: Option<&'a dyn Fn(&RollupRecord) -> bool>,
    /// Field used to order records that share a timestamp, e.g. `hostname`.
    pub sort_key: Option<&'a str>,
}

impl<'a> RangeQuery<'a> {
    /// A query over `[start, end]`, either bound defaulting when `None`.
    pub fn between(start: Option<i64>, end: Option<i64>) -> Self {
        Self {
            start,
            end,
            ..Self::default()
        }
    }

    /// Adds a record filter.
    #[must_use]
    pub fn filtered(mut self, filter: &'a dyn Fn(&RollupRecord) -> bool) -> Self {
        self.filter = Some(filter);
        self
    }

    /// Orders records sharing a timestamp by `field`.
    #[must_use]
    pub fn sorted_by(mut self, field: &'a str) -> Self {
        self.sort_key = Some(field);
        self
    }
}

/// The rollup log of one tier of one stream.
#[derive(Debug)]
pub struct RollupLog {
    tier: Tier,
    path: PathBuf,
    rotate_bytes: u64,
    modes: FileModeCache,
}

impl RollupLog {
    /// Uses the log at `path` for `tier`.
    ///
    /// For a compressed tier `path` is the `.gz` file.
    pub fn new(tier: Tier, path: impl Into<PathBuf>) -> Self {
        let rotate_bytes = if tier.compressed {
            DEFAULT_COMPRESSED_ROTATE_BYTES
        } else {
            DEFAULT_ROTATE_BYTES
        };
        Self {
            tier,
            path: path.into(),
            rotate_bytes,
            modes: FileModeCache::default(),
        }
    }

    /// Sets the size above which rotation scans the file.
    #[must_use]
    pub fn with_rotate_bytes(mut self, bytes: u64) -> Self {
        self.rotate_bytes = bytes;
        self
    }

    /// Applies `mode` to the file once per process.
    #[must_use]
    pub fn with_file_mode(mut self, mode: Option<u32>) -> Self {
        self.modes = FileModeCache::new(mode);
        self
    }

    /// The tier this log stores.
    pub fn tier(&self) -> &Tier {
        &self.tier
    }

    /// Path of the log file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Whether the log is stored gzip-compressed.
    pub fn is_compressed(&self) -> bool {
        self.tier.compressed
    }

    /// Appends records as one batch. Returns `false` (and logs) on failure.
    pub fn append(&self, records: &[RollupRecord]) -> bool {
        match self.try_append(records) {
            Ok(()) => true,
            Err(e) => {
                tracing::warn!(tier = %self.tier.name, error = %e, "rollup append failed");
                false
            }
        }
    }

    /// Appends records as one batch, reporting the failure.
    ///
    /// # Errors
    ///
    /// Returns an error if a record cannot be serialized or the file cannot
    /// be locked or written.
    pub fn try_append(&self, records: &[RollupRecord]) -> Result<()> {
        if !self.tier.compressed {
            return append_batch(&self.path, records, &self.modes);
        }
        if records.is_empty() {
            return Ok(());
        }

        self.migrate()?;
        let batch = format_batch(records)?;
        let member = gzip(batch.as_bytes()).map_err(|source| LogError::Write {
            path: self.path.clone(),
            source,
        })?;
        append_bytes(&self.path, &member, &self.modes)
    }

    /// Folds a leftover uncompressed log into the compressed one.
    ///
    /// Returns whether a leftover was found and removed. Does nothing for
    /// uncompressed tiers.
    ///
    /// # Errors
    ///
    /// Returns an error if either file cannot be locked, read or written.
    /// The leftover is only removed once its lines are in the `.gz` file.
    pub fn migrate(&self) -> Result<bool> {
        let Some(legacy) = self.pending_migration() else {
            return Ok(false);
        };

        let mut options = OpenOptions::new();
        options.append(true).create(true);
        let mut guard = LockedFile::acquire(&self.path, &options, LockMode::Exclusive)?;

        // Another process may have migrated while we waited for the lock.
        let mut content = match fs::read(&legacy) {
            Ok(content) => content,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(false),
            Err(source) => return Err(LogError::Read { path: legacy, source }.into()),
        };

        let lines = content
            .split(|&b| b == b'\n')
            .filter(|line| !line.iter().all(u8::is_ascii_whitespace))
            .count();
        if lines > 0 {
            if !content.ends_with(b"\n") {
                content.push(b'\n');
            }
            let file = guard.file_mut();
            gzip(&content)
                .and_then(|member| file.write_all(&member))
                .and_then(|()| file.flush())
                .map_err(|source| LogError::Write {
                    path: self.path.clone(),
                    source,
                })?;
        }
        fs::remove_file(&legacy).map_err(|source| LogError::Write {
            path: legacy.clone(),
            source,
        })?;
        drop(guard);

        self.modes.ensure(&self.path);
        tracing::info!(
            tier = %self.tier.name,
            lines,
            from = %legacy.display(),
            "migrated rollup log to gzip"
        );
        Ok(true)
    }

    /// The uncompressed leftover of a compressed tier, if one exists.
    fn pending_migration(&self) -> Option<PathBuf> {
        if !self.tier.compressed {
            return None;
        }
        uncompressed_path(&self.path).filter(|legacy| legacy.exists())
    }

    /// Drops expired lines if the file has outgrown the size gate.
    ///
    /// Returns `None` when the file is absent or below the gate.
    pub fn rotate(&self, retention: std::time::Duration) -> Option<RotationStats> {
        self.rotate_at(retention, crate::unix_now())
    }

    /// Drops lines with `timestamp < now - retention` if the file has
    /// outgrown the size gate.
    ///
    /// Returns `None` when the file is absent, below the gate, or could not
    /// be rotated (logged).
    pub fn rotate_at(&self, retention: std::time::Duration, now: i64) -> Option<RotationStats> {
        match self.try_rotate_at(retention, now) {
            Ok(stats) => stats,
            Err(e) => {
                tracing::warn!(tier = %self.tier.name, error = %e, "rollup rotation failed");
                None
            }
        }
    }

    /// Size-gated rotation, reporting failures.
    ///
    /// # Errors
    ///
    /// Returns an error if the log cannot be locked, read or replaced.
    pub fn try_rotate_at(
        &self,
        retention: std::time::Duration,
        now: i64,
    ) -> Result<Option<RotationStats>> {
        self.migrate()?;
        let size = match fs::metadata(&self.path) {
            Ok(meta) => meta.len(),
            Err(_) => return Ok(None),
        };
        if size <= self.rotate_bytes {
            return Ok(None);
        }
        let cutoff = now.saturating_sub(i64::try_from(retention.as_secs()).unwrap_or(i64::MAX));

        let mut options = OpenOptions::new();
        options.read(true).write(true);
        let mut guard = LockedFile::acquire(&self.path, &options, LockMode::Exclusive)?;

        let read_err = |source| LogError::Read {
            path: self.path.clone(),
            source,
        };
        let mut content = Vec::new();
        if self.tier.compressed {
            MultiGzDecoder::new(guard.file())
                .read_to_end(&mut content)
                .map_err(read_err)?;
        } else {
            guard.file_mut().read_to_end(&mut content).map_err(read_err)?;
        }

        let (kept, stats) = retain_since(&content, cutoff);
        if stats.purged > 0 {
            let kept = if self.tier.compressed {
                gzip(&kept).map_err(|source| LogError::Write {
                    path: self.path.clone(),
                    source,
                })?
            } else {
                kept
            };
            atomic_replace(&self.path, &kept)?;
            self.modes.refresh(&self.path);
            tracing::info!(
                tier = %self.tier.name,
                purged = stats.purged,
                kept = stats.kept,
                "rotated rollup log"
            );
        }
        drop(guard);

        Ok(Some(stats))
    }

    /// Reads records in `[start, end]`, defaulting to the tier's retention
    /// window ending now.
    pub fn read_range(&self, start: Option<i64>, end: Option<i64>) -> RangeResult {
        self.query_at(&RangeQuery::between(start, end), crate::unix_now())
    }

    /// Runs a range query with `now` as the default window end.
    ///
    /// A missing log yields `success = false`; an existing log with nothing
    /// in the window yields `success = true, count = 0`.
    pub fn query_at(&self, query: &RangeQuery<'_>, now: i64) -> RangeResult {
        let end = query.end.unwrap_or(now);
        let start = query
            .start
            .unwrap_or_else(|| end.saturating_sub(self.tier.retention_secs()));
        let period = Period { start, end };

        if !self.path.exists() && self.pending_migration().is_none() {
            return RangeResult::failed(&self.tier.name, period, "rollup file not found");
        }

        match self.scan(period, query) {
            Ok(data) => RangeResult {
                success: true,
                count: data.len(),
                data,
                tier: self.tier.name.clone(),
                period,
                error: None,
            },
            Err(e) => {
                tracing::warn!(tier = %self.tier.name, error = %e, "rollup read failed");
                RangeResult::failed(&self.tier.name, period, e.to_string())
            }
        }
    }

    fn scan(&self, period: Period, query: &RangeQuery<'_>) -> Result<Vec<RollupRecord>> {
        let mut data = Vec::new();
        if let Some(legacy) = self.pending_migration() {
            scan_file(&legacy, false, period, query, &mut data)?;
        }
        if self.path.exists() {
            scan_file(&self.path, self.tier.compressed, period, query, &mut data)?;
        }

        match query.sort_key {
            Some(key) => data.sort_by(|a, b| {
                a.timestamp
                    .cmp(&b.timestamp)
                    .then_with(|| compare_field(a.get(key), b.get(key)))
            }),
            None => data.sort_by_key(|r| r.timestamp),
        }
        Ok(data)
    }
}

/// Strips the `.gz` extension from a compressed log path.
pub(crate) fn uncompressed_path(path: &Path) -> Option<PathBuf> {
    (path.extension()? == GZIP_EXTENSION).then(|| path.with_extension(""))
}

fn gzip(bytes: &[u8]) -> io::Result<Vec<u8>> {
    let mut encoder = GzEncoder::new(Vec::new(), Compression::new(GZIP_LEVEL));
    encoder.write_all(bytes)?;
    encoder.finish()
}

/// Collects records of `path` inside `period` that pass the query filter.
///
/// A damaged gzip tail ends the scan with the records decoded so far.
fn scan_file(
    path: &Path,
    compressed: bool,
    period: Period,
    query: &RangeQuery<'_>,
    data: &mut Vec<RollupRecord>,
) -> Result<()> {
    let mut options = OpenOptions::new();
    options.read(true);
    let guard = LockedFile::acquire(path, &options, LockMode::Shared)?;
    if compressed && guard.file().metadata().map_or(0, |m| m.len()) == 0 {
        return Ok(());
    }

    let reader: Box<dyn BufRead + '_> = if compressed {
        Box::new(BufReader::new(MultiGzDecoder::new(guard.file())))
    } else {
        Box::new(BufReader::new(guard.file()))
    };

    for line in reader.split(b'\n') {
        let line = match line {
            Ok(line) => line,
            Err(e) if compressed => {
                tracing::warn!(path = %path.display(), error = %e, "damaged gzip data, stopping read");
                break;
            }
            Err(source) => {
                return Err(LogError::Read {
                    path: path.to_path_buf(),
                    source,
                }
                .into());
            }
        };
        let Some(record) = std::str::from_utf8(&line).ok().and_then(parse_line) else {
            continue;
        };
        if record.timestamp < period.start || record.timestamp > period.end {
            continue;
        }
        if query.filter.is_none_or(|keep| keep(&record)) {
            data.push(record);
        }
    }
    drop(guard);
    Ok(())
}

fn compare_field(a: Option<&Value>, b: Option<&Value>) -> Ordering {
    match (a, b) {
        (Some(Value::Number(x)), Some(Value::Number(y))) => {
            let (x, y) = (x.as_f64().unwrap_or(0.0), y.as_f64().unwrap_or(0.0));
            x.total_cmp(&y)
        }
        (Some(Value::String(x)), Some(Value::String(y))) => x.cmp(y),
        (Some(x), Some(y)) => x.to_string().cmp(&y.to_string()),
        (Some(_), None) => Ordering::Less,
        (None, Some(_)) => Ordering::Greater,
        (None, None) => Ordering::Equal,
    }
}
