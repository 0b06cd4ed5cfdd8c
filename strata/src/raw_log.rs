//! Append-only raw sample log.
//!
//! Collectors append samples to one log per stream; the rollup processor
//! reads everything past its watermark; a retention rotation drops old
//! lines. All three may run in different processes at the same time.
//!
//! # Design
//!
//! - Appends serialize the whole batch first, then write it under one
//!   exclusive lock, so the lock is held only for the write syscall.
//! - Reads take a shared lock and scan line by line. When reading past a
//!   watermark, the `timestamp` is pulled out of each line textually and
//!   cold lines are skipped before any JSON is parsed.
//! - Rotation rewrites the file only when something is purged. The previous
//!   generation is preserved as `<file>.old` and the new content is renamed
//!   over the path, which therefore never disappears.
//!
//! Malformed lines are skipped, never fatal.

use std::fs::{self, OpenOptions};
use std::io::{BufRead, BufReader, Read, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{LogError, Result};
use crate::lock::{FileModeCache, LockMode, LockedFile, StagedFile, sibling_path};
use crate::record::{Record, Sample, extract_timestamp, format_line, parse_line};

/// Suffix of the previous-generation backup kept by rotation.
pub(crate) const BACKUP_SUFFIX: &str = ".old";

/// Outcome of a retention rotation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RotationStats {
    /// Lines removed.
    pub purged: usize,
    /// Lines retained.
    pub kept: usize,
}

/// The raw log of one metric stream.
#[derive(Debug)]
pub struct RawLog {
    path: PathBuf,
    backup: PathBuf,
    modes: FileModeCache,
}

impl RawLog {
    /// Opens the log at `path`. Nothing is created until the first append.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self::with_file_mode(path, None)
    }

    /// Opens the log, applying `mode` to the file once per process.
    pub fn with_file_mode(path: impl Into<PathBuf>, mode: Option<u32>) -> Self {
        let path = path.into();
        Self {
            backup: sibling_path(&path, BACKUP_SUFFIX),
            path,
            modes: FileModeCache::new(mode),
        }
    }

    /// Path of the log file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Path of the previous generation kept by rotation.
    pub fn backup_path(&self) -> &Path {
        &self.backup
    }

    /// Current size of the log in bytes, 0 if it does not exist.
    pub fn size(&self) -> u64 {
        fs::metadata(&self.path).map_or(0, |m| m.len())
    }

    /// Appends samples as one batch.
    ///
    /// Returns `false` (and logs) if the batch could not be written.
    pub fn append(&self, entries: &[Sample]) -> bool {
        match self.try_append(entries) {
            Ok(()) => true,
            Err(e) => {
                tracing::warn!(path = %self.path.display(), error = %e, "raw append failed");
                false
            }
        }
    }

    /// Appends samples as one batch, reporting the failure.
    ///
    /// # Errors
    ///
    /// Returns an error if a sample cannot be serialized, or if the file
    /// cannot be opened, locked or written.
    pub fn try_append(&self, entries: &[Sample]) -> Result<()> {
        append_batch(&self.path, entries, &self.modes)
    }

    /// Reads samples with `timestamp > since`, ascending.
    ///
    /// Pass `since = 0` to read everything. A missing file or a read failure
    /// yields an empty list.
    pub fn read(&self, since: i64) -> Vec<Sample> {
        self.read_filtered(since, |_| true)
    }

    /// Reads samples with `timestamp > since` that satisfy `filter`.
    pub fn read_filtered(&self, since: i64, filter: impl Fn(&Sample) -> bool) -> Vec<Sample> {
        match self.try_read(since, filter) {
            Ok(samples) => samples,
            Err(e) => {
                tracing::warn!(path = %self.path.display(), error = %e, "raw read failed");
                Vec::new()
            }
        }
    }

    /// Reads samples with `timestamp > since` that satisfy `filter`,
    /// reporting failures.
    ///
    /// # Errors
    ///
    /// Returns an error if the file exists but cannot be locked or read.
    pub fn try_read(&self, since: i64, filter: impl Fn(&Sample) -> bool) -> Result<Vec<Sample>> {
        if !self.path.exists() {
            return Ok(Vec::new());
        }

        let mut options = OpenOptions::new();
        options.read(true);
        let guard = LockedFile::acquire(&self.path, &options, LockMode::Shared)?;

        let mut samples = Vec::new();
        let mut malformed = 0usize;
        for line in BufReader::new(guard.file()).split(b'\n') {
            let line = line.map_err(|source| LogError::Read {
                path: self.path.clone(),
                source,
            })?;
            let Ok(line) = std::str::from_utf8(&line) else {
                malformed += 1;
                continue;
            };
            if line.trim().is_empty() {
                continue;
            }

            if since > 0
                && let Some(ts) = extract_timestamp(line)
                && ts <= since
            {
                continue;
            }

            let Some(sample) = parse_line(line) else {
                malformed += 1;
                continue;
            };
            if sample.timestamp <= since && since > 0 {
                continue;
            }
            if filter(&sample) {
                samples.push(sample);
            }
        }
        drop(guard);

        if malformed > 0 {
            tracing::debug!(path = %self.path.display(), malformed, "skipped malformed raw lines");
        }

        samples.sort_by_key(|s| s.timestamp);
        Ok(samples)
    }

    /// Drops lines older than `retention` relative to the current time.
    pub fn rotate(&self, retention: Duration) -> RotationStats {
        self.rotate_at(retention, crate::unix_now())
    }

    /// Drops lines with `timestamp < now - retention`.
    ///
    /// Returns zero counts (and logs) if the rotation could not complete; the
    /// log is left as it was in that case.
    pub fn rotate_at(&self, retention: Duration, now: i64) -> RotationStats {
        match self.try_rotate_at(retention, now) {
            Ok(stats) => stats,
            Err(e) => {
                tracing::warn!(path = %self.path.display(), error = %e, "raw rotation failed");
                RotationStats::default()
            }
        }
    }

    /// Drops lines with `timestamp < now - retention`, reporting failures.
    ///
    /// # Errors
    ///
    /// Returns an error if the log cannot be locked or read, or if the backup
    /// or the replacement cannot be written.
    pub fn try_rotate_at(&self, retention: Duration, now: i64) -> Result<RotationStats> {
        if !self.path.exists() {
            return Ok(RotationStats::default());
        }
        let cutoff = now.saturating_sub(i64::try_from(retention.as_secs()).unwrap_or(i64::MAX));

        let mut options = OpenOptions::new();
        options.read(true).write(true);
        let mut guard = LockedFile::acquire(&self.path, &options, LockMode::Exclusive)?;

        let mut content = Vec::new();
        guard
            .file_mut()
            .read_to_end(&mut content)
            .map_err(|source| LogError::Read {
                path: self.path.clone(),
                source,
            })?;

        let (kept, stats) = retain_since(&content, cutoff);

        if stats.purged == 0 {
            return Ok(stats);
        }

        self.write_backup()?;
        StagedFile::write(&self.path, &kept)?.commit()?;
        drop(guard);

        self.modes.refresh(&self.path);
        tracing::info!(
            path = %self.path.display(),
            purged = stats.purged,
            kept = stats.kept,
            "rotated raw log"
        );
        Ok(stats)
    }

    /// Replaces the backup with the current generation of the log.
    fn write_backup(&self) -> Result<()> {
        let backup_err = |source| LogError::Backup {
            path: self.path.clone(),
            backup: self.backup.clone(),
            source,
        };

        match fs::remove_file(&self.backup) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(backup_err(e).into()),
        }

        if fs::hard_link(&self.path, &self.backup).is_err() {
            fs::copy(&self.path, &self.backup).map_err(backup_err)?;
        }
        Ok(())
    }
}

/// Appends `entries` to the log at `path` under one exclusive lock.
pub(crate) fn append_batch(path: &Path, entries: &[Record], modes: &FileModeCache) -> Result<()> {
    if entries.is_empty() {
        return Ok(());
    }
    let batch = format_batch(entries)?;
    append_bytes(path, batch.as_bytes(), modes)
}

/// Serializes `entries` into consecutive log lines.
pub(crate) fn format_batch(entries: &[Record]) -> Result<String> {
    let mut batch = String::new();
    for entry in entries {
        let line = format_line(entry).map_err(|source| LogError::Serialize { source })?;
        batch.push_str(&line);
    }
    Ok(batch)
}

/// Writes `bytes` at the end of `path` with one call under an exclusive lock.
pub(crate) fn append_bytes(path: &Path, bytes: &[u8], modes: &FileModeCache) -> Result<()> {
    let mut options = OpenOptions::new();
    options.append(true).create(true);
    let mut guard = LockedFile::acquire(path, &options, LockMode::Exclusive)?;

    let file = guard.file_mut();
    file.write_all(bytes)
        .and_then(|()| file.flush())
        .map_err(|source| LogError::Write {
            path: path.to_path_buf(),
            source,
        })?;
    drop(guard);

    modes.ensure(path);
    Ok(())
}

/// Keeps the lines of `content` whose timestamp is at or after `cutoff`.
///
/// Lines without a readable timestamp are dropped; blank lines are ignored.
pub(crate) fn retain_since(content: &[u8], cutoff: i64) -> (Vec<u8>, RotationStats) {
    let mut kept = Vec::with_capacity(content.len());
    let mut stats = RotationStats::default();

    for line in content.split(|&b| b == b'\n') {
        if line.iter().all(u8::is_ascii_whitespace) {
            continue;
        }
        let fresh = std::str::from_utf8(line)
            .ok()
            .and_then(extract_timestamp)
            .is_some_and(|ts| ts >= cutoff);
        if fresh {
            kept.extend_from_slice(line);
            kept.push(b'\n');
            stats.kept += 1;
        } else {
            stats.purged += 1;
        }
    }

    (kept, stats)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn sample(ts: i64, latency: f64) -> Sample {
        Record::new(ts).with("latency", latency)
    }

    #[test]
    fn test_append_and_read() {
        let temp_dir = tempdir().unwrap();
        let log = RawLog::new(temp_dir.path().join("ping-metrics.log"));

        assert!(log.append(&[sample(1000, 10.0), sample(1030, 12.0)]));
        assert!(log.append(&[sample(1065, 14.0)]));

        let all = log.read(0);
        assert_eq!(all.len(), 3);
        assert_eq!(all[0].timestamp, 1000);
        assert_eq!(all[2].get_f64("latency"), Some(14.0));
    }

    #[test]
    fn test_read_missing_file_is_empty() {
        let temp_dir = tempdir().unwrap();
        let log = RawLog::new(temp_dir.path().join("absent.log"));
        assert!(log.read(0).is_empty());
        assert!(!log.path().exists());
    }

    #[test]
    fn test_read_since_is_exclusive() {
        let temp_dir = tempdir().unwrap();
        let log = RawLog::new(temp_dir.path().join("m.log"));
        log.append(&[sample(1000, 1.0), sample(1079, 2.0), sample(1080, 3.0)]);

        let newer = log.read(1079);
        assert_eq!(newer.len(), 1);
        assert_eq!(newer[0].timestamp, 1080);
    }

    #[test]
    fn test_read_sorts_and_filters() {
        let temp_dir = tempdir().unwrap();
        let log = RawLog::new(temp_dir.path().join("m.log"));
        log.append(&[
            sample(30, 1.0).with("host", "a"),
            sample(10, 2.0).with("host", "b"),
            sample(20, 3.0).with("host", "a"),
        ]);

        let only_a = log.read_filtered(0, |s| s.get_str("host") == Some("a"));
        let timestamps: Vec<i64> = only_a.iter().map(|s| s.timestamp).collect();
        assert_eq!(timestamps, vec![20, 30]);
    }

    #[test]
    fn test_read_skips_malformed_lines() {
        let temp_dir = tempdir().unwrap();
        let path = temp_dir.path().join("m.log");
        fs::write(
            &path,
            "[2026-01-01 00:00:00] {\"timestamp\":5,\"v\":1}\n\
             not json at all\n\
             {\"timestamp\":6,\"v\":2}\n\
             [2026-01-01 00:00:00] {\"timestamp\":7,\n\
             \n",
        )
        .unwrap();

        let log = RawLog::new(&path);
        let timestamps: Vec<i64> = log.read(0).iter().map(|s| s.timestamp).collect();
        assert_eq!(timestamps, vec![5, 6]);
    }

    #[test]
    fn test_append_empty_batch_creates_nothing() {
        let temp_dir = tempdir().unwrap();
        let log = RawLog::new(temp_dir.path().join("m.log"));
        assert!(log.append(&[]));
        assert!(!log.path().exists());
    }

    #[test]
    fn test_rotate_purges_old_lines() {
        let temp_dir = tempdir().unwrap();
        let log = RawLog::new(temp_dir.path().join("m.log"));
        log.append(&[sample(100, 1.0), sample(500, 2.0), sample(900, 3.0)]);

        let stats = log.rotate_at(Duration::from_secs(500), 1000);
        assert_eq!(stats, RotationStats { purged: 1, kept: 2 });

        let remaining: Vec<i64> = log.read(0).iter().map(|s| s.timestamp).collect();
        assert_eq!(remaining, vec![500, 900]);

        let backup = fs::read_to_string(log.backup_path()).unwrap();
        assert_eq!(backup.lines().count(), 3);
    }

    #[test]
    fn test_rotate_without_purge_leaves_file() {
        let temp_dir = tempdir().unwrap();
        let log = RawLog::new(temp_dir.path().join("m.log"));
        log.append(&[sample(900, 1.0)]);
        let before = fs::read(log.path()).unwrap();

        let stats = log.rotate_at(Duration::from_secs(500), 1000);
        assert_eq!(stats, RotationStats { purged: 0, kept: 1 });
        assert_eq!(fs::read(log.path()).unwrap(), before);
        assert!(!log.backup_path().exists());
    }

    #[test]
    fn test_rotate_drops_lines_without_timestamp() {
        let temp_dir = tempdir().unwrap();
        let path = temp_dir.path().join("m.log");
        fs::write(&path, "garbage\n{\"timestamp\":950}\n").unwrap();

        let log = RawLog::new(&path);
        let stats = log.rotate_at(Duration::from_secs(100), 1000);
        assert_eq!(stats, RotationStats { purged: 1, kept: 1 });
        assert_eq!(fs::read_to_string(&path).unwrap(), "{\"timestamp\":950}\n");
    }

    #[test]
    fn test_rotate_missing_file() {
        let temp_dir = tempdir().unwrap();
        let log = RawLog::new(temp_dir.path().join("m.log"));
        assert_eq!(log.rotate_at(Duration::from_secs(60), 1000), RotationStats::default());
    }

    #[test]
    fn test_append_after_rotation_lands_in_new_file() {
        let temp_dir = tempdir().unwrap();
        let log = RawLog::new(temp_dir.path().join("m.log"));
        log.append(&[sample(100, 1.0), sample(950, 2.0)]);
        log.rotate_at(Duration::from_secs(100), 1000);

        log.append(&[sample(990, 3.0)]);
        let remaining: Vec<i64> = log.read(0).iter().map(|s| s.timestamp).collect();
        assert_eq!(remaining, vec![950, 990]);
    }
}
