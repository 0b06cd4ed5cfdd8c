//! Integration tests for retention rotation.
//!
//! Rotation rewrites logs that collectors and readers may be using at the
//! same moment. These tests check that recent data always survives, that a
//! rotation interrupted before its rename leaves the log intact, and that
//! appends racing a rotation are not lost.

use std::fs;
use std::time::Duration;

use strata::lock::StagedFile;
use strata::raw_log::{RawLog, RotationStats};
use strata::record::{Record, Sample};
use strata::rollup_log::{RangeQuery, RollupLog};
use strata::tier::TierCatalog;
use tempfile::tempdir;

const DAY: Duration = Duration::from_secs(86_400);

fn sample(ts: i64) -> Sample {
    Record::new(ts).with("latency", 1.0)
}

#[test]
fn test_rotation_keeps_retention_window() {
    let temp_dir = tempdir().unwrap();
    let log = RawLog::new(temp_dir.path().join("ping-metrics.log"));
    let now = 1_000_000;

    log.append(&[
        sample(now - 90_000),
        sample(now - 86_401),
        sample(now - 86_400),
        sample(now - 60),
        sample(now),
    ]);

    let stats = log.rotate_at(DAY, now);
    assert_eq!(stats, RotationStats { purged: 2, kept: 3 });

    let timestamps: Vec<i64> = log.read(0).iter().map(|s| s.timestamp).collect();
    assert_eq!(timestamps, vec![now - 86_400, now - 60, now]);
}

#[test]
fn test_rotation_without_expired_lines_leaves_file_alone() {
    let temp_dir = tempdir().unwrap();
    let log = RawLog::new(temp_dir.path().join("ping-metrics.log"));
    log.append(&[sample(1000), sample(1060)]);
    let before = fs::read(log.path()).unwrap();

    let stats = log.rotate_at(DAY, 2000);
    assert_eq!(stats, RotationStats { purged: 0, kept: 2 });
    assert_eq!(fs::read(log.path()).unwrap(), before);
    assert!(!log.backup_path().exists());
}

#[test]
fn test_rotation_preserves_previous_generation() {
    let temp_dir = tempdir().unwrap();
    let log = RawLog::new(temp_dir.path().join("ping-metrics.log"));
    log.append(&[sample(10), sample(200_000)]);
    let before = fs::read(log.path()).unwrap();

    log.rotate_at(DAY, 200_000);

    assert_eq!(fs::read(log.backup_path()).unwrap(), before);
    assert_eq!(log.read(0).len(), 1);
}

#[test]
fn test_interrupted_rotation_leaves_log_intact() {
    let temp_dir = tempdir().unwrap();
    let log = RawLog::new(temp_dir.path().join("ping-metrics.log"));
    log.append(&[sample(10), sample(200_000)]);
    let before = fs::read(log.path()).unwrap();

    // A rotation that staged its replacement but never renamed it.
    let staged = StagedFile::write(log.path(), b"partial").unwrap();
    let temp_path = staged.temp_path().to_path_buf();
    std::mem::forget(staged);
    assert!(temp_path.exists());

    assert_eq!(fs::read(log.path()).unwrap(), before);
    assert_eq!(log.read(0).len(), 2);

    // The next rotation stages over the leftover and completes.
    let stats = log.rotate_at(DAY, 200_000);
    assert_eq!(stats, RotationStats { purged: 1, kept: 1 });
    assert!(!temp_path.exists());
    assert_eq!(log.read(0)[0].timestamp, 200_000);
}

#[test]
fn test_abandoned_stage_is_cleaned_up() {
    let temp_dir = tempdir().unwrap();
    let path = temp_dir.path().join("ping-metrics.log");
    fs::write(&path, "original\n").unwrap();

    let staged = StagedFile::write(&path, b"replacement\n").unwrap();
    let temp_path = staged.temp_path().to_path_buf();
    drop(staged);

    assert!(!temp_path.exists());
    assert_eq!(fs::read_to_string(&path).unwrap(), "original\n");
}

#[test]
fn test_appends_racing_rotation_are_kept() {
    let temp_dir = tempdir().unwrap();
    let log = RawLog::new(temp_dir.path().join("ping-metrics.log"));
    let now = 1_000_000;

    let expired: Vec<Sample> = (0..50).map(sample).collect();
    log.append(&expired);

    std::thread::scope(|s| {
        for writer in 0..4 {
            let log = &log;
            s.spawn(move || {
                for i in 0..25 {
                    assert!(log.append(&[sample(now - 1000 + writer * 100 + i)]));
                }
            });
        }
        s.spawn(|| {
            for _ in 0..10 {
                log.rotate_at(DAY, now);
            }
        });
    });

    log.rotate_at(DAY, now);
    let remaining = log.read(0);
    assert_eq!(remaining.len(), 100);
    assert!(remaining.iter().all(|s| s.timestamp >= now - 86_400));
}

#[test]
fn test_append_after_rotation_lands_in_new_file() {
    let temp_dir = tempdir().unwrap();
    let log = RawLog::new(temp_dir.path().join("ping-metrics.log"));
    log.append(&[sample(10), sample(200_000)]);
    log.rotate_at(DAY, 200_000);

    log.append(&[sample(200_010)]);
    let timestamps: Vec<i64> = log.read(0).iter().map(|s| s.timestamp).collect();
    assert_eq!(timestamps, vec![200_000, 200_010]);
}

#[test]
fn test_rollup_rotation_below_gate_is_skipped() {
    let temp_dir = tempdir().unwrap();
    let tier = TierCatalog::standard().require("5min").unwrap().clone();
    let log = RollupLog::new(tier.clone(), temp_dir.path().join("ping-5min.log"));

    log.append(&[Record::new(0), Record::new(1_000_000)]);
    assert_eq!(log.rotate_at(tier.retention, 1_000_000), None);

    let all = RangeQuery::between(Some(0), Some(1_000_000));
    assert_eq!(log.query_at(&all, 1_000_000).count, 2);
}

#[test]
fn test_rollup_rotation_above_gate_applies_retention() {
    let temp_dir = tempdir().unwrap();
    let tier = TierCatalog::standard().require("5min").unwrap().clone();
    let log = RollupLog::new(tier.clone(), temp_dir.path().join("ping-5min.log"))
        .with_rotate_bytes(512);

    let now = 1_000_000;
    let retention = tier.retention_secs();
    let records: Vec<Record> = (0..40)
        .map(|i| Record::new(now - retention - 300 * 20 + i * 300).with("avg_latency", 1.0))
        .collect();
    log.append(&records);

    let stats = log.rotate_at(tier.retention, now).unwrap();
    assert_eq!(stats.purged, 20);
    assert_eq!(stats.kept, 20);

    let all = RangeQuery::between(Some(0), Some(now));
    let result = log.query_at(&all, now);
    assert_eq!(result.count, 20);
    assert_eq!(result.data[0].timestamp, now - retention);
}
