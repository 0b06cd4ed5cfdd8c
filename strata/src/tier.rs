//! Tier catalog: the resolutions a stream is rolled up into.
//!
//! A tier is a named bucket width plus how long its rollups are kept. Tiers
//! in a catalog are ordered from finest to coarsest resolution:
//!
//! ```text
//! 1min   ──  60 s buckets,  kept 6 h
//! 5min   ── 300 s buckets,  kept 48 h
//! 30min  ── 1800 s buckets, kept 14 d, gzip
//! 2hour  ── 7200 s buckets, kept 90 d, gzip
//! ```
//!
//! Coarse tiers are written rarely and read rarely, so the standard catalog
//! stores them gzip-compressed.
//!
//! Each tier is rolled up independently from the raw log, so the catalog's
//! ordering only matters for validation and for choosing a tier to serve a
//! query.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Result, TierError};

const SECONDS_PER_MINUTE: u64 = 60;
const SECONDS_PER_HOUR: u64 = 3_600;
const SECONDS_PER_DAY: u64 = 86_400;

/// One rollup resolution.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Tier {
    /// Name used in file names and state keys, e.g. `5min`.
    pub name: String,

    /// Width of each bucket. Must be a whole number of seconds.
    #[serde(with = "duration_serde")]
    pub interval: Duration,

    /// How long rollup records are kept.
    #[serde(with = "duration_serde")]
    pub retention: Duration,

    /// Human-readable description, e.g. `5-minute averages`.
    #[serde(default)]
    pub label: String,

    /// Whether the rollup log is stored gzip-compressed.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub compressed: bool,
}

impl Tier {
    /// Creates and validates a tier.
    ///
    /// # Errors
    ///
    /// Returns [`TierError::InvalidTier`] if the interval is zero or
    /// fractional, or if the retention is shorter than one interval.
    pub fn new(
        name: impl Into<String>,
        interval: Duration,
        retention: Duration,
        label: impl Into<String>,
    ) -> Result<Self> {
        let tier = Self {
            name: name.into(),
            interval,
            retention,
            label: label.into(),
            compressed: false,
        };
        tier.validate()?;
        Ok(tier)
    }

    /// Validates this tier in isolation.
    ///
    /// # Errors
    ///
    /// Returns [`TierError::InvalidTier`] describing the first problem found.
    pub fn validate(&self) -> Result<()> {
        let invalid = |reason: String| TierError::InvalidTier {
            name: self.name.clone(),
            reason,
        };

        if self.name.is_empty() {
            return Err(invalid("name cannot be empty".to_string()).into());
        }
        if self.name.contains(['/', '\\']) {
            return Err(invalid("name cannot contain path separators".to_string()).into());
        }
        if self.interval.as_secs() == 0 {
            return Err(invalid("interval must be at least one second".to_string()).into());
        }
        if self.interval.subsec_nanos() != 0 {
            return Err(invalid(format!(
                "interval ({:?}) must be a whole number of seconds",
                self.interval
            ))
            .into());
        }
        if self.retention < self.interval {
            return Err(invalid(format!(
                "retention ({:?}) must be >= interval ({:?})",
                self.retention, self.interval
            ))
            .into());
        }

        Ok(())
    }

    /// Stores this tier's rollup log gzip-compressed.
    #[must_use]
    pub fn with_compression(mut self, compressed: bool) -> Self {
        self.compressed = compressed;
        self
    }

    /// Bucket width in seconds.
    pub fn interval_secs(&self) -> i64 {
        i64::try_from(self.interval.as_secs()).unwrap_or(i64::MAX)
    }

    /// Retention in whole seconds.
    pub fn retention_secs(&self) -> i64 {
        i64::try_from(self.retention.as_secs()).unwrap_or(i64::MAX)
    }
}

/// Diagnostic view of one tier and its rollup file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TierInfo {
    /// Tier name.
    pub name: String,
    /// Bucket width in seconds.
    pub interval: u64,
    /// Bucket width as text, e.g. `5 minutes`.
    pub interval_label: String,
    /// Retention in seconds.
    pub retention: u64,
    /// Retention as text, e.g. `48 hours`.
    pub retention_label: String,
    /// The tier's configured label.
    pub label: String,
    /// Whether the rollup file is gzip-compressed.
    pub compressed: bool,
    /// Whether the rollup file exists.
    pub file_exists: bool,
    /// Size of the rollup file in bytes, 0 if absent.
    pub file_size: u64,
}

/// A validated, ordered set of tiers.
///
/// Construction and deserialization both validate, so a `TierCatalog` is
/// never empty and its intervals are strictly increasing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "Vec<Tier>", into = "Vec<Tier>")]
pub struct TierCatalog {
    tiers: Vec<Tier>,
}

impl TierCatalog {
    /// Creates a catalog from tiers ordered finest to coarsest.
    ///
    /// # Errors
    ///
    /// Returns [`TierError`] if the catalog is empty, a tier is invalid,
    /// names repeat, intervals do not strictly increase, or retention
    /// shrinks from one tier to the next.
    pub fn new(tiers: Vec<Tier>) -> Result<Self> {
        if tiers.is_empty() {
            return Err(TierError::NoTiers.into());
        }

        for (index, tier) in tiers.iter().enumerate() {
            tier.validate()?;
            if tiers[..index].iter().any(|t| t.name == tier.name) {
                return Err(TierError::DuplicateName {
                    name: tier.name.clone(),
                }
                .into());
            }
        }

        for window in tiers.windows(2) {
            let (previous, current) = (&window[0], &window[1]);

            if current.interval <= previous.interval {
                return Err(TierError::NotOrdered {
                    name: current.name.clone(),
                    interval: current.interval,
                    previous: previous.interval,
                }
                .into());
            }
            if current.retention < previous.retention {
                return Err(TierError::RetentionShrinks {
                    name: current.name.clone(),
                    retention: current.retention,
                    previous: previous.retention,
                }
                .into());
            }
        }

        Ok(Self { tiers })
    }

    /// The catalog used by every built-in metric stream.
    pub fn standard() -> Self {
        let tier = |name: &str, interval: u64, retention: u64, label: &str, compressed| Tier {
            name: name.to_string(),
            interval: Duration::from_secs(interval),
            retention: Duration::from_secs(retention),
            label: label.to_string(),
            compressed,
        };

        Self {
            tiers: vec![
                tier("1min", 60, 6 * SECONDS_PER_HOUR, "1-minute averages", false),
                tier("5min", 300, 48 * SECONDS_PER_HOUR, "5-minute averages", false),
                tier("30min", 1_800, 14 * SECONDS_PER_DAY, "30-minute averages", true),
                tier("2hour", 7_200, 90 * SECONDS_PER_DAY, "2-hour averages", true),
            ],
        }
    }

    /// Looks up a tier by name.
    pub fn get(&self, name: &str) -> Option<&Tier> {
        self.tiers.iter().find(|t| t.name == name)
    }

    /// Looks up a tier by name, failing if it does not exist.
    ///
    /// # Errors
    ///
    /// Returns [`TierError::UnknownTier`] if no tier has that name.
    pub fn require(&self, name: &str) -> Result<&Tier> {
        self.get(name).ok_or_else(|| {
            TierError::UnknownTier {
                name: name.to_string(),
            }
            .into()
        })
    }

    /// Iterates tiers from finest to coarsest.
    pub fn iter(&self) -> std::slice::Iter<'_, Tier> {
        self.tiers.iter()
    }

    /// Returns the tier names in order.
    pub fn names(&self) -> Vec<&str> {
        self.tiers.iter().map(|t| t.name.as_str()).collect()
    }

    /// Number of tiers.
    pub fn len(&self) -> usize {
        self.tiers.len()
    }

    /// Always false for a validated catalog.
    pub fn is_empty(&self) -> bool {
        self.tiers.is_empty()
    }

    /// The tier with the smallest interval.
    pub fn finest(&self) -> Option<&Tier> {
        self.tiers.first()
    }

    /// The tier with the largest interval.
    pub fn coarsest(&self) -> Option<&Tier> {
        self.tiers.last()
    }

    /// Chooses the tier to serve a query looking `hours` back from now.
    ///
    /// Returns the finest tier whose retention covers the whole span, or the
    /// coarsest tier when none does. With the standard catalog:
    ///
    /// | hours back | tier    |
    /// |------------|---------|
    /// | ≤ 6        | `1min`  |
    /// | ≤ 48       | `5min`  |
    /// | ≤ 336      | `30min` |
    /// | otherwise  | `2hour` |
    #[allow(clippy::cast_precision_loss)] // retention seconds are far below 2^52
    pub fn best_tier_for_range(&self, hours: f64) -> Option<&Tier> {
        if hours.is_nan() || hours <= 0.0 {
            return self.finest();
        }
        let span_secs = hours * SECONDS_PER_HOUR as f64;
        self.tiers
            .iter()
            .find(|t| t.retention.as_secs() as f64 >= span_secs)
            .or_else(|| self.coarsest())
    }

    /// Reports every tier together with the state of its rollup file.
    ///
    /// # Arguments
    ///
    /// * `file_for` - Maps a tier to the path of its rollup log
    pub fn describe(&self, file_for: impl Fn(&Tier) -> PathBuf) -> Vec<TierInfo> {
        self.tiers
            .iter()
            .map(|tier| {
                let path = file_for(tier);
                let (file_exists, file_size) = file_stat(&path);
                TierInfo {
                    name: tier.name.clone(),
                    interval: tier.interval.as_secs(),
                    interval_label: format_interval(tier.interval.as_secs()),
                    retention: tier.retention.as_secs(),
                    retention_label: format_duration(tier.retention.as_secs()),
                    label: tier.label.clone(),
                    compressed: tier.compressed,
                    file_exists,
                    file_size,
                }
            })
            .collect()
    }
}

impl Default for TierCatalog {
    fn default() -> Self {
        Self::standard()
    }
}

impl TryFrom<Vec<Tier>> for TierCatalog {
    type Error = crate::error::StrataError;

    fn try_from(tiers: Vec<Tier>) -> Result<Self> {
        Self::new(tiers)
    }
}

impl From<TierCatalog> for Vec<Tier> {
    fn from(catalog: TierCatalog) -> Self {
        catalog.tiers
    }
}

impl<'a> IntoIterator for &'a TierCatalog {
    type Item = &'a Tier;
    type IntoIter = std::slice::Iter<'a, Tier>;

    fn into_iter(self) -> Self::IntoIter {
        self.tiers.iter()
    }
}

fn file_stat(path: &Path) -> (bool, u64) {
    match std::fs::metadata(path) {
        Ok(meta) => (true, meta.len()),
        Err(_) => (false, 0),
    }
}

fn plural(count: u64, unit: &str) -> String {
    if count == 1 {
        format!("1 {unit}")
    } else {
        format!("{count} {unit}s")
    }
}

/// Formats a bucket width: `30 seconds`, `5 minutes`, `2 hours`.
pub fn format_interval(seconds: u64) -> String {
    if seconds < SECONDS_PER_MINUTE {
        plural(seconds, "second")
    } else if seconds < SECONDS_PER_HOUR {
        plural(seconds / SECONDS_PER_MINUTE, "minute")
    } else {
        plural(seconds / SECONDS_PER_HOUR, "hour")
    }
}

/// Formats a retention span: `30 minutes`, `6 hours`, `14 days`.
pub fn format_duration(seconds: u64) -> String {
    if seconds < SECONDS_PER_HOUR {
        plural(seconds / SECONDS_PER_MINUTE, "minute")
    } else if seconds < SECONDS_PER_DAY {
        plural(seconds / SECONDS_PER_HOUR, "hour")
    } else {
        plural(seconds / SECONDS_PER_DAY, "day")
    }
}

/// Serde support for Duration fields.
///
/// Durations are serialized as total seconds (f64) so configuration files
/// read naturally.
pub(crate) mod duration_serde {
    use std::time::Duration;

    use serde::de::Error;
    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        duration.as_secs_f64().serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let seconds = f64::deserialize(deserializer)?;
        Duration::try_from_secs_f64(seconds).map_err(D::Error::custom)
    }
}
