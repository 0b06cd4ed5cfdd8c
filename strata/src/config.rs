//! Stream and engine configuration.
//!
//! A configuration file lists the metric streams a host collects. Each
//! stream owns a directory of plain files:
//!
//! ```text
//! data_dir/
//! ├── ping-metrics.log            <- raw samples
//! ├── ping-metrics.log.old        <- previous raw generation
//! ├── ping-rollup-state.json      <- tier cursors
//! ├── ping-rollup-state.json.lock <- processing run lock
//! ├── ping-rollup-state.json.save.lock
//! ├── ping-1min.log               <- one rollup log per tier
//! ├── ping-5min.log
//! ├── ping-30min.log.gz           <- compressed tiers
//! └── ping-2hour.log.gz
//! ```
//!
//! No two of these paths may coincide, within a stream or across streams
//! sharing a directory. Paths are compared as written, without resolving
//! symlinks.
//!
//! # Example
//!
//! ```json
//! {
//!   "streams": [
//!     {
//!       "name": "ping",
//!       "data_dir": "/var/lib/strata",
//!       "raw_retention": 86400,
//!       "file_mode": "0644",
//!       "aggregate": {
//!         "fields": ["latency"],
//!         "group_by": "hostname",
//!         "precision": 3,
//!         "success_field": "success"
//!       }
//!     }
//!   ]
//! }
//! ```
//!
//! Omitted `tiers` default to the standard catalog.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::aggregate::FieldSummary;
use crate::error::{ConfigError, Result};
use crate::lock::sibling_path;
use crate::processor::RUN_LOCK_SUFFIX;
use crate::raw_log::BACKUP_SUFFIX;
use crate::rollup_log::{
    DEFAULT_COMPRESSED_ROTATE_BYTES, DEFAULT_ROTATE_BYTES, GZIP_EXTENSION, uncompressed_path,
};
use crate::state::SAVE_LOCK_SUFFIX;
use crate::tier::{Tier, TierCatalog};

fn default_raw_retention() -> Duration {
    Duration::from_secs(86_400)
}

fn default_rotate_bytes() -> u64 {
    DEFAULT_ROTATE_BYTES
}

fn default_compressed_rotate_bytes() -> u64 {
    DEFAULT_COMPRESSED_ROTATE_BYTES
}

/// Configuration of one metric stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StreamConfig {
    /// Stream name, used as the file name prefix.
    pub name: String,

    /// Directory holding the stream's files.
    pub data_dir: PathBuf,

    /// Raw log file name, overriding `<name>-metrics.log`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub raw_file: Option<String>,

    /// State file name, overriding `<name>-rollup-state.json`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state_file: Option<String>,

    /// How long raw samples are kept.
    #[serde(
        with = "crate::tier::duration_serde",
        default = "default_raw_retention"
    )]
    pub raw_retention: Duration,

    /// Rollup tiers, finest first.
    #[serde(default)]
    pub tiers: TierCatalog,

    /// Size above which rollup logs are scanned for expired lines.
    #[serde(default = "default_rotate_bytes")]
    pub rollup_rotate_bytes: u64,

    /// The same gate for gzip-compressed rollup logs.
    #[serde(default = "default_compressed_rotate_bytes")]
    pub compressed_rotate_bytes: u64,

    /// Unix permission bits applied to created files, as an octal string.
    #[serde(default, with = "mode_serde", skip_serializing_if = "Option::is_none")]
    pub file_mode: Option<u32>,

    /// Aggregation used by the CLI rollup driver.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub aggregate: Option<FieldSummary>,
}

impl StreamConfig {
    /// A stream with the standard tiers and default retention.
    pub fn new(name: impl Into<String>, data_dir: impl Into<PathBuf>) -> Self {
        Self {
            name: name.into(),
            data_dir: data_dir.into(),
            raw_file: None,
            state_file: None,
            raw_retention: default_raw_retention(),
            tiers: TierCatalog::standard(),
            rollup_rotate_bytes: DEFAULT_ROTATE_BYTES,
            compressed_rotate_bytes: DEFAULT_COMPRESSED_ROTATE_BYTES,
            file_mode: None,
            aggregate: None,
        }
    }

    /// Path of the raw log.
    pub fn raw_path(&self) -> PathBuf {
        match &self.raw_file {
            Some(file) => self.data_dir.join(file),
            None => self.data_dir.join(format!("{}-metrics.log", self.name)),
        }
    }

    /// Path of the rollup state file.
    pub fn state_path(&self) -> PathBuf {
        match &self.state_file {
            Some(file) => self.data_dir.join(file),
            None => self.data_dir.join(format!("{}-rollup-state.json", self.name)),
        }
    }

    /// Path of a tier's rollup log, ending in `.log.gz` for compressed tiers.
    pub fn rollup_path(&self, tier: &Tier) -> PathBuf {
        let file = format!("{}-{}.log", self.name, tier.name);
        if tier.compressed {
            self.data_dir.join(format!("{file}.{GZIP_EXTENSION}"))
        } else {
            self.data_dir.join(file)
        }
    }

    /// Rotation size gate for a tier's rollup log.
    pub fn rotate_bytes(&self, tier: &Tier) -> u64 {
        if tier.compressed {
            self.compressed_rotate_bytes
        } else {
            self.rollup_rotate_bytes
        }
    }

    /// Every file the stream writes or locks, with a description of each.
    ///
    /// Compressed tiers also claim the uncompressed path they migrate from.
    pub fn owned_paths(&self) -> Vec<(String, PathBuf)> {
        let raw = self.raw_path();
        let state = self.state_path();
        let mut paths = vec![
            ("raw log backup".to_string(), sibling_path(&raw, BACKUP_SUFFIX)),
            ("raw log".to_string(), raw),
            ("run lock".to_string(), sibling_path(&state, RUN_LOCK_SUFFIX)),
            ("state save lock".to_string(), sibling_path(&state, SAVE_LOCK_SUFFIX)),
            ("state file".to_string(), state),
        ];

        for tier in &self.tiers {
            let rollup = self.rollup_path(tier);
            if tier.compressed {
                if let Some(legacy) = uncompressed_path(&rollup) {
                    paths.push((format!("uncompressed '{}' rollup log", tier.name), legacy));
                }
            }
            paths.push((format!("'{}' rollup log", tier.name), rollup));
        }
        paths
    }

    /// Validates the stream.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::InvalidStream`] if the name is empty or not a
    /// plain file name prefix, the raw retention is zero, or two of the
    /// stream's files resolve to the same path (e.g. a tier named `metrics`
    /// whose rollup log would be the raw log).
    pub fn validate(&self) -> Result<()> {
        let invalid = |reason: String| ConfigError::InvalidStream {
            name: self.name.clone(),
            reason,
        };

        if self.name.is_empty() {
            return Err(invalid("name cannot be empty".to_string()).into());
        }
        if self.name.contains(['/', '\\']) {
            return Err(invalid("name cannot contain path separators".to_string()).into());
        }
        if self.raw_retention.is_zero() {
            return Err(invalid("raw_retention cannot be zero".to_string()).into());
        }

        let mut seen: HashMap<PathBuf, String> = HashMap::new();
        for (what, path) in self.owned_paths() {
            if let Some(first) = seen.get(&path) {
                let reason = format!("{what} and {first} are both '{}'", path.display());
                return Err(invalid(reason).into());
            }
            seen.insert(path, what);
        }
        Ok(())
    }
}

/// Every stream on the host.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Configured streams.
    pub streams: Vec<StreamConfig>,
}

impl EngineConfig {
    /// Loads and validates a configuration file.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] if the file cannot be read, parsed or
    /// validated. Invalid tier catalogs are reported as parse errors.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let config: Self = serde_json::from_str(&content).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Writes the configuration as pretty JSON.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] if serialization or writing fails.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        let content = serde_json::to_string_pretty(self).map_err(ConfigError::from)?;
        fs::write(path, content).map_err(|source| ConfigError::Write {
            path: path.to_path_buf(),
            source,
        })?;
        Ok(())
    }

    /// Validates every stream and checks that names are unique and no two
    /// streams share a file.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::InvalidStream`] for the first invalid or
    /// repeated stream, or the first stream that claims a path another
    /// stream already owns.
    pub fn validate(&self) -> Result<()> {
        let mut owners: HashMap<PathBuf, &str> = HashMap::new();
        for (index, stream) in self.streams.iter().enumerate() {
            stream.validate()?;
            if self.streams[..index].iter().any(|s| s.name == stream.name) {
                return Err(ConfigError::InvalidStream {
                    name: stream.name.clone(),
                    reason: "duplicate stream name".to_string(),
                }
                .into());
            }
            for (what, path) in stream.owned_paths() {
                if let Some(other) = owners.get(&path) {
                    let reason =
                        format!("{what} '{}' is also used by stream '{other}'", path.display());
                    return Err(ConfigError::InvalidStream {
                        name: stream.name.clone(),
                        reason,
                    }
                    .into());
                }
                owners.insert(path, &stream.name);
            }
        }
        Ok(())
    }

    /// Looks up a stream by name.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::UnknownStream`] if no stream has that name.
    pub fn stream(&self, name: &str) -> Result<&StreamConfig> {
        self.streams
            .iter()
            .find(|s| s.name == name)
            .ok_or_else(|| {
                ConfigError::UnknownStream {
                    name: name.to_string(),
                }
                .into()
            })
    }
}

/// Serde support for optional unix modes written as octal strings.
///
/// Plain JSON numbers are accepted as already-decoded modes.
mod mode_serde {
    use serde::de::Error;
    use serde::{Deserialize, Deserializer, Serializer};

    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Octal(String),
        Number(u32),
    }

    pub fn serialize<S>(mode: &Option<u32>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        match mode {
            Some(mode) => serializer.serialize_str(&format!("{mode:04o}")),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<u32>, D::Error>
    where
        D: Deserializer<'de>,
    {
        match Option::<Raw>::deserialize(deserializer)? {
            None => Ok(None),
            Some(Raw::Number(mode)) => Ok(Some(mode)),
            Some(Raw::Octal(text)) => {
                let digits = text.trim_start_matches("0o");
                u32::from_str_radix(digits, 8)
                    .map(Some)
                    .map_err(|_| D::Error::custom(format!("invalid octal file mode '{text}'")))
            }
        }
    }
}
