//! Error types for the strata rollup engine.
//!
//! Internal plumbing propagates these with `?`. The log and state types turn
//! them into structured results (`false`, empty, failure-flagged) at their
//! public boundary, because an unavailable file is an expected runtime
//! condition for a periodically re-invoked collector.

use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

/// The main error type for all strata operations.
#[derive(Error, Debug)]
pub enum StrataError {
    /// Error opening or locking a file.
    #[error("lock error: {0}")]
    Lock(#[from] LockError),

    /// Error reading or writing a raw or rollup log.
    #[error("log error: {0}")]
    Log(#[from] LogError),

    /// Error persisting rollup cursors.
    #[error("state error: {0}")]
    State(#[from] StateError),

    /// Error validating or looking up tiers.
    #[error("tier error: {0}")]
    Tier(#[from] TierError),

    /// Error loading or validating configuration.
    #[error("config error: {0}")]
    Config(#[from] ConfigError),
}

/// Errors that can occur while opening, locking or replacing a file.
#[derive(Error, Debug)]
pub enum LockError {
    /// The file could not be opened or created.
    #[error("failed to open '{}': {source}", path.display())]
    Open {
        /// The file path.
        path: PathBuf,
        /// The underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// The advisory lock could not be acquired.
    #[error("failed to lock '{}': {source}", path.display())]
    Acquire {
        /// The file path.
        path: PathBuf,
        /// The underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// The file kept being replaced underneath the lock holder.
    #[error("'{}' was replaced {attempts} times while waiting for its lock", path.display())]
    Replaced {
        /// The file path.
        path: PathBuf,
        /// How many acquisitions were attempted.
        attempts: u32,
    },

    /// Writing or renaming the replacement file failed.
    #[error("failed to replace '{}': {source}", path.display())]
    Replace {
        /// The target path.
        path: PathBuf,
        /// The underlying I/O error.
        #[source]
        source: std::io::Error,
    },
}

/// Errors that can occur on the raw and rollup log paths.
#[derive(Error, Debug)]
pub enum LogError {
    /// Reading lines from the log failed.
    #[error("failed to read '{}': {source}", path.display())]
    Read {
        /// The log path.
        path: PathBuf,
        /// The underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// Writing lines to the log failed.
    #[error("failed to write '{}': {source}", path.display())]
    Write {
        /// The log path.
        path: PathBuf,
        /// The underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// Preserving the previous generation of a rotated log failed.
    #[error("failed to back up '{}' to '{}': {source}", path.display(), backup.display())]
    Backup {
        /// The log path.
        path: PathBuf,
        /// The backup path.
        backup: PathBuf,
        /// The underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// A record could not be serialized to JSON.
    #[error("failed to serialize record: {source}")]
    Serialize {
        /// The underlying JSON error.
        #[source]
        source: serde_json::Error,
    },
}

/// Errors that can occur while persisting rollup cursors.
#[derive(Error, Debug)]
pub enum StateError {
    /// The state file could not be read.
    #[error("failed to read rollup state '{}': {source}", path.display())]
    Read {
        /// The state file path.
        path: PathBuf,
        /// The underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// The state file could not be written.
    #[error("failed to write rollup state '{}': {source}", path.display())]
    Write {
        /// The state file path.
        path: PathBuf,
        /// The underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// The cursors could not be serialized.
    #[error("failed to serialize rollup state: {source}")]
    Serialize {
        /// The underlying JSON error.
        #[source]
        source: serde_json::Error,
    },
}

/// Errors that can occur while validating a tier catalog.
#[derive(Error, Debug)]
pub enum TierError {
    /// No tiers are configured.
    #[error("at least one tier must be configured")]
    NoTiers,

    /// A tier has an invalid interval or retention.
    #[error("invalid tier '{name}': {reason}")]
    InvalidTier {
        /// The tier name.
        name: String,
        /// Description of what makes the tier invalid.
        reason: String,
    },

    /// Tier intervals are not strictly increasing.
    #[error("tier '{name}' interval {interval:?} must exceed the previous tier's {previous:?}")]
    NotOrdered {
        /// The offending tier.
        name: String,
        /// Its interval.
        interval: Duration,
        /// The interval of the tier before it.
        previous: Duration,
    },

    /// A coarser tier retains less history than a finer one.
    #[error("tier '{name}' retention {retention:?} is shorter than the previous tier's {previous:?}")]
    RetentionShrinks {
        /// The offending tier.
        name: String,
        /// Its retention.
        retention: Duration,
        /// The retention of the tier before it.
        previous: Duration,
    },

    /// Two tiers share a name.
    #[error("duplicate tier name '{name}'")]
    DuplicateName {
        /// The repeated name.
        name: String,
    },

    /// The requested tier does not exist.
    #[error("unknown tier '{name}'")]
    UnknownTier {
        /// The requested name.
        name: String,
    },
}

/// Errors that can occur while loading configuration.
#[derive(Error, Debug)]
pub enum ConfigError {
    /// The configuration file could not be read.
    #[error("failed to read config '{}': {source}", path.display())]
    Read {
        /// The config path.
        path: PathBuf,
        /// The underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// The configuration file is not valid JSON for the expected shape.
    #[error("failed to parse config '{}': {source}", path.display())]
    Parse {
        /// The config path.
        path: PathBuf,
        /// The underlying JSON error.
        #[source]
        source: serde_json::Error,
    },

    /// The configuration could not be written.
    #[error("failed to write config '{}': {source}", path.display())]
    Write {
        /// The config path.
        path: PathBuf,
        /// The underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// The configuration could not be serialized.
    #[error("failed to serialize config: {0}")]
    Serialize(#[from] serde_json::Error),

    /// A stream is misconfigured: a bad or repeated name, or files that
    /// collide with each other or with another stream's.
    #[error("invalid stream '{name}': {reason}")]
    InvalidStream {
        /// The stream name.
        name: String,
        /// Why it is invalid.
        reason: String,
    },

    /// The requested stream is not configured.
    #[error("unknown stream '{name}'")]
    UnknownStream {
        /// The requested name.
        name: String,
    },
}

/// Type alias for `Result<T, StrataError>`.
pub type Result<T> = std::result::Result<T, StrataError>;
