//! Durable per-tier rollup cursors.
//!
//! The state file is a pretty-printed JSON object keyed by tier name:
//!
//! ```json
//! {
//!   "1min": { "last_processed": 1079, "last_bucket_end": 1080, "last_rollup": 1130 },
//!   "5min": { "last_processed": 899, "last_bucket_end": 900, "last_rollup": 1130 }
//! }
//! ```
//!
//! # Recovery
//!
//! Losing the state is cheap: rollups are regenerated from whatever raw data
//! is still retained. A file that is not valid JSON, or not an object of
//! cursors, is therefore replaced with zeroed cursors. Missing tiers and
//! missing cursor fields are backfilled with zeros so the schema can grow.

use std::collections::BTreeMap;
use std::fs::OpenOptions;
use std::io::Read;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{Result, StateError};
use crate::lock::{LockMode, LockedFile, atomic_replace, sibling_path};
use crate::tier::TierCatalog;

/// Suffix of the lock file serializing writers of the state file.
///
/// Distinct from the processor's run lock, which is held while saving.
pub(crate) const SAVE_LOCK_SUFFIX: &str = ".save.lock";

/// Progress of one tier's rollup.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RollupCursor {
    /// Raw samples at or before this timestamp have been consumed.
    pub last_processed: i64,
    /// End of the newest emitted bucket. Never decreases.
    pub last_bucket_end: i64,
    /// Wall-clock time of the last processing run.
    pub last_rollup: i64,
}

/// Cursors for every tier of a stream.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RollupState {
    cursors: BTreeMap<String, RollupCursor>,
}

impl RollupState {
    /// Zeroed cursors for every tier in `catalog`.
    pub fn fresh(catalog: &TierCatalog) -> Self {
        let mut state = Self::default();
        state.backfill(catalog);
        state
    }

    /// Returns the cursor for `tier`, zeroed if absent.
    pub fn cursor(&self, tier: &str) -> RollupCursor {
        self.cursors.get(tier).copied().unwrap_or_default()
    }

    /// Replaces the cursor for `tier`.
    pub fn set_cursor(&mut self, tier: &str, cursor: RollupCursor) {
        self.cursors.insert(tier.to_string(), cursor);
    }

    /// Iterates `(tier, cursor)` pairs in name order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &RollupCursor)> {
        self.cursors.iter().map(|(k, v)| (k.as_str(), v))
    }

    /// Whether a cursor is stored for `tier`.
    pub fn contains(&self, tier: &str) -> bool {
        self.cursors.contains_key(tier)
    }

    /// Adds zeroed cursors for tiers that have none. Returns whether any
    /// were added.
    fn backfill(&mut self, catalog: &TierCatalog) -> bool {
        let mut added = false;
        for tier in catalog {
            if !self.cursors.contains_key(&tier.name) {
                self.cursors.insert(tier.name.clone(), RollupCursor::default());
                added = true;
            }
        }
        added
    }
}

/// The state file of one stream.
#[derive(Debug, Clone)]
pub struct StateStore {
    path: PathBuf,
}

impl StateStore {
    /// Uses the state file at `path`.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Path of the state file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Loads cursors for `catalog`, creating or repairing the file as needed.
    ///
    /// Never fails: if the file cannot be read, zeroed cursors are returned
    /// and the file is left alone.
    pub fn load(&self, catalog: &TierCatalog) -> RollupState {
        match self.try_load(catalog) {
            Ok(state) => state,
            Err(e) => {
                tracing::warn!(path = %self.path.display(), error = %e, "rollup state unreadable, using zeroed cursors");
                RollupState::fresh(catalog)
            }
        }
    }

    /// Loads cursors for `catalog`, creating or repairing the file as needed.
    ///
    /// A missing, corrupt or incomplete file is rebuilt and persisted.
    ///
    /// # Errors
    ///
    /// Returns an error only if an existing file cannot be locked or read.
    /// Failing to persist a rebuilt state is logged, not returned.
    pub fn try_load(&self, catalog: &TierCatalog) -> Result<RollupState> {
        if !self.path.exists() {
            let state = RollupState::fresh(catalog);
            self.save(&state);
            return Ok(state);
        }

        let content = self.read_locked()?;
        let (mut state, mut dirty) = match serde_json::from_str::<RollupState>(&content) {
            Ok(state) => (state, false),
            Err(e) => {
                tracing::warn!(
                    path = %self.path.display(),
                    error = %e,
                    "rollup state corrupt, rebuilding from defaults"
                );
                (RollupState::default(), true)
            }
        };

        dirty |= state.backfill(catalog);
        if dirty {
            self.save(&state);
        }
        Ok(state)
    }

    /// Reads the stored cursors without creating or repairing the file.
    ///
    /// Returns `None` if the file is missing, unreadable or corrupt.
    pub fn peek(&self) -> Option<RollupState> {
        if !self.path.exists() {
            return None;
        }
        let content = self.read_locked().ok()?;
        serde_json::from_str(&content).ok()
    }

    /// Persists the cursors. Returns `false` (and logs) on failure.
    pub fn save(&self, state: &RollupState) -> bool {
        match self.try_save(state) {
            Ok(()) => true,
            Err(e) => {
                tracing::warn!(path = %self.path.display(), error = %e, "failed to save rollup state");
                false
            }
        }
    }

    /// Persists the cursors.
    ///
    /// Writers serialize on a `.save.lock` sibling and the new content is
    /// renamed into place, so the state file itself is never created empty
    /// and readers never observe a half-written file.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization, locking or writing fails.
    pub fn try_save(&self, state: &RollupState) -> Result<()> {
        let mut json = serde_json::to_string_pretty(state)
            .map_err(|source| StateError::Serialize { source })?;
        json.push('\n');

        let mut options = OpenOptions::new();
        options.write(true).create(true).truncate(false);
        let guard = LockedFile::acquire(&self.save_lock_path(), &options, LockMode::Exclusive)?;
        atomic_replace(&self.path, json.as_bytes())?;
        drop(guard);
        Ok(())
    }

    fn save_lock_path(&self) -> PathBuf {
        sibling_path(&self.path, SAVE_LOCK_SUFFIX)
    }

    fn read_locked(&self) -> Result<String> {
        let mut options = OpenOptions::new();
        options.read(true);
        let mut guard = LockedFile::acquire(&self.path, &options, LockMode::Shared)?;

        let mut content = String::new();
        guard
            .file_mut()
            .read_to_string(&mut content)
            .map_err(|source| StateError::Read {
                path: self.path.clone(),
                source,
            })?;
        Ok(content)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::tempdir;

    #[test]
    fn test_missing_file_is_created_zeroed() {
        let temp_dir = tempdir().unwrap();
        let store = StateStore::new(temp_dir.path().join("ping-rollup-state.json"));
        let catalog = TierCatalog::standard();

        let state = store.load(&catalog);
        for tier in &catalog {
            assert_eq!(state.cursor(&tier.name), RollupCursor::default());
        }
        assert!(store.path().exists());
    }

    #[test]
    fn test_save_and_load() {
        let temp_dir = tempdir().unwrap();
        let store = StateStore::new(temp_dir.path().join("state.json"));
        let catalog = TierCatalog::standard();

        let mut state = store.load(&catalog);
        let cursor = RollupCursor {
            last_processed: 1079,
            last_bucket_end: 1080,
            last_rollup: 1130,
        };
        state.set_cursor("1min", cursor);
        assert!(store.save(&state));

        let reloaded = store.load(&catalog);
        assert_eq!(reloaded.cursor("1min"), cursor);
        assert_eq!(reloaded, state);

        let text = fs::read_to_string(store.path()).unwrap();
        assert!(text.contains("\"last_bucket_end\": 1080"));
    }

    #[test]
    fn test_corrupt_file_is_rebuilt() {
        let temp_dir = tempdir().unwrap();
        let path = temp_dir.path().join("state.json");
        fs::write(&path, "{ this is not json").unwrap();

        let store = StateStore::new(&path);
        let catalog = TierCatalog::standard();
        let state = store.load(&catalog);

        assert_eq!(state, RollupState::fresh(&catalog));
        let rewritten: RollupState =
            serde_json::from_str(&fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(rewritten, state);
    }

    #[test]
    fn test_peek_does_not_create() {
        let temp_dir = tempdir().unwrap();
        let store = StateStore::new(temp_dir.path().join("state.json"));

        assert!(store.peek().is_none());
        assert!(!store.path().exists());

        let state = store.load(&TierCatalog::standard());
        assert_eq!(store.peek(), Some(state));
    }

    #[test]
    fn test_non_object_is_rebuilt() {
        let temp_dir = tempdir().unwrap();
        let path = temp_dir.path().join("state.json");
        fs::write(&path, "[1, 2, 3]").unwrap();

        let catalog = TierCatalog::standard();
        let state = StateStore::new(&path).load(&catalog);
        assert_eq!(state, RollupState::fresh(&catalog));
    }

    #[test]
    fn test_backfills_missing_fields_and_tiers() {
        let temp_dir = tempdir().unwrap();
        let path = temp_dir.path().join("state.json");
        fs::write(
            &path,
            r#"{"1min": {"last_bucket_end": 600}, "legacy": {"last_processed": 5}}"#,
        )
        .unwrap();

        let catalog = TierCatalog::standard();
        let state = StateStore::new(&path).load(&catalog);

        assert_eq!(
            state.cursor("1min"),
            RollupCursor {
                last_processed: 0,
                last_bucket_end: 600,
                last_rollup: 0,
            }
        );
        assert_eq!(state.cursor("2hour"), RollupCursor::default());
        assert!(state.contains("legacy"));

        let persisted = fs::read_to_string(&path).unwrap();
        assert!(persisted.contains("\"2hour\""));
    }

    #[test]
    fn test_save_never_creates_an_empty_file() {
        let temp_dir = tempdir().unwrap();
        let store = StateStore::new(temp_dir.path().join("state.json"));
        let state = RollupState::fresh(&TierCatalog::standard());

        let mut options = OpenOptions::new();
        options.write(true).create(true).truncate(false);
        let held = LockedFile::acquire(&store.save_lock_path(), &options, LockMode::Exclusive)
            .unwrap();

        std::thread::scope(|s| {
            let saver = s.spawn(|| store.try_save(&state));
            std::thread::sleep(std::time::Duration::from_millis(100));

            // The blocked writer has not touched the target yet.
            assert!(!store.path().exists());
            assert!(store.peek().is_none());

            drop(held);
            saver.join().unwrap().unwrap();
        });

        assert_eq!(store.peek(), Some(state));
    }

    #[test]
    fn test_concurrent_readers_never_see_partial_state() {
        let temp_dir = tempdir().unwrap();
        let path = temp_dir.path().join("state.json");
        let catalog = TierCatalog::standard();

        std::thread::scope(|s| {
            s.spawn(|| {
                let store = StateStore::new(&path);
                let mut state = RollupState::fresh(&catalog);
                for i in 0..200 {
                    state.set_cursor(
                        "1min",
                        RollupCursor {
                            last_processed: i,
                            last_bucket_end: i + 1,
                            last_rollup: i,
                        },
                    );
                    store.try_save(&state).unwrap();
                }
            });
            s.spawn(|| {
                for _ in 0..500 {
                    if let Ok(text) = fs::read_to_string(&path) {
                        let parsed: RollupState = serde_json::from_str(&text).unwrap();
                        assert!(parsed.contains("1min"));
                    }
                }
            });
        });
    }
}
