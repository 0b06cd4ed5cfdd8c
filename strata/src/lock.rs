//! Advisory file locking and atomic file replacement.
//!
//! Every log and state file in strata is shared between independent
//! processes: collectors append to raw logs while a rollup daemon reads them
//! and rotates them. Coordination happens through OS advisory locks
//! (`flock(2)` on unix, `LockFileEx` on windows, both via [`fs2`]):
//!
//! - readers take a shared lock
//! - appenders, rotators and state writers take an exclusive lock
//! - rotation never truncates in place; it stages a sibling temp file and
//!   renames it over the target, so a reader sees the old file or the new
//!   file and never a partial one
//!
//! # Lock lifetime
//!
//! [`LockedFile`] releases its lock in `Drop`, so early returns, `?` and
//! panics all unlock. After acquiring, the guard checks that its handle still
//! refers to the file at the path. A process that blocked on the lock of a
//! file that a rotation has since replaced re-opens the new file instead of
//! writing into the unlinked one.

use std::collections::HashSet;
use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use fs2::FileExt;

use crate::error::{LockError, Result};

/// How many times a lock is re-taken when the file is replaced while waiting.
const MAX_REOPEN_ATTEMPTS: u32 = 8;

/// Suffix of the staging file written by [`atomic_replace`].
const TEMP_SUFFIX: &str = ".tmp";

/// Kind of advisory lock to hold.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockMode {
    /// Many readers may hold the lock at once.
    Shared,
    /// A single writer holds the lock.
    Exclusive,
}

/// An open file holding an advisory lock until dropped.
#[derive(Debug)]
pub struct LockedFile {
    file: File,
    path: PathBuf,
    mode: LockMode,
}

impl LockedFile {
    /// Opens `path` with `options` and blocks until the lock is acquired.
    ///
    /// If the file at `path` is replaced while this call waits for the lock,
    /// the stale handle is dropped and the new file is opened and locked.
    ///
    /// # Errors
    ///
    /// Returns [`LockError::Open`] if the file cannot be opened,
    /// [`LockError::Acquire`] if the lock call fails, and
    /// [`LockError::Replaced`] if the file keeps changing underneath.
    pub fn acquire(path: &Path, options: &OpenOptions, mode: LockMode) -> Result<Self> {
        for _ in 0..MAX_REOPEN_ATTEMPTS {
            let file = options.open(path).map_err(|source| LockError::Open {
                path: path.to_path_buf(),
                source,
            })?;

            let locked = match mode {
                LockMode::Shared => FileExt::lock_shared(&file),
                LockMode::Exclusive => FileExt::lock_exclusive(&file),
            };
            locked.map_err(|source| LockError::Acquire {
                path: path.to_path_buf(),
                source,
            })?;

            let guard = Self {
                file,
                path: path.to_path_buf(),
                mode,
            };
            if guard.still_current() {
                return Ok(guard);
            }
            tracing::debug!(path = %path.display(), "file replaced while waiting for lock, reopening");
        }

        Err(LockError::Replaced {
            path: path.to_path_buf(),
            attempts: MAX_REOPEN_ATTEMPTS,
        }
        .into())
    }

    /// Opens (creating if needed) and tries to lock `path` exclusively.
    ///
    /// Returns `Ok(None)` if another process holds the lock.
    ///
    /// # Errors
    ///
    /// Returns [`LockError::Open`] or [`LockError::Acquire`] for failures
    /// other than contention.
    pub fn try_exclusive(path: &Path) -> Result<Option<Self>> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)
            .map_err(|source| LockError::Open {
                path: path.to_path_buf(),
                source,
            })?;

        match FileExt::try_lock_exclusive(&file) {
            Ok(()) => Ok(Some(Self {
                file,
                path: path.to_path_buf(),
                mode: LockMode::Exclusive,
            })),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => Ok(None),
            Err(e) if e.raw_os_error() == fs2::lock_contended_error().raw_os_error() => Ok(None),
            Err(source) => Err(LockError::Acquire {
                path: path.to_path_buf(),
                source,
            }
            .into()),
        }
    }

    /// Returns the locked file handle.
    pub fn file(&self) -> &File {
        &self.file
    }

    /// Returns the locked file handle mutably.
    pub fn file_mut(&mut self) -> &mut File {
        &mut self.file
    }

    /// Returns the path this lock was taken on.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Returns the lock mode held.
    pub fn mode(&self) -> LockMode {
        self.mode
    }

    /// Whether the handle still refers to the file currently at the path.
    fn still_current(&self) -> bool {
        match (self.file.metadata(), fs::metadata(&self.path)) {
            (Ok(held), Ok(current)) => same_file(&held, &current),
            _ => false,
        }
    }
}

impl Drop for LockedFile {
    fn drop(&mut self) {
        // Closing the descriptor releases the lock as well; unlocking first
        // keeps the release independent of descriptor sharing.
        let _ = FileExt::unlock(&self.file);
    }
}

#[cfg(unix)]
fn same_file(held: &fs::Metadata, current: &fs::Metadata) -> bool {
    use std::os::unix::fs::MetadataExt;
    held.dev() == current.dev() && held.ino() == current.ino()
}

#[cfg(not(unix))]
fn same_file(_held: &fs::Metadata, _current: &fs::Metadata) -> bool {
    true
}

fn open_or_create() -> OpenOptions {
    let mut options = OpenOptions::new();
    options.read(true).write(true).create(true).truncate(false);
    options
}

/// Runs `op` while holding a shared lock on `path`, creating it if absent.
///
/// # Errors
///
/// Returns any error from lock acquisition or from `op`.
pub fn with_shared_lock<T>(path: &Path, op: impl FnOnce(&mut File) -> Result<T>) -> Result<T> {
    let mut guard = LockedFile::acquire(path, &open_or_create(), LockMode::Shared)?;
    op(guard.file_mut())
}

/// Runs `op` while holding an exclusive lock on `path`, creating it if absent.
///
/// # Errors
///
/// Returns any error from lock acquisition or from `op`.
pub fn with_exclusive_lock<T>(path: &Path, op: impl FnOnce(&mut File) -> Result<T>) -> Result<T> {
    let mut guard = LockedFile::acquire(path, &open_or_create(), LockMode::Exclusive)?;
    op(guard.file_mut())
}

/// Returns `path` with `suffix` appended to its file name.
pub(crate) fn sibling_path(path: &Path, suffix: &str) -> PathBuf {
    let mut name = path.file_name().map(|n| n.to_os_string()).unwrap_or_default();
    name.push(suffix);
    path.with_file_name(name)
}

/// A fully written replacement for a file, not yet renamed into place.
///
/// Dropping a `StagedFile` without committing removes the temp file.
#[derive(Debug)]
pub struct StagedFile {
    temp: PathBuf,
    target: PathBuf,
    committed: bool,
}

impl StagedFile {
    /// Writes `bytes` to a sibling temp file of `target` and syncs it.
    ///
    /// # Errors
    ///
    /// Returns [`LockError::Replace`] if the temp file cannot be written.
    pub fn write(target: &Path, bytes: &[u8]) -> Result<Self> {
        let temp = sibling_path(target, TEMP_SUFFIX);
        let staged = Self {
            temp,
            target: target.to_path_buf(),
            committed: false,
        };

        let written = File::create(&staged.temp).and_then(|mut file| {
            file.write_all(bytes)?;
            file.sync_all()
        });
        written.map_err(|source| LockError::Replace {
            path: target.to_path_buf(),
            source,
        })?;

        Ok(staged)
    }

    /// Returns the temp file path.
    pub fn temp_path(&self) -> &Path {
        &self.temp
    }

    /// Renames the temp file over the target.
    ///
    /// # Errors
    ///
    /// Returns [`LockError::Replace`] if the rename fails; the target is left
    /// untouched in that case.
    pub fn commit(mut self) -> Result<()> {
        fs::rename(&self.temp, &self.target).map_err(|source| LockError::Replace {
            path: self.target.clone(),
            source,
        })?;
        self.committed = true;
        Ok(())
    }
}

impl Drop for StagedFile {
    fn drop(&mut self) {
        if !self.committed {
            let _ = fs::remove_file(&self.temp);
        }
    }
}

/// Replaces the contents of `path` with `bytes` through a single rename.
///
/// # Errors
///
/// Returns [`LockError::Replace`] if staging or renaming fails.
pub fn atomic_replace(path: &Path, bytes: &[u8]) -> Result<()> {
    StagedFile::write(path, bytes)?.commit()
}

/// Per-process memo of files whose permissions have already been applied.
///
/// Collectors append every few seconds; setting the mode once per file per
/// process lifetime is enough. Rotation produces a new inode, so rotators
/// call [`FileModeCache::refresh`] afterwards.
#[derive(Debug, Default)]
pub struct FileModeCache {
    mode: Option<u32>,
    applied: Mutex<HashSet<PathBuf>>,
}

impl FileModeCache {
    /// Creates a cache applying `mode` (unix permission bits), or nothing.
    pub fn new(mode: Option<u32>) -> Self {
        Self {
            mode,
            applied: Mutex::new(HashSet::new()),
        }
    }

    /// Applies the mode to `path` unless already done in this process.
    pub fn ensure(&self, path: &Path) {
        let Some(mode) = self.mode else {
            return;
        };
        let Ok(mut applied) = self.applied.lock() else {
            return;
        };
        if applied.contains(path) {
            return;
        }
        if apply_mode(path, mode) {
            applied.insert(path.to_path_buf());
        }
    }

    /// Re-applies the mode to `path`, e.g. after it was replaced.
    pub fn refresh(&self, path: &Path) {
        if let Ok(mut applied) = self.applied.lock() {
            applied.remove(path);
        }
        self.ensure(path);
    }

    /// Whether `path` has been handled in this process.
    pub fn is_applied(&self, path: &Path) -> bool {
        self.applied
            .lock()
            .map(|applied| applied.contains(path))
            .unwrap_or(false)
    }
}

#[cfg(unix)]
fn apply_mode(path: &Path, mode: u32) -> bool {
    use std::os::unix::fs::PermissionsExt;
    match fs::set_permissions(path, fs::Permissions::from_mode(mode)) {
        Ok(()) => true,
        Err(e) => {
            tracing::warn!(path = %path.display(), error = %e, "failed to set file mode");
            false
        }
    }
}

#[cfg(not(unix))]
fn apply_mode(_path: &Path, _mode: u32) -> bool {
    true
}
