//! Atomic replacement of an image file with a backup left behind.
//!
//! The sequence for `swap(original, bytes)`:
//!
//! ```text
//! 1. write bytes        -> <original>.patched
//! 2. ensure_writable(<original>)
//! 3. rename <original>  -> <original>.bak
//! 4. rename <original>.patched -> <original>
//!    on failure: rename <original>.bak -> <original>
//! ```
//!
//! Both renames stay in the original's directory, so they are same-volume
//! moves that either happen completely or not at all. The only outcome that
//! leaves `<original>` absent is step 4 and its restore both failing.

use crate::config::{BACKUP_SUFFIX, PATCHED_SUFFIX};
use crate::error::TransactionError;
use crate::ownership::WriteAccess;

use std::ffi::OsString;
use std::io;
use std::path::{Path, PathBuf};

/// Filesystem operations used by a transaction.
pub trait FileOps {
    fn write(&self, path: &Path, bytes: &[u8]) -> io::Result<()>;
    fn rename(&self, from: &Path, to: &Path) -> io::Result<()>;
    fn exists(&self, path: &Path) -> bool;
}

/// [`FileOps`] backed by `std::fs`.
#[derive(Clone, Copy, Debug, Default)]
pub struct StdFileOps;

impl FileOps for StdFileOps {
    fn write(&self, path: &Path, bytes: &[u8]) -> io::Result<()> {
        std::fs::write(path, bytes)
    }

    fn rename(&self, from: &Path, to: &Path) -> io::Result<()> {
        std::fs::rename(from, to)
    }

    fn exists(&self, path: &Path) -> bool {
        path.exists()
    }
}

/// Progress of a single transaction.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TransactionState {
    NotStarted,
    TempWritten,
    OwnershipTaken,
    OriginalBackedUp,
    Swapped,
    RolledBack,
    Failed,
}

/// `path` with `suffix` appended to its file name.
pub fn sibling(path: &Path, suffix: &str) -> PathBuf {
    let mut name = OsString::from(path.as_os_str());
    name.push(suffix);
    PathBuf::from(name)
}

/// Transient path holding the patched bytes.
pub fn patched_path(original: &Path) -> PathBuf {
    sibling(original, PATCHED_SUFFIX)
}

/// First backup path not already taken.
///
/// An existing `<original>.bak` holds the pristine file from an earlier run,
/// so later backups go to `<original>.bak.1`, `<original>.bak.2`, ...
pub fn backup_path<F: FileOps>(original: &Path, fs: &F) -> PathBuf {
    let primary = sibling(original, BACKUP_SUFFIX);
    if !fs.exists(&primary) {
        return primary;
    }
    (1u32..)
        .map(|n| sibling(original, &format!("{}.{}", BACKUP_SUFFIX, n)))
        .find(|p| !fs.exists(p))
        .unwrap_or(primary)
}

/// One write-backup-swap of an image file.
pub struct FileTransaction<'a, A: WriteAccess, F: FileOps> {
    access: &'a A,
    fs: &'a F,
    state: TransactionState,
}

impl<'a, A: WriteAccess, F: FileOps> FileTransaction<'a, A, F> {
    pub fn new(access: &'a A, fs: &'a F) -> Self {
        Self {
            access,
            fs,
            state: TransactionState::NotStarted,
        }
    }

    pub fn state(&self) -> TransactionState {
        self.state
    }

    /// Replace `original` with `patched`, keeping the old content as a backup.
    ///
    /// Returns the backup path on success.
    pub fn swap(&mut self, original: &Path, patched: &[u8]) -> Result<PathBuf, TransactionError> {
        let result = self.run(original, patched);
        if result.is_err() && self.state != TransactionState::RolledBack {
            self.state = TransactionState::Failed;
        }
        result
    }

    fn run(&mut self, original: &Path, patched: &[u8]) -> Result<PathBuf, TransactionError> {
        let temp = patched_path(original);
        self.fs
            .write(&temp, patched)
            .map_err(|source| TransactionError::TempWrite {
                path: temp.clone(),
                source,
            })?;
        self.state = TransactionState::TempWritten;

        // The temp file stays behind for diagnostics if this fails.
        if !self.access.ensure_writable(original) {
            return Err(TransactionError::OwnershipDenied(original.to_path_buf()));
        }
        self.state = TransactionState::OwnershipTaken;

        let backup = backup_path(original, self.fs);
        self.fs
            .rename(original, &backup)
            .map_err(|source| TransactionError::Backup {
                from: original.to_path_buf(),
                to: backup.clone(),
                source,
            })?;
        self.state = TransactionState::OriginalBackedUp;

        if let Err(source) = self.fs.rename(&temp, original) {
            tracing::error!(
                "move {} -> {} failed: {}",
                temp.display(),
                original.display(),
                source
            );
            if let Err(e) = self.fs.rename(&backup, original) {
                tracing::error!(
                    "move {} -> {} failed: {}. {} is now missing!",
                    backup.display(),
                    original.display(),
                    e,
                    original.display()
                );
                return Err(TransactionError::OriginalMissing {
                    original: original.to_path_buf(),
                    backup,
                    source: e,
                });
            }
            self.state = TransactionState::RolledBack;
            return Err(TransactionError::Replace {
                from: temp,
                to: original.to_path_buf(),
                source,
            });
        }
        self.state = TransactionState::Swapped;

        Ok(backup)
    }
}

/// Put `<original>.bak` back in place of `original`.
///
/// The current file is first moved aside to `<original>.patched`, so a failed
/// restore puts it back instead of leaving `original` absent. Returns the path
/// the replaced file was moved to, or `None` if `original` was missing and the
/// backup was simply moved into place.
pub fn restore<A: WriteAccess, F: FileOps>(
    original: &Path,
    access: &A,
    fs: &F,
) -> Result<Option<PathBuf>, TransactionError> {
    let backup = sibling(original, BACKUP_SUFFIX);
    if !fs.exists(&backup) {
        return Err(TransactionError::NoBackup(original.to_path_buf()));
    }

    // A failed swap can leave only the backup behind.
    if !fs.exists(original) {
        tracing::warn!("{} is missing, moving backup into place", original.display());
        if !access.ensure_writable(&backup) {
            return Err(TransactionError::OwnershipDenied(backup));
        }
        fs.rename(&backup, original)
            .map_err(|source| TransactionError::Replace {
                from: backup.clone(),
                to: original.to_path_buf(),
                source,
            })?;
        return Ok(None);
    }

    if !access.ensure_writable(original) {
        return Err(TransactionError::OwnershipDenied(original.to_path_buf()));
    }

    let aside = patched_path(original);
    fs.rename(original, &aside)
        .map_err(|source| TransactionError::Backup {
            from: original.to_path_buf(),
            to: aside.clone(),
            source,
        })?;

    if let Err(source) = fs.rename(&backup, original) {
        if let Err(e) = fs.rename(&aside, original) {
            return Err(TransactionError::OriginalMissing {
                original: original.to_path_buf(),
                backup,
                source: e,
            });
        }
        return Err(TransactionError::Replace {
            from: backup,
            to: original.to_path_buf(),
            source,
        });
    }

    Ok(Some(aside))
}
