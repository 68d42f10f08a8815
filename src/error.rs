//! Error types for themepatch.
//!
//! Errors are layered the way failures propagate: backend errors stop the whole
//! run, resolve and patch errors skip one image, and transaction errors carry
//! whether the original file is still in place.

use std::path::PathBuf;
use std::process::ExitCode;

use thiserror::Error;

/// Result type alias using our error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Process exit codes reported by the driver.
#[repr(u8)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ReturnCode {
    Success = 0,
    NoSymsrv = 1,
    SymSetOptions = 2,
    GetTempPath = 3,
    SymInitialize = 4,
    NonePatched = 5,
    OriginalMissing = 6,
    UnsupportedArchitecture = 7,
    RestoreFailed = 8,
}

impl From<ReturnCode> for ExitCode {
    fn from(code: ReturnCode) -> Self {
        ExitCode::from(code as u8)
    }
}

/// Failures while bringing up the symbol backend. Fatal to the whole run.
#[derive(Error, Debug)]
pub enum BackendError {
    #[error("can't load symsrv: {0}")]
    SymsrvUnavailable(String),

    #[error("symbol options rejected: {0}")]
    OptionsRejected(String),

    #[error("temp directory unavailable: {}", .0.display())]
    TempDirUnavailable(PathBuf),

    #[error("symbol backend initialization failed: {0}")]
    InitFailed(String),
}

impl BackendError {
    pub fn return_code(&self) -> ReturnCode {
        match self {
            Self::SymsrvUnavailable(_) => ReturnCode::NoSymsrv,
            Self::OptionsRejected(_) => ReturnCode::SymSetOptions,
            Self::TempDirUnavailable(_) => ReturnCode::GetTempPath,
            Self::InitFailed(_) => ReturnCode::SymInitialize,
        }
    }
}

/// Failures resolving the target symbol inside one image. The image is skipped.
#[derive(Error, Debug)]
pub enum ResolveError {
    #[error("failed to load image '{image}': {reason}")]
    LoadFailed { image: String, reason: String },

    #[error("failed to query module path of '{image}': {reason}")]
    ModulePathFailed { image: String, reason: String },

    #[error("failed to load symbols for {}: {reason}", .path.display())]
    SymbolLoadFailed { path: PathBuf, reason: String },
}

/// Failures of the write-backup-swap sequence.
///
/// Every variant except [`TransactionError::OriginalMissing`] leaves the
/// original file in place with its pre-swap content.
#[derive(Error, Debug)]
pub enum TransactionError {
    #[error("failed to write {}: {source}", .path.display())]
    TempWrite {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to take ownership of {}", .0.display())]
    OwnershipDenied(PathBuf),

    #[error("failed to move {} -> {}: {source}", .from.display(), .to.display())]
    Backup {
        from: PathBuf,
        to: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to move {} -> {} (original restored): {source}", .from.display(), .to.display())]
    Replace {
        from: PathBuf,
        to: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("{} is missing, restore it manually from {}: {source}", .original.display(), .backup.display())]
    OriginalMissing {
        original: PathBuf,
        backup: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("no backup found for {}", .0.display())]
    NoBackup(PathBuf),
}

/// Failures patching one image.
#[derive(Error, Debug)]
pub enum PatchError {
    #[error(transparent)]
    Resolve(#[from] ResolveError),

    #[error("can't read file {}", .0.display())]
    ReadFailed(PathBuf),

    #[error("no patch stub for this architecture ({0})")]
    UnsupportedArchitecture(&'static str),

    #[error("image machine 0x{found:04X} does not match stub machine 0x{expected:04X}")]
    MachineMismatch { expected: u16, found: u16 },

    #[error(transparent)]
    Transaction(#[from] TransactionError),
}

impl PatchError {
    /// Whether this failure left the target file absent.
    pub fn is_catastrophic(&self) -> bool {
        matches!(
            self,
            Self::Transaction(TransactionError::OriginalMissing { .. })
        )
    }
}

/// Umbrella error for the whole run.
#[derive(Error, Debug)]
pub enum Error {
    #[error(transparent)]
    Backend(#[from] BackendError),

    #[error(transparent)]
    Patch(#[from] PatchError),

    #[error("patching failed: none patched")]
    NonePatched,
}

impl Error {
    /// Exit code the driver reports for this error.
    pub fn return_code(&self) -> ReturnCode {
        match self {
            Self::Backend(e) => e.return_code(),
            Self::Patch(PatchError::UnsupportedArchitecture(_)) => {
                ReturnCode::UnsupportedArchitecture
            }
            Self::Patch(e) if e.is_catastrophic() => ReturnCode::OriginalMissing,
            Self::Patch(_) | Self::NonePatched => ReturnCode::NonePatched,
        }
    }
}
