//! Symbol backend bootstrap.
//!
//! DbgHelp is process-wide state: it is initialized once with a symbol search
//! path before any image is resolved, and cleaned up when the backend is
//! dropped at the end of the run.

use crate::config::SYMBOL_CACHE_DIR_NAME;
use crate::error::BackendError;

use std::path::{Path, PathBuf};

#[cfg(target_os = "windows")]
use crate::resolver::to_wide;
#[cfg(target_os = "windows")]
use windows::core::{w, PCWSTR};
#[cfg(target_os = "windows")]
use windows::Win32::Foundation::{HANDLE, HMODULE};
#[cfg(target_os = "windows")]
use windows::Win32::System::Diagnostics::Debug::{SymCleanup, SymInitializeW, SymSetOptions};
#[cfg(target_os = "windows")]
use windows::Win32::System::LibraryLoader::LoadLibraryW;
#[cfg(target_os = "windows")]
use windows::Win32::System::Threading::GetCurrentProcess;

// DbgHelp option flags
pub const SYMOPT_UNDNAME: u32 = 0x0000_0002;
pub const SYMOPT_FAIL_CRITICAL_ERRORS: u32 = 0x0000_0200;
pub const SYMOPT_EXACT_SYMBOLS: u32 = 0x0000_0400;

/// Options applied before initialization: undecorated names, exact PDB match,
/// no critical-error dialogs.
pub const SYMBOL_OPTIONS: u32 = SYMOPT_UNDNAME | SYMOPT_EXACT_SYMBOLS | SYMOPT_FAIL_CRITICAL_ERRORS;

/// DbgHelp search path that downloads from `store` into `cache_dir`.
pub fn search_path(cache_dir: &Path, store: &str) -> String {
    format!("srv*{}*{}", cache_dir.display(), store)
}

/// Default symbol cache under the temp directory.
pub fn default_cache_dir() -> Result<PathBuf, BackendError> {
    let temp = std::env::temp_dir();
    if !temp.is_dir() {
        return Err(BackendError::TempDirUnavailable(temp));
    }
    Ok(temp.join(SYMBOL_CACHE_DIR_NAME))
}

/// Initialized DbgHelp session for the current process.
#[cfg(target_os = "windows")]
pub struct SymbolBackend {
    process: HANDLE,
    /// symsrv stays loaded for the lifetime of the session.
    _symsrv: HMODULE,
}

#[cfg(target_os = "windows")]
impl SymbolBackend {
    /// Load symsrv, set options and initialize DbgHelp.
    ///
    /// Must be called once, before any image is resolved.
    pub fn initialize(symbol_store: &str, cache_dir: Option<&Path>) -> Result<Self, BackendError> {
        let symsrv = unsafe { LoadLibraryW(w!("symsrv.dll")) }
            .map_err(|e| BackendError::SymsrvUnavailable(e.to_string()))?;

        if unsafe { SymSetOptions(SYMBOL_OPTIONS) } == 0 {
            return Err(BackendError::OptionsRejected(
                std::io::Error::last_os_error().to_string(),
            ));
        }

        let cache_dir = match cache_dir {
            Some(dir) => dir.to_path_buf(),
            None => default_cache_dir()?,
        };
        let search_path = search_path(&cache_dir, symbol_store);
        tracing::debug!("symbol search path: {}", search_path);

        let process = unsafe { GetCurrentProcess() };
        let search_path_wide = to_wide(std::ffi::OsStr::new(&search_path));
        unsafe { SymInitializeW(process, PCWSTR(search_path_wide.as_ptr()), false) }
            .map_err(|e| BackendError::InitFailed(e.to_string()))?;

        Ok(Self {
            process,
            _symsrv: symsrv,
        })
    }

    /// Process handle the session is bound to.
    pub fn process(&self) -> HANDLE {
        self.process
    }
}

#[cfg(target_os = "windows")]
impl Drop for SymbolBackend {
    fn drop(&mut self) {
        if let Err(e) = unsafe { SymCleanup(self.process) } {
            tracing::warn!("SymCleanup failed: {}", e);
        }
    }
}
