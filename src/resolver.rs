//! Symbol resolution.
//!
//! A [`SymbolSource`] turns an image name into the on-disk path of that image
//! and the set of RVAs at which a named symbol lives. The Windows
//! implementation loads the library from the system directory, registers it
//! with DbgHelp at its real load base and enumerates symbols by exact name.

use crate::error::ResolveError;

use std::collections::BTreeSet;
use std::path::PathBuf;

#[cfg(target_os = "windows")]
use crate::backend::SymbolBackend;
#[cfg(target_os = "windows")]
use std::ffi::{c_void, OsStr, OsString};
#[cfg(target_os = "windows")]
use std::os::windows::ffi::{OsStrExt, OsStringExt};
#[cfg(target_os = "windows")]
use std::path::Path;
#[cfg(target_os = "windows")]
use windows::core::{BOOL, PCWSTR};
#[cfg(target_os = "windows")]
use windows::Win32::Foundation::{FreeLibrary, HANDLE, HMODULE};
#[cfg(target_os = "windows")]
use windows::Win32::System::Diagnostics::Debug::{
    SymEnumSymbolsExW, SymLoadModuleExW, SymUnloadModule64, SYMBOL_INFOW, SYM_LOAD_FLAGS,
};
#[cfg(target_os = "windows")]
use windows::Win32::System::LibraryLoader::{
    GetModuleFileNameW, LoadLibraryExW, LOAD_LIBRARY_SEARCH_SYSTEM32,
};

#[cfg(target_os = "windows")]
const SYMENUM_OPTIONS_DEFAULT: u32 = 1;

/// A library image located by the loader.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Image {
    /// Name the image was requested by.
    pub name: String,
    /// Full path the loader resolved the name to.
    pub path: PathBuf,
    /// Base address the image was mapped at during resolution.
    pub base: u64,
}

/// Deduplicated RVAs of every symbol matching the target name.
///
/// DbgHelp can report the same address more than once; those collapse here.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SymbolMatch {
    rvas: BTreeSet<u32>,
}

impl SymbolMatch {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record an RVA. Returns `false` if it was already present.
    pub fn insert(&mut self, rva: u32) -> bool {
        self.rvas.insert(rva)
    }

    pub fn len(&self) -> usize {
        self.rvas.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rvas.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = u32> + '_ {
        self.rvas.iter().copied()
    }
}

impl FromIterator<u32> for SymbolMatch {
    fn from_iter<I: IntoIterator<Item = u32>>(iter: I) -> Self {
        Self {
            rvas: iter.into_iter().collect(),
        }
    }
}

/// Result of resolving a symbol in one image.
#[derive(Clone, Debug)]
pub struct Resolution {
    pub image: Image,
    pub rvas: SymbolMatch,
}

/// Something that can find a symbol's RVAs inside a named image.
pub trait SymbolSource {
    /// Resolve every RVA of `symbol` (exact, case-sensitive) in `image_name`.
    ///
    /// Zero matches is not an error: the returned set is simply empty.
    fn resolve(&self, image_name: &str, symbol: &str) -> Result<Resolution, ResolveError>;
}

impl<S: SymbolSource + ?Sized> SymbolSource for &S {
    fn resolve(&self, image_name: &str, symbol: &str) -> Result<Resolution, ResolveError> {
        (**self).resolve(image_name, symbol)
    }
}

/// NUL-terminated UTF-16 copy of `s`.
#[cfg(target_os = "windows")]
pub(crate) fn to_wide(s: &OsStr) -> Vec<u16> {
    s.encode_wide().chain(std::iter::once(0)).collect()
}

/// A library mapped with the system-directory-only search order. Freed on drop.
#[cfg(target_os = "windows")]
struct LoadedLibrary(HMODULE);

#[cfg(target_os = "windows")]
impl LoadedLibrary {
    fn load_system(name: &str) -> Result<Self, ResolveError> {
        let wide = to_wide(OsStr::new(name));
        let module = unsafe {
            LoadLibraryExW(PCWSTR(wide.as_ptr()), None, LOAD_LIBRARY_SEARCH_SYSTEM32)
        }
        .map_err(|e| ResolveError::LoadFailed {
            image: name.to_string(),
            reason: e.to_string(),
        })?;
        Ok(Self(module))
    }

    fn base(&self) -> u64 {
        self.0 .0 as u64
    }

    /// Path the loader actually mapped the library from.
    fn path(&self, name: &str) -> Result<PathBuf, ResolveError> {
        let mut buffer = vec![0u16; 1024];
        let len = unsafe { GetModuleFileNameW(Some(self.0), &mut buffer) } as usize;
        if len == 0 || len >= buffer.len() {
            return Err(ResolveError::ModulePathFailed {
                image: name.to_string(),
                reason: std::io::Error::last_os_error().to_string(),
            });
        }
        Ok(PathBuf::from(OsString::from_wide(&buffer[..len])))
    }
}

#[cfg(target_os = "windows")]
impl Drop for LoadedLibrary {
    fn drop(&mut self) {
        let _ = unsafe { FreeLibrary(self.0) };
    }
}

/// A module registered with DbgHelp. Unloaded on drop.
#[cfg(target_os = "windows")]
struct LoadedSymbols {
    process: HANDLE,
    base: u64,
}

#[cfg(target_os = "windows")]
impl LoadedSymbols {
    fn load(process: HANDLE, path: &Path, base: u64) -> Result<Self, ResolveError> {
        let image = to_wide(path.as_os_str());
        let load_base = unsafe {
            SymLoadModuleExW(
                process,
                None,
                PCWSTR(image.as_ptr()),
                PCWSTR::null(),
                base,
                0,
                None,
                SYM_LOAD_FLAGS(0),
            )
        };
        if load_base == 0 {
            return Err(ResolveError::SymbolLoadFailed {
                path: path.to_path_buf(),
                reason: std::io::Error::last_os_error().to_string(),
            });
        }
        Ok(Self {
            process,
            base: load_base,
        })
    }

    /// RVAs of every symbol named exactly `symbol`.
    fn collect_matches(&self, symbol: &str) -> SymbolMatch {
        let mut collector = Collector {
            target: symbol.encode_utf16().collect(),
            rvas: SymbolMatch::new(),
        };

        let result = unsafe {
            SymEnumSymbolsExW(
                self.process,
                self.base,
                PCWSTR::null(),
                Some(collect_symbol),
                Some(&mut collector as *mut Collector as *const c_void),
                SYMENUM_OPTIONS_DEFAULT,
            )
        };
        if let Err(e) = result {
            tracing::warn!("SymEnumSymbolsExW failed: {}", e);
        }

        collector.rvas
    }
}

#[cfg(target_os = "windows")]
impl Drop for LoadedSymbols {
    fn drop(&mut self) {
        let _ = unsafe { SymUnloadModule64(self.process, self.base) };
    }
}

#[cfg(target_os = "windows")]
struct Collector {
    target: Vec<u16>,
    rvas: SymbolMatch,
}

/// Per-symbol callback for `SymEnumSymbolsExW`.
#[cfg(target_os = "windows")]
unsafe extern "system" fn collect_symbol(
    sym_info: *const SYMBOL_INFOW,
    _symbol_size: u32,
    context: *const c_void,
) -> BOOL {
    // SAFETY: context is the &mut Collector passed to SymEnumSymbolsExW, and
    // sym_info is valid for the duration of the callback with NameLen chars.
    let collector = &mut *(context as *mut Collector);
    let info = &*sym_info;
    let name_ptr = std::ptr::addr_of!((*sym_info).Name) as *const u16;
    let name = std::slice::from_raw_parts(name_ptr, info.NameLen as usize);

    if name == collector.target.as_slice() {
        let rva = info.Address.wrapping_sub(info.ModBase) as u32;
        if !collector.rvas.insert(rva) {
            tracing::debug!("duplicate symbol report at rva {:08X}", rva);
        }
    }

    BOOL(1)
}

/// DbgHelp-backed resolver bound to an initialized [`SymbolBackend`].
#[cfg(target_os = "windows")]
pub struct DbgHelpResolver<'a> {
    backend: &'a SymbolBackend,
}

#[cfg(target_os = "windows")]
impl<'a> DbgHelpResolver<'a> {
    pub fn new(backend: &'a SymbolBackend) -> Self {
        Self { backend }
    }
}

#[cfg(target_os = "windows")]
impl SymbolSource for DbgHelpResolver<'_> {
    fn resolve(&self, image_name: &str, symbol: &str) -> Result<Resolution, ResolveError> {
        let library = LoadedLibrary::load_system(image_name)?;
        let path = library.path(image_name)?;
        let base = library.base();

        let symbols = LoadedSymbols::load(self.backend.process(), &path, base)?;
        let rvas = symbols.collect_matches(symbol);

        tracing::debug!(
            "{} loaded at 0x{:X}, {} match(es) for {}",
            path.display(),
            base,
            rvas.len(),
            symbol
        );

        Ok(Resolution {
            image: Image {
                name: image_name.to_string(),
                path,
                base,
            },
            rvas,
        })
    }
}
