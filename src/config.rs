//! Compiled-in targets and runtime configuration.

use std::path::PathBuf;

/// Library base names (no extension) tried in order.
pub const TARGET_IMAGES: &[&str] = &["themeui", "themeservice", "uxinit", "uxtheme"];

/// Fully-qualified, undecorated name of the function to neutralize.
pub const TARGET_SYMBOL: &str = "CThemeSignature::Verify";

/// Public Microsoft symbol store.
pub const DEFAULT_SYMBOL_STORE: &str = "https://msdl.microsoft.com/download/symbols";

/// Directory created under the temp directory to cache downloaded symbols.
pub const SYMBOL_CACHE_DIR_NAME: &str = "Symbols";

/// Suffix of the transient file holding patched bytes.
pub const PATCHED_SUFFIX: &str = ".patched";

/// Suffix of the rollback copy left next to a patched file.
pub const BACKUP_SUFFIX: &str = ".bak";

/// Configuration for a patch run.
#[derive(Clone, Debug)]
pub struct PatchConfig {
    /// Images to patch, in order.
    pub images: Vec<String>,
    /// Symbol whose entry is overwritten.
    pub symbol: String,
    /// Remote symbol store URL.
    pub symbol_store: String,
    /// Local symbol cache; defaults to `%TEMP%\Symbols`.
    pub cache_dir: Option<PathBuf>,
    /// Resolve and report patch sites without writing anything.
    pub dry_run: bool,
}

impl Default for PatchConfig {
    fn default() -> Self {
        Self {
            images: TARGET_IMAGES.iter().map(|s| s.to_string()).collect(),
            symbol: TARGET_SYMBOL.to_string(),
            symbol_store: DEFAULT_SYMBOL_STORE.to_string(),
            cache_dir: None,
            dry_run: false,
        }
    }
}
