//! # themepatch
//!
//! Removes the theme signature check from the Windows theming libraries so
//! that unsigned visual styles can be applied.
//!
//! ## Overview
//!
//! For each target library (`themeui`, `themeservice`, `uxinit`, `uxtheme`):
//!
//! 1. Load the library from the system directory and look up
//!    `CThemeSignature::Verify` through DbgHelp and the public symbol server
//! 2. Translate every RVA of that symbol into a file offset via the section table
//! 3. Overwrite the function entry with a stub that returns zero
//! 4. Swap the patched file in, leaving `<name>.dll.bak` as a rollback copy
//!
//! Images that can't be loaded or don't contain the symbol are skipped; the
//! run fails only if nothing at all was patched, or if a swap left a library
//! missing.

#![warn(clippy::all)]
#![warn(rust_2018_idioms)]

pub mod backend;
pub mod config;
pub mod engine;
pub mod error;
pub mod ownership;
pub mod pe;
pub mod resolver;
pub mod stub;
pub mod transaction;

pub use config::PatchConfig;
pub use engine::{PatchEngine, PatchReport, PatchSite};
pub use error::{Error, PatchError, Result, ReturnCode};
pub use resolver::{Image, Resolution, SymbolMatch, SymbolSource};
pub use stub::Architecture;
pub use transaction::{FileTransaction, StdFileOps, TransactionState};
