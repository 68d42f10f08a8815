//! themepatch CLI - patches theme signature verification out of the system
//! theming libraries.
//!
//! Must run elevated: the target files live in the system directory and are
//! owned by TrustedInstaller.

use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;
use std::process::ExitCode;

use themepatch::config::DEFAULT_SYMBOL_STORE;
use themepatch::PatchConfig;

#[cfg(target_os = "windows")]
use themepatch::ReturnCode;

/// Patch CThemeSignature::Verify so unsigned themes can be applied.
#[derive(Parser)]
#[command(name = "themepatch")]
#[command(author, version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
#[cfg_attr(not(target_os = "windows"), allow(dead_code))]
enum Commands {
    /// Patch the target libraries (default)
    Patch(PatchArgs),

    /// Put the .bak copies of the target libraries back in place
    Restore,
}

#[derive(Args, Default)]
#[cfg_attr(not(target_os = "windows"), allow(dead_code))]
struct PatchArgs {
    /// Symbol store to download PDBs from
    #[arg(long, default_value = DEFAULT_SYMBOL_STORE)]
    symbol_store: Option<String>,

    /// Local symbol cache (defaults to %TEMP%\Symbols)
    #[arg(long)]
    cache_dir: Option<PathBuf>,

    /// Resolve and report patch sites without modifying any file
    #[arg(long)]
    dry_run: bool,
}

#[cfg_attr(not(target_os = "windows"), allow(dead_code))]
impl PatchArgs {
    fn into_config(self) -> PatchConfig {
        let mut config = PatchConfig::default();
        if let Some(store) = self.symbol_store {
            config.symbol_store = store;
        }
        config.cache_dir = self.cache_dir;
        config.dry_run = self.dry_run;
        config
    }
}

#[cfg(target_os = "windows")]
fn main() -> ExitCode {
    use tracing_subscriber::{fmt, prelude::*, EnvFilter};

    // Initialize logging
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();

    let code = match cli
        .command
        .unwrap_or_else(|| Commands::Patch(PatchArgs::default()))
    {
        Commands::Patch(args) => {
            let config = args.into_config();
            match patch_all(&config) {
                Ok(patched) if config.dry_run => {
                    tracing::info!("dry run: would patch {}, nothing written", patched);
                    ReturnCode::Success
                }
                Ok(patched) => {
                    tracing::info!("patched {}", patched);
                    ReturnCode::Success
                }
                Err(e) => {
                    tracing::error!("{}", e);
                    e.return_code()
                }
            }
        }

        Commands::Restore => match restore_all(&PatchConfig::default()) {
            Ok(restored) => {
                tracing::info!("restored {}", restored);
                ReturnCode::Success
            }
            Err(e) => {
                tracing::error!("{:#}", e);
                ReturnCode::RestoreFailed
            }
        },
    };

    code.into()
}

#[cfg(target_os = "windows")]
fn patch_all(config: &PatchConfig) -> themepatch::Result<u32> {
    use indicatif::{ProgressBar, ProgressStyle};
    use themepatch::backend::SymbolBackend;
    use themepatch::ownership::SystemAccess;
    use themepatch::resolver::DbgHelpResolver;
    use themepatch::{Architecture, PatchEngine, PatchError, StdFileOps};

    // Fail before touching the backend if there is nothing to patch with.
    let arch = Architecture::current()
        .ok_or(PatchError::UnsupportedArchitecture(Architecture::current_name()))?;

    let backend = SymbolBackend::initialize(&config.symbol_store, config.cache_dir.as_deref())?;
    let engine = PatchEngine::new(
        DbgHelpResolver::new(&backend),
        SystemAccess,
        StdFileOps,
        config,
    )?;
    tracing::debug!("using {} stub", arch.name());

    let pb = ProgressBar::new(config.images.len() as u64);
    pb.set_style(
        ProgressStyle::default_bar()
            .template("{spinner:.green} [{bar:20.cyan/blue}] {pos}/{len} {msg}")
            .unwrap_or_else(|_| ProgressStyle::default_bar())
            .progress_chars("#>-"),
    );

    let result = engine.patch_all(&config.images, |index, image| {
        pb.set_position(index as u64);
        pb.set_message(image.to_string());
    });

    match &result {
        Err(e) if e.return_code() == ReturnCode::OriginalMissing => {
            pb.abandon_with_message("image left missing")
        }
        _ => pb.finish_and_clear(),
    }
    result
}

#[cfg(target_os = "windows")]
fn restore_all(config: &PatchConfig) -> anyhow::Result<usize> {
    use anyhow::Context;
    use themepatch::error::TransactionError;
    use themepatch::ownership::SystemAccess;
    use themepatch::transaction::restore;
    use themepatch::StdFileOps;

    let system_dir = PathBuf::from(std::env::var_os("SystemRoot").context("SystemRoot is not set")?)
        .join("System32");

    let mut restored = 0;
    for image in &config.images {
        let path = system_dir.join(format!("{}.dll", image));
        match restore(&path, &SystemAccess, &StdFileOps) {
            Ok(Some(aside)) => {
                tracing::info!("restored {} (patched copy at {})", path.display(), aside.display());
                restored += 1;
            }
            Ok(None) => {
                tracing::info!("restored missing {}", path.display());
                restored += 1;
            }
            Err(TransactionError::NoBackup(_)) => {
                tracing::info!("no backup for {}", path.display());
            }
            Err(e) => {
                return Err(e).with_context(|| format!("restoring {}", path.display()));
            }
        }
    }

    if restored == 0 {
        anyhow::bail!("no backups found in {}", system_dir.display());
    }
    Ok(restored)
}

#[cfg(not(target_os = "windows"))]
fn main() -> ExitCode {
    let _ = Cli::parse();
    eprintln!("themepatch is only supported on Windows");
    ExitCode::FAILURE
}
