//! Patch engine.
//!
//! Ties the pieces together for one image:
//! 1. Resolve the target symbol's RVAs
//! 2. Read the image file from disk
//! 3. Translate each RVA to a file offset and overwrite it with the stub
//! 4. Hand the patched buffer to a [`FileTransaction`]

use crate::config::PatchConfig;
use crate::error::{Error, PatchError};
use crate::ownership::WriteAccess;
use crate::pe;
use crate::resolver::{Image, SymbolMatch, SymbolSource};
use crate::stub::{self, Architecture};
use crate::transaction::{FileOps, FileTransaction};

use bytesize::ByteSize;
use std::path::PathBuf;

/// A stub written at one RVA.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PatchSite {
    pub rva: u32,
    pub file_offset: u32,
}

/// Outcome of patching one image.
#[derive(Clone, Debug)]
pub struct PatchReport {
    pub image: Image,
    /// Distinct RVAs the symbol resolved to.
    pub rvas_found: usize,
    /// Sites actually overwritten in the buffer.
    pub sites: Vec<PatchSite>,
    /// Backup left next to the image, if the file was replaced.
    pub backup: Option<PathBuf>,
}

impl PatchReport {
    /// Number of regions patched. Zero is a valid, non-error result.
    pub fn patched(&self) -> u32 {
        self.sites.len() as u32
    }
}

/// Overwrite the entry of every RVA in `rvas` with the stub for `arch`.
///
/// RVAs that don't map to raw file data, or whose offset leaves no room for
/// the whole stub, are skipped. `image_base` is only used for logging.
pub fn apply_stub(
    buffer: &mut [u8],
    rvas: &SymbolMatch,
    arch: Architecture,
    image_base: u64,
) -> Vec<PatchSite> {
    let patch = stub::stub_for(arch);
    let mut sites = Vec::with_capacity(rvas.len());

    for rva in rvas.iter() {
        let Some(file_offset) = pe::translate(buffer, rva) else {
            tracing::warn!("rva {:08X} has no file offset, skipping", rva);
            continue;
        };
        tracing::info!("found at rva {:08X} file offset {:08X}", rva, file_offset);

        let start = file_offset as usize;
        let end = match start.checked_add(patch.len()) {
            Some(end) if end <= buffer.len() => end,
            _ => {
                tracing::warn!(
                    "file offset {:08X} leaves no room for a {}-byte stub, skipping",
                    file_offset,
                    patch.len()
                );
                continue;
            }
        };

        if tracing::enabled!(tracing::Level::DEBUG) {
            let ip = image_base + rva as u64;
            for line in stub::disassemble(arch, &buffer[start..end], ip) {
                tracing::debug!("  replacing {}", line);
            }
        }

        buffer[start..end].copy_from_slice(patch);
        sites.push(PatchSite { rva, file_offset });
    }

    sites
}

/// Patches images one at a time.
pub struct PatchEngine<S, A, F> {
    source: S,
    access: A,
    fs: F,
    arch: Architecture,
    symbol: String,
    dry_run: bool,
}

impl<S: SymbolSource, A: WriteAccess, F: FileOps> PatchEngine<S, A, F> {
    /// Create an engine for the architecture this binary was built for.
    ///
    /// Fails if there is no stub for it.
    pub fn new(source: S, access: A, fs: F, config: &PatchConfig) -> Result<Self, PatchError> {
        let arch = Architecture::current()
            .ok_or(PatchError::UnsupportedArchitecture(Architecture::current_name()))?;
        Ok(Self {
            source,
            access,
            fs,
            arch,
            symbol: config.symbol.clone(),
            dry_run: config.dry_run,
        })
    }

    /// Use the stub for `arch` instead of the build target's.
    pub fn with_architecture(mut self, arch: Architecture) -> Self {
        self.arch = arch;
        self
    }

    pub fn architecture(&self) -> Architecture {
        self.arch
    }

    /// Patch every image in order, returning the total number of regions patched.
    ///
    /// Per-image failures are logged and skipped. A failure that left an image
    /// missing stops the run at once. `on_image` is called with the index and
    /// name of each image before it is attempted.
    pub fn patch_all<P>(&self, images: &[String], mut on_image: P) -> crate::Result<u32>
    where
        P: FnMut(usize, &str),
    {
        let mut patched = 0;
        for (index, image) in images.iter().enumerate() {
            on_image(index, image);
            match self.patch_image(image) {
                Ok(count) => patched += count,
                Err(e) if e.is_catastrophic() => return Err(e.into()),
                Err(e) => tracing::warn!("skipping {}: {}", image, e),
            }
        }

        if patched == 0 {
            return Err(Error::NonePatched);
        }
        Ok(patched)
    }

    /// Patch `image_name`, returning how many regions were overwritten.
    pub fn patch_image(&self, image_name: &str) -> Result<u32, PatchError> {
        self.patch(image_name).map(|report| report.patched())
    }

    /// Patch `image_name` and report every site.
    pub fn patch(&self, image_name: &str) -> Result<PatchReport, PatchError> {
        tracing::info!("trying image {}", image_name);

        let resolution = self.source.resolve(image_name, &self.symbol)?;
        let image = resolution.image;
        let rvas = resolution.rvas;

        let mut report = PatchReport {
            image,
            rvas_found: rvas.len(),
            sites: Vec::new(),
            backup: None,
        };

        if rvas.is_empty() {
            tracing::info!("{} not found in {}", self.symbol, image_name);
            return Ok(report);
        }

        let path = report.image.path.clone();
        let mut buffer = match std::fs::read(&path) {
            Ok(buffer) if !buffer.is_empty() => buffer,
            Ok(_) => return Err(PatchError::ReadFailed(path)),
            Err(e) => {
                tracing::error!("can't read {}: {}", path.display(), e);
                return Err(PatchError::ReadFailed(path));
            }
        };
        tracing::debug!(
            "read {} ({})",
            path.display(),
            ByteSize::b(buffer.len() as u64)
        );

        if let Some(machine) = pe::machine(&buffer) {
            if machine != self.arch.machine() {
                return Err(PatchError::MachineMismatch {
                    expected: self.arch.machine(),
                    found: machine,
                });
            }
        }

        report.sites = apply_stub(&mut buffer, &rvas, self.arch, report.image.base);

        if report.sites.is_empty() {
            tracing::warn!(
                "{} found {} time(s) in {} but no patchable bytes",
                self.symbol,
                rvas.len(),
                image_name
            );
            return Ok(report);
        }

        if self.dry_run {
            tracing::info!(
                "dry run: would patch {} site(s) in {}",
                report.sites.len(),
                path.display()
            );
            return Ok(report);
        }

        let backup = FileTransaction::new(&self.access, &self.fs).swap(&path, &buffer)?;
        tracing::info!(
            "patched {} site(s) in {}, backup at {}",
            report.sites.len(),
            path.display(),
            backup.display()
        );
        report.backup = Some(backup);

        Ok(report)
    }
}
