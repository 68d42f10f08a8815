//! End-to-end patching of synthetic images on disk.
//!
//! The images are minimal PE files laid out like a small x64 DLL:
//! - `.text` at RVA 0x1000, raw data at 0x400 (code)
//! - `.rdata` at RVA 0x3000, raw data at 0x2400
//! - `.bss` at RVA 0x4000, no raw data
//!
//! A fake symbol source stands in for DbgHelp and reports a fixed set of RVAs.

use std::cell::RefCell;
use std::collections::HashMap;
use std::io;
use std::path::{Path, PathBuf};

use themepatch::error::{PatchError, ResolveError, ReturnCode};
use themepatch::ownership::WriteAccess;
use themepatch::pe::{self, MACHINE_AMD64};
use themepatch::stub::{stub_for, Architecture};
use themepatch::transaction::FileOps;
use themepatch::{Error, Image, PatchConfig, PatchEngine, Resolution, StdFileOps, SymbolSource};

const PE_OFFSET: usize = 0x80;
const FILE_SIZE: usize = 0x2C00;

const TEXT_RVA: u32 = 0x1000;
const TEXT_RAW: u32 = 0x400;
const RDATA_RVA: u32 = 0x3000;
const RDATA_RAW: u32 = 0x2400;
const BSS_RVA: u32 = 0x4000;

/// Build a minimal x64 image with `.text`, `.rdata` and `.bss`.
fn build_image() -> Vec<u8> {
    let sections: [(&str, u32, u32, u32, u32); 3] = [
        (".text", TEXT_RVA, 0x1F00, 0x2000, TEXT_RAW),
        (".rdata", RDATA_RVA, 0x0800, 0x0800, RDATA_RAW),
        (".bss", BSS_RVA, 0x1000, 0, 0),
    ];

    let mut image = vec![0u8; FILE_SIZE];
    image[0..2].copy_from_slice(b"MZ");
    image[0x3C..0x40].copy_from_slice(&(PE_OFFSET as i32).to_le_bytes());
    image[PE_OFFSET..PE_OFFSET + 4].copy_from_slice(b"PE\0\0");

    let fh = PE_OFFSET + 4;
    image[fh..fh + 2].copy_from_slice(&MACHINE_AMD64.to_le_bytes());
    image[fh + 2..fh + 4].copy_from_slice(&(sections.len() as u16).to_le_bytes());
    image[fh + 16..fh + 18].copy_from_slice(&0xF0u16.to_le_bytes());

    let mut sh = fh + 20 + 0xF0;
    for (name, va, vsize, raw_size, raw_ptr) in sections {
        image[sh..sh + name.len()].copy_from_slice(name.as_bytes());
        image[sh + 8..sh + 12].copy_from_slice(&vsize.to_le_bytes());
        image[sh + 12..sh + 16].copy_from_slice(&va.to_le_bytes());
        image[sh + 16..sh + 20].copy_from_slice(&raw_size.to_le_bytes());
        image[sh + 20..sh + 24].copy_from_slice(&raw_ptr.to_le_bytes());
        sh += 40;
    }

    // push rbp ; mov rbp, rsp filler so every byte of code is non-zero
    for chunk in image[TEXT_RAW as usize..RDATA_RAW as usize].chunks_mut(4) {
        let filler = [0x55, 0x48, 0x89, 0xE5];
        chunk.copy_from_slice(&filler[..chunk.len()]);
    }
    image
}

/// Symbol source returning canned RVAs per image name.
struct CannedSymbols {
    dir: PathBuf,
    rvas: HashMap<&'static str, Vec<u32>>,
    attempts: RefCell<Vec<String>>,
}

impl SymbolSource for CannedSymbols {
    fn resolve(&self, image_name: &str, _symbol: &str) -> Result<Resolution, ResolveError> {
        self.attempts.borrow_mut().push(image_name.to_string());
        let Some(rvas) = self.rvas.get(image_name) else {
            return Err(ResolveError::LoadFailed {
                image: image_name.to_string(),
                reason: "The specified module could not be found.".to_string(),
            });
        };
        Ok(Resolution {
            image: Image {
                name: image_name.to_string(),
                path: self.dir.join(format!("{}.dll", image_name)),
                base: 0x7FFA_0000_0000,
            },
            rvas: rvas.iter().copied().collect(),
        })
    }
}

struct AlwaysWritable;

/// Real filesystem, except that nothing can be moved onto `<locked>.dll`.
struct LockedImage {
    locked: PathBuf,
}

impl FileOps for LockedImage {
    fn write(&self, path: &Path, bytes: &[u8]) -> io::Result<()> {
        StdFileOps.write(path, bytes)
    }

    fn rename(&self, from: &Path, to: &Path) -> io::Result<()> {
        if to == self.locked {
            return Err(io::Error::new(io::ErrorKind::PermissionDenied, "in use"));
        }
        StdFileOps.rename(from, to)
    }

    fn exists(&self, path: &Path) -> bool {
        StdFileOps.exists(path)
    }
}

impl WriteAccess for AlwaysWritable {
    fn ensure_writable(&self, _path: &Path) -> bool {
        true
    }
}

fn setup(images: &[(&'static str, Vec<u32>)]) -> (tempfile::TempDir, CannedSymbols, Vec<u8>) {
    let dir = tempfile::tempdir().unwrap();
    let image = build_image();
    for (name, _) in images {
        std::fs::write(dir.path().join(format!("{}.dll", name)), &image).unwrap();
    }
    let source = CannedSymbols {
        dir: dir.path().to_path_buf(),
        rvas: images.iter().cloned().collect(),
        attempts: RefCell::new(Vec::new()),
    };
    (dir, source, image)
}

fn bak(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push(".bak");
    PathBuf::from(name)
}

#[test]
fn test_all_rvas_patched_with_backup() {
    let rvas = vec![TEXT_RVA + 0x10, TEXT_RVA + 0x800, RDATA_RVA + 0x40];
    let (dir, source, original) = setup(&[("uxtheme", rvas.clone())]);
    let engine = PatchEngine::new(source, AlwaysWritable, StdFileOps, &PatchConfig::default())
        .unwrap()
        .with_architecture(Architecture::X64);

    let report = engine.patch("uxtheme").unwrap();

    assert_eq!(report.patched(), 3);
    let path = dir.path().join("uxtheme.dll");
    let patched = std::fs::read(&path).unwrap();
    let stub = stub_for(Architecture::X64);

    for &rva in &rvas {
        let offset = pe::translate(&original, rva).unwrap() as usize;
        assert_eq!(&patched[offset..offset + stub.len()], stub, "rva {:#x}", rva);
    }

    // Nothing outside the stub regions changed.
    let mut expected = original.clone();
    for site in &report.sites {
        let offset = site.file_offset as usize;
        expected[offset..offset + stub.len()].copy_from_slice(stub);
    }
    assert_eq!(patched, expected);

    assert_eq!(report.backup.as_deref(), Some(bak(&path).as_path()));
    assert_eq!(std::fs::read(bak(&path)).unwrap(), original);
}

#[test]
fn test_patch_all_sums_partial_success() {
    // themeui can't be loaded, uxinit has no match, themeservice has one RVA in .bss.
    let (dir, source, original) = setup(&[
        ("themeservice", vec![BSS_RVA + 0x10]),
        ("uxinit", vec![]),
        ("uxtheme", vec![TEXT_RVA + 0x20, TEXT_RVA + 0x20]),
    ]);
    let config = PatchConfig::default();
    let engine = PatchEngine::new(source, AlwaysWritable, StdFileOps, &config)
        .unwrap()
        .with_architecture(Architecture::X64);

    let mut seen = Vec::new();
    let total = engine
        .patch_all(&config.images, |index, image| seen.push((index, image.to_string())))
        .unwrap();

    // duplicate RVA collapses to one site
    assert_eq!(total, 1);
    assert_eq!(seen.len(), config.images.len());
    assert_eq!(seen[3], (3, "uxtheme".to_string()));
    assert_eq!(
        std::fs::read(dir.path().join("themeservice.dll")).unwrap(),
        original
    );
    assert!(!bak(&dir.path().join("uxinit.dll")).exists());
    assert!(bak(&dir.path().join("uxtheme.dll")).exists());
}

#[test]
fn test_patch_all_nothing_patched() {
    let (dir, source, original) = setup(&[
        ("themeservice", vec![BSS_RVA]),
        ("uxtheme", vec![]),
    ]);
    let config = PatchConfig::default();
    let engine = PatchEngine::new(source, AlwaysWritable, StdFileOps, &config)
        .unwrap()
        .with_architecture(Architecture::X64);

    let err = engine.patch_all(&config.images, |_, _| {}).unwrap_err();

    assert!(matches!(err, Error::NonePatched));
    assert_eq!(err.return_code(), ReturnCode::NonePatched);
    assert_eq!(
        std::fs::read(dir.path().join("uxtheme.dll")).unwrap(),
        original
    );
}

#[test]
fn test_patch_all_dry_run_counts_without_writing() {
    let (dir, source, original) = setup(&[
        ("themeui", vec![TEXT_RVA]),
        ("uxtheme", vec![TEXT_RVA + 0x40]),
    ]);
    let config = PatchConfig {
        dry_run: true,
        ..PatchConfig::default()
    };
    let engine = PatchEngine::new(source, AlwaysWritable, StdFileOps, &config)
        .unwrap()
        .with_architecture(Architecture::X64);

    // the would-patch count still reaches the caller
    assert_eq!(engine.patch_all(&config.images, |_, _| {}).unwrap(), 2);
    for name in ["themeui.dll", "uxtheme.dll"] {
        let path = dir.path().join(name);
        assert_eq!(std::fs::read(&path).unwrap(), original);
        assert!(!bak(&path).exists());
    }
}

#[test]
fn test_patch_all_stops_when_image_left_missing() {
    let (dir, source, original) = setup(&[
        ("themeui", vec![TEXT_RVA]),
        ("themeservice", vec![TEXT_RVA]),
        ("uxinit", vec![TEXT_RVA]),
        ("uxtheme", vec![TEXT_RVA]),
    ]);
    let locked = dir.path().join("themeservice.dll");
    let config = PatchConfig::default();
    let fs = LockedImage {
        locked: locked.clone(),
    };
    let engine = PatchEngine::new(&source, AlwaysWritable, fs, &config)
        .unwrap()
        .with_architecture(Architecture::X64);

    let err = engine.patch_all(&config.images, |_, _| {}).unwrap_err();

    assert_eq!(err.return_code(), ReturnCode::OriginalMissing);
    assert!(!locked.exists());
    assert_eq!(std::fs::read(bak(&locked)).unwrap(), original);
    // uxinit and uxtheme were never attempted
    assert_eq!(*source.attempts.borrow(), ["themeui", "themeservice"]);
    assert_eq!(
        std::fs::read(dir.path().join("uxinit.dll")).unwrap(),
        original
    );
}

#[test]
fn test_arm64_stub_on_x64_image_is_rejected() {
    let (dir, source, original) = setup(&[("uxtheme", vec![TEXT_RVA])]);
    let engine = PatchEngine::new(source, AlwaysWritable, StdFileOps, &PatchConfig::default())
        .unwrap()
        .with_architecture(Architecture::Arm64);

    let err = engine.patch_image("uxtheme").unwrap_err();

    assert!(matches!(err, PatchError::MachineMismatch { .. }));
    assert_eq!(
        std::fs::read(dir.path().join("uxtheme.dll")).unwrap(),
        original
    );
}
