//! Return-success patch stubs.
//!
//! Each stub replaces the entry of a function returning a `BOOL`/`HRESULT` so that
//! it returns zero immediately without touching its arguments:
//!
//! ```text
//! x86:    xor eax, eax ; ret 8     (__stdcall/__thiscall, callee pops 2 stack args)
//! x64:    xor eax, eax ; ret
//! arm64:  mov w0, #0   ; ret
//! ```
//!
//! The stub is selected by the build target, never detected at runtime.

use crate::pe::{MACHINE_AMD64, MACHINE_ARM64, MACHINE_I386};

use iced_x86::{Decoder, DecoderOptions};

/// Target architectures with a known stub.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Architecture {
    X86,
    X64,
    Arm64,
}

const STUB_X86: &[u8] = &[
    0x31, 0xC0, // xor eax, eax
    0xC2, 0x08, 0x00, // ret 8
];

const STUB_X64: &[u8] = &[
    0x31, 0xC0, // xor eax, eax
    0xC3, // ret
];

const STUB_ARM64: &[u8] = &[
    0x00, 0x00, 0x80, 0x52, // mov w0, #0
    0xC0, 0x03, 0x5F, 0xD6, // ret
];

/// The stub table, one entry per architecture.
pub static STUBS: [(Architecture, &[u8]); 3] = [
    (Architecture::X86, STUB_X86),
    (Architecture::X64, STUB_X64),
    (Architecture::Arm64, STUB_ARM64),
];

impl Architecture {
    /// Architecture this binary was built for, if it has a stub.
    pub const fn current() -> Option<Self> {
        if cfg!(target_arch = "x86") {
            Some(Self::X86)
        } else if cfg!(target_arch = "x86_64") {
            Some(Self::X64)
        } else if cfg!(target_arch = "aarch64") {
            Some(Self::Arm64)
        } else {
            None
        }
    }

    /// Name of the architecture of this build, for diagnostics.
    pub const fn current_name() -> &'static str {
        std::env::consts::ARCH
    }

    /// COFF machine type that images for this architecture carry.
    pub const fn machine(self) -> u16 {
        match self {
            Self::X86 => MACHINE_I386,
            Self::X64 => MACHINE_AMD64,
            Self::Arm64 => MACHINE_ARM64,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Self::X86 => "x86",
            Self::X64 => "x64",
            Self::Arm64 => "arm64",
        }
    }

    /// Decoder bitness for x86 family architectures.
    fn bitness(self) -> Option<u32> {
        match self {
            Self::X86 => Some(32),
            Self::X64 => Some(64),
            Self::Arm64 => None,
        }
    }
}

/// Patch bytes for `arch`.
pub const fn stub_for(arch: Architecture) -> &'static [u8] {
    match arch {
        Architecture::X86 => STUB_X86,
        Architecture::X64 => STUB_X64,
        Architecture::Arm64 => STUB_ARM64,
    }
}

/// Render `code` as one line per instruction, for logging what a patch replaces.
///
/// x86 and x64 code is decoded; ARM64 is shown as 32-bit words.
pub fn disassemble(arch: Architecture, code: &[u8], ip: u64) -> Vec<String> {
    let Some(bitness) = arch.bitness() else {
        return code
            .chunks(4)
            .enumerate()
            .map(|(i, word)| format!("{:016X} {}", ip + (i * 4) as u64, hex(word)))
            .collect();
    };

    let mut decoder = Decoder::with_ip(bitness, code, ip, DecoderOptions::NONE);
    let mut lines = Vec::new();
    while decoder.can_decode() {
        let start = decoder.position();
        let instr = decoder.decode();
        let end = decoder.position();
        if end <= start {
            break;
        }
        let bytes = &code[start..end];
        lines.push(format!("{:016X} {:<20} {}", instr.ip(), hex(bytes), instr));
    }
    lines
}

fn hex(bytes: &[u8]) -> String {
    bytes
        .iter()
        .map(|b| format!("{:02X}", b))
        .collect::<Vec<_>>()
        .join(" ")
}
