//! PE format parsing and RVA to file offset translation.
//!
//! This module reads just enough of a PE image from a raw file buffer to walk
//! its section table: the DOS header, the NT signature, the COFF file header
//! and the section headers. Nothing here allocates beyond the section list or
//! performs I/O, so every function is safe to call from anywhere.

// PE format constants
pub const DOS_MAGIC: u16 = 0x5A4D; // "MZ"
pub const PE_SIGNATURE: u32 = 0x0000_4550; // "PE\0\0"
pub const MACHINE_I386: u16 = 0x014C;
pub const MACHINE_AMD64: u16 = 0x8664;
pub const MACHINE_ARM64: u16 = 0xAA64;

/// DOS header (64 bytes).
#[repr(C, packed)]
#[derive(Clone, Copy, Debug)]
pub struct DosHeader {
    pub e_magic: u16,      // Magic number ("MZ")
    pub e_cblp: u16,       // Bytes on last page of file
    pub e_cp: u16,         // Pages in file
    pub e_crlc: u16,       // Relocations
    pub e_cparhdr: u16,    // Size of header in paragraphs
    pub e_minalloc: u16,   // Minimum extra paragraphs needed
    pub e_maxalloc: u16,   // Maximum extra paragraphs needed
    pub e_ss: u16,         // Initial SS value
    pub e_sp: u16,         // Initial SP value
    pub e_csum: u16,       // Checksum
    pub e_ip: u16,         // Initial IP value
    pub e_cs: u16,         // Initial CS value
    pub e_lfarlc: u16,     // File address of relocation table
    pub e_ovno: u16,       // Overlay number
    pub e_res: [u16; 4],   // Reserved words
    pub e_oemid: u16,      // OEM identifier
    pub e_oeminfo: u16,    // OEM information
    pub e_res2: [u16; 10], // Reserved words
    pub e_lfanew: i32,     // File address of new exe header (PE offset)
}

/// COFF file header (20 bytes).
#[repr(C, packed)]
#[derive(Clone, Copy, Debug)]
pub struct FileHeader {
    pub machine: u16,
    pub number_of_sections: u16,
    pub time_date_stamp: u32,
    pub pointer_to_symbol_table: u32,
    pub number_of_symbols: u32,
    pub size_of_optional_header: u16,
    pub characteristics: u16,
}

/// Section header (40 bytes).
#[repr(C, packed)]
#[derive(Clone, Copy, Debug)]
pub struct SectionHeader {
    pub name: [u8; 8],
    pub virtual_size: u32,
    pub virtual_address: u32,
    pub size_of_raw_data: u32,
    pub pointer_to_raw_data: u32,
    pub pointer_to_relocations: u32,
    pub pointer_to_linenumbers: u32,
    pub number_of_relocations: u16,
    pub number_of_linenumbers: u16,
    pub characteristics: u32,
}

impl SectionHeader {
    /// Get the section name as a string (trimmed of null bytes).
    pub fn name_str(&self) -> &str {
        let name_slice = &self.name;
        let end = name_slice.iter().position(|&b| b == 0).unwrap_or(8);
        std::str::from_utf8(&name_slice[..end]).unwrap_or("")
    }
}

/// Read-only view of one section, extracted at translation time.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SectionDescriptor {
    pub name: String,
    pub virtual_address: u32,
    pub virtual_size: u32,
    pub size_of_raw_data: u32,
    pub pointer_to_raw_data: u32,
}

impl From<&SectionHeader> for SectionDescriptor {
    fn from(header: &SectionHeader) -> Self {
        Self {
            name: header.name_str().to_string(),
            virtual_address: header.virtual_address,
            virtual_size: header.virtual_size,
            size_of_raw_data: header.size_of_raw_data,
            pointer_to_raw_data: header.pointer_to_raw_data,
        }
    }
}

impl SectionDescriptor {
    /// Whether the section has any bytes backed by the file.
    #[inline]
    pub fn has_raw_data(&self) -> bool {
        self.pointer_to_raw_data != 0 && self.size_of_raw_data != 0
    }

    /// Whether `rva` falls inside the file-backed part of this section.
    #[inline]
    pub fn contains(&self, rva: u32) -> bool {
        rva >= self.virtual_address && rva - self.virtual_address < self.size_of_raw_data
    }

    /// File offset of `rva`, if this section maps it.
    pub fn file_offset(&self, rva: u32) -> Option<u32> {
        if !self.has_raw_data() || !self.contains(rva) {
            return None;
        }
        (rva - self.virtual_address).checked_add(self.pointer_to_raw_data)
    }
}

/// Copy a `T` out of `bytes` at `offset`, or `None` if it doesn't fit.
fn read_at<T: Copy>(bytes: &[u8], offset: usize) -> Option<T> {
    let end = offset.checked_add(std::mem::size_of::<T>())?;
    if end > bytes.len() {
        return None;
    }
    // SAFETY: bounds checked above; T is a packed plain-old-data header type.
    Some(unsafe { std::ptr::read_unaligned(bytes.as_ptr().add(offset) as *const T) })
}

/// Locate and validate the NT headers.
///
/// Returns the offset of the PE signature and the COFF file header, or `None`
/// when either magic marker is missing.
fn nt_headers(image: &[u8]) -> Option<(usize, FileHeader)> {
    let dos_header: DosHeader = read_at(image, 0)?;
    if dos_header.e_magic != DOS_MAGIC {
        return None;
    }

    let pe_offset = usize::try_from(dos_header.e_lfanew).ok()?;
    let signature: u32 = read_at(image, pe_offset)?;
    if signature != PE_SIGNATURE {
        return None;
    }

    let file_header: FileHeader = read_at(image, pe_offset + 4)?;
    Some((pe_offset, file_header))
}

/// Machine type from the COFF file header.
pub fn machine(image: &[u8]) -> Option<u16> {
    nt_headers(image).map(|(_, file_header)| file_header.machine)
}

/// Parse the section table in stored order.
///
/// A table truncated by the end of the buffer yields the headers that fit.
pub fn sections(image: &[u8]) -> Option<Vec<SectionDescriptor>> {
    let (pe_offset, file_header) = nt_headers(image)?;

    let section_header_start = pe_offset
        + 4
        + std::mem::size_of::<FileHeader>()
        + file_header.size_of_optional_header as usize;
    let number_of_sections = file_header.number_of_sections as usize;

    let mut sections = Vec::with_capacity(number_of_sections);
    for i in 0..number_of_sections {
        let section_offset = section_header_start + i * std::mem::size_of::<SectionHeader>();
        match read_at::<SectionHeader>(image, section_offset) {
            Some(header) => sections.push(SectionDescriptor::from(&header)),
            None => break,
        }
    }

    Some(sections)
}

/// Translate an RVA into a raw file offset.
///
/// Walks the section table linearly and uses the first section with raw data
/// whose range contains `rva`. Returns `None` for malformed headers and for
/// RVAs with no file backing (headers, `.bss`, virtual tails).
pub fn translate(image: &[u8], rva: u32) -> Option<u32> {
    sections(image)?
        .iter()
        .find(|s| s.has_raw_data() && s.contains(rva))
        .and_then(|s| s.file_offset(rva))
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    pub(crate) const PE_OFFSET: usize = 0x80;
    pub(crate) const OPTIONAL_HEADER_SIZE: u16 = 0xF0;

    /// (name, virtual_address, virtual_size, size_of_raw_data, pointer_to_raw_data)
    pub(crate) type SectionSpec = (&'static str, u32, u32, u32, u32);

    /// Build a minimal PE image with the given section table, padded to `file_size`.
    pub(crate) fn build_image(machine: u16, sections: &[SectionSpec], file_size: usize) -> Vec<u8> {
        let mut image = vec![0u8; file_size];
        image[0..2].copy_from_slice(&DOS_MAGIC.to_le_bytes());
        image[0x3C..0x40].copy_from_slice(&(PE_OFFSET as i32).to_le_bytes());
        image[PE_OFFSET..PE_OFFSET + 4].copy_from_slice(&PE_SIGNATURE.to_le_bytes());

        let fh = PE_OFFSET + 4;
        image[fh..fh + 2].copy_from_slice(&machine.to_le_bytes());
        image[fh + 2..fh + 4].copy_from_slice(&(sections.len() as u16).to_le_bytes());
        image[fh + 16..fh + 18].copy_from_slice(&OPTIONAL_HEADER_SIZE.to_le_bytes());

        let mut sh = fh + 20 + OPTIONAL_HEADER_SIZE as usize;
        for &(name, va, vsize, raw_size, raw_ptr) in sections {
            let len = name.len().min(8);
            image[sh..sh + len].copy_from_slice(&name.as_bytes()[..len]);
            image[sh + 8..sh + 12].copy_from_slice(&vsize.to_le_bytes());
            image[sh + 12..sh + 16].copy_from_slice(&va.to_le_bytes());
            image[sh + 16..sh + 20].copy_from_slice(&raw_size.to_le_bytes());
            image[sh + 20..sh + 24].copy_from_slice(&raw_ptr.to_le_bytes());
            sh += 40;
        }
        image
    }

    fn sample_image() -> Vec<u8> {
        build_image(
            MACHINE_AMD64,
            &[
                (".text", 0x1000, 0x1800, 0x2000, 0x400),
                (".rdata", 0x3000, 0x0800, 0x0800, 0x2400),
                (".bss", 0x4000, 0x1000, 0, 0),
                (".data", 0x5000, 0x0200, 0x0200, 0x2C00),
            ],
            0x2E00,
        )
    }

    #[test]
    fn test_header_sizes() {
        assert_eq!(std::mem::size_of::<DosHeader>(), 64);
        assert_eq!(std::mem::size_of::<FileHeader>(), 20);
        assert_eq!(std::mem::size_of::<SectionHeader>(), 40);
    }

    #[test]
    fn test_sections_in_stored_order() {
        let sections = sections(&sample_image()).unwrap();
        let names: Vec<_> = sections.iter().map(|s| s.name.as_str()).collect();
        assert_eq!(names, [".text", ".rdata", ".bss", ".data"]);
    }

    #[test]
    fn test_machine() {
        assert_eq!(machine(&sample_image()), Some(MACHINE_AMD64));
    }

    #[test]
    fn test_translate_round_trip() {
        let image = sample_image();
        for s in sections(&image).unwrap().iter().filter(|s| s.has_raw_data()) {
            for k in [0, 1, s.size_of_raw_data / 2, s.size_of_raw_data - 1] {
                assert_eq!(
                    translate(&image, s.virtual_address + k),
                    Some(k + s.pointer_to_raw_data),
                    "section {} k={:#x}",
                    s.name,
                    k
                );
            }
        }
    }

    #[test]
    fn test_translate_virtual_only_section() {
        let image = sample_image();
        assert_eq!(translate(&image, 0x4000), None);
        assert_eq!(translate(&image, 0x4800), None);
    }

    #[test]
    fn test_translate_outside_sections() {
        let image = sample_image();
        // headers
        assert_eq!(translate(&image, 0x10), None);
        // past the last section
        assert_eq!(translate(&image, 0x9000), None);
        // one past the raw data of .rdata
        assert_eq!(translate(&image, 0x3800), None);
    }

    #[test]
    fn test_translate_first_match_wins() {
        let image = build_image(
            MACHINE_AMD64,
            &[
                (".a", 0x1000, 0x1000, 0x1000, 0x400),
                (".b", 0x1000, 0x1000, 0x1000, 0x1400),
            ],
            0x2400,
        );
        assert_eq!(translate(&image, 0x1010), Some(0x410));
    }

    #[test]
    fn test_translate_skips_zero_raw_pointer() {
        let image = build_image(
            MACHINE_AMD64,
            &[(".text", 0x1000, 0x1000, 0x1000, 0)],
            0x400,
        );
        assert_eq!(translate(&image, 0x1000), None);
    }

    #[test]
    fn test_translate_is_deterministic() {
        let image = sample_image();
        assert_eq!(translate(&image, 0x1234), translate(&image, 0x1234));
    }

    #[test]
    fn test_bad_dos_magic() {
        let mut image = sample_image();
        image[0] = b'X';
        assert_eq!(translate(&image, 0x1000), None);
        assert_eq!(machine(&image), None);
    }

    #[test]
    fn test_bad_pe_signature() {
        let mut image = sample_image();
        image[PE_OFFSET + 1] = b'X';
        assert_eq!(translate(&image, 0x1000), None);
    }

    #[test]
    fn test_truncated_and_empty_buffers() {
        assert_eq!(translate(&[], 0x1000), None);
        assert_eq!(translate(&sample_image()[..0x40], 0x1000), None);

        let mut image = sample_image();
        image[0x3C..0x40].copy_from_slice(&(-4i32).to_le_bytes());
        assert_eq!(translate(&image, 0x1000), None);
    }

    #[test]
    fn test_section_name() {
        let sections = sections(&build_image(
            MACHINE_AMD64,
            &[(".verylongname", 0x1000, 0, 0, 0)],
            0x400,
        ))
        .unwrap();
        assert_eq!(sections[0].name, ".verylon"); // Truncated to 8 chars
    }
}
