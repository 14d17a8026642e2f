//! PE header parsing
//!
//! Reads the headers the loader left mapped at the image base: section
//! table, timestamp, image size and the exception directory used to find
//! function boundaries.

use super::MemoryView;
use crate::error::{Result, ScanError};

use byteorder::{ByteOrder, LE};

/// Location of e_lfanew in the DOS header
const PE_HEADER_OFFSET_LOCATION: usize = 0x3C;
const PE_HEADER_MAX_OFFSET: usize = 0x1000;
const SECTION_HEADER_SIZE: usize = 40;
const PE32_PLUS_MAGIC: u16 = 0x20B;
const EXCEPTION_DIRECTORY_INDEX: usize = 3;

pub const IMAGE_SCN_CNT_CODE: u32 = 0x0000_0020;
pub const IMAGE_SCN_CNT_INITIALIZED_DATA: u32 = 0x0000_0040;
pub const IMAGE_SCN_MEM_EXECUTE: u32 = 0x2000_0000;
pub const IMAGE_SCN_MEM_READ: u32 = 0x4000_0000;
pub const IMAGE_SCN_MEM_WRITE: u32 = 0x8000_0000;

/// UNWIND_INFO flag marking a chained entry
const UNW_FLAG_CHAININFO: u8 = 0x4;

#[derive(Debug, Clone)]
pub struct PeSection {
    pub name: String,
    pub virtual_address: usize,
    pub virtual_size: usize,
    pub characteristics: u32,
}

impl PeSection {
    pub fn is_executable(&self) -> bool {
        (self.characteristics & (IMAGE_SCN_MEM_EXECUTE | IMAGE_SCN_CNT_CODE)) != 0
    }

    pub fn is_writable(&self) -> bool {
        (self.characteristics & IMAGE_SCN_MEM_WRITE) != 0
    }

    pub fn is_initialized_data(&self) -> bool {
        (self.characteristics & IMAGE_SCN_CNT_INITIALIZED_DATA) != 0
    }
}

#[derive(Debug, Clone)]
pub struct PeHeaders {
    pub timestamp: u32,
    pub size_of_image: usize,
    pub sections: Vec<PeSection>,
    /// (rva, size) of the exception directory
    pub exception_directory: Option<(usize, usize)>,
}

/// One `.pdata` entry, as RVAs
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RuntimeFunction {
    pub begin: u32,
    pub end: u32,
    pub unwind: u32,
}

/// Parse the PE headers mapped at `base`
pub fn parse_headers(view: &MemoryView, base: usize) -> Result<PeHeaders> {
    let dos_header = view.read_bytes(base, 64)?;
    if &dos_header[0..2] != b"MZ" {
        return Err(ScanError::not_found(format!(
            "DOS signature at {:#x}",
            base
        )));
    }

    let pe_offset =
        LE::read_u32(&dos_header[PE_HEADER_OFFSET_LOCATION..PE_HEADER_OFFSET_LOCATION + 4])
            as usize;
    if pe_offset == 0 || pe_offset > PE_HEADER_MAX_OFFSET {
        return Err(ScanError::invalid(format!("PE offset {:#x}", pe_offset)));
    }

    // PE signature + COFF header + PE32+ optional header with all 16 directories
    let pe_header = view.read_bytes(base + pe_offset, 24 + 240)?;
    if &pe_header[0..4] != b"PE\0\0" {
        return Err(ScanError::invalid(format!(
            "PE signature at {:#x}",
            base + pe_offset
        )));
    }

    let number_of_sections = LE::read_u16(&pe_header[6..8]) as usize;
    let timestamp = LE::read_u32(&pe_header[8..12]);
    let size_of_optional_header = LE::read_u16(&pe_header[20..22]) as usize;

    if number_of_sections == 0 || number_of_sections > 100 {
        return Err(ScanError::invalid(format!(
            "section count {}",
            number_of_sections
        )));
    }

    let optional = &pe_header[24..];
    if LE::read_u16(&optional[0..2]) != PE32_PLUS_MAGIC {
        return Err(ScanError::invalid("optional header is not PE32+"));
    }
    let size_of_image = LE::read_u32(&optional[56..60]) as usize;
    let directory_count = LE::read_u32(&optional[108..112]) as usize;

    let exception_directory = if directory_count > EXCEPTION_DIRECTORY_INDEX {
        let at = 112 + EXCEPTION_DIRECTORY_INDEX * 8;
        let rva = LE::read_u32(&optional[at..at + 4]) as usize;
        let size = LE::read_u32(&optional[at + 4..at + 8]) as usize;
        (rva != 0 && size != 0).then_some((rva, size))
    } else {
        None
    };

    let sections_offset = pe_offset + 24 + size_of_optional_header;
    let sections_data = view.read_bytes(
        base + sections_offset,
        number_of_sections * SECTION_HEADER_SIZE,
    )?;

    let sections = sections_data
        .chunks_exact(SECTION_HEADER_SIZE)
        .map(|header| {
            let name_bytes = &header[0..8];
            let name_end = name_bytes.iter().position(|&b| b == 0).unwrap_or(8);
            PeSection {
                name: String::from_utf8_lossy(&name_bytes[..name_end]).to_string(),
                virtual_size: LE::read_u32(&header[8..12]) as usize,
                virtual_address: LE::read_u32(&header[12..16]) as usize,
                characteristics: LE::read_u32(&header[36..40]),
            }
        })
        .collect();

    Ok(PeHeaders {
        timestamp,
        size_of_image,
        sections,
        exception_directory,
    })
}

/// Load the exception directory, sorted by begin address
pub fn read_runtime_functions(
    view: &MemoryView,
    base: usize,
    directory: (usize, usize),
) -> Result<Vec<RuntimeFunction>> {
    let (rva, size) = directory;
    let data = view.read_bytes(base + rva, size - size % 12)?;
    let mut functions: Vec<RuntimeFunction> = data
        .chunks_exact(12)
        .map(|entry| RuntimeFunction {
            begin: LE::read_u32(&entry[0..4]),
            end: LE::read_u32(&entry[4..8]),
            unwind: LE::read_u32(&entry[8..12]),
        })
        .filter(|f| f.begin < f.end)
        .collect();
    functions.sort_by_key(|f| f.begin);
    Ok(functions)
}

/// Find the entry covering `rva` and follow chained unwind info to the
/// primary entry, whose begin address is the real function start.
pub fn root_function(
    view: &MemoryView,
    base: usize,
    functions: &[RuntimeFunction],
    rva: u32,
) -> Option<RuntimeFunction> {
    let index = functions.partition_point(|f| f.begin <= rva).checked_sub(1)?;
    let mut current = functions[index];
    if rva >= current.end {
        return None;
    }

    for _ in 0..32 {
        let header = view.read_bytes(base + current.unwind as usize, 4).ok()?;
        let flags = header[0] >> 3;
        if flags & UNW_FLAG_CHAININFO == 0 {
            return Some(current);
        }
        let code_count = header[2] as usize;
        let chained_at = base + current.unwind as usize + 4 + ((code_count + 1) & !1) * 2;
        let chained = view.read_bytes(chained_at, 12).ok()?;
        current = RuntimeFunction {
            begin: LE::read_u32(&chained[0..4]),
            end: LE::read_u32(&chained[4..8]),
            unwind: LE::read_u32(&chained[8..12]),
        };
    }
    None
}

/// Builders for synthetic PE images used by tests across the crate
#[cfg(test)]
pub(crate) mod testing {
    use byteorder::{ByteOrder, LE};

    pub struct SectionSpec<'a> {
        pub name: &'a str,
        pub rva: usize,
        pub size: usize,
        pub characteristics: u32,
    }

    /// Minimal PE32+ header page
    pub fn header_page(
        size_of_image: usize,
        timestamp: u32,
        sections: &[SectionSpec<'_>],
        exception: Option<(usize, usize)>,
    ) -> Vec<u8> {
        let mut page = vec![0u8; 0x1000];
        page[0..2].copy_from_slice(b"MZ");
        let pe = 0x80;
        LE::write_u32(&mut page[0x3C..0x40], pe as u32);
        page[pe..pe + 4].copy_from_slice(b"PE\0\0");
        LE::write_u16(&mut page[pe + 4..pe + 6], 0x8664);
        LE::write_u16(&mut page[pe + 6..pe + 8], sections.len() as u16);
        LE::write_u32(&mut page[pe + 8..pe + 12], timestamp);
        LE::write_u16(&mut page[pe + 20..pe + 22], 240);

        let opt = pe + 24;
        LE::write_u16(&mut page[opt..opt + 2], 0x20B);
        LE::write_u32(&mut page[opt + 56..opt + 60], size_of_image as u32);
        LE::write_u32(&mut page[opt + 108..opt + 112], 16);
        if let Some((rva, size)) = exception {
            let at = opt + 112 + 3 * 8;
            LE::write_u32(&mut page[at..at + 4], rva as u32);
            LE::write_u32(&mut page[at + 4..at + 8], size as u32);
        }

        let mut at = opt + 240;
        for section in sections {
            let name = section.name.as_bytes();
            page[at..at + name.len().min(8)].copy_from_slice(&name[..name.len().min(8)]);
            LE::write_u32(&mut page[at + 8..at + 12], section.size as u32);
            LE::write_u32(&mut page[at + 12..at + 16], section.rva as u32);
            LE::write_u32(&mut page[at + 36..at + 40], section.characteristics);
            at += 40;
        }
        page
    }
}
