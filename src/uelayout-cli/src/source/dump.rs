//! Dump file memory source
//!
//! Two formats:
//! - Windows minidumps (`MDMP`) with a full-memory `Memory64ListStream`,
//!   read through the `minidump` crate; protections come from
//!   `MemoryInfoListStream` and module paths from `ModuleListStream` when
//!   present.
//! - Raw gcore-style dumps, described by a sibling `.maps` file in either
//!   `/proc/<pid>/maps` format or `0xSTART 0xEND SIZE FILE_OFFSET` lines.

use super::process::parse_maps_line;

use anyhow::{bail, Context, Result};
use memmap2::Mmap;
use minidump::{Minidump, MinidumpMemory64List, MinidumpMemoryInfoList, MinidumpModuleList};
use std::fs::File;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};
use uelayout::{MemoryRegion, MemorySource, ScanError};

const MDMP_SIGNATURE: &[u8; 4] = b"MDMP";

pub struct DumpFile {
    mmap: Mmap,
    regions: Vec<MemoryRegion>,
    pub path: PathBuf,
}

impl DumpFile {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file =
            File::open(&path).with_context(|| format!("Failed to open dump file: {:?}", path))?;

        // SAFETY: the dump is opened read-only and not expected to change underneath us.
        let mmap = unsafe { Mmap::map(&file) }
            .with_context(|| format!("Failed to mmap dump file: {:?}", path))?;

        let regions = if mmap.starts_with(MDMP_SIGNATURE) {
            debug!("detected minidump format");
            minidump_regions(&mmap)?
        } else {
            let maps_path = path.with_extension("maps");
            if !maps_path.exists() {
                bail!(
                    "Raw dump {:?} needs a maps file at {:?}",
                    path,
                    maps_path
                );
            }
            parse_maps_file(&maps_path)?
        };

        info!(
            path = %path.display(),
            size_mb = mmap.len() / 1_000_000,
            regions = regions.len(),
            "opened dump"
        );
        Ok(DumpFile {
            mmap,
            regions,
            path,
        })
    }

    fn file_offset(&self, address: usize, size: usize) -> Option<usize> {
        let region = self.regions.iter().find(|r| r.contains(address))?;
        let offset = region.offset + (address - region.start);
        let end = address.checked_add(size)?;
        (end <= region.end && offset + size <= self.mmap.len()).then_some(offset)
    }
}

impl MemorySource for DumpFile {
    fn read_bytes(&self, address: usize, size: usize) -> uelayout::Result<Vec<u8>> {
        let offset = self
            .file_offset(address, size)
            .ok_or(ScanError::Access { address, size })?;
        Ok(self.mmap[offset..offset + size].to_vec())
    }

    fn regions(&self) -> &[MemoryRegion] {
        &self.regions
    }

    fn is_live(&self) -> bool {
        false
    }
}

/// `PAGE_*` protection to a maps permission string
fn protection_perms(protect: u32) -> &'static str {
    match protect & 0xFF {
        0x01 => "---p",
        0x02 => "r--p",
        0x04 | 0x08 => "rw-p",
        0x10 | 0x20 => "r-xp",
        0x40 | 0x80 => "rwxp",
        _ => "rw-p",
    }
}

/// Regions of a minidump, one per `Memory64ListStream` range. Each region's
/// file offset is where the crate found its bytes inside `data`.
pub fn minidump_regions(data: &[u8]) -> Result<Vec<MemoryRegion>> {
    let dump = Minidump::read(data).context("Failed to parse minidump")?;
    let memory = dump
        .get_stream::<MinidumpMemory64List>()
        .context("No Memory64ListStream found in MDMP - dump may be incomplete")?;

    let origin = data.as_ptr() as usize;
    let mut regions = memory
        .iter()
        .map(|range| {
            let offset = (range.bytes.as_ptr() as usize)
                .checked_sub(origin)
                .context("minidump range lies outside the file")?;
            Ok(MemoryRegion {
                start: range.base_address as usize,
                end: range.base_address as usize + range.bytes.len(),
                perms: "rw-p".to_string(),
                offset,
                path: None,
            })
        })
        .collect::<Result<Vec<_>>>()?;
    regions.sort_by_key(|r| r.start);

    match dump.get_stream::<MinidumpMemoryInfoList>() {
        Ok(infos) => {
            for info in infos.iter() {
                let base = info.raw.base_address as usize;
                let end = base + info.raw.region_size as usize;
                let perms = protection_perms(info.raw.protection);
                for region in regions.iter_mut().filter(|r| r.start >= base && r.start < end) {
                    region.perms = perms.to_string();
                }
            }
        }
        Err(e) => warn!(error = %e, "minidump has no memory info, assuming rw"),
    }

    if let Ok(modules) = dump.get_stream::<MinidumpModuleList>() {
        for module in modules.iter() {
            let base = module.raw.base_of_image as usize;
            let end = base + module.raw.size_of_image as usize;
            for region in regions.iter_mut().filter(|r| r.start >= base && r.start < end) {
                region.path = Some(module.name.clone());
            }
        }
    }

    debug!(ranges = regions.len(), "parsed minidump memory list");
    Ok(regions)
}

/// Parse a maps file in either supported format
pub fn parse_maps_file(path: &Path) -> Result<Vec<MemoryRegion>> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to open maps file: {:?}", path))?;
    Ok(parse_maps_text(&text))
}

pub fn parse_maps_text(text: &str) -> Vec<MemoryRegion> {
    let hex = |s: &str| usize::from_str_radix(s.trim_start_matches("0x"), 16).ok();

    text.lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .filter_map(|line| {
            if line.starts_with("0x") {
                // 0xSTART 0xEND SIZE FILE_OFFSET
                let parts: Vec<&str> = line.split_whitespace().collect();
                if parts.len() < 4 {
                    return None;
                }
                Some(MemoryRegion {
                    start: hex(parts[0])?,
                    end: hex(parts[1])?,
                    perms: "rw-p".to_string(),
                    offset: hex(parts[3])?,
                    path: None,
                })
            } else {
                parse_maps_line(line)
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    const MINIDUMP_VERSION: u32 = 0xA793;
    const MODULE_LIST_STREAM: u32 = 4;
    const MEMORY_64_LIST_STREAM: u32 = 9;
    const MEMORY_INFO_LIST_STREAM: u32 = 16;

    fn put_u32(buffer: &mut Vec<u8>, at: usize, value: u32) {
        buffer[at..at + 4].copy_from_slice(&value.to_le_bytes());
    }

    fn put_u64(buffer: &mut Vec<u8>, at: usize, value: u64) {
        buffer[at..at + 8].copy_from_slice(&value.to_le_bytes());
    }

    /// Two ranges (code, data) of one module, with protections and names
    fn minidump() -> Vec<u8> {
        let mut dump = vec![0u8; 0x400];
        dump[..4].copy_from_slice(MDMP_SIGNATURE);
        put_u32(&mut dump, 0x04, MINIDUMP_VERSION);
        put_u32(&mut dump, 0x08, 3);
        put_u32(&mut dump, 0x0C, 0x20);

        // Directory: type, size, rva
        for (i, (kind, size, rva)) in [
            (MEMORY_64_LIST_STREAM, 16 + 2 * 16, 0x60u32),
            (MEMORY_INFO_LIST_STREAM, 16 + 2 * 48, 0xA0),
            (MODULE_LIST_STREAM, 4 + 108, 0x140),
        ]
        .into_iter()
        .enumerate()
        {
            put_u32(&mut dump, 0x20 + i * 12, kind);
            put_u32(&mut dump, 0x20 + i * 12 + 4, size);
            put_u32(&mut dump, 0x20 + i * 12 + 8, rva);
        }

        // Memory64List: two 0x100-byte ranges stored from 0x200
        put_u64(&mut dump, 0x60, 2);
        put_u64(&mut dump, 0x68, 0x200);
        put_u64(&mut dump, 0x70, 0x1_4000_1000);
        put_u64(&mut dump, 0x78, 0x100);
        put_u64(&mut dump, 0x80, 0x1_4000_2000);
        put_u64(&mut dump, 0x88, 0x100);

        // MemoryInfoList: 16-byte header, 48-byte entries
        put_u32(&mut dump, 0xA0, 16);
        put_u32(&mut dump, 0xA4, 48);
        put_u64(&mut dump, 0xA8, 2);
        for (i, (base, protect)) in [(0x1_4000_1000u64, 0x20u32), (0x1_4000_2000, 0x04)]
            .into_iter()
            .enumerate()
        {
            let entry = 0xB0 + i * 48;
            put_u64(&mut dump, entry, base);
            put_u64(&mut dump, entry + 24, 0x1000);
            put_u32(&mut dump, entry + 36, protect);
        }

        // ModuleList: one module named at 0x1C0
        put_u32(&mut dump, 0x140, 1);
        put_u64(&mut dump, 0x144, 0x1_4000_0000);
        put_u32(&mut dump, 0x14C, 0x3000);
        put_u32(&mut dump, 0x144 + 20, 0x1C0);
        let name: Vec<u8> = "C:\\Game\\Game.exe"
            .encode_utf16()
            .flat_map(u16::to_le_bytes)
            .collect();
        put_u32(&mut dump, 0x1C0, name.len() as u32);
        dump[0x1C4..0x1C4 + name.len()].copy_from_slice(&name);

        // Contents
        dump[0x200] = 0xC3;
        dump[0x300..0x304].copy_from_slice(b"DATA");
        dump
    }

    #[test]
    fn test_parse_minidump_regions() {
        let regions = minidump_regions(&minidump()).unwrap();
        assert_eq!(regions.len(), 2);
        assert_eq!(regions[0].perms, "r-xp");
        assert_eq!(regions[1].perms, "rw-p");
        assert_eq!(regions[1].offset, 0x300);
        assert_eq!(regions[0].file_name(), Some("Game.exe"));
    }

    #[test]
    fn test_minidump_without_full_memory_is_rejected() {
        let mut dump = minidump();
        // Retype the Memory64List directory entry as an unused stream
        put_u32(&mut dump, 0x20, 0);
        assert!(minidump_regions(&dump).is_err());
    }

    #[test]
    fn test_read_minidump_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(&minidump()).unwrap();

        let dump = DumpFile::open(file.path()).unwrap();
        assert!(!dump.is_live());
        assert_eq!(dump.read_bytes(0x1_4000_1000, 1).unwrap(), vec![0xC3]);
        assert_eq!(dump.read_bytes(0x1_4000_2000, 4).unwrap(), b"DATA".to_vec());
        // Crosses the end of the range
        assert!(dump.read_bytes(0x1_4000_20FE, 4).is_err());
        assert!(dump.read_bytes(0x1000, 1).is_err());
    }

    #[test]
    fn test_raw_dump_needs_maps() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("core.dump");
        std::fs::write(&path, vec![0xAAu8; 0x100]).unwrap();
        assert!(DumpFile::open(&path).is_err());

        std::fs::write(dir.path().join("core.maps"), "# region list\n0x10000 0x10100 256 0x0\n").unwrap();
        let dump = DumpFile::open(&path).unwrap();
        assert_eq!(dump.read_bytes(0x10080, 2).unwrap(), vec![0xAA, 0xAA]);
    }

    #[test]
    fn test_parse_maps_text_formats() {
        let regions = parse_maps_text(
            "140000000-140001000 r--p 00000000 00:00 0 /games/Game.exe\n\
             0x150000000 0x150010000 65536 0x2000\n\
             garbage\n",
        );
        assert_eq!(regions.len(), 2);
        assert_eq!(regions[0].file_name(), Some("Game.exe"));
        assert_eq!(regions[1].offset, 0x2000);
        assert_eq!(regions[1].size(), 0x10000);
    }
}
