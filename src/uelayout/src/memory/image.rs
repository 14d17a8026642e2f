//! Module image
//!
//! The contiguous mapped range of the target executable. Locators and the
//! reference resolver only scan inside it; validators may dereference
//! pointers that leave it.

use super::pe::{self, PeHeaders, RuntimeFunction};
use super::MemoryView;
use crate::error::{Result, ScanError};

use once_cell::sync::OnceCell;
use sha2::{Digest, Sha256};
use std::ops::Range;
use tracing::debug;

/// Furthest the padding heuristic walks back looking for a function start
const MAX_FUNCTION_SEARCH: usize = 64 * 1024;
const FUNCTION_ALIGNMENT: usize = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SectionKind {
    Code,
    Data,
    Other,
}

#[derive(Debug, Clone)]
pub struct Section {
    pub name: String,
    pub range: Range<usize>,
    pub kind: SectionKind,
    pub writable: bool,
}

pub struct ModuleImage {
    view: MemoryView,
    base: usize,
    size: usize,
    name: Option<String>,
    headers: Option<PeHeaders>,
    sections: Vec<Section>,
    runtime_functions: OnceCell<Vec<RuntimeFunction>>,
}

impl std::fmt::Debug for ModuleImage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModuleImage")
            .field("base", &format_args!("{:#x}", self.base))
            .field("size", &format_args!("{:#x}", self.size))
            .field("name", &self.name)
            .field("sections", &self.sections.len())
            .finish()
    }
}

impl ModuleImage {
    /// Wrap `[base, base + size)`. PE headers are used when present,
    /// otherwise sections are derived from the region map.
    pub fn new(view: MemoryView, base: usize, size: usize) -> Self {
        let headers = pe::parse_headers(&view, base).ok();
        let size = match &headers {
            Some(h) if size == 0 => h.size_of_image,
            _ => size,
        };

        let sections = match &headers {
            Some(h) => h
                .sections
                .iter()
                .map(|s| Section {
                    name: s.name.clone(),
                    range: base + s.virtual_address..base + s.virtual_address + s.virtual_size,
                    kind: if s.is_executable() {
                        SectionKind::Code
                    } else if s.is_initialized_data() {
                        SectionKind::Data
                    } else {
                        SectionKind::Other
                    },
                    writable: s.is_writable(),
                })
                .collect(),
            None => sections_from_regions(&view, base..base + size),
        };

        debug!(
            base = format_args!("{:#x}", base),
            size = format_args!("{:#x}", size),
            pe = headers.is_some(),
            sections = sections.len(),
            "module image"
        );

        Self {
            view,
            base,
            size,
            name: None,
            headers,
            sections,
            runtime_functions: OnceCell::new(),
        }
    }

    /// Locate a module by file name suffix, or the first `.exe` mapping
    pub fn locate(view: MemoryView, module: Option<&str>) -> Result<Self> {
        let wanted = module.map(str::to_ascii_lowercase);
        let matches_module = |name: &str| {
            let name = name.to_ascii_lowercase();
            match &wanted {
                Some(w) => name.ends_with(w.as_str()),
                None => name.ends_with(".exe"),
            }
        };

        let path = view
            .regions()
            .iter()
            .filter(|r| r.is_executable() || wanted.is_some())
            .find(|r| r.file_name().map(matches_module).unwrap_or(false))
            .and_then(|r| r.path.clone())
            .ok_or_else(|| {
                ScanError::not_found(format!("module {}", module.unwrap_or("*.exe")))
            })?;

        let mapped: Vec<_> = view
            .regions()
            .iter()
            .filter(|r| r.path.as_deref() == Some(path.as_str()))
            .collect();
        let start = mapped.iter().map(|r| r.start).min().unwrap_or(0);
        let end = mapped.iter().map(|r| r.end).max().unwrap_or(0);

        let mut image = Self::new(view, start, end - start);
        image.name = path.rsplit(['/', '\\']).next().map(str::to_string);
        Ok(image)
    }

    pub fn view(&self) -> &MemoryView {
        &self.view
    }

    pub fn base(&self) -> usize {
        self.base
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn end(&self) -> usize {
        self.base + self.size
    }

    pub fn range(&self) -> Range<usize> {
        self.base..self.end()
    }

    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    pub fn contains(&self, address: usize) -> bool {
        self.range().contains(&address)
    }

    pub fn sections(&self) -> &[Section] {
        &self.sections
    }

    pub fn section(&self, name: &str) -> Option<&Section> {
        self.sections.iter().find(|s| s.name == name)
    }

    pub fn timestamp(&self) -> Option<u32> {
        self.headers.as_ref().map(|h| h.timestamp)
    }

    pub fn code_ranges(&self) -> Vec<Range<usize>> {
        self.ranges_of(SectionKind::Code)
    }

    pub fn data_ranges(&self) -> Vec<Range<usize>> {
        self.ranges_of(SectionKind::Data)
    }

    fn ranges_of(&self, kind: SectionKind) -> Vec<Range<usize>> {
        self.sections
            .iter()
            .filter(|s| s.kind == kind)
            .map(|s| s.range.clone())
            .collect()
    }

    /// Address lies in a code section of this image
    pub fn is_code(&self, address: usize) -> bool {
        self.sections
            .iter()
            .any(|s| s.kind == SectionKind::Code && s.range.contains(&address))
    }

    /// Address lies in a data section of this image
    pub fn is_data(&self, address: usize) -> bool {
        self.sections
            .iter()
            .any(|s| s.kind == SectionKind::Data && s.range.contains(&address))
    }

    /// Start of the function containing `address`
    pub fn function_containing(&self, address: usize) -> Option<usize> {
        if !self.is_code(address) {
            return None;
        }

        let functions = self.runtime_functions.get_or_init(|| {
            self.headers
                .as_ref()
                .and_then(|h| h.exception_directory)
                .and_then(|dir| pe::read_runtime_functions(&self.view, self.base, dir).ok())
                .unwrap_or_default()
        });

        if !functions.is_empty() {
            let rva = u32::try_from(address - self.base).ok()?;
            if let Some(entry) = pe::root_function(&self.view, self.base, functions, rva) {
                return Some(self.base + entry.begin as usize);
            }
        }

        self.function_start_by_padding(address)
    }

    /// Walk back to an aligned address preceded by int3 padding
    fn function_start_by_padding(&self, address: usize) -> Option<usize> {
        let section = self
            .sections
            .iter()
            .find(|s| s.kind == SectionKind::Code && s.range.contains(&address))?;
        let floor = address
            .saturating_sub(MAX_FUNCTION_SEARCH)
            .max(section.range.start);
        let bytes = self.view.read_bytes(floor, address - floor + 1).ok()?;

        let mut candidate = address - address % FUNCTION_ALIGNMENT;
        while candidate > floor {
            let at = candidate - floor;
            if bytes[at - 1] == 0xCC && bytes[at] != 0xCC {
                return Some(candidate);
            }
            candidate -= FUNCTION_ALIGNMENT;
        }
        (floor == section.range.start).then_some(floor)
    }

    /// Stable identity of this binary build, hex-encoded SHA-256
    pub fn fingerprint(&self) -> String {
        let mut hasher = Sha256::new();
        if let Ok(header) = self.view.read_up_to(self.base, 0x1000) {
            hasher.update(&header);
        }
        hasher.update(self.timestamp().unwrap_or(0).to_le_bytes());
        hasher.update((self.size as u64).to_le_bytes());
        hex::encode(hasher.finalize())
    }
}

fn sections_from_regions(view: &MemoryView, range: Range<usize>) -> Vec<Section> {
    view.regions()
        .iter()
        .filter(|r| r.is_readable() && r.start < range.end && r.end > range.start)
        .map(|r| Section {
            name: String::new(),
            range: r.start.max(range.start)..r.end.min(range.end),
            kind: if r.is_executable() {
                SectionKind::Code
            } else {
                SectionKind::Data
            },
            writable: r.is_writable(),
        })
        .collect()
}
