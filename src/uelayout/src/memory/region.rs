//! Mapped memory regions
//!
//! Regions use the `/proc/pid/maps` permission string (`rwxp`), which every
//! source (live process, dump, synthetic image) can produce.

use std::ops::Range;

/// One mapped range of the target's address space
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MemoryRegion {
    pub start: usize,
    pub end: usize,
    pub perms: String,
    pub offset: usize,
    pub path: Option<String>,
}

impl MemoryRegion {
    pub fn new(start: usize, end: usize, perms: &str) -> Self {
        Self {
            start,
            end,
            perms: perms.to_string(),
            offset: 0,
            path: None,
        }
    }

    pub fn with_path(mut self, path: &str) -> Self {
        self.path = Some(path.to_string());
        self
    }

    pub fn size(&self) -> usize {
        self.end - self.start
    }

    pub fn range(&self) -> Range<usize> {
        self.start..self.end
    }

    pub fn contains(&self, address: usize) -> bool {
        address >= self.start && address < self.end
    }

    pub fn is_readable(&self) -> bool {
        self.perms.starts_with('r')
    }

    pub fn is_writable(&self) -> bool {
        self.perms.chars().nth(1) == Some('w')
    }

    pub fn is_executable(&self) -> bool {
        self.perms.chars().nth(2) == Some('x')
    }

    /// File name component of the backing path, if any
    pub fn file_name(&self) -> Option<&str> {
        let path = self.path.as_deref()?;
        Some(path.rsplit(['/', '\\']).next().unwrap_or(path))
    }
}
