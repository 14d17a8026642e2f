//! Checked view over foreign memory
//!
//! Every read the engine performs goes through [`MemoryView`]: the range is
//! checked against the region map immediately before the backend read, and
//! any backend failure (the host may have unmapped the page in between)
//! becomes [`ScanError::Access`].

use super::{MemoryRegion, MemorySource};
use crate::error::{Result, ScanError};

use byteorder::{ByteOrder, LE};
use std::ops::Range;
use std::sync::Arc;

/// Cheaply clonable, permission-checked accessor
#[derive(Clone)]
pub struct MemoryView {
    source: Arc<dyn MemorySource>,
}

impl std::fmt::Debug for MemoryView {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryView")
            .field("regions", &self.source.regions().len())
            .field("live", &self.source.is_live())
            .finish()
    }
}

impl MemoryView {
    pub fn new(source: Arc<dyn MemorySource>) -> Self {
        Self { source }
    }

    pub fn from_source<S: MemorySource + 'static>(source: S) -> Self {
        Self::new(Arc::new(source))
    }

    pub fn regions(&self) -> &[MemoryRegion] {
        self.source.regions()
    }

    pub fn region_of(&self, address: usize) -> Option<&MemoryRegion> {
        self.source.find_region(address)
    }

    pub fn is_live(&self) -> bool {
        self.source.is_live()
    }

    /// Number of contiguous readable bytes starting at `address`
    pub fn readable_extent(&self, address: usize, limit: usize) -> usize {
        let mut cursor = address;
        let end = address.saturating_add(limit);
        while cursor < end {
            match self.region_of(cursor) {
                Some(region) if region.is_readable() => cursor = region.end,
                _ => break,
            }
        }
        cursor.min(end) - address
    }

    /// Whether every byte of `[address, address + size)` is readable
    pub fn is_readable(&self, address: usize, size: usize) -> bool {
        size > 0 && self.readable_extent(address, size) == size
    }

    pub fn is_executable(&self, address: usize) -> bool {
        self.region_of(address)
            .map(|r| r.is_readable() && r.is_executable())
            .unwrap_or(false)
    }

    pub fn is_writable(&self, address: usize) -> bool {
        self.region_of(address)
            .map(|r| r.is_writable())
            .unwrap_or(false)
    }

    /// Readable stretches inside `range`, with adjacent regions merged
    pub fn readable_spans(&self, range: Range<usize>) -> Vec<Range<usize>> {
        let mut spans: Vec<Range<usize>> = Vec::new();
        let mut regions: Vec<&MemoryRegion> = self
            .regions()
            .iter()
            .filter(|r| r.is_readable() && r.start < range.end && r.end > range.start)
            .collect();
        regions.sort_by_key(|r| r.start);

        for region in regions {
            let start = region.start.max(range.start);
            let end = region.end.min(range.end);
            match spans.last_mut() {
                Some(last) if last.end == start => last.end = end,
                _ => spans.push(start..end),
            }
        }
        spans
    }

    pub fn read_bytes(&self, address: usize, size: usize) -> Result<Vec<u8>> {
        if !self.is_readable(address, size) {
            return Err(ScanError::Access { address, size });
        }
        self.source
            .read_bytes(address, size)
            .map_err(|_| ScanError::Access { address, size })
    }

    /// Read up to `max` bytes, stopping at the end of readable memory
    pub fn read_up_to(&self, address: usize, max: usize) -> Result<Vec<u8>> {
        let size = self.readable_extent(address, max);
        if size == 0 {
            return Err(ScanError::Access { address, size: max });
        }
        self.read_bytes(address, size)
    }

    pub fn read_u8(&self, address: usize) -> Result<u8> {
        Ok(self.read_bytes(address, 1)?[0])
    }

    pub fn read_u16(&self, address: usize) -> Result<u16> {
        Ok(LE::read_u16(&self.read_bytes(address, 2)?))
    }

    pub fn read_u32(&self, address: usize) -> Result<u32> {
        Ok(LE::read_u32(&self.read_bytes(address, 4)?))
    }

    pub fn read_i32(&self, address: usize) -> Result<i32> {
        Ok(LE::read_i32(&self.read_bytes(address, 4)?))
    }

    pub fn read_u64(&self, address: usize) -> Result<u64> {
        Ok(LE::read_u64(&self.read_bytes(address, 8)?))
    }

    pub fn read_ptr(&self, address: usize) -> Result<usize> {
        Ok(self.read_u64(address)? as usize)
    }

    /// Read a NUL-terminated narrow string of at most `max_len` bytes
    pub fn read_cstring(&self, address: usize, max_len: usize) -> Result<String> {
        let bytes = self.read_up_to(address, max_len)?;
        let end = bytes.iter().position(|&b| b == 0).unwrap_or(bytes.len());
        Ok(String::from_utf8_lossy(&bytes[..end]).to_string())
    }

    /// Read a NUL-terminated UTF-16LE string of at most `max_chars` units
    pub fn read_wstring(&self, address: usize, max_chars: usize) -> Result<String> {
        let bytes = self.read_up_to(address, max_chars * 2)?;
        let units: Vec<u16> = bytes
            .chunks_exact(2)
            .map(LE::read_u16)
            .take_while(|&u| u != 0)
            .collect();
        Ok(String::from_utf16_lossy(&units))
    }

    /// Write through to the backend; the target page must be writable
    pub fn write_bytes(&self, address: usize, data: &[u8]) -> Result<()> {
        let end = address.checked_add(data.len()).ok_or(ScanError::Access {
            address,
            size: data.len(),
        })?;
        let mut cursor = address;
        while cursor < end {
            match self.region_of(cursor) {
                Some(region) if region.is_writable() => cursor = region.end,
                _ => return Err(ScanError::ReadOnly { address: cursor }),
            }
        }
        self.source.write_bytes(address, data)
    }
}
