//! Synthetic memory source
//!
//! Builds sparse address spaces out of independent segments so tests can lay
//! out code, data and heap at realistic addresses.

use super::{MemoryRegion, MemorySource};
use crate::error::{Result, ScanError};
use parking_lot::RwLock;

struct Segment {
    region: MemoryRegion,
    data: RwLock<Vec<u8>>,
}

/// In-memory address space made of non-overlapping segments
#[derive(Default)]
pub struct MockMemorySource {
    segments: Vec<Segment>,
    regions: Vec<MemoryRegion>,
}

impl MockMemorySource {
    /// Single read-write segment at `base_address`
    pub fn new(data: Vec<u8>, base_address: usize) -> Self {
        Self::default().with_segment(base_address, data, "rw-p")
    }

    /// Single executable segment named like a module image
    pub fn with_code_region(data: Vec<u8>, base_address: usize) -> Self {
        let end = base_address + data.len();
        Self::default().with_region(
            MemoryRegion::new(base_address, end, "r-xp").with_path("test.exe"),
            data,
        )
    }

    /// Add a segment with the given permissions
    pub fn with_segment(self, start: usize, data: Vec<u8>, perms: &str) -> Self {
        let end = start + data.len();
        self.with_region(MemoryRegion::new(start, end, perms), data)
    }

    /// Add a region; `data` is zero-extended to the region's size
    pub fn with_region(mut self, region: MemoryRegion, mut data: Vec<u8>) -> Self {
        data.resize(region.size(), 0);
        self.regions.push(region.clone());
        self.regions.sort_by_key(|r| r.start);
        self.segments.push(Segment {
            region,
            data: RwLock::new(data),
        });
        self.segments.sort_by_key(|s| s.region.start);
        self
    }

    fn segment(&self, address: usize) -> Option<&Segment> {
        self.segments.iter().find(|s| s.region.contains(address))
    }
}

impl MemorySource for MockMemorySource {
    fn read_bytes(&self, address: usize, size: usize) -> Result<Vec<u8>> {
        let mut out = Vec::with_capacity(size);
        let mut cursor = address;
        let end = address
            .checked_add(size)
            .ok_or(ScanError::Access { address, size })?;

        while cursor < end {
            let segment = self
                .segment(cursor)
                .ok_or(ScanError::Access { address, size })?;
            let take = (segment.region.end.min(end)) - cursor;
            let offset = cursor - segment.region.start;
            out.extend_from_slice(&segment.data.read()[offset..offset + take]);
            cursor += take;
        }

        Ok(out)
    }

    fn regions(&self) -> &[MemoryRegion] {
        &self.regions
    }

    fn is_live(&self) -> bool {
        false
    }

    fn write_bytes(&self, address: usize, data: &[u8]) -> Result<()> {
        let segment = self
            .segment(address)
            .filter(|s| s.region.is_writable())
            .ok_or(ScanError::ReadOnly { address })?;
        let offset = address - segment.region.start;
        if offset + data.len() > segment.region.size() {
            return Err(ScanError::Access {
                address,
                size: data.len(),
            });
        }
        segment.data.write()[offset..offset + data.len()].copy_from_slice(data);
        Ok(())
    }
}
