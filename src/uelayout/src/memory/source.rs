//! Memory source trait
//!
//! Backends (live process, dump file, synthetic image) implement this.
//! Nothing outside `memory` calls it directly; reads go through
//! [`super::MemoryView`], which checks permissions first.

use super::MemoryRegion;
use crate::error::{Result, ScanError};

/// Raw access to a target address space
pub trait MemorySource: Send + Sync {
    /// Read bytes from a virtual address
    fn read_bytes(&self, address: usize, size: usize) -> Result<Vec<u8>>;

    /// Get the list of memory regions
    fn regions(&self) -> &[MemoryRegion];

    /// Whether the source reflects a running process
    fn is_live(&self) -> bool;

    /// Write bytes to a virtual address
    fn write_bytes(&self, address: usize, _data: &[u8]) -> Result<()> {
        Err(ScanError::ReadOnly { address })
    }

    /// Find a region containing the given address
    fn find_region(&self, address: usize) -> Option<&MemoryRegion> {
        self.regions().iter().find(|r| r.contains(address))
    }
}
