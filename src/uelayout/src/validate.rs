//! Heuristic validators
//!
//! Structural checks a candidate must pass before it is promoted to a
//! resolved artifact. Engine-specific table checks live next to the tables
//! they read (`ue::objects`, `ue::names`).

use crate::config::DiscoveryConfig;
use crate::error::{Result, ScanError};
use crate::memory::MemoryView;

/// Confirm `global` holds a pointer to a polymorphic object:
/// global -> object -> vtable -> first virtual function.
/// Returns the object address.
pub fn validate_singleton(
    view: &MemoryView,
    config: &DiscoveryConfig,
    global: usize,
) -> Result<usize> {
    let object = view.read_ptr(global)?;
    if object == 0 {
        return Err(ScanError::invalid(format!("{:#x} holds null", global)));
    }
    if object == global {
        return Err(ScanError::invalid(format!("{:#x} points at itself", global)));
    }
    if !config.is_plausible_pointer(object) || !view.is_readable(object, 8) {
        return Err(ScanError::invalid(format!(
            "object {:#x} is not readable",
            object
        )));
    }

    let vtable = view.read_ptr(object)?;
    if vtable == object || vtable == global {
        return Err(ScanError::invalid(format!(
            "object {:#x} is self-referential",
            object
        )));
    }
    if !config.is_plausible_pointer(vtable) || vtable % 8 != 0 || !view.is_readable(vtable, 8) {
        return Err(ScanError::invalid(format!(
            "vtable {:#x} is not readable",
            vtable
        )));
    }

    let function = view.read_ptr(vtable)?;
    if !view.is_executable(function) {
        return Err(ScanError::invalid(format!(
            "first virtual {:#x} is not code",
            function
        )));
    }
    Ok(object)
}

/// Packed-boolean descriptor bytes as read through candidate offsets
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BoolProbe {
    pub field_size: u8,
    pub byte_offset: u8,
    pub byte_mask: u8,
    pub field_mask: u8,
}

impl BoolProbe {
    pub fn from_bytes(bytes: [u8; 4]) -> Self {
        Self {
            field_size: bytes[0],
            byte_offset: bytes[1],
            byte_mask: bytes[2],
            field_mask: bytes[3],
        }
    }

    fn is_single_bit(&self, mask: u8) -> bool {
        self.field_size == 1 && self.byte_mask == mask && self.field_mask == mask
    }
}

/// Two adjacent bitfield booleans must describe bit 0 and bit 1 of the
/// same byte.
pub fn validate_bool_pair(first: BoolProbe, second: BoolProbe) -> Result<()> {
    if !first.is_single_bit(0x01) {
        return Err(ScanError::invalid(format!("first bool {:?}", first)));
    }
    if !second.is_single_bit(0x02) {
        return Err(ScanError::invalid(format!("second bool {:?}", second)));
    }
    if first.byte_offset != second.byte_offset {
        return Err(ScanError::invalid(format!(
            "bool byte offsets differ: {} vs {}",
            first.byte_offset, second.byte_offset
        )));
    }
    Ok(())
}

/// Count within `[-tolerance, ceiling]`
pub fn validate_count(name: &str, value: i64, tolerance: i64, ceiling: i64) -> Result<()> {
    if value < -tolerance || value > ceiling {
        return Err(ScanError::invalid(format!(
            "{} = {} outside [-{}, {}]",
            name, value, tolerance, ceiling
        )));
    }
    Ok(())
}

/// Evenly spread indices for sampled validation. A zero sample, or one
/// that covers the whole range, yields every index.
pub fn sample_indices(count: usize, sample: usize) -> impl Iterator<Item = usize> {
    let sample = if sample == 0 { count } else { sample };
    let step = if count <= sample { 1 } else { count / sample };
    (0..count).step_by(step).take(sample)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MockMemorySource;

    const DATA: usize = 0x140100000;
    const HEAP: usize = 0x200000000;
    const CODE: usize = 0x140001000;

    /// Valid singleton at DATA; decoys at DATA+8.. (null, unreadable,
    /// self-referential object, object pointing to itself as vtable,
    /// vtable into data)
    fn fixture() -> MemoryView {
        let mut data = vec![0u8; 0x100];
        let mut put = |at: usize, value: usize| {
            data[at..at + 8].copy_from_slice(&(value as u64).to_le_bytes())
        };
        put(0x00, HEAP);
        put(0x08, 0);
        put(0x10, 0x300000000);
        put(0x18, DATA + 0x18);
        put(0x20, HEAP + 0x40);
        put(0x28, HEAP + 0x80);

        let mut heap = vec![0u8; 0x100];
        let mut put = |at: usize, value: usize| {
            heap[at..at + 8].copy_from_slice(&(value as u64).to_le_bytes())
        };
        put(0x00, HEAP + 0xC0); // vtable
        put(0x40, HEAP + 0x40); // object whose vtable is itself
        put(0x80, HEAP + 0xC8); // vtable whose first slot is data
        put(0xC0, CODE + 0x10);
        put(0xC8, DATA);

        MemoryView::from_source(
            MockMemorySource::default()
                .with_segment(CODE, vec![0xC3; 0x100], "r-xp")
                .with_segment(DATA, data, "rw-p")
                .with_segment(HEAP, heap, "rw-p")
                .with_segment(0x300000000, vec![0; 0x10], "---p"),
        )
    }

    #[test]
    fn test_singleton_accepts_valid_shape() {
        let view = fixture();
        let config = DiscoveryConfig::default();
        assert_eq!(validate_singleton(&view, &config, DATA).unwrap(), HEAP);
    }

    #[test]
    fn test_singleton_rejects_every_decoy() {
        let view = fixture();
        let config = DiscoveryConfig::default();
        for decoy in [0x08, 0x10, 0x18, 0x20, 0x28, 0x1000] {
            assert!(
                validate_singleton(&view, &config, DATA + decoy).is_err(),
                "decoy at +{:#x} accepted",
                decoy
            );
        }
    }

    #[test]
    fn test_bool_pair() {
        let a = BoolProbe::from_bytes([1, 0x28, 1, 1]);
        let b = BoolProbe::from_bytes([1, 0x28, 2, 2]);
        assert!(validate_bool_pair(a, b).is_ok());

        // swapped, wrong size, mismatched masks, different bytes, zeroed
        assert!(validate_bool_pair(b, a).is_err());
        assert!(validate_bool_pair(BoolProbe::from_bytes([4, 0x28, 1, 1]), b).is_err());
        assert!(validate_bool_pair(a, BoolProbe::from_bytes([1, 0x28, 2, 0xFF])).is_err());
        assert!(validate_bool_pair(a, BoolProbe::from_bytes([1, 0x29, 2, 2])).is_err());
        assert!(validate_bool_pair(BoolProbe::from_bytes([0; 4]), b).is_err());
    }

    #[test]
    fn test_validate_count() {
        assert!(validate_count("Num", 10, 0, 100).is_ok());
        assert!(validate_count("Num", -1, 1, 100).is_ok());
        assert!(validate_count("Num", -2, 1, 100).is_err());
        assert!(validate_count("Num", 101, 0, 100).is_err());
    }

    #[test]
    fn test_sample_indices() {
        let all: Vec<_> = sample_indices(5, 10).collect();
        assert_eq!(all, vec![0, 1, 2, 3, 4]);

        let spread: Vec<_> = sample_indices(100, 4).collect();
        assert_eq!(spread, vec![0, 25, 50, 75]);

        assert_eq!(sample_indices(0, 4).count(), 0);
        assert_eq!(sample_indices(7, 0).count(), 7);
    }
}
