//! String literal locator
//!
//! Anchors are matched as they appear in a binary's read-only data: the
//! encoded text followed by its terminator.

use super::pattern::{find_all, find_first, Pattern};
use crate::memory::ModuleImage;

fn narrow(text: &str) -> Pattern {
    let mut bytes = text.as_bytes().to_vec();
    bytes.push(0);
    Pattern::from_bytes(&bytes)
}

fn wide(text: &str) -> Pattern {
    let mut bytes: Vec<u8> = text.encode_utf16().flat_map(u16::to_le_bytes).collect();
    bytes.extend_from_slice(&[0, 0]);
    Pattern::from_bytes(&bytes)
}

pub fn find_string(image: &ModuleImage, text: &str) -> Option<usize> {
    find_first(image.view(), image.range(), &narrow(text))
}

pub fn find_string_all(image: &ModuleImage, text: &str) -> Vec<usize> {
    find_all(image.view(), image.range(), &narrow(text))
}

pub fn find_wide_string(image: &ModuleImage, text: &str) -> Option<usize> {
    find_first(image.view(), image.range(), &wide(text))
}

/// Wide literals are 2-byte aligned in practice; unaligned hits are kept
/// anyway since the cost of a false positive is one extra reference scan.
pub fn find_wide_string_all(image: &ModuleImage, text: &str) -> Vec<usize> {
    find_all(image.view(), image.range(), &wide(text))
}

/// Narrow and wide occurrences together, ascending
pub fn find_any_string_all(image: &ModuleImage, text: &str) -> Vec<usize> {
    let mut hits = find_string_all(image, text);
    hits.extend(find_wide_string_all(image, text));
    hits.sort_unstable();
    hits.dedup();
    hits
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::{MemoryView, MockMemorySource};

    fn image() -> ModuleImage {
        let mut data = vec![0u8; 0x200];
        data[0x10..0x1B].copy_from_slice(b"gc.MaxObj\0\0");
        data[0x40..0x4A].copy_from_slice(b"gc.MaxObj\0");
        let wide: Vec<u8> = "gc.MaxObj\0"
            .encode_utf16()
            .flat_map(u16::to_le_bytes)
            .collect();
        data[0x80..0x80 + wide.len()].copy_from_slice(&wide);
        // Prefix of a longer literal is not a hit
        data[0x100..0x10E].copy_from_slice(b"gc.MaxObjects\0");

        let view = MemoryView::from_source(MockMemorySource::default().with_segment(
            0x400000,
            data,
            "r--p",
        ));
        ModuleImage::new(view, 0x400000, 0x200)
    }

    #[test]
    fn test_find_narrow_strings() {
        let image = image();
        assert_eq!(find_string(&image, "gc.MaxObj"), Some(0x400010));
        assert_eq!(find_string_all(&image, "gc.MaxObj"), vec![0x400010, 0x400040]);
        assert_eq!(find_string(&image, "missing"), None);
    }

    #[test]
    fn test_find_wide_strings() {
        let image = image();
        assert_eq!(find_wide_string(&image, "gc.MaxObj"), Some(0x400080));
        assert_eq!(
            find_any_string_all(&image, "gc.MaxObj"),
            vec![0x400010, 0x400040, 0x400080]
        );
    }
}
