//! Byte pattern scanning
//!
//! Patterns are matched with memchr's SIMD `memmem` on their longest literal
//! run, then verified in full. Image-level scans read readable spans in
//! overlapping chunks so a pattern straddling a chunk boundary is not missed.

use crate::error::{Result, ScanError};
use crate::memory::MemoryView;

use std::ops::Range;
use tracing::trace;

const SCAN_CHUNK: usize = 1024 * 1024;

/// Byte pattern with per-byte wildcard mask (0 = any byte)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Pattern {
    pub bytes: Vec<u8>,
    pub mask: Vec<u8>,
}

impl Pattern {
    /// Parse IDA-style signatures such as `48 8B 05 ?? ?? ?? ??`
    pub fn parse(signature: &str) -> Result<Self> {
        let mut bytes = Vec::new();
        let mut mask = Vec::new();
        for token in signature.split_whitespace() {
            if token.chars().all(|c| c == '?') {
                bytes.push(0);
                mask.push(0);
            } else {
                let byte = u8::from_str_radix(token, 16).map_err(|_| {
                    ScanError::invalid(format!("pattern token '{}' in '{}'", token, signature))
                })?;
                bytes.push(byte);
                mask.push(1);
            }
        }
        if bytes.is_empty() {
            return Err(ScanError::invalid("empty pattern"));
        }
        Ok(Self { bytes, mask })
    }

    /// Literal pattern with no wildcards
    pub fn from_bytes(bytes: &[u8]) -> Self {
        Self {
            bytes: bytes.to_vec(),
            mask: vec![1; bytes.len()],
        }
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    pub fn matches(&self, data: &[u8]) -> bool {
        verify_pattern(data, &self.bytes, &self.mask)
    }
}

/// Longest contiguous literal run as (offset, bytes)
fn find_best_anchor<'a>(pattern: &'a [u8], mask: &[u8]) -> (usize, &'a [u8]) {
    let (mut best_start, mut best_len) = (0, 0);
    let (mut run_start, mut run_len) = (0, 0);

    for (i, &m) in mask.iter().enumerate() {
        if m != 0 {
            if run_len == 0 {
                run_start = i;
            }
            run_len += 1;
            if run_len > best_len {
                best_start = run_start;
                best_len = run_len;
            }
        } else {
            run_len = 0;
        }
    }

    (best_start, &pattern[best_start..best_start + best_len])
}

#[inline]
fn verify_pattern(data: &[u8], pattern: &[u8], mask: &[u8]) -> bool {
    data.len() >= pattern.len()
        && pattern
            .iter()
            .zip(mask)
            .zip(data)
            .all(|((&p, &m), &d)| m == 0 || p == d)
}

/// All offsets in `data` where the pattern matches
pub fn scan_pattern_fast(data: &[u8], pattern: &[u8], mask: &[u8]) -> Vec<usize> {
    if pattern.is_empty() || data.len() < pattern.len() {
        return vec![];
    }

    let (anchor_offset, anchor_bytes) = find_best_anchor(pattern, mask);

    if anchor_bytes.is_empty() {
        return (0..=data.len() - pattern.len())
            .filter(|&i| verify_pattern(&data[i..], pattern, mask))
            .collect();
    }

    memchr::memmem::Finder::new(anchor_bytes)
        .find_iter(data)
        .filter(|&anchor_pos| anchor_pos >= anchor_offset)
        .map(|anchor_pos| anchor_pos - anchor_offset)
        .filter(|&start| start + pattern.len() <= data.len())
        .filter(|&start| verify_pattern(&data[start..], pattern, mask))
        .collect()
}

/// Every match of `pattern` inside `range`, ascending
pub fn find_all(view: &MemoryView, range: Range<usize>, pattern: &Pattern) -> Vec<usize> {
    let mut hits = Vec::new();
    scan_spans(view, range, pattern, |address| {
        hits.push(address);
        true
    });
    hits.dedup();
    hits
}

/// First match of `pattern` inside `range`
pub fn find_first(view: &MemoryView, range: Range<usize>, pattern: &Pattern) -> Option<usize> {
    let mut first = None;
    scan_spans(view, range, pattern, |address| {
        first = Some(address);
        false
    });
    first
}

/// Feed matches in ascending order to `on_hit` until it returns false
fn scan_spans<F>(view: &MemoryView, range: Range<usize>, pattern: &Pattern, mut on_hit: F)
where
    F: FnMut(usize) -> bool,
{
    if pattern.is_empty() {
        return;
    }
    let overlap = pattern.len() - 1;

    for span in view.readable_spans(range) {
        let mut chunk_start = span.start;
        while chunk_start < span.end {
            let chunk_end = (chunk_start + SCAN_CHUNK + overlap).min(span.end);
            // A span can shrink under a live target; skip what no longer reads
            let data = match view.read_bytes(chunk_start, chunk_end - chunk_start) {
                Ok(data) => data,
                Err(e) => {
                    trace!("skipping chunk at {:#x}: {}", chunk_start, e);
                    chunk_start += SCAN_CHUNK;
                    continue;
                }
            };

            for offset in scan_pattern_fast(&data, &pattern.bytes, &pattern.mask) {
                // Matches starting in the overlap belong to the next chunk
                if offset >= SCAN_CHUNK && chunk_end < span.end {
                    continue;
                }
                if !on_hit(chunk_start + offset) {
                    return;
                }
            }
            chunk_start += SCAN_CHUNK;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MockMemorySource;

    #[test]
    fn test_scan_pattern_exact_match() {
        let data = b"hello world hello";
        let results = scan_pattern_fast(data, b"hello", &[1; 5]);
        assert_eq!(results, vec![0, 12]);
    }

    #[test]
    fn test_scan_pattern_with_wildcards() {
        let data = b"test1234test5678";
        let results = scan_pattern_fast(data, b"test????", &[1, 1, 1, 1, 0, 0, 0, 0]);
        assert_eq!(results, vec![0, 8]);
    }

    #[test]
    fn test_scan_pattern_anchor_near_start_of_data() {
        // Anchor found before its own offset can't be a match
        let data = b"CDxxCD";
        let results = scan_pattern_fast(data, b"??CD", &[0, 0, 1, 1]);
        assert_eq!(results, vec![2]);
    }

    #[test]
    fn test_scan_pattern_empty() {
        assert!(scan_pattern_fast(b"hello", b"", &[]).is_empty());
        assert!(scan_pattern_fast(b"hi", b"hello", &[1; 5]).is_empty());
    }

    #[test]
    fn test_find_best_anchor() {
        let (offset, anchor) = find_best_anchor(b"AB??CDEF", &[1, 1, 0, 0, 1, 1, 1, 1]);
        assert_eq!(offset, 4);
        assert_eq!(anchor, b"CDEF");
    }

    #[test]
    fn test_pattern_parse() {
        let pattern = Pattern::parse("48 8B 05 ?? ? C3").unwrap();
        assert_eq!(pattern.bytes, vec![0x48, 0x8B, 0x05, 0, 0, 0xC3]);
        assert_eq!(pattern.mask, vec![1, 1, 1, 0, 0, 1]);
        assert!(pattern.matches(&[0x48, 0x8B, 0x05, 0x11, 0x22, 0xC3]));
        assert!(!pattern.matches(&[0x48, 0x8B, 0x0D, 0x11, 0x22, 0xC3]));

        assert!(Pattern::parse("").is_err());
        assert!(Pattern::parse("48 ZZ").is_err());
    }

    #[test]
    fn test_find_all_skips_unreadable_and_crosses_chunks() {
        let mut big = vec![0u8; SCAN_CHUNK + 0x100];
        // Straddles the first chunk boundary
        big[SCAN_CHUNK - 2..SCAN_CHUNK + 2].copy_from_slice(b"MARK");
        big[0x10..0x14].copy_from_slice(b"MARK");

        let view = MemoryView::from_source(
            MockMemorySource::default()
                .with_segment(0x10000, big, "r--p")
                .with_segment(0x10000 + SCAN_CHUNK + 0x100, b"MARKMARK".to_vec(), "---p"),
        );

        let pattern = Pattern::from_bytes(b"MARK");
        let hits = find_all(&view, 0x10000..0x10000 + SCAN_CHUNK + 0x200, &pattern);
        assert_eq!(hits, vec![0x10010, 0x10000 + SCAN_CHUNK - 2]);

        let first = find_first(&view, 0x10020..0x10000 + SCAN_CHUNK + 0x200, &pattern);
        assert_eq!(first, Some(0x10000 + SCAN_CHUNK - 2));
    }
}
