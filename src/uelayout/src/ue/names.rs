//! FNamePool
//!
//! UE5's block-based name storage. The header is a lock, the index of the
//! block being filled, the byte cursor inside it, then an array of block
//! pointers. Entries are a 16-bit header (`len = header >> 6`,
//! `wide = header & 1`) followed by the characters, 2-byte aligned.
//!
//! An FName comparison index encodes `(block << 16) | (offset / 2)`.

use super::constants::*;
use crate::config::DiscoveryConfig;
use crate::error::{Result, ScanError};
use crate::memory::MemoryView;
use crate::registry::{ArtifactValue, DiscoveryContext};
use crate::scan::{find_all, Pattern};

use byteorder::{ByteOrder, LE};
use parking_lot::RwLock;
use std::collections::HashMap;
use tracing::debug;

const SCAN_CHUNK: usize = 1024 * 1024;

/// Entry header and text for one name
fn parse_entry(data: &[u8]) -> Option<(String, usize)> {
    if data.len() < 2 {
        return None;
    }
    let header = LE::read_u16(&data[0..2]);
    let wide = header & 1 != 0;
    let len = (header >> 6) as usize;
    if len == 0 || len > MAX_NAME_LEN {
        return None;
    }
    let bytes = if wide { len * 2 } else { len };
    let text = data.get(2..2 + bytes)?;
    let name = if wide {
        let chars: Vec<u16> = text.chunks_exact(2).map(LE::read_u16).collect();
        String::from_utf16_lossy(&chars)
    } else {
        String::from_utf8_lossy(text).into_owned()
    };
    Some((name, (2 + bytes + 1) & !1))
}

pub struct NamePool {
    view: MemoryView,
    address: usize,
    current_block: usize,
    cursor: usize,
    blocks: Vec<usize>,
    cache: RwLock<HashMap<u32, String>>,
}

impl std::fmt::Debug for NamePool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NamePool")
            .field("address", &format_args!("{:#x}", self.address))
            .field("blocks", &self.blocks.len())
            .field("cursor", &self.cursor)
            .finish()
    }
}

impl NamePool {
    /// Open the pool whose header is at `address`, checking the header
    /// and that block 0 starts with `None`.
    pub fn open(view: &MemoryView, config: &DiscoveryConfig, address: usize) -> Result<Self> {
        let header = view.read_bytes(address, NAME_POOL_BLOCKS_OFFSET + 8)?;
        let current_block = LE::read_u32(&header[8..12]) as usize;
        let cursor = LE::read_u32(&header[12..16]) as usize;
        let block0 = LE::read_u64(&header[16..24]) as usize;

        if current_block >= MAX_NAME_BLOCKS {
            return Err(ScanError::invalid(format!(
                "name pool block count {} out of range",
                current_block
            )));
        }
        if cursor == 0 || cursor > NAME_BLOCK_SIZE {
            return Err(ScanError::invalid(format!(
                "name pool cursor {:#x} out of range",
                cursor
            )));
        }
        if !config.is_plausible_pointer(block0) || block0 % NAME_STRIDE != 0 {
            return Err(ScanError::invalid(format!(
                "name block pointer {:#x} is implausible",
                block0
            )));
        }
        if !starts_with_none(view, block0) {
            return Err(ScanError::invalid(format!(
                "name block {:#x} does not start with None",
                block0
            )));
        }

        let raw = view.read_bytes(address + NAME_POOL_BLOCKS_OFFSET, (current_block + 1) * 8)?;
        let blocks: Vec<usize> = raw.chunks_exact(8).map(|c| LE::read_u64(c) as usize).collect();
        if let Some(bad) = blocks.iter().find(|b| !config.is_plausible_pointer(**b)) {
            return Err(ScanError::invalid(format!(
                "name block pointer {:#x} is implausible",
                bad
            )));
        }

        Ok(Self {
            view: view.clone(),
            address,
            current_block,
            cursor,
            blocks,
            cache: RwLock::new(HashMap::new()),
        })
    }

    pub fn address(&self) -> usize {
        self.address
    }

    pub fn blocks(&self) -> &[usize] {
        &self.blocks
    }

    /// Bytes in use in block `index`
    fn block_len(&self, index: usize) -> usize {
        if index == self.current_block {
            self.cursor
        } else {
            NAME_BLOCK_SIZE
        }
    }

    fn entry_address(&self, index: u32) -> Result<usize> {
        let block = (index >> 16) as usize;
        let offset = (index & 0xFFFF) as usize * NAME_STRIDE;
        let base = self
            .blocks
            .get(block)
            .copied()
            .ok_or_else(|| ScanError::not_found(format!("name block {} for index {:#x}", block, index)))?;
        if offset >= self.block_len(block) {
            return Err(ScanError::not_found(format!("name index {:#x} past cursor", index)));
        }
        Ok(base + offset)
    }

    /// Plain name for a comparison index
    pub fn name(&self, index: u32) -> Result<String> {
        if let Some(name) = self.cache.read().get(&index) {
            return Ok(name.clone());
        }
        let address = self.entry_address(index)?;
        let data = self.view.read_up_to(address, 2 + MAX_NAME_LEN * 2)?;
        let (name, _) = parse_entry(&data)
            .ok_or_else(|| ScanError::invalid(format!("no name entry at {:#x}", address)))?;
        self.cache.write().insert(index, name.clone());
        Ok(name)
    }

    /// FName display form: `Name` or `Name_N` for instance numbers
    pub fn display(&self, index: u32, number: u32) -> Result<String> {
        let name = self.name(index)?;
        Ok(if number == 0 {
            name
        } else {
            format!("{}_{}", name, number - 1)
        })
    }

    /// Comparison index of `text`, scanning blocks in order
    pub fn search(&self, text: &str) -> Option<u32> {
        if let Some((index, _)) = self.cache.read().iter().find(|(_, name)| *name == text) {
            return Some(*index);
        }
        for (block, &base) in self.blocks.iter().enumerate() {
            let Ok(data) = self.view.read_up_to(base, self.block_len(block)) else {
                continue;
            };
            let mut offset = 0;
            while let Some((name, size)) = parse_entry(&data[offset..]) {
                let index = ((block as u32) << 16) | (offset / NAME_STRIDE) as u32;
                let found = name == text;
                self.cache.write().insert(index, name);
                if found {
                    return Some(index);
                }
                offset += size;
                if offset >= data.len() {
                    break;
                }
            }
        }
        None
    }
}

fn starts_with_none(view: &MemoryView, block: usize) -> bool {
    view.read_bytes(block, 6)
        .ok()
        .and_then(|data| parse_entry(&data))
        .is_some_and(|(name, _)| name == "None")
}

/// Pool header is sane, block 0 begins with `None` and the second entry is
/// `ByteProperty`.
pub fn validate_pool(cx: &DiscoveryContext<'_>, value: ArtifactValue) -> Result<()> {
    check_pool(cx.view(), cx.config(), value.raw())
}

fn check_pool(view: &MemoryView, config: &DiscoveryConfig, address: usize) -> Result<()> {
    let pool = NamePool::open(view, config, address)?;
    // "None" occupies 6 bytes, so the next entry sits at stride 3
    let second = pool.name(3)?;
    if second != "ByteProperty" {
        return Err(ScanError::invalid(format!(
            "second name is {:?}, not ByteProperty",
            second
        )));
    }
    Ok(())
}

/// Scan the image's data sections for a pool header
pub fn scan_data_sections(cx: &DiscoveryContext<'_>) -> Result<ArtifactValue> {
    let view = cx.view();
    for range in cx.image().data_ranges() {
        for span in view.readable_spans(range) {
            let mut start = span.start;
            while start < span.end {
                let len = (span.end - start).min(SCAN_CHUNK + NAME_POOL_BLOCKS_OFFSET + 8);
                let Ok(data) = view.read_bytes(start, len) else {
                    break;
                };
                for i in (0..data.len().saturating_sub(NAME_POOL_BLOCKS_OFFSET + 8)).step_by(8) {
                    let block0 = LE::read_u64(&data[i + 16..i + 24]) as usize;
                    if !cx.config().is_plausible_pointer(block0) {
                        continue;
                    }
                    let candidate = start + i;
                    if check_pool(view, cx.config(), candidate).is_ok() {
                        debug!(candidate = format_args!("{:#x}", candidate), "name pool header");
                        return Ok(ArtifactValue::Address(candidate));
                    }
                }
                start += SCAN_CHUNK;
            }
        }
    }
    Err(ScanError::not_found("name pool header in data sections"))
}

/// Find the `None`, `ByteProperty` entry pair anywhere in readable memory,
/// then the header whose first block pointer names that block.
pub fn scan_for_first_block(cx: &DiscoveryContext<'_>) -> Result<ArtifactValue> {
    let view = cx.view();
    let pattern = Pattern::parse("?? ?? 4E 6F 6E 65 ?? ?? 42 79 74 65 50 72 6F 70 65 72 74 79")?;

    let mut blocks = Vec::new();
    for region in view.regions().iter().filter(|r| r.is_readable()) {
        for hit in find_all(view, region.range(), &pattern) {
            if starts_with_none(view, hit) {
                blocks.push(hit);
            }
        }
    }
    debug!(candidates = blocks.len(), "first name block candidates");

    for block in blocks {
        let needle = Pattern::from_bytes(&(block as u64).to_le_bytes());
        for range in cx.image().data_ranges() {
            for hit in find_all(view, range, &needle) {
                if hit % 8 != 0 || hit < NAME_POOL_BLOCKS_OFFSET {
                    continue;
                }
                let candidate = hit - NAME_POOL_BLOCKS_OFFSET;
                if check_pool(view, cx.config(), candidate).is_ok() {
                    return Ok(ArtifactValue::Address(candidate));
                }
            }
        }
    }
    Err(ScanError::not_found("header for the first name block"))
}
