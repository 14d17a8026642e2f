//! Global object array
//!
//! `FUObjectArray` starts with a few GC bookkeeping ints on most engine
//! versions, then the object table. The table is either chunked:
//!
//! ```text
//! +0x00 Objects**   chunk pointer array
//! +0x08 PreAllocatedObjects*
//! +0x10 MaxElements  +0x14 NumElements
//! +0x18 MaxChunks    +0x1C NumChunks
//! ```
//!
//! or, on old engines, flat (`Objects*`, `MaxElements`, `NumElements`).
//! Each item is an `FUObjectItem` whose first field is the object pointer.

use super::anchors::anchor_references;
use super::constants::*;
use crate::config::DiscoveryConfig;
use crate::disasm::{Visit, WalkOptions, Walker};
use crate::error::{Result, ScanError};
use crate::memory::MemoryView;
use crate::registry::{ArtifactValue, DiscoveryContext};
use crate::scan::{find_all, Pattern};
use crate::validate::{sample_indices, validate_count};

use byteorder::{ByteOrder, LE};
use tracing::debug;

/// `mov rax, [rip+GUObjectArray]; mov rcx, [rax+rcx*8]; lea rax, [rcx+rdx*8]`
const CHUNK_ACCESS_SIGNATURE: &str = "48 8B 05 ?? ?? ?? ?? 48 8B 0C C8 48 8D 04 D1";

const SCAN_CHUNK: usize = 1024 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ObjectLayout {
    Chunked { chunks: usize },
    Flat,
}

#[derive(Debug, Clone)]
pub struct ObjectArray {
    view: MemoryView,
    address: usize,
    table: usize,
    layout: ObjectLayout,
    objects: usize,
    max: usize,
    num: usize,
    stride: usize,
}

impl ObjectArray {
    /// Open the `FUObjectArray` at `address`, detecting the table offset,
    /// layout and item size.
    pub fn open(view: &MemoryView, config: &DiscoveryConfig, address: usize) -> Result<Self> {
        let mut last = None;
        for table_offset in OBJECT_TABLE_OFFSETS {
            let table = address + table_offset;
            for probe in [probe_chunked, probe_flat] {
                match probe(view, config, table) {
                    Ok((layout, objects, max, num)) => {
                        let mut array = Self {
                            view: view.clone(),
                            address,
                            table,
                            layout,
                            objects,
                            max,
                            num,
                            stride: OBJECT_ITEM_SIZES[0],
                        };
                        match array.detect_stride(config) {
                            Ok(stride) => {
                                array.stride = stride;
                                return Ok(array);
                            }
                            Err(e) => last = Some(e),
                        }
                    }
                    Err(e) => last = Some(e),
                }
            }
        }
        Err(last.unwrap_or_else(|| ScanError::invalid("no object table layout")))
    }

    pub fn address(&self) -> usize {
        self.address
    }

    pub fn table(&self) -> usize {
        self.table
    }

    pub fn layout(&self) -> ObjectLayout {
        self.layout
    }

    pub fn stride(&self) -> usize {
        self.stride
    }

    pub fn len(&self) -> usize {
        self.num
    }

    pub fn is_empty(&self) -> bool {
        self.num == 0
    }

    pub fn capacity(&self) -> usize {
        self.max
    }

    /// Base of the items holding indices `[block * 64Ki, ...)`
    fn block_base(&self, block: usize) -> Result<usize> {
        match self.layout {
            ObjectLayout::Chunked { .. } => self.view.read_ptr(self.objects + block * 8),
            ObjectLayout::Flat => Ok(self.objects + block * OBJECTS_PER_CHUNK * self.stride),
        }
    }

    fn item_address(&self, index: usize) -> Result<usize> {
        let base = self.block_base(index / OBJECTS_PER_CHUNK)?;
        Ok(base + (index % OBJECTS_PER_CHUNK) * self.stride)
    }

    /// Object at `index`; `None` for a free slot
    pub fn get(&self, index: usize) -> Result<Option<usize>> {
        if index >= self.num {
            return Err(ScanError::not_found(format!(
                "object index {} beyond {}",
                index, self.num
            )));
        }
        let object = self.view.read_ptr(self.item_address(index)?)?;
        Ok((object != 0).then_some(object))
    }

    fn blocks(&self) -> usize {
        self.num.div_ceil(OBJECTS_PER_CHUNK)
    }

    /// Raw items of one block, as many as `NumElements` claims for it
    fn read_block(&self, block: usize) -> Result<Vec<u8>> {
        let first = block * OBJECTS_PER_CHUNK;
        let count = (self.num - first).min(OBJECTS_PER_CHUNK);
        let base = self.block_base(block)?;
        self.view.read_bytes(base, count * self.stride)
    }

    /// Every live `(index, object)`, one bulk read per chunk. Unreadable
    /// chunks are skipped.
    pub fn iter(&self) -> impl Iterator<Item = (usize, usize)> + '_ {
        (0..self.blocks()).flat_map(move |block| {
            let first = block * OBJECTS_PER_CHUNK;
            let items = self.read_block(block).unwrap_or_default();
            let stride = self.stride;
            (0..items.len() / stride).filter_map(move |i| {
                let object = LE::read_u64(&items[i * stride..i * stride + 8]) as usize;
                (object != 0).then_some((first + i, object))
            })
        })
    }

    /// Up to `count` live objects spread evenly over the array
    pub fn sample(&self, count: usize) -> Vec<(usize, usize)> {
        sample_indices(self.num, count)
            .filter_map(|index| self.get(index).ok().flatten().map(|object| (index, object)))
            .collect()
    }

    /// Visit every claimed entry: every chunk pointer up to `NumChunks`
    /// must be plausible, every claimed item readable, and each live object
    /// must start with a readable vtable. Returns the live count.
    pub fn validate_all(&self, config: &DiscoveryConfig) -> Result<usize> {
        if let ObjectLayout::Chunked { chunks } = self.layout {
            for chunk in 0..chunks {
                let base = self.block_base(chunk)?;
                if !config.is_plausible_pointer(base) {
                    return Err(ScanError::invalid(format!("chunk {} at {:#x}", chunk, base)));
                }
            }
        }

        let mut live = 0;
        for block in 0..self.blocks() {
            let items = self.read_block(block).map_err(|e| {
                ScanError::invalid(format!("items of chunk {} are unreadable: {}", block, e))
            })?;
            let first = block * OBJECTS_PER_CHUNK;
            for (i, item) in items.chunks_exact(self.stride).enumerate() {
                let object = LE::read_u64(&item[..8]) as usize;
                if object == 0 {
                    continue;
                }
                if !looks_like_object(&self.view, config, object) {
                    return Err(ScanError::invalid(format!(
                        "object {} at {:#x} has no vtable",
                        first + i,
                        object
                    )));
                }
                live += 1;
            }
        }
        if live == 0 {
            return Err(ScanError::invalid("object array holds no objects"));
        }
        Ok(live)
    }

    /// Pick the item size under which most sampled slots hold objects
    fn detect_stride(&self, config: &DiscoveryConfig) -> Result<usize> {
        let probe = self.num.min(32);
        let base = self.block_base(0)?;
        let mut best = None;
        for stride in OBJECT_ITEM_SIZES {
            let Ok(items) = self.view.read_bytes(base, probe * stride) else {
                continue;
            };
            let mut live = 0;
            let mut broken = false;
            for i in 0..probe {
                let object = LE::read_u64(&items[i * stride..i * stride + 8]) as usize;
                if object == 0 {
                    continue;
                }
                if looks_like_object(&self.view, config, object) {
                    live += 1;
                } else {
                    broken = true;
                    break;
                }
            }
            if broken || live * 2 < probe {
                continue;
            }
            if best.map(|(_, n)| live > n).unwrap_or(true) {
                best = Some((stride, live));
            }
        }
        best.map(|(stride, _)| stride)
            .ok_or_else(|| ScanError::invalid(format!("no item size fits table {:#x}", self.table)))
    }
}

fn looks_like_object(view: &MemoryView, config: &DiscoveryConfig, object: usize) -> bool {
    if !config.is_plausible_pointer(object) || object % 8 != 0 || !view.is_readable(object, 0x28) {
        return false;
    }
    view.read_ptr(object)
        .is_ok_and(|vtable| config.is_plausible_pointer(vtable) && view.is_readable(vtable, 8))
}

type Header = (ObjectLayout, usize, usize, usize);

fn probe_chunked(view: &MemoryView, config: &DiscoveryConfig, table: usize) -> Result<Header> {
    let header = view.read_bytes(table, 0x20)?;
    let objects = LE::read_u64(&header[0..8]) as usize;
    let preallocated = LE::read_u64(&header[8..16]) as usize;
    let max = LE::read_i32(&header[16..20]) as i64;
    let num = LE::read_i32(&header[20..24]) as i64;
    let max_chunks = LE::read_i32(&header[24..28]) as i64;
    let num_chunks = LE::read_i32(&header[28..32]) as i64;

    if !config.is_plausible_pointer(objects) {
        return Err(ScanError::invalid(format!("chunk table {:#x}", objects)));
    }
    if preallocated != 0 && !config.is_plausible_pointer(preallocated) {
        return Err(ScanError::invalid(format!("preallocated {:#x}", preallocated)));
    }
    let ceiling = config.max_object_count as i64;
    validate_count("max elements", max, 0, ceiling)?;
    validate_count("num elements", num, 0, max)?;
    if num == 0 {
        return Err(ScanError::invalid("object table is empty"));
    }
    let chunk_ceiling = config.max_object_count.div_ceil(OBJECTS_PER_CHUNK) as i64;
    validate_count("max chunks", max_chunks, 0, chunk_ceiling)?;
    validate_count("num chunks", num_chunks, 0, max_chunks)?;
    // num is positive past the checks above
    let needed = (num as usize).div_ceil(OBJECTS_PER_CHUNK) as i64;
    if num_chunks < needed {
        return Err(ScanError::invalid(format!(
            "{} chunks cannot hold {} objects",
            num_chunks, num
        )));
    }

    let chunk0 = view.read_ptr(objects)?;
    if !config.is_plausible_pointer(chunk0) {
        return Err(ScanError::invalid(format!("first chunk {:#x}", chunk0)));
    }
    Ok((
        ObjectLayout::Chunked {
            chunks: num_chunks as usize,
        },
        objects,
        max as usize,
        num as usize,
    ))
}

fn probe_flat(view: &MemoryView, config: &DiscoveryConfig, table: usize) -> Result<Header> {
    let header = view.read_bytes(table, 0x10)?;
    let objects = LE::read_u64(&header[0..8]) as usize;
    let max = LE::read_i32(&header[8..12]) as i64;
    let num = LE::read_i32(&header[12..16]) as i64;

    if !config.is_plausible_pointer(objects) {
        return Err(ScanError::invalid(format!("item array {:#x}", objects)));
    }
    validate_count("max elements", max, 0, config.max_object_count as i64)?;
    validate_count("num elements", num, 0, max)?;
    if num == 0 {
        return Err(ScanError::invalid("object table is empty"));
    }
    Ok((ObjectLayout::Flat, objects, max as usize, num as usize))
}

/// Full walk of every claimed entry
pub fn validate_array(cx: &DiscoveryContext<'_>, value: ArtifactValue) -> Result<()> {
    let array = ObjectArray::open(cx.view(), cx.config(), value.raw())?;
    let live = array.validate_all(cx.config())?;
    debug!(live, total = array.len(), "object array walked");
    Ok(())
}

/// Open the header at `address` and walk every entry it claims
fn check_array(view: &MemoryView, config: &DiscoveryConfig, address: usize) -> Result<usize> {
    ObjectArray::open(view, config, address)?.validate_all(config)
}

fn first_valid(cx: &DiscoveryContext<'_>, candidates: impl IntoIterator<Item = usize>) -> Result<ArtifactValue> {
    let mut tried = 0;
    for candidate in candidates {
        tried += 1;
        match check_array(cx.view(), cx.config(), candidate) {
            Ok(_) => return Ok(ArtifactValue::Address(candidate)),
            Err(e) => debug!(candidate = format_args!("{:#x}", candidate), "object array rejected: {}", e),
        }
    }
    Err(ScanError::not_found(format!("object array among {} candidates", tried)))
}

/// Walk forward from each anchor reference collecting RIP-relative
/// operands that land in data
pub fn from_anchors(cx: &DiscoveryContext<'_>) -> Result<ArtifactValue> {
    let image = cx.image();
    let walker = Walker::new(image, WalkOptions::new(cx.config().walk_budget));
    let mut candidates = Vec::new();
    for reference in anchor_references(image, cx.config(), cx.artifact()) {
        walker.walk(reference.next_address(), |insn| {
            if let Some(target) = insn.rip_target() {
                if image.is_data(target) && !candidates.contains(&target) {
                    candidates.push(target);
                }
            }
            Visit::Continue
        });
    }
    first_valid(cx, candidates)
}

/// The chunk-access idiom that loads the array in accessor functions
pub fn from_signature(cx: &DiscoveryContext<'_>) -> Result<ArtifactValue> {
    let pattern = Pattern::parse(CHUNK_ACCESS_SIGNATURE)?;
    let image = cx.image();
    let mut candidates = Vec::new();
    for range in image.code_ranges() {
        for hit in find_all(cx.view(), range, &pattern) {
            let Ok(disp) = cx.view().read_i32(hit + 3) else {
                continue;
            };
            let target = (hit as i64 + 7 + disp as i64) as usize;
            if image.is_data(target) && !candidates.contains(&target) {
                candidates.push(target);
            }
        }
    }
    first_valid(cx, candidates)
}

/// Structural scan of every 8-byte slot in the data sections
pub fn scan_data_sections(cx: &DiscoveryContext<'_>) -> Result<ArtifactValue> {
    let view = cx.view();
    let config = cx.config();
    for range in cx.image().data_ranges() {
        for span in view.readable_spans(range) {
            let mut start = span.start;
            while start < span.end {
                let len = (span.end - start).min(SCAN_CHUNK);
                let Ok(data) = view.read_bytes(start, len) else {
                    break;
                };
                for i in (0..data.len().saturating_sub(8)).step_by(8) {
                    let table_offset_hit = OBJECT_TABLE_OFFSETS.iter().any(|off| {
                        data.get(i + off..i + off + 8)
                            .is_some_and(|p| config.is_plausible_pointer(LE::read_u64(p) as usize))
                    });
                    if !table_offset_hit {
                        continue;
                    }
                    let candidate = start + i;
                    if let Ok(live) = check_array(view, config, candidate) {
                        debug!(
                            candidate = format_args!("{:#x}", candidate),
                            live,
                            "object array header"
                        );
                        return Ok(ArtifactValue::Address(candidate));
                    }
                }
                start += SCAN_CHUNK;
            }
        }
    }
    Err(ScanError::not_found("object array header in data sections"))
}
