//! Reference resolver
//!
//! Finds instructions whose 32-bit relative field resolves to a target:
//! RIP-relative memory operands (`lea rcx, [rip+X]`) and direct near
//! branches (`call X`). Candidate fields are found arithmetically, then
//! confirmed by decoding the instruction around them.

use crate::disasm::{decode_slice, Instruction, MAX_INSTRUCTION_LEN};
use crate::memory::ModuleImage;

use byteorder::{ByteOrder, LE};
use std::ops::Range;
use tracing::trace;

const SCAN_CHUNK: usize = 1024 * 1024;

/// Bytes that may follow the displacement: none, imm8, imm16, imm32
const TRAILING_IMMEDIATE: [usize; 4] = [0, 1, 2, 4];

/// Longest prefix+opcode+modrm+sib run before a displacement
const MAX_LEAD: usize = MAX_INSTRUCTION_LEN - 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReferenceKind {
    RipRelativeMemory,
    NearBranch,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Reference {
    /// Address of the referencing instruction
    pub instruction: usize,
    /// Address of its 32-bit relative field
    pub displacement_at: usize,
    pub length: usize,
    pub kind: ReferenceKind,
}

impl Reference {
    pub fn next_address(&self) -> usize {
        self.instruction + self.length
    }
}

pub struct ReferenceScanner<'a> {
    image: &'a ModuleImage,
    range: Range<usize>,
}

impl<'a> ReferenceScanner<'a> {
    pub fn new(image: &'a ModuleImage, range: Range<usize>) -> Self {
        Self { image, range }
    }

    /// Scanner over the whole image
    pub fn whole(image: &'a ModuleImage) -> Self {
        Self::new(image, image.range())
    }

    /// First reference whose instruction starts after `after`
    pub fn find_next(&self, target: usize, after: Option<usize>) -> Option<Reference> {
        let from = after.map(|a| a + 1).unwrap_or(self.range.start);
        let mut found = None;
        self.scan(target, from, |reference| {
            if after.map(|a| reference.instruction > a).unwrap_or(true) {
                found = Some(reference);
                false
            } else {
                true
            }
        });
        found
    }

    /// Every reference, ascending by instruction address, without duplicates
    pub fn find_all(&self, target: usize) -> Vec<Reference> {
        let mut hits = Vec::new();
        self.scan(target, self.range.start, |reference| {
            hits.push(reference);
            true
        });
        hits.sort_by_key(|r| r.instruction);
        hits.dedup_by_key(|r| r.instruction);
        hits
    }

    /// Iterator over references via repeated `find_next`
    pub fn iter(&self, target: usize) -> References<'_, 'a> {
        References {
            scanner: self,
            target,
            last: None,
        }
    }

    fn scan<F>(&self, target: usize, from: usize, mut on_hit: F)
    where
        F: FnMut(Reference) -> bool,
    {
        let view = self.image.view();
        let range = from.max(self.range.start)..self.range.end;

        for span in view.readable_spans(range) {
            // Bytes before `from` may still hold the opcode of a hit
            let floor = view
                .readable_spans(self.range.clone())
                .into_iter()
                .find(|s| s.contains(&span.start))
                .map(|s| s.start)
                .unwrap_or(span.start);

            let mut chunk_start = span.start;
            while chunk_start + 4 <= span.end {
                let chunk_end = (chunk_start + SCAN_CHUNK).min(span.end);
                let read_start = chunk_start.saturating_sub(MAX_LEAD).max(floor);
                let read_end = (chunk_end + 8).min(self.range.end);
                let data = match view.read_up_to(read_start, read_end - read_start) {
                    Ok(d) => d,
                    Err(e) => {
                        trace!("reference scan skips {:#x}: {}", read_start, e);
                        chunk_start = chunk_end;
                        continue;
                    }
                };

                for field in chunk_start..chunk_end {
                    if field + 4 > read_start + data.len() {
                        break;
                    }
                    let at = field - read_start;
                    let disp = LE::read_i32(&data[at..at + 4]) as i64;
                    for trailing in TRAILING_IMMEDIATE {
                        let next = (field + 4 + trailing) as i64;
                        if next + disp != target as i64 {
                            continue;
                        }
                        if let Some(reference) =
                            confirm(&data, read_start, field, trailing, target)
                        {
                            if !on_hit(reference) {
                                return;
                            }
                        }
                    }
                }
                chunk_start = chunk_end;
            }
        }
    }
}

/// Decode backwards from the field for an instruction that encodes it.
/// The earliest valid start wins so prefixes stay part of the instruction.
fn confirm(
    data: &[u8],
    data_start: usize,
    field: usize,
    trailing: usize,
    target: usize,
) -> Option<Reference> {
    let end = field + 4 + trailing;
    let lowest = field.saturating_sub(MAX_LEAD).max(data_start);

    (lowest..field).find_map(|start| {
        let bytes = data.get(start - data_start..)?;
        let insn = decode_slice(bytes, start).ok()?;
        if insn.next_address() != end {
            return None;
        }
        classify(&insn, field, target).map(|kind| Reference {
            instruction: start,
            displacement_at: field,
            length: insn.len(),
            kind,
        })
    })
}

fn classify(insn: &Instruction, field: usize, target: usize) -> Option<ReferenceKind> {
    if insn.rip_target() == Some(target) && insn.displacement_address() == Some(field) {
        return Some(ReferenceKind::RipRelativeMemory);
    }
    if insn.branch_target() == Some(target) && insn.next_address() == field + 4 {
        return Some(ReferenceKind::NearBranch);
    }
    None
}

pub struct References<'s, 'a> {
    scanner: &'s ReferenceScanner<'a>,
    target: usize,
    last: Option<usize>,
}

impl Iterator for References<'_, '_> {
    type Item = Reference;

    fn next(&mut self) -> Option<Reference> {
        let found = self.scanner.find_next(self.target, self.last)?;
        self.last = Some(found.instruction);
        Some(found)
    }
}
