//! Offset search helpers shared by the layout discovery routines

use crate::error::{Result, ScanError};
use crate::registry::ArtifactValue;

use std::ops::Range;

/// Offsets in `window` aligned to `align`
pub fn offsets_in(window: Range<usize>, align: usize) -> impl Iterator<Item = usize> {
    let start = window.start.div_ceil(align) * align;
    (start..window.end).step_by(align)
}

/// First offset `check` accepts
pub fn first_offset<F>(what: &str, window: Range<usize>, align: usize, mut check: F) -> Result<ArtifactValue>
where
    F: FnMut(usize) -> bool,
{
    offsets_in(window.clone(), align)
        .find(|offset| check(*offset))
        .map(ArtifactValue::Offset)
        .ok_or_else(|| ScanError::not_found(format!("{} in {:#x}..{:#x}", what, window.start, window.end)))
}

/// Validator verdict for a candidate offset
pub fn confirm(accepted: bool, what: &str, offset: usize) -> Result<()> {
    if accepted {
        Ok(())
    } else {
        Err(ScanError::invalid(format!("{} rejects offset {:#x}", what, offset)))
    }
}

/// Follow an intrusive singly linked list, stopping at null, on a
/// repeated node, or after `limit` nodes
pub fn walk_list<F>(head: usize, limit: usize, mut next: F) -> Vec<usize>
where
    F: FnMut(usize) -> Option<usize>,
{
    let mut nodes = Vec::new();
    let mut node = head;
    while node != 0 && nodes.len() < limit && !nodes.contains(&node) {
        nodes.push(node);
        match next(node) {
            Some(n) => node = n,
            None => break,
        }
    }
    nodes
}
