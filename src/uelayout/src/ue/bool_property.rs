//! `FBoolProperty` bitfield layout
//!
//! `PostProcessSettings` opens with long runs of `bOverride_*` bitfield
//! bools. Two neighbours in such a run share a byte and differ only in
//! their mask, which pins the four descriptor bytes.

use super::constants::*;
use super::search::{confirm, first_offset};
use super::struct_layout::{deps, Members};
use crate::error::{Result, ScanError};
use crate::registry::{strategy, ArtifactSpec, ArtifactValue, DiscoveryContext, OffsetRegistry};
use crate::validate::{validate_bool_pair, BoolProbe};

use tracing::debug;

const OVERRIDE_PREFIX: &str = "bOverride_";

/// Descriptor bytes after `FieldSize`, in order
const DESCRIPTOR: [(&str, usize); 3] = [
    (FBOOL_BYTE_OFFSET, 1),
    (FBOOL_BYTE_MASK, 2),
    (FBOOL_FIELD_MASK, 3),
];

const BOOL_DEPS: [&str; 5] = [
    USTRUCT_CHILD_PROPERTIES,
    FFIELD_NEXT,
    FFIELD_NAME,
    FFIELD_CLASS,
    FFIELD_CLASS_NAME,
];

/// Adjacent `bOverride_*` bool members of `PostProcessSettings`
struct OverridePairs {
    members: Members,
    pairs: Vec<(usize, usize)>,
}

impl OverridePairs {
    fn new(cx: &DiscoveryContext<'_>) -> Result<Self> {
        let members = Members::of(cx, POST_PROCESS_PATH)?;
        let name = cx.require_offset(FFIELD_NAME)?;
        let class = cx.require_offset(FFIELD_CLASS)?;
        let class_name = cx.require_offset(FFIELD_CLASS_NAME)?;

        let reader = &members.reader;
        let is_override = |field: usize| {
            reader
                .fname_at(field + name)
                .is_ok_and(|n| n.starts_with(OVERRIDE_PREFIX))
                && reader
                    .view()
                    .read_ptr(field + class)
                    .and_then(|c| reader.fname_at(c + class_name))
                    .is_ok_and(|n| n == "BoolProperty")
        };
        let pairs: Vec<_> = members
            .fields
            .windows(2)
            .filter(|w| is_override(w[0]) && is_override(w[1]))
            .map(|w| (w[0], w[1]))
            .collect();

        debug!(members = members.fields.len(), pairs = pairs.len(), "override bools");
        if pairs.is_empty() {
            return Err(ScanError::not_found("adjacent bOverride_ bools"));
        }
        Ok(Self { members, pairs })
    }

    fn probe(&self, field: usize, offset: usize) -> Option<BoolProbe> {
        let bytes = self.members.reader.view().read_bytes(field + offset, 4).ok()?;
        Some(BoolProbe::from_bytes(bytes.try_into().ok()?))
    }

    /// Some pair describes bits 0 and 1 of one byte when read at `offset`
    fn matches(&self, offset: usize) -> bool {
        self.pairs.iter().any(|&(first, second)| {
            match (self.probe(first, offset), self.probe(second, offset)) {
                (Some(a), Some(b)) => validate_bool_pair(a, b).is_ok(),
                _ => false,
            }
        })
    }

    fn field_size(&self) -> Result<ArtifactValue> {
        first_offset(FBOOL_FIELD_SIZE, FBOOL_WINDOW, 1, |o| self.matches(o))
    }
}

fn check_field_size(cx: &DiscoveryContext<'_>, offset: usize) -> Result<()> {
    confirm(OverridePairs::new(cx)?.matches(offset), FBOOL_FIELD_SIZE, offset)
}

pub fn register(registry: &mut OffsetRegistry) -> Result<()> {
    registry.register(
        ArtifactSpec::field(FBOOL_FIELD_SIZE)
            .depends_on(deps(&BOOL_DEPS))
            .strategy(strategy("override-pairs", |cx| OverridePairs::new(cx)?.field_size()))
            .validator(|cx, v| check_field_size(cx, v.raw())),
    )?;

    for (artifact, delta) in DESCRIPTOR {
        registry.register(
            ArtifactSpec::field(artifact)
                .depends_on(deps(&BOOL_DEPS))
                .depends_on([FBOOL_FIELD_SIZE])
                .strategy(strategy("after-field-size", move |cx| {
                    Ok(ArtifactValue::Offset(cx.require_offset(FBOOL_FIELD_SIZE)? + delta))
                }))
                .validator(move |cx, v| {
                    let field_size = v
                        .raw()
                        .checked_sub(delta)
                        .ok_or_else(|| ScanError::invalid(format!("{} below FieldSize", artifact)))?;
                    check_field_size(cx, field_size)
                }),
        )?;
    }

    Ok(())
}
