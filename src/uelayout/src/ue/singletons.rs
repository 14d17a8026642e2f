//! Engine singletons and well-known functions
//!
//! Globals are found from the code that references an anchor literal. Two
//! shapes cover most of them:
//!
//! - *sentinel store*: an initializer calls a factory and stores the
//!   result, `call Create; mov [rip+G], rax`. Emulating the initializer
//!   with calls stubbed to sentinels exposes `G` as the target of a
//!   sentinel store.
//! - *global load*: an accessor reads the global, `mov rax, [rip+G]`,
//!   somewhere below the anchor reference.
//!
//! Functions are simply the function containing the anchor reference.

use super::anchors::anchor_references;
use super::constants::*;
use super::{names, objects};
use crate::disasm::{Flow, Visit, WalkOptions, Walker};
use crate::emulate::{is_sentinel, Emulator};
use crate::error::{Result, ScanError};
use crate::registry::{strategy, ArtifactSpec, ArtifactValue, DiscoveryContext, OffsetRegistry, Strategy};
use crate::validate::validate_singleton;

use tracing::{debug, trace};

/// Where to start analysing each anchor reference: its function, or the
/// referencing instruction when no function start is known
fn entry_points(cx: &DiscoveryContext<'_>) -> Vec<usize> {
    let image = cx.image();
    let mut starts = Vec::new();
    for reference in anchor_references(image, cx.config(), cx.artifact()) {
        let start = image
            .function_containing(reference.instruction)
            .unwrap_or(reference.instruction);
        if !starts.contains(&start) {
            starts.push(start);
        }
    }
    trace!(artifact = cx.artifact(), starts = starts.len(), "anchor entry points");
    starts
}

fn first_singleton(cx: &DiscoveryContext<'_>, how: &str, candidates: Vec<usize>) -> Result<ArtifactValue> {
    let count = candidates.len();
    candidates
        .into_iter()
        .find(|global| validate_singleton(cx.view(), cx.config(), *global).is_ok())
        .map(ArtifactValue::Address)
        .ok_or_else(|| {
            ScanError::not_found(format!("{} {} among {} candidates", cx.artifact(), how, count))
        })
}

fn sentinel_stores(cx: &DiscoveryContext<'_>) -> Result<ArtifactValue> {
    let image = cx.image();
    let mut candidates = Vec::new();
    for start in entry_points(cx) {
        let run = Emulator::new(cx.view(), start, cx.config().emulate_budget).run(|_| false);
        debug!(
            start = format_args!("{:#x}", start),
            halt = ?run.halt,
            steps = run.steps,
            skipped = run.skipped.len(),
            "emulated initializer"
        );
        for store in &run.skipped {
            if store.size == 8
                && is_sentinel(store.value)
                && image.is_data(store.address)
                && !candidates.contains(&store.address)
            {
                candidates.push(store.address);
            }
        }
    }
    first_singleton(cx, "sentinel store", candidates)
}

fn global_loads(cx: &DiscoveryContext<'_>) -> Result<ArtifactValue> {
    let image = cx.image();
    let walker = Walker::new(image, WalkOptions::new(cx.config().walk_budget));
    let mut candidates = Vec::new();
    for start in entry_points(cx) {
        walker.walk(start, |insn| {
            if insn.flow() == Flow::Call {
                return Visit::Recurse;
            }
            if insn.reads_memory() {
                if let Some(target) = insn.rip_target() {
                    if image.is_data(target) && !candidates.contains(&target) {
                        candidates.push(target);
                    }
                }
            }
            Visit::Continue
        });
    }
    first_singleton(cx, "global load", candidates)
}

fn containing_functions(cx: &DiscoveryContext<'_>) -> Result<ArtifactValue> {
    let image = cx.image();
    let mut tried = Vec::new();
    for reference in anchor_references(image, cx.config(), cx.artifact()) {
        let Some(start) = image.function_containing(reference.instruction) else {
            continue;
        };
        if tried.contains(&start) {
            continue;
        }
        tried.push(start);
        match cx.validate(ArtifactValue::Function(start)) {
            Ok(()) => return Ok(ArtifactValue::Function(start)),
            Err(e) => debug!(start = format_args!("{:#x}", start), error = %e, "containing function rejected"),
        }
    }
    Err(ScanError::not_found(format!(
        "function referencing {} anchors ({} rejected)",
        cx.artifact(),
        tried.len()
    )))
}

/// Global written with a factory's return value in an anchor's function
pub fn sentinel_store() -> Box<dyn Strategy> {
    strategy("sentinel-store", sentinel_stores)
}

/// Global read below an anchor reference, following direct calls
pub fn global_load() -> Box<dyn Strategy> {
    strategy("global-load", global_loads)
}

/// Function that references an anchor
pub fn containing_function() -> Box<dyn Strategy> {
    strategy("containing-function", containing_functions)
}

/// Global -> object -> vtable -> code
pub fn singleton_validator(cx: &DiscoveryContext<'_>, value: ArtifactValue) -> Result<()> {
    validate_singleton(cx.view(), cx.config(), value.raw()).map(|_| ())
}

/// Start of a function in a code section
pub fn function_validator(cx: &DiscoveryContext<'_>, value: ArtifactValue) -> Result<()> {
    let address = value.raw();
    let image = cx.image();
    if image.is_code(address) && image.function_containing(address) == Some(address) {
        Ok(())
    } else {
        Err(ScanError::invalid(format!("{:#x} is not a function start", address)))
    }
}

pub fn register(registry: &mut OffsetRegistry) -> Result<()> {
    registry.register(
        ArtifactSpec::singleton(GUOBJECT_ARRAY)
            .strategy(strategy("anchor-walk", objects::from_anchors))
            .strategy(strategy("chunk-access-signature", objects::from_signature))
            .strategy(strategy("data-scan", objects::scan_data_sections))
            .validator(objects::validate_array),
    )?;

    registry.register(
        ArtifactSpec::singleton(FNAME_POOL)
            .strategy(strategy("data-scan", names::scan_data_sections))
            .strategy(strategy("first-block", names::scan_for_first_block))
            .validator(names::validate_pool),
    )?;

    registry.register(
        ArtifactSpec::singleton(GMALLOC)
            .strategy(sentinel_store())
            .validator(singleton_validator),
    )?;

    for artifact in [CONSOLE_MANAGER, GDYNAMIC_RHI] {
        registry.register(
            ArtifactSpec::singleton(artifact)
                .strategy(sentinel_store())
                .strategy(global_load())
                .validator(singleton_validator),
        )?;
    }

    for artifact in [STATIC_FIND_OBJECT, ALLOCATE_UOBJECT_INDEX] {
        registry.register(
            ArtifactSpec::function(artifact)
                .strategy(containing_function())
                .validator(function_validator),
        )?;
    }

    Ok(())
}
