//! Process-wide registry
//!
//! Injected code usually wants a single registry shared by every caller.
//! It is installed once; later installs are refused.

use super::{ArtifactValue, OffsetRegistry};

use once_cell::sync::OnceCell;

static REGISTRY: OnceCell<OffsetRegistry> = OnceCell::new();

/// Install the process-wide registry. Returns it back if one already exists.
pub fn install(registry: OffsetRegistry) -> Result<&'static OffsetRegistry, OffsetRegistry> {
    REGISTRY
        .try_insert(registry)
        .map_err(|(_, rejected)| rejected)
}

pub fn registry() -> Option<&'static OffsetRegistry> {
    REGISTRY.get()
}

/// Resolve through the process-wide registry
pub fn resolve(name: &str) -> Option<ArtifactValue> {
    registry()?.resolve(name)
}
