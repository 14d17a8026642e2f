//! Command handlers

mod info;
mod resolve;
mod scan;
mod types;

pub use info::handle_info;
pub use resolve::handle_resolve;
pub use scan::{handle_disasm, handle_strings, handle_xrefs};
pub use types::handle_types;

use anyhow::{Context, Result};
use std::sync::Arc;
use uelayout::{ue, DiscoveryConfig, ModuleImage, OffsetRegistry};

/// Registry over `image` with every built-in artifact
pub fn build_registry(image: Arc<ModuleImage>, config: DiscoveryConfig) -> Result<OffsetRegistry> {
    let mut registry = OffsetRegistry::new(image, config);
    ue::register_defaults(&mut registry).context("Failed to register built-in artifacts")?;
    Ok(registry)
}
