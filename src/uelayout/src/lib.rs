//! # uelayout
//!
//! Runtime structure-layout discovery for stripped Unreal Engine binaries.
//!
//! Given a loaded module image, the crate locates engine singletons (the
//! object array, the name pool, the allocator, the console manager, the RHI)
//! and the byte offsets of the reflection records (`UObject`, `UStruct`,
//! `FField`, `FProperty`, ...) without symbols or version information.
//! Every artifact starts from an anchor (a string literal, a code
//! signature, a structural invariant), is traced through code with the
//! walker or the emulator, and is confirmed by a validator before the
//! [`OffsetRegistry`] publishes it.
//!
//! ## Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use uelayout::{ue, DiscoveryConfig, MemoryView, MockMemorySource, ModuleImage, OffsetRegistry};
//!
//! # fn main() -> uelayout::Result<()> {
//! let view = MemoryView::from_source(MockMemorySource::default());
//! let image = ModuleImage::locate(view, Some("Game.exe"))?;
//! let mut registry = OffsetRegistry::new(Arc::new(image), DiscoveryConfig::default());
//! ue::register_defaults(&mut registry)?;
//!
//! if let Some(offset) = registry.offset(ue::constants::UOBJECT_NAME) {
//!     println!("UObject::NamePrivate at {:#x}", offset);
//! }
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod disasm;
pub mod emulate;
pub mod error;
pub mod memory;
pub mod registry;
pub mod scan;
pub mod ue;
pub mod validate;

#[doc(inline)]
pub use config::DiscoveryConfig;
#[doc(inline)]
pub use error::{Result, ScanError};
#[doc(inline)]
pub use memory::{MemoryRegion, MemorySource, MemoryView, MockMemorySource, ModuleImage};
#[doc(inline)]
pub use registry::{ArtifactKind, ArtifactSpec, ArtifactStatus, ArtifactValue, HintCache, OffsetRegistry};
