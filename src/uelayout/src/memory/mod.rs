//! Foreign memory access
//!
//! - `source` - backend trait implemented by processes, dumps and mocks
//! - `view` - the permission-checked accessor every read goes through
//! - `image` - the scanned module and its sections
//! - `pe` - PE header and exception directory parsing

mod image;
mod mock;
pub mod pe;
mod region;
mod source;
mod view;

pub use image::{ModuleImage, Section, SectionKind};
pub use mock::MockMemorySource;
pub use region::MemoryRegion;
pub use source::MemorySource;
pub use view::MemoryView;
