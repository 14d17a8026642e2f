//! Unreal Engine knowledge: anchors, artifact catalogue and discovery
//! routines, plus readers over the structures they locate.

pub mod anchors;
pub mod bool_property;
pub mod constants;
pub mod field;
pub mod function_layout;
pub mod names;
pub mod object_layout;
pub mod objects;
pub mod reader;
pub mod reflection;
pub mod search;
pub mod singletons;
pub mod struct_layout;

#[cfg(test)]
pub(crate) mod testing;

pub use field::{FieldTable, FieldValue, ValueKind};
pub use names::NamePool;
pub use objects::{ObjectArray, ObjectLayout};
pub use reader::{ObjectOffsets, ObjectReader};
pub use reflection::{BoolField, FieldKind, MemberInfo, ReflectionWalker, TypeInfo, TypeKind};

use crate::error::Result;
use crate::registry::OffsetRegistry;

/// Register every built-in artifact with its strategies and validator
pub fn register_defaults(registry: &mut OffsetRegistry) -> Result<()> {
    singletons::register(registry)?;
    object_layout::register(registry)?;
    struct_layout::register(registry)?;
    bool_property::register(registry)?;
    function_layout::register(registry)?;
    Ok(())
}
