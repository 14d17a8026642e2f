//! Typed field access through resolved offsets
//!
//! Pure pointer arithmetic over caller-owned instances: a [`FieldTable`]
//! is a snapshot of whatever the registry has resolved so far, and reading
//! or writing through it never triggers discovery.

use super::constants::*;
use crate::error::{Result, ScanError};
use crate::memory::MemoryView;
use crate::registry::OffsetRegistry;

use serde::Serialize;
use std::collections::BTreeMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ValueKind {
    U8,
    I32,
    U32,
    U64,
    Pointer,
    /// `FName` comparison index
    Name,
}

impl ValueKind {
    pub fn width(self) -> usize {
        match self {
            ValueKind::U8 => 1,
            ValueKind::I32 | ValueKind::U32 | ValueKind::Name => 4,
            ValueKind::U64 | ValueKind::Pointer => 8,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", content = "value")]
pub enum FieldValue {
    U8(u8),
    I32(i32),
    U32(u32),
    U64(u64),
    Pointer(usize),
    Name(u32),
}

impl FieldValue {
    pub fn kind(&self) -> ValueKind {
        match self {
            FieldValue::U8(_) => ValueKind::U8,
            FieldValue::I32(_) => ValueKind::I32,
            FieldValue::U32(_) => ValueKind::U32,
            FieldValue::U64(_) => ValueKind::U64,
            FieldValue::Pointer(_) => ValueKind::Pointer,
            FieldValue::Name(_) => ValueKind::Name,
        }
    }

    fn to_bytes(self) -> Vec<u8> {
        match self {
            FieldValue::U8(v) => vec![v],
            FieldValue::I32(v) => v.to_le_bytes().to_vec(),
            FieldValue::U32(v) | FieldValue::Name(v) => v.to_le_bytes().to_vec(),
            FieldValue::U64(v) => v.to_le_bytes().to_vec(),
            FieldValue::Pointer(v) => (v as u64).to_le_bytes().to_vec(),
        }
    }
}

/// Value kind of every field artifact
pub const FIELD_KINDS: [(&str, ValueKind); 25] = [
    (UOBJECT_OBJECT_FLAGS, ValueKind::U32),
    (UOBJECT_INTERNAL_INDEX, ValueKind::I32),
    (UOBJECT_CLASS, ValueKind::Pointer),
    (UOBJECT_NAME, ValueKind::Name),
    (UOBJECT_OUTER, ValueKind::Pointer),
    (UFIELD_NEXT, ValueKind::Pointer),
    (USTRUCT_SUPER, ValueKind::Pointer),
    (USTRUCT_CHILDREN, ValueKind::Pointer),
    (USTRUCT_CHILD_PROPERTIES, ValueKind::Pointer),
    (USTRUCT_PROPERTIES_SIZE, ValueKind::I32),
    (UCLASS_DEFAULT_OBJECT, ValueKind::Pointer),
    (UFUNCTION_FLAGS, ValueKind::U32),
    (UFUNCTION_FUNC, ValueKind::Pointer),
    (FFIELD_CLASS, ValueKind::Pointer),
    (FFIELD_NEXT, ValueKind::Pointer),
    (FFIELD_NAME, ValueKind::Name),
    (FFIELD_CLASS_NAME, ValueKind::Name),
    (FPROPERTY_ARRAY_DIM, ValueKind::I32),
    (FPROPERTY_ELEMENT_SIZE, ValueKind::I32),
    (FPROPERTY_FLAGS, ValueKind::U64),
    (FPROPERTY_OFFSET, ValueKind::I32),
    (FBOOL_FIELD_SIZE, ValueKind::U8),
    (FBOOL_BYTE_OFFSET, ValueKind::U8),
    (FBOOL_BYTE_MASK, ValueKind::U8),
    (FBOOL_FIELD_MASK, ValueKind::U8),
];

pub fn kind_of(field: &str) -> Result<ValueKind> {
    FIELD_KINDS
        .iter()
        .find(|(name, _)| *name == field)
        .map(|(_, kind)| *kind)
        .ok_or_else(|| ScanError::UnknownArtifact(field.to_string()))
}

/// Resolved field offsets
#[derive(Debug, Clone, Default)]
pub struct FieldTable {
    offsets: BTreeMap<&'static str, usize>,
}

impl FieldTable {
    /// Offsets the registry has already resolved
    pub fn from_registry(registry: &OffsetRegistry) -> Self {
        let offsets = FIELD_KINDS
            .iter()
            .filter_map(|(name, _)| registry.peek(name).map(|v| (*name, v.raw())))
            .collect();
        Self { offsets }
    }

    pub fn len(&self) -> usize {
        self.offsets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.offsets.is_empty()
    }

    pub fn offset(&self, field: &str) -> Result<usize> {
        kind_of(field)?;
        self.offsets
            .get(field)
            .copied()
            .ok_or_else(|| ScanError::not_found(format!("{} is not resolved", field)))
    }

    pub fn read_field(&self, view: &MemoryView, instance: usize, field: &str) -> Result<FieldValue> {
        let kind = kind_of(field)?;
        let address = instance + self.offset(field)?;
        Ok(match kind {
            ValueKind::U8 => FieldValue::U8(view.read_u8(address)?),
            ValueKind::I32 => FieldValue::I32(view.read_i32(address)?),
            ValueKind::U32 => FieldValue::U32(view.read_u32(address)?),
            ValueKind::U64 => FieldValue::U64(view.read_u64(address)?),
            ValueKind::Pointer => FieldValue::Pointer(view.read_ptr(address)?),
            ValueKind::Name => FieldValue::Name(view.read_u32(address)?),
        })
    }

    pub fn write_field(
        &self,
        view: &MemoryView,
        instance: usize,
        field: &str,
        value: FieldValue,
    ) -> Result<()> {
        let kind = kind_of(field)?;
        if value.kind() != kind {
            return Err(ScanError::invalid(format!(
                "{} holds {:?}, not {:?}",
                field,
                kind,
                value.kind()
            )));
        }
        let address = instance + self.offset(field)?;
        view.write_bytes(address, &value.to_bytes())
    }
}

#[cfg(test)]
mod tests {
    use super::super::testing::{layout, World};
    use super::*;

    #[test]
    fn test_table_never_discovers() {
        let world = World::build();
        let registry = world.registry();

        assert!(FieldTable::from_registry(&registry).is_empty());
        assert_eq!(registry.discovery_runs(), 0);

        registry.resolve(USTRUCT_PROPERTIES_SIZE);
        let table = FieldTable::from_registry(&registry);
        assert_eq!(table.offset(USTRUCT_PROPERTIES_SIZE).unwrap(), layout::STRUCT_SIZE);
        assert!(matches!(table.offset(FPROPERTY_FLAGS), Err(ScanError::NotFound(_))));
    }

    #[test]
    fn test_reads_typed_fields() {
        let world = World::build();
        let registry = world.registry();
        registry.resolve_all();
        let table = FieldTable::from_registry(&registry);
        assert_eq!(table.len(), FIELD_KINDS.len());

        let view = world.view();
        assert_eq!(
            table.read_field(view, world.vector, USTRUCT_PROPERTIES_SIZE).unwrap(),
            FieldValue::I32(12)
        );
        assert_eq!(
            table.read_field(view, world.library, USTRUCT_CHILDREN).unwrap(),
            FieldValue::Pointer(world.functions[0])
        );
        assert_eq!(
            table.read_field(view, world.override_bools[1], FBOOL_BYTE_MASK).unwrap(),
            FieldValue::U8(2)
        );
        let name = world.read_u32(world.vector_fields[0] + layout::FFIELD_NAME);
        assert_eq!(
            table.read_field(view, world.vector_fields[0], FFIELD_NAME).unwrap(),
            FieldValue::Name(name)
        );
    }

    #[test]
    fn test_write_field() {
        let world = World::build();
        let registry = world.registry();
        registry.resolve_all();
        let table = FieldTable::from_registry(&registry);
        let view = world.view();

        table
            .write_field(view, world.vector, UOBJECT_OBJECT_FLAGS, FieldValue::U32(0x41))
            .unwrap();
        assert_eq!(world.read_u32(world.vector + layout::OBJ_FLAGS), 0x41);

        let err = table
            .write_field(view, world.vector, UOBJECT_OBJECT_FLAGS, FieldValue::U64(1))
            .unwrap_err();
        assert!(matches!(err, ScanError::ValidationFailed(_)));

        let err = table.read_field(view, world.vector, "UObject::Missing").unwrap_err();
        assert!(matches!(err, ScanError::UnknownArtifact(_)));
    }
}
