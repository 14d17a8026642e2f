//! Reflection walker
//!
//! Enumerates the live type graph (classes, script structs, functions and
//! their members) through registry-resolved offsets only.

use super::constants::*;
use super::reader::{ObjectReader, READER_ARTIFACTS};
use super::struct_layout::chain;
use crate::error::Result;
use crate::registry::OffsetRegistry;

use serde::Serialize;
use tracing::debug;

/// Generic member kind, from the member's property class name
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum FieldKind {
    Bool,
    Int,
    Float,
    Object,
    Struct,
    Enum,
    Array,
    Other,
}

impl FieldKind {
    pub fn from_class_name(name: &str) -> Self {
        match name {
            "BoolProperty" => Self::Bool,
            "ByteProperty" | "Int8Property" | "Int16Property" | "IntProperty" | "Int64Property"
            | "UInt16Property" | "UInt32Property" | "UInt64Property" => Self::Int,
            "FloatProperty" | "DoubleProperty" => Self::Float,
            "ObjectProperty"
            | "ClassProperty" // subtype of ObjectProperty
            | "WeakObjectProperty"
            | "LazyObjectProperty"
            | "SoftObjectProperty"
            | "SoftClassProperty"
            | "InterfaceProperty" => Self::Object,
            "StructProperty" => Self::Struct,
            "EnumProperty" => Self::Enum,
            "ArrayProperty" => Self::Array,
            _ => Self::Other,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum TypeKind {
    Class,
    Struct,
    Function,
    Other,
}

/// Location of a packed bool within its byte
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct BoolField {
    pub byte_offset: u8,
    pub byte_mask: u8,
}

#[derive(Debug, Clone, Serialize)]
pub struct MemberInfo {
    pub name: String,
    pub class_name: String,
    pub kind: FieldKind,
    pub offset: u32,
    pub element_size: u32,
    pub array_dim: u32,
    pub flags: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bool_field: Option<BoolField>,
}

#[derive(Debug, Clone, Serialize)]
pub struct TypeInfo {
    pub address: usize,
    pub name: String,
    pub path: String,
    pub kind: TypeKind,
    pub super_name: Option<String>,
    pub size: u32,
    pub members: Vec<MemberInfo>,
    pub functions: Vec<String>,
}

#[derive(Debug, Clone, Copy)]
struct Layout {
    super_struct: usize,
    children: usize,
    next: usize,
    child_properties: usize,
    properties_size: usize,
    field_next: usize,
    field_name: usize,
    field_class: usize,
    field_class_name: usize,
    offset: usize,
    element_size: usize,
    array_dim: usize,
    flags: usize,
    /// `ByteOffset` and `ByteMask`, when bools resolved
    bools: Option<(usize, usize)>,
}

#[derive(Debug)]
pub struct ReflectionWalker {
    reader: ObjectReader,
    layout: Layout,
    struct_class: usize,
}

impl ReflectionWalker {
    /// Resolve everything the walk needs. Fails with `DiscoveryExhausted`
    /// for the first artifact that could not be discovered.
    pub fn new(registry: &OffsetRegistry) -> Result<Self> {
        for artifact in READER_ARTIFACTS {
            registry.try_resolve(artifact)?;
        }
        let offset = |artifact: &str| registry.try_resolve(artifact).map(|v| v.raw());
        let super_struct = offset(USTRUCT_SUPER)?;
        let children = offset(USTRUCT_CHILDREN)?;
        let next = offset(UFIELD_NEXT)?;
        let child_properties = offset(USTRUCT_CHILD_PROPERTIES)?;
        let properties_size = offset(USTRUCT_PROPERTIES_SIZE)?;
        let field_next = offset(FFIELD_NEXT)?;
        let field_name = offset(FFIELD_NAME)?;
        let field_class = offset(FFIELD_CLASS)?;
        let field_class_name = offset(FFIELD_CLASS_NAME)?;
        let offset_internal = offset(FPROPERTY_OFFSET)?;
        let element_size = offset(FPROPERTY_ELEMENT_SIZE)?;
        let array_dim = offset(FPROPERTY_ARRAY_DIM)?;
        let flags = offset(FPROPERTY_FLAGS)?;

        let bools = registry
            .offset(FBOOL_BYTE_OFFSET)
            .zip(registry.offset(FBOOL_BYTE_MASK));
        if bools.is_none() {
            debug!("bool descriptor unavailable, packed bools reported without masks");
        }

        let reader = ObjectReader::from_registry(registry)?;
        let struct_class = reader.find_class("Struct")?;
        Ok(Self {
            reader,
            layout: Layout {
                super_struct,
                children,
                next,
                child_properties,
                properties_size,
                field_next,
                field_name,
                field_class,
                field_class_name,
                offset: offset_internal,
                element_size,
                array_dim,
                flags,
                bools,
            },
            struct_class,
        })
    }

    pub fn reader(&self) -> &ObjectReader {
        &self.reader
    }

    /// `SuperStruct` chain starting at `object` itself
    fn supers(&self, object: usize) -> Vec<usize> {
        let view = self.reader.view();
        let mut chain = Vec::new();
        let mut current = object;
        while current != 0 && chain.len() < MAX_CLASS_CHAIN && !chain.contains(&current) {
            chain.push(current);
            current = view.read_ptr(current + self.layout.super_struct).unwrap_or(0);
        }
        chain
    }

    /// Whether `object` describes a type: its class descends from `Struct`
    pub fn is_type(&self, object: usize) -> bool {
        self.reader
            .class_of(object)
            .is_ok_and(|class| self.supers(class).contains(&self.struct_class))
    }

    /// Every type descriptor in the object array
    pub fn types(&self) -> impl Iterator<Item = usize> + '_ {
        self.reader
            .objects()
            .iter()
            .map(|(_, object)| object)
            .filter(|object| self.is_type(*object))
    }

    fn type_kind(&self, object: usize) -> TypeKind {
        let Ok(class) = self.reader.class_of(object) else {
            return TypeKind::Other;
        };
        self.supers(class)
            .into_iter()
            .find_map(|c| match self.reader.name_of(c).ok()?.as_str() {
                "Class" => Some(TypeKind::Class),
                "ScriptStruct" => Some(TypeKind::Struct),
                "Function" => Some(TypeKind::Function),
                _ => None,
            })
            .unwrap_or(TypeKind::Other)
    }

    pub fn describe(&self, object: usize) -> Result<TypeInfo> {
        let view = self.reader.view();
        let layout = &self.layout;

        let super_struct = view.read_ptr(object + layout.super_struct)?;
        let super_name = if super_struct == 0 {
            None
        } else {
            Some(self.reader.name_of(super_struct)?)
        };

        let members = self
            .members(object)
            .into_iter()
            .map(|field| self.member(field))
            .collect::<Result<Vec<_>>>()?;

        let functions = chain(&self.reader, object, layout.children, layout.next)
            .into_iter()
            .filter(|child| self.reader.class_name(*child).is_ok_and(|c| c == "Function"))
            .filter_map(|function| self.reader.name_of(function).ok())
            .collect();

        Ok(TypeInfo {
            address: object,
            name: self.reader.name_of(object)?,
            path: self.reader.path_name(object)?,
            kind: self.type_kind(object),
            super_name,
            size: view.read_u32(object + layout.properties_size)?,
            members,
            functions,
        })
    }

    /// Member descriptors of a type, in declaration order
    pub fn members(&self, object: usize) -> Vec<usize> {
        chain(
            &self.reader,
            object,
            self.layout.child_properties,
            self.layout.field_next,
        )
    }

    pub fn member(&self, field: usize) -> Result<MemberInfo> {
        let view = self.reader.view();
        let layout = &self.layout;

        let class = view.read_ptr(field + layout.field_class)?;
        let class_name = self.reader.fname_at(class + layout.field_class_name)?;
        let kind = FieldKind::from_class_name(&class_name);

        let bool_field = match (kind, layout.bools) {
            (FieldKind::Bool, Some((byte_offset, byte_mask))) => Some(BoolField {
                byte_offset: view.read_u8(field + byte_offset)?,
                byte_mask: view.read_u8(field + byte_mask)?,
            }),
            _ => None,
        };

        Ok(MemberInfo {
            name: self.reader.fname_at(field + layout.field_name)?,
            class_name,
            kind,
            offset: view.read_u32(field + layout.offset)?,
            element_size: view.read_u32(field + layout.element_size)?,
            array_dim: view.read_u32(field + layout.array_dim)?,
            flags: view.read_u64(field + layout.flags)?,
            bool_field,
        })
    }
}
