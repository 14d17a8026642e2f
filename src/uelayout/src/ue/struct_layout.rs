//! `UStruct`, `FField` and `FProperty` layout
//!
//! Every offset here is pinned by a type whose shape does not change
//! between engine versions: the metaclass chain `Class -> Struct -> Field`,
//! the functions of a native library class, and the three float members of
//! `Vector`.

use super::constants::*;
use super::reader::{ObjectReader, READER_ARTIFACTS};
use super::search::{confirm, first_offset, offsets_in, walk_list};
use crate::error::{Result, ScanError};
use crate::registry::{strategy, ArtifactSpec, ArtifactValue, DiscoveryContext, OffsetRegistry};

const AXES: [&str; 3] = ["X", "Y", "Z"];
const FLOAT_CLASSES: [&str; 2] = ["FloatProperty", "DoubleProperty"];

/// Artifacts needed to walk the members of a script struct
pub(crate) const MEMBER_WALK: [&str; 3] = [USTRUCT_CHILD_PROPERTIES, FFIELD_NEXT, FFIELD_NAME];

/// Reader artifacts followed by `extra`
pub(crate) fn deps(extra: &[&'static str]) -> Vec<&'static str> {
    READER_ARTIFACTS.iter().chain(extra).copied().collect()
}

/// Nodes of the intrusive list whose head is stored at `owner + head`
pub(crate) fn chain(reader: &ObjectReader, owner: usize, head: usize, next: usize) -> Vec<usize> {
    let Ok(first) = reader.view().read_ptr(owner + head) else {
        return Vec::new();
    };
    walk_list(first, MAX_LIST_LEN, |node| reader.view().read_ptr(node + next).ok())
}

/// `FName`s of `nodes` read at `name`
pub(crate) fn names_at(reader: &ObjectReader, nodes: &[usize], name: usize) -> Option<Vec<String>> {
    nodes.iter().map(|node| reader.fname_at(node + name).ok()).collect()
}

/// Members of a script struct, walked through resolved offsets
pub(crate) struct Members {
    pub reader: ObjectReader,
    pub owner: usize,
    pub fields: Vec<usize>,
}

impl Members {
    /// Members of the struct at `path`; needs [`MEMBER_WALK`] declared
    pub(crate) fn of(cx: &DiscoveryContext<'_>, path: &str) -> Result<Self> {
        let reader = ObjectReader::from_context(cx)?;
        let owner = reader.find_path(path)?;
        let fields = chain(
            &reader,
            owner,
            cx.require_offset(USTRUCT_CHILD_PROPERTIES)?,
            cx.require_offset(FFIELD_NEXT)?,
        );
        Ok(Self {
            reader,
            owner,
            fields,
        })
    }

    /// `Vector`'s members, which must read `X`, `Y`, `Z`
    pub(crate) fn vector(cx: &DiscoveryContext<'_>) -> Result<Self> {
        let members = Self::of(cx, VECTOR_PATH)?;
        let names = names_at(&members.reader, &members.fields, cx.require_offset(FFIELD_NAME)?);
        if names.is_some_and(|names| names == AXES) {
            Ok(members)
        } else {
            Err(ScanError::invalid("Vector members are not X, Y, Z"))
        }
    }

    /// `u32` at `offset` in every member
    pub(crate) fn read_u32s(&self, offset: usize) -> Option<Vec<u32>> {
        self.fields
            .iter()
            .map(|field| self.reader.view().read_u32(field + offset).ok())
            .collect()
    }

    fn all_u32(&self, offset: usize, expected: u32) -> bool {
        self.read_u32s(offset)
            .is_some_and(|values| values.iter().all(|v| *v == expected))
    }
}

// UStruct::SuperStruct

fn is_super(reader: &ObjectReader, class: usize, offset: usize) -> bool {
    let parent = |object: usize| {
        reader
            .view()
            .read_ptr(object + offset)
            .ok()
            .filter(|p| *p != 0 && *p != object)
    };
    let Some(structure) = parent(class) else {
        return false;
    };
    let Some(field) = parent(structure) else {
        return false;
    };
    reader.name_of(structure).is_ok_and(|n| n == "Struct")
        && reader.name_of(field).is_ok_and(|n| n == "Field")
}

fn super_struct(cx: &DiscoveryContext<'_>) -> Result<ArtifactValue> {
    let reader = ObjectReader::from_context(cx)?;
    let class = reader.find_class("Class")?;
    first_offset(USTRUCT_SUPER, USTRUCT_WINDOW, 8, |o| is_super(&reader, class, o))
}

// UStruct::Children, UField::Next

/// A class whose children are all native functions, else `Object`
fn library_class(reader: &ObjectReader) -> Result<usize> {
    NATIVE_LIBRARIES
        .iter()
        .find_map(|name| reader.find_class(name).ok())
        .map_or_else(|| reader.find_class("Object"), Ok)
}

/// `class`'s children when walked with `children` and `next` are at least
/// two functions, all owned by `class`
fn is_function_list(reader: &ObjectReader, class: usize, children: usize, next: usize) -> bool {
    let nodes = chain(reader, class, children, next);
    nodes.len() >= 2
        && nodes.iter().all(|node| {
            reader.class_name(*node).is_ok_and(|c| c == "Function")
                && reader.outer_of(*node).is_ok_and(|outer| outer == class)
        })
}

fn children(cx: &DiscoveryContext<'_>) -> Result<ArtifactValue> {
    let reader = ObjectReader::from_context(cx)?;
    let class = library_class(&reader)?;
    first_offset(USTRUCT_CHILDREN, USTRUCT_WINDOW, 8, |c| {
        offsets_in(UFIELD_NEXT_WINDOW, 8).any(|n| is_function_list(&reader, class, c, n))
    })
}

fn check_children(cx: &DiscoveryContext<'_>, offset: usize) -> Result<()> {
    let reader = ObjectReader::from_context(cx)?;
    let class = library_class(&reader)?;
    let found = offsets_in(UFIELD_NEXT_WINDOW, 8).any(|n| is_function_list(&reader, class, offset, n));
    confirm(found, USTRUCT_CHILDREN, offset)
}

fn field_next(cx: &DiscoveryContext<'_>) -> Result<ArtifactValue> {
    let reader = ObjectReader::from_context(cx)?;
    let class = library_class(&reader)?;
    let children = cx.require_offset(USTRUCT_CHILDREN)?;
    first_offset(UFIELD_NEXT, UFIELD_NEXT_WINDOW, 8, |n| {
        is_function_list(&reader, class, children, n)
    })
}

fn check_field_next(cx: &DiscoveryContext<'_>, offset: usize) -> Result<()> {
    let reader = ObjectReader::from_context(cx)?;
    let class = library_class(&reader)?;
    let children = cx.require_offset(USTRUCT_CHILDREN)?;
    confirm(is_function_list(&reader, class, children, offset), UFIELD_NEXT, offset)
}

// UStruct::ChildProperties, FField::Next, FField::NamePrivate

/// Name offset under which `nodes` read exactly `X`, `Y`, `Z`
fn axis_name_offset(reader: &ObjectReader, nodes: &[usize]) -> Option<usize> {
    if nodes.len() != AXES.len() {
        return None;
    }
    offsets_in(FFIELD_WINDOW, 4)
        .find(|name| names_at(reader, nodes, *name).is_some_and(|names| names == AXES))
}

fn vector(cx: &DiscoveryContext<'_>) -> Result<(ObjectReader, usize)> {
    let reader = ObjectReader::from_context(cx)?;
    let vector = reader.find_path(VECTOR_PATH)?;
    Ok((reader, vector))
}

fn has_axis_list(reader: &ObjectReader, vector: usize, head: usize) -> bool {
    offsets_in(FFIELD_WINDOW, 8)
        .any(|next| axis_name_offset(reader, &chain(reader, vector, head, next)).is_some())
}

fn child_properties(cx: &DiscoveryContext<'_>) -> Result<ArtifactValue> {
    let (reader, vector) = vector(cx)?;
    first_offset(USTRUCT_CHILD_PROPERTIES, USTRUCT_WINDOW, 8, |head| {
        has_axis_list(&reader, vector, head)
    })
}

fn ffield_next(cx: &DiscoveryContext<'_>) -> Result<ArtifactValue> {
    let (reader, vector) = vector(cx)?;
    let head = cx.require_offset(USTRUCT_CHILD_PROPERTIES)?;
    first_offset(FFIELD_NEXT, FFIELD_WINDOW, 8, |next| {
        axis_name_offset(&reader, &chain(&reader, vector, head, next)).is_some()
    })
}

fn ffield_name(cx: &DiscoveryContext<'_>) -> Result<ArtifactValue> {
    let (reader, vector) = vector(cx)?;
    let nodes = chain(
        &reader,
        vector,
        cx.require_offset(USTRUCT_CHILD_PROPERTIES)?,
        cx.require_offset(FFIELD_NEXT)?,
    );
    axis_name_offset(&reader, &nodes)
        .map(ArtifactValue::Offset)
        .ok_or_else(|| ScanError::not_found("Vector member names"))
}

// FField::ClassPrivate, FFieldClass::Name

fn is_float_class(reader: &ObjectReader, class: usize, name: usize) -> bool {
    class != 0
        && reader
            .fname_at(class + name)
            .is_ok_and(|n| FLOAT_CLASSES.contains(&n.as_str()))
}

/// Classes of every member, read at `offset`, are float property classes
/// named at offset 0 or like a `UObject`
fn is_field_class(members: &Members, offset: usize) -> bool {
    let names = [0, members.reader.offsets().name];
    members.fields.iter().all(|field| {
        members.reader.view().read_ptr(field + offset).is_ok_and(|class| {
            names
                .iter()
                .any(|name| is_float_class(&members.reader, class, *name))
        })
    })
}

fn is_field_class_name(members: &Members, class_offset: usize, name: usize) -> bool {
    members.fields.iter().all(|field| {
        members
            .reader
            .view()
            .read_ptr(field + class_offset)
            .is_ok_and(|class| is_float_class(&members.reader, class, name))
    })
}

// FProperty::Offset_Internal, ElementSize, ArrayDim, PropertyFlags

/// Member offsets `0, s, 2s` for a float or double stride `s`
fn axis_stride(values: &[u32]) -> Option<u32> {
    match values {
        [0, s, t] if (*s == 4 || *s == 8) && *t == 2 * s => Some(*s),
        _ => None,
    }
}

fn stride(members: &Members, offset: usize) -> Option<u32> {
    members.read_u32s(offset).as_deref().and_then(axis_stride)
}

fn require_stride(cx: &DiscoveryContext<'_>, members: &Members) -> Result<u32> {
    stride(members, cx.require_offset(FPROPERTY_OFFSET)?)
        .ok_or_else(|| ScanError::invalid("Vector member offsets are not evenly spaced"))
}

/// Element size equals the stride and the array dimension before it is 1
fn is_element_size(members: &Members, size: u32, offset: usize) -> bool {
    offset >= 4 && members.all_u32(offset, size) && members.all_u32(offset - 4, 1)
}

const PROPERTY_FLAGS: u64 = CPF_EDIT | CPF_BLUEPRINT_VISIBLE;

/// 8-aligned slot after the element size first, then every 4-byte slot
fn flag_candidates(element_size: usize) -> impl Iterator<Item = usize> {
    let aligned = (element_size + 4).next_multiple_of(8);
    std::iter::once(aligned)
        .chain(offsets_in(element_size + 4..element_size + 0x10, 4).filter(move |o| *o != aligned))
}

fn has_property_flags(members: &Members, offset: usize) -> bool {
    members.fields.iter().all(|field| {
        members
            .reader
            .view()
            .read_u64(field + offset)
            .is_ok_and(|flags| flags != u64::MAX && flags & PROPERTY_FLAGS == PROPERTY_FLAGS)
    })
}

// UStruct::PropertiesSize

struct Sizes {
    reader: ObjectReader,
    vector: usize,
    vector2d: Option<usize>,
    stride: u32,
}

impl Sizes {
    fn new(cx: &DiscoveryContext<'_>) -> Result<Self> {
        let members = Members::vector(cx)?;
        let stride = require_stride(cx, &members)?;
        let vector2d = members.reader.find_path(VECTOR2D_PATH).ok();
        Ok(Self {
            vector: members.owner,
            reader: members.reader,
            vector2d,
            stride,
        })
    }

    fn matches(&self, offset: usize) -> bool {
        let reads = |object: usize, count: u32| {
            self.reader
                .view()
                .read_u32(object + offset)
                .is_ok_and(|v| v == count * self.stride)
        };
        reads(self.vector, 3) && self.vector2d.map_or(true, |v| reads(v, 2))
    }
}

pub fn register(registry: &mut OffsetRegistry) -> Result<()> {
    registry.register(
        ArtifactSpec::field(USTRUCT_SUPER)
            .depends_on(deps(&[]))
            .strategy(strategy("class-struct-field", super_struct))
            .validator(|cx, v| {
                let reader = ObjectReader::from_context(cx)?;
                let class = reader.find_class("Class")?;
                confirm(is_super(&reader, class, v.raw()), USTRUCT_SUPER, v.raw())
            }),
    )?;

    registry.register(
        ArtifactSpec::field(USTRUCT_CHILDREN)
            .depends_on(deps(&[]))
            .strategy(strategy("library-functions", children))
            .validator(|cx, v| check_children(cx, v.raw())),
    )?;

    registry.register(
        ArtifactSpec::field(UFIELD_NEXT)
            .depends_on(deps(&[USTRUCT_CHILDREN]))
            .strategy(strategy("library-functions", field_next))
            .validator(|cx, v| check_field_next(cx, v.raw())),
    )?;

    // Before FField, properties were UFields in Children
    registry.register(
        ArtifactSpec::field(USTRUCT_CHILD_PROPERTIES)
            .depends_on(deps(&[]))
            .alias_of(USTRUCT_CHILDREN)
            .strategy(strategy("vector-axes", child_properties))
            .validator(|cx, v| {
                let (reader, vector) = vector(cx)?;
                confirm(has_axis_list(&reader, vector, v.raw()), USTRUCT_CHILD_PROPERTIES, v.raw())
            }),
    )?;

    registry.register(
        ArtifactSpec::field(FFIELD_NEXT)
            .depends_on(deps(&[USTRUCT_CHILD_PROPERTIES]))
            .strategy(strategy("vector-axes", ffield_next))
            .validator(|cx, v| {
                let (reader, vector) = vector(cx)?;
                let head = cx.require_offset(USTRUCT_CHILD_PROPERTIES)?;
                let nodes = chain(&reader, vector, head, v.raw());
                confirm(axis_name_offset(&reader, &nodes).is_some(), FFIELD_NEXT, v.raw())
            }),
    )?;

    registry.register(
        ArtifactSpec::field(FFIELD_NAME)
            .depends_on(deps(&[USTRUCT_CHILD_PROPERTIES, FFIELD_NEXT]))
            .strategy(strategy("vector-axes", ffield_name))
            .validator(|cx, v| {
                let members = Members::of(cx, VECTOR_PATH)?;
                let names = names_at(&members.reader, &members.fields, v.raw());
                confirm(names.is_some_and(|n| n == AXES), FFIELD_NAME, v.raw())
            }),
    )?;

    registry.register(
        ArtifactSpec::field(FFIELD_CLASS)
            .depends_on(deps(&MEMBER_WALK))
            .strategy(strategy("float-property-class", |cx| {
                let members = Members::vector(cx)?;
                first_offset(FFIELD_CLASS, FFIELD_WINDOW, 8, |o| is_field_class(&members, o))
            }))
            .validator(|cx, v| {
                confirm(is_field_class(&Members::vector(cx)?, v.raw()), FFIELD_CLASS, v.raw())
            }),
    )?;

    registry.register(
        ArtifactSpec::field(FFIELD_CLASS_NAME)
            .depends_on(deps(&[USTRUCT_CHILD_PROPERTIES, FFIELD_NEXT, FFIELD_NAME, FFIELD_CLASS]))
            .strategy(strategy("float-property-class", |cx| {
                let members = Members::vector(cx)?;
                let class = cx.require_offset(FFIELD_CLASS)?;
                first_offset(FFIELD_CLASS_NAME, FFIELD_WINDOW, 4, |o| {
                    is_field_class_name(&members, class, o)
                })
            }))
            .validator(|cx, v| {
                let members = Members::vector(cx)?;
                let class = cx.require_offset(FFIELD_CLASS)?;
                confirm(is_field_class_name(&members, class, v.raw()), FFIELD_CLASS_NAME, v.raw())
            }),
    )?;

    registry.register(
        ArtifactSpec::field(FPROPERTY_OFFSET)
            .depends_on(deps(&MEMBER_WALK))
            .strategy(strategy("vector-member-offsets", |cx| {
                let members = Members::vector(cx)?;
                first_offset(FPROPERTY_OFFSET, FPROPERTY_WINDOW, 4, |o| stride(&members, o).is_some())
            }))
            .validator(|cx, v| {
                confirm(stride(&Members::vector(cx)?, v.raw()).is_some(), FPROPERTY_OFFSET, v.raw())
            }),
    )?;

    registry.register(
        ArtifactSpec::field(FPROPERTY_ELEMENT_SIZE)
            .depends_on(deps(&[USTRUCT_CHILD_PROPERTIES, FFIELD_NEXT, FFIELD_NAME, FPROPERTY_OFFSET]))
            .strategy(strategy("stride-sized", |cx| {
                let members = Members::vector(cx)?;
                let size = require_stride(cx, &members)?;
                first_offset(FPROPERTY_ELEMENT_SIZE, FPROPERTY_WINDOW, 4, |o| {
                    is_element_size(&members, size, o)
                })
            }))
            .validator(|cx, v| {
                let members = Members::vector(cx)?;
                let size = require_stride(cx, &members)?;
                confirm(is_element_size(&members, size, v.raw()), FPROPERTY_ELEMENT_SIZE, v.raw())
            }),
    )?;

    registry.register(
        ArtifactSpec::field(FPROPERTY_ARRAY_DIM)
            .depends_on(deps(&[
                USTRUCT_CHILD_PROPERTIES,
                FFIELD_NEXT,
                FFIELD_NAME,
                FPROPERTY_ELEMENT_SIZE,
            ]))
            .strategy(strategy("before-element-size", |cx| {
                cx.require_offset(FPROPERTY_ELEMENT_SIZE)?
                    .checked_sub(4)
                    .map(ArtifactValue::Offset)
                    .ok_or_else(|| ScanError::not_found("room for the array dimension"))
            }))
            .validator(|cx, v| {
                confirm(Members::vector(cx)?.all_u32(v.raw(), 1), FPROPERTY_ARRAY_DIM, v.raw())
            }),
    )?;

    registry.register(
        ArtifactSpec::field(FPROPERTY_FLAGS)
            .depends_on(deps(&[
                USTRUCT_CHILD_PROPERTIES,
                FFIELD_NEXT,
                FFIELD_NAME,
                FPROPERTY_ELEMENT_SIZE,
            ]))
            .strategy(strategy("editable-members", |cx| {
                let members = Members::vector(cx)?;
                flag_candidates(cx.require_offset(FPROPERTY_ELEMENT_SIZE)?)
                    .find(|o| has_property_flags(&members, *o))
                    .map(ArtifactValue::Offset)
                    .ok_or_else(|| ScanError::not_found("editable flags on Vector members"))
            }))
            .validator(|cx, v| {
                confirm(has_property_flags(&Members::vector(cx)?, v.raw()), FPROPERTY_FLAGS, v.raw())
            }),
    )?;

    registry.register(
        ArtifactSpec::field(USTRUCT_PROPERTIES_SIZE)
            .depends_on(deps(&[USTRUCT_CHILD_PROPERTIES, FFIELD_NEXT, FFIELD_NAME, FPROPERTY_OFFSET]))
            .strategy(strategy("vector-sizes", |cx| {
                let sizes = Sizes::new(cx)?;
                first_offset(USTRUCT_PROPERTIES_SIZE, USTRUCT_WINDOW, 4, |o| sizes.matches(o))
            }))
            .validator(|cx, v| {
                confirm(Sizes::new(cx)?.matches(v.raw()), USTRUCT_PROPERTIES_SIZE, v.raw())
            }),
    )?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::super::testing::{layout, World};
    use super::*;

    #[test]
    fn test_axis_stride() {
        assert_eq!(axis_stride(&[0, 4, 8]), Some(4));
        assert_eq!(axis_stride(&[0, 8, 16]), Some(8));
        assert_eq!(axis_stride(&[0, 4, 12]), None);
        assert_eq!(axis_stride(&[4, 8, 12]), None);
        assert_eq!(axis_stride(&[0, 0, 0]), None);
        assert_eq!(axis_stride(&[0, 4]), None);
    }

    #[test]
    fn test_flag_candidates_prefer_aligned_slot() {
        let candidates: Vec<_> = flag_candidates(0x34).collect();
        assert_eq!(candidates, vec![0x38, 0x3C, 0x40]);
        let candidates: Vec<_> = flag_candidates(0x3C).collect();
        assert_eq!(candidates, vec![0x40, 0x44, 0x48]);
    }

    #[test]
    fn test_discovers_struct_layout() {
        let world = World::build();
        let registry = world.registry();

        assert_eq!(registry.offset(USTRUCT_SUPER), Some(layout::STRUCT_SUPER));
        assert_eq!(registry.offset(USTRUCT_CHILDREN), Some(layout::STRUCT_CHILDREN));
        assert_eq!(registry.offset(UFIELD_NEXT), Some(layout::FIELD_NEXT));
        assert_eq!(registry.offset(USTRUCT_CHILD_PROPERTIES), Some(layout::STRUCT_CHILD_PROPERTIES));
        assert_eq!(registry.offset(USTRUCT_PROPERTIES_SIZE), Some(layout::STRUCT_SIZE));
    }

    #[test]
    fn test_discovers_property_layout() {
        let world = World::build();
        let registry = world.registry();

        assert_eq!(registry.offset(FFIELD_CLASS), Some(layout::FFIELD_CLASS));
        assert_eq!(registry.offset(FFIELD_NEXT), Some(layout::FFIELD_NEXT));
        assert_eq!(registry.offset(FFIELD_NAME), Some(layout::FFIELD_NAME));
        assert_eq!(registry.offset(FFIELD_CLASS_NAME), Some(0));
        assert_eq!(registry.offset(FPROPERTY_OFFSET), Some(layout::PROP_OFFSET));
        assert_eq!(registry.offset(FPROPERTY_ELEMENT_SIZE), Some(layout::PROP_ELEMENT_SIZE));
        assert_eq!(registry.offset(FPROPERTY_ARRAY_DIM), Some(layout::PROP_ARRAY_DIM));
        assert_eq!(registry.offset(FPROPERTY_FLAGS), Some(layout::PROP_FLAGS));
    }

    #[test]
    fn test_renamed_member_fails_member_walk() {
        let world = World::build();
        // Z's name now reads Y
        let y = world.read_u32(world.vector_fields[1] + layout::FFIELD_NAME);
        world.poke_u32(world.vector_fields[2] + layout::FFIELD_NAME, y);
        let registry = world.registry();

        assert_eq!(registry.offset(USTRUCT_CHILD_PROPERTIES), None);
        assert_eq!(registry.offset(FPROPERTY_OFFSET), None);
        // Unrelated records still resolve
        assert_eq!(registry.offset(USTRUCT_SUPER), Some(layout::STRUCT_SUPER));
    }
}
