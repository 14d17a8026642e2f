//! Engine constants
//!
//! Flag values, table geometry and search windows that hold across the
//! engine revisions this crate targets. Artifact names are the keys the
//! registry is queried with.

// Singletons and functions
pub const GUOBJECT_ARRAY: &str = "GUObjectArray";
pub const FNAME_POOL: &str = "FNamePool";
pub const GMALLOC: &str = "GMalloc";
pub const CONSOLE_MANAGER: &str = "ConsoleManager";
pub const GDYNAMIC_RHI: &str = "GDynamicRHI";
pub const STATIC_FIND_OBJECT: &str = "StaticFindObject";
pub const ALLOCATE_UOBJECT_INDEX: &str = "FUObjectArray::AllocateUObjectIndex";

// UObjectBase
pub const UOBJECT_OBJECT_FLAGS: &str = "UObject::ObjectFlags";
pub const UOBJECT_INTERNAL_INDEX: &str = "UObject::InternalIndex";
pub const UOBJECT_CLASS: &str = "UObject::ClassPrivate";
pub const UOBJECT_NAME: &str = "UObject::NamePrivate";
pub const UOBJECT_OUTER: &str = "UObject::OuterPrivate";

// UField / UStruct / UClass / UFunction
pub const UFIELD_NEXT: &str = "UField::Next";
pub const USTRUCT_SUPER: &str = "UStruct::SuperStruct";
pub const USTRUCT_CHILDREN: &str = "UStruct::Children";
pub const USTRUCT_CHILD_PROPERTIES: &str = "UStruct::ChildProperties";
pub const USTRUCT_PROPERTIES_SIZE: &str = "UStruct::PropertiesSize";
pub const UCLASS_DEFAULT_OBJECT: &str = "UClass::ClassDefaultObject";
pub const UFUNCTION_FLAGS: &str = "UFunction::FunctionFlags";
pub const UFUNCTION_FUNC: &str = "UFunction::Func";

// FField / FProperty
pub const FFIELD_CLASS: &str = "FField::ClassPrivate";
pub const FFIELD_NEXT: &str = "FField::Next";
pub const FFIELD_NAME: &str = "FField::NamePrivate";
pub const FFIELD_CLASS_NAME: &str = "FFieldClass::Name";
pub const FPROPERTY_ARRAY_DIM: &str = "FProperty::ArrayDim";
pub const FPROPERTY_ELEMENT_SIZE: &str = "FProperty::ElementSize";
pub const FPROPERTY_FLAGS: &str = "FProperty::PropertyFlags";
pub const FPROPERTY_OFFSET: &str = "FProperty::Offset_Internal";
pub const FBOOL_FIELD_SIZE: &str = "FBoolProperty::FieldSize";
pub const FBOOL_BYTE_OFFSET: &str = "FBoolProperty::ByteOffset";
pub const FBOOL_BYTE_MASK: &str = "FBoolProperty::ByteMask";
pub const FBOOL_FIELD_MASK: &str = "FBoolProperty::FieldMask";

/// Items per FChunkedFixedUObjectArray chunk
pub const OBJECTS_PER_CHUNK: usize = 64 * 1024;

/// FUObjectItem sizes, most common first
pub const OBJECT_ITEM_SIZES: [usize; 2] = [24, 16];

/// FUObjectArray prefix before the object table (GC bookkeeping ints)
pub const OBJECT_TABLE_OFFSETS: [usize; 2] = [0, 0x10];

/// Name entries are 2-byte aligned; blocks hold 64Ki strides
pub const NAME_STRIDE: usize = 2;
pub const NAME_BLOCK_SIZE: usize = NAME_STRIDE * 64 * 1024;
pub const MAX_NAME_BLOCKS: usize = 8192;
pub const MAX_NAME_LEN: usize = 1024;

/// FNamePool header: lock, current block, cursor, then block pointers
pub const NAME_POOL_BLOCKS_OFFSET: usize = 0x10;

pub const RF_PUBLIC: u32 = 0x0000_0001;

pub const CPF_EDIT: u64 = 0x0000_0001;
pub const CPF_BLUEPRINT_VISIBLE: u64 = 0x0000_0004;

pub const FUNC_NATIVE: u32 = 0x0000_0400;
pub const FUNC_STATIC: u32 = 0x0000_2000;

/// Longest intrusive list followed before giving up
pub const MAX_LIST_LEN: usize = 4096;

/// Longest ClassPrivate chain between an object and the metaclass
pub const MAX_CLASS_CHAIN: usize = 8;

/// Search windows for field offsets, relative to the record start
pub const UOBJECT_WINDOW: std::ops::Range<usize> = 0x04..0x40;
pub const UFIELD_NEXT_WINDOW: std::ops::Range<usize> = 0x28..0x48;
pub const USTRUCT_WINDOW: std::ops::Range<usize> = 0x28..0x100;
pub const UCLASS_WINDOW: std::ops::Range<usize> = 0x40..0x300;
pub const UFUNCTION_WINDOW: std::ops::Range<usize> = 0x40..0x200;
pub const FFIELD_WINDOW: std::ops::Range<usize> = 0x00..0x40;
pub const FPROPERTY_WINDOW: std::ops::Range<usize> = 0x28..0x80;
pub const FBOOL_WINDOW: std::ops::Range<usize> = 0x30..0x100;

/// Classes whose functions are all native statics
pub const NATIVE_LIBRARIES: [&str; 4] = [
    "KismetSystemLibrary",
    "KismetMathLibrary",
    "GameplayStatics",
    "KismetStringLibrary",
];

pub const CORE_PACKAGE: &str = "/Script/CoreUObject";
pub const ENGINE_PACKAGE: &str = "/Script/Engine";

/// Reference types whose members are known
pub const VECTOR_PATH: &str = "/Script/CoreUObject.Vector";
pub const VECTOR2D_PATH: &str = "/Script/CoreUObject.Vector2D";
pub const POST_PROCESS_PATH: &str = "/Script/Engine.PostProcessSettings";
