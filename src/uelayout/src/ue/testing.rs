//! Synthetic engine process for discovery tests
//!
//! A module image with a name pool and an object array in its data section,
//! and a heap holding a small but complete reflection graph: the core
//! metaclasses, a native library class with two functions, `Vector`,
//! `Vector2D` and a `PostProcessSettings` with packed override bools.

use super::constants::*;
use super::names::testing::{header, BlockBuilder};
use super::names::NamePool;
use super::objects::testing::{chunked_header, items};
use super::objects::ObjectArray;
use super::reader::{ObjectOffsets, ObjectReader};
use crate::config::DiscoveryConfig;
use crate::memory::{MemoryView, MockMemorySource, ModuleImage};
use crate::registry::OffsetRegistry;

use byteorder::{ByteOrder, LE};
use std::collections::HashMap;
use std::sync::Arc;

pub const IMAGE: usize = 0x1_4000_0000;
pub const IMAGE_SIZE: usize = 0x3000;
pub const DATA: usize = IMAGE + 0x1000;
pub const HEAP: usize = 0x2000_0000;
const HEAP_SIZE: usize = 0xB000;

pub const NAME_POOL: usize = DATA + 0x100;
pub const OBJECT_ARRAY: usize = DATA + 0x200;
pub const VTABLE: usize = DATA + 0x800;
pub const NATIVE_CODE: [usize; 2] = [IMAGE + 0x200, IMAGE + 0x240];

const CHUNK_TABLE: usize = HEAP + 0x1000;
const ITEMS: usize = HEAP + 0x1100;
const OBJECTS: usize = HEAP + 0x4000;
const OBJECT_SLOT: usize = 0x200;
const FIELDS: usize = HEAP + 0x8000;
const FIELD_SLOT: usize = 0x100;
const FIELD_CLASSES: usize = HEAP + 0xA000;

/// Offsets the synthetic engine is laid out with
pub mod layout {
    pub const OBJ_FLAGS: usize = 0x08;
    pub const OBJ_INDEX: usize = 0x0C;
    pub const OBJ_CLASS: usize = 0x10;
    pub const OBJ_NAME: usize = 0x18;
    pub const OBJ_OUTER: usize = 0x20;
    pub const FIELD_NEXT: usize = 0x28;
    pub const STRUCT_SUPER: usize = 0x40;
    pub const STRUCT_CHILDREN: usize = 0x48;
    pub const STRUCT_CHILD_PROPERTIES: usize = 0x50;
    pub const STRUCT_SIZE: usize = 0x58;
    pub const FUNCTION_FLAGS: usize = 0xB0;
    pub const FUNCTION_FUNC: usize = 0xD8;
    pub const CLASS_DEFAULT_OBJECT: usize = 0x110;

    pub const FFIELD_CLASS: usize = 0x08;
    pub const FFIELD_OWNER: usize = 0x10;
    pub const FFIELD_NEXT: usize = 0x18;
    pub const FFIELD_NAME: usize = 0x20;
    pub const PROP_ARRAY_DIM: usize = 0x30;
    pub const PROP_ELEMENT_SIZE: usize = 0x34;
    pub const PROP_FLAGS: usize = 0x38;
    pub const PROP_OFFSET: usize = 0x44;
    pub const BOOL_FIELD_SIZE: usize = 0x78;
}

/// Every discoverable artifact of the synthetic engine and its value
pub fn expected() -> Vec<(&'static str, usize)> {
    vec![
        (GUOBJECT_ARRAY, OBJECT_ARRAY),
        (FNAME_POOL, NAME_POOL),
        (UOBJECT_OBJECT_FLAGS, layout::OBJ_FLAGS),
        (UOBJECT_INTERNAL_INDEX, layout::OBJ_INDEX),
        (UOBJECT_CLASS, layout::OBJ_CLASS),
        (UOBJECT_NAME, layout::OBJ_NAME),
        (UOBJECT_OUTER, layout::OBJ_OUTER),
        (UFIELD_NEXT, layout::FIELD_NEXT),
        (USTRUCT_SUPER, layout::STRUCT_SUPER),
        (USTRUCT_CHILDREN, layout::STRUCT_CHILDREN),
        (USTRUCT_CHILD_PROPERTIES, layout::STRUCT_CHILD_PROPERTIES),
        (USTRUCT_PROPERTIES_SIZE, layout::STRUCT_SIZE),
        (UCLASS_DEFAULT_OBJECT, layout::CLASS_DEFAULT_OBJECT),
        (UFUNCTION_FLAGS, layout::FUNCTION_FLAGS),
        (UFUNCTION_FUNC, layout::FUNCTION_FUNC),
        (FFIELD_CLASS, layout::FFIELD_CLASS),
        (FFIELD_NEXT, layout::FFIELD_NEXT),
        (FFIELD_NAME, layout::FFIELD_NAME),
        (FFIELD_CLASS_NAME, 0),
        (FPROPERTY_ARRAY_DIM, layout::PROP_ARRAY_DIM),
        (FPROPERTY_ELEMENT_SIZE, layout::PROP_ELEMENT_SIZE),
        (FPROPERTY_FLAGS, layout::PROP_FLAGS),
        (FPROPERTY_OFFSET, layout::PROP_OFFSET),
        (FBOOL_FIELD_SIZE, layout::BOOL_FIELD_SIZE),
        (FBOOL_BYTE_OFFSET, layout::BOOL_FIELD_SIZE + 1),
        (FBOOL_BYTE_MASK, layout::BOOL_FIELD_SIZE + 2),
        (FBOOL_FIELD_MASK, layout::BOOL_FIELD_SIZE + 3),
    ]
}

/// Flat byte buffer mapped at `base`
struct Space {
    base: usize,
    data: Vec<u8>,
}

impl Space {
    fn new(base: usize, size: usize, fill: u8) -> Self {
        Self {
            base,
            data: vec![fill; size],
        }
    }

    fn put(&mut self, at: usize, bytes: &[u8]) {
        let offset = at - self.base;
        self.data[offset..offset + bytes.len()].copy_from_slice(bytes);
    }

    fn u8(&mut self, at: usize, value: u8) {
        self.put(at, &[value]);
    }

    fn u32(&mut self, at: usize, value: u32) {
        self.put(at, &value.to_le_bytes());
    }

    fn ptr(&mut self, at: usize, value: usize) {
        self.put(at, &(value as u64).to_le_bytes());
    }
}

/// Name block with each text stored once
#[derive(Default)]
struct Names {
    block: BlockBuilder,
    interned: HashMap<String, u32>,
}

impl Names {
    fn intern(&mut self, text: &str) -> u32 {
        if let Some(index) = self.interned.get(text) {
            return *index;
        }
        let index = self.block.add(text);
        self.interned.insert(text.to_string(), index);
        index
    }
}

fn object_at(slot: usize) -> usize {
    OBJECTS + slot * OBJECT_SLOT
}

fn field_at(slot: usize) -> usize {
    FIELDS + slot * FIELD_SLOT
}

pub struct World {
    pub image: Arc<ModuleImage>,
    pub core_package: usize,
    pub engine_package: usize,
    pub class_class: usize,
    pub object_class: usize,
    pub struct_class: usize,
    pub function_class: usize,
    pub library: usize,
    pub functions: [usize; 2],
    pub library_default: usize,
    pub vector: usize,
    pub vector2d: usize,
    pub post_process: usize,
    pub vector_fields: [usize; 3],
    pub override_bools: [usize; 2],
    pub objects: usize,
}

struct Builder {
    heap: Space,
    names: Names,
    objects: Vec<usize>,
}

impl Builder {
    fn object(&mut self, slot: usize, name: &str, class: usize, outer: usize) -> usize {
        let address = object_at(slot);
        let name = self.names.intern(name);
        self.heap.ptr(address, VTABLE);
        self.heap.u32(address + layout::OBJ_FLAGS, RF_PUBLIC);
        self.heap.u32(address + layout::OBJ_INDEX, slot as u32);
        self.heap.ptr(address + layout::OBJ_CLASS, class);
        self.heap.u32(address + layout::OBJ_NAME, name);
        self.heap.ptr(address + layout::OBJ_OUTER, outer);
        if self.objects.len() <= slot {
            self.objects.resize(slot + 1, 0);
        }
        self.objects[slot] = address;
        address
    }

    #[allow(clippy::too_many_arguments)]
    fn property(
        &mut self,
        slot: usize,
        name: &str,
        class: usize,
        owner: usize,
        next: usize,
        element_size: u32,
        offset: u32,
    ) -> usize {
        let address = field_at(slot);
        let name = self.names.intern(name);
        self.heap.ptr(address, VTABLE);
        self.heap.ptr(address + layout::FFIELD_CLASS, class);
        self.heap.ptr(address + layout::FFIELD_OWNER, owner);
        self.heap.ptr(address + layout::FFIELD_NEXT, next);
        self.heap.u32(address + layout::FFIELD_NAME, name);
        self.heap.u32(address + layout::PROP_ARRAY_DIM, 1);
        self.heap.u32(address + layout::PROP_ELEMENT_SIZE, element_size);
        self.heap.ptr(
            address + layout::PROP_FLAGS,
            (CPF_EDIT | CPF_BLUEPRINT_VISIBLE) as usize,
        );
        self.heap.u32(address + layout::PROP_OFFSET, offset);
        address
    }

    fn field_class(&mut self, slot: usize, name: &str) -> usize {
        let address = FIELD_CLASSES + slot * 0x40;
        let name = self.names.intern(name);
        self.heap.u32(address, name);
        address
    }
}

impl World {
    pub fn build() -> Self {
        let mut b = Builder {
            heap: Space::new(HEAP, HEAP_SIZE, 0),
            names: Names {
                block: BlockBuilder::with_defaults(),
                interned: HashMap::new(),
            },
            objects: Vec::new(),
        };

        let core_package = object_at(0);
        let class_class = object_at(1);
        let package_class = object_at(2);
        let engine_package = object_at(8);

        b.object(0, CORE_PACKAGE, package_class, 0);
        b.object(1, "Class", class_class, core_package);
        b.object(2, "Package", class_class, core_package);
        let object_class = b.object(3, "Object", class_class, core_package);
        let field_class = b.object(4, "Field", class_class, core_package);
        let struct_class = b.object(5, "Struct", class_class, core_package);
        let script_struct = b.object(6, "ScriptStruct", class_class, core_package);
        let function_class = b.object(7, "Function", class_class, core_package);
        b.object(8, ENGINE_PACKAGE, package_class, 0);
        for (class, parent) in [
            (class_class, struct_class),
            (field_class, object_class),
            (struct_class, field_class),
            (script_struct, struct_class),
            (function_class, struct_class),
        ] {
            b.heap.ptr(class + layout::STRUCT_SUPER, parent);
        }

        // Native library with two static functions
        let library = b.object(10, "KismetSystemLibrary", class_class, engine_package);
        let print = b.object(11, "PrintString", function_class, library);
        let delay = b.object(12, "Delay", function_class, library);
        b.heap.ptr(library + layout::STRUCT_SUPER, object_class);
        b.heap.ptr(library + layout::STRUCT_CHILDREN, print);
        b.heap.ptr(print + layout::FIELD_NEXT, delay);
        for (function, code) in [(print, NATIVE_CODE[0]), (delay, NATIVE_CODE[1])] {
            b.heap.u32(function + layout::FUNCTION_FLAGS, 0x0002_0000 | FUNC_STATIC | FUNC_NATIVE);
            b.heap.ptr(function + layout::FUNCTION_FUNC, code);
        }

        // Script structs
        let vector = b.object(13, "Vector", script_struct, core_package);
        let vector2d = b.object(14, "Vector2D", script_struct, core_package);
        let post_process = b.object(15, "PostProcessSettings", script_struct, engine_package);

        let float_property = b.field_class(0, "FloatProperty");
        let bool_property = b.field_class(1, "BoolProperty");

        let vector_fields = [field_at(0), field_at(1), field_at(2)];
        for (i, axis) in ["X", "Y", "Z"].into_iter().enumerate() {
            let next = vector_fields.get(i + 1).copied().unwrap_or(0);
            b.property(i, axis, float_property, vector, next, 4, 4 * i as u32);
        }
        b.heap.ptr(vector + layout::STRUCT_CHILD_PROPERTIES, vector_fields[0]);
        b.heap.u32(vector + layout::STRUCT_SIZE, 12);

        let x2 = b.property(3, "X", float_property, vector2d, field_at(4), 4, 0);
        b.property(4, "Y", float_property, vector2d, 0, 4, 4);
        b.heap.ptr(vector2d + layout::STRUCT_CHILD_PROPERTIES, x2);
        b.heap.u32(vector2d + layout::STRUCT_SIZE, 8);

        let bloom = b.property(5, "BloomIntensity", float_property, post_process, field_at(6), 4, 0);
        let override_bools = [field_at(6), field_at(7)];
        b.property(6, "bOverride_BloomIntensity", bool_property, post_process, field_at(7), 1, 4);
        b.property(7, "bOverride_BloomThreshold", bool_property, post_process, 0, 1, 4);
        for (field, mask) in override_bools.iter().zip([0x01u8, 0x02]) {
            b.heap.put(field + layout::BOOL_FIELD_SIZE, &[1, 0, mask, mask]);
        }
        b.heap.ptr(post_process + layout::STRUCT_CHILD_PROPERTIES, bloom);
        b.heap.u32(post_process + layout::STRUCT_SIZE, 8);

        // Default objects
        let library_default = b.object(16, "Default__KismetSystemLibrary", library, engine_package);
        let object_default = b.object(17, "Default__Object", object_class, core_package);
        b.heap.ptr(library + layout::CLASS_DEFAULT_OBJECT, library_default);
        b.heap.ptr(object_class + layout::CLASS_DEFAULT_OBJECT, object_default);

        // Object array and name pool
        let count = b.objects.len();
        b.heap.ptr(CHUNK_TABLE, ITEMS);
        b.heap.put(ITEMS, &items(&b.objects, OBJECT_ITEM_SIZES[0]));
        let names = b.names.block.data.clone();
        b.heap.put(HEAP, &names);

        let mut data = Space::new(DATA, IMAGE_SIZE - 0x1000, 0);
        data.put(NAME_POOL, &header(HEAP, names.len()));
        data.put(OBJECT_ARRAY, &chunked_header(CHUNK_TABLE, count));
        data.ptr(VTABLE, IMAGE + 0x100);

        let mut code = Space::new(IMAGE, 0x1000, 0xCC);
        code.u8(IMAGE + 0x100, 0xC3);
        for entry in NATIVE_CODE {
            // xor eax, eax; ret
            code.put(entry, &[0x31, 0xC0, 0xC3]);
        }

        let view = MemoryView::from_source(
            MockMemorySource::default()
                .with_segment(IMAGE, code.data, "r-xp")
                .with_segment(DATA, data.data, "rw-p")
                .with_segment(HEAP, b.heap.data, "rw-p"),
        );
        let image = Arc::new(ModuleImage::new(view, IMAGE, IMAGE_SIZE));

        Self {
            image,
            core_package,
            engine_package,
            class_class,
            object_class,
            struct_class,
            function_class,
            library,
            functions: [print, delay],
            library_default,
            vector,
            vector2d,
            post_process,
            vector_fields,
            override_bools,
            objects: count,
        }
    }

    pub fn view(&self) -> &MemoryView {
        self.image.view()
    }

    /// Fresh registry with every built-in artifact
    pub fn registry(&self) -> OffsetRegistry {
        let mut registry = OffsetRegistry::new(self.image.clone(), DiscoveryConfig::default());
        super::register_defaults(&mut registry).unwrap();
        registry
    }

    /// Reader built from the known layout, without discovery
    pub fn reader(&self) -> ObjectReader {
        let config = DiscoveryConfig::default();
        let view = self.view().clone();
        let names = NamePool::open(&view, &config, NAME_POOL).unwrap();
        let objects = ObjectArray::open(&view, &config, OBJECT_ARRAY).unwrap();
        ObjectReader::new(
            view,
            names,
            objects,
            ObjectOffsets {
                class: layout::OBJ_CLASS,
                name: layout::OBJ_NAME,
                outer: layout::OBJ_OUTER,
            },
        )
    }

    pub fn read_u32(&self, address: usize) -> u32 {
        self.view().read_u32(address).unwrap()
    }

    pub fn poke_u8(&self, address: usize, value: u8) {
        self.view().write_bytes(address, &[value]).unwrap();
    }

    pub fn poke_u32(&self, address: usize, value: u32) {
        self.view().write_bytes(address, &value.to_le_bytes()).unwrap();
    }

    pub fn poke_ptr(&self, address: usize, value: usize) {
        let mut bytes = [0u8; 8];
        LE::write_u64(&mut bytes, value as u64);
        self.view().write_bytes(address, &bytes).unwrap();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_world_resolves_every_artifact() {
        let world = World::build();
        let registry = world.registry();
        for (artifact, value) in expected() {
            assert_eq!(
                registry.resolve(artifact).map(|v| v.raw()),
                Some(value),
                "{}",
                artifact
            );
        }
    }

    #[test]
    fn test_world_fixture_is_self_consistent() {
        let world = World::build();
        let reader = world.reader();
        assert_eq!(reader.objects().len(), 18);
        assert_eq!(reader.objects().iter().count(), 17);
        assert_eq!(reader.name_of(world.library_default).unwrap(), "Default__KismetSystemLibrary");
        assert_eq!(reader.class_of(world.functions[0]).unwrap(), world.function_class);
    }
}
