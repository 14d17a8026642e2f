//! Object reader
//!
//! Names, classes and outers of live objects, through the object array,
//! the name pool and the resolved `UObjectBase` offsets.

use super::constants::*;
use super::names::NamePool;
use super::objects::ObjectArray;
use crate::error::{Result, ScanError};
use crate::memory::MemoryView;
use crate::registry::{DiscoveryContext, OffsetRegistry};

/// `UObjectBase` linkage offsets
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ObjectOffsets {
    pub class: usize,
    pub name: usize,
    pub outer: usize,
}

/// Artifacts an [`ObjectReader`] is built from
pub const READER_ARTIFACTS: [&str; 5] = [
    GUOBJECT_ARRAY,
    FNAME_POOL,
    UOBJECT_CLASS,
    UOBJECT_NAME,
    UOBJECT_OUTER,
];

#[derive(Debug)]
pub struct ObjectReader {
    view: MemoryView,
    names: NamePool,
    objects: ObjectArray,
    offsets: ObjectOffsets,
}

impl ObjectReader {
    pub fn new(view: MemoryView, names: NamePool, objects: ObjectArray, offsets: ObjectOffsets) -> Self {
        Self {
            view,
            names,
            objects,
            offsets,
        }
    }

    /// Reader over a registry, resolving what it needs
    pub fn from_registry(registry: &OffsetRegistry) -> Result<Self> {
        let [array, pool, class, name, outer] =
            READER_ARTIFACTS.map(|artifact| registry.try_resolve(artifact).map(|v| v.raw()));
        Self::build(registry, array?, pool?, class?, name?, outer?)
    }

    /// Reader inside a discovery strategy; all of [`READER_ARTIFACTS`]
    /// must be declared dependencies
    pub fn from_context(cx: &DiscoveryContext<'_>) -> Result<Self> {
        let [array, pool, class, name, outer] =
            READER_ARTIFACTS.map(|artifact| cx.require(artifact).map(|v| v.raw()));
        Self::build(cx.registry(), array?, pool?, class?, name?, outer?)
    }

    fn build(
        registry: &OffsetRegistry,
        array: usize,
        pool: usize,
        class: usize,
        name: usize,
        outer: usize,
    ) -> Result<Self> {
        let view = registry.image().view().clone();
        let names = NamePool::open(&view, registry.config(), pool)?;
        let objects = ObjectArray::open(&view, registry.config(), array)?;
        Ok(Self::new(view, names, objects, ObjectOffsets { class, name, outer }))
    }

    pub fn view(&self) -> &MemoryView {
        &self.view
    }

    pub fn names(&self) -> &NamePool {
        &self.names
    }

    pub fn objects(&self) -> &ObjectArray {
        &self.objects
    }

    pub fn offsets(&self) -> ObjectOffsets {
        self.offsets
    }

    pub fn name_index(&self, object: usize) -> Result<u32> {
        self.view.read_u32(object + self.offsets.name)
    }

    /// Display name of an `FName` stored at `address`
    pub fn fname_at(&self, address: usize) -> Result<String> {
        let index = self.view.read_u32(address)?;
        let number = self.view.read_u32(address + 4)?;
        self.names.display(index, number)
    }

    pub fn name_of(&self, object: usize) -> Result<String> {
        self.fname_at(object + self.offsets.name)
    }

    pub fn class_of(&self, object: usize) -> Result<usize> {
        self.view.read_ptr(object + self.offsets.class)
    }

    pub fn outer_of(&self, object: usize) -> Result<usize> {
        self.view.read_ptr(object + self.offsets.outer)
    }

    pub fn class_name(&self, object: usize) -> Result<String> {
        self.name_of(self.class_of(object)?)
    }

    /// `/Script/Package.Outer.Name`
    pub fn path_name(&self, object: usize) -> Result<String> {
        let mut parts = vec![self.name_of(object)?];
        let mut outer = self.outer_of(object)?;
        while outer != 0 && parts.len() < MAX_CLASS_CHAIN * 4 {
            parts.push(self.name_of(outer)?);
            outer = self.outer_of(outer)?;
        }
        parts.reverse();
        Ok(parts.join("."))
    }

    /// Every live object named `name`, optionally of class `class_name`
    pub fn find_all(&self, name: &str, class_name: Option<&str>) -> Vec<usize> {
        let Some(index) = self.names.search(name) else {
            return Vec::new();
        };
        self.objects
            .iter()
            .filter(|(_, object)| self.name_index(*object).is_ok_and(|i| i == index))
            .filter(|(_, object)| {
                class_name.map_or(true, |wanted| {
                    self.class_name(*object).is_ok_and(|c| c == wanted)
                })
            })
            .map(|(_, object)| object)
            .collect()
    }

    pub fn find(&self, name: &str, class_name: Option<&str>) -> Result<usize> {
        self.find_all(name, class_name)
            .into_iter()
            .next()
            .ok_or_else(|| ScanError::not_found(format!("object {}", name)))
    }

    /// The class object named `name`
    pub fn find_class(&self, name: &str) -> Result<usize> {
        self.find(name, Some("Class"))
    }

    /// Object by `Package.Name` path, e.g. `/Script/CoreUObject.Vector`
    pub fn find_path(&self, path: &str) -> Result<usize> {
        let (outer_path, name) = path
            .rsplit_once('.')
            .ok_or_else(|| ScanError::not_found(format!("object path {}", path)))?;
        self.find_all(name, None)
            .into_iter()
            .find(|object| {
                self.outer_of(*object)
                    .and_then(|outer| self.path_name(outer))
                    .is_ok_and(|p| p == outer_path)
            })
            .ok_or_else(|| ScanError::not_found(format!("object {}", path)))
    }
}
