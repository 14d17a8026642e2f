//! `UObjectBase` layout
//!
//! Offsets every other layout routine builds on. They are found from the
//! object array alone: an object's slot index is stored in the object, and
//! following `ClassPrivate` from any object ends at the self-referential
//! metaclass `Class`.

use super::constants::*;
use super::names::NamePool;
use super::objects::ObjectArray;
use super::search::{confirm, first_offset, walk_list};
use crate::error::{Result, ScanError};
use crate::memory::MemoryView;
use crate::registry::{strategy, ArtifactSpec, ArtifactValue, DiscoveryContext, OffsetRegistry};

const MIN_SAMPLES: usize = 2;

/// Sampled `(index, object)` pairs and what has been resolved so far
struct Probe<'c> {
    view: &'c MemoryView,
    samples: Vec<(usize, usize)>,
}

impl<'c> Probe<'c> {
    fn new(cx: &'c DiscoveryContext<'_>) -> Result<Self> {
        let array = ObjectArray::open(cx.view(), cx.config(), cx.require_address(GUOBJECT_ARRAY)?)?;
        let samples = array.sample(cx.config().object_sample);
        if samples.len() < MIN_SAMPLES {
            return Err(ScanError::not_found("enough live objects to sample"));
        }
        Ok(Self {
            view: cx.view(),
            samples,
        })
    }

    fn is_internal_index(&self, offset: usize) -> bool {
        self.samples
            .iter()
            .all(|&(index, object)| self.view.read_i32(object + offset).is_ok_and(|v| v as usize == index))
    }

    /// End of the `ClassPrivate` chain from `object`, if it closes on a
    /// self-referential class
    fn chain_end(&self, object: usize, class: usize) -> Option<usize> {
        let chain = walk_list(object, MAX_CLASS_CHAIN + 1, |node| self.view.read_ptr(node + class).ok());
        let last = *chain.last()?;
        (self.view.read_ptr(last + class).ok()? == last).then_some(last)
    }

    /// The single metaclass every sample converges on
    fn metaclass(&self, class: usize) -> Option<usize> {
        let mut found = None;
        for &(_, object) in &self.samples {
            let end = self.chain_end(object, class)?;
            match found {
                None => found = Some(end),
                Some(m) if m != end => return None,
                Some(_) => {}
            }
        }
        found
    }

    fn require_metaclass(&self, cx: &DiscoveryContext<'_>) -> Result<usize> {
        let class = cx.require_offset(UOBJECT_CLASS)?;
        self.metaclass(class)
            .ok_or_else(|| ScanError::invalid("samples do not share a metaclass"))
    }

    fn names_class(&self, names: &NamePool, metaclass: usize, offset: usize) -> bool {
        let named_class = self.view.read_u32(metaclass + offset).is_ok_and(|index| {
            names.name(index).is_ok_and(|name| name == "Class")
        }) && self.view.read_u32(metaclass + offset + 4).is_ok_and(|n| n == 0);
        named_class
            && self.samples.iter().all(|&(_, object)| {
                self.view
                    .read_u32(object + offset)
                    .is_ok_and(|index| names.name(index).is_ok())
            })
    }

    fn is_outer(&self, names: &NamePool, metaclass: usize, name: usize, offset: usize) -> bool {
        let Ok(package) = self.view.read_ptr(metaclass + offset) else {
            return false;
        };
        if package == 0 || package == metaclass {
            return false;
        }
        let named = self
            .view
            .read_u32(package + name)
            .is_ok_and(|index| names.name(index).is_ok_and(|n| n == CORE_PACKAGE));
        named && self.view.read_ptr(package + offset).is_ok_and(|outer| outer == 0)
    }
}

fn name_pool(cx: &DiscoveryContext<'_>) -> Result<NamePool> {
    NamePool::open(cx.view(), cx.config(), cx.require_address(FNAME_POOL)?)
}

fn internal_index(cx: &DiscoveryContext<'_>) -> Result<ArtifactValue> {
    let probe = Probe::new(cx)?;
    first_offset(UOBJECT_INTERNAL_INDEX, UOBJECT_WINDOW, 4, |o| probe.is_internal_index(o))
}

fn class_private(cx: &DiscoveryContext<'_>) -> Result<ArtifactValue> {
    let probe = Probe::new(cx)?;
    first_offset(UOBJECT_CLASS, UOBJECT_WINDOW, 8, |o| probe.metaclass(o).is_some())
}

/// Flags sit right before the index
fn object_flags(cx: &DiscoveryContext<'_>) -> Result<ArtifactValue> {
    let index = cx.require_offset(UOBJECT_INTERNAL_INDEX)?;
    index
        .checked_sub(4)
        .map(ArtifactValue::Offset)
        .ok_or_else(|| ScanError::not_found("room for flags before the index"))
}

fn check_object_flags(cx: &DiscoveryContext<'_>, offset: usize) -> Result<()> {
    let probe = Probe::new(cx)?;
    let metaclass = probe.require_metaclass(cx)?;
    let flags = cx.view().read_u32(metaclass + offset)?;
    confirm(
        offset + 4 == cx.require_offset(UOBJECT_INTERNAL_INDEX)? && flags & RF_PUBLIC != 0,
        UOBJECT_OBJECT_FLAGS,
        offset,
    )
}

fn name_private(cx: &DiscoveryContext<'_>) -> Result<ArtifactValue> {
    let probe = Probe::new(cx)?;
    let metaclass = probe.require_metaclass(cx)?;
    let names = name_pool(cx)?;
    first_offset(UOBJECT_NAME, UOBJECT_WINDOW, 4, |o| probe.names_class(&names, metaclass, o))
}

fn outer_private(cx: &DiscoveryContext<'_>) -> Result<ArtifactValue> {
    let probe = Probe::new(cx)?;
    let metaclass = probe.require_metaclass(cx)?;
    let names = name_pool(cx)?;
    let name = cx.require_offset(UOBJECT_NAME)?;
    first_offset(UOBJECT_OUTER, UOBJECT_WINDOW, 8, |o| {
        probe.is_outer(&names, metaclass, name, o)
    })
}

pub fn register(registry: &mut OffsetRegistry) -> Result<()> {
    registry.register(
        ArtifactSpec::field(UOBJECT_INTERNAL_INDEX)
            .depends_on([GUOBJECT_ARRAY])
            .strategy(strategy("index-matches-slot", internal_index))
            .validator(|cx, v| {
                confirm(Probe::new(cx)?.is_internal_index(v.raw()), UOBJECT_INTERNAL_INDEX, v.raw())
            }),
    )?;

    registry.register(
        ArtifactSpec::field(UOBJECT_CLASS)
            .depends_on([GUOBJECT_ARRAY])
            .strategy(strategy("converges-on-metaclass", class_private))
            .validator(|cx, v| {
                confirm(Probe::new(cx)?.metaclass(v.raw()).is_some(), UOBJECT_CLASS, v.raw())
            }),
    )?;

    registry.register(
        ArtifactSpec::field(UOBJECT_OBJECT_FLAGS)
            .depends_on([GUOBJECT_ARRAY, UOBJECT_INTERNAL_INDEX, UOBJECT_CLASS])
            .strategy(strategy("before-index", object_flags))
            .validator(|cx, v| check_object_flags(cx, v.raw())),
    )?;

    registry.register(
        ArtifactSpec::field(UOBJECT_NAME)
            .depends_on([GUOBJECT_ARRAY, FNAME_POOL, UOBJECT_CLASS])
            .strategy(strategy("metaclass-named-class", name_private))
            .validator(|cx, v| {
                let probe = Probe::new(cx)?;
                let metaclass = probe.require_metaclass(cx)?;
                let names = name_pool(cx)?;
                confirm(probe.names_class(&names, metaclass, v.raw()), UOBJECT_NAME, v.raw())
            }),
    )?;

    registry.register(
        ArtifactSpec::field(UOBJECT_OUTER)
            .depends_on([GUOBJECT_ARRAY, FNAME_POOL, UOBJECT_CLASS, UOBJECT_NAME])
            .strategy(strategy("metaclass-in-core-package", outer_private))
            .validator(|cx, v| {
                let probe = Probe::new(cx)?;
                let metaclass = probe.require_metaclass(cx)?;
                let names = name_pool(cx)?;
                let name = cx.require_offset(UOBJECT_NAME)?;
                confirm(probe.is_outer(&names, metaclass, name, v.raw()), UOBJECT_OUTER, v.raw())
            }),
    )?;

    Ok(())
}
