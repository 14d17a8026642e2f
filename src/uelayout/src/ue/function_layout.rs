//! `UFunction` and `UClass` layout
//!
//! Native library classes expose only static native functions, so their
//! flags and native entry points are fixed points to search for.

use super::constants::*;
use super::reader::ObjectReader;
use super::search::{confirm, first_offset};
use super::struct_layout::{chain, deps};
use crate::error::{Result, ScanError};
use crate::memory::ModuleImage;
use crate::registry::{strategy, ArtifactSpec, DiscoveryContext, OffsetRegistry};

const NATIVE_STATIC: u32 = FUNC_NATIVE | FUNC_STATIC;

const DEFAULT_PREFIX: &str = "Default__";

/// Functions of the first native library class that has any
struct Library {
    reader: ObjectReader,
    functions: Vec<usize>,
}

impl Library {
    fn new(cx: &DiscoveryContext<'_>) -> Result<Self> {
        let reader = ObjectReader::from_context(cx)?;
        let children = cx.require_offset(USTRUCT_CHILDREN)?;
        let next = cx.require_offset(UFIELD_NEXT)?;
        let functions = NATIVE_LIBRARIES
            .iter()
            .filter_map(|name| reader.find_class(name).ok())
            .map(|class| chain(&reader, class, children, next))
            .find(|functions| !functions.is_empty())
            .ok_or_else(|| ScanError::not_found("native library functions"))?;
        Ok(Self { reader, functions })
    }

    fn flags(&self, function: usize, offset: usize) -> Option<u32> {
        self.reader
            .view()
            .read_u32(function + offset)
            .ok()
            .filter(|flags| *flags != u32::MAX)
    }

    fn has_native_flags(&self, offset: usize) -> bool {
        self.functions.iter().all(|function| {
            self.flags(*function, offset)
                .is_some_and(|flags| flags & NATIVE_STATIC == NATIVE_STATIC)
        })
    }

    /// Every function flagged native at `flags` has code at `offset`
    fn has_native_code(&self, image: &ModuleImage, flags: usize, offset: usize) -> bool {
        let native: Vec<_> = self
            .functions
            .iter()
            .filter(|function| {
                self.flags(**function, flags)
                    .is_some_and(|f| f & FUNC_NATIVE != 0)
            })
            .collect();
        !native.is_empty()
            && native.iter().all(|function| {
                self.reader
                    .view()
                    .read_ptr(**function + offset)
                    .is_ok_and(|code| image.is_code(code))
            })
    }
}

/// Library classes that exist, then `Object`
fn classes_with_defaults(reader: &ObjectReader) -> Vec<usize> {
    NATIVE_LIBRARIES
        .iter()
        .chain(["Object"].iter())
        .filter_map(|name| reader.find_class(name).ok())
        .collect()
}

fn is_default_object(reader: &ObjectReader, class: usize, offset: usize) -> bool {
    reader.view().read_ptr(class + offset).is_ok_and(|cdo| {
        cdo != 0
            && reader.class_of(cdo).is_ok_and(|c| c == class)
            && reader.name_of(cdo).is_ok_and(|n| n.starts_with(DEFAULT_PREFIX))
    })
}

fn has_default_objects(reader: &ObjectReader, classes: &[usize], offset: usize) -> bool {
    !classes.is_empty() && classes.iter().all(|class| is_default_object(reader, *class, offset))
}

pub fn register(registry: &mut OffsetRegistry) -> Result<()> {
    registry.register(
        ArtifactSpec::field(UFUNCTION_FLAGS)
            .depends_on(deps(&[USTRUCT_CHILDREN, UFIELD_NEXT]))
            .strategy(strategy("native-static-library", |cx| {
                let library = Library::new(cx)?;
                first_offset(UFUNCTION_FLAGS, UFUNCTION_WINDOW, 4, |o| library.has_native_flags(o))
            }))
            .validator(|cx, v| {
                confirm(Library::new(cx)?.has_native_flags(v.raw()), UFUNCTION_FLAGS, v.raw())
            }),
    )?;

    registry.register(
        ArtifactSpec::field(UFUNCTION_FUNC)
            .depends_on(deps(&[USTRUCT_CHILDREN, UFIELD_NEXT, UFUNCTION_FLAGS]))
            .strategy(strategy("native-entry-in-code", |cx| {
                let library = Library::new(cx)?;
                let flags = cx.require_offset(UFUNCTION_FLAGS)?;
                first_offset(UFUNCTION_FUNC, UFUNCTION_WINDOW, 8, |o| {
                    library.has_native_code(cx.image(), flags, o)
                })
            }))
            .validator(|cx, v| {
                let library = Library::new(cx)?;
                let flags = cx.require_offset(UFUNCTION_FLAGS)?;
                confirm(library.has_native_code(cx.image(), flags, v.raw()), UFUNCTION_FUNC, v.raw())
            }),
    )?;

    registry.register(
        ArtifactSpec::field(UCLASS_DEFAULT_OBJECT)
            .depends_on(deps(&[]))
            .strategy(strategy("default-object-of-class", |cx| {
                let reader = ObjectReader::from_context(cx)?;
                let classes = classes_with_defaults(&reader);
                first_offset(UCLASS_DEFAULT_OBJECT, UCLASS_WINDOW, 8, |o| {
                    has_default_objects(&reader, &classes, o)
                })
            }))
            .validator(|cx, v| {
                let reader = ObjectReader::from_context(cx)?;
                let classes = classes_with_defaults(&reader);
                confirm(has_default_objects(&reader, &classes, v.raw()), UCLASS_DEFAULT_OBJECT, v.raw())
            }),
    )?;

    Ok(())
}
