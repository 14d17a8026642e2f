//! Anchor knowledge base
//!
//! Literals an engine build is extremely likely to contain, per artifact.
//! The table is static; [`DiscoveryConfig::extra_anchors`] extends it at
//! runtime without a rebuild.

use crate::config::DiscoveryConfig;
use crate::memory::ModuleImage;
use crate::scan::{find_any_string_all, find_string_all, find_wide_string_all, Reference, ReferenceScanner};

use super::constants::*;
use tracing::trace;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Encoding {
    Narrow,
    Wide,
    /// Unknown encoding, try both
    Either,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Anchor {
    pub text: String,
    pub encoding: Encoding,
}

impl Anchor {
    fn wide(text: &str) -> Self {
        Self {
            text: text.to_string(),
            encoding: Encoding::Wide,
        }
    }

    fn narrow(text: &str) -> Self {
        Self {
            text: text.to_string(),
            encoding: Encoding::Narrow,
        }
    }

    /// Every address the literal occurs at inside the image
    pub fn locate(&self, image: &ModuleImage) -> Vec<usize> {
        match self.encoding {
            Encoding::Narrow => find_string_all(image, &self.text),
            Encoding::Wide => find_wide_string_all(image, &self.text),
            Encoding::Either => find_any_string_all(image, &self.text),
        }
    }
}

const GC_POOL_FULL: &str = "Unable to add more objects to disregard for GC pool (Max: %d)";
const CONCURRENT_ADD: &str = "Unexpected concurency while adding new object";

fn builtin(artifact: &str) -> Vec<Anchor> {
    match artifact {
        GUOBJECT_ARRAY => vec![
            Anchor::wide("gc.MaxObjectsNotConsideredByGC"),
            Anchor::wide("gc.SizeOfPermanentObjectPool"),
            Anchor::wide(GC_POOL_FULL),
            Anchor::wide(CONCURRENT_ADD),
        ],
        GMALLOC => vec![
            Anchor::wide("Binned2"),
            Anchor::wide("Binned3"),
            Anchor::wide("Mimalloc"),
            Anchor::wide("TBB"),
        ],
        CONSOLE_MANAGER => vec![
            Anchor::wide("r.DumpingMovie"),
            Anchor::wide("r.ScreenPercentage"),
            Anchor::wide("vr.pixeldensity"),
        ],
        GDYNAMIC_RHI => vec![
            Anchor::narrow("FD3D12DynamicRHI"),
            Anchor::wide("D3D12RHI"),
            Anchor::wide("D3D11RHI"),
            Anchor::wide("r.RHICmdBypass"),
        ],
        STATIC_FIND_OBJECT => vec![
            Anchor::wide("Illegal call to StaticFindObject() while serializing object data!"),
            Anchor::wide("Illegal call to StaticFindObject() while collecting garbage!"),
        ],
        ALLOCATE_UOBJECT_INDEX => vec![Anchor::wide(GC_POOL_FULL), Anchor::wide(CONCURRENT_ADD)],
        _ => Vec::new(),
    }
}

/// Built-in anchors for `artifact`, then configured ones
pub fn anchors(config: &DiscoveryConfig, artifact: &str) -> Vec<Anchor> {
    let mut anchors = builtin(artifact);
    anchors.extend(config.anchors_for(artifact).iter().map(|text| Anchor {
        text: text.clone(),
        encoding: Encoding::Either,
    }));
    anchors
}

/// Code references to every occurrence of every anchor, in anchor order.
/// At most `max_references` are taken per occurrence.
pub fn anchor_references(
    image: &ModuleImage,
    config: &DiscoveryConfig,
    artifact: &str,
) -> Vec<Reference> {
    let mut references = Vec::new();
    for anchor in anchors(config, artifact) {
        for literal in anchor.locate(image) {
            for range in image.code_ranges() {
                let scanner = ReferenceScanner::new(image, range);
                let found: Vec<_> = scanner.iter(literal).take(config.max_references).collect();
                trace!(anchor = %anchor.text, literal = format_args!("{:#x}", literal), hits = found.len(), "anchor references");
                references.extend(found);
            }
        }
    }
    references
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_extra_anchors_follow_builtin() {
        let mut config = DiscoveryConfig::default();
        config
            .extra_anchors
            .insert(GMALLOC.to_string(), vec!["FMallocCustom".to_string()]);
        let list = anchors(&config, GMALLOC);
        assert_eq!(list[0], Anchor::wide("Binned2"));
        assert_eq!(
            list.last(),
            Some(&Anchor {
                text: "FMallocCustom".into(),
                encoding: Encoding::Either
            })
        );
    }

    #[test]
    fn test_unknown_artifact_has_only_configured_anchors() {
        let mut config = DiscoveryConfig::default();
        assert!(anchors(&config, "TestSingleton").is_empty());
        config
            .extra_anchors
            .insert("TestSingleton".into(), vec!["TestAnchor".into()]);
        assert_eq!(anchors(&config, "TestSingleton").len(), 1);
    }

    #[test]
    fn test_every_singleton_has_anchors() {
        let config = DiscoveryConfig::default();
        for artifact in [
            GUOBJECT_ARRAY,
            GMALLOC,
            CONSOLE_MANAGER,
            GDYNAMIC_RHI,
            STATIC_FIND_OBJECT,
            ALLOCATE_UOBJECT_INDEX,
        ] {
            assert!(!anchors(&config, artifact).is_empty(), "{}", artifact);
        }
    }
}
