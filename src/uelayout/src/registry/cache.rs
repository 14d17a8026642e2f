//! Persistent hint cache
//!
//! Resolved artifacts keyed by the image fingerprint. Entries are only ever
//! offered back to the registry as first candidates; every one is validated
//! again before it is used.

use super::artifact::ArtifactValue;
use super::OffsetRegistry;
use crate::error::Result;

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::debug;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HintCache {
    pub fingerprint: String,
    #[serde(default)]
    pub artifacts: BTreeMap<String, ArtifactValue>,
}

impl HintCache {
    pub fn new(fingerprint: &str) -> Self {
        Self {
            fingerprint: fingerprint.to_string(),
            artifacts: BTreeMap::new(),
        }
    }

    /// Everything `registry` has resolved so far
    pub fn from_registry(registry: &OffsetRegistry) -> Self {
        Self {
            fingerprint: registry.fingerprint().to_string(),
            artifacts: registry.snapshot(),
        }
    }

    pub fn path_in(dir: &Path, fingerprint: &str) -> PathBuf {
        dir.join(format!("{}.json", fingerprint))
    }

    /// Load the cache for `fingerprint` from `dir`, if one was saved
    pub fn load(dir: &Path, fingerprint: &str) -> Result<Option<Self>> {
        let path = Self::path_in(dir, fingerprint);
        if !path.exists() {
            return Ok(None);
        }
        let content = fs::read_to_string(&path)?;
        let cache: HintCache = serde_json::from_str(&content)?;
        debug!(path = %path.display(), entries = cache.artifacts.len(), "loaded hint cache");
        Ok(Some(cache))
    }

    pub fn save(&self, dir: &Path) -> Result<PathBuf> {
        fs::create_dir_all(dir)?;
        let path = Self::path_in(dir, &self.fingerprint);
        fs::write(&path, serde_json::to_string_pretty(self)?)?;
        debug!(path = %path.display(), entries = self.artifacts.len(), "saved hint cache");
        Ok(path)
    }

    pub fn len(&self) -> usize {
        self.artifacts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.artifacts.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::super::testing::registry;
    use super::super::{strategy, ArtifactSpec};
    use super::*;

    #[test]
    fn test_save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let mut cache = HintCache::new("abc123");
        cache
            .artifacts
            .insert("GMalloc".into(), ArtifactValue::Address(0x1_4500_0000));
        cache
            .artifacts
            .insert("UObject::ClassPrivate".into(), ArtifactValue::Offset(0x10));

        let path = cache.save(dir.path()).unwrap();
        assert!(path.ends_with("abc123.json"));

        let loaded = HintCache::load(dir.path(), "abc123").unwrap().unwrap();
        assert_eq!(loaded, cache);
        assert!(HintCache::load(dir.path(), "other").unwrap().is_none());
    }

    #[test]
    fn test_corrupt_cache_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(HintCache::path_in(dir.path(), "bad"), "{not json").unwrap();
        assert!(HintCache::load(dir.path(), "bad").is_err());
    }

    #[test]
    fn test_from_registry_captures_resolved() {
        let mut reg = registry();
        reg.register(
            ArtifactSpec::field("T::A")
                .strategy(strategy("eight", |_| Ok(ArtifactValue::Offset(8)))),
        )
        .unwrap();
        reg.register(ArtifactSpec::field("T::B")).unwrap();
        reg.resolve_all();

        let cache = HintCache::from_registry(&reg);
        assert_eq!(cache.fingerprint, reg.fingerprint());
        assert_eq!(cache.len(), 1);
        assert_eq!(cache.artifacts["T::A"], ArtifactValue::Offset(8));
    }
}
