//! Discovery strategies
//!
//! A strategy is one named, independently testable way of producing a
//! candidate for an artifact. Strategies never decide acceptance; the
//! registry runs the artifact's validator on whatever they return.

use super::artifact::{ArtifactSpec, ArtifactValue};
use super::OffsetRegistry;
use crate::config::DiscoveryConfig;
use crate::error::{Result, ScanError};
use crate::memory::{MemoryView, ModuleImage};

pub trait Strategy: Send + Sync {
    fn name(&self) -> &str;
    fn discover(&self, cx: &DiscoveryContext<'_>) -> Result<ArtifactValue>;
}

struct FnStrategy<F> {
    name: String,
    run: F,
}

impl<F> Strategy for FnStrategy<F>
where
    F: Fn(&DiscoveryContext<'_>) -> Result<ArtifactValue> + Send + Sync,
{
    fn name(&self) -> &str {
        &self.name
    }

    fn discover(&self, cx: &DiscoveryContext<'_>) -> Result<ArtifactValue> {
        (self.run)(cx)
    }
}

/// Strategy from a closure
pub fn strategy<F>(name: &str, run: F) -> Box<dyn Strategy>
where
    F: Fn(&DiscoveryContext<'_>) -> Result<ArtifactValue> + Send + Sync + 'static,
{
    Box::new(FnStrategy {
        name: name.to_string(),
        run,
    })
}

/// What a strategy or validator can see while an artifact is discovered
pub struct DiscoveryContext<'r> {
    registry: &'r OffsetRegistry,
    spec: &'r ArtifactSpec,
}

impl<'r> DiscoveryContext<'r> {
    pub(crate) fn new(registry: &'r OffsetRegistry, spec: &'r ArtifactSpec) -> Self {
        Self { registry, spec }
    }

    pub fn artifact(&self) -> &str {
        &self.spec.name
    }

    pub fn image(&self) -> &ModuleImage {
        self.registry.image()
    }

    pub fn view(&self) -> &MemoryView {
        self.registry.image().view()
    }

    pub fn config(&self) -> &DiscoveryConfig {
        self.registry.config()
    }

    pub fn registry(&self) -> &OffsetRegistry {
        self.registry
    }

    /// Resolve a declared dependency
    pub fn require(&self, name: &str) -> Result<ArtifactValue> {
        if !self.spec.depends_on.iter().any(|d| d == name) {
            return Err(ScanError::UnknownArtifact(format!(
                "{} is not a declared dependency of {}",
                name, self.spec.name
            )));
        }
        self.registry.try_resolve(name)
    }

    pub fn require_offset(&self, name: &str) -> Result<usize> {
        self.require(name).map(|v| v.raw())
    }

    pub fn require_address(&self, name: &str) -> Result<usize> {
        self.require(name).map(|v| v.raw())
    }

    /// Already-resolved value of any artifact, without triggering discovery
    pub fn peek(&self, name: &str) -> Option<ArtifactValue> {
        self.registry.peek(name)
    }

    /// Run this artifact's validator over a candidate; no validator accepts all
    pub fn validate(&self, value: ArtifactValue) -> Result<()> {
        match &self.spec.validator {
            Some(validator) => validator(self, value),
            None => Ok(()),
        }
    }
}
