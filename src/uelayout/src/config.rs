//! Discovery tunables
//!
//! Every budget and plausibility bound used by the discovery routines lives
//! here so callers can override them from a config file.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Lowest address accepted as a heap or image pointer
pub const MIN_VALID_POINTER: usize = 0x10000;

/// Highest user-mode address on x86-64
pub const MAX_VALID_POINTER: usize = 0x8000_0000_0000;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DiscoveryConfig {
    /// Instructions the stream walker may visit per walk
    pub walk_budget: usize,
    /// Instructions the emulator may step per run
    pub emulate_budget: usize,
    /// References followed per anchor occurrence
    pub max_references: usize,
    /// Objects sampled by layout validators
    pub object_sample: usize,
    /// Ceiling on the object registry's claimed count
    pub max_object_count: usize,
    pub min_pointer: usize,
    pub max_pointer: usize,
    /// Additional anchor literals per artifact, tried after the built-in ones
    pub extra_anchors: BTreeMap<String, Vec<String>>,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            walk_budget: 512,
            emulate_budget: 256,
            max_references: 16,
            object_sample: 64,
            max_object_count: 10_000_000,
            min_pointer: MIN_VALID_POINTER,
            max_pointer: MAX_VALID_POINTER,
            extra_anchors: BTreeMap::new(),
        }
    }
}

impl DiscoveryConfig {
    /// Pointer plausibility check (range and 8-byte alignment not required)
    pub fn is_plausible_pointer(&self, value: usize) -> bool {
        value >= self.min_pointer && value < self.max_pointer
    }

    /// Configured anchors for one artifact
    pub fn anchors_for(&self, artifact: &str) -> &[String] {
        self.extra_anchors
            .get(artifact)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }
}
