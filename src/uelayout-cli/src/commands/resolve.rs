//! Artifact resolution

use anyhow::{bail, Context, Result};
use std::collections::BTreeMap;
use std::path::Path;
use tracing::{debug, info};
use uelayout::{ArtifactValue, HintCache, OffsetRegistry, ScanError};

/// Resolve `artifacts` (or everything registered), optionally through the
/// hint cache in `cache_dir`
pub fn handle_resolve(
    registry: &OffsetRegistry,
    artifacts: &[String],
    json: bool,
    cache_dir: Option<&Path>,
) -> Result<()> {
    if let Some(dir) = cache_dir {
        match HintCache::load(dir, registry.fingerprint()).context("Failed to read hint cache")? {
            Some(cache) => {
                let seeded = registry.seed_hints(&cache);
                info!(seeded, "seeded hints from cache");
            }
            None => debug!(dir = %dir.display(), "no hint cache for this image"),
        }
    }

    let names: Vec<String> = if artifacts.is_empty() {
        registry.names().into_iter().map(str::to_string).collect()
    } else {
        artifacts.to_vec()
    };

    let mut results: Vec<(String, Option<ArtifactValue>)> = Vec::with_capacity(names.len());
    for name in names {
        let value = match registry.try_resolve(&name) {
            Ok(value) => Some(value),
            Err(ScanError::UnknownArtifact(_)) => bail!("Unknown artifact {:?}", name),
            Err(_) => None,
        };
        results.push((name, value));
    }

    if json {
        let map: BTreeMap<_, _> = results.iter().cloned().collect();
        println!("{}", serde_json::to_string_pretty(&map)?);
    } else {
        let width = results.iter().map(|(name, _)| name.len()).max().unwrap_or(0);
        for (name, value) in &results {
            match value {
                Some(value) => println!("{:<width$}  {}", name, value, width = width),
                None => println!("{:<width$}  unavailable", name, width = width),
            }
        }
        let resolved = results.iter().filter(|(_, v)| v.is_some()).count();
        println!("\n{}/{} resolved", resolved, results.len());
    }

    if let Some(dir) = cache_dir {
        let cache = HintCache::from_registry(registry);
        if !cache.is_empty() {
            let path = cache.save(dir).context("Failed to write hint cache")?;
            info!(path = %path.display(), entries = cache.len(), "saved hint cache");
        }
    }

    Ok(())
}
