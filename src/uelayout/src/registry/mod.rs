//! Offset registry
//!
//! Owns every discoverable artifact. Each one is computed lazily, at most
//! once per registry, and its result (value or failure) is sticky.
//!
//! Concurrency: one coarse lock guards the artifact table, plus a latch per
//! artifact while it is being computed. Strategies run outside the coarse
//! lock so independent artifacts can be discovered concurrently; callers
//! asking for an artifact another thread is computing block on its latch.

mod artifact;
mod cache;
pub mod global;
mod strategy;

pub use artifact::{ArtifactKind, ArtifactSpec, ArtifactStatus, ArtifactValue, Validator};
pub use cache::HintCache;
pub use strategy::{strategy, DiscoveryContext, Strategy};

use crate::config::DiscoveryConfig;
use crate::error::{Result, ScanError};
use crate::memory::ModuleImage;

use artifact::record_of;
use once_cell::sync::OnceCell;
use parking_lot::{Condvar, Mutex};
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::{self, ThreadId};
use tracing::{debug, info, warn};

/// Released once the owning thread has stored a final state
struct Latch {
    done: Mutex<bool>,
    cv: Condvar,
}

impl Latch {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            done: Mutex::new(false),
            cv: Condvar::new(),
        })
    }

    fn wait(&self) {
        let mut done = self.done.lock();
        while !*done {
            self.cv.wait(&mut done);
        }
    }

    fn release(&self) {
        *self.done.lock() = true;
        self.cv.notify_all();
    }
}

enum State {
    Uncomputed,
    Computing { owner: ThreadId, latch: Arc<Latch> },
    Resolved(ArtifactValue),
    Failed,
}

struct Entry {
    state: State,
    /// Failure already logged
    reported: bool,
}

impl Default for Entry {
    fn default() -> Self {
        Self {
            state: State::Uncomputed,
            reported: false,
        }
    }
}

/// Stores the final state if the computing thread unwinds out of a strategy,
/// so waiters never block on a latch nobody will release.
struct ComputeGuard<'r> {
    registry: &'r OffsetRegistry,
    name: &'r str,
    latch: Arc<Latch>,
    finished: bool,
}

impl ComputeGuard<'_> {
    fn finish(mut self, outcome: Option<ArtifactValue>) {
        self.store(outcome);
        self.finished = true;
    }

    fn store(&self, outcome: Option<ArtifactValue>) {
        {
            let mut table = self.registry.table.lock();
            let entry = table.entry(self.name.to_string()).or_default();
            entry.state = match outcome {
                Some(value) => State::Resolved(value),
                None => State::Failed,
            };
        }
        self.latch.release();
    }
}

impl Drop for ComputeGuard<'_> {
    fn drop(&mut self) {
        if !self.finished {
            self.store(None);
        }
    }
}

pub struct OffsetRegistry {
    image: Arc<ModuleImage>,
    config: DiscoveryConfig,
    specs: HashMap<String, ArtifactSpec>,
    table: Mutex<HashMap<String, Entry>>,
    hints: Mutex<HashMap<String, ArtifactValue>>,
    fingerprint: OnceCell<String>,
    discoveries: AtomicUsize,
}

impl std::fmt::Debug for OffsetRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OffsetRegistry")
            .field("image", &self.image)
            .field("artifacts", &self.specs.len())
            .finish()
    }
}

impl OffsetRegistry {
    /// Empty registry over `image`; see [`crate::ue::register_defaults`]
    /// for the engine artifact catalogue.
    pub fn new(image: Arc<ModuleImage>, config: DiscoveryConfig) -> Self {
        Self {
            image,
            config,
            specs: HashMap::new(),
            table: Mutex::new(HashMap::new()),
            hints: Mutex::new(HashMap::new()),
            fingerprint: OnceCell::new(),
            discoveries: AtomicUsize::new(0),
        }
    }

    pub fn image(&self) -> &ModuleImage {
        &self.image
    }

    pub fn config(&self) -> &DiscoveryConfig {
        &self.config
    }

    pub fn fingerprint(&self) -> &str {
        self.fingerprint.get_or_init(|| self.image.fingerprint())
    }

    /// Add an artifact. Fails on duplicate names and on dependency cycles.
    pub fn register(&mut self, spec: ArtifactSpec) -> Result<()> {
        if self.specs.contains_key(&spec.name) {
            return Err(ScanError::invalid(format!(
                "artifact {} registered twice",
                spec.name
            )));
        }
        self.check_acyclic(&spec)?;
        debug!(artifact = %spec.name, strategies = spec.strategies.len(), "registered");
        self.specs.insert(spec.name.clone(), spec);
        Ok(())
    }

    /// Register `spec`, dropping any existing artifact with the same name
    pub fn replace(&mut self, spec: ArtifactSpec) -> Result<()> {
        let previous = self.specs.remove(&spec.name);
        if let Err(e) = self.check_acyclic(&spec) {
            if let Some(previous) = previous {
                self.specs.insert(previous.name.clone(), previous);
            }
            return Err(e);
        }
        self.table.lock().remove(&spec.name);
        self.specs.insert(spec.name.clone(), spec);
        Ok(())
    }

    /// Append a strategy to an already registered artifact
    pub fn add_strategy(&mut self, name: &str, strategy: Box<dyn Strategy>) -> Result<()> {
        let spec = self
            .specs
            .get_mut(name)
            .ok_or_else(|| ScanError::UnknownArtifact(name.to_string()))?;
        spec.strategies.push(strategy);
        Ok(())
    }

    fn check_acyclic(&self, spec: &ArtifactSpec) -> Result<()> {
        let mut stack: Vec<&str> = spec.depends_on.iter().map(String::as_str).collect();
        let mut seen = std::collections::HashSet::new();
        while let Some(name) = stack.pop() {
            if name == spec.name {
                return Err(ScanError::DependencyCycle(spec.name.clone()));
            }
            if !seen.insert(name) {
                continue;
            }
            if let Some(dep) = self.specs.get(name) {
                stack.extend(dep.depends_on.iter().map(String::as_str));
            }
        }
        Ok(())
    }

    /// Registered artifact names, sorted
    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.specs.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    pub fn spec(&self, name: &str) -> Option<&ArtifactSpec> {
        self.specs.get(name)
    }

    /// Resolve `name`, discovering it (and its dependencies) on first use.
    /// `None` means discovery failed, now or on an earlier call.
    pub fn resolve(&self, name: &str) -> Option<ArtifactValue> {
        self.try_resolve(name).ok()
    }

    pub fn address(&self, name: &str) -> Option<usize> {
        self.resolve(name).map(|v| v.raw())
    }

    pub fn offset(&self, name: &str) -> Option<usize> {
        self.resolve(name).map(|v| v.raw())
    }

    pub fn function(&self, name: &str) -> Option<usize> {
        self.resolve(name).map(|v| v.raw())
    }

    /// Like [`resolve`](Self::resolve) but reports why nothing was produced
    pub fn try_resolve(&self, name: &str) -> Result<ArtifactValue> {
        let spec = self
            .specs
            .get(name)
            .ok_or_else(|| ScanError::UnknownArtifact(name.to_string()))?;
        let me = thread::current().id();

        loop {
            let mut table = self.table.lock();
            let entry = table.entry(name.to_string()).or_default();
            match &entry.state {
                State::Resolved(value) => return Ok(*value),
                State::Failed => {
                    if !entry.reported {
                        entry.reported = true;
                        warn!(artifact = name, "discovery failed");
                    }
                    return Err(exhausted(spec));
                }
                State::Computing { owner, .. } if *owner == me => {
                    return Err(ScanError::DependencyCycle(name.to_string()));
                }
                State::Computing { latch, .. } => {
                    let latch = Arc::clone(latch);
                    drop(table);
                    latch.wait();
                }
                State::Uncomputed => {
                    let latch = Latch::new();
                    entry.state = State::Computing {
                        owner: me,
                        latch: Arc::clone(&latch),
                    };
                    drop(table);

                    let guard = ComputeGuard {
                        registry: self,
                        name: &spec.name,
                        latch,
                        finished: false,
                    };
                    let outcome = self.discover(spec);
                    guard.finish(outcome.as_ref().ok().copied());
                    // Loop back so the failure is reported exactly once
                    if outcome.is_err() {
                        continue;
                    }
                    return outcome;
                }
            }
        }
    }

    fn discover(&self, spec: &ArtifactSpec) -> Result<ArtifactValue> {
        self.discoveries.fetch_add(1, Ordering::Relaxed);

        for dep in &spec.depends_on {
            if let Err(e) = self.try_resolve(dep) {
                debug!(artifact = %spec.name, dependency = %dep, "dependency unavailable: {}", e);
                return Err(exhausted(spec));
            }
        }

        let cx = DiscoveryContext::new(self, spec);

        let hint = self.hints.lock().remove(&spec.name);
        if let Some(hint) = hint {
            match self.accept(&cx, spec, hint) {
                Ok(()) => {
                    info!(artifact = %spec.name, value = %hint, "accepted cached hint");
                    return Ok(hint);
                }
                Err(e) => debug!(artifact = %spec.name, "cached hint rejected: {}", e),
            }
        }

        for strategy in &spec.strategies {
            let candidate = match strategy.discover(&cx) {
                Ok(candidate) => candidate,
                Err(e) => {
                    debug!(artifact = %spec.name, strategy = strategy.name(), "no candidate: {}", e);
                    continue;
                }
            };
            match self.accept(&cx, spec, candidate) {
                Ok(()) => {
                    info!(artifact = %spec.name, strategy = strategy.name(), value = %candidate, "resolved");
                    return Ok(candidate);
                }
                Err(e) => {
                    debug!(artifact = %spec.name, strategy = strategy.name(), value = %candidate, "rejected: {}", e)
                }
            }
        }

        Err(exhausted(spec))
    }

    fn accept(&self, cx: &DiscoveryContext<'_>, spec: &ArtifactSpec, value: ArtifactValue) -> Result<()> {
        if value.kind() != spec.kind {
            return Err(ScanError::invalid(format!(
                "{} produced {:?} for a {:?} artifact",
                spec.name,
                value.kind(),
                spec.kind
            )));
        }
        if let Some(validator) = &spec.validator {
            validator(cx, value)?;
        }
        if spec.kind == ArtifactKind::FieldOffset {
            self.check_alias(spec, value)?;
        }
        Ok(())
    }

    /// Two fields of one record may share an offset only if one names the
    /// other as an alias.
    fn check_alias(&self, spec: &ArtifactSpec, value: ArtifactValue) -> Result<()> {
        let table = self.table.lock();
        for (other, entry) in table.iter() {
            if other == &spec.name || record_of(other) != spec.record() {
                continue;
            }
            if !matches!(entry.state, State::Resolved(v) if v == value) {
                continue;
            }
            let allowed = spec.aliases.iter().any(|a| a == other)
                || self
                    .specs
                    .get(other)
                    .is_some_and(|o| o.aliases.iter().any(|a| a == &spec.name));
            if !allowed {
                return Err(ScanError::invalid(format!(
                    "{} would alias {} at {}",
                    spec.name, other, value
                )));
            }
        }
        Ok(())
    }

    /// Current state without triggering discovery
    pub fn status(&self, name: &str) -> Option<ArtifactStatus> {
        if !self.specs.contains_key(name) {
            return None;
        }
        let table = self.table.lock();
        Some(match table.get(name).map(|e| &e.state) {
            None | Some(State::Uncomputed) => ArtifactStatus::Uncomputed,
            Some(State::Computing { .. }) => ArtifactStatus::Computing,
            Some(State::Resolved(v)) => ArtifactStatus::Resolved(*v),
            Some(State::Failed) => ArtifactStatus::Failed,
        })
    }

    /// Resolved value, if any, without triggering discovery
    pub fn peek(&self, name: &str) -> Option<ArtifactValue> {
        match self.status(name)? {
            ArtifactStatus::Resolved(v) => Some(v),
            _ => None,
        }
    }

    /// Every resolved artifact
    pub fn snapshot(&self) -> BTreeMap<String, ArtifactValue> {
        self.table
            .lock()
            .iter()
            .filter_map(|(name, entry)| match entry.state {
                State::Resolved(v) => Some((name.clone(), v)),
                _ => None,
            })
            .collect()
    }

    /// Resolve every registered artifact, returning how many succeeded
    pub fn resolve_all(&self) -> usize {
        self.names()
            .into_iter()
            .filter(|name| self.resolve(name).is_some())
            .count()
    }

    /// Number of discovery runs started, across all artifacts
    pub fn discovery_runs(&self) -> usize {
        self.discoveries.load(Ordering::Relaxed)
    }

    /// Offer cached values as first candidates. Hints only apply to
    /// artifacts that carry a validator and have not been computed yet;
    /// a cache from a different image is ignored entirely.
    pub fn seed_hints(&self, cache: &HintCache) -> usize {
        if cache.fingerprint != self.fingerprint() {
            info!(
                cached = %cache.fingerprint,
                current = %self.fingerprint(),
                "hint cache belongs to a different image, ignoring"
            );
            return 0;
        }

        let table = self.table.lock();
        let mut hints = self.hints.lock();
        let mut seeded = 0;
        for (name, value) in &cache.artifacts {
            let Some(spec) = self.specs.get(name) else {
                continue;
            };
            if spec.validator.is_none() || spec.kind != value.kind() {
                continue;
            }
            if matches!(table.get(name).map(|e| &e.state), None | Some(State::Uncomputed)) {
                hints.insert(name.clone(), *value);
                seeded += 1;
            }
        }
        debug!(seeded, "seeded hints");
        seeded
    }
}

fn exhausted(spec: &ArtifactSpec) -> ScanError {
    ScanError::DiscoveryExhausted {
        artifact: spec.name.clone(),
        attempts: spec.strategies.len(),
    }
}
