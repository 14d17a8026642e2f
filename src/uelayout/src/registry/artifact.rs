//! Artifact descriptions and values

use super::strategy::{DiscoveryContext, Strategy};
use crate::error::Result;

use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ArtifactKind {
    /// Address of a global holding a pointer to a unique object
    Singleton,
    /// Byte offset of a field within every instance of a record type
    FieldOffset,
    /// Entry point of an engine routine
    Function,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value")]
pub enum ArtifactValue {
    Address(usize),
    Offset(usize),
    Function(usize),
}

impl ArtifactValue {
    pub fn raw(&self) -> usize {
        match *self {
            ArtifactValue::Address(v) | ArtifactValue::Offset(v) | ArtifactValue::Function(v) => v,
        }
    }

    pub fn kind(&self) -> ArtifactKind {
        match self {
            ArtifactValue::Address(_) => ArtifactKind::Singleton,
            ArtifactValue::Offset(_) => ArtifactKind::FieldOffset,
            ArtifactValue::Function(_) => ArtifactKind::Function,
        }
    }

    /// Wrap a raw value in the variant matching `kind`
    pub fn of_kind(kind: ArtifactKind, value: usize) -> Self {
        match kind {
            ArtifactKind::Singleton => ArtifactValue::Address(value),
            ArtifactKind::FieldOffset => ArtifactValue::Offset(value),
            ArtifactKind::Function => ArtifactValue::Function(value),
        }
    }
}

impl fmt::Display for ArtifactValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ArtifactValue::Address(v) => write!(f, "address {:#x}", v),
            ArtifactValue::Offset(v) => write!(f, "offset {:#x}", v),
            ArtifactValue::Function(v) => write!(f, "function {:#x}", v),
        }
    }
}

/// Observable state of one artifact
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArtifactStatus {
    Uncomputed,
    Computing,
    Resolved(ArtifactValue),
    Failed,
}

pub type Validator =
    Box<dyn Fn(&DiscoveryContext<'_>, ArtifactValue) -> Result<()> + Send + Sync>;

/// Everything the registry needs to discover one artifact
pub struct ArtifactSpec {
    pub name: String,
    pub kind: ArtifactKind,
    /// Artifacts resolved (synchronously) before this one's strategies run
    pub depends_on: Vec<String>,
    /// Tried in order; the first candidate the validator accepts wins
    pub strategies: Vec<Box<dyn Strategy>>,
    pub validator: Option<Validator>,
    /// Same-record artifacts allowed to resolve to the same offset
    pub aliases: Vec<String>,
}

impl fmt::Debug for ArtifactSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ArtifactSpec")
            .field("name", &self.name)
            .field("kind", &self.kind)
            .field("depends_on", &self.depends_on)
            .field(
                "strategies",
                &self.strategies.iter().map(|s| s.name()).collect::<Vec<_>>(),
            )
            .field("validated", &self.validator.is_some())
            .finish()
    }
}

impl ArtifactSpec {
    pub fn new(name: &str, kind: ArtifactKind) -> Self {
        Self {
            name: name.to_string(),
            kind,
            depends_on: Vec::new(),
            strategies: Vec::new(),
            validator: None,
            aliases: Vec::new(),
        }
    }

    pub fn singleton(name: &str) -> Self {
        Self::new(name, ArtifactKind::Singleton)
    }

    pub fn field(name: &str) -> Self {
        Self::new(name, ArtifactKind::FieldOffset)
    }

    pub fn function(name: &str) -> Self {
        Self::new(name, ArtifactKind::Function)
    }

    pub fn depends_on<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.depends_on.extend(names.into_iter().map(Into::into));
        self
    }

    pub fn strategy(mut self, strategy: Box<dyn Strategy>) -> Self {
        self.strategies.push(strategy);
        self
    }

    pub fn validator<F>(mut self, validator: F) -> Self
    where
        F: Fn(&DiscoveryContext<'_>, ArtifactValue) -> Result<()> + Send + Sync + 'static,
    {
        self.validator = Some(Box::new(validator));
        self
    }

    pub fn alias_of(mut self, other: &str) -> Self {
        self.aliases.push(other.to_string());
        self
    }

    /// Record type part of `Record::Field`
    pub fn record(&self) -> &str {
        record_of(&self.name)
    }
}

pub(crate) fn record_of(name: &str) -> &str {
    name.split("::").next().unwrap_or(name)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_value_serialization_is_tagged() {
        let json = serde_json::to_string(&ArtifactValue::Offset(0x18)).unwrap();
        assert_eq!(json, r#"{"kind":"Offset","value":24}"#);
        let back: ArtifactValue = serde_json::from_str(&json).unwrap();
        assert_eq!(back, ArtifactValue::Offset(0x18));
    }

    #[test]
    fn test_value_kind_round_trip() {
        for kind in [
            ArtifactKind::Singleton,
            ArtifactKind::FieldOffset,
            ArtifactKind::Function,
        ] {
            assert_eq!(ArtifactValue::of_kind(kind, 8).kind(), kind);
        }
        assert_eq!(ArtifactValue::Function(0x1400).raw(), 0x1400);
        assert_eq!(ArtifactValue::Address(0x10).to_string(), "address 0x10");
    }

    #[test]
    fn test_record_prefix() {
        assert_eq!(ArtifactSpec::field("UStruct::Children").record(), "UStruct");
        assert_eq!(ArtifactSpec::singleton("GMalloc").record(), "GMalloc");
    }
}
