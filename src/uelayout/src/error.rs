//! Error types for layout discovery

use thiserror::Error;

/// Errors raised while scanning, decoding, emulating or resolving artifacts.
///
/// Everything below [`ScanError::DiscoveryExhausted`] is handled inside the
/// discovery routine that raised it and only ever causes the next candidate
/// to be tried.
#[derive(Error, Debug)]
pub enum ScanError {
    #[error("bytes at {address:#x} do not decode to a valid instruction")]
    Decode { address: usize },

    #[error("cannot read {size} bytes at {address:#x}")]
    Access { address: usize, size: usize },

    #[error("not found: {0}")]
    NotFound(String),

    #[error("validation failed: {0}")]
    ValidationFailed(String),

    #[error("discovery exhausted for {artifact} after {attempts} strategies")]
    DiscoveryExhausted { artifact: String, attempts: usize },

    #[error("unknown artifact: {0}")]
    UnknownArtifact(String),

    #[error("dependency cycle through {0}")]
    DependencyCycle(String),

    #[error("memory at {address:#x} is not writable")]
    ReadOnly { address: usize },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl ScanError {
    /// Whether the error only rejects the current candidate.
    pub fn is_recoverable(&self) -> bool {
        !matches!(
            self,
            ScanError::DiscoveryExhausted { .. }
                | ScanError::UnknownArtifact(_)
                | ScanError::DependencyCycle(_)
        )
    }

    pub(crate) fn not_found(what: impl Into<String>) -> Self {
        ScanError::NotFound(what.into())
    }

    pub(crate) fn invalid(what: impl Into<String>) -> Self {
        ScanError::ValidationFailed(what.into())
    }
}

pub type Result<T> = std::result::Result<T, ScanError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_recoverable_taxonomy() {
        assert!(ScanError::Decode { address: 0x1000 }.is_recoverable());
        assert!(ScanError::Access {
            address: 0x1000,
            size: 8
        }
        .is_recoverable());
        assert!(ScanError::not_found("anchor").is_recoverable());
        assert!(ScanError::invalid("vtable").is_recoverable());
        assert!(!ScanError::DiscoveryExhausted {
            artifact: "GMalloc".into(),
            attempts: 2
        }
        .is_recoverable());
        assert!(!ScanError::DependencyCycle("A".into()).is_recoverable());
    }

    #[test]
    fn test_error_display() {
        let err = ScanError::Access {
            address: 0x1400,
            size: 16,
        };
        assert_eq!(err.to_string(), "cannot read 16 bytes at 0x1400");

        let err = ScanError::DiscoveryExhausted {
            artifact: "GUObjectArray".into(),
            attempts: 3,
        };
        assert_eq!(
            err.to_string(),
            "discovery exhausted for GUObjectArray after 3 strategies"
        );
    }
}
