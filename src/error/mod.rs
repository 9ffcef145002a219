//! Error types for the build engine, registry client and layer cache
//!
//! Every failure kind the engine can surface is a variant here, with the
//! structured fields callers need to act on it. Variants are `Clone` so step
//! results can be shared between dependent steps.

use std::path::PathBuf;

pub type Result<T> = std::result::Result<T, BuilderError>;

#[derive(Debug, Clone, thiserror::Error)]
pub enum BuilderError {
    /// Image reference failed to parse
    #[error("invalid image reference '{input}' at offset {position}: {reason}")]
    InvalidImageReference {
        input: String,
        position: usize,
        reason: String,
    },

    /// 401 after all authentication options were exhausted
    #[error("unauthorized by {registry}{}", challenge.as_deref().map(|c| format!(" (challenge: {c})")).unwrap_or_default())]
    Unauthorized {
        registry: String,
        challenge: Option<String>,
    },

    /// 403 from the registry
    #[error("access to {repository} on {registry} is forbidden: {detail}")]
    Forbidden {
        registry: String,
        repository: String,
        detail: String,
    },

    /// 404 on a manifest endpoint
    #[error("manifest '{reference}' not found in repository {repository}")]
    ManifestNotFound {
        repository: String,
        reference: String,
    },

    /// 404 on a blob pull
    #[error("blob {digest} not found in repository {repository}")]
    BlobNotFound { repository: String, digest: String },

    /// The registry refused a blob push (distinct from a pull miss)
    #[error("registry refused blob push of {digest} to {repository}: {detail}")]
    BlobPushRefused {
        repository: String,
        digest: String,
        detail: String,
    },

    /// Base image manifest layers and config diff_ids disagree
    #[error(
        "base image is inconsistent: manifest lists {manifest_layers} layers but config carries {config_diff_ids} diff_ids"
    )]
    LayerCountMismatch {
        manifest_layers: usize,
        config_diff_ids: usize,
    },

    /// Container config JSON missing required fields or carrying wrong types
    #[error("bad container config: {reason}")]
    BadContainerConfig { reason: String },

    /// Locally computed digest disagrees with the advertised one
    #[error("digest mismatch: expected {expected}, computed {computed}")]
    DigestMismatch { expected: String, computed: String },

    /// A cache entry is partially written or internally inconsistent.
    /// Recoverable: the engine invalidates the entry and recomputes.
    #[error("cache corrupted at {}: {reason}", path.display())]
    CacheCorrupted { path: PathBuf, reason: String },

    /// Timeouts, connection resets, 5xx and 429; retried with backoff
    #[error("transient failure during {operation}: {reason}")]
    Transient {
        operation: String,
        reason: String,
        /// Seconds from a 429 `Retry-After`, when the server sent one
        retry_after: Option<u64>,
    },

    /// Offline mode and the required resource is not cached
    #[error("offline mode: {resource} is not cached; enable network access and retry")]
    OfflineMiss { resource: String },

    /// The build-level cancellation signal fired
    #[error("build cancelled")]
    Cancelled,

    /// A step failed; wraps the causal error and names the step
    #[error("step '{step}' failed: {source}")]
    Step {
        step: String,
        #[source]
        source: Box<BuilderError>,
    },

    /// Registry responses outside the specific kinds above
    #[error("registry error: {0}")]
    Registry(String),

    /// File IO
    #[error("IO error: {0}")]
    Io(String),

    /// JSON (de)serialization
    #[error("parse error: {0}")]
    Parse(String),

    /// Build plan or flag validation
    #[error("validation error: {0}")]
    Validation(String),

    /// Subprocess invocation (credential helpers, docker load)
    #[error("subprocess error: {0}")]
    Subprocess(String),
}

impl BuilderError {
    /// Whether the retry loop should re-attempt the operation.
    pub fn is_transient(&self) -> bool {
        matches!(self, BuilderError::Transient { .. })
    }

    /// Whether local recovery (invalidate + recompute) applies.
    pub fn is_recoverable_cache_error(&self) -> bool {
        matches!(self, BuilderError::CacheCorrupted { .. })
    }

    /// Strips `Step` wrappers down to the causal error.
    pub fn root_cause(&self) -> &BuilderError {
        match self {
            BuilderError::Step { source, .. } => source.root_cause(),
            other => other,
        }
    }

    /// Name of the first failing step, when one is recorded in the chain.
    pub fn failing_step(&self) -> Option<&str> {
        match self {
            BuilderError::Step { step, .. } => Some(step),
            _ => None,
        }
    }
}

impl From<std::io::Error> for BuilderError {
    fn from(err: std::io::Error) -> Self {
        BuilderError::Io(err.to_string())
    }
}

impl From<serde_json::Error> for BuilderError {
    fn from(err: serde_json::Error) -> Self {
        BuilderError::Parse(err.to_string())
    }
}

impl From<url::ParseError> for BuilderError {
    fn from(err: url::ParseError) -> Self {
        BuilderError::Validation(err.to_string())
    }
}

impl From<reqwest::Error> for BuilderError {
    fn from(err: reqwest::Error) -> Self {
        // Connect-level failures are retried; everything else is not.
        if err.is_timeout() || err.is_connect() {
            BuilderError::Transient {
                operation: "http request".to_string(),
                reason: err.to_string(),
                retry_after: None,
            }
        } else {
            BuilderError::Registry(err.to_string())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn root_cause_unwraps_step_chain() {
        let inner = BuilderError::OfflineMiss {
            resource: "manifest for alpine:3.18".to_string(),
        };
        let wrapped = BuilderError::Step {
            step: "PullBaseManifest".to_string(),
            source: Box::new(inner),
        };
        assert!(matches!(
            wrapped.root_cause(),
            BuilderError::OfflineMiss { .. }
        ));
        assert_eq!(wrapped.failing_step(), Some("PullBaseManifest"));
    }

    #[test]
    fn transient_classification() {
        let err = BuilderError::Transient {
            operation: "blob push".to_string(),
            reason: "503 Service Unavailable".to_string(),
            retry_after: None,
        };
        assert!(err.is_transient());
        assert!(!err.is_recoverable_cache_error());
    }

    #[test]
    fn digest_mismatch_carries_both_values() {
        let err = BuilderError::DigestMismatch {
            expected: "sha256:aa".to_string(),
            computed: "sha256:bb".to_string(),
        };
        let message = err.to_string();
        assert!(message.contains("sha256:aa"));
        assert!(message.contains("sha256:bb"));
    }
}
