//! Error taxonomy for fleet investigations.
//!
//! Every per-repo error is caught at the controller boundary and reported as
//! a structured failure carrying a [`FailureKind`].

use std::time::Duration;

use fleetscope_state::StorageError;
use serde::{Deserialize, Serialize};

/// Invalid configuration: bad category name, out-of-range setting, unreadable
/// manifest or template directory.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("unknown category: {name}")]
    UnknownCategory { name: String },

    #[error("{field} out of range: {value} (allowed {min}..={max})")]
    OutOfRange {
        field: &'static str,
        value: String,
        min: String,
        max: String,
    },

    #[error("invalid value for {field}: {reason}")]
    Invalid { field: &'static str, reason: String },

    #[error("unknown step: {step}")]
    UnknownStep { step: String },

    #[error("failed to read {path}: {reason}")]
    Unreadable { path: String, reason: String },

    #[error("malformed {what}: {reason}")]
    Malformed { what: String, reason: String },
}

/// The file tree could not be used for classification.
#[derive(Debug, thiserror::Error)]
pub enum ClassifyError {
    #[error("repository tree not accessible at {path}: {reason}")]
    Inaccessible { path: String, reason: String },

    #[error("repository tree at {path} contains no files")]
    EmptyTree { path: String },

    #[error("malformed repository tree: {0}")]
    Malformed(String),

    #[error(transparent)]
    Config(#[from] ConfigError),
}

/// Clone provider failures.
#[derive(Debug, Clone, thiserror::Error)]
pub enum CloneError {
    /// Transient network failure.
    #[error("network error: {0}")]
    Network(String),

    #[error("permission denied for {url}: {reason}")]
    PermissionDenied { url: String, reason: String },

    #[error("branch {branch} not found in {url}")]
    BranchNotFound { url: String, branch: String },

    #[error("clone workspace error: {0}")]
    Workspace(String),

    #[error("timed out after {0:?}")]
    Timeout(Duration),
}

/// Analysis provider failures.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ProviderError {
    #[error("rate limited: {0}")]
    RateLimited(String),

    #[error("timed out after {0:?}")]
    Timeout(Duration),

    #[error("service error: {0}")]
    ServiceError(String),

    /// The provider refused to answer. Never retried.
    #[error("content policy refusal: {0}")]
    ContentPolicy(String),

    /// The request was rejected (auth, malformed request). Never retried.
    #[error("request rejected: {0}")]
    Rejected(String),
}

/// Result publisher failures.
#[derive(Debug, Clone, thiserror::Error)]
pub enum PublishError {
    #[error("publish i/o error: {0}")]
    Io(String),

    #[error("publish rejected: {0}")]
    Rejected(String),

    #[error("timed out after {0:?}")]
    Timeout(Duration),
}

/// Invalid step configuration, detected when a pipeline is built.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum PipelineError {
    #[error("duplicate step id: {step}")]
    DuplicateStep { step: String },

    #[error("step {step} depends on unknown step {dependency}")]
    UnknownDependency { step: String, dependency: String },

    #[error("step {step} depends on {dependency}, which runs later")]
    ForwardReference { step: String, dependency: String },

    #[error("dependency cycle: {}", path.join(" -> "))]
    Cycle { path: Vec<String> },

    #[error("step {step} references missing template {template}")]
    MissingTemplate { step: String, template: String },
}

/// Category of a per-repo failure, as reported to the coordinator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    Configuration,
    Classification,
    Clone,
    AnalysisProvider,
    ContentPolicy,
    CacheUnavailable,
    Persistence,
    Publish,
    Cancelled,
    /// The controller task panicked or was aborted.
    Internal,
}

impl FailureKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            FailureKind::Configuration => "configuration",
            FailureKind::Classification => "classification",
            FailureKind::Clone => "clone",
            FailureKind::AnalysisProvider => "analysis_provider",
            FailureKind::ContentPolicy => "content_policy",
            FailureKind::CacheUnavailable => "cache_unavailable",
            FailureKind::Persistence => "persistence",
            FailureKind::Publish => "publish",
            FailureKind::Cancelled => "cancelled",
            FailureKind::Internal => "internal",
        }
    }
}

impl std::fmt::Display for FailureKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Per-repository investigation error.
#[derive(Debug, thiserror::Error)]
pub enum FleetError {
    #[error("configuration error: {0}")]
    Configuration(#[from] ConfigError),

    #[error("classification failed: {0}")]
    Classification(ClassifyError),

    #[error("clone failed: {0}")]
    Clone(#[from] CloneError),

    #[error("analysis step {step} failed: {source}")]
    Analysis {
        step: String,
        #[source]
        source: ProviderError,
    },

    #[error("cache unavailable: {0}")]
    CacheUnavailable(#[source] StorageError),

    #[error("persistence failed: {0}")]
    Persistence(#[source] StorageError),

    #[error("publish failed: {0}")]
    Publish(#[from] PublishError),

    #[error("invalid pipeline: {0}")]
    Pipeline(#[from] PipelineError),

    #[error("investigation cancelled")]
    Cancelled,
}

impl From<ClassifyError> for FleetError {
    fn from(err: ClassifyError) -> Self {
        match err {
            ClassifyError::Config(c) => FleetError::Configuration(c),
            other => FleetError::Classification(other),
        }
    }
}

impl FleetError {
    pub fn kind(&self) -> FailureKind {
        match self {
            FleetError::Configuration(_) | FleetError::Pipeline(_) => FailureKind::Configuration,
            FleetError::Classification(_) => FailureKind::Classification,
            FleetError::Clone(_) => FailureKind::Clone,
            FleetError::Analysis {
                source: ProviderError::ContentPolicy(_),
                ..
            } => FailureKind::ContentPolicy,
            FleetError::Analysis { .. } => FailureKind::AnalysisProvider,
            FleetError::CacheUnavailable(_) => FailureKind::CacheUnavailable,
            FleetError::Persistence(_) => FailureKind::Persistence,
            FleetError::Publish(_) => FailureKind::Publish,
            FleetError::Cancelled => FailureKind::Cancelled,
        }
    }

    /// Whether the underlying cause was transient. Retries have already been
    /// spent by the time a `FleetError` is built; a later pass may succeed.
    pub fn is_retryable(&self) -> bool {
        match self {
            FleetError::Clone(e) => e.is_transient(),
            FleetError::Analysis { source, .. } => source.is_transient(),
            FleetError::CacheUnavailable(e) | FleetError::Persistence(e) => e.is_transient(),
            FleetError::Publish(e) => e.is_transient(),
            FleetError::Configuration(_)
            | FleetError::Classification(_)
            | FleetError::Pipeline(_)
            | FleetError::Cancelled => false,
        }
    }
}

/// Errors that may be retried with backoff.
pub trait Transient {
    /// Whether another attempt could succeed.
    fn is_transient(&self) -> bool;

    /// The error produced when a single attempt exceeds its time limit.
    fn timed_out(limit: Duration) -> Self;
}

impl Transient for CloneError {
    fn is_transient(&self) -> bool {
        matches!(self, CloneError::Network(_) | CloneError::Timeout(_))
    }

    fn timed_out(limit: Duration) -> Self {
        CloneError::Timeout(limit)
    }
}

impl Transient for ProviderError {
    fn is_transient(&self) -> bool {
        matches!(
            self,
            ProviderError::RateLimited(_) | ProviderError::Timeout(_) | ProviderError::ServiceError(_)
        )
    }

    fn timed_out(limit: Duration) -> Self {
        ProviderError::Timeout(limit)
    }
}

impl Transient for PublishError {
    fn is_transient(&self) -> bool {
        matches!(self, PublishError::Io(_) | PublishError::Timeout(_))
    }

    fn timed_out(limit: Duration) -> Self {
        PublishError::Timeout(limit)
    }
}

impl Transient for StorageError {
    fn is_transient(&self) -> bool {
        matches!(self, StorageError::Backend(_))
    }

    fn timed_out(limit: Duration) -> Self {
        StorageError::Backend(format!("timed out after {limit:?}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn content_policy_is_its_own_kind() {
        let err = FleetError::Analysis {
            step: "security".into(),
            source: ProviderError::ContentPolicy("refused".into()),
        };
        assert_eq!(err.kind(), FailureKind::ContentPolicy);
        assert!(err.to_string().contains("analysis step security failed"));

        let err = FleetError::Analysis {
            step: "security".into(),
            source: ProviderError::RateLimited("429".into()),
        };
        assert_eq!(err.kind(), FailureKind::AnalysisProvider);
    }

    #[test]
    fn classify_config_errors_become_configuration() {
        let err: FleetError = ClassifyError::Config(ConfigError::UnknownCategory {
            name: "mainframe".into(),
        })
        .into();
        assert_eq!(err.kind(), FailureKind::Configuration);
        assert_eq!(
            err.to_string(),
            "configuration error: unknown category: mainframe"
        );

        let err: FleetError = ClassifyError::EmptyTree { path: "/tmp/x".into() }.into();
        assert_eq!(err.kind(), FailureKind::Classification);
    }

    #[test]
    fn transient_classification() {
        assert!(CloneError::Network("reset".into()).is_transient());
        assert!(!CloneError::PermissionDenied {
            url: "u".into(),
            reason: "r".into()
        }
        .is_transient());
        assert!(ProviderError::ServiceError("503".into()).is_transient());
        assert!(!ProviderError::ContentPolicy("no".into()).is_transient());
        assert!(!ProviderError::Rejected("401".into()).is_transient());
        assert!(StorageError::Backend("down".into()).is_transient());
        assert!(!StorageError::NotFound { key: "k".into() }.is_transient());
    }

    #[test]
    fn retryable_follows_cause() {
        let err = FleetError::Clone(CloneError::Network("reset".into()));
        assert!(err.is_retryable());
        let err = FleetError::Clone(CloneError::BranchNotFound {
            url: "u".into(),
            branch: "b".into(),
        });
        assert!(!err.is_retryable());
        assert!(!FleetError::Cancelled.is_retryable());
    }

    #[test]
    fn cycle_display_joins_path() {
        let err = PipelineError::Cycle {
            path: vec!["a".into(), "b".into(), "a".into()],
        };
        assert_eq!(err.to_string(), "dependency cycle: a -> b -> a");
    }
}
