//! Domain types and error taxonomy.

pub mod error;
pub mod repo;

pub use error::{
    ClassifyError, CloneError, ConfigError, FailureKind, FleetError, PipelineError,
    ProviderError, PublishError, Transient,
};
pub use repo::{
    Category, ForceFlags, InvestigationRequest, ModelConfig, RepoHead, RepositoryDescriptor,
};

/// Result type for per-repository operations.
pub type Result<T> = std::result::Result<T, FleetError>;
