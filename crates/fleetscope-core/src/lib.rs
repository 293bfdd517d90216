//! Fleetscope Core Library
//!
//! Investigates a fleet of repositories: classifies each one, runs a
//! dependency-ordered analysis pipeline against it, caches results per step
//! and publishes merged findings. Re-exports the engine's public surface.

pub mod cache;
pub mod classify;
pub mod config;
pub mod controller;
pub mod domain;
pub mod fleet;
pub mod metrics;
pub mod obs;
pub mod pipeline;
pub mod providers;
pub mod retry;
pub mod shutdown;
pub mod structure;
pub mod telemetry;
pub mod testing;

pub use cache::{CacheKey, CacheLookup, CacheManager, InvalidationReason};
pub use classify::{
    Classification, ClassificationScore, ClassificationSource, FileTree, ScanConfig,
    TypeClassifier,
};
pub use config::{CachePolicy, FleetConfig, FleetManifest, RetryPolicy};
pub use controller::{
    Collaborators, ControllerStatus, EngineContext, OutcomeStatus, Phase, RepoController,
    RepoFailure, RepoOutcome, StatusHandle,
};
pub use domain::{
    Category, ClassifyError, CloneError, ConfigError, FailureKind, FleetError, ForceFlags,
    InvestigationRequest, ModelConfig, PipelineError, ProviderError, PublishError, RepoHead,
    RepositoryDescriptor, Result,
};
pub use fleet::{FleetCoordinator, FleetSummary, RunMode};
pub use pipeline::{
    ExecutionReport, InitialContext, MergedResult, PipelineExecutor, PromptPipeline, PromptStep,
    StepRegistry, Template, TemplateCatalog,
};
pub use providers::{
    AnalysisProvider, CloneProvider, FsResultPublisher, GitCloneProvider, HttpAnalysisProvider,
    ResultPublisher,
};
pub use shutdown::{shutdown_channel, ShutdownSignal, ShutdownTrigger};
pub use telemetry::init_tracing;

pub use fleetscope_state::{
    AnalysisRecord, AnalysisStore, CheckpointLog, Fingerprint, RecordSlot, RunId, RunStatus,
    StepResult,
};
