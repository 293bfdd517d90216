//! Fleetscope-State: persistence layer for fleetscope
//!
//! Stores analysis records, step results and repository state, plus a
//! checkpoint log of investigation runs.
//!
//! ## Key Components
//!
//! - `AnalysisStore` / `CheckpointLog`: backend-agnostic async traits
//! - `fakes`: in-memory implementations for tests and throwaway runs
//! - `FsAnalysisStore` / `FsCheckpointLog`: local file store with atomic writes
//! - `SurrealAnalysisStore` / `SurrealCheckpointLog`: SurrealDB backend

mod error;
pub mod fakes;
pub mod fs_store;
pub mod handle;
mod migrations;
mod schema;
pub mod storage_traits;
pub mod surreal_store;

pub use error::{StateError, StorageError};
pub use fs_store::{FsAnalysisStore, FsCheckpointLog};
pub use handle::CloudConfig;
pub use storage_traits::{
    AnalysisRecord, AnalysisStore, CheckpointEvent, CheckpointLog, Fingerprint, RecordSlot,
    RepositoryState, RunId, RunRecord, RunStatus, StepResult, StorageResult, TokenUsage,
};
pub use surreal_store::{SurrealAnalysisStore, SurrealCheckpointLog};

/// Result type for fleetscope-state setup operations
pub type Result<T> = std::result::Result<T, StateError>;
