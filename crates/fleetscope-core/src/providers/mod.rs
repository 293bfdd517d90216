//! External collaborators: clone, analysis and publishing.
//!
//! The engine only sees these traits. Production adapters live in the
//! submodules; scripted fakes live in [`crate::testing`].

pub mod git;
pub mod http;
pub mod publish;

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use fleetscope_state::TokenUsage;
use serde::{Deserialize, Serialize};

use crate::classify::FileTree;
use crate::domain::{CloneError, ModelConfig, ProviderError, PublishError};
use crate::pipeline::MergedResult;

pub use git::GitCloneProvider;
pub use http::HttpAnalysisProvider;
pub use publish::FsResultPublisher;

/// A checked-out working copy. Must be handed back via
/// [`CloneProvider::release`].
#[derive(Debug, Clone)]
pub struct ClonedRepo {
    pub local_path: PathBuf,
    pub tree: FileTree,
}

#[async_trait]
pub trait CloneProvider: Send + Sync {
    /// Commit id at the tip of `branch`, without cloning.
    async fn resolve_head(&self, url: &str, branch: &str) -> Result<String, CloneError>;

    async fn clone_repo(&self, url: &str, branch: &str) -> Result<ClonedRepo, CloneError>;

    async fn release(&self, local_path: &Path) -> Result<(), CloneError>;
}

/// Inputs of one analysis call.
#[derive(Debug, Clone, Copy)]
pub struct CompletionRequest<'a> {
    pub step_id: &'a str,
    /// Template body, placeholders unfilled.
    pub template: &'a str,
    /// Aggregated output of the step's dependencies.
    pub context: &'a str,
    pub repo_structure: &'a str,
    pub dependency_manifest: &'a str,
    pub model: &'a ModelConfig,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Completion {
    pub content: String,
    pub usage: TokenUsage,
}

#[async_trait]
pub trait AnalysisProvider: Send + Sync {
    async fn complete(&self, request: CompletionRequest<'_>) -> Result<Completion, ProviderError>;
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PublishAck {
    /// Where the result ended up (path, URL, object key).
    pub location: String,
}

#[async_trait]
pub trait ResultPublisher: Send + Sync {
    async fn publish(&self, repo_id: &str, result: &MergedResult) -> Result<PublishAck, PublishError>;
}
