//! Scripted collaborator fakes for tests and dry runs.
//!
//! Each fake records its calls so tests can assert on exactly which external
//! work happened. Locks are never held across an await.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use fleetscope_state::fakes::{MemoryAnalysisStore, MemoryCheckpointLog};
use fleetscope_state::{AnalysisStore, CheckpointLog, TokenUsage};

use crate::classify::FileTree;
use crate::config::{FleetConfig, RetryPolicy};
use crate::controller::{Collaborators, EngineContext};
use crate::domain::{CloneError, FleetError, ProviderError, PublishError};
use crate::pipeline::MergedResult;
use crate::providers::{
    AnalysisProvider, ClonedRepo, CloneProvider, Completion, CompletionRequest, PublishAck,
    ResultPublisher,
};
use crate::shutdown::ShutdownTrigger;

// ---------------------------------------------------------------------------
// Clone provider
// ---------------------------------------------------------------------------

#[derive(Default)]
struct CloneScript {
    heads: HashMap<String, String>,
    trees: HashMap<String, FileTree>,
    resolve_failures: HashMap<String, CloneError>,
    clone_failures: HashMap<String, CloneError>,
    panics: Vec<String>,
    clone_calls: HashMap<String, usize>,
}

/// In-memory clone provider keyed by url.
///
/// Unknown urls resolve to `"0000000"` and clone to a one-file tree. A clone
/// counts as in flight until it is released.
#[derive(Default)]
pub struct ScriptedCloneProvider {
    script: Mutex<CloneScript>,
    resolve_calls: AtomicUsize,
    release_calls: AtomicUsize,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
    fail_release: AtomicBool,
    clone_delay: Mutex<Option<Duration>>,
}

impl ScriptedCloneProvider {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a repository: its head commit and the tree a clone yields.
    pub fn add_repo(&self, url: &str, commit: &str, tree: FileTree) {
        let mut script = self.script.lock().unwrap();
        script.heads.insert(url.to_string(), commit.to_string());
        script.trees.insert(url.to_string(), tree);
    }

    pub fn set_head(&self, url: &str, commit: &str) {
        self.script
            .lock()
            .unwrap()
            .heads
            .insert(url.to_string(), commit.to_string());
    }

    pub fn fail_resolve(&self, url: &str, err: CloneError) {
        self.script
            .lock()
            .unwrap()
            .resolve_failures
            .insert(url.to_string(), err);
    }

    pub fn fail_clone(&self, url: &str, err: CloneError) {
        self.script
            .lock()
            .unwrap()
            .clone_failures
            .insert(url.to_string(), err);
    }

    /// Make `clone_repo` panic for `url`.
    pub fn panic_on_clone(&self, url: &str) {
        self.script.lock().unwrap().panics.push(url.to_string());
    }

    pub fn set_fail_release(&self, fail: bool) {
        self.fail_release.store(fail, Ordering::SeqCst);
    }

    /// Hold every clone for `delay` before returning.
    pub fn set_clone_delay(&self, delay: Duration) {
        *self.clone_delay.lock().unwrap() = Some(delay);
    }

    pub fn resolve_calls(&self) -> usize {
        self.resolve_calls.load(Ordering::SeqCst)
    }

    pub fn clone_calls(&self) -> usize {
        self.script.lock().unwrap().clone_calls.values().sum()
    }

    pub fn clone_calls_for(&self, url: &str) -> usize {
        self.script
            .lock()
            .unwrap()
            .clone_calls
            .get(url)
            .copied()
            .unwrap_or(0)
    }

    pub fn release_calls(&self) -> usize {
        self.release_calls.load(Ordering::SeqCst)
    }

    /// Clones not yet released.
    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }

    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl CloneProvider for ScriptedCloneProvider {
    async fn resolve_head(&self, url: &str, _branch: &str) -> Result<String, CloneError> {
        self.resolve_calls.fetch_add(1, Ordering::SeqCst);
        let script = self.script.lock().unwrap();
        if let Some(err) = script.resolve_failures.get(url) {
            return Err(err.clone());
        }
        Ok(script
            .heads
            .get(url)
            .cloned()
            .unwrap_or_else(|| "0000000".to_string()))
    }

    async fn clone_repo(&self, url: &str, _branch: &str) -> Result<ClonedRepo, CloneError> {
        let (tree, n) = {
            let mut script = self.script.lock().unwrap();
            let n = {
                let calls = script.clone_calls.entry(url.to_string()).or_insert(0);
                *calls += 1;
                *calls
            };
            if script.panics.iter().any(|u| u == url) {
                drop(script);
                panic!("scripted clone panic for {url}");
            }
            if let Some(err) = script.clone_failures.get(url) {
                return Err(err.clone());
            }
            let tree = script
                .trees
                .get(url)
                .cloned()
                .unwrap_or_else(|| FileTree::from_paths(["README.md"]));
            (tree, n)
        };

        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);
        let delay = *self.clone_delay.lock().unwrap();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let name = url.rsplit('/').next().unwrap_or("repo");
        Ok(ClonedRepo {
            local_path: PathBuf::from(format!("/scripted/{name}-{n}")),
            tree,
        })
    }

    async fn release(&self, _local_path: &Path) -> Result<(), CloneError> {
        self.release_calls.fetch_add(1, Ordering::SeqCst);
        // saturating: releasing an unknown path must not underflow
        let _ = self
            .in_flight
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| Some(n.saturating_sub(1)));
        if self.fail_release.load(Ordering::SeqCst) {
            return Err(CloneError::Workspace("scripted release failure".into()));
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Analysis provider
// ---------------------------------------------------------------------------

#[derive(Default)]
struct AnalysisScript {
    responses: HashMap<String, String>,
    failures: HashMap<String, ProviderError>,
    /// (step id, aggregated context) per call, in call order.
    calls: Vec<(String, String)>,
}

/// Analysis provider answering from a per-step script.
///
/// Unscripted steps answer `"<step> findings"`. Scripted failures repeat on
/// every call.
#[derive(Default)]
pub struct ScriptedAnalysisProvider {
    script: Mutex<AnalysisScript>,
    cancel_after: Mutex<Option<(usize, ShutdownTrigger)>>,
}

impl ScriptedAnalysisProvider {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn respond(&self, step_id: &str, content: &str) {
        let mut script = self.script.lock().unwrap();
        script.failures.remove(step_id);
        script
            .responses
            .insert(step_id.to_string(), content.to_string());
    }

    pub fn fail(&self, step_id: &str, err: ProviderError) {
        self.script
            .lock()
            .unwrap()
            .failures
            .insert(step_id.to_string(), err);
    }

    /// Fire `trigger` once `calls` analysis calls have been made.
    pub fn cancel_after(&self, calls: usize, trigger: ShutdownTrigger) {
        *self.cancel_after.lock().unwrap() = Some((calls, trigger));
    }

    pub fn contexts_for(&self, step_id: &str) -> Vec<String> {
        self.script
            .lock()
            .unwrap()
            .calls
            .iter()
            .filter(|(id, _)| id == step_id)
            .map(|(_, ctx)| ctx.clone())
            .collect()
    }

    pub fn calls_for(&self, step_id: &str) -> usize {
        self.script
            .lock()
            .unwrap()
            .calls
            .iter()
            .filter(|(id, _)| id == step_id)
            .count()
    }

    pub fn total_calls(&self) -> usize {
        self.script.lock().unwrap().calls.len()
    }

    /// Step ids in call order.
    pub fn call_order(&self) -> Vec<String> {
        self.script
            .lock()
            .unwrap()
            .calls
            .iter()
            .map(|(id, _)| id.clone())
            .collect()
    }
}

#[async_trait]
impl AnalysisProvider for ScriptedAnalysisProvider {
    async fn complete(&self, request: CompletionRequest<'_>) -> Result<Completion, ProviderError> {
        let (answer, total) = {
            let mut script = self.script.lock().unwrap();
            script
                .calls
                .push((request.step_id.to_string(), request.context.to_string()));
            let answer = match script.failures.get(request.step_id) {
                Some(err) => Err(err.clone()),
                None => Ok(script
                    .responses
                    .get(request.step_id)
                    .cloned()
                    .unwrap_or_else(|| format!("{} findings", request.step_id))),
            };
            (answer, script.calls.len())
        };

        if let Some((after, trigger)) = self.cancel_after.lock().unwrap().as_ref() {
            if total >= *after {
                trigger.trigger();
            }
        }

        answer.map(|content| Completion {
            content,
            usage: TokenUsage {
                input_tokens: 100,
                output_tokens: 20,
            },
        })
    }
}

// ---------------------------------------------------------------------------
// Publisher
// ---------------------------------------------------------------------------

/// Publisher that keeps every published result in memory.
#[derive(Default)]
pub struct RecordingPublisher {
    published: Mutex<Vec<(String, MergedResult)>>,
    failing: AtomicBool,
}

impl RecordingPublisher {
    pub fn new() -> Self {
        Self::default()
    }

    /// While set, every publish fails with a transient i/o error.
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub fn published(&self) -> Vec<(String, MergedResult)> {
        self.published.lock().unwrap().clone()
    }

    pub fn published_for(&self, repo_id: &str) -> Vec<MergedResult> {
        self.published
            .lock()
            .unwrap()
            .iter()
            .filter(|(id, _)| id == repo_id)
            .map(|(_, r)| r.clone())
            .collect()
    }
}

#[async_trait]
impl ResultPublisher for RecordingPublisher {
    async fn publish(&self, repo_id: &str, result: &MergedResult) -> Result<PublishAck, PublishError> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(PublishError::Io("scripted publish failure".into()));
        }
        self.published
            .lock()
            .unwrap()
            .push((repo_id.to_string(), result.clone()));
        Ok(PublishAck {
            location: format!("memory://{repo_id}"),
        })
    }
}

// ---------------------------------------------------------------------------
// Harness
// ---------------------------------------------------------------------------

/// Config with immediate retries, for tests.
pub fn fast_config() -> FleetConfig {
    FleetConfig {
        analysis_retry: RetryPolicy::immediate(3),
        clone_retry: RetryPolicy::immediate(2),
        persistence_retry: RetryPolicy::immediate(2),
        ..FleetConfig::default()
    }
}

/// A full set of fakes wired into an [`EngineContext`].
pub struct Harness {
    pub clone: Arc<ScriptedCloneProvider>,
    pub analysis: Arc<ScriptedAnalysisProvider>,
    pub publisher: Arc<RecordingPublisher>,
    pub store: Arc<dyn AnalysisStore>,
    pub checkpoints: Arc<dyn CheckpointLog>,
}

impl Default for Harness {
    fn default() -> Self {
        Self::new()
    }
}

impl Harness {
    pub fn new() -> Self {
        Self::with_store(Arc::new(MemoryAnalysisStore::new()))
    }

    pub fn with_store(store: Arc<dyn AnalysisStore>) -> Self {
        Self {
            clone: Arc::new(ScriptedCloneProvider::new()),
            analysis: Arc::new(ScriptedAnalysisProvider::new()),
            publisher: Arc::new(RecordingPublisher::new()),
            store,
            checkpoints: Arc::new(MemoryCheckpointLog::new()),
        }
    }

    pub fn collaborators(&self) -> Collaborators {
        Collaborators {
            clone: self.clone.clone(),
            analysis: self.analysis.clone(),
            publisher: self.publisher.clone(),
            store: Arc::clone(&self.store),
            checkpoints: Arc::clone(&self.checkpoints),
        }
    }

    pub fn engine(&self, config: FleetConfig) -> Result<Arc<EngineContext>, FleetError> {
        EngineContext::new(config, self.collaborators()).map(Arc::new)
    }
}
