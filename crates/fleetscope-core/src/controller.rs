//! Repo Investigation Controller.
//!
//! One controller per repository drives the state machine
//!
//! ```text
//! Pending -> CacheCheck -> CacheHit -> Done
//!                       -> CacheMiss -> Cloning -> TypeResolution
//!                          -> PipelineExecution -> ResultPersistence
//!                          -> Cleanup -> Done
//! ```
//!
//! with `Error` reachable from every state. The clone workspace acquired in
//! `Cloning` is released in `Cleanup` on every exit path. Every error is
//! converted into a [`RepoFailure`] at this boundary; nothing propagates to
//! the coordinator except a panic.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use fleetscope_state::{
    AnalysisRecord, AnalysisStore, CheckpointEvent, CheckpointLog, RecordSlot, RunId, RunStatus,
    StepResult,
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::sync::watch;
use tracing::{info, instrument, warn};

use crate::cache::{CacheKey, CacheLookup, CacheManager, InvalidationReason};
use crate::classify::{ClassificationSource, TypeClassifier};
use crate::config::{CachePolicy, FleetConfig};
use crate::domain::{Category, ConfigError, FailureKind, FleetError, InvestigationRequest, RepoHead};
use crate::metrics::METRICS;
use crate::obs;
use crate::pipeline::{
    ExecutionScope, InitialContext, MergedResult, PipelineExecutor, PromptPipeline, StepEvent,
    StepListener, StepRegistry, TemplateCatalog,
};
use crate::providers::{AnalysisProvider, ClonedRepo, CloneProvider, ResultPublisher};
use crate::retry::retry_with_backoff;
use crate::shutdown::ShutdownSignal;
use crate::structure::{render_dependencies, render_structure, STRUCTURE_DEPTH};

/// Controller state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Pending,
    CacheCheck,
    CacheHit,
    CacheMiss,
    Cloning,
    TypeResolution,
    PipelineExecution,
    ResultPersistence,
    Cleanup,
    Done,
    Error,
}

impl Phase {
    pub fn as_str(&self) -> &'static str {
        match self {
            Phase::Pending => "pending",
            Phase::CacheCheck => "cache_check",
            Phase::CacheHit => "cache_hit",
            Phase::CacheMiss => "cache_miss",
            Phase::Cloning => "cloning",
            Phase::TypeResolution => "type_resolution",
            Phase::PipelineExecution => "pipeline_execution",
            Phase::ResultPersistence => "result_persistence",
            Phase::Cleanup => "cleanup",
            Phase::Done => "done",
            Phase::Error => "error",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Phase::Done | Phase::Error)
    }
}

impl std::fmt::Display for Phase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Structured per-repo failure reported to the coordinator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RepoFailure {
    pub repo_id: String,
    /// Phase in which the error was raised.
    pub phase: Phase,
    pub kind: FailureKind,
    pub reason: String,
    /// A later pass may succeed without configuration changes.
    pub retryable: bool,
}

impl RepoFailure {
    pub fn from_error(repo_id: &str, phase: Phase, err: &FleetError) -> Self {
        Self {
            repo_id: repo_id.to_string(),
            phase,
            kind: err.kind(),
            reason: err.to_string(),
            retryable: err.is_retryable(),
        }
    }
}

impl std::fmt::Display for RepoFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} [{} @ {}]: {}", self.repo_id, self.kind, self.phase, self.reason)
    }
}

/// Read-only view of a controller.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ControllerStatus {
    pub repo_id: String,
    pub phase: Phase,
    pub pass: u64,
    /// Step currently executing, or the last one finished.
    pub current_step: Option<String>,
    pub steps_done: usize,
    pub steps_total: usize,
    pub started_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
    pub failure: Option<RepoFailure>,
}

impl ControllerStatus {
    fn idle(repo_id: &str) -> Self {
        Self {
            repo_id: repo_id.to_string(),
            phase: Phase::Pending,
            pass: 0,
            current_step: None,
            steps_done: 0,
            steps_total: 0,
            started_at: None,
            updated_at: Utc::now(),
            failure: None,
        }
    }

    /// Milliseconds since the current investigation started.
    pub fn elapsed_ms(&self) -> u64 {
        self.started_at
            .map(|t| (self.updated_at - t).num_milliseconds().max(0) as u64)
            .unwrap_or(0)
    }
}

/// Cloneable, non-blocking handle onto a controller's status.
#[derive(Debug, Clone)]
pub struct StatusHandle {
    rx: watch::Receiver<ControllerStatus>,
}

impl StatusHandle {
    pub fn snapshot(&self) -> ControllerStatus {
        self.rx.borrow().clone()
    }

    /// Resolves on the next status change. Returns `false` once the
    /// controller is gone.
    pub async fn changed(&mut self) -> bool {
        self.rx.changed().await.is_ok()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutcomeStatus {
    Succeeded,
    CacheHit,
    Failed(RepoFailure),
    Cancelled,
}

impl OutcomeStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            OutcomeStatus::Succeeded => "succeeded",
            OutcomeStatus::CacheHit => "cache_hit",
            OutcomeStatus::Failed(_) => "failed",
            OutcomeStatus::Cancelled => "cancelled",
        }
    }
}

/// Result of one investigation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RepoOutcome {
    pub repo_id: String,
    pub pass: u64,
    pub status: OutcomeStatus,
    pub commit_id: Option<String>,
    pub category: Option<Category>,
    /// Cache decision, when one was made.
    pub reason: Option<InvalidationReason>,
    pub steps_executed: usize,
    pub steps_reused: usize,
    pub run_id: Option<RunId>,
    pub duration_ms: u64,
    /// Cache reads or writes were skipped under the fail-open policy.
    pub uncached: bool,
}

impl RepoOutcome {
    fn new(repo_id: &str, pass: u64, status: OutcomeStatus) -> Self {
        Self {
            repo_id: repo_id.to_string(),
            pass,
            status,
            commit_id: None,
            category: None,
            reason: None,
            steps_executed: 0,
            steps_reused: 0,
            run_id: None,
            duration_ms: 0,
            uncached: false,
        }
    }

    /// Outcome for a repository that was never started.
    pub fn cancelled(repo_id: &str, pass: u64) -> Self {
        Self::new(repo_id, pass, OutcomeStatus::Cancelled)
    }

    pub fn failed(failure: RepoFailure, pass: u64) -> Self {
        let repo_id = failure.repo_id.clone();
        Self::new(&repo_id, pass, OutcomeStatus::Failed(failure))
    }

    pub fn failure(&self) -> Option<&RepoFailure> {
        match &self.status {
            OutcomeStatus::Failed(f) => Some(f),
            _ => None,
        }
    }

    pub fn is_cache_hit(&self) -> bool {
        self.status == OutcomeStatus::CacheHit
    }
}

// ---------------------------------------------------------------------------
// Engine context
// ---------------------------------------------------------------------------

/// External collaborators of the engine.
#[derive(Clone)]
pub struct Collaborators {
    pub clone: Arc<dyn CloneProvider>,
    pub analysis: Arc<dyn AnalysisProvider>,
    pub publisher: Arc<dyn ResultPublisher>,
    pub store: Arc<dyn AnalysisStore>,
    pub checkpoints: Arc<dyn CheckpointLog>,
}

/// Validated configuration plus everything a controller needs, shared
/// read-only by every controller of a fleet.
pub struct EngineContext {
    config: FleetConfig,
    registry: StepRegistry,
    classifier: TypeClassifier,
    cache: CacheManager,
    executor: PipelineExecutor,
    clone: Arc<dyn CloneProvider>,
    publisher: Arc<dyn ResultPublisher>,
    checkpoints: Arc<dyn CheckpointLog>,
}

impl EngineContext {
    /// Built-in steps, with templates overlaid from `config.templates_dir`.
    pub fn new(config: FleetConfig, collaborators: Collaborators) -> Result<Self, FleetError> {
        let mut catalog = TemplateCatalog::builtin();
        if let Some(dir) = &config.templates_dir {
            let loaded = catalog.load_dir(dir)?;
            info!(dir = %dir.display(), templates = loaded, "loaded template overrides");
        }
        Self::with_registry(config, StepRegistry::with_catalog(catalog), collaborators)
    }

    /// Fails fast on invalid configuration or an invalid step graph.
    pub fn with_registry(
        config: FleetConfig,
        registry: StepRegistry,
        collaborators: Collaborators,
    ) -> Result<Self, FleetError> {
        config.validate()?;
        registry.validate_all()?;
        if let Some(step) = &config.force_step {
            if !registry.contains_step(step) {
                return Err(ConfigError::UnknownStep { step: step.clone() }.into());
            }
        }

        let cache = CacheManager::from_config(collaborators.store, &config);
        let executor = PipelineExecutor::new(
            collaborators.analysis,
            config.analysis_retry.clone(),
            config.model.clone(),
        );
        Ok(Self {
            config,
            registry,
            classifier: TypeClassifier::new(),
            cache,
            executor,
            clone: collaborators.clone,
            publisher: collaborators.publisher,
            checkpoints: collaborators.checkpoints,
        })
    }

    pub fn config(&self) -> &FleetConfig {
        &self.config
    }

    pub fn registry(&self) -> &StepRegistry {
        &self.registry
    }

    pub fn cache(&self) -> &CacheManager {
        &self.cache
    }
}

// ---------------------------------------------------------------------------
// Checkpoint journal
// ---------------------------------------------------------------------------

/// Best-effort writer of one run's checkpoint events.
///
/// The run is opened lazily on a cache miss. Write failures are logged and
/// never fail the repository.
struct RunJournal {
    log: Arc<dyn CheckpointLog>,
    repo_id: String,
    run_id: Option<RunId>,
    seq: AtomicU64,
}

impl RunJournal {
    fn new(log: Arc<dyn CheckpointLog>, repo_id: &str) -> Self {
        Self {
            log,
            repo_id: repo_id.to_string(),
            run_id: None,
            seq: AtomicU64::new(0),
        }
    }

    async fn begin(&mut self) {
        match self.log.begin_run(&self.repo_id).await {
            Ok(run_id) => self.run_id = Some(run_id),
            Err(err) => obs::emit_degraded_write(&self.repo_id, "checkpoint", &err),
        }
    }

    async fn record(&self, kind: &str, payload: serde_json::Value) {
        let Some(run_id) = &self.run_id else {
            return;
        };
        let seq = self.seq.fetch_add(1, Ordering::SeqCst) + 1;
        if let Err(err) = self
            .log
            .append(run_id, CheckpointEvent::new(seq, kind, payload))
            .await
        {
            obs::emit_degraded_write(&self.repo_id, "checkpoint", &err);
        }
    }

    async fn finish(&self, status: RunStatus, detail: Option<String>) {
        let Some(run_id) = &self.run_id else {
            return;
        };
        if let Err(err) = self.log.finish_run(run_id, status, detail).await {
            obs::emit_degraded_write(&self.repo_id, "checkpoint", &err);
        }
    }
}

// ---------------------------------------------------------------------------
// Controller
// ---------------------------------------------------------------------------

/// Error raised in a given phase.
struct PhaseError {
    phase: Phase,
    error: FleetError,
}

fn at(phase: Phase) -> impl FnOnce(FleetError) -> PhaseError {
    move |error| PhaseError { phase, error }
}

/// Everything decided during CacheCheck that a miss carries forward.
struct MissPlan {
    head: RepoHead,
    reason: InvalidationReason,
    previous: Option<AnalysisRecord>,
    uncached: bool,
}

enum CacheDecision {
    Hit(AnalysisRecord),
    Miss(MissPlan),
}

struct Completed {
    category: Category,
    run_id: RunId,
    executed: usize,
    reused: usize,
    uncached: bool,
}

pub struct RepoController {
    engine: Arc<EngineContext>,
    repo_id: String,
    status: watch::Sender<ControllerStatus>,
}

impl RepoController {
    pub fn new(engine: Arc<EngineContext>, repo_id: impl Into<String>) -> Self {
        let repo_id = repo_id.into();
        let (status, _) = watch::channel(ControllerStatus::idle(&repo_id));
        Self {
            engine,
            repo_id,
            status,
        }
    }

    pub fn repo_id(&self) -> &str {
        &self.repo_id
    }

    pub fn status_handle(&self) -> StatusHandle {
        StatusHandle {
            rx: self.status.subscribe(),
        }
    }

    pub fn snapshot(&self) -> ControllerStatus {
        self.status.borrow().clone()
    }

    /// Mark the controller failed from outside, e.g. after its task panicked.
    pub fn record_failure(&self, failure: RepoFailure) {
        self.status.send_modify(|s| {
            s.phase = Phase::Error;
            s.failure = Some(failure);
            s.updated_at = Utc::now();
        });
    }

    fn transition(&self, phase: Phase) {
        self.status.send_modify(|s| {
            s.phase = phase;
            s.updated_at = Utc::now();
        });
        obs::emit_phase(&self.repo_id, phase.as_str());
    }

    /// Investigate the repository once. Never returns an error: failures are
    /// reported in the outcome.
    #[instrument(
        name = "fleetscope.repo",
        skip_all,
        fields(repo = %self.repo_id, pass = pass)
    )]
    pub async fn investigate(
        &self,
        request: &InvestigationRequest,
        cancel: &ShutdownSignal,
        pass: u64,
    ) -> RepoOutcome {
        let started = Instant::now();
        self.status.send_replace(ControllerStatus {
            pass,
            started_at: Some(Utc::now()),
            ..ControllerStatus::idle(&self.repo_id)
        });
        METRICS.inc_repos();
        obs::emit_repo_started(&self.repo_id, &request.descriptor.branch, request.force.is_set());

        let mut journal = RunJournal::new(Arc::clone(&self.engine.checkpoints), &self.repo_id);
        let mut outcome = self.drive(request, cancel, pass, &mut journal).await;
        outcome.duration_ms = started.elapsed().as_millis() as u64;

        match &outcome.status {
            OutcomeStatus::Failed(failure) => {
                METRICS.inc_failures();
                warn!(
                    repo = %self.repo_id,
                    phase = %failure.phase,
                    kind = %failure.kind,
                    error = %failure.reason,
                    "investigation failed"
                );
                self.record_failure(failure.clone());
                journal
                    .finish(RunStatus::Failed, Some(failure.reason.clone()))
                    .await;
            }
            OutcomeStatus::Cancelled => {
                journal
                    .finish(RunStatus::Cancelled, Some("shutdown requested".into()))
                    .await;
            }
            OutcomeStatus::Succeeded => {
                self.transition(Phase::Done);
                journal.finish(RunStatus::Succeeded, None).await;
            }
            OutcomeStatus::CacheHit => self.transition(Phase::Done),
        }
        obs::emit_repo_finished(&self.repo_id, outcome.status.as_str(), outcome.duration_ms);
        outcome
    }

    async fn drive(
        &self,
        request: &InvestigationRequest,
        cancel: &ShutdownSignal,
        pass: u64,
        journal: &mut RunJournal,
    ) -> RepoOutcome {
        let repo_id = self.repo_id.as_str();
        if cancel.is_cancelled() {
            return self.cancel(Phase::Pending, RepoOutcome::cancelled(repo_id, pass));
        }

        self.transition(Phase::CacheCheck);
        let plan = match self.cache_check(request).await {
            Ok(CacheDecision::Hit(record)) => {
                self.transition(Phase::CacheHit);
                let mut outcome = RepoOutcome::new(repo_id, pass, OutcomeStatus::CacheHit);
                outcome.commit_id = Some(record.commit_id.clone());
                outcome.category = Category::parse(&record.category).ok();
                outcome.reason = Some(InvalidationReason::Ok);
                outcome.run_id = Some(record.run_id.clone());
                return outcome;
            }
            Ok(CacheDecision::Miss(plan)) => plan,
            Err(e) => return self.fail(pass, e),
        };

        self.transition(Phase::CacheMiss);
        journal.begin().await;
        journal
            .record(
                "cache_miss",
                json!({ "commit": plan.head.commit_id, "reason": plan.reason.as_str() }),
            )
            .await;

        let mut outcome = RepoOutcome::new(repo_id, pass, OutcomeStatus::Succeeded);
        outcome.commit_id = Some(plan.head.commit_id.clone());
        outcome.reason = Some(plan.reason);
        outcome.run_id = journal.run_id.clone();
        outcome.uncached = plan.uncached;

        if cancel.is_cancelled() {
            return self.cancel(Phase::CacheMiss, outcome);
        }

        self.transition(Phase::Cloning);
        journal.record("phase", json!({ "phase": Phase::Cloning.as_str() })).await;
        let cloned = match retry_with_backoff(
            &self.engine.config.clone_retry,
            "clone.clone_repo",
            || {
                self.engine
                    .clone
                    .clone_repo(&request.descriptor.url, &request.descriptor.branch)
            },
        )
        .await
        {
            Ok(cloned) => cloned,
            Err(err) => return self.fail(pass, at(Phase::Cloning)(err.into())),
        };

        let analyzed = self.analyze(request, &plan, &cloned, cancel, journal).await;

        self.transition(Phase::Cleanup);
        if let Err(err) = self.engine.clone.release(&cloned.local_path).await {
            obs::emit_cleanup_error(repo_id, &err);
        }
        if !plan.uncached {
            if let Err(err) = self
                .engine
                .cache
                .record_state(&plan.head, analyzed.is_ok())
                .await
            {
                obs::emit_degraded_write(repo_id, "repo_state", &err);
            }
        }

        match analyzed {
            Ok(done) => {
                outcome.category = Some(done.category);
                outcome.run_id = Some(done.run_id);
                outcome.steps_executed = done.executed;
                outcome.steps_reused = done.reused;
                outcome.uncached |= done.uncached;
                outcome
            }
            Err(PhaseError {
                phase,
                error: FleetError::Cancelled,
            }) => self.cancel(phase, outcome),
            Err(e) => {
                let mut failed = self.fail(pass, e);
                failed.commit_id = outcome.commit_id;
                failed.reason = outcome.reason;
                failed.run_id = outcome.run_id;
                failed
            }
        }
    }

    fn cancel(&self, phase: Phase, mut outcome: RepoOutcome) -> RepoOutcome {
        self.record_failure(RepoFailure::from_error(
            &self.repo_id,
            phase,
            &FleetError::Cancelled,
        ));
        outcome.status = OutcomeStatus::Cancelled;
        outcome
    }

    fn fail(&self, pass: u64, e: PhaseError) -> RepoOutcome {
        RepoOutcome::failed(RepoFailure::from_error(&self.repo_id, e.phase, &e.error), pass)
    }

    /// Resolve the remote head and decide hit or miss without cloning.
    async fn cache_check(&self, request: &InvestigationRequest) -> Result<CacheDecision, PhaseError> {
        let engine = &self.engine;
        let descriptor = &request.descriptor;
        let override_category = request
            .category_override
            .as_deref()
            .map(Category::parse)
            .transpose()
            .map_err(|e| at(Phase::CacheCheck)(e.into()))?;

        let commit_id = retry_with_backoff(&engine.config.clone_retry, "clone.resolve_head", || {
            engine.clone.resolve_head(&descriptor.url, &descriptor.branch)
        })
        .await
        .map_err(|e| at(Phase::CacheCheck)(e.into()))?;
        let head = RepoHead {
            repo_id: self.repo_id.clone(),
            branch: descriptor.branch.clone(),
            commit_id,
        };

        let lookup = match self.lookup(&head, override_category, request).await {
            Ok(lookup) => lookup,
            Err(FleetError::CacheUnavailable(err)) => match engine.cache.policy() {
                CachePolicy::FailOpen => {
                    obs::emit_degraded_write(&self.repo_id, "cache_read", &err);
                    obs::emit_cache_decision(&self.repo_id, &head.commit_id, false, "CACHE_UNAVAILABLE");
                    return Ok(CacheDecision::Miss(MissPlan {
                        head,
                        reason: InvalidationReason::NoRecord,
                        previous: None,
                        uncached: true,
                    }));
                }
                CachePolicy::FailClosed => {
                    return Err(at(Phase::CacheCheck)(FleetError::CacheUnavailable(err)))
                }
            },
            Err(err) => return Err(at(Phase::CacheCheck)(err)),
        };

        obs::emit_cache_decision(
            &self.repo_id,
            &head.commit_id,
            lookup.is_hit(),
            lookup.reason().as_str(),
        );
        Ok(match lookup {
            CacheLookup::Hit(record) => {
                info!(
                    repo = %self.repo_id,
                    analyzed_at = %record.created_at,
                    "cached analysis is current"
                );
                CacheDecision::Hit(record)
            }
            CacheLookup::Miss { reason, previous } => CacheDecision::Miss(MissPlan {
                head,
                reason,
                previous,
                uncached: false,
            }),
        })
    }

    /// Probe the cache with the pipeline of the best category guess: the
    /// override, else the category of the slot's live record.
    ///
    /// Store failures surface as `CacheUnavailable` so the cache policy can
    /// decide; anything else fails the check.
    async fn lookup(
        &self,
        head: &RepoHead,
        override_category: Option<Category>,
        request: &InvestigationRequest,
    ) -> Result<CacheLookup, FleetError> {
        let cache = &self.engine.cache;
        let candidate = match override_category {
            Some(category) => Some(category),
            None if request.force.global => None,
            None => cache
                .fetch(&RecordSlot::new(head.repo_id.clone(), head.branch.clone()))
                .await
                .map_err(FleetError::CacheUnavailable)?
                .and_then(|record| Category::parse(&record.category).ok()),
        };
        let pipeline = self
            .engine
            .registry
            .build_pipeline(candidate.unwrap_or(Category::Generic))?;
        let key = cache.compute_key(head, &pipeline.fingerprint);
        cache
            .lookup(&key, &request.force)
            .await
            .map_err(FleetError::CacheUnavailable)
    }

    /// Everything between acquiring and releasing the clone workspace.
    async fn analyze(
        &self,
        request: &InvestigationRequest,
        plan: &MissPlan,
        cloned: &ClonedRepo,
        cancel: &ShutdownSignal,
        journal: &RunJournal,
    ) -> Result<Completed, PhaseError> {
        let engine = &self.engine;
        let repo_id = self.repo_id.as_str();

        self.transition(Phase::TypeResolution);
        let classification = engine
            .classifier
            .classify(&cloned.tree, request.category_override.as_deref())
            .map_err(|e| at(Phase::TypeResolution)(e.into()))?;
        let category = classification.category;
        obs::emit_classified(
            repo_id,
            category.as_str(),
            classification.score.confidence,
            classification.source == ClassificationSource::Override,
        );
        journal
            .record(
                "classified",
                json!({
                    "category": category.as_str(),
                    "confidence": classification.score.confidence,
                    "source": classification.source,
                }),
            )
            .await;

        let pipeline = engine
            .registry
            .build_pipeline(category)
            .map_err(|e| at(Phase::TypeResolution)(e.into()))?;
        let key = engine.cache.compute_key(&plan.head, &pipeline.fingerprint);
        let mut uncached = plan.uncached;
        let reusable = self
            .reusable_steps(&key, plan, request, &mut uncached)
            .await
            .map_err(at(Phase::PipelineExecution))?;

        self.transition(Phase::PipelineExecution);
        self.status.send_modify(|s| {
            s.steps_total = pipeline.len();
            s.steps_done = 0;
        });
        let initial = InitialContext {
            repo_structure: render_structure(repo_id, &cloned.tree, STRUCTURE_DEPTH),
            dependency_manifest: render_dependencies(&cloned.tree),
        };
        let scope = ExecutionScope {
            cache: &engine.cache,
            key: &key,
            reusable: &reusable,
            uncached,
        };
        let listener = ProgressListener {
            status: &self.status,
            journal,
        };
        let executor = engine.executor.with_model(request.model.clone());
        let report = executor
            .execute(&pipeline, &initial, &scope, &listener, cancel)
            .await
            .map_err(at(Phase::PipelineExecution))?;
        uncached |= report.degraded;

        self.transition(Phase::ResultPersistence);
        let run_id = journal.run_id.clone().unwrap_or_default();
        let record = engine
            .cache
            .build_record(&key, category.as_str(), report.results, run_id.clone());
        self.persist(&key, &pipeline, &record, &mut uncached)
            .await
            .map_err(at(Phase::ResultPersistence))?;

        Ok(Completed {
            category,
            run_id,
            executed: report.executed,
            reused: report.reused,
            uncached,
        })
    }

    async fn reusable_steps(
        &self,
        key: &CacheKey,
        plan: &MissPlan,
        request: &InvestigationRequest,
        uncached: &mut bool,
    ) -> Result<BTreeMap<String, StepResult>, FleetError> {
        if *uncached {
            return Ok(BTreeMap::new());
        }
        match self
            .engine
            .cache
            .reusable_steps(key, plan.previous.as_ref(), &request.force)
            .await
        {
            Ok(steps) => Ok(steps),
            Err(err) => match self.engine.cache.policy() {
                CachePolicy::FailOpen => {
                    obs::emit_degraded_write(&self.repo_id, "step_read", &err);
                    *uncached = true;
                    Ok(BTreeMap::new())
                }
                CachePolicy::FailClosed => Err(FleetError::CacheUnavailable(err)),
            },
        }
    }

    /// Publish, then store the record. Publishing first means a stored
    /// record always has a published counterpart.
    async fn persist(
        &self,
        key: &CacheKey,
        pipeline: &PromptPipeline,
        record: &AnalysisRecord,
        uncached: &mut bool,
    ) -> Result<(), FleetError> {
        let engine = &self.engine;
        let merged = MergedResult::from_record(record);
        let ack = retry_with_backoff(&engine.config.persistence_retry, "publish", || {
            engine.publisher.publish(&self.repo_id, &merged)
        })
        .await?;
        info!(
            repo = %self.repo_id,
            location = %ack.location,
            sections = merged.sections.len(),
            steps = pipeline.len(),
            "result published"
        );

        if *uncached {
            return Ok(());
        }
        if let Err(err) = engine.cache.store(key, record).await {
            match engine.cache.policy() {
                CachePolicy::FailOpen => {
                    obs::emit_degraded_write(&self.repo_id, "record", &err);
                    *uncached = true;
                    return Ok(());
                }
                CachePolicy::FailClosed => return Err(FleetError::Persistence(err)),
            }
        }
        if let Err(err) = engine.cache.prune(key).await {
            obs::emit_degraded_write(&self.repo_id, "step_prune", &err);
        }
        Ok(())
    }
}

/// Mirrors step progress into the status channel and the checkpoint log.
struct ProgressListener<'a> {
    status: &'a watch::Sender<ControllerStatus>,
    journal: &'a RunJournal,
}

#[async_trait]
impl StepListener for ProgressListener<'_> {
    async fn on_event(&self, event: StepEvent<'_>) {
        match event {
            StepEvent::Started { step_id, .. } => {
                self.status.send_modify(|s| {
                    s.current_step = Some(step_id.to_string());
                    s.updated_at = Utc::now();
                });
            }
            StepEvent::Reused { result, index, .. } | StepEvent::Completed { result, index, .. } => {
                let reused = matches!(event, StepEvent::Reused { .. });
                self.status.send_modify(|s| {
                    s.current_step = Some(result.step_id.clone());
                    s.steps_done = index;
                    s.updated_at = Utc::now();
                });
                self.journal
                    .record(
                        if reused { "step_reused" } else { "step_completed" },
                        json!({
                            "step": result.step_id,
                            "index": index,
                            "applicable": result.applicable,
                            "template_version": result.template_version,
                        }),
                    )
                    .await;
            }
            StepEvent::SkippedOptional {
                step_id,
                index,
                reason,
                ..
            } => {
                self.status.send_modify(|s| {
                    s.current_step = Some(step_id.to_string());
                    s.steps_done = index;
                    s.updated_at = Utc::now();
                });
                self.journal
                    .record(
                        "step_skipped",
                        json!({ "step": step_id, "index": index, "reason": reason }),
                    )
                    .await;
            }
        }
    }
}
