//! Fleet Coordinator: chunked, bounded-concurrency passes over the fleet.
//!
//! Each pass splits the repository list into chunks of `chunk_size`. All
//! controllers of a chunk run as separate tasks and the whole chunk settles
//! before the next one starts. A failing or panicking controller is recorded
//! and never affects its siblings.

use std::collections::HashMap;
use std::fmt::Write as _;
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::future::join_all;
use serde::{Deserialize, Serialize};
use tracing::{error, info, warn};

use crate::controller::{
    ControllerStatus, EngineContext, OutcomeStatus, RepoController, RepoFailure, RepoOutcome,
};
use crate::domain::{FailureKind, ForceFlags, InvestigationRequest, RepositoryDescriptor};
use crate::metrics::METRICS;
use crate::obs;
use crate::shutdown::ShutdownSignal;

/// Pass number that carries the configured force flags.
pub const FIRST_PASS: u64 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunMode {
    SinglePass,
    /// Repeat after `sleep_interval` until cancelled or `max_passes` ran.
    Daemon { max_passes: Option<u64> },
}

/// Per-pass report.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FleetSummary {
    pub pass: u64,
    pub total: usize,
    pub succeeded: usize,
    pub cache_hits: usize,
    pub failed: usize,
    pub cancelled: usize,
    pub duration_ms: u64,
    pub failures: Vec<RepoFailure>,
    /// In repository order.
    pub outcomes: Vec<RepoOutcome>,
}

impl FleetSummary {
    fn from_outcomes(pass: u64, outcomes: Vec<RepoOutcome>, duration: Duration) -> Self {
        let mut summary = FleetSummary {
            pass,
            total: outcomes.len(),
            succeeded: 0,
            cache_hits: 0,
            failed: 0,
            cancelled: 0,
            duration_ms: duration.as_millis() as u64,
            failures: Vec::new(),
            outcomes: Vec::new(),
        };
        for outcome in &outcomes {
            match &outcome.status {
                OutcomeStatus::Succeeded => summary.succeeded += 1,
                OutcomeStatus::CacheHit => summary.cache_hits += 1,
                OutcomeStatus::Cancelled => summary.cancelled += 1,
                OutcomeStatus::Failed(failure) => {
                    summary.failed += 1;
                    summary.failures.push(failure.clone());
                }
            }
        }
        summary.outcomes = outcomes;
        summary
    }

    pub fn outcome(&self, repo_id: &str) -> Option<&RepoOutcome> {
        self.outcomes.iter().find(|o| o.repo_id == repo_id)
    }

    /// Human-readable summary.
    pub fn render(&self) -> String {
        let mut out = String::new();
        let _ = writeln!(
            out,
            "pass {}: {} repos, {} succeeded, {} cache hits, {} failed, {} cancelled ({:.1}s)",
            self.pass,
            self.total,
            self.succeeded,
            self.cache_hits,
            self.failed,
            self.cancelled,
            self.duration_ms as f64 / 1000.0
        );
        for f in &self.failures {
            let _ = writeln!(out, "  FAILED {} [{}] in {}: {}", f.repo_id, f.kind, f.phase, f.reason);
        }
        out
    }
}

pub struct FleetCoordinator {
    engine: Arc<EngineContext>,
    repos: Vec<RepositoryDescriptor>,
    controllers: HashMap<String, Arc<RepoController>>,
}

impl FleetCoordinator {
    /// Repositories keep their given order; later duplicates of a name are
    /// dropped.
    pub fn new(engine: Arc<EngineContext>, repos: Vec<RepositoryDescriptor>) -> Self {
        let mut controllers = HashMap::new();
        let mut unique = Vec::with_capacity(repos.len());
        for descriptor in repos {
            if controllers.contains_key(&descriptor.name) {
                warn!(repo = %descriptor.name, "duplicate repository in fleet, skipping");
                continue;
            }
            controllers.insert(
                descriptor.name.clone(),
                Arc::new(RepoController::new(Arc::clone(&engine), descriptor.name.clone())),
            );
            unique.push(descriptor);
        }
        Self {
            engine,
            repos: unique,
            controllers,
        }
    }

    pub fn repos(&self) -> &[RepositoryDescriptor] {
        &self.repos
    }

    /// Build the request for one repository. Force flags apply to the first
    /// pass only.
    pub fn request_for(&self, descriptor: &RepositoryDescriptor, pass: u64) -> InvestigationRequest {
        let config = self.engine.config();
        let mut request = InvestigationRequest::new(descriptor.clone());
        if let Some(category) = &config.category_override {
            request.category_override = Some(category.clone());
        }
        if pass == FIRST_PASS {
            request.force = ForceFlags {
                global: config.force,
                step: config.force_step.clone(),
            };
        }
        request.model = config.model.clone();
        request
    }

    /// Run one pass over the fleet.
    ///
    /// Once `cancel` fires no further chunk starts; repositories not started
    /// are reported as cancelled.
    pub async fn run_pass(&self, pass: u64, cancel: &ShutdownSignal) -> FleetSummary {
        let started = Instant::now();
        let chunk_size = self.engine.config().chunk_size.max(1);
        let chunks: Vec<&[RepositoryDescriptor]> = self.repos.chunks(chunk_size).collect();
        obs::emit_pass_started(pass, self.repos.len(), chunks.len());

        let mut outcomes = Vec::with_capacity(self.repos.len());
        for (idx, chunk) in chunks.iter().enumerate() {
            if cancel.is_cancelled() {
                info!(pass, remaining = chunks.len() - idx, "shutdown requested, not starting further chunks");
                outcomes.extend(
                    chunks[idx..]
                        .iter()
                        .flat_map(|c| c.iter())
                        .map(|d| RepoOutcome::cancelled(&d.name, pass)),
                );
                break;
            }

            let handles: Vec<_> = chunk
                .iter()
                .map(|descriptor| {
                    let controller = Arc::clone(&self.controllers[&descriptor.name]);
                    let request = self.request_for(descriptor, pass);
                    let cancel = cancel.clone();
                    tokio::spawn(async move { controller.investigate(&request, &cancel, pass).await })
                })
                .collect();

            let mut failed = 0;
            for (descriptor, joined) in chunk.iter().zip(join_all(handles).await) {
                let outcome = joined.unwrap_or_else(|join_err| {
                    error!(repo = %descriptor.name, error = %join_err, "controller task aborted");
                    let failure = RepoFailure {
                        repo_id: descriptor.name.clone(),
                        phase: self.controllers[&descriptor.name].snapshot().phase,
                        kind: FailureKind::Internal,
                        reason: join_err.to_string(),
                        retryable: true,
                    };
                    self.controllers[&descriptor.name].record_failure(failure.clone());
                    METRICS.inc_failures();
                    RepoOutcome::failed(failure, pass)
                });
                if outcome.failure().is_some() {
                    failed += 1;
                }
                outcomes.push(outcome);
            }
            obs::emit_chunk_settled(pass, idx, chunk.len(), failed);
        }

        let summary = FleetSummary::from_outcomes(pass, outcomes, started.elapsed());
        obs::emit_pass_finished(
            pass,
            summary.succeeded,
            summary.failed,
            summary.cache_hits,
            summary.duration_ms,
        );
        METRICS.flush();
        summary
    }

    /// Run passes per `mode`, collecting every summary.
    pub async fn run(&self, mode: RunMode, cancel: &ShutdownSignal) -> Vec<FleetSummary> {
        let mut summaries = Vec::new();
        self.run_with(mode, cancel, |s| summaries.push(s.clone()))
            .await;
        summaries
    }

    /// Run passes per `mode`, handing each summary to `on_pass`. Returns the
    /// number of passes run.
    pub async fn run_with<F>(&self, mode: RunMode, cancel: &ShutdownSignal, mut on_pass: F) -> u64
    where
        F: FnMut(&FleetSummary),
    {
        let max_passes = match mode {
            RunMode::SinglePass => Some(1),
            RunMode::Daemon { max_passes } => max_passes,
        };
        let interval = self.engine.config().sleep_interval;

        let mut pass = FIRST_PASS;
        loop {
            let summary = self.run_pass(pass, cancel).await;
            on_pass(&summary);
            if cancel.is_cancelled() || max_passes.is_some_and(|max| pass >= max) {
                return pass;
            }

            info!(pass, sleep_secs = interval.as_secs(), "pass complete, sleeping");
            tokio::select! {
                _ = tokio::time::sleep(interval) => {}
                _ = cancel.cancelled() => {
                    info!(pass, "shutdown requested during sleep");
                    return pass;
                }
            }
            pass += 1;
        }
    }

    pub fn status(&self, repo_id: &str) -> Option<ControllerStatus> {
        self.controllers.get(repo_id).map(|c| c.snapshot())
    }

    /// Snapshots in repository order.
    pub fn statuses(&self) -> Vec<ControllerStatus> {
        self.repos
            .iter()
            .filter_map(|d| self.status(&d.name))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::classify::FileTree;
    use crate::controller::Phase;
    use crate::testing::{fast_config, Harness};

    fn fleet(h: &Harness, names: &[&str], chunk_size: usize) -> FleetCoordinator {
        let repos = names
            .iter()
            .map(|n| {
                let url = format!("https://github.com/acme/{n}");
                h.clone.add_repo(&url, "abc123", FileTree::from_paths(["manage.py"]));
                RepositoryDescriptor::new(*n, url)
            })
            .collect();
        let config = crate::config::FleetConfig {
            chunk_size,
            ..fast_config()
        };
        FleetCoordinator::new(h.engine(config).unwrap(), repos)
    }

    #[tokio::test]
    async fn duplicates_are_dropped() {
        let h = Harness::new();
        let coordinator = fleet(&h, &["a", "b", "a"], 2);
        assert_eq!(coordinator.repos().len(), 2);
    }

    #[tokio::test]
    async fn cancelled_before_start_runs_nothing() {
        let h = Harness::new();
        let coordinator = fleet(&h, &["a", "b", "c"], 2);
        let (trigger, signal) = crate::shutdown::shutdown_channel();
        trigger.trigger();

        let summary = coordinator.run_pass(1, &signal).await;
        assert_eq!(summary.cancelled, 3);
        assert_eq!(h.clone.resolve_calls(), 0);
    }

    #[tokio::test]
    async fn summary_counts_and_renders() {
        let h = Harness::new();
        let coordinator = fleet(&h, &["a", "b"], 2);
        h.clone.fail_clone(
            "https://github.com/acme/b",
            crate::domain::CloneError::PermissionDenied {
                url: "https://github.com/acme/b".into(),
                reason: "403".into(),
            },
        );

        let summary = coordinator.run_pass(1, &ShutdownSignal::never()).await;
        assert_eq!(summary.succeeded, 1);
        assert_eq!(summary.failed, 1);
        assert_eq!(summary.failures[0].repo_id, "b");
        assert_eq!(summary.failures[0].phase, Phase::Cloning);
        let text = summary.render();
        assert!(text.contains("1 succeeded"));
        assert!(text.contains("FAILED b [clone] in cloning"));

        let json = serde_json::to_value(&summary).unwrap();
        assert_eq!(json["failures"][0]["kind"], "clone");
        assert_eq!(coordinator.status("b").unwrap().phase, Phase::Error);
        assert!(coordinator.status("zzz").is_none());
    }

    #[tokio::test]
    async fn category_override_applies_to_every_repo() {
        let h = Harness::new();
        let repos = vec![RepositoryDescriptor::new("a", "https://github.com/acme/a").with_category("frontend")];
        let config = crate::config::FleetConfig {
            category_override: Some("infra".into()),
            force: true,
            ..fast_config()
        };
        let coordinator = FleetCoordinator::new(h.engine(config).unwrap(), repos);
        let req = coordinator.request_for(&coordinator.repos()[0], 1);
        assert_eq!(req.category_override.as_deref(), Some("infra"));
        assert!(req.force.global);
        let req = coordinator.request_for(&coordinator.repos()[0], 2);
        assert!(!req.force.global);
    }
}
