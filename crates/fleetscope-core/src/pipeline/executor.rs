//! Sequential, context-chaining pipeline execution.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use fleetscope_state::{StepResult, TokenUsage};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use super::registry::PromptPipeline;
use super::sentinel::is_not_applicable;
use crate::cache::{CacheKey, CacheManager};
use crate::config::{CachePolicy, RetryPolicy};
use crate::domain::{FleetError, ModelConfig};
use crate::metrics::METRICS;
use crate::obs;
use crate::providers::{AnalysisProvider, CompletionRequest};
use crate::retry::retry_with_backoff;
use crate::shutdown::ShutdownSignal;

/// Repository-level inputs shared by every step.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct InitialContext {
    pub repo_structure: String,
    pub dependency_manifest: String,
}

/// Where completed steps are persisted and which stored results may be reused.
pub struct ExecutionScope<'a> {
    pub cache: &'a CacheManager,
    pub key: &'a CacheKey,
    /// Stored results by step id; reused when the template version matches.
    pub reusable: &'a BTreeMap<String, StepResult>,
    /// Skip step persistence (the cache is already known to be unavailable).
    pub uncached: bool,
}

#[derive(Debug, Clone, Copy)]
pub enum StepEvent<'a> {
    Started {
        step_id: &'a str,
        index: usize,
        total: usize,
    },
    Reused {
        result: &'a StepResult,
        index: usize,
        total: usize,
    },
    Completed {
        result: &'a StepResult,
        index: usize,
        total: usize,
    },
    SkippedOptional {
        step_id: &'a str,
        index: usize,
        total: usize,
        reason: &'a str,
    },
}

/// Observer of step progress. Called inline; keep it cheap.
#[async_trait]
pub trait StepListener: Send + Sync {
    async fn on_event(&self, event: StepEvent<'_>);
}

pub struct NoopListener;

#[async_trait]
impl StepListener for NoopListener {
    async fn on_event(&self, _event: StepEvent<'_>) {}
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExecutionReport {
    /// Recorded results in pipeline order, reused ones included.
    pub results: Vec<StepResult>,
    pub executed: usize,
    pub reused: usize,
    pub skipped_optional: Vec<String>,
    pub usage: TokenUsage,
    /// A step write failed and was skipped under the fail-open policy.
    pub degraded: bool,
}

/// Concatenate applicable dependency results in declared order.
///
/// Dependencies without a recorded result (skipped optional steps) and
/// not-applicable results contribute nothing.
pub fn aggregate_context(depends_on: &[String], results: &[StepResult]) -> String {
    depends_on
        .iter()
        .filter_map(|dep| results.iter().find(|r| &r.step_id == dep))
        .filter(|r| r.applicable)
        .map(|r| format!("## {}\n\n{}", r.step_id, r.content.trim()))
        .collect::<Vec<_>>()
        .join("\n\n")
}

pub struct PipelineExecutor {
    provider: Arc<dyn AnalysisProvider>,
    retry: RetryPolicy,
    model: ModelConfig,
}

impl PipelineExecutor {
    pub fn new(provider: Arc<dyn AnalysisProvider>, retry: RetryPolicy, model: ModelConfig) -> Self {
        Self {
            provider,
            retry,
            model,
        }
    }

    pub fn with_model(&self, model: ModelConfig) -> Self {
        Self {
            provider: Arc::clone(&self.provider),
            retry: self.retry.clone(),
            model,
        }
    }

    /// Run every step of `pipeline` in order.
    ///
    /// Cancellation is honoured between steps only. A required step that
    /// fails after retries fails the pipeline; completed steps stay
    /// persisted for diagnostics and later reuse.
    pub async fn execute(
        &self,
        pipeline: &PromptPipeline,
        initial: &InitialContext,
        scope: &ExecutionScope<'_>,
        listener: &dyn StepListener,
        cancel: &ShutdownSignal,
    ) -> Result<ExecutionReport, FleetError> {
        let total = pipeline.len();
        let mut report = ExecutionReport::default();

        for (idx, resolved) in pipeline.steps.iter().enumerate() {
            if cancel.is_cancelled() {
                debug!(step = %resolved.id(), "cancelled before step");
                return Err(FleetError::Cancelled);
            }
            let index = idx + 1;
            let step_id = resolved.id();

            if let Some(stored) = scope
                .reusable
                .get(step_id)
                .filter(|r| r.template_version == resolved.template.version)
            {
                METRICS.inc_steps_reused();
                obs::emit_step_completed(step_id, index, total, true, stored.applicable);
                listener
                    .on_event(StepEvent::Reused {
                        result: stored,
                        index,
                        total,
                    })
                    .await;
                report.reused += 1;
                report.results.push(stored.clone());
                continue;
            }

            listener
                .on_event(StepEvent::Started {
                    step_id,
                    index,
                    total,
                })
                .await;

            let context = aggregate_context(&resolved.step.depends_on, &report.results);
            let request = CompletionRequest {
                step_id,
                template: &resolved.template.body,
                context: &context,
                repo_structure: &initial.repo_structure,
                dependency_manifest: &initial.dependency_manifest,
                model: &self.model,
            };
            let operation = format!("analysis.{step_id}");
            let completion =
                match retry_with_backoff(&self.retry, &operation, || self.provider.complete(request))
                    .await
                {
                    Ok(c) => c,
                    Err(err) if !resolved.step.required => {
                        let reason = err.to_string();
                        warn!(step = %step_id, error = %reason, "optional step failed, skipping");
                        listener
                            .on_event(StepEvent::SkippedOptional {
                                step_id,
                                index,
                                total,
                                reason: &reason,
                            })
                            .await;
                        report.skipped_optional.push(step_id.to_string());
                        continue;
                    }
                    Err(err) => {
                        return Err(FleetError::Analysis {
                            step: step_id.to_string(),
                            source: err,
                        })
                    }
                };

            let result = StepResult {
                step_id: step_id.to_string(),
                applicable: !is_not_applicable(&completion.content),
                content: completion.content,
                generated_at: Utc::now(),
                template_version: resolved.template.version,
                usage: completion.usage,
            };

            if !scope.uncached {
                if let Err(err) = scope.cache.persist_step(scope.key, &result).await {
                    match scope.cache.policy() {
                        CachePolicy::FailOpen => {
                            obs::emit_degraded_write(&scope.key.repo_id, "step", &err);
                            report.degraded = true;
                        }
                        CachePolicy::FailClosed => return Err(FleetError::Persistence(err)),
                    }
                }
            }

            METRICS.inc_steps_executed();
            obs::emit_step_completed(step_id, index, total, false, result.applicable);
            listener
                .on_event(StepEvent::Completed {
                    result: &result,
                    index,
                    total,
                })
                .await;

            report.usage.input_tokens += result.usage.input_tokens;
            report.usage.output_tokens += result.usage.output_tokens;
            report.executed += 1;
            report.results.push(result);
        }

        Ok(report)
    }
}
