//! End-to-end investigations of single repositories against scripted
//! collaborators: classification, step execution, caching and invalidation.

use std::sync::Arc;

use fleetscope_core::testing::{fast_config, Harness};
use fleetscope_core::{
    AnalysisStore, CachePolicy, Category, CloneError, FailureKind, FileTree, FleetConfig,
    ForceFlags, InvalidationReason, InvestigationRequest, OutcomeStatus, Phase, RecordSlot,
    RepoController, RepositoryDescriptor, ShutdownSignal, TypeClassifier,
};
use fleetscope_state::fakes::FaultyStore;

const IS_ODD: &str = "https://github.com/jonschlinkert/is-odd";
const API: &str = "https://github.com/acme/api";

fn is_odd_tree() -> FileTree {
    FileTree::from_paths(["index.js", "LICENSE", "README.md"]).with_content(
        "package.json",
        r#"{"name":"is-odd","files":["index.js"],"dependencies":{"is-number":"^6.0.0"}}"#,
    )
}

fn is_odd_request() -> InvestigationRequest {
    InvestigationRequest::new(RepositoryDescriptor::new("is-odd", IS_ODD))
}

fn harness() -> Harness {
    let h = Harness::new();
    h.clone.add_repo(IS_ODD, "c0ffee1", is_odd_tree());
    h.clone.add_repo(
        API,
        "abc1234",
        FileTree::from_paths(["manage.py", "app/views.py", "app/models.py"]),
    );
    h
}

/// Test: an undeclared npm package classifies as a library and runs the
/// twelve base steps plus both library steps.
#[tokio::test]
async fn undeclared_npm_package_runs_library_pipeline() {
    let h = harness();
    let controller = RepoController::new(h.engine(fast_config()).unwrap(), "is-odd");

    let outcome = controller
        .investigate(&is_odd_request(), &ShutdownSignal::never(), 1)
        .await;

    assert_eq!(outcome.status, OutcomeStatus::Succeeded);
    assert_eq!(outcome.category, Some(Category::Libraries));
    assert_eq!(outcome.steps_executed, 14);
    assert_eq!(h.analysis.total_calls(), 14);
    assert_eq!(h.analysis.calls_for("public_api"), 1);
    assert_eq!(h.analysis.calls_for("versioning_and_compat"), 1);
    assert_eq!(h.analysis.calls_for("service_architecture"), 0);

    let published = h.publisher.published_for("is-odd");
    assert_eq!(published.len(), 1);
    assert_eq!(published[0].category, "libraries");
    assert_eq!(published[0].commit_id, "c0ffee1");
    assert_eq!(published[0].sections.len(), 14);
    assert_eq!(published[0].sections[0].step_id, "overview");
}

/// Test: a declared category skips scoring.
#[tokio::test]
async fn declared_backend_runs_backend_pipeline() {
    let h = harness();
    // the tree alone would not score as backend
    h.clone.add_repo(API, "abc1234", FileTree::from_paths(["README.md"]));
    let controller = RepoController::new(h.engine(fast_config()).unwrap(), "api");
    let request =
        InvestigationRequest::new(RepositoryDescriptor::new("api", API).with_category("backend"));

    let outcome = controller
        .investigate(&request, &ShutdownSignal::never(), 1)
        .await;

    assert_eq!(outcome.category, Some(Category::Backend));
    assert_eq!(outcome.steps_executed, 14);
    assert_eq!(h.analysis.calls_for("service_architecture"), 1);
    assert_eq!(h.analysis.calls_for("data_flow"), 1);
}

/// Test: steps run in dependency order and each sees its dependencies'
/// output as context.
#[tokio::test]
async fn steps_run_after_their_dependencies() {
    let h = harness();
    h.analysis.respond("overview", "A tiny predicate library.");
    let engine = h.engine(fast_config()).unwrap();
    let pipeline = engine.registry().build_pipeline(Category::Libraries).unwrap();
    let controller = RepoController::new(Arc::clone(&engine), "is-odd");

    controller
        .investigate(&is_odd_request(), &ShutdownSignal::never(), 1)
        .await;

    let order = h.analysis.call_order();
    assert_eq!(order.first().map(String::as_str), Some("overview"));
    for step in &pipeline.steps {
        let at = order.iter().position(|s| s == step.id()).unwrap();
        for dep in &step.step.depends_on {
            let dep_at = order.iter().position(|s| s == dep).unwrap();
            assert!(dep_at < at, "{dep} must run before {}", step.id());
        }
    }

    let contexts = h.analysis.contexts_for("dependencies");
    assert_eq!(contexts.len(), 1);
    assert!(contexts[0].contains("A tiny predicate library."));
}

/// Test: an unchanged repository is served from cache with no clone and no
/// analysis calls.
#[tokio::test]
async fn unchanged_repository_is_a_cache_hit() {
    let h = harness();
    let controller = RepoController::new(h.engine(fast_config()).unwrap(), "is-odd");
    let first = controller
        .investigate(&is_odd_request(), &ShutdownSignal::never(), 1)
        .await;
    let record = h
        .store
        .get_record(&RecordSlot::new("is-odd", "main"))
        .await
        .unwrap()
        .unwrap();
    let clones = h.clone.clone_calls();
    let calls = h.analysis.total_calls();

    let second = controller
        .investigate(&is_odd_request(), &ShutdownSignal::never(), 2)
        .await;

    assert_eq!(first.status, OutcomeStatus::Succeeded);
    assert_eq!(second.status, OutcomeStatus::CacheHit);
    assert!(second.is_cache_hit());
    assert_eq!(second.reason, Some(InvalidationReason::Ok));
    assert_eq!(second.steps_executed, 0);
    assert_eq!(h.clone.clone_calls(), clones);
    assert_eq!(h.analysis.total_calls(), calls);
    // a hit republishes nothing and leaves the record untouched
    assert_eq!(h.publisher.published_for("is-odd").len(), 1);
    let after = h
        .store
        .get_record(&RecordSlot::new("is-odd", "main"))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(after, record);
    assert_eq!(controller.snapshot().phase, Phase::Done);
}

/// Test: a new head commit invalidates the record and every step.
#[tokio::test]
async fn new_commit_reexecutes_everything() {
    let h = harness();
    let controller = RepoController::new(h.engine(fast_config()).unwrap(), "is-odd");
    controller
        .investigate(&is_odd_request(), &ShutdownSignal::never(), 1)
        .await;

    h.clone.set_head(IS_ODD, "d00d5e2");
    let outcome = controller
        .investigate(&is_odd_request(), &ShutdownSignal::never(), 2)
        .await;

    assert_eq!(outcome.status, OutcomeStatus::Succeeded);
    assert_eq!(outcome.reason, Some(InvalidationReason::CommitChanged));
    assert_eq!(outcome.steps_executed, 14);
    assert_eq!(outcome.steps_reused, 0);
    assert_eq!(outcome.commit_id.as_deref(), Some("d00d5e2"));
    assert_eq!(h.analysis.total_calls(), 28);

    let published = h.publisher.published_for("is-odd");
    assert_eq!(published.len(), 2);
    assert_eq!(published[1].commit_id, "d00d5e2");
}

/// Test: a forced investigation never reads the cache, twice in a row.
#[tokio::test]
async fn global_force_reexecutes_every_time() {
    let h = harness();
    let controller = RepoController::new(h.engine(fast_config()).unwrap(), "is-odd");
    let mut request = is_odd_request();
    request.force = ForceFlags {
        global: true,
        step: None,
    };

    for pass in 1..=2 {
        let outcome = controller
            .investigate(&request, &ShutdownSignal::never(), pass)
            .await;
        assert_eq!(outcome.status, OutcomeStatus::Succeeded);
        assert_eq!(outcome.reason, Some(InvalidationReason::Forced));
        assert_eq!(outcome.steps_executed, 14);
        assert_eq!(outcome.steps_reused, 0);
    }
    assert_eq!(h.analysis.total_calls(), 28);
    assert_eq!(h.clone.clone_calls(), 2);
}

/// Test: forcing one step re-runs it and reuses the rest.
#[tokio::test]
async fn step_force_reuses_other_steps() {
    let h = harness();
    let controller = RepoController::new(h.engine(fast_config()).unwrap(), "is-odd");
    controller
        .investigate(&is_odd_request(), &ShutdownSignal::never(), 1)
        .await;

    h.analysis.respond("public_api", "isOdd(n): boolean");
    let mut request = is_odd_request();
    request.force = ForceFlags {
        global: false,
        step: Some("public_api".into()),
    };
    let outcome = controller
        .investigate(&request, &ShutdownSignal::never(), 2)
        .await;

    assert_eq!(outcome.reason, Some(InvalidationReason::StepForced));
    assert_eq!(outcome.steps_executed, 1);
    assert_eq!(outcome.steps_reused, 13);
    assert_eq!(h.analysis.calls_for("public_api"), 2);
    assert_eq!(h.analysis.calls_for("overview"), 1);

    let latest = h.publisher.published_for("is-odd").pop().unwrap();
    let section = latest
        .sections
        .iter()
        .find(|s| s.step_id == "public_api")
        .unwrap();
    assert_eq!(section.content, "isOdd(n): boolean");
}

/// Test: a not-applicable answer is recorded and published, but dependent
/// steps do not see it in their context.
#[tokio::test]
async fn not_applicable_answer_is_published_but_not_propagated() {
    let h = harness();
    h.analysis.respond("database", "Not applicable.");
    let controller = RepoController::new(h.engine(fast_config()).unwrap(), "is-odd");

    let outcome = controller
        .investigate(&is_odd_request(), &ShutdownSignal::never(), 1)
        .await;

    assert_eq!(outcome.status, OutcomeStatus::Succeeded);
    let published = h.publisher.published_for("is-odd").pop().unwrap();
    assert_eq!(published.sections.len(), 14);
    let database = published
        .sections
        .iter()
        .find(|s| s.step_id == "database")
        .unwrap();
    assert_eq!(database.content, "Not applicable.");
    assert!(!database.applicable);

    // security depends on database
    let security_context = h.analysis.contexts_for("security").pop().unwrap();
    assert!(!security_context.contains("## database"));
    assert!(security_context.contains("## dependencies"));

    let record = h
        .store
        .get_record(&RecordSlot::new("is-odd", "main"))
        .await
        .unwrap()
        .unwrap();
    assert!(!record.step("database").unwrap().applicable);
}

/// Test: the same tree always classifies the same way.
#[test]
fn classification_is_deterministic() {
    let classifier = TypeClassifier::new();
    let first = classifier.classify(&is_odd_tree(), None).unwrap();
    for _ in 0..5 {
        let again = classifier.classify(&is_odd_tree(), None).unwrap();
        assert_eq!(again.category, first.category);
        assert_eq!(again.score.confidence, first.score.confidence);
    }
    assert_eq!(first.category, Category::Libraries);
}

/// Test: with fail-closed caching a broken store fails the step write and
/// the repository is still cleaned up.
#[tokio::test]
async fn fail_closed_write_failure_fails_the_run() {
    let store = Arc::new(FaultyStore::new());
    store.set_fail_writes(true);
    let h = Harness::with_store(store.clone());
    h.clone.add_repo(IS_ODD, "c0ffee1", is_odd_tree());
    let controller = RepoController::new(h.engine(fast_config()).unwrap(), "is-odd");

    let outcome = controller
        .investigate(&is_odd_request(), &ShutdownSignal::never(), 1)
        .await;

    let failure = outcome.failure().unwrap();
    assert_eq!(failure.kind, FailureKind::Persistence);
    assert_eq!(failure.phase, Phase::PipelineExecution);
    assert_eq!(h.analysis.total_calls(), 1);
    assert_eq!(h.clone.release_calls(), 1);
    assert!(h.publisher.published().is_empty());
}

/// Test: with fail-open caching the same broken store only degrades the run.
#[tokio::test]
async fn fail_open_write_failure_still_publishes() {
    let store = Arc::new(FaultyStore::new());
    store.set_fail_writes(true);
    let h = Harness::with_store(store.clone());
    h.clone.add_repo(IS_ODD, "c0ffee1", is_odd_tree());
    let config = FleetConfig {
        cache_policy: CachePolicy::FailOpen,
        ..fast_config()
    };
    let controller = RepoController::new(h.engine(config).unwrap(), "is-odd");

    let outcome = controller
        .investigate(&is_odd_request(), &ShutdownSignal::never(), 1)
        .await;
    assert_eq!(outcome.status, OutcomeStatus::Succeeded);
    assert!(outcome.uncached);
    assert_eq!(h.publisher.published_for("is-odd").len(), 1);

    // nothing was cached, so the store recovering means another full run
    store.set_fail_writes(false);
    let outcome = controller
        .investigate(&is_odd_request(), &ShutdownSignal::never(), 2)
        .await;
    assert_eq!(outcome.reason, Some(InvalidationReason::NoRecord));
    assert_eq!(outcome.steps_executed, 14);
}

/// Test: a transient clone failure is retried, then reported as retryable.
#[tokio::test]
async fn transient_clone_failure_is_retried_then_reported() {
    let h = harness();
    h.clone
        .fail_clone(IS_ODD, CloneError::Network("connection reset".into()));
    let controller = RepoController::new(h.engine(fast_config()).unwrap(), "is-odd");

    let outcome = controller
        .investigate(&is_odd_request(), &ShutdownSignal::never(), 1)
        .await;

    let failure = outcome.failure().unwrap();
    assert_eq!(failure.kind, FailureKind::Clone);
    assert_eq!(failure.phase, Phase::Cloning);
    assert!(failure.retryable);
    assert_eq!(h.clone.clone_calls_for(IS_ODD), 2);
    assert_eq!(h.clone.in_flight(), 0);
    assert_eq!(h.analysis.total_calls(), 0);
}
