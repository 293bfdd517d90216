//! Fleet coordination: chunked concurrency, failure isolation, cancellation
//! and multi-pass runs.

use std::time::Duration;

use fleetscope_core::testing::{fast_config, Harness};
use fleetscope_core::{
    shutdown_channel, CloneError, FailureKind, FileTree, FleetConfig, FleetCoordinator,
    OutcomeStatus, Phase, ProviderError, RepositoryDescriptor, RunMode, ShutdownSignal,
};

fn url(name: &str) -> String {
    format!("https://github.com/acme/{name}")
}

fn fleet(h: &Harness, names: &[&str]) -> Vec<RepositoryDescriptor> {
    names
        .iter()
        .map(|name| {
            h.clone.add_repo(
                &url(name),
                "1111111",
                FileTree::from_paths(["main.tf", "variables.tf", "modules/vpc/main.tf"]),
            );
            RepositoryDescriptor::new(*name, url(name))
        })
        .collect()
}

const TEN: [&str; 10] = ["r0", "r1", "r2", "r3", "r4", "r5", "r6", "r7", "r8", "r9"];

/// Test: never more than `chunk_size` repositories are checked out at once.
#[tokio::test(start_paused = true)]
async fn concurrency_is_bounded_by_chunk_size() {
    let h = Harness::new();
    h.clone.set_clone_delay(Duration::from_secs(5));
    let repos = fleet(&h, &TEN);
    let config = FleetConfig {
        chunk_size: 3,
        ..fast_config()
    };
    let coordinator = FleetCoordinator::new(h.engine(config).unwrap(), repos);

    let summary = coordinator.run_pass(1, &ShutdownSignal::never()).await;

    assert_eq!(summary.total, 10);
    assert_eq!(summary.succeeded, 10);
    assert!(h.clone.max_in_flight() <= 3);
    assert!(h.clone.max_in_flight() > 1, "chunks should run concurrently");
    assert_eq!(h.clone.in_flight(), 0);
    assert_eq!(h.clone.release_calls(), 10);
}

/// Test: one repository panicking does not disturb the rest of its chunk.
#[tokio::test]
async fn panicking_repository_is_isolated() {
    let h = Harness::new();
    let repos = fleet(&h, &["good-a", "bad", "good-b"]);
    h.clone.panic_on_clone(&url("bad"));
    let coordinator = FleetCoordinator::new(h.engine(fast_config()).unwrap(), repos);

    let summary = coordinator.run_pass(1, &ShutdownSignal::never()).await;

    assert_eq!(summary.succeeded, 2);
    assert_eq!(summary.failed, 1);
    let failure = summary.outcome("bad").unwrap().failure().unwrap();
    assert_eq!(failure.kind, FailureKind::Internal);
    assert!(failure.retryable);
    assert_eq!(
        coordinator.status("bad").unwrap().failure.unwrap().kind,
        FailureKind::Internal
    );
    assert_eq!(h.publisher.published_for("good-a").len(), 1);
    assert_eq!(h.publisher.published_for("good-b").len(), 1);
    assert!(summary.render().contains("FAILED bad [internal]"));
}

/// Test: ordinary failures are reported per repository and every checkout
/// is released.
#[tokio::test]
async fn mixed_failures_are_contained_and_cleaned_up() {
    let h = Harness::new();
    let repos = fleet(&h, &["alpha", "beta", "gone"]);
    h.analysis
        .fail("overview", ProviderError::ContentPolicy("refused".into()));
    h.clone.fail_resolve(
        &url("gone"),
        CloneError::BranchNotFound {
            url: url("gone"),
            branch: "main".into(),
        },
    );
    let coordinator = FleetCoordinator::new(h.engine(fast_config()).unwrap(), repos);

    let summary = coordinator.run_pass(1, &ShutdownSignal::never()).await;

    assert_eq!(summary.failed, 3);
    assert_eq!(summary.failures.len(), 3);
    assert_eq!(
        summary.outcome("gone").unwrap().failure().unwrap().kind,
        FailureKind::Clone
    );
    for name in ["alpha", "beta"] {
        let failure = summary.outcome(name).unwrap().failure().unwrap();
        assert_eq!(failure.kind, FailureKind::ContentPolicy);
        assert_eq!(failure.phase, Phase::PipelineExecution);
    }
    // one refused call each, never retried
    assert_eq!(h.analysis.total_calls(), 2);
    assert_eq!(h.clone.in_flight(), 0);
    assert_eq!(h.clone.release_calls(), 2);
}

/// Test: a cancelled fleet starts no new chunks and reports the remainder
/// as cancelled.
#[tokio::test]
async fn cancellation_stops_further_chunks() {
    let h = Harness::new();
    let repos = fleet(&h, &TEN);
    let (trigger, signal) = shutdown_channel();
    // fires during the first chunk
    h.analysis.cancel_after(1, trigger);
    let config = FleetConfig {
        chunk_size: 2,
        ..fast_config()
    };
    let coordinator = FleetCoordinator::new(h.engine(config).unwrap(), repos);

    let summary = coordinator.run_pass(1, &signal).await;

    assert_eq!(summary.total, 10);
    assert_eq!(summary.cancelled, 10);
    assert_eq!(summary.succeeded, 0);
    assert!(h.clone.clone_calls() <= 2);
    assert_eq!(h.clone.in_flight(), 0);
    assert_eq!(
        summary.outcome("r9").unwrap().status,
        OutcomeStatus::Cancelled
    );
}

/// Test: force applies to the first daemon pass only; the second pass is
/// served from cache.
#[tokio::test(start_paused = true)]
async fn force_is_not_sticky_across_passes() {
    let h = Harness::new();
    let repos = fleet(&h, &["tf-a", "tf-b"]);
    let config = FleetConfig {
        force: true,
        ..fast_config()
    };
    let coordinator = FleetCoordinator::new(h.engine(config).unwrap(), repos);

    let summaries = coordinator
        .run(
            RunMode::Daemon {
                max_passes: Some(2),
            },
            &ShutdownSignal::never(),
        )
        .await;

    assert_eq!(summaries.len(), 2);
    assert_eq!(summaries[0].pass, 1);
    assert_eq!(summaries[0].succeeded, 2);
    assert_eq!(summaries[0].cache_hits, 0);
    assert_eq!(summaries[1].pass, 2);
    assert_eq!(summaries[1].cache_hits, 2);
    assert_eq!(h.clone.clone_calls(), 2);
    assert_eq!(h.analysis.total_calls(), 28);
}

/// Test: a shutdown during the inter-pass sleep ends the daemon without
/// starting another pass.
#[tokio::test(start_paused = true)]
async fn shutdown_during_sleep_ends_daemon() {
    let h = Harness::new();
    let repos = fleet(&h, &["tf-a"]);
    let coordinator = FleetCoordinator::new(h.engine(fast_config()).unwrap(), repos);
    let (trigger, signal) = shutdown_channel();
    let mut seen = Vec::new();

    let (passes, ()) = tokio::join!(
        coordinator.run_with(RunMode::Daemon { max_passes: None }, &signal, |summary| {
            seen.push(summary.pass)
        }),
        async {
            // well inside the default six hour sleep
            tokio::time::sleep(Duration::from_secs(3600)).await;
            trigger.trigger();
        }
    );

    assert_eq!(passes, 1);
    assert_eq!(seen, vec![1]);
}

/// Test: every controller ends a pass in a terminal phase.
#[tokio::test]
async fn statuses_are_terminal_after_a_pass() {
    let h = Harness::new();
    let repos = fleet(&h, &["a", "b", "c"]);
    h.clone.fail_clone(
        &url("b"),
        CloneError::PermissionDenied {
            url: url("b"),
            reason: "403".into(),
        },
    );
    let coordinator = FleetCoordinator::new(h.engine(fast_config()).unwrap(), repos);

    coordinator.run_pass(1, &ShutdownSignal::never()).await;

    let statuses = coordinator.statuses();
    assert_eq!(statuses.len(), 3);
    assert!(statuses.iter().all(|s| s.phase.is_terminal()));
    assert_eq!(statuses[1].phase, Phase::Error);
    assert_eq!(statuses[0].phase, Phase::Done);
}
