//! End-to-end backfill scenarios over the in-memory cluster pair.
//!
//! Validates:
//! 1. S=10, N=6 yields exactly 60 target documents with unique derived ids
//! 2. S=100, N=1 converges to 100 and doc_50 matches its source
//! 3. Re-running over an unchanged target does not change the count
//! 4. stop() twice succeeds without side effects
//! 5. Thirty changing polls end in TimedOut, not an error
//! 6. Scaling up and down mid-run loses no documents
//! 7. A stopped job resumes and completes
//! 8. A snapshot still being written is never handed to the scheduler
//! 9. A snapshot backs one live job until that job is stopped and archived

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use backfill_core::Error;
use backfill_core::clock::{ManualTicker, TokioTicker};
use backfill_core::cluster::{ClusterClient, ClusterFuture, ClusterRole, MemoryCluster};
use backfill_core::config::{Config, SnapshotConfig};
use backfill_core::context::{RunContext, RunPlan, RunVerdict};
use backfill_core::error::SnapshotError;
use backfill_core::progress::{
    ClusterCountProbe, CountProbe, ProgressTracker, TrackerConfig, TrackerState,
};
use backfill_core::retry::RetryPolicy;
use backfill_core::scheduler::{
    BackfillControl, BackfillScheduler, JobOptions, JobState, ScheduledBackfill,
};
use backfill_core::snapshot::{MemorySnapshotRepository, SnapshotControl, SnapshotCoordinator};
use backfill_core::transform::TransformSpec;
use backfill_core::verify::{SYSTEM_FIELDS, compare_documents};

// =============================================================================
// Helpers
// =============================================================================

fn test_config() -> Config {
    let mut config = Config::default();
    config.snapshot.poll_interval_ms = 10;
    config.backfill.batch_size = 8;
    config.backfill.units = 2;
    config
}

fn fast_tracker() -> TrackerConfig {
    TrackerConfig {
        interval: Duration::from_millis(20),
        stability_samples: 3,
        max_ticks: 500,
    }
}

fn plan(transform: TransformSpec, units: u32) -> RunPlan {
    RunPlan {
        transform,
        units,
        tracker: fast_tracker(),
        ..RunPlan::default()
    }
}

fn job_options(transform: TransformSpec, units: u32) -> JobOptions {
    JobOptions {
        transform,
        batch_size: 5,
        initial_units: units,
        idle_poll: Duration::from_millis(5),
        retry: RetryPolicy::new(
            Duration::from_millis(1),
            Duration::from_millis(5),
            2.0,
            0.0,
            Some(3),
        ),
        ..JobOptions::default()
    }
}

async fn seeded(index: &str, docs: u64) -> Arc<MemoryCluster> {
    let cluster = Arc::new(MemoryCluster::new());
    cluster.seed_source(index, docs).await.unwrap();
    cluster
}

async fn durable_snapshot(cluster: &Arc<MemoryCluster>, shards: u32) -> Arc<SnapshotCoordinator> {
    let repo = Arc::new(MemorySnapshotRepository::new(Arc::clone(cluster), shards));
    let coordinator = Arc::new(SnapshotCoordinator::new(
        repo,
        SnapshotConfig {
            poll_interval_ms: 5,
            ..SnapshotConfig::default()
        },
    ));
    coordinator.create(true).await.into_result("snapshot create").unwrap();
    coordinator
}

/// Poll the target until the count is stable at `expected` or give up.
async fn converge(cluster: &Arc<MemoryCluster>, index: &str, expected: u64) -> u64 {
    let probe = Arc::new(ClusterCountProbe::new(cluster.clone(), ClusterRole::Target));
    let mut tracker =
        ProgressTracker::new(index, probe, fast_tracker()).with_expected_count(expected);
    let outcome = tracker.run(&mut TokioTicker::new()).await.unwrap();
    assert_eq!(outcome.state, TrackerState::Stable, "never stabilized");
    outcome.final_count
}

// =============================================================================
// Scenarios
// =============================================================================

#[tokio::test]
async fn multiplier_six_yields_sixty_traceable_documents() {
    let cluster = seeded("geonames", 10).await;
    let ctx = RunContext::in_memory(cluster.clone(), &test_config());

    let report = ctx
        .run(&plan(TransformSpec::multiply(6).unwrap(), 3), &mut TokioTicker::new())
        .await
        .unwrap();
    assert_eq!(report.verdict, RunVerdict::Converged);
    assert_eq!(report.tracking["geonames"].final_count, 60);

    let target = cluster
        .documents(ClusterRole::Target, "geonames")
        .await
        .unwrap();
    let ids: BTreeSet<String> = target.iter().map(|d| d.id.clone()).collect();
    assert_eq!(ids.len(), 60);

    let spec = TransformSpec::multiply(6).unwrap();
    let expected: BTreeSet<String> = (0..10)
        .flat_map(|s| {
            let spec = spec.clone();
            (0..6).map(move |copy| spec.derived_id(&format!("doc_{s}"), copy))
        })
        .collect();
    assert_eq!(ids, expected);
}

#[tokio::test]
async fn identity_copy_matches_source() {
    let cluster = seeded("geonames", 100).await;
    let ctx = RunContext::in_memory(cluster.clone(), &test_config());
    let mut run = plan(TransformSpec::Identity, 2);
    run.sample_ids = vec!["doc_50".to_string()];

    let report = ctx.run(&run, &mut TokioTicker::new()).await.unwrap();
    assert_eq!(report.verdict, RunVerdict::Converged);
    report.check().unwrap();
    assert_eq!(
        cluster.count(ClusterRole::Target, "geonames").await.unwrap(),
        100
    );

    let source = cluster
        .get_document(ClusterRole::Source, "geonames", "doc_50")
        .await
        .unwrap()
        .unwrap();
    let target = cluster
        .get_document(ClusterRole::Target, "geonames", "doc_50")
        .await
        .unwrap()
        .unwrap();
    assert!(compare_documents(&source, &target, SYSTEM_FIELDS).is_empty());
    assert_eq!(source.source, target.source);
}

#[tokio::test]
async fn rerun_without_clearing_is_idempotent() {
    let cluster = seeded("geonames", 25).await;
    let first = RunContext::in_memory(cluster.clone(), &test_config());
    first
        .run(&plan(TransformSpec::multiply(4).unwrap(), 2), &mut TokioTicker::new())
        .await
        .unwrap();
    assert_eq!(cluster.count(ClusterRole::Target, "geonames").await.unwrap(), 100);

    let second = RunContext::in_memory(cluster.clone(), &test_config());
    let mut again = plan(TransformSpec::multiply(4).unwrap(), 3);
    again.prepare_target = false;
    let report = second.run(&again, &mut TokioTicker::new()).await.unwrap();

    assert_eq!(report.verdict, RunVerdict::Converged);
    assert_eq!(cluster.count(ClusterRole::Target, "geonames").await.unwrap(), 100);
}

#[tokio::test]
async fn one_live_job_per_snapshot_until_archived() {
    let cluster = seeded("geonames", 12).await;
    let snapshots = durable_snapshot(&cluster, 2).await;
    let scheduler = Arc::new(BackfillScheduler::new(cluster.clone()));
    let backfill = ScheduledBackfill::new(
        Arc::clone(&scheduler),
        Arc::clone(&snapshots),
        job_options(TransformSpec::Identity, 1),
    );
    assert!(backfill.create().await.success);

    let snapshot = snapshots.handle().await.unwrap();
    let err = scheduler
        .create(Arc::clone(&snapshot), JobOptions::default())
        .await
        .unwrap_err();
    assert!(err.to_string().contains("already exists"), "{err}");

    // Archiving a running job is refused and leaves it in place.
    assert!(backfill.start().await.success);
    let refused = backfill.archive().await;
    assert!(!refused.success);
    assert!(refused.error.unwrap().contains("stop it before archiving"));

    converge(&cluster, "geonames", 12).await;
    assert!(backfill.stop().await.success);
    let archive = backfill.archive().await.into_value("archive").unwrap();
    assert_eq!(archive.summary().completed, archive.summary().total);
    assert_eq!(archive.documents_written, 12);

    // The job is gone: stop is a no-op again and the snapshot is free.
    assert!(backfill.stop().await.success);
    assert!(backfill.job().await.is_none());
    scheduler.create(snapshot, JobOptions::default()).await.unwrap();
}

#[tokio::test]
async fn stop_twice_has_no_side_effects() {
    let cluster = seeded("geonames", 30).await;
    let snapshots = durable_snapshot(&cluster, 3).await;
    let scheduler = Arc::new(BackfillScheduler::new(cluster.clone()));
    let backfill = ScheduledBackfill::new(
        scheduler,
        snapshots,
        job_options(TransformSpec::Identity, 2),
    );

    assert!(backfill.create().await.success);
    assert!(backfill.start().await.success);
    converge(&cluster, "geonames", 30).await;

    assert!(backfill.stop().await.success);
    let first = backfill.status().await.into_value("status").unwrap();
    let writes = cluster.bulk_calls();
    assert!(backfill.stop().await.success);
    let second = backfill.status().await.into_value("status").unwrap();

    assert_eq!(first, second);
    assert_eq!(second.state, JobState::Stopped);
    assert_eq!(cluster.bulk_calls(), writes);
}

/// Each poll returns a new, larger count.
struct ClimbingProbe(AtomicU64);

impl CountProbe for ClimbingProbe {
    fn count(&self, _index: &str) -> ClusterFuture<'_, u64> {
        let next = self.0.fetch_add(7, Ordering::SeqCst) + 7;
        Box::pin(async move { Ok(next) })
    }
}

#[tokio::test]
async fn changing_counts_time_out_without_error() {
    let probe = Arc::new(ClimbingProbe(AtomicU64::new(0)));
    let config = TrackerConfig {
        interval: Duration::from_secs(30),
        stability_samples: 3,
        max_ticks: 30,
    };
    let mut tracker = ProgressTracker::new("geonames", probe.clone(), config);
    let mut ticker = ManualTicker::new();

    let outcome = tracker.run(&mut ticker).await.unwrap();
    assert_eq!(outcome.state, TrackerState::TimedOut);
    assert!(!outcome.is_stable());
    assert_eq!(outcome.ticks, 30);
    assert_eq!(outcome.samples.len(), 30);
    assert_eq!(probe.0.load(Ordering::SeqCst), 30 * 7);
}

#[tokio::test]
async fn scaling_mid_run_loses_nothing() {
    let cluster = seeded("geonames", 200).await;
    let snapshots = durable_snapshot(&cluster, 8).await;
    let scheduler = BackfillScheduler::new(cluster.clone());
    let snapshot = snapshots.handle().await.unwrap();
    let job = scheduler
        .create(snapshot, job_options(TransformSpec::multiply(3).unwrap(), 1))
        .await
        .unwrap();

    scheduler.start(&job).await.unwrap();
    scheduler.scale(&job, 5).await.unwrap();
    assert_eq!(
        scheduler.status(&job).await.unwrap().state,
        JobState::Scaled { units: 5 }
    );
    scheduler.scale(&job, 2).await.unwrap();

    assert_eq!(converge(&cluster, "geonames", 600).await, 600);
    scheduler.stop(&job).await.unwrap();

    let status = scheduler.status(&job).await.unwrap();
    assert_eq!(status.shards.completed, status.shards.total);
    assert!(status.unit_errors.is_empty());
    assert_eq!(status.documents_read, 200);
    assert_eq!(status.live_units, 0);
}

#[tokio::test]
async fn stopped_job_resumes_to_completion() {
    let cluster = seeded("geonames", 150).await;
    let snapshots = durable_snapshot(&cluster, 6).await;
    let scheduler = BackfillScheduler::new(cluster.clone());
    let job = scheduler
        .create(
            snapshots.handle().await.unwrap(),
            job_options(TransformSpec::multiply(2).unwrap(), 3),
        )
        .await
        .unwrap();

    scheduler.start(&job).await.unwrap();
    scheduler.stop(&job).await.unwrap();
    let paused = scheduler.status(&job).await.unwrap();
    assert_eq!(paused.shards.leased, 0);

    scheduler.scale(&job, 2).await.unwrap();
    scheduler.start(&job).await.unwrap();
    assert_eq!(converge(&cluster, "geonames", 300).await, 300);
    scheduler.stop(&job).await.unwrap();

    let status = scheduler.status(&job).await.unwrap();
    assert_eq!(status.shards.completed, status.shards.total);
    // Upserts keep the count exact even if a batch was written twice.
    assert_eq!(cluster.count(ClusterRole::Target, "geonames").await.unwrap(), 300);
}

#[tokio::test]
async fn in_progress_snapshot_is_not_handed_out() {
    let cluster = seeded("geonames", 10).await;
    let repo = Arc::new(
        MemorySnapshotRepository::new(Arc::clone(&cluster), 2).with_polls_until_durable(3),
    );
    let snapshots = Arc::new(SnapshotCoordinator::new(repo, SnapshotConfig::default()));
    assert!(snapshots.create(false).await.success);

    let backfill = ScheduledBackfill::new(
        Arc::new(BackfillScheduler::new(cluster.clone())),
        Arc::clone(&snapshots),
        job_options(TransformSpec::Identity, 1),
    );
    let created = backfill.create().await;
    assert!(!created.success);
    assert!(backfill.job().await.is_none());

    match snapshots.handle().await {
        Err(Error::Snapshot(SnapshotError::NotReady(_))) => {}
        other => panic!("expected NotReady, got {other:?}"),
    }
    // Nothing to stop yet; stop still succeeds.
    assert!(backfill.stop().await.success);
}

#[tokio::test]
async fn expected_counts_are_reported_per_index() {
    let cluster = Arc::new(MemoryCluster::new());
    cluster.seed_source("a", 4).await.unwrap();
    cluster.seed_source("b", 6).await.unwrap();
    let ctx = RunContext::in_memory(cluster, &test_config());

    let report = ctx
        .run(&plan(TransformSpec::multiply(5).unwrap(), 2), &mut TokioTicker::new())
        .await
        .unwrap();
    let expected: BTreeMap<&str, u64> = report
        .indices
        .iter()
        .map(|p| (p.index.as_str(), p.expected_count))
        .collect();
    assert_eq!(expected, BTreeMap::from([("a", 20), ("b", 30)]));
    assert!(report.verification.unwrap().passed());
}
