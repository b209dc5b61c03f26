//! Backfill jobs: shard leasing and a scalable pool of worker units.
//!
//! A job owns one verified [`Snapshot`]. Its shards sit in a [`ShardLeases`]
//! table; each worker unit leases one unleased shard at a time, streams it
//! through the [`TransformerPipeline`] in batches, checkpoints the document
//! offset after every bulk write, and marks the shard complete at the end.
//!
//! Units are tokio tasks controlled by two watch channels: a stop flag and
//! the desired unit count. A unit whose id is at or above the desired count
//! finishes its current batch, releases its lease at the checkpoint, and
//! exits, so scaling down never drops in-flight work.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::cluster::{ClusterClient, ClusterRole};
use crate::command::{CommandFuture, CommandResult};
use crate::config::BackfillConfig;
use crate::error::{Result, SchedulerError};
use crate::retry::{RetryPolicy, with_smart_retry};
use crate::snapshot::{ShardKey, Snapshot, SnapshotCoordinator};
use crate::transform::{TransformSpec, TransformerPipeline};

/// Failed attempts after which a shard is no longer offered.
pub const DEFAULT_MAX_SHARD_FAILURES: u32 = 3;

// ---------------------------------------------------------------------------
// Job state machine
// ---------------------------------------------------------------------------

/// Lifecycle of a backfill job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum JobState {
    Uncreated,
    Created,
    Running,
    Scaled { units: u32 },
    Stopped,
}

impl JobState {
    /// Whether `self -> to` is an allowed transition.
    ///
    /// Scaling a created or stopped job only records the desired count and
    /// is not a transition.
    #[must_use]
    pub fn is_valid_transition(&self, to: &JobState) -> bool {
        use JobState::{Created, Running, Scaled, Stopped, Uncreated};
        matches!(
            (self, to),
            (Uncreated, Created)
                | (Created | Stopped, Running)
                | (Running | Scaled { .. }, Scaled { .. })
                | (Created | Running | Scaled { .. }, Stopped)
        )
    }

    /// Units may be running in this state.
    #[must_use]
    pub fn is_active(&self) -> bool {
        matches!(self, Self::Running | Self::Scaled { .. })
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Uncreated => write!(f, "uncreated"),
            Self::Created => write!(f, "created"),
            Self::Running => write!(f, "running"),
            Self::Scaled { units } => write!(f, "scaled({units})"),
            Self::Stopped => write!(f, "stopped"),
        }
    }
}

fn transition(from: JobState, to: JobState) -> Result<JobState> {
    if from.is_valid_transition(&to) {
        Ok(to)
    } else {
        Err(SchedulerError::InvalidTransition {
            from: from.to_string(),
            to: to.to_string(),
        }
        .into())
    }
}

// ---------------------------------------------------------------------------
// Shard lease table
// ---------------------------------------------------------------------------

/// Where a shard is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "phase", rename_all = "snake_case")]
pub enum ShardPhase {
    Pending,
    Leased { unit: u32 },
    Completed,
    Failed,
}

#[derive(Debug, Clone)]
struct ShardEntry {
    phase: ShardPhase,
    offset: usize,
    failures: u32,
}

/// A unit's exclusive claim on one shard.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShardLease {
    pub key: ShardKey,
    /// Resume position inside the shard.
    pub offset: usize,
    pub unit: u32,
}

/// Counts of shards per phase.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LeaseSummary {
    pub total: usize,
    pub pending: usize,
    pub leased: usize,
    pub completed: usize,
    pub failed: usize,
}

/// One shard's lease state as exported by [`BackfillScheduler::archive`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArchivedShard {
    pub shard: ShardKey,
    pub phase: ShardPhase,
    pub offset: usize,
    pub failures: u32,
}

/// Work-coordination state of a stopped job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LeaseArchive {
    pub job_id: String,
    pub snapshot: String,
    pub archived_at: DateTime<Utc>,
    pub documents_read: u64,
    pub documents_written: u64,
    pub shards: Vec<ArchivedShard>,
}

impl LeaseArchive {
    #[must_use]
    pub fn summary(&self) -> LeaseSummary {
        let mut summary = LeaseSummary {
            total: self.shards.len(),
            ..LeaseSummary::default()
        };
        for shard in &self.shards {
            match shard.phase {
                ShardPhase::Pending => summary.pending += 1,
                ShardPhase::Leased { .. } => summary.leased += 1,
                ShardPhase::Completed => summary.completed += 1,
                ShardPhase::Failed => summary.failed += 1,
            }
        }
        summary
    }
}

/// Exclusive shard leases with document-offset checkpoints.
#[derive(Debug)]
pub struct ShardLeases {
    entries: std::sync::Mutex<BTreeMap<ShardKey, ShardEntry>>,
    max_failures: u32,
}

impl ShardLeases {
    pub fn new(keys: impl IntoIterator<Item = ShardKey>, max_failures: u32) -> Self {
        let entries = keys
            .into_iter()
            .map(|key| {
                (
                    key,
                    ShardEntry {
                        phase: ShardPhase::Pending,
                        offset: 0,
                        failures: 0,
                    },
                )
            })
            .collect();
        Self {
            entries: std::sync::Mutex::new(entries),
            max_failures: max_failures.max(1),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, BTreeMap<ShardKey, ShardEntry>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Lease the first pending shard.
    pub fn acquire(&self, unit: u32) -> Option<ShardLease> {
        let mut entries = self.lock();
        let (key, entry) = entries
            .iter_mut()
            .find(|(_, entry)| entry.phase == ShardPhase::Pending)?;
        entry.phase = ShardPhase::Leased { unit };
        Some(ShardLease {
            key: key.clone(),
            offset: entry.offset,
            unit,
        })
    }

    /// Record progress inside a leased shard.
    pub fn checkpoint(&self, key: &ShardKey, offset: usize) {
        if let Some(entry) = self.lock().get_mut(key) {
            entry.offset = offset;
        }
    }

    /// Return a shard to the pool at `offset`.
    pub fn release(&self, key: &ShardKey, offset: usize) {
        if let Some(entry) = self.lock().get_mut(key) {
            entry.offset = offset;
            entry.phase = ShardPhase::Pending;
        }
    }

    pub fn complete(&self, key: &ShardKey) {
        if let Some(entry) = self.lock().get_mut(key) {
            entry.phase = ShardPhase::Completed;
        }
    }

    /// Release after a failed batch. Returns true once the shard has failed
    /// often enough to be withdrawn.
    pub fn fail(&self, key: &ShardKey, offset: usize) -> bool {
        let mut entries = self.lock();
        let Some(entry) = entries.get_mut(key) else {
            return false;
        };
        entry.offset = offset;
        entry.failures += 1;
        if entry.failures >= self.max_failures {
            entry.phase = ShardPhase::Failed;
            true
        } else {
            entry.phase = ShardPhase::Pending;
            false
        }
    }

    /// Return every leased shard to the pool at its last checkpoint.
    pub fn reclaim_leased(&self) -> usize {
        let mut reclaimed = 0;
        for entry in self.lock().values_mut() {
            if matches!(entry.phase, ShardPhase::Leased { .. }) {
                entry.phase = ShardPhase::Pending;
                reclaimed += 1;
            }
        }
        reclaimed
    }

    #[must_use]
    pub fn phase(&self, key: &ShardKey) -> Option<ShardPhase> {
        self.lock().get(key).map(|entry| entry.phase)
    }

    #[must_use]
    pub fn offset(&self, key: &ShardKey) -> Option<usize> {
        self.lock().get(key).map(|entry| entry.offset)
    }

    #[must_use]
    pub fn summary(&self) -> LeaseSummary {
        let entries = self.lock();
        let mut summary = LeaseSummary {
            total: entries.len(),
            ..LeaseSummary::default()
        };
        for entry in entries.values() {
            match entry.phase {
                ShardPhase::Pending => summary.pending += 1,
                ShardPhase::Leased { .. } => summary.leased += 1,
                ShardPhase::Completed => summary.completed += 1,
                ShardPhase::Failed => summary.failed += 1,
            }
        }
        summary
    }

    /// Every shard's phase, offset, and failure count.
    #[must_use]
    pub fn export(&self) -> Vec<ArchivedShard> {
        self.lock()
            .iter()
            .map(|(key, entry)| ArchivedShard {
                shard: key.clone(),
                phase: entry.phase,
                offset: entry.offset,
                failures: entry.failures,
            })
            .collect()
    }

    /// No shard is pending or leased.
    #[must_use]
    pub fn is_drained(&self) -> bool {
        let summary = self.summary();
        summary.pending == 0 && summary.leased == 0
    }
}

// ---------------------------------------------------------------------------
// Job options, status, and handle
// ---------------------------------------------------------------------------

/// Per-job settings fixed at `create()`.
#[derive(Debug, Clone)]
pub struct JobOptions {
    pub transform: TransformSpec,
    pub batch_size: usize,
    pub retry: RetryPolicy,
    /// Units spawned by `start()` unless `scale()` ran first.
    pub initial_units: u32,
    /// How long an idle unit waits before looking for released shards.
    pub idle_poll: Duration,
    pub max_shard_failures: u32,
}

impl Default for JobOptions {
    fn default() -> Self {
        Self {
            transform: TransformSpec::Identity,
            batch_size: 500,
            retry: RetryPolicy::bulk_write(),
            initial_units: 1,
            idle_poll: Duration::from_millis(50),
            max_shard_failures: DEFAULT_MAX_SHARD_FAILURES,
        }
    }
}

impl From<&BackfillConfig> for JobOptions {
    fn from(config: &BackfillConfig) -> Self {
        Self {
            batch_size: config.batch_size,
            retry: config.retry_policy(),
            initial_units: config.units,
            ..Self::default()
        }
    }
}

impl JobOptions {
    fn validate(&self) -> Result<()> {
        self.transform.validate()?;
        if self.initial_units == 0 {
            return Err(SchedulerError::InvalidUnits(0).into());
        }
        if self.batch_size == 0 {
            return Err(crate::error::ConfigError::ValidationError(
                "batch_size must be at least 1".to_string(),
            )
            .into());
        }
        Ok(())
    }
}

/// Identifies a created job.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BackfillJob {
    pub id: String,
    pub snapshot: String,
}

/// A batch a unit gave up on.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnitError {
    pub unit: u32,
    pub shard: String,
    pub error: String,
}

/// Point-in-time view of a job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackfillStatus {
    pub job_id: String,
    pub snapshot: String,
    pub state: JobState,
    pub desired_units: u32,
    pub live_units: u32,
    pub shards: LeaseSummary,
    pub documents_read: u64,
    pub documents_written: u64,
    pub unit_errors: Vec<UnitError>,
}

#[derive(Debug, Default)]
struct JobCounters {
    documents_read: AtomicU64,
    documents_written: AtomicU64,
    errors: std::sync::Mutex<Vec<UnitError>>,
}

impl JobCounters {
    fn record_error(&self, error: UnitError) {
        self.errors
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(error);
    }

    fn errors(&self) -> Vec<UnitError> {
        self.errors
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

#[derive(Debug)]
struct UnitHandle {
    id: u32,
    join: JoinHandle<()>,
}

#[derive(Debug)]
struct JobControl {
    state: JobState,
    desired_units: u32,
    stop_tx: Option<watch::Sender<bool>>,
    desired_tx: Option<watch::Sender<u32>>,
    units: Vec<UnitHandle>,
}

#[derive(Debug)]
struct JobRuntime {
    job: BackfillJob,
    snapshot: Arc<Snapshot>,
    options: JobOptions,
    pipeline: Arc<TransformerPipeline>,
    leases: Arc<ShardLeases>,
    counters: Arc<JobCounters>,
    control: Mutex<JobControl>,
}

// ---------------------------------------------------------------------------
// Worker units
// ---------------------------------------------------------------------------

struct UnitContext {
    unit: u32,
    job_id: String,
    snapshot: Arc<Snapshot>,
    client: Arc<dyn ClusterClient>,
    pipeline: Arc<TransformerPipeline>,
    leases: Arc<ShardLeases>,
    counters: Arc<JobCounters>,
    batch_size: usize,
    retry: RetryPolicy,
    idle_poll: Duration,
    stop_rx: watch::Receiver<bool>,
    desired_rx: watch::Receiver<u32>,
}

impl UnitContext {
    fn should_exit(&self) -> bool {
        *self.stop_rx.borrow() || self.unit >= *self.desired_rx.borrow()
    }

    async fn run(mut self) {
        debug!(job_id = %self.job_id, unit_id = self.unit, "Unit started");
        loop {
            if self.should_exit() {
                break;
            }
            if let Some(lease) = self.leases.acquire(self.unit) {
                self.process(lease).await;
                continue;
            }
            if self.leases.is_drained() {
                debug!(job_id = %self.job_id, unit_id = self.unit, "No shards left");
                break;
            }
            // Other units hold the remaining shards; wait for a release.
            tokio::select! {
                () = tokio::time::sleep(self.idle_poll) => {}
                changed = self.stop_rx.changed() => if changed.is_err() { break; },
                changed = self.desired_rx.changed() => if changed.is_err() { break; },
            }
        }
        debug!(job_id = %self.job_id, unit_id = self.unit, "Unit exited");
    }

    async fn process(&self, lease: ShardLease) {
        let key = lease.key;
        let docs = self.snapshot.shard(&key).unwrap_or(&[]);
        let mut offset = lease.offset.min(docs.len());
        debug!(
            job_id = %self.job_id,
            unit_id = self.unit,
            shard = %key,
            offset,
            len = docs.len(),
            "Leased shard"
        );

        while offset < docs.len() {
            let end = offset.saturating_add(self.batch_size).min(docs.len());
            let batch = &docs[offset..end];
            let targets = self.pipeline.apply_batch(batch);
            let written = with_smart_retry(&self.retry, || {
                self.client.bulk_index(ClusterRole::Target, targets.clone())
            })
            .await;

            match written {
                Ok(written) => {
                    self.counters
                        .documents_read
                        .fetch_add(batch.len() as u64, Ordering::Relaxed);
                    self.counters
                        .documents_written
                        .fetch_add(written as u64, Ordering::Relaxed);
                    offset = end;
                    self.leases.checkpoint(&key, offset);
                }
                Err(err) => {
                    let withdrawn = self.leases.fail(&key, offset);
                    warn!(
                        job_id = %self.job_id,
                        unit_id = self.unit,
                        shard = %key,
                        offset,
                        withdrawn,
                        error = %err,
                        "Bulk write failed, releasing shard"
                    );
                    self.counters.record_error(UnitError {
                        unit: self.unit,
                        shard: key.to_string(),
                        error: err.to_string(),
                    });
                    return;
                }
            }

            if offset < docs.len() && self.should_exit() {
                self.leases.release(&key, offset);
                info!(
                    job_id = %self.job_id,
                    unit_id = self.unit,
                    shard = %key,
                    offset,
                    "Unit retiring, shard checkpointed"
                );
                return;
            }
        }

        self.leases.complete(&key);
        debug!(job_id = %self.job_id, unit_id = self.unit, shard = %key, "Shard complete");
    }
}

// ---------------------------------------------------------------------------
// Scheduler
// ---------------------------------------------------------------------------

/// Creates and drives backfill jobs against a target cluster.
pub struct BackfillScheduler {
    client: Arc<dyn ClusterClient>,
    jobs: Mutex<BTreeMap<String, Arc<JobRuntime>>>,
    next_id: AtomicU64,
}

impl fmt::Debug for BackfillScheduler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BackfillScheduler")
            .field("next_id", &self.next_id.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

impl BackfillScheduler {
    #[must_use]
    pub fn new(client: Arc<dyn ClusterClient>) -> Self {
        Self {
            client,
            jobs: Mutex::new(BTreeMap::new()),
            next_id: AtomicU64::new(1),
        }
    }

    async fn runtime(&self, job: &BackfillJob) -> Result<Arc<JobRuntime>> {
        self.jobs
            .lock()
            .await
            .get(&job.id)
            .cloned()
            .ok_or_else(|| SchedulerError::UnknownJob(job.id.clone()).into())
    }

    /// Create a job over a durable snapshot. One job per snapshot.
    pub async fn create(&self, snapshot: Arc<Snapshot>, options: JobOptions) -> Result<BackfillJob> {
        options.validate()?;
        snapshot.verify()?;
        for index in snapshot.index_names() {
            options.transform.check_unique_ids(snapshot.document_ids(index))?;
        }

        let mut jobs = self.jobs.lock().await;
        if jobs.values().any(|rt| rt.job.snapshot == snapshot.name) {
            return Err(SchedulerError::AlreadyExists {
                snapshot: snapshot.name.clone(),
            }
            .into());
        }

        let state = transition(JobState::Uncreated, JobState::Created)?;
        let seq = self.next_id.fetch_add(1, Ordering::Relaxed);
        let job = BackfillJob {
            id: format!("backfill-{}-{seq}", snapshot.name),
            snapshot: snapshot.name.clone(),
        };
        let leases = Arc::new(ShardLeases::new(
            snapshot.shard_keys(),
            options.max_shard_failures,
        ));
        let pipeline = Arc::new(TransformerPipeline::new(options.transform.clone())?);

        info!(
            job_id = %job.id,
            snapshot = %job.snapshot,
            shards = leases.summary().total,
            factor = options.transform.factor(),
            "Backfill job created"
        );

        let runtime = Arc::new(JobRuntime {
            job: job.clone(),
            snapshot,
            pipeline,
            leases,
            counters: Arc::new(JobCounters::default()),
            control: Mutex::new(JobControl {
                state,
                desired_units: options.initial_units,
                stop_tx: None,
                desired_tx: None,
                units: Vec::new(),
            }),
            options,
        });
        jobs.insert(job.id.clone(), runtime);
        Ok(job)
    }

    /// Spawn the desired number of units. Also resumes a stopped job.
    pub async fn start(&self, job: &BackfillJob) -> Result<()> {
        let rt = self.runtime(job).await?;
        let mut control = rt.control.lock().await;
        let next = transition(control.state, JobState::Running)?;

        let reclaimed = rt.leases.reclaim_leased();
        let (stop_tx, _) = watch::channel(false);
        let (desired_tx, _) = watch::channel(control.desired_units);
        control.stop_tx = Some(stop_tx);
        control.desired_tx = Some(desired_tx);
        control.units.clear();
        let units = control.desired_units;
        self.spawn_units(&rt, &mut control, 0..units);
        control.state = next;

        info!(job_id = %job.id, units, reclaimed, "Backfill started");
        Ok(())
    }

    /// Change the live unit count. Safe while running.
    pub async fn scale(&self, job: &BackfillJob, units: u32) -> Result<()> {
        if units == 0 {
            return Err(SchedulerError::InvalidUnits(0).into());
        }
        let rt = self.runtime(job).await?;
        let mut control = rt.control.lock().await;

        if !control.state.is_active() {
            control.desired_units = units;
            info!(job_id = %job.id, units, state = %control.state, "Recorded desired units");
            return Ok(());
        }

        let next = transition(control.state, JobState::Scaled { units })?;
        let previous = control.desired_units;
        control.desired_units = units;
        if let Some(tx) = &control.desired_tx {
            tx.send_replace(units);
        }

        if units > previous {
            let first = u32::try_from(control.units.len()).unwrap_or(u32::MAX);
            self.spawn_units(&rt, &mut control, first..units);
        } else if units < previous {
            let retiring: Vec<UnitHandle> = control
                .units
                .iter()
                .position(|u| u.id >= units)
                .map(|at| control.units.split_off(at))
                .unwrap_or_default();
            for unit in retiring {
                join_unit(&rt, unit).await;
            }
        }
        control.state = next;

        info!(job_id = %job.id, from = previous, to = units, "Backfill scaled");
        Ok(())
    }

    /// Signal every unit to stop and wait for them. Idempotent.
    pub async fn stop(&self, job: &BackfillJob) -> Result<()> {
        let rt = self.runtime(job).await?;
        let mut control = rt.control.lock().await;

        if control.state == JobState::Stopped {
            debug!(job_id = %job.id, "Backfill already stopped");
            return Ok(());
        }
        let next = transition(control.state, JobState::Stopped)?;

        if let Some(tx) = control.stop_tx.take() {
            tx.send_replace(true);
        }
        control.desired_tx = None;
        let units = std::mem::take(&mut control.units);
        let joined = units.len();
        for unit in units {
            join_unit(&rt, unit).await;
        }
        rt.leases.reclaim_leased();
        control.state = next;

        let summary = rt.leases.summary();
        info!(
            job_id = %job.id,
            units = joined,
            shards_completed = summary.completed,
            shards_total = summary.total,
            "Backfill stopped"
        );
        Ok(())
    }

    pub async fn status(&self, job: &BackfillJob) -> Result<BackfillStatus> {
        let rt = self.runtime(job).await?;
        let control = rt.control.lock().await;
        let live_units = control
            .units
            .iter()
            .filter(|u| !u.join.is_finished())
            .count();
        Ok(BackfillStatus {
            job_id: rt.job.id.clone(),
            snapshot: rt.job.snapshot.clone(),
            state: control.state,
            desired_units: control.desired_units,
            live_units: u32::try_from(live_units).unwrap_or(u32::MAX),
            shards: rt.leases.summary(),
            documents_read: rt.counters.documents_read.load(Ordering::Relaxed),
            documents_written: rt.counters.documents_written.load(Ordering::Relaxed),
            unit_errors: rt.counters.errors(),
        })
    }

    /// Export the lease table of a stopped job, then forget the job.
    ///
    /// Once archived the job id is unknown and its snapshot may back a new job.
    pub async fn archive(&self, job: &BackfillJob) -> Result<LeaseArchive> {
        let mut jobs = self.jobs.lock().await;
        let rt = jobs
            .get(&job.id)
            .cloned()
            .ok_or_else(|| SchedulerError::UnknownJob(job.id.clone()))?;
        let control = rt.control.lock().await;
        if control.state != JobState::Stopped {
            return Err(SchedulerError::NotStopped {
                job: job.id.clone(),
                state: control.state.to_string(),
            }
            .into());
        }

        let archive = LeaseArchive {
            job_id: rt.job.id.clone(),
            snapshot: rt.job.snapshot.clone(),
            archived_at: Utc::now(),
            documents_read: rt.counters.documents_read.load(Ordering::Relaxed),
            documents_written: rt.counters.documents_written.load(Ordering::Relaxed),
            shards: rt.leases.export(),
        };
        drop(control);
        jobs.remove(&job.id);

        let summary = archive.summary();
        info!(
            job_id = %job.id,
            shards_completed = summary.completed,
            shards_total = summary.total,
            "Backfill work state archived"
        );
        Ok(archive)
    }

    fn spawn_units(&self, rt: &Arc<JobRuntime>, control: &mut JobControl, ids: std::ops::Range<u32>) {
        let (Some(stop_tx), Some(desired_tx)) = (&control.stop_tx, &control.desired_tx) else {
            return;
        };
        for unit in ids {
            let ctx = UnitContext {
                unit,
                job_id: rt.job.id.clone(),
                snapshot: Arc::clone(&rt.snapshot),
                client: Arc::clone(&self.client),
                pipeline: Arc::clone(&rt.pipeline),
                leases: Arc::clone(&rt.leases),
                counters: Arc::clone(&rt.counters),
                batch_size: rt.options.batch_size,
                retry: rt.options.retry.clone(),
                idle_poll: rt.options.idle_poll,
                stop_rx: stop_tx.subscribe(),
                desired_rx: desired_tx.subscribe(),
            };
            control.units.push(UnitHandle {
                id: unit,
                join: tokio::spawn(ctx.run()),
            });
        }
    }
}

async fn join_unit(rt: &JobRuntime, unit: UnitHandle) {
    if let Err(err) = unit.join.await {
        warn!(job_id = %rt.job.id, unit_id = unit.id, error = %err, "Unit task failed");
        rt.counters.record_error(UnitError {
            unit: unit.id,
            shard: String::new(),
            error: err.to_string(),
        });
    }
}

// ---------------------------------------------------------------------------
// Job-bound control surface
// ---------------------------------------------------------------------------

/// Narrow control surface for one backfill.
pub trait BackfillControl: Send + Sync {
    fn create(&self) -> CommandFuture<'_>;
    fn start(&self) -> CommandFuture<'_>;
    fn scale(&self, units: u32) -> CommandFuture<'_>;
    fn stop(&self) -> CommandFuture<'_>;
    fn status(&self) -> CommandFuture<'_, BackfillStatus>;
    /// Export and discard the work-coordination state after `stop`.
    fn archive(&self) -> CommandFuture<'_, LeaseArchive>;
}

/// One backfill bound to a scheduler and a snapshot coordinator.
///
/// `create()` takes the coordinator's durable handle, so a snapshot still
/// being written is never read.
#[derive(Debug)]
pub struct ScheduledBackfill {
    scheduler: Arc<BackfillScheduler>,
    snapshots: Arc<SnapshotCoordinator>,
    options: JobOptions,
    job: Mutex<Option<BackfillJob>>,
}

impl ScheduledBackfill {
    #[must_use]
    pub fn new(
        scheduler: Arc<BackfillScheduler>,
        snapshots: Arc<SnapshotCoordinator>,
        options: JobOptions,
    ) -> Self {
        Self {
            scheduler,
            snapshots,
            options,
            job: Mutex::new(None),
        }
    }

    pub async fn job(&self) -> Option<BackfillJob> {
        self.job.lock().await.clone()
    }

    async fn require_job(&self) -> Result<BackfillJob> {
        self.job
            .lock()
            .await
            .clone()
            .ok_or_else(|| SchedulerError::UnknownJob("job not created".to_string()).into())
    }

    async fn archive_job(&self) -> Result<LeaseArchive> {
        let mut slot = self.job.lock().await;
        let job = slot
            .clone()
            .ok_or_else(|| SchedulerError::UnknownJob("job not created".to_string()))?;
        let archive = self.scheduler.archive(&job).await?;
        *slot = None;
        Ok(archive)
    }

    async fn create_job(&self) -> Result<()> {
        let mut slot = self.job.lock().await;
        let snapshot = self.snapshots.handle().await?;
        let job = self.scheduler.create(snapshot, self.options.clone()).await?;
        *slot = Some(job);
        Ok(())
    }
}

impl BackfillControl for ScheduledBackfill {
    fn create(&self) -> CommandFuture<'_> {
        Box::pin(async move { CommandResult::from_result(self.create_job().await) })
    }

    fn start(&self) -> CommandFuture<'_> {
        Box::pin(async move {
            let result = match self.require_job().await {
                Ok(job) => self.scheduler.start(&job).await,
                Err(err) => Err(err),
            };
            CommandResult::from_result(result)
        })
    }

    fn scale(&self, units: u32) -> CommandFuture<'_> {
        Box::pin(async move {
            let result = match self.require_job().await {
                Ok(job) => self.scheduler.scale(&job, units).await,
                Err(err) => Err(err),
            };
            CommandResult::from_result(result)
        })
    }

    fn stop(&self) -> CommandFuture<'_> {
        Box::pin(async move {
            // Nothing to stop before create.
            let Some(job) = self.job().await else {
                return CommandResult::done();
            };
            CommandResult::from_result(self.scheduler.stop(&job).await)
        })
    }

    fn status(&self) -> CommandFuture<'_, BackfillStatus> {
        Box::pin(async move {
            let result = match self.require_job().await {
                Ok(job) => self.scheduler.status(&job).await,
                Err(err) => Err(err),
            };
            CommandResult::from_result(result)
        })
    }

    fn archive(&self) -> CommandFuture<'_, LeaseArchive> {
        Box::pin(async move { CommandResult::from_result(self.archive_job().await) })
    }
}
