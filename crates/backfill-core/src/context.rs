//! End-to-end backfill run.
//!
//! [`RunContext`] owns the collaborators for one source/target pair and
//! walks a [`RunPlan`] through every phase: connection checks, target
//! preparation, snapshot, job create/start/scale, convergence tracking,
//! stop, and verification. Each phase fails fast except tracking, whose
//! timeout is reported in the [`RunReport`] verdict.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::clock::Ticker;
use crate::cluster::{ClusterClient, ClusterRole, MemoryCluster};
use crate::config::Config;
use crate::error::{Error, Result};
use crate::progress::{ClusterCountProbe, TrackerConfig, TrackerOutcome, track_indices};
use crate::scheduler::{
    BackfillControl, BackfillJob, BackfillScheduler, BackfillStatus, JobOptions, LeaseArchive,
    ScheduledBackfill,
};
use crate::snapshot::{
    MemorySnapshotRepository, SnapshotControl, SnapshotCoordinator, SnapshotRepository,
};
use crate::transform::{TransformConfigLoader, TransformSpec, TransformerPipeline};
use crate::verify::{self, VerificationReport};

/// Shards per index for in-memory snapshots.
pub const DEFAULT_SHARD_COUNT: u32 = 4;

/// What a run should do.
#[derive(Debug, Clone)]
pub struct RunPlan {
    /// Source indices to backfill. Empty means every source index.
    pub indices: Vec<String>,
    pub transform: TransformSpec,
    /// Units requested through `scale` after `start`.
    pub units: u32,
    /// Clear the target and recreate indices with source settings first.
    pub prepare_target: bool,
    pub snapshot_wait: bool,
    pub tracker: TrackerConfig,
    /// Source ids compared field by field after convergence.
    pub sample_ids: Vec<String>,
    pub verify: bool,
}

impl Default for RunPlan {
    fn default() -> Self {
        Self {
            indices: Vec::new(),
            transform: TransformSpec::Identity,
            units: 1,
            prepare_target: true,
            snapshot_wait: true,
            tracker: TrackerConfig::default(),
            sample_ids: Vec::new(),
            verify: true,
        }
    }
}

impl RunPlan {
    /// Plan from configuration, loading the transform file when one is set.
    pub fn from_config(config: &Config) -> Result<Self> {
        let transform = match &config.transform.path {
            Some(path) => TransformConfigLoader::from_path(path)?.resolve()?,
            None => TransformSpec::Identity,
        };
        Ok(Self {
            transform,
            units: config.backfill.units,
            prepare_target: config.backfill.prepare_target,
            snapshot_wait: config.snapshot.wait,
            tracker: config.tracker.tracker_config(),
            ..Self::default()
        })
    }
}

/// Per-index counts the run expects.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexPlan {
    pub index: String,
    pub source_count: u64,
    pub expected_count: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunVerdict {
    /// Every index converged and verification passed (or was skipped).
    Converged,
    /// At least one index never stabilized.
    TimedOut,
    /// Counts or sampled documents differ from expectations.
    Mismatch,
}

impl fmt::Display for RunVerdict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Converged => "converged",
            Self::TimedOut => "timed_out",
            Self::Mismatch => "mismatch",
        };
        f.write_str(name)
    }
}

/// Everything a run observed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunReport {
    pub snapshot: String,
    pub job: BackfillJob,
    pub factor: u64,
    pub indices: Vec<IndexPlan>,
    pub tracking: BTreeMap<String, TrackerOutcome>,
    pub status: BackfillStatus,
    /// Lease table exported after the job stopped.
    pub archive: LeaseArchive,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub verification: Option<VerificationReport>,
    pub verdict: RunVerdict,
}

impl RunReport {
    /// `Err(DataMismatch)` when verification failed.
    pub fn check(&self) -> Result<()> {
        match &self.verification {
            Some(report) if !report.passed() => {
                Err(Error::DataMismatch(report.failures().join("; ")))
            }
            _ => Ok(()),
        }
    }
}

/// Collaborators for one source/target pair.
pub struct RunContext {
    client: Arc<dyn ClusterClient>,
    snapshots: Arc<SnapshotCoordinator>,
    scheduler: Arc<BackfillScheduler>,
    options: JobOptions,
}

impl fmt::Debug for RunContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RunContext")
            .field("snapshots", &self.snapshots)
            .field("options", &self.options)
            .finish_non_exhaustive()
    }
}

impl RunContext {
    #[must_use]
    pub fn new(
        client: Arc<dyn ClusterClient>,
        repository: Arc<dyn SnapshotRepository>,
        config: &Config,
    ) -> Self {
        Self {
            snapshots: Arc::new(SnapshotCoordinator::new(repository, config.snapshot.clone())),
            scheduler: Arc::new(BackfillScheduler::new(Arc::clone(&client))),
            options: JobOptions::from(&config.backfill),
            client,
        }
    }

    /// Context over an in-memory cluster pair.
    #[must_use]
    pub fn in_memory(cluster: Arc<MemoryCluster>, config: &Config) -> Self {
        let repository = Arc::new(MemorySnapshotRepository::new(
            Arc::clone(&cluster),
            DEFAULT_SHARD_COUNT,
        ));
        Self::new(cluster, repository, config)
    }

    #[must_use]
    pub fn snapshots(&self) -> &Arc<SnapshotCoordinator> {
        &self.snapshots
    }

    #[must_use]
    pub fn scheduler(&self) -> &Arc<BackfillScheduler> {
        &self.scheduler
    }

    async fn check_connections(&self) -> Result<()> {
        for role in [ClusterRole::Source, ClusterRole::Target] {
            let result = self.client.connection_check(role).await?;
            if !result.established {
                return Err(Error::Connectivity {
                    cluster: role.to_string(),
                    reason: result.detail.unwrap_or_else(|| "not established".to_string()),
                });
            }
            info!(cluster = %role, "Connection established");
        }
        Ok(())
    }

    async fn plan_indices(&self, plan: &RunPlan) -> Result<Vec<IndexPlan>> {
        let names = if plan.indices.is_empty() {
            self.client.list_indices(ClusterRole::Source).await?
        } else {
            plan.indices.clone()
        };
        let mut planned = Vec::with_capacity(names.len());
        for index in names {
            let source_count = self
                .client
                .get_doc_count(ClusterRole::Source, &index, 1, 0)
                .await?;
            let expected_count = plan.transform.expected_count(source_count);
            info!(index = %index, source_count, expected_count, "Planned index");
            planned.push(IndexPlan {
                index,
                source_count,
                expected_count,
            });
        }
        Ok(planned)
    }

    async fn prepare_target(&self, indices: &[IndexPlan]) -> Result<()> {
        self.client.clear_all(ClusterRole::Target).await?;
        for planned in indices {
            let settings = self
                .client
                .index_settings(ClusterRole::Source, &planned.index)
                .await?;
            self.client
                .create_index(ClusterRole::Target, &planned.index, &settings)
                .await?;
        }
        Ok(())
    }

    /// Execute every phase of `plan`.
    pub async fn run(&self, plan: &RunPlan, ticker: &mut dyn Ticker) -> Result<RunReport> {
        self.check_connections().await?;
        let indices = self.plan_indices(plan).await?;
        if plan.prepare_target {
            self.prepare_target(&indices).await?;
        }

        self.snapshots
            .create(plan.snapshot_wait)
            .await
            .into_result("snapshot create")?;
        if !plan.snapshot_wait {
            self.snapshots.wait_for_completion().await?;
        }

        let mut options = self.options.clone();
        options.transform = plan.transform.clone();
        let backfill = ScheduledBackfill::new(
            Arc::clone(&self.scheduler),
            Arc::clone(&self.snapshots),
            options,
        );
        backfill.create().await.into_result("backfill create")?;
        let job = backfill
            .job()
            .await
            .ok_or_else(|| Error::Runtime("backfill created without a job".to_string()))?;
        backfill.start().await.into_result("backfill start")?;
        if let Err(err) = backfill.scale(plan.units).await.into_result("backfill scale") {
            backfill.stop().await;
            return Err(err);
        }

        let names: Vec<String> = indices.iter().map(|p| p.index.clone()).collect();
        let expected: BTreeMap<String, u64> = indices
            .iter()
            .map(|p| (p.index.clone(), p.expected_count))
            .collect();
        let probe = Arc::new(ClusterCountProbe::new(
            Arc::clone(&self.client),
            ClusterRole::Target,
        ));
        let tracked = track_indices(&names, &expected, probe, &plan.tracker, ticker).await;

        // Stop even when tracking failed so no unit outlives the run.
        let stopped = backfill.stop().await;
        let tracking = tracked?;
        stopped.into_result("backfill stop")?;
        let status = backfill.status().await.into_value("backfill status")?;
        let archive = backfill.archive().await.into_value("backfill archive")?;

        let timed_out = tracking.values().any(TrackerOutcome::timed_out);
        let verification = if plan.verify && !timed_out {
            Some(self.verify(plan, &names, &expected).await?)
        } else {
            None
        };

        let verdict = if timed_out {
            warn!(job_id = %job.id, "Backfill did not converge");
            RunVerdict::TimedOut
        } else if verification.as_ref().is_some_and(|r| !r.passed()) {
            RunVerdict::Mismatch
        } else {
            RunVerdict::Converged
        };
        info!(job_id = %job.id, %verdict, "Run finished");

        Ok(RunReport {
            snapshot: self.snapshots.name().to_string(),
            job,
            factor: plan.transform.factor(),
            indices,
            tracking,
            status,
            archive,
            verification,
            verdict,
        })
    }

    async fn verify(
        &self,
        plan: &RunPlan,
        names: &[String],
        expected: &BTreeMap<String, u64>,
    ) -> Result<VerificationReport> {
        let observed = verify::observe_counts(self.client.as_ref(), names).await?;
        let mut report = verify::verify_counts(expected, &observed);
        if !plan.sample_ids.is_empty() {
            let pipeline = TransformerPipeline::new(plan.transform.clone())?;
            for index in names {
                let sampled =
                    verify::verify_sample(self.client.as_ref(), &pipeline, index, &plan.sample_ids)
                        .await?;
                report.merge(sampled);
            }
        }
        Ok(report)
    }
}
