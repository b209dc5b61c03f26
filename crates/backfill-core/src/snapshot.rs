//! Point-in-time snapshots of the source store.
//!
//! A [`Snapshot`] is immutable once captured. Its manifest records per-index
//! document counts and a SHA-256 digest over every shard, recomputed by
//! [`Snapshot::verify`] before a scheduler is allowed to read it.
//!
//! [`SnapshotCoordinator`] owns the create / wait / handle lifecycle against a
//! [`SnapshotRepository`].

use std::collections::BTreeMap;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::cluster::{ClusterClient, ClusterFuture, ClusterRole, Document, MemoryCluster};
use crate::command::{CommandFuture, CommandResult};
use crate::config::SnapshotConfig;
use crate::error::{Result, SnapshotError};
use crate::wait::{Backoff, WaitFor, WaitPredicate, wait_for};

// ---------------------------------------------------------------------------
// Snapshot data
// ---------------------------------------------------------------------------

/// Identifies one shard of one index.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ShardKey {
    pub index: String,
    pub shard: u32,
}

impl ShardKey {
    #[must_use]
    pub fn new(index: impl Into<String>, shard: u32) -> Self {
        Self {
            index: index.into(),
            shard,
        }
    }
}

impl fmt::Display for ShardKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.index, self.shard)
    }
}

/// Shard a document id routes to.
#[must_use]
pub fn shard_for(id: &str, shard_count: u32) -> u32 {
    let digest = Sha256::digest(id.as_bytes());
    let mut prefix = [0u8; 8];
    prefix.copy_from_slice(&digest[..8]);
    (u64::from_be_bytes(prefix) % u64::from(shard_count.max(1))) as u32
}

/// Captured contents of one index.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SnapshotIndex {
    pub settings: Value,
    /// Documents per shard, each shard ordered by id.
    pub shards: Vec<Vec<Document>>,
}

/// Per-index summary recorded in the manifest.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexManifest {
    pub doc_count: u64,
    pub shard_count: u32,
}

/// Summary and integrity digest of a snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotManifest {
    pub indices: BTreeMap<String, IndexManifest>,
    /// Hex SHA-256 over every shard's documents.
    pub digest: String,
}

/// Immutable point-in-time view of the source store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    pub name: String,
    pub created_at: DateTime<Utc>,
    indices: BTreeMap<String, SnapshotIndex>,
    manifest: SnapshotManifest,
}

impl Snapshot {
    /// Capture documents into `shard_count` shards per index.
    ///
    /// `sources` maps index name to its settings body and documents.
    #[must_use]
    pub fn capture(
        name: impl Into<String>,
        sources: BTreeMap<String, (Value, Vec<Document>)>,
        shard_count: u32,
    ) -> Self {
        let shard_count = shard_count.max(1);
        let mut indices = BTreeMap::new();
        for (index, (settings, docs)) in sources {
            let mut shards = vec![Vec::new(); shard_count as usize];
            for doc in docs {
                let shard = shard_for(&doc.id, shard_count) as usize;
                shards[shard].push(doc);
            }
            for shard in &mut shards {
                shard.sort_by(|a, b| a.id.cmp(&b.id));
            }
            indices.insert(index, SnapshotIndex { settings, shards });
        }
        let manifest = build_manifest(&indices);
        Self {
            name: name.into(),
            created_at: Utc::now(),
            indices,
            manifest,
        }
    }

    #[must_use]
    pub fn manifest(&self) -> &SnapshotManifest {
        &self.manifest
    }

    /// Recompute the digest and compare it to the manifest.
    pub fn verify(&self) -> Result<()> {
        let actual = compute_digest(&self.indices);
        if actual != self.manifest.digest {
            return Err(SnapshotError::DigestMismatch {
                name: self.name.clone(),
                expected: self.manifest.digest.clone(),
                actual,
            }
            .into());
        }
        Ok(())
    }

    pub fn index_names(&self) -> impl Iterator<Item = &str> {
        self.indices.keys().map(String::as_str)
    }

    #[must_use]
    pub fn settings(&self, index: &str) -> Option<&Value> {
        self.indices.get(index).map(|i| &i.settings)
    }

    #[must_use]
    pub fn doc_count(&self, index: &str) -> u64 {
        self.manifest.indices.get(index).map_or(0, |m| m.doc_count)
    }

    /// Ids of every document captured for `index`.
    pub fn document_ids(&self, index: &str) -> impl Iterator<Item = &str> {
        self.indices
            .get(index)
            .into_iter()
            .flat_map(|i| i.shards.iter().flatten())
            .map(|doc| doc.id.as_str())
    }

    #[must_use]
    pub fn total_docs(&self) -> u64 {
        self.manifest.indices.values().map(|m| m.doc_count).sum()
    }

    /// Every shard in deterministic order.
    #[must_use]
    pub fn shard_keys(&self) -> Vec<ShardKey> {
        self.indices
            .iter()
            .flat_map(|(name, index)| {
                (0..index.shards.len() as u32).map(move |shard| ShardKey::new(name.clone(), shard))
            })
            .collect()
    }

    #[must_use]
    pub fn shard(&self, key: &ShardKey) -> Option<&[Document]> {
        self.indices
            .get(&key.index)
            .and_then(|index| index.shards.get(key.shard as usize))
            .map(Vec::as_slice)
    }
}

fn build_manifest(indices: &BTreeMap<String, SnapshotIndex>) -> SnapshotManifest {
    let summary = indices
        .iter()
        .map(|(name, index)| {
            let doc_count = index.shards.iter().map(|s| s.len() as u64).sum();
            (
                name.clone(),
                IndexManifest {
                    doc_count,
                    shard_count: index.shards.len() as u32,
                },
            )
        })
        .collect();
    SnapshotManifest {
        indices: summary,
        digest: compute_digest(indices),
    }
}

fn compute_digest(indices: &BTreeMap<String, SnapshotIndex>) -> String {
    let mut hasher = Sha256::new();
    for (name, index) in indices {
        hasher.update(name.as_bytes());
        hasher.update([0]);
        for (shard_no, shard) in index.shards.iter().enumerate() {
            hasher.update((shard_no as u64).to_be_bytes());
            for doc in shard {
                hasher.update(doc.id.as_bytes());
                hasher.update([0]);
                hasher.update(doc.source.to_string().as_bytes());
                hasher.update([0]);
            }
        }
    }
    hex::encode(hasher.finalize())
}

// ---------------------------------------------------------------------------
// Repository seam
// ---------------------------------------------------------------------------

/// Lifecycle state reported by a repository.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum SnapshotStatus {
    Missing,
    InProgress,
    Success,
    Failed { reason: String },
}

/// Where snapshots are written and read back.
pub trait SnapshotRepository: Send + Sync {
    /// Start capturing a snapshot. Fails if the name is taken.
    fn begin(&self, name: &str) -> ClusterFuture<'_, ()>;

    fn status(&self, name: &str) -> ClusterFuture<'_, SnapshotStatus>;

    /// Remove a snapshot. Returns whether one existed.
    fn delete(&self, name: &str) -> ClusterFuture<'_, bool>;

    /// Read a durable snapshot.
    fn load(&self, name: &str) -> ClusterFuture<'_, Snapshot>;
}

#[derive(Debug)]
struct RepoEntry {
    snapshot: Snapshot,
    pending_polls: u32,
    failure: Option<String>,
}

/// Snapshot repository capturing from a [`MemoryCluster`] source.
///
/// Captures become durable after `polls_until_durable` status polls, which
/// lets tests observe the in-progress window.
#[derive(Debug)]
pub struct MemorySnapshotRepository {
    cluster: Arc<MemoryCluster>,
    shard_count: u32,
    polls_until_durable: u32,
    entries: Mutex<BTreeMap<String, RepoEntry>>,
    fail_next: Mutex<Option<String>>,
}

impl MemorySnapshotRepository {
    #[must_use]
    pub fn new(cluster: Arc<MemoryCluster>, shard_count: u32) -> Self {
        Self {
            cluster,
            shard_count: shard_count.max(1),
            polls_until_durable: 0,
            entries: Mutex::new(BTreeMap::new()),
            fail_next: Mutex::new(None),
        }
    }

    /// Report `InProgress` for this many status polls after `begin`.
    #[must_use]
    pub fn with_polls_until_durable(mut self, polls: u32) -> Self {
        self.polls_until_durable = polls;
        self
    }

    /// Make the next capture end in `Failed`.
    pub async fn fail_next(&self, reason: impl Into<String>) {
        *self.fail_next.lock().await = Some(reason.into());
    }
}

impl SnapshotRepository for MemorySnapshotRepository {
    fn begin(&self, name: &str) -> ClusterFuture<'_, ()> {
        let name = name.to_string();
        Box::pin(async move {
            if self.entries.lock().await.contains_key(&name) {
                return Err(SnapshotError::AlreadyExists(name).into());
            }

            let mut sources = BTreeMap::new();
            for index in self.cluster.list_indices(ClusterRole::Source).await? {
                let settings = self
                    .cluster
                    .index_settings(ClusterRole::Source, &index)
                    .await?;
                let docs = self.cluster.documents(ClusterRole::Source, &index).await?;
                sources.insert(index, (settings, docs));
            }
            let snapshot = Snapshot::capture(name.clone(), sources, self.shard_count);
            let failure = self.fail_next.lock().await.take();
            debug!(snapshot = %name, docs = snapshot.total_docs(), "Captured source");

            self.entries.lock().await.insert(
                name,
                RepoEntry {
                    snapshot,
                    pending_polls: self.polls_until_durable,
                    failure,
                },
            );
            Ok(())
        })
    }

    fn status(&self, name: &str) -> ClusterFuture<'_, SnapshotStatus> {
        let name = name.to_string();
        Box::pin(async move {
            let mut entries = self.entries.lock().await;
            let Some(entry) = entries.get_mut(&name) else {
                return Ok(SnapshotStatus::Missing);
            };
            if entry.pending_polls > 0 {
                entry.pending_polls -= 1;
                return Ok(SnapshotStatus::InProgress);
            }
            Ok(match &entry.failure {
                Some(reason) => SnapshotStatus::Failed {
                    reason: reason.clone(),
                },
                None => SnapshotStatus::Success,
            })
        })
    }

    fn delete(&self, name: &str) -> ClusterFuture<'_, bool> {
        let name = name.to_string();
        Box::pin(async move { Ok(self.entries.lock().await.remove(&name).is_some()) })
    }

    fn load(&self, name: &str) -> ClusterFuture<'_, Snapshot> {
        let name = name.to_string();
        Box::pin(async move {
            let entries = self.entries.lock().await;
            let entry = entries
                .get(&name)
                .ok_or_else(|| SnapshotError::NotFound(name.clone()))?;
            if entry.pending_polls > 0 {
                return Err(SnapshotError::NotReady(name).into());
            }
            if let Some(reason) = &entry.failure {
                return Err(SnapshotError::Failed {
                    name,
                    reason: reason.clone(),
                }
                .into());
            }
            Ok(entry.snapshot.clone())
        })
    }
}

// ---------------------------------------------------------------------------
// Coordinator
// ---------------------------------------------------------------------------

/// Polls a repository until one snapshot is durable.
struct DurableCheck {
    repo: Arc<dyn SnapshotRepository>,
    name: String,
}

impl WaitPredicate for DurableCheck {
    type Output = ();

    fn describe(&self) -> String {
        format!("snapshot {} durable", self.name)
    }

    fn check(&mut self) -> Pin<Box<dyn Future<Output = WaitFor<()>> + Send + 'static>> {
        let repo = Arc::clone(&self.repo);
        let name = self.name.clone();
        Box::pin(async move {
            match repo.status(&name).await {
                Ok(SnapshotStatus::Success) => WaitFor::ready(()),
                Ok(SnapshotStatus::Failed { reason }) => WaitFor::Abort { reason },
                Ok(SnapshotStatus::Missing) => WaitFor::Abort {
                    reason: "snapshot disappeared".to_string(),
                },
                Ok(SnapshotStatus::InProgress) => WaitFor::not_ready("in_progress".to_string()),
                Err(err) => WaitFor::not_ready(format!("status error: {err}")),
            }
        })
    }
}

/// Narrow control surface for snapshot creation.
pub trait SnapshotControl: Send + Sync {
    /// Create the snapshot, blocking until durable when `wait` is set.
    fn create(&self, wait: bool) -> CommandFuture<'_>;
}

/// Drives snapshot create / wait / handle against a repository.
pub struct SnapshotCoordinator {
    repo: Arc<dyn SnapshotRepository>,
    config: SnapshotConfig,
    in_progress: AtomicBool,
    durable: Mutex<Option<Arc<Snapshot>>>,
}

impl fmt::Debug for SnapshotCoordinator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SnapshotCoordinator")
            .field("name", &self.config.name)
            .field("in_progress", &self.in_progress.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

impl SnapshotCoordinator {
    #[must_use]
    pub fn new(repo: Arc<dyn SnapshotRepository>, config: SnapshotConfig) -> Self {
        Self {
            repo,
            config,
            in_progress: AtomicBool::new(false),
            durable: Mutex::new(None),
        }
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.config.name
    }

    /// Delete any snapshot with this name, start a fresh capture, and
    /// optionally wait for durability.
    pub async fn create_snapshot(&self, wait: bool) -> Result<()> {
        if self.in_progress.swap(true, Ordering::SeqCst) {
            return Err(SnapshotError::InProgress.into());
        }
        struct InProgressGuard<'a>(&'a AtomicBool);
        impl Drop for InProgressGuard<'_> {
            fn drop(&mut self) {
                self.0.store(false, Ordering::Release);
            }
        }
        let _guard = InProgressGuard(&self.in_progress);

        let name = self.config.name.as_str();
        *self.durable.lock().await = None;

        if self.repo.delete(name).await? {
            info!(snapshot = %name, "Deleted existing snapshot before recreate");
        }
        self.repo.begin(name).await?;
        info!(snapshot = %name, wait, "Snapshot creation started");

        if wait {
            self.wait_for_completion().await?;
        }
        Ok(())
    }

    /// Poll until the snapshot is durable, failed, or the timeout elapses.
    pub async fn wait_for_completion(&self) -> Result<()> {
        let name = self.config.name.clone();
        let timeout = Duration::from_secs(self.config.wait_timeout_secs);
        let poll = Duration::from_millis(self.config.poll_interval_ms);
        let backoff = Backoff {
            initial: poll,
            max: poll.saturating_mul(4),
            factor: 2,
            max_retries: None,
        };

        let condition = DurableCheck {
            repo: Arc::clone(&self.repo),
            name: name.clone(),
        };

        match wait_for(condition, timeout, backoff).await {
            Ok(()) => {
                info!(snapshot = %name, "Snapshot is durable");
                Ok(())
            }
            Err(err) if err.is_timeout() => {
                warn!(snapshot = %name, error = %err, "Snapshot wait timed out");
                Err(SnapshotError::Timeout {
                    name,
                    waited_ms: err.elapsed.as_millis() as u64,
                }
                .into())
            }
            Err(err) => Err(SnapshotError::Failed {
                name,
                reason: err.aborted.unwrap_or_default(),
            }
            .into()),
        }
    }

    /// The immutable snapshot, once durable and verified.
    pub async fn handle(&self) -> Result<Arc<Snapshot>> {
        let mut durable = self.durable.lock().await;
        if let Some(snapshot) = durable.as_ref() {
            return Ok(Arc::clone(snapshot));
        }

        let name = self.config.name.clone();
        match self.repo.status(&name).await? {
            SnapshotStatus::Success => {}
            SnapshotStatus::InProgress => return Err(SnapshotError::NotReady(name).into()),
            SnapshotStatus::Missing => return Err(SnapshotError::NotFound(name).into()),
            SnapshotStatus::Failed { reason } => {
                return Err(SnapshotError::Failed { name, reason }.into());
            }
        }

        let snapshot = self.repo.load(&name).await?;
        snapshot.verify()?;
        let snapshot = Arc::new(snapshot);
        *durable = Some(Arc::clone(&snapshot));
        Ok(snapshot)
    }
}

impl SnapshotControl for SnapshotCoordinator {
    fn create(&self, wait: bool) -> CommandFuture<'_> {
        Box::pin(async move { CommandResult::from_result(self.create_snapshot(wait).await) })
    }
}
