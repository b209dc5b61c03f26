//! Cluster client seam and the in-memory reference cluster.
//!
//! The engine talks to source and target stores only through
//! [`ClusterClient`]. [`MemoryCluster`] implements it with two in-process
//! document maps so every phase runs without a network.

use std::collections::BTreeMap;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::RwLock;
use tracing::{debug, info};

use crate::error::{ClusterError, Result};

/// Boxed future returned by cluster operations.
pub type ClusterFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T>> + Send + 'a>>;

/// Which side of the migration a call targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ClusterRole {
    Source,
    Target,
}

impl fmt::Display for ClusterRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Source => write!(f, "source"),
            Self::Target => write!(f, "target"),
        }
    }
}

/// A stored document: its index, id, and JSON body.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Document {
    #[serde(rename = "_index")]
    pub index: String,
    #[serde(rename = "_id")]
    pub id: String,
    #[serde(rename = "_source")]
    pub source: Value,
}

impl Document {
    #[must_use]
    pub fn new(index: impl Into<String>, id: impl Into<String>, source: Value) -> Self {
        Self {
            index: index.into(),
            id: id.into(),
            source,
        }
    }
}

/// Result of a connection check.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionResult {
    pub cluster: ClusterRole,
    pub established: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

/// Narrow interface to a source or target search cluster.
pub trait ClusterClient: Send + Sync {
    /// Probe connectivity. Never errors; reports `established = false`.
    fn connection_check(&self, cluster: ClusterRole) -> ClusterFuture<'_, ConnectionResult>;

    /// Delete every index on the cluster.
    fn clear_all(&self, cluster: ClusterRole) -> ClusterFuture<'_, ()>;

    /// Create an index with the given settings body.
    fn create_index(
        &self,
        cluster: ClusterRole,
        name: &str,
        settings_body: &Value,
    ) -> ClusterFuture<'_, ()>;

    /// Upsert documents keyed by `(index, id)`. Returns documents written.
    fn bulk_index(&self, cluster: ClusterRole, documents: Vec<Document>)
    -> ClusterFuture<'_, usize>;

    /// Current document count for an index, polled up to `max_attempts`
    /// times `delay_ms` apart. Returns the last observed count.
    fn get_doc_count(
        &self,
        cluster: ClusterRole,
        index: &str,
        max_attempts: u32,
        delay_ms: u64,
    ) -> ClusterFuture<'_, u64>;

    /// Fetch one document, `None` when absent.
    fn get_document(
        &self,
        cluster: ClusterRole,
        index: &str,
        id: &str,
    ) -> ClusterFuture<'_, Option<Document>>;

    /// Index names on the cluster, sorted.
    fn list_indices(&self, cluster: ClusterRole) -> ClusterFuture<'_, Vec<String>>;

    /// Settings body an index was created with.
    fn index_settings(&self, cluster: ClusterRole, index: &str) -> ClusterFuture<'_, Value>;
}

/// Poll a count until it matches `expected` or attempts run out.
///
/// With `expected = None` every attempt is made and the final observation is
/// returned. A failing probe counts as an attempt; if the last attempt fails
/// its error is returned.
pub async fn count_with_retry<F, Fut>(
    mut probe: F,
    expected: Option<u64>,
    max_attempts: u32,
    delay_ms: u64,
) -> Result<u64>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<u64>>,
{
    let attempts = max_attempts.max(1);
    let delay = Duration::from_millis(delay_ms);
    let mut last = probe().await;

    for attempt in 2..=attempts {
        if let (Ok(count), Some(want)) = (&last, expected) {
            if *count == want {
                break;
            }
        }
        debug!(
            attempt,
            max_attempts = attempts,
            observed = ?last.as_ref().ok(),
            expected = ?expected,
            "Document count not settled, polling again"
        );
        tokio::time::sleep(delay).await;
        last = probe().await;
    }

    last
}

// ---------------------------------------------------------------------------
// In-memory reference cluster
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default)]
struct StoredIndex {
    settings: Value,
    docs: BTreeMap<String, Value>,
}

#[derive(Debug)]
struct Store {
    reachable: bool,
    indices: BTreeMap<String, StoredIndex>,
}

impl Store {
    fn new() -> Self {
        Self {
            reachable: true,
            indices: BTreeMap::new(),
        }
    }
}

/// In-process source and target clusters.
///
/// Indices are created implicitly on first write. Fault hooks let tests make
/// a cluster unreachable or reject the next few bulk requests.
#[derive(Debug)]
pub struct MemoryCluster {
    source: RwLock<Store>,
    target: RwLock<Store>,
    rejected_bulks: AtomicU32,
    bulk_calls: AtomicU32,
}

impl Default for MemoryCluster {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryCluster {
    #[must_use]
    pub fn new() -> Self {
        Self {
            source: RwLock::new(Store::new()),
            target: RwLock::new(Store::new()),
            rejected_bulks: AtomicU32::new(0),
            bulk_calls: AtomicU32::new(0),
        }
    }

    fn store(&self, cluster: ClusterRole) -> &RwLock<Store> {
        match cluster {
            ClusterRole::Source => &self.source,
            ClusterRole::Target => &self.target,
        }
    }

    /// Make a cluster fail (or pass) connection checks.
    pub async fn set_reachable(&self, cluster: ClusterRole, reachable: bool) {
        self.store(cluster).write().await.reachable = reachable;
    }

    /// Reject the next `count` bulk requests with a retryable error.
    pub fn reject_next_bulks(&self, count: u32) {
        self.rejected_bulks.store(count, Ordering::SeqCst);
    }

    /// Total bulk requests received, including rejected ones.
    pub fn bulk_calls(&self) -> u32 {
        self.bulk_calls.load(Ordering::SeqCst)
    }

    /// Seed `count` documents `doc_0..doc_{count-1}` into a source index.
    pub async fn seed_source(&self, index: &str, count: u64) -> Result<()> {
        let docs = (0..count)
            .map(|i| {
                Document::new(
                    index,
                    format!("doc_{i}"),
                    serde_json::json!({
                        "title": format!("Test Document {i}"),
                        "content": format!("Sample content for document {i}"),
                        "value": i,
                    }),
                )
            })
            .collect::<Vec<_>>();
        self.bulk_index(ClusterRole::Source, docs).await?;
        Ok(())
    }

    /// Every document in an index, ordered by id.
    pub async fn documents(&self, cluster: ClusterRole, index: &str) -> Result<Vec<Document>> {
        let store = self.store(cluster).read().await;
        let stored = store
            .indices
            .get(index)
            .ok_or_else(|| ClusterError::IndexNotFound(index.to_string()))?;
        Ok(stored
            .docs
            .iter()
            .map(|(id, source)| Document::new(index, id.clone(), source.clone()))
            .collect())
    }

    /// Count without polling.
    pub async fn count(&self, cluster: ClusterRole, index: &str) -> Result<u64> {
        let store = self.store(cluster).read().await;
        store
            .indices
            .get(index)
            .map(|stored| stored.docs.len() as u64)
            .ok_or_else(|| ClusterError::IndexNotFound(index.to_string()).into())
    }
}

impl ClusterClient for MemoryCluster {
    fn connection_check(&self, cluster: ClusterRole) -> ClusterFuture<'_, ConnectionResult> {
        Box::pin(async move {
            let reachable = self.store(cluster).read().await.reachable;
            Ok(ConnectionResult {
                cluster,
                established: reachable,
                detail: (!reachable).then(|| "connection refused".to_string()),
            })
        })
    }

    fn clear_all(&self, cluster: ClusterRole) -> ClusterFuture<'_, ()> {
        Box::pin(async move {
            let mut store = self.store(cluster).write().await;
            let removed = store.indices.len();
            store.indices.clear();
            info!(%cluster, removed, "Cleared all indices");
            Ok(())
        })
    }

    fn create_index(
        &self,
        cluster: ClusterRole,
        name: &str,
        settings_body: &Value,
    ) -> ClusterFuture<'_, ()> {
        let name = name.to_string();
        let settings = settings_body.clone();
        Box::pin(async move {
            if !settings.is_object() && !settings.is_null() {
                return Err(ClusterError::InvalidSettings(format!(
                    "settings for {name} must be a JSON object"
                ))
                .into());
            }
            let mut store = self.store(cluster).write().await;
            if store.indices.contains_key(&name) {
                return Err(ClusterError::IndexAlreadyExists(name).into());
            }
            debug!(%cluster, index = %name, "Created index");
            store.indices.insert(
                name,
                StoredIndex {
                    settings,
                    docs: BTreeMap::new(),
                },
            );
            Ok(())
        })
    }

    fn bulk_index(
        &self,
        cluster: ClusterRole,
        documents: Vec<Document>,
    ) -> ClusterFuture<'_, usize> {
        Box::pin(async move {
            self.bulk_calls.fetch_add(1, Ordering::SeqCst);
            let rejected = self
                .rejected_bulks
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok();
            if rejected {
                let index = documents
                    .first()
                    .map(|d| d.index.clone())
                    .unwrap_or_default();
                return Err(ClusterError::BulkRejected {
                    index,
                    reason: "es_rejected_execution_exception".to_string(),
                }
                .into());
            }

            let mut store = self.store(cluster).write().await;
            let written = documents.len();
            for doc in documents {
                store
                    .indices
                    .entry(doc.index)
                    .or_default()
                    .docs
                    .insert(doc.id, doc.source);
            }
            Ok(written)
        })
    }

    fn get_doc_count(
        &self,
        cluster: ClusterRole,
        index: &str,
        max_attempts: u32,
        delay_ms: u64,
    ) -> ClusterFuture<'_, u64> {
        let index = index.to_string();
        Box::pin(async move {
            count_with_retry(|| self.count(cluster, &index), None, max_attempts, delay_ms).await
        })
    }

    fn get_document(
        &self,
        cluster: ClusterRole,
        index: &str,
        id: &str,
    ) -> ClusterFuture<'_, Option<Document>> {
        let index = index.to_string();
        let id = id.to_string();
        Box::pin(async move {
            let store = self.store(cluster).read().await;
            let stored = store
                .indices
                .get(&index)
                .ok_or_else(|| ClusterError::IndexNotFound(index.clone()))?;
            Ok(stored
                .docs
                .get(&id)
                .map(|source| Document::new(index.clone(), id.clone(), source.clone())))
        })
    }

    fn list_indices(&self, cluster: ClusterRole) -> ClusterFuture<'_, Vec<String>> {
        Box::pin(async move {
            let store = self.store(cluster).read().await;
            Ok(store.indices.keys().cloned().collect())
        })
    }

    fn index_settings(&self, cluster: ClusterRole, index: &str) -> ClusterFuture<'_, Value> {
        let index = index.to_string();
        Box::pin(async move {
            let store = self.store(cluster).read().await;
            store
                .indices
                .get(&index)
                .map(|stored| stored.settings.clone())
                .ok_or_else(|| ClusterError::IndexNotFound(index).into())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;
    use std::sync::Arc;
    use std::sync::atomic::AtomicU64;

    #[tokio::test]
    async fn bulk_index_upserts_by_id() {
        let cluster = MemoryCluster::new();
        let doc = Document::new("idx", "a", serde_json::json!({"v": 1}));
        cluster
            .bulk_index(ClusterRole::Target, vec![doc.clone(), doc])
            .await
            .unwrap();
        let again = Document::new("idx", "a", serde_json::json!({"v": 2}));
        cluster.bulk_index(ClusterRole::Target, vec![again]).await.unwrap();

        assert_eq!(cluster.count(ClusterRole::Target, "idx").await.unwrap(), 1);
        let stored = cluster
            .get_document(ClusterRole::Target, "idx", "a")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(stored.source["v"], 2);
    }

    #[tokio::test]
    async fn seed_source_uses_doc_ids() {
        let cluster = MemoryCluster::new();
        cluster.seed_source("geonames", 100).await.unwrap();
        assert_eq!(cluster.count(ClusterRole::Source, "geonames").await.unwrap(), 100);
        let doc = cluster
            .get_document(ClusterRole::Source, "geonames", "doc_50")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(doc.source["value"], 50);
        assert!(cluster.count(ClusterRole::Target, "geonames").await.is_err());
    }

    #[tokio::test]
    async fn connection_check_reports_unreachable() {
        let cluster = MemoryCluster::new();
        cluster.set_reachable(ClusterRole::Source, false).await;
        let result = cluster.connection_check(ClusterRole::Source).await.unwrap();
        assert!(!result.established);
        let result = cluster.connection_check(ClusterRole::Target).await.unwrap();
        assert!(result.established);
    }

    #[tokio::test]
    async fn create_index_rejects_duplicates() {
        let cluster = MemoryCluster::new();
        let settings = serde_json::json!({"settings": {"number_of_shards": 3}});
        cluster
            .create_index(ClusterRole::Target, "idx", &settings)
            .await
            .unwrap();
        let err = cluster
            .create_index(ClusterRole::Target, "idx", &settings)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Cluster(ClusterError::IndexAlreadyExists(_))));
        let stored = cluster.index_settings(ClusterRole::Target, "idx").await.unwrap();
        assert_eq!(stored, settings);
    }

    #[tokio::test]
    async fn clear_all_drops_indices() {
        let cluster = MemoryCluster::new();
        cluster.seed_source("a", 3).await.unwrap();
        cluster.clear_all(ClusterRole::Source).await.unwrap();
        assert!(cluster.list_indices(ClusterRole::Source).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn rejected_bulks_are_retryable_errors() {
        let cluster = MemoryCluster::new();
        cluster.reject_next_bulks(1);
        let docs = vec![Document::new("idx", "a", serde_json::json!({}))];
        let err = cluster
            .bulk_index(ClusterRole::Target, docs.clone())
            .await
            .unwrap_err();
        assert!(crate::retry::is_retryable(&err));
        cluster.bulk_index(ClusterRole::Target, docs).await.unwrap();
        assert_eq!(cluster.bulk_calls(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn get_doc_count_returns_last_observation() {
        let cluster = MemoryCluster::new();
        cluster.seed_source("idx", 10).await.unwrap();
        let count = cluster
            .get_doc_count(ClusterRole::Source, "idx", 3, 100)
            .await
            .unwrap();
        assert_eq!(count, 10);
    }

    #[tokio::test(start_paused = true)]
    async fn count_with_retry_stops_when_expected_reached() {
        let calls = Arc::new(AtomicU64::new(0));
        let calls_clone = Arc::clone(&calls);
        let count = count_with_retry(
            move || {
                let n = calls_clone.fetch_add(1, Ordering::SeqCst);
                async move { Ok(n * 10) }
            },
            Some(20),
            10,
            50,
        )
        .await
        .unwrap();
        assert_eq!(count, 20);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn count_with_retry_exhausts_attempts() {
        let calls = Arc::new(AtomicU64::new(0));
        let calls_clone = Arc::clone(&calls);
        let count = count_with_retry(
            move || {
                let n = calls_clone.fetch_add(1, Ordering::SeqCst);
                async move { Ok(n) }
            },
            Some(100),
            4,
            50,
        )
        .await
        .unwrap();
        assert_eq!(count, 3);
        assert_eq!(calls.load(Ordering::SeqCst), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn count_with_retry_returns_last_error() {
        let err = count_with_retry(
            || async { Err(ClusterError::IndexNotFound("missing".into()).into()) },
            None,
            2,
            10,
        )
        .await
        .unwrap_err();
        assert!(matches!(err, Error::Cluster(ClusterError::IndexNotFound(_))));
    }

    #[test]
    fn document_serializes_with_metadata_names() {
        let doc = Document::new("idx", "doc_1", serde_json::json!({"a": 1}));
        let json = serde_json::to_value(&doc).unwrap();
        assert_eq!(json["_id"], "doc_1");
        assert_eq!(json["_index"], "idx");
        assert_eq!(json["_source"]["a"], 1);
    }
}
