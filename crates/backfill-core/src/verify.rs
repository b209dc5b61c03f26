//! Post-backfill verification: final counts and sampled document content.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{info, warn};

use crate::cluster::{ClusterClient, ClusterRole, Document};
use crate::error::{Error, Result};
use crate::transform::TransformerPipeline;

/// System metadata never compared.
pub const SYSTEM_FIELDS: &[&str] = &["_id", "_index", "_version", "_seq_no", "_primary_term"];

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CountCheck {
    pub index: String,
    pub expected: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observed: Option<u64>,
}

impl CountCheck {
    #[must_use]
    pub fn passed(&self) -> bool {
        self.observed == Some(self.expected)
    }
}

/// One field that differs between source and target.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldDiff {
    pub field: String,
    pub source: Option<Value>,
    pub target: Option<Value>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DocumentCheck {
    pub index: String,
    pub id: String,
    /// False when the sampled id does not exist on the source.
    #[serde(default = "default_true")]
    pub found_on_source: bool,
    /// False when the target document is missing.
    pub found: bool,
    pub diffs: Vec<FieldDiff>,
}

const fn default_true() -> bool {
    true
}

impl DocumentCheck {
    #[must_use]
    pub fn passed(&self) -> bool {
        self.found_on_source && self.found && self.diffs.is_empty()
    }
}

/// Everything the verification phase checked.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VerificationReport {
    pub counts: Vec<CountCheck>,
    pub documents: Vec<DocumentCheck>,
}

impl VerificationReport {
    #[must_use]
    pub fn passed(&self) -> bool {
        self.counts.iter().all(CountCheck::passed) && self.documents.iter().all(DocumentCheck::passed)
    }

    pub fn merge(&mut self, other: VerificationReport) {
        self.counts.extend(other.counts);
        self.documents.extend(other.documents);
    }

    /// Human-readable list of failures, empty when everything passed.
    #[must_use]
    pub fn failures(&self) -> Vec<String> {
        let mut out = Vec::new();
        for check in self.counts.iter().filter(|c| !c.passed()) {
            match check.observed {
                Some(observed) => out.push(format!(
                    "{}: expected {} documents, found {observed}",
                    check.index, check.expected
                )),
                None => out.push(format!("{}: index missing on target", check.index)),
            }
        }
        for check in self.documents.iter().filter(|d| !d.passed()) {
            if !check.found_on_source {
                out.push(format!("{}/{}: missing on source", check.index, check.id));
                continue;
            }
            if !check.found {
                out.push(format!("{}/{}: missing on target", check.index, check.id));
                continue;
            }
            let fields: Vec<&str> = check.diffs.iter().map(|d| d.field.as_str()).collect();
            out.push(format!(
                "{}/{}: fields differ: {}",
                check.index,
                check.id,
                fields.join(", ")
            ));
        }
        out
    }

    /// `Err(DataMismatch)` listing every failure.
    pub fn into_result(self) -> Result<Self> {
        if self.passed() {
            Ok(self)
        } else {
            Err(Error::DataMismatch(self.failures().join("; ")))
        }
    }
}

/// Compare expected counts with observed ones. Missing observations fail.
#[must_use]
pub fn verify_counts(
    expected: &BTreeMap<String, u64>,
    observed: &BTreeMap<String, u64>,
) -> VerificationReport {
    let counts = expected
        .iter()
        .map(|(index, &want)| CountCheck {
            index: index.clone(),
            expected: want,
            observed: observed.get(index).copied(),
        })
        .collect();
    VerificationReport {
        counts,
        documents: Vec::new(),
    }
}

/// Top-level field differences between two documents' bodies.
///
/// Fields named in `ignore_fields` are skipped. Bodies that are not JSON
/// objects are compared whole under the field name `""`.
#[must_use]
pub fn compare_documents(source: &Document, target: &Document, ignore_fields: &[&str]) -> Vec<FieldDiff> {
    let (Value::Object(src), Value::Object(dst)) = (&source.source, &target.source) else {
        if source.source == target.source {
            return Vec::new();
        }
        return vec![FieldDiff {
            field: String::new(),
            source: Some(source.source.clone()),
            target: Some(target.source.clone()),
        }];
    };

    let mut keys: Vec<&String> = src.keys().chain(dst.keys()).collect();
    keys.sort();
    keys.dedup();

    keys.into_iter()
        .filter(|key| !ignore_fields.contains(&key.as_str()))
        .filter_map(|key| {
            let (a, b) = (src.get(key), dst.get(key));
            (a != b).then(|| FieldDiff {
                field: key.clone(),
                source: a.cloned(),
                target: b.cloned(),
            })
        })
        .collect()
}

/// Read the current count of each index on the target.
pub async fn observe_counts(
    client: &dyn ClusterClient,
    indices: impl IntoIterator<Item = &String>,
) -> Result<BTreeMap<String, u64>> {
    let mut observed = BTreeMap::new();
    for index in indices {
        match client.get_doc_count(ClusterRole::Target, index, 1, 0).await {
            Ok(count) => {
                observed.insert(index.clone(), count);
            }
            Err(Error::Cluster(crate::error::ClusterError::IndexNotFound(_))) => {
                warn!(index = %index, "Index missing on target");
            }
            Err(err) => return Err(err),
        }
    }
    Ok(observed)
}

/// Fetch sampled documents from both clusters and compare each target with
/// the first copy the pipeline derives from its source.
pub async fn verify_sample(
    client: &dyn ClusterClient,
    pipeline: &TransformerPipeline,
    index: &str,
    ids: &[String],
) -> Result<VerificationReport> {
    let mut report = VerificationReport::default();
    for id in ids {
        let Some(source) = client.get_document(ClusterRole::Source, index, id).await? else {
            warn!(index, id = %id, "Sampled document missing on source");
            report.documents.push(DocumentCheck {
                index: index.to_string(),
                id: id.clone(),
                found_on_source: false,
                found: false,
                diffs: Vec::new(),
            });
            continue;
        };
        let Some(expected) = pipeline.apply(&source).next() else {
            continue;
        };
        let check = match client
            .get_document(ClusterRole::Target, index, &expected.id)
            .await?
        {
            Some(target) => DocumentCheck {
                index: index.to_string(),
                id: expected.id.clone(),
                found_on_source: true,
                found: true,
                diffs: compare_documents(&expected, &target, SYSTEM_FIELDS),
            },
            None => DocumentCheck {
                index: index.to_string(),
                id: expected.id.clone(),
                found_on_source: true,
                found: false,
                diffs: Vec::new(),
            },
        };
        report.documents.push(check);
    }
    info!(
        index,
        sampled = report.documents.len(),
        passed = report.passed(),
        "Sample verification finished"
    );
    Ok(report)
}
