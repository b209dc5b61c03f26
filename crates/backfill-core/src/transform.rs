//! Document transforms applied between source and target.
//!
//! A transform is resolved once from its wire configuration into a typed
//! [`TransformSpec`], then applied per document by [`TransformerPipeline`].
//! The multiplier expands one source document into `factor` copies whose ids
//! derive from `(source_id, copy_index)`, so replays overwrite rather than
//! duplicate.

use std::collections::HashSet;
use std::path::Path;
use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::debug;

use crate::cluster::Document;
use crate::error::{Result, TransformError};

/// Separator between source id and copy index when none is configured.
pub const DEFAULT_ID_SEPARATOR: &str = "_";

/// Provider key for script transforms in `transformation.json`.
pub const JS_PROVIDER: &str = "JsonJSTransformerProvider";

/// Provider key for the pass-through transform.
pub const NOOP_PROVIDER: &str = "NoopTransformerProvider";

static FACTOR_CONSTANT: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\bconst\s+(MULTIPLICATION_FACTOR(?:_WITH_ORIGINAL)?|N)\s*=\s*(\d+)\s*;").unwrap()
});

static LOOP_BOUND: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\b[A-Za-z_]\w*\s*(<=|<)\s*(MULTIPLICATION_FACTOR(?:_WITH_ORIGINAL)?|N)\b").unwrap()
});

// ---------------------------------------------------------------------------
// Typed transforms
// ---------------------------------------------------------------------------

/// What a backfill does to each source document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TransformSpec {
    /// Copy documents unchanged.
    #[default]
    Identity,
    /// Replicate each document into `factor` total copies.
    Multiply {
        factor: u64,
        #[serde(default = "default_separator")]
        id_separator: String,
        /// Top-level fields replaced (or added) on every copy.
        #[serde(default, skip_serializing_if = "Map::is_empty")]
        overrides: Map<String, Value>,
    },
}

fn default_separator() -> String {
    DEFAULT_ID_SEPARATOR.to_string()
}

impl TransformSpec {
    /// Multiplier with the default separator and no overrides.
    pub fn multiply(factor: u64) -> Result<Self> {
        let spec = Self::Multiply {
            factor,
            id_separator: default_separator(),
            overrides: Map::new(),
        };
        spec.validate()?;
        Ok(spec)
    }

    /// Copies produced per source document.
    #[must_use]
    pub fn factor(&self) -> u64 {
        match self {
            Self::Identity => 1,
            Self::Multiply { factor, .. } => *factor,
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.factor() == 0 {
            return Err(TransformError::InvalidFactor(0).into());
        }
        Ok(())
    }

    /// Expected target count for `source_count` source documents.
    #[must_use]
    pub fn expected_count(&self, source_count: u64) -> u64 {
        source_count.saturating_mul(self.factor())
    }

    /// Id of copy `copy_index` of `source_id`. Copy 0 keeps the source id.
    #[must_use]
    pub fn derived_id(&self, source_id: &str, copy_index: u64) -> String {
        match self {
            Self::Multiply { id_separator, .. } if copy_index > 0 => {
                format!("{source_id}{id_separator}{copy_index}")
            }
            _ => source_id.to_string(),
        }
    }

    /// Reject source ids whose derived copies would overwrite each other.
    ///
    /// Copy 0 keeps its source id, so a copy such as `a_1` collides with a
    /// source document whose id is already `a_1`. Ids are scoped to one index.
    pub fn check_unique_ids<'a>(&self, source_ids: impl IntoIterator<Item = &'a str>) -> Result<()> {
        let factor = self.factor();
        if factor <= 1 {
            return Ok(());
        }
        let source_ids: Vec<&str> = source_ids.into_iter().collect();
        let mut seen: HashSet<String> = source_ids.iter().map(|id| (*id).to_string()).collect();
        for source_id in &source_ids {
            for copy_index in 1..factor {
                let id = self.derived_id(source_id, copy_index);
                if seen.contains(&id) {
                    return Err(TransformError::IdCollision {
                        id,
                        source_id: (*source_id).to_string(),
                        copy_index,
                    }
                    .into());
                }
                seen.insert(id);
            }
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Lazy copy sequence
// ---------------------------------------------------------------------------

/// Restartable iterator over the copies of one source document.
#[derive(Debug, Clone)]
pub struct TransformedCopies<'a> {
    spec: &'a TransformSpec,
    source: &'a Document,
    next: u64,
    end: u64,
}

impl<'a> TransformedCopies<'a> {
    #[must_use]
    pub fn new(spec: &'a TransformSpec, source: &'a Document) -> Self {
        Self {
            spec,
            source,
            next: 0,
            end: spec.factor(),
        }
    }

    /// Restart the sequence at `copy_index`.
    #[must_use]
    pub fn resume_from(mut self, copy_index: u64) -> Self {
        self.next = copy_index.min(self.end);
        self
    }

    fn build(&self, copy_index: u64) -> Document {
        let mut body = self.source.source.clone();
        if let TransformSpec::Multiply { overrides, .. } = self.spec {
            if !overrides.is_empty() {
                if let Value::Object(fields) = &mut body {
                    for (key, value) in overrides {
                        fields.insert(key.clone(), value.clone());
                    }
                }
            }
        }
        Document {
            index: self.source.index.clone(),
            id: self.spec.derived_id(&self.source.id, copy_index),
            source: body,
        }
    }
}

impl Iterator for TransformedCopies<'_> {
    type Item = Document;

    fn next(&mut self) -> Option<Self::Item> {
        if self.next >= self.end {
            return None;
        }
        let doc = self.build(self.next);
        self.next += 1;
        Some(doc)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let remaining = usize::try_from(self.end - self.next).unwrap_or(usize::MAX);
        (remaining, Some(remaining))
    }
}

impl ExactSizeIterator for TransformedCopies<'_> {}

/// Applies a [`TransformSpec`] to documents and batches.
#[derive(Debug, Clone, Default)]
pub struct TransformerPipeline {
    spec: TransformSpec,
}

impl TransformerPipeline {
    pub fn new(spec: TransformSpec) -> Result<Self> {
        spec.validate()?;
        Ok(Self { spec })
    }

    #[must_use]
    pub fn spec(&self) -> &TransformSpec {
        &self.spec
    }

    /// Lazy copies of one document.
    #[must_use]
    pub fn apply<'a>(&'a self, source: &'a Document) -> TransformedCopies<'a> {
        TransformedCopies::new(&self.spec, source)
    }

    /// Flat-map a batch into its target documents.
    #[must_use]
    pub fn apply_batch(&self, batch: &[Document]) -> Vec<Document> {
        let per_doc = usize::try_from(self.spec.factor()).unwrap_or(usize::MAX);
        let mut out = Vec::with_capacity(batch.len().saturating_mul(per_doc).min(1 << 16));
        for doc in batch {
            out.extend(self.apply(doc));
        }
        out
    }
}

// ---------------------------------------------------------------------------
// Wire configuration
// ---------------------------------------------------------------------------

/// Script transform configuration as written in `transformation.json`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransformConfig {
    #[serde(default)]
    pub initialization_script: String,
    /// Either an inline object or a JSON-encoded string of one.
    #[serde(default = "empty_object")]
    pub bindings_object: Value,
}

fn empty_object() -> Value {
    Value::Object(Map::new())
}

impl TransformConfig {
    /// Bindings as an object, decoding the string form.
    pub fn bindings(&self) -> Result<Map<String, Value>> {
        let decoded = match &self.bindings_object {
            Value::String(raw) if raw.trim().is_empty() => empty_object(),
            Value::String(raw) => serde_json::from_str(raw)
                .map_err(|e| TransformError::InvalidBindings(e.to_string()))?,
            Value::Null => empty_object(),
            other => other.clone(),
        };
        match decoded {
            Value::Object(map) => Ok(map),
            other => Err(TransformError::InvalidBindings(format!(
                "expected an object, found {other}"
            ))
            .into()),
        }
    }
}

/// One entry of the transformation list.
#[derive(Debug, Clone, PartialEq)]
pub enum TransformProvider {
    Script(TransformConfig),
    Noop,
}

/// Resolves transformation configuration into a [`TransformSpec`].
///
/// Resolution order for a script provider: explicit bindings
/// (`multiplicationFactor`, `idSeparator`, `overrides`), then a factor
/// constant declared in the script. Scripts are never executed.
#[derive(Debug, Clone, PartialEq)]
pub struct TransformConfigLoader {
    providers: Vec<TransformProvider>,
}

impl TransformConfigLoader {
    #[must_use]
    pub fn from_config(config: TransformConfig) -> Self {
        Self {
            providers: vec![TransformProvider::Script(config)],
        }
    }

    /// Parse the `transformation.json` list form.
    pub fn from_json(raw: &str) -> Result<Self> {
        let entries: Vec<Value> = serde_json::from_str(raw)
            .map_err(|e| TransformError::InvalidConfig(e.to_string()))?;
        let mut providers = Vec::with_capacity(entries.len());
        for entry in entries {
            let Value::Object(map) = entry else {
                return Err(TransformError::InvalidConfig(
                    "each entry must be a provider object".to_string(),
                )
                .into());
            };
            if map.len() != 1 {
                return Err(TransformError::InvalidConfig(format!(
                    "provider entries need exactly one key, found {}",
                    map.len()
                ))
                .into());
            }
            for (name, body) in map {
                providers.push(match name.as_str() {
                    JS_PROVIDER => {
                        let config: TransformConfig = serde_json::from_value(body)
                            .map_err(|e| TransformError::InvalidConfig(e.to_string()))?;
                        TransformProvider::Script(config)
                    }
                    NOOP_PROVIDER => TransformProvider::Noop,
                    other => {
                        return Err(TransformError::UnsupportedScript(format!(
                            "unknown provider {other}"
                        ))
                        .into());
                    }
                });
            }
        }
        Ok(Self { providers })
    }

    pub fn from_path(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        Self::from_json(&raw)
    }

    #[must_use]
    pub fn providers(&self) -> &[TransformProvider] {
        &self.providers
    }

    /// Resolve to a typed spec.
    pub fn resolve(&self) -> Result<TransformSpec> {
        let scripts: Vec<&TransformConfig> = self
            .providers
            .iter()
            .filter_map(|p| match p {
                TransformProvider::Script(config) => Some(config),
                TransformProvider::Noop => None,
            })
            .collect();

        let spec = match scripts.as_slice() {
            [] => TransformSpec::Identity,
            [config] => resolve_script(config)?,
            _ => {
                return Err(TransformError::UnsupportedScript(
                    "chained script providers".to_string(),
                )
                .into());
            }
        };
        spec.validate()?;
        debug!(factor = spec.factor(), "Resolved transform");
        Ok(spec)
    }

    /// Resolve and attach to job options ahead of `create()`.
    pub fn attach(&self, options: &mut crate::scheduler::JobOptions) -> Result<()> {
        options.transform = self.resolve()?;
        Ok(())
    }
}

fn resolve_script(config: &TransformConfig) -> Result<TransformSpec> {
    let bindings = config.bindings()?;

    let id_separator = match bindings.get("idSeparator") {
        None => default_separator(),
        Some(Value::String(sep)) if !sep.is_empty() => sep.clone(),
        Some(other) => {
            return Err(TransformError::InvalidBindings(format!(
                "idSeparator must be a non-empty string, found {other}"
            ))
            .into());
        }
    };
    let overrides = match bindings.get("overrides") {
        None => Map::new(),
        Some(Value::Object(map)) => map.clone(),
        Some(other) => {
            return Err(TransformError::InvalidBindings(format!(
                "overrides must be an object, found {other}"
            ))
            .into());
        }
    };

    let factor = match bindings.get("multiplicationFactor") {
        Some(value) => value.as_u64().ok_or_else(|| {
            TransformError::InvalidBindings(format!(
                "multiplicationFactor must be a non-negative integer, found {value}"
            ))
        })?,
        None => match script_factor(&config.initialization_script) {
            Some(factor) => factor,
            None if config.initialization_script.trim().is_empty() && overrides.is_empty() => {
                return Ok(TransformSpec::Identity);
            }
            None if config.initialization_script.trim().is_empty() => 1,
            None => {
                return Err(TransformError::UnsupportedScript(
                    "no multiplication factor declared".to_string(),
                )
                .into());
            }
        },
    };

    if factor == 0 {
        return Err(TransformError::InvalidFactor(0).into());
    }
    Ok(TransformSpec::Multiply {
        factor,
        id_separator,
        overrides,
    })
}

/// Copy count declared by a multiplier script, if recognizable.
///
/// `const N = 5;` with `i <= N` yields 6; with `i < N` yields 5.
#[must_use]
pub fn script_factor(script: &str) -> Option<u64> {
    let caps = FACTOR_CONSTANT.captures(script)?;
    let name = caps.get(1)?.as_str();
    let value: u64 = caps.get(2)?.as_str().parse().ok()?;
    let inclusive = LOOP_BOUND
        .captures_iter(script)
        .find(|bound| bound.get(2).is_some_and(|m| m.as_str() == name))
        .is_some_and(|bound| bound.get(1).is_some_and(|op| op.as_str() == "<="));
    if inclusive { value.checked_add(1) } else { Some(value) }
}
