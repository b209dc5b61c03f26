//! Error types for backfill-core

use std::fmt::Write;
use thiserror::Error;

/// Remediation command for resolving an error
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct RemediationCommand {
    /// Short label describing the command purpose
    pub label: String,
    /// Command to run
    pub command: String,
}

/// Actionable remediation guidance for an error
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct Remediation {
    /// One-line summary of how to fix the issue
    pub summary: String,
    /// Suggested commands to resolve or diagnose the issue
    pub commands: Vec<RemediationCommand>,
    /// Additional alternative guidance
    pub alternatives: Vec<String>,
}

impl Remediation {
    /// Create a new remediation with a summary
    #[must_use]
    pub fn new(summary: impl Into<String>) -> Self {
        Self {
            summary: summary.into(),
            commands: Vec::new(),
            alternatives: Vec::new(),
        }
    }

    /// Add a suggested command
    #[must_use]
    pub fn command(mut self, label: impl Into<String>, command: impl Into<String>) -> Self {
        self.commands.push(RemediationCommand {
            label: label.into(),
            command: command.into(),
        });
        self
    }

    /// Add an alternative suggestion
    #[must_use]
    pub fn alternative(mut self, alternative: impl Into<String>) -> Self {
        self.alternatives.push(alternative.into());
        self
    }

    /// Render remediation text for human-readable output
    #[must_use]
    pub fn render_plain(&self) -> String {
        let mut output = String::new();
        let _ = writeln!(output, "To fix:");
        let _ = writeln!(output, "  {}", self.summary);

        if !self.commands.is_empty() {
            let _ = writeln!(output, "  Commands:");
            for cmd in &self.commands {
                let _ = writeln!(output, "    - {}: {}", cmd.label, cmd.command);
            }
        }

        if !self.alternatives.is_empty() {
            let _ = writeln!(output, "  Alternatives:");
            for alt in &self.alternatives {
                let _ = writeln!(output, "    - {alt}");
            }
        }

        output
    }
}

/// Result type alias using the library's Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for backfill-core
///
/// Convergence timeouts are deliberately absent: a tracker that never
/// stabilizes reports `TrackerOutcome::TimedOut` instead of failing.
#[derive(Error, Debug)]
pub enum Error {
    /// A cluster connection check did not establish a connection
    #[error("Connection to {cluster} cluster not established: {reason}")]
    Connectivity { cluster: String, reason: String },

    /// A remote command reported `success = false`
    #[error("Command `{command}` failed: {message}")]
    CommandFailed { command: String, message: String },

    /// Final counts or document contents differ from what was expected
    #[error("Data mismatch: {0}")]
    DataMismatch(String),

    /// Cluster client errors
    #[error("Cluster error: {0}")]
    Cluster(#[from] ClusterError),

    /// Snapshot errors
    #[error("Snapshot error: {0}")]
    Snapshot(#[from] SnapshotError),

    /// Scheduler errors
    #[error("Scheduler error: {0}")]
    Scheduler(#[from] SchedulerError),

    /// Transform errors
    #[error("Transform error: {0}")]
    Transform(#[from] TransformError),

    /// Configuration errors
    #[error("Config error: {0}")]
    Config(#[from] ConfigError),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Runtime errors (task join failures, closed channels, etc.)
    #[error("Runtime error: {0}")]
    Runtime(String),
}

impl Error {
    /// Return remediation guidance when available.
    #[must_use]
    pub fn remediation(&self) -> Option<Remediation> {
        match self {
            Self::Connectivity { cluster, .. } => Some(
                Remediation::new(format!(
                    "Verify the {cluster} cluster endpoint is reachable, then rerun."
                ))
                .command("Show effective config", "backfill config show")
                .alternative("Connectivity failures are not retried; fix the endpoint first."),
            ),
            Self::CommandFailed { command, .. } => Some(
                Remediation::new(format!(
                    "The `{command}` command failed. Inspect the logs for the remote error."
                ))
                .command("Rerun with debug logs", "RUST_LOG=backfill_core=debug backfill demo")
                .alternative("Stop the backfill before retrying: stop is always safe to repeat."),
            ),
            Self::DataMismatch(_) => Some(
                Remediation::new(
                    "Target contents differ from the expected result. Check the transform and rerun.",
                )
                .command("Inspect the transform", "backfill transform inspect <file>")
                .alternative("A stalled backfill also looks stable; raise tracker.max_ticks."),
            ),
            Self::Cluster(err) => Some(err.remediation()),
            Self::Snapshot(err) => Some(err.remediation()),
            Self::Scheduler(err) => Some(err.remediation()),
            Self::Transform(err) => Some(err.remediation()),
            Self::Config(err) => Some(err.remediation()),
            Self::Io(_) => Some(
                Remediation::new("Check filesystem permissions and paths, then retry.")
                    .alternative("Verify the config and transform files exist and are readable."),
            ),
            Self::Json(_) => Some(
                Remediation::new("Validate the JSON input and retry.")
                    .command("Validate JSON", "python -m json.tool < transformation.json")
                    .alternative("Check for trailing commas or invalid UTF-8."),
            ),
            Self::Runtime(_) => Some(
                Remediation::new("A worker task failed unexpectedly. Stop the backfill and retry.")
                    .alternative("If the issue persists, rerun with RUST_LOG=debug."),
            ),
        }
    }
}

/// Errors raised by cluster clients
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ClusterError {
    /// The requested index does not exist
    #[error("Index not found: {0}")]
    IndexNotFound(String),

    /// An index with this name already exists
    #[error("Index already exists: {0}")]
    IndexAlreadyExists(String),

    /// The cluster refused a bulk request
    #[error("Bulk request to {index} rejected: {reason}")]
    BulkRejected { index: String, reason: String },

    /// The cluster is temporarily unavailable
    #[error("Cluster unavailable: {0}")]
    Unavailable(String),

    /// Index settings body was malformed
    #[error("Invalid index settings: {0}")]
    InvalidSettings(String),
}

impl ClusterError {
    #[must_use]
    pub fn remediation(&self) -> Remediation {
        match self {
            Self::IndexNotFound(index) => {
                Remediation::new(format!("Create index `{index}` on the target before backfilling."))
                    .alternative("Enable `prepare_target` so indices are created from source settings.")
            }
            Self::IndexAlreadyExists(index) => Remediation::new(format!(
                "Index `{index}` already exists. Clear the target cluster or reuse the index."
            )),
            Self::BulkRejected { .. } => {
                Remediation::new("The target rejected a bulk write. Lower backfill.batch_size and retry.")
                    .alternative("Check the target cluster for disk watermarks or mapping conflicts.")
            }
            Self::Unavailable(_) => {
                Remediation::new("The cluster is temporarily unavailable. Retry after it recovers.")
                    .alternative("Increase backfill.retry_max_attempts for flaky clusters.")
            }
            Self::InvalidSettings(_) => {
                Remediation::new("Fix the index settings JSON body and retry.")
            }
        }
    }
}

/// Errors raised by snapshot coordination
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SnapshotError {
    /// No snapshot with this name exists
    #[error("Snapshot not found: {0}")]
    NotFound(String),

    /// The snapshot exists but is not yet durable
    #[error("Snapshot {0} is not durable yet")]
    NotReady(String),

    /// A snapshot with this name is already being captured
    #[error("Snapshot {0} already exists")]
    AlreadyExists(String),

    /// Another create call is running on this coordinator
    #[error("Snapshot creation already in progress")]
    InProgress,

    /// The repository reported the snapshot as failed
    #[error("Snapshot {name} failed: {reason}")]
    Failed { name: String, reason: String },

    /// Content digest recomputed at read time differs from the manifest
    #[error("Snapshot {name} digest mismatch (expected {expected}, actual {actual})")]
    DigestMismatch {
        name: String,
        expected: String,
        actual: String,
    },

    /// Waiting for durability exceeded the configured timeout
    #[error("Snapshot {name} not durable after {waited_ms} ms")]
    Timeout { name: String, waited_ms: u64 },
}

impl SnapshotError {
    #[must_use]
    pub fn remediation(&self) -> Remediation {
        match self {
            Self::NotFound(_) | Self::NotReady(_) => {
                Remediation::new("Create the snapshot with wait enabled before starting the backfill.")
                    .alternative("Set snapshot.wait = true in backfill.toml.")
            }
            Self::AlreadyExists(_) => Remediation::new(
                "Delete the existing snapshot first; the coordinator does this on create.",
            ),
            Self::InProgress => {
                Remediation::new("Wait for the running snapshot creation to finish.")
            }
            Self::Failed { .. } => Remediation::new(
                "The snapshot failed. Delete it and create a fresh one; stale snapshots are never reused.",
            ),
            Self::DigestMismatch { .. } => Remediation::new(
                "Snapshot contents changed after capture. Recreate the snapshot and restart the backfill.",
            ),
            Self::Timeout { .. } => {
                Remediation::new("Snapshot creation is slow. Raise snapshot.wait_timeout_secs and retry.")
            }
        }
    }
}

/// Errors raised by the backfill scheduler
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SchedulerError {
    /// A job already exists for this snapshot
    #[error("A backfill job already exists for snapshot {snapshot}")]
    AlreadyExists { snapshot: String },

    /// Job id is not known to the scheduler
    #[error("Unknown backfill job: {0}")]
    UnknownJob(String),

    /// The requested state change is not allowed
    #[error("Invalid job transition from {from} to {to}")]
    InvalidTransition { from: String, to: String },

    /// Unit counts must be positive
    #[error("Invalid unit count {0}: must be at least 1")]
    InvalidUnits(u32),

    /// Work state can only be archived once every unit has stopped
    #[error("Backfill job {job} is {state}; stop it before archiving")]
    NotStopped { job: String, state: String },
}

impl SchedulerError {
    #[must_use]
    pub fn remediation(&self) -> Remediation {
        match self {
            Self::AlreadyExists { .. } => Remediation::new(
                "A job for this snapshot exists. Reuse it, or stop it and create a new snapshot.",
            ),
            Self::UnknownJob(_) => Remediation::new("Create the backfill job before starting it."),
            Self::InvalidTransition { .. } => Remediation::new(
                "The job is not in a state that allows this command. Check its status first.",
            ),
            Self::InvalidUnits(_) => {
                Remediation::new("Scale to at least one unit; use stop to halt all workers.")
            }
            Self::NotStopped { .. } => {
                Remediation::new("Stop the backfill first; archive only reads a quiesced lease table.")
            }
        }
    }
}

/// Errors raised while loading or applying transforms
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransformError {
    /// Multiplication factor must be at least 1
    #[error("Invalid multiplication factor {0}: must be at least 1")]
    InvalidFactor(u64),

    /// Script could not be mapped to a known transform
    #[error("Unsupported transformation script: {0}")]
    UnsupportedScript(String),

    /// Bindings object was not valid JSON or had wrong field types
    #[error("Invalid bindings object: {0}")]
    InvalidBindings(String),

    /// Transformation file was not a list of provider objects
    #[error("Invalid transformation config: {0}")]
    InvalidConfig(String),

    /// Two copies would be written under the same id
    #[error("Copy {copy_index} of {source_id} derives id {id}, which another document already uses")]
    IdCollision {
        id: String,
        source_id: String,
        copy_index: u64,
    },
}

impl TransformError {
    #[must_use]
    pub fn remediation(&self) -> Remediation {
        match self {
            Self::InvalidFactor(_) => {
                Remediation::new("Use a multiplication factor of 1 (identity) or more.")
            }
            Self::UnsupportedScript(_) => Remediation::new(
                "Scripts are recognized, not executed. Declare the factor in bindingsObject.",
            )
            .command("Inspect the resolved transform", "backfill transform inspect <file>")
            .alternative("Use {\"multiplicationFactor\": N} in bindingsObject."),
            Self::IdCollision { .. } => Remediation::new(
                "Source ids already end in the copy suffix. Pick an id separator they never contain.",
            )
            .alternative("Set {\"idSeparator\": \"~\"} in bindingsObject."),
            Self::InvalidBindings(_) | Self::InvalidConfig(_) => {
                Remediation::new("Fix the transformation JSON and retry.")
                    .command("Inspect the resolved transform", "backfill transform inspect <file>")
            }
        }
    }
}

/// Configuration errors
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Config file not found: {0}")]
    FileNotFound(String),

    #[error("Failed to read config file {0}: {1}")]
    ReadFailed(String, String),

    #[error("Failed to parse config: {0}")]
    ParseFailed(String),

    #[error("Failed to serialize config: {0}")]
    SerializeFailed(String),

    #[error("Validation error: {0}")]
    ValidationError(String),
}

impl ConfigError {
    #[must_use]
    pub fn remediation(&self) -> Remediation {
        match self {
            Self::FileNotFound(path) => Remediation::new(format!(
                "Config file not found: {path}. Verify the path and retry."
            ))
            .command("Check path", format!("ls -l \"{path}\""))
            .alternative("Pass --config with the correct path."),
            Self::ReadFailed(path, _) => Remediation::new(format!(
                "Failed to read config file: {path}. Check permissions."
            ))
            .command("Check permissions", format!("ls -l \"{path}\"")),
            Self::ParseFailed(_) => Remediation::new("Config parse failed. Fix the TOML syntax and retry.")
                .command("Validate", "backfill config validate <file>"),
            Self::SerializeFailed(_) => {
                Remediation::new("Failed to serialize configuration. Check config values.")
            }
            Self::ValidationError(_) => {
                Remediation::new("Config validation failed. Fix the invalid fields and retry.")
                    .command("Show defaults", "backfill config show")
            }
        }
    }
}
