//! Error types for the stage coordinator.
//!
//! Fatal conditions (`ConfigMismatch`, `InvalidScheme`, `Integrity`,
//! `Submission`) abort the current invocation with a non-zero exit code. `QueryUnknown` is an
//! expected steady-state outcome and never surfaces as a failure at the CLI.

use std::path::PathBuf;
use thiserror::Error;

/// The main error type for coordinator operations.
#[derive(Debug, Error)]
pub enum CoordinatorError {
    /// The partition scheme disagrees with the declared partition count.
    #[error("{0}")]
    ConfigMismatch(#[from] ConfigMismatchError),

    /// The partition scheme is empty or names one partition twice.
    #[error("{0}")]
    InvalidScheme(#[from] InvalidSchemeError),

    /// Unexpected outputs were found in a stage directory.
    #[error("{0}")]
    Integrity(#[from] IntegrityError),

    /// The scheduler rejected a submission.
    #[error("{0}")]
    Submission(#[from] SubmissionError),

    /// A status query failed; the stage could not be verified.
    #[error("{0}")]
    QueryUnknown(#[from] QueryError),

    /// A static configuration lookup failed.
    #[error("{0}")]
    Config(#[from] ConfigLookupError),

    /// A stage name is not present in the catalog.
    #[error("Unknown stage '{0}'")]
    UnknownStage(String),

    /// An output or job template is malformed.
    #[error("Invalid template: {0}")]
    InvalidTemplate(String),

    /// Serialization/deserialization error.
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<serde_json::Error> for CoordinatorError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

impl CoordinatorError {
    /// Process exit code reported by the `coordinator` binary.
    ///
    /// `QueryUnknown` maps to 0: an unverifiable stage is a no-op, retried by
    /// the next finishing sibling.
    #[must_use]
    pub fn exit_code(&self) -> u8 {
        match self {
            Self::QueryUnknown(_) => 0,
            Self::ConfigMismatch(_) | Self::InvalidScheme(_) => 2,
            Self::Integrity(_) => 3,
            Self::Submission(_) => 4,
            Self::Config(_)
            | Self::UnknownStage(_)
            | Self::InvalidTemplate(_)
            | Self::Serialization(_)
            | Self::Io(_) => 1,
        }
    }

    /// Returns true if the error must abort with a non-zero exit.
    #[must_use]
    pub fn is_fatal(&self) -> bool {
        self.exit_code() != 0
    }
}

/// Raised when the expected partition set disagrees with the count fixed at
/// stage definition time.
#[derive(Debug, Clone, Error)]
#[error(
    "Partition count mismatch for stage '{stage}': declared {declared}, scheme has {found}"
)]
pub struct ConfigMismatchError {
    /// The stage key.
    pub stage: String,
    /// Count fixed when the stage was defined.
    pub declared: usize,
    /// Count derived from the partition scheme now.
    pub found: usize,
}

impl ConfigMismatchError {
    /// Creates a new mismatch error.
    #[must_use]
    pub fn new(stage: impl Into<String>, declared: usize, found: usize) -> Self {
        Self {
            stage: stage.into(),
            declared,
            found,
        }
    }
}

/// Raised when a partition scheme cannot be fanned out: it has no
/// partitions, or two sources map to the same partition id.
#[derive(Debug, Clone, Error)]
#[error("Invalid partition scheme for '{scope}': {reason}")]
pub struct InvalidSchemeError {
    /// Stage key, or the directory the scheme was read from.
    pub scope: String,
    /// What is wrong with the scheme.
    pub reason: String,
}

impl InvalidSchemeError {
    /// Creates a new scheme error.
    #[must_use]
    pub fn new(scope: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            scope: scope.into(),
            reason: reason.into(),
        }
    }
}

/// Raised when a stage directory holds outputs for partitions outside the
/// expected set.
#[derive(Debug, Clone, Error)]
#[error(
    "Integrity error for stage '{stage}': unexpected outputs [{}] in {}",
    unexpected.join(", "),
    directory.display()
)]
pub struct IntegrityError {
    /// The stage key.
    pub stage: String,
    /// Directory that was scanned.
    pub directory: PathBuf,
    /// Output files naming partitions outside the expected set.
    pub unexpected: Vec<String>,
}

impl IntegrityError {
    /// Creates a new integrity error.
    #[must_use]
    pub fn new(stage: impl Into<String>, directory: impl Into<PathBuf>, unexpected: Vec<String>) -> Self {
        Self {
            stage: stage.into(),
            directory: directory.into(),
            unexpected,
        }
    }
}

/// Raised when the scheduler rejects a job or answers with garbage.
#[derive(Debug, Clone, Error)]
#[error("Submission of job '{job_name}' failed: {message}")]
pub struct SubmissionError {
    /// Name of the job being submitted.
    pub job_name: String,
    /// Scheduler diagnostic.
    pub message: String,
}

impl SubmissionError {
    /// Creates a new submission error.
    #[must_use]
    pub fn new(job_name: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            job_name: job_name.into(),
            message: message.into(),
        }
    }
}

/// Raised when a status query fails or times out.
#[derive(Debug, Clone, Error)]
#[error("Scheduler query failed: {message}")]
pub struct QueryError {
    /// Diagnostic message.
    pub message: String,
}

impl QueryError {
    /// Creates a new query error.
    #[must_use]
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

/// Raised when a key is missing from a config context table.
#[derive(Debug, Clone, Error)]
#[error("Config lookup failed: no entry '{key}' in {table}")]
pub struct ConfigLookupError {
    /// The table (file) that was consulted.
    pub table: String,
    /// The missing key.
    pub key: String,
}

impl ConfigLookupError {
    /// Creates a new lookup error.
    #[must_use]
    pub fn new(table: impl Into<String>, key: impl Into<String>) -> Self {
        Self {
            table: table.into(),
            key: key.into(),
        }
    }
}

/// Convenience alias used across the crate.
pub type Result<T, E = CoordinatorError> = std::result::Result<T, E>;
