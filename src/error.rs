use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::config::ConfigError;

/// Top-level error for operations which may fail in several layers.
#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Registry(#[from] RegistryError),

    #[error(transparent)]
    Sync(#[from] SyncError),

    #[error(transparent)]
    Config(#[from] ConfigError),
}

/// Failures encountered while reconciling a single application.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SyncError {
    #[error("source {location} unavailable: {reason}")]
    SourceUnavailable { location: String, reason: String },

    #[error("revision {revision} not found in {location}")]
    RevisionNotFound { location: String, revision: String },

    #[error("failed to parse {file}: {reason}")]
    ParseError { file: String, reason: String },

    #[error("cluster {cluster} unreachable: {reason}")]
    Unreachable { cluster: String, reason: String },

    #[error("cluster {cluster} rejected credentials: {reason}")]
    AuthRejected { cluster: String, reason: String },

    #[error("conflict while applying {resource}: {reason}")]
    ApplyConflict { resource: String, reason: String },

    #[error("cluster refused {resource}: {reason}")]
    Rejected { resource: String, reason: String },

    #[error("sync cancelled")]
    Cancelled,
}

impl SyncError {
    /// Transient failures which are retried with backoff inside a cycle.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            SyncError::SourceUnavailable { .. } | SyncError::Unreachable { .. }
        )
    }

    /// Failures which make every further call against the same cluster
    /// pointless for the rest of the cycle.
    pub fn is_cluster_wide(&self) -> bool {
        matches!(
            self,
            SyncError::Unreachable { .. } | SyncError::AuthRejected { .. }
        )
    }

    pub fn reason(&self) -> FailureReason {
        match self {
            SyncError::SourceUnavailable { .. } => FailureReason::SourceUnavailable,
            SyncError::RevisionNotFound { .. } => FailureReason::RevisionNotFound,
            SyncError::ParseError { .. } => FailureReason::ParseError,
            SyncError::Unreachable { .. } => FailureReason::Unreachable,
            SyncError::AuthRejected { .. } => FailureReason::AuthRejected,
            SyncError::ApplyConflict { .. } => FailureReason::ApplyConflict,
            SyncError::Rejected { .. } => FailureReason::Rejected,
            SyncError::Cancelled => FailureReason::Cancelled,
        }
    }
}

/// Serializable classification of a [`SyncError`], as recorded in sync state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FailureReason {
    SourceUnavailable,
    RevisionNotFound,
    ParseError,
    Unreachable,
    AuthRejected,
    ApplyConflict,
    Rejected,
    Cancelled,
}

impl FailureReason {
    /// Fatal reasons need an operator or a new revision before a retry can
    /// succeed, so automatic retries are suppressed.
    pub fn is_fatal(self) -> bool {
        matches!(
            self,
            FailureReason::RevisionNotFound | FailureReason::ParseError | FailureReason::AuthRejected
        )
    }
}

impl std::fmt::Display for FailureReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            FailureReason::SourceUnavailable => "SourceUnavailable",
            FailureReason::RevisionNotFound => "RevisionNotFound",
            FailureReason::ParseError => "ParseError",
            FailureReason::Unreachable => "Unreachable",
            FailureReason::AuthRejected => "AuthRejected",
            FailureReason::ApplyConflict => "ApplyConflict",
            FailureReason::Rejected => "Rejected",
            FailureReason::Cancelled => "Cancelled",
        };

        f.write_str(name)
    }
}

/// Errors raised by registration and lookup of applications and clusters.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RegistryError {
    #[error("application {0} is already registered")]
    DuplicateName(String),

    #[error("cluster {0} is already registered")]
    DuplicateCluster(String),

    #[error("application {application} references unknown cluster {cluster}")]
    UnknownCluster { application: String, cluster: String },

    #[error("cluster {cluster} is still referenced by {}", .applications.join(", "))]
    ClusterInUse {
        cluster: String,
        applications: Vec<String>,
    },

    #[error("application {0} is not registered")]
    UnknownApplication(String),
}
