//! Error Types
//!
//! The conductor distinguishes failures by where they are raised:
//!
//! - [`ConductorError`]: signaled at `play`/`start_sequence`/`register` call sites
//! - [`HandlerError`]: returned by a beat handler, contained by the executor
//! - [`CorrelationError`]: raised when a rehydrated callback cannot be resolved
//!
//! Mount failures are not errors at all; they come back as a
//! [`MountResult`](crate::plugin::MountResult) so one malformed plugin
//! cannot take down the host.

use thiserror::Error;

use crate::execution::context::{ExecutionStatus, RequestId};
use crate::execution::resources::ConflictType;
use crate::sequence::validator::ValidationIssue;

/// Convenience alias used across the crate.
pub type Result<T, E = ConductorError> = std::result::Result<T, E>;

/// Errors raised by the orchestrator's public API.
#[derive(Debug, Error)]
pub enum ConductorError {
    /// The sequence definition violates a structural rule.
    #[error("Sequence '{sequence_id}' is invalid: {}", join_issues(.issues))]
    Validation {
        sequence_id: String,
        issues: Vec<ValidationIssue>,
    },

    /// No sequence is registered under the given id or display name.
    #[error("Sequence not found: {0}")]
    SequenceNotFound(String),

    /// No plugin is mounted under the given id.
    #[error("Plugin not found: {0}")]
    PluginNotFound(String),

    /// The plugin exists but does not own the requested sequence.
    #[error("Sequence '{sequence_id}' is not mounted under plugin '{plugin_id}'")]
    NotMounted {
        plugin_id: String,
        sequence_id: String,
    },

    /// Resource ownership rejected the request.
    #[error("Resource '{resource_id}' is owned by {owner} ({conflict})")]
    Conflict {
        resource_id: String,
        owner: RequestId,
        conflict: ConflictType,
    },

    /// A chained (inline) execution did not complete.
    #[error("Chained sequence '{sequence_id}' ({request_id}) ended {status}")]
    ChainedExecutionFailed {
        sequence_id: String,
        request_id: RequestId,
        status: ExecutionStatus,
    },

    /// The request id is neither in flight nor in the statistics window.
    #[error("Unknown request: {0}")]
    UnknownRequest(RequestId),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("Invalid YAML: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("Invalid JSON: {0}")]
    Json(#[from] serde_json::Error),
}

fn join_issues(issues: &[ValidationIssue]) -> String {
    issues
        .iter()
        .map(|issue| issue.to_string())
        .collect::<Vec<_>>()
        .join("; ")
}

/// Failure reported by a beat handler.
///
/// Handlers usually build one from a string:
///
/// ```
/// use conductor::HandlerError;
///
/// let err = HandlerError::from("element not found");
/// assert_eq!(err.to_string(), "element not found");
/// ```
#[derive(Debug, Clone, Error, PartialEq)]
#[error("{message}")]
pub struct HandlerError {
    pub message: String,
}

impl HandlerError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

impl From<String> for HandlerError {
    fn from(message: String) -> Self {
        Self { message }
    }
}

impl From<&str> for HandlerError {
    fn from(message: &str) -> Self {
        Self::new(message)
    }
}

impl From<ConductorError> for HandlerError {
    fn from(err: ConductorError) -> Self {
        Self::new(err.to_string())
    }
}

impl From<CorrelationError> for HandlerError {
    fn from(err: CorrelationError) -> Self {
        Self::new(err.to_string())
    }
}

/// Errors raised when a rehydrated callback delegate is invoked.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum CorrelationError {
    /// The correlation entry was already purged.
    #[error("Correlation '{0}' is no longer registered")]
    UnknownCorrelation(String),

    /// The entry exists but holds nothing at this path.
    #[error("Correlation '{correlation_id}' has no callback at '{path}'")]
    UnknownPath {
        correlation_id: String,
        path: String,
    },
}
