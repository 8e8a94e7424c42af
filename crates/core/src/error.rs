//! Error taxonomy shared by every spoke crate.

use std::time::Duration;

/// Classified failure of a collaborator call (object client, access review,
/// typed work client).
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ClientError {
    #[error("not found: {0}")]
    NotFound(String),
    #[error("already exists: {0}")]
    AlreadyExists(String),
    /// Optimistic-concurrency or UID precondition mismatch.
    #[error("conflict: {0}")]
    Conflict(String),
    #[error("forbidden: {0}")]
    Forbidden(String),
    #[error("timed out after {0:?}")]
    Timeout(Duration),
    #[error("{0}")]
    Other(String),
}

impl ClientError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, ClientError::NotFound(_))
    }

    pub fn is_conflict(&self) -> bool {
        matches!(self, ClientError::Conflict(_))
    }

    pub fn is_forbidden(&self) -> bool {
        matches!(self, ClientError::Forbidden(_))
    }

    pub fn is_already_exists(&self) -> bool {
        matches!(self, ClientError::AlreadyExists(_))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum WorkError {
    /// The executor is denied; surfaced on status and re-checked after
    /// `requeue_after`.
    #[error("{}", not_allowed_message(.message, .requeue_after))]
    NotAllowed { message: String, requeue_after: Duration },
    /// Unsupported executor subject or missing service account. Not retried.
    #[error("invalid executor: {0}")]
    InvalidExecutor(String),
    /// Manifest could not be decoded or mapped to a resource.
    #[error("invalid manifest: {0}")]
    Manifest(String),
    #[error(transparent)]
    Client(#[from] ClientError),
    /// A call on one tracked resource failed.
    #[error("failed to {action} resource {gvr} with key {key}: {cause}")]
    Resource { action: String, gvr: String, key: String, cause: Box<WorkError> },
    /// Several independent failures from one pass.
    #[error("{}", join_errors(.0))]
    Aggregate(Vec<WorkError>),
}

fn join_errors(errs: &[WorkError]) -> String {
    errs.iter().map(|e| e.to_string()).collect::<Vec<_>>().join("; ")
}

fn not_allowed_message(message: &str, requeue_after: &Duration) -> String {
    if requeue_after.is_zero() {
        message.to_string()
    } else {
        format!("{}, will try again in {}s", message, requeue_after.as_secs())
    }
}

impl WorkError {
    pub fn not_allowed(message: impl Into<String>, requeue_after: Duration) -> Self {
        WorkError::NotAllowed { message: message.into(), requeue_after }
    }

    /// Wrap `err` with the resource it was raised for.
    pub fn for_resource(
        action: &str,
        gvr: &impl std::fmt::Display,
        namespace: &str,
        name: &str,
        err: impl Into<WorkError>,
    ) -> Self {
        WorkError::Resource {
            action: action.to_string(),
            gvr: gvr.to_string(),
            key: format!("{}/{}", namespace, name),
            cause: Box::new(err.into()),
        }
    }

    pub fn is_not_allowed(&self) -> bool {
        matches!(self, WorkError::NotAllowed { .. })
    }

    pub fn requeue_after(&self) -> Option<Duration> {
        match self {
            WorkError::NotAllowed { requeue_after, .. } => Some(*requeue_after),
            _ => None,
        }
    }

    /// Errors a later pass may clear on its own.
    pub fn is_transient(&self) -> bool {
        match self {
            WorkError::Client(_) => true,
            WorkError::Resource { cause, .. } => cause.is_transient(),
            WorkError::Aggregate(errs) => errs.iter().any(WorkError::is_transient),
            _ => false,
        }
    }

    /// `None` for no errors, the error itself for one, otherwise an aggregate.
    pub fn aggregate(mut errs: Vec<WorkError>) -> Option<WorkError> {
        match errs.len() {
            0 => None,
            1 => errs.pop(),
            _ => Some(WorkError::Aggregate(errs)),
        }
    }

    pub fn is_conflict(&self) -> bool {
        matches!(self, WorkError::Client(ClientError::Conflict(_)))
    }
}
