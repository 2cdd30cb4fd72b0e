use chrono::NaiveDate;

use crate::request::{Direction, RequestId, SubjectId};

/// Failures reported by the bulk-download service client.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ClientError {
    /// The provider itself refused the job because of its quota.
    #[error("provider rejected the request: {0}")]
    PolicyRejected(String),

    /// Timeouts, dropped connections and 5xx answers. Safe to retry.
    #[error("network error: {0}")]
    TransientNetwork(String),

    #[error("protocol error: {0}")]
    Protocol(String),
}

impl ClientError {
    /// The provider definitely did not accept the call.
    pub fn is_definite_rejection(&self) -> bool {
        matches!(self, Self::PolicyRejected(_) | Self::Protocol(_))
    }
}

/// Why a single document could not be turned into an invoice.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ParseError {
    #[error("document is not valid UTF-8")]
    Encoding,

    #[error("malformed XML: {0}")]
    Malformed(String),

    #[error("missing element <{0}>")]
    MissingElement(String),

    #[error("missing attribute {attribute} on <{element}>")]
    MissingAttribute { element: String, attribute: String },

    #[error("invalid amount {value:?} in {field}")]
    InvalidAmount { field: String, value: String },

    #[error("invalid date {0:?}")]
    InvalidDate(String),

    #[error("document does not belong to subject {0}")]
    SubjectMismatch(String),

    #[error("unsupported document: {0}")]
    Unsupported(String),
}

/// A package archive that cannot be read at all.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ArchiveError {
    #[error("cannot open archive: {0}")]
    Unreadable(String),

    #[error("cannot read archive entry: {0}")]
    Entry(String),
}

/// Errors raised by persistence collaborators.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RepositoryError {
    #[error("database error: {0}")]
    Database(String),

    #[error("corrupt record {id}: {reason}")]
    Corrupt { id: String, reason: String },

    #[error("not found: {0}")]
    NotFound(String),
}

/// Errors surfaced by pipeline operations.
///
/// Client failures during verify/download/import are written to the
/// request instead of being returned; only storage failures and caller
/// mistakes cross a stage boundary.
#[derive(Debug, thiserror::Error)]
pub enum SyncError {
    /// Creating the job would break the provider quota. Nothing was recorded.
    #[error("admission refused for {subject_id} ({direction}): {reason}")]
    PolicyViolation {
        subject_id: SubjectId,
        direction: Direction,
        reason: String,
    },

    #[error(transparent)]
    Client(#[from] ClientError),

    #[error("storage error: {0}")]
    Storage(#[from] RepositoryError),

    #[error("sync request not found: {0}")]
    NotFound(RequestId),

    #[error("request {id} cannot run this stage: {reason}")]
    InvalidState { id: RequestId, reason: String },

    #[error("invalid range: {from} is after {to}")]
    InvalidRange { from: NaiveDate, to: NaiveDate },
}

impl SyncError {
    pub fn invalid_state(id: &RequestId, reason: impl Into<String>) -> Self {
        Self::InvalidState {
            id: id.clone(),
            reason: reason.into(),
        }
    }

    pub fn is_policy_violation(&self) -> bool {
        matches!(self, Self::PolicyViolation { .. })
    }
}
