// Error taxonomy for the ingestion/reconciliation core
// Every variant maps to a stable machine code that callers can branch on.

use chrono::{DateTime, Utc};
use thiserror::Error;

/// Core workflow errors.
///
/// Recoverability contract:
/// - `DuplicateFile` is informational - the data is already there, no retry.
/// - `InvalidUpload` aborts the batch before any row is touched.
/// - `AlreadyDecided` means the caller holds stale state and should refresh.
/// - `Forbidden` cannot be recovered by the caller at all.
/// - `Timeout` and `Storage` are transient - the whole operation is safe to
///   retry because ingestion and fingerprinting are idempotent.
#[derive(Debug, Error)]
pub enum CoreError {
    /// Byte-identical file content was already ingested.
    #[error("file already ingested: '{filename}' uploaded at {original_upload_date}")]
    DuplicateFile {
        filename: String,
        original_upload_date: DateTime<Utc>,
    },

    /// Batch-level structural rejection (wrong extension, oversized file,
    /// unparseable container). Row-level failures never raise this - they
    /// become incomplete entries instead.
    #[error("upload rejected: {0}")]
    InvalidUpload(String),

    /// A confirm/reject hit a match that already left the pending state.
    #[error("match {match_id} was already decided as '{status}'")]
    AlreadyDecided { match_id: String, status: String },

    /// Referenced entity does not exist.
    #[error("{0} not found")]
    NotFound(String),

    /// Operation is disabled or its guard sequence was violated.
    #[error("forbidden: {0}")]
    Forbidden(String),

    /// Matching work exceeded its wall-clock budget.
    #[error("matching aborted after {elapsed_ms}ms (budget {budget_ms}ms)")]
    Timeout { elapsed_ms: u128, budget_ms: u128 },

    #[error("storage error: {0}")]
    Storage(#[from] rusqlite::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl CoreError {
    /// Stable machine-readable code, aligned with the API error contract.
    pub fn code(&self) -> &'static str {
        match self {
            CoreError::DuplicateFile { .. } => "DUPLICATE_FILE",
            CoreError::InvalidUpload(_) => "VALIDATION_ERROR",
            CoreError::AlreadyDecided { .. } => "CONFLICT",
            CoreError::NotFound(_) => "NOT_FOUND",
            CoreError::Forbidden(_) => "FORBIDDEN",
            CoreError::Timeout { .. } => "CONNECTION_ERROR",
            CoreError::Storage(_) => "CONNECTION_ERROR",
            CoreError::Other(_) => "INTERNAL",
        }
    }

    /// Whether retrying the same call can succeed without operator action.
    pub fn is_transient(&self) -> bool {
        matches!(self, CoreError::Timeout { .. } | CoreError::Storage(_))
    }
}

pub type CoreResult<T> = Result<T, CoreError>;
