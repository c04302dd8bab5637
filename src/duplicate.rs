// Duplicate Detection
// A file is identified by the sha256 of its bytes, never its filename.
// The check itself is read-only; the fingerprint is only recorded when an
// ingestion actually proceeds.

use crate::db;
use anyhow::Result;
use chrono::{DateTime, Utc};
use rusqlite::Connection;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// The upload that first ingested a given fingerprint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PriorUpload {
    pub filename: String,
    pub uploaded_at: DateTime<Utc>,
}

/// Compute the content fingerprint for a file.
/// Deterministic over bytes: renaming a file changes nothing.
pub fn fingerprint_bytes(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    format!("{:x}", hasher.finalize())
}

/// Check whether this fingerprint was already ingested.
///
/// Returns the original upload's filename and timestamp when it was, so the
/// caller can tell the operator exactly which earlier upload this repeats.
pub fn check_fingerprint(conn: &Connection, fingerprint: &str) -> Result<Option<PriorUpload>> {
    let prior = db::find_live_batch_by_fingerprint(conn, fingerprint)?.map(|batch| PriorUpload {
        filename: batch.filename,
        uploaded_at: batch.uploaded_at,
    });
    Ok(prior)
}
