// Ingestion Orchestrator
// Drives one uploaded file through the gates: size/extension checks,
// duplicate detection, parsing, per-row validation, persistence. Row
// failures never abort the batch - they are collected for correction.

use crate::config::UploadLimits;
use crate::db::{self, BatchStatus, InsertOutcome, SourceKind, UploadBatch};
use crate::duplicate::{self, fingerprint_bytes};
use crate::error::{CoreError, CoreResult};
use crate::parser::{parser_for, StatementFormat};
use crate::validation::{IncompleteEntry, RowValidator};
use rusqlite::Connection;
use serde::Serialize;

// ============================================================================
// INGESTION REPORT
// ============================================================================

/// Outcome of one ingestion. Every row of the file is accounted for:
/// `total_processed == imported + duplicate_rows + incomplete.len()`.
#[derive(Debug, Clone, Serialize)]
pub struct IngestionReport {
    pub batch_id: String,
    pub status: BatchStatus,
    pub imported: usize,
    pub duplicate_rows: usize,
    pub incomplete: Vec<IncompleteEntry>,
    pub total_processed: usize,
}

// ============================================================================
// INGESTION PIPELINE
// ============================================================================

pub struct IngestionPipeline {
    limits: UploadLimits,
    validator: RowValidator,
}

impl IngestionPipeline {
    pub fn new(limits: UploadLimits) -> Self {
        IngestionPipeline {
            limits,
            validator: RowValidator::new(),
        }
    }

    /// Ingest one uploaded file.
    ///
    /// The whole pass runs inside a single SQLite transaction: either the
    /// batch lands with every row outcome reflected in the report, or a
    /// storage failure rolls everything back. There is no state where rows
    /// were written but the report does not say so.
    pub fn ingest(
        &self,
        conn: &mut Connection,
        bytes: &[u8],
        filename: &str,
        source_kind: SourceKind,
    ) -> CoreResult<IngestionReport> {
        // 1. Structural gates - these abort before any row is parsed
        let extension = file_extension(filename).ok_or_else(|| {
            CoreError::InvalidUpload(format!("'{}' has no file extension", filename))
        })?;

        let allowed = match source_kind {
            SourceKind::Bank => &self.limits.bank_extensions,
            SourceKind::Company => &self.limits.company_extensions,
        };
        if !allowed.iter().any(|a| a == &extension) {
            return Err(CoreError::InvalidUpload(format!(
                "file type '.{}' is not accepted for {} uploads (allowed: {})",
                extension,
                source_kind.as_str(),
                allowed.join(", ")
            )));
        }

        if bytes.len() > self.limits.max_file_bytes {
            return Err(CoreError::InvalidUpload(format!(
                "file is {} bytes, over the {} byte limit",
                bytes.len(),
                self.limits.max_file_bytes
            )));
        }

        // 2. Duplicate detection on the content fingerprint
        let fingerprint = fingerprint_bytes(bytes);
        if let Some(prior) = duplicate::check_fingerprint(conn, &fingerprint)? {
            // The attempt itself is still recorded, as a 'duplicate' batch
            let attempt =
                UploadBatch::new(filename, &fingerprint, source_kind, BatchStatus::Duplicate);
            db::insert_batch(conn, &attempt).map_err(CoreError::Other)?;
            return Err(CoreError::DuplicateFile {
                filename: prior.filename,
                original_upload_date: prior.uploaded_at,
            });
        }

        // 3. Parse - a container-level failure aborts the batch
        let format = StatementFormat::from_extension(&extension).ok_or_else(|| {
            CoreError::InvalidUpload(format!("no parser available for '.{}'", extension))
        })?;
        let rows = parser_for(format)
            .parse(bytes)
            .map_err(|e| CoreError::InvalidUpload(e.to_string()))?;

        // 4. Validate and persist row by row
        let mut batch = UploadBatch::new(filename, &fingerprint, source_kind, BatchStatus::Processed);
        let tx = conn.transaction().map_err(CoreError::Storage)?;

        let mut imported = 0usize;
        let mut duplicate_rows = 0usize;
        let mut incomplete = Vec::new();

        for row in &rows {
            match self.validator.validate(row) {
                Ok(valid) => {
                    let record = valid.into_record(&batch.id, source_kind);
                    match db::insert_record(&tx, &record).map_err(CoreError::Other)? {
                        InsertOutcome::Inserted => imported += 1,
                        InsertOutcome::DuplicateRow => duplicate_rows += 1,
                    }
                }
                Err(entry) => incomplete.push(entry),
            }
        }

        batch.status = if incomplete.is_empty() {
            BatchStatus::Processed
        } else {
            BatchStatus::Partial
        };

        if let Err(e) = db::insert_batch(&tx, &batch) {
            // Near-simultaneous upload of the same bytes: the partial unique
            // index on the fingerprint fired. Report it as the duplicate it is.
            drop(tx);
            if is_constraint_violation(&e) {
                if let Some(prior) = duplicate::check_fingerprint(conn, &fingerprint)? {
                    return Err(CoreError::DuplicateFile {
                        filename: prior.filename,
                        original_upload_date: prior.uploaded_at,
                    });
                }
            }
            return Err(CoreError::Other(e));
        }

        tx.commit().map_err(CoreError::Storage)?;

        Ok(IngestionReport {
            batch_id: batch.id,
            status: batch.status,
            imported,
            duplicate_rows,
            total_processed: imported + duplicate_rows + incomplete.len(),
            incomplete,
        })
    }
}

fn file_extension(filename: &str) -> Option<String> {
    let (stem, ext) = filename.rsplit_once('.')?;
    if stem.is_empty() || ext.is_empty() {
        return None;
    }
    Some(ext.to_lowercase())
}

fn is_constraint_violation(err: &anyhow::Error) -> bool {
    matches!(
        err.downcast_ref::<rusqlite::Error>(),
        Some(rusqlite::Error::SqliteFailure(e, _))
            if e.code == rusqlite::ErrorCode::ConstraintViolation
    )
}

// ============================================================================
// TESTS
// ============================================================================
