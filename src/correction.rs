// Correction Loop
// A second, narrower ingestion pass: the operator edits incomplete entries
// and resubmits. Only rows the operator actually touched are retried;
// untouched rows keep their stale invalid data out of the attempt.

use crate::db::{self, InsertOutcome, SourceKind};
use crate::error::CoreResult;
use crate::validation::{IncompleteEntry, RowValidator};
use rusqlite::Connection;
use serde::Serialize;

// ============================================================================
// RESUBMISSION REPORT
// ============================================================================

#[derive(Debug, Clone, Serialize)]
pub struct ResubmitReport {
    pub saved: usize,
    pub duplicate_rows: usize,
    /// Corrected rows that still fail validation, with fresh error messages
    pub still_incomplete: Vec<IncompleteEntry>,
    /// True when no row carried the corrected flag - an explicit no-op,
    /// never a silent success
    pub nothing_to_save: bool,
}

// ============================================================================
// CORRECTION QUEUE
// ============================================================================

/// Holds the incomplete entries of one batch while the operator works on
/// them. Entries leave the queue by successful resubmission or discard.
pub struct CorrectionQueue {
    batch_id: String,
    side: SourceKind,
    entries: Vec<IncompleteEntry>,
    validator: RowValidator,
}

impl CorrectionQueue {
    pub fn new(batch_id: &str, side: SourceKind, entries: Vec<IncompleteEntry>) -> Self {
        CorrectionQueue {
            batch_id: batch_id.to_string(),
            side,
            entries,
            validator: RowValidator::new(),
        }
    }

    pub fn entries(&self) -> &[IncompleteEntry] {
        &self.entries
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Apply one operator edit to the entry for `row_number`.
    pub fn edit(&mut self, row_number: usize, field: &str, value: Option<String>) -> Result<(), String> {
        let entry = self
            .entry_mut(row_number)
            .ok_or_else(|| format!("no incomplete entry for row {}", row_number))?;
        entry.set_field(field, value)
    }

    /// Restore the entry's original invalid values and clear its flag.
    pub fn reset(&mut self, row_number: usize) -> Result<(), String> {
        let entry = self
            .entry_mut(row_number)
            .ok_or_else(|| format!("no incomplete entry for row {}", row_number))?;
        entry.reset();
        Ok(())
    }

    /// Drop the entry without ever persisting it.
    pub fn discard(&mut self, row_number: usize) {
        self.entries.retain(|e| e.row_number != row_number);
    }

    /// Re-run validation over the corrected rows and persist the ones that
    /// now pass. Rows that still fail stay in the queue with an updated
    /// error so the operator can iterate. Untouched rows are not attempted.
    pub fn resubmit(&mut self, conn: &Connection) -> CoreResult<ResubmitReport> {
        if !self.entries.iter().any(|e| e.corrected) {
            return Ok(ResubmitReport {
                saved: 0,
                duplicate_rows: 0,
                still_incomplete: Vec::new(),
                nothing_to_save: true,
            });
        }

        let mut saved = 0usize;
        let mut duplicate_rows = 0usize;
        let mut still_incomplete = Vec::new();
        let mut remaining = Vec::new();

        for mut entry in self.entries.drain(..) {
            if !entry.corrected {
                remaining.push(entry);
                continue;
            }

            match self.validator.validate(&entry.fields) {
                Ok(valid) => {
                    let record = valid.into_record(&self.batch_id, self.side);
                    match db::insert_record(conn, &record)? {
                        InsertOutcome::Inserted => saved += 1,
                        InsertOutcome::DuplicateRow => duplicate_rows += 1,
                    }
                    // Entry is destroyed on success - it does not return
                }
                Err(revalidated) => {
                    entry.error = revalidated.error;
                    still_incomplete.push(entry.clone());
                    remaining.push(entry);
                }
            }
        }

        self.entries = remaining;

        Ok(ResubmitReport {
            saved,
            duplicate_rows,
            still_incomplete,
            nothing_to_save: false,
        })
    }

    fn entry_mut(&mut self, row_number: usize) -> Option<&mut IncompleteEntry> {
        self.entries.iter_mut().find(|e| e.row_number == row_number)
    }
}

// ============================================================================
// TESTS
// ============================================================================
