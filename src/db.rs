use anyhow::Result;
use chrono::{DateTime, NaiveDate, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

// ============================================================================
// ENUMS
// ============================================================================

/// Which upload surface a file (and its rows) came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceKind {
    Bank,
    Company,
}

impl SourceKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Bank => "bank",
            Self::Company => "company",
        }
    }

    pub fn from_str(s: &str) -> Self {
        match s {
            "company" => Self::Company,
            _ => Self::Bank,
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "bank" => Some(Self::Bank),
            "company" => Some(Self::Company),
            _ => None,
        }
    }
}

/// Outcome of one upload attempt. Immutable once the batch row is written.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BatchStatus {
    Processed,
    Partial,
    Duplicate,
}

impl BatchStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Processed => "processed",
            Self::Partial => "partial",
            Self::Duplicate => "duplicate",
        }
    }

    pub fn from_str(s: &str) -> Self {
        match s {
            "partial" => Self::Partial,
            "duplicate" => Self::Duplicate,
            _ => Self::Processed,
        }
    }
}

/// Direction of a ledger record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RecordKind {
    Credit,
    Debit,
}

impl RecordKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Credit => "credit",
            Self::Debit => "debit",
        }
    }

    pub fn from_str(s: &str) -> Self {
        match s {
            "credit" => Self::Credit,
            _ => Self::Debit,
        }
    }
}

/// Lifecycle of a reconciliation match. `Confirmed` and `Rejected` are
/// terminal; there is no transition back to `Pending`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MatchStatus {
    Pending,
    Confirmed,
    Rejected,
}

impl MatchStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Confirmed => "confirmed",
            Self::Rejected => "rejected",
        }
    }

    pub fn from_str(s: &str) -> Self {
        match s {
            "confirmed" => Self::Confirmed,
            "rejected" => Self::Rejected,
            _ => Self::Pending,
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Pending)
    }
}

// ============================================================================
// CORE STRUCTS
// ============================================================================

/// One upload attempt. Written exactly once, never updated.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UploadBatch {
    pub id: String,
    pub filename: String,
    /// sha256 over the raw file bytes (not the filename)
    pub fingerprint: String,
    pub source_kind: SourceKind,
    pub status: BatchStatus,
    pub uploaded_at: DateTime<Utc>,
}

impl UploadBatch {
    pub fn new(filename: &str, fingerprint: &str, source_kind: SourceKind, status: BatchStatus) -> Self {
        UploadBatch {
            id: uuid::Uuid::new_v4().to_string(),
            filename: filename.to_string(),
            fingerprint: fingerprint.to_string(),
            source_kind,
            status,
            uploaded_at: Utc::now(),
        }
    }
}

/// A persisted financial record - a bank transaction or a company ledger
/// entry, discriminated by `side`. Immutable after creation except through
/// explicit edit; reconciliation never mutates it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LedgerRecord {
    pub id: String,
    pub batch_id: String,
    pub side: SourceKind,
    pub date: NaiveDate,
    pub description: String,
    pub amount: f64,
    pub category: String,
    pub kind: RecordKind,
}

impl LedgerRecord {
    /// Row-level idempotency hash for duplicate-row detection.
    /// NOTE: this is for DEDUPLICATION, not identity - identity is `id`.
    pub fn row_hash(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(format!(
            "{}|{}|{:.2}|{}",
            self.side.as_str(),
            self.date,
            self.amount,
            self.description
        ));
        format!("{:x}", hasher.finalize())
    }
}

/// A candidate pairing between a bank transaction and a company entry,
/// advancing through the operator's confirm/reject decision.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReconciliationMatch {
    pub id: String,
    pub bank_record_id: String,
    pub company_record_id: String,
    /// Confidence in [0,1] from the matcher
    pub match_score: f64,
    pub status: MatchStatus,
    /// Present when the anomaly-aware pass flagged the bank transaction.
    /// Annotation only - the confirm/reject gate is identical either way.
    pub anomaly_reason: Option<String>,
    pub created_at: DateTime<Utc>,
    pub decided_at: Option<DateTime<Utc>>,
}

// ============================================================================
// SCHEMA
// ============================================================================

pub fn setup_database(conn: &Connection) -> Result<()> {
    // Enable WAL mode for crash recovery
    conn.pragma_update(None, "journal_mode", "WAL")?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS upload_batches (
            id TEXT PRIMARY KEY,
            filename TEXT NOT NULL,
            fingerprint TEXT NOT NULL,
            source_kind TEXT NOT NULL,
            status TEXT NOT NULL,
            uploaded_at TEXT NOT NULL
        )",
        [],
    )?;

    // Duplicate-detection invariant: at most one non-duplicate batch per
    // fingerprint, enforced by the storage layer so concurrent uploads of
    // the same bytes cannot both land as 'processed'.
    conn.execute(
        "CREATE UNIQUE INDEX IF NOT EXISTS idx_batches_live_fingerprint
         ON upload_batches(fingerprint) WHERE status != 'duplicate'",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS ledger_records (
            id TEXT PRIMARY KEY,
            batch_id TEXT NOT NULL,
            side TEXT NOT NULL,
            row_hash TEXT UNIQUE NOT NULL,
            date TEXT NOT NULL,
            description TEXT NOT NULL,
            amount REAL NOT NULL,
            category TEXT NOT NULL,
            kind TEXT NOT NULL,
            created_at TEXT NOT NULL
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS reconciliation_matches (
            id TEXT PRIMARY KEY,
            bank_record_id TEXT NOT NULL,
            company_record_id TEXT NOT NULL,
            match_score REAL NOT NULL,
            status TEXT NOT NULL,
            anomaly_reason TEXT,
            created_at TEXT NOT NULL,
            decided_at TEXT
        )",
        [],
    )?;

    // No-double-booking invariant: a record carries at most one *pending*
    // match at a time. Rejected history can accumulate freely.
    conn.execute(
        "CREATE UNIQUE INDEX IF NOT EXISTS idx_match_pending_bank
         ON reconciliation_matches(bank_record_id) WHERE status = 'pending'",
        [],
    )?;
    conn.execute(
        "CREATE UNIQUE INDEX IF NOT EXISTS idx_match_pending_company
         ON reconciliation_matches(company_record_id) WHERE status = 'pending'",
        [],
    )?;

    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_records_side ON ledger_records(side)",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_records_date ON ledger_records(date)",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_matches_status ON reconciliation_matches(status)",
        [],
    )?;

    Ok(())
}

// ============================================================================
// UPLOAD BATCHES
// ============================================================================

pub fn insert_batch(conn: &Connection, batch: &UploadBatch) -> Result<()> {
    conn.execute(
        "INSERT INTO upload_batches (id, filename, fingerprint, source_kind, status, uploaded_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        params![
            batch.id,
            batch.filename,
            batch.fingerprint,
            batch.source_kind.as_str(),
            batch.status.as_str(),
            batch.uploaded_at.to_rfc3339(),
        ],
    )?;
    Ok(())
}

fn batch_from_row(row: &rusqlite::Row) -> rusqlite::Result<UploadBatch> {
    let source_kind: String = row.get(3)?;
    let status: String = row.get(4)?;
    let uploaded_at: String = row.get(5)?;
    Ok(UploadBatch {
        id: row.get(0)?,
        filename: row.get(1)?,
        fingerprint: row.get(2)?,
        source_kind: SourceKind::from_str(&source_kind),
        status: BatchStatus::from_str(&status),
        uploaded_at: parse_utc(&uploaded_at),
    })
}

/// Find the non-duplicate batch that first ingested this fingerprint.
/// Read-only; records nothing.
pub fn find_live_batch_by_fingerprint(
    conn: &Connection,
    fingerprint: &str,
) -> Result<Option<UploadBatch>> {
    let batch = conn
        .query_row(
            "SELECT id, filename, fingerprint, source_kind, status, uploaded_at
             FROM upload_batches
             WHERE fingerprint = ?1 AND status != 'duplicate'",
            params![fingerprint],
            batch_from_row,
        )
        .optional()?;
    Ok(batch)
}

/// Per-batch statistics for display
#[derive(Debug, Clone, Serialize)]
pub struct BatchStat {
    pub id: String,
    pub filename: String,
    pub source_kind: SourceKind,
    pub status: BatchStatus,
    pub uploaded_at: DateTime<Utc>,
    pub record_count: i64,
    pub total_amount: f64,
}

pub fn list_batches(conn: &Connection) -> Result<Vec<BatchStat>> {
    let mut stmt = conn.prepare(
        "SELECT b.id, b.filename, b.source_kind, b.status, b.uploaded_at,
                COUNT(r.id) as record_count,
                COALESCE(SUM(ABS(r.amount)), 0.0) as total_amount
         FROM upload_batches b
         LEFT JOIN ledger_records r ON r.batch_id = b.id
         GROUP BY b.id
         ORDER BY b.uploaded_at DESC",
    )?;

    let stats = stmt
        .query_map([], |row| {
            let source_kind: String = row.get(2)?;
            let status: String = row.get(3)?;
            let uploaded_at: String = row.get(4)?;
            Ok(BatchStat {
                id: row.get(0)?,
                filename: row.get(1)?,
                source_kind: SourceKind::from_str(&source_kind),
                status: BatchStatus::from_str(&status),
                uploaded_at: parse_utc(&uploaded_at),
                record_count: row.get(5)?,
                total_amount: row.get(6)?,
            })
        })?
        .collect::<Result<Vec<_>, _>>()?;

    Ok(stats)
}

// ============================================================================
// LEDGER RECORDS
// ============================================================================

/// Result of persisting one row.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertOutcome {
    Inserted,
    /// The row-level idempotency hash already exists.
    DuplicateRow,
}

pub fn insert_record(conn: &Connection, record: &LedgerRecord) -> Result<InsertOutcome> {
    let result = conn.execute(
        "INSERT INTO ledger_records (id, batch_id, side, row_hash, date, description,
                                     amount, category, kind, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
        params![
            record.id,
            record.batch_id,
            record.side.as_str(),
            record.row_hash(),
            record.date.to_string(),
            record.description,
            record.amount,
            record.category,
            record.kind.as_str(),
            Utc::now().to_rfc3339(),
        ],
    );

    match result {
        Ok(_) => Ok(InsertOutcome::Inserted),
        Err(rusqlite::Error::SqliteFailure(err, _))
            if err.code == rusqlite::ErrorCode::ConstraintViolation =>
        {
            Ok(InsertOutcome::DuplicateRow)
        }
        Err(e) => Err(e.into()),
    }
}

fn record_from_row(row: &rusqlite::Row) -> rusqlite::Result<LedgerRecord> {
    let side: String = row.get(2)?;
    let date: String = row.get(3)?;
    let kind: String = row.get(7)?;
    Ok(LedgerRecord {
        id: row.get(0)?,
        batch_id: row.get(1)?,
        side: SourceKind::from_str(&side),
        date: NaiveDate::parse_from_str(&date, "%Y-%m-%d").unwrap_or_default(),
        description: row.get(4)?,
        amount: row.get(5)?,
        category: row.get(6)?,
        kind: RecordKind::from_str(&kind),
    })
}

const RECORD_COLUMNS: &str =
    "id, batch_id, side, date, description, amount, category, kind";

pub fn get_records(conn: &Connection, side: SourceKind) -> Result<Vec<LedgerRecord>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {RECORD_COLUMNS} FROM ledger_records WHERE side = ?1 ORDER BY id"
    ))?;
    let records = stmt
        .query_map(params![side.as_str()], record_from_row)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(records)
}

pub fn get_record(conn: &Connection, id: &str) -> Result<Option<LedgerRecord>> {
    let record = conn
        .query_row(
            &format!("SELECT {RECORD_COLUMNS} FROM ledger_records WHERE id = ?1"),
            params![id],
            record_from_row,
        )
        .optional()?;
    Ok(record)
}

/// Records on one side with no outstanding pending match and no confirmed
/// match. Rejected matches do not block a record from being re-proposed.
/// Ordered by id so repeated runs see an identical sequence.
pub fn get_unmatched_records(
    conn: &Connection,
    side: SourceKind,
    date_range: Option<(NaiveDate, NaiveDate)>,
) -> Result<Vec<LedgerRecord>> {
    let column = match side {
        SourceKind::Bank => "bank_record_id",
        SourceKind::Company => "company_record_id",
    };

    let (from, to) = match date_range {
        Some((from, to)) => (from.to_string(), to.to_string()),
        None => ("0000-01-01".to_string(), "9999-12-31".to_string()),
    };

    let mut stmt = conn.prepare(&format!(
        "SELECT {RECORD_COLUMNS} FROM ledger_records r
         WHERE r.side = ?1
           AND r.date >= ?2 AND r.date <= ?3
           AND NOT EXISTS (
               SELECT 1 FROM reconciliation_matches m
               WHERE m.{column} = r.id AND m.status IN ('pending', 'confirmed')
           )
         ORDER BY r.id"
    ))?;

    let records = stmt
        .query_map(params![side.as_str(), from, to], record_from_row)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(records)
}

pub fn count_records(conn: &Connection) -> Result<i64> {
    let count: i64 = conn.query_row("SELECT COUNT(*) FROM ledger_records", [], |row| row.get(0))?;
    Ok(count)
}

// ============================================================================
// RECONCILIATION MATCHES
// ============================================================================

fn match_from_row(row: &rusqlite::Row) -> rusqlite::Result<ReconciliationMatch> {
    let status: String = row.get(4)?;
    let created_at: String = row.get(6)?;
    let decided_at: Option<String> = row.get(7)?;
    Ok(ReconciliationMatch {
        id: row.get(0)?,
        bank_record_id: row.get(1)?,
        company_record_id: row.get(2)?,
        match_score: row.get(3)?,
        status: MatchStatus::from_str(&status),
        anomaly_reason: row.get(5)?,
        created_at: parse_utc(&created_at),
        decided_at: decided_at.map(|s| parse_utc(&s)),
    })
}

const MATCH_COLUMNS: &str = "id, bank_record_id, company_record_id, match_score, status, \
                             anomaly_reason, created_at, decided_at";

/// Insert a pending match. Returns false when a concurrent run already holds
/// a pending match on either record (the partial unique index fires) - the
/// caller treats that as "someone else got there first", not an error.
pub fn insert_match(conn: &Connection, m: &ReconciliationMatch) -> Result<bool> {
    let result = conn.execute(
        "INSERT INTO reconciliation_matches
            (id, bank_record_id, company_record_id, match_score, status,
             anomaly_reason, created_at, decided_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
        params![
            m.id,
            m.bank_record_id,
            m.company_record_id,
            m.match_score,
            m.status.as_str(),
            m.anomaly_reason,
            m.created_at.to_rfc3339(),
            m.decided_at.map(|d| d.to_rfc3339()),
        ],
    );

    match result {
        Ok(_) => Ok(true),
        Err(rusqlite::Error::SqliteFailure(err, _))
            if err.code == rusqlite::ErrorCode::ConstraintViolation =>
        {
            Ok(false)
        }
        Err(e) => Err(e.into()),
    }
}

pub fn get_match(conn: &Connection, id: &str) -> Result<Option<ReconciliationMatch>> {
    let m = conn
        .query_row(
            &format!("SELECT {MATCH_COLUMNS} FROM reconciliation_matches WHERE id = ?1"),
            params![id],
            match_from_row,
        )
        .optional()?;
    Ok(m)
}

pub fn get_pending_matches(conn: &Connection) -> Result<Vec<ReconciliationMatch>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {MATCH_COLUMNS} FROM reconciliation_matches
         WHERE status = 'pending' ORDER BY created_at, id"
    ))?;
    let matches = stmt
        .query_map([], match_from_row)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(matches)
}

/// Transition a pending match into a terminal state.
///
/// The `status = 'pending'` guard makes concurrent deciders serialize: only
/// the first caller updates a row; the second sees 0 rows affected and must
/// report the conflict instead of overwriting.
pub fn decide_match(conn: &Connection, id: &str, status: MatchStatus) -> Result<usize> {
    let updated = conn.execute(
        "UPDATE reconciliation_matches
         SET status = ?2, decided_at = ?3
         WHERE id = ?1 AND status = 'pending'",
        params![id, status.as_str(), Utc::now().to_rfc3339()],
    )?;
    Ok(updated)
}

/// Counts by status: (total, confirmed, pending, rejected).
pub fn match_status_counts(conn: &Connection) -> Result<(i64, i64, i64, i64)> {
    conn.query_row(
        "SELECT COUNT(*),
                COALESCE(SUM(CASE WHEN status = 'confirmed' THEN 1 ELSE 0 END), 0),
                COALESCE(SUM(CASE WHEN status = 'pending' THEN 1 ELSE 0 END), 0),
                COALESCE(SUM(CASE WHEN status = 'rejected' THEN 1 ELSE 0 END), 0)
         FROM reconciliation_matches",
        [],
        |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?)),
    )
    .map_err(Into::into)
}

/// Sum of matched bank amounts over confirmed matches.
pub fn total_reconciled_value(conn: &Connection) -> Result<f64> {
    conn.query_row(
        "SELECT COALESCE(SUM(ABS(r.amount)), 0.0)
         FROM reconciliation_matches m
         JOIN ledger_records r ON r.id = m.bank_record_id
         WHERE m.status = 'confirmed'",
        [],
        |row| row.get(0),
    )
    .map_err(Into::into)
}

// ============================================================================
// AGE-BASED DELETION (used by the guarded purge flow)
// ============================================================================

pub fn count_batches_older_than(conn: &Connection, cutoff: DateTime<Utc>) -> Result<i64> {
    let count: i64 = conn.query_row(
        "SELECT COUNT(*) FROM upload_batches WHERE uploaded_at < ?1",
        params![cutoff.to_rfc3339()],
        |row| row.get(0),
    )?;
    Ok(count)
}

pub fn batch_ids_older_than(conn: &Connection, cutoff: DateTime<Utc>) -> Result<Vec<String>> {
    let mut stmt = conn.prepare(
        "SELECT id FROM upload_batches WHERE uploaded_at < ?1 ORDER BY uploaded_at",
    )?;
    let ids = stmt
        .query_map(params![cutoff.to_rfc3339()], |row| row.get(0))?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(ids)
}

/// Delete batches older than the cutoff together with their records and any
/// matches referencing those records. Returns (batches, records) deleted.
pub fn delete_batches_older_than(
    conn: &mut Connection,
    cutoff: DateTime<Utc>,
) -> Result<(usize, usize)> {
    let tx = conn.transaction()?;
    let cutoff_str = cutoff.to_rfc3339();

    tx.execute(
        "DELETE FROM reconciliation_matches WHERE bank_record_id IN (
             SELECT r.id FROM ledger_records r
             JOIN upload_batches b ON b.id = r.batch_id
             WHERE b.uploaded_at < ?1
         ) OR company_record_id IN (
             SELECT r.id FROM ledger_records r
             JOIN upload_batches b ON b.id = r.batch_id
             WHERE b.uploaded_at < ?1
         )",
        params![cutoff_str],
    )?;

    let records = tx.execute(
        "DELETE FROM ledger_records WHERE batch_id IN (
             SELECT id FROM upload_batches WHERE uploaded_at < ?1
         )",
        params![cutoff_str],
    )?;

    let batches = tx.execute(
        "DELETE FROM upload_batches WHERE uploaded_at < ?1",
        params![cutoff_str],
    )?;

    tx.commit()?;
    Ok((batches, records))
}

fn parse_utc(s: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_default()
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    pub(crate) fn create_test_record(
        batch_id: &str,
        side: SourceKind,
        date: &str,
        description: &str,
        amount: f64,
    ) -> LedgerRecord {
        LedgerRecord {
            id: uuid::Uuid::new_v4().to_string(),
            batch_id: batch_id.to_string(),
            side,
            date: NaiveDate::parse_from_str(date, "%Y-%m-%d").unwrap(),
            description: description.to_string(),
            amount,
            category: "Test".to_string(),
            kind: if amount >= 0.0 { RecordKind::Credit } else { RecordKind::Debit },
        }
    }

    #[test]
    fn test_insert_record_is_idempotent() {
        let conn = Connection::open_in_memory().unwrap();
        setup_database(&conn).unwrap();

        let record = create_test_record("b1", SourceKind::Bank, "2025-01-05", "STARBUCKS", -4.99);
        assert_eq!(insert_record(&conn, &record).unwrap(), InsertOutcome::Inserted);

        // Same content, new identity: the row hash still collides
        let mut again = record.clone();
        again.id = uuid::Uuid::new_v4().to_string();
        assert_eq!(insert_record(&conn, &again).unwrap(), InsertOutcome::DuplicateRow);

        assert_eq!(count_records(&conn).unwrap(), 1);
    }

    #[test]
    fn test_live_fingerprint_is_unique() {
        let conn = Connection::open_in_memory().unwrap();
        setup_database(&conn).unwrap();

        let first = UploadBatch::new("a.csv", "fp-1", SourceKind::Bank, BatchStatus::Processed);
        insert_batch(&conn, &first).unwrap();

        // A duplicate-status batch with the same fingerprint is fine
        let dup = UploadBatch::new("a.csv", "fp-1", SourceKind::Bank, BatchStatus::Duplicate);
        insert_batch(&conn, &dup).unwrap();

        // A second live batch with the same fingerprint is not
        let second = UploadBatch::new("a-copy.csv", "fp-1", SourceKind::Bank, BatchStatus::Processed);
        assert!(insert_batch(&conn, &second).is_err());

        let found = find_live_batch_by_fingerprint(&conn, "fp-1").unwrap().unwrap();
        assert_eq!(found.id, first.id);
    }

    #[test]
    fn test_pending_match_unique_per_record() {
        let conn = Connection::open_in_memory().unwrap();
        setup_database(&conn).unwrap();

        let m1 = ReconciliationMatch {
            id: "m1".to_string(),
            bank_record_id: "bank-1".to_string(),
            company_record_id: "co-1".to_string(),
            match_score: 0.9,
            status: MatchStatus::Pending,
            anomaly_reason: None,
            created_at: Utc::now(),
            decided_at: None,
        };
        assert!(insert_match(&conn, &m1).unwrap());

        // Second pending match on the same bank record is refused
        let m2 = ReconciliationMatch {
            id: "m2".to_string(),
            company_record_id: "co-2".to_string(),
            ..m1.clone()
        };
        assert!(!insert_match(&conn, &m2).unwrap());

        // After the first is rejected, the record can be matched again
        assert_eq!(decide_match(&conn, "m1", MatchStatus::Rejected).unwrap(), 1);
        let m3 = ReconciliationMatch {
            id: "m3".to_string(),
            company_record_id: "co-2".to_string(),
            ..m1.clone()
        };
        assert!(insert_match(&conn, &m3).unwrap());
    }

    #[test]
    fn test_decide_match_serializes() {
        let conn = Connection::open_in_memory().unwrap();
        setup_database(&conn).unwrap();

        let m = ReconciliationMatch {
            id: "m1".to_string(),
            bank_record_id: "bank-1".to_string(),
            company_record_id: "co-1".to_string(),
            match_score: 0.8,
            status: MatchStatus::Pending,
            anomaly_reason: None,
            created_at: Utc::now(),
            decided_at: None,
        };
        insert_match(&conn, &m).unwrap();

        assert_eq!(decide_match(&conn, "m1", MatchStatus::Confirmed).unwrap(), 1);
        // Second decision finds no pending row to update
        assert_eq!(decide_match(&conn, "m1", MatchStatus::Rejected).unwrap(), 0);

        let stored = get_match(&conn, "m1").unwrap().unwrap();
        assert_eq!(stored.status, MatchStatus::Confirmed);
        assert!(stored.decided_at.is_some());
    }

    #[test]
    fn test_unmatched_excludes_pending_and_confirmed() {
        let conn = Connection::open_in_memory().unwrap();
        setup_database(&conn).unwrap();

        let a = create_test_record("b1", SourceKind::Bank, "2025-01-05", "A", -10.0);
        let b = create_test_record("b1", SourceKind::Bank, "2025-01-06", "B", -20.0);
        let c = create_test_record("b1", SourceKind::Bank, "2025-01-07", "C", -30.0);
        for r in [&a, &b, &c] {
            insert_record(&conn, r).unwrap();
        }

        let pending = ReconciliationMatch {
            id: "m1".to_string(),
            bank_record_id: a.id.clone(),
            company_record_id: "co-1".to_string(),
            match_score: 0.9,
            status: MatchStatus::Pending,
            anomaly_reason: None,
            created_at: Utc::now(),
            decided_at: None,
        };
        insert_match(&conn, &pending).unwrap();

        let rejected = ReconciliationMatch {
            id: "m2".to_string(),
            bank_record_id: b.id.clone(),
            company_record_id: "co-2".to_string(),
            status: MatchStatus::Rejected,
            ..pending.clone()
        };
        insert_match(&conn, &rejected).unwrap();

        let unmatched = get_unmatched_records(&conn, SourceKind::Bank, None).unwrap();
        let ids: Vec<&str> = unmatched.iter().map(|r| r.id.as_str()).collect();

        assert!(!ids.contains(&a.id.as_str())); // pending blocks
        assert!(ids.contains(&b.id.as_str())); // rejected does not
        assert!(ids.contains(&c.id.as_str()));
    }

    #[test]
    fn test_delete_batches_older_than() {
        let mut conn = Connection::open_in_memory().unwrap();
        setup_database(&conn).unwrap();

        let mut old = UploadBatch::new("old.csv", "fp-old", SourceKind::Bank, BatchStatus::Processed);
        old.uploaded_at = Utc::now() - chrono::Duration::days(100);
        insert_batch(&conn, &old).unwrap();
        let record = create_test_record(&old.id, SourceKind::Bank, "2024-01-01", "OLD", -5.0);
        insert_record(&conn, &record).unwrap();

        let fresh = UploadBatch::new("new.csv", "fp-new", SourceKind::Bank, BatchStatus::Processed);
        insert_batch(&conn, &fresh).unwrap();

        let cutoff = Utc::now() - chrono::Duration::days(30);
        assert_eq!(count_batches_older_than(&conn, cutoff).unwrap(), 1);

        let (batches, records) = delete_batches_older_than(&mut conn, cutoff).unwrap();
        assert_eq!(batches, 1);
        assert_eq!(records, 1);
        assert_eq!(count_batches_older_than(&conn, cutoff).unwrap(), 0);
        // The fresh batch survives
        assert_eq!(list_batches(&conn).unwrap().len(), 1);
    }
}
