// Reconciliation Workflow
// Turns matcher output into pending records and advances them through the
// operator's confirm/reject decisions. Pending is the only live state;
// confirmed and rejected are terminal and never reopen - new evidence means
// a new match, not a resurrected one.

use crate::anomaly::{AmountSpikeDetector, AnomalyDetector};
use crate::config::MatcherConfig;
use crate::db::{self, LedgerRecord, MatchStatus, ReconciliationMatch, SourceKind};
use crate::error::{CoreError, CoreResult};
use crate::matcher::MatchEngine;
use chrono::{NaiveDate, Utc};
use rusqlite::Connection;
use serde::Serialize;
use std::collections::HashMap;

// ============================================================================
// REPORTS
// ============================================================================

/// Result of one matching run.
#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    /// Pending matches created by this run
    pub created: usize,
    /// Of those, how many carry an anomaly annotation
    pub flagged: usize,
    /// Candidates skipped because a concurrent run already holds a pending
    /// match on one of the records
    pub already_pending: usize,
}

/// A pending match joined with both underlying records for display.
#[derive(Debug, Clone, Serialize)]
pub struct PendingMatch {
    pub id: String,
    pub match_score: f64,
    pub anomaly_reason: Option<String>,
    pub bank_transaction: LedgerRecord,
    pub company_entry: LedgerRecord,
}

/// Derived aggregate over all matches. Recomputed on demand; a view, not a
/// source of truth.
#[derive(Debug, Clone, Serialize)]
pub struct ReconciliationReport {
    pub total_records: i64,
    pub confirmed: i64,
    pub pending: i64,
    pub rejected: i64,
    /// confirmed / total, 0 when there are no matches
    pub reconciliation_rate: f64,
    /// Sum of matched bank amounts over confirmed matches
    pub total_reconciled_value: f64,
}

// ============================================================================
// RECONCILIATION SERVICE
// ============================================================================

/// Owns the matcher and anomaly collaborators. All state lives in storage;
/// the service itself can be rebuilt per request.
pub struct ReconciliationService {
    engine: MatchEngine,
    detector: Box<dyn AnomalyDetector>,
}

impl ReconciliationService {
    pub fn new(config: MatcherConfig) -> Self {
        ReconciliationService {
            engine: MatchEngine::new(config),
            detector: Box::new(AmountSpikeDetector::new()),
        }
    }

    pub fn with_collaborators(engine: MatchEngine, detector: Box<dyn AnomalyDetector>) -> Self {
        ReconciliationService { engine, detector }
    }

    /// All pending matches, oldest first, with both records attached.
    pub fn list_pending(&self, conn: &Connection) -> CoreResult<Vec<PendingMatch>> {
        let mut out = Vec::new();
        for m in db::get_pending_matches(conn)? {
            let bank = db::get_record(conn, &m.bank_record_id)?;
            let company = db::get_record(conn, &m.company_record_id)?;
            // A match without its records would mean a purge raced us;
            // skip rather than invent placeholders.
            if let (Some(bank_transaction), Some(company_entry)) = (bank, company) {
                out.push(PendingMatch {
                    id: m.id,
                    match_score: m.match_score,
                    anomaly_reason: m.anomaly_reason,
                    bank_transaction,
                    company_entry,
                });
            }
        }
        Ok(out)
    }

    /// Run the matcher over records that carry no pending or confirmed
    /// match. Re-running over unchanged data creates nothing new.
    pub fn start(&self, conn: &mut Connection) -> CoreResult<RunReport> {
        self.run(conn, None, false)
    }

    /// Same as `start`, but the anomaly detector first sweeps the candidate
    /// window and its flags annotate the created matches. Flagged matches
    /// follow the identical pending -> confirmed/rejected lifecycle.
    pub fn start_anomaly_aware(
        &self,
        conn: &mut Connection,
        date_range: (NaiveDate, NaiveDate),
    ) -> CoreResult<RunReport> {
        self.run(conn, Some(date_range), true)
    }

    fn run(
        &self,
        conn: &mut Connection,
        date_range: Option<(NaiveDate, NaiveDate)>,
        with_anomalies: bool,
    ) -> CoreResult<RunReport> {
        let bank = db::get_unmatched_records(conn, SourceKind::Bank, date_range)?;
        let company = db::get_unmatched_records(conn, SourceKind::Company, date_range)?;

        let candidates = self.engine.propose(&bank, &company)?;

        let anomaly_reasons: HashMap<String, String> = if with_anomalies {
            self.detector
                .flag(&bank)?
                .into_iter()
                .map(|f| (f.record_id, f.reason))
                .collect()
        } else {
            HashMap::new()
        };

        let tx = conn.transaction().map_err(CoreError::Storage)?;
        let mut created = 0usize;
        let mut flagged = 0usize;
        let mut already_pending = 0usize;

        for candidate in candidates {
            let anomaly_reason = anomaly_reasons.get(&candidate.bank_record_id).cloned();
            let m = ReconciliationMatch {
                id: uuid::Uuid::new_v4().to_string(),
                bank_record_id: candidate.bank_record_id,
                company_record_id: candidate.company_record_id,
                match_score: candidate.score,
                status: MatchStatus::Pending,
                anomaly_reason: anomaly_reason.clone(),
                created_at: Utc::now(),
                decided_at: None,
            };

            // The partial unique index is the final arbiter under
            // concurrency; losing the race is not an error.
            if db::insert_match(&tx, &m)? {
                created += 1;
                if anomaly_reason.is_some() {
                    flagged += 1;
                }
            } else {
                already_pending += 1;
            }
        }

        tx.commit().map_err(CoreError::Storage)?;

        Ok(RunReport {
            created,
            flagged,
            already_pending,
        })
    }

    /// pending -> confirmed. Fails with a conflict if the match was already
    /// decided, whoever decided it.
    pub fn confirm(&self, conn: &Connection, match_id: &str) -> CoreResult<ReconciliationMatch> {
        self.decide(conn, match_id, MatchStatus::Confirmed)
    }

    /// pending -> rejected. Same guard as `confirm`.
    pub fn reject(&self, conn: &Connection, match_id: &str) -> CoreResult<ReconciliationMatch> {
        self.decide(conn, match_id, MatchStatus::Rejected)
    }

    fn decide(
        &self,
        conn: &Connection,
        match_id: &str,
        status: MatchStatus,
    ) -> CoreResult<ReconciliationMatch> {
        let existing = db::get_match(conn, match_id)?
            .ok_or_else(|| CoreError::NotFound(format!("match {}", match_id)))?;

        if existing.status.is_terminal() {
            return Err(CoreError::AlreadyDecided {
                match_id: match_id.to_string(),
                status: existing.status.as_str().to_string(),
            });
        }

        let updated = db::decide_match(conn, match_id, status)?;
        if updated == 0 {
            // Lost the race: someone decided it between our read and write.
            let current = db::get_match(conn, match_id)?
                .ok_or_else(|| CoreError::NotFound(format!("match {}", match_id)))?;
            return Err(CoreError::AlreadyDecided {
                match_id: match_id.to_string(),
                status: current.status.as_str().to_string(),
            });
        }

        db::get_match(conn, match_id)?.ok_or_else(|| CoreError::NotFound(format!("match {}", match_id)))
    }

    /// Aggregate view across all matches.
    pub fn report(&self, conn: &Connection) -> CoreResult<ReconciliationReport> {
        let (total, confirmed, pending, rejected) = db::match_status_counts(conn)?;
        let total_reconciled_value = db::total_reconciled_value(conn)?;

        let reconciliation_rate = if total > 0 {
            confirmed as f64 / total as f64
        } else {
            0.0
        };

        Ok(ReconciliationReport {
            total_records: total,
            confirmed,
            pending,
            rejected,
            reconciliation_rate,
            total_reconciled_value,
        })
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{insert_record, setup_database, RecordKind};

    fn create_test_record(id: &str, side: SourceKind, date: &str, description: &str, amount: f64) -> LedgerRecord {
        LedgerRecord {
            id: id.to_string(),
            batch_id: "b1".to_string(),
            side,
            date: NaiveDate::parse_from_str(date, "%Y-%m-%d").unwrap(),
            description: description.to_string(),
            amount,
            category: "Test".to_string(),
            kind: if amount >= 0.0 { RecordKind::Credit } else { RecordKind::Debit },
        }
    }

    fn seed_pairs(conn: &Connection, n: usize) {
        for i in 0..n {
            let date = format!("2025-01-{:02}", (i % 27) + 1);
            let bank = create_test_record(
                &format!("t{:02}", i),
                SourceKind::Bank,
                &date,
                &format!("VENDOR {} PAYMENT", i),
                -100.0 - i as f64,
            );
            let company = create_test_record(
                &format!("e{:02}", i),
                SourceKind::Company,
                &date,
                &format!("VENDOR {} PAYMENT", i),
                -100.0 - i as f64,
            );
            insert_record(conn, &bank).unwrap();
            insert_record(conn, &company).unwrap();
        }
    }

    fn test_conn() -> Connection {
        let conn = Connection::open_in_memory().unwrap();
        setup_database(&conn).unwrap();
        conn
    }

    fn service() -> ReconciliationService {
        ReconciliationService::new(MatcherConfig::default())
    }

    #[test]
    fn test_start_creates_pending_matches() {
        let mut conn = test_conn();
        seed_pairs(&conn, 5);

        let report = service().start(&mut conn).unwrap();
        assert_eq!(report.created, 5);
        assert_eq!(report.already_pending, 0);

        let pending = service().list_pending(&conn).unwrap();
        assert_eq!(pending.len(), 5);
        assert!(pending.iter().all(|p| p.match_score >= 0.7));
    }

    #[test]
    fn test_second_run_over_unchanged_data_creates_nothing() {
        let mut conn = test_conn();
        seed_pairs(&conn, 5);
        let svc = service();

        svc.start(&mut conn).unwrap();
        let second = svc.start(&mut conn).unwrap();

        assert_eq!(second.created, 0);
        assert_eq!(svc.list_pending(&conn).unwrap().len(), 5);
    }

    #[test]
    fn test_confirm_then_reject_conflicts() {
        let mut conn = test_conn();
        seed_pairs(&conn, 1);
        let svc = service();
        svc.start(&mut conn).unwrap();

        let match_id = svc.list_pending(&conn).unwrap()[0].id.clone();

        let confirmed = svc.confirm(&conn, &match_id).unwrap();
        assert_eq!(confirmed.status, MatchStatus::Confirmed);
        assert!(confirmed.decided_at.is_some());

        let err = svc.reject(&conn, &match_id).unwrap_err();
        match err {
            CoreError::AlreadyDecided { status, .. } => assert_eq!(status, "confirmed"),
            other => panic!("expected AlreadyDecided, got {:?}", other),
        }

        // Status is untouched by the failed transition
        let stored = db::get_match(&conn, &match_id).unwrap().unwrap();
        assert_eq!(stored.status, MatchStatus::Confirmed);
    }

    #[test]
    fn test_repeated_confirm_also_conflicts() {
        let mut conn = test_conn();
        seed_pairs(&conn, 1);
        let svc = service();
        svc.start(&mut conn).unwrap();
        let match_id = svc.list_pending(&conn).unwrap()[0].id.clone();

        svc.confirm(&conn, &match_id).unwrap();
        let err = svc.confirm(&conn, &match_id).unwrap_err();
        assert_eq!(err.code(), "CONFLICT");
    }

    #[test]
    fn test_unknown_match_is_not_found() {
        let conn = test_conn();
        let err = service().confirm(&conn, "no-such-id").unwrap_err();
        assert!(matches!(err, CoreError::NotFound(_)));
    }

    #[test]
    fn test_rejected_records_can_be_rematched() {
        let mut conn = test_conn();
        seed_pairs(&conn, 1);
        let svc = service();

        svc.start(&mut conn).unwrap();
        let match_id = svc.list_pending(&conn).unwrap()[0].id.clone();
        svc.reject(&conn, &match_id).unwrap();

        // The records are free again; a new match is appended
        let rerun = svc.start(&mut conn).unwrap();
        assert_eq!(rerun.created, 1);

        let report = svc.report(&conn).unwrap();
        assert_eq!(report.rejected, 1);
        assert_eq!(report.pending, 1);
        assert_eq!(report.total_records, 2);
    }

    #[test]
    fn test_anomaly_flags_annotate_but_do_not_gate() {
        let mut conn = test_conn();
        seed_pairs(&conn, 8);

        // One outlier pair inside the window
        let spike_bank = create_test_record(
            "t-spike", SourceKind::Bank, "2025-01-15", "UNUSUAL WIRE", -90_000.0,
        );
        let spike_company = create_test_record(
            "e-spike", SourceKind::Company, "2025-01-15", "UNUSUAL WIRE", -90_000.0,
        );
        insert_record(&conn, &spike_bank).unwrap();
        insert_record(&conn, &spike_company).unwrap();

        let svc = service();
        let range = (
            NaiveDate::from_ymd_opt(2025, 1, 1).unwrap(),
            NaiveDate::from_ymd_opt(2025, 1, 31).unwrap(),
        );
        let report = svc.start_anomaly_aware(&mut conn, range).unwrap();

        assert_eq!(report.created, 9);
        assert_eq!(report.flagged, 1);

        let pending = svc.list_pending(&conn).unwrap();
        let flagged: Vec<_> = pending.iter().filter(|p| p.anomaly_reason.is_some()).collect();
        assert_eq!(flagged.len(), 1);
        assert_eq!(flagged[0].bank_transaction.id, "t-spike");

        // The flagged match still goes through the ordinary gate
        let confirmed = svc.confirm(&conn, &flagged[0].id).unwrap();
        assert_eq!(confirmed.status, MatchStatus::Confirmed);
    }

    #[test]
    fn test_date_range_limits_the_candidate_window() {
        let mut conn = test_conn();
        seed_pairs(&conn, 5); // dates 2025-01-01 .. 2025-01-05

        let svc = service();
        let range = (
            NaiveDate::from_ymd_opt(2025, 1, 1).unwrap(),
            NaiveDate::from_ymd_opt(2025, 1, 2).unwrap(),
        );
        let report = svc.start_anomaly_aware(&mut conn, range).unwrap();
        assert_eq!(report.created, 2);
    }

    #[test]
    fn test_report_totals_and_value() {
        let mut conn = test_conn();
        seed_pairs(&conn, 3); // amounts -100, -101, -102
        let svc = service();
        svc.start(&mut conn).unwrap();

        let pending = svc.list_pending(&conn).unwrap();
        svc.confirm(&conn, &pending[0].id).unwrap();
        svc.reject(&conn, &pending[1].id).unwrap();

        let report = svc.report(&conn).unwrap();
        assert_eq!(report.total_records, 3);
        assert_eq!(report.confirmed, 1);
        assert_eq!(report.pending, 1);
        assert_eq!(report.rejected, 1);
        assert!((report.reconciliation_rate - 1.0 / 3.0).abs() < 1e-9);
        assert_eq!(
            report.total_reconciled_value,
            pending[0].bank_transaction.amount.abs()
        );
    }

    #[test]
    fn test_empty_database_report() {
        let conn = test_conn();
        let report = service().report(&conn).unwrap();
        assert_eq!(report.total_records, 0);
        assert_eq!(report.reconciliation_rate, 0.0);
        assert_eq!(report.total_reconciled_value, 0.0);
    }
}
