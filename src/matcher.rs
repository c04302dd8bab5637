// Reconciliation Matcher
// Proposes candidate pairings between bank transactions and company ledger
// entries. The scoring model is a collaborator behind the MatchScorer trait;
// the engine only guarantees determinism, one-candidate-per-record, and a
// bounded running time.

use crate::config::MatcherConfig;
use crate::db::LedgerRecord;
use crate::error::{CoreError, CoreResult};
use serde::Serialize;
use std::collections::HashSet;
use std::time::{Duration, Instant};

// ============================================================================
// SCORER SEAM
// ============================================================================

/// Confidence model for "these two records are the same real-world payment".
/// Implementations are black boxes; the engine only reads the score.
pub trait MatchScorer: Send + Sync {
    /// Score in [0,1]. Zero means "not a plausible pair".
    fn score(&self, bank: &LedgerRecord, company: &LedgerRecord) -> f64;
}

// ============================================================================
// DEFAULT SCORER
// ============================================================================

/// Heuristic scorer: weighted agreement of amount, date and description.
pub struct HeuristicScorer {
    /// Amount difference tolerance (default: $0.50)
    pub amount_tolerance: f64,

    /// Date difference tolerance in days (default: 3 - settlement lag)
    pub date_tolerance_days: i64,
}

impl HeuristicScorer {
    pub fn new() -> Self {
        HeuristicScorer {
            amount_tolerance: 0.50,
            date_tolerance_days: 3,
        }
    }

    fn description_score(a: &str, b: &str) -> f64 {
        let a_lower = a.to_lowercase();
        let b_lower = b.to_lowercase();

        if a_lower == b_lower {
            return 1.0;
        }

        // One side contains the other
        if a_lower.contains(&b_lower) || b_lower.contains(&a_lower) {
            return 0.85;
        }

        // Share a meaningful word (>= 4 chars, not purely numeric)
        let words = |s: &str| -> Vec<String> {
            s.split(|c: char| !c.is_alphanumeric())
                .filter(|w| w.len() >= 4 && !w.chars().all(|c| c.is_numeric()))
                .map(|w| w.to_lowercase())
                .collect()
        };
        let a_words = words(&a_lower);
        let b_words = words(&b_lower);
        if a_words.iter().any(|w| b_words.contains(w)) {
            return 0.85;
        }

        // Bank and ledger descriptions legitimately differ; weak but nonzero
        0.55
    }
}

impl MatchScorer for HeuristicScorer {
    fn score(&self, bank: &LedgerRecord, company: &LedgerRecord) -> f64 {
        let amount_diff = (bank.amount - company.amount).abs();
        if amount_diff > self.amount_tolerance {
            return 0.0;
        }

        let date_diff = (bank.date - company.date).num_days().abs();
        if date_diff > self.date_tolerance_days {
            return 0.0;
        }

        let amount_score = 1.0 - (amount_diff / (self.amount_tolerance + 0.01));
        let date_score = 1.0 - (date_diff as f64 / (self.date_tolerance_days as f64 + 1.0));
        let description_score = Self::description_score(&bank.description, &company.description);

        // Weighted average: amount 40%, date 30%, description 30%
        (amount_score * 0.4 + date_score * 0.3 + description_score * 0.3).clamp(0.0, 1.0)
    }
}

impl Default for HeuristicScorer {
    fn default() -> Self {
        Self::new()
    }
}

// ============================================================================
// MATCH ENGINE
// ============================================================================

/// A proposed pairing, not yet persisted.
#[derive(Debug, Clone, Serialize)]
pub struct MatchCandidate {
    pub bank_record_id: String,
    pub company_record_id: String,
    pub score: f64,
}

pub struct MatchEngine {
    scorer: Box<dyn MatchScorer>,
    config: MatcherConfig,
}

impl MatchEngine {
    pub fn new(config: MatcherConfig) -> Self {
        MatchEngine {
            scorer: Box::new(HeuristicScorer::new()),
            config,
        }
    }

    pub fn with_scorer(config: MatcherConfig, scorer: Box<dyn MatchScorer>) -> Self {
        MatchEngine { scorer, config }
    }

    /// Propose at most one candidate per bank transaction.
    ///
    /// Selection is deterministic over unchanged input: highest score wins,
    /// ties break on smallest absolute date difference, then on the
    /// lexicographically smallest company entry id. Each company entry is
    /// consumed by at most one candidate per run. Input slices are expected
    /// in id order (the storage queries guarantee it).
    ///
    /// The pass is bounded by the configured wall-clock budget; exceeding it
    /// aborts with a transient timeout instead of hanging the caller.
    pub fn propose(
        &self,
        bank: &[LedgerRecord],
        company: &[LedgerRecord],
    ) -> CoreResult<Vec<MatchCandidate>> {
        const SCORE_EPSILON: f64 = 1e-9;

        let started = Instant::now();
        let budget = Duration::from_millis(self.config.timeout_ms);

        let mut consumed: HashSet<&str> = HashSet::new();
        let mut candidates = Vec::new();

        for bank_record in bank {
            if started.elapsed() > budget {
                return Err(CoreError::Timeout {
                    elapsed_ms: started.elapsed().as_millis(),
                    budget_ms: budget.as_millis(),
                });
            }

            let mut best: Option<(f64, i64, &LedgerRecord)> = None;

            for company_record in company {
                if consumed.contains(company_record.id.as_str()) {
                    continue;
                }

                let score = self.scorer.score(bank_record, company_record);
                if score < self.config.min_score {
                    continue;
                }

                let date_diff = (bank_record.date - company_record.date).num_days().abs();
                let better = match &best {
                    None => true,
                    Some((best_score, best_diff, best_record)) => {
                        if score > *best_score + SCORE_EPSILON {
                            true
                        } else if (score - *best_score).abs() <= SCORE_EPSILON {
                            date_diff < *best_diff
                                || (date_diff == *best_diff
                                    && company_record.id < best_record.id)
                        } else {
                            false
                        }
                    }
                };
                if better {
                    best = Some((score, date_diff, company_record));
                }
            }

            if let Some((score, _, company_record)) = best {
                consumed.insert(company_record.id.as_str());
                candidates.push(MatchCandidate {
                    bank_record_id: bank_record.id.clone(),
                    company_record_id: company_record.id.clone(),
                    score,
                });
            }
        }

        Ok(candidates)
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{RecordKind, SourceKind};
    use chrono::NaiveDate;

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

    fn engine() -> MatchEngine {
        MatchEngine::new(MatcherConfig::default())
    }

    #[test]
    fn test_identical_records_score_high() {
        let bank = create_test_record("t1", SourceKind::Bank, "2025-01-05", "ACME INVOICE 42", -150.0);
        let company = create_test_record("e1", SourceKind::Company, "2025-01-05", "ACME INVOICE 42", -150.0);

        let score = HeuristicScorer::new().score(&bank, &company);
        assert!(score > 0.95, "score was {}", score);
    }

    #[test]
    fn test_amount_beyond_tolerance_scores_zero() {
        let bank = create_test_record("t1", SourceKind::Bank, "2025-01-05", "ACME", -150.0);
        let company = create_test_record("e1", SourceKind::Company, "2025-01-05", "ACME", -160.0);

        assert_eq!(HeuristicScorer::new().score(&bank, &company), 0.0);
    }

    #[test]
    fn test_one_candidate_per_bank_record() {
        let bank = vec![
            create_test_record("t1", SourceKind::Bank, "2025-01-05", "ACME", -150.0),
        ];
        let company = vec![
            create_test_record("e1", SourceKind::Company, "2025-01-05", "ACME", -150.0),
            create_test_record("e2", SourceKind::Company, "2025-01-06", "ACME", -150.0),
        ];

        let candidates = engine().propose(&bank, &company).unwrap();
        assert_eq!(candidates.len(), 1);
        // Closest date wins the tie on description/amount
        assert_eq!(candidates[0].company_record_id, "e1");
    }

    #[test]
    fn test_tie_breaks_on_lexicographic_id() {
        let bank = vec![
            create_test_record("t1", SourceKind::Bank, "2025-01-05", "ACME", -150.0),
        ];
        // Same score, same date distance: only the id differs
        let company = vec![
            create_test_record("e2", SourceKind::Company, "2025-01-05", "ACME", -150.0),
            create_test_record("e1", SourceKind::Company, "2025-01-05", "ACME", -150.0),
        ];

        let candidates = engine().propose(&bank, &company).unwrap();
        assert_eq!(candidates[0].company_record_id, "e1");
    }

    #[test]
    fn test_company_entry_consumed_once() {
        let bank = vec![
            create_test_record("t1", SourceKind::Bank, "2025-01-05", "ACME", -150.0),
            create_test_record("t2", SourceKind::Bank, "2025-01-05", "ACME", -150.0),
        ];
        let company = vec![
            create_test_record("e1", SourceKind::Company, "2025-01-05", "ACME", -150.0),
        ];

        let candidates = engine().propose(&bank, &company).unwrap();
        assert_eq!(candidates.len(), 1);
        assert_eq!(candidates[0].bank_record_id, "t1");
    }

    #[test]
    fn test_repeated_runs_are_identical() {
        let bank: Vec<_> = (0..20)
            .map(|i| {
                create_test_record(
                    &format!("t{:02}", i),
                    SourceKind::Bank,
                    "2025-01-05",
                    "VENDOR PAYMENT",
                    -(i as f64) - 10.0,
                )
            })
            .collect();
        let company: Vec<_> = (0..20)
            .map(|i| {
                create_test_record(
                    &format!("e{:02}", i),
                    SourceKind::Company,
                    "2025-01-06",
                    "VENDOR PAYMENT",
                    -(i as f64) - 10.0,
                )
            })
            .collect();

        let eng = engine();
        let first = eng.propose(&bank, &company).unwrap();
        let second = eng.propose(&bank, &company).unwrap();

        let pairs = |cs: &[MatchCandidate]| -> Vec<(String, String)> {
            cs.iter()
                .map(|c| (c.bank_record_id.clone(), c.company_record_id.clone()))
                .collect()
        };
        assert_eq!(pairs(&first), pairs(&second));
        assert_eq!(first.len(), 20);
    }

    #[test]
    fn test_weak_candidates_are_dropped() {
        let bank = vec![
            create_test_record("t1", SourceKind::Bank, "2025-01-05", "WIRE TRANSFER", -150.0),
        ];
        // Amount matches but three days away with an unrelated description
        let company = vec![
            create_test_record("e1", SourceKind::Company, "2025-01-08", "OFFICE RENT", -150.0),
        ];

        let engine = MatchEngine::new(MatcherConfig {
            min_score: 0.85,
            ..MatcherConfig::default()
        });
        let candidates = engine.propose(&bank, &company).unwrap();
        assert!(candidates.is_empty());
    }

    #[test]
    fn test_exhausted_budget_reports_timeout() {
        let bank = vec![
            create_test_record("t1", SourceKind::Bank, "2025-01-05", "ACME", -150.0),
        ];
        let company = vec![
            create_test_record("e1", SourceKind::Company, "2025-01-05", "ACME", -150.0),
        ];

        let engine = MatchEngine::new(MatcherConfig {
            timeout_ms: 0,
            ..MatcherConfig::default()
        });
        let err = engine.propose(&bank, &company).unwrap_err();
        assert_eq!(err.code(), "CONNECTION_ERROR");
        assert!(err.is_transient());
    }
}
