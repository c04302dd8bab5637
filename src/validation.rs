// Row Validation
// Field-level checks applied to every parsed row. A failing row never
// aborts its batch - it becomes an IncompleteEntry held for correction.

use crate::db::{LedgerRecord, RecordKind, SourceKind};
use crate::parser::RawRow;
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

// ============================================================================
// VALIDATED ROW
// ============================================================================

/// A row that passed validation, ready to persist.
#[derive(Debug, Clone, PartialEq)]
pub struct ValidRow {
    pub date: NaiveDate,
    pub description: String,
    pub amount: f64,
    pub category: String,
    pub kind: RecordKind,
}

impl ValidRow {
    pub fn into_record(self, batch_id: &str, side: SourceKind) -> LedgerRecord {
        LedgerRecord {
            id: uuid::Uuid::new_v4().to_string(),
            batch_id: batch_id.to_string(),
            side,
            date: self.date,
            description: self.description,
            amount: self.amount,
            category: self.category,
            kind: self.kind,
        }
    }
}

// ============================================================================
// INCOMPLETE ENTRY
// ============================================================================

/// A row that failed validation, held for operator correction.
///
/// `fields` is what the operator edits; `original` is the untouched parse
/// result so a reset can restore it. The entry only joins a resubmission
/// once `corrected` is set by an edit.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IncompleteEntry {
    pub row_number: usize,
    /// Human-readable reason, naming every failing field
    pub error: String,
    pub fields: RawRow,
    pub corrected: bool,
    original: RawRow,
}

impl IncompleteEntry {
    pub fn new(row: &RawRow, error: String) -> Self {
        IncompleteEntry {
            row_number: row.row_number,
            error,
            fields: row.clone(),
            corrected: false,
            original: row.clone(),
        }
    }

    /// Apply one operator edit. Unknown field names are reported back so a
    /// typo in the client never silently drops an edit.
    pub fn set_field(&mut self, field: &str, value: Option<String>) -> Result<(), String> {
        match field {
            "date" => self.fields.date = value,
            "description" => self.fields.description = value,
            "amount" => self.fields.amount = value,
            "category" => self.fields.category = value,
            "kind" | "type" => self.fields.kind = value,
            other => return Err(format!("unknown field '{}'", other)),
        }
        self.corrected = true;
        Ok(())
    }

    /// Restore the original (still-invalid) values and clear the flag.
    pub fn reset(&mut self) {
        self.fields = self.original.clone();
        self.corrected = false;
    }
}

// ============================================================================
// ROW VALIDATOR
// ============================================================================

/// Validates raw rows against the record schema.
/// The same validator runs on first ingestion and on every resubmission.
pub struct RowValidator {
    /// Upper bound on description length
    pub max_description_len: usize,
}

impl RowValidator {
    pub fn new() -> Self {
        RowValidator {
            max_description_len: 500,
        }
    }

    /// Validate one row. On failure the error message names each bad field
    /// so the operator knows exactly what to fix.
    pub fn validate(&self, row: &RawRow) -> Result<ValidRow, IncompleteEntry> {
        let mut problems = Vec::new();

        let date = match &row.date {
            None => {
                problems.push("date: required field is missing".to_string());
                None
            }
            Some(raw) => match parse_date(raw) {
                Some(d) => Some(d),
                None => {
                    problems.push(format!(
                        "date: '{}' is not a recognized date (expected YYYY-MM-DD or MM/DD/YYYY)",
                        raw
                    ));
                    None
                }
            },
        };

        let description = match &row.description {
            None => {
                problems.push("description: required field is missing".to_string());
                None
            }
            Some(text) if text.len() > self.max_description_len => {
                problems.push(format!(
                    "description: exceeds {} characters",
                    self.max_description_len
                ));
                None
            }
            Some(text) => Some(text.clone()),
        };

        let amount = match &row.amount {
            None => {
                problems.push("amount: required field is missing".to_string());
                None
            }
            Some(raw) => match parse_amount(raw) {
                Some(a) => Some(a),
                None => {
                    problems.push(format!("amount: '{}' is not a number", raw));
                    None
                }
            },
        };

        if !problems.is_empty() {
            return Err(IncompleteEntry::new(row, problems.join("; ")));
        }

        // Required fields are all present past this point
        let amount = amount.unwrap_or_default();
        let kind = match row.kind.as_deref() {
            Some(k) if k.eq_ignore_ascii_case("credit") => RecordKind::Credit,
            Some(k) if k.eq_ignore_ascii_case("debit") => RecordKind::Debit,
            // Absent or unrecognized: the sign decides
            _ => {
                if amount >= 0.0 {
                    RecordKind::Credit
                } else {
                    RecordKind::Debit
                }
            }
        };

        Ok(ValidRow {
            date: date.unwrap_or_default(),
            description: description.unwrap_or_default(),
            amount,
            category: row
                .category
                .clone()
                .unwrap_or_else(|| "Uncategorized".to_string()),
            kind,
        })
    }
}

impl Default for RowValidator {
    fn default() -> Self {
        Self::new()
    }
}

/// Parse a date from the two formats statements actually use.
fn parse_date(raw: &str) -> Option<NaiveDate> {
    if let Ok(date) = NaiveDate::parse_from_str(raw, "%Y-%m-%d") {
        return Some(date);
    }
    if let Ok(date) = NaiveDate::parse_from_str(raw, "%m/%d/%Y") {
        return Some(date);
    }
    None
}

/// Parse an amount, tolerating currency symbols and thousands separators.
fn parse_amount(raw: &str) -> Option<f64> {
    let cleaned: String = raw
        .chars()
        .filter(|c| !matches!(c, '$' | ',' | ' '))
        .collect();
    let value: f64 = cleaned.parse().ok()?;
    if value.is_finite() {
        Some(value)
    } else {
        None
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn create_test_row(date: Option<&str>, description: Option<&str>, amount: Option<&str>) -> RawRow {
        RawRow {
            row_number: 5,
            date: date.map(String::from),
            description: description.map(String::from),
            amount: amount.map(String::from),
            category: None,
            kind: None,
        }
    }

    #[test]
    fn test_valid_row() {
        let validator = RowValidator::new();
        let row = create_test_row(Some("2025-01-05"), Some("STARBUCKS"), Some("-4.99"));

        let valid = validator.validate(&row).unwrap();
        assert_eq!(valid.date, NaiveDate::from_ymd_opt(2025, 1, 5).unwrap());
        assert_eq!(valid.amount, -4.99);
        assert_eq!(valid.kind, RecordKind::Debit);
        assert_eq!(valid.category, "Uncategorized");
    }

    #[test]
    fn test_us_date_format_accepted() {
        let validator = RowValidator::new();
        let row = create_test_row(Some("01/05/2025"), Some("coffee"), Some("4.99"));

        let valid = validator.validate(&row).unwrap();
        assert_eq!(valid.date, NaiveDate::from_ymd_opt(2025, 1, 5).unwrap());
        assert_eq!(valid.kind, RecordKind::Credit);
    }

    #[test]
    fn test_missing_description_names_the_field() {
        let validator = RowValidator::new();
        let row = create_test_row(Some("2025-01-05"), None, Some("-4.99"));

        let incomplete = validator.validate(&row).unwrap_err();
        assert_eq!(incomplete.row_number, 5);
        assert!(incomplete.error.contains("description"));
        assert!(!incomplete.corrected);
    }

    #[test]
    fn test_multiple_problems_all_reported() {
        let validator = RowValidator::new();
        let row = create_test_row(Some("not-a-date"), Some("x"), Some("abc"));

        let incomplete = validator.validate(&row).unwrap_err();
        assert!(incomplete.error.contains("date"));
        assert!(incomplete.error.contains("amount"));
    }

    #[test]
    fn test_currency_symbols_tolerated() {
        let validator = RowValidator::new();
        let row = create_test_row(Some("2025-01-05"), Some("rent"), Some("$1,250.00"));

        let valid = validator.validate(&row).unwrap();
        assert_eq!(valid.amount, 1250.0);
    }

    #[test]
    fn test_explicit_kind_wins_over_sign() {
        let validator = RowValidator::new();
        let mut row = create_test_row(Some("2025-01-05"), Some("refund"), Some("-10.00"));
        row.kind = Some("CREDIT".to_string());

        let valid = validator.validate(&row).unwrap();
        assert_eq!(valid.kind, RecordKind::Credit);
    }

    #[test]
    fn test_edit_and_reset() {
        let validator = RowValidator::new();
        let row = create_test_row(Some("2025-01-05"), None, Some("-4.99"));
        let mut incomplete = validator.validate(&row).unwrap_err();

        incomplete
            .set_field("description", Some("CORRECTED".to_string()))
            .unwrap();
        assert!(incomplete.corrected);
        assert_eq!(incomplete.fields.description.as_deref(), Some("CORRECTED"));

        incomplete.reset();
        assert!(!incomplete.corrected);
        assert_eq!(incomplete.fields.description, None);
    }

    #[test]
    fn test_unknown_field_rejected() {
        let row = create_test_row(Some("2025-01-05"), None, None);
        let mut incomplete = IncompleteEntry::new(&row, "missing".to_string());
        assert!(incomplete.set_field("merchant", Some("X".to_string())).is_err());
        assert!(!incomplete.corrected);
    }
}
