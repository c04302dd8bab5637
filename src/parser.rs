// Statement Parser Framework
// Polymorphic parser system: one parser per file format (CSV, OFX).
// Parsers only extract raw field strings - validation happens later, so a
// bad row never aborts the file.

use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};

// ============================================================================
// CORE TYPES
// ============================================================================

/// StatementFormat - which container format a file uses
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StatementFormat {
    Csv,
    Ofx,
}

impl StatementFormat {
    /// Human-readable name for display
    pub fn name(&self) -> &'static str {
        match self {
            StatementFormat::Csv => "CSV",
            StatementFormat::Ofx => "OFX",
        }
    }

    /// Resolve a format from a lowercase file extension.
    pub fn from_extension(ext: &str) -> Option<Self> {
        match ext {
            "csv" => Some(StatementFormat::Csv),
            "ofx" => Some(StatementFormat::Ofx),
            _ => None,
        }
    }
}

/// RawRow - one parsed row before validation.
///
/// Every field is optional: the parser reports what the file said, the
/// validator decides whether that is enough. Never persisted standalone.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawRow {
    /// 1-based row number in the original file (header excluded for CSV)
    pub row_number: usize,
    pub date: Option<String>,
    pub description: Option<String>,
    pub amount: Option<String>,
    pub category: Option<String>,
    pub kind: Option<String>,
}

impl RawRow {
    pub fn empty(row_number: usize) -> Self {
        RawRow {
            row_number,
            date: None,
            description: None,
            amount: None,
            category: None,
            kind: None,
        }
    }
}

// ============================================================================
// PARSER TRAIT
// ============================================================================

/// StatementParser - core trait, one implementation per format.
///
/// Adding a format means implementing this trait; no existing parser changes.
pub trait StatementParser: Send + Sync {
    /// Parse file bytes into raw rows.
    ///
    /// Structural failure of the whole container (not valid UTF-8 where the
    /// format requires it, no parseable table at all) is an error; anything
    /// row-shaped comes back as a `RawRow`, however incomplete.
    fn parse(&self, bytes: &[u8]) -> Result<Vec<RawRow>>;

    fn format(&self) -> StatementFormat;
}

/// Get the parser for a format
pub fn parser_for(format: StatementFormat) -> Box<dyn StatementParser> {
    match format {
        StatementFormat::Csv => Box::new(CsvStatementParser),
        StatementFormat::Ofx => Box::new(OfxStatementParser),
    }
}

// ============================================================================
// CSV PARSER
// ============================================================================

/// Parses delimited statements with a header row.
///
/// Column lookup is case-insensitive and tolerant of the usual aliases
/// (Description/Memo/Name, Type/Kind). A row that is missing cells still
/// produces a RawRow - the validator reports the precise missing field.
pub struct CsvStatementParser;

impl CsvStatementParser {
    fn column_index(headers: &csv::StringRecord, names: &[&str]) -> Option<usize> {
        headers.iter().position(|h| {
            let h = h.trim().to_lowercase();
            names.iter().any(|n| h == *n)
        })
    }

    fn cell(record: &csv::StringRecord, index: Option<usize>) -> Option<String> {
        let value = record.get(index?)?.trim();
        if value.is_empty() {
            None
        } else {
            Some(value.to_string())
        }
    }
}

impl StatementParser for CsvStatementParser {
    fn parse(&self, bytes: &[u8]) -> Result<Vec<RawRow>> {
        let mut reader = csv::ReaderBuilder::new()
            .flexible(true)
            .trim(csv::Trim::All)
            .from_reader(bytes);

        let headers = reader
            .headers()
            .map_err(|e| anyhow!("unreadable CSV header: {}", e))?
            .clone();

        let date_col = Self::column_index(&headers, &["date", "transaction date"]);
        let desc_col = Self::column_index(&headers, &["description", "memo", "name"]);
        let amount_col = Self::column_index(&headers, &["amount"]);
        let category_col = Self::column_index(&headers, &["category"]);
        let kind_col = Self::column_index(&headers, &["type", "kind"]);

        let mut rows = Vec::new();
        for (i, result) in reader.records().enumerate() {
            let row_number = i + 1;
            match result {
                Ok(record) => rows.push(RawRow {
                    row_number,
                    date: Self::cell(&record, date_col),
                    description: Self::cell(&record, desc_col),
                    amount: Self::cell(&record, amount_col),
                    category: Self::cell(&record, category_col),
                    kind: Self::cell(&record, kind_col),
                }),
                // A malformed record is still one row of the file; surface it
                // as an empty RawRow so the totals stay conserved.
                Err(_) => rows.push(RawRow::empty(row_number)),
            }
        }

        Ok(rows)
    }

    fn format(&self) -> StatementFormat {
        StatementFormat::Csv
    }
}

// ============================================================================
// OFX PARSER
// ============================================================================

/// Parses OFX/SGML bank statements.
///
/// Only the transaction list is read: each <STMTTRN> block becomes one row
/// with DTPOSTED, TRNAMT, NAME/MEMO and TRNTYPE. Balance and account blocks
/// are ignored.
pub struct OfxStatementParser;

impl OfxStatementParser {
    /// Extract the value following `<TAG>` in an SGML block.
    /// OFX 1.x has no closing tags; the value runs to the next '<' or EOL.
    fn tag_value(block: &str, tag: &str) -> Option<String> {
        let open = format!("<{}>", tag);
        let start = block.find(&open)? + open.len();
        let rest = &block[start..];
        let end = rest.find(['<', '\r', '\n']).unwrap_or(rest.len());
        let value = rest[..end].trim();
        if value.is_empty() {
            None
        } else {
            Some(value.to_string())
        }
    }

    /// DTPOSTED is `YYYYMMDD` with optional time suffix; normalize to ISO.
    fn normalize_date(raw: &str) -> Option<String> {
        if raw.len() < 8 || !raw[..8].chars().all(|c| c.is_ascii_digit()) {
            return None;
        }
        Some(format!("{}-{}-{}", &raw[..4], &raw[4..6], &raw[6..8]))
    }
}

impl StatementParser for OfxStatementParser {
    fn parse(&self, bytes: &[u8]) -> Result<Vec<RawRow>> {
        let text = std::str::from_utf8(bytes).map_err(|_| anyhow!("OFX file is not valid UTF-8"))?;

        let mut rows = Vec::new();
        let mut cursor = 0usize;
        let mut row_number = 0usize;

        // OFX/SGML tags are uppercase; matching them literally keeps byte
        // offsets valid for slicing the original text.
        while let Some(open) = text[cursor..].find("<STMTTRN>") {
            let block_start = cursor + open + "<STMTTRN>".len();
            let block_end = match text[block_start..].find("</STMTTRN>") {
                Some(close) => block_start + close,
                // Unterminated final block: read to end of file
                None => text.len(),
            };

            let block = &text[block_start..block_end];
            row_number += 1;

            let name = Self::tag_value(block, "NAME");
            let memo = Self::tag_value(block, "MEMO");
            let description = match (name, memo) {
                (Some(n), Some(m)) => Some(format!("{} {}", n, m)),
                (Some(n), None) => Some(n),
                (None, Some(m)) => Some(m),
                (None, None) => None,
            };

            rows.push(RawRow {
                row_number,
                date: Self::tag_value(block, "DTPOSTED").and_then(|d| Self::normalize_date(&d)),
                description,
                amount: Self::tag_value(block, "TRNAMT"),
                category: None,
                kind: Self::tag_value(block, "TRNTYPE"),
            });

            cursor = block_end;
        }

        Ok(rows)
    }

    fn format(&self) -> StatementFormat {
        StatementFormat::Ofx
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    const CSV_SAMPLE: &str = "\
Date,Description,Amount,Category,Type
2025-01-05,STARBUCKS #4521,-4.99,Dining,debit
2025-01-06,PAYROLL ACME INC,2500.00,Income,credit
";

    #[test]
    fn test_csv_parse_basic() {
        let parser = CsvStatementParser;
        let rows = parser.parse(CSV_SAMPLE.as_bytes()).unwrap();

        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].row_number, 1);
        assert_eq!(rows[0].date.as_deref(), Some("2025-01-05"));
        assert_eq!(rows[0].description.as_deref(), Some("STARBUCKS #4521"));
        assert_eq!(rows[0].amount.as_deref(), Some("-4.99"));
        assert_eq!(rows[1].kind.as_deref(), Some("credit"));
    }

    #[test]
    fn test_csv_headers_case_insensitive() {
        let parser = CsvStatementParser;
        let rows = parser
            .parse(b"DATE,MEMO,AMOUNT\n2025-01-05,coffee,-4.99\n")
            .unwrap();

        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].description.as_deref(), Some("coffee"));
    }

    #[test]
    fn test_csv_missing_cell_becomes_none() {
        let parser = CsvStatementParser;
        let rows = parser
            .parse(b"Date,Description,Amount\n2025-01-05,,42.00\n")
            .unwrap();

        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].description, None);
        assert_eq!(rows[0].amount.as_deref(), Some("42.00"));
    }

    const OFX_SAMPLE: &str = "\
OFXHEADER:100
DATA:OFXSGML

<OFX>
<BANKMSGSRSV1>
<STMTTRNRS>
<BANKTRANLIST>
<STMTTRN>
<TRNTYPE>DEBIT
<DTPOSTED>20250105120000
<TRNAMT>-4.99
<NAME>STARBUCKS
<MEMO>CARD 4521
</STMTTRN>
<STMTTRN>
<TRNTYPE>CREDIT
<DTPOSTED>20250106
<TRNAMT>2500.00
<NAME>PAYROLL ACME INC
</STMTTRN>
</BANKTRANLIST>
</STMTTRNRS>
</BANKMSGSRSV1>
</OFX>
";

    #[test]
    fn test_ofx_parse_basic() {
        let parser = OfxStatementParser;
        let rows = parser.parse(OFX_SAMPLE.as_bytes()).unwrap();

        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].date.as_deref(), Some("2025-01-05"));
        assert_eq!(rows[0].amount.as_deref(), Some("-4.99"));
        assert_eq!(rows[0].description.as_deref(), Some("STARBUCKS CARD 4521"));
        assert_eq!(rows[0].kind.as_deref(), Some("DEBIT"));
        assert_eq!(rows[1].date.as_deref(), Some("2025-01-06"));
        assert_eq!(rows[1].row_number, 2);
    }

    #[test]
    fn test_ofx_missing_fields_are_none() {
        let parser = OfxStatementParser;
        let rows = parser
            .parse(b"<STMTTRN>\n<TRNAMT>10.00\n</STMTTRN>\n")
            .unwrap();

        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].date, None);
        assert_eq!(rows[0].description, None);
        assert_eq!(rows[0].amount.as_deref(), Some("10.00"));
    }

    #[test]
    fn test_format_from_extension() {
        assert_eq!(StatementFormat::from_extension("csv"), Some(StatementFormat::Csv));
        assert_eq!(StatementFormat::from_extension("ofx"), Some(StatementFormat::Ofx));
        assert_eq!(StatementFormat::from_extension("pdf"), None);
    }
}
