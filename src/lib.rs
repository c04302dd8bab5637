// Ledger Reconcile - Core Library
// Exposes all modules for use in the CLI, API server, and tests

pub mod anomaly;
pub mod config;
pub mod correction;
pub mod db;
pub mod duplicate;
pub mod error;
pub mod ingestion;
pub mod matcher;
pub mod parser;
pub mod purge;
pub mod reconciliation;
pub mod validation;

// Re-export commonly used types
pub use anomaly::{AmountSpikeDetector, AnomalyDetector, AnomalyFlag};
pub use config::{Config, MatcherConfig, PurgeConfig, UploadLimits};
pub use correction::{CorrectionQueue, ResubmitReport};
pub use db::{
    setup_database, BatchStatus, LedgerRecord, MatchStatus, RecordKind, ReconciliationMatch,
    SourceKind, UploadBatch,
};
pub use duplicate::{check_fingerprint, fingerprint_bytes, PriorUpload};
pub use error::{CoreError, CoreResult};
pub use ingestion::{IngestionPipeline, IngestionReport};
pub use matcher::{HeuristicScorer, MatchCandidate, MatchEngine, MatchScorer};
pub use parser::{parser_for, RawRow, StatementFormat, StatementParser};
pub use purge::{PurgeGate, PurgeMode, CONFIRMATION_TOKEN};
pub use reconciliation::{
    PendingMatch, ReconciliationReport, ReconciliationService, RunReport,
};
pub use validation::{IncompleteEntry, RowValidator, ValidRow};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
