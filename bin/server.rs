// Ledger Reconcile - API Server
// JSON API over the ingestion and reconciliation core. All workflow state
// lives in the core and its storage; handlers are thin adapters.

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Json, Response},
    routing::{get, post},
    Router,
};
use chrono::NaiveDate;
use rusqlite::Connection;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tower_http::cors::CorsLayer;

use ledger_reconcile::{
    db, setup_database, Config, CoreError, CorrectionQueue, IngestionPipeline, PurgeGate,
    PurgeMode, ReconciliationService, SourceKind,
};

/// Shared application state
#[derive(Clone)]
struct AppState {
    db: Arc<Mutex<Connection>>,
    pipeline: Arc<IngestionPipeline>,
    service: Arc<ReconciliationService>,
    purge: Arc<Mutex<PurgeGate>>,
    /// Correction queues for partial batches, keyed by batch id
    corrections: Arc<Mutex<HashMap<String, CorrectionQueue>>>,
}

// ============================================================================
// Response envelope
// ============================================================================

/// API Response wrapper
#[derive(Serialize)]
struct ApiResponse<T> {
    success: bool,
    data: T,
}

impl<T> ApiResponse<T> {
    fn ok(data: T) -> Json<Self> {
        Json(Self {
            success: true,
            data,
        })
    }
}

/// Error envelope carrying the stable machine code plus whatever details
/// the operator needs to act (which file, which date, which rows).
#[derive(Serialize)]
struct ApiErrorBody {
    success: bool,
    error_code: &'static str,
    message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    details: Option<serde_json::Value>,
}

struct ApiError(CoreError);

impl From<CoreError> for ApiError {
    fn from(err: CoreError) -> Self {
        ApiError(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let code = self.0.code();
        let status = match code {
            "VALIDATION_ERROR" => StatusCode::BAD_REQUEST,
            "DUPLICATE_FILE" | "CONFLICT" => StatusCode::CONFLICT,
            "FORBIDDEN" => StatusCode::FORBIDDEN,
            "NOT_FOUND" => StatusCode::NOT_FOUND,
            "CONNECTION_ERROR" => StatusCode::SERVICE_UNAVAILABLE,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };

        if status == StatusCode::INTERNAL_SERVER_ERROR {
            tracing::error!(error = %self.0, "request failed");
        }

        let details = match &self.0 {
            CoreError::DuplicateFile {
                filename,
                original_upload_date,
            } => Some(serde_json::json!({
                "filename": filename,
                "original_upload_date": original_upload_date.to_rfc3339(),
            })),
            _ => None,
        };

        let body = ApiErrorBody {
            success: false,
            error_code: code,
            message: self.0.to_string(),
            details,
        };

        (status, Json(body)).into_response()
    }
}

// ============================================================================
// Upload + correction handlers
// ============================================================================

#[derive(Deserialize)]
struct UploadRequest {
    filename: String,
    source_kind: String,
    /// Raw file content; CSV and OFX are both text formats
    content: String,
}

#[derive(Serialize)]
struct UploadData {
    batch_id: String,
    status: &'static str,
    items_imported: usize,
    duplicates_found: usize,
    saved_count: usize,
    items_incomplete: usize,
    incomplete_items: Vec<ledger_reconcile::IncompleteEntry>,
}

/// POST /api/upload
async fn upload(
    State(state): State<AppState>,
    Json(request): Json<UploadRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let source_kind = SourceKind::parse(&request.source_kind).ok_or_else(|| {
        CoreError::InvalidUpload(format!(
            "source_kind must be 'bank' or 'company', got '{}'",
            request.source_kind
        ))
    })?;

    let mut conn = state.db.lock().unwrap();
    let report = state.pipeline.ingest(
        &mut conn,
        request.content.as_bytes(),
        &request.filename,
        source_kind,
    )?;
    drop(conn);

    // Partial batches hold their incomplete rows for the correction loop
    if !report.incomplete.is_empty() {
        state.corrections.lock().unwrap().insert(
            report.batch_id.clone(),
            CorrectionQueue::new(&report.batch_id, source_kind, report.incomplete.clone()),
        );
    }

    tracing::info!(
        batch_id = %report.batch_id,
        imported = report.imported,
        incomplete = report.incomplete.len(),
        "file ingested"
    );

    Ok(ApiResponse::ok(UploadData {
        batch_id: report.batch_id.clone(),
        status: report.status.as_str(),
        items_imported: report.imported,
        duplicates_found: report.duplicate_rows,
        saved_count: report.imported,
        items_incomplete: report.incomplete.len(),
        incomplete_items: report.incomplete,
    }))
}

#[derive(Deserialize)]
struct CorrectedEntry {
    row_number: usize,
    date: Option<String>,
    description: Option<String>,
    amount: Option<String>,
    category: Option<String>,
    kind: Option<String>,
}

#[derive(Deserialize)]
struct CorrectedRequest {
    batch_id: String,
    entries: Vec<CorrectedEntry>,
}

#[derive(Serialize)]
struct CorrectedData {
    items_imported: usize,
    duplicates_found: usize,
    still_incomplete: Vec<ledger_reconcile::IncompleteEntry>,
    nothing_to_save: bool,
}

/// POST /api/corrected - resubmit operator-corrected rows
async fn corrected(
    State(state): State<AppState>,
    Json(request): Json<CorrectedRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let mut queues = state.corrections.lock().unwrap();
    let queue = queues.get_mut(&request.batch_id).ok_or_else(|| {
        CoreError::NotFound(format!("correction batch '{}'", request.batch_id))
    })?;

    // Apply the operator's edits; only edited rows gain the corrected flag
    for entry in &request.entries {
        let fields = [
            ("date", &entry.date),
            ("description", &entry.description),
            ("amount", &entry.amount),
            ("category", &entry.category),
            ("kind", &entry.kind),
        ];
        for (name, value) in fields {
            if value.is_some() {
                queue
                    .edit(entry.row_number, name, value.clone())
                    .map_err(CoreError::InvalidUpload)?;
            }
        }
    }

    let conn = state.db.lock().unwrap();
    let report = queue.resubmit(&conn)?;
    drop(conn);

    if queue.is_empty() {
        queues.remove(&request.batch_id);
    }

    Ok(ApiResponse::ok(CorrectedData {
        items_imported: report.saved,
        duplicates_found: report.duplicate_rows,
        still_incomplete: report.still_incomplete,
        nothing_to_save: report.nothing_to_save,
    }))
}

// ============================================================================
// Reconciliation handlers
// ============================================================================

#[derive(Serialize)]
struct PendingData {
    records: Vec<ledger_reconcile::PendingMatch>,
}

/// GET /api/reconciliation/pending
async fn pending(State(state): State<AppState>) -> Result<impl IntoResponse, ApiError> {
    let conn = state.db.lock().unwrap();
    let records = state.service.list_pending(&conn)?;
    Ok(ApiResponse::ok(PendingData { records }))
}

/// POST /api/reconciliation/start
async fn start(State(state): State<AppState>) -> Result<impl IntoResponse, ApiError> {
    let mut conn = state.db.lock().unwrap();
    let report = state.service.start(&mut conn)?;
    tracing::info!(created = report.created, "reconciliation run");
    Ok(ApiResponse::ok(report))
}

#[derive(Deserialize)]
struct DateRange {
    start_date: NaiveDate,
    end_date: NaiveDate,
}

/// POST /api/reconciliation/start-anomaly
async fn start_anomaly(
    State(state): State<AppState>,
    Json(range): Json<DateRange>,
) -> Result<impl IntoResponse, ApiError> {
    let mut conn = state.db.lock().unwrap();
    let report = state
        .service
        .start_anomaly_aware(&mut conn, (range.start_date, range.end_date))?;
    tracing::info!(
        created = report.created,
        flagged = report.flagged,
        "anomaly-aware reconciliation run"
    );
    Ok(ApiResponse::ok(report))
}

/// POST /api/reconciliation/:id/confirm
async fn confirm(
    State(state): State<AppState>,
    Path(match_id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let conn = state.db.lock().unwrap();
    let updated = state.service.confirm(&conn, &match_id)?;
    Ok(ApiResponse::ok(updated))
}

/// POST /api/reconciliation/:id/reject
async fn reject(
    State(state): State<AppState>,
    Path(match_id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let conn = state.db.lock().unwrap();
    let updated = state.service.reject(&conn, &match_id)?;
    Ok(ApiResponse::ok(updated))
}

#[derive(Serialize)]
struct ReportSummary {
    total_records: i64,
    confirmed: i64,
    pending: i64,
    rejected: i64,
    reconciliation_rate: f64,
}

#[derive(Serialize)]
struct ReportFinancials {
    total_reconciled_value: f64,
}

#[derive(Serialize)]
struct ReportData {
    summary: ReportSummary,
    financials: ReportFinancials,
}

/// GET /api/reconciliation/report
async fn report(State(state): State<AppState>) -> Result<impl IntoResponse, ApiError> {
    let conn = state.db.lock().unwrap();
    let report = state.service.report(&conn)?;
    Ok(ApiResponse::ok(ReportData {
        summary: ReportSummary {
            total_records: report.total_records,
            confirmed: report.confirmed,
            pending: report.pending,
            rejected: report.rejected,
            reconciliation_rate: report.reconciliation_rate,
        },
        financials: ReportFinancials {
            total_reconciled_value: report.total_reconciled_value,
        },
    }))
}

// ============================================================================
// Batch + purge handlers
// ============================================================================

/// GET /api/batches
async fn batches(State(state): State<AppState>) -> Result<impl IntoResponse, ApiError> {
    let conn = state.db.lock().unwrap();
    let stats = db::list_batches(&conn).map_err(CoreError::Other)?;
    Ok(ApiResponse::ok(stats))
}

#[derive(Deserialize)]
struct PurgeParams {
    mode: String,
    days_old: i64,
    #[serde(default)]
    force: bool,
    confirm: Option<String>,
}

/// GET /api/purge?mode=preview|confirmation|execution&days_old=N
async fn purge(
    State(state): State<AppState>,
    Query(params): Query<PurgeParams>,
) -> Result<Response, ApiError> {
    let mode = PurgeMode::parse(&params.mode).ok_or_else(|| {
        CoreError::InvalidUpload(format!("unknown purge mode '{}'", params.mode))
    })?;

    let mut gate = state.purge.lock().unwrap();
    let mut conn = state.db.lock().unwrap();

    let response = match mode {
        PurgeMode::Preview => {
            let preview = gate.preview(&conn, params.days_old)?;
            ApiResponse::ok(preview).into_response()
        }
        PurgeMode::Confirmation => {
            let confirmation = gate.confirm(&conn, params.days_old)?;
            ApiResponse::ok(confirmation).into_response()
        }
        PurgeMode::Execution => {
            let token = params.confirm.as_deref().unwrap_or_default();
            let outcome = gate.execute(&mut conn, params.days_old, params.force, token)?;
            tracing::warn!(
                batches = outcome.batches_deleted,
                records = outcome.records_deleted,
                "aged data purged"
            );
            ApiResponse::ok(outcome).into_response()
        }
    };

    Ok(response)
}

/// GET /api/health
async fn health_check() -> impl IntoResponse {
    ApiResponse::ok("OK")
}

// ============================================================================
// Main Server
// ============================================================================

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,tower_http=debug".into()),
        )
        .init();

    let config = Config::from_env();

    let conn = Connection::open(&config.database_path).expect("Failed to open database");
    setup_database(&conn).expect("Failed to initialize schema");
    tracing::info!(path = %config.database_path.display(), "database ready");

    let state = AppState {
        db: Arc::new(Mutex::new(conn)),
        pipeline: Arc::new(IngestionPipeline::new(config.limits.clone())),
        service: Arc::new(ReconciliationService::new(config.matcher.clone())),
        purge: Arc::new(Mutex::new(PurgeGate::new(config.purge.clone()))),
        corrections: Arc::new(Mutex::new(HashMap::new())),
    };

    let api_routes = Router::new()
        .route("/health", get(health_check))
        .route("/upload", post(upload))
        .route("/corrected", post(corrected))
        .route("/batches", get(batches))
        .route("/reconciliation/pending", get(pending))
        .route("/reconciliation/start", post(start))
        .route("/reconciliation/start-anomaly", post(start_anomaly))
        .route("/reconciliation/:id/confirm", post(confirm))
        .route("/reconciliation/:id/reject", post(reject))
        .route("/reconciliation/report", get(report))
        .route("/purge", get(purge))
        .with_state(state);

    let app = Router::new()
        .nest("/api", api_routes)
        .layer(CorsLayer::permissive());

    let addr = std::env::var("RECON_BIND").unwrap_or_else(|_| "0.0.0.0:3000".to_string());
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .expect("Failed to bind to address");

    tracing::info!(%addr, "server listening");

    axum::serve(listener, app)
        .await
        .expect("Failed to start server");
}
