use anyhow::{bail, Result};
use rusqlite::Connection;
use std::env;
use std::path::Path;

use ledger_reconcile::{
    db, setup_database, Config, CoreError, IngestionPipeline, ReconciliationService, SourceKind,
};

fn main() -> Result<()> {
    let args: Vec<String> = env::args().collect();

    match args.get(1).map(String::as_str) {
        Some("import") => run_import(&args[2..]),
        Some("reconcile") => run_reconcile(&args[2..]),
        Some("report") => run_report(),
        Some("batches") => run_batches(),
        _ => {
            print_usage();
            Ok(())
        }
    }
}

fn print_usage() {
    println!("ledger-reconcile {}", ledger_reconcile::VERSION);
    println!();
    println!("Usage:");
    println!("  ledger-reconcile import <file> <bank|company>   Ingest a statement or ledger file");
    println!("  ledger-reconcile reconcile [--anomaly]          Generate pending matches");
    println!("  ledger-reconcile report                         Show reconciliation totals");
    println!("  ledger-reconcile batches                        List upload batches");
}

fn open_database(config: &Config) -> Result<Connection> {
    let conn = Connection::open(&config.database_path)?;
    setup_database(&conn)?;
    Ok(conn)
}

fn run_import(args: &[String]) -> Result<()> {
    let (file_arg, kind_arg) = match (args.first(), args.get(1)) {
        (Some(f), Some(k)) => (f, k),
        _ => bail!("usage: ledger-reconcile import <file> <bank|company>"),
    };

    let source_kind = match SourceKind::parse(kind_arg) {
        Some(kind) => kind,
        None => bail!("source must be 'bank' or 'company', got '{}'", kind_arg),
    };

    let config = Config::from_env();
    let mut conn = open_database(&config)?;

    let path = Path::new(file_arg);
    let bytes = std::fs::read(path)?;
    let filename = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| file_arg.clone());

    println!("Importing {} ({} bytes, {} upload)...", filename, bytes.len(), source_kind.as_str());

    let pipeline = IngestionPipeline::new(config.limits.clone());
    match pipeline.ingest(&mut conn, &bytes, &filename, source_kind) {
        Ok(report) => {
            println!("✓ Imported: {} rows", report.imported);
            if report.duplicate_rows > 0 {
                println!("✓ Skipped duplicate rows: {}", report.duplicate_rows);
            }
            if !report.incomplete.is_empty() {
                println!("! Incomplete rows: {}", report.incomplete.len());
                for entry in &report.incomplete {
                    println!("    row {}: {}", entry.row_number, entry.error);
                }
                println!("  Batch saved as '{}'; correct the rows above and resubmit.", report.status.as_str());
            }
            println!("✓ Batch {} ({})", report.batch_id, report.status.as_str());
        }
        Err(CoreError::DuplicateFile {
            filename,
            original_upload_date,
        }) => {
            println!(
                "✗ This file was already ingested as '{}' on {}",
                filename,
                original_upload_date.format("%Y-%m-%d %H:%M UTC")
            );
        }
        Err(e) => return Err(e.into()),
    }

    Ok(())
}

fn run_reconcile(args: &[String]) -> Result<()> {
    let config = Config::from_env();
    let mut conn = open_database(&config)?;
    let service = ReconciliationService::new(config.matcher.clone());

    let report = if args.iter().any(|a| a == "--anomaly") {
        // Sweep the last year when no explicit window is given
        let today = chrono::Utc::now().date_naive();
        let range = (today - chrono::Duration::days(365), today);
        service.start_anomaly_aware(&mut conn, range)?
    } else {
        service.start(&mut conn)?
    };

    println!("✓ Created {} pending matches", report.created);
    if report.flagged > 0 {
        println!("! {} of them are flagged as anomalous", report.flagged);
    }
    if report.already_pending > 0 {
        println!("  Skipped {} candidates already pending", report.already_pending);
    }

    let pending = service.list_pending(&conn)?;
    println!("  {} matches now awaiting a decision", pending.len());

    Ok(())
}

fn run_report() -> Result<()> {
    let config = Config::from_env();
    let conn = open_database(&config)?;
    let service = ReconciliationService::new(config.matcher.clone());

    let report = service.report(&conn)?;
    println!("Reconciliation report");
    println!("  total matches:    {}", report.total_records);
    println!("  confirmed:        {}", report.confirmed);
    println!("  pending:          {}", report.pending);
    println!("  rejected:         {}", report.rejected);
    println!("  rate:             {:.1}%", report.reconciliation_rate * 100.0);
    println!("  reconciled value: ${:.2}", report.total_reconciled_value);

    Ok(())
}

fn run_batches() -> Result<()> {
    let config = Config::from_env();
    let conn = open_database(&config)?;

    let batches = db::list_batches(&conn)?;
    if batches.is_empty() {
        println!("No uploads yet.");
        return Ok(());
    }

    for batch in batches {
        println!(
            "{}  {:10}  {:9}  {:4} rows  ${:<12.2}  {}",
            batch.uploaded_at.format("%Y-%m-%d %H:%M"),
            batch.source_kind.as_str(),
            batch.status.as_str(),
            batch.record_count,
            batch.total_amount,
            batch.filename,
        );
    }

    Ok(())
}
