// Guarded Destructive Operation
// Three-step deletion of aged upload data: Preview -> Confirmation ->
// Execution. A feature flag gates entry entirely; every step requires the
// previous step's output for the same parameters; execution additionally
// requires force plus the operator-typed confirmation token. Nothing is
// deleted on any out-of-order call.

use crate::config::PurgeConfig;
use crate::db;
use crate::error::{CoreError, CoreResult};
use chrono::{DateTime, Duration, Utc};
use rusqlite::Connection;
use serde::Serialize;

/// The literal the operator must type to arm execution.
pub const CONFIRMATION_TOKEN: &str = "DELETE";

// ============================================================================
// STEP OUTPUTS
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PurgeMode {
    Preview,
    Confirmation,
    Execution,
}

impl PurgeMode {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "preview" => Some(Self::Preview),
            "confirmation" => Some(Self::Confirmation),
            "execution" => Some(Self::Execution),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct PurgePreview {
    pub days_old: i64,
    pub cutoff: DateTime<Utc>,
    pub eligible_batches: i64,
}

#[derive(Debug, Clone, Serialize)]
pub struct PurgeConfirmation {
    pub days_old: i64,
    /// Full identifiers of everything that execution would delete
    pub batch_ids: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct PurgeOutcome {
    pub batches_deleted: usize,
    pub records_deleted: usize,
}

// ============================================================================
// PURGE GATE
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum GateState {
    Idle,
    Previewed { days_old: i64 },
    Confirmed { days_old: i64 },
}

/// Walks one operator through the deletion flow. The gate holds only the
/// step progression; eligibility is recomputed from storage at every step,
/// so the age threshold is always revalidated server-side.
pub struct PurgeGate {
    config: PurgeConfig,
    state: GateState,
}

impl PurgeGate {
    pub fn new(config: PurgeConfig) -> Self {
        PurgeGate {
            config,
            state: GateState::Idle,
        }
    }

    /// Step 1: show what an execution with this threshold would remove.
    pub fn preview(&mut self, conn: &Connection, days_old: i64) -> CoreResult<PurgePreview> {
        self.check_entry(days_old)?;

        let cutoff = cutoff_for(days_old);
        let eligible_batches = db::count_batches_older_than(conn, cutoff)?;

        self.state = GateState::Previewed { days_old };
        Ok(PurgePreview {
            days_old,
            cutoff,
            eligible_batches,
        })
    }

    /// Step 2: list the exact rows. Requires a preview for the same
    /// threshold - changing the parameters restarts the flow.
    pub fn confirm(&mut self, conn: &Connection, days_old: i64) -> CoreResult<PurgeConfirmation> {
        self.check_entry(days_old)?;

        match self.state {
            GateState::Previewed { days_old: seen } | GateState::Confirmed { days_old: seen }
                if seen == days_old => {}
            _ => {
                return Err(CoreError::Forbidden(
                    "confirmation requires a prior preview with the same days_old".to_string(),
                ))
            }
        }

        let batch_ids = db::batch_ids_older_than(conn, cutoff_for(days_old))?;
        self.state = GateState::Confirmed { days_old };
        Ok(PurgeConfirmation { days_old, batch_ids })
    }

    /// Step 3: the irreversible delete. Requires the prior confirmation,
    /// `force`, and the operator-typed confirmation token.
    pub fn execute(
        &mut self,
        conn: &mut Connection,
        days_old: i64,
        force: bool,
        token: &str,
    ) -> CoreResult<PurgeOutcome> {
        self.check_entry(days_old)?;

        match self.state {
            GateState::Confirmed { days_old: seen } if seen == days_old => {}
            _ => {
                return Err(CoreError::Forbidden(
                    "execution requires the preview and confirmation steps for the same days_old"
                        .to_string(),
                ))
            }
        }
        if !force {
            return Err(CoreError::Forbidden(
                "execution requires force=true".to_string(),
            ));
        }
        if token != CONFIRMATION_TOKEN {
            return Err(CoreError::Forbidden(format!(
                "execution requires the typed confirmation token '{}'",
                CONFIRMATION_TOKEN
            )));
        }

        let (batches_deleted, records_deleted) =
            db::delete_batches_older_than(conn, cutoff_for(days_old))?;

        // The flow is spent; another deletion starts from preview again
        self.state = GateState::Idle;

        Ok(PurgeOutcome {
            batches_deleted,
            records_deleted,
        })
    }

    fn check_entry(&self, days_old: i64) -> CoreResult<()> {
        if !self.config.enabled {
            return Err(CoreError::Forbidden(
                "data purge is disabled on this server".to_string(),
            ));
        }
        // Never trust the client's threshold alone
        if days_old < self.config.min_age_days {
            return Err(CoreError::Forbidden(format!(
                "age threshold must be at least {} days",
                self.config.min_age_days
            )));
        }
        Ok(())
    }
}

fn cutoff_for(days_old: i64) -> DateTime<Utc> {
    Utc::now() - Duration::days(days_old)
}

// ============================================================================
// TESTS
// ============================================================================
