// Anomaly Detection Seam
// The detection model is an external collaborator; the workflow only reads
// its flags. Flags annotate reconciliation matches for the operator - they
// never skip or replace the confirm/reject gate.

use crate::db::LedgerRecord;
use anyhow::Result;
use serde::Serialize;

/// One flagged record.
#[derive(Debug, Clone, Serialize)]
pub struct AnomalyFlag {
    pub record_id: String,
    /// Detector-specific severity in [0,1]
    pub score: f64,
    /// Human-readable explanation shown next to the match
    pub reason: String,
}

/// Flags suspicious records inside a candidate window.
pub trait AnomalyDetector: Send + Sync {
    fn flag(&self, records: &[LedgerRecord]) -> Result<Vec<AnomalyFlag>>;
}

// ============================================================================
// DEFAULT DETECTOR
// ============================================================================

/// Flags amounts far outside the window's distribution.
pub struct AmountSpikeDetector {
    /// How many standard deviations above the mean counts as anomalous
    pub sigma_threshold: f64,

    /// Windows smaller than this have no meaningful distribution
    pub min_sample_size: usize,
}

impl AmountSpikeDetector {
    pub fn new() -> Self {
        AmountSpikeDetector {
            sigma_threshold: 3.0,
            min_sample_size: 5,
        }
    }
}

impl AnomalyDetector for AmountSpikeDetector {
    fn flag(&self, records: &[LedgerRecord]) -> Result<Vec<AnomalyFlag>> {
        if records.len() < self.min_sample_size {
            return Ok(Vec::new());
        }

        let magnitudes: Vec<f64> = records.iter().map(|r| r.amount.abs()).collect();
        let n = magnitudes.len() as f64;
        let sum: f64 = magnitudes.iter().sum();
        let sum_sq: f64 = magnitudes.iter().map(|m| m * m).sum();

        // Each record is judged against the distribution of the *other*
        // records - an extreme spike must not mask itself by inflating the
        // deviation it is measured with.
        let mut flags = Vec::new();
        for (record, magnitude) in records.iter().zip(&magnitudes) {
            let rest_mean = (sum - magnitude) / (n - 1.0);
            let rest_var =
                ((sum_sq - magnitude * magnitude) / (n - 1.0) - rest_mean * rest_mean).max(0.0);
            let rest_std = rest_var.sqrt();

            if rest_std < f64::EPSILON {
                continue;
            }

            let sigmas = (magnitude - rest_mean) / rest_std;
            if sigmas > self.sigma_threshold {
                flags.push(AnomalyFlag {
                    record_id: record.id.clone(),
                    score: (sigmas / (self.sigma_threshold * 2.0)).min(1.0),
                    reason: format!(
                        "amount ${:.2} is {:.1} standard deviations above the window mean ${:.2}",
                        magnitude, sigmas, rest_mean
                    ),
                });
            }
        }

        Ok(flags)
    }
}

impl Default for AmountSpikeDetector {
    fn default() -> Self {
        Self::new()
    }
}

// ============================================================================
// TESTS
// ============================================================================
