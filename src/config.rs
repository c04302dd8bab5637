// Runtime configuration
// Everything tunable comes from environment variables with sane defaults,
// so the CLI and the server binary share one loading path.

use std::env;
use std::path::PathBuf;

/// Upload gates applied before any row is parsed.
#[derive(Debug, Clone)]
pub struct UploadLimits {
    /// Hard ceiling on file size in bytes.
    pub max_file_bytes: usize,

    /// Extensions accepted on the bank-statement upload surface.
    pub bank_extensions: Vec<String>,

    /// Extensions accepted on the company-ledger upload surface (narrower).
    pub company_extensions: Vec<String>,
}

impl Default for UploadLimits {
    fn default() -> Self {
        UploadLimits {
            max_file_bytes: 5 * 1024 * 1024,
            bank_extensions: vec!["csv".to_string(), "ofx".to_string()],
            company_extensions: vec!["csv".to_string()],
        }
    }
}

/// Matcher tuning shared by plain and anomaly-aware reconciliation runs.
#[derive(Debug, Clone)]
pub struct MatcherConfig {
    /// Candidates scoring below this are never proposed.
    pub min_score: f64,

    /// Wall-clock budget for one matching pass, in milliseconds.
    pub timeout_ms: u64,
}

impl Default for MatcherConfig {
    fn default() -> Self {
        MatcherConfig {
            min_score: 0.70,
            timeout_ms: 5_000,
        }
    }
}

/// Guarded-deletion settings.
#[derive(Debug, Clone)]
pub struct PurgeConfig {
    /// Feature flag; when false the purge flow is unreachable.
    pub enabled: bool,

    /// Server-side floor for the operator-supplied age threshold (days).
    pub min_age_days: i64,
}

impl Default for PurgeConfig {
    fn default() -> Self {
        PurgeConfig {
            enabled: false,
            min_age_days: 30,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    pub database_path: PathBuf,
    pub limits: UploadLimits,
    pub matcher: MatcherConfig,
    pub purge: PurgeConfig,
}

impl Config {
    /// Load configuration from the environment, falling back to defaults.
    ///
    /// Recognized variables:
    /// - `RECON_DB_PATH`
    /// - `RECON_MAX_FILE_BYTES`
    /// - `RECON_MATCH_MIN_SCORE`
    /// - `RECON_MATCH_TIMEOUT_MS`
    /// - `RECON_PURGE_ENABLED` ("1"/"true")
    /// - `RECON_PURGE_MIN_AGE_DAYS`
    pub fn from_env() -> Self {
        let mut config = Config::default();

        if let Ok(path) = env::var("RECON_DB_PATH") {
            config.database_path = PathBuf::from(path);
        }
        if let Some(bytes) = env_parse::<usize>("RECON_MAX_FILE_BYTES") {
            config.limits.max_file_bytes = bytes;
        }
        if let Some(score) = env_parse::<f64>("RECON_MATCH_MIN_SCORE") {
            config.matcher.min_score = score.clamp(0.0, 1.0);
        }
        if let Some(ms) = env_parse::<u64>("RECON_MATCH_TIMEOUT_MS") {
            config.matcher.timeout_ms = ms;
        }
        if let Ok(flag) = env::var("RECON_PURGE_ENABLED") {
            config.purge.enabled = flag == "1" || flag.eq_ignore_ascii_case("true");
        }
        if let Some(days) = env_parse::<i64>("RECON_PURGE_MIN_AGE_DAYS") {
            config.purge.min_age_days = days.max(0);
        }

        config
    }
}

impl Default for Config {
    fn default() -> Self {
        Config {
            database_path: PathBuf::from("reconciliation.db"),
            limits: UploadLimits::default(),
            matcher: MatcherConfig::default(),
            purge: PurgeConfig::default(),
        }
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    env::var(key).ok().and_then(|v| v.parse().ok())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.limits.max_file_bytes, 5 * 1024 * 1024);
        assert!(config.limits.bank_extensions.contains(&"ofx".to_string()));
        // Company surface is strictly narrower than the bank surface
        assert!(!config.limits.company_extensions.contains(&"ofx".to_string()));
        assert!(!config.purge.enabled);
    }

    #[test]
    fn test_min_score_clamped() {
        std::env::set_var("RECON_MATCH_MIN_SCORE", "7.5");
        let config = Config::from_env();
        assert_eq!(config.matcher.min_score, 1.0);
        std::env::remove_var("RECON_MATCH_MIN_SCORE");
    }
}
