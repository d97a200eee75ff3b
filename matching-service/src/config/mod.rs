//! Configuration module for matching-service.

use service_core::config as core_config;
use service_core::error::AppError;
use std::env;
use std::str::FromStr;

#[derive(Debug, Clone)]
pub struct MatchingConfig {
    pub common: core_config::Config,
    pub service_name: String,
    pub service_version: String,
    pub log_level: String,
    pub otlp_endpoint: Option<String>,
    pub database: DatabaseConfig,
    pub fx: FxConfig,
    pub worker: WorkerConfig,
    pub scoring: ScoringConfig,
}

#[derive(Debug, Clone)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
    pub min_connections: u32,
}

#[derive(Debug, Clone)]
pub struct FxConfig {
    /// Base URL of the FX rate service. Empty means no provider is
    /// configured and the engine falls back to a fixed in-process table,
    /// which is only acceptable outside production.
    pub base_url: String,
    pub timeout_secs: u64,
}

#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub enabled: bool,
    pub worker_count: usize,
    pub queue_size: usize,
    /// Wall-clock budget for a single evaluation cycle.
    pub evaluation_budget_secs: u64,
    /// How many times a timed-out job is requeued before being dropped.
    pub max_requeues: u32,
}

/// Tunable thresholds for the scoring and decision pipeline.
#[derive(Debug, Clone)]
pub struct ScoringConfig {
    pub amount_weight: f64,
    pub date_weight: f64,
    pub counterparty_weight: f64,
    /// Relative difference above which same-currency amounts score zero.
    pub amount_tolerance: f64,
    /// Relative difference above which converted amounts score zero.
    pub fx_tolerance: f64,
    pub date_window_days: i64,
    /// Extra days added to the date window when gathering candidates, so
    /// near-boundary pairs are still scored rather than silently skipped.
    pub candidate_margin_days: i64,
    pub candidate_limit: usize,
    pub auto_match_floor: f64,
    pub suggestion_floor: f64,
    /// Empty evaluation cycles before a pending document moves to no_match.
    pub max_evaluation_attempts: i32,
}

impl Default for ScoringConfig {
    fn default() -> Self {
        Self {
            amount_weight: 0.45,
            date_weight: 0.30,
            counterparty_weight: 0.25,
            amount_tolerance: 0.02,
            fx_tolerance: 0.05,
            date_window_days: 7,
            candidate_margin_days: 3,
            candidate_limit: 50,
            auto_match_floor: 0.90,
            suggestion_floor: 0.65,
            max_evaluation_attempts: 5,
        }
    }
}

impl ScoringConfig {
    pub fn from_env() -> Result<Self, AppError> {
        let defaults = Self::default();
        let config = Self {
            amount_weight: env_parse("MATCH_AMOUNT_WEIGHT", defaults.amount_weight)?,
            date_weight: env_parse("MATCH_DATE_WEIGHT", defaults.date_weight)?,
            counterparty_weight: env_parse(
                "MATCH_COUNTERPARTY_WEIGHT",
                defaults.counterparty_weight,
            )?,
            amount_tolerance: env_parse("MATCH_AMOUNT_TOLERANCE", defaults.amount_tolerance)?,
            fx_tolerance: env_parse("MATCH_FX_TOLERANCE", defaults.fx_tolerance)?,
            date_window_days: env_parse("MATCH_DATE_WINDOW_DAYS", defaults.date_window_days)?,
            candidate_margin_days: env_parse(
                "MATCH_CANDIDATE_MARGIN_DAYS",
                defaults.candidate_margin_days,
            )?,
            candidate_limit: env_parse("MATCH_CANDIDATE_LIMIT", defaults.candidate_limit)?,
            auto_match_floor: env_parse("MATCH_AUTO_FLOOR", defaults.auto_match_floor)?,
            suggestion_floor: env_parse("MATCH_SUGGESTION_FLOOR", defaults.suggestion_floor)?,
            max_evaluation_attempts: env_parse(
                "MATCH_MAX_EVALUATION_ATTEMPTS",
                defaults.max_evaluation_attempts,
            )?,
        };
        config.validate()?;
        Ok(config)
    }

    /// Rejects configurations the engine cannot run with. Called once at
    /// startup so a bad deployment fails fast instead of scoring garbage.
    pub fn validate(&self) -> Result<(), AppError> {
        let weights = [
            ("MATCH_AMOUNT_WEIGHT", self.amount_weight),
            ("MATCH_DATE_WEIGHT", self.date_weight),
            ("MATCH_COUNTERPARTY_WEIGHT", self.counterparty_weight),
        ];
        for (name, value) in weights {
            if !value.is_finite() || value < 0.0 {
                return Err(AppError::ConfigError(anyhow::anyhow!(
                    "{} must be a non-negative finite number, got {}",
                    name,
                    value
                )));
            }
        }
        if self.amount_weight + self.date_weight + self.counterparty_weight <= 0.0 {
            return Err(AppError::ConfigError(anyhow::anyhow!(
                "signal weights must not all be zero"
            )));
        }

        let tolerances = [
            ("MATCH_AMOUNT_TOLERANCE", self.amount_tolerance),
            ("MATCH_FX_TOLERANCE", self.fx_tolerance),
        ];
        for (name, value) in tolerances {
            if !value.is_finite() || !(0.0..1.0).contains(&value) {
                return Err(AppError::ConfigError(anyhow::anyhow!(
                    "{} must be in [0, 1), got {}",
                    name,
                    value
                )));
            }
        }

        if !(self.suggestion_floor > 0.0
            && self.suggestion_floor < self.auto_match_floor
            && self.auto_match_floor <= 1.0)
        {
            return Err(AppError::ConfigError(anyhow::anyhow!(
                "decision floors must satisfy 0 < MATCH_SUGGESTION_FLOOR < MATCH_AUTO_FLOOR <= 1, got {} and {}",
                self.suggestion_floor,
                self.auto_match_floor
            )));
        }

        if self.date_window_days <= 0 {
            return Err(AppError::ConfigError(anyhow::anyhow!(
                "MATCH_DATE_WINDOW_DAYS must be positive, got {}",
                self.date_window_days
            )));
        }
        if self.candidate_margin_days < 0 {
            return Err(AppError::ConfigError(anyhow::anyhow!(
                "MATCH_CANDIDATE_MARGIN_DAYS must not be negative, got {}",
                self.candidate_margin_days
            )));
        }
        if self.candidate_limit == 0 {
            return Err(AppError::ConfigError(anyhow::anyhow!(
                "MATCH_CANDIDATE_LIMIT must be positive"
            )));
        }
        if self.max_evaluation_attempts <= 0 {
            return Err(AppError::ConfigError(anyhow::anyhow!(
                "MATCH_MAX_EVALUATION_ATTEMPTS must be positive, got {}",
                self.max_evaluation_attempts
            )));
        }

        Ok(())
    }

    /// Width of the candidate search window on each side of the anchor date.
    pub fn candidate_window_days(&self) -> i64 {
        self.date_window_days + self.candidate_margin_days
    }
}

impl MatchingConfig {
    pub fn from_env() -> Result<Self, AppError> {
        let common = core_config::Config::load()?;

        let fx = FxConfig {
            base_url: env::var("FX_SERVICE_URL").unwrap_or_default(),
            timeout_secs: env_parse("FX_TIMEOUT_SECS", 5)?,
        };
        if common.is_prod() && fx.base_url.is_empty() {
            return Err(AppError::ConfigError(anyhow::anyhow!(
                "FX_SERVICE_URL is required in production"
            )));
        }

        Ok(Self {
            common,
            service_name: env::var("SERVICE_NAME")
                .unwrap_or_else(|_| "matching-service".to_string()),
            service_version: env::var("SERVICE_VERSION")
                .unwrap_or_else(|_| env!("CARGO_PKG_VERSION").to_string()),
            log_level: env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string()),
            otlp_endpoint: env::var("OTLP_ENDPOINT").ok(),
            database: DatabaseConfig {
                url: env::var("DATABASE_URL").map_err(|_| {
                    AppError::ConfigError(anyhow::anyhow!("DATABASE_URL is required"))
                })?,
                max_connections: env_parse("DATABASE_MAX_CONNECTIONS", 10)?,
                min_connections: env_parse("DATABASE_MIN_CONNECTIONS", 2)?,
            },
            fx,
            worker: WorkerConfig {
                enabled: env_parse("WORKER_ENABLED", true)?,
                worker_count: env_parse("WORKER_COUNT", 4)?,
                queue_size: env_parse("WORKER_QUEUE_SIZE", 100)?,
                evaluation_budget_secs: env_parse("EVALUATION_BUDGET_SECS", 30)?,
                max_requeues: env_parse("WORKER_MAX_REQUEUES", 3)?,
            },
            scoring: ScoringConfig::from_env()?,
        })
    }
}

/// Reads an environment variable, falling back to the default only when the
/// variable is unset. A set-but-unparsable value is a configuration error,
/// never a silent default.
fn env_parse<T: FromStr>(key: &str, default: T) -> Result<T, AppError> {
    match env::var(key) {
        Ok(raw) => raw.parse::<T>().map_err(|_| {
            AppError::ConfigError(anyhow::anyhow!("{} has invalid value '{}'", key, raw))
        }),
        Err(_) => Ok(default),
    }
}
