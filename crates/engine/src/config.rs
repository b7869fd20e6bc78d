//! Engine configuration

use std::env;

use rust_decimal::Decimal;

use crate::classifier::RiskTable;

const DEFAULT_SHARD_COUNT: usize = 4;
const DEFAULT_PAGE_SIZE: usize = 500;
const DEFAULT_PRICE_INCREASE_TOLERANCE_PCT: i64 = 10;
const DEFAULT_GRANDFATHER_MIN_TENURE_DAYS: i64 = 365;
const DEFAULT_GRACE_PERIOD_DAYS: i64 = 14;

/// Engine configuration loaded from environment variables
#[derive(Debug, Clone)]
pub struct EngineConfig {
    // Ledger storage (Postgres backend only)
    pub database_url: Option<String>,
    pub database_max_connections: u32,

    // Analysis
    pub analysis_shard_count: usize,
    pub analysis_page_size: usize,
    /// Price increases up to this percentage of the current monthly price need no action
    pub price_increase_tolerance_pct: Decimal,
    /// Subscriptions at least this old are grandfathered on price increases
    pub grandfather_min_tenure: time::Duration,

    // Migration
    pub default_grace_period: time::Duration,

    // Risk
    pub risk_table: RiskTable,

    // Notifications
    pub notification_webhook_url: Option<String>,
    pub notification_webhook_token: Option<String>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            database_url: None,
            database_max_connections: 5,
            analysis_shard_count: DEFAULT_SHARD_COUNT,
            analysis_page_size: DEFAULT_PAGE_SIZE,
            price_increase_tolerance_pct: Decimal::from(DEFAULT_PRICE_INCREASE_TOLERANCE_PCT),
            grandfather_min_tenure: time::Duration::days(DEFAULT_GRANDFATHER_MIN_TENURE_DAYS),
            default_grace_period: time::Duration::days(DEFAULT_GRACE_PERIOD_DAYS),
            risk_table: RiskTable::default(),
            notification_webhook_url: None,
            notification_webhook_token: None,
        }
    }
}

impl EngineConfig {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self, ConfigError> {
        let risk_table = match env::var("RISK_THRESHOLDS") {
            Ok(raw) if !raw.trim().is_empty() => {
                RiskTable::parse(&raw).map_err(|reason| ConfigError::Invalid {
                    var: "RISK_THRESHOLDS",
                    reason,
                })?
            }
            _ => RiskTable::default(),
        };

        Ok(Self {
            database_url: env::var("DATABASE_URL").ok().filter(|v| !v.is_empty()),
            database_max_connections: parse_var("DATABASE_MAX_CONNECTIONS", 5u32)?,

            analysis_shard_count: positive("ANALYSIS_SHARD_COUNT", DEFAULT_SHARD_COUNT)?,
            analysis_page_size: positive("ANALYSIS_PAGE_SIZE", DEFAULT_PAGE_SIZE)?,
            price_increase_tolerance_pct: parse_var(
                "PRICE_INCREASE_TOLERANCE_PCT",
                Decimal::from(DEFAULT_PRICE_INCREASE_TOLERANCE_PCT),
            )?,
            grandfather_min_tenure: time::Duration::days(parse_var(
                "GRANDFATHER_MIN_TENURE_DAYS",
                DEFAULT_GRANDFATHER_MIN_TENURE_DAYS,
            )?),

            default_grace_period: time::Duration::days(parse_var(
                "DEFAULT_GRACE_PERIOD_DAYS",
                DEFAULT_GRACE_PERIOD_DAYS,
            )?),

            risk_table,

            notification_webhook_url: env::var("NOTIFICATION_WEBHOOK_URL")
                .ok()
                .filter(|v| !v.is_empty()),
            notification_webhook_token: env::var("NOTIFICATION_WEBHOOK_TOKEN")
                .ok()
                .filter(|v| !v.is_empty()),
        })
    }

    /// Load a `.env` file when present, then read the environment
    pub fn load() -> Result<Self, ConfigError> {
        if let Err(e) = dotenvy::dotenv() {
            if !e.not_found() {
                return Err(ConfigError::Invalid {
                    var: ".env",
                    reason: e.to_string(),
                });
            }
        }
        Self::from_env()
    }

    /// Postgres URL, required when the ledger runs on Postgres
    pub fn require_database_url(&self) -> Result<&str, ConfigError> {
        self.database_url
            .as_deref()
            .ok_or(ConfigError::Missing("DATABASE_URL"))
    }
}

fn parse_var<T: std::str::FromStr>(var: &'static str, default: T) -> Result<T, ConfigError> {
    match env::var(var) {
        Ok(raw) if !raw.trim().is_empty() => raw.trim().parse().map_err(|_| ConfigError::Invalid {
            var,
            reason: format!("could not parse '{}'", raw),
        }),
        _ => Ok(default),
    }
}

fn positive(var: &'static str, default: usize) -> Result<usize, ConfigError> {
    let value = parse_var(var, default)?;
    if value == 0 {
        return Err(ConfigError::Invalid {
            var,
            reason: "must be at least 1".to_string(),
        });
    }
    Ok(value)
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    Missing(&'static str),
    #[error("Invalid value for {var}: {reason}")]
    Invalid { var: &'static str, reason: String },
}
