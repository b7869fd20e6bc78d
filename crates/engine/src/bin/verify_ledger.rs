//! Change Ledger Consistency Verification
//!
//! Scans the Postgres change ledger for sequence gaps and counter drift.
//!
//! ## Usage
//! ```bash
//! cargo run -p planguard-engine --bin verify_ledger
//! ```
//!
//! ## Environment Variables
//! - DATABASE_URL: PostgreSQL connection string
//! - LOG_FORMAT: `json` for JSON log lines
//!
//! Exits non-zero when any issue is found.

use std::error::Error;
use std::process::ExitCode;

use planguard_engine::ledger::{connect, verify_consistency};
use planguard_engine::{init_tracing, EngineConfig, TelemetryConfig};

#[tokio::main]
async fn main() -> Result<ExitCode, Box<dyn Error>> {
    let config = EngineConfig::load()?;
    init_tracing(&TelemetryConfig::from_env());

    let pool = connect(&config).await?;
    let issues = verify_consistency(&pool).await?;

    if issues.is_empty() {
        tracing::info!("Change ledger is consistent");
        return Ok(ExitCode::SUCCESS);
    }

    for issue in &issues {
        tracing::warn!(plan_id = %issue.plan_id, issue = %issue.issue, "Ledger inconsistency");
    }
    tracing::error!(count = issues.len(), "Change ledger has inconsistencies");
    Ok(ExitCode::FAILURE)
}
