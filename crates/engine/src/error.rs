//! Engine error types

use planguard_shared::DomainError;
use thiserror::Error;
use time::OffsetDateTime;

use crate::classifier::RiskLevel;
use crate::migration::MigrationStatus;

/// Errors surfaced by the impact and migration engine
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Invalid plan mutation: {0}")]
    InvalidMutation(String),

    #[error("Risk level {level} ({affected_count} subscriptions affected) requires an explicit override")]
    RiskOverrideRequired {
        level: RiskLevel,
        affected_count: u64,
    },

    #[error("Analysis aborted: deadline exceeded")]
    DeadlineExceeded,

    #[error("Analysis cancelled by caller")]
    Cancelled,

    #[error("Storage unavailable: {0}")]
    StorageUnavailable(String),

    #[error("Rollback unavailable for migration in status {status}")]
    RollbackUnavailable { status: MigrationStatus },

    #[error("Cannot {action} a migration in status {from}")]
    InvalidTransition {
        from: MigrationStatus,
        action: &'static str,
    },

    #[error("Grace period still running until {ends_at}")]
    GracePeriodActive { ends_at: OffsetDateTime },

    #[error("Verification failed: {0}")]
    VerificationFailed(String),

    #[error("Concurrent modification detected: {0}")]
    ConcurrentModification(String),
}

impl EngineError {
    /// Whether a caller-side retry may succeed without changing the request
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            EngineError::StorageUnavailable(_)
                | EngineError::ConcurrentModification(_)
                | EngineError::GracePeriodActive { .. }
                | EngineError::VerificationFailed(_)
        )
    }
}

impl From<sqlx::Error> for EngineError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::RowNotFound => EngineError::NotFound("row not found".to_string()),
            other => EngineError::StorageUnavailable(other.to_string()),
        }
    }
}

impl From<sqlx::migrate::MigrateError> for EngineError {
    fn from(err: sqlx::migrate::MigrateError) -> Self {
        EngineError::StorageUnavailable(err.to_string())
    }
}

impl From<serde_json::Error> for EngineError {
    fn from(err: serde_json::Error) -> Self {
        EngineError::StorageUnavailable(format!("corrupt ledger payload: {}", err))
    }
}

impl From<DomainError> for EngineError {
    fn from(err: DomainError) -> Self {
        EngineError::InvalidMutation(err.to_string())
    }
}

pub type EngineResult<T> = Result<T, EngineError>;
