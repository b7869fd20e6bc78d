//! Error types for PlanGuard value validation

use rust_decimal::Decimal;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DomainError {
    #[error("Invalid currency code: {0}")]
    InvalidCurrency(String),

    #[error("Price amount must not be negative: {0}")]
    NegativeAmount(Decimal),

    #[error("Unknown billing interval: {0}")]
    UnknownInterval(String),

    #[error("Unknown plan state: {0}")]
    UnknownPlanState(String),

    #[error("Unknown billing state: {0}")]
    UnknownBillingState(String),

    #[error("Limit {name} must not be negative (got {value})")]
    NegativeLimit { name: String, value: i64 },
}

pub type DomainResult<T> = Result<T, DomainError>;
