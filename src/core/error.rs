//! Centralized error types for the portfolio core
//!
//! The variants mirror the error taxonomy the whole system is designed
//! around: transient infra failures are retried by the caller, data
//! integrity problems are logged and normalized, policy violations and
//! authorization failures are surfaced explicitly, and fatal errors
//! abort startup.

use thiserror::Error;

/// Top-level error type for the portfolio core.
#[derive(Error, Debug)]
pub enum CoreError {
    /// Class 1 — cache unreachable, upstream stream disconnect, broker 5xx/timeout.
    #[error("transient infrastructure error: {0}")]
    Transient(String),

    /// Class 2 — malformed quote, zero-quantity position, sentinel P&L.
    #[error("data integrity error: {0}")]
    DataIntegrity(String),

    /// Class 3 — a computed value was rejected by a plausibility check.
    #[error("policy violation: {0}")]
    PolicyViolation(String),

    /// Class 4 — missing/invalid/expired token, or account not owned by caller.
    #[error("authorization error: {0}")]
    Authorization(String),

    /// Class 6 — rate limiter denied the action (fail-closed also lands here).
    #[error("rate limited: {0}")]
    RateLimited(String),

    /// Class 7 — unrecoverable configuration or startup failure.
    #[error("fatal error: {0}")]
    Fatal(String),

    #[error("account not found: {0}")]
    AccountNotFound(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

pub type CoreResult<T> = Result<T, CoreError>;

impl From<sqlx::Error> for CoreError {
    fn from(err: sqlx::Error) -> Self {
        CoreError::Transient(format!("database: {err}"))
    }
}

impl From<redis::RedisError> for CoreError {
    fn from(err: redis::RedisError) -> Self {
        CoreError::Transient(format!("cache: {err}"))
    }
}

impl From<serde_json::Error> for CoreError {
    fn from(err: serde_json::Error) -> Self {
        CoreError::DataIntegrity(format!("serialization: {err}"))
    }
}

impl From<reqwest::Error> for CoreError {
    fn from(err: reqwest::Error) -> Self {
        CoreError::Transient(format!("broker api: {err}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_includes_class_context() {
        let err = CoreError::PolicyViolation("daily return exceeds 10%".into());
        assert_eq!(err.to_string(), "policy violation: daily return exceeds 10%");
    }
}
