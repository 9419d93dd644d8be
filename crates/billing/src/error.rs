//! Billing error types

use coachpay_shared::PlatformError;
use thiserror::Error;

/// Billing-specific errors
#[derive(Debug, Error)]
pub enum BillingError {
    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Resource already exists: {0}")]
    AlreadyExists(String),

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Invalid transition from {from} to {to}")]
    InvalidTransition { from: String, to: String },

    #[error("Concurrent modification detected: {0}")]
    ConcurrentModification(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Payment validation failed: {0}")]
    ValidationFailed(String),

    #[error("Payment provider temporarily unavailable: {0}")]
    TransientProvider(String),

    #[error("Usage limit exceeded for {capability}: used {used} of {limit}")]
    LimitExceeded {
        capability: String,
        used: i64,
        limit: i64,
    },

    #[error("Database error: {0}")]
    Database(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl BillingError {
    /// Whether retrying the same operation may succeed
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            BillingError::TransientProvider(_)
                | BillingError::ConcurrentModification(_)
                | BillingError::Database(_)
        )
    }

    /// Stable machine-readable code used in API responses and logs
    pub fn code(&self) -> &'static str {
        match self {
            BillingError::NotFound(_) => "not_found",
            BillingError::AlreadyExists(_) => "already_exists",
            BillingError::Conflict(_) => "conflict",
            BillingError::InvalidTransition { .. } => "invalid_transition",
            BillingError::ConcurrentModification(_) => "concurrent_modification",
            BillingError::InvalidInput(_) => "invalid_input",
            BillingError::ValidationFailed(_) => "validation_failed",
            BillingError::TransientProvider(_) => "provider_unavailable",
            BillingError::LimitExceeded { .. } => "limit_exceeded",
            BillingError::Database(_) => "database_error",
            BillingError::Config(_) => "config_error",
            BillingError::Internal(_) => "internal_error",
        }
    }
}

impl From<sqlx::Error> for BillingError {
    fn from(err: sqlx::Error) -> Self {
        if let sqlx::Error::Database(db_err) = &err {
            // unique_violation
            if db_err.code().as_deref() == Some("23505") {
                return BillingError::AlreadyExists(db_err.message().to_string());
            }
        }
        BillingError::Database(err.to_string())
    }
}

impl From<PlatformError> for BillingError {
    fn from(err: PlatformError) -> Self {
        match err {
            PlatformError::Validation(msg) => BillingError::InvalidInput(msg),
            PlatformError::DateOutOfRange(msg) => BillingError::Internal(msg),
        }
    }
}

impl From<serde_json::Error> for BillingError {
    fn from(err: serde_json::Error) -> Self {
        BillingError::Internal(format!("JSON error: {}", err))
    }
}

pub type BillingResult<T> = Result<T, BillingError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_classification() {
        assert!(BillingError::TransientProvider("timeout".into()).is_retryable());
        assert!(BillingError::ConcurrentModification("sub".into()).is_retryable());
        assert!(!BillingError::Conflict("already cancelled".into()).is_retryable());
        assert!(!BillingError::ValidationFailed("bad receipt".into()).is_retryable());
    }

    #[test]
    fn test_platform_error_maps_to_invalid_input() {
        let err: BillingError = PlatformError::Validation("Invalid plan: gold".into()).into();
        assert_eq!(err.code(), "invalid_input");
    }
}
