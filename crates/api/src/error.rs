//! API error types and handling

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use coachpay_billing::BillingError;
use serde_json::json;

/// Application error type
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("Insufficient permissions")]
    Forbidden,

    // Validation errors
    #[error("Invalid request: {0}")]
    BadRequest(String),

    // Resource errors
    #[error("{0}")]
    NotFound(String),
    #[error("{0}")]
    Conflict(String),

    // Billing errors
    #[error("{0}")]
    PaymentRequired(String),
    #[error("{0}")]
    UsageLimitExceeded(String),
    #[error("Payment provider unavailable: {0}")]
    ProviderUnavailable(String),

    // Internal errors
    #[error("Database error: {0}")]
    Database(String),
    #[error("Internal server error")]
    Internal,
}

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match self {
            ApiError::Forbidden => StatusCode::FORBIDDEN,
            ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::NotFound(_) => StatusCode::NOT_FOUND,
            ApiError::Conflict(_) => StatusCode::CONFLICT,
            ApiError::PaymentRequired(_) | ApiError::UsageLimitExceeded(_) => {
                StatusCode::PAYMENT_REQUIRED
            }
            ApiError::ProviderUnavailable(_) => StatusCode::BAD_GATEWAY,
            ApiError::Database(_) | ApiError::Internal => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn code(&self) -> &'static str {
        match self {
            ApiError::Forbidden => "FORBIDDEN",
            ApiError::BadRequest(_) => "BAD_REQUEST",
            ApiError::NotFound(_) => "NOT_FOUND",
            ApiError::Conflict(_) => "CONFLICT",
            ApiError::PaymentRequired(_) => "PAYMENT_REQUIRED",
            ApiError::UsageLimitExceeded(_) => "USAGE_LIMIT_EXCEEDED",
            ApiError::ProviderUnavailable(_) => "PROVIDER_UNAVAILABLE",
            ApiError::Database(_) => "DATABASE_ERROR",
            ApiError::Internal => "INTERNAL_ERROR",
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let message = match &self {
            // Never leak driver messages
            ApiError::Database(_) => "Database error".to_string(),
            other => other.to_string(),
        };

        let body = Json(json!({
            "error": {
                "code": self.code(),
                "message": message,
            }
        }));

        (self.status(), body).into_response()
    }
}

impl From<BillingError> for ApiError {
    fn from(err: BillingError) -> Self {
        match err {
            BillingError::NotFound(what) => ApiError::NotFound(format!("Not found: {}", what)),
            BillingError::InvalidInput(msg) => ApiError::BadRequest(msg),
            e @ (BillingError::AlreadyExists(_)
            | BillingError::Conflict(_)
            | BillingError::InvalidTransition { .. }
            | BillingError::ConcurrentModification(_)) => ApiError::Conflict(e.to_string()),
            e @ BillingError::ValidationFailed(_) => ApiError::PaymentRequired(e.to_string()),
            e @ BillingError::LimitExceeded { .. } => ApiError::UsageLimitExceeded(e.to_string()),
            BillingError::TransientProvider(msg) => ApiError::ProviderUnavailable(msg),
            BillingError::Database(msg) => {
                tracing::error!(error = %msg, "Database error");
                ApiError::Database(msg)
            }
            e @ (BillingError::Config(_) | BillingError::Internal(_)) => {
                tracing::error!(error = %e, "Billing internal error");
                ApiError::Internal
            }
        }
    }
}

impl From<sqlx::Error> for ApiError {
    fn from(err: sqlx::Error) -> Self {
        tracing::error!("Database error: {:?}", err);
        ApiError::Database(err.to_string())
    }
}

/// Result type alias for API handlers
pub type ApiResult<T> = Result<T, ApiError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_billing_errors_map_to_statuses() {
        let cases = [
            (BillingError::NotFound("payment x".into()), StatusCode::NOT_FOUND),
            (BillingError::InvalidInput("bad".into()), StatusCode::BAD_REQUEST),
            (BillingError::Conflict("twice".into()), StatusCode::CONFLICT),
            (
                BillingError::InvalidTransition {
                    from: "expired".into(),
                    to: "active".into(),
                },
                StatusCode::CONFLICT,
            ),
            (
                BillingError::ValidationFailed("receipt".into()),
                StatusCode::PAYMENT_REQUIRED,
            ),
            (
                BillingError::LimitExceeded {
                    capability: "sessions".into(),
                    used: 4,
                    limit: 4,
                },
                StatusCode::PAYMENT_REQUIRED,
            ),
            (
                BillingError::TransientProvider("timeout".into()),
                StatusCode::BAD_GATEWAY,
            ),
            (
                BillingError::Internal("boom".into()),
                StatusCode::INTERNAL_SERVER_ERROR,
            ),
        ];
        for (err, status) in cases {
            assert_eq!(ApiError::from(err).status(), status);
        }
    }

    #[test]
    fn test_database_message_is_hidden() {
        let response = ApiError::Database("relation payments does not exist".into()).into_response();
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    }
}
