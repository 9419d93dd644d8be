//! Platform admin routes
//!
//! Guarded by a static bearer token (`ADMIN_API_TOKEN`). Without a
//! configured token every admin route answers 403.

use axum::{
    extract::{Request, State},
    http::header,
    middleware::Next,
    response::Response,
    Json,
};
use coachpay_billing::{InvariantReport, SweepReport};
use subtle::ConstantTimeEq;

use crate::{
    error::{ApiError, ApiResult},
    state::AppState,
};

/// Reject requests without the admin bearer token
pub async fn require_admin(
    State(state): State<AppState>,
    request: Request,
    next: Next,
) -> Result<Response, ApiError> {
    let expected = state
        .config
        .admin_api_token
        .as_deref()
        .ok_or(ApiError::Forbidden)?;
    let provided = request
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|h| h.to_str().ok())
        .and_then(|h| h.strip_prefix("Bearer "))
        .ok_or(ApiError::Forbidden)?;

    if !bool::from(provided.as_bytes().ct_eq(expected.as_bytes())) {
        tracing::warn!("Admin request with invalid token");
        return Err(ApiError::Forbidden);
    }
    Ok(next.run(request).await)
}

/// Run the billing invariants over stored data
pub async fn check_invariants(State(state): State<AppState>) -> ApiResult<Json<InvariantReport>> {
    Ok(Json(state.billing.invariants.run().await?))
}

/// Run one renewal sweep now instead of waiting for the worker
pub async fn run_renewal_sweep(State(state): State<AppState>) -> ApiResult<Json<SweepReport>> {
    tracing::info!("Manual renewal sweep requested");
    Ok(Json(state.billing.renewals.run_sweep().await?))
}
