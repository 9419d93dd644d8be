//! Payment routes
//!
//! `submit` is the one-shot path clients use after a purchase: it records
//! the payment, validates it with the provider and activates the
//! subscription it pays for. Re-submitting the same purchase returns the
//! original payment.

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    Json,
};
use coachpay_billing::{CallbackOutcome, NewPayment, Payment, PaymentFilter, PaymentOutcome};
use coachpay_shared::{PaginatedResponse, Pagination};
use serde::Deserialize;
use uuid::Uuid;

use crate::{error::ApiResult, state::AppState};

#[derive(Debug, Deserialize)]
pub struct CancelPaymentRequest {
    #[serde(default)]
    pub reason: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct RefundRequest {
    /// Defaults to the full amount
    #[serde(default)]
    pub amount_cents: Option<i64>,
    #[serde(default)]
    pub reason: Option<String>,
}

/// Record a pending payment without validating it
pub async fn create_payment(
    State(state): State<AppState>,
    Json(req): Json<NewPayment>,
) -> ApiResult<(StatusCode, Json<Payment>)> {
    let payment = state.billing.create_payment(req).await?;
    Ok((StatusCode::CREATED, Json(payment)))
}

/// Record, validate and settle a purchase in one call
pub async fn submit_payment(
    State(state): State<AppState>,
    Json(req): Json<NewPayment>,
) -> ApiResult<Json<PaymentOutcome>> {
    let outcome = state.billing.submit_payment(req).await?;
    tracing::info!(
        payment_id = %outcome.payment.id,
        status = %outcome.payment.status,
        subscription_id = ?outcome.subscription.as_ref().map(|s| s.id),
        "Payment submitted"
    );
    Ok(Json(outcome))
}

pub async fn validate_payment(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<PaymentOutcome>> {
    Ok(Json(state.billing.validate_payment(id).await?))
}

/// Asynchronous provider report (card or PayPal confirmation). The body only
/// triggers a fresh check with the provider.
pub async fn provider_callback(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Json(outcome): Json<CallbackOutcome>,
) -> ApiResult<Json<PaymentOutcome>> {
    Ok(Json(state.billing.provider_callback(id, outcome).await?))
}

pub async fn cancel_payment(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Json(req): Json<CancelPaymentRequest>,
) -> ApiResult<Json<Payment>> {
    Ok(Json(state.billing.ledger.cancel(id, req.reason).await?))
}

pub async fn refund_payment(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Json(req): Json<RefundRequest>,
) -> ApiResult<Json<Payment>> {
    Ok(Json(
        state
            .billing
            .ledger
            .refund(id, req.amount_cents, req.reason)
            .await?,
    ))
}

pub async fn get_payment(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<Payment>> {
    Ok(Json(state.billing.ledger.get(id).await?))
}

pub async fn list_payments(
    State(state): State<AppState>,
    Query(filter): Query<PaymentFilter>,
    Query(page): Query<Pagination>,
) -> ApiResult<Json<PaginatedResponse<Payment>>> {
    Ok(Json(state.billing.ledger.list(&filter, page).await?))
}
