//! Usage and entitlement routes

use axum::{
    extract::{Path, Query, State},
    Json,
};
use coachpay_billing::{Entitlement, LimitCheck};
use coachpay_shared::SubscriberKind;
use serde::Deserialize;
use uuid::Uuid;

use crate::{
    error::{ApiError, ApiResult},
    state::AppState,
};

/// Identifies whose subscription to look at
#[derive(Debug, Deserialize)]
pub struct SubscriberQuery {
    pub kind: SubscriberKind,
    pub subscriber_id: Uuid,
    #[serde(default)]
    pub payee_id: Option<Uuid>,
}

#[derive(Debug, Deserialize)]
pub struct CapabilityQuery {
    pub capability: String,
}

#[derive(Debug, Deserialize)]
pub struct IncrementUsageRequest {
    pub capability: String,
    #[serde(default = "default_amount")]
    pub amount: i64,
}

fn default_amount() -> i64 {
    1
}

/// What the subscriber may do right now
pub async fn get_entitlement(
    State(state): State<AppState>,
    Query(query): Query<SubscriberQuery>,
) -> ApiResult<Json<Entitlement>> {
    let entitlement = state
        .billing
        .entitlements
        .compute(query.kind, query.subscriber_id, query.payee_id)
        .await?;
    Ok(Json(entitlement))
}

/// Limit check by subscriber. A subscriber without a subscription gets a
/// denied check, never an error.
pub async fn check_subscriber_usage(
    State(state): State<AppState>,
    Query(query): Query<SubscriberQuery>,
    Query(capability): Query<CapabilityQuery>,
) -> ApiResult<Json<LimitCheck>> {
    let check = state
        .billing
        .usage
        .check_for_subscriber(
            query.kind,
            query.subscriber_id,
            query.payee_id,
            &capability.capability,
        )
        .await;
    Ok(Json(check))
}

pub async fn check_usage(
    State(state): State<AppState>,
    Path((id, capability)): Path<(Uuid, String)>,
) -> ApiResult<Json<LimitCheck>> {
    Ok(Json(state.billing.usage.check(id, &capability).await?))
}

pub async fn increment_usage(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Json(req): Json<IncrementUsageRequest>,
) -> ApiResult<Json<LimitCheck>> {
    if req.capability.trim().is_empty() {
        return Err(ApiError::BadRequest("capability is required".to_string()));
    }
    Ok(Json(
        state
            .billing
            .usage
            .increment(id, &req.capability, req.amount)
            .await?,
    ))
}
