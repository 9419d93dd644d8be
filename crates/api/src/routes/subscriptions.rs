//! Subscription routes

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    Json,
};
use coachpay_billing::{
    CancelRequest, CustomPlan, NewSubscription, PlanChangeRequest, Subscription,
    SubscriptionFilter, SubscriptionUpdate,
};
use coachpay_shared::{PaginatedResponse, Pagination};
use uuid::Uuid;

use crate::{
    error::{ApiError, ApiResult},
    state::AppState,
};

/// Custom price, trial and commission terms are negotiated by the platform
fn reject_custom_terms(custom: Option<&CustomPlan>) -> ApiResult<()> {
    if custom.is_some() {
        tracing::warn!("Custom plan terms submitted on a public route");
        return Err(ApiError::Forbidden);
    }
    Ok(())
}

/// Start a subscription (trial or pending first payment)
pub async fn create_subscription(
    State(state): State<AppState>,
    Json(req): Json<NewSubscription>,
) -> ApiResult<(StatusCode, Json<Subscription>)> {
    reject_custom_terms(req.custom.as_ref())?;
    admin_create_subscription(State(state), Json(req)).await
}

/// Start a subscription, custom terms allowed (admin)
pub async fn admin_create_subscription(
    State(state): State<AppState>,
    Json(req): Json<NewSubscription>,
) -> ApiResult<(StatusCode, Json<Subscription>)> {
    let sub = state.billing.subscriptions.create(req).await?;
    tracing::info!(
        subscription_id = %sub.id,
        subscriber_id = %sub.subscriber_id,
        status = %sub.status,
        "Subscription created"
    );
    Ok((StatusCode::CREATED, Json(sub)))
}

pub async fn get_subscription(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<Subscription>> {
    Ok(Json(state.billing.subscriptions.get(id).await?))
}

pub async fn list_subscriptions(
    State(state): State<AppState>,
    Query(filter): Query<SubscriptionFilter>,
    Query(page): Query<Pagination>,
) -> ApiResult<Json<PaginatedResponse<Subscription>>> {
    Ok(Json(state.billing.subscriptions.list(&filter, page).await?))
}

/// Change auto-renew, payment method or store identifiers
pub async fn update_subscription(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Json(req): Json<SubscriptionUpdate>,
) -> ApiResult<Json<Subscription>> {
    Ok(Json(state.billing.subscriptions.update(id, req).await?))
}

pub async fn cancel_subscription(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Json(req): Json<CancelRequest>,
) -> ApiResult<Json<Subscription>> {
    Ok(Json(state.billing.subscriptions.cancel(id, req).await?))
}

pub async fn change_plan(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Json(req): Json<PlanChangeRequest>,
) -> ApiResult<Json<Subscription>> {
    reject_custom_terms(req.custom.as_ref())?;
    Ok(Json(state.billing.subscriptions.change_plan(id, req).await?))
}

/// Move to new terms, custom terms allowed (admin)
pub async fn admin_change_plan(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Json(req): Json<PlanChangeRequest>,
) -> ApiResult<Json<Subscription>> {
    Ok(Json(state.billing.subscriptions.change_plan(id, req).await?))
}

pub async fn reactivate_subscription(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<Subscription>> {
    Ok(Json(state.billing.subscriptions.reactivate(id).await?))
}

pub async fn pause_subscription(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<Subscription>> {
    Ok(Json(state.billing.subscriptions.pause(id).await?))
}

pub async fn resume_subscription(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<Subscription>> {
    Ok(Json(state.billing.subscriptions.resume(id).await?))
}
