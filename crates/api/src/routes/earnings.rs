//! Payee earnings routes

use axum::{
    extract::{Path, Query, State},
    Json,
};
use coachpay_billing::EarningsSummary;
use serde::Deserialize;
use time::{Duration, OffsetDateTime};
use uuid::Uuid;

use crate::{error::ApiResult, state::AppState};

/// Window defaults to the last 30 days
#[derive(Debug, Deserialize)]
pub struct EarningsQuery {
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub from: Option<OffsetDateTime>,
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub to: Option<OffsetDateTime>,
}

pub async fn get_earnings(
    State(state): State<AppState>,
    Path(payee_id): Path<Uuid>,
    Query(query): Query<EarningsQuery>,
) -> ApiResult<Json<EarningsSummary>> {
    let to = query.to.unwrap_or_else(OffsetDateTime::now_utc);
    let from = query.from.unwrap_or(to - Duration::days(30));
    Ok(Json(state.billing.earnings.summary(payee_id, from, to).await?))
}
