//! Product catalog routes

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    Json,
};
use coachpay_billing::{NewProduct, Product};
use coachpay_shared::SubscriberKind;
use serde::Deserialize;
use uuid::Uuid;

use crate::{error::ApiResult, state::AppState};

#[derive(Debug, Deserialize)]
pub struct ProductQuery {
    #[serde(default)]
    pub kind: Option<SubscriberKind>,
    #[serde(default)]
    pub include_inactive: bool,
}

pub async fn list_products(
    State(state): State<AppState>,
    Query(query): Query<ProductQuery>,
) -> ApiResult<Json<Vec<Product>>> {
    let products = state
        .billing
        .catalog
        .list(query.kind, !query.include_inactive)
        .await?;
    Ok(Json(products))
}

pub async fn get_product(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<Product>> {
    Ok(Json(state.billing.catalog.get(id).await?))
}

/// Admin: add a product to the catalog
pub async fn create_product(
    State(state): State<AppState>,
    Json(req): Json<NewProduct>,
) -> ApiResult<(StatusCode, Json<Product>)> {
    let product = state.billing.catalog.create_product(req).await?;
    tracing::info!(product_id = %product.id, name = %product.name, "Product created");
    Ok((StatusCode::CREATED, Json(product)))
}
