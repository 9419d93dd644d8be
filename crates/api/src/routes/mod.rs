//! API routes

pub mod admin;
pub mod earnings;
pub mod health;
pub mod payments;
pub mod products;
pub mod subscriptions;
pub mod usage;

use axum::{
    middleware,
    routing::{get, post},
    Router,
};

use crate::state::AppState;

/// Create all API routes
pub fn create_router(state: AppState) -> Router {
    // Health check routes (at root level for infrastructure monitoring)
    let health_routes = Router::new()
        .route("/health", get(health::health))
        .route("/health/live", get(health::liveness))
        .route("/health/ready", get(health::readiness));

    let api_routes = Router::new()
        // Catalog
        .route("/products", get(products::list_products))
        .route("/products/:id", get(products::get_product))
        // Subscriptions
        .route(
            "/subscriptions",
            get(subscriptions::list_subscriptions).post(subscriptions::create_subscription),
        )
        .route(
            "/subscriptions/:id",
            get(subscriptions::get_subscription).patch(subscriptions::update_subscription),
        )
        .route("/subscriptions/:id/cancel", post(subscriptions::cancel_subscription))
        .route("/subscriptions/:id/change-plan", post(subscriptions::change_plan))
        .route(
            "/subscriptions/:id/reactivate",
            post(subscriptions::reactivate_subscription),
        )
        .route("/subscriptions/:id/pause", post(subscriptions::pause_subscription))
        .route("/subscriptions/:id/resume", post(subscriptions::resume_subscription))
        // Usage and entitlements
        .route("/subscriptions/:id/usage", post(usage::increment_usage))
        .route("/subscriptions/:id/usage/:capability", get(usage::check_usage))
        .route("/usage/check", get(usage::check_subscriber_usage))
        .route("/entitlements", get(usage::get_entitlement))
        // Payments
        .route(
            "/payments",
            get(payments::list_payments).post(payments::create_payment),
        )
        .route("/payments/submit", post(payments::submit_payment))
        .route("/payments/:id", get(payments::get_payment))
        .route("/payments/:id/validate", post(payments::validate_payment))
        .route("/payments/:id/callback", post(payments::provider_callback))
        .route("/payments/:id/cancel", post(payments::cancel_payment))
        .route("/payments/:id/refund", post(payments::refund_payment))
        // Earnings
        .route("/payees/:id/earnings", get(earnings::get_earnings));

    let admin_routes = Router::new()
        .route("/products", post(products::create_product))
        .route("/subscriptions", post(subscriptions::admin_create_subscription))
        .route(
            "/subscriptions/:id/change-plan",
            post(subscriptions::admin_change_plan),
        )
        .route("/billing/invariants", get(admin::check_invariants))
        .route("/billing/renewals/run", post(admin::run_renewal_sweep))
        .route_layer(middleware::from_fn_with_state(
            state.clone(),
            admin::require_admin,
        ));

    Router::new()
        .merge(health_routes)
        .nest("/api/v1", api_routes.nest("/admin", admin_routes))
        .with_state(state)
}
