//! CoachPay API Server
//!
//! HTTP front for the billing core. Periodic work (renewal sweeps,
//! invariant checks) runs in `coachpay-worker`.

use std::net::SocketAddr;

use axum::http::{header, HeaderValue, Method};
use coachpay_api::{create_router, AppState, Config};
use coachpay_billing::BillingService;
use coachpay_shared::{create_pool, run_migrations};
use tower_http::{
    compression::CompressionLayer,
    cors::{AllowOrigin, CorsLayer},
    trace::TraceLayer,
};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env file if present
    dotenvy::dotenv().ok();

    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,coachpay_api=debug,coachpay_billing=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("Starting CoachPay API Server v{}", env!("CARGO_PKG_VERSION"));

    let config = Config::from_env()?;
    tracing::info!("Configuration loaded");

    tracing::info!("Connecting to database...");
    let pool = create_pool(&config.database_url, config.database_max_connections).await?;
    tracing::info!("Database connection established");

    if config.run_migrations {
        tracing::info!("Running database migrations...");
        run_migrations(&pool).await?;
    }

    let billing = BillingService::from_env(pool.clone())?;
    if config.admin_api_token.is_none() {
        tracing::warn!("ADMIN_API_TOKEN not set, admin routes disabled");
    }

    let allowed_origins: Vec<HeaderValue> = config
        .allowed_origins
        .iter()
        .filter_map(|s| s.parse().ok())
        .collect();
    tracing::info!(
        allowed_origins = ?allowed_origins,
        "CORS configured with {} allowed origins",
        allowed_origins.len()
    );

    let cors = CorsLayer::new()
        .allow_origin(AllowOrigin::list(allowed_origins))
        .allow_methods([
            Method::GET,
            Method::POST,
            Method::PATCH,
            Method::OPTIONS,
        ])
        .allow_headers([header::AUTHORIZATION, header::CONTENT_TYPE, header::ACCEPT])
        .expose_headers([header::CONTENT_TYPE]);

    let addr: SocketAddr = config.bind_address.parse()?;
    let state = AppState::new(config, billing, Some(pool));

    let app = create_router(state)
        .layer(cors)
        .layer(CompressionLayer::new())
        .layer(TraceLayer::new_for_http());

    tracing::info!("Starting server on {}", addr);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}
