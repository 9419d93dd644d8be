//! Application state

use std::sync::Arc;

use coachpay_billing::BillingService;
use sqlx::PgPool;

use crate::config::Config;

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub config: Config,
    pub billing: Arc<BillingService>,
    /// Absent when the billing core runs over in-memory stores
    pub pool: Option<PgPool>,
}

impl AppState {
    pub fn new(config: Config, billing: BillingService, pool: Option<PgPool>) -> Self {
        Self {
            config,
            billing: Arc::new(billing),
            pool,
        }
    }
}
