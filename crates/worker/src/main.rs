//! CoachPay Background Worker
//!
//! Handles scheduled jobs:
//! - Renewal sweep: due renewals, dunning retries, ended subscriptions and
//!   stale pending payments (every 5 minutes by default)
//! - Billing invariants check (daily at 03:30 UTC by default)
//! - Heartbeat (every 5 minutes)

use std::sync::Arc;
use std::time::Duration;

use coachpay_billing::BillingService;
use coachpay_shared::{create_pool, run_migrations};
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{error, info, warn};

const DEFAULT_SWEEP_CRON: &str = "0 */5 * * * *";
const DEFAULT_INVARIANTS_CRON: &str = "0 30 3 * * *";

/// Job schedules, six-field cron (seconds first)
#[derive(Debug, Clone, PartialEq, Eq)]
struct Schedules {
    sweep: String,
    invariants: String,
}

impl Schedules {
    fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let read = |key: &str, default: &str| {
            lookup(key)
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
                .unwrap_or_else(|| default.to_string())
        };
        Self {
            sweep: read("RENEWAL_SWEEP_CRON", DEFAULT_SWEEP_CRON),
            invariants: read("INVARIANTS_CRON", DEFAULT_INVARIANTS_CRON),
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    // Load environment
    dotenvy::dotenv().ok();

    info!("Starting CoachPay Worker");

    let database_url = std::env::var("DATABASE_URL")
        .map_err(|_| anyhow::anyhow!("DATABASE_URL must be set"))?;
    let pool = create_pool(&database_url, 5).await?;
    run_migrations(&pool).await?;
    info!("Database ready");

    let billing = Arc::new(BillingService::from_env(pool)?);
    let schedules = Schedules::from_env();

    let scheduler = JobScheduler::new().await?;

    // Job 1: Renewal sweep
    let sweep_billing = billing.clone();
    scheduler
        .add(Job::new_async(schedules.sweep.as_str(), move |_uuid, _l| {
            let billing = sweep_billing.clone();
            Box::pin(async move {
                match billing.renewals.run_sweep().await {
                    Ok(report) if report.errors > 0 || report.stale > 0 => {
                        warn!(
                            errors = report.errors,
                            stale = report.stale,
                            "Renewal sweep finished with rows needing attention"
                        );
                    }
                    Ok(_) => {}
                    Err(e) => error!(error = %e, "Renewal sweep failed"),
                }
            })
        })?)
        .await?;
    info!(cron = %schedules.sweep, "Scheduled: Renewal sweep");

    // Job 2: Billing invariants
    let invariant_billing = billing.clone();
    scheduler
        .add(Job::new_async(schedules.invariants.as_str(), move |_uuid, _l| {
            let billing = invariant_billing.clone();
            Box::pin(async move {
                info!("Running billing invariants check");
                match billing.invariants.run().await {
                    Ok(report) if !report.is_clean() => {
                        error!(
                            violations = report.violations.len(),
                            "Billing invariants violated"
                        );
                    }
                    Ok(_) => {}
                    Err(e) => error!(error = %e, "Billing invariants check failed"),
                }
            })
        })?)
        .await?;
    info!(cron = %schedules.invariants, "Scheduled: Billing invariants check");

    // Job 3: Heartbeat
    scheduler
        .add(Job::new_async("0 */5 * * * *", |_uuid, _l| {
            Box::pin(async move {
                info!("Worker heartbeat");
            })
        })?)
        .await?;

    info!("Starting job scheduler");
    scheduler.start().await?;
    info!("CoachPay Worker started with 3 scheduled jobs");

    // The scheduler runs jobs in background tasks
    loop {
        tokio::time::sleep(Duration::from_secs(3600)).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_schedules_default_when_unset_or_blank() {
        let schedules = Schedules::from_lookup(|key| match key {
            "INVARIANTS_CRON" => Some("  ".to_string()),
            _ => None,
        });
        assert_eq!(schedules.sweep, DEFAULT_SWEEP_CRON);
        assert_eq!(schedules.invariants, DEFAULT_INVARIANTS_CRON);
    }

    #[test]
    fn test_schedules_read_overrides() {
        let schedules = Schedules::from_lookup(|key| match key {
            "RENEWAL_SWEEP_CRON" => Some("0 * * * * *".to_string()),
            _ => None,
        });
        assert_eq!(schedules.sweep, "0 * * * * *");
    }
}
