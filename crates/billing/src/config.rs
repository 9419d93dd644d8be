//! Billing configuration

use time::Duration;

use crate::error::{BillingError, BillingResult};
use crate::fees::FeeSchedule;
use crate::plans::PlanSettings;
use crate::providers::retry::RetryPolicy;

/// Renewal failure handling
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DunningPolicy {
    /// Delay before retry N (1-based); the last entry repeats
    pub retry_delays: Vec<Duration>,
    /// Failed attempts after which the subscription is cancelled
    pub max_attempts: u32,
}

impl Default for DunningPolicy {
    fn default() -> Self {
        Self {
            retry_delays: vec![Duration::days(1), Duration::days(3), Duration::days(5)],
            max_attempts: 3,
        }
    }
}

impl DunningPolicy {
    /// Delay after the given number of failed attempts
    pub fn delay_after(&self, failed_attempts: u32) -> Duration {
        let idx = failed_attempts.saturating_sub(1) as usize;
        self.retry_delays
            .get(idx)
            .or_else(|| self.retry_delays.last())
            .copied()
            .unwrap_or(Duration::days(1))
    }
}

/// Renewal sweep tuning
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SweepConfig {
    /// Due rows older than this are not billed automatically
    pub lookback: Duration,
    /// Rows claimed per sweep
    pub batch_size: i64,
    /// Renewals processed concurrently
    pub concurrency: usize,
    /// How long a claim keeps other sweeps away from a row
    pub claim_ttl: Duration,
}

impl Default for SweepConfig {
    fn default() -> Self {
        Self {
            lookback: Duration::days(7),
            batch_size: 200,
            concurrency: 8,
            claim_ttl: Duration::minutes(10),
        }
    }
}

/// Top-level billing configuration
#[derive(Debug, Clone)]
pub struct BillingConfig {
    /// Lifetime of a pending payment before the sweep expires it
    pub payment_expiry: Duration,
    /// Access after cancellation when no paid period is known
    pub cancellation_grace: Duration,
    pub fees: FeeSchedule,
    pub dunning: DunningPolicy,
    pub sweep: SweepConfig,
    pub plans: PlanSettings,
    pub provider_retry: RetryPolicy,
    /// Default ISO currency for new products and subscriptions
    pub default_currency: String,
}

impl Default for BillingConfig {
    fn default() -> Self {
        Self {
            payment_expiry: Duration::minutes(15),
            cancellation_grace: Duration::ZERO,
            fees: FeeSchedule::default(),
            dunning: DunningPolicy::default(),
            sweep: SweepConfig::default(),
            plans: PlanSettings::default(),
            provider_retry: RetryPolicy::default(),
            default_currency: "USD".to_string(),
        }
    }
}

impl BillingConfig {
    /// Create config from environment variables
    pub fn from_env() -> BillingResult<Self> {
        let d = Self::default();

        let retry_delays = match std::env::var("DUNNING_RETRY_DAYS") {
            Ok(raw) => parse_day_list(&raw)?,
            Err(_) => d.dunning.retry_delays.clone(),
        };

        Ok(Self {
            payment_expiry: Duration::minutes(env_parse(
                "PAYMENT_EXPIRY_MINUTES",
                d.payment_expiry.whole_minutes(),
            )?),
            cancellation_grace: Duration::hours(env_parse(
                "CANCELLATION_GRACE_HOURS",
                d.cancellation_grace.whole_hours(),
            )?),
            fees: FeeSchedule::from_env()?,
            dunning: DunningPolicy {
                retry_delays,
                max_attempts: env_parse("MAX_RENEWAL_ATTEMPTS", d.dunning.max_attempts)?,
            },
            sweep: SweepConfig {
                lookback: Duration::days(env_parse(
                    "RENEWAL_LOOKBACK_DAYS",
                    d.sweep.lookback.whole_days(),
                )?),
                batch_size: env_parse("RENEWAL_BATCH_SIZE", d.sweep.batch_size)?,
                concurrency: env_parse("RENEWAL_CONCURRENCY", d.sweep.concurrency)?,
                claim_ttl: Duration::minutes(env_parse(
                    "RENEWAL_CLAIM_TTL_MINUTES",
                    d.sweep.claim_ttl.whole_minutes(),
                )?),
            },
            plans: PlanSettings::from_env()?,
            provider_retry: RetryPolicy::from_env()?,
            default_currency: std::env::var("DEFAULT_CURRENCY")
                .unwrap_or(d.default_currency)
                .to_uppercase(),
        })
    }
}

pub(crate) fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> BillingResult<T> {
    match std::env::var(key) {
        Ok(raw) => raw
            .trim()
            .parse()
            .map_err(|_| BillingError::Config(format!("Invalid value for {}: {:?}", key, raw))),
        Err(_) => Ok(default),
    }
}

fn parse_day_list(raw: &str) -> BillingResult<Vec<Duration>> {
    let days = raw
        .split(',')
        .map(|s| s.trim().parse::<i64>().map(Duration::days))
        .collect::<Result<Vec<_>, _>>()
        .map_err(|_| BillingError::Config(format!("Invalid DUNNING_RETRY_DAYS: {:?}", raw)))?;
    if days.is_empty() {
        return Err(BillingError::Config("DUNNING_RETRY_DAYS is empty".into()));
    }
    Ok(days)
}
