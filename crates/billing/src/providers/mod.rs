//! Payment rail adapters
//!
//! One [`PaymentProvider`] per payment method. Adapters answer two questions:
//! is this purchase authentic (and for how much), and did the store or
//! processor collect the next renewal. Network failures, timeouts and 5xx
//! responses are [`ProviderError::Transient`]; a definitive "no" from the
//! provider is [`Verification::Invalid`].

pub mod apple;
pub mod card;
pub mod google;
pub mod paypal;
pub mod retry;

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use coachpay_shared::PaymentMethod;
use serde_json::Value;
use thiserror::Error;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::error::{BillingError, BillingResult};
use crate::models::ExternalIds;

pub use apple::{AppleConfig, AppleProvider};
pub use card::{StripeConfig, StripeProvider};
pub use google::{GoogleConfig, GoogleProvider};
pub use paypal::{PaypalConfig, PaypalProvider};
pub use retry::RetryPolicy;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ProviderError {
    #[error("transient provider failure: {0}")]
    Transient(String),

    #[error("provider misconfigured: {0}")]
    Config(String),
}

impl ProviderError {
    pub fn is_transient(&self) -> bool {
        matches!(self, ProviderError::Transient(_))
    }
}

impl From<ProviderError> for BillingError {
    fn from(err: ProviderError) -> Self {
        match err {
            ProviderError::Transient(msg) => BillingError::TransientProvider(msg),
            ProviderError::Config(msg) => BillingError::Config(msg),
        }
    }
}

impl From<reqwest::Error> for ProviderError {
    fn from(err: reqwest::Error) -> Self {
        ProviderError::Transient(err.to_string())
    }
}

/// Provider-normalized verdict
#[derive(Debug, Clone, PartialEq)]
pub enum Verification {
    Valid {
        /// Amount the provider reports collecting; `None` when the rail does
        /// not expose it (app stores) and the catalog price applies
        amount_cents: Option<i64>,
        /// Canonical provider transaction id
        external_id: String,
        is_test: bool,
        raw: Value,
    },
    Invalid {
        reason: String,
    },
}

impl Verification {
    pub fn invalid(reason: impl Into<String>) -> Self {
        Verification::Invalid {
            reason: reason.into(),
        }
    }

    pub fn is_valid(&self) -> bool {
        matches!(self, Verification::Valid { .. })
    }
}

/// What the client handed us for a purchase
#[derive(Debug, Clone)]
pub struct ValidationRequest {
    /// Receipt transaction id, purchase token, payment intent id or order id
    pub reference: String,
    pub provider_product_id: Option<String>,
    /// Rail-specific payload (receipt data, subscription flag, ...)
    pub payload: Value,
}

/// A due renewal to collect
#[derive(Debug, Clone)]
pub struct RenewalRequest {
    pub subscription_id: Uuid,
    pub amount_cents: i64,
    pub currency: String,
    pub provider_product_id: Option<String>,
    pub external_ids: ExternalIds,
    /// Start of the period being replaced (last successful billing)
    pub previous_billing: Option<OffsetDateTime>,
    /// Billing date being collected; stable across dunning retries of a cycle
    pub due_at: OffsetDateTime,
    /// Failed attempts so far for this cycle
    pub attempt: u32,
    pub now: OffsetDateTime,
}

impl RenewalRequest {
    /// Key that makes a repeated charge of the same attempt a no-op at the processor
    pub fn idempotency_key(&self) -> String {
        format!(
            "renewal-{}-{}-{}",
            self.subscription_id,
            self.due_at.unix_timestamp(),
            self.attempt
        )
    }
}

#[async_trait]
pub trait PaymentProvider: Send + Sync {
    fn method(&self) -> PaymentMethod;

    /// Check that a purchase is authentic
    async fn validate(&self, request: &ValidationRequest) -> Result<Verification, ProviderError>;

    /// Collect (or confirm the store collected) one renewal
    async fn charge_renewal(&self, request: &RenewalRequest)
        -> Result<Verification, ProviderError>;
}

/// Providers keyed by payment method
#[derive(Clone, Default)]
pub struct ProviderRegistry {
    providers: HashMap<PaymentMethod, Arc<dyn PaymentProvider>>,
}

impl ProviderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register every rail whose credentials are present in the environment
    pub fn from_env(retry: &RetryPolicy) -> BillingResult<Self> {
        let mut registry = Self::new();
        if let Some(config) = AppleConfig::from_env() {
            registry.register(Arc::new(AppleProvider::new(config, retry.clone())?));
        }
        if let Some(config) = GoogleConfig::from_env() {
            registry.register(Arc::new(GoogleProvider::new(config, retry.clone())?));
        }
        if let Some(config) = StripeConfig::from_env() {
            registry.register(Arc::new(StripeProvider::new(config, retry.clone())));
        }
        if let Some(config) = PaypalConfig::from_env() {
            registry.register(Arc::new(PaypalProvider::new(config, retry.clone())?));
        }

        let mut enabled: Vec<&str> = registry.providers.keys().map(|m| m.as_str()).collect();
        enabled.sort_unstable();
        tracing::info!(providers = ?enabled, "Payment providers configured");
        Ok(registry)
    }

    pub fn register(&mut self, provider: Arc<dyn PaymentProvider>) {
        self.providers.insert(provider.method(), provider);
    }

    pub fn with(mut self, provider: Arc<dyn PaymentProvider>) -> Self {
        self.register(provider);
        self
    }

    pub fn get(&self, method: PaymentMethod) -> BillingResult<Arc<dyn PaymentProvider>> {
        self.providers.get(&method).cloned().ok_or_else(|| {
            BillingError::InvalidInput(format!("Payment method {} is not enabled", method))
        })
    }

    pub fn is_enabled(&self, method: PaymentMethod) -> bool {
        self.providers.contains_key(&method)
    }
}

/// HTTP reply after transient statuses have been filtered out
pub(crate) enum HttpReply {
    Ok(Value),
    Rejected { status: u16, body: String },
}

/// Read a provider response. 5xx and 429 are transient; other non-2xx
/// statuses are returned for the adapter to interpret.
pub(crate) async fn read_reply(response: reqwest::Response) -> Result<HttpReply, ProviderError> {
    let status = response.status();
    if status.is_server_error() || status == reqwest::StatusCode::TOO_MANY_REQUESTS {
        return Err(ProviderError::Transient(format!(
            "provider returned HTTP {}",
            status.as_u16()
        )));
    }
    if !status.is_success() {
        let body = response.text().await.unwrap_or_default();
        return Ok(HttpReply::Rejected {
            status: status.as_u16(),
            body,
        });
    }
    let json = response
        .json::<Value>()
        .await
        .map_err(|e| ProviderError::Transient(format!("unreadable provider response: {}", e)))?;
    Ok(HttpReply::Ok(json))
}

pub(crate) fn http_client(timeout: std::time::Duration) -> Result<reqwest::Client, ProviderError> {
    reqwest::Client::builder()
        .timeout(timeout)
        .build()
        .map_err(|e| ProviderError::Config(format!("HTTP client: {}", e)))
}

/// Parse a decimal money string ("89.00", "12.5") into cents
pub(crate) fn parse_decimal_cents(raw: &str) -> Option<i64> {
    let raw = raw.trim();
    let (whole, frac) = match raw.split_once('.') {
        Some((w, f)) => (w, f),
        None => (raw, ""),
    };
    if frac.len() > 2 || whole.is_empty() {
        return None;
    }
    let whole: i64 = whole.parse().ok()?;
    let frac_cents: i64 = match frac.len() {
        0 => 0,
        1 => frac.parse::<i64>().ok()? * 10,
        _ => frac.parse().ok()?,
    };
    whole.checked_mul(100)?.checked_add(frac_cents)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_decimal_cents() {
        assert_eq!(parse_decimal_cents("89.00"), Some(8900));
        assert_eq!(parse_decimal_cents("12.5"), Some(1250));
        assert_eq!(parse_decimal_cents("7"), Some(700));
        assert_eq!(parse_decimal_cents("1.999"), None);
        assert_eq!(parse_decimal_cents("abc"), None);
    }

    #[test]
    fn test_registry_rejects_disabled_method() {
        let registry = ProviderRegistry::new();
        assert!(matches!(
            registry.get(PaymentMethod::Paypal),
            Err(BillingError::InvalidInput(_))
        ));
    }

    #[test]
    fn test_idempotency_key_is_stable_per_attempt() {
        let due = OffsetDateTime::from_unix_timestamp(1_800_000_000).unwrap();
        let req = RenewalRequest {
            subscription_id: Uuid::nil(),
            amount_cents: 100,
            currency: "USD".into(),
            provider_product_id: None,
            external_ids: ExternalIds::default(),
            previous_billing: None,
            due_at: due,
            attempt: 0,
            now: due + time::Duration::hours(3),
        };
        let mut later = req.clone();
        later.now += time::Duration::minutes(5);
        assert_eq!(req.idempotency_key(), later.idempotency_key());

        let mut retry = req.clone();
        retry.attempt = 1;
        assert_ne!(req.idempotency_key(), retry.idempotency_key());
    }
}
