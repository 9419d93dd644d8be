//! Card payments through Stripe PaymentIntents

use async_trait::async_trait;
use coachpay_shared::PaymentMethod;
use serde_json::{json, Value};
use stripe::{
    Client, CreatePaymentIntent, Currency, CustomerId, PaymentIntent, PaymentIntentId,
    PaymentMethodId, RequestStrategy, StripeError,
};

use super::retry::RetryPolicy;
use super::{PaymentProvider, ProviderError, RenewalRequest, ValidationRequest, Verification};

/// Stripe configuration
#[derive(Debug, Clone)]
pub struct StripeConfig {
    /// Secret API key (sk_live_... or sk_test_...)
    pub secret_key: String,
}

impl StripeConfig {
    /// `None` when `STRIPE_SECRET_KEY` is unset
    pub fn from_env() -> Option<Self> {
        let secret_key = std::env::var("STRIPE_SECRET_KEY").ok()?;
        Some(Self { secret_key })
    }

    pub fn is_test_mode(&self) -> bool {
        self.secret_key.starts_with("sk_test_")
    }
}

pub struct StripeProvider {
    client: Client,
    retry: RetryPolicy,
}

impl StripeProvider {
    pub fn new(config: StripeConfig, retry: RetryPolicy) -> Self {
        Self {
            client: Client::new(&config.secret_key),
            retry,
        }
    }
}

/// Split Stripe errors into "ask again later" and "Stripe said no"
fn classify_error(err: StripeError) -> Result<String, ProviderError> {
    match err {
        StripeError::Stripe(request_err) => {
            let status = request_err.http_status;
            let message = request_err
                .message
                .clone()
                .unwrap_or_else(|| format!("Stripe returned HTTP {}", status));
            match status {
                401 | 403 => Err(ProviderError::Config(message)),
                429 | 500..=599 => Err(ProviderError::Transient(message)),
                _ => Ok(message),
            }
        }
        other => Err(ProviderError::Transient(other.to_string())),
    }
}

/// Interpret a PaymentIntent (serialized) the same way for purchases and renewals
fn intent_verdict(intent: &Value) -> Result<Verification, ProviderError> {
    let status = intent["status"].as_str().unwrap_or_default();
    match status {
        "succeeded" => {
            let Some(id) = intent["id"].as_str() else {
                return Ok(Verification::invalid("PaymentIntent has no id"));
            };
            Ok(Verification::Valid {
                amount_cents: intent["amount_received"]
                    .as_i64()
                    .or_else(|| intent["amount"].as_i64()),
                external_id: id.to_string(),
                is_test: !intent["livemode"].as_bool().unwrap_or(false),
                raw: json!({
                    "id": id,
                    "status": status,
                    "amount": intent["amount"],
                    "amount_received": intent["amount_received"],
                    "currency": intent["currency"],
                    "livemode": intent["livemode"],
                }),
            })
        }
        "processing" => Err(ProviderError::Transient(
            "PaymentIntent is still processing".to_string(),
        )),
        other => Ok(Verification::invalid(format!(
            "PaymentIntent status is {}",
            other
        ))),
    }
}

fn parse_currency(code: &str) -> Result<Currency, ProviderError> {
    serde_json::from_value(Value::String(code.to_lowercase()))
        .map_err(|_| ProviderError::Config(format!("Unsupported currency: {}", code)))
}

#[async_trait]
impl PaymentProvider for StripeProvider {
    fn method(&self) -> PaymentMethod {
        PaymentMethod::Card
    }

    async fn validate(&self, request: &ValidationRequest) -> Result<Verification, ProviderError> {
        let Ok(intent_id) = request.reference.parse::<PaymentIntentId>() else {
            return Ok(Verification::invalid(format!(
                "Not a PaymentIntent id: {}",
                request.reference
            )));
        };

        self.retry
            .run("stripe.payment_intents.retrieve", || async {
                match PaymentIntent::retrieve(&self.client, &intent_id, &[]).await {
                    Ok(intent) => intent_verdict(&serde_json::to_value(&intent).map_err(|e| {
                        ProviderError::Transient(format!("unreadable PaymentIntent: {}", e))
                    })?),
                    Err(e) => classify_error(e).map(Verification::invalid),
                }
            })
            .await
    }

    async fn charge_renewal(
        &self,
        request: &RenewalRequest,
    ) -> Result<Verification, ProviderError> {
        let ids = &request.external_ids;
        let (Some(customer), Some(payment_method)) = (
            ids.stripe_customer_id.as_deref(),
            ids.stripe_payment_method_id.as_deref(),
        ) else {
            return Ok(Verification::invalid("Subscription has no card on file"));
        };
        let (Ok(customer), Ok(payment_method)) = (
            customer.parse::<CustomerId>(),
            payment_method.parse::<PaymentMethodId>(),
        ) else {
            return Ok(Verification::invalid("Stored card references are malformed"));
        };
        let currency = parse_currency(&request.currency)?;
        let description = format!("Subscription renewal {}", request.subscription_id);

        // Same key on every attempt: a retried create returns the first intent
        let client = self
            .client
            .clone()
            .with_strategy(RequestStrategy::Idempotent(request.idempotency_key()));

        self.retry
            .run("stripe.payment_intents.create", || async {
                let mut params = CreatePaymentIntent::new(request.amount_cents, currency);
                params.customer = Some(customer.clone());
                params.payment_method = Some(payment_method.clone());
                params.confirm = Some(true);
                params.description = Some(description.as_str());

                match PaymentIntent::create(&client, params).await {
                    Ok(intent) => intent_verdict(&serde_json::to_value(&intent).map_err(|e| {
                        ProviderError::Transient(format!("unreadable PaymentIntent: {}", e))
                    })?),
                    Err(e) => classify_error(e).map(Verification::invalid),
                }
            })
            .await
    }
}
