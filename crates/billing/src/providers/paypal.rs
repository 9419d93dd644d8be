//! PayPal orders and billing subscriptions (REST v1/v2)

use async_trait::async_trait;
use coachpay_shared::PaymentMethod;
use serde::Deserialize;
use serde_json::{json, Value};
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;

use super::retry::RetryPolicy;
use super::{
    http_client, parse_decimal_cents, read_reply, HttpReply, PaymentProvider, ProviderError,
    RenewalRequest, ValidationRequest, Verification,
};
use crate::error::BillingResult;

const LIVE_BASE_URL: &str = "https://api-m.paypal.com";

#[derive(Debug, Clone)]
pub struct PaypalConfig {
    pub client_id: String,
    pub client_secret: String,
    pub base_url: String,
}

impl PaypalConfig {
    /// `None` unless `PAYPAL_CLIENT_ID` and `PAYPAL_CLIENT_SECRET` are set
    pub fn from_env() -> Option<Self> {
        Some(Self {
            client_id: std::env::var("PAYPAL_CLIENT_ID").ok()?,
            client_secret: std::env::var("PAYPAL_CLIENT_SECRET").ok()?,
            base_url: std::env::var("PAYPAL_API_URL").unwrap_or_else(|_| LIVE_BASE_URL.to_string()),
        })
    }

    pub fn is_sandbox(&self) -> bool {
        self.base_url.contains("sandbox")
    }
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
}

pub struct PaypalProvider {
    config: PaypalConfig,
    client: reqwest::Client,
    retry: RetryPolicy,
}

impl PaypalProvider {
    pub fn new(config: PaypalConfig, retry: RetryPolicy) -> BillingResult<Self> {
        Ok(Self {
            client: http_client(retry.call_timeout)?,
            config,
            retry,
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.config.base_url.trim_end_matches('/'), path)
    }

    async fn access_token(&self) -> Result<String, ProviderError> {
        let response = self
            .client
            .post(self.url("/v1/oauth2/token"))
            .basic_auth(&self.config.client_id, Some(&self.config.client_secret))
            .form(&[("grant_type", "client_credentials")])
            .send()
            .await?;
        match read_reply(response).await? {
            HttpReply::Ok(body) => serde_json::from_value::<TokenResponse>(body)
                .map(|t| t.access_token)
                .map_err(|e| ProviderError::Transient(format!("PayPal token response: {}", e))),
            HttpReply::Rejected { status, .. } => Err(ProviderError::Config(format!(
                "PayPal rejected client credentials (HTTP {})",
                status
            ))),
        }
    }

    /// GET a resource; `Err(reason)` inside `Ok` for 4xx answers
    async fn get_resource(&self, path: &str) -> Result<Result<Value, String>, ProviderError> {
        let url = self.url(path);
        self.retry
            .run("paypal.get", || async {
                let token = self.access_token().await?;
                let response = self.client.get(&url).bearer_auth(token).send().await?;
                match read_reply(response).await? {
                    HttpReply::Ok(body) => Ok(Ok(body)),
                    HttpReply::Rejected { status, .. } => {
                        Ok(Err(format!("PayPal returned HTTP {}", status)))
                    }
                }
            })
            .await
    }
}

/// First capture of the first purchase unit
fn first_capture(order: &Value) -> &Value {
    &order["purchase_units"][0]["payments"]["captures"][0]
}

fn order_verdict(order: &Value, is_sandbox: bool) -> Result<Verification, ProviderError> {
    match order["status"].as_str().unwrap_or_default() {
        "COMPLETED" => {
            let capture = first_capture(order);
            let Some(capture_id) = capture["id"].as_str().or_else(|| order["id"].as_str()) else {
                return Ok(Verification::invalid("PayPal order has no id"));
            };
            let amount_cents = capture["amount"]["value"]
                .as_str()
                .or_else(|| order["purchase_units"][0]["amount"]["value"].as_str())
                .and_then(parse_decimal_cents);
            Ok(Verification::Valid {
                amount_cents,
                external_id: capture_id.to_string(),
                is_test: is_sandbox,
                raw: json!({
                    "order_id": order["id"],
                    "status": "COMPLETED",
                    "capture": capture,
                }),
            })
        }
        "APPROVED" | "PENDING" | "SAVED" => Err(ProviderError::Transient(format!(
            "PayPal order {} not captured yet",
            order["id"].as_str().unwrap_or("?")
        ))),
        other => Ok(Verification::invalid(format!(
            "PayPal order status is {}",
            other
        ))),
    }
}

fn renewal_verdict(
    subscription: &Value,
    previous_billing: Option<OffsetDateTime>,
    is_sandbox: bool,
) -> Verification {
    let status = subscription["status"].as_str().unwrap_or_default();
    if status != "ACTIVE" {
        return Verification::invalid(format!("PayPal subscription status is {}", status));
    }
    let last_payment = &subscription["billing_info"]["last_payment"];
    let Some(paid_at) = last_payment["time"]
        .as_str()
        .and_then(|t| OffsetDateTime::parse(t, &Rfc3339).ok())
    else {
        return Verification::invalid("PayPal subscription has no payment on record");
    };
    if previous_billing.is_some_and(|prev| paid_at <= prev) {
        return Verification::invalid("PayPal has not collected this cycle yet");
    }
    let sub_id = subscription["id"].as_str().unwrap_or("?");
    Verification::Valid {
        amount_cents: last_payment["amount"]["value"]
            .as_str()
            .and_then(parse_decimal_cents),
        external_id: format!("{}:{}", sub_id, paid_at.unix_timestamp()),
        is_test: is_sandbox,
        raw: json!({ "subscription_id": sub_id, "last_payment": last_payment }),
    }
}

#[async_trait]
impl PaymentProvider for PaypalProvider {
    fn method(&self) -> PaymentMethod {
        PaymentMethod::Paypal
    }

    async fn validate(&self, request: &ValidationRequest) -> Result<Verification, ProviderError> {
        let order = match self
            .get_resource(&format!("/v2/checkout/orders/{}", request.reference))
            .await?
        {
            Ok(order) => order,
            Err(reason) => return Ok(Verification::invalid(reason)),
        };
        order_verdict(&order, self.config.is_sandbox())
    }

    async fn charge_renewal(
        &self,
        request: &RenewalRequest,
    ) -> Result<Verification, ProviderError> {
        let Some(sub_id) = request.external_ids.paypal_subscription_id.as_deref() else {
            return Ok(Verification::invalid(
                "Subscription has no PayPal billing subscription on file",
            ));
        };
        let subscription = match self
            .get_resource(&format!("/v1/billing/subscriptions/{}", sub_id))
            .await?
        {
            Ok(sub) => sub,
            Err(reason) => return Ok(Verification::invalid(reason)),
        };
        Ok(renewal_verdict(
            &subscription,
            request.previous_billing,
            self.config.is_sandbox(),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use time::macros::datetime;

    fn provider(server: &mockito::Server) -> PaypalProvider {
        PaypalProvider::new(
            PaypalConfig {
                client_id: "client".into(),
                client_secret: "secret".into(),
                base_url: server.url(),
            },
            RetryPolicy::immediate(0),
        )
        .unwrap()
    }

    #[tokio::test]
    async fn test_completed_order_is_valid_with_captured_amount() {
        let mut server = mockito::Server::new_async().await;
        let _token = server
            .mock("POST", "/v1/oauth2/token")
            .with_status(200)
            .with_body(json!({ "access_token": "A21", "token_type": "Bearer" }).to_string())
            .create_async()
            .await;
        let _order = server
            .mock("GET", "/v2/checkout/orders/5O190127TN364715T")
            .match_header("authorization", "Bearer A21")
            .with_status(200)
            .with_body(
                json!({
                    "id": "5O190127TN364715T",
                    "status": "COMPLETED",
                    "purchase_units": [{
                        "payments": { "captures": [{
                            "id": "3C679366HH908993F",
                            "amount": { "currency_code": "USD", "value": "89.00" }
                        }]}
                    }]
                })
                .to_string(),
            )
            .create_async()
            .await;

        let result = provider(&server)
            .validate(&ValidationRequest {
                reference: "5O190127TN364715T".into(),
                provider_product_id: None,
                payload: json!({}),
            })
            .await
            .unwrap();
        match result {
            Verification::Valid {
                amount_cents,
                external_id,
                ..
            } => {
                assert_eq!(amount_cents, Some(8900));
                assert_eq!(external_id, "3C679366HH908993F");
            }
            other => panic!("expected valid, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_bad_credentials_are_config_errors() {
        let mut server = mockito::Server::new_async().await;
        let _token = server
            .mock("POST", "/v1/oauth2/token")
            .with_status(401)
            .create_async()
            .await;

        let err = provider(&server)
            .validate(&ValidationRequest {
                reference: "ORDER".into(),
                provider_product_id: None,
                payload: json!({}),
            })
            .await
            .unwrap_err();
        assert!(matches!(err, ProviderError::Config(_)));
    }

    #[test]
    fn test_approved_order_is_transient() {
        let order = json!({ "id": "O1", "status": "APPROVED" });
        assert!(order_verdict(&order, false).unwrap_err().is_transient());
        let voided = json!({ "id": "O1", "status": "VOIDED" });
        assert!(!order_verdict(&voided, false).unwrap().is_valid());
    }

    #[test]
    fn test_renewal_needs_payment_after_previous_cycle() {
        let sub = json!({
            "id": "I-BW452GLLEP1G",
            "status": "ACTIVE",
            "billing_info": { "last_payment": {
                "amount": { "currency_code": "USD", "value": "29.00" },
                "time": "2026-11-01T10:00:00Z"
            }}
        });
        let fresh = renewal_verdict(&sub, Some(datetime!(2026-10-01 10:00 UTC)), false);
        assert!(matches!(fresh, Verification::Valid { amount_cents: Some(2900), .. }));

        let stale = renewal_verdict(&sub, Some(datetime!(2026-11-01 10:00 UTC)), false);
        assert!(!stale.is_valid());

        let suspended = json!({ "id": "I-1", "status": "SUSPENDED" });
        assert!(!renewal_verdict(&suspended, None, false).is_valid());
    }
}
