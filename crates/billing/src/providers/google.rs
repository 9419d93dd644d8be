//! Google Play purchases (androidpublisher v3)

use async_trait::async_trait;
use coachpay_shared::PaymentMethod;
use serde_json::{json, Value};

use super::retry::RetryPolicy;
use super::{
    http_client, read_reply, HttpReply, PaymentProvider, ProviderError, RenewalRequest,
    ValidationRequest, Verification,
};
use crate::error::BillingResult;

const DEFAULT_BASE_URL: &str = "https://androidpublisher.googleapis.com";

#[derive(Debug, Clone)]
pub struct GoogleConfig {
    pub package_name: String,
    /// OAuth access token for the Play Developer API service account
    pub access_token: String,
    pub base_url: String,
}

impl GoogleConfig {
    /// `None` unless both `GOOGLE_PLAY_PACKAGE_NAME` and
    /// `GOOGLE_PLAY_ACCESS_TOKEN` are set
    pub fn from_env() -> Option<Self> {
        Some(Self {
            package_name: std::env::var("GOOGLE_PLAY_PACKAGE_NAME").ok()?,
            access_token: std::env::var("GOOGLE_PLAY_ACCESS_TOKEN").ok()?,
            base_url: std::env::var("GOOGLE_PLAY_API_URL")
                .unwrap_or_else(|_| DEFAULT_BASE_URL.to_string()),
        })
    }
}

pub struct GoogleProvider {
    config: GoogleConfig,
    client: reqwest::Client,
    retry: RetryPolicy,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PurchaseKind {
    Product,
    Subscription,
}

impl PurchaseKind {
    fn path(&self) -> &'static str {
        match self {
            PurchaseKind::Product => "products",
            PurchaseKind::Subscription => "subscriptions",
        }
    }
}

impl GoogleProvider {
    pub fn new(config: GoogleConfig, retry: RetryPolicy) -> BillingResult<Self> {
        Ok(Self {
            client: http_client(retry.call_timeout)?,
            config,
            retry,
        })
    }

    async fn fetch_purchase(
        &self,
        kind: PurchaseKind,
        product_id: &str,
        token: &str,
    ) -> Result<Result<Value, String>, ProviderError> {
        let url = format!(
            "{}/androidpublisher/v3/applications/{}/purchases/{}/{}/tokens/{}",
            self.config.base_url.trim_end_matches('/'),
            self.config.package_name,
            kind.path(),
            product_id,
            token
        );
        self.retry
            .run("google.purchases.get", || async {
                let response = self
                    .client
                    .get(&url)
                    .bearer_auth(&self.config.access_token)
                    .send()
                    .await?;
                match read_reply(response).await? {
                    HttpReply::Ok(body) => Ok(Ok(body)),
                    HttpReply::Rejected { status: 401 | 403, .. } => Err(ProviderError::Config(
                        "Google Play rejected the access token".to_string(),
                    )),
                    HttpReply::Rejected { status, .. } => {
                        Ok(Err(format!("Google Play returned HTTP {}", status)))
                    }
                }
            })
            .await
    }
}

fn int_field(body: &Value, key: &str) -> Option<i64> {
    match &body[key] {
        Value::Number(n) => n.as_i64(),
        Value::String(s) => s.parse().ok(),
        _ => None,
    }
}

/// purchaseType 0 is a license-tester purchase
fn is_test_purchase(body: &Value) -> bool {
    int_field(body, "purchaseType") == Some(0)
}

/// Interpret a purchase resource
fn verdict(kind: PurchaseKind, body: &Value, token: &str) -> Verification {
    let ok = match kind {
        // purchaseState: 0 purchased, 1 cancelled, 2 pending
        PurchaseKind::Product => int_field(body, "purchaseState") == Some(0),
        // paymentState: 1 received, 2 free trial
        PurchaseKind::Subscription => matches!(int_field(body, "paymentState"), Some(1 | 2)),
    };
    if !ok {
        return Verification::invalid(format!(
            "Google Play purchase not paid (purchaseState={:?}, paymentState={:?})",
            int_field(body, "purchaseState"),
            int_field(body, "paymentState")
        ));
    }
    let external_id = body["orderId"]
        .as_str()
        .map(str::to_string)
        .unwrap_or_else(|| token.to_string());
    Verification::Valid {
        amount_cents: None,
        external_id,
        is_test: is_test_purchase(body),
        raw: body.clone(),
    }
}

#[async_trait]
impl PaymentProvider for GoogleProvider {
    fn method(&self) -> PaymentMethod {
        PaymentMethod::GooglePlay
    }

    async fn validate(&self, request: &ValidationRequest) -> Result<Verification, ProviderError> {
        let Some(product_id) = request.provider_product_id.as_deref() else {
            return Ok(Verification::invalid("Google Play purchases need a product id"));
        };
        let kind = if request.payload["subscription"].as_bool().unwrap_or(false) {
            PurchaseKind::Subscription
        } else {
            PurchaseKind::Product
        };
        let token = request.reference.as_str();
        match self.fetch_purchase(kind, product_id, token).await? {
            Ok(body) => Ok(verdict(kind, &body, token)),
            Err(reason) => Ok(Verification::invalid(reason)),
        }
    }

    async fn charge_renewal(
        &self,
        request: &RenewalRequest,
    ) -> Result<Verification, ProviderError> {
        let (Some(token), Some(product_id)) = (
            request.external_ids.google_purchase_token.as_deref(),
            request.provider_product_id.as_deref(),
        ) else {
            return Ok(Verification::invalid(
                "Subscription has no Google Play purchase token on file",
            ));
        };
        let body = match self
            .fetch_purchase(PurchaseKind::Subscription, product_id, token)
            .await?
        {
            Ok(body) => body,
            Err(reason) => return Ok(Verification::invalid(reason)),
        };

        let now_ms = request.now.unix_timestamp() * 1000;
        let expiry_ms = int_field(&body, "expiryTimeMillis").unwrap_or(0);
        if expiry_ms <= now_ms {
            return Ok(Verification::invalid(
                "Subscription was not renewed by Google Play",
            ));
        }
        Ok(match verdict(PurchaseKind::Subscription, &body, token) {
            Verification::Valid {
                amount_cents,
                external_id,
                is_test,
                raw,
            } => Verification::Valid {
                amount_cents,
                external_id,
                is_test,
                raw: json!({ "purchase": raw, "expiryTimeMillis": expiry_ms }),
            },
            invalid => invalid,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn provider(server: &mockito::Server) -> GoogleProvider {
        GoogleProvider::new(
            GoogleConfig {
                package_name: "com.coachpay.app".into(),
                access_token: "ya29.token".into(),
                base_url: server.url(),
            },
            RetryPolicy::immediate(1),
        )
        .unwrap()
    }

    const PRODUCT_PATH: &str =
        "/androidpublisher/v3/applications/com.coachpay.app/purchases/products/sessions_10/tokens/tok123";

    fn request() -> ValidationRequest {
        ValidationRequest {
            reference: "tok123".into(),
            provider_product_id: Some("sessions_10".into()),
            payload: json!({}),
        }
    }

    #[tokio::test]
    async fn test_purchased_product_is_valid() {
        let mut server = mockito::Server::new_async().await;
        let _m = server
            .mock("GET", PRODUCT_PATH)
            .match_header("authorization", "Bearer ya29.token")
            .with_status(200)
            .with_body(json!({ "purchaseState": 0, "orderId": "GPA.1234", "purchaseType": 0 }).to_string())
            .create_async()
            .await;

        let result = provider(&server).validate(&request()).await.unwrap();
        match result {
            Verification::Valid {
                external_id,
                is_test,
                ..
            } => {
                assert_eq!(external_id, "GPA.1234");
                assert!(is_test);
            }
            other => panic!("expected valid, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_cancelled_purchase_is_invalid() {
        let mut server = mockito::Server::new_async().await;
        let _m = server
            .mock("GET", PRODUCT_PATH)
            .with_status(200)
            .with_body(json!({ "purchaseState": 1, "orderId": "GPA.1" }).to_string())
            .create_async()
            .await;

        assert!(!provider(&server).validate(&request()).await.unwrap().is_valid());
    }

    #[tokio::test]
    async fn test_unknown_token_is_invalid_not_transient() {
        let mut server = mockito::Server::new_async().await;
        let _m = server
            .mock("GET", PRODUCT_PATH)
            .with_status(404)
            .create_async()
            .await;

        let result = provider(&server).validate(&request()).await.unwrap();
        assert_eq!(result, Verification::invalid("Google Play returned HTTP 404"));
    }

    #[tokio::test]
    async fn test_server_errors_are_transient() {
        let mut server = mockito::Server::new_async().await;
        let m = server
            .mock("GET", PRODUCT_PATH)
            .with_status(503)
            .expect(2)
            .create_async()
            .await;

        let err = provider(&server).validate(&request()).await.unwrap_err();
        assert!(err.is_transient());
        m.assert_async().await;
    }

    #[tokio::test]
    async fn test_rejected_token_is_config_error() {
        let mut server = mockito::Server::new_async().await;
        let _m = server
            .mock("GET", PRODUCT_PATH)
            .with_status(401)
            .create_async()
            .await;

        let err = provider(&server).validate(&request()).await.unwrap_err();
        assert!(matches!(err, ProviderError::Config(_)));
    }
}
