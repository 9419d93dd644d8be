//! Apple in-app purchase receipts (verifyReceipt)

use async_trait::async_trait;
use coachpay_shared::PaymentMethod;
use serde_json::{json, Value};

use super::retry::RetryPolicy;
use super::{
    http_client, read_reply, HttpReply, PaymentProvider, ProviderError, RenewalRequest,
    ValidationRequest, Verification,
};
use crate::error::BillingResult;

const PRODUCTION_URL: &str = "https://buy.itunes.apple.com/verifyReceipt";
const SANDBOX_URL: &str = "https://sandbox.itunes.apple.com/verifyReceipt";

/// Receipt is from the sandbox environment
const STATUS_SANDBOX_RECEIPT: i64 = 21007;

#[derive(Debug, Clone)]
pub struct AppleConfig {
    pub shared_secret: String,
    pub production_url: String,
    pub sandbox_url: String,
}

impl AppleConfig {
    /// `None` when `APPLE_SHARED_SECRET` is unset
    pub fn from_env() -> Option<Self> {
        let shared_secret = std::env::var("APPLE_SHARED_SECRET").ok()?;
        Some(Self {
            shared_secret,
            production_url: std::env::var("APPLE_VERIFY_URL")
                .unwrap_or_else(|_| PRODUCTION_URL.to_string()),
            sandbox_url: std::env::var("APPLE_SANDBOX_VERIFY_URL")
                .unwrap_or_else(|_| SANDBOX_URL.to_string()),
        })
    }
}

pub struct AppleProvider {
    config: AppleConfig,
    client: reqwest::Client,
    retry: RetryPolicy,
}

/// Parsed verifyReceipt response
struct ReceiptReply {
    status: i64,
    body: Value,
    is_sandbox: bool,
}

impl AppleProvider {
    pub fn new(config: AppleConfig, retry: RetryPolicy) -> BillingResult<Self> {
        Ok(Self {
            client: http_client(retry.call_timeout)?,
            config,
            retry,
        })
    }

    async fn post_receipt(&self, url: &str, receipt: &str) -> Result<Option<Value>, ProviderError> {
        let response = self
            .client
            .post(url)
            .json(&json!({
                "receipt-data": receipt,
                "password": self.config.shared_secret,
                "exclude-old-transactions": true,
            }))
            .send()
            .await?;
        match read_reply(response).await? {
            HttpReply::Ok(body) => Ok(Some(body)),
            HttpReply::Rejected { status, body } => {
                tracing::warn!(status = status, body = %body, "App Store rejected verifyReceipt request");
                Ok(None)
            }
        }
    }

    /// Verify against production, falling back to sandbox on 21007
    async fn verify_receipt(&self, receipt: &str) -> Result<Option<ReceiptReply>, ProviderError> {
        self.retry
            .run("apple.verifyReceipt", || async {
                let Some(body) = self.post_receipt(&self.config.production_url, receipt).await?
                else {
                    return Ok(None);
                };
                let status = body["status"].as_i64().unwrap_or(-1);
                if status != STATUS_SANDBOX_RECEIPT {
                    return classify(status).map(|_| {
                        Some(ReceiptReply {
                            status,
                            body,
                            is_sandbox: false,
                        })
                    });
                }

                let Some(body) = self.post_receipt(&self.config.sandbox_url, receipt).await? else {
                    return Ok(None);
                };
                let status = body["status"].as_i64().unwrap_or(-1);
                classify(status).map(|_| {
                    Some(ReceiptReply {
                        status,
                        body,
                        is_sandbox: true,
                    })
                })
            })
            .await
    }
}

/// 21100-21199 are internal App Store errors worth retrying
fn classify(status: i64) -> Result<(), ProviderError> {
    if (21100..=21199).contains(&status) || status == 21005 {
        return Err(ProviderError::Transient(format!(
            "App Store status {}",
            status
        )));
    }
    Ok(())
}

/// All purchase entries in a receipt, newest receipts first
fn purchases(body: &Value) -> Vec<&Value> {
    let mut entries: Vec<&Value> = body["latest_receipt_info"]
        .as_array()
        .into_iter()
        .flatten()
        .collect();
    entries.extend(body["receipt"]["in_app"].as_array().into_iter().flatten());
    entries
}

fn ms_field(entry: &Value, key: &str) -> i64 {
    match &entry[key] {
        Value::String(s) => s.parse().unwrap_or(0),
        Value::Number(n) => n.as_i64().unwrap_or(0),
        _ => 0,
    }
}

fn receipt_of(request: &ValidationRequest) -> Option<&str> {
    request.payload["receipt_data"]
        .as_str()
        .or_else(|| request.payload["receipt-data"].as_str())
}

#[async_trait]
impl PaymentProvider for AppleProvider {
    fn method(&self) -> PaymentMethod {
        PaymentMethod::AppleIap
    }

    async fn validate(&self, request: &ValidationRequest) -> Result<Verification, ProviderError> {
        let Some(receipt) = receipt_of(request) else {
            return Ok(Verification::invalid("receipt_data is required"));
        };
        let Some(reply) = self.verify_receipt(receipt).await? else {
            return Ok(Verification::invalid("App Store rejected the receipt request"));
        };
        if reply.status != 0 {
            return Ok(Verification::invalid(format!(
                "App Store status {}",
                reply.status
            )));
        }

        let entries = purchases(&reply.body);
        let matching = entries
            .iter()
            .find(|e| e["transaction_id"].as_str() == Some(request.reference.as_str()))
            .or_else(|| {
                entries
                    .iter()
                    .filter(|e| match request.provider_product_id.as_deref() {
                        Some(product) => e["product_id"].as_str() == Some(product),
                        None => true,
                    })
                    .max_by_key(|e| ms_field(e, "purchase_date_ms"))
            });

        let Some(entry) = matching else {
            return Ok(Verification::invalid("No matching in-app purchase in receipt"));
        };
        if let Some(product) = request.provider_product_id.as_deref() {
            if entry["product_id"].as_str() != Some(product) {
                return Ok(Verification::invalid(format!(
                    "Receipt is for product {}, expected {}",
                    entry["product_id"].as_str().unwrap_or("?"),
                    product
                )));
            }
        }
        let Some(transaction_id) = entry["transaction_id"].as_str() else {
            return Ok(Verification::invalid("Receipt entry has no transaction_id"));
        };

        Ok(Verification::Valid {
            amount_cents: None,
            external_id: transaction_id.to_string(),
            is_test: reply.is_sandbox,
            raw: json!({
                "status": reply.status,
                "environment": if reply.is_sandbox { "Sandbox" } else { "Production" },
                "transaction": entry,
            }),
        })
    }

    async fn charge_renewal(
        &self,
        request: &RenewalRequest,
    ) -> Result<Verification, ProviderError> {
        let ids = &request.external_ids;
        let (Some(receipt), Some(original)) = (
            ids.apple_latest_receipt.as_deref(),
            ids.apple_original_transaction_id.as_deref(),
        ) else {
            return Ok(Verification::invalid(
                "Subscription has no App Store receipt on file",
            ));
        };
        let Some(reply) = self.verify_receipt(receipt).await? else {
            return Ok(Verification::invalid("App Store rejected the receipt request"));
        };
        // 21006: receipt valid but subscription expired
        if reply.status != 0 {
            return Ok(Verification::invalid(format!(
                "App Store status {}",
                reply.status
            )));
        }

        let now_ms = request.now.unix_timestamp() * 1000;
        let latest = purchases(&reply.body)
            .into_iter()
            .filter(|e| e["original_transaction_id"].as_str() == Some(original))
            .max_by_key(|e| ms_field(e, "expires_date_ms"));

        match latest {
            Some(entry) if ms_field(entry, "expires_date_ms") > now_ms => {
                let Some(transaction_id) = entry["transaction_id"].as_str() else {
                    return Ok(Verification::invalid("Receipt entry has no transaction_id"));
                };
                Ok(Verification::Valid {
                    amount_cents: None,
                    external_id: transaction_id.to_string(),
                    is_test: reply.is_sandbox,
                    raw: json!({ "status": reply.status, "transaction": entry }),
                })
            }
            _ => Ok(Verification::invalid("Subscription was not renewed by the App Store")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::ExternalIds;
    use time::OffsetDateTime;
    use uuid::Uuid;

    fn provider(server: &mockito::Server) -> AppleProvider {
        AppleProvider::new(
            AppleConfig {
                shared_secret: "secret".into(),
                production_url: format!("{}/prod/verifyReceipt", server.url()),
                sandbox_url: format!("{}/sandbox/verifyReceipt", server.url()),
            },
            RetryPolicy::immediate(2),
        )
        .unwrap()
    }

    fn request(reference: &str) -> ValidationRequest {
        ValidationRequest {
            reference: reference.into(),
            provider_product_id: Some("com.coachpay.elite.monthly".into()),
            payload: json!({ "receipt_data": "base64receipt" }),
        }
    }

    fn valid_body() -> String {
        json!({
            "status": 0,
            "receipt": {
                "in_app": [{
                    "product_id": "com.coachpay.elite.monthly",
                    "transaction_id": "1000000001",
                    "original_transaction_id": "1000000001",
                    "purchase_date_ms": "1790000000000"
                }]
            }
        })
        .to_string()
    }

    #[tokio::test]
    async fn test_valid_production_receipt() {
        let mut server = mockito::Server::new_async().await;
        let _m = server
            .mock("POST", "/prod/verifyReceipt")
            .with_status(200)
            .with_body(valid_body())
            .create_async()
            .await;

        let result = provider(&server).validate(&request("1000000001")).await.unwrap();
        match result {
            Verification::Valid {
                external_id,
                is_test,
                amount_cents,
                ..
            } => {
                assert_eq!(external_id, "1000000001");
                assert!(!is_test);
                assert_eq!(amount_cents, None);
            }
            other => panic!("expected valid, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_sandbox_receipt_falls_back_and_marks_test() {
        let mut server = mockito::Server::new_async().await;
        let _prod = server
            .mock("POST", "/prod/verifyReceipt")
            .with_status(200)
            .with_body(json!({ "status": 21007 }).to_string())
            .create_async()
            .await;
        let _sandbox = server
            .mock("POST", "/sandbox/verifyReceipt")
            .with_status(200)
            .with_body(valid_body())
            .create_async()
            .await;

        let result = provider(&server).validate(&request("1000000001")).await.unwrap();
        assert!(matches!(result, Verification::Valid { is_test: true, .. }));
    }

    #[tokio::test]
    async fn test_product_mismatch_is_invalid() {
        let mut server = mockito::Server::new_async().await;
        let _m = server
            .mock("POST", "/prod/verifyReceipt")
            .with_status(200)
            .with_body(valid_body())
            .create_async()
            .await;

        let mut req = request("1000000001");
        req.provider_product_id = Some("com.coachpay.starter.monthly".into());
        let result = provider(&server).validate(&req).await.unwrap();
        assert!(!result.is_valid());
    }

    #[tokio::test]
    async fn test_internal_status_is_transient_after_retries() {
        let mut server = mockito::Server::new_async().await;
        let m = server
            .mock("POST", "/prod/verifyReceipt")
            .with_status(200)
            .with_body(json!({ "status": 21150 }).to_string())
            .expect(3)
            .create_async()
            .await;

        let err = provider(&server).validate(&request("1")).await.unwrap_err();
        assert!(err.is_transient());
        m.assert_async().await;
    }

    #[tokio::test]
    async fn test_bad_receipt_status_is_invalid() {
        let mut server = mockito::Server::new_async().await;
        let _m = server
            .mock("POST", "/prod/verifyReceipt")
            .with_status(200)
            .with_body(json!({ "status": 21003 }).to_string())
            .create_async()
            .await;

        let result = provider(&server).validate(&request("1")).await.unwrap();
        assert_eq!(result, Verification::invalid("App Store status 21003"));
    }

    #[tokio::test]
    async fn test_renewal_requires_expiry_in_future() {
        let mut server = mockito::Server::new_async().await;
        let now = OffsetDateTime::from_unix_timestamp(1_790_000_000).unwrap();
        let body = json!({
            "status": 0,
            "latest_receipt_info": [
                {
                    "original_transaction_id": "orig",
                    "transaction_id": "t1",
                    "expires_date_ms": ((now.unix_timestamp() - 10) * 1000).to_string()
                },
                {
                    "original_transaction_id": "orig",
                    "transaction_id": "t2",
                    "expires_date_ms": ((now.unix_timestamp() + 86_400) * 1000).to_string()
                }
            ]
        });
        let _m = server
            .mock("POST", "/prod/verifyReceipt")
            .with_status(200)
            .with_body(body.to_string())
            .create_async()
            .await;

        let renewal = RenewalRequest {
            subscription_id: Uuid::new_v4(),
            amount_cents: 2900,
            currency: "USD".into(),
            provider_product_id: None,
            external_ids: ExternalIds {
                apple_latest_receipt: Some("receipt".into()),
                apple_original_transaction_id: Some("orig".into()),
                ..Default::default()
            },
            previous_billing: None,
            due_at: now,
            attempt: 0,
            now,
        };
        let result = provider(&server).charge_renewal(&renewal).await.unwrap();
        assert!(matches!(result, Verification::Valid { ref external_id, .. } if external_id == "t2"));
    }
}
