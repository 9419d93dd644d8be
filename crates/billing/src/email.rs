//! Email notifications for billing events
//!
//! Sends transactional emails via Resend API. Delivery is best effort: a
//! failed send is logged and never fails the billing operation that caused it.

use std::sync::Arc;

use async_trait::async_trait;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::directory::UserDirectory;
use crate::models::{Payment, Subscription};

/// Billing events subscribers are told about
#[derive(Debug, Clone)]
pub enum BillingEvent {
    PaymentCompleted {
        payment: Payment,
    },
    PaymentFailed {
        payment: Payment,
        reason: String,
    },
    SubscriptionCancelled {
        subscription: Subscription,
    },
    RenewalFailed {
        subscription: Subscription,
        reason: String,
        next_retry_at: Option<OffsetDateTime>,
    },
}

impl BillingEvent {
    /// User the event is addressed to
    pub fn recipient(&self) -> Uuid {
        match self {
            BillingEvent::PaymentCompleted { payment } => payment.payer_id,
            BillingEvent::PaymentFailed { payment, .. } => payment.payer_id,
            BillingEvent::SubscriptionCancelled { subscription } => subscription.subscriber_id,
            BillingEvent::RenewalFailed { subscription, .. } => subscription.subscriber_id,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            BillingEvent::PaymentCompleted { .. } => "payment_completed",
            BillingEvent::PaymentFailed { .. } => "payment_failed",
            BillingEvent::SubscriptionCancelled { .. } => "subscription_cancelled",
            BillingEvent::RenewalFailed { .. } => "renewal_failed",
        }
    }
}

/// Best-effort outbound notifications
#[async_trait]
pub trait Notifier: Send + Sync {
    /// Deliver one event. Implementations log failures instead of returning them.
    async fn notify(&self, event: BillingEvent);
}

/// Drops every event
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopNotifier;

#[async_trait]
impl Notifier for NoopNotifier {
    async fn notify(&self, event: BillingEvent) {
        tracing::debug!(event = event.name(), "Notification dropped (notifier disabled)");
    }
}

/// Email configuration
#[derive(Debug, Clone)]
pub struct EmailConfig {
    /// Resend API key
    pub resend_api_key: String,
    /// From address for emails
    pub email_from: String,
    /// App name for branding
    pub app_name: String,
    /// Support email
    pub support_email: String,
    /// App URL used for "manage billing" links
    pub app_url: String,
    /// Resend API base URL
    pub api_url: String,
}

impl EmailConfig {
    /// Create config from environment variables
    pub fn from_env() -> Self {
        Self {
            resend_api_key: std::env::var("RESEND_API_KEY").unwrap_or_default(),
            email_from: std::env::var("EMAIL_FROM")
                .unwrap_or_else(|_| "CoachPay <billing@coachpay.app>".to_string()),
            app_name: std::env::var("APP_NAME").unwrap_or_else(|_| "CoachPay".to_string()),
            support_email: std::env::var("SUPPORT_EMAIL")
                .unwrap_or_else(|_| "support@coachpay.app".to_string()),
            app_url: std::env::var("PUBLIC_URL")
                .unwrap_or_else(|_| "https://coachpay.app".to_string()),
            api_url: std::env::var("RESEND_API_URL")
                .unwrap_or_else(|_| "https://api.resend.com".to_string()),
        }
    }

    /// Check if email sending is enabled
    pub fn is_enabled(&self) -> bool {
        !self.resend_api_key.is_empty()
    }
}

/// Sends billing emails to the user an event concerns
pub struct EmailNotifier {
    config: EmailConfig,
    client: reqwest::Client,
    directory: Arc<dyn UserDirectory>,
}

fn money(cents: i64, currency: &str) -> String {
    format!("{}.{:02} {}", cents / 100, (cents % 100).abs(), currency)
}

impl EmailNotifier {
    pub fn new(config: EmailConfig, directory: Arc<dyn UserDirectory>) -> Self {
        Self {
            config,
            client: reqwest::Client::new(),
            directory,
        }
    }

    /// Subject and body for an event
    fn render(&self, event: &BillingEvent) -> (String, String) {
        let app = &self.config.app_name;
        let (subject, heading, body) = match event {
            BillingEvent::PaymentCompleted { payment } => (
                format!("Payment received - {}", app),
                "Payment received",
                format!(
                    "We received your payment of <strong>{}</strong>. Thank you!",
                    money(payment.amount_cents, &payment.currency)
                ),
            ),
            BillingEvent::PaymentFailed { payment, reason } => (
                format!("Payment failed - {}", app),
                "Payment failed",
                format!(
                    "We could not process your payment of <strong>{}</strong>.<br>Reason: {}",
                    money(payment.amount_cents, &payment.currency),
                    reason
                ),
            ),
            BillingEvent::SubscriptionCancelled { subscription } => {
                let access = subscription
                    .end_date
                    .map(|end| format!(" You keep access until {}.", end.date()))
                    .unwrap_or_default();
                (
                    format!("Subscription cancelled - {}", app),
                    "Subscription cancelled",
                    format!(
                        "Your <strong>{}</strong> subscription has been cancelled.{}",
                        subscription.plan, access
                    ),
                )
            }
            BillingEvent::RenewalFailed {
                subscription,
                reason,
                next_retry_at,
            } => {
                let retry = next_retry_at
                    .map(|at| format!(" We will try again on {}.", at.date()))
                    .unwrap_or_default();
                (
                    format!("Action needed: renewal failed - {}", app),
                    "Renewal failed",
                    format!(
                        "We could not renew your <strong>{}</strong> subscription ({}).{} \
                         Please update your payment method.",
                        subscription.plan,
                        money(subscription.price_cents, &subscription.currency),
                        retry
                    ) + &format!("<br>Reason: {}", reason),
                )
            }
        };

        let html = format!(
            r#"<!DOCTYPE html>
<html>
<head><meta charset="utf-8"></head>
<body style="font-family: -apple-system, BlinkMacSystemFont, 'Segoe UI', Roboto, sans-serif; line-height: 1.6; color: #333; max-width: 600px; margin: 0 auto; padding: 20px;">
    <h2>{heading}</h2>
    <p>{body}</p>
    <p><a href="{app_url}/billing">Manage billing</a></p>
    <p style="color: #666; font-size: 14px;">
        Questions? Contact us at <a href="mailto:{support}">{support}</a>
    </p>
    <p style="color: #999; font-size: 12px;">{app}</p>
</body>
</html>"#,
            heading = heading,
            body = body,
            app_url = self.config.app_url,
            support = self.config.support_email,
            app = app,
        );
        (subject, html)
    }

    /// Send an email via Resend API. Returns whether it was accepted.
    async fn send_email(&self, to: &str, subject: &str, html: &str) -> bool {
        if !self.config.is_enabled() {
            tracing::warn!(to = %to, subject = %subject, "Email not configured, skipping");
            return false;
        }

        let body = serde_json::json!({
            "from": self.config.email_from,
            "to": [to],
            "subject": subject,
            "html": html
        });

        let response = self
            .client
            .post(format!("{}/emails", self.config.api_url.trim_end_matches('/')))
            .bearer_auth(&self.config.resend_api_key)
            .json(&body)
            .send()
            .await;

        match response {
            Ok(resp) if resp.status().is_success() => {
                tracing::info!(to = %to, subject = %subject, "Billing email sent");
                true
            }
            Ok(resp) => {
                let status = resp.status();
                let body = resp.text().await.unwrap_or_default();
                tracing::error!(
                    to = %to,
                    subject = %subject,
                    status = %status,
                    body = %body,
                    "Failed to send billing email - non-fatal"
                );
                false
            }
            Err(e) => {
                tracing::error!(
                    to = %to,
                    subject = %subject,
                    error = %e,
                    "Failed to send billing email - non-fatal"
                );
                false
            }
        }
    }
}

#[async_trait]
impl Notifier for EmailNotifier {
    async fn notify(&self, event: BillingEvent) {
        let user_id = event.recipient();
        let user = match self.directory.get_user(user_id).await {
            Ok(Some(user)) => user,
            Ok(None) => {
                tracing::warn!(user_id = %user_id, event = event.name(), "No profile for notification recipient");
                return;
            }
            Err(e) => {
                tracing::error!(user_id = %user_id, error = %e, "Failed to load notification recipient");
                return;
            }
        };
        let (subject, html) = self.render(&event);
        self.send_email(&user.email, &subject, &html).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::directory::InMemoryUserDirectory;
    use coachpay_shared::UserRole;

    fn config(api_url: String, key: &str) -> EmailConfig {
        EmailConfig {
            resend_api_key: key.to_string(),
            email_from: "CoachPay <billing@coachpay.app>".into(),
            app_name: "CoachPay".into(),
            support_email: "support@coachpay.app".into(),
            app_url: "https://coachpay.app".into(),
            api_url,
        }
    }

    #[test]
    fn test_money_formatting() {
        assert_eq!(money(8900, "USD"), "89.00 USD");
        assert_eq!(money(5, "EUR"), "0.05 EUR");
    }

    #[tokio::test]
    async fn test_send_is_skipped_without_api_key() {
        let directory = Arc::new(InMemoryUserDirectory::new());
        let notifier = EmailNotifier::new(config("http://127.0.0.1:9".into(), ""), directory);
        assert!(!notifier.send_email("a@b.c", "subject", "<p>x</p>").await);
    }

    #[tokio::test]
    async fn test_provider_failure_is_swallowed() {
        let mut server = mockito::Server::new_async().await;
        let m = server
            .mock("POST", "/emails")
            .match_header("authorization", "Bearer re_test")
            .with_status(500)
            .create_async()
            .await;

        let directory = Arc::new(InMemoryUserDirectory::new());
        let coach = directory.add(UserRole::Coach, "coach@example.com").await;
        let notifier = EmailNotifier::new(config(server.url(), "re_test"), directory);

        let sub = crate::testing::subscription_fixture(coach.id);
        notifier
            .notify(BillingEvent::SubscriptionCancelled { subscription: sub })
            .await;
        m.assert_async().await;
    }
}
