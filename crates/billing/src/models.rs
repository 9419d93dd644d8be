//! Persistent billing records

use std::collections::BTreeMap;

use coachpay_shared::{
    BillingCycle, CancelledBy, PaymentMethod, PaymentStatus, PaymentType, Plan, SubscriberKind,
    SubscriptionStatus,
};
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use uuid::Uuid;

use crate::fees::FeeBreakdown;

/// Capability -> quota (`-1` = unlimited)
pub type FeatureTable = BTreeMap<String, i64>;

/// Capability -> amount consumed in the current period
pub type UsageSnapshot = BTreeMap<String, i64>;

/// Quota value meaning "no limit"
pub const UNLIMITED: i64 = -1;

/// Store-side identifiers of a product, one per rail
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoreProductIds {
    #[serde(default)]
    pub apple_product_id: Option<String>,
    #[serde(default)]
    pub google_product_id: Option<String>,
    #[serde(default)]
    pub stripe_price_id: Option<String>,
    #[serde(default)]
    pub paypal_plan_id: Option<String>,
}

impl StoreProductIds {
    pub fn for_method(&self, method: PaymentMethod) -> Option<&str> {
        match method {
            PaymentMethod::AppleIap => self.apple_product_id.as_deref(),
            PaymentMethod::GooglePlay => self.google_product_id.as_deref(),
            PaymentMethod::Card => self.stripe_price_id.as_deref(),
            PaymentMethod::Paypal => self.paypal_plan_id.as_deref(),
        }
    }
}

/// Provider references a subscription is renewed against
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExternalIds {
    #[serde(default)]
    pub apple_original_transaction_id: Option<String>,
    #[serde(default)]
    pub apple_latest_receipt: Option<String>,
    #[serde(default)]
    pub google_purchase_token: Option<String>,
    #[serde(default)]
    pub stripe_customer_id: Option<String>,
    #[serde(default)]
    pub stripe_payment_method_id: Option<String>,
    #[serde(default)]
    pub paypal_subscription_id: Option<String>,
}

impl ExternalIds {
    /// Overlay the fields set in `other`
    pub fn merge(&mut self, other: ExternalIds) {
        macro_rules! take {
            ($($field:ident),*) => {
                $(if other.$field.is_some() { self.$field = other.$field; })*
            };
        }
        take!(
            apple_original_transaction_id,
            apple_latest_receipt,
            google_purchase_token,
            stripe_customer_id,
            stripe_payment_method_id,
            paypal_subscription_id
        );
    }
}

/// One entry of a subscription's append-only plan history
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlanChange {
    pub from_plan: Plan,
    pub to_plan: Plan,
    pub from_cycle: BillingCycle,
    pub to_cycle: BillingCycle,
    pub from_price_cents: i64,
    pub to_price_cents: i64,
    #[serde(with = "time::serde::rfc3339")]
    pub changed_at: OffsetDateTime,
}

/// Catalog product: one (kind, plan, cycle) price point
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, sqlx::FromRow)]
pub struct Product {
    pub id: Uuid,
    pub kind: SubscriberKind,
    pub plan: Plan,
    pub billing_cycle: BillingCycle,
    pub name: String,
    pub description: Option<String>,
    pub price_cents: i64,
    pub currency: String,
    #[sqlx(json)]
    pub store_ids: StoreProductIds,
    #[sqlx(json)]
    pub features: FeatureTable,
    pub trial_days: Option<i32>,
    pub is_active: bool,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub updated_at: OffsetDateTime,
}

/// A recurring subscription, coach or client flavour
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, sqlx::FromRow)]
pub struct Subscription {
    pub id: Uuid,
    pub kind: SubscriberKind,
    pub subscriber_id: Uuid,
    /// Coach being paid (client kind only)
    pub payee_id: Option<Uuid>,
    pub product_id: Option<Uuid>,
    pub plan: Plan,
    pub status: SubscriptionStatus,
    pub billing_cycle: BillingCycle,
    pub price_cents: i64,
    pub currency: String,
    pub commission_rate_bps: Option<i64>,
    pub payment_method: Option<PaymentMethod>,
    #[serde(with = "time::serde::rfc3339")]
    pub start_date: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339::option")]
    pub trial_end: Option<OffsetDateTime>,
    #[serde(with = "time::serde::rfc3339::option")]
    pub next_billing_date: Option<OffsetDateTime>,
    #[serde(with = "time::serde::rfc3339::option")]
    pub last_billing_date: Option<OffsetDateTime>,
    #[serde(with = "time::serde::rfc3339::option")]
    pub current_period_start: Option<OffsetDateTime>,
    #[serde(with = "time::serde::rfc3339::option")]
    pub current_period_end: Option<OffsetDateTime>,
    #[serde(with = "time::serde::rfc3339::option")]
    pub end_date: Option<OffsetDateTime>,
    pub auto_renew: bool,
    #[serde(with = "time::serde::rfc3339::option")]
    pub cancelled_at: Option<OffsetDateTime>,
    pub cancellation_reason: Option<String>,
    pub cancelled_by: Option<CancelledBy>,
    #[serde(with = "time::serde::rfc3339::option")]
    pub paused_at: Option<OffsetDateTime>,
    pub failed_payment_attempts: i32,
    #[serde(with = "time::serde::rfc3339::option")]
    pub next_retry_at: Option<OffsetDateTime>,
    #[sqlx(json)]
    pub features: FeatureTable,
    #[sqlx(json)]
    pub usage: UsageSnapshot,
    #[sqlx(json)]
    pub external_ids: ExternalIds,
    #[sqlx(json)]
    pub upgrade_history: Vec<PlanChange>,
    #[serde(skip)]
    pub renewal_claimed_until: Option<OffsetDateTime>,
    pub version: i64,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub updated_at: OffsetDateTime,
}

impl Subscription {
    /// Whether the subscriber currently has access to plan features
    pub fn grants_access(&self, now: OffsetDateTime) -> bool {
        match self.status {
            SubscriptionStatus::Trial => self.trial_end.map_or(true, |end| end > now),
            SubscriptionStatus::Active => self.end_date.map_or(true, |end| end > now),
            // Grace while dunning retries are pending
            SubscriptionStatus::PastDue => true,
            SubscriptionStatus::Cancelled => self.end_date.is_some_and(|end| end > now),
            SubscriptionStatus::Pending
            | SubscriptionStatus::Paused
            | SubscriptionStatus::Expired => false,
        }
    }

    /// When the renewal sweep should next bill this subscription: trial and
    /// active rows at `next_billing_date`, past-due rows at `next_retry_at`.
    /// Only auto-renewing rows are ever due.
    pub fn renewal_due_at(&self) -> Option<OffsetDateTime> {
        if !self.auto_renew {
            return None;
        }
        match self.status {
            SubscriptionStatus::Trial | SubscriptionStatus::Active => self.next_billing_date,
            SubscriptionStatus::PastDue => self.next_retry_at,
            _ => None,
        }
    }

    /// Zeroed counters matching the feature table's keys
    pub fn zero_usage(features: &FeatureTable) -> UsageSnapshot {
        features.keys().map(|k| (k.clone(), 0)).collect()
    }

    /// Keep consumed amounts for capabilities still present, add new ones at zero
    pub fn reconcile_usage(features: &FeatureTable, usage: &UsageSnapshot) -> UsageSnapshot {
        features
            .keys()
            .map(|k| (k.clone(), usage.get(k).copied().unwrap_or(0)))
            .collect()
    }
}

/// One entry of the payment ledger
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, sqlx::FromRow)]
pub struct Payment {
    pub id: Uuid,
    pub payer_id: Uuid,
    pub payee_id: Option<Uuid>,
    pub method: PaymentMethod,
    pub payment_type: PaymentType,
    pub status: PaymentStatus,
    pub amount_cents: i64,
    pub currency: String,
    pub platform_fee_cents: i64,
    pub service_fee_cents: i64,
    pub net_amount_cents: i64,
    pub platform_commission_cents: i64,
    pub payee_earnings_cents: i64,
    pub commission_rate_bps: Option<i64>,
    /// Reference supplied with the purchase (receipt transaction id, purchase
    /// token, intent id, order id); the idempotency key for submissions
    pub purchase_reference: Option<String>,
    /// Canonical provider transaction id, set on completion
    pub external_transaction_id: Option<String>,
    pub provider_product_id: Option<String>,
    pub subscription_id: Option<Uuid>,
    pub product_id: Option<Uuid>,
    pub refund_of: Option<Uuid>,
    pub refunded_amount_cents: i64,
    pub refund_reason: Option<String>,
    #[serde(with = "time::serde::rfc3339::option")]
    pub refunded_at: Option<OffsetDateTime>,
    #[serde(skip_serializing)]
    pub provider_payload: Option<serde_json::Value>,
    pub validation_response: Option<serde_json::Value>,
    pub failure_reason: Option<String>,
    #[serde(with = "time::serde::rfc3339::option")]
    pub expires_at: Option<OffsetDateTime>,
    #[serde(with = "time::serde::rfc3339::option")]
    pub completed_at: Option<OffsetDateTime>,
    pub is_test: bool,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub updated_at: OffsetDateTime,
}

impl Payment {
    pub fn fees(&self) -> FeeBreakdown {
        FeeBreakdown {
            platform_fee_cents: self.platform_fee_cents,
            service_fee_cents: self.service_fee_cents,
            net_amount_cents: self.net_amount_cents,
            platform_commission_cents: self.platform_commission_cents,
            payee_earnings_cents: self.payee_earnings_cents,
        }
    }

    pub(crate) fn apply_fees(&mut self, fees: FeeBreakdown) {
        self.platform_fee_cents = fees.platform_fee_cents;
        self.service_fee_cents = fees.service_fee_cents;
        self.net_amount_cents = fees.net_amount_cents;
        self.platform_commission_cents = fees.platform_commission_cents;
        self.payee_earnings_cents = fees.payee_earnings_cents;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reconcile_usage_keeps_consumed_and_drops_removed() {
        let features: FeatureTable = [("sessions".to_string(), 10), ("plans".to_string(), -1)]
            .into_iter()
            .collect();
        let usage: UsageSnapshot = [("sessions".to_string(), 4), ("messages".to_string(), 9)]
            .into_iter()
            .collect();
        let reconciled = Subscription::reconcile_usage(&features, &usage);
        assert_eq!(reconciled.get("sessions"), Some(&4));
        assert_eq!(reconciled.get("plans"), Some(&0));
        assert!(!reconciled.contains_key("messages"));
    }

    #[test]
    fn test_external_ids_merge() {
        let mut ids = ExternalIds {
            stripe_customer_id: Some("cus_1".into()),
            ..Default::default()
        };
        ids.merge(ExternalIds {
            stripe_payment_method_id: Some("pm_1".into()),
            ..Default::default()
        });
        assert_eq!(ids.stripe_customer_id.as_deref(), Some("cus_1"));
        assert_eq!(ids.stripe_payment_method_id.as_deref(), Some("pm_1"));
    }
}
