//! Persistence seams for the billing core
//!
//! Every service talks to storage through these traits. `postgres` holds the
//! production implementations; `memory` holds `RwLock<HashMap>` versions used
//! by tests and local development. Both enforce the same atomicity rules:
//! payment transitions are compare-and-set on status, subscription writes are
//! compare-and-set on `version`, usage increments are a single conditional
//! update, and renewal claims never hand the same row to two sweeps.

pub mod memory;
pub mod postgres;

use async_trait::async_trait;
use coachpay_shared::{
    Pagination, PaymentMethod, PaymentStatus, PaymentType, Plan, SubscriberKind,
    SubscriptionStatus, BillingCycle,
};
use serde::Deserialize;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::error::BillingResult;
use crate::fees::FeeBreakdown;
use crate::models::{Payment, Product, Subscription};

pub use memory::{InMemoryPaymentRepository, InMemoryProductRepository, InMemorySubscriptionRepository};
pub use postgres::{PostgresPaymentRepository, PostgresProductRepository, PostgresSubscriptionRepository};

/// Filters for listing payments
#[derive(Debug, Clone, Default, Deserialize)]
pub struct PaymentFilter {
    pub payer_id: Option<Uuid>,
    pub payee_id: Option<Uuid>,
    pub subscription_id: Option<Uuid>,
    pub status: Option<PaymentStatus>,
    pub method: Option<PaymentMethod>,
    pub payment_type: Option<PaymentType>,
}

impl PaymentFilter {
    pub fn matches(&self, p: &Payment) -> bool {
        self.payer_id.map_or(true, |v| p.payer_id == v)
            && self.payee_id.map_or(true, |v| p.payee_id == Some(v))
            && self.subscription_id.map_or(true, |v| p.subscription_id == Some(v))
            && self.status.map_or(true, |v| p.status == v)
            && self.method.map_or(true, |v| p.method == v)
            && self.payment_type.map_or(true, |v| p.payment_type == v)
    }
}

/// Filters for listing subscriptions
#[derive(Debug, Clone, Default, Deserialize)]
pub struct SubscriptionFilter {
    pub kind: Option<SubscriberKind>,
    pub subscriber_id: Option<Uuid>,
    pub payee_id: Option<Uuid>,
    pub status: Option<SubscriptionStatus>,
    pub plan: Option<Plan>,
}

impl SubscriptionFilter {
    pub fn matches(&self, s: &Subscription) -> bool {
        self.kind.map_or(true, |v| s.kind == v)
            && self.subscriber_id.map_or(true, |v| s.subscriber_id == v)
            && self.payee_id.map_or(true, |v| s.payee_id == Some(v))
            && self.status.map_or(true, |v| s.status == v)
            && self.plan.map_or(true, |v| s.plan == v)
    }
}

/// The fields a status transition may write. Nothing else on a payment changes.
#[derive(Debug, Clone)]
pub struct PaymentTransition {
    pub to: PaymentStatus,
    pub at: OffsetDateTime,
    pub amount_cents: Option<i64>,
    pub fees: Option<FeeBreakdown>,
    pub external_transaction_id: Option<String>,
    pub validation_response: Option<serde_json::Value>,
    pub failure_reason: Option<String>,
    pub is_test: Option<bool>,
}

impl PaymentTransition {
    pub fn to(status: PaymentStatus, at: OffsetDateTime) -> Self {
        Self {
            to: status,
            at,
            amount_cents: None,
            fees: None,
            external_transaction_id: None,
            validation_response: None,
            failure_reason: None,
            is_test: None,
        }
    }

    pub fn failed(reason: impl Into<String>, at: OffsetDateTime) -> Self {
        Self {
            failure_reason: Some(reason.into()),
            ..Self::to(PaymentStatus::Failed, at)
        }
    }

    /// Apply this transition to an in-memory copy
    pub fn apply(&self, payment: &mut Payment) {
        payment.status = self.to;
        payment.updated_at = self.at;
        if let Some(amount) = self.amount_cents {
            payment.amount_cents = amount;
        }
        if let Some(fees) = self.fees {
            payment.apply_fees(fees);
        }
        if let Some(ext) = &self.external_transaction_id {
            payment.external_transaction_id = Some(ext.clone());
        }
        if let Some(raw) = &self.validation_response {
            payment.validation_response = Some(raw.clone());
        }
        if let Some(reason) = &self.failure_reason {
            payment.failure_reason = Some(reason.clone());
        }
        if let Some(is_test) = self.is_test {
            payment.is_test = is_test;
        }
        if self.to == PaymentStatus::Completed {
            payment.completed_at = Some(self.at);
        }
    }
}

/// Refund details written onto the original payment
#[derive(Debug, Clone)]
pub struct RefundRecord {
    pub amount_cents: i64,
    pub reason: Option<String>,
    pub at: OffsetDateTime,
    /// Linked ledger entry (type `refund`, `refund_of` = original)
    pub entry: Payment,
}

/// Outcome of an atomic usage increment
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UsageIncrement {
    Applied { used: i64, limit: i64 },
    Rejected { used: i64, limit: i64 },
    UnknownCapability,
}

#[async_trait]
pub trait PaymentRepository: Send + Sync {
    /// Insert a new payment
    async fn insert(&self, payment: &Payment) -> BillingResult<()>;

    async fn get(&self, id: Uuid) -> BillingResult<Option<Payment>>;

    /// Most recent payment for a purchase reference that has not failed,
    /// expired or been cancelled
    async fn find_by_reference(
        &self,
        payer_id: Uuid,
        method: PaymentMethod,
        provider_product_id: Option<&str>,
        reference: &str,
    ) -> BillingResult<Option<Payment>>;

    /// Completed (or refunded) payment holding a canonical provider id
    async fn find_completed_by_external_id(
        &self,
        method: PaymentMethod,
        external_transaction_id: &str,
    ) -> BillingResult<Option<Payment>>;

    /// Compare-and-set status change. Returns `None` when the stored status is
    /// not in `from` (another writer won or the transition is late).
    async fn transition(
        &self,
        id: Uuid,
        from: &[PaymentStatus],
        change: &PaymentTransition,
    ) -> BillingResult<Option<Payment>>;

    /// `completed -> refunded` plus insertion of the linked refund entry, as
    /// one atomic step. `None` when the payment is not completed.
    async fn refund(&self, id: Uuid, refund: &RefundRecord) -> BillingResult<Option<Payment>>;

    /// Move every pending payment whose `expires_at` is before `now` to `expired`
    async fn expire_pending(&self, now: OffsetDateTime) -> BillingResult<Vec<Payment>>;

    async fn list(
        &self,
        filter: &PaymentFilter,
        page: Pagination,
    ) -> BillingResult<(Vec<Payment>, i64)>;

    /// Completed or refunded payments to a payee within `[from, to)`
    async fn settled_for_payee(
        &self,
        payee_id: Uuid,
        from: OffsetDateTime,
        to: OffsetDateTime,
    ) -> BillingResult<Vec<Payment>>;
}

#[async_trait]
pub trait SubscriptionRepository: Send + Sync {
    /// Insert a new subscription; `AlreadyExists` when the subscriber already
    /// holds a non-terminal one (per payee for client subscriptions)
    async fn insert(&self, subscription: &Subscription) -> BillingResult<()>;

    async fn get(&self, id: Uuid) -> BillingResult<Option<Subscription>>;

    /// The non-terminal subscription for a subscriber (and payee, client kind)
    async fn find_current(
        &self,
        kind: SubscriberKind,
        subscriber_id: Uuid,
        payee_id: Option<Uuid>,
    ) -> BillingResult<Option<Subscription>>;

    /// Most recently created subscription of any status
    async fn find_latest(
        &self,
        kind: SubscriberKind,
        subscriber_id: Uuid,
        payee_id: Option<Uuid>,
    ) -> BillingResult<Option<Subscription>>;

    /// Write `subscription` if the stored version still equals
    /// `subscription.version`. Returns the stored row with the bumped version;
    /// `ConcurrentModification` otherwise.
    async fn update(&self, subscription: &Subscription) -> BillingResult<Subscription>;

    /// Atomically add `amount` to a usage counter unless that would exceed the
    /// captured limit. Bumps the version when applied.
    async fn increment_usage(
        &self,
        id: Uuid,
        capability: &str,
        amount: i64,
        at: OffsetDateTime,
    ) -> BillingResult<UsageIncrement>;

    /// Claim up to `limit` subscriptions due for billing at `now` and due no
    /// earlier than `not_before`: trial/active auto-renewing rows by
    /// `next_billing_date`, past-due rows by `next_retry_at`. Claimed rows are
    /// hidden from other sweeps until `claim_until`.
    async fn claim_due(
        &self,
        now: OffsetDateTime,
        not_before: OffsetDateTime,
        claim_until: OffsetDateTime,
        limit: i64,
    ) -> BillingResult<Vec<Subscription>>;

    /// Rows that are due but older than the lookback window
    async fn count_stale_due(
        &self,
        now: OffsetDateTime,
        not_before: OffsetDateTime,
    ) -> BillingResult<i64>;

    /// Drop a renewal claim so the next sweep can pick the row up again
    async fn release_claim(&self, id: Uuid) -> BillingResult<()>;

    /// Active subscriptions whose `end_date` has passed
    async fn list_ended(&self, now: OffsetDateTime, limit: i64) -> BillingResult<Vec<Subscription>>;

    async fn list(
        &self,
        filter: &SubscriptionFilter,
        page: Pagination,
    ) -> BillingResult<(Vec<Subscription>, i64)>;
}

#[async_trait]
pub trait ProductRepository: Send + Sync {
    async fn insert(&self, product: &Product) -> BillingResult<()>;

    async fn get(&self, id: Uuid) -> BillingResult<Option<Product>>;

    /// Active product for a (kind, plan, cycle) price point
    async fn find_plan(
        &self,
        kind: SubscriberKind,
        plan: Plan,
        cycle: BillingCycle,
    ) -> BillingResult<Option<Product>>;

    async fn find_by_store_id(
        &self,
        method: PaymentMethod,
        store_product_id: &str,
    ) -> BillingResult<Option<Product>>;

    async fn list(
        &self,
        kind: Option<SubscriberKind>,
        active_only: bool,
    ) -> BillingResult<Vec<Product>>;
}
