//! In-memory repositories
//!
//! Each repository keeps its rows in a `tokio::sync::RwLock<HashMap>` and
//! performs every check-then-write under one write guard, which gives the
//! same atomicity as the single-statement SQL in `postgres`.

use std::collections::HashMap;

use async_trait::async_trait;
use coachpay_shared::{
    BillingCycle, Pagination, PaymentMethod, PaymentStatus, PaymentType, Plan, SubscriberKind,
    SubscriptionStatus,
};
use time::OffsetDateTime;
use tokio::sync::RwLock;
use uuid::Uuid;

use super::{
    PaymentFilter, PaymentRepository, PaymentTransition, ProductRepository, RefundRecord,
    SubscriptionFilter, SubscriptionRepository, UsageIncrement,
};
use crate::error::{BillingError, BillingResult};
use crate::models::{Payment, Product, Subscription, UNLIMITED};

fn paginate<T: Clone>(rows: Vec<T>, page: Pagination) -> (Vec<T>, i64) {
    let page = page.normalized();
    let total = rows.len() as i64;
    let data = rows
        .into_iter()
        .skip(page.offset() as usize)
        .take(page.limit as usize)
        .collect();
    (data, total)
}

// =============================================================================
// Payments
// =============================================================================

#[derive(Debug, Default)]
pub struct InMemoryPaymentRepository {
    payments: RwLock<HashMap<Uuid, Payment>>,
}

impl InMemoryPaymentRepository {
    pub fn new() -> Self {
        Self::default()
    }
}

fn holds_external_id(p: &Payment, method: PaymentMethod, external_id: &str) -> bool {
    p.method == method
        && p.payment_type != PaymentType::Refund
        && matches!(p.status, PaymentStatus::Completed | PaymentStatus::Refunded)
        && p.external_transaction_id.as_deref() == Some(external_id)
}

#[async_trait]
impl PaymentRepository for InMemoryPaymentRepository {
    async fn insert(&self, payment: &Payment) -> BillingResult<()> {
        let mut payments = self.payments.write().await;
        if payments.contains_key(&payment.id) {
            return Err(BillingError::AlreadyExists(format!("payment {}", payment.id)));
        }
        payments.insert(payment.id, payment.clone());
        Ok(())
    }

    async fn get(&self, id: Uuid) -> BillingResult<Option<Payment>> {
        Ok(self.payments.read().await.get(&id).cloned())
    }

    async fn find_by_reference(
        &self,
        payer_id: Uuid,
        method: PaymentMethod,
        provider_product_id: Option<&str>,
        reference: &str,
    ) -> BillingResult<Option<Payment>> {
        let payments = self.payments.read().await;
        Ok(payments
            .values()
            .filter(|p| {
                p.payer_id == payer_id
                    && p.method == method
                    && p.provider_product_id.as_deref() == provider_product_id
                    && p.purchase_reference.as_deref() == Some(reference)
                    && !matches!(
                        p.status,
                        PaymentStatus::Failed | PaymentStatus::Expired | PaymentStatus::Cancelled
                    )
            })
            .max_by_key(|p| p.created_at)
            .cloned())
    }

    async fn find_completed_by_external_id(
        &self,
        method: PaymentMethod,
        external_transaction_id: &str,
    ) -> BillingResult<Option<Payment>> {
        let payments = self.payments.read().await;
        Ok(payments
            .values()
            .find(|p| holds_external_id(p, method, external_transaction_id))
            .cloned())
    }

    async fn transition(
        &self,
        id: Uuid,
        from: &[PaymentStatus],
        change: &PaymentTransition,
    ) -> BillingResult<Option<Payment>> {
        let mut payments = self.payments.write().await;

        if change.to == PaymentStatus::Completed {
            if let (Some(current), Some(ext)) =
                (payments.get(&id), change.external_transaction_id.as_deref())
            {
                let method = current.method;
                if payments
                    .values()
                    .any(|p| p.id != id && holds_external_id(p, method, ext))
                {
                    return Err(BillingError::AlreadyExists(format!(
                        "completed payment for {} transaction {}",
                        method, ext
                    )));
                }
            }
        }

        match payments.get_mut(&id) {
            Some(payment) if from.contains(&payment.status) => {
                change.apply(payment);
                Ok(Some(payment.clone()))
            }
            _ => Ok(None),
        }
    }

    async fn refund(&self, id: Uuid, refund: &RefundRecord) -> BillingResult<Option<Payment>> {
        let mut payments = self.payments.write().await;
        if payments.contains_key(&refund.entry.id) {
            return Err(BillingError::AlreadyExists(format!(
                "payment {}",
                refund.entry.id
            )));
        }
        let updated = match payments.get_mut(&id) {
            Some(payment) if payment.status == PaymentStatus::Completed => {
                payment.status = PaymentStatus::Refunded;
                payment.refunded_amount_cents = refund.amount_cents;
                payment.refund_reason = refund.reason.clone();
                payment.refunded_at = Some(refund.at);
                payment.updated_at = refund.at;
                payment.clone()
            }
            _ => return Ok(None),
        };
        payments.insert(refund.entry.id, refund.entry.clone());
        Ok(Some(updated))
    }

    async fn expire_pending(&self, now: OffsetDateTime) -> BillingResult<Vec<Payment>> {
        let mut payments = self.payments.write().await;
        let mut expired = Vec::new();
        for payment in payments.values_mut() {
            if payment.status == PaymentStatus::Pending
                && payment.expires_at.is_some_and(|at| at < now)
            {
                payment.status = PaymentStatus::Expired;
                payment.failure_reason = Some("Payment expired before completion".to_string());
                payment.updated_at = now;
                expired.push(payment.clone());
            }
        }
        Ok(expired)
    }

    async fn list(
        &self,
        filter: &PaymentFilter,
        page: Pagination,
    ) -> BillingResult<(Vec<Payment>, i64)> {
        let payments = self.payments.read().await;
        let mut rows: Vec<Payment> = payments.values().filter(|p| filter.matches(p)).cloned().collect();
        rows.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(b.id.cmp(&a.id)));
        Ok(paginate(rows, page))
    }

    async fn settled_for_payee(
        &self,
        payee_id: Uuid,
        from: OffsetDateTime,
        to: OffsetDateTime,
    ) -> BillingResult<Vec<Payment>> {
        let payments = self.payments.read().await;
        let mut rows: Vec<Payment> = payments
            .values()
            .filter(|p| {
                p.payee_id == Some(payee_id)
                    && p.payment_type != PaymentType::Refund
                    && matches!(p.status, PaymentStatus::Completed | PaymentStatus::Refunded)
                    && p.completed_at.is_some_and(|at| at >= from && at < to)
            })
            .cloned()
            .collect();
        rows.sort_by_key(|p| p.completed_at);
        Ok(rows)
    }
}

// =============================================================================
// Subscriptions
// =============================================================================

#[derive(Debug, Default)]
pub struct InMemorySubscriptionRepository {
    subscriptions: RwLock<HashMap<Uuid, Subscription>>,
}

impl InMemorySubscriptionRepository {
    pub fn new() -> Self {
        Self::default()
    }
}

fn same_holder(a: &Subscription, b: &Subscription) -> bool {
    a.kind == b.kind
        && a.subscriber_id == b.subscriber_id
        && (a.kind == SubscriberKind::Coach || a.payee_id == b.payee_id)
}

fn current_holder_conflict(
    rows: &HashMap<Uuid, Subscription>,
    candidate: &Subscription,
) -> Option<Uuid> {
    if candidate.status.is_terminal() {
        return None;
    }
    rows.values()
        .find(|s| s.id != candidate.id && !s.status.is_terminal() && same_holder(s, candidate))
        .map(|s| s.id)
}

#[async_trait]
impl SubscriptionRepository for InMemorySubscriptionRepository {
    async fn insert(&self, subscription: &Subscription) -> BillingResult<()> {
        let mut rows = self.subscriptions.write().await;
        if rows.contains_key(&subscription.id) {
            return Err(BillingError::AlreadyExists(format!(
                "subscription {}",
                subscription.id
            )));
        }
        if let Some(existing) = current_holder_conflict(&rows, subscription) {
            return Err(BillingError::AlreadyExists(format!(
                "subscriber {} already has subscription {}",
                subscription.subscriber_id, existing
            )));
        }
        rows.insert(subscription.id, subscription.clone());
        Ok(())
    }

    async fn get(&self, id: Uuid) -> BillingResult<Option<Subscription>> {
        Ok(self.subscriptions.read().await.get(&id).cloned())
    }

    async fn find_current(
        &self,
        kind: SubscriberKind,
        subscriber_id: Uuid,
        payee_id: Option<Uuid>,
    ) -> BillingResult<Option<Subscription>> {
        let rows = self.subscriptions.read().await;
        Ok(rows
            .values()
            .filter(|s| {
                s.kind == kind
                    && s.subscriber_id == subscriber_id
                    && (kind == SubscriberKind::Coach || s.payee_id == payee_id)
                    && !s.status.is_terminal()
            })
            .max_by_key(|s| s.created_at)
            .cloned())
    }

    async fn find_latest(
        &self,
        kind: SubscriberKind,
        subscriber_id: Uuid,
        payee_id: Option<Uuid>,
    ) -> BillingResult<Option<Subscription>> {
        let rows = self.subscriptions.read().await;
        Ok(rows
            .values()
            .filter(|s| {
                s.kind == kind
                    && s.subscriber_id == subscriber_id
                    && (kind == SubscriberKind::Coach || s.payee_id == payee_id)
            })
            .max_by_key(|s| s.created_at)
            .cloned())
    }

    async fn update(&self, subscription: &Subscription) -> BillingResult<Subscription> {
        let mut rows = self.subscriptions.write().await;
        let (stored_version, claim) = rows
            .get(&subscription.id)
            .map(|s| (s.version, s.renewal_claimed_until))
            .ok_or_else(|| BillingError::NotFound(format!("subscription {}", subscription.id)))?;
        if stored_version != subscription.version {
            return Err(BillingError::ConcurrentModification(format!(
                "subscription {} is at version {}, write was based on {}",
                subscription.id, stored_version, subscription.version
            )));
        }
        if let Some(existing) = current_holder_conflict(&rows, subscription) {
            return Err(BillingError::AlreadyExists(format!(
                "subscriber {} already has subscription {}",
                subscription.subscriber_id, existing
            )));
        }
        let mut next = subscription.clone();
        next.version += 1;
        next.renewal_claimed_until = claim;
        rows.insert(next.id, next.clone());
        Ok(next)
    }

    async fn increment_usage(
        &self,
        id: Uuid,
        capability: &str,
        amount: i64,
        at: OffsetDateTime,
    ) -> BillingResult<UsageIncrement> {
        let mut rows = self.subscriptions.write().await;
        let sub = rows
            .get_mut(&id)
            .ok_or_else(|| BillingError::NotFound(format!("subscription {}", id)))?;
        let Some(&limit) = sub.features.get(capability) else {
            return Ok(UsageIncrement::UnknownCapability);
        };
        let used = sub.usage.get(capability).copied().unwrap_or(0);
        let next = match used.checked_add(amount) {
            Some(next) if limit == UNLIMITED || next <= limit => next,
            _ => return Ok(UsageIncrement::Rejected { used, limit }),
        };
        let used = next;
        sub.usage.insert(capability.to_string(), used);
        sub.version += 1;
        sub.updated_at = at;
        Ok(UsageIncrement::Applied { used, limit })
    }

    async fn claim_due(
        &self,
        now: OffsetDateTime,
        not_before: OffsetDateTime,
        claim_until: OffsetDateTime,
        limit: i64,
    ) -> BillingResult<Vec<Subscription>> {
        let mut rows = self.subscriptions.write().await;
        let mut due: Vec<(OffsetDateTime, Uuid)> = rows
            .values()
            .filter(|s| s.renewal_claimed_until.map_or(true, |until| until <= now))
            .filter_map(|s| s.renewal_due_at().map(|at| (at, s.id)))
            .filter(|(at, _)| *at <= now && *at >= not_before)
            .collect();
        due.sort();

        let mut claimed = Vec::new();
        for (_, id) in due.into_iter().take(limit.max(0) as usize) {
            if let Some(sub) = rows.get_mut(&id) {
                sub.renewal_claimed_until = Some(claim_until);
                claimed.push(sub.clone());
            }
        }
        Ok(claimed)
    }

    async fn count_stale_due(
        &self,
        now: OffsetDateTime,
        not_before: OffsetDateTime,
    ) -> BillingResult<i64> {
        let rows = self.subscriptions.read().await;
        Ok(rows
            .values()
            .filter_map(Subscription::renewal_due_at)
            .filter(|at| *at <= now && *at < not_before)
            .count() as i64)
    }

    async fn release_claim(&self, id: Uuid) -> BillingResult<()> {
        if let Some(sub) = self.subscriptions.write().await.get_mut(&id) {
            sub.renewal_claimed_until = None;
        }
        Ok(())
    }

    async fn list_ended(&self, now: OffsetDateTime, limit: i64) -> BillingResult<Vec<Subscription>> {
        let rows = self.subscriptions.read().await;
        let mut ended: Vec<Subscription> = rows
            .values()
            .filter(|s| {
                matches!(s.status, SubscriptionStatus::Active | SubscriptionStatus::Trial)
                    && s.end_date.is_some_and(|end| end <= now)
            })
            .cloned()
            .collect();
        ended.sort_by_key(|s| s.end_date);
        ended.truncate(limit.max(0) as usize);
        Ok(ended)
    }

    async fn list(
        &self,
        filter: &SubscriptionFilter,
        page: Pagination,
    ) -> BillingResult<(Vec<Subscription>, i64)> {
        let rows = self.subscriptions.read().await;
        let mut matched: Vec<Subscription> =
            rows.values().filter(|s| filter.matches(s)).cloned().collect();
        matched.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(b.id.cmp(&a.id)));
        Ok(paginate(matched, page))
    }
}

// =============================================================================
// Products
// =============================================================================

#[derive(Debug, Default)]
pub struct InMemoryProductRepository {
    products: RwLock<HashMap<Uuid, Product>>,
}

impl InMemoryProductRepository {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ProductRepository for InMemoryProductRepository {
    async fn insert(&self, product: &Product) -> BillingResult<()> {
        let mut products = self.products.write().await;
        let duplicate = products.values().any(|p| {
            p.id == product.id
                || (p.is_active
                    && product.is_active
                    && p.kind == product.kind
                    && p.plan == product.plan
                    && p.billing_cycle == product.billing_cycle)
        });
        if duplicate {
            return Err(BillingError::AlreadyExists(format!(
                "product {}/{}/{}",
                product.kind, product.plan, product.billing_cycle
            )));
        }
        products.insert(product.id, product.clone());
        Ok(())
    }

    async fn get(&self, id: Uuid) -> BillingResult<Option<Product>> {
        Ok(self.products.read().await.get(&id).cloned())
    }

    async fn find_plan(
        &self,
        kind: SubscriberKind,
        plan: Plan,
        cycle: BillingCycle,
    ) -> BillingResult<Option<Product>> {
        let products = self.products.read().await;
        Ok(products
            .values()
            .find(|p| p.is_active && p.kind == kind && p.plan == plan && p.billing_cycle == cycle)
            .cloned())
    }

    async fn find_by_store_id(
        &self,
        method: PaymentMethod,
        store_product_id: &str,
    ) -> BillingResult<Option<Product>> {
        let products = self.products.read().await;
        Ok(products
            .values()
            .find(|p| p.store_ids.for_method(method) == Some(store_product_id))
            .cloned())
    }

    async fn list(
        &self,
        kind: Option<SubscriberKind>,
        active_only: bool,
    ) -> BillingResult<Vec<Product>> {
        let products = self.products.read().await;
        let mut rows: Vec<Product> = products
            .values()
            .filter(|p| kind.map_or(true, |k| p.kind == k) && (!active_only || p.is_active))
            .cloned()
            .collect();
        rows.sort_by(|a, b| {
            a.kind
                .as_str()
                .cmp(b.kind.as_str())
                .then(a.price_cents.cmp(&b.price_cents))
        });
        Ok(rows)
    }
}
