//! Billing invariants checker
//!
//! Scans stored payments and subscriptions for states the billing core
//! should never produce. Read-only; the admin endpoint and the worker's
//! nightly job report what it finds.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use coachpay_shared::{
    Clock, PaymentStatus, PaymentType, Pagination, SubscriptionStatus, MAX_PAGE_SIZE,
};
use serde::Serialize;
use time::Duration;
use uuid::Uuid;

use crate::error::BillingResult;
use crate::models::{Payment, Subscription, UNLIMITED};
use crate::store::{PaymentFilter, PaymentRepository, SubscriptionFilter, SubscriptionRepository};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum InvariantKind {
    /// amount = platform fee + service fee + net, net >= 0
    FeeBalance,
    /// Two settled payments share a provider transaction
    DuplicateTransaction,
    /// Refunded payment without a matching refund entry
    RefundLink,
    /// Active auto-renewing subscription without a future billing date
    NextBillingDate,
    /// Usage keys differ from feature keys
    UsageKeys,
    /// Usage above a finite limit
    UsageLimit,
    /// More than one non-terminal subscription for the same holder
    CurrentSubscription,
    /// Cancelled subscription without a cancellation time
    CancellationRecord,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Violation {
    pub kind: InvariantKind,
    pub entity_id: Uuid,
    pub detail: String,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct InvariantReport {
    pub payments_checked: usize,
    pub subscriptions_checked: usize,
    pub violations: Vec<Violation>,
}

impl InvariantReport {
    pub fn is_clean(&self) -> bool {
        self.violations.is_empty()
    }
}

pub struct InvariantChecker {
    payments: Arc<dyn PaymentRepository>,
    subscriptions: Arc<dyn SubscriptionRepository>,
    clock: Arc<dyn Clock>,
    /// How long a due subscription may wait for the sweep before it counts
    renewal_tolerance: Duration,
}

impl InvariantChecker {
    pub fn new(
        payments: Arc<dyn PaymentRepository>,
        subscriptions: Arc<dyn SubscriptionRepository>,
        clock: Arc<dyn Clock>,
        renewal_tolerance: Duration,
    ) -> Self {
        Self {
            payments,
            subscriptions,
            clock,
            renewal_tolerance,
        }
    }

    pub async fn run(&self) -> BillingResult<InvariantReport> {
        let payments = self.all_payments().await?;
        let subscriptions = self.all_subscriptions().await?;

        let mut violations = check_payments(&payments);
        violations.extend(self.check_subscriptions(&subscriptions));

        if violations.is_empty() {
            tracing::info!(
                payments = payments.len(),
                subscriptions = subscriptions.len(),
                "Billing invariants hold"
            );
        } else {
            for v in &violations {
                tracing::error!(
                    kind = ?v.kind,
                    entity_id = %v.entity_id,
                    detail = %v.detail,
                    "Billing invariant violated"
                );
            }
        }

        Ok(InvariantReport {
            payments_checked: payments.len(),
            subscriptions_checked: subscriptions.len(),
            violations,
        })
    }

    async fn all_payments(&self) -> BillingResult<Vec<Payment>> {
        let filter = PaymentFilter::default();
        let mut all = Vec::new();
        for page in 1.. {
            let (rows, total) = self
                .payments
                .list(&filter, Pagination::new(page, MAX_PAGE_SIZE))
                .await?;
            let done = rows.is_empty() || all.len() + rows.len() >= usize::try_from(total).unwrap_or(0);
            all.extend(rows);
            if done {
                break;
            }
        }
        Ok(all)
    }

    async fn all_subscriptions(&self) -> BillingResult<Vec<Subscription>> {
        let filter = SubscriptionFilter::default();
        let mut all = Vec::new();
        for page in 1.. {
            let (rows, total) = self
                .subscriptions
                .list(&filter, Pagination::new(page, MAX_PAGE_SIZE))
                .await?;
            let done = rows.is_empty() || all.len() + rows.len() >= usize::try_from(total).unwrap_or(0);
            all.extend(rows);
            if done {
                break;
            }
        }
        Ok(all)
    }

    fn check_subscriptions(&self, subscriptions: &[Subscription]) -> Vec<Violation> {
        let now = self.clock.now();
        let mut violations = Vec::new();
        let mut holders: HashMap<(String, Uuid, Option<Uuid>), Uuid> = HashMap::new();

        for s in subscriptions {
            if s.status == SubscriptionStatus::Active && s.auto_renew {
                let ok = s
                    .next_billing_date
                    .is_some_and(|d| d + self.renewal_tolerance > now);
                if !ok {
                    violations.push(Violation {
                        kind: InvariantKind::NextBillingDate,
                        entity_id: s.id,
                        detail: format!("next_billing_date is {:?}", s.next_billing_date),
                    });
                }
            }

            let feature_keys: Vec<_> = s.features.keys().collect();
            let usage_keys: Vec<_> = s.usage.keys().collect();
            if feature_keys != usage_keys {
                violations.push(Violation {
                    kind: InvariantKind::UsageKeys,
                    entity_id: s.id,
                    detail: format!("features {:?}, usage {:?}", feature_keys, usage_keys),
                });
            }

            for (capability, &limit) in &s.features {
                let used = s.usage.get(capability).copied().unwrap_or(0);
                if limit != UNLIMITED && used > limit {
                    violations.push(Violation {
                        kind: InvariantKind::UsageLimit,
                        entity_id: s.id,
                        detail: format!("{} used {} of {}", capability, used, limit),
                    });
                }
            }

            if s.status == SubscriptionStatus::Cancelled && s.cancelled_at.is_none() {
                violations.push(Violation {
                    kind: InvariantKind::CancellationRecord,
                    entity_id: s.id,
                    detail: "cancelled without cancelled_at".to_string(),
                });
            }

            if !s.status.is_terminal() {
                let key = (s.kind.to_string(), s.subscriber_id, s.payee_id);
                if let Some(other) = holders.insert(key, s.id) {
                    violations.push(Violation {
                        kind: InvariantKind::CurrentSubscription,
                        entity_id: s.id,
                        detail: format!("subscriber also holds {}", other),
                    });
                }
            }
        }
        violations
    }
}

fn check_payments(payments: &[Payment]) -> Vec<Violation> {
    let mut violations = Vec::new();
    let mut seen_external: HashSet<(String, String)> = HashSet::new();
    let refund_entries: HashMap<Uuid, i64> = payments
        .iter()
        .filter(|p| p.payment_type == PaymentType::Refund)
        .filter_map(|p| p.refund_of.map(|of| (of, p.amount_cents)))
        .collect();

    for p in payments {
        let settled = matches!(p.status, PaymentStatus::Completed | PaymentStatus::Refunded);
        if !settled {
            continue;
        }

        let sum = p.platform_fee_cents + p.service_fee_cents + p.net_amount_cents;
        if sum != p.amount_cents || p.net_amount_cents < 0 {
            violations.push(Violation {
                kind: InvariantKind::FeeBalance,
                entity_id: p.id,
                detail: format!(
                    "amount {} != {} + {} + {}",
                    p.amount_cents, p.platform_fee_cents, p.service_fee_cents, p.net_amount_cents
                ),
            });
        }

        if let Some(ext) = &p.external_transaction_id {
            if !seen_external.insert((p.method.to_string(), ext.clone())) {
                violations.push(Violation {
                    kind: InvariantKind::DuplicateTransaction,
                    entity_id: p.id,
                    detail: format!("{} transaction {} settled twice", p.method, ext),
                });
            }
        }

        if p.status == PaymentStatus::Refunded
            && refund_entries.get(&p.id) != Some(&p.refunded_amount_cents)
        {
            violations.push(Violation {
                kind: InvariantKind::RefundLink,
                entity_id: p.id,
                detail: format!(
                    "refunded {} but refund entry is {:?}",
                    p.refunded_amount_cents,
                    refund_entries.get(&p.id)
                ),
            });
        }
    }
    violations
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{InMemoryPaymentRepository, InMemorySubscriptionRepository};
    use crate::testing::subscription_fixture;
    use coachpay_shared::FakeClock;
    use time::macros::datetime;

    fn checker(subs: Arc<InMemorySubscriptionRepository>) -> InvariantChecker {
        InvariantChecker::new(
            Arc::new(InMemoryPaymentRepository::new()),
            subs,
            Arc::new(FakeClock::new(datetime!(2026-01-20 10:00 UTC))),
            Duration::days(1),
        )
    }

    #[tokio::test]
    async fn test_clean_store_passes() {
        let subs = Arc::new(InMemorySubscriptionRepository::new());
        subs.insert(&subscription_fixture(Uuid::new_v4()))
            .await
            .unwrap();
        let report = checker(subs).run().await.unwrap();
        assert!(report.is_clean(), "{:?}", report.violations);
        assert_eq!(report.subscriptions_checked, 1);
    }

    #[tokio::test]
    async fn test_detects_overused_and_overdue_subscription() {
        let subs = Arc::new(InMemorySubscriptionRepository::new());
        let mut sub = subscription_fixture(Uuid::new_v4());
        sub.usage.insert("clients".into(), 11);
        sub.next_billing_date = Some(datetime!(2026-01-10 10:00 UTC));
        subs.insert(&sub).await.unwrap();

        let report = checker(subs).run().await.unwrap();
        let kinds: HashSet<_> = report.violations.iter().map(|v| v.kind).collect();
        assert!(kinds.contains(&InvariantKind::UsageLimit));
        assert!(kinds.contains(&InvariantKind::NextBillingDate));
    }

    #[test]
    fn test_detects_unbalanced_payment() {
        let mut p = crate::testing::payment_fixture(Uuid::new_v4());
        p.net_amount_cents -= 1;
        let violations = check_payments(&[p]);
        assert_eq!(violations.len(), 1);
        assert_eq!(violations[0].kind, InvariantKind::FeeBalance);
    }
}
