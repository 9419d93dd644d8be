//! Usage metering against a subscription's feature table
//!
//! Limits come from the feature table captured on the subscription when its
//! plan was chosen, not from the live catalog. `-1` means unlimited. Counters
//! only move through [`UsageGate::increment`], which is a single conditional
//! update in storage, and are zeroed by a successful renewal.

use std::sync::Arc;

use coachpay_shared::{Clock, SubscriberKind};
use serde::Serialize;
use uuid::Uuid;

use crate::error::{BillingError, BillingResult};
use crate::models::{Subscription, UNLIMITED};
use crate::store::{SubscriptionRepository, UsageIncrement};

/// Largest amount a single increment may record
pub const MAX_USAGE_INCREMENT: i64 = 10_000;

/// Answer to "may this subscriber use one more of X?"
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct LimitCheck {
    pub within_limit: bool,
    pub used: i64,
    pub limit: i64,
}

impl LimitCheck {
    /// Fail-closed answer used when there is nothing to check against
    pub const DENIED: LimitCheck = LimitCheck {
        within_limit: false,
        used: 0,
        limit: 0,
    };
}

/// Check a capability against a subscription's captured limits.
///
/// A capability missing from the feature table is not part of the plan.
pub fn check_limit(subscription: &Subscription, capability: &str) -> LimitCheck {
    let Some(&limit) = subscription.features.get(capability) else {
        return LimitCheck::DENIED;
    };
    let used = subscription.usage.get(capability).copied().unwrap_or(0);
    LimitCheck {
        within_limit: limit == UNLIMITED || used < limit,
        used,
        limit,
    }
}

pub struct UsageGate {
    subscriptions: Arc<dyn SubscriptionRepository>,
    clock: Arc<dyn Clock>,
}

impl UsageGate {
    pub fn new(subscriptions: Arc<dyn SubscriptionRepository>, clock: Arc<dyn Clock>) -> Self {
        Self {
            subscriptions,
            clock,
        }
    }

    /// Limit check for a stored subscription
    pub async fn check(&self, subscription_id: Uuid, capability: &str) -> BillingResult<LimitCheck> {
        let sub = self
            .subscriptions
            .get(subscription_id)
            .await?
            .ok_or_else(|| BillingError::NotFound(format!("subscription {}", subscription_id)))?;
        Ok(check_limit(&sub, capability))
    }

    /// Limit check for whatever subscription a subscriber holds.
    ///
    /// Never errors for a subscriber without one, and denies when the
    /// subscription exists but no longer grants access.
    pub async fn check_for_subscriber(
        &self,
        kind: SubscriberKind,
        subscriber_id: Uuid,
        payee_id: Option<Uuid>,
        capability: &str,
    ) -> LimitCheck {
        let latest = match self
            .subscriptions
            .find_latest(kind, subscriber_id, payee_id)
            .await
        {
            Ok(Some(sub)) => sub,
            Ok(None) => return LimitCheck::DENIED,
            Err(e) => {
                tracing::error!(
                    subscriber_id = %subscriber_id,
                    capability = %capability,
                    error = %e,
                    "Usage check failed, denying"
                );
                return LimitCheck::DENIED;
            }
        };
        let check = check_limit(&latest, capability);
        if latest.grants_access(self.clock.now()) {
            check
        } else {
            LimitCheck {
                within_limit: false,
                ..check
            }
        }
    }

    /// Record `amount` units of a capability.
    ///
    /// Rejected with `LimitExceeded` (counter untouched) when the increment
    /// would cross a finite limit.
    pub async fn increment(
        &self,
        subscription_id: Uuid,
        capability: &str,
        amount: i64,
    ) -> BillingResult<LimitCheck> {
        if !(1..=MAX_USAGE_INCREMENT).contains(&amount) {
            return Err(BillingError::InvalidInput(format!(
                "Usage increment must be between 1 and {}: {}",
                MAX_USAGE_INCREMENT, amount
            )));
        }
        let now = self.clock.now();
        let sub = self
            .subscriptions
            .get(subscription_id)
            .await?
            .ok_or_else(|| BillingError::NotFound(format!("subscription {}", subscription_id)))?;
        if !sub.grants_access(now) {
            return Err(BillingError::Conflict(format!(
                "Subscription {} is {} and does not grant access",
                sub.id, sub.status
            )));
        }

        match self
            .subscriptions
            .increment_usage(subscription_id, capability, amount, now)
            .await?
        {
            UsageIncrement::Applied { used, limit } => {
                tracing::debug!(
                    subscription_id = %subscription_id,
                    capability = %capability,
                    used,
                    limit,
                    "Usage recorded"
                );
                Ok(LimitCheck {
                    within_limit: limit == UNLIMITED || used < limit,
                    used,
                    limit,
                })
            }
            UsageIncrement::Rejected { used, limit } => {
                tracing::info!(
                    subscription_id = %subscription_id,
                    capability = %capability,
                    used,
                    limit,
                    amount,
                    "Usage limit reached"
                );
                Err(BillingError::LimitExceeded {
                    capability: capability.to_string(),
                    used,
                    limit,
                })
            }
            UsageIncrement::UnknownCapability => Err(BillingError::InvalidInput(format!(
                "Capability {} is not part of the plan",
                capability
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::InMemorySubscriptionRepository;
    use crate::testing::subscription_fixture;
    use coachpay_shared::{FakeClock, SubscriptionStatus};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use time::macros::datetime;
    use tokio::sync::Barrier;

    async fn gate_with(sub: &Subscription) -> UsageGate {
        let repo = Arc::new(InMemorySubscriptionRepository::new());
        repo.insert(sub).await.unwrap();
        let clock = Arc::new(FakeClock::new(datetime!(2026-01-20 10:00 UTC)));
        UsageGate::new(repo, clock)
    }

    #[test]
    fn test_unlimited_is_always_within_limit() {
        let mut sub = subscription_fixture(Uuid::new_v4());
        sub.features.insert("programs".into(), UNLIMITED);
        sub.usage.insert("programs".into(), 1_000_000);
        let check = check_limit(&sub, "programs");
        assert!(check.within_limit);
        assert_eq!(check.limit, -1);
    }

    #[test]
    fn test_unknown_capability_is_denied() {
        let sub = subscription_fixture(Uuid::new_v4());
        assert_eq!(check_limit(&sub, "video_calls"), LimitCheck::DENIED);
    }

    #[tokio::test]
    async fn test_increment_stops_at_limit() {
        let sub = subscription_fixture(Uuid::new_v4());
        let gate = gate_with(&sub).await;

        let check = gate.increment(sub.id, "clients", 9).await.unwrap();
        assert_eq!(check.used, 9);
        assert!(check.within_limit);

        let last = gate.increment(sub.id, "clients", 1).await.unwrap();
        assert_eq!(last.used, 10);
        assert!(!last.within_limit);

        let err = gate.increment(sub.id, "clients", 1).await.unwrap_err();
        assert!(matches!(
            err,
            BillingError::LimitExceeded { used: 10, limit: 10, .. }
        ));
        assert_eq!(gate.check(sub.id, "clients").await.unwrap().used, 10);
    }

    #[tokio::test]
    async fn test_oversized_increment_is_rejected() {
        let mut sub = subscription_fixture(Uuid::new_v4());
        sub.features.insert("messages".into(), UNLIMITED);
        let gate = gate_with(&sub).await;

        for amount in [0, -5, MAX_USAGE_INCREMENT + 1, i64::MAX] {
            assert!(matches!(
                gate.increment(sub.id, "messages", amount).await,
                Err(BillingError::InvalidInput(_))
            ));
        }
        assert_eq!(gate.check(sub.id, "messages").await.unwrap().used, 0);
    }

    #[tokio::test]
    async fn test_counter_near_max_is_not_wrapped() {
        let mut sub = subscription_fixture(Uuid::new_v4());
        sub.features.insert("messages".into(), UNLIMITED);
        sub.usage.insert("messages".into(), i64::MAX - 1);
        let gate = gate_with(&sub).await;

        let err = gate.increment(sub.id, "messages", 2).await.unwrap_err();
        assert!(matches!(err, BillingError::LimitExceeded { limit: -1, .. }));
        let check = gate.check(sub.id, "messages").await.unwrap();
        assert_eq!(check.used, i64::MAX - 1);
        assert!(check.within_limit);
    }

    #[tokio::test]
    async fn test_concurrent_increments_never_overshoot() {
        let sub = subscription_fixture(Uuid::new_v4());
        let gate = gate_with(&sub).await;
        let gate = Arc::new(gate);
        let barrier = Arc::new(Barrier::new(25));
        let applied = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..25 {
            let gate = gate.clone();
            let barrier = barrier.clone();
            let applied = applied.clone();
            let id = sub.id;
            handles.push(tokio::spawn(async move {
                barrier.wait().await;
                if gate.increment(id, "clients", 1).await.is_ok() {
                    applied.fetch_add(1, Ordering::SeqCst);
                }
            }));
        }
        for h in handles {
            h.await.unwrap();
        }
        assert_eq!(applied.load(Ordering::SeqCst), 10);
        assert_eq!(gate.check(sub.id, "clients").await.unwrap().used, 10);
    }

    #[tokio::test]
    async fn test_subscriber_without_subscription_is_denied() {
        let sub = subscription_fixture(Uuid::new_v4());
        let gate = gate_with(&sub).await;
        let check = gate
            .check_for_subscriber(SubscriberKind::Coach, Uuid::new_v4(), None, "clients")
            .await;
        assert_eq!(check, LimitCheck::DENIED);

        let ok = gate
            .check_for_subscriber(SubscriberKind::Coach, sub.subscriber_id, None, "clients")
            .await;
        assert!(ok.within_limit);
        assert_eq!(ok.limit, 10);
    }

    #[tokio::test]
    async fn test_ended_subscription_is_denied() {
        let mut sub = subscription_fixture(Uuid::new_v4());
        sub.status = SubscriptionStatus::Expired;
        let gate = gate_with(&sub).await;
        let check = gate
            .check_for_subscriber(SubscriberKind::Coach, sub.subscriber_id, None, "clients")
            .await;
        assert!(!check.within_limit);
        assert_eq!(check.limit, 10);
        assert!(matches!(
            gate.increment(sub.id, "clients", 1).await,
            Err(BillingError::Conflict(_))
        ));
    }
}
