//! Entitlement Module
//!
//! Answers "what can this subscriber do right now?" from the subscription
//! they hold. [`compute_entitlement`] is the single function that maps
//! subscription state to access; everything else (API handlers, the usage
//! gate) asks it or [`Subscription::grants_access`], which it agrees with.

use std::sync::Arc;

use coachpay_shared::{Clock, Plan, SubscriberKind, SubscriptionStatus};
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use uuid::Uuid;

use crate::error::BillingResult;
use crate::models::{FeatureTable, Subscription, UsageSnapshot};
use crate::store::SubscriptionRepository;

/// Unified entitlement state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntitlementState {
    /// Trial period running (trial_end > now)
    Trialing,
    /// Paid and in good standing
    Active,
    /// Renewal failed, retries pending
    PastDueGrace,
    /// Cancelled or not renewing, still inside the paid period
    CancelledGrace,
    /// Waiting for the first payment
    AwaitingPayment,
    /// Paused by the subscriber
    Paused,
    /// Cancelled or expired, access revoked
    Ended,
    /// No subscription on record
    None,
}

impl std::fmt::Display for EntitlementState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EntitlementState::Trialing => write!(f, "trialing"),
            EntitlementState::Active => write!(f, "active"),
            EntitlementState::PastDueGrace => write!(f, "past_due_grace"),
            EntitlementState::CancelledGrace => write!(f, "cancelled_grace"),
            EntitlementState::AwaitingPayment => write!(f, "awaiting_payment"),
            EntitlementState::Paused => write!(f, "paused"),
            EntitlementState::Ended => write!(f, "ended"),
            EntitlementState::None => write!(f, "none"),
        }
    }
}

/// Entitlement for one subscriber
#[derive(Debug, Clone, Serialize)]
pub struct Entitlement {
    pub state: EntitlementState,
    pub subscription_id: Option<Uuid>,
    pub plan: Option<Plan>,
    /// Captured feature table (empty when access is denied)
    pub features: FeatureTable,
    pub usage: UsageSnapshot,
    pub access_allowed: bool,
    /// Human-readable reason when access is denied or at risk
    pub reason: Option<String>,
    /// When access ends without further payment
    #[serde(with = "time::serde::rfc3339::option")]
    pub expires_at: Option<OffsetDateTime>,
    #[serde(with = "time::serde::rfc3339")]
    pub computed_at: OffsetDateTime,
}

impl Entitlement {
    pub fn has_feature(&self, capability: &str) -> bool {
        self.access_allowed && self.features.contains_key(capability)
    }
}

/// Pure function: entitlement from the subscriber's latest subscription
pub fn compute_entitlement(sub: Option<&Subscription>, now: OffsetDateTime) -> Entitlement {
    let Some(sub) = sub else {
        return Entitlement {
            state: EntitlementState::None,
            subscription_id: None,
            plan: None,
            features: FeatureTable::new(),
            usage: UsageSnapshot::new(),
            access_allowed: false,
            reason: Some("No subscription".to_string()),
            expires_at: None,
            computed_at: now,
        };
    };

    let (state, expires_at, reason) = match sub.status {
        SubscriptionStatus::Trial => (EntitlementState::Trialing, sub.trial_end, None),
        SubscriptionStatus::Active if sub.end_date.is_some() => (
            EntitlementState::CancelledGrace,
            sub.end_date,
            Some("Subscription will not renew".to_string()),
        ),
        SubscriptionStatus::Active => (EntitlementState::Active, None, None),
        SubscriptionStatus::PastDue => (
            EntitlementState::PastDueGrace,
            sub.next_retry_at,
            Some("Payment past due - please update payment method".to_string()),
        ),
        SubscriptionStatus::Cancelled if sub.end_date.is_some_and(|end| end > now) => (
            EntitlementState::CancelledGrace,
            sub.end_date,
            Some("Subscription cancelled".to_string()),
        ),
        SubscriptionStatus::Pending => (
            EntitlementState::AwaitingPayment,
            None,
            Some("Waiting for the first payment".to_string()),
        ),
        SubscriptionStatus::Paused => (
            EntitlementState::Paused,
            None,
            Some("Subscription paused".to_string()),
        ),
        SubscriptionStatus::Cancelled | SubscriptionStatus::Expired => (
            EntitlementState::Ended,
            sub.end_date,
            Some(format!("Subscription {}", sub.status)),
        ),
    };

    let access_allowed = sub.grants_access(now);
    // A trial or grace period that ran out before the sweep caught up
    let (state, reason) = match state {
        EntitlementState::Trialing | EntitlementState::CancelledGrace if !access_allowed => {
            (EntitlementState::Ended, Some("Access period over".to_string()))
        }
        _ => (state, reason),
    };

    Entitlement {
        state,
        subscription_id: Some(sub.id),
        plan: Some(sub.plan),
        features: if access_allowed {
            sub.features.clone()
        } else {
            FeatureTable::new()
        },
        usage: sub.usage.clone(),
        access_allowed,
        reason,
        expires_at,
        computed_at: now,
    }
}

/// Entitlement lookups for subscribers
pub struct EntitlementService {
    subscriptions: Arc<dyn SubscriptionRepository>,
    clock: Arc<dyn Clock>,
}

impl EntitlementService {
    pub fn new(subscriptions: Arc<dyn SubscriptionRepository>, clock: Arc<dyn Clock>) -> Self {
        Self {
            subscriptions,
            clock,
        }
    }

    /// Entitlement of a subscriber (and payee, for client subscriptions).
    ///
    /// The most recent subscription decides, so a cancelled one still inside
    /// its paid period keeps granting access.
    pub async fn compute(
        &self,
        kind: SubscriberKind,
        subscriber_id: Uuid,
        payee_id: Option<Uuid>,
    ) -> BillingResult<Entitlement> {
        let latest = self
            .subscriptions
            .find_latest(kind, subscriber_id, payee_id)
            .await?;
        Ok(compute_entitlement(latest.as_ref(), self.clock.now()))
    }

    /// Fail-closed access check
    pub async fn has_access(
        &self,
        kind: SubscriberKind,
        subscriber_id: Uuid,
        payee_id: Option<Uuid>,
    ) -> bool {
        match self.compute(kind, subscriber_id, payee_id).await {
            Ok(e) => e.access_allowed,
            Err(e) => {
                tracing::error!(
                    subscriber_id = %subscriber_id,
                    error = %e,
                    "Entitlement lookup failed, denying access"
                );
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::subscription_fixture;
    use coachpay_shared::CancelledBy;
    use time::macros::datetime;
    use time::Duration;

    const NOW: OffsetDateTime = datetime!(2026-01-20 10:00 UTC);

    #[test]
    fn test_entitlement_state_display() {
        assert_eq!(EntitlementState::Active.to_string(), "active");
        assert_eq!(EntitlementState::PastDueGrace.to_string(), "past_due_grace");
        assert_eq!(EntitlementState::None.to_string(), "none");
    }

    #[test]
    fn test_no_subscription_has_no_access() {
        let e = compute_entitlement(None, NOW);
        assert_eq!(e.state, EntitlementState::None);
        assert!(!e.access_allowed);
        assert!(!e.has_feature("clients"));
    }

    #[test]
    fn test_active_subscription() {
        let sub = subscription_fixture(Uuid::new_v4());
        let e = compute_entitlement(Some(&sub), NOW);
        assert_eq!(e.state, EntitlementState::Active);
        assert!(e.access_allowed);
        assert!(e.has_feature("clients"));
    }

    #[test]
    fn test_past_due_keeps_access() {
        let mut sub = subscription_fixture(Uuid::new_v4());
        sub.status = SubscriptionStatus::PastDue;
        sub.next_retry_at = Some(NOW + Duration::days(1));
        let e = compute_entitlement(Some(&sub), NOW);
        assert_eq!(e.state, EntitlementState::PastDueGrace);
        assert!(e.access_allowed);
        assert_eq!(e.expires_at, sub.next_retry_at);
    }

    #[test]
    fn test_cancelled_grace_until_period_end() {
        let mut sub = subscription_fixture(Uuid::new_v4());
        sub.status = SubscriptionStatus::Cancelled;
        sub.cancelled_by = Some(CancelledBy::User);
        sub.end_date = sub.current_period_end;

        let during = compute_entitlement(Some(&sub), NOW);
        assert_eq!(during.state, EntitlementState::CancelledGrace);
        assert!(during.access_allowed);

        let after = compute_entitlement(Some(&sub), datetime!(2026-02-16 00:00 UTC));
        assert_eq!(after.state, EntitlementState::Ended);
        assert!(!after.access_allowed);
        assert!(after.features.is_empty());
    }

    #[test]
    fn test_lapsed_trial_is_ended() {
        let mut sub = subscription_fixture(Uuid::new_v4());
        sub.status = SubscriptionStatus::Trial;
        sub.trial_end = Some(NOW - Duration::hours(1));
        let e = compute_entitlement(Some(&sub), NOW);
        assert_eq!(e.state, EntitlementState::Ended);
        assert!(!e.access_allowed);
    }

    #[test]
    fn test_pending_and_paused_deny() {
        let mut sub = subscription_fixture(Uuid::new_v4());
        sub.status = SubscriptionStatus::Pending;
        assert_eq!(
            compute_entitlement(Some(&sub), NOW).state,
            EntitlementState::AwaitingPayment
        );
        sub.status = SubscriptionStatus::Paused;
        let e = compute_entitlement(Some(&sub), NOW);
        assert_eq!(e.state, EntitlementState::Paused);
        assert!(!e.access_allowed);
    }
}
