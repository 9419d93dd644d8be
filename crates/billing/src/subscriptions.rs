//! Subscription lifecycle
//!
//! One state machine for both coach and client subscriptions:
//!
//! ```text
//! trial ──> pending ──> active ──> past_due ──> active
//!   │                     │  ▲         └──────> cancelled (system, after max attempts)
//!   └──> active           │  └── paused (client kind)
//!                         └──> cancelled ──> active (reactivation)
//! active / trial with an end date ──> expired
//! ```
//!
//! Every mutation reloads the row, applies a change and writes it back with a
//! version check, retrying on `ConcurrentModification`. Mutations on one
//! subscription are also serialized in-process by [`KeyedLocks`].

use std::sync::Arc;

use coachpay_shared::{
    BillingCycle, CancelledBy, Clock, PaginatedResponse, Pagination, PaymentMethod, PaymentStatus,
    Plan, SubscriberKind, SubscriptionStatus, UserRole,
};
use serde::{Deserialize, Serialize};
use time::{Duration, OffsetDateTime};
use uuid::Uuid;

use crate::catalog::{CustomPlan, ProductCatalog};
use crate::config::DunningPolicy;
use crate::directory::UserDirectory;
use crate::email::{BillingEvent, Notifier};
use crate::error::{BillingError, BillingResult};
use crate::ledger::PaymentLedger;
use crate::locks::KeyedLocks;
use crate::models::{ExternalIds, Payment, PlanChange, Subscription};
use crate::providers::RenewalRequest;
use crate::store::{SubscriptionFilter, SubscriptionRepository};

/// Attempts at a version-checked write before giving up
const MAX_VERSION_RETRIES: usize = 5;

/// Input for starting a subscription
#[derive(Debug, Clone, Deserialize)]
pub struct NewSubscription {
    pub kind: SubscriberKind,
    pub subscriber_id: Uuid,
    /// Coach being paid (client kind only)
    #[serde(default)]
    pub payee_id: Option<Uuid>,
    pub plan: Plan,
    #[serde(default)]
    pub billing_cycle: BillingCycle,
    #[serde(default)]
    pub payment_method: Option<PaymentMethod>,
    #[serde(default)]
    pub external_ids: ExternalIds,
    #[serde(default)]
    pub custom: Option<CustomPlan>,
}

/// Fields a caller may change directly. Everything else moves only through
/// lifecycle operations.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct SubscriptionUpdate {
    #[serde(default)]
    pub auto_renew: Option<bool>,
    #[serde(default)]
    pub payment_method: Option<PaymentMethod>,
    #[serde(default)]
    pub external_ids: Option<ExternalIds>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PlanChangeRequest {
    pub plan: Plan,
    #[serde(default)]
    pub billing_cycle: Option<BillingCycle>,
    #[serde(default)]
    pub custom: Option<CustomPlan>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CancelRequest {
    #[serde(default)]
    pub reason: Option<String>,
    pub cancelled_by: CancelledBy,
}

/// Result of one renewal attempt
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum RenewalOutcome {
    Renewed {
        payment_id: Option<Uuid>,
        #[serde(with = "time::serde::rfc3339")]
        next_billing_date: OffsetDateTime,
    },
    Failed {
        attempts: i32,
        #[serde(with = "time::serde::rfc3339")]
        next_retry_at: OffsetDateTime,
        reason: String,
    },
    Cancelled {
        attempts: i32,
        reason: String,
    },
    /// Not due, or already handled by another sweep
    Skipped {
        reason: String,
    },
}

pub struct SubscriptionService {
    subscriptions: Arc<dyn SubscriptionRepository>,
    catalog: Arc<ProductCatalog>,
    ledger: Arc<PaymentLedger>,
    users: Arc<dyn UserDirectory>,
    clock: Arc<dyn Clock>,
    notifier: Arc<dyn Notifier>,
    locks: Arc<KeyedLocks>,
    dunning: DunningPolicy,
    cancellation_grace: Duration,
}

fn illegal(from: SubscriptionStatus, to: SubscriptionStatus) -> BillingError {
    BillingError::InvalidTransition {
        from: from.to_string(),
        to: to.to_string(),
    }
}

impl SubscriptionService {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        subscriptions: Arc<dyn SubscriptionRepository>,
        catalog: Arc<ProductCatalog>,
        ledger: Arc<PaymentLedger>,
        users: Arc<dyn UserDirectory>,
        clock: Arc<dyn Clock>,
        notifier: Arc<dyn Notifier>,
        locks: Arc<KeyedLocks>,
        dunning: DunningPolicy,
        cancellation_grace: Duration,
    ) -> Self {
        Self {
            subscriptions,
            catalog,
            ledger,
            users,
            clock,
            notifier,
            locks,
            dunning,
            cancellation_grace,
        }
    }

    // =========================================================================
    // Write plumbing
    // =========================================================================

    /// Apply `change` under the subscription's lock with a version-checked write
    async fn mutate<F>(&self, id: Uuid, change: F) -> BillingResult<Subscription>
    where
        F: FnMut(&mut Subscription, OffsetDateTime) -> BillingResult<()> + Send,
    {
        let _guard = self.locks.lock(id).await;
        self.mutate_locked(id, change).await
    }

    /// Same as [`Self::mutate`] for callers already holding the lock
    async fn mutate_locked<F>(&self, id: Uuid, mut change: F) -> BillingResult<Subscription>
    where
        F: FnMut(&mut Subscription, OffsetDateTime) -> BillingResult<()> + Send,
    {
        for attempt in 1..=MAX_VERSION_RETRIES {
            let mut sub = self.get(id).await?;
            let now = self.clock.now();
            change(&mut sub, now)?;
            sub.updated_at = now;
            match self.subscriptions.update(&sub).await {
                Ok(stored) => return Ok(stored),
                Err(BillingError::ConcurrentModification(msg)) => {
                    tracing::debug!(
                        subscription_id = %id,
                        attempt,
                        error = %msg,
                        "Subscription changed underneath us, retrying"
                    );
                }
                Err(e) => return Err(e),
            }
        }
        Err(BillingError::ConcurrentModification(format!(
            "subscription {} kept changing after {} attempts",
            id, MAX_VERSION_RETRIES
        )))
    }

    async fn require_role(&self, user_id: Uuid, role: UserRole) -> BillingResult<()> {
        let user = self
            .users
            .get_user(user_id)
            .await?
            .ok_or_else(|| BillingError::NotFound(format!("user {}", user_id)))?;
        if user.role != role {
            return Err(BillingError::InvalidInput(format!(
                "User {} is a {}, expected a {}",
                user_id, user.role, role
            )));
        }
        Ok(())
    }

    // =========================================================================
    // Lifecycle
    // =========================================================================

    /// Start a subscription in `trial` (plan has trial days) or `pending`
    pub async fn create(&self, input: NewSubscription) -> BillingResult<Subscription> {
        match (input.kind, input.payee_id) {
            (SubscriberKind::Coach, Some(_)) => {
                return Err(BillingError::InvalidInput(
                    "Coach subscriptions are paid to the platform and take no payee".to_string(),
                ))
            }
            (SubscriberKind::Client, None) => {
                return Err(BillingError::InvalidInput(
                    "Client subscriptions need the coach being paid".to_string(),
                ))
            }
            (SubscriberKind::Client, Some(payee)) if payee == input.subscriber_id => {
                return Err(BillingError::InvalidInput(
                    "A client cannot subscribe to themselves".to_string(),
                ))
            }
            _ => {}
        }

        self.require_role(input.subscriber_id, input.kind.required_subscriber_role())
            .await?;
        if let Some(payee) = input.payee_id {
            self.require_role(payee, UserRole::Coach).await?;
        }

        if let Some(existing) = self
            .subscriptions
            .find_current(input.kind, input.subscriber_id, input.payee_id)
            .await?
        {
            return Err(BillingError::AlreadyExists(format!(
                "Subscriber {} already has {} subscription {}",
                input.subscriber_id, existing.status, existing.id
            )));
        }

        let terms = self
            .catalog
            .resolve(
                input.kind,
                input.plan,
                input.billing_cycle,
                input.custom.as_ref(),
            )
            .await?;

        let now = self.clock.now();
        let trial_end = match terms.trial_days {
            0 => None,
            days => Some(
                now.checked_add(Duration::days(i64::from(days)))
                    .ok_or_else(|| {
                        BillingError::InvalidInput(format!("Trial of {} days is out of range", days))
                    })?,
            ),
        };
        let next_billing = match trial_end {
            Some(end) => end,
            None => terms.billing_cycle.advance(now)?,
        };
        let status = if trial_end.is_some() {
            SubscriptionStatus::Trial
        } else {
            SubscriptionStatus::Pending
        };

        let sub = Subscription {
            id: Uuid::new_v4(),
            kind: input.kind,
            subscriber_id: input.subscriber_id,
            payee_id: input.payee_id,
            product_id: terms.product_id,
            plan: terms.plan,
            status,
            billing_cycle: terms.billing_cycle,
            price_cents: terms.price_cents,
            currency: terms.currency,
            commission_rate_bps: terms.commission_rate_bps,
            payment_method: input.payment_method,
            start_date: now,
            trial_end,
            next_billing_date: Some(next_billing),
            last_billing_date: None,
            current_period_start: trial_end.map(|_| now),
            current_period_end: trial_end,
            end_date: None,
            auto_renew: true,
            cancelled_at: None,
            cancellation_reason: None,
            cancelled_by: None,
            paused_at: None,
            failed_payment_attempts: 0,
            next_retry_at: None,
            usage: Subscription::zero_usage(&terms.features),
            features: terms.features,
            external_ids: input.external_ids,
            upgrade_history: Vec::new(),
            renewal_claimed_until: None,
            version: 0,
            created_at: now,
            updated_at: now,
        };
        self.subscriptions.insert(&sub).await?;

        tracing::info!(
            subscription_id = %sub.id,
            kind = %sub.kind,
            subscriber_id = %sub.subscriber_id,
            plan = %sub.plan,
            status = %sub.status,
            "Subscription created"
        );
        Ok(sub)
    }

    /// Activate a `pending` (or converting `trial`) subscription with its
    /// first completed payment
    pub async fn activate(&self, id: Uuid, payment: &Payment) -> BillingResult<Subscription> {
        if payment.status != PaymentStatus::Completed {
            return Err(BillingError::InvalidInput(format!(
                "Payment {} is {}, not completed",
                payment.id, payment.status
            )));
        }
        if payment.subscription_id != Some(id) {
            return Err(BillingError::InvalidInput(format!(
                "Payment {} does not belong to subscription {}",
                payment.id, id
            )));
        }

        let method = payment.method;
        let payment_id = payment.id;
        let payer = payment.payer_id;
        let payee = payment.payee_id;
        let commission = payment.commission_rate_bps;
        let currency = payment.currency.clone();
        let amount = payment.amount_cents;
        let sub = self
            .mutate(id, |s, now| {
                match s.status {
                    SubscriptionStatus::Pending | SubscriptionStatus::Trial => {}
                    SubscriptionStatus::Active if s.last_billing_date.is_some() => {
                        return Err(BillingError::Conflict(format!(
                            "Subscription {} is already active",
                            s.id
                        )))
                    }
                    other => return Err(illegal(other, SubscriptionStatus::Active)),
                }
                if payer != s.subscriber_id {
                    return Err(BillingError::InvalidInput(
                        "Payment was made by a different user".to_string(),
                    ));
                }
                if payee != s.payee_id
                    || commission != s.payee_id.and(s.commission_rate_bps)
                    || currency != s.currency
                {
                    return Err(BillingError::InvalidInput(format!(
                        "Payment {} was not made on the terms of subscription {}",
                        payment_id, s.id
                    )));
                }
                if amount < s.price_cents {
                    return Err(BillingError::InvalidInput(format!(
                        "Payment of {} does not cover the price {}",
                        amount, s.price_cents
                    )));
                }
                let period_end = s.billing_cycle.advance(now)?;
                s.status = SubscriptionStatus::Active;
                s.last_billing_date = Some(now);
                s.current_period_start = Some(now);
                s.current_period_end = Some(period_end);
                s.next_billing_date = Some(period_end);
                s.failed_payment_attempts = 0;
                s.next_retry_at = None;
                s.end_date = None;
                s.usage = Subscription::zero_usage(&s.features);
                if s.payment_method.is_none() {
                    s.payment_method = Some(method);
                }
                Ok(())
            })
            .await?;

        tracing::info!(
            subscription_id = %id,
            payment_id = %payment_id,
            "Subscription activated"
        );
        Ok(sub)
    }

    /// Bill one due subscription.
    ///
    /// Callable from concurrent sweeps: the subscription lock serializes
    /// in-process callers, the due date is rechecked after the lock is taken,
    /// and the post-payment write only applies while `next_billing_date` still
    /// equals the date that was billed.
    pub async fn renew(&self, id: Uuid) -> BillingResult<RenewalOutcome> {
        let _guard = self.locks.lock(id).await;
        let sub = self.get(id).await?;
        let now = self.clock.now();

        let Some(due_at) = sub.renewal_due_at() else {
            return Ok(RenewalOutcome::Skipped {
                reason: format!("{} subscription is not renewable", sub.status),
            });
        };
        if due_at > now {
            return Ok(RenewalOutcome::Skipped {
                reason: "not due yet".to_string(),
            });
        }
        let billed_date = sub.next_billing_date;

        let charge: Result<Option<Payment>, String> = if sub.price_cents == 0 {
            Ok(None)
        } else if let Some(method) = sub.payment_method {
            let provider_product_id = match sub.product_id {
                Some(pid) => match self.catalog.get(pid).await {
                    Ok(product) => product.store_ids.for_method(method).map(str::to_string),
                    Err(BillingError::NotFound(_)) => None,
                    Err(e) => return Err(e),
                },
                None => None,
            };
            let request = RenewalRequest {
                subscription_id: sub.id,
                amount_cents: sub.price_cents,
                currency: sub.currency.clone(),
                provider_product_id,
                external_ids: sub.external_ids.clone(),
                previous_billing: sub.last_billing_date,
                due_at: billed_date.unwrap_or(due_at),
                attempt: u32::try_from(sub.failed_payment_attempts).unwrap_or(0),
                now,
            };
            match self.ledger.charge_renewal(&sub, method, &request).await {
                Ok(p) if p.status == PaymentStatus::Completed => Ok(Some(p)),
                Ok(p) => Err(p
                    .failure_reason
                    .unwrap_or_else(|| "Renewal payment failed".to_string())),
                Err(e) if e.is_retryable() => return Err(e),
                Err(e) => Err(e.to_string()),
            }
        } else {
            Err("No payment method on file".to_string())
        };

        match charge {
            Ok(payment) => self.apply_renewal(id, billed_date, payment).await,
            Err(reason) => self.apply_renewal_failure(id, billed_date, reason).await,
        }
    }

    async fn apply_renewal(
        &self,
        id: Uuid,
        billed_date: Option<OffsetDateTime>,
        payment: Option<Payment>,
    ) -> BillingResult<RenewalOutcome> {
        let result = self
            .mutate_locked(id, |s, now| {
                if s.renewal_due_at().is_none() || s.next_billing_date != billed_date {
                    return Err(BillingError::Conflict(
                        "renewal already applied".to_string(),
                    ));
                }
                let period_end = s.billing_cycle.advance(now)?;
                s.status = SubscriptionStatus::Active;
                s.last_billing_date = Some(now);
                s.current_period_start = Some(now);
                s.current_period_end = Some(period_end);
                s.next_billing_date = Some(period_end);
                s.failed_payment_attempts = 0;
                s.next_retry_at = None;
                s.usage = Subscription::zero_usage(&s.features);
                Ok(())
            })
            .await;

        let payment_id = payment.as_ref().map(|p| p.id);
        match result {
            Ok(sub) => {
                tracing::info!(
                    subscription_id = %id,
                    payment_id = ?payment_id,
                    next_billing_date = ?sub.next_billing_date,
                    "Subscription renewed"
                );
                Ok(RenewalOutcome::Renewed {
                    payment_id,
                    next_billing_date: sub.next_billing_date.unwrap_or(sub.updated_at),
                })
            }
            Err(BillingError::Conflict(reason)) => {
                tracing::warn!(
                    subscription_id = %id,
                    payment_id = ?payment_id,
                    "Renewal collected but subscription already moved on"
                );
                Ok(RenewalOutcome::Skipped { reason })
            }
            Err(e) => Err(e),
        }
    }

    async fn apply_renewal_failure(
        &self,
        id: Uuid,
        billed_date: Option<OffsetDateTime>,
        reason: String,
    ) -> BillingResult<RenewalOutcome> {
        let max_attempts = i32::try_from(self.dunning.max_attempts).unwrap_or(i32::MAX);
        let dunning = &self.dunning;
        let cancel_reason = |attempts: i32| {
            format!(
                "Renewal failed {} time{}: {}",
                attempts,
                if attempts == 1 { "" } else { "s" },
                reason
            )
        };

        let result = self
            .mutate_locked(id, |s, now| {
                if s.renewal_due_at().is_none() || s.next_billing_date != billed_date {
                    return Err(BillingError::Conflict(
                        "renewal already applied".to_string(),
                    ));
                }
                let attempts = s.failed_payment_attempts + 1;
                s.failed_payment_attempts = attempts;
                if attempts >= max_attempts {
                    s.status = SubscriptionStatus::Cancelled;
                    s.cancelled_at = Some(now);
                    s.cancelled_by = Some(CancelledBy::System);
                    s.cancellation_reason = Some(cancel_reason(attempts));
                    s.auto_renew = false;
                    s.next_retry_at = None;
                    s.end_date = Some(now);
                } else {
                    s.status = SubscriptionStatus::PastDue;
                    s.next_retry_at =
                        Some(now + dunning.delay_after(u32::try_from(attempts).unwrap_or(1)));
                }
                Ok(())
            })
            .await;

        let sub = match result {
            Ok(sub) => sub,
            Err(BillingError::Conflict(reason)) => return Ok(RenewalOutcome::Skipped { reason }),
            Err(e) => return Err(e),
        };

        if sub.status == SubscriptionStatus::Cancelled {
            tracing::warn!(
                subscription_id = %id,
                attempts = sub.failed_payment_attempts,
                reason = %reason,
                "Subscription cancelled after repeated renewal failures"
            );
            let outcome = RenewalOutcome::Cancelled {
                attempts: sub.failed_payment_attempts,
                reason: sub.cancellation_reason.clone().unwrap_or_default(),
            };
            self.notifier
                .notify(BillingEvent::SubscriptionCancelled { subscription: sub })
                .await;
            return Ok(outcome);
        }

        let next_retry_at = sub.next_retry_at.unwrap_or(sub.updated_at);
        tracing::warn!(
            subscription_id = %id,
            attempts = sub.failed_payment_attempts,
            next_retry_at = %next_retry_at,
            reason = %reason,
            "Renewal failed, subscription past due"
        );
        let outcome = RenewalOutcome::Failed {
            attempts: sub.failed_payment_attempts,
            next_retry_at,
            reason: reason.clone(),
        };
        self.notifier
            .notify(BillingEvent::RenewalFailed {
                subscription: sub,
                reason,
                next_retry_at: Some(next_retry_at),
            })
            .await;
        Ok(outcome)
    }

    /// Move a plan (and optionally cycle) to new catalog terms. Consumed usage
    /// carries over for capabilities the new plan still has.
    pub async fn change_plan(
        &self,
        id: Uuid,
        request: PlanChangeRequest,
    ) -> BillingResult<Subscription> {
        let current = self.get(id).await?;
        let cycle = request.billing_cycle.unwrap_or(current.billing_cycle);
        if request.plan == current.plan
            && cycle == current.billing_cycle
            && request.custom.is_none()
        {
            return Err(BillingError::InvalidInput(format!(
                "Subscription is already on {} ({})",
                current.plan, cycle
            )));
        }
        let terms = self
            .catalog
            .resolve(current.kind, request.plan, cycle, request.custom.as_ref())
            .await?;

        let sub = self
            .mutate(id, |s, now| {
                if !matches!(
                    s.status,
                    SubscriptionStatus::Trial | SubscriptionStatus::Pending | SubscriptionStatus::Active
                ) {
                    return Err(BillingError::Conflict(format!(
                        "Cannot change the plan of a {} subscription",
                        s.status
                    )));
                }
                s.upgrade_history.push(PlanChange {
                    from_plan: s.plan,
                    to_plan: terms.plan,
                    from_cycle: s.billing_cycle,
                    to_cycle: terms.billing_cycle,
                    from_price_cents: s.price_cents,
                    to_price_cents: terms.price_cents,
                    changed_at: now,
                });
                s.plan = terms.plan;
                s.billing_cycle = terms.billing_cycle;
                s.price_cents = terms.price_cents;
                s.currency = terms.currency.clone();
                s.product_id = terms.product_id;
                s.commission_rate_bps = terms.commission_rate_bps;
                s.usage = Subscription::reconcile_usage(&terms.features, &s.usage);
                s.features = terms.features.clone();
                Ok(())
            })
            .await?;

        tracing::info!(
            subscription_id = %id,
            plan = %sub.plan,
            cycle = %sub.billing_cycle,
            price_cents = sub.price_cents,
            "Subscription plan changed"
        );
        Ok(sub)
    }

    /// Cancel. Access continues until the end of the paid period (or the
    /// configured grace when no period is known). Cancelling twice is a
    /// `Conflict` and leaves the first cancellation untouched.
    pub async fn cancel(&self, id: Uuid, request: CancelRequest) -> BillingResult<Subscription> {
        let grace = self.cancellation_grace;
        let sub = self
            .mutate(id, |s, now| {
                match s.status {
                    SubscriptionStatus::Cancelled => {
                        return Err(BillingError::Conflict(format!(
                            "Subscription {} is already cancelled",
                            s.id
                        )))
                    }
                    SubscriptionStatus::Expired => {
                        return Err(illegal(s.status, SubscriptionStatus::Cancelled))
                    }
                    _ => {}
                }
                s.status = SubscriptionStatus::Cancelled;
                s.cancelled_at = Some(now);
                s.cancellation_reason = request.reason.clone();
                s.cancelled_by = Some(request.cancelled_by);
                s.auto_renew = false;
                s.next_retry_at = None;
                s.paused_at = None;
                s.end_date = Some(match s.current_period_end {
                    Some(end) if end > now => end,
                    _ => now + grace,
                });
                Ok(())
            })
            .await?;

        tracing::info!(
            subscription_id = %id,
            cancelled_by = %request.cancelled_by,
            end_date = ?sub.end_date,
            "Subscription cancelled"
        );
        self.notifier
            .notify(BillingEvent::SubscriptionCancelled {
                subscription: sub.clone(),
            })
            .await;
        Ok(sub)
    }

    /// `cancelled -> active` on a fresh billing cycle.
    ///
    /// The old period is not resumed. The billing date is reset to now and
    /// the new cycle is collected right away; a declined charge leaves the
    /// subscription `past_due` under the usual dunning schedule.
    pub async fn reactivate(&self, id: Uuid) -> BillingResult<Subscription> {
        self.mutate(id, |s, now| {
            if s.status != SubscriptionStatus::Cancelled {
                return Err(illegal(s.status, SubscriptionStatus::Active));
            }
            s.status = SubscriptionStatus::Active;
            s.cancelled_at = None;
            s.cancellation_reason = None;
            s.cancelled_by = None;
            s.auto_renew = true;
            s.failed_payment_attempts = 0;
            s.next_retry_at = None;
            s.end_date = None;
            s.paused_at = None;
            s.trial_end = None;
            s.current_period_start = Some(now);
            s.current_period_end = None;
            s.next_billing_date = Some(now);
            Ok(())
        })
        .await?;

        let outcome = self.renew(id).await?;
        let sub = self.get(id).await?;
        tracing::info!(
            subscription_id = %id,
            status = %sub.status,
            outcome = ?outcome,
            "Subscription reactivated"
        );
        Ok(sub)
    }

    /// `active -> paused` (client kind only)
    pub async fn pause(&self, id: Uuid) -> BillingResult<Subscription> {
        let sub = self
            .mutate(id, |s, now| {
                if s.kind != SubscriberKind::Client {
                    return Err(BillingError::InvalidInput(
                        "Only client subscriptions can be paused".to_string(),
                    ));
                }
                if s.status != SubscriptionStatus::Active {
                    return Err(illegal(s.status, SubscriptionStatus::Paused));
                }
                s.status = SubscriptionStatus::Paused;
                s.paused_at = Some(now);
                Ok(())
            })
            .await?;
        tracing::info!(subscription_id = %id, "Subscription paused");
        Ok(sub)
    }

    /// `paused -> active`, pushing billing dates out by the paused duration
    pub async fn resume(&self, id: Uuid) -> BillingResult<Subscription> {
        let sub = self
            .mutate(id, |s, now| {
                if s.status != SubscriptionStatus::Paused {
                    return Err(illegal(s.status, SubscriptionStatus::Active));
                }
                let paused_for = s
                    .paused_at
                    .map(|at| now - at)
                    .filter(|d| d.is_positive())
                    .unwrap_or(Duration::ZERO);
                s.next_billing_date = s.next_billing_date.map(|d| d + paused_for);
                s.current_period_end = s.current_period_end.map(|d| d + paused_for);
                if s.end_date.is_some() {
                    s.end_date = s.current_period_end;
                }
                s.status = SubscriptionStatus::Active;
                s.paused_at = None;
                Ok(())
            })
            .await?;
        tracing::info!(
            subscription_id = %id,
            next_billing_date = ?sub.next_billing_date,
            "Subscription resumed"
        );
        Ok(sub)
    }

    /// Apply an allow-listed field update.
    ///
    /// Turning auto-renew off on a `past_due` subscription ends dunning: the
    /// unpaid cycle is never collected and the subscription is cancelled now.
    pub async fn update(&self, id: Uuid, update: SubscriptionUpdate) -> BillingResult<Subscription> {
        let sub = self
            .mutate(id, |s, now| {
                if s.status.is_terminal() {
                    return Err(BillingError::Conflict(format!(
                        "Subscription {} is {}",
                        s.id, s.status
                    )));
                }
                if let Some(auto_renew) = update.auto_renew {
                    s.auto_renew = auto_renew;
                    match s.status {
                        SubscriptionStatus::Active | SubscriptionStatus::Trial => {
                            s.end_date = if auto_renew {
                                None
                            } else {
                                s.current_period_end
                            };
                        }
                        SubscriptionStatus::PastDue if !auto_renew => {
                            s.status = SubscriptionStatus::Cancelled;
                            s.cancelled_at = Some(now);
                            s.cancelled_by = Some(CancelledBy::User);
                            s.cancellation_reason =
                                Some("Auto-renew turned off while past due".to_string());
                            s.next_retry_at = None;
                            s.end_date = Some(now);
                        }
                        _ => {}
                    }
                }
                if let Some(method) = update.payment_method {
                    s.payment_method = Some(method);
                }
                if let Some(ids) = update.external_ids.clone() {
                    s.external_ids.merge(ids);
                }
                Ok(())
            })
            .await?;

        if sub.status == SubscriptionStatus::Cancelled {
            tracing::info!(subscription_id = %id, "Dunning ended, auto-renew turned off");
            self.notifier
                .notify(BillingEvent::SubscriptionCancelled {
                    subscription: sub.clone(),
                })
                .await;
        }
        Ok(sub)
    }

    /// `active | trial -> expired` once `end_date` has passed
    pub async fn expire(&self, id: Uuid) -> BillingResult<Option<Subscription>> {
        let result = self
            .mutate(id, |s, now| {
                let ended = matches!(s.status, SubscriptionStatus::Active | SubscriptionStatus::Trial)
                    && s.end_date.is_some_and(|end| end <= now);
                if !ended {
                    return Err(BillingError::Conflict("no longer ending".to_string()));
                }
                s.status = SubscriptionStatus::Expired;
                s.auto_renew = false;
                Ok(())
            })
            .await;
        match result {
            Ok(sub) => {
                tracing::info!(subscription_id = %id, "Subscription expired");
                Ok(Some(sub))
            }
            Err(BillingError::Conflict(_)) => Ok(None),
            Err(e) => Err(e),
        }
    }

    // =========================================================================
    // Queries
    // =========================================================================

    pub async fn get(&self, id: Uuid) -> BillingResult<Subscription> {
        self.subscriptions
            .get(id)
            .await?
            .ok_or_else(|| BillingError::NotFound(format!("subscription {}", id)))
    }

    pub async fn find_current(
        &self,
        kind: SubscriberKind,
        subscriber_id: Uuid,
        payee_id: Option<Uuid>,
    ) -> BillingResult<Option<Subscription>> {
        self.subscriptions
            .find_current(kind, subscriber_id, payee_id)
            .await
    }

    pub async fn list(
        &self,
        filter: &SubscriptionFilter,
        page: Pagination,
    ) -> BillingResult<PaginatedResponse<Subscription>> {
        let page = page.normalized();
        let (data, total) = self.subscriptions.list(filter, page).await?;
        Ok(PaginatedResponse::new(data, total, page.page, page.limit))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::NewProduct;
    use crate::directory::InMemoryUserDirectory;
    use crate::email::NoopNotifier;
    use crate::fees::FeeSchedule;
    use crate::ledger::NewPayment;
    use crate::models::StoreProductIds;
    use crate::plans::PlanSettings;
    use crate::providers::ProviderRegistry;
    use crate::store::{
        InMemoryPaymentRepository, InMemoryProductRepository, InMemorySubscriptionRepository,
    };
    use crate::testing::{FakeProvider, Scripted};
    use coachpay_shared::{FakeClock, PaymentType};
    use time::macros::datetime;

    struct Harness {
        service: SubscriptionService,
        ledger: Arc<PaymentLedger>,
        users: Arc<InMemoryUserDirectory>,
        clock: Arc<FakeClock>,
        provider: Arc<FakeProvider>,
    }

    async fn harness() -> Harness {
        let clock = Arc::new(FakeClock::new(datetime!(2026-05-01 08:00 UTC)));
        let provider = Arc::new(FakeProvider::new(PaymentMethod::Card));
        let users = Arc::new(InMemoryUserDirectory::new());
        let catalog = Arc::new(ProductCatalog::new(
            Arc::new(InMemoryProductRepository::new()),
            PlanSettings::default(),
            clock.clone(),
            "USD",
        ));
        let ledger = Arc::new(PaymentLedger::new(
            Arc::new(InMemoryPaymentRepository::new()),
            ProviderRegistry::new().with(provider.clone()),
            FeeSchedule::default(),
            clock.clone(),
            Arc::new(NoopNotifier),
            Duration::minutes(15),
            "USD",
        ));
        let service = SubscriptionService::new(
            Arc::new(InMemorySubscriptionRepository::new()),
            catalog.clone(),
            ledger.clone(),
            users.clone(),
            clock.clone(),
            Arc::new(NoopNotifier),
            Arc::new(KeyedLocks::new()),
            DunningPolicy::default(),
            Duration::ZERO,
        );

        for (kind, plan, price, features) in [
            (SubscriberKind::Coach, Plan::Starter, 2900, vec![("clients", 10)]),
            (SubscriberKind::Coach, Plan::Professional, 5900, vec![("clients", 50), ("programs", -1)]),
            (SubscriberKind::Client, Plan::Basic, 8900, vec![("sessions", 4)]),
        ] {
            catalog
                .create_product(NewProduct {
                    kind,
                    plan,
                    billing_cycle: BillingCycle::Monthly,
                    name: format!("{} {}", kind, plan),
                    description: None,
                    price_cents: price,
                    currency: None,
                    store_ids: StoreProductIds::default(),
                    features: features.into_iter().map(|(k, v)| (k.to_string(), v)).collect(),
                    trial_days: None,
                })
                .await
                .unwrap();
        }

        Harness {
            service,
            ledger,
            users,
            clock,
            provider,
        }
    }

    impl Harness {
        async fn coach_sub(&self) -> Subscription {
            let coach = self.users.add(UserRole::Coach, "coach@example.com").await;
            self.service
                .create(NewSubscription {
                    kind: SubscriberKind::Coach,
                    subscriber_id: coach.id,
                    payee_id: None,
                    plan: Plan::Starter,
                    billing_cycle: BillingCycle::Monthly,
                    payment_method: Some(PaymentMethod::Card),
                    external_ids: ExternalIds::default(),
                    custom: None,
                })
                .await
                .unwrap()
        }

        async fn client_sub(&self) -> Subscription {
            let coach = self.users.add(UserRole::Coach, "coach@example.com").await;
            let client = self.users.add(UserRole::Trainee, "client@example.com").await;
            self.service
                .create(NewSubscription {
                    kind: SubscriberKind::Client,
                    subscriber_id: client.id,
                    payee_id: Some(coach.id),
                    plan: Plan::Basic,
                    billing_cycle: BillingCycle::Monthly,
                    payment_method: Some(PaymentMethod::Card),
                    external_ids: ExternalIds::default(),
                    custom: None,
                })
                .await
                .unwrap()
        }

        async fn pay_and_activate(&self, sub: &Subscription) -> Subscription {
            let payment = self
                .ledger
                .submit(NewPayment {
                    payer_id: sub.subscriber_id,
                    payee_id: sub.payee_id,
                    method: PaymentMethod::Card,
                    payment_type: PaymentType::Subscription,
                    amount_cents: sub.price_cents,
                    currency: None,
                    commission_rate_bps: sub.commission_rate_bps,
                    purchase_reference: Some(format!("pi_{}", sub.id)),
                    provider_product_id: None,
                    subscription_id: Some(sub.id),
                    product_id: sub.product_id,
                    provider_payload: None,
                })
                .await
                .unwrap();
            self.service.activate(sub.id, &payment).await.unwrap()
        }
    }

    #[tokio::test]
    async fn test_coach_plan_starts_in_trial() {
        let h = harness().await;
        let sub = h.coach_sub().await;
        assert_eq!(sub.status, SubscriptionStatus::Trial);
        assert_eq!(sub.trial_end, Some(datetime!(2026-05-15 08:00 UTC)));
        assert_eq!(sub.next_billing_date, sub.trial_end);
        assert_eq!(sub.usage.get("clients"), Some(&0));
        assert!(sub.grants_access(h.clock.now()));
    }

    #[tokio::test]
    async fn test_client_plan_without_trial_is_pending() {
        let h = harness().await;
        let sub = h.client_sub().await;
        assert_eq!(sub.status, SubscriptionStatus::Pending);
        assert_eq!(sub.commission_rate_bps, Some(2000));
        assert_eq!(sub.next_billing_date, Some(datetime!(2026-06-01 08:00 UTC)));
        assert!(!sub.grants_access(h.clock.now()));
    }

    #[tokio::test]
    async fn test_second_subscription_for_holder_is_rejected() {
        let h = harness().await;
        let sub = h.coach_sub().await;
        let err = h
            .service
            .create(NewSubscription {
                kind: SubscriberKind::Coach,
                subscriber_id: sub.subscriber_id,
                payee_id: None,
                plan: Plan::Professional,
                billing_cycle: BillingCycle::Monthly,
                payment_method: None,
                external_ids: ExternalIds::default(),
                custom: None,
            })
            .await
            .unwrap_err();
        assert!(matches!(err, BillingError::AlreadyExists(_)));
    }

    #[tokio::test]
    async fn test_role_mismatch_is_rejected() {
        let h = harness().await;
        let trainee = h.users.add(UserRole::Trainee, "t@example.com").await;
        let err = h
            .service
            .create(NewSubscription {
                kind: SubscriberKind::Coach,
                subscriber_id: trainee.id,
                payee_id: None,
                plan: Plan::Starter,
                billing_cycle: BillingCycle::Monthly,
                payment_method: None,
                external_ids: ExternalIds::default(),
                custom: None,
            })
            .await
            .unwrap_err();
        assert!(matches!(err, BillingError::InvalidInput(_)));
    }

    #[tokio::test]
    async fn test_activation_starts_first_period() {
        let h = harness().await;
        let sub = h.client_sub().await;
        let active = h.pay_and_activate(&sub).await;
        assert_eq!(active.status, SubscriptionStatus::Active);
        assert_eq!(active.last_billing_date, Some(h.clock.now()));
        assert_eq!(active.next_billing_date, Some(datetime!(2026-06-01 08:00 UTC)));
        assert!(active.next_billing_date.unwrap() > h.clock.now());
    }

    #[tokio::test]
    async fn test_renewal_success_advances_and_resets_usage() {
        let h = harness().await;
        let sub = h.pay_and_activate(&h.client_sub().await).await;
        h.service
            .subscriptions
            .increment_usage(sub.id, "sessions", 3, h.clock.now())
            .await
            .unwrap();

        h.clock.set(datetime!(2026-06-01 09:00 UTC));
        let outcome = h.service.renew(sub.id).await.unwrap();
        assert!(matches!(outcome, RenewalOutcome::Renewed { payment_id: Some(_), .. }));

        let renewed = h.service.get(sub.id).await.unwrap();
        assert_eq!(renewed.last_billing_date, Some(datetime!(2026-06-01 09:00 UTC)));
        assert_eq!(renewed.next_billing_date, Some(datetime!(2026-07-01 09:00 UTC)));
        assert_eq!(renewed.usage.get("sessions"), Some(&0));

        // Same instant again: nothing due
        let again = h.service.renew(sub.id).await.unwrap();
        assert!(matches!(again, RenewalOutcome::Skipped { .. }));
        assert_eq!(h.provider.renewal_calls(), 1);
    }

    #[tokio::test]
    async fn test_failed_renewals_escalate_to_system_cancellation() {
        let h = harness().await;
        let sub = h.pay_and_activate(&h.client_sub().await).await;
        h.provider.script_renewal(Scripted::invalid("card declined"));

        h.clock.set(datetime!(2026-06-01 09:00 UTC));
        let first = h.service.renew(sub.id).await.unwrap();
        assert!(matches!(first, RenewalOutcome::Failed { attempts: 1, .. }));
        let past_due = h.service.get(sub.id).await.unwrap();
        assert_eq!(past_due.status, SubscriptionStatus::PastDue);
        assert_eq!(past_due.next_retry_at, Some(datetime!(2026-06-02 09:00 UTC)));
        assert!(past_due.grants_access(h.clock.now()));

        h.clock.set(datetime!(2026-06-02 09:00 UTC));
        let second = h.service.renew(sub.id).await.unwrap();
        assert!(matches!(second, RenewalOutcome::Failed { attempts: 2, .. }));
        let retry_at = h.service.get(sub.id).await.unwrap().next_retry_at.unwrap();
        assert_eq!(retry_at, datetime!(2026-06-05 09:00 UTC));

        h.clock.set(retry_at);
        let third = h.service.renew(sub.id).await.unwrap();
        assert!(matches!(third, RenewalOutcome::Cancelled { attempts: 3, .. }));
        let cancelled = h.service.get(sub.id).await.unwrap();
        assert_eq!(cancelled.status, SubscriptionStatus::Cancelled);
        assert_eq!(cancelled.cancelled_by, Some(CancelledBy::System));
        assert!(!cancelled.auto_renew);
    }

    #[tokio::test]
    async fn test_past_due_recovers_on_successful_retry() {
        let h = harness().await;
        let sub = h.pay_and_activate(&h.client_sub().await).await;
        h.provider.script_renewal(Scripted::invalid("insufficient funds"));
        h.clock.set(datetime!(2026-06-01 09:00 UTC));
        h.service.renew(sub.id).await.unwrap();

        h.provider.script_renewal(Scripted::valid("ch_retry", None));
        h.clock.set(datetime!(2026-06-02 09:30 UTC));
        let outcome = h.service.renew(sub.id).await.unwrap();
        assert!(matches!(outcome, RenewalOutcome::Renewed { .. }));
        let recovered = h.service.get(sub.id).await.unwrap();
        assert_eq!(recovered.status, SubscriptionStatus::Active);
        assert_eq!(recovered.failed_payment_attempts, 0);
        assert!(recovered.next_retry_at.is_none());
    }

    #[tokio::test]
    async fn test_cancel_twice_is_conflict_and_keeps_first_cancellation() {
        let h = harness().await;
        let sub = h.pay_and_activate(&h.client_sub().await).await;
        let first = h
            .service
            .cancel(
                sub.id,
                CancelRequest {
                    reason: Some("moving gyms".into()),
                    cancelled_by: CancelledBy::User,
                },
            )
            .await
            .unwrap();
        assert_eq!(first.end_date, sub.current_period_end);
        assert!(first.grants_access(h.clock.now()));

        h.clock.advance(Duration::hours(1));
        let err = h
            .service
            .cancel(
                sub.id,
                CancelRequest {
                    reason: None,
                    cancelled_by: CancelledBy::Admin,
                },
            )
            .await
            .unwrap_err();
        assert!(matches!(err, BillingError::Conflict(_)));
        let stored = h.service.get(sub.id).await.unwrap();
        assert_eq!(stored.cancelled_at, first.cancelled_at);
        assert_eq!(stored.cancelled_by, Some(CancelledBy::User));
    }

    #[tokio::test]
    async fn test_cancel_pending_ends_access_immediately() {
        let h = harness().await;
        let sub = h.client_sub().await;
        let cancelled = h
            .service
            .cancel(
                sub.id,
                CancelRequest {
                    reason: None,
                    cancelled_by: CancelledBy::User,
                },
            )
            .await
            .unwrap();
        assert_eq!(cancelled.end_date, Some(h.clock.now()));
        assert!(!cancelled.grants_access(h.clock.now()));
    }

    #[tokio::test]
    async fn test_reactivate_only_from_cancelled() {
        let h = harness().await;
        let sub = h.pay_and_activate(&h.client_sub().await).await;
        assert!(matches!(
            h.service.reactivate(sub.id).await,
            Err(BillingError::InvalidTransition { .. })
        ));

        h.service
            .cancel(
                sub.id,
                CancelRequest {
                    reason: None,
                    cancelled_by: CancelledBy::User,
                },
            )
            .await
            .unwrap();
        h.clock.advance(Duration::days(10));
        let back = h.service.reactivate(sub.id).await.unwrap();
        assert_eq!(back.status, SubscriptionStatus::Active);
        assert!(back.auto_renew);
        assert!(back.cancelled_at.is_none());
        assert!(back.end_date.is_none());

        // New cycle from the reactivation, not the remainder of the old one
        assert_eq!(back.current_period_start, Some(datetime!(2026-05-11 08:00 UTC)));
        assert_eq!(back.last_billing_date, Some(datetime!(2026-05-11 08:00 UTC)));
        assert_eq!(back.next_billing_date, Some(datetime!(2026-06-11 08:00 UTC)));
        assert_ne!(back.next_billing_date, sub.current_period_end);
        assert_eq!(h.provider.renewal_calls(), 1);
    }

    #[tokio::test]
    async fn test_reactivation_with_declined_card_is_past_due() {
        let h = harness().await;
        let sub = h.pay_and_activate(&h.client_sub().await).await;
        h.service
            .cancel(
                sub.id,
                CancelRequest {
                    reason: None,
                    cancelled_by: CancelledBy::User,
                },
            )
            .await
            .unwrap();
        h.provider.script_renewal(Scripted::invalid("card declined"));

        h.clock.set(datetime!(2026-07-01 08:00 UTC));
        let back = h.service.reactivate(sub.id).await.unwrap();
        assert_eq!(back.status, SubscriptionStatus::PastDue);
        assert_eq!(back.failed_payment_attempts, 1);
        assert_eq!(back.next_retry_at, Some(datetime!(2026-07-02 08:00 UTC)));
    }

    #[tokio::test]
    async fn test_auto_renew_off_while_past_due_ends_dunning() {
        let h = harness().await;
        let sub = h.pay_and_activate(&h.client_sub().await).await;
        h.provider.script_renewal(Scripted::invalid("card declined"));
        h.clock.set(datetime!(2026-06-01 09:00 UTC));
        h.service.renew(sub.id).await.unwrap();
        assert_eq!(h.provider.renewal_calls(), 1);

        let updated = h
            .service
            .update(
                sub.id,
                SubscriptionUpdate {
                    auto_renew: Some(false),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(updated.status, SubscriptionStatus::Cancelled);
        assert_eq!(updated.cancelled_by, Some(CancelledBy::User));
        assert!(updated.next_retry_at.is_none());
        assert!(updated.renewal_due_at().is_none());
        assert!(!updated.grants_access(h.clock.now()));

        h.provider.script_renewal(Scripted::valid("ch_late", None));
        h.clock.set(datetime!(2026-06-02 09:00 UTC));
        let outcome = h.service.renew(sub.id).await.unwrap();
        assert!(matches!(outcome, RenewalOutcome::Skipped { .. }));
        assert_eq!(h.provider.renewal_calls(), 1);
    }

    #[tokio::test]
    async fn test_change_plan_keeps_consumed_usage() {
        let h = harness().await;
        let sub = h.pay_and_activate(&h.coach_sub().await).await;
        h.service
            .subscriptions
            .increment_usage(sub.id, "clients", 7, h.clock.now())
            .await
            .unwrap();

        let changed = h
            .service
            .change_plan(
                sub.id,
                PlanChangeRequest {
                    plan: Plan::Professional,
                    billing_cycle: None,
                    custom: None,
                },
            )
            .await
            .unwrap();
        assert_eq!(changed.plan, Plan::Professional);
        assert_eq!(changed.price_cents, 5900);
        assert_eq!(changed.usage.get("clients"), Some(&7));
        assert_eq!(changed.usage.get("programs"), Some(&0));
        assert_eq!(changed.upgrade_history.len(), 1);
        assert_eq!(changed.upgrade_history[0].from_plan, Plan::Starter);
        let keys: Vec<_> = changed.features.keys().collect();
        let usage_keys: Vec<_> = changed.usage.keys().collect();
        assert_eq!(keys, usage_keys);
    }

    #[tokio::test]
    async fn test_pause_and_resume_shift_billing() {
        let h = harness().await;
        let sub = h.pay_and_activate(&h.client_sub().await).await;
        h.service.pause(sub.id).await.unwrap();
        h.clock.advance(Duration::days(10));
        let resumed = h.service.resume(sub.id).await.unwrap();
        assert_eq!(resumed.status, SubscriptionStatus::Active);
        assert_eq!(
            resumed.next_billing_date,
            sub.next_billing_date.map(|d| d + Duration::days(10))
        );
    }

    #[tokio::test]
    async fn test_coach_subscription_cannot_pause() {
        let h = harness().await;
        let sub = h.pay_and_activate(&h.coach_sub().await).await;
        assert!(matches!(
            h.service.pause(sub.id).await,
            Err(BillingError::InvalidInput(_))
        ));
    }

    #[tokio::test]
    async fn test_auto_renew_off_sets_end_date() {
        let h = harness().await;
        let sub = h.pay_and_activate(&h.client_sub().await).await;
        let updated = h
            .service
            .update(
                sub.id,
                SubscriptionUpdate {
                    auto_renew: Some(false),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(updated.end_date, sub.current_period_end);
        assert_eq!(updated.status, SubscriptionStatus::Active);

        h.clock.set(sub.current_period_end.unwrap());
        let expired = h.service.expire(sub.id).await.unwrap().unwrap();
        assert_eq!(expired.status, SubscriptionStatus::Expired);
    }

    #[tokio::test]
    async fn test_update_keeps_concurrent_usage_increment() {
        let h = harness().await;
        let sub = h.coach_sub().await;
        h.service
            .subscriptions
            .increment_usage(sub.id, "clients", 1, h.clock.now())
            .await
            .unwrap();
        let updated = h
            .service
            .update(
                sub.id,
                SubscriptionUpdate {
                    payment_method: Some(PaymentMethod::Paypal),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(updated.payment_method, Some(PaymentMethod::Paypal));
        assert_eq!(updated.usage.get("clients"), Some(&1));
        assert_eq!(updated.version, sub.version + 2);
    }
}
