//! Payment ledger
//!
//! Records every attempted payment and drives it through
//! `pending -> processing -> completed | failed`, `pending -> cancelled`,
//! `pending -> expired` and `completed -> refunded`. Every status change is a
//! compare-and-set on the stored status, so duplicate or late requests lose
//! cleanly instead of overwriting a settled payment.

use std::sync::Arc;

use coachpay_shared::{
    Clock, PaginatedResponse, Pagination, PaymentMethod, PaymentStatus, PaymentType,
};
use serde::Deserialize;
use serde_json::Value;
use time::Duration;
use uuid::Uuid;

use crate::email::{BillingEvent, Notifier};
use crate::error::{BillingError, BillingResult};
use crate::fees::{calculate, FeeSchedule};
use crate::models::{Payment, Subscription};
use crate::providers::{
    ProviderError, ProviderRegistry, RenewalRequest, ValidationRequest, Verification,
};
use crate::store::{PaymentFilter, PaymentRepository, PaymentTransition, RefundRecord};

/// Input for recording a new payment
#[derive(Debug, Clone, Deserialize)]
pub struct NewPayment {
    pub payer_id: Uuid,
    #[serde(default)]
    pub payee_id: Option<Uuid>,
    pub method: PaymentMethod,
    pub payment_type: PaymentType,
    pub amount_cents: i64,
    #[serde(default)]
    pub currency: Option<String>,
    /// Platform share of a payment to a coach, basis points
    #[serde(default)]
    pub commission_rate_bps: Option<i64>,
    /// Receipt transaction id, purchase token, payment intent id or order id
    #[serde(default)]
    pub purchase_reference: Option<String>,
    #[serde(default)]
    pub provider_product_id: Option<String>,
    #[serde(default)]
    pub subscription_id: Option<Uuid>,
    #[serde(default)]
    pub product_id: Option<Uuid>,
    /// Rail-specific validation payload (receipt data, flags)
    #[serde(default)]
    pub provider_payload: Option<Value>,
}

/// What a provider reported asynchronously about a payment. Amounts and
/// test flags are never taken from the report.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum CallbackOutcome {
    Succeeded { external_transaction_id: String },
    Failed { reason: String },
}

pub struct PaymentLedger {
    payments: Arc<dyn PaymentRepository>,
    providers: ProviderRegistry,
    fees: FeeSchedule,
    clock: Arc<dyn Clock>,
    notifier: Arc<dyn Notifier>,
    payment_expiry: Duration,
    default_currency: String,
}

impl PaymentLedger {
    pub fn new(
        payments: Arc<dyn PaymentRepository>,
        providers: ProviderRegistry,
        fees: FeeSchedule,
        clock: Arc<dyn Clock>,
        notifier: Arc<dyn Notifier>,
        payment_expiry: Duration,
        default_currency: impl Into<String>,
    ) -> Self {
        Self {
            payments,
            providers,
            fees,
            clock,
            notifier,
            payment_expiry,
            default_currency: default_currency.into(),
        }
    }

    // =========================================================================
    // Recording
    // =========================================================================

    /// Record a pending payment that expires after the configured window
    pub async fn create(&self, input: NewPayment) -> BillingResult<Payment> {
        match input.payment_type {
            PaymentType::Refund => {
                return Err(BillingError::InvalidInput(
                    "Refund entries are created by refunding a payment".to_string(),
                ))
            }
            PaymentType::Subscription | PaymentType::OneTime => {
                if !self.providers.is_enabled(input.method) {
                    return Err(BillingError::InvalidInput(format!(
                        "Payment method {} is not enabled",
                        input.method
                    )));
                }
            }
            PaymentType::Payout => {}
        }
        if input.amount_cents <= 0 {
            return Err(BillingError::InvalidInput(format!(
                "Amount must be positive: {}",
                input.amount_cents
            )));
        }
        if input.payee_id == Some(input.payer_id) {
            return Err(BillingError::InvalidInput(
                "Payer and payee must differ".to_string(),
            ));
        }
        if let Some(bps) = input.commission_rate_bps {
            if input.payee_id.is_none() {
                return Err(BillingError::InvalidInput(
                    "A commission rate needs a payee".to_string(),
                ));
            }
            if !(0..=10_000).contains(&bps) {
                return Err(BillingError::InvalidInput(format!(
                    "Commission rate must be between 0 and 100%: {} bps",
                    bps
                )));
            }
        }
        if input
            .purchase_reference
            .as_deref()
            .is_some_and(|r| r.trim().is_empty())
        {
            return Err(BillingError::InvalidInput(
                "Purchase reference must not be empty".to_string(),
            ));
        }
        let currency = normalize_currency(input.currency.as_deref(), &self.default_currency)?;

        let now = self.clock.now();
        let payment = Payment {
            id: Uuid::new_v4(),
            payer_id: input.payer_id,
            payee_id: input.payee_id,
            method: input.method,
            payment_type: input.payment_type,
            status: PaymentStatus::Pending,
            amount_cents: input.amount_cents,
            currency,
            platform_fee_cents: 0,
            service_fee_cents: 0,
            net_amount_cents: 0,
            platform_commission_cents: 0,
            payee_earnings_cents: 0,
            commission_rate_bps: input.commission_rate_bps,
            purchase_reference: input.purchase_reference,
            external_transaction_id: None,
            provider_product_id: input.provider_product_id,
            subscription_id: input.subscription_id,
            product_id: input.product_id,
            refund_of: None,
            refunded_amount_cents: 0,
            refund_reason: None,
            refunded_at: None,
            provider_payload: input.provider_payload,
            validation_response: None,
            failure_reason: None,
            expires_at: Some(now + self.payment_expiry),
            completed_at: None,
            is_test: false,
            created_at: now,
            updated_at: now,
        };
        self.payments.insert(&payment).await?;

        tracing::info!(
            payment_id = %payment.id,
            payer_id = %payment.payer_id,
            method = %payment.method,
            payment_type = %payment.payment_type,
            amount_cents = payment.amount_cents,
            "Payment created"
        );
        Ok(payment)
    }

    /// Create-and-validate, idempotent on the purchase reference.
    ///
    /// A retried submission of the same purchase returns the payment recorded
    /// the first time instead of creating a second one.
    pub async fn submit(&self, input: NewPayment) -> BillingResult<Payment> {
        let Some(reference) = input.purchase_reference.clone() else {
            return Err(BillingError::InvalidInput(
                "Submitting a payment requires a purchase reference".to_string(),
            ));
        };

        if let Some(existing) = self
            .payments
            .find_by_reference(
                input.payer_id,
                input.method,
                input.provider_product_id.as_deref(),
                &reference,
            )
            .await?
        {
            tracing::info!(
                payment_id = %existing.id,
                status = %existing.status,
                "Purchase already recorded, returning existing payment"
            );
            return match existing.status {
                PaymentStatus::Pending => self.validate(existing.id).await,
                _ => Ok(existing),
            };
        }

        let payment = self.create(input).await?;
        self.validate(payment.id).await
    }

    // =========================================================================
    // Validation
    // =========================================================================

    /// Verify a pending payment with its provider and settle it.
    ///
    /// Returns the payment in its final state: `completed` when the provider
    /// accepted the purchase, `failed` when it rejected it or stayed
    /// unreachable after retries. Validating an already completed payment
    /// returns it unchanged.
    pub async fn validate(&self, id: Uuid) -> BillingResult<Payment> {
        let payment = self.get(id).await?;
        match payment.status {
            PaymentStatus::Pending => {}
            PaymentStatus::Completed | PaymentStatus::Refunded => return Ok(payment),
            other => {
                return Err(BillingError::Conflict(format!(
                    "Payment {} is {} and cannot be validated",
                    id, other
                )))
            }
        }
        let request = validation_request(&payment)?;
        let provider = self.providers.get(payment.method)?;

        let payment = match self.begin_processing(&payment).await? {
            Some(p) => p,
            None => return self.settled_by_other_writer(id).await,
        };

        let verdict = provider.validate(&request).await;
        self.settle(payment, verdict).await
    }

    /// Collect one subscription renewal.
    ///
    /// The payment's purchase reference is the renewal's idempotency key, so
    /// a sweep that crashed after charging finds the completed payment
    /// instead of charging twice.
    pub async fn charge_renewal(
        &self,
        subscription: &Subscription,
        method: PaymentMethod,
        request: &RenewalRequest,
    ) -> BillingResult<Payment> {
        let provider = self.providers.get(method)?;
        let key = request.idempotency_key();

        let existing = self
            .payments
            .find_by_reference(
                subscription.subscriber_id,
                method,
                request.provider_product_id.as_deref(),
                &key,
            )
            .await?;

        let payment = match existing {
            Some(p) if matches!(p.status, PaymentStatus::Completed | PaymentStatus::Refunded) => {
                tracing::info!(
                    subscription_id = %subscription.id,
                    payment_id = %p.id,
                    "Renewal already collected"
                );
                return Ok(p);
            }
            Some(p) if p.status == PaymentStatus::Processing => p,
            Some(p) => match self.begin_processing(&p).await? {
                Some(p) => p,
                None => return self.settled_by_other_writer(p.id).await,
            },
            None => {
                let created = self
                    .create(NewPayment {
                        payer_id: subscription.subscriber_id,
                        payee_id: subscription.payee_id,
                        method,
                        payment_type: PaymentType::Subscription,
                        amount_cents: request.amount_cents,
                        currency: Some(request.currency.clone()),
                        commission_rate_bps: subscription
                            .payee_id
                            .and(subscription.commission_rate_bps),
                        purchase_reference: Some(key),
                        provider_product_id: request.provider_product_id.clone(),
                        subscription_id: Some(subscription.id),
                        product_id: subscription.product_id,
                        provider_payload: None,
                    })
                    .await?;
                match self.begin_processing(&created).await? {
                    Some(p) => p,
                    None => return self.settled_by_other_writer(created.id).await,
                }
            }
        };

        let verdict = provider.charge_renewal(request).await;
        self.settle(payment, verdict).await
    }

    async fn begin_processing(&self, payment: &Payment) -> BillingResult<Option<Payment>> {
        self.payments
            .transition(
                payment.id,
                &[PaymentStatus::Pending],
                &PaymentTransition::to(PaymentStatus::Processing, self.clock.now()),
            )
            .await
    }

    /// Another request moved the payment first; report what it did
    async fn settled_by_other_writer(&self, id: Uuid) -> BillingResult<Payment> {
        let current = self.get(id).await?;
        match current.status {
            PaymentStatus::Completed | PaymentStatus::Refunded | PaymentStatus::Failed => {
                Ok(current)
            }
            other => Err(BillingError::Conflict(format!(
                "Payment {} is {} in another request",
                id, other
            ))),
        }
    }

    /// Finish a `processing` payment with the provider's verdict
    async fn settle(
        &self,
        payment: Payment,
        verdict: Result<Verification, ProviderError>,
    ) -> BillingResult<Payment> {
        match verdict {
            Ok(Verification::Valid {
                amount_cents,
                external_id,
                is_test,
                raw,
            }) => {
                if let Some(reported) = amount_cents {
                    if reported != payment.amount_cents {
                        let reason = format!(
                            "Amount mismatch: provider reported {} but {} was expected",
                            reported, payment.amount_cents
                        );
                        return self.fail(payment, reason, Some(raw)).await;
                    }
                }
                self.complete(payment, external_id, is_test, raw).await
            }
            Ok(Verification::Invalid { reason }) => self.fail(payment, reason, None).await,
            Err(e) => {
                match &e {
                    ProviderError::Config(msg) => tracing::error!(
                        payment_id = %payment.id,
                        method = %payment.method,
                        error = %msg,
                        "Payment provider misconfigured"
                    ),
                    ProviderError::Transient(msg) => tracing::warn!(
                        payment_id = %payment.id,
                        method = %payment.method,
                        error = %msg,
                        "Payment provider unavailable after retries"
                    ),
                }
                self.fail(payment, e.to_string(), None).await
            }
        }
    }

    async fn complete(
        &self,
        payment: Payment,
        external_id: String,
        is_test: bool,
        raw: Value,
    ) -> BillingResult<Payment> {
        let now = self.clock.now();
        let fees = calculate(
            &self.fees,
            payment.amount_cents,
            payment.method,
            payment.payment_type,
            payment.payee_id.and(payment.commission_rate_bps),
        )?;
        let change = PaymentTransition {
            fees: Some(fees),
            external_transaction_id: Some(external_id.clone()),
            validation_response: Some(raw),
            is_test: Some(is_test),
            ..PaymentTransition::to(PaymentStatus::Completed, now)
        };

        match self
            .payments
            .transition(payment.id, &[PaymentStatus::Processing], &change)
            .await
        {
            Ok(Some(done)) => {
                tracing::info!(
                    payment_id = %done.id,
                    external_transaction_id = %external_id,
                    amount_cents = done.amount_cents,
                    net_amount_cents = done.net_amount_cents,
                    is_test = done.is_test,
                    "Payment completed"
                );
                self.notifier
                    .notify(BillingEvent::PaymentCompleted {
                        payment: done.clone(),
                    })
                    .await;
                Ok(done)
            }
            Ok(None) => self.settled_by_other_writer(payment.id).await,
            Err(BillingError::AlreadyExists(_)) => {
                self.resolve_duplicate(payment, &external_id).await
            }
            Err(e) => Err(e),
        }
    }

    /// The provider transaction was already settled by another payment
    async fn resolve_duplicate(
        &self,
        payment: Payment,
        external_id: &str,
    ) -> BillingResult<Payment> {
        let existing = self
            .payments
            .find_completed_by_external_id(payment.method, external_id)
            .await?
            .ok_or_else(|| {
                BillingError::Internal(format!(
                    "Settled payment for {} transaction {} disappeared",
                    payment.method, external_id
                ))
            })?;

        let reason = format!("Duplicate of payment {}", existing.id);
        self.payments
            .transition(
                payment.id,
                &[PaymentStatus::Processing],
                &PaymentTransition::failed(reason, self.clock.now()),
            )
            .await?;

        if existing.payer_id != payment.payer_id {
            tracing::warn!(
                payment_id = %payment.id,
                existing_payment_id = %existing.id,
                "Provider transaction already redeemed by another payer"
            );
            return Err(BillingError::AlreadyExists(format!(
                "{} transaction {} was already redeemed",
                payment.method, external_id
            )));
        }

        tracing::info!(
            payment_id = %payment.id,
            existing_payment_id = %existing.id,
            "Duplicate validation resolved to existing payment"
        );
        Ok(existing)
    }

    async fn fail(
        &self,
        payment: Payment,
        reason: String,
        raw: Option<Value>,
    ) -> BillingResult<Payment> {
        let change = PaymentTransition {
            validation_response: raw,
            ..PaymentTransition::failed(reason.clone(), self.clock.now())
        };
        match self
            .payments
            .transition(payment.id, &[PaymentStatus::Processing], &change)
            .await?
        {
            Some(failed) => {
                tracing::warn!(
                    payment_id = %failed.id,
                    method = %failed.method,
                    reason = %reason,
                    "Payment failed"
                );
                self.notifier
                    .notify(BillingEvent::PaymentFailed {
                        payment: failed.clone(),
                        reason,
                    })
                    .await;
                Ok(failed)
            }
            None => self.settled_by_other_writer(payment.id).await,
        }
    }

    // =========================================================================
    // Other transitions
    // =========================================================================

    /// `pending -> cancelled`
    pub async fn cancel(&self, id: Uuid, reason: Option<String>) -> BillingResult<Payment> {
        let change = PaymentTransition {
            failure_reason: reason,
            ..PaymentTransition::to(PaymentStatus::Cancelled, self.clock.now())
        };
        match self
            .payments
            .transition(id, &[PaymentStatus::Pending], &change)
            .await?
        {
            Some(p) => {
                tracing::info!(payment_id = %id, "Payment cancelled");
                Ok(p)
            }
            None => {
                let current = self.get(id).await?;
                Err(BillingError::InvalidTransition {
                    from: current.status.to_string(),
                    to: PaymentStatus::Cancelled.to_string(),
                })
            }
        }
    }

    /// `completed -> refunded`, recording a linked refund entry.
    ///
    /// `amount_cents` defaults to the full amount; partial refunds up to the
    /// original amount are allowed. A payment is refunded at most once.
    pub async fn refund(
        &self,
        id: Uuid,
        amount_cents: Option<i64>,
        reason: Option<String>,
    ) -> BillingResult<Payment> {
        let original = self.get(id).await?;
        if original.payment_type == PaymentType::Refund {
            return Err(BillingError::InvalidInput(
                "A refund entry cannot itself be refunded".to_string(),
            ));
        }
        match original.status {
            PaymentStatus::Completed => {}
            PaymentStatus::Refunded => {
                return Err(BillingError::Conflict(format!(
                    "Payment {} is already refunded",
                    id
                )))
            }
            other => {
                return Err(BillingError::InvalidTransition {
                    from: other.to_string(),
                    to: PaymentStatus::Refunded.to_string(),
                })
            }
        }

        let amount = amount_cents.unwrap_or(original.amount_cents);
        if amount <= 0 || amount > original.amount_cents {
            return Err(BillingError::InvalidInput(format!(
                "Refund amount must be between 1 and {} cents, got {}",
                original.amount_cents, amount
            )));
        }

        let now = self.clock.now();
        let fees = calculate(
            &self.fees,
            amount,
            original.method,
            PaymentType::Refund,
            None,
        )?;
        let mut entry = Payment {
            id: Uuid::new_v4(),
            payment_type: PaymentType::Refund,
            status: PaymentStatus::Completed,
            amount_cents: amount,
            commission_rate_bps: None,
            purchase_reference: None,
            external_transaction_id: None,
            refund_of: Some(original.id),
            refunded_amount_cents: 0,
            refund_reason: reason.clone(),
            refunded_at: None,
            provider_payload: None,
            validation_response: None,
            failure_reason: None,
            expires_at: None,
            completed_at: Some(now),
            created_at: now,
            updated_at: now,
            ..original.clone()
        };
        entry.apply_fees(fees);

        let record = RefundRecord {
            amount_cents: amount,
            reason,
            at: now,
            entry,
        };
        match self.payments.refund(id, &record).await? {
            Some(refunded) => {
                tracing::info!(
                    payment_id = %id,
                    refund_payment_id = %record.entry.id,
                    amount_cents = amount,
                    "Payment refunded"
                );
                Ok(refunded)
            }
            None => Err(BillingError::Conflict(format!(
                "Payment {} changed while refunding",
                id
            ))),
        }
    }

    /// Apply an asynchronous provider report.
    ///
    /// Callbacks arrive unauthenticated, so the report is only a trigger: the
    /// payment is settled with what the provider answers when asked again. A
    /// reported success the provider does not confirm is rejected with
    /// `ValidationFailed` and leaves the payment untouched.
    ///
    /// Reports that arrive after the payment left `pending`/`processing`
    /// (expired, cancelled, failed) are rejected with `Conflict` and change
    /// nothing. A repeated success report for the same transaction is a no-op.
    pub async fn provider_callback(
        &self,
        id: Uuid,
        outcome: CallbackOutcome,
    ) -> BillingResult<Payment> {
        let payment = self.get(id).await?;
        match payment.status {
            PaymentStatus::Pending | PaymentStatus::Processing => {}
            PaymentStatus::Completed | PaymentStatus::Refunded => {
                return match &outcome {
                    CallbackOutcome::Succeeded {
                        external_transaction_id,
                        ..
                    } if payment.external_transaction_id.as_deref()
                        == Some(external_transaction_id.as_str()) =>
                    {
                        Ok(payment)
                    }
                    _ => Err(self.late_callback(&payment)),
                }
            }
            _ => return Err(self.late_callback(&payment)),
        }

        let request = validation_request(&payment)?;
        let provider = self.providers.get(payment.method)?;
        let verdict = match (provider.validate(&request).await?, &outcome) {
            (Verification::Invalid { reason }, CallbackOutcome::Succeeded { .. }) => {
                tracing::warn!(
                    payment_id = %id,
                    method = %payment.method,
                    reason = %reason,
                    "Provider did not confirm reported success, ignoring callback"
                );
                return Err(BillingError::ValidationFailed(format!(
                    "{} did not confirm payment {}: {}",
                    payment.method, id, reason
                )));
            }
            (verdict, _) => verdict,
        };
        if let (
            Verification::Valid { external_id, .. },
            CallbackOutcome::Succeeded {
                external_transaction_id,
                ..
            },
        ) = (&verdict, &outcome)
        {
            if external_id != external_transaction_id {
                tracing::warn!(
                    payment_id = %id,
                    reported = %external_transaction_id,
                    confirmed = %external_id,
                    "Callback transaction id differs from the provider's"
                );
            }
        }

        let payment = match payment.status {
            PaymentStatus::Pending => match self.begin_processing(&payment).await? {
                Some(p) => p,
                None => return Err(self.late_callback(&self.get(id).await?)),
            },
            _ => payment,
        };
        self.settle(payment, Ok(verdict)).await
    }

    fn late_callback(&self, payment: &Payment) -> BillingError {
        tracing::warn!(
            payment_id = %payment.id,
            status = %payment.status,
            "Ignoring late provider callback"
        );
        BillingError::Conflict(format!(
            "Payment {} is already {}",
            payment.id, payment.status
        ))
    }

    /// Expire pending payments past their window. Used by the renewal sweep.
    pub async fn expire_stale(&self) -> BillingResult<Vec<Payment>> {
        let expired = self.payments.expire_pending(self.clock.now()).await?;
        for payment in &expired {
            tracing::info!(payment_id = %payment.id, "Pending payment expired");
        }
        Ok(expired)
    }

    // =========================================================================
    // Queries
    // =========================================================================

    pub async fn get(&self, id: Uuid) -> BillingResult<Payment> {
        self.payments
            .get(id)
            .await?
            .ok_or_else(|| BillingError::NotFound(format!("payment {}", id)))
    }

    pub async fn list(
        &self,
        filter: &PaymentFilter,
        page: Pagination,
    ) -> BillingResult<PaginatedResponse<Payment>> {
        let page = page.normalized();
        let (data, total) = self.payments.list(filter, page).await?;
        Ok(PaginatedResponse::new(data, total, page.page, page.limit))
    }
}

/// What to ask the provider about a recorded payment
fn validation_request(payment: &Payment) -> BillingResult<ValidationRequest> {
    let Some(reference) = payment.purchase_reference.clone() else {
        return Err(BillingError::InvalidInput(format!(
            "Payment {} has no purchase reference to validate",
            payment.id
        )));
    };
    Ok(ValidationRequest {
        reference,
        provider_product_id: payment.provider_product_id.clone(),
        payload: payment.provider_payload.clone().unwrap_or(Value::Null),
    })
}

fn normalize_currency(raw: Option<&str>, default: &str) -> BillingResult<String> {
    let currency = raw.unwrap_or(default).trim().to_uppercase();
    if currency.len() != 3 || !currency.chars().all(|c| c.is_ascii_alphabetic()) {
        return Err(BillingError::InvalidInput(format!(
            "Invalid currency code: {}",
            currency
        )));
    }
    Ok(currency)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::email::NoopNotifier;
    use crate::store::InMemoryPaymentRepository;
    use crate::testing::{FakeProvider, Scripted};
    use coachpay_shared::FakeClock;
    use time::macros::datetime;

    struct Harness {
        ledger: PaymentLedger,
        clock: Arc<FakeClock>,
        provider: Arc<FakeProvider>,
    }

    fn harness() -> Harness {
        let clock = Arc::new(FakeClock::new(datetime!(2026-04-01 12:00 UTC)));
        let provider = Arc::new(FakeProvider::new(PaymentMethod::Card));
        let ledger = PaymentLedger::new(
            Arc::new(InMemoryPaymentRepository::new()),
            ProviderRegistry::new().with(provider.clone()),
            FeeSchedule::default(),
            clock.clone(),
            Arc::new(NoopNotifier),
            Duration::minutes(15),
            "USD",
        );
        Harness {
            ledger,
            clock,
            provider,
        }
    }

    fn purchase(payer: Uuid, reference: &str, amount: i64) -> NewPayment {
        NewPayment {
            payer_id: payer,
            payee_id: None,
            method: PaymentMethod::Card,
            payment_type: PaymentType::OneTime,
            amount_cents: amount,
            currency: None,
            commission_rate_bps: None,
            purchase_reference: Some(reference.to_string()),
            provider_product_id: None,
            subscription_id: None,
            product_id: None,
            provider_payload: None,
        }
    }

    #[tokio::test]
    async fn test_create_sets_expiry() {
        let h = harness();
        let p = h.ledger.create(purchase(Uuid::new_v4(), "pi_1", 5000)).await.unwrap();
        assert_eq!(p.status, PaymentStatus::Pending);
        assert_eq!(p.expires_at, Some(datetime!(2026-04-01 12:15 UTC)));
        assert_eq!(p.currency, "USD");
    }

    #[tokio::test]
    async fn test_create_rejects_disabled_rail() {
        let h = harness();
        let mut input = purchase(Uuid::new_v4(), "tok", 5000);
        input.method = PaymentMethod::GooglePlay;
        assert!(matches!(
            h.ledger.create(input).await,
            Err(BillingError::InvalidInput(_))
        ));
    }

    #[tokio::test]
    async fn test_validate_completes_with_balanced_fees() {
        let h = harness();
        h.provider.script(Scripted::valid("ch_1", Some(8900)));
        let payer = Uuid::new_v4();
        let mut input = purchase(payer, "pi_1", 8900);
        input.payee_id = Some(Uuid::new_v4());
        input.commission_rate_bps = Some(2000);

        let p = h.ledger.submit(input).await.unwrap();
        assert_eq!(p.status, PaymentStatus::Completed);
        assert_eq!(p.external_transaction_id.as_deref(), Some("ch_1"));
        assert_eq!(p.platform_commission_cents, 1780);
        assert_eq!(p.payee_earnings_cents, 7120);
        assert_eq!(
            p.amount_cents,
            p.platform_fee_cents + p.service_fee_cents + p.net_amount_cents
        );
        assert_eq!(p.completed_at, Some(h.clock.now()));
    }

    #[tokio::test]
    async fn test_resubmitting_same_purchase_returns_original() {
        let h = harness();
        h.provider.script(Scripted::valid("ch_1", None));
        let payer = Uuid::new_v4();

        let first = h.ledger.submit(purchase(payer, "pi_1", 2500)).await.unwrap();
        let second = h.ledger.submit(purchase(payer, "pi_1", 2500)).await.unwrap();
        assert_eq!(first.id, second.id);
        assert_eq!(h.provider.validate_calls(), 1);

        let (all, total) = h
            .ledger
            .payments
            .list(&PaymentFilter::default(), Pagination::default())
            .await
            .unwrap();
        assert_eq!(total, 1);
        assert_eq!(all[0].status, PaymentStatus::Completed);
    }

    #[tokio::test]
    async fn test_duplicate_provider_transaction_resolves_to_existing() {
        let h = harness();
        h.provider.script(Scripted::valid("ch_same", None));
        let payer = Uuid::new_v4();

        let a = h.ledger.create(purchase(payer, "ref-a", 1000)).await.unwrap();
        let b = h.ledger.create(purchase(payer, "ref-b", 1000)).await.unwrap();
        let first = h.ledger.validate(a.id).await.unwrap();
        let second = h.ledger.validate(b.id).await.unwrap();

        assert_eq!(first.id, a.id);
        assert_eq!(second.id, a.id);
        let loser = h.ledger.get(b.id).await.unwrap();
        assert_eq!(loser.status, PaymentStatus::Failed);
    }

    #[tokio::test]
    async fn test_invalid_receipt_fails_payment() {
        let h = harness();
        h.provider.script(Scripted::invalid("receipt forged"));
        let p = h
            .ledger
            .submit(purchase(Uuid::new_v4(), "pi_bad", 1000))
            .await
            .unwrap();
        assert_eq!(p.status, PaymentStatus::Failed);
        assert_eq!(p.failure_reason.as_deref(), Some("receipt forged"));
        assert_eq!(p.net_amount_cents, 0);
    }

    #[tokio::test]
    async fn test_transient_exhaustion_fails_payment() {
        let h = harness();
        h.provider.script(Scripted::transient("timeout"));
        let p = h
            .ledger
            .submit(purchase(Uuid::new_v4(), "pi_slow", 1000))
            .await
            .unwrap();
        assert_eq!(p.status, PaymentStatus::Failed);
    }

    #[tokio::test]
    async fn test_amount_mismatch_fails_payment() {
        let h = harness();
        h.provider.script(Scripted::valid("ch_1", Some(100)));
        let p = h
            .ledger
            .submit(purchase(Uuid::new_v4(), "pi_1", 1000))
            .await
            .unwrap();
        assert_eq!(p.status, PaymentStatus::Failed);
        assert!(p.failure_reason.unwrap().contains("Amount mismatch"));
    }

    fn reported_success(external_id: &str) -> CallbackOutcome {
        CallbackOutcome::Succeeded {
            external_transaction_id: external_id.to_string(),
        }
    }

    #[tokio::test]
    async fn test_expired_payment_rejects_late_callback() {
        let h = harness();
        let p = h.ledger.create(purchase(Uuid::new_v4(), "pi_late", 1000)).await.unwrap();
        h.clock.advance(Duration::minutes(16));
        let expired = h.ledger.expire_stale().await.unwrap();
        assert_eq!(expired.len(), 1);

        let err = h
            .ledger
            .provider_callback(p.id, reported_success("ch_late"))
            .await
            .unwrap_err();
        assert!(matches!(err, BillingError::Conflict(_)));
        let stored = h.ledger.get(p.id).await.unwrap();
        assert_eq!(stored.status, PaymentStatus::Expired);
        assert!(stored.external_transaction_id.is_none());
        assert_eq!(h.provider.validate_calls(), 0);
    }

    #[tokio::test]
    async fn test_callback_completes_pending_payment_once() {
        let h = harness();
        h.provider.script(Scripted::Valid {
            external_id: "ch_cb".into(),
            amount_cents: Some(1000),
            is_test: true,
        });
        let p = h.ledger.create(purchase(Uuid::new_v4(), "pi_cb", 1000)).await.unwrap();
        let done = h
            .ledger
            .provider_callback(p.id, reported_success("ch_cb"))
            .await
            .unwrap();
        assert_eq!(done.status, PaymentStatus::Completed);
        assert!(done.is_test);
        assert_eq!(h.provider.validate_calls(), 1);

        let again = h
            .ledger
            .provider_callback(p.id, reported_success("ch_cb"))
            .await
            .unwrap();
        assert_eq!(again.completed_at, done.completed_at);
        assert_eq!(h.provider.validate_calls(), 1);
    }

    #[tokio::test]
    async fn test_unconfirmed_success_callback_changes_nothing() {
        let h = harness();
        h.provider.script(Scripted::invalid("no such payment intent"));
        let p = h.ledger.create(purchase(Uuid::new_v4(), "pi_forged", 1000)).await.unwrap();

        let err = h
            .ledger
            .provider_callback(p.id, reported_success("anything"))
            .await
            .unwrap_err();
        assert!(matches!(err, BillingError::ValidationFailed(_)));
        let stored = h.ledger.get(p.id).await.unwrap();
        assert_eq!(stored.status, PaymentStatus::Pending);
        assert!(stored.external_transaction_id.is_none());
        assert_eq!(stored.net_amount_cents, 0);
    }

    #[tokio::test]
    async fn test_callback_settles_with_provider_amount_not_reported_one() {
        let h = harness();
        h.provider.script(Scripted::valid("ch_real", Some(100)));
        let p = h.ledger.create(purchase(Uuid::new_v4(), "pi_short", 1000)).await.unwrap();

        let settled = h
            .ledger
            .provider_callback(p.id, reported_success("ch_real"))
            .await
            .unwrap();
        assert_eq!(settled.status, PaymentStatus::Failed);
        assert!(settled.failure_reason.unwrap().contains("Amount mismatch"));
    }

    #[tokio::test]
    async fn test_cancel_only_from_pending() {
        let h = harness();
        h.provider.script(Scripted::valid("ch_1", None));
        let p = h.ledger.create(purchase(Uuid::new_v4(), "pi_1", 1000)).await.unwrap();
        let cancelled = h.ledger.cancel(p.id, Some("changed mind".into())).await.unwrap();
        assert_eq!(cancelled.status, PaymentStatus::Cancelled);

        let err = h.ledger.cancel(p.id, None).await.unwrap_err();
        assert!(matches!(err, BillingError::InvalidTransition { .. }));
    }

    #[tokio::test]
    async fn test_partial_refund_creates_linked_entry() {
        let h = harness();
        h.provider.script(Scripted::valid("ch_1", None));
        let p = h
            .ledger
            .submit(purchase(Uuid::new_v4(), "pi_1", 5000))
            .await
            .unwrap();

        let refunded = h
            .ledger
            .refund(p.id, Some(2000), Some("missed session".into()))
            .await
            .unwrap();
        assert_eq!(refunded.status, PaymentStatus::Refunded);
        assert_eq!(refunded.refunded_amount_cents, 2000);

        let (entries, _) = h
            .ledger
            .payments
            .list(
                &PaymentFilter {
                    payment_type: Some(PaymentType::Refund),
                    ..Default::default()
                },
                Pagination::default(),
            )
            .await
            .unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].refund_of, Some(p.id));
        assert_eq!(entries[0].amount_cents, 2000);
        assert_eq!(entries[0].net_amount_cents, 2000);

        let err = h.ledger.refund(p.id, None, None).await.unwrap_err();
        assert!(matches!(err, BillingError::Conflict(_)));
    }

    #[tokio::test]
    async fn test_refund_over_amount_is_rejected() {
        let h = harness();
        h.provider.script(Scripted::valid("ch_1", None));
        let p = h
            .ledger
            .submit(purchase(Uuid::new_v4(), "pi_1", 5000))
            .await
            .unwrap();
        assert!(matches!(
            h.ledger.refund(p.id, Some(5001), None).await,
            Err(BillingError::InvalidInput(_))
        ));
    }
}
