//! Test doubles for the billing core
//!
//! A scriptable [`PaymentProvider`] and record fixtures, shared by the unit
//! tests and the integration tests under `tests/`.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use coachpay_shared::{
    BillingCycle, PaymentMethod, PaymentStatus, PaymentType, Plan, SubscriberKind,
    SubscriptionStatus,
};
use serde_json::json;
use time::macros::datetime;
use uuid::Uuid;

use crate::fees::{calculate, FeeSchedule};
use crate::models::{ExternalIds, Payment, Subscription};
use crate::providers::{
    PaymentProvider, ProviderError, RenewalRequest, ValidationRequest, Verification,
};

/// Canned provider answer
#[derive(Debug, Clone, PartialEq)]
pub enum Scripted {
    Valid {
        external_id: String,
        amount_cents: Option<i64>,
        is_test: bool,
    },
    Invalid(String),
    Transient(String),
}

impl Scripted {
    pub fn valid(external_id: &str, amount_cents: Option<i64>) -> Self {
        Scripted::Valid {
            external_id: external_id.to_string(),
            amount_cents,
            is_test: false,
        }
    }

    pub fn invalid(reason: &str) -> Self {
        Scripted::Invalid(reason.to_string())
    }

    pub fn transient(message: &str) -> Self {
        Scripted::Transient(message.to_string())
    }

    fn answer(&self, external_id: String) -> Result<Verification, ProviderError> {
        match self {
            Scripted::Valid {
                amount_cents,
                is_test,
                ..
            } => Ok(Verification::Valid {
                amount_cents: *amount_cents,
                external_id,
                is_test: *is_test,
                raw: json!({ "fake": true }),
            }),
            Scripted::Invalid(reason) => Ok(Verification::invalid(reason.clone())),
            Scripted::Transient(msg) => Err(ProviderError::Transient(msg.clone())),
        }
    }
}

/// Provider whose answers are set by the test
pub struct FakeProvider {
    method: PaymentMethod,
    validation: Mutex<Scripted>,
    renewal: Mutex<Scripted>,
    delay: Mutex<Option<std::time::Duration>>,
    validate_calls: AtomicUsize,
    renewal_calls: AtomicUsize,
}

impl FakeProvider {
    /// Accepts everything until scripted otherwise
    pub fn new(method: PaymentMethod) -> Self {
        Self {
            method,
            validation: Mutex::new(Scripted::valid("fake-txn", None)),
            renewal: Mutex::new(Scripted::valid("fake-renewal", None)),
            delay: Mutex::new(None),
            validate_calls: AtomicUsize::new(0),
            renewal_calls: AtomicUsize::new(0),
        }
    }

    /// Answer for `validate`
    pub fn script(&self, answer: Scripted) {
        *self.validation.lock().unwrap_or_else(|e| e.into_inner()) = answer;
    }

    /// Answer for `charge_renewal`. Valid renewals get a distinct external id
    /// per charge.
    pub fn script_renewal(&self, answer: Scripted) {
        *self.renewal.lock().unwrap_or_else(|e| e.into_inner()) = answer;
    }

    /// Make every call take this long
    pub fn set_delay(&self, delay: std::time::Duration) {
        *self.delay.lock().unwrap_or_else(|e| e.into_inner()) = Some(delay);
    }

    pub fn validate_calls(&self) -> usize {
        self.validate_calls.load(Ordering::SeqCst)
    }

    pub fn renewal_calls(&self) -> usize {
        self.renewal_calls.load(Ordering::SeqCst)
    }

    async fn pause(&self) {
        let delay = *self.delay.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
    }
}

#[async_trait]
impl PaymentProvider for FakeProvider {
    fn method(&self) -> PaymentMethod {
        self.method
    }

    async fn validate(&self, _request: &ValidationRequest) -> Result<Verification, ProviderError> {
        self.validate_calls.fetch_add(1, Ordering::SeqCst);
        self.pause().await;
        let answer = self
            .validation
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone();
        let external_id = match &answer {
            Scripted::Valid { external_id, .. } => external_id.clone(),
            _ => String::new(),
        };
        answer.answer(external_id)
    }

    async fn charge_renewal(
        &self,
        request: &RenewalRequest,
    ) -> Result<Verification, ProviderError> {
        self.renewal_calls.fetch_add(1, Ordering::SeqCst);
        self.pause().await;
        let answer = self
            .renewal
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone();
        let external_id = match &answer {
            Scripted::Valid { external_id, .. } => {
                format!("{}-{}", external_id, request.idempotency_key())
            }
            _ => String::new(),
        };
        answer.answer(external_id)
    }
}

/// An active monthly coach subscription, not yet stored
pub fn subscription_fixture(subscriber_id: Uuid) -> Subscription {
    let now = datetime!(2026-01-15 10:00 UTC);
    let features: crate::models::FeatureTable =
        [("clients".to_string(), 10)].into_iter().collect();
    Subscription {
        id: Uuid::new_v4(),
        kind: SubscriberKind::Coach,
        subscriber_id,
        payee_id: None,
        product_id: None,
        plan: Plan::Starter,
        status: SubscriptionStatus::Active,
        billing_cycle: BillingCycle::Monthly,
        price_cents: 2900,
        currency: "USD".to_string(),
        commission_rate_bps: None,
        payment_method: Some(PaymentMethod::Card),
        start_date: now,
        trial_end: None,
        next_billing_date: Some(datetime!(2026-02-15 10:00 UTC)),
        last_billing_date: Some(now),
        current_period_start: Some(now),
        current_period_end: Some(datetime!(2026-02-15 10:00 UTC)),
        end_date: None,
        auto_renew: true,
        cancelled_at: None,
        cancellation_reason: None,
        cancelled_by: None,
        paused_at: None,
        failed_payment_attempts: 0,
        next_retry_at: None,
        usage: Subscription::zero_usage(&features),
        features,
        external_ids: ExternalIds::default(),
        upgrade_history: Vec::new(),
        renewal_claimed_until: None,
        version: 0,
        created_at: now,
        updated_at: now,
    }
}

/// A completed 50.00 USD card payment with default-schedule fees, not yet stored
pub fn payment_fixture(payer_id: Uuid) -> Payment {
    let now = datetime!(2026-01-15 10:00 UTC);
    let mut payment = Payment {
        id: Uuid::new_v4(),
        payer_id,
        payee_id: None,
        method: PaymentMethod::Card,
        payment_type: PaymentType::OneTime,
        status: PaymentStatus::Completed,
        amount_cents: 5000,
        currency: "USD".to_string(),
        platform_fee_cents: 0,
        service_fee_cents: 0,
        net_amount_cents: 0,
        platform_commission_cents: 0,
        payee_earnings_cents: 0,
        commission_rate_bps: None,
        purchase_reference: Some(format!("pi_{}", Uuid::new_v4().simple())),
        external_transaction_id: Some(format!("ch_{}", Uuid::new_v4().simple())),
        provider_product_id: None,
        subscription_id: None,
        product_id: None,
        refund_of: None,
        refunded_amount_cents: 0,
        refund_reason: None,
        refunded_at: None,
        provider_payload: None,
        validation_response: None,
        failure_reason: None,
        expires_at: None,
        completed_at: Some(now),
        is_test: true,
        created_at: now,
        updated_at: now,
    };
    if let Ok(fees) = calculate(
        &FeeSchedule::default(),
        payment.amount_cents,
        payment.method,
        payment.payment_type,
        None,
    ) {
        payment.apply_fees(fees);
    }
    payment
}
