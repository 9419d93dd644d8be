#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]

//! CoachPay Billing
//!
//! Payments from four rails, subscriptions for coaches and their clients,
//! usage quotas, renewals with dunning, and payee earnings.
//!
//! [`BillingService`] wires the pieces together over a set of [`Stores`];
//! the API server and the worker each build one.

pub mod catalog;
pub mod config;
pub mod directory;
pub mod earnings;
pub mod email;
pub mod entitlement;
pub mod error;
pub mod fees;
pub mod invariants;
pub mod ledger;
pub mod locks;
pub mod models;
pub mod plans;
pub mod providers;
pub mod renewal;
pub mod store;
pub mod subscriptions;
#[cfg(any(test, feature = "testing"))]
pub mod testing;
pub mod usage;

use std::sync::Arc;

use coachpay_shared::{Clock, PaymentStatus, PaymentType, SubscriptionStatus, SystemClock};
use serde::Serialize;
use sqlx::PgPool;
use time::Duration;
use uuid::Uuid;

pub use catalog::{CustomPlan, NewProduct, PlanTerms, ProductCatalog, MAX_TRIAL_DAYS};
pub use config::{BillingConfig, DunningPolicy, SweepConfig};
pub use directory::{InMemoryUserDirectory, PostgresUserDirectory, UserDirectory, UserProfile};
pub use earnings::{EarningsService, EarningsSummary, EarningsTotals};
pub use email::{BillingEvent, EmailConfig, EmailNotifier, NoopNotifier, Notifier};
pub use entitlement::{compute_entitlement, Entitlement, EntitlementService, EntitlementState};
pub use error::{BillingError, BillingResult};
pub use fees::{calculate, FeeBreakdown, FeeSchedule, MethodFee};
pub use invariants::{InvariantChecker, InvariantKind, InvariantReport, Violation};
pub use ledger::{CallbackOutcome, NewPayment, PaymentLedger};
pub use locks::KeyedLocks;
pub use models::{
    ExternalIds, FeatureTable, Payment, PlanChange, Product, StoreProductIds, Subscription,
    UsageSnapshot, UNLIMITED,
};
pub use plans::{PlanSetting, PlanSettings};
pub use providers::{PaymentProvider, ProviderError, ProviderRegistry, Verification};
pub use renewal::{RenewalScheduler, SweepReport};
pub use store::{PaymentFilter, SubscriptionFilter};
pub use subscriptions::{
    CancelRequest, NewSubscription, PlanChangeRequest, RenewalOutcome, SubscriptionService,
    SubscriptionUpdate,
};
pub use usage::{check_limit, LimitCheck, UsageGate, MAX_USAGE_INCREMENT};

use store::{
    InMemoryPaymentRepository, InMemoryProductRepository, InMemorySubscriptionRepository,
    PaymentRepository, PostgresPaymentRepository, PostgresProductRepository,
    PostgresSubscriptionRepository, ProductRepository, SubscriptionRepository,
};

/// Persistence behind a [`BillingService`]
#[derive(Clone)]
pub struct Stores {
    pub payments: Arc<dyn PaymentRepository>,
    pub subscriptions: Arc<dyn SubscriptionRepository>,
    pub products: Arc<dyn ProductRepository>,
    pub users: Arc<dyn UserDirectory>,
}

impl Stores {
    pub fn postgres(pool: PgPool) -> Self {
        Self {
            payments: Arc::new(PostgresPaymentRepository::new(pool.clone())),
            subscriptions: Arc::new(PostgresSubscriptionRepository::new(pool.clone())),
            products: Arc::new(PostgresProductRepository::new(pool.clone())),
            users: Arc::new(PostgresUserDirectory::new(pool)),
        }
    }

    /// Empty in-memory stores over the given user directory
    pub fn in_memory(users: Arc<dyn UserDirectory>) -> Self {
        Self {
            payments: Arc::new(InMemoryPaymentRepository::new()),
            subscriptions: Arc::new(InMemorySubscriptionRepository::new()),
            products: Arc::new(InMemoryProductRepository::new()),
            users,
        }
    }
}

/// A settled payment and the subscription it activated, if any
#[derive(Debug, Clone, Serialize)]
pub struct PaymentOutcome {
    pub payment: Payment,
    pub subscription: Option<Subscription>,
}

/// The billing core, assembled
#[derive(Clone)]
pub struct BillingService {
    pub catalog: Arc<ProductCatalog>,
    pub ledger: Arc<PaymentLedger>,
    pub subscriptions: Arc<SubscriptionService>,
    pub usage: Arc<UsageGate>,
    pub entitlements: Arc<EntitlementService>,
    pub earnings: Arc<EarningsService>,
    pub renewals: Arc<RenewalScheduler>,
    pub invariants: Arc<InvariantChecker>,
}

impl BillingService {
    pub fn new(
        config: &BillingConfig,
        stores: Stores,
        providers: ProviderRegistry,
        notifier: Arc<dyn Notifier>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let catalog = Arc::new(ProductCatalog::new(
            stores.products.clone(),
            config.plans.clone(),
            clock.clone(),
            config.default_currency.clone(),
        ));
        let ledger = Arc::new(PaymentLedger::new(
            stores.payments.clone(),
            providers,
            config.fees.clone(),
            clock.clone(),
            notifier.clone(),
            config.payment_expiry,
            config.default_currency.clone(),
        ));
        let subscriptions = Arc::new(SubscriptionService::new(
            stores.subscriptions.clone(),
            catalog.clone(),
            ledger.clone(),
            stores.users.clone(),
            clock.clone(),
            notifier,
            Arc::new(KeyedLocks::new()),
            config.dunning.clone(),
            config.cancellation_grace,
        ));
        let renewals = Arc::new(RenewalScheduler::new(
            stores.subscriptions.clone(),
            subscriptions.clone(),
            ledger.clone(),
            clock.clone(),
            config.sweep.clone(),
        ));
        let invariants = Arc::new(InvariantChecker::new(
            stores.payments.clone(),
            stores.subscriptions.clone(),
            clock.clone(),
            config.sweep.lookback.max(Duration::hours(1)),
        ));

        Self {
            catalog,
            ledger,
            usage: Arc::new(UsageGate::new(stores.subscriptions.clone(), clock.clone())),
            entitlements: Arc::new(EntitlementService::new(stores.subscriptions, clock)),
            earnings: Arc::new(EarningsService::new(stores.payments)),
            subscriptions,
            renewals,
            invariants,
        }
    }

    /// Production wiring: Postgres stores, providers and email from the
    /// environment, wall clock
    pub fn from_env(pool: PgPool) -> BillingResult<Self> {
        let config = BillingConfig::from_env()?;
        let providers = ProviderRegistry::from_env(&config.provider_retry)?;
        let stores = Stores::postgres(pool);

        let email = EmailConfig::from_env();
        let notifier: Arc<dyn Notifier> = if email.is_enabled() {
            Arc::new(EmailNotifier::new(email, stores.users.clone()))
        } else {
            tracing::warn!("RESEND_API_KEY not set, billing emails disabled");
            Arc::new(NoopNotifier)
        };

        Ok(Self::new(
            &config,
            stores,
            providers,
            notifier,
            Arc::new(SystemClock),
        ))
    }

    /// Record a pending payment without validating it
    pub async fn create_payment(&self, input: NewPayment) -> BillingResult<Payment> {
        let input = self.bind_to_subscription(input).await?;
        self.ledger.create(input).await
    }

    /// Submit a purchase and, once it settles, activate the subscription it pays for
    pub async fn submit_payment(&self, input: NewPayment) -> BillingResult<PaymentOutcome> {
        let input = self.bind_to_subscription(input).await?;
        let payment = self.ledger.submit(input).await?;
        self.after_settlement(payment).await
    }

    /// Payments toward a subscription are made on its stored terms: payee,
    /// commission, currency and, for subscription charges, the price never
    /// come from the caller.
    async fn bind_to_subscription(&self, mut input: NewPayment) -> BillingResult<NewPayment> {
        let Some(subscription_id) = input.subscription_id else {
            return Ok(input);
        };
        let sub = self.subscriptions.get(subscription_id).await?;
        if input.payer_id != sub.subscriber_id {
            return Err(BillingError::InvalidInput(format!(
                "Payments for subscription {} must come from its subscriber",
                sub.id
            )));
        }

        let commission = sub.payee_id.and(sub.commission_rate_bps);
        let charges_price = input.payment_type == PaymentType::Subscription;
        if input.payee_id != sub.payee_id
            || input.commission_rate_bps != commission
            || (charges_price && input.amount_cents != sub.price_cents)
        {
            tracing::warn!(
                subscription_id = %sub.id,
                payer_id = %input.payer_id,
                "Payment terms differ from the subscription, using the subscription's"
            );
        }
        input.payee_id = sub.payee_id;
        input.commission_rate_bps = commission;
        input.currency = Some(sub.currency);
        input.product_id = sub.product_id;
        if charges_price {
            input.amount_cents = sub.price_cents;
        }
        Ok(input)
    }

    /// Validate a recorded payment and activate its subscription on success
    pub async fn validate_payment(&self, id: Uuid) -> BillingResult<PaymentOutcome> {
        let payment = self.ledger.validate(id).await?;
        self.after_settlement(payment).await
    }

    /// Apply a provider callback and activate the subscription on success
    pub async fn provider_callback(
        &self,
        id: Uuid,
        outcome: CallbackOutcome,
    ) -> BillingResult<PaymentOutcome> {
        let payment = self.ledger.provider_callback(id, outcome).await?;
        self.after_settlement(payment).await
    }

    async fn after_settlement(&self, payment: Payment) -> BillingResult<PaymentOutcome> {
        let Some(subscription_id) = payment.subscription_id else {
            return Ok(PaymentOutcome {
                payment,
                subscription: None,
            });
        };
        if payment.status != PaymentStatus::Completed
            || payment.payment_type != PaymentType::Subscription
        {
            return Ok(PaymentOutcome {
                payment,
                subscription: None,
            });
        }

        let current = self.subscriptions.get(subscription_id).await?;
        if !matches!(
            current.status,
            SubscriptionStatus::Pending | SubscriptionStatus::Trial
        ) {
            return Ok(PaymentOutcome {
                payment,
                subscription: Some(current),
            });
        }

        match self.subscriptions.activate(subscription_id, &payment).await {
            Ok(sub) => Ok(PaymentOutcome {
                payment,
                subscription: Some(sub),
            }),
            Err(e) if e.is_retryable() => Err(e),
            Err(e) => {
                // The money is recorded either way; activation can be retried
                tracing::warn!(
                    payment_id = %payment.id,
                    subscription_id = %subscription_id,
                    error = %e,
                    "Payment completed but subscription was not activated"
                );
                Ok(PaymentOutcome {
                    payment,
                    subscription: Some(current),
                })
            }
        }
    }
}
