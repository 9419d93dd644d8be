//! Payee earnings
//!
//! Sums what coaches earned from client payments over a window, net of the
//! platform commission and of refunds. Refunded amounts are taken back from
//! the coach in proportion to the refunded share of the payment.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde::Serialize;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::error::{BillingError, BillingResult};
use crate::fees::round_half_even;
use crate::models::Payment;
use crate::store::PaymentRepository;

/// Totals in one currency
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct EarningsTotals {
    pub payment_count: i64,
    pub gross_cents: i64,
    pub processing_fees_cents: i64,
    pub platform_commission_cents: i64,
    pub earnings_cents: i64,
    pub refunded_cents: i64,
    /// Earnings minus the payee's share of refunds
    pub net_earnings_cents: i64,
}

impl EarningsTotals {
    fn add(&mut self, payment: &Payment) {
        self.payment_count += 1;
        self.gross_cents += payment.amount_cents;
        self.processing_fees_cents += payment.platform_fee_cents + payment.service_fee_cents;
        self.platform_commission_cents += payment.platform_commission_cents;
        self.earnings_cents += payment.payee_earnings_cents;
        self.refunded_cents += payment.refunded_amount_cents;
        self.net_earnings_cents += payment.payee_earnings_cents - refunded_earnings(payment);
    }
}

/// Payee's share of a refund: earnings scaled by refunded / amount
fn refunded_earnings(payment: &Payment) -> i64 {
    if payment.refunded_amount_cents <= 0 || payment.amount_cents <= 0 {
        return 0;
    }
    if payment.refunded_amount_cents >= payment.amount_cents {
        return payment.payee_earnings_cents;
    }
    round_half_even(
        i128::from(payment.payee_earnings_cents) * i128::from(payment.refunded_amount_cents),
        i128::from(payment.amount_cents),
    )
}

#[derive(Debug, Clone, Serialize)]
pub struct EarningsSummary {
    pub payee_id: Uuid,
    #[serde(with = "time::serde::rfc3339")]
    pub from: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub to: OffsetDateTime,
    /// Keyed by ISO currency code
    pub totals: BTreeMap<String, EarningsTotals>,
}

pub struct EarningsService {
    payments: Arc<dyn PaymentRepository>,
}

impl EarningsService {
    pub fn new(payments: Arc<dyn PaymentRepository>) -> Self {
        Self { payments }
    }

    /// Settled payments to `payee_id` completed within `[from, to)`
    pub async fn summary(
        &self,
        payee_id: Uuid,
        from: OffsetDateTime,
        to: OffsetDateTime,
    ) -> BillingResult<EarningsSummary> {
        if from >= to {
            return Err(BillingError::InvalidInput(format!(
                "Empty earnings window: {} .. {}",
                from, to
            )));
        }
        let payments = self.payments.settled_for_payee(payee_id, from, to).await?;
        let mut totals: BTreeMap<String, EarningsTotals> = BTreeMap::new();
        for payment in &payments {
            totals
                .entry(payment.currency.clone())
                .or_default()
                .add(payment);
        }
        Ok(EarningsSummary {
            payee_id,
            from,
            to,
            totals,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::email::NoopNotifier;
    use crate::fees::FeeSchedule;
    use crate::ledger::{NewPayment, PaymentLedger};
    use crate::providers::ProviderRegistry;
    use crate::store::InMemoryPaymentRepository;
    use crate::testing::{FakeProvider, Scripted};
    use coachpay_shared::{FakeClock, PaymentMethod, PaymentType};
    use time::macros::datetime;
    use time::Duration;

    fn client_payment(payer: Uuid, coach: Uuid, reference: &str) -> NewPayment {
        NewPayment {
            payer_id: payer,
            payee_id: Some(coach),
            method: PaymentMethod::Card,
            payment_type: PaymentType::Subscription,
            amount_cents: 8900,
            currency: None,
            commission_rate_bps: Some(2000),
            purchase_reference: Some(reference.to_string()),
            provider_product_id: None,
            subscription_id: None,
            product_id: None,
            provider_payload: None,
        }
    }

    #[tokio::test]
    async fn test_summary_nets_commission_and_refunds() {
        let clock = Arc::new(FakeClock::new(datetime!(2026-03-10 09:00 UTC)));
        let repo = Arc::new(InMemoryPaymentRepository::new());
        let provider = Arc::new(FakeProvider::new(PaymentMethod::Card));
        let ledger = PaymentLedger::new(
            repo.clone(),
            ProviderRegistry::new().with(provider.clone()),
            FeeSchedule::default(),
            clock.clone(),
            Arc::new(NoopNotifier),
            Duration::minutes(15),
            "USD",
        );
        let coach = Uuid::new_v4();

        provider.script(Scripted::valid("ch_a", Some(8900)));
        ledger
            .submit(client_payment(Uuid::new_v4(), coach, "pi_a"))
            .await
            .unwrap();
        provider.script(Scripted::valid("ch_b", Some(8900)));
        let b = ledger
            .submit(client_payment(Uuid::new_v4(), coach, "pi_b"))
            .await
            .unwrap();
        ledger
            .refund(b.id, Some(4450), Some("missed session".into()))
            .await
            .unwrap();

        let summary = EarningsService::new(repo)
            .summary(coach, datetime!(2026-03-01 00:00 UTC), datetime!(2026-04-01 00:00 UTC))
            .await
            .unwrap();
        let usd = summary.totals["USD"];
        assert_eq!(usd.payment_count, 2);
        assert_eq!(usd.gross_cents, 17_800);
        assert_eq!(usd.platform_commission_cents, 3_560);
        assert_eq!(usd.earnings_cents, 14_240);
        assert_eq!(usd.refunded_cents, 4_450);
        assert_eq!(usd.net_earnings_cents, 14_240 - 3_560);
    }

    #[tokio::test]
    async fn test_empty_window_is_rejected() {
        let service = EarningsService::new(Arc::new(InMemoryPaymentRepository::new()));
        let at = datetime!(2026-03-01 00:00 UTC);
        assert!(matches!(
            service.summary(Uuid::new_v4(), at, at).await,
            Err(BillingError::InvalidInput(_))
        ));
    }
}
