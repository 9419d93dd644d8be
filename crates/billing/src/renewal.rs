//! Renewal sweep
//!
//! One sweep claims the subscriptions that are due, renews them through a
//! bounded pool, expires subscriptions whose end date passed and expires
//! stale pending payments. The worker runs it on a schedule; overlapping
//! sweeps are safe because claims hand each due row to one sweep and the
//! subscription service rechecks due-ness under the row's lock.

use std::sync::{Arc, Mutex};

use coachpay_shared::Clock;
use futures::StreamExt;
use serde::Serialize;

use crate::config::SweepConfig;
use crate::error::BillingResult;
use crate::ledger::PaymentLedger;
use crate::store::SubscriptionRepository;
use crate::subscriptions::{RenewalOutcome, SubscriptionService};

/// What one sweep did
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SweepReport {
    /// Due rows handed to this sweep
    pub claimed: usize,
    pub renewed: usize,
    /// Renewals that failed and left the subscription past due
    pub failed: usize,
    /// Subscriptions cancelled after the last dunning attempt
    pub cancelled: usize,
    /// Claimed rows that turned out not to need billing
    pub skipped: usize,
    pub expired_subscriptions: usize,
    pub expired_payments: usize,
    /// Due rows older than the lookback window, left for manual review
    pub stale: i64,
    /// Rows that hit an error and will be retried next sweep
    pub errors: usize,
}

impl SweepReport {
    fn record(&mut self, outcome: &RenewalOutcome) {
        match outcome {
            RenewalOutcome::Renewed { .. } => self.renewed += 1,
            RenewalOutcome::Failed { .. } => self.failed += 1,
            RenewalOutcome::Cancelled { .. } => self.cancelled += 1,
            RenewalOutcome::Skipped { .. } => self.skipped += 1,
        }
    }
}

pub struct RenewalScheduler {
    subscriptions: Arc<dyn SubscriptionRepository>,
    service: Arc<SubscriptionService>,
    ledger: Arc<PaymentLedger>,
    clock: Arc<dyn Clock>,
    config: SweepConfig,
}

impl RenewalScheduler {
    pub fn new(
        subscriptions: Arc<dyn SubscriptionRepository>,
        service: Arc<SubscriptionService>,
        ledger: Arc<PaymentLedger>,
        clock: Arc<dyn Clock>,
        config: SweepConfig,
    ) -> Self {
        Self {
            subscriptions,
            service,
            ledger,
            clock,
            config,
        }
    }

    /// Run one sweep. Per-row failures are counted in the report; only a
    /// failure to claim or list rows fails the sweep.
    pub async fn run_sweep(&self) -> BillingResult<SweepReport> {
        let now = self.clock.now();
        let not_before = now - self.config.lookback;
        let mut report = SweepReport::default();

        report.stale = self.subscriptions.count_stale_due(now, not_before).await?;
        if report.stale > 0 {
            tracing::warn!(
                stale = report.stale,
                lookback_days = self.config.lookback.whole_days(),
                "Due subscriptions outside the renewal lookback window were skipped"
            );
        }

        let claimed = self
            .subscriptions
            .claim_due(
                now,
                not_before,
                now + self.config.claim_ttl,
                self.config.batch_size,
            )
            .await?;
        report.claimed = claimed.len();

        let shared = Mutex::new(report);
        futures::stream::iter(claimed)
            .for_each_concurrent(self.config.concurrency.max(1), |sub| {
                let shared = &shared;
                async move {
                    let result = self.service.renew(sub.id).await;
                    {
                        let mut report = shared.lock().unwrap_or_else(|e| e.into_inner());
                        match &result {
                            Ok(outcome) => report.record(outcome),
                            Err(e) => {
                                report.errors += 1;
                                tracing::error!(
                                    subscription_id = %sub.id,
                                    error = %e,
                                    retryable = e.is_retryable(),
                                    "Renewal failed, will retry next sweep"
                                );
                            }
                        }
                    }
                    if let Err(e) = self.subscriptions.release_claim(sub.id).await {
                        tracing::warn!(
                            subscription_id = %sub.id,
                            error = %e,
                            "Failed to release renewal claim"
                        );
                    }
                }
            })
            .await;
        let mut report = shared.into_inner().unwrap_or_else(|e| e.into_inner());

        for sub in self
            .subscriptions
            .list_ended(self.clock.now(), self.config.batch_size)
            .await?
        {
            match self.service.expire(sub.id).await {
                Ok(Some(_)) => report.expired_subscriptions += 1,
                Ok(None) => {}
                Err(e) => {
                    report.errors += 1;
                    tracing::error!(
                        subscription_id = %sub.id,
                        error = %e,
                        "Failed to expire subscription"
                    );
                }
            }
        }

        match self.ledger.expire_stale().await {
            Ok(expired) => report.expired_payments = expired.len(),
            Err(e) => {
                report.errors += 1;
                tracing::error!(error = %e, "Failed to expire pending payments");
            }
        }

        tracing::info!(
            claimed = report.claimed,
            renewed = report.renewed,
            failed = report.failed,
            cancelled = report.cancelled,
            skipped = report.skipped,
            expired_subscriptions = report.expired_subscriptions,
            expired_payments = report.expired_payments,
            errors = report.errors,
            "Renewal sweep finished"
        );
        Ok(report)
    }
}
