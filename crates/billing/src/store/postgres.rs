//! Postgres repositories (sqlx runtime queries)

use async_trait::async_trait;
use coachpay_shared::{
    BillingCycle, Pagination, PaymentMethod, PaymentStatus, Plan, SubscriberKind,
};
use sqlx::types::Json;
use sqlx::{PgPool, Postgres, QueryBuilder};
use time::OffsetDateTime;
use uuid::Uuid;

use super::{
    PaymentFilter, PaymentRepository, PaymentTransition, ProductRepository, RefundRecord,
    SubscriptionFilter, SubscriptionRepository, UsageIncrement,
};
use crate::error::{BillingError, BillingResult};
use crate::models::{Payment, Product, Subscription};

// =============================================================================
// Payments
// =============================================================================

#[derive(Clone)]
pub struct PostgresPaymentRepository {
    pool: PgPool,
}

impl PostgresPaymentRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

async fn insert_payment<'e, E>(executor: E, p: &Payment) -> BillingResult<()>
where
    E: sqlx::Executor<'e, Database = Postgres>,
{
    sqlx::query(
        r#"
        INSERT INTO payments (
            id, payer_id, payee_id, method, payment_type, status,
            amount_cents, currency, platform_fee_cents, service_fee_cents, net_amount_cents,
            platform_commission_cents, payee_earnings_cents, commission_rate_bps,
            purchase_reference, external_transaction_id, provider_product_id,
            subscription_id, product_id, refund_of, refunded_amount_cents, refund_reason,
            refunded_at, provider_payload, validation_response, failure_reason,
            expires_at, completed_at, is_test,
            created_at, updated_at
        )
        VALUES (
            $1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17,
            $18, $19, $20, $21, $22, $23, $24, $25, $26, $27, $28, $29, $30, $31
        )
        "#,
    )
    .bind(p.id)
    .bind(p.payer_id)
    .bind(p.payee_id)
    .bind(p.method)
    .bind(p.payment_type)
    .bind(p.status)
    .bind(p.amount_cents)
    .bind(&p.currency)
    .bind(p.platform_fee_cents)
    .bind(p.service_fee_cents)
    .bind(p.net_amount_cents)
    .bind(p.platform_commission_cents)
    .bind(p.payee_earnings_cents)
    .bind(p.commission_rate_bps)
    .bind(&p.purchase_reference)
    .bind(&p.external_transaction_id)
    .bind(&p.provider_product_id)
    .bind(p.subscription_id)
    .bind(p.product_id)
    .bind(p.refund_of)
    .bind(p.refunded_amount_cents)
    .bind(&p.refund_reason)
    .bind(p.refunded_at)
    .bind(&p.provider_payload)
    .bind(&p.validation_response)
    .bind(&p.failure_reason)
    .bind(p.expires_at)
    .bind(p.completed_at)
    .bind(p.is_test)
    .bind(p.created_at)
    .bind(p.updated_at)
    .execute(executor)
    .await?;
    Ok(())
}

fn status_strings(statuses: &[PaymentStatus]) -> Vec<String> {
    statuses.iter().map(|s| s.as_str().to_string()).collect()
}

fn push_payment_filter(qb: &mut QueryBuilder<'_, Postgres>, filter: &PaymentFilter) {
    qb.push(" WHERE TRUE");
    if let Some(v) = filter.payer_id {
        qb.push(" AND payer_id = ").push_bind(v);
    }
    if let Some(v) = filter.payee_id {
        qb.push(" AND payee_id = ").push_bind(v);
    }
    if let Some(v) = filter.subscription_id {
        qb.push(" AND subscription_id = ").push_bind(v);
    }
    if let Some(v) = filter.status {
        qb.push(" AND status = ").push_bind(v.as_str());
    }
    if let Some(v) = filter.method {
        qb.push(" AND method = ").push_bind(v.as_str());
    }
    if let Some(v) = filter.payment_type {
        qb.push(" AND payment_type = ").push_bind(v.as_str());
    }
}

#[async_trait]
impl PaymentRepository for PostgresPaymentRepository {
    async fn insert(&self, payment: &Payment) -> BillingResult<()> {
        insert_payment(&self.pool, payment).await
    }

    async fn get(&self, id: Uuid) -> BillingResult<Option<Payment>> {
        let payment = sqlx::query_as::<_, Payment>("SELECT * FROM payments WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(payment)
    }

    async fn find_by_reference(
        &self,
        payer_id: Uuid,
        method: PaymentMethod,
        provider_product_id: Option<&str>,
        reference: &str,
    ) -> BillingResult<Option<Payment>> {
        let payment = sqlx::query_as::<_, Payment>(
            r#"
            SELECT * FROM payments
            WHERE payer_id = $1
              AND method = $2
              AND provider_product_id IS NOT DISTINCT FROM $3
              AND purchase_reference = $4
              AND status NOT IN ('failed', 'expired', 'cancelled')
            ORDER BY created_at DESC
            LIMIT 1
            "#,
        )
        .bind(payer_id)
        .bind(method)
        .bind(provider_product_id)
        .bind(reference)
        .fetch_optional(&self.pool)
        .await?;
        Ok(payment)
    }

    async fn find_completed_by_external_id(
        &self,
        method: PaymentMethod,
        external_transaction_id: &str,
    ) -> BillingResult<Option<Payment>> {
        let payment = sqlx::query_as::<_, Payment>(
            r#"
            SELECT * FROM payments
            WHERE method = $1
              AND external_transaction_id = $2
              AND status IN ('completed', 'refunded')
              AND payment_type <> 'refund'
            "#,
        )
        .bind(method)
        .bind(external_transaction_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(payment)
    }

    async fn transition(
        &self,
        id: Uuid,
        from: &[PaymentStatus],
        change: &PaymentTransition,
    ) -> BillingResult<Option<Payment>> {
        let fees = change.fees;
        let payment = sqlx::query_as::<_, Payment>(
            r#"
            UPDATE payments SET
                status = $2,
                updated_at = $3,
                amount_cents = COALESCE($4, amount_cents),
                platform_fee_cents = COALESCE($5, platform_fee_cents),
                service_fee_cents = COALESCE($6, service_fee_cents),
                net_amount_cents = COALESCE($7, net_amount_cents),
                platform_commission_cents = COALESCE($8, platform_commission_cents),
                payee_earnings_cents = COALESCE($9, payee_earnings_cents),
                external_transaction_id = COALESCE($10, external_transaction_id),
                validation_response = COALESCE($11, validation_response),
                failure_reason = COALESCE($12, failure_reason),
                is_test = COALESCE($13, is_test),
                completed_at = CASE WHEN $14 THEN $3 ELSE completed_at END
            WHERE id = $1 AND status = ANY($15)
            RETURNING *
            "#,
        )
        .bind(id)
        .bind(change.to)
        .bind(change.at)
        .bind(change.amount_cents)
        .bind(fees.map(|f| f.platform_fee_cents))
        .bind(fees.map(|f| f.service_fee_cents))
        .bind(fees.map(|f| f.net_amount_cents))
        .bind(fees.map(|f| f.platform_commission_cents))
        .bind(fees.map(|f| f.payee_earnings_cents))
        .bind(&change.external_transaction_id)
        .bind(&change.validation_response)
        .bind(&change.failure_reason)
        .bind(change.is_test)
        .bind(change.to == PaymentStatus::Completed)
        .bind(status_strings(from))
        .fetch_optional(&self.pool)
        .await?;
        Ok(payment)
    }

    async fn refund(&self, id: Uuid, refund: &RefundRecord) -> BillingResult<Option<Payment>> {
        let mut tx = self.pool.begin().await?;

        let updated = sqlx::query_as::<_, Payment>(
            r#"
            UPDATE payments SET
                status = 'refunded',
                refunded_amount_cents = $2,
                refund_reason = $3,
                refunded_at = $4,
                updated_at = $4
            WHERE id = $1 AND status = 'completed'
            RETURNING *
            "#,
        )
        .bind(id)
        .bind(refund.amount_cents)
        .bind(&refund.reason)
        .bind(refund.at)
        .fetch_optional(&mut *tx)
        .await?;

        let Some(updated) = updated else {
            tx.rollback().await?;
            return Ok(None);
        };

        insert_payment(&mut *tx, &refund.entry).await?;
        tx.commit().await?;
        Ok(Some(updated))
    }

    async fn expire_pending(&self, now: OffsetDateTime) -> BillingResult<Vec<Payment>> {
        let expired = sqlx::query_as::<_, Payment>(
            r#"
            UPDATE payments SET
                status = 'expired',
                failure_reason = 'Payment expired before completion',
                updated_at = $1
            WHERE status = 'pending' AND expires_at < $1
            RETURNING *
            "#,
        )
        .bind(now)
        .fetch_all(&self.pool)
        .await?;
        Ok(expired)
    }

    async fn list(
        &self,
        filter: &PaymentFilter,
        page: Pagination,
    ) -> BillingResult<(Vec<Payment>, i64)> {
        let page = page.normalized();

        let mut count = QueryBuilder::<Postgres>::new("SELECT COUNT(*) FROM payments");
        push_payment_filter(&mut count, filter);
        let total: i64 = count.build_query_scalar().fetch_one(&self.pool).await?;

        let mut qb = QueryBuilder::<Postgres>::new("SELECT * FROM payments");
        push_payment_filter(&mut qb, filter);
        qb.push(" ORDER BY created_at DESC, id DESC LIMIT ")
            .push_bind(page.limit)
            .push(" OFFSET ")
            .push_bind(page.offset());
        let rows = qb.build_query_as::<Payment>().fetch_all(&self.pool).await?;

        Ok((rows, total))
    }

    async fn settled_for_payee(
        &self,
        payee_id: Uuid,
        from: OffsetDateTime,
        to: OffsetDateTime,
    ) -> BillingResult<Vec<Payment>> {
        let rows = sqlx::query_as::<_, Payment>(
            r#"
            SELECT * FROM payments
            WHERE payee_id = $1
              AND payment_type <> 'refund'
              AND status IN ('completed', 'refunded')
              AND completed_at >= $2 AND completed_at < $3
            ORDER BY completed_at
            "#,
        )
        .bind(payee_id)
        .bind(from)
        .bind(to)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }
}

// =============================================================================
// Subscriptions
// =============================================================================

#[derive(Clone)]
pub struct PostgresSubscriptionRepository {
    pool: PgPool,
}

impl PostgresSubscriptionRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

fn push_subscription_filter(qb: &mut QueryBuilder<'_, Postgres>, filter: &SubscriptionFilter) {
    qb.push(" WHERE TRUE");
    if let Some(v) = filter.kind {
        qb.push(" AND kind = ").push_bind(v.as_str());
    }
    if let Some(v) = filter.subscriber_id {
        qb.push(" AND subscriber_id = ").push_bind(v);
    }
    if let Some(v) = filter.payee_id {
        qb.push(" AND payee_id = ").push_bind(v);
    }
    if let Some(v) = filter.status {
        qb.push(" AND status = ").push_bind(v.as_str());
    }
    if let Some(v) = filter.plan {
        qb.push(" AND plan = ").push_bind(v.as_str());
    }
}

#[async_trait]
impl SubscriptionRepository for PostgresSubscriptionRepository {
    async fn insert(&self, s: &Subscription) -> BillingResult<()> {
        sqlx::query(
            r#"
            INSERT INTO subscriptions (
                id, kind, subscriber_id, payee_id, product_id, plan, status, billing_cycle,
                price_cents, currency, commission_rate_bps, payment_method,
                start_date, trial_end, next_billing_date, last_billing_date,
                current_period_start, current_period_end, end_date, auto_renew,
                cancelled_at, cancellation_reason, cancelled_by, paused_at,
                failed_payment_attempts, next_retry_at,
                features, usage, external_ids, upgrade_history,
                renewal_claimed_until, version, created_at, updated_at
            )
            VALUES (
                $1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17,
                $18, $19, $20, $21, $22, $23, $24, $25, $26, $27, $28, $29, $30, $31, $32,
                $33, $34
            )
            "#,
        )
        .bind(s.id)
        .bind(s.kind)
        .bind(s.subscriber_id)
        .bind(s.payee_id)
        .bind(s.product_id)
        .bind(s.plan)
        .bind(s.status)
        .bind(s.billing_cycle)
        .bind(s.price_cents)
        .bind(&s.currency)
        .bind(s.commission_rate_bps)
        .bind(s.payment_method)
        .bind(s.start_date)
        .bind(s.trial_end)
        .bind(s.next_billing_date)
        .bind(s.last_billing_date)
        .bind(s.current_period_start)
        .bind(s.current_period_end)
        .bind(s.end_date)
        .bind(s.auto_renew)
        .bind(s.cancelled_at)
        .bind(&s.cancellation_reason)
        .bind(s.cancelled_by)
        .bind(s.paused_at)
        .bind(s.failed_payment_attempts)
        .bind(s.next_retry_at)
        .bind(Json(&s.features))
        .bind(Json(&s.usage))
        .bind(Json(&s.external_ids))
        .bind(Json(&s.upgrade_history))
        .bind(s.renewal_claimed_until)
        .bind(s.version)
        .bind(s.created_at)
        .bind(s.updated_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get(&self, id: Uuid) -> BillingResult<Option<Subscription>> {
        let sub = sqlx::query_as::<_, Subscription>("SELECT * FROM subscriptions WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(sub)
    }

    async fn find_current(
        &self,
        kind: SubscriberKind,
        subscriber_id: Uuid,
        payee_id: Option<Uuid>,
    ) -> BillingResult<Option<Subscription>> {
        let sub = sqlx::query_as::<_, Subscription>(
            r#"
            SELECT * FROM subscriptions
            WHERE kind = $1
              AND subscriber_id = $2
              AND ($1 = 'coach' OR payee_id IS NOT DISTINCT FROM $3)
              AND status IN ('trial', 'pending', 'active', 'past_due', 'paused')
            ORDER BY created_at DESC
            LIMIT 1
            "#,
        )
        .bind(kind)
        .bind(subscriber_id)
        .bind(payee_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(sub)
    }

    async fn find_latest(
        &self,
        kind: SubscriberKind,
        subscriber_id: Uuid,
        payee_id: Option<Uuid>,
    ) -> BillingResult<Option<Subscription>> {
        let sub = sqlx::query_as::<_, Subscription>(
            r#"
            SELECT * FROM subscriptions
            WHERE kind = $1
              AND subscriber_id = $2
              AND ($1 = 'coach' OR payee_id IS NOT DISTINCT FROM $3)
            ORDER BY created_at DESC
            LIMIT 1
            "#,
        )
        .bind(kind)
        .bind(subscriber_id)
        .bind(payee_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(sub)
    }

    async fn update(&self, s: &Subscription) -> BillingResult<Subscription> {
        // The renewal claim is owned by claim_due/release_claim and is never
        // written here.
        let updated = sqlx::query_as::<_, Subscription>(
            r#"
            UPDATE subscriptions SET
                product_id = $2,
                plan = $3,
                status = $4,
                billing_cycle = $5,
                price_cents = $6,
                currency = $7,
                commission_rate_bps = $8,
                payment_method = $9,
                trial_end = $10,
                next_billing_date = $11,
                last_billing_date = $12,
                current_period_start = $13,
                current_period_end = $14,
                end_date = $15,
                auto_renew = $16,
                cancelled_at = $17,
                cancellation_reason = $18,
                cancelled_by = $19,
                paused_at = $20,
                failed_payment_attempts = $21,
                next_retry_at = $22,
                features = $23,
                usage = $24,
                external_ids = $25,
                upgrade_history = $26,
                updated_at = $27,
                version = version + 1
            WHERE id = $1 AND version = $28
            RETURNING *
            "#,
        )
        .bind(s.id)
        .bind(s.product_id)
        .bind(s.plan)
        .bind(s.status)
        .bind(s.billing_cycle)
        .bind(s.price_cents)
        .bind(&s.currency)
        .bind(s.commission_rate_bps)
        .bind(s.payment_method)
        .bind(s.trial_end)
        .bind(s.next_billing_date)
        .bind(s.last_billing_date)
        .bind(s.current_period_start)
        .bind(s.current_period_end)
        .bind(s.end_date)
        .bind(s.auto_renew)
        .bind(s.cancelled_at)
        .bind(&s.cancellation_reason)
        .bind(s.cancelled_by)
        .bind(s.paused_at)
        .bind(s.failed_payment_attempts)
        .bind(s.next_retry_at)
        .bind(Json(&s.features))
        .bind(Json(&s.usage))
        .bind(Json(&s.external_ids))
        .bind(Json(&s.upgrade_history))
        .bind(s.updated_at)
        .bind(s.version)
        .fetch_optional(&self.pool)
        .await?;

        match updated {
            Some(sub) => Ok(sub),
            None => {
                let exists: Option<i64> =
                    sqlx::query_scalar("SELECT version FROM subscriptions WHERE id = $1")
                        .bind(s.id)
                        .fetch_optional(&self.pool)
                        .await?;
                match exists {
                    Some(version) => Err(BillingError::ConcurrentModification(format!(
                        "subscription {} is at version {}, write was based on {}",
                        s.id, version, s.version
                    ))),
                    None => Err(BillingError::NotFound(format!("subscription {}", s.id))),
                }
            }
        }
    }

    async fn increment_usage(
        &self,
        id: Uuid,
        capability: &str,
        amount: i64,
        at: OffsetDateTime,
    ) -> BillingResult<UsageIncrement> {
        let applied: Option<(i64, i64)> = sqlx::query_as(
            r#"
            UPDATE subscriptions SET
                usage = jsonb_set(
                    usage,
                    ARRAY[$2::text],
                    to_jsonb(COALESCE((usage->>$2)::bigint, 0) + $3)
                ),
                version = version + 1,
                updated_at = $4
            WHERE id = $1
              AND jsonb_exists(features, $2)
              AND COALESCE((usage->>$2)::bigint, 0) <= 9223372036854775807 - $3
              AND (
                (features->>$2)::bigint = -1
                OR COALESCE((usage->>$2)::bigint, 0) + $3 <= (features->>$2)::bigint
              )
            RETURNING (usage->>$2)::bigint, (features->>$2)::bigint
            "#,
        )
        .bind(id)
        .bind(capability)
        .bind(amount)
        .bind(at)
        .fetch_optional(&self.pool)
        .await?;

        if let Some((used, limit)) = applied {
            return Ok(UsageIncrement::Applied { used, limit });
        }

        let current: Option<(Option<i64>, Option<i64>)> = sqlx::query_as(
            r#"
            SELECT COALESCE((usage->>$2)::bigint, 0), (features->>$2)::bigint
            FROM subscriptions WHERE id = $1
            "#,
        )
        .bind(id)
        .bind(capability)
        .fetch_optional(&self.pool)
        .await?;

        match current {
            None => Err(BillingError::NotFound(format!("subscription {}", id))),
            Some((_, None)) => Ok(UsageIncrement::UnknownCapability),
            Some((used, Some(limit))) => Ok(UsageIncrement::Rejected {
                used: used.unwrap_or(0),
                limit,
            }),
        }
    }

    async fn claim_due(
        &self,
        now: OffsetDateTime,
        not_before: OffsetDateTime,
        claim_until: OffsetDateTime,
        limit: i64,
    ) -> BillingResult<Vec<Subscription>> {
        let claimed = sqlx::query_as::<_, Subscription>(
            r#"
            UPDATE subscriptions SET renewal_claimed_until = $3
            WHERE id IN (
                SELECT id FROM subscriptions
                WHERE (renewal_claimed_until IS NULL OR renewal_claimed_until <= $1)
                  AND (
                    (status IN ('trial', 'active') AND auto_renew
                        AND next_billing_date <= $1 AND next_billing_date >= $2)
                    OR (status = 'past_due' AND auto_renew
                        AND next_retry_at <= $1 AND next_retry_at >= $2)
                  )
                ORDER BY COALESCE(next_retry_at, next_billing_date)
                LIMIT $4
                FOR UPDATE SKIP LOCKED
            )
            RETURNING *
            "#,
        )
        .bind(now)
        .bind(not_before)
        .bind(claim_until)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        Ok(claimed)
    }

    async fn count_stale_due(
        &self,
        now: OffsetDateTime,
        not_before: OffsetDateTime,
    ) -> BillingResult<i64> {
        let count: i64 = sqlx::query_scalar(
            r#"
            SELECT COUNT(*) FROM subscriptions
            WHERE (status IN ('trial', 'active') AND auto_renew
                    AND next_billing_date <= $1 AND next_billing_date < $2)
               OR (status = 'past_due' AND auto_renew
                    AND next_retry_at <= $1 AND next_retry_at < $2)
            "#,
        )
        .bind(now)
        .bind(not_before)
        .fetch_one(&self.pool)
        .await?;
        Ok(count)
    }

    async fn release_claim(&self, id: Uuid) -> BillingResult<()> {
        sqlx::query("UPDATE subscriptions SET renewal_claimed_until = NULL WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn list_ended(&self, now: OffsetDateTime, limit: i64) -> BillingResult<Vec<Subscription>> {
        let rows = sqlx::query_as::<_, Subscription>(
            r#"
            SELECT * FROM subscriptions
            WHERE status IN ('trial', 'active') AND end_date <= $1
            ORDER BY end_date
            LIMIT $2
            "#,
        )
        .bind(now)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    async fn list(
        &self,
        filter: &SubscriptionFilter,
        page: Pagination,
    ) -> BillingResult<(Vec<Subscription>, i64)> {
        let page = page.normalized();

        let mut count = QueryBuilder::<Postgres>::new("SELECT COUNT(*) FROM subscriptions");
        push_subscription_filter(&mut count, filter);
        let total: i64 = count.build_query_scalar().fetch_one(&self.pool).await?;

        let mut qb = QueryBuilder::<Postgres>::new("SELECT * FROM subscriptions");
        push_subscription_filter(&mut qb, filter);
        qb.push(" ORDER BY created_at DESC, id DESC LIMIT ")
            .push_bind(page.limit)
            .push(" OFFSET ")
            .push_bind(page.offset());
        let rows = qb
            .build_query_as::<Subscription>()
            .fetch_all(&self.pool)
            .await?;

        Ok((rows, total))
    }
}

// =============================================================================
// Products
// =============================================================================

#[derive(Clone)]
pub struct PostgresProductRepository {
    pool: PgPool,
}

impl PostgresProductRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

fn store_id_key(method: PaymentMethod) -> &'static str {
    match method {
        PaymentMethod::AppleIap => "apple_product_id",
        PaymentMethod::GooglePlay => "google_product_id",
        PaymentMethod::Card => "stripe_price_id",
        PaymentMethod::Paypal => "paypal_plan_id",
    }
}

#[async_trait]
impl ProductRepository for PostgresProductRepository {
    async fn insert(&self, p: &Product) -> BillingResult<()> {
        sqlx::query(
            r#"
            INSERT INTO products (
                id, kind, plan, billing_cycle, name, description, price_cents, currency,
                store_ids, features, trial_days, is_active, created_at, updated_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14)
            "#,
        )
        .bind(p.id)
        .bind(p.kind)
        .bind(p.plan)
        .bind(p.billing_cycle)
        .bind(&p.name)
        .bind(&p.description)
        .bind(p.price_cents)
        .bind(&p.currency)
        .bind(Json(&p.store_ids))
        .bind(Json(&p.features))
        .bind(p.trial_days)
        .bind(p.is_active)
        .bind(p.created_at)
        .bind(p.updated_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get(&self, id: Uuid) -> BillingResult<Option<Product>> {
        let product = sqlx::query_as::<_, Product>("SELECT * FROM products WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(product)
    }

    async fn find_plan(
        &self,
        kind: SubscriberKind,
        plan: Plan,
        cycle: BillingCycle,
    ) -> BillingResult<Option<Product>> {
        let product = sqlx::query_as::<_, Product>(
            r#"
            SELECT * FROM products
            WHERE kind = $1 AND plan = $2 AND billing_cycle = $3 AND is_active
            "#,
        )
        .bind(kind)
        .bind(plan)
        .bind(cycle)
        .fetch_optional(&self.pool)
        .await?;
        Ok(product)
    }

    async fn find_by_store_id(
        &self,
        method: PaymentMethod,
        store_product_id: &str,
    ) -> BillingResult<Option<Product>> {
        let product = sqlx::query_as::<_, Product>(
            r#"
            SELECT * FROM products
            WHERE store_ids->>$1 = $2
            ORDER BY is_active DESC, created_at DESC
            LIMIT 1
            "#,
        )
        .bind(store_id_key(method))
        .bind(store_product_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(product)
    }

    async fn list(
        &self,
        kind: Option<SubscriberKind>,
        active_only: bool,
    ) -> BillingResult<Vec<Product>> {
        let rows = sqlx::query_as::<_, Product>(
            r#"
            SELECT * FROM products
            WHERE ($1::varchar IS NULL OR kind = $1)
              AND (NOT $2 OR is_active)
            ORDER BY kind, price_cents
            "#,
        )
        .bind(kind.map(|k| k.as_str()))
        .bind(active_only)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_store_id_keys_match_json_fields() {
        let ids = crate::models::StoreProductIds {
            apple_product_id: Some("com.coachpay.basic".into()),
            ..Default::default()
        };
        let json = serde_json::to_value(&ids).unwrap();
        assert_eq!(
            json[store_id_key(PaymentMethod::AppleIap)],
            serde_json::json!("com.coachpay.basic")
        );
    }

    #[tokio::test]
    #[ignore] // Requires database
    async fn test_claim_due_skips_locked_rows() {
        let url = std::env::var("DATABASE_URL").expect("DATABASE_URL required");
        let pool = coachpay_shared::create_pool(&url, 4).await.unwrap();
        coachpay_shared::run_migrations(&pool).await.unwrap();
        let repo = PostgresSubscriptionRepository::new(pool);
        let now = OffsetDateTime::now_utc();
        let first = repo
            .claim_due(now, now - time::Duration::days(7), now + time::Duration::minutes(5), 50)
            .await
            .unwrap();
        let second = repo
            .claim_due(now, now - time::Duration::days(7), now + time::Duration::minutes(5), 50)
            .await
            .unwrap();
        for sub in &second {
            assert!(!first.iter().any(|s| s.id == sub.id));
        }
    }
}
