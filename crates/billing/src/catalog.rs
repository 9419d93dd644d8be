//! Product catalog
//!
//! Read-mostly plan definitions. Subscriptions never read the catalog after
//! creation or a plan change: price and features are copied onto the
//! subscription at that moment.

use std::sync::Arc;

use coachpay_shared::{BillingCycle, Clock, PaymentMethod, Plan, SubscriberKind};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{BillingError, BillingResult};
use crate::models::{FeatureTable, Product, StoreProductIds, UNLIMITED};
use crate::plans::PlanSettings;
use crate::store::ProductRepository;

/// Longest trial a plan or override may grant
pub const MAX_TRIAL_DAYS: u32 = 365;

/// Overrides for a `custom` plan, merged onto the catalog's custom baseline
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CustomPlan {
    #[serde(default)]
    pub price_cents: Option<i64>,
    /// Capabilities to add or replace
    #[serde(default)]
    pub features: FeatureTable,
    #[serde(default)]
    pub trial_days: Option<u32>,
    /// Client kind only
    #[serde(default)]
    pub commission_rate_bps: Option<i64>,
}

/// Resolved terms a subscription is created or re-priced with
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlanTerms {
    pub product_id: Option<Uuid>,
    pub kind: SubscriberKind,
    pub plan: Plan,
    pub billing_cycle: BillingCycle,
    pub price_cents: i64,
    pub currency: String,
    pub features: FeatureTable,
    pub trial_days: u32,
    pub commission_rate_bps: Option<i64>,
    pub store_ids: StoreProductIds,
}

/// Input for adding a catalog product
#[derive(Debug, Clone, Deserialize)]
pub struct NewProduct {
    pub kind: SubscriberKind,
    pub plan: Plan,
    #[serde(default)]
    pub billing_cycle: BillingCycle,
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    pub price_cents: i64,
    #[serde(default)]
    pub currency: Option<String>,
    #[serde(default)]
    pub store_ids: StoreProductIds,
    #[serde(default)]
    pub features: FeatureTable,
    #[serde(default)]
    pub trial_days: Option<i32>,
}

fn validate_features(features: &FeatureTable) -> BillingResult<()> {
    if let Some((name, limit)) = features.iter().find(|(_, &l)| l < UNLIMITED) {
        return Err(BillingError::InvalidInput(format!(
            "Feature {} has invalid limit {} (use -1 for unlimited)",
            name, limit
        )));
    }
    Ok(())
}

fn validate_commission(bps: i64) -> BillingResult<()> {
    if !(0..=10_000).contains(&bps) {
        return Err(BillingError::InvalidInput(format!(
            "Commission rate must be between 0 and 100%: {} bps",
            bps
        )));
    }
    Ok(())
}

pub struct ProductCatalog {
    products: Arc<dyn ProductRepository>,
    plans: PlanSettings,
    clock: Arc<dyn Clock>,
    default_currency: String,
}

impl ProductCatalog {
    pub fn new(
        products: Arc<dyn ProductRepository>,
        plans: PlanSettings,
        clock: Arc<dyn Clock>,
        default_currency: impl Into<String>,
    ) -> Self {
        Self {
            products,
            plans,
            clock,
            default_currency: default_currency.into(),
        }
    }

    pub fn plan_settings(&self) -> &PlanSettings {
        &self.plans
    }

    /// Resolve price, features and trial for a (kind, plan, cycle).
    ///
    /// Standard plans must exist in the catalog. A `custom` plan starts from
    /// the catalog's custom product for that cycle when there is one and
    /// applies `custom` on top; without a baseline the overrides must carry a
    /// price.
    pub async fn resolve(
        &self,
        kind: SubscriberKind,
        plan: Plan,
        cycle: BillingCycle,
        custom: Option<&CustomPlan>,
    ) -> BillingResult<PlanTerms> {
        if !plan.is_offered_to(kind) {
            return Err(BillingError::InvalidInput(format!(
                "Plan {} is not offered to {} subscribers",
                plan, kind
            )));
        }
        if custom.is_some() && plan != Plan::Custom {
            return Err(BillingError::InvalidInput(
                "Custom overrides are only accepted for the custom plan".to_string(),
            ));
        }

        let setting = self.plans.get(kind, plan);
        let product = self.products.find_plan(kind, plan, cycle).await?;

        let mut terms = match product {
            Some(p) => PlanTerms {
                product_id: Some(p.id),
                kind,
                plan,
                billing_cycle: cycle,
                price_cents: p.price_cents,
                currency: p.currency,
                features: p.features,
                trial_days: p
                    .trial_days
                    .and_then(|d| u32::try_from(d).ok())
                    .unwrap_or(setting.trial_days),
                commission_rate_bps: None,
                store_ids: p.store_ids,
            },
            None if plan == Plan::Custom => PlanTerms {
                product_id: None,
                kind,
                plan,
                billing_cycle: cycle,
                price_cents: -1,
                currency: self.default_currency.clone(),
                features: FeatureTable::new(),
                trial_days: setting.trial_days,
                commission_rate_bps: None,
                store_ids: StoreProductIds::default(),
            },
            None => {
                return Err(BillingError::NotFound(format!(
                    "No active {} product for plan {} ({})",
                    kind, plan, cycle
                )))
            }
        };

        if kind == SubscriberKind::Client {
            terms.commission_rate_bps = setting.default_commission_bps;
        }

        if let Some(custom) = custom {
            validate_features(&custom.features)?;
            terms
                .features
                .extend(custom.features.iter().map(|(k, v)| (k.clone(), *v)));
            if let Some(price) = custom.price_cents {
                terms.price_cents = price;
            }
            if let Some(price) = custom.price_cents.filter(|p| *p < 0) {
                return Err(BillingError::InvalidInput(format!(
                    "Price must not be negative: {}",
                    price
                )));
            }
            if let Some(days) = custom.trial_days {
                terms.trial_days = days;
            }
            if let Some(bps) = custom.commission_rate_bps {
                if kind != SubscriberKind::Client {
                    return Err(BillingError::InvalidInput(
                        "Commission rates only apply to client subscriptions".to_string(),
                    ));
                }
                validate_commission(bps)?;
                terms.commission_rate_bps = Some(bps);
            }
        }

        if terms.price_cents < 0 {
            return Err(BillingError::InvalidInput(format!(
                "Custom {} plan ({}) needs a price: no catalog baseline exists",
                kind, cycle
            )));
        }
        if terms.trial_days > MAX_TRIAL_DAYS {
            return Err(BillingError::InvalidInput(format!(
                "Trial may last at most {} days, got {}",
                MAX_TRIAL_DAYS, terms.trial_days
            )));
        }
        Ok(terms)
    }

    pub async fn get(&self, id: Uuid) -> BillingResult<Product> {
        self.products
            .get(id)
            .await?
            .ok_or_else(|| BillingError::NotFound(format!("product {}", id)))
    }

    pub async fn list(&self, kind: Option<SubscriberKind>, active_only: bool) -> BillingResult<Vec<Product>> {
        self.products.list(kind, active_only).await
    }

    pub async fn find_by_store_id(
        &self,
        method: PaymentMethod,
        store_product_id: &str,
    ) -> BillingResult<Option<Product>> {
        self.products.find_by_store_id(method, store_product_id).await
    }

    /// Add an active product to the catalog
    pub async fn create_product(&self, input: NewProduct) -> BillingResult<Product> {
        if !input.plan.is_offered_to(input.kind) {
            return Err(BillingError::InvalidInput(format!(
                "Plan {} is not offered to {} subscribers",
                input.plan, input.kind
            )));
        }
        if input.name.trim().is_empty() {
            return Err(BillingError::InvalidInput("Product name is required".to_string()));
        }
        if input.price_cents < 0 {
            return Err(BillingError::InvalidInput(format!(
                "Price must not be negative: {}",
                input.price_cents
            )));
        }
        if input
            .trial_days
            .is_some_and(|d| d < 0 || i64::from(d) > i64::from(MAX_TRIAL_DAYS))
        {
            return Err(BillingError::InvalidInput(format!(
                "Trial days must be between 0 and {}",
                MAX_TRIAL_DAYS
            )));
        }
        validate_features(&input.features)?;

        let currency = input
            .currency
            .unwrap_or_else(|| self.default_currency.clone())
            .to_uppercase();
        if currency.len() != 3 || !currency.chars().all(|c| c.is_ascii_alphabetic()) {
            return Err(BillingError::InvalidInput(format!("Invalid currency code: {}", currency)));
        }

        let now = self.clock.now();
        let product = Product {
            id: Uuid::new_v4(),
            kind: input.kind,
            plan: input.plan,
            billing_cycle: input.billing_cycle,
            name: input.name.trim().to_string(),
            description: input.description,
            price_cents: input.price_cents,
            currency,
            store_ids: input.store_ids,
            features: input.features,
            trial_days: input.trial_days,
            is_active: true,
            created_at: now,
            updated_at: now,
        };
        self.products.insert(&product).await?;

        tracing::info!(
            product_id = %product.id,
            kind = %product.kind,
            plan = %product.plan,
            cycle = %product.billing_cycle,
            price_cents = product.price_cents,
            "Catalog product created"
        );
        Ok(product)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::InMemoryProductRepository;
    use coachpay_shared::FakeClock;
    use time::macros::datetime;

    fn catalog() -> ProductCatalog {
        ProductCatalog::new(
            Arc::new(InMemoryProductRepository::new()),
            PlanSettings::default(),
            Arc::new(FakeClock::new(datetime!(2026-03-01 09:00 UTC))),
            "USD",
        )
    }

    fn product(kind: SubscriberKind, plan: Plan, price_cents: i64) -> NewProduct {
        NewProduct {
            kind,
            plan,
            billing_cycle: BillingCycle::Monthly,
            name: format!("{} {}", kind, plan),
            description: None,
            price_cents,
            currency: None,
            store_ids: StoreProductIds::default(),
            features: [("sessions".to_string(), 8), ("programs".to_string(), UNLIMITED)]
                .into_iter()
                .collect(),
            trial_days: None,
        }
    }

    #[tokio::test]
    async fn test_resolve_standard_plan() {
        let catalog = catalog();
        catalog
            .create_product(product(SubscriberKind::Client, Plan::Basic, 8900))
            .await
            .unwrap();

        let terms = catalog
            .resolve(SubscriberKind::Client, Plan::Basic, BillingCycle::Monthly, None)
            .await
            .unwrap();
        assert_eq!(terms.price_cents, 8900);
        assert_eq!(terms.currency, "USD");
        assert_eq!(terms.commission_rate_bps, Some(2000));
        assert_eq!(terms.trial_days, 0);
        assert_eq!(terms.features.get("sessions"), Some(&8));
    }

    #[tokio::test]
    async fn test_missing_standard_plan_is_not_found() {
        let err = catalog()
            .resolve(SubscriberKind::Coach, Plan::Elite, BillingCycle::Yearly, None)
            .await
            .unwrap_err();
        assert!(matches!(err, BillingError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_plan_must_match_kind() {
        let err = catalog()
            .resolve(SubscriberKind::Coach, Plan::Basic, BillingCycle::Monthly, None)
            .await
            .unwrap_err();
        assert!(matches!(err, BillingError::InvalidInput(_)));
    }

    #[tokio::test]
    async fn test_custom_overrides_merge_onto_baseline() {
        let catalog = catalog();
        catalog
            .create_product(product(SubscriberKind::Client, Plan::Custom, 12000))
            .await
            .unwrap();

        let custom = CustomPlan {
            price_cents: Some(15000),
            features: [("sessions".to_string(), 12), ("nutrition".to_string(), 1)]
                .into_iter()
                .collect(),
            trial_days: Some(7),
            commission_rate_bps: Some(1250),
        };
        let terms = catalog
            .resolve(
                SubscriberKind::Client,
                Plan::Custom,
                BillingCycle::Monthly,
                Some(&custom),
            )
            .await
            .unwrap();
        assert_eq!(terms.price_cents, 15000);
        assert_eq!(terms.trial_days, 7);
        assert_eq!(terms.commission_rate_bps, Some(1250));
        assert_eq!(terms.features.get("sessions"), Some(&12));
        assert_eq!(terms.features.get("programs"), Some(&UNLIMITED));
        assert_eq!(terms.features.get("nutrition"), Some(&1));
    }

    #[tokio::test]
    async fn test_custom_without_baseline_needs_price() {
        let catalog = catalog();
        let err = catalog
            .resolve(
                SubscriberKind::Coach,
                Plan::Custom,
                BillingCycle::Monthly,
                Some(&CustomPlan::default()),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, BillingError::InvalidInput(_)));

        let terms = catalog
            .resolve(
                SubscriberKind::Coach,
                Plan::Custom,
                BillingCycle::Monthly,
                Some(&CustomPlan {
                    price_cents: Some(4900),
                    ..Default::default()
                }),
            )
            .await
            .unwrap();
        assert_eq!(terms.price_cents, 4900);
        assert!(terms.product_id.is_none());
        assert!(terms.commission_rate_bps.is_none());
    }

    #[tokio::test]
    async fn test_product_trial_override_wins() {
        let catalog = catalog();
        let mut input = product(SubscriberKind::Coach, Plan::Starter, 2900);
        input.trial_days = Some(30);
        catalog.create_product(input).await.unwrap();

        let terms = catalog
            .resolve(SubscriberKind::Coach, Plan::Starter, BillingCycle::Monthly, None)
            .await
            .unwrap();
        assert_eq!(terms.trial_days, 30);
    }

    #[tokio::test]
    async fn test_custom_trial_and_price_are_bounded() {
        let catalog = catalog();
        for custom in [
            CustomPlan {
                price_cents: Some(100),
                trial_days: Some(u32::MAX),
                ..Default::default()
            },
            CustomPlan {
                price_cents: Some(100),
                trial_days: Some(MAX_TRIAL_DAYS + 1),
                ..Default::default()
            },
            CustomPlan {
                price_cents: Some(-1),
                ..Default::default()
            },
        ] {
            let err = catalog
                .resolve(
                    SubscriberKind::Coach,
                    Plan::Custom,
                    BillingCycle::Monthly,
                    Some(&custom),
                )
                .await
                .unwrap_err();
            assert!(matches!(err, BillingError::InvalidInput(_)), "{:?}", custom);
        }

        let mut input = product(SubscriberKind::Coach, Plan::Starter, 2900);
        input.trial_days = Some(i32::MAX);
        assert!(matches!(
            catalog.create_product(input).await,
            Err(BillingError::InvalidInput(_))
        ));
    }

    #[tokio::test]
    async fn test_create_product_rejects_bad_limits() {
        let mut input = product(SubscriberKind::Coach, Plan::Starter, 2900);
        input.features.insert("sessions".into(), -5);
        assert!(catalog().create_product(input).await.is_err());
    }
}
