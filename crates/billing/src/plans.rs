//! Plan settings: trial length and default commission per (kind, plan)

use std::collections::HashMap;

use coachpay_shared::{Plan, SubscriberKind};
use serde::{Deserialize, Serialize};

use crate::error::{BillingError, BillingResult};

/// Settings for one (subscriber kind, plan) pair
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlanSetting {
    pub trial_days: u32,
    /// Platform commission on client payments, basis points
    #[serde(default)]
    pub default_commission_bps: Option<i64>,
}

/// One entry of the `PLAN_SETTINGS_JSON` override list
#[derive(Debug, Deserialize)]
struct PlanSettingOverride {
    kind: SubscriberKind,
    plan: Plan,
    trial_days: u32,
    #[serde(default)]
    default_commission_bps: Option<i64>,
}

/// Table of plan settings keyed by (kind, plan)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlanSettings {
    entries: HashMap<(SubscriberKind, Plan), PlanSetting>,
}

impl Default for PlanSettings {
    fn default() -> Self {
        let mut entries = HashMap::new();
        for plan in [Plan::Starter, Plan::Professional, Plan::Elite] {
            entries.insert(
                (SubscriberKind::Coach, plan),
                PlanSetting {
                    trial_days: 14,
                    default_commission_bps: None,
                },
            );
        }
        entries.insert(
            (SubscriberKind::Coach, Plan::Custom),
            PlanSetting {
                trial_days: 0,
                default_commission_bps: None,
            },
        );
        for (plan, commission) in [
            (Plan::Basic, 2000),
            (Plan::Standard, 1500),
            (Plan::Premium, 1000),
            (Plan::Custom, 2000),
        ] {
            entries.insert(
                (SubscriberKind::Client, plan),
                PlanSetting {
                    trial_days: 0,
                    default_commission_bps: Some(commission),
                },
            );
        }
        Self { entries }
    }
}

impl PlanSettings {
    /// Defaults, with overrides from `PLAN_SETTINGS_JSON` when set.
    ///
    /// The variable holds a JSON array of
    /// `{"kind", "plan", "trial_days", "default_commission_bps"}` objects.
    pub fn from_env() -> BillingResult<Self> {
        let mut settings = Self::default();
        if let Ok(raw) = std::env::var("PLAN_SETTINGS_JSON") {
            settings.apply_json(&raw)?;
        }
        Ok(settings)
    }

    pub fn apply_json(&mut self, raw: &str) -> BillingResult<()> {
        let overrides: Vec<PlanSettingOverride> = serde_json::from_str(raw)
            .map_err(|e| BillingError::Config(format!("Invalid PLAN_SETTINGS_JSON: {}", e)))?;
        for o in overrides {
            if !o.plan.is_offered_to(o.kind) {
                return Err(BillingError::Config(format!(
                    "Plan {} is not offered to {} subscribers",
                    o.plan, o.kind
                )));
            }
            if let Some(bps) = o.default_commission_bps {
                if !(0..=10_000).contains(&bps) {
                    return Err(BillingError::Config(format!(
                        "Commission for {}/{} out of range: {}",
                        o.kind, o.plan, bps
                    )));
                }
            }
            self.entries.insert(
                (o.kind, o.plan),
                PlanSetting {
                    trial_days: o.trial_days,
                    default_commission_bps: o.default_commission_bps,
                },
            );
        }
        Ok(())
    }

    pub fn get(&self, kind: SubscriberKind, plan: Plan) -> PlanSetting {
        self.entries
            .get(&(kind, plan))
            .copied()
            .unwrap_or(PlanSetting {
                trial_days: 0,
                default_commission_bps: None,
            })
    }

    pub fn set(&mut self, kind: SubscriberKind, plan: Plan, setting: PlanSetting) {
        self.entries.insert((kind, plan), setting);
    }
}
