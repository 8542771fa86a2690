//! Billing configuration
//!
//! Price references point at the processor's price objects and change per
//! deployment, so they are loaded from the environment rather than compiled
//! into the plan catalog.

use storefront_shared::{BillingInterval, PlanId};

use crate::error::{BillingError, BillingResult};

/// Default usage percentage at which a resource counts as "approaching" its limit
pub const DEFAULT_APPROACHING_THRESHOLD_PERCENT: f64 = 80.0;

/// Configuration for the entitlement engine
#[derive(Debug, Clone)]
pub struct BillingConfig {
    /// Processor price references for each paid plan
    pub price_refs: PriceRefs,
    /// Threshold for `get_approaching_limits`
    pub approaching_threshold_percent: f64,
}

impl Default for BillingConfig {
    fn default() -> Self {
        Self {
            price_refs: PriceRefs::default(),
            approaching_threshold_percent: DEFAULT_APPROACHING_THRESHOLD_PERCENT,
        }
    }
}

/// Processor price references per plan and interval.
/// FREE has no price and therefore no reference.
#[derive(Debug, Clone, Default)]
pub struct PriceRefs {
    pub starter_monthly: Option<String>,
    pub starter_yearly: Option<String>,
    pub pro_monthly: Option<String>,
    pub pro_yearly: Option<String>,
    pub enterprise_monthly: Option<String>,
    pub enterprise_yearly: Option<String>,
}

impl BillingConfig {
    /// Create config from environment variables
    pub fn from_env() -> BillingResult<Self> {
        let approaching_threshold_percent = match std::env::var("APPROACHING_LIMIT_THRESHOLD_PERCENT") {
            Ok(raw) => {
                let value: f64 = raw.parse().map_err(|_| {
                    BillingError::Config(format!(
                        "APPROACHING_LIMIT_THRESHOLD_PERCENT is not a number: {}",
                        raw
                    ))
                })?;
                if !(0.0..=100.0).contains(&value) {
                    return Err(BillingError::Config(
                        "APPROACHING_LIMIT_THRESHOLD_PERCENT must be between 0 and 100".to_string(),
                    ));
                }
                value
            }
            Err(_) => DEFAULT_APPROACHING_THRESHOLD_PERCENT,
        };

        Ok(Self {
            price_refs: PriceRefs {
                starter_monthly: std::env::var("STRIPE_PRICE_STARTER_MONTHLY").ok(),
                starter_yearly: std::env::var("STRIPE_PRICE_STARTER_YEARLY").ok(),
                pro_monthly: std::env::var("STRIPE_PRICE_PRO_MONTHLY").ok(),
                pro_yearly: std::env::var("STRIPE_PRICE_PRO_YEARLY").ok(),
                enterprise_monthly: std::env::var("STRIPE_PRICE_ENTERPRISE_MONTHLY").ok(),
                enterprise_yearly: std::env::var("STRIPE_PRICE_ENTERPRISE_YEARLY").ok(),
            },
            approaching_threshold_percent,
        })
    }

    /// Get the processor price reference for a plan and interval, if configured
    pub fn price_ref(&self, plan: PlanId, interval: BillingInterval) -> Option<&str> {
        let refs = &self.price_refs;
        let slot = match (plan, interval) {
            (PlanId::Free, _) => return None,
            (PlanId::Starter, BillingInterval::Monthly) => &refs.starter_monthly,
            (PlanId::Starter, BillingInterval::Yearly) => &refs.starter_yearly,
            (PlanId::Pro, BillingInterval::Monthly) => &refs.pro_monthly,
            (PlanId::Pro, BillingInterval::Yearly) => &refs.pro_yearly,
            (PlanId::Enterprise, BillingInterval::Monthly) => &refs.enterprise_monthly,
            (PlanId::Enterprise, BillingInterval::Yearly) => &refs.enterprise_yearly,
        };
        slot.as_deref()
    }

    /// Like [`price_ref`](Self::price_ref) but a missing reference for a paid
    /// plan is a configuration defect.
    pub fn require_price_ref(
        &self,
        plan: PlanId,
        interval: BillingInterval,
    ) -> BillingResult<Option<&str>> {
        if !plan.is_paid() {
            return Ok(None);
        }
        self.price_ref(plan, interval)
            .map(Some)
            .ok_or_else(|| BillingError::MissingPriceRef {
                plan: plan.to_string(),
                interval: interval.to_string(),
            })
    }

    /// Every list-priced paid plan needs a reference for each interval it is
    /// sold on. Custom-priced tiers (no list price) are sold by contract and
    /// need none.
    pub fn validate_price_refs(&self) -> BillingResult<()> {
        for plan in crate::plans::all_plans().filter(|p| p.id.is_paid()) {
            let sold_on = [
                (BillingInterval::Monthly, plan.price_monthly),
                (BillingInterval::Yearly, plan.price_yearly),
            ];
            for (interval, price) in sold_on {
                if price.is_some() {
                    self.require_price_ref(plan.id, interval)?;
                }
            }
        }
        Ok(())
    }

    /// Reverse lookup: which plan and interval a price reference belongs to
    pub fn plan_for_price_ref(&self, price_ref: &str) -> Option<(PlanId, BillingInterval)> {
        PlanId::ALL.into_iter().find_map(|plan| {
            [BillingInterval::Monthly, BillingInterval::Yearly]
                .into_iter()
                .find(|interval| self.price_ref(plan, *interval) == Some(price_ref))
                .map(|interval| (plan, interval))
        })
    }
}

#[cfg(test)]
pub(crate) fn test_config() -> BillingConfig {
    BillingConfig {
        price_refs: PriceRefs {
            starter_monthly: Some("price_starter_monthly".to_string()),
            starter_yearly: Some("price_starter_yearly".to_string()),
            pro_monthly: Some("price_pro_monthly".to_string()),
            pro_yearly: Some("price_pro_yearly".to_string()),
            enterprise_monthly: None,
            enterprise_yearly: None,
        },
        approaching_threshold_percent: DEFAULT_APPROACHING_THRESHOLD_PERCENT,
    }
}
