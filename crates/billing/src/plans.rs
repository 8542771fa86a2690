//! Plan Catalog
//!
//! Compiled-in, process-wide plan definitions. Nothing here is mutable at
//! runtime, so reads need no synchronization.
//!
//! Tier hierarchy: Free ($0) → Starter ($29) → Pro ($79) → Enterprise (contact sales)

use serde::Serialize;
use storefront_shared::{Limit, PlanId, ResourceLimits};

use crate::error::{BillingError, BillingResult};

/// A plan tier with its limits and list prices
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Plan {
    pub id: PlanId,
    pub name: &'static str,
    /// Monthly price in whole currency units; `None` means contact sales
    pub price_monthly: Option<u32>,
    /// Yearly price in whole currency units; `None` means contact sales
    pub price_yearly: Option<u32>,
    pub limits: ResourceLimits,
    /// Display-only feature bullets, in order
    pub features: &'static [&'static str],
}

static FREE: Plan = Plan {
    id: PlanId::Free,
    name: "Free",
    price_monthly: Some(0),
    price_yearly: Some(0),
    limits: ResourceLimits {
        products: Limit::Bounded(10),
        orders: Limit::Bounded(50),
        team_members: Limit::Bounded(1),
        storage_mb: Limit::Bounded(100),
    },
    features: &[
        "Up to 10 products",
        "50 orders per month",
        "1 team member",
        "100 MB storage",
    ],
};

static STARTER: Plan = Plan {
    id: PlanId::Starter,
    name: "Starter",
    price_monthly: Some(29),
    price_yearly: Some(290),
    limits: ResourceLimits {
        products: Limit::Bounded(100),
        orders: Limit::Bounded(500),
        team_members: Limit::Bounded(3),
        storage_mb: Limit::Bounded(1_024),
    },
    features: &[
        "Up to 100 products",
        "500 orders per month",
        "3 team members",
        "1 GB storage",
        "Discount codes",
    ],
};

static PRO: Plan = Plan {
    id: PlanId::Pro,
    name: "Pro",
    price_monthly: Some(79),
    price_yearly: Some(790),
    limits: ResourceLimits {
        products: Limit::Unlimited,
        orders: Limit::Bounded(5_000),
        team_members: Limit::Bounded(10),
        storage_mb: Limit::Bounded(10_240),
    },
    features: &[
        "Unlimited products",
        "5,000 orders per month",
        "10 team members",
        "10 GB storage",
        "Loyalty program and gift cards",
        "Priority support",
    ],
};

static ENTERPRISE: Plan = Plan {
    id: PlanId::Enterprise,
    name: "Enterprise",
    price_monthly: None,
    price_yearly: None,
    limits: ResourceLimits {
        products: Limit::Unlimited,
        orders: Limit::Unlimited,
        team_members: Limit::Unlimited,
        storage_mb: Limit::Unlimited,
    },
    features: &[
        "Unlimited everything",
        "Dedicated account manager",
        "Custom contract and invoicing",
    ],
};

/// Look up a plan by its typed id. Every `PlanId` has a catalog entry.
pub fn plan(id: PlanId) -> &'static Plan {
    match id {
        PlanId::Free => &FREE,
        PlanId::Starter => &STARTER,
        PlanId::Pro => &PRO,
        PlanId::Enterprise => &ENTERPRISE,
    }
}

/// Look up a plan by its external string id.
///
/// An unknown id is a configuration defect (metadata written by a different
/// deployment, or a removed tier), never something to default away.
pub fn get_plan_by_id(id: &str) -> BillingResult<&'static Plan> {
    id.parse::<PlanId>()
        .map(plan)
        .map_err(|_| BillingError::UnknownPlan(id.to_string()))
}

/// All plans in ascending tier order
pub fn all_plans() -> impl Iterator<Item = &'static Plan> {
    PlanId::ALL.into_iter().map(plan)
}

/// Direction of a move from one plan to another
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum PlanChange {
    Upgrade,
    Downgrade,
    Same,
}

/// Compare moving from `from` to `to` using the fixed tier order
pub fn compare_plans(from: PlanId, to: PlanId) -> PlanChange {
    match to.cmp(&from) {
        std::cmp::Ordering::Greater => PlanChange::Upgrade,
        std::cmp::Ordering::Less => PlanChange::Downgrade,
        std::cmp::Ordering::Equal => PlanChange::Same,
    }
}

/// Display form of a limit: "Unlimited", or an abbreviated number ("2.5K", "1M")
pub fn format_limit(limit: Limit) -> String {
    match limit {
        Limit::Unlimited => "Unlimited".to_string(),
        Limit::Bounded(n) if n < 1_000 => n.to_string(),
        Limit::Bounded(n) => {
            // Unit is chosen after rounding so 999_950 reads "1M", not "1000K"
            let thousands = tenths(n, 1_000);
            if thousands < 10_000 {
                with_suffix(thousands, "K")
            } else {
                with_suffix(tenths(n, 1_000_000), "M")
            }
        }
    }
}

/// `n / unit` in tenths, rounded half up
fn tenths(n: u64, unit: u64) -> u64 {
    n.saturating_mul(10).saturating_add(unit / 2) / unit
}

fn with_suffix(tenths: u64, suffix: &str) -> String {
    if tenths % 10 == 0 {
        format!("{}{}", tenths / 10, suffix)
    } else {
        format!("{}.{}{}", tenths / 10, tenths % 10, suffix)
    }
}

/// Yearly savings versus paying monthly for twelve months.
/// Zero when either price is missing (custom-priced tiers).
pub fn calculate_yearly_savings(id: PlanId) -> u32 {
    let p = plan(id);
    match (p.price_monthly, p.price_yearly) {
        (Some(monthly), Some(yearly)) => (monthly * 12).saturating_sub(yearly),
        _ => 0,
    }
}

/// Yearly savings as a whole percentage of twelve monthly payments
pub fn calculate_yearly_savings_percent(id: PlanId) -> u32 {
    let p = plan(id);
    match p.price_monthly {
        Some(monthly) if monthly > 0 => {
            let savings = calculate_yearly_savings(id) as f64;
            ((savings / (monthly as f64 * 12.0)) * 100.0).round() as u32
        }
        _ => 0,
    }
}
