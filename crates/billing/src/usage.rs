//! Usage metering service
//!
//! Measures live resource consumption for an organization and compares it to
//! plan limits. Every check here is advisory: the caller's insert is not part
//! of the same transaction, so concurrent writers can overshoot a limit by a
//! small margin.

use std::sync::Arc;

use serde::Serialize;
use storefront_shared::{Limit, OrgId, PlanId, ResourceLimits, ResourceType};
use time::{Date, OffsetDateTime, Time};

use crate::error::BillingResult;
use crate::plans;
use crate::store::UsageSource;

/// Source of "now" for billing-month boundaries
pub type Clock = fn() -> OffsetDateTime;

/// Point-in-time usage counts. Orders cover the current billing month only.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct UsageSnapshot {
    pub products: u64,
    pub orders: u64,
    pub team_members: u64,
    pub storage_mb: u64,
}

impl UsageSnapshot {
    pub fn get(&self, resource: ResourceType) -> u64 {
        match resource {
            ResourceType::Products => self.products,
            ResourceType::Orders => self.orders,
            ResourceType::TeamMembers => self.team_members,
            ResourceType::StorageMb => self.storage_mb,
        }
    }

    /// Whether every count fits within `limits`
    pub fn fits_within(&self, limits: &ResourceLimits) -> bool {
        ResourceType::ALL
            .into_iter()
            .all(|resource| limits.get(resource).accommodates(self.get(resource)))
    }
}

/// Result of checking one resource against its limit
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct UsageCheck {
    /// Whether one more unit may be added
    pub allowed: bool,
    pub current: u64,
    pub limit: Limit,
    /// `None` when unlimited
    pub remaining: Option<u64>,
    /// Clamped to 0..=100; always 0 when unlimited
    pub percent_used: f64,
}

impl UsageCheck {
    pub fn evaluate(current: u64, limit: Limit) -> Self {
        match limit {
            Limit::Unlimited => Self {
                allowed: true,
                current,
                limit,
                remaining: None,
                percent_used: 0.0,
            },
            Limit::Bounded(max) => {
                let percent_used = if max == 0 {
                    100.0
                } else {
                    ((current as f64 / max as f64) * 100.0).clamp(0.0, 100.0)
                };
                Self {
                    allowed: current < max,
                    current,
                    limit,
                    remaining: Some(max.saturating_sub(current)),
                    percent_used,
                }
            }
        }
    }

    /// At or past the limit. Unlimited resources are never exceeded.
    pub fn is_exceeded(&self) -> bool {
        !self.allowed
    }

    /// At or above `threshold_percent` but not yet exceeded
    pub fn is_approaching(&self, threshold_percent: f64) -> bool {
        !self.is_exceeded() && !self.limit.is_unlimited() && self.percent_used >= threshold_percent
    }
}

/// A usage check tagged with its resource
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct ResourceUsage {
    pub resource: ResourceType,
    #[serde(flatten)]
    pub check: UsageCheck,
}

/// Linear month-end estimate for one resource
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct UsageProjection {
    pub resource: ResourceType,
    pub current: u64,
    pub projected: u64,
    pub day_of_month: u8,
    pub days_in_month: u8,
}

/// Usage metering service
#[derive(Clone)]
pub struct UsageMeter {
    source: Arc<dyn UsageSource>,
    clock: Clock,
}

impl UsageMeter {
    pub fn new(source: Arc<dyn UsageSource>) -> Self {
        Self {
            source,
            clock: OffsetDateTime::now_utc,
        }
    }

    /// Replace the clock used for billing-month boundaries
    pub fn with_clock(mut self, clock: Clock) -> Self {
        self.clock = clock;
        self
    }

    /// Start of the current billing month (the first, at midnight)
    pub fn billing_month_start(&self) -> OffsetDateTime {
        month_start((self.clock)())
    }

    /// Fetch all four counts concurrently.
    ///
    /// Fails as a whole if any count fails; a failed count is never reported
    /// as zero.
    pub async fn get_organization_usage(&self, org_id: OrgId) -> BillingResult<UsageSnapshot> {
        let since = self.billing_month_start();
        let (products, orders, team_members, storage_mb) = tokio::try_join!(
            self.source.count_products(org_id),
            self.source.count_orders_since(org_id, since),
            self.source.count_team_members(org_id),
            self.source.storage_used_mb(org_id),
        )?;

        Ok(UsageSnapshot {
            products,
            orders,
            team_members,
            storage_mb,
        })
    }

    /// Current count for a single resource
    pub async fn current_usage(&self, org_id: OrgId, resource: ResourceType) -> BillingResult<u64> {
        match resource {
            ResourceType::Products => self.source.count_products(org_id).await,
            ResourceType::Orders => {
                self.source
                    .count_orders_since(org_id, self.billing_month_start())
                    .await
            }
            ResourceType::TeamMembers => self.source.count_team_members(org_id).await,
            ResourceType::StorageMb => self.source.storage_used_mb(org_id).await,
        }
    }

    pub async fn check_usage_limit(
        &self,
        org_id: OrgId,
        resource: ResourceType,
        plan_id: PlanId,
    ) -> BillingResult<UsageCheck> {
        self.check_within(org_id, resource, plans::plan(plan_id).limits.get(resource))
            .await
    }

    /// Check against an explicit limit, such as an organization's cached one
    pub async fn check_within(
        &self,
        org_id: OrgId,
        resource: ResourceType,
        limit: Limit,
    ) -> BillingResult<UsageCheck> {
        let current = self.current_usage(org_id, resource).await?;
        Ok(UsageCheck::evaluate(current, limit))
    }

    /// Whether `quantity` more units fit under the plan's limit.
    /// Advisory only; see the module docs.
    pub async fn can_add_resource(
        &self,
        org_id: OrgId,
        resource: ResourceType,
        plan_id: PlanId,
        quantity: u64,
    ) -> BillingResult<bool> {
        self.can_add_within(org_id, resource, plans::plan(plan_id).limits.get(resource), quantity)
            .await
    }

    pub async fn can_add_within(
        &self,
        org_id: OrgId,
        resource: ResourceType,
        limit: Limit,
        quantity: u64,
    ) -> BillingResult<bool> {
        if limit.is_unlimited() {
            return Ok(true);
        }
        let current = self.current_usage(org_id, resource).await?;
        Ok(limit.accommodates(current.saturating_add(quantity)))
    }

    pub async fn get_all_usage_limits(
        &self,
        org_id: OrgId,
        plan_id: PlanId,
    ) -> BillingResult<Vec<ResourceUsage>> {
        self.all_within(org_id, &plans::plan(plan_id).limits).await
    }

    /// Check every resource against `limits` using one usage fan-out
    pub async fn all_within(
        &self,
        org_id: OrgId,
        limits: &ResourceLimits,
    ) -> BillingResult<Vec<ResourceUsage>> {
        let usage = self.get_organization_usage(org_id).await?;
        Ok(ResourceType::ALL
            .into_iter()
            .map(|resource| ResourceUsage {
                resource,
                check: UsageCheck::evaluate(usage.get(resource), limits.get(resource)),
            })
            .collect())
    }

    pub async fn get_approaching_limits(
        &self,
        org_id: OrgId,
        plan_id: PlanId,
        threshold_percent: f64,
    ) -> BillingResult<Vec<ResourceUsage>> {
        let all = self.get_all_usage_limits(org_id, plan_id).await?;
        Ok(approaching(all, threshold_percent))
    }

    pub async fn get_exceeded_limits(
        &self,
        org_id: OrgId,
        plan_id: PlanId,
    ) -> BillingResult<Vec<ResourceUsage>> {
        let all = self.get_all_usage_limits(org_id, plan_id).await?;
        Ok(exceeded(all))
    }

    /// Estimate month-end usage from the daily average so far.
    /// This is a heuristic; present it as an estimate.
    pub async fn project_month_end_usage(
        &self,
        org_id: OrgId,
        resource: ResourceType,
    ) -> BillingResult<UsageProjection> {
        let today = (self.clock)().date();
        let current = self.current_usage(org_id, resource).await?;

        Ok(UsageProjection {
            resource,
            current,
            projected: project_month_end(current, today),
            day_of_month: today.day(),
            days_in_month: days_in_month(today),
        })
    }

    /// First plan in ascending order, other than `current_plan`, whose limits
    /// accommodate current usage on every resource.
    ///
    /// The scan starts at the bottom tier, so a lower plan is returned when it
    /// already fits.
    pub async fn get_suggested_plan(
        &self,
        org_id: OrgId,
        current_plan: PlanId,
    ) -> BillingResult<Option<PlanId>> {
        let usage = self.get_organization_usage(org_id).await?;
        Ok(suggest_plan(&usage, current_plan))
    }
}

pub(crate) fn approaching(all: Vec<ResourceUsage>, threshold_percent: f64) -> Vec<ResourceUsage> {
    all.into_iter()
        .filter(|u| u.check.is_approaching(threshold_percent))
        .collect()
}

pub(crate) fn exceeded(all: Vec<ResourceUsage>) -> Vec<ResourceUsage> {
    all.into_iter().filter(|u| u.check.is_exceeded()).collect()
}

pub(crate) fn suggest_plan(usage: &UsageSnapshot, current_plan: PlanId) -> Option<PlanId> {
    plans::all_plans()
        .filter(|plan| plan.id != current_plan)
        .find(|plan| usage.fits_within(&plan.limits))
        .map(|plan| plan.id)
}

fn month_start(now: OffsetDateTime) -> OffsetDateTime {
    let first = now.date() - time::Duration::days(i64::from(now.day()) - 1);
    now.replace_date(first).replace_time(Time::MIDNIGHT)
}

fn days_in_month(date: Date) -> u8 {
    date.month().length(date.year())
}

/// `current / day_of_month * days_in_month`, rounded to the nearest unit
pub fn project_month_end(current: u64, today: Date) -> u64 {
    let daily_average = current as f64 / f64::from(today.day());
    (daily_average * f64::from(days_in_month(today))).round() as u64
}
