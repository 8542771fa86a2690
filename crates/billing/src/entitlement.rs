//! Entitlement Module
//!
//! Read-side view of what an organization can do right now. The synchronizer
//! stores the processor status verbatim; this module is where it gets
//! re-bucketed into access decisions.
//!
//! The `*_for_org` helpers read limits from the organization's cached record
//! rather than the catalog, so a gate check costs one row read plus the count.

use std::sync::Arc;

use serde::Serialize;
use storefront_shared::{
    BillingInterval, OrgId, PlanId, ResourceLimits, ResourceType, SubscriptionStatus,
};

use crate::error::BillingResult;
use crate::plans;
use crate::store::{EntitlementStore, OrganizationEntitlement};
use crate::usage::{self, ResourceUsage, UsageCheck, UsageMeter};

/// Access state derived from plan and subscription status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EntitlementState {
    /// No paid subscription
    Free,
    /// Subscription active and in good standing
    Active,
    /// Trial period
    Trialing,
    /// Payment past due; access kept while the processor retries
    PastDueGrace,
    /// First payment still in progress (checkout not finished)
    Pending,
    /// Subscription paused
    Suspended,
    /// Canceled, unpaid or expired before completion
    Revoked,
}

impl std::fmt::Display for EntitlementState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EntitlementState::Free => write!(f, "free"),
            EntitlementState::Active => write!(f, "active"),
            EntitlementState::Trialing => write!(f, "trialing"),
            EntitlementState::PastDueGrace => write!(f, "past_due_grace"),
            EntitlementState::Pending => write!(f, "pending"),
            EntitlementState::Suspended => write!(f, "suspended"),
            EntitlementState::Revoked => write!(f, "revoked"),
        }
    }
}

impl EntitlementState {
    pub fn from_status(plan_id: PlanId, status: Option<SubscriptionStatus>) -> Self {
        match status {
            None => EntitlementState::Free,
            Some(status) if status.is_terminal() => EntitlementState::Revoked,
            Some(SubscriptionStatus::Active) if plan_id == PlanId::Free => EntitlementState::Free,
            Some(SubscriptionStatus::Active) => EntitlementState::Active,
            Some(SubscriptionStatus::Trialing) => EntitlementState::Trialing,
            Some(SubscriptionStatus::PastDue) => EntitlementState::PastDueGrace,
            // Keeps access mid-checkout so a slow first payment does not lock the org out
            Some(SubscriptionStatus::Incomplete) => EntitlementState::Pending,
            Some(SubscriptionStatus::Paused) => EntitlementState::Suspended,
            Some(
                SubscriptionStatus::Canceled
                | SubscriptionStatus::Unpaid
                | SubscriptionStatus::IncompleteExpired,
            ) => EntitlementState::Revoked,
        }
    }

    /// Whether the organization holds paid-plan access in this state
    pub fn is_entitled(&self) -> bool {
        matches!(
            self,
            EntitlementState::Active
                | EntitlementState::Trialing
                | EntitlementState::PastDueGrace
                | EntitlementState::Pending
        )
    }
}

/// Complete entitlement information for an organization
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Entitlement {
    pub org_id: OrgId,
    pub state: EntitlementState,
    pub plan: PlanId,
    pub interval: Option<BillingInterval>,
    /// Limits in force: the cached ones, or FREE's while a paid plan is not entitled
    pub limits: ResourceLimits,
    pub features: &'static [&'static str],
    pub entitled: bool,
}

impl Entitlement {
    /// Pure computation from a stored record
    pub fn from_record(record: &OrganizationEntitlement) -> Self {
        let state = EntitlementState::from_status(record.plan_id, record.subscription_status);
        Self {
            org_id: record.org_id,
            state,
            plan: record.plan_id,
            interval: record.billing_interval,
            limits: effective_limits(record.plan_id, state, &record.limits),
            features: plans::plan(record.plan_id).features,
            entitled: state.is_entitled(),
        }
    }
}

/// A paid plan that is not currently entitled (paused) gates at FREE limits.
/// The cached limits stay untouched so resuming needs no resync.
pub fn effective_limits(
    plan_id: PlanId,
    state: EntitlementState,
    cached: &ResourceLimits,
) -> ResourceLimits {
    if plan_id.is_paid() && !state.is_entitled() {
        plans::plan(PlanId::Free).limits
    } else {
        *cached
    }
}

/// Org-scoped query surface used to gate resource creation
#[derive(Clone)]
pub struct EntitlementService {
    store: Arc<dyn EntitlementStore>,
    meter: UsageMeter,
    approaching_threshold_percent: f64,
}

impl EntitlementService {
    pub fn new(
        store: Arc<dyn EntitlementStore>,
        meter: UsageMeter,
        approaching_threshold_percent: f64,
    ) -> Self {
        Self {
            store,
            meter,
            approaching_threshold_percent,
        }
    }

    pub async fn compute_entitlement(&self, org_id: OrgId) -> BillingResult<Entitlement> {
        let record = self.store.load_entitlement(org_id).await?;
        Ok(Entitlement::from_record(&record))
    }

    /// Plan and limits the gates check against
    async fn gate_limits(&self, org_id: OrgId) -> BillingResult<(PlanId, ResourceLimits)> {
        let entitlement = self.compute_entitlement(org_id).await?;
        Ok((entitlement.plan, entitlement.limits))
    }

    pub async fn check_usage_limit_for_org(
        &self,
        org_id: OrgId,
        resource: ResourceType,
    ) -> BillingResult<UsageCheck> {
        let (_, limits) = self.gate_limits(org_id).await?;
        self.meter
            .check_within(org_id, resource, limits.get(resource))
            .await
    }

    pub async fn can_add_resource_for_org(
        &self,
        org_id: OrgId,
        resource: ResourceType,
        quantity: u64,
    ) -> BillingResult<bool> {
        let (plan_id, limits) = self.gate_limits(org_id).await?;
        let allowed = self
            .meter
            .can_add_within(org_id, resource, limits.get(resource), quantity)
            .await?;

        if !allowed {
            tracing::debug!(
                org_id = %org_id,
                resource = %resource,
                plan_id = %plan_id,
                "Resource limit reached"
            );
        }
        Ok(allowed)
    }

    pub async fn get_all_usage_limits_for_org(
        &self,
        org_id: OrgId,
    ) -> BillingResult<Vec<ResourceUsage>> {
        let (_, limits) = self.gate_limits(org_id).await?;
        self.meter.all_within(org_id, &limits).await
    }

    /// Resources at or above the threshold but not yet exceeded.
    /// `None` uses the configured threshold.
    pub async fn get_approaching_limits_for_org(
        &self,
        org_id: OrgId,
        threshold_percent: Option<f64>,
    ) -> BillingResult<Vec<ResourceUsage>> {
        let all = self.get_all_usage_limits_for_org(org_id).await?;
        Ok(usage::approaching(
            all,
            threshold_percent.unwrap_or(self.approaching_threshold_percent),
        ))
    }

    pub async fn get_exceeded_limits_for_org(
        &self,
        org_id: OrgId,
    ) -> BillingResult<Vec<ResourceUsage>> {
        let all = self.get_all_usage_limits_for_org(org_id).await?;
        Ok(usage::exceeded(all))
    }

    pub async fn get_suggested_plan_for_org(&self, org_id: OrgId) -> BillingResult<Option<PlanId>> {
        let record = self.store.load_entitlement(org_id).await?;
        self.meter.get_suggested_plan(org_id, record.plan_id).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::InMemoryEntitlementStore;
    use storefront_shared::Limit;

    async fn setup() -> (EntitlementService, InMemoryEntitlementStore, OrgId) {
        let store = InMemoryEntitlementStore::new();
        let org_id = store.create_org().await;
        let meter = UsageMeter::new(Arc::new(store.clone()));
        let service = EntitlementService::new(Arc::new(store.clone()), meter, 80.0);
        (service, store, org_id)
    }

    fn record(plan_id: PlanId, status: Option<SubscriptionStatus>) -> OrganizationEntitlement {
        OrganizationEntitlement {
            plan_id,
            subscription_status: status,
            limits: plans::plan(plan_id).limits,
            ..OrganizationEntitlement::new_free(OrgId::new())
        }
    }

    #[test]
    fn test_entitlement_state_display() {
        assert_eq!(EntitlementState::Active.to_string(), "active");
        assert_eq!(EntitlementState::Suspended.to_string(), "suspended");
        assert_eq!(EntitlementState::PastDueGrace.to_string(), "past_due_grace");
    }

    #[test]
    fn test_state_rebucketing() {
        use SubscriptionStatus::*;
        let cases = [
            (PlanId::Free, None, EntitlementState::Free),
            (PlanId::Pro, Some(Active), EntitlementState::Active),
            (PlanId::Pro, Some(Trialing), EntitlementState::Trialing),
            (PlanId::Pro, Some(PastDue), EntitlementState::PastDueGrace),
            (PlanId::Pro, Some(Incomplete), EntitlementState::Pending),
            (PlanId::Pro, Some(Paused), EntitlementState::Suspended),
            (PlanId::Free, Some(Canceled), EntitlementState::Revoked),
            (PlanId::Free, Some(Unpaid), EntitlementState::Revoked),
            (PlanId::Free, Some(IncompleteExpired), EntitlementState::Revoked),
        ];
        for (plan, status, expected) in cases {
            assert_eq!(EntitlementState::from_status(plan, status), expected);
        }
    }

    #[test]
    fn test_entitlement_from_record() {
        let pending = Entitlement::from_record(&record(
            PlanId::Starter,
            Some(SubscriptionStatus::Incomplete),
        ));
        assert!(pending.entitled);
        assert_eq!(pending.features, plans::plan(PlanId::Starter).features);

        let paused = Entitlement::from_record(&record(PlanId::Pro, Some(SubscriptionStatus::Paused)));
        assert!(!paused.entitled);
        assert_eq!(paused.limits, plans::plan(PlanId::Free).limits);

        let past_due =
            Entitlement::from_record(&record(PlanId::Pro, Some(SubscriptionStatus::PastDue)));
        assert_eq!(past_due.limits.products, Limit::Unlimited);

        let free = Entitlement::from_record(&record(PlanId::Free, None));
        assert_eq!(free.state, EntitlementState::Free);
        assert!(!free.entitled);
    }

    #[tokio::test]
    async fn test_gates_use_cached_limits() {
        let (service, store, org_id) = setup().await;
        store.set_products(org_id, 5_000).await;

        assert!(!service
            .can_add_resource_for_org(org_id, ResourceType::Products, 1)
            .await
            .unwrap());
        let exceeded = service.get_exceeded_limits_for_org(org_id).await.unwrap();
        assert!(exceeded.iter().any(|u| u.resource == ResourceType::Products));

        store
            .put_org(OrganizationEntitlement {
                plan_id: PlanId::Pro,
                subscription_status: Some(SubscriptionStatus::Active),
                limits: plans::plan(PlanId::Pro).limits,
                ..OrganizationEntitlement::new_free(org_id)
            })
            .await;

        assert!(service
            .can_add_resource_for_org(org_id, ResourceType::Products, 1)
            .await
            .unwrap());
        let check = service
            .check_usage_limit_for_org(org_id, ResourceType::Products)
            .await
            .unwrap();
        assert!(check.allowed);
        assert_eq!(check.percent_used, 0.0);
    }

    #[tokio::test]
    async fn test_paused_paid_org_gates_at_free_limits() {
        let (service, store, org_id) = setup().await;
        store.set_products(org_id, 5_000).await;
        store
            .put_org(OrganizationEntitlement {
                plan_id: PlanId::Pro,
                billing_interval: Some(BillingInterval::Monthly),
                subscription_status: Some(SubscriptionStatus::Paused),
                limits: plans::plan(PlanId::Pro).limits,
                ..OrganizationEntitlement::new_free(org_id)
            })
            .await;

        let entitlement = service.compute_entitlement(org_id).await.unwrap();
        assert_eq!(entitlement.state, EntitlementState::Suspended);
        assert!(!service
            .can_add_resource_for_org(org_id, ResourceType::Products, 1)
            .await
            .unwrap());
        let check = service
            .check_usage_limit_for_org(org_id, ResourceType::Products)
            .await
            .unwrap();
        assert_eq!(check.limit, Limit::Bounded(10));
        let exceeded = service.get_exceeded_limits_for_org(org_id).await.unwrap();
        assert!(exceeded.iter().any(|u| u.resource == ResourceType::Products));

        // Cached record keeps the paid limits for when the subscription resumes
        let record = store.load_entitlement(org_id).await.unwrap();
        assert_eq!(record.limits, plans::plan(PlanId::Pro).limits);
    }

    #[tokio::test]
    async fn test_approaching_uses_configured_threshold() {
        let (service, store, org_id) = setup().await;
        store.set_products(org_id, 7).await;

        assert!(service
            .get_approaching_limits_for_org(org_id, None)
            .await
            .unwrap()
            .is_empty());

        let approaching = service
            .get_approaching_limits_for_org(org_id, Some(70.0))
            .await
            .unwrap();
        assert_eq!(approaching.len(), 1);
        assert_eq!(approaching[0].resource, ResourceType::Products);
    }

    #[tokio::test]
    async fn test_suggested_plan_for_org() {
        let (service, store, org_id) = setup().await;
        store.set_products(org_id, 40).await;

        assert_eq!(
            service.get_suggested_plan_for_org(org_id).await.unwrap(),
            Some(PlanId::Starter)
        );
        assert_eq!(
            service
                .get_all_usage_limits_for_org(org_id)
                .await
                .unwrap()
                .len(),
            4
        );
    }

    #[tokio::test]
    async fn test_unknown_org_is_not_found() {
        let (service, _store, _org_id) = setup().await;
        let err = service.compute_entitlement(OrgId::new()).await.unwrap_err();
        assert!(matches!(err, crate::error::BillingError::NotFound(_)));
    }
}
