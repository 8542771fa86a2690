//! Persistence seams
//!
//! The synchronizer and the usage meter only talk to storage through these
//! traits. PostgreSQL is the production backend; the in-memory backend backs
//! unit tests and downstream crates' tests (feature `test-store`).

use async_trait::async_trait;
use serde::Serialize;
use storefront_shared::{BillingInterval, OrgId, PlanId, ResourceLimits, SubscriptionStatus};
use time::OffsetDateTime;

use crate::error::BillingResult;
use crate::plans;
use crate::snapshots::{BillingSnapshot, NewBillingSnapshot};

#[cfg(any(test, feature = "test-store"))]
pub mod memory;
pub mod postgres;

#[cfg(any(test, feature = "test-store"))]
pub use memory::InMemoryEntitlementStore;
pub use postgres::PgEntitlementStore;

/// Cached entitlement fields of one organization
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OrganizationEntitlement {
    pub org_id: OrgId,
    pub plan_id: PlanId,
    pub billing_interval: Option<BillingInterval>,
    /// `None` until the first subscription event is applied
    pub subscription_status: Option<SubscriptionStatus>,
    pub external_customer_ref: Option<String>,
    pub external_subscription_ref: Option<String>,
    /// Fast-path copy of the catalog limits for `plan_id`
    pub limits: ResourceLimits,
    #[serde(with = "time::serde::rfc3339::option")]
    pub last_applied_event_at: Option<OffsetDateTime>,
}

impl OrganizationEntitlement {
    /// State of a newly created organization
    pub fn new_free(org_id: OrgId) -> Self {
        Self {
            org_id,
            plan_id: PlanId::Free,
            billing_interval: None,
            subscription_status: None,
            external_customer_ref: None,
            external_subscription_ref: None,
            limits: plans::plan(PlanId::Free).limits,
            last_applied_event_at: None,
        }
    }
}

/// New entitlement state for one organization.
///
/// Limits are not a field: they are always derived from `plan_id`, so a write
/// can never carry limits that disagree with its plan.
#[derive(Debug, Clone, PartialEq)]
pub struct EntitlementWrite {
    pub org_id: OrgId,
    pub plan_id: PlanId,
    pub billing_interval: Option<BillingInterval>,
    pub subscription_status: SubscriptionStatus,
    pub external_customer_ref: String,
    pub external_subscription_ref: String,
    /// Ordering key; writes older than the stored value are rejected
    pub event_at: OffsetDateTime,
}

impl EntitlementWrite {
    pub fn limits(&self) -> ResourceLimits {
        plans::plan(self.plan_id).limits
    }
}

/// Result of [`EntitlementStore::apply_sync`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyResult {
    /// Organization rewritten; `snapshot_recorded` is false when this event id
    /// already had a snapshot
    Applied { snapshot_recorded: bool },
    /// A newer event was already applied; nothing was written
    Stale { last_applied_at: OffsetDateTime },
    OrgNotFound,
}

/// Organization entitlement records and their snapshot history
#[async_trait]
pub trait EntitlementStore: Send + Sync {
    async fn load_entitlement(&self, org_id: OrgId) -> BillingResult<OrganizationEntitlement>;

    /// Atomically apply `write` and append `snapshot`.
    ///
    /// Either both become visible or neither does. The write is skipped when
    /// the organization's last applied event is strictly newer than
    /// `write.event_at`. A snapshot whose (organization, event id) already
    /// exists is skipped without error.
    async fn apply_sync(
        &self,
        write: &EntitlementWrite,
        snapshot: &NewBillingSnapshot,
    ) -> BillingResult<ApplyResult>;

    /// Most recent snapshots first
    async fn list_snapshots(&self, org_id: OrgId, limit: i64) -> BillingResult<Vec<BillingSnapshot>>;

    async fn list_entitlements(&self) -> BillingResult<Vec<OrganizationEntitlement>>;
}

/// Live resource counts from the operational store
#[async_trait]
pub trait UsageSource: Send + Sync {
    async fn count_products(&self, org_id: OrgId) -> BillingResult<u64>;

    async fn count_orders_since(&self, org_id: OrgId, since: OffsetDateTime) -> BillingResult<u64>;

    async fn count_team_members(&self, org_id: OrgId) -> BillingResult<u64>;

    async fn storage_used_mb(&self, org_id: OrgId) -> BillingResult<u64>;
}

/// Clamp a SQL `COUNT(*)` into an unsigned count
pub(crate) fn to_count(raw: i64) -> u64 {
    u64::try_from(raw).unwrap_or(0)
}
