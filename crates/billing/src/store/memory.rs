//! In-memory entitlement store
//!
//! Mirrors the PostgreSQL semantics (ordering guard, snapshot dedup, atomic
//! apply) closely enough for unit tests. Counts are seeded directly, and any
//! count query can be made to fail to simulate an unavailable store.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use storefront_shared::{OrgId, ResourceType};
use time::OffsetDateTime;
use tokio::sync::RwLock;

use super::{
    ApplyResult, EntitlementStore, EntitlementWrite, OrganizationEntitlement, UsageSource,
};
use crate::error::{BillingError, BillingResult};
use crate::snapshots::{BillingSnapshot, NewBillingSnapshot};

#[derive(Default)]
struct Inner {
    orgs: HashMap<OrgId, OrganizationEntitlement>,
    snapshots: Vec<BillingSnapshot>,
    products: HashMap<OrgId, u64>,
    orders: HashMap<OrgId, Vec<OffsetDateTime>>,
    team_members: HashMap<OrgId, u64>,
    storage_mb: HashMap<OrgId, u64>,
    failing: HashSet<ResourceType>,
    fail_writes: bool,
}

/// Shared, cloneable in-memory store
#[derive(Clone, Default)]
pub struct InMemoryEntitlementStore {
    inner: Arc<RwLock<Inner>>,
}

impl InMemoryEntitlementStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a FREE organization and return its id
    pub async fn create_org(&self) -> OrgId {
        let org_id = OrgId::new();
        self.put_org(OrganizationEntitlement::new_free(org_id)).await;
        org_id
    }

    /// Insert or replace an organization record verbatim
    pub async fn put_org(&self, org: OrganizationEntitlement) {
        self.inner.write().await.orgs.insert(org.org_id, org);
    }

    pub async fn set_products(&self, org_id: OrgId, count: u64) {
        self.inner.write().await.products.insert(org_id, count);
    }

    /// Record one order per timestamp
    pub async fn add_orders(&self, org_id: OrgId, created_at: &[OffsetDateTime]) {
        self.inner
            .write()
            .await
            .orders
            .entry(org_id)
            .or_default()
            .extend_from_slice(created_at);
    }

    pub async fn set_team_members(&self, org_id: OrgId, count: u64) {
        self.inner.write().await.team_members.insert(org_id, count);
    }

    pub async fn set_storage_mb(&self, org_id: OrgId, megabytes: u64) {
        self.inner.write().await.storage_mb.insert(org_id, megabytes);
    }

    /// Make every count query for `resource` fail with a database error
    pub async fn fail_counts_for(&self, resource: ResourceType) {
        self.inner.write().await.failing.insert(resource);
    }

    /// Make `apply_sync` fail with a database error
    pub async fn fail_writes(&self, fail: bool) {
        self.inner.write().await.fail_writes = fail;
    }

    /// Snapshots in insertion order
    pub async fn snapshots(&self) -> Vec<BillingSnapshot> {
        self.inner.read().await.snapshots.clone()
    }

    async fn count(
        &self,
        resource: ResourceType,
        read: impl FnOnce(&Inner) -> u64 + Send,
    ) -> BillingResult<u64> {
        let inner = self.inner.read().await;
        if inner.failing.contains(&resource) {
            return Err(BillingError::Database(format!(
                "simulated failure counting {}",
                resource
            )));
        }
        Ok(read(&inner))
    }
}

#[async_trait]
impl EntitlementStore for InMemoryEntitlementStore {
    async fn load_entitlement(&self, org_id: OrgId) -> BillingResult<OrganizationEntitlement> {
        self.inner
            .read()
            .await
            .orgs
            .get(&org_id)
            .cloned()
            .ok_or_else(|| BillingError::NotFound(format!("Organization {}", org_id)))
    }

    async fn apply_sync(
        &self,
        write: &EntitlementWrite,
        snapshot: &NewBillingSnapshot,
    ) -> BillingResult<ApplyResult> {
        let mut inner = self.inner.write().await;
        if inner.fail_writes {
            return Err(BillingError::Database(
                "simulated failure applying entitlement".to_string(),
            ));
        }

        let Some(org) = inner.orgs.get_mut(&write.org_id) else {
            return Ok(ApplyResult::OrgNotFound);
        };

        if let Some(last_applied_at) = org.last_applied_event_at {
            if last_applied_at > write.event_at {
                return Ok(ApplyResult::Stale { last_applied_at });
            }
        }

        org.plan_id = write.plan_id;
        org.billing_interval = write.billing_interval;
        org.subscription_status = Some(write.subscription_status);
        org.external_customer_ref = Some(write.external_customer_ref.clone());
        org.external_subscription_ref = Some(write.external_subscription_ref.clone());
        org.limits = write.limits();
        org.last_applied_event_at = Some(write.event_at);

        let duplicate = inner.snapshots.iter().any(|s| {
            s.organization_id == snapshot.organization_id
                && s.external_event_id == snapshot.external_event_id
        });
        if !duplicate {
            inner
                .snapshots
                .push(snapshot.clone().into_snapshot(OffsetDateTime::now_utc()));
        }

        Ok(ApplyResult::Applied {
            snapshot_recorded: !duplicate,
        })
    }

    async fn list_snapshots(&self, org_id: OrgId, limit: i64) -> BillingResult<Vec<BillingSnapshot>> {
        let limit = usize::try_from(limit).unwrap_or(0);
        Ok(self
            .inner
            .read()
            .await
            .snapshots
            .iter()
            .rev()
            .filter(|s| s.organization_id == org_id)
            .take(limit)
            .cloned()
            .collect())
    }

    async fn list_entitlements(&self) -> BillingResult<Vec<OrganizationEntitlement>> {
        Ok(self.inner.read().await.orgs.values().cloned().collect())
    }
}

#[async_trait]
impl UsageSource for InMemoryEntitlementStore {
    async fn count_products(&self, org_id: OrgId) -> BillingResult<u64> {
        self.count(ResourceType::Products, |inner| {
            inner.products.get(&org_id).copied().unwrap_or(0)
        })
        .await
    }

    async fn count_orders_since(&self, org_id: OrgId, since: OffsetDateTime) -> BillingResult<u64> {
        self.count(ResourceType::Orders, |inner| {
            inner
                .orders
                .get(&org_id)
                .map(|orders| orders.iter().filter(|at| **at >= since).count() as u64)
                .unwrap_or(0)
        })
        .await
    }

    async fn count_team_members(&self, org_id: OrgId) -> BillingResult<u64> {
        self.count(ResourceType::TeamMembers, |inner| {
            inner.team_members.get(&org_id).copied().unwrap_or(0)
        })
        .await
    }

    async fn storage_used_mb(&self, org_id: OrgId) -> BillingResult<u64> {
        self.count(ResourceType::StorageMb, |inner| {
            inner.storage_mb.get(&org_id).copied().unwrap_or(0)
        })
        .await
    }
}
