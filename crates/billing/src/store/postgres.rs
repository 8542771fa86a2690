//! PostgreSQL-backed entitlement store and usage source

use async_trait::async_trait;
use sqlx::PgPool;
use storefront_shared::{OrgId, ResourceLimits};
use time::OffsetDateTime;
use uuid::Uuid;

use super::{
    to_count, ApplyResult, EntitlementStore, EntitlementWrite, OrganizationEntitlement,
    UsageSource,
};
use crate::error::{BillingError, BillingResult};
use crate::snapshots::{BillingSnapshot, NewBillingSnapshot};

const ENTITLEMENT_COLUMNS: &str = r#"
    id, plan_id, billing_interval, subscription_status,
    external_customer_ref, external_subscription_ref,
    limit_products, limit_orders, limit_team_members, limit_storage_mb,
    last_applied_event_at
"#;

const SNAPSHOT_COLUMNS: &str = r#"
    id, organization_id, external_event_id, external_subscription_ref,
    external_price_ref, plan_id, billing_interval, status, amount_minor, amount,
    currency, period_start, period_end, trial_start, trial_end, cancel_at,
    canceled_at, ended_at, created_at
"#;

/// Entitlement store over the `organizations` and `billing_snapshots` tables
#[derive(Clone)]
pub struct PgEntitlementStore {
    pool: PgPool,
}

impl PgEntitlementStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[derive(sqlx::FromRow)]
struct EntitlementRow {
    id: Uuid,
    plan_id: String,
    billing_interval: Option<String>,
    subscription_status: Option<String>,
    external_customer_ref: Option<String>,
    external_subscription_ref: Option<String>,
    limit_products: i64,
    limit_orders: i64,
    limit_team_members: i64,
    limit_storage_mb: i64,
    last_applied_event_at: Option<OffsetDateTime>,
}

impl TryFrom<EntitlementRow> for OrganizationEntitlement {
    type Error = BillingError;

    fn try_from(row: EntitlementRow) -> Result<Self, Self::Error> {
        Ok(Self {
            org_id: OrgId(row.id),
            plan_id: row
                .plan_id
                .parse()
                .map_err(|_| BillingError::UnknownPlan(row.plan_id.clone()))?,
            billing_interval: row
                .billing_interval
                .map(|s| s.parse())
                .transpose()
                .map_err(BillingError::Internal)?,
            subscription_status: row
                .subscription_status
                .map(|s| s.parse())
                .transpose()
                .map_err(BillingError::Internal)?,
            external_customer_ref: row.external_customer_ref,
            external_subscription_ref: row.external_subscription_ref,
            limits: ResourceLimits::from_raw(
                row.limit_products,
                row.limit_orders,
                row.limit_team_members,
                row.limit_storage_mb,
            )?,
            last_applied_event_at: row.last_applied_event_at,
        })
    }
}

#[derive(sqlx::FromRow)]
struct SnapshotRow {
    id: Uuid,
    organization_id: Uuid,
    external_event_id: String,
    external_subscription_ref: String,
    external_price_ref: Option<String>,
    plan_id: String,
    billing_interval: Option<String>,
    status: String,
    amount_minor: Option<i64>,
    amount: Option<f64>,
    currency: Option<String>,
    period_start: OffsetDateTime,
    period_end: OffsetDateTime,
    trial_start: Option<OffsetDateTime>,
    trial_end: Option<OffsetDateTime>,
    cancel_at: Option<OffsetDateTime>,
    canceled_at: Option<OffsetDateTime>,
    ended_at: Option<OffsetDateTime>,
    created_at: OffsetDateTime,
}

impl TryFrom<SnapshotRow> for BillingSnapshot {
    type Error = BillingError;

    fn try_from(row: SnapshotRow) -> Result<Self, Self::Error> {
        Ok(Self {
            id: row.id,
            organization_id: OrgId(row.organization_id),
            external_event_id: row.external_event_id,
            external_subscription_ref: row.external_subscription_ref,
            external_price_ref: row.external_price_ref,
            plan_id: row
                .plan_id
                .parse()
                .map_err(|_| BillingError::UnknownPlan(row.plan_id.clone()))?,
            billing_interval: row
                .billing_interval
                .map(|s| s.parse())
                .transpose()
                .map_err(BillingError::Internal)?,
            status: row.status.parse().map_err(BillingError::Internal)?,
            amount_minor: row.amount_minor,
            amount: row.amount,
            currency: row.currency,
            period_start: row.period_start,
            period_end: row.period_end,
            trial_start: row.trial_start,
            trial_end: row.trial_end,
            cancel_at: row.cancel_at,
            canceled_at: row.canceled_at,
            ended_at: row.ended_at,
            created_at: row.created_at,
        })
    }
}

#[async_trait]
impl EntitlementStore for PgEntitlementStore {
    async fn load_entitlement(&self, org_id: OrgId) -> BillingResult<OrganizationEntitlement> {
        let row: Option<EntitlementRow> = sqlx::query_as(&format!(
            "SELECT {} FROM organizations WHERE id = $1",
            ENTITLEMENT_COLUMNS
        ))
        .bind(org_id.0)
        .fetch_optional(&self.pool)
        .await?;

        row.ok_or_else(|| BillingError::NotFound(format!("Organization {}", org_id)))?
            .try_into()
    }

    async fn apply_sync(
        &self,
        write: &EntitlementWrite,
        snapshot: &NewBillingSnapshot,
    ) -> BillingResult<ApplyResult> {
        let limits = write.limits();
        let mut tx = self.pool.begin().await?;

        // Compare-and-swap on the ordering key. The row lock taken here also
        // serializes concurrent deliveries for the same organization.
        let updated = sqlx::query(
            r#"
            UPDATE organizations
            SET plan_id = $2,
                billing_interval = $3,
                subscription_status = $4,
                external_customer_ref = $5,
                external_subscription_ref = $6,
                limit_products = $7,
                limit_orders = $8,
                limit_team_members = $9,
                limit_storage_mb = $10,
                last_applied_event_at = $11,
                updated_at = NOW()
            WHERE id = $1
              AND (last_applied_event_at IS NULL OR last_applied_event_at <= $11)
            "#,
        )
        .bind(write.org_id.0)
        .bind(write.plan_id.as_str())
        .bind(write.billing_interval.map(|i| i.as_str()))
        .bind(write.subscription_status.as_str())
        .bind(&write.external_customer_ref)
        .bind(&write.external_subscription_ref)
        .bind(limits.products.to_raw())
        .bind(limits.orders.to_raw())
        .bind(limits.team_members.to_raw())
        .bind(limits.storage_mb.to_raw())
        .bind(write.event_at)
        .execute(&mut *tx)
        .await?
        .rows_affected();

        if updated == 0 {
            let existing: Option<(Option<OffsetDateTime>,)> =
                sqlx::query_as("SELECT last_applied_event_at FROM organizations WHERE id = $1")
                    .bind(write.org_id.0)
                    .fetch_optional(&mut *tx)
                    .await?;
            tx.rollback().await?;

            return match existing {
                None => Ok(ApplyResult::OrgNotFound),
                Some((Some(last_applied_at),)) => Ok(ApplyResult::Stale { last_applied_at }),
                Some((None,)) => Err(BillingError::Internal(format!(
                    "Organization {} rejected an unconditional entitlement write",
                    write.org_id
                ))),
            };
        }

        let inserted = sqlx::query(
            r#"
            INSERT INTO billing_snapshots (
                id, organization_id, external_event_id, external_subscription_ref,
                external_price_ref, plan_id, billing_interval, status, amount_minor,
                amount, currency, period_start, period_end, trial_start, trial_end,
                cancel_at, canceled_at, ended_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17, $18)
            ON CONFLICT (organization_id, external_event_id) DO NOTHING
            "#,
        )
        .bind(snapshot.id)
        .bind(snapshot.organization_id.0)
        .bind(&snapshot.external_event_id)
        .bind(&snapshot.external_subscription_ref)
        .bind(&snapshot.external_price_ref)
        .bind(snapshot.plan_id.as_str())
        .bind(snapshot.billing_interval.map(|i| i.as_str()))
        .bind(snapshot.status.as_str())
        .bind(snapshot.amount_minor)
        .bind(snapshot.amount)
        .bind(&snapshot.currency)
        .bind(snapshot.period_start)
        .bind(snapshot.period_end)
        .bind(snapshot.trial_start)
        .bind(snapshot.trial_end)
        .bind(snapshot.cancel_at)
        .bind(snapshot.canceled_at)
        .bind(snapshot.ended_at)
        .execute(&mut *tx)
        .await?
        .rows_affected();

        tx.commit().await?;

        Ok(ApplyResult::Applied {
            snapshot_recorded: inserted > 0,
        })
    }

    async fn list_snapshots(&self, org_id: OrgId, limit: i64) -> BillingResult<Vec<BillingSnapshot>> {
        let rows: Vec<SnapshotRow> = sqlx::query_as(&format!(
            r#"
            SELECT {}
            FROM billing_snapshots
            WHERE organization_id = $1
            ORDER BY created_at DESC
            LIMIT $2
            "#,
            SNAPSHOT_COLUMNS
        ))
        .bind(org_id.0)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(BillingSnapshot::try_from).collect()
    }

    async fn list_entitlements(&self) -> BillingResult<Vec<OrganizationEntitlement>> {
        let rows: Vec<EntitlementRow> = sqlx::query_as(&format!(
            "SELECT {} FROM organizations ORDER BY created_at",
            ENTITLEMENT_COLUMNS
        ))
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter()
            .map(OrganizationEntitlement::try_from)
            .collect()
    }
}

#[async_trait]
impl UsageSource for PgEntitlementStore {
    async fn count_products(&self, org_id: OrgId) -> BillingResult<u64> {
        let (count,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM products WHERE org_id = $1")
            .bind(org_id.0)
            .fetch_one(&self.pool)
            .await?;
        Ok(to_count(count))
    }

    async fn count_orders_since(&self, org_id: OrgId, since: OffsetDateTime) -> BillingResult<u64> {
        let (count,): (i64,) =
            sqlx::query_as("SELECT COUNT(*) FROM orders WHERE org_id = $1 AND created_at >= $2")
                .bind(org_id.0)
                .bind(since)
                .fetch_one(&self.pool)
                .await?;
        Ok(to_count(count))
    }

    async fn count_team_members(&self, org_id: OrgId) -> BillingResult<u64> {
        let (count,): (i64,) =
            sqlx::query_as("SELECT COUNT(*) FROM organization_members WHERE org_id = $1")
                .bind(org_id.0)
                .fetch_one(&self.pool)
                .await?;
        Ok(to_count(count))
    }

    // Storage is not metered yet; uploads are not tracked per organization.
    async fn storage_used_mb(&self, _org_id: OrgId) -> BillingResult<u64> {
        Ok(0)
    }
}
