//! Integration tests for the PostgreSQL entitlement store
//!
//! These exercise the transactional guarantees that the in-memory store only
//! imitates: the ordering compare-and-swap, snapshot deduplication on the
//! unique key, and the operational-table counts.
//!
//! ## Running Tests
//! ```bash
//! export DATABASE_URL="postgres://localhost/storefront_test"
//! cargo test -p storefront-billing --test postgres_store -- --ignored --test-threads=1
//! ```

#![allow(clippy::unwrap_used, clippy::expect_used)]

use std::sync::Arc;

use sqlx::PgPool;
use storefront_billing::{
    plans, BillingConfig, BillingError, BillingService, EntitlementStore, PgEntitlementStore,
    SubscriptionEvent, SyncOutcome,
};
use storefront_shared::{BillingInterval, Limit, OrgId, PlanId, ResourceType, SubscriptionStatus};
use time::OffsetDateTime;
use uuid::Uuid;

// ============================================================================
// Test Utilities
// ============================================================================

async fn setup() -> (BillingService, PgPool) {
    let database_url =
        std::env::var("DATABASE_URL").expect("DATABASE_URL must be set for integration tests");

    let pool = storefront_shared::create_pool(&database_url, 5)
        .await
        .expect("Failed to connect to test database");
    storefront_shared::run_migrations(&pool)
        .await
        .expect("Failed to run migrations");

    let billing = BillingService::new(BillingConfig::default(), pool.clone());
    (billing, pool)
}

async fn create_test_org(pool: &PgPool) -> OrgId {
    let org_id = Uuid::new_v4();
    sqlx::query("INSERT INTO organizations (id, name) VALUES ($1, $2)")
        .bind(org_id)
        .bind(format!("test-org-{}", org_id))
        .execute(pool)
        .await
        .expect("Failed to create test organization");
    OrgId(org_id)
}

fn event(event_id: &str, created: i64, plan: &str, status: &str) -> SubscriptionEvent {
    serde_json::from_value(serde_json::json!({
        "event_id": event_id,
        "event_type": "customer.subscription.updated",
        "created": created,
        "subscription": {
            "id": format!("sub_{}", event_id),
            "status": status,
            "customer": "cus_integration",
            "current_period_start": 1_780_272_000,
            "current_period_end": 1_782_864_000,
            "metadata": { "planId": plan },
            "items": [{
                "price": {
                    "id": "price_integration",
                    "unit_amount": 2900,
                    "currency": "usd",
                    "recurring": { "interval": "month" }
                }
            }]
        }
    }))
    .expect("valid event json")
}

/// Unique event ids per run so reruns against the same database do not collide
fn unique(prefix: &str) -> String {
    format!("{}_{}", prefix, Uuid::new_v4().simple())
}

async fn snapshot_count(pool: &PgPool, org_id: OrgId) -> i64 {
    let (count,): (i64,) =
        sqlx::query_as("SELECT COUNT(*) FROM billing_snapshots WHERE organization_id = $1")
            .bind(org_id.0)
            .fetch_one(pool)
            .await
            .unwrap();
    count
}

// ============================================================================
// Synchronization
// ============================================================================

#[tokio::test]
#[ignore] // Requires database
async fn test_sync_writes_org_and_snapshot_together() {
    let (billing, pool) = setup().await;
    let org_id = create_test_org(&pool).await;
    let store = PgEntitlementStore::new(pool.clone());

    let outcome = billing
        .sync
        .sync_subscription_status(org_id, &event(&unique("evt"), 1_780_272_000, "STARTER", "active"))
        .await
        .unwrap();
    assert_eq!(
        outcome,
        SyncOutcome::Applied {
            snapshot_recorded: true
        }
    );

    let org = store.load_entitlement(org_id).await.unwrap();
    assert_eq!(org.plan_id, PlanId::Starter);
    assert_eq!(org.billing_interval, Some(BillingInterval::Monthly));
    assert_eq!(org.subscription_status, Some(SubscriptionStatus::Active));
    assert_eq!(org.limits, plans::plan(PlanId::Starter).limits);
    assert_eq!(org.limits.team_members, Limit::Bounded(3));

    let snapshots = store.list_snapshots(org_id, 10).await.unwrap();
    assert_eq!(snapshots.len(), 1);
    assert_eq!(snapshots[0].amount, Some(29.0));
    assert_eq!(snapshots[0].amount_minor, Some(2900));
}

#[tokio::test]
#[ignore] // Requires database
async fn test_replay_does_not_duplicate_snapshot() {
    let (billing, pool) = setup().await;
    let org_id = create_test_org(&pool).await;
    let replayed = event(&unique("evt"), 1_780_272_000, "PRO", "active");

    billing
        .sync
        .sync_subscription_status(org_id, &replayed)
        .await
        .unwrap();
    let outcome = billing
        .sync
        .sync_subscription_status(org_id, &replayed)
        .await
        .unwrap();

    assert_eq!(
        outcome,
        SyncOutcome::Applied {
            snapshot_recorded: false
        }
    );
    assert_eq!(snapshot_count(&pool, org_id).await, 1);
}

#[tokio::test]
#[ignore] // Requires database
async fn test_older_event_is_skipped() {
    let (billing, pool) = setup().await;
    let org_id = create_test_org(&pool).await;
    let store = PgEntitlementStore::new(pool.clone());

    billing
        .sync
        .sync_subscription_status(org_id, &event(&unique("evt"), 1_780_275_600, "PRO", "canceled"))
        .await
        .unwrap();
    let outcome = billing
        .sync
        .sync_subscription_status(org_id, &event(&unique("evt"), 1_780_272_000, "PRO", "active"))
        .await
        .unwrap();

    assert_eq!(outcome, SyncOutcome::SkippedStale);
    let org = store.load_entitlement(org_id).await.unwrap();
    assert_eq!(org.plan_id, PlanId::Free);
    assert_eq!(org.billing_interval, None);
    assert_eq!(org.limits, plans::plan(PlanId::Free).limits);
    assert_eq!(snapshot_count(&pool, org_id).await, 1);
}

#[tokio::test]
#[ignore] // Requires database
async fn test_unknown_org_rolls_back() {
    let (billing, pool) = setup().await;
    let missing = OrgId::new();

    let err = billing
        .sync
        .sync_subscription_status(missing, &event(&unique("evt"), 1_780_272_000, "PRO", "active"))
        .await
        .unwrap_err();

    assert!(matches!(err, BillingError::NotFound(_)));
    assert_eq!(snapshot_count(&pool, missing).await, 0);
}

#[tokio::test]
#[ignore] // Requires database
async fn test_concurrent_deliveries_converge() {
    let (billing, pool) = setup().await;
    let org_id = create_test_org(&pool).await;
    let billing = Arc::new(billing);

    let handles: Vec<_> = (0..8)
        .map(|i| {
            let billing = billing.clone();
            let status = if i == 7 { "canceled" } else { "active" };
            let event = event(&unique("evt"), 1_780_272_000 + i, "PRO", status);
            tokio::spawn(async move { billing.sync.sync_subscription_status(org_id, &event).await })
        })
        .collect();
    for handle in handles {
        handle.await.unwrap().unwrap();
    }

    // The newest event wins no matter the interleaving
    let org = PgEntitlementStore::new(pool)
        .load_entitlement(org_id)
        .await
        .unwrap();
    assert_eq!(org.subscription_status, Some(SubscriptionStatus::Canceled));
    assert_eq!(org.plan_id, PlanId::Free);
    assert_eq!(org.limits, plans::plan(PlanId::Free).limits);
}

// ============================================================================
// Usage Metering
// ============================================================================

#[tokio::test]
#[ignore] // Requires database
async fn test_usage_counts_from_operational_tables() {
    let (billing, pool) = setup().await;
    let org_id = create_test_org(&pool).await;

    for _ in 0..3 {
        sqlx::query("INSERT INTO products (id, org_id) VALUES ($1, $2)")
            .bind(Uuid::new_v4())
            .bind(org_id.0)
            .execute(&pool)
            .await
            .unwrap();
    }
    let last_month = billing.usage.billing_month_start() - time::Duration::days(1);
    for created_at in [OffsetDateTime::now_utc(), last_month] {
        sqlx::query("INSERT INTO orders (id, org_id, created_at) VALUES ($1, $2, $3)")
            .bind(Uuid::new_v4())
            .bind(org_id.0)
            .bind(created_at)
            .execute(&pool)
            .await
            .unwrap();
    }
    sqlx::query("INSERT INTO organization_members (id, org_id, user_id) VALUES ($1, $2, $3)")
        .bind(Uuid::new_v4())
        .bind(org_id.0)
        .bind(Uuid::new_v4())
        .execute(&pool)
        .await
        .unwrap();

    let usage = billing.usage.get_organization_usage(org_id).await.unwrap();
    assert_eq!(usage.products, 3);
    assert_eq!(usage.orders, 1);
    assert_eq!(usage.team_members, 1);
    assert_eq!(usage.storage_mb, 0);

    let exceeded = billing
        .usage
        .get_exceeded_limits(org_id, PlanId::Free)
        .await
        .unwrap();
    assert_eq!(exceeded.len(), 1);
    assert_eq!(exceeded[0].resource, ResourceType::TeamMembers);
}
