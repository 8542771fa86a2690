// Test code patterns (expected in test files):
#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]

//! Storefront Billing Module
//!
//! Keeps each organization's plan, limits and billing state consistent with
//! the payment processor, and meters resource usage against those limits.
//!
//! ## Features
//!
//! - **Plan Catalog**: Compiled-in tiers, limits and list prices
//! - **Entitlement Sync**: Apply subscription events atomically, in order, once
//! - **Usage Metering**: Live counts and soft-limit checks for gating writes
//! - **Entitlement Queries**: Access state and org-scoped limit checks
//! - **History**: Snapshot audit trail and CSV export
//! - **Invariants**: Cache-versus-catalog drift checks

pub mod config;
pub mod entitlement;
pub mod error;
pub mod event;
pub mod history;
pub mod invariants;
pub mod plans;
pub mod snapshots;
pub mod store;
pub mod stripe_event;
pub mod sync;
pub mod usage;

// Config
pub use config::{BillingConfig, PriceRefs, DEFAULT_APPROACHING_THRESHOLD_PERCENT};

// Entitlement
pub use entitlement::{Entitlement, EntitlementService, EntitlementState};

// Error
pub use error::{BillingError, BillingResult, ErrorKind};

// Events
pub use event::{
    ResolvedSubscription, SubscriptionEvent, SubscriptionEventType, SubscriptionPayload,
    PLAN_ID_METADATA_KEY,
};

// History
pub use history::BillingHistoryService;

// Invariants
pub use invariants::{
    InvariantCheckSummary, InvariantChecker, InvariantViolation, ViolationSeverity,
};

// Plans
pub use plans::{
    all_plans, calculate_yearly_savings, calculate_yearly_savings_percent, compare_plans,
    format_limit, get_plan_by_id, Plan, PlanChange,
};

// Snapshots
pub use snapshots::{BillingSnapshot, NewBillingSnapshot};

// Store
#[cfg(any(test, feature = "test-store"))]
pub use store::InMemoryEntitlementStore;
pub use store::{
    ApplyResult, EntitlementStore, EntitlementWrite, OrganizationEntitlement, PgEntitlementStore,
    UsageSource,
};

// Sync
pub use sync::{EntitlementSynchronizer, SyncOutcome};

// Usage
pub use usage::{ResourceUsage, UsageCheck, UsageMeter, UsageProjection, UsageSnapshot};

use std::sync::Arc;

use sqlx::PgPool;
use storefront_shared::{BillingInterval, PlanId};

/// Main billing service that combines all billing functionality
#[derive(Clone)]
pub struct BillingService {
    pub config: BillingConfig,
    pub sync: EntitlementSynchronizer,
    pub usage: UsageMeter,
    pub entitlements: EntitlementService,
    pub history: BillingHistoryService,
    pub invariants: InvariantChecker,
}

impl BillingService {
    /// Create a new billing service from environment variables.
    ///
    /// Fails with `MissingPriceRef` when a list-priced paid plan has no
    /// configured price reference.
    pub fn from_env(pool: PgPool) -> BillingResult<Self> {
        let config = BillingConfig::from_env()?;
        config.validate_price_refs()?;
        Ok(Self::new(config, pool))
    }

    /// Create a PostgreSQL-backed billing service with explicit config
    pub fn new(config: BillingConfig, pool: PgPool) -> Self {
        let store = Arc::new(PgEntitlementStore::new(pool));
        Self::with_store(config, store.clone(), store)
    }

    /// Assemble from arbitrary store backends
    pub fn with_store(
        config: BillingConfig,
        store: Arc<dyn EntitlementStore>,
        usage_source: Arc<dyn UsageSource>,
    ) -> Self {
        let usage = UsageMeter::new(usage_source);
        Self {
            sync: EntitlementSynchronizer::new(store.clone(), config.clone()),
            entitlements: EntitlementService::new(
                store.clone(),
                usage.clone(),
                config.approaching_threshold_percent,
            ),
            history: BillingHistoryService::new(store.clone()),
            invariants: InvariantChecker::new(store),
            usage,
            config,
        }
    }

    /// Configured processor price reference for a plan and interval
    pub fn get_stripe_price_ref(&self, plan: PlanId, interval: BillingInterval) -> Option<&str> {
        self.config.price_ref(plan, interval)
    }
}
