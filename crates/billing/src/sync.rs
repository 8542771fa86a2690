//! Entitlement synchronizer
//!
//! Applies one subscription event to an organization's cached entitlement.
//! Delivery is at-least-once and unordered, so every call is guarded by the
//! event timestamp and deduplicated by event id. Nothing here retries: a
//! failed call leaves no partial state and the invoker decides what to do.

use std::sync::Arc;

use storefront_shared::{OrgId, PlanId};

use crate::config::BillingConfig;
use crate::error::{BillingError, BillingResult};
use crate::event::{ResolvedSubscription, SubscriptionEvent};
use crate::snapshots::NewBillingSnapshot;
use crate::store::{ApplyResult, EntitlementStore, EntitlementWrite};

/// What a sync call did
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncOutcome {
    /// Organization state rewritten. `snapshot_recorded` is false on replay.
    Applied { snapshot_recorded: bool },
    /// The organization already reflects a newer event
    SkippedStale,
}

#[derive(Clone)]
pub struct EntitlementSynchronizer {
    store: Arc<dyn EntitlementStore>,
    config: BillingConfig,
}

impl EntitlementSynchronizer {
    pub fn new(store: Arc<dyn EntitlementStore>, config: BillingConfig) -> Self {
        Self { store, config }
    }

    /// Apply a subscription event to `org_id`.
    ///
    /// Every input check runs before the store is touched, so a malformed or
    /// misconfigured event never mutates state.
    pub async fn sync_subscription_status(
        &self,
        org_id: OrgId,
        event: &SubscriptionEvent,
    ) -> BillingResult<SyncOutcome> {
        let resolved = event.resolve().inspect_err(|e| {
            tracing::error!(
                org_id = %org_id,
                event_id = %event.event_id,
                error = %e,
                "Rejecting subscription event"
            );
        })?;

        self.cross_check_price(org_id, event, &resolved);

        let write = entitlement_write(org_id, event, &resolved);
        let snapshot = NewBillingSnapshot::from_event(org_id, event, &resolved)?;

        if resolved.status.is_terminal() {
            tracing::info!(
                org_id = %org_id,
                event_id = %event.event_id,
                subscribed_plan = %resolved.plan_id,
                status = %resolved.status,
                "Subscription revoked, downgrading organization to FREE"
            );
        }

        match self.store.apply_sync(&write, &snapshot).await? {
            ApplyResult::Applied { snapshot_recorded } => {
                if !snapshot_recorded {
                    tracing::info!(
                        org_id = %org_id,
                        event_id = %event.event_id,
                        "Snapshot already recorded for event, skipped duplicate"
                    );
                }
                tracing::info!(
                    org_id = %org_id,
                    event_id = %event.event_id,
                    event_type = %event.event_type,
                    plan_id = %write.plan_id,
                    status = %write.subscription_status,
                    "Entitlement synchronized"
                );
                Ok(SyncOutcome::Applied { snapshot_recorded })
            }
            ApplyResult::Stale { last_applied_at } => {
                tracing::info!(
                    org_id = %org_id,
                    event_id = %event.event_id,
                    event_at = %resolved.occurred_at,
                    last_applied_at = %last_applied_at,
                    "Skipping stale subscription event"
                );
                Ok(SyncOutcome::SkippedStale)
            }
            ApplyResult::OrgNotFound => Err(BillingError::NotFound(format!(
                "Organization {}",
                org_id
            ))),
        }
    }

    /// The metadata plan id is authoritative. A price reference that maps to a
    /// different configured plan usually means a mislabeled subscription.
    fn cross_check_price(
        &self,
        org_id: OrgId,
        event: &SubscriptionEvent,
        resolved: &ResolvedSubscription,
    ) {
        let Some(price) = event.active_price() else {
            return;
        };
        if let Some((price_plan, price_interval)) = self.config.plan_for_price_ref(&price.id) {
            if price_plan != resolved.plan_id || Some(price_interval) != resolved.billing_interval
            {
                tracing::warn!(
                    org_id = %org_id,
                    event_id = %event.event_id,
                    price_ref = %price.id,
                    price_plan = %price_plan,
                    price_interval = %price_interval,
                    metadata_plan = %resolved.plan_id,
                    "Price reference disagrees with planId metadata, using metadata"
                );
            }
        }
    }
}

/// Derive the organization's new cached state.
///
/// Terminal statuses revoke the subscription: the organization falls back to
/// FREE with no interval, whatever plan the subscription was for. FREE never
/// carries an interval.
fn entitlement_write(
    org_id: OrgId,
    event: &SubscriptionEvent,
    resolved: &ResolvedSubscription,
) -> EntitlementWrite {
    let plan_id = if resolved.status.is_terminal() {
        PlanId::Free
    } else {
        resolved.plan_id
    };
    let billing_interval = if plan_id == PlanId::Free {
        None
    } else {
        resolved.billing_interval
    };

    EntitlementWrite {
        org_id,
        plan_id,
        billing_interval,
        subscription_status: resolved.status,
        external_customer_ref: event.subscription.customer.clone(),
        external_subscription_ref: event.subscription.id.clone(),
        event_at: resolved.occurred_at,
    }
}
