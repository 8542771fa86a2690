//! Billing snapshots
//!
//! Append-only record of every applied subscription event. Snapshots answer
//! "what did the processor tell us, and when" during audits and reconciliation
//! disputes. They are never updated or deleted.

use serde::Serialize;
use storefront_shared::{BillingInterval, OrgId, PlanId, SubscriptionStatus};
use time::OffsetDateTime;
use uuid::Uuid;

use crate::error::BillingResult;
use crate::event::{optional_timestamp, timestamp, ResolvedSubscription, SubscriptionEvent};

/// A persisted snapshot
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BillingSnapshot {
    pub id: Uuid,
    pub organization_id: OrgId,
    pub external_event_id: String,
    pub external_subscription_ref: String,
    pub external_price_ref: Option<String>,
    /// Plan the subscription was for, even when the event revoked it
    pub plan_id: PlanId,
    pub billing_interval: Option<BillingInterval>,
    pub status: SubscriptionStatus,
    /// Unit amount in minor currency units, as sent
    pub amount_minor: Option<i64>,
    /// Unit amount in major currency units
    pub amount: Option<f64>,
    pub currency: Option<String>,
    #[serde(with = "time::serde::rfc3339")]
    pub period_start: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub period_end: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339::option")]
    pub trial_start: Option<OffsetDateTime>,
    #[serde(with = "time::serde::rfc3339::option")]
    pub trial_end: Option<OffsetDateTime>,
    #[serde(with = "time::serde::rfc3339::option")]
    pub cancel_at: Option<OffsetDateTime>,
    #[serde(with = "time::serde::rfc3339::option")]
    pub canceled_at: Option<OffsetDateTime>,
    #[serde(with = "time::serde::rfc3339::option")]
    pub ended_at: Option<OffsetDateTime>,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
}

/// A snapshot about to be written
#[derive(Debug, Clone, PartialEq)]
pub struct NewBillingSnapshot {
    pub id: Uuid,
    pub organization_id: OrgId,
    pub external_event_id: String,
    pub external_subscription_ref: String,
    pub external_price_ref: Option<String>,
    pub plan_id: PlanId,
    pub billing_interval: Option<BillingInterval>,
    pub status: SubscriptionStatus,
    pub amount_minor: Option<i64>,
    pub amount: Option<f64>,
    pub currency: Option<String>,
    pub period_start: OffsetDateTime,
    pub period_end: OffsetDateTime,
    pub trial_start: Option<OffsetDateTime>,
    pub trial_end: Option<OffsetDateTime>,
    pub cancel_at: Option<OffsetDateTime>,
    pub canceled_at: Option<OffsetDateTime>,
    pub ended_at: Option<OffsetDateTime>,
}

impl NewBillingSnapshot {
    /// Build the snapshot for an already-resolved event
    pub fn from_event(
        org_id: OrgId,
        event: &SubscriptionEvent,
        resolved: &ResolvedSubscription,
    ) -> BillingResult<Self> {
        let sub = &event.subscription;
        let price = event.active_price();
        let amount_minor = price.and_then(|p| p.unit_amount);

        Ok(Self {
            id: Uuid::new_v4(),
            organization_id: org_id,
            external_event_id: event.event_id.clone(),
            external_subscription_ref: sub.id.clone(),
            external_price_ref: price.map(|p| p.id.clone()),
            plan_id: resolved.plan_id,
            billing_interval: resolved.billing_interval,
            status: resolved.status,
            amount_minor,
            amount: amount_minor.map(minor_to_major),
            currency: price.and_then(|p| p.currency.clone()),
            period_start: timestamp("current_period_start", sub.current_period_start)?,
            period_end: timestamp("current_period_end", sub.current_period_end)?,
            trial_start: optional_timestamp("trial_start", sub.trial_start)?,
            trial_end: optional_timestamp("trial_end", sub.trial_end)?,
            cancel_at: optional_timestamp("cancel_at", sub.cancel_at)?,
            canceled_at: optional_timestamp("canceled_at", sub.canceled_at)?,
            ended_at: optional_timestamp("ended_at", sub.ended_at)?,
        })
    }

    /// Materialize as a stored snapshot
    pub fn into_snapshot(self, created_at: OffsetDateTime) -> BillingSnapshot {
        BillingSnapshot {
            id: self.id,
            organization_id: self.organization_id,
            external_event_id: self.external_event_id,
            external_subscription_ref: self.external_subscription_ref,
            external_price_ref: self.external_price_ref,
            plan_id: self.plan_id,
            billing_interval: self.billing_interval,
            status: self.status,
            amount_minor: self.amount_minor,
            amount: self.amount,
            currency: self.currency,
            period_start: self.period_start,
            period_end: self.period_end,
            trial_start: self.trial_start,
            trial_end: self.trial_end,
            cancel_at: self.cancel_at,
            canceled_at: self.canceled_at,
            ended_at: self.ended_at,
            created_at,
        }
    }
}

/// Convert a minor-unit amount (cents) to major units.
/// Every supported currency uses two decimal places.
pub fn minor_to_major(minor: i64) -> f64 {
    minor as f64 / 100.0
}
