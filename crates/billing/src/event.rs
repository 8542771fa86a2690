//! Inbound billing-event payload
//!
//! The processor-neutral shape the synchronizer consumes. It mirrors the
//! processor's subscription object closely enough that a webhook body can be
//! stored and replayed as-is; see [`crate::stripe_event`] for the adapter from
//! typed Stripe events.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use storefront_shared::{BillingInterval, PlanId, SubscriptionStatus};
use time::OffsetDateTime;

use crate::error::{BillingError, BillingResult};

/// Metadata key carrying the internal plan id on every subscription
pub const PLAN_ID_METADATA_KEY: &str = "planId";

/// Subscription lifecycle event kinds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SubscriptionEventType {
    #[serde(rename = "customer.subscription.created")]
    Created,
    #[serde(rename = "customer.subscription.updated")]
    Updated,
    #[serde(rename = "customer.subscription.deleted")]
    Deleted,
}

impl std::fmt::Display for SubscriptionEventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SubscriptionEventType::Created => write!(f, "customer.subscription.created"),
            SubscriptionEventType::Updated => write!(f, "customer.subscription.updated"),
            SubscriptionEventType::Deleted => write!(f, "customer.subscription.deleted"),
        }
    }
}

/// One delivery of a subscription event
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubscriptionEvent {
    /// Processor event id; the snapshot deduplication key
    pub event_id: String,
    pub event_type: SubscriptionEventType,
    /// When the processor created the event (epoch seconds); the ordering key
    pub created: i64,
    pub subscription: SubscriptionPayload,
}

/// Subscription object attached to an event
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubscriptionPayload {
    pub id: String,
    pub status: String,
    pub customer: String,
    pub current_period_start: i64,
    pub current_period_end: i64,
    #[serde(default)]
    pub trial_start: Option<i64>,
    #[serde(default)]
    pub trial_end: Option<i64>,
    #[serde(default)]
    pub cancel_at: Option<i64>,
    #[serde(default)]
    pub canceled_at: Option<i64>,
    #[serde(default)]
    pub ended_at: Option<i64>,
    #[serde(default)]
    pub metadata: HashMap<String, String>,
    #[serde(default)]
    pub items: Vec<LineItem>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LineItem {
    #[serde(default)]
    pub price: Option<LinePrice>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LinePrice {
    /// Processor price reference
    pub id: String,
    /// Amount in minor currency units
    #[serde(default)]
    pub unit_amount: Option<i64>,
    #[serde(default)]
    pub currency: Option<String>,
    #[serde(default)]
    pub recurring: Option<Recurring>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Recurring {
    /// Interval unit: `day`, `week`, `month` or `year`
    pub interval: String,
}

impl SubscriptionEvent {
    /// The internal plan this subscription was sold as.
    ///
    /// Missing metadata makes the event unprocessable; it is never defaulted.
    pub fn plan_id(&self) -> BillingResult<PlanId> {
        let raw = self
            .subscription
            .metadata
            .get(PLAN_ID_METADATA_KEY)
            .map(|s| s.trim())
            .filter(|s| !s.is_empty())
            .ok_or_else(|| BillingError::MissingPlanMetadata {
                event_id: self.event_id.clone(),
            })?;

        raw.parse()
            .map_err(|_| BillingError::UnknownPlan(raw.to_string()))
    }

    /// First line item that carries a price
    pub fn active_price(&self) -> Option<&LinePrice> {
        self.subscription
            .items
            .iter()
            .find_map(|item| item.price.as_ref())
    }

    /// Billing interval from the active price; `None` when no priced line item remains
    pub fn billing_interval(&self) -> BillingResult<Option<BillingInterval>> {
        let Some(recurring) = self.active_price().and_then(|p| p.recurring.as_ref()) else {
            return Ok(None);
        };

        BillingInterval::from_recurring_unit(&recurring.interval)
            .map(Some)
            .ok_or_else(|| {
                BillingError::InvalidEvent(format!(
                    "unsupported recurring interval '{}' on event {}",
                    recurring.interval, self.event_id
                ))
            })
    }

    pub fn status(&self) -> BillingResult<SubscriptionStatus> {
        self.subscription.status.parse().map_err(|_| {
            BillingError::InvalidEvent(format!(
                "unknown subscription status '{}' on event {}",
                self.subscription.status, self.event_id
            ))
        })
    }

    pub fn occurred_at(&self) -> BillingResult<OffsetDateTime> {
        timestamp("created", self.created)
    }

    /// Resolve everything the synchronizer needs before touching any state
    ///
    /// A terminal event never fails on an unsupported interval; it resolves
    /// to `None` so the revocation still applies.
    pub fn resolve(&self) -> BillingResult<ResolvedSubscription> {
        let plan_id = self.plan_id()?;
        let status = self.status()?;
        let billing_interval = if status.is_terminal() {
            self.billing_interval().ok().flatten()
        } else {
            self.billing_interval()?
        };

        Ok(ResolvedSubscription {
            plan_id,
            billing_interval,
            status,
            occurred_at: self.occurred_at()?,
        })
    }
}

/// Internal view of an event after validation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResolvedSubscription {
    /// Plan the subscription was sold as (from metadata)
    pub plan_id: PlanId,
    pub billing_interval: Option<BillingInterval>,
    pub status: SubscriptionStatus,
    pub occurred_at: OffsetDateTime,
}

/// Convert an epoch-seconds field, rejecting out-of-range values
pub(crate) fn timestamp(field: &str, secs: i64) -> BillingResult<OffsetDateTime> {
    OffsetDateTime::from_unix_timestamp(secs)
        .map_err(|e| BillingError::InvalidEvent(format!("{} is not a valid timestamp: {}", field, e)))
}

pub(crate) fn optional_timestamp(
    field: &str,
    secs: Option<i64>,
) -> BillingResult<Option<OffsetDateTime>> {
    secs.map(|s| timestamp(field, s)).transpose()
}


#[cfg(test)]
mod tests {
    use super::fixtures::*;
    use super::*;

    #[test]
    fn test_resolves_plan_interval_and_status() {
        let event = subscription_event("evt_1", PERIOD_START, "STARTER", "month", "active");
        assert_eq!(event.plan_id().unwrap(), PlanId::Starter);
        assert_eq!(
            event.billing_interval().unwrap(),
            Some(BillingInterval::Monthly)
        );
        assert_eq!(event.status().unwrap(), SubscriptionStatus::Active);
    }

    #[test]
    fn test_missing_plan_metadata_is_fatal() {
        let mut event = subscription_event("evt_1", PERIOD_START, "STARTER", "month", "active");
        event.subscription.metadata.clear();
        assert!(matches!(
            event.plan_id(),
            Err(BillingError::MissingPlanMetadata { event_id }) if event_id == "evt_1"
        ));

        event
            .subscription
            .metadata
            .insert(PLAN_ID_METADATA_KEY.to_string(), "  ".to_string());
        assert!(matches!(
            event.plan_id(),
            Err(BillingError::MissingPlanMetadata { .. })
        ));
    }

    #[test]
    fn test_unknown_plan_metadata_is_configuration_error() {
        let event = subscription_event("evt_1", PERIOD_START, "TEAM", "month", "active");
        assert!(matches!(event.plan_id(), Err(BillingError::UnknownPlan(_))));
    }

    #[test]
    fn test_no_line_item_leaves_interval_empty() {
        let mut event = subscription_event("evt_1", PERIOD_START, "PRO", "year", "canceled");
        event.subscription.items.clear();
        assert_eq!(event.billing_interval().unwrap(), None);
        assert!(event.active_price().is_none());
    }

    #[test]
    fn test_weekly_interval_rejected() {
        let event = subscription_event("evt_1", PERIOD_START, "PRO", "week", "active");
        assert!(matches!(
            event.billing_interval(),
            Err(BillingError::InvalidEvent(_))
        ));
    }

    #[test]
    fn test_terminal_event_ignores_unsupported_interval() {
        let event = subscription_event("evt_1", PERIOD_START, "PRO", "week", "canceled");
        let resolved = event.resolve().unwrap();
        assert_eq!(resolved.status, SubscriptionStatus::Canceled);
        assert_eq!(resolved.billing_interval, None);

        let active = subscription_event("evt_2", PERIOD_START, "PRO", "week", "active");
        assert!(matches!(active.resolve(), Err(BillingError::InvalidEvent(_))));
    }

    #[test]
    fn test_deserializes_webhook_shaped_json() {
        let event: SubscriptionEvent = serde_json::from_value(serde_json::json!({
            "event_id": "evt_42",
            "event_type": "customer.subscription.deleted",
            "created": 1_780_272_000,
            "subscription": {
                "id": "sub_9",
                "status": "canceled",
                "customer": "cus_9",
                "current_period_start": 1_780_272_000,
                "current_period_end": 1_782_864_000,
                "canceled_at": 1_780_272_000,
                "metadata": { "planId": "PRO" }
            }
        }))
        .unwrap();

        assert_eq!(event.event_type, SubscriptionEventType::Deleted);
        assert_eq!(event.plan_id().unwrap(), PlanId::Pro);
        assert_eq!(event.subscription.canceled_at, Some(1_780_272_000));
        assert!(event.subscription.items.is_empty());
    }
}
