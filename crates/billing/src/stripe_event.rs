//! Stripe adapter
//!
//! Converts typed `stripe::Event`s (as parsed by the webhook layer) into the
//! processor-neutral [`SubscriptionEvent`]. Only subscription lifecycle events
//! are accepted. Status and interval are carried over as strings and
//! validated by the event itself, so Stripe vocabulary added later fails as
//! malformed input instead of being guessed at.

use stripe::{Event, EventObject, EventType, Expandable, Subscription};

use crate::error::BillingError;
use crate::event::{
    LineItem, LinePrice, Recurring, SubscriptionEvent, SubscriptionEventType, SubscriptionPayload,
};

/// Map a Stripe event type to the subscription lifecycle event it represents
pub fn subscription_event_type(event_type: &EventType) -> Option<SubscriptionEventType> {
    match event_type {
        EventType::CustomerSubscriptionCreated => Some(SubscriptionEventType::Created),
        EventType::CustomerSubscriptionUpdated => Some(SubscriptionEventType::Updated),
        EventType::CustomerSubscriptionDeleted => Some(SubscriptionEventType::Deleted),
        _ => None,
    }
}

impl TryFrom<Event> for SubscriptionEvent {
    type Error = BillingError;

    fn try_from(event: Event) -> Result<Self, Self::Error> {
        let event_id = event.id.to_string();
        let event_type = subscription_event_type(&event.type_).ok_or_else(|| {
            BillingError::InvalidEvent(format!(
                "{} is not a subscription lifecycle event ({})",
                event_id, event.type_
            ))
        })?;

        let subscription = match event.data.object {
            EventObject::Subscription(subscription) => subscription,
            _ => {
                return Err(BillingError::InvalidEvent(format!(
                    "{} does not carry a subscription object",
                    event_id
                )))
            }
        };

        Ok(SubscriptionEvent {
            event_id,
            event_type,
            created: event.created,
            subscription: payload(subscription),
        })
    }
}

fn payload(subscription: Subscription) -> SubscriptionPayload {
    let customer = match &subscription.customer {
        Expandable::Id(id) => id.to_string(),
        Expandable::Object(customer) => customer.id.to_string(),
    };

    let items = subscription
        .items
        .data
        .iter()
        .map(|item| LineItem {
            price: item.price.as_ref().map(|price| LinePrice {
                id: price.id.to_string(),
                unit_amount: price.unit_amount,
                currency: price.currency.as_ref().map(|c| c.to_string()),
                recurring: price.recurring.as_ref().map(|r| Recurring {
                    interval: r.interval.as_str().to_string(),
                }),
            }),
        })
        .collect();

    SubscriptionPayload {
        id: subscription.id.to_string(),
        status: subscription.status.as_str().to_string(),
        customer,
        current_period_start: subscription.current_period_start,
        current_period_end: subscription.current_period_end,
        trial_start: subscription.trial_start,
        trial_end: subscription.trial_end,
        cancel_at: subscription.cancel_at,
        canceled_at: subscription.canceled_at,
        ended_at: subscription.ended_at,
        metadata: subscription.metadata,
        items,
    }
}
