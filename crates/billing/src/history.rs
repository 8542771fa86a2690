//! Billing History Export
//!
//! Exports an organization's billing snapshots to CSV for audits and
//! reconciliation disputes.

use std::sync::Arc;

use storefront_shared::OrgId;
use time::format_description::well_known::Rfc3339;

use crate::error::BillingResult;
use crate::snapshots::BillingSnapshot;
use crate::store::EntitlementStore;

/// Default number of snapshots returned when no limit is given
pub const DEFAULT_HISTORY_LIMIT: i64 = 500;

/// Service for reading and exporting snapshot history
#[derive(Clone)]
pub struct BillingHistoryService {
    store: Arc<dyn EntitlementStore>,
}

impl BillingHistoryService {
    pub fn new(store: Arc<dyn EntitlementStore>) -> Self {
        Self { store }
    }

    /// Most recent snapshots first
    pub async fn get_billing_history(
        &self,
        org_id: OrgId,
        limit: Option<i64>,
    ) -> BillingResult<Vec<BillingSnapshot>> {
        self.store
            .list_snapshots(org_id, limit.unwrap_or(DEFAULT_HISTORY_LIMIT))
            .await
    }

    /// Export snapshot history for an organization to CSV format
    pub async fn export_snapshots_csv(
        &self,
        org_id: OrgId,
        limit: Option<i64>,
    ) -> BillingResult<String> {
        let snapshots = self.get_billing_history(org_id, limit).await?;
        Ok(snapshots_to_csv(&snapshots))
    }
}

pub fn snapshots_to_csv(snapshots: &[BillingSnapshot]) -> String {
    let mut csv = String::new();
    csv.push_str("Date,Event,Subscription,Plan,Interval,Status,Amount,Currency,Price Reference\n");

    for snapshot in snapshots {
        let date = snapshot
            .created_at
            .format(&Rfc3339)
            .unwrap_or_else(|_| "unknown".to_string());
        let amount = snapshot
            .amount
            .map(|a| format!("{:.2}", a))
            .unwrap_or_default();

        csv.push_str(&format!(
            "{},{},{},{},{},{},{},{},{}\n",
            date,
            escape_csv_field(&snapshot.external_event_id),
            escape_csv_field(&snapshot.external_subscription_ref),
            snapshot.plan_id,
            snapshot
                .billing_interval
                .map(|i| i.as_str())
                .unwrap_or_default(),
            snapshot.status,
            amount,
            escape_csv_field(snapshot.currency.as_deref().unwrap_or_default()),
            escape_csv_field(snapshot.external_price_ref.as_deref().unwrap_or_default()),
        ));
    }

    csv
}

/// Escape a field for CSV output
fn escape_csv_field(field: &str) -> String {
    if field.contains(',') || field.contains('"') || field.contains('\n') {
        format!("\"{}\"", field.replace('"', "\"\""))
    } else {
        field.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::fixtures::*;
    use crate::snapshots::NewBillingSnapshot;
    use crate::store::InMemoryEntitlementStore;
    use crate::sync::EntitlementSynchronizer;
    use time::macros::datetime;

    #[test]
    fn test_escape_csv_field() {
        assert_eq!(escape_csv_field("plain"), "plain");
        assert_eq!(escape_csv_field("a,b"), "\"a,b\"");
        assert_eq!(escape_csv_field("say \"hi\""), "\"say \"\"hi\"\"\"");
    }

    #[test]
    fn test_snapshots_to_csv() {
        let event = subscription_event("evt_1", PERIOD_START, "STARTER", "month", "active");
        let snapshot = NewBillingSnapshot::from_event(OrgId::new(), &event, &event.resolve().unwrap())
            .unwrap()
            .into_snapshot(datetime!(2026-06-01 12:00 UTC));

        let csv = snapshots_to_csv(&[snapshot]);
        let lines: Vec<&str> = csv.lines().collect();
        assert_eq!(lines.len(), 2);
        assert_eq!(
            lines[1],
            "2026-06-01T12:00:00Z,evt_1,sub_123,STARTER,monthly,active,29.00,usd,price_starter_monthly"
        );
    }

    #[tokio::test]
    async fn test_export_newest_first() {
        let store = InMemoryEntitlementStore::new();
        let org_id = store.create_org().await;
        let sync = EntitlementSynchronizer::new(
            Arc::new(store.clone()),
            crate::config::test_config(),
        );
        for (i, status) in ["active", "past_due", "canceled"].into_iter().enumerate() {
            let event = subscription_event(
                &format!("evt_{}", i),
                PERIOD_START + i as i64,
                "STARTER",
                "month",
                status,
            );
            sync.sync_subscription_status(org_id, &event).await.unwrap();
        }

        let history = BillingHistoryService::new(Arc::new(store));
        let csv = history.export_snapshots_csv(org_id, Some(2)).await.unwrap();
        let lines: Vec<&str> = csv.lines().collect();
        assert_eq!(lines.len(), 3);
        assert!(lines[1].contains("evt_2"));
        assert!(lines[1].contains("canceled"));
        assert!(lines[2].contains("evt_1"));
    }
}
