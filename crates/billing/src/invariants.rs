//! Entitlement Invariants Module
//!
//! Runnable consistency checks over the cached organization records. Checks
//! only read. Run them after a replay or on a schedule to catch drift between
//! the cache and the plan catalog.

use std::collections::HashSet;
use std::sync::Arc;

use serde::Serialize;
use storefront_shared::{OrgId, PlanId};
use time::OffsetDateTime;

use crate::error::BillingResult;
use crate::plans;
use crate::store::{EntitlementStore, OrganizationEntitlement};

/// Result of running a single invariant check
#[derive(Debug, Clone, Serialize)]
pub struct InvariantViolation {
    /// Which invariant was violated
    pub invariant: &'static str,
    pub org_id: OrgId,
    pub description: String,
    /// Additional context for debugging
    pub context: serde_json::Value,
    pub severity: ViolationSeverity,
}

/// Severity of an invariant violation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ViolationSeverity {
    /// Organization may hold access it has not paid for
    Critical,
    /// Data inconsistency that needs attention
    High,
    /// Informational
    Medium,
}

impl std::fmt::Display for ViolationSeverity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ViolationSeverity::Critical => write!(f, "CRITICAL"),
            ViolationSeverity::High => write!(f, "HIGH"),
            ViolationSeverity::Medium => write!(f, "MEDIUM"),
        }
    }
}

/// Summary of all invariant checks
#[derive(Debug, Clone, Serialize)]
pub struct InvariantCheckSummary {
    #[serde(with = "time::serde::rfc3339")]
    pub checked_at: OffsetDateTime,
    pub organizations_checked: usize,
    pub checks_run: usize,
    pub checks_passed: usize,
    pub checks_failed: usize,
    pub violations: Vec<InvariantViolation>,
    pub healthy: bool,
}

type Check = fn(&OrganizationEntitlement) -> Option<InvariantViolation>;

const CHECKS: [Check; 3] = [
    check_limits_match_plan,
    check_revoked_is_free,
    check_free_has_no_interval,
];

/// Service for running entitlement invariant checks
#[derive(Clone)]
pub struct InvariantChecker {
    store: Arc<dyn EntitlementStore>,
}

impl InvariantChecker {
    pub fn new(store: Arc<dyn EntitlementStore>) -> Self {
        Self { store }
    }

    /// Run all invariant checks over every organization
    pub async fn run_all_checks(&self) -> BillingResult<InvariantCheckSummary> {
        let records = self.store.list_entitlements().await?;
        Ok(summarize(&records, OffsetDateTime::now_utc()))
    }
}

fn summarize(records: &[OrganizationEntitlement], checked_at: OffsetDateTime) -> InvariantCheckSummary {
    let violations: Vec<InvariantViolation> = records
        .iter()
        .flat_map(|record| CHECKS.iter().filter_map(move |check| check(record)))
        .collect();

    let checks_failed = violations
        .iter()
        .map(|v| v.invariant)
        .collect::<HashSet<_>>()
        .len();

    InvariantCheckSummary {
        checked_at,
        organizations_checked: records.len(),
        checks_run: CHECKS.len(),
        checks_passed: CHECKS.len() - checks_failed,
        checks_failed,
        healthy: violations.is_empty(),
        violations,
    }
}

/// Cached limits equal the catalog limits of the cached plan
fn check_limits_match_plan(record: &OrganizationEntitlement) -> Option<InvariantViolation> {
    let expected = plans::plan(record.plan_id).limits;
    if record.limits == expected {
        return None;
    }

    Some(InvariantViolation {
        invariant: "limits_match_plan",
        org_id: record.org_id,
        description: format!(
            "Cached limits do not match the {} plan",
            record.plan_id
        ),
        context: serde_json::json!({
            "plan_id": record.plan_id,
            "cached": record.limits,
            "expected": expected,
        }),
        severity: ViolationSeverity::Critical,
    })
}

/// A revoked subscription leaves the organization on FREE with no interval
fn check_revoked_is_free(record: &OrganizationEntitlement) -> Option<InvariantViolation> {
    let status = record.subscription_status.filter(|s| s.is_terminal())?;
    if record.plan_id == PlanId::Free && record.billing_interval.is_none() {
        return None;
    }

    Some(InvariantViolation {
        invariant: "revoked_is_free",
        org_id: record.org_id,
        description: format!(
            "Subscription is {} but organization is on {}",
            status, record.plan_id
        ),
        context: serde_json::json!({
            "status": status,
            "plan_id": record.plan_id,
            "billing_interval": record.billing_interval,
        }),
        severity: ViolationSeverity::Critical,
    })
}

fn check_free_has_no_interval(record: &OrganizationEntitlement) -> Option<InvariantViolation> {
    if record.plan_id != PlanId::Free {
        return None;
    }
    let interval = record.billing_interval?;

    Some(InvariantViolation {
        invariant: "free_has_no_interval",
        org_id: record.org_id,
        description: format!("FREE organization has billing interval {}", interval),
        context: serde_json::json!({ "billing_interval": interval }),
        severity: ViolationSeverity::Medium,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::InMemoryEntitlementStore;
    use storefront_shared::{BillingInterval, Limit, SubscriptionStatus};
    use time::macros::datetime;

    fn pro_record() -> OrganizationEntitlement {
        OrganizationEntitlement {
            plan_id: PlanId::Pro,
            billing_interval: Some(BillingInterval::Monthly),
            subscription_status: Some(SubscriptionStatus::Active),
            limits: plans::plan(PlanId::Pro).limits,
            ..OrganizationEntitlement::new_free(OrgId::new())
        }
    }

    #[test]
    fn test_consistent_records_are_healthy() {
        let records = vec![OrganizationEntitlement::new_free(OrgId::new()), pro_record()];
        let summary = summarize(&records, datetime!(2026-06-01 0:00 UTC));
        assert!(summary.healthy);
        assert_eq!(summary.organizations_checked, 2);
        assert_eq!(summary.checks_passed, 3);
    }

    #[test]
    fn test_limit_drift_detected() {
        let mut drifted = pro_record();
        drifted.limits.orders = Limit::Bounded(50);

        let summary = summarize(&[drifted.clone()], datetime!(2026-06-01 0:00 UTC));
        assert!(!summary.healthy);
        assert_eq!(summary.checks_failed, 1);
        assert_eq!(summary.violations[0].invariant, "limits_match_plan");
        assert_eq!(summary.violations[0].org_id, drifted.org_id);
        assert_eq!(summary.violations[0].severity, ViolationSeverity::Critical);
    }

    #[test]
    fn test_revoked_paid_plan_detected() {
        let mut revoked = pro_record();
        revoked.subscription_status = Some(SubscriptionStatus::Canceled);

        let summary = summarize(&[revoked], datetime!(2026-06-01 0:00 UTC));
        let names: Vec<&str> = summary.violations.iter().map(|v| v.invariant).collect();
        assert_eq!(names, vec!["revoked_is_free"]);
    }

    #[test]
    fn test_free_with_interval_detected() {
        let mut record = OrganizationEntitlement::new_free(OrgId::new());
        record.billing_interval = Some(BillingInterval::Yearly);

        let summary = summarize(&[record], datetime!(2026-06-01 0:00 UTC));
        assert_eq!(summary.violations.len(), 1);
        assert_eq!(summary.violations[0].severity, ViolationSeverity::Medium);
    }

    #[tokio::test]
    async fn test_run_all_checks_reads_store() {
        let store = InMemoryEntitlementStore::new();
        store.create_org().await;
        let mut drifted = pro_record();
        drifted.limits.products = Limit::Bounded(10);
        store.put_org(drifted).await;

        let summary = InvariantChecker::new(Arc::new(store))
            .run_all_checks()
            .await
            .unwrap();
        assert_eq!(summary.organizations_checked, 2);
        assert_eq!(summary.violations.len(), 1);
    }
}
