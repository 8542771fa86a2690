//! Common types used across the entitlement engine

use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

// =============================================================================
// ID Wrappers
// =============================================================================

/// Organization ID wrapper
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct OrgId(pub Uuid);

impl OrgId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for OrgId {
    fn default() -> Self {
        Self::new()
    }
}

impl From<Uuid> for OrgId {
    fn from(id: Uuid) -> Self {
        Self(id)
    }
}

impl std::fmt::Display for OrgId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

// =============================================================================
// Plans
// =============================================================================

/// Plan tier identifier.
///
/// Declaration order is the upgrade order: FREE < STARTER < PRO < ENTERPRISE.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, sqlx::Type,
)]
#[sqlx(type_name = "VARCHAR", rename_all = "UPPERCASE")]
#[serde(rename_all = "UPPERCASE")]
pub enum PlanId {
    Free,
    Starter,
    Pro,
    Enterprise,
}

impl Default for PlanId {
    fn default() -> Self {
        Self::Free
    }
}

impl PlanId {
    /// All plans in ascending order
    pub const ALL: [PlanId; 4] = [Self::Free, Self::Starter, Self::Pro, Self::Enterprise];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Free => "FREE",
            Self::Starter => "STARTER",
            Self::Pro => "PRO",
            Self::Enterprise => "ENTERPRISE",
        }
    }

    pub fn is_paid(&self) -> bool {
        !matches!(self, Self::Free)
    }
}

impl std::fmt::Display for PlanId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for PlanId {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_uppercase().as_str() {
            "FREE" => Ok(Self::Free),
            "STARTER" => Ok(Self::Starter),
            "PRO" => Ok(Self::Pro),
            "ENTERPRISE" => Ok(Self::Enterprise),
            _ => Err(format!("Invalid plan id: {}", s)),
        }
    }
}

/// Recurring billing interval of a paid subscription
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "VARCHAR", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum BillingInterval {
    Monthly,
    Yearly,
}

impl BillingInterval {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Monthly => "monthly",
            Self::Yearly => "yearly",
        }
    }

    /// Map a processor recurring interval unit (`month`, `year`)
    pub fn from_recurring_unit(unit: &str) -> Option<Self> {
        match unit {
            "month" => Some(Self::Monthly),
            "year" => Some(Self::Yearly),
            _ => None,
        }
    }
}

impl std::fmt::Display for BillingInterval {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for BillingInterval {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "monthly" => Ok(Self::Monthly),
            "yearly" => Ok(Self::Yearly),
            _ => Err(format!("Invalid billing interval: {}", s)),
        }
    }
}

// =============================================================================
// Limits
// =============================================================================

/// Raw storage value reserved for "no limit".
pub const UNLIMITED_SENTINEL: i64 = -1;

/// Returns true iff `raw` is the unlimited sentinel.
pub fn is_unlimited(raw: i64) -> bool {
    raw == UNLIMITED_SENTINEL
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LimitError {
    #[error("Invalid limit value {0}: must be -1 (unlimited) or non-negative")]
    OutOfRange(i64),
    #[error("Invalid limit value: {0}")]
    Unparseable(String),
}

/// A resource ceiling. The `-1` sentinel only exists at the storage boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(into = "LimitRepr", try_from = "LimitRepr")]
pub enum Limit {
    Unlimited,
    Bounded(u64),
}

impl Limit {
    pub fn from_raw(raw: i64) -> Result<Self, LimitError> {
        match raw {
            UNLIMITED_SENTINEL => Ok(Self::Unlimited),
            n if n >= 0 => Ok(Self::Bounded(n as u64)),
            n => Err(LimitError::OutOfRange(n)),
        }
    }

    pub fn to_raw(self) -> i64 {
        match self {
            Self::Unlimited => UNLIMITED_SENTINEL,
            Self::Bounded(n) => i64::try_from(n).unwrap_or(i64::MAX),
        }
    }

    pub fn is_unlimited(&self) -> bool {
        matches!(self, Self::Unlimited)
    }

    /// Whether `amount` fits within this limit (inclusive)
    pub fn accommodates(&self, amount: u64) -> bool {
        match self {
            Self::Unlimited => true,
            Self::Bounded(max) => amount <= *max,
        }
    }
}

#[derive(Serialize, Deserialize)]
#[serde(untagged)]
enum LimitRepr {
    Number(i64),
    Text(String),
}

impl From<Limit> for LimitRepr {
    fn from(limit: Limit) -> Self {
        match limit {
            Limit::Unlimited => LimitRepr::Text("unlimited".to_string()),
            Limit::Bounded(n) => LimitRepr::Number(i64::try_from(n).unwrap_or(i64::MAX)),
        }
    }
}

impl TryFrom<LimitRepr> for Limit {
    type Error = LimitError;

    fn try_from(repr: LimitRepr) -> Result<Self, Self::Error> {
        match repr {
            LimitRepr::Number(n) => Limit::from_raw(n),
            LimitRepr::Text(s) if s.eq_ignore_ascii_case("unlimited") => Ok(Limit::Unlimited),
            LimitRepr::Text(s) => Err(LimitError::Unparseable(s)),
        }
    }
}

impl std::fmt::Display for Limit {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Unlimited => write!(f, "unlimited"),
            Self::Bounded(n) => write!(f, "{}", n),
        }
    }
}

/// Metered resource kinds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceType {
    Products,
    Orders,
    TeamMembers,
    StorageMb,
}

impl ResourceType {
    pub const ALL: [ResourceType; 4] = [
        Self::Products,
        Self::Orders,
        Self::TeamMembers,
        Self::StorageMb,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Products => "products",
            Self::Orders => "orders",
            Self::TeamMembers => "team_members",
            Self::StorageMb => "storage_mb",
        }
    }
}

impl std::fmt::Display for ResourceType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for ResourceType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "products" => Ok(Self::Products),
            "orders" => Ok(Self::Orders),
            "team_members" | "teamMembers" => Ok(Self::TeamMembers),
            "storage_mb" | "storageMB" => Ok(Self::StorageMb),
            _ => Err(format!("Invalid resource type: {}", s)),
        }
    }
}

/// Per-resource ceilings for a plan or a cached organization record
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceLimits {
    pub products: Limit,
    pub orders: Limit,
    pub team_members: Limit,
    pub storage_mb: Limit,
}

impl ResourceLimits {
    pub fn get(&self, resource: ResourceType) -> Limit {
        match resource {
            ResourceType::Products => self.products,
            ResourceType::Orders => self.orders,
            ResourceType::TeamMembers => self.team_members,
            ResourceType::StorageMb => self.storage_mb,
        }
    }

    /// Build from the four raw storage columns
    pub fn from_raw(
        products: i64,
        orders: i64,
        team_members: i64,
        storage_mb: i64,
    ) -> Result<Self, LimitError> {
        Ok(Self {
            products: Limit::from_raw(products)?,
            orders: Limit::from_raw(orders)?,
            team_members: Limit::from_raw(team_members)?,
            storage_mb: Limit::from_raw(storage_mb)?,
        })
    }
}

// =============================================================================
// Subscription status
// =============================================================================

/// Subscription status, mirrored 1:1 from the payment processor
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "VARCHAR", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum SubscriptionStatus {
    Active,
    Trialing,
    PastDue,
    Canceled,
    Unpaid,
    Incomplete,
    IncompleteExpired,
    Paused,
}

impl SubscriptionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Trialing => "trialing",
            Self::PastDue => "past_due",
            Self::Canceled => "canceled",
            Self::Unpaid => "unpaid",
            Self::Incomplete => "incomplete",
            Self::IncompleteExpired => "incomplete_expired",
            Self::Paused => "paused",
        }
    }

    /// Revoked states: paid limits must not survive these.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Canceled | Self::Unpaid | Self::IncompleteExpired
        )
    }
}

impl std::fmt::Display for SubscriptionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for SubscriptionStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "active" => Ok(Self::Active),
            "trialing" => Ok(Self::Trialing),
            "past_due" => Ok(Self::PastDue),
            "canceled" => Ok(Self::Canceled),
            "unpaid" => Ok(Self::Unpaid),
            "incomplete" => Ok(Self::Incomplete),
            "incomplete_expired" => Ok(Self::IncompleteExpired),
            "paused" => Ok(Self::Paused),
            _ => Err(format!("Invalid subscription status: {}", s)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_plan_order() {
        assert!(PlanId::Free < PlanId::Starter);
        assert!(PlanId::Starter < PlanId::Pro);
        assert!(PlanId::Pro < PlanId::Enterprise);
        let mut sorted = PlanId::ALL;
        sorted.sort();
        assert_eq!(sorted, PlanId::ALL);
    }

    #[test]
    fn test_plan_id_parse() {
        assert_eq!("starter".parse::<PlanId>(), Ok(PlanId::Starter));
        assert_eq!("PRO".parse::<PlanId>(), Ok(PlanId::Pro));
        assert!("team".parse::<PlanId>().is_err());
    }

    #[test]
    fn test_unlimited_sentinel() {
        assert!(is_unlimited(-1));
        assert!(!is_unlimited(0));
        assert!(!is_unlimited(10));
        assert!(!is_unlimited(-2));
        assert_eq!(Limit::from_raw(-1), Ok(Limit::Unlimited));
        assert_eq!(Limit::from_raw(10), Ok(Limit::Bounded(10)));
        assert_eq!(Limit::from_raw(-5), Err(LimitError::OutOfRange(-5)));
        assert_eq!(Limit::Unlimited.to_raw(), -1);
        assert_eq!(Limit::Bounded(3).to_raw(), 3);
    }

    #[test]
    fn test_limit_json() {
        assert_eq!(serde_json::to_value(Limit::Unlimited).unwrap(), "unlimited");
        assert_eq!(serde_json::to_value(Limit::Bounded(25)).unwrap(), 25);
        let parsed: Limit = serde_json::from_value(serde_json::json!(-1)).unwrap();
        assert_eq!(parsed, Limit::Unlimited);
        assert!(serde_json::from_value::<Limit>(serde_json::json!("lots")).is_err());
    }

    #[test]
    fn test_limit_accommodates() {
        assert!(Limit::Unlimited.accommodates(u64::MAX));
        assert!(Limit::Bounded(10).accommodates(10));
        assert!(!Limit::Bounded(10).accommodates(11));
    }

    #[test]
    fn test_terminal_statuses() {
        assert!(SubscriptionStatus::Canceled.is_terminal());
        assert!(SubscriptionStatus::Unpaid.is_terminal());
        assert!(SubscriptionStatus::IncompleteExpired.is_terminal());
        assert!(!SubscriptionStatus::PastDue.is_terminal());
        assert!(!SubscriptionStatus::Incomplete.is_terminal());
        assert!(!SubscriptionStatus::Paused.is_terminal());
    }

    #[test]
    fn test_status_round_trips_processor_vocabulary() {
        for raw in [
            "active",
            "trialing",
            "past_due",
            "canceled",
            "unpaid",
            "incomplete",
            "incomplete_expired",
            "paused",
        ] {
            let status: SubscriptionStatus = raw.parse().unwrap();
            assert_eq!(status.as_str(), raw);
        }
        assert!("cancelled".parse::<SubscriptionStatus>().is_err());
    }

    #[test]
    fn test_interval_from_recurring_unit() {
        assert_eq!(
            BillingInterval::from_recurring_unit("month"),
            Some(BillingInterval::Monthly)
        );
        assert_eq!(
            BillingInterval::from_recurring_unit("year"),
            Some(BillingInterval::Yearly)
        );
        assert_eq!(BillingInterval::from_recurring_unit("week"), None);
    }
}
