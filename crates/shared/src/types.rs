//! Common types used across PlanGuard

use std::collections::{BTreeMap, BTreeSet};

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use uuid::Uuid;

use crate::error::{DomainError, DomainResult};

// =============================================================================
// ID Wrappers
// =============================================================================

macro_rules! id_wrapper {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub Uuid);

        impl $name {
            pub fn new() -> Self {
                Self(Uuid::new_v4())
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl From<Uuid> for $name {
            fn from(id: Uuid) -> Self {
                Self(id)
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                write!(f, "{}", self.0)
            }
        }
    };
}

id_wrapper!(
    /// Plan ID wrapper
    PlanId
);
id_wrapper!(
    /// Subscription ID wrapper
    SubscriptionId
);
id_wrapper!(
    /// Workspace (tenant) ID wrapper
    WorkspaceId
);
id_wrapper!(
    /// Actor ID supplied by the auth layer for every mutating call
    ActorId
);
id_wrapper!(
    /// Impact analysis ID wrapper
    AnalysisId
);
id_wrapper!(
    /// Migration plan ID wrapper
    MigrationId
);
id_wrapper!(
    /// Ledger record ID wrapper
    ChangeRecordId
);

// =============================================================================
// Limits and features
// =============================================================================

/// Limit name -> numeric ceiling (plans) or measured value (subscription usage).
/// A key missing from a plan's limits means the plan is unlimited for it.
pub type LimitMap = BTreeMap<String, i64>;

/// Ordered set of capability tags
pub type FeatureSet = BTreeSet<String>;

/// Reject negative ceilings or usage values
pub fn validate_limits(limits: &LimitMap) -> DomainResult<()> {
    match limits.iter().find(|(_, value)| **value < 0) {
        Some((name, value)) => Err(DomainError::NegativeLimit {
            name: name.clone(),
            value: *value,
        }),
        None => Ok(()),
    }
}

// =============================================================================
// Enums
// =============================================================================

/// Billing interval for plan prices
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BillingInterval {
    Daily,
    Weekly,
    Monthly,
    Quarterly,
    Annually,
}

impl Default for BillingInterval {
    fn default() -> Self {
        Self::Monthly
    }
}

impl BillingInterval {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Daily => "daily",
            Self::Weekly => "weekly",
            Self::Monthly => "monthly",
            Self::Quarterly => "quarterly",
            Self::Annually => "annually",
        }
    }

    /// Convert one interval's amount into a monthly-equivalent amount
    pub fn to_monthly(&self, amount: Decimal) -> Decimal {
        let twelve = Decimal::from(12);
        let monthly = match self {
            Self::Daily => amount * Decimal::from(365) / twelve,
            Self::Weekly => amount * Decimal::from(52) / twelve,
            Self::Monthly => amount,
            Self::Quarterly => amount / Decimal::from(3),
            Self::Annually => amount / twelve,
        };
        monthly.round_dp(4)
    }
}

impl std::fmt::Display for BillingInterval {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for BillingInterval {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "daily" => Ok(Self::Daily),
            "weekly" => Ok(Self::Weekly),
            "monthly" => Ok(Self::Monthly),
            "quarterly" => Ok(Self::Quarterly),
            "annually" | "annual" | "yearly" => Ok(Self::Annually),
            _ => Err(DomainError::UnknownInterval(s.to_string())),
        }
    }
}

/// Plan lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlanState {
    Draft,
    Active,
    Deprecated,
    Disabled,
}

impl Default for PlanState {
    fn default() -> Self {
        Self::Draft
    }
}

impl PlanState {
    /// Only live plans have a population worth analyzing
    pub fn is_analyzable(&self) -> bool {
        matches!(self, Self::Active | Self::Deprecated)
    }
}

impl std::fmt::Display for PlanState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Draft => write!(f, "draft"),
            Self::Active => write!(f, "active"),
            Self::Deprecated => write!(f, "deprecated"),
            Self::Disabled => write!(f, "disabled"),
        }
    }
}

impl std::str::FromStr for PlanState {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "draft" => Ok(Self::Draft),
            "active" => Ok(Self::Active),
            "deprecated" => Ok(Self::Deprecated),
            "disabled" => Ok(Self::Disabled),
            _ => Err(DomainError::UnknownPlanState(s.to_string())),
        }
    }
}

/// Subscription billing state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BillingState {
    Active,
    PastDue,
    Paused,
    Canceled,
}

impl Default for BillingState {
    fn default() -> Self {
        Self::Active
    }
}

impl std::fmt::Display for BillingState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Active => write!(f, "active"),
            Self::PastDue => write!(f, "past_due"),
            Self::Paused => write!(f, "paused"),
            Self::Canceled => write!(f, "canceled"),
        }
    }
}

impl std::str::FromStr for BillingState {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "active" => Ok(Self::Active),
            "past_due" => Ok(Self::PastDue),
            "paused" => Ok(Self::Paused),
            "canceled" | "cancelled" => Ok(Self::Canceled),
            _ => Err(DomainError::UnknownBillingState(s.to_string())),
        }
    }
}

// =============================================================================
// Plans
// =============================================================================

/// Price of a plan for one billing interval
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Price {
    pub amount: Decimal,
    pub currency: String,
    pub interval: BillingInterval,
}

impl Price {
    /// Build a validated price. Currency is normalized to upper case.
    pub fn new(amount: Decimal, currency: &str, interval: BillingInterval) -> DomainResult<Self> {
        let price = Self {
            amount,
            currency: currency.trim().to_uppercase(),
            interval,
        };
        price.validate()?;
        Ok(price)
    }

    /// Monthly price helper
    pub fn monthly(amount: Decimal, currency: &str) -> DomainResult<Self> {
        Self::new(amount, currency, BillingInterval::Monthly)
    }

    pub fn validate(&self) -> DomainResult<()> {
        if self.currency.len() != 3 || !self.currency.chars().all(|c| c.is_ascii_uppercase()) {
            return Err(DomainError::InvalidCurrency(self.currency.clone()));
        }
        if self.amount.is_sign_negative() && !self.amount.is_zero() {
            return Err(DomainError::NegativeAmount(self.amount));
        }
        Ok(())
    }

    /// Amount normalized to one month
    pub fn monthly_equivalent(&self) -> Decimal {
        self.interval.to_monthly(self.amount)
    }
}

/// A priced bundle of features and limits that subscriptions are bound to
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Plan {
    pub id: PlanId,
    pub name: String,
    pub price: Price,
    pub features: FeatureSet,
    pub limits: LimitMap,
    pub state: PlanState,
}

impl Plan {
    /// Ceiling for a limit, `None` when the plan is unlimited for it
    pub fn limit(&self, name: &str) -> Option<i64> {
        self.limits.get(name).copied()
    }

    pub fn has_feature(&self, feature: &str) -> bool {
        self.features.contains(feature)
    }

    /// Whether this plan can host the given usage and feature requirements
    pub fn accommodates(&self, usage: &LimitMap, required_features: &FeatureSet) -> bool {
        let limits_ok = usage
            .iter()
            .all(|(name, used)| self.limit(name).map_or(true, |ceiling| *used <= ceiling));
        limits_ok && required_features.is_subset(&self.features)
    }

    pub fn with_price(&self, price: Price) -> Self {
        Self {
            price,
            ..self.clone()
        }
    }

    pub fn with_limits(&self, limits: LimitMap) -> Self {
        Self {
            limits,
            ..self.clone()
        }
    }

    pub fn with_features(&self, features: FeatureSet) -> Self {
        Self {
            features,
            ..self.clone()
        }
    }

    pub fn with_state(&self, state: PlanState) -> Self {
        Self {
            state,
            ..self.clone()
        }
    }
}

// =============================================================================
// Subscriptions
// =============================================================================

/// A workspace's binding to a plan plus its measured usage
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Subscription {
    pub id: SubscriptionId,
    pub workspace_id: WorkspaceId,
    pub plan_id: PlanId,
    pub usage: LimitMap,
    /// Features this subscription actually exercised; `None` when the
    /// subscription store has no per-feature telemetry
    pub feature_usage: Option<FeatureSet>,
    pub billing_state: BillingState,
    pub created_at: OffsetDateTime,
    pub last_billed_at: Option<OffsetDateTime>,
}

impl Subscription {
    /// Measured usage for a limit, zero when not reported
    pub fn usage_of(&self, name: &str) -> i64 {
        self.usage.get(name).copied().unwrap_or(0)
    }

    pub fn is_canceled(&self) -> bool {
        self.billing_state == BillingState::Canceled
    }

    pub fn tenure(&self, now: OffsetDateTime) -> time::Duration {
        now - self.created_at
    }
}
