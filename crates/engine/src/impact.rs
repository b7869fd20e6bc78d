//! Impact analysis records
//!
//! An [`ImpactAnalysis`] is the immutable result of evaluating one proposed plan
//! mutation against every subscription bound to the plan. Changing any input
//! means producing a new analysis.

use std::collections::BTreeMap;

use planguard_shared::{
    ActorId, AnalysisId, FeatureSet, LimitMap, Plan, PlanId, PlanState, Price, SubscriptionId,
    WorkspaceId,
};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use crate::classifier::RiskAssessment;

/// Kind of plan mutation under analysis
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeType {
    Pricing,
    Limits,
    Features,
    Disable,
}

impl std::fmt::Display for ChangeType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ChangeType::Pricing => write!(f, "pricing"),
            ChangeType::Limits => write!(f, "limits"),
            ChangeType::Features => write!(f, "features"),
            ChangeType::Disable => write!(f, "disable"),
        }
    }
}

/// What should happen to one affected subscriber
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecommendedAction {
    NoAction,
    Upgrade,
    Downgrade,
    Grandfather,
    Migrate,
}

impl RecommendedAction {
    /// Actions that get a per-subscription task in a migration plan
    pub fn needs_task(&self) -> bool {
        matches!(self, RecommendedAction::Migrate | RecommendedAction::Upgrade)
    }
}

impl std::fmt::Display for RecommendedAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RecommendedAction::NoAction => write!(f, "no_action"),
            RecommendedAction::Upgrade => write!(f, "upgrade"),
            RecommendedAction::Downgrade => write!(f, "downgrade"),
            RecommendedAction::Grandfather => write!(f, "grandfather"),
            RecommendedAction::Migrate => write!(f, "migrate"),
        }
    }
}

/// Effect of the mutation on a single subscription
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AffectedSubscription {
    pub subscription_id: SubscriptionId,
    pub workspace_id: WorkspaceId,
    /// Limit name -> amount over the new ceiling
    pub limit_exceedance: BTreeMap<String, i64>,
    /// Signed monthly-equivalent revenue change
    pub revenue_delta: Decimal,
    pub lost_features: Vec<String>,
    pub recommended_action: RecommendedAction,
    /// Usage at analysis time, used for nearest-fit plan search
    pub usage: LimitMap,
    /// Features the subscriber relies on (telemetry, or the full current set)
    pub required_features: FeatureSet,
}

impl AffectedSubscription {
    pub fn exceeds_limits(&self) -> bool {
        !self.limit_exceedance.is_empty()
    }
}

/// Field-level difference between the current and proposed plan
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlanDiff {
    pub price_before: Price,
    pub price_after: Price,
    /// Limit name -> (current ceiling, proposed ceiling); `None` is unlimited
    pub limit_changes: BTreeMap<String, (Option<i64>, Option<i64>)>,
    pub removed_features: FeatureSet,
    pub added_features: FeatureSet,
    pub state_before: PlanState,
    pub state_after: PlanState,
}

impl PlanDiff {
    pub fn between(current: &Plan, proposed: &Plan) -> Self {
        let mut limit_changes = BTreeMap::new();
        for name in current.limits.keys().chain(proposed.limits.keys()) {
            let before = current.limit(name);
            let after = proposed.limit(name);
            if before != after {
                limit_changes.insert(name.clone(), (before, after));
            }
        }

        Self {
            price_before: current.price.clone(),
            price_after: proposed.price.clone(),
            limit_changes,
            removed_features: current
                .features
                .difference(&proposed.features)
                .cloned()
                .collect(),
            added_features: proposed
                .features
                .difference(&current.features)
                .cloned()
                .collect(),
            state_before: current.state,
            state_after: proposed.state,
        }
    }

    /// Limits whose proposed ceiling is lower than today, or newly introduced
    pub fn tightened_limits(&self) -> impl Iterator<Item = (&String, i64)> {
        self.limit_changes
            .iter()
            .filter_map(|(name, (before, after))| match (before, after) {
                (_, None) => None,
                (None, Some(new)) => Some((name, *new)),
                (Some(old), Some(new)) if new < old => Some((name, *new)),
                _ => None,
            })
    }

    pub fn is_empty(&self) -> bool {
        self.price_before == self.price_after
            && self.limit_changes.is_empty()
            && self.removed_features.is_empty()
            && self.added_features.is_empty()
            && self.state_before == self.state_after
    }
}

/// Exact aggregates over the affected population
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImpactMetrics {
    pub affected_count: u64,
    /// Signed sum of per-subscription monthly deltas
    pub total_revenue_delta: Decimal,
    /// Magnitude used for risk classification
    pub revenue_impact: Decimal,
    pub exceeding_limits_count: u64,
    pub losing_features_count: u64,
    pub action_counts: BTreeMap<RecommendedAction, u64>,
}

impl ImpactMetrics {
    pub fn record(&mut self, affected: &AffectedSubscription) {
        self.affected_count += 1;
        self.total_revenue_delta += affected.revenue_delta;
        self.revenue_impact = self.total_revenue_delta.abs();
        if affected.exceeds_limits() {
            self.exceeding_limits_count += 1;
        }
        if !affected.lost_features.is_empty() {
            self.losing_features_count += 1;
        }
        *self
            .action_counts
            .entry(affected.recommended_action)
            .or_insert(0) += 1;
    }

    /// Associative combine of two partial aggregates
    pub fn merge(mut self, other: ImpactMetrics) -> Self {
        self.affected_count += other.affected_count;
        self.total_revenue_delta += other.total_revenue_delta;
        self.revenue_impact = self.total_revenue_delta.abs();
        self.exceeding_limits_count += other.exceeding_limits_count;
        self.losing_features_count += other.losing_features_count;
        for (action, count) in other.action_counts {
            *self.action_counts.entry(action).or_insert(0) += count;
        }
        self
    }

    pub fn count_for(&self, action: RecommendedAction) -> u64 {
        self.action_counts.get(&action).copied().unwrap_or(0)
    }
}

/// Result of scanning the population, before risk classification
#[derive(Debug, Clone)]
pub struct ImpactScan {
    pub change_type: ChangeType,
    pub current_plan: Plan,
    pub proposed_plan: Plan,
    pub diff: PlanDiff,
    pub affected: Vec<AffectedSubscription>,
    pub metrics: ImpactMetrics,
}

impl ImpactScan {
    pub fn find_affected(&self, subscription_id: SubscriptionId) -> Option<&AffectedSubscription> {
        self.affected
            .iter()
            .find(|a| a.subscription_id == subscription_id)
    }
}

/// Immutable record of one impact analysis
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImpactAnalysis {
    pub id: AnalysisId,
    pub change_type: ChangeType,
    pub plan_id: PlanId,
    /// Plan definition at analysis time
    pub current_plan: Plan,
    pub proposed_plan: Plan,
    pub diff: PlanDiff,
    /// Sorted by descending |revenue delta|, then subscription id
    pub affected: Vec<AffectedSubscription>,
    pub metrics: ImpactMetrics,
    pub risk: RiskAssessment,
    pub created_at: OffsetDateTime,
    pub created_by: ActorId,
}

impl ImpactAnalysis {
    pub fn from_scan(scan: ImpactScan, risk: RiskAssessment, actor: ActorId) -> Self {
        Self {
            id: AnalysisId::new(),
            change_type: scan.change_type,
            plan_id: scan.current_plan.id,
            current_plan: scan.current_plan,
            proposed_plan: scan.proposed_plan,
            diff: scan.diff,
            affected: scan.affected,
            metrics: scan.metrics,
            risk,
            created_at: OffsetDateTime::now_utc(),
            created_by: actor,
        }
    }

    pub fn find(&self, subscription_id: SubscriptionId) -> Option<&AffectedSubscription> {
        self.affected
            .iter()
            .find(|a| a.subscription_id == subscription_id)
    }
}
