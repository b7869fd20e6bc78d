//! Migration plan generation
//!
//! Turns a stored [`ImpactAnalysis`] into a draft [`MigrationPlan`]: the fixed
//! step skeleton, one task per subscriber that has to move or be offered a
//! move, the notification list and a rollback snapshot.

use planguard_shared::{ActorId, MigrationId, Plan, PlanId, PlanState};
use time::OffsetDateTime;

use crate::classifier::RiskLevel;
use crate::error::{EngineError, EngineResult};
use crate::impact::{AffectedSubscription, ImpactAnalysis};
use crate::migration::{
    MigrationPlan, MigrationStatus, MigrationStep, NotificationTarget, RollbackDescriptor,
    StepKind, SubscriptionBinding, SubscriptionTask,
};

/// How tightly a plan wraps a subscriber's usage.
///
/// Ordered by unlimited dimensions the subscriber uses, then total headroom
/// over the limited ones.
fn slack(plan: &Plan, affected: &AffectedSubscription) -> (usize, i64) {
    let unlimited = affected
        .usage
        .keys()
        .filter(|name| plan.limit(name).is_none())
        .count();
    let headroom = plan.limits.iter().fold(0i64, |acc, (name, ceiling)| {
        let used = affected.usage.get(name).copied().unwrap_or(0);
        acc.saturating_add(ceiling.saturating_sub(used))
    });
    (unlimited, headroom)
}

/// Smallest active alternative that can host the subscriber
pub fn nearest_fit<'a>(
    affected: &AffectedSubscription,
    excluded: PlanId,
    alternatives: &'a [Plan],
) -> Option<&'a Plan> {
    alternatives
        .iter()
        .filter(|p| p.id != excluded && p.state == PlanState::Active)
        .filter(|p| p.accommodates(&affected.usage, &affected.required_features))
        .min_by(|a, b| {
            slack(a, affected)
                .cmp(&slack(b, affected))
                .then_with(|| {
                    a.price
                        .monthly_equivalent()
                        .cmp(&b.price.monthly_equivalent())
                })
                .then_with(|| a.id.cmp(&b.id))
        })
}

/// Builds draft migration plans from impact analyses
#[derive(Debug, Clone, Copy, Default)]
pub struct MigrationPlanner;

impl MigrationPlanner {
    pub fn new() -> Self {
        Self
    }

    pub fn plan(
        &self,
        impact: &ImpactAnalysis,
        grace_period: time::Duration,
        override_critical: bool,
        alternatives: &[Plan],
        actor: ActorId,
    ) -> EngineResult<MigrationPlan> {
        if impact.risk.level == RiskLevel::Critical && !override_critical {
            return Err(EngineError::RiskOverrideRequired {
                level: impact.risk.level,
                affected_count: impact.metrics.affected_count,
            });
        }
        if grace_period.is_negative() {
            return Err(EngineError::InvalidMutation(
                "grace period cannot be negative".to_string(),
            ));
        }

        let alternatives: Vec<Plan> = alternatives
            .iter()
            .filter(|p| p.price.currency == impact.current_plan.price.currency)
            .cloned()
            .collect();

        let tasks: Vec<SubscriptionTask> = impact
            .affected
            .iter()
            .filter(|a| a.recommended_action.needs_task())
            .map(|a| SubscriptionTask {
                subscription_id: a.subscription_id,
                action: a.recommended_action,
                target_plan_id: nearest_fit(a, impact.plan_id, &alternatives).map(|p| p.id),
            })
            .collect();

        let notifications = impact
            .affected
            .iter()
            .map(|a| NotificationTarget {
                subscription_id: a.subscription_id,
                action: a.recommended_action,
            })
            .collect();

        let now = OffsetDateTime::now_utc();
        let rollback = RollbackDescriptor {
            plan_snapshot: impact.current_plan.clone(),
            bindings: impact
                .affected
                .iter()
                .map(|a| SubscriptionBinding {
                    subscription_id: a.subscription_id,
                    plan_id: impact.plan_id,
                })
                .collect(),
            captured_at: now,
        };

        let unplaced = tasks
            .iter()
            .filter(|t| t.target_plan_id.is_none())
            .count();
        if unplaced > 0 {
            tracing::warn!(
                impact_id = %impact.id,
                unplaced,
                "No alternative plan fits some affected subscriptions"
            );
        }

        Ok(MigrationPlan {
            id: MigrationId::new(),
            impact_id: impact.id,
            plan_id: impact.plan_id,
            change_type: impact.change_type,
            proposed_plan: impact.proposed_plan.clone(),
            steps: StepKind::ORDER
                .iter()
                .copied()
                .map(MigrationStep::pending)
                .collect(),
            tasks,
            notifications,
            grace_period,
            grace_period_ends_at: None,
            status: MigrationStatus::Draft,
            rollback,
            risk_overridden: override_critical && impact.risk.level == RiskLevel::Critical,
            created_by: actor,
            created_at: now,
            updated_at: now,
            version: 0,
        })
    }
}
