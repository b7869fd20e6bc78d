//! Migration plan model and status state machine
//!
//! ```text
//! draft --execute--> in_progress --all steps done--> completed
//!                        |                               |
//!                        +-----------rollback------------+--> rolled_back (terminal)
//! ```
//!
//! Only a draft may be discarded without leaving a trace in the ledger.

use planguard_shared::{ActorId, AnalysisId, MigrationId, Plan, PlanId, SubscriptionId};
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use crate::error::{EngineError, EngineResult};
use crate::impact::{ChangeType, RecommendedAction};

/// Lifecycle of a migration plan
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MigrationStatus {
    Draft,
    InProgress,
    Completed,
    RolledBack,
}

impl std::fmt::Display for MigrationStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MigrationStatus::Draft => write!(f, "draft"),
            MigrationStatus::InProgress => write!(f, "in_progress"),
            MigrationStatus::Completed => write!(f, "completed"),
            MigrationStatus::RolledBack => write!(f, "rolled_back"),
        }
    }
}

/// The fixed steps every migration walks through, in order
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepKind {
    Notify,
    GracePeriodStart,
    ApplyChange,
    Verify,
}

impl StepKind {
    pub const ORDER: [StepKind; 4] = [
        StepKind::Notify,
        StepKind::GracePeriodStart,
        StepKind::ApplyChange,
        StepKind::Verify,
    ];
}

impl std::fmt::Display for StepKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StepKind::Notify => write!(f, "notify"),
            StepKind::GracePeriodStart => write!(f, "grace_period_start"),
            StepKind::ApplyChange => write!(f, "apply_change"),
            StepKind::Verify => write!(f, "verify"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Pending,
    Completed,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MigrationStep {
    pub kind: StepKind,
    pub status: StepStatus,
    pub attempts: u32,
    pub warnings: Vec<String>,
    pub last_error: Option<String>,
    pub completed_at: Option<OffsetDateTime>,
}

impl MigrationStep {
    pub fn pending(kind: StepKind) -> Self {
        Self {
            kind,
            status: StepStatus::Pending,
            attempts: 0,
            warnings: Vec::new(),
            last_error: None,
            completed_at: None,
        }
    }

    pub fn is_done(&self) -> bool {
        self.status == StepStatus::Completed
    }
}

/// Per-subscription work attached to a migration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubscriptionTask {
    pub subscription_id: SubscriptionId,
    pub action: RecommendedAction,
    /// Nearest-fit alternative; `None` when no plan can host the subscriber
    pub target_plan_id: Option<PlanId>,
}

impl SubscriptionTask {
    /// Tasks that move the subscription to another plan when the change applies
    pub fn rebinds(&self) -> Option<PlanId> {
        match self.action {
            RecommendedAction::Migrate => self.target_plan_id,
            _ => None,
        }
    }
}

/// Who gets told about the change, and with which template
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NotificationTarget {
    pub subscription_id: SubscriptionId,
    pub action: RecommendedAction,
}

/// Subscription's plan binding before the change
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubscriptionBinding {
    pub subscription_id: SubscriptionId,
    pub plan_id: PlanId,
}

/// Snapshot that is enough to reverse a migration without reading history
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RollbackDescriptor {
    pub plan_snapshot: Plan,
    pub bindings: Vec<SubscriptionBinding>,
    pub captured_at: OffsetDateTime,
}

/// Ordered, resumable procedure moving affected subscribers to the new plan state
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MigrationPlan {
    pub id: MigrationId,
    pub impact_id: AnalysisId,
    pub plan_id: PlanId,
    pub change_type: ChangeType,
    pub proposed_plan: Plan,
    pub steps: Vec<MigrationStep>,
    pub tasks: Vec<SubscriptionTask>,
    pub notifications: Vec<NotificationTarget>,
    pub grace_period: time::Duration,
    pub grace_period_ends_at: Option<OffsetDateTime>,
    pub status: MigrationStatus,
    pub rollback: RollbackDescriptor,
    pub risk_overridden: bool,
    pub created_by: ActorId,
    pub created_at: OffsetDateTime,
    pub updated_at: OffsetDateTime,
    /// Bumped on every persisted change; used for compare-and-swap writes
    pub version: u64,
}

impl MigrationPlan {
    /// First step that still has work to do
    pub fn next_step(&self) -> Option<&MigrationStep> {
        self.steps.iter().find(|s| !s.is_done())
    }

    pub fn step_mut(&mut self, kind: StepKind) -> Option<&mut MigrationStep> {
        self.steps.iter_mut().find(|s| s.kind == kind)
    }

    pub fn step_done(&self, kind: StepKind) -> bool {
        self.steps.iter().any(|s| s.kind == kind && s.is_done())
    }

    pub fn all_steps_done(&self) -> bool {
        self.steps.iter().all(MigrationStep::is_done)
    }

    /// draft -> in_progress. Already in progress is accepted so execution can resume.
    pub fn start(&mut self) -> EngineResult<()> {
        match self.status {
            MigrationStatus::Draft => {
                self.status = MigrationStatus::InProgress;
                Ok(())
            }
            MigrationStatus::InProgress => Ok(()),
            from => Err(EngineError::InvalidTransition {
                from,
                action: "execute",
            }),
        }
    }

    /// in_progress -> completed, once every step is done
    pub fn complete(&mut self) -> EngineResult<()> {
        if self.status != MigrationStatus::InProgress || !self.all_steps_done() {
            return Err(EngineError::InvalidTransition {
                from: self.status,
                action: "complete",
            });
        }
        self.status = MigrationStatus::Completed;
        Ok(())
    }

    /// in_progress | completed -> rolled_back
    pub fn mark_rolled_back(&mut self) -> EngineResult<()> {
        match self.status {
            MigrationStatus::InProgress | MigrationStatus::Completed => {
                self.status = MigrationStatus::RolledBack;
                Ok(())
            }
            status => Err(EngineError::RollbackUnavailable { status }),
        }
    }

    pub fn ensure_discardable(&self) -> EngineResult<()> {
        if self.status != MigrationStatus::Draft {
            return Err(EngineError::InvalidTransition {
                from: self.status,
                action: "discard",
            });
        }
        Ok(())
    }

    /// Record a persisted change
    pub fn touch(&mut self) {
        self.version += 1;
        self.updated_at = OffsetDateTime::now_utc();
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use planguard_shared::{PlanState, Price};
    use rust_decimal::Decimal;

    fn draft() -> MigrationPlan {
        let plan = Plan {
            id: PlanId::new(),
            name: "Basic".to_string(),
            price: Price::monthly(Decimal::from(10), "USD").unwrap(),
            features: Default::default(),
            limits: Default::default(),
            state: PlanState::Active,
        };
        let now = OffsetDateTime::now_utc();
        MigrationPlan {
            id: MigrationId::new(),
            impact_id: AnalysisId::new(),
            plan_id: plan.id,
            change_type: ChangeType::Limits,
            proposed_plan: plan.clone(),
            steps: StepKind::ORDER.iter().copied().map(MigrationStep::pending).collect(),
            tasks: vec![],
            notifications: vec![],
            grace_period: time::Duration::ZERO,
            grace_period_ends_at: None,
            status: MigrationStatus::Draft,
            rollback: RollbackDescriptor {
                plan_snapshot: plan,
                bindings: vec![],
                captured_at: now,
            },
            risk_overridden: false,
            created_by: ActorId::new(),
            created_at: now,
            updated_at: now,
            version: 0,
        }
    }

    #[test]
    fn test_happy_path_transitions() {
        let mut plan = draft();
        assert!(plan.ensure_discardable().is_ok());
        plan.start().unwrap();
        assert_eq!(plan.status, MigrationStatus::InProgress);
        // Cannot complete with pending steps
        assert!(plan.complete().is_err());

        for step in plan.steps.iter_mut() {
            step.status = StepStatus::Completed;
        }
        plan.complete().unwrap();
        assert_eq!(plan.status, MigrationStatus::Completed);
        assert!(plan.ensure_discardable().is_err());

        plan.mark_rolled_back().unwrap();
        assert_eq!(plan.status, MigrationStatus::RolledBack);
    }

    #[test]
    fn test_rolled_back_is_terminal() {
        let mut plan = draft();
        plan.start().unwrap();
        plan.mark_rolled_back().unwrap();

        assert!(matches!(
            plan.start(),
            Err(EngineError::InvalidTransition {
                from: MigrationStatus::RolledBack,
                ..
            })
        ));
        assert!(matches!(
            plan.mark_rolled_back(),
            Err(EngineError::RollbackUnavailable {
                status: MigrationStatus::RolledBack
            })
        ));
    }

    #[test]
    fn test_draft_cannot_roll_back() {
        let mut plan = draft();
        assert!(matches!(
            plan.mark_rolled_back(),
            Err(EngineError::RollbackUnavailable {
                status: MigrationStatus::Draft
            })
        ));
    }

    #[test]
    fn test_next_step_order() {
        let mut plan = draft();
        assert_eq!(plan.next_step().map(|s| s.kind), Some(StepKind::Notify));
        plan.step_mut(StepKind::Notify).unwrap().status = StepStatus::Completed;
        assert_eq!(
            plan.next_step().map(|s| s.kind),
            Some(StepKind::GracePeriodStart)
        );
    }
}
