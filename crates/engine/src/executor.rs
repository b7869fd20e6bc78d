//! Migration step execution and rollback
//!
//! The executor performs the side effects of each step against the
//! collaborators. It does not persist the migration; the orchestrator writes
//! the updated plan and the ledger entry after every step, and undoes the
//! plan-store side effects when that write fails.

use std::sync::Arc;

use time::OffsetDateTime;

use crate::error::{EngineError, EngineResult};
use crate::impact::RecommendedAction;
use crate::migration::{MigrationPlan, StepKind, StepStatus};
use crate::notify::{template_for, Notifier};
use crate::repository::{PlanRepository, SubscriptionRepository};

#[derive(Clone)]
pub struct MigrationExecutor {
    plans: Arc<dyn PlanRepository>,
    subscriptions: Arc<dyn SubscriptionRepository>,
    notifier: Arc<dyn Notifier>,
}

impl MigrationExecutor {
    pub fn new(
        plans: Arc<dyn PlanRepository>,
        subscriptions: Arc<dyn SubscriptionRepository>,
        notifier: Arc<dyn Notifier>,
    ) -> Self {
        Self {
            plans,
            subscriptions,
            notifier,
        }
    }

    /// Run one step and record its outcome on the migration.
    ///
    /// On failure the step is marked failed and the error is returned; the
    /// migration itself keeps its status so the step can be retried.
    pub async fn execute_step(
        &self,
        migration: &mut MigrationPlan,
        kind: StepKind,
    ) -> EngineResult<()> {
        let outcome = match kind {
            StepKind::Notify => Ok(self.notify(migration).await),
            StepKind::GracePeriodStart => Ok(Vec::new()),
            StepKind::ApplyChange => self.apply_change(migration).await,
            StepKind::Verify => self.verify(migration).await.map(|_| Vec::new()),
        };

        let now = OffsetDateTime::now_utc();
        if kind == StepKind::GracePeriodStart && outcome.is_ok() {
            migration.grace_period_ends_at = Some(now + migration.grace_period);
        }

        let migration_id = migration.id;
        let step = migration.step_mut(kind).ok_or_else(|| {
            EngineError::NotFound(format!("step {} on migration {}", kind, migration_id))
        })?;
        step.attempts += 1;

        match outcome {
            Ok(warnings) => {
                step.status = StepStatus::Completed;
                step.warnings = warnings;
                step.last_error = None;
                step.completed_at = Some(now);
                Ok(())
            }
            Err(e) => {
                tracing::warn!(
                    migration_id = %migration_id,
                    step = %kind,
                    attempt = step.attempts,
                    error = %e,
                    "Migration step failed"
                );
                step.status = StepStatus::Failed;
                step.last_error = Some(e.to_string());
                Err(e)
            }
        }
    }

    async fn notify(&self, migration: &MigrationPlan) -> Vec<String> {
        let mut warnings = Vec::new();
        for target in &migration.notifications {
            let target_plan_id = migration
                .tasks
                .iter()
                .find(|t| t.subscription_id == target.subscription_id)
                .and_then(|t| t.target_plan_id);
            let payload = serde_json::json!({
                "migration_id": migration.id,
                "plan_id": migration.plan_id,
                "plan_name": migration.proposed_plan.name,
                "change_type": migration.change_type,
                "action": target.action,
                "new_price": migration.proposed_plan.price,
                "target_plan_id": target_plan_id,
                "grace_period_days": migration.grace_period.whole_days(),
            });

            if let Err(reason) = self
                .notifier
                .notify(target.subscription_id, template_for(target.action), payload)
                .await
            {
                warnings.push(format!(
                    "notification to {} failed: {}",
                    target.subscription_id, reason
                ));
            }
        }
        warnings
    }

    async fn apply_change(&self, migration: &MigrationPlan) -> EngineResult<Vec<String>> {
        let ends_at = migration
            .grace_period_ends_at
            .ok_or(EngineError::InvalidTransition {
                from: migration.status,
                action: "apply",
            })?;
        if OffsetDateTime::now_utc() < ends_at {
            return Err(EngineError::GracePeriodActive { ends_at });
        }
        self.apply(migration).await
    }

    /// Save the proposed definition and move every placed subscriber.
    /// Idempotent; returns a warning per subscriber left unplaced.
    pub async fn apply(&self, migration: &MigrationPlan) -> EngineResult<Vec<String>> {
        self.plans.save(&migration.proposed_plan).await?;

        let mut warnings = Vec::new();
        let mut rebound = 0usize;
        for task in &migration.tasks {
            match task.rebinds() {
                Some(target) => {
                    self.subscriptions
                        .rebind(task.subscription_id, target)
                        .await?;
                    rebound += 1;
                }
                None if task.action == RecommendedAction::Migrate => {
                    warnings.push(format!(
                        "no alternative plan fits subscription {}; left on plan {}",
                        task.subscription_id, migration.plan_id
                    ));
                }
                None => {}
            }
        }

        tracing::info!(
            migration_id = %migration.id,
            plan_id = %migration.plan_id,
            rebound,
            unplaced = warnings.len(),
            "Plan change applied"
        );
        Ok(warnings)
    }

    async fn verify(&self, migration: &MigrationPlan) -> EngineResult<()> {
        let stored = self.plans.get(migration.plan_id).await?;
        if stored != migration.proposed_plan {
            return Err(EngineError::VerificationFailed(format!(
                "plan {} does not match the applied definition",
                migration.plan_id
            )));
        }

        for task in &migration.tasks {
            if let Some(target) = task.rebinds() {
                let sub = self.subscriptions.get(task.subscription_id).await?;
                if sub.plan_id != target {
                    return Err(EngineError::VerificationFailed(format!(
                        "subscription {} is on plan {}, expected {}",
                        sub.id, sub.plan_id, target
                    )));
                }
            }
        }
        Ok(())
    }

    /// Restore the plan definition and every captured binding
    pub async fn rollback(&self, migration: &MigrationPlan) -> EngineResult<()> {
        let descriptor = &migration.rollback;
        self.plans.save(&descriptor.plan_snapshot).await?;

        let mut skipped = 0usize;
        for binding in &descriptor.bindings {
            match self
                .subscriptions
                .rebind(binding.subscription_id, binding.plan_id)
                .await
            {
                Ok(()) => {}
                Err(EngineError::NotFound(_)) => {
                    tracing::warn!(
                        migration_id = %migration.id,
                        subscription_id = %binding.subscription_id,
                        "Subscription no longer exists; skipping rebind"
                    );
                    skipped += 1;
                }
                Err(e) => return Err(e),
            }
        }

        tracing::info!(
            migration_id = %migration.id,
            plan_id = %migration.plan_id,
            restored = descriptor.bindings.len() - skipped,
            "Migration rolled back"
        );
        Ok(())
    }
}
