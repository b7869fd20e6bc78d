//! Orchestrator
//!
//! Single entry point for operators. Composes the analyzer, classifier,
//! planner and executor, and makes sure every state change lands in the
//! change ledger.
//!
//! ## Flow
//!
//! ```text
//! analyze_*  -> scan -> classify -> ledger.append(ImpactAnalysis)
//! create_migration_plan -> planner -> store.insert (draft, no ledger entry)
//! execute_migration     -> claim -> executor step -> store.update_and_append(MigrationExecution)
//! rollback              -> claim -> executor rollback -> store.update_and_append(Rollback)
//! ```
//!
//! A claim is a per-migration lock held from the read of the migration to its
//! write, so side effects of two calls on one migration never interleave. The
//! compare-and-swap on `version` still rejects writers from other processes.
//! When the final write fails, plan-store side effects of the call are undone
//! before the error is returned. Notifications already sent stay sent.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use futures::stream::BoxStream;
use planguard_shared::{
    ActorId, AnalysisId, FeatureSet, LimitMap, MigrationId, Plan, PlanId, PlanState, Price,
};
use tokio::sync::OwnedMutexGuard;

use crate::analyzer::{AnalysisOptions, AnalyzerSettings, ImpactAnalyzer};
use crate::classifier::RiskClassifier;
use crate::config::EngineConfig;
use crate::error::{EngineError, EngineResult};
use crate::executor::MigrationExecutor;
use crate::impact::{ChangeType, ImpactAnalysis};
use crate::ledger::{ChangeLedger, ChangeRecord, LedgerEntry, MigrationStore, NewChangeRecord};
use crate::migration::{MigrationPlan, MigrationStatus, StepKind};
use crate::notify::Notifier;
use crate::planner::MigrationPlanner;
use crate::repository::{PlanRepository, SubscriptionRepository};

/// External services the engine is wired to
#[derive(Clone)]
pub struct Collaborators {
    pub plans: Arc<dyn PlanRepository>,
    pub subscriptions: Arc<dyn SubscriptionRepository>,
    pub notifier: Arc<dyn Notifier>,
    pub ledger: Arc<dyn ChangeLedger>,
    pub migrations: Arc<dyn MigrationStore>,
}

/// One async lock per migration that currently has callers
#[derive(Default)]
struct MigrationLocks {
    held: Mutex<HashMap<MigrationId, Arc<tokio::sync::Mutex<()>>>>,
}

impl MigrationLocks {
    async fn acquire(&self, id: MigrationId) -> EngineResult<OwnedMutexGuard<()>> {
        let lock = {
            let mut held = self.held.lock().map_err(|_| {
                EngineError::StorageUnavailable("migration lock table poisoned".to_string())
            })?;
            // Entries only the table refers to have no holder or waiter
            held.retain(|_, lock| Arc::strong_count(lock) > 1);
            held.entry(id).or_default().clone()
        };
        Ok(lock.lock_owned().await)
    }
}

#[derive(Clone)]
pub struct Orchestrator {
    plans: Arc<dyn PlanRepository>,
    ledger: Arc<dyn ChangeLedger>,
    migrations: Arc<dyn MigrationStore>,
    analyzer: ImpactAnalyzer,
    classifier: RiskClassifier,
    planner: MigrationPlanner,
    executor: MigrationExecutor,
    locks: Arc<MigrationLocks>,
    default_grace_period: time::Duration,
}

impl Orchestrator {
    pub fn new(config: &EngineConfig, collaborators: Collaborators) -> Self {
        let Collaborators {
            plans,
            subscriptions,
            notifier,
            ledger,
            migrations,
        } = collaborators;

        Self {
            analyzer: ImpactAnalyzer::new(subscriptions.clone(), AnalyzerSettings::from(config)),
            classifier: RiskClassifier::new(config.risk_table.clone()),
            planner: MigrationPlanner::new(),
            executor: MigrationExecutor::new(plans.clone(), subscriptions, notifier),
            locks: Arc::new(MigrationLocks::default()),
            default_grace_period: config.default_grace_period,
            plans,
            ledger,
            migrations,
        }
    }

    // =========================================================================
    // Analysis
    // =========================================================================

    pub async fn analyze_pricing_change(
        &self,
        actor: ActorId,
        plan_id: PlanId,
        new_price: Price,
        options: &AnalysisOptions,
    ) -> EngineResult<ImpactAnalysis> {
        self.analyze(actor, plan_id, ChangeType::Pricing, options, |plan| {
            plan.with_price(new_price)
        })
        .await
    }

    pub async fn analyze_limit_change(
        &self,
        actor: ActorId,
        plan_id: PlanId,
        new_limits: LimitMap,
        options: &AnalysisOptions,
    ) -> EngineResult<ImpactAnalysis> {
        self.analyze(actor, plan_id, ChangeType::Limits, options, |plan| {
            plan.with_limits(new_limits)
        })
        .await
    }

    pub async fn analyze_feature_change(
        &self,
        actor: ActorId,
        plan_id: PlanId,
        new_features: FeatureSet,
        options: &AnalysisOptions,
    ) -> EngineResult<ImpactAnalysis> {
        self.analyze(actor, plan_id, ChangeType::Features, options, |plan| {
            plan.with_features(new_features)
        })
        .await
    }

    pub async fn analyze_disable(
        &self,
        actor: ActorId,
        plan_id: PlanId,
        options: &AnalysisOptions,
    ) -> EngineResult<ImpactAnalysis> {
        self.analyze(actor, plan_id, ChangeType::Disable, options, |plan| {
            plan.with_state(PlanState::Disabled)
        })
        .await
    }

    async fn analyze(
        &self,
        actor: ActorId,
        plan_id: PlanId,
        change_type: ChangeType,
        options: &AnalysisOptions,
        mutate: impl FnOnce(&Plan) -> Plan,
    ) -> EngineResult<ImpactAnalysis> {
        let current = self.plans.get(plan_id).await?;
        let proposed = mutate(&current);

        let scan = self
            .analyzer
            .scan(&current, &proposed, change_type, options)
            .await?;
        // Nothing reaches the ledger once the caller has given up
        options.checkpoint()?;

        let risk = self.classifier.assess(&scan.metrics);
        let analysis = ImpactAnalysis::from_scan(scan, risk, actor);

        let record = self
            .ledger
            .append(NewChangeRecord {
                plan_id,
                actor_id: actor,
                entry: LedgerEntry::ImpactAnalysis(Box::new(analysis.clone())),
            })
            .await?;

        tracing::info!(
            analysis_id = %analysis.id,
            plan_id = %plan_id,
            actor_id = %actor,
            change_type = %change_type,
            affected = analysis.metrics.affected_count,
            revenue_impact = %analysis.metrics.revenue_impact,
            risk = %analysis.risk.level,
            sequence = record.sequence,
            "Impact analysis recorded"
        );

        Ok(analysis)
    }

    /// Stored analysis by id
    pub async fn get_analysis(&self, impact_id: AnalysisId) -> EngineResult<ImpactAnalysis> {
        self.ledger.find_analysis(impact_id).await
    }

    // =========================================================================
    // Migrations
    // =========================================================================

    /// Draft a migration from a stored analysis. `None` uses the configured
    /// default grace period.
    pub async fn create_migration_plan(
        &self,
        actor: ActorId,
        impact_id: AnalysisId,
        grace_period: Option<time::Duration>,
        override_critical: bool,
    ) -> EngineResult<MigrationPlan> {
        let impact = self.ledger.find_analysis(impact_id).await?;

        let current = self.plans.get(impact.plan_id).await?;
        if current != impact.current_plan {
            return Err(EngineError::InvalidMutation(format!(
                "plan {} changed after analysis {}; analyze again",
                impact.plan_id, impact.id
            )));
        }

        let alternatives = self
            .plans
            .list_candidate_alternatives(&impact.current_plan.price.currency)
            .await?;

        let migration = self.planner.plan(
            &impact,
            grace_period.unwrap_or(self.default_grace_period),
            override_critical,
            &alternatives,
            actor,
        )?;
        self.migrations.insert(&migration).await?;

        if migration.risk_overridden {
            tracing::warn!(
                migration_id = %migration.id,
                actor_id = %actor,
                affected = impact.metrics.affected_count,
                "Critical risk overridden for migration plan"
            );
        }
        tracing::info!(
            migration_id = %migration.id,
            impact_id = %impact.id,
            plan_id = %migration.plan_id,
            tasks = migration.tasks.len(),
            grace_period_days = migration.grace_period.whole_days(),
            "Migration plan drafted"
        );

        Ok(migration)
    }

    /// Run the next pending step. Starts a draft; fails on terminal plans.
    pub async fn execute_migration(
        &self,
        actor: ActorId,
        migration_id: MigrationId,
    ) -> EngineResult<MigrationPlan> {
        let _claim = self.locks.acquire(migration_id).await?;
        let mut migration = self.migrations.get(migration_id).await?;
        let expected_version = migration.version;
        migration.start()?;

        let Some(kind) = migration.next_step().map(|s| s.kind) else {
            migration.complete()?;
            migration.touch();
            self.migrations.update(&migration, expected_version).await?;
            return Ok(migration);
        };

        let outcome = self.executor.execute_step(&mut migration, kind).await;
        if outcome.is_ok() && migration.all_steps_done() {
            migration.complete()?;
        }
        migration.touch();

        if let Err(e) = outcome {
            // Grace and ordering refusals happen before anything is written
            let touched_plans = !matches!(
                e,
                EngineError::GracePeriodActive { .. } | EngineError::InvalidTransition { .. }
            );
            if kind == StepKind::ApplyChange && touched_plans {
                self.revert_apply(&migration, &e).await;
            }
            // The failed attempt stays on the migration; history only holds completed steps
            self.migrations.update(&migration, expected_version).await?;
            return Err(e);
        }

        let recorded = self
            .migrations
            .update_and_append(
                &migration,
                expected_version,
                NewChangeRecord {
                    plan_id: migration.plan_id,
                    actor_id: actor,
                    entry: LedgerEntry::MigrationExecution {
                        migration: Box::new(migration.clone()),
                        step: kind,
                    },
                },
            )
            .await;
        let record = match recorded {
            Ok(record) => record,
            Err(e) => {
                if kind == StepKind::ApplyChange {
                    self.revert_apply(&migration, &e).await;
                }
                return Err(e);
            }
        };

        tracing::info!(
            migration_id = %migration.id,
            plan_id = %migration.plan_id,
            actor_id = %actor,
            step = %kind,
            status = %migration.status,
            sequence = record.sequence,
            "Migration step executed"
        );

        Ok(migration)
    }

    /// Run steps until the migration completes or a step fails
    pub async fn execute_migration_to_completion(
        &self,
        actor: ActorId,
        migration_id: MigrationId,
    ) -> EngineResult<MigrationPlan> {
        loop {
            let migration = self.execute_migration(actor, migration_id).await?;
            if migration.status == MigrationStatus::Completed {
                return Ok(migration);
            }
        }
    }

    /// Restore the pre-change plan and bindings of a started or completed migration
    pub async fn rollback(
        &self,
        actor: ActorId,
        migration_id: MigrationId,
    ) -> EngineResult<ChangeRecord> {
        let _claim = self.locks.acquire(migration_id).await?;
        let migration = self.migrations.get(migration_id).await?;
        let expected_version = migration.version;

        let mut rolled_back = migration.clone();
        rolled_back.mark_rolled_back()?;
        rolled_back.touch();

        let recorded = match self.executor.rollback(&migration).await {
            Ok(()) => {
                self.migrations
                    .update_and_append(
                        &rolled_back,
                        expected_version,
                        NewChangeRecord {
                            plan_id: migration.plan_id,
                            actor_id: actor,
                            entry: LedgerEntry::Rollback {
                                migration_id,
                                restored: migration.rollback.clone(),
                            },
                        },
                    )
                    .await
            }
            Err(e) => Err(e),
        };
        let record = match recorded {
            Ok(record) => record,
            Err(e) => {
                if migration.step_done(StepKind::ApplyChange) {
                    self.reapply(&migration, &e).await;
                }
                return Err(e);
            }
        };

        tracing::info!(
            migration_id = %migration_id,
            plan_id = %migration.plan_id,
            actor_id = %actor,
            previous_status = %migration.status,
            sequence = record.sequence,
            "Migration rolled back"
        );

        Ok(record)
    }

    /// Put the pre-change definition and bindings back after an apply that
    /// did not make it into the store
    async fn revert_apply(&self, migration: &MigrationPlan, cause: &EngineError) {
        tracing::warn!(
            migration_id = %migration.id,
            error = %cause,
            "Apply not recorded; restoring previous plan state"
        );
        if let Err(e) = self.executor.rollback(migration).await {
            tracing::error!(
                migration_id = %migration.id,
                error = %e,
                "Failed to restore plan state after unrecorded apply"
            );
        }
    }

    /// Re-apply the change after a rollback that did not make it into the store
    async fn reapply(&self, migration: &MigrationPlan, cause: &EngineError) {
        tracing::warn!(
            migration_id = %migration.id,
            error = %cause,
            "Rollback not recorded; re-applying migrated plan state"
        );
        if let Err(e) = self.executor.apply(migration).await {
            tracing::error!(
                migration_id = %migration.id,
                error = %e,
                "Failed to re-apply plan state after unrecorded rollback"
            );
        }
    }

    /// Drop a draft migration. Leaves no trace in the ledger.
    pub async fn discard_migration(&self, migration_id: MigrationId) -> EngineResult<()> {
        self.migrations.discard(migration_id).await?;
        tracing::info!(migration_id = %migration_id, "Draft migration discarded");
        Ok(())
    }

    pub async fn get_migration(&self, migration_id: MigrationId) -> EngineResult<MigrationPlan> {
        self.migrations.get(migration_id).await
    }

    // =========================================================================
    // History
    // =========================================================================

    /// Ledger records of a plan, ascending by sequence
    pub fn get_history(&self, plan_id: PlanId) -> BoxStream<'_, EngineResult<ChangeRecord>> {
        self.ledger.history(plan_id)
    }

    pub async fn get_latest(&self, plan_id: PlanId) -> EngineResult<Option<ChangeRecord>> {
        self.ledger.latest(plan_id).await
    }
}
