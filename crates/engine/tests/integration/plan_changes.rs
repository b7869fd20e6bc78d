//! End-to-end tests for plan changes driven through the orchestrator
//!
//! Everything runs against the in-memory collaborators, so no database or
//! notification service is needed.
//!
//! ## Running Tests
//! ```bash
//! cargo test -p planguard-engine --test plan_changes
//! ```

#![allow(clippy::unwrap_used)]

use std::sync::Arc;

use futures::TryStreamExt;
use planguard_engine::{
    AnalysisOptions, ChangeLedger, ChangeRecord, Collaborators, EngineConfig, EngineError,
    InMemoryChangeLedger, InMemoryMigrationStore, InMemoryPlanRepository,
    InMemorySubscriptionRepository, LedgerEntry, MigrationStatus, Orchestrator, RecommendedAction,
    RecordingNotifier, RiskLevel, StepKind, StepStatus,
};
use planguard_shared::{
    ActorId, BillingState, LimitMap, MigrationId, Plan, PlanId, PlanState, Price, Subscription,
    SubscriptionId, WorkspaceId,
};
use rust_decimal::Decimal;
use time::OffsetDateTime;
use tokio::sync::Barrier;
use tokio_util::sync::CancellationToken;

// ============================================================================
// Test Utilities
// ============================================================================

struct Harness {
    plans: Arc<InMemoryPlanRepository>,
    subs: Arc<InMemorySubscriptionRepository>,
    notifier: Arc<RecordingNotifier>,
    ledger: Arc<InMemoryChangeLedger>,
    orchestrator: Orchestrator,
    actor: ActorId,
}

fn harness(plans: Vec<Plan>, subs: Vec<Subscription>, grace_period_days: i64) -> Harness {
    let plans = Arc::new(InMemoryPlanRepository::with_plans(plans));
    let subs = Arc::new(InMemorySubscriptionRepository::with_subscriptions(subs));
    let notifier = Arc::new(RecordingNotifier::new());
    let ledger = Arc::new(InMemoryChangeLedger::new());

    let config = EngineConfig {
        default_grace_period: time::Duration::days(grace_period_days),
        analysis_page_size: 64,
        ..EngineConfig::default()
    };
    let orchestrator = Orchestrator::new(
        &config,
        Collaborators {
            plans: plans.clone(),
            subscriptions: subs.clone(),
            notifier: notifier.clone(),
            ledger: ledger.clone(),
            migrations: Arc::new(InMemoryMigrationStore::new(ledger.clone())),
        },
    );

    Harness {
        plans,
        subs,
        notifier,
        ledger,
        orchestrator,
        actor: ActorId::new(),
    }
}

fn plan(name: &str, price: i64, seats: i64) -> Plan {
    Plan {
        id: PlanId::new(),
        name: name.to_string(),
        price: Price::monthly(Decimal::from(price), "USD").unwrap(),
        features: ["api".to_string()].into(),
        limits: [("seats".to_string(), seats)].into_iter().collect(),
        state: PlanState::Active,
    }
}

fn subscription(plan: &Plan, seats: i64) -> Subscription {
    let mut usage = LimitMap::new();
    usage.insert("seats".to_string(), seats);
    Subscription {
        id: SubscriptionId::new(),
        workspace_id: WorkspaceId::new(),
        plan_id: plan.id,
        usage,
        feature_usage: None,
        billing_state: BillingState::Active,
        created_at: OffsetDateTime::now_utc() - time::Duration::days(30),
        last_billed_at: None,
    }
}

fn usd(amount: i64) -> Price {
    Price::monthly(Decimal::from(amount), "USD").unwrap()
}

fn seats(limit: i64) -> LimitMap {
    [("seats".to_string(), limit)].into_iter().collect()
}

/// Basic plan cut from 10 to 5 seats, with one subscriber that must move to Team
async fn seat_cut_migration(
    grace_period_days: i64,
) -> (Harness, Plan, Plan, Subscription, MigrationId) {
    let basic = plan("Basic", 10, 10);
    let team = plan("Team", 30, 25);
    let over = subscription(&basic, 7);
    let h = harness(
        vec![basic.clone(), team.clone()],
        vec![over.clone(), subscription(&basic, 2)],
        grace_period_days,
    );

    let analysis = h
        .orchestrator
        .analyze_limit_change(h.actor, basic.id, seats(5), &AnalysisOptions::default())
        .await
        .unwrap();
    let draft = h
        .orchestrator
        .create_migration_plan(h.actor, analysis.id, None, false)
        .await
        .unwrap();
    (h, basic, team, over, draft.id)
}

async fn kinds(h: &Harness, plan_id: PlanId) -> Vec<&'static str> {
    history(h, plan_id)
        .await
        .iter()
        .map(|r| r.entry.kind())
        .collect()
}

async fn history(h: &Harness, plan_id: PlanId) -> Vec<ChangeRecord> {
    h.orchestrator
        .get_history(plan_id)
        .try_collect()
        .await
        .unwrap()
}

// ============================================================================
// Analysis Scenarios
// ============================================================================

#[tokio::test]
async fn test_price_raise_on_small_plan_is_low_risk() {
    let pro = plan("Pro", 20, 10);
    let subs = (0..3).map(|_| subscription(&pro, 1)).collect();
    let h = harness(vec![pro.clone()], subs, 0);

    let analysis = h
        .orchestrator
        .analyze_pricing_change(h.actor, pro.id, usd(25), &AnalysisOptions::default())
        .await
        .unwrap();

    assert_eq!(analysis.metrics.affected_count, 3);
    assert_eq!(analysis.metrics.revenue_impact, Decimal::new(1500, 2));
    assert_eq!(analysis.risk.level, RiskLevel::Low);
    assert_eq!(analysis.created_by, h.actor);

    let latest = h.orchestrator.get_latest(pro.id).await.unwrap().unwrap();
    assert_eq!(latest.sequence, 1);
    assert!(matches!(
        latest.entry,
        LedgerEntry::ImpactAnalysis(ref stored) if stored.id == analysis.id
    ));
}

#[tokio::test]
async fn test_seat_cut_flags_subscriber_over_new_limit() {
    let basic = plan("Basic", 10, 10);
    let over = subscription(&basic, 7);
    let under = subscription(&basic, 4);
    let h = harness(vec![basic.clone()], vec![over.clone(), under.clone()], 0);

    let analysis = h
        .orchestrator
        .analyze_limit_change(h.actor, basic.id, seats(5), &AnalysisOptions::default())
        .await
        .unwrap();

    let x = analysis.find(over.id).unwrap();
    assert_eq!(x.limit_exceedance.get("seats"), Some(&2));
    assert_eq!(x.recommended_action, RecommendedAction::Migrate);
    assert!(analysis.find(under.id).is_none());
    assert_eq!(analysis.metrics.exceeding_limits_count, 1);
    assert!(analysis
        .risk
        .recommendations
        .iter()
        .any(|r| r.starts_with("1 subscriptions will exceed the new limit")));
}

#[tokio::test]
async fn test_disable_of_large_plan_requires_override() {
    let legacy = plan("Legacy", 10, 10);
    let subs = (0..600).map(|_| subscription(&legacy, 1)).collect();
    let h = harness(vec![legacy.clone()], subs, 0);

    let analysis = h
        .orchestrator
        .analyze_disable(h.actor, legacy.id, &AnalysisOptions::default())
        .await
        .unwrap();
    assert_eq!(analysis.metrics.affected_count, 600);
    assert_eq!(analysis.risk.level, RiskLevel::Critical);
    assert_eq!(
        analysis.metrics.count_for(RecommendedAction::Migrate),
        600
    );

    let err = h
        .orchestrator
        .create_migration_plan(h.actor, analysis.id, None, false)
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        EngineError::RiskOverrideRequired {
            level: RiskLevel::Critical,
            affected_count: 600
        }
    ));

    let migration = h
        .orchestrator
        .create_migration_plan(h.actor, analysis.id, None, true)
        .await
        .unwrap();
    assert!(migration.risk_overridden);
    assert_eq!(migration.status, MigrationStatus::Draft);

    // Drafts never reach the ledger
    assert_eq!(history(&h, legacy.id).await.len(), 1);
}

#[tokio::test]
async fn test_feature_removal_uses_telemetry() {
    let mut pro = plan("Pro", 20, 10);
    pro.features = ["api".to_string(), "sso".to_string()].into();
    let mut uses_sso = subscription(&pro, 1);
    uses_sso.feature_usage = Some(["sso".to_string()].into());
    let mut api_only = subscription(&pro, 1);
    api_only.feature_usage = Some(["api".to_string()].into());
    let h = harness(
        vec![pro.clone()],
        vec![uses_sso.clone(), api_only.clone()],
        0,
    );

    let analysis = h
        .orchestrator
        .analyze_feature_change(
            h.actor,
            pro.id,
            ["api".to_string()].into(),
            &AnalysisOptions::default(),
        )
        .await
        .unwrap();

    assert_eq!(analysis.metrics.affected_count, 1);
    assert_eq!(
        analysis.find(uses_sso.id).unwrap().lost_features,
        vec!["sso".to_string()]
    );
    assert!(analysis.diff.removed_features.contains("sso"));
}

#[tokio::test]
async fn test_unknown_plan_is_not_found() {
    let h = harness(vec![], vec![], 0);
    let err = h
        .orchestrator
        .analyze_disable(h.actor, PlanId::new(), &AnalysisOptions::default())
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::NotFound(_)));
}

#[tokio::test]
async fn test_currency_change_is_rejected() {
    let pro = plan("Pro", 20, 10);
    let h = harness(vec![pro.clone()], vec![subscription(&pro, 1)], 0);

    let err = h
        .orchestrator
        .analyze_pricing_change(
            h.actor,
            pro.id,
            Price::monthly(Decimal::from(20), "EUR").unwrap(),
            &AnalysisOptions::default(),
        )
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::InvalidMutation(_)));
    assert!(h.ledger.is_empty());
}

// ============================================================================
// Cancellation, Deadlines and Storage Failures
// ============================================================================

#[tokio::test]
async fn test_cancelled_analysis_leaves_no_ledger_write() {
    let pro = plan("Pro", 20, 10);
    let subs = (0..50).map(|_| subscription(&pro, 1)).collect();
    let h = harness(vec![pro.clone()], subs, 0);

    let token = CancellationToken::new();
    token.cancel();
    let err = h
        .orchestrator
        .analyze_pricing_change(
            h.actor,
            pro.id,
            usd(25),
            &AnalysisOptions::with_cancellation(token),
        )
        .await
        .unwrap_err();

    assert!(matches!(err, EngineError::Cancelled));
    assert!(h.ledger.is_empty());
}

#[tokio::test]
async fn test_expired_deadline_leaves_no_ledger_write() {
    let pro = plan("Pro", 20, 10);
    let subs = (0..50).map(|_| subscription(&pro, 1)).collect();
    let h = harness(vec![pro.clone()], subs, 0);

    let err = h
        .orchestrator
        .analyze_pricing_change(
            h.actor,
            pro.id,
            usd(25),
            &AnalysisOptions::with_deadline(tokio::time::Instant::now()),
        )
        .await
        .unwrap_err();

    assert!(matches!(err, EngineError::DeadlineExceeded));
    assert!(h.ledger.is_empty());
}

#[tokio::test]
async fn test_ledger_outage_fails_analysis() {
    let pro = plan("Pro", 20, 10);
    let h = harness(vec![pro.clone()], vec![subscription(&pro, 1)], 0);
    h.ledger.set_unavailable(true);

    let err = h
        .orchestrator
        .analyze_pricing_change(h.actor, pro.id, usd(25), &AnalysisOptions::default())
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::StorageUnavailable(_)));
    assert!(err.is_retryable());
}

#[tokio::test]
async fn test_subscription_store_failure_aborts_analysis() {
    let pro = plan("Pro", 20, 10);
    let subs = (0..40).map(|_| subscription(&pro, 1)).collect();
    let h = harness(vec![pro.clone()], subs, 0);
    h.subs.fail_listing_after(Some(2));

    let err = h
        .orchestrator
        .analyze_pricing_change(h.actor, pro.id, usd(25), &AnalysisOptions::default())
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::StorageUnavailable(_)));
    assert!(h.ledger.is_empty());
}

// ============================================================================
// Ledger Ordering
// ============================================================================

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_analyses_get_gap_free_sequences() {
    let pro = plan("Pro", 20, 10);
    let subs = (0..10).map(|_| subscription(&pro, 1)).collect();
    let h = harness(vec![pro.clone()], subs, 0);
    let start = Arc::new(Barrier::new(16));

    let handles: Vec<_> = (0..16)
        .map(|i| {
            let orchestrator = h.orchestrator.clone();
            let actor = h.actor;
            let plan_id = pro.id;
            let start = start.clone();
            tokio::spawn(async move {
                start.wait().await;
                orchestrator
                    .analyze_pricing_change(actor, plan_id, usd(21 + i), &AnalysisOptions::default())
                    .await
            })
        })
        .collect();
    for handle in handles {
        handle.await.unwrap().unwrap();
    }

    let records = history(&h, pro.id).await;
    let sequences: Vec<u64> = records.iter().map(|r| r.sequence).collect();
    assert_eq!(sequences, (1..=16).collect::<Vec<u64>>());

    // History can be read again from the start
    assert_eq!(history(&h, pro.id).await, records);
}

#[tokio::test]
async fn test_history_is_scoped_per_plan() {
    let pro = plan("Pro", 20, 10);
    let team = plan("Team", 50, 25);
    let h = harness(
        vec![pro.clone(), team.clone()],
        vec![subscription(&pro, 1), subscription(&team, 1)],
        0,
    );
    let opts = AnalysisOptions::default();

    h.orchestrator
        .analyze_pricing_change(h.actor, pro.id, usd(22), &opts)
        .await
        .unwrap();
    h.orchestrator
        .analyze_pricing_change(h.actor, team.id, usd(55), &opts)
        .await
        .unwrap();
    h.orchestrator
        .analyze_pricing_change(h.actor, pro.id, usd(24), &opts)
        .await
        .unwrap();

    let pro_history = history(&h, pro.id).await;
    assert_eq!(pro_history.len(), 2);
    assert!(pro_history.iter().all(|r| r.plan_id == pro.id));
    assert_eq!(
        h.ledger.latest(team.id).await.unwrap().map(|r| r.sequence),
        Some(1)
    );
}

// ============================================================================
// Migration Lifecycle
// ============================================================================

#[tokio::test]
async fn test_migration_apply_then_rollback_restores_bindings() {
    let basic = plan("Basic", 10, 10);
    let team = plan("Team", 30, 25);
    let over = subscription(&basic, 7);
    let under = subscription(&basic, 2);
    let h = harness(
        vec![basic.clone(), team.clone()],
        vec![over.clone(), under.clone()],
        0,
    );
    let before = h.subs.bindings();

    let analysis = h
        .orchestrator
        .analyze_limit_change(h.actor, basic.id, seats(5), &AnalysisOptions::default())
        .await
        .unwrap();
    let draft = h
        .orchestrator
        .create_migration_plan(h.actor, analysis.id, None, false)
        .await
        .unwrap();
    assert_eq!(draft.tasks.len(), 1);
    assert_eq!(draft.tasks[0].target_plan_id, Some(team.id));

    let done = h
        .orchestrator
        .execute_migration_to_completion(h.actor, draft.id)
        .await
        .unwrap();
    assert_eq!(done.status, MigrationStatus::Completed);
    assert!(done.steps.iter().all(|s| s.status == StepStatus::Completed));
    assert_eq!(h.subs.bindings()[&over.id], team.id);
    assert_eq!(h.plans.snapshot(basic.id).unwrap().limit("seats"), Some(5));
    assert_eq!(h.notifier.sent().len(), 1);

    let record = h.orchestrator.rollback(h.actor, draft.id).await.unwrap();
    assert!(matches!(
        record.entry,
        LedgerEntry::Rollback { migration_id, .. } if migration_id == draft.id
    ));
    assert_eq!(h.subs.bindings(), before);
    assert_eq!(h.plans.snapshot(basic.id), Some(basic.clone()));

    // analysis, four steps, rollback
    let kinds: Vec<&str> = history(&h, basic.id)
        .await
        .iter()
        .map(|r| r.entry.kind())
        .collect();
    assert_eq!(
        kinds,
        vec![
            "impact_analysis",
            "migration_execution",
            "migration_execution",
            "migration_execution",
            "migration_execution",
            "rollback",
        ]
    );

    let err = h.orchestrator.rollback(h.actor, draft.id).await.unwrap_err();
    assert!(matches!(
        err,
        EngineError::RollbackUnavailable {
            status: MigrationStatus::RolledBack
        }
    ));
    let err = h
        .orchestrator
        .execute_migration(h.actor, draft.id)
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::InvalidTransition { .. }));
}

#[tokio::test]
async fn test_apply_waits_for_grace_period() {
    let basic = plan("Basic", 10, 10);
    let team = plan("Team", 30, 25);
    let over = subscription(&basic, 7);
    let h = harness(vec![basic.clone(), team], vec![over.clone()], 14);

    let analysis = h
        .orchestrator
        .analyze_limit_change(h.actor, basic.id, seats(5), &AnalysisOptions::default())
        .await
        .unwrap();
    let draft = h
        .orchestrator
        .create_migration_plan(h.actor, analysis.id, None, false)
        .await
        .unwrap();

    let err = h
        .orchestrator
        .execute_migration_to_completion(h.actor, draft.id)
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::GracePeriodActive { .. }));
    assert!(err.is_retryable());

    let stored = h.orchestrator.get_migration(draft.id).await.unwrap();
    assert_eq!(stored.status, MigrationStatus::InProgress);
    assert!(stored.grace_period_ends_at.is_some());
    let apply = stored
        .steps
        .iter()
        .find(|s| s.kind == StepKind::ApplyChange)
        .unwrap();
    assert_eq!(apply.status, StepStatus::Failed);
    assert_eq!(h.subs.bindings()[&over.id], basic.id);

    // Nothing was applied, but rollback is still allowed while in progress
    h.orchestrator.rollback(h.actor, draft.id).await.unwrap();
    assert_eq!(
        h.orchestrator.get_migration(draft.id).await.unwrap().status,
        MigrationStatus::RolledBack
    );
}

#[tokio::test]
async fn test_unplaced_subscriber_is_warned_not_moved() {
    let basic = plan("Basic", 10, 10);
    let huge = subscription(&basic, 9);
    let h = harness(vec![basic.clone()], vec![huge.clone()], 0);

    let analysis = h
        .orchestrator
        .analyze_limit_change(h.actor, basic.id, seats(5), &AnalysisOptions::default())
        .await
        .unwrap();
    let draft = h
        .orchestrator
        .create_migration_plan(h.actor, analysis.id, None, false)
        .await
        .unwrap();
    assert_eq!(draft.tasks[0].target_plan_id, None);

    let done = h
        .orchestrator
        .execute_migration_to_completion(h.actor, draft.id)
        .await
        .unwrap();
    let apply = done
        .steps
        .iter()
        .find(|s| s.kind == StepKind::ApplyChange)
        .unwrap();
    assert_eq!(apply.warnings.len(), 1);
    assert_eq!(h.subs.bindings()[&huge.id], basic.id);
}

#[tokio::test]
async fn test_draft_discard_leaves_no_trace() {
    let pro = plan("Pro", 20, 10);
    let h = harness(vec![pro.clone()], vec![subscription(&pro, 1)], 0);

    let analysis = h
        .orchestrator
        .analyze_pricing_change(h.actor, pro.id, usd(30), &AnalysisOptions::default())
        .await
        .unwrap();
    let draft = h
        .orchestrator
        .create_migration_plan(h.actor, analysis.id, None, false)
        .await
        .unwrap();

    h.orchestrator.discard_migration(draft.id).await.unwrap();
    assert!(matches!(
        h.orchestrator.get_migration(draft.id).await,
        Err(EngineError::NotFound(_))
    ));
    assert_eq!(history(&h, pro.id).await.len(), 1);

    // Draft rollback is refused
    let another = h
        .orchestrator
        .create_migration_plan(h.actor, analysis.id, None, false)
        .await
        .unwrap();
    assert!(matches!(
        h.orchestrator.rollback(h.actor, another.id).await,
        Err(EngineError::RollbackUnavailable {
            status: MigrationStatus::Draft
        })
    ));

    // Once started, a migration can no longer be discarded
    h.orchestrator
        .execute_migration(h.actor, another.id)
        .await
        .unwrap();
    assert!(matches!(
        h.orchestrator.discard_migration(another.id).await,
        Err(EngineError::InvalidTransition { .. })
    ));
}

#[tokio::test]
async fn test_stale_analysis_cannot_be_planned() {
    let pro = plan("Pro", 20, 10);
    let h = harness(vec![pro.clone()], vec![subscription(&pro, 1)], 0);

    let analysis = h
        .orchestrator
        .analyze_pricing_change(h.actor, pro.id, usd(30), &AnalysisOptions::default())
        .await
        .unwrap();

    h.plans.insert(pro.with_price(usd(22)));
    let err = h
        .orchestrator
        .create_migration_plan(h.actor, analysis.id, None, false)
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::InvalidMutation(_)));
}

// ============================================================================
// Ledger Outages During Migrations
// ============================================================================

#[tokio::test]
async fn test_unrecorded_step_leaves_migration_untouched() {
    let (h, basic, _team, _over, migration_id) = seat_cut_migration(0).await;
    let before = h.orchestrator.get_migration(migration_id).await.unwrap();

    h.ledger.set_unavailable(true);
    let err = h
        .orchestrator
        .execute_migration(h.actor, migration_id)
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::StorageUnavailable(_)));
    assert_eq!(h.orchestrator.get_migration(migration_id).await.unwrap(), before);
    h.ledger.set_unavailable(false);

    h.orchestrator
        .execute_migration_to_completion(h.actor, migration_id)
        .await
        .unwrap();
    assert_eq!(
        kinds(&h, basic.id).await,
        vec![
            "impact_analysis",
            "migration_execution",
            "migration_execution",
            "migration_execution",
            "migration_execution",
        ]
    );
}

#[tokio::test]
async fn test_unrecorded_apply_restores_plan_state() {
    let (h, basic, team, over, migration_id) = seat_cut_migration(0).await;
    let before = h.subs.bindings();

    // notify, grace period start
    h.orchestrator.execute_migration(h.actor, migration_id).await.unwrap();
    h.orchestrator.execute_migration(h.actor, migration_id).await.unwrap();

    h.ledger.set_unavailable(true);
    let err = h
        .orchestrator
        .execute_migration(h.actor, migration_id)
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::StorageUnavailable(_)));
    assert_eq!(h.plans.snapshot(basic.id), Some(basic.clone()));
    assert_eq!(h.subs.bindings(), before);
    let stored = h.orchestrator.get_migration(migration_id).await.unwrap();
    assert_eq!(
        stored.next_step().map(|s| s.kind),
        Some(StepKind::ApplyChange)
    );
    h.ledger.set_unavailable(false);

    let done = h
        .orchestrator
        .execute_migration_to_completion(h.actor, migration_id)
        .await
        .unwrap();
    assert_eq!(done.status, MigrationStatus::Completed);
    assert_eq!(h.subs.bindings()[&over.id], team.id);
}

#[tokio::test]
async fn test_unrecorded_rollback_can_be_retried() {
    let (h, basic, team, over, migration_id) = seat_cut_migration(0).await;
    let before = h.subs.bindings();
    let done = h
        .orchestrator
        .execute_migration_to_completion(h.actor, migration_id)
        .await
        .unwrap();

    h.ledger.set_unavailable(true);
    let err = h
        .orchestrator
        .rollback(h.actor, migration_id)
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::StorageUnavailable(_)));

    // Still completed, still applied
    assert_eq!(h.orchestrator.get_migration(migration_id).await.unwrap(), done);
    assert_eq!(h.plans.snapshot(basic.id), Some(done.proposed_plan.clone()));
    assert_eq!(h.subs.bindings()[&over.id], team.id);
    h.ledger.set_unavailable(false);

    let record = h.orchestrator.rollback(h.actor, migration_id).await.unwrap();
    assert_eq!(record.entry.kind(), "rollback");
    assert_eq!(h.plans.snapshot(basic.id), Some(basic.clone()));
    assert_eq!(h.subs.bindings(), before);
    assert_eq!(kinds(&h, basic.id).await.last(), Some(&"rollback"));
}

// ============================================================================
// Concurrent Migration Calls
// ============================================================================

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_apply_racing_rollback_ends_consistent() {
    let (h, basic, _team, _over, migration_id) = seat_cut_migration(0).await;
    let before = h.subs.bindings();

    // notify, grace period start; apply is next
    h.orchestrator.execute_migration(h.actor, migration_id).await.unwrap();
    h.orchestrator.execute_migration(h.actor, migration_id).await.unwrap();

    let start = Arc::new(Barrier::new(2));
    let apply = {
        let orchestrator = h.orchestrator.clone();
        let start = start.clone();
        let actor = h.actor;
        tokio::spawn(async move {
            start.wait().await;
            orchestrator.execute_migration(actor, migration_id).await
        })
    };
    let rollback = {
        let orchestrator = h.orchestrator.clone();
        let start = start.clone();
        let actor = h.actor;
        tokio::spawn(async move {
            start.wait().await;
            orchestrator.rollback(actor, migration_id).await
        })
    };

    let applied = apply.await.unwrap();
    rollback.await.unwrap().unwrap();

    // Either apply ran first and was undone, or it found the migration rolled back
    if let Err(err) = applied {
        assert!(matches!(
            err,
            EngineError::InvalidTransition {
                from: MigrationStatus::RolledBack,
                ..
            }
        ));
    }
    let stored = h.orchestrator.get_migration(migration_id).await.unwrap();
    assert_eq!(stored.status, MigrationStatus::RolledBack);
    assert_eq!(h.plans.snapshot(basic.id), Some(basic.clone()));
    assert_eq!(h.subs.bindings(), before);
}
