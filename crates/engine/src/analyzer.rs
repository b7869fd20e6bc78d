//! Impact Analyzer
//!
//! Scans every subscription bound to a plan and computes what a proposed
//! mutation would do to it: monthly revenue delta, limit exceedance, lost
//! features and a recommended action.
//!
//! ## Scan model
//!
//! The population is split into shards that are streamed concurrently and
//! consumed page by page. Cancellation and the caller's deadline are checked
//! between pages. Any failure aborts the whole scan: partial results are
//! never returned, since they would understate the impact.

use std::collections::BTreeMap;
use std::sync::Arc;

use futures::future::try_join_all;
use futures::StreamExt;
use planguard_shared::{validate_limits, BillingState, Plan, PlanState, Subscription};
use rust_decimal::Decimal;
use time::OffsetDateTime;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::config::EngineConfig;
use crate::error::{EngineError, EngineResult};
use crate::impact::{
    AffectedSubscription, ChangeType, ImpactMetrics, ImpactScan, PlanDiff, RecommendedAction,
};
use crate::repository::{Shard, SubscriptionRepository};

/// Caller-controlled limits on a single analysis
#[derive(Debug, Clone, Default)]
pub struct AnalysisOptions {
    pub deadline: Option<Instant>,
    pub cancel: CancellationToken,
}

impl AnalysisOptions {
    pub fn with_deadline(deadline: Instant) -> Self {
        Self {
            deadline: Some(deadline),
            ..Self::default()
        }
    }

    pub fn with_timeout(timeout: std::time::Duration) -> Self {
        Self::with_deadline(Instant::now() + timeout)
    }

    pub fn with_cancellation(cancel: CancellationToken) -> Self {
        Self {
            cancel,
            ..Self::default()
        }
    }

    /// Fail fast if the caller gave up or ran out of time
    pub fn checkpoint(&self) -> EngineResult<()> {
        if self.cancel.is_cancelled() {
            return Err(EngineError::Cancelled);
        }
        if let Some(deadline) = self.deadline {
            if Instant::now() >= deadline {
                return Err(EngineError::DeadlineExceeded);
            }
        }
        Ok(())
    }
}

/// Tunables for the per-subscription evaluation
#[derive(Debug, Clone)]
pub struct AnalyzerSettings {
    pub shard_count: usize,
    pub page_size: usize,
    pub price_increase_tolerance_pct: Decimal,
    pub grandfather_min_tenure: time::Duration,
}

impl Default for AnalyzerSettings {
    fn default() -> Self {
        Self::from(&EngineConfig::default())
    }
}

impl From<&EngineConfig> for AnalyzerSettings {
    fn from(config: &EngineConfig) -> Self {
        Self {
            shard_count: config.analysis_shard_count.max(1),
            page_size: config.analysis_page_size.max(1),
            price_increase_tolerance_pct: config.price_increase_tolerance_pct,
            grandfather_min_tenure: config.grandfather_min_tenure,
        }
    }
}

/// Check that `proposed` is a legal hypothetical mutation of `current`
pub fn validate_mutation(
    current: &Plan,
    proposed: &Plan,
    change_type: ChangeType,
) -> EngineResult<()> {
    if !current.state.is_analyzable() {
        return Err(EngineError::InvalidMutation(format!(
            "plan {} is {}; only active or deprecated plans can be analyzed",
            current.id, current.state
        )));
    }
    if proposed.id != current.id {
        return Err(EngineError::InvalidMutation(format!(
            "proposed plan id {} does not match plan {}",
            proposed.id, current.id
        )));
    }
    if proposed.price.currency != current.price.currency {
        return Err(EngineError::InvalidMutation(format!(
            "currency change {} -> {} is not supported",
            current.price.currency, proposed.price.currency
        )));
    }
    proposed.price.validate()?;
    validate_limits(&proposed.limits)?;

    let disables = proposed.state == PlanState::Disabled;
    if disables != (change_type == ChangeType::Disable) {
        return Err(EngineError::InvalidMutation(format!(
            "{} analysis cannot be used with a proposed plan state of {}",
            change_type, proposed.state
        )));
    }
    Ok(())
}

/// Accumulator for one shard; combined with [`PartialImpact::merge`]
#[derive(Debug, Default)]
struct PartialImpact {
    affected: Vec<AffectedSubscription>,
    metrics: ImpactMetrics,
}

impl PartialImpact {
    fn push(&mut self, affected: AffectedSubscription) {
        self.metrics.record(&affected);
        self.affected.push(affected);
    }

    fn merge(mut self, other: PartialImpact) -> Self {
        self.affected.extend(other.affected);
        self.metrics = self.metrics.merge(other.metrics);
        self
    }
}

/// Everything needed to evaluate one subscription, shared by all shards
struct Evaluation<'a> {
    current: &'a Plan,
    proposed: &'a Plan,
    diff: &'a PlanDiff,
    disable: bool,
    current_monthly: Decimal,
    proposed_monthly: Decimal,
    tolerance: Decimal,
    grandfather_min_tenure: time::Duration,
    now: OffsetDateTime,
}

impl Evaluation<'_> {
    /// Impact on one subscription, or `None` when it is untouched.
    ///
    /// Canceled subscriptions are never affected. A disable affects every
    /// other subscription, paused and past-due ones included, since they stay
    /// bound to the plan and must be moved off it.
    fn evaluate(&self, sub: &Subscription) -> Option<AffectedSubscription> {
        if sub.is_canceled() {
            return None;
        }

        let revenue_delta = if self.disable {
            -self.current_monthly
        } else {
            self.proposed_monthly - self.current_monthly
        };

        let mut limit_exceedance = BTreeMap::new();
        for (name, ceiling) in self.diff.tightened_limits() {
            let used = sub.usage_of(name);
            if used > ceiling {
                limit_exceedance.insert(name.clone(), used - ceiling);
            }
        }

        // Without telemetry every removed feature counts as lost
        let required_features = sub
            .feature_usage
            .clone()
            .unwrap_or_else(|| self.current.features.clone());
        let lost_features: Vec<String> = self
            .diff
            .removed_features
            .intersection(&required_features)
            .cloned()
            .collect();

        let touched = self.disable
            || !revenue_delta.is_zero()
            || !limit_exceedance.is_empty()
            || !lost_features.is_empty();
        if !touched {
            return None;
        }

        let recommended_action = if self.disable
            || !limit_exceedance.is_empty()
            || !lost_features.is_empty()
        {
            RecommendedAction::Migrate
        } else if revenue_delta > self.tolerance {
            if sub.billing_state == BillingState::PastDue {
                RecommendedAction::Downgrade
            } else if sub.tenure(self.now) >= self.grandfather_min_tenure {
                RecommendedAction::Grandfather
            } else {
                RecommendedAction::Upgrade
            }
        } else {
            RecommendedAction::NoAction
        };

        Some(AffectedSubscription {
            subscription_id: sub.id,
            workspace_id: sub.workspace_id,
            limit_exceedance,
            revenue_delta,
            lost_features,
            recommended_action,
            usage: sub.usage.clone(),
            required_features,
        })
    }
}

/// Computes per-subscription deltas for a proposed plan mutation
#[derive(Clone)]
pub struct ImpactAnalyzer {
    subscriptions: Arc<dyn SubscriptionRepository>,
    settings: AnalyzerSettings,
}

impl ImpactAnalyzer {
    pub fn new(subscriptions: Arc<dyn SubscriptionRepository>, settings: AnalyzerSettings) -> Self {
        Self {
            subscriptions,
            settings,
        }
    }

    /// Scan the plan's population. The result is not yet risk-classified.
    pub async fn scan(
        &self,
        current: &Plan,
        proposed: &Plan,
        change_type: ChangeType,
        options: &AnalysisOptions,
    ) -> EngineResult<ImpactScan> {
        validate_mutation(current, proposed, change_type)?;
        options.checkpoint()?;

        let diff = PlanDiff::between(current, proposed);
        let current_monthly = current.price.monthly_equivalent();
        let evaluation = Evaluation {
            current,
            proposed,
            diff: &diff,
            disable: change_type == ChangeType::Disable,
            current_monthly,
            proposed_monthly: proposed.price.monthly_equivalent(),
            tolerance: current_monthly * self.settings.price_increase_tolerance_pct
                / Decimal::from(100),
            grandfather_min_tenure: self.settings.grandfather_min_tenure,
            now: OffsetDateTime::now_utc(),
        };

        let shards = Shard::all(self.settings.shard_count)
            .map(|shard| self.scan_shard(&evaluation, shard, options));
        let work = try_join_all(shards);

        let partials = match options.deadline {
            Some(deadline) => tokio::time::timeout_at(deadline, work)
                .await
                .map_err(|_| EngineError::DeadlineExceeded)??,
            None => work.await?,
        };

        let PartialImpact {
            mut affected,
            metrics,
        } = partials
            .into_iter()
            .fold(PartialImpact::default(), PartialImpact::merge);

        affected.sort_by(|a, b| {
            b.revenue_delta
                .abs()
                .cmp(&a.revenue_delta.abs())
                .then_with(|| a.subscription_id.cmp(&b.subscription_id))
        });

        tracing::debug!(
            plan_id = %current.id,
            change_type = %change_type,
            affected = metrics.affected_count,
            revenue_delta = %metrics.total_revenue_delta,
            "Impact scan finished"
        );

        Ok(ImpactScan {
            change_type,
            current_plan: current.clone(),
            proposed_plan: evaluation.proposed.clone(),
            diff,
            affected,
            metrics,
        })
    }

    async fn scan_shard(
        &self,
        evaluation: &Evaluation<'_>,
        shard: Shard,
        options: &AnalysisOptions,
    ) -> EngineResult<PartialImpact> {
        let mut partial = PartialImpact::default();
        let mut pages = self
            .subscriptions
            .list_by_plan(evaluation.current.id, shard)
            .chunks(self.settings.page_size);

        while let Some(page) = pages.next().await {
            options.checkpoint()?;
            for item in page {
                if let Some(affected) = evaluation.evaluate(&item?) {
                    partial.push(affected);
                }
            }
        }

        Ok(partial)
    }
}
