//! In-memory plan and subscription stores
//!
//! Used by tests and by hosts that embed the engine against fixtures. Both
//! stores are thread-safe and hand out snapshots, never references into the map.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::RwLock;

use async_trait::async_trait;
use futures::stream::{self, BoxStream, StreamExt};
use planguard_shared::{Plan, PlanId, PlanState, Subscription, SubscriptionId};

use crate::error::{EngineError, EngineResult};
use crate::repository::{PlanRepository, Shard, SubscriptionRepository};

fn poisoned() -> EngineError {
    EngineError::StorageUnavailable("in-memory store lock poisoned".to_string())
}

/// Thread-safe in-memory plan store
#[derive(Default)]
pub struct InMemoryPlanRepository {
    plans: RwLock<HashMap<PlanId, Plan>>,
}

impl InMemoryPlanRepository {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_plans(plans: impl IntoIterator<Item = Plan>) -> Self {
        let repo = Self::new();
        for plan in plans {
            repo.insert(plan);
        }
        repo
    }

    pub fn insert(&self, plan: Plan) {
        if let Ok(mut plans) = self.plans.write() {
            plans.insert(plan.id, plan);
        }
    }

    /// Snapshot of a stored plan, if present
    pub fn snapshot(&self, id: PlanId) -> Option<Plan> {
        self.plans.read().ok()?.get(&id).cloned()
    }
}

#[async_trait]
impl PlanRepository for InMemoryPlanRepository {
    async fn get(&self, id: PlanId) -> EngineResult<Plan> {
        let plans = self.plans.read().map_err(|_| poisoned())?;
        plans
            .get(&id)
            .cloned()
            .ok_or_else(|| EngineError::NotFound(format!("plan {}", id)))
    }

    async fn list_candidate_alternatives(&self, currency: &str) -> EngineResult<Vec<Plan>> {
        let plans = self.plans.read().map_err(|_| poisoned())?;
        let mut candidates: Vec<Plan> = plans
            .values()
            .filter(|p| p.state == PlanState::Active && p.price.currency == currency)
            .cloned()
            .collect();
        candidates.sort_by_key(|p| p.id);
        Ok(candidates)
    }

    async fn save(&self, plan: &Plan) -> EngineResult<()> {
        let mut plans = self.plans.write().map_err(|_| poisoned())?;
        plans.insert(plan.id, plan.clone());
        Ok(())
    }
}

/// Thread-safe in-memory subscription store
#[derive(Default)]
pub struct InMemorySubscriptionRepository {
    subscriptions: RwLock<HashMap<SubscriptionId, Subscription>>,
    /// When set, listing streams fail after yielding this many subscriptions
    fail_listing_after: RwLock<Option<usize>>,
    listed: AtomicUsize,
}

impl InMemorySubscriptionRepository {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_subscriptions(subscriptions: impl IntoIterator<Item = Subscription>) -> Self {
        let repo = Self::new();
        for sub in subscriptions {
            repo.insert(sub);
        }
        repo
    }

    pub fn insert(&self, subscription: Subscription) {
        if let Ok(mut subs) = self.subscriptions.write() {
            subs.insert(subscription.id, subscription);
        }
    }

    /// Make every subsequent listing stream fail with `StorageUnavailable`
    /// after `count` items
    pub fn fail_listing_after(&self, count: Option<usize>) {
        if let Ok(mut fail) = self.fail_listing_after.write() {
            *fail = count;
        }
    }

    /// Total subscriptions handed out by listing streams so far
    pub fn listed_count(&self) -> usize {
        self.listed.load(Ordering::SeqCst)
    }

    /// Current plan binding of every stored subscription
    pub fn bindings(&self) -> HashMap<SubscriptionId, PlanId> {
        self.subscriptions
            .read()
            .map(|subs| subs.values().map(|s| (s.id, s.plan_id)).collect())
            .unwrap_or_default()
    }
}

#[async_trait]
impl SubscriptionRepository for InMemorySubscriptionRepository {
    fn list_by_plan(
        &self,
        plan_id: PlanId,
        shard: Shard,
    ) -> BoxStream<'_, EngineResult<Subscription>> {
        let snapshot = match self.subscriptions.read() {
            Ok(subs) => {
                let mut page: Vec<Subscription> = subs
                    .values()
                    .filter(|s| s.plan_id == plan_id && shard.contains(s.id))
                    .cloned()
                    .collect();
                page.sort_by_key(|s| s.id);
                page
            }
            Err(_) => return stream::once(async { Err(poisoned()) }).boxed(),
        };
        let fail_after = self.fail_listing_after.read().ok().and_then(|f| *f);

        stream::iter(snapshot.into_iter().enumerate())
            .map(move |(position, sub)| match fail_after {
                Some(limit) if position >= limit => Err(EngineError::StorageUnavailable(
                    "subscription listing interrupted".to_string(),
                )),
                _ => {
                    self.listed.fetch_add(1, Ordering::SeqCst);
                    Ok(sub)
                }
            })
            .boxed()
    }

    async fn get(&self, id: SubscriptionId) -> EngineResult<Subscription> {
        let subs = self.subscriptions.read().map_err(|_| poisoned())?;
        subs.get(&id)
            .cloned()
            .ok_or_else(|| EngineError::NotFound(format!("subscription {}", id)))
    }

    async fn rebind(&self, id: SubscriptionId, plan_id: PlanId) -> EngineResult<()> {
        let mut subs = self.subscriptions.write().map_err(|_| poisoned())?;
        let sub = subs
            .get_mut(&id)
            .ok_or_else(|| EngineError::NotFound(format!("subscription {}", id)))?;
        sub.plan_id = plan_id;
        Ok(())
    }
}
