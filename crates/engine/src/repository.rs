//! Collaborator contracts for the plan and subscription stores
//!
//! The engine never owns plan or subscription data. It reads both through these
//! traits and only writes through them when a migration applies or rolls back.

use async_trait::async_trait;
use futures::stream::BoxStream;
use planguard_shared::{Plan, PlanId, Subscription, SubscriptionId};

use crate::error::EngineResult;

/// One slice of a plan's subscription population.
///
/// Shards partition subscriptions by id so that `count` scans running side by
/// side see every subscription exactly once.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Shard {
    pub index: usize,
    pub count: usize,
}

impl Shard {
    /// The whole population as a single shard
    pub const ALL: Shard = Shard { index: 0, count: 1 };

    pub fn all(count: usize) -> impl Iterator<Item = Shard> {
        let count = count.max(1);
        (0..count).map(move |index| Shard { index, count })
    }

    pub fn contains(&self, id: SubscriptionId) -> bool {
        if self.count <= 1 {
            return true;
        }
        (id.0.as_u128() % self.count as u128) as usize == self.index
    }
}

/// Read/write access to subscriptions bound to plans
#[async_trait]
pub trait SubscriptionRepository: Send + Sync {
    /// Lazily stream every subscription bound to `plan_id` that falls in `shard`.
    ///
    /// The stream is finite and not resumable; a consumer that hits an error
    /// must start a new scan.
    fn list_by_plan(
        &self,
        plan_id: PlanId,
        shard: Shard,
    ) -> BoxStream<'_, EngineResult<Subscription>>;

    async fn get(&self, id: SubscriptionId) -> EngineResult<Subscription>;

    /// Move a subscription onto another plan
    async fn rebind(&self, id: SubscriptionId, plan_id: PlanId) -> EngineResult<()>;
}

/// Read/write access to plan definitions
#[async_trait]
pub trait PlanRepository: Send + Sync {
    async fn get(&self, id: PlanId) -> EngineResult<Plan>;

    /// Plans a subscriber could be moved to, restricted to one currency
    async fn list_candidate_alternatives(&self, currency: &str) -> EngineResult<Vec<Plan>>;

    /// Persist a plan definition, replacing the stored version
    async fn save(&self, plan: &Plan) -> EngineResult<()>;
}
