//! Change Ledger
//!
//! Append-only, per-plan ordered history of analyses, migration steps and
//! rollbacks, plus the versioned store that holds live migration plans.
//!
//! ## Sequencing
//!
//! Every plan has its own sequence starting at 1. Appends for the same plan
//! are serialized by the backend so numbers are strictly increasing, gap-free
//! and never reused. Appends for different plans never contend.
//!
//! ## Migration records
//!
//! Step and rollback records are written through
//! [`MigrationStore::update_and_append`], so the stored migration never gets
//! ahead of its history. The store and the ledger it appends to share one
//! backend: the Postgres store writes into the same database, the in-memory
//! store holds the in-memory ledger.

pub mod memory;
pub mod postgres;

use async_trait::async_trait;
use futures::stream::BoxStream;
use planguard_shared::{ActorId, AnalysisId, ChangeRecordId, MigrationId, PlanId};
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use crate::error::EngineResult;
use crate::impact::ImpactAnalysis;
use crate::migration::{MigrationPlan, RollbackDescriptor, StepKind};

pub use memory::{InMemoryChangeLedger, InMemoryMigrationStore};
pub use postgres::{connect, verify_consistency, ConsistencyIssue, PgChangeLedger, PgMigrationStore};

/// Payload of one ledger record
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum LedgerEntry {
    ImpactAnalysis(Box<ImpactAnalysis>),
    MigrationExecution {
        migration: Box<MigrationPlan>,
        step: StepKind,
    },
    Rollback {
        migration_id: MigrationId,
        restored: RollbackDescriptor,
    },
}

impl LedgerEntry {
    pub fn kind(&self) -> &'static str {
        match self {
            LedgerEntry::ImpactAnalysis(_) => "impact_analysis",
            LedgerEntry::MigrationExecution { .. } => "migration_execution",
            LedgerEntry::Rollback { .. } => "rollback",
        }
    }

    /// Id of the analysis this entry carries, if any
    pub fn analysis_id(&self) -> Option<AnalysisId> {
        match self {
            LedgerEntry::ImpactAnalysis(analysis) => Some(analysis.id),
            _ => None,
        }
    }
}

/// A record before the ledger assigns its identity and position
#[derive(Debug, Clone)]
pub struct NewChangeRecord {
    pub plan_id: PlanId,
    pub actor_id: ActorId,
    pub entry: LedgerEntry,
}

/// Immutable ledger record
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeRecord {
    pub id: ChangeRecordId,
    pub plan_id: PlanId,
    pub sequence: u64,
    pub actor_id: ActorId,
    pub recorded_at: OffsetDateTime,
    pub entry: LedgerEntry,
}

#[async_trait]
pub trait ChangeLedger: Send + Sync {
    /// Append a record, assigning the next sequence number for its plan
    async fn append(&self, record: NewChangeRecord) -> EngineResult<ChangeRecord>;

    /// Records of a plan with `sequence > after`, ascending.
    ///
    /// Lazy: storage is read as the stream is polled. Passing the last seen
    /// sequence resumes an interrupted read.
    fn history_after(&self, plan_id: PlanId, after: u64) -> BoxStream<'_, EngineResult<ChangeRecord>>;

    /// Full history of a plan, ascending by sequence. Each call starts over.
    fn history(&self, plan_id: PlanId) -> BoxStream<'_, EngineResult<ChangeRecord>> {
        self.history_after(plan_id, 0)
    }

    async fn latest(&self, plan_id: PlanId) -> EngineResult<Option<ChangeRecord>>;

    /// Stored analysis by id; `NotFound` when it was never appended
    async fn find_analysis(&self, id: AnalysisId) -> EngineResult<ImpactAnalysis>;
}

/// Versioned storage for live migration plans
#[async_trait]
pub trait MigrationStore: Send + Sync {
    async fn insert(&self, plan: &MigrationPlan) -> EngineResult<()>;

    async fn get(&self, id: MigrationId) -> EngineResult<MigrationPlan>;

    /// Replace the stored plan if its version is still `expected_version`;
    /// otherwise `ConcurrentModification`
    async fn update(&self, plan: &MigrationPlan, expected_version: u64) -> EngineResult<()>;

    /// `update` and a ledger append as one unit: either the new plan state
    /// and its record both land, or neither does.
    async fn update_and_append(
        &self,
        plan: &MigrationPlan,
        expected_version: u64,
        record: NewChangeRecord,
    ) -> EngineResult<ChangeRecord>;

    /// Drop a draft. Anything past draft is part of history and stays.
    async fn discard(&self, id: MigrationId) -> EngineResult<()>;
}
