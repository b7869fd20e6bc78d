//! In-memory ledger and migration store

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use async_trait::async_trait;
use futures::stream::{self, BoxStream, StreamExt};
use planguard_shared::{AnalysisId, ChangeRecordId, MigrationId, PlanId};
use time::OffsetDateTime;

use super::{ChangeLedger, ChangeRecord, LedgerEntry, MigrationStore, NewChangeRecord};
use crate::error::{EngineError, EngineResult};
use crate::impact::ImpactAnalysis;
use crate::migration::{MigrationPlan, MigrationStatus};

fn poisoned() -> EngineError {
    EngineError::StorageUnavailable("in-memory ledger lock poisoned".to_string())
}

type PlanLog = Arc<Mutex<Vec<ChangeRecord>>>;

/// Ledger keeping one locked log per plan
#[derive(Default)]
pub struct InMemoryChangeLedger {
    logs: RwLock<HashMap<PlanId, PlanLog>>,
    /// Analysis id -> (plan, sequence)
    analyses: RwLock<HashMap<AnalysisId, (PlanId, u64)>>,
    unavailable: AtomicBool,
}

impl InMemoryChangeLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every call fail with `StorageUnavailable` until switched back
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    fn check_available(&self) -> EngineResult<()> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(EngineError::StorageUnavailable(
                "ledger is unavailable".to_string(),
            ));
        }
        Ok(())
    }

    fn log_for(&self, plan_id: PlanId) -> EngineResult<PlanLog> {
        if let Some(log) = self.logs.read().map_err(|_| poisoned())?.get(&plan_id) {
            return Ok(log.clone());
        }
        let mut logs = self.logs.write().map_err(|_| poisoned())?;
        Ok(logs.entry(plan_id).or_default().clone())
    }

    fn existing_log(&self, plan_id: PlanId) -> EngineResult<Option<PlanLog>> {
        Ok(self
            .logs
            .read()
            .map_err(|_| poisoned())?
            .get(&plan_id)
            .cloned())
    }

    /// Total records across all plans
    pub fn len(&self) -> usize {
        self.logs
            .read()
            .map(|logs| {
                logs.values()
                    .map(|log| log.lock().map(|l| l.len()).unwrap_or(0))
                    .sum()
            })
            .unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Assign the next sequence and store the record without yielding
    fn append_now(&self, record: NewChangeRecord) -> EngineResult<ChangeRecord> {
        self.check_available()?;
        let log = self.log_for(record.plan_id)?;
        let mut log = log.lock().map_err(|_| poisoned())?;

        let stored = ChangeRecord {
            id: ChangeRecordId::new(),
            plan_id: record.plan_id,
            sequence: log.len() as u64 + 1,
            actor_id: record.actor_id,
            recorded_at: OffsetDateTime::now_utc(),
            entry: record.entry,
        };

        if let Some(analysis_id) = stored.entry.analysis_id() {
            self.analyses
                .write()
                .map_err(|_| poisoned())?
                .insert(analysis_id, (stored.plan_id, stored.sequence));
        }
        log.push(stored.clone());

        tracing::debug!(
            plan_id = %stored.plan_id,
            sequence = stored.sequence,
            kind = stored.entry.kind(),
            "Ledger record appended"
        );
        Ok(stored)
    }
}

#[async_trait]
impl ChangeLedger for InMemoryChangeLedger {
    async fn append(&self, record: NewChangeRecord) -> EngineResult<ChangeRecord> {
        self.append_now(record)
    }

    fn history_after(
        &self,
        plan_id: PlanId,
        after: u64,
    ) -> BoxStream<'_, EngineResult<ChangeRecord>> {
        let snapshot = self.check_available().and_then(|_| {
            let Some(log) = self.existing_log(plan_id)? else {
                return Ok(Vec::new());
            };
            let log = log.lock().map_err(|_| poisoned())?;
            Ok(log.iter().filter(|r| r.sequence > after).cloned().collect())
        });

        match snapshot {
            Ok(records) => stream::iter(records.into_iter().map(Ok)).boxed(),
            Err(e) => stream::once(async move { Err(e) }).boxed(),
        }
    }

    async fn latest(&self, plan_id: PlanId) -> EngineResult<Option<ChangeRecord>> {
        self.check_available()?;
        let Some(log) = self.existing_log(plan_id)? else {
            return Ok(None);
        };
        let log = log.lock().map_err(|_| poisoned())?;
        Ok(log.last().cloned())
    }

    async fn find_analysis(&self, id: AnalysisId) -> EngineResult<ImpactAnalysis> {
        self.check_available()?;
        let not_found = || EngineError::NotFound(format!("impact analysis {}", id));
        let (plan_id, sequence) = self
            .analyses
            .read()
            .map_err(|_| poisoned())?
            .get(&id)
            .copied()
            .ok_or_else(not_found)?;

        let log = self.existing_log(plan_id)?.ok_or_else(not_found)?;
        let log = log.lock().map_err(|_| poisoned())?;
        match log.get((sequence - 1) as usize).map(|r| &r.entry) {
            Some(LedgerEntry::ImpactAnalysis(analysis)) => Ok((**analysis).clone()),
            _ => Err(not_found()),
        }
    }
}

/// Migration store keyed by id with version checks under a single lock.
///
/// Step and rollback records go to `ledger` while that lock is held.
pub struct InMemoryMigrationStore {
    plans: RwLock<HashMap<MigrationId, MigrationPlan>>,
    ledger: Arc<InMemoryChangeLedger>,
}

impl InMemoryMigrationStore {
    pub fn new(ledger: Arc<InMemoryChangeLedger>) -> Self {
        Self {
            plans: RwLock::new(HashMap::new()),
            ledger,
        }
    }
}

fn check_version(
    plans: &HashMap<MigrationId, MigrationPlan>,
    id: MigrationId,
    expected_version: u64,
) -> EngineResult<()> {
    let stored = plans
        .get(&id)
        .ok_or_else(|| EngineError::NotFound(format!("migration {}", id)))?;
    if stored.version != expected_version {
        return Err(EngineError::ConcurrentModification(format!(
            "migration {} is at version {}, expected {}",
            id, stored.version, expected_version
        )));
    }
    Ok(())
}

#[async_trait]
impl MigrationStore for InMemoryMigrationStore {
    async fn insert(&self, plan: &MigrationPlan) -> EngineResult<()> {
        let mut plans = self.plans.write().map_err(|_| poisoned())?;
        if plans.contains_key(&plan.id) {
            return Err(EngineError::ConcurrentModification(format!(
                "migration {} already exists",
                plan.id
            )));
        }
        plans.insert(plan.id, plan.clone());
        Ok(())
    }

    async fn get(&self, id: MigrationId) -> EngineResult<MigrationPlan> {
        self.plans
            .read()
            .map_err(|_| poisoned())?
            .get(&id)
            .cloned()
            .ok_or_else(|| EngineError::NotFound(format!("migration {}", id)))
    }

    async fn update(&self, plan: &MigrationPlan, expected_version: u64) -> EngineResult<()> {
        let mut plans = self.plans.write().map_err(|_| poisoned())?;
        check_version(&plans, plan.id, expected_version)?;
        plans.insert(plan.id, plan.clone());
        Ok(())
    }

    async fn update_and_append(
        &self,
        plan: &MigrationPlan,
        expected_version: u64,
        record: NewChangeRecord,
    ) -> EngineResult<ChangeRecord> {
        let mut plans = self.plans.write().map_err(|_| poisoned())?;
        check_version(&plans, plan.id, expected_version)?;
        let stored = self.ledger.append_now(record)?;
        plans.insert(plan.id, plan.clone());
        Ok(stored)
    }

    async fn discard(&self, id: MigrationId) -> EngineResult<()> {
        let mut plans = self.plans.write().map_err(|_| poisoned())?;
        let stored = plans
            .get(&id)
            .ok_or_else(|| EngineError::NotFound(format!("migration {}", id)))?;
        if stored.status != MigrationStatus::Draft {
            return Err(EngineError::InvalidTransition {
                from: stored.status,
                action: "discard",
            });
        }
        plans.remove(&id);
        Ok(())
    }
}
