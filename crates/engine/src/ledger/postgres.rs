//! Postgres-backed ledger and migration store
//!
//! Sequence numbers come from the `ledger_sequences` counter row, bumped in
//! the same transaction as the insert. A failed insert rolls the counter back
//! with it, so numbers stay gap-free. `UNIQUE (plan_id, sequence)` backs this up.
//!
//! `PgMigrationStore` must point at the same database as the ledger: its
//! `update_and_append` writes the migration row and the ledger row in one
//! transaction.

use async_trait::async_trait;
use futures::stream::{self, BoxStream, StreamExt, TryStreamExt};
use planguard_shared::{
    create_pool, run_migrations, ActorId, AnalysisId, ChangeRecordId, MigrationId, PlanId,
};
use sqlx::{PgPool, Postgres, Transaction};
use time::OffsetDateTime;
use uuid::Uuid;

use super::{ChangeLedger, ChangeRecord, LedgerEntry, MigrationStore, NewChangeRecord};
use crate::config::EngineConfig;
use crate::error::{EngineError, EngineResult};
use crate::impact::ImpactAnalysis;
use crate::migration::{MigrationPlan, MigrationStatus};

/// Rows fetched per round trip when streaming history
const HISTORY_PAGE_SIZE: i64 = 200;

/// Open a pool for `DATABASE_URL` and apply the embedded migrations
pub async fn connect(config: &EngineConfig) -> EngineResult<PgPool> {
    let url = config
        .require_database_url()
        .map_err(|e| EngineError::StorageUnavailable(e.to_string()))?;
    let pool = create_pool(url, config.database_max_connections).await?;
    run_migrations(&pool).await?;
    tracing::info!("Change ledger database ready");
    Ok(pool)
}

#[derive(sqlx::FromRow)]
struct LedgerRow {
    id: Uuid,
    plan_id: Uuid,
    sequence: i64,
    actor_id: Uuid,
    recorded_at: OffsetDateTime,
    entry: serde_json::Value,
}

impl TryFrom<LedgerRow> for ChangeRecord {
    type Error = EngineError;

    fn try_from(row: LedgerRow) -> Result<Self, Self::Error> {
        Ok(ChangeRecord {
            id: ChangeRecordId(row.id),
            plan_id: PlanId(row.plan_id),
            sequence: row.sequence as u64,
            actor_id: ActorId(row.actor_id),
            recorded_at: row.recorded_at,
            entry: serde_json::from_value(row.entry)?,
        })
    }
}

#[derive(Clone)]
pub struct PgChangeLedger {
    pool: PgPool,
}

impl PgChangeLedger {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Next page after `cursor`; the returned cursor is `None` once exhausted
    async fn next_page(
        &self,
        plan_id: PlanId,
        cursor: Option<i64>,
    ) -> EngineResult<Option<(Vec<ChangeRecord>, Option<i64>)>> {
        let Some(cursor) = cursor else {
            return Ok(None);
        };

        let rows: Vec<LedgerRow> = sqlx::query_as(
            r#"
            SELECT id, plan_id, sequence, actor_id, recorded_at, entry
            FROM change_ledger
            WHERE plan_id = $1 AND sequence > $2
            ORDER BY sequence ASC
            LIMIT $3
            "#,
        )
        .bind(plan_id.0)
        .bind(cursor)
        .bind(HISTORY_PAGE_SIZE)
        .fetch_all(&self.pool)
        .await?;

        if rows.is_empty() {
            return Ok(None);
        }
        let next = if rows.len() as i64 == HISTORY_PAGE_SIZE {
            rows.last().map(|r| r.sequence)
        } else {
            None
        };
        let records = rows
            .into_iter()
            .map(ChangeRecord::try_from)
            .collect::<EngineResult<Vec<_>>>()?;
        Ok(Some((records, next)))
    }
}

/// Bump the plan's counter and insert the record inside `tx`
async fn append_in_tx(
    tx: &mut Transaction<'_, Postgres>,
    record: NewChangeRecord,
) -> EngineResult<ChangeRecord> {
    let entry = serde_json::to_value(&record.entry)?;
    let id = ChangeRecordId::new();

    let (sequence,): (i64,) = sqlx::query_as(
        r#"
        INSERT INTO ledger_sequences (plan_id, last_sequence)
        VALUES ($1, 1)
        ON CONFLICT (plan_id) DO UPDATE SET
            last_sequence = ledger_sequences.last_sequence + 1
        RETURNING last_sequence
        "#,
    )
    .bind(record.plan_id.0)
    .fetch_one(&mut **tx)
    .await?;

    let (recorded_at,): (OffsetDateTime,) = sqlx::query_as(
        r#"
        INSERT INTO change_ledger (id, plan_id, sequence, actor_id, kind, analysis_id, entry)
        VALUES ($1, $2, $3, $4, $5, $6, $7)
        RETURNING recorded_at
        "#,
    )
    .bind(id.0)
    .bind(record.plan_id.0)
    .bind(sequence)
    .bind(record.actor_id.0)
    .bind(record.entry.kind())
    .bind(record.entry.analysis_id().map(|a| a.0))
    .bind(&entry)
    .fetch_one(&mut **tx)
    .await?;

    Ok(ChangeRecord {
        id,
        plan_id: record.plan_id,
        sequence: sequence as u64,
        actor_id: record.actor_id,
        recorded_at,
        entry: record.entry,
    })
}

#[async_trait]
impl ChangeLedger for PgChangeLedger {
    async fn append(&self, record: NewChangeRecord) -> EngineResult<ChangeRecord> {
        let mut tx = self.pool.begin().await?;
        let stored = append_in_tx(&mut tx, record).await?;
        tx.commit().await?;

        tracing::debug!(
            plan_id = %stored.plan_id,
            sequence = stored.sequence,
            kind = stored.entry.kind(),
            "Ledger record appended"
        );
        Ok(stored)
    }

    fn history_after(
        &self,
        plan_id: PlanId,
        after: u64,
    ) -> BoxStream<'_, EngineResult<ChangeRecord>> {
        stream::try_unfold(Some(after as i64), move |cursor| async move {
            self.next_page(plan_id, cursor).await.map(|page| {
                page.map(|(records, next)| {
                    (
                        stream::iter(records.into_iter().map(Ok::<_, EngineError>)),
                        next,
                    )
                })
            })
        })
        .try_flatten()
        .boxed()
    }

    async fn latest(&self, plan_id: PlanId) -> EngineResult<Option<ChangeRecord>> {
        let row: Option<LedgerRow> = sqlx::query_as(
            r#"
            SELECT id, plan_id, sequence, actor_id, recorded_at, entry
            FROM change_ledger
            WHERE plan_id = $1
            ORDER BY sequence DESC
            LIMIT 1
            "#,
        )
        .bind(plan_id.0)
        .fetch_optional(&self.pool)
        .await?;

        row.map(ChangeRecord::try_from).transpose()
    }

    async fn find_analysis(&self, id: AnalysisId) -> EngineResult<ImpactAnalysis> {
        let row: Option<LedgerRow> = sqlx::query_as(
            r#"
            SELECT id, plan_id, sequence, actor_id, recorded_at, entry
            FROM change_ledger
            WHERE analysis_id = $1
            "#,
        )
        .bind(id.0)
        .fetch_optional(&self.pool)
        .await?;

        let record = row
            .map(ChangeRecord::try_from)
            .transpose()?
            .ok_or_else(|| EngineError::NotFound(format!("impact analysis {}", id)))?;
        match record.entry {
            LedgerEntry::ImpactAnalysis(analysis) => Ok(*analysis),
            other => Err(EngineError::StorageUnavailable(format!(
                "ledger row for analysis {} holds a {} entry",
                id,
                other.kind()
            ))),
        }
    }
}

#[derive(Clone)]
pub struct PgMigrationStore {
    pool: PgPool,
}

impl PgMigrationStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    async fn exists(&self, id: MigrationId) -> EngineResult<bool> {
        let (exists,): (bool,) =
            sqlx::query_as("SELECT EXISTS (SELECT 1 FROM migration_plans WHERE id = $1)")
                .bind(id.0)
                .fetch_one(&self.pool)
                .await?;
        Ok(exists)
    }

    /// Compare-and-swap write of the plan body. The caller's transaction is
    /// left uncommitted; on a version mismatch it is dropped and rolls back.
    async fn update_in_tx(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        plan: &MigrationPlan,
        expected_version: u64,
    ) -> EngineResult<()> {
        let body = serde_json::to_value(plan)?;
        let result = sqlx::query(
            r#"
            UPDATE migration_plans SET
                status = $2,
                version = $3,
                body = $4,
                updated_at = $5
            WHERE id = $1 AND version = $6
            "#,
        )
        .bind(plan.id.0)
        .bind(plan.status.to_string())
        .bind(plan.version as i64)
        .bind(&body)
        .bind(plan.updated_at)
        .bind(expected_version as i64)
        .execute(&mut **tx)
        .await?;

        if result.rows_affected() == 0 {
            if self.exists(plan.id).await? {
                return Err(EngineError::ConcurrentModification(format!(
                    "migration {} is no longer at version {}",
                    plan.id, expected_version
                )));
            }
            return Err(EngineError::NotFound(format!("migration {}", plan.id)));
        }
        Ok(())
    }
}

#[async_trait]
impl MigrationStore for PgMigrationStore {
    async fn insert(&self, plan: &MigrationPlan) -> EngineResult<()> {
        let body = serde_json::to_value(plan)?;
        sqlx::query(
            r#"
            INSERT INTO migration_plans (id, plan_id, impact_id, status, version, body, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            "#,
        )
        .bind(plan.id.0)
        .bind(plan.plan_id.0)
        .bind(plan.impact_id.0)
        .bind(plan.status.to_string())
        .bind(plan.version as i64)
        .bind(&body)
        .bind(plan.created_at)
        .bind(plan.updated_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get(&self, id: MigrationId) -> EngineResult<MigrationPlan> {
        let row: Option<(serde_json::Value,)> =
            sqlx::query_as("SELECT body FROM migration_plans WHERE id = $1")
                .bind(id.0)
                .fetch_optional(&self.pool)
                .await?;

        let (body,) = row.ok_or_else(|| EngineError::NotFound(format!("migration {}", id)))?;
        Ok(serde_json::from_value(body)?)
    }

    async fn update(&self, plan: &MigrationPlan, expected_version: u64) -> EngineResult<()> {
        let mut tx = self.pool.begin().await?;
        self.update_in_tx(&mut tx, plan, expected_version).await?;
        tx.commit().await?;
        Ok(())
    }

    async fn update_and_append(
        &self,
        plan: &MigrationPlan,
        expected_version: u64,
        record: NewChangeRecord,
    ) -> EngineResult<ChangeRecord> {
        let mut tx = self.pool.begin().await?;
        self.update_in_tx(&mut tx, plan, expected_version).await?;
        let stored = append_in_tx(&mut tx, record).await?;
        tx.commit().await?;

        tracing::debug!(
            migration_id = %plan.id,
            plan_id = %stored.plan_id,
            sequence = stored.sequence,
            kind = stored.entry.kind(),
            "Migration state recorded"
        );
        Ok(stored)
    }

    async fn discard(&self, id: MigrationId) -> EngineResult<()> {
        let result = sqlx::query("DELETE FROM migration_plans WHERE id = $1 AND status = $2")
            .bind(id.0)
            .bind(MigrationStatus::Draft.to_string())
            .execute(&self.pool)
            .await?;

        if result.rows_affected() == 0 {
            let stored = self.get(id).await?;
            return Err(EngineError::InvalidTransition {
                from: stored.status,
                action: "discard",
            });
        }
        Ok(())
    }
}

/// A ledger invariant that does not hold in storage
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConsistencyIssue {
    pub plan_id: PlanId,
    pub issue: String,
}

/// Check every plan's ledger for sequence gaps and counter drift
pub async fn verify_consistency(pool: &PgPool) -> EngineResult<Vec<ConsistencyIssue>> {
    let mut issues = Vec::new();

    let gaps: Vec<(Uuid, i64, i64)> = sqlx::query_as(
        r#"
        SELECT plan_id, COUNT(*), MAX(sequence)
        FROM change_ledger
        GROUP BY plan_id
        HAVING COUNT(*) <> MAX(sequence) OR MIN(sequence) <> 1
        "#,
    )
    .fetch_all(pool)
    .await?;
    for (plan_id, count, max) in gaps {
        issues.push(ConsistencyIssue {
            plan_id: PlanId(plan_id),
            issue: format!("{} records but highest sequence is {}", count, max),
        });
    }

    let drift: Vec<(Uuid, i64, Option<i64>)> = sqlx::query_as(
        r#"
        SELECT s.plan_id, s.last_sequence, MAX(l.sequence)
        FROM ledger_sequences s
        LEFT JOIN change_ledger l ON l.plan_id = s.plan_id
        GROUP BY s.plan_id, s.last_sequence
        HAVING s.last_sequence <> COALESCE(MAX(l.sequence), 0)
        "#,
    )
    .fetch_all(pool)
    .await?;
    for (plan_id, counter, max) in drift {
        issues.push(ConsistencyIssue {
            plan_id: PlanId(plan_id),
            issue: format!(
                "sequence counter at {} but highest stored sequence is {}",
                counter,
                max.unwrap_or(0)
            ),
        });
    }

    Ok(issues)
}
