//! # PostgreSQL Storage Engine
//!
//! `sqlx` implementation of [`StorageEngine`] over the tables created by
//! `migrations/`. Every claim selects candidate rows `FOR UPDATE SKIP LOCKED`
//! and flips `isQueued` in the same statement or transaction, so concurrent
//! controllers never block on each other and never claim a row twice.
//!
//! Status updates are applied by the `process_step_run_updates()` SQL
//! function, which returns a JSON summary that is mapped into
//! [`StepRunUpdateResult`].

use super::{
    AssignmentCommit, CommitOutcome, PlannedAssignment, ProcessedRange, QueueTable, ReapResult,
    StepRunUpdateResult, StorageEngine,
};
use crate::config::DatabaseConfig;
use crate::constants::StepRunStatus;
use crate::error::{SchedulerError, SchedulerResult};
use crate::models::{
    CompletedWorkflowRun, InternalQueue, NewInternalQueueItem, NewQueueItem, Priority, QueueItem,
    StepRunForEngine, WorkerSlots,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use std::collections::{HashMap, HashSet};
use std::time::Duration;
use tracing::{debug, error, info, instrument};
use uuid::Uuid;

pub static MIGRATOR: sqlx::migrate::Migrator = sqlx::migrate!("./migrations");

const STEP_RUN_ENGINE_COLUMNS: &str = r#"
    sr."id" AS id,
    sr."tenantId" AS tenant_id,
    sr."jobRunId" AS job_run_id,
    sr."workflowRunId" AS workflow_run_id,
    sr."actionId" AS action_id,
    sr."status" AS status,
    (SELECT COUNT(*) FROM "StepRunOrder" o WHERE o."parentId" = sr."id") AS child_count,
    sr."retryCount" AS retry_count
"#;

#[derive(Debug, sqlx::FromRow)]
struct StepRunEngineRow {
    id: Uuid,
    tenant_id: Uuid,
    job_run_id: Uuid,
    workflow_run_id: Uuid,
    action_id: String,
    status: String,
    child_count: i64,
    retry_count: i32,
}

impl TryFrom<StepRunEngineRow> for StepRunForEngine {
    type Error = SchedulerError;

    fn try_from(row: StepRunEngineRow) -> Result<Self, Self::Error> {
        let status = row
            .status
            .parse::<StepRunStatus>()
            .map_err(SchedulerError::Database)?;

        Ok(StepRunForEngine {
            id: row.id,
            tenant_id: row.tenant_id,
            job_run_id: row.job_run_id,
            workflow_run_id: row.workflow_run_id,
            action_id: row.action_id,
            status,
            child_count: row.child_count,
            retry_count: row.retry_count,
        })
    }
}

#[derive(Debug, sqlx::FromRow)]
struct QueueItemRow {
    id: i64,
    tenant_id: Uuid,
    queue: String,
    priority: i32,
    step_run_id: Uuid,
    action_id: String,
    schedule_timeout_at: Option<DateTime<Utc>>,
    step_timeout: Option<String>,
    desired_worker_id: Option<Uuid>,
    sticky: Option<String>,
    is_queued: bool,
}

impl TryFrom<QueueItemRow> for QueueItem {
    type Error = SchedulerError;

    fn try_from(row: QueueItemRow) -> Result<Self, Self::Error> {
        Ok(QueueItem {
            id: row.id,
            tenant_id: row.tenant_id,
            queue: row.queue,
            priority: Priority::new(row.priority)?,
            step_run_id: row.step_run_id,
            action_id: row.action_id,
            schedule_timeout_at: row.schedule_timeout_at,
            step_timeout: row.step_timeout,
            desired_worker_id: row.desired_worker_id,
            sticky: row.sticky.as_deref().map(str::parse).transpose()?,
            queued: row.is_queued,
        })
    }
}

#[derive(Debug, sqlx::FromRow)]
struct WorkerSlotsRow {
    worker_id: Uuid,
    dispatcher_id: Uuid,
    available_slots: i32,
    actions: Vec<String>,
}

#[derive(Debug, sqlx::FromRow)]
struct WorkerCapacityRow {
    id: Uuid,
    available: i64,
}

#[derive(Debug, sqlx::FromRow)]
struct MinMaxRow {
    min_id: Option<i64>,
    max_id: Option<i64>,
}

/// JSON summary returned by `process_step_run_updates()`
#[derive(Debug, Deserialize)]
struct UpdateSummary {
    #[serde(default)]
    succeeded_step_run_ids: Vec<Uuid>,
    #[serde(default)]
    completed_workflow_runs: Vec<CompletedWorkflowRun>,
    #[serde(default)]
    should_continue: bool,
}

fn db_error(context: &'static str) -> impl FnOnce(sqlx::Error) -> SchedulerError {
    move |e| {
        error!(error = %e, "{context}");
        SchedulerError::Database(format!("{context}: {e}"))
    }
}

/// Row limits bind as `integer`; anything wider is a caller error.
fn sql_limit(limit: usize) -> SchedulerResult<i32> {
    i32::try_from(limit)
        .map_err(|_| SchedulerError::Validation(format!("limit {limit} exceeds {}", i32::MAX)))
}

/// PostgreSQL-backed storage engine
#[derive(Debug, Clone)]
pub struct PostgresStorage {
    pool: PgPool,
}

impl PostgresStorage {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Open a pool sized from configuration.
    pub async fn connect(config: &DatabaseConfig) -> SchedulerResult<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .acquire_timeout(config.acquire_timeout())
            .connect(&config.url)
            .await
            .map_err(db_error("Failed to connect to database"))?;

        info!(max_connections = config.max_connections, "Connected scheduler storage pool");
        Ok(Self::new(pool))
    }

    pub async fn migrate(&self) -> SchedulerResult<()> {
        MIGRATOR
            .run(&self.pool)
            .await
            .map_err(|e| SchedulerError::Database(format!("Migration failed: {e}")))
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    async fn fetch_engine_rows(&self, ids: &[Uuid], exclude_final: bool) -> SchedulerResult<Vec<StepRunForEngine>> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }

        let query = format!(
            r#"
            SELECT {STEP_RUN_ENGINE_COLUMNS}
            FROM "StepRun" sr
            WHERE sr."id" = ANY($1::uuid[])
                AND (NOT $2::boolean OR sr."status" NOT IN ('SUCCEEDED', 'FAILED', 'CANCELLED', 'CANCELLING'))
            ORDER BY array_position($1::uuid[], sr."id")
            "#
        );

        let rows = sqlx::query_as::<_, StepRunEngineRow>(&query)
            .bind(ids)
            .bind(exclude_final)
            .fetch_all(&self.pool)
            .await
            .map_err(db_error("Failed to load step runs"))?;

        rows.into_iter().map(StepRunForEngine::try_from).collect()
    }

    async fn apply_updates(
        &self,
        tenant_id: Uuid,
        queue: InternalQueue,
        limit: usize,
    ) -> SchedulerResult<StepRunUpdateResult> {
        let summary: serde_json::Value =
            sqlx::query_scalar("SELECT process_step_run_updates($1::uuid, $2::text, $3::integer)")
                .bind(tenant_id)
                .bind(queue.as_str())
                .bind(sql_limit(limit)?)
                .fetch_one(&self.pool)
                .await
                .map_err(db_error("Failed to process step run updates"))?;

        let summary: UpdateSummary = serde_json::from_value(summary)?;
        let succeeded_step_runs = self.fetch_engine_rows(&summary.succeeded_step_run_ids, false).await?;

        debug!(
            tenant_id = %tenant_id,
            queue = queue.as_str(),
            succeeded = succeeded_step_runs.len(),
            completed_workflows = summary.completed_workflow_runs.len(),
            "Applied step run updates"
        );

        Ok(StepRunUpdateResult {
            succeeded_step_runs,
            completed_workflow_runs: summary.completed_workflow_runs,
            should_continue: summary.should_continue,
        })
    }
}

#[async_trait]
impl StorageEngine for PostgresStorage {
    async fn list_tenants_by_partition(&self, partition_id: &str) -> SchedulerResult<Vec<Uuid>> {
        sqlx::query_scalar(r#"SELECT "id" FROM "Tenant" WHERE "controllerPartitionId" = $1 ORDER BY "id""#)
            .bind(partition_id)
            .fetch_all(&self.pool)
            .await
            .map_err(db_error("Failed to list tenants"))
    }

    async fn list_queues(&self, tenant_id: Uuid) -> SchedulerResult<Vec<String>> {
        sqlx::query_scalar(
            r#"
            SELECT "name"
            FROM "Queue"
            WHERE "tenantId" = $1::uuid
                AND "lastActive" > NOW() - INTERVAL '1 day'
            ORDER BY "name"
            "#,
        )
        .bind(tenant_id)
        .fetch_all(&self.pool)
        .await
        .map_err(db_error("Failed to list queues"))
    }

    #[instrument(skip(self), fields(tenant_id = %tenant_id))]
    async fn list_queue_items(
        &self,
        tenant_id: Uuid,
        queue: &str,
        limit: usize,
    ) -> SchedulerResult<Vec<QueueItem>> {
        let rows = sqlx::query_as::<_, QueueItemRow>(
            r#"
            SELECT
                qi."id" AS id,
                qi."tenantId" AS tenant_id,
                qi."queue" AS queue,
                qi."priority" AS priority,
                qi."stepRunId" AS step_run_id,
                qi."actionId" AS action_id,
                qi."scheduleTimeoutAt" AS schedule_timeout_at,
                qi."stepTimeout" AS step_timeout,
                qi."desiredWorkerId" AS desired_worker_id,
                qi."sticky" AS sticky,
                qi."isQueued" AS is_queued
            FROM "QueueItem" qi
            WHERE qi."isQueued" = true
                AND qi."tenantId" = $1::uuid
                AND qi."queue" = $2::text
                AND qi."priority" >= 1 AND qi."priority" <= 4
            ORDER BY qi."priority" DESC, qi."id" ASC
            LIMIT $3::integer
            "#,
        )
        .bind(tenant_id)
        .bind(queue)
        .bind(sql_limit(limit)?)
        .fetch_all(&self.pool)
        .await
        .map_err(db_error("Failed to list queue items"))?;

        rows.into_iter().map(QueueItem::try_from).collect()
    }

    async fn list_available_slots(
        &self,
        tenant_id: Uuid,
        heartbeat_window: Duration,
    ) -> SchedulerResult<Vec<WorkerSlots>> {
        let rows = sqlx::query_as::<_, WorkerSlotsRow>(
            r#"
            WITH filled AS (
                SELECT "workerId", COUNT("stepRunId") AS "filledSlots"
                FROM "SemaphoreQueueItem"
                WHERE "tenantId" = $1::uuid
                GROUP BY "workerId"
            )
            SELECT
                w."id" AS worker_id,
                w."dispatcherId" AS dispatcher_id,
                (w."maxRuns" - COALESCE(f."filledSlots", 0))::integer AS available_slots,
                ARRAY(
                    SELECT wa."actionId" FROM "WorkerAction" wa
                    WHERE wa."workerId" = w."id"
                    ORDER BY wa."actionId"
                ) AS actions
            FROM "Worker" w
            LEFT JOIN filled f ON f."workerId" = w."id"
            WHERE w."tenantId" = $1::uuid
                AND w."dispatcherId" IS NOT NULL
                AND w."lastHeartbeatAt" > NOW() - make_interval(secs => $2::double precision)
                AND w."isActive" = true
                AND w."isPaused" = false
                AND w."maxRuns" - COALESCE(f."filledSlots", 0) > 0
            ORDER BY w."id"
            "#,
        )
        .bind(tenant_id)
        .bind(heartbeat_window.as_secs_f64())
        .fetch_all(&self.pool)
        .await
        .map_err(db_error("Failed to list available worker slots"))?;

        Ok(rows
            .into_iter()
            .map(|row| WorkerSlots {
                worker_id: row.worker_id,
                dispatcher_id: row.dispatcher_id,
                available_slots: row.available_slots,
                actions: row.actions,
            })
            .collect())
    }

    #[instrument(skip(self, commit), fields(tenant_id = %tenant_id))]
    async fn commit_assignments(
        &self,
        tenant_id: Uuid,
        commit: AssignmentCommit,
    ) -> SchedulerResult<CommitOutcome> {
        let mut outcome = CommitOutcome::default();
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(db_error("Failed to begin assignment transaction"))?;

        if !commit.scheduling_timed_out.is_empty() {
            let ids: Vec<i64> = commit.scheduling_timed_out.iter().map(|t| t.queue_item_id).collect();
            let claimed: Vec<(i64, Uuid)> = sqlx::query_as(
                r#"
                WITH locked AS (
                    SELECT "id" FROM "QueueItem"
                    WHERE "id" = ANY($1::bigint[]) AND "tenantId" = $2::uuid AND "isQueued" = true
                    FOR UPDATE SKIP LOCKED
                )
                UPDATE "QueueItem" qi
                SET "isQueued" = false
                FROM locked
                WHERE qi."id" = locked."id"
                RETURNING qi."id", qi."stepRunId"
                "#,
            )
            .bind(&ids)
            .bind(tenant_id)
            .fetch_all(&mut *tx)
            .await
            .map_err(db_error("Failed to claim scheduling-timed-out queue items"))?;

            let claimed_ids: HashSet<i64> = claimed.iter().map(|(id, _)| *id).collect();
            outcome.scheduling_timed_out = claimed.into_iter().map(|(_, step_run_id)| step_run_id).collect();
            outcome.lost.extend(ids.into_iter().filter(|id| !claimed_ids.contains(id)));
        }

        if !commit.assignments.is_empty() {
            let mut worker_ids: Vec<Uuid> = commit.assignments.iter().map(|a| a.worker_id).collect();
            worker_ids.sort();
            worker_ids.dedup();

            // Row locks on the workers serialize concurrent passes over the same capacity.
            let capacity_rows = sqlx::query_as::<_, WorkerCapacityRow>(
                r#"
                SELECT
                    w."id" AS id,
                    w."maxRuns" - (
                        SELECT COUNT(*) FROM "SemaphoreQueueItem" s WHERE s."workerId" = w."id"
                    ) AS available
                FROM "Worker" w
                WHERE w."id" = ANY($1::uuid[])
                    AND w."tenantId" = $2::uuid
                    AND w."isActive" = true
                    AND w."isPaused" = false
                    AND w."dispatcherId" IS NOT NULL
                ORDER BY w."id"
                FOR UPDATE OF w
                "#,
            )
            .bind(&worker_ids)
            .bind(tenant_id)
            .fetch_all(&mut *tx)
            .await
            .map_err(db_error("Failed to lock worker capacity"))?;

            let mut capacity: HashMap<Uuid, i64> =
                capacity_rows.into_iter().map(|row| (row.id, row.available)).collect();

            let item_ids: Vec<i64> = commit.assignments.iter().map(|a| a.queue_item_id).collect();
            let lockable: HashSet<i64> = sqlx::query_scalar::<_, i64>(
                r#"
                SELECT "id" FROM "QueueItem"
                WHERE "id" = ANY($1::bigint[]) AND "tenantId" = $2::uuid AND "isQueued" = true
                FOR UPDATE SKIP LOCKED
                "#,
            )
            .bind(&item_ids)
            .bind(tenant_id)
            .fetch_all(&mut *tx)
            .await
            .map_err(db_error("Failed to lock queue items"))?
            .into_iter()
            .collect();

            let mut accepted: Vec<PlannedAssignment> = Vec::new();
            for assignment in commit.assignments {
                if !lockable.contains(&assignment.queue_item_id) {
                    outcome.lost.push(assignment.queue_item_id);
                    continue;
                }
                match capacity.get_mut(&assignment.worker_id) {
                    Some(available) if *available > 0 => {
                        *available -= 1;
                        accepted.push(assignment);
                    }
                    _ => outcome.rejected.push(assignment.queue_item_id),
                }
            }

            if !accepted.is_empty() {
                let accepted_items: Vec<i64> = accepted.iter().map(|a| a.queue_item_id).collect();
                let step_run_ids: Vec<Uuid> = accepted.iter().map(|a| a.step_run_id).collect();
                let accepted_workers: Vec<Uuid> = accepted.iter().map(|a| a.worker_id).collect();

                sqlx::query(r#"UPDATE "QueueItem" SET "isQueued" = false WHERE "id" = ANY($1::bigint[])"#)
                    .bind(&accepted_items)
                    .execute(&mut *tx)
                    .await
                    .map_err(db_error("Failed to mark queue items assigned"))?;

                sqlx::query(
                    r#"
                    INSERT INTO "SemaphoreQueueItem" ("stepRunId", "workerId", "tenantId")
                    SELECT u.step_run_id, u.worker_id, $3::uuid
                    FROM unnest($1::uuid[], $2::uuid[]) AS u(step_run_id, worker_id)
                    ON CONFLICT ("stepRunId") DO UPDATE SET "workerId" = EXCLUDED."workerId"
                    "#,
                )
                .bind(&step_run_ids)
                .bind(&accepted_workers)
                .bind(tenant_id)
                .execute(&mut *tx)
                .await
                .map_err(db_error("Failed to record slot claims"))?;

                sqlx::query(
                    r#"
                    UPDATE "StepRun" sr
                    SET "status" = 'ASSIGNED', "workerId" = u.worker_id
                    FROM unnest($1::uuid[], $2::uuid[]) AS u(step_run_id, worker_id)
                    WHERE sr."id" = u.step_run_id
                    "#,
                )
                .bind(&step_run_ids)
                .bind(&accepted_workers)
                .execute(&mut *tx)
                .await
                .map_err(db_error("Failed to mark step runs assigned"))?;
            }

            outcome.assigned = accepted;
        }

        tx.commit()
            .await
            .map_err(db_error("Failed to commit assignment transaction"))?;

        Ok(outcome)
    }

    async fn process_step_run_updates(
        &self,
        tenant_id: Uuid,
        limit: usize,
    ) -> SchedulerResult<StepRunUpdateResult> {
        self.apply_updates(tenant_id, InternalQueue::StepRunUpdate, limit).await
    }

    async fn process_step_run_updates_v2(
        &self,
        tenant_id: Uuid,
        limit: usize,
    ) -> SchedulerResult<StepRunUpdateResult> {
        self.apply_updates(tenant_id, InternalQueue::StepRunUpdateV2, limit).await
    }

    async fn list_startable_step_runs(
        &self,
        tenant_id: Uuid,
        job_run_id: Uuid,
        parent_step_run_id: Option<Uuid>,
    ) -> SchedulerResult<Vec<StepRunForEngine>> {
        let query = format!(
            r#"
            SELECT {STEP_RUN_ENGINE_COLUMNS}
            FROM "StepRun" sr
            WHERE sr."tenantId" = $1::uuid
                AND sr."jobRunId" = $2::uuid
                AND sr."status" = 'PENDING'
                AND (
                    $3::uuid IS NULL OR EXISTS (
                        SELECT 1 FROM "StepRunOrder" o
                        WHERE o."childId" = sr."id" AND o."parentId" = $3::uuid
                    )
                )
                AND NOT EXISTS (
                    SELECT 1
                    FROM "StepRunOrder" o
                    JOIN "StepRun" parent ON parent."id" = o."parentId"
                    WHERE o."childId" = sr."id" AND parent."status" <> 'SUCCEEDED'
                )
            ORDER BY sr."id"
            "#
        );

        let rows = sqlx::query_as::<_, StepRunEngineRow>(&query)
            .bind(tenant_id)
            .bind(job_run_id)
            .bind(parent_step_run_id)
            .fetch_all(&self.pool)
            .await
            .map_err(db_error("Failed to list startable step runs"))?;

        rows.into_iter().map(StepRunForEngine::try_from).collect()
    }

    async fn list_step_runs_to_timeout(
        &self,
        tenant_id: Uuid,
        limit: usize,
    ) -> SchedulerResult<ReapResult<StepRunForEngine>> {
        let popped: Vec<Uuid> = sqlx::query_scalar(
            r#"
            WITH qis AS (
                SELECT "id", "stepRunId"
                FROM "TimeoutQueueItem"
                WHERE "isQueued" = true
                    AND "tenantId" = $1::uuid
                    AND "timeoutAt" <= NOW()
                ORDER BY "timeoutAt" ASC
                LIMIT $2::integer
                FOR UPDATE SKIP LOCKED
            )
            UPDATE "TimeoutQueueItem" qi
            SET "isQueued" = false
            FROM qis
            WHERE qi."id" = qis."id"
            RETURNING qis."stepRunId"
            "#,
        )
        .bind(tenant_id)
        .bind(sql_limit(limit)?)
        .fetch_all(&self.pool)
        .await
        .map_err(db_error("Failed to pop timeout queue items"))?;

        let should_continue = popped.len() == limit;
        let items = self.fetch_engine_rows(&popped, true).await?;
        Ok(ReapResult { items, should_continue })
    }

    async fn list_step_runs_to_retry(
        &self,
        tenant_id: Uuid,
        limit: usize,
    ) -> SchedulerResult<ReapResult<StepRunForEngine>> {
        let popped: Vec<Uuid> = sqlx::query_scalar(
            r#"
            WITH retries AS (
                SELECT "id", "stepRunId"
                FROM "RetryQueueItem" rqi
                WHERE rqi."isQueued" = true
                    AND rqi."tenantId" = $1::uuid
                    AND rqi."retryAfter" <= NOW()
                ORDER BY rqi."retryAfter" ASC
                LIMIT $2::integer
                FOR UPDATE SKIP LOCKED
            )
            UPDATE "RetryQueueItem" rqi
            SET "isQueued" = false
            FROM retries
            WHERE rqi."id" = retries."id"
            RETURNING retries."stepRunId"
            "#,
        )
        .bind(tenant_id)
        .bind(sql_limit(limit)?)
        .fetch_all(&self.pool)
        .await
        .map_err(db_error("Failed to pop retry queue items"))?;

        let should_continue = popped.len() == limit;
        let items = self.fetch_engine_rows(&popped, true).await?;
        Ok(ReapResult { items, should_continue })
    }

    async fn get_min_max_processed(
        &self,
        tenant_id: Uuid,
        table: QueueTable,
    ) -> SchedulerResult<Option<ProcessedRange>> {
        let query = format!(
            r#"
            SELECT MIN("id") AS min_id, MAX("id") AS max_id
            FROM "{}"
            WHERE "isQueued" = false AND "tenantId" = $1::uuid
            "#,
            table.table_name()
        );

        let row = sqlx::query_as::<_, MinMaxRow>(&query)
            .bind(tenant_id)
            .fetch_one(&self.pool)
            .await
            .map_err(db_error("Failed to read processed id range"))?;

        Ok(match (row.min_id, row.max_id) {
            (Some(min_id), Some(max_id)) => Some(ProcessedRange { min_id, max_id }),
            _ => None,
        })
    }

    async fn cleanup_processed(
        &self,
        tenant_id: Uuid,
        table: QueueTable,
        min_id: i64,
        max_id: i64,
    ) -> SchedulerResult<u64> {
        let query = format!(
            r#"
            DELETE FROM "{}"
            WHERE "isQueued" = false
                AND "id" >= $1::bigint
                AND "id" <= $2::bigint
                AND "tenantId" = $3::uuid
            "#,
            table.table_name()
        );

        let result = sqlx::query(&query)
            .bind(min_id)
            .bind(max_id)
            .bind(tenant_id)
            .execute(&self.pool)
            .await
            .map_err(db_error("Failed to clean up processed queue items"))?;

        Ok(result.rows_affected())
    }

    async fn create_queue_items_bulk(&self, items: Vec<NewQueueItem>) -> SchedulerResult<Vec<i64>> {
        if items.is_empty() {
            return Ok(Vec::new());
        }

        let mut tenant_ids = Vec::with_capacity(items.len());
        let mut queues = Vec::with_capacity(items.len());
        let mut priorities = Vec::with_capacity(items.len());
        let mut step_run_ids = Vec::with_capacity(items.len());
        let mut action_ids = Vec::with_capacity(items.len());
        let mut schedule_timeouts: Vec<Option<DateTime<Utc>>> = Vec::with_capacity(items.len());
        let mut step_timeouts: Vec<Option<String>> = Vec::with_capacity(items.len());
        let mut desired_workers: Vec<Option<Uuid>> = Vec::with_capacity(items.len());
        let mut stickies: Vec<Option<String>> = Vec::with_capacity(items.len());

        for item in items {
            tenant_ids.push(item.tenant_id);
            queues.push(item.queue);
            priorities.push(item.priority.value());
            step_run_ids.push(item.step_run_id);
            action_ids.push(item.action_id);
            schedule_timeouts.push(item.schedule_timeout_at);
            step_timeouts.push(item.step_timeout);
            desired_workers.push(item.desired_worker_id);
            stickies.push(item.sticky.map(|s| s.as_str().to_string()));
        }

        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(db_error("Failed to begin queue item transaction"))?;

        sqlx::query(
            r#"
            INSERT INTO "Queue" ("tenantId", "name", "lastActive")
            SELECT DISTINCT u.tenant_id, u.name, NOW()
            FROM unnest($1::uuid[], $2::text[]) AS u(tenant_id, name)
            ON CONFLICT ("tenantId", "name") DO UPDATE SET "lastActive" = NOW()
            "#,
        )
        .bind(&tenant_ids)
        .bind(&queues)
        .execute(&mut *tx)
        .await
        .map_err(db_error("Failed to upsert queues"))?;

        let ids: Vec<i64> = sqlx::query_scalar(
            r#"
            INSERT INTO "QueueItem" (
                "tenantId", "queue", "priority", "stepRunId", "actionId",
                "scheduleTimeoutAt", "stepTimeout", "desiredWorkerId", "sticky", "isQueued"
            )
            SELECT
                u.tenant_id, u.queue, u.priority, u.step_run_id, u.action_id,
                u.schedule_timeout_at, u.step_timeout, u.desired_worker_id, u.sticky, true
            FROM unnest(
                $1::uuid[], $2::text[], $3::integer[], $4::uuid[], $5::text[],
                $6::timestamptz[], $7::text[], $8::uuid[], $9::text[]
            ) WITH ORDINALITY AS u(
                tenant_id, queue, priority, step_run_id, action_id,
                schedule_timeout_at, step_timeout, desired_worker_id, sticky, ord
            )
            ORDER BY u.ord
            RETURNING "id"
            "#,
        )
        .bind(&tenant_ids)
        .bind(&queues)
        .bind(&priorities)
        .bind(&step_run_ids)
        .bind(&action_ids)
        .bind(&schedule_timeouts)
        .bind(&step_timeouts)
        .bind(&desired_workers)
        .bind(&stickies)
        .fetch_all(&mut *tx)
        .await
        .map_err(db_error("Failed to insert queue items"))?;

        tx.commit()
            .await
            .map_err(db_error("Failed to commit queue items"))?;

        Ok(ids)
    }

    async fn create_internal_queue_items_bulk(
        &self,
        items: Vec<NewInternalQueueItem>,
    ) -> SchedulerResult<Vec<i64>> {
        if items.is_empty() {
            return Ok(Vec::new());
        }

        let mut queues = Vec::with_capacity(items.len());
        let mut datas = Vec::with_capacity(items.len());
        let mut tenant_ids = Vec::with_capacity(items.len());
        let mut priorities = Vec::with_capacity(items.len());
        let mut unique_keys: Vec<Option<String>> = Vec::with_capacity(items.len());

        for item in items {
            queues.push(item.queue.as_str().to_string());
            datas.push(item.data);
            tenant_ids.push(item.tenant_id);
            priorities.push(item.priority.value());
            unique_keys.push(item.unique_key);
        }

        sqlx::query_scalar(
            r#"
            INSERT INTO "InternalQueueItem" ("queue", "isQueued", "data", "tenantId", "priority", "uniqueKey")
            SELECT u.queue, true, u.data, u.tenant_id, u.priority, u.unique_key
            FROM unnest($1::text[], $2::jsonb[], $3::uuid[], $4::integer[], $5::text[])
                WITH ORDINALITY AS u(queue, data, tenant_id, priority, unique_key, ord)
            ORDER BY u.ord
            ON CONFLICT DO NOTHING
            RETURNING "id"
            "#,
        )
        .bind(&queues)
        .bind(&datas)
        .bind(&tenant_ids)
        .bind(&priorities)
        .bind(&unique_keys)
        .fetch_all(&self.pool)
        .await
        .map_err(db_error("Failed to insert internal queue items"))
    }

    async fn create_timeout_queue_item(
        &self,
        tenant_id: Uuid,
        step_run_id: Uuid,
        retry_count: i32,
        timeout_at: DateTime<Utc>,
    ) -> SchedulerResult<i64> {
        sqlx::query_scalar(
            r#"
            INSERT INTO "TimeoutQueueItem" ("stepRunId", "retryCount", "timeoutAt", "tenantId", "isQueued")
            VALUES ($1::uuid, $2::integer, $3::timestamptz, $4::uuid, true)
            ON CONFLICT ("stepRunId", "retryCount") DO UPDATE
            SET "timeoutAt" = EXCLUDED."timeoutAt", "isQueued" = true
            RETURNING "id"
            "#,
        )
        .bind(step_run_id)
        .bind(retry_count)
        .bind(timeout_at)
        .bind(tenant_id)
        .fetch_one(&self.pool)
        .await
        .map_err(db_error("Failed to create timeout queue item"))
    }

    async fn create_retry_queue_item(
        &self,
        tenant_id: Uuid,
        step_run_id: Uuid,
        retry_after: DateTime<Utc>,
    ) -> SchedulerResult<i64> {
        sqlx::query_scalar(
            r#"
            INSERT INTO "RetryQueueItem" ("retryAfter", "stepRunId", "tenantId", "isQueued")
            VALUES ($1::timestamptz, $2::uuid, $3::uuid, true)
            RETURNING "id"
            "#,
        )
        .bind(retry_after)
        .bind(step_run_id)
        .bind(tenant_id)
        .fetch_one(&self.pool)
        .await
        .map_err(db_error("Failed to create retry queue item"))
    }
}
