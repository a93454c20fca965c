use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgRow;
use sqlx::{PgExecutor, PgPool, Row};
use tracing::debug;
use uuid::Uuid;

use crate::batch::{BatchRecord, BatchTransition};
use crate::job::{
    BatchId, ErrorEvent, ExecutionId, ExecutionRecord, JobId, JobRecord, JobStatus, NewJob,
    PriorityOrder, ProcessId,
};
use crate::process::ProcessRecord;
use crate::queue::{QueueFilter, QueueSnapshot};
use crate::settings::PAUSES_KEY;
use crate::store::{
    BatchStore, BeginExecution, ClaimRequest, ConcurrencyCount, FinishExecution, InsertOutcome,
    JobStore, ProcessStore, PurgeRequest, PurgeStats, SettingStore,
};

use super::lock::PgLockSession;

const JOB_COLUMNS: &str = "id, queue_name, priority, job_class, serialized_params, scheduled_at, \
    performed_at, finished_at, error, error_event, concurrency_key, labels, cron_key, cron_at, \
    batch_id, batch_callback_id, locked_by_id, locked_at, executions_count, created_at";

const EXECUTION_COLUMNS: &str = "id, job_id, job_class, queue_name, serialized_params, \
    scheduled_at, performed_at, finished_at, error, error_event, process_id, duration_ms, \
    retried_execution_id, created_at";

const BATCH_COLUMNS: &str = "id, description, serialized_properties, on_finish, on_success, \
    on_discard, callback_queue_name, callback_priority, enqueued_at, discarded_at, finished_at, \
    created_at";

// The job row's advisory lock id, matching `lock::lock_id(job_lock_key(id))`.
const JOB_LOCK_ID: &str = "('x' || substr(md5('quay_jobs-' || j.id::text), 1, 16))::bit(64)::bigint";

/// Postgres-backed store implementing every storage trait.
#[derive(Debug, Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Get a reference to the connection pool.
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

fn parse_event(value: Option<String>) -> anyhow::Result<Option<ErrorEvent>> {
    value.map(|value| value.parse()).transpose()
}

fn job_from_row(row: &PgRow) -> anyhow::Result<JobRecord> {
    Ok(JobRecord {
        id: JobId(row.try_get("id")?),
        queue_name: row.try_get("queue_name")?,
        priority: row.try_get("priority")?,
        job_class: row.try_get("job_class")?,
        serialized_params: row.try_get("serialized_params")?,
        scheduled_at: row.try_get("scheduled_at")?,
        performed_at: row.try_get("performed_at")?,
        finished_at: row.try_get("finished_at")?,
        error: row.try_get("error")?,
        error_event: parse_event(row.try_get("error_event")?)?,
        concurrency_key: row.try_get("concurrency_key")?,
        labels: row.try_get("labels")?,
        cron_key: row.try_get("cron_key")?,
        cron_at: row.try_get("cron_at")?,
        batch_id: row.try_get::<Option<Uuid>, _>("batch_id")?.map(BatchId),
        batch_callback_id: row
            .try_get::<Option<Uuid>, _>("batch_callback_id")?
            .map(BatchId),
        locked_by_id: row.try_get::<Option<Uuid>, _>("locked_by_id")?.map(ProcessId),
        locked_at: row.try_get("locked_at")?,
        executions_count: row.try_get("executions_count")?,
        created_at: row.try_get("created_at")?,
    })
}

fn execution_from_row(row: &PgRow) -> anyhow::Result<ExecutionRecord> {
    Ok(ExecutionRecord {
        id: ExecutionId(row.try_get("id")?),
        job_id: JobId(row.try_get("job_id")?),
        job_class: row.try_get("job_class")?,
        queue_name: row.try_get("queue_name")?,
        serialized_params: row.try_get("serialized_params")?,
        scheduled_at: row.try_get("scheduled_at")?,
        performed_at: row.try_get("performed_at")?,
        finished_at: row.try_get("finished_at")?,
        error: row.try_get("error")?,
        error_event: parse_event(row.try_get("error_event")?)?,
        process_id: row.try_get::<Option<Uuid>, _>("process_id")?.map(ProcessId),
        duration: row
            .try_get::<Option<i64>, _>("duration_ms")?
            .map(chrono::Duration::milliseconds),
        retried_execution_id: row
            .try_get::<Option<Uuid>, _>("retried_execution_id")?
            .map(ExecutionId),
        created_at: row.try_get("created_at")?,
    })
}

fn batch_from_row(row: &PgRow) -> anyhow::Result<BatchRecord> {
    Ok(BatchRecord {
        id: BatchId(row.try_get("id")?),
        description: row.try_get("description")?,
        serialized_properties: row.try_get("serialized_properties")?,
        on_finish: row.try_get("on_finish")?,
        on_success: row.try_get("on_success")?,
        on_discard: row.try_get("on_discard")?,
        callback_queue_name: row.try_get("callback_queue_name")?,
        callback_priority: row.try_get("callback_priority")?,
        enqueued_at: row.try_get("enqueued_at")?,
        discarded_at: row.try_get("discarded_at")?,
        finished_at: row.try_get("finished_at")?,
        created_at: row.try_get("created_at")?,
    })
}

fn process_from_row(row: &PgRow) -> anyhow::Result<ProcessRecord> {
    let pid: i64 = row.try_get("pid")?;
    Ok(ProcessRecord {
        id: ProcessId(row.try_get("id")?),
        hostname: row.try_get("hostname")?,
        pid: u32::try_from(pid)?,
        process_title: row.try_get("process_title")?,
        schedulers: row.try_get("schedulers")?,
        created_at: row.try_get("created_at")?,
        last_heartbeat_at: row.try_get("last_heartbeat_at")?,
    })
}

/// Filter kind and names as bound into queue-matching SQL.
fn filter_params(filter: &QueueFilter) -> (&'static str, Vec<String>) {
    let kind = match filter {
        QueueFilter::All => "all",
        QueueFilter::Include(_) => "include",
        QueueFilter::Exclude(_) => "exclude",
        QueueFilter::Ordered(_) => "ordered",
    };
    (kind, filter.names().to_vec())
}

// Binds the filter kind as $1 and the names as $2.
const QUEUE_MATCH: &str = r#"
    CASE $1
        WHEN 'include' THEN j.queue_name = ANY($2)
        WHEN 'ordered' THEN j.queue_name = ANY($2)
        WHEN 'exclude' THEN NOT (j.queue_name = ANY($2))
        ELSE TRUE
    END
"#;

async fn insert_on<'e, E: PgExecutor<'e>>(
    executor: E,
    job: NewJob,
) -> anyhow::Result<InsertOutcome> {
    let priority = job.effective_priority();
    let labels: Vec<String> = job.labels.into_iter().collect();
    let row = sqlx::query(&format!(
        r#"
        INSERT INTO quay_jobs (
            id, queue_name, priority, job_class, serialized_params, scheduled_at,
            concurrency_key, labels, cron_key, cron_at, batch_id, batch_callback_id,
            executions_count, created_at
        )
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, 0, NOW())
        ON CONFLICT (cron_key, cron_at) WHERE cron_key IS NOT NULL DO NOTHING
        RETURNING {JOB_COLUMNS}
        "#
    ))
    .bind(job.id.0)
    .bind(&job.queue_name)
    .bind(priority)
    .bind(&job.job_class)
    .bind(&job.serialized_params)
    .bind(job.scheduled_at)
    .bind(&job.concurrency_key)
    .bind(&labels)
    .bind(&job.cron_key)
    .bind(job.cron_at)
    .bind(job.batch_id.map(|id| id.0))
    .bind(job.batch_callback_id.map(|id| id.0))
    .fetch_optional(executor)
    .await?;

    match row {
        Some(row) => Ok(InsertOutcome::Inserted(job_from_row(&row)?)),
        None => {
            debug!(cron_key = ?job.cron_key, cron_at = ?job.cron_at, "cron job already enqueued");
            Ok(InsertOutcome::Duplicate)
        }
    }
}

#[async_trait]
impl JobStore for PgStore {
    type Session = PgLockSession;

    async fn session(&self) -> anyhow::Result<Self::Session> {
        Ok(PgLockSession::new(self.pool.acquire().await?))
    }

    async fn insert_job(&self, job: NewJob) -> anyhow::Result<InsertOutcome> {
        insert_on(&self.pool, job).await
    }

    async fn insert_jobs(&self, jobs: Vec<NewJob>) -> anyhow::Result<Vec<InsertOutcome>> {
        if jobs.is_empty() {
            return Ok(Vec::new());
        }

        let mut tx = self.pool.begin().await?;
        let mut out = Vec::with_capacity(jobs.len());
        for job in jobs {
            out.push(insert_on(&mut *tx, job).await?);
        }
        tx.commit().await?;
        Ok(out)
    }

    async fn find_job(&self, id: JobId) -> anyhow::Result<Option<JobRecord>> {
        let row = sqlx::query(&format!("SELECT {JOB_COLUMNS} FROM quay_jobs WHERE id = $1"))
            .bind(id.0)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(job_from_row).transpose()
    }

    async fn claim(
        &self,
        session: &mut Self::Session,
        request: &ClaimRequest,
    ) -> anyhow::Result<Vec<JobRecord>> {
        let (kind, names) = filter_params(&request.filter);
        let smaller_first = request.order == PriorityOrder::SmallerFirst;
        let select_limit = request
            .select_limit
            .map(i64::try_from)
            .transpose()?;
        let limit = i64::try_from(request.limit)?;

        // The candidate CTE is materialized so the lock function is only
        // evaluated on ranked candidates, in rank order, until `limit` rows
        // are locked.
        let rows = sqlx::query(&format!(
            r#"
            WITH pauses AS (
                SELECT
                    ARRAY(SELECT jsonb_array_elements_text(COALESCE(s.value -> 'queues', '[]'::jsonb))) AS queues,
                    ARRAY(SELECT jsonb_array_elements_text(COALESCE(s.value -> 'job_classes', '[]'::jsonb))) AS job_classes,
                    ARRAY(SELECT jsonb_array_elements_text(COALESCE(s.value -> 'labels', '[]'::jsonb))) AS labels
                FROM (SELECT (SELECT value FROM quay_settings WHERE key = $7) AS value) s
            ),
            candidates AS MATERIALIZED (
                SELECT j.*
                FROM quay_jobs j, pauses p
                WHERE j.finished_at IS NULL
                  AND (j.scheduled_at IS NULL OR j.scheduled_at <= $3)
                  AND {QUEUE_MATCH}
                  AND NOT (j.queue_name = ANY(p.queues))
                  AND NOT (j.job_class = ANY(p.job_classes))
                  AND NOT (j.labels && p.labels)
                ORDER BY
                    CASE WHEN $1 = 'ordered' THEN array_position($2, j.queue_name) ELSE 0 END,
                    CASE WHEN $4 THEN j.priority END ASC,
                    CASE WHEN NOT $4 THEN j.priority END DESC,
                    j.created_at,
                    j.id
                LIMIT $5
            )
            SELECT {JOB_COLUMNS}
            FROM candidates j
            WHERE pg_try_advisory_lock({JOB_LOCK_ID})
            LIMIT $6
            "#
        ))
        .bind(kind)
        .bind(&names)
        .bind(request.now)
        .bind(smaller_first)
        .bind(select_limit)
        .bind(limit)
        .bind(PAUSES_KEY)
        .fetch_all(session.connection())
        .await?;

        rows.iter().map(job_from_row).collect()
    }

    async fn begin_execution(
        &self,
        begin: BeginExecution,
    ) -> anyhow::Result<(JobRecord, ExecutionRecord)> {
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            r#"
            UPDATE quay_executions
            SET retried_execution_id = $2
            WHERE job_id = $1
              AND retried_execution_id IS NULL
              AND id <> $2
            "#,
        )
        .bind(begin.job_id.0)
        .bind(begin.execution_id.0)
        .execute(&mut *tx)
        .await?;

        let row = sqlx::query(&format!(
            r#"
            UPDATE quay_jobs
            SET performed_at = $2,
                locked_by_id = $3,
                locked_at = $2,
                executions_count = executions_count + 1
            WHERE id = $1
            RETURNING {JOB_COLUMNS}
            "#
        ))
        .bind(begin.job_id.0)
        .bind(begin.performed_at)
        .bind(begin.process_id.map(|id| id.0))
        .fetch_optional(&mut *tx)
        .await?
        .ok_or_else(|| anyhow::anyhow!("job {} not found", begin.job_id))?;
        let job = job_from_row(&row)?;

        let row = sqlx::query(&format!(
            r#"
            INSERT INTO quay_executions (
                id, job_id, job_class, queue_name, serialized_params, scheduled_at,
                performed_at, process_id, created_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $7)
            RETURNING {EXECUTION_COLUMNS}
            "#
        ))
        .bind(begin.execution_id.0)
        .bind(job.id.0)
        .bind(&job.job_class)
        .bind(&job.queue_name)
        .bind(&job.serialized_params)
        .bind(job.scheduled_at)
        .bind(begin.performed_at)
        .bind(begin.process_id.map(|id| id.0))
        .fetch_one(&mut *tx)
        .await?;
        let execution = execution_from_row(&row)?;

        tx.commit().await?;
        Ok((job, execution))
    }

    async fn interrupt_execution(
        &self,
        job_id: JobId,
        error: &str,
        at: DateTime<Utc>,
    ) -> anyhow::Result<JobRecord> {
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            r#"
            UPDATE quay_executions
            SET finished_at = $2,
                error = $3,
                error_event = $4,
                duration_ms = (EXTRACT(EPOCH FROM ($2 - performed_at)) * 1000)::bigint
            WHERE job_id = $1
              AND finished_at IS NULL
              AND retried_execution_id IS NULL
            "#,
        )
        .bind(job_id.0)
        .bind(at)
        .bind(error)
        .bind(ErrorEvent::Interrupted.as_str())
        .execute(&mut *tx)
        .await?;

        let row = sqlx::query(&format!(
            r#"
            UPDATE quay_jobs
            SET performed_at = NULL,
                error = $2,
                error_event = $3,
                locked_by_id = NULL,
                locked_at = NULL
            WHERE id = $1
            RETURNING {JOB_COLUMNS}
            "#
        ))
        .bind(job_id.0)
        .bind(error)
        .bind(ErrorEvent::Interrupted.as_str())
        .fetch_optional(&mut *tx)
        .await?
        .ok_or_else(|| anyhow::anyhow!("job {job_id} not found"))?;

        tx.commit().await?;
        job_from_row(&row)
    }

    async fn finish_execution(&self, finish: FinishExecution) -> anyhow::Result<JobRecord> {
        let mut tx = self.pool.begin().await?;
        let event = finish.error_event.map(|event| event.as_str());

        sqlx::query(
            r#"
            UPDATE quay_executions
            SET finished_at = $2,
                error = $3,
                error_event = $4,
                duration_ms = $5
            WHERE id = $1
            "#,
        )
        .bind(finish.execution_id.0)
        .bind(finish.finished_at)
        .bind(&finish.error)
        .bind(event)
        .bind(finish.duration.num_milliseconds())
        .execute(&mut *tx)
        .await?;

        let query = match finish.retry_at {
            Some(_) => format!(
                r#"
                UPDATE quay_jobs
                SET scheduled_at = $4,
                    performed_at = NULL,
                    finished_at = NULL,
                    error = $2,
                    error_event = $3,
                    locked_by_id = NULL,
                    locked_at = NULL
                WHERE id = $1
                RETURNING {JOB_COLUMNS}
                "#
            ),
            None => format!(
                r#"
                UPDATE quay_jobs
                SET finished_at = $4,
                    error = $2,
                    error_event = $3,
                    locked_by_id = NULL,
                    locked_at = NULL
                WHERE id = $1
                RETURNING {JOB_COLUMNS}
                "#
            ),
        };
        let row = sqlx::query(&query)
            .bind(finish.job_id.0)
            .bind(&finish.error)
            .bind(event)
            .bind(finish.retry_at.unwrap_or(finish.finished_at))
            .fetch_optional(&mut *tx)
            .await?
            .ok_or_else(|| anyhow::anyhow!("job {} not found", finish.job_id))?;

        tx.commit().await?;
        job_from_row(&row)
    }

    async fn executions(&self, job_id: JobId) -> anyhow::Result<Vec<ExecutionRecord>> {
        let rows = sqlx::query(&format!(
            "SELECT {EXECUTION_COLUMNS} FROM quay_executions WHERE job_id = $1 ORDER BY created_at, id"
        ))
        .bind(job_id.0)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(execution_from_row).collect()
    }

    async fn delete_job(&self, job_id: JobId) -> anyhow::Result<bool> {
        let result = sqlx::query("DELETE FROM quay_jobs WHERE id = $1")
            .bind(job_id.0)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn count_concurrency(&self, key: &str, count: ConcurrencyCount) -> anyhow::Result<u64> {
        let locked = format!(
            r#"
            EXISTS (
                SELECT 1 FROM pg_locks l
                WHERE l.locktype = 'advisory'
                  AND l.objsubid = 1
                  AND l.granted
                  AND ((l.classid::bigint << 32) | l.objid::bigint) = {JOB_LOCK_ID}
            )
            "#
        );
        let (sql, since) = match count {
            ConcurrencyCount::Unfinished => (
                "SELECT COUNT(*) FROM quay_jobs j WHERE j.concurrency_key = $1 AND j.finished_at IS NULL"
                    .to_string(),
                None,
            ),
            ConcurrencyCount::Enqueued => (
                format!(
                    "SELECT COUNT(*) FROM quay_jobs j WHERE j.concurrency_key = $1 AND j.finished_at IS NULL AND NOT {locked}"
                ),
                None,
            ),
            ConcurrencyCount::Performing => (
                format!(
                    "SELECT COUNT(*) FROM quay_jobs j WHERE j.concurrency_key = $1 AND j.finished_at IS NULL AND {locked}"
                ),
                None,
            ),
            ConcurrencyCount::CreatedSince(since) => (
                "SELECT COUNT(*) FROM quay_jobs j WHERE j.concurrency_key = $1 AND j.created_at >= $2"
                    .to_string(),
                Some(since),
            ),
            ConcurrencyCount::PerformedSince(since) => (
                r#"
                SELECT COUNT(*)
                FROM quay_executions e
                JOIN quay_jobs j ON j.id = e.job_id
                WHERE j.concurrency_key = $1
                  AND e.performed_at >= $2
                  AND (e.error IS NULL OR NOT (
                      e.error LIKE 'JobError: concurrency limit exceeded%'
                      OR e.error LIKE 'JobError: throttle exceeded%'
                  ))
                "#
                .to_string(),
                Some(since),
            ),
        };

        let mut query = sqlx::query_scalar::<_, i64>(&sql).bind(key);
        if let Some(since) = since {
            query = query.bind(since);
        }
        let count = query.fetch_one(&self.pool).await?;
        Ok(u64::try_from(count)?)
    }

    async fn upcoming_scheduled(
        &self,
        filter: &QueueFilter,
        after: DateTime<Utc>,
        limit: usize,
    ) -> anyhow::Result<Vec<DateTime<Utc>>> {
        let (kind, names) = filter_params(filter);
        let times: Vec<DateTime<Utc>> = sqlx::query_scalar(&format!(
            r#"
            SELECT j.scheduled_at
            FROM quay_jobs j
            WHERE j.finished_at IS NULL
              AND j.scheduled_at > $3
              AND {QUEUE_MATCH}
            ORDER BY j.scheduled_at
            LIMIT $4
            "#
        ))
        .bind(kind)
        .bind(&names)
        .bind(after)
        .bind(i64::try_from(limit)?)
        .fetch_all(&self.pool)
        .await?;
        Ok(times)
    }

    async fn queue_snapshot(&self, now: DateTime<Utc>) -> anyhow::Result<QueueSnapshot> {
        let rows = sqlx::query(
            r#"
            SELECT queue_name, status, COUNT(*) AS count
            FROM (
                SELECT queue_name,
                    CASE
                        WHEN finished_at IS NOT NULL THEN
                            CASE WHEN error IS NULL OR error_event = 'handled'
                                THEN 'succeeded' ELSE 'discarded' END
                        WHEN performed_at IS NOT NULL THEN 'running'
                        WHEN scheduled_at IS NOT NULL AND scheduled_at > $1 THEN
                            CASE WHEN error_event = 'retried' THEN 'retried' ELSE 'scheduled' END
                        ELSE 'queued'
                    END AS status
                FROM quay_jobs
            ) s
            GROUP BY queue_name, status
            "#,
        )
        .bind(now)
        .fetch_all(&self.pool)
        .await?;

        let mut snapshot = QueueSnapshot::new(now);
        for row in rows {
            let queue_name: String = row.try_get("queue_name")?;
            let status: String = row.try_get("status")?;
            let count: i64 = row.try_get("count")?;
            snapshot
                .entry_mut(&queue_name)
                .add(status.parse::<JobStatus>()?, usize::try_from(count)?);
        }
        Ok(snapshot)
    }

    async fn purge_finished(&self, request: PurgeRequest) -> anyhow::Result<PurgeStats> {
        // Executions go with their job through the foreign key cascade; the
        // count is read from the statement snapshot, before the delete.
        let row = sqlx::query(
            r#"
            WITH doomed AS (
                SELECT j.id
                FROM quay_jobs j
                LEFT JOIN quay_batches b ON b.id = j.batch_id
                WHERE j.finished_at IS NOT NULL
                  AND j.finished_at < $1
                  AND ($2 OR j.error IS NULL OR j.error_event = 'handled')
                  AND (j.batch_id IS NULL OR b.finished_at IS NOT NULL)
                ORDER BY j.finished_at
                LIMIT $3
            ),
            deleted AS (
                DELETE FROM quay_jobs j
                USING doomed
                WHERE j.id = doomed.id
                RETURNING j.id
            )
            SELECT
                COUNT(*) AS jobs,
                COALESCE(SUM((SELECT COUNT(*) FROM quay_executions e WHERE e.job_id = deleted.id)), 0)::bigint AS executions
            FROM deleted
            "#,
        )
        .bind(request.finished_before)
        .bind(request.include_discarded)
        .bind(i64::try_from(request.limit)?)
        .fetch_one(&self.pool)
        .await?;

        let jobs: i64 = row.try_get("jobs")?;
        let executions: i64 = row.try_get("executions")?;
        Ok(PurgeStats {
            jobs: u64::try_from(jobs)?,
            executions: u64::try_from(executions)?,
            batches: 0,
        })
    }
}

#[async_trait]
impl BatchStore for PgStore {
    async fn insert_batch(&self, batch: BatchRecord) -> anyhow::Result<BatchRecord> {
        let row = sqlx::query(&format!(
            r#"
            INSERT INTO quay_batches (
                id, description, serialized_properties, on_finish, on_success, on_discard,
                callback_queue_name, callback_priority, enqueued_at, discarded_at, finished_at,
                created_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)
            RETURNING {BATCH_COLUMNS}
            "#
        ))
        .bind(batch.id.0)
        .bind(&batch.description)
        .bind(&batch.serialized_properties)
        .bind(&batch.on_finish)
        .bind(&batch.on_success)
        .bind(&batch.on_discard)
        .bind(&batch.callback_queue_name)
        .bind(batch.callback_priority)
        .bind(batch.enqueued_at)
        .bind(batch.discarded_at)
        .bind(batch.finished_at)
        .bind(batch.created_at)
        .fetch_one(&self.pool)
        .await?;
        batch_from_row(&row)
    }

    async fn find_batch(&self, id: BatchId) -> anyhow::Result<Option<BatchRecord>> {
        let row = sqlx::query(&format!(
            "SELECT {BATCH_COLUMNS} FROM quay_batches WHERE id = $1"
        ))
        .bind(id.0)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(batch_from_row).transpose()
    }

    async fn save_batch_properties(
        &self,
        id: BatchId,
        properties: serde_json::Value,
    ) -> anyhow::Result<()> {
        let result = sqlx::query("UPDATE quay_batches SET serialized_properties = $2 WHERE id = $1")
            .bind(id.0)
            .bind(&properties)
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            anyhow::bail!("batch {id} not found");
        }
        Ok(())
    }

    async fn transition_batch(
        &self,
        id: BatchId,
        transition: BatchTransition,
        at: DateTime<Utc>,
    ) -> anyhow::Result<bool> {
        let column = match transition {
            BatchTransition::Enqueued => "enqueued_at",
            BatchTransition::Discarded => "discarded_at",
            BatchTransition::Finished => "finished_at",
        };
        let result = sqlx::query(&format!(
            "UPDATE quay_batches SET {column} = $2 WHERE id = $1 AND {column} IS NULL"
        ))
        .bind(id.0)
        .bind(at)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn count_unfinished_in_batch(&self, id: BatchId) -> anyhow::Result<u64> {
        let count: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM quay_jobs WHERE batch_id = $1 AND finished_at IS NULL",
        )
        .bind(id.0)
        .fetch_one(&self.pool)
        .await?;
        Ok(u64::try_from(count)?)
    }

    async fn batch_jobs(&self, id: BatchId) -> anyhow::Result<Vec<JobRecord>> {
        let rows = sqlx::query(&format!(
            "SELECT {JOB_COLUMNS} FROM quay_jobs WHERE batch_id = $1 ORDER BY created_at, id"
        ))
        .bind(id.0)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(job_from_row).collect()
    }

    async fn purge_batches(&self, finished_before: DateTime<Utc>) -> anyhow::Result<u64> {
        let result = sqlx::query(
            r#"
            DELETE FROM quay_batches b
            WHERE b.finished_at IS NOT NULL
              AND b.finished_at < $1
              AND NOT EXISTS (SELECT 1 FROM quay_jobs j WHERE j.batch_id = b.id)
            "#,
        )
        .bind(finished_before)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }
}

#[async_trait]
impl ProcessStore for PgStore {
    async fn register_process(&self, process: ProcessRecord) -> anyhow::Result<()> {
        sqlx::query(
            r#"
            INSERT INTO quay_processes (
                id, hostname, pid, process_title, schedulers, created_at, last_heartbeat_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            ON CONFLICT (id) DO UPDATE
            SET hostname = EXCLUDED.hostname,
                pid = EXCLUDED.pid,
                process_title = EXCLUDED.process_title,
                schedulers = EXCLUDED.schedulers,
                last_heartbeat_at = EXCLUDED.last_heartbeat_at
            "#,
        )
        .bind(process.id.0)
        .bind(&process.hostname)
        .bind(i64::from(process.pid))
        .bind(&process.process_title)
        .bind(&process.schedulers)
        .bind(process.created_at)
        .bind(process.last_heartbeat_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn heartbeat(&self, id: ProcessId, at: DateTime<Utc>) -> anyhow::Result<bool> {
        let result = sqlx::query("UPDATE quay_processes SET last_heartbeat_at = $2 WHERE id = $1")
            .bind(id.0)
            .bind(at)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn deregister_process(&self, id: ProcessId) -> anyhow::Result<()> {
        sqlx::query("DELETE FROM quay_processes WHERE id = $1")
            .bind(id.0)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn list_processes(&self) -> anyhow::Result<Vec<ProcessRecord>> {
        let rows = sqlx::query(
            r#"
            SELECT id, hostname, pid, process_title, schedulers, created_at, last_heartbeat_at
            FROM quay_processes
            ORDER BY created_at, id
            "#,
        )
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(process_from_row).collect()
    }

    async fn delete_stale_processes(&self, before: DateTime<Utc>) -> anyhow::Result<u64> {
        let result = sqlx::query("DELETE FROM quay_processes WHERE last_heartbeat_at < $1")
            .bind(before)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }
}

#[async_trait]
impl SettingStore for PgStore {
    async fn get_setting(&self, key: &str) -> anyhow::Result<Option<serde_json::Value>> {
        let value = sqlx::query_scalar("SELECT value FROM quay_settings WHERE key = $1")
            .bind(key)
            .fetch_optional(&self.pool)
            .await?;
        Ok(value)
    }

    async fn put_setting(&self, key: &str, value: serde_json::Value) -> anyhow::Result<()> {
        sqlx::query(
            r#"
            INSERT INTO quay_settings (key, value, updated_at)
            VALUES ($1, $2, NOW())
            ON CONFLICT (key) DO UPDATE SET value = EXCLUDED.value, updated_at = NOW()
            "#,
        )
        .bind(key)
        .bind(&value)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn delete_setting(&self, key: &str) -> anyhow::Result<bool> {
        let result = sqlx::query("DELETE FROM quay_settings WHERE key = $1")
            .bind(key)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_filter_params_name_the_variant() {
        let (kind, names) = filter_params(&"+urgent,default".parse().unwrap());
        assert_eq!(kind, "ordered");
        assert_eq!(names, vec!["urgent".to_string(), "default".to_string()]);

        let (kind, names) = filter_params(&QueueFilter::All);
        assert_eq!(kind, "all");
        assert!(names.is_empty());
    }

    #[test]
    fn test_parse_event_accepts_null() {
        assert_eq!(parse_event(None).unwrap(), None);
        assert_eq!(
            parse_event(Some("retry_stopped".to_string())).unwrap(),
            Some(ErrorEvent::RetryStopped)
        );
        assert!(parse_event(Some("bogus".to_string())).is_err());
    }
}
