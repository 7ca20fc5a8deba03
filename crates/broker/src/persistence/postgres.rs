//! PostgreSQL implementation of TaskStore
//!
//! Production persistence using PostgreSQL with:
//! - Concurrent claiming with `FOR UPDATE SKIP LOCKED`
//! - Lease-guarded ack/extend as single conditional statements
//! - Nack and reaping inside row-locked transactions
//! - Dedupe enforced by a partial unique index
//!
//! Requires PostgreSQL 13+ (`gen_random_uuid()`).

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgPoolOptions, PgRow};
use sqlx::types::Json;
use sqlx::{PgConnection, PgPool, Row};
use tracing::{debug, error, info, instrument};
use uuid::Uuid;

use super::store::*;
use crate::clock::{add, Clock, SystemClock};
use crate::config::RequeueHistory;
use crate::dlq::{escalate, revive};
use crate::reliability::{FailureCause, RetryDecider};
use crate::state::TaskStatus;

const TASK_COLUMNS: &str = "id, queue, payload, dedupe_scope, dedupe_key, status, available_at, \
     lease_token, lease_expiry, attempt, max_attempts, failure_history, created_at";

const DEAD_LETTER_COLUMNS: &str = "id, task_id, queue, payload, dedupe_scope, dedupe_key, \
     attempts, max_attempts, failure_history, reason, created_at, dead_at, archived_at";

/// Attempts at resolving an enqueue that races with the key holder's removal
const DEDUPE_RETRIES: usize = 3;

/// PostgreSQL implementation of TaskStore
///
/// Uses a connection pool for efficient database access. Time comes from
/// the injected [`Clock`], not from the database server, so every node
/// must run with a synchronised clock.
///
/// # Example
///
/// ```ignore
/// use deferq_broker::PostgresTaskStore;
/// use sqlx::PgPool;
///
/// let pool = PgPool::connect("postgres://localhost/mydb").await?;
/// let store = PostgresTaskStore::new(pool);
/// store.migrate().await?;
/// ```
#[derive(Clone)]
pub struct PostgresTaskStore {
    pool: PgPool,
    clock: Arc<dyn Clock>,
}

impl PostgresTaskStore {
    /// Create a new PostgreSQL store with the given connection pool
    pub fn new(pool: PgPool) -> Self {
        Self::with_clock(pool, Arc::new(SystemClock))
    }

    /// Create a store reading time from `clock`
    pub fn with_clock(pool: PgPool, clock: Arc<dyn Clock>) -> Self {
        Self { pool, clock }
    }

    /// Open a pool against `database_url`
    pub async fn connect(database_url: &str, max_connections: u32) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(database_url)
            .await
            .map_err(db_error("connect to database"))?;

        Ok(Self::new(pool))
    }

    /// Get a reference to the connection pool
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Apply the embedded schema migrations
    pub async fn migrate(&self) -> Result<(), StoreError> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .map_err(|e| {
                error!("Failed to run migrations: {}", e);
                StoreError::Unavailable(e.to_string())
            })?;

        info!("database migrations applied");
        Ok(())
    }
}

#[async_trait]
impl TaskStore for PostgresTaskStore {
    #[instrument(skip(self, new), fields(queue = %new.queue))]
    async fn enqueue(&self, new: NewTask) -> Result<EnqueueOutcome, StoreError> {
        let now = self.clock.now();
        let task = Task {
            id: Uuid::now_v7(),
            queue: new.queue,
            payload: new.payload,
            dedupe_key: new.dedupe_key,
            status: TaskStatus::Pending,
            available_at: add(now, new.delay),
            lease_token: None,
            lease_expiry: None,
            attempt: 0,
            max_attempts: new.max_attempts,
            failure_history: Vec::new(),
            created_at: now,
        };

        let mut conn = self
            .pool
            .acquire()
            .await
            .map_err(db_error("acquire connection"))?;

        for _ in 0..DEDUPE_RETRIES {
            if insert_task(&mut conn, &task).await? {
                debug!(task_id = %task.id, "enqueued task");
                return Ok(EnqueueOutcome::Created(task.id));
            }

            // The key holder may have been acked between the insert and this read
            if let Some(key) = &task.dedupe_key {
                if let Some(existing) = find_dedupe_holder(&mut conn, key).await? {
                    debug!(%existing, "duplicate enqueue");
                    return Ok(EnqueueOutcome::Duplicate(existing));
                }
            }
        }

        Err(StoreError::Unavailable(
            "dedupe key is changing hands too quickly".to_string(),
        ))
    }

    #[instrument(skip(self))]
    async fn claim(
        &self,
        queue: &str,
        lease_duration: Duration,
        batch_size: usize,
    ) -> Result<Vec<LeasedTask>, StoreError> {
        if batch_size == 0 {
            return Ok(vec![]);
        }

        let now = self.clock.now();
        let lease_expiry = add(now, lease_duration);

        // SKIP LOCKED lets concurrent claimers pass over rows another
        // transaction is already taking; the UPDATE re-checks nothing
        // because the CTE holds the row locks.
        let rows = sqlx::query(
            r#"
            WITH claimable AS (
                SELECT id
                FROM deferq_tasks
                WHERE queue = $1
                  AND status IN ('pending', 'retry_scheduled')
                  AND available_at <= $2
                ORDER BY available_at, created_at, seq
                LIMIT $3
                FOR UPDATE SKIP LOCKED
            )
            UPDATE deferq_tasks t
            SET status = 'leased',
                lease_token = gen_random_uuid(),
                lease_expiry = $4,
                attempt = t.attempt + 1
            FROM claimable c
            WHERE t.id = c.id
            RETURNING t.id, t.queue, t.payload, t.attempt, t.max_attempts,
                      t.lease_token, t.lease_expiry, t.available_at, t.created_at, t.seq
            "#,
        )
        .bind(queue)
        .bind(now)
        .bind(i64::try_from(batch_size).unwrap_or(i64::MAX))
        .bind(lease_expiry)
        .fetch_all(&self.pool)
        .await
        .map_err(db_error("claim tasks"))?;

        let mut ordered = Vec::with_capacity(rows.len());
        for row in rows {
            let order: (DateTime<Utc>, DateTime<Utc>, i64) = (
                row.try_get("available_at").map_err(decode_error)?,
                row.try_get("created_at").map_err(decode_error)?,
                row.try_get("seq").map_err(decode_error)?,
            );
            ordered.push((order, row_to_leased(&row)?));
        }
        // RETURNING order is unspecified
        ordered.sort_by(|a, b| a.0.cmp(&b.0));
        let claimed: Vec<LeasedTask> = ordered.into_iter().map(|(_, task)| task).collect();

        if !claimed.is_empty() {
            debug!(queue, count = claimed.len(), "claimed tasks");
        }

        Ok(claimed)
    }

    #[instrument(skip(self, token))]
    async fn ack(&self, task_id: TaskId, token: LeaseToken) -> Result<LeaseStatus, StoreError> {
        let now = self.clock.now();
        let result = sqlx::query(
            r#"
            DELETE FROM deferq_tasks
            WHERE id = $1 AND status = 'leased' AND lease_token = $2 AND lease_expiry >= $3
            "#,
        )
        .bind(task_id)
        .bind(token)
        .bind(now)
        .execute(&self.pool)
        .await
        .map_err(db_error("ack task"))?;

        if result.rows_affected() == 0 {
            debug!(%task_id, "ack ignored: lease no longer held");
            return Ok(LeaseStatus::InvalidLease);
        }

        debug!(%task_id, "task acked");
        Ok(LeaseStatus::Applied)
    }

    #[instrument(skip(self, token, failure, decider))]
    async fn nack(
        &self,
        task_id: TaskId,
        token: LeaseToken,
        failure: Failure,
        decider: &dyn RetryDecider,
    ) -> Result<NackOutcome, StoreError> {
        let now = self.clock.now();
        let mut tx = self.pool.begin().await.map_err(db_error("begin nack"))?;

        let row = sqlx::query(&format!(
            "SELECT {} FROM deferq_tasks WHERE id = $1 FOR UPDATE",
            TASK_COLUMNS
        ))
        .bind(task_id)
        .fetch_optional(&mut *tx)
        .await
        .map_err(db_error("lock task"))?;

        let Some(row) = row else {
            debug!(%task_id, "nack ignored: task is gone");
            return Ok(NackOutcome::InvalidLease);
        };
        let mut task = row_to_task(&row)?;
        if !task.holds_lease(token, now) {
            debug!(%task_id, "nack ignored: lease no longer held");
            return Ok(NackOutcome::InvalidLease);
        }

        let resolution = task.resolve_failure(&failure, FailureCause::Nack, decider, now)?;
        let outcome = persist_failure(&mut tx, &task, resolution, now).await?;

        tx.commit().await.map_err(db_error("commit nack"))?;
        Ok(outcome)
    }

    #[instrument(skip(self, token))]
    async fn extend_lease(
        &self,
        task_id: TaskId,
        token: LeaseToken,
        new_duration: Duration,
    ) -> Result<LeaseStatus, StoreError> {
        let now = self.clock.now();
        let result = sqlx::query(
            r#"
            UPDATE deferq_tasks
            SET lease_expiry = $4
            WHERE id = $1 AND status = 'leased' AND lease_token = $2 AND lease_expiry >= $3
            "#,
        )
        .bind(task_id)
        .bind(token)
        .bind(now)
        .bind(add(now, new_duration))
        .execute(&self.pool)
        .await
        .map_err(db_error("extend lease"))?;

        if result.rows_affected() == 0 {
            debug!(%task_id, "extend ignored: lease no longer held");
            return Ok(LeaseStatus::InvalidLease);
        }
        Ok(LeaseStatus::Applied)
    }

    #[instrument(skip(self, decider))]
    async fn reap_expired_leases(
        &self,
        decider: &dyn RetryDecider,
        limit: usize,
    ) -> Result<Vec<ReapedTask>, StoreError> {
        let now = self.clock.now();
        let mut tx = self.pool.begin().await.map_err(db_error("begin reap"))?;

        let rows = sqlx::query(&format!(
            r#"
            SELECT {}
            FROM deferq_tasks
            WHERE status = 'leased' AND lease_expiry < $1
            ORDER BY lease_expiry
            LIMIT $2
            FOR UPDATE SKIP LOCKED
            "#,
            TASK_COLUMNS
        ))
        .bind(now)
        .bind(i64::try_from(limit).unwrap_or(i64::MAX))
        .fetch_all(&mut *tx)
        .await
        .map_err(db_error("find expired leases"))?;

        let failure = Failure::retryable(LEASE_EXPIRED_SUMMARY);
        let mut reaped = Vec::with_capacity(rows.len());
        for row in rows {
            let mut task = row_to_task(&row)?;
            let resolution =
                task.resolve_failure(&failure, FailureCause::LeaseExpired, decider, now)?;
            let outcome = persist_failure(&mut tx, &task, resolution, now).await?;

            reaped.push(ReapedTask {
                task_id: task.id,
                queue: task.queue,
                outcome,
            });
        }

        tx.commit().await.map_err(db_error("commit reap"))?;
        Ok(reaped)
    }

    #[instrument(skip(self))]
    async fn get_task(&self, task_id: TaskId) -> Result<Option<Task>, StoreError> {
        let row = sqlx::query(&format!(
            "SELECT {} FROM deferq_tasks WHERE id = $1",
            TASK_COLUMNS
        ))
        .bind(task_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_error("get task"))?;

        row.as_ref().map(row_to_task).transpose()
    }

    #[instrument(skip(self))]
    async fn queue_stats(&self, queue: &str) -> Result<QueueStats, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT
                COUNT(*) FILTER (WHERE status = 'pending') AS pending,
                COUNT(*) FILTER (WHERE status = 'leased') AS leased,
                COUNT(*) FILTER (WHERE status = 'retry_scheduled') AS retry_scheduled,
                (SELECT COUNT(*) FROM deferq_dead_letters
                  WHERE queue = $1 AND archived_at IS NULL) AS dead_lettered
            FROM deferq_tasks
            WHERE queue = $1
            "#,
        )
        .bind(queue)
        .fetch_one(&self.pool)
        .await
        .map_err(db_error("count tasks"))?;

        let count = |column: &str| -> Result<u64, StoreError> {
            let value: i64 = row.try_get(column).map_err(decode_error)?;
            Ok(value.max(0) as u64)
        };

        Ok(QueueStats {
            queue: queue.to_string(),
            pending: count("pending")?,
            leased: count("leased")?,
            retry_scheduled: count("retry_scheduled")?,
            dead_lettered: count("dead_lettered")?,
        })
    }

    #[instrument(skip(self))]
    async fn list_dead_letters(
        &self,
        filter: DeadLetterFilter,
        pagination: Pagination,
    ) -> Result<Vec<DeadLetterEntry>, StoreError> {
        let rows = sqlx::query(&format!(
            r#"
            SELECT {}
            FROM deferq_dead_letters
            WHERE ($1::text IS NULL OR queue = $1)
              AND ($2 OR archived_at IS NULL)
            ORDER BY dead_at DESC, id DESC
            OFFSET $3
            LIMIT $4
            "#,
            DEAD_LETTER_COLUMNS
        ))
        .bind(&filter.queue)
        .bind(filter.include_archived)
        .bind(pagination.offset as i64)
        .bind(pagination.limit as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(db_error("list dead letters"))?;

        rows.iter().map(row_to_dead_letter).collect()
    }

    #[instrument(skip(self))]
    async fn get_dead_letter(
        &self,
        id: DeadLetterId,
    ) -> Result<Option<DeadLetterEntry>, StoreError> {
        let row = sqlx::query(&format!(
            "SELECT {} FROM deferq_dead_letters WHERE id = $1",
            DEAD_LETTER_COLUMNS
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_error("get dead letter"))?;

        row.as_ref().map(row_to_dead_letter).transpose()
    }

    #[instrument(skip(self))]
    async fn requeue_dead_letter(
        &self,
        id: DeadLetterId,
        history: RequeueHistory,
    ) -> Result<TaskId, StoreError> {
        let now = self.clock.now();
        let mut tx = self.pool.begin().await.map_err(db_error("begin requeue"))?;

        let row = sqlx::query(&format!(
            "SELECT {} FROM deferq_dead_letters WHERE id = $1 AND archived_at IS NULL FOR UPDATE",
            DEAD_LETTER_COLUMNS
        ))
        .bind(id)
        .fetch_optional(&mut *tx)
        .await
        .map_err(db_error("lock dead letter"))?
        .ok_or(StoreError::DeadLetterNotFound(id))?;

        let task = revive(row_to_dead_letter(&row)?, history, now)?;

        if !insert_task(&mut tx, &task).await? {
            // Dropping the transaction leaves the entry in place
            let existing = match &task.dedupe_key {
                Some(key) => find_dedupe_holder(&mut tx, key).await?,
                None => None,
            };
            return Err(match existing {
                Some(existing) => StoreError::DedupeConflict { existing },
                None => StoreError::Unavailable("dedupe key holder vanished".to_string()),
            });
        }

        sqlx::query("DELETE FROM deferq_dead_letters WHERE id = $1")
            .bind(id)
            .execute(&mut *tx)
            .await
            .map_err(db_error("remove dead letter"))?;

        tx.commit().await.map_err(db_error("commit requeue"))?;

        debug!(dlq_id = %id, task_id = %task.id, "requeued dead letter");
        Ok(task.id)
    }

    #[instrument(skip(self))]
    async fn archive_dead_letter(&self, id: DeadLetterId) -> Result<(), StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE deferq_dead_letters
            SET archived_at = $2
            WHERE id = $1 AND archived_at IS NULL
            "#,
        )
        .bind(id)
        .bind(self.clock.now())
        .execute(&self.pool)
        .await
        .map_err(db_error("archive dead letter"))?;

        if result.rows_affected() == 0 {
            return Err(StoreError::DeadLetterNotFound(id));
        }
        Ok(())
    }

    #[instrument(skip(self))]
    async fn delete_dead_letter(&self, id: DeadLetterId) -> Result<(), StoreError> {
        let result = sqlx::query("DELETE FROM deferq_dead_letters WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(db_error("delete dead letter"))?;

        if result.rows_affected() == 0 {
            return Err(StoreError::DeadLetterNotFound(id));
        }
        Ok(())
    }
}

// Helper functions

/// Insert a task row; `false` when its dedupe key is already held
async fn insert_task(conn: &mut PgConnection, task: &Task) -> Result<bool, StoreError> {
    let (dedupe_scope, dedupe_key) = split_dedupe_key(task.dedupe_key.as_ref());

    let inserted = sqlx::query(
        r#"
        INSERT INTO deferq_tasks (
            id, queue, payload, dedupe_scope, dedupe_key, status, available_at,
            attempt, max_attempts, failure_history, created_at
        )
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
        ON CONFLICT (dedupe_scope, dedupe_key) WHERE dedupe_key IS NOT NULL DO NOTHING
        RETURNING id
        "#,
    )
    .bind(task.id)
    .bind(&task.queue)
    .bind(&task.payload)
    .bind(dedupe_scope)
    .bind(dedupe_key)
    .bind(task.status.as_str())
    .bind(task.available_at)
    .bind(to_i32(task.attempt))
    .bind(to_i32(task.max_attempts))
    .bind(Json(&task.failure_history))
    .bind(task.created_at)
    .fetch_optional(&mut *conn)
    .await
    .map_err(db_error("insert task"))?;

    Ok(inserted.is_some())
}

async fn find_dedupe_holder(
    conn: &mut PgConnection,
    key: &DedupeKey,
) -> Result<Option<TaskId>, StoreError> {
    let row = sqlx::query(
        "SELECT id FROM deferq_tasks WHERE dedupe_scope = $1 AND dedupe_key = $2",
    )
    .bind(&key.scope)
    .bind(&key.key)
    .fetch_optional(&mut *conn)
    .await
    .map_err(db_error("find dedupe holder"))?;

    row.map(|r| r.try_get("id").map_err(decode_error))
        .transpose()
}

/// Write back a task after [`Task::resolve_failure`]
async fn persist_failure(
    conn: &mut PgConnection,
    task: &Task,
    resolution: FailureResolution,
    now: DateTime<Utc>,
) -> Result<NackOutcome, StoreError> {
    match resolution {
        FailureResolution::Retry {
            available_at,
            delay,
        } => {
            sqlx::query(
                r#"
                UPDATE deferq_tasks
                SET status = $2,
                    available_at = $3,
                    lease_token = NULL,
                    lease_expiry = NULL,
                    failure_history = $4
                WHERE id = $1
                "#,
            )
            .bind(task.id)
            .bind(task.status.as_str())
            .bind(available_at)
            .bind(Json(&task.failure_history))
            .execute(&mut *conn)
            .await
            .map_err(db_error("reschedule task"))?;

            debug!(task_id = %task.id, attempt = task.attempt, ?delay, "task scheduled for retry");
            Ok(NackOutcome::Retrying {
                available_at,
                delay,
            })
        }
        FailureResolution::DeadLetter(reason) => {
            let entry = escalate(task, reason, now);
            let (dedupe_scope, dedupe_key) = split_dedupe_key(entry.dedupe_key.as_ref());

            sqlx::query("DELETE FROM deferq_tasks WHERE id = $1")
                .bind(task.id)
                .execute(&mut *conn)
                .await
                .map_err(db_error("remove dead task"))?;

            sqlx::query(
                r#"
                INSERT INTO deferq_dead_letters (
                    id, task_id, queue, payload, dedupe_scope, dedupe_key, attempts,
                    max_attempts, failure_history, reason, created_at, dead_at
                )
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)
                "#,
            )
            .bind(entry.id)
            .bind(entry.task_id)
            .bind(&entry.queue)
            .bind(&entry.payload)
            .bind(dedupe_scope)
            .bind(dedupe_key)
            .bind(to_i32(entry.attempts))
            .bind(to_i32(entry.max_attempts))
            .bind(Json(&entry.failure_history))
            .bind(entry.reason.as_str())
            .bind(entry.created_at)
            .bind(entry.dead_at)
            .execute(&mut *conn)
            .await
            .map_err(db_error("insert dead letter"))?;

            debug!(task_id = %task.id, dlq_id = %entry.id, reason = reason.as_str(), "task dead-lettered");
            Ok(NackOutcome::DeadLettered { dlq_id: entry.id })
        }
    }
}

fn row_to_task(row: &PgRow) -> Result<Task, StoreError> {
    let status: String = row.try_get("status").map_err(decode_error)?;
    let failure_history: Json<Vec<FailureRecord>> =
        row.try_get("failure_history").map_err(decode_error)?;

    Ok(Task {
        id: row.try_get("id").map_err(decode_error)?,
        queue: row.try_get("queue").map_err(decode_error)?,
        payload: row.try_get("payload").map_err(decode_error)?,
        dedupe_key: join_dedupe_key(row)?,
        status: status.parse().map_err(StoreError::Serialization)?,
        available_at: row.try_get("available_at").map_err(decode_error)?,
        lease_token: row.try_get("lease_token").map_err(decode_error)?,
        lease_expiry: row.try_get("lease_expiry").map_err(decode_error)?,
        attempt: from_i32(row.try_get("attempt").map_err(decode_error)?),
        max_attempts: from_i32(row.try_get("max_attempts").map_err(decode_error)?),
        failure_history: failure_history.0,
        created_at: row.try_get("created_at").map_err(decode_error)?,
    })
}

fn row_to_leased(row: &PgRow) -> Result<LeasedTask, StoreError> {
    Ok(LeasedTask {
        id: row.try_get("id").map_err(decode_error)?,
        queue: row.try_get("queue").map_err(decode_error)?,
        payload: row.try_get("payload").map_err(decode_error)?,
        attempt: from_i32(row.try_get("attempt").map_err(decode_error)?),
        max_attempts: from_i32(row.try_get("max_attempts").map_err(decode_error)?),
        lease_token: row.try_get("lease_token").map_err(decode_error)?,
        lease_expiry: row.try_get("lease_expiry").map_err(decode_error)?,
    })
}

fn row_to_dead_letter(row: &PgRow) -> Result<DeadLetterEntry, StoreError> {
    let reason: String = row.try_get("reason").map_err(decode_error)?;
    let failure_history: Json<Vec<FailureRecord>> =
        row.try_get("failure_history").map_err(decode_error)?;

    Ok(DeadLetterEntry {
        id: row.try_get("id").map_err(decode_error)?,
        task_id: row.try_get("task_id").map_err(decode_error)?,
        queue: row.try_get("queue").map_err(decode_error)?,
        payload: row.try_get("payload").map_err(decode_error)?,
        dedupe_key: join_dedupe_key(row)?,
        attempts: from_i32(row.try_get("attempts").map_err(decode_error)?),
        max_attempts: from_i32(row.try_get("max_attempts").map_err(decode_error)?),
        failure_history: failure_history.0,
        reason: reason.parse().map_err(StoreError::Serialization)?,
        created_at: row.try_get("created_at").map_err(decode_error)?,
        dead_at: row.try_get("dead_at").map_err(decode_error)?,
        archived_at: row.try_get("archived_at").map_err(decode_error)?,
    })
}

fn split_dedupe_key(key: Option<&DedupeKey>) -> (Option<&str>, Option<&str>) {
    match key {
        Some(key) => (Some(key.scope.as_str()), Some(key.key.as_str())),
        None => (None, None),
    }
}

fn join_dedupe_key(row: &PgRow) -> Result<Option<DedupeKey>, StoreError> {
    let scope: Option<String> = row.try_get("dedupe_scope").map_err(decode_error)?;
    let key: Option<String> = row.try_get("dedupe_key").map_err(decode_error)?;

    Ok(scope.zip(key).map(|(scope, key)| DedupeKey { scope, key }))
}

fn to_i32(value: u32) -> i32 {
    i32::try_from(value).unwrap_or(i32::MAX)
}

fn from_i32(value: i32) -> u32 {
    value.max(0) as u32
}

fn db_error(operation: &'static str) -> impl FnOnce(sqlx::Error) -> StoreError {
    move |e| {
        error!("Failed to {}: {}", operation, e);
        StoreError::Unavailable(e.to_string())
    }
}

fn decode_error(e: sqlx::Error) -> StoreError {
    StoreError::Serialization(e.to_string())
}
