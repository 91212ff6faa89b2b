//! Embedded SQLite storage for the durable task queue.
//!
//! This crate owns the `task_queue` table: row lifecycle transitions, the
//! idempotent insert path, TTL purge of terminal history and the startup
//! recovery sweep. The worker runtime in `itk-queue` layers handler dispatch
//! on top of these operations.
//!
//! All access goes through a single-connection [`SqlitePool`]; each
//! transactional unit either runs as one statement on that connection or
//! inside an explicit transaction holding it, which serializes writers the
//! same way a process-wide mutex would.

use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::{Row, SqlitePool};
use std::path::Path;
use uuid::Uuid;

pub mod migrations;

/// Open the queue database as a single-connection pool.
///
/// One connection is deliberate: it serializes every transactional unit
/// (submit, snapshot, claim, mark) while still letting handler execution run
/// with no connection checked out.
pub async fn open_pool(database_path: impl AsRef<Path>) -> Result<SqlitePool> {
    let path = database_path.as_ref();
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("create_dir_all {parent:?}"))?;
        }
    }

    let options = SqliteConnectOptions::new()
        .filename(path)
        .create_if_missing(true);

    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .connect_with(options)
        .await
        .with_context(|| format!("failed to open queue database: {path:?}"))?;

    Ok(pool)
}

// ---------------------------------------------------------------------------
// Status enums
// ---------------------------------------------------------------------------

/// All valid states a queued task can occupy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    /// Submitted and waiting for its first claim.
    Queued,
    /// Claimed by the worker; a handler invocation is in flight.
    Running,
    /// Handler failed; waiting for `available_at` to come due again.
    Retrying,
    /// Handler succeeded. **Terminal.**
    Completed,
    /// Explicitly marked failed without dead-lettering. **Terminal.**
    /// Reserved for callers of [`mark_failed`] with `dead_letter = false`;
    /// the worker path never produces it.
    Failed,
    /// Structural failure or retry exhaustion. **Terminal.**
    DeadLetter,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Queued => "queued",
            TaskStatus::Running => "running",
            TaskStatus::Retrying => "retrying",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
            TaskStatus::DeadLetter => "dead_letter",
        }
    }

    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "queued" => Ok(TaskStatus::Queued),
            "running" => Ok(TaskStatus::Running),
            "retrying" => Ok(TaskStatus::Retrying),
            "completed" => Ok(TaskStatus::Completed),
            "failed" => Ok(TaskStatus::Failed),
            "dead_letter" => Ok(TaskStatus::DeadLetter),
            other => Err(anyhow!("invalid task status: {}", other)),
        }
    }

    /// Returns `true` if no further transitions are possible.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskStatus::Completed | TaskStatus::Failed | TaskStatus::DeadLetter
        )
    }
}

/// Why a task was dead-lettered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeadLetterReason {
    /// Retry budget exhausted by handler failures.
    MaxRetriesExceeded,
    /// No handler registered for the task type at claim time.
    HandlerNotFound,
    /// Stored payload JSON could not be decoded.
    PayloadDecodeError,
}

impl DeadLetterReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeadLetterReason::MaxRetriesExceeded => "max_retries_exceeded",
            DeadLetterReason::HandlerNotFound => "handler_not_found",
            DeadLetterReason::PayloadDecodeError => "payload_decode_error",
        }
    }

    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "max_retries_exceeded" => Ok(DeadLetterReason::MaxRetriesExceeded),
            "handler_not_found" => Ok(DeadLetterReason::HandlerNotFound),
            "payload_decode_error" => Ok(DeadLetterReason::PayloadDecodeError),
            other => Err(anyhow!("invalid dead letter reason: {}", other)),
        }
    }
}

// ---------------------------------------------------------------------------
// Row types
// ---------------------------------------------------------------------------

/// Insert parameters for a new task row.
///
/// `task_type` must already be normalized (trimmed, lowercase) and
/// `max_retries` / `retry_delay_seconds` already clamped by the caller.
#[derive(Debug, Clone)]
pub struct NewTask {
    pub task_type: String,
    pub payload_json: String,
    pub idempotency_key: Option<String>,
    pub max_retries: i64,
    pub retry_delay_seconds: i64,
    pub ttl_seconds: i64,
}

/// A task claimed for execution, carrying everything the dispatch path needs.
/// `attempts` reflects the post-claim value.
#[derive(Debug, Clone)]
pub struct ClaimedTask {
    pub task_id: String,
    pub task_type: String,
    pub payload_json: String,
    pub attempts: i64,
    pub max_retries: i64,
    pub retry_delay_seconds: i64,
}

/// Read-only task state returned to callers of `get`.
///
/// `result` is decoded leniently: corrupt or non-object `result_json`
/// surfaces as `None`, never as an error.
#[derive(Debug, Clone, Serialize)]
pub struct TaskSnapshot {
    pub task_id: String,
    pub task_type: String,
    pub status: TaskStatus,
    pub attempts: i64,
    pub max_retries: i64,
    pub created_at: i64,
    pub updated_at: i64,
    pub expires_at: i64,
    pub result: Option<Value>,
    pub error: String,
    pub dead_letter_reason: String,
}

/// Outcome of the startup recovery sweep.
#[derive(Debug, Clone, Copy, Default)]
pub struct RecoveryOutcome {
    pub retried: u64,
    pub dead_lettered: u64,
}

// ---------------------------------------------------------------------------
// Purge
// ---------------------------------------------------------------------------

async fn purge_expired_with<'e, E>(executor: E, now: i64) -> Result<u64>
where
    E: sqlx::Executor<'e, Database = sqlx::Sqlite>,
{
    let result = sqlx::query(
        r#"
        delete from task_queue
        where expires_at <= $1
          and status in ($2, $3, $4)
        "#,
    )
    .bind(now)
    .bind(TaskStatus::Completed.as_str())
    .bind(TaskStatus::Failed.as_str())
    .bind(TaskStatus::DeadLetter.as_str())
    .execute(executor)
    .await
    .context("purge_expired failed")?;

    Ok(result.rows_affected())
}

/// Delete terminal rows whose TTL has elapsed.
///
/// Non-terminal rows are never purged: TTL is a retention policy for
/// finished history, not a cancellation mechanism.
pub async fn purge_expired(pool: &SqlitePool, now: i64) -> Result<u64> {
    purge_expired_with(pool, now).await
}

// ---------------------------------------------------------------------------
// Insert (idempotent submit)
// ---------------------------------------------------------------------------

/// Insert a new task row, returning its id.
///
/// Runs as one transaction: purge expired terminal rows, then — when an
/// idempotency key is present — return the most recent surviving row with
/// that key instead of inserting a duplicate.
pub async fn insert_task(pool: &SqlitePool, task: &NewTask, now: i64) -> Result<String> {
    let mut tx = pool.begin().await.context("insert_task begin failed")?;

    purge_expired_with(&mut *tx, now).await?;

    if let Some(key) = task.idempotency_key.as_deref() {
        let existing: Option<(String,)> = sqlx::query_as(
            r#"
            select task_id
            from task_queue
            where idempotency_key = $1
            order by created_at desc
            limit 1
            "#,
        )
        .bind(key)
        .fetch_optional(&mut *tx)
        .await
        .context("insert_task idempotency lookup failed")?;

        if let Some((task_id,)) = existing {
            tx.commit().await.context("insert_task commit failed")?;
            return Ok(task_id);
        }
    }

    let task_id = Uuid::new_v4().simple().to_string();
    sqlx::query(
        r#"
        insert into task_queue (
          task_id, task_type, payload_json, status, attempts, max_retries,
          retry_delay_seconds, available_at, created_at, updated_at,
          expires_at, idempotency_key, last_error, result_json, dead_letter_reason
        ) values ($1, $2, $3, $4, 0, $5, $6, $7, $8, $9, $10, $11, '', null, '')
        "#,
    )
    .bind(&task_id)
    .bind(&task.task_type)
    .bind(&task.payload_json)
    .bind(TaskStatus::Queued.as_str())
    .bind(task.max_retries)
    .bind(task.retry_delay_seconds)
    .bind(now)
    .bind(now)
    .bind(now)
    .bind(now + task.ttl_seconds)
    .bind(task.idempotency_key.as_deref())
    .execute(&mut *tx)
    .await
    .context("insert_task insert failed")?;

    tx.commit().await.context("insert_task commit failed")?;
    Ok(task_id)
}

// ---------------------------------------------------------------------------
// Snapshot
// ---------------------------------------------------------------------------

/// Fetch the read-only state of a task, purging expired terminal rows first.
pub async fn fetch_snapshot(
    pool: &SqlitePool,
    task_id: &str,
    now: i64,
) -> Result<Option<TaskSnapshot>> {
    purge_expired_with(pool, now).await?;

    let row = sqlx::query(
        r#"
        select task_id, task_type, status, attempts, max_retries,
               created_at, updated_at, expires_at, result_json,
               last_error, dead_letter_reason
        from task_queue
        where task_id = $1
        "#,
    )
    .bind(task_id)
    .fetch_optional(pool)
    .await
    .context("fetch_snapshot failed")?;

    let Some(row) = row else { return Ok(None) };

    // Corrupt or non-object result payloads surface as None, not an error.
    let result = row
        .try_get::<Option<String>, _>("result_json")?
        .and_then(|raw| serde_json::from_str::<Value>(&raw).ok())
        .filter(|value| value.is_object());

    Ok(Some(TaskSnapshot {
        task_id: row.try_get("task_id")?,
        task_type: row.try_get("task_type")?,
        status: TaskStatus::parse(&row.try_get::<String, _>("status")?)?,
        attempts: row.try_get("attempts")?,
        max_retries: row.try_get("max_retries")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
        expires_at: row.try_get("expires_at")?,
        result,
        error: row.try_get("last_error")?,
        dead_letter_reason: row.try_get("dead_letter_reason")?,
    }))
}

// ---------------------------------------------------------------------------
// Claim
// ---------------------------------------------------------------------------

/// Atomically claim the next due task, if any.
///
/// Selects at most one row with `status IN (queued, retrying)` whose
/// `available_at` has come due, ordered FIFO by `(available_at, created_at)`,
/// and transitions it to `running` with `attempts` incremented. Terminal
/// rows can never match the filter, so a terminal status is never mutated.
pub async fn claim_next_due(pool: &SqlitePool, now: i64) -> Result<Option<ClaimedTask>> {
    let mut tx = pool.begin().await.context("claim_next_due begin failed")?;

    let row = sqlx::query(
        r#"
        select task_id, task_type, payload_json, attempts, max_retries, retry_delay_seconds
        from task_queue
        where status in ($1, $2)
          and available_at <= $3
        order by available_at asc, created_at asc
        limit 1
        "#,
    )
    .bind(TaskStatus::Queued.as_str())
    .bind(TaskStatus::Retrying.as_str())
    .bind(now)
    .fetch_optional(&mut *tx)
    .await
    .context("claim_next_due select failed")?;

    let Some(row) = row else {
        tx.commit().await.context("claim_next_due commit failed")?;
        return Ok(None);
    };

    let task_id: String = row.try_get("task_id")?;
    let attempts: i64 = row.try_get::<i64, _>("attempts")? + 1;

    sqlx::query(
        r#"
        update task_queue
           set status = $1, attempts = $2, updated_at = $3
         where task_id = $4
        "#,
    )
    .bind(TaskStatus::Running.as_str())
    .bind(attempts)
    .bind(now)
    .bind(&task_id)
    .execute(&mut *tx)
    .await
    .context("claim_next_due update failed")?;

    tx.commit().await.context("claim_next_due commit failed")?;

    Ok(Some(ClaimedTask {
        task_id,
        task_type: row.try_get("task_type")?,
        payload_json: row.try_get("payload_json")?,
        attempts,
        max_retries: row.try_get("max_retries")?,
        retry_delay_seconds: row.try_get("retry_delay_seconds")?,
    }))
}

// ---------------------------------------------------------------------------
// Outcome transitions
// ---------------------------------------------------------------------------

/// Persist a successful completion: status `completed`, result stored,
/// error and dead-letter reason cleared.
pub async fn mark_completed(
    pool: &SqlitePool,
    task_id: &str,
    result_json: &str,
    now: i64,
) -> Result<()> {
    sqlx::query(
        r#"
        update task_queue
           set status = $1,
               result_json = $2,
               last_error = '',
               dead_letter_reason = '',
               updated_at = $3
         where task_id = $4
        "#,
    )
    .bind(TaskStatus::Completed.as_str())
    .bind(result_json)
    .bind(now)
    .bind(task_id)
    .execute(pool)
    .await
    .context("mark_completed failed")?;

    Ok(())
}

/// Apply the retry policy after a handler failure.
///
/// While `attempts <= max_retries` the task re-enters the queue as
/// `retrying` with `available_at = now + retry_delay_seconds * attempts`
/// (linear growth with the attempt count). Once the budget is exhausted the
/// task is dead-lettered with reason `max_retries_exceeded`.
///
/// Returns the resulting status, or `None` when the row no longer exists.
pub async fn mark_retry_or_dead_letter(
    pool: &SqlitePool,
    task_id: &str,
    error_message: &str,
    now: i64,
) -> Result<Option<TaskStatus>> {
    let mut tx = pool
        .begin()
        .await
        .context("mark_retry_or_dead_letter begin failed")?;

    let row = sqlx::query(
        r#"
        select attempts, max_retries, retry_delay_seconds
        from task_queue
        where task_id = $1
        "#,
    )
    .bind(task_id)
    .fetch_optional(&mut *tx)
    .await
    .context("mark_retry_or_dead_letter select failed")?;

    let Some(row) = row else {
        tx.commit()
            .await
            .context("mark_retry_or_dead_letter commit failed")?;
        return Ok(None);
    };

    let attempts: i64 = row.try_get("attempts")?;
    let max_retries: i64 = row.try_get("max_retries")?;
    let retry_delay_seconds: i64 = row.try_get("retry_delay_seconds")?;

    let status = if attempts <= max_retries {
        let next_available = now + retry_delay_seconds * attempts;
        sqlx::query(
            r#"
            update task_queue
               set status = $1,
                   available_at = $2,
                   updated_at = $3,
                   last_error = $4,
                   dead_letter_reason = ''
             where task_id = $5
            "#,
        )
        .bind(TaskStatus::Retrying.as_str())
        .bind(next_available)
        .bind(now)
        .bind(error_message)
        .bind(task_id)
        .execute(&mut *tx)
        .await
        .context("mark_retry_or_dead_letter retry update failed")?;
        TaskStatus::Retrying
    } else {
        sqlx::query(
            r#"
            update task_queue
               set status = $1,
                   updated_at = $2,
                   last_error = $3,
                   dead_letter_reason = $4
             where task_id = $5
            "#,
        )
        .bind(TaskStatus::DeadLetter.as_str())
        .bind(now)
        .bind(error_message)
        .bind(DeadLetterReason::MaxRetriesExceeded.as_str())
        .execute(&mut *tx)
        .await
        .context("mark_retry_or_dead_letter dead letter update failed")?;
        TaskStatus::DeadLetter
    };

    tx.commit()
        .await
        .context("mark_retry_or_dead_letter commit failed")?;
    Ok(Some(status))
}

/// Persist an explicit terminal failure.
///
/// `dead_letter = true` writes `dead_letter` with the given reason (the path
/// taken for structural failures such as a missing handler). `dead_letter =
/// false` writes the reserved `failed` status.
pub async fn mark_failed(
    pool: &SqlitePool,
    task_id: &str,
    error_message: &str,
    dead_letter: bool,
    reason: Option<DeadLetterReason>,
    now: i64,
) -> Result<()> {
    let status = if dead_letter {
        TaskStatus::DeadLetter
    } else {
        TaskStatus::Failed
    };

    sqlx::query(
        r#"
        update task_queue
           set status = $1,
               updated_at = $2,
               last_error = $3,
               dead_letter_reason = $4
         where task_id = $5
        "#,
    )
    .bind(status.as_str())
    .bind(now)
    .bind(error_message)
    .bind(reason.map(|r| r.as_str()).unwrap_or(""))
    .bind(task_id)
    .execute(pool)
    .await
    .context("mark_failed failed")?;

    Ok(())
}

// ---------------------------------------------------------------------------
// Startup recovery
// ---------------------------------------------------------------------------

/// Reset rows left in `running` by an unclean shutdown.
///
/// A crash between claim and completion strands the row in `running`
/// forever; no claim filter ever matches it again. Rows that still have
/// retry budget move back to `retrying` with `available_at = now`; rows
/// whose crashed attempt was already the last one are dead-lettered. The
/// crashed attempt consumed its increment at claim time, so the
/// `attempts <= max_retries + 1` bound is preserved either way.
pub async fn recover_interrupted(pool: &SqlitePool, now: i64) -> Result<RecoveryOutcome> {
    const INTERRUPTED_ERROR: &str = "interrupted before completion";

    let mut tx = pool
        .begin()
        .await
        .context("recover_interrupted begin failed")?;

    let retried = sqlx::query(
        r#"
        update task_queue
           set status = $1,
               available_at = $2,
               updated_at = $2,
               last_error = $3,
               dead_letter_reason = ''
         where status = $4
           and attempts <= max_retries
        "#,
    )
    .bind(TaskStatus::Retrying.as_str())
    .bind(now)
    .bind(INTERRUPTED_ERROR)
    .bind(TaskStatus::Running.as_str())
    .execute(&mut *tx)
    .await
    .context("recover_interrupted retry update failed")?
    .rows_affected();

    let dead_lettered = sqlx::query(
        r#"
        update task_queue
           set status = $1,
               updated_at = $2,
               last_error = $3,
               dead_letter_reason = $4
         where status = $5
           and attempts > max_retries
        "#,
    )
    .bind(TaskStatus::DeadLetter.as_str())
    .bind(now)
    .bind(INTERRUPTED_ERROR)
    .bind(DeadLetterReason::MaxRetriesExceeded.as_str())
    .bind(TaskStatus::Running.as_str())
    .execute(&mut *tx)
    .await
    .context("recover_interrupted dead letter update failed")?
    .rows_affected();

    tx.commit()
        .await
        .context("recover_interrupted commit failed")?;

    Ok(RecoveryOutcome {
        retried,
        dead_lettered,
    })
}

// ---------------------------------------------------------------------------
// Unit tests
// ---------------------------------------------------------------------------
