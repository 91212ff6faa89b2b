//! Durable task queue runtime.
//!
//! [`TaskQueue`] wraps the SQLite storage layer in `itk-db` with a handler
//! registry and a single background worker: submit tasks from any thread,
//! register async handlers per task type, and poll `get` for outcomes.
//! Tasks survive process restarts; handler failures become queue state
//! (retry with linear backoff, then dead-letter), never panics or errors at
//! the call site.

use anyhow::{bail, Context, Result};
use chrono::Utc;
use serde_json::Value;
use sqlx::SqlitePool;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

mod handler;

pub use handler::{TaskHandler, TaskPayload, TaskResult};
pub use itk_db::{DeadLetterReason, TaskSnapshot, TaskStatus};

use handler::HandlerRegistry;

// ---------------------------------------------------------------------------
// Settings
// ---------------------------------------------------------------------------

/// Queue runtime settings.
#[derive(Debug, Clone)]
pub struct QueueSettings {
    /// Path of the embedded SQLite database backing the queue.
    pub database_path: PathBuf,
    /// Retention window for terminal task history.
    pub default_ttl_seconds: i64,
    /// Retry budget; a task gets `max_retries + 1` attempts in total.
    pub default_max_retries: i64,
    /// Base unit of the linear backoff (`delay * attempts`).
    pub default_retry_delay_seconds: i64,
    /// Idle sleep between polls when no task is due.
    pub worker_poll_interval: Duration,
}

impl QueueSettings {
    pub fn new(database_path: impl Into<PathBuf>) -> Self {
        Self {
            database_path: database_path.into(),
            default_ttl_seconds: 24 * 60 * 60,
            default_max_retries: 3,
            default_retry_delay_seconds: 5,
            worker_poll_interval: Duration::from_millis(500),
        }
    }
}

/// Overlay the typed `queue.*` config section onto the built-in defaults.
/// Absent keys keep the defaults; the config layer has already clamped
/// retry counts and delays.
impl From<itk_config::QueueConfig> for QueueSettings {
    fn from(cfg: itk_config::QueueConfig) -> Self {
        let mut settings = Self::new(cfg.database_path);
        if let Some(ttl) = cfg.default_ttl_seconds {
            settings.default_ttl_seconds = ttl;
        }
        if let Some(retries) = cfg.default_max_retries {
            settings.default_max_retries = retries;
        }
        if let Some(delay) = cfg.default_retry_delay_seconds {
            settings.default_retry_delay_seconds = delay;
        }
        if let Some(interval) = cfg.worker_poll_interval {
            settings.worker_poll_interval = interval;
        }
        settings
    }
}

// ---------------------------------------------------------------------------
// Submission
// ---------------------------------------------------------------------------

/// Parameters for `submit`. Per-task overrides fall back to the queue
/// defaults when absent.
#[derive(Debug, Clone)]
pub struct TaskSubmission {
    pub task_type: String,
    pub payload: TaskPayload,
    /// Empty string disables de-duplication.
    pub idempotency_key: String,
    pub ttl_seconds: Option<i64>,
    pub max_retries: Option<i64>,
    pub retry_delay_seconds: Option<i64>,
}

impl TaskSubmission {
    pub fn new(task_type: impl Into<String>, payload: TaskPayload) -> Self {
        Self {
            task_type: task_type.into(),
            payload,
            idempotency_key: String::new(),
            ttl_seconds: None,
            max_retries: None,
            retry_delay_seconds: None,
        }
    }

    pub fn idempotency_key(mut self, key: impl Into<String>) -> Self {
        self.idempotency_key = key.into();
        self
    }

    pub fn ttl_seconds(mut self, ttl: i64) -> Self {
        self.ttl_seconds = Some(ttl);
        self
    }

    pub fn max_retries(mut self, retries: i64) -> Self {
        self.max_retries = Some(retries);
        self
    }

    pub fn retry_delay_seconds(mut self, delay: i64) -> Self {
        self.retry_delay_seconds = Some(delay);
        self
    }
}

fn normalize_task_type(raw: &str) -> Result<String> {
    let normalized = raw.trim().to_lowercase();
    if normalized.is_empty() {
        bail!("task_type is required");
    }
    Ok(normalized)
}

// ---------------------------------------------------------------------------
// TaskQueue
// ---------------------------------------------------------------------------

struct QueueInner {
    settings: QueueSettings,
    pool: SqlitePool,
    handlers: HandlerRegistry,
    stop_tx: watch::Sender<bool>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

/// SQLite-backed task queue that survives process restarts.
#[derive(Clone)]
pub struct TaskQueue {
    inner: Arc<QueueInner>,
}

impl TaskQueue {
    /// Open the queue: apply migrations, open the single-connection pool and
    /// sweep tasks left in `running` by an unclean shutdown.
    pub async fn open(settings: QueueSettings) -> Result<Self> {
        itk_db::migrations::apply(&settings.database_path).await?;
        let pool = itk_db::open_pool(&settings.database_path).await?;

        let recovered = itk_db::recover_interrupted(&pool, Utc::now().timestamp()).await?;
        if recovered.retried > 0 || recovered.dead_lettered > 0 {
            info!(
                retried = recovered.retried,
                dead_lettered = recovered.dead_lettered,
                "recovered tasks interrupted by unclean shutdown"
            );
        }

        let (stop_tx, _stop_rx) = watch::channel(false);
        Ok(Self {
            inner: Arc::new(QueueInner {
                settings,
                pool,
                handlers: HandlerRegistry::default(),
                stop_tx,
                worker: Mutex::new(None),
            }),
        })
    }

    /// Register an async handler for a task type. The type is trimmed and
    /// lowercased; re-registering replaces the previous handler.
    pub fn register_handler(
        &self,
        task_type: &str,
        handler: impl TaskHandler + 'static,
    ) -> Result<()> {
        let normalized = normalize_task_type(task_type)?;
        self.inner.handlers.insert(normalized, Arc::new(handler));
        Ok(())
    }

    /// Enqueue a task and return its id.
    ///
    /// When `idempotency_key` is non-empty and a non-expired task with the
    /// same key exists, that task's id is returned instead of creating a
    /// duplicate.
    pub async fn submit(&self, submission: TaskSubmission) -> Result<String> {
        let now = Utc::now().timestamp();
        let task_type = normalize_task_type(&submission.task_type)?;

        let ttl_seconds = submission
            .ttl_seconds
            .unwrap_or(self.inner.settings.default_ttl_seconds);
        let max_retries = submission
            .max_retries
            .unwrap_or(self.inner.settings.default_max_retries)
            .max(0);
        let retry_delay_seconds = submission
            .retry_delay_seconds
            .unwrap_or(self.inner.settings.default_retry_delay_seconds)
            .max(1);

        let key = submission.idempotency_key.trim();
        let idempotency_key = if key.is_empty() {
            None
        } else {
            Some(key.to_string())
        };

        let payload_json =
            serde_json::to_string(&submission.payload).context("encode task payload failed")?;

        let task = itk_db::NewTask {
            task_type,
            payload_json,
            idempotency_key,
            max_retries,
            retry_delay_seconds,
            ttl_seconds,
        };
        itk_db::insert_task(&self.inner.pool, &task, now).await
    }

    /// Return the task's current state, or `None` when unknown or already
    /// purged. Never fails on corrupt stored results.
    pub async fn get(&self, task_id: &str) -> Result<Option<TaskSnapshot>> {
        itk_db::fetch_snapshot(&self.inner.pool, task_id, Utc::now().timestamp()).await
    }

    /// Start the background worker if not already running. Idempotent.
    pub async fn start(&self) {
        let mut worker = self.inner.worker.lock().await;
        if let Some(handle) = worker.as_ref() {
            if !handle.is_finished() {
                return;
            }
        }

        self.inner.stop_tx.send_replace(false);
        let inner = Arc::clone(&self.inner);
        *worker = Some(tokio::spawn(async move {
            worker_loop(inner).await;
        }));
    }

    /// Signal the worker to stop and wait for it to exit. An in-flight
    /// handler is not cancelled; the loop exits after it finishes.
    pub async fn stop(&self) {
        self.inner.stop_tx.send_replace(true);
        let handle = self.inner.worker.lock().await.take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                error!(?e, "queue worker join failed");
            }
        }
    }

    /// Release the storage pool. Call after `stop`.
    pub async fn close(&self) {
        self.inner.pool.close().await;
    }
}

// ---------------------------------------------------------------------------
// Worker loop
// ---------------------------------------------------------------------------

async fn worker_loop(inner: Arc<QueueInner>) {
    let mut stop_rx = inner.stop_tx.subscribe();
    debug!("queue worker started");

    loop {
        if *stop_rx.borrow() {
            break;
        }

        match process_next_due_task(&inner).await {
            Ok(true) => continue,
            Ok(false) => {}
            Err(e) => {
                // Storage failures must not kill the worker; try again on the
                // next tick.
                error!(error = ?e, "queue worker tick failed");
            }
        }

        tokio::select! {
            _ = stop_rx.changed() => {}
            _ = tokio::time::sleep(inner.settings.worker_poll_interval) => {}
        }
    }

    debug!("queue worker stopped");
}

/// Claim and process one due task. Returns `false` when nothing was due.
async fn process_next_due_task(inner: &QueueInner) -> Result<bool> {
    let now = Utc::now().timestamp();
    let Some(claimed) = itk_db::claim_next_due(&inner.pool, now).await? else {
        return Ok(false);
    };

    let Some(handler) = inner.handlers.get(&claimed.task_type) else {
        warn!(
            task_id = %claimed.task_id,
            task_type = %claimed.task_type,
            "no handler registered; dead-lettering"
        );
        itk_db::mark_failed(
            &inner.pool,
            &claimed.task_id,
            &format!(
                "no handler registered for task_type={}",
                claimed.task_type
            ),
            true,
            Some(DeadLetterReason::HandlerNotFound),
            Utc::now().timestamp(),
        )
        .await?;
        return Ok(true);
    };

    let payload = match serde_json::from_str::<Value>(&claimed.payload_json) {
        // Non-object payloads are tolerated as an empty map; only broken
        // JSON is a structural failure.
        Ok(Value::Object(map)) => map,
        Ok(_) => TaskPayload::new(),
        Err(_) => {
            itk_db::mark_failed(
                &inner.pool,
                &claimed.task_id,
                "invalid payload JSON",
                true,
                Some(DeadLetterReason::PayloadDecodeError),
                Utc::now().timestamp(),
            )
            .await?;
            return Ok(true);
        }
    };

    // Handler runs with no storage connection checked out, so long handlers
    // never block submitters or status queries.
    match handler.run(payload).await {
        Ok(result) => {
            let result_json =
                serde_json::to_string(&result).context("encode task result failed")?;
            itk_db::mark_completed(
                &inner.pool,
                &claimed.task_id,
                &result_json,
                Utc::now().timestamp(),
            )
            .await?;
            debug!(task_id = %claimed.task_id, "task completed");
        }
        Err(e) => {
            let message = {
                let text = e.to_string();
                if text.is_empty() {
                    "handler error".to_string()
                } else {
                    text
                }
            };
            let outcome = itk_db::mark_retry_or_dead_letter(
                &inner.pool,
                &claimed.task_id,
                &message,
                Utc::now().timestamp(),
            )
            .await?;
            warn!(
                task_id = %claimed.task_id,
                outcome = ?outcome,
                error = %message,
                "task handler failed"
            );
        }
    }

    Ok(true)
}

// ---------------------------------------------------------------------------
// Unit tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn task_type_is_trimmed_and_lowercased() {
        assert_eq!(normalize_task_type("  Enrich_Document ").unwrap(), "enrich_document");
        assert!(normalize_task_type("   ").is_err());
        assert!(normalize_task_type("").is_err());
    }

    #[test]
    fn settings_defaults_match_queue_contract() {
        let settings = QueueSettings::new("runtime/queue.db");
        assert_eq!(settings.default_ttl_seconds, 86_400);
        assert_eq!(settings.default_max_retries, 3);
        assert_eq!(settings.default_retry_delay_seconds, 5);
        assert_eq!(settings.worker_poll_interval, Duration::from_millis(500));
    }

    #[test]
    fn settings_from_queue_config_overlay_present_keys_only() {
        let cfg = itk_config::QueueConfig {
            database_path: PathBuf::from("runtime/queue.db"),
            default_ttl_seconds: Some(120),
            default_max_retries: None,
            default_retry_delay_seconds: Some(2),
            worker_poll_interval: None,
        };
        let settings = QueueSettings::from(cfg);
        assert_eq!(settings.database_path, PathBuf::from("runtime/queue.db"));
        assert_eq!(settings.default_ttl_seconds, 120);
        assert_eq!(settings.default_max_retries, 3, "absent keys keep the defaults");
        assert_eq!(settings.default_retry_delay_seconds, 2);
        assert_eq!(settings.worker_poll_interval, Duration::from_millis(500));
    }
}
