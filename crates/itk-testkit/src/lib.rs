//! Test tooling for the intake-core workspace: an in-memory repository and
//! record store, a pass-through intake profile, queue builders against
//! tempfile-backed databases, and polling helpers for scenario tests.

use anyhow::{bail, Result};
use serde_json::{json, Map, Value};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;

use itk_enrich::{EnrichmentService, EnrichmentSettings, IntakeProfile, RecordStore};
use itk_queue::{QueueSettings, TaskQueue, TaskSnapshot};

mod memory_repo;

pub use memory_repo::MemoryRepository;

pub const TEST_TARGET_URL: &str = "https://example.test/form";

/// Initialize env-filtered test tracing. Safe to call from every test; only
/// the first call installs the subscriber.
pub fn init_test_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

// ---------------------------------------------------------------------------
// Queue helpers
// ---------------------------------------------------------------------------

/// Queue settings tuned for tests: short TTL, fast polling, one retry by
/// default, backed by a database file inside `dir`.
pub fn test_queue_settings(dir: &tempfile::TempDir) -> QueueSettings {
    let mut settings = QueueSettings::new(dir.path().join("queue.db"));
    settings.default_ttl_seconds = 60;
    settings.default_max_retries = 1;
    settings.default_retry_delay_seconds = 1;
    settings.worker_poll_interval = Duration::from_millis(10);
    settings
}

/// Open a queue against a fresh database inside `dir` with the test
/// settings.
pub async fn temp_queue(dir: &tempfile::TempDir) -> Result<TaskQueue> {
    TaskQueue::open(test_queue_settings(dir)).await
}

/// Poll `get` until the task reaches a terminal status.
pub async fn wait_for_terminal(queue: &TaskQueue, task_id: &str) -> Result<TaskSnapshot> {
    for _ in 0..500 {
        if let Some(snapshot) = queue.get(task_id).await? {
            if snapshot.status.is_terminal() {
                return Ok(snapshot);
            }
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    bail!("task did not reach a terminal state in time")
}

// ---------------------------------------------------------------------------
// Enrichment doubles
// ---------------------------------------------------------------------------

/// Profile that passes payloads through untouched and reports no missing
/// fields. Scenario tests care about enrichment semantics, not form rules.
#[derive(Default)]
pub struct PassthroughProfile;

impl IntakeProfile for PassthroughProfile {
    fn normalize_payload(&self, payload: Value) -> Value {
        payload
    }

    fn missing_fields(&self, _payload: &Value, _require_tramite: bool) -> Vec<String> {
        Vec::new()
    }
}

/// Map-backed runtime record store.
#[derive(Default)]
pub struct MemoryRecordStore {
    records: Mutex<HashMap<String, Value>>,
}

impl MemoryRecordStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn get(&self, document_id: &str) -> Option<Value> {
        self.records.lock().await.get(document_id).cloned()
    }
}

#[async_trait::async_trait]
impl RecordStore for MemoryRecordStore {
    async fn read_or_bootstrap(&self, document_id: &str) -> Result<Value> {
        let mut records = self.records.lock().await;
        let record = records
            .entry(document_id.to_string())
            .or_insert_with(|| json!({"payload": Map::<String, Value>::new()}));
        Ok(record.clone())
    }

    async fn write(&self, document_id: &str, record: Value) -> Result<()> {
        self.records
            .lock()
            .await
            .insert(document_id.to_string(), record);
        Ok(())
    }
}

/// Enrichment service wired to in-memory doubles.
pub fn test_enrichment_service(
    repo: Arc<MemoryRepository>,
    records: Arc<MemoryRecordStore>,
) -> EnrichmentService {
    EnrichmentService::new(
        repo,
        Arc::new(PassthroughProfile),
        records,
        EnrichmentSettings {
            default_target_url: TEST_TARGET_URL.to_string(),
        },
    )
}
