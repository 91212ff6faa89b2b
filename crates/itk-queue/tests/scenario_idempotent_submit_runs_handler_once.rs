use anyhow::bail;
use itk_queue::{QueueSettings, TaskPayload, TaskQueue, TaskSnapshot, TaskStatus, TaskSubmission};
use serde_json::Value;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

fn test_settings(dir: &tempfile::TempDir) -> QueueSettings {
    let mut settings = QueueSettings::new(dir.path().join("queue.db"));
    settings.default_ttl_seconds = 60;
    settings.default_max_retries = 2;
    settings.default_retry_delay_seconds = 1;
    settings.worker_poll_interval = Duration::from_millis(10);
    settings
}

async fn wait_terminal(queue: &TaskQueue, task_id: &str) -> anyhow::Result<TaskSnapshot> {
    for _ in 0..300 {
        if let Some(snapshot) = queue.get(task_id).await? {
            if snapshot.status.is_terminal() {
                return Ok(snapshot);
            }
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    bail!("task did not reach a terminal state in time")
}

#[tokio::test]
async fn duplicate_submits_share_one_task_and_one_invocation() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let queue = TaskQueue::open(test_settings(&dir)).await?;

    let invocations = Arc::new(AtomicUsize::new(0));
    let handler_invocations = Arc::clone(&invocations);
    queue.register_handler("idem", move |payload: TaskPayload| {
        let invocations = Arc::clone(&handler_invocations);
        async move {
            invocations.fetch_add(1, Ordering::SeqCst);
            Ok(payload)
        }
    })?;
    queue.start().await;

    let mut first_payload = TaskPayload::new();
    first_payload.insert("value".to_string(), Value::from(1));
    let mut second_payload = TaskPayload::new();
    second_payload.insert("value".to_string(), Value::from(2));

    let first = queue
        .submit(TaskSubmission::new("idem", first_payload).idempotency_key("upload-123"))
        .await?;
    let second = queue
        .submit(TaskSubmission::new("idem", second_payload).idempotency_key("upload-123"))
        .await?;

    assert_eq!(first, second, "both submitters observe the same task id");

    let result = wait_terminal(&queue, &first).await?;
    assert_eq!(result.status, TaskStatus::Completed);
    // First submission wins: the second payload was never enqueued.
    assert_eq!(result.result, Some(serde_json::json!({"value": 1})));

    // Give the worker a chance to (incorrectly) run anything else.
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(invocations.load(Ordering::SeqCst), 1);

    queue.stop().await;
    queue.close().await;
    Ok(())
}

#[tokio::test]
async fn distinct_keys_run_independently() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let queue = TaskQueue::open(test_settings(&dir)).await?;

    queue.register_handler("idem", |payload: TaskPayload| async move { Ok(payload) })?;
    queue.start().await;

    let first = queue
        .submit(TaskSubmission::new("idem", TaskPayload::new()).idempotency_key("upload-1"))
        .await?;
    let second = queue
        .submit(TaskSubmission::new("idem", TaskPayload::new()).idempotency_key("upload-2"))
        .await?;
    assert_ne!(first, second);

    assert_eq!(wait_terminal(&queue, &first).await?.status, TaskStatus::Completed);
    assert_eq!(wait_terminal(&queue, &second).await?.status, TaskStatus::Completed);

    queue.stop().await;
    queue.close().await;
    Ok(())
}
