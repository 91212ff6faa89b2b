use itk_db::{NewTask, TaskStatus};
use sqlx::SqlitePool;

async fn queue_pool() -> anyhow::Result<(tempfile::TempDir, SqlitePool)> {
    let dir = tempfile::tempdir()?;
    let db_path = dir.path().join("queue.db");
    itk_db::migrations::apply(&db_path).await?;
    let pool = itk_db::open_pool(&db_path).await?;
    Ok((dir, pool))
}

fn sample_task() -> NewTask {
    NewTask {
        task_type: "sample".to_string(),
        payload_json: "{}".to_string(),
        idempotency_key: None,
        max_retries: 0,
        retry_delay_seconds: 1,
        ttl_seconds: 3600,
    }
}

#[tokio::test]
async fn corrupt_result_json_surfaces_as_null_result() -> anyhow::Result<()> {
    let (_dir, pool) = queue_pool().await?;

    let task_id = itk_db::insert_task(&pool, &sample_task(), 100).await?;
    itk_db::claim_next_due(&pool, 100).await?.expect("claimable");
    itk_db::mark_completed(&pool, &task_id, r#"{"value":42}"#, 100).await?;

    // Corrupt the stored result out-of-band.
    sqlx::query("update task_queue set result_json = $1 where task_id = $2")
        .bind("{not json")
        .bind(&task_id)
        .execute(&pool)
        .await?;

    let snapshot = itk_db::fetch_snapshot(&pool, &task_id, 100)
        .await?
        .expect("row exists");
    assert_eq!(snapshot.status, TaskStatus::Completed);
    assert_eq!(snapshot.result, None, "corrupt result decodes to null");

    pool.close().await;
    Ok(())
}

#[tokio::test]
async fn non_object_result_json_surfaces_as_null_result() -> anyhow::Result<()> {
    let (_dir, pool) = queue_pool().await?;

    let task_id = itk_db::insert_task(&pool, &sample_task(), 100).await?;
    itk_db::claim_next_due(&pool, 100).await?.expect("claimable");
    itk_db::mark_completed(&pool, &task_id, "[1, 2, 3]", 100).await?;

    let snapshot = itk_db::fetch_snapshot(&pool, &task_id, 100)
        .await?
        .expect("row exists");
    assert_eq!(snapshot.result, None, "non-object results are discarded");

    pool.close().await;
    Ok(())
}
