//! SQLite migration runner for queue infrastructure tables.
//!
//! Scripts are embedded at compile time and applied in ascending filename
//! order. Applied script ids are tracked in `schema_migrations`, so repeated
//! calls are no-ops. Any SQL error fails the entire call; callers must treat
//! that as a fatal initialization failure.

use anyhow::{Context, Result};
use chrono::Utc;
use sqlx::sqlite::{SqliteConnectOptions, SqliteConnection};
use sqlx::{ConnectOptions, Connection, Executor};
use std::path::Path;

struct MigrationScript {
    migration_id: &'static str,
    sql: &'static str,
}

/// Embedded migration scripts, listed in ascending filename order.
const MIGRATIONS: &[MigrationScript] = &[
    MigrationScript {
        migration_id: "0001_task_queue.sql",
        sql: include_str!("../migrations/0001_task_queue.sql"),
    },
    MigrationScript {
        migration_id: "0002_task_queue_dead_letter_index.sql",
        sql: include_str!("../migrations/0002_task_queue_dead_letter_index.sql"),
    },
];

/// Apply all pending migrations to the database at `database_path`.
///
/// Creates the parent directory and the database file when missing. Each
/// script is executed as a unit inside one transaction committed at the end.
pub async fn apply(database_path: impl AsRef<Path>) -> Result<()> {
    let path = database_path.as_ref();
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("create_dir_all {parent:?}"))?;
        }
    }

    let mut conn: SqliteConnection = SqliteConnectOptions::new()
        .filename(path)
        .create_if_missing(true)
        .connect()
        .await
        .with_context(|| format!("open database for migrations: {path:?}"))?;

    conn.execute(
        r#"
        create table if not exists schema_migrations (
          migration_id text primary key,
          applied_at integer not null
        )
        "#,
    )
    .await
    .context("create schema_migrations failed")?;

    let mut tx = conn
        .begin()
        .await
        .context("migration transaction begin failed")?;

    for script in MIGRATIONS {
        let already_applied: Option<(i64,)> =
            sqlx::query_as("select 1 from schema_migrations where migration_id = $1")
                .bind(script.migration_id)
                .fetch_optional(&mut *tx)
                .await
                .with_context(|| format!("migration lookup failed: {}", script.migration_id))?;
        if already_applied.is_some() {
            continue;
        }

        (&mut *tx)
            .execute(script.sql)
            .await
            .with_context(|| format!("migration script failed: {}", script.migration_id))?;

        sqlx::query("insert into schema_migrations (migration_id, applied_at) values ($1, $2)")
            .bind(script.migration_id)
            .bind(Utc::now().timestamp())
            .execute(&mut *tx)
            .await
            .with_context(|| format!("migration marker insert failed: {}", script.migration_id))?;
    }

    tx.commit().await.context("migration commit failed")?;
    conn.close()
        .await
        .context("close migration connection failed")?;
    Ok(())
}
