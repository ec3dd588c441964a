//! Versioned, in-code migration chain.
//!
//! The schema version lives in the `metadata` table (the per-origin KV
//! area). On open, every pending step runs in its own transaction; a failed
//! step rolls back and halts the chain, leaving the prior version intact.
//! Running the chain on an up-to-date store is a no-op.

use anyhow::{bail, Context, Result};
use chrono::Utc;
use serde_json::Value;
use sqlx::sqlite::SqlitePool;
use sqlx::SqliteConnection;

use tdk_schemas::TaskStatus;

use crate::meta_keys;

pub const SCHEMA_VERSION: i64 = 3;

/// Temp-id records older than this are purged by the hygiene step.
const TEMP_ID_MAX_AGE_MS: i64 = 24 * 60 * 60 * 1000;

/// Client-internal decorations that must not survive in stored bodies.
const INTERNAL_FIELDS: &[&str] = &["_checksum", "_cached_at", "_reconciliation_strategy"];

pub(crate) async fn run_migrations(pool: &SqlitePool) -> Result<()> {
    // The metadata table is the version bookkeeping itself, so it is created
    // outside the numbered chain.
    sqlx::query(
        "create table if not exists metadata (\
           key text primary key, \
           value text not null\
         )",
    )
    .execute(pool)
    .await
    .context("create metadata table failed")?;

    let current = read_version(pool).await?;
    if current > SCHEMA_VERSION {
        bail!("store schema v{current} is newer than this build (v{SCHEMA_VERSION})");
    }
    if current == SCHEMA_VERSION {
        return Ok(());
    }

    for version in (current + 1)..=SCHEMA_VERSION {
        apply_step(pool, version)
            .await
            .with_context(|| format!("migration v{version} failed; store left at v{}", version - 1))?;
        tracing::info!(version, "store migration applied");
    }

    Ok(())
}

async fn read_version(pool: &SqlitePool) -> Result<i64> {
    let row = sqlx::query_as::<_, (String,)>("select value from metadata where key = ?")
        .bind(meta_keys::SCHEMA_VERSION)
        .fetch_optional(pool)
        .await
        .context("read schema version failed")?;
    Ok(row.and_then(|(v,)| v.parse::<i64>().ok()).unwrap_or(0))
}

async fn apply_step(pool: &SqlitePool, version: i64) -> Result<()> {
    let mut tx = pool.begin().await?;

    match version {
        1 => migrate_v1_create_schema(&mut tx).await?,
        2 => migrate_v2_scrub_vector_clocks(&mut tx).await?,
        3 => migrate_v3_hygiene(&mut tx).await?,
        other => bail!("unknown migration step v{other}"),
    }

    sqlx::query(
        "insert into metadata (key, value) values (?, ?) \
         on conflict(key) do update set value = excluded.value",
    )
    .bind(meta_keys::SCHEMA_VERSION)
    .bind(version.to_string())
    .execute(&mut *tx)
    .await?;
    sqlx::query(
        "insert into metadata (key, value) values (?, ?) \
         on conflict(key) do update set value = excluded.value",
    )
    .bind(meta_keys::LAST_MIGRATION_AT)
    .bind(Utc::now().timestamp_millis().to_string())
    .execute(&mut *tx)
    .await?;

    tx.commit().await?;
    Ok(())
}

/// v1: create every section and its secondary indices.
async fn migrate_v1_create_schema(tx: &mut sqlx::Transaction<'_, sqlx::Sqlite>) -> Result<()> {
    let statements = [
        "create table if not exists tasks (\
           id text primary key, \
           workspace_id text not null, \
           status text not null, \
           meeting_id text, \
           updated_at_ms integer not null, \
           deleted_at_ms integer, \
           snoozed_until_ms integer, \
           body text not null\
         )",
        "create index if not exists idx_tasks_status on tasks(status)",
        "create index if not exists idx_tasks_meeting on tasks(meeting_id)",
        "create index if not exists idx_tasks_updated on tasks(updated_at_ms)",
        "create table if not exists task_assignees (\
           task_id text not null, \
           assignee_id text not null, \
           primary key (task_id, assignee_id)\
         )",
        "create index if not exists idx_assignees_user on task_assignees(assignee_id)",
        "create table if not exists events (\
           event_id text primary key, \
           workspace_id text not null, \
           sequence_num integer not null, \
           timestamp_ms integer not null, \
           body text not null\
         )",
        "create index if not exists idx_events_seq on events(sequence_num)",
        "create index if not exists idx_events_ts on events(timestamp_ms)",
        "create table if not exists offline_queue (\
           queue_id integer primary key autoincrement, \
           priority integer not null, \
           queued_at_ms integer not null, \
           task_ref text not null, \
           session_id text not null, \
           attempts integer not null default 0, \
           body text not null\
         )",
        "create index if not exists idx_queue_order on offline_queue(priority desc, queued_at_ms asc, queue_id asc)",
        "create table if not exists snapshots (\
           cache_key text primary key, \
           workspace_id text not null, \
           timestamp_ms integer not null, \
           checksum_full text not null, \
           body text not null\
         )",
        "create index if not exists idx_snapshots_ws on snapshots(workspace_id)",
        "create index if not exists idx_snapshots_ts on snapshots(timestamp_ms)",
        "create index if not exists idx_snapshots_checksum on snapshots(checksum_full)",
    ];

    for stmt in statements {
        sqlx::query(stmt).execute(&mut **tx).await?;
    }
    Ok(())
}

/// v2: reset vector clocks that are not an object of non-negative integer
/// components. A bad clock poisons every causal comparison downstream.
async fn migrate_v2_scrub_vector_clocks(tx: &mut sqlx::Transaction<'_, sqlx::Sqlite>) -> Result<()> {
    let rows = sqlx::query_as::<_, (String, String)>("select id, body from tasks")
        .fetch_all(&mut **tx)
        .await?;

    for (id, body) in rows {
        let Ok(mut doc) = serde_json::from_str::<Value>(&body) else {
            continue; // unreadable bodies are the hygiene step's problem
        };
        if !doc.is_object() || clock_is_valid(doc.get("vector_clock")) {
            continue;
        }
        doc["vector_clock"] = Value::Object(Default::default());
        update_body(&mut **tx, &id, &doc).await?;
    }
    Ok(())
}

fn clock_is_valid(clock: Option<&Value>) -> bool {
    match clock {
        None => true, // absent defaults to empty on read
        Some(Value::Object(map)) => map.values().all(|v| v.as_u64().is_some()),
        Some(_) => false,
    }
}

/// v3: hygiene pass.
/// - purge temp-id records older than 24 h (their reconciliation will never
///   arrive; a resync re-creates anything real),
/// - drop tasks missing required fields,
/// - normalize out-of-set status values to `todo`,
/// - strip client-internal fields from bodies.
async fn migrate_v3_hygiene(tx: &mut sqlx::Transaction<'_, sqlx::Sqlite>) -> Result<()> {
    let now_ms = Utc::now().timestamp_millis();

    sqlx::query("delete from offline_queue where task_ref like 'tmp_%' and queued_at_ms < ?")
        .bind(now_ms - TEMP_ID_MAX_AGE_MS)
        .execute(&mut **tx)
        .await?;
    sqlx::query("delete from tasks where id like 'tmp_%' and updated_at_ms < ?")
        .bind(now_ms - TEMP_ID_MAX_AGE_MS)
        .execute(&mut **tx)
        .await?;

    let rows = sqlx::query_as::<_, (String, String, String)>("select id, status, body from tasks")
        .fetch_all(&mut **tx)
        .await?;

    for (id, status, body) in rows {
        let Ok(mut doc) = serde_json::from_str::<Value>(&body) else {
            sqlx::query("delete from tasks where id = ?")
                .bind(&id)
                .execute(&mut **tx)
                .await?;
            continue;
        };

        let missing_required = doc
            .get("title")
            .and_then(Value::as_str)
            .map(str::is_empty)
            .unwrap_or(true)
            || doc
                .get("workspace_id")
                .and_then(Value::as_str)
                .map(str::is_empty)
                .unwrap_or(true);
        if missing_required {
            sqlx::query("delete from tasks where id = ?")
                .bind(&id)
                .execute(&mut **tx)
                .await?;
            sqlx::query("delete from task_assignees where task_id = ?")
                .bind(&id)
                .execute(&mut **tx)
                .await?;
            continue;
        }

        let mut dirty = false;

        if TaskStatus::parse(&status).is_none() {
            doc["status"] = Value::String(TaskStatus::Todo.as_str().to_string());
            sqlx::query("update tasks set status = ? where id = ?")
                .bind(TaskStatus::Todo.as_str())
                .bind(&id)
                .execute(&mut **tx)
                .await?;
            dirty = true;
        } else if doc
            .get("status")
            .and_then(Value::as_str)
            .and_then(TaskStatus::parse)
            .is_none()
        {
            doc["status"] = Value::String(status.clone());
            dirty = true;
        }

        if let Value::Object(map) = &mut doc {
            for field in INTERNAL_FIELDS {
                if map.remove(*field).is_some() {
                    dirty = true;
                }
            }
        }

        if dirty {
            update_body(&mut **tx, &id, &doc).await?;
        }
    }
    Ok(())
}

async fn update_body(conn: &mut SqliteConnection, id: &str, doc: &Value) -> Result<()> {
    sqlx::query("update tasks set body = ? where id = ?")
        .bind(doc.to_string())
        .bind(id)
        .execute(conn)
        .await
        .with_context(|| format!("rewrite body for task {id} failed"))?;
    Ok(())
}
