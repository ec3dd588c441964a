//! The durable local store — single source of truth for the client core.
//!
//! SQLite-backed, one section per table: `tasks`, `events`, `offline_queue`,
//! `metadata`, `snapshots`. The pool is capped at one connection so writes
//! serialize; batch writes run in a transaction and are atomic. Only this
//! crate touches persisted state; every write emits a [`StoreChange`] on the
//! change bus so subscribers (dispatcher, sibling-tab bridge, UI) observe
//! mutations without polling.

use std::path::Path;
use std::str::FromStr;

use anyhow::{Context, Result};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use tokio::sync::broadcast;

mod migrations;
mod queue;
mod snapshots;
mod tasks;

pub use migrations::SCHEMA_VERSION;
pub use snapshots::SNAPSHOT_TTL_MS;
pub use tasks::ReconcileOutcome;

/// Metadata keys owned by the core. Kept in one place so components do not
/// invent ad-hoc spellings.
pub mod meta_keys {
    pub const SCHEMA_VERSION: &str = "schema_version";
    pub const LAST_MIGRATION_AT: &str = "last_migration_at";
    pub const LAST_EVENT_ID: &str = "last_event_id";
    pub const LAST_SEQUENCE: &str = "last_sequence";
    pub const LAST_CHECKSUM: &str = "last_checksum";
    pub const LAST_IDLE_SYNC: &str = "last_idle_sync";
    pub const USERS_MAP: &str = "users_map";
    pub const VIEW_FILTER: &str = "view_filter";
}

/// Change notification emitted after every committed write.
#[derive(Debug, Clone)]
pub enum StoreChange {
    TaskSaved { id: String },
    TasksSaved { ids: Vec<String> },
    TaskDeleted { id: String },
    TempIdReconciled { temp_id: String, real_id: String },
    QueueChanged,
    SnapshotSaved { cache_key: String },
    MetadataSet { key: String },
    Cleared,
}

/// Default bound on the offline queue. Overflow evicts the oldest entry.
pub const DEFAULT_QUEUE_CAP: i64 = 500;
/// How many applied events are retained for duplicate detection / gap fill.
pub const EVENT_HISTORY_CAP: i64 = 500;

pub struct LocalStore {
    pool: SqlitePool,
    changes: broadcast::Sender<StoreChange>,
}

impl LocalStore {
    /// Open (creating if missing) and migrate a store at `path`.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self> {
        let opts = SqliteConnectOptions::new()
            .filename(path.as_ref())
            .create_if_missing(true);
        Self::open_with(opts).await
    }

    /// Ephemeral store for tests and tooling.
    pub async fn open_in_memory() -> Result<Self> {
        let opts = SqliteConnectOptions::from_str("sqlite::memory:")
            .context("parse in-memory sqlite options")?;
        Self::open_with(opts).await
    }

    async fn open_with(opts: SqliteConnectOptions) -> Result<Self> {
        // One connection: writes serialize, batches are atomic, and an
        // in-memory database is not silently duplicated per connection.
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(opts)
            .await
            .context("failed to open local store")?;

        let (changes, _rx) = broadcast::channel::<StoreChange>(256);
        let store = Self { pool, changes };
        migrations::run_migrations(&store.pool).await?;
        Ok(store)
    }

    pub(crate) fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Subscribe to committed-write notifications.
    pub fn subscribe_changes(&self) -> broadcast::Receiver<StoreChange> {
        self.changes.subscribe()
    }

    pub(crate) fn notify(&self, change: StoreChange) {
        // No receivers is fine; the bus is best-effort.
        let _ = self.changes.send(change);
    }

    // -----------------------------------------------------------------------
    // Metadata section
    // -----------------------------------------------------------------------

    pub async fn set_metadata(&self, key: &str, value: &str) -> Result<()> {
        sqlx::query(
            "insert into metadata (key, value) values (?, ?) \
             on conflict(key) do update set value = excluded.value",
        )
        .bind(key)
        .bind(value)
        .execute(&self.pool)
        .await
        .with_context(|| format!("set_metadata {key} failed"))?;

        self.notify(StoreChange::MetadataSet {
            key: key.to_string(),
        });
        Ok(())
    }

    pub async fn get_metadata(&self, key: &str) -> Result<Option<String>> {
        let row = sqlx::query_as::<_, (String,)>("select value from metadata where key = ?")
            .bind(key)
            .fetch_optional(&self.pool)
            .await
            .with_context(|| format!("get_metadata {key} failed"))?;
        Ok(row.map(|(v,)| v))
    }

    /// `last_sequence` watermark, zero when never set.
    pub async fn last_sequence(&self) -> Result<u64> {
        Ok(self
            .get_metadata(meta_keys::LAST_SEQUENCE)
            .await?
            .and_then(|v| v.parse::<u64>().ok())
            .unwrap_or(0))
    }

    pub async fn set_last_sequence(&self, seq: u64) -> Result<()> {
        self.set_metadata(meta_keys::LAST_SEQUENCE, &seq.to_string())
            .await
    }

    // -----------------------------------------------------------------------
    // Whole-store maintenance
    // -----------------------------------------------------------------------

    /// Drop every section. Schema and version survive.
    pub async fn clear_all(&self) -> Result<()> {
        let mut tx = self.pool.begin().await.context("clear_all begin failed")?;
        for table in ["task_assignees", "tasks", "events", "offline_queue", "snapshots"] {
            sqlx::query(&format!("delete from {table}"))
                .execute(&mut *tx)
                .await
                .with_context(|| format!("clear_all: delete from {table} failed"))?;
        }
        sqlx::query("delete from metadata where key != ?")
            .bind(meta_keys::SCHEMA_VERSION)
            .execute(&mut *tx)
            .await
            .context("clear_all: reset metadata failed")?;
        tx.commit().await.context("clear_all commit failed")?;

        self.notify(StoreChange::Cleared);
        Ok(())
    }

    /// Corruption escape hatch: remove task rows whose bodies no longer
    /// parse, bounded at `max_removals`. Returns the number removed; the
    /// caller follows up with a bootstrap request.
    pub async fn emergency_cleanup(&self, max_removals: usize) -> Result<usize> {
        let rows = sqlx::query_as::<_, (String, String)>("select id, body from tasks")
            .fetch_all(&self.pool)
            .await
            .context("emergency_cleanup scan failed")?;

        let mut removed = 0usize;
        for (id, body) in rows {
            if removed >= max_removals {
                break;
            }
            if serde_json::from_str::<tdk_schemas::Task>(&body).is_err() {
                tracing::warn!(task_id = %id, "emergency cleanup: dropping unreadable task record");
                self.delete_task_raw(&id).await?;
                removed += 1;
            }
        }
        Ok(removed)
    }
}
