//! Analytics snapshot cache: keyed by (workspace, filter window), freshness
//! bounded by TTL, invalidated eagerly when sequenced events touch the
//! workspace. The TTL only gates reads when no event stream is attached.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};

use tdk_schemas::AnalyticsSnapshot;

use crate::{LocalStore, StoreChange};

/// Freshness bound for snapshot reads.
pub const SNAPSHOT_TTL_MS: i64 = 60_000;

impl LocalStore {
    pub async fn save_snapshot(&self, snapshot: &AnalyticsSnapshot) -> Result<()> {
        let body = serde_json::to_string(snapshot).context("serialize snapshot failed")?;
        sqlx::query(
            "insert into snapshots (cache_key, workspace_id, timestamp_ms, checksum_full, body) \
             values (?, ?, ?, ?, ?) \
             on conflict(cache_key) do update set \
               workspace_id = excluded.workspace_id, \
               timestamp_ms = excluded.timestamp_ms, \
               checksum_full = excluded.checksum_full, \
               body = excluded.body",
        )
        .bind(&snapshot.cache_key)
        .bind(&snapshot.workspace_id)
        .bind(snapshot.timestamp.timestamp_millis())
        .bind(&snapshot.checksums.full)
        .bind(body)
        .execute(self.pool())
        .await
        .context("save_snapshot failed")?;

        self.notify(StoreChange::SnapshotSaved {
            cache_key: snapshot.cache_key.clone(),
        });
        Ok(())
    }

    /// Read a snapshot regardless of freshness.
    pub async fn get_snapshot(&self, cache_key: &str) -> Result<Option<AnalyticsSnapshot>> {
        let row = sqlx::query_as::<_, (String,)>("select body from snapshots where cache_key = ?")
            .bind(cache_key)
            .fetch_optional(self.pool())
            .await
            .context("get_snapshot failed")?;

        match row {
            None => Ok(None),
            Some((body,)) => Ok(Some(
                serde_json::from_str(&body).context("snapshot body is unreadable")?,
            )),
        }
    }

    /// Read a snapshot only if it is within the TTL and its content hash
    /// still matches its payload. A corrupt entry is dropped on sight.
    pub async fn get_fresh_snapshot(
        &self,
        cache_key: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<AnalyticsSnapshot>> {
        let Some(snap) = self.get_snapshot(cache_key).await? else {
            return Ok(None);
        };
        if now.timestamp_millis() - snap.timestamp.timestamp_millis() > SNAPSHOT_TTL_MS {
            return Ok(None);
        }
        if tdk_checksum::checksum(&snap.payload) != snap.checksums.full {
            tracing::warn!(%cache_key, "snapshot checksum drift; dropping entry");
            sqlx::query("delete from snapshots where cache_key = ?")
                .bind(cache_key)
                .execute(self.pool())
                .await
                .context("drop drifted snapshot failed")?;
            return Ok(None);
        }
        Ok(Some(snap))
    }

    /// Event-driven invalidation: drop every snapshot for a workspace.
    /// Called when an accepted event mutates that workspace's tasks.
    pub async fn invalidate_snapshots(&self, workspace_id: &str) -> Result<u64> {
        let res = sqlx::query("delete from snapshots where workspace_id = ?")
            .bind(workspace_id)
            .execute(self.pool())
            .await
            .context("invalidate_snapshots failed")?;
        Ok(res.rows_affected())
    }

    /// TTL sweep for stores with no attached event stream.
    pub async fn purge_stale_snapshots(&self, now: DateTime<Utc>) -> Result<u64> {
        let res = sqlx::query("delete from snapshots where timestamp_ms < ?")
            .bind(now.timestamp_millis() - SNAPSHOT_TTL_MS)
            .execute(self.pool())
            .await
            .context("purge_stale_snapshots failed")?;
        Ok(res.rows_affected())
    }
}
