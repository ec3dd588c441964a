//! Offline queue section: durable FIFO with priority.
//!
//! Replay order is `priority desc, queued_at asc, queue_id asc`. Entries
//! survive reload; overflow evicts the oldest entry with a warning.

use anyhow::{Context, Result};
use tracing::warn;

use tdk_schemas::QueuedOperation;

use crate::{LocalStore, StoreChange, DEFAULT_QUEUE_CAP};

const QUEUE_ORDER: &str = "order by priority desc, queued_at_ms asc, queue_id asc";

impl LocalStore {
    /// Append an operation, returning its assigned `queue_id`.
    pub async fn queue_operation(&self, op: &QueuedOperation) -> Result<i64> {
        let mut tx = self
            .pool()
            .begin()
            .await
            .context("queue_operation begin failed")?;

        let body = serde_json::to_string(op).context("serialize queued operation failed")?;
        let res = sqlx::query(
            "insert into offline_queue \
               (priority, queued_at_ms, task_ref, session_id, attempts, body) \
             values (?, ?, ?, ?, ?, ?)",
        )
        .bind(op.priority)
        .bind(op.queued_at.timestamp_millis())
        .bind(&op.task_ref)
        .bind(&op.session_id)
        .bind(op.attempts as i64)
        .bind(body)
        .execute(&mut *tx)
        .await
        .context("queue_operation insert failed")?;
        let queue_id = res.last_insert_rowid();

        // Persist the assigned id inside the body so reads round-trip.
        let mut stored = op.clone();
        stored.queue_id = queue_id;
        sqlx::query("update offline_queue set body = ? where queue_id = ?")
            .bind(serde_json::to_string(&stored)?)
            .bind(queue_id)
            .execute(&mut *tx)
            .await?;

        // Bounded queue: shed the oldest entry past the cap.
        let (count,): (i64,) = sqlx::query_as("select count(*) from offline_queue")
            .fetch_one(&mut *tx)
            .await?;
        if count > DEFAULT_QUEUE_CAP {
            let evicted = sqlx::query_as::<_, (i64,)>(
                "select queue_id from offline_queue order by queued_at_ms asc, queue_id asc limit 1",
            )
            .fetch_optional(&mut *tx)
            .await?;
            if let Some((oldest,)) = evicted {
                warn!(
                    queue_id = oldest,
                    cap = DEFAULT_QUEUE_CAP,
                    "offline queue overflow; evicting oldest entry"
                );
                sqlx::query("delete from offline_queue where queue_id = ?")
                    .bind(oldest)
                    .execute(&mut *tx)
                    .await?;
            }
        }

        tx.commit().await.context("queue_operation commit failed")?;
        self.notify(StoreChange::QueueChanged);
        Ok(queue_id)
    }

    /// Every queued operation in replay order.
    pub async fn get_queue(&self) -> Result<Vec<QueuedOperation>> {
        let rows = sqlx::query_as::<_, (i64, String)>(&format!(
            "select queue_id, body from offline_queue {QUEUE_ORDER}"
        ))
        .fetch_all(self.pool())
        .await
        .context("get_queue failed")?;

        let mut ops = Vec::with_capacity(rows.len());
        for (queue_id, body) in rows {
            let mut op: QueuedOperation =
                serde_json::from_str(&body).context("queued operation body is unreadable")?;
            op.queue_id = queue_id;
            ops.push(op);
        }
        Ok(ops)
    }

    /// Remove and return the head of the queue, if any.
    pub async fn pop_queue(&self) -> Result<Option<QueuedOperation>> {
        let mut tx = self.pool().begin().await.context("pop_queue begin failed")?;

        let head = sqlx::query_as::<_, (i64, String)>(&format!(
            "select queue_id, body from offline_queue {QUEUE_ORDER} limit 1"
        ))
        .fetch_optional(&mut *tx)
        .await?;

        let Some((queue_id, body)) = head else {
            return Ok(None);
        };
        sqlx::query("delete from offline_queue where queue_id = ?")
            .bind(queue_id)
            .execute(&mut *tx)
            .await?;
        tx.commit().await.context("pop_queue commit failed")?;

        let mut op: QueuedOperation =
            serde_json::from_str(&body).context("queued operation body is unreadable")?;
        op.queue_id = queue_id;
        self.notify(StoreChange::QueueChanged);
        Ok(Some(op))
    }

    pub async fn remove_from_queue(&self, queue_id: i64) -> Result<()> {
        sqlx::query("delete from offline_queue where queue_id = ?")
            .bind(queue_id)
            .execute(self.pool())
            .await
            .with_context(|| format!("remove_from_queue {queue_id} failed"))?;
        self.notify(StoreChange::QueueChanged);
        Ok(())
    }

    /// Record a failed send attempt against an entry.
    pub async fn bump_queue_attempts(&self, queue_id: i64) -> Result<u32> {
        let mut tx = self
            .pool()
            .begin()
            .await
            .context("bump_queue_attempts begin failed")?;

        let row = sqlx::query_as::<_, (i64, String)>(
            "select attempts, body from offline_queue where queue_id = ?",
        )
        .bind(queue_id)
        .fetch_optional(&mut *tx)
        .await?;
        let Some((attempts, body)) = row else {
            return Ok(0);
        };
        let attempts = attempts as u32 + 1;

        let body = match serde_json::from_str::<QueuedOperation>(&body) {
            Ok(mut op) => {
                op.attempts = attempts;
                serde_json::to_string(&op)?
            }
            Err(_) => body,
        };
        sqlx::query("update offline_queue set attempts = ?, body = ? where queue_id = ?")
            .bind(attempts as i64)
            .bind(body)
            .bind(queue_id)
            .execute(&mut *tx)
            .await?;
        tx.commit().await.context("bump_queue_attempts commit failed")?;
        Ok(attempts)
    }

    pub async fn queue_len(&self) -> Result<i64> {
        let (n,): (i64,) = sqlx::query_as("select count(*) from offline_queue")
            .fetch_one(self.pool())
            .await
            .context("queue_len failed")?;
        Ok(n)
    }
}
