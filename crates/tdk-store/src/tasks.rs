//! Task section: CRUD, indexed filtering, event history, and temp→real
//! identity reconciliation.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde_json::Value;

use tdk_schemas::{Task, TaskEvent, TaskFilter};

use crate::{LocalStore, StoreChange, EVENT_HISTORY_CAP};

/// What `reconcile_temp_id` actually did, for logging and for the
/// reconciliation broadcast.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReconcileOutcome {
    /// A local record was rewritten (or discarded in favor of the server's).
    pub applied: bool,
    /// The server-authored record already existed, so the temp record was
    /// dropped rather than renamed.
    pub kept_server_record: bool,
    /// Queued operations re-targeted from the temp id to the real one.
    pub retargeted_ops: usize,
}

impl LocalStore {
    pub async fn get_task(&self, id: &str) -> Result<Option<Task>> {
        let row = sqlx::query_as::<_, (String,)>("select body from tasks where id = ?")
            .bind(id)
            .fetch_optional(self.pool())
            .await
            .with_context(|| format!("get_task {id} failed"))?;

        match row {
            None => Ok(None),
            Some((body,)) => {
                let task = serde_json::from_str::<Task>(&body)
                    .with_context(|| format!("task {id} body is unreadable"))?;
                Ok(Some(task))
            }
        }
    }

    pub async fn save_task(&self, task: &Task) -> Result<()> {
        let mut tx = self.pool().begin().await.context("save_task begin failed")?;
        upsert_task(&mut tx, task).await?;
        tx.commit().await.context("save_task commit failed")?;

        self.notify(StoreChange::TaskSaved {
            id: task.id.clone(),
        });
        Ok(())
    }

    /// Atomic batch write: either every task lands or none do.
    pub async fn save_tasks(&self, tasks: &[Task]) -> Result<()> {
        if tasks.is_empty() {
            return Ok(());
        }
        let mut tx = self.pool().begin().await.context("save_tasks begin failed")?;
        for task in tasks {
            upsert_task(&mut tx, task).await?;
        }
        tx.commit().await.context("save_tasks commit failed")?;

        self.notify(StoreChange::TasksSaved {
            ids: tasks.iter().map(|t| t.id.clone()).collect(),
        });
        Ok(())
    }

    pub async fn delete_task(&self, id: &str) -> Result<()> {
        self.delete_task_raw(id).await?;
        self.notify(StoreChange::TaskDeleted { id: id.to_string() });
        Ok(())
    }

    pub(crate) async fn delete_task_raw(&self, id: &str) -> Result<()> {
        let mut tx = self.pool().begin().await.context("delete_task begin failed")?;
        sqlx::query("delete from task_assignees where task_id = ?")
            .bind(id)
            .execute(&mut *tx)
            .await?;
        sqlx::query("delete from tasks where id = ?")
            .bind(id)
            .execute(&mut *tx)
            .await?;
        tx.commit().await.context("delete_task commit failed")?;
        Ok(())
    }

    /// Indexed conjunctive filter. `now` gates the snooze check so callers
    /// (and tests) control time.
    pub async fn filter_tasks(&self, filter: &TaskFilter, now: DateTime<Utc>) -> Result<Vec<Task>> {
        let mut sql = String::from("select t.body from tasks t");
        let mut clauses: Vec<&str> = Vec::new();

        if filter.assignee_id.is_some() {
            sql.push_str(" join task_assignees a on a.task_id = t.id");
            clauses.push("a.assignee_id = ?");
        }
        if filter.status.is_some() {
            clauses.push("t.status = ?");
        }
        if filter.meeting_id.is_some() {
            clauses.push("t.meeting_id = ?");
        }
        if filter.updated_after.is_some() {
            clauses.push("t.updated_at_ms > ?");
        }
        if filter.label.is_some() {
            clauses.push(
                "exists (select 1 from json_each(t.body, '$.labels') je where je.value = ?)",
            );
        }
        if !filter.include_deleted {
            clauses.push("t.deleted_at_ms is null");
        }
        if !filter.include_snoozed {
            clauses.push("(t.snoozed_until_ms is null or t.snoozed_until_ms <= ?)");
        }

        if !clauses.is_empty() {
            sql.push_str(" where ");
            sql.push_str(&clauses.join(" and "));
        }
        sql.push_str(" order by t.updated_at_ms desc");

        // Binds must follow clause order exactly.
        let mut q = sqlx::query_as::<_, (String,)>(&sql);
        if let Some(a) = &filter.assignee_id {
            q = q.bind(a.clone());
        }
        if let Some(s) = filter.status {
            q = q.bind(s.as_str());
        }
        if let Some(m) = &filter.meeting_id {
            q = q.bind(m.clone());
        }
        if let Some(after) = filter.updated_after {
            q = q.bind(after.timestamp_millis());
        }
        if let Some(l) = &filter.label {
            q = q.bind(l.clone());
        }
        if !filter.include_snoozed {
            q = q.bind(now.timestamp_millis());
        }

        let rows = q
            .fetch_all(self.pool())
            .await
            .context("filter_tasks failed")?;

        let mut tasks = Vec::with_capacity(rows.len());
        for (body,) in rows {
            tasks.push(serde_json::from_str::<Task>(&body).context("task body is unreadable")?);
        }
        Ok(tasks)
    }

    /// Every live (non-deleted) task, newest first. The cache-first paint.
    pub async fn all_tasks(&self, now: DateTime<Utc>) -> Result<Vec<Task>> {
        self.filter_tasks(&TaskFilter::default(), now).await
    }

    pub async fn task_count(&self) -> Result<i64> {
        let (n,): (i64,) = sqlx::query_as("select count(*) from tasks")
            .fetch_one(self.pool())
            .await
            .context("task_count failed")?;
        Ok(n)
    }

    /// Atomically rewrite a task's identity from `temp` to `real`, re-target
    /// queued operations, and emit a reconciliation change for sibling tabs.
    ///
    /// If the server-authored record already exists under `real`, it wins:
    /// the temporary record is discarded and queued updates are preserved by
    /// re-targeting them at `real`.
    pub async fn reconcile_temp_id(&self, temp: &str, real: &str) -> Result<ReconcileOutcome> {
        let mut tx = self
            .pool()
            .begin()
            .await
            .context("reconcile_temp_id begin failed")?;

        let temp_row = sqlx::query_as::<_, (String,)>("select body from tasks where id = ?")
            .bind(temp)
            .fetch_optional(&mut *tx)
            .await?;
        let real_exists = sqlx::query_as::<_, (i64,)>("select count(*) from tasks where id = ?")
            .bind(real)
            .fetch_one(&mut *tx)
            .await?
            .0
            > 0;

        let mut applied = false;
        let mut kept_server_record = false;

        match (temp_row, real_exists) {
            (Some(_), true) => {
                // Server record wins; the temp copy is a duplicate.
                sqlx::query("delete from task_assignees where task_id = ?")
                    .bind(temp)
                    .execute(&mut *tx)
                    .await?;
                sqlx::query("delete from tasks where id = ?")
                    .bind(temp)
                    .execute(&mut *tx)
                    .await?;
                applied = true;
                kept_server_record = true;
            }
            (Some((body,)), false) => {
                let mut task: Task = serde_json::from_str(&body)
                    .with_context(|| format!("task {temp} body is unreadable"))?;
                task.temp_id = Some(temp.to_string());
                task.id = real.to_string();

                sqlx::query("delete from task_assignees where task_id = ?")
                    .bind(temp)
                    .execute(&mut *tx)
                    .await?;
                sqlx::query("delete from tasks where id = ?")
                    .bind(temp)
                    .execute(&mut *tx)
                    .await?;
                upsert_task(&mut tx, &task).await?;
                applied = true;
            }
            (None, _) => {
                // Nothing local under the temp id (another tab may have won
                // the race); queued operations may still reference it.
            }
        }

        let retargeted_ops = retarget_queue_entries(&mut tx, temp, real).await?;

        tx.commit().await.context("reconcile_temp_id commit failed")?;

        self.notify(StoreChange::TempIdReconciled {
            temp_id: temp.to_string(),
            real_id: real.to_string(),
        });

        Ok(ReconcileOutcome {
            applied,
            kept_server_record,
            retargeted_ops,
        })
    }

    // -----------------------------------------------------------------------
    // Event history (bounded, for duplicate detection and gap fill)
    // -----------------------------------------------------------------------

    pub async fn save_event(&self, event: &TaskEvent) -> Result<()> {
        let body = serde_json::to_string(event).context("serialize event failed")?;
        sqlx::query(
            "insert into events (event_id, workspace_id, sequence_num, timestamp_ms, body) \
             values (?, ?, ?, ?, ?) \
             on conflict(event_id) do nothing",
        )
        .bind(&event.event_id)
        .bind(&event.workspace_id)
        .bind(event.sequence_num as i64)
        .bind(event.timestamp.timestamp_millis())
        .bind(body)
        .execute(self.pool())
        .await
        .context("save_event failed")?;

        self.prune_events().await
    }

    pub async fn has_event(&self, event_id: &str) -> Result<bool> {
        let (n,): (i64,) = sqlx::query_as("select count(*) from events where event_id = ?")
            .bind(event_id)
            .fetch_one(self.pool())
            .await
            .context("has_event failed")?;
        Ok(n > 0)
    }

    async fn prune_events(&self) -> Result<()> {
        sqlx::query(
            "delete from events where event_id not in \
             (select event_id from events order by sequence_num desc limit ?)",
        )
        .bind(EVENT_HISTORY_CAP)
        .execute(self.pool())
        .await
        .context("prune_events failed")?;
        Ok(())
    }
}

async fn upsert_task(tx: &mut sqlx::Transaction<'_, sqlx::Sqlite>, task: &Task) -> Result<()> {
    let body = serde_json::to_string(task).context("serialize task failed")?;

    sqlx::query(
        "insert into tasks \
           (id, workspace_id, status, meeting_id, updated_at_ms, deleted_at_ms, snoozed_until_ms, body) \
         values (?, ?, ?, ?, ?, ?, ?, ?) \
         on conflict(id) do update set \
           workspace_id = excluded.workspace_id, \
           status = excluded.status, \
           meeting_id = excluded.meeting_id, \
           updated_at_ms = excluded.updated_at_ms, \
           deleted_at_ms = excluded.deleted_at_ms, \
           snoozed_until_ms = excluded.snoozed_until_ms, \
           body = excluded.body",
    )
    .bind(&task.id)
    .bind(&task.workspace_id)
    .bind(task.status.as_str())
    .bind(task.meeting_id.as_deref())
    .bind(task.updated_at.timestamp_millis())
    .bind(task.deleted_at.map(|t| t.timestamp_millis()))
    .bind(task.snoozed_until.map(|t| t.timestamp_millis()))
    .bind(body)
    .execute(&mut **tx)
    .await
    .with_context(|| format!("upsert task {} failed", task.id))?;

    sqlx::query("delete from task_assignees where task_id = ?")
        .bind(&task.id)
        .execute(&mut **tx)
        .await?;
    for assignee in &task.assignee_ids {
        sqlx::query("insert or ignore into task_assignees (task_id, assignee_id) values (?, ?)")
            .bind(&task.id)
            .bind(assignee)
            .execute(&mut **tx)
            .await?;
    }
    Ok(())
}

/// Rewrite queued operations whose target is `temp` so they aim at `real`.
/// Both the indexed `task_ref` column and the embedded payload ids change.
async fn retarget_queue_entries(
    tx: &mut sqlx::Transaction<'_, sqlx::Sqlite>,
    temp: &str,
    real: &str,
) -> Result<usize> {
    let rows = sqlx::query_as::<_, (i64, String)>(
        "select queue_id, body from offline_queue where task_ref = ?",
    )
    .bind(temp)
    .fetch_all(&mut **tx)
    .await?;

    let mut count = 0usize;
    for (queue_id, body) in rows {
        let Ok(mut doc) = serde_json::from_str::<Value>(&body) else {
            continue;
        };
        rewrite_id_refs(&mut doc, temp, real);

        sqlx::query("update offline_queue set task_ref = ?, body = ? where queue_id = ?")
            .bind(real)
            .bind(doc.to_string())
            .bind(queue_id)
            .execute(&mut **tx)
            .await?;
        count += 1;
    }
    Ok(count)
}

/// Replace `temp` with `real` anywhere it appears as an id-shaped value:
/// `task_ref`, `task_id`, `source_id`, `target_id`, `id` fields and
/// `task_ids` arrays, at any depth.
fn rewrite_id_refs(doc: &mut Value, temp: &str, real: &str) {
    const ID_FIELDS: &[&str] = &["task_ref", "task_id", "source_id", "target_id", "id"];

    match doc {
        Value::Object(map) => {
            for (key, value) in map.iter_mut() {
                match value {
                    Value::String(s) if ID_FIELDS.contains(&key.as_str()) && s == temp => {
                        *s = real.to_string();
                    }
                    Value::Array(items) if key == "task_ids" => {
                        for item in items.iter_mut() {
                            if item.as_str() == Some(temp) {
                                *item = Value::String(real.to_string());
                            }
                        }
                    }
                    _ => rewrite_id_refs(value, temp, real),
                }
            }
        }
        Value::Array(items) => {
            for item in items {
                rewrite_id_refs(item, temp, real);
            }
        }
        _ => {}
    }
}
