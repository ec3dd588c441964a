//! Applying taxonomy events to the store.
//!
//! One code path serves both directions: sequenced server events (timestamp
//! and clock from the event) and optimistic local intents (wall clock and
//! the freshly-stamped local clock). The sequencer guarantees at most one
//! apply per event, so these functions do not need their own idempotence.

use anyhow::Result;
use chrono::{DateTime, Utc};
use tracing::debug;

use tdk_bus::MutationKind;
use tdk_merge::MergeStrategy;
use tdk_schemas::{
    Actor, AssignMode, SuggestState, Task, TaskEvent, TaskEventKind, TaskStatus, VectorClock,
};
use tdk_store::meta_keys;

use crate::{TaskDispatcher, TaskNotification};

/// Everything the dispatcher must fan out after an apply.
#[derive(Debug, Default)]
pub struct AppliedChange {
    pub notifications: Vec<TaskNotification>,
    pub mutations: Vec<(MutationKind, String)>,
    /// True when tasks changed, so workspace snapshots are stale.
    pub invalidates_snapshots: bool,
}

impl AppliedChange {
    fn none() -> Self {
        Self::default()
    }

    fn mutated(notification: TaskNotification, kind: MutationKind, task_id: String) -> Self {
        Self {
            notifications: vec![notification],
            mutations: vec![(kind, task_id)],
            invalidates_snapshots: true,
        }
    }

    fn notified(notification: TaskNotification) -> Self {
        Self {
            notifications: vec![notification],
            mutations: Vec::new(),
            invalidates_snapshots: false,
        }
    }
}

pub(crate) async fn apply_event(d: &TaskDispatcher, event: &TaskEvent) -> Result<AppliedChange> {
    apply_kind(
        d,
        &event.kind,
        event.timestamp,
        &event.vector_clock,
        event.actor,
    )
    .await
}

pub(crate) async fn apply_kind(
    d: &TaskDispatcher,
    kind: &TaskEventKind,
    ts: DateTime<Utc>,
    clock: &VectorClock,
    actor: Actor,
) -> Result<AppliedChange> {
    let store = d.store();

    match kind {
        // Snapshot payload only; watermark bookkeeping belongs to the
        // bootstrap paths in the dispatcher.
        TaskEventKind::Bootstrap { tasks, .. } => {
            let count = d.adopt_snapshot_tasks(tasks.clone()).await?;
            Ok(AppliedChange {
                notifications: vec![TaskNotification::BootstrapApplied { count }],
                mutations: Vec::new(),
                invalidates_snapshots: true,
            })
        }

        TaskEventKind::WsSubscribe { .. } => {
            Ok(AppliedChange::notified(TaskNotification::ChannelSubscribed))
        }

        TaskEventKind::NlpProposed { task } => {
            let mut task = task.clone();
            task.suggest_state = Some(SuggestState::PendingSuggest);
            let task = upsert_stamped(d, task, ts, clock, actor).await?;
            Ok(AppliedChange::mutated(
                TaskNotification::TaskCreated { task: task.clone() },
                MutationKind::Created,
                task.id,
            ))
        }

        TaskEventKind::CreateManual { task } => {
            let task = upsert_stamped(d, task.clone(), ts, clock, actor).await?;
            Ok(AppliedChange::mutated(
                TaskNotification::TaskCreated { task: task.clone() },
                MutationKind::Created,
                task.id,
            ))
        }

        TaskEventKind::Merge {
            source_id,
            target_id,
        } => {
            store.delete_task(source_id).await?;
            Ok(AppliedChange {
                notifications: vec![TaskNotification::TaskMerged {
                    source_id: source_id.clone(),
                    target_id: target_id.clone(),
                }],
                mutations: vec![(MutationKind::Deleted, source_id.clone())],
                invalidates_snapshots: true,
            })
        }

        TaskEventKind::JumpToSpan { task_id } => Ok(AppliedChange::notified(
            TaskNotification::NavigateToSpan {
                task_id: task_id.clone(),
            },
        )),

        TaskEventKind::FilterApply { filter } => {
            store
                .set_metadata(meta_keys::VIEW_FILTER, &filter.to_string())
                .await?;
            Ok(AppliedChange::notified(TaskNotification::ViewStateChanged {
                filter: filter.clone(),
            }))
        }

        TaskEventKind::Refresh {} => {
            Ok(AppliedChange::notified(TaskNotification::RefreshRequested))
        }
        TaskEventKind::IdleSync {} => {
            Ok(AppliedChange::notified(TaskNotification::IdleSyncRequested))
        }
        TaskEventKind::OfflineQueueReplay {} => {
            Ok(AppliedChange::notified(TaskNotification::ReplayRequested))
        }

        TaskEventKind::MultiselectBulk { task_ids, op } => {
            let mut batch = Vec::with_capacity(task_ids.len());
            let mut change = AppliedChange::none();
            for id in task_ids {
                let Some(mut task) = store.get_task(id).await? else {
                    debug!(task_id = %id, "bulk target missing; skipped");
                    continue;
                };
                if !transform_task(&mut task, &retarget(op, id), ts) {
                    continue;
                }
                stamp(&mut task, ts, clock, actor);
                change.notifications.push(TaskNotification::TaskUpdated {
                    task: task.clone(),
                });
                change
                    .mutations
                    .push((MutationKind::Updated, task.id.clone()));
                batch.push(task);
            }
            // One transaction: the bulk applies atomically or not at all.
            store.save_tasks(&batch).await?;
            change.invalidates_snapshots = !batch.is_empty();
            Ok(change)
        }

        // Single-task field events share one transform.
        _ => {
            let Some(task_id) = kind.target_id() else {
                return Ok(AppliedChange::none());
            };
            let Some(mut task) = store.get_task(task_id).await? else {
                debug!(%task_id, event_type = kind.wire_type(), "event target missing; skipped");
                return Ok(AppliedChange::none());
            };

            if !transform_task(&mut task, kind, ts) {
                return Ok(AppliedChange::none());
            }
            stamp(&mut task, ts, clock, actor);
            store.save_task(&task).await?;

            let (notification, mutation) = match kind {
                TaskEventKind::Delete { .. } => (
                    TaskNotification::TaskDeleted {
                        task_id: task.id.clone(),
                    },
                    MutationKind::Deleted,
                ),
                _ => (
                    TaskNotification::TaskUpdated { task: task.clone() },
                    MutationKind::Updated,
                ),
            };
            Ok(AppliedChange::mutated(notification, mutation, task.id))
        }
    }
}

/// Apply a field-level event to one task. Returns false when the event does
/// not change the record (making re-applies cheap no-ops).
fn transform_task(task: &mut Task, kind: &TaskEventKind, ts: DateTime<Utc>) -> bool {
    match kind {
        TaskEventKind::CreateNlpAccept { .. } => {
            task.suggest_state = Some(SuggestState::Accepted);
            task.status = TaskStatus::Todo;
            true
        }
        TaskEventKind::UpdateTitle { title, .. } => {
            if task.title == *title {
                return false;
            }
            task.title = title.clone();
            true
        }
        TaskEventKind::StatusToggle { status, .. } => {
            task.status = *status;
            task.completed_at = if *status == TaskStatus::Completed {
                Some(ts)
            } else {
                None
            };
            true
        }
        TaskEventKind::UpdatePriority { priority, .. } => {
            task.priority = *priority;
            true
        }
        TaskEventKind::UpdateDue { due_date, .. } => {
            task.due_date = *due_date;
            true
        }
        TaskEventKind::UpdateAssign {
            assignee_ids, mode, ..
        } => {
            match mode {
                AssignMode::Replace => task.assignee_ids = assignee_ids.clone(),
                AssignMode::Union => {
                    for id in assignee_ids {
                        if !task.assignee_ids.contains(id) {
                            task.assignee_ids.push(id.clone());
                        }
                    }
                }
            }
            true
        }
        TaskEventKind::UpdateLabels { labels, .. } => {
            for label in labels {
                if !task.labels.contains(label) {
                    task.labels.push(label.clone());
                }
            }
            true
        }
        TaskEventKind::Snooze { snoozed_until, .. } => {
            task.snoozed_until = *snoozed_until;
            true
        }
        TaskEventKind::Delete { .. } => {
            task.deleted_at = Some(ts);
            true
        }
        _ => false,
    }
}

/// Rewrite a bulk sub-op so it targets one specific id.
fn retarget(op: &TaskEventKind, id: &str) -> TaskEventKind {
    let mut op = op.clone();
    match &mut op {
        TaskEventKind::CreateNlpAccept { task_id }
        | TaskEventKind::UpdateTitle { task_id, .. }
        | TaskEventKind::StatusToggle { task_id, .. }
        | TaskEventKind::UpdatePriority { task_id, .. }
        | TaskEventKind::UpdateDue { task_id, .. }
        | TaskEventKind::UpdateAssign { task_id, .. }
        | TaskEventKind::UpdateLabels { task_id, .. }
        | TaskEventKind::Snooze { task_id, .. }
        | TaskEventKind::Delete { task_id } => *task_id = id.to_string(),
        _ => {}
    }
    op
}

/// Creation path: merge against any existing record (server-authoritative)
/// so replays converge, then stamp and save.
async fn upsert_stamped(
    d: &TaskDispatcher,
    mut task: Task,
    ts: DateTime<Utc>,
    clock: &VectorClock,
    actor: Actor,
) -> Result<Task> {
    if task.workspace_id.is_empty() {
        task.workspace_id = d.config().workspace_id.clone();
    }
    let merged = match d.store().get_task(&task.id).await? {
        Some(local) => {
            tdk_merge::merge_tasks(&local, &task, MergeStrategy::ServerAuthoritative).merged
        }
        None => task,
    };
    let mut merged = merged;
    stamp(&mut merged, ts, clock, actor);
    d.store().save_task(&merged).await?;
    Ok(merged)
}

fn stamp(task: &mut Task, ts: DateTime<Utc>, clock: &VectorClock, actor: Actor) {
    task.updated_at = ts;
    task.vector_clock.merge(clock);
    task.actor = actor;
}
