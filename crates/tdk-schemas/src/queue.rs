use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::clock::VectorClock;
use crate::event::TaskEventKind;

/// Broad class of a queued mutation. Derived from the event kind; used for
/// replay priority defaults and for server-side handling of the entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OpType {
    Create,
    Update,
    Delete,
    Other,
}

impl OpType {
    pub fn of(kind: &TaskEventKind) -> Self {
        match kind {
            TaskEventKind::CreateManual { .. }
            | TaskEventKind::NlpProposed { .. }
            | TaskEventKind::CreateNlpAccept { .. } => OpType::Create,
            TaskEventKind::Delete { .. } | TaskEventKind::Merge { .. } => OpType::Delete,
            TaskEventKind::UpdateTitle { .. }
            | TaskEventKind::StatusToggle { .. }
            | TaskEventKind::UpdatePriority { .. }
            | TaskEventKind::UpdateDue { .. }
            | TaskEventKind::UpdateAssign { .. }
            | TaskEventKind::UpdateLabels { .. }
            | TaskEventKind::Snooze { .. }
            | TaskEventKind::MultiselectBulk { .. } => OpType::Update,
            _ => OpType::Other,
        }
    }

    /// Default replay priority. Creates must land before the updates that
    /// reference their temp ids; deletes beat plain updates.
    pub fn default_priority(self) -> i64 {
        match self {
            OpType::Create => 10,
            OpType::Delete => 8,
            OpType::Update => 5,
            OpType::Other => 1,
        }
    }
}

/// Conflict strategy a queued operation may request for its own replay.
/// Absent means the engine default (server-authoritative).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReplayConflictStrategy {
    ServerAuthoritative,
    LastWriteWins,
}

/// One offline mutation, durable until a server ack (or a permanent failure
/// surfaced to the caller). Replay order: priority desc, queued_at asc,
/// queue_id asc.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueuedOperation {
    /// Local auto-increment; 0 until the store assigns one.
    #[serde(default)]
    pub queue_id: i64,
    pub op_type: OpType,
    /// Real or temp task id this operation targets.
    pub task_ref: String,
    /// The intent itself. Sanitized before send.
    pub kind: TaskEventKind,
    #[serde(default)]
    pub vector_clock: VectorClock,
    /// Session that minted the entry; lets the server de-duplicate replays
    /// across reconnects.
    pub session_id: String,
    pub queued_at: DateTime<Utc>,
    #[serde(default)]
    pub attempts: u32,
    pub priority: i64,
    #[serde(default)]
    pub conflict_strategy: Option<ReplayConflictStrategy>,
}

impl QueuedOperation {
    pub fn new(
        kind: TaskEventKind,
        vector_clock: VectorClock,
        session_id: impl Into<String>,
        queued_at: DateTime<Utc>,
    ) -> Self {
        let op_type = OpType::of(&kind);
        let task_ref = kind.target_id().unwrap_or_default().to_string();
        Self {
            queue_id: 0,
            op_type,
            task_ref,
            kind,
            vector_clock,
            session_id: session_id.into(),
            queued_at,
            attempts: 0,
            priority: op_type.default_priority(),
            conflict_strategy: None,
        }
    }
}
