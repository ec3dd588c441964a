use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::clock::VectorClock;

/// Logical writer class. Ranks break ties when two concurrent edits cannot be
/// ordered causally.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
#[serde(rename_all = "snake_case")]
pub enum Actor {
    Server,
    AiAgent,
    #[default]
    User,
    BatchJob,
    Webhook,
}

impl Actor {
    /// Tie-break rank. Higher wins.
    pub fn rank(self) -> u8 {
        match self {
            Actor::Server => 100,
            Actor::AiAgent => 80,
            Actor::User => 60,
            Actor::BatchJob => 40,
            Actor::Webhook => 20,
        }
    }
}

/// Closed status set. Anything else found in a payload is normalized to
/// `Todo` by the store's hygiene migration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    #[default]
    Todo,
    InProgress,
    Completed,
    Archived,
}

impl TaskStatus {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "todo" => Some(TaskStatus::Todo),
            "in_progress" => Some(TaskStatus::InProgress),
            "completed" => Some(TaskStatus::Completed),
            "archived" => Some(TaskStatus::Archived),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            TaskStatus::Todo => "todo",
            TaskStatus::InProgress => "in_progress",
            TaskStatus::Completed => "completed",
            TaskStatus::Archived => "archived",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum TaskPriority {
    Low,
    #[default]
    Medium,
    High,
    Urgent,
}

/// Lifecycle of an AI-extracted suggestion. Orthogonal to `TaskStatus`:
/// a proposed task has no real status until it is accepted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SuggestState {
    PendingSuggest,
    Accepted,
}

/// Spoken-provenance metadata carried by tasks extracted from a meeting.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct ExtractionContext {
    #[serde(default)]
    pub speaker: Option<String>,
    #[serde(default)]
    pub quote: Option<String>,
    /// Transcript span, millisecond offsets from meeting start.
    #[serde(default)]
    pub span_start_ms: Option<i64>,
    #[serde(default)]
    pub span_end_ms: Option<i64>,
    #[serde(default)]
    pub confidence: Option<f64>,
}

/// How an assignee payload is applied: merged into the existing set or
/// replacing it wholesale.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum AssignMode {
    #[default]
    Union,
    Replace,
}

/// The central entity. `id` is stable once the server has assigned it;
/// offline-created tasks carry a session-prefixed `temp_id` until the
/// `id_reconciled` round-trip rewrites them.
///
/// System fields (`id`, `workspace_id`, `meeting_id`, `created_at`,
/// `sequence_num`, `vector_clock`, `checksum`) are never user-editable and
/// are excluded from field merging.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temp_id: Option<String>,
    pub title: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub status: TaskStatus,
    #[serde(default)]
    pub priority: TaskPriority,
    #[serde(default)]
    pub due_date: Option<DateTime<Utc>>,
    #[serde(default)]
    pub assignee_ids: Vec<String>,
    #[serde(default)]
    pub labels: Vec<String>,
    #[serde(default)]
    pub meeting_id: Option<String>,
    pub workspace_id: String,
    #[serde(default)]
    pub extraction_context: Option<ExtractionContext>,
    #[serde(default)]
    pub suggest_state: Option<SuggestState>,
    #[serde(default)]
    pub snoozed_until: Option<DateTime<Utc>>,
    #[serde(default)]
    pub completed_at: Option<DateTime<Utc>>,
    /// Soft-delete stamp. Restorable until the grace window elapses.
    #[serde(default)]
    pub deleted_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub vector_clock: VectorClock,
    #[serde(default)]
    pub actor: Actor,
    #[serde(default)]
    pub sequence_num: u64,
    #[serde(default)]
    pub checksum: Option<String>,
}

impl Task {
    /// Minimal constructor for a brand-new local task. Caller supplies the
    /// identity (real or temp) and the workspace.
    pub fn new(id: impl Into<String>, workspace_id: impl Into<String>, title: impl Into<String>, now: DateTime<Utc>) -> Self {
        Self {
            id: id.into(),
            temp_id: None,
            title: title.into(),
            description: None,
            status: TaskStatus::Todo,
            priority: TaskPriority::Medium,
            due_date: None,
            assignee_ids: Vec::new(),
            labels: Vec::new(),
            meeting_id: None,
            workspace_id: workspace_id.into(),
            extraction_context: None,
            suggest_state: None,
            snoozed_until: None,
            completed_at: None,
            deleted_at: None,
            created_at: now,
            updated_at: now,
            vector_clock: VectorClock::new(),
            actor: Actor::User,
            sequence_num: 0,
            checksum: None,
        }
    }

    /// True while the task still carries a client-minted identity.
    pub fn is_temp(&self) -> bool {
        self.id.starts_with("tmp_")
    }

    pub fn is_deleted(&self) -> bool {
        self.deleted_at.is_some()
    }

    /// Required-field check used by the store's hygiene migration. A record
    /// without these cannot round-trip through the merger.
    pub fn has_required_fields(&self) -> bool {
        !self.id.is_empty() && !self.title.is_empty() && !self.workspace_id.is_empty()
    }
}

/// Indexed query parameters for the store's `filter_tasks`. All fields are
/// conjunctive; `None` means "don't care".
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TaskFilter {
    #[serde(default)]
    pub status: Option<TaskStatus>,
    #[serde(default)]
    pub meeting_id: Option<String>,
    #[serde(default)]
    pub assignee_id: Option<String>,
    #[serde(default)]
    pub label: Option<String>,
    #[serde(default)]
    pub updated_after: Option<DateTime<Utc>>,
    /// Snoozed tasks are filtered out of default views.
    #[serde(default)]
    pub include_snoozed: bool,
    /// Soft-deleted tasks are hidden unless explicitly requested.
    #[serde(default)]
    pub include_deleted: bool,
}
