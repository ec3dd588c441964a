use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::clock::VectorClock;
use crate::task::{Actor, AssignMode, Task, TaskPriority, TaskStatus};
use crate::wire::SequencedEvent;

/// The canonical task-event taxonomy. Every mutation in the system is one of
/// these; anything else on the wire is counted and ignored, never applied.
///
/// Serialized adjacently so a stored event round-trips as
/// `{"event_type": "...", "payload": {...}}` — the same shape the server
/// pushes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event_type", content = "payload")]
pub enum TaskEventKind {
    /// Replace/merge the store with a server snapshot.
    #[serde(rename = "tasks_bootstrap")]
    Bootstrap {
        #[serde(default)]
        tasks: Vec<Task>,
        #[serde(default)]
        last_event_id: Option<String>,
        #[serde(default)]
        last_sequence: Option<u64>,
    },
    /// Transport is ready; pending reconciliations should be requested.
    #[serde(rename = "tasks_ws_subscribe")]
    WsSubscribe {
        #[serde(default)]
        workspace_id: Option<String>,
    },
    /// AI proposal: inserted with `suggest_state = pending_suggest`.
    #[serde(rename = "task_nlp:proposed")]
    NlpProposed { task: Task },
    /// Manual creation (temp-id when minted offline).
    #[serde(rename = "task_create:manual")]
    CreateManual { task: Task },
    /// Proposal accepted: proposed → accepted, status becomes `todo`.
    #[serde(rename = "task_create:nlp_accept")]
    CreateNlpAccept { task_id: String },
    #[serde(rename = "task_update:title")]
    UpdateTitle { task_id: String, title: String },
    /// Status transition; completion stamps `completed_at`.
    #[serde(rename = "task_update:status_toggle")]
    StatusToggle { task_id: String, status: TaskStatus },
    #[serde(rename = "task_update:priority")]
    UpdatePriority {
        task_id: String,
        priority: TaskPriority,
    },
    #[serde(rename = "task_update:due")]
    UpdateDue {
        task_id: String,
        #[serde(default)]
        due_date: Option<DateTime<Utc>>,
    },
    #[serde(rename = "task_update:assign")]
    UpdateAssign {
        task_id: String,
        assignee_ids: Vec<String>,
        #[serde(default)]
        mode: AssignMode,
    },
    #[serde(rename = "task_update:labels")]
    UpdateLabels { task_id: String, labels: Vec<String> },
    /// Snooze is a flag orthogonal to status. `None` unsnoozes.
    #[serde(rename = "task_snooze")]
    Snooze {
        task_id: String,
        #[serde(default)]
        snoozed_until: Option<DateTime<Utc>>,
    },
    /// Fold `source_id` into `target_id`; the source is deleted locally.
    #[serde(rename = "task_merge")]
    Merge { source_id: String, target_id: String },
    /// Side-effect only: emits a navigation notification, mutates nothing.
    #[serde(rename = "task_link:jump_to_span")]
    JumpToSpan { task_id: String },
    /// Persists view state; does not touch tasks.
    #[serde(rename = "filter_apply")]
    FilterApply { filter: Value },
    /// Full resync against the server.
    #[serde(rename = "tasks_refresh")]
    Refresh {},
    /// Silent resync; no UI perturbation.
    #[serde(rename = "tasks_idle_sync")]
    IdleSync {},
    /// Drain the offline queue.
    #[serde(rename = "tasks_offline_queue:replay")]
    OfflineQueueReplay {},
    /// Soft-delete with a restore grace window.
    #[serde(rename = "task_delete")]
    Delete { task_id: String },
    /// Apply the same sub-event to many ids atomically.
    #[serde(rename = "tasks_multiselect:bulk")]
    MultiselectBulk {
        task_ids: Vec<String>,
        op: Box<TaskEventKind>,
    },
}

impl TaskEventKind {
    /// Wire tag for this kind. Kept in sync with the serde renames above.
    pub fn wire_type(&self) -> &'static str {
        match self {
            TaskEventKind::Bootstrap { .. } => "tasks_bootstrap",
            TaskEventKind::WsSubscribe { .. } => "tasks_ws_subscribe",
            TaskEventKind::NlpProposed { .. } => "task_nlp:proposed",
            TaskEventKind::CreateManual { .. } => "task_create:manual",
            TaskEventKind::CreateNlpAccept { .. } => "task_create:nlp_accept",
            TaskEventKind::UpdateTitle { .. } => "task_update:title",
            TaskEventKind::StatusToggle { .. } => "task_update:status_toggle",
            TaskEventKind::UpdatePriority { .. } => "task_update:priority",
            TaskEventKind::UpdateDue { .. } => "task_update:due",
            TaskEventKind::UpdateAssign { .. } => "task_update:assign",
            TaskEventKind::UpdateLabels { .. } => "task_update:labels",
            TaskEventKind::Snooze { .. } => "task_snooze",
            TaskEventKind::Merge { .. } => "task_merge",
            TaskEventKind::JumpToSpan { .. } => "task_link:jump_to_span",
            TaskEventKind::FilterApply { .. } => "filter_apply",
            TaskEventKind::Refresh {} => "tasks_refresh",
            TaskEventKind::IdleSync {} => "tasks_idle_sync",
            TaskEventKind::OfflineQueueReplay {} => "tasks_offline_queue:replay",
            TaskEventKind::Delete { .. } => "task_delete",
            TaskEventKind::MultiselectBulk { .. } => "tasks_multiselect:bulk",
        }
    }

    /// Parse a raw `(event_type, payload)` pair. Unknown tags are returned
    /// as errors carrying the tag so the dispatcher can count them instead of
    /// dropping them silently.
    pub fn parse(event_type: &str, payload: Value) -> Result<Self, EventParseError> {
        // Servers omit the payload for payload-less kinds; normalize so the
        // struct variants below always see an object.
        let payload = if payload.is_null() {
            Value::Object(Default::default())
        } else {
            payload
        };

        let wrapped = serde_json::json!({
            "event_type": event_type,
            "payload": payload,
        });

        serde_json::from_value::<TaskEventKind>(wrapped).map_err(|e| {
            if KNOWN_EVENT_TYPES.contains(&event_type) {
                EventParseError::BadPayload {
                    event_type: event_type.to_string(),
                    detail: e.to_string(),
                }
            } else {
                EventParseError::UnknownType(event_type.to_string())
            }
        })
    }

    /// Split this kind into its wire `(event_type, payload)` pair.
    pub fn to_wire_payload(&self) -> (String, Value) {
        let v = serde_json::to_value(self).expect("event kind serialization must not fail");
        match v {
            Value::Object(mut map) => {
                let event_type = map
                    .remove("event_type")
                    .and_then(|t| t.as_str().map(String::from))
                    .unwrap_or_default();
                let payload = map.remove("payload").unwrap_or(Value::Object(Default::default()));
                (event_type, payload)
            }
            _ => (self.wire_type().to_string(), Value::Null),
        }
    }

    /// The task id this kind targets, when it targets exactly one.
    pub fn target_id(&self) -> Option<&str> {
        match self {
            TaskEventKind::NlpProposed { task } | TaskEventKind::CreateManual { task } => {
                Some(task.id.as_str())
            }
            TaskEventKind::CreateNlpAccept { task_id }
            | TaskEventKind::UpdateTitle { task_id, .. }
            | TaskEventKind::StatusToggle { task_id, .. }
            | TaskEventKind::UpdatePriority { task_id, .. }
            | TaskEventKind::UpdateDue { task_id, .. }
            | TaskEventKind::UpdateAssign { task_id, .. }
            | TaskEventKind::UpdateLabels { task_id, .. }
            | TaskEventKind::Snooze { task_id, .. }
            | TaskEventKind::JumpToSpan { task_id }
            | TaskEventKind::Delete { task_id } => Some(task_id.as_str()),
            TaskEventKind::Merge { source_id, .. } => Some(source_id.as_str()),
            _ => None,
        }
    }
}

const KNOWN_EVENT_TYPES: &[&str] = &[
    "tasks_bootstrap",
    "tasks_ws_subscribe",
    "task_nlp:proposed",
    "task_create:manual",
    "task_create:nlp_accept",
    "task_update:title",
    "task_update:status_toggle",
    "task_update:priority",
    "task_update:due",
    "task_update:assign",
    "task_update:labels",
    "task_snooze",
    "task_merge",
    "task_link:jump_to_span",
    "filter_apply",
    "tasks_refresh",
    "tasks_idle_sync",
    "tasks_offline_queue:replay",
    "task_delete",
    "tasks_multiselect:bulk",
];

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EventParseError {
    /// Tag not in the taxonomy. Counted by the dispatcher, never applied.
    UnknownType(String),
    /// Known tag with a payload that does not deserialize.
    BadPayload { event_type: String, detail: String },
}

impl std::fmt::Display for EventParseError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EventParseError::UnknownType(t) => write!(f, "unknown event type: {t}"),
            EventParseError::BadPayload { event_type, detail } => {
                write!(f, "bad payload for {event_type}: {detail}")
            }
        }
    }
}

impl std::error::Error for EventParseError {}

/// A fully-parsed sequenced event, ready for the sequencer and dispatcher.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskEvent {
    pub event_id: String,
    pub workspace_id: String,
    pub sequence_num: u64,
    #[serde(default)]
    pub vector_clock: VectorClock,
    #[serde(default)]
    pub checksum: Option<String>,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub actor: Actor,
    #[serde(flatten)]
    pub kind: TaskEventKind,
}

impl TaskEvent {
    /// Parse a raw wire event into a typed one. The kind tag is validated
    /// here; sequencing and checksum validation happen downstream.
    pub fn from_wire(raw: SequencedEvent) -> Result<Self, EventParseError> {
        let kind = TaskEventKind::parse(&raw.event_type, raw.payload)?;
        Ok(Self {
            event_id: raw.event_id,
            workspace_id: raw.workspace_id,
            sequence_num: raw.sequence_num,
            vector_clock: raw.vector_clock,
            checksum: raw.checksum,
            timestamp: raw.timestamp,
            actor: raw.actor,
            kind,
        })
    }

    /// Lower a typed event back to its wire shape.
    pub fn to_wire(&self) -> SequencedEvent {
        let (event_type, payload) = self.kind.to_wire_payload();
        SequencedEvent {
            event_id: self.event_id.clone(),
            workspace_id: self.workspace_id.clone(),
            sequence_num: self.sequence_num,
            vector_clock: self.vector_clock.clone(),
            checksum: self.checksum.clone(),
            timestamp: self.timestamp,
            actor: self.actor,
            event_type,
            payload,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_round_trips_known_kinds() {
        let kind = TaskEventKind::UpdateTitle {
            task_id: "42".into(),
            title: "revised".into(),
        };
        let (event_type, payload) = kind.to_wire_payload();
        assert_eq!(event_type, "task_update:title");
        let back = TaskEventKind::parse(&event_type, payload).unwrap();
        assert_eq!(back, kind);
    }

    #[test]
    fn parse_rejects_unknown_tag() {
        let err = TaskEventKind::parse("task_frobnicate", serde_json::json!({})).unwrap_err();
        assert_eq!(err, EventParseError::UnknownType("task_frobnicate".into()));
    }

    #[test]
    fn parse_normalizes_null_payload() {
        let kind = TaskEventKind::parse("tasks_refresh", serde_json::Value::Null).unwrap();
        assert_eq!(kind, TaskEventKind::Refresh {});
    }
}
