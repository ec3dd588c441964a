use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::clock::VectorClock;
use crate::task::{Actor, Task};

/// Client→server frame. One shape for everything the client sends on the
/// channel: intents, subscribe, reconciliation fetches, replayed queue
/// entries.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClientFrame {
    /// Domain namespace on the shared workspace channel ("tasks", "copilot").
    pub namespace: String,
    /// Client-minted idempotency id for this send.
    pub event_id: String,
    pub event_type: String,
    pub workspace_id: String,
    #[serde(default)]
    pub vector_clock: VectorClock,
    #[serde(default)]
    pub checksum: Option<String>,
    #[serde(default)]
    pub session_id: Option<String>,
    pub payload: Value,
}

/// A sequenced server event before taxonomy parsing. `event_type` stays a
/// raw string here so unknown tags survive long enough to be counted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SequencedEvent {
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
    pub event_type: String,
    #[serde(default)]
    pub payload: Value,
}

/// Authoritative temp→real identity mapping. Only frames of this shape (live
/// or replayed via `reconciliations:get_pending`) may rewrite a task id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReconciliationRecord {
    pub temp_id: String,
    pub real_id: String,
    #[serde(default)]
    pub user_id: Option<String>,
    pub workspace_id: String,
    pub reconciled_at: DateTime<Utc>,
}

/// Directory entry from the server's users map, cached for assignee
/// rehydration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserRef {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub avatar_url: Option<String>,
}

/// Server→client frames on the tasks namespace.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerFrame {
    /// A sequenced domain event (one of the taxonomy kinds).
    Event(SequencedEvent),
    /// Snapshot answering a bootstrap request.
    BootstrapResponse {
        tasks: Vec<Task>,
        #[serde(default)]
        users: BTreeMap<String, UserRef>,
        #[serde(default)]
        last_event_id: Option<String>,
        last_sequence: u64,
    },
    IdReconciled(ReconciliationRecord),
    /// Zero or more mappings broadcast while this client was away.
    PendingReconciliations {
        records: Vec<ReconciliationRecord>,
    },
    IdleSyncComplete {
        workspace_id: String,
        task_count: u64,
    },
    OfflineQueueReplayed {
        applied: u64,
    },
    TasksBulkUpdated {
        task_ids: Vec<String>,
    },
    /// Positive acknowledgement of a client frame, correlated by its
    /// `event_id`. Creates carry the server-assigned id in `result`.
    Ack {
        event_id: String,
        #[serde(default)]
        result: Value,
    },
    /// Request failure, correlated by `event_id` when it answers one.
    Error {
        #[serde(default)]
        event_id: Option<String>,
        code: u16,
        message: String,
        /// The server's current record, present on 409 conflicts so the
        /// client can merge locally.
        #[serde(default)]
        server_task: Option<Task>,
    },
}

impl ServerFrame {
    /// The client `event_id` this frame answers, if it answers one.
    pub fn correlates_to(&self) -> Option<&str> {
        match self {
            ServerFrame::Ack { event_id, .. } => Some(event_id.as_str()),
            ServerFrame::Error { event_id, .. } => event_id.as_deref(),
            _ => None,
        }
    }
}

/// Per-section content hashes for an analytics snapshot. `full` covers the
/// whole payload; section hashes allow targeted resync of one pane.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct SnapshotChecksums {
    pub full: String,
    #[serde(default)]
    pub sections: BTreeMap<String, String>,
}

/// Analytics/view cache entry keyed by (workspace, filter window).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnalyticsSnapshot {
    pub cache_key: String,
    pub workspace_id: String,
    /// Filter window in days.
    pub days: u32,
    pub timestamp: DateTime<Utc>,
    pub payload: Value,
    pub checksums: SnapshotChecksums,
    #[serde(default)]
    pub last_event_id: Option<String>,
}

impl AnalyticsSnapshot {
    pub fn cache_key_for(workspace_id: &str, days: u32) -> String {
        format!("{workspace_id}:{days}d")
    }
}

/// Body of the authoritative GET resync. Servers that expose their event
/// watermark include it so a full reconciliation can also advance the
/// sequencer; absent a watermark the client re-anchors on the next pushed
/// event instead.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TasksResyncResponse {
    pub tasks: Vec<Task>,
    #[serde(default)]
    pub users: BTreeMap<String, UserRef>,
    #[serde(default)]
    pub last_sequence: Option<u64>,
    #[serde(default)]
    pub last_event_id: Option<String>,
}

/// One element of the AI proposal SSE stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ProposalStreamEvent {
    Metadata {
        #[serde(default)]
        meeting_id: Option<String>,
        #[serde(default)]
        expected: Option<u64>,
    },
    Proposal {
        task: Task,
    },
    Done {
        #[serde(default)]
        count: Option<u64>,
    },
    Error {
        message: String,
    },
}
