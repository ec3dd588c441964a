//! Intra-origin broadcast fabric between sibling tabs.
//!
//! Tabs share no memory and no timers; this bus is the only coupling. Every
//! message carries the originating server `event_id` (so the receiving tab's
//! idempotency guard can drop re-deliveries) and the sender's tab id (so a
//! tab ignores its own broadcasts).

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::broadcast;
use uuid::Uuid;

use tdk_schemas::ReconciliationRecord;

/// What happened to a task, as far as sibling tabs need to know.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MutationKind {
    Created,
    Updated,
    Deleted,
}

/// Payload kinds crossing the tab boundary.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TabMessageKind {
    /// A task changed in the sending tab's store.
    Mutation {
        kind: MutationKind,
        task_id: String,
        /// Sequence the sender's store was at after applying. Receivers
        /// apply only if their own sequence allows it; otherwise they wait
        /// for the canonical server event.
        sequence_num: u64,
    },
    /// Authoritative temp→real identity mapping relay.
    IdReconciled(ReconciliationRecord),
    /// View-state (filter) change; mutates no tasks.
    ViewState { filter: Value },
}

/// One broadcast frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TabMessage {
    /// Sending tab. Receivers drop their own frames.
    pub tab_id: String,
    /// Originating server event id, for receiver-side deduplication.
    pub event_id: String,
    pub workspace_id: String,
    #[serde(flatten)]
    pub kind: TabMessageKind,
}

/// Process-local broadcast channel standing in for the origin-wide fabric.
/// Every engine ("tab") holding a clone of the same `TabBus` sees every
/// publish; the subscription side is a plain broadcast receiver.
#[derive(Clone)]
pub struct TabBus {
    tx: broadcast::Sender<TabMessage>,
}

impl TabBus {
    pub fn new() -> Self {
        let (tx, _rx) = broadcast::channel(256);
        Self { tx }
    }

    /// Fresh tab identity for one engine instance.
    pub fn mint_tab_id() -> String {
        format!("tab_{}", Uuid::new_v4().simple())
    }

    pub fn publish(&self, msg: TabMessage) {
        // No sibling tabs listening is normal for a solo tab.
        if self.tx.send(msg).is_err() {
            tracing::trace!("tab bus publish with no subscribers");
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<TabMessage> {
        self.tx.subscribe()
    }
}

impl Default for TabBus {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn publishes_reach_all_subscribers() {
        let bus = TabBus::new();
        let mut rx_a = bus.subscribe();
        let mut rx_b = bus.subscribe();

        let msg = TabMessage {
            tab_id: "tab_1".into(),
            event_id: "ev-1".into(),
            workspace_id: "ws1".into(),
            kind: TabMessageKind::Mutation {
                kind: MutationKind::Updated,
                task_id: "42".into(),
                sequence_num: 7,
            },
        };
        bus.publish(msg.clone());

        assert_eq!(rx_a.recv().await.unwrap(), msg);
        assert_eq!(rx_b.recv().await.unwrap(), msg);
    }

    #[test]
    fn frames_round_trip_as_tagged_json() {
        let msg = TabMessage {
            tab_id: "tab_1".into(),
            event_id: "ev-2".into(),
            workspace_id: "ws1".into(),
            kind: TabMessageKind::ViewState {
                filter: serde_json::json!({"status": "todo"}),
            },
        };
        let json = serde_json::to_string(&msg).unwrap();
        assert!(json.contains("\"type\":\"view_state\""));
        let back: TabMessage = serde_json::from_str(&json).unwrap();
        assert_eq!(back, msg);
    }
}
