use std::collections::{BTreeMap, HashSet, VecDeque};

use serde::{Deserialize, Serialize};

use tdk_schemas::{TaskEvent, VectorClock};

#[derive(Debug, Clone)]
pub struct SequencerConfig {
    /// Forward gaps up to this many missing events request a lightweight
    /// bootstrap; larger gaps request a full reconciliation.
    pub light_gap_threshold: u64,
    /// How many applied event ids are remembered for duplicate detection.
    pub history_cap: usize,
    /// Bound on the out-of-order buffer. Overflow drops the highest-sequence
    /// entry; the recovery fetch will re-deliver it.
    pub pending_cap: usize,
}

impl Default for SequencerConfig {
    fn default() -> Self {
        Self {
            light_gap_threshold: 5,
            history_cap: 256,
            pending_cap: 64,
        }
    }
}

/// Mutable sequencing state for one workspace. Persisted fields
/// (`last_event_id`, `last_sequence`, `clock`) round-trip through the store's
/// metadata section across restarts; the buffers are session-local.
#[derive(Debug, Clone, Default)]
pub struct SequencerState {
    pub last_event_id: Option<String>,
    pub last_sequence: u64,
    pub clock: VectorClock,
    /// Out-of-order arrivals keyed by sequence, waiting for the gap to fill.
    pub pending: BTreeMap<u64, TaskEvent>,
    /// Set by a watermark-less full reconciliation: the next forward event
    /// re-anchors the watermark instead of gap-buffering.
    pub(crate) realign: bool,
    seen: HashSet<String>,
    seen_order: VecDeque<String>,
}

impl SequencerState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Resume from persisted watermarks.
    pub fn resume(last_event_id: Option<String>, last_sequence: u64, clock: VectorClock) -> Self {
        Self {
            last_event_id,
            last_sequence,
            clock,
            ..Self::default()
        }
    }

    pub fn has_seen(&self, event_id: &str) -> bool {
        self.seen.contains(event_id)
    }

    pub(crate) fn remember(&mut self, event_id: &str, cap: usize) {
        if self.seen.insert(event_id.to_string()) {
            self.seen_order.push_back(event_id.to_string());
            while self.seen_order.len() > cap {
                if let Some(old) = self.seen_order.pop_front() {
                    self.seen.remove(&old);
                }
            }
        }
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }
}

/// What a forward gap asks the bootstrap coordinator to do.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecoveryRequest {
    /// Small gap: fetch the missing window.
    Bootstrap,
    /// Large gap: full authoritative reconciliation.
    FullResync,
}

/// Verdict for one inbound event.
#[derive(Debug, Clone, PartialEq)]
pub enum SequenceOutcome {
    /// The event is next in order. `ready` contains it plus any buffered
    /// successors that became contiguous, in sequence order; state has
    /// already advanced past all of them.
    Accepted { ready: Vec<TaskEvent> },
    /// Same `event_id` already applied or buffered. Silent no-op.
    Duplicate,
    /// Payload hash disagrees with the event's declared checksum. Not
    /// applied; the key is a drift-resync candidate.
    ChecksumMismatch { declared: String, computed: String },
    /// Regression: sequence at or below the applied watermark without
    /// filling a buffered gap. Blocked, state unchanged.
    TooOld { last_sequence: u64 },
    /// Forward gap: the event is buffered and a recovery fetch is required.
    GapBuffered {
        /// First missing sequence.
        missing_from: u64,
        /// Last missing sequence.
        missing_to: u64,
        recovery: RecoveryRequest,
    },
}
