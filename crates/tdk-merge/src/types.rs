use serde::{Deserialize, Serialize};
use serde_json::Value;

use tdk_schemas::{ClockOrder, Task};

/// Conflict-resolution strategy for one merge call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum MergeStrategy {
    /// Remote wins every differing field, including deletions. The engine
    /// default.
    #[default]
    ServerAuthoritative,
    /// Newer `updated_at` wins; ties fall back to actor rank.
    LastWriteWins,
    /// Higher-ranked writer class wins; ties go to the remote side.
    ActorRank,
    /// Arrays union-merge (primitives deduped; objects deduped by `id`),
    /// scalars resolve as last-write-wins.
    FieldMerge,
}

/// Which side a differing field resolved to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Winner {
    Local,
    Remote,
    /// Both contributed (array union).
    Union,
}

/// One per-field resolution, recorded for logging and for surfacing
/// irreconcilable conflicts to the caller.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldConflict {
    pub field: String,
    pub local: Value,
    pub remote: Value,
    pub winner: Winner,
}

/// Inputs the resolution was computed from, kept alongside the conflicts so
/// a log line can explain *why* a side won.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MergeMetadata {
    pub strategy: MergeStrategy,
    pub clock_order: ClockOrderTag,
    pub local_rank: u8,
    pub remote_rank: u8,
}

/// Serializable mirror of [`ClockOrder`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClockOrderTag {
    Before,
    After,
    Equal,
    Concurrent,
}

impl From<ClockOrder> for ClockOrderTag {
    fn from(o: ClockOrder) -> Self {
        match o {
            ClockOrder::Before => ClockOrderTag::Before,
            ClockOrder::After => ClockOrderTag::After,
            ClockOrder::Equal => ClockOrderTag::Equal,
            ClockOrder::Concurrent => ClockOrderTag::Concurrent,
        }
    }
}

/// Result of [`crate::merge_tasks`].
#[derive(Debug, Clone, PartialEq)]
pub struct MergeReport {
    pub merged: Task,
    pub conflicts: Vec<FieldConflict>,
    pub metadata: MergeMetadata,
}

impl MergeReport {
    /// True when the two sides agreed on every merged field.
    pub fn is_clean(&self) -> bool {
        self.conflicts.is_empty()
    }
}
