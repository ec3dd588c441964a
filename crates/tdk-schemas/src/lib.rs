//! Shared wire and domain types for the TaskDesk client core.
//!
//! This crate holds only data: no I/O, no engines. Every other crate in the
//! workspace depends on it; it depends on nothing but serde and friends.

pub mod clock;
pub mod event;
pub mod queue;
pub mod task;
pub mod wire;

pub use clock::{ClockOrder, VectorClock};
pub use event::{EventParseError, TaskEvent, TaskEventKind};
pub use queue::{OpType, QueuedOperation, ReplayConflictStrategy};
pub use task::{
    Actor, AssignMode, ExtractionContext, SuggestState, Task, TaskFilter, TaskPriority, TaskStatus,
};
pub use wire::{
    AnalyticsSnapshot, ClientFrame, ProposalStreamEvent, ReconciliationRecord, SequencedEvent,
    ServerFrame, SnapshotChecksums, TasksResyncResponse, UserRef,
};
