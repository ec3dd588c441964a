//! Event sequencing: per-workspace total order with gap buffering,
//! regression blocking, duplicate dropping, and vector-clock maintenance.
//!
//! The engine is a pure function over `(&SequencerConfig, &mut
//! SequencerState, event)` returning a [`SequenceOutcome`]; callers own all
//! I/O and apply accepted events in the order returned.

mod engine;
mod types;

pub use engine::{admit_snapshot, reset_for_realign, validate_and_order};
pub use types::{RecoveryRequest, SequenceOutcome, SequencerConfig, SequencerState};
