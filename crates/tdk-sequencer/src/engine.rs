use tdk_schemas::TaskEvent;

use crate::types::{RecoveryRequest, SequenceOutcome, SequencerConfig, SequencerState};

/// Validate one inbound event against the workspace order and either accept
/// it (draining any buffered successors), drop it, or buffer it.
///
/// Rules, in precedence order:
/// 1. duplicates (same `event_id`) are idempotent no-ops;
/// 2. a declared checksum must match the recomputed payload hash;
/// 3. `sequence_num <= last_sequence` is a regression and is blocked;
/// 4. `sequence_num == last_sequence + 1` is accepted, then the pending
///    buffer is drained while it stays contiguous;
/// 5. anything further ahead is buffered and a recovery request is emitted.
pub fn validate_and_order(
    cfg: &SequencerConfig,
    st: &mut SequencerState,
    event: TaskEvent,
) -> SequenceOutcome {
    if st.has_seen(&event.event_id) {
        return SequenceOutcome::Duplicate;
    }
    if let Some(buffered) = st.pending.get(&event.sequence_num) {
        if buffered.event_id == event.event_id {
            return SequenceOutcome::Duplicate;
        }
    }

    if let Some(declared) = event.checksum.as_deref() {
        let (_, payload) = event.kind.to_wire_payload();
        let computed = tdk_checksum::checksum(&payload);
        if computed != declared {
            return SequenceOutcome::ChecksumMismatch {
                declared: declared.to_string(),
                computed,
            };
        }
    }

    // A watermark-less full reconciliation re-anchors here: the snapshot
    // already covers everything missed, so the next forward event becomes
    // the new watermark no matter how wide the gap was.
    if st.realign && event.sequence_num > st.last_sequence {
        st.realign = false;
        let mut ready = Vec::new();
        apply_one(cfg, st, event, &mut ready);
        drain_contiguous(cfg, st, &mut ready);
        return SequenceOutcome::Accepted { ready };
    }

    let next = st.last_sequence + 1;

    if event.sequence_num < next {
        return SequenceOutcome::TooOld {
            last_sequence: st.last_sequence,
        };
    }

    if event.sequence_num > next {
        let missing_from = next;
        let missing_to = event.sequence_num - 1;
        let gap = missing_to - missing_from + 1;

        st.pending.insert(event.sequence_num, event);
        while st.pending.len() > cfg.pending_cap {
            // The recovery fetch re-delivers everything past the watermark,
            // so shedding the farthest-ahead entry loses nothing.
            st.pending.pop_last();
        }

        let recovery = if gap <= cfg.light_gap_threshold {
            RecoveryRequest::Bootstrap
        } else {
            RecoveryRequest::FullResync
        };

        return SequenceOutcome::GapBuffered {
            missing_from,
            missing_to,
            recovery,
        };
    }

    // In order: apply, then drain the buffer while it stays contiguous.
    let mut ready = Vec::new();
    apply_one(cfg, st, event, &mut ready);
    drain_contiguous(cfg, st, &mut ready);

    SequenceOutcome::Accepted { ready }
}

/// Drop the out-of-order buffer and re-anchor on the stream. Used after a
/// full reconciliation whose snapshot carried no sequence watermark: the
/// snapshot supersedes every buffered event, and the next forward event the
/// server pushes becomes the new watermark. Regressions stay blocked.
pub fn reset_for_realign(st: &mut SequencerState) {
    st.pending.clear();
    st.realign = true;
}

/// Admit an authoritative snapshot watermark (bootstrap / full resync).
/// Buffered events at or below the watermark are discarded as superseded;
/// events that became contiguous are returned in order, state advanced.
pub fn admit_snapshot(
    cfg: &SequencerConfig,
    st: &mut SequencerState,
    last_event_id: Option<String>,
    last_sequence: u64,
) -> Vec<TaskEvent> {
    if last_sequence > st.last_sequence {
        st.last_sequence = last_sequence;
        if last_event_id.is_some() {
            st.last_event_id = last_event_id;
        }
    }
    // A real watermark supersedes any pending re-anchor.
    st.realign = false;
    st.pending = st.pending.split_off(&(st.last_sequence + 1));

    let mut ready = Vec::new();
    drain_contiguous(cfg, st, &mut ready);
    ready
}

fn apply_one(
    cfg: &SequencerConfig,
    st: &mut SequencerState,
    event: TaskEvent,
    ready: &mut Vec<TaskEvent>,
) {
    st.last_sequence = event.sequence_num;
    st.last_event_id = Some(event.event_id.clone());
    st.clock.merge(&event.vector_clock);
    st.remember(&event.event_id, cfg.history_cap);
    ready.push(event);
}

fn drain_contiguous(cfg: &SequencerConfig, st: &mut SequencerState, ready: &mut Vec<TaskEvent>) {
    while let Some(event) = st.pending.remove(&(st.last_sequence + 1)) {
        apply_one(cfg, st, event, ready);
    }
}
