use chrono::{TimeZone, Utc};
use tdk_schemas::{Actor, TaskEvent, TaskEventKind, VectorClock};
use tdk_sequencer::*;

fn ev(id: &str, seq: u64, title: &str) -> TaskEvent {
    TaskEvent {
        event_id: id.into(),
        workspace_id: "ws1".into(),
        sequence_num: seq,
        vector_clock: VectorClock::new(),
        checksum: None,
        timestamp: Utc.timestamp_opt(1_700_000_000, 0).unwrap(),
        actor: Actor::Server,
        kind: TaskEventKind::UpdateTitle {
            task_id: "42".into(),
            title: title.into(),
        },
    }
}

#[test]
fn scenario_regression_below_watermark_is_blocked() {
    let cfg = SequencerConfig::default();
    let mut st = SequencerState::resume(Some("ev-5".into()), 5, VectorClock::new());

    let out = validate_and_order(&cfg, &mut st, ev("late", 3, "stale title"));
    assert_eq!(out, SequenceOutcome::TooOld { last_sequence: 5 });
    assert_eq!(st.last_sequence, 5);
}

#[test]
fn scenario_duplicate_event_id_is_a_silent_noop() {
    let cfg = SequencerConfig::default();
    let mut st = SequencerState::new();

    assert!(matches!(
        validate_and_order(&cfg, &mut st, ev("ev-1", 1, "one")),
        SequenceOutcome::Accepted { .. }
    ));
    // Redelivery of the same event id.
    assert_eq!(
        validate_and_order(&cfg, &mut st, ev("ev-1", 1, "one")),
        SequenceOutcome::Duplicate
    );
    // A buffered event is also duplicate-protected.
    assert!(matches!(
        validate_and_order(&cfg, &mut st, ev("ev-9", 9, "nine")),
        SequenceOutcome::GapBuffered { .. }
    ));
    assert_eq!(
        validate_and_order(&cfg, &mut st, ev("ev-9", 9, "nine")),
        SequenceOutcome::Duplicate
    );
}

#[test]
fn scenario_checksum_mismatch_is_not_applied() {
    let cfg = SequencerConfig::default();
    let mut st = SequencerState::new();

    let mut bad = ev("ev-1", 1, "one");
    bad.checksum = Some("0000000000000000".into());

    match validate_and_order(&cfg, &mut st, bad) {
        SequenceOutcome::ChecksumMismatch { declared, .. } => {
            assert_eq!(declared, "0000000000000000");
        }
        other => panic!("expected checksum mismatch, got {other:?}"),
    }
    assert_eq!(st.last_sequence, 0);

    // A correctly-hashed event is accepted.
    let mut good = ev("ev-2", 1, "one");
    let (_, payload) = good.kind.to_wire_payload();
    good.checksum = Some(tdk_checksum::checksum(&payload));
    assert!(matches!(
        validate_and_order(&cfg, &mut st, good),
        SequenceOutcome::Accepted { .. }
    ));
}
