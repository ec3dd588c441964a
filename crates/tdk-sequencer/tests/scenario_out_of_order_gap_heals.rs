use chrono::{TimeZone, Utc};
use tdk_schemas::{Actor, TaskEvent, TaskEventKind, VectorClock};
use tdk_sequencer::*;

fn ev(seq: u64, title: &str) -> TaskEvent {
    TaskEvent {
        event_id: format!("ev-{seq}"),
        workspace_id: "ws1".into(),
        sequence_num: seq,
        vector_clock: [(Actor::Server, seq)].into_iter().collect::<VectorClock>(),
        checksum: None,
        timestamp: Utc.timestamp_opt(1_700_000_000 + seq as i64, 0).unwrap(),
        actor: Actor::Server,
        kind: TaskEventKind::UpdateTitle {
            task_id: "42".into(),
            title: title.into(),
        },
    }
}

#[test]
fn scenario_events_1_3_2_apply_in_sequence_order() {
    let cfg = SequencerConfig::default();
    let mut st = SequencerState::new();

    // seq 1: in order, applied immediately.
    let out = validate_and_order(&cfg, &mut st, ev(1, "one"));
    match out {
        SequenceOutcome::Accepted { ready } => {
            assert_eq!(ready.len(), 1);
            assert_eq!(ready[0].sequence_num, 1);
        }
        other => panic!("expected accept, got {other:?}"),
    }

    // seq 3: one missing, buffered, light bootstrap requested.
    let out = validate_and_order(&cfg, &mut st, ev(3, "three"));
    assert_eq!(
        out,
        SequenceOutcome::GapBuffered {
            missing_from: 2,
            missing_to: 2,
            recovery: RecoveryRequest::Bootstrap,
        }
    );
    assert_eq!(st.last_sequence, 1);

    // seq 2 fills the gap; 3 drains behind it, in order.
    let out = validate_and_order(&cfg, &mut st, ev(2, "two"));
    match out {
        SequenceOutcome::Accepted { ready } => {
            let seqs: Vec<u64> = ready.iter().map(|e| e.sequence_num).collect();
            assert_eq!(seqs, vec![2, 3]);
        }
        other => panic!("expected accept, got {other:?}"),
    }
    assert_eq!(st.last_sequence, 3);
    assert_eq!(st.pending_len(), 0);
    assert_eq!(st.clock.get(Actor::Server), 3);
}

#[test]
fn scenario_gap_wider_than_threshold_requests_full_resync() {
    let cfg = SequencerConfig::default();
    let mut st = SequencerState::new();

    let out = validate_and_order(&cfg, &mut st, ev(1, "one"));
    assert!(matches!(out, SequenceOutcome::Accepted { .. }));

    // seq 10 leaves 8 missing (2..=9) > threshold of 5.
    let out = validate_and_order(&cfg, &mut st, ev(10, "ten"));
    assert_eq!(
        out,
        SequenceOutcome::GapBuffered {
            missing_from: 2,
            missing_to: 9,
            recovery: RecoveryRequest::FullResync,
        }
    );
}

#[test]
fn scenario_watermarkless_resync_reanchors_on_next_event() {
    let cfg = SequencerConfig::default();
    let mut st = SequencerState::new();

    assert!(matches!(
        validate_and_order(&cfg, &mut st, ev(1, "one")),
        SequenceOutcome::Accepted { .. }
    ));

    // 18 missing events: too wide for a light bootstrap.
    assert!(matches!(
        validate_and_order(&cfg, &mut st, ev(20, "twenty")),
        SequenceOutcome::GapBuffered {
            recovery: RecoveryRequest::FullResync,
            ..
        }
    ));

    // The authoritative snapshot arrived without a watermark: drop the
    // buffer and re-anchor on whatever the server pushes next.
    reset_for_realign(&mut st);
    assert_eq!(st.pending_len(), 0);

    match validate_and_order(&cfg, &mut st, ev(21, "twenty-one")) {
        SequenceOutcome::Accepted { ready } => {
            assert_eq!(ready.len(), 1);
            assert_eq!(ready[0].sequence_num, 21);
        }
        other => panic!("expected accept, got {other:?}"),
    }
    assert_eq!(st.last_sequence, 21);

    // Re-anchoring is one-shot and never admits regressions.
    assert_eq!(
        validate_and_order(&cfg, &mut st, ev(5, "five")),
        SequenceOutcome::TooOld { last_sequence: 21 }
    );
    assert!(matches!(
        validate_and_order(&cfg, &mut st, ev(30, "thirty")),
        SequenceOutcome::GapBuffered { .. }
    ));
}

#[test]
fn scenario_snapshot_watermark_drains_buffered_successors() {
    let cfg = SequencerConfig::default();
    let mut st = SequencerState::new();

    // 5 and 6 arrive before any snapshot.
    assert!(matches!(
        validate_and_order(&cfg, &mut st, ev(5, "five")),
        SequenceOutcome::GapBuffered { .. }
    ));
    assert!(matches!(
        validate_and_order(&cfg, &mut st, ev(6, "six")),
        SequenceOutcome::GapBuffered { .. }
    ));

    // Bootstrap lands at watermark 4: both buffered events become contiguous.
    let ready = admit_snapshot(&cfg, &mut st, Some("boot-4".into()), 4);
    let seqs: Vec<u64> = ready.iter().map(|e| e.sequence_num).collect();
    assert_eq!(seqs, vec![5, 6]);
    assert_eq!(st.last_sequence, 6);
}
