//! Out-of-order delivery heals through the pending buffer; regressions
//! never touch the store.

use tdk_bus::TabBus;
use tdk_schemas::{Actor, ServerFrame, TaskEventKind, VectorClock};
use tdk_testkit::{mk_event, mk_task, spawn_tab, wait_until};

#[tokio::test]
async fn scenario_events_1_3_2_converge_to_sequential_state() {
    let tab = spawn_tab(TabBus::new(), None).await.unwrap();
    tab.channel.set_online(true);

    tab.channel.push(mk_event(
        1,
        TaskEventKind::CreateManual {
            task: mk_task("42", "one"),
        },
    ));
    tab.channel.push(mk_event(
        3,
        TaskEventKind::UpdateTitle {
            task_id: "42".into(),
            title: "three".into(),
        },
    ));
    tab.channel.push(mk_event(
        2,
        TaskEventKind::UpdateTitle {
            task_id: "42".into(),
            title: "two".into(),
        },
    ));

    // Applying 1, then buffering 3, then draining 2+3 must equal the
    // sequential application: the last title wins.
    wait_until!(
        "task 42 to read 'three'",
        matches!(
            tab.engine.store.get_task("42").await.unwrap(),
            Some(t) if t.title == "three"
        )
    );

    let stats = tab.engine.dispatcher.stats().snapshot();
    assert_eq!(stats.accepted, 3);
    assert_eq!(stats.gaps, 1);
    assert_eq!(tab.engine.dispatcher.last_sequence().await, 3);
}

#[tokio::test]
async fn scenario_wide_gap_recovers_through_watermarkless_resync() {
    let tab = spawn_tab(TabBus::new(), None).await.unwrap();
    tab.channel.set_online(true);

    tab.channel.push(mk_event(
        1,
        TaskEventKind::CreateManual {
            task: mk_task("42", "one"),
        },
    ));
    wait_until!(
        "first event to apply",
        tab.engine.dispatcher.last_sequence().await == 1
    );

    // 18 missing events: beyond the light-bootstrap threshold, so a full
    // reconciliation is requested and the event stays buffered.
    tab.channel.push(mk_event(
        20,
        TaskEventKind::UpdateTitle {
            task_id: "42".into(),
            title: "twenty".into(),
        },
    ));
    wait_until!(
        "wide gap to be recorded",
        tab.engine.dispatcher.stats().snapshot().gaps == 1
    );

    // The authoritative fetch answered without a sequence watermark; apply
    // it the way the coordinator does.
    let mut authoritative = mk_task("42", "caught up");
    authoritative.vector_clock = [(Actor::Server, 20)].into_iter().collect::<VectorClock>();
    authoritative.sequence_num = 20;
    tab.engine
        .dispatcher
        .apply_resync_reset(vec![authoritative])
        .await
        .unwrap();
    wait_until!(
        "snapshot to land",
        matches!(
            tab.engine.store.get_task("42").await.unwrap(),
            Some(t) if t.title == "caught up"
        )
    );

    // The stream continues past the gap and is accepted: the sequencer
    // re-anchored instead of wedging in a buffer/resync loop.
    tab.channel.push(mk_event(
        21,
        TaskEventKind::UpdateTitle {
            task_id: "42".into(),
            title: "after resync".into(),
        },
    ));
    wait_until!(
        "post-resync event to apply",
        tab.engine.dispatcher.last_sequence().await == 21
    );
    let task = tab.engine.store.get_task("42").await.unwrap().unwrap();
    assert_eq!(task.title, "after resync");
}

#[tokio::test]
async fn scenario_regression_below_watermark_leaves_store_unchanged() {
    let tab = spawn_tab(TabBus::new(), None).await.unwrap();
    tab.channel.set_online(true);

    // Authoritative snapshot at watermark 5.
    tab.channel.push(ServerFrame::BootstrapResponse {
        tasks: vec![mk_task("42", "A")],
        users: Default::default(),
        last_event_id: Some("ev-5".into()),
        last_sequence: 5,
    });
    wait_until!(
        "bootstrap to land",
        tab.engine.store.get_task("42").await.unwrap().is_some()
    );

    // A late event from the past with a differing title.
    tab.channel.push(mk_event(
        3,
        TaskEventKind::UpdateTitle {
            task_id: "42".into(),
            title: "stale title".into(),
        },
    ));

    wait_until!(
        "regression to be counted",
        tab.engine.dispatcher.stats().snapshot().regressions == 1
    );

    let task = tab.engine.store.get_task("42").await.unwrap().unwrap();
    assert_eq!(task.title, "A");
    assert_eq!(tab.engine.dispatcher.last_sequence().await, 5);
}
