//! An edit made offline and replayed later lands in the same state as the
//! same edit made online.

use tdk_bus::TabBus;
use tdk_dispatch::SubmitOutcome;
use tdk_schemas::TaskEventKind;
use tdk_testkit::{mk_event, mk_task, spawn_tab, wait_until};

fn title_edit() -> TaskEventKind {
    TaskEventKind::UpdateTitle {
        task_id: "42".into(),
        title: "edited".into(),
    }
}

#[tokio::test]
async fn scenario_offline_edit_replays_to_the_online_result() {
    let offline_tab = spawn_tab(TabBus::new(), None).await.unwrap();
    let online_tab = spawn_tab(TabBus::new(), None).await.unwrap();

    // Both tabs know task 42 from the same server event.
    for tab in [&offline_tab, &online_tab] {
        tab.channel.set_online(true);
        tab.channel.push(mk_event(
            1,
            TaskEventKind::CreateManual {
                task: mk_task("42", "original"),
            },
        ));
        wait_until!(
            "task 42 to exist",
            tab.engine.store.get_task("42").await.unwrap().is_some()
        );
    }

    // The online tab edits immediately.
    let outcome = online_tab.engine.dispatcher.submit(title_edit()).await.unwrap();
    assert_eq!(outcome, SubmitOutcome::Sent);

    // The offline tab queues the same edit, then reconnects.
    offline_tab.channel.set_online(false);
    let outcome = offline_tab.engine.dispatcher.submit(title_edit()).await.unwrap();
    assert!(matches!(outcome, SubmitOutcome::Queued { .. }));
    assert_eq!(offline_tab.engine.store.queue_len().await.unwrap(), 1);

    offline_tab.channel.set_online(true);
    wait_until!(
        "queue to drain",
        offline_tab.engine.store.queue_len().await.unwrap() == 0
    );

    // Same user-visible result on both sides.
    let offline_task = offline_tab.engine.store.get_task("42").await.unwrap().unwrap();
    let online_task = online_tab.engine.store.get_task("42").await.unwrap().unwrap();
    assert_eq!(offline_task.title, "edited");
    assert_eq!(offline_task.title, online_task.title);
    assert_eq!(offline_task.status, online_task.status);

    // The replay went out as a queue frame with the entry's own identity.
    let sent = offline_tab.channel.sent_frames().await;
    assert!(sent
        .iter()
        .any(|f| f.event_type == "task_update:title" && f.event_id.starts_with("queue_")));
}
