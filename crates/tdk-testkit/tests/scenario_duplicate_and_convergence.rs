//! Idempotency and multi-tab convergence: re-delivered events are no-ops,
//! and two tabs fed the same stream in different orders end up with equal
//! stores.

use tdk_bus::TabBus;
use tdk_dispatch::TaskNotification;
use tdk_schemas::{Task, TaskEventKind, TaskPriority, TaskStatus};
use tdk_testkit::{mk_event, mk_task, spawn_tab, wait_until};

#[tokio::test]
async fn scenario_redelivered_event_changes_nothing_and_notifies_once() {
    let tab = spawn_tab(TabBus::new(), None).await.unwrap();
    tab.channel.set_online(true);
    let mut notifications = tab.engine.dispatcher.subscribe();

    let event = mk_event(
        1,
        TaskEventKind::CreateManual {
            task: mk_task("42", "once"),
        },
    );
    tab.channel.push(event.clone());
    wait_until!(
        "first delivery to apply",
        tab.engine.store.get_task("42").await.unwrap().is_some()
    );
    let state_after_first = tab.engine.store.get_task("42").await.unwrap();

    // Redeliver the identical event.
    tab.channel.push(event);
    wait_until!(
        "duplicate to be dropped",
        tab.engine.dispatcher.stats().snapshot().duplicates == 1
    );

    assert_eq!(
        tab.engine.store.get_task("42").await.unwrap(),
        state_after_first
    );

    let mut created_notifications = 0;
    while let Ok(n) = notifications.try_recv() {
        if matches!(n, TaskNotification::TaskCreated { .. }) {
            created_notifications += 1;
        }
    }
    assert_eq!(created_notifications, 1);
}

fn stream() -> Vec<(u64, TaskEventKind)> {
    vec![
        (
            1,
            TaskEventKind::CreateManual {
                task: mk_task("42", "draft"),
            },
        ),
        (
            2,
            TaskEventKind::UpdatePriority {
                task_id: "42".into(),
                priority: TaskPriority::Urgent,
            },
        ),
        (
            3,
            TaskEventKind::StatusToggle {
                task_id: "42".into(),
                status: TaskStatus::InProgress,
            },
        ),
        (
            4,
            TaskEventKind::UpdateLabels {
                task_id: "42".into(),
                labels: vec!["follow-up".into()],
            },
        ),
    ]
}

fn comparable(mut tasks: Vec<Task>) -> Vec<Task> {
    tasks.sort_by(|a, b| a.id.cmp(&b.id));
    tasks
}

#[tokio::test]
async fn scenario_two_tabs_with_shuffled_streams_converge() {
    let bus = TabBus::new();
    let tab_a = spawn_tab(bus.clone(), None).await.unwrap();
    let tab_b = spawn_tab(bus.clone(), None).await.unwrap();
    tab_a.channel.set_online(true);
    tab_b.channel.set_online(true);

    let events = stream();

    // Tab A receives in order; tab B shuffled (4, 2, 1, 3).
    for (seq, kind) in &events {
        tab_a.channel.push(mk_event(*seq, kind.clone()));
    }
    for index in [3usize, 1, 0, 2] {
        let (seq, kind) = &events[index];
        tab_b.channel.push(mk_event(*seq, kind.clone()));
    }

    wait_until!(
        "tab A to reach sequence 4",
        tab_a.engine.dispatcher.last_sequence().await == 4
    );
    wait_until!(
        "tab B to reach sequence 4",
        tab_b.engine.dispatcher.last_sequence().await == 4
    );

    let a = comparable(tab_a.engine.painted_tasks().await.unwrap());
    let b = comparable(tab_b.engine.painted_tasks().await.unwrap());
    assert_eq!(a, b);

    let task = &a[0];
    assert_eq!(task.priority, TaskPriority::Urgent);
    assert_eq!(task.status, TaskStatus::InProgress);
    assert_eq!(task.labels, vec!["follow-up".to_string()]);
}
