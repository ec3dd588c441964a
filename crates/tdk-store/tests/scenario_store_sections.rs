use chrono::{TimeZone, Utc};
use tdk_schemas::{
    QueuedOperation, Task, TaskEventKind, TaskFilter, TaskPriority, TaskStatus, VectorClock,
};
use tdk_store::LocalStore;

fn t0() -> chrono::DateTime<Utc> {
    Utc.timestamp_opt(1_700_000_000, 0).unwrap()
}

fn mk_task(id: &str, title: &str) -> Task {
    Task::new(id, "ws1", title, t0())
}

#[tokio::test]
async fn scenario_task_round_trip_and_indexed_filters() {
    let store = LocalStore::open_in_memory().await.unwrap();

    let mut a = mk_task("a", "prep agenda");
    a.status = TaskStatus::InProgress;
    a.meeting_id = Some("m1".into());
    a.assignee_ids = vec!["u1".into()];
    a.labels = vec!["planning".into()];

    let mut b = mk_task("b", "send recap");
    b.assignee_ids = vec!["u2".into()];

    store.save_tasks(&[a.clone(), b.clone()]).await.unwrap();

    assert_eq!(store.get_task("a").await.unwrap().unwrap(), a);
    assert_eq!(store.task_count().await.unwrap(), 2);

    let by_status = store
        .filter_tasks(
            &TaskFilter {
                status: Some(TaskStatus::InProgress),
                ..Default::default()
            },
            t0(),
        )
        .await
        .unwrap();
    assert_eq!(by_status.len(), 1);
    assert_eq!(by_status[0].id, "a");

    let by_assignee = store
        .filter_tasks(
            &TaskFilter {
                assignee_id: Some("u2".into()),
                ..Default::default()
            },
            t0(),
        )
        .await
        .unwrap();
    assert_eq!(by_assignee.len(), 1);
    assert_eq!(by_assignee[0].id, "b");

    let by_label = store
        .filter_tasks(
            &TaskFilter {
                label: Some("planning".into()),
                ..Default::default()
            },
            t0(),
        )
        .await
        .unwrap();
    assert_eq!(by_label.len(), 1);
    assert_eq!(by_label[0].id, "a");

    store.delete_task("a").await.unwrap();
    assert!(store.get_task("a").await.unwrap().is_none());
}

#[tokio::test]
async fn scenario_snoozed_tasks_hidden_until_window_passes() {
    let store = LocalStore::open_in_memory().await.unwrap();

    let mut t = mk_task("s", "snoozed one");
    t.snoozed_until = Some(t0() + chrono::Duration::hours(1));
    store.save_task(&t).await.unwrap();

    let hidden = store.all_tasks(t0()).await.unwrap();
    assert!(hidden.is_empty());

    let visible = store
        .all_tasks(t0() + chrono::Duration::hours(2))
        .await
        .unwrap();
    assert_eq!(visible.len(), 1);
}

#[tokio::test]
async fn scenario_queue_replays_in_priority_then_fifo_order() {
    let store = LocalStore::open_in_memory().await.unwrap();

    let mk_op = |task: &str, title: &str, priority: i64, at_secs: i64| {
        let mut op = QueuedOperation::new(
            TaskEventKind::UpdateTitle {
                task_id: task.into(),
                title: title.into(),
            },
            VectorClock::new(),
            "sess-1",
            Utc.timestamp_opt(1_700_000_000 + at_secs, 0).unwrap(),
        );
        op.priority = priority;
        op
    };

    // Inserted out of order on purpose.
    store.queue_operation(&mk_op("a", "low late", 1, 50)).await.unwrap();
    store.queue_operation(&mk_op("b", "high late", 9, 40)).await.unwrap();
    store.queue_operation(&mk_op("c", "high early", 9, 10)).await.unwrap();
    store.queue_operation(&mk_op("d", "low early", 1, 5)).await.unwrap();

    let order: Vec<String> = store
        .get_queue()
        .await
        .unwrap()
        .into_iter()
        .map(|op| op.task_ref)
        .collect();
    assert_eq!(order, vec!["c", "b", "d", "a"]);

    let head = store.pop_queue().await.unwrap().unwrap();
    assert_eq!(head.task_ref, "c");
    assert_eq!(store.queue_len().await.unwrap(), 3);

    let attempts = store.bump_queue_attempts(head.queue_id).await.unwrap();
    // The head was already popped; bumping a missing row is a no-op.
    assert_eq!(attempts, 0);
}

#[tokio::test]
async fn scenario_reconcile_temp_id_rewrites_task_and_queue() {
    let store = LocalStore::open_in_memory().await.unwrap();

    let temp = mk_task("tmp_sess1_1", "offline created");
    store.save_task(&temp).await.unwrap();

    let op = QueuedOperation::new(
        TaskEventKind::UpdateTitle {
            task_id: "tmp_sess1_1".into(),
            title: "edited while offline".into(),
        },
        VectorClock::new(),
        "sess-1",
        t0(),
    );
    store.queue_operation(&op).await.unwrap();

    let outcome = store.reconcile_temp_id("tmp_sess1_1", "77").await.unwrap();
    assert!(outcome.applied);
    assert!(!outcome.kept_server_record);
    assert_eq!(outcome.retargeted_ops, 1);

    // No reference to the temp id remains.
    assert!(store.get_task("tmp_sess1_1").await.unwrap().is_none());
    let renamed = store.get_task("77").await.unwrap().unwrap();
    assert_eq!(renamed.temp_id.as_deref(), Some("tmp_sess1_1"));

    let queue = store.get_queue().await.unwrap();
    assert_eq!(queue.len(), 1);
    assert_eq!(queue[0].task_ref, "77");
    match &queue[0].kind {
        TaskEventKind::UpdateTitle { task_id, .. } => assert_eq!(task_id, "77"),
        other => panic!("unexpected kind {other:?}"),
    }
}

#[tokio::test]
async fn scenario_reconcile_prefers_existing_server_record() {
    let store = LocalStore::open_in_memory().await.unwrap();

    let temp = mk_task("tmp_sess1_2", "local copy");
    let mut server = mk_task("88", "server copy");
    server.priority = TaskPriority::High;
    store.save_tasks(&[temp, server.clone()]).await.unwrap();

    let outcome = store.reconcile_temp_id("tmp_sess1_2", "88").await.unwrap();
    assert!(outcome.applied);
    assert!(outcome.kept_server_record);

    let kept = store.get_task("88").await.unwrap().unwrap();
    assert_eq!(kept.title, "server copy");
    assert_eq!(kept.priority, TaskPriority::High);
    assert!(store.get_task("tmp_sess1_2").await.unwrap().is_none());
}

#[tokio::test]
async fn scenario_migrations_are_idempotent_across_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("tasks_db.sqlite");

    {
        let store = LocalStore::open(&path).await.unwrap();
        store.save_task(&mk_task("a", "persisted")).await.unwrap();
        store.set_last_sequence(41).await.unwrap();
    }

    // Reopen: migration chain must be a no-op and data must survive.
    let store = LocalStore::open(&path).await.unwrap();
    assert_eq!(store.get_task("a").await.unwrap().unwrap().title, "persisted");
    assert_eq!(store.last_sequence().await.unwrap(), 41);
    assert_eq!(
        store
            .get_metadata(tdk_store::meta_keys::SCHEMA_VERSION)
            .await
            .unwrap()
            .as_deref(),
        Some(tdk_store::SCHEMA_VERSION.to_string().as_str())
    );
}

#[tokio::test]
async fn scenario_every_write_emits_a_change_notification() {
    let store = LocalStore::open_in_memory().await.unwrap();
    let mut changes = store.subscribe_changes();

    store.save_task(&mk_task("a", "watched")).await.unwrap();
    match changes.recv().await.unwrap() {
        tdk_store::StoreChange::TaskSaved { id } => assert_eq!(id, "a"),
        other => panic!("unexpected change {other:?}"),
    }

    store.delete_task("a").await.unwrap();
    match changes.recv().await.unwrap() {
        tdk_store::StoreChange::TaskDeleted { id } => assert_eq!(id, "a"),
        other => panic!("unexpected change {other:?}"),
    }
}

#[tokio::test]
async fn scenario_clear_all_preserves_schema_version() {
    let store = LocalStore::open_in_memory().await.unwrap();
    store.save_task(&mk_task("a", "gone soon")).await.unwrap();
    store.set_metadata("last_event_id", "ev-9").await.unwrap();

    store.clear_all().await.unwrap();

    assert_eq!(store.task_count().await.unwrap(), 0);
    assert!(store.get_metadata("last_event_id").await.unwrap().is_none());
    assert!(store
        .get_metadata(tdk_store::meta_keys::SCHEMA_VERSION)
        .await
        .unwrap()
        .is_some());
}
