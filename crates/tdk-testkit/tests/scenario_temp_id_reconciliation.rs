//! Offline create → reconnect → server ack with the real id. The temp id
//! disappears everywhere and sibling tabs observe exactly one
//! reconciliation broadcast.

use std::time::Duration;

use serde_json::json;
use tdk_bus::{TabBus, TabMessageKind};
use tdk_dispatch::{SubmitOutcome, TaskNotification};
use tdk_schemas::{ServerFrame, Task, TaskEventKind};
use tdk_testkit::{spawn_tab, test_epoch, wait_until};

#[tokio::test]
async fn scenario_offline_create_reconciles_to_server_id_across_tabs() {
    let bus = TabBus::new();
    let tab_a = spawn_tab(bus.clone(), None).await.unwrap();
    let tab_b = spawn_tab(bus.clone(), None).await.unwrap();
    let mut bus_watch = bus.subscribe();
    let mut b_notifications = tab_b.engine.dispatcher.subscribe();

    // Offline create: optimistic temp record + queued operation.
    let draft = Task::new("", "ws1", "created while offline", test_epoch());
    let outcome = tab_a
        .engine
        .dispatcher
        .submit(TaskEventKind::CreateManual { task: draft })
        .await
        .unwrap();
    let queue_id = match outcome {
        SubmitOutcome::Queued { queue_id } => queue_id,
        other => panic!("expected queued, got {other:?}"),
    };
    assert!(queue_id > 0);

    let temp_id = {
        let tasks = tab_a.engine.painted_tasks().await.unwrap();
        assert_eq!(tasks.len(), 1);
        assert!(tasks[0].id.starts_with("tmp_sess_"), "got {}", tasks[0].id);
        tasks[0].id.clone()
    };

    // Reconnect: the server acks the replayed create with the real id.
    tab_a
        .channel
        .set_responder(|frame| {
            if frame.event_type == "task_create:manual" {
                ServerFrame::Ack {
                    event_id: frame.event_id.clone(),
                    result: json!({ "id": "77" }),
                }
            } else {
                ServerFrame::Ack {
                    event_id: frame.event_id.clone(),
                    result: json!({}),
                }
            }
        })
        .await;
    tab_a.channel.set_online(true);

    wait_until!(
        "store to hold the server id",
        tab_a.engine.store.get_task("77").await.unwrap().is_some()
    );

    // No reference to the temp id remains.
    assert!(tab_a.engine.store.get_task(&temp_id).await.unwrap().is_none());
    assert_eq!(tab_a.engine.store.queue_len().await.unwrap(), 0);
    let reconciled = tab_a.engine.store.get_task("77").await.unwrap().unwrap();
    assert_eq!(reconciled.temp_id.as_deref(), Some(temp_id.as_str()));

    // The sibling tab observed the mapping.
    let mut sibling_saw_mapping = false;
    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    while !sibling_saw_mapping && tokio::time::Instant::now() < deadline {
        match tokio::time::timeout(Duration::from_millis(50), b_notifications.recv()).await {
            Ok(Ok(TaskNotification::TempIdReconciled { real_id, .. })) if real_id == "77" => {
                sibling_saw_mapping = true;
            }
            Ok(Ok(_)) => {}
            _ => {}
        }
    }
    assert!(sibling_saw_mapping, "sibling tab missed the reconciliation");

    // Exactly one id-reconciliation broadcast crossed the bus.
    let mut reconciliation_broadcasts = 0;
    while let Ok(msg) = bus_watch.try_recv() {
        if matches!(msg.kind, TabMessageKind::IdReconciled(_)) {
            reconciliation_broadcasts += 1;
        }
    }
    assert_eq!(reconciliation_broadcasts, 1);

    // The replayed frame carried a session-stable event id.
    let sent = tab_a.channel.sent_frames().await;
    let replayed = sent
        .iter()
        .find(|f| f.event_type == "task_create:manual")
        .expect("create was replayed");
    assert!(replayed.event_id.starts_with("queue_sess_"));
    assert!(replayed.session_id.is_some());
}
