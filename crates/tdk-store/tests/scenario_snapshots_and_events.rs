use chrono::{Duration, TimeZone, Utc};
use serde_json::json;
use tdk_schemas::{
    Actor, AnalyticsSnapshot, SnapshotChecksums, TaskEvent, TaskEventKind, VectorClock,
};
use tdk_store::{LocalStore, SNAPSHOT_TTL_MS};

fn t0() -> chrono::DateTime<Utc> {
    Utc.timestamp_opt(1_700_000_000, 0).unwrap()
}

fn mk_snapshot(key: &str, at: chrono::DateTime<Utc>) -> AnalyticsSnapshot {
    let payload = json!({"totals": {"open": 4, "done": 9}});
    AnalyticsSnapshot {
        cache_key: key.into(),
        workspace_id: "ws1".into(),
        days: 7,
        timestamp: at,
        checksums: SnapshotChecksums {
            full: tdk_checksum::checksum(&payload),
            sections: Default::default(),
        },
        payload,
        last_event_id: Some("ev-12".into()),
    }
}

#[tokio::test]
async fn scenario_snapshot_ttl_and_event_driven_invalidation() {
    let store = LocalStore::open_in_memory().await.unwrap();
    let key = AnalyticsSnapshot::cache_key_for("ws1", 7);
    store.save_snapshot(&mk_snapshot(&key, t0())).await.unwrap();

    // Fresh inside the TTL, stale past it.
    assert!(store.get_fresh_snapshot(&key, t0()).await.unwrap().is_some());
    let later = t0() + Duration::milliseconds(SNAPSHOT_TTL_MS + 1);
    assert!(store.get_fresh_snapshot(&key, later).await.unwrap().is_none());

    // Event-driven invalidation beats the TTL: deltas for the workspace
    // drop its snapshots immediately.
    store.save_snapshot(&mk_snapshot(&key, t0())).await.unwrap();
    let removed = store.invalidate_snapshots("ws1").await.unwrap();
    assert_eq!(removed, 1);
    assert!(store.get_snapshot(&key).await.unwrap().is_none());
}

#[tokio::test]
async fn scenario_corrupt_snapshot_is_dropped_on_read() {
    let store = LocalStore::open_in_memory().await.unwrap();
    let key = AnalyticsSnapshot::cache_key_for("ws1", 30);

    let mut snap = mk_snapshot(&key, t0());
    snap.checksums.full = "not-the-real-hash".into();
    store.save_snapshot(&snap).await.unwrap();

    assert!(store.get_fresh_snapshot(&key, t0()).await.unwrap().is_none());
    // The poisoned entry is gone entirely.
    assert!(store.get_snapshot(&key).await.unwrap().is_none());
}

#[tokio::test]
async fn scenario_event_history_is_bounded_and_deduplicated() {
    let store = LocalStore::open_in_memory().await.unwrap();

    let mk_event = |seq: u64| TaskEvent {
        event_id: format!("ev-{seq}"),
        workspace_id: "ws1".into(),
        sequence_num: seq,
        vector_clock: VectorClock::new(),
        checksum: None,
        timestamp: t0(),
        actor: Actor::Server,
        kind: TaskEventKind::Refresh {},
    };

    store.save_event(&mk_event(1)).await.unwrap();
    store.save_event(&mk_event(1)).await.unwrap(); // same id, no-op
    assert!(store.has_event("ev-1").await.unwrap());
    assert!(!store.has_event("ev-2").await.unwrap());
}
