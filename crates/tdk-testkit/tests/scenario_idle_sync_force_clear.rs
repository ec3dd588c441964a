//! Guarded force-clear: an explicit authoritative empty set clears stale
//! cache entries; a transport failure never does.

use std::sync::Arc;

use tdk_store::LocalStore;
use tdk_sync::{ActivityTracker, IdleSyncConfig, IdleSyncLoop};
use tdk_testkit::{mk_task, spawn_fake_api};
use tdk_transport::{RestClient, RestConfig};

#[tokio::test]
async fn scenario_authoritative_empty_set_clears_stale_entries() {
    let store = Arc::new(LocalStore::open_in_memory().await.unwrap());
    store
        .save_tasks(&[mk_task("a", "stale one"), mk_task("b", "stale two")])
        .await
        .unwrap();
    store.set_last_sequence(5).await.unwrap();

    let (api, _server) = spawn_fake_api(Vec::new()).await.unwrap();
    let idle = IdleSyncLoop::new(
        IdleSyncConfig::default(),
        RestClient::new(RestConfig::new(api.base_url(), "ws1")),
        Arc::clone(&store),
        Arc::new(ActivityTracker::new()),
    );

    let applied = idle.sync_once().await.unwrap();
    assert_eq!(applied, 0);

    // Both stale records are gone and the counter reflects it.
    assert_eq!(store.task_count().await.unwrap(), 0);
    assert_eq!(idle.stats().snapshot().cleared_tasks, 2);

    // No sequence regression was involved: the watermark is untouched.
    assert_eq!(store.last_sequence().await.unwrap(), 5);
}

#[tokio::test]
async fn scenario_transport_failure_never_clears_the_cache() {
    let store = Arc::new(LocalStore::open_in_memory().await.unwrap());
    store.save_tasks(&[mk_task("a", "kept")]).await.unwrap();

    // Nothing listens on this port; the fetch fails before any clear.
    let idle = IdleSyncLoop::new(
        IdleSyncConfig::default(),
        RestClient::new(RestConfig::new("http://127.0.0.1:9", "ws1")),
        Arc::clone(&store),
        Arc::new(ActivityTracker::new()),
    );

    assert!(idle.sync_once().await.is_err());
    assert_eq!(store.task_count().await.unwrap(), 1);
    assert_eq!(idle.stats().snapshot().cleared_tasks, 0);
    assert_eq!(idle.stats().snapshot().failures, 0); // failures counted by the loop, not the pass
}

#[tokio::test]
async fn scenario_nonempty_resync_merges_server_authoritatively() {
    let store = Arc::new(LocalStore::open_in_memory().await.unwrap());
    let mut local = mk_task("a", "local title");
    local.labels = vec!["kept".into()];
    store.save_task(&local).await.unwrap();

    let mut server = mk_task("a", "server title");
    server.sequence_num = 9;
    let (api, _server_task) = spawn_fake_api(vec![server]).await.unwrap();

    let idle = IdleSyncLoop::new(
        IdleSyncConfig::default(),
        RestClient::new(RestConfig::new(api.base_url(), "ws1")),
        Arc::clone(&store),
        Arc::new(ActivityTracker::new()),
    );

    let applied = idle.sync_once().await.unwrap();
    assert_eq!(applied, 1);

    let merged = store.get_task("a").await.unwrap().unwrap();
    assert_eq!(merged.title, "server title");
}
