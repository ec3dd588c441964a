//! Aborting the prefetch controller mid-flight: no cache writes from the
//! aborted requests, and the aborted counter reflects the in-flight count.

use std::time::Duration;

use tdk_sync::{PrefetchConfig, PrefetchController, PrefetchTarget};
use tdk_testkit::{spawn_fake_api, wait_until};
use tdk_transport::{RestClient, RestConfig};

fn targets() -> [PrefetchTarget; 3] {
    [
        PrefetchTarget::Clusters,
        PrefetchTarget::TranscriptContext {
            task_id: "42".into(),
        },
        PrefetchTarget::LedgerStatus,
    ]
}

#[tokio::test]
async fn scenario_abort_mid_flight_leaves_no_cache_writes() {
    let (api, _server) = spawn_fake_api(Vec::new()).await.unwrap();
    api.set_delay(Duration::from_secs(5)).await;

    let controller = PrefetchController::new(
        PrefetchConfig::default(),
        RestClient::new(RestConfig::new(api.base_url(), "ws1")),
    );

    for target in targets() {
        std::sync::Arc::clone(&controller).request(target, 1).await;
    }
    wait_until!("all three fetches in flight", controller.inflight() == 3);

    controller.abort_all().await;

    wait_until!(
        "aborts to be recorded",
        controller.stats().snapshot().aborted == 3
    );
    let stats = controller.stats().snapshot();
    assert_eq!(stats.completed, 0);
    for target in targets() {
        assert!(controller.get_cached(&target).await.is_none());
    }

    // An abort cancels what was running, not the controller: once the
    // slots drain, a fresh request completes normally.
    wait_until!("worker slots to drain", controller.inflight() == 0);
    api.set_delay(Duration::ZERO).await;
    std::sync::Arc::clone(&controller)
        .request(PrefetchTarget::Clusters, 1)
        .await;
    wait_until!(
        "post-abort fetch to complete",
        controller.stats().snapshot().completed == 1
    );
    assert!(controller.get_cached(&PrefetchTarget::Clusters).await.is_some());
}

#[tokio::test]
async fn scenario_completed_prefetches_hit_the_cache() {
    let (api, _server) = spawn_fake_api(Vec::new()).await.unwrap();

    let controller = PrefetchController::new(
        PrefetchConfig::default(),
        RestClient::new(RestConfig::new(api.base_url(), "ws1")),
    );

    std::sync::Arc::clone(&controller)
        .request(PrefetchTarget::Clusters, 5)
        .await;
    wait_until!(
        "fetch to complete",
        controller.stats().snapshot().completed == 1
    );

    assert!(controller.get_cached(&PrefetchTarget::Clusters).await.is_some());
    let stats = controller.stats().snapshot();
    assert_eq!(stats.hits, 1);
    assert!(stats.hit_rate > 0.0);
}

#[tokio::test]
async fn scenario_reduced_data_preference_disables_prefetch() {
    let (api, _server) = spawn_fake_api(Vec::new()).await.unwrap();

    let controller = PrefetchController::new(
        PrefetchConfig::default(),
        RestClient::new(RestConfig::new(api.base_url(), "ws1")),
    );
    controller.set_enabled(false);

    std::sync::Arc::clone(&controller)
        .request(PrefetchTarget::Clusters, 5)
        .await;
    tokio::time::sleep(Duration::from_millis(100)).await;

    let stats = controller.stats().snapshot();
    assert_eq!(stats.completed, 0);
    assert_eq!(stats.inflight, 0);
}
