//! Engine builders and assertion helpers for multi-tab scenarios.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use chrono::{DateTime, TimeZone, Utc};

use tdk_bus::TabBus;
use tdk_runtime::{Engine, EngineConfig, EngineDeps};
use tdk_schemas::{
    Actor, SequencedEvent, ServerFrame, Task, TaskEventKind, VectorClock,
};
use tdk_sync::IdleSyncConfig;
use tdk_transport::{RestClient, RestConfig};

use crate::channel::InMemoryChannel;

/// One simulated browser tab: an engine wired to its own scriptable channel,
/// sharing the given bus with its siblings.
pub struct TestTab {
    pub engine: Engine,
    pub channel: Arc<InMemoryChannel>,
}

/// Fixed test epoch so scenarios are reproducible.
pub fn test_epoch() -> DateTime<Utc> {
    Utc.timestamp_opt(1_700_000_000, 0).unwrap()
}

pub fn mk_task(id: &str, title: &str) -> Task {
    Task::new(id, "ws1", title, test_epoch())
}

/// A sequenced server event wrapping the given kind.
pub fn mk_event(seq: u64, kind: TaskEventKind) -> ServerFrame {
    let (event_type, payload) = kind.to_wire_payload();
    ServerFrame::Event(SequencedEvent {
        event_id: format!("ev-{seq}"),
        workspace_id: "ws1".into(),
        sequence_num: seq,
        vector_clock: [(Actor::Server, seq)].into_iter().collect::<VectorClock>(),
        checksum: None,
        timestamp: test_epoch() + chrono::Duration::seconds(seq as i64),
        actor: Actor::Server,
        event_type,
        payload,
    })
}

/// Boot an engine against a fresh in-memory store and channel. The idle
/// loop is slowed to an hour so scenarios own their timing; `api_url` may
/// point at a [`crate::FakeApi`] when the REST path matters.
pub async fn spawn_tab(bus: TabBus, api_url: Option<String>) -> Result<TestTab> {
    let channel = InMemoryChannel::new();

    let mut cfg = EngineConfig::new("ws1");
    cfg.idle = IdleSyncConfig {
        base_interval: Duration::from_secs(3600),
        ..IdleSyncConfig::default()
    };

    let rest = RestClient::new(RestConfig::new(
        api_url.unwrap_or_else(|| "http://127.0.0.1:9".into()),
        "ws1",
    ));

    let engine = Engine::bootstrap(
        cfg,
        EngineDeps {
            channel: channel.clone() as Arc<dyn tdk_transport::TaskChannel>,
            rest,
            bus,
        },
    )
    .await?;

    Ok(TestTab { engine, channel })
}

/// Poll a condition until it passes or the 2 s budget runs out. The
/// condition is an expression re-evaluated each iteration and may `.await`.
#[macro_export]
macro_rules! wait_until {
    ($what:expr, $cond:expr) => {{
        let deadline = tokio::time::Instant::now() + std::time::Duration::from_secs(2);
        loop {
            if $cond {
                break;
            }
            if tokio::time::Instant::now() > deadline {
                panic!("timed out waiting for: {}", $what);
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
    }};
}
