//! Shared runtime state for the agent's HTTP surface.

use std::sync::Arc;

use serde::Serialize;

use tdk_dispatch::DispatchStatsSnapshot;
use tdk_runtime::{BootReport, Engine};
use tdk_sync::{IdleSyncStatsSnapshot, PrefetchStatsSnapshot};

/// Static build metadata included in health / status responses.
#[derive(Clone, Debug, Serialize)]
pub struct BuildInfo {
    pub service: &'static str,
    pub version: &'static str,
}

/// Point-in-time snapshot of the engine, returned by GET /v1/status.
#[derive(Clone, Debug, Serialize)]
pub struct StatusSnapshot {
    pub workspace_id: String,
    pub uptime_secs: u64,
    pub boot: BootReport,
    pub last_sequence: u64,
    pub task_count: i64,
    pub queued_ops: i64,
    pub dispatch: DispatchStatsSnapshot,
    pub idle_sync: IdleSyncStatsSnapshot,
    pub prefetch: PrefetchStatsSnapshot,
    /// Keys whose checksums disagree with the server; pending targeted
    /// resync.
    pub drifted_keys: Vec<String>,
}

/// Cloneable (Arc) handle shared across all Axum handlers.
#[derive(Clone)]
pub struct AppState {
    pub engine: Arc<Engine>,
    pub build: BuildInfo,
}

impl AppState {
    pub fn new(engine: Arc<Engine>) -> Self {
        Self {
            engine,
            build: BuildInfo {
                service: "tdk-agent",
                version: env!("CARGO_PKG_VERSION"),
            },
        }
    }

    pub async fn status(&self) -> anyhow::Result<StatusSnapshot> {
        let engine = &self.engine;
        Ok(StatusSnapshot {
            workspace_id: engine.dispatcher.config().workspace_id.clone(),
            uptime_secs: uptime_secs(),
            boot: engine.boot.clone(),
            last_sequence: engine.dispatcher.last_sequence().await,
            task_count: engine.store.task_count().await?,
            queued_ops: engine.store.queue_len().await?,
            dispatch: engine.dispatcher.stats().snapshot(),
            idle_sync: engine.idle.stats().snapshot(),
            prefetch: engine.prefetch.stats().snapshot(),
            drifted_keys: engine.dispatcher.drifted_keys().await,
        })
    }
}

/// Monotonically increasing uptime since first call (process lifetime).
pub fn uptime_secs() -> u64 {
    static START: std::sync::OnceLock<std::time::Instant> = std::sync::OnceLock::new();
    START
        .get_or_init(std::time::Instant::now)
        .elapsed()
        .as_secs()
}
