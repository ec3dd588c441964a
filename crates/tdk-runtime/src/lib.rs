//! Bootstrap coordinator: builds the object graph, orders initialization,
//! serves the cache-first paint, and owns every background task.
//!
//! No component reaches out to a global — the engine constructs each piece
//! and passes dependencies down. Teardown aborts every task it spawned.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use anyhow::{Context, Result};
use serde::Serialize;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use tdk_bus::TabBus;
use tdk_dispatch::{DispatcherConfig, TaskDispatcher, TaskNotification};
use tdk_queue::{QueueReplayer, ReplayConfig};
use tdk_schemas::{ClientFrame, Task, VectorClock};
use tdk_sequencer::{RecoveryRequest, SequencerState};
use tdk_store::{meta_keys, LocalStore};
use tdk_sync::{
    ActivityTracker, IdleSyncConfig, IdleSyncLoop, PrefetchConfig, PrefetchController,
};
use tdk_transport::{ConnState, RestClient, TaskChannel};

/// Interval of the idempotency guard's background sweep.
const GUARD_CLEANUP_INTERVAL: std::time::Duration = std::time::Duration::from_secs(60);

#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub workspace_id: String,
    /// Minted when empty; prefixes every temp id from this session.
    pub session_id: String,
    /// None opens an in-memory store.
    pub store_path: Option<PathBuf>,
    pub idle: IdleSyncConfig,
    pub replay: ReplayConfig,
    pub prefetch: PrefetchConfig,
    /// Reduced-data preference: prefetch starts disabled.
    pub reduced_data: bool,
}

impl EngineConfig {
    pub fn new(workspace_id: impl Into<String>) -> Self {
        Self {
            workspace_id: workspace_id.into(),
            session_id: String::new(),
            store_path: None,
            idle: IdleSyncConfig::default(),
            replay: ReplayConfig::default(),
            prefetch: PrefetchConfig::default(),
            reduced_data: false,
        }
    }
}

/// Externally-provided collaborators. The engine owns everything else.
pub struct EngineDeps {
    pub channel: Arc<dyn TaskChannel>,
    pub rest: RestClient,
    pub bus: TabBus,
}

/// What bootstrap observed, for logging and the status surface.
#[derive(Debug, Clone, Serialize)]
pub struct BootReport {
    pub cache_paint_ms: u128,
    pub painted_tasks: usize,
    pub resumed_sequence: u64,
    pub queued_ops: i64,
}

pub struct Engine {
    pub dispatcher: Arc<TaskDispatcher>,
    pub store: Arc<LocalStore>,
    pub channel: Arc<dyn TaskChannel>,
    pub bus: TabBus,
    pub idle: Arc<IdleSyncLoop>,
    pub prefetch: Arc<PrefetchController>,
    pub activity: Arc<ActivityTracker>,
    pub replayer: Arc<QueueReplayer>,
    pub boot: BootReport,
    tasks: Vec<JoinHandle<()>>,
}

impl Engine {
    /// Bring the core up:
    /// open store → migrate → load metadata → paint from cache → install
    /// handlers → start the idle loop and background ticks. The transport
    /// connects on its own schedule; the first Online transition triggers
    /// queue replay.
    pub async fn bootstrap(mut cfg: EngineConfig, deps: EngineDeps) -> Result<Engine> {
        if cfg.session_id.is_empty() {
            cfg.session_id = format!("sess_{}", Uuid::new_v4().simple());
        }

        // 1. Open + migrate the store.
        let store = Arc::new(match &cfg.store_path {
            Some(path) => LocalStore::open(path).await?,
            None => LocalStore::open_in_memory().await?,
        });

        // 2. Resume sequencer state from persisted watermarks.
        let last_event_id = store.get_metadata(meta_keys::LAST_EVENT_ID).await?;
        let last_sequence = store.last_sequence().await?;
        let clock = store
            .get_metadata("vector_clock")
            .await?
            .and_then(|v| serde_json::from_str::<VectorClock>(&v).ok())
            .unwrap_or_default();
        let seq_state = SequencerState::resume(last_event_id, last_sequence, clock);

        // 3. Cache-first paint: the UI reads this before any network round
        // trip. Target is well under 200 ms on a warm store. Unreadable
        // records trigger the emergency-cleanup path (bounded removals, then
        // a full resync once handlers are live).
        let paint_started = Instant::now();
        let (painted, needs_emergency_resync) = match store.all_tasks(chrono::Utc::now()).await {
            Ok(tasks) => (tasks, false),
            Err(e) => {
                warn!(error = %e, "cache paint failed; running emergency cleanup");
                let removed = store.emergency_cleanup(64).await?;
                warn!(removed, "emergency cleanup removed unreadable records");
                (Vec::new(), true)
            }
        };
        let cache_paint_ms = paint_started.elapsed().as_millis();
        info!(
            tasks = painted.len(),
            elapsed_ms = cache_paint_ms,
            "cache-first paint served"
        );

        // 4. Dispatcher over the shared bus and channel.
        let dispatcher_cfg = DispatcherConfig::new(cfg.workspace_id.clone(), cfg.session_id.clone());
        let dispatcher = Arc::new(TaskDispatcher::new(
            dispatcher_cfg,
            Arc::clone(&store),
            Arc::clone(&deps.channel),
            deps.bus.clone(),
            seq_state,
        ));

        // 5. Background components.
        let activity = Arc::new(ActivityTracker::new());
        let idle = IdleSyncLoop::new(
            cfg.idle.clone(),
            deps.rest.clone(),
            Arc::clone(&store),
            Arc::clone(&activity),
        );
        let prefetch = PrefetchController::new(cfg.prefetch.clone(), deps.rest.clone());
        if cfg.reduced_data {
            prefetch.set_enabled(false);
        }
        let replayer = Arc::new(QueueReplayer::new(cfg.replay.clone()));

        let boot = BootReport {
            cache_paint_ms,
            painted_tasks: painted.len(),
            resumed_sequence: last_sequence,
            queued_ops: store.queue_len().await?,
        };

        // 6. Handler loops.
        let mut tasks = Vec::new();
        tasks.push(spawn_incoming_loop(Arc::clone(&dispatcher), Arc::clone(&deps.channel)));
        tasks.push(spawn_tab_loop(Arc::clone(&dispatcher), &deps.bus));
        tasks.push(spawn_conn_loop(
            Arc::clone(&dispatcher),
            Arc::clone(&deps.channel),
            Arc::clone(&replayer),
            Arc::clone(&idle),
        ));
        tasks.push(spawn_control_loop(
            Arc::clone(&dispatcher),
            Arc::clone(&deps.channel),
            deps.rest.clone(),
            Arc::clone(&replayer),
        ));
        tasks.push(tokio::spawn({
            let dispatcher = Arc::clone(&dispatcher);
            async move {
                let mut tick = tokio::time::interval(GUARD_CLEANUP_INTERVAL);
                loop {
                    tick.tick().await;
                    dispatcher.cleanup_guard().await;
                }
            }
        }));

        // 7. Idle loop last, once handlers are live.
        tasks.push(tokio::spawn(Arc::clone(&idle).run()));

        if needs_emergency_resync {
            let _ = dispatcher.notifier().send(TaskNotification::ResyncRequested {
                recovery: RecoveryRequest::FullResync,
            });
        }

        Ok(Engine {
            dispatcher,
            store,
            channel: deps.channel,
            bus: deps.bus,
            idle,
            prefetch,
            activity,
            replayer,
            boot,
            tasks,
        })
    }

    /// The cache-first read: every live task, newest first.
    pub async fn painted_tasks(&self) -> Result<Vec<Task>> {
        self.store.all_tasks(chrono::Utc::now()).await
    }

    /// Signal a tab-visibility gain or explicit user refresh.
    pub fn on_visibility_gained(&self) {
        self.idle.force_sync();
    }

    /// Tear down every background task this engine owns.
    pub fn shutdown(&self) {
        for task in &self.tasks {
            task.abort();
        }
        info!("engine shut down");
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        for task in &self.tasks {
            task.abort();
        }
    }
}

fn spawn_incoming_loop(
    dispatcher: Arc<TaskDispatcher>,
    channel: Arc<dyn TaskChannel>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut incoming = channel.incoming();
        loop {
            match incoming.recv().await {
                Ok(frame) => {
                    if let Err(e) = dispatcher.handle_server_frame(frame).await {
                        warn!(error = %e, "server frame handling failed");
                    }
                }
                Err(tokio::sync::broadcast::error::RecvError::Lagged(missed)) => {
                    warn!(missed, "incoming frame stream lagged; requesting resync");
                    let _ = dispatcher.notifier().send(TaskNotification::ResyncRequested {
                        recovery: RecoveryRequest::FullResync,
                    });
                }
                Err(tokio::sync::broadcast::error::RecvError::Closed) => return,
            }
        }
    })
}

fn spawn_tab_loop(dispatcher: Arc<TaskDispatcher>, bus: &TabBus) -> JoinHandle<()> {
    let mut rx = bus.subscribe();
    tokio::spawn(async move {
        loop {
            match rx.recv().await {
                Ok(msg) => {
                    if let Err(e) = dispatcher.handle_tab_message(msg).await {
                        warn!(error = %e, "tab message handling failed");
                    }
                }
                Err(tokio::sync::broadcast::error::RecvError::Lagged(missed)) => {
                    debug!(missed, "tab bus lagged");
                }
                Err(tokio::sync::broadcast::error::RecvError::Closed) => return,
            }
        }
    })
}

/// Watch connectivity; every Offline→Online transition replays the queue
/// and forces an idle sync.
fn spawn_conn_loop(
    dispatcher: Arc<TaskDispatcher>,
    channel: Arc<dyn TaskChannel>,
    replayer: Arc<QueueReplayer>,
    idle: Arc<IdleSyncLoop>,
) -> JoinHandle<()> {
    let mut state_rx = channel.conn_state();
    tokio::spawn(async move {
        let mut prev = *state_rx.borrow();
        // The transport may have connected before this loop started.
        if prev == ConnState::Online {
            replay_with_backoff(&dispatcher, &channel, &replayer).await;
        }
        while state_rx.changed().await.is_ok() {
            let now = *state_rx.borrow();
            if prev == ConnState::Offline && now == ConnState::Online {
                info!("transport online; replaying offline queue");
                replay_with_backoff(&dispatcher, &channel, &replayer).await;
                idle.force_sync();
            }
            prev = now;
        }
    })
}

/// React to dispatcher control notifications: gap recovery, refresh, manual
/// replay.
fn spawn_control_loop(
    dispatcher: Arc<TaskDispatcher>,
    channel: Arc<dyn TaskChannel>,
    rest: RestClient,
    replayer: Arc<QueueReplayer>,
) -> JoinHandle<()> {
    let mut rx = dispatcher.subscribe();
    tokio::spawn(async move {
        loop {
            let notification = match rx.recv().await {
                Ok(n) => n,
                Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => continue,
                Err(tokio::sync::broadcast::error::RecvError::Closed) => return,
            };

            match notification {
                TaskNotification::ResyncRequested { recovery } => match recovery {
                    RecoveryRequest::Bootstrap => {
                        request_bootstrap(&dispatcher, &channel).await;
                    }
                    RecoveryRequest::FullResync => {
                        full_resync(&dispatcher, &rest).await;
                    }
                },
                TaskNotification::RefreshRequested => {
                    full_resync(&dispatcher, &rest).await;
                }
                TaskNotification::ReplayRequested => {
                    replay_with_backoff(&dispatcher, &channel, &replayer).await;
                }
                TaskNotification::IdleSyncRequested => {
                    // The idle loop owns its own schedule; a notification
                    // here came from a `tasks_idle_sync` control intent.
                }
                _ => {}
            }
        }
    })
}

/// Ask the server for a lightweight bootstrap window. The answer arrives as
/// a pushed `bootstrap_response` frame; both request and application are
/// idempotent.
async fn request_bootstrap(dispatcher: &Arc<TaskDispatcher>, channel: &Arc<dyn TaskChannel>) {
    let cfg = dispatcher.config();
    let frame = ClientFrame {
        namespace: "tasks".into(),
        event_id: format!("boot_{}", Uuid::new_v4().simple()),
        event_type: "tasks_bootstrap".into(),
        workspace_id: cfg.workspace_id.clone(),
        vector_clock: VectorClock::new(),
        checksum: None,
        session_id: Some(cfg.session_id.clone()),
        payload: serde_json::json!({
            "since_sequence": dispatcher.last_sequence().await,
        }),
    };
    if let Err(e) = channel.request(frame).await {
        debug!(error = %e, "bootstrap request failed; will retry on next gap");
    }
}

/// Full authoritative reconciliation over REST. A response that carries the
/// server's event watermark advances the sequencer directly; one without a
/// watermark resets the sequencer to re-anchor on the next pushed event —
/// either way the gap that requested this resync is cleared.
async fn full_resync(dispatcher: &Arc<TaskDispatcher>, rest: &RestClient) {
    match rest.fetch_tasks().await {
        Ok(resync) => {
            let applied = match resync.last_sequence {
                Some(watermark) => {
                    dispatcher
                        .apply_bootstrap(resync.tasks, resync.last_event_id, watermark)
                        .await
                }
                None => dispatcher.apply_resync_reset(resync.tasks).await,
            };
            if let Err(e) = applied.context("full resync apply failed") {
                warn!(error = %e, "full resync failed");
            }
        }
        Err(e) => warn!(error = %e, "full resync fetch failed"),
    }
}

async fn replay_with_backoff(
    dispatcher: &Arc<TaskDispatcher>,
    channel: &Arc<dyn TaskChannel>,
    replayer: &Arc<QueueReplayer>,
) {
    let mut failures = 0u32;
    loop {
        match replayer.replay(dispatcher, channel).await {
            Ok(report) if report.stopped_transient => {
                failures += 1;
                let delay = replayer.backoff_delay(failures);
                debug!(failures, ?delay, "replay paused on transient error");
                tokio::time::sleep(delay).await;
            }
            Ok(_) => return,
            Err(e) => {
                warn!(error = %e, "queue replay aborted");
                return;
            }
        }
    }
}
