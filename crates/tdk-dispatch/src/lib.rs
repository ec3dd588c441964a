//! The event dispatcher: every mutation in the system flows through here.
//!
//! Inbound server frames are sequenced (tdk-sequencer), applied to the store
//! (tdk-store, via tdk-merge where two full records meet), then announced on
//! the notification bus and relayed to sibling tabs. Outbound intents pass
//! the idempotency guard, get stamped with the local vector clock, apply
//! optimistically, and are either sent on the channel or parked in the
//! offline queue.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use chrono::Utc;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::{broadcast, Mutex};
use tracing::{debug, info, warn};
use uuid::Uuid;

use tdk_bus::{TabBus, TabMessage, TabMessageKind};
use tdk_checksum::ChecksumRegistry;
use tdk_idempotency::IdempotencyGuard;
use tdk_merge::MergeStrategy;
use tdk_schemas::{
    Actor, ClientFrame, QueuedOperation, ReconciliationRecord, SequencedEvent, ServerFrame, Task,
    TaskEvent, TaskEventKind, VectorClock,
};
use tdk_sequencer::{
    admit_snapshot, reset_for_realign, validate_and_order, RecoveryRequest, SequenceOutcome,
    SequencerConfig, SequencerState,
};
use tdk_store::{meta_keys, LocalStore};
use tdk_transport::{TaskChannel, TransportError};

mod apply;

pub use apply::AppliedChange;

/// Wall-clock closure type shared by the embedded guard.
type Clock = Box<dyn Fn() -> i64 + Send + Sync>;

#[derive(Debug, Clone)]
pub struct DispatcherConfig {
    pub workspace_id: String,
    pub session_id: String,
    pub tab_id: String,
    /// Writer class stamped on locally-minted intents.
    pub local_actor: Actor,
    pub default_strategy: MergeStrategy,
    pub sequencer: SequencerConfig,
}

impl DispatcherConfig {
    pub fn new(workspace_id: impl Into<String>, session_id: impl Into<String>) -> Self {
        Self {
            workspace_id: workspace_id.into(),
            session_id: session_id.into(),
            tab_id: TabBus::mint_tab_id(),
            local_actor: Actor::User,
            default_strategy: MergeStrategy::ServerAuthoritative,
            sequencer: SequencerConfig::default(),
        }
    }
}

/// Domain notifications fanned out to the UI layer, the runtime, and the
/// agent's SSE surface.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TaskNotification {
    TaskCreated { task: Task },
    TaskUpdated { task: Task },
    TaskDeleted { task_id: String },
    TaskMerged { source_id: String, target_id: String },
    TempIdReconciled { temp_id: String, real_id: String },
    /// Side-effect of `task_link:jump_to_span`; carries provenance for the
    /// consumer to scroll to.
    NavigateToSpan { task_id: String },
    ViewStateChanged { filter: Value },
    BootstrapApplied { count: usize },
    ChannelSubscribed,
    /// The sequencer needs the coordinator to fetch: light bootstrap or full
    /// reconciliation.
    ResyncRequested { recovery: RecoveryRequest },
    RefreshRequested,
    IdleSyncRequested,
    ReplayRequested,
    /// An operation exhausted its attempts; the carried operation can be
    /// resubmitted by the user.
    OperationFailed {
        task_id: String,
        action: String,
        error: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        operation: Option<QueuedOperation>,
    },
}

/// Where an outbound intent ended up.
#[derive(Debug, Clone, PartialEq)]
pub enum SubmitOutcome {
    /// Applied locally and delivered to the server.
    Sent,
    /// Applied locally and parked in the offline queue.
    Queued { queue_id: i64 },
    /// Local-only intent (navigation, view state, control): applied, nothing
    /// to deliver.
    Applied,
    /// Suppressed as a rapid duplicate (double-click guard).
    SuppressedDuplicate,
}

/// Telemetry counters. Plain atomics; snapshot for the status surface.
#[derive(Debug, Default)]
pub struct DispatchStats {
    pub accepted: AtomicU64,
    pub duplicates: AtomicU64,
    pub regressions: AtomicU64,
    pub gaps: AtomicU64,
    pub checksum_mismatches: AtomicU64,
    pub unknown_events: AtomicU64,
    pub intents_sent: AtomicU64,
    pub intents_queued: AtomicU64,
    pub intents_suppressed: AtomicU64,
}

#[derive(Debug, Clone, Serialize)]
pub struct DispatchStatsSnapshot {
    pub accepted: u64,
    pub duplicates: u64,
    pub regressions: u64,
    pub gaps: u64,
    pub checksum_mismatches: u64,
    pub unknown_events: u64,
    pub intents_sent: u64,
    pub intents_queued: u64,
    pub intents_suppressed: u64,
}

impl DispatchStats {
    pub fn snapshot(&self) -> DispatchStatsSnapshot {
        DispatchStatsSnapshot {
            accepted: self.accepted.load(Ordering::Relaxed),
            duplicates: self.duplicates.load(Ordering::Relaxed),
            regressions: self.regressions.load(Ordering::Relaxed),
            gaps: self.gaps.load(Ordering::Relaxed),
            checksum_mismatches: self.checksum_mismatches.load(Ordering::Relaxed),
            unknown_events: self.unknown_events.load(Ordering::Relaxed),
            intents_sent: self.intents_sent.load(Ordering::Relaxed),
            intents_queued: self.intents_queued.load(Ordering::Relaxed),
            intents_suppressed: self.intents_suppressed.load(Ordering::Relaxed),
        }
    }
}

pub struct TaskDispatcher {
    cfg: DispatcherConfig,
    store: Arc<LocalStore>,
    channel: Arc<dyn TaskChannel>,
    bus: TabBus,
    seq: Mutex<SequencerState>,
    guard: Mutex<IdempotencyGuard<Clock>>,
    checksums: Mutex<ChecksumRegistry<Clock>>,
    notifications: broadcast::Sender<TaskNotification>,
    stats: DispatchStats,
    temp_counter: AtomicU64,
}

impl TaskDispatcher {
    pub fn new(
        cfg: DispatcherConfig,
        store: Arc<LocalStore>,
        channel: Arc<dyn TaskChannel>,
        bus: TabBus,
        seq: SequencerState,
    ) -> Self {
        let (notifications, _) = broadcast::channel(256);
        let guard_clock: Clock = Box::new(|| Utc::now().timestamp_millis());
        let registry_clock: Clock = Box::new(|| Utc::now().timestamp_millis());
        Self {
            cfg,
            store,
            channel,
            bus,
            seq: Mutex::new(seq),
            guard: Mutex::new(IdempotencyGuard::new(guard_clock)),
            checksums: Mutex::new(ChecksumRegistry::new(registry_clock)),
            notifications,
            stats: DispatchStats::default(),
            temp_counter: AtomicU64::new(0),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<TaskNotification> {
        self.notifications.subscribe()
    }

    pub fn notifier(&self) -> broadcast::Sender<TaskNotification> {
        self.notifications.clone()
    }

    pub fn stats(&self) -> &DispatchStats {
        &self.stats
    }

    pub fn store(&self) -> &Arc<LocalStore> {
        &self.store
    }

    pub fn config(&self) -> &DispatcherConfig {
        &self.cfg
    }

    pub async fn last_sequence(&self) -> u64 {
        self.seq.lock().await.last_sequence
    }

    /// Run the guard's TTL sweep. Driven by the runtime's 60 s tick.
    pub async fn cleanup_guard(&self) {
        self.guard.lock().await.cleanup();
    }

    fn notify(&self, n: TaskNotification) {
        let _ = self.notifications.send(n);
    }

    fn mint_temp_id(&self) -> String {
        let n = self.temp_counter.fetch_add(1, Ordering::Relaxed) + 1;
        format!("tmp_{}_{n}", self.cfg.session_id)
    }

    // =======================================================================
    // Inbound: server frames
    // =======================================================================

    pub async fn handle_server_frame(&self, frame: ServerFrame) -> Result<()> {
        match frame {
            ServerFrame::Event(raw) => self.handle_sequenced_event(raw).await,
            ServerFrame::BootstrapResponse {
                tasks,
                users,
                last_event_id,
                last_sequence,
            } => {
                self.apply_bootstrap(tasks, last_event_id, last_sequence)
                    .await?;
                if !users.is_empty() {
                    let encoded = serde_json::to_string(&users)?;
                    self.store
                        .set_metadata(meta_keys::USERS_MAP, &encoded)
                        .await?;
                }
                Ok(())
            }
            ServerFrame::IdReconciled(record) => self.apply_reconciliation(&record).await,
            ServerFrame::PendingReconciliations { records } => {
                for record in records {
                    self.apply_reconciliation(&record).await?;
                }
                Ok(())
            }
            ServerFrame::IdleSyncComplete {
                workspace_id,
                task_count,
            } => {
                debug!(%workspace_id, task_count, "idle sync acknowledged by server");
                Ok(())
            }
            ServerFrame::OfflineQueueReplayed { applied } => {
                debug!(applied, "server confirmed offline queue replay");
                Ok(())
            }
            ServerFrame::TasksBulkUpdated { task_ids } => {
                debug!(count = task_ids.len(), "bulk update confirmed");
                Ok(())
            }
            ServerFrame::Ack { event_id, .. } => {
                // Correlated acks are consumed by the channel; an orphan here
                // means the request already timed out locally.
                debug!(%event_id, "uncorrelated ack");
                Ok(())
            }
            ServerFrame::Error {
                event_id,
                code,
                message,
                ..
            } => {
                warn!(?event_id, code, %message, "server error frame");
                Ok(())
            }
        }
    }

    async fn handle_sequenced_event(&self, raw: SequencedEvent) -> Result<()> {
        let event = match TaskEvent::from_wire(raw) {
            Ok(ev) => ev,
            Err(tdk_schemas::EventParseError::UnknownType(t)) => {
                self.stats.unknown_events.fetch_add(1, Ordering::Relaxed);
                debug!(event_type = %t, "ignoring unknown event type");
                return Ok(());
            }
            Err(e) => {
                self.stats.unknown_events.fetch_add(1, Ordering::Relaxed);
                warn!(error = %e, "dropping malformed event");
                return Ok(());
            }
        };

        if event.workspace_id != self.cfg.workspace_id {
            debug!(workspace = %event.workspace_id, "event for foreign workspace ignored");
            return Ok(());
        }

        // Bootstrap snapshots reset the watermark rather than extending it.
        if let TaskEventKind::Bootstrap {
            tasks,
            last_event_id,
            last_sequence,
        } = event.kind.clone()
        {
            let watermark = last_sequence.unwrap_or(event.sequence_num);
            return self.apply_bootstrap(tasks, last_event_id, watermark).await;
        }

        let outcome = {
            let mut seq = self.seq.lock().await;
            validate_and_order(&self.cfg.sequencer, &mut seq, event)
        };

        match outcome {
            SequenceOutcome::Accepted { ready } => {
                for ev in ready {
                    self.stats.accepted.fetch_add(1, Ordering::Relaxed);
                    self.store.save_event(&ev).await?;
                    self.record_event_checksum(&ev).await?;
                    let change = apply::apply_event(self, &ev).await?;
                    self.announce(&ev.event_id, ev.sequence_num, change).await;
                }
                self.persist_watermarks().await?;
            }
            SequenceOutcome::Duplicate => {
                self.stats.duplicates.fetch_add(1, Ordering::Relaxed);
            }
            SequenceOutcome::TooOld { last_sequence } => {
                self.stats.regressions.fetch_add(1, Ordering::Relaxed);
                debug!(last_sequence, "regression blocked");
            }
            SequenceOutcome::ChecksumMismatch { declared, computed } => {
                self.stats
                    .checksum_mismatches
                    .fetch_add(1, Ordering::Relaxed);
                warn!(%declared, %computed, "event checksum drift; requesting targeted resync");
                self.notify(TaskNotification::ResyncRequested {
                    recovery: RecoveryRequest::Bootstrap,
                });
            }
            SequenceOutcome::GapBuffered {
                missing_from,
                missing_to,
                recovery,
            } => {
                self.stats.gaps.fetch_add(1, Ordering::Relaxed);
                info!(missing_from, missing_to, ?recovery, "forward gap buffered");
                self.notify(TaskNotification::ResyncRequested { recovery });
            }
        }

        Ok(())
    }

    /// Replace/merge the store with a server snapshot and advance the
    /// watermark. Idempotent: re-applying the same snapshot is a no-op.
    pub async fn apply_bootstrap(
        &self,
        tasks: Vec<Task>,
        last_event_id: Option<String>,
        last_sequence: u64,
    ) -> Result<()> {
        let count = self.adopt_snapshot_tasks(tasks).await?;

        let ready = {
            let mut seq = self.seq.lock().await;
            admit_snapshot(&self.cfg.sequencer, &mut seq, last_event_id, last_sequence)
        };
        for ev in ready {
            self.stats.accepted.fetch_add(1, Ordering::Relaxed);
            self.store.save_event(&ev).await?;
            let change = apply::apply_event(self, &ev).await?;
            self.announce(&ev.event_id, ev.sequence_num, change).await;
        }

        self.persist_watermarks().await?;
        self.store
            .invalidate_snapshots(&self.cfg.workspace_id)
            .await?;
        self.notify(TaskNotification::BootstrapApplied { count });
        Ok(())
    }

    /// Full reconciliation fallback for authoritative fetches that carry no
    /// sequence watermark. The snapshot is adopted server-authoritatively,
    /// the out-of-order buffer is dropped (the snapshot supersedes it), and
    /// the next forward event on the channel re-anchors the watermark — so
    /// a gap wider than the light-bootstrap threshold cannot wedge the
    /// sequencer in a buffer/resync loop.
    pub async fn apply_resync_reset(&self, tasks: Vec<Task>) -> Result<()> {
        let count = self.adopt_snapshot_tasks(tasks).await?;

        {
            let mut seq = self.seq.lock().await;
            reset_for_realign(&mut seq);
        }

        self.persist_watermarks().await?;
        self.store
            .invalidate_snapshots(&self.cfg.workspace_id)
            .await?;
        self.notify(TaskNotification::BootstrapApplied { count });
        Ok(())
    }

    /// Merge a server snapshot into the store, record by record, server
    /// winning every conflict. Returns the batch size.
    pub(crate) async fn adopt_snapshot_tasks(&self, tasks: Vec<Task>) -> Result<usize> {
        let mut batch = Vec::with_capacity(tasks.len());
        for remote in tasks {
            let merged = match self.store.get_task(&remote.id).await? {
                Some(local) => {
                    tdk_merge::merge_tasks(&local, &remote, MergeStrategy::ServerAuthoritative)
                        .merged
                }
                None => remote,
            };
            batch.push(merged);
        }
        self.store.save_tasks(&batch).await?;
        Ok(batch.len())
    }

    /// Authoritative temp→real rewrite, deduplicated so the ack path and the
    /// broadcast path cannot apply the same mapping twice.
    pub async fn apply_reconciliation(&self, record: &ReconciliationRecord) -> Result<()> {
        self.apply_reconciliation_inner(record, true).await
    }

    /// `broadcast` is false when the mapping arrived over the tab bus — the
    /// originating tab already told everyone, so relaying it again would
    /// multiply the broadcast.
    async fn apply_reconciliation_inner(
        &self,
        record: &ReconciliationRecord,
        broadcast: bool,
    ) -> Result<()> {
        let dedupe_key = format!("recon:{}:{}", record.temp_id, record.real_id);
        {
            let mut guard = self.guard.lock().await;
            if guard.check(&dedupe_key).is_some() {
                return Ok(());
            }
            guard.record(dedupe_key.clone(), Value::Null);
        }

        let outcome = self
            .store
            .reconcile_temp_id(&record.temp_id, &record.real_id)
            .await?;
        debug!(
            temp = %record.temp_id,
            real = %record.real_id,
            applied = outcome.applied,
            retargeted = outcome.retargeted_ops,
            "temp id reconciled"
        );

        if broadcast {
            self.bus.publish(TabMessage {
                tab_id: self.cfg.tab_id.clone(),
                event_id: dedupe_key,
                workspace_id: record.workspace_id.clone(),
                kind: TabMessageKind::IdReconciled(record.clone()),
            });
        }
        self.notify(TaskNotification::TempIdReconciled {
            temp_id: record.temp_id.clone(),
            real_id: record.real_id.clone(),
        });
        Ok(())
    }

    /// Remember the hash of the latest applied event per workspace so drift
    /// checks can answer from memory (`quick_check`) instead of rehashing.
    async fn record_event_checksum(&self, event: &TaskEvent) -> Result<()> {
        let Some(declared) = event.checksum.as_deref() else {
            return Ok(());
        };
        let (_, payload) = event.kind.to_wire_payload();
        let key = format!("events:{}", event.workspace_id);
        let outcome = self
            .checksums
            .lock()
            .await
            .validate(&key, &payload, Some(declared));
        self.store
            .set_metadata(meta_keys::LAST_CHECKSUM, &outcome.computed)
            .await?;
        Ok(())
    }

    /// Keys whose checksums drifted from the server's; the coordinator
    /// resyncs these specifically.
    pub async fn drifted_keys(&self) -> Vec<String> {
        self.checksums.lock().await.drifted_keys()
    }

    async fn persist_watermarks(&self) -> Result<()> {
        let (last_event_id, last_sequence, clock) = {
            let seq = self.seq.lock().await;
            (
                seq.last_event_id.clone(),
                seq.last_sequence,
                seq.clock.clone(),
            )
        };
        if let Some(id) = last_event_id {
            self.store.set_metadata(meta_keys::LAST_EVENT_ID, &id).await?;
        }
        self.store.set_last_sequence(last_sequence).await?;
        self.store
            .set_metadata("vector_clock", &serde_json::to_string(&clock)?)
            .await?;
        Ok(())
    }

    /// Fan out one applied change: notifications for the UI, a mutation
    /// frame for sibling tabs, and snapshot invalidation.
    async fn announce(&self, event_id: &str, sequence_num: u64, change: AppliedChange) {
        for n in change.notifications {
            self.notify(n);
        }
        for (kind, task_id) in change.mutations {
            self.bus.publish(TabMessage {
                tab_id: self.cfg.tab_id.clone(),
                event_id: event_id.to_string(),
                workspace_id: self.cfg.workspace_id.clone(),
                kind: TabMessageKind::Mutation {
                    kind,
                    task_id,
                    sequence_num,
                },
            });
        }
        if change.invalidates_snapshots {
            if let Err(e) = self
                .store
                .invalidate_snapshots(&self.cfg.workspace_id)
                .await
            {
                warn!(error = %e, "snapshot invalidation failed");
            }
        }
    }

    // =======================================================================
    // Inbound: sibling tabs
    // =======================================================================

    /// Apply a frame broadcast by a sibling tab. Mutations are only applied
    /// when the local sequence allows; otherwise the canonical server event
    /// is awaited instead.
    pub async fn handle_tab_message(&self, msg: TabMessage) -> Result<()> {
        if msg.tab_id == self.cfg.tab_id || msg.workspace_id != self.cfg.workspace_id {
            return Ok(());
        }

        {
            let mut guard = self.guard.lock().await;
            let key = format!("tab:{}", msg.event_id);
            if guard.check(&key).is_some() {
                return Ok(());
            }
            guard.record(key, Value::Null);
        }

        match msg.kind {
            TabMessageKind::Mutation {
                sequence_num,
                task_id,
                ..
            } => {
                let local_seq = self.last_sequence().await;
                if sequence_num < local_seq {
                    // We are ahead; our store already reflects the canonical
                    // order past this mutation.
                    debug!(%task_id, sequence_num, local_seq, "stale tab mutation discarded");
                }
                // Equal or ahead of us: the canonical event will land on our
                // own channel; the broadcast is only an early hint.
                Ok(())
            }
            TabMessageKind::IdReconciled(record) => {
                self.apply_reconciliation_inner(&record, false).await
            }
            TabMessageKind::ViewState { filter } => {
                self.store
                    .set_metadata(meta_keys::VIEW_FILTER, &filter.to_string())
                    .await?;
                self.notify(TaskNotification::ViewStateChanged { filter });
                Ok(())
            }
        }
    }

    // =======================================================================
    // Outbound: user intents
    // =======================================================================

    /// Route a user intent: idempotency guard → clock stamp → optimistic
    /// local apply → channel send, or offline queue when disconnected.
    pub async fn submit(&self, kind: TaskEventKind) -> Result<SubmitOutcome> {
        match &kind {
            TaskEventKind::Bootstrap { .. } | TaskEventKind::WsSubscribe { .. } => {
                bail!("{} is not a client-submittable intent", kind.wire_type());
            }
            // Local-only control intents: no server payload, no store write.
            TaskEventKind::JumpToSpan { task_id } => {
                self.notify(TaskNotification::NavigateToSpan {
                    task_id: task_id.clone(),
                });
                return Ok(SubmitOutcome::Applied);
            }
            TaskEventKind::Refresh {} => {
                self.notify(TaskNotification::RefreshRequested);
                return Ok(SubmitOutcome::Applied);
            }
            TaskEventKind::IdleSync {} => {
                self.notify(TaskNotification::IdleSyncRequested);
                return Ok(SubmitOutcome::Applied);
            }
            TaskEventKind::OfflineQueueReplay {} => {
                self.notify(TaskNotification::ReplayRequested);
                return Ok(SubmitOutcome::Applied);
            }
            TaskEventKind::FilterApply { filter } => {
                self.store
                    .set_metadata(meta_keys::VIEW_FILTER, &filter.to_string())
                    .await?;
                self.bus.publish(TabMessage {
                    tab_id: self.cfg.tab_id.clone(),
                    event_id: format!("view_{}", Uuid::new_v4().simple()),
                    workspace_id: self.cfg.workspace_id.clone(),
                    kind: TabMessageKind::ViewState {
                        filter: filter.clone(),
                    },
                });
                self.notify(TaskNotification::ViewStateChanged {
                    filter: filter.clone(),
                });
                return Ok(SubmitOutcome::Applied);
            }
            _ => {}
        }

        // Mint identities for offline-first creates before anything else so
        // the optimistic record and the queue entry agree.
        let kind = self.assign_temp_identity(kind);

        let (event_type, payload) = kind.to_wire_payload();
        {
            let mut guard = self.guard.lock().await;
            if guard.check_content_duplicate(&event_type, &payload, None) {
                self.stats.intents_suppressed.fetch_add(1, Ordering::Relaxed);
                debug!(%event_type, "rapid duplicate intent suppressed");
                return Ok(SubmitOutcome::SuppressedDuplicate);
            }
        }

        // Stamp the local component of the vector clock.
        let stamped_clock = {
            let mut seq = self.seq.lock().await;
            seq.clock.increment(self.cfg.local_actor);
            seq.clock.clone()
        };

        // Optimistic apply. Rolled back per-operation on permanent failure.
        let now = Utc::now();
        let change =
            apply::apply_kind(self, &kind, now, &stamped_clock, self.cfg.local_actor).await?;
        let op_id = format!("op_{}", Uuid::new_v4().simple());
        self.announce(&op_id, self.last_sequence().await, change).await;

        let frame = ClientFrame {
            namespace: "tasks".into(),
            event_id: op_id.clone(),
            event_type: event_type.clone(),
            workspace_id: self.cfg.workspace_id.clone(),
            vector_clock: stamped_clock.clone(),
            checksum: Some(tdk_checksum::checksum(&payload)),
            session_id: Some(self.cfg.session_id.clone()),
            payload,
        };

        let is_create = matches!(
            kind,
            TaskEventKind::CreateManual { .. } | TaskEventKind::NlpProposed { .. }
        );

        let send_result = if is_create {
            // Creates go request/response so the server-assigned id comes
            // back on the ack.
            match self.channel.request(frame).await {
                Ok(ServerFrame::Ack { result, .. }) => {
                    self.finish_create_ack(&kind, &result).await?;
                    Ok(())
                }
                Ok(_) => Ok(()),
                Err(e) => Err(e),
            }
        } else {
            self.channel.send(frame).await
        };

        match send_result {
            Ok(()) => {
                let mut guard = self.guard.lock().await;
                guard.record(op_id, Value::Null);
                self.stats.intents_sent.fetch_add(1, Ordering::Relaxed);
                Ok(SubmitOutcome::Sent)
            }
            Err(TransportError::Offline) | Err(TransportError::Closed) | Err(TransportError::Timeout) => {
                let op = QueuedOperation::new(
                    kind,
                    stamped_clock,
                    self.cfg.session_id.clone(),
                    now,
                );
                let queue_id = self.store.queue_operation(&op).await?;
                self.stats.intents_queued.fetch_add(1, Ordering::Relaxed);
                debug!(queue_id, "intent parked in offline queue");
                Ok(SubmitOutcome::Queued { queue_id })
            }
            Err(e) => Err(e).context("intent send failed"),
        }
    }

    /// Creates minted offline-first temp ids so identity survives the queue.
    fn assign_temp_identity(&self, kind: TaskEventKind) -> TaskEventKind {
        match kind {
            TaskEventKind::CreateManual { mut task } => {
                if task.id.is_empty() {
                    task.id = self.mint_temp_id();
                }
                TaskEventKind::CreateManual { task }
            }
            TaskEventKind::NlpProposed { mut task } => {
                if task.id.is_empty() {
                    task.id = self.mint_temp_id();
                }
                TaskEventKind::NlpProposed { task }
            }
            other => other,
        }
    }

    /// A create ack carries the server-assigned id; rewrite the optimistic
    /// temp record immediately.
    pub async fn finish_create_ack(&self, kind: &TaskEventKind, result: &Value) -> Result<()> {
        let temp_id = match kind {
            TaskEventKind::CreateManual { task } | TaskEventKind::NlpProposed { task } => &task.id,
            _ => return Ok(()),
        };
        let Some(real_id) = result.get("id").and_then(Value::as_str) else {
            return Ok(());
        };
        if real_id == temp_id {
            return Ok(());
        }

        let record = ReconciliationRecord {
            temp_id: temp_id.clone(),
            real_id: real_id.to_string(),
            user_id: None,
            workspace_id: self.cfg.workspace_id.clone(),
            reconciled_at: Utc::now(),
        };
        self.apply_reconciliation(&record).await
    }

}
