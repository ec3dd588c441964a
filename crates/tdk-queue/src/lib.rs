//! Offline queue replay.
//!
//! Drains the durable queue strictly in order (priority desc, queued_at asc,
//! queue_id asc) against the live channel. One replayer runs at a time (an
//! atomic guard refuses overlap); a transient failure stops the drain so the
//! runtime can retry later with exponential backoff.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Result};
use serde_json::Value;
use tracing::{debug, info, warn};

use tdk_dispatch::{TaskDispatcher, TaskNotification};
use tdk_merge::MergeStrategy;
use tdk_schemas::{ClientFrame, OpType, QueuedOperation, ReplayConflictStrategy, ServerFrame};
use tdk_transport::{ErrorClass, TaskChannel, TransportError};

#[derive(Debug, Clone)]
pub struct ReplayConfig {
    /// Permanent failure threshold per entry.
    pub max_attempts: u32,
    pub backoff_base: Duration,
    pub backoff_cap: Duration,
}

impl Default for ReplayConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            backoff_base: Duration::from_secs(1),
            backoff_cap: Duration::from_secs(60),
        }
    }
}

/// What one drain pass accomplished.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReplayReport {
    /// Another replay was already running; nothing was done.
    pub already_running: bool,
    pub sent: usize,
    pub conflicts_resolved: usize,
    pub not_found_cleaned: usize,
    pub failed_permanently: usize,
    /// A transient error stopped the drain early; retry after backoff.
    pub stopped_transient: bool,
    /// Entries still queued when the pass ended.
    pub remaining: i64,
}

pub struct QueueReplayer {
    cfg: ReplayConfig,
    replaying: AtomicBool,
}

impl QueueReplayer {
    pub fn new(cfg: ReplayConfig) -> Self {
        Self {
            cfg,
            replaying: AtomicBool::new(false),
        }
    }

    /// Backoff delay for the given consecutive-failure count.
    pub fn backoff_delay(&self, failures: u32) -> Duration {
        let base = self.cfg.backoff_base.as_millis() as u64;
        let cap = self.cfg.backoff_cap.as_millis() as u64;
        Duration::from_millis(base.saturating_mul(1u64 << failures.min(16)).min(cap))
    }

    /// Drain the queue once. Stops at the first transient failure; resolves
    /// conflicts in place; reconciles temp ids on create acks.
    pub async fn replay(
        &self,
        dispatcher: &TaskDispatcher,
        channel: &Arc<dyn TaskChannel>,
    ) -> Result<ReplayReport> {
        if self
            .replaying
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            debug!("queue replay already in progress; skipping");
            return Ok(ReplayReport {
                already_running: true,
                ..Default::default()
            });
        }

        let result = self.drain(dispatcher, channel).await;
        self.replaying.store(false, Ordering::SeqCst);
        result
    }

    async fn drain(
        &self,
        dispatcher: &TaskDispatcher,
        channel: &Arc<dyn TaskChannel>,
    ) -> Result<ReplayReport> {
        let store = dispatcher.store();
        let mut report = ReplayReport::default();

        let ops = store.get_queue().await?;
        info!(entries = ops.len(), "offline queue replay starting");

        for op in ops {
            let frame = build_frame(dispatcher, &op);

            match channel.request(frame).await {
                Ok(ServerFrame::Ack { result, .. }) => {
                    if op.op_type == OpType::Create {
                        dispatcher.finish_create_ack(&op.kind, &result).await?;
                    }
                    store.remove_from_queue(op.queue_id).await?;
                    report.sent += 1;
                }
                Ok(_) => {
                    store.remove_from_queue(op.queue_id).await?;
                    report.sent += 1;
                }
                Err(err) => match err.class() {
                    ErrorClass::Conflict => {
                        self.resolve_conflict(dispatcher, &op, &err).await?;
                        store.remove_from_queue(op.queue_id).await?;
                        report.conflicts_resolved += 1;
                    }
                    ErrorClass::Validation => {
                        // Never retried; the user decides what to do next.
                        surface_failure(dispatcher, &op, &err);
                        store.remove_from_queue(op.queue_id).await?;
                        report.failed_permanently += 1;
                    }
                    ErrorClass::NotFound => {
                        // The target is gone server-side; drop our copy too.
                        debug!(task_ref = %op.task_ref, "queued target gone upstream; deleting locally");
                        store.delete_task(&op.task_ref).await?;
                        store.remove_from_queue(op.queue_id).await?;
                        report.not_found_cleaned += 1;
                    }
                    ErrorClass::Auth => {
                        report.remaining = store.queue_len().await?;
                        bail!("authentication failure during queue replay: {err}");
                    }
                    ErrorClass::Transient => {
                        let attempts = store.bump_queue_attempts(op.queue_id).await?;
                        if attempts >= self.cfg.max_attempts {
                            warn!(
                                queue_id = op.queue_id,
                                attempts, "queued operation exhausted its attempts"
                            );
                            surface_failure(dispatcher, &op, &err);
                            store.remove_from_queue(op.queue_id).await?;
                            report.failed_permanently += 1;
                            continue;
                        }
                        debug!(queue_id = op.queue_id, attempts, error = %err, "transient failure; stopping drain");
                        report.stopped_transient = true;
                        break;
                    }
                },
            }
        }

        report.remaining = store.queue_len().await?;
        info!(
            sent = report.sent,
            conflicts = report.conflicts_resolved,
            failed = report.failed_permanently,
            remaining = report.remaining,
            "offline queue replay finished"
        );
        Ok(report)
    }

    /// 409: merge the server's record against ours. The entry may request
    /// last-write-wins explicitly; everything else uses the engine default.
    async fn resolve_conflict(
        &self,
        dispatcher: &TaskDispatcher,
        op: &QueuedOperation,
        err: &TransportError,
    ) -> Result<()> {
        let TransportError::Server {
            server_task: Some(server_task),
            ..
        } = err
        else {
            debug!(queue_id = op.queue_id, "conflict without server record; dropping entry");
            return Ok(());
        };

        let strategy = match op.conflict_strategy {
            Some(ReplayConflictStrategy::LastWriteWins) => MergeStrategy::LastWriteWins,
            _ => MergeStrategy::ServerAuthoritative,
        };

        let store = dispatcher.store();
        let merged = match store.get_task(&server_task.id).await? {
            Some(local) => {
                let order = local.vector_clock.compare(&server_task.vector_clock);
                let report = tdk_merge::merge_tasks(&local, server_task, strategy);
                debug!(
                    task_id = %server_task.id,
                    ?order,
                    conflicts = report.conflicts.len(),
                    ?strategy,
                    "replay conflict merged"
                );
                report.merged
            }
            None => (**server_task).clone(),
        };

        store.save_task(&merged).await?;
        let _ = dispatcher
            .notifier()
            .send(TaskNotification::TaskUpdated { task: merged });
        Ok(())
    }
}

/// Sanitized wire frame for one queued entry. The event id is stable per
/// (session, queue entry) so the server can de-duplicate replays across
/// reconnects.
fn build_frame(dispatcher: &TaskDispatcher, op: &QueuedOperation) -> ClientFrame {
    let (event_type, payload) = op.kind.to_wire_payload();
    // Sanitize: canonicalization strips cache-internal decorations.
    let payload: Value = tdk_checksum::canonicalize(&payload);

    ClientFrame {
        namespace: "tasks".into(),
        event_id: format!("queue_{}_{}", op.session_id, op.queue_id),
        event_type,
        workspace_id: dispatcher.config().workspace_id.clone(),
        vector_clock: op.vector_clock.clone(),
        checksum: Some(tdk_checksum::checksum(&payload)),
        session_id: Some(op.session_id.clone()),
        payload,
    }
}

fn surface_failure(dispatcher: &TaskDispatcher, op: &QueuedOperation, err: &TransportError) {
    let _ = dispatcher.notifier().send(TaskNotification::OperationFailed {
        task_id: op.task_ref.clone(),
        action: op.kind.wire_type().to_string(),
        error: err.to_string(),
        operation: Some(op.clone()),
    });
}
