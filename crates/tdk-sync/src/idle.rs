//! Periodic authoritative resync.
//!
//! Every tick fetches the canonical task set over REST, merges it
//! server-authoritatively into the store, and refreshes the users map.
//! Activity on editable surfaces pauses the loop (resuming after 2 s of
//! quiet); tab-visibility and online transitions force an immediate pass.
//! Failures back the interval off exponentially to a cap; success resets it.

use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::Utc;
use serde::Serialize;
use tokio::sync::Notify;
use tracing::{debug, info, warn};

use tdk_merge::MergeStrategy;
use tdk_schemas::TaskFilter;
use tdk_store::{meta_keys, LocalStore};
use tdk_transport::RestClient;

#[derive(Debug, Clone)]
pub struct IdleSyncConfig {
    pub base_interval: Duration,
    /// Quiet period required after user activity before a sync may run.
    pub activity_debounce: Duration,
    pub backoff_cap: Duration,
    /// Soft-deleted tasks older than this are purged for good.
    pub delete_grace: Duration,
}

impl Default for IdleSyncConfig {
    fn default() -> Self {
        Self {
            base_interval: Duration::from_secs(30),
            activity_debounce: Duration::from_secs(2),
            backoff_cap: Duration::from_secs(300),
            delete_grace: Duration::from_secs(15 * 60),
        }
    }
}

/// Shared last-activity stamp. UI surfaces call [`ActivityTracker::touch`]
/// on typing/clicking; the loop reads it to stay out of the user's way.
#[derive(Debug, Default)]
pub struct ActivityTracker {
    last_activity_ms: AtomicI64,
}

impl ActivityTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn touch(&self) {
        self.last_activity_ms
            .store(Utc::now().timestamp_millis(), Ordering::Relaxed);
    }

    pub fn idle_for(&self, quiet: Duration) -> bool {
        let last = self.last_activity_ms.load(Ordering::Relaxed);
        Utc::now().timestamp_millis() - last >= quiet.as_millis() as i64
    }
}

#[derive(Debug, Default)]
pub struct IdleSyncStats {
    pub runs: AtomicU64,
    pub forced: AtomicU64,
    pub skipped_active: AtomicU64,
    pub failures: AtomicU64,
    pub cleared_tasks: AtomicU64,
    pub purged_deleted: AtomicU64,
}

#[derive(Debug, Clone, Serialize)]
pub struct IdleSyncStatsSnapshot {
    pub runs: u64,
    pub forced: u64,
    pub skipped_active: u64,
    pub failures: u64,
    pub cleared_tasks: u64,
    pub purged_deleted: u64,
}

impl IdleSyncStats {
    pub fn snapshot(&self) -> IdleSyncStatsSnapshot {
        IdleSyncStatsSnapshot {
            runs: self.runs.load(Ordering::Relaxed),
            forced: self.forced.load(Ordering::Relaxed),
            skipped_active: self.skipped_active.load(Ordering::Relaxed),
            failures: self.failures.load(Ordering::Relaxed),
            cleared_tasks: self.cleared_tasks.load(Ordering::Relaxed),
            purged_deleted: self.purged_deleted.load(Ordering::Relaxed),
        }
    }
}

pub struct IdleSyncLoop {
    cfg: IdleSyncConfig,
    rest: RestClient,
    store: Arc<LocalStore>,
    activity: Arc<ActivityTracker>,
    force: Notify,
    stats: IdleSyncStats,
}

impl IdleSyncLoop {
    pub fn new(
        cfg: IdleSyncConfig,
        rest: RestClient,
        store: Arc<LocalStore>,
        activity: Arc<ActivityTracker>,
    ) -> Arc<Self> {
        Arc::new(Self {
            cfg,
            rest,
            store,
            activity,
            force: Notify::new(),
            stats: IdleSyncStats::default(),
        })
    }

    pub fn stats(&self) -> &IdleSyncStats {
        &self.stats
    }

    /// Request an immediate pass (visibility gained, online transition).
    pub fn force_sync(&self) {
        self.stats.forced.fetch_add(1, Ordering::Relaxed);
        self.force.notify_one();
    }

    /// Loop body; the runtime owns the spawned task and aborts it on
    /// teardown.
    pub async fn run(self: Arc<Self>) {
        let mut delay = self.cfg.base_interval;

        loop {
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = self.force.notified() => {}
            }

            if !self.activity.idle_for(self.cfg.activity_debounce) {
                // User is mid-edit; come back after the debounce window.
                self.stats.skipped_active.fetch_add(1, Ordering::Relaxed);
                delay = self.cfg.activity_debounce;
                continue;
            }

            match self.sync_once().await {
                Ok(applied) => {
                    debug!(applied, "idle sync pass complete");
                    delay = self.cfg.base_interval;
                }
                Err(e) => {
                    self.stats.failures.fetch_add(1, Ordering::Relaxed);
                    warn!(error = %e, "idle sync failed; backing off");
                    delay = (delay * 2).min(self.cfg.backoff_cap);
                }
            }
        }
    }

    /// One authoritative pass. Returns the number of records written.
    pub async fn sync_once(&self) -> Result<usize> {
        self.stats.runs.fetch_add(1, Ordering::Relaxed);

        let resync = self
            .rest
            .fetch_tasks()
            .await
            .context("authoritative fetch failed")?;

        // Users map refresh for assignee rehydration.
        if !resync.users.is_empty() {
            let encoded = serde_json::to_string(&resync.users)?;
            self.store
                .set_metadata(meta_keys::USERS_MAP, &encoded)
                .await?;
        }

        let now = Utc::now();
        let everything = TaskFilter {
            include_snoozed: true,
            include_deleted: true,
            ..Default::default()
        };

        let applied = if resync.tasks.is_empty() {
            // Force-clear is gated on an explicit, successful empty answer;
            // transport failures returned above and never reach here.
            let stale = self.store.filter_tasks(&everything, now).await?;
            if !stale.is_empty() {
                info!(count = stale.len(), "authoritative empty set; clearing stale cache entries");
                for task in &stale {
                    self.store.delete_task(&task.id).await?;
                }
                self.stats
                    .cleared_tasks
                    .fetch_add(stale.len() as u64, Ordering::Relaxed);
            }
            0
        } else {
            let mut batch = Vec::with_capacity(resync.tasks.len());
            for remote in resync.tasks {
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
            batch.len()
        };

        // Soft-deletes past the restore window go away for good.
        let grace_ms = self.cfg.delete_grace.as_millis() as i64;
        let all = self.store.filter_tasks(&everything, now).await?;
        for task in all {
            if let Some(deleted_at) = task.deleted_at {
                if now.timestamp_millis() - deleted_at.timestamp_millis() > grace_ms {
                    self.store.delete_task(&task.id).await?;
                    self.stats.purged_deleted.fetch_add(1, Ordering::Relaxed);
                }
            }
        }

        // TTL fallback for snapshot hygiene when no event stream invalidated
        // them already.
        self.store.purge_stale_snapshots(now).await?;

        self.store
            .set_metadata(meta_keys::LAST_IDLE_SYNC, &now.timestamp_millis().to_string())
            .await?;

        Ok(applied)
    }
}
