//! Concurrency-bounded, abortable background fetches for secondary views.
//!
//! Requests carry a priority and queue when the worker pool is at capacity.
//! Aborting the controller cancels in-flight fetches cooperatively: an
//! aborted fetch neither resolves nor writes to the cache. The cache is a
//! fixed-size LRU with a per-entry TTL.

use std::collections::BinaryHeap;
use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures_util::future::{AbortHandle, Abortable};
use lru::LruCache;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::Mutex;
use tracing::{debug, trace};

use tdk_transport::RestClient;

#[derive(Debug, Clone)]
pub struct PrefetchConfig {
    pub max_concurrent: usize,
    pub cache_cap: NonZeroUsize,
    pub entry_ttl: Duration,
}

impl Default for PrefetchConfig {
    fn default() -> Self {
        Self {
            max_concurrent: 3,
            cache_cap: NonZeroUsize::new(50).expect("cache cap is non-zero"),
            entry_ttl: Duration::from_secs(60),
        }
    }
}

/// What a prefetch fetches. Each target maps to one REST endpoint and one
/// cache key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PrefetchTarget {
    Clusters,
    TranscriptContext { task_id: String },
    LedgerStatus,
}

impl PrefetchTarget {
    pub fn cache_key(&self) -> String {
        match self {
            PrefetchTarget::Clusters => "clusters".into(),
            PrefetchTarget::TranscriptContext { task_id } => format!("transcript:{task_id}"),
            PrefetchTarget::LedgerStatus => "ledger_status".into(),
        }
    }
}

#[derive(Debug, Default)]
pub struct PrefetchStats {
    pub hits: AtomicU64,
    pub misses: AtomicU64,
    pub completed: AtomicU64,
    pub aborted: AtomicU64,
    pub failed: AtomicU64,
    pub inflight: AtomicU64,
}

#[derive(Debug, Clone, Serialize)]
pub struct PrefetchStatsSnapshot {
    pub hits: u64,
    pub misses: u64,
    pub completed: u64,
    pub aborted: u64,
    pub failed: u64,
    pub inflight: u64,
    pub hit_rate: f64,
}

impl PrefetchStats {
    pub fn snapshot(&self) -> PrefetchStatsSnapshot {
        let hits = self.hits.load(Ordering::Relaxed);
        let misses = self.misses.load(Ordering::Relaxed);
        let lookups = hits + misses;
        PrefetchStatsSnapshot {
            hits,
            misses,
            completed: self.completed.load(Ordering::Relaxed),
            aborted: self.aborted.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            inflight: self.inflight.load(Ordering::Relaxed),
            hit_rate: if lookups == 0 {
                0.0
            } else {
                hits as f64 / lookups as f64
            },
        }
    }
}

struct QueuedFetch {
    target: PrefetchTarget,
    priority: u8,
    seq: u64,
}

impl PartialEq for QueuedFetch {
    fn eq(&self, other: &Self) -> bool {
        self.priority == other.priority && self.seq == other.seq
    }
}
impl Eq for QueuedFetch {}
impl PartialOrd for QueuedFetch {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}
impl Ord for QueuedFetch {
    // Max-heap: higher priority first, then FIFO within a priority.
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.priority
            .cmp(&other.priority)
            .then(other.seq.cmp(&self.seq))
    }
}

pub struct PrefetchController {
    cfg: PrefetchConfig,
    rest: RestClient,
    enabled: AtomicBool,
    cache: Mutex<LruCache<String, (Instant, Value)>>,
    queue: Mutex<BinaryHeap<QueuedFetch>>,
    aborts: Mutex<Vec<AbortHandle>>,
    /// Bumped by every `abort_all`. Workers re-check it between queued
    /// items so a fetch started after the abort drained the handle list
    /// cannot slip through unregistered.
    abort_epoch: AtomicU64,
    seq: AtomicU64,
    stats: PrefetchStats,
}

impl PrefetchController {
    pub fn new(cfg: PrefetchConfig, rest: RestClient) -> Arc<Self> {
        let cache = LruCache::new(cfg.cache_cap);
        Arc::new(Self {
            cfg,
            rest,
            enabled: AtomicBool::new(true),
            cache: Mutex::new(cache),
            queue: Mutex::new(BinaryHeap::new()),
            aborts: Mutex::new(Vec::new()),
            abort_epoch: AtomicU64::new(0),
            seq: AtomicU64::new(0),
            stats: PrefetchStats::default(),
        })
    }

    pub fn stats(&self) -> &PrefetchStats {
        &self.stats
    }

    /// Honor reduced-data / slow-connection preference signals.
    pub fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::Relaxed);
        if !enabled {
            debug!("prefetch disabled by user preference");
        }
    }

    pub fn inflight(&self) -> u64 {
        self.stats.inflight.load(Ordering::Relaxed)
    }

    /// Cached value if present and within TTL.
    pub async fn get_cached(&self, target: &PrefetchTarget) -> Option<Value> {
        let mut cache = self.cache.lock().await;
        match cache.get(&target.cache_key()) {
            Some((at, value)) if at.elapsed() <= self.cfg.entry_ttl => {
                self.stats.hits.fetch_add(1, Ordering::Relaxed);
                Some(value.clone())
            }
            _ => {
                self.stats.misses.fetch_add(1, Ordering::Relaxed);
                None
            }
        }
    }

    /// Enqueue a background fetch. Runs immediately when a worker slot is
    /// free, otherwise waits its turn by priority.
    pub async fn request(self: Arc<Self>, target: PrefetchTarget, priority: u8) {
        if !self.enabled.load(Ordering::Relaxed) {
            trace!("prefetch disabled; request dropped");
            return;
        }

        if self.stats.inflight.load(Ordering::Relaxed) < self.cfg.max_concurrent as u64 {
            self.spawn_fetch(target).await;
        } else {
            let seq = self.seq.fetch_add(1, Ordering::Relaxed);
            self.queue.lock().await.push(QueuedFetch {
                target,
                priority,
                seq,
            });
        }
    }

    /// Cancel everything: in-flight fetches are aborted (no cache writes, no
    /// resolution) and the waiting queue is dropped. The epoch bump happens
    /// first so a worker mid-transition between queued items sees it before
    /// starting work that this drain could no longer reach.
    pub async fn abort_all(&self) {
        self.abort_epoch.fetch_add(1, Ordering::SeqCst);
        let handles: Vec<AbortHandle> = self.aborts.lock().await.drain(..).collect();
        for handle in &handles {
            handle.abort();
        }
        self.queue.lock().await.clear();
        debug!(aborted = handles.len(), "prefetch controller aborted");
    }

    /// Start one worker slot. The slot services its request and then keeps
    /// draining the waiting queue until it runs dry or an abort epoch
    /// elapses.
    async fn spawn_fetch(self: Arc<Self>, target: PrefetchTarget) {
        let epoch = self.abort_epoch.load(Ordering::SeqCst);
        let (abort_handle, registration) = AbortHandle::new_pair();
        self.aborts.lock().await.push(abort_handle);
        self.stats.inflight.fetch_add(1, Ordering::Relaxed);

        let this = self;
        tokio::spawn(async move {
            let mut current = Some((target, registration));

            while let Some((target, registration)) = current.take() {
                let key = target.cache_key();
                let work = Abortable::new(this.fetch(&target), registration);

                match work.await {
                    Ok(Ok(value)) => {
                        this.cache.lock().await.put(key, (Instant::now(), value));
                        this.stats.completed.fetch_add(1, Ordering::Relaxed);
                    }
                    Ok(Err(e)) => {
                        this.stats.failed.fetch_add(1, Ordering::Relaxed);
                        trace!(error = %e, "prefetch failed");
                    }
                    Err(_aborted) => {
                        this.stats.aborted.fetch_add(1, Ordering::Relaxed);
                    }
                }

                if let Some(next) = this.queue.lock().await.pop() {
                    let (handle, reg) = AbortHandle::new_pair();
                    this.aborts.lock().await.push(handle);
                    // Re-check after registering: if an abort drained the
                    // handle list while this slot was between items, the
                    // next fetch must not start — it could be the one the
                    // drain missed.
                    if this.abort_epoch.load(Ordering::SeqCst) != epoch {
                        break;
                    }
                    current = Some((next.target, reg));
                }
            }

            this.stats.inflight.fetch_sub(1, Ordering::Relaxed);
        });
    }

    async fn fetch(&self, target: &PrefetchTarget) -> Result<Value, tdk_transport::TransportError> {
        match target {
            PrefetchTarget::Clusters => self.rest.clusters().await,
            PrefetchTarget::TranscriptContext { task_id } => {
                self.rest.transcript_context(task_id).await
            }
            PrefetchTarget::LedgerStatus => self.rest.ledger_status().await,
        }
    }
}
