//! Short-lived duplicate suppression for outbound operations.
//!
//! Two registries, both TTL-evicted and capacity-bounded:
//! - **operation-id**: client-supplied id → recorded outcome. A repeat within
//!   the TTL returns the prior outcome instead of re-sending.
//! - **content-hash**: canonical hash of (type, payload) → first-seen time.
//!   Catches rapid double-submits (double-clicks) that minted fresh ids.
//!
//! The clock is an injectable `Fn() -> i64` returning epoch-milliseconds;
//! tests drive it with a `Cell<i64>` closure.

use std::collections::HashMap;

use serde_json::Value;

/// Registry TTL. Entries older than this are evicted on the cleanup tick.
pub const ENTRY_TTL_MS: i64 = 5 * 60 * 1000;
/// Hard capacity per registry. Reaching it evicts the oldest 20%.
pub const MAX_ENTRIES: usize = 1000;
/// Window for content-duplicate suppression when the caller passes none.
pub const DEFAULT_CONTENT_WINDOW_MS: i64 = 2_000;

#[derive(Debug, Clone)]
struct OpEntry {
    outcome: Value,
    recorded_at_ms: i64,
}

pub struct IdempotencyGuard<C>
where
    C: Fn() -> i64,
{
    ops: HashMap<String, OpEntry>,
    content: HashMap<String, i64>,
    clock: C,
}

impl<C: Fn() -> i64> IdempotencyGuard<C> {
    pub fn new(clock: C) -> Self {
        Self {
            ops: HashMap::new(),
            content: HashMap::new(),
            clock,
        }
    }

    /// Prior outcome for `op_id`, if it was recorded within the TTL.
    pub fn check(&self, op_id: &str) -> Option<&Value> {
        let now = (self.clock)();
        self.ops
            .get(op_id)
            .filter(|e| now - e.recorded_at_ms <= ENTRY_TTL_MS)
            .map(|e| &e.outcome)
    }

    /// Record the outcome of a completed operation.
    pub fn record(&mut self, op_id: impl Into<String>, outcome: Value) {
        if self.ops.len() >= MAX_ENTRIES {
            evict_oldest(&mut self.ops, |e| e.recorded_at_ms);
        }
        self.ops.insert(
            op_id.into(),
            OpEntry {
                outcome,
                recorded_at_ms: (self.clock)(),
            },
        );
    }

    /// True when an identical (type, payload) was seen within `within_ms`
    /// (default 2 s). Records the sighting either way, so the *next*
    /// identical submit inside the window is the one suppressed.
    pub fn check_content_duplicate(
        &mut self,
        op_type: &str,
        data: &Value,
        within_ms: Option<i64>,
    ) -> bool {
        let window = within_ms.unwrap_or(DEFAULT_CONTENT_WINDOW_MS);
        let key = content_key(op_type, data);
        let now = (self.clock)();

        let duplicate = self
            .content
            .get(&key)
            .map(|seen| now - seen <= window)
            .unwrap_or(false);

        if self.content.len() >= MAX_ENTRIES {
            evict_oldest(&mut self.content, |t| *t);
        }
        self.content.insert(key, now);

        duplicate
    }

    /// TTL sweep. Driven by the runtime's 60 s background tick; also safe to
    /// call opportunistically around bursts.
    pub fn cleanup(&mut self) {
        let now = (self.clock)();
        self.ops.retain(|_, e| now - e.recorded_at_ms <= ENTRY_TTL_MS);
        self.content.retain(|_, t| now - *t <= ENTRY_TTL_MS);
    }

    pub fn len(&self) -> usize {
        self.ops.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }
}

fn content_key(op_type: &str, data: &Value) -> String {
    format!("{op_type}:{}", tdk_checksum::checksum(data))
}

/// Drop the oldest 20% of entries (by the supplied timestamp accessor).
fn evict_oldest<V>(map: &mut HashMap<String, V>, ts: impl Fn(&V) -> i64) {
    let drop_count = (map.len() / 5).max(1);
    let mut by_age: Vec<(String, i64)> = map.iter().map(|(k, v)| (k.clone(), ts(v))).collect();
    by_age.sort_by_key(|(_, t)| *t);
    for (k, _) in by_age.into_iter().take(drop_count) {
        map.remove(&k);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::cell::Cell;

    #[test]
    fn repeat_op_id_returns_prior_outcome_within_ttl() {
        let now = Cell::new(0i64);
        let mut guard = IdempotencyGuard::new(|| now.get());

        assert!(guard.check("op-1").is_none());
        guard.record("op-1", json!({"id": 77}));
        assert_eq!(guard.check("op-1"), Some(&json!({"id": 77})));

        now.set(ENTRY_TTL_MS + 1);
        assert!(guard.check("op-1").is_none());
    }

    #[test]
    fn rapid_identical_content_is_flagged() {
        let now = Cell::new(0i64);
        let mut guard = IdempotencyGuard::new(|| now.get());

        let data = json!({"title": "t"});
        assert!(!guard.check_content_duplicate("task_create:manual", &data, None));
        now.set(500);
        assert!(guard.check_content_duplicate("task_create:manual", &data, None));

        // Outside the window it is a fresh submit again.
        now.set(500 + DEFAULT_CONTENT_WINDOW_MS + 1);
        assert!(!guard.check_content_duplicate("task_create:manual", &data, None));
    }

    #[test]
    fn capacity_evicts_oldest_fifth() {
        let now = Cell::new(0i64);
        let mut guard = IdempotencyGuard::new(|| now.get());

        for i in 0..MAX_ENTRIES {
            now.set(i as i64);
            guard.record(format!("op-{i}"), Value::Null);
        }
        now.set(MAX_ENTRIES as i64);
        guard.record("op-overflow", Value::Null);

        assert!(guard.len() <= MAX_ENTRIES - MAX_ENTRIES / 5 + 1);
        // The oldest entries went first.
        assert!(guard.check("op-0").is_none());
        assert!(guard.check("op-overflow").is_some());
    }

    #[test]
    fn cleanup_sweeps_expired_entries() {
        let now = Cell::new(0i64);
        let mut guard = IdempotencyGuard::new(|| now.get());

        guard.record("old", Value::Null);
        now.set(ENTRY_TTL_MS + 1);
        guard.record("fresh", Value::Null);
        guard.cleanup();

        assert_eq!(guard.len(), 1);
        assert!(guard.check("fresh").is_some());
    }
}
