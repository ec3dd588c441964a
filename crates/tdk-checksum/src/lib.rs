//! Content checksums over a canonical rendering.
//!
//! Two layers:
//! - [`checksum`] / [`canonicalize`]: pure functions. Same logical content →
//!   same hash, regardless of key order or volatile decoration.
//! - [`ChecksumRegistry`]: remembers the computed hash and timestamp per key
//!   so drift against server hashes can be answered without recomputation.

use std::collections::HashMap;

use serde::Serialize;
use serde_json::Value;
use sha2::{Digest, Sha256};

/// Fields that never participate in content hashing. These are client-side
/// decorations (sync bookkeeping, UI state) that differ between replicas of
/// the same logical record.
pub const VOLATILE_FIELDS: &[&str] = &[
    "lastSynced",
    "cached_at",
    "ui_state",
    "scroll_position",
    "selected",
    "hover",
    "focus",
    "_checksum",
    "_cached_at",
];

/// Canonicalize a JSON value:
/// - object keys sorted lexicographically,
/// - volatile fields removed at every depth,
/// - arrays of objects carrying an `id` sorted by that id.
pub fn canonicalize(v: &Value) -> Value {
    match v {
        Value::Object(map) => {
            let mut keys: Vec<_> = map
                .keys()
                .filter(|k| !VOLATILE_FIELDS.contains(&k.as_str()))
                .cloned()
                .collect();
            keys.sort();
            let mut new = serde_json::Map::new();
            for k in keys {
                new.insert(k.clone(), canonicalize(&map[&k]));
            }
            Value::Object(new)
        }
        Value::Array(arr) => {
            let mut items: Vec<Value> = arr.iter().map(canonicalize).collect();
            if items.iter().all(|i| i.get("id").is_some()) && !items.is_empty() {
                items.sort_by(|a, b| {
                    let ka = a.get("id").map(value_sort_key).unwrap_or_default();
                    let kb = b.get("id").map(value_sort_key).unwrap_or_default();
                    ka.cmp(&kb)
                });
            }
            Value::Array(items)
        }
        _ => v.clone(),
    }
}

fn value_sort_key(v: &Value) -> String {
    match v {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Key-ordered rendering with no field filtering: every field is
/// significant, only map ordering is normalized. Configuration hashing uses
/// this; content checksums go through [`canonicalize`], which additionally
/// strips volatile fields and sorts id-keyed arrays.
pub fn ordered(v: &Value) -> Value {
    match v {
        Value::Object(map) => {
            let entries: std::collections::BTreeMap<&String, &Value> = map.iter().collect();
            Value::Object(
                entries
                    .into_iter()
                    .map(|(k, val)| (k.clone(), ordered(val)))
                    .collect(),
            )
        }
        Value::Array(items) => Value::Array(items.iter().map(ordered).collect()),
        other => other.clone(),
    }
}

/// Compact canonical JSON string.
pub fn canonical_string(v: &Value) -> String {
    serde_json::to_string(&canonicalize(v)).expect("json serialization must not fail")
}

/// SHA-256 over the canonical rendering, hex-encoded.
pub fn checksum(v: &Value) -> String {
    let canonical = canonical_string(v);
    let mut hasher = Sha256::new();
    hasher.update(canonical.as_bytes());
    hex::encode(hasher.finalize())
}

/// Checksum of any serializable value via its JSON form.
pub fn checksum_of<T: Serialize>(value: &T) -> String {
    let v = serde_json::to_value(value).expect("json serialization must not fail");
    checksum(&v)
}

/// Outcome of a [`ChecksumRegistry::validate`] call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationOutcome {
    pub valid: bool,
    /// True when a server hash was supplied and it disagrees with the
    /// computed one.
    pub drift: bool,
    pub computed: String,
}

#[derive(Debug, Clone)]
struct RegistryEntry {
    checksum: String,
    computed_at_ms: i64,
    drifted: bool,
}

/// Per-key checksum memory with drift detection.
///
/// The clock is an injectable `Fn() -> i64` returning epoch-milliseconds,
/// enabling deterministic tests without mocking system time.
pub struct ChecksumRegistry<C>
where
    C: Fn() -> i64,
{
    entries: HashMap<String, RegistryEntry>,
    clock: C,
}

/// Staleness bound applied when the caller does not pass one.
pub const DEFAULT_MAX_AGE_MS: i64 = 30_000;

impl<C: Fn() -> i64> ChecksumRegistry<C> {
    pub fn new(clock: C) -> Self {
        Self {
            entries: HashMap::new(),
            clock,
        }
    }

    /// Compute and record the checksum for `key`, comparing against the
    /// server's `expected` hash when one is known.
    pub fn validate(&mut self, key: &str, data: &Value, expected: Option<&str>) -> ValidationOutcome {
        let computed = checksum(data);
        let drift = match expected {
            Some(e) => e != computed,
            None => false,
        };

        self.entries.insert(
            key.to_string(),
            RegistryEntry {
                checksum: computed.clone(),
                computed_at_ms: (self.clock)(),
                drifted: drift,
            },
        );

        ValidationOutcome {
            valid: !drift,
            drift,
            computed,
        }
    }

    /// Compare the stored checksum without recomputation. `None` when the
    /// key has never been validated.
    pub fn quick_check(&self, key: &str, expected: &str) -> Option<bool> {
        self.entries.get(key).map(|e| e.checksum == expected)
    }

    /// True when the stored timestamp is older than `max_age_ms` (or the
    /// 30 s default), or when the key was never validated.
    pub fn is_stale(&self, key: &str, max_age_ms: Option<i64>) -> bool {
        let bound = max_age_ms.unwrap_or(DEFAULT_MAX_AGE_MS);
        match self.entries.get(key) {
            None => true,
            Some(e) => (self.clock)() - e.computed_at_ms > bound,
        }
    }

    pub fn stored_checksum(&self, key: &str) -> Option<&str> {
        self.entries.get(key).map(|e| e.checksum.as_str())
    }

    /// Keys whose last validation disagreed with the server hash. These are
    /// the targets for a drift resync.
    pub fn drifted_keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self
            .entries
            .iter()
            .filter(|(_, e)| e.drifted)
            .map(|(k, _)| k.clone())
            .collect();
        keys.sort();
        keys
    }

    /// Clear drift marks after a targeted resync has healed them.
    pub fn clear_drift(&mut self, key: &str) {
        if let Some(e) = self.entries.get_mut(key) {
            e.drifted = false;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn key_order_does_not_change_checksum() {
        let a = json!({"b": 1, "a": {"y": 2, "x": 3}});
        let b = json!({"a": {"x": 3, "y": 2}, "b": 1});
        assert_eq!(checksum(&a), checksum(&b));
    }

    #[test]
    fn volatile_fields_do_not_change_checksum() {
        let bare = json!({"title": "t"});
        let decorated = json!({
            "title": "t",
            "lastSynced": 12345,
            "ui_state": {"open": true},
            "_checksum": "stale",
        });
        assert_eq!(checksum(&bare), checksum(&decorated));
    }

    #[test]
    fn id_arrays_are_order_insensitive() {
        let a = json!([{"id": "b"}, {"id": "a"}]);
        let b = json!([{"id": "a"}, {"id": "b"}]);
        assert_eq!(checksum(&a), checksum(&b));

        // Arrays of primitives keep their order.
        let c = json!(["b", "a"]);
        let d = json!(["a", "b"]);
        assert_ne!(checksum(&c), checksum(&d));
    }

    #[test]
    fn ordered_normalizes_keys_but_keeps_every_field() {
        let v = json!({"b": 1, "lastSynced": 2, "a": 3});
        let out = ordered(&v);
        assert_eq!(
            serde_json::to_string(&out).unwrap(),
            r#"{"a":3,"b":1,"lastSynced":2}"#
        );
    }

    #[test]
    fn registry_tracks_drift_and_staleness() {
        let now = std::cell::Cell::new(1_000i64);
        let mut reg = ChecksumRegistry::new(|| now.get());

        let data = json!({"k": "v"});
        let good = checksum(&data);

        let out = reg.validate("snap", &data, Some(&good));
        assert!(out.valid && !out.drift);
        assert_eq!(reg.quick_check("snap", &good), Some(true));
        assert!(!reg.is_stale("snap", None));

        now.set(1_000 + DEFAULT_MAX_AGE_MS + 1);
        assert!(reg.is_stale("snap", None));

        let out = reg.validate("snap", &data, Some("deadbeef"));
        assert!(!out.valid && out.drift);
        assert_eq!(reg.drifted_keys(), vec!["snap".to_string()]);

        reg.clear_drift("snap");
        assert!(reg.drifted_keys().is_empty());
    }
}
