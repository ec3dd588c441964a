//! Engine configuration: layered YAML with env overrides.
//!
//! Config files merge in order: later layers win, objects merge key by key,
//! arrays and scalars are replaced outright. The merged document is
//! rendered with ordered keys and content-hashed so a boot report can state
//! exactly which configuration it ran under, and `TDK_*` environment
//! variables override individual settings last.

use anyhow::{Context, Result};
use serde_json::Value;
use sha2::{Digest, Sha256};

pub const ENV_WS_URL: &str = "TDK_WS_URL";
pub const ENV_API_URL: &str = "TDK_API_URL";
pub const ENV_WORKSPACE: &str = "TDK_WORKSPACE_ID";
pub const ENV_STORE_PATH: &str = "TDK_STORE_PATH";

/// Merged configuration with its canonical rendering and content hash.
#[derive(Debug, Clone)]
pub struct LoadedConfig {
    pub document: Value,
    pub canonical: String,
    pub hash: String,
}

/// Read and merge YAML layers in order, then canonicalize and hash.
pub fn load_config_layers(paths: &[&str]) -> Result<LoadedConfig> {
    let mut document = Value::Object(Default::default());
    for path in paths {
        document = overlay(document, read_layer(path)?);
    }

    let canonical = serde_json::to_string(&tdk_checksum::ordered(&document))
        .context("render canonical config failed")?;
    let hash = hex::encode(Sha256::digest(canonical.as_bytes()));

    Ok(LoadedConfig {
        document,
        canonical,
        hash,
    })
}

fn read_layer(path: &str) -> Result<Value> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("read config layer: {path}"))?;
    let parsed: serde_yaml::Value =
        serde_yaml::from_str(&text).with_context(|| format!("parse config layer: {path}"))?;
    serde_json::to_value(parsed)
        .with_context(|| format!("config layer has non-JSON structure: {path}"))
}

/// Fold one layer onto the document. Objects merge per key; any other
/// pairing means the incoming value replaces the base.
fn overlay(base: Value, layer: Value) -> Value {
    match (base, layer) {
        (Value::Object(mut under), Value::Object(over)) => {
            for (key, incoming) in over {
                let resolved = match under.remove(&key) {
                    Some(existing) => overlay(existing, incoming),
                    None => incoming,
                };
                under.insert(key, resolved);
            }
            Value::Object(under)
        }
        (_, replacement) => replacement,
    }
}

/// Typed view over the merged document plus env overrides.
#[derive(Debug, Clone)]
pub struct EngineSettings {
    pub ws_url: String,
    pub api_url: String,
    pub workspace_id: String,
    pub store_path: String,
    /// Idle sync base interval, seconds.
    pub idle_interval_secs: u64,
    /// Prefetch worker bound.
    pub prefetch_concurrency: usize,
    /// Reduced-data preference: disables prefetch entirely.
    pub reduced_data: bool,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            ws_url: "ws://127.0.0.1:8790/ws".into(),
            api_url: "http://127.0.0.1:8790".into(),
            workspace_id: "default".into(),
            store_path: "tasks_db.sqlite".into(),
            idle_interval_secs: 30,
            prefetch_concurrency: 3,
            reduced_data: false,
        }
    }
}

impl EngineSettings {
    /// Read settings out of a merged config document, falling back to
    /// defaults per field.
    pub fn from_value(v: &Value) -> Self {
        let d = Self::default();
        Self {
            ws_url: str_at(v, "/transport/ws_url").unwrap_or(d.ws_url),
            api_url: str_at(v, "/transport/api_url").unwrap_or(d.api_url),
            workspace_id: str_at(v, "/workspace_id").unwrap_or(d.workspace_id),
            store_path: str_at(v, "/store/path").unwrap_or(d.store_path),
            idle_interval_secs: u64_at(v, "/sync/idle_interval_secs").unwrap_or(d.idle_interval_secs),
            prefetch_concurrency: u64_at(v, "/sync/prefetch_concurrency")
                .map(|n| n as usize)
                .unwrap_or(d.prefetch_concurrency),
            reduced_data: bool_at(v, "/sync/reduced_data").unwrap_or(d.reduced_data),
        }
    }

    /// Environment overrides win over file configuration.
    pub fn apply_env(mut self) -> Self {
        if let Ok(v) = std::env::var(ENV_WS_URL) {
            self.ws_url = v;
        }
        if let Ok(v) = std::env::var(ENV_API_URL) {
            self.api_url = v;
        }
        if let Ok(v) = std::env::var(ENV_WORKSPACE) {
            self.workspace_id = v;
        }
        if let Ok(v) = std::env::var(ENV_STORE_PATH) {
            self.store_path = v;
        }
        self
    }
}

fn str_at(v: &Value, pointer: &str) -> Option<String> {
    v.pointer(pointer).and_then(Value::as_str).map(String::from)
}

fn u64_at(v: &Value, pointer: &str) -> Option<u64> {
    v.pointer(pointer).and_then(Value::as_u64)
}

fn bool_at(v: &Value, pointer: &str) -> Option<bool> {
    v.pointer(pointer).and_then(Value::as_bool)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn settings_read_from_document_with_defaults() {
        let doc = json!({
            "workspace_id": "ws-acme",
            "transport": { "ws_url": "wss://sync.example/ws" },
            "sync": { "idle_interval_secs": 45, "reduced_data": true },
        });
        let s = EngineSettings::from_value(&doc);
        assert_eq!(s.workspace_id, "ws-acme");
        assert_eq!(s.ws_url, "wss://sync.example/ws");
        assert_eq!(s.idle_interval_secs, 45);
        assert!(s.reduced_data);
        // Unset fields keep defaults.
        assert_eq!(s.prefetch_concurrency, 3);
    }

    #[test]
    fn overlay_replaces_scalars_and_merges_objects_per_key() {
        let base = json!({"sync": {"idle_interval_secs": 30, "reduced_data": false}});
        let merged = overlay(
            base,
            json!({"sync": {"idle_interval_secs": 60}, "workspace_id": "ws1"}),
        );
        assert_eq!(merged["sync"]["idle_interval_secs"], 60);
        assert_eq!(merged["sync"]["reduced_data"], false);
        assert_eq!(merged["workspace_id"], "ws1");
    }

    #[test]
    fn overlay_replaces_arrays_outright() {
        let base = json!({"labels": ["a", "b"]});
        let merged = overlay(base, json!({"labels": ["c"]}));
        assert_eq!(merged["labels"], json!(["c"]));
    }
}
