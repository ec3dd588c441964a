//! REST fallback and the AI proposal stream.
//!
//! Used when the channel is degraded and by the idle sync loop, whose
//! authoritative fetch always goes over REST. Conflict-resolution intent
//! travels in headers so the server can honor per-request strategies.

use std::time::Duration;

use futures_util::StreamExt;
use serde_json::Value;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use tdk_schemas::{ProposalStreamEvent, Task, TasksResyncResponse, VectorClock};

use crate::TransportError;

/// Header carrying a client's explicit overwrite intent.
pub const HDR_FORCE_UPDATE: &str = "X-Force-Update";
/// Header carrying the client's vector clock for server-side comparison.
pub const HDR_VECTOR_CLOCK: &str = "X-Vector-Clock";
/// Header naming the conflict strategy the client wants applied.
pub const HDR_CONFLICT_RESOLUTION: &str = "X-Conflict-Resolution";

#[derive(Debug, Clone)]
pub struct RestConfig {
    pub base_url: String,
    pub workspace_id: String,
    pub timeout: Duration,
}

impl RestConfig {
    pub fn new(base_url: impl Into<String>, workspace_id: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            workspace_id: workspace_id.into(),
            timeout: Duration::from_secs(15),
        }
    }
}

/// Options for `update_task`. Mirrors the wire headers.
#[derive(Debug, Clone, Default)]
pub struct UpdateOptions {
    pub force: bool,
    pub vector_clock: Option<VectorClock>,
    pub conflict_resolution: Option<String>,
}

#[derive(Clone)]
pub struct RestClient {
    cfg: RestConfig,
    http: reqwest::Client,
}

impl RestClient {
    pub fn new(cfg: RestConfig) -> Self {
        let http = reqwest::Client::builder()
            .timeout(cfg.timeout)
            .build()
            .expect("reqwest client construction must not fail");
        Self { cfg, http }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{path}", self.cfg.base_url.trim_end_matches('/'))
    }

    /// Authoritative resync: canonical tasks plus the users map.
    pub async fn fetch_tasks(&self) -> Result<TasksResyncResponse, TransportError> {
        let resp = self
            .http
            .get(self.url("/api/tasks"))
            .query(&[("workspace_id", self.cfg.workspace_id.as_str())])
            .send()
            .await
            .map_err(to_transport_error)?;
        read_json(resp).await
    }

    pub async fn create_task(&self, task: &Task) -> Result<Task, TransportError> {
        let resp = self
            .http
            .post(self.url("/api/tasks"))
            .json(task)
            .send()
            .await
            .map_err(to_transport_error)?;
        read_json(resp).await
    }

    pub async fn update_task(
        &self,
        id: &str,
        patch: &Value,
        opts: &UpdateOptions,
    ) -> Result<Task, TransportError> {
        let mut req = self
            .http
            .put(self.url(&format!("/api/tasks/{id}")))
            .json(patch);

        if opts.force {
            req = req.header(HDR_FORCE_UPDATE, "true");
        }
        if let Some(clock) = &opts.vector_clock {
            let encoded = serde_json::to_string(clock)
                .map_err(|e| TransportError::Protocol(e.to_string()))?;
            req = req.header(HDR_VECTOR_CLOCK, encoded);
        }
        if let Some(strategy) = &opts.conflict_resolution {
            req = req.header(HDR_CONFLICT_RESOLUTION, strategy.as_str());
        }

        let resp = req.send().await.map_err(to_transport_error)?;
        read_json(resp).await
    }

    pub async fn delete_task(&self, id: &str) -> Result<(), TransportError> {
        let resp = self
            .http
            .delete(self.url(&format!("/api/tasks/{id}")))
            .send()
            .await
            .map_err(to_transport_error)?;
        check_status(resp).await.map(|_| ())
    }

    pub async fn transcript_context(&self, task_id: &str) -> Result<Value, TransportError> {
        let resp = self
            .http
            .get(self.url(&format!("/api/tasks/{task_id}/transcript-context")))
            .send()
            .await
            .map_err(to_transport_error)?;
        read_json(resp).await
    }

    pub async fn clusters(&self) -> Result<Value, TransportError> {
        let resp = self
            .http
            .get(self.url("/api/tasks/clusters"))
            .query(&[("workspace_id", self.cfg.workspace_id.as_str())])
            .send()
            .await
            .map_err(to_transport_error)?;
        read_json(resp).await
    }

    pub async fn ledger_status(&self) -> Result<Value, TransportError> {
        let resp = self
            .http
            .get(self.url("/api/tasks/ledger/status"))
            .send()
            .await
            .map_err(to_transport_error)?;
        read_json(resp).await
    }

    pub async fn ledger_compact(&self) -> Result<Value, TransportError> {
        let resp = self
            .http
            .post(self.url("/api/tasks/ledger/compact"))
            .send()
            .await
            .map_err(to_transport_error)?;
        read_json(resp).await
    }

    /// Open the AI proposal stream. The returned iterator yields typed
    /// events; dropping it or calling `abort` cancels the underlying request
    /// cooperatively — an aborted stream neither resolves nor mutates state.
    pub async fn proposal_stream(&self, request: &Value) -> Result<ProposalStream, TransportError> {
        let resp = self
            .http
            .post(self.url("/api/tasks/ai-proposals/stream"))
            .json(request)
            .send()
            .await
            .map_err(to_transport_error)?;
        let resp = check_status(resp).await?;

        let (tx, rx) = mpsc::channel::<ProposalStreamEvent>(32);
        let reader = tokio::spawn(async move {
            let mut body = resp.bytes_stream();
            let mut buffer = String::new();

            while let Some(chunk) = body.next().await {
                let chunk = match chunk {
                    Ok(c) => c,
                    Err(e) => {
                        debug!(error = %e, "proposal stream body error");
                        let _ = tx
                            .send(ProposalStreamEvent::Error {
                                message: e.to_string(),
                            })
                            .await;
                        return;
                    }
                };
                buffer.push_str(&String::from_utf8_lossy(&chunk));

                while let Some(split) = buffer.find("\n\n") {
                    let block = buffer[..split].to_string();
                    buffer.drain(..split + 2);
                    if let Some(event) = parse_sse_block(&block) {
                        let done = matches!(event, ProposalStreamEvent::Done { .. });
                        if tx.send(event).await.is_err() {
                            return; // consumer dropped the stream
                        }
                        if done {
                            return;
                        }
                    }
                }
            }
        });

        Ok(ProposalStream { rx, reader })
    }
}

/// Typed async iterator over the proposal SSE stream. The consumer drives;
/// cancellation is cooperative via [`ProposalStream::abort`] or drop.
pub struct ProposalStream {
    rx: mpsc::Receiver<ProposalStreamEvent>,
    reader: tokio::task::JoinHandle<()>,
}

impl ProposalStream {
    pub async fn next(&mut self) -> Option<ProposalStreamEvent> {
        self.rx.recv().await
    }

    pub fn abort(&self) {
        self.reader.abort();
    }
}

impl Drop for ProposalStream {
    fn drop(&mut self) {
        self.reader.abort();
    }
}

/// Parse one `event:`/`data:` block into a typed stream event.
fn parse_sse_block(block: &str) -> Option<ProposalStreamEvent> {
    let mut event_name: Option<&str> = None;
    let mut data_lines: Vec<&str> = Vec::new();

    for line in block.lines() {
        if let Some(rest) = line.strip_prefix("event:") {
            event_name = Some(rest.trim());
        } else if let Some(rest) = line.strip_prefix("data:") {
            data_lines.push(rest.trim());
        }
    }

    let name = event_name?;
    let data = data_lines.join("\n");
    let data_value: Value = if data.is_empty() {
        Value::Object(Default::default())
    } else {
        serde_json::from_str(&data).ok()?
    };

    // The wire events are tagged by SSE event name; fold it into the typed
    // representation.
    let mut obj = match data_value {
        Value::Object(map) => map,
        other => {
            let mut map = serde_json::Map::new();
            map.insert("value".into(), other);
            map
        }
    };
    obj.insert("type".into(), Value::String(name.to_string()));

    match serde_json::from_value(Value::Object(obj)) {
        Ok(event) => Some(event),
        Err(e) => {
            warn!(event = name, error = %e, "unparseable proposal stream event");
            None
        }
    }
}

fn to_transport_error(e: reqwest::Error) -> TransportError {
    if e.is_timeout() {
        TransportError::Timeout
    } else if e.is_connect() {
        TransportError::Offline
    } else {
        TransportError::Protocol(e.to_string())
    }
}

async fn check_status(resp: reqwest::Response) -> Result<reqwest::Response, TransportError> {
    let status = resp.status();
    if status.is_success() {
        return Ok(resp);
    }

    let code = status.as_u16();
    let body = resp.text().await.unwrap_or_default();

    // 409 bodies carry the server's current record for client-side merging.
    let server_task = if code == 409 {
        serde_json::from_str::<Value>(&body)
            .ok()
            .and_then(|v| v.get("server_task").cloned())
            .and_then(|v| serde_json::from_value::<Task>(v).ok())
            .map(Box::new)
    } else {
        None
    };

    let message = serde_json::from_str::<Value>(&body)
        .ok()
        .and_then(|v| v.get("message").and_then(|m| m.as_str()).map(String::from))
        .unwrap_or(body);

    Err(TransportError::Server {
        code,
        message,
        server_task,
    })
}

async fn read_json<T: serde::de::DeserializeOwned>(
    resp: reqwest::Response,
) -> Result<T, TransportError> {
    let resp = check_status(resp).await?;
    resp.json::<T>()
        .await
        .map_err(|e| TransportError::Protocol(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sse_blocks_parse_into_typed_events() {
        let block = "event: proposal\ndata: {\"task\": {\"id\": \"t1\", \"title\": \"follow up\", \"workspace_id\": \"ws1\", \"created_at\": \"2024-01-01T00:00:00Z\", \"updated_at\": \"2024-01-01T00:00:00Z\"}}";
        match parse_sse_block(block) {
            Some(ProposalStreamEvent::Proposal { task }) => {
                assert_eq!(task.id, "t1");
                assert_eq!(task.title, "follow up");
            }
            other => panic!("unexpected parse: {other:?}"),
        }

        let done = parse_sse_block("event: done\ndata: {\"count\": 3}");
        assert_eq!(done, Some(ProposalStreamEvent::Done { count: Some(3) }));

        assert!(parse_sse_block("junk without an event").is_none());
    }
}
