//! WebSocket channel: long-lived bidirectional connection with capped
//! exponential reconnect.
//!
//! A single driver task owns the socket. Outbound frames arrive over an
//! mpsc; inbound frames are either routed to a pending request (correlated
//! by the client `event_id`) or fanned out on the push broadcast. On every
//! (re)connect the driver re-emits the subscribe intent and asks for pending
//! reconciliations, so id-mappings broadcast during a disconnection are
//! replayed.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use serde_json::json;
use tokio::sync::{broadcast, mpsc, oneshot, watch, Mutex};
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, warn};
use uuid::Uuid;

use tdk_schemas::{ClientFrame, ServerFrame, VectorClock};

use crate::{ConnState, TaskChannel, TransportError};

#[derive(Debug, Clone)]
pub struct WsConfig {
    pub url: String,
    pub workspace_id: String,
    pub session_id: String,
    /// Domain namespace on the shared workspace channel.
    pub namespace: String,
    pub request_timeout: Duration,
    pub reconnect_base: Duration,
    pub reconnect_cap: Duration,
}

impl WsConfig {
    pub fn new(url: impl Into<String>, workspace_id: impl Into<String>, session_id: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            workspace_id: workspace_id.into(),
            session_id: session_id.into(),
            namespace: "tasks".into(),
            request_timeout: Duration::from_secs(10),
            reconnect_base: Duration::from_millis(500),
            reconnect_cap: Duration::from_secs(30),
        }
    }
}

type PendingMap = Arc<Mutex<HashMap<String, oneshot::Sender<ServerFrame>>>>;

pub struct WsChannel {
    cfg: WsConfig,
    out_tx: mpsc::Sender<ClientFrame>,
    push_tx: broadcast::Sender<ServerFrame>,
    state_rx: watch::Receiver<ConnState>,
    pending: PendingMap,
    driver: tokio::task::JoinHandle<()>,
}

impl WsChannel {
    /// Spawn the driver and return the channel handle. The driver keeps
    /// reconnecting until [`WsChannel::shutdown`] or drop.
    pub fn connect(cfg: WsConfig) -> Arc<Self> {
        let (out_tx, out_rx) = mpsc::channel::<ClientFrame>(64);
        let (push_tx, _) = broadcast::channel::<ServerFrame>(256);
        let (state_tx, state_rx) = watch::channel(ConnState::Offline);
        let pending: PendingMap = Arc::new(Mutex::new(HashMap::new()));

        let driver = tokio::spawn(drive(
            cfg.clone(),
            out_rx,
            push_tx.clone(),
            state_tx,
            Arc::clone(&pending),
        ));

        Arc::new(Self {
            cfg,
            out_tx,
            push_tx,
            state_rx,
            pending,
            driver,
        })
    }

    pub fn shutdown(&self) {
        self.driver.abort();
    }

    fn is_online(&self) -> bool {
        *self.state_rx.borrow() == ConnState::Online
    }
}

impl Drop for WsChannel {
    fn drop(&mut self) {
        self.driver.abort();
    }
}

#[async_trait]
impl TaskChannel for WsChannel {
    async fn send(&self, frame: ClientFrame) -> Result<(), TransportError> {
        if !self.is_online() {
            return Err(TransportError::Offline);
        }
        self.out_tx
            .send(frame)
            .await
            .map_err(|_| TransportError::Closed)
    }

    async fn request(&self, frame: ClientFrame) -> Result<ServerFrame, TransportError> {
        if !self.is_online() {
            return Err(TransportError::Offline);
        }

        let (tx, rx) = oneshot::channel();
        let key = frame.event_id.clone();
        self.pending.lock().await.insert(key.clone(), tx);

        if self.out_tx.send(frame).await.is_err() {
            self.pending.lock().await.remove(&key);
            return Err(TransportError::Closed);
        }

        match tokio::time::timeout(self.cfg.request_timeout, rx).await {
            Ok(Ok(frame)) => match frame {
                ServerFrame::Error {
                    code,
                    message,
                    server_task,
                    ..
                } => Err(TransportError::Server {
                    code,
                    message,
                    server_task: server_task.map(Box::new),
                }),
                ok => Ok(ok),
            },
            Ok(Err(_)) => Err(TransportError::Closed),
            Err(_) => {
                self.pending.lock().await.remove(&key);
                Err(TransportError::Timeout)
            }
        }
    }

    fn incoming(&self) -> broadcast::Receiver<ServerFrame> {
        self.push_tx.subscribe()
    }

    fn conn_state(&self) -> watch::Receiver<ConnState> {
        self.state_rx.clone()
    }
}

async fn drive(
    cfg: WsConfig,
    mut out_rx: mpsc::Receiver<ClientFrame>,
    push_tx: broadcast::Sender<ServerFrame>,
    state_tx: watch::Sender<ConnState>,
    pending: PendingMap,
) {
    let mut attempt: u32 = 0;

    loop {
        match connect_async(cfg.url.as_str()).await {
            Ok((ws, _resp)) => {
                info!(url = %cfg.url, "task channel connected");
                attempt = 0;
                let _ = state_tx.send(ConnState::Online);

                let (mut sink, mut stream) = ws.split();

                // Reconnection contract: subscribe, then replay any
                // id-mappings missed while away.
                for frame in [subscribe_frame(&cfg), pending_reconciliations_frame(&cfg)] {
                    if let Ok(text) = serde_json::to_string(&frame) {
                        if sink.send(Message::Text(text)).await.is_err() {
                            break;
                        }
                    }
                }

                loop {
                    tokio::select! {
                        maybe_out = out_rx.recv() => {
                            match maybe_out {
                                Some(frame) => {
                                    let text = match serde_json::to_string(&frame) {
                                        Ok(t) => t,
                                        Err(e) => {
                                            warn!(error = %e, "dropping unserializable outbound frame");
                                            continue;
                                        }
                                    };
                                    if sink.send(Message::Text(text)).await.is_err() {
                                        break;
                                    }
                                }
                                None => {
                                    let _ = state_tx.send(ConnState::Offline);
                                    return;
                                }
                            }
                        }
                        maybe_msg = stream.next() => {
                            match maybe_msg {
                                Some(Ok(Message::Text(text))) => {
                                    route_inbound(&text, &push_tx, &pending).await;
                                }
                                Some(Ok(Message::Ping(data))) => {
                                    let _ = sink.send(Message::Pong(data)).await;
                                }
                                Some(Ok(Message::Close(_))) | None => break,
                                Some(Ok(_)) => {}
                                Some(Err(e)) => {
                                    warn!(error = %e, "task channel read error");
                                    break;
                                }
                            }
                        }
                    }
                }

                let _ = state_tx.send(ConnState::Offline);
                fail_pending(&pending).await;
            }
            Err(e) => {
                debug!(error = %e, attempt, "task channel connect failed");
                let _ = state_tx.send(ConnState::Offline);
            }
        }

        let delay = reconnect_delay(&cfg, attempt);
        attempt = attempt.saturating_add(1);
        tokio::time::sleep(delay).await;
    }
}

async fn route_inbound(text: &str, push_tx: &broadcast::Sender<ServerFrame>, pending: &PendingMap) {
    let frame: ServerFrame = match serde_json::from_str(text) {
        Ok(f) => f,
        Err(e) => {
            warn!(error = %e, "unparseable server frame");
            return;
        }
    };

    if let Some(event_id) = frame.correlates_to() {
        if let Some(tx) = pending.lock().await.remove(event_id) {
            let _ = tx.send(frame);
            return;
        }
    }
    let _ = push_tx.send(frame);
}

/// A dropped connection answers every in-flight request with `Closed` by
/// dropping its oneshot sender.
async fn fail_pending(pending: &PendingMap) {
    pending.lock().await.clear();
}

fn reconnect_delay(cfg: &WsConfig, attempt: u32) -> Duration {
    let base = cfg.reconnect_base.as_millis() as u64;
    let cap = cfg.reconnect_cap.as_millis() as u64;
    let exp = base.saturating_mul(1u64 << attempt.min(16));
    Duration::from_millis(exp.min(cap))
}

fn subscribe_frame(cfg: &WsConfig) -> ClientFrame {
    ClientFrame {
        namespace: cfg.namespace.clone(),
        event_id: format!("sub_{}", Uuid::new_v4().simple()),
        event_type: "tasks_ws_subscribe".into(),
        workspace_id: cfg.workspace_id.clone(),
        vector_clock: VectorClock::new(),
        checksum: None,
        session_id: Some(cfg.session_id.clone()),
        payload: json!({ "workspace_id": cfg.workspace_id }),
    }
}

fn pending_reconciliations_frame(cfg: &WsConfig) -> ClientFrame {
    ClientFrame {
        namespace: cfg.namespace.clone(),
        event_id: format!("rec_{}", Uuid::new_v4().simple()),
        event_type: "reconciliations:get_pending".into(),
        workspace_id: cfg.workspace_id.clone(),
        vector_clock: VectorClock::new(),
        checksum: None,
        session_id: Some(cfg.session_id.clone()),
        payload: json!({ "workspace_id": cfg.workspace_id }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reconnect_delay_doubles_to_cap() {
        let cfg = WsConfig::new("ws://localhost:1", "ws1", "sess");
        assert_eq!(reconnect_delay(&cfg, 0), Duration::from_millis(500));
        assert_eq!(reconnect_delay(&cfg, 1), Duration::from_millis(1000));
        assert_eq!(reconnect_delay(&cfg, 2), Duration::from_millis(2000));
        // Far past the cap the delay pins there.
        assert_eq!(reconnect_delay(&cfg, 30), Duration::from_secs(30));
    }
}
