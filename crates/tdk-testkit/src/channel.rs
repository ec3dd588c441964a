//! The fake server side of the task channel.
//!
//! Deterministic: requests are answered by an injectable responder (default:
//! positive ack), pushes are scripted by the test, and connectivity is
//! toggled explicitly so offline→online transitions can be exercised.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::json;
use tokio::sync::{broadcast, watch, Mutex};

use tdk_schemas::{ClientFrame, ServerFrame};
use tdk_transport::{ConnState, TaskChannel, TransportError};

type Responder = Box<dyn Fn(&ClientFrame) -> ServerFrame + Send + Sync>;

pub struct InMemoryChannel {
    state_tx: watch::Sender<ConnState>,
    state_rx: watch::Receiver<ConnState>,
    push_tx: broadcast::Sender<ServerFrame>,
    sent: Mutex<Vec<ClientFrame>>,
    responder: Mutex<Option<Responder>>,
}

impl InMemoryChannel {
    /// Starts offline; call [`InMemoryChannel::set_online`] to connect.
    pub fn new() -> Arc<Self> {
        let (state_tx, state_rx) = watch::channel(ConnState::Offline);
        let (push_tx, _) = broadcast::channel(256);
        Arc::new(Self {
            state_tx,
            state_rx,
            push_tx,
            sent: Mutex::new(Vec::new()),
            responder: Mutex::new(None),
        })
    }

    pub fn set_online(&self, online: bool) {
        let state = if online {
            ConnState::Online
        } else {
            ConnState::Offline
        };
        let _ = self.state_tx.send(state);
    }

    /// Push a server frame to every subscriber, as the live socket would.
    pub fn push(&self, frame: ServerFrame) {
        let _ = self.push_tx.send(frame);
    }

    /// Script how requests are answered.
    pub async fn set_responder(
        &self,
        f: impl Fn(&ClientFrame) -> ServerFrame + Send + Sync + 'static,
    ) {
        *self.responder.lock().await = Some(Box::new(f));
    }

    /// Everything the client has sent, in order.
    pub async fn sent_frames(&self) -> Vec<ClientFrame> {
        self.sent.lock().await.clone()
    }

    async fn answer(&self, frame: &ClientFrame) -> ServerFrame {
        match self.responder.lock().await.as_ref() {
            Some(f) => f(frame),
            None => ServerFrame::Ack {
                event_id: frame.event_id.clone(),
                result: json!({}),
            },
        }
    }
}

#[async_trait]
impl TaskChannel for InMemoryChannel {
    async fn send(&self, frame: ClientFrame) -> Result<(), TransportError> {
        if *self.state_rx.borrow() == ConnState::Offline {
            return Err(TransportError::Offline);
        }
        self.sent.lock().await.push(frame);
        Ok(())
    }

    async fn request(&self, frame: ClientFrame) -> Result<ServerFrame, TransportError> {
        if *self.state_rx.borrow() == ConnState::Offline {
            return Err(TransportError::Offline);
        }
        let response = self.answer(&frame).await;
        self.sent.lock().await.push(frame);

        match response {
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
        }
    }

    fn incoming(&self) -> broadcast::Receiver<ServerFrame> {
        self.push_tx.subscribe()
    }

    fn conn_state(&self) -> watch::Receiver<ConnState> {
        self.state_rx.clone()
    }
}
