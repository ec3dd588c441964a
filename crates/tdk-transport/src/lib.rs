//! Transport seam: one bidirectional channel per workspace plus a REST
//! fallback.
//!
//! [`TaskChannel`] is the single choke-point through which the engine talks
//! to the server. The production implementation is [`WsChannel`]
//! (tokio-tungstenite, auto-reconnect); tests substitute an in-memory
//! channel behind the same trait.

use async_trait::async_trait;
use tokio::sync::{broadcast, watch};

use tdk_schemas::{ClientFrame, ServerFrame, Task};

mod rest;
mod ws;

pub use rest::{ProposalStream, RestClient, RestConfig, UpdateOptions};
pub use ws::{WsChannel, WsConfig};

/// Channel connectivity as observed by the driver task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnState {
    Offline,
    Online,
}

/// Broad handling class for a transport failure (spec'd per status family).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Retried with backoff.
    Transient,
    /// 409 — resolved by the merger.
    Conflict,
    /// 422 — surfaced to the caller, never retried.
    Validation,
    /// 404 — local delete is the corrective action.
    NotFound,
    /// 401/403 — propagated to the boot layer.
    Auth,
}

/// Failure of a channel or REST operation.
#[derive(Debug, Clone)]
pub enum TransportError {
    /// Not connected; the caller should queue instead.
    Offline,
    /// No answer within the request timeout.
    Timeout,
    /// The channel driver has shut down.
    Closed,
    /// Malformed frame or protocol violation.
    Protocol(String),
    /// The server answered with an error frame / non-2xx status.
    Server {
        code: u16,
        message: String,
        /// Present on 409 conflicts: the server's current record.
        server_task: Option<Box<Task>>,
    },
}

impl TransportError {
    pub fn class(&self) -> ErrorClass {
        match self {
            TransportError::Offline | TransportError::Timeout | TransportError::Closed => {
                ErrorClass::Transient
            }
            TransportError::Protocol(_) => ErrorClass::Transient,
            TransportError::Server { code, .. } => match code {
                409 => ErrorClass::Conflict,
                422 => ErrorClass::Validation,
                404 => ErrorClass::NotFound,
                401 | 403 => ErrorClass::Auth,
                _ => ErrorClass::Transient,
            },
        }
    }
}

impl std::fmt::Display for TransportError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TransportError::Offline => write!(f, "transport offline"),
            TransportError::Timeout => write!(f, "request timed out"),
            TransportError::Closed => write!(f, "channel closed"),
            TransportError::Protocol(msg) => write!(f, "protocol error: {msg}"),
            TransportError::Server { code, message, .. } => {
                write!(f, "server error {code}: {message}")
            }
        }
    }
}

impl std::error::Error for TransportError {}

/// The engine's outbound seam. One instance per workspace.
#[async_trait]
pub trait TaskChannel: Send + Sync {
    /// Fire-and-forget send. Fails fast with [`TransportError::Offline`]
    /// when disconnected so the caller can queue instead.
    async fn send(&self, frame: ClientFrame) -> Result<(), TransportError>;

    /// Request/response: send and await the correlated ack or error frame.
    async fn request(&self, frame: ClientFrame) -> Result<ServerFrame, TransportError>;

    /// Server-push stream (uncorrelated frames).
    fn incoming(&self) -> broadcast::Receiver<ServerFrame>;

    /// Connectivity watch. Offline→Online transitions trigger queue replay.
    fn conn_state(&self) -> watch::Receiver<ConnState>;
}
