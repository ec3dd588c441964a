//! Minimal REST stub for the idle-sync and prefetch paths.
//!
//! Serves the handful of endpoints the background loops hit, from state the
//! test controls. Bound to an ephemeral localhost port.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::State;
use axum::routing::get;
use axum::{Json, Router};
use serde_json::{json, Value};
use tokio::sync::Mutex;

use tdk_schemas::Task;

#[derive(Clone)]
pub struct FakeApi {
    pub addr: SocketAddr,
    state: Arc<ApiState>,
}

struct ApiState {
    tasks: Mutex<Vec<Task>>,
    /// Artificial latency, for abort tests.
    delay: Mutex<Duration>,
}

impl FakeApi {
    pub fn base_url(&self) -> String {
        format!("http://{}", self.addr)
    }

    pub async fn set_tasks(&self, tasks: Vec<Task>) {
        *self.state.tasks.lock().await = tasks;
    }

    pub async fn set_delay(&self, delay: Duration) {
        *self.state.delay.lock().await = delay;
    }
}

/// Bind the stub on an ephemeral port and serve until the handle is dropped.
pub async fn spawn_fake_api(tasks: Vec<Task>) -> anyhow::Result<(FakeApi, tokio::task::JoinHandle<()>)> {
    let state = Arc::new(ApiState {
        tasks: Mutex::new(tasks),
        delay: Mutex::new(Duration::ZERO),
    });

    let app = Router::new()
        .route("/api/tasks", get(list_tasks))
        .route("/api/tasks/clusters", get(slow_value))
        .route("/api/tasks/ledger/status", get(slow_value))
        .route("/api/tasks/:id/transcript-context", get(slow_value))
        .with_state(Arc::clone(&state));

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await?;
    let addr = listener.local_addr()?;
    let server = tokio::spawn(async move {
        let _ = axum::serve(listener, app).await;
    });

    Ok((FakeApi { addr, state }, server))
}

async fn list_tasks(State(state): State<Arc<ApiState>>) -> Json<Value> {
    let tasks = state.tasks.lock().await.clone();
    Json(json!({ "tasks": tasks, "users": {} }))
}

async fn slow_value(State(state): State<Arc<ApiState>>) -> Json<Value> {
    let delay = *state.delay.lock().await;
    if delay > Duration::ZERO {
        tokio::time::sleep(delay).await;
    }
    Json(json!({ "ok": true }))
}
