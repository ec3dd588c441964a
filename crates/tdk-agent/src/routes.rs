//! Axum router for the agent's localhost status surface.

use std::convert::Infallible;

use axum::{
    extract::State,
    http::StatusCode,
    response::{
        sse::{Event, KeepAlive, Sse},
        IntoResponse, Response,
    },
    routing::get,
    Json, Router,
};
use futures_util::{Stream, StreamExt};
use serde_json::json;
use tokio::sync::broadcast;
use tokio_stream::wrappers::BroadcastStream;

use tdk_dispatch::TaskNotification;

use crate::state::{uptime_secs, AppState};

/// Build the application router wired to the given shared state. Middleware
/// (CORS, tracing) is attached by `main.rs` so tests can use the bare
/// router.
pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/v1/health", get(health))
        .route("/v1/status", get(status_handler))
        .route("/v1/events", get(events))
        .with_state(state)
}

async fn health(State(st): State<AppState>) -> Json<serde_json::Value> {
    Json(json!({
        "service": st.build.service,
        "version": st.build.version,
        "uptime_secs": uptime_secs(),
    }))
}

async fn status_handler(State(st): State<AppState>) -> Response {
    match st.status().await {
        Ok(snapshot) => Json(snapshot).into_response(),
        Err(e) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({ "error": e.to_string() })),
        )
            .into_response(),
    }
}

/// Domain notifications as SSE, one event per notification.
async fn events(State(st): State<AppState>) -> Response {
    let rx = st.engine.dispatcher.subscribe();
    Sse::new(notifications_to_sse(rx))
        .keep_alive(KeepAlive::new())
        .into_response()
}

fn notifications_to_sse(
    rx: broadcast::Receiver<TaskNotification>,
) -> impl Stream<Item = Result<Event, Infallible>> {
    BroadcastStream::new(rx).filter_map(|msg| async move {
        match msg {
            Ok(n) => {
                let data = serde_json::to_string(&n).ok()?;
                Some(Ok(Event::default().event("task").data(data)))
            }
            Err(_) => None, // lagged / closed
        }
    })
}
