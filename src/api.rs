use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;

use axum::extract::{ConnectInfo, State, WebSocketUpgrade};
use axum::http::HeaderMap;
use axum::response::Response;
use axum::routing::get;
use axum::{Json, Router};
use serde::Serialize;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tower_http::services::ServeFile;

use crate::config::Mode;
use crate::redirect::{client_address, Admission, RedirectAdvisor};
use crate::ws::{serve_socket, SessionSettings};

#[derive(Clone)]
pub struct AppState {
    pub session: SessionSettings,
    pub advisor: Option<Arc<RedirectAdvisor>>,
    pub mode: Mode,
}

#[derive(Debug, Serialize)]
struct Status {
    streaming: bool,
    consumers: usize,
    mode: Mode,
}

/// `/` serves the viewer page, `/ws` the live stream, `/status` a JSON
/// snapshot of the broadcast supervisor.
pub fn router(state: AppState, index_path: impl AsRef<Path>) -> Router {
    Router::new()
        .route_service("/", ServeFile::new(index_path))
        .route("/ws", get(handle_websocket))
        .route("/status", get(handle_status))
        .with_state(state)
}

async fn handle_websocket(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
) -> Response {
    let client = client_address(&headers, peer);
    let admission = match &state.advisor {
        Some(advisor) => advisor.advise(&client, state.session.supervisor.is_streaming()),
        None => Admission::Admit,
    };
    log::info!("ws {}: connecting ({:?})", client, admission);
    ws.on_upgrade(move |socket| serve_socket(socket, client, admission, state.session))
}

async fn handle_status(State(state): State<AppState>) -> Json<Status> {
    let supervisor = &state.session.supervisor;
    Json(Status {
        streaming: supervisor.is_streaming(),
        consumers: supervisor.consumer_count(),
        mode: state.mode,
    })
}

/// Serves `app` until `cancel` fires.
pub async fn serve(
    listener: TcpListener,
    app: Router,
    cancel: CancellationToken,
) -> anyhow::Result<()> {
    log::info!("http: listening on {}", listener.local_addr()?);
    axum::serve(listener, app.into_make_service_with_connect_info::<SocketAddr>())
        .with_graceful_shutdown(async move {
            cancel.cancelled().await;
            log::info!("http: shutting down");
        })
        .await?;
    Ok(())
}

#[cfg(test)]
#[path = "api_test.rs"]
mod api_test;
