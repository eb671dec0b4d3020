//! Thin signaling acceptor: an `axum` `/health` endpoint plus a raw TCP
//! accept loop handing each connection straight to the session manager.

use axum::{extract::State, routing::get, Json, Router};
use serde::Serialize;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::{error, info};

use crate::config::Config;
use crate::session::SessionManager;

#[derive(Clone)]
struct HealthState {
    config: Arc<Config>,
    sessions: Arc<SessionManager>,
}

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    version: &'static str,
    active_sessions: usize,
}

async fn health_handler(State(state): State<HealthState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
        active_sessions: state.sessions.session_count(),
    })
}

/// Runs the `/health` HTTP server. Intended to run alongside
/// [`run_signaling_loop`] for the lifetime of the process.
pub async fn run_health_server(bind_addr: &str, config: Arc<Config>, sessions: Arc<SessionManager>) -> anyhow::Result<()> {
    let state = HealthState { config, sessions };
    let app = Router::new().route("/health", get(health_handler)).with_state(state);

    let listener = TcpListener::bind(bind_addr).await?;
    info!(bind_addr, "health endpoint listening");
    axum::serve(listener, app).await?;
    Ok(())
}

/// Accepts raw TCP connections on `bind_addr` and hands each to the session
/// manager, which performs the WebSocket upgrade itself (the orchestrator
/// owns the handshake so it can run the signaling exchange directly over the
/// same socket).
pub async fn run_signaling_loop(bind_addr: &str, sessions: Arc<SessionManager>, test_mode: bool) -> anyhow::Result<()> {
    let listener = TcpListener::bind(bind_addr).await?;
    info!(bind_addr, "signaling server listening");

    loop {
        let (stream, peer) = listener.accept().await?;
        info!(%peer, "incoming signaling connection");
        let sessions = sessions.clone();
        tokio::spawn(async move {
            if let Err(e) = sessions.accept(stream, test_mode).await {
                error!(%peer, error = %e, "session ended with error");
            }
        });
    }
}
