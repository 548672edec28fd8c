use crate::modbus_logic::state::AppState;
use anyhow::{Context, Result};
use axum::{
    extract::{
        ws::{close_code, CloseFrame, Message, WebSocket, WebSocketUpgrade},
        State,
    },
    response::IntoResponse,
    routing::get,
    Json, Router,
};
use lib_telemetry::core::PollerState;
use lib_telemetry::ingestors::PollStatsSnapshot;
use serde::Serialize;
use std::io;
use std::net::SocketAddr;
use tokio::net::TcpListener;
use tracing::{debug, info};

#[derive(Debug, Serialize)]
pub struct HealthReport {
    pub status: &'static str,
    pub subscribers: usize,
    pub poller: PollerState,
    #[serde(flatten)]
    pub stats: PollStatsSnapshot,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/ws", get(ws_handler))
        .route("/health", get(health_handler))
        .with_state(state)
}

/// Binds the subscriber listener. Failure here is fatal at startup.
pub async fn bind(addr: SocketAddr) -> Result<TcpListener> {
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind subscriber listener on {addr}"))?;
    info!("Downstream server listening on {}", addr);
    Ok(listener)
}

/// Serves `/ws` and `/health` until the shutdown token is cancelled.
pub async fn serve(listener: TcpListener, state: AppState) -> io::Result<()> {
    let shutdown = state.shutdown.clone();
    axum::serve(listener, router(state))
        .with_graceful_shutdown(async move {
            shutdown.cancelled().await;
            info!("Downstream server shutting down.");
        })
        .await
}

async fn ws_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> impl IntoResponse {
    ws.on_upgrade(|socket| handle_socket(socket, state))
}

pub async fn health_handler(State(state): State<AppState>) -> Json<HealthReport> {
    Json(HealthReport {
        status: "ok",
        subscribers: state.registry.len(),
        poller: state.supervisor.state(),
        stats: state.stats.snapshot(),
    })
}

async fn close_with(socket: &mut WebSocket, code: u16, reason: &'static str) {
    let frame = CloseFrame {
        code,
        reason: reason.into(),
    };
    if let Err(e) = socket.send(Message::Close(Some(frame))).await {
        debug!(error = %e, "close frame not delivered");
    }
}

/// One subscriber connection: register, make sure the poller runs, then
/// forward queued frames while watching the socket for close.
async fn handle_socket(mut socket: WebSocket, state: AppState) {
    let (subscriber_id, mut frames) = state.registry.register(state.queue_depth);
    if state.supervisor.ensure_started() {
        info!(subscriber_id, "first subscriber started the poll loop");
    }
    info!(subscriber_id, subscribers = state.registry.len(), "Client connected");

    let reason = loop {
        tokio::select! {
            _ = state.shutdown.cancelled() => {
                close_with(&mut socket, close_code::AWAY, "server shutting down").await;
                break "shutdown";
            }
            // Frames queued by the dispatcher
            frame = frames.recv() => match frame {
                Some(frame) => {
                    if let Err(e) = socket.send(Message::Text(frame.as_ref().into())).await {
                        debug!(subscriber_id, error = %e, "send to subscriber failed");
                        break "send failed";
                    }
                }
                // The dispatcher dropped us, queue overflow under the disconnect policy
                None => {
                    close_with(&mut socket, close_code::AGAIN, "subscriber too slow").await;
                    break "evicted";
                }
            },
            // Inbound frames only signal liveness; payloads are discarded
            inbound = socket.recv() => match inbound {
                Some(Ok(Message::Close(_))) | None => break "closed by peer",
                Some(Err(e)) => {
                    debug!(subscriber_id, error = %e, "subscriber read failed");
                    break "read error";
                }
                Some(Ok(_)) => {}
            },
        }
    };

    state.registry.remove(subscriber_id);
    info!(subscriber_id, reason, subscribers = state.registry.len(), "Client disconnected");
}
