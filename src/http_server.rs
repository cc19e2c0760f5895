//! HTTP server implementation using Axum.

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        Path, State,
    },
    response::Response,
    routing::{get, post},
    Json, Router,
};
use futures_util::{SinkExt, StreamExt};
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio::time::{interval_at, Instant};
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{debug, error, info, warn};

use crate::protocol::{ServiceResponse, ServiceStats};
use crate::session::{RoomSession, OUTBOUND_QUEUE_SIZE};
use crate::state::{AppState, ReconcileReport};

pub fn router(state: AppState) -> Router {
    Router::new()
        // Room sockets
        .route("/ws/:room_key", get(room_socket))
        // Management
        .route("/stats", get(stats))
        .route("/reconcile", post(reconcile))
        // Health check
        .route("/health", get(health))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Serve on `listener` until the process exits. With a `gc_interval`, orphan
/// reconciliation also runs periodically.
pub async fn run_server(
    listener: TcpListener,
    state: AppState,
    gc_interval: Option<Duration>,
) -> std::io::Result<()> {
    if let Some(period) = gc_interval {
        let state = state.clone();
        tokio::spawn(async move {
            let mut interval = interval_at(Instant::now() + period, period);
            loop {
                interval.tick().await;
                state.reconcile_orphans().await;
            }
        });
    }

    info!("Starting HTTP server on {}", listener.local_addr()?);
    axum::serve(listener, router(state)).await
}

async fn health() -> &'static str {
    "OK"
}

async fn stats(State(state): State<AppState>) -> Json<ServiceStats> {
    Json(state.stats().await)
}

async fn reconcile(State(state): State<AppState>) -> Json<ReconcileReport> {
    info!("POST /reconcile");
    Json(state.reconcile_orphans().await)
}

async fn room_socket(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
    Path(room_key): Path<String>,
) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, room_key, state))
}

fn encode(response: &ServiceResponse) -> Option<Message> {
    match response.to_json() {
        Ok(text) => Some(Message::Text(text)),
        Err(e) => {
            error!(error = %e, "Cannot encode response");
            None
        }
    }
}

async fn handle_socket(socket: WebSocket, room_key: String, state: AppState) {
    let (mut sink, stream) = socket.split();

    let cancel = match state.create_session(&room_key).await {
        Ok(cancel) => cancel,
        Err(e) => {
            warn!(room_key = %room_key, error = %e, "Rejecting room socket");
            if let Some(message) = encode(&ServiceResponse::init(Err(e.code()))) {
                let _ = sink.send(message).await;
            }
            let _ = sink.close().await;
            return;
        }
    };

    let (outbound, mut queue) = mpsc::channel::<ServiceResponse>(OUTBOUND_QUEUE_SIZE);
    let writer_key = room_key.clone();
    let writer = tokio::spawn(async move {
        while let Some(response) = queue.recv().await {
            let Some(message) = encode(&response) else { continue };
            if let Err(e) = sink.send(message).await {
                debug!(room_key = %writer_key, error = %e, "Socket write failed");
                break;
            }
        }
        let _ = sink.close().await;
    });

    let mut session = RoomSession::new(
        room_key.clone(),
        state.backend(),
        state.config(),
        outbound,
        cancel,
    );
    session.send(ServiceResponse::init(Ok(()))).await;
    session.read_loop(stream).await;
    session.on_destroy().await;
    state.destroy_session(&room_key).await;
    drop(session);

    if let Err(e) = writer.await {
        warn!(room_key = %room_key, error = %e, "Socket writer panicked");
    }
}
