use crate::tm::logger::Logger;
use crate::tm::supervisor::{StatusSnapshot, Supervisor};
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::Response;
use axum::routing::get;
use axum::{Json, Router};
use std::net::SocketAddr;
use std::sync::Arc;

/// Optional status/log broadcast channel: a JSON snapshot endpoint plus a
/// WebSocket pushing status and log frames as they happen.
#[derive(Clone)]
struct WebState {
    supervisor: Supervisor,
    logger: Arc<Logger>,
}

pub async fn serve(port: u16, supervisor: Supervisor, logger: Arc<Logger>) -> anyhow::Result<()> {
    let state = WebState {
        supervisor,
        logger: Arc::clone(&logger),
    };
    let app = Router::new()
        .route("/api/status", get(handle_status))
        .route("/ws", get(handle_ws))
        .with_state(state);

    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = tokio::net::TcpListener::bind(addr).await?;
    logger.info(format!("web status server listening on {addr}"));
    axum::serve(listener, app).await?;
    Ok(())
}

async fn handle_status(State(state): State<WebState>) -> Json<StatusSnapshot> {
    Json(state.supervisor.get_status().await)
}

async fn handle_ws(State(state): State<WebState>, ws: WebSocketUpgrade) -> Response {
    ws.on_upgrade(move |socket| client_loop(state, socket))
}

async fn client_loop(state: WebState, mut socket: WebSocket) {
    let mut status_rx = state.supervisor.subscribe_status();
    let mut log_rx = state.logger.subscribe();

    // greet with the current table so the client need not wait for a change
    let snapshot = state.supervisor.get_status().await;
    if send_frame(&mut socket, "status", &snapshot).await.is_err() {
        return;
    }

    loop {
        tokio::select! {
            update = status_rx.recv() => match update {
                Ok(snapshot) => {
                    if send_frame(&mut socket, "status", &snapshot).await.is_err() {
                        break;
                    }
                }
                // lagged: skip ahead, the next snapshot is complete anyway
                Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => continue,
                Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
            },
            line = log_rx.recv() => match line {
                Ok(line) => {
                    if send_frame(&mut socket, "log", &line).await.is_err() {
                        break;
                    }
                }
                Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => continue,
                Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
            },
            incoming = socket.recv() => match incoming {
                Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                Some(Ok(_)) => {}
            },
        }
    }
}

async fn send_frame<T: serde::Serialize>(
    socket: &mut WebSocket,
    kind: &str,
    data: &T,
) -> Result<(), axum::Error> {
    let frame = serde_json::json!({ "type": kind, "data": data });
    socket.send(Message::Text(frame.to_string())).await
}
