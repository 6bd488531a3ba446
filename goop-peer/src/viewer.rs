//! Local viewer HTTP surface (spec.md §4.8 "browser media delivery",
//! §6 `viewer.http_addr`): a small axum server exposing `/healthz` and a
//! per-call WebSocket that remuxes WebRTC media to live WebM for a
//! browser's Media Source Extensions, since the embedded webview on some
//! platforms has no native `RTCPeerConnection`.
//!
//! Grounded on the teacher's `web.rs` WebSocket bridge: a background task
//! owns the `WebSocket` and forwards data in one direction, here driven by
//! a `broadcast::Receiver<BytesMut>` rather than a duplex IRC stream since
//! delivery is server-to-browser only.

use std::sync::Arc;

use axum::extract::ws::{Message as WsMessage, WebSocket};
use axum::extract::{Path, State, WebSocketUpgrade};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;

use crate::call::CallManager;

#[derive(Clone)]
struct ViewerState {
    calls: Arc<CallManager>,
}

pub fn router(calls: Arc<CallManager>) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/call/{channel}/ws", get(call_ws))
        .with_state(ViewerState { calls })
}

async fn healthz() -> impl IntoResponse {
    (StatusCode::OK, "ok")
}

async fn call_ws(
    Path(channel): Path<String>,
    State(state): State<ViewerState>,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    let Some(session) = state.calls.session(&channel) else {
        return (StatusCode::NOT_FOUND, "no such call session").into_response();
    };
    ws.on_upgrade(move |socket| stream_call_media(socket, session))
}

/// Replays the cached init segment and last keyframe cluster (so a
/// newly-connecting browser starts from a clean decoder state), then
/// forwards every subsequently produced chunk until the session hangs up
/// or the socket closes.
async fn stream_call_media(mut socket: WebSocket, session: Arc<crate::call::CallSession>) {
    let mut rx = session.mux.subscribe();
    for chunk in session.mux.replay_cache() {
        if socket.send(WsMessage::Binary(chunk.freeze())).await.is_err() {
            return;
        }
    }
    loop {
        tokio::select! {
            chunk = rx.recv() => {
                match chunk {
                    Ok(bytes) => {
                        if socket.send(WsMessage::Binary(bytes.freeze())).await.is_err() {
                            return;
                        }
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => return,
                }
            }
            _ = session.wait_for_hangup() => return,
            frame = socket.recv() => {
                if frame.is_none() {
                    return;
                }
            }
        }
    }
}

/// Spawns the viewer HTTP server bound to `addr`, returning once the
/// listener is up. Runs until the process exits.
pub async fn serve(addr: std::net::SocketAddr, calls: Arc<CallManager>) -> crate::error::GoopResult<()> {
    let app = router(calls);
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .map_err(|e| crate::error::GoopError::Fatal(format!("viewer http bind {addr}: {e}")))?;
    tracing::info!(%addr, "viewer http surface listening");
    tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, app).await {
            tracing::warn!("viewer http server exited: {e}");
        }
    });
    Ok(())
}
