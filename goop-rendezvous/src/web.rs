//! HTTP rendezvous surface (spec.md §4.3, §6): presence publish/fan-out,
//! relay info, admin snapshots, registration, and the template store.
//!
//! Grounded on the teacher's `web.rs` router-building shape (one `Router`,
//! `with_state`, routes grouped by concern) though the handlers themselves
//! are new — the teacher's IRC/WebSocket bridge has no counterpart here.

use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use axum::extract::{ConnectInfo, Path as AxPath, Query, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{Html, IntoResponse, Json};
use axum::routing::{get, post};
use axum::Router;
use serde::Deserialize;
use tokio_stream::wrappers::ReceiverStream;
use tokio_stream::{Stream, StreamExt};

use crate::model::PresenceMessage;
use crate::state::SharedState;
use crate::templates::TemplateStore;

pub struct AppState {
    pub shared: Arc<SharedState>,
    pub templates: Option<TemplateStore>,
}

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/publish", post(publish))
        .route("/events", get(events))
        .route("/relay", get(relay))
        .route("/register", post(register))
        .route("/verify", get(verify))
        .route("/peers.json", get(peers_json))
        .route("/logs.json", get(logs_json))
        .route("/registrations.json", get(registrations_json))
        .route("/admin", get(admin_page))
        .route("/api/templates", get(templates_list))
        .route("/api/templates/{dir}/manifest", get(templates_manifest))
        .route("/api/templates/{dir}/bundle", get(templates_bundle))
        .with_state(state)
}

async fn healthz() -> impl IntoResponse {
    (StatusCode::OK, "ok")
}

async fn publish(
    State(state): State<Arc<AppState>>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    Json(msg): Json<PresenceMessage>,
) -> impl IntoResponse {
    if let Err(e) = msg.validate() {
        state.shared.push_log("rendezvous", "warn", format!("rejected publish: {e}"));
        return (StatusCode::BAD_REQUEST, e.to_string()).into_response();
    }
    if !state.shared.rate_limiter.allow(addr.ip()) {
        return (StatusCode::TOO_MANY_REQUESTS, "rate limited").into_response();
    }
    if !state.shared.gate.allow_publish(&msg.peer_id).await {
        return (StatusCode::FORBIDDEN, "registration required").into_response();
    }

    let verified_floor = false;
    state.shared.apply_presence(&msg, verified_floor);

    if let Ok(payload) = serde_json::to_string(&msg) {
        state.shared.sse.broadcast(&payload);
    }
    StatusCode::NO_CONTENT.into_response()
}

/// SSE stream (spec.md §4.3): global cap 1024, per-IP cap 10, 25 s
/// keep-alive comment, slow-subscriber messages dropped rather than
/// blocking the broadcaster.
async fn events(
    State(state): State<Arc<AppState>>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
) -> impl IntoResponse {
    let ip: IpAddr = addr.ip();
    let Some(sub) = state.shared.sse.subscribe(ip) else {
        return (StatusCode::TOO_MANY_REQUESTS, "too many subscribers").into_response();
    };
    let id = sub.id;
    let shared = state.shared.clone();
    let stream = ReceiverStream::new(sub.rx).map(move |payload| Ok::<_, std::convert::Infallible>(Event::default().data(payload)));
    let guarded = UnsubscribeOnDrop { shared, id, inner: Some(stream) };
    Sse::new(guarded).keep_alive(KeepAlive::new().interval(Duration::from_secs(25)).text("keep-alive")).into_response()
}

/// Wraps the subscriber stream so dropping it (client disconnect) also
/// releases the SSE registry slot.
struct UnsubscribeOnDrop<S> {
    shared: Arc<SharedState>,
    id: u64,
    inner: Option<S>,
}

impl<S: Stream + Unpin> Stream for UnsubscribeOnDrop<S> {
    type Item = S::Item;

    fn poll_next(
        mut self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<Option<Self::Item>> {
        match self.inner.as_mut() {
            Some(inner) => std::pin::Pin::new(inner).poll_next(cx),
            None => std::task::Poll::Ready(None),
        }
    }
}

impl<S> Drop for UnsubscribeOnDrop<S> {
    fn drop(&mut self) {
        self.shared.sse.unsubscribe(self.id);
    }
}

async fn relay(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    match state.shared.relay_info.lock().clone() {
        Some(info) => Json(info).into_response(),
        None => StatusCode::NOT_FOUND.into_response(),
    }
}

#[derive(Deserialize)]
struct RegisterRequest {
    peer_id: String,
    email: Option<String>,
}

async fn register(State(state): State<Arc<AppState>>, Json(req): Json<RegisterRequest>) -> impl IntoResponse {
    let Some(db) = &state.shared.db else {
        return (StatusCode::SERVICE_UNAVAILABLE, "registration requires persistence").into_response();
    };
    let token = crate::msgid::generate();
    match db.insert_registration(&token, &req.peer_id, req.email.as_deref()) {
        Ok(()) => Json(serde_json::json!({ "token": token })).into_response(),
        Err(e) => (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response(),
    }
}

#[derive(Deserialize)]
struct VerifyQuery {
    token: String,
}

async fn verify(State(state): State<Arc<AppState>>, Query(q): Query<VerifyQuery>) -> impl IntoResponse {
    let Some(db) = &state.shared.db else {
        return (StatusCode::SERVICE_UNAVAILABLE, "registration requires persistence").into_response();
    };
    match db.verify_registration(&q.token) {
        Ok(Some(peer_id)) => Json(serde_json::json!({ "peer_id": peer_id, "verified": true })).into_response(),
        Ok(None) => (StatusCode::NOT_FOUND, "unknown token").into_response(),
        Err(e) => (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response(),
    }
}

fn check_basic_auth(state: &AppState, headers: &HeaderMap) -> bool {
    let Some(expected) = &state.shared.admin_password else { return true };
    let Some(value) = headers.get(header::AUTHORIZATION).and_then(|v| v.to_str().ok()) else { return false };
    let Some(encoded) = value.strip_prefix("Basic ") else { return false };
    use base64::Engine;
    let Ok(decoded) = base64::engine::general_purpose::STANDARD.decode(encoded) else { return false };
    let Ok(text) = String::from_utf8(decoded) else { return false };
    match text.split_once(':') {
        Some(("admin", pass)) => pass == expected,
        _ => false,
    }
}

fn unauthorized() -> axum::response::Response {
    let mut resp = (StatusCode::UNAUTHORIZED, "authentication required").into_response();
    resp.headers_mut().insert(header::WWW_AUTHENTICATE, header::HeaderValue::from_static("Basic realm=\"goop-rendezvous\""));
    resp
}

async fn peers_json(State(state): State<Arc<AppState>>, headers: HeaderMap) -> impl IntoResponse {
    if !check_basic_auth(&state, &headers) {
        return unauthorized();
    }
    (StatusCode::OK, [(header::CONTENT_TYPE, "application/json")], state.shared.peers_snapshot_json()).into_response()
}

async fn logs_json(State(state): State<Arc<AppState>>, headers: HeaderMap) -> impl IntoResponse {
    if !check_basic_auth(&state, &headers) {
        return unauthorized();
    }
    Json(state.shared.logs_snapshot()).into_response()
}

async fn registrations_json(State(state): State<Arc<AppState>>, headers: HeaderMap) -> impl IntoResponse {
    if !check_basic_auth(&state, &headers) {
        return unauthorized();
    }
    let Some(db) = &state.shared.db else {
        return Json(Vec::<serde_json::Value>::new()).into_response();
    };
    match db.list_registrations() {
        Ok(rows) => Json(
            rows.into_iter()
                .map(|(token, peer_id, verified)| serde_json::json!({ "token": token, "peer_id": peer_id, "verified": verified }))
                .collect::<Vec<_>>(),
        )
        .into_response(),
        Err(e) => (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response(),
    }
}

async fn admin_page(State(state): State<Arc<AppState>>, headers: HeaderMap) -> impl IntoResponse {
    if !check_basic_auth(&state, &headers) {
        return unauthorized();
    }
    let body = format!(
        "<html><body><h1>goop-rendezvous</h1><p>{} peers online</p><p>{} SSE subscribers</p></body></html>",
        state.shared.peer_count(),
        state.shared.sse.subscriber_count(),
    );
    Html(body).into_response()
}

async fn templates_list(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    match &state.templates {
        Some(store) => Json(store.list()).into_response(),
        None => Json(Vec::<String>::new()).into_response(),
    }
}

async fn templates_manifest(State(state): State<Arc<AppState>>, AxPath(dir): AxPath<String>) -> impl IntoResponse {
    match state.templates.as_ref().and_then(|t| t.manifest(&dir)) {
        Some(json) => (StatusCode::OK, [(header::CONTENT_TYPE, "application/json")], json).into_response(),
        None => StatusCode::NOT_FOUND.into_response(),
    }
}

async fn templates_bundle(State(state): State<Arc<AppState>>, AxPath(dir): AxPath<String>) -> impl IntoResponse {
    match state.templates.as_ref().and_then(|t| t.bundle(&dir)) {
        Some(bytes) => (StatusCode::OK, [(header::CONTENT_TYPE, "application/gzip")], bytes).into_response(),
        None => StatusCode::NOT_FOUND.into_response(),
    }
}

/// Starts the rendezvous HTTP surface and returns once bound.
pub async fn serve(addr: SocketAddr, state: Arc<AppState>) -> anyhow::Result<()> {
    let app = router(state);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!(%addr, "goop-rendezvous HTTP surface listening");
    tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, app.into_make_service_with_connect_info::<SocketAddr>()).await {
            tracing::error!("rendezvous http server exited: {e}");
        }
    });
    Ok(())
}
