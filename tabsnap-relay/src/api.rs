use std::sync::Arc;

use axum::{
    extract::State,
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::Deserialize;
use serde_json::Value;
use tabsnap::ToolOutput;
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::info;

use crate::relay::{Health, Relay};

#[derive(Debug, Deserialize)]
pub struct InvokeRequest {
    pub name: String,
    #[serde(default)]
    pub args: Value,
}

/// Agent-side HTTP surface of the relay.
pub fn router(relay: Arc<Relay>) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/active/snapshot", get(active_snapshot))
        .route("/session", get(session))
        .route("/invoke", post(invoke))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(relay)
}

async fn healthz(State(relay): State<Arc<Relay>>) -> Json<Health> {
    Json(relay.health())
}

async fn active_snapshot(State(relay): State<Arc<Relay>>) -> Response {
    match relay.active_snapshot() {
        Some(html) => ([(header::CONTENT_TYPE, "text/html; charset=utf-8")], html).into_response(),
        None => (StatusCode::NOT_FOUND, "No active client").into_response(),
    }
}

async fn session(State(relay): State<Arc<Relay>>) -> Json<Value> {
    Json(relay.session().session_config())
}

async fn invoke(
    State(relay): State<Arc<Relay>>,
    Json(request): Json<InvokeRequest>,
) -> Json<ToolOutput> {
    info!(tool = %request.name, "POST /invoke");
    Json(relay.invoke(&request.name, request.args).await)
}
