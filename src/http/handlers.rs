//! Axum HTTP handlers for the web server
//!
//! `GET /sse` and `POST /messages` carry the push-stream transport, `GET /mcp` upgrades to the
//! bidirectional WebSocket transport. Each accepted stream gets its own server task.

use std::sync::Arc;

use axum::{
    body::Bytes,
    extract::{ws::WebSocketUpgrade, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};
use uuid::Uuid;

use crate::errors::AppError;
use crate::mcp::{rpc::Message, server::serve_connection};
use crate::transport::{bidirectional, push_stream, TransportKind};
use crate::AppState;

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
}

#[derive(Debug, Serialize)]
pub struct DiscoveryResponse {
    pub name: String,
    pub version: &'static str,
    pub protocol_version: &'static str,
    pub endpoints: DiscoveryEndpoints,
}

#[derive(Debug, Default, Serialize)]
pub struct DiscoveryEndpoints {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sse: Option<&'static str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub messages: Option<&'static str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub websocket: Option<&'static str>,
}

#[derive(Debug, Deserialize)]
pub struct MessagesQuery {
    pub session_id: String,
}

pub async fn health() -> Json<HealthResponse> {
    Json(HealthResponse { status: "ok" })
}

pub async fn discovery(State(state): State<AppState>) -> Json<DiscoveryResponse> {
    let mut endpoints = DiscoveryEndpoints::default();
    if state.transports.contains(&TransportKind::PushStream) {
        endpoints.sse = Some(push_stream::STREAM_PATH);
        endpoints.messages = Some(push_stream::MESSAGES_PATH);
    }
    if state.transports.contains(&TransportKind::BidirectionalStream) {
        endpoints.websocket = Some(bidirectional::SOCKET_PATH);
    }

    Json(DiscoveryResponse {
        name: state.context.info.name.clone(),
        version: env!("CARGO_PKG_VERSION"),
        protocol_version: crate::mcp::schema::PROTOCOL_VERSION,
        endpoints,
    })
}

pub async fn sse_endpoint(State(state): State<AppState>) -> Response {
    let session_id = Uuid::new_v4().to_string();
    info!(session_id = %session_id, "push-stream client connected");

    let (connection, events) = push_stream::accept(&state.streams, session_id.clone());
    let context = state.context.clone();
    tokio::spawn(async move {
        serve_connection(Arc::new(connection), context).await;
        info!(session_id = %session_id, "push-stream session ended");
    });

    events.into_response()
}

pub async fn messages_endpoint(
    State(state): State<AppState>,
    Query(query): Query<MessagesQuery>,
    body: Bytes,
) -> Result<StatusCode, AppError> {
    let message: Message = serde_json::from_slice(&body).map_err(|err| {
        debug!(session_id = %query.session_id, error = %err, "rejecting posted body");
        AppError::bad_request("invalid_message", "body must be a JSON-RPC 2.0 message")
    })?;

    state
        .streams
        .deliver(&query.session_id, message)
        .await
        .map_err(|_| AppError::not_found("session_not_found", "unknown or closed session"))?;

    Ok(StatusCode::ACCEPTED)
}

pub async fn websocket_endpoint(
    State(state): State<AppState>,
    upgrade: WebSocketUpgrade,
) -> Response {
    upgrade.on_upgrade(move |socket| async move {
        info!("bidirectional-stream client connected");
        serve_connection(Arc::new(bidirectional::accept(socket)), state.context).await;
        info!("bidirectional-stream session ended");
    })
}
