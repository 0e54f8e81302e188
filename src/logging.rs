//! Tracing subscriber setup and the per-request summary middleware

use std::{io, time::Instant};

use axum::{
    extract::Request,
    http::header,
    middleware::Next,
    response::Response,
};
use tracing::{info, warn};
use tracing_subscriber::{fmt, EnvFilter};

/// Installs the global subscriber. `RUST_LOG` overrides the default `info` filter.
///
/// Everything is written to stderr: a server on the pipe transport owns stdout for protocol frames.
pub fn init_logging() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .with_target(false)
        .compact()
        .init();
}

pub async fn request_logging_middleware(request: Request, next: Next) -> Response {
    let method = request.method().clone();
    let path = request.uri().path().to_owned();
    let session_id = request
        .uri()
        .query()
        .and_then(session_id_from_query);
    let upgrade = request.headers().contains_key(header::UPGRADE);
    let started_at = Instant::now();

    let response = next.run(request).await;
    let status = response.status().as_u16();
    let duration_ms = started_at.elapsed().as_millis();

    if response.status().is_server_error() {
        warn!(%method, %path, status, duration_ms, "request failed");
    } else {
        info!(
            %method,
            %path,
            status,
            duration_ms,
            session_id = session_id.as_deref(),
            upgrade,
            "request summary"
        );
    }

    response
}

fn session_id_from_query(query: &str) -> Option<String> {
    url::form_urlencoded::parse(query.as_bytes())
        .find(|(key, _)| key == "session_id")
        .map(|(_, id)| id.into_owned())
        .filter(|id| !id.is_empty())
}
