use std::sync::Arc;

use axum::{
    middleware,
    routing::{get, post},
    Router,
};

pub mod config;
pub mod domain;
pub mod errors;
pub mod http;
pub mod listener;
pub mod logging;
pub mod mcp;
pub mod registry;
pub mod transport;

use mcp::server::ServerContext;
use transport::{bidirectional, push_stream, push_stream::StreamSessions, TransportKind};

#[derive(Clone)]
pub struct AppState {
    pub context: ServerContext,
    pub streams: StreamSessions,
    pub transports: Arc<[TransportKind]>,
}

impl AppState {
    pub fn new(context: ServerContext, transports: Vec<TransportKind>) -> Self {
        Self {
            context,
            streams: StreamSessions::default(),
            transports: Arc::from(transports),
        }
    }
}

/// Routes for the enabled network transports plus health and discovery. Disabled transports
/// have no route at all.
pub fn build_app(state: AppState) -> Router {
    let mut router = Router::new()
        .route("/health", get(http::handlers::health))
        .route("/.well-known/mcp", get(http::handlers::discovery));

    if state.transports.contains(&TransportKind::PushStream) {
        router = router
            .route(push_stream::STREAM_PATH, get(http::handlers::sse_endpoint))
            .route(
                push_stream::MESSAGES_PATH,
                post(http::handlers::messages_endpoint),
            );
    }
    if state.transports.contains(&TransportKind::BidirectionalStream) {
        router = router.route(
            bidirectional::SOCKET_PATH,
            get(http::handlers::websocket_endpoint),
        );
    }

    router
        .layer(middleware::from_fn(logging::request_logging_middleware))
        .with_state(state)
}

#[cfg(test)]
mod tests {
    use axum::{
        body::Body,
        http::{header, Request, StatusCode},
        response::Response,
    };
    use http_body_util::BodyExt;
    use serde_json::{json, Value};
    use tower::ServiceExt;

    use super::*;
    use crate::domain::demo_registry;

    fn app_with(transports: Vec<TransportKind>) -> Router {
        let context = ServerContext::new(demo_registry().expect("demo registry"), "Demo Server");
        build_app(AppState::new(context, transports))
    }

    fn app() -> Router {
        app_with(vec![
            TransportKind::PushStream,
            TransportKind::BidirectionalStream,
        ])
    }

    fn get_request(uri: &str) -> Request<Body> {
        Request::builder()
            .uri(uri)
            .method("GET")
            .body(Body::empty())
            .expect("request build")
    }

    fn post_message(uri: &str, body: &'static str) -> Request<Body> {
        Request::builder()
            .uri(uri)
            .method("POST")
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(body))
            .expect("request build")
    }

    async fn call(app: Router, request: Request<Body>) -> Response {
        app.oneshot(request).await.expect("request execution")
    }

    async fn json_body(response: Response) -> Value {
        let body = response
            .into_body()
            .collect()
            .await
            .expect("collect body")
            .to_bytes();
        serde_json::from_slice(&body).expect("json body")
    }

    #[tokio::test]
    async fn health_is_public() {
        let response = call(app(), get_request("/health")).await;

        assert_eq!(response.status(), StatusCode::OK);
        let body = response
            .into_body()
            .collect()
            .await
            .expect("collect body")
            .to_bytes();
        assert_eq!(body, "{\"status\":\"ok\"}");
    }

    #[tokio::test]
    async fn discovery_lists_enabled_endpoints() {
        let response = call(app(), get_request("/.well-known/mcp")).await;
        assert_eq!(response.status(), StatusCode::OK);

        let body = json_body(response).await;
        assert_eq!(body["name"], json!("Demo Server"));
        assert_eq!(body["protocol_version"], json!("2024-11-05"));
        assert_eq!(body["endpoints"]["sse"], json!("/sse"));
        assert_eq!(body["endpoints"]["messages"], json!("/messages"));
        assert_eq!(body["endpoints"]["websocket"], json!("/mcp"));

        let response = call(
            app_with(vec![TransportKind::BidirectionalStream]),
            get_request("/.well-known/mcp"),
        )
        .await;
        let body = json_body(response).await;
        assert!(body["endpoints"].get("sse").is_none());
    }

    #[tokio::test]
    async fn root_get_is_not_found() {
        let response = call(app(), get_request("/")).await;

        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn disabled_transports_have_no_routes() {
        let app = app_with(vec![TransportKind::BidirectionalStream]);
        let response = call(app.clone(), get_request("/sse")).await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);

        let response = call(
            app_with(vec![TransportKind::PushStream]),
            get_request("/mcp"),
        )
        .await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn websocket_route_requires_an_upgrade() {
        let response = call(app(), get_request("/mcp")).await;

        assert_ne!(response.status(), StatusCode::NOT_FOUND);
        assert!(response.status().is_client_error());
    }

    #[tokio::test]
    async fn messages_for_unknown_session_are_not_found() {
        let response = call(
            app(),
            post_message(
                "/messages?session_id=missing",
                r#"{"jsonrpc":"2.0","id":1,"method":"ping"}"#,
            ),
        )
        .await;

        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        let body = json_body(response).await;
        assert_eq!(body["code"], json!("session_not_found"));
    }

    #[tokio::test]
    async fn messages_with_invalid_body_are_bad_requests() {
        let response = call(
            app(),
            post_message("/messages?session_id=missing", "{not json"),
        )
        .await;

        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let body = json_body(response).await;
        assert_eq!(body["code"], json!("invalid_message"));
    }

    #[tokio::test]
    async fn sse_stream_announces_endpoint_that_accepts_messages() {
        let app = app();
        let response = call(app.clone(), get_request("/sse")).await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            response
                .headers()
                .get(header::CONTENT_TYPE)
                .and_then(|value| value.to_str().ok()),
            Some("text/event-stream")
        );

        let mut body = response.into_body();
        let frame = body
            .frame()
            .await
            .expect("first event")
            .expect("frame")
            .into_data()
            .expect("data frame");
        let text = String::from_utf8(frame.to_vec()).expect("utf-8 event");
        assert!(text.starts_with("event: endpoint\n"));

        let endpoint = text
            .lines()
            .find_map(|line| line.strip_prefix("data: "))
            .expect("endpoint data")
            .to_string();
        assert!(endpoint.starts_with("/messages?session_id="));

        let response = call(
            app,
            post_message(&endpoint, r#"{"jsonrpc":"2.0","id":1,"method":"ping"}"#),
        )
        .await;
        assert_eq!(response.status(), StatusCode::ACCEPTED);

        let frame = body
            .frame()
            .await
            .expect("reply event")
            .expect("frame")
            .into_data()
            .expect("data frame");
        let text = String::from_utf8(frame.to_vec()).expect("utf-8 event");
        assert!(text.starts_with("event: message\n"));
        assert!(text.contains(r#""id":1"#));
    }
}
