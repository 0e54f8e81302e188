//! The server side of the Model Context Protocol
//!
//! [`serve_connection`] runs one client conversation over any [`Connection`]: it answers the
//! handshake, rejects work before initialization, and dispatches every other request on its
//! own task so a slow handler never holds up the rest of the connection.

use std::sync::Arc;

use serde::{de::DeserializeOwned, Serialize};
use serde_json::{json, Value};
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use crate::errors::TransportError;
use crate::mcp::{
    rpc::{methods, Message, Request, Response, RpcError},
    schema::{
        CallToolParams, CallToolResult, Implementation, InitializeResult, ListResourcesResult,
        ListToolsResult, ReadResourceParams, ReadResourceResult, ResourceContents,
        ResourcesCapability, ServerCapabilities, ToolsCapability, PROTOCOL_VERSION,
    },
};
use crate::registry::Registry;
use crate::transport::{pipe::stdio_connection, Connection};

/// Everything a connection needs to answer requests. Cheap to clone.
#[derive(Clone)]
pub struct ServerContext {
    pub registry: Arc<Registry>,
    pub info: Implementation,
}

impl ServerContext {
    pub fn new(registry: Registry, name: impl Into<String>) -> Self {
        Self {
            registry: Arc::new(registry),
            info: Implementation {
                name: name.into(),
                version: env!("CARGO_PKG_VERSION").to_string(),
            },
        }
    }
}

/// Serves one client until its connection closes.
pub async fn serve_connection(connection: Arc<dyn Connection>, context: ServerContext) {
    let mut initialized = false;
    let mut in_flight = JoinSet::new();

    loop {
        let next = tokio::select! {
            next = connection.receive() => next,
            Some(joined) = in_flight.join_next() => {
                if let Err(err) = joined {
                    error!(error = %err, "request task failed");
                }
                continue;
            }
        };

        match next {
            Ok(Some(Message::Request(request))) if request.method == methods::INITIALIZE => {
                let response = audited(&request, initialize(&context, &mut initialized, &request));
                send(connection.as_ref(), response).await;
            }
            Ok(Some(Message::Request(request)))
                if !initialized && request.method != methods::PING =>
            {
                let rejected = Err(RpcError::invalid_request("session not initialized"));
                let response = audited(&request, rejected);
                send(connection.as_ref(), response).await;
            }
            Ok(Some(Message::Request(request))) => {
                let connection = Arc::clone(&connection);
                let context = context.clone();
                in_flight.spawn(async move {
                    let response = handle_request(&context, request).await;
                    send(connection.as_ref(), response).await;
                });
            }
            Ok(Some(Message::Notification(notification))) => {
                if notification.method == methods::INITIALIZED {
                    debug!("client confirmed initialization");
                } else {
                    debug!(method = %notification.method, "ignoring notification");
                }
            }
            Ok(Some(Message::Response(response))) => {
                debug!(id = ?response.id, "ignoring response from client");
            }
            Ok(None) => {
                debug!("client disconnected");
                break;
            }
            Err(TransportError::MalformedFrame(err)) => {
                warn!(error = %err, "received malformed frame");
                send(
                    connection.as_ref(),
                    Response::error(None, RpcError::parse_error()),
                )
                .await;
            }
            Err(err) => {
                warn!(error = %err, "connection failed");
                break;
            }
        }
    }

    in_flight.abort_all();
    connection.close().await;
}

/// Serves the process's own stdin/stdout as a single connection.
pub async fn serve_stdio(context: ServerContext) {
    info!("serving pipe transport on stdio");
    serve_connection(Arc::new(stdio_connection()), context).await;
}

/// Answers any request other than `initialize`, which is tied to per-connection state.
pub async fn handle_request(context: &ServerContext, request: Request) -> Response {
    let outcome = dispatch(context, &request.method, request.params.clone()).await;
    audited(&request, outcome)
}

async fn dispatch(
    context: &ServerContext,
    method: &str,
    params: Option<Value>,
) -> Result<Value, RpcError> {
    match method {
        methods::PING => Ok(json!({})),
        methods::TOOLS_LIST => to_result(ListToolsResult {
            tools: context.registry.snapshot_tools(),
        }),
        methods::TOOLS_CALL => call_tool(context, parse_params(params)?).await,
        methods::RESOURCES_LIST => to_result(ListResourcesResult {
            resources: context.registry.snapshot_resources(),
        }),
        methods::RESOURCES_READ => read_resource(context, parse_params(params)?).await,
        methods::INITIALIZE => Err(RpcError::invalid_request("session already initialized")),
        other => Err(RpcError::method_not_found(other)),
    }
}

fn initialize(
    context: &ServerContext,
    initialized: &mut bool,
    request: &Request,
) -> Result<Value, RpcError> {
    if *initialized {
        return Err(RpcError::invalid_request("session already initialized"));
    }

    let protocol_version = negotiate_protocol_version(request.params.as_ref())?;
    let client = request
        .params
        .as_ref()
        .and_then(|params| params.pointer("/clientInfo/name"))
        .and_then(Value::as_str)
        .unwrap_or("unknown");
    info!(client, protocol_version, "client initialized");

    *initialized = true;
    to_result(InitializeResult {
        protocol_version: protocol_version.to_string(),
        capabilities: ServerCapabilities {
            tools: Some(ToolsCapability {
                list_changed: Some(false),
            }),
            resources: Some(ResourcesCapability {
                subscribe: Some(false),
                list_changed: Some(false),
            }),
        },
        server_info: context.info.clone(),
        instructions: None,
    })
}

async fn call_tool(context: &ServerContext, params: CallToolParams) -> Result<Value, RpcError> {
    let tool = context.registry.get_tool(&params.name)?;
    let arguments = params.arguments.unwrap_or_default();
    tool.descriptor
        .input_schema
        .validate(&arguments)
        .map_err(|reason| {
            RpcError::invalid_params(format!("invalid arguments for `{}`: {reason}", params.name))
        })?;

    // Run on its own task so a panicking handler only fails this request.
    let handler = Arc::clone(&tool.handler);
    match tokio::spawn(async move { handler.call(arguments).await }).await {
        Ok(Ok(value)) => to_result(CallToolResult::from_value(value)),
        Ok(Err(err)) => {
            warn!(tool = %params.name, error = %err, "tool execution failed");
            Err(RpcError::execution_failed(format!("Tool execution failed: {err}")))
        }
        Err(err) => {
            error!(tool = %params.name, error = %err, "tool handler panicked");
            Err(RpcError::execution_failed(
                "Tool execution failed: handler panicked",
            ))
        }
    }
}

async fn read_resource(
    context: &ServerContext,
    params: ReadResourceParams,
) -> Result<Value, RpcError> {
    let resource = context.registry.get_resource(&params.uri)?;
    let mime_type = resource.descriptor.mime_type.clone();

    let provider = Arc::clone(&resource.provider);
    match tokio::spawn(async move { provider.read().await }).await {
        Ok(Ok(content)) => to_result(ReadResourceResult {
            contents: vec![ResourceContents::from_content(&params.uri, mime_type, content)],
        }),
        Ok(Err(err)) => {
            warn!(uri = %params.uri, error = %err, "resource read failed");
            Err(RpcError::execution_failed(format!("Resource read failed: {err}")))
        }
        Err(err) => {
            error!(uri = %params.uri, error = %err, "resource provider panicked");
            Err(RpcError::execution_failed(
                "Resource read failed: provider panicked",
            ))
        }
    }
}

fn parse_params<T: DeserializeOwned>(params: Option<Value>) -> Result<T, RpcError> {
    serde_json::from_value(params.unwrap_or(Value::Null))
        .map_err(|err| RpcError::invalid_params(format!("Invalid params: {err}")))
}

fn to_result<T: Serialize>(result: T) -> Result<Value, RpcError> {
    serde_json::to_value(result).map_err(|err| RpcError::internal(err.to_string()))
}

fn audited(request: &Request, outcome: Result<Value, RpcError>) -> Response {
    let audit_params = redact_audit_params(request.params.as_ref());
    let response = match outcome {
        Ok(result) => Response::success(request.id.clone(), result),
        Err(error) => Response::error(Some(request.id.clone()), error),
    };

    info!(
        method = %request.method,
        id = %request.id,
        params = %audit_params,
        outcome = if response.is_error() { "failure" } else { "success" },
        "mcp action audited"
    );

    response
}

async fn send(connection: &dyn Connection, response: Response) {
    if let Err(err) = connection.send(Message::Response(response)).await {
        debug!(error = %err, "could not deliver response");
    }
}

pub fn negotiate_protocol_version(params: Option<&Value>) -> Result<&'static str, RpcError> {
    let offered_version = params
        .and_then(Value::as_object)
        .and_then(|object| object.get("protocolVersion"))
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|version| !version.is_empty())
        .ok_or_else(|| RpcError::invalid_params("initialize params.protocolVersion is required"))?;

    if offered_version != PROTOCOL_VERSION {
        return Err(RpcError::invalid_params(format!(
            "unsupported protocol version {offered_version}, expected {PROTOCOL_VERSION}"
        )));
    }

    Ok(PROTOCOL_VERSION)
}

pub fn redact_audit_params(params: Option<&Value>) -> Value {
    params.map(redact_audit_value).unwrap_or(Value::Null)
}

pub fn redact_audit_value(value: &Value) -> Value {
    match value {
        Value::Object(map) => Value::Object(
            map.iter()
                .map(|(key, item)| {
                    if is_sensitive_key(key) {
                        (key.clone(), Value::String("[REDACTED]".to_string()))
                    } else {
                        (key.clone(), redact_audit_value(item))
                    }
                })
                .collect(),
        ),
        Value::Array(items) => Value::Array(items.iter().map(redact_audit_value).collect()),
        _ => value.clone(),
    }
}

pub fn is_sensitive_key(key: &str) -> bool {
    let normalized = key.trim().to_ascii_lowercase();
    matches!(
        normalized.as_str(),
        "authorization" | "bearer" | "api_key" | "apikey"
    ) || normalized.contains("token")
        || normalized.contains("secret")
        || normalized.contains("password")
        || normalized.contains("credential")
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};

    use super::*;
    use crate::errors::{McpError, ToolError};
    use crate::mcp::rpc::{
        RequestId, EXECUTION_FAILED, INVALID_PARAMS, INVALID_REQUEST, NOT_FOUND, PARSE_ERROR,
    };
    use crate::mcp::session::Session;
    use crate::registry::{ParamType, ResourceContent, ResourceDescriptor, ToolDescriptor};
    use crate::transport::{memory_pair, pipe::line_connection, ChannelConnection};

    fn registry() -> Registry {
        let mut registry = Registry::new();
        registry
            .register_tool(
                ToolDescriptor::new("add", "Add two numbers")
                    .param("a", ParamType::Integer)
                    .param("b", ParamType::Integer),
                |arguments| {
                    let a = arguments.get("a").and_then(Value::as_i64).unwrap_or_default();
                    let b = arguments.get("b").and_then(Value::as_i64).unwrap_or_default();
                    Ok(json!(a + b))
                },
            )
            .expect("register add");
        registry
            .register_tool(ToolDescriptor::new("fail", "Always fails"), |_| {
                Err(ToolError::new("division by zero"))
            })
            .expect("register fail");
        registry
            .register_tool(
                ToolDescriptor::new("explode", "Panics"),
                |_| -> Result<Value, ToolError> { panic!("handler blew up") },
            )
            .expect("register explode");
        registry
            .register_resource(
                ResourceDescriptor::new("config://app", "App config").mime_type("text/plain"),
                || Ok(ResourceContent::text("App configuration data")),
            )
            .expect("register resource");
        registry
    }

    fn context() -> ServerContext {
        ServerContext::new(registry(), "Test Server")
    }

    fn start(context: &ServerContext) -> Session {
        let (client, server) = memory_pair();
        tokio::spawn(serve_connection(Arc::new(server), context.clone()));
        Session::new(Arc::new(client))
    }

    fn raw_client(context: &ServerContext) -> ChannelConnection {
        let (client, server) = memory_pair();
        tokio::spawn(serve_connection(Arc::new(server), context.clone()));
        client
    }

    async fn raw_call(
        client: &ChannelConnection,
        id: u64,
        method: &str,
        params: Option<Value>,
    ) -> Response {
        client
            .send(Message::Request(Request::new(RequestId::Number(id), method, params)))
            .await
            .expect("send");
        match client.receive().await {
            Ok(Some(Message::Response(response))) => response,
            other => panic!("expected a response, got {other:?}"),
        }
    }

    fn initialize_params() -> Value {
        json!({
            "protocolVersion": PROTOCOL_VERSION,
            "capabilities": {},
            "clientInfo": { "name": "raw", "version": "0" }
        })
    }

    #[test]
    fn redacts_sensitive_fields_in_audit_params() {
        let params = json!({
            "name": "greet",
            "arguments": {
                "name": "Ada",
                "token": "should-not-appear",
                "api_key": "should-not-appear",
                "nested": {
                    "client_secret": "should-not-appear"
                }
            }
        });

        let redacted = redact_audit_params(Some(&params));

        assert_eq!(redacted["name"], json!("greet"));
        assert_eq!(redacted["arguments"]["name"], json!("Ada"));
        assert_eq!(redacted["arguments"]["token"], json!("[REDACTED]"));
        assert_eq!(redacted["arguments"]["api_key"], json!("[REDACTED]"));
        assert_eq!(
            redacted["arguments"]["nested"]["client_secret"],
            json!("[REDACTED]")
        );
        assert_eq!(redact_audit_params(None), Value::Null);
    }

    #[test]
    fn negotiate_protocol_version_accepts_supported_version() {
        let params = json!({ "protocolVersion": PROTOCOL_VERSION });
        assert_eq!(negotiate_protocol_version(Some(&params)), Ok(PROTOCOL_VERSION));
    }

    #[test]
    fn negotiate_protocol_version_rejects_unsupported_or_missing_version() {
        let params = json!({ "protocolVersion": "2026-01-01" });
        let error = negotiate_protocol_version(Some(&params))
            .expect_err("unsupported version must fail");
        assert_eq!(error.code, INVALID_PARAMS);

        let error = negotiate_protocol_version(None).expect_err("missing version must fail");
        assert!(error.message.contains("protocolVersion"));
    }

    #[tokio::test]
    async fn session_round_trips_tools_and_resources() {
        let context = context();
        let session = start(&context);
        let result = session.initialize().await.expect("initialize");
        assert_eq!(result.server_info.name, "Test Server");

        let tools = session.list_tools().await.expect("list tools");
        let names: Vec<_> = tools.iter().map(|tool| tool.name.as_str()).collect();
        assert_eq!(names, vec!["add", "fail", "explode"]);

        let sum = session
            .call_tool("add", json!({ "a": 5, "b": 3 }))
            .await
            .expect("call add");
        assert_eq!(sum.value(), Some(&json!(8)));

        let contents = session.read_resource("config://app").await.expect("read");
        assert_eq!(contents[0].as_text(), Some("App configuration data"));
        assert_eq!(contents[0].mime_type.as_deref(), Some("text/plain"));

        session.ping().await.expect("ping");
        session.close().await;
    }

    #[tokio::test]
    async fn unknown_names_are_not_found() {
        let context = context();
        let session = start(&context);
        session.initialize().await.expect("initialize");

        let err = session.call_tool("nope", json!({})).await.expect_err("unknown tool");
        assert!(err.is_not_found());

        let err = session.read_resource("config://missing").await.expect_err("unknown resource");
        assert!(matches!(err, McpError::Remote { code, .. } if code == NOT_FOUND));
    }

    #[tokio::test]
    async fn arguments_are_validated_against_the_schema() {
        let context = context();
        let session = start(&context);
        session.initialize().await.expect("initialize");

        for arguments in [
            json!({ "a": 5 }),
            json!({ "a": "five", "b": 3 }),
            json!({ "a": 5, "b": 3, "c": 1 }),
        ] {
            let err = session.call_tool("add", arguments).await.expect_err("invalid arguments");
            assert!(matches!(err, McpError::Remote { code, .. } if code == INVALID_PARAMS));
        }
    }

    #[tokio::test]
    async fn failing_and_panicking_handlers_leave_the_server_serving() {
        let context = context();
        let session = start(&context);
        let other = start(&context);
        session.initialize().await.expect("initialize");
        other.initialize().await.expect("initialize other");

        let err = session.call_tool("fail", json!({})).await.expect_err("fails");
        assert!(matches!(
            err,
            McpError::Remote { code, ref message, .. }
                if code == EXECUTION_FAILED && message.contains("division by zero")
        ));

        let err = session.call_tool("explode", json!({})).await.expect_err("panics");
        assert!(matches!(err, McpError::Remote { code, .. } if code == EXECUTION_FAILED));

        let sum = session
            .call_tool("add", json!({ "a": 1, "b": 2 }))
            .await
            .expect("still serving");
        assert_eq!(sum.value(), Some(&json!(3)));
        let sum = other
            .call_tool("add", json!({ "a": 2, "b": 2 }))
            .await
            .expect("other still serving");
        assert_eq!(sum.value(), Some(&json!(4)));
    }

    #[tokio::test]
    async fn requests_before_initialize_are_rejected_except_ping() {
        let context = context();
        let client = raw_client(&context);

        let response = raw_call(&client, 1, methods::TOOLS_LIST, None).await;
        assert_eq!(response.error.map(|error| error.code), Some(INVALID_REQUEST));

        let response = raw_call(&client, 2, methods::PING, None).await;
        assert!(!response.is_error());

        let response = raw_call(&client, 3, methods::INITIALIZE, Some(initialize_params())).await;
        assert_eq!(
            response.result.as_ref().and_then(|result| result.get("protocolVersion")),
            Some(&json!(PROTOCOL_VERSION))
        );

        let response = raw_call(&client, 4, methods::INITIALIZE, Some(initialize_params())).await;
        assert_eq!(response.error.map(|error| error.code), Some(INVALID_REQUEST));

        let response = raw_call(&client, 5, "prompts/list", None).await;
        assert_eq!(
            response.error.map(|error| error.code),
            Some(crate::mcp::rpc::METHOD_NOT_FOUND)
        );
    }

    #[tokio::test]
    async fn malformed_lines_get_a_parse_error_and_the_connection_survives() {
        let (client_io, server_io) = tokio::io::duplex(4096);
        let (server_read, server_write) = tokio::io::split(server_io);
        tokio::spawn(serve_connection(
            Arc::new(line_connection(server_read, server_write)),
            context(),
        ));

        let (client_read, mut client_write) = tokio::io::split(client_io);
        let mut lines = BufReader::new(client_read).lines();

        client_write.write_all(b"{not json\n").await.expect("write garbage");
        let line = tokio::time::timeout(Duration::from_secs(1), lines.next_line())
            .await
            .expect("reply in time")
            .expect("read")
            .expect("line");
        let reply: Value = serde_json::from_str(&line).expect("reply is json");
        assert_eq!(reply["id"], Value::Null);
        assert_eq!(reply["error"]["code"], json!(PARSE_ERROR));

        client_write
            .write_all(b"{\"jsonrpc\":\"2.0\",\"id\":1,\"method\":\"ping\"}\n")
            .await
            .expect("write ping");
        let line = lines.next_line().await.expect("read").expect("line");
        let reply: Value = serde_json::from_str(&line).expect("reply is json");
        assert_eq!(reply["id"], json!(1));
        assert_eq!(reply["result"], json!({}));
    }
}
