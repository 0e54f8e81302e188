//! Client session: handshake, request correlation and the typed MCP operations.
//!
//! A background reader task owns the inbound side of the connection. It resolves pending
//! requests by id, answers server-initiated `ping`, and marks the session closed once the
//! connection ends. Every request that is still waiting at that point fails with
//! [`McpError::SessionClosed`].

use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Mutex, MutexGuard, PoisonError,
    },
};

use serde::de::DeserializeOwned;
use serde_json::{json, Value};
use tokio::{sync::oneshot, task::JoinHandle};
use tracing::{debug, info, warn};

use crate::errors::{McpError, TransportError};
use crate::mcp::{
    rpc::{methods, Message, Notification, Request, RequestId, Response, RpcError},
    schema::{
        CallToolResult, Implementation, InitializeParams, InitializeResult, ListResourcesResult,
        ListToolsResult, ReadResourceResult, ResourceContents, PROTOCOL_VERSION,
    },
};
use crate::registry::{ResourceDescriptor, ToolDescriptor};
use crate::transport::{ClientTransport, Connection};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Uninitialized,
    Initializing,
    Ready,
    Closed,
}

type Slot = oneshot::Sender<Result<Value, McpError>>;

struct Shared {
    state: SessionState,
    pending: HashMap<u64, Slot>,
    server: Option<InitializeResult>,
}

impl Shared {
    /// Marks the session closed and fails every waiting request. Each slot is taken out of the
    /// map before it is resolved, so no slot resolves twice.
    fn close(&mut self) {
        self.state = SessionState::Closed;
        for (_, slot) in self.pending.drain() {
            let _ = slot.send(Err(McpError::SessionClosed));
        }
    }
}

fn lock(shared: &Mutex<Shared>) -> MutexGuard<'_, Shared> {
    shared.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Removes a request's slot when its future completes or is dropped.
struct PendingGuard<'a> {
    id: u64,
    shared: &'a Mutex<Shared>,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        lock(self.shared).pending.remove(&self.id);
    }
}

pub struct Session {
    connection: Arc<dyn Connection>,
    shared: Arc<Mutex<Shared>>,
    next_id: AtomicU64,
    reader: JoinHandle<()>,
}

impl Session {
    /// Wraps an open connection. Must be called inside a tokio runtime.
    pub fn new(connection: Arc<dyn Connection>) -> Self {
        let shared = Arc::new(Mutex::new(Shared {
            state: SessionState::Uninitialized,
            pending: HashMap::new(),
            server: None,
        }));
        let reader = tokio::spawn(read_loop(Arc::clone(&connection), Arc::clone(&shared)));

        Self {
            connection,
            shared,
            next_id: AtomicU64::new(1),
            reader,
        }
    }

    /// Opens `transport` and performs the handshake.
    pub async fn connect(transport: &ClientTransport) -> Result<Self, McpError> {
        let connection = transport.open().await?;
        let session = Self::new(connection);
        if let Err(err) = session.initialize().await {
            session.close().await;
            return Err(err);
        }
        Ok(session)
    }

    pub fn state(&self) -> SessionState {
        self.lock().state
    }

    pub fn pending_count(&self) -> usize {
        self.lock().pending.len()
    }

    /// Name and version the server reported during the handshake.
    pub fn server_info(&self) -> Option<Implementation> {
        self.lock()
            .server
            .as_ref()
            .map(|server| server.server_info.clone())
    }

    pub async fn initialize(&self) -> Result<InitializeResult, McpError> {
        {
            let mut shared = self.lock();
            match shared.state {
                SessionState::Uninitialized => shared.state = SessionState::Initializing,
                SessionState::Closed => {
                    return Err(McpError::Handshake("session is closed".to_string()))
                }
                state => {
                    return Err(McpError::Handshake(format!(
                        "initialize called in state {state:?}"
                    )))
                }
            }
        }

        let outcome = self.handshake().await;
        let mut shared = self.lock();
        match outcome {
            Ok(result) if shared.state == SessionState::Initializing => {
                info!(
                    server = %result.server_info.name,
                    version = %result.server_info.version,
                    "session initialized"
                );
                shared.state = SessionState::Ready;
                shared.server = Some(result.clone());
                Ok(result)
            }
            Ok(_) => Err(McpError::Handshake(
                "transport closed before the handshake completed".to_string(),
            )),
            Err(err) => {
                if shared.state == SessionState::Initializing {
                    shared.state = SessionState::Uninitialized;
                }
                Err(err)
            }
        }
    }

    async fn handshake(&self) -> Result<InitializeResult, McpError> {
        let params = InitializeParams {
            protocol_version: PROTOCOL_VERSION.to_string(),
            capabilities: json!({}),
            client_info: Implementation {
                name: env!("CARGO_PKG_NAME").to_string(),
                version: env!("CARGO_PKG_VERSION").to_string(),
            },
        };
        let params =
            serde_json::to_value(params).map_err(|err| McpError::Handshake(err.to_string()))?;

        let outcome = self.send_request(methods::INITIALIZE, Some(params)).await;
        let result: InitializeResult = match outcome {
            Ok(value) => serde_json::from_value(value)
                .map_err(|err| McpError::Handshake(format!("invalid initialize result: {err}")))?,
            Err(McpError::Remote { message, .. }) => {
                return Err(McpError::Handshake(format!(
                    "server rejected initialization: {message}"
                )))
            }
            Err(err) if err.is_connection_failure() => {
                return Err(McpError::Handshake(
                    "transport closed before the handshake completed".to_string(),
                ))
            }
            Err(err) => return Err(McpError::Handshake(err.to_string())),
        };

        if result.protocol_version != PROTOCOL_VERSION {
            return Err(McpError::Handshake(format!(
                "server answered with unsupported protocol version {}",
                result.protocol_version
            )));
        }

        self.connection
            .send(Message::Notification(Notification::new(
                methods::INITIALIZED,
                None,
            )))
            .await
            .map_err(|err| {
                McpError::Handshake(format!("failed to confirm initialization: {err}"))
            })?;

        Ok(result)
    }

    pub async fn list_tools(&self) -> Result<Vec<ToolDescriptor>, McpError> {
        let result: ListToolsResult = self.request(methods::TOOLS_LIST, None).await?;
        Ok(result.tools)
    }

    /// Invokes `name` with `arguments`, which the server validates against the tool's schema.
    pub async fn call_tool(
        &self,
        name: &str,
        arguments: Value,
    ) -> Result<CallToolResult, McpError> {
        let params = json!({ "name": name, "arguments": arguments });
        self.request(methods::TOOLS_CALL, Some(params)).await
    }

    pub async fn list_resources(&self) -> Result<Vec<ResourceDescriptor>, McpError> {
        let result: ListResourcesResult = self.request(methods::RESOURCES_LIST, None).await?;
        Ok(result.resources)
    }

    pub async fn read_resource(&self, uri: &str) -> Result<Vec<ResourceContents>, McpError> {
        let result: ReadResourceResult = self
            .request(methods::RESOURCES_READ, Some(json!({ "uri": uri })))
            .await?;
        Ok(result.contents)
    }

    /// Liveness check. Allowed in any state except closed.
    pub async fn ping(&self) -> Result<(), McpError> {
        self.send_request(methods::PING, None).await.map(|_| ())
    }

    /// Fails every waiting request, then releases the connection. Safe to call repeatedly.
    pub async fn close(&self) {
        let was_open = {
            let mut shared = self.lock();
            let was_open = shared.state != SessionState::Closed;
            shared.close();
            was_open
        };
        if was_open {
            debug!("closing session");
        }

        self.connection.close().await;
        self.reader.abort();
    }

    async fn request<T: DeserializeOwned>(
        &self,
        method: &str,
        params: Option<Value>,
    ) -> Result<T, McpError> {
        self.ensure_ready()?;
        let value = self.send_request(method, params).await?;
        serde_json::from_value(value)
            .map_err(|err| McpError::InvalidResponse(format!("{method}: {err}")))
    }

    fn ensure_ready(&self) -> Result<(), McpError> {
        match self.lock().state {
            SessionState::Ready => Ok(()),
            SessionState::Closed => Err(McpError::SessionClosed),
            state => Err(McpError::NotInitialized(state)),
        }
    }

    async fn send_request(&self, method: &str, params: Option<Value>) -> Result<Value, McpError> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (slot, outcome) = oneshot::channel();
        {
            let mut shared = self.lock();
            if shared.state == SessionState::Closed {
                return Err(McpError::SessionClosed);
            }
            shared.pending.insert(id, slot);
        }
        let _pending = PendingGuard {
            id,
            shared: &self.shared,
        };

        let request = Request::new(RequestId::Number(id), method, params);
        self.connection
            .send(Message::Request(request))
            .await
            .map_err(|err| match err {
                TransportError::Closed => McpError::SessionClosed,
                other => McpError::Transport(other),
            })?;

        outcome
            .await
            .unwrap_or_else(|_| Err(McpError::SessionClosed))
    }

    fn lock(&self) -> MutexGuard<'_, Shared> {
        lock(&self.shared)
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.lock().close();
        self.reader.abort();
    }
}

async fn read_loop(connection: Arc<dyn Connection>, shared: Arc<Mutex<Shared>>) {
    loop {
        match connection.receive().await {
            Ok(Some(Message::Response(response))) => resolve(&shared, response),
            Ok(Some(Message::Request(request))) => {
                answer_server_request(connection.as_ref(), request).await
            }
            Ok(Some(Message::Notification(notification))) => {
                debug!(method = %notification.method, "ignoring server notification")
            }
            Ok(None) => {
                debug!("connection closed by peer");
                break;
            }
            Err(TransportError::MalformedFrame(err)) => {
                warn!(error = %err, "discarding malformed frame")
            }
            Err(err) => {
                warn!(error = %err, "connection failed");
                break;
            }
        }
    }

    lock(&shared).close();
}

fn resolve(shared: &Mutex<Shared>, response: Response) {
    let slot = match &response.id {
        Some(RequestId::Number(id)) => lock(shared).pending.remove(id),
        _ => None,
    };

    match slot {
        Some(slot) => {
            let _ = slot.send(response.into_outcome());
        }
        None => warn!(
            id = ?response.id,
            "discarding response for unknown or resolved request"
        ),
    }
}

async fn answer_server_request(connection: &dyn Connection, request: Request) {
    let response = if request.method == methods::PING {
        Response::success(request.id, json!({}))
    } else {
        debug!(method = %request.method, "rejecting server-initiated request");
        Response::error(Some(request.id), RpcError::method_not_found(&request.method))
    };

    if let Err(err) = connection.send(Message::Response(response)).await {
        warn!(error = %err, "failed to answer server request");
    }
}
