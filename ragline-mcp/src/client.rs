//! MCP client: connects to an external server, performs the initialization
//! handshake, discovers tools and executes tool calls.

use crate::error::McpError;
use crate::protocol::{
    CallToolParams, CallToolResult, ClientCapabilities, ClientInfo, IncomingMessage,
    InitializeParams, InitializeResult, JsonRpcNotification, JsonRpcRequest, JsonRpcResponse,
    ListToolsResult, MCP_PROTOCOL_VERSION, McpTool, RequestId, ServerInfo,
};
use crate::transport::{ProcessTransport, Transport};
use ragline_core::config::McpServerConfig;
use serde_json::Value;
use std::sync::atomic::{AtomicI64, Ordering};
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(60);

/// Upper bound on `tools/list` pages, against servers that never stop paging.
const MAX_TOOL_PAGES: usize = 64;

/// A connection to one MCP server.
///
/// Requests are serialized over the transport, so a client can be shared
/// behind an `Arc` by several tool callbacks.
pub struct McpClient {
    name: String,
    transport: Mutex<Box<dyn Transport>>,
    next_id: AtomicI64,
    server_info: Option<ServerInfo>,
    instructions: Option<String>,
    tools: Vec<McpTool>,
    request_timeout: Duration,
}

impl std::fmt::Debug for McpClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("McpClient")
            .field("name", &self.name)
            .field("server_info", &self.server_info)
            .field("tools", &self.tools.len())
            .finish()
    }
}

impl McpClient {
    /// Wrap an already-connected transport. Call [`McpClient::initialize`] next.
    pub fn new(name: impl Into<String>, transport: impl Transport + 'static) -> Self {
        Self {
            name: name.into(),
            transport: Mutex::new(Box::new(transport)),
            next_id: AtomicI64::new(1),
            server_info: None,
            instructions: None,
            tools: Vec::new(),
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
        }
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    /// Launch the configured server, initialize it and discover its tools.
    pub async fn connect(config: &McpServerConfig) -> Result<Self, McpError> {
        let transport =
            ProcessTransport::spawn(&config.name, &config.command, &config.args, &config.env)?;
        let mut client = Self::new(config.name.clone(), transport);
        client.initialize().await?;
        client.list_tools().await?;
        Ok(client)
    }

    /// The configured name of this server.
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_initialized(&self) -> bool {
        self.server_info.is_some()
    }

    pub fn server_info(&self) -> Option<&ServerInfo> {
        self.server_info.as_ref()
    }

    /// Usage hints the server sent during initialization, if any.
    pub fn instructions(&self) -> Option<&str> {
        self.instructions.as_deref()
    }

    /// Tools found by the last [`McpClient::list_tools`].
    pub fn tools(&self) -> &[McpTool] {
        &self.tools
    }

    fn next_id(&self) -> RequestId {
        RequestId::Number(self.next_id.fetch_add(1, Ordering::Relaxed))
    }

    /// Perform the initialization handshake.
    pub async fn initialize(&mut self) -> Result<&ServerInfo, McpError> {
        let params = InitializeParams {
            protocol_version: MCP_PROTOCOL_VERSION.to_string(),
            capabilities: ClientCapabilities::default(),
            client_info: ClientInfo {
                name: "ragline".to_string(),
                version: env!("CARGO_PKG_VERSION").to_string(),
            },
        };
        let result = self
            .request("initialize", Some(serde_json::to_value(params)?))
            .await?;
        let result: InitializeResult =
            serde_json::from_value(result).map_err(|e| McpError::InvalidRequest {
                message: format!("malformed initialize result: {e}"),
            })?;

        if result.protocol_version != MCP_PROTOCOL_VERSION {
            warn!(
                server = %self.name,
                offered = MCP_PROTOCOL_VERSION,
                accepted = %result.protocol_version,
                "MCP server negotiated a different protocol version"
            );
        }
        if result.capabilities.tools.is_none() {
            debug!(server = %self.name, "MCP server does not advertise tools");
        }
        info!(
            server = %self.name,
            name = %result.server_info.name,
            version = %result.server_info.version,
            "MCP client initialized"
        );

        self.notify("notifications/initialized").await?;
        self.instructions = result.instructions;
        Ok(&*self.server_info.insert(result.server_info))
    }

    /// Discover the server's tools, following pagination cursors.
    pub async fn list_tools(&mut self) -> Result<&[McpTool], McpError> {
        if !self.is_initialized() {
            return Err(McpError::NotInitialized);
        }

        let mut tools = Vec::new();
        let mut cursor: Option<String> = None;
        for _ in 0..MAX_TOOL_PAGES {
            let params = cursor
                .take()
                .map(|c| serde_json::json!({ "cursor": c }))
                .unwrap_or_else(|| serde_json::json!({}));
            let result = self.request("tools/list", Some(params)).await?;
            let page: ListToolsResult =
                serde_json::from_value(result).map_err(|e| McpError::InvalidRequest {
                    message: format!("malformed tools/list result: {e}"),
                })?;
            tools.extend(page.tools);
            match page.next_cursor {
                Some(next) => cursor = Some(next),
                None => break,
            }
        }
        if cursor.is_some() {
            warn!(server = %self.name, "Stopped following tools/list pages");
        }

        debug!(server = %self.name, count = tools.len(), "Discovered MCP tools");
        self.tools = tools;
        Ok(self.tools.as_slice())
    }

    /// Call a tool on the server.
    ///
    /// A tool that ran but failed comes back as `Ok` with `is_error` set;
    /// protocol-level failures are `Err`.
    pub async fn call_tool(&self, tool: &str, arguments: Value) -> Result<CallToolResult, McpError> {
        if !self.is_initialized() {
            return Err(McpError::NotInitialized);
        }
        let params = CallToolParams {
            name: tool.to_string(),
            arguments: Some(arguments),
        };
        let result = self
            .request("tools/call", Some(serde_json::to_value(params)?))
            .await?;
        let result: CallToolResult =
            serde_json::from_value(result).map_err(|e| McpError::InvalidRequest {
                message: format!("malformed tools/call result: {e}"),
            })?;
        debug!(server = %self.name, tool, is_error = result.is_error, "MCP tool returned");
        Ok(result)
    }

    /// Close the transport. For a spawned server this waits for it to exit.
    pub async fn shutdown(&self) -> Result<(), McpError> {
        info!(server = %self.name, "Shutting down MCP client");
        self.transport.lock().await.close().await
    }

    async fn notify(&self, method: &str) -> Result<(), McpError> {
        let message = serde_json::to_string(&JsonRpcNotification::new(method))?;
        self.transport.lock().await.write_message(&message).await
    }

    /// Send a request and wait for the matching response.
    async fn request(&self, method: &str, params: Option<Value>) -> Result<Value, McpError> {
        let id = self.next_id();
        let message = serde_json::to_string(&JsonRpcRequest::new(id.clone(), method, params))?;
        let mut transport = self.transport.lock().await;
        transport.write_message(&message).await?;

        let response = tokio::time::timeout(
            self.request_timeout,
            Self::read_response(&self.name, &mut **transport, &id),
        )
        .await
        .map_err(|_| McpError::TransportError {
            message: format!(
                "'{}' timed out after {}s",
                method,
                self.request_timeout.as_secs()
            ),
        })??;

        match (response.error, response.result) {
            (Some(error), _) => Err(McpError::from_remote(error.code, error.message)),
            (None, result) => Ok(result.unwrap_or(Value::Null)),
        }
    }

    /// Read until the response for `id` arrives, answering or skipping
    /// anything else the server sends in the meantime.
    async fn read_response(
        server: &str,
        transport: &mut dyn Transport,
        id: &RequestId,
    ) -> Result<JsonRpcResponse, McpError> {
        loop {
            let line = transport
                .read_message()
                .await?
                .ok_or(McpError::ConnectionClosed)?;
            let message: IncomingMessage = match serde_json::from_str(&line) {
                Ok(message) => message,
                Err(e) => {
                    warn!(server, error = %e, "Skipping unparseable MCP message");
                    continue;
                }
            };

            if message.is_server_request() {
                let reply = Self::answer_server_request(&message);
                transport.write_message(&serde_json::to_string(&reply)?).await?;
                continue;
            }
            if !message.is_response() {
                debug!(server, method = ?message.method, "MCP notification");
                continue;
            }
            match message.into_response() {
                Some(response) if &response.id == id => return Ok(response),
                Some(response) => {
                    warn!(server, id = %response.id, "Skipping response to another request");
                }
                None => {}
            }
        }
    }

    fn answer_server_request(message: &IncomingMessage) -> JsonRpcResponse {
        let id = message.id.clone().unwrap_or(RequestId::Null);
        match message.method.as_deref() {
            Some("ping") => JsonRpcResponse::success(id, serde_json::json!({})),
            other => {
                let method = other.unwrap_or_default();
                JsonRpcResponse::error(id, -32601, format!("Method not found: {method}"))
            }
        }
    }
}
