//! # Ragline MCP
//!
//! Client side of the Model Context Protocol. Launches the MCP servers named
//! in the configuration and offers their tools to the chat client.
//!
//! ```text
//! let clients = ragline_mcp::connect_servers(&config.mcp).await;
//! ragline_mcp::register_tools(&mut registry, &clients);
//! ```

pub mod client;
pub mod error;
pub mod protocol;
pub mod tool;
pub mod transport;

pub use client::McpClient;
pub use error::McpError;
pub use protocol::{CallToolResult, McpTool, ServerInfo, ToolContent};
pub use tool::McpToolCallback;
pub use transport::{ChannelTransport, ProcessTransport, Transport};

use ragline_core::chat::ToolRegistry;
use ragline_core::config::McpConfig;
use ragline_core::error::ToolError;
use std::sync::Arc;
use tracing::{info, warn};

/// Connect to every enabled server. Servers that fail to start are logged
/// and skipped.
pub async fn connect_servers(config: &McpConfig) -> Vec<Arc<McpClient>> {
    let mut clients = Vec::new();
    for server in config.servers.iter().filter(|s| s.enabled) {
        match McpClient::connect(server).await {
            Ok(client) => {
                info!(
                    server = %server.name,
                    tools = client.tools().len(),
                    "Connected to MCP server"
                );
                clients.push(Arc::new(client));
            }
            Err(e) => warn!(server = %server.name, error = %e, "MCP server unavailable"),
        }
    }
    clients
}

/// Register the tools of every client. A tool whose name is already taken
/// is skipped. Returns how many were registered.
pub fn register_tools(registry: &mut ToolRegistry, clients: &[Arc<McpClient>]) -> usize {
    let mut registered = 0;
    for client in clients {
        for callback in McpToolCallback::all(client) {
            match registry.register(callback) {
                Ok(()) => registered += 1,
                Err(ToolError::AlreadyRegistered { name }) => {
                    warn!(server = %client.name(), tool = %name, "Duplicate tool name, skipping");
                }
                Err(e) => warn!(server = %client.name(), error = %e, "Could not register tool"),
            }
        }
    }
    registered
}

/// Shut down every client, logging failures.
pub async fn shutdown_all(clients: &[Arc<McpClient>]) {
    for client in clients {
        if let Err(e) = client.shutdown().await {
            warn!(server = %client.name(), error = %e, "MCP shutdown failed");
        }
    }
}
