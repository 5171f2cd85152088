//! MCP client error types.

use ragline_core::error::ToolError;

/// Errors that can occur while talking to an MCP server.
#[derive(Debug, thiserror::Error)]
pub enum McpError {
    #[error("JSON-RPC parse error: {message}")]
    ParseError { message: String },

    #[error("Invalid request: {message}")]
    InvalidRequest { message: String },

    #[error("Method not found: {method}")]
    MethodNotFound { method: String },

    #[error("Invalid parameters: {message}")]
    InvalidParams { message: String },

    #[error("Internal error: {message}")]
    InternalError { message: String },

    /// An error object returned by the server that maps to no standard code.
    #[error("Server error {code}: {message}")]
    Remote { code: i64, message: String },

    #[error("Tool execution failed: {message}")]
    ToolError { message: String },

    #[error("Transport error: {message}")]
    TransportError { message: String },

    #[error("Server closed the connection")]
    ConnectionClosed,

    #[error("Client not initialized")]
    NotInitialized,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl McpError {
    /// Convert to a JSON-RPC error code.
    pub fn error_code(&self) -> i64 {
        match self {
            McpError::ParseError { .. } => -32700,
            McpError::InvalidRequest { .. } => -32600,
            McpError::MethodNotFound { .. } => -32601,
            McpError::InvalidParams { .. } => -32602,
            McpError::InternalError { .. } => -32603,
            McpError::Remote { code, .. } => *code,
            McpError::ToolError { .. } => -32000,
            McpError::TransportError { .. } | McpError::ConnectionClosed => -32002,
            McpError::NotInitialized => -32003,
            McpError::Io(_) => -32603,
            McpError::Json(_) => -32700,
        }
    }

    /// Map a JSON-RPC error object from the server back to a typed error.
    pub fn from_remote(code: i64, message: String) -> Self {
        match code {
            -32700 => McpError::ParseError { message },
            -32600 => McpError::InvalidRequest { message },
            -32601 => McpError::MethodNotFound { method: message },
            -32602 => McpError::InvalidParams { message },
            -32603 => McpError::InternalError { message },
            -32000 => McpError::ToolError { message },
            _ => McpError::Remote { code, message },
        }
    }

    /// Whether the connection is unusable after this error.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            McpError::TransportError { .. } | McpError::ConnectionClosed | McpError::Io(_)
        )
    }

    /// Express this error as a failure of the named tool.
    pub fn into_tool_error(self, tool: &str) -> ToolError {
        match self {
            McpError::InvalidParams { message } => ToolError::InvalidArguments {
                name: tool.to_string(),
                reason: message,
            },
            McpError::MethodNotFound { .. } => ToolError::NotFound {
                name: tool.to_string(),
            },
            other => ToolError::ExecutionFailed {
                name: tool.to_string(),
                message: other.to_string(),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_codes() {
        assert_eq!(
            McpError::ParseError {
                message: "bad json".into()
            }
            .error_code(),
            -32700
        );
        assert_eq!(
            McpError::InvalidParams {
                message: "bad params".into()
            }
            .error_code(),
            -32602
        );
        assert_eq!(McpError::ConnectionClosed.error_code(), -32002);
        assert_eq!(McpError::NotInitialized.error_code(), -32003);
    }

    #[test]
    fn test_remote_codes_round_trip() {
        for code in [-32700, -32600, -32601, -32602, -32603, -32000] {
            assert_eq!(McpError::from_remote(code, "x".into()).error_code(), code);
        }
        let custom = McpError::from_remote(-31999, "quota".into());
        assert!(matches!(custom, McpError::Remote { code: -31999, .. }));
        assert_eq!(custom.to_string(), "Server error -31999: quota");
    }

    #[test]
    fn test_fatal_classification() {
        assert!(McpError::ConnectionClosed.is_fatal());
        assert!(
            McpError::TransportError {
                message: "pipe".into()
            }
            .is_fatal()
        );
        assert!(
            !McpError::ToolError {
                message: "boom".into()
            }
            .is_fatal()
        );
    }

    #[test]
    fn test_into_tool_error() {
        let err = McpError::InvalidParams {
            message: "missing a".into(),
        }
        .into_tool_error("add");
        assert!(matches!(err, ToolError::InvalidArguments { ref name, .. } if name == "add"));

        let err = McpError::ConnectionClosed.into_tool_error("add");
        assert!(matches!(err, ToolError::ExecutionFailed { .. }));
    }
}
