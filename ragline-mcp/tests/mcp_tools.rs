//! MCP client against an in-process calculator server.

use ragline_core::brain::MockLlmProvider;
use ragline_core::chat::{ChatClient, ToolRegistry};
use ragline_core::error::ToolError;
use ragline_core::types::Content;
use ragline_mcp::protocol::{IncomingMessage, JsonRpcResponse};
use ragline_mcp::{ChannelTransport, McpClient, McpToolCallback, Transport, register_tools};
use serde_json::{Value, json};
use std::sync::Arc;

fn add_tool() -> Value {
    json!({
        "name": "add",
        "description": "Add two numbers",
        "inputSchema": {
            "type": "object",
            "properties": {"a": {"type": "number"}, "b": {"type": "number"}},
            "required": ["a", "b"]
        }
    })
}

fn divide_tool() -> Value {
    json!({
        "name": "divide",
        "inputSchema": {
            "type": "object",
            "properties": {"a": {"type": "number"}, "b": {"type": "number"}}
        }
    })
}

fn handle(method: &str, params: &Value) -> Result<Value, (i64, String)> {
    match method {
        "initialize" => Ok(json!({
            "protocolVersion": "2024-11-05",
            "capabilities": {"tools": {}},
            "serverInfo": {"name": "calculator", "version": "1.0.0"},
            "instructions": "Use these tools for arithmetic."
        })),
        // Two pages to exercise cursor handling.
        "tools/list" if params.get("cursor").is_none() => {
            Ok(json!({"tools": [add_tool()], "nextCursor": "page-2"}))
        }
        "tools/list" => Ok(json!({"tools": [divide_tool()]})),
        "tools/call" => {
            let args = &params["arguments"];
            let a = args["a"].as_f64().unwrap_or_default();
            let b = args["b"].as_f64().unwrap_or_default();
            match params["name"].as_str() {
                Some("add") => Ok(json!({"content": [{"type": "text", "text": format!("{}", a + b)}]})),
                Some("divide") if b == 0.0 => Ok(json!({
                    "content": [{"type": "text", "text": "division by zero"}],
                    "isError": true
                })),
                Some("divide") => Ok(json!({"content": [{"type": "text", "text": format!("{}", a / b)}]})),
                _ => Err((-32602, "unknown tool".to_string())),
            }
        }
        other => Err((-32601, other.to_string())),
    }
}

/// Serve requests until the client hangs up. Before every tool call the
/// server sends a progress notification and a ping to make the client skip
/// and answer them.
fn spawn_calculator(mut transport: ChannelTransport) -> tokio::task::JoinHandle<Vec<String>> {
    tokio::spawn(async move {
        let mut methods = Vec::new();
        while let Ok(Some(line)) = transport.read_message().await {
            let message: IncomingMessage = serde_json::from_str(&line).unwrap();
            let Some(method) = message.method.clone() else {
                continue;
            };
            methods.push(method.clone());
            let Some(id) = message.id.clone() else {
                continue;
            };
            if method == "tools/call" {
                transport
                    .write_message(r#"{"jsonrpc":"2.0","method":"notifications/progress"}"#)
                    .await
                    .unwrap();
                transport
                    .write_message(r#"{"jsonrpc":"2.0","id":"srv-1","method":"ping"}"#)
                    .await
                    .unwrap();
            }
            let params = message.params.clone().unwrap_or(Value::Null);
            let response = match handle(&method, &params) {
                Ok(result) => JsonRpcResponse::success(id, result),
                Err((code, text)) => JsonRpcResponse::error(id, code, text),
            };
            transport
                .write_message(&serde_json::to_string(&response).unwrap())
                .await
                .unwrap();
        }
        methods
    })
}

async fn connected() -> (Arc<McpClient>, tokio::task::JoinHandle<Vec<String>>) {
    let (client_side, server_side) = ChannelTransport::pair(16);
    let server = spawn_calculator(server_side);
    let mut client = McpClient::new("calculator", client_side);
    client.initialize().await.unwrap();
    client.list_tools().await.unwrap();
    (Arc::new(client), server)
}

#[tokio::test]
async fn handshake_and_paginated_discovery() {
    let (client, server) = connected().await;
    let info = client.server_info().unwrap();
    assert_eq!(info.name, "calculator");
    assert_eq!(client.instructions(), Some("Use these tools for arithmetic."));
    let names: Vec<&str> = client.tools().iter().map(|t| t.name.as_str()).collect();
    assert_eq!(names, vec!["add", "divide"]);

    client.shutdown().await.unwrap();
    drop(client);
    let methods = server.await.unwrap();
    assert_eq!(
        methods,
        vec!["initialize", "notifications/initialized", "tools/list", "tools/list"]
    );
}

#[tokio::test]
async fn tool_call_skips_notifications_and_answers_ping() {
    let (client, _server) = connected().await;
    let result = client.call_tool("add", json!({"a": 2, "b": 2})).await.unwrap();
    assert!(!result.is_error);
    assert_eq!(result.text(), "4");

    let err = client.call_tool("nope", json!({})).await.unwrap_err();
    assert_eq!(err.error_code(), -32602);
}

#[tokio::test]
async fn callbacks_validate_and_report_failures() {
    let (client, _server) = connected().await;
    let callbacks = McpToolCallback::all(&client);
    assert_eq!(callbacks.len(), 2);
    let add = &callbacks[0];
    assert_eq!(add.description(), "Add two numbers");
    assert!(callbacks[1].description().contains("calculator"));

    assert_eq!(add.call(json!({"a": 1.5, "b": 2})).await.unwrap(), "3.5");

    let missing = add.call(json!({"a": 1})).await.unwrap_err();
    assert!(matches!(missing, ToolError::InvalidArguments { .. }));
    let wrong_type = add.call(json!({"a": "one", "b": 2})).await.unwrap_err();
    assert!(matches!(wrong_type, ToolError::InvalidArguments { .. }));

    let failed = callbacks[1].call(json!({"a": 1, "b": 0})).await.unwrap_err();
    assert!(
        matches!(failed, ToolError::ExecutionFailed { ref message, .. } if message == "division by zero")
    );
}

#[tokio::test]
async fn chat_client_uses_mcp_tools() {
    let (client, _server) = connected().await;
    let mut registry = ToolRegistry::new();
    assert_eq!(register_tools(&mut registry, &[Arc::clone(&client)]), 2);
    // Registering the same server twice skips the duplicates.
    assert_eq!(register_tools(&mut registry, &[Arc::clone(&client)]), 0);

    let provider = Arc::new(MockLlmProvider::new());
    provider.queue_response(MockLlmProvider::tool_call_response(
        "add",
        json!({"a": 2, "b": 2}),
    ));
    provider.queue_response(MockLlmProvider::text_response("2 + 2 is 4."));
    let chat = ChatClient::new(provider.clone()).with_tools(Arc::new(registry));

    let answer = chat.prompt("What is 2 + 2?").content().await.unwrap();
    assert_eq!(answer, "2 + 2 is 4.");

    let requests = provider.recorded_requests();
    let offered: Vec<String> = requests[0]
        .tools
        .as_ref()
        .unwrap()
        .iter()
        .map(|t| t.name.clone())
        .collect();
    assert_eq!(offered, vec!["add", "divide"]);
    match &requests[1].messages.last().unwrap().content {
        Content::ToolResult {
            output, is_error, ..
        } => {
            assert_eq!(output, "4");
            assert!(!is_error);
        }
        other => panic!("expected a tool result, got {other:?}"),
    }
}

#[tokio::test]
async fn plain_question_without_tools() {
    let provider = Arc::new(MockLlmProvider::with_response("4"));
    let chat = ChatClient::new(provider.clone());
    assert_eq!(chat.prompt("What is 2 + 2?").content().await.unwrap(), "4");
    assert!(provider.recorded_requests()[0].tools.is_none());
}
