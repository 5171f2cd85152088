//! Exposes MCP server tools as chat [`ToolCallback`]s.

use crate::client::McpClient;
use crate::protocol::McpTool;
use async_trait::async_trait;
use ragline_core::chat::ToolCallback;
use ragline_core::error::ToolError;
use std::sync::Arc;
use tracing::warn;

/// One remote tool, callable by the chat client.
///
/// Arguments are checked against the tool's input schema before they are
/// sent to the server.
pub struct McpToolCallback {
    client: Arc<McpClient>,
    tool: McpTool,
    description: String,
    validator: Option<jsonschema::Validator>,
}

impl McpToolCallback {
    pub fn new(client: Arc<McpClient>, tool: McpTool) -> Self {
        let validator = match jsonschema::validator_for(&tool.input_schema) {
            Ok(validator) => Some(validator),
            Err(e) => {
                warn!(
                    server = %client.name(),
                    tool = %tool.name,
                    error = %e,
                    "Tool has an invalid input schema; arguments will not be checked"
                );
                None
            }
        };
        let description = tool
            .description
            .clone()
            .unwrap_or_else(|| format!("Tool '{}' from MCP server '{}'", tool.name, client.name()));
        Self {
            client,
            tool,
            description,
            validator,
        }
    }

    /// Callbacks for every tool the client has discovered.
    pub fn all(client: &Arc<McpClient>) -> Vec<Arc<dyn ToolCallback>> {
        client
            .tools()
            .iter()
            .map(|tool| {
                Arc::new(McpToolCallback::new(Arc::clone(client), tool.clone()))
                    as Arc<dyn ToolCallback>
            })
            .collect()
    }

    fn check_arguments(&self, args: &serde_json::Value) -> Result<(), ToolError> {
        let Some(validator) = &self.validator else {
            return Ok(());
        };
        let problems: Vec<String> = validator.iter_errors(args).map(|e| e.to_string()).collect();
        if problems.is_empty() {
            Ok(())
        } else {
            Err(ToolError::InvalidArguments {
                name: self.tool.name.clone(),
                reason: problems.join("; "),
            })
        }
    }
}

#[async_trait]
impl ToolCallback for McpToolCallback {
    fn name(&self) -> &str {
        &self.tool.name
    }

    fn description(&self) -> &str {
        &self.description
    }

    fn parameters_schema(&self) -> serde_json::Value {
        self.tool.input_schema.clone()
    }

    async fn call(&self, args: serde_json::Value) -> Result<String, ToolError> {
        let args = if args.is_null() {
            serde_json::json!({})
        } else {
            args
        };
        self.check_arguments(&args)?;

        let result = self
            .client
            .call_tool(&self.tool.name, args)
            .await
            .map_err(|e| e.into_tool_error(&self.tool.name))?;
        if result.is_error {
            return Err(ToolError::ExecutionFailed {
                name: self.tool.name.clone(),
                message: result.text(),
            });
        }
        Ok(result.text())
    }
}
