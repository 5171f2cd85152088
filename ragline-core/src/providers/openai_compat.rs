//! OpenAI-compatible LLM provider.
//!
//! Works with OpenAI, Azure OpenAI, Ollama, vLLM, LM Studio and any server
//! implementing `POST /chat/completions`. Streaming reads the SSE body
//! incrementally and stops as soon as the receiver goes away.

use super::rate_limiter;
use super::{
    SseLineBuffer, http_client, is_local_endpoint, map_transport_error, resolve_api_key,
};
use crate::brain::{LlmProvider, TokenCounter, estimate_tokens_heuristic};
use crate::config::LlmConfig;
use crate::error::LlmError;
use crate::types::{
    CompletionRequest, CompletionResponse, Content, Message, Role, StreamEvent, TokenUsage,
    ToolDefinition,
};
use async_trait::async_trait;
use futures::StreamExt;
use reqwest::Client;
use serde_json::{Value, json};
use std::collections::HashMap;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// Provider for any endpoint that speaks the OpenAI chat-completions protocol.
pub struct OpenAiCompatibleProvider {
    client: Client,
    base_url: String,
    api_key: String,
    model: String,
    context_window: usize,
    timeout_secs: u64,
    token_counter: Option<TokenCounter>,
}

impl OpenAiCompatibleProvider {
    /// Create a new provider from configuration.
    ///
    /// Reads the API key from `config.api_key` or the environment variable in
    /// `config.api_key_env`. Local endpoints do not need a key.
    pub fn new(config: &LlmConfig) -> Result<Self, LlmError> {
        let api_key = resolve_api_key(config)
            .or_else(|| {
                if is_local_endpoint(config.base_url.as_deref()) {
                    debug!("No API key set for local provider; using dummy bearer token");
                    Some("ollama".to_string())
                } else {
                    None
                }
            })
            .ok_or_else(|| LlmError::AuthFailed {
                provider: format!(
                    "OpenAI-compatible: env var '{}' not set",
                    config.api_key_env
                ),
            })?;
        Self::new_with_key(config, api_key)
    }

    /// Create a new provider with an explicitly provided API key.
    pub fn new_with_key(config: &LlmConfig, api_key: String) -> Result<Self, LlmError> {
        let base_url = config
            .base_url
            .clone()
            .unwrap_or_else(|| "https://api.openai.com/v1".to_string())
            .trim_end_matches('/')
            .to_string();

        Ok(Self {
            client: http_client(config)?,
            base_url,
            api_key,
            model: config.model.clone(),
            context_window: config.context_window,
            timeout_secs: config.timeout_secs,
            token_counter: TokenCounter::for_model(&config.model),
        })
    }

    /// Convert internal messages to OpenAI JSON format.
    fn messages_to_json(messages: &[Message]) -> Vec<Value> {
        messages
            .iter()
            .map(|msg| match &msg.content {
                Content::Text { text } => json!({
                    "role": msg.role.to_string(),
                    "content": text,
                }),
                Content::ToolCall {
                    id,
                    name,
                    arguments,
                } => json!({
                    "role": "assistant",
                    "content": null,
                    "tool_calls": [Self::tool_call_json(id, name, arguments)],
                }),
                Content::ToolResult {
                    call_id, output, ..
                } => json!({
                    "role": "tool",
                    "tool_call_id": call_id,
                    "content": output,
                }),
                Content::MultiPart { parts } => {
                    let text = msg.content.joined_text();
                    let tool_calls: Vec<Value> = parts
                        .iter()
                        .flat_map(|p| p.tool_calls())
                        .map(|(id, name, arguments)| Self::tool_call_json(id, name, arguments))
                        .collect();
                    if tool_calls.is_empty() {
                        json!({ "role": msg.role.to_string(), "content": text })
                    } else {
                        json!({
                            "role": "assistant",
                            "content": if text.is_empty() { Value::Null } else { Value::String(text) },
                            "tool_calls": tool_calls,
                        })
                    }
                }
            })
            .collect()
    }

    fn tool_call_json(id: &str, name: &str, arguments: &Value) -> Value {
        json!({
            "id": id,
            "type": "function",
            "function": {
                "name": name,
                "arguments": arguments.to_string(),
            }
        })
    }

    /// Convert tool definitions to OpenAI format.
    fn tools_to_json(tools: &[ToolDefinition]) -> Vec<Value> {
        tools
            .iter()
            .map(|t| {
                json!({
                    "type": "function",
                    "function": {
                        "name": t.name,
                        "description": t.description,
                        "parameters": t.parameters,
                    }
                })
            })
            .collect()
    }

    fn request_body(&self, request: &CompletionRequest, stream: bool) -> Value {
        let mut body = json!({
            "model": request.model.as_deref().unwrap_or(&self.model),
            "messages": Self::messages_to_json(&request.messages),
            "temperature": request.temperature,
            "stream": stream,
        });
        if stream {
            body["stream_options"] = json!({ "include_usage": true });
        }
        if let Some(max_tokens) = request.max_tokens {
            body["max_tokens"] = json!(max_tokens);
        }
        if !request.stop_sequences.is_empty() {
            body["stop"] = json!(request.stop_sequences);
        }
        if let Some(tools) = &request.tools
            && !tools.is_empty()
        {
            body["tools"] = json!(Self::tools_to_json(tools));
        }
        body
    }

    /// Parse an OpenAI-format response body into a CompletionResponse.
    fn parse_response(body: &Value, model: &str) -> Result<CompletionResponse, LlmError> {
        let choice = body
            .get("choices")
            .and_then(|c| c.get(0))
            .ok_or_else(|| LlmError::ResponseParse {
                message: "No choices in response".to_string(),
            })?;

        let message = choice
            .get("message")
            .ok_or_else(|| LlmError::ResponseParse {
                message: "No message in choice".to_string(),
            })?;

        let finish_reason = choice
            .get("finish_reason")
            .and_then(|f| f.as_str())
            .map(|s| s.to_string());

        let text = message
            .get("content")
            .and_then(|c| c.as_str())
            .unwrap_or("");

        let mut calls: Vec<Content> = message
            .get("tool_calls")
            .and_then(|t| t.as_array())
            .map(|arr| {
                arr.iter()
                    .filter_map(|tc| {
                        let id = tc.get("id")?.as_str()?;
                        let func = tc.get("function")?;
                        let name = func.get("name")?.as_str()?;
                        let args_str = func.get("arguments")?.as_str()?;
                        let arguments: Value =
                            serde_json::from_str(args_str).unwrap_or_else(|_| json!({}));
                        Some(Content::tool_call(id, name, arguments))
                    })
                    .collect()
            })
            .unwrap_or_default();

        let content = match (calls.len(), text.is_empty()) {
            (0, _) => Content::text(text),
            (1, true) => calls.remove(0),
            _ => {
                let mut parts = Vec::with_capacity(calls.len() + 1);
                if !text.is_empty() {
                    parts.push(Content::text(text));
                }
                parts.extend(calls);
                Content::MultiPart { parts }
            }
        };

        let usage = Self::parse_usage(body.get("usage"));
        let resp_model = body
            .get("model")
            .and_then(|m| m.as_str())
            .unwrap_or(model)
            .to_string();

        Ok(CompletionResponse {
            message: Message::new(Role::Assistant, content),
            usage,
            model: resp_model,
            finish_reason,
        })
    }

    fn parse_usage(usage: Option<&Value>) -> TokenUsage {
        let field = |name: &str| {
            usage
                .and_then(|u| u.get(name))
                .and_then(|t| t.as_u64())
                .unwrap_or(0) as usize
        };
        TokenUsage {
            input_tokens: field("prompt_tokens"),
            output_tokens: field("completion_tokens"),
        }
    }

    /// Parse a single SSE data line. Returns the parsed JSON if valid.
    fn parse_sse_line(line: &str) -> Option<Value> {
        let data = line
            .strip_prefix("data: ")
            .or_else(|| line.strip_prefix("data:"))?
            .trim();
        if data == "[DONE]" {
            return None;
        }
        serde_json::from_str(data).ok()
    }

    /// Map an HTTP status code to the appropriate LlmError.
    fn map_http_error(
        status: reqwest::StatusCode,
        headers: &reqwest::header::HeaderMap,
        body: &str,
    ) -> LlmError {
        match status.as_u16() {
            401 | 403 => {
                debug!(body = %body, "Authentication failed ({})", status);
                LlmError::AuthFailed {
                    provider: "OpenAI-compatible".to_string(),
                }
            }
            429 => LlmError::RateLimited {
                retry_after_secs: rate_limiter::retry_after_secs(headers, body),
            },
            code if code >= 500 => LlmError::ServerError {
                status: code,
                message: body.to_string(),
            },
            _ => LlmError::ApiRequest {
                message: format!("HTTP {}: {}", status, body),
            },
        }
    }

    async fn post(&self, body: &Value) -> Result<reqwest::Response, LlmError> {
        let url = format!("{}/chat/completions", self.base_url);
        debug!(url = %url, model = %self.model, "Sending OpenAI completion request");

        let response = self
            .client
            .post(&url)
            .bearer_auth(&self.api_key)
            .json(body)
            .send()
            .await
            .map_err(|e| map_transport_error(e, self.timeout_secs))?;

        let status = response.status();
        if !status.is_success() {
            let headers = response.headers().clone();
            let body_text = response.text().await.unwrap_or_default();
            return Err(Self::map_http_error(status, &headers, &body_text));
        }
        Ok(response)
    }

    /// Forward one parsed SSE chunk. Returns `false` once the receiver is gone.
    async fn forward_chunk(
        data: &Value,
        tx: &mpsc::Sender<StreamEvent>,
        usage: &mut TokenUsage,
        active_tool_calls: &mut HashMap<usize, String>,
    ) -> bool {
        if let Some(u) = data.get("usage").filter(|u| !u.is_null()) {
            *usage = Self::parse_usage(Some(u));
        }

        let Some(choice) = data.get("choices").and_then(|c| c.get(0)) else {
            return true;
        };
        let delta = choice.get("delta").cloned().unwrap_or_else(|| json!({}));

        if let Some(content) = delta.get("content").and_then(|c| c.as_str())
            && !content.is_empty()
            && tx.send(StreamEvent::Token(content.to_string())).await.is_err()
        {
            return false;
        }

        if let Some(tool_calls) = delta.get("tool_calls").and_then(|t| t.as_array()) {
            for tc in tool_calls {
                let index = tc.get("index").and_then(|i| i.as_u64()).unwrap_or(0) as usize;
                let Some(func) = tc.get("function") else {
                    continue;
                };
                if let Some(name) = func.get("name").and_then(|n| n.as_str()) {
                    let id = tc
                        .get("id")
                        .and_then(|i| i.as_str())
                        .unwrap_or_default()
                        .to_string();
                    active_tool_calls.insert(index, id.clone());
                    let event = StreamEvent::ToolCallStart {
                        id,
                        name: name.to_string(),
                    };
                    if tx.send(event).await.is_err() {
                        return false;
                    }
                }
                if let Some(args) = func.get("arguments").and_then(|a| a.as_str())
                    && !args.is_empty()
                    && let Some(id) = active_tool_calls.get(&index)
                {
                    let event = StreamEvent::ToolCallDelta {
                        id: id.clone(),
                        arguments_delta: args.to_string(),
                    };
                    if tx.send(event).await.is_err() {
                        return false;
                    }
                }
            }
        }

        if choice.get("finish_reason").and_then(|f| f.as_str()) == Some("tool_calls") {
            let mut ended: Vec<_> = active_tool_calls.drain().collect();
            ended.sort_by_key(|(index, _)| *index);
            for (_, id) in ended {
                if tx.send(StreamEvent::ToolCallEnd { id }).await.is_err() {
                    return false;
                }
            }
        }
        true
    }
}

#[async_trait]
impl LlmProvider for OpenAiCompatibleProvider {
    async fn complete(&self, request: CompletionRequest) -> Result<CompletionResponse, LlmError> {
        let body = self.request_body(&request, false);
        let response = self.post(&body).await?;
        let response_body = response
            .text()
            .await
            .map_err(|e| map_transport_error(e, self.timeout_secs))?;

        let json: Value =
            serde_json::from_str(&response_body).map_err(|e| LlmError::ResponseParse {
                message: format!("Invalid JSON: {}", e),
            })?;

        let parsed = Self::parse_response(&json, &self.model)?;
        info!(
            model = %parsed.model,
            input_tokens = parsed.usage.input_tokens,
            output_tokens = parsed.usage.output_tokens,
            "Completion received"
        );
        Ok(parsed)
    }

    async fn complete_streaming(
        &self,
        request: CompletionRequest,
        tx: mpsc::Sender<StreamEvent>,
    ) -> Result<(), LlmError> {
        let body = self.request_body(&request, true);
        let response = self.post(&body).await?;

        let mut byte_stream = response.bytes_stream();
        let mut usage = TokenUsage::default();
        let mut active_tool_calls: HashMap<usize, String> = HashMap::new();
        let mut lines = SseLineBuffer::default();

        'read: while let Some(chunk_result) = byte_stream.next().await {
            let chunk = chunk_result.map_err(|e| LlmError::Streaming {
                message: format!("Failed to read streaming chunk: {}", e),
            })?;
            lines.extend(&chunk);

            while let Some(line) = lines.next_line() {
                if line.is_empty() || line.starts_with(':') {
                    continue;
                }
                if line == "data: [DONE]" || line == "data:[DONE]" {
                    break 'read;
                }
                match Self::parse_sse_line(&line) {
                    Some(data) => {
                        if !Self::forward_chunk(&data, &tx, &mut usage, &mut active_tool_calls)
                            .await
                        {
                            debug!("Stream receiver dropped; abandoning response");
                            return Ok(());
                        }
                    }
                    None => warn!(line = %line, "Skipping unparseable SSE line"),
                }
            }
        }

        let _ = tx.send(StreamEvent::Done { usage }).await;
        Ok(())
    }

    fn estimate_tokens(&self, messages: &[Message]) -> usize {
        match &self.token_counter {
            Some(counter) => counter.count_messages(messages),
            None => estimate_tokens_heuristic(messages),
        }
    }

    fn context_window(&self) -> usize {
        self.context_window
    }

    fn supports_tools(&self) -> bool {
        true
    }

    fn model_name(&self) -> &str {
        &self.model
    }
}
