//! Anthropic Messages API provider implementation.
//!
//! Key differences from OpenAI-compatible APIs:
//! - Auth via `x-api-key` header (not `Authorization: Bearer`)
//! - Required `anthropic-version` header
//! - System message is a top-level `system` field, not in the messages array
//! - Tool calls use `tool_use` / `tool_result` content block conventions
//! - SSE streaming uses Anthropic-specific event types

use super::rate_limiter;
use super::{SseLineBuffer, http_client, map_transport_error, resolve_api_key};
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
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// The default Anthropic API base URL.
const DEFAULT_BASE_URL: &str = "https://api.anthropic.com/v1";

/// The required Anthropic API version header value.
const ANTHROPIC_VERSION: &str = "2023-06-01";

/// Anthropic Messages API provider.
pub struct AnthropicProvider {
    client: Client,
    base_url: String,
    api_key: String,
    model: String,
    context_window: usize,
    timeout_secs: u64,
    default_max_tokens: usize,
    token_counter: Option<TokenCounter>,
}

/// Per-stream state for correlating tool-use deltas with their block.
#[derive(Default)]
struct SseState {
    event_type: String,
    block_id: Option<String>,
    block_is_tool: bool,
    usage: TokenUsage,
}

/// What the stream loop should do after an SSE event.
enum SseControl {
    Continue,
    Stop,
    ReceiverGone,
}

impl AnthropicProvider {
    /// Create a new Anthropic provider from configuration.
    ///
    /// Returns `LlmError::AuthFailed` if no API key can be resolved.
    pub fn new(config: &LlmConfig) -> Result<Self, LlmError> {
        let api_key = resolve_api_key(config).ok_or_else(|| LlmError::AuthFailed {
            provider: format!("Anthropic (env var '{}' not set)", config.api_key_env),
        })?;
        Self::new_with_key(config, api_key)
    }

    /// Create a new Anthropic provider with an explicitly provided API key.
    pub fn new_with_key(config: &LlmConfig, api_key: String) -> Result<Self, LlmError> {
        let base_url = config
            .base_url
            .as_deref()
            .unwrap_or(DEFAULT_BASE_URL)
            .trim_end_matches('/')
            .to_string();
        Ok(Self {
            client: http_client(config)?,
            base_url,
            api_key,
            model: config.model.clone(),
            context_window: config.context_window,
            timeout_secs: config.timeout_secs,
            default_max_tokens: config.max_tokens,
            token_counter: TokenCounter::for_model(&config.model),
        })
    }

    fn build_request_body(&self, request: &CompletionRequest, stream: bool) -> Value {
        let model = request.model.as_deref().unwrap_or(&self.model);
        let max_tokens = request.max_tokens.unwrap_or(self.default_max_tokens);

        let (system_text, non_system_messages) = Self::extract_system_message(&request.messages);
        let messages_json: Vec<Value> = non_system_messages
            .iter()
            .map(|msg| Self::message_to_anthropic_json(msg))
            .collect();

        let mut body = json!({
            "model": model,
            "max_tokens": max_tokens,
            "temperature": request.temperature,
            "messages": messages_json,
        });
        if let Some(system) = system_text {
            body["system"] = Value::String(system);
        }
        if !request.stop_sequences.is_empty() {
            body["stop_sequences"] = json!(request.stop_sequences);
        }
        if let Some(tools) = &request.tools
            && !tools.is_empty()
        {
            let tools_json: Vec<Value> = tools.iter().map(Self::tool_definition_to_json).collect();
            body["tools"] = Value::Array(tools_json);
        }
        if stream {
            body["stream"] = Value::Bool(true);
        }
        body
    }

    /// Split system messages out of the conversation.
    ///
    /// Multiple system messages are joined with blank lines.
    fn extract_system_message(messages: &[Message]) -> (Option<String>, Vec<&Message>) {
        let (system, rest): (Vec<&Message>, Vec<&Message>) =
            messages.iter().partition(|m| m.role == Role::System);
        let parts: Vec<String> = system
            .iter()
            .map(|m| m.content.joined_text())
            .filter(|t| !t.is_empty())
            .collect();
        let system_text = (!parts.is_empty()).then(|| parts.join("\n\n"));
        (system_text, rest)
    }

    fn message_to_anthropic_json(msg: &Message) -> Value {
        let role = match msg.role {
            Role::Assistant => "assistant",
            Role::User | Role::Tool | Role::System => "user",
        };
        json!({
            "role": role,
            "content": Self::content_to_anthropic_json(&msg.content),
        })
    }

    fn content_to_anthropic_json(content: &Content) -> Value {
        match content {
            Content::Text { text } => json!([{ "type": "text", "text": text }]),
            Content::ToolCall {
                id,
                name,
                arguments,
            } => json!([{
                "type": "tool_use",
                "id": id,
                "name": name,
                "input": arguments,
            }]),
            Content::ToolResult {
                call_id,
                output,
                is_error,
            } => {
                let mut block = json!({
                    "type": "tool_result",
                    "tool_use_id": call_id,
                    "content": output,
                });
                if *is_error {
                    block["is_error"] = Value::Bool(true);
                }
                json!([block])
            }
            Content::MultiPart { parts } => Value::Array(
                parts
                    .iter()
                    .flat_map(|part| match Self::content_to_anthropic_json(part) {
                        Value::Array(arr) => arr,
                        other => vec![other],
                    })
                    .collect(),
            ),
        }
    }

    fn tool_definition_to_json(tool: &ToolDefinition) -> Value {
        json!({
            "name": tool.name,
            "description": tool.description,
            "input_schema": tool.parameters,
        })
    }

    /// Parse an Anthropic API response JSON into a `CompletionResponse`.
    fn parse_response(body: &Value, fallback_model: &str) -> Result<CompletionResponse, LlmError> {
        let model = body["model"].as_str().unwrap_or(fallback_model).to_string();
        let finish_reason = body["stop_reason"].as_str().map(|s| s.to_string());
        let usage = TokenUsage {
            input_tokens: body["usage"]["input_tokens"].as_u64().unwrap_or(0) as usize,
            output_tokens: body["usage"]["output_tokens"].as_u64().unwrap_or(0) as usize,
        };
        let blocks = body["content"]
            .as_array()
            .ok_or_else(|| LlmError::ResponseParse {
                message: "Missing 'content' array in response".to_string(),
            })?;

        Ok(CompletionResponse {
            message: Message::new(Role::Assistant, Self::parse_content_blocks(blocks)),
            usage,
            model,
            finish_reason,
        })
    }

    /// One block becomes its own `Content`; several become `MultiPart`.
    fn parse_content_blocks(blocks: &[Value]) -> Content {
        let mut parts: Vec<Content> = blocks
            .iter()
            .filter_map(|block| match block["type"].as_str().unwrap_or("text") {
                "text" => Some(Content::text(block["text"].as_str().unwrap_or_default())),
                "tool_use" => Some(Content::tool_call(
                    block["id"].as_str().unwrap_or_default(),
                    block["name"].as_str().unwrap_or_default(),
                    block["input"].clone(),
                )),
                other => {
                    debug!(block_type = other, "Ignoring unknown content block type");
                    None
                }
            })
            .collect();

        match parts.len() {
            0 => Content::text(""),
            1 => parts.remove(0),
            _ => Content::MultiPart { parts },
        }
    }

    fn map_http_error(
        status: reqwest::StatusCode,
        headers: &reqwest::header::HeaderMap,
        body_text: &str,
    ) -> LlmError {
        match status.as_u16() {
            401 | 403 => LlmError::AuthFailed {
                provider: "Anthropic".to_string(),
            },
            429 => LlmError::RateLimited {
                retry_after_secs: rate_limiter::retry_after_secs(headers, body_text),
            },
            // 529 is Anthropic's "overloaded".
            code if code >= 500 => LlmError::ServerError {
                status: code,
                message: body_text.to_string(),
            },
            _ => LlmError::ApiRequest {
                message: format!("HTTP {} from Anthropic API: {}", status, body_text),
            },
        }
    }

    async fn post(&self, body: &Value) -> Result<reqwest::Response, LlmError> {
        let url = format!("{}/messages", self.base_url);
        debug!(model = %self.model, url = %url, "Sending Anthropic request");

        let response = self
            .client
            .post(&url)
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", ANTHROPIC_VERSION)
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

    /// Handle one SSE line, forwarding content to `tx`.
    async fn process_sse_line(
        line: &str,
        state: &mut SseState,
        tx: &mpsc::Sender<StreamEvent>,
    ) -> Result<SseControl, LlmError> {
        if let Some(event) = line.strip_prefix("event:") {
            state.event_type = event.trim().to_string();
            return Ok(SseControl::Continue);
        }
        let Some(data) = line.strip_prefix("data:") else {
            return Ok(SseControl::Continue);
        };
        let data: Value = match serde_json::from_str(data.trim()) {
            Ok(v) => v,
            Err(e) => {
                warn!(error = %e, "Failed to parse Anthropic SSE data");
                return Ok(SseControl::Continue);
            }
        };
        // The payload repeats the event name in "type"; prefer it.
        let event_type = data["type"]
            .as_str()
            .map(str::to_string)
            .unwrap_or_else(|| std::mem::take(&mut state.event_type));

        let outgoing = match event_type.as_str() {
            "message_start" => {
                state.usage.input_tokens =
                    data["message"]["usage"]["input_tokens"].as_u64().unwrap_or(0) as usize;
                None
            }
            "content_block_start" => {
                let block = &data["content_block"];
                state.block_is_tool = block["type"].as_str() == Some("tool_use");
                if state.block_is_tool {
                    let id = block["id"].as_str().unwrap_or_default().to_string();
                    state.block_id = Some(id.clone());
                    Some(StreamEvent::ToolCallStart {
                        id,
                        name: block["name"].as_str().unwrap_or_default().to_string(),
                    })
                } else {
                    None
                }
            }
            "content_block_delta" => {
                let delta = &data["delta"];
                match delta["type"].as_str().unwrap_or_default() {
                    "text_delta" => delta["text"]
                        .as_str()
                        .filter(|t| !t.is_empty())
                        .map(|t| StreamEvent::Token(t.to_string())),
                    "input_json_delta" => {
                        state
                            .block_id
                            .clone()
                            .map(|id| StreamEvent::ToolCallDelta {
                                id,
                                arguments_delta: delta["partial_json"]
                                    .as_str()
                                    .unwrap_or_default()
                                    .to_string(),
                            })
                    }
                    other => {
                        debug!(delta_type = other, "Ignoring unknown delta type in stream");
                        None
                    }
                }
            }
            "content_block_stop" => {
                let was_tool = std::mem::take(&mut state.block_is_tool);
                match state.block_id.take() {
                    Some(id) if was_tool => Some(StreamEvent::ToolCallEnd { id }),
                    _ => None,
                }
            }
            "message_delta" => {
                state.usage.output_tokens +=
                    data["usage"]["output_tokens"].as_u64().unwrap_or(0) as usize;
                None
            }
            "message_stop" => return Ok(SseControl::Stop),
            "error" => {
                let message = data["error"]["message"]
                    .as_str()
                    .unwrap_or("Unknown streaming error")
                    .to_string();
                let _ = tx.send(StreamEvent::Error(message.clone())).await;
                return Err(LlmError::Streaming { message });
            }
            _ => None,
        };

        if let Some(event) = outgoing
            && tx.send(event).await.is_err()
        {
            return Ok(SseControl::ReceiverGone);
        }
        Ok(SseControl::Continue)
    }
}

#[async_trait]
impl LlmProvider for AnthropicProvider {
    async fn complete(&self, request: CompletionRequest) -> Result<CompletionResponse, LlmError> {
        let body = self.build_request_body(&request, false);
        let response = self.post(&body).await?;
        let body_text = response
            .text()
            .await
            .map_err(|e| map_transport_error(e, self.timeout_secs))?;

        let response_json: Value =
            serde_json::from_str(&body_text).map_err(|e| LlmError::ResponseParse {
                message: format!("Invalid JSON in response: {}", e),
            })?;

        let parsed = Self::parse_response(&response_json, &self.model)?;
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
        let body = self.build_request_body(&request, true);
        let response = self.post(&body).await?;

        let mut byte_stream = response.bytes_stream();
        let mut state = SseState::default();
        let mut lines = SseLineBuffer::default();

        'read: while let Some(chunk_result) = byte_stream.next().await {
            let chunk = chunk_result.map_err(|e| LlmError::Streaming {
                message: format!("Failed to read streaming chunk: {}", e),
            })?;
            lines.extend(&chunk);

            while let Some(line) = lines.next_line() {
                if line.is_empty() {
                    continue;
                }
                match Self::process_sse_line(&line, &mut state, &tx).await? {
                    SseControl::Continue => {}
                    SseControl::Stop => break 'read,
                    SseControl::ReceiverGone => {
                        debug!("Stream receiver dropped; abandoning response");
                        return Ok(());
                    }
                }
            }
        }

        let _ = tx.send(StreamEvent::Done { usage: state.usage }).await;
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

#[cfg(test)]
mod tests {
    use super::*;

    fn test_config(base_url: Option<String>) -> LlmConfig {
        LlmConfig {
            provider: "anthropic".into(),
            model: "claude-sonnet-4-20250514".into(),
            api_key: Some("sk-ant-test".into()),
            base_url,
            max_tokens: 1024,
            context_window: 200_000,
            timeout_secs: 5,
            ..Default::default()
        }
    }

    fn make_provider() -> AnthropicProvider {
        AnthropicProvider::new(&test_config(None)).unwrap()
    }

    #[test]
    fn test_system_message_extraction() {
        let messages = vec![
            Message::system("Ground your answer."),
            Message::system("Cite fragments."),
            Message::user("Hello"),
        ];
        let (system, rest) = AnthropicProvider::extract_system_message(&messages);
        assert_eq!(
            system.as_deref(),
            Some("Ground your answer.\n\nCite fragments.")
        );
        assert_eq!(rest.len(), 1);
    }

    #[test]
    fn test_request_body_shape() {
        let provider = make_provider();
        let request = CompletionRequest {
            messages: vec![Message::system("sys"), Message::user("hi")],
            temperature: 0.0,
            ..Default::default()
        };
        let body = provider.build_request_body(&request, true);
        assert_eq!(body["system"], "sys");
        assert_eq!(body["max_tokens"], 1024);
        assert_eq!(body["stream"], true);
        assert_eq!(body["messages"][0]["content"][0]["text"], "hi");
        assert!(body.get("tools").is_none());
    }

    #[test]
    fn test_tool_result_json() {
        let msg = Message::tool_result("toolu_01", "boom", true);
        let json = AnthropicProvider::message_to_anthropic_json(&msg);
        assert_eq!(json["role"], "user");
        assert_eq!(json["content"][0]["type"], "tool_result");
        assert_eq!(json["content"][0]["is_error"], true);
    }

    #[test]
    fn test_parse_tool_use_response() {
        let body = json!({
            "model": "claude-sonnet-4-20250514",
            "stop_reason": "tool_use",
            "content": [
                {"type": "text", "text": "Let me check the time."},
                {"type": "tool_use", "id": "toolu_01", "name": "current_date_time", "input": {}}
            ],
            "usage": {"input_tokens": 30, "output_tokens": 12}
        });
        let resp = AnthropicProvider::parse_response(&body, "m").unwrap();
        assert_eq!(resp.text(), "Let me check the time.");
        assert!(resp.has_tool_calls());
        assert_eq!(resp.usage.total(), 42);
        assert_eq!(resp.finish_reason.as_deref(), Some("tool_use"));
    }

    #[test]
    fn test_http_error_mapping() {
        let headers = reqwest::header::HeaderMap::new();
        let err = AnthropicProvider::map_http_error(
            reqwest::StatusCode::UNAUTHORIZED,
            &headers,
            "{}",
        );
        assert!(matches!(err, LlmError::AuthFailed { .. }));

        let err = AnthropicProvider::map_http_error(
            reqwest::StatusCode::TOO_MANY_REQUESTS,
            &headers,
            "{}",
        );
        assert!(matches!(err, LlmError::RateLimited { .. }));

        let overloaded = reqwest::StatusCode::from_u16(529).unwrap();
        let err = AnthropicProvider::map_http_error(overloaded, &headers, "overloaded");
        assert!(err.is_retryable());
    }

    #[tokio::test]
    async fn test_streaming_against_mock_server() {
        let events = [
            (
                "message_start",
                r#"{"type":"message_start","message":{"usage":{"input_tokens":25,"output_tokens":0}}}"#,
            ),
            (
                "content_block_start",
                r#"{"type":"content_block_start","index":0,"content_block":{"type":"text","text":""}}"#,
            ),
            ("ping", r#"{"type":"ping"}"#),
            (
                "content_block_delta",
                r#"{"type":"content_block_delta","index":0,"delta":{"type":"text_delta","text":"I don't "}}"#,
            ),
            (
                "content_block_delta",
                r#"{"type":"content_block_delta","index":0,"delta":{"type":"text_delta","text":"know."}}"#,
            ),
            (
                "content_block_stop",
                r#"{"type":"content_block_stop","index":0}"#,
            ),
            (
                "message_delta",
                r#"{"type":"message_delta","delta":{"stop_reason":"end_turn"},"usage":{"output_tokens":4}}"#,
            ),
            ("message_stop", r#"{"type":"message_stop"}"#),
        ];
        let body: String = events
            .iter()
            .map(|(event, data)| format!("event: {event}\ndata: {data}\n\n"))
            .collect();

        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/messages")
            .match_header("x-api-key", "sk-ant-test")
            .match_header("anthropic-version", ANTHROPIC_VERSION)
            .with_status(200)
            .with_header("content-type", "text/event-stream")
            .with_body(body)
            .create_async()
            .await;

        let provider = AnthropicProvider::new(&test_config(Some(server.url()))).unwrap();
        let (tx, mut rx) = mpsc::channel(16);
        let request = CompletionRequest {
            messages: vec![Message::user("How do I implement GraphQL?")],
            ..Default::default()
        };
        provider.complete_streaming(request, tx).await.unwrap();

        let mut tokens = Vec::new();
        let mut usage = None;
        while let Some(event) = rx.recv().await {
            match event {
                StreamEvent::Token(t) => tokens.push(t),
                StreamEvent::Done { usage: u } => usage = Some(u),
                other => panic!("unexpected event {other:?}"),
            }
        }
        assert_eq!(tokens.concat(), "I don't know.");
        assert_eq!(
            usage.unwrap(),
            TokenUsage {
                input_tokens: 25,
                output_tokens: 4
            }
        );
        mock.assert_async().await;
    }
}
