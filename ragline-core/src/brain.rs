//! Brain module: LLM provider abstraction.
//!
//! Defines the `LlmProvider` trait for model-agnostic completions, a
//! tiktoken-backed `TokenCounter`, and a scriptable `MockLlmProvider` used
//! throughout the test suites.

use crate::error::LlmError;
use crate::types::{
    CompletionRequest, CompletionResponse, Content, Message, Role, StreamEvent, TokenUsage,
};
use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::mpsc;

/// Trait for LLM providers, supporting both full and streaming completions.
#[async_trait]
pub trait LlmProvider: Send + Sync {
    /// Perform a full completion and return the response.
    async fn complete(&self, request: CompletionRequest) -> Result<CompletionResponse, LlmError>;

    /// Perform a streaming completion, sending events to the channel.
    ///
    /// Implementations stop producing as soon as the receiver is dropped.
    async fn complete_streaming(
        &self,
        request: CompletionRequest,
        tx: mpsc::Sender<StreamEvent>,
    ) -> Result<(), LlmError>;

    /// Estimate the token count for a set of messages.
    fn estimate_tokens(&self, messages: &[Message]) -> usize;

    /// Return the context window size for this provider/model.
    fn context_window(&self) -> usize;

    /// Return whether this provider supports tool/function calling.
    fn supports_tools(&self) -> bool;

    /// Return the model name.
    fn model_name(&self) -> &str;
}

/// Token counter using tiktoken-rs for accurate BPE tokenization.
pub struct TokenCounter {
    bpe: tiktoken_rs::CoreBPE,
}

impl TokenCounter {
    /// Create a token counter for the given model.
    /// Falls back to cl100k_base if the model isn't recognized.
    pub fn for_model(model: &str) -> Option<Self> {
        tiktoken_rs::get_bpe_from_model(model)
            .or_else(|_| tiktoken_rs::cl100k_base())
            .ok()
            .map(|bpe| Self { bpe })
    }

    /// Count the number of tokens in a string.
    pub fn count(&self, text: &str) -> usize {
        self.bpe.encode_with_special_tokens(text).len()
    }

    /// Estimate the token count for a set of messages.
    /// Adds overhead for message structure (role, separators).
    pub fn count_messages(&self, messages: &[Message]) -> usize {
        let mut total = 0;
        for msg in messages {
            // role token + separators
            total += 4;
            total += self.count_content(&msg.content);
        }
        total + 3
    }

    fn count_content(&self, content: &Content) -> usize {
        match content {
            Content::Text { text } => self.count(text),
            Content::ToolCall {
                name, arguments, ..
            } => self.count(name) + self.count(&arguments.to_string()),
            Content::ToolResult { output, .. } => self.count(output),
            Content::MultiPart { parts } => parts.iter().map(|p| self.count_content(p)).sum(),
        }
    }
}

/// Rough token estimate (~4 chars per token) for providers without a tokenizer.
pub fn estimate_tokens_heuristic(messages: &[Message]) -> usize {
    fn content_len(content: &Content) -> usize {
        match content {
            Content::Text { text } => text.len(),
            Content::ToolCall { arguments, .. } => arguments.to_string().len(),
            Content::ToolResult { output, .. } => output.len(),
            Content::MultiPart { parts } => parts.iter().map(content_len).sum(),
        }
    }
    messages.iter().map(|m| content_len(&m.content) / 4 + 4).sum()
}

/// A mock LLM provider for testing and development.
///
/// Responses (or errors) are consumed in FIFO order. When the queue is empty
/// the default text is returned. Streaming splits the text into chunks that
/// concatenate back to exactly the full response.
pub struct MockLlmProvider {
    model: String,
    context_window: usize,
    default_text: String,
    responses: Mutex<VecDeque<Result<CompletionResponse, LlmError>>>,
    requests: Mutex<Vec<CompletionRequest>>,
    chunk_delay: Option<Duration>,
    stream_error_after: Option<usize>,
    active_streams: Arc<AtomicUsize>,
}

impl MockLlmProvider {
    pub fn new() -> Self {
        Self {
            model: "mock-model".to_string(),
            context_window: 128_000,
            default_text: "I'm a mock LLM. No queued responses available.".to_string(),
            responses: Mutex::new(VecDeque::new()),
            requests: Mutex::new(Vec::new()),
            chunk_delay: None,
            stream_error_after: None,
            active_streams: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Create a MockLlmProvider that answers every call with the given text.
    pub fn with_response(text: &str) -> Self {
        Self {
            default_text: text.to_string(),
            ..Self::new()
        }
    }

    /// Sleep between streamed chunks.
    pub fn with_chunk_delay(mut self, delay: Duration) -> Self {
        self.chunk_delay = Some(delay);
        self
    }

    /// Emit a `StreamEvent::Error` after `chunks` tokens instead of finishing.
    pub fn with_stream_error_after(mut self, chunks: usize) -> Self {
        self.stream_error_after = Some(chunks);
        self
    }

    /// Queue a response to be returned by the next call.
    pub fn queue_response(&self, response: CompletionResponse) {
        self.responses
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push_back(Ok(response));
    }

    /// Queue an error to be returned by the next call.
    pub fn queue_error(&self, error: LlmError) {
        self.responses
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push_back(Err(error));
    }

    /// Requests received so far, in call order.
    pub fn recorded_requests(&self) -> Vec<CompletionRequest> {
        self.requests
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Number of `complete`/`complete_streaming` calls received.
    pub fn call_count(&self) -> usize {
        self.requests
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Streams currently producing chunks.
    pub fn active_streams(&self) -> usize {
        self.active_streams.load(Ordering::SeqCst)
    }

    /// Create a simple text response for testing.
    pub fn text_response(text: &str) -> CompletionResponse {
        CompletionResponse {
            message: Message::assistant(text),
            usage: TokenUsage {
                input_tokens: 100,
                output_tokens: 50,
            },
            model: "mock-model".to_string(),
            finish_reason: Some("stop".to_string()),
        }
    }

    /// Create a tool call response for testing.
    pub fn tool_call_response(tool_name: &str, arguments: serde_json::Value) -> CompletionResponse {
        let call_id = format!("call_{}", uuid::Uuid::new_v4());
        CompletionResponse {
            message: Message::new(
                Role::Assistant,
                Content::tool_call(&call_id, tool_name, arguments),
            ),
            usage: TokenUsage {
                input_tokens: 100,
                output_tokens: 30,
            },
            model: "mock-model".to_string(),
            finish_reason: Some("tool_calls".to_string()),
        }
    }

    fn next_response(
        &self,
        request: CompletionRequest,
    ) -> Result<CompletionResponse, LlmError> {
        self.requests
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(request);
        self.responses
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .pop_front()
            .unwrap_or_else(|| Ok(Self::text_response(&self.default_text)))
    }
}

impl Default for MockLlmProvider {
    fn default() -> Self {
        Self::new()
    }
}

/// Decrements the active stream counter when a stream ends for any reason.
struct StreamGuard(Arc<AtomicUsize>);

impl StreamGuard {
    fn enter(counter: &Arc<AtomicUsize>) -> Self {
        counter.fetch_add(1, Ordering::SeqCst);
        Self(Arc::clone(counter))
    }
}

impl Drop for StreamGuard {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl LlmProvider for MockLlmProvider {
    async fn complete(&self, request: CompletionRequest) -> Result<CompletionResponse, LlmError> {
        self.next_response(request)
    }

    async fn complete_streaming(
        &self,
        request: CompletionRequest,
        tx: mpsc::Sender<StreamEvent>,
    ) -> Result<(), LlmError> {
        let response = self.next_response(request)?;
        let _guard = StreamGuard::enter(&self.active_streams);

        let text = response.text();
        for (i, chunk) in text.split_inclusive(' ').enumerate() {
            if self.stream_error_after == Some(i) {
                let _ = tx
                    .send(StreamEvent::Error("mock stream interrupted".into()))
                    .await;
                return Ok(());
            }
            if let Some(delay) = self.chunk_delay {
                tokio::time::sleep(delay).await;
            }
            if tx.send(StreamEvent::Token(chunk.to_string())).await.is_err() {
                // Receiver gone: the consumer cancelled.
                return Ok(());
            }
        }
        for (id, name, arguments) in response.message.content.tool_calls() {
            let events = [
                StreamEvent::ToolCallStart {
                    id: id.to_string(),
                    name: name.to_string(),
                },
                StreamEvent::ToolCallDelta {
                    id: id.to_string(),
                    arguments_delta: arguments.to_string(),
                },
                StreamEvent::ToolCallEnd { id: id.to_string() },
            ];
            for event in events {
                if tx.send(event).await.is_err() {
                    return Ok(());
                }
            }
        }
        let _ = tx
            .send(StreamEvent::Done {
                usage: response.usage,
            })
            .await;
        Ok(())
    }

    fn estimate_tokens(&self, messages: &[Message]) -> usize {
        estimate_tokens_heuristic(messages) + 100
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
