//! General chat surface: system prompts, conversation memory, templates,
//! structured output, streaming and tool calling.
//!
//! ```text
//! client.prompt("What time is it?").conversation("c1").content().await?
//! ```

pub mod memory;
pub mod template;
pub mod tools;

pub use memory::ConversationMemory;
pub use template::PromptTemplate;
pub use tools::{DateTimeTools, ToolCallback, ToolRegistry};

use crate::brain::LlmProvider;
use crate::config::{RaglineConfig, RetryConfig};
use crate::error::{RagError, RaglineError, Result};
use crate::providers::with_retry;
use crate::rag::{CompletionClient, CompletionStream};
use crate::types::{CompletionRequest, Message, TokenUsage};
use futures::Stream;
use serde::de::DeserializeOwned;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use tracing::{debug, info, warn};

/// Appended to the user message when a typed entity is requested.
const JSON_INSTRUCTIONS: &str = "\n\nRespond only with valid JSON. Do not include explanations \
or markdown formatting.";

/// A reusable chat client. Cheap to share behind an `Arc`.
pub struct ChatClient {
    provider: Arc<dyn LlmProvider>,
    retry: RetryConfig,
    default_system: Option<String>,
    memory: Arc<ConversationMemory>,
    tools: Arc<ToolRegistry>,
    max_tool_rounds: usize,
    temperature: f32,
    max_tokens: Option<usize>,
}

impl ChatClient {
    pub fn new(provider: Arc<dyn LlmProvider>) -> Self {
        Self {
            provider,
            retry: RetryConfig::default(),
            default_system: None,
            memory: Arc::new(ConversationMemory::default()),
            tools: Arc::new(ToolRegistry::new()),
            max_tool_rounds: 5,
            temperature: 0.7,
            max_tokens: None,
        }
    }

    pub fn from_config(
        config: &RaglineConfig,
        provider: Arc<dyn LlmProvider>,
        tools: ToolRegistry,
    ) -> Self {
        let mut client = Self::new(provider)
            .with_retry(config.retry.clone())
            .with_memory(Arc::new(ConversationMemory::new(config.chat.memory_window)))
            .with_tools(Arc::new(tools))
            .with_max_tool_rounds(config.chat.max_tool_rounds)
            .with_temperature(config.llm.temperature)
            .with_max_tokens(config.llm.max_tokens);
        client.default_system = config.chat.default_system.clone();
        client
    }

    pub fn with_default_system(mut self, system: impl Into<String>) -> Self {
        self.default_system = Some(system.into());
        self
    }

    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_memory(mut self, memory: Arc<ConversationMemory>) -> Self {
        self.memory = memory;
        self
    }

    pub fn with_tools(mut self, tools: Arc<ToolRegistry>) -> Self {
        self.tools = tools;
        self
    }

    pub fn with_max_tool_rounds(mut self, rounds: usize) -> Self {
        self.max_tool_rounds = rounds;
        self
    }

    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = temperature;
        self
    }

    pub fn with_max_tokens(mut self, max_tokens: usize) -> Self {
        self.max_tokens = Some(max_tokens);
        self
    }

    pub fn memory(&self) -> &ConversationMemory {
        &self.memory
    }

    pub fn tools(&self) -> &ToolRegistry {
        &self.tools
    }

    /// Start building a request for one user message.
    pub fn prompt(&self, user: impl Into<String>) -> ChatRequest<'_> {
        ChatRequest {
            client: self,
            system: None,
            user: user.into(),
            conversation: None,
            use_tools: true,
        }
    }
}

/// One round of conversation, built fluently from [`ChatClient::prompt`].
pub struct ChatRequest<'a> {
    client: &'a ChatClient,
    system: Option<String>,
    user: String,
    conversation: Option<String>,
    use_tools: bool,
}

/// A finished chat round.
#[derive(Debug, Clone)]
pub struct ChatResponse {
    pub content: String,
    /// Usage summed over every model call in the round.
    pub usage: TokenUsage,
    pub model: String,
    pub finish_reason: Option<String>,
    /// Model/tool round trips taken.
    pub tool_rounds: usize,
}

impl<'a> ChatRequest<'a> {
    /// Override the client's default system prompt.
    pub fn system(mut self, system: impl Into<String>) -> Self {
        self.system = Some(system.into());
        self
    }

    /// Remember this exchange and include earlier turns of the conversation.
    pub fn conversation(mut self, id: impl Into<String>) -> Self {
        self.conversation = Some(id.into());
        self
    }

    /// Do not offer registered tools to the model.
    pub fn without_tools(mut self) -> Self {
        self.use_tools = false;
        self
    }

    fn messages(&self) -> Vec<Message> {
        let mut messages = Vec::new();
        if let Some(system) = self.system.as_ref().or(self.client.default_system.as_ref()) {
            messages.push(Message::system(system.as_str()));
        }
        if let Some(id) = &self.conversation {
            messages.extend(self.client.memory.history(id));
        }
        messages.push(Message::user(self.user.as_str()));
        messages
    }

    fn remember(&self, answer: &str) {
        if let Some(id) = &self.conversation {
            self.client.memory.append(
                id,
                [Message::user(self.user.as_str()), Message::assistant(answer)],
            );
        }
    }

    /// Run the round, executing any tool calls the model makes.
    pub async fn call(self) -> Result<ChatResponse> {
        let client = self.client;
        let mut messages = self.messages();
        let definitions = (self.use_tools && !client.tools.is_empty())
            .then(|| client.tools.definitions());
        let mut usage = TokenUsage::default();
        let mut rounds = 0;

        loop {
            let offer_tools = rounds < client.max_tool_rounds;
            let request = CompletionRequest {
                messages: messages.clone(),
                tools: definitions.clone().filter(|_| offer_tools),
                temperature: client.temperature,
                max_tokens: client.max_tokens,
                ..Default::default()
            };
            debug!(
                messages = request.messages.len(),
                tools = request.tools.as_ref().map_or(0, Vec::len),
                "Sending chat request"
            );
            let response = with_retry(&client.retry, || {
                let provider = Arc::clone(&client.provider);
                let request = request.clone();
                async move { provider.complete(request).await }
            })
            .await?;
            usage.accumulate(&response.usage);

            let calls: Vec<(String, String, serde_json::Value)> = response
                .message
                .content
                .tool_calls()
                .into_iter()
                .map(|(id, name, args)| (id.to_string(), name.to_string(), args.clone()))
                .collect();

            if calls.is_empty() || !offer_tools {
                if !calls.is_empty() {
                    warn!(rounds, "Model kept calling tools after the round limit");
                }
                let content = response.text();
                self.remember(&content);
                info!(
                    model = %response.model,
                    tool_rounds = rounds,
                    input_tokens = usage.input_tokens,
                    output_tokens = usage.output_tokens,
                    "Chat round finished"
                );
                return Ok(ChatResponse {
                    content,
                    usage,
                    model: response.model,
                    finish_reason: response.finish_reason,
                    tool_rounds: rounds,
                });
            }

            rounds += 1;
            messages.push(response.message);
            for (id, name, args) in calls {
                let result = match client.tools.execute(&name, args).await {
                    Ok(output) => Message::tool_result(id, output, false),
                    Err(e) => {
                        warn!(tool = %name, error = %e, "Tool call failed");
                        Message::tool_result(id, e.to_string(), true)
                    }
                };
                messages.push(result);
            }
        }
    }

    /// The answer text only.
    pub async fn content(self) -> Result<String> {
        Ok(self.call().await?.content)
    }

    /// Ask for JSON and deserialize it into `T`.
    pub async fn entity<T: DeserializeOwned>(mut self) -> Result<T> {
        self.user.push_str(JSON_INSTRUCTIONS);
        let content = self.call().await?.content;
        extract_json(&content).map_err(RaglineError::Serialization)
    }

    /// Stream the answer. Tools are not offered when streaming.
    ///
    /// With a conversation id, the exchange is remembered once the stream
    /// completes.
    pub fn stream(self) -> ChatStream {
        let client = self.client;
        let mut completion =
            CompletionClient::new(Arc::clone(&client.provider), client.retry.clone())
                .with_temperature(client.temperature);
        if let Some(max_tokens) = client.max_tokens {
            completion = completion.with_max_tokens(max_tokens);
        }
        let inner = completion.stream_messages(self.messages());
        let remember = self
            .conversation
            .clone()
            .map(|id| (Arc::clone(&client.memory), id, self.user.clone()));
        ChatStream {
            inner,
            remember,
            buffer: String::new(),
        }
    }
}

/// Streaming chat answer; yields text chunks in order.
pub struct ChatStream {
    inner: CompletionStream,
    remember: Option<(Arc<ConversationMemory>, String, String)>,
    buffer: String,
}

impl ChatStream {
    pub fn cancel(&mut self) {
        self.inner.cancel();
    }

    /// Concatenate the remaining chunks.
    pub async fn collect_text(mut self) -> std::result::Result<String, RagError> {
        use futures::StreamExt;
        while let Some(chunk) = self.next().await {
            chunk?;
        }
        if self.inner.usage().is_none() {
            return Err(RagError::Cancelled);
        }
        Ok(std::mem::take(&mut self.buffer))
    }
}

impl Stream for ChatStream {
    type Item = std::result::Result<String, RagError>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let polled = Pin::new(&mut self.inner).poll_next(cx);
        match &polled {
            Poll::Ready(Some(Ok(chunk))) => self.buffer.push_str(chunk),
            Poll::Ready(None) if self.inner.usage().is_some() => {
                if let Some((memory, id, user)) = self.remember.take() {
                    memory.append(
                        &id,
                        [Message::user(user), Message::assistant(self.buffer.clone())],
                    );
                }
            }
            _ => {}
        }
        polled
    }
}

/// Parse JSON from a model reply, tolerating ``` fences and surrounding prose.
pub fn extract_json<T: DeserializeOwned>(text: &str) -> serde_json::Result<T> {
    let trimmed = text.trim();
    if let Ok(value) = serde_json::from_str(trimmed) {
        return Ok(value);
    }
    let candidate = fenced_block(trimmed)
        .or_else(|| json_span(trimmed))
        .unwrap_or(trimmed);
    serde_json::from_str(candidate)
}

/// Body of the first fenced code block, minus its language tag.
fn fenced_block(text: &str) -> Option<&str> {
    let start = text.find("```")? + 3;
    let after = &text[start..];
    let body_start = after.find('\n')? + 1;
    let body = &after[body_start..];
    let end = body.find("```")?;
    Some(body[..end].trim())
}

/// From the first `{` or `[` to the last matching closer.
fn json_span(text: &str) -> Option<&str> {
    let start = text.find(['{', '['])?;
    let close = if text[start..].starts_with('{') { '}' } else { ']' };
    let end = text.rfind(close)?;
    (end > start).then(|| &text[start..=end])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::brain::MockLlmProvider;
    use crate::types::Role;
    use futures::StreamExt;
    use serde::Deserialize;

    #[derive(Debug, Deserialize, PartialEq)]
    struct ActorFilms {
        actor: String,
        movies: Vec<String>,
    }

    #[test]
    fn test_extract_json_variants() {
        let plain = r#"{"actor":"Tom Hanks","movies":["Big"]}"#;
        let fenced = "Here you go:\n```json\n{\"actor\":\"Tom Hanks\",\"movies\":[\"Big\"]}\n```\nEnjoy!";
        let prose = "Sure! {\"actor\":\"Tom Hanks\",\"movies\":[\"Big\"]} Hope that helps.";
        for text in [plain, fenced, prose] {
            let parsed: ActorFilms = extract_json(text).unwrap();
            assert_eq!(parsed.actor, "Tom Hanks");
        }
        let list: Vec<ActorFilms> =
            extract_json("```\n[{\"actor\":\"A\",\"movies\":[]}]\n```").unwrap();
        assert_eq!(list.len(), 1);
        assert!(extract_json::<ActorFilms>("no json here").is_err());
    }

    #[tokio::test]
    async fn test_system_prompt_override() {
        let provider = Arc::new(MockLlmProvider::with_response("Arr"));
        let client = ChatClient::new(provider.clone()).with_default_system("Be brief.");
        client.prompt("Hi").content().await.unwrap();
        client.prompt("Hi").system("Talk like a pirate.").content().await.unwrap();

        let requests = provider.recorded_requests();
        assert_eq!(requests[0].messages[0].content.joined_text(), "Be brief.");
        assert_eq!(
            requests[1].messages[0].content.joined_text(),
            "Talk like a pirate."
        );
    }

    #[tokio::test]
    async fn test_requests_are_stateless_without_conversation() {
        let provider = Arc::new(MockLlmProvider::with_response("Nice to meet you"));
        let client = ChatClient::new(provider.clone());
        client.prompt("My name is Inigo Montoya").content().await.unwrap();
        client.prompt("What is my name?").content().await.unwrap();
        assert_eq!(provider.recorded_requests()[1].messages.len(), 1);

        client
            .prompt("My name is Inigo Montoya")
            .conversation("c1")
            .content()
            .await
            .unwrap();
        client
            .prompt("What is my name?")
            .conversation("c1")
            .content()
            .await
            .unwrap();
        let last = provider.recorded_requests().pop().unwrap();
        assert_eq!(last.messages.len(), 3);
        assert!(last.messages[0].content.joined_text().contains("Inigo"));
        assert_eq!(last.messages[1].role, Role::Assistant);
    }

    #[tokio::test]
    async fn test_tool_call_loop() {
        let provider = Arc::new(MockLlmProvider::new());
        provider.queue_response(MockLlmProvider::tool_call_response(
            "set_alarm",
            serde_json::json!({"time": "2026-03-01T07:30:00+00:00"}),
        ));
        provider.queue_response(MockLlmProvider::text_response("Alarm set for 7:30."));

        let date_time = DateTimeTools::new();
        let mut registry = ToolRegistry::new();
        registry.register_all(date_time.callbacks()).unwrap();
        let client = ChatClient::new(provider.clone()).with_tools(Arc::new(registry));

        let response = client.prompt("Wake me at 7:30").call().await.unwrap();
        assert_eq!(response.content, "Alarm set for 7:30.");
        assert_eq!(response.tool_rounds, 1);
        assert_eq!(response.usage.output_tokens, 80);
        assert_eq!(date_time.alarms().len(), 1);

        let requests = provider.recorded_requests();
        assert_eq!(requests[0].tools.as_ref().unwrap().len(), 2);
        let fed_back = requests[1].messages.last().unwrap();
        assert_eq!(fed_back.role, Role::Tool);
    }

    #[tokio::test]
    async fn test_tool_rounds_are_bounded() {
        let provider = Arc::new(MockLlmProvider::new());
        for _ in 0..5 {
            provider.queue_response(MockLlmProvider::tool_call_response(
                "current_date_time",
                serde_json::json!({}),
            ));
        }
        let mut registry = ToolRegistry::new();
        registry.register_all(DateTimeTools::new().callbacks()).unwrap();
        let client = ChatClient::new(provider.clone())
            .with_tools(Arc::new(registry))
            .with_max_tool_rounds(2);

        let response = client.prompt("Loop").call().await.unwrap();
        assert_eq!(response.tool_rounds, 2);
        let requests = provider.recorded_requests();
        assert_eq!(requests.len(), 3);
        assert!(requests[2].tools.is_none());
    }

    #[tokio::test]
    async fn test_unknown_tool_is_reported_to_model() {
        let provider = Arc::new(MockLlmProvider::new());
        provider.queue_response(MockLlmProvider::tool_call_response(
            "weather",
            serde_json::json!({}),
        ));
        provider.queue_response(MockLlmProvider::text_response("Sorry."));
        let mut registry = ToolRegistry::new();
        registry.register_all(DateTimeTools::new().callbacks()).unwrap();
        let client = ChatClient::new(provider.clone()).with_tools(Arc::new(registry));

        assert_eq!(client.prompt("Weather?").content().await.unwrap(), "Sorry.");
        let fed_back = provider.recorded_requests()[1].messages.last().cloned().unwrap();
        assert!(matches!(
            fed_back.content,
            crate::types::Content::ToolResult { is_error: true, .. }
        ));
    }

    #[tokio::test]
    async fn test_entity_extraction() {
        let provider = Arc::new(MockLlmProvider::with_response(
            "```json\n{\"actor\": \"Meryl Streep\", \"movies\": [\"Doubt\", \"The Post\"]}\n```",
        ));
        let client = ChatClient::new(provider.clone());
        let films: ActorFilms = client
            .prompt("Generate the filmography for Meryl Streep")
            .entity()
            .await
            .unwrap();
        assert_eq!(films.movies, vec!["Doubt", "The Post"]);
        let sent = provider.recorded_requests()[0].messages[0].content.joined_text();
        assert!(sent.ends_with("markdown formatting."));
    }

    #[tokio::test]
    async fn test_stream_remembers_conversation() {
        let provider = Arc::new(MockLlmProvider::with_response("Once upon a time"));
        let client = ChatClient::new(provider.clone());
        let mut stream = client.prompt("Tell me a story").conversation("s").stream();
        let mut chunks = Vec::new();
        while let Some(chunk) = stream.next().await {
            chunks.push(chunk.unwrap());
        }
        assert_eq!(chunks.concat(), "Once upon a time");
        let history = client.memory().history("s");
        assert_eq!(history.len(), 2);
        assert_eq!(history[1].content.joined_text(), "Once upon a time");
    }

    #[tokio::test]
    async fn test_stream_honors_max_tokens() {
        let provider = Arc::new(MockLlmProvider::with_response("short"));
        let client = ChatClient::new(provider.clone())
            .with_max_tokens(32)
            .with_temperature(0.1);
        client.prompt("x").stream().collect_text().await.unwrap();

        let recorded = provider.recorded_requests();
        assert_eq!(recorded.len(), 1);
        assert_eq!(recorded[0].max_tokens, Some(32));
        assert!((recorded[0].temperature - 0.1).abs() < 1e-6);
    }

    #[tokio::test]
    async fn test_stream_collect_text() {
        let provider = Arc::new(MockLlmProvider::with_response("a b c"));
        let client = ChatClient::new(provider);
        let text = client.prompt("x").stream().collect_text().await.unwrap();
        assert_eq!(text, "a b c");
    }
}
