//! Completion client: sends an assembled prompt to the model backend.
//!
//! Non-streaming calls go through the exponential-backoff retry policy.
//! Streaming calls return a [`CompletionStream`] fed by a background task;
//! cancelling or dropping the stream stops that task and releases the
//! provider's connection.

use crate::brain::LlmProvider;
use crate::config::RetryConfig;
use crate::error::RagError;
use crate::providers::with_retry_counted;
use crate::rag::DocumentFragment;
use crate::rag::prompt::AssembledPrompt;
use crate::types::{CompletionRequest, Message, StreamEvent, TokenUsage};
use futures::{Stream, StreamExt};
use regex::Regex;
use std::ops::ControlFlow;
use std::pin::Pin;
use std::sync::{Arc, LazyLock};
use std::task::{Context, Poll};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// `[fragment-id]` or `[id-a, id-b]`.
static CITATION: LazyLock<Option<Regex>> =
    LazyLock::new(|| Regex::new(r"\[([A-Za-z0-9_.:/#,\s-]+)\]").ok());

/// Generated answer plus provenance. Owned by the caller; immutable.
#[derive(Debug, Clone, PartialEq)]
pub struct CompletionResult {
    pub answer: String,
    /// Fragments the answer relied on; always a subset of the retrieved set.
    pub used_fragments: Vec<DocumentFragment>,
    pub usage: TokenUsage,
    pub model: String,
    pub finish_reason: Option<String>,
}

impl CompletionResult {
    /// Ids of the used fragments, in retrieval order.
    pub fn used_ids(&self) -> Vec<&str> {
        self.used_fragments.iter().map(|f| f.id.as_str()).collect()
    }
}

/// Work out which prompt fragments an answer used.
///
/// Citations of known ids win, in retrieval order. Unknown ids are dropped.
/// An answer that cites nothing known is attributed to every prompt fragment.
pub fn resolve_used_fragments(
    answer: &str,
    prompt_fragments: &[DocumentFragment],
) -> Vec<DocumentFragment> {
    let cited: Vec<String> = CITATION
        .as_ref()
        .map(|re| {
            re.captures_iter(answer)
                .filter_map(|cap| cap.get(1))
                .flat_map(|m| m.as_str().split(','))
                .map(|id| id.trim().to_string())
                .filter(|id| !id.is_empty())
                .collect()
        })
        .unwrap_or_default();

    for id in &cited {
        if !prompt_fragments.iter().any(|f| &f.id == id) {
            warn!(citation = %id, "Answer cites an unknown fragment; dropping it");
        }
    }

    let used: Vec<DocumentFragment> = prompt_fragments
        .iter()
        .filter(|f| cited.iter().any(|id| id == &f.id))
        .cloned()
        .collect();

    if used.is_empty() {
        prompt_fragments.to_vec()
    } else {
        used
    }
}

/// Sends prompts to an [`LlmProvider`].
#[derive(Clone)]
pub struct CompletionClient {
    provider: Arc<dyn LlmProvider>,
    retry: RetryConfig,
    temperature: f32,
    max_tokens: Option<usize>,
    stream_buffer: usize,
}

impl CompletionClient {
    pub fn new(provider: Arc<dyn LlmProvider>, retry: RetryConfig) -> Self {
        Self {
            provider,
            retry,
            temperature: 0.7,
            max_tokens: None,
            stream_buffer: 32,
        }
    }

    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = temperature;
        self
    }

    pub fn with_max_tokens(mut self, max_tokens: usize) -> Self {
        self.max_tokens = Some(max_tokens);
        self
    }

    /// Capacity of the chunk channel between producer and consumer.
    pub fn with_stream_buffer(mut self, capacity: usize) -> Self {
        self.stream_buffer = capacity.max(1);
        self
    }

    pub fn model_name(&self) -> &str {
        self.provider.model_name()
    }

    fn request(&self, prompt: &AssembledPrompt) -> CompletionRequest {
        CompletionRequest {
            messages: prompt.to_messages(),
            temperature: self.temperature,
            max_tokens: self.max_tokens,
            ..Default::default()
        }
    }

    /// Full completion with retry on transient backend errors.
    pub async fn complete(&self, prompt: &AssembledPrompt) -> Result<CompletionResult, RagError> {
        let request = self.request(prompt);
        let response = with_retry_counted(&self.retry, || {
            let provider = Arc::clone(&self.provider);
            let request = request.clone();
            async move { provider.complete(request).await }
        })
        .await
        .map_err(|(err, attempts)| {
            warn!(attempts, error = %err, "Completion failed");
            RagError::from_backend(err, attempts)
        })?;

        let answer = response.text();
        let used_fragments = resolve_used_fragments(&answer, prompt.fragments());
        info!(
            model = %response.model,
            input_tokens = response.usage.input_tokens,
            output_tokens = response.usage.output_tokens,
            used_fragments = used_fragments.len(),
            "Completion finished"
        );
        Ok(CompletionResult {
            answer,
            used_fragments,
            usage: response.usage,
            model: response.model,
            finish_reason: response.finish_reason,
        })
    }

    /// Start a streaming completion. Not retried.
    ///
    /// Must be called within a Tokio runtime.
    pub fn complete_streaming(&self, prompt: &AssembledPrompt) -> CompletionStream {
        self.spawn_stream(self.request(prompt), prompt.fragments().to_vec())
    }

    /// Stream a completion for arbitrary messages, without fragment provenance.
    pub fn stream_messages(&self, messages: Vec<Message>) -> CompletionStream {
        let request = CompletionRequest {
            messages,
            temperature: self.temperature,
            max_tokens: self.max_tokens,
            ..Default::default()
        };
        self.spawn_stream(request, Vec::new())
    }

    fn spawn_stream(
        &self,
        request: CompletionRequest,
        fragments: Vec<DocumentFragment>,
    ) -> CompletionStream {
        let provider = Arc::clone(&self.provider);
        let cancel = CancellationToken::new();
        let (chunk_tx, chunk_rx) = mpsc::channel(self.stream_buffer);
        let buffer = self.stream_buffer;

        tokio::spawn(produce(provider, request, chunk_tx, cancel.clone(), buffer));

        CompletionStream {
            rx: chunk_rx,
            cancel,
            fragments,
            model: self.provider.model_name().to_string(),
            usage: None,
            finished: false,
        }
    }

    /// A stream that yields a fixed answer without calling the backend.
    pub fn fixed_stream(&self, text: &str, fragments: Vec<DocumentFragment>) -> CompletionStream {
        let (tx, rx) = mpsc::channel(2);
        // Capacity 2 holds both items, so these sends cannot fail.
        let _ = tx.try_send(StreamItem::Text(text.to_string()));
        let _ = tx.try_send(StreamItem::Done(TokenUsage::default()));
        CompletionStream {
            rx,
            cancel: CancellationToken::new(),
            fragments,
            model: self.provider.model_name().to_string(),
            usage: None,
            finished: false,
        }
    }
}

enum StreamItem {
    Text(String),
    Done(TokenUsage),
    Failed(RagError),
}

/// Drive the provider and forward text chunks until done, failed or cancelled.
async fn produce(
    provider: Arc<dyn LlmProvider>,
    request: CompletionRequest,
    chunk_tx: mpsc::Sender<StreamItem>,
    cancel: CancellationToken,
    buffer: usize,
) {
    let (event_tx, mut event_rx) = mpsc::channel::<StreamEvent>(buffer);
    let mut producer = provider.complete_streaming(request, event_tx);
    let mut producer_done = false;

    let outcome: Option<StreamItem> = loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                debug!("Completion stream cancelled by consumer");
                break None;
            }
            result = &mut producer, if !producer_done => {
                producer_done = true;
                if let Err(err) = result {
                    break Some(StreamItem::Failed(RagError::from_backend(err, 1)));
                }
            }
            event = event_rx.recv() => match event {
                Some(StreamEvent::Token(text)) => {
                    tokio::select! {
                        biased;
                        _ = cancel.cancelled() => break None,
                        sent = chunk_tx.send(StreamItem::Text(text)) => {
                            if sent.is_err() {
                                break None;
                            }
                        }
                    }
                }
                Some(StreamEvent::Done { usage }) => break Some(StreamItem::Done(usage)),
                Some(StreamEvent::Error(message)) => {
                    break Some(StreamItem::Failed(RagError::BackendUnavailable { message }));
                }
                Some(_) => {}
                None => {
                    break Some(StreamItem::Failed(RagError::BackendUnavailable {
                        message: "stream ended before completion".into(),
                    }));
                }
            }
        }
    };

    // Dropping the provider future here closes its HTTP response.
    drop(producer);
    if let Some(item) = outcome {
        let _ = chunk_tx.send(item).await;
    }
}

/// A lazy, finite, ordered sequence of answer chunks. Not restartable.
///
/// Implements `Stream<Item = Result<String, RagError>>`. The stream ends
/// after the provider's end-of-stream signal. Dropping it cancels the
/// producer.
pub struct CompletionStream {
    rx: mpsc::Receiver<StreamItem>,
    cancel: CancellationToken,
    fragments: Vec<DocumentFragment>,
    model: String,
    usage: Option<TokenUsage>,
    finished: bool,
}

impl CompletionStream {
    /// Stop the producer. No further chunks are yielded.
    pub fn cancel(&mut self) {
        self.cancel.cancel();
        self.finished = true;
        self.rx.close();
    }

    /// A token that cancels this stream from another task.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Fragments placed in the prompt.
    pub fn fragments(&self) -> &[DocumentFragment] {
        &self.fragments
    }

    /// Usage reported by the provider, once the stream has completed.
    pub fn usage(&self) -> Option<TokenUsage> {
        self.usage
    }

    /// Concatenate the remaining chunks.
    ///
    /// Returns `RagError::Cancelled` if the stream was cancelled before the
    /// provider finished.
    pub async fn collect_text(mut self) -> Result<String, RagError> {
        let mut text = String::new();
        while let Some(chunk) = self.next().await {
            text.push_str(&chunk?);
        }
        if self.usage.is_none() {
            return Err(RagError::Cancelled);
        }
        Ok(text)
    }

    /// Collect the stream into a [`CompletionResult`] with provenance.
    pub async fn collect_result(mut self) -> Result<CompletionResult, RagError> {
        let mut answer = String::new();
        while let Some(chunk) = self.next().await {
            answer.push_str(&chunk?);
        }
        let usage = self.usage.ok_or(RagError::Cancelled)?;
        let used_fragments = resolve_used_fragments(&answer, &self.fragments);
        Ok(CompletionResult {
            answer,
            used_fragments,
            usage,
            model: std::mem::take(&mut self.model),
            finish_reason: Some("stop".to_string()),
        })
    }

    /// Push-style consumption on a spawned task.
    ///
    /// The callback sees each chunk in order; returning `ControlFlow::Break`
    /// cancels the stream. The subscription resolves to the full text.
    pub fn for_each_chunk<F>(mut self, mut callback: F) -> ChunkSubscription
    where
        F: FnMut(&str) -> ControlFlow<()> + Send + 'static,
    {
        let cancel = self.cancel.clone();
        let handle = tokio::spawn(async move {
            let mut text = String::new();
            while let Some(chunk) = self.next().await {
                let chunk = chunk?;
                text.push_str(&chunk);
                if callback(&chunk).is_break() {
                    self.cancel();
                    return Err(RagError::Cancelled);
                }
            }
            if self.usage.is_none() {
                return Err(RagError::Cancelled);
            }
            Ok(text)
        });
        ChunkSubscription { handle, cancel }
    }
}

impl Stream for CompletionStream {
    type Item = Result<String, RagError>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        if self.finished {
            return Poll::Ready(None);
        }
        match self.rx.poll_recv(cx) {
            Poll::Ready(Some(StreamItem::Text(text))) => Poll::Ready(Some(Ok(text))),
            Poll::Ready(Some(StreamItem::Done(usage))) => {
                self.usage = Some(usage);
                self.finished = true;
                Poll::Ready(None)
            }
            Poll::Ready(Some(StreamItem::Failed(err))) => {
                self.finished = true;
                Poll::Ready(Some(Err(err)))
            }
            Poll::Ready(None) => {
                self.finished = true;
                Poll::Ready(None)
            }
            Poll::Pending => Poll::Pending,
        }
    }
}

impl Drop for CompletionStream {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// Handle to a push-style consumer started by [`CompletionStream::for_each_chunk`].
pub struct ChunkSubscription {
    handle: JoinHandle<Result<String, RagError>>,
    cancel: CancellationToken,
}

impl ChunkSubscription {
    /// Stop delivery; `join` then resolves to `RagError::Cancelled`.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Wait for the consumer to finish and return the full text.
    pub async fn join(self) -> Result<String, RagError> {
        self.handle.await.map_err(|e| RagError::BackendUnavailable {
            message: format!("stream consumer task failed: {}", e),
        })?
    }
}
