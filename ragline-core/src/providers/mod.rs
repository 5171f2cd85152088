//! LLM provider implementations.
//!
//! Provides concrete implementations of the `LlmProvider` trait for:
//! - OpenAI-compatible APIs (OpenAI, Azure, Ollama, vLLM, LM Studio)
//! - Anthropic Messages API (Claude models)
//!
//! Use `create_provider()` to instantiate the appropriate provider based on config.

pub mod anthropic;
pub mod openai_compat;
pub mod rate_limiter;

use crate::brain::LlmProvider;
use crate::config::LlmConfig;
use crate::error::LlmError;
use rand::Rng;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

pub use crate::config::RetryConfig;
pub use anthropic::AnthropicProvider;
pub use openai_compat::OpenAiCompatibleProvider;
pub use rate_limiter::parse_retry_after;

/// Execute an async operation with exponential backoff retry on transient errors.
///
/// Retries on errors where [`LlmError::is_retryable`] holds, respecting
/// `retry_after_secs` for rate limits. Permanent errors (auth, parse) return immediately.
pub async fn with_retry<F, Fut, T>(config: &RetryConfig, operation: F) -> Result<T, LlmError>
where
    F: Fn() -> Fut,
    Fut: Future<Output = Result<T, LlmError>>,
{
    with_retry_counted(config, operation)
        .await
        .map_err(|(err, _)| err)
}

/// Like [`with_retry`], but a failure also reports how many attempts were made.
pub async fn with_retry_counted<F, Fut, T>(
    config: &RetryConfig,
    operation: F,
) -> Result<T, (LlmError, u32)>
where
    F: Fn() -> Fut,
    Fut: Future<Output = Result<T, LlmError>>,
{
    let mut attempt: u32 = 0;
    loop {
        match operation().await {
            Ok(val) => return Ok(val),
            Err(e) => {
                if !e.is_retryable() || attempt >= config.max_retries {
                    return Err((e, attempt + 1));
                }

                let backoff_ms = compute_backoff(config, attempt, &e);
                tracing::warn!(
                    attempt = attempt + 1,
                    max = config.max_retries,
                    backoff_ms = backoff_ms,
                    error = %e,
                    "Retrying after transient error"
                );
                tokio::time::sleep(Duration::from_millis(backoff_ms)).await;
                attempt += 1;
            }
        }
    }
}

/// Compute backoff delay, respecting rate limit retry-after hints.
fn compute_backoff(config: &RetryConfig, attempt: u32, err: &LlmError) -> u64 {
    let computed = compute_exponential_backoff(config, attempt);
    if let LlmError::RateLimited { retry_after_secs } = err {
        return retry_after_secs.saturating_mul(1000).max(computed);
    }
    computed
}

/// Exponential backoff with optional jitter of up to 25%.
fn compute_exponential_backoff(config: &RetryConfig, attempt: u32) -> u64 {
    let base = config.initial_backoff_ms as f64 * config.backoff_multiplier.powi(attempt as i32);
    let capped = base.min(config.max_backoff_ms as f64) as u64;
    if config.jitter && capped > 0 {
        let jitter = (capped as f64 * rand::thread_rng().gen_range(0.0..0.25)) as u64;
        capped + jitter
    } else {
        capped
    }
}

/// Resolve the API key for a provider: explicit key first, then the environment variable.
pub fn resolve_api_key(config: &LlmConfig) -> Option<String> {
    config
        .api_key
        .clone()
        .or_else(|| std::env::var(&config.api_key_env).ok())
        .filter(|k| !k.trim().is_empty())
}

/// Whether the configured endpoint is a local server that needs no key.
pub(crate) fn is_local_endpoint(base_url: Option<&str>) -> bool {
    base_url.is_some_and(|u| u.contains("localhost") || u.contains("127.0.0.1"))
}

/// Build the shared HTTP client with the configured request timeout.
pub(crate) fn http_client(config: &LlmConfig) -> Result<reqwest::Client, LlmError> {
    reqwest::Client::builder()
        .timeout(Duration::from_secs(config.timeout_secs))
        .build()
        .map_err(|e| LlmError::Connection {
            message: format!("Failed to build HTTP client: {}", e),
        })
}

/// Translate a transport failure into the provider error taxonomy.
pub(crate) fn map_transport_error(err: reqwest::Error, timeout_secs: u64) -> LlmError {
    if err.is_timeout() {
        LlmError::Timeout { timeout_secs }
    } else if err.is_connect() || err.is_request() {
        LlmError::Connection {
            message: err.to_string(),
        }
    } else {
        LlmError::ApiRequest {
            message: format!("Request failed: {}", err),
        }
    }
}

/// Splits a server-sent event byte stream into lines.
///
/// Bytes are held until a full line arrives, so a multi-byte character split
/// across network chunks is decoded intact.
#[derive(Debug, Default)]
pub(crate) struct SseLineBuffer {
    buf: Vec<u8>,
}

impl SseLineBuffer {
    /// Append raw bytes from the response body.
    pub(crate) fn extend(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    /// Pop the next complete line, trimmed. `None` until a newline arrives.
    pub(crate) fn next_line(&mut self) -> Option<String> {
        let newline_pos = self.buf.iter().position(|&b| b == b'\n')?;
        let line: Vec<u8> = self.buf.drain(..=newline_pos).collect();
        Some(String::from_utf8_lossy(&line).trim().to_string())
    }
}

/// Create an LLM provider based on the configuration.
///
/// `"anthropic"` selects the Messages API; every other provider name is
/// treated as an OpenAI-compatible endpoint.
pub fn create_provider(config: &LlmConfig) -> Result<Arc<dyn LlmProvider>, LlmError> {
    for warning in config.validate() {
        tracing::warn!(provider = %config.provider, "{}", warning);
    }
    match config.provider.as_str() {
        "anthropic" => Ok(Arc::new(AnthropicProvider::new(config)?)),
        _ => Ok(Arc::new(OpenAiCompatibleProvider::new(config)?)),
    }
}
