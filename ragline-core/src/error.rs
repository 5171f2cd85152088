//! Error types for the ragline core library.
//!
//! Uses `thiserror` for public API error types with structured variants
//! covering LLM backends, retrieval, tools, configuration and the RAG
//! pipeline itself.

use std::path::PathBuf;

/// Top-level error type for the ragline core library.
#[derive(Debug, thiserror::Error)]
pub enum RaglineError {
    #[error("LLM error: {0}")]
    Llm(#[from] LlmError),

    #[error("Retrieval error: {0}")]
    Retrieval(#[from] RetrievalError),

    #[error("RAG pipeline error: {0}")]
    Rag(#[from] RagError),

    #[error("Tool error: {0}")]
    Tool(#[from] ToolError),

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Template error: {0}")]
    Template(#[from] TemplateError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Errors from LLM provider interactions.
#[derive(Debug, thiserror::Error)]
pub enum LlmError {
    #[error("API request failed: {message}")]
    ApiRequest { message: String },

    #[error("API response parse error: {message}")]
    ResponseParse { message: String },

    #[error("Streaming error: {message}")]
    Streaming { message: String },

    #[error("Context window exceeded: used {used} of {limit} tokens")]
    ContextOverflow { used: usize, limit: usize },

    #[error("Authentication failed for provider {provider}")]
    AuthFailed { provider: String },

    #[error("Rate limited by provider, retry after {retry_after_secs}s")]
    RateLimited { retry_after_secs: u64 },

    #[error("Request timed out after {timeout_secs}s")]
    Timeout { timeout_secs: u64 },

    #[error("Provider connection failed: {message}")]
    Connection { message: String },

    #[error("Server error ({status}): {message}")]
    ServerError { status: u16, message: String },
}

impl LlmError {
    /// Whether this error is transient and the request may be retried.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            LlmError::RateLimited { .. }
                | LlmError::Streaming { .. }
                | LlmError::Connection { .. }
                | LlmError::Timeout { .. }
                | LlmError::ServerError { .. }
        )
    }
}

/// Errors from the embedding and vector index layer.
#[derive(Debug, thiserror::Error)]
pub enum RetrievalError {
    #[error("Vector index unreachable: {message}")]
    IndexUnavailable { message: String },

    #[error("Embedding failed: {message}")]
    Embedding { message: String },

    #[error("Embedding dimension mismatch: expected {expected}, got {actual}")]
    DimensionMismatch { expected: usize, actual: usize },
}

/// Errors surfaced by the RAG pipeline to its callers.
///
/// Each stage failure aborts the request; the pipeline never substitutes a
/// partial or fabricated answer.
#[derive(Debug, thiserror::Error)]
pub enum RagError {
    #[error("Invalid query: {reason}")]
    InvalidQuery { reason: String },

    #[error("Retrieval unavailable: {message}")]
    RetrievalUnavailable { message: String },

    #[error("Completion backend unavailable: {message}")]
    BackendUnavailable { message: String },

    #[error("Rate limited by completion backend after {attempts} attempt(s)")]
    RateLimited { attempts: u32, retry_after_secs: u64 },

    #[error("Relevancy evaluation indeterminate: {reason}")]
    IndeterminateEvaluation { reason: String },

    #[error("Completion stream was cancelled")]
    Cancelled,
}

impl RagError {
    /// Map a backend error into the pipeline taxonomy after `attempts` tries.
    pub fn from_backend(err: LlmError, attempts: u32) -> Self {
        match err {
            LlmError::RateLimited { retry_after_secs } => RagError::RateLimited {
                attempts,
                retry_after_secs,
            },
            other => RagError::BackendUnavailable {
                message: other.to_string(),
            },
        }
    }

    /// Whether the failure came from a transient backend condition.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            RagError::BackendUnavailable { .. } | RagError::RateLimited { .. }
        )
    }
}

impl From<RetrievalError> for RagError {
    fn from(err: RetrievalError) -> Self {
        RagError::RetrievalUnavailable {
            message: err.to_string(),
        }
    }
}

/// Errors from tool registration and execution.
#[derive(Debug, thiserror::Error)]
pub enum ToolError {
    #[error("Tool not found: {name}")]
    NotFound { name: String },

    #[error("Tool already registered: {name}")]
    AlreadyRegistered { name: String },

    #[error("Invalid arguments for tool '{name}': {reason}")]
    InvalidArguments { name: String, reason: String },

    #[error("Tool '{name}' execution failed: {message}")]
    ExecutionFailed { name: String, message: String },

    #[error("Tool '{name}' timed out after {timeout_secs}s")]
    Timeout { name: String, timeout_secs: u64 },
}

/// Errors from the configuration system.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Configuration file not found: {path}")]
    FileNotFound { path: PathBuf },

    #[error("Invalid configuration: {message}")]
    Invalid { message: String },

    #[error("Missing required field: {field}")]
    MissingField { field: String },

    #[error("Environment variable not set: {var}")]
    EnvVarMissing { var: String },

    #[error("Configuration parse error: {message}")]
    ParseError { message: String },
}

/// Errors from prompt template rendering.
#[derive(Debug, thiserror::Error)]
pub enum TemplateError {
    #[error("Template variable '{name}' has no value")]
    MissingVariable { name: String },

    #[error("Failed to read template {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// A type alias for results using the top-level `RaglineError`.
pub type Result<T> = std::result::Result<T, RaglineError>;
