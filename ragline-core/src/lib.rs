//! # Ragline Core
//!
//! Retrieval-augmented question answering over a document index.
//! Provides the retrieval pipeline, grounded prompt assembly, LLM providers
//! with retry, answer evaluation, a general chat client with tools, and
//! configuration.

pub mod brain;
pub mod chat;
pub mod config;
pub mod error;
pub mod providers;
pub mod rag;
pub mod types;

// Re-export commonly used types at the crate root.
pub use brain::{LlmProvider, MockLlmProvider, TokenCounter};
pub use chat::{
    ChatClient, ChatResponse, ChatStream, ConversationMemory, DateTimeTools, PromptTemplate,
    ToolCallback, ToolRegistry,
};
pub use config::{EmptyContextPolicy, RaglineConfig};
pub use error::{RagError, RaglineError, Result};
pub use rag::{
    CompletionResult, CompletionStream, DocumentFragment, EvaluationVerdict, Evaluator,
    InMemoryVectorIndex, Query, RagService, Verdict,
};
pub use types::{
    CompletionRequest, CompletionResponse, Content, Message, Role, StreamEvent, TokenUsage,
    ToolDefinition,
};
