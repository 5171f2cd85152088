//! RAG (Retrieval-Augmented Generation) pipeline.
//!
//! query → [`Retriever`] → [`PromptAssembler`] → [`CompletionClient`] →
//! optionally an [`Evaluator`]. [`RagService`] wires the stages together.

pub mod chunk;
pub mod completion;
pub mod embeddings;
pub mod evaluation;
pub mod index;
pub mod ingest;
pub mod prompt;
pub mod retriever;
pub mod service;

use crate::error::RagError;
use serde::{Deserialize, Serialize};

pub use chunk::{Chunk, ChunkingStrategy, chunk_text};
pub use completion::{ChunkSubscription, CompletionClient, CompletionResult, CompletionStream};
pub use embeddings::{Embedder, LocalEmbedder, OpenAiEmbedder, create_embedder};
pub use evaluation::{
    EvaluationRequest, EvaluationVerdict, Evaluator, KnowledgeGapEvaluator, RelevancyEvaluator,
    Verdict,
};
pub use index::{InMemoryVectorIndex, IndexEntry, SearchHit, StoredChunk, VectorIndex};
pub use ingest::{DocumentIngestor, IngestedDocument};
pub use prompt::{AssembledPrompt, PromptAssembler};
pub use retriever::{Retriever, VectorRetriever};
pub use service::{INSUFFICIENT_CONTEXT_ANSWER, RagService};

/// A validated user question.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Query(String);

impl Query {
    /// Reject empty or whitespace-only questions.
    pub fn new(text: impl Into<String>) -> Result<Self, RagError> {
        let text = text.into();
        if text.trim().is_empty() {
            return Err(RagError::InvalidQuery {
                reason: "question is empty".to_string(),
            });
        }
        Ok(Self(text))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for Query {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// A retrieved unit of context.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DocumentFragment {
    pub id: String,
    /// Where the text came from (file path, URL, document id).
    pub source: String,
    pub text: String,
    /// Relevance score in `[-1, 1]`; higher is more relevant.
    pub score: f32,
}
