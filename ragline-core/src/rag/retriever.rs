//! Retrieval: question in, ranked fragments out.

use crate::error::RagError;
use crate::rag::DocumentFragment;
use crate::rag::embeddings::Embedder;
use crate::rag::index::VectorIndex;
use async_trait::async_trait;
use std::sync::Arc;
use tracing::{debug, warn};

/// Returns the fragments most relevant to a question.
#[async_trait]
pub trait Retriever: Send + Sync {
    /// At most `k` fragments in descending score order.
    ///
    /// An empty result means nothing cleared the relevance threshold. Failure
    /// to reach the backing index is an error, never an empty result.
    async fn retrieve(&self, query: &str, k: usize) -> Result<Vec<DocumentFragment>, RagError>;
}

/// Retriever backed by an [`Embedder`] and a [`VectorIndex`].
pub struct VectorRetriever {
    embedder: Arc<dyn Embedder>,
    index: Arc<dyn VectorIndex>,
    min_score: f32,
}

impl VectorRetriever {
    pub fn new(embedder: Arc<dyn Embedder>, index: Arc<dyn VectorIndex>) -> Self {
        Self {
            embedder,
            index,
            min_score: 0.1,
        }
    }

    pub fn with_min_score(mut self, min_score: f32) -> Self {
        self.min_score = min_score;
        self
    }
}

#[async_trait]
impl Retriever for VectorRetriever {
    async fn retrieve(&self, query: &str, k: usize) -> Result<Vec<DocumentFragment>, RagError> {
        if k == 0 {
            return Ok(Vec::new());
        }

        let embedding = self.embedder.embed(query).await?;
        let hits = self.index.search(&embedding, k).await?;

        let mut fragments = Vec::with_capacity(hits.len());
        for hit in hits.into_iter().filter(|h| h.score >= self.min_score) {
            match self.index.fetch(&hit.id).await? {
                Some(chunk) => fragments.push(DocumentFragment {
                    id: chunk.id,
                    source: chunk.source,
                    text: chunk.text,
                    score: hit.score,
                }),
                None => warn!(id = %hit.id, "Search hit has no stored chunk; skipping"),
            }
        }
        fragments.sort_by(|a, b| b.score.total_cmp(&a.score));
        fragments.truncate(k);

        debug!(
            k,
            min_score = self.min_score,
            returned = fragments.len(),
            "Retrieved fragments"
        );
        Ok(fragments)
    }
}
