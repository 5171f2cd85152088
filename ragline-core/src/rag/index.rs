//! Vector index abstraction and an in-memory implementation.

use crate::error::RetrievalError;
use crate::rag::embeddings::cosine_similarity;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{PoisonError, RwLock};

/// A search result: the id of a stored chunk and its similarity score.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchHit {
    pub id: String,
    pub score: f32,
}

/// The text side of an indexed chunk.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredChunk {
    pub id: String,
    pub source: String,
    pub text: String,
    #[serde(default)]
    pub metadata: HashMap<String, String>,
}

/// A chunk plus its embedding, as written into an index.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndexEntry {
    pub chunk: StoredChunk,
    pub embedding: Vec<f32>,
}

/// Nearest-neighbour search over stored embeddings.
#[async_trait]
pub trait VectorIndex: Send + Sync {
    /// Up to `k` hits ordered by descending score.
    async fn search(&self, embedding: &[f32], k: usize) -> Result<Vec<SearchHit>, RetrievalError>;

    /// Look up a stored chunk by id.
    async fn fetch(&self, id: &str) -> Result<Option<StoredChunk>, RetrievalError>;

    /// Insert or replace entries by chunk id.
    ///
    /// A batch with a wrong embedding dimension is rejected whole.
    async fn upsert(&self, entries: Vec<IndexEntry>) -> Result<(), RetrievalError>;

    /// Remove every chunk whose `document_id` metadata matches. Returns how many went.
    async fn delete_document(&self, document_id: &str) -> Result<usize, RetrievalError>;

    /// Swap a document's chunks for `entries`.
    async fn replace_document(
        &self,
        document_id: &str,
        entries: Vec<IndexEntry>,
    ) -> Result<(), RetrievalError> {
        self.delete_document(document_id).await?;
        self.upsert(entries).await
    }

    /// Number of stored chunks.
    async fn len(&self) -> Result<usize, RetrievalError>;
}

/// Brute-force cosine-similarity index held in memory.
///
/// Searches take a shared lock and never block each other; upserts take the
/// write lock.
#[derive(Default)]
pub struct InMemoryVectorIndex {
    entries: RwLock<Vec<IndexEntry>>,
}

impl InMemoryVectorIndex {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl VectorIndex for InMemoryVectorIndex {
    async fn search(&self, embedding: &[f32], k: usize) -> Result<Vec<SearchHit>, RetrievalError> {
        if k == 0 {
            return Ok(Vec::new());
        }
        let entries = self.entries.read().unwrap_or_else(PoisonError::into_inner);
        if let Some(first) = entries.first()
            && first.embedding.len() != embedding.len()
        {
            return Err(RetrievalError::DimensionMismatch {
                expected: first.embedding.len(),
                actual: embedding.len(),
            });
        }

        let mut hits: Vec<SearchHit> = entries
            .iter()
            .map(|entry| SearchHit {
                id: entry.chunk.id.clone(),
                score: cosine_similarity(embedding, &entry.embedding),
            })
            .collect();
        // Stable sort keeps insertion order among equal scores.
        hits.sort_by(|a, b| b.score.total_cmp(&a.score));
        hits.truncate(k);
        Ok(hits)
    }

    async fn fetch(&self, id: &str) -> Result<Option<StoredChunk>, RetrievalError> {
        let entries = self.entries.read().unwrap_or_else(PoisonError::into_inner);
        Ok(entries
            .iter()
            .find(|e| e.chunk.id == id)
            .map(|e| e.chunk.clone()))
    }

    async fn upsert(&self, new_entries: Vec<IndexEntry>) -> Result<(), RetrievalError> {
        let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
        check_dimensions(&entries, &new_entries)?;
        merge(&mut entries, new_entries);
        Ok(())
    }

    async fn delete_document(&self, document_id: &str) -> Result<usize, RetrievalError> {
        let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
        let before = entries.len();
        entries.retain(|e| !belongs_to(e, document_id));
        Ok(before - entries.len())
    }

    async fn replace_document(
        &self,
        document_id: &str,
        new_entries: Vec<IndexEntry>,
    ) -> Result<(), RetrievalError> {
        let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
        let remaining: Vec<IndexEntry> = entries
            .iter()
            .filter(|e| !belongs_to(e, document_id))
            .cloned()
            .collect();
        check_dimensions(&remaining, &new_entries)?;
        *entries = remaining;
        merge(&mut entries, new_entries);
        Ok(())
    }

    async fn len(&self) -> Result<usize, RetrievalError> {
        Ok(self
            .entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len())
    }
}

fn belongs_to(entry: &IndexEntry, document_id: &str) -> bool {
    entry
        .chunk
        .metadata
        .get("document_id")
        .is_some_and(|id| id == document_id)
}

/// Every new embedding must match the stored dimension, or the first new one.
fn check_dimensions(stored: &[IndexEntry], incoming: &[IndexEntry]) -> Result<(), RetrievalError> {
    let Some(expected) = stored.first().or(incoming.first()).map(|e| e.embedding.len()) else {
        return Ok(());
    };
    match incoming.iter().find(|e| e.embedding.len() != expected) {
        Some(bad) => Err(RetrievalError::DimensionMismatch {
            expected,
            actual: bad.embedding.len(),
        }),
        None => Ok(()),
    }
}

fn merge(entries: &mut Vec<IndexEntry>, new_entries: Vec<IndexEntry>) {
    for entry in new_entries {
        match entries.iter_mut().find(|e| e.chunk.id == entry.chunk.id) {
            Some(existing) => *existing = entry,
            None => entries.push(entry),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(id: &str, embedding: Vec<f32>) -> IndexEntry {
        IndexEntry {
            chunk: StoredChunk {
                id: id.into(),
                source: "notes.md".into(),
                text: format!("text of {id}"),
                metadata: HashMap::new(),
            },
            embedding,
        }
    }

    #[tokio::test]
    async fn test_search_orders_by_score() {
        let index = InMemoryVectorIndex::new();
        index
            .upsert(vec![
                entry("a", vec![0.0, 1.0]),
                entry("b", vec![1.0, 0.0]),
                entry("c", vec![0.7, 0.7]),
            ])
            .await
            .unwrap();

        let hits = index.search(&[1.0, 0.0], 2).await.unwrap();
        let ids: Vec<&str> = hits.iter().map(|h| h.id.as_str()).collect();
        assert_eq!(ids, vec!["b", "c"]);
        assert!(hits[0].score >= hits[1].score);
    }

    #[tokio::test]
    async fn test_search_k_zero_and_empty_index() {
        let index = InMemoryVectorIndex::new();
        assert!(index.search(&[1.0], 3).await.unwrap().is_empty());
        index.upsert(vec![entry("a", vec![1.0])]).await.unwrap();
        assert!(index.search(&[1.0], 0).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_upsert_replaces_by_id() {
        let index = InMemoryVectorIndex::new();
        index.upsert(vec![entry("a", vec![1.0, 0.0])]).await.unwrap();
        index.upsert(vec![entry("a", vec![0.0, 1.0])]).await.unwrap();
        assert_eq!(index.len().await.unwrap(), 1);
        let hits = index.search(&[0.0, 1.0], 1).await.unwrap();
        assert!((hits[0].score - 1.0).abs() < 1e-6);
    }

    #[tokio::test]
    async fn test_dimension_mismatch() {
        let index = InMemoryVectorIndex::new();
        index.upsert(vec![entry("a", vec![1.0, 0.0])]).await.unwrap();
        let err = index.search(&[1.0, 0.0, 0.0], 1).await.unwrap_err();
        assert!(matches!(
            err,
            RetrievalError::DimensionMismatch {
                expected: 2,
                actual: 3
            }
        ));
        assert!(index.upsert(vec![entry("b", vec![1.0])]).await.is_err());
    }

    #[tokio::test]
    async fn test_upsert_rejects_whole_batch_on_bad_dimension() {
        let index = InMemoryVectorIndex::new();
        index.upsert(vec![entry("a", vec![1.0, 0.0])]).await.unwrap();
        let err = index
            .upsert(vec![
                entry("b", vec![0.0, 1.0]),
                entry("a", vec![0.5, 0.5]),
                entry("c", vec![1.0]),
            ])
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            RetrievalError::DimensionMismatch {
                expected: 2,
                actual: 1
            }
        ));
        assert_eq!(index.len().await.unwrap(), 1);
        assert!(index.fetch("b").await.unwrap().is_none());
        let hits = index.search(&[1.0, 0.0], 1).await.unwrap();
        assert!((hits[0].score - 1.0).abs() < 1e-6);

        let fresh = InMemoryVectorIndex::new();
        assert!(
            fresh
                .upsert(vec![entry("x", vec![1.0, 0.0]), entry("y", vec![1.0])])
                .await
                .is_err()
        );
        assert_eq!(fresh.len().await.unwrap(), 0);
    }

    fn doc_entry(id: &str, document_id: &str) -> IndexEntry {
        let mut e = entry(id, vec![1.0, 0.0]);
        e.chunk
            .metadata
            .insert("document_id".into(), document_id.into());
        e
    }

    #[tokio::test]
    async fn test_delete_and_replace_document() {
        let index = InMemoryVectorIndex::new();
        index
            .upsert(vec![
                doc_entry("a-0", "a"),
                doc_entry("a-1", "a"),
                doc_entry("b-0", "b"),
            ])
            .await
            .unwrap();

        index
            .replace_document("a", vec![doc_entry("a-0", "a")])
            .await
            .unwrap();
        assert_eq!(index.len().await.unwrap(), 2);
        assert!(index.fetch("a-1").await.unwrap().is_none());

        let err = index
            .replace_document("b", vec![entry("b-0", vec![1.0])])
            .await
            .unwrap_err();
        assert!(matches!(err, RetrievalError::DimensionMismatch { .. }));
        assert!(index.fetch("b-0").await.unwrap().is_some());

        assert_eq!(index.delete_document("a").await.unwrap(), 1);
        assert_eq!(index.delete_document("missing").await.unwrap(), 0);
        assert_eq!(index.len().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_fetch() {
        let index = InMemoryVectorIndex::new();
        index.upsert(vec![entry("a", vec![1.0])]).await.unwrap();
        assert_eq!(index.fetch("a").await.unwrap().unwrap().text, "text of a");
        assert!(index.fetch("missing").await.unwrap().is_none());
    }
}
