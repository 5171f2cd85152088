//! Document ingestion: chunk, embed and store.

use crate::error::{RaglineError, Result};
use crate::rag::chunk::{ChunkingStrategy, chunk_text};
use crate::rag::embeddings::Embedder;
use crate::rag::index::{IndexEntry, StoredChunk, VectorIndex};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{info, warn};

const SUPPORTED_EXTENSIONS: &[&str] = &["txt", "md", "markdown", "rst", "adoc", "html", "json"];

/// Summary of one ingested document.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IngestedDocument {
    pub id: String,
    pub source: String,
    pub path: Option<PathBuf>,
    pub chunk_count: usize,
    pub total_chars: usize,
    pub ingested_at: chrono::DateTime<chrono::Utc>,
}

/// Writes documents into a [`VectorIndex`].
pub struct DocumentIngestor {
    embedder: Arc<dyn Embedder>,
    index: Arc<dyn VectorIndex>,
    strategy: ChunkingStrategy,
}

impl DocumentIngestor {
    pub fn new(
        embedder: Arc<dyn Embedder>,
        index: Arc<dyn VectorIndex>,
        strategy: ChunkingStrategy,
    ) -> Self {
        Self {
            embedder,
            index,
            strategy,
        }
    }

    /// Chunk, embed and store a text.
    ///
    /// Re-ingesting a `doc_id` replaces all of its chunks, so a shorter
    /// revision leaves nothing stale behind.
    pub async fn ingest_text(
        &self,
        doc_id: &str,
        source: &str,
        text: &str,
    ) -> Result<IngestedDocument> {
        let chunks = chunk_text(text, doc_id, &self.strategy);
        let texts: Vec<&str> = chunks.iter().map(|c| c.text.as_str()).collect();
        let embeddings = self.embedder.embed_batch(&texts).await?;

        let entries: Vec<IndexEntry> = chunks
            .into_iter()
            .zip(embeddings)
            .map(|(chunk, embedding)| {
                let mut metadata = chunk.metadata;
                metadata.insert("document_id".into(), chunk.document_id);
                metadata.insert("chunk_index".into(), chunk.chunk_index.to_string());
                IndexEntry {
                    chunk: StoredChunk {
                        id: chunk.id,
                        source: source.to_string(),
                        text: chunk.text,
                        metadata,
                    },
                    embedding,
                }
            })
            .collect();
        let chunk_count = entries.len();
        self.index.replace_document(doc_id, entries).await?;

        info!(doc_id, source, chunks = chunk_count, "Ingested document");
        Ok(IngestedDocument {
            id: doc_id.to_string(),
            source: source.to_string(),
            path: None,
            chunk_count,
            total_chars: text.chars().count(),
            ingested_at: chrono::Utc::now(),
        })
    }

    /// Ingest one file.
    ///
    /// The document id is derived from the full path without its extension,
    /// so same-named files in different directories stay distinct.
    pub async fn ingest_file(&self, path: &Path) -> Result<IngestedDocument> {
        let full = tokio::fs::canonicalize(path).await?;
        let doc_id = slug(&full.with_extension("").to_string_lossy());
        self.ingest_path(path, &doc_id).await
    }

    async fn ingest_path(&self, path: &Path, doc_id: &str) -> Result<IngestedDocument> {
        let content = tokio::fs::read_to_string(path).await?;
        let source = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| path.display().to_string());
        let mut doc = self.ingest_text(doc_id, &source, &content).await?;
        doc.path = Some(path.to_path_buf());
        Ok(doc)
    }

    /// Ingest every supported text file under `dir`.
    ///
    /// Document ids come from the path relative to `dir`. Unreadable files
    /// are skipped with a warning; index failures abort.
    pub async fn ingest_directory(&self, dir: &Path) -> Result<Vec<IngestedDocument>> {
        let mut documents = Vec::new();
        for entry in walkdir::WalkDir::new(dir)
            .sort_by_file_name()
            .into_iter()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_type().is_file())
        {
            let path = entry.path();
            let supported = path
                .extension()
                .and_then(|e| e.to_str())
                .is_some_and(|ext| SUPPORTED_EXTENSIONS.contains(&ext));
            if !supported {
                continue;
            }

            let relative = path.strip_prefix(dir).unwrap_or(path).with_extension("");
            let doc_id = slug(&relative.to_string_lossy());
            match self.ingest_path(path, &doc_id).await {
                Ok(doc) => documents.push(doc),
                Err(RaglineError::Io(e)) => {
                    warn!(path = %path.display(), error = %e, "Skipping unreadable file");
                }
                Err(e) => return Err(e),
            }
        }
        Ok(documents)
    }
}

/// Lowercase alphanumerics, everything else collapsed to '-'.
fn slug(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    for c in raw.chars() {
        if c.is_alphanumeric() {
            out.extend(c.to_lowercase());
        } else if !out.ends_with('-') {
            out.push('-');
        }
    }
    let trimmed = out.trim_matches('-');
    if trimmed.is_empty() {
        "doc".to_string()
    } else {
        trimmed.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rag::embeddings::LocalEmbedder;
    use crate::rag::index::InMemoryVectorIndex;

    fn ingestor() -> (DocumentIngestor, Arc<InMemoryVectorIndex>) {
        let index = Arc::new(InMemoryVectorIndex::new());
        let ingestor = DocumentIngestor::new(
            Arc::new(LocalEmbedder::new(64)),
            index.clone(),
            ChunkingStrategy::FixedSize {
                chunk_size: 40,
                overlap: 0,
            },
        );
        (ingestor, index)
    }

    #[test]
    fn test_slug() {
        assert_eq!(slug("Spring Framework"), "spring-framework");
        assert_eq!(slug("guides/Getting_Started"), "guides-getting-started");
        assert_eq!(slug("///"), "doc");
    }

    #[tokio::test]
    async fn test_ingest_text() {
        let (ingestor, index) = ingestor();
        let doc = ingestor
            .ingest_text(
                "spring",
                "spring.md",
                "The latest version of the Spring Framework is 6.2. It requires Java 17.",
            )
            .await
            .unwrap();
        assert_eq!(doc.chunk_count, 2);
        assert_eq!(index.len().await.unwrap(), 2);

        let stored = index.fetch("spring-chunk-0").await.unwrap().unwrap();
        assert_eq!(stored.source, "spring.md");
        assert_eq!(stored.metadata["document_id"], "spring");
    }

    #[tokio::test]
    async fn test_reingest_replaces_chunks() {
        let (ingestor, index) = ingestor();
        ingestor.ingest_text("a", "a.txt", "short text").await.unwrap();
        ingestor.ingest_text("a", "a.txt", "other text").await.unwrap();
        assert_eq!(index.len().await.unwrap(), 1);
        assert_eq!(
            index.fetch("a-chunk-0").await.unwrap().unwrap().text,
            "other text"
        );
    }

    #[tokio::test]
    async fn test_reingest_shorter_text_drops_stale_chunks() {
        let (ingestor, index) = ingestor();
        let long = "Spring Boot auto-configures beans. ".repeat(6);
        let first = ingestor.ingest_text("boot", "boot.md", &long).await.unwrap();
        assert!(first.chunk_count > 2);
        ingestor
            .ingest_text("boot", "boot.md", "Spring Boot 3.4.")
            .await
            .unwrap();
        ingestor
            .ingest_text("other", "other.md", "Kept as is.")
            .await
            .unwrap();

        assert_eq!(index.len().await.unwrap(), 2);
        assert!(index.fetch("boot-chunk-1").await.unwrap().is_none());
        assert!(
            index
                .fetch(&format!("boot-chunk-{}", first.chunk_count - 1))
                .await
                .unwrap()
                .is_none()
        );
        assert_eq!(
            index.fetch("boot-chunk-0").await.unwrap().unwrap().text,
            "Spring Boot 3.4."
        );
    }

    #[tokio::test]
    async fn test_same_file_name_in_different_dirs_keeps_both() {
        let dir = tempfile::tempdir().unwrap();
        for sub in ["spring", "quarkus"] {
            std::fs::create_dir(dir.path().join(sub)).unwrap();
            std::fs::write(dir.path().join(sub).join("notes.md"), format!("{sub} notes")).unwrap();
        }

        let (ingestor, index) = ingestor();
        let a = ingestor
            .ingest_file(&dir.path().join("spring/notes.md"))
            .await
            .unwrap();
        let b = ingestor
            .ingest_file(&dir.path().join("quarkus/notes.md"))
            .await
            .unwrap();

        assert_ne!(a.id, b.id);
        assert!(a.id.ends_with("spring-notes"));
        assert_eq!(a.source, "notes.md");
        assert_eq!(index.len().await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_ingest_directory() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir(dir.path().join("guides")).unwrap();
        std::fs::write(dir.path().join("intro.md"), "Spring Boot makes it easy.").unwrap();
        std::fs::write(dir.path().join("guides/Web Apps.txt"), "Use Spring MVC.").unwrap();
        std::fs::write(dir.path().join("image.png"), [0u8, 1, 2]).unwrap();

        let (ingestor, index) = ingestor();
        let docs = ingestor.ingest_directory(dir.path()).await.unwrap();
        let mut ids: Vec<&str> = docs.iter().map(|d| d.id.as_str()).collect();
        ids.sort();
        assert_eq!(ids, vec!["guides-web-apps", "intro"]);
        assert_eq!(index.len().await.unwrap(), 2);
        assert!(docs.iter().all(|d| d.path.is_some()));
    }

    #[tokio::test]
    async fn test_ingest_missing_file() {
        let (ingestor, _) = ingestor();
        let err = ingestor
            .ingest_file(Path::new("/nonexistent/ragline.md"))
            .await
            .unwrap_err();
        assert!(matches!(err, RaglineError::Io(_)));
    }
}
