//! Pluggable embedding providers.
//!
//! `LocalEmbedder` hashes term frequencies into a fixed number of dimensions
//! and needs no network. `OpenAiEmbedder` calls `POST {base_url}/embeddings`.
//! Failures are reported, never replaced with zero vectors, so the retriever
//! can surface them as "retrieval unavailable".

use crate::config::EmbeddingConfig;
use crate::error::RetrievalError;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

/// Trait for embedding providers.
#[async_trait]
pub trait Embedder: Send + Sync {
    /// Generate an embedding for a single text.
    async fn embed(&self, text: &str) -> Result<Vec<f32>, RetrievalError>;

    /// Generate embeddings for a batch of texts, preserving order.
    async fn embed_batch(&self, texts: &[&str]) -> Result<Vec<Vec<f32>>, RetrievalError> {
        let mut out = Vec::with_capacity(texts.len());
        for text in texts {
            out.push(self.embed(text).await?);
        }
        Ok(out)
    }

    /// Return the dimensionality of embeddings.
    fn dimensions(&self) -> usize;

    /// Return the provider name.
    fn provider_name(&self) -> &str;
}

/// Build the embedder named in configuration.
pub fn create_embedder(config: &EmbeddingConfig) -> Result<Arc<dyn Embedder>, RetrievalError> {
    match config.provider.as_str() {
        "local" => Ok(Arc::new(LocalEmbedder::new(config.dimensions))),
        "openai" => {
            let api_key = std::env::var(&config.api_key_env).map_err(|_| {
                RetrievalError::Embedding {
                    message: format!("env var '{}' not set", config.api_key_env),
                }
            })?;
            Ok(Arc::new(OpenAiEmbedder::new(
                api_key,
                config.model.clone(),
                config.base_url.clone(),
            )?))
        }
        other => Err(RetrievalError::Embedding {
            message: format!("unknown embedding provider '{}'", other),
        }),
    }
}

/// Hashed term-frequency embedder, L2-normalised.
#[derive(Debug, Clone)]
pub struct LocalEmbedder {
    dimensions: usize,
}

impl LocalEmbedder {
    pub fn new(dimensions: usize) -> Self {
        Self {
            dimensions: dimensions.max(1),
        }
    }

    fn embed_sync(&self, text: &str) -> Vec<f32> {
        let mut vector = vec![0.0f32; self.dimensions];

        let lowered = text.to_lowercase();
        let mut tf: HashMap<&str, usize> = HashMap::new();
        for word in lowered
            .split(|c: char| !c.is_alphanumeric())
            .filter(|w| !w.is_empty())
        {
            *tf.entry(word).or_insert(0) += 1;
        }

        for (term, count) in &tf {
            let idx = simple_hash(term) % self.dimensions;
            vector[idx] += *count as f32;
        }

        let norm: f32 = vector.iter().map(|x| x * x).sum::<f32>().sqrt();
        if norm > 0.0 {
            for v in &mut vector {
                *v /= norm;
            }
        }
        vector
    }
}

/// djb2
fn simple_hash(s: &str) -> usize {
    let mut hash: usize = 5381;
    for b in s.bytes() {
        hash = hash.wrapping_mul(33).wrapping_add(b as usize);
    }
    hash
}

#[async_trait]
impl Embedder for LocalEmbedder {
    async fn embed(&self, text: &str) -> Result<Vec<f32>, RetrievalError> {
        Ok(self.embed_sync(text))
    }

    fn dimensions(&self) -> usize {
        self.dimensions
    }

    fn provider_name(&self) -> &str {
        "local"
    }
}

/// OpenAI API embedder (uses text-embedding-3-small by default).
pub struct OpenAiEmbedder {
    client: reqwest::Client,
    api_key: String,
    model: String,
    dims: usize,
    base_url: String,
}

impl OpenAiEmbedder {
    pub fn new(
        api_key: String,
        model: Option<String>,
        base_url: Option<String>,
    ) -> Result<Self, RetrievalError> {
        let model = model.unwrap_or_else(|| "text-embedding-3-small".into());
        let dims = match model.as_str() {
            "text-embedding-3-large" => 3072,
            _ => 1536,
        };
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(60))
            .build()
            .map_err(|e| RetrievalError::Embedding {
                message: format!("failed to build HTTP client: {}", e),
            })?;
        Ok(Self {
            client,
            api_key,
            model,
            dims,
            base_url: base_url
                .unwrap_or_else(|| "https://api.openai.com/v1".into())
                .trim_end_matches('/')
                .to_string(),
        })
    }

    async fn call(&self, input: &[&str]) -> Result<Vec<Vec<f32>>, RetrievalError> {
        let url = format!("{}/embeddings", self.base_url);
        let body = serde_json::json!({ "model": self.model, "input": input });

        let response = self
            .client
            .post(&url)
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await
            .map_err(|e| RetrievalError::Embedding {
                message: format!("request to {} failed: {}", url, e),
            })?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(RetrievalError::Embedding {
                message: format!("HTTP {}: {}", status, text),
            });
        }

        let json: serde_json::Value =
            response
                .json()
                .await
                .map_err(|e| RetrievalError::Embedding {
                    message: format!("invalid embeddings response: {}", e),
                })?;

        let mut rows: Vec<(usize, Vec<f32>)> = json["data"]
            .as_array()
            .ok_or_else(|| RetrievalError::Embedding {
                message: "embeddings response has no 'data' array".into(),
            })?
            .iter()
            .enumerate()
            .map(|(pos, item)| {
                let index = item["index"].as_u64().map_or(pos, |i| i as usize);
                let vector = item["embedding"]
                    .as_array()
                    .map(|v| {
                        v.iter()
                            .filter_map(|x| x.as_f64().map(|f| f as f32))
                            .collect()
                    })
                    .unwrap_or_default();
                (index, vector)
            })
            .collect();
        rows.sort_by_key(|(index, _)| *index);

        if rows.len() != input.len() {
            return Err(RetrievalError::Embedding {
                message: format!("expected {} embeddings, got {}", input.len(), rows.len()),
            });
        }
        Ok(rows.into_iter().map(|(_, v)| v).collect())
    }
}

#[async_trait]
impl Embedder for OpenAiEmbedder {
    async fn embed(&self, text: &str) -> Result<Vec<f32>, RetrievalError> {
        self.call(&[text])
            .await?
            .pop()
            .ok_or_else(|| RetrievalError::Embedding {
                message: "empty embeddings response".into(),
            })
    }

    async fn embed_batch(&self, texts: &[&str]) -> Result<Vec<Vec<f32>>, RetrievalError> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }
        self.call(texts).await
    }

    fn dimensions(&self) -> usize {
        self.dims
    }

    fn provider_name(&self) -> &str {
        "openai"
    }
}

/// Compute cosine similarity between two vectors.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }
    let dot: f32 = a.iter().zip(b.iter()).map(|(x, y)| x * y).sum();
    let norm_a: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let norm_b: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }
    dot / (norm_a * norm_b)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_local_embedder_normalised() {
        let embedder = LocalEmbedder::new(64);
        let v = embedder.embed("Spring Framework 6.2 released").await.unwrap();
        assert_eq!(v.len(), 64);
        let norm: f32 = v.iter().map(|x| x * x).sum::<f32>().sqrt();
        assert!((norm - 1.0).abs() < 1e-5);
    }

    #[tokio::test]
    async fn test_local_embedder_empty_text() {
        let embedder = LocalEmbedder::new(16);
        let v = embedder.embed("   ").await.unwrap();
        assert!(v.iter().all(|x| *x == 0.0));
    }

    #[tokio::test]
    async fn test_local_embedder_similarity_ordering() {
        let embedder = LocalEmbedder::new(256);
        let q = embedder.embed("latest Spring Framework version").await.unwrap();
        let near = embedder
            .embed("The latest version of the Spring Framework is 6.2")
            .await
            .unwrap();
        let far = embedder
            .embed("Kendrick Lamar released a diss track")
            .await
            .unwrap();
        assert!(cosine_similarity(&q, &near) > cosine_similarity(&q, &far));
    }

    #[test]
    fn test_cosine_similarity_edges() {
        assert!((cosine_similarity(&[1.0, 0.0], &[1.0, 0.0]) - 1.0).abs() < 1e-6);
        assert_eq!(cosine_similarity(&[1.0, 0.0], &[0.0, 1.0]), 0.0);
        assert_eq!(cosine_similarity(&[], &[]), 0.0);
        assert_eq!(cosine_similarity(&[1.0], &[1.0, 2.0]), 0.0);
    }

    #[tokio::test]
    async fn test_openai_embedder_against_mock_server() {
        let mut server = mockito::Server::new_async().await;
        let _mock = server
            .mock("POST", "/embeddings")
            .match_header("authorization", "Bearer sk-test")
            .with_status(200)
            .with_body(
                serde_json::json!({
                    "data": [
                        {"index": 1, "embedding": [0.0, 1.0]},
                        {"index": 0, "embedding": [1.0, 0.0]}
                    ]
                })
                .to_string(),
            )
            .create_async()
            .await;

        let embedder = OpenAiEmbedder::new("sk-test".into(), None, Some(server.url())).unwrap();
        let vectors = embedder.embed_batch(&["a", "b"]).await.unwrap();
        assert_eq!(vectors, vec![vec![1.0, 0.0], vec![0.0, 1.0]]);
        assert_eq!(embedder.dimensions(), 1536);
    }

    #[tokio::test]
    async fn test_openai_embedder_http_error() {
        let mut server = mockito::Server::new_async().await;
        let _mock = server
            .mock("POST", "/embeddings")
            .with_status(500)
            .create_async()
            .await;
        let embedder = OpenAiEmbedder::new("sk-test".into(), None, Some(server.url())).unwrap();
        let err = embedder.embed("a").await.unwrap_err();
        assert!(matches!(err, RetrievalError::Embedding { .. }));
    }

    #[test]
    fn test_create_embedder_unknown_provider() {
        let config = EmbeddingConfig {
            provider: "word2vec".into(),
            ..Default::default()
        };
        assert!(create_embedder(&config).is_err());
    }
}
