//! Embedding capability: per-session vectors and query embeddings.
//!
//! One real backend (an OpenAI-compatible embeddings endpoint) plus a
//! deterministic hash fallback used when no API key is configured. The
//! fallback keeps search functional offline at lower quality; the search
//! engine additionally degrades to text scan when no vectors exist at
//! all.

pub mod indexer;
pub mod search;

use std::num::NonZeroUsize;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::config::SearchConfig;
use crate::types::{Capability, CoreError, CoreResult};

pub use indexer::{EmbeddingIndexer, IndexStatus, IndexerWorker, SessionEmbedding};
pub use search::{MatchType, PreviewFragment, SearchEngine, SearchResponse, SearchResult};

/// Embedding capability.
#[async_trait]
pub trait Embedder: Send + Sync {
    async fn embed(&self, text: &str) -> CoreResult<Vec<f32>>;

    fn dimension(&self) -> usize;

    fn model_name(&self) -> &str;

    /// Whether the backend can currently serve requests. The search
    /// engine uses this to pick its tier without paying for a failure.
    async fn is_available(&self) -> bool;
}

/// OpenAI-compatible embeddings endpoint client.
pub struct HttpEmbedder {
    client: reqwest::Client,
    config: SearchConfig,
    api_key: String,
    /// Recently computed embeddings, keyed by text digest
    cache: Mutex<lru::LruCache<String, Arc<Vec<f32>>>>,
}

#[derive(Debug, Serialize)]
struct EmbeddingRequest {
    model: String,
    input: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct EmbeddingResponse {
    data: Vec<EmbeddingData>,
}

#[derive(Debug, Deserialize)]
struct EmbeddingData {
    embedding: Vec<f32>,
}

impl HttpEmbedder {
    pub fn new(config: SearchConfig, api_key: String) -> Self {
        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(config.query_timeout_secs.max(1)))
            .build()
            .expect("Failed to create HTTP client");
        Self {
            client,
            config,
            api_key,
            cache: Mutex::new(lru::LruCache::new(
                NonZeroUsize::new(256).expect("cache size is non-zero"),
            )),
        }
    }
}

#[async_trait]
impl Embedder for HttpEmbedder {
    async fn embed(&self, text: &str) -> CoreResult<Vec<f32>> {
        let cache_key = crate::types::sha256_hex(text.as_bytes());
        {
            let mut cache = self.cache.lock().await;
            if let Some(hit) = cache.get(&cache_key) {
                return Ok(hit.as_ref().clone());
            }
        }

        let request = EmbeddingRequest {
            model: self.config.embedding_model.clone(),
            input: vec![text.to_string()],
        };

        let response = self
            .client
            .post(&self.config.embedding_endpoint)
            .bearer_auth(&self.api_key)
            .json(&request)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    CoreError::CapabilityTimeout {
                        capability: Capability::Embedding,
                        waited_secs: self.config.query_timeout_secs,
                    }
                } else {
                    CoreError::CapabilityFailure {
                        capability: Capability::Embedding,
                        message: e.to_string(),
                    }
                }
            })?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            warn!(%status, "embedding endpoint error");
            return Err(CoreError::CapabilityFailure {
                capability: Capability::Embedding,
                message: format!("endpoint returned {status}: {body}"),
            });
        }

        let parsed: EmbeddingResponse =
            response.json().await.map_err(|e| CoreError::CapabilityFailure {
                capability: Capability::Embedding,
                message: format!("malformed embedding response: {e}"),
            })?;

        let vector = parsed
            .data
            .into_iter()
            .next()
            .map(|d| d.embedding)
            .ok_or_else(|| CoreError::CapabilityFailure {
                capability: Capability::Embedding,
                message: "no embedding in response".into(),
            })?;

        {
            let mut cache = self.cache.lock().await;
            cache.put(cache_key, Arc::new(vector.clone()));
        }
        debug!(dim = vector.len(), "embedding computed");
        Ok(vector)
    }

    fn dimension(&self) -> usize {
        self.config.embedding_dim
    }

    fn model_name(&self) -> &str {
        &self.config.embedding_model
    }

    async fn is_available(&self) -> bool {
        !self.api_key.is_empty()
    }
}

/// Deterministic hash-based embedding; no model, no network.
pub struct HashEmbedder {
    dim: usize,
}

impl HashEmbedder {
    pub fn new(dim: usize) -> Self {
        Self { dim }
    }
}

#[async_trait]
impl Embedder for HashEmbedder {
    async fn embed(&self, text: &str) -> CoreResult<Vec<f32>> {
        use std::collections::hash_map::DefaultHasher;
        use std::hash::{Hash, Hasher};

        let mut embedding = vec![0.0f32; self.dim];
        for (i, token) in text.split_whitespace().enumerate() {
            let mut hasher = DefaultHasher::new();
            token.to_lowercase().hash(&mut hasher);
            (i as u64 % 8).hash(&mut hasher);
            let hash = hasher.finish();

            for (j, slot) in embedding.iter_mut().enumerate() {
                let mut hasher = DefaultHasher::new();
                hash.hash(&mut hasher);
                (j as u64).hash(&mut hasher);
                let val = hasher.finish();
                let normalized = (val as f64 / u64::MAX as f64) * 2.0 - 1.0;
                *slot += normalized as f32;
            }
        }

        let mag: f32 = embedding.iter().map(|x| x * x).sum::<f32>().sqrt();
        if mag > 0.0 {
            for val in embedding.iter_mut() {
                *val /= mag;
            }
        }
        Ok(embedding)
    }

    fn dimension(&self) -> usize {
        self.dim
    }

    fn model_name(&self) -> &str {
        "hash-based"
    }

    async fn is_available(&self) -> bool {
        true
    }
}

/// Cosine similarity between two vectors; 0.0 on dimension mismatch.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() {
        return 0.0;
    }
    let dot: f32 = a.iter().zip(b.iter()).map(|(x, y)| x * y).sum();
    let mag_a: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let mag_b: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();
    if mag_a == 0.0 || mag_b == 0.0 {
        return 0.0;
    }
    dot / (mag_a * mag_b)
}
