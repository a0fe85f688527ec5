//! Embedding provider trait, batching client, and vector utilities.
//!
//! Defines the [`EmbeddingProvider`] trait that all embedding backends
//! implement and the [`EmbeddingClient`] that callers use: it splits large
//! batches into sequential provider-sized sub-batches, concatenates them in
//! input order, and converts every failure into
//! [`Error::EmbeddingFailed`](crate::Error::EmbeddingFailed).
//!
//! Concrete provider implementations (OpenAI, Ollama, fastembed) live in
//! the `docent` app crate.

use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;

use crate::error::Error;

/// Largest batch most hosted embedding APIs accept in one request.
pub const DEFAULT_MAX_BATCH: usize = 100;

/// Trait for embedding providers.
///
/// `embed` must return exactly one vector per input text, in input order.
#[async_trait]
pub trait EmbeddingProvider: Send + Sync {
    /// Returns the model identifier (e.g. `"text-embedding-3-small"`).
    fn model_name(&self) -> &str;
    /// Returns the embedding vector dimensionality (e.g. `1536`).
    fn dims(&self) -> usize;
    /// Embed one provider-sized batch.
    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>>;
}

/// Order-preserving, batch-splitting front end over an [`EmbeddingProvider`].
#[derive(Clone)]
pub struct EmbeddingClient {
    provider: Arc<dyn EmbeddingProvider>,
    max_batch: usize,
}

impl EmbeddingClient {
    pub fn new(provider: Arc<dyn EmbeddingProvider>) -> Self {
        Self::with_max_batch(provider, DEFAULT_MAX_BATCH)
    }

    pub fn with_max_batch(provider: Arc<dyn EmbeddingProvider>, max_batch: usize) -> Self {
        Self {
            provider,
            max_batch: max_batch.max(1),
        }
    }

    pub fn model_name(&self) -> &str {
        self.provider.model_name()
    }

    pub fn dims(&self) -> usize {
        self.provider.dims()
    }

    /// Embed a single text, e.g. a chat query.
    pub async fn embed(&self, text: &str) -> crate::Result<Vec<f32>> {
        self.embed_batch(&[text.to_string()])
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| Error::EmbeddingFailed("empty embedding response".to_string()))
    }

    /// Embed many texts. Sub-batches run sequentially and are concatenated
    /// in input order. Any failure aborts the whole call; nothing is
    /// retried here.
    pub async fn embed_batch(&self, texts: &[String]) -> crate::Result<Vec<Vec<f32>>> {
        let mut out = Vec::with_capacity(texts.len());
        for batch in texts.chunks(self.max_batch) {
            let vectors = self
                .provider
                .embed(batch)
                .await
                .map_err(|e| Error::EmbeddingFailed(format!("{:#}", e)))?;
            if vectors.len() != batch.len() {
                return Err(Error::EmbeddingFailed(format!(
                    "provider returned {} vectors for {} inputs",
                    vectors.len(),
                    batch.len()
                )));
            }
            out.extend(vectors);
        }
        Ok(out)
    }
}

/// Encode a float vector as a BLOB (little-endian f32 bytes).
///
/// # Example
///
/// ```rust
/// use docent_core::embedding::{vec_to_blob, blob_to_vec};
///
/// let v = vec![1.0f32, -2.5, 3.125];
/// let blob = vec_to_blob(&v);
/// assert_eq!(blob.len(), 12); // 3 × 4 bytes
/// assert_eq!(blob_to_vec(&blob), v);
/// ```
pub fn vec_to_blob(vec: &[f32]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(vec.len() * 4);
    for &v in vec {
        bytes.extend_from_slice(&v.to_le_bytes());
    }
    bytes
}

/// Decode a BLOB back into a float vector.
pub fn blob_to_vec(blob: &[u8]) -> Vec<f32> {
    blob.chunks_exact(4)
        .map(|chunk| f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
        .collect()
}

/// Compute cosine similarity between two embedding vectors.
///
/// Returns a value in `[-1.0, 1.0]`, or `0.0` for empty vectors, vectors
/// of different lengths, and zero vectors.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }

    let mut dot = 0.0f32;
    let mut norm_a = 0.0f32;
    let mut norm_b = 0.0f32;

    for (x, y) in a.iter().zip(b.iter()) {
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }

    let denom = norm_a.sqrt() * norm_b.sqrt();
    if denom < f32::EPSILON {
        return 0.0;
    }

    dot / denom
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    /// Records batch sizes and encodes each text's numeric suffix.
    struct Recording {
        calls: Mutex<Vec<usize>>,
    }

    #[async_trait]
    impl EmbeddingProvider for Recording {
        fn model_name(&self) -> &str {
            "recording"
        }
        fn dims(&self) -> usize {
            1
        }
        async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
            self.calls.lock().unwrap().push(texts.len());
            Ok(texts
                .iter()
                .map(|t| vec![t.trim_start_matches('t').parse::<f32>().unwrap()])
                .collect())
        }
    }

    struct Short;

    #[async_trait]
    impl EmbeddingProvider for Short {
        fn model_name(&self) -> &str {
            "short"
        }
        fn dims(&self) -> usize {
            1
        }
        async fn embed(&self, _texts: &[String]) -> Result<Vec<Vec<f32>>> {
            Ok(vec![vec![1.0]])
        }
    }

    #[tokio::test]
    async fn test_batches_split_and_keep_order() {
        let provider = Arc::new(Recording {
            calls: Mutex::new(Vec::new()),
        });
        let client = EmbeddingClient::new(provider.clone());
        let texts: Vec<String> = (0..250).map(|i| format!("t{}", i)).collect();

        let vectors = client.embed_batch(&texts).await.unwrap();

        assert_eq!(*provider.calls.lock().unwrap(), vec![100, 100, 50]);
        assert_eq!(vectors.len(), 250);
        for (i, v) in vectors.iter().enumerate() {
            assert_eq!(v[0], i as f32);
        }
    }

    #[tokio::test]
    async fn test_count_mismatch_is_embedding_failure() {
        let client = EmbeddingClient::new(Arc::new(Short));
        let err = client
            .embed_batch(&["a".to_string(), "b".to_string()])
            .await
            .unwrap_err();
        assert!(matches!(err, Error::EmbeddingFailed(_)));
    }

    #[tokio::test]
    async fn test_empty_batch_makes_no_calls() {
        let provider = Arc::new(Recording {
            calls: Mutex::new(Vec::new()),
        });
        let client = EmbeddingClient::new(provider.clone());
        assert!(client.embed_batch(&[]).await.unwrap().is_empty());
        assert!(provider.calls.lock().unwrap().is_empty());
    }

    #[test]
    fn test_vec_blob_roundtrip() {
        let vec = vec![1.0f32, -2.5, 3.125, 0.0, -0.001];
        assert_eq!(blob_to_vec(&vec_to_blob(&vec)), vec);
    }

    #[test]
    fn test_cosine_identical() {
        let v = vec![1.0, 2.0, 3.0];
        assert!((cosine_similarity(&v, &v) - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_cosine_orthogonal() {
        let sim = cosine_similarity(&[1.0, 0.0, 0.0], &[0.0, 1.0, 0.0]);
        assert!(sim.abs() < 1e-6);
    }

    #[test]
    fn test_cosine_degenerate_inputs() {
        assert_eq!(cosine_similarity(&[], &[]), 0.0);
        assert_eq!(cosine_similarity(&[1.0, 2.0], &[1.0]), 0.0);
        assert_eq!(cosine_similarity(&[0.0, 0.0], &[1.0, 1.0]), 0.0);
    }
}
