//! Embedding provider seam.
//!
//! One OpenAI-style `/embeddings` call per passage or query. The provider
//! itself is an external collaborator; the core only needs a vector of
//! the configured dimension back.

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use tracing::warn;

use crate::config::EmbeddingConfig;

#[async_trait]
pub trait Embedder: Send + Sync {
    async fn embed(&self, text: &str) -> Result<Vec<f32>>;

    /// Native dimension of the configured model.
    fn dim(&self) -> usize;
}

/// Reqwest-backed embedder for OpenAI-compatible endpoints.
pub struct HttpEmbedder {
    client: reqwest::Client,
    endpoint: String,
    api_key: Option<String>,
    model: String,
    dim: usize,
}

impl HttpEmbedder {
    pub fn new(config: &EmbeddingConfig) -> Self {
        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(60))
            .build()
            .unwrap_or_default();
        Self {
            client,
            endpoint: config.embedding_endpoint.trim_end_matches('/').to_string(),
            api_key: config.api_key.clone(),
            model: config.embedding_model.clone(),
            dim: config.embedding_dim,
        }
    }
}

#[async_trait]
impl Embedder for HttpEmbedder {
    async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        let mut builder = self
            .client
            .post(format!("{}/embeddings", self.endpoint))
            .json(&serde_json::json!({
                "model": &self.model,
                "input": text,
                "encoding_format": "float",
            }));
        if let Some(key) = &self.api_key {
            builder = builder.header("Authorization", format!("Bearer {key}"));
        }

        let resp = builder.send().await?;
        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(anyhow!("embedding API error ({status}): {body}"));
        }

        let json: serde_json::Value = resp.json().await?;
        let embedding = json["data"][0]["embedding"]
            .as_array()
            .ok_or_else(|| anyhow!("unexpected payload from embedding endpoint: {json}"))?;
        let vec: Vec<f32> = embedding
            .iter()
            .filter_map(|v| v.as_f64().map(|f| f as f32))
            .collect();

        if vec.len() != self.dim {
            warn!(
                got = vec.len(),
                expected = self.dim,
                "unexpected embedding dimension"
            );
        }
        Ok(vec)
    }

    fn dim(&self) -> usize {
        self.dim
    }
}

#[cfg(test)]
pub mod testing {
    //! Deterministic embedder for tests: similar texts share a prefix
    //! token, so similarity ordering is predictable.

    use super::*;

    pub struct DeterministicEmbedder {
        pub dim: usize,
    }

    impl DeterministicEmbedder {
        pub fn new(dim: usize) -> Self {
            Self { dim }
        }
    }

    #[async_trait]
    impl Embedder for DeterministicEmbedder {
        async fn embed(&self, text: &str) -> Result<Vec<f32>> {
            let mut vec = vec![0.0f32; self.dim];
            for (i, byte) in text.bytes().enumerate() {
                vec[i % self.dim] += byte as f32 / 255.0;
            }
            // normalize so cosine similarity behaves
            let norm: f32 = vec.iter().map(|v| v * v).sum::<f32>().sqrt();
            if norm > 0.0 {
                for v in &mut vec {
                    *v /= norm;
                }
            }
            Ok(vec)
        }

        fn dim(&self) -> usize {
            self.dim
        }
    }
}
