//! Embedding client for an OpenAI-compatible `/v1/embeddings` endpoint.
//!
//! Vectors are truncated to the fixed index dimension and L2-normalized
//! before use, so cosine similarity reduces to a dot product.

use serde::Deserialize;
use std::time::Duration;
use tracing::warn;

use funnel_core::config::EMBEDDING_DIMENSIONS;

use crate::{Result, RetrievalError};

const REQUEST_TIMEOUT_SECS: u64 = 30;

pub struct EmbeddingClient {
    client: reqwest::Client,
    base_url: String,
    api_key: String,
    model: String,
}

impl EmbeddingClient {
    pub fn new(
        base_url: impl Into<String>,
        api_key: impl Into<String>,
        model: impl Into<String>,
    ) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(REQUEST_TIMEOUT_SECS))
            .build()
            .unwrap_or_default();
        Self {
            client,
            base_url: base_url.into(),
            api_key: api_key.into(),
            model: model.into(),
        }
    }

    /// Embed one text; returns a unit-length vector of
    /// [`EMBEDDING_DIMENSIONS`] components.
    pub async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        let url = format!("{}/v1/embeddings", self.base_url);
        let body = serde_json::json!({
            "model": self.model,
            "input": [text],
        });

        let resp = self
            .client
            .post(&url)
            .bearer_auth(&self.api_key)
            .header("content-type", "application/json")
            .json(&body)
            .send()
            .await?;

        let status = resp.status().as_u16();
        if !resp.status().is_success() {
            let text = resp.text().await.unwrap_or_default();
            warn!(status, body = %text, "embeddings API error");
            return Err(RetrievalError::Api {
                status,
                message: text,
            });
        }

        let api_resp: EmbeddingResponse = resp
            .json()
            .await
            .map_err(|e| RetrievalError::Embedding(e.to_string()))?;

        let raw = api_resp
            .data
            .into_iter()
            .next()
            .map(|d| d.embedding)
            .ok_or_else(|| RetrievalError::Embedding("empty embedding response".to_string()))?;

        Ok(normalize_and_truncate(raw))
    }
}

/// Truncate to the index dimension, then L2-normalize the truncated vector
/// so stored and query vectors are unit-length in the same space.
pub fn normalize_and_truncate(mut vec: Vec<f32>) -> Vec<f32> {
    vec.truncate(EMBEDDING_DIMENSIONS);
    let norm: f32 = vec.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm > 0.0 {
        for x in &mut vec {
            *x /= norm;
        }
    }
    vec
}

/// Pack a vector as little-endian f32 bytes for BLOB storage.
pub fn vector_to_blob(vec: &[f32]) -> Vec<u8> {
    let mut out = Vec::with_capacity(vec.len() * 4);
    for x in vec {
        out.extend_from_slice(&x.to_le_bytes());
    }
    out
}

/// Inverse of [`vector_to_blob`]. Trailing partial chunks are ignored.
pub fn blob_to_vector(blob: &[u8]) -> Vec<f32> {
    blob.chunks_exact(4)
        .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
        .collect()
}

#[derive(Deserialize)]
struct EmbeddingResponse {
    data: Vec<EmbeddingData>,
}

#[derive(Deserialize)]
struct EmbeddingData {
    embedding: Vec<f32>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalize_produces_unit_length() {
        let v = normalize_and_truncate(vec![3.0, 4.0]);
        let norm: f32 = v.iter().map(|x| x * x).sum::<f32>().sqrt();
        assert!((norm - 1.0).abs() < 1e-6);
    }

    #[test]
    fn truncates_oversized_vectors() {
        let v = normalize_and_truncate(vec![1.0; EMBEDDING_DIMENSIONS + 512]);
        assert_eq!(v.len(), EMBEDDING_DIMENSIONS);
    }

    #[test]
    fn zero_vector_stays_zero() {
        let v = normalize_and_truncate(vec![0.0, 0.0, 0.0]);
        assert!(v.iter().all(|x| *x == 0.0));
    }

    #[test]
    fn blob_roundtrip() {
        let v = vec![0.25f32, -1.5, 3.75];
        assert_eq!(blob_to_vector(&vector_to_blob(&v)), v);
    }
}
