//! Embedding capabilities: text in, fixed-length vector out.

use crate::config::RetryPolicy;
use crate::error::CapabilityError;
use crate::llm::retry_with_backoff;
use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde_json::{json, Value};
use std::time::Duration;

pub const DEFAULT_EMBEDDING_DIMENSIONS: usize = 128;

#[async_trait]
pub trait Embedder: Send + Sync {
    fn name(&self) -> &str;

    fn dimensions(&self) -> usize;

    /// One vector per input text, in input order.
    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, CapabilityError>;
}

/// Hashes character trigrams into buckets and L2-normalises. Deterministic and
/// offline, so similar strings land close together without a model.
#[derive(Debug, Clone, Copy)]
pub struct CharacterNgramEmbedder {
    pub dimensions: usize,
}

impl Default for CharacterNgramEmbedder {
    fn default() -> Self {
        Self {
            dimensions: DEFAULT_EMBEDDING_DIMENSIONS,
        }
    }
}

impl CharacterNgramEmbedder {
    pub fn embed(&self, text: &str) -> Vec<f32> {
        let mut vector = vec![0f32; self.dimensions.max(1)];
        let lowered = text.to_lowercase();
        let chars: Vec<char> = lowered.chars().collect();

        if chars.is_empty() {
            return vector;
        }

        let mut token = String::with_capacity(12);
        for window in chars.windows(3.min(chars.len())) {
            token.clear();
            token.extend(window.iter());
            let bucket = (fnv1a(token.as_bytes()) % vector.len() as u64) as usize;
            vector[bucket] += 1.0;
        }

        let magnitude = vector.iter().map(|value| value * value).sum::<f32>().sqrt();
        if magnitude > 0.0 {
            for value in &mut vector {
                *value /= magnitude;
            }
        }

        vector
    }
}

fn fnv1a(bytes: &[u8]) -> u64 {
    let mut hash = 1469598103934665603u64;
    for byte in bytes {
        hash ^= *byte as u64;
        hash = hash.wrapping_mul(1099511628211);
    }
    hash
}

#[async_trait]
impl Embedder for CharacterNgramEmbedder {
    fn name(&self) -> &str {
        "char-ngram"
    }

    fn dimensions(&self) -> usize {
        self.dimensions
    }

    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, CapabilityError> {
        Ok(texts.iter().map(|text| self.embed(text)).collect())
    }
}

/// Client for an OpenAI-compatible `/embeddings` endpoint.
pub struct HttpEmbedder {
    client: Client,
    endpoint: String,
    model: String,
    api_key: Option<String>,
    dimensions: usize,
    retry: RetryPolicy,
}

impl HttpEmbedder {
    pub fn new(
        base_url: impl Into<String>,
        model: impl Into<String>,
        api_key: Option<String>,
        dimensions: usize,
    ) -> Self {
        let base_url = base_url.into();
        Self {
            client: Client::builder()
                .timeout(Duration::from_secs(30))
                .build()
                .unwrap_or_default(),
            endpoint: format!("{}/embeddings", base_url.trim_end_matches('/')),
            model: model.into(),
            api_key,
            dimensions,
            retry: RetryPolicy::default(),
        }
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    async fn send_once(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, CapabilityError> {
        let mut request = self.client.post(&self.endpoint).json(&json!({
            "model": self.model,
            "input": texts,
            "dimensions": self.dimensions,
        }));
        if let Some(api_key) = &self.api_key {
            request = request.bearer_auth(api_key);
        }

        let response = request.send().await?;
        let status = response.status();
        if status == StatusCode::TOO_MANY_REQUESTS {
            return Err(CapabilityError::RateLimited {
                service: self.endpoint.clone(),
            });
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(CapabilityError::Status {
                service: self.endpoint.clone(),
                status: status.as_u16(),
                body,
            });
        }

        let payload: Value = response.json().await?;
        parse_embedding_response(&payload, texts.len(), self.dimensions)
    }
}

#[async_trait]
impl Embedder for HttpEmbedder {
    fn name(&self) -> &str {
        &self.model
    }

    fn dimensions(&self) -> usize {
        self.dimensions
    }

    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, CapabilityError> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }
        if texts.iter().any(|text| text.trim().is_empty()) {
            return Err(CapabilityError::EmptyInput);
        }
        retry_with_backoff(&self.retry, &self.endpoint, || self.send_once(texts)).await
    }
}

/// Reads `data[*].embedding`, placing each vector by its `index` field.
fn parse_embedding_response(payload: &Value, expected: usize, dimensions: usize) -> Result<Vec<Vec<f32>>, CapabilityError> {
    let data = payload
        .pointer("/data")
        .and_then(Value::as_array)
        .ok_or_else(|| CapabilityError::Malformed("embedding response has no data array".to_string()))?;

    let mut vectors: Vec<Option<Vec<f32>>> = vec![None; expected];
    for (position, item) in data.iter().enumerate() {
        let index = item
            .get("index")
            .and_then(Value::as_u64)
            .map(|index| index as usize)
            .unwrap_or(position);
        let vector: Vec<f32> = item
            .get("embedding")
            .and_then(Value::as_array)
            .ok_or_else(|| CapabilityError::Malformed(format!("item {index} has no embedding")))?
            .iter()
            .map(|value| value.as_f64().map(|value| value as f32))
            .collect::<Option<_>>()
            .ok_or_else(|| CapabilityError::Malformed(format!("item {index} has non-numeric values")))?;

        if vector.len() != dimensions {
            return Err(CapabilityError::Malformed(format!(
                "embedding dimension {} != {}",
                vector.len(),
                dimensions
            )));
        }
        match vectors.get_mut(index) {
            Some(slot) => *slot = Some(vector),
            None => return Err(CapabilityError::Malformed(format!("embedding index {index} out of range"))),
        }
    }

    vectors
        .into_iter()
        .collect::<Option<Vec<_>>>()
        .ok_or_else(|| CapabilityError::Malformed(format!("expected {expected} embeddings")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn embedder_is_deterministic() {
        let embedder = CharacterNgramEmbedder::default();
        let first = embedder.embed("Hydraulic pressure and flow");
        let second = embedder.embed("Hydraulic pressure and flow");
        assert_eq!(first, second);
    }

    #[test]
    fn embedder_outputs_normalised_vectors_of_configured_length() {
        let embedder = CharacterNgramEmbedder { dimensions: 32 };
        let vector = embedder.embed("abc");
        assert_eq!(vector.len(), 32);
        let norm: f32 = vector.iter().map(|value| value * value).sum::<f32>().sqrt();
        assert!((norm - 1.0).abs() < 1e-5);
    }

    #[test]
    fn short_text_still_embeds() {
        let vector = CharacterNgramEmbedder::default().embed("ok");
        assert!(vector.iter().any(|value| *value > 0.0));
    }

    #[tokio::test]
    async fn batch_preserves_input_order() {
        let embedder = CharacterNgramEmbedder::default();
        let texts = vec!["backup policy".to_string(), "restore steps".to_string()];
        let vectors = embedder.embed_batch(&texts).await.expect("local embedder never fails");
        assert_eq!(vectors[0], embedder.embed("backup policy"));
        assert_eq!(vectors[1], embedder.embed("restore steps"));
    }

    #[test]
    fn response_vectors_are_placed_by_index() {
        let payload = json!({
            "data": [
                { "index": 1, "embedding": [0.0, 1.0] },
                { "index": 0, "embedding": [1.0, 0.0] },
            ]
        });
        let vectors = parse_embedding_response(&payload, 2, 2).expect("valid payload");
        assert_eq!(vectors, vec![vec![1.0, 0.0], vec![0.0, 1.0]]);
    }

    #[test]
    fn response_with_wrong_dimension_is_malformed() {
        let payload = json!({ "data": [{ "index": 0, "embedding": [1.0] }] });
        assert!(matches!(
            parse_embedding_response(&payload, 1, 2),
            Err(CapabilityError::Malformed(_))
        ));
        let missing = json!({ "data": [] });
        assert!(parse_embedding_response(&missing, 1, 2).is_err());
    }
}
