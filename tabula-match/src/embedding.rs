//! Embedding provider seam and the HTTP-backed implementation.
//!
//! The matching engine never computes embeddings itself; it calls an
//! [`EmbeddingProvider`]. The shipped implementation, [`HttpEmbedder`],
//! speaks the OpenAI-compatible `/v1/embeddings` protocol that local
//! sentence-embedding servers also expose.

use std::any::Any;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::time::sleep;
use tracing::{debug, error, warn};

use tabula_core::resources::Resource;

use crate::error::{MatchError, Result};

/// A provider that generates vector embeddings from text input.
///
/// The default [`embed_batch`](EmbeddingProvider::embed_batch) calls
/// [`embed`](EmbeddingProvider::embed) sequentially; backends with native
/// batching should override it.
#[async_trait]
pub trait EmbeddingProvider: Send + Sync {
    /// Generate an embedding vector for a single text input.
    async fn embed(&self, text: &str) -> Result<Vec<f32>>;

    /// Generate embedding vectors for a batch of text inputs.
    async fn embed_batch(&self, texts: &[&str]) -> Result<Vec<Vec<f32>>> {
        let mut results = Vec::with_capacity(texts.len());
        for text in texts {
            results.push(self.embed(text).await?);
        }
        Ok(results)
    }

    /// Return the dimensionality of embeddings produced by this provider.
    fn dimensions(&self) -> usize;
}

/// Delay before the single retry the stages are allowed on embedder failure.
const RETRY_BACKOFF: Duration = Duration::from_millis(250);

/// Embed a batch, retrying once with a short backoff before surfacing the
/// failure. This is the only retry policy the pipeline stages apply.
pub async fn embed_with_retry(
    provider: &dyn EmbeddingProvider,
    texts: &[&str],
) -> Result<Vec<Vec<f32>>> {
    match provider.embed_batch(texts).await {
        Ok(embeddings) => Ok(embeddings),
        Err(first) => {
            warn!(error = %first, "embedding failed, retrying once");
            sleep(RETRY_BACKOFF).await;
            provider.embed_batch(texts).await
        }
    }
}

/// Default endpoint path appended to the configured base URL.
const EMBEDDINGS_PATH: &str = "/v1/embeddings";

/// An [`EmbeddingProvider`] backed by an OpenAI-compatible embeddings
/// endpoint.
///
/// Works against the hosted API as well as local embedding servers that
/// implement the same protocol.
///
/// # Example
///
/// ```rust,ignore
/// use tabula_match::HttpEmbedder;
///
/// let embedder = HttpEmbedder::new("http://localhost:8080", "all-MiniLM-L6-v2", 384)?;
/// let embedding = embedder.embed("Tim Cook").await?;
/// ```
pub struct HttpEmbedder {
    client: reqwest::Client,
    url: String,
    model: String,
    api_key: Option<String>,
    dimensions: usize,
}

impl HttpEmbedder {
    /// Create a provider for the given base URL, model name, and output
    /// dimensionality.
    ///
    /// # Errors
    ///
    /// Returns [`MatchError::Config`] if the base URL is empty.
    pub fn new(
        base_url: impl Into<String>,
        model: impl Into<String>,
        dimensions: usize,
    ) -> Result<Self> {
        let base_url = base_url.into();
        if base_url.is_empty() {
            return Err(MatchError::Config("embedder base URL must not be empty".into()));
        }
        Ok(Self {
            client: reqwest::Client::new(),
            url: format!("{}{EMBEDDINGS_PATH}", base_url.trim_end_matches('/')),
            model: model.into(),
            api_key: None,
            dimensions,
        })
    }

    /// Attach a bearer token for endpoints that require one.
    pub fn with_api_key(mut self, api_key: impl Into<String>) -> Self {
        self.api_key = Some(api_key.into());
        self
    }

    fn failure(&self, message: impl Into<String>) -> MatchError {
        MatchError::Embedding { provider: self.model.clone(), message: message.into() }
    }
}

#[derive(Serialize)]
struct EmbeddingRequest<'a> {
    model: &'a str,
    input: Vec<&'a str>,
}

#[derive(Deserialize)]
struct EmbeddingResponse {
    data: Vec<EmbeddingData>,
}

#[derive(Deserialize)]
struct EmbeddingData {
    embedding: Vec<f32>,
}

#[async_trait]
impl EmbeddingProvider for HttpEmbedder {
    async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        let results = self.embed_batch(&[text]).await?;
        results
            .into_iter()
            .next()
            .ok_or_else(|| self.failure("endpoint returned an empty response"))
    }

    async fn embed_batch(&self, texts: &[&str]) -> Result<Vec<Vec<f32>>> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }

        debug!(batch_size = texts.len(), model = %self.model, "embedding batch");

        let mut request = self
            .client
            .post(&self.url)
            .json(&EmbeddingRequest { model: &self.model, input: texts.to_vec() });
        if let Some(key) = &self.api_key {
            request = request.bearer_auth(key);
        }

        let response = request.send().await.map_err(|e| {
            error!(error = %e, "embedding request failed");
            self.failure(format!("request failed: {e}"))
        })?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            error!(%status, "embedding endpoint error");
            return Err(self.failure(format!("endpoint returned {status}: {body}")));
        }

        let parsed: EmbeddingResponse = response
            .json()
            .await
            .map_err(|e| self.failure(format!("failed to parse response: {e}")))?;

        let embeddings: Vec<Vec<f32>> = parsed.data.into_iter().map(|d| d.embedding).collect();
        if embeddings.len() != texts.len() {
            return Err(self.failure(format!(
                "endpoint returned {} embeddings for {} inputs",
                embeddings.len(),
                texts.len()
            )));
        }
        Ok(embeddings)
    }

    fn dimensions(&self) -> usize {
        self.dimensions
    }
}

/// Resource-manager wrapper that gives the whole process custody of one
/// embedding provider.
pub struct EmbedderResource {
    provider: Arc<dyn EmbeddingProvider>,
}

impl EmbedderResource {
    /// Identifier the embedder is registered under.
    pub const IDENTIFIER: &'static str = "embedder";

    /// Wrap a provider for registration with the resource manager.
    pub fn new(provider: Arc<dyn EmbeddingProvider>) -> Self {
        Self { provider }
    }

    /// The wrapped provider.
    pub fn provider(&self) -> Arc<dyn EmbeddingProvider> {
        Arc::clone(&self.provider)
    }
}

impl Resource for EmbedderResource {
    fn identifier(&self) -> &str {
        Self::IDENTIFIER
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_base_url_is_a_config_error() {
        assert!(matches!(
            HttpEmbedder::new("", "all-MiniLM-L6-v2", 384),
            Err(MatchError::Config(_))
        ));
    }

    #[test]
    fn base_url_trailing_slash_is_normalized() {
        let embedder = HttpEmbedder::new("http://localhost:8080/", "m", 8).unwrap();
        assert_eq!(embedder.url, "http://localhost:8080/v1/embeddings");
        assert_eq!(embedder.dimensions(), 8);
    }
}
