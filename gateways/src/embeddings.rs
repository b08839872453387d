//! Embedding provider client
//!
//! `POST {model, input, dimensions}` returning ordered `data[].embedding`.
//! Transient failures are retried with backoff and jitter.

use grantradar_config::EmbeddingSettings;
use grantradar_resilience::{is_retryable_status, retry, RetryConfig, RetryError};
use serde::Deserialize;
use serde_json::json;
use std::time::Duration;
use tracing::debug;

/// Embedding call errors
#[derive(Debug, thiserror::Error)]
pub enum EmbeddingError {
    #[error("embedding request failed: {0}")]
    Request(String),

    #[error("embedding provider returned HTTP {0}")]
    Status(u16),

    #[error("embedding response missing data for input {index}")]
    MissingData { index: usize },

    #[error("retries exhausted: {0}")]
    Retry(#[from] RetryError),
}

#[derive(Debug, Deserialize)]
struct EmbeddingResponse {
    data: Vec<EmbeddingDatum>,
}

#[derive(Debug, Deserialize)]
struct EmbeddingDatum {
    embedding: Vec<f32>,
}

/// Client for the embedding provider
pub struct EmbeddingClient {
    http: reqwest::Client,
    settings: EmbeddingSettings,
    retry_config: RetryConfig,
}

impl EmbeddingClient {
    pub fn new(settings: &EmbeddingSettings) -> Self {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .unwrap_or_default();

        Self {
            http,
            settings: settings.clone(),
            retry_config: RetryConfig::default(),
        }
    }

    /// Number of dimensions each vector carries
    pub fn dimensions(&self) -> usize {
        self.settings.dimensions
    }

    async fn request(&self, input: serde_json::Value) -> Result<EmbeddingResponse, EmbeddingError> {
        let body = json!({
            "model": self.settings.model,
            "input": input,
            "dimensions": self.settings.dimensions,
        });

        let response = self
            .http
            .post(&self.settings.base_url)
            .bearer_auth(&self.settings.api_key)
            .json(&body)
            .send()
            .await
            .map_err(|err| EmbeddingError::Request(err.to_string()))?;

        let status = response.status().as_u16();
        if !response.status().is_success() {
            return Err(EmbeddingError::Status(status));
        }

        response
            .json::<EmbeddingResponse>()
            .await
            .map_err(|err| EmbeddingError::Request(err.to_string()))
    }

    /// Embed a single text
    pub async fn embed(&self, text: &str) -> Result<Vec<f32>, EmbeddingError> {
        let mut vectors = self.embed_batch(&[text]).await?;
        if vectors.is_empty() {
            return Err(EmbeddingError::MissingData { index: 0 });
        }
        Ok(vectors.remove(0))
    }

    /// Embed several texts in one call; vectors come back in input order.
    pub async fn embed_batch(&self, texts: &[&str]) -> Result<Vec<Vec<f32>>, EmbeddingError> {
        let input = serde_json::Value::from(
            texts.iter().map(|t| t.to_string()).collect::<Vec<String>>(),
        );

        let response = retry(
            &self.retry_config,
            "embedding",
            || self.request(input.clone()),
            |err| match err {
                EmbeddingError::Status(status) => is_retryable_status(*status),
                EmbeddingError::Request(_) => true,
                _ => false,
            },
        )
        .await?;

        if response.data.len() < texts.len() {
            return Err(EmbeddingError::MissingData {
                index: response.data.len(),
            });
        }

        debug!(count = texts.len(), "embeddings generated");
        Ok(response.data.into_iter().map(|d| d.embedding).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_settings(url: String) -> EmbeddingSettings {
        EmbeddingSettings {
            base_url: url,
            api_key: "key".to_string(),
            model: "text-embedding-3-small".to_string(),
            dimensions: 3,
        }
    }

    #[tokio::test]
    async fn embeds_single_text() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("POST", "/")
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(r#"{"data": [{"embedding": [0.1, 0.2, 0.3]}]}"#)
            .create_async()
            .await;

        let client = EmbeddingClient::new(&test_settings(format!("{}/", server.url())));
        let vector = client.embed("cancer research").await.unwrap();
        assert_eq!(vector, vec![0.1, 0.2, 0.3]);
    }

    #[tokio::test]
    async fn batch_preserves_order() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("POST", "/")
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(
                r#"{"data": [{"embedding": [1.0, 0.0, 0.0]}, {"embedding": [0.0, 1.0, 0.0]}]}"#,
            )
            .create_async()
            .await;

        let client = EmbeddingClient::new(&test_settings(format!("{}/", server.url())));
        let vectors = client.embed_batch(&["a", "b"]).await.unwrap();
        assert_eq!(vectors.len(), 2);
        assert_eq!(vectors[0], vec![1.0, 0.0, 0.0]);
        assert_eq!(vectors[1], vec![0.0, 1.0, 0.0]);
    }

    #[tokio::test]
    async fn client_error_is_not_retried() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/")
            .with_status(400)
            .expect(1)
            .create_async()
            .await;

        let client = EmbeddingClient::new(&test_settings(format!("{}/", server.url())));
        let err = client.embed("x").await.unwrap_err();
        assert!(matches!(err, EmbeddingError::Retry(RetryError::NonRetryable(_))));
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn short_response_is_an_error() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("POST", "/")
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(r#"{"data": []}"#)
            .create_async()
            .await;

        let client = EmbeddingClient::new(&test_settings(format!("{}/", server.url())));
        let err = client.embed("x").await.unwrap_err();
        assert!(matches!(err, EmbeddingError::MissingData { .. }));
    }
}
