//! LLM chat client with primary/fallback failover
//!
//! The wire contract is the lowest common denominator across providers:
//! `POST {model, max_tokens, messages:[{role:"user", content}]}`, response
//! text read from `choices[0].message.content` or `content[0].text`.
//!
//! `LlmFailover` wraps a circuit breaker (3 failures, 60 s recovery) plus a
//! sliding window of the last 10 call latencies; a mean above 10 s records
//! a synthetic failure so a slow-but-up provider still trips over to the
//! fallback. The failover lives here, not in the orchestrator, so agents
//! and orchestrator share it without agents importing orchestrator types.

use grantradar_config::{LlmProviderSettings, LlmSettings};
use grantradar_resilience::{
    CircuitBreaker, CircuitBreakerConfig, CircuitBreakerSummary, LatencyWindow,
};
use serde::de::DeserializeOwned;
use serde_json::json;
use std::sync::Mutex;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// Which provider a call should use
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LlmProvider {
    Primary,
    Fallback,
}

/// LLM call errors
#[derive(Debug, thiserror::Error)]
pub enum LlmError {
    #[error("llm request failed: {0}")]
    Request(#[from] reqwest::Error),

    #[error("llm returned HTTP {status}: {body}")]
    Status { status: u16, body: String },

    #[error("llm response had no readable text content")]
    EmptyResponse,

    #[error("llm response was not valid JSON for the expected shape: {0}")]
    Contract(String),
}

/// Latency threshold above which the provider counts as failing, in ms
const LATENCY_THRESHOLD_MS: f64 = 10_000.0;
/// Samples kept in the latency window
const LATENCY_SAMPLES: usize = 10;
/// Minimum samples before the slow-call rule applies
const MIN_SAMPLES_FOR_SLOW_RULE: usize = 3;

/// Circuit breaker plus latency tracking that selects the provider
pub struct LlmFailover {
    breaker: CircuitBreaker,
    latencies: Mutex<LatencyWindow>,
    primary_name: String,
    fallback_name: String,
}

impl LlmFailover {
    pub fn new(primary_name: &str, fallback_name: &str) -> Self {
        Self {
            breaker: CircuitBreaker::new(CircuitBreakerConfig {
                service: format!("llm_{primary_name}"),
                failure_threshold: 3,
                success_threshold: 1,
                recovery_timeout: Duration::from_secs(60),
            }),
            latencies: Mutex::new(LatencyWindow::new(LATENCY_SAMPLES)),
            primary_name: primary_name.to_string(),
            fallback_name: fallback_name.to_string(),
        }
    }

    /// Record a call latency. A consistently slow primary counts as a
    /// failure even when calls succeed.
    pub fn record_latency(&self, latency_ms: f64) {
        let mean = {
            let Ok(mut window) = self.latencies.lock() else {
                return;
            };
            window.record(latency_ms);
            if window.count() < MIN_SAMPLES_FOR_SLOW_RULE {
                return;
            }
            window.mean()
        };

        if mean > LATENCY_THRESHOLD_MS {
            self.breaker.record_failure();
            warn!(
                mean_ms = mean,
                threshold_ms = LATENCY_THRESHOLD_MS,
                fallback = %self.fallback_name,
                "llm latency above threshold, counting as failure"
            );
        }
    }

    pub fn record_success(&self) {
        self.breaker.record_success();
    }

    pub fn record_failure(&self) {
        self.breaker.record_failure();
    }

    /// Provider to use right now: primary while the circuit admits calls
    /// (closed or half-open), otherwise the fallback.
    pub fn provider(&self) -> LlmProvider {
        if self.breaker.can_execute() {
            LlmProvider::Primary
        } else {
            LlmProvider::Fallback
        }
    }

    /// Name of the provider currently selected
    pub fn provider_name(&self) -> &str {
        match self.provider() {
            LlmProvider::Primary => &self.primary_name,
            LlmProvider::Fallback => &self.fallback_name,
        }
    }

    /// Breaker snapshot for the system status report
    pub fn summary(&self) -> CircuitBreakerSummary {
        self.breaker.summary()
    }
}

/// Cached responses live for an hour
const CACHE_TTL: Duration = Duration::from_secs(3600);
/// Bounded cache size
const CACHE_ENTRIES: usize = 2048;

/// Chat-completion client routing through the failover
pub struct LlmClient {
    http: reqwest::Client,
    primary: LlmProviderSettings,
    fallback: LlmProviderSettings,
    max_tokens: u32,
    failover: LlmFailover,
    cache: crate::cache::ResponseCache,
}

impl LlmClient {
    pub fn new(settings: &LlmSettings) -> Self {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(settings.request_timeout_secs))
            .build()
            .unwrap_or_default();

        Self {
            http,
            primary: settings.primary.clone(),
            fallback: settings.fallback.clone(),
            max_tokens: settings.max_tokens,
            failover: LlmFailover::new(&settings.primary.name, &settings.fallback.name),
            cache: crate::cache::ResponseCache::new(CACHE_ENTRIES, CACHE_TTL),
        }
    }

    pub fn failover(&self) -> &LlmFailover {
        &self.failover
    }

    fn provider_settings(&self, provider: LlmProvider) -> &LlmProviderSettings {
        match provider {
            LlmProvider::Primary => &self.primary,
            LlmProvider::Fallback => &self.fallback,
        }
    }

    /// Send one user prompt and return the completion text.
    ///
    /// Latency and success/failure are recorded on the failover around
    /// every call.
    pub async fn complete(&self, prompt: &str, max_tokens: Option<u32>) -> Result<String, LlmError> {
        let provider = self.failover.provider();
        let settings = self.provider_settings(provider);

        let body = json!({
            "model": settings.model,
            "max_tokens": max_tokens.unwrap_or(self.max_tokens),
            "messages": [{"role": "user", "content": prompt}],
        });

        let start = Instant::now();
        let result = self
            .http
            .post(&settings.base_url)
            .bearer_auth(&settings.api_key)
            .header("x-api-key", &settings.api_key)
            .header("anthropic-version", "2023-06-01")
            .json(&body)
            .send()
            .await;
        let latency_ms = start.elapsed().as_secs_f64() * 1000.0;
        self.failover.record_latency(latency_ms);

        let response = match result {
            Ok(response) => response,
            Err(err) => {
                self.failover.record_failure();
                return Err(err.into());
            }
        };

        let status = response.status();
        if !status.is_success() {
            self.failover.record_failure();
            let body = response.text().await.unwrap_or_default();
            return Err(LlmError::Status {
                status: status.as_u16(),
                body: truncate(&body, 500),
            });
        }

        let value: serde_json::Value = match response.json().await {
            Ok(value) => value,
            Err(err) => {
                self.failover.record_failure();
                return Err(err.into());
            }
        };

        match extract_text(&value) {
            Some(text) => {
                self.failover.record_success();
                debug!(
                    provider = %settings.name,
                    latency_ms,
                    chars = text.len(),
                    "llm call complete"
                );
                Ok(text)
            }
            None => {
                self.failover.record_failure();
                Err(LlmError::EmptyResponse)
            }
        }
    }

    /// `complete` with a read-through cache.
    ///
    /// Only for prompts that are pure functions of their inputs
    /// (categorization, duplicate confirmation); personalized content must
    /// use `complete` directly.
    pub async fn complete_cached(
        &self,
        prompt: &str,
        max_tokens: Option<u32>,
    ) -> Result<String, LlmError> {
        if let Some(cached) = self.cache.get(prompt) {
            debug!(chars = cached.len(), "llm cache hit");
            return Ok(cached);
        }

        let text = self.complete(prompt, max_tokens).await?;
        self.cache.put(prompt, text.clone());
        Ok(text)
    }
}

/// Pull completion text from either provider response shape
fn extract_text(value: &serde_json::Value) -> Option<String> {
    if let Some(text) = value
        .get("content")
        .and_then(|c| c.get(0))
        .and_then(|block| block.get("text"))
        .and_then(|t| t.as_str())
    {
        return Some(text.to_string());
    }

    value
        .get("choices")
        .and_then(|c| c.get(0))
        .and_then(|choice| choice.get("message"))
        .and_then(|m| m.get("content"))
        .and_then(|t| t.as_str())
        .map(|s| s.to_string())
}

/// Parse a prompt-contract JSON response, tolerating markdown code fences
/// around the payload.
pub fn parse_json_response<T: DeserializeOwned>(text: &str) -> Result<T, LlmError> {
    let trimmed = text.trim();
    let stripped = trimmed
        .strip_prefix("```json")
        .or_else(|| trimmed.strip_prefix("```"))
        .map(|rest| rest.trim_end_matches("```"))
        .unwrap_or(trimmed)
        .trim();

    serde_json::from_str(stripped).map_err(|err| LlmError::Contract(err.to_string()))
}

fn truncate(text: &str, max: usize) -> String {
    if text.len() <= max {
        text.to_string()
    } else {
        let mut end = max;
        while !text.is_char_boundary(end) {
            end -= 1;
        }
        text[..end].to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[test]
    fn extracts_anthropic_shape() {
        let value = json!({"content": [{"type": "text", "text": "hello"}]});
        assert_eq!(extract_text(&value).unwrap(), "hello");
    }

    #[test]
    fn extracts_openai_shape() {
        let value = json!({"choices": [{"message": {"content": "hi"}}]});
        assert_eq!(extract_text(&value).unwrap(), "hi");
    }

    #[test]
    fn missing_text_yields_none() {
        assert!(extract_text(&json!({"other": true})).is_none());
    }

    #[derive(Deserialize, Debug)]
    struct Verdict {
        same: bool,
    }

    #[test]
    fn parses_fenced_json() {
        let verdict: Verdict = parse_json_response("```json\n{\"same\": true}\n```").unwrap();
        assert!(verdict.same);

        let verdict: Verdict = parse_json_response("  {\"same\": false} ").unwrap();
        assert!(!verdict.same);
    }

    #[test]
    fn contract_violation_is_reported() {
        let result: Result<Verdict, _> = parse_json_response("not json at all");
        assert!(matches!(result.unwrap_err(), LlmError::Contract(_)));
    }

    #[test]
    fn failover_opens_after_three_failures() {
        let failover = LlmFailover::new("claude", "openai");
        assert_eq!(failover.provider(), LlmProvider::Primary);

        failover.record_failure();
        failover.record_failure();
        failover.record_failure();

        assert_eq!(failover.provider(), LlmProvider::Fallback);
        assert_eq!(failover.provider_name(), "openai");
    }

    #[test]
    fn slow_latencies_count_as_failures() {
        let failover = LlmFailover::new("claude", "openai");
        // Each sample once the window has three entries pushes the mean
        // over threshold and records a failure; three failures open the
        // circuit
        for _ in 0..5 {
            failover.record_latency(15_000.0);
        }
        assert_eq!(failover.provider(), LlmProvider::Fallback);
    }

    #[test]
    fn fast_latencies_keep_primary() {
        let failover = LlmFailover::new("claude", "openai");
        for _ in 0..10 {
            failover.record_latency(400.0);
            failover.record_success();
        }
        assert_eq!(failover.provider(), LlmProvider::Primary);
    }

    #[tokio::test]
    async fn complete_parses_mocked_response() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/v1/messages")
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(r#"{"content": [{"type": "text", "text": "{\"ok\": true}"}]}"#)
            .create_async()
            .await;

        let settings = LlmSettings {
            primary: LlmProviderSettings {
                name: "claude".to_string(),
                base_url: format!("{}/v1/messages", server.url()),
                api_key: "test-key".to_string(),
                model: "claude-test".to_string(),
            },
            fallback: LlmProviderSettings {
                name: "openai".to_string(),
                base_url: format!("{}/v1/chat", server.url()),
                api_key: "test-key".to_string(),
                model: "gpt-test".to_string(),
            },
            max_tokens: 1024,
            request_timeout_secs: 5,
            max_context_chars: 100_000,
        };

        let client = LlmClient::new(&settings);
        let text = client.complete("say ok", None).await.unwrap();
        assert_eq!(text, "{\"ok\": true}");
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn http_error_records_failure() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("POST", "/v1/messages")
            .with_status(500)
            .with_body("upstream exploded")
            .expect_at_least(1)
            .create_async()
            .await;

        let settings = LlmSettings {
            primary: LlmProviderSettings {
                name: "claude".to_string(),
                base_url: format!("{}/v1/messages", server.url()),
                api_key: "k".to_string(),
                model: "m".to_string(),
            },
            fallback: LlmProviderSettings {
                name: "openai".to_string(),
                base_url: format!("{}/v1/chat", server.url()),
                api_key: "k".to_string(),
                model: "m".to_string(),
            },
            max_tokens: 256,
            request_timeout_secs: 5,
            max_context_chars: 100_000,
        };

        let client = LlmClient::new(&settings);
        let err = client.complete("hi", None).await.unwrap_err();
        assert!(matches!(err, LlmError::Status { status: 500, .. }));
        assert_eq!(client.failover().summary().failure_count, 1);
    }
}
