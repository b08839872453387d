//! NSF Award Search API source
//!
//! Paginated REST client: `GET awards.json?keyword=...&dateStart=...` with
//! offset-based paging. Individual records that fail to normalize are
//! skipped; the page continues.

use crate::agent::{GrantSource, SourceError};
use crate::rate_limit::RateLimiter;
use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use grantradar_events::DiscoveredGrant;
use grantradar_resilience::{is_retryable_status, retry, RetryConfig};
use serde::Deserialize;
use std::time::Duration;
use tracing::{debug, warn};

const PAGE_SIZE: usize = 25;
const MAX_PAGES: usize = 4;
const PRINT_FIELDS: &str = "id,title,abstractText,agency,fundsObligatedAmt,date,startDate";

#[derive(Debug, Deserialize)]
struct SearchResponse {
    response: SearchBody,
}

#[derive(Debug, Deserialize)]
struct SearchBody {
    #[serde(default)]
    award: Vec<serde_json::Value>,
}

/// NSF award search client
pub struct NsfSource {
    http: reqwest::Client,
    api_url: String,
    keyword: String,
    limiter: RateLimiter,
    retry_config: RetryConfig,
}

impl NsfSource {
    pub fn new(api_url: &str) -> Self {
        Self {
            http: reqwest::Client::builder()
                .timeout(Duration::from_secs(30))
                .build()
                .unwrap_or_default(),
            api_url: api_url.to_string(),
            keyword: "research".to_string(),
            limiter: RateLimiter::new(Duration::from_millis(250)),
            retry_config: RetryConfig::default(),
        }
    }

    pub fn with_keyword(mut self, keyword: &str) -> Self {
        self.keyword = keyword.to_string();
        self
    }

    async fn fetch_page(&self, date_start: &str, offset: usize) -> Result<Vec<serde_json::Value>, SourceError> {
        self.limiter.acquire().await;

        let params = [
            ("keyword", self.keyword.clone()),
            ("printFields", PRINT_FIELDS.to_string()),
            ("dateStart", date_start.to_string()),
            ("offset", offset.to_string()),
            ("rpp", PAGE_SIZE.to_string()),
        ];

        let response = retry(
            &self.retry_config,
            "nsf_api",
            || async {
                let response = self
                    .http
                    .get(&self.api_url)
                    .query(&params)
                    .send()
                    .await
                    .map_err(|err| SourceError::Http(err.to_string()))?;

                let status = response.status().as_u16();
                if !response.status().is_success() {
                    return Err(SourceError::Status(status));
                }

                response
                    .json::<SearchResponse>()
                    .await
                    .map_err(|err| SourceError::Parse(err.to_string()))
            },
            |err| match err {
                SourceError::Status(status) => is_retryable_status(*status),
                SourceError::Http(_) => true,
                _ => false,
            },
        )
        .await
        .map_err(|err| SourceError::Http(err.to_string()))?;

        Ok(response.response.award)
    }

    fn normalize(&self, raw: &serde_json::Value) -> Option<DiscoveredGrant> {
        let external_id = raw.get("id").and_then(value_as_string)?;
        let title = raw.get("title").and_then(|v| v.as_str())?.to_string();
        if title.is_empty() {
            return None;
        }

        let amount = raw
            .get("fundsObligatedAmt")
            .and_then(value_as_string)
            .and_then(|s| s.parse::<f64>().ok());

        Some(DiscoveredGrant {
            source: "nsf".to_string(),
            external_id: external_id.clone(),
            title,
            description: raw
                .get("abstractText")
                .and_then(|v| v.as_str())
                .map(|s| s.to_string()),
            url: format!("https://www.nsf.gov/awardsearch/showAward?AWD_ID={external_id}"),
            funding_agency: raw
                .get("agency")
                .and_then(|v| v.as_str())
                .map(|s| s.to_string())
                .or_else(|| Some("NSF".to_string())),
            estimated_amount: amount,
            amount_min: None,
            amount_max: amount,
            deadline: None,
            eligibility: None,
            discovered_at: Utc::now(),
            raw_data: Some(raw.clone()),
        })
    }
}

fn value_as_string(value: &serde_json::Value) -> Option<String> {
    match value {
        serde_json::Value::String(s) => Some(s.clone()),
        serde_json::Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

#[async_trait]
impl GrantSource for NsfSource {
    fn name(&self) -> &str {
        "nsf"
    }

    async fn fetch_since(
        &self,
        last_check: Option<DateTime<Utc>>,
    ) -> Result<Vec<DiscoveredGrant>, SourceError> {
        let since = last_check.unwrap_or_else(|| Utc::now() - ChronoDuration::days(7));
        let date_start = since.format("%m/%d/%Y").to_string();

        let mut grants = Vec::new();
        // NSF offsets are 1-based
        let mut offset = 1usize;

        for page in 0..MAX_PAGES {
            let awards = self.fetch_page(&date_start, offset).await?;
            let count = awards.len();

            for raw in &awards {
                match self.normalize(raw) {
                    Some(grant) => grants.push(grant),
                    None => {
                        warn!(source = "nsf", raw = %truncate_json(raw), "skipping unparseable award");
                    }
                }
            }

            debug!(source = "nsf", page, count, "page fetched");
            if count < PAGE_SIZE {
                break;
            }
            offset += PAGE_SIZE;
        }

        Ok(grants)
    }
}

fn truncate_json(value: &serde_json::Value) -> String {
    let mut text = value.to_string();
    text.truncate(200);
    text
}

#[cfg(test)]
mod tests {
    use super::*;

    fn source() -> NsfSource {
        NsfSource::new("https://api.nsf.gov/services/v1/awards.json")
    }

    #[test]
    fn normalizes_a_complete_award() {
        let raw = serde_json::json!({
            "id": "2300001",
            "title": "Quantum sensing for climate models",
            "abstractText": "Development of quantum sensors.",
            "agency": "NSF",
            "fundsObligatedAmt": "500000",
        });

        let grant = source().normalize(&raw).unwrap();
        assert_eq!(grant.source, "nsf");
        assert_eq!(grant.external_id, "2300001");
        assert_eq!(grant.estimated_amount, Some(500_000.0));
        assert!(grant.url.contains("AWD_ID=2300001"));
    }

    #[test]
    fn numeric_ids_are_accepted() {
        let raw = serde_json::json!({"id": 2300002, "title": "T"});
        let grant = source().normalize(&raw).unwrap();
        assert_eq!(grant.external_id, "2300002");
    }

    #[test]
    fn missing_title_is_skipped() {
        let raw = serde_json::json!({"id": "2300003"});
        assert!(source().normalize(&raw).is_none());
    }

    #[tokio::test]
    async fn fetch_parses_paginated_response() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", mockito::Matcher::Regex("/awards.json.*".to_string()))
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(
                r#"{"response": {"award": [
                    {"id": "1", "title": "First"},
                    {"id": "2", "title": "Second"}
                ]}}"#,
            )
            .create_async()
            .await;

        let source = NsfSource::new(&format!("{}/awards.json", server.url()));
        let grants = source.fetch_since(None).await.unwrap();
        assert_eq!(grants.len(), 2);
        assert_eq!(grants[0].external_id, "1");
    }

    #[tokio::test]
    async fn http_404_is_not_retried() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("GET", mockito::Matcher::Regex("/awards.json.*".to_string()))
            .with_status(404)
            .expect(1)
            .create_async()
            .await;

        let source = NsfSource::new(&format!("{}/awards.json", server.url()));
        assert!(source.fetch_since(None).await.is_err());
        mock.assert_async().await;
    }
}
