//! NIH Reporter API source
//!
//! Structured-record client: `POST /v2/projects/search` with a criteria
//! body and offset/limit paging. This is the reliable alternative to
//! scraping NIH funding pages.

use crate::agent::{GrantSource, SourceError};
use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use grantradar_events::DiscoveredGrant;
use grantradar_resilience::{is_retryable_status, retry, RetryConfig};
use serde::Deserialize;
use serde_json::json;
use std::time::Duration;
use tracing::{debug, warn};

const PAGE_SIZE: usize = 50;
const MAX_PAGES: usize = 4;

#[derive(Debug, Deserialize)]
struct SearchResponse {
    #[serde(default)]
    results: Vec<serde_json::Value>,
}

/// NIH Reporter search client
pub struct NihReporterSource {
    http: reqwest::Client,
    api_url: String,
    retry_config: RetryConfig,
}

impl NihReporterSource {
    pub fn new(api_url: &str) -> Self {
        Self {
            http: reqwest::Client::builder()
                .timeout(Duration::from_secs(30))
                .build()
                .unwrap_or_default(),
            api_url: api_url.to_string(),
            retry_config: RetryConfig::default(),
        }
    }

    async fn fetch_page(
        &self,
        from_date: &str,
        offset: usize,
    ) -> Result<Vec<serde_json::Value>, SourceError> {
        let body = json!({
            "criteria": {
                "date_added": {"from_date": from_date},
            },
            "offset": offset,
            "limit": PAGE_SIZE,
        });

        let response = retry(
            &self.retry_config,
            "nih_reporter",
            || async {
                let response = self
                    .http
                    .post(&self.api_url)
                    .json(&body)
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

        Ok(response.results)
    }

    fn normalize(&self, raw: &serde_json::Value) -> Option<DiscoveredGrant> {
        let external_id = raw
            .get("project_num")
            .and_then(|v| v.as_str())
            .map(|s| s.to_string())
            .or_else(|| raw.get("appl_id").map(|v| v.to_string()))?;

        let title = raw.get("project_title").and_then(|v| v.as_str())?.to_string();
        if title.is_empty() {
            return None;
        }

        let agency = raw
            .pointer("/agency_ic_admin/name")
            .and_then(|v| v.as_str())
            .map(|s| s.to_string())
            .or_else(|| Some("NIH".to_string()));

        let amount = raw.get("award_amount").and_then(|v| v.as_f64());

        let appl_id = raw
            .get("appl_id")
            .map(|v| v.to_string())
            .unwrap_or_else(|| external_id.clone());

        Some(DiscoveredGrant {
            source: "nih".to_string(),
            external_id,
            title,
            description: raw
                .get("abstract_text")
                .and_then(|v| v.as_str())
                .map(|s| s.to_string()),
            url: format!("https://reporter.nih.gov/project-details/{appl_id}"),
            funding_agency: agency,
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

#[async_trait]
impl GrantSource for NihReporterSource {
    fn name(&self) -> &str {
        "nih"
    }

    async fn fetch_since(
        &self,
        last_check: Option<DateTime<Utc>>,
    ) -> Result<Vec<DiscoveredGrant>, SourceError> {
        let since = last_check.unwrap_or_else(|| Utc::now() - ChronoDuration::days(7));
        let from_date = since.format("%Y-%m-%d").to_string();

        let mut grants = Vec::new();

        for page in 0..MAX_PAGES {
            let results = self.fetch_page(&from_date, page * PAGE_SIZE).await?;
            let count = results.len();

            for raw in &results {
                match self.normalize(raw) {
                    Some(grant) => grants.push(grant),
                    None => warn!(source = "nih", "skipping unparseable project record"),
                }
            }

            debug!(source = "nih", page, count, "page fetched");
            if count < PAGE_SIZE {
                break;
            }
        }

        Ok(grants)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn source() -> NihReporterSource {
        NihReporterSource::new("https://api.reporter.nih.gov/v2/projects/search")
    }

    #[test]
    fn normalizes_a_project_record() {
        let raw = serde_json::json!({
            "appl_id": 10001,
            "project_num": "R01-CA-123456",
            "project_title": "Novel targeted therapy in cancer",
            "abstract_text": "We will develop...",
            "agency_ic_admin": {"name": "National Cancer Institute"},
            "award_amount": 1200000.0,
        });

        let grant = source().normalize(&raw).unwrap();
        assert_eq!(grant.source, "nih");
        assert_eq!(grant.external_id, "R01-CA-123456");
        assert_eq!(
            grant.funding_agency.as_deref(),
            Some("National Cancer Institute")
        );
        assert!(grant.url.ends_with("/10001"));
    }

    #[test]
    fn record_without_title_is_skipped() {
        let raw = serde_json::json!({"project_num": "X"});
        assert!(source().normalize(&raw).is_none());
    }

    #[tokio::test]
    async fn fetch_posts_criteria_and_parses_results() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("POST", "/v2/projects/search")
            .match_body(mockito::Matcher::PartialJson(json!({
                "limit": 50,
                "offset": 0,
            })))
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(
                r#"{"results": [{"appl_id": 1, "project_num": "R01-1", "project_title": "T"}]}"#,
            )
            .create_async()
            .await;

        let source = NihReporterSource::new(&format!("{}/v2/projects/search", server.url()));
        let grants = source.fetch_since(None).await.unwrap();
        assert_eq!(grants.len(), 1);
        assert_eq!(grants[0].external_id, "R01-1");
    }
}
