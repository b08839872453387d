//! Grants.gov daily extract source
//!
//! The RSS feed is deprecated; Grants.gov publishes a daily database
//! extract on S3 instead, with URLs following
//! `{base}/GrantsDBExtract{YYYYMMDD}v2.xml`. The extract is parsed as a
//! stream of `OpportunitySynopsisDetail_1_0` elements. Detail fetches for
//! records missing a description are limited to one request per second.

use crate::agent::{GrantSource, SourceError};
use crate::rate_limit::RateLimiter;
use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use grantradar_events::DiscoveredGrant;
use grantradar_resilience::{is_retryable_status, retry, RetryConfig};
use quick_xml::events::Event;
use quick_xml::Reader;
use std::collections::HashMap;
use std::time::Duration;
use tracing::{debug, info, warn};

const SYNOPSIS_ELEMENT: &str = "OpportunitySynopsisDetail_1_0";
/// At most this many detail fetches per cycle
const MAX_DETAIL_FETCHES: usize = 10;

/// Grants.gov extract client
pub struct GrantsGovSource {
    http: reqwest::Client,
    extract_base_url: String,
    details_url: String,
    detail_limiter: RateLimiter,
    retry_config: RetryConfig,
}

impl GrantsGovSource {
    pub fn new(extract_base_url: &str) -> Self {
        Self {
            http: reqwest::Client::builder()
                .timeout(Duration::from_secs(60))
                .build()
                .unwrap_or_default(),
            extract_base_url: extract_base_url.trim_end_matches('/').to_string(),
            details_url: "https://apply07.grants.gov/grantsws/rest/opportunity/details"
                .to_string(),
            detail_limiter: RateLimiter::per_second(),
            retry_config: RetryConfig::default(),
        }
    }

    fn extract_url_for(&self, date: DateTime<Utc>) -> String {
        format!(
            "{}/GrantsDBExtract{}v2.xml",
            self.extract_base_url,
            date.format("%Y%m%d")
        )
    }

    async fn fetch_extract(&self, date: DateTime<Utc>) -> Result<String, SourceError> {
        let url = self.extract_url_for(date);

        retry(
            &self.retry_config,
            "grants_gov_extract",
            || async {
                let response = self
                    .http
                    .get(&url)
                    .send()
                    .await
                    .map_err(|err| SourceError::Http(err.to_string()))?;

                let status = response.status().as_u16();
                if !response.status().is_success() {
                    return Err(SourceError::Status(status));
                }

                response
                    .text()
                    .await
                    .map_err(|err| SourceError::Http(err.to_string()))
            },
            |err| match err {
                SourceError::Status(status) => is_retryable_status(*status),
                SourceError::Http(_) => true,
                _ => false,
            },
        )
        .await
        .map_err(|err| SourceError::Http(err.to_string()))
    }

    /// Enrich a record missing its description, rate limited to 1 req/s
    async fn fetch_detail_description(&self, opportunity_id: &str) -> Option<String> {
        self.detail_limiter.acquire().await;

        let response = self
            .http
            .get(&self.details_url)
            .query(&[("oppId", opportunity_id)])
            .send()
            .await
            .ok()?;

        if !response.status().is_success() {
            return None;
        }

        let value: serde_json::Value = response.json().await.ok()?;
        value
            .pointer("/synopsis/synopsisDesc")
            .and_then(|v| v.as_str())
            .map(|s| s.to_string())
    }
}

/// Parse the daily extract into raw field maps, one per synopsis element.
/// Records missing mandatory fields are dropped by the caller.
pub fn parse_extract(xml: &str) -> Vec<HashMap<String, String>> {
    let mut reader = Reader::from_str(xml);
    reader.trim_text(true);

    let mut records = Vec::new();
    let mut current: Option<HashMap<String, String>> = None;
    let mut field: Option<String> = None;
    let mut buf = Vec::new();

    loop {
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(start)) => {
                let name = String::from_utf8_lossy(start.name().as_ref()).to_string();
                if name == SYNOPSIS_ELEMENT {
                    current = Some(HashMap::new());
                } else if current.is_some() {
                    field = Some(name);
                }
            }
            Ok(Event::Text(text)) => {
                if let (Some(record), Some(field_name)) = (current.as_mut(), field.as_ref()) {
                    let value = text.unescape().unwrap_or_default().to_string();
                    if !value.is_empty() {
                        record
                            .entry(field_name.clone())
                            .and_modify(|existing| existing.push_str(&value))
                            .or_insert(value);
                    }
                }
            }
            Ok(Event::End(end)) => {
                let name = String::from_utf8_lossy(end.name().as_ref()).to_string();
                if name == SYNOPSIS_ELEMENT {
                    if let Some(record) = current.take() {
                        records.push(record);
                    }
                } else {
                    field = None;
                }
            }
            Ok(Event::Eof) => break,
            Err(err) => {
                warn!(error = %err, "extract parse error, stopping at current position");
                break;
            }
            _ => {}
        }
        buf.clear();
    }

    records
}

/// Parse the extract's MMDDYYYY date format into an end-of-day deadline
pub fn parse_extract_date(raw: &str) -> Option<DateTime<Utc>> {
    NaiveDate::parse_from_str(raw.trim(), "%m%d%Y")
        .ok()
        .and_then(|date| date.and_hms_opt(23, 59, 59))
        .map(|dt| dt.and_utc())
}

fn normalize(record: &HashMap<String, String>) -> Option<DiscoveredGrant> {
    let opportunity_id = record.get("OpportunityID")?.clone();
    let external_id = record
        .get("OpportunityNumber")
        .cloned()
        .unwrap_or_else(|| opportunity_id.clone());
    let title = record.get("OpportunityTitle")?.clone();
    if title.is_empty() {
        return None;
    }

    let amount_max = record
        .get("AwardCeiling")
        .and_then(|s| s.parse::<f64>().ok());
    let amount_min = record
        .get("AwardFloor")
        .and_then(|s| s.parse::<f64>().ok());

    Some(DiscoveredGrant {
        source: "grants_gov".to_string(),
        external_id,
        title,
        description: record.get("Description").cloned(),
        url: format!("https://www.grants.gov/search-results-detail/{opportunity_id}"),
        funding_agency: record.get("AgencyName").cloned(),
        estimated_amount: amount_max.or(amount_min),
        amount_min,
        amount_max,
        deadline: record
            .get("CloseDate")
            .and_then(|raw| parse_extract_date(raw)),
        eligibility: record
            .get("EligibleApplicants")
            .map(|v| serde_json::Value::String(v.clone())),
        discovered_at: Utc::now(),
        raw_data: None,
    })
}

#[async_trait]
impl GrantSource for GrantsGovSource {
    fn name(&self) -> &str {
        "grants_gov"
    }

    async fn fetch_since(
        &self,
        last_check: Option<DateTime<Utc>>,
    ) -> Result<Vec<DiscoveredGrant>, SourceError> {
        let xml = self.fetch_extract(Utc::now()).await?;
        let records = parse_extract(&xml);
        info!(source = "grants_gov", records = records.len(), "extract parsed");

        let mut grants = Vec::new();
        for record in &records {
            // Skip records last updated before the previous check
            if let (Some(last_check), Some(updated)) = (
                last_check,
                record
                    .get("LastUpdatedDate")
                    .and_then(|raw| parse_extract_date(raw)),
            ) {
                if updated < last_check {
                    continue;
                }
            }

            match normalize(record) {
                Some(grant) => grants.push(grant),
                None => debug!(source = "grants_gov", "skipping incomplete synopsis record"),
            }
        }

        // Backfill missing descriptions via the rate-limited details API
        let mut detail_fetches = 0usize;
        for grant in grants.iter_mut() {
            if grant.description.is_some() || detail_fetches >= MAX_DETAIL_FETCHES {
                continue;
            }
            detail_fetches += 1;
            let opportunity_id = grant
                .url
                .rsplit('/')
                .next()
                .unwrap_or(&grant.external_id)
                .to_string();
            grant.description = self.fetch_detail_description(&opportunity_id).await;
        }

        Ok(grants)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE_EXTRACT: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<Grants>
  <OpportunitySynopsisDetail_1_0>
    <OpportunityID>355123</OpportunityID>
    <OpportunityNumber>OPP-1</OpportunityNumber>
    <OpportunityTitle>Community Econ Dev</OpportunityTitle>
    <AgencyName>Administration for Children and Families</AgencyName>
    <Description>Economic development grants for communities.</Description>
    <CloseDate>12312026</CloseDate>
    <AwardCeiling>750000</AwardCeiling>
    <AwardFloor>100000</AwardFloor>
  </OpportunitySynopsisDetail_1_0>
  <OpportunitySynopsisDetail_1_0>
    <OpportunityID>355124</OpportunityID>
    <OpportunityTitle>Rural Health Outreach</OpportunityTitle>
  </OpportunitySynopsisDetail_1_0>
</Grants>"#;

    #[test]
    fn parses_synopsis_records() {
        let records = parse_extract(SAMPLE_EXTRACT);
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].get("OpportunityNumber").unwrap(), "OPP-1");
        assert_eq!(
            records[0].get("AgencyName").unwrap(),
            "Administration for Children and Families"
        );
    }

    #[test]
    fn normalizes_complete_record() {
        let records = parse_extract(SAMPLE_EXTRACT);
        let grant = normalize(&records[0]).unwrap();

        assert_eq!(grant.source, "grants_gov");
        assert_eq!(grant.external_id, "OPP-1");
        assert_eq!(grant.amount_max, Some(750_000.0));
        assert_eq!(grant.amount_min, Some(100_000.0));
        assert!(grant.url.ends_with("/355123"));

        let deadline = grant.deadline.unwrap();
        assert_eq!(deadline.format("%Y-%m-%d").to_string(), "2026-12-31");
    }

    #[test]
    fn record_without_number_falls_back_to_id() {
        let records = parse_extract(SAMPLE_EXTRACT);
        let grant = normalize(&records[1]).unwrap();
        assert_eq!(grant.external_id, "355124");
        assert!(grant.description.is_none());
    }

    #[test]
    fn extract_dates_parse_mmddyyyy() {
        let parsed = parse_extract_date("07042027").unwrap();
        assert_eq!(parsed.format("%Y-%m-%d").to_string(), "2027-07-04");
        assert!(parse_extract_date("garbage").is_none());
    }

    #[test]
    fn malformed_xml_yields_partial_records() {
        let xml = "<Grants><OpportunitySynopsisDetail_1_0><OpportunityID>1</Opportun";
        let records = parse_extract(xml);
        // Truncated element never closed, so nothing is emitted
        assert!(records.is_empty());
    }

    #[test]
    fn extract_url_follows_daily_pattern() {
        let source = GrantsGovSource::new("https://example.org/extracts");
        let date = DateTime::parse_from_rfc3339("2026-08-01T12:00:00Z")
            .unwrap()
            .with_timezone(&Utc);
        assert_eq!(
            source.extract_url_for(date),
            "https://example.org/extracts/GrantsDBExtract20260801v2.xml"
        );
    }
}
