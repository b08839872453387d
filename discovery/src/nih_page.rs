//! NIH funding page source with change detection
//!
//! Scraped-HTML variant: the page is fetched, stripped of dynamic content
//! (scripts, styles, comments, volatile attributes, timestamps), and the
//! filtered body is hashed. Extraction only runs when the hash differs
//! from the stored one. Extraction tries the LLM first and falls back to a
//! deterministic rule-based extractor on failure.

use crate::agent::{GrantSource, SourceError};
use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use grantradar_events::kv::page_hash_key;
use grantradar_events::{DiscoveredGrant, KvStore};
use grantradar_gateways::{parse_json_response, LlmClient};
use regex::Regex;
use serde::Deserialize;
use sha2::{Digest, Sha256};
use std::sync::{Arc, OnceLock};
use std::time::Duration;
use tracing::{debug, info, warn};

fn script_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?is)<(script|style|noscript)[^>]*>.*?</(script|style|noscript)>").expect("static regex"))
}

fn comment_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?s)<!--.*?-->").expect("static regex"))
}

fn dynamic_attr_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r#"(?i)\s(?:id|data-[\w-]+|nonce|csrf-token)="[^"]*""#).expect("static regex")
    })
}

fn tag_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?s)<[^>]+>").expect("static regex"))
}

fn timestamp_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"\d{4}-\d{2}-\d{2}T\d{2}:\d{2}[:\d]*|\d{1,2}/\d{1,2}/\d{4}|\d{1,2}:\d{2}(:\d{2})?\s*(AM|PM|am|pm)?")
            .expect("static regex")
    })
}

fn whitespace_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\s+").expect("static regex"))
}

fn opportunity_number_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        // RFA/NOT/OTA numbers carry an institute code (RFA-CA-26-001);
        // PA/PAR/PAS numbers do not (PAR-26-123)
        Regex::new(r"(?:(?:RFA|NOT|OTA)-[A-Z]{2}|PA[RS]?)-\d{2}-\d{3}").expect("static regex")
    })
}

/// Strip dynamic content so only meaningful page changes alter the hash.
pub fn filter_dynamic_content(html: &str) -> String {
    let without_scripts = script_re().replace_all(html, " ");
    let without_comments = comment_re().replace_all(&without_scripts, " ");
    let without_attrs = dynamic_attr_re().replace_all(&without_comments, "");
    let text_only = tag_re().replace_all(&without_attrs, " ");
    let without_timestamps = timestamp_re().replace_all(&text_only, " ");
    whitespace_re()
        .replace_all(&without_timestamps, " ")
        .trim()
        .to_string()
}

/// Hash of the filtered page body
pub fn content_hash(filtered: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(filtered.as_bytes());
    format!("{:x}", hasher.finalize())
}

/// Deterministic fallback extractor: scan for opportunity numbers and take
/// the text that follows each as the title.
fn extract_with_rules(text: &str) -> Vec<ExtractedOpportunity> {
    let mut seen = std::collections::HashSet::new();
    let mut extracted = Vec::new();

    for found in opportunity_number_re().find_iter(text) {
        let number = found.as_str().to_string();
        if !seen.insert(number.clone()) {
            continue;
        }

        let tail = &text[found.end()..];
        let title: String = tail
            .trim_start_matches([':', '-', ' '])
            .chars()
            .take(120)
            .collect::<String>()
            .split("  ")
            .next()
            .unwrap_or("")
            .trim()
            .to_string();

        extracted.push(ExtractedOpportunity {
            opportunity_number: number.clone(),
            title: if title.is_empty() { number } else { title },
            url: None,
            deadline: None,
        });
    }

    extracted
}

#[derive(Debug, Deserialize)]
struct ExtractedOpportunity {
    #[serde(alias = "number")]
    opportunity_number: String,
    title: String,
    #[serde(default)]
    url: Option<String>,
    #[serde(default)]
    deadline: Option<String>,
}

/// NIH funding page scraper
pub struct NihPageSource {
    http: reqwest::Client,
    page_url: String,
    llm: Arc<LlmClient>,
    kv: KvStore,
    max_context_chars: usize,
}

impl NihPageSource {
    pub fn new(page_url: &str, llm: Arc<LlmClient>, kv: KvStore, max_context_chars: usize) -> Self {
        Self {
            http: reqwest::Client::builder()
                .timeout(Duration::from_secs(30))
                .build()
                .unwrap_or_default(),
            page_url: page_url.to_string(),
            llm,
            kv,
            max_context_chars,
        }
    }

    async fn fetch_page(&self) -> Result<String, SourceError> {
        let response = self
            .http
            .get(&self.page_url)
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
    }

    async fn extract_with_llm(&self, text: &str) -> Result<Vec<ExtractedOpportunity>, SourceError> {
        let truncated: String = text.chars().take(self.max_context_chars).collect();

        let prompt = format!(
            "Extract NIH funding opportunities from this page text. Return a JSON array \
             where each element is {{\"opportunity_number\": \"...\", \"title\": \"...\", \
             \"url\": \"...\" or null, \"deadline\": \"YYYY-MM-DD\" or null}}. Opportunity \
             numbers look like RFA-CA-26-001 or PAR-26-123. Return ONLY the JSON array.\n\n\
             PAGE TEXT:\n{truncated}"
        );

        let response = self
            .llm
            .complete(&prompt, Some(2048))
            .await
            .map_err(|err| SourceError::Parse(err.to_string()))?;

        parse_json_response(&response).map_err(|err| SourceError::Parse(err.to_string()))
    }

    fn to_grant(&self, extracted: ExtractedOpportunity) -> DiscoveredGrant {
        let deadline = extracted
            .deadline
            .as_deref()
            .and_then(|raw| NaiveDate::parse_from_str(raw, "%Y-%m-%d").ok())
            .and_then(|date| date.and_hms_opt(23, 59, 59))
            .map(|dt| dt.and_utc());

        DiscoveredGrant {
            source: "nih_funding_page".to_string(),
            external_id: extracted.opportunity_number.clone(),
            title: extracted.title,
            description: None,
            url: extracted
                .url
                .unwrap_or_else(|| self.page_url.clone()),
            funding_agency: Some("NIH".to_string()),
            estimated_amount: None,
            amount_min: None,
            amount_max: None,
            deadline,
            eligibility: None,
            discovered_at: Utc::now(),
            raw_data: None,
        }
    }
}

#[async_trait]
impl GrantSource for NihPageSource {
    fn name(&self) -> &str {
        "nih_funding_page"
    }

    async fn fetch_since(
        &self,
        _last_check: Option<DateTime<Utc>>,
    ) -> Result<Vec<DiscoveredGrant>, SourceError> {
        let html = self.fetch_page().await?;
        let filtered = filter_dynamic_content(&html);
        let hash = content_hash(&filtered);

        let hash_key = page_hash_key(self.name());
        let previous = self.kv.get_string(&hash_key).await?;

        if previous.as_deref() == Some(hash.as_str()) {
            debug!(source = self.name(), "page unchanged, skipping extraction");
            return Ok(Vec::new());
        }

        let extracted = match self.extract_with_llm(&filtered).await {
            Ok(extracted) => {
                info!(
                    source = self.name(),
                    count = extracted.len(),
                    "llm extraction complete"
                );
                extracted
            }
            Err(err) => {
                warn!(
                    source = self.name(),
                    error = %err,
                    "llm extraction failed, using rule-based extractor"
                );
                extract_with_rules(&filtered)
            }
        };

        self.kv.set_string(&hash_key, &hash).await?;

        Ok(extracted
            .into_iter()
            .filter(|e| !e.opportunity_number.is_empty() && !e.title.is_empty())
            .map(|e| self.to_grant(e))
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn filter_strips_scripts_styles_and_comments() {
        let html = r#"<html><head><style>.x{color:red}</style>
            <script>var t = Date.now();</script></head>
            <body><!-- build 2281 --><h1>Funding</h1><p>RFA-CA-26-001</p></body></html>"#;

        let filtered = filter_dynamic_content(html);
        assert!(!filtered.contains("Date.now"));
        assert!(!filtered.contains("color:red"));
        assert!(!filtered.contains("build 2281"));
        assert!(filtered.contains("Funding"));
        assert!(filtered.contains("RFA-CA-26-001"));
    }

    #[test]
    fn filter_removes_timestamps_so_hash_is_stable() {
        let page_a = "<p>Updated 01/15/2026 at 10:30 AM</p><p>RFA-CA-26-001 Cancer Moonshot</p>";
        let page_b = "<p>Updated 02/20/2026 at 04:05 PM</p><p>RFA-CA-26-001 Cancer Moonshot</p>";

        assert_eq!(
            content_hash(&filter_dynamic_content(page_a)),
            content_hash(&filter_dynamic_content(page_b))
        );
    }

    #[test]
    fn filter_detects_real_content_changes() {
        let page_a = "<p>RFA-CA-26-001 Cancer Moonshot</p>";
        let page_b = "<p>RFA-CA-26-002 Alzheimer Initiative</p>";

        assert_ne!(
            content_hash(&filter_dynamic_content(page_a)),
            content_hash(&filter_dynamic_content(page_b))
        );
    }

    #[test]
    fn dynamic_attributes_do_not_affect_hash() {
        let page_a = r#"<div id="react-root-8812" data-build="a1"><p>RFA-CA-26-001</p></div>"#;
        let page_b = r#"<div id="react-root-9913" data-build="b2"><p>RFA-CA-26-001</p></div>"#;

        assert_eq!(
            content_hash(&filter_dynamic_content(page_a)),
            content_hash(&filter_dynamic_content(page_b))
        );
    }

    #[test]
    fn rule_based_extractor_finds_opportunity_numbers() {
        let text = "New opportunities: RFA-CA-26-001: Cancer Moonshot Phase 2  \
                    PAR-26-123: Behavioral Research in Diabetes  RFA-CA-26-001 repeated";
        let extracted = extract_with_rules(text);

        assert_eq!(extracted.len(), 2);
        assert_eq!(extracted[0].opportunity_number, "RFA-CA-26-001");
        assert!(extracted[0].title.starts_with("Cancer Moonshot"));
        assert_eq!(extracted[1].opportunity_number, "PAR-26-123");
    }

    #[test]
    fn llm_alias_field_is_accepted() {
        let parsed: Vec<ExtractedOpportunity> = serde_json::from_str(
            r#"[{"number": "RFA-CA-26-001", "title": "Cancer Moonshot"}]"#,
        )
        .unwrap();
        assert_eq!(parsed[0].opportunity_number, "RFA-CA-26-001");
        assert!(parsed[0].deadline.is_none());
    }
}
