//! Centralized configuration management for GrantRadar
//!
//! Every worker process loads one `Settings` value from the environment at
//! startup and passes it through constructors. There is no global mutable
//! configuration state.

use serde::{Deserialize, Serialize};
use std::env;
use tracing::warn;

/// Configuration errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("missing required environment variable: {name}")]
    MissingVar { name: String },

    #[error("invalid value for {name}: {value}")]
    InvalidValue { name: String, value: String },
}

/// Main application settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    /// Redis connection URL (event bus + ephemeral state)
    pub redis_url: String,

    /// Database configuration
    pub database: DatabaseSettings,

    /// LLM provider configuration
    pub llm: LlmSettings,

    /// Embedding provider configuration
    pub embedding: EmbeddingSettings,

    /// Alert channel configuration
    pub channels: ChannelSettings,

    /// Grant source endpoints
    pub sources: SourceSettings,

    /// Public frontend URL used in alert links
    pub frontend_url: String,
}

/// PostgreSQL connection settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseSettings {
    pub url: String,
    pub pool_min: u32,
    pub pool_max: u32,
    pub connect_timeout_secs: u64,
}

/// One LLM provider endpoint
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmProviderSettings {
    pub name: String,
    pub base_url: String,
    pub api_key: String,
    pub model: String,
}

/// LLM configuration with primary and fallback providers
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmSettings {
    pub primary: LlmProviderSettings,
    pub fallback: LlmProviderSettings,
    pub max_tokens: u32,
    /// Request timeout for LLM-heavy prompts
    pub request_timeout_secs: u64,
    /// Maximum characters of page content handed to extraction prompts
    pub max_context_chars: usize,
}

/// Embedding provider configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmbeddingSettings {
    pub base_url: String,
    pub api_key: String,
    pub model: String,
    pub dimensions: usize,
}

/// Email provider settings (SendGrid-style)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmailSettings {
    pub base_url: String,
    pub api_key: String,
    pub from_email: String,
    pub from_name: String,
}

/// SMS provider settings (Twilio-style)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SmsSettings {
    pub base_url: String,
    pub account_sid: String,
    pub auth_token: String,
    pub from_number: String,
    pub status_callback_url: String,
}

/// Delivery channel configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChannelSettings {
    pub email: EmailSettings,
    pub sms: SmsSettings,
    /// Default system webhook used when a user has none configured
    pub slack_webhook_url: Option<String>,
}

/// External grant source endpoints
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceSettings {
    pub nsf_api_url: String,
    pub nih_reporter_url: String,
    pub grants_gov_extract_url: String,
    pub nih_funding_page_url: String,
}

fn env_or(name: &str, default: &str) -> String {
    env::var(name).unwrap_or_else(|_| default.to_string())
}

fn env_required(name: &str) -> Result<String, ConfigError> {
    env::var(name).map_err(|_| ConfigError::MissingVar {
        name: name.to_string(),
    })
}

fn env_parse<T: std::str::FromStr>(name: &str, default: T) -> Result<T, ConfigError> {
    match env::var(name) {
        Ok(raw) => raw.parse().map_err(|_| ConfigError::InvalidValue {
            name: name.to_string(),
            value: raw,
        }),
        Err(_) => Ok(default),
    }
}

impl Settings {
    /// Load settings from the process environment.
    ///
    /// Connection URLs for Redis and Postgres are required; everything else
    /// falls back to development defaults. Secrets default to empty strings
    /// so that local runs without providers still start, with a warning.
    pub fn from_env() -> Result<Self, ConfigError> {
        let redis_url = env_required("REDIS_URL")?;
        let database_url = env_required("DATABASE_URL")?;

        let llm_api_key = env_or("LLM_API_KEY", "");
        if llm_api_key.is_empty() {
            warn!("LLM_API_KEY not set; LLM calls will fail until configured");
        }

        Ok(Self {
            redis_url,
            database: DatabaseSettings {
                url: database_url,
                pool_min: env_parse("DATABASE_POOL_MIN", 2)?,
                pool_max: env_parse("DATABASE_POOL_MAX", 10)?,
                connect_timeout_secs: env_parse("DATABASE_CONNECT_TIMEOUT_SECS", 30)?,
            },
            llm: LlmSettings {
                primary: LlmProviderSettings {
                    name: env_or("LLM_PRIMARY_NAME", "claude"),
                    base_url: env_or("LLM_PRIMARY_URL", "https://api.anthropic.com/v1/messages"),
                    api_key: llm_api_key.clone(),
                    model: env_or("LLM_PRIMARY_MODEL", "claude-sonnet-4-20250514"),
                },
                fallback: LlmProviderSettings {
                    name: env_or("LLM_FALLBACK_NAME", "openai"),
                    base_url: env_or(
                        "LLM_FALLBACK_URL",
                        "https://api.openai.com/v1/chat/completions",
                    ),
                    api_key: env_or("LLM_FALLBACK_API_KEY", &llm_api_key),
                    model: env_or("LLM_FALLBACK_MODEL", "gpt-4o-mini"),
                },
                max_tokens: env_parse("LLM_MAX_TOKENS", 4096)?,
                request_timeout_secs: env_parse("LLM_REQUEST_TIMEOUT_SECS", 60)?,
                max_context_chars: env_parse("LLM_MAX_CONTEXT_CHARS", 100_000)?,
            },
            embedding: EmbeddingSettings {
                base_url: env_or("EMBEDDING_API_URL", "https://api.openai.com/v1/embeddings"),
                api_key: env_or("EMBEDDING_API_KEY", ""),
                model: env_or("EMBEDDING_MODEL", "text-embedding-3-small"),
                dimensions: env_parse("EMBEDDING_DIMENSIONS", 1536)?,
            },
            channels: ChannelSettings {
                email: EmailSettings {
                    base_url: env_or("EMAIL_API_URL", "https://api.sendgrid.com/v3/mail/send"),
                    api_key: env_or("SENDGRID_API_KEY", ""),
                    from_email: env_or("FROM_EMAIL", "alerts@grantradar.io"),
                    from_name: env_or("FROM_NAME", "GrantRadar"),
                },
                sms: SmsSettings {
                    base_url: env_or("SMS_API_URL", "https://api.twilio.com/2010-04-01"),
                    account_sid: env_or("TWILIO_ACCOUNT_SID", ""),
                    auth_token: env_or("TWILIO_AUTH_TOKEN", ""),
                    from_number: env_or("TWILIO_PHONE_NUMBER", ""),
                    status_callback_url: env_or("SMS_STATUS_CALLBACK_URL", ""),
                },
                slack_webhook_url: env::var("SLACK_WEBHOOK_URL").ok(),
            },
            sources: SourceSettings {
                nsf_api_url: env_or(
                    "NSF_API_URL",
                    "https://api.nsf.gov/services/v1/awards.json",
                ),
                nih_reporter_url: env_or(
                    "NIH_REPORTER_URL",
                    "https://api.reporter.nih.gov/v2/projects/search",
                ),
                grants_gov_extract_url: env_or(
                    "GRANTS_GOV_EXTRACT_URL",
                    "https://prod-grants-gov-chatbot.s3.amazonaws.com/extracts",
                ),
                nih_funding_page_url: env_or(
                    "NIH_FUNDING_PAGE_URL",
                    "https://grants.nih.gov/funding/searchguide/index.html",
                ),
            },
            frontend_url: env_or("FRONTEND_URL", "https://app.grantradar.io"),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    // The process environment is shared across the test harness threads;
    // serialize every test that touches it.
    static ENV_LOCK: Mutex<()> = Mutex::new(());

    fn with_base_env<T>(f: impl FnOnce() -> T) -> T {
        env::set_var("REDIS_URL", "redis://localhost:6379/0");
        env::set_var("DATABASE_URL", "postgres://localhost/grantradar");
        let out = f();
        env::remove_var("REDIS_URL");
        env::remove_var("DATABASE_URL");
        out
    }

    #[test]
    fn loads_defaults_when_only_urls_are_set() {
        let _guard = ENV_LOCK.lock().unwrap_or_else(|e| e.into_inner());
        let settings = with_base_env(Settings::from_env).unwrap();

        assert_eq!(settings.database.pool_min, 2);
        assert_eq!(settings.database.pool_max, 10);
        assert_eq!(settings.embedding.dimensions, 1536);
        assert_eq!(settings.llm.primary.name, "claude");
        assert_eq!(settings.llm.fallback.name, "openai");
    }

    #[test]
    fn missing_redis_url_is_an_error() {
        let _guard = ENV_LOCK.lock().unwrap_or_else(|e| e.into_inner());
        env::remove_var("REDIS_URL");
        env::set_var("DATABASE_URL", "postgres://localhost/grantradar");
        let err = Settings::from_env().unwrap_err();
        assert!(matches!(err, ConfigError::MissingVar { name } if name == "REDIS_URL"));
        env::remove_var("DATABASE_URL");
    }

    #[test]
    fn invalid_numeric_value_is_reported() {
        let _guard = ENV_LOCK.lock().unwrap_or_else(|e| e.into_inner());
        let result = with_base_env(|| {
            env::set_var("DATABASE_POOL_MAX", "lots");
            let r = Settings::from_env();
            env::remove_var("DATABASE_POOL_MAX");
            r
        });
        assert!(matches!(
            result.unwrap_err(),
            ConfigError::InvalidValue { name, .. } if name == "DATABASE_POOL_MAX"
        ));
    }
}
