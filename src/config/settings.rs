//! Application configuration settings
//!
//! Defines all configuration structures and loading logic. Everything is
//! environment-driven; caller credentials arrive per request and are never
//! part of server configuration.

use crate::services::retry::RetryPolicy;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

/// Main application configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    /// Server configuration
    pub server: ServerConfig,
    /// Free-tier upstream configuration
    pub free_tier: FreeTierConfig,
    /// Retry configuration
    pub retry: RetryConfig,
    /// Request configuration
    pub request: RequestConfig,
    /// Logging configuration
    pub logging: LoggingConfig,
}

/// Server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Listen host
    pub host: String,
    /// Listen port
    pub port: u16,
}

/// Free-tier ("system credits") upstream configuration.
///
/// The operator-held credential lives only here, server-side; it is never
/// exposed to callers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FreeTierConfig {
    /// Operator-held API key; empty means the free tier is unavailable
    pub system_api_key: String,
    /// Upstream base URL (OpenAI-protocol)
    pub base_url: String,
    /// Conversational model, counted against the weekly quota
    pub conversation_model: String,
    /// Analysis model for helper tasks, not counted
    pub analysis_model: String,
    /// Image generation model
    pub image_model: String,
    /// Image generation endpoint base URL
    pub image_base_url: String,
    /// Weekly conversation limit per user
    pub weekly_limit: u32,
    /// Weekly image limit per user
    pub image_limit: u32,
    /// User ids exempt from quota display restrictions
    pub admin_user_ids: Vec<String>,
}

/// Retry configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Retry budget on top of the initial attempt
    pub max_retries: u32,
    /// Base backoff delay in milliseconds
    pub base_delay_ms: u64,
    /// Maximum backoff delay in milliseconds
    pub max_delay_ms: u64,
}

/// Request configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestConfig {
    /// Upstream request timeout in seconds
    pub timeout: u64,
    /// Upstream streaming request timeout in seconds
    pub stream_timeout: u64,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level
    pub level: String,
    /// Log format (text/json)
    pub format: String,
}

impl Settings {
    /// Create a new configuration instance from the environment
    pub fn new() -> Result<Self> {
        // Load .env file if it exists
        dotenv::dotenv().ok();

        let settings = Self {
            server: ServerConfig {
                host: get_env_or_default("SERVER_HOST", "0.0.0.0"),
                port: get_env_or_default("SERVER_PORT", "8082")
                    .parse()
                    .context("Invalid port number")?,
            },
            free_tier: FreeTierConfig {
                system_api_key: std::env::var("SYSTEM_API_KEY").unwrap_or_default(),
                base_url: get_env_or_default("SYSTEM_BASE_URL", "https://api.gmi-serving.com/v1"),
                conversation_model: get_env_or_default(
                    "SYSTEM_CONVERSATION_MODEL",
                    "deepseek-ai/DeepSeek-V3.2",
                ),
                analysis_model: get_env_or_default(
                    "SYSTEM_ANALYSIS_MODEL",
                    "deepseek-ai/DeepSeek-V3.2",
                ),
                image_model: get_env_or_default("SYSTEM_IMAGE_MODEL", "gemini-3-pro-image-preview"),
                image_base_url: get_env_or_default(
                    "SYSTEM_IMAGE_BASE_URL",
                    "https://console.gmicloud.ai/api/v1/ie/requestqueue/apikey",
                ),
                weekly_limit: get_env_or_default("FREE_TIER_WEEKLY_LIMIT", "200")
                    .parse()
                    .context("Invalid weekly conversation limit")?,
                image_limit: get_env_or_default("FREE_TIER_IMAGE_LIMIT", "10")
                    .parse()
                    .context("Invalid weekly image limit")?,
                admin_user_ids: get_env_or_default("ADMIN_USER_IDS", "")
                    .split(',')
                    .map(|s| s.trim().to_string())
                    .filter(|s| !s.is_empty())
                    .collect(),
            },
            retry: RetryConfig {
                max_retries: get_env_or_default("RETRY_MAX_RETRIES", "2")
                    .parse()
                    .context("Invalid retry budget")?,
                base_delay_ms: get_env_or_default("RETRY_BASE_DELAY_MS", "1000")
                    .parse()
                    .context("Invalid base delay")?,
                max_delay_ms: get_env_or_default("RETRY_MAX_DELAY_MS", "10000")
                    .parse()
                    .context("Invalid maximum delay")?,
            },
            request: RequestConfig {
                timeout: get_env_or_default("REQUEST_TIMEOUT", "30")
                    .parse()
                    .context("Invalid request timeout")?,
                stream_timeout: get_env_or_default("STREAM_TIMEOUT", "300")
                    .parse()
                    .context("Invalid stream timeout")?,
            },
            logging: LoggingConfig {
                level: get_env_or_default("RUST_LOG", "info"),
                format: get_env_or_default("LOG_FORMAT", "text"),
            },
        };

        // Validate configuration
        settings.validate()?;

        Ok(settings)
    }

    /// Validate configuration validity
    fn validate(&self) -> Result<()> {
        if self.server.port == 0 {
            anyhow::bail!("Port number cannot be 0");
        }

        if !self.free_tier.base_url.starts_with("http") {
            anyhow::bail!("Invalid free-tier base URL, should start with 'http'");
        }

        if !self.free_tier.image_base_url.starts_with("http") {
            anyhow::bail!("Invalid image base URL, should start with 'http'");
        }

        if self.free_tier.system_api_key.contains(char::is_whitespace) {
            anyhow::bail!("System API key cannot contain whitespace characters");
        }

        if self.request.timeout == 0 || self.request.stream_timeout == 0 {
            anyhow::bail!("Timeout values cannot be 0");
        }

        if self.retry.base_delay_ms == 0 || self.retry.max_delay_ms < self.retry.base_delay_ms {
            anyhow::bail!("Invalid retry delay configuration");
        }

        let valid_formats = ["text", "json"];
        if !valid_formats.contains(&self.logging.format.as_str()) {
            anyhow::bail!("Invalid log format: {}", self.logging.format);
        }

        Ok(())
    }

    /// Retry policy derived from the retry configuration
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_retries: self.retry.max_retries,
            base_delay_ms: self.retry.base_delay_ms,
            max_delay_ms: self.retry.max_delay_ms,
            ..RetryPolicy::default()
        }
    }

    /// Whether the free tier has a usable server credential
    pub fn free_tier_configured(&self) -> bool {
        !self.free_tier.system_api_key.is_empty()
    }
}

/// Get environment variable or default value
fn get_env_or_default(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}
