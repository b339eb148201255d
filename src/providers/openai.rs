//! OpenAI-protocol provider adapter
//!
//! Standard chat-completions transport with key-pool failover. Each
//! attempt draws a key from the pool; credential and rate-limit failures
//! rotate the key, transient upstream failures back off and retry without
//! marking the key.

use super::{AttemptError, ChatOutcome, CredentialSet, DeltaSender, StreamOutcome};
use crate::config::settings::Settings;
use crate::models::chat::ChatRequest;
use crate::models::openai::{build_openai_request, OpenAiErrorResponse, OpenAiRequest, OpenAiResponse};
use crate::services::classifier::{advised_retry_delay_ms, ClassifiedError, ErrorClass};
use crate::services::key_pool::{KeyPool, KeyPoolRegistry};
use crate::services::retry::RetryPolicy;
use crate::services::stream::{OpenAiLineParser, StreamDecoder};
use crate::utils::error::{AppError, AppResult};
use anyhow::Context;
use reqwest::Client;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio_stream::StreamExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// OpenAI-protocol adapter
pub struct OpenAiAdapter {
    client: Client,
    stream_client: Client,
    base_url: String,
    model: String,
    pool: Arc<Mutex<KeyPool>>,
    retry: RetryPolicy,
}

impl OpenAiAdapter {
    /// Create an adapter for one credential set.
    ///
    /// The key pool is fetched from the registry so failure state survives
    /// across requests from the same configuration.
    pub fn new(
        credentials: &CredentialSet,
        registry: &KeyPoolRegistry,
        settings: &Settings,
    ) -> AppResult<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(settings.request.timeout))
            .user_agent("aigateway/0.1.0")
            .build()
            .context("Failed to create HTTP client")?;

        let stream_client = Client::builder()
            .timeout(Duration::from_secs(settings.request.stream_timeout))
            .user_agent("aigateway/0.1.0")
            .build()
            .context("Failed to create streaming HTTP client")?;

        Ok(Self {
            client,
            stream_client,
            base_url: credentials.base_url.clone(),
            model: credentials.model.clone(),
            pool: registry.get(credentials.pool_id(), &credentials.api_keys),
            retry: settings.retry_policy(),
        })
    }

    /// Build the request URL
    fn build_url(&self) -> String {
        format!("{}/chat/completions", self.base_url.trim_end_matches('/'))
    }

    fn model_for(&self, request: &ChatRequest) -> String {
        request.model.clone().unwrap_or_else(|| self.model.clone())
    }

    /// Draw the next key; fails immediately when none are configured
    fn draw_key(&self) -> AppResult<String> {
        self.pool
            .lock()
            .expect("key pool poisoned")
            .next_key()
            .ok_or(AppError::NoCredentials)
    }

    fn mark_key_failed(&self, key: &str, reason: &str) {
        let mut pool = self.pool.lock().expect("key pool poisoned");
        pool.mark_failed(key, reason);
        debug!("Key pool after failure: {:?}", pool.stats());
    }

    /// Send a chat completion request (non-streaming)
    pub async fn chat(
        &self,
        request: &ChatRequest,
        cancel: &CancellationToken,
    ) -> AppResult<ChatOutcome> {
        let body = build_openai_request(request, &self.model_for(request));
        let mut budget = self.retry.max_retries;
        let mut backoff_attempt = 0u32;

        loop {
            let key = self.draw_key()?;
            match self.attempt_chat(&body, &key, cancel).await {
                Ok(text) => {
                    return Ok(ChatOutcome {
                        text,
                        used_search: false,
                    })
                }
                Err(err) => {
                    budget = self
                        .handle_failure(err, &key, budget, &mut backoff_attempt, cancel)
                        .await?;
                }
            }
        }
    }

    /// Send a chat completion request (streaming)
    pub async fn stream(
        &self,
        request: &ChatRequest,
        tx: DeltaSender,
        cancel: &CancellationToken,
    ) -> AppResult<StreamOutcome> {
        let mut body = build_openai_request(request, &self.model_for(request));
        body.stream = Some(true);
        let mut budget = self.retry.max_retries;
        let mut backoff_attempt = 0u32;

        loop {
            let key = self.draw_key()?;
            match self.attempt_stream(&body, &key, &tx, cancel).await {
                Ok(()) => return Ok(StreamOutcome::default()),
                Err(err) => {
                    budget = self
                        .handle_failure(err, &key, budget, &mut backoff_attempt, cancel)
                        .await?;
                }
            }
        }
    }

    /// Apply the failure policy for one attempt.
    ///
    /// Returns the remaining retry budget, or the final error once the
    /// budget is spent or the failure is terminal.
    async fn handle_failure(
        &self,
        err: AttemptError,
        key: &str,
        budget: u32,
        backoff_attempt: &mut u32,
        cancel: &CancellationToken,
    ) -> AppResult<u32> {
        let classified = match err {
            AttemptError::Classified(classified) => classified,
            other => return Err(other.into_app_error()),
        };

        match classified.class {
            ErrorClass::KeyInvalid | ErrorClass::RateLimited => {
                self.mark_key_failed(key, &classified.to_string());
                if budget == 0 {
                    return Err(AppError::Upstream(classified));
                }
                debug!("Rotating to next key after: {}", classified);
                Ok(budget - 1)
            }
            ErrorClass::Retryable => {
                if budget == 0 {
                    return Err(AppError::Upstream(classified));
                }
                let delay = advised_retry_delay_ms(&classified.message)
                    .map(Duration::from_millis)
                    .unwrap_or_else(|| self.retry.delay_for_attempt(*backoff_attempt));
                *backoff_attempt += 1;
                warn!(
                    "Transient upstream failure, retrying in {}ms: {}",
                    delay.as_millis(),
                    classified
                );
                tokio::select! {
                    _ = cancel.cancelled() => {
                        return Err(AttemptError::Cancelled.into_app_error());
                    }
                    _ = tokio::time::sleep(delay) => {}
                }
                Ok(budget - 1)
            }
            ErrorClass::Fatal => Err(AppError::Upstream(classified)),
        }
    }

    async fn attempt_chat(
        &self,
        body: &OpenAiRequest,
        key: &str,
        cancel: &CancellationToken,
    ) -> Result<String, AttemptError> {
        let send = self
            .client
            .post(self.build_url())
            .header("Authorization", format!("Bearer {}", key))
            .header("Content-Type", "application/json")
            .json(body)
            .send();

        let response = tokio::select! {
            _ = cancel.cancelled() => return Err(AttemptError::Cancelled),
            result = send => result.map_err(classify_transport_error)?,
        };

        let status = response.status();
        if !status.is_success() {
            return Err(read_error_response(response).await.into());
        }

        let parsed: OpenAiResponse = response
            .json()
            .await
            .map_err(|e| ClassifiedError::fatal(format!("Failed to parse response: {}", e)))?;

        debug!("Chat completion request succeeded");
        Ok(parsed.first_text())
    }

    async fn attempt_stream(
        &self,
        body: &OpenAiRequest,
        key: &str,
        tx: &DeltaSender,
        cancel: &CancellationToken,
    ) -> Result<(), AttemptError> {
        let send = self
            .stream_client
            .post(self.build_url())
            .header("Authorization", format!("Bearer {}", key))
            .header("Content-Type", "application/json")
            .header("Accept", "text/event-stream")
            .json(body)
            .send();

        let response = tokio::select! {
            _ = cancel.cancelled() => return Err(AttemptError::Cancelled),
            result = send => result.map_err(classify_transport_error)?,
        };

        let status = response.status();
        if !status.is_success() {
            return Err(read_error_response(response).await.into());
        }

        let mut decoder = StreamDecoder::new(OpenAiLineParser);
        let mut bytes = Box::pin(response.bytes_stream());

        loop {
            let chunk = tokio::select! {
                _ = cancel.cancelled() => return Err(AttemptError::Cancelled),
                chunk = bytes.next() => chunk,
            };
            match chunk {
                Some(Ok(chunk)) => {
                    for delta in decoder.feed(&chunk)? {
                        if tx.send(delta).await.is_err() {
                            debug!("Delta receiver dropped, stopping stream");
                            return Err(AttemptError::Cancelled);
                        }
                    }
                }
                Some(Err(e)) => return Err(classify_transport_error(e).into()),
                None => break,
            }
        }

        for delta in decoder.finish()? {
            if tx.send(delta).await.is_err() {
                return Err(AttemptError::Cancelled);
            }
        }

        debug!("Streaming request completed");
        Ok(())
    }
}

/// Classify a reqwest transport failure.
///
/// Connect and timeout failures carry no status; their message routes them
/// through the transient-failure list.
pub(crate) fn classify_transport_error(err: reqwest::Error) -> ClassifiedError {
    let status = err.status().map(|s| s.as_u16());
    ClassifiedError::new(status, format!("network error: {}", err))
}

/// Read an HTTP error body and classify it, preferring the structured
/// upstream error message when one is present
pub(crate) async fn read_error_response(response: reqwest::Response) -> ClassifiedError {
    let status = response.status().as_u16();
    let text = response.text().await.unwrap_or_default();
    let message = match serde_json::from_str::<OpenAiErrorResponse>(&text) {
        Ok(parsed) => parsed.error.message,
        Err(_) => text,
    };
    ClassifiedError::new(Some(status), message)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::settings::Settings;

    fn test_adapter(keys: &str) -> OpenAiAdapter {
        let registry = KeyPoolRegistry::new();
        let credentials = CredentialSet {
            id: Some("test".to_string()),
            api_keys: keys.to_string(),
            base_url: "https://api.example.com/v1/".to_string(),
            protocol: super::super::ProviderKind::Openai,
            model: "gpt-4o".to_string(),
        };
        OpenAiAdapter::new(&credentials, &registry, &test_settings()).unwrap()
    }

    fn test_settings() -> Settings {
        use crate::config::settings::*;
        Settings {
            server: ServerConfig {
                host: "localhost".to_string(),
                port: 8082,
            },
            free_tier: FreeTierConfig {
                system_api_key: "sk-system-test".to_string(),
                base_url: "https://api.example.com/v1".to_string(),
                conversation_model: "deepseek-ai/DeepSeek-V3.2".to_string(),
                analysis_model: "deepseek-ai/DeepSeek-V3.2".to_string(),
                image_model: "gemini-3-pro-image-preview".to_string(),
                image_base_url: "https://images.example.com/api".to_string(),
                weekly_limit: 200,
                image_limit: 10,
                admin_user_ids: vec![],
            },
            retry: RetryConfig {
                max_retries: 2,
                base_delay_ms: 1000,
                max_delay_ms: 10000,
            },
            request: RequestConfig {
                timeout: 30,
                stream_timeout: 300,
            },
            logging: LoggingConfig {
                level: "info".to_string(),
                format: "text".to_string(),
            },
        }
    }

    #[test]
    fn test_build_url_trims_trailing_slash() {
        let adapter = test_adapter("key-aaaa");
        assert_eq!(
            adapter.build_url(),
            "https://api.example.com/v1/chat/completions"
        );
    }

    #[test]
    fn test_draw_key_without_keys_fails() {
        let adapter = test_adapter("");
        assert!(matches!(adapter.draw_key(), Err(AppError::NoCredentials)));
    }

    #[test]
    fn test_request_model_overrides_credential_model() {
        let adapter = test_adapter("key-aaaa");
        let request = ChatRequest {
            messages: vec![],
            model: Some("gpt-4o-mini".to_string()),
            options: Default::default(),
        };
        assert_eq!(adapter.model_for(&request), "gpt-4o-mini");
    }
}
