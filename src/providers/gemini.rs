//! Gemini-protocol provider adapter
//!
//! Translates the chat model into generateContent requests and decodes the
//! protocol's cumulative-text streaming format. Runs on a single (non-
//! pooled) credential with the same retry policy as the OpenAI-protocol
//! adapter, and surfaces whether the response used web-search grounding.

use super::{AttemptError, ChatOutcome, CredentialSet, DeltaSender, StreamOutcome};
use crate::config::settings::Settings;
use crate::models::chat::ChatRequest;
use crate::models::gemini::{build_gemini_request, GeminiRequest};
use crate::services::classifier::{advised_retry_delay_ms, ClassifiedError, ErrorClass};
use crate::services::retry::RetryPolicy;
use crate::services::stream::{
    candidate_used_search, extract_candidate_text, GeminiLineParser, StreamDecoder,
};
use crate::utils::error::{AppError, AppResult};
use anyhow::Context;
use reqwest::Client;
use serde_json::Value;
use std::time::Duration;
use tokio_stream::StreamExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Gemini-protocol adapter
pub struct GeminiAdapter {
    client: Client,
    stream_client: Client,
    base_url: String,
    model: String,
    api_key: String,
    retry: RetryPolicy,
}

impl GeminiAdapter {
    /// Create an adapter for one credential set. Only the first key of the
    /// configured list is used; this protocol is not pooled.
    pub fn new(credentials: &CredentialSet, settings: &Settings) -> AppResult<Self> {
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

        let api_key = credentials
            .api_keys
            .split(',')
            .map(str::trim)
            .find(|k| !k.is_empty())
            .unwrap_or_default()
            .to_string();

        Ok(Self {
            client,
            stream_client,
            base_url: credentials.base_url.clone(),
            model: credentials.model.clone(),
            api_key,
            retry: settings.retry_policy(),
        })
    }

    /// Model name with any router prefix stripped
    fn clean_model(&self, request: &ChatRequest) -> String {
        request
            .model
            .clone()
            .unwrap_or_else(|| self.model.clone())
            .replace("google/", "")
    }

    /// Build the request URL for one endpoint.
    ///
    /// Google-hosted endpoints authenticate via `?key=` query parameter,
    /// everything else via bearer header.
    fn build_url(&self, model: &str, stream: bool) -> String {
        let base = self.base_url.trim_end_matches('/');
        let endpoint = if stream {
            ":streamGenerateContent?alt=sse"
        } else {
            ":generateContent"
        };
        let mut url = format!("{}/models/{}{}", base, model, endpoint);
        if self.uses_query_auth() {
            let sep = if url.contains('?') { '&' } else { '?' };
            url.push(sep);
            url.push_str("key=");
            url.push_str(&self.api_key);
        }
        url
    }

    fn uses_query_auth(&self) -> bool {
        self.base_url.contains("googleapis.com")
    }

    fn apply_auth(&self, builder: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        if self.uses_query_auth() {
            builder
        } else {
            builder.header("Authorization", format!("Bearer {}", self.api_key))
        }
    }

    /// Send a generateContent request (non-streaming)
    pub async fn chat(
        &self,
        request: &ChatRequest,
        cancel: &CancellationToken,
    ) -> AppResult<ChatOutcome> {
        if self.api_key.is_empty() {
            return Err(AppError::NoCredentials);
        }

        let model = self.clean_model(request);
        let body = build_gemini_request(request);
        let thought_fallback = request.options.thought_fallback;
        let mut budget = self.retry.max_retries;
        let mut backoff_attempt = 0u32;

        loop {
            match self
                .attempt_chat(&model, &body, thought_fallback, cancel)
                .await
            {
                Ok(outcome) => return Ok(outcome),
                Err(err) => {
                    budget = self
                        .handle_failure(err, budget, &mut backoff_attempt, cancel)
                        .await?;
                }
            }
        }
    }

    /// Send a streamGenerateContent request, emitting suffix deltas
    pub async fn stream(
        &self,
        request: &ChatRequest,
        tx: DeltaSender,
        cancel: &CancellationToken,
    ) -> AppResult<StreamOutcome> {
        if self.api_key.is_empty() {
            return Err(AppError::NoCredentials);
        }

        let model = self.clean_model(request);
        let body = build_gemini_request(request);
        let thought_fallback = request.options.thought_fallback;
        let mut budget = self.retry.max_retries;
        let mut backoff_attempt = 0u32;

        loop {
            match self
                .attempt_stream(&model, &body, thought_fallback, &tx, cancel)
                .await
            {
                Ok(outcome) => return Ok(outcome),
                Err(err) => {
                    budget = self
                        .handle_failure(err, budget, &mut backoff_attempt, cancel)
                        .await?;
                }
            }
        }
    }

    /// Failure policy for a single credential: transient failures back
    /// off and retry, everything else is terminal.
    async fn handle_failure(
        &self,
        err: AttemptError,
        budget: u32,
        backoff_attempt: &mut u32,
        cancel: &CancellationToken,
    ) -> AppResult<u32> {
        let classified = match err {
            AttemptError::Classified(classified) => classified,
            other => return Err(other.into_app_error()),
        };

        match classified.class {
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
            _ => Err(AppError::Upstream(classified)),
        }
    }

    async fn attempt_chat(
        &self,
        model: &str,
        body: &GeminiRequest,
        thought_fallback: bool,
        cancel: &CancellationToken,
    ) -> Result<ChatOutcome, AttemptError> {
        let send = self
            .apply_auth(self.client.post(self.build_url(model, false)))
            .header("Content-Type", "application/json")
            .json(body)
            .send();

        let response = tokio::select! {
            _ = cancel.cancelled() => return Err(AttemptError::Cancelled),
            result = send => result.map_err(super::openai::classify_transport_error)?,
        };

        let status = response.status();
        if !status.is_success() {
            return Err(read_gemini_error(response).await.into());
        }

        let data: Value = response
            .json()
            .await
            .map_err(|e| ClassifiedError::fatal(format!("Failed to parse response: {}", e)))?;

        // Some upstreams report errors inside a 200 body
        if let Some(error) = data.get("error") {
            let message = error
                .get("message")
                .and_then(|m| m.as_str())
                .map(str::to_string)
                .unwrap_or_else(|| error.to_string());
            let code = error.get("code").and_then(|c| c.as_u64()).map(|c| c as u16);
            return Err(ClassifiedError::new(code, message).into());
        }

        let candidate = data.get("candidates").and_then(|c| c.get(0));
        let used_search = candidate_used_search(candidate);
        let text = extract_candidate_text(candidate, thought_fallback);

        debug!("generateContent request succeeded (used_search: {})", used_search);
        Ok(ChatOutcome { text, used_search })
    }

    async fn attempt_stream(
        &self,
        model: &str,
        body: &GeminiRequest,
        thought_fallback: bool,
        tx: &DeltaSender,
        cancel: &CancellationToken,
    ) -> Result<StreamOutcome, AttemptError> {
        let send = self
            .apply_auth(self.stream_client.post(self.build_url(model, true)))
            .header("Content-Type", "application/json")
            .header("Accept", "text/event-stream, application/json")
            .json(body)
            .send();

        let response = tokio::select! {
            _ = cancel.cancelled() => return Err(AttemptError::Cancelled),
            result = send => result.map_err(super::openai::classify_transport_error)?,
        };

        let status = response.status();
        if !status.is_success() {
            return Err(read_gemini_error(response).await.into());
        }

        let mut decoder = StreamDecoder::new(GeminiLineParser::new(thought_fallback));
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
                Some(Err(e)) => {
                    return Err(super::openai::classify_transport_error(e).into());
                }
                None => break,
            }
        }

        let trailing = decoder.finish()?;
        for delta in trailing {
            if tx.send(delta).await.is_err() {
                return Err(AttemptError::Cancelled);
            }
        }

        let used_search = decoder.parser().used_search();
        debug!("Streaming request completed (used_search: {})", used_search);
        Ok(StreamOutcome { used_search })
    }
}

/// Read an HTTP error body in the Gemini error envelope
async fn read_gemini_error(response: reqwest::Response) -> ClassifiedError {
    let status = response.status().as_u16();
    let text = response.text().await.unwrap_or_default();
    let message = serde_json::from_str::<Value>(&text)
        .ok()
        .and_then(|v| {
            v.get("error")
                .and_then(|e| e.get("message"))
                .and_then(|m| m.as_str())
                .map(str::to_string)
        })
        .unwrap_or(text);
    ClassifiedError::new(Some(status), message)
}
