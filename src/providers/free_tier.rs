//! Free-tier ("system credits") provider adapter
//!
//! Serves users without their own API key using a fixed operator-held
//! credential. A thin pass-through over the OpenAI-protocol transport with
//! a server-fixed model; all quota logic lives in the request handlers,
//! not here. Also exposes the two-phase asynchronous image-generation
//! workflow (submit a job, then poll its status).

use super::{AttemptError, ChatOutcome, DeltaSender, StreamOutcome};
use crate::config::settings::{FreeTierConfig, Settings};
use crate::models::chat::ChatRequest;
use crate::models::openai::build_openai_request;
use crate::services::classifier::ClassifiedError;
use crate::services::stream::{OpenAiLineParser, StreamDecoder};
use crate::utils::error::{AppError, AppResult};
use anyhow::Context;
use axum::body::Bytes;
use futures::Stream;
use reqwest::Client;
use serde_json::Value;
use std::time::Duration;
use tokio_stream::StreamExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

/// Polling cadence for the image workflow
const IMAGE_POLL_INTERVAL: Duration = Duration::from_secs(2);
/// Attempt ceiling; 30 polls at 2s is a 60s budget
const IMAGE_POLL_MAX_ATTEMPTS: u32 = 30;

/// Which sub-model a free-tier call targets
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskType {
    /// Main chat, counted against the weekly quota
    Conversation,
    /// Helper tasks (titles, summaries), not counted
    Analysis,
}

impl Default for TaskType {
    fn default() -> Self {
        TaskType::Conversation
    }
}

/// Free-tier adapter
pub struct FreeTierAdapter {
    client: Client,
    stream_client: Client,
    config: FreeTierConfig,
}

impl FreeTierAdapter {
    /// Create the adapter from server settings. Fails with 503 semantics
    /// when the operator credential is missing.
    pub fn new(settings: &Settings) -> AppResult<Self> {
        if settings.free_tier.system_api_key.is_empty() {
            error!("SYSTEM_API_KEY not configured, free tier unavailable");
            return Err(AppError::ServiceUnavailable(
                "system credential not configured".to_string(),
            ));
        }

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
            config: settings.free_tier.clone(),
        })
    }

    /// Server-fixed model for a task type
    pub fn model_for(&self, task: TaskType) -> &str {
        match task {
            TaskType::Conversation => &self.config.conversation_model,
            TaskType::Analysis => &self.config.analysis_model,
        }
    }

    fn build_url(&self) -> String {
        format!(
            "{}/chat/completions",
            self.config.base_url.trim_end_matches('/')
        )
    }

    /// Send a chat completion and return the upstream JSON echo.
    ///
    /// The handler augments it with quota information before responding.
    pub async fn chat_json(&self, request: &ChatRequest, task: TaskType) -> AppResult<Value> {
        let body = build_openai_request(request, self.model_for(task));

        let response = self
            .client
            .post(self.build_url())
            .header(
                "Authorization",
                format!("Bearer {}", self.config.system_api_key),
            )
            .header("Content-Type", "application/json")
            .json(&body)
            .send()
            .await
            .map_err(super::openai::classify_transport_error)
            .map_err(AppError::Upstream)?;

        let status = response.status();
        if !status.is_success() {
            return Err(AppError::Upstream(
                super::openai::read_error_response(response).await,
            ));
        }

        let data: Value = response
            .json()
            .await
            .map_err(|e| AppError::Internal(format!("Failed to parse upstream response: {}", e)))?;
        debug!("Free-tier chat completed ({:?})", task);
        Ok(data)
    }

    /// Non-streaming chat reduced to a plain outcome (enum dispatch path)
    pub async fn chat_outcome(
        &self,
        request: &ChatRequest,
        task: TaskType,
    ) -> AppResult<ChatOutcome> {
        let data = self.chat_json(request, task).await?;
        let text = data
            .get("choices")
            .and_then(|c| c.get(0))
            .and_then(|c| c.get("message"))
            .and_then(|m| m.get("content"))
            .and_then(|t| t.as_str())
            .unwrap_or_default()
            .to_string();
        Ok(ChatOutcome {
            text,
            used_search: false,
        })
    }

    /// Open a streaming chat completion and return the raw SSE byte
    /// stream for pass-through relay.
    ///
    /// The upstream's own SSE lines are forwarded untouched; usage is
    /// accounted out-of-band by the caller.
    pub async fn stream_raw(
        &self,
        request: &ChatRequest,
        task: TaskType,
    ) -> AppResult<impl Stream<Item = reqwest::Result<Bytes>>> {
        let mut body = build_openai_request(request, self.model_for(task));
        body.stream = Some(true);

        let response = self
            .stream_client
            .post(self.build_url())
            .header(
                "Authorization",
                format!("Bearer {}", self.config.system_api_key),
            )
            .header("Content-Type", "application/json")
            .header("Accept", "text/event-stream")
            .json(&body)
            .send()
            .await
            .map_err(super::openai::classify_transport_error)
            .map_err(AppError::Upstream)?;

        let status = response.status();
        if !status.is_success() {
            return Err(AppError::Upstream(
                super::openai::read_error_response(response).await,
            ));
        }

        debug!("Free-tier stream opened ({:?})", task);
        Ok(response.bytes_stream())
    }

    /// Streaming chat decoded into deltas (enum dispatch path)
    pub async fn stream_deltas(
        &self,
        request: &ChatRequest,
        task: TaskType,
        tx: DeltaSender,
        cancel: &CancellationToken,
    ) -> AppResult<StreamOutcome> {
        let mut bytes = Box::pin(self.stream_raw(request, task).await?);
        let mut decoder = StreamDecoder::new(OpenAiLineParser);

        loop {
            let chunk = tokio::select! {
                _ = cancel.cancelled() => {
                    return Err(AttemptError::Cancelled.into_app_error());
                }
                chunk = bytes.next() => chunk,
            };
            match chunk {
                Some(Ok(chunk)) => {
                    let deltas = decoder
                        .feed(&chunk)
                        .map_err(|e| AttemptError::from(e).into_app_error())?;
                    for delta in deltas {
                        if tx.send(delta).await.is_err() {
                            return Err(AttemptError::Cancelled.into_app_error());
                        }
                    }
                }
                Some(Err(e)) => {
                    return Err(AppError::Upstream(super::openai::classify_transport_error(e)));
                }
                None => break,
            }
        }

        let trailing = decoder
            .finish()
            .map_err(|e| AttemptError::from(e).into_app_error())?;
        for delta in trailing {
            if tx.send(delta).await.is_err() {
                return Err(AttemptError::Cancelled.into_app_error());
            }
        }

        Ok(StreamOutcome::default())
    }

    /// Generate an image through the submit/poll workflow.
    ///
    /// Submits a job, then polls its status every 2 seconds for up to 30
    /// attempts. Returns the generated media URL on success; polling
    /// exhaustion surfaces a distinguished timeout error.
    pub async fn generate_image(&self, prompt: &str) -> AppResult<String> {
        let submit_url = format!("{}/requests", self.config.image_base_url.trim_end_matches('/'));
        let payload = serde_json::json!({
            "model": self.config.image_model,
            "payload": {
                "prompt": prompt,
                "image_size": "1K",
                "aspect_ratio": "16:9"
            }
        });

        info!("Submitting image generation request");
        let response = self
            .client
            .post(&submit_url)
            .header(
                "Authorization",
                format!("Bearer {}", self.config.system_api_key),
            )
            .header("Content-Type", "application/json")
            .json(&payload)
            .send()
            .await
            .map_err(super::openai::classify_transport_error)
            .map_err(AppError::Upstream)?;

        let status = response.status();
        if !status.is_success() {
            return Err(AppError::Upstream(
                super::openai::read_error_response(response).await,
            ));
        }

        let submit_data: Value = response
            .json()
            .await
            .map_err(|e| AppError::Internal(format!("Invalid submit response: {}", e)))?;
        let request_id = submit_data
            .get("request_id")
            .and_then(|id| id.as_str())
            .ok_or_else(|| {
                AppError::Upstream(ClassifiedError::fatal(
                    "image service did not return a request id",
                ))
            })?
            .to_string();

        debug!("Image request queued, id: {}", request_id);
        self.poll_image_status(&request_id).await
    }

    async fn poll_image_status(&self, request_id: &str) -> AppResult<String> {
        let poll_url = format!(
            "{}/requests/{}",
            self.config.image_base_url.trim_end_matches('/'),
            request_id
        );

        for attempt in 1..=IMAGE_POLL_MAX_ATTEMPTS {
            tokio::time::sleep(IMAGE_POLL_INTERVAL).await;

            let response = match self
                .client
                .get(&poll_url)
                .header(
                    "Authorization",
                    format!("Bearer {}", self.config.system_api_key),
                )
                .send()
                .await
            {
                Ok(response) => response,
                Err(e) => {
                    debug!("Poll attempt {} transport error: {}", attempt, e);
                    continue;
                }
            };

            if !response.status().is_success() {
                debug!("Poll attempt {} returned {}", attempt, response.status());
                continue;
            }

            let data: Value = match response.json().await {
                Ok(data) => data,
                Err(e) => {
                    debug!("Poll attempt {} returned invalid JSON: {}", attempt, e);
                    continue;
                }
            };

            match data.get("status").and_then(|s| s.as_str()) {
                Some("success") => {
                    let url = data
                        .get("outcome")
                        .and_then(|o| o.get("media_urls"))
                        .and_then(|m| m.get(0))
                        .and_then(|m| m.get("url"))
                        .and_then(|u| u.as_str());
                    return match url {
                        Some(url) => {
                            info!("Image generation succeeded");
                            Ok(url.to_string())
                        }
                        None => Err(AppError::Upstream(ClassifiedError::fatal(
                            "image generated but no URL found in response",
                        ))),
                    };
                }
                Some(terminal @ ("failed" | "cancelled")) => {
                    let message = data
                        .get("error")
                        .and_then(|e| e.as_str())
                        .unwrap_or("unknown error");
                    return Err(AppError::Upstream(ClassifiedError::fatal(format!(
                        "image generation {}: {}",
                        terminal, message
                    ))));
                }
                _ => {}
            }
        }

        Err(AppError::ImageTimeout(
            IMAGE_POLL_MAX_ATTEMPTS as u64 * IMAGE_POLL_INTERVAL.as_secs(),
        ))
    }
}
