//! Gateway chat entry point
//!
//! POST /v1/chat
//!
//! Selects a provider adapter from the caller's configuration (explicit
//! credentials pick their protocol; no credentials means the free tier),
//! then dispatches as a completed response or a live SSE stream.

use crate::handlers::{credits, AppState};
use crate::models::chat::{validate_chat_request, ChatRequest};
use crate::providers::{CredentialSet, ProviderAdapter, TaskType};
use crate::utils::error::AppError;
use axum::{
    extract::State,
    http::HeaderMap,
    response::sse::{Event, KeepAlive},
    response::{IntoResponse, Response, Sse},
    Json,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error};

/// Gateway request body
#[derive(Debug, Deserialize)]
pub struct GatewayRequest {
    /// Explicit provider configuration; absent means free tier
    #[serde(default)]
    pub credentials: Option<CredentialSet>,
    /// Provider-agnostic chat payload
    #[serde(rename = "requestBody", default)]
    pub request_body: Option<ChatRequest>,
    #[serde(default)]
    pub stream: bool,
    /// Free-tier sub-model selection
    #[serde(rename = "taskType", default)]
    pub task_type: Option<TaskType>,
    /// Free-tier auxiliary action
    #[serde(default)]
    pub action: Option<Action>,
    /// Prompt for the image action
    #[serde(default)]
    pub prompt: Option<String>,
}

/// Auxiliary free-tier actions
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Action {
    Check,
    Image,
}

/// Completed (non-streaming) chat response
#[derive(Debug, Serialize)]
pub struct ChatResponse {
    pub text: String,
    #[serde(rename = "usedSearch")]
    pub used_search: bool,
}

/// Handle gateway chat requests
pub async fn handle_chat(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(request): Json<GatewayRequest>,
) -> Result<Response, AppError> {
    debug!(
        "Gateway request: stream={}, credentials={}, action={:?}",
        request.stream,
        request.credentials.is_some(),
        request.action
    );

    let adapter = ProviderAdapter::select(
        request.credentials.as_ref(),
        &state.key_pools,
        &state.settings,
    )?;

    match adapter {
        ProviderAdapter::FreeTier(adapter) => {
            credits::handle_free_tier(state, headers, adapter, request).await
        }
        adapter => handle_credentialed(adapter, request).await,
    }
}

/// Credentialed flow: the caller brings their own provider configuration
/// and no quota applies
async fn handle_credentialed(
    adapter: ProviderAdapter,
    request: GatewayRequest,
) -> Result<Response, AppError> {
    let chat_request = request
        .request_body
        .ok_or_else(|| AppError::Validation("requestBody is required".to_string()))?;
    validate_chat_request(&chat_request).map_err(AppError::Validation)?;

    if request.stream {
        Ok(stream_response(adapter, chat_request))
    } else {
        let cancel = CancellationToken::new();
        let outcome = adapter.chat(&chat_request, &cancel).await?;
        Ok(Json(ChatResponse {
            text: outcome.text,
            used_search: outcome.used_search,
        })
        .into_response())
    }
}

/// Build the SSE response for a credentialed streaming request.
///
/// The adapter pushes deltas into a channel from a spawned task; each one
/// becomes an SSE data event. A client disconnect cancels the adapter so
/// an abandoned request releases its upstream connection and any pending
/// backoff sleep.
fn stream_response(adapter: ProviderAdapter, chat_request: ChatRequest) -> Response {
    let (delta_tx, mut delta_rx) = tokio::sync::mpsc::channel::<String>(100);
    let (event_tx, event_rx) = tokio::sync::mpsc::channel::<Result<Event, axum::Error>>(100);
    let cancel = CancellationToken::new();

    let driver_cancel = cancel.clone();
    let driver = tokio::spawn(async move {
        adapter
            .stream(&chat_request, delta_tx, &driver_cancel)
            .await
    });

    tokio::spawn(async move {
        while let Some(delta) = delta_rx.recv().await {
            let event = Event::default().data(delta);
            if event_tx.send(Ok(event)).await.is_err() {
                debug!("Client disconnected, cancelling upstream request");
                cancel.cancel();
                return;
            }
        }

        // Delta channel closed: the driver has finished
        match driver.await {
            Ok(Ok(outcome)) => {
                let done = serde_json::json!({ "usedSearch": outcome.used_search });
                let _ = event_tx
                    .send(Ok(Event::default().event("done").data(done.to_string())))
                    .await;
            }
            Ok(Err(e)) => {
                error!("Streaming request failed: {}", e);
                let body = serde_json::to_string(&e.to_body()).unwrap_or_default();
                let _ = event_tx
                    .send(Ok(Event::default().event("error").data(body)))
                    .await;
            }
            Err(e) => {
                error!("Stream driver task failed: {}", e);
            }
        }
    });

    let stream = ReceiverStream::new(event_rx);
    Sse::new(stream)
        .keep_alive(
            KeepAlive::new()
                .interval(Duration::from_secs(15))
                .text("keep-alive"),
        )
        .into_response()
}
