//! Free-tier request handling and usage metering
//!
//! The state machine for an operator-funded call: verify the bearer token,
//! check remaining quota, dispatch, then update the usage ledger.
//! Conversational calls are metered weekly; analysis calls bypass the
//! check entirely; images are a separate quota dimension with their own
//! submit/poll workflow.

use crate::handlers::gateway::{Action, GatewayRequest};
use crate::handlers::AppState;
use crate::middleware::auth;
use crate::models::chat::{validate_chat_request, ChatRequest};
use crate::providers::{FreeTierAdapter, TaskType};
use crate::utils::error::AppError;
use axum::{
    body::Body,
    http::{header, HeaderMap},
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use std::sync::Arc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_stream::StreamExt;
use tracing::{debug, info, warn};

/// Free-tier quota check response
#[derive(Debug, Serialize)]
pub struct CheckResponse {
    #[serde(rename = "conversationCount")]
    pub conversation_count: u32,
    #[serde(rename = "weeklyLimit")]
    pub weekly_limit: u32,
    #[serde(rename = "bonusCredits")]
    pub bonus_credits: u32,
    pub remaining: u32,
    #[serde(rename = "imageCount")]
    pub image_count: u32,
    #[serde(rename = "imageLimit")]
    pub image_limit: u32,
    #[serde(rename = "imageRemaining")]
    pub image_remaining: u32,
    pub model: String,
    #[serde(rename = "isAdmin")]
    pub is_admin: bool,
}

/// Image generation response
#[derive(Debug, Serialize)]
pub struct ImageResponse {
    pub url: String,
    #[serde(rename = "imageCount")]
    pub image_count: u32,
    #[serde(rename = "imageRemaining")]
    pub image_remaining: u32,
}

/// Handle a free-tier request end to end
pub async fn handle_free_tier(
    state: Arc<AppState>,
    headers: HeaderMap,
    adapter: FreeTierAdapter,
    request: GatewayRequest,
) -> Result<Response, AppError> {
    // 1. Authenticate: bearer token claims are decoded and trusted
    let user_id = auth::authenticate(&headers).ok_or_else(|| {
        AppError::Authentication("sign in to use free-tier usage".to_string())
    })?;
    debug!("Free-tier request from user {}", user_id);

    // 2. Auxiliary actions
    match request.action {
        Some(Action::Check) => return check_response(&state, &adapter, &user_id).await,
        Some(Action::Image) => return image_flow(&state, &adapter, &user_id, &request).await,
        None => {}
    }

    // 3. Conversational or analysis chat
    let task = request.task_type.unwrap_or_default();
    let chat_request = request
        .request_body
        .ok_or_else(|| AppError::Validation("requestBody is required".to_string()))?;
    validate_chat_request(&chat_request).map_err(AppError::Validation)?;

    // Quota applies to conversations only; analysis helpers are free
    if task == TaskType::Conversation {
        let record = state
            .ledger
            .load(&user_id)
            .await
            .map_err(|e| AppError::Internal(format!("usage store error: {}", e)))?;
        if state.ledger.remaining_conversations(&record) == 0 {
            info!("User {} exhausted weekly conversation quota", user_id);
            return Err(AppError::QuotaExceeded {
                message: "Weekly free-tier limit reached. Configure your own API key to continue."
                    .to_string(),
            });
        }
    }

    if request.stream {
        stream_flow(state, adapter, user_id, chat_request, task).await
    } else {
        chat_flow(state, adapter, user_id, chat_request, task).await
    }
}

/// Quota check: current counters and limits, no upstream call
async fn check_response(
    state: &AppState,
    adapter: &FreeTierAdapter,
    user_id: &str,
) -> Result<Response, AppError> {
    let record = state
        .ledger
        .load(user_id)
        .await
        .map_err(|e| AppError::Internal(format!("usage store error: {}", e)))?;
    let limits = state.ledger.limits();

    Ok(Json(CheckResponse {
        conversation_count: record.conversation_count,
        weekly_limit: limits.weekly_conversations,
        bonus_credits: record.bonus_credits,
        remaining: state.ledger.remaining_conversations(&record),
        image_count: record.image_count,
        image_limit: limits.weekly_images,
        image_remaining: state.ledger.remaining_images(&record),
        model: adapter.model_for(TaskType::Conversation).to_string(),
        is_admin: state
            .settings
            .free_tier
            .admin_user_ids
            .iter()
            .any(|id| id == user_id),
    })
    .into_response())
}

/// Non-streaming chat: dispatch, bill, then echo the upstream completion
/// object augmented with the new count
async fn chat_flow(
    state: Arc<AppState>,
    adapter: FreeTierAdapter,
    user_id: String,
    chat_request: ChatRequest,
    task: TaskType,
) -> Result<Response, AppError> {
    let mut data = adapter.chat_json(&chat_request, task).await?;

    if task == TaskType::Conversation {
        match state.ledger.record_conversation(&user_id).await {
            Ok(record) => {
                data["_systemCredits"] = serde_json::json!({
                    "conversationCount": record.conversation_count,
                    "remaining": state.ledger.remaining_conversations(&record),
                });
            }
            Err(e) => {
                // Best-effort accounting: the response is not retracted
                warn!("Usage ledger update failed for {}: {}", user_id, e);
            }
        }
    }

    Ok(Json(data).into_response())
}

/// Streaming chat: bill optimistically before the first byte reaches the
/// caller, then relay the upstream's own SSE lines on a detached task.
///
/// A client that disconnects mid-stream is still billed; usage accounting
/// is out-of-band of the byte flow.
async fn stream_flow(
    state: Arc<AppState>,
    adapter: FreeTierAdapter,
    user_id: String,
    chat_request: ChatRequest,
    task: TaskType,
) -> Result<Response, AppError> {
    let upstream = adapter.stream_raw(&chat_request, task).await?;

    if task == TaskType::Conversation {
        if let Err(e) = state.ledger.record_conversation(&user_id).await {
            warn!("Usage ledger update failed for {}: {}", user_id, e);
        }
    }

    let (tx, rx) = tokio::sync::mpsc::channel::<Result<axum::body::Bytes, std::io::Error>>(64);
    tokio::spawn(async move {
        let mut upstream = Box::pin(upstream);
        while let Some(chunk) = upstream.next().await {
            match chunk {
                Ok(bytes) => {
                    if tx.send(Ok(bytes)).await.is_err() {
                        debug!("Client disconnected during free-tier stream");
                        return;
                    }
                }
                Err(e) => {
                    // Mid-stream failures simply stop the flow; the caller
                    // treats termination without a completion marker as an
                    // error
                    warn!("Free-tier upstream stream error: {}", e);
                    let _ = tx
                        .send(Err(std::io::Error::new(std::io::ErrorKind::Other, e)))
                        .await;
                    return;
                }
            }
        }
    });

    let body = Body::from_stream(ReceiverStream::new(rx));
    Response::builder()
        .header(header::CONTENT_TYPE, "text/event-stream")
        .header(header::CACHE_CONTROL, "no-cache")
        .body(body)
        .map_err(|e| AppError::Internal(format!("Failed to build stream response: {}", e)))
}

/// Image generation: separate quota dimension, submit/poll workflow,
/// quota consumed only on success
async fn image_flow(
    state: &AppState,
    adapter: &FreeTierAdapter,
    user_id: &str,
    request: &GatewayRequest,
) -> Result<Response, AppError> {
    let record = state
        .ledger
        .load(user_id)
        .await
        .map_err(|e| AppError::Internal(format!("usage store error: {}", e)))?;
    if state.ledger.remaining_images(&record) == 0 {
        info!("User {} exhausted weekly image quota", user_id);
        return Err(AppError::QuotaExceeded {
            message: "Weekly image generation limit reached.".to_string(),
        });
    }

    let prompt = request
        .prompt
        .as_deref()
        .filter(|p| !p.is_empty())
        .ok_or_else(|| AppError::Validation("prompt is required for image generation".to_string()))?;

    let url = adapter.generate_image(prompt).await?;

    let record = match state.ledger.record_image(user_id).await {
        Ok(record) => record,
        Err(e) => {
            warn!("Usage ledger update failed for {}: {}", user_id, e);
            record
        }
    };

    Ok(Json(ImageResponse {
        url,
        image_count: record.image_count,
        image_remaining: state.ledger.remaining_images(&record),
    })
    .into_response())
}
