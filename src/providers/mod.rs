//! Provider module
//!
//! Defines the provider adapters and the closed dispatch over them.
//! Exactly three variants exist; adding a provider means adding a variant
//! and one dispatch arm at the request entry point.

pub mod free_tier;
pub mod gemini;
pub mod openai;

use crate::config::settings::Settings;
use crate::models::chat::ChatRequest;
use crate::services::classifier::ClassifiedError;
use crate::services::key_pool::KeyPoolRegistry;
use crate::utils::error::{AppError, AppResult};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

pub use free_tier::{FreeTierAdapter, TaskType};
pub use gemini::GeminiAdapter;
pub use openai::OpenAiAdapter;

/// Provider protocol tag
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ProviderKind {
    Openai,
    Gemini,
    FreeTier,
}

/// One logical provider configuration supplied by the caller
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CredentialSet {
    /// Configuration id; key-pool state is cached under it across requests
    #[serde(default)]
    pub id: Option<String>,
    /// Comma-delimited list of one or more secret keys
    #[serde(rename = "apiKey")]
    pub api_keys: String,
    #[serde(rename = "baseUrl")]
    pub base_url: String,
    pub protocol: ProviderKind,
    pub model: String,
}

impl CredentialSet {
    /// Id used for key-pool caching
    pub fn pool_id(&self) -> &str {
        self.id.as_deref().unwrap_or("default")
    }
}

/// Result of a completed (non-streaming) chat call
#[derive(Debug, Clone)]
pub struct ChatOutcome {
    pub text: String,
    /// Whether the response used external web-search grounding
    pub used_search: bool,
}

/// Result of a completed stream
#[derive(Debug, Clone, Default)]
pub struct StreamOutcome {
    pub used_search: bool,
}

/// Channel the adapters emit stream deltas into
pub type DeltaSender = tokio::sync::mpsc::Sender<String>;

/// Failure of a single upstream attempt, inspected by the retry loops.
///
/// Explicit values rather than unwinding: the retry driver looks at the
/// classification to decide between rotating keys, backing off, or giving
/// up.
#[derive(Debug)]
pub(crate) enum AttemptError {
    /// Classified transport or protocol failure
    Classified(ClassifiedError),
    /// Stream completed without visible output (terminal, never retried)
    EmptyStream,
    /// The caller abandoned the request
    Cancelled,
}

impl AttemptError {
    pub(crate) fn into_app_error(self) -> AppError {
        match self {
            AttemptError::Classified(err) => AppError::Upstream(err),
            AttemptError::EmptyStream => AppError::EmptyVisibleStream,
            AttemptError::Cancelled => AppError::Internal("request cancelled".to_string()),
        }
    }
}

impl From<ClassifiedError> for AttemptError {
    fn from(err: ClassifiedError) -> Self {
        AttemptError::Classified(err)
    }
}

/// Map a stream decode failure onto an attempt failure
impl From<crate::services::stream::DecodeError> for AttemptError {
    fn from(err: crate::services::stream::DecodeError) -> Self {
        use crate::services::stream::DecodeError;
        match err {
            DecodeError::RetryableStream(e) | DecodeError::Upstream(e) => {
                AttemptError::Classified(e)
            }
            DecodeError::EmptyVisibleStream => AttemptError::EmptyStream,
        }
    }
}

/// The closed set of provider adapters
pub enum ProviderAdapter {
    OpenAi(OpenAiAdapter),
    Gemini(GeminiAdapter),
    FreeTier(FreeTierAdapter),
}

impl ProviderAdapter {
    /// Select the adapter for a request: explicit credentials pick their
    /// protocol's adapter, no credentials means the free tier.
    ///
    /// Selection happens exactly once per request.
    pub fn select(
        credentials: Option<&CredentialSet>,
        registry: &KeyPoolRegistry,
        settings: &Settings,
    ) -> AppResult<Self> {
        match credentials {
            Some(creds) => match creds.protocol {
                ProviderKind::Openai => Ok(ProviderAdapter::OpenAi(OpenAiAdapter::new(
                    creds, registry, settings,
                )?)),
                ProviderKind::Gemini => {
                    Ok(ProviderAdapter::Gemini(GeminiAdapter::new(creds, settings)?))
                }
                ProviderKind::FreeTier => {
                    Ok(ProviderAdapter::FreeTier(FreeTierAdapter::new(settings)?))
                }
            },
            None => Ok(ProviderAdapter::FreeTier(FreeTierAdapter::new(settings)?)),
        }
    }

    /// Non-streaming chat completion
    pub async fn chat(
        &self,
        request: &ChatRequest,
        cancel: &CancellationToken,
    ) -> AppResult<ChatOutcome> {
        match self {
            ProviderAdapter::OpenAi(adapter) => adapter.chat(request, cancel).await,
            ProviderAdapter::Gemini(adapter) => adapter.chat(request, cancel).await,
            ProviderAdapter::FreeTier(adapter) => {
                adapter.chat_outcome(request, TaskType::Conversation).await
            }
        }
    }

    /// Streaming chat completion; deltas are pushed into `tx` in arrival
    /// order
    pub async fn stream(
        &self,
        request: &ChatRequest,
        tx: DeltaSender,
        cancel: &CancellationToken,
    ) -> AppResult<StreamOutcome> {
        match self {
            ProviderAdapter::OpenAi(adapter) => adapter.stream(request, tx, cancel).await,
            ProviderAdapter::Gemini(adapter) => adapter.stream(request, tx, cancel).await,
            ProviderAdapter::FreeTier(adapter) => {
                adapter
                    .stream_deltas(request, TaskType::Conversation, tx, cancel)
                    .await
            }
        }
    }
}
