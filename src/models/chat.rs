//! Provider-agnostic chat request model
//!
//! The gateway's single request shape. Adapters translate it into the
//! OpenAI or Gemini wire format; callers never speak a provider protocol
//! directly.

use serde::{Deserialize, Serialize};

/// A chat request, immutable once dispatched
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatRequest {
    /// Ordered message history
    pub messages: Vec<Message>,
    /// Target model override; falls back to the credential set's model
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    /// Generation options
    #[serde(flatten)]
    pub options: GenerationOptions,
}

/// One conversation turn
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    pub content: MessageContent,
}

/// Message author role
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

/// Message content: plain text or an ordered list of parts
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MessageContent {
    Text(String),
    Parts(Vec<ContentPart>),
}

/// One content part
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ContentPart {
    Text {
        text: String,
    },
    Image {
        /// MIME type, e.g. "image/png"
        media_type: String,
        /// Base64-encoded payload or a URL reference
        data: String,
    },
}

/// Generation options shared across providers
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GenerationOptions {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,
    #[serde(rename = "maxTokens", skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
    /// Opt-in web-search grounding (Gemini protocol only)
    #[serde(rename = "useSearch", default)]
    pub use_search: bool,
    /// Surface thought-flagged text when no visible answer text exists
    #[serde(rename = "thoughtFallback", default)]
    pub thought_fallback: bool,
    /// Thinking effort pass-through (Gemini protocol only)
    #[serde(rename = "thinkingLevel", skip_serializing_if = "Option::is_none")]
    pub thinking_level: Option<String>,
    /// Tool/function definitions, passed through in the provider's own
    /// schema
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tools: Option<serde_json::Value>,
    #[serde(rename = "toolChoice", skip_serializing_if = "Option::is_none")]
    pub tool_choice: Option<serde_json::Value>,
}

impl MessageContent {
    /// Flatten to plain text, ignoring image parts
    pub fn extract_text(&self) -> String {
        match self {
            MessageContent::Text(text) => text.clone(),
            MessageContent::Parts(parts) => parts
                .iter()
                .filter_map(|p| match p {
                    ContentPart::Text { text } => Some(text.as_str()),
                    _ => None,
                })
                .collect(),
        }
    }

    /// Whether any part carries an image
    pub fn has_images(&self) -> bool {
        match self {
            MessageContent::Text(_) => false,
            MessageContent::Parts(parts) => parts
                .iter()
                .any(|p| matches!(p, ContentPart::Image { .. })),
        }
    }
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::System => "system",
            Role::User => "user",
            Role::Assistant => "assistant",
        }
    }
}

/// Validate a chat request before dispatch
pub fn validate_chat_request(request: &ChatRequest) -> Result<(), String> {
    if request.messages.is_empty() {
        return Err("Message list cannot be empty".to_string());
    }

    for (i, message) in request.messages.iter().enumerate() {
        let text = message.content.extract_text();
        if text.is_empty() && !message.content.has_images() {
            return Err(format!("Message {} content cannot be empty", i));
        }
    }

    if let Some(temp) = request.options.temperature {
        if !(0.0..=2.0).contains(&temp) {
            return Err("temperature must be between 0.0 and 2.0".to_string());
        }
    }

    if request.options.max_tokens == Some(0) {
        return Err("maxTokens must be greater than 0".to_string());
    }

    Ok(())
}
