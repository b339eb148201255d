//! Gemini generateContent wire format
//!
//! Request structures for the Gemini-style protocol and the translation
//! from the provider-agnostic chat model. The protocol requires
//! consecutive same-role turns to be collapsed into one entry and routes
//! system text into a separate instruction field rather than `contents`.

use crate::models::chat::{ChatRequest, ContentPart, Message, MessageContent, Role};
use serde::{Deserialize, Serialize};

/// Allowed thinking levels; anything else is dropped to avoid upstream
/// 400 validation errors
const THINKING_LEVEL_ALLOWLIST: &[&str] = &["THINKING_LEVEL_UNSPECIFIED", "LOW", "HIGH"];

/// generateContent request body
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GeminiRequest {
    pub contents: Vec<GeminiContent>,
    #[serde(rename = "generationConfig")]
    pub generation_config: GenerationConfig,
    #[serde(rename = "systemInstruction", skip_serializing_if = "Option::is_none")]
    pub system_instruction: Option<GeminiSystemInstruction>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tools: Option<serde_json::Value>,
}

/// One entry in `contents`; consecutive same-role turns are merged
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GeminiContent {
    pub role: String,
    pub parts: Vec<GeminiPart>,
}

/// One content part
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum GeminiPart {
    Text {
        text: String,
    },
    InlineData {
        #[serde(rename = "inline_data")]
        inline_data: GeminiInlineData,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GeminiInlineData {
    pub mime_type: String,
    pub data: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GeminiSystemInstruction {
    pub parts: Vec<GeminiPart>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GenerationConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,
    #[serde(rename = "maxOutputTokens", skip_serializing_if = "Option::is_none")]
    pub max_output_tokens: Option<u32>,
    #[serde(rename = "thinkingConfig", skip_serializing_if = "Option::is_none")]
    pub thinking_config: Option<ThinkingConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ThinkingConfig {
    #[serde(rename = "thinkingLevel")]
    pub thinking_level: String,
}

/// Translate the provider-agnostic chat model into a generateContent body.
///
/// System-role messages are concatenated into `systemInstruction`;
/// assistant turns map to the protocol's "model" role; consecutive
/// same-role turns collapse into one entry.
pub fn build_gemini_request(request: &ChatRequest) -> GeminiRequest {
    let mut contents: Vec<GeminiContent> = Vec::new();
    let mut system_instruction = String::new();

    for message in &request.messages {
        if message.role == Role::System {
            let text = message.content.extract_text();
            if !text.is_empty() {
                system_instruction.push_str(&text);
                system_instruction.push('\n');
            }
            continue;
        }

        let role = match message.role {
            Role::Assistant => "model",
            _ => "user",
        };
        let parts = convert_parts(message);
        if parts.is_empty() {
            continue;
        }

        match contents.last_mut() {
            Some(last) if last.role == role => last.parts.extend(parts),
            _ => contents.push(GeminiContent {
                role: role.to_string(),
                parts,
            }),
        }
    }

    let tools = if request.options.tools.is_some() {
        request.options.tools.clone()
    } else if request.options.use_search {
        // Search tool is opt-in for stability under heavy concurrency
        Some(serde_json::json!([{ "google_search": {} }]))
    } else {
        None
    };

    GeminiRequest {
        contents,
        generation_config: GenerationConfig {
            temperature: Some(request.options.temperature.unwrap_or(1.0)),
            max_output_tokens: request.options.max_tokens,
            thinking_config: request
                .options
                .thinking_level
                .as_deref()
                .and_then(normalize_thinking_level)
                .map(|level| ThinkingConfig {
                    thinking_level: level,
                }),
        },
        system_instruction: if system_instruction.is_empty() {
            None
        } else {
            Some(GeminiSystemInstruction {
                parts: vec![GeminiPart::Text {
                    text: system_instruction.trim_end().to_string(),
                }],
            })
        },
        tools,
    }
}

fn convert_parts(message: &Message) -> Vec<GeminiPart> {
    match &message.content {
        MessageContent::Text(text) => {
            if text.is_empty() {
                Vec::new()
            } else {
                vec![GeminiPart::Text { text: text.clone() }]
            }
        }
        MessageContent::Parts(parts) => parts
            .iter()
            .filter_map(|part| match part {
                ContentPart::Text { text } => Some(GeminiPart::Text { text: text.clone() }),
                ContentPart::Image { media_type, data } => {
                    if data.is_empty() {
                        tracing::warn!("Skipping image part with missing data");
                        return None;
                    }
                    Some(GeminiPart::InlineData {
                        inline_data: GeminiInlineData {
                            mime_type: media_type.clone(),
                            data: data.clone(),
                        },
                    })
                }
            })
            .collect(),
    }
}

/// Normalize a thinking level against the allowlist; unknown values are
/// dropped rather than forwarded
pub fn normalize_thinking_level(level: &str) -> Option<String> {
    let normalized = level.trim().to_uppercase();
    THINKING_LEVEL_ALLOWLIST
        .contains(&normalized.as_str())
        .then_some(normalized)
}
