//! Common types for model stream interactions

use serde::{Deserialize, Serialize};

/// Who authored a history message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Model,
}

/// Text part of a persisted history message
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TextPart {
    #[serde(default)]
    pub text: String,
}

/// One message of persisted chat history, as stored by the chat backend
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistoryMessage {
    pub role: Role,
    #[serde(default)]
    pub parts: Vec<TextPart>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub img: Option<String>,
}

impl HistoryMessage {
    pub fn user(text: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            parts: vec![TextPart { text: text.into() }],
            img: None,
        }
    }

    pub fn model(text: impl Into<String>) -> Self {
        Self {
            role: Role::Model,
            parts: vec![TextPart { text: text.into() }],
            img: None,
        }
    }

    #[must_use]
    pub fn with_img(mut self, url: impl Into<String>) -> Self {
        self.img = Some(url.into());
        self
    }

    /// Text of the first part; the backend stores one text part per message
    pub fn text(&self) -> &str {
        self.parts.first().map_or("", |p| p.text.as_str())
    }
}

/// Base64 file data sent directly to the model
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InlinePayload {
    pub data: String,
    pub mime_type: String,
}

/// One part of a model request
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PayloadPart {
    Inline(InlinePayload),
    Text { text: String },
}

/// What one turn sends on the stream session: `[text]` or `[inline, text]`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Payload {
    pub parts: Vec<PayloadPart>,
}

impl Payload {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            parts: vec![PayloadPart::Text { text: text.into() }],
        }
    }

    pub fn with_inline(inline: InlinePayload, text: impl Into<String>) -> Self {
        Self {
            parts: vec![
                PayloadPart::Inline(inline),
                PayloadPart::Text { text: text.into() },
            ],
        }
    }

    /// The text portion of the payload
    pub fn text_content(&self) -> String {
        self.parts
            .iter()
            .filter_map(|p| match p {
                PayloadPart::Text { text } => Some(text.as_str()),
                PayloadPart::Inline(_) => None,
            })
            .collect()
    }

    pub fn has_inline(&self) -> bool {
        self.parts.iter().any(|p| matches!(p, PayloadPart::Inline(_)))
    }
}

/// One incremental chunk of generated text
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TextDelta {
    pub text: String,
}

impl TextDelta {
    pub fn new(text: impl Into<String>) -> Self {
        Self { text: text.into() }
    }
}
