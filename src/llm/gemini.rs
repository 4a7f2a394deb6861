//! Google Gemini streaming provider

use super::types::{HistoryMessage, Payload, PayloadPart, Role, TextDelta};
use super::{DeltaStream, LlmError, ModelService, StreamSession};
use async_trait::async_trait;
use futures::StreamExt;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex};
use std::time::Duration;

pub const DEFAULT_BASE_URL: &str = "https://generativelanguage.googleapis.com";
pub const DEFAULT_MODEL: &str = "gemini-1.5-flash";

/// Finish reasons that mean the answer was withheld
const BLOCKED_FINISH_REASONS: &[&str] = &[
    "SAFETY",
    "RECITATION",
    "BLOCKLIST",
    "PROHIBITED_CONTENT",
    "SPII",
    "OTHER",
];

/// Connection settings for the Gemini API
#[derive(Debug, Clone)]
pub struct GeminiConfig {
    pub api_key: String,
    pub model: String,
    pub base_url: String,
}

impl GeminiConfig {
    pub fn new(api_key: impl Into<String>) -> Self {
        Self {
            api_key: api_key.into(),
            model: DEFAULT_MODEL.to_string(),
            base_url: DEFAULT_BASE_URL.to_string(),
        }
    }
}

/// Gemini service implementation
pub struct GeminiService {
    client: Client,
    api_key: String,
    stream_url: String,
    model_id: String,
}

impl GeminiService {
    pub fn new(config: &GeminiConfig) -> Result<Self, LlmError> {
        // No overall timeout: a turn streams for as long as the model keeps producing.
        let client = Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .build()
            .map_err(|e| LlmError::unknown(format!("Failed to create HTTP client: {e}")))?;

        let stream_url = format!(
            "{}/v1beta/models/{}:streamGenerateContent?alt=sse",
            config.base_url.trim_end_matches('/'),
            config.model
        );

        Ok(Self {
            client,
            api_key: config.api_key.clone(),
            stream_url,
            model_id: config.model.clone(),
        })
    }
}

impl ModelService for GeminiService {
    fn open_session(&self, history: &[HistoryMessage]) -> Arc<dyn StreamSession> {
        let contents = history
            .iter()
            .filter(|m| !m.text().is_empty())
            .map(|m| GeminiContent {
                role: match m.role {
                    Role::User => "user".to_string(),
                    Role::Model => "model".to_string(),
                },
                parts: vec![GeminiPart::Text {
                    text: m.text().to_string(),
                }],
            })
            .collect();

        Arc::new(GeminiChatSession {
            client: self.client.clone(),
            api_key: self.api_key.clone(),
            stream_url: self.stream_url.clone(),
            history: Arc::new(Mutex::new(contents)),
        })
    }

    fn model_id(&self) -> &str {
        &self.model_id
    }
}

/// A Gemini chat that keeps its own accumulated context
pub struct GeminiChatSession {
    client: Client,
    api_key: String,
    stream_url: String,
    history: Arc<Mutex<Vec<GeminiContent>>>,
}

#[async_trait]
impl StreamSession for GeminiChatSession {
    async fn send_and_stream(&self, payload: &Payload) -> Result<DeltaStream, LlmError> {
        let user_content = GeminiContent::from_payload(payload);
        let mut contents = self
            .history
            .lock()
            .map_err(|_| LlmError::unknown("Session context poisoned"))?
            .clone();
        contents.push(user_content.clone());

        let response = self
            .client
            .post(&self.stream_url)
            .header("x-goog-api-key", &self.api_key)
            .json(&GeminiRequest { contents })
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response
                .text()
                .await
                .map_err(|e| LlmError::network(format!("Failed to read response: {e}")))?;
            let message = serde_json::from_str::<GeminiErrorResponse>(&body)
                .map_or(body, |r| r.error.message);
            return Err(LlmError::from_status(status.as_u16(), &message));
        }

        let history = Arc::clone(&self.history);
        let mut bytes = response.bytes_stream();

        Ok(Box::pin(async_stream::stream! {
            let mut lines = SseLineBuffer::default();
            let mut answer = String::new();
            let mut failure: Option<LlmError> = None;

            'read: while let Some(chunk) = bytes.next().await {
                let chunk = match chunk {
                    Ok(c) => c,
                    Err(e) => {
                        failure = Some(LlmError::from(e));
                        break;
                    }
                };
                lines.extend(&chunk);
                while let Some(line) = lines.next_line() {
                    match line.and_then(|l| parse_sse_line(&l)) {
                        Ok(Some(text)) => {
                            answer.push_str(&text);
                            yield Ok(TextDelta::new(text));
                        }
                        Ok(None) => {}
                        Err(e) => {
                            failure = Some(e);
                            break 'read;
                        }
                    }
                }
            }

            if failure.is_none() {
                if let Some(rest) = lines.finish() {
                    match rest.and_then(|l| parse_sse_line(&l)) {
                        Ok(Some(text)) => {
                            answer.push_str(&text);
                            yield Ok(TextDelta::new(text));
                        }
                        Ok(None) => {}
                        Err(e) => failure = Some(e),
                    }
                }
            }

            match failure {
                Some(e) => yield Err(e),
                None => {
                    if let Ok(mut h) = history.lock() {
                        h.push(user_content);
                        h.push(GeminiContent {
                            role: "model".to_string(),
                            parts: vec![GeminiPart::Text { text: answer }],
                        });
                    }
                }
            }
        }))
    }
}

/// Splits a byte stream into complete lines, decoding each as UTF-8 only once whole
#[derive(Debug, Default)]
struct SseLineBuffer {
    pending: Vec<u8>,
}

impl SseLineBuffer {
    fn extend(&mut self, bytes: &[u8]) {
        self.pending.extend_from_slice(bytes);
    }

    fn next_line(&mut self) -> Option<Result<String, LlmError>> {
        let end = self.pending.iter().position(|b| *b == b'\n')?;
        let mut line: Vec<u8> = self.pending.drain(..=end).collect();
        line.pop();
        Some(decode_line(line))
    }

    fn finish(&mut self) -> Option<Result<String, LlmError>> {
        if self.pending.iter().all(u8::is_ascii_whitespace) {
            return None;
        }
        Some(decode_line(std::mem::take(&mut self.pending)))
    }
}

fn decode_line(mut line: Vec<u8>) -> Result<String, LlmError> {
    if line.last() == Some(&b'\r') {
        line.pop();
    }
    String::from_utf8(line).map_err(|e| LlmError::malformed(format!("Invalid UTF-8 in stream: {e}")))
}

/// Parse one SSE line; only `data:` lines carry chunks
fn parse_sse_line(line: &str) -> Result<Option<String>, LlmError> {
    let Some(data) = line.strip_prefix("data:") else {
        return Ok(None);
    };
    parse_chunk(data.trim_start())
}

/// Extract the delta text from one streamed `GenerateContentResponse`
fn parse_chunk(data: &str) -> Result<Option<String>, LlmError> {
    let chunk: GeminiStreamChunk = serde_json::from_str(data)
        .map_err(|e| LlmError::malformed(format!("Failed to parse chunk: {e}")))?;

    if let Some(error) = chunk.error {
        return Err(LlmError::remote(format!("Model error: {}", error.message)));
    }

    if let Some(reason) = chunk.prompt_feedback.and_then(|f| f.block_reason) {
        return Err(LlmError::remote(format!("Prompt blocked ({reason})")));
    }

    let Some(candidate) = chunk.candidates.into_iter().next() else {
        return Ok(None);
    };

    let text: String = candidate
        .content
        .map(|c| {
            c.parts
                .into_iter()
                .filter(|p| !p.thought.unwrap_or(false))
                .filter_map(|p| p.text)
                .collect()
        })
        .unwrap_or_default();

    if text.is_empty() {
        if let Some(reason) = candidate.finish_reason.as_deref() {
            if BLOCKED_FINISH_REASONS.contains(&reason) {
                return Err(LlmError::remote(format!("Response blocked ({reason})")));
            }
        }
        return Ok(None);
    }

    Ok(Some(text))
}

// Gemini API types

#[derive(Debug, Serialize)]
struct GeminiRequest {
    contents: Vec<GeminiContent>,
}

#[derive(Debug, Clone, Serialize)]
struct GeminiContent {
    role: String,
    parts: Vec<GeminiPart>,
}

impl GeminiContent {
    fn from_payload(payload: &Payload) -> Self {
        let parts = payload
            .parts
            .iter()
            .map(|part| match part {
                PayloadPart::Inline(inline) => GeminiPart::InlineData {
                    inline_data: GeminiInlineData {
                        data: inline.data.clone(),
                        mime_type: inline.mime_type.clone(),
                    },
                },
                PayloadPart::Text { text } => GeminiPart::Text { text: text.clone() },
            })
            .collect();
        Self {
            role: "user".to_string(),
            parts,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(untagged)]
enum GeminiPart {
    Text {
        text: String,
    },
    InlineData {
        #[serde(rename = "inlineData")]
        inline_data: GeminiInlineData,
    },
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
struct GeminiInlineData {
    data: String,
    mime_type: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GeminiStreamChunk {
    #[serde(default)]
    candidates: Vec<GeminiCandidate>,
    prompt_feedback: Option<GeminiPromptFeedback>,
    error: Option<GeminiError>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GeminiCandidate {
    content: Option<GeminiResponseContent>,
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct GeminiResponseContent {
    #[serde(default)]
    parts: Vec<GeminiResponsePart>,
}

#[derive(Debug, Deserialize)]
struct GeminiResponsePart {
    text: Option<String>,
    thought: Option<bool>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GeminiPromptFeedback {
    block_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct GeminiErrorResponse {
    error: GeminiError,
}

#[derive(Debug, Deserialize)]
struct GeminiError {
    message: String,
}
