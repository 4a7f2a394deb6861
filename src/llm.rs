//! Model streaming abstraction
//!
//! A `ModelService` opens one long-lived `StreamSession` per conversation,
//! seeded with the prior history. Every turn of that conversation is sent on
//! the same session so the model keeps its context.

mod error;
pub mod gemini;
mod types;

pub use error::{LlmError, LlmErrorKind};
pub use gemini::{GeminiConfig, GeminiService};
pub use types::*;

use async_trait::async_trait;
use futures::stream::BoxStream;
use futures::StreamExt;
use std::sync::Arc;

/// Lazy, finite, non-restartable sequence of deltas for one turn
pub type DeltaStream = BoxStream<'static, Result<TextDelta, LlmError>>;

/// A conversation-scoped handle on the model
#[async_trait]
pub trait StreamSession: Send + Sync {
    /// Send one turn's payload and stream back the answer.
    ///
    /// The session records the exchange in its own context only after the
    /// returned stream drains successfully.
    async fn send_and_stream(&self, payload: &Payload) -> Result<DeltaStream, LlmError>;
}

/// Factory for stream sessions
pub trait ModelService: Send + Sync {
    /// Open a session whose context is the given prior history
    fn open_session(&self, history: &[HistoryMessage]) -> Arc<dyn StreamSession>;

    /// Get the model ID
    fn model_id(&self) -> &str;
}

/// Logging wrapper for model services
pub struct LoggingModel {
    inner: Arc<dyn ModelService>,
}

impl LoggingModel {
    pub fn new(inner: Arc<dyn ModelService>) -> Self {
        Self { inner }
    }
}

impl ModelService for LoggingModel {
    fn open_session(&self, history: &[HistoryMessage]) -> Arc<dyn StreamSession> {
        tracing::debug!(
            model = %self.inner.model_id(),
            history_len = history.len(),
            "Opening model stream session"
        );
        Arc::new(LoggingSession {
            inner: self.inner.open_session(history),
            model_id: self.inner.model_id().to_string(),
        })
    }

    fn model_id(&self) -> &str {
        self.inner.model_id()
    }
}

/// Logs stream open failures and per-turn completion statistics
struct LoggingSession {
    inner: Arc<dyn StreamSession>,
    model_id: String,
}

#[async_trait]
impl StreamSession for LoggingSession {
    async fn send_and_stream(&self, payload: &Payload) -> Result<DeltaStream, LlmError> {
        let start = std::time::Instant::now();
        let mut inner = match self.inner.send_and_stream(payload).await {
            Ok(stream) => stream,
            Err(e) => {
                tracing::error!(
                    model = %self.model_id,
                    duration_ms = %start.elapsed().as_millis(),
                    error = %e.message,
                    kind = ?e.kind,
                    "Model stream failed to open"
                );
                return Err(e);
            }
        };

        let model_id = self.model_id.clone();
        let with_inline = payload.has_inline();
        Ok(Box::pin(async_stream::stream! {
            let mut deltas = 0usize;
            let mut failed = false;
            while let Some(item) = inner.next().await {
                match &item {
                    Ok(_) => deltas += 1,
                    Err(e) => {
                        failed = true;
                        tracing::error!(
                            model = %model_id,
                            deltas,
                            error = %e.message,
                            kind = ?e.kind,
                            "Model stream failed mid-turn"
                        );
                    }
                }
                yield item;
                if failed {
                    break;
                }
            }
            if !failed {
                tracing::info!(
                    model = %model_id,
                    deltas,
                    with_inline,
                    duration_ms = %start.elapsed().as_millis(),
                    "Model stream completed"
                );
            }
        }))
    }
}
