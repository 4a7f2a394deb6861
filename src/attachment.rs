//! Attachment staging
//!
//! One user file pick produces two independent results: an inline base64
//! payload for the model and a persisted descriptor from the content host.
//! Both run concurrently; the attachment is resolved only once both have
//! finished, and readiness is always read from the explicit state tag.

pub mod host;

pub use host::{AttachmentHost, ImageKitHost, UnconfiguredHost};

use crate::llm::InlinePayload;
use base64::Engine as _;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::watch;

/// Attachment failures; all terminal for the attempt that produced them
#[derive(Debug, Clone, Error, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", content = "detail", rename_all = "snake_case")]
pub enum AttachmentError {
    #[error("An attachment is already uploading")]
    AlreadyStaging,
    #[error("Failed to read {path}: {message}")]
    Read { path: String, message: String },
    #[error("Failed to encode attachment: {0}")]
    Encode(String),
    #[error("Upload authentication failed: {0}")]
    Auth(String),
    #[error("Upload failed: {0}")]
    Upload(String),
}

/// A local file captured for attachment
#[derive(Debug, Clone)]
pub struct StagedFile {
    pub file_name: String,
    pub mime_type: String,
    pub bytes: Vec<u8>,
}

impl StagedFile {
    pub fn new(file_name: impl Into<String>, mime_type: impl Into<String>, bytes: Vec<u8>) -> Self {
        Self {
            file_name: file_name.into(),
            mime_type: mime_type.into(),
            bytes,
        }
    }

    /// Read a file from disk, guessing its MIME type from the extension
    pub async fn from_path(path: &Path) -> Result<Self, AttachmentError> {
        let bytes = tokio::fs::read(path).await.map_err(|e| AttachmentError::Read {
            path: path.display().to_string(),
            message: e.to_string(),
        })?;
        let file_name = path
            .file_name()
            .map_or_else(|| "upload".to_string(), |n| n.to_string_lossy().into_owned());
        let mime_type = mime_guess::from_path(path)
            .first_or_octet_stream()
            .essence_str()
            .to_string();
        Ok(Self::new(file_name, mime_type, bytes))
    }

    fn encode_inline(&self) -> InlinePayload {
        InlinePayload {
            data: base64::engine::general_purpose::STANDARD.encode(&self.bytes),
            mime_type: self.mime_type.clone(),
        }
    }
}

/// Durable location returned by the content host
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PersistedDescriptor {
    pub url: String,
    pub id: String,
}

/// Attachment state, tagged explicitly so readiness is never inferred from field contents
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Default)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum AttachmentState {
    #[default]
    Idle,
    /// Encoding and upload in flight; either result may already be present
    Staging {
        attempt: u64,
        file_name: String,
        inline: Option<InlinePayload>,
        descriptor: Option<PersistedDescriptor>,
    },
    Ready {
        attempt: u64,
        file_name: String,
        inline: InlinePayload,
        descriptor: PersistedDescriptor,
    },
    Failed {
        attempt: u64,
        file_name: String,
        error: AttachmentError,
    },
}

impl AttachmentState {
    pub fn upload_pending(&self) -> bool {
        matches!(self, AttachmentState::Staging { .. })
    }

    pub fn attempt(&self) -> Option<u64> {
        match self {
            AttachmentState::Idle => None,
            AttachmentState::Staging { attempt, .. }
            | AttachmentState::Ready { attempt, .. }
            | AttachmentState::Failed { attempt, .. } => Some(*attempt),
        }
    }

    pub fn last_error(&self) -> Option<&AttachmentError> {
        match self {
            AttachmentState::Failed { error, .. } => Some(error),
            _ => None,
        }
    }

    pub fn inline_payload(&self) -> Option<&InlinePayload> {
        match self {
            AttachmentState::Staging { inline, .. } => inline.as_ref(),
            AttachmentState::Ready { inline, .. } => Some(inline),
            AttachmentState::Idle | AttachmentState::Failed { .. } => None,
        }
    }

    pub fn persisted_descriptor(&self) -> Option<&PersistedDescriptor> {
        match self {
            AttachmentState::Staging { descriptor, .. } => descriptor.as_ref(),
            AttachmentState::Ready { descriptor, .. } => Some(descriptor),
            AttachmentState::Idle | AttachmentState::Failed { .. } => None,
        }
    }
}

/// Stages at most one attachment at a time
#[derive(Clone)]
pub struct AttachmentStager {
    inner: Arc<StagerInner>,
}

struct StagerInner {
    host: Arc<dyn AttachmentHost>,
    state: watch::Sender<AttachmentState>,
    next_attempt: AtomicU64,
}

impl AttachmentStager {
    pub fn new(host: Arc<dyn AttachmentHost>) -> Self {
        let (state, _) = watch::channel(AttachmentState::Idle);
        Self {
            inner: Arc::new(StagerInner {
                host,
                state,
                next_attempt: AtomicU64::new(1),
            }),
        }
    }

    /// Current attachment state
    pub fn state(&self) -> AttachmentState {
        self.inner.state.borrow().clone()
    }

    pub fn upload_pending(&self) -> bool {
        self.inner.state.borrow().upload_pending()
    }

    /// Watch attachment state changes (for rendering)
    pub fn subscribe(&self) -> watch::Receiver<AttachmentState> {
        self.inner.state.subscribe()
    }

    /// Start encoding and uploading `file`; returns the attempt id.
    ///
    /// Must be called within a tokio runtime.
    pub fn stage_file(&self, file: StagedFile) -> Result<u64, AttachmentError> {
        let attempt = self.begin(&file.file_name)?;
        tracing::info!(
            attempt,
            file = %file.file_name,
            mime_type = %file.mime_type,
            bytes = file.bytes.len(),
            "Staging attachment"
        );

        let inner = Arc::clone(&self.inner);
        let file = Arc::new(file);
        tokio::spawn(async move {
            let encode = {
                let file = Arc::clone(&file);
                let inner = Arc::clone(&inner);
                async move {
                    let inline = tokio::task::spawn_blocking(move || file.encode_inline())
                        .await
                        .map_err(|e| AttachmentError::Encode(e.to_string()))?;
                    inner.record_inline(attempt, &inline);
                    Ok::<_, AttachmentError>(inline)
                }
            };
            let upload = async {
                let descriptor = inner.host.upload(&file).await?;
                inner.record_descriptor(attempt, &descriptor);
                Ok::<_, AttachmentError>(descriptor)
            };

            let (inline, descriptor) = tokio::join!(encode, upload);
            inner.resolve(attempt, &file.file_name, inline, descriptor);
        });

        Ok(attempt)
    }

    /// Read `path` and stage it; a read error fails the attempt
    pub async fn stage_path(&self, path: &Path) -> Result<u64, AttachmentError> {
        if self.upload_pending() {
            return Err(AttachmentError::AlreadyStaging);
        }
        match StagedFile::from_path(path).await {
            Ok(file) => self.stage_file(file),
            Err(error) => {
                let file_name = path.display().to_string();
                let attempt = self.begin(&file_name)?;
                tracing::warn!(attempt, error = %error, "Attachment read failed");
                self.inner.resolve(attempt, &file_name, Err(error.clone()), Err(error.clone()));
                Err(error)
            }
        }
    }

    /// Clear all attachment state; late results of the cleared attempt are dropped
    pub fn reset(&self) {
        let changed = self.inner.state.send_if_modified(|s| {
            if matches!(s, AttachmentState::Idle) {
                false
            } else {
                *s = AttachmentState::Idle;
                true
            }
        });
        if changed {
            tracing::debug!("Attachment state reset");
        }
    }

    /// Reset only if `attempt` is still the current attempt
    pub fn release(&self, attempt: u64) -> bool {
        self.inner.state.send_if_modified(|s| {
            if s.attempt() == Some(attempt) {
                *s = AttachmentState::Idle;
                true
            } else {
                false
            }
        })
    }

    /// Suspend until the current attachment (if any) is no longer uploading
    pub async fn wait_resolved(&self) -> AttachmentState {
        let mut rx = self.inner.state.subscribe();
        // The sender lives as long as `self`, so the channel cannot close here.
        let resolved = rx.wait_for(|s| !s.upload_pending()).await.map(|s| s.clone());
        resolved.unwrap_or_default()
    }

    fn begin(&self, file_name: &str) -> Result<u64, AttachmentError> {
        let attempt = self.inner.next_attempt.fetch_add(1, Ordering::SeqCst);
        let accepted = self.inner.state.send_if_modified(|s| {
            if s.upload_pending() {
                false
            } else {
                *s = AttachmentState::Staging {
                    attempt,
                    file_name: file_name.to_string(),
                    inline: None,
                    descriptor: None,
                };
                true
            }
        });
        if accepted {
            Ok(attempt)
        } else {
            Err(AttachmentError::AlreadyStaging)
        }
    }
}

impl StagerInner {
    fn record_inline(&self, attempt: u64, payload: &InlinePayload) {
        self.state.send_if_modified(|s| match s {
            AttachmentState::Staging {
                attempt: current,
                inline,
                ..
            } if *current == attempt => {
                *inline = Some(payload.clone());
                true
            }
            _ => false,
        });
    }

    fn record_descriptor(&self, attempt: u64, uploaded: &PersistedDescriptor) {
        self.state.send_if_modified(|s| match s {
            AttachmentState::Staging {
                attempt: current,
                descriptor,
                ..
            } if *current == attempt => {
                *descriptor = Some(uploaded.clone());
                true
            }
            _ => false,
        });
    }

    fn resolve(
        &self,
        attempt: u64,
        file_name: &str,
        inline: Result<InlinePayload, AttachmentError>,
        descriptor: Result<PersistedDescriptor, AttachmentError>,
    ) {
        let resolved = match (inline, descriptor) {
            (Ok(inline), Ok(descriptor)) => AttachmentState::Ready {
                attempt,
                file_name: file_name.to_string(),
                inline,
                descriptor,
            },
            // Upload failure takes precedence over an encode failure
            (_, Err(error)) | (Err(error), Ok(_)) => AttachmentState::Failed {
                attempt,
                file_name: file_name.to_string(),
                error,
            },
        };

        let applied = self.state.send_if_modified(|s| {
            if s.upload_pending() && s.attempt() == Some(attempt) {
                *s = resolved.clone();
                true
            } else {
                false
            }
        });

        match (&resolved, applied) {
            (_, false) => {
                tracing::debug!(attempt, "Discarding result of superseded attachment attempt");
            }
            (AttachmentState::Failed { error, .. }, true) => {
                tracing::warn!(attempt, error = %error, "Attachment failed");
            }
            (_, true) => {
                tracing::info!(attempt, "Attachment ready");
            }
        }
    }
}
