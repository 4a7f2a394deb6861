//! Content host adapters for attachment uploads

use super::{AttachmentError, PersistedDescriptor, StagedFile};
use async_trait::async_trait;
use reqwest::multipart::{Form, Part};
use reqwest::Client;
use serde::Deserialize;
use std::fmt;
use std::time::Duration;

pub const DEFAULT_UPLOAD_URL: &str = "https://upload.imagekit.io/api/v1/files/upload";

/// External host that stores the raw attachment and returns a durable URL
#[async_trait]
pub trait AttachmentHost: Send + Sync {
    async fn upload(&self, file: &StagedFile) -> Result<PersistedDescriptor, AttachmentError>;
}

/// Server-signed uploads: a backend endpoint signs, the client uploads directly
pub struct ImageKitHost {
    client: Client,
    auth_endpoint: String,
    upload_url: String,
    public_key: String,
}

impl ImageKitHost {
    pub fn new(
        auth_endpoint: impl Into<String>,
        upload_url: impl Into<String>,
        public_key: impl Into<String>,
    ) -> Result<Self, AttachmentError> {
        let client = Client::builder()
            .timeout(Duration::from_secs(120))
            .build()
            .map_err(|e| AttachmentError::Upload(format!("Failed to create HTTP client: {e}")))?;
        Ok(Self {
            client,
            auth_endpoint: auth_endpoint.into(),
            upload_url: upload_url.into(),
            public_key: public_key.into(),
        })
    }

    async fn authenticate(&self) -> Result<UploadToken, AttachmentError> {
        let response = self
            .client
            .post(&self.auth_endpoint)
            .json(&serde_json::json!({}))
            .send()
            .await
            .map_err(|e| AttachmentError::Auth(format!("Authentication request failed: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(AttachmentError::Auth(format!(
                "Request failed: {}: {body}",
                status.as_u16()
            )));
        }

        response
            .json::<UploadToken>()
            .await
            .map_err(|e| AttachmentError::Auth(format!("Invalid signing response: {e}")))
    }
}

#[async_trait]
impl AttachmentHost for ImageKitHost {
    async fn upload(&self, file: &StagedFile) -> Result<PersistedDescriptor, AttachmentError> {
        let token = self.authenticate().await?;

        let part = Part::bytes(file.bytes.clone())
            .file_name(file.file_name.clone())
            .mime_str(&file.mime_type)
            .map_err(|e| AttachmentError::Upload(format!("Invalid MIME type: {e}")))?;
        let form = Form::new()
            .part("file", part)
            .text("fileName", file.file_name.clone())
            .text("useUniqueFileName", "true")
            .text("publicKey", self.public_key.clone())
            .text("signature", token.signature)
            .text("expire", token.expire.to_string())
            .text("token", token.token);

        let response = self
            .client
            .post(&self.upload_url)
            .multipart(form)
            .send()
            .await
            .map_err(|e| AttachmentError::Upload(format!("Upload request failed: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            let message = serde_json::from_str::<HostErrorResponse>(&body)
                .map_or(body, |r| r.message);
            return Err(AttachmentError::Upload(format!(
                "HTTP {}: {message}",
                status.as_u16()
            )));
        }

        let uploaded: UploadResponse = response
            .json()
            .await
            .map_err(|e| AttachmentError::Upload(format!("Invalid upload response: {e}")))?;

        tracing::info!(file_id = %uploaded.file_id, url = %uploaded.url, "Attachment uploaded");
        Ok(PersistedDescriptor {
            url: uploaded.url,
            id: uploaded.file_id,
        })
    }
}

/// Host used when no upload endpoint is configured; every upload fails
pub struct UnconfiguredHost;

#[async_trait]
impl AttachmentHost for UnconfiguredHost {
    async fn upload(&self, _file: &StagedFile) -> Result<PersistedDescriptor, AttachmentError> {
        Err(AttachmentError::Upload(
            "No attachment host configured".to_string(),
        ))
    }
}

#[derive(Debug, Deserialize)]
struct UploadToken {
    signature: String,
    expire: Expire,
    token: String,
}

/// Signing backends disagree on whether `expire` is a number or a string
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum Expire {
    Number(i64),
    Text(String),
}

impl fmt::Display for Expire {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Expire::Number(n) => write!(f, "{n}"),
            Expire::Text(s) => f.write_str(s),
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct UploadResponse {
    file_id: String,
    url: String,
}

#[derive(Debug, Deserialize)]
struct HostErrorResponse {
    message: String,
}
