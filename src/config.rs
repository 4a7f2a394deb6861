//! Client configuration from the environment

use crate::attachment::host::DEFAULT_UPLOAD_URL;
use crate::attachment::{AttachmentHost, ImageKitHost, UnconfiguredHost};
use crate::llm::gemini::{DEFAULT_BASE_URL, DEFAULT_MODEL};
use crate::llm::GeminiConfig;
use std::sync::Arc;
use thiserror::Error;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Missing required setting {0}")]
    Missing(&'static str),
    #[error("Invalid value for {name}: {message}")]
    Invalid { name: &'static str, message: String },
}

/// Image host settings; uploads are disabled unless both the signing
/// endpoint and the public key are set
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageKitConfig {
    pub url_endpoint: Option<String>,
    pub public_key: Option<String>,
    pub upload_url: String,
    pub auth_url: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientConfig {
    pub api_url: Option<String>,
    pub session_cookie: Option<String>,
    pub gemini_api_key: Option<String>,
    pub gemini_model: String,
    pub gemini_base_url: String,
    pub image_kit: ImageKitConfig,
}

impl ClientConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from an arbitrary key lookup; blank values count as unset
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        Self {
            api_url: get("CHAT_API_URL").or_else(|| get("VITE_API_URL")),
            session_cookie: get("CHAT_SESSION_COOKIE"),
            gemini_api_key: get("GEMINI_API_KEY"),
            gemini_model: get("GEMINI_MODEL").unwrap_or_else(|| DEFAULT_MODEL.to_string()),
            gemini_base_url: get("GEMINI_BASE_URL").unwrap_or_else(|| DEFAULT_BASE_URL.to_string()),
            image_kit: ImageKitConfig {
                url_endpoint: get("IMAGE_KIT_ENDPOINT"),
                public_key: get("IMAGE_KIT_PUBLIC_KEY"),
                upload_url: get("IMAGE_KIT_UPLOAD_URL")
                    .unwrap_or_else(|| DEFAULT_UPLOAD_URL.to_string()),
                auth_url: get("UPLOAD_AUTH_URL"),
            },
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let api_url = self
            .api_url
            .as_deref()
            .ok_or(ConfigError::Missing("CHAT_API_URL"))?;
        require_http("CHAT_API_URL", api_url)?;
        if self.gemini_api_key.is_none() {
            return Err(ConfigError::Missing("GEMINI_API_KEY"));
        }
        require_http("GEMINI_BASE_URL", &self.gemini_base_url)?;
        require_http("IMAGE_KIT_UPLOAD_URL", &self.image_kit.upload_url)?;
        if let Some(auth_url) = &self.image_kit.auth_url {
            require_http("UPLOAD_AUTH_URL", auth_url)?;
        }
        Ok(())
    }

    pub fn gemini(&self) -> Result<GeminiConfig, ConfigError> {
        let api_key = self
            .gemini_api_key
            .clone()
            .ok_or(ConfigError::Missing("GEMINI_API_KEY"))?;
        Ok(GeminiConfig {
            api_key,
            model: self.gemini_model.clone(),
            base_url: self.gemini_base_url.clone(),
        })
    }

    /// The configured content host, or one that rejects every upload
    pub fn attachment_host(&self) -> Result<Arc<dyn AttachmentHost>, ConfigError> {
        match (&self.image_kit.auth_url, &self.image_kit.public_key) {
            (Some(auth_url), Some(public_key)) => {
                let host = ImageKitHost::new(
                    auth_url.clone(),
                    self.image_kit.upload_url.clone(),
                    public_key.clone(),
                )
                .map_err(|e| ConfigError::Invalid {
                    name: "UPLOAD_AUTH_URL",
                    message: e.to_string(),
                })?;
                Ok(Arc::new(host))
            }
            _ => {
                tracing::warn!("Attachment uploads disabled. Set UPLOAD_AUTH_URL and IMAGE_KIT_PUBLIC_KEY.");
                Ok(Arc::new(UnconfiguredHost))
            }
        }
    }
}

fn require_http(name: &'static str, value: &str) -> Result<(), ConfigError> {
    if value.starts_with("http://") || value.starts_with("https://") {
        Ok(())
    } else {
        Err(ConfigError::Invalid {
            name,
            message: format!("expected an http(s) URL, got {value:?}"),
        })
    }
}
