//! Upstream language-model providers behind the capability traits.
//!
//! Each provider is one implementation of [`EmbeddingModel`] and
//! [`CompletionModel`]; callers pick one by [`ProviderKind`] and never branch
//! on the provider again.

pub mod gemini;
pub mod openai;
mod sse;

pub use gemini::GeminiProvider;
pub use openai::OpenAiCompatibleProvider;
pub use sse::SseDecoder;

use crate::embeddings::CharacterNgramEmbedder;
use crate::error::{GatewayError, QaError};
use crate::traits::{CompletionModel, EmbeddingModel};
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderKind {
    ChatGpt,
    Mistral,
    Gemini,
}

impl ProviderKind {
    pub const ALL: [ProviderKind; 3] = [ProviderKind::ChatGpt, ProviderKind::Mistral, ProviderKind::Gemini];

    pub fn as_str(self) -> &'static str {
        match self {
            ProviderKind::ChatGpt => "chatgpt",
            ProviderKind::Mistral => "mistral",
            ProviderKind::Gemini => "gemini",
        }
    }

    pub fn api_key_var(self) -> &'static str {
        match self {
            ProviderKind::ChatGpt => "OPENAI_API_KEY",
            ProviderKind::Mistral => "MISTRAL_API_KEY",
            ProviderKind::Gemini => "GEMINI_API_KEY",
        }
    }

    pub fn default_settings(self) -> ProviderSettings {
        let (base_url, chat_model, embedding_model) = match self {
            ProviderKind::ChatGpt => (
                "https://api.openai.com/v1",
                "gpt-4o-mini",
                "text-embedding-3-small",
            ),
            ProviderKind::Mistral => (
                "https://api.mistral.ai/v1",
                "mistral-medium",
                "mistral-embed",
            ),
            ProviderKind::Gemini => (
                "https://generativelanguage.googleapis.com/v1beta",
                "gemini-2.0-flash",
                "text-embedding-004",
            ),
        };

        ProviderSettings {
            api_key: None,
            base_url: base_url.to_string(),
            chat_model: chat_model.to_string(),
            embedding_model: embedding_model.to_string(),
            timeout: Duration::from_secs(120),
        }
    }

    /// Default settings with the API key taken from the provider's variable.
    pub fn settings_from_env(self) -> ProviderSettings {
        let mut settings = self.default_settings();
        settings.api_key = std::env::var(self.api_key_var())
            .ok()
            .map(|key| key.trim().to_string())
            .filter(|key| !key.is_empty());
        settings
    }

    pub fn connect(self, settings: ProviderSettings) -> Result<ProviderHandle, GatewayError> {
        match self {
            ProviderKind::ChatGpt | ProviderKind::Mistral => {
                let provider = Arc::new(OpenAiCompatibleProvider::new(self.as_str(), settings)?);
                Ok(ProviderHandle::new(self, provider.clone(), provider))
            }
            ProviderKind::Gemini => {
                let provider = Arc::new(GeminiProvider::new(settings)?);
                Ok(ProviderHandle::new(self, provider.clone(), provider))
            }
        }
    }
}

impl fmt::Display for ProviderKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ProviderKind {
    type Err = QaError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "chatgpt" | "openai" => Ok(ProviderKind::ChatGpt),
            "mistral" => Ok(ProviderKind::Mistral),
            "gemini" => Ok(ProviderKind::Gemini),
            other => Err(QaError::UnknownProvider(other.to_string())),
        }
    }
}

#[derive(Clone, Serialize, Deserialize)]
pub struct ProviderSettings {
    pub api_key: Option<String>,
    pub base_url: String,
    pub chat_model: String,
    pub embedding_model: String,
    pub timeout: Duration,
}

impl fmt::Debug for ProviderSettings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProviderSettings")
            .field("api_key", &self.api_key.as_ref().map(|_| "<redacted>"))
            .field("base_url", &self.base_url)
            .field("chat_model", &self.chat_model)
            .field("embedding_model", &self.embedding_model)
            .field("timeout", &self.timeout)
            .finish()
    }
}

impl ProviderSettings {
    fn require_key(&self, provider: &str) -> Result<String, GatewayError> {
        self.api_key
            .clone()
            .ok_or_else(|| GatewayError::MissingCredentials(provider.to_string()))
    }

    fn http_client(&self) -> Result<reqwest::Client, GatewayError> {
        Ok(reqwest::Client::builder().timeout(self.timeout).build()?)
    }
}

/// Capabilities resolved for one provider selection.
#[derive(Clone)]
pub struct ProviderHandle {
    pub kind: ProviderKind,
    pub embeddings: Arc<dyn EmbeddingModel>,
    pub completion: Arc<dyn CompletionModel>,
}

impl ProviderHandle {
    pub fn new(
        kind: ProviderKind,
        embeddings: Arc<dyn EmbeddingModel>,
        completion: Arc<dyn CompletionModel>,
    ) -> Self {
        Self {
            kind,
            embeddings,
            completion,
        }
    }

    /// Swaps in the offline trigram embedder; completion stays upstream.
    pub fn with_local_embeddings(mut self, dimensions: usize) -> Self {
        self.embeddings = Arc::new(CharacterNgramEmbedder { dimensions });
        self
    }
}

pub(crate) fn status_error(provider: &str, status: StatusCode, body: String) -> GatewayError {
    if status == StatusCode::TOO_MANY_REQUESTS {
        GatewayError::RateLimited {
            provider: provider.to_string(),
            details: body,
        }
    } else {
        GatewayError::Upstream {
            provider: provider.to_string(),
            status: status.as_u16(),
            details: body,
        }
    }
}

pub(crate) async fn check_status(
    provider: &str,
    response: reqwest::Response,
) -> Result<reqwest::Response, GatewayError> {
    if response.status().is_success() {
        return Ok(response);
    }
    let status = response.status();
    let body = response
        .text()
        .await
        .unwrap_or_else(|_| "<body unavailable>".to_string());
    Err(status_error(provider, status, body))
}
