//! AI provider integrations
//!
//! Every backend is reduced to one capability: turn a list of chat messages
//! plus generation parameters into text. Errors are normalized so the LLM
//! client can decide what is worth retrying.

mod ollama;
mod openai_compat;

use std::time::Duration;

use async_trait::async_trait;
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::config::{Config, LlmSettings};
use crate::conversation::Message;

pub use ollama::OllamaProvider;
pub use openai_compat::{OpenAICompatConfig, OpenAICompatProvider};

#[derive(Debug, Error)]
pub enum ProviderError {
    #[error("Unknown provider: {0}")]
    UnknownProvider(String),

    #[error("Provider not configured: {0}")]
    NotConfigured(String),

    #[error("Provider rate limited the request")]
    RateLimited { retry_after: Option<Duration> },

    #[error("Transient provider failure: {0}")]
    Transient(String),

    #[error("Provider request timed out")]
    Timeout,

    #[error("Provider rejected the request: {0}")]
    Permanent(String),
}

impl ProviderError {
    /// Whether repeating the identical request could succeed
    pub fn is_transient(&self) -> bool {
        matches!(self, ProviderError::Transient(_) | ProviderError::RateLimited { .. })
    }

    /// Classify a non-success HTTP status
    pub fn from_status(status: StatusCode, detail: impl Into<String>, retry_after: Option<Duration>) -> Self {
        let detail = format!("HTTP {}: {}", status, detail.into());
        if status == StatusCode::TOO_MANY_REQUESTS {
            ProviderError::RateLimited { retry_after }
        } else if status == StatusCode::REQUEST_TIMEOUT {
            ProviderError::Timeout
        } else if status.is_server_error() {
            ProviderError::Transient(detail)
        } else {
            ProviderError::Permanent(detail)
        }
    }
}

impl From<reqwest::Error> for ProviderError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            ProviderError::Timeout
        } else if let Some(status) = err.status() {
            ProviderError::from_status(status, err.to_string(), None)
        } else if err.is_decode() || err.is_builder() {
            ProviderError::Permanent(err.to_string())
        } else {
            // connect failures, resets, truncated bodies
            ProviderError::Transient(err.to_string())
        }
    }
}

/// Read a `Retry-After` header expressed in seconds
pub(crate) fn retry_after(headers: &reqwest::header::HeaderMap) -> Option<Duration> {
    headers
        .get(reqwest::header::RETRY_AFTER)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse::<u64>().ok())
        .map(Duration::from_secs)
}

/// Parameters for one completion request
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GenerationParams {
    pub model: String,
    pub temperature: f32,
    pub max_tokens: u32,
}

impl GenerationParams {
    pub fn from_settings(settings: &LlmSettings) -> Self {
        Self {
            model: settings.model.clone(),
            temperature: settings.temperature,
            max_tokens: settings.max_tokens,
        }
    }
}

/// Token usage reported by the provider
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Usage {
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
}

impl Usage {
    pub fn total(&self) -> u64 {
        self.prompt_tokens as u64 + self.completion_tokens as u64
    }
}

/// A finished completion
#[derive(Debug, Clone, PartialEq)]
pub struct Completion {
    pub text: String,
    pub usage: Option<Usage>,
}

impl Completion {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            usage: None,
        }
    }
}

/// Text-completion capability consumed by the LLM client
#[async_trait]
pub trait CompletionProvider: Send + Sync {
    /// Short provider name, used in rate-limit keys and logs
    fn name(&self) -> &str;

    async fn complete(
        &self,
        messages: &[Message],
        params: &GenerationParams,
    ) -> Result<Completion, ProviderError>;
}

/// Providers selectable from configuration
pub enum Provider {
    Ollama(OllamaProvider),
    OpenAICompat(OpenAICompatProvider),
}

impl Provider {
    /// Build the configured provider; called once at startup
    pub fn from_settings(settings: &LlmSettings, config: &Config) -> Result<Self, ProviderError> {
        let timeout = Duration::from_secs(settings.timeout_secs);
        match settings.provider.to_lowercase().as_str() {
            "ollama" => {
                let url = settings
                    .base_url
                    .clone()
                    .or_else(|| config.ollama_url.clone())
                    .unwrap_or_else(|| "http://localhost:11434".into());
                Ok(Provider::Ollama(OllamaProvider::new(url, timeout)?))
            }
            "openai" => {
                let key = config
                    .api_key_for(settings, "OPENAI_API_KEY")
                    .ok_or_else(|| ProviderError::NotConfigured("OPENAI_API_KEY is not set".into()))?;
                let mut compat = OpenAICompatConfig::openai(key);
                if let Some(url) = &settings.base_url {
                    compat.base_url = url.clone();
                }
                compat.organization = settings.organization.clone();
                compat.timeout = timeout;
                Ok(Provider::OpenAICompat(OpenAICompatProvider::new("openai", compat)?))
            }
            "groq" => {
                let key = config
                    .api_key_for(settings, "GROQ_API_KEY")
                    .ok_or_else(|| ProviderError::NotConfigured("GROQ_API_KEY is not set".into()))?;
                let mut compat = OpenAICompatConfig::groq(key);
                compat.timeout = timeout;
                Ok(Provider::OpenAICompat(OpenAICompatProvider::new("groq", compat)?))
            }
            "local" | "openai_compat" => {
                let url = settings.base_url.clone().ok_or_else(|| {
                    ProviderError::NotConfigured("local provider requires llm.base_url".into())
                })?;
                let mut compat = OpenAICompatConfig::local(url);
                compat.api_key = config.api_key_for(settings, "LLM_API_KEY");
                compat.timeout = timeout;
                Ok(Provider::OpenAICompat(OpenAICompatProvider::new("local", compat)?))
            }
            other => Err(ProviderError::UnknownProvider(other.to_string())),
        }
    }
}

#[async_trait]
impl CompletionProvider for Provider {
    fn name(&self) -> &str {
        match self {
            Provider::Ollama(p) => p.name(),
            Provider::OpenAICompat(p) => p.name(),
        }
    }

    async fn complete(
        &self,
        messages: &[Message],
        params: &GenerationParams,
    ) -> Result<Completion, ProviderError> {
        match self {
            Provider::Ollama(p) => p.complete(messages, params).await,
            Provider::OpenAICompat(p) => p.complete(messages, params).await,
        }
    }
}
