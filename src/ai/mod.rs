// src/ai/mod.rs
// Provider-neutral request/response types and the error taxonomy shared by every backend
pub mod bridge;
pub mod claude;
pub mod credentials;
pub mod openai;
pub mod registry;
pub mod sse;

use crate::models::chat::MessageRole;
use crate::services::chat_store::StoreError;
use async_trait::async_trait;
use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderKind {
    Anthropic,
    OpenAi,
}

impl ProviderKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProviderKind::Anthropic => "anthropic",
            ProviderKind::OpenAi => "openai",
        }
    }

    pub fn display_name(&self) -> &'static str {
        match self {
            ProviderKind::Anthropic => "Anthropic",
            ProviderKind::OpenAi => "OpenAI",
        }
    }
}

impl fmt::Display for ProviderKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ProviderKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "anthropic" | "claude" => Ok(ProviderKind::Anthropic),
            "openai" | "gpt" => Ok(ProviderKind::OpenAi),
            other => Err(format!("unknown provider: {}", other)),
        }
    }
}

/// Image passed to a multimodal model. `data` is base64 without a data-URL prefix.
#[derive(Debug, Clone, PartialEq)]
pub struct ImageRef {
    pub media_type: String,
    pub data: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ChatTurn {
    pub role: MessageRole,
    pub content: String,
    pub images: Vec<ImageRef>,
}

impl ChatTurn {
    pub fn text(role: MessageRole, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
            images: Vec::new(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct CompletionRequest {
    pub model: String,
    pub system: Option<String>,
    pub messages: Vec<ChatTurn>,
    pub max_tokens: u32,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Completion {
    pub content: String,
    pub model: String,
    pub tokens_used: Option<u32>,
}

/// Text deltas in generation order.
pub type DeltaStream = BoxStream<'static, Result<String, AiError>>;

/// One AI backend. Implementations hold no per-user state; the key is supplied per call.
#[async_trait]
pub trait AiProvider: Send + Sync {
    fn kind(&self) -> ProviderKind;

    async fn complete(&self, api_key: &str, request: &CompletionRequest) -> Result<Completion, AiError>;

    /// Opens a streaming generation. Errors before the first byte are returned directly;
    /// later failures arrive as items of the stream.
    async fn stream(&self, api_key: &str, request: &CompletionRequest) -> Result<DeltaStream, AiError>;
}

#[derive(Error, Debug)]
pub enum AiError {
    #[error("no API key configured for provider {provider}")]
    MissingCredential { provider: ProviderKind },
    #[error("model {0} is not registered")]
    UnknownModel(String),
    #[error("provider rejected credentials ({status}): {message}")]
    Unauthorized { status: u16, message: String },
    #[error("provider rate limit ({status}): {message}")]
    RateLimited { status: u16, message: String },
    #[error("model not found ({status}): {message}")]
    ModelNotFound { status: u16, message: String },
    #[error("provider API error ({status}): {message}")]
    Api { status: u16, message: String },
    #[error("stream error: {0}")]
    Stream(String),
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("provider timed out after {0:?}")]
    Timeout(Duration),
    #[error("failed to parse provider response: {0}")]
    Parse(String),
    #[error("credential lookup failed: {0}")]
    Credentials(#[from] StoreError),
}

impl AiError {
    /// Maps a non-success provider response onto the taxonomy by status code.
    pub fn from_response(status: u16, body: String) -> Self {
        match status {
            401 | 403 => AiError::Unauthorized { status, message: body },
            429 => AiError::RateLimited { status, message: body },
            404 => AiError::ModelNotFound { status, message: body },
            _ => AiError::Api { status, message: body },
        }
    }

    pub fn category(&self) -> ErrorCategory {
        match self {
            AiError::MissingCredential { .. } => ErrorCategory::MissingCredential,
            AiError::Unauthorized { .. } => ErrorCategory::InvalidCredential,
            AiError::RateLimited { .. } => ErrorCategory::RateLimited,
            AiError::ModelNotFound { .. } | AiError::UnknownModel(_) => ErrorCategory::ModelUnavailable,
            AiError::Api { message, .. } | AiError::Stream(message) | AiError::Parse(message) => {
                ErrorCategory::from_text(message)
            }
            AiError::Http(e) => ErrorCategory::from_text(&e.to_string()),
            AiError::Timeout(_) | AiError::Credentials(_) => ErrorCategory::Unknown,
        }
    }

    /// Text stored and shown in place of the reply. Names the provider when its key is missing.
    pub fn user_message(&self) -> String {
        match self {
            AiError::MissingCredential { provider } => format!(
                "No API key is configured for {}. Please configure your API key in settings.",
                provider.display_name()
            ),
            other => other.category().user_message().to_string(),
        }
    }
}

/// User-facing classification of a generation failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    MissingCredential,
    InvalidCredential,
    RateLimited,
    ModelUnavailable,
    Unknown,
}

impl ErrorCategory {
    /// Provider error bodies do not always come with a telling status code, so the wording is checked too.
    pub fn from_text(text: &str) -> Self {
        let text = text.to_lowercase();
        if ["rate limit", "rate_limit", "too many requests", "quota"]
            .iter()
            .any(|p| text.contains(p))
        {
            return ErrorCategory::RateLimited;
        }
        if ["invalid api key", "incorrect api key", "invalid x-api-key", "authentication", "unauthorized"]
            .iter()
            .any(|p| text.contains(p))
        {
            return ErrorCategory::InvalidCredential;
        }
        if text.contains("model")
            && ["not found", "does not exist", "not_found", "unavailable"]
                .iter()
                .any(|p| text.contains(p))
        {
            return ErrorCategory::ModelUnavailable;
        }
        ErrorCategory::Unknown
    }

    pub fn user_message(&self) -> &'static str {
        match self {
            ErrorCategory::MissingCredential => {
                "No API key is configured for this model's provider. Please configure your API key in settings."
            }
            ErrorCategory::InvalidCredential => {
                "Your API key was rejected by the provider. Please check your API key in settings."
            }
            ErrorCategory::RateLimited => {
                "The AI provider is rate limiting requests right now. Please try again later."
            }
            ErrorCategory::ModelUnavailable => {
                "The selected model is not available. Please choose a different model."
            }
            ErrorCategory::Unknown => {
                "Sorry, something went wrong while generating a response. Please try again."
            }
        }
    }
}
