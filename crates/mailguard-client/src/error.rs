use mailguard_core::TokenError;
use reqwest::StatusCode;
use thiserror::Error;
use url::ParseError;

/// Errors produced while building the client or executing a Graph call.
///
/// Operations absorb these into the failure envelope; only the builder
/// returns them directly.
#[derive(Debug, Error)]
pub enum ClientError {
    #[error("token_provider is required")]
    MissingTokenProvider,
    #[error("invalid base_url: {0}")]
    InvalidBaseUrl(String),
    #[error("parameter `{0}` must be a non-empty string")]
    InvalidParameter(String),
    #[error("http request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("url error: {0}")]
    Url(#[from] ParseError),
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("token acquisition failed: {0}")]
    Token(#[from] TokenError),
    // StatusCode displays as "403 Forbidden", so the reason phrase and the
    // raw body both land in the rendered message.
    #[error("server responded with {status}: {body}")]
    HttpStatus { status: StatusCode, body: String },
}

impl ClientError {
    pub(crate) fn status(status: StatusCode, body: impl Into<String>) -> Self {
        Self::HttpStatus {
            status,
            body: body.into(),
        }
    }
}
