use async_trait::async_trait;
use thiserror::Error;

/// Errors surfaced while acquiring a bearer token for a tenant.
#[derive(Debug, Error)]
pub enum TokenError {
    #[error("token provider misconfigured: {0}")]
    Configuration(String),
    #[error("token request failed: {0}")]
    Transport(String),
    #[error("token endpoint returned {status}: {message}")]
    Rejected { status: u16, message: String },
    #[error("invalid token response: {0}")]
    InvalidResponse(String),
}

/// Source of bearer tokens scoped to the mailbox-settings API.
///
/// Tokens are requested per call; implementations decide whether to cache.
/// The required permission scope (mailbox-settings read/write) is enforced by
/// the remote API, not locally.
#[async_trait]
pub trait TokenProvider: Send + Sync {
    async fn bearer_token(&self, tenant_id: &str) -> Result<String, TokenError>;
}

/// Fixed-token provider for tests and dry runs.
pub struct StaticTokenProvider {
    token: String,
}

impl StaticTokenProvider {
    pub fn new(token: impl Into<String>) -> Self {
        Self {
            token: token.into(),
        }
    }
}

#[async_trait]
impl TokenProvider for StaticTokenProvider {
    async fn bearer_token(&self, _tenant_id: &str) -> Result<String, TokenError> {
        Ok(self.token.clone())
    }
}
