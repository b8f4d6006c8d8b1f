use std::{
    collections::HashMap,
    sync::Mutex,
    time::{Duration, Instant},
};

use async_trait::async_trait;
use mailguard_core::{TokenError, TokenProvider};
use reqwest::Client as HttpClient;
use serde_json::Value;
use tracing::debug;
use url::Url;

const DEFAULT_AUTHORITY: &str = "https://login.microsoftonline.com/";
const GRAPH_DEFAULT_SCOPE: &str = "https://graph.microsoft.com/.default";

// Refresh slightly early so a token never expires mid-request.
const EXPIRY_MARGIN: Duration = Duration::from_secs(30);

/// [`TokenProvider`] backed by the OAuth 2.0 client-credentials grant against
/// Microsoft Entra. Tokens are cached per tenant until shortly before expiry.
#[derive(Debug)]
pub struct ClientCredentialsProvider {
    http: HttpClient,
    authority: Url,
    client_id: String,
    client_secret: String,
    scope: String,
    cache: Mutex<HashMap<String, CachedToken>>,
}

#[derive(Debug)]
struct CachedToken {
    value: String,
    expires_at: Instant,
}

impl ClientCredentialsProvider {
    pub fn new(
        client_id: impl Into<String>,
        client_secret: impl Into<String>,
    ) -> Result<Self, TokenError> {
        let client_id = client_id.into();
        let client_secret = client_secret.into();
        if client_id.is_empty() || client_secret.is_empty() {
            return Err(TokenError::Configuration(
                "missing client credentials".to_owned(),
            ));
        }
        let http = HttpClient::builder()
            .timeout(Duration::from_secs(20))
            .build()
            .map_err(|err| TokenError::Configuration(err.to_string()))?;
        let authority = Url::parse(DEFAULT_AUTHORITY).expect("static authority url parses");
        Ok(Self {
            http,
            authority,
            client_id,
            client_secret,
            scope: GRAPH_DEFAULT_SCOPE.to_owned(),
            cache: Mutex::new(HashMap::new()),
        })
    }

    /// Override the token authority host (e.g. a stub server in tests).
    pub fn with_authority(mut self, authority: impl AsRef<str>) -> Result<Self, TokenError> {
        let mut parsed = Url::parse(authority.as_ref())
            .map_err(|err| TokenError::Configuration(format!("invalid authority: {err}")))?;
        if !parsed.path().ends_with('/') {
            let path = format!("{}/", parsed.path());
            parsed.set_path(&path);
        }
        self.authority = parsed;
        Ok(self)
    }

    fn cached(&self, tenant_id: &str) -> Option<String> {
        let cache = self.cache.lock().expect("token cache lock");
        cache.get(tenant_id).and_then(|token| {
            if token.expires_at > Instant::now() + EXPIRY_MARGIN {
                Some(token.value.clone())
            } else {
                None
            }
        })
    }

    async fn request_token(&self, tenant_id: &str) -> Result<CachedToken, TokenError> {
        let url = self
            .authority
            .join(&format!("{tenant_id}/oauth2/v2.0/token"))
            .map_err(|err| TokenError::Configuration(format!("invalid token url: {err}")))?;
        let form = [
            ("grant_type", "client_credentials"),
            ("client_id", self.client_id.as_str()),
            ("client_secret", self.client_secret.as_str()),
            ("scope", self.scope.as_str()),
        ];

        let response = self
            .http
            .post(url)
            .form(&form)
            .send()
            .await
            .map_err(|err| TokenError::Transport(err.to_string()))?;
        let status = response.status();
        if !status.is_success() {
            let message = response.text().await.unwrap_or_default();
            return Err(TokenError::Rejected {
                status: status.as_u16(),
                message,
            });
        }

        let payload: Value = response
            .json()
            .await
            .map_err(|err| TokenError::InvalidResponse(err.to_string()))?;
        let access_token = payload
            .get("access_token")
            .and_then(Value::as_str)
            .ok_or_else(|| {
                TokenError::InvalidResponse("token response missing access_token".to_owned())
            })?
            .to_owned();
        let expires_in = payload
            .get("expires_in")
            .and_then(Value::as_u64)
            .unwrap_or(3600);
        debug!(
            target: "mailguard.token",
            tenant = %tenant_id,
            expires_in,
            "acquired client-credentials token"
        );
        Ok(CachedToken {
            value: access_token,
            expires_at: Instant::now() + Duration::from_secs(expires_in),
        })
    }
}

#[async_trait]
impl TokenProvider for ClientCredentialsProvider {
    async fn bearer_token(&self, tenant_id: &str) -> Result<String, TokenError> {
        if tenant_id.trim().is_empty() {
            return Err(TokenError::Configuration(
                "tenant id must not be empty".to_owned(),
            ));
        }
        if let Some(token) = self.cached(tenant_id) {
            return Ok(token);
        }
        let token = self.request_token(tenant_id).await?;
        let value = token.value.clone();
        self.cache
            .lock()
            .expect("token cache lock")
            .insert(tenant_id.to_owned(), token);
        Ok(value)
    }
}
