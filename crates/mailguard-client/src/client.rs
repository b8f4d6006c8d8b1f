use std::{collections::BTreeMap, sync::Arc, time::Duration};

use mailguard_core::{
    missing_params, OperationTimer, RequestEnvelope, ResponseEnvelope, TokenProvider,
};
use reqwest::{header, Client as HttpClient, RequestBuilder, Response};
use serde_json::{json, Value};
use time::{format_description::well_known::Rfc3339, OffsetDateTime};
use tracing::{info, warn};
use url::Url;

use crate::ClientError;

const GRAPH_BASE_URL: &str = "https://graph.microsoft.com/beta/";

const PARAM_USER_ID: &str = "userId";
const PARAM_FORWARDING_ADDRESS: &str = "forwardingAddress";

/// Client for the Microsoft Graph mailbox-settings remediation operations.
///
/// Cheap to clone; the underlying HTTP transport is shared and safe for
/// concurrent calls. The bearer token is applied per request, so in-flight
/// operations for different tenants cannot observe each other's credentials.
#[derive(Clone)]
pub struct RemediationClient {
    http: HttpClient,
    base_url: Url,
    tokens: Arc<dyn TokenProvider>,
}

/// Builder for [`RemediationClient`].
pub struct RemediationClientBuilder {
    base_url: Url,
    timeout: Duration,
    tokens: Option<Arc<dyn TokenProvider>>,
}

impl RemediationClientBuilder {
    /// Create a new builder targeting the production Graph endpoint.
    pub fn new() -> Self {
        Self {
            base_url: Url::parse(GRAPH_BASE_URL).expect("static base url parses"),
            timeout: Duration::from_secs(30),
            tokens: None,
        }
    }

    /// Override the API base URL (e.g. a stub server in tests).
    pub fn base_url(mut self, base_url: impl AsRef<str>) -> Result<Self, ClientError> {
        let mut parsed = Url::parse(base_url.as_ref())
            .map_err(|err| ClientError::InvalidBaseUrl(format!("{} ({err})", base_url.as_ref())))?;
        // Joining relative paths drops the last segment unless it ends in '/'.
        if !parsed.path().ends_with('/') {
            let path = format!("{}/", parsed.path());
            parsed.set_path(&path);
        }
        self.base_url = parsed;
        Ok(self)
    }

    /// Override the HTTP client timeout (defaults to 30 seconds).
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Set the per-tenant token source. Required.
    pub fn token_provider(mut self, tokens: Arc<dyn TokenProvider>) -> Self {
        self.tokens = Some(tokens);
        self
    }

    /// Finalise the builder and create a [`RemediationClient`].
    pub fn build(self) -> Result<RemediationClient, ClientError> {
        let tokens = self.tokens.ok_or(ClientError::MissingTokenProvider)?;
        let http = HttpClient::builder().timeout(self.timeout).build()?;
        Ok(RemediationClient {
            http,
            base_url: self.base_url,
            tokens,
        })
    }
}

impl Default for RemediationClientBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl RemediationClient {
    /// Begin building a new client.
    pub fn builder() -> RemediationClientBuilder {
        RemediationClientBuilder::new()
    }

    /// Disable external forwarding (and automatic replies) for the user named
    /// by the `userId` parameter.
    pub async fn disable_forwarding(&self, request: &RequestEnvelope) -> ResponseEnvelope {
        let timer = OperationTimer::start();
        if let Some(rejection) =
            self.reject_invalid(request, &[PARAM_USER_ID], &timer, "disable forwarding")
        {
            return rejection;
        }
        match self.disable_forwarding_inner(request).await {
            Ok(data) => {
                info!(
                    target: "mailguard.graph",
                    tenant = %request.tenant_id,
                    "external forwarding disabled"
                );
                timer.succeeded("external forwarding disabled", data)
            }
            Err(err) => {
                warn!(
                    target: "mailguard.graph",
                    tenant = %request.tenant_id,
                    error = %err,
                    "failed to disable external forwarding"
                );
                timer.failed("failed to disable external forwarding", err.to_string())
            }
        }
    }

    /// Enable external forwarding to the address named by the
    /// `forwardingAddress` parameter.
    pub async fn enable_forwarding(&self, request: &RequestEnvelope) -> ResponseEnvelope {
        let timer = OperationTimer::start();
        if let Some(rejection) = self.reject_invalid(
            request,
            &[PARAM_USER_ID, PARAM_FORWARDING_ADDRESS],
            &timer,
            "enable forwarding",
        ) {
            return rejection;
        }
        match self.enable_forwarding_inner(request).await {
            Ok(data) => {
                info!(
                    target: "mailguard.graph",
                    tenant = %request.tenant_id,
                    "external forwarding enabled"
                );
                timer.succeeded("external forwarding enabled", data)
            }
            Err(err) => {
                warn!(
                    target: "mailguard.graph",
                    tenant = %request.tenant_id,
                    error = %err,
                    "failed to enable external forwarding"
                );
                timer.failed("failed to enable external forwarding", err.to_string())
            }
        }
    }

    /// Report whether forwarding is active for the user named by `userId`,
    /// echoing the full mailbox settings object.
    pub async fn forwarding_status(&self, request: &RequestEnvelope) -> ResponseEnvelope {
        let timer = OperationTimer::start();
        if let Some(rejection) =
            self.reject_invalid(request, &[PARAM_USER_ID], &timer, "query forwarding status")
        {
            return rejection;
        }
        match self.forwarding_status_inner(request).await {
            Ok(data) => timer.succeeded("forwarding status retrieved", data),
            Err(err) => {
                warn!(
                    target: "mailguard.graph",
                    tenant = %request.tenant_id,
                    error = %err,
                    "failed to query forwarding status"
                );
                timer.failed("failed to query forwarding status", err.to_string())
            }
        }
    }

    /// Validates tenant and required parameters before any network activity.
    fn reject_invalid(
        &self,
        request: &RequestEnvelope,
        required: &[&str],
        timer: &OperationTimer,
        operation: &str,
    ) -> Option<ResponseEnvelope> {
        if request.tenant_id.trim().is_empty() {
            return Some(timer.failed(
                format!("cannot {operation}"),
                "tenant_id must not be empty",
            ));
        }
        let missing = missing_params(request, required);
        if !missing.is_empty() {
            warn!(
                target: "mailguard.graph",
                tenant = %request.tenant_id,
                missing = %missing.join(", "),
                "rejecting request with missing parameters"
            );
            return Some(timer.failed(
                format!("cannot {operation}"),
                format!("missing required parameter(s): {}", missing.join(", ")),
            ));
        }
        None
    }

    async fn disable_forwarding_inner(
        &self,
        request: &RequestEnvelope,
    ) -> Result<BTreeMap<String, Value>, ClientError> {
        let user_id = str_param(request, PARAM_USER_ID)?;
        let token = self.tokens.bearer_token(&request.tenant_id).await?;
        let url = self.mailbox_settings_url(user_id)?;
        let body = json!({
            "automaticRepliesSetting": { "status": "disabled" },
            "forwardingSmtpAddress": null,
        });
        self.send_expect_success(self.http.patch(url).bearer_auth(&token).json(&body))
            .await?;

        let mut data = BTreeMap::new();
        data.insert(PARAM_USER_ID.to_owned(), json!(user_id));
        data.insert("forwardingDisabled".to_owned(), json!(true));
        data.insert("timestamp".to_owned(), json!(rfc3339_now()));
        Ok(data)
    }

    async fn enable_forwarding_inner(
        &self,
        request: &RequestEnvelope,
    ) -> Result<BTreeMap<String, Value>, ClientError> {
        let user_id = str_param(request, PARAM_USER_ID)?;
        let address = str_param(request, PARAM_FORWARDING_ADDRESS)?;
        let token = self.tokens.bearer_token(&request.tenant_id).await?;
        let url = self.mailbox_settings_url(user_id)?;
        let body = json!({ "forwardingSmtpAddress": address });
        self.send_expect_success(self.http.patch(url).bearer_auth(&token).json(&body))
            .await?;

        let mut data = BTreeMap::new();
        data.insert(PARAM_USER_ID.to_owned(), json!(user_id));
        data.insert(PARAM_FORWARDING_ADDRESS.to_owned(), json!(address));
        data.insert("forwardingEnabled".to_owned(), json!(true));
        data.insert("timestamp".to_owned(), json!(rfc3339_now()));
        Ok(data)
    }

    async fn forwarding_status_inner(
        &self,
        request: &RequestEnvelope,
    ) -> Result<BTreeMap<String, Value>, ClientError> {
        let user_id = str_param(request, PARAM_USER_ID)?;
        let token = self.tokens.bearer_token(&request.tenant_id).await?;
        let url = self.mailbox_settings_url(user_id)?;
        let response = self
            .send_expect_success(self.http.get(url).bearer_auth(&token))
            .await?;
        let settings: Value = response.json().await?;

        let address = settings
            .get("forwardingSmtpAddress")
            .and_then(Value::as_str)
            .unwrap_or("");
        let enabled = !address.is_empty();

        let mut data = BTreeMap::new();
        data.insert(PARAM_USER_ID.to_owned(), json!(user_id));
        data.insert("forwardingEnabled".to_owned(), json!(enabled));
        data.insert(
            PARAM_FORWARDING_ADDRESS.to_owned(),
            json!(if enabled { address } else { "None" }),
        );
        data.insert("mailboxSettings".to_owned(), settings);
        Ok(data)
    }

    fn mailbox_settings_url(&self, user_id: &str) -> Result<Url, ClientError> {
        Ok(self
            .base_url
            .join(&format!("users/{user_id}/mailboxSettings"))?)
    }

    async fn send_expect_success(&self, builder: RequestBuilder) -> Result<Response, ClientError> {
        let response = builder
            .header(header::ACCEPT, "application/json")
            .send()
            .await?;
        let status = response.status();
        if status.is_success() {
            Ok(response)
        } else {
            let body = response.text().await.unwrap_or_default();
            Err(ClientError::status(status, body))
        }
    }
}

fn str_param<'a>(request: &'a RequestEnvelope, key: &str) -> Result<&'a str, ClientError> {
    request
        .str_param(key)
        .filter(|value| !value.trim().is_empty())
        .ok_or_else(|| ClientError::InvalidParameter(key.to_owned()))
}

fn rfc3339_now() -> String {
    OffsetDateTime::now_utc()
        .format(&Rfc3339)
        .unwrap_or_else(|_| "1970-01-01T00:00:00Z".to_owned())
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{
        body::to_bytes, extract::Request, extract::State, http::StatusCode,
        response::IntoResponse, Router,
    };
    use mailguard_core::StaticTokenProvider;
    use std::{
        net::SocketAddr,
        sync::{Arc, Mutex},
    };
    use tokio::sync::oneshot;

    #[derive(Clone, Debug)]
    struct Recorded {
        method: String,
        path: String,
        authorization: Option<String>,
        body: String,
    }

    #[derive(Clone)]
    struct AppState {
        requests: Arc<Mutex<Vec<Recorded>>>,
        status: StatusCode,
        body: Arc<String>,
    }

    struct StubServer {
        base_url: String,
        requests: Arc<Mutex<Vec<Recorded>>>,
        shutdown: Option<oneshot::Sender<()>>,
    }

    async fn record_handler(State(state): State<AppState>, request: Request) -> impl IntoResponse {
        let (parts, body) = request.into_parts();
        let bytes = to_bytes(body, usize::MAX).await.unwrap_or_default();
        state.requests.lock().expect("requests lock").push(Recorded {
            method: parts.method.to_string(),
            path: parts.uri.path().to_string(),
            authorization: parts
                .headers
                .get(axum::http::header::AUTHORIZATION)
                .and_then(|value| value.to_str().ok())
                .map(String::from),
            body: String::from_utf8_lossy(&bytes).into_owned(),
        });
        (state.status, state.body.as_ref().clone())
    }

    impl StubServer {
        async fn start(status: StatusCode, body: impl Into<String>) -> Result<Self, std::io::Error> {
            let listener =
                tokio::net::TcpListener::bind(SocketAddr::from(([127, 0, 0, 1], 0))).await?;
            let addr = listener.local_addr()?;
            let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
            let requests = Arc::new(Mutex::new(Vec::new()));
            let app_state = AppState {
                requests: Arc::clone(&requests),
                status,
                body: Arc::new(body.into()),
            };

            let app = Router::new()
                .fallback(record_handler)
                .with_state(app_state);

            let server = axum::serve(listener, app.into_make_service());
            tokio::spawn(async move {
                let _ = server
                    .with_graceful_shutdown(async {
                        let _ = shutdown_rx.await;
                    })
                    .await;
            });

            Ok(Self {
                base_url: format!("http://{addr}"),
                requests,
                shutdown: Some(shutdown_tx),
            })
        }

        fn base_url(&self) -> &str {
            &self.base_url
        }

        fn take_requests(&self) -> Vec<Recorded> {
            self.requests.lock().expect("requests lock").clone()
        }
    }

    impl Drop for StubServer {
        fn drop(&mut self) {
            if let Some(tx) = self.shutdown.take() {
                let _ = tx.send(());
            }
        }
    }

    fn client_for(base_url: &str) -> RemediationClient {
        RemediationClient::builder()
            .base_url(base_url)
            .expect("valid base url")
            .token_provider(Arc::new(StaticTokenProvider::new("test-token")))
            .build()
            .expect("client builds")
    }

    fn disable_request() -> RequestEnvelope {
        RequestEnvelope::new("acme").with_param("userId", "ada@example.com")
    }

    #[tokio::test]
    async fn missing_user_id_fails_without_network() {
        // Port 9 (discard) is never listened on; any request attempt would fail
        // loudly rather than silently succeed.
        let client = client_for("http://127.0.0.1:9");
        let request = RequestEnvelope::new("acme");
        let envelope = client.disable_forwarding(&request).await;
        assert!(!envelope.success);
        let error = envelope.error.expect("error detail");
        assert!(error.contains("userId"), "unexpected error: {error}");
    }

    #[tokio::test]
    async fn enable_requires_forwarding_address() {
        let client = client_for("http://127.0.0.1:9");
        let request = RequestEnvelope::new("acme").with_param("userId", "ada@example.com");
        let envelope = client.enable_forwarding(&request).await;
        assert!(!envelope.success);
        let error = envelope.error.expect("error detail");
        assert!(
            error.contains("forwardingAddress"),
            "unexpected error: {error}"
        );
    }

    #[tokio::test]
    async fn empty_tenant_is_rejected() {
        let client = client_for("http://127.0.0.1:9");
        let request = RequestEnvelope::new("  ").with_param("userId", "ada@example.com");
        let envelope = client.forwarding_status(&request).await;
        assert!(!envelope.success);
        assert!(envelope.error.expect("error detail").contains("tenant_id"));
    }

    #[cfg_attr(
        not(feature = "network-tests"),
        ignore = "requires loopback networking"
    )]
    #[tokio::test]
    async fn validation_failure_issues_no_request() {
        let server = StubServer::start(StatusCode::OK, "{}")
            .await
            .expect("stub server");
        let client = client_for(server.base_url());
        let envelope = client
            .disable_forwarding(&RequestEnvelope::new("acme"))
            .await;
        assert!(!envelope.success);
        assert!(server.take_requests().is_empty());
    }

    #[cfg_attr(
        not(feature = "network-tests"),
        ignore = "requires loopback networking"
    )]
    #[tokio::test]
    async fn disable_patches_settings_and_reports_success() {
        let server = StubServer::start(StatusCode::OK, "{}")
            .await
            .expect("stub server");
        let client = client_for(server.base_url());

        let envelope = client.disable_forwarding(&disable_request()).await;
        assert!(envelope.success, "unexpected failure: {:?}", envelope.error);
        assert_eq!(envelope.data["forwardingDisabled"], json!(true));
        assert_eq!(envelope.data["userId"], json!("ada@example.com"));
        assert!(envelope.data.contains_key("timestamp"));
        assert!(envelope.error.is_none());

        let requests = server.take_requests();
        assert_eq!(requests.len(), 1);
        let recorded = &requests[0];
        assert_eq!(recorded.method, "PATCH");
        assert_eq!(recorded.path, "/users/ada@example.com/mailboxSettings");
        assert_eq!(recorded.authorization.as_deref(), Some("Bearer test-token"));
        let sent: Value = serde_json::from_str(&recorded.body).expect("request body json");
        assert_eq!(sent["forwardingSmtpAddress"], Value::Null);
        assert_eq!(sent["automaticRepliesSetting"]["status"], json!("disabled"));
    }

    #[cfg_attr(
        not(feature = "network-tests"),
        ignore = "requires loopback networking"
    )]
    #[tokio::test]
    async fn enable_sends_address_and_echoes_it() {
        let server = StubServer::start(StatusCode::OK, "{}")
            .await
            .expect("stub server");
        let client = client_for(server.base_url());
        let request = disable_request().with_param("forwardingAddress", "ext@example.com");

        let envelope = client.enable_forwarding(&request).await;
        assert!(envelope.success, "unexpected failure: {:?}", envelope.error);
        assert_eq!(envelope.data["forwardingEnabled"], json!(true));
        assert_eq!(envelope.data["forwardingAddress"], json!("ext@example.com"));

        let requests = server.take_requests();
        assert_eq!(requests.len(), 1);
        let sent: Value = serde_json::from_str(&requests[0].body).expect("request body json");
        assert_eq!(sent, json!({ "forwardingSmtpAddress": "ext@example.com" }));
    }

    #[cfg_attr(
        not(feature = "network-tests"),
        ignore = "requires loopback networking"
    )]
    #[tokio::test]
    async fn status_derives_enabled_from_address() {
        let server = StubServer::start(
            StatusCode::OK,
            r#"{"forwardingSmtpAddress":"ext@example.com","timeZone":"UTC"}"#,
        )
        .await
        .expect("stub server");
        let client = client_for(server.base_url());

        let envelope = client.forwarding_status(&disable_request()).await;
        assert!(envelope.success, "unexpected failure: {:?}", envelope.error);
        assert_eq!(envelope.data["forwardingEnabled"], json!(true));
        assert_eq!(envelope.data["forwardingAddress"], json!("ext@example.com"));
        assert_eq!(
            envelope.data["mailboxSettings"]["timeZone"],
            json!("UTC")
        );

        let requests = server.take_requests();
        assert_eq!(requests.len(), 1);
        assert_eq!(requests[0].method, "GET");
    }

    #[cfg_attr(
        not(feature = "network-tests"),
        ignore = "requires loopback networking"
    )]
    #[tokio::test]
    async fn status_reports_disabled_when_address_absent() {
        let server = StubServer::start(StatusCode::OK, r#"{"timeZone":"UTC"}"#)
            .await
            .expect("stub server");
        let client = client_for(server.base_url());

        let envelope = client.forwarding_status(&disable_request()).await;
        assert!(envelope.success, "unexpected failure: {:?}", envelope.error);
        assert_eq!(envelope.data["forwardingEnabled"], json!(false));
        assert_eq!(envelope.data["forwardingAddress"], json!("None"));
    }

    #[cfg_attr(
        not(feature = "network-tests"),
        ignore = "requires loopback networking"
    )]
    #[tokio::test]
    async fn remote_rejection_carries_reason_and_body() {
        let server = StubServer::start(StatusCode::FORBIDDEN, "insufficient privileges")
            .await
            .expect("stub server");
        let client = client_for(server.base_url());

        let envelope = client.disable_forwarding(&disable_request()).await;
        assert!(!envelope.success);
        let error = envelope.error.expect("error detail");
        assert!(error.contains("Forbidden"), "unexpected error: {error}");
        assert!(
            error.contains("insufficient privileges"),
            "unexpected error: {error}"
        );
    }

    #[cfg_attr(
        not(feature = "network-tests"),
        ignore = "requires loopback networking"
    )]
    #[tokio::test]
    async fn transport_fault_is_reported_not_raised() {
        // Bind then drop a listener so the port is closed when the call runs.
        let listener = tokio::net::TcpListener::bind(SocketAddr::from(([127, 0, 0, 1], 0)))
            .await
            .expect("bind probe listener");
        let addr = listener.local_addr().expect("local addr");
        drop(listener);

        let client = client_for(&format!("http://{addr}"));
        let envelope = client.forwarding_status(&disable_request()).await;
        assert!(!envelope.success);
        assert!(envelope.error.is_some());
    }
}
