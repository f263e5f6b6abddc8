use anyhow::{Context, Result};
use reqwest::header::{HeaderValue, AUTHORIZATION};
use reqwest::{Client, Request, RequestBuilder, Response, StatusCode, Url};
use serde::de::DeserializeOwned;
use std::sync::Arc;
use std::time::Duration;

use crate::auth::{token, SessionManager};
use crate::error::AuthError;

/// Endpoints that must never carry a token or trigger a refresh
const UNAUTHENTICATED_PATHS: [&str; 2] = ["/auth/login", "/auth/register"];

/// HTTP client that authorizes every request with the session's bearer token.
///
/// Handles:
/// - bearer header attachment (skipped for login/register)
/// - 401: one shared refresh, then a single replay of the original request
/// - everything else passes through untouched
pub struct AuthorizedClient {
    /// Shared HTTP client with connection pooling
    client: Client,

    /// Session that owns the token and the refresh path
    session: Arc<SessionManager>,
}

impl AuthorizedClient {
    /// Create a new HTTP client
    pub fn new(
        session: Arc<SessionManager>,
        max_connections: usize,
        connect_timeout: u64,
        request_timeout: u64,
    ) -> Result<Self> {
        let client = Client::builder()
            .pool_max_idle_per_host(max_connections)
            .connect_timeout(Duration::from_secs(connect_timeout))
            .timeout(Duration::from_secs(request_timeout))
            .build()
            .context("Failed to create HTTP client")?;

        Ok(Self { client, session })
    }

    pub fn session(&self) -> &Arc<SessionManager> {
        &self.session
    }

    /// Resolve an API path against the configured base URL; absolute URLs pass through
    pub fn url(&self, path: &str) -> String {
        if path.starts_with("http://") || path.starts_with("https://") {
            path.to_string()
        } else {
            format!("{}/{}", self.session.api_url(), path.trim_start_matches('/'))
        }
    }

    pub fn get(&self, path: &str) -> RequestBuilder {
        self.client.get(self.url(path))
    }

    pub fn post(&self, path: &str) -> RequestBuilder {
        self.client.post(self.url(path))
    }

    pub fn put(&self, path: &str) -> RequestBuilder {
        self.client.put(self.url(path))
    }

    /// Execute a request through the authorization pipeline.
    /// Non-401 responses come back as-is, whatever their status.
    pub async fn execute(&self, request: Request) -> Result<Response, AuthError> {
        let request_id = uuid::Uuid::new_v4().to_string()[..8].to_string();
        let method = request.method().clone();
        let url = request.url().clone();

        if bypasses_auth(&url) {
            tracing::debug!(
                request_id = %request_id,
                method = %method,
                url = %url,
                "Skipping authorization for auth endpoint"
            );
            return self.send(request, &request_id).await;
        }

        // Keep a copy for the replay before the body is consumed
        let replay = request.try_clone();

        let sent_token = self.session.get_token();
        match sent_token.as_deref() {
            Some(t) => tracing::debug!(
                request_id = %request_id,
                method = %method,
                url = %url,
                token = %token::preview(t),
                "Attaching bearer token"
            ),
            None => tracing::debug!(
                request_id = %request_id,
                method = %method,
                url = %url,
                "No token available, sending unauthenticated"
            ),
        }

        let response = self
            .send(with_bearer(request, sent_token.as_deref())?, &request_id)
            .await?;
        if response.status() != StatusCode::UNAUTHORIZED {
            return Ok(response);
        }

        tracing::warn!(
            request_id = %request_id,
            url = %url,
            "Received 401, attempting token refresh"
        );

        let Some(original) = replay else {
            return Err(AuthError::RequestNotReplayable);
        };

        let new_token = match self
            .session
            .refresh_after_rejection(sent_token.as_deref())
            .await
        {
            Ok(Some(new_token)) => new_token,
            Ok(None) => {
                tracing::warn!(request_id = %request_id, "No refresh token available - forcing logout");
                self.force_logout(sent_token.as_deref(), AuthError::RefreshUnavailable);
                return Err(AuthError::RefreshUnavailable);
            }
            Err(e) => {
                tracing::error!(request_id = %request_id, "Token refresh failed: {}", e);
                self.force_logout(sent_token.as_deref(), e.clone());
                return Err(e);
            }
        };

        tracing::debug!(request_id = %request_id, "Replaying request with refreshed token");
        let retried = self
            .send(with_bearer(original, Some(&new_token))?, &request_id)
            .await?;

        if retried.status() == StatusCode::UNAUTHORIZED {
            tracing::error!(
                request_id = %request_id,
                url = %url,
                "Request still unauthorized after refresh, forcing logout"
            );
            self.force_logout(Some(&new_token), AuthError::Unauthorized);
            return Err(AuthError::Unauthorized);
        }

        Ok(retried)
    }

    /// Execute and decode a JSON body, turning non-success statuses into errors
    pub async fn send_json<T: DeserializeOwned>(&self, request: Request) -> Result<T, AuthError> {
        let response = expect_success(self.execute(request).await?).await?;
        response
            .json()
            .await
            .map_err(|e| AuthError::Decode(e.to_string()))
    }

    async fn send(&self, request: Request, request_id: &str) -> Result<Response, AuthError> {
        let url = request.url().clone();
        match self.client.execute(request).await {
            Ok(response) => {
                tracing::debug!(
                    request_id = %request_id,
                    status = %response.status(),
                    "Received HTTP response"
                );
                Ok(response)
            }
            Err(e) => {
                let err = AuthError::from_transport(&e);
                tracing::warn!(
                    request_id = %request_id,
                    url = %url,
                    error = %err,
                    "HTTP request error"
                );
                Err(err)
            }
        }
    }

    /// End the session the rejected token belonged to.
    /// A session that has since been replaced or already ended is left alone.
    fn force_logout(&self, rejected_token: Option<&str>, cause: AuthError) {
        if let Some(token) = rejected_token {
            self.session.expire_if_current(token, cause);
        }
    }
}

/// Turn a non-success response into an error carrying the server's message
pub async fn expect_success(response: Response) -> Result<Response, AuthError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }

    let error_text = response.text().await.unwrap_or_default();
    tracing::error!(
        status = status.as_u16(),
        response_body = %error_text,
        "HTTP request failed with error response"
    );
    Err(AuthError::from_status(status, &error_text))
}

fn bypasses_auth(url: &Url) -> bool {
    let path = url.path();
    UNAUTHENTICATED_PATHS.iter().any(|p| path.contains(p))
}

fn with_bearer(mut request: Request, token: Option<&str>) -> Result<Request, AuthError> {
    if let Some(token) = token {
        let value = HeaderValue::from_str(&format!("Bearer {}", token))
            .map_err(|_| AuthError::Decode("token is not a valid header value".to_string()))?;
        request.headers_mut().insert(AUTHORIZATION, value);
    }
    Ok(request)
}
