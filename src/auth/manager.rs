use anyhow::{Context, Result};
use chrono::Utc;
use reqwest::{Client, StatusCode};
use std::sync::{Arc, Mutex, PoisonError, Weak};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use super::credentials::CredentialStore;
use super::refresh::{self, RefreshCoordinator, RefreshOutcome};
use super::token;
use super::types::{LoginRequest, LoginResponse, RegisterRequest, RegisteredUser, Session, UserRecord};
use crate::error::{server_message, AuthError};
use crate::navigation::{Navigator, LOGIN_ROUTE};

/// Fallback message when the backend rejects a login without explaining why
const INVALID_LOGIN_MESSAGE: &str = "Invalid email or password";

/// Settings the session manager needs from configuration
#[derive(Clone, Debug)]
pub struct SessionOptions {
    /// Base API URL, e.g. `http://localhost:8080/api`
    pub api_url: String,
    /// How long before expiry the automatic refresh fires
    pub refresh_lead: Duration,
    /// Upper bound on a single refresh call
    pub refresh_timeout: Duration,
    /// Timeout for auth endpoint requests
    pub request_timeout: Duration,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            api_url: "http://localhost:8080/api".to_string(),
            refresh_lead: Duration::from_secs(60),
            refresh_timeout: Duration::from_secs(30),
            request_timeout: Duration::from_secs(30),
        }
    }
}

/// Session manager
/// Owns login, registration, logout and token refresh; the only writer of the credential store
pub struct SessionManager {
    /// Persisted token and user
    store: Arc<CredentialStore>,

    /// HTTP client for auth endpoint requests
    client: Client,

    /// Base API URL without trailing slash
    api_url: String,

    /// Redirect hook for forced and explicit logout
    navigator: Arc<dyn Navigator>,

    /// Single-flight refresh state shared by the timer and the request pipeline
    refresh: RefreshCoordinator,

    /// Pending automatic refresh
    refresh_timer: Mutex<Option<JoinHandle<()>>>,

    refresh_lead: Duration,
    refresh_timeout: Duration,

    /// Session generation, bumped by every login and logout.
    /// Held while committing a refresh so a logout cannot be undone by it.
    generation: Mutex<u64>,

    /// Refresh failure that ended the last session; late callers get it until the next login
    last_failure: Mutex<Option<AuthError>>,

    weak_self: Weak<SessionManager>,
}

impl SessionManager {
    /// Create a session manager with its own HTTP client
    pub fn new(
        store: Arc<CredentialStore>,
        navigator: Arc<dyn Navigator>,
        options: SessionOptions,
    ) -> Result<Arc<Self>> {
        let client = Client::builder()
            .timeout(options.request_timeout)
            .build()
            .context("Failed to create HTTP client")?;

        Ok(Self::with_client(store, navigator, client, options))
    }

    /// Create a session manager around an existing HTTP client
    pub fn with_client(
        store: Arc<CredentialStore>,
        navigator: Arc<dyn Navigator>,
        client: Client,
        options: SessionOptions,
    ) -> Arc<Self> {
        Arc::new_cyclic(|weak_self| Self {
            store,
            client,
            api_url: options.api_url.trim_end_matches('/').to_string(),
            navigator,
            refresh: RefreshCoordinator::new(),
            refresh_timer: Mutex::new(None),
            refresh_lead: options.refresh_lead,
            refresh_timeout: options.refresh_timeout,
            generation: Mutex::new(0),
            last_failure: Mutex::new(None),
            weak_self: weak_self.clone(),
        })
    }

    fn auth_url(&self, endpoint: &str) -> String {
        format!("{}/auth/{}", self.api_url, endpoint)
    }

    /// Base API URL without trailing slash
    pub fn api_url(&self) -> &str {
        &self.api_url
    }

    // ===== Auth methods =====

    /// Log in and persist token and user together.
    /// Nothing is stored when the backend rejects the credentials.
    pub async fn login(&self, email: &str, password: &str) -> Result<Session, AuthError> {
        tracing::debug!(email, "Logging in");

        let response = self
            .client
            .post(self.auth_url("login"))
            .json(&LoginRequest { email, password })
            .send()
            .await
            .map_err(|e| AuthError::from_transport(&e))?;

        let status = response.status();
        if !status.is_success() {
            let error_text = response.text().await.unwrap_or_default();
            tracing::warn!(status = status.as_u16(), "Login rejected");
            return Err(match status.as_u16() {
                400 | 401 | 403 => {
                    let message = server_message(&error_text);
                    AuthError::InvalidCredentials(if message.is_empty() {
                        INVALID_LOGIN_MESSAGE.to_string()
                    } else {
                        message
                    })
                }
                _ => AuthError::from_status(status, &error_text),
            });
        }

        let data: LoginResponse = response
            .json()
            .await
            .map_err(|e| AuthError::Decode(format!("login response: {}", e)))?;

        if data.access_token.is_empty() {
            return Err(AuthError::Decode(
                "login response does not contain an access token".to_string(),
            ));
        }

        let mut user = data.user;
        if data.refresh_token.is_some() {
            user.refresh_token = data.refresh_token;
        }

        {
            // A refresh still running for an earlier session must not overwrite this one
            let mut generation = self.generation_guard();
            *generation += 1;
            self.store.save_session(&data.access_token, &user);
            self.failure_guard().take();
        }
        self.start_refresh_timer();

        tracing::info!(
            user_id = user.id,
            admin = user.is_admin(),
            token = %token::preview(&data.access_token),
            "✅ Login successful"
        );

        Ok(Session {
            access_token: data.access_token,
            user,
        })
    }

    /// Create an account. Never logs the new user in.
    pub async fn register(&self, request: &RegisterRequest) -> Result<RegisteredUser, AuthError> {
        tracing::debug!(email = %request.email, "Registering account");

        let response = self
            .client
            .post(self.auth_url("register"))
            .json(request)
            .send()
            .await
            .map_err(|e| AuthError::from_transport(&e))?;

        let status = response.status();
        if !status.is_success() {
            let error_text = response.text().await.unwrap_or_default();
            let message = server_message(&error_text);
            tracing::warn!(status = status.as_u16(), message = %message, "Registration rejected");

            if status == StatusCode::CONFLICT || message.to_lowercase().contains("already in use") {
                return Err(AuthError::EmailAlreadyInUse(message));
            }
            return Err(AuthError::from_status(status, &error_text));
        }

        let registered: RegisteredUser = response
            .json()
            .await
            .map_err(|e| AuthError::Decode(format!("register response: {}", e)))?;

        tracing::info!(user_id = ?registered.id, "Account registered");
        Ok(registered)
    }

    /// Clear the session, cancel the refresh timer and send the user to the login screen
    pub fn logout(&self) {
        {
            let mut generation = self.generation_guard();
            *generation += 1;
            self.store.clear();
            self.failure_guard().take();
        }
        self.finish_logout();
        tracing::info!("Logged out");
    }

    /// End the session only if `token` is still the stored access token.
    /// Returns false when another login or refresh has already replaced it.
    pub fn expire_if_current(&self, token: &str, cause: AuthError) -> bool {
        {
            let mut generation = self.generation_guard();
            if self.store.get_token().as_deref() != Some(token) {
                tracing::debug!("Rejected token is no longer current, session kept");
                return false;
            }
            *generation += 1;
            self.store.clear();
            *self.failure_guard() = Some(cause);
        }
        self.finish_logout();
        tracing::info!("Session expired");
        true
    }

    /// End the session only if no login or logout happened since `generation` was read
    fn expire_if_generation(&self, generation: u64, cause: &AuthError) -> bool {
        {
            let mut current = self.generation_guard();
            if *current != generation {
                tracing::debug!("Session changed while refreshing, keeping it");
                return false;
            }
            *current += 1;
            self.store.clear();
            *self.failure_guard() = Some(cause.clone());
        }
        self.finish_logout();
        tracing::info!("Session expired");
        true
    }

    fn finish_logout(&self) {
        self.stop_refresh_timer();
        self.navigator.navigate(LOGIN_ROUTE);
    }

    /// Refresh the access token.
    ///
    /// `Ok(None)` when no refresh token is held. Joins a refresh that is
    /// already running instead of starting a second one. Any failure forces
    /// logout before the error is returned.
    pub async fn refresh_token(&self) -> RefreshOutcome {
        self.refresh.run(|| None, || self.refresh_task()).await
    }

    /// Refresh after the backend rejected `sent_token` with a 401.
    ///
    /// If the stored token already differs from the rejected one, another
    /// caller has rotated it and that token is returned without a new refresh.
    pub async fn refresh_after_rejection(&self, sent_token: Option<&str>) -> RefreshOutcome {
        let store = &self.store;
        self.refresh
            .run(
                || store.get_token().filter(|current| Some(current.as_str()) != sent_token),
                || self.refresh_task(),
            )
            .await
    }

    /// True while a refresh call is outstanding
    pub async fn is_refreshing(&self) -> bool {
        self.refresh.is_refreshing().await
    }

    fn refresh_task(&self) -> impl std::future::Future<Output = RefreshOutcome> + Send + 'static {
        let weak = self.weak_self.clone();
        async move {
            match weak.upgrade() {
                Some(manager) => manager.refresh_with_timeout().await,
                None => Err(AuthError::RefreshFailed(
                    "session manager was dropped".to_string(),
                )),
            }
        }
    }

    async fn refresh_with_timeout(&self) -> RefreshOutcome {
        let generation = *self.generation_guard();

        match tokio::time::timeout(self.refresh_timeout, self.perform_refresh(generation)).await {
            Ok(outcome) => outcome,
            Err(_) => {
                tracing::error!(
                    timeout_secs = self.refresh_timeout.as_secs(),
                    "Token refresh timed out, forcing logout"
                );
                let err = AuthError::RefreshFailed(format!(
                    "timed out after {}s",
                    self.refresh_timeout.as_secs()
                ));
                self.expire_if_generation(generation, &err);
                Err(err)
            }
        }
    }

    async fn perform_refresh(&self, generation: u64) -> RefreshOutcome {
        let Some(user) = self.store.current_user() else {
            let last_failure = self.failure_guard().clone();
            return match last_failure {
                Some(err) => {
                    tracing::debug!("Session already ended by a failed refresh");
                    Err(err)
                }
                None => {
                    tracing::debug!("No current user, nothing to refresh");
                    Ok(None)
                }
            };
        };
        let Some(refresh_token) = user.refresh_token.clone() else {
            tracing::debug!("No refresh token held, nothing to refresh");
            return Ok(None);
        };

        let data = match refresh::request_refresh(
            &self.client,
            &self.auth_url("refresh-token"),
            &refresh_token,
        )
        .await
        {
            Ok(data) => data,
            Err(e) => {
                tracing::error!("Token refresh failed: {}", e);
                let err = AuthError::RefreshFailed(e.to_string());
                self.expire_if_generation(generation, &err);
                return Err(err);
            }
        };

        let mut user = user;
        if data.refresh_token.is_some() {
            user.refresh_token = data.refresh_token;
        }

        {
            let current = self.generation_guard();
            if *current != generation {
                tracing::warn!("Session ended while refreshing, discarding new token");
                return Err(AuthError::RefreshFailed(
                    "session was logged out during refresh".to_string(),
                ));
            }
            self.store.save_session(&data.token, &user);
        }

        self.start_refresh_timer();
        Ok(Some(data.token))
    }

    /// Overwrite the stored user after a profile edit; the token is untouched.
    /// The stored refresh token survives when the new record lacks one.
    pub fn replace_user(&self, mut user: UserRecord) -> Result<(), AuthError> {
        let _generation = self.generation_guard();
        let Some(existing) = self.store.current_user() else {
            return Err(AuthError::Unauthorized);
        };
        if user.refresh_token.is_none() {
            user.refresh_token = existing.refresh_token;
        }
        if user.roles.is_empty() {
            user.roles = existing.roles;
        }
        self.store.save_user(&user);
        Ok(())
    }

    // ===== Role & status checks =====

    pub fn is_logged_in(&self) -> bool {
        self.store.get_token().is_some()
    }

    pub fn is_admin(&self) -> bool {
        self.store
            .current_user()
            .map(|user| user.is_admin())
            .unwrap_or(false)
    }

    pub fn get_token(&self) -> Option<String> {
        self.store.get_token()
    }

    pub fn get_user(&self) -> Option<UserRecord> {
        self.store.get_user()
    }

    pub fn current_user(&self) -> Option<UserRecord> {
        self.store.current_user()
    }

    /// Current-user stream; `None` means logged out
    pub fn subscribe(&self) -> watch::Receiver<Option<UserRecord>> {
        self.store.subscribe()
    }

    // ===== Refresh timer =====

    /// Re-arm the refresh timer for a session restored from storage
    pub fn resume(&self) {
        if self.is_logged_in() {
            self.start_refresh_timer();
        }
    }

    /// True while an automatic refresh is scheduled
    pub fn has_refresh_timer(&self) -> bool {
        self.timer_guard()
            .as_ref()
            .map(|handle| !handle.is_finished())
            .unwrap_or(false)
    }

    fn start_refresh_timer(&self) {
        let Some(access_token) = self.store.get_token() else {
            return;
        };

        let Some(expires_at) = token::expires_at(&access_token) else {
            tracing::warn!("Error parsing JWT token, automatic refresh disabled");
            self.stop_refresh_timer();
            return;
        };

        let delay = token::refresh_delay(expires_at, Utc::now(), self.refresh_lead);
        tracing::debug!(
            expires_at = %expires_at.to_rfc3339(),
            delay_secs = delay.as_secs(),
            "Scheduling automatic token refresh"
        );

        let weak = self.weak_self.clone();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let Some(manager) = weak.upgrade() else {
                return;
            };
            // Detach so the refresh re-arming the timer does not abort this task
            manager.timer_guard().take();
            if let Err(e) = manager.refresh_token().await {
                tracing::warn!("Scheduled token refresh failed: {}", e);
            }
        });

        if let Some(previous) = self.timer_guard().replace(handle) {
            previous.abort();
        }
    }

    fn stop_refresh_timer(&self) {
        if let Some(handle) = self.timer_guard().take() {
            handle.abort();
        }
    }

    fn timer_guard(&self) -> std::sync::MutexGuard<'_, Option<JoinHandle<()>>> {
        self.refresh_timer
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn generation_guard(&self) -> std::sync::MutexGuard<'_, u64> {
        self.generation.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn failure_guard(&self) -> std::sync::MutexGuard<'_, Option<AuthError>> {
        self.last_failure.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Drop for SessionManager {
    fn drop(&mut self) {
        self.stop_refresh_timer();
    }
}
