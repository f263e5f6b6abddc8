// Token refresh logic
// Backend refresh call and the single-flight coordinator shared by every caller

use std::future::Future;
use std::sync::Arc;

use reqwest::Client;
use tokio::sync::{watch, Mutex};

use super::types::{RefreshRequest, RefreshResponse};
use crate::error::AuthError;

/// Result every waiter of a refresh receives: the new token, or `None`
/// when the session held no refresh token
pub type RefreshOutcome = Result<Option<String>, AuthError>;

/// Call POST /auth/refresh-token
pub async fn request_refresh(
    client: &Client,
    url: &str,
    refresh_token: &str,
) -> Result<RefreshResponse, AuthError> {
    tracing::info!("Refreshing access token...");

    let response = client
        .post(url)
        .json(&RefreshRequest { refresh_token })
        .send()
        .await
        .map_err(|e| AuthError::from_transport(&e))?;

    let status = response.status();
    if !status.is_success() {
        let error_text = response.text().await.unwrap_or_default();
        tracing::error!(
            status = status.as_u16(),
            response_body = %error_text,
            "Token refresh rejected by backend"
        );
        return Err(AuthError::from_status(status, &error_text));
    }

    let data: RefreshResponse = response
        .json()
        .await
        .map_err(|e| AuthError::Decode(format!("refresh response: {}", e)))?;

    if data.token.is_empty() {
        return Err(AuthError::Decode(
            "refresh response does not contain a token".to_string(),
        ));
    }

    tracing::info!(
        token = %super::token::preview(&data.token),
        rotated_refresh_token = data.refresh_token.is_some(),
        "Token refreshed"
    );

    Ok(data)
}

enum RefreshState {
    Idle,
    /// A refresh task is running; waiters clone this receiver
    Refreshing(watch::Receiver<Option<RefreshOutcome>>),
}

/// Ensures at most one refresh runs at a time.
///
/// The state flag and the waiter channel live behind one mutex. The refresh
/// itself runs on a spawned task, so a caller that gives up on its request
/// only drops its receiver and never cancels the refresh others wait on.
pub struct RefreshCoordinator {
    state: Arc<Mutex<RefreshState>>,
}

impl Default for RefreshCoordinator {
    fn default() -> Self {
        Self::new()
    }
}

impl RefreshCoordinator {
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(RefreshState::Idle)),
        }
    }

    pub async fn is_refreshing(&self) -> bool {
        matches!(*self.state.lock().await, RefreshState::Refreshing(_))
    }

    /// Join the in-flight refresh, or start one.
    ///
    /// `reuse` is checked while idle and inside the critical section; when it
    /// yields a token no refresh is started. `start` builds the refresh future
    /// and is only called by the caller that moves the state to `Refreshing`.
    pub async fn run<R, F, Fut>(&self, reuse: R, start: F) -> RefreshOutcome
    where
        R: FnOnce() -> Option<String>,
        F: FnOnce() -> Fut,
        Fut: Future<Output = RefreshOutcome> + Send + 'static,
    {
        let mut rx = {
            let mut state = self.state.lock().await;
            match &*state {
                RefreshState::Refreshing(rx) => {
                    tracing::debug!("Token refresh already in progress, waiting...");
                    rx.clone()
                }
                RefreshState::Idle => {
                    if let Some(token) = reuse() {
                        tracing::debug!("Token already rotated, skipping refresh");
                        return Ok(Some(token));
                    }

                    let (tx, rx) = watch::channel(None);
                    *state = RefreshState::Refreshing(rx.clone());

                    let refresh = start();
                    let state_handle = Arc::clone(&self.state);
                    tokio::spawn(async move {
                        let outcome = refresh.await;
                        // Back to idle and publish in one step so late 401s
                        // either join this refresh or see the rotated token
                        let mut state = state_handle.lock().await;
                        *state = RefreshState::Idle;
                        tx.send_replace(Some(outcome));
                    });

                    rx
                }
            }
        };

        let result = match rx.wait_for(Option::is_some).await {
            Ok(outcome) => (*outcome).clone(),
            Err(_) => None,
        };
        result.unwrap_or_else(|| {
            Err(AuthError::RefreshFailed(
                "refresh task ended without a result".to_string(),
            ))
        })
    }
}
