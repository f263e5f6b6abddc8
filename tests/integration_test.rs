// Integration tests for the bookstore client
//
// These tests run the session manager and the authorization pipeline against
// an in-process axum backend that counts refresh calls and rotates tokens.

use axum::{
    extract::State,
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use serde_json::{json, Value};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::oneshot;

use bookstore_client::{
    auth::{CredentialStore, RegisterRequest, SessionManager, SessionOptions, USER_KEY, TOKEN_KEY},
    error::AuthError,
    http_client::AuthorizedClient,
    navigation::Navigator,
    storage::{SqliteStorage, Storage},
};

// ==================================================================================================
// Mock Backend
// ==================================================================================================

const PASSWORD: &str = "password123";

#[derive(Clone)]
struct BackendOptions {
    /// Delay before the refresh endpoint answers
    refresh_delay: Duration,
    /// Refresh endpoint rejects every call
    refresh_fails: bool,
    /// When set, login issues a JWT expiring this many seconds from now
    login_expires_in: Option<i64>,
}

impl Default for BackendOptions {
    fn default() -> Self {
        Self {
            refresh_delay: Duration::from_millis(200),
            refresh_fails: false,
            login_expires_in: None,
        }
    }
}

struct BackendState {
    options: BackendOptions,
    valid_token: Mutex<String>,
    login_calls: AtomicUsize,
    refresh_calls: AtomicUsize,
    protected_calls: AtomicUsize,
    /// Login/register requests that arrived with an Authorization header
    auth_header_leaks: AtomicUsize,
}

/// In-process bookstore API
struct MockBackend {
    state: Arc<BackendState>,
    port: u16,
    shutdown_tx: Option<oneshot::Sender<()>>,
}

impl MockBackend {
    async fn start(options: BackendOptions) -> Self {
        let state = Arc::new(BackendState {
            options,
            valid_token: Mutex::new(String::new()),
            login_calls: AtomicUsize::new(0),
            refresh_calls: AtomicUsize::new(0),
            protected_calls: AtomicUsize::new(0),
            auth_header_leaks: AtomicUsize::new(0),
        });

        let app = Router::new()
            .route("/api/auth/login", post(handle_login))
            .route("/api/auth/register", post(handle_register))
            .route("/api/auth/refresh-token", post(handle_refresh))
            .route("/api/users/library", get(handle_library))
            .with_state(state.clone());

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();

        tokio::spawn(async move {
            axum::serve(listener, app)
                .with_graceful_shutdown(async {
                    let _ = shutdown_rx.await;
                })
                .await
                .ok();
        });

        Self {
            state,
            port,
            shutdown_tx: Some(shutdown_tx),
        }
    }

    fn api_url(&self) -> String {
        format!("http://127.0.0.1:{}/api", self.port)
    }

    /// Make the server reject whatever token the client currently holds
    fn invalidate(&self) {
        *self.state.valid_token.lock().unwrap() = "revoked-server-side".to_string();
    }

    fn valid_token(&self) -> String {
        self.state.valid_token.lock().unwrap().clone()
    }

    fn refresh_calls(&self) -> usize {
        self.state.refresh_calls.load(Ordering::SeqCst)
    }

    fn protected_calls(&self) -> usize {
        self.state.protected_calls.load(Ordering::SeqCst)
    }

    fn auth_header_leaks(&self) -> usize {
        self.state.auth_header_leaks.load(Ordering::SeqCst)
    }
}

impl Drop for MockBackend {
    fn drop(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
    }
}

fn make_jwt(exp: i64, jti: usize) -> String {
    let header = URL_SAFE_NO_PAD.encode(br#"{"alg":"HS256","typ":"JWT"}"#);
    let payload = URL_SAFE_NO_PAD.encode(json!({"sub": "1", "exp": exp, "jti": jti}).to_string());
    format!("{}.{}.signature", header, payload)
}

fn now() -> i64 {
    chrono::Utc::now().timestamp()
}

fn record_leak(state: &BackendState, headers: &HeaderMap) {
    if headers.contains_key(header::AUTHORIZATION) {
        state.auth_header_leaks.fetch_add(1, Ordering::SeqCst);
    }
}

async fn handle_login(
    State(state): State<Arc<BackendState>>,
    headers: HeaderMap,
    Json(body): Json<Value>,
) -> Response {
    record_leak(&state, &headers);

    if body["password"] != PASSWORD {
        return (
            StatusCode::UNAUTHORIZED,
            Json(json!({"message": "Invalid email or password"})),
        )
            .into_response();
    }

    let login = state.login_calls.fetch_add(1, Ordering::SeqCst) + 1;
    let token = match state.options.login_expires_in {
        Some(secs) => make_jwt(now() + secs, 0),
        None => format!("login-token-{}", login),
    };
    *state.valid_token.lock().unwrap() = token.clone();

    Json(json!({
        "accessToken": token,
        "refreshToken": "refresh-0",
        "user": {
            "id": 1,
            "email": body["email"],
            "firstName": "Test",
            "lastName": "User",
            "roles": [{"id": 1, "name": "USER"}]
        }
    }))
    .into_response()
}

async fn handle_register(
    State(state): State<Arc<BackendState>>,
    headers: HeaderMap,
    Json(body): Json<Value>,
) -> Response {
    record_leak(&state, &headers);

    if body["email"] == "taken@example.com" {
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({"message": "Email is already in use!"})),
        )
            .into_response();
    }
    (
        StatusCode::CREATED,
        Json(json!({"id": 2, "email": body["email"]})),
    )
        .into_response()
}

async fn handle_refresh(State(state): State<Arc<BackendState>>) -> Response {
    let call = state.refresh_calls.fetch_add(1, Ordering::SeqCst) + 1;
    tokio::time::sleep(state.options.refresh_delay).await;

    if state.options.refresh_fails {
        return (
            StatusCode::UNAUTHORIZED,
            Json(json!({"message": "Refresh token expired"})),
        )
            .into_response();
    }

    let token = make_jwt(now() + 3600, call);
    *state.valid_token.lock().unwrap() = token.clone();
    Json(json!({"token": token, "refreshToken": format!("refresh-{}", call)})).into_response()
}

async fn handle_library(State(state): State<Arc<BackendState>>, headers: HeaderMap) -> Response {
    state.protected_calls.fetch_add(1, Ordering::SeqCst);

    let expected = format!("Bearer {}", state.valid_token.lock().unwrap());
    let authorized = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .map(|v| v == expected)
        .unwrap_or(false);

    if !authorized {
        return StatusCode::UNAUTHORIZED.into_response();
    }
    Json(json!([{"id": 10, "title": "Dune"}])).into_response()
}

// ==================================================================================================
// Test Helpers
// ==================================================================================================

#[derive(Default)]
struct RecordingNavigator {
    routes: Mutex<Vec<String>>,
}

impl Navigator for RecordingNavigator {
    fn navigate(&self, route: &str) {
        self.routes.lock().unwrap().push(route.to_string());
    }
}

struct Client {
    session: Arc<SessionManager>,
    http: Arc<AuthorizedClient>,
    navigator: Arc<RecordingNavigator>,
}

fn connect(backend: &MockBackend, store: CredentialStore, refresh_timeout: Duration) -> Client {
    let navigator = Arc::new(RecordingNavigator::default());
    let session = SessionManager::new(
        Arc::new(store),
        navigator.clone(),
        SessionOptions {
            api_url: backend.api_url(),
            refresh_timeout,
            ..SessionOptions::default()
        },
    )
    .expect("Failed to create session manager");
    let http = Arc::new(
        AuthorizedClient::new(session.clone(), 20, 5, 10).expect("Failed to create HTTP client"),
    );
    Client {
        session,
        http,
        navigator,
    }
}

async fn fetch_library(http: Arc<AuthorizedClient>) -> Result<StatusCode, AuthError> {
    let request = http.get("/users/library").build().unwrap();
    let response = http.execute(request).await?;
    Ok(response.status())
}

fn temp_db_path() -> std::path::PathBuf {
    std::env::temp_dir()
        .join(format!("bookstore-it-{}", uuid::Uuid::new_v4()))
        .join("session.sqlite3")
}

// ==================================================================================================
// Single-flight Refresh
// ==================================================================================================

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_401s_share_one_refresh() {
    let backend = MockBackend::start(BackendOptions::default()).await;
    let client = connect(&backend, CredentialStore::in_memory(), Duration::from_secs(5));

    client.session.login("test@example.com", PASSWORD).await.unwrap();
    backend.invalidate();

    let tasks: Vec<_> = (0..8)
        .map(|_| tokio::spawn(fetch_library(client.http.clone())))
        .collect();

    for result in futures::future::join_all(tasks).await {
        assert_eq!(result.unwrap(), Ok(StatusCode::OK));
    }

    assert_eq!(backend.refresh_calls(), 1);
    // Every request: one rejected attempt plus one replay
    assert_eq!(backend.protected_calls(), 16);
    assert_eq!(client.session.get_token(), Some(backend.valid_token()));
    assert_eq!(
        client.session.get_user().and_then(|u| u.refresh_token).as_deref(),
        Some("refresh-1")
    );
    assert!(client.navigator.routes.lock().unwrap().is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_refresh_failure_fails_every_waiter() {
    let backend = MockBackend::start(BackendOptions {
        refresh_fails: true,
        ..BackendOptions::default()
    })
    .await;
    let client = connect(&backend, CredentialStore::in_memory(), Duration::from_secs(5));

    client.session.login("test@example.com", PASSWORD).await.unwrap();
    let rx = client.session.subscribe();
    assert!(rx.borrow().is_some());
    backend.invalidate();

    let tasks: Vec<_> = (0..5)
        .map(|_| tokio::spawn(fetch_library(client.http.clone())))
        .collect();

    for result in futures::future::join_all(tasks).await {
        let err = result.unwrap().unwrap_err();
        assert!(matches!(err, AuthError::RefreshFailed(_)), "unexpected error: {:?}", err);
    }

    // A 401 arriving after the session ended reports the same failure without a new refresh
    let late = fetch_library(client.http.clone()).await.unwrap_err();
    assert!(matches!(late, AuthError::RefreshFailed(_)), "unexpected error: {:?}", late);

    assert_eq!(backend.refresh_calls(), 1);
    assert!(!client.session.is_logged_in());
    assert!(client.session.get_user().is_none());
    assert!(rx.borrow().is_none());
    assert_eq!(client.navigator.routes.lock().unwrap().as_slice(), ["/login"]);
}

#[tokio::test]
async fn test_logout_during_refresh_stays_logged_out() {
    let backend = MockBackend::start(BackendOptions {
        refresh_delay: Duration::from_millis(300),
        ..BackendOptions::default()
    })
    .await;
    let client = connect(&backend, CredentialStore::in_memory(), Duration::from_secs(5));

    client.session.login("test@example.com", PASSWORD).await.unwrap();
    backend.invalidate();

    let pending = tokio::spawn(fetch_library(client.http.clone()));
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(client.session.is_refreshing().await);

    client.session.logout();
    let result = pending.await.unwrap();
    assert!(matches!(result, Err(AuthError::RefreshFailed(_))));

    assert_eq!(backend.refresh_calls(), 1);
    assert!(!client.session.is_logged_in());
    assert!(client.session.get_user().is_none());
    assert!(client.session.subscribe().borrow().is_none());
}

async fn relogin_while_refreshing(refresh_fails: bool) {
    let backend = MockBackend::start(BackendOptions {
        refresh_delay: Duration::from_millis(300),
        refresh_fails,
        ..BackendOptions::default()
    })
    .await;
    let client = connect(&backend, CredentialStore::in_memory(), Duration::from_secs(5));

    client.session.login("test@example.com", PASSWORD).await.unwrap();
    backend.invalidate();

    let pending = tokio::spawn(fetch_library(client.http.clone()));
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(client.session.is_refreshing().await);

    client.session.logout();
    let second = client.session.login("test@example.com", PASSWORD).await.unwrap();

    let result = pending.await.unwrap();
    assert!(matches!(result, Err(AuthError::RefreshFailed(_))), "{:?}", result);

    // The refresh belonged to the first session; the second one survives it
    assert!(client.session.is_logged_in());
    assert_eq!(client.session.get_token(), Some(second.access_token));
    assert!(client.session.current_user().is_some());
    assert_eq!(client.navigator.routes.lock().unwrap().as_slice(), ["/login"]);
    assert_eq!(backend.refresh_calls(), 1);
}

#[tokio::test]
async fn test_stale_refresh_success_keeps_new_session() {
    relogin_while_refreshing(false).await;
}

#[tokio::test]
async fn test_stale_refresh_failure_keeps_new_session() {
    relogin_while_refreshing(true).await;
}

#[tokio::test]
async fn test_refresh_timeout_forces_logout() {
    let backend = MockBackend::start(BackendOptions {
        refresh_delay: Duration::from_secs(2),
        ..BackendOptions::default()
    })
    .await;
    let client = connect(&backend, CredentialStore::in_memory(), Duration::from_millis(200));

    client.session.login("test@example.com", PASSWORD).await.unwrap();
    backend.invalidate();

    let err = fetch_library(client.http.clone()).await.unwrap_err();
    match err {
        AuthError::RefreshFailed(msg) => assert!(msg.contains("timed out"), "{}", msg),
        other => panic!("expected RefreshFailed, got {:?}", other),
    }
    assert!(!client.session.is_logged_in());
    assert!(!client.session.is_refreshing().await);
}

// ==================================================================================================
// Auth Endpoints
// ==================================================================================================

#[tokio::test]
async fn test_auth_endpoints_never_carry_token_or_refresh() {
    let backend = MockBackend::start(BackendOptions::default()).await;
    let client = connect(&backend, CredentialStore::in_memory(), Duration::from_secs(5));

    client.session.login("test@example.com", PASSWORD).await.unwrap();

    // Rejected login while a session exists leaves that session alone
    let err = client
        .session
        .login("test@example.com", "wrong-password")
        .await
        .unwrap_err();
    assert_eq!(
        err,
        AuthError::InvalidCredentials("Invalid email or password".to_string())
    );
    assert_eq!(client.session.get_token(), Some(backend.valid_token()));

    // Same call through the pipeline: the 401 is returned, not refreshed
    let request = client
        .http
        .post("/auth/login")
        .json(&json!({"email": "test@example.com", "password": "nope"}))
        .build()
        .unwrap();
    let response = client.http.execute(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

    let err = client
        .session
        .register(&RegisterRequest {
            first_name: "Taken".to_string(),
            last_name: "User".to_string(),
            email: "taken@example.com".to_string(),
            password: PASSWORD.to_string(),
            phone_number: None,
        })
        .await
        .unwrap_err();
    assert!(matches!(err, AuthError::EmailAlreadyInUse(_)));

    let request = client
        .http
        .post("/auth/register")
        .json(&json!({"email": "fresh@example.com"}))
        .build()
        .unwrap();
    assert_eq!(
        client.http.execute(request).await.unwrap().status(),
        StatusCode::CREATED
    );

    assert_eq!(backend.auth_header_leaks(), 0);
    assert_eq!(backend.refresh_calls(), 0);
    assert!(client.session.is_logged_in());
}

// ==================================================================================================
// Persistence
// ==================================================================================================

#[tokio::test]
async fn test_corrupted_user_is_purged_and_login_still_works() {
    let backend = MockBackend::start(BackendOptions::default()).await;
    let path = temp_db_path();

    {
        let storage = SqliteStorage::open(&path).unwrap();
        storage.set(TOKEN_KEY, "stale-token").unwrap();
        storage.set(USER_KEY, "{not json").unwrap();
    }

    let store = CredentialStore::new(Box::new(SqliteStorage::open(&path).unwrap()));
    assert!(store.get_user().is_none());
    assert!(store.current_user().is_none());

    let client = connect(&backend, store, Duration::from_secs(5));
    let session = client.session.login("test@example.com", PASSWORD).await.unwrap();
    assert_eq!(client.session.get_user().map(|u| u.id), Some(1));

    // A second process sees the persisted session
    let reopened = CredentialStore::new(Box::new(SqliteStorage::open(&path).unwrap()));
    assert_eq!(reopened.get_token(), Some(session.access_token));
    assert_eq!(
        reopened.current_user().and_then(|u| u.refresh_token).as_deref(),
        Some("refresh-0")
    );

    let _ = std::fs::remove_dir_all(path.parent().unwrap());
}

// ==================================================================================================
// Automatic Refresh
// ==================================================================================================

#[tokio::test]
async fn test_token_near_expiry_refreshes_immediately() {
    let backend = MockBackend::start(BackendOptions {
        refresh_delay: Duration::from_millis(10),
        login_expires_in: Some(30),
        ..BackendOptions::default()
    })
    .await;
    let client = connect(&backend, CredentialStore::in_memory(), Duration::from_secs(5));

    let session = client.session.login("test@example.com", PASSWORD).await.unwrap();
    let login_token = session.access_token;

    let mut rotated = None;
    for _ in 0..50 {
        match client.session.get_token() {
            Some(token) if token != login_token => {
                rotated = Some(token);
                break;
            }
            _ => tokio::time::sleep(Duration::from_millis(20)).await,
        }
    }

    let rotated = rotated.expect("token was not refreshed automatically");
    assert_eq!(rotated, backend.valid_token());
    assert_eq!(backend.refresh_calls(), 1);
    assert!(client.session.has_refresh_timer());
    assert!(client.session.is_logged_in());

    // The rotated token is accepted without another refresh
    assert_eq!(fetch_library(client.http.clone()).await, Ok(StatusCode::OK));
    assert_eq!(backend.refresh_calls(), 1);
}
