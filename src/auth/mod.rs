// Authentication module
// Manages the session lifecycle, credential persistence and token refresh

mod credentials;
mod manager;
mod refresh;
pub mod token;
mod types;

pub use credentials::{CredentialStore, TOKEN_KEY, USER_KEY};
pub use manager::{SessionManager, SessionOptions};
pub use refresh::RefreshOutcome;
pub use types::{RegisterRequest, RegisteredUser, Role, Session, UserRecord};
