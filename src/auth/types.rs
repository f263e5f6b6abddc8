// Authentication types

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Role name the backend uses for administrators
const ADMIN_ROLE: &str = "ADMIN";

/// A role attached to a user.
/// The backend sends either `{ "id": 1, "name": "ADMIN" }` or a bare `"ROLE_ADMIN"`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "RoleRepr")]
pub struct Role {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<i64>,
    pub name: String,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum RoleRepr {
    Name(String),
    Full {
        #[serde(default)]
        id: Option<i64>,
        name: String,
    },
}

impl From<RoleRepr> for Role {
    fn from(repr: RoleRepr) -> Self {
        match repr {
            RoleRepr::Name(name) => Role { id: None, name },
            RoleRepr::Full { id, name } => Role { id, name },
        }
    }
}

impl Role {
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            id: None,
            name: name.into(),
        }
    }

    /// `ADMIN` and `ROLE_ADMIN` both count, case-insensitively
    pub fn is_admin(&self) -> bool {
        let name = self.name.trim();
        let bare = match name.get(..5) {
            Some(prefix) if prefix.eq_ignore_ascii_case("ROLE_") => &name[5..],
            _ => name,
        };
        bare.eq_ignore_ascii_case(ADMIN_ROLE)
    }
}

/// Persisted user record.
/// The refresh token travels inside this record; unknown backend fields are
/// kept in `extra` so a re-save never drops them.
#[derive(Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserRecord {
    pub id: i64,
    pub email: String,
    #[serde(default)]
    pub first_name: String,
    #[serde(default)]
    pub last_name: String,
    #[serde(default)]
    pub roles: Vec<Role>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub refresh_token: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl UserRecord {
    pub fn is_admin(&self) -> bool {
        self.roles.iter().any(Role::is_admin)
    }

    pub fn display_name(&self) -> String {
        let name = format!("{} {}", self.first_name, self.last_name);
        let name = name.trim();
        if name.is_empty() {
            self.email.clone()
        } else {
            name.to_string()
        }
    }
}

// Keeps the refresh token out of logs
impl std::fmt::Debug for UserRecord {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UserRecord")
            .field("id", &self.id)
            .field("email", &self.email)
            .field("first_name", &self.first_name)
            .field("last_name", &self.last_name)
            .field("roles", &self.roles)
            .field("has_refresh_token", &self.refresh_token.is_some())
            .finish()
    }
}

/// An authenticated session as returned by login
#[derive(Clone)]
pub struct Session {
    pub access_token: String,
    pub user: UserRecord,
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("access_token", &super::token::preview(&self.access_token))
            .field("user", &self.user)
            .finish()
    }
}

/// POST /auth/login body
#[derive(Serialize)]
pub struct LoginRequest<'a> {
    pub email: &'a str,
    pub password: &'a str,
}

/// POST /auth/login response
#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LoginResponse {
    #[serde(alias = "token")]
    pub access_token: String,
    #[serde(default)]
    pub refresh_token: Option<String>,
    pub user: UserRecord,
}

/// POST /auth/register body
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RegisterRequest {
    pub first_name: String,
    pub last_name: String,
    pub email: String,
    pub password: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub phone_number: Option<String>,
}

/// POST /auth/register response; the backend echoes the created account
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegisteredUser {
    #[serde(default)]
    pub id: Option<i64>,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// POST /auth/refresh-token body
#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RefreshRequest<'a> {
    pub refresh_token: &'a str,
}

/// POST /auth/refresh-token response
#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RefreshResponse {
    #[serde(alias = "accessToken")]
    pub token: String,
    #[serde(default)]
    pub refresh_token: Option<String>,
}
