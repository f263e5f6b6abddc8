// Profile operations
// Authenticated user endpoints that run through the authorization pipeline

use serde::Serialize;
use std::sync::Arc;

use crate::auth::UserRecord;
use crate::error::AuthError;
use crate::http_client::{expect_success, AuthorizedClient};

/// Fields a user may edit on their own profile; absent fields are left alone
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProfileUpdate {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub first_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub phone_number: Option<String>,
}

impl ProfileUpdate {
    pub fn is_empty(&self) -> bool {
        self.first_name.is_none() && self.last_name.is_none() && self.phone_number.is_none()
    }
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ChangePasswordRequest {
    pub current_password: String,
    pub new_password: String,
}

impl std::fmt::Debug for ChangePasswordRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("ChangePasswordRequest { .. }")
    }
}

/// Client for `/users/*`
pub struct ProfileClient {
    http: Arc<AuthorizedClient>,
}

impl ProfileClient {
    pub fn new(http: Arc<AuthorizedClient>) -> Self {
        Self { http }
    }

    /// GET /users/profile
    pub async fn get_profile(&self) -> Result<UserRecord, AuthError> {
        let request = self
            .http
            .get("/users/profile")
            .build()
            .map_err(|e| AuthError::from_transport(&e))?;
        self.http.send_json(request).await
    }

    /// PUT /users/profile, then store the returned record as the current user
    pub async fn update_profile(&self, update: &ProfileUpdate) -> Result<UserRecord, AuthError> {
        let request = self
            .http
            .put("/users/profile")
            .json(update)
            .build()
            .map_err(|e| AuthError::from_transport(&e))?;
        let user: UserRecord = self.http.send_json(request).await?;

        self.http.session().replace_user(user)?;
        tracing::info!("Profile updated");

        self.http
            .session()
            .current_user()
            .ok_or(AuthError::Unauthorized)
    }

    /// PUT /users/change-password
    pub async fn change_password(&self, request: &ChangePasswordRequest) -> Result<(), AuthError> {
        let request = self
            .http
            .put("/users/change-password")
            .json(request)
            .build()
            .map_err(|e| AuthError::from_transport(&e))?;
        expect_success(self.http.execute(request).await?).await?;
        tracing::info!("Password changed");
        Ok(())
    }
}
