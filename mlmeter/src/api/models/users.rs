//! API request/response models for accounts and authentication.

use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

/// Username and password, used to sign up, log in and remove an account
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct UserCredentials {
    pub username: String,
    #[schema(format = "password")]
    pub password: String,
}

/// A freshly created account
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct UserResponse {
    pub username: String,
    /// Starting token balance
    pub tokens: u64,
}

/// Session token returned by a successful login
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct TokenResponse {
    pub access_token: String,
    /// Always `bearer`
    pub token_type: String,
}

impl TokenResponse {
    pub fn bearer(access_token: String) -> Self {
        Self {
            access_token,
            token_type: "bearer".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct MessageResponse {
    pub message: String,
}
