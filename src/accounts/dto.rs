use lazy_static::lazy_static;
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::{
    auth::TokenPair,
    entity::{Authenticatable, EntityId},
    error::AppError,
};

pub const MIN_PASSWORD_LEN: usize = 6;

/// Response body for a successful registration.
#[derive(Debug, Serialize)]
pub struct RegisterResponse {
    #[serde(rename = "entityID")]
    pub entity_id: EntityId,
}

/// Response body for login and refresh. The same tokens are also set as
/// cookies.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TokenResponse {
    pub status: &'static str,
    pub access_token: String,
    pub refresh_token: String,
}

impl From<TokenPair> for TokenResponse {
    fn from(pair: TokenPair) -> Self {
        Self {
            status: "ok",
            access_token: pair.access_token,
            refresh_token: pair.refresh_token,
        }
    }
}

/// Request body for token refresh; falls back to the cookie when absent.
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RefreshRequest {
    pub refresh_token: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChangePasswordRequest {
    pub old_password: String,
    pub new_password: String,
}

#[derive(Debug, Serialize)]
pub struct MessageResponse {
    pub message: &'static str,
}

#[derive(Debug, Serialize)]
pub struct FavoritesResponse {
    pub favorites: Vec<EntityId>,
}

pub fn is_valid_email(email: &str) -> bool {
    lazy_static! {
        static ref EMAIL_RE: Regex = Regex::new(r"^[^@\s]+@[^@\s]+\.[^@\s]+$").unwrap();
    }
    EMAIL_RE.is_match(email.trim())
}

pub fn validate_password(password: &str) -> Result<(), AppError> {
    if password.chars().count() < MIN_PASSWORD_LEN {
        return Err(AppError::Validation("Password too short".into()));
    }
    Ok(())
}

/// Shape checks on the credentials carried by a register or login body.
pub fn validate_credentials(entity: &dyn Authenticatable) -> Result<(), AppError> {
    if !is_valid_email(entity.email()) {
        return Err(AppError::Validation("Invalid email".into()));
    }
    validate_password(entity.password())
}
