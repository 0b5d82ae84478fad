use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
};
use thiserror::Error;
use tracing::error;

use crate::store::StoreError;

pub type AppResult<T> = Result<T, AppError>;

/// Failure taxonomy shared by the services and the HTTP layer.
///
/// Credential and token variants stay distinct for logging but collapse to
/// generic bodies on the wire, so callers cannot probe which accounts exist.
#[derive(Debug, Error)]
pub enum AppError {
    #[error("validation failed: {0}")]
    Validation(String),

    #[error("email already registered")]
    DuplicateEmail,

    #[error("entity not found")]
    NotFound,

    #[error("invalid credentials")]
    InvalidCredentials,

    #[error("old password does not match")]
    InvalidOldPassword,

    #[error("invalid token")]
    InvalidToken,

    #[error("token expired")]
    ExpiredToken,

    #[error("forbidden")]
    Forbidden,

    #[error(transparent)]
    Infrastructure(#[from] anyhow::Error),
}

impl AppError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            AppError::Validation(_) | AppError::InvalidOldPassword => StatusCode::BAD_REQUEST,
            AppError::DuplicateEmail => StatusCode::CONFLICT,
            AppError::NotFound => StatusCode::NOT_FOUND,
            AppError::InvalidCredentials | AppError::InvalidToken | AppError::ExpiredToken => {
                StatusCode::UNAUTHORIZED
            }
            AppError::Forbidden => StatusCode::FORBIDDEN,
            AppError::Infrastructure(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn public_message(&self) -> String {
        match self {
            AppError::Validation(msg) => msg.clone(),
            AppError::DuplicateEmail => "Email already registered".into(),
            AppError::NotFound => "Not found".into(),
            AppError::InvalidCredentials => "Invalid credentials".into(),
            AppError::InvalidOldPassword => "Old password is incorrect".into(),
            AppError::InvalidToken | AppError::ExpiredToken => "Invalid or expired token".into(),
            AppError::Forbidden => "Forbidden".into(),
            AppError::Infrastructure(_) => "Internal server error".into(),
        }
    }

    /// Login must not reveal whether the email exists.
    pub fn collapse_credentials(self) -> Self {
        match self {
            AppError::NotFound => AppError::InvalidCredentials,
            other => other,
        }
    }
}

impl From<StoreError> for AppError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::Conflict => AppError::DuplicateEmail,
            StoreError::Backend(e) => AppError::Infrastructure(e),
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        if let AppError::Infrastructure(e) = &self {
            error!(error = %format!("{e:#}"), "infrastructure failure");
        }
        (self.status_code(), self.public_message()).into_response()
    }
}
