use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use thiserror::Error;
use tracing::error;

/// Every failure an endpoint can surface.
#[derive(Debug, Error)]
pub enum AppError {
    #[error("{0}")]
    Validation(String),

    #[error("Please provide email and password")]
    MissingCredentials,

    #[error("Incorrect email or password")]
    InvalidCredentials,

    #[error("You are not logged in")]
    Unauthenticated,

    #[error("Invalid token")]
    InvalidToken,

    #[error("Your token has expired")]
    ExpiredToken,

    #[error("Password was changed recently, please log in again")]
    StalePassword,

    #[error("No user found")]
    UserNotFound,

    #[error("You do not have permission to perform this action")]
    Forbidden,

    #[error("Token is invalid or has expired")]
    TokenInvalidOrExpired,

    #[error("There was an error sending the email: {0}")]
    EmailDelivery(String),

    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl AppError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            AppError::Validation(_)
            | AppError::MissingCredentials
            | AppError::TokenInvalidOrExpired => StatusCode::BAD_REQUEST,
            AppError::InvalidCredentials
            | AppError::Unauthenticated
            | AppError::InvalidToken
            | AppError::ExpiredToken
            | AppError::StalePassword => StatusCode::UNAUTHORIZED,
            AppError::Forbidden => StatusCode::FORBIDDEN,
            AppError::UserNotFound => StatusCode::NOT_FOUND,
            AppError::EmailDelivery(_) | AppError::Internal(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }

    pub fn error_code(&self) -> &'static str {
        match self {
            AppError::Validation(_) => "VALIDATION_ERROR",
            AppError::MissingCredentials => "MISSING_CREDENTIALS",
            AppError::InvalidCredentials => "INVALID_CREDENTIALS",
            AppError::Unauthenticated => "UNAUTHENTICATED",
            AppError::InvalidToken => "INVALID_TOKEN",
            AppError::ExpiredToken => "EXPIRED_TOKEN",
            AppError::StalePassword => "STALE_PASSWORD",
            AppError::UserNotFound => "USER_NOT_FOUND",
            AppError::Forbidden => "FORBIDDEN",
            AppError::TokenInvalidOrExpired => "RESET_TOKEN_INVALID",
            AppError::EmailDelivery(_) => "EMAIL_DELIVERY_ERROR",
            AppError::Internal(_) => "INTERNAL_ERROR",
        }
    }

    /// Message safe to hand to the client.
    fn public_message(&self) -> String {
        match self {
            AppError::Internal(_) => "Something went wrong".to_string(),
            AppError::EmailDelivery(_) => {
                "There was an error sending the email. Try again later".to_string()
            }
            other => other.to_string(),
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        if status.is_server_error() {
            error!(error = %self, code = self.error_code(), "request failed");
        }

        let body = Json(json!({
            "status": if status.is_server_error() { "error" } else { "fail" },
            "error": {
                "code": self.error_code(),
                "message": self.public_message(),
            }
        }));

        (status, body).into_response()
    }
}
