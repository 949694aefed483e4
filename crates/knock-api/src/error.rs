//! HTTP error mapping for the REST surface.

use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde::Serialize;
use thiserror::Error;
use tracing::error;

use knock_core::RelationshipError;

#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
    pub message: String,
}

#[derive(Debug, Error)]
pub enum ApiError {
    #[error(transparent)]
    Relationship(#[from] RelationshipError),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Authentication failed")]
    Unauthorized,

    #[error("Username already taken")]
    UsernameTaken,

    #[error("Internal server error: {0}")]
    Internal(#[from] anyhow::Error),
}

impl ApiError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            ApiError::Relationship(e) => match e {
                RelationshipError::SelfTarget => StatusCode::BAD_REQUEST,
                RelationshipError::TargetNotFound
                | RelationshipError::EdgeNotFoundOrNotEligible
                | RelationshipError::ChatNotFound => StatusCode::NOT_FOUND,
                RelationshipError::DuplicateEdge => StatusCode::CONFLICT,
                RelationshipError::ChatRestricted | RelationshipError::NotChatParticipant => {
                    StatusCode::FORBIDDEN
                }
                RelationshipError::Unavailable => StatusCode::SERVICE_UNAVAILABLE,
                RelationshipError::Storage(_) => StatusCode::INTERNAL_SERVER_ERROR,
            },
            ApiError::Validation(_) => StatusCode::BAD_REQUEST,
            ApiError::Unauthorized => StatusCode::UNAUTHORIZED,
            ApiError::UsernameTaken => StatusCode::CONFLICT,
            ApiError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    pub fn error_type(&self) -> &'static str {
        match self {
            ApiError::Relationship(e) => e.code(),
            ApiError::Validation(_) => "validation_error",
            ApiError::Unauthorized => "authentication_error",
            ApiError::UsernameTaken => "username_taken",
            ApiError::Internal(_) => "internal_error",
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status_code();

        // Storage details stay in the log
        let message = if status == StatusCode::INTERNAL_SERVER_ERROR {
            error!("Request failed: {:#}", self);
            "internal server error".to_string()
        } else {
            self.to_string()
        };

        let body = ErrorResponse {
            error: self.error_type().to_string(),
            message,
        };
        (status, Json(body)).into_response()
    }
}

pub type ApiResult<T> = Result<T, ApiError>;

/// Run blocking store work off the async runtime.
pub async fn run_blocking<F, T>(f: F) -> ApiResult<T>
where
    F: FnOnce() -> ApiResult<T> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f).await.map_err(|e| {
        error!("spawn_blocking join error: {}", e);
        ApiError::Internal(e.into())
    })?
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn domain_errors_map_to_statuses() {
        let cases = [
            (RelationshipError::SelfTarget, StatusCode::BAD_REQUEST, "self_target"),
            (RelationshipError::TargetNotFound, StatusCode::NOT_FOUND, "target_not_found"),
            (RelationshipError::DuplicateEdge, StatusCode::CONFLICT, "duplicate_edge"),
            (RelationshipError::ChatRestricted, StatusCode::FORBIDDEN, "chat_restricted"),
            (RelationshipError::Unavailable, StatusCode::SERVICE_UNAVAILABLE, "service_unavailable"),
        ];
        for (err, status, code) in cases {
            let api = ApiError::from(err);
            assert_eq!(api.status_code(), status);
            assert_eq!(api.error_type(), code);
        }
    }

    #[test]
    fn restricted_message_is_user_facing() {
        let api = ApiError::from(RelationshipError::ChatRestricted);
        assert_eq!(api.to_string(), "recipient must reply to unlock");
    }

    #[test]
    fn storage_errors_are_internal() {
        let api = ApiError::from(RelationshipError::Storage(anyhow::anyhow!("disk full")));
        assert_eq!(api.status_code(), StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(api.error_type(), "storage_error");
    }
}
