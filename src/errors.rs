use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;

pub type AppResult<T> = Result<T, AppError>;

#[derive(thiserror::Error, Debug)]
pub enum AppError {
    #[error("unauthorized: {0}")]
    Unauthorized(String),
    #[error("no privileges in organization: {0}")]
    NoMembership(String),
    #[error("missing permission: {0}")]
    MissingPermission(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("entity is deleted: {0}")]
    AlreadyDeleted(String),
    #[error("invalid transition: {0}")]
    InvalidTransition(String),
    #[error("constraint violation: {0}")]
    ConstraintViolation(String),
    #[error("conflict: {0}")]
    Conflict(String),
    #[error("bad request: {0}")]
    BadRequest(String),
    #[error("configuration error: {0}")]
    Configuration(String),
    #[error("token error: {0}")]
    Token(String),
    #[error("database error")]
    Database(#[from] sqlx::Error),
    #[error("internal server error: {0}")]
    Internal(String),
}

impl AppError {
    pub fn unauthorized(message: impl Into<String>) -> Self {
        Self::Unauthorized(message.into())
    }

    pub fn no_membership(message: impl Into<String>) -> Self {
        Self::NoMembership(message.into())
    }

    pub fn missing_permission(message: impl Into<String>) -> Self {
        Self::MissingPermission(message.into())
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::NotFound(message.into())
    }

    pub fn already_deleted(message: impl Into<String>) -> Self {
        Self::AlreadyDeleted(message.into())
    }

    pub fn invalid_transition(message: impl Into<String>) -> Self {
        Self::InvalidTransition(message.into())
    }

    pub fn constraint_violation(message: impl Into<String>) -> Self {
        Self::ConstraintViolation(message.into())
    }

    pub fn conflict(message: impl Into<String>) -> Self {
        Self::Conflict(message.into())
    }

    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::BadRequest(message.into())
    }

    pub fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration(message.into())
    }

    pub fn token(err: impl Into<String>) -> Self {
        Self::Token(err.into())
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal(message.into())
    }

    /// Stable machine-readable discriminant, also used as the per-id error
    /// key in batch responses.
    pub fn kind(&self) -> &'static str {
        match self {
            AppError::Unauthorized(_) => "unauthorized",
            AppError::NoMembership(_) => "no_membership",
            AppError::MissingPermission(_) => "missing_permission",
            AppError::NotFound(_) => "not_found",
            AppError::AlreadyDeleted(_) => "already_deleted",
            AppError::InvalidTransition(_) => "invalid_transition",
            AppError::ConstraintViolation(_) => "constraint_violation",
            AppError::Conflict(_) => "conflict",
            AppError::BadRequest(_) => "bad_request",
            AppError::Configuration(_) => "configuration",
            AppError::Token(_) => "token",
            AppError::Database(_) => "database",
            AppError::Internal(_) => "internal",
        }
    }

    fn status(&self) -> StatusCode {
        match self {
            AppError::Unauthorized(_) | AppError::Token(_) => StatusCode::UNAUTHORIZED,
            AppError::NoMembership(_) | AppError::MissingPermission(_) => StatusCode::FORBIDDEN,
            AppError::NotFound(_) => StatusCode::NOT_FOUND,
            AppError::AlreadyDeleted(_)
            | AppError::InvalidTransition(_)
            | AppError::ConstraintViolation(_)
            | AppError::Conflict(_) => StatusCode::CONFLICT,
            AppError::BadRequest(_) => StatusCode::BAD_REQUEST,
            AppError::Configuration(_) | AppError::Database(_) | AppError::Internal(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }
}

#[derive(Serialize)]
struct ErrorResponse {
    error: String,
    message: String,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self.status();

        // Store failures must not leak driver internals to the client.
        let message = match &self {
            AppError::Database(err) => {
                tracing::error!(error = %err, "database error");
                "database error".to_string()
            }
            other => other.to_string(),
        };

        let payload = ErrorResponse {
            error: self.kind().to_string(),
            message,
        };

        (status, Json(payload)).into_response()
    }
}

impl From<anyhow::Error> for AppError {
    fn from(value: anyhow::Error) -> Self {
        Self::Internal(value.to_string())
    }
}
