use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use thiserror::Error;

/// Transport-level error shared by every service in the workspace.
///
/// Variants carrying a stable `code` are user-facing; everything that ends up
/// as a 500 is rendered without its cause.
#[derive(Debug, Error)]
pub enum AppError {
    #[error("Validation error: {0}")]
    ValidationError(#[from] validator::ValidationErrors),

    #[error("Bad request: {message}")]
    BadRequest {
        code: &'static str,
        message: String,
        fields: Vec<FieldError>,
    },

    #[error("Not found: {message}")]
    NotFound { code: &'static str, message: String },

    #[error("Unauthorized: {message}")]
    Unauthorized { code: &'static str, message: String },

    #[error("Conflict: {message}")]
    Conflict { code: &'static str, message: String },

    #[error("Too many requests: {0}")]
    TooManyRequests(String, Option<u64>),

    #[error("Internal server error: {0}")]
    InternalError(#[from] anyhow::Error),

    #[error("Service Unavailable")]
    ServiceUnavailable,

    #[error("Database error: {0}")]
    DatabaseError(anyhow::Error),

    #[error("Redis error: {0}")]
    RedisError(#[from] redis::RedisError),

    #[error("Configuration error: {0}")]
    ConfigError(anyhow::Error),
}

/// A single field-level message, e.g. from an upstream validation payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FieldError {
    pub field: String,
    pub message: String,
}

impl AppError {
    pub fn bad_request(code: &'static str, message: impl Into<String>) -> Self {
        AppError::BadRequest {
            code,
            message: message.into(),
            fields: Vec::new(),
        }
    }

    pub fn unauthorized(message: impl Into<String>) -> Self {
        AppError::Unauthorized {
            code: "unauthorized",
            message: message.into(),
        }
    }

    pub fn status(&self) -> StatusCode {
        match self {
            AppError::ValidationError(_) => StatusCode::UNPROCESSABLE_ENTITY,
            AppError::BadRequest { .. } => StatusCode::BAD_REQUEST,
            AppError::NotFound { .. } => StatusCode::NOT_FOUND,
            AppError::Unauthorized { .. } => StatusCode::UNAUTHORIZED,
            AppError::Conflict { .. } => StatusCode::CONFLICT,
            AppError::TooManyRequests(..) => StatusCode::TOO_MANY_REQUESTS,
            AppError::ServiceUnavailable => StatusCode::SERVICE_UNAVAILABLE,
            AppError::InternalError(_)
            | AppError::DatabaseError(_)
            | AppError::RedisError(_)
            | AppError::ConfigError(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl From<config::ConfigError> for AppError {
    fn from(err: config::ConfigError) -> Self {
        AppError::ConfigError(anyhow::Error::new(err))
    }
}

impl From<std::io::Error> for AppError {
    fn from(err: std::io::Error) -> Self {
        AppError::InternalError(anyhow::Error::new(err))
    }
}

#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
    pub code: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub fields: Vec<FieldError>,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self.status();

        let (body, retry_after) = match self {
            AppError::ValidationError(err) => (
                ErrorResponse {
                    error: "Validation error".to_string(),
                    code: "validation".to_string(),
                    details: Some(err.to_string()),
                    fields: Vec::new(),
                },
                None,
            ),
            AppError::BadRequest {
                code,
                message,
                fields,
            } => (
                ErrorResponse {
                    error: message,
                    code: code.to_string(),
                    details: None,
                    fields,
                },
                None,
            ),
            AppError::NotFound { code, message }
            | AppError::Unauthorized { code, message }
            | AppError::Conflict { code, message } => (
                ErrorResponse {
                    error: message,
                    code: code.to_string(),
                    details: None,
                    fields: Vec::new(),
                },
                None,
            ),
            AppError::TooManyRequests(msg, retry) => (
                ErrorResponse {
                    error: msg,
                    code: "rate_limit_exceeded".to_string(),
                    details: None,
                    fields: Vec::new(),
                },
                retry,
            ),
            AppError::ServiceUnavailable => (
                ErrorResponse {
                    error: "Service unavailable".to_string(),
                    code: "service_unavailable".to_string(),
                    details: None,
                    fields: Vec::new(),
                },
                None,
            ),
            // Internal causes are logged where they happen and never echoed back.
            AppError::InternalError(_)
            | AppError::DatabaseError(_)
            | AppError::RedisError(_)
            | AppError::ConfigError(_) => (
                ErrorResponse {
                    error: "Internal server error".to_string(),
                    code: "internal".to_string(),
                    details: None,
                    fields: Vec::new(),
                },
                None,
            ),
        };

        let mut res = (status, Json(body)).into_response();

        if let Some(retry) = retry_after {
            res.headers_mut()
                .insert(axum::http::header::RETRY_AFTER, retry.into());
        }

        res
    }
}
