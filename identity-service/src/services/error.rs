use service_core::error::{AppError, FieldError};
use thiserror::Error;

use super::provider::{FieldMessage, ProviderError};
use super::store::StoreError;
use crate::models::IdentifierError;

/// Coarse error classes callers branch on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Validation,
    RateLimitExceeded,
    NotFound,
    Conflict,
    Unauthorized,
    Internal,
}

#[derive(Error, Debug)]
pub enum ServiceError {
    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Invalid identifier: {0}")]
    InvalidIdentifier(#[from] IdentifierError),

    #[error("Too many attempts, try again later")]
    RateLimitExceeded { retry_after: u64 },

    #[error("Challenge session not found or expired")]
    SessionNotFound,

    #[error("Tenant not found")]
    TenantNotFound,

    #[error("No identity is bound to this identifier")]
    IdentityNotFound,

    #[error("Identifier is already registered")]
    AlreadyRegistered,

    #[error("Identifier is already used by another user")]
    IdentifierAlreadyExists,

    #[error("User already has an identifier of this type")]
    IdentifierTypeAlreadyBound,

    #[error("Cannot delete the only identifier of a user")]
    CannotDeleteOnlyIdentifier,

    #[error("Tenant still has bound users")]
    TenantHasDependents,

    #[error("Invalid or expired session")]
    Unauthorized,

    #[error("Rejected by identity provider")]
    ProviderRejected(Vec<FieldMessage>),

    #[error("Identity provider flow is no longer valid: {0}")]
    FlowConflict(String),

    #[error("IAM registration failed: {0}")]
    IamRegistrationFailed(#[source] StoreError),

    #[error("Identity provider and store diverged: {0}")]
    Inconsistent(String),

    #[error("Identity provider error: {0}")]
    Provider(#[source] ProviderError),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Cache error: {0}")]
    Cache(#[source] anyhow::Error),

    #[error("Internal server error: {0}")]
    Internal(#[from] anyhow::Error),
}

impl ServiceError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            ServiceError::Validation(_)
            | ServiceError::InvalidIdentifier(_)
            | ServiceError::ProviderRejected(_) => ErrorKind::Validation,
            ServiceError::RateLimitExceeded { .. } => ErrorKind::RateLimitExceeded,
            ServiceError::SessionNotFound
            | ServiceError::TenantNotFound
            | ServiceError::IdentityNotFound => ErrorKind::NotFound,
            ServiceError::AlreadyRegistered
            | ServiceError::IdentifierAlreadyExists
            | ServiceError::IdentifierTypeAlreadyBound
            | ServiceError::CannotDeleteOnlyIdentifier
            | ServiceError::TenantHasDependents
            | ServiceError::FlowConflict(_) => ErrorKind::Conflict,
            ServiceError::Unauthorized => ErrorKind::Unauthorized,
            ServiceError::IamRegistrationFailed(_)
            | ServiceError::Inconsistent(_)
            | ServiceError::Provider(_)
            | ServiceError::Store(_)
            | ServiceError::Cache(_)
            | ServiceError::Internal(_) => ErrorKind::Internal,
        }
    }

    /// Stable machine-readable code.
    pub fn code(&self) -> &'static str {
        match self {
            ServiceError::Validation(_) => "validation",
            ServiceError::InvalidIdentifier(_) => "invalid_identifier",
            ServiceError::RateLimitExceeded { .. } => "rate_limit_exceeded",
            ServiceError::SessionNotFound => "session_not_found",
            ServiceError::TenantNotFound => "tenant_not_found",
            ServiceError::IdentityNotFound => "identity_not_found",
            ServiceError::AlreadyRegistered => "already_registered",
            ServiceError::IdentifierAlreadyExists => "identifier_already_exists",
            ServiceError::IdentifierTypeAlreadyBound => "identifier_type_already_bound",
            ServiceError::CannotDeleteOnlyIdentifier => "cannot_delete_only_identifier",
            ServiceError::TenantHasDependents => "tenant_has_dependents",
            ServiceError::Unauthorized => "unauthorized",
            ServiceError::ProviderRejected(_) => "provider_rejected",
            ServiceError::FlowConflict(_) => "flow_conflict",
            ServiceError::IamRegistrationFailed(_) => "iam_registration_failed",
            ServiceError::Inconsistent(_) => "inconsistent_state",
            ServiceError::Provider(_) => "provider_error",
            ServiceError::Store(_) => "store_error",
            ServiceError::Cache(_) => "cache_error",
            ServiceError::Internal(_) => "internal_error",
        }
    }
}

/// Provider failures that are the caller's doing stay typed; the rest are internal.
impl From<ProviderError> for ServiceError {
    fn from(err: ProviderError) -> Self {
        match err {
            ProviderError::ValidationRejected(messages) => ServiceError::ProviderRejected(messages),
            ProviderError::StateConflict(reason) => ServiceError::FlowConflict(reason),
            ProviderError::Unauthorized => ServiceError::Unauthorized,
            other => ServiceError::Provider(other),
        }
    }
}

impl From<ServiceError> for AppError {
    fn from(err: ServiceError) -> Self {
        let code = err.code();
        let message = err.to_string();

        match err {
            ServiceError::ProviderRejected(messages) => AppError::BadRequest {
                code,
                message,
                fields: messages
                    .into_iter()
                    .map(|m| FieldError {
                        field: m.field.unwrap_or_else(|| "flow".to_string()),
                        message: m.message,
                    })
                    .collect(),
            },
            ServiceError::RateLimitExceeded { retry_after } => {
                AppError::TooManyRequests(message, Some(retry_after))
            }
            ServiceError::Unauthorized => AppError::Unauthorized { code, message },
            err => match err.kind() {
                ErrorKind::Validation => AppError::bad_request(code, message),
                ErrorKind::NotFound => AppError::NotFound { code, message },
                ErrorKind::Conflict => AppError::Conflict { code, message },
                ErrorKind::Unauthorized => AppError::Unauthorized { code, message },
                ErrorKind::RateLimitExceeded => AppError::TooManyRequests(message, None),
                ErrorKind::Internal => {
                    tracing::error!(code, error = %err, "Internal service error");
                    match err {
                        ServiceError::Store(e) => AppError::DatabaseError(anyhow::Error::new(e)),
                        other => AppError::InternalError(anyhow::Error::new(other)),
                    }
                }
            },
        }
    }
}
