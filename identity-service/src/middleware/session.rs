use axum::{
    extract::{FromRequestParts, RawPathParams, Request, State},
    http::{header, request::Parts, HeaderMap},
    middleware::Next,
    response::Response,
};
use service_core::error::AppError;
use uuid::Uuid;

use crate::{models::Principal, AppState};

pub const SESSION_TOKEN_HEADER: &str = "x-session-token";

/// The raw provider session token presented by the caller.
#[derive(Debug, Clone)]
pub struct SessionToken(pub String);

/// Session token from `Authorization: Bearer` or `X-Session-Token`.
pub fn session_token(headers: &HeaderMap) -> Option<String> {
    let bearer = headers
        .get(header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.strip_prefix("Bearer "));
    let explicit = headers
        .get(SESSION_TOKEN_HEADER)
        .and_then(|value| value.to_str().ok());

    bearer
        .or(explicit)
        .map(str::trim)
        .filter(|token| !token.is_empty())
        .map(str::to_string)
}

/// Require a live provider session bound in the tenant named by the path.
pub async fn session_auth_middleware(
    State(state): State<AppState>,
    params: RawPathParams,
    mut req: Request,
    next: Next,
) -> Result<Response, AppError> {
    let token = session_token(req.headers())
        .ok_or_else(|| AppError::unauthorized("Missing session token"))?;

    let tenant_id = params
        .iter()
        .find(|(key, _)| *key == "tenant_id")
        .and_then(|(_, value)| Uuid::parse_str(value).ok())
        .ok_or_else(|| AppError::bad_request("invalid_tenant", "Invalid tenant id"))?;

    let principal = state.identity.resolve_principal(tenant_id, &token).await?;

    req.extensions_mut().insert(principal);
    req.extensions_mut().insert(SessionToken(token));

    Ok(next.run(req).await)
}

/// Extractor for the principal resolved by `session_auth_middleware`.
pub struct CurrentUser(pub Principal);

#[axum::async_trait]
impl<S> FromRequestParts<S> for CurrentUser
where
    S: Send + Sync,
{
    type Rejection = AppError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        parts
            .extensions
            .get::<Principal>()
            .cloned()
            .map(CurrentUser)
            .ok_or_else(|| AppError::unauthorized("Session missing from request"))
    }
}

#[axum::async_trait]
impl<S> FromRequestParts<S> for SessionToken
where
    S: Send + Sync,
{
    type Rejection = AppError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        if let Some(token) = parts.extensions.get::<SessionToken>() {
            return Ok(token.clone());
        }
        session_token(&parts.headers)
            .map(SessionToken)
            .ok_or_else(|| AppError::unauthorized("Missing session token"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    #[test]
    fn bearer_token_wins_over_explicit_header() {
        let mut headers = HeaderMap::new();
        headers.insert(header::AUTHORIZATION, HeaderValue::from_static("Bearer abc"));
        headers.insert(SESSION_TOKEN_HEADER, HeaderValue::from_static("xyz"));
        assert_eq!(session_token(&headers), Some("abc".to_string()));
    }

    #[test]
    fn explicit_header_is_accepted() {
        let mut headers = HeaderMap::new();
        headers.insert(SESSION_TOKEN_HEADER, HeaderValue::from_static("xyz"));
        assert_eq!(session_token(&headers), Some("xyz".to_string()));

        assert_eq!(session_token(&HeaderMap::new()), None);
    }
}
