//! Flows that need a live provider session.

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
    Json,
};
use service_core::error::AppError;
use uuid::Uuid;

use crate::{
    dtos::{
        identity::{IdentifierRequest, UpdateLangRequest},
        MessageResponse,
    },
    middleware::{CurrentUser, SessionToken},
    models::IdentifierType,
    utils::ValidatedJson,
    AppState,
};

pub async fn get_me(
    State(state): State<AppState>,
    Path(tenant_id): Path<Uuid>,
    SessionToken(token): SessionToken,
) -> Result<impl IntoResponse, AppError> {
    let user = state.identity.profile(tenant_id, &token).await?;
    Ok(Json(user))
}

pub async fn update_lang(
    State(state): State<AppState>,
    Path(tenant_id): Path<Uuid>,
    SessionToken(token): SessionToken,
    ValidatedJson(req): ValidatedJson<UpdateLangRequest>,
) -> Result<impl IntoResponse, AppError> {
    let user = state
        .identity
        .update_lang(tenant_id, &token, &req.lang)
        .await?;
    Ok(Json(user))
}

pub async fn refresh(
    State(state): State<AppState>,
    Path(tenant_id): Path<Uuid>,
    SessionToken(token): SessionToken,
) -> Result<impl IntoResponse, AppError> {
    let res = state.identity.refresh_token(tenant_id, &token).await?;
    Ok(Json(res))
}

pub async fn logout(
    State(state): State<AppState>,
    Path(tenant_id): Path<Uuid>,
    SessionToken(token): SessionToken,
) -> Result<impl IntoResponse, AppError> {
    state.identity.logout(tenant_id, &token).await?;
    Ok((
        StatusCode::OK,
        Json(MessageResponse::new("Logged out successfully")),
    ))
}

/// Start binding another identifier; confirmed through register/verify.
pub async fn add_identifier(
    State(state): State<AppState>,
    Path(tenant_id): Path<Uuid>,
    CurrentUser(principal): CurrentUser,
    ValidatedJson(req): ValidatedJson<IdentifierRequest>,
) -> Result<impl IntoResponse, AppError> {
    let res = state
        .identity
        .add_new_identifier(
            tenant_id,
            principal.global_user_id,
            &principal.tenant_user_id,
            &req.identifier,
        )
        .await?;
    Ok((StatusCode::ACCEPTED, Json(res)))
}

/// Start replacing an identifier; confirmed through challenge/verify.
pub async fn change_identifier(
    State(state): State<AppState>,
    Path(tenant_id): Path<Uuid>,
    CurrentUser(principal): CurrentUser,
    ValidatedJson(req): ValidatedJson<IdentifierRequest>,
) -> Result<impl IntoResponse, AppError> {
    let res = state
        .identity
        .change_identifier(
            tenant_id,
            principal.global_user_id,
            &principal.tenant_user_id,
            &req.identifier,
        )
        .await?;
    Ok((StatusCode::ACCEPTED, Json(res)))
}

pub async fn delete_identifier(
    State(state): State<AppState>,
    Path((tenant_id, identifier_type)): Path<(Uuid, IdentifierType)>,
    CurrentUser(principal): CurrentUser,
) -> Result<impl IntoResponse, AppError> {
    let user = state
        .identity
        .delete_identifier(
            tenant_id,
            principal.global_user_id,
            &principal.tenant_user_id,
            identifier_type,
        )
        .await?;
    Ok(Json(user))
}
