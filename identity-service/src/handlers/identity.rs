//! Unauthenticated flows: registration, login and challenge confirmation.

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
    Json,
};
use service_core::error::AppError;
use uuid::Uuid;

use crate::{
    dtos::identity::{
        EmailChallengeRequest, LoginRequest, PhoneChallengeRequest, RegisterRequest,
        VerifyCodeRequest,
    },
    utils::ValidatedJson,
    AppState,
};

/// Start a registration; the provider sends a one-time code.
pub async fn register(
    State(state): State<AppState>,
    Path(tenant_id): Path<Uuid>,
    ValidatedJson(req): ValidatedJson<RegisterRequest>,
) -> Result<impl IntoResponse, AppError> {
    let res = state
        .identity
        .register(tenant_id, &req.identifier, req.lang.as_deref())
        .await?;
    Ok((StatusCode::ACCEPTED, Json(res)))
}

pub async fn verify_register(
    State(state): State<AppState>,
    Path(tenant_id): Path<Uuid>,
    ValidatedJson(req): ValidatedJson<VerifyCodeRequest>,
) -> Result<impl IntoResponse, AppError> {
    let res = state
        .identity
        .verify_register(tenant_id, &req.flow_id, &req.code)
        .await?;
    Ok((StatusCode::CREATED, Json(res)))
}

/// Password login, or a code challenge when no password is sent.
pub async fn login(
    State(state): State<AppState>,
    Path(tenant_id): Path<Uuid>,
    ValidatedJson(req): ValidatedJson<LoginRequest>,
) -> Result<impl IntoResponse, AppError> {
    let res = state
        .identity
        .login(tenant_id, &req.identifier, req.password)
        .await?;
    Ok((StatusCode::OK, Json(res)))
}

pub async fn verify_login(
    State(state): State<AppState>,
    Path(tenant_id): Path<Uuid>,
    ValidatedJson(req): ValidatedJson<VerifyCodeRequest>,
) -> Result<impl IntoResponse, AppError> {
    let res = state
        .identity
        .verify_login(tenant_id, &req.flow_id, &req.code)
        .await?;
    Ok((StatusCode::OK, Json(res)))
}

pub async fn challenge_email(
    State(state): State<AppState>,
    Path(tenant_id): Path<Uuid>,
    ValidatedJson(req): ValidatedJson<EmailChallengeRequest>,
) -> Result<impl IntoResponse, AppError> {
    let res = state
        .identity
        .challenge_with_email(tenant_id, &req.email)
        .await?;
    Ok((StatusCode::ACCEPTED, Json(res)))
}

pub async fn challenge_phone(
    State(state): State<AppState>,
    Path(tenant_id): Path<Uuid>,
    ValidatedJson(req): ValidatedJson<PhoneChallengeRequest>,
) -> Result<impl IntoResponse, AppError> {
    let res = state
        .identity
        .challenge_with_phone(tenant_id, &req.phone)
        .await?;
    Ok((StatusCode::ACCEPTED, Json(res)))
}

pub async fn verify_challenge(
    State(state): State<AppState>,
    Path(tenant_id): Path<Uuid>,
    ValidatedJson(req): ValidatedJson<VerifyCodeRequest>,
) -> Result<impl IntoResponse, AppError> {
    let res = state
        .identity
        .challenge_verification(tenant_id, &req.flow_id, &req.code)
        .await?;
    Ok((StatusCode::OK, Json(res)))
}
