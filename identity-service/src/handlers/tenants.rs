//! Tenant administration, behind the admin API key.

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
    Json,
};
use service_core::error::AppError;
use uuid::Uuid;

use crate::{
    models::{CreateTenantRequest, UpdateTenantRequest},
    utils::ValidatedJson,
    AppState,
};

pub async fn create_tenant(
    State(state): State<AppState>,
    ValidatedJson(req): ValidatedJson<CreateTenantRequest>,
) -> Result<impl IntoResponse, AppError> {
    let tenant = state.identity.create_tenant(req).await?;
    Ok((StatusCode::CREATED, Json(tenant)))
}

pub async fn list_tenants(State(state): State<AppState>) -> Result<impl IntoResponse, AppError> {
    let tenants = state.identity.list_tenants().await?;
    Ok(Json(tenants))
}

pub async fn get_tenant(
    State(state): State<AppState>,
    Path(tenant_id): Path<Uuid>,
) -> Result<impl IntoResponse, AppError> {
    let tenant = state.identity.get_tenant(tenant_id).await?;
    Ok(Json(tenant))
}

pub async fn update_tenant(
    State(state): State<AppState>,
    Path(tenant_id): Path<Uuid>,
    ValidatedJson(req): ValidatedJson<UpdateTenantRequest>,
) -> Result<impl IntoResponse, AppError> {
    let tenant = state.identity.update_tenant(tenant_id, req).await?;
    Ok(Json(tenant))
}

pub async fn delete_tenant(
    State(state): State<AppState>,
    Path(tenant_id): Path<Uuid>,
) -> Result<impl IntoResponse, AppError> {
    state.identity.delete_tenant(tenant_id).await?;
    Ok(StatusCode::NO_CONTENT)
}
