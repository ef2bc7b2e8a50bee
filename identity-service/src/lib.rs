pub mod config;
pub mod dtos;
pub mod handlers;
pub mod middleware;
pub mod models;
pub mod services;
pub mod utils;

use axum::{
    extract::State,
    http::{header, HeaderName, HeaderValue, Method, Request},
    middleware::{from_fn, from_fn_with_state},
    routing::{delete, get, patch, post},
    Json, Router,
};
use service_core::error::AppError;
use service_core::middleware::{
    rate_limit::{ip_rate_limit_middleware, IpRateLimiter},
    tracing::{request_id_middleware, REQUEST_ID_HEADER},
};
use std::sync::Arc;
use tower_http::{cors::CorsLayer, trace::TraceLayer};

use crate::config::IdentityConfig;
use crate::middleware::session::SESSION_TOKEN_HEADER;
use crate::services::IdentityService;

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<IdentityConfig>,
    pub identity: IdentityService,
    pub ip_rate_limiter: IpRateLimiter,
}

pub fn build_router(state: AppState) -> Router {
    let admin_routes = Router::new()
        .route(
            "/admin/tenants",
            post(handlers::tenants::create_tenant).get(handlers::tenants::list_tenants),
        )
        .route(
            "/admin/tenants/:tenant_id",
            get(handlers::tenants::get_tenant)
                .put(handlers::tenants::update_tenant)
                .delete(handlers::tenants::delete_tenant),
        )
        .layer(from_fn_with_state(
            state.clone(),
            middleware::admin_auth_middleware,
        ));

    let identifier_routes = Router::new()
        .route(
            "/v1/tenants/:tenant_id/identifiers",
            post(handlers::session::add_identifier).put(handlers::session::change_identifier),
        )
        .route(
            "/v1/tenants/:tenant_id/identifiers/:identifier_type",
            delete(handlers::session::delete_identifier),
        )
        .route_layer(from_fn_with_state(
            state.clone(),
            middleware::session_auth_middleware,
        ));

    let ip_limiter = state.ip_rate_limiter.clone();

    Router::new()
        .route("/health", get(health_check))
        .route(
            "/v1/tenants/:tenant_id/register",
            post(handlers::identity::register),
        )
        .route(
            "/v1/tenants/:tenant_id/register/verify",
            post(handlers::identity::verify_register),
        )
        .route("/v1/tenants/:tenant_id/login", post(handlers::identity::login))
        .route(
            "/v1/tenants/:tenant_id/login/verify",
            post(handlers::identity::verify_login),
        )
        .route(
            "/v1/tenants/:tenant_id/challenge/email",
            post(handlers::identity::challenge_email),
        )
        .route(
            "/v1/tenants/:tenant_id/challenge/phone",
            post(handlers::identity::challenge_phone),
        )
        .route(
            "/v1/tenants/:tenant_id/challenge/verify",
            post(handlers::identity::verify_challenge),
        )
        .route("/v1/tenants/:tenant_id/me", get(handlers::session::get_me))
        .route(
            "/v1/tenants/:tenant_id/me/lang",
            patch(handlers::session::update_lang),
        )
        .route(
            "/v1/tenants/:tenant_id/session/refresh",
            post(handlers::session::refresh),
        )
        .route("/v1/tenants/:tenant_id/logout", post(handlers::session::logout))
        .merge(identifier_routes)
        .merge(admin_routes)
        .with_state(state.clone())
        // Global IP rate limiting
        .layer(from_fn_with_state(ip_limiter, ip_rate_limit_middleware))
        .layer(
            TraceLayer::new_for_http().make_span_with(|request: &Request<_>| {
                let request_id = request
                    .headers()
                    .get(REQUEST_ID_HEADER)
                    .and_then(|value| value.to_str().ok())
                    .unwrap_or("-");

                tracing::info_span!(
                    "http_request",
                    request_id = %request_id,
                    method = %request.method(),
                    uri = %request.uri(),
                    version = ?request.version(),
                )
            }),
        )
        .layer(from_fn(request_id_middleware))
        .layer(cors_layer(&state.config.security.allowed_origins))
}

fn cors_layer(allowed_origins: &[String]) -> CorsLayer {
    let origins: Vec<HeaderValue> = allowed_origins
        .iter()
        .filter_map(|origin| match origin.parse::<HeaderValue>() {
            Ok(value) => Some(value),
            Err(e) => {
                tracing::error!("Invalid CORS origin '{}': {}. Skipping.", origin, e);
                None
            }
        })
        .collect();

    CorsLayer::new()
        .allow_origin(origins)
        .allow_methods([
            Method::GET,
            Method::POST,
            Method::PUT,
            Method::PATCH,
            Method::DELETE,
            Method::OPTIONS,
        ])
        .allow_headers([
            header::AUTHORIZATION,
            header::CONTENT_TYPE,
            HeaderName::from_static(middleware::ADMIN_API_KEY_HEADER),
            HeaderName::from_static(SESSION_TOKEN_HEADER),
            HeaderName::from_static(REQUEST_ID_HEADER),
        ])
}

/// Store and challenge cache health.
pub async fn health_check(
    State(state): State<AppState>,
) -> Result<Json<serde_json::Value>, AppError> {
    state.identity.health_check().await.map_err(|e| {
        tracing::error!(error = %e, "Health check failed");
        AppError::ServiceUnavailable
    })?;

    Ok(Json(serde_json::json!({
        "status": "healthy",
        "service": state.config.service_name,
        "version": state.config.service_version,
        "environment": format!("{:?}", state.config.environment),
        "checks": {
            "database": "up",
            "redis": "up"
        }
    })))
}
