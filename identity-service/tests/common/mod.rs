//! Test helpers for identity-service integration tests.
//!
//! Wires the orchestrator to the in-process store, provider, challenge store
//! and limiter so flows run without PostgreSQL, Redis or a live provider.

#![allow(dead_code)]

use std::sync::Arc;

use axum::{
    body::Body,
    http::{Request, Response},
    Router,
};
use http_body_util::BodyExt;
use identity_service::{
    build_router,
    config::{
        ChallengeConfig, DatabaseConfig, Environment, IdentityConfig, ProviderConfig,
        RateLimitConfig, RedisConfig, SecurityConfig,
    },
    models::{AuthResult, CreateTenantRequest, Tenant},
    services::{
        provider::ProviderIdentity, IdentityProvider, IdentityService, IdentitySettings,
        MemoryChallengeStore, MemoryRateLimiter, MemoryStore, MockIdentityProvider,
        MOCK_VALID_CODE,
    },
    AppState,
};
use secrecy::SecretString;
use service_core::middleware::rate_limit::create_ip_rate_limiter;
use tower::ServiceExt;

pub const TEST_ADMIN_API_KEY: &str = "test-admin-key-0123456789";

pub struct TestApp {
    pub service: IdentityService,
    pub store: Arc<MemoryStore>,
    pub provider: Arc<MockIdentityProvider>,
    pub challenges: Arc<MemoryChallengeStore>,
    pub limiter: Arc<MemoryRateLimiter>,
    pub state: AppState,
}

impl TestApp {
    pub fn new() -> Self {
        Self::with_settings(IdentitySettings::default())
    }

    pub fn with_settings(settings: IdentitySettings) -> Self {
        let store = Arc::new(MemoryStore::new());
        let provider = Arc::new(MockIdentityProvider::new());
        let challenges = Arc::new(MemoryChallengeStore::new());
        let limiter = Arc::new(MemoryRateLimiter::new());

        let service = IdentityService::new(
            store.clone(),
            provider.clone(),
            challenges.clone(),
            limiter.clone(),
            settings,
        );

        let config = test_config();
        let state = AppState {
            ip_rate_limiter: create_ip_rate_limiter(
                config.rate_limit.global_ip_limit,
                config.rate_limit.global_ip_window_seconds,
            ),
            config: Arc::new(config),
            identity: service.clone(),
        };

        Self {
            service,
            store,
            provider,
            challenges,
            limiter,
            state,
        }
    }

    pub fn router(&self) -> Router {
        build_router(self.state.clone())
    }

    /// Each tenant gets its own provider endpoints.
    pub async fn tenant(&self, name: &str) -> Tenant {
        self.service
            .create_tenant(CreateTenantRequest {
                name: name.to_string(),
                public_endpoint: format!("http://{}.kratos-public.test", name.to_lowercase()),
                admin_endpoint: format!("http://{}.kratos-admin.test", name.to_lowercase()),
            })
            .await
            .expect("Failed to create tenant")
    }

    /// A tenant served by the provider deployment named `realm`, which other
    /// tenants may share.
    pub async fn tenant_on(&self, name: &str, realm: &str) -> Tenant {
        self.service
            .create_tenant(CreateTenantRequest {
                name: name.to_string(),
                public_endpoint: format!("http://{}.kratos-public.test", realm),
                admin_endpoint: format!("http://{}.kratos-admin.test", realm),
            })
            .await
            .expect("Failed to create tenant")
    }

    /// The provider identity holding `identifier` on the tenant's endpoints.
    pub async fn provider_identity(&self, tenant: &Tenant, identifier: &str) -> Option<ProviderIdentity> {
        let identifier =
            identity_service::models::Identifier::parse(identifier).expect("Invalid identifier");
        self.provider
            .find_identity_by_identifier(&tenant.endpoints(), &identifier)
            .await
            .expect("Failed to look up provider identity")
    }

    /// Register and confirm `identifier` in `tenant`.
    pub async fn register_user(&self, tenant: &Tenant, identifier: &str) -> AuthResult {
        let started = self
            .service
            .register(tenant.tenant_id, identifier, Some("en"))
            .await
            .expect("Failed to start registration");
        self.service
            .verify_register(tenant.tenant_id, &started.flow_id, MOCK_VALID_CODE)
            .await
            .expect("Failed to verify registration")
    }

    pub async fn send(&self, request: Request<Body>) -> Response<Body> {
        self.router()
            .oneshot(request)
            .await
            .expect("Failed to execute request")
    }
}

pub fn test_config() -> IdentityConfig {
    IdentityConfig {
        common: service_core::config::Config {
            host: "127.0.0.1".to_string(),
            port: 8080,
        },
        environment: Environment::Dev,
        service_name: "identity-service".to_string(),
        service_version: "test".to_string(),
        log_level: "debug".to_string(),
        otlp_endpoint: None,
        database: DatabaseConfig {
            url: "postgres://localhost/identity_test".to_string(),
            max_connections: 1,
            min_connections: 1,
        },
        redis: RedisConfig {
            url: "redis://127.0.0.1:6379".to_string(),
        },
        provider: ProviderConfig {
            admin_token: None,
            timeout_seconds: 5,
        },
        challenge: ChallengeConfig { ttl_seconds: 300 },
        rate_limit: RateLimitConfig::default(),
        security: SecurityConfig {
            allowed_origins: vec!["http://localhost:3000".to_string()],
            admin_api_key: SecretString::new(TEST_ADMIN_API_KEY.to_string()),
        },
    }
}

pub async fn body_json(response: Response<Body>) -> serde_json::Value {
    let bytes = response
        .into_body()
        .collect()
        .await
        .expect("Failed to read body")
        .to_bytes();
    serde_json::from_slice(&bytes).expect("Body is not JSON")
}

pub fn json_request(method: &str, uri: &str, body: serde_json::Value) -> Request<Body> {
    Request::builder()
        .method(method)
        .uri(uri)
        .header("content-type", "application/json")
        .body(Body::from(body.to_string()))
        .expect("Failed to build request")
}
