//! Tenant model - an isolated customer realm with its own provider endpoints.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;
use validator::Validate;

use crate::services::provider::ProviderEndpoints;

/// Tenant entity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, FromRow)]
pub struct Tenant {
    pub tenant_id: Uuid,
    pub name: String,
    pub public_endpoint: String,
    pub admin_endpoint: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Tenant {
    /// Create a new tenant.
    pub fn new(name: String, public_endpoint: String, admin_endpoint: String) -> Self {
        let now = Utc::now();
        Self {
            tenant_id: Uuid::new_v4(),
            name,
            public_endpoint: trim_endpoint(public_endpoint),
            admin_endpoint: trim_endpoint(admin_endpoint),
            created_at: now,
            updated_at: now,
        }
    }

    /// The provider endpoint pair every tenant-scoped provider call goes to.
    pub fn endpoints(&self) -> ProviderEndpoints {
        ProviderEndpoints {
            public_url: self.public_endpoint.clone(),
            admin_url: self.admin_endpoint.clone(),
        }
    }

    pub fn apply(&mut self, update: UpdateTenantRequest) {
        if let Some(name) = update.name {
            self.name = name;
        }
        if let Some(endpoint) = update.public_endpoint {
            self.public_endpoint = trim_endpoint(endpoint);
        }
        if let Some(endpoint) = update.admin_endpoint {
            self.admin_endpoint = trim_endpoint(endpoint);
        }
        self.updated_at = Utc::now();
    }
}

fn trim_endpoint(endpoint: String) -> String {
    endpoint.trim().trim_end_matches('/').to_string()
}

/// Request to create a tenant.
#[derive(Debug, Deserialize, Validate)]
pub struct CreateTenantRequest {
    #[validate(length(min = 1, max = 128))]
    pub name: String,
    #[validate(url)]
    pub public_endpoint: String,
    #[validate(url)]
    pub admin_endpoint: String,
}

/// Request to update a tenant; absent fields are left as they are.
#[derive(Debug, Default, Deserialize, Validate)]
pub struct UpdateTenantRequest {
    #[validate(length(min = 1, max = 128))]
    pub name: Option<String>,
    #[validate(url)]
    pub public_endpoint: Option<String>,
    #[validate(url)]
    pub admin_endpoint: Option<String>,
}
