use uuid::Uuid;
use validator::Validate;

use super::IdentityService;
use crate::models::{CreateTenantRequest, Tenant, UpdateTenantRequest};
use crate::services::error::ServiceError;
use crate::services::store::StoreError;

impl IdentityService {
    // ==================== Tenant Administration ====================

    #[tracing::instrument(skip(self, req))]
    pub async fn create_tenant(&self, req: CreateTenantRequest) -> Result<Tenant, ServiceError> {
        req.validate()
            .map_err(|e| ServiceError::Validation(e.to_string()))?;

        let tenant = Tenant::new(req.name, req.public_endpoint, req.admin_endpoint);
        self.store.insert_tenant(&tenant).await?;

        tracing::info!(tenant_id = %tenant.tenant_id, name = %tenant.name, "Tenant created");
        Ok(tenant)
    }

    pub async fn get_tenant(&self, tenant_id: Uuid) -> Result<Tenant, ServiceError> {
        self.tenant(tenant_id).await
    }

    pub async fn list_tenants(&self) -> Result<Vec<Tenant>, ServiceError> {
        Ok(self.store.list_tenants().await?)
    }

    #[tracing::instrument(skip(self, req), fields(tenant_id = %tenant_id))]
    pub async fn update_tenant(
        &self,
        tenant_id: Uuid,
        req: UpdateTenantRequest,
    ) -> Result<Tenant, ServiceError> {
        req.validate()
            .map_err(|e| ServiceError::Validation(e.to_string()))?;

        let mut tenant = self.tenant(tenant_id).await?;
        tenant.apply(req);
        self.store.update_tenant(&tenant).await.map_err(|e| match e {
            StoreError::NotFound => ServiceError::TenantNotFound,
            other => ServiceError::Store(other),
        })?;

        tracing::info!(%tenant_id, "Tenant updated");
        Ok(tenant)
    }

    /// Refused while any identity or mapping still references the tenant.
    #[tracing::instrument(skip(self), fields(tenant_id = %tenant_id))]
    pub async fn delete_tenant(&self, tenant_id: Uuid) -> Result<(), ServiceError> {
        self.store
            .delete_tenant(tenant_id)
            .await
            .map_err(|e| match e {
                StoreError::NotFound => ServiceError::TenantNotFound,
                StoreError::HasDependents => ServiceError::TenantHasDependents,
                other => ServiceError::Store(other),
            })?;

        tracing::info!(%tenant_id, "Tenant deleted");
        Ok(())
    }
}
