//! Relational store for tenants, global users and their identities.
//!
//! Every mutating method is one transaction. Uniqueness constraints are the
//! arbiter of concurrent binds; the orchestrator holds no locks.

mod memory;
mod postgres;

pub use memory::MemoryStore;
pub use postgres::Database;

use async_trait::async_trait;
use thiserror::Error;
use uuid::Uuid;

use crate::models::{
    Identifier, IdentifierType, Tenant, UserIdentifierMapping, UserIdentity,
};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("unique constraint violated: {constraint}")]
    UniqueViolation { constraint: String },

    #[error("record not found")]
    NotFound,

    #[error("cannot remove the last identifier of a user in a tenant")]
    LastIdentifier,

    #[error("tenant still has identities or mappings")]
    HasDependents,

    #[error("database error: {0}")]
    Database(#[source] anyhow::Error),
}

/// Input to the bind step.
#[derive(Debug, Clone)]
pub struct NewBinding {
    pub tenant_id: Uuid,
    /// Bind under this global user instead of resolving one.
    pub global_user_id: Option<Uuid>,
    pub provider_user_id: String,
    pub identifier: Identifier,
    pub lang: Option<String>,
}

/// Rows written by a successful bind.
#[derive(Debug, Clone)]
pub struct Binding {
    pub identity: UserIdentity,
    pub mapping: UserIdentifierMapping,
    pub created_global_user: bool,
}

#[async_trait]
pub trait IdentityStore: Send + Sync {
    async fn health_check(&self) -> Result<(), StoreError>;

    // ==================== Tenant Operations ====================

    async fn get_tenant(&self, tenant_id: Uuid) -> Result<Option<Tenant>, StoreError>;

    async fn list_tenants(&self) -> Result<Vec<Tenant>, StoreError>;

    async fn insert_tenant(&self, tenant: &Tenant) -> Result<(), StoreError>;

    async fn update_tenant(&self, tenant: &Tenant) -> Result<(), StoreError>;

    /// Fails with `HasDependents` while any identity or mapping references it.
    async fn delete_tenant(&self, tenant_id: Uuid) -> Result<(), StoreError>;

    // ==================== Identity Lookups ====================

    async fn find_identity(
        &self,
        tenant_id: Uuid,
        identifier: &Identifier,
    ) -> Result<Option<UserIdentity>, StoreError>;

    async fn list_identities(
        &self,
        tenant_id: Uuid,
        global_user_id: Uuid,
    ) -> Result<Vec<UserIdentity>, StoreError>;

    async fn find_mapping(
        &self,
        tenant_id: Uuid,
        global_user_id: Uuid,
    ) -> Result<Option<UserIdentifierMapping>, StoreError>;

    async fn find_mapping_by_tenant_user(
        &self,
        tenant_id: Uuid,
        tenant_user_id: &str,
    ) -> Result<Option<UserIdentifierMapping>, StoreError>;

    // ==================== Bind / Unbind ====================

    /// Resolve or create the global user, insert the identity and upsert
    /// the mapping.
    ///
    /// Without an explicit `global_user_id`, the same identifier bound in
    /// another tenant resolves to that global user, unless that user is
    /// already mapped to a different provider identity in this tenant.
    async fn bind_identity(&self, binding: &NewBinding) -> Result<Binding, StoreError>;

    /// Point an identity row at a new identifier. A same-type change updates
    /// the row; a cross-type change deletes it and inserts a row of the new
    /// type with the same provider identity.
    async fn replace_identity(
        &self,
        tenant_id: Uuid,
        global_user_id: Uuid,
        identity_id: Uuid,
        identifier: &Identifier,
    ) -> Result<UserIdentity, StoreError>;

    /// Remove the user's identity of `kind`; refuses to remove the last one.
    async fn delete_identity(
        &self,
        tenant_id: Uuid,
        global_user_id: Uuid,
        kind: IdentifierType,
    ) -> Result<UserIdentity, StoreError>;

    /// Remove one stale row. The mapping goes too when no row is left.
    async fn delete_orphan_identity(&self, identity_id: Uuid) -> Result<(), StoreError>;

    /// Remove every row and the mapping of a provider identity that no
    /// longer exists. Returns the number of identity rows removed.
    async fn delete_orphan_binding(
        &self,
        tenant_id: Uuid,
        provider_user_id: &str,
    ) -> Result<u64, StoreError>;

    async fn update_lang(
        &self,
        tenant_id: Uuid,
        global_user_id: Uuid,
        lang: &str,
    ) -> Result<UserIdentifierMapping, StoreError>;
}
