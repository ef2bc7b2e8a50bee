//! PostgreSQL identity store.

use async_trait::async_trait;
use chrono::Utc;
use std::time::Duration;

use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::{Postgres, Transaction};
use uuid::Uuid;

use super::{Binding, IdentityStore, NewBinding, StoreError};
use crate::config::DatabaseConfig;
use crate::models::{
    GlobalUser, Identifier, IdentifierType, Tenant, UserIdentifierMapping, UserIdentity,
};

const IDENTITY_COLUMNS: &str = "identity_id, global_user_id, tenant_id, provider_user_id, \
     identifier_type, identifier_value, created_at, updated_at";

const MAPPING_COLUMNS: &str =
    "mapping_id, global_user_id, tenant_id, tenant_user_id, lang, created_at, updated_at";

impl From<sqlx::Error> for StoreError {
    fn from(err: sqlx::Error) -> Self {
        match &err {
            sqlx::Error::RowNotFound => StoreError::NotFound,
            sqlx::Error::Database(db) if db.is_unique_violation() => StoreError::UniqueViolation {
                constraint: db.constraint().unwrap_or_default().to_string(),
            },
            sqlx::Error::Database(db) if db.is_foreign_key_violation() => {
                StoreError::HasDependents
            }
            _ => StoreError::Database(anyhow::anyhow!(err)),
        }
    }
}

/// PostgreSQL database wrapper.
#[derive(Clone)]
pub struct Database {
    pool: PgPool,
}

impl Database {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Open the pool. The acquire timeout bounds how long any store call
    /// waits for a connection.
    pub async fn connect(config: &DatabaseConfig) -> Result<Self, StoreError> {
        tracing::info!(
            max_connections = config.max_connections,
            "Connecting to PostgreSQL"
        );

        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .min_connections(config.min_connections)
            .acquire_timeout(Duration::from_secs(5))
            .idle_timeout(Duration::from_secs(600))
            .connect(&config.url)
            .await
            .map_err(|e| StoreError::Database(anyhow::Error::new(e).context("connect")))?;

        Ok(Self::new(pool))
    }

    /// Apply `migrations/` (tenants, global users, identities, mappings).
    pub async fn migrate(&self) -> Result<(), StoreError> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .map_err(|e| StoreError::Database(anyhow::Error::new(e).context("migrate")))?;
        tracing::info!("Identity schema is up to date");
        Ok(())
    }

    /// Global user to bind a new identifier under, if the same person is
    /// already known through another tenant.
    async fn resolve_global_user(
        tx: &mut Transaction<'_, Postgres>,
        tenant_id: Uuid,
        identifier: &Identifier,
    ) -> Result<Option<Uuid>, StoreError> {
        let resolved = sqlx::query_scalar::<_, Uuid>(
            r#"
            SELECT i.global_user_id
            FROM user_identities i
            WHERE i.identifier_type = $1
              AND i.identifier_value = $2
              AND i.tenant_id <> $3
              AND NOT EXISTS (
                  SELECT 1 FROM user_identifier_mappings m
                  WHERE m.tenant_id = $3 AND m.global_user_id = i.global_user_id
              )
            ORDER BY i.created_at
            LIMIT 1
            "#,
        )
        .bind(identifier.kind().as_str())
        .bind(identifier.value())
        .bind(tenant_id)
        .fetch_optional(&mut **tx)
        .await?;

        Ok(resolved)
    }

    async fn drop_mapping_if_unbound(
        tx: &mut Transaction<'_, Postgres>,
        tenant_id: Uuid,
        global_user_id: Uuid,
    ) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            DELETE FROM user_identifier_mappings m
            WHERE m.tenant_id = $1 AND m.global_user_id = $2
              AND NOT EXISTS (
                  SELECT 1 FROM user_identities i
                  WHERE i.tenant_id = $1 AND i.global_user_id = $2
              )
            "#,
        )
        .bind(tenant_id)
        .bind(global_user_id)
        .execute(&mut **tx)
        .await?;
        Ok(())
    }
}

#[async_trait]
impl IdentityStore for Database {
    async fn health_check(&self) -> Result<(), StoreError> {
        sqlx::query("SELECT 1").execute(&self.pool).await.map_err(|e| {
            tracing::error!("Database health check failed: {}", e);
            StoreError::from(e)
        })?;
        Ok(())
    }

    // ==================== Tenant Operations ====================

    async fn get_tenant(&self, tenant_id: Uuid) -> Result<Option<Tenant>, StoreError> {
        let tenant = sqlx::query_as::<_, Tenant>("SELECT * FROM tenants WHERE tenant_id = $1")
            .bind(tenant_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(tenant)
    }

    async fn list_tenants(&self) -> Result<Vec<Tenant>, StoreError> {
        let tenants = sqlx::query_as::<_, Tenant>("SELECT * FROM tenants ORDER BY created_at")
            .fetch_all(&self.pool)
            .await?;
        Ok(tenants)
    }

    async fn insert_tenant(&self, tenant: &Tenant) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO tenants (tenant_id, name, public_endpoint, admin_endpoint, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6)
            "#,
        )
        .bind(tenant.tenant_id)
        .bind(&tenant.name)
        .bind(&tenant.public_endpoint)
        .bind(&tenant.admin_endpoint)
        .bind(tenant.created_at)
        .bind(tenant.updated_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn update_tenant(&self, tenant: &Tenant) -> Result<(), StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE tenants
            SET name = $2, public_endpoint = $3, admin_endpoint = $4, updated_at = $5
            WHERE tenant_id = $1
            "#,
        )
        .bind(tenant.tenant_id)
        .bind(&tenant.name)
        .bind(&tenant.public_endpoint)
        .bind(&tenant.admin_endpoint)
        .bind(tenant.updated_at)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound);
        }
        Ok(())
    }

    async fn delete_tenant(&self, tenant_id: Uuid) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await?;

        let has_dependents = sqlx::query_scalar::<_, bool>(
            r#"
            SELECT EXISTS (SELECT 1 FROM user_identities WHERE tenant_id = $1)
                OR EXISTS (SELECT 1 FROM user_identifier_mappings WHERE tenant_id = $1)
            "#,
        )
        .bind(tenant_id)
        .fetch_one(&mut *tx)
        .await?;

        if has_dependents {
            tx.rollback().await.ok();
            return Err(StoreError::HasDependents);
        }

        let result = sqlx::query("DELETE FROM tenants WHERE tenant_id = $1")
            .bind(tenant_id)
            .execute(&mut *tx)
            .await?;
        if result.rows_affected() == 0 {
            tx.rollback().await.ok();
            return Err(StoreError::NotFound);
        }

        tx.commit().await?;
        Ok(())
    }

    // ==================== Identity Lookups ====================

    async fn find_identity(
        &self,
        tenant_id: Uuid,
        identifier: &Identifier,
    ) -> Result<Option<UserIdentity>, StoreError> {
        let identity = sqlx::query_as::<_, UserIdentity>(&format!(
            "SELECT {} FROM user_identities \
             WHERE tenant_id = $1 AND identifier_type = $2 AND identifier_value = $3",
            IDENTITY_COLUMNS
        ))
        .bind(tenant_id)
        .bind(identifier.kind().as_str())
        .bind(identifier.value())
        .fetch_optional(&self.pool)
        .await?;
        Ok(identity)
    }

    async fn list_identities(
        &self,
        tenant_id: Uuid,
        global_user_id: Uuid,
    ) -> Result<Vec<UserIdentity>, StoreError> {
        let identities = sqlx::query_as::<_, UserIdentity>(&format!(
            "SELECT {} FROM user_identities \
             WHERE tenant_id = $1 AND global_user_id = $2 ORDER BY created_at",
            IDENTITY_COLUMNS
        ))
        .bind(tenant_id)
        .bind(global_user_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(identities)
    }

    async fn find_mapping(
        &self,
        tenant_id: Uuid,
        global_user_id: Uuid,
    ) -> Result<Option<UserIdentifierMapping>, StoreError> {
        let mapping = sqlx::query_as::<_, UserIdentifierMapping>(&format!(
            "SELECT {} FROM user_identifier_mappings WHERE tenant_id = $1 AND global_user_id = $2",
            MAPPING_COLUMNS
        ))
        .bind(tenant_id)
        .bind(global_user_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(mapping)
    }

    async fn find_mapping_by_tenant_user(
        &self,
        tenant_id: Uuid,
        tenant_user_id: &str,
    ) -> Result<Option<UserIdentifierMapping>, StoreError> {
        let mapping = sqlx::query_as::<_, UserIdentifierMapping>(&format!(
            "SELECT {} FROM user_identifier_mappings WHERE tenant_id = $1 AND tenant_user_id = $2",
            MAPPING_COLUMNS
        ))
        .bind(tenant_id)
        .bind(tenant_user_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(mapping)
    }

    // ==================== Bind / Unbind ====================

    async fn bind_identity(&self, binding: &NewBinding) -> Result<Binding, StoreError> {
        let mut tx = self.pool.begin().await?;

        let resolved = match binding.global_user_id {
            Some(id) => Some(id),
            None => {
                Self::resolve_global_user(&mut tx, binding.tenant_id, &binding.identifier).await?
            }
        };

        let (global_user_id, created_global_user) = match resolved {
            Some(id) => (id, false),
            None => {
                let user = GlobalUser::new();
                sqlx::query(
                    "INSERT INTO global_users (global_user_id, created_at, updated_at) VALUES ($1, $2, $3)",
                )
                .bind(user.global_user_id)
                .bind(user.created_at)
                .bind(user.updated_at)
                .execute(&mut *tx)
                .await?;
                (user.global_user_id, true)
            }
        };

        let identity = UserIdentity::new(
            global_user_id,
            binding.tenant_id,
            binding.provider_user_id.clone(),
            &binding.identifier,
        );
        sqlx::query(
            r#"
            INSERT INTO user_identities
                (identity_id, global_user_id, tenant_id, provider_user_id, identifier_type, identifier_value, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            "#,
        )
        .bind(identity.identity_id)
        .bind(identity.global_user_id)
        .bind(identity.tenant_id)
        .bind(&identity.provider_user_id)
        .bind(identity.identifier_type.as_str())
        .bind(&identity.identifier_value)
        .bind(identity.created_at)
        .bind(identity.updated_at)
        .execute(&mut *tx)
        .await?;

        let fresh = UserIdentifierMapping::new(
            global_user_id,
            binding.tenant_id,
            binding.provider_user_id.clone(),
            binding.lang.clone(),
        );
        let mapping = sqlx::query_as::<_, UserIdentifierMapping>(&format!(
            r#"
            INSERT INTO user_identifier_mappings
                (mapping_id, global_user_id, tenant_id, tenant_user_id, lang, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            ON CONFLICT (tenant_id, global_user_id) DO UPDATE
            SET lang = COALESCE(EXCLUDED.lang, user_identifier_mappings.lang),
                updated_at = EXCLUDED.updated_at
            RETURNING {}
            "#,
            MAPPING_COLUMNS
        ))
        .bind(fresh.mapping_id)
        .bind(fresh.global_user_id)
        .bind(fresh.tenant_id)
        .bind(&fresh.tenant_user_id)
        .bind(&fresh.lang)
        .bind(fresh.created_at)
        .bind(fresh.updated_at)
        .fetch_one(&mut *tx)
        .await?;

        if mapping.tenant_user_id != binding.provider_user_id {
            tx.rollback().await.ok();
            return Err(StoreError::UniqueViolation {
                constraint: "user_identifier_mappings_tenant_user".to_string(),
            });
        }

        tx.commit().await?;
        Ok(Binding {
            identity,
            mapping,
            created_global_user,
        })
    }

    async fn replace_identity(
        &self,
        tenant_id: Uuid,
        global_user_id: Uuid,
        identity_id: Uuid,
        identifier: &Identifier,
    ) -> Result<UserIdentity, StoreError> {
        let mut tx = self.pool.begin().await?;

        let current = sqlx::query_as::<_, UserIdentity>(&format!(
            "SELECT {} FROM user_identities \
             WHERE identity_id = $1 AND tenant_id = $2 AND global_user_id = $3 FOR UPDATE",
            IDENTITY_COLUMNS
        ))
        .bind(identity_id)
        .bind(tenant_id)
        .bind(global_user_id)
        .fetch_optional(&mut *tx)
        .await?
        .ok_or(StoreError::NotFound)?;

        let replaced = if current.identifier_type == identifier.kind() {
            sqlx::query_as::<_, UserIdentity>(&format!(
                "UPDATE user_identities SET identifier_value = $2, updated_at = $3 \
                 WHERE identity_id = $1 RETURNING {}",
                IDENTITY_COLUMNS
            ))
            .bind(identity_id)
            .bind(identifier.value())
            .bind(Utc::now())
            .fetch_one(&mut *tx)
            .await?
        } else {
            sqlx::query("DELETE FROM user_identities WHERE identity_id = $1")
                .bind(identity_id)
                .execute(&mut *tx)
                .await?;

            let identity = UserIdentity::new(
                global_user_id,
                tenant_id,
                current.provider_user_id.clone(),
                identifier,
            );
            sqlx::query(
                r#"
                INSERT INTO user_identities
                    (identity_id, global_user_id, tenant_id, provider_user_id, identifier_type, identifier_value, created_at, updated_at)
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
                "#,
            )
            .bind(identity.identity_id)
            .bind(identity.global_user_id)
            .bind(identity.tenant_id)
            .bind(&identity.provider_user_id)
            .bind(identity.identifier_type.as_str())
            .bind(&identity.identifier_value)
            .bind(identity.created_at)
            .bind(identity.updated_at)
            .execute(&mut *tx)
            .await?;
            identity
        };

        tx.commit().await?;
        Ok(replaced)
    }

    async fn delete_identity(
        &self,
        tenant_id: Uuid,
        global_user_id: Uuid,
        kind: IdentifierType,
    ) -> Result<UserIdentity, StoreError> {
        let mut tx = self.pool.begin().await?;

        let rows = sqlx::query_as::<_, UserIdentity>(&format!(
            "SELECT {} FROM user_identities \
             WHERE tenant_id = $1 AND global_user_id = $2 FOR UPDATE",
            IDENTITY_COLUMNS
        ))
        .bind(tenant_id)
        .bind(global_user_id)
        .fetch_all(&mut *tx)
        .await?;

        let Some(target) = rows.iter().find(|i| i.identifier_type == kind).cloned() else {
            tx.rollback().await.ok();
            return Err(StoreError::NotFound);
        };
        if rows.len() <= 1 {
            tx.rollback().await.ok();
            return Err(StoreError::LastIdentifier);
        }

        sqlx::query("DELETE FROM user_identities WHERE identity_id = $1")
            .bind(target.identity_id)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(target)
    }

    async fn delete_orphan_identity(&self, identity_id: Uuid) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await?;

        let removed = sqlx::query_as::<_, (Uuid, Uuid)>(
            "DELETE FROM user_identities WHERE identity_id = $1 RETURNING tenant_id, global_user_id",
        )
        .bind(identity_id)
        .fetch_optional(&mut *tx)
        .await?;

        if let Some((tenant_id, global_user_id)) = removed {
            Self::drop_mapping_if_unbound(&mut tx, tenant_id, global_user_id).await?;
        }

        tx.commit().await?;
        Ok(())
    }

    async fn delete_orphan_binding(
        &self,
        tenant_id: Uuid,
        provider_user_id: &str,
    ) -> Result<u64, StoreError> {
        let mut tx = self.pool.begin().await?;

        let removed = sqlx::query(
            "DELETE FROM user_identities WHERE tenant_id = $1 AND provider_user_id = $2",
        )
        .bind(tenant_id)
        .bind(provider_user_id)
        .execute(&mut *tx)
        .await?
        .rows_affected();

        sqlx::query(
            "DELETE FROM user_identifier_mappings WHERE tenant_id = $1 AND tenant_user_id = $2",
        )
        .bind(tenant_id)
        .bind(provider_user_id)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(removed)
    }

    async fn update_lang(
        &self,
        tenant_id: Uuid,
        global_user_id: Uuid,
        lang: &str,
    ) -> Result<UserIdentifierMapping, StoreError> {
        sqlx::query_as::<_, UserIdentifierMapping>(&format!(
            "UPDATE user_identifier_mappings SET lang = $3, updated_at = $4 \
             WHERE tenant_id = $1 AND global_user_id = $2 RETURNING {}",
            MAPPING_COLUMNS
        ))
        .bind(tenant_id)
        .bind(global_user_id)
        .bind(lang)
        .bind(Utc::now())
        .fetch_optional(&self.pool)
        .await?
        .ok_or(StoreError::NotFound)
    }
}
