use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use chrono::Utc;
use uuid::Uuid;

use super::{Binding, IdentityStore, NewBinding, StoreError};
use crate::models::{
    GlobalUser, Identifier, IdentifierType, Tenant, UserIdentifierMapping, UserIdentity,
};

#[derive(Default)]
struct MemoryState {
    tenants: HashMap<Uuid, Tenant>,
    global_users: HashMap<Uuid, GlobalUser>,
    identities: HashMap<Uuid, UserIdentity>,
    mappings: HashMap<Uuid, UserIdentifierMapping>,
    failing: Vec<&'static str>,
    calls: Vec<&'static str>,
}

impl MemoryState {
    fn identity_by_value(&self, tenant_id: Uuid, identifier: &Identifier) -> Option<&UserIdentity> {
        self.identities.values().find(|i| {
            i.tenant_id == tenant_id
                && i.identifier_type == identifier.kind()
                && i.identifier_value == identifier.value()
        })
    }

    fn user_identities(&self, tenant_id: Uuid, global_user_id: Uuid) -> Vec<&UserIdentity> {
        let mut rows: Vec<_> = self
            .identities
            .values()
            .filter(|i| i.tenant_id == tenant_id && i.global_user_id == global_user_id)
            .collect();
        rows.sort_by_key(|i| i.created_at);
        rows
    }

    fn mapping(&self, tenant_id: Uuid, global_user_id: Uuid) -> Option<&UserIdentifierMapping> {
        self.mappings
            .values()
            .find(|m| m.tenant_id == tenant_id && m.global_user_id == global_user_id)
    }

    /// Same checks the table constraints perform.
    fn check_identity_insert(&self, identity: &UserIdentity) -> Result<(), StoreError> {
        if !self.tenants.contains_key(&identity.tenant_id) {
            return Err(StoreError::Database(anyhow::anyhow!(
                "tenant {} does not exist",
                identity.tenant_id
            )));
        }
        if self
            .identity_by_value(identity.tenant_id, &identity.identifier())
            .is_some()
        {
            return Err(unique("user_identities_tenant_type_value"));
        }
        let type_taken = self.identities.values().any(|i| {
            i.tenant_id == identity.tenant_id
                && i.global_user_id == identity.global_user_id
                && i.identifier_type == identity.identifier_type
        });
        if type_taken {
            return Err(unique("user_identities_tenant_user_type"));
        }
        Ok(())
    }

    fn drop_mapping_if_unbound(&mut self, tenant_id: Uuid, global_user_id: Uuid) {
        if self.user_identities(tenant_id, global_user_id).is_empty() {
            self.mappings
                .retain(|_, m| !(m.tenant_id == tenant_id && m.global_user_id == global_user_id));
        }
    }
}

fn unique(constraint: &str) -> StoreError {
    StoreError::UniqueViolation {
        constraint: constraint.to_string(),
    }
}

/// In-process store with the same constraints as the PostgreSQL schema.
///
/// A single lock makes every method atomic, standing in for a transaction.
#[derive(Default)]
pub struct MemoryStore {
    state: Mutex<MemoryState>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> Result<MutexGuard<'_, MemoryState>, StoreError> {
        self.state
            .lock()
            .map_err(|e| StoreError::Database(anyhow::anyhow!("memory store mutex poisoned: {}", e)))
    }

    /// Lock the state, failing if `operation` has been made to fail.
    fn enter(&self, operation: &'static str) -> Result<MutexGuard<'_, MemoryState>, StoreError> {
        let mut state = self.state()?;
        state.calls.push(operation);
        if state.failing.contains(&operation) {
            return Err(StoreError::Database(anyhow::anyhow!(
                "injected failure in {}",
                operation
            )));
        }
        Ok(state)
    }

    /// Make `operation` fail with a database error until cleared.
    pub fn fail_on(&self, operation: &'static str) {
        if let Ok(mut state) = self.state() {
            state.failing.push(operation);
        }
    }

    pub fn clear_failures(&self) {
        if let Ok(mut state) = self.state() {
            state.failing.clear();
        }
    }

    /// Operations entered so far, in order.
    pub fn calls(&self) -> Vec<&'static str> {
        self.state().map(|s| s.calls.clone()).unwrap_or_default()
    }

    pub fn clear_calls(&self) {
        if let Ok(mut state) = self.state() {
            state.calls.clear();
        }
    }

    pub fn identity_count(&self) -> usize {
        self.state().map(|s| s.identities.len()).unwrap_or_default()
    }

    pub fn global_user_count(&self) -> usize {
        self.state().map(|s| s.global_users.len()).unwrap_or_default()
    }

    /// Insert a row directly, bypassing the bind step. Used to stage orphans.
    pub fn insert_identity_row(&self, identity: UserIdentity) -> Result<(), StoreError> {
        let mut state = self.state()?;
        state.check_identity_insert(&identity)?;
        state
            .global_users
            .entry(identity.global_user_id)
            .or_insert_with(|| GlobalUser {
                global_user_id: identity.global_user_id,
                ..GlobalUser::new()
            });
        state.identities.insert(identity.identity_id, identity);
        Ok(())
    }
}

#[async_trait]
impl IdentityStore for MemoryStore {
    async fn health_check(&self) -> Result<(), StoreError> {
        self.enter("health_check").map(|_| ())
    }

    async fn get_tenant(&self, tenant_id: Uuid) -> Result<Option<Tenant>, StoreError> {
        let state = self.enter("get_tenant")?;
        Ok(state.tenants.get(&tenant_id).cloned())
    }

    async fn list_tenants(&self) -> Result<Vec<Tenant>, StoreError> {
        let state = self.enter("list_tenants")?;
        let mut tenants: Vec<_> = state.tenants.values().cloned().collect();
        tenants.sort_by_key(|t| t.created_at);
        Ok(tenants)
    }

    async fn insert_tenant(&self, tenant: &Tenant) -> Result<(), StoreError> {
        let mut state = self.enter("insert_tenant")?;
        if state.tenants.contains_key(&tenant.tenant_id) {
            return Err(unique("tenants_pkey"));
        }
        state.tenants.insert(tenant.tenant_id, tenant.clone());
        Ok(())
    }

    async fn update_tenant(&self, tenant: &Tenant) -> Result<(), StoreError> {
        let mut state = self.enter("update_tenant")?;
        let existing = state
            .tenants
            .get_mut(&tenant.tenant_id)
            .ok_or(StoreError::NotFound)?;
        *existing = tenant.clone();
        Ok(())
    }

    async fn delete_tenant(&self, tenant_id: Uuid) -> Result<(), StoreError> {
        let mut state = self.enter("delete_tenant")?;
        let has_dependents = state.identities.values().any(|i| i.tenant_id == tenant_id)
            || state.mappings.values().any(|m| m.tenant_id == tenant_id);
        if has_dependents {
            return Err(StoreError::HasDependents);
        }
        state
            .tenants
            .remove(&tenant_id)
            .map(|_| ())
            .ok_or(StoreError::NotFound)
    }

    async fn find_identity(
        &self,
        tenant_id: Uuid,
        identifier: &Identifier,
    ) -> Result<Option<UserIdentity>, StoreError> {
        let state = self.enter("find_identity")?;
        Ok(state.identity_by_value(tenant_id, identifier).cloned())
    }

    async fn list_identities(
        &self,
        tenant_id: Uuid,
        global_user_id: Uuid,
    ) -> Result<Vec<UserIdentity>, StoreError> {
        let state = self.enter("list_identities")?;
        Ok(state
            .user_identities(tenant_id, global_user_id)
            .into_iter()
            .cloned()
            .collect())
    }

    async fn find_mapping(
        &self,
        tenant_id: Uuid,
        global_user_id: Uuid,
    ) -> Result<Option<UserIdentifierMapping>, StoreError> {
        let state = self.enter("find_mapping")?;
        Ok(state.mapping(tenant_id, global_user_id).cloned())
    }

    async fn find_mapping_by_tenant_user(
        &self,
        tenant_id: Uuid,
        tenant_user_id: &str,
    ) -> Result<Option<UserIdentifierMapping>, StoreError> {
        let state = self.enter("find_mapping_by_tenant_user")?;
        Ok(state
            .mappings
            .values()
            .find(|m| m.tenant_id == tenant_id && m.tenant_user_id == tenant_user_id)
            .cloned())
    }

    async fn bind_identity(&self, binding: &NewBinding) -> Result<Binding, StoreError> {
        let mut state = self.enter("bind_identity")?;

        let resolved = binding.global_user_id.or_else(|| {
            let mut candidates: Vec<_> = state
                .identities
                .values()
                .filter(|i| {
                    i.tenant_id != binding.tenant_id
                        && i.identifier_type == binding.identifier.kind()
                        && i.identifier_value == binding.identifier.value()
                        && state.mapping(binding.tenant_id, i.global_user_id).is_none()
                })
                .collect();
            candidates.sort_by_key(|i| i.created_at);
            candidates.first().map(|i| i.global_user_id)
        });

        let (global_user, created_global_user) = match resolved {
            Some(id) => (
                GlobalUser {
                    global_user_id: id,
                    ..GlobalUser::new()
                },
                false,
            ),
            None => (GlobalUser::new(), true),
        };

        let identity = UserIdentity::new(
            global_user.global_user_id,
            binding.tenant_id,
            binding.provider_user_id.clone(),
            &binding.identifier,
        );
        state.check_identity_insert(&identity)?;

        let mapping = match state
            .mapping(binding.tenant_id, global_user.global_user_id)
            .cloned()
        {
            Some(mut existing) => {
                if existing.tenant_user_id != binding.provider_user_id {
                    return Err(unique("user_identifier_mappings_tenant_user"));
                }
                if binding.lang.is_some() {
                    existing.lang = binding.lang.clone();
                }
                existing.updated_at = Utc::now();
                existing
            }
            None => {
                let clash = state.mappings.values().any(|m| {
                    m.tenant_id == binding.tenant_id && m.tenant_user_id == binding.provider_user_id
                });
                if clash {
                    return Err(unique("user_identifier_mappings_tenant_user"));
                }
                UserIdentifierMapping::new(
                    global_user.global_user_id,
                    binding.tenant_id,
                    binding.provider_user_id.clone(),
                    binding.lang.clone(),
                )
            }
        };

        if created_global_user {
            state
                .global_users
                .insert(global_user.global_user_id, global_user);
        }
        state.identities.insert(identity.identity_id, identity.clone());
        state.mappings.insert(mapping.mapping_id, mapping.clone());

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
        let mut state = self.enter("replace_identity")?;

        let current = state
            .identities
            .get(&identity_id)
            .filter(|i| i.tenant_id == tenant_id && i.global_user_id == global_user_id)
            .cloned()
            .ok_or(StoreError::NotFound)?;

        if state.identity_by_value(tenant_id, identifier).is_some() {
            return Err(unique("user_identities_tenant_type_value"));
        }

        if current.identifier_type == identifier.kind() {
            let updated = UserIdentity {
                identifier_value: identifier.value().to_string(),
                updated_at: Utc::now(),
                ..current
            };
            state.identities.insert(identity_id, updated.clone());
            return Ok(updated);
        }

        let replacement = UserIdentity::new(
            global_user_id,
            tenant_id,
            current.provider_user_id.clone(),
            identifier,
        );
        let type_taken = state.identities.values().any(|i| {
            i.identity_id != identity_id
                && i.tenant_id == tenant_id
                && i.global_user_id == global_user_id
                && i.identifier_type == identifier.kind()
        });
        if type_taken {
            return Err(unique("user_identities_tenant_user_type"));
        }

        state.identities.remove(&identity_id);
        state
            .identities
            .insert(replacement.identity_id, replacement.clone());
        Ok(replacement)
    }

    async fn delete_identity(
        &self,
        tenant_id: Uuid,
        global_user_id: Uuid,
        kind: IdentifierType,
    ) -> Result<UserIdentity, StoreError> {
        let mut state = self.enter("delete_identity")?;

        let rows = state.user_identities(tenant_id, global_user_id);
        let target = rows
            .iter()
            .find(|i| i.identifier_type == kind)
            .map(|i| (*i).clone())
            .ok_or(StoreError::NotFound)?;
        if rows.len() <= 1 {
            return Err(StoreError::LastIdentifier);
        }

        state.identities.remove(&target.identity_id);
        Ok(target)
    }

    async fn delete_orphan_identity(&self, identity_id: Uuid) -> Result<(), StoreError> {
        let mut state = self.enter("delete_orphan_identity")?;
        if let Some(removed) = state.identities.remove(&identity_id) {
            state.drop_mapping_if_unbound(removed.tenant_id, removed.global_user_id);
        }
        Ok(())
    }

    async fn delete_orphan_binding(
        &self,
        tenant_id: Uuid,
        provider_user_id: &str,
    ) -> Result<u64, StoreError> {
        let mut state = self.enter("delete_orphan_binding")?;
        let before = state.identities.len();
        state
            .identities
            .retain(|_, i| !(i.tenant_id == tenant_id && i.provider_user_id == provider_user_id));
        let removed = (before - state.identities.len()) as u64;
        state
            .mappings
            .retain(|_, m| !(m.tenant_id == tenant_id && m.tenant_user_id == provider_user_id));
        Ok(removed)
    }

    async fn update_lang(
        &self,
        tenant_id: Uuid,
        global_user_id: Uuid,
        lang: &str,
    ) -> Result<UserIdentifierMapping, StoreError> {
        let mut state = self.enter("update_lang")?;
        let mapping = state
            .mappings
            .values_mut()
            .find(|m| m.tenant_id == tenant_id && m.global_user_id == global_user_id)
            .ok_or(StoreError::NotFound)?;
        mapping.lang = Some(lang.to_string());
        mapping.updated_at = Utc::now();
        Ok(mapping.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn store_with_tenant() -> (MemoryStore, Uuid) {
        let store = MemoryStore::new();
        let tenant = Tenant::new(
            "acme".to_string(),
            "http://kratos:4433".to_string(),
            "http://kratos:4434".to_string(),
        );
        store.insert_tenant(&tenant).await.unwrap();
        (store, tenant.tenant_id)
    }

    fn binding(tenant_id: Uuid, provider_user_id: &str, value: &str) -> NewBinding {
        NewBinding {
            tenant_id,
            global_user_id: None,
            provider_user_id: provider_user_id.to_string(),
            identifier: Identifier::parse(value).unwrap(),
            lang: None,
        }
    }

    #[tokio::test]
    async fn same_identifier_in_another_tenant_resolves_to_the_same_global_user() {
        let (store, t1) = store_with_tenant().await;
        let t2 = Tenant::new("other".to_string(), "http://a".to_string(), "http://b".to_string());
        store.insert_tenant(&t2).await.unwrap();

        let first = store
            .bind_identity(&binding(t1, "p-1", "+84344381024"))
            .await
            .unwrap();
        let second = store
            .bind_identity(&binding(t2.tenant_id, "p-2", "+84344381024"))
            .await
            .unwrap();

        assert!(first.created_global_user);
        assert!(!second.created_global_user);
        assert_eq!(first.identity.global_user_id, second.identity.global_user_id);
        assert_eq!(store.global_user_count(), 1);
    }

    #[tokio::test]
    async fn duplicate_identifier_in_one_tenant_is_a_unique_violation() {
        let (store, t1) = store_with_tenant().await;
        store.bind_identity(&binding(t1, "p-1", "a@b.com")).await.unwrap();

        let err = store
            .bind_identity(&binding(t1, "p-2", "a@b.com"))
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::UniqueViolation { .. }));
        assert_eq!(store.identity_count(), 1);
    }

    #[tokio::test]
    async fn last_identifier_cannot_be_deleted() {
        let (store, t1) = store_with_tenant().await;
        let bound = store.bind_identity(&binding(t1, "p-1", "a@b.com")).await.unwrap();
        let user = bound.identity.global_user_id;

        let err = store
            .delete_identity(t1, user, IdentifierType::Email)
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::LastIdentifier));

        store
            .bind_identity(&NewBinding {
                global_user_id: Some(user),
                ..binding(t1, "p-1", "+84344381024")
            })
            .await
            .unwrap();
        store
            .delete_identity(t1, user, IdentifierType::Email)
            .await
            .unwrap();
        assert_eq!(store.list_identities(t1, user).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn cross_type_replace_swaps_the_row_and_keeps_the_provider_identity() {
        let (store, t1) = store_with_tenant().await;
        let bound = store
            .bind_identity(&binding(t1, "p-1", "+84344381024"))
            .await
            .unwrap();

        let replaced = store
            .replace_identity(
                t1,
                bound.identity.global_user_id,
                bound.identity.identity_id,
                &Identifier::Email("new@b.com".to_string()),
            )
            .await
            .unwrap();

        assert_eq!(replaced.identifier_type, IdentifierType::Email);
        assert_eq!(replaced.provider_user_id, "p-1");
        let rows = store
            .list_identities(t1, bound.identity.global_user_id)
            .await
            .unwrap();
        assert_eq!(rows, vec![replaced]);
    }

    #[tokio::test]
    async fn tenant_with_identities_cannot_be_deleted() {
        let (store, t1) = store_with_tenant().await;
        let bound = store.bind_identity(&binding(t1, "p-1", "a@b.com")).await.unwrap();

        assert!(matches!(
            store.delete_tenant(t1).await,
            Err(StoreError::HasDependents)
        ));

        store.delete_orphan_identity(bound.identity.identity_id).await.unwrap();
        assert!(store.find_mapping(t1, bound.identity.global_user_id).await.unwrap().is_none());
        store.delete_tenant(t1).await.unwrap();
    }
}
