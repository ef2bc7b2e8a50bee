//! Identity reconciliation.
//!
//! Drives the identity provider and the store as a saga: the provider
//! confirms before the store commits, the provider deletes before the store
//! deletes, and stale rows on either side are cleaned up lazily by the next
//! registration that touches the identifier.

mod identifier;
mod login;
mod registration;
mod session;
mod tenant;

use std::sync::Arc;
use std::time::Duration;

use uuid::Uuid;

use super::challenge::ChallengeStore;
use super::error::ServiceError;
use super::provider::{
    FieldMessage, IdentityProvider, ProviderEndpoints, ProviderError, Traits,
};
use super::rate_limit::{RateLimitAction, RateLimiter};
use super::store::{IdentityStore, StoreError};
use crate::config::IdentityConfig;
use crate::models::{
    ChallengeSession, ChallengeStarted, ChallengeType, Identifier, Tenant, User,
};

pub const INCONSISTENCY_TARGET: &str = "identity::inconsistency";

/// Tunables for the orchestrator.
#[derive(Debug, Clone)]
pub struct IdentitySettings {
    pub challenge_ttl_seconds: u64,
    pub max_attempts: u32,
    pub window: Duration,
}

impl Default for IdentitySettings {
    fn default() -> Self {
        Self {
            challenge_ttl_seconds: 300,
            max_attempts: 5,
            window: Duration::from_secs(300),
        }
    }
}

impl From<&IdentityConfig> for IdentitySettings {
    fn from(config: &IdentityConfig) -> Self {
        Self {
            challenge_ttl_seconds: config.challenge.ttl_seconds,
            max_attempts: config.rate_limit.max_attempts,
            window: config.rate_limit.window(),
        }
    }
}

#[derive(Clone)]
pub struct IdentityService {
    store: Arc<dyn IdentityStore>,
    provider: Arc<dyn IdentityProvider>,
    challenges: Arc<dyn ChallengeStore>,
    limiter: Arc<dyn RateLimiter>,
    settings: IdentitySettings,
}

impl IdentityService {
    pub fn new(
        store: Arc<dyn IdentityStore>,
        provider: Arc<dyn IdentityProvider>,
        challenges: Arc<dyn ChallengeStore>,
        limiter: Arc<dyn RateLimiter>,
        settings: IdentitySettings,
    ) -> Self {
        Self {
            store,
            provider,
            challenges,
            limiter,
            settings,
        }
    }

    pub async fn health_check(&self) -> Result<(), ServiceError> {
        self.store.health_check().await?;
        self.challenges
            .health_check()
            .await
            .map_err(ServiceError::Cache)?;
        Ok(())
    }

    async fn tenant(&self, tenant_id: Uuid) -> Result<Tenant, ServiceError> {
        self.store
            .get_tenant(tenant_id)
            .await?
            .ok_or(ServiceError::TenantNotFound)
    }

    /// Check the limit for `action` on `subject`, then count this attempt.
    /// Returns the key so a successful confirmation can reset it.
    async fn guard(
        &self,
        action: RateLimitAction,
        tenant_id: Uuid,
        subject: &str,
    ) -> Result<String, ServiceError> {
        let key = action.key(tenant_id, subject);
        let limited = self
            .limiter
            .is_limited(&key, self.settings.max_attempts, self.settings.window)
            .await
            .map_err(ServiceError::Cache)?;

        if limited {
            tracing::warn!(action = action.as_str(), %tenant_id, "Rate limit exceeded");
            return Err(ServiceError::RateLimitExceeded {
                retry_after: self.settings.window.as_secs(),
            });
        }

        self.limiter
            .register_attempt(&key, self.settings.window)
            .await
            .map_err(ServiceError::Cache)?;
        Ok(key)
    }

    async fn reset_attempts(&self, key: &str) {
        if let Err(e) = self.limiter.reset_attempts(key).await {
            tracing::warn!(error = %e, "Failed to reset rate limit attempts");
        }
    }

    async fn save_challenge(
        &self,
        session: ChallengeSession,
    ) -> Result<ChallengeStarted, ServiceError> {
        self.challenges
            .save(&session, self.settings.challenge_ttl_seconds)
            .await
            .map_err(ServiceError::Cache)?;

        tracing::info!(
            flow_id = %session.flow_id,
            challenge_type = session.challenge_type.as_str(),
            identifier_type = %session.identifier_type,
            "Challenge issued"
        );

        Ok(ChallengeStarted {
            flow_id: session.flow_id,
            identifier_type: session.identifier_type,
            expires_in: self.settings.challenge_ttl_seconds,
        })
    }

    /// Load and delete the challenge. A challenge issued for another tenant
    /// or of another type is treated as missing.
    async fn consume_challenge(
        &self,
        tenant_id: Uuid,
        flow_id: &str,
        expected: Option<ChallengeType>,
    ) -> Result<ChallengeSession, ServiceError> {
        let session = self
            .challenges
            .consume(flow_id)
            .await
            .map_err(ServiceError::Cache)?
            .ok_or(ServiceError::SessionNotFound)?;

        if session.tenant_id != tenant_id {
            tracing::warn!(%flow_id, %tenant_id, "Challenge presented to the wrong tenant");
            return Err(ServiceError::SessionNotFound);
        }
        if expected.is_some_and(|t| t != session.challenge_type) {
            tracing::warn!(
                %flow_id,
                challenge_type = session.challenge_type.as_str(),
                "Challenge presented to the wrong confirmation"
            );
            return Err(ServiceError::SessionNotFound);
        }
        Ok(session)
    }

    /// The user as callers see it: store identifiers first, provider traits
    /// only where the store has nothing.
    async fn user_view(
        &self,
        tenant_id: Uuid,
        global_user_id: Uuid,
        tenant_user_id: String,
        traits: Option<&Traits>,
    ) -> Result<User, ServiceError> {
        let identities = self.store.list_identities(tenant_id, global_user_id).await?;
        let mapping = self.store.find_mapping(tenant_id, global_user_id).await?;
        Ok(User::reconcile(
            global_user_id,
            tenant_id,
            tenant_user_id,
            &identities,
            mapping.as_ref(),
            traits,
        ))
    }

    /// The caller's claimed binding must exist in this tenant.
    async fn ensure_binding(
        &self,
        tenant_id: Uuid,
        global_user_id: Uuid,
        tenant_user_id: &str,
    ) -> Result<(), ServiceError> {
        match self.store.find_mapping(tenant_id, global_user_id).await? {
            Some(mapping) if mapping.tenant_user_id == tenant_user_id => Ok(()),
            _ => Err(ServiceError::IdentityNotFound),
        }
    }

    /// Undo a provider trait change after the store refused it.
    ///
    /// Restores `previous` and, for a cross-type change, removes the new
    /// type's trait. If that fails the two systems have diverged.
    async fn rollback_trait_change(
        &self,
        ep: &ProviderEndpoints,
        tenant_id: Uuid,
        provider_user_id: &str,
        previous: Option<&Identifier>,
        attempted: &Identifier,
    ) -> Result<(), ServiceError> {
        let restored = match previous {
            Some(previous) => self
                .provider
                .update_identifier_trait(ep, provider_user_id, previous)
                .await
                .map(|_| ()),
            None => Ok(()),
        };
        let cleared = if previous.map(Identifier::kind) != Some(attempted.kind()) {
            self.provider
                .delete_identifier(ep, provider_user_id, attempted.kind())
                .await
                .map(|_| ())
        } else {
            Ok(())
        };

        match restored.and(cleared) {
            Ok(()) => {
                tracing::info!(%tenant_id, %provider_user_id, "Provider trait change rolled back");
                Ok(())
            }
            Err(e) => Err(self.report_divergence(tenant_id, provider_user_id, previous, attempted, &e)),
        }
    }

    fn report_divergence(
        &self,
        tenant_id: Uuid,
        provider_user_id: &str,
        previous: Option<&Identifier>,
        attempted: &Identifier,
        error: &ProviderError,
    ) -> ServiceError {
        tracing::error!(
            target: INCONSISTENCY_TARGET,
            fatal = true,
            %tenant_id,
            %provider_user_id,
            previous_type = previous.map(|p| p.kind().as_str()),
            attempted_type = %attempted.kind(),
            error = %error,
            "Provider rollback failed; provider and store disagree and need operator reconciliation"
        );
        ServiceError::Inconsistent(format!(
            "provider identity {} in tenant {} could not be rolled back",
            provider_user_id, tenant_id
        ))
    }
}

/// A code step that did not complete is a rejected code.
fn code_not_accepted() -> ServiceError {
    ServiceError::ProviderRejected(vec![FieldMessage::new(
        Some("code"),
        "The verification code was not accepted",
    )])
}

fn unexpected_completion(step: &str) -> ServiceError {
    ServiceError::Provider(ProviderError::Protocol(format!(
        "{} completed without a one-time code",
        step
    )))
}

/// Store failures on identifier writes: a unique violation means someone
/// else holds the identifier.
fn identifier_write_error(err: StoreError) -> ServiceError {
    match err {
        StoreError::UniqueViolation { .. } => ServiceError::IdentifierAlreadyExists,
        StoreError::NotFound => ServiceError::IdentityNotFound,
        StoreError::LastIdentifier => ServiceError::CannotDeleteOnlyIdentifier,
        other => ServiceError::Store(other),
    }
}
