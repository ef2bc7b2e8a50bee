use uuid::Uuid;

use super::IdentityService;
use crate::models::{normalize_lang, AuthResult, Principal, User};
use crate::services::error::ServiceError;

impl IdentityService {
    /// Validate a session token with the provider and find its binding.
    #[tracing::instrument(skip(self, session_token), fields(tenant_id = %tenant_id))]
    pub async fn resolve_principal(
        &self,
        tenant_id: Uuid,
        session_token: &str,
    ) -> Result<Principal, ServiceError> {
        let endpoints = self.tenant(tenant_id).await?.endpoints();
        let session = self.provider.whoami(&endpoints, session_token).await?;
        if !session.active {
            return Err(ServiceError::Unauthorized);
        }

        let mapping = self
            .store
            .find_mapping_by_tenant_user(tenant_id, &session.identity.id)
            .await?
            .ok_or(ServiceError::Unauthorized)?;

        Ok(Principal {
            global_user_id: mapping.global_user_id,
            tenant_id,
            tenant_user_id: mapping.tenant_user_id,
            session,
            endpoints,
        })
    }

    pub async fn profile(&self, tenant_id: Uuid, session_token: &str) -> Result<User, ServiceError> {
        let principal = self.resolve_principal(tenant_id, session_token).await?;
        self.user_view(
            tenant_id,
            principal.global_user_id,
            principal.tenant_user_id,
            Some(&principal.session.identity.traits),
        )
        .await
    }

    /// Provider trait first, then the mapping.
    #[tracing::instrument(skip(self, session_token), fields(tenant_id = %tenant_id))]
    pub async fn update_lang(
        &self,
        tenant_id: Uuid,
        session_token: &str,
        lang: &str,
    ) -> Result<User, ServiceError> {
        let lang = normalize_lang(lang)
            .ok_or_else(|| ServiceError::Validation(format!("Unsupported language: {}", lang)))?;
        let principal = self.resolve_principal(tenant_id, session_token).await?;

        let identity = self
            .provider
            .update_lang_trait(&principal.endpoints, &principal.tenant_user_id, &lang)
            .await?;
        self.store
            .update_lang(tenant_id, principal.global_user_id, &lang)
            .await?;

        self.user_view(
            tenant_id,
            principal.global_user_id,
            principal.tenant_user_id,
            Some(&identity.traits),
        )
        .await
    }

    /// Extend the session behind `session_token`. The token itself stays valid.
    #[tracing::instrument(skip(self, session_token), fields(tenant_id = %tenant_id))]
    pub async fn refresh_token(
        &self,
        tenant_id: Uuid,
        session_token: &str,
    ) -> Result<AuthResult, ServiceError> {
        let principal = self.resolve_principal(tenant_id, session_token).await?;

        let mut session = self
            .provider
            .extend_session(&principal.endpoints, &principal.session.id)
            .await?;
        session.token = Some(session_token.to_string());

        let user = self
            .user_view(
                tenant_id,
                principal.global_user_id,
                principal.tenant_user_id,
                Some(&session.identity.traits),
            )
            .await?;
        Ok(AuthResult::with_session(user, &session))
    }

    /// Only the provider session has to be valid; a session whose binding is
    /// gone can still be ended.
    #[tracing::instrument(skip(self, session_token), fields(tenant_id = %tenant_id))]
    pub async fn logout(&self, tenant_id: Uuid, session_token: &str) -> Result<(), ServiceError> {
        let endpoints = self.tenant(tenant_id).await?.endpoints();
        let session = self.provider.whoami(&endpoints, session_token).await?;
        if !session.active {
            return Err(ServiceError::Unauthorized);
        }
        self.provider.logout(&endpoints, session_token).await?;

        tracing::info!(%tenant_id, provider_user_id = %session.identity.id, "Logged out");
        Ok(())
    }
}
