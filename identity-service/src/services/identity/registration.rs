use chrono::Utc;
use uuid::Uuid;

use super::{
    code_not_accepted, identifier_write_error, unexpected_completion, IdentityService,
};
use crate::models::{
    normalize_lang, AuthResult, ChallengeSession, ChallengeStarted, ChallengeType, Identifier,
    Tenant,
};
use crate::services::error::ServiceError;
use crate::services::provider::{
    FlowProgress, ProviderEndpoints, ProviderError, ProviderIdentity, Traits,
};
use crate::services::rate_limit::RateLimitAction;
use crate::services::store::NewBinding;

impl IdentityService {
    /// Start registering a new identifier: clear stale state left by earlier
    /// failed attempts, then have the provider send a one-time code.
    #[tracing::instrument(skip(self, identifier), fields(tenant_id = %tenant_id))]
    pub async fn register(
        &self,
        tenant_id: Uuid,
        identifier: &str,
        lang: Option<&str>,
    ) -> Result<ChallengeStarted, ServiceError> {
        let identifier = Identifier::parse(identifier)?;
        let lang = lang
            .map(|raw| {
                normalize_lang(raw)
                    .ok_or_else(|| ServiceError::Validation(format!("Unsupported language: {}", raw)))
            })
            .transpose()?;
        let tenant = self.tenant(tenant_id).await?;
        self.guard(RateLimitAction::Register, tenant_id, identifier.value())
            .await?;

        let ep = tenant.endpoints();
        self.clear_stale_registration(&tenant, &ep, &identifier).await?;

        let flow = self.provider.registration_initialize(&ep).await?;
        let traits = Traits::for_registration(&identifier, &tenant_id.to_string(), lang.clone());
        match self
            .provider
            .registration_submit(&ep, &flow.id, &traits, None)
            .await?
        {
            FlowProgress::CodeSent => {}
            FlowProgress::Completed(_) => return Err(unexpected_completion("Registration")),
        }

        self.save_challenge(ChallengeSession::register(flow.id, tenant_id, &identifier, lang))
            .await
    }

    /// Confirm a registration code and bind the new provider identity.
    #[tracing::instrument(skip(self, code), fields(tenant_id = %tenant_id))]
    pub async fn verify_register(
        &self,
        tenant_id: Uuid,
        flow_id: &str,
        code: &str,
    ) -> Result<AuthResult, ServiceError> {
        let tenant = self.tenant(tenant_id).await?;
        let key = self
            .guard(RateLimitAction::VerifyRegister, tenant_id, flow_id)
            .await?;
        let challenge = self
            .consume_challenge(tenant_id, flow_id, Some(ChallengeType::Register))
            .await?;

        let result = self.complete_registration(&tenant, challenge, code).await?;
        self.reset_attempts(&key).await;
        Ok(result)
    }

    /// Ask the provider to verify an extra identifier for a signed-in user.
    /// Confirmed through `verify_register` like a registration.
    #[tracing::instrument(skip(self, identifier), fields(tenant_id = %tenant_id, global_user_id = %global_user_id))]
    pub async fn add_new_identifier(
        &self,
        tenant_id: Uuid,
        global_user_id: Uuid,
        tenant_user_id: &str,
        identifier: &str,
    ) -> Result<ChallengeStarted, ServiceError> {
        let identifier = Identifier::parse(identifier)?;
        let tenant = self.tenant(tenant_id).await?;
        self.guard(RateLimitAction::AddIdentifier, tenant_id, identifier.value())
            .await?;
        self.ensure_binding(tenant_id, global_user_id, tenant_user_id)
            .await?;

        let identities = self.store.list_identities(tenant_id, global_user_id).await?;
        if identities
            .iter()
            .any(|i| i.identifier_type == identifier.kind())
        {
            return Err(ServiceError::IdentifierTypeAlreadyBound);
        }
        if self.store.find_identity(tenant_id, &identifier).await?.is_some() {
            return Err(ServiceError::IdentifierAlreadyExists);
        }

        let ep = tenant.endpoints();
        let flow = self.provider.verification_initialize(&ep).await?;
        match self
            .provider
            .verification_submit(&ep, &flow.id, &identifier, None)
            .await?
        {
            FlowProgress::CodeSent => {}
            FlowProgress::Completed(()) => return Err(unexpected_completion("Verification")),
        }

        self.save_challenge(ChallengeSession::add_identifier(
            flow.id,
            tenant_id,
            global_user_id,
            tenant_user_id.to_string(),
            &identifier,
        ))
        .await
    }

    pub(super) async fn complete_registration(
        &self,
        tenant: &Tenant,
        challenge: ChallengeSession,
        code: &str,
    ) -> Result<AuthResult, ServiceError> {
        match (challenge.global_user_id, challenge.tenant_user_id.clone()) {
            (Some(global_user_id), Some(tenant_user_id)) => {
                self.bind_added_identifier(tenant, &challenge, global_user_id, &tenant_user_id, code)
                    .await
            }
            _ => self.bind_new_registration(tenant, &challenge, code).await,
        }
    }

    async fn bind_new_registration(
        &self,
        tenant: &Tenant,
        challenge: &ChallengeSession,
        code: &str,
    ) -> Result<AuthResult, ServiceError> {
        let ep = tenant.endpoints();
        let identifier = challenge.identifier();
        let traits = Traits::for_registration(
            &identifier,
            &tenant.tenant_id.to_string(),
            challenge.lang.clone(),
        );

        let session = match self
            .provider
            .registration_submit(&ep, &challenge.flow_id, &traits, Some(code))
            .await?
        {
            FlowProgress::Completed(session) => session,
            FlowProgress::CodeSent => return Err(code_not_accepted()),
        };

        let binding = NewBinding {
            tenant_id: tenant.tenant_id,
            global_user_id: None,
            provider_user_id: session.identity.id.clone(),
            identifier,
            lang: challenge.lang.clone(),
        };
        let bound = match self.store.bind_identity(&binding).await {
            Ok(bound) => bound,
            Err(e) => {
                // The provider identity stays behind; the next registration of
                // this identifier finds and removes it.
                tracing::error!(
                    error = %e,
                    tenant_id = %tenant.tenant_id,
                    provider_user_id = %session.identity.id,
                    "Failed to bind confirmed registration"
                );
                if let Err(revoke) = self.provider.revoke_session(&ep, &session.id).await {
                    tracing::warn!(error = %revoke, "Failed to revoke session of unbound identity");
                }
                return Err(ServiceError::IamRegistrationFailed(e));
            }
        };

        tracing::info!(
            tenant_id = %tenant.tenant_id,
            global_user_id = %bound.identity.global_user_id,
            created_global_user = bound.created_global_user,
            "Registration bound"
        );

        let user = self
            .user_view(
                tenant.tenant_id,
                bound.identity.global_user_id,
                bound.mapping.tenant_user_id,
                Some(&session.identity.traits),
            )
            .await?;
        Ok(AuthResult::with_session(user, &session))
    }

    async fn bind_added_identifier(
        &self,
        tenant: &Tenant,
        challenge: &ChallengeSession,
        global_user_id: Uuid,
        tenant_user_id: &str,
        code: &str,
    ) -> Result<AuthResult, ServiceError> {
        let ep = tenant.endpoints();
        let identifier = challenge.identifier();

        match self
            .provider
            .verification_submit(&ep, &challenge.flow_id, &identifier, Some(code))
            .await?
        {
            FlowProgress::Completed(()) => {}
            FlowProgress::CodeSent => return Err(code_not_accepted()),
        }

        let identity = self
            .provider
            .update_identifier_trait(&ep, tenant_user_id, &identifier)
            .await?;

        let binding = NewBinding {
            tenant_id: tenant.tenant_id,
            global_user_id: Some(global_user_id),
            provider_user_id: tenant_user_id.to_string(),
            identifier: identifier.clone(),
            lang: None,
        };
        if let Err(e) = self.store.bind_identity(&binding).await {
            tracing::warn!(error = %e, tenant_id = %tenant.tenant_id, "Failed to bind added identifier");
            self.rollback_trait_change(&ep, tenant.tenant_id, tenant_user_id, None, &identifier)
                .await?;
            return Err(identifier_write_error(e));
        }

        tracing::info!(
            tenant_id = %tenant.tenant_id,
            %global_user_id,
            identifier_type = %identifier.kind(),
            "Identifier added"
        );

        let user = self
            .user_view(
                tenant.tenant_id,
                global_user_id,
                tenant_user_id.to_string(),
                Some(&identity.traits),
            )
            .await?;
        Ok(AuthResult::without_session(user))
    }

    /// Remove leftovers of earlier half-finished registrations of `identifier`.
    ///
    /// A store row whose provider identity is gone, or no longer carries the
    /// identifier, is an orphan and is deleted. A provider identity of this
    /// tenant carrying the identifier that no store mapping points at is
    /// deleted too, once it is older than a challenge lifetime. A live
    /// binding on both sides, or an identity of another tenant, means the
    /// identifier is taken.
    async fn clear_stale_registration(
        &self,
        tenant: &Tenant,
        ep: &ProviderEndpoints,
        identifier: &Identifier,
    ) -> Result<(), ServiceError> {
        let tenant_id = tenant.tenant_id;

        if let Some(row) = self.store.find_identity(tenant_id, identifier).await? {
            match self.provider.get_identity(ep, &row.provider_user_id).await {
                Ok(identity)
                    if identity.traits.identifier(identifier.kind()) == Some(identifier.value()) =>
                {
                    return Err(ServiceError::AlreadyRegistered);
                }
                Ok(_) => {
                    tracing::warn!(
                        %tenant_id,
                        identity_id = %row.identity_id,
                        "Removing identity row the provider no longer carries"
                    );
                    self.store.delete_orphan_identity(row.identity_id).await?;
                }
                Err(ProviderError::NotFound) => {
                    tracing::warn!(
                        %tenant_id,
                        provider_user_id = %row.provider_user_id,
                        "Removing binding of a deleted provider identity"
                    );
                    self.store
                        .delete_orphan_binding(tenant_id, &row.provider_user_id)
                        .await?;
                }
                Err(e) => return Err(e.into()),
            }
        }

        if let Some(identity) = self.provider.find_identity_by_identifier(ep, identifier).await? {
            // Tenants may share a provider; only this tenant's identities are ours to remove.
            if identity.traits.tenant.as_deref() != Some(tenant_id.to_string().as_str()) {
                return Err(ServiceError::AlreadyRegistered);
            }
            if self
                .store
                .find_mapping_by_tenant_user(tenant_id, &identity.id)
                .await?
                .is_some()
            {
                return Err(ServiceError::AlreadyRegistered);
            }
            if !self.outlived_confirmation(&identity) {
                tracing::info!(
                    %tenant_id,
                    provider_user_id = %identity.id,
                    "Unbound provider identity is recent; its registration may still be binding"
                );
                return Err(ServiceError::FlowConflict(
                    "a registration of this identifier is still being confirmed".to_string(),
                ));
            }
            tracing::warn!(
                %tenant_id,
                provider_user_id = %identity.id,
                "Removing provider identity that was never bound"
            );
            self.provider.delete_identity(ep, &identity.id).await?;
        }

        Ok(())
    }

    /// An unbound identity younger than a challenge lifetime may belong to a
    /// confirmation whose bind has not committed yet. Unknown age counts as young.
    fn outlived_confirmation(&self, identity: &ProviderIdentity) -> bool {
        identity.created_at.is_some_and(|created_at| {
            let age = Utc::now().signed_duration_since(created_at).num_seconds();
            u64::try_from(age).is_ok_and(|age| age >= self.settings.challenge_ttl_seconds)
        })
    }
}
