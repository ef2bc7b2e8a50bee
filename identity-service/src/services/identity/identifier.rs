use uuid::Uuid;

use super::{code_not_accepted, identifier_write_error, unexpected_completion, IdentityService};
use crate::models::{
    ChallengeSession, ChallengeStarted, Identifier, IdentifierType, Tenant, User,
};
use crate::services::error::ServiceError;
use crate::services::provider::FlowProgress;
use crate::services::rate_limit::RateLimitAction;
use crate::services::store::StoreError;

impl IdentityService {
    /// Start replacing one of the user's identifiers with `identifier`.
    ///
    /// Replaces the row of the same type when the user has one; otherwise the
    /// user's single row of the other type is converted.
    #[tracing::instrument(skip(self, identifier), fields(tenant_id = %tenant_id, global_user_id = %global_user_id))]
    pub async fn change_identifier(
        &self,
        tenant_id: Uuid,
        global_user_id: Uuid,
        tenant_user_id: &str,
        identifier: &str,
    ) -> Result<ChallengeStarted, ServiceError> {
        let identifier = Identifier::parse(identifier)?;
        let tenant = self.tenant(tenant_id).await?;
        self.guard(
            RateLimitAction::ChangeIdentifier,
            tenant_id,
            identifier.value(),
        )
        .await?;
        self.ensure_binding(tenant_id, global_user_id, tenant_user_id)
            .await?;

        if let Some(owner) = self.store.find_identity(tenant_id, &identifier).await? {
            if owner.global_user_id != global_user_id {
                return Err(ServiceError::IdentifierAlreadyExists);
            }
            return Err(ServiceError::Validation(
                "Identifier is already bound to this user".to_string(),
            ));
        }

        let identities = self.store.list_identities(tenant_id, global_user_id).await?;
        let target = identities
            .iter()
            .find(|i| i.identifier_type == identifier.kind())
            .or_else(|| identities.first())
            .ok_or(ServiceError::IdentityNotFound)?;

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

        self.save_challenge(ChallengeSession::change_identifier(
            flow.id,
            tenant_id,
            global_user_id,
            tenant_user_id.to_string(),
            &identifier,
            target.identity_id,
        ))
        .await
    }

    /// Remove the user's identifier of `kind`. The provider trait goes first;
    /// a store row left behind is cleaned up by the next registration.
    #[tracing::instrument(skip(self), fields(tenant_id = %tenant_id, global_user_id = %global_user_id))]
    pub async fn delete_identifier(
        &self,
        tenant_id: Uuid,
        global_user_id: Uuid,
        tenant_user_id: &str,
        kind: IdentifierType,
    ) -> Result<User, ServiceError> {
        let tenant = self.tenant(tenant_id).await?;
        self.ensure_binding(tenant_id, global_user_id, tenant_user_id)
            .await?;

        let identities = self.store.list_identities(tenant_id, global_user_id).await?;
        if !identities.iter().any(|i| i.identifier_type == kind) {
            return Err(ServiceError::IdentityNotFound);
        }
        if identities.len() <= 1 {
            return Err(ServiceError::CannotDeleteOnlyIdentifier);
        }

        let ep = tenant.endpoints();
        let identity = self
            .provider
            .delete_identifier(&ep, tenant_user_id, kind)
            .await?;

        match self.store.delete_identity(tenant_id, global_user_id, kind).await {
            Ok(_) => {}
            Err(StoreError::LastIdentifier) => {
                tracing::warn!(
                    %tenant_id,
                    %global_user_id,
                    identifier_type = %kind,
                    "Store refused to remove the last identifier after the provider trait was removed"
                );
                return Err(ServiceError::CannotDeleteOnlyIdentifier);
            }
            Err(e) => return Err(identifier_write_error(e)),
        }

        tracing::info!(%tenant_id, %global_user_id, identifier_type = %kind, "Identifier deleted");

        self.user_view(
            tenant_id,
            global_user_id,
            tenant_user_id.to_string(),
            Some(&identity.traits),
        )
        .await
    }

    /// Confirm the code, move the provider trait, then the store row. A store
    /// failure rolls the provider back.
    pub(super) async fn complete_change(
        &self,
        tenant: &Tenant,
        challenge: &ChallengeSession,
        code: &str,
    ) -> Result<User, ServiceError> {
        let tenant_id = tenant.tenant_id;
        let (Some(global_user_id), Some(tenant_user_id), Some(identity_id)) = (
            challenge.global_user_id,
            challenge.tenant_user_id.as_deref(),
            challenge.identity_id,
        ) else {
            return Err(ServiceError::SessionNotFound);
        };
        let ep = tenant.endpoints();
        let next = challenge.identifier();

        match self
            .provider
            .verification_submit(&ep, &challenge.flow_id, &next, Some(code))
            .await?
        {
            FlowProgress::Completed(()) => {}
            FlowProgress::CodeSent => return Err(code_not_accepted()),
        }

        let previous = self
            .store
            .list_identities(tenant_id, global_user_id)
            .await?
            .into_iter()
            .find(|i| i.identity_id == identity_id)
            .map(|i| i.identifier())
            .ok_or(ServiceError::IdentityNotFound)?;

        self.provider
            .update_identifier_trait(&ep, tenant_user_id, &next)
            .await?;
        if previous.kind() != next.kind() {
            if let Err(e) = self
                .provider
                .delete_identifier(&ep, tenant_user_id, previous.kind())
                .await
            {
                self.rollback_trait_change(&ep, tenant_id, tenant_user_id, Some(&previous), &next)
                    .await?;
                return Err(e.into());
            }
        }

        if let Err(e) = self
            .store
            .replace_identity(tenant_id, global_user_id, identity_id, &next)
            .await
        {
            tracing::warn!(error = %e, %tenant_id, %global_user_id, "Failed to replace identity row");
            self.rollback_trait_change(&ep, tenant_id, tenant_user_id, Some(&previous), &next)
                .await?;
            return Err(identifier_write_error(e));
        }

        tracing::info!(
            %tenant_id,
            %global_user_id,
            previous_type = %previous.kind(),
            identifier_type = %next.kind(),
            "Identifier changed"
        );

        self.user_view(tenant_id, global_user_id, tenant_user_id.to_string(), None)
            .await
    }
}
