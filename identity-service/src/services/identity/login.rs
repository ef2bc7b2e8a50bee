use secrecy::SecretString;
use uuid::Uuid;

use super::{code_not_accepted, unexpected_completion, IdentityService};
use crate::models::{
    AuthResult, ChallengeSession, ChallengeStarted, ChallengeType, Identifier, IdentifierType,
    LoginOutcome, Tenant, VerificationOutcome,
};
use crate::services::error::ServiceError;
use crate::services::provider::{FlowProgress, LoginMethod, ProviderSession};
use crate::services::rate_limit::RateLimitAction;

impl IdentityService {
    /// Sign in with a password, or start a one-time-code login when no
    /// password is given.
    #[tracing::instrument(skip(self, identifier, password), fields(tenant_id = %tenant_id))]
    pub async fn login(
        &self,
        tenant_id: Uuid,
        identifier: &str,
        password: Option<SecretString>,
    ) -> Result<LoginOutcome, ServiceError> {
        let identifier = Identifier::parse(identifier)?;
        let tenant = self.tenant(tenant_id).await?;
        self.guard(RateLimitAction::Login, tenant_id, identifier.value())
            .await?;

        match password {
            Some(password) => {
                let result = self.password_login(&tenant, &identifier, password).await?;
                Ok(LoginOutcome::Authenticated(result))
            }
            None => {
                let started = self.start_login_challenge(&tenant, &identifier).await?;
                Ok(LoginOutcome::ChallengeSent(started))
            }
        }
    }

    /// Confirm a login code.
    #[tracing::instrument(skip(self, code), fields(tenant_id = %tenant_id))]
    pub async fn verify_login(
        &self,
        tenant_id: Uuid,
        flow_id: &str,
        code: &str,
    ) -> Result<AuthResult, ServiceError> {
        let tenant = self.tenant(tenant_id).await?;
        let key = self
            .guard(RateLimitAction::VerifyLogin, tenant_id, flow_id)
            .await?;
        let challenge = self
            .consume_challenge(tenant_id, flow_id, Some(ChallengeType::Login))
            .await?;

        let result = self.complete_login(&tenant, &challenge, code).await?;
        self.reset_attempts(&key).await;
        Ok(result)
    }

    #[tracing::instrument(skip(self, email), fields(tenant_id = %tenant_id))]
    pub async fn challenge_with_email(
        &self,
        tenant_id: Uuid,
        email: &str,
    ) -> Result<ChallengeStarted, ServiceError> {
        self.challenge_with(tenant_id, email, IdentifierType::Email)
            .await
    }

    #[tracing::instrument(skip(self, phone), fields(tenant_id = %tenant_id))]
    pub async fn challenge_with_phone(
        &self,
        tenant_id: Uuid,
        phone: &str,
    ) -> Result<ChallengeStarted, ServiceError> {
        self.challenge_with(tenant_id, phone, IdentifierType::Phone)
            .await
    }

    /// Confirm any pending challenge; the stored challenge type decides what
    /// the code completes.
    #[tracing::instrument(skip(self, code), fields(tenant_id = %tenant_id))]
    pub async fn challenge_verification(
        &self,
        tenant_id: Uuid,
        flow_id: &str,
        code: &str,
    ) -> Result<VerificationOutcome, ServiceError> {
        let tenant = self.tenant(tenant_id).await?;
        let key = self
            .guard(RateLimitAction::VerifyChallenge, tenant_id, flow_id)
            .await?;
        let challenge = self.consume_challenge(tenant_id, flow_id, None).await?;

        let outcome = match challenge.challenge_type {
            ChallengeType::Login => {
                VerificationOutcome::Login(self.complete_login(&tenant, &challenge, code).await?)
            }
            ChallengeType::Register => VerificationOutcome::Register(
                self.complete_registration(&tenant, challenge, code).await?,
            ),
            ChallengeType::ChangeIdentifier => VerificationOutcome::ChangeIdentifier(
                self.complete_change(&tenant, &challenge, code).await?,
            ),
        };
        self.reset_attempts(&key).await;
        Ok(outcome)
    }

    async fn challenge_with(
        &self,
        tenant_id: Uuid,
        raw: &str,
        expected: IdentifierType,
    ) -> Result<ChallengeStarted, ServiceError> {
        let identifier = Identifier::parse(raw)?;
        if identifier.kind() != expected {
            return Err(ServiceError::Validation(format!(
                "Expected a {} identifier",
                expected
            )));
        }
        let tenant = self.tenant(tenant_id).await?;
        self.guard(RateLimitAction::Challenge, tenant_id, identifier.value())
            .await?;
        self.start_login_challenge(&tenant, &identifier).await
    }

    async fn start_login_challenge(
        &self,
        tenant: &Tenant,
        identifier: &Identifier,
    ) -> Result<ChallengeStarted, ServiceError> {
        let identity = self
            .store
            .find_identity(tenant.tenant_id, identifier)
            .await?
            .ok_or(ServiceError::IdentityNotFound)?;

        let ep = tenant.endpoints();
        let flow = self.provider.login_initialize(&ep).await?;
        let method = LoginMethod::Code {
            identifier: identifier.value().to_string(),
            code: None,
        };
        match self.provider.login_submit(&ep, &flow.id, &method).await? {
            FlowProgress::CodeSent => {}
            FlowProgress::Completed(_) => return Err(unexpected_completion("Login")),
        }

        self.save_challenge(ChallengeSession::login(
            flow.id,
            tenant.tenant_id,
            identity.global_user_id,
            identity.provider_user_id,
            identifier,
        ))
        .await
    }

    async fn password_login(
        &self,
        tenant: &Tenant,
        identifier: &Identifier,
        password: SecretString,
    ) -> Result<AuthResult, ServiceError> {
        if self
            .store
            .find_identity(tenant.tenant_id, identifier)
            .await?
            .is_none()
        {
            return Err(ServiceError::IdentityNotFound);
        }

        let ep = tenant.endpoints();
        let flow = self.provider.login_initialize(&ep).await?;
        let method = LoginMethod::Password {
            identifier: identifier.value().to_string(),
            password,
        };
        let session = match self.provider.login_submit(&ep, &flow.id, &method).await? {
            FlowProgress::Completed(session) => session,
            FlowProgress::CodeSent => {
                return Err(ServiceError::Validation(
                    "Password login requires a second factor".to_string(),
                ))
            }
        };
        self.authenticated(tenant, session).await
    }

    pub(super) async fn complete_login(
        &self,
        tenant: &Tenant,
        challenge: &ChallengeSession,
        code: &str,
    ) -> Result<AuthResult, ServiceError> {
        let ep = tenant.endpoints();
        let method = LoginMethod::Code {
            identifier: challenge.identifier.clone(),
            code: Some(code.to_string()),
        };
        let session = match self
            .provider
            .login_submit(&ep, &challenge.flow_id, &method)
            .await?
        {
            FlowProgress::Completed(session) => session,
            FlowProgress::CodeSent => return Err(code_not_accepted()),
        };
        self.authenticated(tenant, session).await
    }

    /// Resolve the store binding of a freshly issued session.
    async fn authenticated(
        &self,
        tenant: &Tenant,
        session: ProviderSession,
    ) -> Result<AuthResult, ServiceError> {
        let mapping = self
            .store
            .find_mapping_by_tenant_user(tenant.tenant_id, &session.identity.id)
            .await?
            .ok_or_else(|| {
                tracing::warn!(
                    tenant_id = %tenant.tenant_id,
                    provider_user_id = %session.identity.id,
                    "Provider session has no binding"
                );
                ServiceError::IdentityNotFound
            })?;

        tracing::info!(
            tenant_id = %tenant.tenant_id,
            global_user_id = %mapping.global_user_id,
            "Login completed"
        );

        let user = self
            .user_view(
                tenant.tenant_id,
                mapping.global_user_id,
                mapping.tenant_user_id,
                Some(&session.identity.traits),
            )
            .await?;
        Ok(AuthResult::with_session(user, &session))
    }
}
