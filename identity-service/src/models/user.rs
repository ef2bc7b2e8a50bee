//! Caller-facing user and authentication results.

use chrono::{DateTime, Utc};
use serde::Serialize;
use uuid::Uuid;

use super::{IdentifierType, UserIdentifierMapping, UserIdentity};
use crate::services::provider::{ProviderEndpoints, ProviderSession, Traits};

/// The reconciled view of one global user inside one tenant.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct User {
    pub global_user_id: Uuid,
    pub tenant_id: Uuid,
    pub tenant_user_id: String,
    pub email: Option<String>,
    pub phone: Option<String>,
    pub lang: Option<String>,
}

impl User {
    /// Build the user from store rows, falling back to provider traits only
    /// for values the store does not have.
    pub fn reconcile(
        global_user_id: Uuid,
        tenant_id: Uuid,
        tenant_user_id: String,
        identities: &[UserIdentity],
        mapping: Option<&UserIdentifierMapping>,
        traits: Option<&Traits>,
    ) -> Self {
        let stored = |kind: IdentifierType| {
            identities
                .iter()
                .find(|i| i.identifier_type == kind)
                .map(|i| i.identifier_value.clone())
        };

        Self {
            global_user_id,
            tenant_id,
            tenant_user_id,
            email: stored(IdentifierType::Email)
                .or_else(|| traits.and_then(|t| t.email.clone())),
            phone: stored(IdentifierType::Phone)
                .or_else(|| traits.and_then(|t| t.phone.clone())),
            lang: mapping
                .and_then(|m| m.lang.clone())
                .or_else(|| traits.and_then(|t| t.lang.clone())),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct AuthResult {
    pub user: User,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_token: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<DateTime<Utc>>,
    pub active: bool,
}

impl AuthResult {
    pub fn with_session(user: User, session: &ProviderSession) -> Self {
        Self {
            user,
            session_token: session.token.clone(),
            expires_at: session.expires_at,
            active: session.active,
        }
    }

    /// Confirmation that bound a new identifier without issuing a session.
    pub fn without_session(user: User) -> Self {
        Self {
            user,
            session_token: None,
            expires_at: None,
            active: true,
        }
    }
}

/// A one-time code has been dispatched; confirm it with `flow_id`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ChallengeStarted {
    pub flow_id: String,
    pub identifier_type: IdentifierType,
    pub expires_in: u64,
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum LoginOutcome {
    ChallengeSent(ChallengeStarted),
    Authenticated(AuthResult),
}

/// Result of confirming any kind of challenge.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "challenge_type", rename_all = "snake_case")]
pub enum VerificationOutcome {
    Login(AuthResult),
    Register(AuthResult),
    ChangeIdentifier(User),
}

/// The global user behind a validated session token.
#[derive(Debug, Clone)]
pub struct Principal {
    pub global_user_id: Uuid,
    pub tenant_id: Uuid,
    pub tenant_user_id: String,
    pub session: ProviderSession,
    /// The tenant's provider endpoints, for follow-up calls on the session.
    pub endpoints: ProviderEndpoints,
}
