//! Identity provider adapter.
//!
//! The provider owns credential flows, one-time codes and sessions for every
//! tenant. Each call is scoped by the tenant's [`ProviderEndpoints`].

mod kratos;
mod mock;

pub use kratos::KratosClient;
pub use mock::{MockIdentityProvider, MOCK_VALID_CODE};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use secrecy::SecretString;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::models::{Identifier, IdentifierType};

/// Public (self-service) and admin base URLs of one tenant's provider.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProviderEndpoints {
    pub public_url: String,
    pub admin_url: String,
}

/// Identity traits stored on the provider side.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Traits {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phone: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tenant: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lang: Option<String>,
}

impl Traits {
    pub fn for_registration(identifier: &Identifier, tenant: &str, lang: Option<String>) -> Self {
        let mut traits = Traits {
            tenant: Some(tenant.to_string()),
            lang,
            ..Default::default()
        };
        traits.set_identifier(identifier.kind(), Some(identifier.value().to_string()));
        traits
    }

    pub fn identifier(&self, kind: IdentifierType) -> Option<&str> {
        match kind {
            IdentifierType::Email => self.email.as_deref(),
            IdentifierType::Phone => self.phone.as_deref(),
        }
    }

    pub fn set_identifier(&mut self, kind: IdentifierType, value: Option<String>) {
        match kind {
            IdentifierType::Email => self.email = value,
            IdentifierType::Phone => self.phone = value,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ProviderIdentity {
    pub id: String,
    #[serde(default)]
    pub traits: Traits,
    #[serde(default)]
    pub state: Option<String>,
    #[serde(default)]
    pub created_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProviderSession {
    pub id: String,
    /// Only present when the session was just issued.
    pub token: Option<String>,
    pub active: bool,
    pub expires_at: Option<DateTime<Utc>>,
    pub identity: ProviderIdentity,
}

/// A self-service flow handle.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct Flow {
    pub id: String,
    #[serde(default)]
    pub expires_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub state: Option<String>,
}

/// Result of submitting a code-based flow step.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FlowProgress<T> {
    /// A one-time code was dispatched; submit again with the code.
    CodeSent,
    Completed(T),
}

#[derive(Debug, Clone)]
pub enum LoginMethod {
    Code {
        identifier: String,
        code: Option<String>,
    },
    Password {
        identifier: String,
        password: SecretString,
    },
}

/// A single field-level message from a rejected flow submission.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FieldMessage {
    pub field: Option<String>,
    pub message: String,
}

impl FieldMessage {
    pub fn new(field: Option<&str>, message: impl Into<String>) -> Self {
        Self {
            field: field.map(str::to_string),
            message: message.into(),
        }
    }
}

#[derive(Debug, Clone, Error)]
pub enum ProviderError {
    #[error("provider resource not found")]
    NotFound,

    #[error("provider rejected the submission")]
    ValidationRejected(Vec<FieldMessage>),

    #[error("provider network error: {0}")]
    Network(String),

    #[error("provider flow state conflict: {0}")]
    StateConflict(String),

    #[error("provider session is missing or invalid")]
    Unauthorized,

    #[error("unexpected provider response: {0}")]
    Protocol(String),
}

impl ProviderError {
    pub fn rejected(field: Option<&str>, message: impl Into<String>) -> Self {
        ProviderError::ValidationRejected(vec![FieldMessage::new(field, message)])
    }
}

#[async_trait]
pub trait IdentityProvider: Send + Sync {
    // ==================== Registration ====================

    async fn registration_initialize(&self, ep: &ProviderEndpoints) -> Result<Flow, ProviderError>;

    /// Submit traits. Without a code this dispatches one; with a code it
    /// completes the registration and issues a session.
    async fn registration_submit(
        &self,
        ep: &ProviderEndpoints,
        flow_id: &str,
        traits: &Traits,
        code: Option<&str>,
    ) -> Result<FlowProgress<ProviderSession>, ProviderError>;

    async fn registration_get(
        &self,
        ep: &ProviderEndpoints,
        flow_id: &str,
    ) -> Result<Flow, ProviderError>;

    // ==================== Login ====================

    async fn login_initialize(&self, ep: &ProviderEndpoints) -> Result<Flow, ProviderError>;

    async fn login_submit(
        &self,
        ep: &ProviderEndpoints,
        flow_id: &str,
        method: &LoginMethod,
    ) -> Result<FlowProgress<ProviderSession>, ProviderError>;

    // ==================== Verification ====================

    async fn verification_initialize(&self, ep: &ProviderEndpoints) -> Result<Flow, ProviderError>;

    async fn verification_get(
        &self,
        ep: &ProviderEndpoints,
        flow_id: &str,
    ) -> Result<Flow, ProviderError>;

    async fn verification_submit(
        &self,
        ep: &ProviderEndpoints,
        flow_id: &str,
        identifier: &Identifier,
        code: Option<&str>,
    ) -> Result<FlowProgress<()>, ProviderError>;

    // ==================== Sessions ====================

    async fn whoami(
        &self,
        ep: &ProviderEndpoints,
        session_token: &str,
    ) -> Result<ProviderSession, ProviderError>;

    async fn get_session(
        &self,
        ep: &ProviderEndpoints,
        session_id: &str,
    ) -> Result<ProviderSession, ProviderError>;

    async fn revoke_session(
        &self,
        ep: &ProviderEndpoints,
        session_id: &str,
    ) -> Result<(), ProviderError>;

    async fn extend_session(
        &self,
        ep: &ProviderEndpoints,
        session_id: &str,
    ) -> Result<ProviderSession, ProviderError>;

    async fn logout(&self, ep: &ProviderEndpoints, session_token: &str)
        -> Result<(), ProviderError>;

    // ==================== Admin ====================

    async fn get_identity(
        &self,
        ep: &ProviderEndpoints,
        identity_id: &str,
    ) -> Result<ProviderIdentity, ProviderError>;

    async fn find_identity_by_identifier(
        &self,
        ep: &ProviderEndpoints,
        identifier: &Identifier,
    ) -> Result<Option<ProviderIdentity>, ProviderError>;

    async fn delete_identity(
        &self,
        ep: &ProviderEndpoints,
        identity_id: &str,
    ) -> Result<(), ProviderError>;

    /// Set the `email` or `phone` trait to the identifier's value.
    async fn update_identifier_trait(
        &self,
        ep: &ProviderEndpoints,
        identity_id: &str,
        identifier: &Identifier,
    ) -> Result<ProviderIdentity, ProviderError>;

    /// Remove the `email` or `phone` trait.
    async fn delete_identifier(
        &self,
        ep: &ProviderEndpoints,
        identity_id: &str,
        kind: IdentifierType,
    ) -> Result<ProviderIdentity, ProviderError>;

    async fn update_lang_trait(
        &self,
        ep: &ProviderEndpoints,
        identity_id: &str,
        lang: &str,
    ) -> Result<ProviderIdentity, ProviderError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registration_traits_carry_identifier_tenant_and_lang() {
        let traits = Traits::for_registration(
            &Identifier::Phone("+84344381024".to_string()),
            "tenant-1",
            Some("en".to_string()),
        );
        assert_eq!(traits.identifier(IdentifierType::Phone), Some("+84344381024"));
        assert_eq!(traits.identifier(IdentifierType::Email), None);

        let json = serde_json::to_value(&traits).unwrap();
        assert_eq!(json["tenant"], "tenant-1");
        assert_eq!(json["lang"], "en");
        assert!(json.get("email").is_none());
    }
}
