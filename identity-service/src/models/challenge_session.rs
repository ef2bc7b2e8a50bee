//! Challenge session - the pending one-time-code confirmation between "code sent"
//! and "code confirmed". Lives only in the challenge store, under a TTL.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::{Identifier, IdentifierType};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChallengeType {
    Login,
    Register,
    ChangeIdentifier,
}

impl ChallengeType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChallengeType::Login => "login",
            ChallengeType::Register => "register",
            ChallengeType::ChangeIdentifier => "change_identifier",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChallengeSession {
    pub flow_id: String,
    pub tenant_id: Uuid,
    pub global_user_id: Option<Uuid>,
    pub tenant_user_id: Option<String>,
    pub identifier: String,
    pub identifier_type: IdentifierType,
    pub challenge_type: ChallengeType,
    /// Row being replaced by a `change_identifier` challenge.
    pub identity_id: Option<Uuid>,
    pub lang: Option<String>,
}

impl ChallengeSession {
    /// Registration of a brand-new identifier.
    pub fn register(
        flow_id: String,
        tenant_id: Uuid,
        identifier: &Identifier,
        lang: Option<String>,
    ) -> Self {
        Self {
            flow_id,
            tenant_id,
            global_user_id: None,
            tenant_user_id: None,
            identifier: identifier.value().to_string(),
            identifier_type: identifier.kind(),
            challenge_type: ChallengeType::Register,
            identity_id: None,
            lang,
        }
    }

    /// Registration of an extra identifier for an existing global user.
    pub fn add_identifier(
        flow_id: String,
        tenant_id: Uuid,
        global_user_id: Uuid,
        tenant_user_id: String,
        identifier: &Identifier,
    ) -> Self {
        Self {
            global_user_id: Some(global_user_id),
            tenant_user_id: Some(tenant_user_id),
            ..Self::register(flow_id, tenant_id, identifier, None)
        }
    }

    pub fn login(
        flow_id: String,
        tenant_id: Uuid,
        global_user_id: Uuid,
        tenant_user_id: String,
        identifier: &Identifier,
    ) -> Self {
        Self {
            flow_id,
            tenant_id,
            global_user_id: Some(global_user_id),
            tenant_user_id: Some(tenant_user_id),
            identifier: identifier.value().to_string(),
            identifier_type: identifier.kind(),
            challenge_type: ChallengeType::Login,
            identity_id: None,
            lang: None,
        }
    }

    pub fn change_identifier(
        flow_id: String,
        tenant_id: Uuid,
        global_user_id: Uuid,
        tenant_user_id: String,
        identifier: &Identifier,
        identity_id: Uuid,
    ) -> Self {
        Self {
            flow_id,
            tenant_id,
            global_user_id: Some(global_user_id),
            tenant_user_id: Some(tenant_user_id),
            identifier: identifier.value().to_string(),
            identifier_type: identifier.kind(),
            challenge_type: ChallengeType::ChangeIdentifier,
            identity_id: Some(identity_id),
            lang: None,
        }
    }

    pub fn identifier(&self) -> Identifier {
        Identifier::from_parts(self.identifier_type, self.identifier.clone())
    }

    /// Store key for a flow id.
    pub fn key(flow_id: &str) -> String {
        format!("challenge:{}", flow_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn serializes_with_snake_case_tags() {
        let id = Identifier::Phone("+84344381024".to_string());
        let session = ChallengeSession::register("flow-1".to_string(), Uuid::nil(), &id, None);
        let json = serde_json::to_value(&session).unwrap();
        assert_eq!(json["challenge_type"], "register");
        assert_eq!(json["identifier_type"], "phone");

        let change = ChallengeSession::change_identifier(
            "flow-2".to_string(),
            Uuid::nil(),
            Uuid::nil(),
            "provider-1".to_string(),
            &id,
            Uuid::nil(),
        );
        let json = serde_json::to_value(&change).unwrap();
        assert_eq!(json["challenge_type"], "change_identifier");
    }

    #[test]
    fn add_identifier_is_a_register_challenge_bound_to_a_user() {
        let id = Identifier::Email("a@b.com".to_string());
        let user = Uuid::new_v4();
        let session = ChallengeSession::add_identifier(
            "flow".to_string(),
            Uuid::nil(),
            user,
            "provider-1".to_string(),
            &id,
        );
        assert_eq!(session.challenge_type, ChallengeType::Register);
        assert_eq!(session.global_user_id, Some(user));
        assert_eq!(session.identifier(), id);
    }
}
