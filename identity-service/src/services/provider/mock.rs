use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use chrono::{Duration, Utc};
use secrecy::ExposeSecret;
use uuid::Uuid;

use super::{
    Flow, FlowProgress, IdentityProvider, LoginMethod, ProviderEndpoints, ProviderError,
    ProviderIdentity, ProviderSession, Traits,
};
use crate::models::{Identifier, IdentifierType};

/// The only one-time code the mock accepts.
pub const MOCK_VALID_CODE: &str = "000000";

#[derive(Debug, Clone)]
struct MockFlow {
    completed: bool,
    identifier: Option<Identifier>,
}

#[derive(Default)]
struct MockState {
    identities: HashMap<String, ProviderIdentity>,
    /// Admin endpoint each identity lives behind; one per tenant.
    realms: HashMap<String, String>,
    passwords: HashMap<String, String>,
    flows: HashMap<String, MockFlow>,
    /// Sessions by token.
    sessions: HashMap<String, ProviderSession>,
    calls: Vec<&'static str>,
    /// Remaining successful calls per method before it starts failing.
    failures: HashMap<&'static str, usize>,
}

/// In-process identity provider for tests and local runs.
///
/// Every call is recorded; failures can be injected per method name.
#[derive(Default)]
pub struct MockIdentityProvider {
    state: Mutex<MockState>,
}

impl MockIdentityProvider {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> Result<MutexGuard<'_, MockState>, ProviderError> {
        self.state
            .lock()
            .map_err(|e| ProviderError::Network(format!("mock provider mutex poisoned: {}", e)))
    }

    /// Record the call and apply any injected failure.
    fn enter(&self, call: &'static str) -> Result<MutexGuard<'_, MockState>, ProviderError> {
        let mut state = self.state()?;
        state.calls.push(call);
        if let Some(remaining) = state.failures.get_mut(call) {
            if *remaining == 0 {
                return Err(ProviderError::Network(format!("injected failure in {}", call)));
            }
            *remaining -= 1;
        }
        Ok(state)
    }

    /// Make `call` fail with a network error from now on.
    pub fn fail_on(&self, call: &'static str) {
        self.fail_after(call, 0);
    }

    /// Let `call` succeed `successes` more times, then fail.
    pub fn fail_after(&self, call: &'static str, successes: usize) {
        if let Ok(mut state) = self.state() {
            state.failures.insert(call, successes);
        }
    }

    pub fn clear_failures(&self) {
        if let Ok(mut state) = self.state() {
            state.failures.clear();
        }
    }

    pub fn calls(&self) -> Vec<&'static str> {
        self.state().map(|s| s.calls.clone()).unwrap_or_default()
    }

    pub fn clear_calls(&self) {
        if let Ok(mut state) = self.state() {
            state.calls.clear();
        }
    }

    pub fn identity(&self, identity_id: &str) -> Option<ProviderIdentity> {
        self.state()
            .ok()
            .and_then(|s| s.identities.get(identity_id).cloned())
    }

    pub fn identity_count(&self) -> usize {
        self.state().map(|s| s.identities.len()).unwrap_or_default()
    }

    /// Drop an identity without telling anyone, as if it was removed out of band.
    pub fn forget_identity(&self, identity_id: &str) {
        if let Ok(mut state) = self.state() {
            state.identities.remove(identity_id);
            state.realms.remove(identity_id);
        }
    }

    /// Move an identity's creation time `age` into the past.
    pub fn backdate_identity(&self, identity_id: &str, age: Duration) {
        if let Ok(mut state) = self.state() {
            if let Some(identity) = state.identities.get_mut(identity_id) {
                identity.created_at = identity.created_at.map(|t| t - age);
            }
        }
    }

    pub fn set_password(&self, identity_id: &str, password: &str) {
        if let Ok(mut state) = self.state() {
            state
                .passwords
                .insert(identity_id.to_string(), password.to_string());
        }
    }

    fn new_flow(state: &mut MockState) -> Flow {
        let id = Uuid::new_v4().to_string();
        state.flows.insert(
            id.clone(),
            MockFlow {
                completed: false,
                identifier: None,
            },
        );
        Flow {
            id,
            expires_at: Some(Utc::now() + Duration::minutes(10)),
            state: Some("choose_method".to_string()),
        }
    }

    fn open_flow<'a>(state: &'a mut MockState, flow_id: &str) -> Result<&'a mut MockFlow, ProviderError> {
        let flow = state.flows.get_mut(flow_id).ok_or(ProviderError::NotFound)?;
        if flow.completed {
            return Err(ProviderError::StateConflict(
                "flow has already been completed".to_string(),
            ));
        }
        Ok(flow)
    }

    fn check_code(code: &str) -> Result<(), ProviderError> {
        if code == MOCK_VALID_CODE {
            Ok(())
        } else {
            Err(ProviderError::rejected(
                Some("code"),
                "The verification code is invalid or has already been used",
            ))
        }
    }

    fn issue_session(state: &mut MockState, identity: ProviderIdentity) -> ProviderSession {
        let token = format!("ory_st_{}", Uuid::new_v4().simple());
        let session = ProviderSession {
            id: Uuid::new_v4().to_string(),
            token: Some(token.clone()),
            active: true,
            expires_at: Some(Utc::now() + Duration::hours(24)),
            identity,
        };
        state.sessions.insert(token, session.clone());
        session
    }

    fn find_by_identifier<'a>(
        state: &'a MockState,
        ep: &ProviderEndpoints,
        identifier: &str,
    ) -> Option<&'a ProviderIdentity> {
        state.identities.values().find(|i| {
            state.realms.get(&i.id) == Some(&ep.admin_url)
                && (i.traits.email.as_deref() == Some(identifier)
                    || i.traits.phone.as_deref() == Some(identifier))
        })
    }

    fn identity_mut<'a>(
        state: &'a mut MockState,
        identity_id: &str,
    ) -> Result<&'a mut ProviderIdentity, ProviderError> {
        state
            .identities
            .get_mut(identity_id)
            .ok_or(ProviderError::NotFound)
    }

    fn session_by_id<'a>(state: &'a mut MockState, session_id: &str) -> Option<&'a mut ProviderSession> {
        state.sessions.values_mut().find(|s| s.id == session_id)
    }
}

#[async_trait]
impl IdentityProvider for MockIdentityProvider {
    async fn registration_initialize(&self, _ep: &ProviderEndpoints) -> Result<Flow, ProviderError> {
        let mut state = self.enter("registration_initialize")?;
        Ok(Self::new_flow(&mut state))
    }

    async fn registration_submit(
        &self,
        ep: &ProviderEndpoints,
        flow_id: &str,
        traits: &Traits,
        code: Option<&str>,
    ) -> Result<FlowProgress<ProviderSession>, ProviderError> {
        let mut state = self.enter("registration_submit")?;

        let taken = [traits.email.as_deref(), traits.phone.as_deref()]
            .into_iter()
            .flatten()
            .any(|value| Self::find_by_identifier(&state, ep, value).is_some());
        if taken {
            return Err(ProviderError::rejected(
                None,
                "An account with the same identifier exists already",
            ));
        }

        let flow = Self::open_flow(&mut state, flow_id)?;
        let Some(code) = code else {
            return Ok(FlowProgress::CodeSent);
        };
        Self::check_code(code)?;
        flow.completed = true;

        let identity = ProviderIdentity {
            id: Uuid::new_v4().to_string(),
            traits: traits.clone(),
            state: Some("active".to_string()),
            created_at: Some(Utc::now()),
        };
        state.identities.insert(identity.id.clone(), identity.clone());
        state.realms.insert(identity.id.clone(), ep.admin_url.clone());
        Ok(FlowProgress::Completed(Self::issue_session(&mut state, identity)))
    }

    async fn registration_get(
        &self,
        _ep: &ProviderEndpoints,
        flow_id: &str,
    ) -> Result<Flow, ProviderError> {
        let state = self.enter("registration_get")?;
        let flow = state.flows.get(flow_id).ok_or(ProviderError::NotFound)?;
        Ok(Flow {
            id: flow_id.to_string(),
            expires_at: None,
            state: Some(if flow.completed { "passed_challenge" } else { "sent_email" }.to_string()),
        })
    }

    async fn login_initialize(&self, _ep: &ProviderEndpoints) -> Result<Flow, ProviderError> {
        let mut state = self.enter("login_initialize")?;
        Ok(Self::new_flow(&mut state))
    }

    async fn login_submit(
        &self,
        ep: &ProviderEndpoints,
        flow_id: &str,
        method: &LoginMethod,
    ) -> Result<FlowProgress<ProviderSession>, ProviderError> {
        let mut state = self.enter("login_submit")?;
        Self::open_flow(&mut state, flow_id)?;

        let (identifier, code) = match method {
            LoginMethod::Code { identifier, code } => (identifier, code.as_deref()),
            LoginMethod::Password {
                identifier,
                password,
            } => {
                let identity = Self::find_by_identifier(&state, ep, identifier)
                    .cloned()
                    .ok_or_else(|| ProviderError::rejected(None, "The provided credentials are invalid"))?;
                let matches = state
                    .passwords
                    .get(&identity.id)
                    .is_some_and(|p| p == password.expose_secret());
                if !matches {
                    return Err(ProviderError::rejected(None, "The provided credentials are invalid"));
                }
                Self::open_flow(&mut state, flow_id)?.completed = true;
                return Ok(FlowProgress::Completed(Self::issue_session(&mut state, identity)));
            }
        };

        let identity = Self::find_by_identifier(&state, ep, identifier)
            .cloned()
            .ok_or_else(|| ProviderError::rejected(Some("identifier"), "This account does not exist"))?;

        let Some(code) = code else {
            return Ok(FlowProgress::CodeSent);
        };
        Self::check_code(code)?;
        Self::open_flow(&mut state, flow_id)?.completed = true;
        Ok(FlowProgress::Completed(Self::issue_session(&mut state, identity)))
    }

    async fn verification_initialize(&self, _ep: &ProviderEndpoints) -> Result<Flow, ProviderError> {
        let mut state = self.enter("verification_initialize")?;
        Ok(Self::new_flow(&mut state))
    }

    async fn verification_get(
        &self,
        _ep: &ProviderEndpoints,
        flow_id: &str,
    ) -> Result<Flow, ProviderError> {
        let state = self.enter("verification_get")?;
        let flow = state.flows.get(flow_id).ok_or(ProviderError::NotFound)?;
        Ok(Flow {
            id: flow_id.to_string(),
            expires_at: None,
            state: Some(if flow.completed { "passed_challenge" } else { "sent_email" }.to_string()),
        })
    }

    async fn verification_submit(
        &self,
        _ep: &ProviderEndpoints,
        flow_id: &str,
        identifier: &Identifier,
        code: Option<&str>,
    ) -> Result<FlowProgress<()>, ProviderError> {
        let mut state = self.enter("verification_submit")?;
        let flow = Self::open_flow(&mut state, flow_id)?;

        let Some(code) = code else {
            flow.identifier = Some(identifier.clone());
            return Ok(FlowProgress::CodeSent);
        };
        if flow.identifier.as_ref() != Some(identifier) {
            return Err(ProviderError::StateConflict(
                "no code was sent to this address in this flow".to_string(),
            ));
        }
        Self::check_code(code)?;
        flow.completed = true;
        Ok(FlowProgress::Completed(()))
    }

    async fn whoami(
        &self,
        ep: &ProviderEndpoints,
        session_token: &str,
    ) -> Result<ProviderSession, ProviderError> {
        let state = self.enter("whoami")?;
        let session = state
            .sessions
            .get(session_token)
            .filter(|s| s.active && state.realms.get(&s.identity.id) == Some(&ep.admin_url))
            .ok_or(ProviderError::Unauthorized)?;
        let identity = state
            .identities
            .get(&session.identity.id)
            .cloned()
            .ok_or(ProviderError::Unauthorized)?;

        Ok(ProviderSession {
            token: None,
            identity,
            ..session.clone()
        })
    }

    async fn get_session(
        &self,
        _ep: &ProviderEndpoints,
        session_id: &str,
    ) -> Result<ProviderSession, ProviderError> {
        let mut state = self.enter("get_session")?;
        let session = Self::session_by_id(&mut state, session_id).ok_or(ProviderError::NotFound)?;
        Ok(ProviderSession {
            token: None,
            ..session.clone()
        })
    }

    async fn revoke_session(
        &self,
        _ep: &ProviderEndpoints,
        session_id: &str,
    ) -> Result<(), ProviderError> {
        let mut state = self.enter("revoke_session")?;
        let session = Self::session_by_id(&mut state, session_id).ok_or(ProviderError::NotFound)?;
        session.active = false;
        Ok(())
    }

    async fn extend_session(
        &self,
        _ep: &ProviderEndpoints,
        session_id: &str,
    ) -> Result<ProviderSession, ProviderError> {
        let mut state = self.enter("extend_session")?;
        let session = Self::session_by_id(&mut state, session_id).ok_or(ProviderError::NotFound)?;
        if !session.active {
            return Err(ProviderError::StateConflict("session is no longer active".to_string()));
        }
        session.expires_at = Some(Utc::now() + Duration::hours(24));
        Ok(ProviderSession {
            token: None,
            ..session.clone()
        })
    }

    async fn logout(
        &self,
        _ep: &ProviderEndpoints,
        session_token: &str,
    ) -> Result<(), ProviderError> {
        let mut state = self.enter("logout")?;
        let session = state
            .sessions
            .get_mut(session_token)
            .filter(|s| s.active)
            .ok_or(ProviderError::Unauthorized)?;
        session.active = false;
        Ok(())
    }

    async fn get_identity(
        &self,
        _ep: &ProviderEndpoints,
        identity_id: &str,
    ) -> Result<ProviderIdentity, ProviderError> {
        let state = self.enter("get_identity")?;
        state
            .identities
            .get(identity_id)
            .cloned()
            .ok_or(ProviderError::NotFound)
    }

    async fn find_identity_by_identifier(
        &self,
        ep: &ProviderEndpoints,
        identifier: &Identifier,
    ) -> Result<Option<ProviderIdentity>, ProviderError> {
        let state = self.enter("find_identity_by_identifier")?;
        Ok(Self::find_by_identifier(&state, ep, identifier.value()).cloned())
    }

    async fn delete_identity(
        &self,
        _ep: &ProviderEndpoints,
        identity_id: &str,
    ) -> Result<(), ProviderError> {
        let mut state = self.enter("delete_identity")?;
        state.realms.remove(identity_id);
        state
            .identities
            .remove(identity_id)
            .map(|_| ())
            .ok_or(ProviderError::NotFound)
    }

    async fn update_identifier_trait(
        &self,
        ep: &ProviderEndpoints,
        identity_id: &str,
        identifier: &Identifier,
    ) -> Result<ProviderIdentity, ProviderError> {
        let mut state = self.enter("update_identifier_trait")?;
        let taken_by_other = Self::find_by_identifier(&state, ep, identifier.value())
            .is_some_and(|i| i.id != identity_id);
        if taken_by_other {
            return Err(ProviderError::StateConflict(
                "identifier is bound to another identity".to_string(),
            ));
        }

        let identity = Self::identity_mut(&mut state, identity_id)?;
        identity
            .traits
            .set_identifier(identifier.kind(), Some(identifier.value().to_string()));
        Ok(identity.clone())
    }

    async fn delete_identifier(
        &self,
        _ep: &ProviderEndpoints,
        identity_id: &str,
        kind: IdentifierType,
    ) -> Result<ProviderIdentity, ProviderError> {
        let mut state = self.enter("delete_identifier")?;
        let identity = Self::identity_mut(&mut state, identity_id)?;
        identity.traits.set_identifier(kind, None);
        Ok(identity.clone())
    }

    async fn update_lang_trait(
        &self,
        _ep: &ProviderEndpoints,
        identity_id: &str,
        lang: &str,
    ) -> Result<ProviderIdentity, ProviderError> {
        let mut state = self.enter("update_lang_trait")?;
        let identity = Self::identity_mut(&mut state, identity_id)?;
        identity.traits.lang = Some(lang.to_string());
        Ok(identity.clone())
    }
}
