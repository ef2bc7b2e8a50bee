//! Ory Kratos client.
//!
//! Speaks the native (`/api`) self-service flows on the tenant's public
//! endpoint and the admin API on its admin endpoint.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::{Client, RequestBuilder, StatusCode};
use secrecy::{ExposeSecret, SecretString};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::json;

use super::{
    FieldMessage, Flow, FlowProgress, IdentityProvider, LoginMethod, ProviderEndpoints,
    ProviderError, ProviderIdentity, ProviderSession, Traits,
};
use crate::config::ProviderConfig;
use crate::models::{Identifier, IdentifierType};

const SESSION_TOKEN_HEADER: &str = "X-Session-Token";
const PASSED_CHALLENGE: &str = "passed_challenge";

#[derive(Clone)]
pub struct KratosClient {
    client: Client,
    admin_token: Option<SecretString>,
}

#[derive(Debug, Deserialize)]
struct SessionBody {
    id: String,
    #[serde(default)]
    active: bool,
    #[serde(default)]
    expires_at: Option<DateTime<Utc>>,
    identity: ProviderIdentity,
}

/// Body of a completed registration or login submission.
#[derive(Debug, Deserialize)]
struct SessionEnvelope {
    #[serde(default)]
    session_token: Option<String>,
    session: Option<SessionBody>,
}

#[derive(Debug, Default, Deserialize)]
struct UiText {
    text: String,
    #[serde(rename = "type", default)]
    kind: String,
}

#[derive(Debug, Default, Deserialize)]
struct UiNodeAttributes {
    #[serde(default)]
    name: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct UiNode {
    #[serde(default)]
    attributes: UiNodeAttributes,
    #[serde(default)]
    messages: Vec<UiText>,
}

#[derive(Debug, Default, Deserialize)]
struct Ui {
    #[serde(default)]
    messages: Vec<UiText>,
    #[serde(default)]
    nodes: Vec<UiNode>,
}

/// Flow body as returned on 400 or on a non-final step.
#[derive(Debug, Default, Deserialize)]
struct FlowBody {
    #[serde(default)]
    state: Option<String>,
    #[serde(default)]
    ui: Ui,
}

#[derive(Debug, Deserialize)]
struct GenericError {
    error: GenericErrorDetail,
}

#[derive(Debug, Deserialize)]
struct GenericErrorDetail {
    #[serde(default)]
    message: String,
    #[serde(default)]
    reason: Option<String>,
}

impl From<SessionBody> for ProviderSession {
    fn from(body: SessionBody) -> Self {
        ProviderSession {
            id: body.id,
            token: None,
            active: body.active,
            expires_at: body.expires_at,
            identity: body.identity,
        }
    }
}

impl FlowBody {
    fn errors(&self) -> Vec<FieldMessage> {
        let flow_level = self
            .ui
            .messages
            .iter()
            .filter(|m| m.kind == "error")
            .map(|m| FieldMessage::new(None, m.text.clone()));

        let field_level = self.ui.nodes.iter().flat_map(|node| {
            node.messages
                .iter()
                .filter(|m| m.kind == "error")
                .map(|m| FieldMessage::new(node.attributes.name.as_deref(), m.text.clone()))
        });

        flow_level.chain(field_level).collect()
    }
}

impl KratosClient {
    pub fn new(config: &ProviderConfig) -> Result<Self, ProviderError> {
        let client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_seconds))
            .build()
            .map_err(|e| ProviderError::Protocol(format!("failed to build HTTP client: {}", e)))?;

        Ok(Self {
            client,
            admin_token: config.admin_token.clone(),
        })
    }

    fn admin(&self, request: RequestBuilder) -> RequestBuilder {
        match &self.admin_token {
            Some(token) => request.bearer_auth(token.expose_secret()),
            None => request,
        }
    }

    async fn execute(&self, request: RequestBuilder) -> Result<(StatusCode, String), ProviderError> {
        let response = request
            .header("Accept", "application/json")
            .send()
            .await
            .map_err(|e| ProviderError::Network(e.to_string()))?;

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| ProviderError::Network(e.to_string()))?;

        tracing::debug!(status = %status, "Kratos response");
        Ok((status, body))
    }

    async fn json<T: DeserializeOwned>(&self, request: RequestBuilder) -> Result<T, ProviderError> {
        let (status, body) = self.execute(request).await?;
        if status.is_success() {
            parse(&body)
        } else {
            Err(error_for(status, &body))
        }
    }

    async fn empty(&self, request: RequestBuilder) -> Result<(), ProviderError> {
        let (status, body) = self.execute(request).await?;
        if status.is_success() {
            Ok(())
        } else {
            Err(error_for(status, &body))
        }
    }

    /// Submit a code step. A 400 that carries no error messages is the
    /// provider's "code sent" answer for code-method flows.
    async fn submit_code_step(
        &self,
        request: RequestBuilder,
        with_code: bool,
    ) -> Result<FlowProgress<ProviderSession>, ProviderError> {
        let (status, body) = self.execute(request).await?;

        if status.is_success() {
            let envelope: SessionEnvelope = parse(&body)?;
            return match envelope.session {
                Some(session) => {
                    let mut session = ProviderSession::from(session);
                    session.token = envelope.session_token;
                    Ok(FlowProgress::Completed(session))
                }
                None if !with_code => Ok(FlowProgress::CodeSent),
                None => Err(ProviderError::Protocol(
                    "completed flow carried no session".to_string(),
                )),
            };
        }

        if is_validation_status(status) && !with_code {
            let flow: FlowBody = parse(&body).unwrap_or_default();
            if flow.errors().is_empty() {
                return Ok(FlowProgress::CodeSent);
            }
        }

        Err(error_for(status, &body))
    }

    async fn patch_traits(
        &self,
        ep: &ProviderEndpoints,
        identity_id: &str,
        patch: serde_json::Value,
    ) -> Result<ProviderIdentity, ProviderError> {
        let url = format!("{}/admin/identities/{}", ep.admin_url, identity_id);
        self.json(self.admin(self.client.patch(url)).json(&patch))
            .await
    }
}

fn trait_path(kind: IdentifierType) -> String {
    format!("/traits/{}", kind.as_str())
}

fn is_validation_status(status: StatusCode) -> bool {
    matches!(
        status,
        StatusCode::BAD_REQUEST | StatusCode::UNPROCESSABLE_ENTITY
    )
}

fn parse<T: DeserializeOwned>(body: &str) -> Result<T, ProviderError> {
    serde_json::from_str(body).map_err(|e| ProviderError::Protocol(e.to_string()))
}

fn generic_message(body: &str) -> String {
    serde_json::from_str::<GenericError>(body)
        .map(|e| e.error.reason.unwrap_or(e.error.message))
        .unwrap_or_else(|_| body.chars().take(200).collect())
}

/// Map a non-2xx provider response onto the adapter's error taxonomy.
fn error_for(status: StatusCode, body: &str) -> ProviderError {
    match status {
        s if is_validation_status(s) => {
            let mut errors = serde_json::from_str::<FlowBody>(body)
                .map(|flow| flow.errors())
                .unwrap_or_default();
            if errors.is_empty() {
                errors.push(FieldMessage::new(None, generic_message(body)));
            }
            ProviderError::ValidationRejected(errors)
        }
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => ProviderError::Unauthorized,
        StatusCode::NOT_FOUND => ProviderError::NotFound,
        StatusCode::CONFLICT | StatusCode::GONE => {
            ProviderError::StateConflict(generic_message(body))
        }
        s if s.is_server_error() => ProviderError::Network(format!("provider returned {}", s)),
        s => ProviderError::Protocol(format!("unexpected status {}", s)),
    }
}

#[async_trait]
impl IdentityProvider for KratosClient {
    async fn registration_initialize(&self, ep: &ProviderEndpoints) -> Result<Flow, ProviderError> {
        let url = format!("{}/self-service/registration/api", ep.public_url);
        self.json(self.client.get(url)).await
    }

    async fn registration_submit(
        &self,
        ep: &ProviderEndpoints,
        flow_id: &str,
        traits: &Traits,
        code: Option<&str>,
    ) -> Result<FlowProgress<ProviderSession>, ProviderError> {
        let url = format!("{}/self-service/registration", ep.public_url);
        let mut body = json!({ "method": "code", "traits": traits });
        if let Some(code) = code {
            body["code"] = json!(code);
        }

        let request = self.client.post(url).query(&[("flow", flow_id)]).json(&body);
        self.submit_code_step(request, code.is_some()).await
    }

    async fn registration_get(
        &self,
        ep: &ProviderEndpoints,
        flow_id: &str,
    ) -> Result<Flow, ProviderError> {
        let url = format!("{}/self-service/registration/flows", ep.public_url);
        self.json(self.client.get(url).query(&[("id", flow_id)]))
            .await
    }

    async fn login_initialize(&self, ep: &ProviderEndpoints) -> Result<Flow, ProviderError> {
        let url = format!("{}/self-service/login/api", ep.public_url);
        self.json(self.client.get(url)).await
    }

    async fn login_submit(
        &self,
        ep: &ProviderEndpoints,
        flow_id: &str,
        method: &LoginMethod,
    ) -> Result<FlowProgress<ProviderSession>, ProviderError> {
        let url = format!("{}/self-service/login", ep.public_url);
        let (body, with_code) = match method {
            LoginMethod::Code { identifier, code } => {
                let mut body = json!({ "method": "code", "identifier": identifier });
                if let Some(code) = code {
                    body["code"] = json!(code);
                }
                (body, code.is_some())
            }
            LoginMethod::Password {
                identifier,
                password,
            } => (
                json!({
                    "method": "password",
                    "identifier": identifier,
                    "password": password.expose_secret(),
                }),
                true,
            ),
        };

        let request = self.client.post(url).query(&[("flow", flow_id)]).json(&body);
        self.submit_code_step(request, with_code).await
    }

    async fn verification_initialize(&self, ep: &ProviderEndpoints) -> Result<Flow, ProviderError> {
        let url = format!("{}/self-service/verification/api", ep.public_url);
        self.json(self.client.get(url)).await
    }

    async fn verification_get(
        &self,
        ep: &ProviderEndpoints,
        flow_id: &str,
    ) -> Result<Flow, ProviderError> {
        let url = format!("{}/self-service/verification/flows", ep.public_url);
        self.json(self.client.get(url).query(&[("id", flow_id)]))
            .await
    }

    async fn verification_submit(
        &self,
        ep: &ProviderEndpoints,
        flow_id: &str,
        identifier: &Identifier,
        code: Option<&str>,
    ) -> Result<FlowProgress<()>, ProviderError> {
        let url = format!("{}/self-service/verification", ep.public_url);
        let mut body = json!({ "method": "code" });
        body[identifier.kind().as_str()] = json!(identifier.value());
        if let Some(code) = code {
            body["code"] = json!(code);
        }

        let (status, text) = self
            .execute(self.client.post(url).query(&[("flow", flow_id)]).json(&body))
            .await?;

        if status.is_success() || (is_validation_status(status) && code.is_none()) {
            let flow: FlowBody = parse(&text).unwrap_or_default();
            let errors = flow.errors();
            if !errors.is_empty() {
                return Err(ProviderError::ValidationRejected(errors));
            }
            return match flow.state.as_deref() {
                Some(PASSED_CHALLENGE) => Ok(FlowProgress::Completed(())),
                _ if code.is_none() => Ok(FlowProgress::CodeSent),
                _ => Err(ProviderError::rejected(
                    Some("code"),
                    "The verification code is invalid or has already been used",
                )),
            };
        }

        Err(error_for(status, &text))
    }

    async fn whoami(
        &self,
        ep: &ProviderEndpoints,
        session_token: &str,
    ) -> Result<ProviderSession, ProviderError> {
        let url = format!("{}/sessions/whoami", ep.public_url);
        let body: SessionBody = self
            .json(self.client.get(url).header(SESSION_TOKEN_HEADER, session_token))
            .await?;
        Ok(body.into())
    }

    async fn get_session(
        &self,
        ep: &ProviderEndpoints,
        session_id: &str,
    ) -> Result<ProviderSession, ProviderError> {
        let url = format!("{}/admin/sessions/{}", ep.admin_url, session_id);
        let request = self.admin(self.client.get(url)).query(&[("expand", "identity")]);
        let body: SessionBody = self.json(request).await?;
        Ok(body.into())
    }

    async fn revoke_session(
        &self,
        ep: &ProviderEndpoints,
        session_id: &str,
    ) -> Result<(), ProviderError> {
        let url = format!("{}/admin/sessions/{}", ep.admin_url, session_id);
        self.empty(self.admin(self.client.delete(url))).await
    }

    async fn extend_session(
        &self,
        ep: &ProviderEndpoints,
        session_id: &str,
    ) -> Result<ProviderSession, ProviderError> {
        let url = format!("{}/admin/sessions/{}/extend", ep.admin_url, session_id);
        let (status, body) = self.execute(self.admin(self.client.patch(url))).await?;

        match status {
            // Newer releases answer 204 and expect a fresh read.
            StatusCode::NO_CONTENT => self.get_session(ep, session_id).await,
            s if s.is_success() => parse::<SessionBody>(&body).map(Into::into),
            s => Err(error_for(s, &body)),
        }
    }

    async fn logout(
        &self,
        ep: &ProviderEndpoints,
        session_token: &str,
    ) -> Result<(), ProviderError> {
        let url = format!("{}/self-service/logout/api", ep.public_url);
        self.empty(
            self.client
                .delete(url)
                .json(&json!({ "session_token": session_token })),
        )
        .await
    }

    async fn get_identity(
        &self,
        ep: &ProviderEndpoints,
        identity_id: &str,
    ) -> Result<ProviderIdentity, ProviderError> {
        let url = format!("{}/admin/identities/{}", ep.admin_url, identity_id);
        self.json(self.admin(self.client.get(url))).await
    }

    async fn find_identity_by_identifier(
        &self,
        ep: &ProviderEndpoints,
        identifier: &Identifier,
    ) -> Result<Option<ProviderIdentity>, ProviderError> {
        let url = format!("{}/admin/identities", ep.admin_url);
        let request = self
            .admin(self.client.get(url))
            .query(&[("credentials_identifier", identifier.value())]);
        let identities: Vec<ProviderIdentity> = self.json(request).await?;
        Ok(identities.into_iter().next())
    }

    async fn delete_identity(
        &self,
        ep: &ProviderEndpoints,
        identity_id: &str,
    ) -> Result<(), ProviderError> {
        let url = format!("{}/admin/identities/{}", ep.admin_url, identity_id);
        self.empty(self.admin(self.client.delete(url))).await
    }

    async fn update_identifier_trait(
        &self,
        ep: &ProviderEndpoints,
        identity_id: &str,
        identifier: &Identifier,
    ) -> Result<ProviderIdentity, ProviderError> {
        let patch = json!([{
            "op": "add",
            "path": trait_path(identifier.kind()),
            "value": identifier.value(),
        }]);
        self.patch_traits(ep, identity_id, patch).await
    }

    async fn delete_identifier(
        &self,
        ep: &ProviderEndpoints,
        identity_id: &str,
        kind: IdentifierType,
    ) -> Result<ProviderIdentity, ProviderError> {
        let patch = json!([{ "op": "remove", "path": trait_path(kind) }]);
        self.patch_traits(ep, identity_id, patch).await
    }

    async fn update_lang_trait(
        &self,
        ep: &ProviderEndpoints,
        identity_id: &str,
        lang: &str,
    ) -> Result<ProviderIdentity, ProviderError> {
        let patch = json!([{ "op": "add", "path": "/traits/lang", "value": lang }]);
        self.patch_traits(ep, identity_id, patch).await
    }
}
