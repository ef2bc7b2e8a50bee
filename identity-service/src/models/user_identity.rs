//! User identity model - one identifier (email, phone) bound to a global user in a tenant.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;
use validator::ValidateEmail;

/// Identifier type codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IdentifierType {
    Email,
    Phone,
}

impl IdentifierType {
    pub fn as_str(&self) -> &'static str {
        match self {
            IdentifierType::Email => "email",
            IdentifierType::Phone => "phone",
        }
    }
}

impl std::fmt::Display for IdentifierType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for IdentifierType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "email" => Ok(IdentifierType::Email),
            "phone" => Ok(IdentifierType::Phone),
            _ => Err(format!("Invalid identifier type: {}", s)),
        }
    }
}

impl TryFrom<String> for IdentifierType {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

/// Why a raw string could not be classified as an identifier.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum IdentifierError {
    #[error("identifier is empty")]
    Empty,
    #[error("invalid email address")]
    InvalidEmail,
    #[error("invalid phone number, expected E.164 format (+84344381024)")]
    InvalidPhone,
}

/// A classified, normalized identifier value.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "lowercase")]
pub enum Identifier {
    Email(String),
    Phone(String),
}

const PHONE_MIN_DIGITS: usize = 8;
const PHONE_MAX_DIGITS: usize = 15;

impl Identifier {
    /// Classify `raw` by shape: anything containing `@` must be an email,
    /// everything else must be an E.164 phone number.
    ///
    /// Emails are lowercased; phone separators (spaces, dashes, dots,
    /// parentheses) are stripped.
    pub fn parse(raw: &str) -> Result<Self, IdentifierError> {
        let raw = raw.trim();
        if raw.is_empty() {
            return Err(IdentifierError::Empty);
        }

        if raw.contains('@') {
            let email = raw.to_lowercase();
            let dotted_domain = email
                .rsplit_once('@')
                .is_some_and(|(_, domain)| domain.contains('.'));
            if !dotted_domain || !email.validate_email() {
                return Err(IdentifierError::InvalidEmail);
            }
            return Ok(Identifier::Email(email));
        }

        let compact: String = raw
            .chars()
            .filter(|c| !matches!(c, ' ' | '-' | '.' | '(' | ')'))
            .collect();
        let digits = compact
            .strip_prefix('+')
            .ok_or(IdentifierError::InvalidPhone)?;

        let valid = (PHONE_MIN_DIGITS..=PHONE_MAX_DIGITS).contains(&digits.len())
            && digits.chars().all(|c| c.is_ascii_digit())
            && !digits.starts_with('0');
        if !valid {
            return Err(IdentifierError::InvalidPhone);
        }

        Ok(Identifier::Phone(compact))
    }

    /// Rebuild an identifier from stored, already-normalized parts.
    pub fn from_parts(kind: IdentifierType, value: impl Into<String>) -> Self {
        match kind {
            IdentifierType::Email => Identifier::Email(value.into()),
            IdentifierType::Phone => Identifier::Phone(value.into()),
        }
    }

    pub fn kind(&self) -> IdentifierType {
        match self {
            Identifier::Email(_) => IdentifierType::Email,
            Identifier::Phone(_) => IdentifierType::Phone,
        }
    }

    pub fn value(&self) -> &str {
        match self {
            Identifier::Email(v) | Identifier::Phone(v) => v,
        }
    }
}

impl std::fmt::Display for Identifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.value())
    }
}

/// User identity entity.
///
/// Unique per `(tenant_id, identifier_type, identifier_value)` and per
/// `(tenant_id, global_user_id, identifier_type)`. Every row of one global
/// user in one tenant shares the same `provider_user_id`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, FromRow)]
pub struct UserIdentity {
    pub identity_id: Uuid,
    pub global_user_id: Uuid,
    pub tenant_id: Uuid,
    pub provider_user_id: String,
    #[sqlx(try_from = "String")]
    pub identifier_type: IdentifierType,
    pub identifier_value: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl UserIdentity {
    /// Create a new identity row.
    pub fn new(
        global_user_id: Uuid,
        tenant_id: Uuid,
        provider_user_id: String,
        identifier: &Identifier,
    ) -> Self {
        let now = Utc::now();
        Self {
            identity_id: Uuid::new_v4(),
            global_user_id,
            tenant_id,
            provider_user_id,
            identifier_type: identifier.kind(),
            identifier_value: identifier.value().to_string(),
            created_at: now,
            updated_at: now,
        }
    }

    pub fn identifier(&self) -> Identifier {
        Identifier::from_parts(self.identifier_type, self.identifier_value.clone())
    }
}
