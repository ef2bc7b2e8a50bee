//! Data model for identity reconciliation.

pub mod challenge_session;
pub mod global_user;
pub mod tenant;
pub mod user;
pub mod user_identifier_mapping;
pub mod user_identity;

pub use challenge_session::{ChallengeSession, ChallengeType};
pub use global_user::GlobalUser;
pub use tenant::{CreateTenantRequest, Tenant, UpdateTenantRequest};
pub use user::{AuthResult, ChallengeStarted, LoginOutcome, Principal, User, VerificationOutcome};
pub use user_identifier_mapping::{normalize_lang, UserIdentifierMapping};
pub use user_identity::{Identifier, IdentifierError, IdentifierType, UserIdentity};
