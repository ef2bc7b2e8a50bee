//! Per-tenant mapping from the provider's user id to the global user, plus locale.

use chrono::{DateTime, Utc};
use serde::Serialize;
use sqlx::FromRow;
use uuid::Uuid;

/// Unique per `(tenant_id, tenant_user_id)` and per `(tenant_id, global_user_id)`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, FromRow)]
pub struct UserIdentifierMapping {
    pub mapping_id: Uuid,
    pub global_user_id: Uuid,
    pub tenant_id: Uuid,
    pub tenant_user_id: String,
    pub lang: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl UserIdentifierMapping {
    pub fn new(
        global_user_id: Uuid,
        tenant_id: Uuid,
        tenant_user_id: String,
        lang: Option<String>,
    ) -> Self {
        let now = Utc::now();
        Self {
            mapping_id: Uuid::new_v4(),
            global_user_id,
            tenant_id,
            tenant_user_id,
            lang,
            created_at: now,
            updated_at: now,
        }
    }
}

const LANG_MAX_LEN: usize = 16;

/// Normalize a BCP 47-ish language tag (`en`, `vi`, `pt-BR`).
pub fn normalize_lang(raw: &str) -> Option<String> {
    let lang = raw.trim();
    let valid = !lang.is_empty()
        && lang.len() <= LANG_MAX_LEN
        && lang.chars().all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
        && lang.chars().next().is_some_and(|c| c.is_ascii_alphabetic());
    valid.then(|| lang.replace('_', "-"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalize_lang_accepts_tags() {
        assert_eq!(normalize_lang(" en "), Some("en".to_string()));
        assert_eq!(normalize_lang("pt_BR"), Some("pt-BR".to_string()));
    }

    #[test]
    fn normalize_lang_rejects_garbage() {
        assert_eq!(normalize_lang(""), None);
        assert_eq!(normalize_lang("1en"), None);
        assert_eq!(normalize_lang("en;drop"), None);
    }
}
