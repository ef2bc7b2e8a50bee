//! Global user model - one person across tenants.

use chrono::{DateTime, Utc};
use serde::Serialize;
use sqlx::FromRow;
use uuid::Uuid;

/// Global user entity. Owns zero or more `UserIdentity` rows, in any tenant.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, FromRow)]
pub struct GlobalUser {
    pub global_user_id: Uuid,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl GlobalUser {
    pub fn new() -> Self {
        let now = Utc::now();
        Self {
            global_user_id: Uuid::new_v4(),
            created_at: now,
            updated_at: now,
        }
    }
}

impl Default for GlobalUser {
    fn default() -> Self {
        Self::new()
    }
}
