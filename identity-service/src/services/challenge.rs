//! Challenge session store: short-TTL key/value cache for pending one-time-code flows.

use std::time::{Duration, Instant};

use async_trait::async_trait;
use dashmap::DashMap;

use crate::models::ChallengeSession;

#[async_trait]
pub trait ChallengeStore: Send + Sync {
    async fn save(
        &self,
        session: &ChallengeSession,
        ttl_seconds: u64,
    ) -> Result<(), anyhow::Error>;

    async fn get(&self, flow_id: &str) -> Result<Option<ChallengeSession>, anyhow::Error>;

    async fn delete(&self, flow_id: &str) -> Result<(), anyhow::Error>;

    async fn health_check(&self) -> Result<(), anyhow::Error>;

    /// Read once, then delete.
    async fn consume(&self, flow_id: &str) -> Result<Option<ChallengeSession>, anyhow::Error> {
        let session = self.get(flow_id).await?;
        if session.is_some() {
            self.delete(flow_id).await?;
        }
        Ok(session)
    }
}

/// In-process challenge store; expired entries are swept on every save.
#[derive(Default)]
pub struct MemoryChallengeStore {
    entries: DashMap<String, (String, Instant)>,
}

impl MemoryChallengeStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[async_trait]
impl ChallengeStore for MemoryChallengeStore {
    async fn save(
        &self,
        session: &ChallengeSession,
        ttl_seconds: u64,
    ) -> Result<(), anyhow::Error> {
        let value = serde_json::to_string(session)?;
        let now = Instant::now();
        self.entries.retain(|_, (_, expires_at)| *expires_at > now);
        let expires_at = now + Duration::from_secs(ttl_seconds);
        self.entries
            .insert(ChallengeSession::key(&session.flow_id), (value, expires_at));
        Ok(())
    }

    async fn get(&self, flow_id: &str) -> Result<Option<ChallengeSession>, anyhow::Error> {
        let key = ChallengeSession::key(flow_id);
        let entry = self.entries.get(&key).map(|e| e.value().clone());
        let Some((value, expires_at)) = entry else {
            return Ok(None);
        };
        if expires_at <= Instant::now() {
            self.entries.remove(&key);
            return Ok(None);
        }
        Ok(Some(serde_json::from_str(&value)?))
    }

    async fn delete(&self, flow_id: &str) -> Result<(), anyhow::Error> {
        self.entries.remove(&ChallengeSession::key(flow_id));
        Ok(())
    }

    async fn health_check(&self) -> Result<(), anyhow::Error> {
        Ok(())
    }

    /// Removal is the read, so two concurrent consumers never both get the session.
    async fn consume(&self, flow_id: &str) -> Result<Option<ChallengeSession>, anyhow::Error> {
        let Some((_, (value, expires_at))) = self.entries.remove(&ChallengeSession::key(flow_id))
        else {
            return Ok(None);
        };
        if expires_at <= Instant::now() {
            return Ok(None);
        }
        Ok(Some(serde_json::from_str(&value)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Identifier;
    use uuid::Uuid;

    fn session(flow_id: &str) -> ChallengeSession {
        ChallengeSession::register(
            flow_id.to_string(),
            Uuid::new_v4(),
            &Identifier::Email("a@b.com".to_string()),
            Some("en".to_string()),
        )
    }

    #[tokio::test]
    async fn consume_is_single_use() {
        let store = MemoryChallengeStore::new();
        store.save(&session("flow-1"), 300).await.unwrap();

        let first = store.consume("flow-1").await.unwrap();
        assert_eq!(first.map(|s| s.flow_id), Some("flow-1".to_string()));
        assert!(store.consume("flow-1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn expired_entries_are_not_returned() {
        let store = MemoryChallengeStore::new();
        store.save(&session("flow-2"), 0).await.unwrap();

        assert!(store.get("flow-2").await.unwrap().is_none());
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn concurrent_consumers_get_the_session_once() {
        let store = std::sync::Arc::new(MemoryChallengeStore::new());
        store.save(&session("flow-3"), 300).await.unwrap();

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let store = store.clone();
                tokio::spawn(async move { store.consume("flow-3").await.unwrap() })
            })
            .collect();
        let mut winners = 0;
        for handle in handles {
            if handle.await.unwrap().is_some() {
                winners += 1;
            }
        }

        assert_eq!(winners, 1);
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn save_sweeps_expired_entries_that_were_never_read() {
        let store = MemoryChallengeStore::new();
        for i in 0..3 {
            store.save(&session(&format!("stale-{}", i)), 0).await.unwrap();
        }

        store.save(&session("fresh"), 300).await.unwrap();

        assert_eq!(store.len(), 1);
        assert!(store.get("fresh").await.unwrap().is_some());
    }
}
