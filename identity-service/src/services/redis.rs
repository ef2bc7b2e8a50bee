use std::time::{Duration, SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use redis::{aio::ConnectionManager, Client};
use uuid::Uuid;

use super::challenge::ChallengeStore;
use super::rate_limit::RateLimiter;
use crate::models::ChallengeSession;

const RATE_LIMIT_PREFIX: &str = "ratelimit:";

/// Redis-backed challenge store and rate limiter.
#[derive(Clone)]
pub struct RedisService {
    _client: Client,
    manager: ConnectionManager,
}

impl RedisService {
    pub async fn new(config: &crate::config::RedisConfig) -> Result<Self, anyhow::Error> {
        tracing::info!("Connecting to Redis");
        let client = Client::open(config.url.clone())?;

        // Use ConnectionManager for automatic reconnection
        let manager = client.get_connection_manager().await.map_err(|e| {
            tracing::error!("Failed to get Redis connection manager: {}", e);
            anyhow::anyhow!("Failed to connect to Redis: {}", e)
        })?;

        tracing::info!("Successfully connected to Redis");

        Ok(Self {
            _client: client,
            manager,
        })
    }

    fn rate_key(key: &str) -> String {
        format!("{}{}", RATE_LIMIT_PREFIX, key)
    }
}

fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default()
}

#[async_trait]
impl ChallengeStore for RedisService {
    async fn save(
        &self,
        session: &ChallengeSession,
        ttl_seconds: u64,
    ) -> Result<(), anyhow::Error> {
        let mut conn = self.manager.clone();
        let value = serde_json::to_string(session)?;

        redis::cmd("SET")
            .arg(ChallengeSession::key(&session.flow_id))
            .arg(value)
            .arg("EX")
            .arg(ttl_seconds.max(1))
            .query_async(&mut conn)
            .await
            .map_err(|e| anyhow::anyhow!("Failed to save challenge session: {}", e))
    }

    async fn get(&self, flow_id: &str) -> Result<Option<ChallengeSession>, anyhow::Error> {
        let mut conn = self.manager.clone();
        let value: Option<String> = redis::cmd("GET")
            .arg(ChallengeSession::key(flow_id))
            .query_async(&mut conn)
            .await
            .map_err(|e| anyhow::anyhow!("Failed to read challenge session: {}", e))?;

        value
            .map(|v| serde_json::from_str(&v))
            .transpose()
            .map_err(Into::into)
    }

    async fn delete(&self, flow_id: &str) -> Result<(), anyhow::Error> {
        let mut conn = self.manager.clone();
        redis::cmd("DEL")
            .arg(ChallengeSession::key(flow_id))
            .query_async(&mut conn)
            .await
            .map_err(|e| anyhow::anyhow!("Failed to delete challenge session: {}", e))
    }

    async fn health_check(&self) -> Result<(), anyhow::Error> {
        let mut conn = self.manager.clone();
        redis::cmd("PING")
            .query_async(&mut conn)
            .await
            .map_err(|e| anyhow::anyhow!("Redis health check failed: {}", e))
    }

    /// `GETDEL` so two concurrent confirmations cannot both read the session.
    async fn consume(&self, flow_id: &str) -> Result<Option<ChallengeSession>, anyhow::Error> {
        let mut conn = self.manager.clone();
        let value: Option<String> = redis::cmd("GETDEL")
            .arg(ChallengeSession::key(flow_id))
            .query_async(&mut conn)
            .await
            .map_err(|e| anyhow::anyhow!("Failed to consume challenge session: {}", e))?;

        value
            .map(|v| serde_json::from_str(&v))
            .transpose()
            .map_err(Into::into)
    }
}

#[async_trait]
impl RateLimiter for RedisService {
    async fn is_limited(
        &self,
        key: &str,
        limit: u32,
        window: Duration,
    ) -> Result<bool, anyhow::Error> {
        let mut conn = self.manager.clone();
        let key = Self::rate_key(key);
        let cutoff = now_millis().saturating_sub(window.as_millis() as u64);

        let (count,): (u64,) = redis::pipe()
            .atomic()
            .cmd("ZREMRANGEBYSCORE")
            .arg(&key)
            .arg(0)
            .arg(cutoff)
            .ignore()
            .cmd("ZCARD")
            .arg(&key)
            .query_async(&mut conn)
            .await
            .map_err(|e| anyhow::anyhow!("Failed to check rate limit: {}", e))?;

        Ok(count >= u64::from(limit))
    }

    async fn register_attempt(&self, key: &str, window: Duration) -> Result<(), anyhow::Error> {
        let mut conn = self.manager.clone();
        let key = Self::rate_key(key);
        let now = now_millis();
        let window_ms = window.as_millis() as u64;

        redis::pipe()
            .atomic()
            .cmd("ZREMRANGEBYSCORE")
            .arg(&key)
            .arg(0)
            .arg(now.saturating_sub(window_ms))
            .ignore()
            .cmd("ZADD")
            .arg(&key)
            .arg(now)
            .arg(format!("{}-{}", now, Uuid::new_v4().simple()))
            .ignore()
            .cmd("PEXPIRE")
            .arg(&key)
            .arg(window_ms.max(1))
            .ignore()
            .query_async::<_, ()>(&mut conn)
            .await
            .map_err(|e| anyhow::anyhow!("Failed to register attempt: {}", e))
    }

    async fn reset_attempts(&self, key: &str) -> Result<(), anyhow::Error> {
        let mut conn = self.manager.clone();
        redis::cmd("DEL")
            .arg(Self::rate_key(key))
            .query_async(&mut conn)
            .await
            .map_err(|e| anyhow::anyhow!("Failed to reset attempts: {}", e))
    }
}
