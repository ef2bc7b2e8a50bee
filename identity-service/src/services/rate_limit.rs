//! Per-action sliding-window attempt limiter keyed by `tenant:action:identifier`.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use dashmap::DashMap;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RateLimitAction {
    Register,
    VerifyRegister,
    Login,
    VerifyLogin,
    Challenge,
    VerifyChallenge,
    AddIdentifier,
    ChangeIdentifier,
}

impl RateLimitAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            RateLimitAction::Register => "register",
            RateLimitAction::VerifyRegister => "verify_register",
            RateLimitAction::Login => "login",
            RateLimitAction::VerifyLogin => "verify_login",
            RateLimitAction::Challenge => "challenge",
            RateLimitAction::VerifyChallenge => "verify_challenge",
            RateLimitAction::AddIdentifier => "add_identifier",
            RateLimitAction::ChangeIdentifier => "change_identifier",
        }
    }

    pub fn key(&self, tenant_id: Uuid, subject: &str) -> String {
        format!("{}:{}:{}", tenant_id, self.as_str(), subject)
    }
}

#[async_trait]
pub trait RateLimiter: Send + Sync {
    /// True once `limit` attempts were registered within the last `window`.
    async fn is_limited(
        &self,
        key: &str,
        limit: u32,
        window: Duration,
    ) -> Result<bool, anyhow::Error>;

    async fn register_attempt(&self, key: &str, window: Duration) -> Result<(), anyhow::Error>;

    async fn reset_attempts(&self, key: &str) -> Result<(), anyhow::Error>;
}

/// In-process limiter: one timestamp deque per key.
#[derive(Default)]
pub struct MemoryRateLimiter {
    attempts: DashMap<String, VecDeque<Instant>>,
}

impl MemoryRateLimiter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of keys currently holding attempt history.
    pub fn tracked_keys(&self) -> usize {
        self.attempts.len()
    }

    fn prune(attempts: &mut VecDeque<Instant>, window: Duration, now: Instant) {
        while attempts
            .front()
            .is_some_and(|t| now.duration_since(*t) >= window)
        {
            attempts.pop_front();
        }
    }
}

#[async_trait]
impl RateLimiter for MemoryRateLimiter {
    async fn is_limited(
        &self,
        key: &str,
        limit: u32,
        window: Duration,
    ) -> Result<bool, anyhow::Error> {
        let now = Instant::now();
        let Some(mut attempts) = self.attempts.get_mut(key) else {
            return Ok(false);
        };
        Self::prune(&mut attempts, window, now);
        Ok(attempts.len() >= limit as usize)
    }

    async fn register_attempt(&self, key: &str, window: Duration) -> Result<(), anyhow::Error> {
        let now = Instant::now();
        // Keys whose last attempt left the window are never consulted again.
        self.attempts.retain(|_, attempts| {
            attempts
                .back()
                .is_some_and(|t| now.duration_since(*t) < window)
        });
        let mut attempts = self.attempts.entry(key.to_string()).or_default();
        Self::prune(&mut attempts, window, now);
        attempts.push_back(now);
        Ok(())
    }

    async fn reset_attempts(&self, key: &str) -> Result<(), anyhow::Error> {
        self.attempts.remove(key);
        Ok(())
    }
}
