//! Services layer for identity-service.
//!
//! The identity orchestrator and the adapters it drives: the identity
//! provider, the relational store, the challenge cache and the attempt limiter.

pub mod challenge;
pub mod error;
pub mod identity;
pub mod provider;
pub mod rate_limit;
pub mod redis;
pub mod store;

pub use challenge::{ChallengeStore, MemoryChallengeStore};
pub use error::{ErrorKind, ServiceError};
pub use identity::{IdentityService, IdentitySettings};
pub use provider::{IdentityProvider, KratosClient, MockIdentityProvider, MOCK_VALID_CODE};
pub use rate_limit::{MemoryRateLimiter, RateLimitAction, RateLimiter};
pub use redis::RedisService;
pub use store::{Database, IdentityStore, MemoryStore, StoreError};
