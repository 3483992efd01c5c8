//! NekoDrive Shard Store
//!
//! Moves opaque encrypted shards to and from the storage substrate:
//! - `ShardStore` trait for pluggable substrates
//! - `DiscordShardStore` posting shards as webhook attachments
//! - `MemoryShardStore` for testing, with fault injection
//! - `ResilientShardStore` adding retries, backoff and a circuit breaker

pub mod backend;
pub mod breaker;
pub mod discord;
pub mod memory;
pub mod retry;

pub use backend::{ShardFuture, ShardStore, ShardStoreStats};
pub use breaker::{BreakerConfig, CircuitBreaker, CircuitState};
pub use discord::{DiscordSettings, DiscordShardStore};
pub use memory::MemoryShardStore;
pub use retry::{ResilientShardStore, RetryPolicy};

use nekodrive_core::DEFAULT_MAX_SHARD_SIZE;
use std::sync::Arc;

/// Shard store adapter configuration
#[derive(Debug, Clone)]
pub struct ShardStoreConfig {
    /// Attachment ceiling of the substrate
    pub max_shard_size: usize,

    /// Backoff policy for transient failures
    pub retry: RetryPolicy,

    /// Circuit breaker thresholds
    pub breaker: BreakerConfig,
}

impl Default for ShardStoreConfig {
    fn default() -> Self {
        Self {
            max_shard_size: DEFAULT_MAX_SHARD_SIZE,
            retry: RetryPolicy::default(),
            breaker: BreakerConfig::default(),
        }
    }
}

impl ShardStoreConfig {
    /// Set the attachment ceiling
    pub fn with_max_shard_size(mut self, bytes: usize) -> Self {
        self.max_shard_size = bytes;
        self
    }

    /// Set the retry policy
    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Set the breaker thresholds
    pub fn with_breaker(mut self, breaker: BreakerConfig) -> Self {
        self.breaker = breaker;
        self
    }

    /// Wrap a raw substrate adapter with retries and a fresh breaker
    pub fn wrap<S: ShardStore>(&self, inner: S) -> ResilientShardStore<S> {
        ResilientShardStore::new(
            inner,
            self.retry.clone(),
            Arc::new(CircuitBreaker::new(self.breaker.clone())),
            self.max_shard_size,
        )
    }
}
