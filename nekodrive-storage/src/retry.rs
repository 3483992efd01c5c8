//! Retrying shard store wrapper
//!
//! Wraps any [`ShardStore`] with bounded exponential backoff, the attachment
//! ceiling check and a circuit breaker. Only `NekoError::Transient` failures
//! are retried; a server-provided `retry_after` hint takes precedence over
//! the computed delay. Exhausting the attempts surfaces
//! `NekoError::ShardUnavailable`.

use crate::backend::{ShardFuture, ShardStore, ShardStoreStats};
use crate::breaker::CircuitBreaker;
use bytes::Bytes;
use metrics::{counter, histogram};
use nekodrive_core::chunk::ShardLocator;
use nekodrive_core::error::{NekoError, Result};
use rand::Rng;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// Backoff policy for substrate calls
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Total attempts per operation, first try included
    pub max_attempts: u32,
    /// Delay before the first retry
    pub base_delay: Duration,
    /// Upper bound on any single delay
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(8),
        }
    }
}

impl RetryPolicy {
    /// Delay before retry number `retry` (1-based), jittered into [d/2, d]
    pub fn backoff(&self, retry: u32) -> Duration {
        let exp = retry.saturating_sub(1).min(16);
        let full = self
            .base_delay
            .saturating_mul(1u32 << exp)
            .min(self.max_delay);
        let factor: f64 = rand::thread_rng().gen_range(0.5..=1.0);
        full.mul_f64(factor)
    }

    /// Delay to wait after a transient error, honoring the server hint
    fn delay_for(&self, retry: u32, hint: Option<Duration>) -> Duration {
        match hint {
            Some(hint) => hint.min(self.max_delay),
            None => self.backoff(retry),
        }
    }
}

/// Shard store with retries, ceiling enforcement and a circuit breaker
pub struct ResilientShardStore<S> {
    inner: S,
    policy: RetryPolicy,
    breaker: Arc<CircuitBreaker>,
    max_shard_size: usize,
    retries: AtomicU64,
}

impl<S: ShardStore> ResilientShardStore<S> {
    pub fn new(
        inner: S,
        policy: RetryPolicy,
        breaker: Arc<CircuitBreaker>,
        max_shard_size: usize,
    ) -> Self {
        Self {
            inner,
            policy,
            breaker,
            max_shard_size,
            retries: AtomicU64::new(0),
        }
    }

    pub fn inner(&self) -> &S {
        &self.inner
    }

    pub fn breaker(&self) -> &Arc<CircuitBreaker> {
        &self.breaker
    }

    async fn with_retry<'a, T, F>(&'a self, op: &'static str, mut call: F) -> Result<T>
    where
        F: FnMut() -> ShardFuture<'a, T>,
    {
        if !self.breaker.allow_request() {
            counter!("shard_operations_total", "op" => op, "outcome" => "rejected").increment(1);
            return Err(NekoError::ShardUnavailable {
                attempts: 0,
                last_error: "circuit open".to_string(),
            });
        }

        let started = Instant::now();
        let mut last_error = String::new();
        let attempts = self.policy.max_attempts.max(1);

        for attempt in 1..=attempts {
            match call().await {
                Ok(value) => {
                    self.breaker.record_success();
                    counter!("shard_operations_total", "op" => op, "outcome" => "ok").increment(1);
                    histogram!("shard_operation_duration_seconds", "op" => op)
                        .record(started.elapsed().as_secs_f64());
                    return Ok(value);
                }
                Err(NekoError::Transient {
                    message,
                    retry_after,
                }) => {
                    warn!(
                        op = op,
                        backend = self.inner.name(),
                        attempt = attempt,
                        error = %message,
                        "Shard store operation failed"
                    );
                    last_error = message;

                    if attempt < attempts {
                        let delay = self.policy.delay_for(attempt, retry_after);
                        debug!(op = op, delay_ms = delay.as_millis() as u64, "Backing off");
                        self.retries.fetch_add(1, Ordering::Relaxed);
                        counter!("shard_retries_total", "op" => op).increment(1);
                        tokio::time::sleep(delay).await;
                    }
                }
                Err(e) => {
                    // The substrate answered; it is reachable.
                    self.breaker.record_success();
                    counter!("shard_operations_total", "op" => op, "outcome" => e.code()).increment(1);
                    return Err(e);
                }
            }
        }

        self.breaker.record_failure();
        counter!("shard_operations_total", "op" => op, "outcome" => "unavailable").increment(1);
        Err(NekoError::ShardUnavailable {
            attempts,
            last_error,
        })
    }
}

impl<S: ShardStore> ShardStore for ResilientShardStore<S> {
    fn put<'a>(&'a self, data: Bytes) -> ShardFuture<'a, ShardLocator> {
        Box::pin(async move {
            if data.len() > self.max_shard_size {
                return Err(NekoError::ShardTooLarge {
                    size: data.len(),
                    max: self.max_shard_size,
                });
            }
            self.with_retry("put", move || self.inner.put(data.clone()))
                .await
        })
    }

    fn get<'a>(&'a self, locator: &'a ShardLocator) -> ShardFuture<'a, Bytes> {
        Box::pin(self.with_retry("get", move || self.inner.get(locator)))
    }

    fn delete<'a>(&'a self, locator: &'a ShardLocator) -> ShardFuture<'a, ()> {
        Box::pin(self.with_retry("delete", move || self.inner.delete(locator)))
    }

    fn ping<'a>(&'a self) -> ShardFuture<'a, ()> {
        self.inner.ping()
    }

    fn name(&self) -> &'static str {
        self.inner.name()
    }

    fn stats(&self) -> ShardStoreStats {
        ShardStoreStats {
            retries: self.retries.load(Ordering::Relaxed),
            ..self.inner.stats()
        }
    }
}
