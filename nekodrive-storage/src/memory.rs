//! In-memory shard store
//!
//! Used for testing and development. Not persistent. Supports fault
//! injection so retry, backoff and best-effort purge paths can be exercised
//! without a network.

use crate::backend::{ShardFuture, ShardStore, ShardStoreStats};
use bytes::Bytes;
use nekodrive_core::chunk::ShardLocator;
use nekodrive_core::error::{NekoError, Result};
use nekodrive_core::DEFAULT_MAX_SHARD_SIZE;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};

/// In-memory shard store
pub struct MemoryShardStore {
    /// Shard storage
    shards: RwLock<HashMap<ShardLocator, Bytes>>,

    /// Attachment ceiling, mirroring the real substrate
    max_shard_size: usize,

    /// Locator sequence
    next_id: AtomicU64,

    /// Injected transient failures, consumed one per call
    failing_puts: AtomicU32,
    failing_gets: AtomicU32,
    failing_deletes: AtomicU32,

    /// While set, every call fails transiently
    outage: AtomicBool,

    /// Operation counters
    puts: AtomicU64,
    gets: AtomicU64,
    deletes: AtomicU64,
    bytes_written: AtomicU64,
    bytes_read: AtomicU64,
}

impl MemoryShardStore {
    /// Create a new in-memory store with the default attachment ceiling
    pub fn new() -> Self {
        Self::with_max_shard_size(DEFAULT_MAX_SHARD_SIZE)
    }

    /// Create with a specific attachment ceiling
    pub fn with_max_shard_size(max_shard_size: usize) -> Self {
        Self {
            shards: RwLock::new(HashMap::new()),
            max_shard_size,
            next_id: AtomicU64::new(1),
            failing_puts: AtomicU32::new(0),
            failing_gets: AtomicU32::new(0),
            failing_deletes: AtomicU32::new(0),
            outage: AtomicBool::new(false),
            puts: AtomicU64::new(0),
            gets: AtomicU64::new(0),
            deletes: AtomicU64::new(0),
            bytes_written: AtomicU64::new(0),
            bytes_read: AtomicU64::new(0),
        }
    }

    /// Fail the next `n` uploads with a transient error
    pub fn fail_next_puts(&self, n: u32) {
        self.failing_puts.store(n, Ordering::SeqCst);
    }

    /// Fail the next `n` downloads with a transient error
    pub fn fail_next_gets(&self, n: u32) {
        self.failing_gets.store(n, Ordering::SeqCst);
    }

    /// Fail the next `n` deletions with a transient error
    pub fn fail_next_deletes(&self, n: u32) {
        self.failing_deletes.store(n, Ordering::SeqCst);
    }

    /// Simulate the substrate being unreachable
    pub fn set_outage(&self, down: bool) {
        self.outage.store(down, Ordering::SeqCst);
    }

    /// Overwrite a stored shard in place (corruption testing)
    pub fn tamper(&self, locator: &ShardLocator, f: impl FnOnce(&mut Vec<u8>)) -> bool {
        let mut shards = self.shards.write();
        match shards.get_mut(locator) {
            Some(data) => {
                let mut bytes = data.to_vec();
                f(&mut bytes);
                *data = Bytes::from(bytes);
                true
            }
            None => false,
        }
    }

    /// Whether a shard is currently stored
    pub fn contains(&self, locator: &ShardLocator) -> bool {
        self.shards.read().contains_key(locator)
    }

    /// Number of stored shards
    pub fn len(&self) -> usize {
        self.shards.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// All stored locators
    pub fn locators(&self) -> Vec<ShardLocator> {
        self.shards.read().keys().cloned().collect()
    }

    fn injected(&self, counter: &AtomicU32, op: &str) -> Result<()> {
        if self.outage.load(Ordering::SeqCst) {
            return Err(NekoError::transient(format!("memory store outage during {}", op)));
        }
        let consumed = counter
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if consumed {
            return Err(NekoError::transient(format!("injected {} failure", op)));
        }
        Ok(())
    }

    fn put_sync(&self, data: Bytes) -> Result<ShardLocator> {
        self.injected(&self.failing_puts, "put")?;

        if data.len() > self.max_shard_size {
            return Err(NekoError::ShardTooLarge {
                size: data.len(),
                max: self.max_shard_size,
            });
        }

        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let locator = ShardLocator::new(format!("mem:{}", id));

        self.bytes_written
            .fetch_add(data.len() as u64, Ordering::Relaxed);
        self.shards.write().insert(locator.clone(), data);
        self.puts.fetch_add(1, Ordering::Relaxed);

        Ok(locator)
    }

    fn get_sync(&self, locator: &ShardLocator) -> Result<Bytes> {
        self.injected(&self.failing_gets, "get")?;

        let data = self
            .shards
            .read()
            .get(locator)
            .cloned()
            .ok_or_else(|| NekoError::NotFound(format!("shard {}", locator)))?;

        self.gets.fetch_add(1, Ordering::Relaxed);
        self.bytes_read.fetch_add(data.len() as u64, Ordering::Relaxed);
        Ok(data)
    }

    fn delete_sync(&self, locator: &ShardLocator) -> Result<()> {
        self.injected(&self.failing_deletes, "delete")?;

        match self.shards.write().remove(locator) {
            Some(_) => {
                self.deletes.fetch_add(1, Ordering::Relaxed);
                Ok(())
            }
            None => Err(NekoError::NotFound(format!("shard {}", locator))),
        }
    }
}

impl Default for MemoryShardStore {
    fn default() -> Self {
        Self::new()
    }
}

impl ShardStore for MemoryShardStore {
    fn put<'a>(&'a self, data: Bytes) -> ShardFuture<'a, ShardLocator> {
        Box::pin(async move { self.put_sync(data) })
    }

    fn get<'a>(&'a self, locator: &'a ShardLocator) -> ShardFuture<'a, Bytes> {
        Box::pin(async move { self.get_sync(locator) })
    }

    fn delete<'a>(&'a self, locator: &'a ShardLocator) -> ShardFuture<'a, ()> {
        Box::pin(async move { self.delete_sync(locator) })
    }

    fn ping<'a>(&'a self) -> ShardFuture<'a, ()> {
        Box::pin(async move {
            if self.outage.load(Ordering::SeqCst) {
                return Err(NekoError::transient("memory store outage"));
            }
            Ok(())
        })
    }

    fn name(&self) -> &'static str {
        "memory"
    }

    fn stats(&self) -> ShardStoreStats {
        ShardStoreStats {
            puts: self.puts.load(Ordering::Relaxed),
            gets: self.gets.load(Ordering::Relaxed),
            deletes: self.deletes.load(Ordering::Relaxed),
            bytes_written: self.bytes_written.load(Ordering::Relaxed),
            bytes_read: self.bytes_read.load(Ordering::Relaxed),
            retries: 0,
        }
    }
}
