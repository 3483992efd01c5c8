//! Shard store trait
//!
//! Defines the interface every substrate adapter must follow. A shard store
//! holds no state the manifest does not also know about: it only moves opaque
//! blobs and hands back opaque locators.

use bytes::Bytes;
use futures::future::BoxFuture;
use nekodrive_core::chunk::ShardLocator;
use nekodrive_core::error::Result;
use serde::Serialize;
use std::sync::Arc;

/// Boxed future returned by shard store operations
pub type ShardFuture<'a, T> = BoxFuture<'a, Result<T>>;

/// Shard store statistics
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ShardStoreStats {
    /// Number of successful uploads
    pub puts: u64,

    /// Number of successful downloads
    pub gets: u64,

    /// Number of successful deletions
    pub deletes: u64,

    /// Total bytes uploaded
    pub bytes_written: u64,

    /// Total bytes downloaded
    pub bytes_read: u64,

    /// Attempts that failed and were retried
    pub retries: u64,
}

/// Async shard store
///
/// All implementations must be Send + Sync for use across request handlers.
/// Transient failures are reported as `NekoError::Transient`; a missing shard
/// is `NekoError::NotFound`.
pub trait ShardStore: Send + Sync {
    /// Upload one blob and return its locator
    fn put<'a>(&'a self, data: Bytes) -> ShardFuture<'a, ShardLocator>;

    /// Download the blob behind a locator
    fn get<'a>(&'a self, locator: &'a ShardLocator) -> ShardFuture<'a, Bytes>;

    /// Delete the blob behind a locator
    fn delete<'a>(&'a self, locator: &'a ShardLocator) -> ShardFuture<'a, ()>;

    /// Cheap reachability check against the substrate
    fn ping<'a>(&'a self) -> ShardFuture<'a, ()> {
        Box::pin(async { Ok(()) })
    }

    /// Short name for logs and health output
    fn name(&self) -> &'static str;

    /// Operation counters
    fn stats(&self) -> ShardStoreStats {
        ShardStoreStats::default()
    }
}

impl<S: ShardStore + ?Sized> ShardStore for Arc<S> {
    fn put<'a>(&'a self, data: Bytes) -> ShardFuture<'a, ShardLocator> {
        (**self).put(data)
    }

    fn get<'a>(&'a self, locator: &'a ShardLocator) -> ShardFuture<'a, Bytes> {
        (**self).get(locator)
    }

    fn delete<'a>(&'a self, locator: &'a ShardLocator) -> ShardFuture<'a, ()> {
        (**self).delete(locator)
    }

    fn ping<'a>(&'a self) -> ShardFuture<'a, ()> {
        (**self).ping()
    }

    fn name(&self) -> &'static str {
        (**self).name()
    }

    fn stats(&self) -> ShardStoreStats {
        (**self).stats()
    }
}
