//! Shared key-value store abstraction.
//!
//! The quota counter, offline queue and resume blobs live here so that every
//! gateway process sees the same values. Two backends: Redis for deployments
//! and an in-process map for single-node runs and tests.

pub mod memory;
pub mod redis;

pub use self::memory::MemoryStore;
pub use self::redis::RedisStore;

use std::future::Future;
use std::pin::Pin;
use std::time::Duration;
use switchboard_core::SbResult;

/// Boxed future returned by [`KvStore`] operations.
pub type StoreFuture<'a, T> = Pin<Box<dyn Future<Output = SbResult<T>> + Send + 'a>>;

/// Operations the gateway needs from the shared store.
///
/// Object-safe so the gateway can hold an `Arc<dyn KvStore>` and tests can
/// swap in [`MemoryStore`].
pub trait KvStore: Send + Sync {
    /// Read a string value.
    fn get<'a>(&'a self, key: &'a str) -> StoreFuture<'a, Option<String>>;

    /// Write a string value with a TTL, replacing any previous value.
    fn set_ex<'a>(&'a self, key: &'a str, value: String, ttl: Duration) -> StoreFuture<'a, ()>;

    /// Increment an integer counter. The first increment (result == 1) arms
    /// `ttl`; later increments leave the remaining TTL untouched.
    fn incr_with_expiry<'a>(&'a self, key: &'a str, ttl: Duration) -> StoreFuture<'a, i64>;

    /// Decrement an integer counter. A counter that reaches zero is deleted.
    fn decr<'a>(&'a self, key: &'a str) -> StoreFuture<'a, i64>;

    /// Remaining TTL of a key, `None` if absent or without expiry.
    fn ttl<'a>(&'a self, key: &'a str) -> StoreFuture<'a, Option<Duration>>;

    /// Append to a list and set its TTL in one atomic step, returning the
    /// new length.
    fn list_push_with_expiry<'a>(
        &'a self,
        key: &'a str,
        value: String,
        ttl: Duration,
    ) -> StoreFuture<'a, u64>;

    /// Read `start..=stop` of a list (negative indices count from the end).
    fn list_range<'a>(&'a self, key: &'a str, start: isize, stop: isize)
        -> StoreFuture<'a, Vec<String>>;

    /// Atomically read a whole list and delete it.
    fn list_take<'a>(&'a self, key: &'a str) -> StoreFuture<'a, Vec<String>>;

    /// Delete a key. Returns `true` if it existed.
    fn delete<'a>(&'a self, key: &'a str) -> StoreFuture<'a, bool>;
}

/// Key of the per-identity connection counter.
pub fn quota_key(identity: &str) -> String {
    format!("switchboard:quota:{identity}")
}

/// Key of the per-recipient offline queue.
pub fn offline_key(recipient: &str) -> String {
    format!("switchboard:offline:{recipient}")
}

/// Key of the per-identity resume blob.
pub fn reconnect_key(identity: &str) -> String {
    format!("switchboard:reconnect:{identity}")
}
