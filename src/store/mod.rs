//! Ephemeral store client.
//!
//! Key/value with TTL, sets, deadline-scored sorted sets, atomic
//! compare-and-swap/delete, and cross-instance pub/sub channels. The
//! production implementation runs on Redis; tests run on the in-memory
//! implementation, which honors the same contracts (including TTL expiry and
//! channel fan-out).

pub mod lock;
pub mod memory;
pub mod redis;

pub use lock::{DistributedLock, LockError, LockGuard};
pub use memory::MemoryStore;
pub use self::redis::RedisStore;

use async_trait::async_trait;
use std::time::Duration;
use tokio::sync::mpsc;

pub type StoreResult<T> = Result<T, StoreError>;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("ephemeral store unavailable after retries: {0}")]
    Unavailable(String),
    #[error("ephemeral store protocol error: {0}")]
    Protocol(String),
}

/// A message delivered on a subscribed channel.
#[derive(Debug, Clone)]
pub struct ChannelMessage {
    pub channel: String,
    pub payload: String,
}

/// A live channel subscription. Dropping it ends delivery.
pub struct ChannelSubscription {
    rx: mpsc::Receiver<ChannelMessage>,
}

impl ChannelSubscription {
    pub fn new(rx: mpsc::Receiver<ChannelMessage>) -> Self {
        Self { rx }
    }

    pub async fn recv(&mut self) -> Option<ChannelMessage> {
        self.rx.recv().await
    }
}

/// The store operations both services depend on.
///
/// All keys are logical; implementations prepend their configured prefix.
#[async_trait]
pub trait EphemeralStore: Send + Sync {
    async fn get(&self, key: &str) -> StoreResult<Option<String>>;
    async fn set(&self, key: &str, value: &str) -> StoreResult<()>;
    async fn set_ex(&self, key: &str, value: &str, ttl: Duration) -> StoreResult<()>;
    /// Write-if-absent with TTL. Returns true iff the key did not exist.
    /// This is the lock acquisition primitive.
    async fn set_nx_ex(&self, key: &str, value: &str, ttl: Duration) -> StoreResult<bool>;
    async fn del(&self, key: &str) -> StoreResult<bool>;
    /// Atomically delete iff the stored value equals `expected` (single
    /// round). This is the safe lock release primitive.
    async fn compare_and_delete(&self, key: &str, expected: &str) -> StoreResult<bool>;
    /// Atomically replace iff the stored value equals `expected`, keeping the
    /// key's TTL. Returns true on swap.
    async fn compare_and_swap(&self, key: &str, expected: &str, new: &str) -> StoreResult<bool>;
    async fn expire(&self, key: &str, ttl: Duration) -> StoreResult<bool>;

    async fn sadd(&self, key: &str, member: &str) -> StoreResult<bool>;
    async fn srem(&self, key: &str, member: &str) -> StoreResult<bool>;
    async fn smembers(&self, key: &str) -> StoreResult<Vec<String>>;
    async fn scard(&self, key: &str) -> StoreResult<u64>;

    async fn zadd(&self, key: &str, member: &str, score: f64) -> StoreResult<()>;
    async fn zrangebyscore(&self, key: &str, min: f64, max: f64) -> StoreResult<Vec<String>>;
    async fn zrem(&self, key: &str, member: &str) -> StoreResult<bool>;

    async fn publish(&self, channel: &str, message: &str) -> StoreResult<()>;
    /// Subscribe to all channels matching `pattern` (`*` glob suffix allowed).
    async fn subscribe(&self, pattern: &str) -> StoreResult<ChannelSubscription>;
}

/// Simple glob used by channel subscriptions: exact match, or a `*` suffix
/// matching any tail.
pub(crate) fn channel_matches(pattern: &str, channel: &str) -> bool {
    match pattern.strip_suffix('*') {
        Some(prefix) => channel.starts_with(prefix),
        None => pattern == channel,
    }
}
