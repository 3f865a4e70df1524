//! In-memory ephemeral store.
//!
//! Backs the test suite and single-node development. Honors the full store
//! contract: TTL expiry (checked lazily on access), atomic
//! compare-and-swap/delete under one mutex, and channel pub/sub fanned out on
//! a process-wide broadcast bus so several "instances" sharing one
//! `MemoryStore` behave like gateway replicas sharing one Redis.

use crate::store::{
    channel_matches, ChannelMessage, ChannelSubscription, EphemeralStore, StoreResult,
};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::time::{Duration, Instant};
use tokio::sync::{broadcast, mpsc};

struct Entry {
    value: String,
    expires_at: Option<Instant>,
}

#[derive(Default)]
struct Inner {
    strings: HashMap<String, Entry>,
    sets: HashMap<String, HashSet<String>>,
    zsets: HashMap<String, HashMap<String, f64>>,
    /// TTLs for set/zset containers (string TTLs live on the entry).
    container_expiry: HashMap<String, Instant>,
}

impl Inner {
    fn purge(&mut self) {
        let now = Instant::now();
        self.strings
            .retain(|_, e| e.expires_at.map_or(true, |at| at > now));
        let expired: Vec<String> = self
            .container_expiry
            .iter()
            .filter(|(_, at)| **at <= now)
            .map(|(k, _)| k.clone())
            .collect();
        for key in expired {
            self.container_expiry.remove(&key);
            self.sets.remove(&key);
            self.zsets.remove(&key);
        }
    }
}

pub struct MemoryStore {
    inner: Mutex<Inner>,
    bus: broadcast::Sender<ChannelMessage>,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        let (bus, _) = broadcast::channel(1024);
        Self {
            inner: Mutex::new(Inner::default()),
            bus,
        }
    }

    /// Number of live string keys; test helper.
    pub fn len(&self) -> usize {
        let mut inner = self.inner.lock();
        inner.purge();
        inner.strings.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl EphemeralStore for MemoryStore {
    async fn get(&self, key: &str) -> StoreResult<Option<String>> {
        let mut inner = self.inner.lock();
        inner.purge();
        Ok(inner.strings.get(key).map(|e| e.value.clone()))
    }

    async fn set(&self, key: &str, value: &str) -> StoreResult<()> {
        let mut inner = self.inner.lock();
        inner.strings.insert(
            key.to_string(),
            Entry {
                value: value.to_string(),
                expires_at: None,
            },
        );
        Ok(())
    }

    async fn set_ex(&self, key: &str, value: &str, ttl: Duration) -> StoreResult<()> {
        let mut inner = self.inner.lock();
        inner.strings.insert(
            key.to_string(),
            Entry {
                value: value.to_string(),
                expires_at: Some(Instant::now() + ttl),
            },
        );
        Ok(())
    }

    async fn set_nx_ex(&self, key: &str, value: &str, ttl: Duration) -> StoreResult<bool> {
        let mut inner = self.inner.lock();
        inner.purge();
        if inner.strings.contains_key(key) {
            return Ok(false);
        }
        inner.strings.insert(
            key.to_string(),
            Entry {
                value: value.to_string(),
                expires_at: Some(Instant::now() + ttl),
            },
        );
        Ok(true)
    }

    async fn del(&self, key: &str) -> StoreResult<bool> {
        let mut inner = self.inner.lock();
        inner.purge();
        let had_string = inner.strings.remove(key).is_some();
        let had_set = inner.sets.remove(key).is_some();
        let had_zset = inner.zsets.remove(key).is_some();
        inner.container_expiry.remove(key);
        Ok(had_string || had_set || had_zset)
    }

    async fn compare_and_delete(&self, key: &str, expected: &str) -> StoreResult<bool> {
        let mut inner = self.inner.lock();
        inner.purge();
        match inner.strings.get(key) {
            Some(entry) if entry.value == expected => {
                inner.strings.remove(key);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn compare_and_swap(&self, key: &str, expected: &str, new: &str) -> StoreResult<bool> {
        let mut inner = self.inner.lock();
        inner.purge();
        match inner.strings.get_mut(key) {
            Some(entry) if entry.value == expected => {
                entry.value = new.to_string();
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn expire(&self, key: &str, ttl: Duration) -> StoreResult<bool> {
        let mut inner = self.inner.lock();
        inner.purge();
        let at = Instant::now() + ttl;
        if let Some(entry) = inner.strings.get_mut(key) {
            entry.expires_at = Some(at);
            return Ok(true);
        }
        if inner.sets.contains_key(key) || inner.zsets.contains_key(key) {
            inner.container_expiry.insert(key.to_string(), at);
            return Ok(true);
        }
        Ok(false)
    }

    async fn sadd(&self, key: &str, member: &str) -> StoreResult<bool> {
        let mut inner = self.inner.lock();
        inner.purge();
        Ok(inner
            .sets
            .entry(key.to_string())
            .or_default()
            .insert(member.to_string()))
    }

    async fn srem(&self, key: &str, member: &str) -> StoreResult<bool> {
        let mut inner = self.inner.lock();
        inner.purge();
        let removed = inner
            .sets
            .get_mut(key)
            .map(|s| s.remove(member))
            .unwrap_or(false);
        if let Some(set) = inner.sets.get(key) {
            if set.is_empty() {
                inner.sets.remove(key);
                inner.container_expiry.remove(key);
            }
        }
        Ok(removed)
    }

    async fn smembers(&self, key: &str) -> StoreResult<Vec<String>> {
        let mut inner = self.inner.lock();
        inner.purge();
        Ok(inner
            .sets
            .get(key)
            .map(|s| s.iter().cloned().collect())
            .unwrap_or_default())
    }

    async fn scard(&self, key: &str) -> StoreResult<u64> {
        let mut inner = self.inner.lock();
        inner.purge();
        Ok(inner.sets.get(key).map(|s| s.len() as u64).unwrap_or(0))
    }

    async fn zadd(&self, key: &str, member: &str, score: f64) -> StoreResult<()> {
        let mut inner = self.inner.lock();
        inner.purge();
        inner
            .zsets
            .entry(key.to_string())
            .or_default()
            .insert(member.to_string(), score);
        Ok(())
    }

    async fn zrangebyscore(&self, key: &str, min: f64, max: f64) -> StoreResult<Vec<String>> {
        let mut inner = self.inner.lock();
        inner.purge();
        let mut members: Vec<(String, f64)> = inner
            .zsets
            .get(key)
            .map(|z| {
                z.iter()
                    .filter(|(_, score)| **score >= min && **score <= max)
                    .map(|(m, s)| (m.clone(), *s))
                    .collect()
            })
            .unwrap_or_default();
        members.sort_by(|a, b| a.1.partial_cmp(&b.1).unwrap_or(std::cmp::Ordering::Equal));
        Ok(members.into_iter().map(|(m, _)| m).collect())
    }

    async fn zrem(&self, key: &str, member: &str) -> StoreResult<bool> {
        let mut inner = self.inner.lock();
        inner.purge();
        Ok(inner
            .zsets
            .get_mut(key)
            .map(|z| z.remove(member).is_some())
            .unwrap_or(false))
    }

    async fn publish(&self, channel: &str, message: &str) -> StoreResult<()> {
        // No subscribers is fine.
        let _ = self.bus.send(ChannelMessage {
            channel: channel.to_string(),
            payload: message.to_string(),
        });
        Ok(())
    }

    async fn subscribe(&self, pattern: &str) -> StoreResult<ChannelSubscription> {
        let mut bus_rx = self.bus.subscribe();
        let (tx, rx) = mpsc::channel(256);
        let pattern = pattern.to_string();
        tokio::spawn(async move {
            loop {
                match bus_rx.recv().await {
                    Ok(msg) => {
                        if channel_matches(&pattern, &msg.channel) && tx.send(msg).await.is_err() {
                            break;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });
        Ok(ChannelSubscription::new(rx))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_setex_expires() {
        let store = MemoryStore::new();
        store
            .set_ex("k", "v", Duration::from_millis(30))
            .await
            .unwrap();
        assert_eq!(store.get("k").await.unwrap().as_deref(), Some("v"));
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(store.get("k").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_set_nx_respects_existing() {
        let store = MemoryStore::new();
        assert!(store
            .set_nx_ex("k", "a", Duration::from_secs(5))
            .await
            .unwrap());
        assert!(!store
            .set_nx_ex("k", "b", Duration::from_secs(5))
            .await
            .unwrap());
        assert_eq!(store.get("k").await.unwrap().as_deref(), Some("a"));
    }

    #[tokio::test]
    async fn test_nx_succeeds_after_ttl() {
        let store = MemoryStore::new();
        assert!(store
            .set_nx_ex("k", "a", Duration::from_millis(20))
            .await
            .unwrap());
        tokio::time::sleep(Duration::from_millis(40)).await;
        assert!(store
            .set_nx_ex("k", "b", Duration::from_secs(5))
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn test_compare_and_swap() {
        let store = MemoryStore::new();
        store.set("offer", "pending").await.unwrap();
        assert!(store
            .compare_and_swap("offer", "pending", "accepted")
            .await
            .unwrap());
        // second transition loses
        assert!(!store
            .compare_and_swap("offer", "pending", "rejected")
            .await
            .unwrap());
        assert_eq!(
            store.get("offer").await.unwrap().as_deref(),
            Some("accepted")
        );
    }

    #[tokio::test]
    async fn test_set_ops() {
        let store = MemoryStore::new();
        assert!(store.sadd("user:u1:sockets", "s1").await.unwrap());
        assert!(store.sadd("user:u1:sockets", "s2").await.unwrap());
        assert!(!store.sadd("user:u1:sockets", "s2").await.unwrap());
        assert_eq!(store.scard("user:u1:sockets").await.unwrap(), 2);

        assert!(store.srem("user:u1:sockets", "s1").await.unwrap());
        let members = store.smembers("user:u1:sockets").await.unwrap();
        assert_eq!(members, vec!["s2".to_string()]);
    }

    #[tokio::test]
    async fn test_zset_deadline_queue() {
        let store = MemoryStore::new();
        store.zadd("deadlines", "w-1", 100.0).await.unwrap();
        store.zadd("deadlines", "w-2", 200.0).await.unwrap();
        store.zadd("deadlines", "w-3", 300.0).await.unwrap();

        let due = store.zrangebyscore("deadlines", 0.0, 250.0).await.unwrap();
        assert_eq!(due, vec!["w-1".to_string(), "w-2".to_string()]);

        assert!(store.zrem("deadlines", "w-1").await.unwrap());
        let due = store.zrangebyscore("deadlines", 0.0, 250.0).await.unwrap();
        assert_eq!(due, vec!["w-2".to_string()]);
    }

    #[tokio::test]
    async fn test_pubsub_pattern_fanout() {
        let store = MemoryStore::new();
        let mut sub = store.subscribe("room:order:*").await.unwrap();
        // give the forwarding task a chance to attach
        tokio::task::yield_now().await;

        store.publish("room:order:o-1", "hello").await.unwrap();
        store.publish("room:admin", "ignored").await.unwrap();
        store.publish("room:order:o-2", "world").await.unwrap();

        let first = sub.recv().await.unwrap();
        assert_eq!(first.channel, "room:order:o-1");
        assert_eq!(first.payload, "hello");
        let second = sub.recv().await.unwrap();
        assert_eq!(second.channel, "room:order:o-2");
    }
}
