//! Redis-backed ephemeral store.
//!
//! Runs on a multiplexed [`ConnectionManager`]; transient failures are
//! retried with bounded exponential backoff before surfacing as
//! [`StoreError::Unavailable`]. Lock release and offer transitions use Lua
//! scripts so the compare happens in a single round on the server.

use crate::store::{ChannelMessage, ChannelSubscription, EphemeralStore, StoreError, StoreResult};
use async_trait::async_trait;
use futures_util::StreamExt;
use rand::Rng;
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Script};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, warn};

const MAX_ATTEMPTS: u32 = 3;
const BASE_BACKOFF_MS: u64 = 50;

/// Atomic delete-if-value-matches (safe lock release).
const COMPARE_AND_DELETE: &str = r#"
if redis.call('get', KEYS[1]) == ARGV[1] then
    return redis.call('del', KEYS[1])
else
    return 0
end
"#;

/// Atomic swap-if-value-matches, preserving the key's TTL.
const COMPARE_AND_SWAP: &str = r#"
if redis.call('get', KEYS[1]) == ARGV[1] then
    redis.call('set', KEYS[1], ARGV[2], 'KEEPTTL')
    return 1
else
    return 0
end
"#;

pub struct RedisStore {
    client: redis::Client,
    manager: ConnectionManager,
    key_prefix: String,
    cad_script: Arc<Script>,
    cas_script: Arc<Script>,
}

impl RedisStore {
    pub async fn connect(url: &str, key_prefix: &str) -> anyhow::Result<Self> {
        let client = redis::Client::open(url)?;
        let manager = ConnectionManager::new(client.clone()).await?;
        Ok(Self {
            client,
            manager,
            key_prefix: key_prefix.to_string(),
            cad_script: Arc::new(Script::new(COMPARE_AND_DELETE)),
            cas_script: Arc::new(Script::new(COMPARE_AND_SWAP)),
        })
    }

    fn prefixed(&self, key: &str) -> String {
        format!("{}:{}", self.key_prefix, key)
    }

    /// Run a store op with bounded retries and jittered backoff.
    async fn with_retries<T, F, Fut>(&self, op: &'static str, mut f: F) -> StoreResult<T>
    where
        F: FnMut(ConnectionManager) -> Fut,
        Fut: Future<Output = redis::RedisResult<T>>,
    {
        let mut last_err = None;
        for attempt in 0..MAX_ATTEMPTS {
            if attempt > 0 {
                let jitter = rand::thread_rng().gen_range(0..25);
                let backoff = BASE_BACKOFF_MS * 2u64.pow(attempt - 1) + jitter;
                tokio::time::sleep(Duration::from_millis(backoff)).await;
            }
            match f(self.manager.clone()).await {
                Ok(value) => return Ok(value),
                Err(e) => {
                    debug!(op, attempt, error = %e, "store operation failed");
                    last_err = Some(e);
                }
            }
        }
        metrics::counter!("store_upstream_failures_total", 1, "op" => op);
        Err(StoreError::Unavailable(format!(
            "{op}: {}",
            last_err.map(|e| e.to_string()).unwrap_or_default()
        )))
    }
}

fn ttl_secs(ttl: Duration) -> u64 {
    ttl.as_secs().max(1)
}

#[async_trait]
impl EphemeralStore for RedisStore {
    async fn get(&self, key: &str) -> StoreResult<Option<String>> {
        let key = self.prefixed(key);
        self.with_retries("get", move |mut conn| {
            let key = key.clone();
            async move { conn.get(&key).await }
        })
        .await
    }

    async fn set(&self, key: &str, value: &str) -> StoreResult<()> {
        let key = self.prefixed(key);
        let value = value.to_string();
        self.with_retries("set", move |mut conn| {
            let (key, value) = (key.clone(), value.clone());
            async move { conn.set(&key, &value).await }
        })
        .await
    }

    async fn set_ex(&self, key: &str, value: &str, ttl: Duration) -> StoreResult<()> {
        let key = self.prefixed(key);
        let value = value.to_string();
        let secs = ttl_secs(ttl);
        self.with_retries("set_ex", move |mut conn| {
            let (key, value) = (key.clone(), value.clone());
            async move { conn.set_ex(&key, &value, secs).await }
        })
        .await
    }

    async fn set_nx_ex(&self, key: &str, value: &str, ttl: Duration) -> StoreResult<bool> {
        let key = self.prefixed(key);
        let value = value.to_string();
        let secs = ttl_secs(ttl);
        let reply: Option<String> = self
            .with_retries("set_nx_ex", move |mut conn| {
                let (key, value) = (key.clone(), value.clone());
                async move {
                    redis::cmd("SET")
                        .arg(&key)
                        .arg(&value)
                        .arg("NX")
                        .arg("EX")
                        .arg(secs)
                        .query_async(&mut conn)
                        .await
                }
            })
            .await?;
        Ok(reply.is_some())
    }

    async fn del(&self, key: &str) -> StoreResult<bool> {
        let key = self.prefixed(key);
        let removed: u64 = self
            .with_retries("del", move |mut conn| {
                let key = key.clone();
                async move { conn.del(&key).await }
            })
            .await?;
        Ok(removed > 0)
    }

    async fn compare_and_delete(&self, key: &str, expected: &str) -> StoreResult<bool> {
        let key = self.prefixed(key);
        let expected = expected.to_string();
        let script = self.cad_script.clone();
        let deleted: i64 = self
            .with_retries("compare_and_delete", move |mut conn| {
                let (key, expected, script) = (key.clone(), expected.clone(), script.clone());
                async move { script.key(&key).arg(&expected).invoke_async(&mut conn).await }
            })
            .await?;
        Ok(deleted > 0)
    }

    async fn compare_and_swap(&self, key: &str, expected: &str, new: &str) -> StoreResult<bool> {
        let key = self.prefixed(key);
        let expected = expected.to_string();
        let new = new.to_string();
        let script = self.cas_script.clone();
        let swapped: i64 = self
            .with_retries("compare_and_swap", move |mut conn| {
                let (key, expected, new, script) = (
                    key.clone(),
                    expected.clone(),
                    new.clone(),
                    script.clone(),
                );
                async move {
                    script
                        .key(&key)
                        .arg(&expected)
                        .arg(&new)
                        .invoke_async(&mut conn)
                        .await
                }
            })
            .await?;
        Ok(swapped > 0)
    }

    async fn expire(&self, key: &str, ttl: Duration) -> StoreResult<bool> {
        let key = self.prefixed(key);
        let secs = ttl_secs(ttl) as i64;
        self.with_retries("expire", move |mut conn| {
            let key = key.clone();
            async move { conn.expire(&key, secs).await }
        })
        .await
    }

    async fn sadd(&self, key: &str, member: &str) -> StoreResult<bool> {
        let key = self.prefixed(key);
        let member = member.to_string();
        let added: u64 = self
            .with_retries("sadd", move |mut conn| {
                let (key, member) = (key.clone(), member.clone());
                async move { conn.sadd(&key, &member).await }
            })
            .await?;
        Ok(added > 0)
    }

    async fn srem(&self, key: &str, member: &str) -> StoreResult<bool> {
        let key = self.prefixed(key);
        let member = member.to_string();
        let removed: u64 = self
            .with_retries("srem", move |mut conn| {
                let (key, member) = (key.clone(), member.clone());
                async move { conn.srem(&key, &member).await }
            })
            .await?;
        Ok(removed > 0)
    }

    async fn smembers(&self, key: &str) -> StoreResult<Vec<String>> {
        let key = self.prefixed(key);
        self.with_retries("smembers", move |mut conn| {
            let key = key.clone();
            async move { conn.smembers(&key).await }
        })
        .await
    }

    async fn scard(&self, key: &str) -> StoreResult<u64> {
        let key = self.prefixed(key);
        self.with_retries("scard", move |mut conn| {
            let key = key.clone();
            async move { conn.scard(&key).await }
        })
        .await
    }

    async fn zadd(&self, key: &str, member: &str, score: f64) -> StoreResult<()> {
        let key = self.prefixed(key);
        let member = member.to_string();
        let _: u64 = self
            .with_retries("zadd", move |mut conn| {
                let (key, member) = (key.clone(), member.clone());
                async move { conn.zadd(&key, &member, score).await }
            })
            .await?;
        Ok(())
    }

    async fn zrangebyscore(&self, key: &str, min: f64, max: f64) -> StoreResult<Vec<String>> {
        let key = self.prefixed(key);
        self.with_retries("zrangebyscore", move |mut conn| {
            let key = key.clone();
            async move { conn.zrangebyscore(&key, min, max).await }
        })
        .await
    }

    async fn zrem(&self, key: &str, member: &str) -> StoreResult<bool> {
        let key = self.prefixed(key);
        let member = member.to_string();
        let removed: u64 = self
            .with_retries("zrem", move |mut conn| {
                let (key, member) = (key.clone(), member.clone());
                async move { conn.zrem(&key, &member).await }
            })
            .await?;
        Ok(removed > 0)
    }

    async fn publish(&self, channel: &str, message: &str) -> StoreResult<()> {
        let channel = self.prefixed(channel);
        let message = message.to_string();
        let _: u64 = self
            .with_retries("publish", move |mut conn| {
                let (channel, message) = (channel.clone(), message.clone());
                async move { conn.publish(&channel, &message).await }
            })
            .await?;
        Ok(())
    }

    async fn subscribe(&self, pattern: &str) -> StoreResult<ChannelSubscription> {
        let client = self.client.clone();
        let prefixed_pattern = self.prefixed(pattern);
        let prefix = format!("{}:", self.key_prefix);
        let (tx, rx) = mpsc::channel(256);

        // Pub/sub needs its own connection; keep it alive (and reconnecting)
        // for as long as the subscription is held.
        tokio::spawn(async move {
            loop {
                let conn = match client.get_async_connection().await {
                    Ok(conn) => conn,
                    Err(e) => {
                        warn!(error = %e, "pubsub connect failed; retrying");
                        tokio::time::sleep(Duration::from_secs(1)).await;
                        continue;
                    }
                };
                let mut pubsub = conn.into_pubsub();
                if let Err(e) = pubsub.psubscribe(&prefixed_pattern).await {
                    warn!(error = %e, pattern = %prefixed_pattern, "psubscribe failed; retrying");
                    tokio::time::sleep(Duration::from_secs(1)).await;
                    continue;
                }

                let mut stream = pubsub.on_message();
                while let Some(msg) = stream.next().await {
                    let channel = msg.get_channel_name().to_string();
                    let payload: String = match msg.get_payload() {
                        Ok(p) => p,
                        Err(_) => continue,
                    };
                    let logical = channel
                        .strip_prefix(&prefix)
                        .unwrap_or(&channel)
                        .to_string();
                    if tx
                        .send(ChannelMessage {
                            channel: logical,
                            payload,
                        })
                        .await
                        .is_err()
                    {
                        // subscriber dropped
                        return;
                    }
                }
                warn!(pattern = %prefixed_pattern, "pubsub stream ended; reconnecting");
            }
        });

        Ok(ChannelSubscription::new(rx))
    }
}
