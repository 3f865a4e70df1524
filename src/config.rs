//! Service configuration.
//!
//! Environment-first: every knob has a code default and can be overridden via
//! env vars (`.env` is loaded by the binaries). An optional TOML file pointed
//! at by `PORTERHUB_CONFIG_PATH` is applied before the environment, so env
//! vars always win.

use serde::{Deserialize, Serialize};
use std::env;
use std::path::Path;
use std::time::Duration;

fn env_string(key: &str, default: &str) -> String {
    env::var(key).unwrap_or_else(|_| default.to_string())
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    env::var(key)
        .ok()
        .and_then(|v| v.parse::<T>().ok())
        .unwrap_or(default)
}

/// Event log (Kafka) connection settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventLogConfig {
    /// Broker list, comma separated in `EVENT_LOG_BROKERS`.
    #[serde(default = "default_brokers")]
    pub brokers: Vec<String>,
    #[serde(default = "default_client_id")]
    pub client_id: String,
    #[serde(default = "default_consumer_group")]
    pub consumer_group: String,
}

fn default_brokers() -> Vec<String> {
    vec!["localhost:9092".to_string()]
}
fn default_client_id() -> String {
    "porterhub".to_string()
}
fn default_consumer_group() -> String {
    "porterhub-backend".to_string()
}

impl Default for EventLogConfig {
    fn default() -> Self {
        Self {
            brokers: default_brokers(),
            client_id: default_client_id(),
            consumer_group: default_consumer_group(),
        }
    }
}

/// Ephemeral store (Redis) settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    #[serde(default = "default_store_url")]
    pub url: String,
    /// Prefix applied to every key so multiple deployments can share a store.
    #[serde(default = "default_key_prefix")]
    pub key_prefix: String,
}

fn default_store_url() -> String {
    "redis://127.0.0.1:6379".to_string()
}
fn default_key_prefix() -> String {
    "porterhub".to_string()
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            url: default_store_url(),
            key_prefix: default_key_prefix(),
        }
    }
}

/// Signing keys for connection tokens. The access key signs short-lived API
/// tokens, the socket key signs long-lived socket tokens; the gateway accepts
/// either on handshake.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenVerifierConfig {
    #[serde(default = "default_access_key")]
    pub access_key: String,
    #[serde(default = "default_socket_key")]
    pub socket_key: String,
}

fn default_access_key() -> String {
    "dev-access-key-change-in-production-minimum-32-chars".to_string()
}
fn default_socket_key() -> String {
    "dev-socket-key-change-in-production-minimum-32-chars".to_string()
}

impl Default for TokenVerifierConfig {
    fn default() -> Self {
        Self {
            access_key: default_access_key(),
            socket_key: default_socket_key(),
        }
    }
}

/// Bidding engine settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BiddingConfig {
    #[serde(default = "default_window_duration")]
    pub default_window_duration_sec: u64,
    #[serde(default = "default_strategy_id")]
    pub default_strategy_id: String,
    #[serde(default = "default_min_bid")]
    pub default_min_bid_cents: i64,
    #[serde(default = "default_max_bids")]
    pub max_bids_per_porter: u32,
    /// Safety-net TTL for the accept lock. Must exceed the accept transaction
    /// upper bound.
    #[serde(default = "default_lock_ttl")]
    pub lock_ttl_sec: u64,
    /// Reaper tick interval, capped at 10s.
    #[serde(default = "default_reaper_tick")]
    pub reaper_tick_sec: u64,
    #[serde(default = "default_db_path")]
    pub database_path: String,
    /// Base URL of the porter profile service used for eligibility checks.
    #[serde(default)]
    pub eligibility_url: Option<String>,
}

fn default_window_duration() -> u64 {
    300
}
fn default_strategy_id() -> String {
    "balanced-v1".to_string()
}
fn default_min_bid() -> i64 {
    0
}
fn default_max_bids() -> u32 {
    3
}
fn default_lock_ttl() -> u64 {
    5
}
fn default_reaper_tick() -> u64 {
    5
}
fn default_db_path() -> String {
    "./porterhub_bidding.db".to_string()
}

impl Default for BiddingConfig {
    fn default() -> Self {
        Self {
            default_window_duration_sec: default_window_duration(),
            default_strategy_id: default_strategy_id(),
            default_min_bid_cents: default_min_bid(),
            max_bids_per_porter: default_max_bids(),
            lock_ttl_sec: default_lock_ttl(),
            reaper_tick_sec: default_reaper_tick(),
            database_path: default_db_path(),
            eligibility_url: None,
        }
    }
}

/// One rate-limit rule: `points` actions per `window`.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct RateLimitRule {
    pub points: u32,
    pub window_secs: u64,
}

impl RateLimitRule {
    pub fn window(&self) -> Duration {
        Duration::from_secs(self.window_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayRateLimits {
    #[serde(default = "default_location_rule")]
    pub location: RateLimitRule,
    #[serde(default = "default_chat_rule")]
    pub chat: RateLimitRule,
    #[serde(default = "default_global_rule")]
    pub global: RateLimitRule,
}

fn default_location_rule() -> RateLimitRule {
    RateLimitRule {
        points: 1000,
        window_secs: 60,
    }
}
fn default_chat_rule() -> RateLimitRule {
    RateLimitRule {
        points: 50,
        window_secs: 60,
    }
}
fn default_global_rule() -> RateLimitRule {
    RateLimitRule {
        points: 2000,
        window_secs: 60,
    }
}

impl Default for GatewayRateLimits {
    fn default() -> Self {
        Self {
            location: default_location_rule(),
            chat: default_chat_rule(),
            global: default_global_rule(),
        }
    }
}

/// Realtime gateway settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,
    #[serde(default = "default_ping_interval")]
    pub ping_interval_sec: u64,
    #[serde(default)]
    pub rate_limit: GatewayRateLimits,
    /// Every Nth location update is also published to the event log.
    #[serde(default = "default_sample_rate")]
    pub location_sample_rate: u32,
    #[serde(default = "default_location_ttl")]
    pub location_ttl_sec: u64,
    #[serde(default = "default_session_ttl")]
    pub session_ttl_sec: u64,
    #[serde(default = "default_reconnect_ttl")]
    pub reconnect_token_ttl_sec: u64,
    /// Grace added to a job offer's TTL past its expiry.
    #[serde(default = "default_offer_grace")]
    pub offer_grace_sec: u64,
}

fn default_max_connections() -> usize {
    10_000
}
fn default_ping_interval() -> u64 {
    25
}
fn default_sample_rate() -> u32 {
    10
}
fn default_location_ttl() -> u64 {
    3600
}
fn default_session_ttl() -> u64 {
    86_400
}
fn default_reconnect_ttl() -> u64 {
    3600
}
fn default_offer_grace() -> u64 {
    30
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            max_connections: default_max_connections(),
            ping_interval_sec: default_ping_interval(),
            rate_limit: GatewayRateLimits::default(),
            location_sample_rate: default_sample_rate(),
            location_ttl_sec: default_location_ttl(),
            session_ttl_sec: default_session_ttl(),
            reconnect_token_ttl_sec: default_reconnect_ttl(),
            offer_grace_sec: default_offer_grace(),
        }
    }
}

/// Full application configuration shared by both services.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub event_log: EventLogConfig,
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub token_verifier: TokenVerifierConfig,
    #[serde(default)]
    pub bidding: BiddingConfig,
    #[serde(default)]
    pub gateway: GatewayConfig,
    #[serde(default = "default_bind")]
    pub bind_addr: String,
}

fn default_bind() -> String {
    "0.0.0.0:8080".to_string()
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            event_log: EventLogConfig::default(),
            store: StoreConfig::default(),
            token_verifier: TokenVerifierConfig::default(),
            bidding: BiddingConfig::default(),
            gateway: GatewayConfig::default(),
            bind_addr: default_bind(),
        }
    }
}

impl AppConfig {
    /// Load from a TOML file.
    pub fn load(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let config: Self = toml::from_str(&contents)?;
        Ok(config)
    }

    /// Build configuration: TOML file (if any) as the base, environment
    /// variables layered on top.
    pub fn from_env() -> Self {
        let mut config = match env::var("PORTERHUB_CONFIG_PATH") {
            Ok(path) => Self::load(&path).unwrap_or_else(|e| {
                tracing::debug!("Using default config ({}): {}", path, e);
                Self::default()
            }),
            Err(_) => Self::default(),
        };

        if let Ok(brokers) = env::var("EVENT_LOG_BROKERS") {
            config.event_log.brokers = brokers
                .split(',')
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect();
        }
        config.event_log.client_id =
            env_string("EVENT_LOG_CLIENT_ID", &config.event_log.client_id);
        config.event_log.consumer_group =
            env_string("EVENT_LOG_CONSUMER_GROUP", &config.event_log.consumer_group);

        config.store.url = env_string("STORE_URL", &config.store.url);
        config.store.key_prefix = env_string("STORE_KEY_PREFIX", &config.store.key_prefix);

        config.token_verifier.access_key =
            env_string("AUTH_ACCESS_KEY", &config.token_verifier.access_key);
        config.token_verifier.socket_key =
            env_string("AUTH_SOCKET_KEY", &config.token_verifier.socket_key);

        config.bidding.default_window_duration_sec = env_parse(
            "BIDDING_DEFAULT_WINDOW_DURATION_SEC",
            config.bidding.default_window_duration_sec,
        );
        config.bidding.default_strategy_id = env_string(
            "BIDDING_DEFAULT_STRATEGY_ID",
            &config.bidding.default_strategy_id,
        );
        config.bidding.default_min_bid_cents = env_parse(
            "BIDDING_DEFAULT_MIN_BID_CENTS",
            config.bidding.default_min_bid_cents,
        );
        config.bidding.max_bids_per_porter = env_parse(
            "BIDDING_MAX_BIDS_PER_PORTER",
            config.bidding.max_bids_per_porter,
        );
        config.bidding.lock_ttl_sec = env_parse("BIDDING_LOCK_TTL_SEC", config.bidding.lock_ttl_sec);
        config.bidding.reaper_tick_sec = env_parse(
            "BIDDING_REAPER_TICK_SEC",
            config.bidding.reaper_tick_sec,
        )
        .min(10);
        config.bidding.database_path =
            env_string("BIDDING_DATABASE_PATH", &config.bidding.database_path);
        if let Ok(url) = env::var("BIDDING_ELIGIBILITY_URL") {
            config.bidding.eligibility_url = Some(url);
        }

        config.gateway.max_connections =
            env_parse("GATEWAY_MAX_CONNECTIONS", config.gateway.max_connections);
        config.gateway.ping_interval_sec =
            env_parse("GATEWAY_PING_INTERVAL_SEC", config.gateway.ping_interval_sec);
        config.gateway.location_sample_rate = env_parse(
            "GATEWAY_LOCATION_SAMPLE_RATE",
            config.gateway.location_sample_rate,
        )
        .max(1);
        config.gateway.location_ttl_sec =
            env_parse("GATEWAY_LOCATION_TTL_SEC", config.gateway.location_ttl_sec);
        config.gateway.session_ttl_sec =
            env_parse("GATEWAY_SESSION_TTL_SEC", config.gateway.session_ttl_sec);
        config.gateway.reconnect_token_ttl_sec = env_parse(
            "GATEWAY_RECONNECT_TOKEN_TTL_SEC",
            config.gateway.reconnect_token_ttl_sec,
        );
        config.gateway.offer_grace_sec =
            env_parse("GATEWAY_OFFER_GRACE_SEC", config.gateway.offer_grace_sec);

        config.gateway.rate_limit.location.points = env_parse(
            "GATEWAY_RATE_LIMIT_LOCATION_POINTS",
            config.gateway.rate_limit.location.points,
        );
        config.gateway.rate_limit.location.window_secs = env_parse(
            "GATEWAY_RATE_LIMIT_LOCATION_WINDOW_SEC",
            config.gateway.rate_limit.location.window_secs,
        );
        config.gateway.rate_limit.chat.points = env_parse(
            "GATEWAY_RATE_LIMIT_CHAT_POINTS",
            config.gateway.rate_limit.chat.points,
        );
        config.gateway.rate_limit.chat.window_secs = env_parse(
            "GATEWAY_RATE_LIMIT_CHAT_WINDOW_SEC",
            config.gateway.rate_limit.chat.window_secs,
        );
        config.gateway.rate_limit.global.points = env_parse(
            "GATEWAY_RATE_LIMIT_GLOBAL_POINTS",
            config.gateway.rate_limit.global.points,
        );
        config.gateway.rate_limit.global.window_secs = env_parse(
            "GATEWAY_RATE_LIMIT_GLOBAL_WINDOW_SEC",
            config.gateway.rate_limit.global.window_secs,
        );

        config.bind_addr = env_string("BIND_ADDR", &config.bind_addr);

        config
    }
}
