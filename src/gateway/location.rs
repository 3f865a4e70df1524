//! Porter location hub.
//!
//! Rate-limited ingress for porter positions. The latest position lands in
//! the ephemeral store with a ~1h TTL; every Nth update is also published to
//! the event log so downstream persistence stays bounded; and when the porter
//! has an active order, the position fans out to that order's subscribers.

use crate::auth::Role;
use crate::eventlog::{publish_event, EventLog};
use crate::events::{DomainEvent, EventEnvelope};
use crate::gateway::rate_limit::UserRateLimiter;
use crate::gateway::rooms::SocketHandle;
use crate::gateway::subscriptions::SubscriptionRouter;
use crate::gateway::ws::{LocationPayload, ServerEvent};
use crate::gateway::GatewayError;
use crate::config::GatewayConfig;
use crate::store::EphemeralStore;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// Accepted clock skew on client-supplied timestamps.
fn timestamp_skew() -> chrono::Duration {
    chrono::Duration::minutes(5)
}

fn location_key(porter_id: &str) -> String {
    format!("porter_location:{porter_id}")
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PorterLocation {
    pub lat: f64,
    pub lng: f64,
    pub accuracy: f64,
    pub heading: Option<f64>,
    pub speed: Option<f64>,
    pub timestamp: DateTime<Utc>,
    pub active_order_id: Option<String>,
}

pub struct LocationHub {
    store: Arc<dyn EphemeralStore>,
    log: Arc<dyn EventLog>,
    subscriptions: Arc<SubscriptionRouter>,
    limiter: UserRateLimiter,
    sample_rate: u32,
    location_ttl: Duration,
    /// Per-porter update counter driving the every-Nth log sample.
    counters: Mutex<HashMap<String, u32>>,
}

impl LocationHub {
    pub fn new(
        store: Arc<dyn EphemeralStore>,
        log: Arc<dyn EventLog>,
        subscriptions: Arc<SubscriptionRouter>,
        config: &GatewayConfig,
    ) -> Self {
        Self {
            store,
            log,
            subscriptions,
            limiter: UserRateLimiter::new(config.rate_limit.location),
            sample_rate: config.location_sample_rate.max(1),
            location_ttl: Duration::from_secs(config.location_ttl_sec),
            counters: Mutex::new(HashMap::new()),
        }
    }

    fn validate(payload: &LocationPayload) -> Result<(), GatewayError> {
        if !(-90.0..=90.0).contains(&payload.lat) {
            return Err(GatewayError::Validation("lat out of range".into()));
        }
        if !(-180.0..=180.0).contains(&payload.lng) {
            return Err(GatewayError::Validation("lng out of range".into()));
        }
        if payload.accuracy < 0.0 {
            return Err(GatewayError::Validation("accuracy must be >= 0".into()));
        }
        let skew = payload.timestamp - Utc::now();
        if skew > timestamp_skew() || skew < -timestamp_skew() {
            return Err(GatewayError::Validation(
                "timestamp outside skew tolerance".into(),
            ));
        }
        Ok(())
    }

    pub async fn handle_update(
        &self,
        socket: &SocketHandle,
        payload: LocationPayload,
    ) -> Result<(), GatewayError> {
        if socket.role != Role::Porter {
            return Err(GatewayError::Forbidden);
        }
        let porter_id = socket.user_id.clone();

        if !self.limiter.check(&porter_id) {
            metrics::counter!("gateway_rate_limited_total", 1, "class" => "location");
            return Err(GatewayError::RateLimitExceeded);
        }
        Self::validate(&payload)?;

        // the active order sticks to the stored location when the client
        // stops sending it
        let previous_active = self.latest(&porter_id).await?.and_then(|l| l.active_order_id);
        let location = PorterLocation {
            lat: payload.lat,
            lng: payload.lng,
            accuracy: payload.accuracy,
            heading: payload.heading,
            speed: payload.speed,
            timestamp: payload.timestamp,
            active_order_id: payload.active_order_id.or(previous_active),
        };
        let json = serde_json::to_string(&location)
            .map_err(|e| GatewayError::Upstream(e.to_string()))?;
        self.store
            .set_ex(&location_key(&porter_id), &json, self.location_ttl)
            .await?;

        // every Nth update goes to the log; the rest are realtime-only
        let sampled = {
            let mut counters = self.counters.lock();
            let count = counters.entry(porter_id.clone()).or_insert(0);
            *count += 1;
            *count % self.sample_rate == 0
        };
        if sampled {
            let envelope = EventEnvelope::new(
                DomainEvent::PorterLocationUpdated {
                    porter_id: porter_id.clone(),
                    lat: location.lat,
                    lng: location.lng,
                    timestamp: location.timestamp,
                },
                &porter_id,
            );
            if let Err(e) = publish_event(self.log.as_ref(), &envelope).await {
                warn!(porter = %porter_id, error = %e, "location sample publish failed");
            }
        }

        if let Some(order_id) = &location.active_order_id {
            self.subscriptions
                .broadcast(
                    order_id,
                    ServerEvent::LocationUpdated {
                        porter_id: porter_id.clone(),
                        lat: location.lat,
                        lng: location.lng,
                        heading: location.heading,
                        speed: location.speed,
                        timestamp: location.timestamp,
                    },
                )
                .await;
        } else {
            debug!(porter = %porter_id, "location stored; no active order to fan to");
        }
        Ok(())
    }

    pub async fn latest(&self, porter_id: &str) -> Result<Option<PorterLocation>, GatewayError> {
        let Some(json) = self.store.get(&location_key(porter_id)).await? else {
            return Ok(None);
        };
        Ok(serde_json::from_str(&json).ok())
    }

    /// Periodic limiter cleanup; spawned by the service binary.
    pub fn cleanup(&self) {
        self.limiter.cleanup();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RateLimitRule;
    use crate::eventlog::MemoryEventLog;
    use crate::events::topics;
    use crate::gateway::rooms::RoomBroker;
    use crate::store::MemoryStore;
    use tokio::sync::mpsc::unbounded_channel;

    fn setup(points: u32) -> (LocationHub, Arc<MemoryEventLog>) {
        let store: Arc<MemoryStore> = Arc::new(MemoryStore::new());
        let broker = RoomBroker::new(store.clone());
        let subscriptions = Arc::new(SubscriptionRouter::new(store.clone(), broker));
        let log = Arc::new(MemoryEventLog::new());
        let mut config = GatewayConfig::default();
        config.rate_limit.location = RateLimitRule {
            points,
            window_secs: 60,
        };
        config.location_sample_rate = 3;
        (
            LocationHub::new(store, log.clone(), subscriptions, &config),
            log,
        )
    }

    fn porter_socket(user_id: &str) -> SocketHandle {
        let (tx, rx) = unbounded_channel();
        std::mem::forget(rx);
        SocketHandle::new("s-1".to_string(), user_id.to_string(), Role::Porter, tx)
    }

    fn payload(lat: f64, lng: f64) -> LocationPayload {
        LocationPayload {
            lat,
            lng,
            accuracy: 10.0,
            heading: Some(90.0),
            speed: Some(5.0),
            timestamp: Utc::now(),
            active_order_id: None,
        }
    }

    #[tokio::test]
    async fn test_update_stores_latest() {
        let (hub, _) = setup(100);
        let socket = porter_socket("p-1");
        hub.handle_update(&socket, payload(52.5, 13.4)).await.unwrap();

        let latest = hub.latest("p-1").await.unwrap().unwrap();
        assert!((latest.lat - 52.5).abs() < 1e-9);
        assert_eq!(latest.heading, Some(90.0));
    }

    #[tokio::test]
    async fn test_validation_rejects_bad_coordinates() {
        let (hub, _) = setup(100);
        let socket = porter_socket("p-1");
        for bad in [payload(91.0, 0.0), payload(0.0, -181.0)] {
            assert!(matches!(
                hub.handle_update(&socket, bad).await.unwrap_err(),
                GatewayError::Validation(_)
            ));
        }

        let mut stale = payload(0.0, 0.0);
        stale.timestamp = Utc::now() - chrono::Duration::minutes(10);
        assert!(matches!(
            hub.handle_update(&socket, stale).await.unwrap_err(),
            GatewayError::Validation(_)
        ));

        let mut negative_accuracy = payload(0.0, 0.0);
        negative_accuracy.accuracy = -1.0;
        assert!(matches!(
            hub.handle_update(&socket, negative_accuracy).await.unwrap_err(),
            GatewayError::Validation(_)
        ));
    }

    #[tokio::test]
    async fn test_rate_limit_drops_excess() {
        let (hub, _) = setup(5);
        let socket = porter_socket("p-1");
        for _ in 0..5 {
            hub.handle_update(&socket, payload(1.0, 1.0)).await.unwrap();
        }
        assert!(matches!(
            hub.handle_update(&socket, payload(1.0, 1.0)).await.unwrap_err(),
            GatewayError::RateLimitExceeded
        ));
    }

    #[tokio::test]
    async fn test_every_nth_update_sampled_to_log() {
        let (hub, log) = setup(100);
        let socket = porter_socket("p-1");
        for _ in 0..7 {
            hub.handle_update(&socket, payload(1.0, 1.0)).await.unwrap();
        }
        // sample rate 3 → updates 3 and 6
        assert_eq!(log.count_of(topics::LOCATIONS, "PorterLocationUpdated"), 2);
    }

    #[tokio::test]
    async fn test_customer_socket_rejected() {
        let (hub, _) = setup(100);
        let (tx, _rx) = unbounded_channel();
        let customer =
            SocketHandle::new("s-9".to_string(), "u-1".to_string(), Role::Customer, tx);
        assert!(matches!(
            hub.handle_update(&customer, payload(1.0, 1.0)).await.unwrap_err(),
            GatewayError::Forbidden
        ));
    }

    #[tokio::test]
    async fn test_active_order_sticks() {
        let (hub, _) = setup(100);
        let socket = porter_socket("p-1");
        let mut with_order = payload(1.0, 1.0);
        with_order.active_order_id = Some("o-1".to_string());
        hub.handle_update(&socket, with_order).await.unwrap();

        // next update omits the order id; the stored one is kept
        hub.handle_update(&socket, payload(2.0, 2.0)).await.unwrap();
        let latest = hub.latest("p-1").await.unwrap().unwrap();
        assert_eq!(latest.active_order_id.as_deref(), Some("o-1"));
    }
}
