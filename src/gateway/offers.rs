//! Job offer broker.
//!
//! Delivers a time-bounded offer to a porter and guarantees exactly one
//! terminal transition per offer. The transition itself is a compare-and-swap
//! on the stored record, so two sockets accepting at once, an accept racing
//! the expiry timer, or two instances sweeping concurrently all resolve to a
//! single winner. The in-process timer, the record TTL, and the periodic
//! pending-sweep are redundant safety nets for expiry.

use crate::eventlog::{publish_event, EventLog};
use crate::events::{DomainEvent, EventEnvelope};
use crate::gateway::rooms::{RoomBroker, SocketHandle};
use crate::gateway::ws::ServerEvent;
use crate::gateway::GatewayError;
use crate::config::GatewayConfig;
use crate::store::EphemeralStore;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, info, warn};

const PENDING_DEADLINES: &str = "offers:pending";
const SWEEP_INTERVAL: Duration = Duration::from_secs(5);

fn offer_key(offer_id: &str) -> String {
    format!("offer:{offer_id}")
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OfferStatus {
    Pending,
    Accepted,
    Rejected,
    Expired,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobOffer {
    pub offer_id: String,
    pub order_id: String,
    pub porter_id: String,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub status: OfferStatus,
}

pub struct OfferBroker {
    store: Arc<dyn EphemeralStore>,
    log: Arc<dyn EventLog>,
    broker: Arc<RoomBroker>,
    grace: Duration,
}

impl OfferBroker {
    pub fn new(
        store: Arc<dyn EphemeralStore>,
        log: Arc<dyn EventLog>,
        broker: Arc<RoomBroker>,
        config: &GatewayConfig,
    ) -> Arc<Self> {
        Arc::new(Self {
            store,
            log,
            broker,
            grace: Duration::from_secs(config.offer_grace_sec),
        })
    }

    async fn load(&self, offer_id: &str) -> Result<Option<(JobOffer, String)>, GatewayError> {
        let Some(json) = self.store.get(&offer_key(offer_id)).await? else {
            return Ok(None);
        };
        let offer: JobOffer = serde_json::from_str(&json)
            .map_err(|e| GatewayError::Upstream(format!("offer decode: {e}")))?;
        Ok(Some((offer, json)))
    }

    /// Swap `pending` for a terminal status. Returns the updated offer, or
    /// `None` when another transition won the race.
    async fn transition(
        &self,
        offer: &JobOffer,
        raw: &str,
        status: OfferStatus,
    ) -> Result<Option<JobOffer>, GatewayError> {
        let mut updated = offer.clone();
        updated.status = status;
        let new_json = serde_json::to_string(&updated)
            .map_err(|e| GatewayError::Upstream(e.to_string()))?;
        if self
            .store
            .compare_and_swap(&offer_key(&offer.offer_id), raw, &new_json)
            .await?
        {
            self.store
                .zrem(PENDING_DEADLINES, &offer.offer_id)
                .await?;
            Ok(Some(updated))
        } else {
            Ok(None)
        }
    }

    async fn emit(&self, event: DomainEvent, offer_id: &str) {
        // correlation id = offer id, so one offer's lifecycle stays ordered
        let envelope = EventEnvelope::new(event, offer_id);
        if let Err(e) = publish_event(self.log.as_ref(), &envelope).await {
            warn!(offer = offer_id, error = %e, "offer event publish failed");
        }
    }

    /// Triggered by a consumed `JobOfferCreated`. Persists the pending offer,
    /// delivers to every socket the porter holds, and arms the expiry timer.
    pub async fn send_offer(
        self: &Arc<Self>,
        offer_id: &str,
        order_id: &str,
        porter_id: &str,
        expires_at: DateTime<Utc>,
    ) -> Result<(), GatewayError> {
        let offer = JobOffer {
            offer_id: offer_id.to_string(),
            order_id: order_id.to_string(),
            porter_id: porter_id.to_string(),
            created_at: Utc::now(),
            expires_at,
            status: OfferStatus::Pending,
        };
        let until_expiry = (expires_at - Utc::now()).num_seconds().max(0) as u64;
        let ttl = Duration::from_secs(until_expiry) + self.grace;
        let json =
            serde_json::to_string(&offer).map_err(|e| GatewayError::Upstream(e.to_string()))?;
        self.store.set_ex(&offer_key(offer_id), &json, ttl).await?;
        self.store
            .zadd(
                PENDING_DEADLINES,
                offer_id,
                expires_at.timestamp_millis() as f64,
            )
            .await?;
        metrics::counter!("gateway_offers_sent_total", 1);

        // deliver now if the porter is connected anywhere; otherwise the
        // offer stays valid until expiry for delivery on reconnect
        let sockets = self
            .store
            .scard(&format!("user_sockets:{porter_id}"))
            .await?;
        if sockets == 0 {
            metrics::counter!("gateway_offer_delivery_failures_total", 1);
            debug!(offer = offer_id, porter = porter_id, "porter offline; offer parked");
        } else {
            self.broker
                .publish_user(
                    porter_id,
                    ServerEvent::JobOfferReceived {
                        offer_id: offer_id.to_string(),
                        order_id: order_id.to_string(),
                        expires_at,
                    },
                )
                .await;
        }

        // in-process expiry timer; the TTL and the sweep back it up across
        // restarts
        let this = self.clone();
        let offer_id = offer_id.to_string();
        tokio::spawn(async move {
            let delay = (expires_at - Utc::now())
                .to_std()
                .unwrap_or(Duration::ZERO);
            tokio::time::sleep(delay).await;
            if let Err(e) = this.expire_offer(&offer_id).await {
                debug!(offer = %offer_id, error = %e, "expiry tick failed");
            }
        });
        Ok(())
    }

    /// Offers still pending for a porter; delivered on reconnect.
    pub async fn pending_for_porter(
        &self,
        porter_id: &str,
    ) -> Result<Vec<JobOffer>, GatewayError> {
        let now = Utc::now();
        let ids = self
            .store
            .zrangebyscore(
                PENDING_DEADLINES,
                now.timestamp_millis() as f64,
                f64::INFINITY,
            )
            .await?;
        let mut offers = Vec::new();
        for id in ids {
            if let Some((offer, _)) = self.load(&id).await? {
                if offer.porter_id == porter_id && offer.status == OfferStatus::Pending {
                    offers.push(offer);
                }
            }
        }
        Ok(offers)
    }

    pub async fn accept(
        &self,
        offer_id: &str,
        socket: &SocketHandle,
    ) -> Result<(), GatewayError> {
        self.resolve(offer_id, socket, OfferStatus::Accepted).await
    }

    pub async fn reject(
        &self,
        offer_id: &str,
        socket: &SocketHandle,
    ) -> Result<(), GatewayError> {
        self.resolve(offer_id, socket, OfferStatus::Rejected).await
    }

    async fn resolve(
        &self,
        offer_id: &str,
        socket: &SocketHandle,
        status: OfferStatus,
    ) -> Result<(), GatewayError> {
        let (offer, raw) = self
            .load(offer_id)
            .await?
            .ok_or(GatewayError::OfferNotFound)?;
        if offer.porter_id != socket.user_id {
            return Err(GatewayError::Forbidden);
        }
        if offer.status != OfferStatus::Pending {
            return Err(GatewayError::OfferAlreadyProcessed);
        }
        let now = Utc::now();
        if now > offer.expires_at {
            // late answer: drive the expiry transition ourselves so the
            // outcome count stays at exactly one
            if let Some(expired) = self.transition(&offer, &raw, OfferStatus::Expired).await? {
                self.emit(
                    DomainEvent::JobOfferExpired {
                        offer_id: expired.offer_id.clone(),
                        order_id: expired.order_id.clone(),
                        porter_id: expired.porter_id.clone(),
                        timestamp: now,
                    },
                    offer_id,
                )
                .await;
            }
            return Err(GatewayError::OfferExpired);
        }

        let Some(updated) = self.transition(&offer, &raw, status).await? else {
            return Err(GatewayError::OfferAlreadyProcessed);
        };
        let event = match status {
            OfferStatus::Accepted => DomainEvent::JobOfferAccepted {
                offer_id: updated.offer_id.clone(),
                order_id: updated.order_id.clone(),
                porter_id: updated.porter_id.clone(),
                timestamp: now,
            },
            OfferStatus::Rejected => DomainEvent::JobOfferRejected {
                offer_id: updated.offer_id.clone(),
                order_id: updated.order_id.clone(),
                porter_id: updated.porter_id.clone(),
                timestamp: now,
            },
            _ => unreachable!("resolve only takes accepted/rejected"),
        };
        self.emit(event, offer_id).await;
        metrics::counter!(
            "gateway_offer_outcomes_total",
            1,
            "outcome" => match status {
                OfferStatus::Accepted => "accepted",
                _ => "rejected",
            }
        );
        info!(offer = offer_id, porter = %socket.user_id, outcome = ?status, "offer resolved");
        Ok(())
    }

    /// Expiry tick: transition to expired iff still pending.
    pub async fn expire_offer(&self, offer_id: &str) -> Result<(), GatewayError> {
        let Some((offer, raw)) = self.load(offer_id).await? else {
            // TTL already reclaimed the record
            self.store.zrem(PENDING_DEADLINES, offer_id).await?;
            return Ok(());
        };
        if offer.status != OfferStatus::Pending {
            return Ok(());
        }
        if Utc::now() < offer.expires_at {
            return Ok(());
        }
        if let Some(expired) = self.transition(&offer, &raw, OfferStatus::Expired).await? {
            self.emit(
                DomainEvent::JobOfferExpired {
                    offer_id: expired.offer_id.clone(),
                    order_id: expired.order_id.clone(),
                    porter_id: expired.porter_id.clone(),
                    timestamp: Utc::now(),
                },
                offer_id,
            )
            .await;
            metrics::counter!("gateway_offer_outcomes_total", 1, "outcome" => "expired");
            info!(offer = offer_id, "offer expired");
        }
        Ok(())
    }

    /// Restart-safe backstop: sweep pending offers whose deadline passed.
    pub async fn sweep(&self) -> usize {
        let now = Utc::now().timestamp_millis() as f64;
        let due = match self.store.zrangebyscore(PENDING_DEADLINES, 0.0, now).await {
            Ok(ids) => ids,
            Err(e) => {
                warn!(error = %e, "offer sweep scan failed");
                return 0;
            }
        };
        let mut expired = 0;
        for offer_id in due {
            match self.expire_offer(&offer_id).await {
                Ok(()) => expired += 1,
                Err(e) => warn!(offer = %offer_id, error = %e, "offer sweep failed"),
            }
        }
        expired
    }

    pub async fn run_sweeper(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let mut interval = tokio::time::interval(SWEEP_INTERVAL);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    self.sweep().await;
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        return;
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::Role;
    use crate::eventlog::MemoryEventLog;
    use crate::events::topics;
    use crate::store::MemoryStore;
    use tokio::sync::mpsc::unbounded_channel;

    fn setup() -> (Arc<OfferBroker>, Arc<MemoryEventLog>, Arc<MemoryStore>) {
        let store: Arc<MemoryStore> = Arc::new(MemoryStore::new());
        let log = Arc::new(MemoryEventLog::new());
        let broker = RoomBroker::new(store.clone());
        let offers = OfferBroker::new(store.clone(), log.clone(), broker, &GatewayConfig::default());
        (offers, log, store)
    }

    fn porter(socket_id: &str, user_id: &str) -> SocketHandle {
        let (tx, rx) = unbounded_channel();
        std::mem::forget(rx);
        SocketHandle::new(socket_id.to_string(), user_id.to_string(), Role::Porter, tx)
    }

    #[tokio::test]
    async fn test_accept_happy_path() {
        let (offers, log, _) = setup();
        offers
            .send_offer("f-1", "o-1", "p-1", Utc::now() + chrono::Duration::seconds(30))
            .await
            .unwrap();

        let socket = porter("s-1", "p-1");
        offers.accept("f-1", &socket).await.unwrap();
        assert_eq!(log.count_of(topics::OFFERS, "JobOfferAccepted"), 1);

        // second answer from another socket of the same porter
        let second = porter("s-2", "p-1");
        assert!(matches!(
            offers.reject("f-1", &second).await.unwrap_err(),
            GatewayError::OfferAlreadyProcessed
        ));
        // still exactly one outcome on the log
        let outcomes = log.count_of(topics::OFFERS, "JobOfferAccepted")
            + log.count_of(topics::OFFERS, "JobOfferRejected")
            + log.count_of(topics::OFFERS, "JobOfferExpired");
        assert_eq!(outcomes, 1);
    }

    #[tokio::test]
    async fn test_offer_race_two_sockets() {
        let (offers, log, _) = setup();
        offers
            .send_offer("f-1", "o-1", "p-1", Utc::now() + chrono::Duration::seconds(30))
            .await
            .unwrap();

        let mut handles = Vec::new();
        for socket_id in ["s-1", "s-2"] {
            let offers = offers.clone();
            let socket = porter(socket_id, "p-1");
            handles.push(tokio::spawn(async move {
                offers.accept("f-1", &socket).await
            }));
        }
        let mut wins = 0;
        for handle in handles {
            match handle.await.unwrap() {
                Ok(()) => wins += 1,
                Err(e) => assert!(matches!(e, GatewayError::OfferAlreadyProcessed)),
            }
        }
        assert_eq!(wins, 1);
        assert_eq!(log.count_of(topics::OFFERS, "JobOfferAccepted"), 1);
    }

    #[tokio::test]
    async fn test_wrong_porter_forbidden() {
        let (offers, _, _) = setup();
        offers
            .send_offer("f-1", "o-1", "p-1", Utc::now() + chrono::Duration::seconds(30))
            .await
            .unwrap();
        let other = porter("s-9", "p-other");
        assert!(matches!(
            offers.accept("f-1", &other).await.unwrap_err(),
            GatewayError::Forbidden
        ));
    }

    #[tokio::test]
    async fn test_missing_offer() {
        let (offers, _, _) = setup();
        let socket = porter("s-1", "p-1");
        assert!(matches!(
            offers.accept("f-missing", &socket).await.unwrap_err(),
            GatewayError::OfferNotFound
        ));
    }

    #[tokio::test]
    async fn test_late_accept_expires_exactly_once() {
        let (offers, log, store) = setup();
        // seed an overdue pending offer directly, as if delivered by an
        // instance that died before its timer fired
        let offer = JobOffer {
            offer_id: "f-1".to_string(),
            order_id: "o-1".to_string(),
            porter_id: "p-1".to_string(),
            created_at: Utc::now() - chrono::Duration::seconds(60),
            expires_at: Utc::now() - chrono::Duration::seconds(1),
            status: OfferStatus::Pending,
        };
        use crate::store::EphemeralStore as _;
        store
            .set_ex(
                "offer:f-1",
                &serde_json::to_string(&offer).unwrap(),
                Duration::from_secs(60),
            )
            .await
            .unwrap();
        store
            .zadd(
                PENDING_DEADLINES,
                "f-1",
                offer.expires_at.timestamp_millis() as f64,
            )
            .await
            .unwrap();

        let socket = porter("s-1", "p-1");
        assert!(matches!(
            offers.accept("f-1", &socket).await.unwrap_err(),
            GatewayError::OfferExpired
        ));
        // the sweep finds nothing left to do
        offers.sweep().await;
        assert_eq!(log.count_of(topics::OFFERS, "JobOfferExpired"), 1);
    }

    #[tokio::test]
    async fn test_sweep_expires_pending() {
        let (offers, log, _) = setup();
        offers
            .send_offer("f-1", "o-1", "p-1", Utc::now() - chrono::Duration::seconds(1))
            .await
            .unwrap();
        offers.sweep().await;
        assert_eq!(log.count_of(topics::OFFERS, "JobOfferExpired"), 1);

        // idempotent
        offers.sweep().await;
        assert_eq!(log.count_of(topics::OFFERS, "JobOfferExpired"), 1);
    }

    #[tokio::test]
    async fn test_delivery_failure_parks_offer() {
        let (offers, _, store) = setup();
        offers
            .send_offer("f-1", "o-1", "p-offline", Utc::now() + chrono::Duration::seconds(60))
            .await
            .unwrap();

        // offer is parked and discoverable for reconnect delivery
        let pending = offers.pending_for_porter("p-offline").await.unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].status, OfferStatus::Pending);
        use crate::store::EphemeralStore as _;
        assert!(store.get("offer:f-1").await.unwrap().is_some());
    }
}
