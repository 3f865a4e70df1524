//! Gateway event consumer.
//!
//! Bridges the event log into connected sockets: order lifecycle events
//! become `ORDER_STATUS_CHANGED` broadcasts to the per-order room, and
//! `JobOfferCreated` drives the offer broker. Ownership and latest-status
//! records are maintained here so subscription authorization and reconnect
//! reconciliation have something to read.

use crate::eventlog::EventHandler;
use crate::events::{DomainEvent, EventEnvelope};
use crate::gateway::state::GatewayState;
use crate::gateway::ws::ServerEvent;
use async_trait::async_trait;
use tracing::warn;

pub struct GatewayEventConsumer {
    state: GatewayState,
}

impl GatewayEventConsumer {
    pub fn new(state: GatewayState) -> Self {
        Self { state }
    }

    async fn status_change(
        &self,
        order_id: &str,
        status: &str,
        occurred_at: chrono::DateTime<chrono::Utc>,
    ) -> anyhow::Result<()> {
        self.state
            .subscriptions
            .record_order_state(order_id, status, occurred_at)
            .await?;
        self.state
            .subscriptions
            .broadcast(
                order_id,
                ServerEvent::OrderStatusChanged {
                    order_id: order_id.to_string(),
                    status: status.to_string(),
                    occurred_at,
                },
            )
            .await;
        Ok(())
    }
}

#[async_trait]
impl EventHandler for GatewayEventConsumer {
    fn event_types(&self) -> Vec<&'static str> {
        vec![
            "OrderCreated",
            "OrderConfirmed",
            "OrderAssigned",
            "OrderStarted",
            "OrderCompleted",
            "OrderCancelled",
            "OrderStatusChanged",
            "OrderTimelineUpdated",
            "JobOfferCreated",
        ]
    }

    async fn handle(&self, envelope: &EventEnvelope) -> anyhow::Result<()> {
        let at = envelope.timestamp;
        match &envelope.event {
            DomainEvent::OrderCreated { order_id, user_id } => {
                self.state
                    .subscriptions
                    .record_customer(order_id, user_id)
                    .await?;
                self.status_change(order_id, "created", at).await
            }
            DomainEvent::OrderConfirmed { order_id, .. } => {
                self.status_change(order_id, "confirmed", at).await
            }
            DomainEvent::OrderAssigned {
                order_id,
                porter_id,
                ..
            } => {
                self.state
                    .subscriptions
                    .record_porter(order_id, porter_id)
                    .await?;
                self.status_change(order_id, "assigned", at).await
            }
            DomainEvent::OrderStarted { order_id, .. } => {
                self.status_change(order_id, "started", at).await
            }
            DomainEvent::OrderCompleted { order_id, .. } => {
                self.status_change(order_id, "completed", at).await
            }
            DomainEvent::OrderCancelled { order_id, .. } => {
                self.status_change(order_id, "cancelled", at).await
            }
            DomainEvent::OrderStatusChanged {
                order_id,
                status,
                occurred_at,
            } => self.status_change(order_id, status, *occurred_at).await,
            DomainEvent::OrderTimelineUpdated {
                order_id,
                entry,
                occurred_at,
            } => {
                self.state
                    .subscriptions
                    .broadcast(
                        order_id,
                        ServerEvent::OrderTimelineUpdated {
                            order_id: order_id.to_string(),
                            entry: entry.clone(),
                            occurred_at: *occurred_at,
                        },
                    )
                    .await;
                Ok(())
            }
            DomainEvent::JobOfferCreated {
                offer_id,
                order_id,
                porter_id,
                expires_at,
            } => {
                self.state
                    .offers
                    .send_offer(offer_id, order_id, porter_id, *expires_at)
                    .await?;
                Ok(())
            }
            other => {
                warn!(event_type = other.type_name(), "gateway consumer got unregistered event");
                Ok(())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::{Role, TokenVerifier};
    use crate::config::GatewayConfig;
    use crate::eventlog::MemoryEventLog;
    use crate::gateway::rooms::{order_room, SocketHandle};
    use crate::store::MemoryStore;
    use chrono::Utc;
    use std::sync::Arc;
    use tokio::sync::mpsc::unbounded_channel;

    async fn setup() -> (GatewayEventConsumer, GatewayState) {
        let store: Arc<MemoryStore> = Arc::new(MemoryStore::new());
        let log = Arc::new(MemoryEventLog::new());
        let verifier = Arc::new(TokenVerifier::new("access-test-key", "socket-test-key"));
        let state = GatewayState::build(GatewayConfig::default(), verifier, store, log);
        state.broker.run_fanout().await.unwrap();
        tokio::task::yield_now().await;
        (GatewayEventConsumer::new(state.clone()), state)
    }

    #[tokio::test]
    async fn test_order_assigned_broadcasts_and_records() {
        let (consumer, state) = setup().await;

        let (tx, mut rx) = unbounded_channel();
        let socket = SocketHandle::new("s-1".into(), "u-1".into(), Role::Customer, tx);
        state.broker.register(socket.clone());
        state.broker.join(&order_room("o-1"), "s-1");

        consumer
            .handle(&EventEnvelope::new(
                DomainEvent::OrderAssigned {
                    order_id: "o-1".into(),
                    porter_id: "p-1".into(),
                    user_id: "u-1".into(),
                },
                "corr-1",
            ))
            .await
            .unwrap();

        let frame = tokio::time::timeout(std::time::Duration::from_secs(1), rx.recv())
            .await
            .unwrap()
            .unwrap();
        match frame {
            ServerEvent::OrderStatusChanged { status, .. } => assert_eq!(status, "assigned"),
            other => panic!("unexpected frame {other:?}"),
        }

        // reconnect reconciliation sees the cached state
        let cached = state
            .subscriptions
            .current_order_state("o-1")
            .await
            .unwrap();
        assert!(cached.is_some());
    }

    #[tokio::test]
    async fn test_job_offer_created_drives_broker() {
        let (consumer, state) = setup().await;
        consumer
            .handle(&EventEnvelope::new(
                DomainEvent::JobOfferCreated {
                    offer_id: "f-1".into(),
                    order_id: "o-1".into(),
                    porter_id: "p-1".into(),
                    expires_at: Utc::now() + chrono::Duration::seconds(30),
                },
                "f-1",
            ))
            .await
            .unwrap();

        let pending = state.offers.pending_for_porter("p-1").await.unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].order_id, "o-1");
    }
}
