//! Domain event reactor.
//!
//! Consumes external order/porter events and forces window and bid
//! transitions. Every handler is idempotent under event-log redelivery: the
//! underlying transitions only move rows out of non-terminal states.

use crate::bidding::windows::BidWindowManager;
use crate::eventlog::EventHandler;
use crate::events::{DomainEvent, EventEnvelope};
use async_trait::async_trait;
use std::sync::Arc;
use tracing::{debug, info};

pub struct DomainEventReactor {
    manager: Arc<BidWindowManager>,
}

impl DomainEventReactor {
    pub fn new(manager: Arc<BidWindowManager>) -> Self {
        Self { manager }
    }

    async fn on_order_cancelled(&self, order_id: &str) -> anyhow::Result<()> {
        let window_ids = self.manager.db().open_window_ids_for_order(order_id)?;
        for window_id in window_ids {
            if self
                .manager
                .cancel_window(&window_id, "order cancelled")
                .await?
            {
                info!(window = %window_id, order = order_id, "window cancelled (order cancelled)");
            }
        }
        Ok(())
    }

    async fn on_porter_suspended(
        &self,
        porter_id: &str,
        correlation_id: &str,
    ) -> anyhow::Result<()> {
        let cancelled = self
            .manager
            .cancel_porter_bids(porter_id, "porter suspended", correlation_id)
            .await?;
        if !cancelled.is_empty() {
            info!(
                porter = porter_id,
                bids = cancelled.len(),
                "cancelled bids of suspended porter"
            );
        }
        Ok(())
    }

    async fn on_order_assigned(&self, order_id: &str) -> anyhow::Result<()> {
        // another path to this order was chosen; serialize with accept_bid
        // via the window's accept lock
        let window_ids = self.manager.db().open_window_ids_for_order(order_id)?;
        for window_id in window_ids {
            match self.manager.close_window_locked(&window_id).await {
                Ok(result) => info!(
                    window = %window_id,
                    order = order_id,
                    expired_bids = result.expired_bids.len(),
                    "window closed (order assigned elsewhere)"
                ),
                // already closed by accept or a peer; redelivery-safe
                Err(crate::bidding::BidError::WindowNotOpen) => {}
                Err(e) => return Err(e.into()),
            }
        }
        Ok(())
    }
}

#[async_trait]
impl EventHandler for DomainEventReactor {
    fn event_types(&self) -> Vec<&'static str> {
        vec![
            "OrderCancelled",
            "PorterSuspended",
            "OrderAssigned",
            "OrderCompleted",
        ]
    }

    async fn handle(&self, envelope: &EventEnvelope) -> anyhow::Result<()> {
        match &envelope.event {
            DomainEvent::OrderCancelled { order_id, .. } => {
                self.on_order_cancelled(order_id).await
            }
            DomainEvent::PorterSuspended { porter_id, .. } => {
                self.on_porter_suspended(porter_id, &envelope.correlation_id)
                    .await
            }
            DomainEvent::OrderAssigned { order_id, .. } => self.on_order_assigned(order_id).await,
            DomainEvent::OrderCompleted { order_id, .. } => {
                debug!(order = %order_id, "order completed (informational)");
                Ok(())
            }
            other => {
                debug!(event_type = other.type_name(), "reactor ignoring event");
                Ok(())
            }
        }
    }
}
