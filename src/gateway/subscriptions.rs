//! Subscription router.
//!
//! Tracks which users watch which orders and fans status/timeline/location/
//! chat events to them across instances. Authorization: the order's customer,
//! the assigned porter, or an admin. Ownership is learned from consumed order
//! events; an order the gateway has not yet seen is allowed optimistically
//! rather than locking customers out after a store flush.

use crate::auth::Role;
use crate::gateway::rooms::{order_room, RoomBroker, SocketHandle};
use crate::gateway::ws::ServerEvent;
use crate::gateway::GatewayError;
use crate::store::EphemeralStore;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

const SUBSCRIPTION_TTL: Duration = Duration::from_secs(24 * 3600);

fn order_subs_key(order_id: &str) -> String {
    format!("order_subs:{order_id}")
}

fn user_subs_key(user_id: &str) -> String {
    format!("user_subs:{user_id}")
}

fn order_owner_key(order_id: &str) -> String {
    format!("order_owner:{order_id}")
}

fn order_state_key(order_id: &str) -> String {
    format!("order_state:{order_id}")
}

/// What the gateway knows about an order's parties.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OrderOwnership {
    pub customer_id: Option<String>,
    pub porter_id: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct OrderState {
    status: String,
    occurred_at: DateTime<Utc>,
}

pub struct SubscriptionRouter {
    store: Arc<dyn EphemeralStore>,
    broker: Arc<RoomBroker>,
}

impl SubscriptionRouter {
    pub fn new(store: Arc<dyn EphemeralStore>, broker: Arc<RoomBroker>) -> Self {
        Self { store, broker }
    }

    async fn authorize(&self, socket: &SocketHandle, order_id: &str) -> Result<(), GatewayError> {
        if socket.role == Role::Admin {
            return Ok(());
        }
        let Some(json) = self.store.get(&order_owner_key(order_id)).await? else {
            debug!(order = order_id, "no ownership record; allowing subscription");
            return Ok(());
        };
        let ownership: OrderOwnership = serde_json::from_str(&json).unwrap_or_default();
        let allowed = match socket.role {
            Role::Customer => ownership.customer_id.as_deref() == Some(&socket.user_id),
            Role::Porter => ownership.porter_id.as_deref() == Some(&socket.user_id),
            Role::Admin => true,
        };
        if allowed {
            Ok(())
        } else {
            Err(GatewayError::Forbidden)
        }
    }

    pub async fn subscribe(
        &self,
        socket: &SocketHandle,
        order_id: &str,
    ) -> Result<(), GatewayError> {
        self.authorize(socket, order_id).await?;

        let member = format!("{}|{}", socket.user_id, socket.role);
        self.store.sadd(&order_subs_key(order_id), &member).await?;
        self.store
            .expire(&order_subs_key(order_id), SUBSCRIPTION_TTL)
            .await?;
        self.store
            .sadd(&user_subs_key(&socket.user_id), order_id)
            .await?;
        self.store
            .expire(&user_subs_key(&socket.user_id), SUBSCRIPTION_TTL)
            .await?;

        self.broker.join(&order_room(order_id), &socket.socket_id);
        socket.send(ServerEvent::Subscribed {
            order_id: order_id.to_string(),
        });
        metrics::counter!("gateway_subscriptions_total", 1);
        Ok(())
    }

    pub async fn unsubscribe(
        &self,
        socket: &SocketHandle,
        order_id: &str,
    ) -> Result<(), GatewayError> {
        let member = format!("{}|{}", socket.user_id, socket.role);
        self.store.srem(&order_subs_key(order_id), &member).await?;
        self.store
            .srem(&user_subs_key(&socket.user_id), order_id)
            .await?;
        self.broker.leave(&order_room(order_id), &socket.socket_id);
        socket.send(ServerEvent::Unsubscribed {
            order_id: order_id.to_string(),
        });
        Ok(())
    }

    /// Is this user currently subscribed to the order (on any socket)?
    pub async fn is_subscriber(&self, user_id: &str, order_id: &str) -> Result<bool, GatewayError> {
        let orders = self.store.smembers(&user_subs_key(user_id)).await?;
        Ok(orders.iter().any(|o| o == order_id))
    }

    /// Re-join every order the user was subscribed to; used on reconnect.
    /// Returns the rejoined order ids.
    pub async fn resubscribe(&self, socket: &SocketHandle) -> Result<Vec<String>, GatewayError> {
        let orders = self.store.smembers(&user_subs_key(&socket.user_id)).await?;
        for order_id in &orders {
            let member = format!("{}|{}", socket.user_id, socket.role);
            self.store.sadd(&order_subs_key(order_id), &member).await?;
            self.store
                .expire(&order_subs_key(order_id), SUBSCRIPTION_TTL)
                .await?;
            self.broker.join(&order_room(order_id), &socket.socket_id);
        }
        Ok(orders)
    }

    // ----- order bookkeeping fed by the event consumer -----

    pub async fn record_customer(&self, order_id: &str, user_id: &str) -> Result<(), GatewayError> {
        let mut ownership = self.ownership(order_id).await?;
        ownership.customer_id = Some(user_id.to_string());
        self.write_ownership(order_id, &ownership).await
    }

    pub async fn record_porter(&self, order_id: &str, porter_id: &str) -> Result<(), GatewayError> {
        let mut ownership = self.ownership(order_id).await?;
        ownership.porter_id = Some(porter_id.to_string());
        self.write_ownership(order_id, &ownership).await
    }

    async fn ownership(&self, order_id: &str) -> Result<OrderOwnership, GatewayError> {
        Ok(self
            .store
            .get(&order_owner_key(order_id))
            .await?
            .and_then(|json| serde_json::from_str(&json).ok())
            .unwrap_or_default())
    }

    async fn write_ownership(
        &self,
        order_id: &str,
        ownership: &OrderOwnership,
    ) -> Result<(), GatewayError> {
        let json = serde_json::to_string(ownership)
            .map_err(|e| GatewayError::Upstream(e.to_string()))?;
        self.store
            .set_ex(&order_owner_key(order_id), &json, SUBSCRIPTION_TTL)
            .await?;
        Ok(())
    }

    /// Cache the latest status so reconnecting subscribers can reconcile.
    pub async fn record_order_state(
        &self,
        order_id: &str,
        status: &str,
        occurred_at: DateTime<Utc>,
    ) -> Result<(), GatewayError> {
        let state = OrderState {
            status: status.to_string(),
            occurred_at,
        };
        let json =
            serde_json::to_string(&state).map_err(|e| GatewayError::Upstream(e.to_string()))?;
        self.store
            .set_ex(&order_state_key(order_id), &json, SUBSCRIPTION_TTL)
            .await?;
        Ok(())
    }

    pub async fn current_order_state(
        &self,
        order_id: &str,
    ) -> Result<Option<ServerEvent>, GatewayError> {
        let Some(json) = self.store.get(&order_state_key(order_id)).await? else {
            return Ok(None);
        };
        let Ok(state) = serde_json::from_str::<OrderState>(&json) else {
            return Ok(None);
        };
        Ok(Some(ServerEvent::OrderStatusChanged {
            order_id: order_id.to_string(),
            status: state.status,
            occurred_at: state.occurred_at,
        }))
    }

    /// Fan an event to every subscriber room member across instances.
    pub async fn broadcast(&self, order_id: &str, event: ServerEvent) {
        self.broker.publish_room(&order_room(order_id), event).await;
    }
}
