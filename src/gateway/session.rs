//! Socket auth and session registry.
//!
//! Sessions and per-user socket sets live in the ephemeral store so any
//! instance can address a user. Disconnection mints a single-use reconnect
//! token; resuming re-plays subscription joins and reconciles order state
//! with a one-shot read (the log offers no replay for missed samples).

use crate::auth::Role;
use crate::gateway::rooms::{RoomBroker, SocketHandle, ADMIN_ROOM};
use crate::gateway::subscriptions::SubscriptionRouter;
use crate::gateway::ws::ServerEvent;
use crate::gateway::GatewayError;
use crate::config::GatewayConfig;
use crate::store::EphemeralStore;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};
use uuid::Uuid;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SocketSession {
    pub user_id: String,
    pub role: Role,
    pub connected_at: DateTime<Utc>,
    pub last_activity_at: DateTime<Utc>,
}

/// Snapshot referenced by a reconnect token.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReconnectSnapshot {
    pub user_id: String,
    pub role: Role,
    pub disconnected_at: DateTime<Utc>,
}

#[derive(Debug)]
pub struct DisconnectOutcome {
    pub reconnect_token: String,
    pub last_porter_socket: bool,
}

fn session_key(socket_id: &str) -> String {
    format!("session:{socket_id}")
}

fn user_sockets_key(user_id: &str) -> String {
    format!("user_sockets:{user_id}")
}

fn reconnect_key(token: &str) -> String {
    format!("reconnect:{token}")
}

pub struct SessionRegistry {
    store: Arc<dyn EphemeralStore>,
    broker: Arc<RoomBroker>,
    subscriptions: Arc<SubscriptionRouter>,
    config: GatewayConfig,
}

impl SessionRegistry {
    pub fn new(
        store: Arc<dyn EphemeralStore>,
        broker: Arc<RoomBroker>,
        subscriptions: Arc<SubscriptionRouter>,
        config: GatewayConfig,
    ) -> Self {
        Self {
            store,
            broker,
            subscriptions,
            config,
        }
    }

    fn session_ttl(&self) -> Duration {
        Duration::from_secs(self.config.session_ttl_sec)
    }

    /// Register a freshly-authenticated socket. A porter's first socket
    /// announces `PORTER_ONLINE` to the admin room.
    pub async fn connect(&self, socket: &SocketHandle) -> Result<(), GatewayError> {
        let now = Utc::now();
        let session = SocketSession {
            user_id: socket.user_id.clone(),
            role: socket.role,
            connected_at: now,
            last_activity_at: now,
        };
        let json = serde_json::to_string(&session)
            .map_err(|e| GatewayError::Upstream(e.to_string()))?;
        self.store
            .set_ex(&session_key(&socket.socket_id), &json, self.session_ttl())
            .await?;
        self.store
            .sadd(&user_sockets_key(&socket.user_id), &socket.socket_id)
            .await?;
        self.store
            .expire(&user_sockets_key(&socket.user_id), self.session_ttl())
            .await?;

        if socket.role == Role::Porter {
            let live = self.store.scard(&user_sockets_key(&socket.user_id)).await?;
            if live == 1 {
                self.broker
                    .publish_room(
                        ADMIN_ROOM,
                        ServerEvent::PorterOnline {
                            porter_id: socket.user_id.clone(),
                        },
                    )
                    .await;
            }
        }
        Ok(())
    }

    pub async fn session(&self, socket_id: &str) -> Result<Option<SocketSession>, GatewayError> {
        let Some(json) = self.store.get(&session_key(socket_id)).await? else {
            return Ok(None);
        };
        Ok(serde_json::from_str(&json).ok())
    }

    /// Refresh activity and echo the server timestamp.
    pub async fn heartbeat(&self, socket_id: &str) -> Result<DateTime<Utc>, GatewayError> {
        let now = Utc::now();
        let Some(mut session) = self.session(socket_id).await? else {
            return Err(GatewayError::Unauthenticated);
        };
        session.last_activity_at = now;
        let json = serde_json::to_string(&session)
            .map_err(|e| GatewayError::Upstream(e.to_string()))?;
        self.store
            .set_ex(&session_key(socket_id), &json, self.session_ttl())
            .await?;
        self.store
            .expire(&user_sockets_key(&session.user_id), self.session_ttl())
            .await?;
        Ok(now)
    }

    /// Tear down registry entries, mint the one-use reconnect token, and
    /// announce `PORTER_OFFLINE` when a porter's last socket departs.
    pub async fn disconnect(
        &self,
        socket: &SocketHandle,
        reason: &str,
    ) -> Result<DisconnectOutcome, GatewayError> {
        let token = Uuid::new_v4().to_string();
        let snapshot = ReconnectSnapshot {
            user_id: socket.user_id.clone(),
            role: socket.role,
            disconnected_at: Utc::now(),
        };
        let json = serde_json::to_string(&snapshot)
            .map_err(|e| GatewayError::Upstream(e.to_string()))?;
        self.store
            .set_ex(
                &reconnect_key(&token),
                &json,
                Duration::from_secs(self.config.reconnect_token_ttl_sec),
            )
            .await?;

        self.store.del(&session_key(&socket.socket_id)).await?;
        self.store
            .srem(&user_sockets_key(&socket.user_id), &socket.socket_id)
            .await?;

        let mut last_porter_socket = false;
        if socket.role == Role::Porter {
            let remaining = self.store.scard(&user_sockets_key(&socket.user_id)).await?;
            if remaining == 0 {
                last_porter_socket = true;
                self.broker
                    .publish_room(
                        ADMIN_ROOM,
                        ServerEvent::PorterOffline {
                            porter_id: socket.user_id.clone(),
                        },
                    )
                    .await;
            }
        }
        debug!(socket = %socket.socket_id, reason, "session removed");
        Ok(DisconnectOutcome {
            reconnect_token: token,
            last_porter_socket,
        })
    }

    /// Resume a prior session: consume the token (single use), re-play
    /// subscription joins, and reconcile current order state.
    pub async fn resume(
        &self,
        socket: &SocketHandle,
        reconnect_token: &str,
    ) -> Result<(), GatewayError> {
        let key = reconnect_key(reconnect_token);
        let Some(json) = self.store.get(&key).await? else {
            return Err(GatewayError::ReconnectInvalid);
        };
        // single use: whoever deletes the exact stored value wins
        if !self.store.compare_and_delete(&key, &json).await? {
            return Err(GatewayError::ReconnectInvalid);
        }
        let snapshot: ReconnectSnapshot =
            serde_json::from_str(&json).map_err(|_| GatewayError::ReconnectInvalid)?;
        if snapshot.user_id != socket.user_id {
            return Err(GatewayError::Forbidden);
        }

        let rejoined = self.subscriptions.resubscribe(socket).await?;
        // missed status events are reconciled with a one-shot state read;
        // missed location/chat samples are simply lost
        for order_id in &rejoined {
            if let Some(event) = self.subscriptions.current_order_state(order_id).await? {
                socket.send(event);
            }
        }
        info!(
            socket = %socket.socket_id,
            user = %socket.user_id,
            orders = rejoined.len(),
            "session resumed"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use tokio::sync::mpsc::unbounded_channel;

    fn setup() -> (SessionRegistry, Arc<RoomBroker>, Arc<MemoryStore>) {
        let store: Arc<MemoryStore> = Arc::new(MemoryStore::new());
        let broker = RoomBroker::new(store.clone());
        let subscriptions = Arc::new(SubscriptionRouter::new(store.clone(), broker.clone()));
        let registry = SessionRegistry::new(
            store.clone(),
            broker.clone(),
            subscriptions,
            GatewayConfig::default(),
        );
        (registry, broker, store)
    }

    fn socket(socket_id: &str, user_id: &str, role: Role) -> SocketHandle {
        let (tx, rx) = unbounded_channel();
        std::mem::forget(rx); // keep the channel open for send() checks
        SocketHandle::new(socket_id.to_string(), user_id.to_string(), role, tx)
    }

    #[tokio::test]
    async fn test_connect_writes_session_and_user_set() {
        let (registry, _, store) = setup();
        let porter = socket("s-1", "p-1", Role::Porter);
        registry.connect(&porter).await.unwrap();

        let session = registry.session("s-1").await.unwrap().unwrap();
        assert_eq!(session.user_id, "p-1");
        assert_eq!(session.role, Role::Porter);
        use crate::store::EphemeralStore as _;
        assert_eq!(store.scard("user_sockets:p-1").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_heartbeat_refreshes_activity() {
        let (registry, _, _) = setup();
        let customer = socket("s-1", "u-1", Role::Customer);
        registry.connect(&customer).await.unwrap();

        let before = registry.session("s-1").await.unwrap().unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        let echoed = registry.heartbeat("s-1").await.unwrap();
        let after = registry.session("s-1").await.unwrap().unwrap();
        assert!(after.last_activity_at >= before.last_activity_at);
        assert_eq!(after.last_activity_at, echoed);

        // unknown socket
        assert!(matches!(
            registry.heartbeat("s-unknown").await.unwrap_err(),
            GatewayError::Unauthenticated
        ));
    }

    #[tokio::test]
    async fn test_disconnect_flags_last_porter_socket() {
        let (registry, _, _) = setup();
        let first = socket("s-1", "p-1", Role::Porter);
        let second = socket("s-2", "p-1", Role::Porter);
        registry.connect(&first).await.unwrap();
        registry.connect(&second).await.unwrap();

        let outcome = registry.disconnect(&first, "test").await.unwrap();
        assert!(!outcome.last_porter_socket);
        let outcome = registry.disconnect(&second, "test").await.unwrap();
        assert!(outcome.last_porter_socket);
    }

    #[tokio::test]
    async fn test_reconnect_token_is_single_use() {
        let (registry, _, _) = setup();
        let customer = socket("s-1", "u-1", Role::Customer);
        registry.connect(&customer).await.unwrap();
        let outcome = registry.disconnect(&customer, "network blip").await.unwrap();

        let fresh = socket("s-2", "u-1", Role::Customer);
        registry
            .resume(&fresh, &outcome.reconnect_token)
            .await
            .unwrap();

        // replay fails
        let again = socket("s-3", "u-1", Role::Customer);
        assert!(matches!(
            registry.resume(&again, &outcome.reconnect_token).await.unwrap_err(),
            GatewayError::ReconnectInvalid
        ));
    }

    #[tokio::test]
    async fn test_reconnect_token_bound_to_user() {
        let (registry, _, _) = setup();
        let customer = socket("s-1", "u-1", Role::Customer);
        registry.connect(&customer).await.unwrap();
        let outcome = registry.disconnect(&customer, "bye").await.unwrap();

        let impostor = socket("s-2", "u-other", Role::Customer);
        assert!(matches!(
            registry.resume(&impostor, &outcome.reconnect_token).await.unwrap_err(),
            GatewayError::Forbidden
        ));
    }
}
