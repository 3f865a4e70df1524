//! Rooms and cross-instance fan-out.
//!
//! Socket handles and room membership live in-process; delivery between
//! instances rides the ephemeral store's pub/sub channels. Every publish goes
//! through the channel (the publishing instance included), so one code path
//! serves local and remote members alike.

use crate::auth::Role;
use crate::gateway::ws::ServerEvent;
use crate::store::EphemeralStore;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, warn};

pub const ADMIN_ROOM: &str = "admin";

pub fn order_room(order_id: &str) -> String {
    format!("order:{order_id}")
}

/// A connected socket: identity plus the outbound frame queue.
#[derive(Clone)]
pub struct SocketHandle {
    pub socket_id: String,
    pub user_id: String,
    pub role: Role,
    sender: mpsc::UnboundedSender<ServerEvent>,
}

impl SocketHandle {
    pub fn new(
        socket_id: String,
        user_id: String,
        role: Role,
        sender: mpsc::UnboundedSender<ServerEvent>,
    ) -> Self {
        Self {
            socket_id,
            user_id,
            role,
            sender,
        }
    }

    /// Queue a frame. A full or closed socket drops the frame; delivery to
    /// offline recipients is not an error, only counted.
    pub fn send(&self, event: ServerEvent) -> bool {
        let delivered = self.sender.send(event).is_ok();
        if !delivered {
            metrics::counter!("gateway_dropped_deliveries_total", 1);
        }
        delivered
    }
}

/// Wire shape on the pub/sub plane.
#[derive(Debug, Serialize, Deserialize)]
struct RoomFrame {
    event: ServerEvent,
}

pub struct RoomBroker {
    store: Arc<dyn EphemeralStore>,
    sockets: Mutex<HashMap<String, SocketHandle>>,
    /// room → local socket ids
    rooms: Mutex<HashMap<String, HashSet<String>>>,
    /// user id → local socket ids
    users: Mutex<HashMap<String, HashSet<String>>>,
}

impl RoomBroker {
    pub fn new(store: Arc<dyn EphemeralStore>) -> Arc<Self> {
        Arc::new(Self {
            store,
            sockets: Mutex::new(HashMap::new()),
            rooms: Mutex::new(HashMap::new()),
            users: Mutex::new(HashMap::new()),
        })
    }

    /// Start the fan-out pump: everything published to `room:*` and `user:*`
    /// on any instance is delivered to this instance's local members.
    pub async fn run_fanout(self: &Arc<Self>) -> anyhow::Result<()> {
        let broker = self.clone();
        let mut room_sub = self.store.subscribe("room:*").await?;
        tokio::spawn(async move {
            while let Some(message) = room_sub.recv().await {
                let Some(room) = message.channel.strip_prefix("room:") else {
                    continue;
                };
                match serde_json::from_str::<RoomFrame>(&message.payload) {
                    Ok(frame) => broker.deliver_room(room, frame.event),
                    Err(e) => debug!(error = %e, "undecodable room frame"),
                }
            }
        });

        let broker = self.clone();
        let mut user_sub = self.store.subscribe("user:*").await?;
        tokio::spawn(async move {
            while let Some(message) = user_sub.recv().await {
                let Some(user_id) = message.channel.strip_prefix("user:") else {
                    continue;
                };
                match serde_json::from_str::<RoomFrame>(&message.payload) {
                    Ok(frame) => broker.deliver_user(user_id, frame.event),
                    Err(e) => debug!(error = %e, "undecodable user frame"),
                }
            }
        });
        Ok(())
    }

    pub fn register(&self, handle: SocketHandle) {
        self.users
            .lock()
            .entry(handle.user_id.clone())
            .or_default()
            .insert(handle.socket_id.clone());
        self.sockets.lock().insert(handle.socket_id.clone(), handle);
        metrics::increment_gauge!("gateway_active_connections", 1.0);
    }

    pub fn unregister(&self, socket_id: &str) {
        let removed = self.sockets.lock().remove(socket_id);
        if let Some(handle) = removed {
            let mut users = self.users.lock();
            if let Some(set) = users.get_mut(&handle.user_id) {
                set.remove(socket_id);
                if set.is_empty() {
                    users.remove(&handle.user_id);
                }
            }
            metrics::decrement_gauge!("gateway_active_connections", 1.0);
        }
        let mut rooms = self.rooms.lock();
        for members in rooms.values_mut() {
            members.remove(socket_id);
        }
        rooms.retain(|_, members| !members.is_empty());
    }

    pub fn socket_count(&self) -> usize {
        self.sockets.lock().len()
    }

    pub fn join(&self, room: &str, socket_id: &str) {
        self.rooms
            .lock()
            .entry(room.to_string())
            .or_default()
            .insert(socket_id.to_string());
    }

    pub fn leave(&self, room: &str, socket_id: &str) {
        let mut rooms = self.rooms.lock();
        if let Some(members) = rooms.get_mut(room) {
            members.remove(socket_id);
            if members.is_empty() {
                rooms.remove(room);
            }
        }
    }

    /// Publish to a room across all instances.
    pub async fn publish_room(&self, room: &str, event: ServerEvent) {
        let started = std::time::Instant::now();
        let frame = RoomFrame { event };
        let Ok(json) = serde_json::to_string(&frame) else {
            return;
        };
        if let Err(e) = self.store.publish(&format!("room:{room}"), &json).await {
            warn!(room, error = %e, "room publish failed");
        }
        metrics::histogram!("gateway_fanout_seconds", started.elapsed().as_secs_f64());
    }

    /// Deliver to every socket of one user across all instances.
    pub async fn publish_user(&self, user_id: &str, event: ServerEvent) {
        let frame = RoomFrame { event };
        let Ok(json) = serde_json::to_string(&frame) else {
            return;
        };
        if let Err(e) = self.store.publish(&format!("user:{user_id}"), &json).await {
            warn!(user = user_id, error = %e, "user publish failed");
        }
    }

    fn deliver_room(&self, room: &str, event: ServerEvent) {
        let member_ids: Vec<String> = self
            .rooms
            .lock()
            .get(room)
            .map(|members| members.iter().cloned().collect())
            .unwrap_or_default();
        if member_ids.is_empty() {
            return;
        }
        let sockets = self.sockets.lock();
        for socket_id in member_ids {
            if let Some(handle) = sockets.get(&socket_id) {
                handle.send(event.clone());
            }
        }
    }

    fn deliver_user(&self, user_id: &str, event: ServerEvent) {
        let socket_ids: Vec<String> = self
            .users
            .lock()
            .get(user_id)
            .map(|set| set.iter().cloned().collect())
            .unwrap_or_default();
        let sockets = self.sockets.lock();
        for socket_id in socket_ids {
            if let Some(handle) = sockets.get(&socket_id) {
                handle.send(event.clone());
            }
        }
    }
}
