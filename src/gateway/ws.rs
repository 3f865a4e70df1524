//! Socket surface.
//!
//! JSON frames `{event, payload}` on three namespaces (`/ws/client`,
//! `/ws/porter`, `/ws/admin`), authenticated by a bearer token in the
//! handshake. Outbound frames flow through a per-socket mpsc, so per-socket
//! delivery order is preserved regardless of which room or component emitted.

use crate::auth::{Principal, Role};
use crate::gateway::rooms::SocketHandle;
use crate::gateway::state::GatewayState;
use crate::gateway::GatewayError;
use axum::{
    extract::ws::{Message, WebSocket, WebSocketUpgrade},
    extract::{Path, Query, State},
    response::Response,
    routing::get,
    Router,
};
use chrono::{DateTime, Utc};
use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Client → server frames.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event", content = "payload", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ClientEvent {
    #[serde(rename_all = "camelCase")]
    SubscribeOrder { order_id: String },
    #[serde(rename_all = "camelCase")]
    UnsubscribeOrder { order_id: String },
    LocationUpdate(LocationPayload),
    #[serde(rename_all = "camelCase")]
    JobOfferAccept { offer_id: String },
    #[serde(rename_all = "camelCase")]
    JobOfferReject { offer_id: String },
    #[serde(rename_all = "camelCase")]
    ChatMessageSend {
        order_id: String,
        content: String,
        temp_id: Option<String>,
    },
    #[serde(rename_all = "camelCase")]
    ChatTypingStart { order_id: String },
    #[serde(rename_all = "camelCase")]
    ChatTypingStop { order_id: String },
    #[serde(rename_all = "camelCase")]
    Heartbeat { timestamp: Option<DateTime<Utc>> },
    #[serde(rename_all = "camelCase")]
    Reconnect { reconnect_token: String },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LocationPayload {
    pub lat: f64,
    pub lng: f64,
    pub accuracy: f64,
    #[serde(default)]
    pub heading: Option<f64>,
    #[serde(default)]
    pub speed: Option<f64>,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub active_order_id: Option<String>,
}

/// Server → client frames.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event", content = "payload", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ServerEvent {
    #[serde(rename_all = "camelCase")]
    Authenticated {
        socket_id: String,
        user_id: String,
        role: Role,
    },
    #[serde(rename_all = "camelCase")]
    JobOfferReceived {
        offer_id: String,
        order_id: String,
        expires_at: DateTime<Utc>,
    },
    #[serde(rename_all = "camelCase")]
    LocationUpdated {
        porter_id: String,
        lat: f64,
        lng: f64,
        heading: Option<f64>,
        speed: Option<f64>,
        timestamp: DateTime<Utc>,
    },
    #[serde(rename_all = "camelCase")]
    OrderStatusChanged {
        order_id: String,
        status: String,
        occurred_at: DateTime<Utc>,
    },
    #[serde(rename_all = "camelCase")]
    OrderTimelineUpdated {
        order_id: String,
        entry: serde_json::Value,
        occurred_at: DateTime<Utc>,
    },
    #[serde(rename_all = "camelCase")]
    ChatMessageReceived {
        message_id: String,
        order_id: String,
        sender_id: String,
        sender_role: Role,
        content: String,
        timestamp: DateTime<Utc>,
        temp_id: Option<String>,
    },
    #[serde(rename_all = "camelCase")]
    ChatTyping {
        order_id: String,
        user_id: String,
        typing: bool,
    },
    #[serde(rename_all = "camelCase")]
    Subscribed { order_id: String },
    #[serde(rename_all = "camelCase")]
    Unsubscribed { order_id: String },
    #[serde(rename_all = "camelCase")]
    HeartbeatAck { timestamp: DateTime<Utc> },
    #[serde(rename_all = "camelCase")]
    PorterOnline { porter_id: String },
    #[serde(rename_all = "camelCase")]
    PorterOffline { porter_id: String },
    #[serde(rename_all = "camelCase")]
    DisconnectReason {
        reason: String,
        reconnect_token: Option<String>,
    },
    #[serde(rename_all = "camelCase")]
    Error { code: String, message: String },
}

impl ServerEvent {
    pub fn error(err: &GatewayError) -> Self {
        ServerEvent::Error {
            code: err.code().to_string(),
            message: err.to_string(),
        }
    }
}

pub fn router(state: GatewayState) -> Router {
    Router::new()
        .route("/ws/:namespace", get(ws_upgrade))
        .with_state(state)
}

async fn ws_upgrade(
    ws: WebSocketUpgrade,
    Path(namespace): Path<String>,
    Query(params): Query<HashMap<String, String>>,
    State(state): State<GatewayState>,
) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, namespace, params, state))
}

fn namespace_allows(namespace: &str, role: Role) -> bool {
    match namespace {
        // admins may observe any namespace
        "client" => matches!(role, Role::Customer | Role::Admin),
        "porter" => matches!(role, Role::Porter | Role::Admin),
        "admin" => matches!(role, Role::Admin),
        _ => false,
    }
}

async fn handle_socket(
    socket: WebSocket,
    namespace: String,
    params: HashMap<String, String>,
    state: GatewayState,
) {
    let (mut ws_tx, mut ws_rx) = socket.split();

    // handshake: verify the bearer token under either signing key
    let principal = params
        .get("token")
        .and_then(|token| state.verifier.verify(token).ok())
        .map(|(claims, _kind)| Principal::from(&claims));
    let Some(principal) = principal else {
        let frame = ServerEvent::error(&GatewayError::Unauthenticated);
        let _ = ws_tx
            .send(Message::Text(serde_json::to_string(&frame).unwrap_or_default()))
            .await;
        let _ = ws_tx.close().await;
        return;
    };
    if !namespace_allows(&namespace, principal.role) {
        let frame = ServerEvent::error(&GatewayError::Forbidden);
        let _ = ws_tx
            .send(Message::Text(serde_json::to_string(&frame).unwrap_or_default()))
            .await;
        let _ = ws_tx.close().await;
        return;
    }
    if state.broker.socket_count() >= state.config.max_connections {
        let frame = ServerEvent::error(&GatewayError::ConnectionLimit);
        let _ = ws_tx
            .send(Message::Text(serde_json::to_string(&frame).unwrap_or_default()))
            .await;
        let _ = ws_tx.close().await;
        return;
    }

    let socket_id = Uuid::new_v4().to_string();
    let (out_tx, mut out_rx) = mpsc::unbounded_channel::<ServerEvent>();
    let handle = SocketHandle::new(
        socket_id.clone(),
        principal.user_id.clone(),
        principal.role,
        out_tx,
    );

    if let Err(e) = state.sessions.connect(&handle).await {
        warn!(socket = %socket_id, error = %e, "session registration failed");
        let frame = ServerEvent::error(&GatewayError::Upstream(e.to_string()));
        let _ = ws_tx
            .send(Message::Text(serde_json::to_string(&frame).unwrap_or_default()))
            .await;
        let _ = ws_tx.close().await;
        return;
    }
    state.broker.register(handle.clone());
    handle.send(ServerEvent::Authenticated {
        socket_id: socket_id.clone(),
        user_id: principal.user_id.clone(),
        role: principal.role,
    });
    info!(socket = %socket_id, user = %principal.user_id, role = %principal.role, namespace = %namespace, "socket connected");

    // outbound pump: the single writer for this socket
    let ping_interval = Duration::from_secs(state.config.ping_interval_sec.max(5));
    let writer = tokio::spawn(async move {
        let mut ping = tokio::time::interval(ping_interval);
        ping.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                event = out_rx.recv() => {
                    let Some(event) = event else { break };
                    let Ok(json) = serde_json::to_string(&event) else { continue };
                    if ws_tx.send(Message::Text(json)).await.is_err() {
                        break;
                    }
                }
                _ = ping.tick() => {
                    if ws_tx.send(Message::Ping(Vec::new())).await.is_err() {
                        break;
                    }
                }
            }
        }
        let _ = ws_tx.close().await;
    });

    // inbound loop
    while let Some(message) = ws_rx.next().await {
        let message = match message {
            Ok(m) => m,
            Err(e) => {
                debug!(socket = %socket_id, error = %e, "socket read error");
                break;
            }
        };
        match message {
            Message::Text(text) => {
                match serde_json::from_str::<ClientEvent>(&text) {
                    Ok(event) => dispatch(&state, &handle, event).await,
                    Err(e) => {
                        debug!(socket = %socket_id, error = %e, "unparseable client frame");
                        handle.send(ServerEvent::error(&GatewayError::Validation(
                            "unrecognized frame".to_string(),
                        )));
                    }
                }
            }
            Message::Close(_) => break,
            // Ping is answered by axum automatically; Pong needs no action
            _ => {}
        }
    }

    // teardown: mint the reconnect token, drop registry entries, let the
    // departing client know (delivery is best-effort if it already left)
    let outcome = state.sessions.disconnect(&handle, "connection closed").await;
    state.broker.unregister(&socket_id);
    if let Ok(outcome) = outcome {
        handle.send(ServerEvent::DisconnectReason {
            reason: "connection closed".to_string(),
            reconnect_token: Some(outcome.reconnect_token),
        });
    }
    // dropping the last sender lets the writer drain the final frame and end
    drop(handle);
    let _ = tokio::time::timeout(Duration::from_secs(1), writer).await;
    info!(socket = %socket_id, user = %principal.user_id, "socket disconnected");
}

async fn dispatch(state: &GatewayState, socket: &SocketHandle, event: ClientEvent) {
    let result = match event {
        ClientEvent::SubscribeOrder { order_id } => {
            state.subscriptions.subscribe(socket, &order_id).await
        }
        ClientEvent::UnsubscribeOrder { order_id } => {
            state.subscriptions.unsubscribe(socket, &order_id).await
        }
        ClientEvent::LocationUpdate(payload) => state.location.handle_update(socket, payload).await,
        ClientEvent::JobOfferAccept { offer_id } => {
            state.offers.accept(&offer_id, socket).await
        }
        ClientEvent::JobOfferReject { offer_id } => {
            state.offers.reject(&offer_id, socket).await
        }
        ClientEvent::ChatMessageSend {
            order_id,
            content,
            temp_id,
        } => {
            state
                .chat
                .send_message(socket, &order_id, &content, temp_id)
                .await
        }
        ClientEvent::ChatTypingStart { order_id } => {
            state.chat.typing(socket, &order_id, true).await;
            Ok(())
        }
        ClientEvent::ChatTypingStop { order_id } => {
            state.chat.typing(socket, &order_id, false).await;
            Ok(())
        }
        ClientEvent::Heartbeat { .. } => match state.sessions.heartbeat(&socket.socket_id).await {
            Ok(timestamp) => {
                socket.send(ServerEvent::HeartbeatAck { timestamp });
                Ok(())
            }
            Err(e) => Err(e),
        },
        ClientEvent::Reconnect { reconnect_token } => {
            state.sessions.resume(socket, &reconnect_token).await
        }
    };
    if let Err(e) = result {
        debug!(socket = %socket.socket_id, code = e.code(), "client event rejected");
        socket.send(ServerEvent::error(&e));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_client_frame_wire_shape() {
        let frame: ClientEvent = serde_json::from_str(
            r#"{"event": "SUBSCRIBE_ORDER", "payload": {"orderId": "o-1"}}"#,
        )
        .unwrap();
        assert!(matches!(frame, ClientEvent::SubscribeOrder { ref order_id } if order_id == "o-1"));

        let frame: ClientEvent = serde_json::from_str(
            r#"{"event": "JOB_OFFER_ACCEPT", "payload": {"offerId": "f-1"}}"#,
        )
        .unwrap();
        assert!(matches!(frame, ClientEvent::JobOfferAccept { .. }));
    }

    #[test]
    fn test_server_frame_wire_shape() {
        let json = serde_json::to_value(ServerEvent::Subscribed {
            order_id: "o-1".to_string(),
        })
        .unwrap();
        assert_eq!(json["event"], "SUBSCRIBED");
        assert_eq!(json["payload"]["orderId"], "o-1");

        let json = serde_json::to_value(ServerEvent::error(&GatewayError::RateLimitExceeded))
            .unwrap();
        assert_eq!(json["event"], "ERROR");
        assert_eq!(json["payload"]["code"], "RATE_LIMIT_EXCEEDED");
    }

    #[test]
    fn test_namespace_role_matrix() {
        assert!(namespace_allows("client", Role::Customer));
        assert!(!namespace_allows("client", Role::Porter));
        assert!(namespace_allows("porter", Role::Porter));
        assert!(!namespace_allows("porter", Role::Customer));
        assert!(namespace_allows("admin", Role::Admin));
        assert!(!namespace_allows("admin", Role::Customer));
        assert!(namespace_allows("client", Role::Admin));
        assert!(!namespace_allows("bogus", Role::Admin));
    }

    #[test]
    fn test_location_payload_optional_fields() {
        let payload: LocationPayload = serde_json::from_str(
            r#"{"lat": 52.5, "lng": 13.4, "accuracy": 10.0, "timestamp": "2026-08-01T12:00:00Z"}"#,
        )
        .unwrap();
        assert!(payload.heading.is_none());
        assert!(payload.active_order_id.is_none());
    }
}
