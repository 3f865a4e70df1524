//! Chat relay.
//!
//! Per-order messaging room with typing indicators. Messages are persisted by
//! emitting `ChatMessageSent` to the event log and broadcast to the room with
//! the sender's `tempId` echoed so optimistic UIs can reconcile. Typing
//! indicators are best-effort and never persisted.

use crate::eventlog::{publish_event, EventLog};
use crate::events::{DomainEvent, EventEnvelope};
use crate::gateway::rate_limit::UserRateLimiter;
use crate::gateway::rooms::SocketHandle;
use crate::gateway::subscriptions::SubscriptionRouter;
use crate::gateway::ws::ServerEvent;
use crate::gateway::GatewayError;
use crate::config::GatewayConfig;
use chrono::Utc;
use std::sync::Arc;
use tracing::{debug, warn};
use uuid::Uuid;

const MAX_CONTENT_LEN: usize = 5000;

pub struct ChatRelay {
    log: Arc<dyn EventLog>,
    subscriptions: Arc<SubscriptionRouter>,
    limiter: UserRateLimiter,
}

impl ChatRelay {
    pub fn new(
        log: Arc<dyn EventLog>,
        subscriptions: Arc<SubscriptionRouter>,
        config: &GatewayConfig,
    ) -> Self {
        Self {
            log,
            subscriptions,
            limiter: UserRateLimiter::new(config.rate_limit.chat),
        }
    }

    pub async fn send_message(
        &self,
        socket: &SocketHandle,
        order_id: &str,
        content: &str,
        temp_id: Option<String>,
    ) -> Result<(), GatewayError> {
        if !self.limiter.check(&socket.user_id) {
            metrics::counter!("gateway_rate_limited_total", 1, "class" => "chat");
            return Err(GatewayError::RateLimitExceeded);
        }
        let trimmed = content.trim();
        if trimmed.is_empty() {
            return Err(GatewayError::Validation("message is empty".into()));
        }
        if content.len() > MAX_CONTENT_LEN {
            return Err(GatewayError::Validation(format!(
                "message exceeds {MAX_CONTENT_LEN} characters"
            )));
        }
        if !self
            .subscriptions
            .is_subscriber(&socket.user_id, order_id)
            .await?
        {
            return Err(GatewayError::NotSubscriber);
        }

        let message_id = Uuid::new_v4().to_string();
        let timestamp = Utc::now();

        // persistence rides the event log
        let envelope = EventEnvelope::new(
            DomainEvent::ChatMessageSent {
                message_id: message_id.clone(),
                order_id: order_id.to_string(),
                sender_id: socket.user_id.clone(),
                sender_role: socket.role.as_str().to_string(),
                content: content.to_string(),
                timestamp,
            },
            order_id,
        );
        if let Err(e) = publish_event(self.log.as_ref(), &envelope).await {
            warn!(order = order_id, error = %e, "chat persistence publish failed");
            return Err(GatewayError::Upstream(e.to_string()));
        }

        self.subscriptions
            .broadcast(
                order_id,
                ServerEvent::ChatMessageReceived {
                    message_id,
                    order_id: order_id.to_string(),
                    sender_id: socket.user_id.clone(),
                    sender_role: socket.role,
                    content: content.to_string(),
                    timestamp,
                    temp_id,
                },
            )
            .await;
        metrics::counter!("gateway_chat_messages_total", 1);
        Ok(())
    }

    /// Typing indicators: broadcast best-effort, validation failures are
    /// silently dropped.
    pub async fn typing(&self, socket: &SocketHandle, order_id: &str, typing: bool) {
        match self
            .subscriptions
            .is_subscriber(&socket.user_id, order_id)
            .await
        {
            Ok(true) => {
                self.subscriptions
                    .broadcast(
                        order_id,
                        ServerEvent::ChatTyping {
                            order_id: order_id.to_string(),
                            user_id: socket.user_id.clone(),
                            typing,
                        },
                    )
                    .await;
            }
            Ok(false) => debug!(order = order_id, "typing from non-subscriber dropped"),
            Err(e) => debug!(order = order_id, error = %e, "typing check failed; dropped"),
        }
    }

    pub fn cleanup(&self) {
        self.limiter.cleanup();
    }
}
