//! Realtime gateway.
//!
//! Stateful WebSocket fan-out: authenticates clients, tracks per-user socket
//! membership across horizontally-scaled instances, delivers job offers with
//! server-enforced expiry, fans porter locations to order subscribers, and
//! brokers chat and order-status events. Instances share nothing in-process;
//! the ephemeral store carries sessions, subscriptions, and the pub/sub plane.

pub mod chat;
pub mod consumer;
pub mod location;
pub mod offers;
pub mod rate_limit;
pub mod rooms;
pub mod session;
pub mod state;
pub mod subscriptions;
pub mod ws;

pub use rooms::{RoomBroker, SocketHandle};
pub use session::SessionRegistry;
pub use state::GatewayState;

use crate::store::StoreError;

#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    #[error("authentication failed")]
    Unauthenticated,
    #[error("operation not permitted")]
    Forbidden,
    #[error("not subscribed to this order")]
    NotSubscriber,
    #[error("rate limit exceeded")]
    RateLimitExceeded,
    #[error("{0}")]
    Validation(String),
    #[error("job offer not found")]
    OfferNotFound,
    #[error("job offer already processed")]
    OfferAlreadyProcessed,
    #[error("job offer has expired")]
    OfferExpired,
    #[error("connection limit reached")]
    ConnectionLimit,
    #[error("reconnect token invalid or already used")]
    ReconnectInvalid,
    #[error("upstream dependency unavailable: {0}")]
    Upstream(String),
}

impl GatewayError {
    pub fn code(&self) -> &'static str {
        match self {
            GatewayError::Unauthenticated => "UNAUTHENTICATED",
            GatewayError::Forbidden => "FORBIDDEN",
            GatewayError::NotSubscriber => "NOT_SUBSCRIBER",
            GatewayError::RateLimitExceeded => "RATE_LIMIT_EXCEEDED",
            GatewayError::Validation(_) => "VALIDATION",
            GatewayError::OfferNotFound => "OFFER_NOT_FOUND",
            GatewayError::OfferAlreadyProcessed => "OFFER_ALREADY_PROCESSED",
            GatewayError::OfferExpired => "OFFER_EXPIRED",
            GatewayError::ConnectionLimit => "CONNECTION_LIMIT",
            GatewayError::ReconnectInvalid => "RECONNECT_INVALID",
            GatewayError::Upstream(_) => "UPSTREAM_UNAVAILABLE",
        }
    }
}

impl From<StoreError> for GatewayError {
    fn from(value: StoreError) -> Self {
        GatewayError::Upstream(value.to_string())
    }
}
