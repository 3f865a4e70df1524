//! Domain events.
//!
//! Every record on the event log is an [`EventEnvelope`]: a typed payload plus
//! the timestamp and correlation id that thread a logical operation across
//! services. Envelopes are keyed by correlation id on the log, which gives
//! per-operation ordering.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Topic per event family.
pub mod topics {
    pub const BIDDING: &str = "porterhub.bidding";
    pub const OFFERS: &str = "porterhub.offers";
    pub const ORDERS: &str = "porterhub.orders";
    pub const PORTERS: &str = "porterhub.porters";
    pub const LOCATIONS: &str = "porterhub.locations";
    pub const CHAT: &str = "porterhub.chat";

    /// All topics the gateway consumes.
    pub const GATEWAY_INBOUND: &[&str] = &[OFFERS, ORDERS];
    /// All topics the bidding reactor consumes.
    pub const BIDDING_INBOUND: &[&str] = &[ORDERS, PORTERS];
}

/// Terminal outcome recorded on `BidClosed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WindowOutcome {
    WinnerSelected,
    Expired,
    Cancelled,
    NoBids,
}

/// Window configuration snapshot carried on `BidWindowOpened`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WindowConfigPayload {
    pub minimum_bid_cents: i64,
    pub reserve_price_cents: Option<i64>,
    pub max_bids_per_porter: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload")]
pub enum DomainEvent {
    #[serde(rename_all = "camelCase")]
    BidWindowOpened {
        window_id: String,
        order_ids: Vec<String>,
        expires_at: DateTime<Utc>,
        strategy_id: String,
        configuration: WindowConfigPayload,
    },
    #[serde(rename_all = "camelCase")]
    BidPlaced {
        bid_id: String,
        window_id: String,
        porter_id: String,
        amount_cents: i64,
        eta_minutes: i64,
        placed_at: DateTime<Utc>,
    },
    #[serde(rename_all = "camelCase")]
    BidAccepted {
        bid_id: String,
        window_id: String,
        porter_id: String,
        amount_cents: i64,
        accepted_at: DateTime<Utc>,
        accepted_by: String,
    },
    /// Dispatcher-facing enrichment, emitted exactly once per window.
    #[serde(rename_all = "camelCase")]
    BidWinnerSelected {
        window_id: String,
        bid_id: String,
        order_ids: Vec<String>,
        winner_porter_id: String,
        winning_amount_cents: i64,
    },
    #[serde(rename_all = "camelCase")]
    BidCancelled {
        bid_id: String,
        window_id: String,
        porter_id: String,
        reason: String,
    },
    #[serde(rename_all = "camelCase")]
    BidExpired {
        window_id: String,
        order_ids: Vec<String>,
        total_bids: u64,
        expired_at: DateTime<Utc>,
    },
    #[serde(rename_all = "camelCase")]
    BidClosed {
        window_id: String,
        order_ids: Vec<String>,
        outcome: WindowOutcome,
    },

    #[serde(rename_all = "camelCase")]
    JobOfferCreated {
        offer_id: String,
        order_id: String,
        porter_id: String,
        expires_at: DateTime<Utc>,
    },
    #[serde(rename_all = "camelCase")]
    JobOfferAccepted {
        offer_id: String,
        order_id: String,
        porter_id: String,
        timestamp: DateTime<Utc>,
    },
    #[serde(rename_all = "camelCase")]
    JobOfferRejected {
        offer_id: String,
        order_id: String,
        porter_id: String,
        timestamp: DateTime<Utc>,
    },
    #[serde(rename_all = "camelCase")]
    JobOfferExpired {
        offer_id: String,
        order_id: String,
        porter_id: String,
        timestamp: DateTime<Utc>,
    },

    #[serde(rename_all = "camelCase")]
    OrderCreated {
        order_id: String,
        user_id: String,
    },
    #[serde(rename_all = "camelCase")]
    OrderConfirmed {
        order_id: String,
        user_id: String,
    },
    #[serde(rename_all = "camelCase")]
    OrderAssigned {
        order_id: String,
        porter_id: String,
        user_id: String,
    },
    #[serde(rename_all = "camelCase")]
    OrderStarted {
        order_id: String,
        porter_id: String,
        user_id: String,
    },
    #[serde(rename_all = "camelCase")]
    OrderCompleted {
        order_id: String,
        porter_id: String,
        user_id: String,
    },
    #[serde(rename_all = "camelCase")]
    OrderCancelled {
        order_id: String,
        user_id: String,
        reason: Option<String>,
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
    PorterSuspended {
        porter_id: String,
        reason: String,
    },
    #[serde(rename_all = "camelCase")]
    PorterLocationUpdated {
        porter_id: String,
        lat: f64,
        lng: f64,
        timestamp: DateTime<Utc>,
    },

    #[serde(rename_all = "camelCase")]
    ChatMessageSent {
        message_id: String,
        order_id: String,
        sender_id: String,
        sender_role: String,
        content: String,
        timestamp: DateTime<Utc>,
    },
}

impl DomainEvent {
    /// Stable name carried in record headers and metrics labels.
    pub fn type_name(&self) -> &'static str {
        match self {
            DomainEvent::BidWindowOpened { .. } => "BidWindowOpened",
            DomainEvent::BidPlaced { .. } => "BidPlaced",
            DomainEvent::BidAccepted { .. } => "BidAccepted",
            DomainEvent::BidWinnerSelected { .. } => "BidWinnerSelected",
            DomainEvent::BidCancelled { .. } => "BidCancelled",
            DomainEvent::BidExpired { .. } => "BidExpired",
            DomainEvent::BidClosed { .. } => "BidClosed",
            DomainEvent::JobOfferCreated { .. } => "JobOfferCreated",
            DomainEvent::JobOfferAccepted { .. } => "JobOfferAccepted",
            DomainEvent::JobOfferRejected { .. } => "JobOfferRejected",
            DomainEvent::JobOfferExpired { .. } => "JobOfferExpired",
            DomainEvent::OrderCreated { .. } => "OrderCreated",
            DomainEvent::OrderConfirmed { .. } => "OrderConfirmed",
            DomainEvent::OrderAssigned { .. } => "OrderAssigned",
            DomainEvent::OrderStarted { .. } => "OrderStarted",
            DomainEvent::OrderCompleted { .. } => "OrderCompleted",
            DomainEvent::OrderCancelled { .. } => "OrderCancelled",
            DomainEvent::OrderStatusChanged { .. } => "OrderStatusChanged",
            DomainEvent::OrderTimelineUpdated { .. } => "OrderTimelineUpdated",
            DomainEvent::PorterSuspended { .. } => "PorterSuspended",
            DomainEvent::PorterLocationUpdated { .. } => "PorterLocationUpdated",
            DomainEvent::ChatMessageSent { .. } => "ChatMessageSent",
        }
    }

    /// Topic this event is published to.
    pub fn topic(&self) -> &'static str {
        match self {
            DomainEvent::BidWindowOpened { .. }
            | DomainEvent::BidPlaced { .. }
            | DomainEvent::BidAccepted { .. }
            | DomainEvent::BidWinnerSelected { .. }
            | DomainEvent::BidCancelled { .. }
            | DomainEvent::BidExpired { .. }
            | DomainEvent::BidClosed { .. } => topics::BIDDING,
            DomainEvent::JobOfferCreated { .. }
            | DomainEvent::JobOfferAccepted { .. }
            | DomainEvent::JobOfferRejected { .. }
            | DomainEvent::JobOfferExpired { .. } => topics::OFFERS,
            DomainEvent::OrderCreated { .. }
            | DomainEvent::OrderConfirmed { .. }
            | DomainEvent::OrderAssigned { .. }
            | DomainEvent::OrderStarted { .. }
            | DomainEvent::OrderCompleted { .. }
            | DomainEvent::OrderCancelled { .. }
            | DomainEvent::OrderStatusChanged { .. }
            | DomainEvent::OrderTimelineUpdated { .. } => topics::ORDERS,
            DomainEvent::PorterSuspended { .. } => topics::PORTERS,
            DomainEvent::PorterLocationUpdated { .. } => topics::LOCATIONS,
            DomainEvent::ChatMessageSent { .. } => topics::CHAT,
        }
    }
}

/// The record shape on the wire.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventEnvelope {
    #[serde(flatten)]
    pub event: DomainEvent,
    pub timestamp: DateTime<Utc>,
    pub correlation_id: String,
}

impl EventEnvelope {
    pub fn new(event: DomainEvent, correlation_id: impl Into<String>) -> Self {
        Self {
            event,
            timestamp: Utc::now(),
            correlation_id: correlation_id.into(),
        }
    }

    pub fn type_name(&self) -> &'static str {
        self.event.type_name()
    }

    pub fn topic(&self) -> &'static str {
        self.event.topic()
    }
}
