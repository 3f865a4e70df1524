//! Event log client.
//!
//! Typed publish/subscribe over a partitioned, ordered, durable log. Records
//! are keyed by correlation id, so per-operation ordering holds. Consumer
//! groups give at-least-once delivery: the offset is committed only after the
//! handler returns Ok, and a failed handler sees the record again.

pub mod kafka;
pub mod memory;

pub use kafka::KafkaEventLog;
pub use memory::MemoryEventLog;

use crate::events::EventEnvelope;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, warn};

pub type EventLogResult<T> = Result<T, EventLogError>;

#[derive(Debug, thiserror::Error)]
pub enum EventLogError {
    #[error("event log publish failed: {0}")]
    Publish(String),
    #[error("event log consume failed: {0}")]
    Consume(String),
    #[error("event payload could not be decoded: {0}")]
    Decode(String),
}

/// One consumer-group subscription. `next` yields envelopes in per-key
/// publication order; `commit` acknowledges everything yielded so far.
#[async_trait]
pub trait EventSubscription: Send {
    async fn next(&mut self) -> EventLogResult<EventEnvelope>;
    async fn commit(&mut self) -> EventLogResult<()>;
}

#[async_trait]
pub trait EventLog: Send + Sync {
    /// Publish to the envelope's topic, keyed by correlation id.
    async fn publish(&self, envelope: &EventEnvelope) -> EventLogResult<()>;

    async fn subscribe(
        &self,
        topics: &[&str],
        group: &str,
    ) -> EventLogResult<Box<dyn EventSubscription>>;

    /// Readiness probe for `/ready`.
    async fn ready(&self) -> bool {
        true
    }
}

/// Publishes an envelope and records the per-type counter.
pub async fn publish_event(log: &dyn EventLog, envelope: &EventEnvelope) -> EventLogResult<()> {
    log.publish(envelope).await?;
    metrics::counter!(
        "events_published_total",
        1,
        "type" => envelope.type_name()
    );
    Ok(())
}

/// A handler declares the event types it consumes.
#[async_trait]
pub trait EventHandler: Send + Sync {
    fn event_types(&self) -> Vec<&'static str>;
    async fn handle(&self, envelope: &EventEnvelope) -> anyhow::Result<()>;
}

/// Dispatch registry keyed on event type. Unknown types are counted and
/// discarded rather than treated as errors.
#[derive(Default)]
pub struct EventRouter {
    handlers: HashMap<&'static str, Vec<Arc<dyn EventHandler>>>,
}

impl EventRouter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, handler: Arc<dyn EventHandler>) {
        for event_type in handler.event_types() {
            self.handlers
                .entry(event_type)
                .or_default()
                .push(handler.clone());
        }
    }

    pub async fn dispatch(&self, envelope: &EventEnvelope) -> anyhow::Result<()> {
        let Some(handlers) = self.handlers.get(envelope.type_name()) else {
            metrics::counter!(
                "events_unknown_total",
                1,
                "type" => envelope.type_name()
            );
            return Ok(());
        };
        for handler in handlers {
            handler.handle(envelope).await?;
        }
        metrics::counter!(
            "events_consumed_total",
            1,
            "type" => envelope.type_name()
        );
        Ok(())
    }
}

const HANDLER_MAX_ATTEMPTS: u32 = 5;

/// Consumer-group loop: pull, dispatch, commit on success. A failing handler
/// sees the record redelivered with backoff; after `HANDLER_MAX_ATTEMPTS` the
/// record is dead-lettered (counted and skipped) so one poison record cannot
/// wedge the group.
pub async fn run_consumer(
    log: Arc<dyn EventLog>,
    topics: Vec<&'static str>,
    group: String,
    router: Arc<EventRouter>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut subscription = loop {
        match log.subscribe(&topics, &group).await {
            Ok(sub) => break sub,
            Err(e) => {
                warn!(group = %group, error = %e, "event log subscribe failed; retrying");
                tokio::time::sleep(Duration::from_secs(1)).await;
            }
        }
        if *shutdown.borrow() {
            return;
        }
    };

    loop {
        let envelope = tokio::select! {
            _ = shutdown.changed() => {
                if *shutdown.borrow() { return; }
                continue;
            }
            next = subscription.next() => match next {
                Ok(envelope) => envelope,
                Err(e) => {
                    warn!(group = %group, error = %e, "event consume failed; backing off");
                    tokio::time::sleep(Duration::from_secs(1)).await;
                    continue;
                }
            },
        };

        let mut delivered = false;
        for attempt in 1..=HANDLER_MAX_ATTEMPTS {
            match router.dispatch(&envelope).await {
                Ok(()) => {
                    delivered = true;
                    break;
                }
                Err(e) => {
                    warn!(
                        group = %group,
                        event_type = envelope.type_name(),
                        correlation_id = %envelope.correlation_id,
                        attempt,
                        error = %e,
                        "event handler failed; redelivering"
                    );
                    tokio::time::sleep(Duration::from_millis(100 * u64::from(attempt))).await;
                }
            }
            if *shutdown.borrow() {
                return;
            }
        }
        if !delivered {
            metrics::counter!(
                "events_dead_lettered_total",
                1,
                "type" => envelope.type_name()
            );
            warn!(
                event_type = envelope.type_name(),
                correlation_id = %envelope.correlation_id,
                "event dead-lettered after repeated handler failures"
            );
        }

        if let Err(e) = subscription.commit().await {
            debug!(group = %group, error = %e, "offset commit failed");
        }
    }
}
