//! In-memory event log.
//!
//! Single-process stand-in with the same semantics the services rely on:
//! publication order per topic, consumer-group offsets advanced on commit,
//! and redelivery of uncommitted records to a re-subscribing group. Tests
//! also use it to inject external events and assert on emissions.

use crate::eventlog::{EventLog, EventLogResult, EventSubscription};
use crate::events::EventEnvelope;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Notify;

#[derive(Default)]
struct LogInner {
    /// Global append sequence: (topic, envelope).
    records: Vec<(String, EventEnvelope)>,
    /// Committed position per consumer group (index into `records`).
    group_offsets: HashMap<String, usize>,
}

pub struct MemoryEventLog {
    inner: Arc<Mutex<LogInner>>,
    notify: Arc<Notify>,
}

impl Default for MemoryEventLog {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryEventLog {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(LogInner::default())),
            notify: Arc::new(Notify::new()),
        }
    }

    /// Everything published to `topic`, in order. Test helper.
    pub fn published(&self, topic: &str) -> Vec<EventEnvelope> {
        self.inner
            .lock()
            .records
            .iter()
            .filter(|(t, _)| t == topic)
            .map(|(_, e)| e.clone())
            .collect()
    }

    /// Everything published to `topic` under one correlation id, in order.
    pub fn published_for(&self, topic: &str, correlation_id: &str) -> Vec<EventEnvelope> {
        self.published(topic)
            .into_iter()
            .filter(|e| e.correlation_id == correlation_id)
            .collect()
    }

    /// Count of records of a given event type on `topic`. Test helper.
    pub fn count_of(&self, topic: &str, event_type: &str) -> usize {
        self.published(topic)
            .iter()
            .filter(|e| e.type_name() == event_type)
            .count()
    }
}

#[async_trait]
impl EventLog for MemoryEventLog {
    async fn publish(&self, envelope: &EventEnvelope) -> EventLogResult<()> {
        {
            let mut inner = self.inner.lock();
            inner
                .records
                .push((envelope.topic().to_string(), envelope.clone()));
        }
        self.notify.notify_waiters();
        Ok(())
    }

    async fn subscribe(
        &self,
        topics: &[&str],
        group: &str,
    ) -> EventLogResult<Box<dyn EventSubscription>> {
        let position = {
            let inner = self.inner.lock();
            inner.group_offsets.get(group).copied().unwrap_or(0)
        };
        Ok(Box::new(MemorySubscription {
            inner: self.inner.clone(),
            notify: self.notify.clone(),
            topics: topics.iter().map(|t| t.to_string()).collect(),
            group: group.to_string(),
            position,
            pending: None,
        }))
    }
}

struct MemorySubscription {
    inner: Arc<Mutex<LogInner>>,
    notify: Arc<Notify>,
    topics: Vec<String>,
    group: String,
    /// Next global index to scan from.
    position: usize,
    /// Position to commit once the current record is acknowledged.
    pending: Option<usize>,
}

#[async_trait]
impl EventSubscription for MemorySubscription {
    async fn next(&mut self) -> EventLogResult<EventEnvelope> {
        loop {
            let notified = self.notify.notified();
            {
                let inner = self.inner.lock();
                for idx in self.position..inner.records.len() {
                    let (topic, envelope) = &inner.records[idx];
                    if self.topics.iter().any(|t| t == topic) {
                        self.position = idx + 1;
                        self.pending = Some(idx + 1);
                        return Ok(envelope.clone());
                    }
                    // records for other topics are skipped, not redelivered
                    self.position = idx + 1;
                }
            }
            // the timeout covers a publish racing between the scan above and
            // the first poll of `notified`
            let _ = tokio::time::timeout(std::time::Duration::from_millis(25), notified).await;
        }
    }

    async fn commit(&mut self) -> EventLogResult<()> {
        if let Some(pending) = self.pending.take() {
            let mut inner = self.inner.lock();
            let offset = inner.group_offsets.entry(self.group.clone()).or_insert(0);
            if pending > *offset {
                *offset = pending;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::{topics, DomainEvent};

    fn placed(bid: &str, corr: &str) -> EventEnvelope {
        EventEnvelope::new(
            DomainEvent::BidPlaced {
                bid_id: bid.into(),
                window_id: "w-1".into(),
                porter_id: "p-1".into(),
                amount_cents: 1000,
                eta_minutes: 10,
                placed_at: chrono::Utc::now(),
            },
            corr,
        )
    }

    #[tokio::test]
    async fn test_publish_then_consume_in_order() {
        let log = MemoryEventLog::new();
        log.publish(&placed("b-1", "c-1")).await.unwrap();
        log.publish(&placed("b-2", "c-1")).await.unwrap();

        let mut sub = log.subscribe(&[topics::BIDDING], "g1").await.unwrap();
        let first = sub.next().await.unwrap();
        sub.commit().await.unwrap();
        let second = sub.next().await.unwrap();
        sub.commit().await.unwrap();

        match (first.event, second.event) {
            (
                DomainEvent::BidPlaced { bid_id: a, .. },
                DomainEvent::BidPlaced { bid_id: b, .. },
            ) => {
                assert_eq!(a, "b-1");
                assert_eq!(b, "b-2");
            }
            _ => panic!("unexpected events"),
        }
    }

    #[tokio::test]
    async fn test_uncommitted_records_redeliver_to_group() {
        let log = MemoryEventLog::new();
        log.publish(&placed("b-1", "c-1")).await.unwrap();

        {
            let mut sub = log.subscribe(&[topics::BIDDING], "g1").await.unwrap();
            let _ = sub.next().await.unwrap();
            // dropped without commit
        }

        let mut sub = log.subscribe(&[topics::BIDDING], "g1").await.unwrap();
        let redelivered = sub.next().await.unwrap();
        match redelivered.event {
            DomainEvent::BidPlaced { bid_id, .. } => assert_eq!(bid_id, "b-1"),
            _ => panic!("unexpected event"),
        }
    }

    #[tokio::test]
    async fn test_subscriber_wakes_on_late_publish() {
        let log = Arc::new(MemoryEventLog::new());
        let mut sub = log.subscribe(&[topics::BIDDING], "g1").await.unwrap();

        let publisher = log.clone();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(std::time::Duration::from_millis(20)).await;
            publisher.publish(&placed("b-late", "c-9")).await.unwrap();
        });

        let got = sub.next().await.unwrap();
        assert_eq!(got.correlation_id, "c-9");
        handle.await.unwrap();
    }
}
