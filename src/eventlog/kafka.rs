//! Kafka-backed event log.
//!
//! Producer: records keyed by correlation id, headers carrying the event type
//! and correlation id, bounded retries before surfacing a publish error.
//! Consumer: one `StreamConsumer` per subscription with manual offset
//! commits, so a record is only acknowledged after the handler chain
//! succeeded.

use crate::config::EventLogConfig;
use crate::eventlog::{EventLog, EventLogError, EventLogResult, EventSubscription};
use crate::events::EventEnvelope;
use async_trait::async_trait;
use rdkafka::consumer::{CommitMode, Consumer, StreamConsumer};
use rdkafka::message::{Headers, Message, OwnedHeaders};
use rdkafka::producer::{FutureProducer, FutureRecord, Producer};
use rdkafka::{ClientConfig, Offset, TopicPartitionList};
use std::time::Duration;
use tracing::{debug, warn};

const PUBLISH_TIMEOUT: Duration = Duration::from_secs(5);
const PUBLISH_ATTEMPTS: u32 = 3;

pub struct KafkaEventLog {
    producer: FutureProducer,
    config: EventLogConfig,
}

impl KafkaEventLog {
    pub fn new(config: &EventLogConfig) -> anyhow::Result<Self> {
        let producer: FutureProducer = ClientConfig::new()
            .set("bootstrap.servers", config.brokers.join(","))
            .set("client.id", &config.client_id)
            .set("message.timeout.ms", "5000")
            // retries handled by librdkafka with idempotence, so duplicate
            // sends do not reorder per-key delivery
            .set("enable.idempotence", "true")
            .create()?;
        Ok(Self {
            producer,
            config: config.clone(),
        })
    }
}

#[async_trait]
impl EventLog for KafkaEventLog {
    async fn publish(&self, envelope: &EventEnvelope) -> EventLogResult<()> {
        let payload = serde_json::to_vec(envelope)
            .map_err(|e| EventLogError::Decode(e.to_string()))?;
        let headers = OwnedHeaders::new()
            .insert(rdkafka::message::Header {
                key: "event_type",
                value: Some(envelope.type_name()),
            })
            .insert(rdkafka::message::Header {
                key: "correlation_id",
                value: Some(envelope.correlation_id.as_str()),
            });

        let mut last_err = None;
        for attempt in 0..PUBLISH_ATTEMPTS {
            if attempt > 0 {
                tokio::time::sleep(Duration::from_millis(100 * u64::from(attempt))).await;
            }
            let record = FutureRecord::to(envelope.topic())
                .key(&envelope.correlation_id)
                .payload(&payload)
                .headers(headers.clone());
            match self.producer.send(record, PUBLISH_TIMEOUT).await {
                Ok(_) => return Ok(()),
                Err((e, _)) => {
                    debug!(attempt, error = %e, topic = envelope.topic(), "publish failed");
                    last_err = Some(e);
                }
            }
        }
        Err(EventLogError::Publish(
            last_err.map(|e| e.to_string()).unwrap_or_default(),
        ))
    }

    async fn ready(&self) -> bool {
        let producer = self.producer.clone();
        tokio::task::spawn_blocking(move || {
            producer
                .client()
                .fetch_metadata(None, Duration::from_secs(2))
                .is_ok()
        })
        .await
        .unwrap_or(false)
    }

    async fn subscribe(
        &self,
        topics: &[&str],
        group: &str,
    ) -> EventLogResult<Box<dyn EventSubscription>> {
        let consumer: StreamConsumer = ClientConfig::new()
            .set("bootstrap.servers", self.config.brokers.join(","))
            .set("client.id", &self.config.client_id)
            .set("group.id", group)
            .set("enable.auto.commit", "false")
            .set("auto.offset.reset", "earliest")
            .set("session.timeout.ms", "6000")
            .create()
            .map_err(|e| EventLogError::Consume(e.to_string()))?;
        consumer
            .subscribe(topics)
            .map_err(|e| EventLogError::Consume(e.to_string()))?;
        Ok(Box::new(KafkaSubscription {
            consumer,
            pending: None,
        }))
    }
}

struct KafkaSubscription {
    consumer: StreamConsumer,
    /// (topic, partition, offset) of the last record handed out.
    pending: Option<(String, i32, i64)>,
}

#[async_trait]
impl EventSubscription for KafkaSubscription {
    async fn next(&mut self) -> EventLogResult<EventEnvelope> {
        loop {
            let message = self
                .consumer
                .recv()
                .await
                .map_err(|e| EventLogError::Consume(e.to_string()))?;

            let Some(payload) = message.payload() else {
                warn!(topic = message.topic(), "skipping record with empty payload");
                continue;
            };
            match serde_json::from_slice::<EventEnvelope>(payload) {
                Ok(envelope) => {
                    self.pending = Some((
                        message.topic().to_string(),
                        message.partition(),
                        message.offset(),
                    ));
                    return Ok(envelope);
                }
                Err(e) => {
                    // malformed records are counted and skipped; replaying
                    // them forever would wedge the partition
                    metrics::counter!("events_decode_failures_total", 1);
                    let event_type = message.headers().and_then(|h| {
                        h.iter()
                            .find(|header| header.key == "event_type")
                            .and_then(|header| header.value)
                            .map(|v| String::from_utf8_lossy(v).to_string())
                    });
                    warn!(
                        topic = message.topic(),
                        offset = message.offset(),
                        event_type = event_type.as_deref().unwrap_or("unknown"),
                        error = %e,
                        "skipping undecodable record"
                    );
                    continue;
                }
            }
        }
    }

    async fn commit(&mut self) -> EventLogResult<()> {
        let Some((topic, partition, offset)) = self.pending.take() else {
            return Ok(());
        };
        let mut list = TopicPartitionList::new();
        list.add_partition_offset(&topic, partition, Offset::Offset(offset + 1))
            .map_err(|e| EventLogError::Consume(e.to_string()))?;
        self.consumer
            .commit(&list, CommitMode::Async)
            .map_err(|e| EventLogError::Consume(e.to_string()))?;
        Ok(())
    }
}
