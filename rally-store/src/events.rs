use async_trait::async_trait;
use rdkafka::config::ClientConfig;
use rdkafka::producer::{FutureProducer, FutureRecord};
use rdkafka::util::Timeout;
use std::time::Duration;
use tracing::{debug, error};

use rally_core::notify::SettlementNotifier;
use rally_shared::SettlementEvent;

/// Publishes settlement transitions to Kafka, keyed by unit id so every
/// event for one booking or package lands on the same partition.
#[derive(Clone)]
pub struct EventProducer {
    producer: FutureProducer,
    topic: String,
}

impl EventProducer {
    pub fn new(brokers: &str, topic: impl Into<String>) -> Result<Self, rdkafka::error::KafkaError> {
        let producer: FutureProducer = ClientConfig::new()
            .set("bootstrap.servers", brokers)
            .set("message.timeout.ms", "5000")
            .create()?;

        Ok(Self { producer, topic: topic.into() })
    }

    pub async fn publish(&self, key: &str, payload: &str) -> Result<(), rdkafka::error::KafkaError> {
        let record = FutureRecord::to(&self.topic).key(key).payload(payload);

        match self.producer.send(record, Timeout::After(Duration::from_secs(0))).await {
            Ok(delivery) => {
                debug!(
                    topic = %self.topic,
                    key,
                    partition = delivery.partition,
                    offset = delivery.offset,
                    "Settlement event delivered"
                );
                Ok(())
            }
            Err((e, _msg)) => {
                error!(topic = %self.topic, key, error = %e, "Failed to deliver settlement event");
                Err(e)
            }
        }
    }
}

#[async_trait]
impl SettlementNotifier for EventProducer {
    async fn notify(&self, event: &SettlementEvent) -> Result<(), String> {
        let payload = serde_json::to_string(event).map_err(|e| e.to_string())?;
        self.publish(&event.key().to_string(), &payload)
            .await
            .map_err(|e| e.to_string())
    }
}
