//! rdkafka implementation of [`BrokerClient`].
//!
//! Metadata and watermark queries go through one shared `BaseConsumer`, run on the blocking
//! pool. Every partition stream gets its own assign-only `StreamConsumer` (no consumer group
//! coordination, no offset commits), pumped into the stream's channels by a task.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use rdkafka::config::ClientConfig;
use rdkafka::consumer::{BaseConsumer, Consumer, StreamConsumer};
use rdkafka::error::KafkaError;
use rdkafka::types::RDKafkaErrorCode;
use rdkafka::{Offset, TopicPartitionList};
use tracing::{debug, warn};

use crate::error::BrokerError;
use crate::kafka::broker::{BrokerClient, PartitionFeed, RawPartitionStream};
use crate::kafka::types::{KafkaMessage, OffsetPosition, OFFSET_NEWEST, OFFSET_OLDEST};

pub struct KafkaBrokerClient {
    config: ClientConfig,
    metadata: Arc<BaseConsumer>,
    timeout: Duration,
}

impl KafkaBrokerClient {
    /// `config` must not rely on a consumer group: partitions are assigned manually.
    /// `timeout` bounds every metadata and watermark request.
    pub fn new(config: ClientConfig, timeout: Duration) -> Result<Self, BrokerError> {
        let metadata: BaseConsumer = config
            .create()
            .map_err(|e| BrokerError::kafka("create_consumer", e))?;

        Ok(Self {
            config,
            metadata: Arc::new(metadata),
            timeout,
        })
    }

    /// Run a blocking librdkafka call against the shared metadata consumer
    async fn blocking<T, F>(&self, operation: &'static str, call: F) -> Result<T, BrokerError>
    where
        T: Send + 'static,
        F: FnOnce(&BaseConsumer, Duration) -> Result<T, BrokerError> + Send + 'static,
    {
        let consumer = self.metadata.clone();
        let timeout = self.timeout;

        match tokio::task::spawn_blocking(move || call(&consumer, timeout)).await {
            Ok(result) => result,
            Err(e) => Err(BrokerError::TaskFailed(format!("{operation}: {e}"))),
        }
    }
}

#[async_trait]
impl BrokerClient for KafkaBrokerClient {
    async fn partitions(&self, topic: &str) -> Result<Vec<i32>, BrokerError> {
        let topic = topic.to_string();
        self.blocking("fetch_metadata", move |consumer, timeout| {
            let metadata = consumer
                .fetch_metadata(Some(&topic), timeout)
                .map_err(|e| BrokerError::kafka("fetch_metadata", e))?;

            let topic_metadata = metadata
                .topics()
                .iter()
                .find(|t| t.name() == topic)
                .ok_or_else(|| BrokerError::UnknownTopic {
                    topic: topic.clone(),
                })?;

            if let Some(code) = topic_metadata.error() {
                let code = RDKafkaErrorCode::from(code);
                if code == RDKafkaErrorCode::UnknownTopicOrPartition {
                    return Err(BrokerError::UnknownTopic { topic });
                }
                return Err(BrokerError::Metadata {
                    topic,
                    reason: code.to_string(),
                });
            }

            Ok(topic_metadata.partitions().iter().map(|p| p.id()).collect())
        })
        .await
    }

    async fn consume_partition(
        &self,
        topic: &str,
        partition: i32,
        start_offset: i64,
        buffer: usize,
    ) -> Result<RawPartitionStream, BrokerError> {
        let (low, high) = self.watermarks(topic, partition).await?;
        let offset = start_position(topic, partition, start_offset, low, high)?;

        let consumer: StreamConsumer = self
            .config
            .create()
            .map_err(|e| BrokerError::kafka("create_consumer", e))?;

        let mut assignment = TopicPartitionList::new();
        assignment
            .add_partition_offset(topic, partition, offset)
            .map_err(|e| BrokerError::kafka("add_partition_offset", e))?;
        consumer
            .assign(&assignment)
            .map_err(|e| BrokerError::kafka("assign", e))?;

        debug!(
            topic,
            partition,
            start_offset,
            low_watermark = low,
            high_watermark = high,
            "Opened partition stream"
        );

        let topic = topic.to_string();
        Ok(RawPartitionStream::spawn(buffer, move |feed| {
            pump(consumer, topic, partition, feed)
        }))
    }

    async fn get_offset(
        &self,
        topic: &str,
        partition: i32,
        position: OffsetPosition,
    ) -> Result<i64, BrokerError> {
        let (low, high) = self.watermarks(topic, partition).await?;
        Ok(match position {
            OffsetPosition::Oldest => low,
            OffsetPosition::Newest => high,
        })
    }

    async fn watermarks(&self, topic: &str, partition: i32) -> Result<(i64, i64), BrokerError> {
        let topic = topic.to_string();
        self.blocking("fetch_watermarks", move |consumer, timeout| {
            consumer
                .fetch_watermarks(&topic, partition, timeout)
                .map_err(|e| watermark_error(&topic, partition, e))
        })
        .await
    }
}

/// Map a start offset (explicit or sentinel) onto an rdkafka `Offset`, given the current
/// watermarks. Offsets below the low watermark were deleted by retention and start at the
/// oldest retained message instead.
fn start_position(
    topic: &str,
    partition: i32,
    start_offset: i64,
    low: i64,
    high: i64,
) -> Result<Offset, BrokerError> {
    match start_offset {
        OFFSET_OLDEST => Ok(Offset::Beginning),
        OFFSET_NEWEST => Ok(Offset::End),
        offset if (0..=high).contains(&offset) => Ok(Offset::Offset(offset.max(low))),
        offset => Err(BrokerError::OffsetOutOfRange {
            topic: topic.to_string(),
            partition,
            offset,
        }),
    }
}

fn watermark_error(topic: &str, partition: i32, e: KafkaError) -> BrokerError {
    if let KafkaError::MetadataFetch(RDKafkaErrorCode::UnknownPartition) = e {
        return BrokerError::UnknownPartition {
            topic: topic.to_string(),
            partition,
        };
    }
    BrokerError::kafka("fetch_watermarks", e)
}

async fn pump(
    consumer: StreamConsumer,
    topic: String,
    partition: i32,
    feed: PartitionFeed,
) -> Result<(), BrokerError> {
    loop {
        tokio::select! {
            _ = feed.shutdown.cancelled() => return Ok(()),
            received = consumer.recv() => {
                // BorrowedMessage is not Send, convert before the next await
                let received = received.map(|m| KafkaMessage::from_borrowed_message(&m));
                match received {
                    Ok(message) => {
                        if feed.messages.send(message).await.is_err() {
                            return Ok(());
                        }
                    }
                    Err(KafkaError::PartitionEOF(_)) => {}
                    Err(e) => {
                        warn!(
                            topic = topic.as_str(),
                            partition,
                            error = %e,
                            "Error receiving from partition"
                        );
                        if feed.errors.send(BrokerError::kafka("recv", e)).await.is_err() {
                            return Ok(());
                        }
                    }
                }
            }
        }
    }
}
