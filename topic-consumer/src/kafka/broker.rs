//! Broker client seam.
//!
//! The coordinator only needs three things from a broker: the partitions of a topic, the
//! watermarks of a partition, and a stream of messages for one partition starting at a
//! given offset. [`KafkaBrokerClient`](crate::kafka::KafkaBrokerClient) implements this on
//! top of rdkafka; `test_utils::MockBroker` implements it in memory.

use std::future::Future;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::error::BrokerError;
use crate::kafka::types::{KafkaMessage, OffsetPosition};

#[async_trait]
pub trait BrokerClient: Send + Sync {
    /// Partition ids of `topic`
    async fn partitions(&self, topic: &str) -> Result<Vec<i32>, BrokerError>;

    /// Open a stream for one partition. `start_offset` is an explicit offset or one of the
    /// `OFFSET_OLDEST` / `OFFSET_NEWEST` sentinels. `buffer` bounds both channels.
    async fn consume_partition(
        &self,
        topic: &str,
        partition: i32,
        start_offset: i64,
        buffer: usize,
    ) -> Result<RawPartitionStream, BrokerError>;

    /// Current oldest or newest offset of a partition
    async fn get_offset(
        &self,
        topic: &str,
        partition: i32,
        position: OffsetPosition,
    ) -> Result<i64, BrokerError>;

    /// Oldest and newest offset of a partition, read in a single request. The newest offset
    /// is the one the next produced message will get.
    async fn watermarks(&self, topic: &str, partition: i32) -> Result<(i64, i64), BrokerError>;
}

/// Producing half of a partition stream, owned by the pump task
pub struct PartitionFeed {
    pub messages: mpsc::Sender<KafkaMessage>,
    pub errors: mpsc::Sender<BrokerError>,
    /// Cancelled when the consumer asks the stream to close. The pump must return
    /// promptly after this fires; returning drops both senders, closing the channels.
    pub shutdown: CancellationToken,
}

/// A partition stream as handed out by a broker client
pub struct RawPartitionStream {
    pub(crate) messages: mpsc::Receiver<KafkaMessage>,
    pub(crate) errors: mpsc::Receiver<BrokerError>,
    pub(crate) shutdown: CancellationToken,
    pub(crate) pump: JoinHandle<Result<(), BrokerError>>,
}

impl RawPartitionStream {
    /// Create the channels and spawn `pump` to fill them
    pub fn spawn<F, Fut>(buffer: usize, pump: F) -> Self
    where
        F: FnOnce(PartitionFeed) -> Fut,
        Fut: Future<Output = Result<(), BrokerError>> + Send + 'static,
    {
        let (messages_tx, messages) = mpsc::channel(buffer.max(1));
        let (errors_tx, errors) = mpsc::channel(buffer.max(1));
        let shutdown = CancellationToken::new();

        let feed = PartitionFeed {
            messages: messages_tx,
            errors: errors_tx,
            shutdown: shutdown.clone(),
        };
        let pump = tokio::spawn(pump(feed));

        Self {
            messages,
            errors,
            shutdown,
            pump,
        }
    }

    /// Ask the pump to stop. Messages already buffered stay readable.
    pub fn request_shutdown(&self) {
        self.shutdown.cancel();
    }
}
