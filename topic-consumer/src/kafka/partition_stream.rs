//! Partition Stream - metrics-recording wrapper around a broker partition stream
//!
//! The wrapper owns a forwarding task that moves every message and error from the raw
//! stream into its own bounded channels, counting each one on the way through. Delivery
//! is unchanged: nothing is dropped, reordered or retried.

use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::BrokerError;
use crate::kafka::broker::{BrokerClient, RawPartitionStream};
use crate::kafka::types::KafkaMessage;
use crate::metrics::MetricsRecorder;

pub struct PartitionStream {
    topic: String,
    partition: i32,
    messages: mpsc::Receiver<KafkaMessage>,
    errors: mpsc::Receiver<BrokerError>,
    shutdown: CancellationToken,
    forwarder: Option<JoinHandle<Result<(), BrokerError>>>,
}

impl PartitionStream {
    /// Open `topic`:`partition` at `start_offset` through `broker`
    pub async fn open(
        broker: &dyn BrokerClient,
        metrics: Arc<dyn MetricsRecorder>,
        topic: &str,
        partition: i32,
        start_offset: i64,
        buffer: usize,
    ) -> Result<Self, BrokerError> {
        let raw = broker
            .consume_partition(topic, partition, start_offset, buffer)
            .await?;
        Ok(Self::wrap(raw, metrics, topic, partition, buffer))
    }

    /// Wrap an already opened raw stream
    pub fn wrap(
        raw: RawPartitionStream,
        metrics: Arc<dyn MetricsRecorder>,
        topic: &str,
        partition: i32,
        buffer: usize,
    ) -> Self {
        let (messages_tx, messages) = mpsc::channel(buffer.max(1));
        let (errors_tx, errors) = mpsc::channel(buffer.max(1));
        let shutdown = raw.shutdown.clone();

        let forwarder = tokio::spawn(forward(
            raw,
            messages_tx,
            errors_tx,
            metrics,
            topic.to_string(),
            partition,
        ));

        Self {
            topic: topic.to_string(),
            partition,
            messages,
            errors,
            shutdown,
            forwarder: Some(forwarder),
        }
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn partition(&self) -> i32 {
        self.partition
    }

    pub fn messages(&mut self) -> &mut mpsc::Receiver<KafkaMessage> {
        &mut self.messages
    }

    pub fn errors(&mut self) -> &mut mpsc::Receiver<BrokerError> {
        &mut self.errors
    }

    /// Both receivers at once, for multiplexed waits
    pub fn channels(
        &mut self,
    ) -> (
        &mut mpsc::Receiver<KafkaMessage>,
        &mut mpsc::Receiver<BrokerError>,
    ) {
        (&mut self.messages, &mut self.errors)
    }

    /// Request shutdown and return immediately. Keep reading `messages()` and `errors()`:
    /// both close only after everything the underlying stream produced has been
    /// forwarded.
    pub fn async_close(&self) {
        self.shutdown.cancel();
    }

    /// Request shutdown and wait until both channels are drained and closed. Anything
    /// still buffered is discarded. Returns the error the underlying stream ended with.
    pub async fn close(mut self) -> Result<(), BrokerError> {
        self.async_close();

        let mut discarded = 0usize;
        let mut messages_open = true;
        let mut errors_open = true;
        while messages_open || errors_open {
            tokio::select! {
                message = self.messages.recv(), if messages_open => match message {
                    Some(_) => discarded += 1,
                    None => messages_open = false,
                },
                error = self.errors.recv(), if errors_open => match error {
                    Some(e) => debug!(
                        topic = self.topic.as_str(),
                        partition = self.partition,
                        error = %e,
                        "Discarding stream error while closing"
                    ),
                    None => errors_open = false,
                },
            }
        }

        if discarded > 0 {
            debug!(
                topic = self.topic.as_str(),
                partition = self.partition,
                discarded,
                "Discarded buffered messages while closing"
            );
        }

        match self.forwarder.take() {
            Some(handle) => handle
                .await
                .map_err(|e| BrokerError::TaskFailed(e.to_string()))?,
            None => Ok(()),
        }
    }
}

impl Drop for PartitionStream {
    fn drop(&mut self) {
        // Never leave a pump running behind a dropped stream
        self.shutdown.cancel();
    }
}

async fn forward(
    raw: RawPartitionStream,
    messages_tx: mpsc::Sender<KafkaMessage>,
    errors_tx: mpsc::Sender<BrokerError>,
    metrics: Arc<dyn MetricsRecorder>,
    topic: String,
    partition: i32,
) -> Result<(), BrokerError> {
    let RawPartitionStream {
        mut messages,
        mut errors,
        shutdown: _,
        pump,
    } = raw;

    let mut messages_open = true;
    let mut errors_open = true;
    while messages_open || errors_open {
        tokio::select! {
            message = messages.recv(), if messages_open => match message {
                Some(message) => {
                    metrics.message_consumed(&topic, partition);
                    // A dropped receiver still gets drained so the pump can finish
                    if messages_tx.send(message).await.is_err() {
                        debug!(
                            topic = topic.as_str(),
                            partition,
                            "Partition stream receiver dropped"
                        );
                    }
                }
                None => messages_open = false,
            },
            error = errors.recv(), if errors_open => match error {
                Some(error) => {
                    metrics.error_consumed(&topic, partition);
                    if errors_tx.send(error).await.is_err() {
                        debug!(
                            topic = topic.as_str(),
                            partition,
                            "Partition error receiver dropped"
                        );
                    }
                }
                None => errors_open = false,
            },
        }
    }

    match pump.await {
        Ok(result) => result,
        Err(e) => {
            warn!(
                topic = topic.as_str(),
                partition,
                error = %e,
                "Partition stream pump panicked"
            );
            Err(BrokerError::TaskFailed(e.to_string()))
        }
    }
}
