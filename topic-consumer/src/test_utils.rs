//! Shared test utilities for the topic-consumer crate.
//!
//! Used by the `mod tests` blocks and by the integration tests under `tests/`. The
//! in-memory broker behaves like a single Kafka node holding fully replicated logs: offsets
//! are dense, watermarks move as messages are produced, and open streams wake up as soon as
//! a new message is appended.

use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

use crate::error::BrokerError;
use crate::handler::{MessageHandler, Unmarshaler};
use crate::kafka::broker::{BrokerClient, PartitionFeed, RawPartitionStream};
use crate::kafka::types::{KafkaMessage, OffsetPosition, OFFSET_NEWEST, OFFSET_OLDEST};
use crate::metrics::{ErrorSource, MetricsRecorder};

#[derive(Default)]
struct PartitionLog {
    first_offset: i64,
    messages: Vec<KafkaMessage>,
    pending_errors: VecDeque<BrokerError>,
    terminal_error: Option<BrokerError>,
}

impl PartitionLog {
    fn high_watermark(&self) -> i64 {
        self.first_offset + self.messages.len() as i64
    }
}

struct Backlog {
    messages: Vec<KafkaMessage>,
    errors: Vec<BrokerError>,
    terminal: Option<BrokerError>,
}

#[derive(Default)]
struct MockPartition {
    log: Mutex<PartitionLog>,
    appended: Notify,
}

impl MockPartition {
    fn take_backlog(&self, next_offset: i64) -> Backlog {
        let mut log = self.log.lock().unwrap();
        let skip = usize::try_from(next_offset - log.first_offset).unwrap_or(0);
        Backlog {
            messages: log.messages.iter().skip(skip).cloned().collect(),
            errors: log.pending_errors.drain(..).collect(),
            terminal: log.terminal_error.take(),
        }
    }
}

/// In-memory `BrokerClient`
#[derive(Default)]
pub struct MockBroker {
    topics: Mutex<HashMap<String, BTreeMap<i32, Arc<MockPartition>>>>,
    failing_discovery: Mutex<HashSet<String>>,
    failing_opens: Mutex<HashSet<(String, i32)>>,
    failing_offset_queries: Mutex<HashSet<(String, i32)>>,
    open_attempts: Mutex<Vec<(String, i32, i64)>>,
    discovery_delay: Mutex<Option<Duration>>,
    offset_queries: AtomicUsize,
    watermark_queries: AtomicUsize,
}

impl MockBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create `topic` with partitions `0..partitions`, all empty and starting at offset 0
    pub fn create_topic(&self, topic: &str, partitions: i32) {
        let partitions = (0..partitions)
            .map(|p| (p, Arc::new(MockPartition::default())))
            .collect();
        self.topics
            .lock()
            .unwrap()
            .insert(topic.to_string(), partitions);
    }

    /// Move the start of an empty partition's log, as if older segments had been deleted
    pub fn set_first_offset(&self, topic: &str, partition: i32, offset: i64) {
        let partition = self.partition(topic, partition).expect("unknown partition");
        let mut log = partition.log.lock().unwrap();
        assert!(log.messages.is_empty(), "log already has messages");
        log.first_offset = offset;
    }

    /// Append a message and return its offset
    pub fn produce(&self, topic: &str, partition: i32, payload: &str) -> i64 {
        let target = self.partition(topic, partition).expect("unknown partition");
        let offset = {
            let mut log = target.log.lock().unwrap();
            let offset = log.high_watermark();
            log.messages.push(KafkaMessage::new_for_test(
                topic, partition, offset, payload,
            ));
            offset
        };
        target.appended.notify_waiters();
        offset
    }

    /// Deliver `error` on the error channel of the next stream reading this partition
    pub fn inject_error(&self, topic: &str, partition: i32, error: BrokerError) {
        let target = self.partition(topic, partition).expect("unknown partition");
        target.log.lock().unwrap().pending_errors.push_back(error);
        target.appended.notify_waiters();
    }

    /// End the next stream reading this partition with `error`, after its backlog
    pub fn fail_stream(&self, topic: &str, partition: i32, error: BrokerError) {
        let target = self.partition(topic, partition).expect("unknown partition");
        target.log.lock().unwrap().terminal_error = Some(error);
        target.appended.notify_waiters();
    }

    pub fn fail_discovery(&self, topic: &str) {
        self.failing_discovery
            .lock()
            .unwrap()
            .insert(topic.to_string());
    }

    /// Hold every `partitions` call for `delay` before answering
    pub fn delay_discovery(&self, delay: Duration) {
        *self.discovery_delay.lock().unwrap() = Some(delay);
    }

    pub fn fail_stream_open(&self, topic: &str, partition: i32) {
        self.failing_opens
            .lock()
            .unwrap()
            .insert((topic.to_string(), partition));
    }

    pub fn fail_offset_query(&self, topic: &str, partition: i32) {
        self.failing_offset_queries
            .lock()
            .unwrap()
            .insert((topic.to_string(), partition));
    }

    /// Every `consume_partition` call so far as (topic, partition, requested start offset)
    pub fn open_attempts(&self) -> Vec<(String, i32, i64)> {
        self.open_attempts.lock().unwrap().clone()
    }

    /// Number of `get_offset` calls so far
    pub fn offset_queries(&self) -> usize {
        self.offset_queries.load(Ordering::SeqCst)
    }

    /// Number of `watermarks` calls so far
    pub fn watermark_queries(&self) -> usize {
        self.watermark_queries.load(Ordering::SeqCst)
    }

    fn check_offset_query(&self, topic: &str, partition: i32) -> Result<(), BrokerError> {
        if self
            .failing_offset_queries
            .lock()
            .unwrap()
            .contains(&(topic.to_string(), partition))
        {
            return Err(BrokerError::Transport("list offsets failed".to_string()));
        }
        Ok(())
    }

    fn partition(&self, topic: &str, partition: i32) -> Result<Arc<MockPartition>, BrokerError> {
        let topics = self.topics.lock().unwrap();
        let partitions = topics.get(topic).ok_or_else(|| BrokerError::UnknownTopic {
            topic: topic.to_string(),
        })?;
        partitions
            .get(&partition)
            .cloned()
            .ok_or_else(|| BrokerError::UnknownPartition {
                topic: topic.to_string(),
                partition,
            })
    }
}

#[async_trait]
impl BrokerClient for MockBroker {
    async fn partitions(&self, topic: &str) -> Result<Vec<i32>, BrokerError> {
        let delay = *self.discovery_delay.lock().unwrap();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if self.failing_discovery.lock().unwrap().contains(topic) {
            return Err(BrokerError::Transport("metadata request failed".to_string()));
        }
        let topics = self.topics.lock().unwrap();
        let partitions = topics.get(topic).ok_or_else(|| BrokerError::UnknownTopic {
            topic: topic.to_string(),
        })?;
        Ok(partitions.keys().copied().collect())
    }

    async fn consume_partition(
        &self,
        topic: &str,
        partition: i32,
        start_offset: i64,
        buffer: usize,
    ) -> Result<RawPartitionStream, BrokerError> {
        self.open_attempts
            .lock()
            .unwrap()
            .push((topic.to_string(), partition, start_offset));

        if self
            .failing_opens
            .lock()
            .unwrap()
            .contains(&(topic.to_string(), partition))
        {
            return Err(BrokerError::Transport("stream open rejected".to_string()));
        }

        let target = self.partition(topic, partition)?;
        let next_offset = {
            let log = target.log.lock().unwrap();
            match start_offset {
                OFFSET_OLDEST => log.first_offset,
                OFFSET_NEWEST => log.high_watermark(),
                offset if offset >= 0 && offset <= log.high_watermark() => {
                    offset.max(log.first_offset)
                }
                offset => {
                    return Err(BrokerError::OffsetOutOfRange {
                        topic: topic.to_string(),
                        partition,
                        offset,
                    })
                }
            }
        };

        Ok(RawPartitionStream::spawn(buffer, move |feed| {
            pump(target, next_offset, feed)
        }))
    }

    async fn get_offset(
        &self,
        topic: &str,
        partition: i32,
        position: OffsetPosition,
    ) -> Result<i64, BrokerError> {
        self.offset_queries.fetch_add(1, Ordering::SeqCst);
        self.check_offset_query(topic, partition)?;

        let target = self.partition(topic, partition)?;
        let log = target.log.lock().unwrap();
        Ok(match position {
            OffsetPosition::Oldest => log.first_offset,
            OffsetPosition::Newest => log.high_watermark(),
        })
    }

    async fn watermarks(&self, topic: &str, partition: i32) -> Result<(i64, i64), BrokerError> {
        self.watermark_queries.fetch_add(1, Ordering::SeqCst);
        self.check_offset_query(topic, partition)?;

        let target = self.partition(topic, partition)?;
        let log = target.log.lock().unwrap();
        Ok((log.first_offset, log.high_watermark()))
    }
}

async fn pump(
    partition: Arc<MockPartition>,
    mut next_offset: i64,
    feed: PartitionFeed,
) -> Result<(), BrokerError> {
    loop {
        // Register for wake-ups before reading the log so no append is missed
        let appended = partition.appended.notified();
        tokio::pin!(appended);
        appended.as_mut().enable();

        let backlog = partition.take_backlog(next_offset);
        for error in backlog.errors {
            if feed.errors.send(error).await.is_err() {
                return Ok(());
            }
        }
        for message in backlog.messages {
            next_offset = message.offset() + 1;
            if feed.messages.send(message).await.is_err() {
                return Ok(());
            }
        }
        if let Some(error) = backlog.terminal {
            return Err(error);
        }

        tokio::select! {
            _ = feed.shutdown.cancelled() => return Ok(()),
            _ = &mut appended => {}
        }
    }
}

/// `MetricsRecorder` that keeps per-partition tallies in memory
#[derive(Debug, Default)]
pub struct TestMetrics {
    counters: Mutex<HashMap<(&'static str, i32), u64>>,
    timings: Mutex<HashMap<i32, Vec<Duration>>>,
}

impl TestMetrics {
    fn bump(&self, name: &'static str, partition: i32) {
        *self
            .counters
            .lock()
            .unwrap()
            .entry((name, partition))
            .or_default() += 1;
    }

    fn get(&self, name: &'static str, partition: i32) -> u64 {
        self.counters
            .lock()
            .unwrap()
            .get(&(name, partition))
            .copied()
            .unwrap_or_default()
    }

    pub fn consumed(&self, partition: i32) -> u64 {
        self.get("consumed", partition)
    }

    pub fn errors_consumed(&self, partition: i32) -> u64 {
        self.get("errors_consumed", partition)
    }

    pub fn processed(&self, partition: i32) -> u64 {
        self.get("processed", partition)
    }

    pub fn processing_errors(&self, partition: i32, source: ErrorSource) -> u64 {
        match source {
            ErrorSource::Handler => self.get("handler_errors", partition),
            ErrorSource::Broker => self.get("broker_errors", partition),
        }
    }

    pub fn caught_up(&self, partition: i32) -> u64 {
        self.get("caught_up", partition)
    }

    pub fn open_failures(&self, partition: i32) -> u64 {
        self.get("open_failures", partition)
    }

    pub fn timings(&self, partition: i32) -> usize {
        self.timings
            .lock()
            .unwrap()
            .get(&partition)
            .map_or(0, Vec::len)
    }
}

impl MetricsRecorder for TestMetrics {
    fn message_consumed(&self, _topic: &str, partition: i32) {
        self.bump("consumed", partition);
    }

    fn error_consumed(&self, _topic: &str, partition: i32) {
        self.bump("errors_consumed", partition);
    }

    fn message_processed(&self, _topic: &str, partition: i32) {
        self.bump("processed", partition);
    }

    fn processing_error(&self, _topic: &str, partition: i32, source: ErrorSource) {
        match source {
            ErrorSource::Handler => self.bump("handler_errors", partition),
            ErrorSource::Broker => self.bump("broker_errors", partition),
        }
    }

    fn processing_time(&self, _topic: &str, partition: i32, elapsed: Duration) {
        self.timings
            .lock()
            .unwrap()
            .entry(partition)
            .or_default()
            .push(elapsed);
    }

    fn partition_caught_up(&self, _topic: &str, partition: i32) {
        self.bump("caught_up", partition);
    }

    fn partition_open_failed(&self, _topic: &str, partition: i32) {
        self.bump("open_failures", partition);
    }
}

/// Handler that records every (partition, offset) it sees
#[derive(Debug, Default)]
pub struct RecordingHandler {
    calls: Mutex<Vec<(i32, i64)>>,
    failing: HashSet<(i32, i64)>,
    delay: Option<Duration>,
    panicking: HashSet<(i32, i64)>,
}

impl RecordingHandler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail the handler for these (partition, offset) pairs
    pub fn failing_at(mut self, failing: &[(i32, i64)]) -> Self {
        self.failing.extend(failing.iter().copied());
        self
    }

    /// Panic inside the handler for these (partition, offset) pairs, after recording the call
    pub fn panicking_at(mut self, panicking: &[(i32, i64)]) -> Self {
        self.panicking.extend(panicking.iter().copied());
        self
    }

    /// Sleep this long inside every call
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn calls(&self) -> Vec<(i32, i64)> {
        self.calls.lock().unwrap().clone()
    }

    pub fn offsets_for(&self, partition: i32) -> Vec<i64> {
        self.calls()
            .into_iter()
            .filter(|(p, _)| *p == partition)
            .map(|(_, offset)| offset)
            .collect()
    }

    pub fn count(&self) -> usize {
        self.calls.lock().unwrap().len()
    }
}

#[async_trait]
impl MessageHandler for RecordingHandler {
    async fn handle_message(
        &self,
        _ctx: &CancellationToken,
        message: &KafkaMessage,
        _unmarshaler: &dyn Unmarshaler,
    ) -> Result<()> {
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        let call = (message.partition(), message.offset());
        self.calls.lock().unwrap().push(call);

        if self.panicking.contains(&call) {
            panic!("simulated handler panic at {}:{}", call.0, call.1);
        }
        if self.failing.contains(&call) {
            return Err(anyhow!(
                "simulated handler failure at {}:{}",
                call.0,
                call.1
            ));
        }
        Ok(())
    }
}
