use std::collections::btree_map;
use std::collections::BTreeMap;

use rdkafka::message::{BorrowedMessage, Message};
use serde::{Deserialize, Serialize};

use crate::error::PartitionError;

/// Start-offset sentinel: begin after the last message currently in the partition
pub const OFFSET_NEWEST: i64 = -1;

/// Start-offset sentinel: begin at the oldest message still retained
pub const OFFSET_OLDEST: i64 = -2;

/// Catch-up target of a partition that held no messages when the read began
pub const NO_CATCH_UP_TARGET: i64 = -1;

/// Which watermark a broker offset query returns
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OffsetPosition {
    /// Offset of the oldest retained message (low watermark)
    Oldest,
    /// Offset the next produced message will get (high watermark)
    Newest,
}

/// An owned message read from one partition
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KafkaMessage {
    topic: String,
    partition: i32,
    offset: i64,
    key: Option<Vec<u8>>,
    payload: Option<Vec<u8>>,
    timestamp_millis: Option<i64>,
}

impl KafkaMessage {
    pub fn new(
        topic: String,
        partition: i32,
        offset: i64,
        key: Option<Vec<u8>>,
        payload: Option<Vec<u8>>,
        timestamp_millis: Option<i64>,
    ) -> Self {
        Self {
            topic,
            partition,
            offset,
            key,
            payload,
            timestamp_millis,
        }
    }

    pub fn from_borrowed_message(message: &BorrowedMessage<'_>) -> Self {
        Self {
            topic: message.topic().to_string(),
            partition: message.partition(),
            offset: message.offset(),
            key: message.key().map(<[u8]>::to_vec),
            payload: message.payload().map(<[u8]>::to_vec),
            timestamp_millis: message.timestamp().to_millis(),
        }
    }

    pub fn new_for_test(topic: &str, partition: i32, offset: i64, payload: &str) -> Self {
        Self::new(
            topic.to_string(),
            partition,
            offset,
            None,
            Some(payload.as_bytes().to_vec()),
            None,
        )
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn partition(&self) -> i32 {
        self.partition
    }

    pub fn offset(&self) -> i64 {
        self.offset
    }

    pub fn key(&self) -> Option<&[u8]> {
        self.key.as_deref()
    }

    pub fn payload(&self) -> Option<&[u8]> {
        self.payload.as_deref()
    }

    pub fn timestamp_millis(&self) -> Option<i64> {
        self.timestamp_millis
    }
}

/// Partition id -> offset. Used both for the start offsets handed to the coordinator and
/// for the final offsets it reports back.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PartitionOffsets(BTreeMap<i32, i64>);

impl PartitionOffsets {
    pub fn new() -> Self {
        Self::default()
    }

    /// Same offset (usually a sentinel) for every listed partition
    pub fn uniform(partitions: &[i32], offset: i64) -> Self {
        partitions.iter().map(|&p| (p, offset)).collect()
    }

    /// Returns the previous offset for the partition, if any
    pub fn insert(&mut self, partition: i32, offset: i64) -> Option<i64> {
        self.0.insert(partition, offset)
    }

    pub fn get(&self, partition: i32) -> Option<i64> {
        self.0.get(&partition).copied()
    }

    pub fn contains(&self, partition: i32) -> bool {
        self.0.contains_key(&partition)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn partitions(&self) -> Vec<i32> {
        self.0.keys().copied().collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = (i32, i64)> + '_ {
        self.0.iter().map(|(&p, &o)| (p, o))
    }
}

impl FromIterator<(i32, i64)> for PartitionOffsets {
    fn from_iter<I: IntoIterator<Item = (i32, i64)>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

impl IntoIterator for PartitionOffsets {
    type Item = (i32, i64);
    type IntoIter = btree_map::IntoIter<i32, i64>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.into_iter()
    }
}

/// Emitted exactly once by every partition loop when it closes
#[derive(Debug)]
pub struct FinalOffsetReport {
    pub partition: i32,
    /// Last offset actually read, or the start offset if nothing was read
    pub offset: i64,
    pub error: Option<PartitionError>,
}

/// Aggregated result of one `consume_topic` call
#[derive(Debug, Clone)]
pub struct ConsumeOutcome {
    pub topic: String,
    pub offsets: PartitionOffsets,
    pub failures: BTreeMap<i32, PartitionError>,
}

impl ConsumeOutcome {
    pub fn new(topic: &str) -> Self {
        Self {
            topic: topic.to_string(),
            offsets: PartitionOffsets::new(),
            failures: BTreeMap::new(),
        }
    }

    pub(crate) fn record(&mut self, report: FinalOffsetReport) {
        self.offsets.insert(report.partition, report.offset);
        if let Some(error) = report.error {
            self.failures.insert(report.partition, error);
        }
    }

    /// True when every partition closed without a stream failure
    pub fn is_complete(&self) -> bool {
        self.failures.is_empty()
    }
}
