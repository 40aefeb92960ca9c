use rdkafka::error::KafkaError;
use thiserror::Error;

/// Errors surfaced by a [`BrokerClient`](crate::kafka::BrokerClient) implementation, either
/// from a direct call or delivered on a partition stream's error channel.
#[derive(Error, Debug, Clone)]
pub enum BrokerError {
    /// librdkafka returned an error
    #[error("kafka error during {operation}: {source}")]
    Kafka {
        operation: &'static str,
        #[source]
        source: KafkaError,
    },

    #[error("unknown topic {topic}")]
    UnknownTopic { topic: String },

    #[error("unknown partition {topic}:{partition}")]
    UnknownPartition { topic: String, partition: i32 },

    /// The requested start offset does not exist on the partition
    #[error("offset {offset} out of range for {topic}:{partition}")]
    OffsetOutOfRange {
        topic: String,
        partition: i32,
        offset: i64,
    },

    /// Topic metadata came back with a broker-side error code
    #[error("metadata error for topic {topic}: {reason}")]
    Metadata { topic: String, reason: String },

    #[error("broker transport error: {0}")]
    Transport(String),

    /// A blocking broker call or a stream pump task died
    #[error("broker task failed: {0}")]
    TaskFailed(String),
}

impl BrokerError {
    pub fn kafka(operation: &'static str, source: KafkaError) -> Self {
        BrokerError::Kafka { operation, source }
    }

    /// Returns the error type tag for metrics
    pub fn error_type(&self) -> &'static str {
        match self {
            BrokerError::Kafka { .. } => "kafka_error",
            BrokerError::UnknownTopic { .. } => "unknown_topic",
            BrokerError::UnknownPartition { .. } => "unknown_partition",
            BrokerError::OffsetOutOfRange { .. } => "offset_out_of_range",
            BrokerError::Metadata { .. } => "metadata",
            BrokerError::Transport(_) => "transport",
            BrokerError::TaskFailed(_) => "task_failed",
        }
    }
}

/// Fail-fast errors returned by `TopicConsumer::consume_topic` before any partition
/// task is spawned.
#[derive(Error, Debug)]
pub enum ConsumeError {
    #[error("failed to discover partitions for topic {topic}: {source}")]
    Discovery {
        topic: String,
        #[source]
        source: BrokerError,
    },

    #[error("topic {topic} has no partitions")]
    TopicNotFound { topic: String },

    #[error("no start offset supplied for {topic}:{partition}")]
    MissingOffset { topic: String, partition: i32 },

    #[error("failed to resolve catch-up target for {topic}:{partition}: {source}")]
    OffsetQuery {
        topic: String,
        partition: i32,
        #[source]
        source: BrokerError,
    },

    #[error("topic consumer is closed")]
    Closed,

    /// The aggregation task for a call panicked or was aborted
    #[error("offset aggregation for topic {topic} failed: {reason}")]
    Aggregation { topic: String, reason: String },
}

impl ConsumeError {
    pub fn error_type(&self) -> &'static str {
        match self {
            ConsumeError::Discovery { .. } => "discovery",
            ConsumeError::TopicNotFound { .. } => "topic_not_found",
            ConsumeError::MissingOffset { .. } => "missing_offset",
            ConsumeError::OffsetQuery { .. } => "offset_query",
            ConsumeError::Closed => "closed",
            ConsumeError::Aggregation { .. } => "aggregation",
        }
    }
}

/// Failures isolated to a single partition. These never abort sibling partitions and
/// are only visible through logs, metrics and the final `ConsumeOutcome`.
#[derive(Error, Debug, Clone)]
pub enum PartitionError {
    #[error("failed to open stream for {topic}:{partition} at offset {offset}: {source}")]
    StreamOpen {
        topic: String,
        partition: i32,
        offset: i64,
        #[source]
        source: BrokerError,
    },

    /// The underlying stream ended with an error, either on its own or while closing
    #[error("stream for {topic}:{partition} failed: {source}")]
    StreamFailed {
        topic: String,
        partition: i32,
        #[source]
        source: BrokerError,
    },

    /// The partition task exited without reporting a final offset
    #[error("consumer for {topic}:{partition} exited without reporting")]
    Aborted { topic: String, partition: i32 },
}

impl PartitionError {
    pub fn partition(&self) -> i32 {
        match self {
            PartitionError::StreamOpen { partition, .. }
            | PartitionError::StreamFailed { partition, .. }
            | PartitionError::Aborted { partition, .. } => *partition,
        }
    }

    pub fn error_type(&self) -> &'static str {
        match self {
            PartitionError::StreamOpen { .. } => "stream_open",
            PartitionError::StreamFailed { .. } => "stream_failed",
            PartitionError::Aborted { .. } => "aborted",
        }
    }
}
