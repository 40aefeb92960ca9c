//! Partitioned topic consumer.
//!
//! Consumes every partition of a Kafka topic concurrently, one task per partition, and
//! reports when the whole topic has caught up with the offsets that existed when the read
//! began. When consumption ends (catch-up with `exit_after_caught_up`, cancellation, or
//! coordinator shutdown) the final offset of every partition is aggregated into one
//! [`ConsumeOutcome`].
//!
//! ## Error logging (anyhow)
//!
//! Handler errors are `anyhow::Error`. Log them with `error = ?e` so the full cause chain
//! is visible; `%e` only shows the top-level message.

pub mod config;
pub mod error;
pub mod handler;
pub mod kafka;
pub mod metrics;
pub mod metrics_consts;
pub mod test_utils;

pub use error::{BrokerError, ConsumeError, PartitionError};
pub use handler::{JsonUnmarshaler, LoggingHandler, MessageHandler, Unmarshaler};
pub use kafka::catch_up::CaughtUpSignal;
pub use kafka::coordinator::{ConsumeOptions, TopicConsumer, TopicConsumption};
pub use kafka::types::{
    ConsumeOutcome, KafkaMessage, OffsetPosition, PartitionOffsets, OFFSET_NEWEST, OFFSET_OLDEST,
};
pub use metrics::{ConsumerMetrics, ErrorSource, MetricsRecorder};
