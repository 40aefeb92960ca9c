// Partition-level consumption and the topic-wide coordination built on top of it
pub mod broker;
pub mod catch_up;
pub mod client;
pub mod coordinator;
pub mod partition_consumer;
pub mod partition_stream;
pub mod types;

// Public API
pub use broker::{BrokerClient, PartitionFeed, RawPartitionStream};
pub use client::KafkaBrokerClient;
pub use partition_stream::PartitionStream;
