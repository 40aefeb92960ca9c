// ==== Partition stream metrics ====
/// Counter for messages read off a partition stream
pub const MESSAGES_CONSUMED: &str = "kafka_topic_consumer_messages_consumed_total";

/// Counter for errors read off a partition stream
pub const ERRORS_CONSUMED: &str = "kafka_topic_consumer_errors_consumed_total";

// ==== Partition loop metrics ====
/// Counter for messages the handler finished without error
pub const MESSAGES_PROCESSED: &str = "kafka_topic_consumer_messages_processed_total";

/// Counter for handler failures and broker errors seen by a partition loop
pub const PROCESSING_ERRORS: &str = "kafka_topic_consumer_processing_errors_total";

/// Histogram for handler duration per message
pub const MESSAGE_PROCESSING_TIME: &str = "kafka_topic_consumer_message_processing_seconds";

/// Counter for partitions reaching their catch-up target
pub const PARTITIONS_CAUGHT_UP: &str = "kafka_topic_consumer_partitions_caught_up_total";

/// Counter for partitions whose stream could not be opened
pub const PARTITION_OPEN_FAILURES: &str = "kafka_topic_consumer_partition_open_failures_total";

// ==== Coordinator metrics ====
/// Counter for consume_topic calls rejected before spawning
pub const CONSUME_TOPIC_FAILURES: &str = "kafka_topic_consumer_consume_topic_failures_total";

/// Gauge for partition loops currently running
pub const ACTIVE_PARTITIONS: &str = "kafka_topic_consumer_active_partitions";
