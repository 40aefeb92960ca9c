use std::time::Duration;

use envconfig::Envconfig;
use rdkafka::ClientConfig;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("invalid KAFKA_CONSUMER_OFFSET_RESET {0:?}, expected \"earliest\" or \"latest\"")]
    InvalidStartPosition(String),
}

/// Where the binary starts reading every partition
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartPosition {
    Earliest,
    Latest,
}

#[derive(Envconfig, Clone, Debug)]
pub struct Config {
    // Kafka configuration
    #[envconfig(default = "localhost:9092")]
    pub kafka_hosts: String,

    #[envconfig(default = "false")]
    pub kafka_tls: bool,

    #[envconfig(default = "topic-consumer")]
    pub kafka_client_id: String,

    // Only used as a label on the broker side, partitions are assigned manually
    #[envconfig(default = "topic-consumer")]
    pub kafka_group_id: String,

    #[envconfig(default = "events")]
    pub kafka_consumer_topic: String,

    #[envconfig(default = "earliest")]
    pub kafka_consumer_offset_reset: String, // earliest, latest

    #[envconfig(default = "10000")]
    pub kafka_metadata_timeout_ms: u64,

    // Consumer processing configuration
    #[envconfig(default = "false")]
    pub exit_after_caught_up: bool,

    #[envconfig(default = "1000")]
    pub partition_buffer_size: usize,

    // HTTP server configuration
    #[envconfig(from = "BIND_HOST", default = "0.0.0.0")]
    pub host: String,

    #[envconfig(from = "BIND_PORT", default = "8080")]
    pub port: u16,
}

impl Config {
    pub fn init_with_defaults() -> Result<Self, envconfig::Error> {
        Config::init_from_env()
    }

    /// Get server bind address
    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn metadata_timeout(&self) -> Duration {
        Duration::from_millis(self.kafka_metadata_timeout_ms)
    }

    pub fn start_position(&self) -> Result<StartPosition, ConfigError> {
        match self.kafka_consumer_offset_reset.as_str() {
            "earliest" => Ok(StartPosition::Earliest),
            "latest" => Ok(StartPosition::Latest),
            other => Err(ConfigError::InvalidStartPosition(other.to_string())),
        }
    }

    /// rdkafka configuration for the assign-only consumers behind `KafkaBrokerClient`
    pub fn to_client_config(&self) -> ClientConfig {
        let mut client_config = ClientConfig::new();
        client_config
            .set("bootstrap.servers", &self.kafka_hosts)
            .set("client.id", &self.kafka_client_id)
            .set("group.id", &self.kafka_group_id)
            .set("enable.auto.commit", "false")
            .set("enable.auto.offset.store", "false")
            .set("enable.partition.eof", "false")
            .set("statistics.interval.ms", "10000");

        if self.kafka_tls {
            client_config
                .set("security.protocol", "ssl")
                .set("enable.ssl.certificate.verification", "false");
        };

        client_config
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn config_from(vars: &[(&str, &str)]) -> Config {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        Config::init_from_hashmap(&vars).unwrap()
    }

    #[test]
    fn test_defaults() {
        let config = config_from(&[]);
        assert_eq!(config.kafka_hosts, "localhost:9092");
        assert_eq!(config.kafka_consumer_topic, "events");
        assert_eq!(config.partition_buffer_size, 1000);
        assert!(!config.exit_after_caught_up);
        assert_eq!(config.bind_address(), "0.0.0.0:8080");
        assert_eq!(config.metadata_timeout(), Duration::from_secs(10));
        assert_eq!(config.start_position().unwrap(), StartPosition::Earliest);
    }

    #[test]
    fn test_start_position_parsing() {
        let config = config_from(&[("KAFKA_CONSUMER_OFFSET_RESET", "latest")]);
        assert_eq!(config.start_position().unwrap(), StartPosition::Latest);

        let config = config_from(&[("KAFKA_CONSUMER_OFFSET_RESET", "middle")]);
        assert!(matches!(
            config.start_position(),
            Err(ConfigError::InvalidStartPosition(value)) if value == "middle"
        ));
    }

    #[test]
    fn test_client_config() {
        let config = config_from(&[
            ("KAFKA_HOSTS", "kafka-1:9092,kafka-2:9092"),
            ("KAFKA_TLS", "true"),
            ("KAFKA_CLIENT_ID", "replayer"),
        ]);
        let client_config = config.to_client_config();

        assert_eq!(
            client_config.get("bootstrap.servers"),
            Some("kafka-1:9092,kafka-2:9092")
        );
        assert_eq!(client_config.get("client.id"), Some("replayer"));
        assert_eq!(client_config.get("enable.auto.commit"), Some("false"));
        assert_eq!(client_config.get("security.protocol"), Some("ssl"));
    }
}
