use std::sync::atomic::{AtomicU64, Ordering};

use anyhow::{Context, Result};
use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::kafka::types::KafkaMessage;

/// Application callback invoked once per message, in offset order within a partition.
///
/// `ctx` is cancelled when the consume call it belongs to is cancelled. Returning an error
/// does not stop consumption: the error is logged and counted, and the next message is
/// handled.
#[async_trait]
pub trait MessageHandler: Send + Sync {
    async fn handle_message(
        &self,
        ctx: &CancellationToken,
        message: &KafkaMessage,
        unmarshaler: &dyn Unmarshaler,
    ) -> Result<()>;
}

/// Payload decoder handed through to the handler untouched
pub trait Unmarshaler: Send + Sync {
    fn unmarshal(&self, message: &KafkaMessage) -> Result<serde_json::Value>;
}

/// Decodes payloads as JSON. A missing payload decodes to `null`.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonUnmarshaler;

impl Unmarshaler for JsonUnmarshaler {
    fn unmarshal(&self, message: &KafkaMessage) -> Result<serde_json::Value> {
        let Some(payload) = message.payload() else {
            return Ok(serde_json::Value::Null);
        };
        serde_json::from_slice(payload).with_context(|| {
            format!(
                "failed to decode JSON payload at {}:{}@{}",
                message.topic(),
                message.partition(),
                message.offset()
            )
        })
    }
}

/// Handler that decodes every message and logs it
#[derive(Debug, Default)]
pub struct LoggingHandler {
    handled: AtomicU64,
}

impl LoggingHandler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn handled(&self) -> u64 {
        self.handled.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl MessageHandler for LoggingHandler {
    async fn handle_message(
        &self,
        _ctx: &CancellationToken,
        message: &KafkaMessage,
        unmarshaler: &dyn Unmarshaler,
    ) -> Result<()> {
        let value = unmarshaler.unmarshal(message)?;
        self.handled.fetch_add(1, Ordering::Relaxed);

        debug!(
            topic = message.topic(),
            partition = message.partition(),
            offset = message.offset(),
            key = ?message.key().map(String::from_utf8_lossy),
            payload = %value,
            "Handled message"
        );
        Ok(())
    }
}
