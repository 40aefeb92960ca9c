//! Partition Consumer - drives a single partition from its start offset
//!
//! Each partition gets its own consumer task, ensuring:
//! 1. Messages are handed to the handler one at a time, in offset order
//! 2. A slow handler stalls only its own partition
//! 3. The topic-wide catch-up countdown is released exactly once, whatever the exit path
//! 4. Exactly one final offset report is sent when the task ends

use std::sync::Arc;
use std::time::Instant;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::error::{BrokerError, PartitionError};
use crate::handler::{MessageHandler, Unmarshaler};
use crate::kafka::broker::BrokerClient;
use crate::kafka::catch_up::CatchUpToken;
use crate::kafka::partition_stream::PartitionStream;
use crate::kafka::types::{FinalOffsetReport, KafkaMessage, NO_CATCH_UP_TARGET, OFFSET_NEWEST};
use crate::metrics::{ErrorSource, MetricsRecorder};

/// Lifecycle of one partition consumer. Only moves forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PartitionRunState {
    StartingUp,
    CatchingUp,
    CaughtUp,
    Draining,
    Closed,
}

impl PartitionRunState {
    pub fn can_transition_to(self, next: PartitionRunState) -> bool {
        use PartitionRunState::{CatchingUp, CaughtUp, Closed, Draining, StartingUp};

        matches!(
            (self, next),
            (StartingUp, CatchingUp)
                | (CatchingUp, CaughtUp)
                | (StartingUp | CatchingUp | CaughtUp, Draining)
                | (Draining, Closed)
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            PartitionRunState::StartingUp => "starting_up",
            PartitionRunState::CatchingUp => "catching_up",
            PartitionRunState::CaughtUp => "caught_up",
            PartitionRunState::Draining => "draining",
            PartitionRunState::Closed => "closed",
        }
    }
}

/// Where one partition starts and what it has to reach to be caught up
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct PartitionPlan {
    pub partition: i32,
    pub start_offset: i64,
    pub catch_up_target: i64,
}

impl PartitionPlan {
    /// Nothing to read before this partition counts as caught up
    pub fn caught_up_at_start(&self) -> bool {
        self.catch_up_target == NO_CATCH_UP_TARGET
            || self.start_offset == OFFSET_NEWEST
            || (self.start_offset >= 0 && self.start_offset > self.catch_up_target)
    }
}

/// Everything the consumers of one `consume_topic` call share
#[derive(Clone)]
pub(crate) struct PartitionContext {
    pub topic: String,
    pub broker: Arc<dyn BrokerClient>,
    pub handler: Arc<dyn MessageHandler>,
    pub unmarshaler: Arc<dyn Unmarshaler>,
    pub metrics: Arc<dyn MetricsRecorder>,
    pub stream_buffer_size: usize,
    pub exit_after_caught_up: bool,
}

pub(crate) struct PartitionConsumer {
    context: PartitionContext,
    plan: PartitionPlan,
    catch_up: CatchUpToken,
    reports: mpsc::Sender<FinalOffsetReport>,
    state: PartitionRunState,
    current_offset: i64,
}

impl PartitionConsumer {
    pub fn new(
        context: PartitionContext,
        plan: PartitionPlan,
        catch_up: CatchUpToken,
        reports: mpsc::Sender<FinalOffsetReport>,
    ) -> Self {
        Self {
            context,
            current_offset: plan.start_offset,
            plan,
            catch_up,
            reports,
            state: PartitionRunState::StartingUp,
        }
    }

    /// Consume until cancelled, caught up (when asked to exit then), or the stream ends,
    /// then send the final offset report
    pub async fn run(mut self, cancel: CancellationToken) {
        info!(
            topic = self.context.topic.as_str(),
            partition = self.plan.partition,
            start_offset = self.plan.start_offset,
            catch_up_target = self.plan.catch_up_target,
            "Starting partition consumer"
        );

        let report = self.consume(&cancel).await;
        self.transition(PartitionRunState::Closed);

        debug!(
            topic = self.context.topic.as_str(),
            partition = report.partition,
            final_offset = report.offset,
            failed = report.error.is_some(),
            "Partition consumer closed"
        );

        if self.reports.send(report).await.is_err() {
            warn!(
                topic = self.context.topic.as_str(),
                partition = self.plan.partition,
                "Final offset report dropped, aggregator is gone"
            );
        }
    }

    async fn consume(&mut self, cancel: &CancellationToken) -> FinalOffsetReport {
        let mut stream = match PartitionStream::open(
            self.context.broker.as_ref(),
            self.context.metrics.clone(),
            &self.context.topic,
            self.plan.partition,
            self.plan.start_offset,
            self.context.stream_buffer_size,
        )
        .await
        {
            Ok(stream) => stream,
            Err(source) => return self.open_failed(source),
        };

        self.transition(PartitionRunState::CatchingUp);

        if self.plan.caught_up_at_start() {
            self.mark_caught_up();
            if self.context.exit_after_caught_up {
                return self.finish(stream).await;
            }
        }

        let mut errors_open = true;
        loop {
            let (messages, errors) = stream.channels();
            tokio::select! {
                biased;

                _ = cancel.cancelled() => {
                    debug!(
                        topic = self.context.topic.as_str(),
                        partition = self.plan.partition,
                        offset = self.current_offset,
                        "Partition consumer cancelled"
                    );
                    break;
                }

                message = messages.recv() => match message {
                    Some(message) => {
                        let caught_up_now = self.handle_message(cancel, &message).await;
                        if caught_up_now && self.context.exit_after_caught_up {
                            break;
                        }
                    }
                    None => {
                        debug!(
                            topic = self.context.topic.as_str(),
                            partition = self.plan.partition,
                            "Partition stream ended"
                        );
                        break;
                    }
                },

                error = errors.recv(), if errors_open => match error {
                    Some(error) => self.record_broker_error(&error),
                    None => errors_open = false,
                },
            }
        }

        self.finish(stream).await
    }

    /// Returns true if this message caught the partition up
    async fn handle_message(&mut self, cancel: &CancellationToken, message: &KafkaMessage) -> bool {
        let topic = self.context.topic.as_str();
        let partition = self.plan.partition;
        self.current_offset = message.offset();

        let started = Instant::now();
        let result = self
            .context
            .handler
            .handle_message(cancel, message, self.context.unmarshaler.as_ref())
            .await;
        self.context
            .metrics
            .processing_time(topic, partition, started.elapsed());

        match result {
            Ok(()) => self.context.metrics.message_processed(topic, partition),
            Err(e) => {
                warn!(
                    topic,
                    partition,
                    offset = message.offset(),
                    error = ?e,
                    "Handler failed to process message"
                );
                self.context
                    .metrics
                    .processing_error(topic, partition, ErrorSource::Handler);
            }
        }

        if !self.catch_up.is_released() && message.offset() >= self.plan.catch_up_target {
            self.mark_caught_up();
            return true;
        }
        false
    }

    fn record_broker_error(&self, error: &BrokerError) {
        warn!(
            topic = self.context.topic.as_str(),
            partition = self.plan.partition,
            error = %error,
            error_type = error.error_type(),
            "Error received from partition stream"
        );
        self.context.metrics.processing_error(
            &self.context.topic,
            self.plan.partition,
            ErrorSource::Broker,
        );
    }

    fn mark_caught_up(&mut self) {
        if !self.catch_up.release() {
            return;
        }
        self.transition(PartitionRunState::CaughtUp);
        self.context
            .metrics
            .partition_caught_up(&self.context.topic, self.plan.partition);
        info!(
            topic = self.context.topic.as_str(),
            partition = self.plan.partition,
            offset = self.current_offset,
            catch_up_target = self.plan.catch_up_target,
            "Partition caught up"
        );
    }

    fn open_failed(&mut self, source: BrokerError) -> FinalOffsetReport {
        error!(
            topic = self.context.topic.as_str(),
            partition = self.plan.partition,
            offset = self.plan.start_offset,
            error = %source,
            "Failed to open partition stream"
        );
        self.context
            .metrics
            .partition_open_failed(&self.context.topic, self.plan.partition);
        self.catch_up.release();
        self.transition(PartitionRunState::Draining);

        self.report(Some(PartitionError::StreamOpen {
            topic: self.context.topic.clone(),
            partition: self.plan.partition,
            offset: self.plan.start_offset,
            source,
        }))
    }

    async fn finish(&mut self, stream: PartitionStream) -> FinalOffsetReport {
        self.transition(PartitionRunState::Draining);

        // Leaving before the target still counts down, or waiters would hang
        if self.catch_up.release() {
            debug!(
                topic = self.context.topic.as_str(),
                partition = self.plan.partition,
                "Released catch-up before reaching target"
            );
        }

        let error = match stream.close().await {
            Ok(()) => None,
            Err(source) => {
                warn!(
                    topic = self.context.topic.as_str(),
                    partition = self.plan.partition,
                    error = %source,
                    "Partition stream closed with error"
                );
                Some(PartitionError::StreamFailed {
                    topic: self.context.topic.clone(),
                    partition: self.plan.partition,
                    source,
                })
            }
        };

        self.report(error)
    }

    fn report(&self, error: Option<PartitionError>) -> FinalOffsetReport {
        FinalOffsetReport {
            partition: self.plan.partition,
            offset: self.current_offset,
            error,
        }
    }

    fn transition(&mut self, next: PartitionRunState) {
        debug_assert!(
            self.state.can_transition_to(next),
            "invalid partition state transition {} -> {}",
            self.state.as_str(),
            next.as_str()
        );
        self.state = next;
    }
}
