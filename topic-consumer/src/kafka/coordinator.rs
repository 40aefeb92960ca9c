//! Topic Coordinator - one consume call fans out to one consumer task per partition
//!
//! A call discovers the topic's partitions, resolves every partition's start offset and
//! catch-up target up front (failing fast before anything is spawned), then spawns the
//! partition consumers plus one aggregator task. The aggregator collects the final offset
//! reports into a single [`ConsumeOutcome`].

use std::sync::Arc;

use futures::future::try_join_all;
use metrics::Gauge;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

use crate::error::{ConsumeError, PartitionError};
use crate::handler::{MessageHandler, Unmarshaler};
use crate::kafka::broker::BrokerClient;
use crate::kafka::catch_up::{CatchUpToken, CaughtUpSignal};
use crate::kafka::partition_consumer::{PartitionConsumer, PartitionContext, PartitionPlan};
use crate::kafka::types::{
    ConsumeOutcome, FinalOffsetReport, PartitionOffsets, NO_CATCH_UP_TARGET, OFFSET_NEWEST,
    OFFSET_OLDEST,
};
use crate::metrics::MetricsRecorder;
use crate::metrics_consts::{ACTIVE_PARTITIONS, CONSUME_TOPIC_FAILURES};

/// Default bound of each partition stream's message and error channels
pub const DEFAULT_STREAM_BUFFER_SIZE: usize = 1000;

/// Per-call options for [`TopicConsumer::consume_topic`]
#[derive(Debug, Default)]
pub struct ConsumeOptions {
    /// Counted up once per partition of the call and down once each partition catches up
    pub caught_up: Option<CaughtUpSignal>,
    /// Receives the aggregated outcome once every partition consumer has exited
    pub results: Option<oneshot::Sender<ConsumeOutcome>>,
    /// Stop each partition as soon as it reaches its catch-up target
    pub exit_after_caught_up: bool,
}

impl ConsumeOptions {
    pub fn with_caught_up(mut self, signal: CaughtUpSignal) -> Self {
        self.caught_up = Some(signal);
        self
    }

    pub fn with_results(mut self, results: oneshot::Sender<ConsumeOutcome>) -> Self {
        self.results = Some(results);
        self
    }

    pub fn with_exit_after_caught_up(mut self, exit: bool) -> Self {
        self.exit_after_caught_up = exit;
        self
    }
}

/// Handle to one running consume call
#[derive(Debug)]
pub struct TopicConsumption {
    topic: String,
    partitions: Vec<i32>,
    cancel: CancellationToken,
    aggregator: JoinHandle<ConsumeOutcome>,
}

impl TopicConsumption {
    pub fn topic(&self) -> &str {
        &self.topic
    }

    /// Partitions this call spawned a consumer for
    pub fn partitions(&self) -> &[i32] {
        &self.partitions
    }

    /// Stop every partition consumer of this call
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Wait for every partition consumer to exit and return the aggregated outcome
    pub async fn join(self) -> Result<ConsumeOutcome, ConsumeError> {
        let Self {
            topic, aggregator, ..
        } = self;
        aggregator.await.map_err(|e| ConsumeError::Aggregation {
            topic,
            reason: e.to_string(),
        })
    }
}

/// Where the partitions of a call start
#[derive(Clone, Copy)]
enum StartOffsets<'a> {
    Explicit(&'a PartitionOffsets),
    Uniform(i64),
}

/// Coordinates concurrent consumption of whole topics
pub struct TopicConsumer {
    broker: Arc<dyn BrokerClient>,
    unmarshaler: Arc<dyn Unmarshaler>,
    metrics: Arc<dyn MetricsRecorder>,
    stream_buffer_size: usize,
    tasks: TaskTracker,
    shutdown: CancellationToken,
}

impl TopicConsumer {
    pub fn new(
        broker: Arc<dyn BrokerClient>,
        unmarshaler: Arc<dyn Unmarshaler>,
        metrics: Arc<dyn MetricsRecorder>,
    ) -> Self {
        Self {
            broker,
            unmarshaler,
            metrics,
            stream_buffer_size: DEFAULT_STREAM_BUFFER_SIZE,
            tasks: TaskTracker::new(),
            shutdown: CancellationToken::new(),
        }
    }

    pub fn with_stream_buffer_size(mut self, size: usize) -> Self {
        self.stream_buffer_size = size.max(1);
        self
    }

    pub fn is_closed(&self) -> bool {
        self.shutdown.is_cancelled()
    }

    /// Consume every partition of `topic`, starting each at its entry in `start_offsets`.
    ///
    /// Returns once all partition consumers are spawned. Discovery failures, a missing start
    /// offset and catch-up target lookups fail the call before anything is spawned. Per
    /// partition failures only show up in logs, metrics and the final outcome.
    ///
    /// Cancelling `ctx` (or the returned handle) stops every partition of this call.
    pub async fn consume_topic(
        &self,
        ctx: &CancellationToken,
        topic: &str,
        start_offsets: &PartitionOffsets,
        handler: Arc<dyn MessageHandler>,
        options: ConsumeOptions,
    ) -> Result<TopicConsumption, ConsumeError> {
        self.consume(
            ctx,
            topic,
            StartOffsets::Explicit(start_offsets),
            handler,
            options,
        )
        .await
    }

    /// Consume every partition of `topic` from the oldest retained message
    pub async fn consume_topic_from_beginning(
        &self,
        ctx: &CancellationToken,
        topic: &str,
        handler: Arc<dyn MessageHandler>,
        options: ConsumeOptions,
    ) -> Result<TopicConsumption, ConsumeError> {
        self.consume(
            ctx,
            topic,
            StartOffsets::Uniform(OFFSET_OLDEST),
            handler,
            options,
        )
        .await
    }

    /// Consume only messages produced from now on. Every partition is caught up from the
    /// start, so no catch-up signal is taken.
    pub async fn consume_topic_from_latest(
        &self,
        ctx: &CancellationToken,
        topic: &str,
        handler: Arc<dyn MessageHandler>,
        results: Option<oneshot::Sender<ConsumeOutcome>>,
    ) -> Result<TopicConsumption, ConsumeError> {
        let options = ConsumeOptions {
            results,
            ..Default::default()
        };
        self.consume(
            ctx,
            topic,
            StartOffsets::Uniform(OFFSET_NEWEST),
            handler,
            options,
        )
        .await
    }

    /// Cancel every running call and wait for all partition consumers and aggregators to
    /// finish. Later calls fail with [`ConsumeError::Closed`].
    pub async fn close(&self) {
        info!("Closing topic consumer");
        self.shutdown.cancel();
        self.tasks.close();
        self.tasks.wait().await;
        info!("Topic consumer closed");
    }

    async fn consume(
        &self,
        ctx: &CancellationToken,
        topic: &str,
        start_offsets: StartOffsets<'_>,
        handler: Arc<dyn MessageHandler>,
        options: ConsumeOptions,
    ) -> Result<TopicConsumption, ConsumeError> {
        let result = self
            .start_consumption(ctx, topic, start_offsets, handler, options)
            .await;

        if let Err(e) = &result {
            error!(topic, error = %e, "Failed to start topic consumption");
            metrics::counter!(
                CONSUME_TOPIC_FAILURES,
                "topic" => topic.to_string(),
                "error_type" => e.error_type()
            )
            .increment(1);
        }
        result
    }

    async fn start_consumption(
        &self,
        ctx: &CancellationToken,
        topic: &str,
        start_offsets: StartOffsets<'_>,
        handler: Arc<dyn MessageHandler>,
        options: ConsumeOptions,
    ) -> Result<TopicConsumption, ConsumeError> {
        if self.is_closed() {
            return Err(ConsumeError::Closed);
        }
        // Counts as a tracked task, so close() waits until this call has spawned or bailed
        let _in_flight = self.tasks.token();

        let partitions = self.discover_partitions(topic).await?;
        let plans = self.plan_partitions(topic, &partitions, start_offsets).await?;

        // Planning awaited the broker, close() may have run meanwhile
        if self.is_closed() {
            return Err(ConsumeError::Closed);
        }

        let ConsumeOptions {
            caught_up,
            results,
            exit_after_caught_up,
        } = options;

        let tokens = match &caught_up {
            Some(signal) => signal.register(plans.len()),
            None => (0..plans.len()).map(|_| CatchUpToken::detached()).collect(),
        };

        let context = PartitionContext {
            topic: topic.to_string(),
            broker: self.broker.clone(),
            handler,
            unmarshaler: self.unmarshaler.clone(),
            metrics: self.metrics.clone(),
            stream_buffer_size: self.stream_buffer_size,
            exit_after_caught_up,
        };
        let cancel = ctx.child_token();
        let (reports_tx, reports_rx) = mpsc::channel(plans.len());
        let active = metrics::gauge!(ACTIVE_PARTITIONS, "topic" => topic.to_string());

        for (plan, token) in plans.iter().copied().zip(tokens) {
            let consumer = PartitionConsumer::new(context.clone(), plan, token, reports_tx.clone());
            let cancel = cancel.clone();
            let active = ActivePartition::enter(active.clone());
            self.tasks.spawn(async move {
                let _active = active;
                consumer.run(cancel).await;
            });
        }
        // Only the consumers hold senders now, so the channel closes when the last one exits
        drop(reports_tx);

        let aggregator = self.tasks.spawn(aggregate(
            topic.to_string(),
            plans,
            reports_rx,
            cancel.clone(),
            self.shutdown.clone(),
            results,
        ));

        info!(
            topic,
            partitions = partitions.len(),
            exit_after_caught_up,
            "Started topic consumption"
        );

        Ok(TopicConsumption {
            topic: topic.to_string(),
            partitions,
            cancel,
            aggregator,
        })
    }

    async fn discover_partitions(&self, topic: &str) -> Result<Vec<i32>, ConsumeError> {
        let mut partitions =
            self.broker
                .partitions(topic)
                .await
                .map_err(|source| ConsumeError::Discovery {
                    topic: topic.to_string(),
                    source,
                })?;

        if partitions.is_empty() {
            return Err(ConsumeError::TopicNotFound {
                topic: topic.to_string(),
            });
        }
        partitions.sort_unstable();
        partitions.dedup();
        Ok(partitions)
    }

    async fn plan_partitions(
        &self,
        topic: &str,
        partitions: &[i32],
        start_offsets: StartOffsets<'_>,
    ) -> Result<Vec<PartitionPlan>, ConsumeError> {
        // Check every start offset before querying the broker at all
        let starts = partitions
            .iter()
            .map(|&partition| {
                let start_offset = match start_offsets {
                    StartOffsets::Explicit(offsets) => offsets.get(partition),
                    StartOffsets::Uniform(offset) => Some(offset),
                };
                start_offset
                    .map(|offset| (partition, offset))
                    .ok_or_else(|| ConsumeError::MissingOffset {
                        topic: topic.to_string(),
                        partition,
                    })
            })
            .collect::<Result<Vec<_>, _>>()?;

        try_join_all(
            starts
                .into_iter()
                .map(|(partition, start_offset)| async move {
                    let catch_up_target = self.resolve_catch_up_target(topic, partition).await?;
                    Ok::<_, ConsumeError>(PartitionPlan {
                        partition,
                        start_offset,
                        catch_up_target,
                    })
                }),
        )
        .await
    }

    /// Last offset present when the read begins, or `NO_CATCH_UP_TARGET` for a partition
    /// that currently holds no messages
    async fn resolve_catch_up_target(
        &self,
        topic: &str,
        partition: i32,
    ) -> Result<i64, ConsumeError> {
        let (oldest, newest) = self
            .broker
            .watermarks(topic, partition)
            .await
            .map_err(|source| ConsumeError::OffsetQuery {
                topic: topic.to_string(),
                partition,
                source,
            })?;

        let target = if newest <= oldest {
            NO_CATCH_UP_TARGET
        } else {
            newest - 1
        };
        debug!(
            topic,
            partition, oldest, newest, catch_up_target = target, "Resolved catch-up target"
        );
        Ok(target)
    }
}

/// Holds one unit of the active partitions gauge for as long as a consumer task runs,
/// including when it unwinds
struct ActivePartition(Gauge);

impl ActivePartition {
    fn enter(gauge: Gauge) -> Self {
        gauge.increment(1.0);
        Self(gauge)
    }
}

impl Drop for ActivePartition {
    fn drop(&mut self) {
        self.0.decrement(1.0);
    }
}

async fn aggregate(
    topic: String,
    plans: Vec<PartitionPlan>,
    mut reports: mpsc::Receiver<FinalOffsetReport>,
    cancel: CancellationToken,
    shutdown: CancellationToken,
    results: Option<oneshot::Sender<ConsumeOutcome>>,
) -> ConsumeOutcome {
    let mut outcome = ConsumeOutcome::new(&topic);
    let mut shutdown_forwarded = false;

    loop {
        tokio::select! {
            _ = shutdown.cancelled(), if !shutdown_forwarded => {
                debug!(topic = topic.as_str(), "Coordinator closing, cancelling consumption");
                cancel.cancel();
                shutdown_forwarded = true;
            }
            report = reports.recv() => match report {
                Some(report) => outcome.record(report),
                None => break,
            },
        }
    }

    for plan in &plans {
        if outcome.offsets.contains(plan.partition) {
            continue;
        }
        warn!(
            topic = topic.as_str(),
            partition = plan.partition,
            "Partition consumer exited without reporting a final offset"
        );
        outcome.record(FinalOffsetReport {
            partition: plan.partition,
            offset: plan.start_offset,
            error: Some(PartitionError::Aborted {
                topic: topic.clone(),
                partition: plan.partition,
            }),
        });
    }

    info!(
        topic = topic.as_str(),
        partitions = outcome.offsets.len(),
        failed_partitions = outcome.failures.len(),
        "Topic consumption finished"
    );

    if let Some(results) = results {
        if results.send(outcome.clone()).is_err() {
            debug!(topic = topic.as_str(), "Results receiver dropped");
        }
    }
    outcome
}
