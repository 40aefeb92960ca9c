use std::time::Duration;

use axum::{routing::get, Router};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};

use crate::metrics_consts::{
    ERRORS_CONSUMED, MESSAGES_CONSUMED, MESSAGES_PROCESSED, MESSAGE_PROCESSING_TIME,
    PARTITIONS_CAUGHT_UP, PARTITION_OPEN_FAILURES, PROCESSING_ERRORS,
};

/// Where a processing error came from, used as the `source` label
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorSource {
    /// The application's message handler returned an error
    Handler,
    /// The broker reported an error on the partition stream
    Broker,
}

impl ErrorSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorSource::Handler => "handler",
            ErrorSource::Broker => "broker",
        }
    }
}

/// Recording interface for per-partition consumption metrics.
///
/// Every series is labelled by topic and partition; implementations may add their own
/// labels (`ConsumerMetrics` adds the client id).
pub trait MetricsRecorder: Send + Sync {
    fn message_consumed(&self, topic: &str, partition: i32);

    fn error_consumed(&self, topic: &str, partition: i32);

    fn message_processed(&self, topic: &str, partition: i32);

    fn processing_error(&self, topic: &str, partition: i32, source: ErrorSource);

    fn processing_time(&self, topic: &str, partition: i32, elapsed: Duration);

    fn partition_caught_up(&self, _topic: &str, _partition: i32) {}

    fn partition_open_failed(&self, _topic: &str, _partition: i32) {}
}

/// `MetricsRecorder` backed by the `metrics` facade. Series are registered lazily by the
/// installed recorder the first time a label set is seen.
#[derive(Debug, Clone)]
pub struct ConsumerMetrics {
    client_id: String,
}

impl ConsumerMetrics {
    pub fn new(client_id: &str) -> Self {
        Self {
            client_id: client_id.to_string(),
        }
    }

    fn labels(&self, topic: &str, partition: i32) -> [(&'static str, String); 3] {
        [
            ("topic", topic.to_string()),
            ("partition", partition.to_string()),
            ("client", self.client_id.clone()),
        ]
    }
}

impl MetricsRecorder for ConsumerMetrics {
    fn message_consumed(&self, topic: &str, partition: i32) {
        metrics::counter!(MESSAGES_CONSUMED, &self.labels(topic, partition)).increment(1);
    }

    fn error_consumed(&self, topic: &str, partition: i32) {
        metrics::counter!(ERRORS_CONSUMED, &self.labels(topic, partition)).increment(1);
    }

    fn message_processed(&self, topic: &str, partition: i32) {
        metrics::counter!(MESSAGES_PROCESSED, &self.labels(topic, partition)).increment(1);
    }

    fn processing_error(&self, topic: &str, partition: i32, source: ErrorSource) {
        let [topic, partition, client] = self.labels(topic, partition);
        metrics::counter!(
            PROCESSING_ERRORS,
            &[topic, partition, client, ("source", source.as_str().to_string())]
        )
        .increment(1);
    }

    fn processing_time(&self, topic: &str, partition: i32, elapsed: Duration) {
        metrics::histogram!(MESSAGE_PROCESSING_TIME, &self.labels(topic, partition))
            .record(elapsed.as_secs_f64());
    }

    fn partition_caught_up(&self, topic: &str, partition: i32) {
        metrics::counter!(PARTITIONS_CAUGHT_UP, &self.labels(topic, partition)).increment(1);
    }

    fn partition_open_failed(&self, topic: &str, partition: i32) {
        metrics::counter!(PARTITION_OPEN_FAILURES, &self.labels(topic, partition)).increment(1);
    }
}

/// Add the prometheus endpoint to a router, should be called last.
pub fn setup_metrics_routes(router: Router) -> Router {
    let recorder_handle = setup_metrics_recorder();

    router.route(
        "/metrics",
        get(move || std::future::ready(recorder_handle.render())),
    )
}

pub fn setup_metrics_recorder() -> PrometheusHandle {
    const EXPONENTIAL_SECONDS: &[f64] = &[
        0.0005, 0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0,
    ];

    PrometheusBuilder::new()
        .set_buckets(EXPONENTIAL_SECONDS)
        .expect("bucket list is not empty")
        .install_recorder()
        .expect("failed to install metrics recorder")
}

/// Bind a `TcpListener` on the provided bind address to serve a `Router` on it.
pub async fn serve(router: Router, bind: &str) -> Result<(), std::io::Error> {
    let listener = tokio::net::TcpListener::bind(bind).await?;

    axum::serve(listener, router).await?;

    Ok(())
}

/// Global debugging recorder shared by every unit test that asserts on metric values
#[cfg(test)]
pub(crate) mod testing {
    use metrics_util::debugging::{DebugValue, DebuggingRecorder, Snapshotter};
    use std::sync::OnceLock;

    /// Install the recorder on first use. Call this before emitting anything a test asserts
    /// on: handles created while no recorder is installed stay no-ops.
    pub(crate) fn snapshotter() -> &'static Snapshotter {
        static SNAPSHOTTER: OnceLock<Snapshotter> = OnceLock::new();
        SNAPSHOTTER.get_or_init(|| {
            let recorder = DebuggingRecorder::new();
            let snapshotter = recorder.snapshotter();
            drop(recorder.install());
            snapshotter
        })
    }

    fn find(name: &str, labels: &[(&str, &str)]) -> Option<DebugValue> {
        snapshotter()
            .snapshot()
            .into_vec()
            .into_iter()
            .find(|(key, _, _, _)| {
                key.key().name() == name
                    && labels.iter().all(|(k, v)| {
                        key.key()
                            .labels()
                            .any(|label| label.key() == *k && label.value() == *v)
                    })
            })
            .map(|(_, _, _, value)| value)
    }

    pub(crate) fn counter_value(name: &str, labels: &[(&str, &str)]) -> Option<u64> {
        match find(name, labels)? {
            DebugValue::Counter(v) => Some(v),
            _ => None,
        }
    }

    pub(crate) fn gauge_value(name: &str, labels: &[(&str, &str)]) -> Option<f64> {
        match find(name, labels)? {
            DebugValue::Gauge(v) => Some(v.0),
            _ => None,
        }
    }
}
