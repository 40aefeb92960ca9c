use std::sync::Arc;

use anyhow::{Context, Result};
use axum::{routing::get, Router};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use topic_consumer::config::{Config, StartPosition};
use topic_consumer::kafka::KafkaBrokerClient;
use topic_consumer::metrics::{serve, setup_metrics_routes};
use topic_consumer::{
    CaughtUpSignal, ConsumeOptions, ConsumerMetrics, JsonUnmarshaler, LoggingHandler,
    TopicConsumer,
};

pub async fn index() -> &'static str {
    "topic consumer"
}

fn start_server(config: &Config) -> JoinHandle<()> {
    let router = Router::new()
        .route("/", get(index))
        .route("/_readiness", get(index))
        .route("/_liveness", get(|| std::future::ready("ok")));
    let router = setup_metrics_routes(router);

    let bind = config.bind_address();

    tokio::task::spawn(async move {
        serve(router, &bind)
            .await
            .expect("failed to start serving metrics");
    })
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    info!("Starting topic consumer");

    let config = Config::init_with_defaults()
        .context("Failed to load configuration from environment variables")?;
    let start_position = config.start_position()?;
    info!("Configuration loaded: {:?}", config);

    let server_handle = start_server(&config);
    info!("Started metrics server on {}", config.bind_address());

    let broker = KafkaBrokerClient::new(config.to_client_config(), config.metadata_timeout())
        .context("Failed to create Kafka client")?;
    let consumer = TopicConsumer::new(
        Arc::new(broker),
        Arc::new(JsonUnmarshaler),
        Arc::new(ConsumerMetrics::new(&config.kafka_client_id)),
    )
    .with_stream_buffer_size(config.partition_buffer_size);

    let ctx = CancellationToken::new();
    let handler = Arc::new(LoggingHandler::new());
    let caught_up = CaughtUpSignal::new();
    let (results_tx, mut results_rx) = oneshot::channel();
    let topic = config.kafka_consumer_topic.as_str();

    let consumption = match start_position {
        StartPosition::Earliest => {
            let options = ConsumeOptions::default()
                .with_caught_up(caught_up.clone())
                .with_results(results_tx)
                .with_exit_after_caught_up(config.exit_after_caught_up);
            consumer
                .consume_topic_from_beginning(&ctx, topic, handler.clone(), options)
                .await?
        }
        StartPosition::Latest => {
            consumer
                .consume_topic_from_latest(&ctx, topic, handler.clone(), Some(results_tx))
                .await?
        }
    };
    info!(
        topic,
        partitions = ?consumption.partitions(),
        "Consuming topic"
    );

    // Reading from latest has nothing to catch up to
    let mut caught_up_reported = start_position == StartPosition::Latest;
    let outcome = loop {
        tokio::select! {
            _ = caught_up.wait(), if !caught_up_reported => {
                info!(topic, handled = handler.handled(), "Topic caught up");
                caught_up_reported = true;
            }
            _ = tokio::signal::ctrl_c() => {
                info!("Shutdown signal received, stopping consumption");
                consumption.cancel();
            }
            outcome = &mut results_rx => {
                break outcome.context("Consumption ended without reporting offsets")?;
            }
        }
    };

    for (partition, error) in &outcome.failures {
        warn!(topic, partition, error = %error, "Partition did not finish cleanly");
    }
    info!(
        topic,
        offsets = serde_json::to_string(&outcome.offsets)?.as_str(),
        handled = handler.handled(),
        "Final offsets"
    );

    consumer.close().await;
    server_handle.abort();

    Ok(())
}
