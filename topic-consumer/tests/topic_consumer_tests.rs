use std::sync::Arc;
use std::time::Duration;

use tokio::sync::oneshot;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;

use topic_consumer::test_utils::{MockBroker, RecordingHandler, TestMetrics};
use topic_consumer::{
    CaughtUpSignal, ConsumeError, ConsumeOptions, ConsumeOutcome, JsonUnmarshaler,
    PartitionError, PartitionOffsets, TopicConsumer, TopicConsumption, OFFSET_NEWEST,
    OFFSET_OLDEST,
};

const WAIT: Duration = Duration::from_secs(5);

struct TestSetup {
    broker: Arc<MockBroker>,
    metrics: Arc<TestMetrics>,
    consumer: TopicConsumer,
}

fn setup() -> TestSetup {
    let broker = Arc::new(MockBroker::new());
    let metrics = Arc::new(TestMetrics::default());
    let consumer = TopicConsumer::new(broker.clone(), Arc::new(JsonUnmarshaler), metrics.clone())
        .with_stream_buffer_size(16);
    TestSetup {
        broker,
        metrics,
        consumer,
    }
}

async fn join(consumption: TopicConsumption) -> ConsumeOutcome {
    timeout(WAIT, consumption.join())
        .await
        .expect("consumption should finish")
        .expect("aggregator should not fail")
}

async fn wait_caught_up(signal: &CaughtUpSignal) {
    timeout(WAIT, signal.wait())
        .await
        .expect("topic should catch up");
}

async fn wait_until(mut condition: impl FnMut() -> bool) {
    timeout(WAIT, async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("condition should become true");
}

#[tokio::test]
async fn test_every_partition_catches_up_once() {
    let TestSetup {
        broker,
        metrics,
        consumer,
    } = setup();
    broker.create_topic("orders", 5);
    for partition in 0..5 {
        // One message at offset 1 per partition, so newest is 2 and the target is 1
        broker.set_first_offset("orders", partition, 1);
        broker.produce("orders", partition, r#"{"order": 1}"#);
    }

    let handler = Arc::new(RecordingHandler::new());
    let signal = CaughtUpSignal::new();
    let start = PartitionOffsets::uniform(&[0, 1, 2, 3, 4], 0);

    let consumption = consumer
        .consume_topic(
            &CancellationToken::new(),
            "orders",
            &start,
            handler.clone(),
            ConsumeOptions::default()
                .with_caught_up(signal.clone())
                .with_exit_after_caught_up(true),
        )
        .await
        .unwrap();
    assert_eq!(consumption.partitions(), &[0, 1, 2, 3, 4]);

    wait_caught_up(&signal).await;
    let outcome = join(consumption).await;

    let expected: PartitionOffsets = (0..5).map(|p| (p, 1)).collect();
    assert_eq!(outcome.offsets, expected);
    assert!(outcome.is_complete());
    for partition in 0..5 {
        assert_eq!(handler.offsets_for(partition), vec![1]);
        assert_eq!(metrics.caught_up(partition), 1);
    }
    assert_eq!(signal.remaining(), 0);
}

#[tokio::test]
async fn test_empty_partition_is_caught_up_immediately() {
    let TestSetup {
        broker, consumer, ..
    } = setup();
    broker.create_topic("orders", 1);

    let handler = Arc::new(RecordingHandler::new());
    let signal = CaughtUpSignal::new();
    let consumption = consumer
        .consume_topic_from_beginning(
            &CancellationToken::new(),
            "orders",
            handler.clone(),
            ConsumeOptions::default().with_caught_up(signal.clone()),
        )
        .await
        .unwrap();

    wait_caught_up(&signal).await;
    consumption.cancel();
    let outcome = join(consumption).await;

    assert_eq!(outcome.offsets.get(0), Some(OFFSET_OLDEST));
    assert_eq!(handler.count(), 0);
}

#[tokio::test]
async fn test_exit_after_caught_up_does_not_wait_for_more_messages() {
    let TestSetup {
        broker, consumer, ..
    } = setup();
    broker.create_topic("orders", 1);
    broker.produce("orders", 0, "{}");

    let handler = Arc::new(RecordingHandler::new());
    let consumption = consumer
        .consume_topic_from_beginning(
            &CancellationToken::new(),
            "orders",
            handler.clone(),
            ConsumeOptions::default().with_exit_after_caught_up(true),
        )
        .await
        .unwrap();

    let outcome = join(consumption).await;
    assert_eq!(outcome.offsets.get(0), Some(0));
    assert_eq!(handler.offsets_for(0), vec![0]);
}

#[tokio::test]
async fn test_discovery_failure_spawns_nothing() {
    let TestSetup {
        broker, consumer, ..
    } = setup();
    let signal = CaughtUpSignal::new();

    let result = consumer
        .consume_topic_from_beginning(
            &CancellationToken::new(),
            "missing-topic",
            Arc::new(RecordingHandler::new()),
            ConsumeOptions::default().with_caught_up(signal.clone()),
        )
        .await;

    assert!(matches!(result, Err(ConsumeError::Discovery { .. })));
    assert!(broker.open_attempts().is_empty());
    assert!(signal.is_caught_up());
}

#[tokio::test]
async fn test_broker_failure_during_discovery() {
    let TestSetup {
        broker, consumer, ..
    } = setup();
    broker.create_topic("orders", 2);
    broker.fail_discovery("orders");

    let result = consumer
        .consume_topic_from_beginning(
            &CancellationToken::new(),
            "orders",
            Arc::new(RecordingHandler::new()),
            ConsumeOptions::default(),
        )
        .await;

    match result {
        Err(e @ ConsumeError::Discovery { .. }) => assert_eq!(e.error_type(), "discovery"),
        other => panic!("expected discovery error, got {other:?}"),
    }
    assert!(broker.open_attempts().is_empty());
}

#[tokio::test]
async fn test_cancel_before_catch_up_releases_waiters() {
    let TestSetup {
        broker, consumer, ..
    } = setup();
    broker.create_topic("orders", 3);
    for partition in 0..3 {
        for _ in 0..50 {
            broker.produce("orders", partition, "{}");
        }
    }

    let handler = Arc::new(RecordingHandler::new().with_delay(Duration::from_millis(20)));
    let signal = CaughtUpSignal::new();
    let ctx = CancellationToken::new();
    let consumption = consumer
        .consume_topic_from_beginning(
            &ctx,
            "orders",
            handler.clone(),
            ConsumeOptions::default().with_caught_up(signal.clone()),
        )
        .await
        .unwrap();

    wait_until(|| handler.count() >= 3).await;
    assert!(!signal.is_caught_up());

    // Cancelling the caller's context reaches every partition of the call
    ctx.cancel();
    wait_caught_up(&signal).await;
    let outcome = join(consumption).await;

    assert_eq!(outcome.offsets.len(), 3);
    for partition in 0..3 {
        let handled = handler.offsets_for(partition);
        let last = outcome.offsets.get(partition).unwrap();
        assert!(last < 49, "partition {partition} should stop early");
        match handled.last() {
            Some(&offset) => assert_eq!(last, offset),
            None => assert_eq!(last, OFFSET_OLDEST),
        }
    }
}

#[tokio::test]
async fn test_stream_open_failure_is_isolated_to_its_partition() {
    let TestSetup {
        broker,
        metrics,
        consumer,
    } = setup();
    broker.create_topic("orders", 3);
    for partition in 0..3 {
        broker.produce("orders", partition, "{}");
        broker.produce("orders", partition, "{}");
    }
    broker.fail_stream_open("orders", 1);

    let handler = Arc::new(RecordingHandler::new());
    let signal = CaughtUpSignal::new();
    let (results_tx, results_rx) = oneshot::channel();
    let consumption = consumer
        .consume_topic_from_beginning(
            &CancellationToken::new(),
            "orders",
            handler.clone(),
            ConsumeOptions::default()
                .with_caught_up(signal.clone())
                .with_results(results_tx)
                .with_exit_after_caught_up(true),
        )
        .await
        .unwrap();

    wait_caught_up(&signal).await;
    let outcome = timeout(WAIT, results_rx)
        .await
        .expect("results should be delivered")
        .unwrap();

    assert_eq!(outcome.offsets.len(), 3);
    assert_eq!(outcome.offsets.get(0), Some(1));
    assert_eq!(outcome.offsets.get(1), Some(OFFSET_OLDEST));
    assert_eq!(outcome.offsets.get(2), Some(1));
    assert!(!outcome.is_complete());
    assert!(matches!(
        outcome.failures.get(&1),
        Some(PartitionError::StreamOpen { partition: 1, .. })
    ));
    assert_eq!(outcome.failures.len(), 1);
    assert_eq!(metrics.open_failures(1), 1);
    assert!(handler.offsets_for(1).is_empty());

    // join() yields the same outcome the results channel carried
    let joined = join(consumption).await;
    assert_eq!(joined.offsets, outcome.offsets);
}

#[tokio::test]
async fn test_panicking_handler_is_reported_as_aborted() {
    let TestSetup {
        broker, consumer, ..
    } = setup();
    broker.create_topic("orders", 2);
    for partition in 0..2 {
        broker.produce("orders", partition, "{}");
        broker.produce("orders", partition, "{}");
    }

    let handler = Arc::new(RecordingHandler::new().panicking_at(&[(1, 0)]));
    let signal = CaughtUpSignal::new();
    let (results_tx, results_rx) = oneshot::channel();
    let consumption = consumer
        .consume_topic_from_beginning(
            &CancellationToken::new(),
            "orders",
            handler.clone(),
            ConsumeOptions::default()
                .with_caught_up(signal.clone())
                .with_results(results_tx)
                .with_exit_after_caught_up(true),
        )
        .await
        .unwrap();

    // The dead loop's catch-up token is released while it unwinds
    wait_caught_up(&signal).await;
    let outcome = timeout(WAIT, results_rx)
        .await
        .expect("results should be delivered")
        .unwrap();

    assert_eq!(outcome.offsets.len(), 2);
    assert_eq!(outcome.offsets.get(0), Some(1));
    assert_eq!(outcome.offsets.get(1), Some(OFFSET_OLDEST));
    assert!(matches!(
        outcome.failures.get(&1),
        Some(PartitionError::Aborted { partition: 1, .. })
    ));
    assert_eq!(outcome.failures.len(), 1);
    assert_eq!(handler.offsets_for(1), vec![0]);

    let joined = join(consumption).await;
    assert_eq!(joined.offsets, outcome.offsets);

    timeout(WAIT, consumer.close())
        .await
        .expect("close should not wait on the dead loop");
    assert!(consumer.is_closed());
}

#[tokio::test]
async fn test_messages_are_handled_in_offset_order() {
    let TestSetup {
        broker, consumer, ..
    } = setup();
    broker.create_topic("orders", 2);
    for partition in 0..2 {
        for i in 0..20 {
            broker.produce("orders", partition, &format!(r#"{{"n": {i}}}"#));
        }
    }

    let handler = Arc::new(RecordingHandler::new().failing_at(&[(0, 3), (1, 7)]));
    let consumption = consumer
        .consume_topic_from_beginning(
            &CancellationToken::new(),
            "orders",
            handler.clone(),
            ConsumeOptions::default().with_exit_after_caught_up(true),
        )
        .await
        .unwrap();
    let outcome = join(consumption).await;

    let expected: Vec<i64> = (0..20).collect();
    assert_eq!(handler.offsets_for(0), expected);
    assert_eq!(handler.offsets_for(1), expected);
    assert_eq!(outcome.offsets.get(0), Some(19));
    assert_eq!(outcome.offsets.get(1), Some(19));
}

#[tokio::test]
async fn test_missing_start_offset_is_rejected() {
    let TestSetup {
        broker, consumer, ..
    } = setup();
    broker.create_topic("orders", 3);
    let start: PartitionOffsets = vec![(0, 0), (2, 0)].into_iter().collect();

    let result = consumer
        .consume_topic(
            &CancellationToken::new(),
            "orders",
            &start,
            Arc::new(RecordingHandler::new()),
            ConsumeOptions::default(),
        )
        .await;

    assert!(matches!(
        result,
        Err(ConsumeError::MissingOffset { partition: 1, .. })
    ));
    assert!(broker.open_attempts().is_empty());
}

#[tokio::test]
async fn test_from_latest_skips_existing_messages() {
    let TestSetup {
        broker, consumer, ..
    } = setup();
    broker.create_topic("orders", 2);
    broker.produce("orders", 0, r#"{"old": true}"#);
    broker.produce("orders", 1, r#"{"old": true}"#);

    let handler = Arc::new(RecordingHandler::new());
    let (results_tx, results_rx) = oneshot::channel();
    let consumption = consumer
        .consume_topic_from_latest(
            &CancellationToken::new(),
            "orders",
            handler.clone(),
            Some(results_tx),
        )
        .await
        .unwrap();

    wait_until(|| broker.open_attempts().len() == 2).await;
    assert!(broker
        .open_attempts()
        .iter()
        .all(|(_, _, offset)| *offset == OFFSET_NEWEST));

    broker.produce("orders", 0, r#"{"old": false}"#);
    wait_until(|| handler.count() == 1).await;

    consumption.cancel();
    let outcome = timeout(WAIT, results_rx).await.unwrap().unwrap();

    assert_eq!(handler.calls(), vec![(0, 1)]);
    assert_eq!(outcome.offsets.get(0), Some(1));
    assert_eq!(outcome.offsets.get(1), Some(OFFSET_NEWEST));
}

#[tokio::test]
async fn test_close_stops_running_calls_and_rejects_new_ones() {
    let TestSetup {
        broker, consumer, ..
    } = setup();
    broker.create_topic("orders", 2);
    broker.produce("orders", 0, "{}");

    let consumption = consumer
        .consume_topic_from_beginning(
            &CancellationToken::new(),
            "orders",
            Arc::new(RecordingHandler::new()),
            ConsumeOptions::default(),
        )
        .await
        .unwrap();

    timeout(WAIT, consumer.close())
        .await
        .expect("close should not hang");
    assert!(consumer.is_closed());

    let outcome = join(consumption).await;
    assert_eq!(outcome.offsets.len(), 2);

    let result = consumer
        .consume_topic_from_beginning(
            &CancellationToken::new(),
            "orders",
            Arc::new(RecordingHandler::new()),
            ConsumeOptions::default(),
        )
        .await;
    assert!(matches!(result, Err(ConsumeError::Closed)));
}

#[tokio::test]
async fn test_consumption_continues_past_target_until_cancelled() {
    let TestSetup {
        broker, consumer, ..
    } = setup();
    broker.create_topic("orders", 1);
    broker.produce("orders", 0, "{}");

    let handler = Arc::new(RecordingHandler::new());
    let signal = CaughtUpSignal::new();
    let consumption = consumer
        .consume_topic_from_beginning(
            &CancellationToken::new(),
            "orders",
            handler.clone(),
            ConsumeOptions::default().with_caught_up(signal.clone()),
        )
        .await
        .unwrap();

    wait_caught_up(&signal).await;
    broker.produce("orders", 0, "{}");
    broker.produce("orders", 0, "{}");
    wait_until(|| handler.count() == 3).await;

    consumption.cancel();
    let outcome = join(consumption).await;
    assert_eq!(outcome.offsets.get(0), Some(2));
    assert_eq!(handler.offsets_for(0), vec![0, 1, 2]);
}
