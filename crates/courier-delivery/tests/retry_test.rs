//! Retry engine tests against the in-memory broker.
//!
//! Each test takes a real delivery off a provisioned queue and hands it to
//! the engine, then inspects where the message ended up.

use std::{sync::Arc, time::Duration};

use bytes::Bytes;
use courier_broker::{
    decode_routing_key,
    headers::{
        initial_retry_headers, read_i64, write_i64, ATTEMPT_NUMBER_HEADER,
        REMAINING_RETRIES_HEADER, RETRY_DELAY_BASE_HEADER,
    },
    BrokerHandle, DelayLadder, Delivery, FieldTable, OutboundMessage, QueueProvisioner,
    QueueRecord,
};
use courier_delivery::{RetryEngine, RetryOutcome};
use courier_testing::{MockBroker, Operation, OperationKind};
use futures::StreamExt;

struct Setup {
    broker: MockBroker,
    handle: Arc<BrokerHandle>,
    queue: Arc<QueueRecord>,
}

async fn setup() -> Setup {
    let broker = MockBroker::new();
    let handle = Arc::new(BrokerHandle::new(Arc::new(broker.clone())));
    handle.connect("amqp://mock").await.unwrap();
    DelayLadder::new().build(&handle).await.unwrap();
    let queue = QueueProvisioner::new(Arc::clone(&handle)).prepare("q").await.unwrap();
    broker.clear_operations();
    Setup { broker, handle, queue }
}

async fn take(setup: &Setup, headers: FieldTable) -> Delivery {
    let channel = setup.handle.borrow_channel().await.unwrap();
    let mut deliveries = channel.consume("q", "test").await.unwrap();
    let message = OutboundMessage {
        body: Bytes::from_static(br#"{"endpoint":"http://example.com"}"#),
        headers,
        content_type: Some("application/json".to_string()),
    };
    channel.publish("", "q", message).await.unwrap();
    let delivery = deliveries.next().await.unwrap().unwrap();
    channel.cancel("test").await.unwrap();
    setup.broker.clear_operations();
    delivery
}

fn ladder_publishes(broker: &MockBroker) -> Vec<String> {
    broker
        .operations()
        .into_iter()
        .filter_map(|op| match op {
            Operation::Publish { exchange, routing_key } if exchange == "delay-infra-27" => {
                Some(routing_key)
            },
            _ => None,
        })
        .collect()
}

/// Remaining retries r > 0 produce exactly one republish carrying r-1.
#[tokio::test]
async fn retry_republishes_once_with_updated_headers() {
    let setup = setup().await;
    let delivery = take(&setup, initial_retry_headers(3, 1)).await;

    let outcome = RetryEngine::new(Arc::clone(&setup.handle))
        .handle_failure(delivery, &setup.queue)
        .await
        .unwrap();

    assert_eq!(outcome, RetryOutcome::Redelivered { delay_seconds: 1 });
    let keys = ladder_publishes(&setup.broker);
    assert_eq!(keys.len(), 1);
    assert_eq!(decode_routing_key(&keys[0]).unwrap(), (1, "q"));
    assert_eq!(setup.broker.settlements().acked, 1);

    let waiting = setup.broker.messages("delay-queue-00");
    assert_eq!(waiting.len(), 1);
    assert_eq!(read_i64(&waiting[0].headers, REMAINING_RETRIES_HEADER).unwrap(), Some(2));
    assert_eq!(read_i64(&waiting[0].headers, ATTEMPT_NUMBER_HEADER).unwrap(), Some(1));
    assert_eq!(read_i64(&waiting[0].headers, RETRY_DELAY_BASE_HEADER).unwrap(), Some(1));
    assert_eq!(waiting[0].body, Bytes::from_static(br#"{"endpoint":"http://example.com"}"#));
}

/// The delay doubles with every recorded attempt.
#[tokio::test]
async fn delay_follows_attempt_number() {
    let setup = setup().await;
    let mut headers = initial_retry_headers(5, 1);
    write_i64(&mut headers, ATTEMPT_NUMBER_HEADER, 3);
    let delivery = take(&setup, headers).await;

    let outcome = RetryEngine::new(Arc::clone(&setup.handle))
        .handle_failure(delivery, &setup.queue)
        .await
        .unwrap();

    assert_eq!(outcome, RetryOutcome::Redelivered { delay_seconds: 8 });
    assert_eq!(setup.broker.queue_depth("delay-queue-03"), 1);
}

/// Zero remaining retries never publish; the message is dead-lettered.
#[tokio::test]
async fn exhausted_retries_never_publish() {
    let setup = setup().await;
    let delivery = take(&setup, initial_retry_headers(0, 1)).await;

    let outcome = RetryEngine::new(Arc::clone(&setup.handle))
        .handle_failure(delivery, &setup.queue)
        .await
        .unwrap();

    assert_eq!(outcome, RetryOutcome::DeadLettered);
    assert_eq!(setup.broker.operation_count(OperationKind::Publish), 0);
    assert_eq!(setup.broker.queue_depth("q-dead-letter-queue"), 1);
}

/// Messages without retry headers are dead-lettered.
#[tokio::test]
async fn missing_headers_dead_letter() {
    let setup = setup().await;
    let delivery = take(&setup, FieldTable::default()).await;

    let outcome = RetryEngine::new(Arc::clone(&setup.handle))
        .handle_failure(delivery, &setup.queue)
        .await
        .unwrap();

    assert_eq!(outcome, RetryOutcome::DeadLettered);
    assert_eq!(setup.broker.operation_count(OperationKind::Publish), 0);
}

/// A failed republish requeues the original untouched.
#[tokio::test]
async fn failed_publish_requeues_original() {
    let setup = setup().await;
    let delivery = take(&setup, initial_retry_headers(2, 1)).await;
    setup.broker.fail_next(OperationKind::Publish, 1);

    let outcome = RetryEngine::new(Arc::clone(&setup.handle))
        .handle_failure(delivery, &setup.queue)
        .await
        .unwrap();

    assert_eq!(outcome, RetryOutcome::Requeued);
    let requeued = setup.broker.messages("q");
    assert_eq!(requeued.len(), 1);
    assert!(requeued[0].redelivered);
    assert_eq!(read_i64(&requeued[0].headers, REMAINING_RETRIES_HEADER).unwrap(), Some(2));
    assert_eq!(read_i64(&requeued[0].headers, ATTEMPT_NUMBER_HEADER).unwrap(), None);
}

/// A republish the broker nacks after accepting it is not treated as
/// delivered; the original goes back on its queue instead of being acked.
#[tokio::test]
async fn nacked_republish_requeues_original() {
    let setup = setup().await;
    let delivery = take(&setup, initial_retry_headers(2, 1)).await;
    setup.broker.nack_next_publishes(1);

    let outcome = RetryEngine::new(Arc::clone(&setup.handle))
        .handle_failure(delivery, &setup.queue)
        .await
        .unwrap();

    assert_eq!(outcome, RetryOutcome::Requeued);
    assert_eq!(ladder_publishes(&setup.broker).len(), 1);
    assert_eq!(setup.broker.queue_depth("delay-queue-00"), 0);
    assert_eq!(setup.broker.settlements().acked, 0);
    assert_eq!(setup.broker.settlements().requeued, 1);

    let requeued = setup.broker.messages("q");
    assert_eq!(requeued.len(), 1);
    assert_eq!(read_i64(&requeued[0].headers, REMAINING_RETRIES_HEADER).unwrap(), Some(2));
}

/// Publishing into a torn-down ladder fails, so the original is requeued.
#[tokio::test]
async fn missing_ladder_requeues_original() {
    let setup = setup().await;
    let delivery = take(&setup, initial_retry_headers(2, 1)).await;
    DelayLadder::new().destroy(&setup.handle).await.unwrap();

    let outcome = RetryEngine::new(Arc::clone(&setup.handle))
        .handle_failure(delivery, &setup.queue)
        .await
        .unwrap();

    assert_eq!(outcome, RetryOutcome::Requeued);
    assert_eq!(setup.broker.settlements().requeued, 1);
    assert_eq!(setup.broker.settlements().acked, 0);
}

/// A retried message comes back to its own queue after the backoff.
#[tokio::test(start_paused = true)]
async fn retried_message_returns_after_backoff() {
    let setup = setup().await;
    let delivery = take(&setup, initial_retry_headers(2, 2)).await;

    RetryEngine::new(Arc::clone(&setup.handle))
        .handle_failure(delivery, &setup.queue)
        .await
        .unwrap();

    tokio::time::sleep(Duration::from_millis(1_900)).await;
    assert_eq!(setup.broker.queue_depth("q"), 0);

    tokio::time::sleep(Duration::from_millis(200)).await;
    let returned = setup.broker.messages("q");
    assert_eq!(returned.len(), 1);
    assert_eq!(read_i64(&returned[0].headers, REMAINING_RETRIES_HEADER).unwrap(), Some(1));
    assert_eq!(returned[0].content_type.as_deref(), Some("application/json"));
}
