//! Continuous pulling through the `consume` callback.

use std::sync::mpsc::{self, Receiver};
use std::thread;
use std::time::Duration;

use sourced_pull::{
    ConsumeContext, ConsumeOptions, ConsumerError, PullConsumer, RetryPolicy, Transport,
};

use crate::support::{publish, publish_n, setup, wait_until, RequestCounter, SUBJECT};

type Item = Result<String, ConsumerError>;

/// Start consuming, forwarding payloads and errors into a channel.
fn start(consumer: &PullConsumer, options: ConsumeOptions) -> (ConsumeContext, Receiver<Item>) {
    let (tx, rx) = mpsc::channel();
    let ctx = consumer
        .consume(
            move |item| {
                let item = item.map(|msg| {
                    msg.ack().unwrap();
                    msg.payload_str().unwrap().to_string()
                });
                let _ = tx.send(item);
            },
            options,
        )
        .unwrap();
    (ctx, rx)
}

fn receive(rx: &Receiver<Item>, count: usize) -> Vec<Item> {
    (0..count)
        .map(|_| rx.recv_timeout(Duration::from_secs(2)).unwrap())
        .collect()
}

fn received_payloads(rx: &Receiver<Item>, count: usize) -> Vec<String> {
    receive(rx, count)
        .into_iter()
        .map(|item| item.unwrap())
        .collect()
}

fn heartbeat_options() -> ConsumeOptions {
    ConsumeOptions::default()
        .with_expiry(Duration::from_secs(1))
        .with_idle_heartbeat(Duration::from_millis(100))
}

// ============================================================================
// Delivery and pacing
// ============================================================================

#[test]
fn consume_with_default_options() {
    let (server, consumer) = setup();
    let expected = publish_n(&server, 5);

    let (ctx, rx) = start(&consumer, ConsumeOptions::default());
    assert_eq!(received_payloads(&rx, 5), expected);
    ctx.stop();
    assert_eq!(ctx.stats().messages_delivered, 5);
}

#[test]
fn consume_batch_size_paces_pull_requests() {
    let (server, consumer) = setup();
    let requests = RequestCounter::attach(&server);
    publish(&server, &["m1", "m2", "m3", "m4", "m5"]);

    let (ctx, rx) = start(&consumer, ConsumeOptions::default().with_batch_size(2));
    assert_eq!(
        received_payloads(&rx, 5),
        vec!["m1", "m2", "m3", "m4", "m5"]
    );

    thread::sleep(Duration::from_millis(50));
    assert_eq!(requests.get(), 3);
    ctx.stop();
}

#[test]
fn consume_max_bytes_paces_pull_requests() {
    let (server, consumer) = setup();
    let requests = RequestCounter::attach(&server);
    let expected = publish_n(&server, 4);
    let reply = "$JS.ACK.foo.cons.1.1.1.".len() + 19 + ".0".len();
    let size = SUBJECT.len() + reply + 2;

    // every request fits one message; the next one closes it with 409
    let (ctx, rx) = start(
        &consumer,
        ConsumeOptions::default().with_max_bytes(size + size / 2),
    );
    assert_eq!(received_payloads(&rx, 4), expected);

    thread::sleep(Duration::from_millis(50));
    assert_eq!(requests.get(), 4);
    ctx.stop();
}

#[test]
fn consume_with_custom_expiry() {
    let (server, consumer) = setup();
    let requests = RequestCounter::attach(&server);
    let (ctx, rx) = start(
        &consumer,
        ConsumeOptions::default().with_expiry(Duration::from_millis(200)),
    );

    assert!(wait_until(Duration::from_secs(2), || requests.get() >= 3));
    publish(&server, &["m1"]);
    assert_eq!(received_payloads(&rx, 1), vec!["m1"]);
    assert_eq!(ctx.stats().heartbeats_missed, 0);
    ctx.stop();
}

// ============================================================================
// Messages larger than the byte ceiling
// ============================================================================

#[test]
fn consume_surfaces_a_message_larger_than_max_bytes() {
    let (server, consumer) = setup();
    let requests = RequestCounter::attach(&server);
    server.publish(SUBJECT, None, &[b'x'; 200]).unwrap();

    let (ctx, rx) = start(&consumer, ConsumeOptions::default().with_max_bytes(50));
    assert_eq!(
        receive(&rx, 1),
        vec![Err(ConsumerError::MessageTooLarge { max_bytes: 50 })]
    );

    // the refused request is not re-issued before the pause runs out
    thread::sleep(Duration::from_millis(200));
    assert_eq!(requests.get(), 1);
    assert_eq!(ctx.stats().requests_sent, 1);
    assert_eq!(ctx.stats().errors_surfaced, 1);
    assert!(!ctx.is_stopped());
    ctx.stop();
}

#[test]
fn retry_policy_bounds_oversized_message_failures() {
    let (server, consumer) = setup();
    server.publish(SUBJECT, None, &[b'x'; 200]).unwrap();
    let options = heartbeat_options()
        .with_max_bytes(50)
        .with_retry(RetryPolicy::default().with_max_attempts(1));

    let (ctx, rx) = start(&consumer, options);
    let too_large = Err(ConsumerError::MessageTooLarge { max_bytes: 50 });
    assert_eq!(receive(&rx, 2), vec![too_large.clone(), too_large]);

    let stats = ctx.join();
    assert_eq!(stats.requests_sent, 2);
    assert_eq!(stats.messages_delivered, 0);
    assert!(!consumer.has_active_subscription());
}

// ============================================================================
// Options and subscription guard
// ============================================================================

#[test]
fn consume_invalid_batch_size() {
    let (_server, consumer) = setup();
    let err = consumer
        .consume(|_| {}, ConsumeOptions::default().with_batch_size(0))
        .unwrap_err();
    assert!(matches!(err, ConsumerError::InvalidOption(_)));
}

#[test]
fn consume_invalid_expiry() {
    let (_server, consumer) = setup();
    let options = ConsumeOptions::default()
        .with_expiry(Duration::from_millis(50))
        .with_idle_heartbeat(Duration::from_millis(100));
    let err = consumer.consume(|_| {}, options).unwrap_err();
    assert!(matches!(err, ConsumerError::InvalidOption(_)));
    assert!(!consumer.has_active_subscription());
}

#[test]
fn consume_twice_is_rejected() {
    let (_server, consumer) = setup();
    let (ctx, _rx) = start(&consumer, ConsumeOptions::default());

    assert_eq!(
        consumer
            .consume(|_| {}, ConsumeOptions::default())
            .unwrap_err(),
        ConsumerError::ConsumerHasActiveSubscription
    );
    assert_eq!(
        consumer.messages(Default::default()).unwrap_err(),
        ConsumerError::ConsumerHasActiveSubscription
    );
    ctx.stop();
}

#[test]
fn stop_is_idempotent_and_allows_a_new_subscription() {
    let (server, consumer) = setup();
    let (ctx, rx) = start(&consumer, ConsumeOptions::default());
    publish(&server, &["m1"]);
    assert_eq!(received_payloads(&rx, 1), vec!["m1"]);

    ctx.stop();
    ctx.stop();
    assert!(ctx.is_stopped());
    assert!(!consumer.has_active_subscription());

    publish(&server, &["m2"]);
    let (again, rx) = start(&consumer, ConsumeOptions::default());
    assert_eq!(received_payloads(&rx, 1), vec!["m2"]);
    again.stop();
}

#[test]
fn no_callbacks_after_stop() {
    let (server, consumer) = setup();
    let (ctx, rx) = start(&consumer, ConsumeOptions::default());
    ctx.stop();
    let stats = ctx.join();

    publish(&server, &["m1"]);
    thread::sleep(Duration::from_millis(50));
    assert!(rx.try_recv().is_err());
    assert_eq!(stats.messages_delivered, 0);
}

// ============================================================================
// Liveness and recovery
// ============================================================================

#[test]
fn consume_surfaces_one_missed_heartbeat() {
    let (server, consumer) = setup();
    let (ctx, rx) = start(&consumer, heartbeat_options());
    server.shutdown();

    assert_eq!(receive(&rx, 1), vec![Err(ConsumerError::NoHeartbeat)]);
    assert!(rx.recv_timeout(Duration::from_millis(500)).is_err());
    assert_eq!(ctx.stats().heartbeats_missed, 1);
    assert!(!ctx.is_stopped());
    ctx.stop();
}

#[test]
fn consume_survives_server_restart() {
    let (server, consumer) = setup();
    let (ctx, rx) = start(&consumer, heartbeat_options());
    publish(&server, &["m1", "m2"]);
    assert_eq!(received_payloads(&rx, 2), vec!["m1", "m2"]);

    server.restart();
    publish(&server, &["m3", "m4"]);
    assert_eq!(received_payloads(&rx, 2), vec!["m3", "m4"]);
    ctx.stop();
}

#[test]
fn retry_policy_bounds_liveness_failures() {
    let (server, consumer) = setup();
    let options = heartbeat_options().with_retry(RetryPolicy::default().with_max_attempts(0));
    let (ctx, rx) = start(&consumer, options);
    server.shutdown();

    assert_eq!(receive(&rx, 1), vec![Err(ConsumerError::NoHeartbeat)]);
    assert!(wait_until(Duration::from_secs(1), || ctx.is_stopped()));
    assert!(!consumer.has_active_subscription());
}

#[test]
fn deleted_consumer_ends_consume() {
    let (server, consumer) = setup();
    let (ctx, rx) = start(&consumer, ConsumeOptions::default());
    server
        .delete_consumer(crate::support::STREAM, crate::support::CONSUMER)
        .unwrap();

    let items = receive(&rx, 1);
    assert!(matches!(
        items[0],
        Err(ConsumerError::ConsumerNotFound { .. })
    ));
    let stats = ctx.join();
    assert_eq!(stats.errors_surfaced, 1);
    assert!(!consumer.has_active_subscription());
}
