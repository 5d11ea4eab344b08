//! Continuous pulling through the `messages` iterator.

use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use sourced_pull::{ConsumerError, MessagesIter, MessagesOptions, Msg, Transport};

use crate::support::{
    publish, publish_n, setup, wait_until, RequestCounter, CONSUMER, STREAM, SUBJECT,
};

fn next_payload(iter: &MessagesIter) -> String {
    let msg: Msg = iter.next().unwrap();
    msg.ack().unwrap();
    msg.payload_str().unwrap().to_string()
}

fn take(iter: &MessagesIter, count: usize) -> Vec<String> {
    (0..count).map(|_| next_payload(iter)).collect()
}

fn delivery_size() -> usize {
    let reply = "$JS.ACK.foo.cons.1.1.1.".len() + 19 + ".0".len();
    SUBJECT.len() + reply + 2
}

fn heartbeat_options() -> MessagesOptions {
    MessagesOptions::default()
        .with_expiry(Duration::from_secs(1))
        .with_idle_heartbeat(Duration::from_millis(100))
}

// ============================================================================
// Delivery and pacing
// ============================================================================

#[test]
fn messages_with_default_options() {
    let (server, consumer) = setup();
    let expected = publish_n(&server, 5);

    let iter = consumer.messages(MessagesOptions::default()).unwrap();
    assert_eq!(take(&iter, 5), expected);
    assert_eq!(iter.stats().messages_delivered, 5);
    iter.stop();
}

#[test]
fn messages_published_after_start() {
    let (server, consumer) = setup();
    let iter = consumer.messages(MessagesOptions::default()).unwrap();

    let publisher = server.clone();
    let handle = thread::spawn(move || publish_n(&publisher, 3));
    assert_eq!(take(&iter, 3), vec!["m1", "m2", "m3"]);
    handle.join().unwrap();
    iter.stop();
}

#[test]
fn batch_size_paces_pull_requests() {
    let (server, consumer) = setup();
    let requests = RequestCounter::attach(&server);
    let expected = publish_n(&server, 5);

    let iter = consumer
        .messages(MessagesOptions::default().with_batch_size(2))
        .unwrap();
    assert_eq!(take(&iter, 5), expected);

    // m5 leaves the third request open
    thread::sleep(Duration::from_millis(50));
    assert_eq!(requests.get(), 3);
    assert_eq!(iter.stats().requests_sent, 3);
    iter.stop();
}

#[test]
fn max_bytes_paces_pull_requests() {
    let (server, consumer) = setup();
    let requests = RequestCounter::attach(&server);
    let expected = publish_n(&server, 5);
    let size = delivery_size();

    let iter = consumer
        .messages(MessagesOptions::default().with_max_bytes(size * 2 + size / 2))
        .unwrap();
    assert_eq!(take(&iter, 5), expected);

    thread::sleep(Duration::from_millis(50));
    assert_eq!(requests.get(), 3);
    iter.stop();
}

#[test]
fn expired_requests_are_replaced() {
    let (server, consumer) = setup();
    let requests = RequestCounter::attach(&server);
    let iter = consumer
        .messages(
            MessagesOptions::default()
                .with_expiry(Duration::from_millis(200))
                .with_idle_heartbeat(Duration::from_millis(50)),
        )
        .unwrap();

    assert!(wait_until(Duration::from_secs(2), || requests.get() >= 2));
    publish(&server, &["m1"]);
    assert_eq!(next_payload(&iter), "m1");
    iter.stop();
}

// ============================================================================
// Messages larger than the byte ceiling
// ============================================================================

#[test]
fn message_larger_than_max_bytes_is_surfaced() {
    let (server, consumer) = setup();
    let requests = RequestCounter::attach(&server);
    server.publish(SUBJECT, None, &[b'x'; 200]).unwrap();

    let iter = consumer
        .messages(MessagesOptions::default().with_max_bytes(50))
        .unwrap();
    assert_eq!(
        iter.next().unwrap_err(),
        ConsumerError::MessageTooLarge { max_bytes: 50 }
    );

    thread::sleep(Duration::from_millis(200));
    assert_eq!(requests.get(), 1);
    assert_eq!(iter.stats().requests_sent, 1);
    assert!(!iter.is_closed());
    iter.stop();
}

#[test]
fn oversized_message_is_retried_after_a_heartbeat_interval() {
    let (server, consumer) = setup();
    server.publish(SUBJECT, None, &[b'x'; 200]).unwrap();
    let iter = consumer
        .messages(heartbeat_options().with_max_bytes(50))
        .unwrap();

    let started = Instant::now();
    for _ in 0..2 {
        assert_eq!(
            iter.next().unwrap_err(),
            ConsumerError::MessageTooLarge { max_bytes: 50 }
        );
    }
    assert!(started.elapsed() >= Duration::from_millis(100));
    assert_eq!(iter.stats().requests_sent, 2);
    iter.stop();
}

// ============================================================================
// Subscription guard and stop
// ============================================================================

#[test]
fn second_subscription_is_rejected() {
    let (_server, consumer) = setup();
    let iter = consumer.messages(MessagesOptions::default()).unwrap();

    assert_eq!(
        consumer.messages(MessagesOptions::default()).unwrap_err(),
        ConsumerError::ConsumerHasActiveSubscription
    );
    assert_eq!(
        consumer
            .consume(|_| {}, Default::default())
            .unwrap_err(),
        ConsumerError::ConsumerHasActiveSubscription
    );
    iter.stop();
}

#[test]
fn stop_closes_the_iterator_and_allows_restart() {
    let (server, consumer) = setup();
    publish(&server, &["m1", "m2"]);

    let iter = consumer.messages(MessagesOptions::default()).unwrap();
    assert_eq!(next_payload(&iter), "m1");
    iter.stop();
    iter.stop();

    assert_eq!(iter.next().unwrap_err(), ConsumerError::MsgIteratorClosed);
    assert_eq!(iter.next().unwrap_err(), ConsumerError::MsgIteratorClosed);
    assert!(!consumer.has_active_subscription());

    publish(&server, &["m3"]);
    let again = consumer.messages(MessagesOptions::default()).unwrap();
    assert_eq!(next_payload(&again), "m3");
    again.stop();
}

#[test]
fn stop_from_another_thread_unblocks_next() {
    let (_server, consumer) = setup();
    let iter = Arc::new(consumer.messages(MessagesOptions::default()).unwrap());

    let stopper = iter.clone();
    let handle = thread::spawn(move || {
        thread::sleep(Duration::from_millis(50));
        stopper.stop();
    });

    assert_eq!(iter.next().unwrap_err(), ConsumerError::MsgIteratorClosed);
    handle.join().unwrap();
}

#[test]
fn dropping_the_iterator_frees_the_consumer() {
    let (_server, consumer) = setup();
    let iter = consumer.messages(MessagesOptions::default()).unwrap();
    drop(iter);
    assert!(!consumer.has_active_subscription());
}

#[test]
fn invalid_options_are_rejected() {
    let (_server, consumer) = setup();
    let invalid = [
        MessagesOptions::default().with_batch_size(0),
        MessagesOptions::default()
            .with_expiry(Duration::from_millis(100))
            .with_idle_heartbeat(Duration::from_millis(200)),
    ];
    for options in invalid {
        assert!(matches!(
            consumer.messages(options),
            Err(ConsumerError::InvalidOption(_))
        ));
    }
    assert!(!consumer.has_active_subscription());
}

// ============================================================================
// Liveness and recovery
// ============================================================================

#[test]
fn heartbeats_keep_an_idle_subscription_alive() {
    let (_server, consumer) = setup();
    let iter = consumer.messages(heartbeat_options()).unwrap();

    assert!(iter.next_timeout(Duration::from_millis(400)).unwrap().is_none());
    assert_eq!(iter.stats().heartbeats_missed, 0);
    iter.stop();
}

#[test]
fn server_shutdown_surfaces_one_missed_heartbeat() {
    let (server, consumer) = setup();
    let iter = consumer.messages(heartbeat_options()).unwrap();
    let started = Instant::now();
    server.shutdown();

    assert_eq!(iter.next().unwrap_err(), ConsumerError::NoHeartbeat);
    assert!(started.elapsed() < Duration::from_secs(1));
    assert!(iter.next_timeout(Duration::from_millis(500)).unwrap().is_none());
    assert_eq!(iter.stats().heartbeats_missed, 1);
    iter.stop();
}

#[test]
fn subscription_recovers_after_shutdown() {
    let (server, consumer) = setup();
    let iter = consumer.messages(heartbeat_options()).unwrap();
    server.shutdown();
    assert_eq!(iter.next().unwrap_err(), ConsumerError::NoHeartbeat);

    server.start();
    publish(&server, &["m1"]);
    assert_eq!(next_payload(&iter), "m1");
    iter.stop();
}

#[test]
fn subscription_survives_server_restart() {
    let (server, consumer) = setup();
    publish(&server, &["m1", "m2"]);
    let iter = consumer.messages(heartbeat_options()).unwrap();
    assert_eq!(take(&iter, 2), vec!["m1", "m2"]);

    server.restart();
    publish(&server, &["m3", "m4"]);
    assert_eq!(take(&iter, 2), vec!["m3", "m4"]);
    iter.stop();
}

#[test]
fn deleted_consumer_ends_the_subscription() {
    let (server, consumer) = setup();
    let iter = consumer.messages(MessagesOptions::default()).unwrap();
    server.delete_consumer(STREAM, CONSUMER).unwrap();

    assert_eq!(
        iter.next().unwrap_err(),
        ConsumerError::ConsumerNotFound {
            stream: STREAM.into(),
            consumer: CONSUMER.into()
        }
    );
    assert_eq!(iter.next().unwrap_err(), ConsumerError::MsgIteratorClosed);
    assert!(!consumer.has_active_subscription());
}
