//! One-shot fetch and fetch_no_wait.

use std::thread;
use std::time::{Duration, Instant};

use sourced_pull::{ConsumerError, FetchOptions, Msg};

use crate::support::{publish, publish_n, setup, RequestCounter, CONSUMER, STREAM, SUBJECT};

fn short() -> FetchOptions {
    FetchOptions::default().with_expiry(Duration::from_millis(200))
}

fn collect(batch: impl Iterator<Item = Result<Msg, ConsumerError>>) -> Vec<String> {
    batch
        .map(|msg| {
            let msg = msg.unwrap();
            msg.ack().unwrap();
            msg.payload_str().unwrap().to_string()
        })
        .collect()
}

/// Wire size of a first delivery on `FOO.123` with a two-byte payload.
fn first_delivery_size() -> usize {
    // $JS.ACK.foo.cons.<delivered>.<sseq>.<cseq>.<19-digit ns timestamp>.<pending>
    let reply = "$JS.ACK.foo.cons.1.1.1.".len() + 19 + ".0".len();
    SUBJECT.len() + reply + 2
}

// ============================================================================
// Fetch
// ============================================================================

#[test]
fn fetch_all_published_messages() {
    let (server, consumer) = setup();
    let expected = publish_n(&server, 5);
    let requests = RequestCounter::attach(&server);

    let batch = consumer.fetch(5, FetchOptions::default()).unwrap();
    assert_eq!(collect(batch), expected);
    assert_eq!(requests.get(), 1);
}

#[test]
fn fetch_returns_batch_size_in_publish_order() {
    let (server, consumer) = setup();
    publish_n(&server, 5);

    let batch = consumer.fetch(2, FetchOptions::default()).unwrap();
    assert_eq!(collect(batch), vec!["m1", "m2"]);
    let batch = consumer.fetch(2, FetchOptions::default()).unwrap();
    assert_eq!(collect(batch), vec!["m3", "m4"]);
}

#[test]
fn fetch_one_by_one() {
    let (server, consumer) = setup();
    let expected = publish_n(&server, 5);

    let mut received = Vec::new();
    for _ in 0..5 {
        let batch = consumer.fetch(1, FetchOptions::default()).unwrap();
        received.extend(collect(batch));
    }
    assert_eq!(received, expected);
}

#[test]
fn fetch_waits_for_new_messages() {
    let (server, consumer) = setup();
    let publisher = server.clone();
    let handle = thread::spawn(move || {
        thread::sleep(Duration::from_millis(50));
        publish(&publisher, &["m1", "m2"]);
    });

    let batch = consumer.fetch(2, FetchOptions::default()).unwrap();
    assert_eq!(collect(batch), vec!["m1", "m2"]);
    handle.join().unwrap();
}

#[test]
fn fetch_timeout_is_an_empty_batch() {
    let (_server, consumer) = setup();
    let started = Instant::now();

    let batch = consumer.fetch(5, short()).unwrap();
    assert!(collect(batch).is_empty());
    assert!(started.elapsed() >= Duration::from_millis(150));
    assert!(!consumer.has_active_subscription());
}

#[test]
fn fetch_timeout_with_partial_batch() {
    let (server, consumer) = setup();
    publish(&server, &["m1", "m2"]);

    let batch = consumer.fetch(5, short()).unwrap();
    assert_eq!(collect(batch), vec!["m1", "m2"]);
}

#[test]
fn fetch_invalid_timeout() {
    let (_server, consumer) = setup();
    let err = consumer
        .fetch(5, FetchOptions::default().with_expiry(Duration::ZERO))
        .unwrap_err();
    assert!(matches!(err, ConsumerError::InvalidOption(_)));
    assert!(!consumer.has_active_subscription());
}

#[test]
fn fetch_invalid_batch() {
    let (_server, consumer) = setup();
    assert!(matches!(
        consumer.fetch(0, FetchOptions::default()),
        Err(ConsumerError::InvalidOption(_))
    ));
}

#[test]
fn fetch_caller_deadline_returns_partial_results() {
    let (server, consumer) = setup();
    publish(&server, &["m1", "m2"]);
    let started = Instant::now();

    let options = FetchOptions::default()
        .with_expiry(Duration::from_secs(10))
        .with_deadline(Instant::now() + Duration::from_millis(100));
    let batch = consumer.fetch(5, options).unwrap();

    assert_eq!(collect(batch), vec!["m1", "m2"]);
    assert!(started.elapsed() < Duration::from_secs(5));
}

#[test]
fn fetch_max_bytes() {
    let (server, consumer) = setup();
    publish(&server, &["m1", "m2", "m3"]);
    let size = first_delivery_size();

    let options = FetchOptions::default().with_max_bytes(size * 2 + size / 2);
    let batch = consumer.fetch(10, options).unwrap();
    assert_eq!(collect(batch), vec!["m1", "m2"]);
}

#[test]
fn fetch_rejected_while_fetching() {
    let (_server, consumer) = setup();
    let pending = consumer.fetch(5, short()).unwrap();

    assert_eq!(
        consumer.fetch(1, FetchOptions::default()).unwrap_err(),
        ConsumerError::ConsumerHasActiveSubscription
    );
    assert!(collect(pending).is_empty());
    assert!(consumer.fetch(1, short()).is_ok());
}

#[test]
fn fetch_rejected_while_consuming() {
    let (_server, consumer) = setup();
    let iter = consumer.messages(Default::default()).unwrap();

    assert_eq!(
        consumer.fetch(5, FetchOptions::default()).unwrap_err(),
        ConsumerError::ConsumerHasActiveSubscription
    );
    assert_eq!(
        consumer.fetch_no_wait(5, FetchOptions::default()).unwrap_err(),
        ConsumerError::ConsumerHasActiveSubscription
    );

    iter.stop();
    assert!(consumer.fetch_no_wait(5, FetchOptions::default()).is_ok());
}

#[test]
fn fetch_deleted_consumer() {
    let (server, consumer) = setup();
    server.delete_consumer(STREAM, CONSUMER).unwrap();

    let items: Vec<_> = consumer.fetch(5, short()).unwrap().collect();
    assert_eq!(
        items.into_iter().map(|item| item.unwrap_err()).collect::<Vec<_>>(),
        vec![ConsumerError::ConsumerNotFound {
            stream: STREAM.into(),
            consumer: CONSUMER.into()
        }]
    );
}

// ============================================================================
// Fetch no-wait
// ============================================================================

#[test]
fn fetch_no_wait_with_no_messages() {
    let (server, consumer) = setup();
    let started = Instant::now();

    let batch = consumer.fetch_no_wait(5, FetchOptions::default()).unwrap();
    publish(&server, &["m1"]);

    assert!(collect(batch).is_empty());
    assert!(started.elapsed() < Duration::from_secs(1));
}

#[test]
fn fetch_no_wait_partial_batch() {
    let (server, consumer) = setup();
    publish(&server, &["m1", "m2", "m3"]);

    let batch = consumer.fetch_no_wait(5, FetchOptions::default()).unwrap();
    assert_eq!(collect(batch), vec!["m1", "m2", "m3"]);
}

#[test]
fn fetch_no_wait_full_batch() {
    let (server, consumer) = setup();
    publish_n(&server, 5);

    let batch = consumer.fetch_no_wait(3, FetchOptions::default()).unwrap();
    assert_eq!(collect(batch), vec!["m1", "m2", "m3"]);
    let batch = consumer.fetch_no_wait(3, FetchOptions::default()).unwrap();
    assert_eq!(collect(batch), vec!["m4", "m5"]);
}
