//! Consumer info and cached info.

use std::sync::Arc;

use sourced_pull::consumer::{ConsumerConfig, PullConsumer};
use sourced_pull::ConsumerError;

use crate::support::{publish, setup, CONSUMER, STREAM};

#[test]
fn info_returns_fresh_state() {
    let (server, consumer) = setup();
    publish(&server, &["m1", "m2"]);

    let info = consumer.info().unwrap();
    assert_eq!(info.stream_name, STREAM);
    assert_eq!(info.name, CONSUMER);
    assert_eq!(info.num_pending, 2);
    assert_eq!(consumer.cached_info().num_pending, 2);
}

#[test]
fn cached_info_does_not_refresh() {
    let (server, consumer) = setup();
    publish(&server, &["m1"]);

    assert_eq!(consumer.cached_info().num_pending, 0);
    assert_eq!(consumer.cached_info().name, CONSUMER);
}

#[test]
fn info_after_delete_is_consumer_not_found() {
    let (server, consumer) = setup();
    server.delete_consumer(STREAM, CONSUMER).unwrap();

    assert_eq!(
        consumer.info().unwrap_err(),
        ConsumerError::ConsumerNotFound {
            stream: STREAM.into(),
            consumer: CONSUMER.into()
        }
    );
    // the stale snapshot survives
    assert_eq!(consumer.cached_info().name, CONSUMER);
}

#[test]
fn cached_info_exposes_generated_name() {
    let server = crate::support::server();
    let info = server.add_consumer(STREAM, ConsumerConfig::default()).unwrap();
    let consumer = PullConsumer::from_info(Arc::new(server), info.clone());

    assert_eq!(consumer.name(), info.name);
    assert_eq!(consumer.cached_info(), info);
    assert!(!consumer.cached_info().name.is_empty());
}

#[test]
fn info_while_pulling() {
    let (_server, consumer) = setup();
    let iter = consumer.messages(Default::default()).unwrap();

    let info = consumer.info().unwrap();
    assert_eq!(info.num_waiting, 1);
    iter.stop();
}
