//! Pull-based consumption of durable, subject-addressed message streams.
//!
//! A `PullConsumer` is bound to a durable consumer on a stream and pulls
//! messages in one of three ways:
//!
//! - `fetch` / `fetch_no_wait`: one bounded request, one batch
//! - `messages`: continuous pulling behind a blocking iterator
//! - `consume`: continuous pulling into a callback
//!
//! Continuous pulls replenish requests as their allowance runs out, watch
//! idle heartbeats to detect dead delivery paths and heal themselves after
//! connection loss. At most one pull runs per consumer at a time.
//!
//! ```
//! use std::sync::Arc;
//! use sourced_pull::consumer::{ConsumerConfig, PullConsumer};
//! use sourced_pull::pull::FetchOptions;
//! use sourced_pull::transport::{InMemoryServer, StreamConfig, Transport};
//!
//! let server = InMemoryServer::new();
//! server.add_stream(StreamConfig::new("orders").with_subjects(&["ORDERS.*"])).unwrap();
//! server.add_consumer("orders", ConsumerConfig::durable("billing")).unwrap();
//! server.publish("ORDERS.new", None, b"order-1").unwrap();
//!
//! let consumer = PullConsumer::bind(Arc::new(server), "orders", "billing").unwrap();
//! for msg in consumer.fetch(10, FetchOptions::default().with_expiry(std::time::Duration::from_millis(100))).unwrap() {
//!     let msg = msg.unwrap();
//!     assert_eq!(msg.data(), b"order-1");
//!     msg.ack().unwrap();
//! }
//! ```

mod nanos;

pub mod consumer;
pub mod error;
pub mod message;
pub mod pull;
pub mod transport;

pub use consumer::{ConsumerConfig, ConsumerInfo, PullConsumer};
pub use error::{ConsumerError, TransportError};
pub use message::{Msg, MsgMetadata};
pub use pull::{
    ConsumeContext, ConsumeOptions, FetchOptions, MessageBatch, MessagesIter, MessagesOptions,
    PullStats, RetryPolicy,
};
pub use transport::{InMemoryServer, Transport};
