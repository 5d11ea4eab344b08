//! Transport - the publish/subscribe contract the pull engine runs on.
//!
//! The engine never owns a connection. It borrows a shared `Arc<dyn Transport>`
//! and uses four primitives:
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                    PullConsumer / pull loops                  │
//! └──────────────────────────────────────────────────────────────┘
//!     │ request()        │ publish()        │ subscribe()     │ watch_connection()
//!     ▼                  ▼                  ▼                 ▼
//!  consumer info     pull requests,     reply inbox       disconnect /
//!  (describe)        acks               (frames)          reconnect events
//! ```
//!
//! `InMemoryServer` implements the contract in-process, together with the
//! stream-storage side of the protocol, for tests and single-process use.

mod in_memory;

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

pub use crate::error::TransportError;
pub use in_memory::{InMemoryServer, StreamConfig};

/// Identifier returned by `subscribe` and `watch_connection`.
pub type SubscriptionId = u64;

/// Callback invoked for every message delivered to a subscription.
///
/// Handlers run on the transport's delivery thread and must not block or
/// call back into the transport.
pub type MessageHandler = Arc<dyn Fn(TransportMessage) + Send + Sync>;

/// Callback invoked on connection state changes.
pub type ConnectionHandler = Arc<dyn Fn(ConnectionEvent) + Send + Sync>;

/// Prefix of the stream-storage API subjects.
pub const API_PREFIX: &str = "$JS.API";

/// Prefix of the per-message acknowledgement subjects.
pub const ACK_PREFIX: &str = "$JS.ACK";

/// Protocol status carried by control frames.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Status {
    pub code: u16,
    pub description: String,
}

impl Status {
    pub const IDLE_HEARTBEAT: u16 = 100;
    pub const BAD_REQUEST: u16 = 400;
    pub const NO_MESSAGES: u16 = 404;
    pub const REQUEST_TIMEOUT: u16 = 408;
    pub const CONFLICT: u16 = 409;
    pub const NO_RESPONDERS: u16 = 503;

    pub fn new(code: u16, description: impl Into<String>) -> Self {
        Self {
            code,
            description: description.into(),
        }
    }
}

/// A message as it travels over the transport: either a data message or a
/// status frame (`status` set, empty payload).
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct TransportMessage {
    pub subject: String,
    pub reply: Option<String>,
    pub headers: Vec<(String, String)>,
    pub status: Option<Status>,
    pub payload: Vec<u8>,
}

impl TransportMessage {
    pub fn new(subject: impl Into<String>, payload: Vec<u8>) -> Self {
        Self {
            subject: subject.into(),
            payload,
            ..Default::default()
        }
    }

    /// Build a status frame addressed to `subject`.
    pub fn status(subject: impl Into<String>, status: Status) -> Self {
        Self {
            subject: subject.into(),
            status: Some(status),
            ..Default::default()
        }
    }

    pub fn with_reply(mut self, reply: impl Into<String>) -> Self {
        self.reply = Some(reply.into());
        self
    }

    pub fn with_header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((key.into(), value.into()));
        self
    }

    pub fn is_status(&self) -> bool {
        self.status.is_some()
    }

    /// Size of the message on the wire, as counted against a pull request's
    /// byte budget.
    pub fn size(&self) -> usize {
        let headers: usize = self
            .headers
            .iter()
            .map(|(k, v)| k.len() + v.len() + 4)
            .sum();
        self.subject.len()
            + self.reply.as_ref().map_or(0, String::len)
            + headers
            + self.payload.len()
    }
}

/// Connection state changes reported by `watch_connection`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConnectionEvent {
    Disconnected,
    Reconnected,
}

/// Request/response and push-subscription primitives used by the pull engine.
///
/// Implementations are shared read-only by every component and outlive any
/// single pull request.
pub trait Transport: Send + Sync {
    /// Fire-and-forget send.
    fn publish(
        &self,
        subject: &str,
        reply: Option<&str>,
        payload: &[u8],
    ) -> Result<(), TransportError>;

    /// Send a request and wait for a single reply.
    fn request(
        &self,
        subject: &str,
        payload: &[u8],
        timeout: Duration,
    ) -> Result<TransportMessage, TransportError>;

    /// Register a handler for messages published on `subject` (wildcards allowed).
    fn subscribe(
        &self,
        subject: &str,
        handler: MessageHandler,
    ) -> Result<SubscriptionId, TransportError>;

    /// Remove a subscription or connection watcher. Unknown ids are ignored.
    fn unsubscribe(&self, id: SubscriptionId) -> Result<(), TransportError>;

    /// Register a handler for connection state changes.
    fn watch_connection(&self, handler: ConnectionHandler)
        -> Result<SubscriptionId, TransportError>;

    /// A unique reply subject.
    fn new_inbox(&self) -> String {
        format!("_INBOX.{}.{}", std::process::id(), next_id())
    }
}

/// Process-wide monotonically increasing id.
pub(crate) fn next_id() -> u64 {
    static NEXT: AtomicU64 = AtomicU64::new(1);
    NEXT.fetch_add(1, Ordering::Relaxed)
}

/// Subject of the describe call for a consumer.
pub fn consumer_info_subject(stream: &str, consumer: &str) -> String {
    format!("{}.CONSUMER.INFO.{}.{}", API_PREFIX, stream, consumer)
}

/// Subject pull requests for a consumer are published to.
pub fn pull_request_subject(stream: &str, consumer: &str) -> String {
    format!("{}.CONSUMER.MSG.NEXT.{}.{}", API_PREFIX, stream, consumer)
}

/// Match a subject against a pattern with `*` (one token) and `>` (the rest)
/// wildcards.
pub fn subject_matches(pattern: &str, subject: &str) -> bool {
    let mut pattern_tokens = pattern.split('.');
    let mut subject_tokens = subject.split('.');

    loop {
        match (pattern_tokens.next(), subject_tokens.next()) {
            (Some(">"), Some(_)) => return true,
            (Some("*"), Some(_)) => {}
            (Some(p), Some(s)) if p == s => {}
            (None, None) => return true,
            _ => return false,
        }
    }
}

/// Reject empty subjects and subjects with empty tokens.
pub(crate) fn validate_subject(subject: &str) -> Result<(), TransportError> {
    if subject.is_empty() || subject.split('.').any(str::is_empty) {
        return Err(TransportError::InvalidSubject(subject.to_string()));
    }
    Ok(())
}
