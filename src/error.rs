//! Error types for pull consumers and the transport they run on.

use thiserror::Error;

/// Errors raised by the transport layer.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    /// The connection to the stream service is down.
    #[error("transport disconnected")]
    Disconnected,
    /// Nobody is listening on the requested subject.
    #[error("no responders available for request on {0}")]
    NoResponders(String),
    /// A request did not receive a reply in time.
    #[error("request timed out")]
    Timeout,
    /// The subject is empty or contains empty tokens.
    #[error("invalid subject: {0:?}")]
    InvalidSubject(String),
}

/// Errors surfaced to pull consumer callers.
///
/// Configuration problems are returned synchronously from the call that
/// introduced them. Runtime delivery errors travel alongside messages as
/// `Err` items of the result channel, iterator, or consume handler.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConsumerError {
    /// Bad option value, rejected before anything is sent.
    #[error("invalid option: {0}")]
    InvalidOption(String),

    /// A fetch or continuous pull is already running on this consumer.
    #[error("consumer has an active subscription")]
    ConsumerHasActiveSubscription,

    /// The consumer (or its stream) no longer exists on the server.
    #[error("consumer not found: {stream} > {consumer}")]
    ConsumerNotFound { stream: String, consumer: String },

    /// `next()` called on a stopped iterator.
    #[error("messages iterator is closed")]
    MsgIteratorClosed,

    /// No frame arrived within the liveness deadline.
    #[error("no heartbeat received")]
    NoHeartbeat,

    /// The stream leader moved while a pull request was outstanding.
    #[error("leadership change")]
    LeadershipChanged,

    /// The server rejected the pull request.
    #[error("bad request: {0}")]
    BadRequest(String),

    /// The next message is larger than the byte ceiling of a whole pull
    /// request, so no request can ever deliver it.
    #[error("next message does not fit within max bytes of {max_bytes}")]
    MessageTooLarge { max_bytes: usize },

    /// A status frame the classifier does not recognize.
    #[error("unexpected status {code}: {description}")]
    UnexpectedStatus { code: u16, description: String },

    /// API error response from the stream service.
    #[error("API error {code}: {description}")]
    Api { code: u16, description: String },

    /// The message was already acknowledged.
    #[error("message already acknowledged")]
    AlreadyAcknowledged,

    /// The message reply subject carries no parsable metadata.
    #[error("invalid message metadata: {0}")]
    InvalidMetadata(String),

    /// A payload or API response could not be decoded.
    #[error("decode failed: {0}")]
    Decode(String),

    #[error(transparent)]
    Transport(#[from] TransportError),
}

impl From<serde_json::Error> for ConsumerError {
    fn from(err: serde_json::Error) -> Self {
        ConsumerError::Decode(err.to_string())
    }
}

impl From<bitcode::Error> for ConsumerError {
    fn from(err: bitcode::Error) -> Self {
        ConsumerError::Decode(err.to_string())
    }
}
