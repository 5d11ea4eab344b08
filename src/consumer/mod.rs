//! Consumer handle: a durable consumer bound to a stream.
//!
//! `PullConsumer` is the entry point for all pulling:
//!
//! ```text
//! PullConsumer ──try_acquire──► SubscriptionGuard
//!      │
//!      ├── fetch / fetch_no_wait ──► one request ──► MessageBatch
//!      ├── messages ──────────────► pull loop ────► MessagesIter
//!      └── consume ───────────────► pull loop ────► handler(Result<Msg, _>)
//! ```
//!
//! Handles are cheap to clone. Clones share the cached info and the
//! subscription flag, so at most one pull runs per consumer across all clones.

mod guard;
mod info;

use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;

use tracing::debug;

use crate::error::ConsumerError;
use crate::message::Msg;
use crate::pull::{
    self, ConsumeContext, ConsumeOptions, FetchOptions, MessageBatch, MessagesIter,
    MessagesOptions,
};
use crate::transport::{consumer_info_subject, Transport};

pub(crate) use guard::{SubscriptionFlag, SubscriptionGuard};
pub use info::{
    AckPolicy, ApiError, ApiResponse, ConsumerConfig, ConsumerInfo, DeliverPolicy, SequenceInfo,
};

/// Default bound on the describe call.
pub const DEFAULT_API_TIMEOUT: Duration = Duration::from_secs(5);

/// Handle to a durable pull consumer.
#[derive(Clone)]
pub struct PullConsumer {
    transport: Arc<dyn Transport>,
    stream: String,
    name: String,
    cached: Arc<RwLock<ConsumerInfo>>,
    subscription: SubscriptionFlag,
    api_timeout: Duration,
}

impl PullConsumer {
    /// Look up `consumer` on `stream` and bind a handle to it.
    pub fn bind(
        transport: Arc<dyn Transport>,
        stream: &str,
        consumer: &str,
    ) -> Result<Self, ConsumerError> {
        let info = describe(transport.as_ref(), stream, consumer, DEFAULT_API_TIMEOUT)?;
        Ok(Self::from_info(transport, info))
    }

    /// Build a handle from an already known snapshot, without a network call.
    pub fn from_info(transport: Arc<dyn Transport>, info: ConsumerInfo) -> Self {
        Self {
            transport,
            stream: info.stream_name.clone(),
            name: info.name.clone(),
            cached: Arc::new(RwLock::new(info)),
            subscription: SubscriptionFlag::default(),
            api_timeout: DEFAULT_API_TIMEOUT,
        }
    }

    pub fn with_api_timeout(mut self, timeout: Duration) -> Self {
        self.api_timeout = timeout;
        self
    }

    pub fn stream(&self) -> &str {
        &self.stream
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Fetch fresh consumer state and replace the cached snapshot.
    pub fn info(&self) -> Result<ConsumerInfo, ConsumerError> {
        let info = describe(
            self.transport.as_ref(),
            &self.stream,
            &self.name,
            self.api_timeout,
        )?;
        *self.cached.write().unwrap_or_else(PoisonError::into_inner) = info.clone();
        Ok(info)
    }

    /// Last known snapshot; no network call.
    pub fn cached_info(&self) -> ConsumerInfo {
        self.cached
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Whether a fetch or continuous pull currently owns this consumer.
    pub fn has_active_subscription(&self) -> bool {
        self.subscription.is_active()
    }

    /// Request up to `batch` messages, waiting up to the expiry for them.
    ///
    /// The batch ends when `batch` messages arrived, the server has nothing
    /// more, the expiry elapses or the caller's deadline passes. An empty
    /// batch is not an error.
    pub fn fetch(&self, batch: usize, options: FetchOptions) -> Result<MessageBatch, ConsumerError> {
        pull::fetch::start(self, batch, &options, false)
    }

    /// Request up to `batch` of the messages buffered right now, without
    /// waiting for new ones.
    pub fn fetch_no_wait(
        &self,
        batch: usize,
        options: FetchOptions,
    ) -> Result<MessageBatch, ConsumerError> {
        pull::fetch::start(self, batch, &options, true)
    }

    /// Pull continuously, calling `handler` on a dedicated thread for every
    /// message and every surfaced error.
    pub fn consume<F>(&self, handler: F, options: ConsumeOptions) -> Result<ConsumeContext, ConsumerError>
    where
        F: FnMut(Result<Msg, ConsumerError>) + Send + 'static,
    {
        pull::consume::start(self, handler, &options)
    }

    /// Pull continuously, exposing messages through a blocking iterator.
    pub fn messages(&self, options: MessagesOptions) -> Result<MessagesIter, ConsumerError> {
        pull::messages::start(self, &options)
    }

    pub(crate) fn transport(&self) -> &Arc<dyn Transport> {
        &self.transport
    }

    /// Claim the consumer for one pull.
    pub(crate) fn acquire(&self) -> Result<SubscriptionGuard, ConsumerError> {
        self.subscription
            .try_acquire()
            .ok_or(ConsumerError::ConsumerHasActiveSubscription)
    }
}

impl std::fmt::Debug for PullConsumer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PullConsumer")
            .field("stream", &self.stream)
            .field("name", &self.name)
            .field("active", &self.subscription.is_active())
            .finish()
    }
}

fn describe(
    transport: &dyn Transport,
    stream: &str,
    consumer: &str,
    timeout: Duration,
) -> Result<ConsumerInfo, ConsumerError> {
    let subject = consumer_info_subject(stream, consumer);
    let reply = transport.request(&subject, b"", timeout)?;
    match serde_json::from_slice::<ApiResponse<ConsumerInfo>>(&reply.payload)? {
        ApiResponse::Ok(info) => {
            debug!(stream, consumer, "consumer info refreshed");
            Ok(info)
        }
        ApiResponse::Err { error } if error.is_not_found() => Err(ConsumerError::ConsumerNotFound {
            stream: stream.to_string(),
            consumer: consumer.to_string(),
        }),
        ApiResponse::Err { error } => Err(ConsumerError::Api {
            code: error.code,
            description: error.description,
        }),
    }
}
