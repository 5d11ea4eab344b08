//! One-shot fetch: a single pull request and the batch it produces.
//!
//! Frames from the reply inbox are forwarded by the transport handler into an
//! unbounded channel; a collector thread turns them into the caller-facing
//! batch channel, enforcing the batch size, byte ceiling, expiry and the
//! caller's deadline. The end of the batch is the closing of that channel.

use std::cmp;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, SyncSender};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use tracing::{debug, trace};

use super::allowance::Allowance;
use super::classify::{classify, StatusOutcome};
use super::options::FetchOptions;
use super::request::PullRequest;
use super::MAX_BUFFERED;
use crate::consumer::{PullConsumer, SubscriptionGuard};
use crate::error::ConsumerError;
use crate::message::Msg;
use crate::transport::{pull_request_subject, SubscriptionId, Transport, TransportMessage};

/// Messages of one fetch, in delivery order.
///
/// Iterates `Ok(msg)` for every message and `Err(_)` for errors surfaced
/// during the request; iteration ends when the batch is complete. Dropping
/// the batch abandons the request and frees the consumer.
pub struct MessageBatch {
    rx: Receiver<Result<Msg, ConsumerError>>,
    request: Arc<FetchRequest>,
}

impl MessageBatch {
    /// Wait up to `timeout` for the next item. `Ok(None)` means the batch is
    /// complete; `Err(Timeout)` that nothing arrived in time.
    pub fn next_timeout(
        &mut self,
        timeout: Duration,
    ) -> Result<Option<Result<Msg, ConsumerError>>, RecvTimeoutError> {
        match self.rx.recv_timeout(timeout) {
            Ok(item) => Ok(Some(item)),
            Err(RecvTimeoutError::Disconnected) => Ok(None),
            Err(RecvTimeoutError::Timeout) => Err(RecvTimeoutError::Timeout),
        }
    }

    /// Whether the request has finished; remaining items may still be buffered.
    pub fn is_done(&self) -> bool {
        self.request.closed.load(Ordering::Acquire)
    }
}

impl Iterator for MessageBatch {
    type Item = Result<Msg, ConsumerError>;

    fn next(&mut self) -> Option<Self::Item> {
        self.rx.recv().ok()
    }
}

impl Drop for MessageBatch {
    fn drop(&mut self) {
        self.request.close();
    }
}

impl std::fmt::Debug for MessageBatch {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MessageBatch")
            .field("done", &self.is_done())
            .finish_non_exhaustive()
    }
}

/// The outstanding request: its inbox subscription and the consumer claim.
struct FetchRequest {
    transport: Arc<dyn Transport>,
    sid: SubscriptionId,
    guard: SubscriptionGuard,
    closed: AtomicBool,
}

impl FetchRequest {
    /// Stop listening and free the consumer. Idempotent.
    fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        let _ = self.transport.unsubscribe(self.sid);
        self.guard.release();
    }
}

pub(crate) fn start(
    consumer: &PullConsumer,
    batch: usize,
    options: &FetchOptions,
    no_wait: bool,
) -> Result<MessageBatch, ConsumerError> {
    let request = options.to_request(batch, no_wait)?;
    let payload = request.to_json()?;
    let guard = consumer.acquire()?;

    let transport = consumer.transport().clone();
    let inbox = transport.new_inbox();
    let (frames_tx, frames_rx) = mpsc::channel();
    let frames_tx = Mutex::new(frames_tx);
    let sid = transport.subscribe(
        &inbox,
        Arc::new(move |frame| {
            if let Ok(tx) = frames_tx.lock() {
                let _ = tx.send(frame);
            }
        }),
    )?;
    let pending = Arc::new(FetchRequest {
        transport: transport.clone(),
        sid,
        guard,
        closed: AtomicBool::new(false),
    });

    let subject = pull_request_subject(consumer.stream(), consumer.name());
    if let Err(err) = transport.publish(&subject, Some(&inbox), &payload) {
        pending.close();
        return Err(err.into());
    }
    debug!(
        stream = consumer.stream(),
        consumer = consumer.name(),
        batch,
        no_wait,
        "fetch request sent"
    );

    let expires_at = Instant::now() + request.expires;
    let deadline = options
        .deadline
        .map_or(expires_at, |deadline| cmp::min(deadline, expires_at));
    let (tx, rx) = mpsc::sync_channel(cmp::min(batch, MAX_BUFFERED) + 1);
    let collector = Collector {
        request,
        deadline,
        stream: consumer.stream().to_string(),
        consumer: consumer.name().to_string(),
        frames: frames_rx,
        tx,
        pending: pending.clone(),
    };
    thread::spawn(move || collector.run());

    Ok(MessageBatch {
        rx,
        request: pending,
    })
}

struct Collector {
    request: PullRequest,
    deadline: Instant,
    stream: String,
    consumer: String,
    frames: Receiver<TransportMessage>,
    tx: SyncSender<Result<Msg, ConsumerError>>,
    pending: Arc<FetchRequest>,
}

impl Collector {
    fn run(self) {
        let mut allowance = Allowance::for_request(&self.request);
        let mut delivered = 0usize;

        let last = loop {
            let timeout = self.deadline.saturating_duration_since(Instant::now());
            if timeout.is_zero() {
                trace!(stream = %self.stream, consumer = %self.consumer, "fetch deadline reached");
                break None;
            }
            let frame = match self.frames.recv_timeout(timeout) {
                Ok(frame) => frame,
                Err(_) => break None,
            };

            let Some(status) = frame.status.as_ref() else {
                allowance.consume(frame.size());
                let msg = Msg::new(frame, self.pending.transport.clone());
                delivered += 1;
                if allowance.is_exhausted() {
                    break Some(Ok(msg));
                }
                if self.tx.send(Ok(msg)).is_err() {
                    break None;
                }
                continue;
            };

            match classify(status, &self.stream, &self.consumer) {
                StatusOutcome::Heartbeat => {}
                StatusOutcome::EndOfBatch
                | StatusOutcome::RequestExpired
                | StatusOutcome::BatchCompleted => break None,
                StatusOutcome::MaxBytesExceeded if delivered == 0 => {
                    break Some(Err(ConsumerError::MessageTooLarge {
                        max_bytes: self.request.max_bytes,
                    }))
                }
                StatusOutcome::MaxBytesExceeded => break None,
                StatusOutcome::Terminal(err) | StatusOutcome::Transient(err) => break Some(Err(err)),
                StatusOutcome::Unrecognized(err) => {
                    if self.tx.send(Err(err)).is_err() {
                        break None;
                    }
                }
            }
        };

        // free the consumer before the caller can observe the end of the batch
        self.pending.close();
        debug!(
            stream = %self.stream,
            consumer = %self.consumer,
            delivered,
            "fetch complete"
        );
        if let Some(item) = last {
            let _ = self.tx.send(item);
        }
    }
}
